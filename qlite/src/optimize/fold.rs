use std::collections::HashSet;

use log::debug;

use crate::error::Result;
use crate::ir::interp::exec_node;
use crate::ir::{Graph, Op, TensorKind};

/// Evaluate every node whose operands are all constants and turn its outputs
/// into constant leaves. A folded graph output stays an output, now backed by
/// the constant.
pub fn fold_constants(graph: &mut Graph) -> Result<usize> {
    let mut folded = HashSet::new();
    for i in 0..graph.nodes.len() {
        let node = &graph.nodes[i];
        if matches!(node.op, Op::FakeQuantize(_))
            || node.inputs.is_empty()
            || !node.inputs.iter().all(|&t| graph.is_constant(t))
        {
            continue;
        }
        let operands: Vec<_> = node.inputs.iter().filter_map(|&t| graph.constant(t)).collect();
        let values = exec_node(graph, node, &operands)?;
        debug!("folded {} ({}) in `{}`", node.id, node.op.kind(), graph.scope_path(node.scope));
        let outputs = node.outputs.clone();
        for (value, id) in values.into_iter().zip(outputs) {
            let t = graph.tensor_mut(id);
            t.shape = value.shape;
            t.kind = TensorKind::Constant { data: value.data };
        }
        folded.insert(i);
    }
    graph.remove_nodes(&folded);
    Ok(folded.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Activation, ROOT_SCOPE};
    use crate::tensor::{DType, HostTensor};

    #[test]
    fn test_chain_of_constants_folds() {
        let mut g = Graph::default();
        let x = g.add_input("x", vec![1], DType::F32);
        let a = g.add_constant("a", HostTensor::full(vec![1], 2.0));
        let b = g.add_constant("b", HostTensor::full(vec![1], 3.0));
        let k = g.add_tensor("k", vec![1], DType::F32, TensorKind::Intermediate);
        let k2 = g.add_tensor("k2", vec![1], DType::F32, TensorKind::Intermediate);
        let y = g.add_tensor("y", vec![1], DType::F32, TensorKind::Intermediate);
        g.add_node(Op::Add { fused: Activation::None }, vec![a, b], vec![k], ROOT_SCOPE);
        g.add_node(Op::Relu, vec![k], vec![k2], ROOT_SCOPE);
        g.add_node(Op::Mul { fused: Activation::None }, vec![x, k2], vec![y], ROOT_SCOPE);
        g.outputs.push(y);

        assert_eq!(fold_constants(&mut g).unwrap(), 2);
        g.validate().unwrap();
        assert_eq!(g.nodes.len(), 1);
        assert_eq!(g.constant(k2).unwrap().to_f32_vec(), vec![5.0]);
    }

    #[test]
    fn test_output_producer_folds_to_constant() {
        let mut g = Graph::default();
        let a = g.add_constant("a", HostTensor::full(vec![1], 2.0));
        let y = g.add_tensor("y", vec![1], DType::F32, TensorKind::Intermediate);
        g.add_node(Op::Relu, vec![a], vec![y], ROOT_SCOPE);
        g.outputs.push(y);

        assert_eq!(fold_constants(&mut g).unwrap(), 1);
        g.validate().unwrap();
        assert!(g.nodes.is_empty());
        assert_eq!(g.outputs, vec![y]);
        assert_eq!(g.constant(y).unwrap().to_f32_vec(), vec![2.0]);
        let out = crate::ir::interp::run(&g, &[]).unwrap();
        assert_eq!(out[0].to_f32_vec(), vec![2.0]);
    }
}
