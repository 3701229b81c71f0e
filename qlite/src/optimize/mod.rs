//! Graph-level optimizations run before lowering to TFLite.

pub mod dce;
pub mod fold;
pub mod fuse;
pub mod layout;

use log::info;

pub use dce::eliminate_dead_nodes;
pub use fold::fold_constants;
pub use fuse::fuse_patterns;
pub use layout::normalize_layout;

use crate::error::Result;
use crate::ir::Graph;

/// Constant folding, pattern fusion, layout normalization and dead-node
/// elimination, in that order.
///
/// Returns, per graph input, whether it was retyped to NHWC.
pub fn optimize(graph: &mut Graph, nchw_transpose: bool) -> Result<Vec<bool>> {
    let before = graph.nodes.len();
    let folded = fold_constants(graph)?;
    let fused = fuse_patterns(graph)?;
    // Folding again catches constants exposed by fusion.
    let refolded = fold_constants(graph)?;
    let transposed = normalize_layout(graph, nchw_transpose)?;
    let dead = eliminate_dead_nodes(graph);
    graph.validate()?;
    info!(
        "optimized graph: {before} -> {} nodes ({} folded, {fused} fused, {dead} dead)",
        graph.nodes.len(),
        folded + refolded
    );
    Ok(transposed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Activation, Op, OpKind, TensorKind, ROOT_SCOPE};
    use crate::tensor::{DType, HostTensor};

    #[test]
    fn test_constant_output_leaves_no_operator() {
        let mut g = Graph::default();
        let x = g.add_input("x", vec![3], DType::F32);
        let a = g.add_constant("a", HostTensor::full(vec![1], 2.0));
        let b = g.add_constant("b", HostTensor::full(vec![1], 3.0));
        let r = g.add_tensor("r", vec![3], DType::F32, TensorKind::Intermediate);
        let s = g.add_tensor("s", vec![1], DType::F32, TensorKind::Intermediate);
        g.add_node(Op::Relu, vec![x], vec![r], ROOT_SCOPE);
        g.add_node(Op::Add { fused: Activation::None }, vec![a, b], vec![s], ROOT_SCOPE);
        g.outputs.extend([r, s]);

        optimize(&mut g, true).unwrap();
        let kinds: Vec<OpKind> = g.nodes.iter().map(|n| n.op.kind()).collect();
        assert_eq!(kinds, vec![OpKind::Relu]);
        assert_eq!(g.outputs.len(), 2);
        assert_eq!(g.constant(g.outputs[1]).unwrap().to_f32_vec(), vec![5.0]);

        let x_value = HostTensor::new(vec![3], vec![-1.0, 0.5, 2.0]).unwrap();
        let out = crate::ir::interp::run(&g, &[x_value]).unwrap();
        assert_eq!(out[0].to_f32_vec(), vec![0.0, 0.5, 2.0]);
        assert_eq!(out[1].to_f32_vec(), vec![5.0]);
    }
}
