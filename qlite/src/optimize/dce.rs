use std::collections::HashSet;

use log::debug;

use crate::ir::Graph;

/// Drop nodes none of whose outputs reach a graph output, then unused
/// tensors.
pub fn eliminate_dead_nodes(graph: &mut Graph) -> usize {
    let mut live: HashSet<usize> = graph.outputs.iter().copied().collect();
    let mut dead = HashSet::new();
    for (i, node) in graph.nodes.iter().enumerate().rev() {
        if node.outputs.iter().any(|t| live.contains(t)) {
            live.extend(node.inputs.iter().copied());
        } else {
            dead.insert(i);
        }
    }
    graph.remove_nodes(&dead);
    graph.compact();
    if !dead.is_empty() {
        debug!("removed {} dead nodes", dead.len());
    }
    dead.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Op, TensorKind, ROOT_SCOPE};
    use crate::tensor::DType;

    #[test]
    fn test_unreachable_branch_is_removed() {
        let mut g = Graph::default();
        let x = g.add_input("x", vec![2], DType::F32);
        let a = g.add_tensor("a", vec![2], DType::F32, TensorKind::Intermediate);
        let b = g.add_tensor("b", vec![2], DType::F32, TensorKind::Intermediate);
        let y = g.add_tensor("y", vec![2], DType::F32, TensorKind::Intermediate);
        g.add_node(Op::Relu, vec![x], vec![a], ROOT_SCOPE);
        g.add_node(Op::Sigmoid, vec![a], vec![b], ROOT_SCOPE);
        g.add_node(Op::Tanh, vec![a], vec![y], ROOT_SCOPE);
        g.outputs.push(y);

        assert_eq!(eliminate_dead_nodes(&mut g), 1);
        g.validate().unwrap();
        assert_eq!(g.nodes.len(), 2);
        assert_eq!(g.tensors.len(), 3);
        assert!(g.tensors.iter().all(|t| t.name != "b"));
    }
}
