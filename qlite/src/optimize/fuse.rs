//! Peephole fusions applied before layout normalization.

use std::collections::HashSet;

use log::debug;

use crate::error::Result;
use crate::ir::eval::{bn_scale_shift, fold_batch_norm};
use crate::ir::{Activation, Graph, Op, OpKind};
use crate::tensor::{DType, HostTensor};

/// Run every fusion once, in order. Returns the number of rewrites.
pub fn fuse_patterns(graph: &mut Graph) -> Result<usize> {
    let mut count = remove_identities(graph);
    count += fold_conv_batch_norm(graph)?;
    count += lower_batch_norm(graph)?;
    count += fuse_activations(graph);
    Ok(count)
}

fn remove_identities(graph: &mut Graph) -> usize {
    let mut removed = HashSet::new();
    for i in 0..graph.nodes.len() {
        if graph.nodes[i].op != Op::Identity {
            continue;
        }
        let (input, output) = (graph.nodes[i].inputs[0], graph.nodes[i].outputs[0]);
        graph.replace_uses(output, input);
        removed.insert(i);
    }
    graph.remove_nodes(&removed);
    removed.len()
}

/// The single node reading `t`, unless `t` is also a graph output.
fn sole_consumer(graph: &Graph, t: usize) -> Option<usize> {
    if graph.outputs.contains(&t) {
        return None;
    }
    let mut readers = graph.nodes.iter().enumerate().filter(|(_, n)| n.inputs.contains(&t));
    match (readers.next(), readers.next()) {
        (Some((i, _)), None) => Some(i),
        _ => None,
    }
}

fn is_float_constant(graph: &Graph, t: usize) -> bool {
    graph.is_constant(t) && graph.tensor(t).dtype == DType::F32
}

fn fold_conv_batch_norm(graph: &mut Graph) -> Result<usize> {
    let mut removed = HashSet::new();
    for i in 0..graph.nodes.len() {
        let Op::Conv2d { fused: Activation::None, .. } = graph.nodes[i].op else {
            continue;
        };
        let conv = &graph.nodes[i];
        if !conv.inputs[1..].iter().all(|&t| is_float_constant(graph, t)) {
            continue;
        }
        let Some(j) = sole_consumer(graph, conv.outputs[0]) else {
            continue;
        };
        let bn = &graph.nodes[j];
        let Op::BatchNorm2d { eps } = bn.op else {
            continue;
        };
        if bn.inputs[0] != conv.outputs[0] || !bn.inputs[1..].iter().all(|&t| is_float_constant(graph, t)) {
            continue;
        }
        let params: Vec<HostTensor> = bn.inputs[1..].iter().filter_map(|&t| graph.constant(t)).collect();
        let weight = graph.constant(conv.inputs[1]);
        let bias = conv.inputs.get(2).and_then(|&t| graph.constant(t));
        let Some(weight) = weight else { continue };
        let (w, b) = fold_batch_norm(&weight, bias.as_ref(), &params, eps)?;

        let w_name = graph.tensor(conv.inputs[1]).name.clone();
        let b_name = graph.scope(bn.scope).child_path("bias");
        let out = bn.outputs[0];
        debug!("folded batch norm {} into conv {}", bn.id, conv.id);
        let w = graph.add_constant(w_name, w);
        let b = graph.add_constant(b_name, b);
        let conv = &mut graph.nodes[i];
        conv.inputs.truncate(1);
        conv.inputs.extend([w, b]);
        conv.outputs[0] = out;
        removed.insert(j);
    }
    graph.remove_nodes(&removed);
    Ok(removed.len())
}

/// Batch norm that could not be folded becomes `x * scale + shift` with
/// `[C, 1, ...]` constants.
fn lower_batch_norm(graph: &mut Graph) -> Result<usize> {
    let mut lowered = 0;
    let mut i = 0;
    while i < graph.nodes.len() {
        let node = &graph.nodes[i];
        let Op::BatchNorm2d { eps } = node.op else {
            i += 1;
            continue;
        };
        let x = node.inputs[0];
        if graph.tensor(x).dtype != DType::F32 || !node.inputs[1..].iter().all(|&t| is_float_constant(graph, t)) {
            i += 1;
            continue;
        }
        let params: Vec<HostTensor> = node.inputs[1..].iter().filter_map(|&t| graph.constant(t)).collect();
        let (scale, shift) = bn_scale_shift(&params, eps)?;
        let rank = graph.tensor(x).shape.len();
        let mut shape = vec![scale.len()];
        shape.resize(rank.saturating_sub(1).max(1), 1);
        let (out, scope, id) = (node.outputs[0], node.scope, node.id);
        let (scale_name, shift_name) = (graph.scope(scope).child_path("scale"), graph.scope(scope).child_path("shift"));

        let scale = graph.add_constant(scale_name, HostTensor::new(shape.clone(), scale)?);
        let shift = graph.add_constant(shift_name, HostTensor::new(shape, shift)?);
        let scaled = graph.add_like(out, format!("{}.scaled", graph.tensor(out).name));
        let mul = graph.make_node(Op::Mul { fused: Activation::None }, vec![x, scale], vec![scaled], scope);
        let add = graph.make_node(Op::Add { fused: Activation::None }, vec![scaled, shift], vec![out], scope);
        debug!("lowered standalone batch norm {id} to mul + add");
        graph.nodes.splice(i..=i, [mul, add]);
        lowered += 1;
        i += 2;
    }
    Ok(lowered)
}

fn fuse_activations(graph: &mut Graph) -> usize {
    let mut removed = HashSet::new();
    let producers = graph.producers();
    for i in 0..graph.nodes.len() {
        let Some(activation) = graph.nodes[i].op.as_activation() else {
            continue;
        };
        let input = graph.nodes[i].inputs[0];
        let Some(p) = producers[input] else {
            continue;
        };
        let fusable = matches!(
            graph.nodes[p].op.kind(),
            OpKind::Conv2d | OpKind::Linear | OpKind::Add | OpKind::Sub | OpKind::Mul | OpKind::MaxPool2d | OpKind::AvgPool2d
        );
        if !fusable || removed.contains(&p) || sole_consumer(graph, input) != Some(i) {
            continue;
        }
        let out = graph.nodes[i].outputs[0];
        let Some(slot) = graph.nodes[p].op.fused_mut() else {
            continue;
        };
        if !slot.is_none() {
            continue;
        }
        *slot = activation;
        graph.nodes[p].outputs[0] = out;
        debug!("fused {activation:?} into {}", graph.nodes[p].id);
        removed.insert(i);
    }
    graph.remove_nodes(&removed);
    removed.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{interp, Conv2dAttrs, TensorKind, ROOT_SCOPE};

    fn conv_bn(g: &mut Graph) -> (usize, usize) {
        let x = g.add_input("x", vec![1, 1, 2, 2], DType::F32);
        let w = g.add_constant("w", HostTensor::new(vec![2, 1, 1, 1], vec![2.0, -1.0]).unwrap());
        let c = g.add_tensor("c", vec![1, 2, 2, 2], DType::F32, TensorKind::Intermediate);
        let y = g.add_tensor("y", vec![1, 2, 2, 2], DType::F32, TensorKind::Intermediate);
        let stats: Vec<usize> = [[1.0, 0.0], [4.0, 1.0], [3.0, 1.0], [0.5, 0.0]]
            .iter()
            .map(|v| g.add_constant("bn", HostTensor::new(vec![2], v.to_vec()).unwrap()))
            .collect();
        g.add_node(
            Op::Conv2d {
                attrs: Conv2dAttrs::default(),
                fused: Activation::None,
            },
            vec![x, w],
            vec![c],
            ROOT_SCOPE,
        );
        let mut inputs = vec![c];
        inputs.extend(stats);
        g.add_node(Op::BatchNorm2d { eps: 0.0 }, inputs, vec![y], ROOT_SCOPE);
        (c, y)
    }

    fn sample() -> HostTensor {
        HostTensor::new(vec![1, 1, 2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap()
    }

    #[test]
    fn test_conv_batch_norm_folds() {
        let mut g = Graph::default();
        let (_, y) = conv_bn(&mut g);
        g.outputs.push(y);
        let before = interp::run(&g, &[sample()]).unwrap();
        assert_eq!(fold_conv_batch_norm(&mut g).unwrap(), 1);
        g.validate().unwrap();
        assert_eq!(g.nodes.len(), 1);
        let after = interp::run(&g, &[sample()]).unwrap();
        assert!(after[0].max_abs_diff(&before[0]) < 1e-5);
    }

    #[test]
    fn test_shared_conv_output_lowers_batch_norm() {
        let mut g = Graph::default();
        let (c, y) = conv_bn(&mut g);
        g.outputs.extend([c, y]);
        let before = interp::run(&g, &[sample()]).unwrap();
        assert_eq!(fuse_patterns(&mut g).unwrap(), 1);
        g.validate().unwrap();
        let kinds: Vec<OpKind> = g.nodes.iter().map(|n| n.op.kind()).collect();
        assert_eq!(kinds, vec![OpKind::Conv2d, OpKind::Mul, OpKind::Add]);
        let after = interp::run(&g, &[sample()]).unwrap();
        assert!(after[1].max_abs_diff(&before[1]) < 1e-5);
    }

    #[test]
    fn test_relu6_fuses_into_add() {
        let mut g = Graph::default();
        let a = g.add_input("a", vec![2], DType::F32);
        let b = g.add_input("b", vec![2], DType::F32);
        let s = g.add_tensor("s", vec![2], DType::F32, TensorKind::Intermediate);
        let r = g.add_tensor("r", vec![2], DType::F32, TensorKind::Intermediate);
        let i = g.add_tensor("i", vec![2], DType::F32, TensorKind::Intermediate);
        g.add_node(Op::Add { fused: Activation::None }, vec![a, b], vec![s], ROOT_SCOPE);
        g.add_node(Op::Identity, vec![s], vec![i], ROOT_SCOPE);
        g.add_node(Op::Clamp { min: 0.0, max: 6.0 }, vec![i], vec![r], ROOT_SCOPE);
        g.outputs.push(r);
        assert_eq!(fuse_patterns(&mut g).unwrap(), 2);
        assert_eq!(g.nodes.len(), 1);
        assert_eq!(g.nodes[0].op, Op::Add { fused: Activation::Relu6 });
        assert_eq!(g.nodes[0].outputs, vec![r]);
    }

    #[test]
    fn test_activation_not_fused_into_shared_producer() {
        let mut g = Graph::default();
        let a = g.add_input("a", vec![2], DType::F32);
        let s = g.add_tensor("s", vec![2], DType::F32, TensorKind::Intermediate);
        let r = g.add_tensor("r", vec![2], DType::F32, TensorKind::Intermediate);
        g.add_node(Op::Add { fused: Activation::None }, vec![a, a], vec![s], ROOT_SCOPE);
        g.add_node(Op::Relu, vec![s], vec![r], ROOT_SCOPE);
        g.outputs.extend([s, r]);
        assert_eq!(fuse_activations(&mut g), 0);
    }
}
