//! Channel-first → channel-last layout normalization.
//!
//! Channel-sensitive ops run NHWC. Layout flows forward through
//! element-wise and axis-parameterized ops; ops that depend on the logical
//! element order get channel-first operands back. Tensor shapes are
//! physical after this pass: a channel-last descriptor has its shape in
//! NHWC order and `layout == ChannelLast`.

use std::collections::{HashMap, HashSet};

use log::debug;

use crate::error::{Error, Result};
use crate::ir::eval::{NCHW_TO_NHWC, NHWC_TO_NCHW};
use crate::ir::{Graph, Layout, Node, Op, Tensor, TensorId, ROOT_SCOPE};
use crate::registry::{LayoutClass, OpRegistry};
use crate::tensor::HostTensor;

/// How a constant is rearranged for a channel-last consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ConstantUse {
    /// Broadcast operand of an element-wise op.
    Broadcast,
    /// `OIHW` → `OHWI`.
    ConvWeight,
    /// `[C, 1, H, W]` → `[1, H, W, C]`.
    DepthwiseWeight,
}

impl ConstantUse {
    fn perm(self) -> [usize; 4] {
        match self {
            ConstantUse::Broadcast | ConstantUse::ConvWeight => NCHW_TO_NHWC,
            ConstantUse::DepthwiseWeight => [1, 2, 3, 0],
        }
    }
}

fn permute_shape(shape: &[usize], perm: &[usize]) -> Vec<usize> {
    perm.iter().map(|&p| shape[p]).collect()
}

/// Position of source axis `axis` after applying `perm`.
fn moved_axis(perm: &[usize], axis: usize) -> usize {
    perm.iter().position(|&p| p == axis).unwrap_or(axis)
}

fn permute_descriptor(t: &mut Tensor, perm: &[usize], layout: Layout) {
    t.shape = permute_shape(&t.shape, perm);
    t.dynamic_axes = t.dynamic_axes.iter().map(|&a| moved_axis(perm, a)).collect();
    t.dynamic_axes.sort_unstable();
    if let Some(q) = &mut t.quant {
        q.axis = q.axis.map(|a| moved_axis(perm, a));
    }
    t.layout = layout;
}

fn is_identity(perm: &[usize]) -> bool {
    perm.iter().enumerate().all(|(i, &p)| i == p)
}

/// Channel-last form of an axis-parameterized op, or `None` when its output
/// would not keep a well-defined order.
fn channel_last_op(op: &Op) -> Option<Op> {
    let axis = |a: usize| NHWC_TO_NCHW.get(a).copied();
    match op {
        Op::Softmax { axis: a } => Some(Op::Softmax { axis: axis(*a)? }),
        Op::Concat { axis: a } => Some(Op::Concat { axis: axis(*a)? }),
        Op::Pad { pads, value } if pads.len() == 4 => Some(Op::Pad {
            pads: NCHW_TO_NHWC.iter().map(|&a| pads[a]).collect(),
            value: *value,
        }),
        Op::Mean { axes, keep_dims } => {
            let mut physical = axes.iter().map(|&a| axis(a)).collect::<Option<Vec<_>>>()?;
            physical.sort_unstable();
            if !keep_dims {
                let kept: Vec<usize> = NCHW_TO_NHWC.iter().copied().filter(|a| !axes.contains(a)).collect();
                if kept.windows(2).any(|w| w[0] > w[1]) {
                    return None;
                }
            }
            Some(Op::Mean {
                axes: physical,
                keep_dims: *keep_dims,
            })
        }
        _ => None,
    }
}

struct Normalizer<'g> {
    graph: &'g mut Graph,
    nodes: Vec<Node>,
    relayouts: HashMap<(TensorId, Layout), TensorId>,
    constants: HashMap<(TensorId, ConstantUse), TensorId>,
}

impl Normalizer<'_> {
    fn layout_of(&self, t: TensorId) -> Layout {
        self.graph.tensor(t).layout
    }

    fn rank(&self, t: TensorId) -> usize {
        self.graph.tensor(t).shape.len()
    }

    /// `t` in `target` layout, transposing once per tensor and layout.
    fn relayout(&mut self, t: TensorId, target: Layout, scope: usize) -> Result<TensorId> {
        if self.layout_of(t) == target {
            return Ok(t);
        }
        if let Some(&r) = self.relayouts.get(&(t, target)) {
            return Ok(r);
        }
        let perm = match target {
            Layout::ChannelLast => NCHW_TO_NHWC,
            Layout::ChannelFirst => NHWC_TO_NCHW,
        };
        let name = format!("{}.{}", self.graph.tensor(t).name, if target == Layout::ChannelLast { "nhwc" } else { "nchw" });
        let r = match self.graph.constant(t) {
            Some(value) => {
                let quant = self.graph.tensor(t).quant.clone();
                let r = self.graph.add_constant(name, value.permute(&perm)?);
                let desc = self.graph.tensor_mut(r);
                desc.layout = target;
                desc.quant = quant.map(|mut q| {
                    q.axis = q.axis.map(|a| moved_axis(&perm, a));
                    q
                });
                r
            }
            None => {
                let r = self.graph.add_like(t, name);
                permute_descriptor(self.graph.tensor_mut(r), &perm, target);
                let node = self.graph.make_node(Op::Transpose { perm: perm.to_vec() }, vec![t], vec![r], scope);
                self.nodes.push(Node {
                    layout: Some(target),
                    ..node
                });
                r
            }
        };
        self.relayouts.insert((t, target), r);
        Ok(r)
    }

    /// Constant `t` rearranged for a channel-last consumer.
    fn constant_for(&mut self, t: TensorId, usage: ConstantUse) -> Result<TensorId> {
        if let Some(&c) = self.constants.get(&(t, usage)) {
            return Ok(c);
        }
        let desc = self.graph.tensor(t).clone();
        let Some(value) = desc.constant() else {
            return Ok(t);
        };
        if usage == ConstantUse::Broadcast && (value.numel() <= 1 || value.rank() > 4) {
            return Ok(t);
        }
        let pad = 4 - value.rank().min(4);
        let mut shape = vec![1; pad];
        shape.extend_from_slice(&value.shape);
        let value: HostTensor = value.reshape(shape)?;
        let perm = usage.perm();
        let permuted = value.permute(&perm)?;
        let c = self.graph.add_constant(format!("{}.nhwc", desc.name), permuted);
        let out = self.graph.tensor_mut(c);
        out.layout = Layout::ChannelLast;
        out.quant = desc.quant.map(|mut q| {
            q.axis = q.axis.map(|a| moved_axis(&perm, a + pad));
            q
        });
        self.constants.insert((t, usage), c);
        Ok(c)
    }

    fn unsupported(&self, node: &Node, reason: String) -> Error {
        Error::UnsupportedLayout {
            node: node.id.0,
            op: node.op.kind().to_string(),
            scope: self.graph.scope_path(node.scope).to_string(),
            reason,
        }
    }

    fn set_outputs(&mut self, node: &Node, layout: Layout) {
        for &out in &node.outputs {
            if layout == Layout::ChannelLast && self.rank(out) == 4 {
                permute_descriptor(self.graph.tensor_mut(out), &NCHW_TO_NHWC, Layout::ChannelLast);
            }
        }
    }

    fn activations(&self, node: &Node) -> Vec<usize> {
        (0..node.inputs.len()).filter(|&i| !self.graph.is_constant(node.inputs[i])).collect()
    }

    fn visit(&mut self, mut node: Node, class: LayoutClass) -> Result<()> {
        let scope = node.scope;
        let activations = self.activations(&node);
        let all_rank4 = !activations.is_empty() && activations.iter().all(|&i| self.rank(node.inputs[i]) == 4);
        let any_last = activations.iter().any(|&i| self.layout_of(node.inputs[i]) == Layout::ChannelLast);

        let layout = match class {
            LayoutClass::ChannelSensitive => {
                let x = node.inputs[0];
                if self.rank(x) != 4 {
                    return Err(self.unsupported(&node, format!("expects a rank-4 input, got {:?}", self.graph.tensor(x).shape)));
                }
                node.inputs[0] = self.relayout(x, Layout::ChannelLast, scope)?;
                if let Op::Conv2d { attrs, .. } = &node.op {
                    let w = node.inputs[1];
                    if !self.graph.is_constant(w) {
                        return Err(self.unsupported(&node, "convolution weights must be constant".into()));
                    }
                    let usage = if attrs.groups > 1 {
                        ConstantUse::DepthwiseWeight
                    } else {
                        ConstantUse::ConvWeight
                    };
                    node.inputs[1] = self.constant_for(w, usage)?;
                }
                Layout::ChannelLast
            }
            LayoutClass::Transparent if all_rank4 && any_last => {
                for i in 0..node.inputs.len() {
                    let t = node.inputs[i];
                    node.inputs[i] = if activations.contains(&i) {
                        self.relayout(t, Layout::ChannelLast, scope)?
                    } else {
                        self.constant_for(t, ConstantUse::Broadcast)?
                    };
                }
                Layout::ChannelLast
            }
            LayoutClass::AxisParam if all_rank4 && any_last => match channel_last_op(&node.op) {
                Some(op) => {
                    node.op = op;
                    for i in 0..node.inputs.len() {
                        let t = node.inputs[i];
                        node.inputs[i] = if activations.contains(&i) {
                            self.relayout(t, Layout::ChannelLast, scope)?
                        } else {
                            self.constant_for(t, ConstantUse::Broadcast)?
                        };
                    }
                    Layout::ChannelLast
                }
                None => self.to_channel_first(&mut node, &activations)?,
            },
            LayoutClass::RequiresSource => match &node.op {
                Op::Transpose { perm } if self.layout_of(node.inputs[0]) == Layout::ChannelLast => {
                    // Read the physical NHWC tensor directly.
                    let composed = perm.iter().map(|&p| NHWC_TO_NCHW[p]).collect();
                    node.op = Op::Transpose { perm: composed };
                    Layout::ChannelFirst
                }
                _ => self.to_channel_first(&mut node, &activations)?,
            },
            _ => self.to_channel_first(&mut node, &activations)?,
        };
        self.set_outputs(&node, layout);
        node.layout = Some(layout);
        self.nodes.push(node);
        Ok(())
    }

    fn to_channel_first(&mut self, node: &mut Node, activations: &[usize]) -> Result<Layout> {
        for &i in activations {
            node.inputs[i] = self.relayout(node.inputs[i], Layout::ChannelFirst, node.scope)?;
        }
        Ok(Layout::ChannelFirst)
    }
}

/// Move channel-sensitive ops to NHWC.
///
/// With `nchw_transpose`, rank-4 graph inputs are declared NHWC; otherwise
/// they stay NCHW and are transposed on entry. Returns, per graph input,
/// whether it was transposed. Graph outputs are always channel-first.
pub fn normalize_layout(graph: &mut Graph, nchw_transpose: bool) -> Result<Vec<bool>> {
    let registry = OpRegistry::standard();
    let mut transposed = vec![false; graph.inputs.len()];
    for (i, &input) in graph.inputs.clone().iter().enumerate() {
        if nchw_transpose && graph.tensor(input).shape.len() == 4 {
            permute_descriptor(graph.tensor_mut(input), &NCHW_TO_NHWC, Layout::ChannelLast);
            transposed[i] = true;
        }
    }

    let original = std::mem::take(&mut graph.nodes);
    let mut normalizer = Normalizer {
        graph: &mut *graph,
        nodes: Vec::with_capacity(original.len()),
        relayouts: HashMap::new(),
        constants: HashMap::new(),
    };
    for node in original {
        let class = registry
            .schema(node.op.kind())
            .map(|s| s.layout)
            .unwrap_or(LayoutClass::RequiresSource);
        normalizer.visit(node, class)?;
    }
    let outputs = normalizer.graph.outputs.clone();
    let restored = outputs
        .into_iter()
        .map(|t| normalizer.relayout(t, Layout::ChannelFirst, ROOT_SCOPE))
        .collect::<Result<Vec<_>>>()?;
    normalizer.graph.outputs = restored;
    graph.nodes = normalizer.nodes;

    let simplified = simplify_transposes(graph)?;
    graph.toposort()?;
    graph.validate()?;
    debug!(
        "layout: {} inputs transposed, {} transposes simplified",
        transposed.iter().filter(|t| **t).count(),
        simplified
    );
    Ok(transposed)
}

/// Compose transpose chains, fold transposes of constants and drop identity
/// transposes.
fn simplify_transposes(graph: &mut Graph) -> Result<usize> {
    let mut changed = 0;
    let mut removed = HashSet::new();
    for i in 0..graph.nodes.len() {
        let Op::Transpose { perm } = &graph.nodes[i].op else {
            continue;
        };
        let mut perm = perm.clone();
        let mut input = graph.nodes[i].inputs[0];
        let output = graph.nodes[i].outputs[0];

        let producer = graph.nodes[..i]
            .iter()
            .position(|n| n.outputs.contains(&input) && !removed.contains(&n.id.0));
        if let Some(p) = producer {
            if let Op::Transpose { perm: first } = &graph.nodes[p].op {
                perm = perm.iter().map(|&a| first[a]).collect();
                input = graph.nodes[p].inputs[0];
                changed += 1;
            }
        }

        if graph.outputs.contains(&output) {
            graph.nodes[i].op = Op::Transpose { perm };
            graph.nodes[i].inputs[0] = input;
        } else if let Some(value) = graph.constant(input) {
            let t = graph.tensor(output).clone();
            let c = graph.add_constant(t.name, value.permute(&perm)?);
            let desc = graph.tensor_mut(c);
            desc.quant = t.quant;
            desc.layout = t.layout;
            graph.replace_uses(output, c);
            removed.insert(graph.nodes[i].id.0);
            changed += 1;
        } else if is_identity(&perm) {
            graph.replace_uses(output, input);
            removed.insert(graph.nodes[i].id.0);
            changed += 1;
        } else {
            graph.nodes[i].op = Op::Transpose { perm };
            graph.nodes[i].inputs[0] = input;
        }
    }
    graph.nodes.retain(|n| !removed.contains(&n.id.0));
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{interp, Activation, Conv2dAttrs, ModuleKind, OpKind, PoolAttrs, TensorKind};
    use crate::tensor::DType;

    fn kinds(g: &Graph) -> Vec<OpKind> {
        g.nodes.iter().map(|n| n.op.kind()).collect()
    }

    /// conv → relu → max-pool → flatten → linear
    fn small_cnn() -> Graph {
        let mut g = Graph::default();
        let x = g.add_input("x", vec![1, 2, 4, 4], DType::F32);
        let w = g.add_constant(
            "conv.weight",
            HostTensor::new(vec![3, 2, 3, 3], (0..54).map(|v| ((v % 7) as f32 - 3.0) * 0.1).collect()).unwrap(),
        );
        let c = g.add_tensor("c", vec![1, 3, 4, 4], DType::F32, TensorKind::Intermediate);
        let r = g.add_tensor("r", vec![1, 3, 4, 4], DType::F32, TensorKind::Intermediate);
        let p = g.add_tensor("p", vec![1, 3, 2, 2], DType::F32, TensorKind::Intermediate);
        let f = g.add_tensor("f", vec![1, 12], DType::F32, TensorKind::Intermediate);
        let fw = g.add_constant(
            "fc.weight",
            HostTensor::new(vec![2, 12], (0..24).map(|v| (v as f32 - 12.0) * 0.05).collect()).unwrap(),
        );
        let y = g.add_tensor("y", vec![1, 2], DType::F32, TensorKind::Intermediate);
        g.add_node(
            Op::Conv2d {
                attrs: Conv2dAttrs {
                    padding: [1, 1],
                    ..Default::default()
                },
                fused: Activation::None,
            },
            vec![x, w],
            vec![c],
            ROOT_SCOPE,
        );
        g.add_node(Op::Relu, vec![c], vec![r], ROOT_SCOPE);
        g.add_node(
            Op::MaxPool2d(PoolAttrs {
                kernel: [2, 2],
                stride: [2, 2],
                padding: [0, 0],
                ceil_mode: false,
                count_include_pad: true,
                fused: Activation::None,
            }),
            vec![r],
            vec![p],
            ROOT_SCOPE,
        );
        g.add_node(Op::Flatten { start_dim: 1 }, vec![p], vec![f], ROOT_SCOPE);
        g.add_node(Op::Linear { fused: Activation::None }, vec![f, fw], vec![y], ROOT_SCOPE);
        g.outputs.push(y);
        g
    }

    fn sample() -> HostTensor {
        HostTensor::new(vec![1, 2, 4, 4], (0..32).map(|v| (v as f32) * 0.1 - 1.0).collect()).unwrap()
    }

    #[test]
    fn test_nhwc_inputs_preserve_results() {
        let mut g = small_cnn();
        let before = interp::run(&g, &[sample()]).unwrap();
        let transposed = normalize_layout(&mut g, true).unwrap();
        assert_eq!(transposed, vec![true]);
        assert_eq!(g.tensor(g.inputs[0]).shape, vec![1, 4, 4, 2]);
        assert_eq!(
            kinds(&g),
            vec![OpKind::Conv2d, OpKind::Relu, OpKind::MaxPool2d, OpKind::Transpose, OpKind::Flatten, OpKind::Linear]
        );
        let nhwc = sample().permute(&NCHW_TO_NHWC).unwrap();
        let after = interp::run(&g, &[nhwc]).unwrap();
        assert!(after[0].max_abs_diff(&before[0]) < 1e-5);
    }

    #[test]
    fn test_nchw_inputs_get_entry_transpose() {
        let mut g = small_cnn();
        let before = interp::run(&g, &[sample()]).unwrap();
        let transposed = normalize_layout(&mut g, false).unwrap();
        assert_eq!(transposed, vec![false]);
        assert_eq!(kinds(&g)[0], OpKind::Transpose);
        let after = interp::run(&g, &[sample()]).unwrap();
        assert!(after[0].max_abs_diff(&before[0]) < 1e-5);
    }

    #[test]
    fn test_softmax_over_channels_becomes_last_axis() {
        let mut g = Graph::default();
        let x = g.add_input("x", vec![1, 3, 2, 2], DType::F32);
        let w = g.add_constant("w", HostTensor::full(vec![3, 3, 1, 1], 0.5));
        let c = g.add_tensor("c", vec![1, 3, 2, 2], DType::F32, TensorKind::Intermediate);
        let s = g.add_tensor("s", vec![1, 3, 2, 2], DType::F32, TensorKind::Intermediate);
        g.add_node(
            Op::Conv2d {
                attrs: Conv2dAttrs::default(),
                fused: Activation::None,
            },
            vec![x, w],
            vec![c],
            ROOT_SCOPE,
        );
        g.add_node(Op::Softmax { axis: 1 }, vec![c], vec![s], ROOT_SCOPE);
        g.outputs.push(s);
        let input = HostTensor::new(vec![1, 3, 2, 2], (0..12).map(|v| v as f32 * 0.2).collect()).unwrap();
        let before = interp::run(&g, &[input.clone()]).unwrap();

        normalize_layout(&mut g, true).unwrap();
        assert_eq!(g.nodes[1].op, Op::Softmax { axis: 3 });
        // output restored to NCHW
        assert_eq!(kinds(&g).last(), Some(&OpKind::Transpose));
        let after = interp::run(&g, &[input.permute(&NCHW_TO_NHWC).unwrap()]).unwrap();
        assert!(after[0].max_abs_diff(&before[0]) < 1e-5);
    }

    #[test]
    fn test_runtime_conv_weight_is_rejected_with_scope() {
        let mut g = Graph::default();
        let features = g.intern_scope("features", ModuleKind::Sequential, ROOT_SCOPE);
        let conv = g.intern_scope("features.0", ModuleKind::Conv2d, features);
        let x = g.add_input("x", vec![1, 2, 4, 4], DType::F32);
        let w = g.add_input("w", vec![3, 2, 1, 1], DType::F32);
        let y = g.add_tensor("y", vec![1, 3, 4, 4], DType::F32, TensorKind::Intermediate);
        let id = g.add_node(
            Op::Conv2d {
                attrs: Conv2dAttrs::default(),
                fused: Activation::None,
            },
            vec![x, w],
            vec![y],
            conv,
        );
        g.outputs.push(y);

        match normalize_layout(&mut g, true).unwrap_err() {
            Error::UnsupportedLayout { node, op, scope, reason } => {
                assert_eq!(node, id.0);
                assert_eq!(op, OpKind::Conv2d.to_string());
                assert_eq!(scope, "features.0");
                assert!(reason.contains("constant"), "{reason}");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_pool_over_rank3_input_is_rejected() {
        let mut g = Graph::default();
        let pool = g.intern_scope("pool", ModuleKind::MaxPool2d, ROOT_SCOPE);
        let x = g.add_input("x", vec![2, 4, 4], DType::F32);
        let y = g.add_tensor("y", vec![2, 2, 2], DType::F32, TensorKind::Intermediate);
        g.add_node(
            Op::MaxPool2d(PoolAttrs {
                kernel: [2, 2],
                stride: [2, 2],
                padding: [0, 0],
                ceil_mode: false,
                count_include_pad: true,
                fused: Activation::None,
            }),
            vec![x],
            vec![y],
            pool,
        );
        g.outputs.push(y);

        let err = normalize_layout(&mut g, true).unwrap_err();
        assert!(
            matches!(&err, Error::UnsupportedLayout { scope, reason, .. } if scope == "pool" && reason.contains("rank-4")),
            "{err:?}"
        );
    }

    #[test]
    fn test_back_to_back_transposes_cancel() {
        let mut g = Graph::default();
        let x = g.add_input("x", vec![1, 2, 3, 4], DType::F32);
        let a = g.add_tensor("a", vec![1, 3, 4, 2], DType::F32, TensorKind::Intermediate);
        let b = g.add_tensor("b", vec![1, 2, 3, 4], DType::F32, TensorKind::Intermediate);
        let y = g.add_tensor("y", vec![1, 2, 3, 4], DType::F32, TensorKind::Intermediate);
        g.add_node(Op::Transpose { perm: NCHW_TO_NHWC.to_vec() }, vec![x], vec![a], ROOT_SCOPE);
        g.add_node(Op::Transpose { perm: NHWC_TO_NCHW.to_vec() }, vec![a], vec![b], ROOT_SCOPE);
        g.add_node(Op::Relu, vec![b], vec![y], ROOT_SCOPE);
        g.outputs.push(y);
        simplify_transposes(&mut g).unwrap();
        g.validate().unwrap();
        assert_eq!(g.nodes[g.nodes.len() - 1].inputs, vec![x]);
    }
}
