//! Fake-quantized graph → integer graph.
//!
//! Three passes run in order:
//!
//! 1. every fake-quant node becomes either a quantized constant (when it
//!    reads a weight) or an explicit `Quantize`;
//! 2. quantization-aware layers become plain linear / conv nodes with int8
//!    weights and int32 bias (batch norm folded in);
//! 3. nodes whose activations are all integer run in integer, absorbing the
//!    `Quantize` that follows them. Float nodes get `Dequantize` in front of
//!    integer operands and integer graph outputs are dequantized.

use std::collections::{HashMap, HashSet};

use log::{debug, info};
use qlite_kernels::Rounding;

use super::observer::FakeQuant;
use crate::error::{Error, Result};
use crate::ir::eval::qat_conv_params;
use crate::ir::{Graph, Node, NodeId, Op, OpKind, QuantParams, Tensor, TensorId, ROOT_SCOPE};
use crate::registry::OpRegistry;
use crate::tensor::{DType, HostTensor};

/// Convert a calibrated QAT graph to its integer form.
pub fn convert(graph: &Graph) -> Result<Graph> {
    let mut g = graph.clone();
    let folded = fold_fake_quant(&mut g)?;
    let lowered = lower_qat(&mut g)?;
    integerize(&mut g)?;
    g.toposort()?;
    g.compact();
    g.validate()?;
    let integer = g
        .nodes
        .iter()
        .filter(|n| n.outputs.iter().any(|&t| g.tensor(t).dtype.is_integer()))
        .count();
    info!(
        "convert: folded {folded} fake-quant nodes, lowered {lowered} qat layers, {integer}/{} nodes integer",
        g.nodes.len()
    );
    Ok(g)
}

fn is_quantized(t: &Tensor) -> bool {
    t.dtype.is_integer() && t.quant.is_some()
}

fn fold_fake_quant(g: &mut Graph) -> Result<usize> {
    let mut removed = HashSet::new();
    for i in 0..g.nodes.len() {
        let Op::FakeQuantize(fq) = &g.nodes[i].op else {
            continue;
        };
        let fq = fq.clone();
        let (input, output) = (g.nodes[i].inputs[0], g.nodes[i].outputs[0]);
        let params = fq.qparams();
        match g.constant(input) {
            Some(value) => {
                let q = params.quantize(&value, fq.spec.dtype, fq.spec.rounding)?;
                let name = g.tensor(input).name.clone();
                let c = g.add_constant(name, q);
                g.tensor_mut(c).quant = Some(params);
                g.replace_uses(output, c);
                removed.insert(i);
            }
            None => {
                g.nodes[i].op = Op::Quantize;
                let t = g.tensor_mut(output);
                t.dtype = fq.spec.dtype;
                t.quant = Some(params);
            }
        }
    }
    g.remove_nodes(&removed);
    Ok(removed.len())
}

fn lower_qat(g: &mut Graph) -> Result<usize> {
    let mut lowered = 0;
    for i in 0..g.nodes.len() {
        let node = &g.nodes[i];
        let (op, spec) = match &node.op {
            Op::QatLinear(q) => (Op::Linear { fused: q.fused }, q.weight),
            Op::QatConv2d(q) => (
                Op::Conv2d {
                    attrs: q.conv,
                    fused: q.fused,
                },
                q.weight,
            ),
            _ => continue,
        };
        let mut operands = vec![HostTensor::scalar(0.0)];
        for &t in &node.inputs[1..] {
            let value = g.constant(t).ok_or_else(|| {
                Error::InvalidGraph(format!("{} ({}) has a non-constant parameter `{}`", node.id, node.op.kind(), g.tensor(t).name))
            })?;
            operands.push(value);
        }
        let (w, b) = match &node.op {
            Op::QatConv2d(q) => qat_conv_params(q, &operands)?,
            _ => (operands[1].clone(), operands.get(2).cloned()),
        };
        let x = node.inputs[0];
        let weight_name = g.tensor(node.inputs[1]).name.clone();
        let bias_name = match node.inputs.get(2) {
            Some(&b) if matches!(node.op, Op::QatLinear(_)) || matches!(&node.op, Op::QatConv2d(q) if q.has_bias) => {
                g.tensor(b).name.clone()
            }
            _ => g.scope(node.scope).child_path("bias"),
        };

        let mut fq = FakeQuant::new(spec);
        fq.observe(&w)?;
        let w_params = fq.qparams();
        let mut inputs = vec![x];
        let x_params = Some(g.tensor(x)).filter(|t| is_quantized(t)).and_then(|t| t.quant.clone());
        match x_params {
            Some(x_params) => {
                let wq = w_params.quantize(&w, spec.dtype, spec.rounding)?;
                let w_id = g.add_constant(weight_name, wq);
                g.tensor_mut(w_id).quant = Some(w_params.clone());
                inputs.push(w_id);
                if let Some(b) = b {
                    inputs.push(add_int_bias(g, bias_name, &b, &x_params, &w_params, spec.rounding)?);
                }
            }
            None => {
                debug!("{}: input is float, keeping fake-quantized float weights", g.nodes[i].id);
                inputs.push(g.add_constant(weight_name, fq.apply(&w)?));
                if let Some(b) = b {
                    inputs.push(g.add_constant(bias_name, b));
                }
            }
        }
        g.nodes[i].op = op;
        g.nodes[i].inputs = inputs;
        lowered += 1;
    }
    Ok(lowered)
}

/// Bias quantized to int32 with scale `s_in * s_w` and zero point 0.
fn add_int_bias(
    g: &mut Graph,
    name: String,
    bias: &HostTensor,
    input: &QuantParams,
    weight: &QuantParams,
    rounding: Rounding,
) -> Result<TensorId> {
    let s_in = input.scale[0];
    let params = if weight.is_per_channel() {
        let scale: Vec<f32> = weight.scale.iter().map(|s| s * s_in).collect();
        let zero_point = vec![0; scale.len()];
        QuantParams::per_channel(scale, zero_point, 0)
    } else {
        QuantParams::per_tensor(weight.scale[0] * s_in, 0)
    };
    let q = params.quantize(bias, DType::I32, rounding)?;
    let id = g.add_constant(name, q);
    g.tensor_mut(id).quant = Some(params);
    Ok(id)
}

/// Ops whose integer output reuses the input parameters unchanged.
fn preserves_qparams(kind: OpKind) -> bool {
    matches!(
        kind,
        OpKind::Reshape | OpKind::Flatten | OpKind::Transpose | OpKind::MaxPool2d | OpKind::Pad
    )
}

fn integerize(g: &mut Graph) -> Result<()> {
    let registry = OpRegistry::standard();
    let consumers = g.consumers();
    let original = std::mem::take(&mut g.nodes);
    let mut nodes: Vec<Node> = Vec::with_capacity(original.len());
    let mut absorbed: HashSet<NodeId> = HashSet::new();
    let mut dequantized: HashMap<TensorId, TensorId> = HashMap::new();

    for mut node in original.iter().cloned() {
        if absorbed.contains(&node.id) {
            continue;
        }
        if matches!(node.op, Op::Quantize | Op::Dequantize) {
            nodes.push(node);
            continue;
        }
        if try_integer(g, registry, &original, &consumers, &mut node, &mut absorbed)? {
            nodes.push(node);
            continue;
        }
        for i in 0..node.inputs.len() {
            let t = node.inputs[i];
            if !g.tensor(t).dtype.is_integer() {
                continue;
            }
            node.inputs[i] = match dequantized.get(&t) {
                Some(&f) => f,
                None => {
                    let f = dequantize(g, &mut nodes, t, node.scope)?;
                    dequantized.insert(t, f);
                    f
                }
            };
        }
        nodes.push(node);
    }

    for i in 0..g.outputs.len() {
        let t = g.outputs[i];
        if !g.tensor(t).dtype.is_integer() {
            continue;
        }
        g.outputs[i] = match dequantized.get(&t) {
            Some(&f) => f,
            None => {
                let f = dequantize(g, &mut nodes, t, ROOT_SCOPE)?;
                dequantized.insert(t, f);
                f
            }
        };
    }
    g.nodes = nodes;
    Ok(())
}

/// Switch `node` to integer execution if all of its activations are
/// quantized and its output parameters are known.
fn try_integer(
    g: &mut Graph,
    registry: &OpRegistry,
    original: &[Node],
    consumers: &[Vec<usize>],
    node: &mut Node,
    absorbed: &mut HashSet<NodeId>,
) -> Result<bool> {
    let kind = node.op.kind();
    if !registry.schema(kind).is_some_and(|s| s.quantizable) {
        return Ok(false);
    }
    let activations: Vec<TensorId> = node.inputs.iter().copied().filter(|&t| !g.is_constant(t)).collect();
    if activations.is_empty() || !activations.iter().all(|&t| is_quantized(g.tensor(t))) {
        return Ok(false);
    }
    let affine = matches!(kind, OpKind::Linear | OpKind::Conv2d);
    if affine && !node.inputs.get(1).is_some_and(|&w| is_quantized(g.tensor(w))) {
        return Ok(false);
    }
    if !affine && node.inputs.iter().any(|&t| g.is_constant(t) && !is_quantized(g.tensor(t))) {
        return Ok(false);
    }

    let out = node.outputs[0];
    let requantize = match consumers[out].as_slice() {
        [c] if matches!(original[*c].op, Op::Quantize) && !g.outputs.contains(&out) => Some(&original[*c]),
        _ => None,
    };
    match requantize {
        Some(q) => {
            node.outputs[0] = q.outputs[0];
            absorbed.insert(q.id);
        }
        None if preserves_qparams(kind) => {
            let source = g.tensor(activations[0]).clone();
            let t = g.tensor_mut(out);
            t.dtype = source.dtype;
            t.quant = source.quant;
        }
        None => return Ok(false),
    }

    if affine {
        if let Some(&b) = node.inputs.get(2) {
            if !g.tensor(b).dtype.is_integer() {
                let bias = g
                    .constant(b)
                    .ok_or_else(|| Error::InvalidGraph(format!("{} has a non-constant bias", node.id)))?;
                let input = g.tensor(node.inputs[0]).quant.clone();
                let weight = g.tensor(node.inputs[1]).quant.clone();
                if let (Some(input), Some(weight)) = (input, weight) {
                    let name = g.tensor(b).name.clone();
                    node.inputs[2] = add_int_bias(g, name, &bias, &input, &weight, Rounding::HalfToEven)?;
                }
            }
        }
    }
    debug!("{} ({kind}) runs in integer", node.id);
    Ok(true)
}

/// Float view of integer tensor `t`: a dequantized constant, or the output
/// of a new `Dequantize` node appended to `nodes`.
fn dequantize(g: &mut Graph, nodes: &mut Vec<Node>, t: TensorId, scope: usize) -> Result<TensorId> {
    let name = format!("{}.dequant", g.tensor(t).name);
    if let Some(value) = g.constant(t) {
        let params = g
            .tensor(t)
            .quant
            .clone()
            .ok_or_else(|| Error::InvalidGraph(format!("integer constant `{}` has no quantization", g.tensor(t).name)))?;
        return Ok(g.add_constant(name, params.dequantize(&value)?));
    }
    let f = g.add_like(t, name);
    let desc = g.tensor_mut(f);
    desc.dtype = DType::F32;
    desc.quant = None;
    nodes.push(g.make_node(Op::Dequantize, vec![t], vec![f], scope));
    Ok(f)
}
