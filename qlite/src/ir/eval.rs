//! Float semantics of every [`Op`], shared by the tracer and the interpreter.
//!
//! Kernels run channel-first. Nodes tagged channel-last have their
//! activations (and spatial weights) permuted around the kernel call.

use std::sync::Arc;

use qlite_kernels::kernels::naive::{self, Window};
use qlite_kernels::kernels::{self as k, broadcast_shape};

use super::graph::Layout;
use super::op::{Activation, Conv2dAttrs, Op, PoolAttrs};
use crate::error::{Error, Result};
use crate::quant::observer::FakeQuant;
use crate::tensor::{HostTensor, TensorData};

pub const NCHW_TO_NHWC: [usize; 4] = [0, 2, 3, 1];
pub const NHWC_TO_NCHW: [usize; 4] = [0, 3, 1, 2];

fn bad(msg: String) -> Error {
    Error::InvalidTensor(msg)
}

fn f32_tensor(shape: Vec<usize>, values: Vec<f32>) -> HostTensor {
    HostTensor {
        shape,
        data: TensorData::F32(Arc::new(values)),
    }
}

fn operand(inputs: &[HostTensor], i: usize) -> Result<&HostTensor> {
    inputs
        .get(i)
        .ok_or_else(|| bad(format!("missing operand {i}")))
}

/// Evaluate `op` on float operands.
pub fn eval(op: &Op, inputs: &[HostTensor], layout: Layout) -> Result<Vec<HostTensor>> {
    let x = operand(inputs, 0)?;
    let out = match op {
        Op::Conv2d { attrs, fused } => {
            let bias = inputs.get(2);
            in_layout(x, layout, |x| {
                let w = weight_to_oihw(operand(inputs, 1)?, attrs, layout)?;
                conv2d(x, &w, bias, attrs, *fused)
            })?
        }
        Op::Linear { fused } => linear(x, operand(inputs, 1)?, inputs.get(2), *fused)?,
        Op::BatchNorm2d { eps } => in_layout(x, layout, |x| {
            batch_norm(x, &inputs[1..], *eps)
        })?,
        Op::MaxPool2d(p) => in_layout(x, layout, |x| pool(x, p, true))?,
        Op::AvgPool2d(p) => in_layout(x, layout, |x| pool(x, p, false))?,
        Op::Mean { axes, keep_dims } => mean(x, axes, *keep_dims)?,
        Op::Add { .. } | Op::Sub { .. } | Op::Mul { .. } | Op::Div { .. } | Op::Maximum | Op::Minimum => {
            let (bin, fused) = op.binary().ok_or_else(|| bad("not a binary op".into()))?;
            let y = operand(inputs, 1)?;
            let shape = broadcast_shape(&x.shape, &y.shape).ok_or_else(|| {
                bad(format!("cannot broadcast {:?} with {:?}", x.shape, y.shape))
            })?;
            let mut out = vec![0.0; shape.iter().product()];
            k::binary(bin, x.as_f32()?, &x.shape, y.as_f32()?, &y.shape, &mut out, &shape);
            k::unary(fused.unary(), &mut out);
            f32_tensor(shape, out)
        }
        Op::Relu | Op::Relu6 | Op::Clamp { .. } | Op::Sigmoid | Op::Tanh | Op::Hardswish | Op::Identity => {
            let unary = op.unary().ok_or_else(|| bad("not a unary op".into()))?;
            let mut out = x.as_f32()?.to_vec();
            k::unary(unary, &mut out);
            f32_tensor(x.shape.clone(), out)
        }
        Op::Softmax { axis } => {
            if *axis >= x.rank() {
                return Err(bad(format!("softmax axis {axis} out of range for {:?}", x.shape)));
            }
            let outer = x.shape[..*axis].iter().product();
            let inner = x.shape[axis + 1..].iter().product();
            let mut out = vec![0.0; x.numel()];
            naive::softmax(x.as_f32()?, outer, x.shape[*axis], inner, &mut out);
            f32_tensor(x.shape.clone(), out)
        }
        Op::Reshape { shape } => x.reshape(resolve_batch(shape, x.numel()))?,
        Op::Flatten { start_dim } => {
            if *start_dim > x.rank() {
                return Err(bad(format!("flatten start_dim {start_dim} exceeds rank {}", x.rank())));
            }
            let mut shape = x.shape[..*start_dim].to_vec();
            shape.push(x.shape[*start_dim..].iter().product());
            x.reshape(shape)?
        }
        Op::Transpose { perm } => x.permute(perm)?,
        Op::Concat { axis } => concat(inputs, *axis)?,
        Op::Pad { pads, value } => {
            if pads.len() != x.rank() {
                return Err(bad(format!("{} pad pairs for rank {}", pads.len(), x.rank())));
            }
            let shape: Vec<usize> = x.shape.iter().zip(pads).map(|(d, p)| d + p[0] + p[1]).collect();
            let mut out = vec![0.0; shape.iter().product()];
            naive::pad(x.as_f32()?, &x.shape, pads, *value, &mut out);
            f32_tensor(shape, out)
        }
        Op::FakeQuantize(fq) => {
            if fq.is_ready() {
                fq.apply(x)?
            } else {
                x.clone()
            }
        }
        Op::Quantize | Op::Dequantize => x.clone(),
        Op::QatLinear(qat) => {
            let w = fake_quant_weight(&qat.weight, operand(inputs, 1)?)?;
            linear(x, &w, inputs.get(2), qat.fused)?
        }
        Op::QatConv2d(qat) => {
            let (w, bias) = qat_conv_params(qat, inputs)?;
            let w = fake_quant_weight(&qat.weight, &w)?;
            in_layout(x, layout, |x| conv2d(x, &w, bias.as_ref(), &qat.conv, qat.fused))?
        }
    };
    Ok(vec![out])
}

/// Run `f` on a channel-first view of `x`, converting back afterwards.
fn in_layout(x: &HostTensor, layout: Layout, f: impl FnOnce(&HostTensor) -> Result<HostTensor>) -> Result<HostTensor> {
    match layout {
        Layout::ChannelFirst => f(x),
        Layout::ChannelLast => {
            let y = f(&x.permute(&NHWC_TO_NCHW)?)?;
            y.permute(&NCHW_TO_NHWC)
        }
    }
}

/// Conv weights for the kernel: OHWI (or `[1, H, W, C]` depthwise) back to OIHW.
fn weight_to_oihw(w: &HostTensor, attrs: &Conv2dAttrs, layout: Layout) -> Result<HostTensor> {
    match layout {
        Layout::ChannelFirst => Ok(w.clone()),
        Layout::ChannelLast if attrs.groups > 1 => w.permute(&[3, 0, 1, 2]),
        Layout::ChannelLast => w.permute(&NHWC_TO_NCHW),
    }
}

fn dims4(t: &HostTensor, what: &str) -> Result<[usize; 4]> {
    <[usize; 4]>::try_from(t.shape.as_slice())
        .map_err(|_| bad(format!("{what} must be rank 4, got {:?}", t.shape)))
}

pub fn conv2d(
    x: &HostTensor,
    w: &HostTensor,
    bias: Option<&HostTensor>,
    attrs: &Conv2dAttrs,
    fused: Activation,
) -> Result<HostTensor> {
    let [n, ci, h, wd] = dims4(x, "conv2d input")?;
    let [co, ci_g, kh, kw] = dims4(w, "conv2d weight")?;
    if attrs.groups == 0 || ci != ci_g * attrs.groups || co % attrs.groups != 0 {
        return Err(bad(format!(
            "conv2d: input {:?} and weight {:?} disagree for groups={}",
            x.shape, w.shape, attrs.groups
        )));
    }
    let window = Window {
        kernel: [kh, kw],
        stride: attrs.stride,
        padding: attrs.padding,
        dilation: attrs.dilation,
    };
    let [ho, wo] = window
        .output_hw(h, wd, false)
        .ok_or_else(|| bad(format!("conv2d: kernel {kh}x{kw} does not fit input {h}x{wd}")))?;
    let bias = bias.map(|b| b.as_f32()).transpose()?;
    if let Some(b) = bias {
        if b.len() != co {
            return Err(bad(format!("conv2d: {} bias values for {co} channels", b.len())));
        }
    }
    let mut out = vec![0.0; n * co * ho * wo];
    naive::conv2d(
        x.as_f32()?,
        [n, ci, h, wd],
        w.as_f32()?,
        [co, ci_g, kh, kw],
        bias,
        &window,
        attrs.groups,
        &mut out,
        [n, co, ho, wo],
    );
    k::unary(fused.unary(), &mut out);
    Ok(f32_tensor(vec![n, co, ho, wo], out))
}

pub fn linear(x: &HostTensor, w: &HostTensor, bias: Option<&HostTensor>, fused: Activation) -> Result<HostTensor> {
    let (out_features, in_features) = match w.shape.as_slice() {
        [o, i] => (*o, *i),
        other => return Err(bad(format!("linear weight must be rank 2, got {other:?}"))),
    };
    if x.shape.last() != Some(&in_features) {
        return Err(bad(format!(
            "linear: input {:?} does not end in {in_features} features",
            x.shape
        )));
    }
    let rows = x.numel() / in_features;
    let bias = bias.map(|b| b.as_f32()).transpose()?;
    let mut out = vec![0.0; rows * out_features];
    naive::fully_connected(x.as_f32()?, rows, in_features, w.as_f32()?, bias, &mut out, out_features);
    k::unary(fused.unary(), &mut out);
    let mut shape = x.shape.clone();
    if let Some(last) = shape.last_mut() {
        *last = out_features;
    }
    Ok(f32_tensor(shape, out))
}

fn batch_norm(x: &HostTensor, params: &[HostTensor], eps: f32) -> Result<HostTensor> {
    let [mean, var, gamma, beta] = params else {
        return Err(bad(format!("batch_norm takes 4 parameter tensors, got {}", params.len())));
    };
    if x.rank() < 2 {
        return Err(bad(format!("batch_norm input must have a channel axis, got {:?}", x.shape)));
    }
    let (n, c) = (x.shape[0], x.shape[1]);
    let inner = x.shape[2..].iter().product();
    let mut out = vec![0.0; x.numel()];
    naive::batch_norm(
        x.as_f32()?,
        n,
        c,
        inner,
        mean.as_f32()?,
        var.as_f32()?,
        gamma.as_f32()?,
        beta.as_f32()?,
        eps,
        &mut out,
    );
    Ok(f32_tensor(x.shape.clone(), out))
}

/// Per-channel scale and shift equivalent to an inference batch norm.
pub fn bn_scale_shift(params: &[HostTensor], eps: f32) -> Result<(Vec<f32>, Vec<f32>)> {
    let [mean, var, gamma, beta] = params else {
        return Err(bad(format!("batch_norm takes 4 parameter tensors, got {}", params.len())));
    };
    let (mean, var, gamma, beta) = (mean.as_f32()?, var.as_f32()?, gamma.as_f32()?, beta.as_f32()?);
    let scale: Vec<f32> = var.iter().zip(gamma).map(|(v, g)| g / (v + eps).sqrt()).collect();
    let shift = mean.iter().zip(beta).zip(&scale).map(|((m, b), s)| b - m * s).collect();
    Ok((scale, shift))
}

/// Fold batch-norm statistics into conv weights `[Co, ...]` and bias.
pub fn fold_batch_norm(
    weight: &HostTensor,
    bias: Option<&HostTensor>,
    params: &[HostTensor],
    eps: f32,
) -> Result<(HostTensor, HostTensor)> {
    let (scale, shift) = bn_scale_shift(params, eps)?;
    let co = weight.shape.first().copied().unwrap_or(0);
    if scale.len() != co {
        return Err(bad(format!("{} batch-norm channels for {co} filters", scale.len())));
    }
    let per_filter = weight.numel() / co.max(1);
    let w: Vec<f32> = weight
        .as_f32()?
        .iter()
        .enumerate()
        .map(|(i, v)| v * scale[i / per_filter])
        .collect();
    let b = match bias {
        Some(b) => b.as_f32()?.to_vec(),
        None => vec![0.0; co],
    };
    let b: Vec<f32> = (0..co).map(|c| b[c] * scale[c] + shift[c]).collect();
    Ok((f32_tensor(weight.shape.clone(), w), f32_tensor(vec![co], b)))
}

/// Effective weight and bias of a QAT convolution (batch norm folded).
pub fn qat_conv_params(qat: &super::op::QatConv, inputs: &[HostTensor]) -> Result<(HostTensor, Option<HostTensor>)> {
    let w = operand(inputs, 1)?;
    let bias = if qat.has_bias { Some(operand(inputs, 2)?) } else { None };
    let bn_start = if qat.has_bias { 3 } else { 2 };
    match qat.bn_eps {
        Some(eps) => {
            let params = inputs
                .get(bn_start..bn_start + 4)
                .ok_or_else(|| bad("qat conv is missing batch-norm operands".into()))?;
            let (w, b) = fold_batch_norm(w, bias, params, eps)?;
            Ok((w, Some(b)))
        }
        None => Ok((w.clone(), bias.cloned())),
    }
}

fn fake_quant_weight(spec: &crate::quant::config::QuantSpec, w: &HostTensor) -> Result<HostTensor> {
    let mut fq = FakeQuant::new(*spec);
    fq.observe(w)?;
    fq.apply(w)
}

fn pool(x: &HostTensor, p: &PoolAttrs, max: bool) -> Result<HostTensor> {
    let [n, c, h, w] = dims4(x, "pool input")?;
    let window = Window::new(p.kernel, p.stride, p.padding);
    let [ho, wo] = window
        .output_hw(h, w, p.ceil_mode)
        .ok_or_else(|| bad(format!("pool window {:?} does not fit input {h}x{w}", p.kernel)))?;
    let mut out = vec![0.0; n * c * ho * wo];
    if max {
        naive::max_pool2d(x.as_f32()?, [n, c, h, w], &window, &mut out, [n, c, ho, wo]);
    } else {
        naive::avg_pool2d(x.as_f32()?, [n, c, h, w], &window, p.count_include_pad, &mut out, [n, c, ho, wo]);
    }
    k::unary(p.fused.unary(), &mut out);
    Ok(f32_tensor(vec![n, c, ho, wo], out))
}

fn mean(x: &HostTensor, axes: &[usize], keep_dims: bool) -> Result<HostTensor> {
    if axes.iter().any(|&a| a >= x.rank()) {
        return Err(bad(format!("mean axes {axes:?} out of range for {:?}", x.shape)));
    }
    let kept: Vec<usize> = x
        .shape
        .iter()
        .enumerate()
        .map(|(i, &d)| if axes.contains(&i) { 1 } else { d })
        .collect();
    let mut out = vec![0.0; kept.iter().product()];
    naive::reduce_mean(x.as_f32()?, &x.shape, axes, &mut out);
    let shape = if keep_dims {
        kept
    } else {
        x.shape
            .iter()
            .enumerate()
            .filter(|(i, _)| !axes.contains(i))
            .map(|(_, &d)| d)
            .collect()
    };
    Ok(f32_tensor(shape, out))
}

fn concat(inputs: &[HostTensor], axis: usize) -> Result<HostTensor> {
    let first = operand(inputs, 0)?;
    if axis >= first.rank() {
        return Err(bad(format!("concat axis {axis} out of range for {:?}", first.shape)));
    }
    for t in inputs {
        let same = t.rank() == first.rank()
            && t.shape.iter().zip(&first.shape).enumerate().all(|(i, (a, b))| i == axis || a == b);
        if !same {
            return Err(bad(format!("cannot concat {:?} with {:?} on axis {axis}", t.shape, first.shape)));
        }
    }
    let outer: usize = first.shape[..axis].iter().product();
    let mut shape = first.shape.clone();
    shape[axis] = inputs.iter().map(|t| t.shape[axis]).sum();
    let mut out = Vec::with_capacity(shape.iter().product());
    let slices: Vec<&[f32]> = inputs.iter().map(|t| t.as_f32()).collect::<Result<_>>()?;
    let chunks: Vec<usize> = inputs.iter().map(|t| t.numel() / outer.max(1)).collect();
    for o in 0..outer {
        for (s, &len) in slices.iter().zip(&chunks) {
            out.extend_from_slice(&s[o * len..(o + 1) * len]);
        }
    }
    Ok(f32_tensor(shape, out))
}

/// Re-derive axis 0 of a traced reshape target when the batch size changed.
fn resolve_batch(shape: &[usize], numel: usize) -> Vec<usize> {
    let target: usize = shape.iter().product();
    if target == numel || shape.is_empty() {
        return shape.to_vec();
    }
    let rest: usize = shape[1..].iter().product();
    let mut resolved = shape.to_vec();
    if rest > 0 && numel % rest == 0 {
        resolved[0] = numel / rest;
    }
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(shape: Vec<usize>, values: Vec<f32>) -> HostTensor {
        HostTensor::new(shape, values).unwrap()
    }

    #[test]
    fn test_linear_with_fused_relu6() {
        let x = t(vec![1, 3], vec![1.0, -2.0, 3.0]);
        let w = t(vec![3, 3], vec![1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 1.0, 0.0]);
        let b = t(vec![3], vec![0.0, 4.0, 0.0]);
        let out = &eval(&Op::Linear { fused: Activation::Relu6 }, &[x, w, b], Layout::ChannelFirst).unwrap()[0];
        assert_eq!(out.to_f32_vec(), vec![1.0, 6.0, 0.0]);
    }

    #[test]
    fn test_conv_channel_last_matches_channel_first() {
        let x = t(vec![1, 2, 3, 3], (0..18).map(|v| v as f32 * 0.1).collect());
        let w = t(vec![2, 2, 2, 2], (0..16).map(|v| (v as f32 - 8.0) * 0.05).collect());
        let op = Op::Conv2d {
            attrs: Conv2dAttrs {
                padding: [1, 1],
                ..Default::default()
            },
            fused: Activation::None,
        };
        let nchw = &eval(&op, &[x.clone(), w.clone()], Layout::ChannelFirst).unwrap()[0];
        let x_nhwc = x.permute(&NCHW_TO_NHWC).unwrap();
        let w_ohwi = w.permute(&NCHW_TO_NHWC).unwrap();
        let nhwc = &eval(&op, &[x_nhwc, w_ohwi], Layout::ChannelLast).unwrap()[0];
        let back = nhwc.permute(&NHWC_TO_NCHW).unwrap();
        assert!(back.max_abs_diff(nchw) < 1e-6);
    }

    #[test]
    fn test_fold_batch_norm_matches_sequence() {
        let x = t(vec![1, 1, 2, 2], vec![1.0, 2.0, 3.0, 4.0]);
        let w = t(vec![1, 1, 1, 1], vec![2.0]);
        let bn = [
            t(vec![1], vec![1.0]),
            t(vec![1], vec![4.0]),
            t(vec![1], vec![3.0]),
            t(vec![1], vec![0.5]),
        ];
        let conv = conv2d(&x, &w, None, &Conv2dAttrs::default(), Activation::None).unwrap();
        let reference = batch_norm(&conv, &bn, 0.0).unwrap();
        let (fw, fb) = fold_batch_norm(&w, None, &bn, 0.0).unwrap();
        let folded = conv2d(&x, &fw, Some(&fb), &Conv2dAttrs::default(), Activation::None).unwrap();
        assert!(folded.max_abs_diff(&reference) < 1e-6);
    }

    #[test]
    fn test_concat_axis1() {
        let a = t(vec![1, 1, 2], vec![1.0, 2.0]);
        let b = t(vec![1, 2, 2], vec![3.0, 4.0, 5.0, 6.0]);
        let out = &eval(&Op::Concat { axis: 1 }, &[a, b], Layout::ChannelFirst).unwrap()[0];
        assert_eq!(out.shape, vec![1, 3, 2]);
        assert_eq!(out.to_f32_vec(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_reshape_follows_batch() {
        let x = t(vec![4, 2], vec![0.0; 8]);
        let out = &eval(&Op::Reshape { shape: vec![1, 2] }, &[x], Layout::ChannelFirst).unwrap()[0];
        assert_eq!(out.shape, vec![4, 2]);
    }

    #[test]
    fn test_mean_drops_axes() {
        let x = t(vec![1, 2, 1, 2], vec![1.0, 3.0, 5.0, 7.0]);
        let op = Op::Mean {
            axes: vec![2, 3],
            keep_dims: false,
        };
        let out = &eval(&op, &[x], Layout::ChannelFirst).unwrap()[0];
        assert_eq!(out.shape, vec![1, 2]);
        assert_eq!(out.to_f32_vec(), vec![2.0, 6.0]);
    }

    #[test]
    fn test_broadcast_error() {
        let a = t(vec![2, 3], vec![0.0; 6]);
        let b = t(vec![4], vec![0.0; 4]);
        assert!(eval(&Op::Add { fused: Activation::None }, &[a, b], Layout::ChannelFirst).is_err());
    }
}
