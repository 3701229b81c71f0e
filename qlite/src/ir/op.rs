//! Operator kinds and their attributes.

use std::fmt;

use qlite_kernels::kernels::{BinaryOp, UnaryOp};
use serde::{Deserialize, Serialize};

use crate::quant::config::QuantSpec;
use crate::quant::observer::FakeQuant;

/// Activation folded into the producing operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    #[default]
    None,
    Relu,
    Relu6,
    ReluN1To1,
}

impl Activation {
    pub fn unary(self) -> UnaryOp {
        match self {
            Activation::None => UnaryOp::Identity,
            Activation::Relu => UnaryOp::Relu,
            Activation::Relu6 => UnaryOp::Relu6,
            Activation::ReluN1To1 => UnaryOp::Clamp {
                min: -1.0,
                max: 1.0,
            },
        }
    }

    pub fn is_none(self) -> bool {
        self == Activation::None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conv2dAttrs {
    pub stride: [usize; 2],
    pub padding: [usize; 2],
    pub dilation: [usize; 2],
    pub groups: usize,
}

impl Default for Conv2dAttrs {
    fn default() -> Self {
        Self {
            stride: [1, 1],
            padding: [0, 0],
            dilation: [1, 1],
            groups: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolAttrs {
    pub kernel: [usize; 2],
    pub stride: [usize; 2],
    pub padding: [usize; 2],
    pub ceil_mode: bool,
    pub count_include_pad: bool,
    #[serde(default)]
    pub fused: Activation,
}

/// Quantization-aware convolution: conv with optional folded batch norm.
///
/// Inputs: `x, weight, [bias]` followed by `mean, var, gamma, beta` when
/// `bn_eps` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QatConv {
    pub conv: Conv2dAttrs,
    pub has_bias: bool,
    pub bn_eps: Option<f32>,
    pub fused: Activation,
    pub weight: QuantSpec,
}

/// Quantization-aware linear layer. Inputs: `x, weight, [bias]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QatLinear {
    pub fused: Activation,
    pub weight: QuantSpec,
}

/// A graph operator with its attributes.
///
/// Tensor operands (weights, biases, batch-norm statistics) are node inputs,
/// never attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    /// `x, weight [Co, Ci/groups, Kh, Kw], [bias]`
    Conv2d {
        attrs: Conv2dAttrs,
        #[serde(default)]
        fused: Activation,
    },
    /// `x, weight [out, in], [bias]`
    Linear {
        #[serde(default)]
        fused: Activation,
    },
    /// `x, mean, var, gamma, beta`
    BatchNorm2d { eps: f32 },
    MaxPool2d(PoolAttrs),
    AvgPool2d(PoolAttrs),
    Mean { axes: Vec<usize>, keep_dims: bool },
    Add {
        #[serde(default)]
        fused: Activation,
    },
    Sub {
        #[serde(default)]
        fused: Activation,
    },
    Mul {
        #[serde(default)]
        fused: Activation,
    },
    Div {
        #[serde(default)]
        fused: Activation,
    },
    Maximum,
    Minimum,
    Relu,
    Relu6,
    Clamp { min: f32, max: f32 },
    Sigmoid,
    Tanh,
    Hardswish,
    Softmax { axis: usize },
    /// Target shape with every axis resolved.
    Reshape { shape: Vec<usize> },
    Flatten { start_dim: usize },
    Transpose { perm: Vec<usize> },
    Concat { axis: usize },
    /// `pads[axis] = [before, after]`
    Pad { pads: Vec<[usize; 2]>, value: f32 },
    Identity,
    FakeQuantize(FakeQuant),
    /// Float → integer, parameters on the output descriptor.
    Quantize,
    /// Integer → float, parameters on the input descriptor.
    Dequantize,
    QatLinear(QatLinear),
    QatConv2d(QatConv),
}

/// Field-less discriminant of [`Op`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OpKind {
    Conv2d,
    Linear,
    BatchNorm2d,
    MaxPool2d,
    AvgPool2d,
    Mean,
    Add,
    Sub,
    Mul,
    Div,
    Maximum,
    Minimum,
    Relu,
    Relu6,
    Clamp,
    Sigmoid,
    Tanh,
    Hardswish,
    Softmax,
    Reshape,
    Flatten,
    Transpose,
    Concat,
    Pad,
    Identity,
    FakeQuantize,
    Quantize,
    Dequantize,
    QatLinear,
    QatConv2d,
}

impl Op {
    pub fn kind(&self) -> OpKind {
        match self {
            Op::Conv2d { .. } => OpKind::Conv2d,
            Op::Linear { .. } => OpKind::Linear,
            Op::BatchNorm2d { .. } => OpKind::BatchNorm2d,
            Op::MaxPool2d(_) => OpKind::MaxPool2d,
            Op::AvgPool2d(_) => OpKind::AvgPool2d,
            Op::Mean { .. } => OpKind::Mean,
            Op::Add { .. } => OpKind::Add,
            Op::Sub { .. } => OpKind::Sub,
            Op::Mul { .. } => OpKind::Mul,
            Op::Div { .. } => OpKind::Div,
            Op::Maximum => OpKind::Maximum,
            Op::Minimum => OpKind::Minimum,
            Op::Relu => OpKind::Relu,
            Op::Relu6 => OpKind::Relu6,
            Op::Clamp { .. } => OpKind::Clamp,
            Op::Sigmoid => OpKind::Sigmoid,
            Op::Tanh => OpKind::Tanh,
            Op::Hardswish => OpKind::Hardswish,
            Op::Softmax { .. } => OpKind::Softmax,
            Op::Reshape { .. } => OpKind::Reshape,
            Op::Flatten { .. } => OpKind::Flatten,
            Op::Transpose { .. } => OpKind::Transpose,
            Op::Concat { .. } => OpKind::Concat,
            Op::Pad { .. } => OpKind::Pad,
            Op::Identity => OpKind::Identity,
            Op::FakeQuantize(_) => OpKind::FakeQuantize,
            Op::Quantize => OpKind::Quantize,
            Op::Dequantize => OpKind::Dequantize,
            Op::QatLinear(_) => OpKind::QatLinear,
            Op::QatConv2d(_) => OpKind::QatConv2d,
        }
    }

    /// Broadcasting binary op and its fused activation, if this is one.
    pub fn binary(&self) -> Option<(BinaryOp, Activation)> {
        match *self {
            Op::Add { fused } => Some((BinaryOp::Add, fused)),
            Op::Sub { fused } => Some((BinaryOp::Sub, fused)),
            Op::Mul { fused } => Some((BinaryOp::Mul, fused)),
            Op::Div { fused } => Some((BinaryOp::Div, fused)),
            Op::Maximum => Some((BinaryOp::Maximum, Activation::None)),
            Op::Minimum => Some((BinaryOp::Minimum, Activation::None)),
            _ => None,
        }
    }

    /// Element-wise unary op, if this is one.
    pub fn unary(&self) -> Option<UnaryOp> {
        match *self {
            Op::Relu => Some(UnaryOp::Relu),
            Op::Relu6 => Some(UnaryOp::Relu6),
            Op::Clamp { min, max } => Some(UnaryOp::Clamp { min, max }),
            Op::Sigmoid => Some(UnaryOp::Sigmoid),
            Op::Tanh => Some(UnaryOp::Tanh),
            Op::Hardswish => Some(UnaryOp::Hardswish),
            Op::Identity => Some(UnaryOp::Identity),
            _ => None,
        }
    }

    /// Mutable slot for a fused activation, on ops that can carry one.
    pub fn fused_mut(&mut self) -> Option<&mut Activation> {
        match self {
            Op::Conv2d { fused, .. }
            | Op::Linear { fused }
            | Op::Add { fused }
            | Op::Sub { fused }
            | Op::Mul { fused }
            | Op::Div { fused } => Some(fused),
            Op::MaxPool2d(p) | Op::AvgPool2d(p) => Some(&mut p.fused),
            _ => None,
        }
    }

    /// Activation an element-wise node computes, when it can be fused.
    pub fn as_activation(&self) -> Option<Activation> {
        match *self {
            Op::Relu => Some(Activation::Relu),
            Op::Relu6 => Some(Activation::Relu6),
            Op::Clamp { min, max } if min == 0.0 && max == 6.0 => Some(Activation::Relu6),
            Op::Clamp { min, max } if min == -1.0 && max == 1.0 => Some(Activation::ReluN1To1),
            Op::Clamp { min, max } if min == 0.0 && max == f32::INFINITY => Some(Activation::Relu),
            _ => None,
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Conv2d { attrs, fused } => write!(
                f,
                "conv2d(stride={:?}, padding={:?}, dilation={:?}, groups={}, act={fused:?})",
                attrs.stride, attrs.padding, attrs.dilation, attrs.groups
            ),
            Op::Linear { fused } => write!(f, "linear(act={fused:?})"),
            Op::MaxPool2d(p) => write!(f, "max_pool2d(kernel={:?}, stride={:?})", p.kernel, p.stride),
            Op::AvgPool2d(p) => write!(f, "avg_pool2d(kernel={:?}, stride={:?})", p.kernel, p.stride),
            Op::Reshape { shape } => write!(f, "reshape({shape:?})"),
            Op::Transpose { perm } => write!(f, "transpose({perm:?})"),
            Op::FakeQuantize(fq) => write!(f, "fake_quantize({})", fq.spec.dtype),
            other => write!(f, "{}", other.kind()),
        }
    }
}
