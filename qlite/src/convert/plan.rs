//! Serialization plan.
//!
//! A field-for-field image of the TFLite model: every index is resolved and
//! every buffer is filled. Produced by `lower()` (or `read_model()`),
//! consumed by `render()`.

use crate::parse::tflite::schema::{ActivationFunctionType, BuiltinOperator, BuiltinOptions, Padding, TensorType};

#[derive(Debug, Clone, PartialEq)]
pub struct ModelPlan {
    pub version: u32,
    pub description: String,
    pub opcodes: Vec<OpcodePlan>,
    pub subgraphs: Vec<SubgraphPlan>,
    /// Buffer 0 is always empty.
    pub buffers: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpcodePlan {
    pub builtin: BuiltinOperator,
    pub version: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubgraphPlan {
    pub name: String,
    pub tensors: Vec<TensorPlan>,
    pub inputs: Vec<i32>,
    pub outputs: Vec<i32>,
    pub operators: Vec<OperatorPlan>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TensorPlan {
    pub name: String,
    pub shape: Vec<i32>,
    /// Shape with `-1` on dynamic axes; absent for fully static tensors.
    pub shape_signature: Option<Vec<i32>>,
    pub dtype: TensorType,
    pub buffer: u32,
    pub quant: Option<QuantPlan>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QuantPlan {
    pub scale: Vec<f32>,
    pub zero_point: Vec<i64>,
    pub quantized_dimension: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OperatorPlan {
    pub opcode_index: u32,
    pub inputs: Vec<i32>,
    pub outputs: Vec<i32>,
    pub options: Options,
}

/// Builtin options of one operator; the variant selects the union member.
#[derive(Debug, Clone, PartialEq)]
pub enum Options {
    None,
    Conv2D {
        padding: Padding,
        stride: [i32; 2],
        dilation: [i32; 2],
        activation: ActivationFunctionType,
    },
    DepthwiseConv2D {
        padding: Padding,
        stride: [i32; 2],
        dilation: [i32; 2],
        depth_multiplier: i32,
        activation: ActivationFunctionType,
    },
    Pool2D {
        padding: Padding,
        stride: [i32; 2],
        filter: [i32; 2],
        activation: ActivationFunctionType,
    },
    FullyConnected {
        activation: ActivationFunctionType,
        keep_num_dims: bool,
    },
    Softmax {
        beta: f32,
    },
    Concatenation {
        axis: i32,
        activation: ActivationFunctionType,
    },
    Add {
        activation: ActivationFunctionType,
    },
    Sub {
        activation: ActivationFunctionType,
    },
    Mul {
        activation: ActivationFunctionType,
    },
    Div {
        activation: ActivationFunctionType,
    },
    Reshape {
        new_shape: Vec<i32>,
    },
    Reducer {
        keep_dims: bool,
    },
    Pad,
    Transpose,
    Quantize,
    Dequantize,
    MaximumMinimum,
    HardSwish,
}

impl Options {
    pub fn tag(&self) -> BuiltinOptions {
        match self {
            Options::None => BuiltinOptions::NONE,
            Options::Conv2D { .. } => BuiltinOptions::Conv2DOptions,
            Options::DepthwiseConv2D { .. } => BuiltinOptions::DepthwiseConv2DOptions,
            Options::Pool2D { .. } => BuiltinOptions::Pool2DOptions,
            Options::FullyConnected { .. } => BuiltinOptions::FullyConnectedOptions,
            Options::Softmax { .. } => BuiltinOptions::SoftmaxOptions,
            Options::Concatenation { .. } => BuiltinOptions::ConcatenationOptions,
            Options::Add { .. } => BuiltinOptions::AddOptions,
            Options::Sub { .. } => BuiltinOptions::SubOptions,
            Options::Mul { .. } => BuiltinOptions::MulOptions,
            Options::Div { .. } => BuiltinOptions::DivOptions,
            Options::Reshape { .. } => BuiltinOptions::ReshapeOptions,
            Options::Reducer { .. } => BuiltinOptions::ReducerOptions,
            Options::Pad => BuiltinOptions::PadOptions,
            Options::Transpose => BuiltinOptions::TransposeOptions,
            Options::Quantize => BuiltinOptions::QuantizeOptions,
            Options::Dequantize => BuiltinOptions::DequantizeOptions,
            Options::MaximumMinimum => BuiltinOptions::MaximumMinimumOptions,
            Options::HardSwish => BuiltinOptions::HardSwishOptions,
        }
    }
}

impl ModelPlan {
    /// Opcode of operator `op` in subgraph 0.
    pub fn opcode_of(&self, op: &OperatorPlan) -> Option<OpcodePlan> {
        self.opcodes.get(op.opcode_index as usize).copied()
    }

    /// Builtin codes of subgraph 0's operators, in execution order.
    pub fn builtins(&self) -> Vec<BuiltinOperator> {
        self.subgraphs
            .first()
            .map(|sg| sg.operators.iter().filter_map(|op| self.opcode_of(op)).map(|c| c.builtin).collect())
            .unwrap_or_default()
    }
}
