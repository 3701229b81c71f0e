//! Graph → serialization plan.

use std::collections::HashMap;

use log::debug;

use super::plan::*;
use super::QuantizedElementType;
use crate::error::{Error, Result};
use crate::ir::interp::RUNTIME_ROUNDING;
use crate::ir::{Activation, Conv2dAttrs, Graph, Layout, Node, Op, PoolAttrs, QuantParams, Tensor, TensorId, TensorKind};
use crate::parse::tflite::schema::{ActivationFunctionType, BuiltinOperator, Padding, TensorType, SCHEMA_VERSION};
use crate::registry::OpRegistry;
use crate::tensor::{DType, HostTensor};

/// Build the plan for a finalized graph.
///
/// Tensor indices follow the graph's tensor order; auxiliary constants
/// (shapes, permutations, zero biases) are appended after them.
pub fn lower(graph: &Graph, target: QuantizedElementType, description: &str) -> Result<ModelPlan> {
    let mut l = Lowering {
        graph,
        registry: OpRegistry::standard(),
        target,
        tensors: Vec::with_capacity(graph.tensors.len()),
        buffers: vec![Vec::new()],
        opcodes: Vec::new(),
        opcode_index: HashMap::new(),
        operators: Vec::new(),
    };
    for t in &graph.tensors {
        let plan = l.tensor_plan(t)?;
        l.tensors.push(plan);
    }
    for node in &graph.nodes {
        l.lower_node(node)?;
    }
    debug!(
        "lowered {} nodes to {} operators over {} tensors",
        graph.nodes.len(),
        l.operators.len(),
        l.tensors.len()
    );
    let index = |ids: &[TensorId]| -> Vec<i32> { ids.iter().map(|&t| t as i32).collect() };
    Ok(ModelPlan {
        version: SCHEMA_VERSION,
        description: description.to_string(),
        opcodes: l.opcodes,
        subgraphs: vec![SubgraphPlan {
            name: "main".to_string(),
            tensors: l.tensors,
            inputs: index(&graph.inputs[..]),
            outputs: index(&graph.outputs[..]),
            operators: l.operators,
        }],
        buffers: l.buffers,
    })
}

struct Lowering<'g> {
    graph: &'g Graph,
    registry: &'static OpRegistry,
    target: QuantizedElementType,
    tensors: Vec<TensorPlan>,
    buffers: Vec<Vec<u8>>,
    opcodes: Vec<OpcodePlan>,
    opcode_index: HashMap<OpcodePlan, u32>,
    operators: Vec<OperatorPlan>,
}

fn activation(a: Activation) -> ActivationFunctionType {
    match a {
        Activation::None => ActivationFunctionType::NONE,
        Activation::Relu => ActivationFunctionType::RELU,
        Activation::Relu6 => ActivationFunctionType::RELU6,
        Activation::ReluN1To1 => ActivationFunctionType::RELU_N1_TO_1,
    }
}

/// TFLite padding mode reproducing symmetric padding `pad` on one axis, if
/// any does.
fn padding_mode(input: usize, kernel: usize, stride: usize, dilation: usize, pad: usize, output: usize) -> Option<Padding> {
    let extent = (kernel - 1) * dilation + 1;
    if pad == 0 && input >= extent && output == (input - extent) / stride + 1 {
        return Some(Padding::VALID);
    }
    let same_out = input.div_ceil(stride);
    let total = ((same_out - 1) * stride + extent).saturating_sub(input);
    (output == same_out && total / 2 == pad).then_some(Padding::SAME)
}

fn both_axes(modes: [Option<Padding>; 2]) -> Option<Padding> {
    match modes {
        [Some(a), Some(b)] if a == b => Some(a),
        _ => None,
    }
}

impl<'g> Lowering<'g> {
    fn unsupported(&self, node: &Node, reason: impl Into<String>) -> Error {
        Error::UnsupportedOperatorForTarget {
            node: node.id.0,
            op: node.op.kind().to_string(),
            scope: self.graph.scope_path(node.scope).to_string(),
            reason: reason.into(),
        }
    }

    fn tensor(&self, t: TensorId) -> &'g Tensor {
        self.graph.tensor(t)
    }

    fn shape(&self, t: TensorId) -> &'g [usize] {
        &self.graph.tensor(t).shape
    }

    fn retype_u8(&self, dtype: DType) -> bool {
        self.target == QuantizedElementType::UInt8 && dtype == DType::I8
    }

    fn tensor_type(&self, dtype: DType) -> TensorType {
        match dtype {
            DType::F32 => TensorType::FLOAT32,
            DType::I32 => TensorType::INT32,
            DType::I8 if self.retype_u8(dtype) => TensorType::UINT8,
            DType::I8 => TensorType::INT8,
            DType::U8 => TensorType::UINT8,
        }
    }

    fn quant_plan(&self, t: &Tensor) -> Result<Option<QuantPlan>> {
        let Some(q) = &t.quant else {
            return Ok(None);
        };
        if self.target == QuantizedElementType::UInt8 && q.is_per_channel() {
            return Err(Error::InvalidConfig(format!(
                "tensor `{}` is quantized per channel, which uint8 models cannot express",
                t.name
            )));
        }
        let shift = if self.retype_u8(t.dtype) { 128 } else { 0 };
        Ok(Some(QuantPlan {
            scale: q.scale.clone(),
            zero_point: q.zero_point.iter().map(|z| z + shift).collect(),
            quantized_dimension: q.axis.unwrap_or(0) as i32,
        }))
    }

    fn tensor_plan(&mut self, t: &Tensor) -> Result<TensorPlan> {
        let buffer = match t.constant() {
            Some(value) if self.retype_u8(t.dtype) => {
                let bytes = value.data.to_i64_vec().into_iter().map(|v| (v + 128) as u8).collect();
                self.push_buffer(bytes)
            }
            Some(value) => self.push_buffer(value.data.to_le_bytes()),
            None => 0,
        };
        let shape_signature = (!t.dynamic_axes.is_empty()).then(|| {
            t.shape
                .iter()
                .enumerate()
                .map(|(i, &d)| if t.dynamic_axes.contains(&i) { -1 } else { d as i32 })
                .collect()
        });
        Ok(TensorPlan {
            name: t.name.clone(),
            shape: t.shape.iter().map(|&d| d as i32).collect(),
            shape_signature,
            dtype: self.tensor_type(t.dtype),
            buffer,
            quant: self.quant_plan(t)?,
        })
    }

    fn push_buffer(&mut self, bytes: Vec<u8>) -> u32 {
        self.buffers.push(bytes);
        (self.buffers.len() - 1) as u32
    }

    fn push_tensor(&mut self, desc: &Tensor) -> Result<i32> {
        let plan = self.tensor_plan(desc)?;
        self.tensors.push(plan);
        Ok((self.tensors.len() - 1) as i32)
    }

    /// A constant with no graph tensor behind it: shape operands, zero
    /// biases, clamp bounds.
    fn aux_constant(&mut self, name: String, value: HostTensor, quant: Option<QuantParams>) -> Result<i32> {
        self.push_tensor(&Tensor {
            id: self.tensors.len(),
            name,
            dtype: value.dtype(),
            shape: value.shape,
            dynamic_axes: Vec::new(),
            kind: TensorKind::Constant { data: value.data },
            quant,
            layout: Layout::ChannelFirst,
        })
    }

    fn int32_constant(&mut self, name: String, shape: Vec<usize>, values: Vec<i32>) -> Result<i32> {
        self.aux_constant(name, HostTensor::from_i32(shape, values)?, None)
    }

    /// Intermediate with the dtype and quantization of `like`.
    fn aux_intermediate(&mut self, name: String, shape: Vec<usize>, like: TensorId) -> Result<i32> {
        let mut desc = self.tensor(like).clone();
        desc.id = self.tensors.len();
        desc.name = name;
        desc.shape = shape;
        desc.kind = TensorKind::Intermediate;
        desc.dynamic_axes.clear();
        self.push_tensor(&desc)
    }

    fn opcode(&mut self, builtin: BuiltinOperator, version: i32) -> u32 {
        let code = OpcodePlan { builtin, version };
        if let Some(&i) = self.opcode_index.get(&code) {
            return i;
        }
        let i = self.opcodes.len() as u32;
        self.opcodes.push(code);
        self.opcode_index.insert(code, i);
        i
    }

    /// Kernel version for `builtin` given the storage type of its main input.
    fn version(&self, builtin: BuiltinOperator, input: TensorId) -> i32 {
        let dtype = self.tensor(input).dtype;
        if dtype != DType::I8 || self.retype_u8(dtype) {
            return 1;
        }
        match builtin {
            BuiltinOperator::CONV_2D | BuiltinOperator::DEPTHWISE_CONV_2D => 3,
            BuiltinOperator::FULLY_CONNECTED => 4,
            _ => 2,
        }
    }

    /// FULLY_CONNECTED needs version 12 for per-channel int8 weights.
    fn fully_connected_version(&self, input: TensorId, weight: TensorId) -> i32 {
        let version = self.version(BuiltinOperator::FULLY_CONNECTED, input);
        let per_channel = self.tensor(weight).quant.as_ref().is_some_and(QuantParams::is_per_channel);
        if version == 4 && per_channel {
            12
        } else {
            version
        }
    }

    fn emit(&mut self, builtin: BuiltinOperator, version: i32, inputs: Vec<i32>, outputs: Vec<i32>, options: Options) {
        let opcode_index = self.opcode(builtin, version);
        self.operators.push(OperatorPlan {
            opcode_index,
            inputs,
            outputs,
            options,
        });
    }

    fn lower_node(&mut self, node: &Node) -> Result<()> {
        let schema = self.registry.schema(node.op.kind());
        let Some(builtin) = schema.and_then(|s| s.tflite) else {
            return Err(self.unsupported(node, "no TFLite builtin"));
        };
        let (x, y) = (node.inputs[0], node.outputs[0]);
        let mut version = self.version(builtin, x);
        let mut inputs: Vec<i32> = node.inputs.iter().map(|&t| t as i32).collect();
        let outputs: Vec<i32> = node.outputs.iter().map(|&t| t as i32).collect();
        let out_name = &self.tensor(y).name;

        let options = match &node.op {
            Op::Conv2d { attrs, fused } => return self.lower_conv(node, attrs, *fused),
            Op::Clamp { min, max } => return self.lower_clamp(node, *min, *max),
            Op::Linear { fused } => {
                let units = self.shape(node.inputs[1])[0];
                let bias = self.bias_input(node, units)?;
                version = self.fully_connected_version(x, node.inputs[1]);
                inputs.truncate(2);
                inputs.push(bias);
                Options::FullyConnected {
                    activation: activation(*fused),
                    keep_num_dims: false,
                }
            }
            Op::MaxPool2d(p) | Op::AvgPool2d(p) => self.pool_options(node, p)?,
            Op::Mean { axes, keep_dims } => {
                let values = axes.iter().map(|&a| a as i32).collect();
                inputs.push(self.int32_constant(format!("{out_name}.axes"), vec![axes.len()], values)?);
                Options::Reducer { keep_dims: *keep_dims }
            }
            Op::Add { fused } => Options::Add {
                activation: activation(*fused),
            },
            Op::Sub { fused } => Options::Sub {
                activation: activation(*fused),
            },
            Op::Mul { fused } => Options::Mul {
                activation: activation(*fused),
            },
            Op::Div { fused } => Options::Div {
                activation: activation(*fused),
            },
            Op::Maximum | Op::Minimum => Options::MaximumMinimum,
            Op::Relu | Op::Relu6 | Op::Sigmoid | Op::Tanh => Options::None,
            Op::Hardswish => Options::HardSwish,
            Op::Softmax { axis } => {
                if *axis + 1 != self.shape(x).len() {
                    return Err(self.unsupported(node, format!("softmax over axis {axis} is not over the innermost axis")));
                }
                Options::Softmax { beta: 1.0 }
            }
            Op::Reshape { .. } | Op::Flatten { .. } => {
                let out = self.tensor(y);
                let new_shape: Vec<i32> = out
                    .shape
                    .iter()
                    .enumerate()
                    .map(|(i, &d)| if out.dynamic_axes.contains(&i) { -1 } else { d as i32 })
                    .collect();
                inputs.push(self.int32_constant(format!("{out_name}.shape"), vec![new_shape.len()], new_shape.clone())?);
                Options::Reshape { new_shape }
            }
            Op::Transpose { perm } => {
                let values = perm.iter().map(|&p| p as i32).collect();
                inputs.push(self.int32_constant(format!("{out_name}.perm"), vec![perm.len()], values)?);
                Options::Transpose
            }
            Op::Concat { axis } => Options::Concatenation {
                axis: *axis as i32,
                activation: ActivationFunctionType::NONE,
            },
            Op::Pad { pads, value } => {
                if *value != 0.0 {
                    return Err(self.unsupported(node, format!("pad value {value}, only zero padding is encodable")));
                }
                let values = pads.iter().flat_map(|p| [p[0] as i32, p[1] as i32]).collect();
                inputs.push(self.int32_constant(format!("{out_name}.paddings"), vec![pads.len(), 2], values)?);
                Options::Pad
            }
            Op::Quantize => Options::Quantize,
            Op::Dequantize => Options::Dequantize,
            _ => return Err(self.unsupported(node, "no TFLite builtin")),
        };
        self.emit(builtin, version, inputs, outputs, options);
        Ok(())
    }

    /// The bias operand of a conv or fully-connected node, adding a zero
    /// bias when the node has none.
    fn bias_input(&mut self, node: &Node, channels: usize) -> Result<i32> {
        if let Some(&b) = node.inputs.get(2) {
            return Ok(b as i32);
        }
        let (x, w) = (self.tensor(node.inputs[0]), self.tensor(node.inputs[1]));
        let name = self.graph.scope(node.scope).child_path("bias");
        match (&x.quant, &w.quant) {
            (Some(xq), Some(wq)) if x.dtype.is_integer() => {
                let scale: Vec<f32> = wq.scale.iter().map(|s| s * xq.scale[0]).collect();
                let quant = if wq.is_per_channel() {
                    QuantParams::per_channel(scale, vec![0; channels], 0)
                } else {
                    QuantParams::per_tensor(scale[0], 0)
                };
                let zeros = HostTensor::from_i32(vec![channels], vec![0; channels])?;
                self.aux_constant(name, zeros, Some(quant))
            }
            _ => self.aux_constant(name, HostTensor::zeros(vec![channels]), None),
        }
    }

    fn channel_last(&self, node: &Node) -> Result<()> {
        if node.layout != Some(Layout::ChannelLast) || self.shape(node.inputs[0]).len() != 4 {
            return Err(self.unsupported(node, "expects a rank-4 channel-last input"));
        }
        Ok(())
    }

    fn lower_conv(&mut self, node: &Node, attrs: &Conv2dAttrs, fused: Activation) -> Result<()> {
        self.channel_last(node)?;
        let (x, w, y) = (node.inputs[0], node.inputs[1], node.outputs[0]);
        let (xs, ws, ys) = (self.shape(x), self.shape(w), self.shape(y));
        let channels = xs[3];
        let depthwise = attrs.groups > 1;
        if depthwise && attrs.groups != channels {
            return Err(self.unsupported(
                node,
                format!("grouped convolution ({} groups over {channels} channels)", attrs.groups),
            ));
        }
        let (builtin, out_channels) = if depthwise {
            (BuiltinOperator::DEPTHWISE_CONV_2D, ws[3])
        } else {
            (BuiltinOperator::CONV_2D, ws[0])
        };
        let (k, s, d, p) = ([ws[1], ws[2]], attrs.stride, attrs.dilation, attrs.padding);

        let mut input = x as i32;
        let mut padding = both_axes([
            padding_mode(xs[1], k[0], s[0], d[0], p[0], ys[1]),
            padding_mode(xs[2], k[1], s[1], d[1], p[1], ys[2]),
        ]);
        if padding.is_none() {
            // Asymmetric TFLite padding cannot express this; pad explicitly.
            let padded_shape = vec![xs[0], xs[1] + 2 * p[0], xs[2] + 2 * p[1], xs[3]];
            let name = &self.tensor(x).name;
            let padded = self.aux_intermediate(format!("{name}.padded"), padded_shape.clone(), x)?;
            let pads = vec![0, 0, p[0] as i32, p[0] as i32, p[1] as i32, p[1] as i32, 0, 0];
            let pads = self.int32_constant(format!("{name}.paddings"), vec![4, 2], pads)?;
            let version = self.version(BuiltinOperator::PAD, x);
            self.emit(BuiltinOperator::PAD, version, vec![input, pads], vec![padded], Options::Pad);
            debug!("explicit PAD before {} in `{}`", node.id, self.graph.scope_path(node.scope));
            input = padded;
            padding = both_axes([
                padding_mode(padded_shape[1], k[0], s[0], d[0], 0, ys[1]),
                padding_mode(padded_shape[2], k[1], s[1], d[1], 0, ys[2]),
            ]);
        }
        let padding = padding.ok_or_else(|| self.unsupported(node, format!("padding {p:?} with stride {s:?}")))?;

        let bias = self.bias_input(node, out_channels)?;
        let stride = [s[0] as i32, s[1] as i32];
        let dilation = [d[0] as i32, d[1] as i32];
        let options = if depthwise {
            Options::DepthwiseConv2D {
                padding,
                stride,
                dilation,
                depth_multiplier: (out_channels / channels) as i32,
                activation: activation(fused),
            }
        } else {
            Options::Conv2D {
                padding,
                stride,
                dilation,
                activation: activation(fused),
            }
        };
        let version = self.version(builtin, x);
        self.emit(builtin, version, vec![input, w as i32, bias], vec![y as i32], options);
        Ok(())
    }

    fn pool_options(&self, node: &Node, p: &PoolAttrs) -> Result<Options> {
        self.channel_last(node)?;
        let (xs, ys) = (self.shape(node.inputs[0]), self.shape(node.outputs[0]));
        let padding = both_axes([
            padding_mode(xs[1], p.kernel[0], p.stride[0], 1, p.padding[0], ys[1]),
            padding_mode(xs[2], p.kernel[1], p.stride[1], 1, p.padding[1], ys[2]),
        ])
        .ok_or_else(|| self.unsupported(node, format!("pool padding {:?} has no SAME/VALID equivalent", p.padding)))?;
        let pads_counted = matches!(node.op, Op::AvgPool2d(_)) && p.count_include_pad && p.padding != [0, 0];
        if pads_counted {
            return Err(self.unsupported(node, "average pool counting padded elements"));
        }
        Ok(Options::Pool2D {
            padding,
            stride: [p.stride[0] as i32, p.stride[1] as i32],
            filter: [p.kernel[0] as i32, p.kernel[1] as i32],
            activation: activation(p.fused),
        })
    }

    /// Clamp to a RELU variant when the range matches one, else
    /// `MINIMUM(MAXIMUM(x, lo), hi)`.
    fn lower_clamp(&mut self, node: &Node, min: f32, max: f32) -> Result<()> {
        let (x, y) = (node.inputs[0], node.outputs[0]);
        let relu = match (min, max) {
            (lo, hi) if lo == 0.0 && hi == 6.0 => Some(BuiltinOperator::RELU6),
            (lo, hi) if lo == 0.0 && hi == f32::INFINITY => Some(BuiltinOperator::RELU),
            (lo, hi) if lo == -1.0 && hi == 1.0 => Some(BuiltinOperator::RELU_N1_TO_1),
            _ => None,
        };
        if let Some(builtin) = relu {
            let version = self.version(builtin, x);
            self.emit(builtin, version, vec![x as i32], vec![y as i32], Options::None);
            return Ok(());
        }
        if !min.is_finite() && !max.is_finite() {
            return Err(self.unsupported(node, "unbounded clamp"));
        }
        let name = &self.tensor(y).name;
        let mut current = x as i32;
        if min.is_finite() {
            let lo = self.bound(x, format!("{name}.min"), min)?;
            let out = if max.is_finite() {
                self.aux_intermediate(format!("{name}.lower"), self.shape(y).to_vec(), y)?
            } else {
                y as i32
            };
            let version = self.version(BuiltinOperator::MAXIMUM, x);
            self.emit(BuiltinOperator::MAXIMUM, version, vec![current, lo], vec![out], Options::MaximumMinimum);
            current = out;
        }
        if max.is_finite() {
            let hi = self.bound(x, format!("{name}.max"), max)?;
            let version = self.version(BuiltinOperator::MINIMUM, x);
            self.emit(BuiltinOperator::MINIMUM, version, vec![current, hi], vec![y as i32], Options::MaximumMinimum);
        }
        Ok(())
    }

    /// Scalar clamp bound in the storage type of `like`.
    fn bound(&mut self, like: TensorId, name: String, value: f32) -> Result<i32> {
        let t = self.tensor(like);
        let scalar = HostTensor::full(vec![1], value);
        match &t.quant {
            Some(q) if t.dtype.is_integer() => {
                let quantized = q.quantize(&scalar, t.dtype, RUNTIME_ROUNDING)?;
                self.aux_constant(name, quantized, Some(q.clone()))
            }
            _ => self.aux_constant(name, scalar, None),
        }
    }
}
