//! Plan → flatbuffer bytes.

use flatbuffers::{FlatBufferBuilder, TableFinishedWIPOffset, WIPOffset};

use super::plan::*;
use crate::parse::tflite::schema::{
    vt, Buffer, Model, Operator, OperatorCode, QuantizationParameters, ReshapeOptions, SubGraph, Tensor, FILE_IDENTIFIER,
    PLACEHOLDER_FOR_GREATER_OP_CODES,
};

type Finished = WIPOffset<TableFinishedWIPOffset>;

/// `Buffer.data` is declared `force_align: 16`.
const BUFFER_ALIGN: usize = 16;

/// Serialize `plan` into a finished `TFL3` buffer.
pub fn render(plan: &ModelPlan) -> Vec<u8> {
    let mut fbb = FlatBufferBuilder::with_capacity(1024 + plan.buffers.iter().map(Vec::len).sum::<usize>());

    let opcodes: Vec<Finished> = plan.opcodes.iter().map(|c| opcode(&mut fbb, c)).collect();
    let opcodes = fbb.create_vector(&opcodes);
    let subgraphs: Vec<Finished> = plan.subgraphs.iter().map(|sg| subgraph(&mut fbb, sg)).collect();
    let subgraphs = fbb.create_vector(&subgraphs);
    let description = fbb.create_string(&plan.description);
    let buffers: Vec<Finished> = plan.buffers.iter().map(|b| buffer(&mut fbb, b)).collect();
    let buffers = fbb.create_vector(&buffers);

    let start = fbb.start_table();
    fbb.push_slot::<u32>(Model::VT_VERSION, plan.version, 0);
    fbb.push_slot_always(Model::VT_OPERATOR_CODES, opcodes);
    fbb.push_slot_always(Model::VT_SUBGRAPHS, subgraphs);
    fbb.push_slot_always(Model::VT_DESCRIPTION, description);
    fbb.push_slot_always(Model::VT_BUFFERS, buffers);
    let model = fbb.end_table(start);
    // Root offset and identifier follow; the finished length must stay a
    // multiple of BUFFER_ALIGN so buffer data offsets from the front do too.
    pad_front(&mut fbb, 8);
    fbb.finish(model, Some(FILE_IDENTIFIER));
    fbb.finished_data().to_vec()
}

fn opcode<'a>(fbb: &mut FlatBufferBuilder<'a>, code: &OpcodePlan) -> Finished {
    let deprecated = code.builtin.0.min(PLACEHOLDER_FOR_GREATER_OP_CODES as i32) as i8;
    let start = fbb.start_table();
    fbb.push_slot::<i8>(OperatorCode::VT_DEPRECATED_BUILTIN_CODE, deprecated, 0);
    fbb.push_slot::<i32>(OperatorCode::VT_VERSION, code.version, 1);
    fbb.push_slot::<i32>(OperatorCode::VT_BUILTIN_CODE, code.builtin.0, 0);
    fbb.end_table(start)
}

/// Zero bytes so that `upcoming` more bytes leave the written tail a
/// multiple of [`BUFFER_ALIGN`] long.
fn pad_front(fbb: &mut FlatBufferBuilder<'_>, upcoming: usize) {
    let used = fbb.unfinished_data().len() + upcoming;
    for _ in 0..(BUFFER_ALIGN - used % BUFFER_ALIGN) % BUFFER_ALIGN {
        fbb.push(0u8);
    }
}

fn buffer<'a>(fbb: &mut FlatBufferBuilder<'a>, bytes: &[u8]) -> Finished {
    let data = (!bytes.is_empty()).then(|| {
        pad_front(fbb, bytes.len());
        fbb.create_vector(bytes)
    });
    let start = fbb.start_table();
    if let Some(data) = data {
        fbb.push_slot_always(Buffer::VT_DATA, data);
    }
    fbb.end_table(start)
}

fn subgraph<'a>(fbb: &mut FlatBufferBuilder<'a>, sg: &SubgraphPlan) -> Finished {
    let tensors: Vec<Finished> = sg.tensors.iter().map(|t| tensor(fbb, t)).collect();
    let tensors = fbb.create_vector(&tensors);
    let inputs = fbb.create_vector(&sg.inputs[..]);
    let outputs = fbb.create_vector(&sg.outputs[..]);
    let operators: Vec<Finished> = sg.operators.iter().map(|op| operator(fbb, op)).collect();
    let operators = fbb.create_vector(&operators);
    let name = fbb.create_string(&sg.name);

    let start = fbb.start_table();
    fbb.push_slot_always(SubGraph::VT_TENSORS, tensors);
    fbb.push_slot_always(SubGraph::VT_INPUTS, inputs);
    fbb.push_slot_always(SubGraph::VT_OUTPUTS, outputs);
    fbb.push_slot_always(SubGraph::VT_OPERATORS, operators);
    fbb.push_slot_always(SubGraph::VT_NAME, name);
    fbb.end_table(start)
}

fn tensor<'a>(fbb: &mut FlatBufferBuilder<'a>, t: &TensorPlan) -> Finished {
    let shape = fbb.create_vector(&t.shape[..]);
    let name = fbb.create_string(&t.name);
    let quant = t.quant.as_ref().map(|q| quantization(fbb, q));
    let signature = t.shape_signature.as_ref().map(|s| fbb.create_vector(&s[..]));

    let start = fbb.start_table();
    fbb.push_slot_always(Tensor::VT_SHAPE, shape);
    fbb.push_slot::<i8>(Tensor::VT_TYPE_, t.dtype.0, 0);
    fbb.push_slot::<u32>(Tensor::VT_BUFFER, t.buffer, 0);
    fbb.push_slot_always(Tensor::VT_NAME, name);
    if let Some(quant) = quant {
        fbb.push_slot_always(Tensor::VT_QUANTIZATION, quant);
    }
    if let Some(signature) = signature {
        fbb.push_slot_always(Tensor::VT_SHAPE_SIGNATURE, signature);
    }
    fbb.end_table(start)
}

fn quantization<'a>(fbb: &mut FlatBufferBuilder<'a>, q: &QuantPlan) -> Finished {
    let scale = fbb.create_vector(&q.scale[..]);
    let zero_point = fbb.create_vector(&q.zero_point[..]);
    let start = fbb.start_table();
    fbb.push_slot_always(QuantizationParameters::VT_SCALE, scale);
    fbb.push_slot_always(QuantizationParameters::VT_ZERO_POINT, zero_point);
    fbb.push_slot::<i32>(QuantizationParameters::VT_QUANTIZED_DIMENSION, q.quantized_dimension, 0);
    fbb.end_table(start)
}

fn operator<'a>(fbb: &mut FlatBufferBuilder<'a>, op: &OperatorPlan) -> Finished {
    let inputs = fbb.create_vector(&op.inputs[..]);
    let outputs = fbb.create_vector(&op.outputs[..]);
    let options = options(fbb, &op.options);

    let start = fbb.start_table();
    fbb.push_slot::<u32>(Operator::VT_OPCODE_INDEX, op.opcode_index, 0);
    fbb.push_slot_always(Operator::VT_INPUTS, inputs);
    fbb.push_slot_always(Operator::VT_OUTPUTS, outputs);
    if let Some(options) = options {
        fbb.push_slot::<u8>(Operator::VT_BUILTIN_OPTIONS_TYPE, op.options.tag().0, 0);
        fbb.push_slot_always(Operator::VT_BUILTIN_OPTIONS, options);
    }
    fbb.end_table(start)
}

/// Option tables are written with every field present so readers never
/// depend on schema defaults.
fn options<'a>(fbb: &mut FlatBufferBuilder<'a>, options: &Options) -> Option<Finished> {
    let f = vt::field;
    let table = match options {
        Options::None => return None,
        Options::Conv2D {
            padding,
            stride,
            dilation,
            activation,
        } => {
            let start = fbb.start_table();
            fbb.push_slot_always::<i8>(f(0), padding.0);
            fbb.push_slot_always::<i32>(f(1), stride[1]);
            fbb.push_slot_always::<i32>(f(2), stride[0]);
            fbb.push_slot_always::<i8>(f(3), activation.0);
            fbb.push_slot_always::<i32>(f(4), dilation[1]);
            fbb.push_slot_always::<i32>(f(5), dilation[0]);
            fbb.end_table(start)
        }
        Options::DepthwiseConv2D {
            padding,
            stride,
            dilation,
            depth_multiplier,
            activation,
        } => {
            let start = fbb.start_table();
            fbb.push_slot_always::<i8>(f(0), padding.0);
            fbb.push_slot_always::<i32>(f(1), stride[1]);
            fbb.push_slot_always::<i32>(f(2), stride[0]);
            fbb.push_slot_always::<i32>(f(3), *depth_multiplier);
            fbb.push_slot_always::<i8>(f(4), activation.0);
            fbb.push_slot_always::<i32>(f(5), dilation[1]);
            fbb.push_slot_always::<i32>(f(6), dilation[0]);
            fbb.end_table(start)
        }
        Options::Pool2D {
            padding,
            stride,
            filter,
            activation,
        } => {
            let start = fbb.start_table();
            fbb.push_slot_always::<i8>(f(0), padding.0);
            fbb.push_slot_always::<i32>(f(1), stride[1]);
            fbb.push_slot_always::<i32>(f(2), stride[0]);
            fbb.push_slot_always::<i32>(f(3), filter[1]);
            fbb.push_slot_always::<i32>(f(4), filter[0]);
            fbb.push_slot_always::<i8>(f(5), activation.0);
            fbb.end_table(start)
        }
        Options::FullyConnected {
            activation,
            keep_num_dims,
        } => {
            let start = fbb.start_table();
            fbb.push_slot_always::<i8>(f(0), activation.0);
            fbb.push_slot_always::<i8>(f(1), 0);
            fbb.push_slot_always::<bool>(f(2), *keep_num_dims);
            fbb.end_table(start)
        }
        Options::Softmax { beta } => {
            let start = fbb.start_table();
            fbb.push_slot_always::<f32>(f(0), *beta);
            fbb.end_table(start)
        }
        Options::Concatenation { axis, activation } => {
            let start = fbb.start_table();
            fbb.push_slot_always::<i32>(f(0), *axis);
            fbb.push_slot_always::<i8>(f(1), activation.0);
            fbb.end_table(start)
        }
        Options::Add { activation }
        | Options::Sub { activation }
        | Options::Mul { activation }
        | Options::Div { activation } => {
            let start = fbb.start_table();
            fbb.push_slot_always::<i8>(f(0), activation.0);
            fbb.end_table(start)
        }
        Options::Reshape { new_shape } => {
            let new_shape = fbb.create_vector(&new_shape[..]);
            let start = fbb.start_table();
            fbb.push_slot_always(ReshapeOptions::VT_NEW_SHAPE, new_shape);
            fbb.end_table(start)
        }
        Options::Reducer { keep_dims } => {
            let start = fbb.start_table();
            fbb.push_slot_always::<bool>(f(0), *keep_dims);
            fbb.end_table(start)
        }
        Options::Pad
        | Options::Transpose
        | Options::Quantize
        | Options::Dequantize
        | Options::MaximumMinimum
        | Options::HardSwish => {
            let start = fbb.start_table();
            fbb.end_table(start)
        }
    };
    Some(table)
}
