//! TFLite flatbuffer → serialization plan.
//!
//! The inverse of `convert::render`: every table the converter writes is
//! read back field for field, buffers are copied out of the model bytes.

use flatbuffers::Vector;

use super::schema::*;
use crate::convert::plan::*;
use crate::error::{Error, Result};

fn malformed(msg: impl Into<String>) -> Error {
    Error::MalformedModel(msg.into())
}

fn ints(v: Option<Vector<'_, i32>>) -> Vec<i32> {
    v.map(|v| v.iter().collect()).unwrap_or_default()
}

/// Verify `bytes` and read the whole model.
pub fn read_model(bytes: &[u8]) -> Result<ModelPlan> {
    if !model_buffer_has_identifier(bytes) {
        return Err(malformed(format!("missing `{FILE_IDENTIFIER}` file identifier")));
    }
    let model = root_as_model(bytes)?;

    let opcodes = model
        .operator_codes()
        .ok_or_else(|| malformed("no operator codes"))?
        .iter()
        .map(|code| OpcodePlan {
            builtin: code.builtin_code(),
            version: code.version(),
        })
        .collect::<Vec<_>>();

    let buffers: Vec<Vec<u8>> = model
        .buffers()
        .ok_or_else(|| malformed("no buffers"))?
        .iter()
        .map(|b| b.data().map(|d| d.bytes().to_vec()).unwrap_or_default())
        .collect();

    let subgraphs = model
        .subgraphs()
        .ok_or_else(|| malformed("no subgraphs"))?
        .iter()
        .map(|sg| read_subgraph(&sg, opcodes.len(), buffers.len()))
        .collect::<Result<Vec<_>>>()?;

    Ok(ModelPlan {
        version: model.version(),
        description: model.description().unwrap_or_default().to_string(),
        opcodes,
        subgraphs,
        buffers,
    })
}

fn read_subgraph(sg: &SubGraph<'_>, num_opcodes: usize, num_buffers: usize) -> Result<SubgraphPlan> {
    let tensors = sg
        .tensors()
        .ok_or_else(|| malformed("subgraph has no tensors"))?
        .iter()
        .map(|t| read_tensor(&t, num_buffers))
        .collect::<Result<Vec<_>>>()?;

    let in_range = |i: &i32| *i == -1 || (0..tensors.len() as i32).contains(i);
    let operators = sg
        .operators()
        .map(|ops| ops.iter().map(|op| read_operator(&op)).collect::<Result<Vec<_>>>())
        .transpose()?
        .unwrap_or_default();
    for (i, op) in operators.iter().enumerate() {
        if op.opcode_index as usize >= num_opcodes {
            return Err(malformed(format!("operator {i} uses opcode {} of {num_opcodes}", op.opcode_index)));
        }
        if !op.inputs.iter().chain(&op.outputs).all(in_range) {
            return Err(malformed(format!("operator {i} references a tensor out of range")));
        }
    }

    let inputs = ints(sg.inputs());
    let outputs = ints(sg.outputs());
    if !inputs.iter().chain(&outputs).all(in_range) {
        return Err(malformed("subgraph input or output out of range"));
    }
    Ok(SubgraphPlan {
        name: sg.name().unwrap_or_default().to_string(),
        tensors,
        inputs,
        outputs,
        operators,
    })
}

fn read_tensor(t: &Tensor<'_>, num_buffers: usize) -> Result<TensorPlan> {
    let name = t.name().unwrap_or_default().to_string();
    if t.buffer() as usize >= num_buffers {
        return Err(malformed(format!("tensor `{name}` uses buffer {} of {num_buffers}", t.buffer())));
    }
    let quant = t.quantization().and_then(|q| {
        let scale: Vec<f32> = q.scale()?.iter().collect();
        Some(QuantPlan {
            scale,
            zero_point: q.zero_point().map(|z| z.iter().collect()).unwrap_or_default(),
            quantized_dimension: q.quantized_dimension(),
        })
    });
    Ok(TensorPlan {
        name,
        shape: ints(t.shape()),
        shape_signature: t.shape_signature().map(|s| s.iter().collect()),
        dtype: t.type_(),
        buffer: t.buffer(),
        quant,
    })
}

fn read_operator(op: &Operator<'_>) -> Result<OperatorPlan> {
    Ok(OperatorPlan {
        opcode_index: op.opcode_index(),
        inputs: ints(op.inputs()),
        outputs: ints(op.outputs()),
        options: read_options(op)?,
    })
}

fn read_options(op: &Operator<'_>) -> Result<Options> {
    let tag = op.builtin_options_type();
    if tag == BuiltinOptions::NONE {
        return Ok(Options::None);
    }
    let missing = || malformed(format!("operator options {tag:?} have no table"));
    let act = ActivationFunctionType;
    let options = match tag {
        BuiltinOptions::Conv2DOptions => {
            let o: Conv2DOptions = op.builtin_options_as(tag).ok_or_else(missing)?;
            Options::Conv2D {
                padding: Padding(o.padding_raw()),
                stride: [o.stride_h(), o.stride_w()],
                dilation: [o.dilation_h_factor(), o.dilation_w_factor()],
                activation: act(o.fused_activation_function_raw()),
            }
        }
        BuiltinOptions::DepthwiseConv2DOptions => {
            let o: DepthwiseConv2DOptions = op.builtin_options_as(tag).ok_or_else(missing)?;
            Options::DepthwiseConv2D {
                padding: Padding(o.padding_raw()),
                stride: [o.stride_h(), o.stride_w()],
                dilation: [o.dilation_h_factor(), o.dilation_w_factor()],
                depth_multiplier: o.depth_multiplier(),
                activation: act(o.fused_activation_function_raw()),
            }
        }
        BuiltinOptions::Pool2DOptions => {
            let o: Pool2DOptions = op.builtin_options_as(tag).ok_or_else(missing)?;
            Options::Pool2D {
                padding: Padding(o.padding_raw()),
                stride: [o.stride_h(), o.stride_w()],
                filter: [o.filter_height(), o.filter_width()],
                activation: act(o.fused_activation_function_raw()),
            }
        }
        BuiltinOptions::FullyConnectedOptions => {
            let o: FullyConnectedOptions = op.builtin_options_as(tag).ok_or_else(missing)?;
            Options::FullyConnected {
                activation: act(o.fused_activation_function_raw()),
                keep_num_dims: o.keep_num_dims(),
            }
        }
        BuiltinOptions::SoftmaxOptions => {
            let o: SoftmaxOptions = op.builtin_options_as(tag).ok_or_else(missing)?;
            Options::Softmax { beta: o.beta() }
        }
        BuiltinOptions::ConcatenationOptions => {
            let o: ConcatenationOptions = op.builtin_options_as(tag).ok_or_else(missing)?;
            Options::Concatenation {
                axis: o.axis(),
                activation: act(o.fused_activation_function_raw()),
            }
        }
        BuiltinOptions::AddOptions
        | BuiltinOptions::SubOptions
        | BuiltinOptions::MulOptions
        | BuiltinOptions::DivOptions => {
            let o: ActivationOptions = op.builtin_options_as(tag).ok_or_else(missing)?;
            let activation = act(o.fused_activation_function_raw());
            match tag {
                BuiltinOptions::AddOptions => Options::Add { activation },
                BuiltinOptions::SubOptions => Options::Sub { activation },
                BuiltinOptions::MulOptions => Options::Mul { activation },
                _ => Options::Div { activation },
            }
        }
        BuiltinOptions::ReshapeOptions => {
            let o: ReshapeOptions = op.builtin_options_as(tag).ok_or_else(missing)?;
            Options::Reshape {
                new_shape: ints(o.new_shape()),
            }
        }
        BuiltinOptions::ReducerOptions => {
            let o: ReducerOptions = op.builtin_options_as(tag).ok_or_else(missing)?;
            Options::Reducer {
                keep_dims: o.keep_dims(),
            }
        }
        BuiltinOptions::PadOptions => Options::Pad,
        BuiltinOptions::TransposeOptions => Options::Transpose,
        BuiltinOptions::QuantizeOptions => Options::Quantize,
        BuiltinOptions::DequantizeOptions => Options::Dequantize,
        BuiltinOptions::MaximumMinimumOptions => Options::MaximumMinimum,
        BuiltinOptions::HardSwishOptions => Options::HardSwish,
        other => return Err(malformed(format!("unsupported builtin options {other:?}"))),
    };
    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::render;

    fn sample_plan() -> ModelPlan {
        let tensor = |name: &str, shape: Vec<i32>, dtype, buffer| TensorPlan {
            name: name.to_string(),
            shape,
            shape_signature: None,
            dtype,
            buffer,
            quant: None,
        };
        let mut input = tensor("x", vec![1, 4, 4, 2], TensorType::INT8, 0);
        input.shape_signature = Some(vec![-1, 4, 4, 2]);
        input.quant = Some(QuantPlan {
            scale: vec![0.05],
            zero_point: vec![-3],
            quantized_dimension: 0,
        });
        let mut weight = tensor("w", vec![3, 1, 1, 2], TensorType::INT8, 1);
        weight.quant = Some(QuantPlan {
            scale: vec![0.1, 0.2, 0.3],
            zero_point: vec![0, 0, 0],
            quantized_dimension: 0,
        });
        ModelPlan {
            version: SCHEMA_VERSION,
            description: "round trip".into(),
            opcodes: vec![
                OpcodePlan {
                    builtin: BuiltinOperator::CONV_2D,
                    version: 3,
                },
                OpcodePlan {
                    builtin: BuiltinOperator::HARD_SWISH,
                    version: 1,
                },
            ],
            subgraphs: vec![SubgraphPlan {
                name: "main".into(),
                tensors: vec![
                    input,
                    weight,
                    tensor("b", vec![3], TensorType::INT32, 2),
                    tensor("y", vec![1, 4, 4, 3], TensorType::INT8, 0),
                    tensor("z", vec![1, 4, 4, 3], TensorType::INT8, 0),
                ],
                inputs: vec![0],
                outputs: vec![4],
                operators: vec![
                    OperatorPlan {
                        opcode_index: 0,
                        inputs: vec![0, 1, 2],
                        outputs: vec![3],
                        options: Options::Conv2D {
                            padding: Padding::SAME,
                            stride: [1, 2],
                            dilation: [1, 1],
                            activation: ActivationFunctionType::RELU6,
                        },
                    },
                    OperatorPlan {
                        opcode_index: 1,
                        inputs: vec![3],
                        outputs: vec![4],
                        options: Options::HardSwish,
                    },
                ],
            }],
            buffers: vec![vec![], vec![1, 2, 3, 4, 5, 6], vec![0; 12]],
        }
    }

    #[test]
    fn test_render_then_read_reproduces_plan() {
        let plan = sample_plan();
        let bytes = render(&plan);
        assert!(model_buffer_has_identifier(&bytes));
        assert_eq!(read_model(&bytes).unwrap(), plan);
    }

    #[test]
    fn test_buffer_data_is_16_byte_aligned() {
        let mut plan = sample_plan();
        plan.description = "odd".into();
        plan.buffers.extend([vec![7; 3], vec![9], vec![1; 17], vec![2; 32]]);
        let bytes = render(&plan);
        assert_eq!(bytes.len() % 16, 0);

        let model = root_as_model(&bytes).unwrap();
        let mut checked = 0;
        for buffer in model.buffers().unwrap().iter() {
            if let Some(data) = buffer.data() {
                let offset = data.bytes().as_ptr() as usize - bytes.as_ptr() as usize;
                assert_eq!(offset % 16, 0, "{} bytes at offset {offset}", data.len());
                checked += 1;
            }
        }
        assert_eq!(checked, 6);
        assert_eq!(read_model(&bytes).unwrap(), plan);
    }

    #[test]
    fn test_high_opcode_uses_placeholder_byte() {
        let mut plan = sample_plan();
        plan.opcodes[1].builtin = BuiltinOperator(130);
        let bytes = render(&plan);
        let model = root_as_model(&bytes).unwrap();
        let codes = model.operator_codes().unwrap();
        assert_eq!(codes.get(0).deprecated_builtin_code(), 3);
        assert_eq!(codes.get(1).deprecated_builtin_code(), PLACEHOLDER_FOR_GREATER_OP_CODES);
        assert_eq!(codes.get(1).builtin_code(), BuiltinOperator(130));
        assert_eq!(read_model(&bytes).unwrap().opcodes[1].builtin, BuiltinOperator(130));
    }

    #[test]
    fn test_rejects_foreign_bytes() {
        assert!(matches!(read_model(b"not a model at all"), Err(Error::MalformedModel(_))));
        let mut bytes = render(&sample_plan());
        bytes.truncate(bytes.len() / 2);
        assert!(read_model(&bytes).is_err());
    }

    #[test]
    fn test_out_of_range_tensor_is_rejected() {
        let mut plan = sample_plan();
        plan.subgraphs[0].operators[1].outputs = vec![9];
        let err = read_model(&render(&plan)).unwrap_err();
        assert!(matches!(err, Error::MalformedModel(_)));
    }
}
