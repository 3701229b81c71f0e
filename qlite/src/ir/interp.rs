//! Reference interpreter.
//!
//! Integer tensors are dequantized with their descriptor's parameters before
//! a node runs and its outputs are quantized to the output descriptors, so
//! float, fake-quantized and integer graphs all execute the same way.

use std::sync::Arc;

use log::debug;
use qlite_kernels::Rounding;

use super::eval::eval;
use super::graph::{Graph, Node, Tensor, TensorKind};
use super::op::Op;
use crate::error::{Error, Result};
use crate::quant::observer::FakeQuant;
use crate::tensor::{DType, HostTensor, TensorData};

/// Rounding used when the interpreter materializes integer tensors.
pub const RUNTIME_ROUNDING: Rounding = Rounding::HalfAwayFromZero;

/// Dequantize (or pass through) a value read from tensor `desc`.
pub fn to_float(value: &HostTensor, desc: &Tensor) -> Result<HostTensor> {
    if value.dtype() == DType::F32 {
        return Ok(value.clone());
    }
    match &desc.quant {
        Some(q) => q.dequantize(value),
        None => HostTensor::from_data(
            value.shape.clone(),
            TensorData::F32(Arc::new(value.to_f32_vec())),
        ),
    }
}

/// Store a float result into tensor `desc` (quantizing if it is integer).
pub fn from_float(value: HostTensor, desc: &Tensor) -> Result<HostTensor> {
    if desc.dtype == DType::F32 {
        return Ok(value);
    }
    match &desc.quant {
        Some(q) => q.quantize(&value, desc.dtype, RUNTIME_ROUNDING),
        None => Ok(HostTensor {
            shape: value.shape.clone(),
            data: TensorData::from_i64(
                desc.dtype,
                value.as_f32()?.iter().map(|v| v.round() as i64),
            ),
        }),
    }
}

/// Execute one node of `graph` on concrete operands.
pub fn exec_node(graph: &Graph, node: &Node, inputs: &[HostTensor]) -> Result<Vec<HostTensor>> {
    let floats = inputs
        .iter()
        .zip(&node.inputs)
        .map(|(v, &id)| to_float(v, graph.tensor(id)))
        .collect::<Result<Vec<_>>>()?;
    let outputs = eval(&node.op, &floats, node.layout.unwrap_or_default()).map_err(|err| {
        Error::InvalidArgument {
            op: node.op.kind().to_string(),
            scope: graph.scope_path(node.scope).to_string(),
            reason: err.to_string(),
        }
    })?;
    outputs
        .into_iter()
        .zip(&node.outputs)
        .map(|(v, &id)| from_float(v, graph.tensor(id)))
        .collect()
}

/// Check sample inputs against the declared graph inputs.
///
/// Dynamic axes accept any size.
pub fn check_inputs(graph: &Graph, inputs: &[HostTensor]) -> Result<()> {
    let shapes: Vec<&[usize]> = inputs.iter().map(|t| t.shape.as_slice()).collect();
    check_input_shapes(graph, &shapes)
}

/// [`check_inputs`] on shapes alone.
pub fn check_input_shapes(graph: &Graph, shapes: &[&[usize]]) -> Result<()> {
    if shapes.len() != graph.inputs.len() {
        return Err(Error::InvalidArgument {
            op: "graph".into(),
            scope: "<root>".into(),
            reason: format!("expected {} inputs, got {}", graph.inputs.len(), shapes.len()),
        });
    }
    for (index, (&shape, &id)) in shapes.iter().zip(&graph.inputs).enumerate() {
        let desc = graph.tensor(id);
        let matches = shape.len() == desc.shape.len()
            && shape
                .iter()
                .zip(&desc.shape)
                .enumerate()
                .all(|(axis, (a, b))| a == b || desc.dynamic_axes.contains(&axis));
        if !matches {
            let expected = desc
                .shape
                .iter()
                .enumerate()
                .map(|(axis, &d)| if desc.dynamic_axes.contains(&axis) { -1 } else { d as i64 })
                .collect();
            return Err(Error::ShapeMismatch {
                index,
                expected,
                actual: shape.to_vec(),
            });
        }
    }
    Ok(())
}

pub struct Interpreter<'g> {
    graph: &'g Graph,
    calibrate: bool,
    observed: Vec<(usize, FakeQuant)>,
}

impl<'g> Interpreter<'g> {
    pub fn new(graph: &'g Graph) -> Self {
        Self {
            graph,
            calibrate: false,
            observed: Vec::new(),
        }
    }

    /// Evaluate every node; in calibration mode fake-quant observers are
    /// updated (on private copies) before they quantize.
    pub fn run(&mut self, inputs: &[HostTensor]) -> Result<Vec<HostTensor>> {
        let graph = self.graph;
        check_inputs(graph, inputs)?;
        let mut values: Vec<Option<HostTensor>> = vec![None; graph.tensors.len()];
        for t in &graph.tensors {
            if let TensorKind::Constant { .. } = t.kind {
                values[t.id] = t.constant();
            }
        }
        for (value, &id) in inputs.iter().zip(&graph.inputs) {
            values[id] = Some(from_float(to_float(value, graph.tensor(id))?, graph.tensor(id))?);
        }

        for (index, node) in graph.nodes.iter().enumerate() {
            let operands = node
                .inputs
                .iter()
                .map(|&id| {
                    values[id].clone().ok_or_else(|| {
                        Error::InvalidGraph(format!("{} reads tensor {id} before it is computed", node.id))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            let outputs = match &node.op {
                Op::FakeQuantize(fq) if self.calibrate => {
                    let mut fq = fq.clone();
                    let x = to_float(&operands[0], graph.tensor(node.inputs[0]))?;
                    fq.observe(&x)?;
                    let y = fq.apply(&x)?;
                    self.observed.push((index, fq));
                    vec![y]
                }
                _ => exec_node(graph, node, &operands)?,
            };
            for (value, &id) in outputs.into_iter().zip(&node.outputs) {
                values[id] = Some(value);
            }
        }

        graph
            .outputs
            .iter()
            .map(|&id| {
                let v = values[id]
                    .take()
                    .ok_or_else(|| Error::InvalidGraph(format!("output {id} was never computed")))?;
                to_float(&v, graph.tensor(id))
            })
            .collect()
    }
}

/// Run `graph` on `inputs`, returning float outputs.
pub fn run(graph: &Graph, inputs: &[HostTensor]) -> Result<Vec<HostTensor>> {
    Interpreter::new(graph).run(inputs)
}

/// Run `graph` once, folding what every fake-quant node observes into its
/// observer state.
pub fn calibrate(graph: &mut Graph, inputs: &[HostTensor]) -> Result<Vec<HostTensor>> {
    let (outputs, observed) = {
        let mut interp = Interpreter::new(graph);
        interp.calibrate = true;
        let outputs = interp.run(inputs)?;
        (outputs, interp.observed)
    };
    debug!("calibration updated {} observers", observed.len());
    for (index, fq) in observed {
        graph.nodes[index].op = Op::FakeQuantize(fq);
    }
    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::quant::QuantParams;
    use crate::ir::scope::ROOT_SCOPE;
    use crate::quant::config::QuantSpec;

    fn fq_graph() -> Graph {
        let mut g = Graph::default();
        let x = g.add_input("x", vec![1, 4], DType::F32);
        let y = g.add_tensor("y", vec![1, 4], DType::F32, TensorKind::Intermediate);
        g.add_node(
            Op::FakeQuantize(FakeQuant::new(QuantSpec::activation())),
            vec![x],
            vec![y],
            ROOT_SCOPE,
        );
        g.outputs.push(y);
        g
    }

    #[test]
    fn test_uncalibrated_fake_quant_passes_through() {
        let g = fq_graph();
        let x = HostTensor::new(vec![1, 4], vec![0.1, 0.2, 0.3, 0.4]).unwrap();
        let out = run(&g, &[x.clone()]).unwrap();
        assert_eq!(out[0], x);
    }

    #[test]
    fn test_calibrate_updates_observer() {
        let mut g = fq_graph();
        let x = HostTensor::new(vec![1, 4], vec![-1.0, 0.0, 1.0, 2.0]).unwrap();
        calibrate(&mut g, &[x]).unwrap();
        let Op::FakeQuantize(fq) = &g.nodes[0].op else {
            panic!("expected fake quantize");
        };
        assert_eq!(fq.observer.min, vec![-1.0]);
        assert_eq!(fq.observer.max, vec![2.0]);
    }

    #[test]
    fn test_shape_mismatch_reports_expected() {
        let g = fq_graph();
        let x = HostTensor::new(vec![4], vec![0.0; 4]).unwrap();
        match run(&g, &[x]).unwrap_err() {
            Error::ShapeMismatch { index, expected, actual } => {
                assert_eq!(index, 0);
                assert_eq!(expected, vec![1, 4]);
                assert_eq!(actual, vec![4]);
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_integer_node_requantizes_output() {
        let mut g = Graph::default();
        let x = g.add_input("x", vec![2], DType::F32);
        let q = g.add_tensor("q", vec![2], DType::I8, TensorKind::Intermediate);
        g.tensor_mut(q).quant = Some(QuantParams::per_tensor(0.5, 0));
        let r = g.add_like(q, "r");
        let y = g.add_tensor("y", vec![2], DType::F32, TensorKind::Intermediate);
        g.add_node(Op::Quantize, vec![x], vec![q], ROOT_SCOPE);
        g.add_node(Op::Relu, vec![q], vec![r], ROOT_SCOPE);
        g.add_node(Op::Dequantize, vec![r], vec![y], ROOT_SCOPE);
        g.outputs.push(y);
        let out = run(&g, &[HostTensor::new(vec![2], vec![-1.0, 1.2]).unwrap()]).unwrap();
        assert_eq!(out[0].to_f32_vec(), vec![0.0, 1.0]);
    }
}
