//! TFLite export.
//!
//! `lower()` resolves a finalized graph into a [`ModelPlan`]; `render()`
//! writes the plan as a `TFL3` flatbuffer.

mod lower;
pub mod plan;
mod render;

use std::io::Write;
use std::path::{Path, PathBuf};

use log::info;
use serde::{Deserialize, Serialize};

pub use lower::lower;
pub use plan::{ModelPlan, OpcodePlan, OperatorPlan, Options, QuantPlan, SubgraphPlan, TensorPlan};
pub use render::render;

use crate::error::{Error, Result};
use crate::ir::eval::NCHW_TO_NHWC;
use crate::ir::{interp, Graph};
use crate::nn::Module;
use crate::optimize::optimize;
use crate::tensor::HostTensor;
use crate::trace::Tracer;

/// Storage type of quantized tensors in the written model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum QuantizedElementType {
    #[default]
    #[serde(rename = "int8")]
    Int8,
    /// Every `i8` tensor is written as `u8` with zero points shifted by 128.
    #[serde(rename = "uint8")]
    UInt8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConverterOptions {
    /// Dump the traced graph here before optimizing.
    pub dump_intermediate_model_path: Option<PathBuf>,
    /// Drop the traced graph after dumping and continue from the dump.
    pub reclaim_memory_after_dump: bool,
    pub target_quantized_element_type: QuantizedElementType,
    /// Declare rank-4 inputs NHWC instead of transposing them on entry.
    pub nchw_transpose: bool,
    pub description: String,
}

impl Default for ConverterOptions {
    fn default() -> Self {
        Self {
            dump_intermediate_model_path: None,
            reclaim_memory_after_dump: false,
            target_quantized_element_type: QuantizedElementType::Int8,
            nchw_transpose: true,
            description: "qlite".to_string(),
        }
    }
}

impl ConverterOptions {
    pub fn dump_intermediate_model(mut self, path: impl Into<PathBuf>) -> Self {
        self.dump_intermediate_model_path = Some(path.into());
        self
    }

    pub fn reclaim_memory_after_dump(mut self, reclaim: bool) -> Self {
        self.reclaim_memory_after_dump = reclaim;
        self
    }

    pub fn target(mut self, target: QuantizedElementType) -> Self {
        self.target_quantized_element_type = target;
        self
    }

    pub fn nchw_transpose(mut self, transpose: bool) -> Self {
        self.nchw_transpose = transpose;
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.reclaim_memory_after_dump && self.dump_intermediate_model_path.is_none() {
            return Err(Error::InvalidConfig(
                "reclaim_memory_after_dump requires dump_intermediate_model_path".into(),
            ));
        }
        Ok(())
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let options: Self = serde_json::from_str(text)?;
        options.validate()?;
        Ok(options)
    }
}

/// Traces a module on sample inputs and writes it as a TFLite model.
pub struct TfliteConverter<'m> {
    module: &'m dyn Module,
    inputs: Vec<HostTensor>,
    path: PathBuf,
    options: ConverterOptions,
    outputs: Vec<HostTensor>,
    transposed: Vec<bool>,
}

impl<'m> TfliteConverter<'m> {
    pub fn new(module: &'m dyn Module, inputs: Vec<HostTensor>, path: impl Into<PathBuf>, options: ConverterOptions) -> Self {
        Self {
            module,
            inputs,
            path: path.into(),
            options,
            outputs: Vec::new(),
            transposed: Vec::new(),
        }
    }

    pub fn convert(&mut self) -> Result<()> {
        self.options.validate()?;
        let traced = Tracer::default().trace(self.module, &self.inputs)?;
        interp::check_inputs(&traced.graph, &self.inputs)?;

        let graph = match &self.options.dump_intermediate_model_path {
            Some(dump) => {
                std::fs::write(dump, traced.graph.to_json()?)?;
                info!("wrote traced graph to {}", dump.display());
                if self.options.reclaim_memory_after_dump {
                    drop(traced);
                    Graph::from_json(&std::fs::read_to_string(dump)?)?
                } else {
                    traced.graph
                }
            }
            None => traced.graph,
        };

        let (outputs, transposed) = convert_graph(graph, &self.inputs, &self.path, &self.options)?;
        self.outputs = outputs;
        self.transposed = transposed;
        Ok(())
    }

    /// Outputs of the written model on the sample inputs.
    pub fn get_outputs(&self) -> &[HostTensor] {
        &self.outputs
    }

    /// Per input, whether it is declared NHWC in the written model.
    pub fn input_transpose(&self) -> &[bool] {
        &self.transposed
    }
}

/// Optimize, evaluate and serialize an already traced graph.
///
/// Returns the outputs on `inputs` (given channel-first) and the per-input
/// transpose flags.
pub fn convert_graph(
    mut graph: Graph,
    inputs: &[HostTensor],
    path: &Path,
    options: &ConverterOptions,
) -> Result<(Vec<HostTensor>, Vec<bool>)> {
    options.validate()?;
    interp::check_inputs(&graph, inputs)?;
    let transposed = optimize(&mut graph, options.nchw_transpose)?;

    let feed = inputs
        .iter()
        .zip(&transposed)
        .map(|(t, &nhwc)| if nhwc { t.permute(&NCHW_TO_NHWC) } else { Ok(t.clone()) })
        .collect::<Result<Vec<_>>>()?;
    let outputs = interp::run(&graph, &feed)?;

    let plan = lower(&graph, options.target_quantized_element_type, &options.description)?;
    let bytes = render(&plan);
    write_atomic(path, &bytes)?;
    info!(
        "wrote {} ({} bytes, {} operators)",
        path.display(),
        bytes.len(),
        plan.subgraphs.first().map_or(0, |sg| sg.operators.len())
    );
    Ok((outputs, transposed))
}

/// Write through a temporary file in the destination directory so a failed
/// conversion never leaves a partial model behind.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    file.write_all(bytes)?;
    file.persist(path).map_err(|err| Error::Io(err.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Activation, Op, TensorKind, ROOT_SCOPE};
    use crate::parse::tflite::read_model;
    use crate::parse::tflite::schema::BuiltinOperator;
    use crate::tensor::DType;

    fn linear_graph() -> Graph {
        let mut g = Graph::default();
        let x = g.add_input("x", vec![1, 2], DType::F32);
        let w = g.add_constant("w", HostTensor::new(vec![2, 2], vec![1.0, 0.0, 0.0, -1.0]).unwrap());
        let y = g.add_tensor("y", vec![1, 2], DType::F32, TensorKind::Intermediate);
        let r = g.add_tensor("r", vec![1, 2], DType::F32, TensorKind::Intermediate);
        g.add_node(Op::Linear { fused: Activation::None }, vec![x, w], vec![y], ROOT_SCOPE);
        g.add_node(Op::Relu, vec![y], vec![r], ROOT_SCOPE);
        g.outputs.push(r);
        g
    }

    #[test]
    fn test_convert_graph_writes_readable_model() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.tflite");
        let x = HostTensor::new(vec![1, 2], vec![3.0, 4.0]).unwrap();
        let (outputs, transposed) = convert_graph(linear_graph(), &[x], &path, &ConverterOptions::default()).unwrap();
        assert_eq!(outputs[0].to_f32_vec(), vec![3.0, 0.0]);
        assert_eq!(transposed, vec![false]);

        let plan = read_model(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(plan.builtins(), vec![BuiltinOperator::FULLY_CONNECTED]);
        assert_eq!(plan.description, "qlite");
    }

    #[test]
    fn test_failed_conversion_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.tflite");
        let mut g = linear_graph();
        g.nodes[1].op = Op::Softmax { axis: 0 };
        let x = HostTensor::new(vec![1, 2], vec![3.0, 4.0]).unwrap();
        let err = convert_graph(g, &[x], &path, &ConverterOptions::default()).unwrap_err();
        assert!(matches!(err, Error::UnsupportedOperatorForTarget { .. }));
        assert!(!path.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_options_validation() {
        let err = ConverterOptions::default().reclaim_memory_after_dump(true).validate().unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
        let options = ConverterOptions::from_json(r#"{"target_quantized_element_type": "uint8"}"#).unwrap();
        assert_eq!(options.target_quantized_element_type, QuantizedElementType::UInt8);
        assert!(ConverterOptions::from_json(r#"{"nchw_transposed": true}"#).is_err());
        let options = ConverterOptions::from_json(r#"{"nchw_transpose": false}"#).unwrap();
        assert!(!options.nchw_transpose);
    }
}
