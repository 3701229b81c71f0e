//! Quantization-aware rewriting, calibration and integer conversion.

pub mod config;
pub mod convert;
pub mod observer;
pub mod rewrite;
pub mod substitute;

use std::path::{Path, PathBuf};

use log::info;

pub use config::{Backend, QuantConfig, QuantSpec, QuantTarget};
pub use observer::{FakeQuant, Observer, ObserverKind};
pub use rewrite::{rewrite, Rewriter};
pub use substitute::{Substitute, SubstitutionTable, Unit};

use crate::error::Result;
use crate::ir::{interp, Graph, ModuleKind};
use crate::nn::{GraphModule, Module};
use crate::tensor::HostTensor;
use crate::trace::{Session, TraceOptions, Tracer, Value};

/// A rewritten, quantization-aware model.
///
/// Runs like any module (fake-quantized float arithmetic) and can be
/// calibrated further before [`convert`](Self::convert).
pub struct QuantizedModule {
    module: GraphModule,
    source: Option<Box<dyn Module>>,
    config: QuantConfig,
}

impl QuantizedModule {
    pub fn graph(&self) -> &Graph {
        self.module.graph()
    }

    pub fn config(&self) -> &QuantConfig {
        &self.config
    }

    /// The float module the graph was traced from, unless it was dropped.
    pub fn source(&self) -> Option<&dyn Module> {
        self.source.as_deref()
    }

    /// Run `inputs` through the graph, updating every observer.
    pub fn calibrate(&mut self, inputs: &[HostTensor]) -> Result<Vec<HostTensor>> {
        interp::calibrate(self.module.graph_mut(), inputs)
    }

    /// Integer-quantized version of the calibrated graph.
    pub fn convert(&self) -> Result<GraphModule> {
        GraphModule::new(convert::convert(self.graph())?)
    }
}

impl Module for QuantizedModule {
    fn kind(&self) -> ModuleKind {
        self.module.kind()
    }

    fn forward(&self, s: &mut Session, inputs: &[Value]) -> Result<Vec<Value>> {
        self.module.forward(s, inputs)
    }
}

/// Builder around [`quantize`].
pub struct QatQuantizer {
    module: Box<dyn Module>,
    config: QuantConfig,
    work_dir: PathBuf,
    name: String,
    trace: TraceOptions,
}

impl QatQuantizer {
    pub fn new(module: impl Module + 'static) -> Self {
        Self {
            module: Box::new(module),
            config: QuantConfig::default(),
            work_dir: PathBuf::from("out"),
            name: "model".to_string(),
            trace: TraceOptions::default(),
        }
    }

    pub fn config(mut self, config: QuantConfig) -> Self {
        self.config = config;
        self
    }

    pub fn work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = dir.into();
        self
    }

    /// Stem of the files written to the work directory.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn dynamic_batch(mut self, dynamic: bool) -> Self {
        self.trace.dynamic_batch = dynamic;
        self
    }

    /// Trace, rewrite, calibrate on `samples` and dump the rewritten graph to
    /// `<work_dir>/<name>_qat.json`.
    pub fn quantize(self, samples: &[HostTensor]) -> Result<QuantizedModule> {
        self.config.validate()?;
        let traced = Tracer::default().with_options(self.trace).trace(self.module.as_ref(), samples)?;
        let graph = rewrite(&traced.graph, &self.config)?;
        let mut quantized = QuantizedModule {
            module: GraphModule::new(graph)?,
            source: Some(self.module),
            config: self.config,
        };
        quantized.calibrate(samples)?;

        std::fs::create_dir_all(&self.work_dir)?;
        let dump = self.work_dir.join(format!("{}_qat.json", self.name));
        std::fs::write(&dump, quantized.graph().to_json()?)?;
        info!("wrote rewritten graph to {}", dump.display());

        if quantized.config.remove_weights_after_load {
            quantized.source = None;
            quantized.module.graph_mut().compact();
        }
        Ok(quantized)
    }
}

/// Trace `module` on `samples`, rewrite it for quantization-aware execution
/// and calibrate it on the same samples.
pub fn quantize(
    module: impl Module + 'static,
    samples: &[HostTensor],
    work_dir: impl AsRef<Path>,
    config: QuantConfig,
) -> Result<QuantizedModule> {
    QatQuantizer::new(module)
        .config(config)
        .work_dir(work_dir.as_ref())
        .quantize(samples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::ir::OpKind;
    use crate::nn::{Linear, ReLU, Sequential};

    fn model() -> Sequential {
        let w = HostTensor::new(vec![2, 2], vec![1.0, -1.0, 0.5, 0.5]).unwrap();
        Sequential::new().add("fc", Linear::new(w, None)).add("act", ReLU)
    }

    #[test]
    fn test_quantize_writes_dump() {
        let dir = tempfile::tempdir().unwrap();
        let x = HostTensor::new(vec![1, 2], vec![1.0, 2.0]).unwrap();
        let q = quantize(model(), &[x], dir.path(), QuantConfig::default()).unwrap();
        let dump = std::fs::read_to_string(dir.path().join("model_qat.json")).unwrap();
        assert_eq!(&Graph::from_json(&dump).unwrap(), q.graph());
        assert!(q.source().is_some());
    }

    #[test]
    fn test_remove_weights_after_load_drops_source() {
        let dir = tempfile::tempdir().unwrap();
        let x = HostTensor::new(vec![1, 2], vec![1.0, 2.0]).unwrap();
        let config = QuantConfig::default().remove_weights_after_load(true);
        let q = QatQuantizer::new(model())
            .config(config)
            .work_dir(dir.path())
            .name("mlp")
            .quantize(&[x])
            .unwrap();
        assert!(q.source().is_none());
        assert!(dir.path().join("mlp_qat.json").exists());
    }

    #[test]
    fn test_converted_module_retraces() {
        let dir = tempfile::tempdir().unwrap();
        let x = HostTensor::new(vec![1, 2], vec![1.0, 2.0]).unwrap();
        let q = quantize(model(), &[x.clone()], dir.path(), QuantConfig::default()).unwrap();
        let int = q.convert().unwrap();
        let traced = crate::trace::trace(&int, &[x]).unwrap();
        let kinds: Vec<OpKind> = traced.graph.nodes.iter().map(|n| n.op.kind()).collect();
        assert_eq!(kinds, vec![OpKind::Quantize, OpKind::Linear, OpKind::Dequantize]);
    }

    #[test]
    fn test_invalid_config_is_rejected_before_tracing() {
        let dir = tempfile::tempdir().unwrap();
        let config = QuantConfig::default().per_tensor(false);
        let err = quantize(model(), &[HostTensor::zeros(vec![1, 2])], dir.path(), config).err().unwrap();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }
}
