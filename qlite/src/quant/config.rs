//! Quantization configuration.

use std::collections::BTreeSet;
use std::path::Path;

use qlite_kernels::{QRange, Rounding};
use serde::{Deserialize, Serialize};

use super::observer::ObserverKind;
use crate::error::{Error, Result};
use crate::ir::scope::ModuleKind;
use crate::ir::OpKind;
use crate::tensor::DType;

#[derive(Serialize, Deserialize)]
#[serde(remote = "Rounding", rename_all = "snake_case")]
enum RoundingDef {
    HalfToEven,
    HalfAwayFromZero,
}

/// How one class of tensors (activations or weights) is quantized.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuantSpec {
    /// Storage type of the quantized values (`i8` or `u8`).
    pub dtype: DType,
    pub symmetric: bool,
    /// Per-channel along axis 0 (weights only).
    pub per_channel: bool,
    pub observer: ObserverKind,
    #[serde(with = "RoundingDef")]
    pub rounding: Rounding,
    /// Use half of the integer range, leaving headroom for 16-bit accumulation.
    pub reduce_range: bool,
}

impl QuantSpec {
    /// Asymmetric per-tensor int8 activations with a moving-average observer.
    pub fn activation() -> Self {
        Self {
            dtype: DType::I8,
            symmetric: false,
            per_channel: false,
            observer: ObserverKind::default(),
            rounding: Rounding::HalfToEven,
            reduce_range: false,
        }
    }

    /// Symmetric int8 weights in `[-127, 127]`.
    pub fn weight(per_channel: bool) -> Self {
        Self {
            dtype: DType::I8,
            symmetric: true,
            per_channel,
            observer: ObserverKind::MinMax,
            rounding: Rounding::HalfToEven,
            reduce_range: false,
        }
    }

    pub fn qrange(&self) -> QRange {
        match (self.dtype, self.symmetric, self.reduce_range) {
            (DType::U8, _, true) => QRange { min: 0, max: 127 },
            (DType::U8, _, false) => QRange::UINT8,
            (_, _, true) => QRange::INT8_REDUCED,
            (_, true, false) => QRange::INT8_SYMMETRIC,
            (_, false, false) => QRange::INT8,
        }
    }

    fn validate(&self, role: &str) -> Result<()> {
        if !matches!(self.dtype, DType::I8 | DType::U8) {
            return Err(Error::InvalidConfig(format!(
                "{role} dtype must be i8 or u8, got {}",
                self.dtype
            )));
        }
        if let ObserverKind::MovingAverageMinMax { averaging_constant } = self.observer {
            if !(averaging_constant > 0.0 && averaging_constant <= 1.0) {
                return Err(Error::InvalidConfig(format!(
                    "{role} averaging constant {averaging_constant} outside (0, 1]"
                )));
            }
        }
        Ok(())
    }
}

/// Quantized-kernel profile the rewritten model targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Mobile profile: per-tensor only, full int8 range, ties away from zero.
    #[default]
    Qnnpack,
    /// Server profile: per-channel weights, reduced activation range, ties to even.
    Fbgemm,
}

/// Something the rewriter may quantize.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantTarget {
    Op(OpKind),
    Module(ModuleKind),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuantConfig {
    pub backend: Backend,
    /// Force per-tensor weight quantization.
    pub per_tensor: bool,
    /// Drop the float source module once the rewritten graph is built.
    pub remove_weights_after_load: bool,
    pub activation: QuantSpec,
    pub weight: QuantSpec,
    pub targets: BTreeSet<QuantTarget>,
    /// Scope paths (and their descendants) left in float.
    pub skip_scopes: Vec<String>,
}

impl Default for QuantConfig {
    fn default() -> Self {
        Self::for_backend(Backend::default())
    }
}

impl QuantConfig {
    pub fn for_backend(backend: Backend) -> Self {
        let (per_tensor, rounding, reduce_range) = match backend {
            Backend::Qnnpack => (true, Rounding::HalfAwayFromZero, false),
            Backend::Fbgemm => (false, Rounding::HalfToEven, true),
        };
        let activation = QuantSpec {
            rounding,
            reduce_range,
            ..QuantSpec::activation()
        };
        let weight = QuantSpec {
            rounding,
            ..QuantSpec::weight(!per_tensor)
        };
        Self {
            backend,
            per_tensor,
            remove_weights_after_load: false,
            activation,
            weight,
            targets: default_targets(),
            skip_scopes: Vec::new(),
        }
    }

    pub fn per_tensor(mut self, per_tensor: bool) -> Self {
        self.per_tensor = per_tensor;
        self.weight.per_channel = !per_tensor;
        self
    }

    pub fn remove_weights_after_load(mut self, remove: bool) -> Self {
        self.remove_weights_after_load = remove;
        self
    }

    pub fn skip_scope(mut self, path: impl Into<String>) -> Self {
        self.skip_scopes.push(path.into());
        self
    }

    pub fn enable(mut self, target: QuantTarget) -> Self {
        self.targets.insert(target);
        self
    }

    pub fn disable(mut self, target: &QuantTarget) -> Self {
        self.targets.remove(target);
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.activation.validate("activation")?;
        self.weight.validate("weight")?;
        if self.activation.per_channel {
            return Err(Error::InvalidConfig(
                "activations can only be quantized per tensor".into(),
            ));
        }
        if self.weight.per_channel == self.per_tensor {
            return Err(Error::InvalidConfig(format!(
                "weight.per_channel = {} contradicts per_tensor = {}",
                self.weight.per_channel, self.per_tensor
            )));
        }
        if self.backend == Backend::Qnnpack && !self.per_tensor {
            return Err(Error::InvalidConfig(
                "the qnnpack backend only supports per-tensor quantization".into(),
            ));
        }
        Ok(())
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: QuantConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn is_op_enabled(&self, kind: OpKind) -> bool {
        self.targets.contains(&QuantTarget::Op(kind))
    }

    pub fn is_module_enabled(&self, kind: &ModuleKind) -> bool {
        self.targets.contains(&QuantTarget::Module(kind.clone()))
    }

    /// Whether `path` lies inside a skipped scope.
    pub fn is_skipped(&self, path: &str) -> bool {
        self.skip_scopes.iter().any(|skip| {
            path == skip || (path.starts_with(skip.as_str()) && path[skip.len()..].starts_with('.'))
        })
    }
}

fn default_targets() -> BTreeSet<QuantTarget> {
    let ops = [
        OpKind::Conv2d,
        OpKind::Linear,
        OpKind::Add,
        OpKind::Sub,
        OpKind::Mul,
        OpKind::Maximum,
        OpKind::Minimum,
        OpKind::Relu,
        OpKind::Relu6,
        OpKind::Clamp,
        OpKind::Sigmoid,
        OpKind::Tanh,
        OpKind::Hardswish,
        OpKind::Softmax,
        OpKind::MaxPool2d,
        OpKind::AvgPool2d,
        OpKind::Mean,
        OpKind::Reshape,
        OpKind::Flatten,
        OpKind::Transpose,
        OpKind::Concat,
        OpKind::Pad,
    ];
    let modules = [
        ModuleKind::Linear,
        ModuleKind::Conv2d,
        ModuleKind::ConvBn2d,
        ModuleKind::ConvBnReLU2d,
        ModuleKind::ConvReLU2d,
        ModuleKind::LinearReLU,
    ];
    ops.into_iter()
        .map(QuantTarget::Op)
        .chain(modules.into_iter().map(QuantTarget::Module))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_profiles() {
        let q = QuantConfig::for_backend(Backend::Qnnpack);
        assert!(q.per_tensor);
        assert_eq!(q.activation.rounding, Rounding::HalfAwayFromZero);
        assert_eq!(q.activation.qrange(), QRange::INT8);
        q.validate().unwrap();

        let f = QuantConfig::for_backend(Backend::Fbgemm);
        assert!(f.weight.per_channel);
        assert_eq!(f.activation.rounding, Rounding::HalfToEven);
        assert_eq!(f.activation.qrange(), QRange::INT8_REDUCED);
        f.validate().unwrap();
    }

    #[test]
    fn test_qnnpack_rejects_per_channel() {
        let err = QuantConfig::for_backend(Backend::Qnnpack)
            .per_tensor(false)
            .validate()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_skip_scope_matches_descendants() {
        let q = QuantConfig::default().skip_scope("head");
        assert!(q.is_skipped("head"));
        assert!(q.is_skipped("head.fc"));
        assert!(!q.is_skipped("header"));
        assert!(!q.is_skipped("body"));
    }

    #[test]
    fn test_json_round_trip_and_partial() {
        let q = QuantConfig::for_backend(Backend::Fbgemm).skip_scope("stem");
        let text = serde_json::to_string(&q).unwrap();
        assert_eq!(QuantConfig::from_json(&text).unwrap(), q);

        let partial = QuantConfig::from_json(r#"{"remove_weights_after_load": true}"#).unwrap();
        assert!(partial.remove_weights_after_load);
        assert_eq!(partial.backend, Backend::Qnnpack);
    }

    #[test]
    fn test_invalid_dtype_rejected() {
        let mut q = QuantConfig::default();
        q.activation.dtype = DType::I32;
        assert!(q.validate().is_err());
    }
}
