//! Module scope tree recorded while tracing.

use std::fmt;

use serde::{Deserialize, Serialize};

pub type ScopeId = usize;

/// The root scope every graph starts with.
pub const ROOT_SCOPE: ScopeId = 0;

/// Tag identifying what kind of module produced a scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ModuleKind {
    Sequential,
    Linear,
    Conv2d,
    BatchNorm2d,
    ReLU,
    ReLU6,
    Hardtanh,
    Sigmoid,
    Tanh,
    Hardswish,
    MaxPool2d,
    AvgPool2d,
    AdaptiveAvgPool2d,
    Flatten,
    Dropout,
    Softmax,
    // Fused units, produced by module fusion.
    ConvBn2d,
    ConvBnReLU2d,
    ConvReLU2d,
    LinearReLU,
    // Quantization-aware replacements.
    QatLinear,
    QatConv2d,
    /// A replayed `GraphModule`.
    Graph,
    /// User-defined module; the name is informational only.
    Custom(String),
}

impl ModuleKind {
    pub fn is_fused(&self) -> bool {
        matches!(
            self,
            ModuleKind::ConvBn2d
                | ModuleKind::ConvBnReLU2d
                | ModuleKind::ConvReLU2d
                | ModuleKind::LinearReLU
        )
    }
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleKind::Custom(name) => f.write_str(name),
            other => write!(f, "{other:?}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scope {
    /// Dotted path from the root module, e.g. `features.0`. Empty for the root.
    pub path: String,
    pub kind: ModuleKind,
    pub parent: Option<ScopeId>,
}

impl Scope {
    pub fn root(kind: ModuleKind) -> Self {
        Self {
            path: String::new(),
            kind,
            parent: None,
        }
    }

    /// Path as shown in diagnostics; the root reads as `<root>`.
    pub fn display_path(&self) -> &str {
        if self.path.is_empty() {
            "<root>"
        } else {
            &self.path
        }
    }

    /// Path of a child scope called `name`.
    pub fn child_path(&self, name: &str) -> String {
        if self.path.is_empty() {
            name.to_string()
        } else {
            format!("{}.{}", self.path, name)
        }
    }
}
