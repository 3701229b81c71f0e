//! Graph IR: tensors, nodes, scopes, quantization parameters and a
//! reference interpreter.

pub mod eval;
pub mod graph;
pub mod interp;
pub mod op;
pub mod quant;
pub mod scope;

pub use graph::{Graph, Layout, Node, NodeId, Tensor, TensorId, TensorKind};
pub use op::{Activation, Conv2dAttrs, Op, OpKind, PoolAttrs, QatConv, QatLinear};
pub use quant::QuantParams;
pub use scope::{ModuleKind, Scope, ScopeId, ROOT_SCOPE};
