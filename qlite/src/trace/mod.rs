//! Graph capture from one eager forward pass.

mod session;

pub use session::{Session, Value};

use log::info;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::ir::Graph;
use crate::nn::Module;
use crate::registry::OpRegistry;
use crate::tensor::HostTensor;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceOptions {
    /// Mark axis 0 of every input, and of tensors that keep it, as dynamic.
    pub dynamic_batch: bool,
}

/// A recorded graph and the outputs the traced pass produced.
#[derive(Debug, Clone)]
pub struct Traced {
    pub graph: Graph,
    pub outputs: Vec<HostTensor>,
}

/// Records modules into graphs. Holds no per-trace state.
#[derive(Debug, Clone, Copy)]
pub struct Tracer<'r> {
    registry: &'r OpRegistry,
    options: TraceOptions,
}

impl Default for Tracer<'static> {
    fn default() -> Self {
        Self::new(OpRegistry::standard())
    }
}

impl<'r> Tracer<'r> {
    pub fn new(registry: &'r OpRegistry) -> Self {
        Self {
            registry,
            options: TraceOptions::default(),
        }
    }

    pub fn with_options(mut self, options: TraceOptions) -> Self {
        self.options = options;
        self
    }

    /// Execute `module` once on `inputs`, recording every dispatched operator.
    ///
    /// Only the branch actually taken is captured.
    pub fn trace(&self, module: &dyn Module, inputs: &[HostTensor]) -> Result<Traced> {
        let mut session = Session::recording(self.registry, module.kind(), self.options.dynamic_batch);
        let args: Vec<Value> = inputs
            .iter()
            .enumerate()
            .map(|(i, t)| session.input(&format!("input_{i}"), t.clone()))
            .collect();
        let outputs = module.forward(&mut session, &args)?;
        let graph = session.finish(&outputs)?;
        info!(
            "traced {} module: {} nodes, {} tensors",
            graph.root_kind(),
            graph.nodes.len(),
            graph.tensors.len()
        );
        Ok(Traced {
            graph,
            outputs: outputs.into_iter().map(Value::into_tensor).collect(),
        })
    }
}

/// Trace with the standard registry and default options.
pub fn trace(module: &dyn Module, inputs: &[HostTensor]) -> Result<Traced> {
    Tracer::default().trace(module, inputs)
}

/// Run `module` without recording.
pub fn run(module: &dyn Module, inputs: &[HostTensor]) -> Result<Vec<HostTensor>> {
    let mut session = Session::eager(OpRegistry::standard());
    let args: Vec<Value> = inputs.iter().cloned().map(Value::from).collect();
    let outputs = module.forward(&mut session, &args)?;
    Ok(outputs.into_iter().map(Value::into_tensor).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::ir::{ModuleKind, OpKind};
    use crate::nn::{functional as F, FnModule, GraphModule, Linear, ReLU, Sequential};

    fn mlp() -> Sequential {
        let w = HostTensor::new(vec![2, 3], vec![1.0, 0.0, 0.0, 0.0, 1.0, 0.0]).unwrap();
        Sequential::new()
            .add("fc", Linear::new(w, None))
            .add("act", ReLU)
    }

    #[test]
    fn test_trace_records_scopes() {
        let x = HostTensor::new(vec![1, 3], vec![1.0, -2.0, 3.0]).unwrap();
        let traced = trace(&mlp(), &[x]).unwrap();
        let g = &traced.graph;
        assert_eq!(g.nodes.len(), 2);
        assert_eq!(g.scope_path(g.nodes[0].scope), "fc");
        assert_eq!(g.scope(g.nodes[1].scope).kind, ModuleKind::ReLU);
        assert_eq!(traced.outputs[0].to_f32_vec(), vec![1.0, 0.0]);
        let weight = g.nodes[0].inputs[1];
        assert_eq!(g.tensor(weight).name, "fc.weight");
    }

    #[test]
    fn test_trace_is_repeatable() {
        let m = mlp();
        let a = trace(&m, &[HostTensor::full(vec![1, 3], 1.0)]).unwrap();
        let b = trace(&m, &[HostTensor::full(vec![1, 3], -1.0)]).unwrap();
        let kinds = |g: &Graph| g.nodes.iter().map(|n| n.op.kind()).collect::<Vec<_>>();
        assert_eq!(kinds(&a.graph), kinds(&b.graph));
        assert_eq!(a.graph.tensors.len(), b.graph.tensors.len());
    }

    #[test]
    fn test_unsupported_operator_names_scope() {
        let inner = FnModule::new("Weird", |s, xs| {
            Ok(vec![s.call("erfinv", &[&xs[0]], Default::default())?])
        });
        let model = Sequential::new().add("block", inner);
        let err = trace(&model, &[HostTensor::zeros(vec![2])]).unwrap_err();
        match err {
            Error::UnsupportedOperator { op, scope } => {
                assert_eq!(op, "erfinv");
                assert_eq!(scope, "block");
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_only_taken_branch_is_recorded() {
        let branchy = FnModule::new("Branchy", |s, xs| {
            let x = &xs[0];
            let y = if x.tensor.to_f32_vec()[0] > 0.0 {
                F::relu(s, x)?
            } else {
                F::sigmoid(s, x)?
            };
            Ok(vec![y])
        });
        let g = trace(&branchy, &[HostTensor::full(vec![1], 1.0)]).unwrap().graph;
        assert_eq!(g.nodes.len(), 1);
        assert_eq!(g.nodes[0].op.kind(), OpKind::Relu);
    }

    #[test]
    fn test_graph_module_retraces_identically() {
        let x = HostTensor::new(vec![1, 3], vec![1.0, -2.0, 3.0]).unwrap();
        let traced = trace(&mlp(), &[x.clone()]).unwrap();
        let gm = GraphModule::new(traced.graph.clone()).unwrap();
        let again = trace(&gm, &[x]).unwrap();
        assert_eq!(again.outputs, traced.outputs);
        let kinds = |g: &Graph| g.nodes.iter().map(|n| n.op.kind()).collect::<Vec<_>>();
        assert_eq!(kinds(&again.graph), kinds(&traced.graph));
        assert_eq!(again.graph.scope_path(again.graph.nodes[0].scope), "fc");
    }
}
