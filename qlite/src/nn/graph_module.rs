use super::Module;
use crate::error::{Error, Result};
use crate::ir::interp::check_input_shapes;
use crate::ir::{Graph, ModuleKind, TensorKind};
use crate::trace::{Session, Value};

/// A module whose forward pass replays a graph node by node.
///
/// Tracing a `GraphModule` reproduces the graph (ops, scopes, tensor names
/// and quantization parameters), so rewritten and converted graphs can be
/// run eagerly and traced again like any other module.
#[derive(Debug, Clone)]
pub struct GraphModule {
    graph: Graph,
}

impl GraphModule {
    pub fn new(graph: Graph) -> Result<Self> {
        graph.validate()?;
        Ok(Self { graph })
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut Graph {
        &mut self.graph
    }

    pub fn into_graph(self) -> Graph {
        self.graph
    }
}

impl Module for GraphModule {
    fn kind(&self) -> ModuleKind {
        self.graph.root_kind().clone()
    }

    fn forward(&self, s: &mut Session, inputs: &[Value]) -> Result<Vec<Value>> {
        let g = &self.graph;
        if inputs.len() != g.inputs.len() {
            return Err(Error::InvalidArgument {
                op: "GraphModule".into(),
                scope: s.scope_path().to_string(),
                reason: format!("expected {} inputs, got {}", g.inputs.len(), inputs.len()),
            });
        }
        let shapes: Vec<&[usize]> = inputs.iter().map(Value::shape).collect();
        check_input_shapes(g, &shapes)?;
        let scopes = s.import_scopes(&g.scopes);
        let mut values: Vec<Option<Value>> = vec![None; g.tensors.len()];
        for (value, &id) in inputs.iter().zip(&g.inputs) {
            values[id] = Some(value.clone());
        }
        for t in &g.tensors {
            if let (TensorKind::Constant { .. }, Some(data)) = (&t.kind, t.constant()) {
                values[t.id] = Some(s.param_quantized(&t.name, &data, t.quant.clone()));
            }
        }
        for node in &g.nodes {
            let args = node
                .inputs
                .iter()
                .map(|&id| {
                    values[id]
                        .clone()
                        .ok_or_else(|| Error::InvalidGraph(format!("{} reads tensor {id} before it is computed", node.id)))
                })
                .collect::<Result<Vec<_>>>()?;
            let outputs = s.apply_node(g, node, &args, scopes[node.scope])?;
            for (value, &id) in outputs.into_iter().zip(&node.outputs) {
                values[id] = Some(value);
            }
        }
        g.outputs
            .iter()
            .map(|&id| {
                values[id]
                    .clone()
                    .ok_or_else(|| Error::InvalidGraph(format!("output {id} was never computed")))
            })
            .collect()
    }
}
