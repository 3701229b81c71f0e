//! The execution driver every module dispatches through.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;

use crate::error::{Error, Result};
use crate::ir::eval::eval;
use crate::ir::interp::exec_node;
use crate::ir::{Graph, Layout, Node, Op, QuantParams, Scope, ScopeId, TensorId, TensorKind, ROOT_SCOPE};
use crate::ir::ModuleKind;
use crate::nn::Module;
use crate::registry::{Attrs, OpRegistry};
use crate::tensor::{DType, HostTensor};

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// A tensor flowing through a forward pass.
///
/// While tracing, values produced inside the session remember which graph
/// tensor they are; anything else is captured as a constant when used.
#[derive(Debug, Clone)]
pub struct Value {
    pub tensor: HostTensor,
    origin: Option<(u64, TensorId)>,
}

impl Value {
    pub fn shape(&self) -> &[usize] {
        &self.tensor.shape
    }

    pub fn into_tensor(self) -> HostTensor {
        self.tensor
    }
}

impl From<HostTensor> for Value {
    fn from(tensor: HostTensor) -> Self {
        Value { tensor, origin: None }
    }
}

pub struct Session<'r> {
    registry: &'r OpRegistry,
    id: u64,
    graph: Graph,
    recording: bool,
    dynamic_batch: bool,
    scope: ScopeId,
    constants: HashMap<(usize, Vec<usize>, DType), TensorId>,
}

impl<'r> Session<'r> {
    /// A session that only executes.
    pub fn eager(registry: &'r OpRegistry) -> Self {
        Self::new(registry, ModuleKind::Graph, false, false)
    }

    pub(crate) fn recording(registry: &'r OpRegistry, root: ModuleKind, dynamic_batch: bool) -> Self {
        Self::new(registry, root, true, dynamic_batch)
    }

    fn new(registry: &'r OpRegistry, root: ModuleKind, recording: bool, dynamic_batch: bool) -> Self {
        Self {
            registry,
            id: NEXT_SESSION.fetch_add(1, Ordering::Relaxed),
            graph: Graph::new(root),
            recording,
            dynamic_batch,
            scope: ROOT_SCOPE,
            constants: HashMap::new(),
        }
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    pub fn registry(&self) -> &'r OpRegistry {
        self.registry
    }

    /// Path of the module currently executing (`<root>` at the top).
    pub fn scope_path(&self) -> &str {
        self.graph.scope_path(self.scope)
    }

    fn own(&self, tensor: HostTensor, id: TensorId) -> Value {
        Value {
            tensor,
            origin: self.recording.then_some((self.id, id)),
        }
    }

    /// Declare a graph input.
    pub(crate) fn input(&mut self, name: &str, tensor: HostTensor) -> Value {
        if !self.recording {
            return tensor.into();
        }
        let id = self.graph.add_input(name, tensor.shape.clone(), tensor.dtype());
        if self.dynamic_batch && tensor.rank() > 0 {
            self.graph.tensor_mut(id).dynamic_axes.push(0);
        }
        self.own(tensor, id)
    }

    /// A parameter or buffer owned by the current module.
    pub fn param(&mut self, name: &str, tensor: &HostTensor) -> Value {
        self.param_quantized(name, tensor, None)
    }

    /// A parameter that already carries quantization parameters.
    pub fn param_quantized(&mut self, name: &str, tensor: &HostTensor, quant: Option<QuantParams>) -> Value {
        if !self.recording {
            return tensor.clone().into();
        }
        let name = self.graph.scope(self.scope).child_path(name);
        let id = self.capture(tensor, Some(name));
        if quant.is_some() {
            self.graph.tensor_mut(id).quant = quant;
        }
        self.own(tensor.clone(), id)
    }

    /// Constant leaf for `tensor`, shared with earlier captures of the same buffer.
    fn capture(&mut self, tensor: &HostTensor, name: Option<String>) -> TensorId {
        let key = (tensor.ptr_key(), tensor.shape.clone(), tensor.dtype());
        if let Some(&id) = self.constants.get(&key) {
            return id;
        }
        let name = name.unwrap_or_else(|| format!("const_{}", self.graph.tensors.len()));
        let id = self.graph.add_constant(name, tensor.clone());
        self.constants.insert(key, id);
        id
    }

    fn lift(&mut self, value: &Value) -> TensorId {
        match value.origin {
            Some((session, id)) if session == self.id => id,
            _ => self.capture(&value.tensor, None),
        }
    }

    fn batch_is_dynamic(&self, inputs: &[TensorId], output: &HostTensor) -> bool {
        self.dynamic_batch
            && output.rank() > 0
            && inputs.iter().any(|&id| {
                let t = self.graph.tensor(id);
                t.dynamic_axes.contains(&0) && t.shape.first() == output.shape.first()
            })
    }

    fn record(&mut self, op: Op, inputs: Vec<TensorId>, outputs: &[HostTensor], scope: ScopeId) -> Vec<TensorId> {
        let ids: Vec<TensorId> = outputs
            .iter()
            .enumerate()
            .map(|(i, out)| {
                let name = format!("{}:{}", op.kind(), self.graph.tensors.len() + i);
                let id = self.graph.add_tensor(name, out.shape.clone(), out.dtype(), TensorKind::Intermediate);
                if self.batch_is_dynamic(&inputs, out) {
                    self.graph.tensor_mut(id).dynamic_axes.push(0);
                }
                id
            })
            .collect();
        let node = self.graph.add_node(op, inputs, ids.clone(), scope);
        debug!("recorded {node} in `{}`", self.graph.scope_path(scope));
        ids
    }

    /// Dispatch operator `ident`.
    ///
    /// The identity is resolved before anything is computed, so an unknown
    /// operator fails without side effects.
    pub fn call(&mut self, ident: &str, inputs: &[&Value], attrs: Attrs) -> Result<Value> {
        let registry = self.registry;
        let Some(schema) = registry.resolve(ident).filter(|s| s.callable) else {
            return Err(Error::UnsupportedOperator {
                op: ident.to_string(),
                scope: self.scope_path().to_string(),
            });
        };
        let invalid = |reason: String| Error::InvalidArgument {
            op: ident.to_string(),
            scope: self.scope_path().to_string(),
            reason,
        };
        let tensors: Vec<&HostTensor> = inputs.iter().map(|v| &v.tensor).collect();
        let op = schema.build(&attrs, &tensors).map_err(invalid)?;
        let operands: Vec<HostTensor> = tensors.into_iter().cloned().collect();
        let mut outputs = eval(&op, &operands, Layout::ChannelFirst).map_err(|e| invalid(e.to_string()))?;
        let output = outputs.pop().ok_or_else(|| invalid("operator produced no output".into()))?;

        if !self.recording {
            return Ok(output.into());
        }
        let ids = inputs.iter().map(|v| self.lift(v)).collect();
        let out_ids = self.record(op, ids, std::slice::from_ref(&output), self.scope);
        Ok(self.own(output, out_ids[0]))
    }

    /// Run a child module under scope `<current>.<name>`.
    pub fn invoke(&mut self, name: &str, module: &dyn Module, inputs: &[Value]) -> Result<Vec<Value>> {
        let path = self.graph.scope(self.scope).child_path(name);
        let child = self.graph.intern_scope(&path, module.kind(), self.scope);
        let parent = std::mem::replace(&mut self.scope, child);
        let result = module.forward(self, inputs);
        self.scope = parent;
        result
    }

    /// Recreate `scopes` (in order) under the current scope.
    pub fn import_scopes(&mut self, scopes: &[Scope]) -> Vec<ScopeId> {
        let base = self.scope;
        let mut map = Vec::with_capacity(scopes.len());
        for scope in scopes {
            let id = match scope.parent {
                None => base,
                Some(parent) => {
                    let path = if self.graph.scope(base).path.is_empty() {
                        scope.path.clone()
                    } else {
                        format!("{}.{}", self.graph.scope(base).path, scope.path)
                    };
                    self.graph.intern_scope(&path, scope.kind.clone(), map[parent])
                }
            };
            map.push(id);
        }
        map
    }

    /// Replay `node` of `source`: execute it with the source descriptors and
    /// record a copy of it (op, output dtypes and quantization) under `scope`.
    pub fn apply_node(&mut self, source: &Graph, node: &Node, inputs: &[Value], scope: ScopeId) -> Result<Vec<Value>> {
        let operands: Vec<HostTensor> = inputs.iter().map(|v| v.tensor.clone()).collect();
        let outputs = exec_node(source, node, &operands)?;
        if !self.recording {
            return Ok(outputs.into_iter().map(Value::from).collect());
        }
        let ids: Vec<TensorId> = inputs.iter().map(|v| self.lift(v)).collect();
        let out_ids = self.record(node.op.clone(), ids, &outputs, scope);
        for (&id, &src) in out_ids.iter().zip(&node.outputs) {
            let desc = source.tensor(src);
            let t = self.graph.tensor_mut(id);
            t.name = desc.name.clone();
            t.quant = desc.quant.clone();
        }
        if let Some(recorded) = self.graph.nodes.last_mut() {
            recorded.layout = node.layout;
        }
        Ok(outputs
            .into_iter()
            .zip(out_ids)
            .map(|(t, id)| self.own(t, id))
            .collect())
    }

    /// Close the recording with `outputs` as graph outputs.
    pub(crate) fn finish(mut self, outputs: &[Value]) -> Result<Graph> {
        for v in outputs {
            let id = self.lift(v);
            self.graph.outputs.push(id);
        }
        self.graph.validate()?;
        Ok(self.graph)
    }
}
