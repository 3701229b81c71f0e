//! Core graph types.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};

use super::op::Op;
use super::quant::QuantParams;
use super::scope::{ModuleKind, Scope, ScopeId, ROOT_SCOPE};
use crate::error::{Error, Result};
use crate::tensor::{DType, HostTensor, TensorData};

pub type TensorId = usize;

/// Physical axis order of a rank-4 activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layout {
    /// NCHW, as traced.
    #[default]
    ChannelFirst,
    /// NHWC, as the target runtime expects.
    ChannelLast,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TensorKind {
    /// Graph input - provided by caller
    Input,
    /// Weights, biases, folded values
    Constant { data: TensorData },
    /// Produced by a node
    Intermediate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    pub id: TensorId,
    pub name: String,
    pub shape: Vec<usize>,
    /// Axes whose size is only known at run time.
    #[serde(default)]
    pub dynamic_axes: Vec<usize>,
    pub dtype: DType,
    pub kind: TensorKind,
    #[serde(default)]
    pub quant: Option<QuantParams>,
    #[serde(default)]
    pub layout: Layout,
}

impl Tensor {
    pub fn is_constant(&self) -> bool {
        matches!(self.kind, TensorKind::Constant { .. })
    }

    /// Constant payload as a host tensor (shares the buffer).
    pub fn constant(&self) -> Option<HostTensor> {
        match &self.kind {
            TensorKind::Constant { data } => Some(HostTensor {
                shape: self.shape.clone(),
                data: data.clone(),
            }),
            _ => None,
        }
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Stable node identity; survives reordering and removal of other nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub op: Op,
    pub inputs: Vec<TensorId>,
    pub outputs: Vec<TensorId>,
    pub scope: ScopeId,
    #[serde(default)]
    pub layout: Option<Layout>,
}

/// A static dataflow graph with nodes in topological order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    pub tensors: Vec<Tensor>,
    pub nodes: Vec<Node>,
    pub inputs: Vec<TensorId>,
    pub outputs: Vec<TensorId>,
    pub scopes: Vec<Scope>,
    next_node: usize,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new(ModuleKind::Graph)
    }
}

impl Graph {
    pub fn new(root: ModuleKind) -> Self {
        Self {
            tensors: Vec::new(),
            nodes: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            scopes: vec![Scope::root(root)],
            next_node: 0,
        }
    }

    pub fn tensor(&self, id: TensorId) -> &Tensor {
        &self.tensors[id]
    }

    pub fn tensor_mut(&mut self, id: TensorId) -> &mut Tensor {
        &mut self.tensors[id]
    }

    pub fn add_tensor(&mut self, name: impl Into<String>, shape: Vec<usize>, dtype: DType, kind: TensorKind) -> TensorId {
        let id = self.tensors.len();
        self.tensors.push(Tensor {
            id,
            name: name.into(),
            shape,
            dynamic_axes: Vec::new(),
            dtype,
            kind,
            quant: None,
            layout: Layout::ChannelFirst,
        });
        id
    }

    pub fn add_input(&mut self, name: impl Into<String>, shape: Vec<usize>, dtype: DType) -> TensorId {
        let id = self.add_tensor(name, shape, dtype, TensorKind::Input);
        self.inputs.push(id);
        id
    }

    pub fn add_constant(&mut self, name: impl Into<String>, value: HostTensor) -> TensorId {
        let dtype = value.dtype();
        self.add_tensor(name, value.shape, dtype, TensorKind::Constant { data: value.data })
    }

    /// New intermediate shaped like `like` (same dtype, quantization, layout).
    pub fn add_like(&mut self, like: TensorId, name: impl Into<String>) -> TensorId {
        let template = self.tensors[like].clone();
        let id = self.add_tensor(name, template.shape, template.dtype, TensorKind::Intermediate);
        let t = &mut self.tensors[id];
        t.dynamic_axes = template.dynamic_axes;
        t.quant = template.quant;
        t.layout = template.layout;
        id
    }

    /// Append a node at the end of the order and return its id.
    pub fn add_node(&mut self, op: Op, inputs: Vec<TensorId>, outputs: Vec<TensorId>, scope: ScopeId) -> NodeId {
        let node = self.make_node(op, inputs, outputs, scope);
        let id = node.id;
        self.nodes.push(node);
        id
    }

    /// Build a node with a fresh id without placing it in the order.
    pub fn make_node(&mut self, op: Op, inputs: Vec<TensorId>, outputs: Vec<TensorId>, scope: ScopeId) -> Node {
        let id = NodeId(self.next_node);
        self.next_node += 1;
        Node {
            id,
            op,
            inputs,
            outputs,
            scope,
            layout: None,
        }
    }

    pub fn node_index(&self, id: NodeId) -> Option<usize> {
        self.nodes.iter().position(|n| n.id == id)
    }

    // -----------------------------------------------------------------------
    // Scopes
    // -----------------------------------------------------------------------

    pub fn scope(&self, id: ScopeId) -> &Scope {
        &self.scopes[id]
    }

    pub fn scope_path(&self, id: ScopeId) -> &str {
        self.scopes[id].display_path()
    }

    /// Scope for `path` under `parent`, created on first use.
    pub fn intern_scope(&mut self, path: &str, kind: ModuleKind, parent: ScopeId) -> ScopeId {
        if let Some(id) = self.scopes.iter().position(|s| s.path == path) {
            return id;
        }
        self.scopes.push(Scope {
            path: path.to_string(),
            kind,
            parent: Some(parent),
        });
        self.scopes.len() - 1
    }

    /// Whether `scope` is `ancestor` or nested inside it.
    pub fn scope_within(&self, mut scope: ScopeId, ancestor: ScopeId) -> bool {
        loop {
            if scope == ancestor {
                return true;
            }
            match self.scopes[scope].parent {
                Some(parent) => scope = parent,
                None => return false,
            }
        }
    }

    pub fn root_kind(&self) -> &ModuleKind {
        &self.scopes[ROOT_SCOPE].kind
    }

    // -----------------------------------------------------------------------
    // Use-def
    // -----------------------------------------------------------------------

    /// Index (into `nodes`) of the producer of each tensor.
    pub fn producers(&self) -> Vec<Option<usize>> {
        let mut producers = vec![None; self.tensors.len()];
        for (i, node) in self.nodes.iter().enumerate() {
            for &out in &node.outputs {
                producers[out] = Some(i);
            }
        }
        producers
    }

    /// Indices (into `nodes`) of the consumers of each tensor.
    pub fn consumers(&self) -> Vec<Vec<usize>> {
        let mut consumers = vec![Vec::new(); self.tensors.len()];
        for (i, node) in self.nodes.iter().enumerate() {
            for &input in &node.inputs {
                if !consumers[input].contains(&i) {
                    consumers[input].push(i);
                }
            }
        }
        consumers
    }

    /// Replace every use of `from` (node inputs and graph outputs) with `to`.
    pub fn replace_uses(&mut self, from: TensorId, to: TensorId) {
        for node in &mut self.nodes {
            for input in &mut node.inputs {
                if *input == from {
                    *input = to;
                }
            }
        }
        for output in &mut self.outputs {
            if *output == from {
                *output = to;
            }
        }
    }

    /// Replace uses of `from` by the nodes at `indices` only.
    pub fn replace_uses_in(&mut self, indices: &[usize], from: TensorId, to: TensorId) {
        for &i in indices {
            for input in &mut self.nodes[i].inputs {
                if *input == from {
                    *input = to;
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Ordering and validation
    // -----------------------------------------------------------------------

    /// Check the structural invariants: ids in range, one producer per
    /// tensor, no constant or input produced by a node, and every node input
    /// defined before use.
    pub fn validate(&self) -> Result<()> {
        let mut defined = vec![false; self.tensors.len()];
        let mut produced = vec![false; self.tensors.len()];
        for (i, t) in self.tensors.iter().enumerate() {
            if t.id != i {
                return Err(Error::InvalidGraph(format!("tensor {i} carries id {}", t.id)));
            }
            if !matches!(t.kind, TensorKind::Intermediate) {
                defined[i] = true;
            }
        }
        for &input in &self.inputs {
            if !matches!(self.tensors.get(input).map(|t| &t.kind), Some(TensorKind::Input)) {
                return Err(Error::InvalidGraph(format!("graph input {input} is not an input tensor")));
            }
        }
        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.id) {
                return Err(Error::InvalidGraph(format!("duplicate node id {}", node.id)));
            }
            if node.scope >= self.scopes.len() {
                return Err(Error::InvalidGraph(format!("{} has unknown scope {}", node.id, node.scope)));
            }
            for &input in &node.inputs {
                if input >= self.tensors.len() || !defined[input] {
                    return Err(Error::InvalidGraph(format!(
                        "{} ({}) reads tensor {input} before it is defined",
                        node.id,
                        node.op.kind()
                    )));
                }
            }
            for &out in &node.outputs {
                let Some(t) = self.tensors.get(out) else {
                    return Err(Error::InvalidGraph(format!("{} writes unknown tensor {out}", node.id)));
                };
                if !matches!(t.kind, TensorKind::Intermediate) || produced[out] {
                    return Err(Error::InvalidGraph(format!(
                        "tensor {out} (`{}`) has more than one producer",
                        t.name
                    )));
                }
                produced[out] = true;
                defined[out] = true;
            }
        }
        for &out in &self.outputs {
            if out >= self.tensors.len() || !defined[out] {
                return Err(Error::InvalidGraph(format!("graph output {out} is never produced")));
            }
        }
        Ok(())
    }

    /// Reorder nodes topologically (Kahn, stable with respect to the current
    /// order). Fails on cycles.
    pub fn toposort(&mut self) -> Result<()> {
        let producers = self.producers();
        let n = self.nodes.len();
        let mut indegree = vec![0usize; n];
        let mut users: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (i, node) in self.nodes.iter().enumerate() {
            let deps: HashSet<usize> = node.inputs.iter().filter_map(|&t| producers[t]).collect();
            indegree[i] = deps.len();
            for d in deps {
                users[d].push(i);
            }
        }
        let mut ready: VecDeque<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(i) = ready.pop_front() {
            order.push(i);
            let mut next: Vec<usize> = Vec::new();
            for &u in &users[i] {
                indegree[u] -= 1;
                if indegree[u] == 0 {
                    next.push(u);
                }
            }
            next.sort_unstable();
            ready.extend(next);
        }
        if order.len() != n {
            return Err(Error::InvalidGraph("graph contains a cycle".into()));
        }
        let mut slots: Vec<Option<Node>> = std::mem::take(&mut self.nodes).into_iter().map(Some).collect();
        self.nodes = order.into_iter().filter_map(|i| slots[i].take()).collect();
        Ok(())
    }

    /// Drop tensors no node, input or output refers to and renumber the rest.
    pub fn compact(&mut self) {
        let mut live = vec![false; self.tensors.len()];
        for &t in self.inputs.iter().chain(&self.outputs) {
            live[t] = true;
        }
        for node in &self.nodes {
            for &t in node.inputs.iter().chain(&node.outputs) {
                live[t] = true;
            }
        }
        let mut remap: HashMap<TensorId, TensorId> = HashMap::new();
        let old = std::mem::take(&mut self.tensors);
        for mut t in old.into_iter().filter(|t| live[t.id]) {
            let id = self.tensors.len();
            remap.insert(t.id, id);
            t.id = id;
            self.tensors.push(t);
        }
        let map = |t: &mut TensorId| *t = remap[&*t];
        self.inputs.iter_mut().for_each(map);
        self.outputs.iter_mut().for_each(map);
        for node in &mut self.nodes {
            node.inputs.iter_mut().for_each(map);
            node.outputs.iter_mut().for_each(map);
        }
    }

    /// Remove the nodes at `indices` (positions in `nodes`).
    pub fn remove_nodes(&mut self, indices: &HashSet<usize>) {
        let mut i = 0;
        self.nodes.retain(|_| {
            let keep = !indices.contains(&i);
            i += 1;
            keep
        });
    }

    pub fn is_constant(&self, id: TensorId) -> bool {
        self.tensors[id].is_constant()
    }

    pub fn constant(&self, id: TensorId) -> Option<HostTensor> {
        self.tensors[id].constant()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let graph: Graph = serde_json::from_str(text)?;
        graph.validate()?;
        Ok(graph)
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fmt_tensor = |id: TensorId| {
            let t = &self.tensors[id];
            format!("%{id}: {}{:?}", t.dtype, t.shape)
        };
        let inputs: Vec<String> = self.inputs.iter().map(|&i| fmt_tensor(i)).collect();
        writeln!(f, "graph({}) {{", inputs.join(", "))?;
        for node in &self.nodes {
            let outs: Vec<String> = node.outputs.iter().map(|&o| fmt_tensor(o)).collect();
            let ins: Vec<String> = node
                .inputs
                .iter()
                .map(|&i| {
                    if self.is_constant(i) {
                        format!("${i}")
                    } else {
                        format!("%{i}")
                    }
                })
                .collect();
            writeln!(
                f,
                "  {} = {}({})  # {} @ {}",
                outs.join(", "),
                node.op,
                ins.join(", "),
                node.id,
                self.scope_path(node.scope)
            )?;
        }
        let outs: Vec<String> = self.outputs.iter().map(|o| format!("%{o}")).collect();
        writeln!(f, "  return {}", outs.join(", "))?;
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> Graph {
        let mut g = Graph::default();
        let x = g.add_input("x", vec![1, 4], DType::F32);
        let a = g.add_tensor("a", vec![1, 4], DType::F32, TensorKind::Intermediate);
        let b = g.add_tensor("b", vec![1, 4], DType::F32, TensorKind::Intermediate);
        g.add_node(Op::Relu, vec![x], vec![a], ROOT_SCOPE);
        g.add_node(Op::Sigmoid, vec![a], vec![b], ROOT_SCOPE);
        g.outputs.push(b);
        g
    }

    #[test]
    fn test_validate_accepts_chain() {
        chain().validate().unwrap();
    }

    #[test]
    fn test_toposort_restores_order() {
        let mut g = chain();
        g.nodes.reverse();
        assert!(g.validate().is_err());
        g.toposort().unwrap();
        g.validate().unwrap();
        assert_eq!(g.nodes[0].op, Op::Relu);
    }

    #[test]
    fn test_toposort_detects_cycle() {
        let mut g = chain();
        // relu now reads the sigmoid output
        g.nodes[0].inputs = vec![2];
        assert!(g.toposort().is_err());
    }

    #[test]
    fn test_compact_renumbers() {
        let mut g = chain();
        let dead = g.add_tensor("dead", vec![1], DType::F32, TensorKind::Intermediate);
        assert_eq!(dead, 3);
        g.add_constant("w", HostTensor::scalar(1.0));
        g.compact();
        assert_eq!(g.tensors.len(), 3);
        g.validate().unwrap();
    }

    #[test]
    fn test_replace_uses_redirects_outputs() {
        let mut g = chain();
        let c = g.add_tensor("c", vec![1, 4], DType::F32, TensorKind::Intermediate);
        g.replace_uses(2, c);
        assert_eq!(g.outputs, vec![c]);
    }

    #[test]
    fn test_scope_nesting() {
        let mut g = Graph::default();
        let a = g.intern_scope("a", ModuleKind::Sequential, ROOT_SCOPE);
        let ab = g.intern_scope("a.b", ModuleKind::Linear, a);
        assert_eq!(g.intern_scope("a.b", ModuleKind::Linear, a), ab);
        assert!(g.scope_within(ab, a));
        assert!(!g.scope_within(a, ab));
    }

    #[test]
    fn test_json_dump_round_trip() {
        let g = chain();
        let back = Graph::from_json(&g.to_json().unwrap()).unwrap();
        assert_eq!(back, g);
    }
}
