//! QAT graph rewriting: module fusion, module substitution and fake-quant
//! insertion.

use std::collections::{HashMap, HashSet};

use log::{debug, info};

use super::config::{QuantConfig, QuantSpec};
use super::observer::FakeQuant;
use super::substitute::{SubstitutionTable, Unit};
use crate::error::{Error, Result};
use crate::ir::{Graph, ModuleKind, Node, Op, OpKind, ScopeId, TensorId, ROOT_SCOPE};
use crate::registry::{OpRegistry, QuantRole};
use crate::tensor::DType;

pub struct Rewriter<'a> {
    registry: &'a OpRegistry,
    table: SubstitutionTable,
    config: &'a QuantConfig,
}

impl<'a> Rewriter<'a> {
    pub fn new(config: &'a QuantConfig) -> Self {
        Self {
            registry: OpRegistry::standard(),
            table: SubstitutionTable::standard(),
            config,
        }
    }

    pub fn with_table(mut self, table: SubstitutionTable) -> Self {
        self.table = table;
        self
    }

    /// Produce the quantization-aware version of `graph`.
    ///
    /// Running the rewrite on its own output changes nothing.
    pub fn rewrite(&self, graph: &Graph) -> Result<Graph> {
        let mut g = graph.clone();
        let fused = self.fuse_modules(&mut g);
        let substituted = self.substitute_modules(&mut g)?;
        let inserted = self.insert_fake_quant(&mut g)?;
        g.toposort()?;
        g.compact();
        g.validate()?;
        info!("rewrite: fused {fused} module groups, substituted {substituted} modules, inserted {inserted} fake-quant nodes");
        Ok(g)
    }

    // -----------------------------------------------------------------------
    // Module fusion
    // -----------------------------------------------------------------------

    fn fuse_modules(&self, g: &mut Graph) -> usize {
        let by_scope = nodes_by_scope(g);
        let consumers = g.consumers();
        let mut fused = 0;
        for scope in 0..g.scopes.len() {
            let head_kind = g.scopes[scope].kind.clone();
            if scope == ROOT_SCOPE || !matches!(head_kind, ModuleKind::Conv2d | ModuleKind::Linear) {
                continue;
            }
            let Some(&[head]) = by_scope.get(&scope).map(Vec::as_slice) else {
                continue;
            };
            // (scope, node, kind) of every module following the head.
            let mut chain: Vec<(ScopeId, usize, ModuleKind)> = Vec::new();
            let mut tail = head;
            let followers = match head_kind {
                ModuleKind::Conv2d => vec![ModuleKind::BatchNorm2d, ModuleKind::ReLU],
                _ => vec![ModuleKind::ReLU],
            };
            for want in &followers {
                let Some((next_scope, next)) = self.sole_successor(g, &by_scope, &consumers, scope, tail) else {
                    break;
                };
                if g.scopes[next_scope].kind != *want {
                    continue;
                }
                chain.push((next_scope, next, want.clone()));
                tail = next;
            }

            while !chain.is_empty() {
                let members: Vec<&ModuleKind> = chain.iter().map(|c| &c.2).collect();
                let kind = match (&head_kind, members.as_slice()) {
                    (ModuleKind::Conv2d, [ModuleKind::BatchNorm2d]) => ModuleKind::ConvBn2d,
                    (ModuleKind::Conv2d, [ModuleKind::BatchNorm2d, ModuleKind::ReLU]) => ModuleKind::ConvBnReLU2d,
                    (ModuleKind::Conv2d, [ModuleKind::ReLU]) => ModuleKind::ConvReLU2d,
                    (ModuleKind::Linear, [ModuleKind::ReLU]) => ModuleKind::LinearReLU,
                    _ => break,
                };
                let skipped = std::iter::once(scope)
                    .chain(chain.iter().map(|c| c.0))
                    .any(|s| self.config.is_skipped(&g.scopes[s].path));
                if skipped {
                    break;
                }
                if !self.config.is_module_enabled(&kind) {
                    chain.pop();
                    continue;
                }
                debug!("fusing `{}` into {kind}", g.scope_path(scope));
                g.scopes[scope].kind = kind;
                for (_, node, _) in &chain {
                    g.nodes[*node].scope = scope;
                }
                fused += 1;
                break;
            }
        }
        fused
    }

    /// The node that alone consumes the output of `node`, if it is the only
    /// node of a sibling scope.
    fn sole_successor(
        &self,
        g: &Graph,
        by_scope: &HashMap<ScopeId, Vec<usize>>,
        consumers: &[Vec<usize>],
        scope: ScopeId,
        node: usize,
    ) -> Option<(ScopeId, usize)> {
        let out = *g.nodes[node].outputs.first()?;
        if g.outputs.contains(&out) {
            return None;
        }
        let [next] = consumers[out].as_slice() else {
            return None;
        };
        let next_scope = g.nodes[*next].scope;
        if next_scope == scope || next_scope == ROOT_SCOPE || g.scopes[next_scope].parent != g.scopes[scope].parent {
            return None;
        }
        match by_scope.get(&next_scope).map(Vec::as_slice) {
            Some([only]) if only == next => Some((next_scope, *next)),
            _ => None,
        }
    }

    // -----------------------------------------------------------------------
    // Module substitution
    // -----------------------------------------------------------------------

    fn substitute_modules(&self, g: &mut Graph) -> Result<usize> {
        let by_scope = nodes_by_scope(g);
        let consumers = g.consumers();
        let mut replacements: HashMap<usize, Node> = HashMap::new();
        let mut removed: HashSet<usize> = HashSet::new();
        let mut scopes: Vec<ScopeId> = by_scope.keys().copied().collect();
        scopes.sort_unstable();

        for scope in scopes {
            let kind = g.scopes[scope].kind.clone();
            let Some(build) = self.table.get(&kind) else {
                continue;
            };
            if !self.config.is_module_enabled(&kind) || self.config.is_skipped(&g.scopes[scope].path) {
                continue;
            }
            let unit = Unit {
                scope,
                nodes: by_scope[&scope].clone(),
            };
            let Some(sub) = build(g, &unit, self.config)? else {
                continue;
            };
            // Internal results must not escape the unit.
            let escapes = unit.nodes.iter().flat_map(|&i| &g.nodes[i].outputs).any(|&t| {
                t != sub.output && (g.outputs.contains(&t) || consumers[t].iter().any(|c| !unit.nodes.contains(c)))
            });
            if escapes {
                debug!("not substituting `{}`: intermediate results are used outside it", g.scope_path(scope));
                continue;
            }
            debug!("substituting `{}` ({kind}) with {}", g.scope_path(scope), sub.kind);
            g.scopes[scope].kind = sub.kind.clone();
            let node = g.make_node(sub.op, sub.inputs, vec![sub.output], scope);
            replacements.insert(unit.nodes[0], node);
            removed.extend(unit.nodes[1..].iter().copied());
        }

        let count = replacements.len();
        let nodes = std::mem::take(&mut g.nodes);
        g.nodes = nodes
            .into_iter()
            .enumerate()
            .filter(|(i, _)| !removed.contains(i))
            .map(|(i, node)| replacements.remove(&i).unwrap_or(node))
            .collect();
        Ok(count)
    }

    // -----------------------------------------------------------------------
    // Fake-quant insertion
    // -----------------------------------------------------------------------

    fn insert_fake_quant(&self, g: &mut Graph) -> Result<usize> {
        let producers = g.producers();
        let consumers = g.consumers();
        let original = std::mem::take(&mut g.nodes);
        let is_fq = |node: usize| matches!(original[node].op, Op::FakeQuantize(_));

        let mut nodes = Vec::with_capacity(original.len());
        let mut rename: HashMap<TensorId, TensorId> = HashMap::new();
        let mut fq_outputs: HashSet<TensorId> = HashSet::new();
        let mut cache: HashMap<(TensorId, bool), TensorId> = HashMap::new();
        let mut inserted = 0;

        for mut node in original.clone() {
            for input in &mut node.inputs {
                if let Some(&q) = rename.get(input) {
                    *input = q;
                }
            }
            if !self.eligible(g, &node)? {
                nodes.push(node);
                continue;
            }
            let qat = matches!(node.op, Op::QatLinear(_) | Op::QatConv2d(_));
            let schema = self.registry.schema(node.op.kind());

            for i in 0..node.inputs.len() {
                let role = match (qat, schema) {
                    (true, _) if i > 0 => QuantRole::Skip,
                    (true, _) => QuantRole::Activation,
                    (false, Some(schema)) => schema.quant_role(i),
                    (false, None) => QuantRole::Activation,
                };
                let input = node.inputs[i];
                let from_fq = fq_outputs.contains(&input) || producers[input].is_some_and(is_fq);
                if role == QuantRole::Skip || from_fq || g.tensor(input).dtype != DType::F32 {
                    continue;
                }
                let weight = role == QuantRole::Weight;
                if let Some(&q) = cache.get(&(input, weight)) {
                    node.inputs[i] = q;
                    continue;
                }
                let spec = if weight { self.config.weight } else { self.config.activation };
                let mut fq = FakeQuant::new(spec);
                if let Some(value) = g.constant(input) {
                    fq.observe(&value)?;
                }
                let name = format!("{}.fq", g.tensor(input).name);
                let q = g.add_like(input, name);
                nodes.push(g.make_node(Op::FakeQuantize(fq), vec![input], vec![q], node.scope));
                fq_outputs.insert(q);
                cache.insert((input, weight), q);
                node.inputs[i] = q;
                inserted += 1;
            }

            let out = node.outputs[0];
            let users = &consumers[out];
            let needs_output_fq = if users.is_empty() {
                g.outputs.contains(&out)
            } else {
                !users.iter().all(|&u| is_fq(u))
            };
            let scope = node.scope;
            let fixed = schema.and_then(|s| s.fixed_qparams);
            nodes.push(node);
            if needs_output_fq {
                let fq = output_fake_quant(self.config.activation, fixed);
                let name = format!("{}.fq", g.tensor(out).name);
                let q = g.add_like(out, name);
                nodes.push(g.make_node(Op::FakeQuantize(fq), vec![out], vec![q], scope));
                fq_outputs.insert(q);
                rename.insert(out, q);
                inserted += 1;
            }
        }

        for out in &mut g.outputs {
            if let Some(&q) = rename.get(out) {
                *out = q;
            }
        }
        g.nodes = nodes;
        Ok(inserted)
    }

    /// Whether fake-quant nodes go around `node`. Errors when the
    /// configuration asks for an op no quantized kernel exists for.
    fn eligible(&self, g: &Graph, node: &Node) -> Result<bool> {
        let kind = node.op.kind();
        if matches!(kind, OpKind::FakeQuantize | OpKind::Quantize | OpKind::Dequantize) {
            return Ok(false);
        }
        if self.config.is_skipped(&g.scopes[node.scope].path) {
            return Ok(false);
        }
        let qat = matches!(kind, OpKind::QatLinear | OpKind::QatConv2d);
        if !qat && !self.config.is_op_enabled(kind) {
            return Ok(false);
        }
        if node.inputs.first().is_some_and(|&x| g.tensor(x).dtype != DType::F32) {
            return Ok(false);
        }
        if qat {
            return Ok(true);
        }
        let quantizable = self.registry.schema(kind).is_some_and(|s| s.quantizable);
        if !quantizable {
            return Err(non_quantizable(g, node, "no quantized kernel exists for this operator".into()));
        }
        if let Op::Conv2d { attrs, .. } = &node.op {
            let in_channels = g.tensor(node.inputs[0]).shape.get(1).copied().unwrap_or(0);
            if attrs.groups > 1 && attrs.groups != in_channels {
                return Err(non_quantizable(
                    g,
                    node,
                    format!("grouped convolution ({} groups over {in_channels} channels) is not depthwise", attrs.groups),
                ));
            }
        }
        Ok(true)
    }
}

fn non_quantizable(g: &Graph, node: &Node, reason: String) -> Error {
    Error::NonQuantizableOperator {
        node: node.id.0,
        op: node.op.kind().to_string(),
        scope: g.scope_path(node.scope).to_string(),
        reason,
    }
}

fn nodes_by_scope(g: &Graph) -> HashMap<ScopeId, Vec<usize>> {
    let mut by_scope: HashMap<ScopeId, Vec<usize>> = HashMap::new();
    for (i, node) in g.nodes.iter().enumerate() {
        by_scope.entry(node.scope).or_default().push(i);
    }
    by_scope
}

/// Output fake-quant; ops with a prescribed output range get fixed
/// parameters (shifted for unsigned storage).
fn output_fake_quant(spec: QuantSpec, fixed: Option<(f32, i64)>) -> FakeQuant {
    match fixed {
        Some((scale, zero_point)) => {
            let zero_point = if spec.dtype == DType::U8 { zero_point + 128 } else { zero_point };
            FakeQuant::with_fixed(spec, scale, zero_point)
        }
        None => FakeQuant::new(spec),
    }
}

/// Rewrite `graph` with the standard registry and substitution table.
pub fn rewrite(graph: &Graph, config: &QuantConfig) -> Result<Graph> {
    Rewriter::new(config).rewrite(graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::{functional as F, BatchNorm2d, Conv2d, FnModule, Linear, ReLU, Sequential};
    use crate::quant::config::QuantTarget;
    use crate::tensor::HostTensor;
    use crate::trace::trace;

    fn count(g: &Graph, kind: OpKind) -> usize {
        g.nodes.iter().filter(|n| n.op.kind() == kind).count()
    }

    fn conv_bn_relu() -> (Sequential, HostTensor) {
        let w = HostTensor::new(vec![2, 1, 1, 1], vec![1.0, -1.0]).unwrap();
        let model = Sequential::new()
            .add("conv", Conv2d::new(w, None))
            .add("bn", BatchNorm2d::identity(2))
            .add("relu", ReLU);
        (model, HostTensor::full(vec![1, 1, 3, 3], 0.5))
    }

    #[test]
    fn test_conv_bn_relu_fuses_into_one_qat_node() {
        let (model, x) = conv_bn_relu();
        let g = trace(&model, &[x]).unwrap().graph;
        let q = rewrite(&g, &QuantConfig::default()).unwrap();
        assert_eq!(count(&q, OpKind::QatConv2d), 1);
        assert_eq!(count(&q, OpKind::BatchNorm2d), 0);
        assert_eq!(count(&q, OpKind::Relu), 0);
        // input and output fake-quant only; weights are handled inside the node
        assert_eq!(count(&q, OpKind::FakeQuantize), 2);
        let conv = q.nodes.iter().find(|n| n.op.kind() == OpKind::QatConv2d).unwrap();
        assert_eq!(q.scope(conv.scope).kind, ModuleKind::QatConv2d);
        assert_eq!(conv.inputs.len(), 6);
    }

    #[test]
    fn test_disabled_fusion_keeps_modules_apart() {
        let (model, x) = conv_bn_relu();
        let g = trace(&model, &[x]).unwrap().graph;
        let config = QuantConfig::default()
            .disable(&QuantTarget::Module(ModuleKind::ConvBnReLU2d))
            .disable(&QuantTarget::Module(ModuleKind::ConvBn2d));
        let q = rewrite(&g, &config).unwrap();
        assert_eq!(count(&q, OpKind::QatConv2d), 1);
        assert_eq!(count(&q, OpKind::BatchNorm2d), 1);
    }

    #[test]
    fn test_rewrite_is_idempotent() {
        let w = HostTensor::new(vec![2, 3], vec![0.5, -0.5, 1.0, 0.25, 0.0, -1.0]).unwrap();
        let model = FnModule::new("Net", move |s, xs| {
            let w = s.param("w", &w);
            let h = F::linear(s, &xs[0], &w, None)?;
            let a = F::relu(s, &h)?;
            let b = F::sigmoid(s, &h)?;
            Ok(vec![F::add(s, &a, &b)?])
        });
        let g = trace(&model, &[HostTensor::full(vec![1, 3], 1.0)]).unwrap().graph;
        let once = rewrite(&g, &QuantConfig::default()).unwrap();
        let twice = rewrite(&once, &QuantConfig::default()).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_shared_input_gets_one_fake_quant() {
        let model = FnModule::new("Twice", |s, xs| {
            let a = F::relu(s, &xs[0])?;
            let b = F::relu6(s, &xs[0])?;
            Ok(vec![a, b])
        });
        let g = trace(&model, &[HostTensor::zeros(vec![4])]).unwrap().graph;
        let q = rewrite(&g, &QuantConfig::default()).unwrap();
        let input = q.inputs[0];
        let readers = q.nodes.iter().filter(|n| n.inputs.contains(&input)).count();
        assert_eq!(readers, 1);
        assert_eq!(count(&q, OpKind::FakeQuantize), 3);
    }

    #[test]
    fn test_sigmoid_output_has_fixed_qparams() {
        let model = FnModule::new("Gate", |s, xs| Ok(vec![F::sigmoid(s, &xs[0])?]));
        let g = trace(&model, &[HostTensor::zeros(vec![4])]).unwrap().graph;
        let q = rewrite(&g, &QuantConfig::default()).unwrap();
        let last = q.nodes.last().unwrap();
        let Op::FakeQuantize(fq) = &last.op else { panic!("expected fake quantize") };
        assert_eq!(fq.fixed, Some((1.0 / 256.0, -128)));
    }

    #[test]
    fn test_skipped_scope_stays_float() {
        let w = HostTensor::new(vec![2, 2], vec![1.0, 0.0, 0.0, 1.0]).unwrap();
        let model = Sequential::new().add("fc", Linear::new(w, None)).add("act", ReLU);
        let g = trace(&model, &[HostTensor::zeros(vec![1, 2])]).unwrap().graph;
        let q = rewrite(&g, &QuantConfig::default().skip_scope("fc")).unwrap();
        assert_eq!(count(&q, OpKind::Linear), 1);
        assert_eq!(count(&q, OpKind::QatLinear), 0);
    }

    #[test]
    fn test_enabled_div_is_rejected() {
        let model = FnModule::new("Ratio", |s, xs| Ok(vec![F::div(s, &xs[0], &xs[1])?]));
        let g = trace(&model, &[HostTensor::full(vec![2], 1.0), HostTensor::full(vec![2], 2.0)])
            .unwrap()
            .graph;
        let config = QuantConfig::default().enable(QuantTarget::Op(OpKind::Div));
        let err = rewrite(&g, &config).unwrap_err();
        assert!(matches!(err, Error::NonQuantizableOperator { ref op, .. } if op == "Div"));
    }
}
