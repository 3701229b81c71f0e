//! Module substitution table: float module units → quantization-aware nodes.

use std::collections::BTreeMap;

use super::config::QuantConfig;
use crate::error::{Error, Result};
use crate::ir::{Activation, Graph, ModuleKind, Node, Op, QatConv, QatLinear, ScopeId, TensorId};

/// The nodes recorded directly inside one module scope, in graph order.
#[derive(Debug, Clone)]
pub struct Unit {
    pub scope: ScopeId,
    pub nodes: Vec<usize>,
}

/// Replacement for a whole unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Substitute {
    pub op: Op,
    pub inputs: Vec<TensorId>,
    pub output: TensorId,
    /// Module kind the scope is re-tagged with.
    pub kind: ModuleKind,
}

/// Builds the substitute for a unit, or `None` when the unit does not have
/// the expected shape and is left alone.
pub type SubstituteFn = fn(&Graph, &Unit, &QuantConfig) -> Result<Option<Substitute>>;

pub struct SubstitutionTable {
    entries: BTreeMap<ModuleKind, SubstituteFn>,
}

impl Default for SubstitutionTable {
    fn default() -> Self {
        Self::standard()
    }
}

impl SubstitutionTable {
    pub fn empty() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    pub fn standard() -> Self {
        Self::empty()
            .register(ModuleKind::Linear, substitute_linear)
            .register(ModuleKind::LinearReLU, substitute_linear)
            .register(ModuleKind::Conv2d, substitute_conv)
            .register(ModuleKind::ConvReLU2d, substitute_conv)
            .register(ModuleKind::ConvBn2d, substitute_conv)
            .register(ModuleKind::ConvBnReLU2d, substitute_conv)
    }

    pub fn register(mut self, kind: ModuleKind, f: SubstituteFn) -> Self {
        self.entries.insert(kind, f);
        self
    }

    pub fn get(&self, kind: &ModuleKind) -> Option<SubstituteFn> {
        self.entries.get(kind).copied()
    }
}

fn nodes<'g>(graph: &'g Graph, unit: &Unit) -> Vec<&'g Node> {
    unit.nodes.iter().map(|&i| &graph.nodes[i]).collect()
}

fn trailing_activation(node: Option<&&Node>) -> Option<Activation> {
    match node.map(|n| &n.op) {
        None => Some(Activation::None),
        Some(Op::Relu) => Some(Activation::Relu),
        _ => None,
    }
}

fn substitute_linear(graph: &Graph, unit: &Unit, config: &QuantConfig) -> Result<Option<Substitute>> {
    let nodes = nodes(graph, unit);
    let Some((first, rest)) = nodes.split_first() else {
        return Ok(None);
    };
    let Op::Linear { fused: Activation::None } = first.op else {
        return Ok(None);
    };
    if rest.len() > 1 {
        return Ok(None);
    }
    let Some(fused) = trailing_activation(rest.first()) else {
        return Ok(None);
    };
    let last = rest.last().unwrap_or(first);
    Ok(Some(Substitute {
        op: Op::QatLinear(QatLinear {
            fused,
            weight: config.weight,
        }),
        inputs: first.inputs.clone(),
        output: last.outputs[0],
        kind: ModuleKind::QatLinear,
    }))
}

fn substitute_conv(graph: &Graph, unit: &Unit, config: &QuantConfig) -> Result<Option<Substitute>> {
    let nodes = nodes(graph, unit);
    let Some((first, rest)) = nodes.split_first() else {
        return Ok(None);
    };
    let Op::Conv2d { attrs, fused: Activation::None } = first.op else {
        return Ok(None);
    };
    let in_channels = graph.tensor(first.inputs[0]).shape.get(1).copied().unwrap_or(0);
    if attrs.groups > 1 && attrs.groups != in_channels {
        return Err(Error::NonQuantizableOperator {
            node: first.id.0,
            op: first.op.kind().to_string(),
            scope: graph.scope_path(first.scope).to_string(),
            reason: format!("grouped convolution ({} groups over {in_channels} channels) is not depthwise", attrs.groups),
        });
    }

    let mut inputs = first.inputs.clone();
    let has_bias = inputs.len() > 2;
    let (bn, act) = match rest {
        [] => (None, None),
        [n] if matches!(n.op, Op::BatchNorm2d { .. }) => (Some(*n), None),
        [n] => (None, Some(*n)),
        [bn, act] => (Some(*bn), Some(*act)),
        _ => return Ok(None),
    };
    let bn_eps = match bn {
        Some(node) => {
            let Op::BatchNorm2d { eps } = node.op else {
                return Ok(None);
            };
            inputs.extend_from_slice(&node.inputs[1..]);
            Some(eps)
        }
        None => None,
    };
    let Some(fused) = trailing_activation(act.as_ref()) else {
        return Ok(None);
    };
    let last = nodes.last().unwrap_or(first);
    Ok(Some(Substitute {
        op: Op::QatConv2d(QatConv {
            conv: attrs,
            has_bias,
            bn_eps,
            fused,
            weight: config.weight,
        }),
        inputs,
        output: last.outputs[0],
        kind: ModuleKind::QatConv2d,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Conv2dAttrs, ROOT_SCOPE};
    use crate::tensor::{DType, HostTensor};

    fn conv_graph(groups: usize) -> (Graph, Unit) {
        let mut g = Graph::default();
        let x = g.add_input("x", vec![1, 4, 5, 5], DType::F32);
        let w = g.add_constant("w", HostTensor::zeros(vec![4, 4 / groups, 3, 3]));
        let y = g.add_tensor("y", vec![1, 4, 3, 3], DType::F32, crate::ir::TensorKind::Intermediate);
        let scope = g.intern_scope("conv", ModuleKind::Conv2d, ROOT_SCOPE);
        g.add_node(
            Op::Conv2d {
                attrs: Conv2dAttrs { groups, ..Default::default() },
                fused: Activation::None,
            },
            vec![x, w],
            vec![y],
            scope,
        );
        g.outputs.push(y);
        (g, Unit { scope, nodes: vec![0] })
    }

    #[test]
    fn test_conv_unit_becomes_qat_conv() {
        let (g, unit) = conv_graph(1);
        let sub = substitute_conv(&g, &unit, &QuantConfig::default()).unwrap().unwrap();
        assert_eq!(sub.kind, ModuleKind::QatConv2d);
        assert_eq!(sub.inputs.len(), 2);
        let Op::QatConv2d(qat) = sub.op else { panic!("expected qat conv") };
        assert!(!qat.has_bias);
        assert_eq!(qat.bn_eps, None);
    }

    #[test]
    fn test_depthwise_conv_is_accepted() {
        let (g, unit) = conv_graph(4);
        assert!(substitute_conv(&g, &unit, &QuantConfig::default()).unwrap().is_some());
    }

    #[test]
    fn test_grouped_conv_is_rejected() {
        let (g, unit) = conv_graph(2);
        let err = substitute_conv(&g, &unit, &QuantConfig::default()).unwrap_err();
        assert!(matches!(err, Error::NonQuantizableOperator { ref scope, .. } if scope == "conv"));
    }

    #[test]
    fn test_table_lookup() {
        let table = SubstitutionTable::standard();
        assert!(table.get(&ModuleKind::ConvBnReLU2d).is_some());
        assert!(table.get(&ModuleKind::BatchNorm2d).is_none());
        assert!(table.get(&ModuleKind::QatConv2d).is_none());
    }
}
