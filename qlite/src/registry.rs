//! Operator registry.
//!
//! Maps the identities modules dispatch through (`conv2d`, `aten::relu`,
//! `F.linear`, ...) to IR op kinds, and records what later stages need to
//! know about each kind: arity, layout class, quantization roles and the
//! TFLite builtin it lowers to.

use std::collections::{BTreeMap, HashMap};

use once_cell::sync::Lazy;

use crate::ir::{Conv2dAttrs, Op, OpKind, PoolAttrs};
use crate::parse::tflite::schema::BuiltinOperator;
use crate::tensor::HostTensor;

/// How an op behaves when the activation layout changes from NCHW to NHWC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutClass {
    /// Element-wise; runs in whatever layout its operands are in.
    Transparent,
    /// Takes an axis attribute that must be remapped.
    AxisParam,
    /// Has a fixed channel position; runs channel-last after normalization.
    ChannelSensitive,
    /// Depends on the logical element order; operands must be channel-first.
    RequiresSource,
}

/// What a given input of an op is, for fake-quant insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantRole {
    Activation,
    Weight,
    /// Left in float (biases, batch-norm statistics).
    Skip,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Int(i64),
    Ints(Vec<i64>),
    Float(f32),
    Bool(bool),
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        AttrValue::Int(v)
    }
}

impl From<usize> for AttrValue {
    fn from(v: usize) -> Self {
        AttrValue::Int(v as i64)
    }
}

impl From<Vec<i64>> for AttrValue {
    fn from(v: Vec<i64>) -> Self {
        AttrValue::Ints(v)
    }
}

impl From<[usize; 2]> for AttrValue {
    fn from(v: [usize; 2]) -> Self {
        AttrValue::Ints(v.iter().map(|&x| x as i64).collect())
    }
}

impl From<f32> for AttrValue {
    fn from(v: f32) -> Self {
        AttrValue::Float(v)
    }
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        AttrValue::Bool(v)
    }
}

/// Keyword arguments of an operator call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attrs(BTreeMap<String, AttrValue>);

type AttrResult<T> = std::result::Result<T, String>;

impl Attrs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<AttrValue>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&AttrValue> {
        self.0.get(key)
    }

    pub fn int(&self, key: &str, default: i64) -> AttrResult<i64> {
        match self.0.get(key) {
            None => Ok(default),
            Some(AttrValue::Int(v)) => Ok(*v),
            Some(AttrValue::Bool(b)) => Ok(*b as i64),
            Some(other) => Err(format!("`{key}` must be an integer, got {other:?}")),
        }
    }

    pub fn ints(&self, key: &str) -> AttrResult<Option<Vec<i64>>> {
        match self.0.get(key) {
            None => Ok(None),
            Some(AttrValue::Ints(v)) => Ok(Some(v.clone())),
            Some(AttrValue::Int(v)) => Ok(Some(vec![*v])),
            Some(other) => Err(format!("`{key}` must be a list of integers, got {other:?}")),
        }
    }

    /// A 2-D attribute given either as one integer or as a pair.
    pub fn pair(&self, key: &str, default: [usize; 2]) -> AttrResult<[usize; 2]> {
        let Some(values) = self.ints(key)? else {
            return Ok(default);
        };
        let values: Vec<usize> = values
            .into_iter()
            .map(|v| usize::try_from(v).map_err(|_| format!("`{key}` must be non-negative")))
            .collect::<AttrResult<_>>()?;
        match values.as_slice() {
            [v] => Ok([*v, *v]),
            [h, w] => Ok([*h, *w]),
            _ => Err(format!("`{key}` must have one or two values, got {}", values.len())),
        }
    }

    pub fn float(&self, key: &str, default: f32) -> AttrResult<f32> {
        match self.0.get(key) {
            None => Ok(default),
            Some(AttrValue::Float(v)) => Ok(*v),
            Some(AttrValue::Int(v)) => Ok(*v as f32),
            Some(other) => Err(format!("`{key}` must be a number, got {other:?}")),
        }
    }

    pub fn bool(&self, key: &str, default: bool) -> AttrResult<bool> {
        match self.0.get(key) {
            None => Ok(default),
            Some(AttrValue::Bool(v)) => Ok(*v),
            Some(AttrValue::Int(v)) => Ok(*v != 0),
            Some(other) => Err(format!("`{key}` must be a boolean, got {other:?}")),
        }
    }
}

type BuildFn = fn(&Attrs, &[&HostTensor]) -> AttrResult<Op>;

pub struct OpSchema {
    pub kind: OpKind,
    pub name: &'static str,
    pub aliases: &'static [&'static str],
    /// Inclusive bounds on the number of tensor operands.
    pub arity: (usize, usize),
    pub layout: LayoutClass,
    /// Whether a quantized kernel exists for this kind.
    pub quantizable: bool,
    /// Roles of the operands; operands past the end take the last role.
    pub quant_inputs: &'static [QuantRole],
    /// Output parameters the runtime prescribes for int8 outputs.
    pub fixed_qparams: Option<(f32, i64)>,
    /// Builtin the kind lowers to (the converter may pick a variant).
    pub tflite: Option<BuiltinOperator>,
    /// Whether modules may dispatch this kind by name.
    pub callable: bool,
    build: BuildFn,
}

impl OpSchema {
    /// Extract the typed op from call arguments.
    pub fn build(&self, attrs: &Attrs, inputs: &[&HostTensor]) -> AttrResult<Op> {
        let (min, max) = self.arity;
        if inputs.len() < min || inputs.len() > max {
            return Err(if min == max {
                format!("expected {min} operands, got {}", inputs.len())
            } else {
                format!("expected {min}..={max} operands, got {}", inputs.len())
            });
        }
        (self.build)(attrs, inputs)
    }

    pub fn quant_role(&self, input: usize) -> QuantRole {
        self.quant_inputs
            .get(input)
            .or(self.quant_inputs.last())
            .copied()
            .unwrap_or(QuantRole::Activation)
    }
}

impl std::fmt::Debug for OpSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpSchema")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("arity", &self.arity)
            .field("layout", &self.layout)
            .field("quantizable", &self.quantizable)
            .finish()
    }
}

pub struct OpRegistry {
    schemas: Vec<OpSchema>,
    by_name: HashMap<&'static str, usize>,
    by_kind: HashMap<OpKind, usize>,
}

impl std::fmt::Debug for OpRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.schemas.iter().map(|s| s.name)).finish()
    }
}

static STANDARD: Lazy<OpRegistry> = Lazy::new(|| OpRegistry::new(standard_schemas()));

const NAMESPACES: [&str; 4] = ["aten::", "torch.nn.functional.", "torch.", "F."];

impl OpRegistry {
    pub fn new(schemas: Vec<OpSchema>) -> Self {
        let mut by_name = HashMap::new();
        let mut by_kind = HashMap::new();
        for (i, schema) in schemas.iter().enumerate() {
            by_kind.entry(schema.kind).or_insert(i);
            if schema.callable {
                by_name.insert(schema.name, i);
                for alias in schema.aliases {
                    by_name.insert(*alias, i);
                }
            }
        }
        Self {
            schemas,
            by_name,
            by_kind,
        }
    }

    /// The built-in catalogue.
    pub fn standard() -> &'static OpRegistry {
        &STANDARD
    }

    /// Look up an operator identity. Namespace prefixes and the trailing
    /// underscore of in-place variants are ignored.
    pub fn resolve(&self, ident: &str) -> Option<&OpSchema> {
        if let Some(&i) = self.by_name.get(ident) {
            return Some(&self.schemas[i]);
        }
        let mut name = ident;
        for ns in NAMESPACES {
            if let Some(rest) = name.strip_prefix(ns) {
                name = rest;
                break;
            }
        }
        let name = name.strip_suffix('_').unwrap_or(name);
        self.by_name.get(name).map(|&i| &self.schemas[i])
    }

    pub fn schema(&self, kind: OpKind) -> Option<&OpSchema> {
        self.by_kind.get(&kind).map(|&i| &self.schemas[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &OpSchema> {
        self.schemas.iter()
    }
}

// ---------------------------------------------------------------------------
// Attribute extraction
// ---------------------------------------------------------------------------

fn norm_axis(axis: i64, rank: usize) -> AttrResult<usize> {
    let r = rank as i64;
    let a = if axis < 0 { axis + r } else { axis };
    if a < 0 || a >= r.max(1) {
        return Err(format!("axis {axis} out of range for rank {rank}"));
    }
    Ok(a as usize)
}

/// Resolve a target shape that may contain one `-1`.
fn resolve_shape(shape: &[i64], numel: usize) -> AttrResult<Vec<usize>> {
    let mut inferred = None;
    let mut known = 1usize;
    for (i, &d) in shape.iter().enumerate() {
        match d {
            -1 if inferred.is_none() => inferred = Some(i),
            -1 => return Err("only one dimension may be -1".into()),
            d if d < 0 => return Err(format!("invalid dimension {d}")),
            d => known *= d as usize,
        }
    }
    let mut out: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();
    match inferred {
        Some(i) => {
            if known == 0 || numel % known != 0 {
                return Err(format!("cannot reshape {numel} elements into {shape:?}"));
            }
            out[i] = numel / known;
        }
        None if known != numel => return Err(format!("cannot reshape {numel} elements into {shape:?}")),
        None => {}
    }
    Ok(out)
}

fn build_conv2d(attrs: &Attrs, inputs: &[&HostTensor]) -> AttrResult<Op> {
    let (x, w) = (inputs[0], inputs[1]);
    if x.rank() != 4 || w.rank() != 4 {
        return Err(format!("expects 4-D input and weight, got {:?} and {:?}", x.shape, w.shape));
    }
    let groups = attrs.int("groups", 1)?;
    if groups < 1 {
        return Err(format!("groups must be positive, got {groups}"));
    }
    let attrs = Conv2dAttrs {
        stride: attrs.pair("stride", [1, 1])?,
        padding: attrs.pair("padding", [0, 0])?,
        dilation: attrs.pair("dilation", [1, 1])?,
        groups: groups as usize,
    };
    if x.shape[1] != w.shape[1] * attrs.groups {
        return Err(format!(
            "input has {} channels, weight expects {} x {} groups",
            x.shape[1], w.shape[1], attrs.groups
        ));
    }
    Ok(Op::Conv2d {
        attrs,
        fused: Default::default(),
    })
}

fn build_linear(_: &Attrs, inputs: &[&HostTensor]) -> AttrResult<Op> {
    let (x, w) = (inputs[0], inputs[1]);
    if w.rank() != 2 || x.shape.last() != Some(&w.shape[1]) {
        return Err(format!("input {:?} does not match weight {:?}", x.shape, w.shape));
    }
    Ok(Op::Linear {
        fused: Default::default(),
    })
}

fn build_batch_norm(attrs: &Attrs, inputs: &[&HostTensor]) -> AttrResult<Op> {
    if inputs[0].rank() != 4 {
        return Err(format!("expects a 4-D input, got {:?}", inputs[0].shape));
    }
    Ok(Op::BatchNorm2d {
        eps: attrs.float("eps", 1e-5)?,
    })
}

fn pool_attrs(attrs: &Attrs, inputs: &[&HostTensor]) -> AttrResult<PoolAttrs> {
    if inputs[0].rank() != 4 {
        return Err(format!("expects a 4-D input, got {:?}", inputs[0].shape));
    }
    let kernel = attrs.pair("kernel_size", [0, 0])?;
    if kernel.contains(&0) {
        return Err("`kernel_size` is required".into());
    }
    if attrs.pair("dilation", [1, 1])? != [1, 1] {
        return Err("dilated pooling is not supported".into());
    }
    Ok(PoolAttrs {
        kernel,
        stride: attrs.pair("stride", kernel)?,
        padding: attrs.pair("padding", [0, 0])?,
        ceil_mode: attrs.bool("ceil_mode", false)?,
        count_include_pad: attrs.bool("count_include_pad", true)?,
        fused: Default::default(),
    })
}

fn build_max_pool(attrs: &Attrs, inputs: &[&HostTensor]) -> AttrResult<Op> {
    Ok(Op::MaxPool2d(pool_attrs(attrs, inputs)?))
}

fn build_avg_pool(attrs: &Attrs, inputs: &[&HostTensor]) -> AttrResult<Op> {
    Ok(Op::AvgPool2d(pool_attrs(attrs, inputs)?))
}

/// Global pooling becomes a mean; evenly dividing sizes become a strided pool.
fn build_adaptive_avg_pool(attrs: &Attrs, inputs: &[&HostTensor]) -> AttrResult<Op> {
    let x = inputs[0];
    if x.rank() != 4 {
        return Err(format!("expects a 4-D input, got {:?}", x.shape));
    }
    let out = attrs.pair("output_size", [1, 1])?;
    if out == [1, 1] {
        return Ok(Op::Mean {
            axes: vec![2, 3],
            keep_dims: true,
        });
    }
    let (h, w) = (x.shape[2], x.shape[3]);
    if out.contains(&0) || h % out[0] != 0 || w % out[1] != 0 {
        return Err(format!("output size {out:?} does not evenly divide input {:?}", [h, w]));
    }
    let kernel = [h / out[0], w / out[1]];
    Ok(Op::AvgPool2d(PoolAttrs {
        kernel,
        stride: kernel,
        padding: [0, 0],
        ceil_mode: false,
        count_include_pad: false,
        fused: Default::default(),
    }))
}

fn build_mean(attrs: &Attrs, inputs: &[&HostTensor]) -> AttrResult<Op> {
    let rank = inputs[0].rank();
    let dims = attrs.ints("dim")?.unwrap_or_else(|| (0..rank as i64).collect());
    let mut axes = dims
        .into_iter()
        .map(|d| norm_axis(d, rank))
        .collect::<AttrResult<Vec<_>>>()?;
    axes.sort_unstable();
    axes.dedup();
    Ok(Op::Mean {
        axes,
        keep_dims: attrs.bool("keepdim", false)?,
    })
}

fn build_binary(kind: OpKind) -> BuildFn {
    match kind {
        OpKind::Add => |_, _| Ok(Op::Add { fused: Default::default() }),
        OpKind::Sub => |_, _| Ok(Op::Sub { fused: Default::default() }),
        OpKind::Mul => |_, _| Ok(Op::Mul { fused: Default::default() }),
        OpKind::Div => |_, _| Ok(Op::Div { fused: Default::default() }),
        OpKind::Maximum => |_, _| Ok(Op::Maximum),
        _ => |_, _| Ok(Op::Minimum),
    }
}

/// `clamp(min, max)` with the ranges the runtime has dedicated ops for
/// normalized. Non-finite bounds never reach the graph.
fn clamp_op(min: f32, max: f32) -> AttrResult<Op> {
    if min.is_nan() || max.is_nan() || min > max {
        return Err(format!("invalid clamp range [{min}, {max}]"));
    }
    Ok(match (min, max) {
        (lo, hi) if lo == 0.0 && hi == 6.0 => Op::Relu6,
        (lo, hi) if lo == 0.0 && hi == f32::INFINITY => Op::Relu,
        (lo, hi) if lo.is_finite() && hi.is_finite() => Op::Clamp { min: lo, max: hi },
        (lo, hi) => return Err(format!("one-sided clamp [{lo}, {hi}] is not supported")),
    })
}

fn build_clamp(attrs: &Attrs, _: &[&HostTensor]) -> AttrResult<Op> {
    clamp_op(
        attrs.float("min", f32::NEG_INFINITY)?,
        attrs.float("max", f32::INFINITY)?,
    )
}

fn build_hardtanh(attrs: &Attrs, _: &[&HostTensor]) -> AttrResult<Op> {
    clamp_op(attrs.float("min_val", -1.0)?, attrs.float("max_val", 1.0)?)
}

fn build_softmax(attrs: &Attrs, inputs: &[&HostTensor]) -> AttrResult<Op> {
    Ok(Op::Softmax {
        axis: norm_axis(attrs.int("dim", -1)?, inputs[0].rank())?,
    })
}

fn build_reshape(attrs: &Attrs, inputs: &[&HostTensor]) -> AttrResult<Op> {
    let shape = attrs.ints("shape")?.ok_or("`shape` is required")?;
    Ok(Op::Reshape {
        shape: resolve_shape(&shape, inputs[0].numel())?,
    })
}

fn build_flatten(attrs: &Attrs, inputs: &[&HostTensor]) -> AttrResult<Op> {
    let rank = inputs[0].rank();
    let start_dim = norm_axis(attrs.int("start_dim", 0)?, rank)?;
    let end_dim = norm_axis(attrs.int("end_dim", -1)?, rank)?;
    if end_dim != rank.saturating_sub(1) {
        return Err("only flattening through the last dimension is supported".into());
    }
    Ok(Op::Flatten { start_dim })
}

fn build_permute(attrs: &Attrs, inputs: &[&HostTensor]) -> AttrResult<Op> {
    let rank = inputs[0].rank();
    let dims = attrs.ints("dims")?.ok_or("`dims` is required")?;
    let perm = dims
        .into_iter()
        .map(|d| norm_axis(d, rank))
        .collect::<AttrResult<Vec<_>>>()?;
    if perm.len() != rank || !crate::tensor::is_permutation(&perm) {
        return Err(format!("{perm:?} is not a permutation of rank {rank}"));
    }
    Ok(Op::Transpose { perm })
}

fn build_transpose(attrs: &Attrs, inputs: &[&HostTensor]) -> AttrResult<Op> {
    let rank = inputs[0].rank();
    let a = norm_axis(attrs.int("dim0", 0)?, rank)?;
    let b = norm_axis(attrs.int("dim1", 1)?, rank)?;
    let mut perm: Vec<usize> = (0..rank).collect();
    perm.swap(a, b);
    Ok(Op::Transpose { perm })
}

fn build_concat(attrs: &Attrs, inputs: &[&HostTensor]) -> AttrResult<Op> {
    let rank = inputs[0].rank();
    let axis = norm_axis(attrs.int("dim", 0)?, rank)?;
    for t in inputs {
        let same = t.rank() == rank
            && t.shape.iter().zip(&inputs[0].shape).enumerate().all(|(i, (a, b))| i == axis || a == b);
        if !same {
            return Err(format!("cannot concatenate {:?} with {:?} on axis {axis}", t.shape, inputs[0].shape));
        }
    }
    Ok(Op::Concat { axis })
}

/// `pad` lists `[before, after]` pairs starting from the last dimension.
fn build_pad(attrs: &Attrs, inputs: &[&HostTensor]) -> AttrResult<Op> {
    let rank = inputs[0].rank();
    let flat = attrs.ints("pad")?.ok_or("`pad` is required")?;
    if flat.len() % 2 != 0 || flat.len() / 2 > rank {
        return Err(format!("invalid pad list {flat:?} for rank {rank}"));
    }
    if flat.iter().any(|&p| p < 0) {
        return Err("negative padding is not supported".into());
    }
    if attrs.int("mode", 0)? != 0 {
        return Err("only constant padding is supported".into());
    }
    let mut pads = vec![[0usize; 2]; rank];
    for (i, pair) in flat.chunks(2).enumerate() {
        pads[rank - 1 - i] = [pair[0] as usize, pair[1] as usize];
    }
    Ok(Op::Pad {
        pads,
        value: attrs.float("value", 0.0)?,
    })
}

fn internal(_: &Attrs, _: &[&HostTensor]) -> AttrResult<Op> {
    Err("internal operator cannot be dispatched by name".into())
}

// ---------------------------------------------------------------------------
// Catalogue
// ---------------------------------------------------------------------------

use LayoutClass::*;
use QuantRole::{Activation as Act, Skip, Weight};

const SIGMOID_QPARAMS: (f32, i64) = (1.0 / 256.0, -128);
const TANH_QPARAMS: (f32, i64) = (1.0 / 128.0, 0);

#[allow(clippy::too_many_arguments)]
fn schema(
    kind: OpKind,
    name: &'static str,
    aliases: &'static [&'static str],
    arity: (usize, usize),
    layout: LayoutClass,
    quantizable: bool,
    quant_inputs: &'static [QuantRole],
    tflite: Option<BuiltinOperator>,
    build: BuildFn,
) -> OpSchema {
    OpSchema {
        kind,
        name,
        aliases,
        arity,
        layout,
        quantizable,
        quant_inputs,
        fixed_qparams: None,
        tflite,
        callable: true,
        build,
    }
}

fn standard_schemas() -> Vec<OpSchema> {
    const ACT: &[QuantRole] = &[Act];
    const AFFINE: &[QuantRole] = &[Act, Weight, Skip];
    const NORM: &[QuantRole] = &[Act, Skip];

    let mut schemas = vec![
        schema(OpKind::Conv2d, "conv2d", &["_convolution", "convolution"], (2, 3), ChannelSensitive, true, AFFINE, Some(BuiltinOperator::CONV_2D), build_conv2d),
        schema(OpKind::Linear, "linear", &["addmm", "dense"], (2, 3), RequiresSource, true, AFFINE, Some(BuiltinOperator::FULLY_CONNECTED), build_linear),
        schema(OpKind::BatchNorm2d, "batch_norm", &["batch_norm2d", "native_batch_norm"], (5, 5), ChannelSensitive, false, NORM, None, build_batch_norm),
        schema(OpKind::MaxPool2d, "max_pool2d", &[], (1, 1), ChannelSensitive, true, ACT, Some(BuiltinOperator::MAX_POOL_2D), build_max_pool),
        schema(OpKind::AvgPool2d, "avg_pool2d", &[], (1, 1), ChannelSensitive, true, ACT, Some(BuiltinOperator::AVERAGE_POOL_2D), build_avg_pool),
        schema(OpKind::Mean, "mean", &["reduce_mean"], (1, 1), AxisParam, true, ACT, Some(BuiltinOperator::MEAN), build_mean),
        schema(OpKind::Add, "add", &["iadd"], (2, 2), Transparent, true, ACT, Some(BuiltinOperator::ADD), build_binary(OpKind::Add)),
        schema(OpKind::Sub, "sub", &["subtract"], (2, 2), Transparent, true, ACT, Some(BuiltinOperator::SUB), build_binary(OpKind::Sub)),
        schema(OpKind::Mul, "mul", &["multiply", "imul"], (2, 2), Transparent, true, ACT, Some(BuiltinOperator::MUL), build_binary(OpKind::Mul)),
        schema(OpKind::Div, "div", &["true_divide", "divide"], (2, 2), Transparent, false, ACT, Some(BuiltinOperator::DIV), build_binary(OpKind::Div)),
        schema(OpKind::Maximum, "maximum", &["max"], (2, 2), Transparent, true, ACT, Some(BuiltinOperator::MAXIMUM), build_binary(OpKind::Maximum)),
        schema(OpKind::Minimum, "minimum", &["min"], (2, 2), Transparent, true, ACT, Some(BuiltinOperator::MINIMUM), build_binary(OpKind::Minimum)),
        schema(OpKind::Relu, "relu", &[], (1, 1), Transparent, true, ACT, Some(BuiltinOperator::RELU), |_, _| Ok(Op::Relu)),
        schema(OpKind::Relu6, "relu6", &[], (1, 1), Transparent, true, ACT, Some(BuiltinOperator::RELU6), |_, _| Ok(Op::Relu6)),
        // Lowered to a RELU variant when the range matches one, else MAXIMUM + MINIMUM.
        schema(OpKind::Clamp, "clamp", &["clip"], (1, 1), Transparent, true, ACT, Some(BuiltinOperator::MAXIMUM), build_clamp),
        schema(OpKind::Sigmoid, "sigmoid", &["logistic"], (1, 1), Transparent, true, ACT, Some(BuiltinOperator::LOGISTIC), |_, _| Ok(Op::Sigmoid)),
        schema(OpKind::Tanh, "tanh", &[], (1, 1), Transparent, true, ACT, Some(BuiltinOperator::TANH), |_, _| Ok(Op::Tanh)),
        schema(OpKind::Hardswish, "hardswish", &["hard_swish"], (1, 1), Transparent, true, ACT, Some(BuiltinOperator::HARD_SWISH), |_, _| Ok(Op::Hardswish)),
        schema(OpKind::Softmax, "softmax", &[], (1, 1), AxisParam, true, ACT, Some(BuiltinOperator::SOFTMAX), build_softmax),
        schema(OpKind::Reshape, "reshape", &["view"], (1, 1), RequiresSource, true, ACT, Some(BuiltinOperator::RESHAPE), build_reshape),
        schema(OpKind::Flatten, "flatten", &[], (1, 1), RequiresSource, true, ACT, Some(BuiltinOperator::RESHAPE), build_flatten),
        schema(OpKind::Transpose, "permute", &[], (1, 1), RequiresSource, true, ACT, Some(BuiltinOperator::TRANSPOSE), build_permute),
        schema(OpKind::Concat, "cat", &["concat", "concatenate"], (1, usize::MAX), AxisParam, true, ACT, Some(BuiltinOperator::CONCATENATION), build_concat),
        schema(OpKind::Pad, "pad", &["constant_pad_nd"], (1, 1), AxisParam, true, ACT, Some(BuiltinOperator::PAD), build_pad),
        schema(OpKind::Identity, "identity", &["dropout", "contiguous", "clone", "detach"], (1, 1), Transparent, false, ACT, None, |_, _| Ok(Op::Identity)),
        schema(OpKind::FakeQuantize, "fake_quantize", &[], (1, 1), Transparent, false, ACT, None, internal),
        schema(OpKind::Quantize, "quantize", &[], (1, 1), Transparent, false, ACT, Some(BuiltinOperator::QUANTIZE), internal),
        schema(OpKind::Dequantize, "dequantize", &[], (1, 1), Transparent, false, ACT, Some(BuiltinOperator::DEQUANTIZE), internal),
        schema(OpKind::QatLinear, "qat_linear", &[], (2, 3), RequiresSource, false, AFFINE, None, internal),
        schema(OpKind::QatConv2d, "qat_conv2d", &[], (2, 7), ChannelSensitive, false, AFFINE, None, internal),
    ];

    // Extra call forms that build an existing kind.
    schemas.push(schema(OpKind::Transpose, "transpose", &[], (1, 1), RequiresSource, true, ACT, Some(BuiltinOperator::TRANSPOSE), build_transpose));
    schemas.push(schema(OpKind::Clamp, "hardtanh", &[], (1, 1), Transparent, true, ACT, Some(BuiltinOperator::MAXIMUM), build_hardtanh));
    schemas.push(schema(OpKind::Mean, "adaptive_avg_pool2d", &[], (1, 1), AxisParam, true, ACT, Some(BuiltinOperator::MEAN), build_adaptive_avg_pool));

    for s in &mut schemas {
        match s.kind {
            OpKind::Sigmoid | OpKind::Softmax => s.fixed_qparams = Some(SIGMOID_QPARAMS),
            OpKind::Tanh => s.fixed_qparams = Some(TANH_QPARAMS),
            OpKind::FakeQuantize | OpKind::Quantize | OpKind::Dequantize | OpKind::QatLinear | OpKind::QatConv2d => {
                s.callable = false
            }
            _ => {}
        }
    }
    schemas
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(shape: Vec<usize>) -> HostTensor {
        HostTensor::zeros(shape)
    }

    #[test]
    fn test_resolve_strips_namespaces_and_inplace_suffix() {
        let reg = OpRegistry::standard();
        assert_eq!(reg.resolve("aten::relu_").map(|s| s.kind), Some(OpKind::Relu));
        assert_eq!(reg.resolve("F.linear").map(|s| s.kind), Some(OpKind::Linear));
        assert_eq!(reg.resolve("torch.cat").map(|s| s.kind), Some(OpKind::Concat));
        assert!(reg.resolve("erfinv").is_none());
        assert!(reg.resolve("fake_quantize").is_none());
    }

    #[test]
    fn test_every_kind_has_a_schema() {
        let reg = OpRegistry::standard();
        for s in reg.iter() {
            assert_eq!(reg.schema(s.kind).map(|x| x.kind), Some(s.kind));
        }
        assert!(reg.schema(OpKind::QatConv2d).is_some());
    }

    #[test]
    fn test_conv2d_attrs() {
        let reg = OpRegistry::standard();
        let x = t(vec![1, 4, 8, 8]);
        let w = t(vec![8, 2, 3, 3]);
        let attrs = Attrs::new().with("stride", 2usize).with("padding", [1usize, 1]).with("groups", 2usize);
        let op = reg.resolve("conv2d").unwrap().build(&attrs, &[&x, &w]).unwrap();
        let Op::Conv2d { attrs, .. } = op else { panic!("expected conv") };
        assert_eq!(attrs.stride, [2, 2]);
        assert_eq!(attrs.padding, [1, 1]);
        assert_eq!(attrs.groups, 2);
    }

    #[test]
    fn test_arity_checked() {
        let reg = OpRegistry::standard();
        let x = t(vec![2]);
        let err = reg.resolve("add").unwrap().build(&Attrs::new(), &[&x]).unwrap_err();
        assert!(err.contains("expected 2 operands"));
    }

    #[test]
    fn test_clamp_normalization() {
        let reg = OpRegistry::standard();
        let x = t(vec![3]);
        let clamp = reg.resolve("clamp").unwrap();
        let op = clamp.build(&Attrs::new().with("min", 0.0f32).with("max", 6.0f32), &[&x]).unwrap();
        assert_eq!(op, Op::Relu6);
        let op = clamp.build(&Attrs::new().with("min", 0.0f32), &[&x]).unwrap();
        assert_eq!(op, Op::Relu);
        let op = reg.resolve("hardtanh").unwrap().build(&Attrs::new(), &[&x]).unwrap();
        assert_eq!(op, Op::Clamp { min: -1.0, max: 1.0 });
        assert!(clamp.build(&Attrs::new().with("max", 1.0f32), &[&x]).is_err());
    }

    #[test]
    fn test_reshape_infers_one_dim() {
        let reg = OpRegistry::standard();
        let x = t(vec![2, 3, 4]);
        let op = reg
            .resolve("view")
            .unwrap()
            .build(&Attrs::new().with("shape", vec![2i64, -1]), &[&x])
            .unwrap();
        assert_eq!(op, Op::Reshape { shape: vec![2, 12] });
    }

    #[test]
    fn test_pad_pairs_start_from_last_axis() {
        let reg = OpRegistry::standard();
        let x = t(vec![1, 1, 2, 2]);
        let op = reg
            .resolve("F.pad")
            .unwrap()
            .build(&Attrs::new().with("pad", vec![1i64, 2, 3, 4]), &[&x])
            .unwrap();
        assert_eq!(
            op,
            Op::Pad {
                pads: vec![[0, 0], [0, 0], [3, 4], [1, 2]],
                value: 0.0
            }
        );
    }

    #[test]
    fn test_global_adaptive_pool_is_mean() {
        let reg = OpRegistry::standard();
        let x = t(vec![1, 3, 7, 7]);
        let op = reg.resolve("adaptive_avg_pool2d").unwrap().build(&Attrs::new(), &[&x]).unwrap();
        assert_eq!(
            op,
            Op::Mean {
                axes: vec![2, 3],
                keep_dims: true
            }
        );
    }

    #[test]
    fn test_fixed_output_qparams() {
        let reg = OpRegistry::standard();
        assert_eq!(reg.schema(OpKind::Tanh).unwrap().fixed_qparams, Some((1.0 / 128.0, 0)));
        assert_eq!(reg.schema(OpKind::Softmax).unwrap().fixed_qparams, Some((1.0 / 256.0, -128)));
        assert_eq!(reg.schema(OpKind::Relu).unwrap().fixed_qparams, None);
    }
}
