//! Functional operators, thin wrappers over [`Session::call`].

use crate::error::Result;
use crate::ir::Conv2dAttrs;
use crate::registry::Attrs;
use crate::trace::{Session, Value};

fn operands<'a>(x: &'a Value, rest: &[&'a Value]) -> Vec<&'a Value> {
    std::iter::once(x).chain(rest.iter().copied()).collect()
}

pub fn linear(s: &mut Session, x: &Value, weight: &Value, bias: Option<&Value>) -> Result<Value> {
    let mut args = vec![x, weight];
    args.extend(bias);
    s.call("linear", &args, Attrs::new())
}

pub fn conv2d(s: &mut Session, x: &Value, weight: &Value, bias: Option<&Value>, attrs: &Conv2dAttrs) -> Result<Value> {
    let mut args = vec![x, weight];
    args.extend(bias);
    s.call(
        "conv2d",
        &args,
        Attrs::new()
            .with("stride", attrs.stride)
            .with("padding", attrs.padding)
            .with("dilation", attrs.dilation)
            .with("groups", attrs.groups),
    )
}

pub fn relu(s: &mut Session, x: &Value) -> Result<Value> {
    s.call("relu", &[x], Attrs::new())
}

pub fn relu6(s: &mut Session, x: &Value) -> Result<Value> {
    s.call("relu6", &[x], Attrs::new())
}

pub fn clamp(s: &mut Session, x: &Value, min: f32, max: f32) -> Result<Value> {
    s.call("clamp", &[x], Attrs::new().with("min", min).with("max", max))
}

pub fn sigmoid(s: &mut Session, x: &Value) -> Result<Value> {
    s.call("sigmoid", &[x], Attrs::new())
}

pub fn tanh(s: &mut Session, x: &Value) -> Result<Value> {
    s.call("tanh", &[x], Attrs::new())
}

pub fn add(s: &mut Session, a: &Value, b: &Value) -> Result<Value> {
    s.call("add", &operands(a, &[b]), Attrs::new())
}

pub fn sub(s: &mut Session, a: &Value, b: &Value) -> Result<Value> {
    s.call("sub", &operands(a, &[b]), Attrs::new())
}

pub fn mul(s: &mut Session, a: &Value, b: &Value) -> Result<Value> {
    s.call("mul", &operands(a, &[b]), Attrs::new())
}

pub fn div(s: &mut Session, a: &Value, b: &Value) -> Result<Value> {
    s.call("div", &operands(a, &[b]), Attrs::new())
}

pub fn softmax(s: &mut Session, x: &Value, dim: i64) -> Result<Value> {
    s.call("softmax", &[x], Attrs::new().with("dim", dim))
}

pub fn reshape(s: &mut Session, x: &Value, shape: &[i64]) -> Result<Value> {
    s.call("reshape", &[x], Attrs::new().with("shape", shape.to_vec()))
}

pub fn flatten(s: &mut Session, x: &Value, start_dim: i64) -> Result<Value> {
    s.call("flatten", &[x], Attrs::new().with("start_dim", start_dim))
}

pub fn permute(s: &mut Session, x: &Value, dims: &[i64]) -> Result<Value> {
    s.call("permute", &[x], Attrs::new().with("dims", dims.to_vec()))
}

pub fn cat(s: &mut Session, xs: &[&Value], dim: i64) -> Result<Value> {
    s.call("cat", xs, Attrs::new().with("dim", dim))
}

/// `pad` lists `[before, after]` pairs from the last dimension backwards.
pub fn pad(s: &mut Session, x: &Value, pad: &[i64], value: f32) -> Result<Value> {
    s.call("pad", &[x], Attrs::new().with("pad", pad.to_vec()).with("value", value))
}

pub fn mean(s: &mut Session, x: &Value, dims: &[i64], keepdim: bool) -> Result<Value> {
    s.call("mean", &[x], Attrs::new().with("dim", dims.to_vec()).with("keepdim", keepdim))
}

pub fn max_pool2d(s: &mut Session, x: &Value, kernel: [usize; 2], stride: [usize; 2], padding: [usize; 2]) -> Result<Value> {
    s.call(
        "max_pool2d",
        &[x],
        Attrs::new()
            .with("kernel_size", kernel)
            .with("stride", stride)
            .with("padding", padding),
    )
}
