//! Eager module API.
//!
//! A module computes its forward pass by dispatching operators through a
//! [`Session`]; whether that pass is also recorded is the session's concern.

pub mod functional;
mod graph_module;
mod layers;

pub use graph_module::GraphModule;
pub use layers::*;

use crate::error::Result;
use crate::ir::ModuleKind;
use crate::trace::{Session, Value};

pub trait Module {
    fn kind(&self) -> ModuleKind;

    fn forward(&self, s: &mut Session, inputs: &[Value]) -> Result<Vec<Value>>;
}

impl<M: Module + ?Sized> Module for Box<M> {
    fn kind(&self) -> ModuleKind {
        (**self).kind()
    }

    fn forward(&self, s: &mut Session, inputs: &[Value]) -> Result<Vec<Value>> {
        (**self).forward(s, inputs)
    }
}

/// A module defined by a closure, for ad-hoc forward passes.
pub struct FnModule<F> {
    name: String,
    f: F,
}

impl<F> FnModule<F>
where
    F: Fn(&mut Session, &[Value]) -> Result<Vec<Value>>,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self { name: name.into(), f }
    }
}

impl<F> Module for FnModule<F>
where
    F: Fn(&mut Session, &[Value]) -> Result<Vec<Value>>,
{
    fn kind(&self) -> ModuleKind {
        ModuleKind::Custom(self.name.clone())
    }

    fn forward(&self, s: &mut Session, inputs: &[Value]) -> Result<Vec<Value>> {
        (self.f)(s, inputs)
    }
}

/// Children run in order, each feeding the next.
#[derive(Default)]
pub struct Sequential {
    layers: Vec<(String, Box<dyn Module>)>,
}

impl Sequential {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, name: impl Into<String>, module: impl Module + 'static) -> Self {
        self.layers.push((name.into(), Box::new(module)));
        self
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl Module for Sequential {
    fn kind(&self) -> ModuleKind {
        ModuleKind::Sequential
    }

    fn forward(&self, s: &mut Session, inputs: &[Value]) -> Result<Vec<Value>> {
        let mut values = inputs.to_vec();
        for (name, layer) in &self.layers {
            values = s.invoke(name, layer.as_ref(), &values)?;
        }
        Ok(values)
    }
}
