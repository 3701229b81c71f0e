use super::functional as F;
use super::Module;
use crate::error::{Error, Result};
use crate::ir::{Conv2dAttrs, ModuleKind};
use crate::registry::Attrs;
use crate::tensor::HostTensor;
use crate::trace::{Session, Value};

fn single<'a>(module: &str, inputs: &'a [Value]) -> Result<&'a Value> {
    match inputs {
        [x] => Ok(x),
        _ => Err(Error::InvalidArgument {
            op: module.to_string(),
            scope: String::new(),
            reason: format!("expected 1 input, got {}", inputs.len()),
        }),
    }
}

// ---------------------------------------------------------------------------
// Parameterized layers
// ---------------------------------------------------------------------------

/// `y = x W^T + b` with `W: [out, in]`.
pub struct Linear {
    pub weight: HostTensor,
    pub bias: Option<HostTensor>,
}

impl Linear {
    pub fn new(weight: HostTensor, bias: Option<HostTensor>) -> Self {
        Self { weight, bias }
    }
}

impl Module for Linear {
    fn kind(&self) -> ModuleKind {
        ModuleKind::Linear
    }

    fn forward(&self, s: &mut Session, inputs: &[Value]) -> Result<Vec<Value>> {
        let x = single("Linear", inputs)?;
        let w = s.param("weight", &self.weight);
        let b = self.bias.as_ref().map(|b| s.param("bias", b));
        Ok(vec![F::linear(s, x, &w, b.as_ref())?])
    }
}

/// 2-D convolution over NCHW input, weight `[Co, Ci/groups, Kh, Kw]`.
pub struct Conv2d {
    pub weight: HostTensor,
    pub bias: Option<HostTensor>,
    pub attrs: Conv2dAttrs,
}

impl Conv2d {
    pub fn new(weight: HostTensor, bias: Option<HostTensor>) -> Self {
        Self {
            weight,
            bias,
            attrs: Conv2dAttrs::default(),
        }
    }

    pub fn stride(mut self, stride: usize) -> Self {
        self.attrs.stride = [stride, stride];
        self
    }

    pub fn padding(mut self, padding: usize) -> Self {
        self.attrs.padding = [padding, padding];
        self
    }

    pub fn dilation(mut self, dilation: usize) -> Self {
        self.attrs.dilation = [dilation, dilation];
        self
    }

    pub fn groups(mut self, groups: usize) -> Self {
        self.attrs.groups = groups;
        self
    }
}

impl Module for Conv2d {
    fn kind(&self) -> ModuleKind {
        ModuleKind::Conv2d
    }

    fn forward(&self, s: &mut Session, inputs: &[Value]) -> Result<Vec<Value>> {
        let x = single("Conv2d", inputs)?;
        let w = s.param("weight", &self.weight);
        let b = self.bias.as_ref().map(|b| s.param("bias", b));
        Ok(vec![F::conv2d(s, x, &w, b.as_ref(), &self.attrs)?])
    }
}

/// Inference-mode batch norm with running statistics.
pub struct BatchNorm2d {
    pub running_mean: HostTensor,
    pub running_var: HostTensor,
    pub weight: HostTensor,
    pub bias: HostTensor,
    pub eps: f32,
}

impl BatchNorm2d {
    pub fn new(running_mean: HostTensor, running_var: HostTensor, weight: HostTensor, bias: HostTensor) -> Self {
        Self {
            running_mean,
            running_var,
            weight,
            bias,
            eps: 1e-5,
        }
    }

    /// Identity statistics for `channels` channels.
    pub fn identity(channels: usize) -> Self {
        Self::new(
            HostTensor::zeros(vec![channels]),
            HostTensor::full(vec![channels], 1.0),
            HostTensor::full(vec![channels], 1.0),
            HostTensor::zeros(vec![channels]),
        )
    }
}

impl Module for BatchNorm2d {
    fn kind(&self) -> ModuleKind {
        ModuleKind::BatchNorm2d
    }

    fn forward(&self, s: &mut Session, inputs: &[Value]) -> Result<Vec<Value>> {
        let x = single("BatchNorm2d", inputs)?;
        let mean = s.param("running_mean", &self.running_mean);
        let var = s.param("running_var", &self.running_var);
        let gamma = s.param("weight", &self.weight);
        let beta = s.param("bias", &self.bias);
        let y = s.call(
            "batch_norm",
            &[x, &mean, &var, &gamma, &beta],
            Attrs::new().with("eps", self.eps),
        )?;
        Ok(vec![y])
    }
}

// ---------------------------------------------------------------------------
// Activations
// ---------------------------------------------------------------------------

macro_rules! activation {
    ($name:ident, $ident:literal) => {
        #[derive(Debug, Clone, Copy, Default)]
        pub struct $name;

        impl Module for $name {
            fn kind(&self) -> ModuleKind {
                ModuleKind::$name
            }

            fn forward(&self, s: &mut Session, inputs: &[Value]) -> Result<Vec<Value>> {
                let x = single(stringify!($name), inputs)?;
                Ok(vec![s.call($ident, &[x], Attrs::new())?])
            }
        }
    };
}

activation!(ReLU, "relu");
activation!(ReLU6, "relu6");
activation!(Sigmoid, "sigmoid");
activation!(Tanh, "tanh");
activation!(Hardswish, "hardswish");

#[derive(Debug, Clone, Copy)]
pub struct Hardtanh {
    pub min_val: f32,
    pub max_val: f32,
}

impl Default for Hardtanh {
    fn default() -> Self {
        Self {
            min_val: -1.0,
            max_val: 1.0,
        }
    }
}

impl Module for Hardtanh {
    fn kind(&self) -> ModuleKind {
        ModuleKind::Hardtanh
    }

    fn forward(&self, s: &mut Session, inputs: &[Value]) -> Result<Vec<Value>> {
        let x = single("Hardtanh", inputs)?;
        let attrs = Attrs::new().with("min_val", self.min_val).with("max_val", self.max_val);
        Ok(vec![s.call("hardtanh", &[x], attrs)?])
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Softmax {
    pub dim: i64,
}

impl Module for Softmax {
    fn kind(&self) -> ModuleKind {
        ModuleKind::Softmax
    }

    fn forward(&self, s: &mut Session, inputs: &[Value]) -> Result<Vec<Value>> {
        let x = single("Softmax", inputs)?;
        Ok(vec![F::softmax(s, x, self.dim)?])
    }
}

/// Inference-mode dropout: the identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct Dropout;

impl Module for Dropout {
    fn kind(&self) -> ModuleKind {
        ModuleKind::Dropout
    }

    fn forward(&self, s: &mut Session, inputs: &[Value]) -> Result<Vec<Value>> {
        let x = single("Dropout", inputs)?;
        Ok(vec![s.call("dropout", &[x], Attrs::new())?])
    }
}

// ---------------------------------------------------------------------------
// Pooling and shape
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct MaxPool2d {
    pub kernel_size: [usize; 2],
    pub stride: [usize; 2],
    pub padding: [usize; 2],
    pub ceil_mode: bool,
}

impl MaxPool2d {
    pub fn new(kernel_size: usize) -> Self {
        Self {
            kernel_size: [kernel_size; 2],
            stride: [kernel_size; 2],
            padding: [0; 2],
            ceil_mode: false,
        }
    }
}

impl Module for MaxPool2d {
    fn kind(&self) -> ModuleKind {
        ModuleKind::MaxPool2d
    }

    fn forward(&self, s: &mut Session, inputs: &[Value]) -> Result<Vec<Value>> {
        let x = single("MaxPool2d", inputs)?;
        let attrs = Attrs::new()
            .with("kernel_size", self.kernel_size)
            .with("stride", self.stride)
            .with("padding", self.padding)
            .with("ceil_mode", self.ceil_mode);
        Ok(vec![s.call("max_pool2d", &[x], attrs)?])
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AvgPool2d {
    pub kernel_size: [usize; 2],
    pub stride: [usize; 2],
    pub padding: [usize; 2],
    pub ceil_mode: bool,
    pub count_include_pad: bool,
}

impl AvgPool2d {
    pub fn new(kernel_size: usize) -> Self {
        Self {
            kernel_size: [kernel_size; 2],
            stride: [kernel_size; 2],
            padding: [0; 2],
            ceil_mode: false,
            count_include_pad: true,
        }
    }
}

impl Module for AvgPool2d {
    fn kind(&self) -> ModuleKind {
        ModuleKind::AvgPool2d
    }

    fn forward(&self, s: &mut Session, inputs: &[Value]) -> Result<Vec<Value>> {
        let x = single("AvgPool2d", inputs)?;
        let attrs = Attrs::new()
            .with("kernel_size", self.kernel_size)
            .with("stride", self.stride)
            .with("padding", self.padding)
            .with("ceil_mode", self.ceil_mode)
            .with("count_include_pad", self.count_include_pad);
        Ok(vec![s.call("avg_pool2d", &[x], attrs)?])
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AdaptiveAvgPool2d {
    pub output_size: [usize; 2],
}

impl Module for AdaptiveAvgPool2d {
    fn kind(&self) -> ModuleKind {
        ModuleKind::AdaptiveAvgPool2d
    }

    fn forward(&self, s: &mut Session, inputs: &[Value]) -> Result<Vec<Value>> {
        let x = single("AdaptiveAvgPool2d", inputs)?;
        let attrs = Attrs::new().with("output_size", self.output_size);
        Ok(vec![s.call("adaptive_avg_pool2d", &[x], attrs)?])
    }
}

/// Flattens from `start_dim` (default 1) through the last axis.
#[derive(Debug, Clone, Copy)]
pub struct Flatten {
    pub start_dim: i64,
}

impl Default for Flatten {
    fn default() -> Self {
        Self { start_dim: 1 }
    }
}

impl Module for Flatten {
    fn kind(&self) -> ModuleKind {
        ModuleKind::Flatten
    }

    fn forward(&self, s: &mut Session, inputs: &[Value]) -> Result<Vec<Value>> {
        let x = single("Flatten", inputs)?;
        Ok(vec![F::flatten(s, x, self.start_dim)?])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::Sequential;
    use crate::registry::OpRegistry;

    #[test]
    fn test_sequential_eager() {
        let w = HostTensor::new(vec![2, 2], vec![1.0, 0.0, 0.0, -1.0]).unwrap();
        let model = Sequential::new()
            .add("fc", Linear::new(w, Some(HostTensor::new(vec![2], vec![0.5, 0.5]).unwrap())))
            .add("act", ReLU);
        let mut s = Session::eager(OpRegistry::standard());
        let x: Value = HostTensor::new(vec![1, 2], vec![1.0, 2.0]).unwrap().into();
        let y = model.forward(&mut s, &[x]).unwrap();
        assert_eq!(y[0].tensor.to_f32_vec(), vec![1.5, 0.0]);
    }

    #[test]
    fn test_conv_builder() {
        let conv = Conv2d::new(HostTensor::zeros(vec![4, 1, 3, 3]), None).stride(2).padding(1).groups(4);
        assert_eq!(conv.attrs.stride, [2, 2]);
        assert_eq!(conv.attrs.padding, [1, 1]);
        assert_eq!(conv.attrs.groups, 4);
    }

    #[test]
    fn test_layer_rejects_extra_inputs() {
        let mut s = Session::eager(OpRegistry::standard());
        let x: Value = HostTensor::zeros(vec![2]).into();
        assert!(ReLU.forward(&mut s, &[x.clone(), x]).is_err());
    }
}
