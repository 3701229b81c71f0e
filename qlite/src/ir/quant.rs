//! Quantization parameters attached to tensor descriptors.

use std::sync::Arc;

use qlite_kernels::kernels::quant::{dequantize_value, quantize_value};
use qlite_kernels::{QRange, Rounding};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::tensor::{DType, HostTensor, TensorData};

/// Affine quantization parameters, per tensor or per channel along `axis`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantParams {
    pub scale: Vec<f32>,
    pub zero_point: Vec<i64>,
    pub axis: Option<usize>,
}

impl QuantParams {
    pub fn per_tensor(scale: f32, zero_point: i64) -> Self {
        Self {
            scale: vec![scale],
            zero_point: vec![zero_point],
            axis: None,
        }
    }

    pub fn per_channel(scale: Vec<f32>, zero_point: Vec<i64>, axis: usize) -> Self {
        Self {
            scale,
            zero_point,
            axis: Some(axis),
        }
    }

    pub fn is_per_channel(&self) -> bool {
        self.axis.is_some()
    }

    /// Scale and zero point for every element position of `shape`.
    fn channel_of(&self, shape: &[usize]) -> impl Fn(usize) -> usize + '_ {
        let (inner, channels) = match self.axis {
            Some(axis) if axis < shape.len() => (shape[axis + 1..].iter().product::<usize>(), shape[axis]),
            _ => (1, 1),
        };
        move |i| {
            if self.scale.len() == 1 {
                0
            } else {
                (i / inner.max(1)) % channels.max(1)
            }
        }
    }

    /// Check that the parameters can describe a tensor of `shape`.
    pub fn check(&self, shape: &[usize]) -> Result<()> {
        if self.scale.is_empty() || self.scale.len() != self.zero_point.len() {
            return Err(Error::InvalidTensor(format!(
                "{} scales vs {} zero points",
                self.scale.len(),
                self.zero_point.len()
            )));
        }
        if let Some(axis) = self.axis {
            let channels = shape.get(axis).copied().unwrap_or(0);
            if self.scale.len() != channels && self.scale.len() != 1 {
                return Err(Error::InvalidTensor(format!(
                    "{} per-channel scales for axis {axis} of {shape:?}",
                    self.scale.len()
                )));
            }
        }
        Ok(())
    }

    /// Map real values onto the integer grid of `dtype`.
    pub fn quantize(&self, t: &HostTensor, dtype: DType, rounding: Rounding) -> Result<HostTensor> {
        self.check(&t.shape)?;
        let values = t.as_f32()?;
        let range = qrange(dtype)?;
        let channel = self.channel_of(&t.shape);
        let q = values.iter().enumerate().map(|(i, &x)| {
            let c = channel(i);
            quantize_value(x, self.scale[c], self.zero_point[c], range, rounding)
        });
        HostTensor::from_data(t.shape.clone(), TensorData::from_i64(dtype, q))
    }

    /// Map integer storage back to real values.
    pub fn dequantize(&self, t: &HostTensor) -> Result<HostTensor> {
        self.check(&t.shape)?;
        let channel = self.channel_of(&t.shape);
        let values = t
            .data
            .to_i64_vec()
            .into_iter()
            .enumerate()
            .map(|(i, q)| {
                let c = channel(i);
                dequantize_value(q, self.scale[c], self.zero_point[c])
            })
            .collect();
        HostTensor::from_data(t.shape.clone(), TensorData::F32(Arc::new(values)))
    }

    /// Same scales with every zero point shifted by `delta`.
    pub fn shifted(&self, delta: i64) -> Self {
        Self {
            scale: self.scale.clone(),
            zero_point: self.zero_point.iter().map(|z| z + delta).collect(),
            axis: self.axis,
        }
    }
}

/// Integer grid of a quantized storage type.
pub fn qrange(dtype: DType) -> Result<QRange> {
    match dtype {
        DType::I8 => Ok(QRange::INT8),
        DType::U8 => Ok(QRange::UINT8),
        DType::I32 => Ok(QRange::INT32),
        DType::F32 => Err(Error::InvalidTensor(
            "f32 is not a quantized storage type".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantize_dequantize_per_tensor() {
        let q = QuantParams::per_tensor(0.5, 10);
        let t = HostTensor::new(vec![3], vec![0.0, 1.0, -1.25]).unwrap();
        let qt = q.quantize(&t, DType::I8, Rounding::HalfToEven).unwrap();
        assert_eq!(qt.data.to_i64_vec(), vec![10, 12, 8]);
        let back = q.dequantize(&qt).unwrap();
        assert_eq!(back.to_f32_vec(), vec![0.0, 1.0, -1.0]);
    }

    #[test]
    fn test_per_channel_axis0() {
        let q = QuantParams::per_channel(vec![1.0, 0.5], vec![0, 0], 0);
        let t = HostTensor::new(vec![2, 2], vec![2.0, 2.0, 2.0, 2.0]).unwrap();
        let qt = q.quantize(&t, DType::I8, Rounding::HalfToEven).unwrap();
        assert_eq!(qt.data.to_i64_vec(), vec![2, 2, 4, 4]);
    }

    #[test]
    fn test_check_rejects_channel_count() {
        let q = QuantParams::per_channel(vec![1.0, 0.5, 0.25], vec![0; 3], 0);
        assert!(q.check(&[2, 4]).is_err());
    }

    #[test]
    fn test_shifted_for_uint8() {
        let q = QuantParams::per_tensor(0.1, -128).shifted(128);
        assert_eq!(q.zero_point, vec![0]);
    }
}
