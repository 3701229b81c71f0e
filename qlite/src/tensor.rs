//! Host tensors: a concrete shape plus typed, reference-counted storage.
//!
//! Storage sits behind `Arc` so parameters captured by the tracer, the
//! rewritten graph and the serializer all point at the same buffer.

use std::fmt;
use std::sync::Arc;

use qlite_kernels::kernels::naive;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    F32,
    I32,
    I8,
    U8,
}

impl DType {
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::F32 | DType::I32 => 4,
            DType::I8 | DType::U8 => 1,
        }
    }

    pub fn is_integer(self) -> bool {
        !matches!(self, DType::F32)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::F32 => "f32",
            DType::I32 => "i32",
            DType::I8 => "i8",
            DType::U8 => "u8",
        };
        f.write_str(name)
    }
}

/// Typed element storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "dtype", content = "values", rename_all = "lowercase")]
pub enum TensorData {
    F32(Arc<Vec<f32>>),
    I32(Arc<Vec<i32>>),
    I8(Arc<Vec<i8>>),
    U8(Arc<Vec<u8>>),
}

impl TensorData {
    pub fn dtype(&self) -> DType {
        match self {
            TensorData::F32(_) => DType::F32,
            TensorData::I32(_) => DType::I32,
            TensorData::I8(_) => DType::I8,
            TensorData::U8(_) => DType::U8,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TensorData::F32(v) => v.len(),
            TensorData::I32(v) => v.len(),
            TensorData::I8(v) => v.len(),
            TensorData::U8(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Identity of the underlying buffer; equal keys mean shared storage.
    pub fn ptr_key(&self) -> usize {
        match self {
            TensorData::F32(v) => Arc::as_ptr(v) as usize,
            TensorData::I32(v) => Arc::as_ptr(v) as usize,
            TensorData::I8(v) => Arc::as_ptr(v) as usize,
            TensorData::U8(v) => Arc::as_ptr(v) as usize,
        }
    }

    /// Element values widened to `f32` (raw integers, not dequantized).
    pub fn to_f32_vec(&self) -> Vec<f32> {
        match self {
            TensorData::F32(v) => v.as_ref().clone(),
            TensorData::I32(v) => v.iter().map(|&x| x as f32).collect(),
            TensorData::I8(v) => v.iter().map(|&x| x as f32).collect(),
            TensorData::U8(v) => v.iter().map(|&x| x as f32).collect(),
        }
    }

    /// Element values widened to `i64`; floats are truncated.
    pub fn to_i64_vec(&self) -> Vec<i64> {
        match self {
            TensorData::F32(v) => v.iter().map(|&x| x as i64).collect(),
            TensorData::I32(v) => v.iter().map(|&x| x as i64).collect(),
            TensorData::I8(v) => v.iter().map(|&x| x as i64).collect(),
            TensorData::U8(v) => v.iter().map(|&x| x as i64).collect(),
        }
    }

    /// Build storage of `dtype` from integer values, saturating to its range.
    pub fn from_i64(dtype: DType, values: impl IntoIterator<Item = i64>) -> TensorData {
        let values = values.into_iter();
        match dtype {
            DType::F32 => TensorData::F32(Arc::new(values.map(|x| x as f32).collect())),
            DType::I32 => TensorData::I32(Arc::new(
                values
                    .map(|x| x.clamp(i32::MIN as i64, i32::MAX as i64) as i32)
                    .collect(),
            )),
            DType::I8 => TensorData::I8(Arc::new(
                values.map(|x| x.clamp(-128, 127) as i8).collect(),
            )),
            DType::U8 => TensorData::U8(Arc::new(values.map(|x| x.clamp(0, 255) as u8).collect())),
        }
    }

    /// Raw little-endian bytes, as laid out in a TFLite buffer.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        match self {
            TensorData::F32(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TensorData::I32(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TensorData::I8(v) => v.iter().map(|&x| x as u8).collect(),
            TensorData::U8(v) => v.as_ref().clone(),
        }
    }

    pub fn from_le_bytes(dtype: DType, bytes: &[u8]) -> Result<TensorData> {
        if bytes.len() % dtype.size_in_bytes() != 0 {
            return Err(Error::InvalidTensor(format!(
                "{} bytes is not a whole number of {dtype} elements",
                bytes.len()
            )));
        }
        Ok(match dtype {
            DType::F32 => TensorData::F32(Arc::new(
                bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            )),
            DType::I32 => TensorData::I32(Arc::new(
                bytes
                    .chunks_exact(4)
                    .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            )),
            DType::I8 => TensorData::I8(Arc::new(bytes.iter().map(|&b| b as i8).collect())),
            DType::U8 => TensorData::U8(Arc::new(bytes.to_vec())),
        })
    }

    fn permute(&self, shape: &[usize], perm: &[usize]) -> TensorData {
        fn go<T: Copy + Default>(v: &[T], shape: &[usize], perm: &[usize]) -> Arc<Vec<T>> {
            let mut out = vec![T::default(); v.len()];
            naive::permute(v, shape, perm, &mut out);
            Arc::new(out)
        }
        match self {
            TensorData::F32(v) => TensorData::F32(go(v, shape, perm)),
            TensorData::I32(v) => TensorData::I32(go(v, shape, perm)),
            TensorData::I8(v) => TensorData::I8(go(v, shape, perm)),
            TensorData::U8(v) => TensorData::U8(go(v, shape, perm)),
        }
    }
}

/// A concrete tensor as seen by kernels and the tracer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostTensor {
    pub shape: Vec<usize>,
    pub data: TensorData,
}

impl HostTensor {
    pub fn new(shape: Vec<usize>, values: Vec<f32>) -> Result<Self> {
        Self::from_data(shape, TensorData::F32(Arc::new(values)))
    }

    pub fn from_data(shape: Vec<usize>, data: TensorData) -> Result<Self> {
        let numel: usize = shape.iter().product();
        if numel != data.len() {
            return Err(Error::InvalidTensor(format!(
                "shape {shape:?} needs {numel} elements, buffer holds {}",
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    pub fn from_i32(shape: Vec<usize>, values: Vec<i32>) -> Result<Self> {
        Self::from_data(shape, TensorData::I32(Arc::new(values)))
    }

    /// Zero-dimensional `f32` tensor.
    pub fn scalar(value: f32) -> Self {
        Self {
            shape: Vec::new(),
            data: TensorData::F32(Arc::new(vec![value])),
        }
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        let numel = shape.iter().product();
        Self {
            shape,
            data: TensorData::F32(Arc::new(vec![0.0; numel])),
        }
    }

    pub fn full(shape: Vec<usize>, value: f32) -> Self {
        let numel = shape.iter().product();
        Self {
            shape,
            data: TensorData::F32(Arc::new(vec![value; numel])),
        }
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    /// Borrow the `f32` elements, failing for integer storage.
    pub fn as_f32(&self) -> Result<&[f32]> {
        match &self.data {
            TensorData::F32(v) => Ok(v.as_slice()),
            other => Err(Error::InvalidTensor(format!(
                "expected f32 storage, found {}",
                other.dtype()
            ))),
        }
    }

    pub fn to_f32_vec(&self) -> Vec<f32> {
        self.data.to_f32_vec()
    }

    /// Same storage viewed under a new shape.
    pub fn reshape(&self, shape: Vec<usize>) -> Result<Self> {
        Self::from_data(shape, self.data.clone())
    }

    /// Axis permutation; `perm[i]` names the source axis of output axis `i`.
    pub fn permute(&self, perm: &[usize]) -> Result<Self> {
        if perm.len() != self.rank() || !is_permutation(perm) {
            return Err(Error::InvalidTensor(format!(
                "{perm:?} is not a permutation of rank {}",
                self.rank()
            )));
        }
        let shape = perm.iter().map(|&p| self.shape[p]).collect();
        Ok(Self {
            shape,
            data: self.data.permute(&self.shape, perm),
        })
    }

    /// Largest element-wise absolute difference (values compared as `f32`).
    pub fn max_abs_diff(&self, other: &HostTensor) -> f32 {
        self.to_f32_vec()
            .iter()
            .zip(other.to_f32_vec())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f32::max)
    }

    pub fn ptr_key(&self) -> usize {
        self.data.ptr_key()
    }
}

pub fn is_permutation(perm: &[usize]) -> bool {
    let mut seen = vec![false; perm.len()];
    for &p in perm {
        if p >= perm.len() || seen[p] {
            return false;
        }
        seen[p] = true;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_checks_element_count() {
        assert!(HostTensor::new(vec![2, 2], vec![0.0; 3]).is_err());
        assert!(HostTensor::new(vec![2, 2], vec![0.0; 4]).is_ok());
    }

    #[test]
    fn test_reshape_shares_storage() {
        let t = HostTensor::new(vec![2, 3], (0..6).map(|v| v as f32).collect()).unwrap();
        let r = t.reshape(vec![3, 2]).unwrap();
        assert_eq!(t.ptr_key(), r.ptr_key());
        assert!(t.reshape(vec![4]).is_err());
    }

    #[test]
    fn test_permute_transposes() {
        let t = HostTensor::new(vec![2, 3], (0..6).map(|v| v as f32).collect()).unwrap();
        let p = t.permute(&[1, 0]).unwrap();
        assert_eq!(p.shape, vec![3, 2]);
        assert_eq!(p.to_f32_vec(), vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
        assert!(t.permute(&[0, 0]).is_err());
    }

    #[test]
    fn test_le_bytes_layout() {
        let data = TensorData::I32(Arc::new(vec![1, -1]));
        let bytes = data.to_le_bytes();
        assert_eq!(bytes, vec![1, 0, 0, 0, 0xff, 0xff, 0xff, 0xff]);
        assert_eq!(TensorData::from_le_bytes(DType::I32, &bytes).unwrap(), data);
        assert!(TensorData::from_le_bytes(DType::F32, &bytes[..3]).is_err());
    }

    #[test]
    fn test_from_i64_saturates() {
        let data = TensorData::from_i64(DType::I8, [-300, 5, 300]);
        assert_eq!(data.to_i64_vec(), vec![-128, 5, 127]);
    }
}
