//! Host reference kernels.
//!
//! - `naive`: spatial and dense operators on NCHW buffers.
//! - `quant`: affine quantization arithmetic.
//! - Root module: broadcasting element-wise operators.

pub mod naive;
pub mod quant;

// ============================================================================
// Broadcasting
// ============================================================================

/// Numpy-style broadcast of two shapes, or `None` if they are incompatible.
pub fn broadcast_shape(a: &[usize], b: &[usize]) -> Option<Vec<usize>> {
    let rank = a.len().max(b.len());
    let mut out = vec![0; rank];
    for i in 0..rank {
        let da = if i + a.len() >= rank { a[i + a.len() - rank] } else { 1 };
        let db = if i + b.len() >= rank { b[i + b.len() - rank] } else { 1 };
        out[i] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => return None,
        };
    }
    Some(out)
}

/// Strides for reading a buffer of `shape` as if it had `target` shape.
/// Broadcast axes get stride 0.
fn broadcast_strides(shape: &[usize], target: &[usize]) -> Vec<usize> {
    let own = naive::strides(shape);
    let offset = target.len() - shape.len();
    (0..target.len())
        .map(|i| {
            if i < offset || shape[i - offset] == 1 {
                0
            } else {
                own[i - offset]
            }
        })
        .collect()
}

// ============================================================================
// Element-wise operators
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Maximum,
    Minimum,
}

impl BinaryOp {
    #[inline]
    pub fn apply(self, a: f32, b: f32) -> f32 {
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
            BinaryOp::Maximum => a.max(b),
            BinaryOp::Minimum => a.min(b),
        }
    }
}

/// Broadcasting binary op. `output` must hold `broadcast_shape(a, b)` elements.
pub fn binary(
    op: BinaryOp,
    a: &[f32],
    a_shape: &[usize],
    b: &[f32],
    b_shape: &[usize],
    output: &mut [f32],
    output_shape: &[usize],
) {
    // Fast path: identical shapes.
    if a_shape == b_shape {
        for ((o, &x), &y) in output.iter_mut().zip(a).zip(b) {
            *o = op.apply(x, y);
        }
        return;
    }
    let sa = broadcast_strides(a_shape, output_shape);
    let sb = broadcast_strides(b_shape, output_shape);
    let mut index = vec![0usize; output_shape.len()];
    for o in output.iter_mut() {
        let ia: usize = index.iter().zip(&sa).map(|(i, s)| i * s).sum();
        let ib: usize = index.iter().zip(&sb).map(|(i, s)| i * s).sum();
        *o = op.apply(a[ia], b[ib]);
        for axis in (0..index.len()).rev() {
            index[axis] += 1;
            if index[axis] < output_shape[axis] {
                break;
            }
            index[axis] = 0;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UnaryOp {
    Relu,
    Relu6,
    Clamp { min: f32, max: f32 },
    Sigmoid,
    Tanh,
    Hardswish,
    Identity,
}

impl UnaryOp {
    #[inline]
    pub fn apply(self, x: f32) -> f32 {
        match self {
            UnaryOp::Relu => x.max(0.0),
            UnaryOp::Relu6 => x.clamp(0.0, 6.0),
            UnaryOp::Clamp { min, max } => x.clamp(min, max),
            UnaryOp::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            UnaryOp::Tanh => x.tanh(),
            UnaryOp::Hardswish => x * (x + 3.0).clamp(0.0, 6.0) / 6.0,
            UnaryOp::Identity => x,
        }
    }
}

/// Element-wise unary op, in place.
pub fn unary(op: UnaryOp, data: &mut [f32]) {
    for x in data.iter_mut() {
        *x = op.apply(*x);
    }
}

/// Element-wise ReLU: x = max(0, x)
pub fn relu(data: &mut [f32]) {
    unary(UnaryOp::Relu, data);
}

/// Add bias along axis 1 of an `[N, C, inner]` buffer.
pub fn bias_add_channels(data: &mut [f32], bias: &[f32], batch: usize, inner: usize) {
    let channels = bias.len();
    for b in 0..batch {
        for (c, &v) in bias.iter().enumerate() {
            let base = (b * channels + c) * inner;
            for x in &mut data[base..base + inner] {
                *x += v;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_shape() {
        assert_eq!(broadcast_shape(&[1, 3, 4, 4], &[3, 1, 1]), Some(vec![1, 3, 4, 4]));
        assert_eq!(broadcast_shape(&[2, 3], &[]), Some(vec![2, 3]));
        assert_eq!(broadcast_shape(&[2, 3], &[4]), None);
    }

    #[test]
    fn test_binary_broadcast_channel_bias() {
        let a = [1.0f32, 1.0, 1.0, 1.0];
        let b = [10.0f32, 20.0];
        let mut out = [0.0f32; 4];
        binary(BinaryOp::Add, &a, &[1, 2, 2], &b, &[2, 1], &mut out, &[1, 2, 2]);
        assert_eq!(out, [11.0, 11.0, 21.0, 21.0]);
    }

    #[test]
    fn test_binary_scalar_rhs() {
        let a = [4.0f32, -2.0];
        let mut out = [0.0f32; 2];
        binary(BinaryOp::Div, &a, &[2], &[2.0], &[], &mut out, &[2]);
        assert_eq!(out, [2.0, -1.0]);
    }

    #[test]
    fn test_unary_activations() {
        let mut data = [-1.0f32, 0.5, 7.0];
        unary(UnaryOp::Relu6, &mut data);
        assert_eq!(data, [0.0, 0.5, 6.0]);
        assert_eq!(UnaryOp::Hardswish.apply(3.0), 3.0);
        assert_eq!(UnaryOp::Hardswish.apply(-3.0), 0.0);
        assert!((UnaryOp::Sigmoid.apply(0.0) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_bias_add_channels() {
        let mut data = [0.0f32; 4];
        bias_add_channels(&mut data, &[1.0, 2.0], 1, 2);
        assert_eq!(data, [1.0, 1.0, 2.0, 2.0]);
    }
}
