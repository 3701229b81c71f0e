//! Affine quantization arithmetic.
//!
//! `q = clamp(round(x / scale) + zero_point, qmin, qmax)` and
//! `x' = (q - zero_point) * scale`.

/// Rounding rule applied when mapping real values to the integer grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rounding {
    /// Ties round to the nearest even integer.
    #[default]
    HalfToEven,
    /// Ties round away from zero.
    HalfAwayFromZero,
}

impl Rounding {
    #[inline]
    pub fn round(self, x: f32) -> f32 {
        match self {
            Rounding::HalfToEven => x.round_ties_even(),
            Rounding::HalfAwayFromZero => x.round(),
        }
    }
}

/// Integer grid of a quantized type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QRange {
    pub min: i64,
    pub max: i64,
}

impl QRange {
    pub const INT8: QRange = QRange { min: -128, max: 127 };
    pub const INT8_SYMMETRIC: QRange = QRange { min: -127, max: 127 };
    pub const INT8_REDUCED: QRange = QRange { min: -64, max: 63 };
    pub const UINT8: QRange = QRange { min: 0, max: 255 };
    pub const INT32: QRange = QRange {
        min: i32::MIN as i64,
        max: i32::MAX as i64,
    };

    #[inline]
    pub fn clamp(self, q: i64) -> i64 {
        q.clamp(self.min, self.max)
    }

    pub fn levels(self) -> f32 {
        (self.max - self.min) as f32
    }
}

/// Scale and zero point covering `[min, max]`, widened to include zero.
///
/// Symmetric parameters center the grid on zero (`zero_point = 0` for
/// signed ranges) and size it by `max(|min|, |max|)`.
pub fn choose_qparams(min: f32, max: f32, range: QRange, symmetric: bool) -> (f32, i64) {
    let min = min.min(0.0);
    let max = max.max(0.0);
    if symmetric {
        let bound = min.abs().max(max);
        let half = (range.max - range.min) as f32 / 2.0;
        let scale = (bound / half).max(f32::EPSILON);
        let zero_point = if range.min < 0 {
            0
        } else {
            (range.min + range.max + 1) / 2
        };
        return (scale, zero_point);
    }
    let scale = ((max - min) / range.levels()).max(f32::EPSILON);
    let zero_point = range.clamp(range.min - (min / scale).round() as i64);
    (scale, zero_point)
}

#[inline]
pub fn quantize_value(x: f32, scale: f32, zero_point: i64, range: QRange, rounding: Rounding) -> i64 {
    range.clamp(rounding.round(x / scale) as i64 + zero_point)
}

#[inline]
pub fn dequantize_value(q: i64, scale: f32, zero_point: i64) -> f32 {
    (q - zero_point) as f32 * scale
}

/// Simulated quantization of a whole buffer with one scale/zero point.
pub fn fake_quantize(data: &mut [f32], scale: f32, zero_point: i64, range: QRange, rounding: Rounding) {
    for x in data.iter_mut() {
        let q = quantize_value(*x, scale, zero_point, range, rounding);
        *x = dequantize_value(q, scale, zero_point);
    }
}

/// Per-channel simulated quantization along `axis` of `shape`.
pub fn fake_quantize_per_channel(
    data: &mut [f32],
    shape: &[usize],
    axis: usize,
    scales: &[f32],
    zero_points: &[i64],
    range: QRange,
    rounding: Rounding,
) {
    let inner: usize = shape[axis + 1..].iter().product();
    let channels = shape[axis];
    for (i, x) in data.iter_mut().enumerate() {
        let c = (i / inner) % channels;
        let q = quantize_value(*x, scales[c], zero_points[c], range, rounding);
        *x = dequantize_value(q, scales[c], zero_points[c]);
    }
}

/// Minimum and maximum of each slice along `axis`.
pub fn channel_min_max(data: &[f32], shape: &[usize], axis: usize) -> Vec<(f32, f32)> {
    let inner: usize = shape[axis + 1..].iter().product();
    let channels = shape[axis];
    let mut out = vec![(f32::INFINITY, f32::NEG_INFINITY); channels];
    for (i, &x) in data.iter().enumerate() {
        let c = (i / inner) % channels;
        out[c].0 = out[c].0.min(x);
        out[c].1 = out[c].1.max(x);
    }
    out
}
