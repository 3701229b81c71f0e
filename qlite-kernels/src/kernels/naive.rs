//! Naive reference implementations - correct but slow.
//!
//! Everything here works on channel-first (NCHW) float buffers. Callers that
//! hold channel-last data permute around these kernels.

/// Convolution geometry shared by conv and pooling kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub kernel: [usize; 2],
    pub stride: [usize; 2],
    /// Zero padding applied on both sides of each spatial axis.
    pub padding: [usize; 2],
    pub dilation: [usize; 2],
}

impl Window {
    pub fn new(kernel: [usize; 2], stride: [usize; 2], padding: [usize; 2]) -> Self {
        Self {
            kernel,
            stride,
            padding,
            dilation: [1, 1],
        }
    }

    /// Effective kernel extent once dilation is applied.
    pub fn extent(&self) -> [usize; 2] {
        [
            self.dilation[0] * (self.kernel[0] - 1) + 1,
            self.dilation[1] * (self.kernel[1] - 1) + 1,
        ]
    }

    /// Output spatial size for an input of `[h, w]`, or `None` when the
    /// window does not fit.
    pub fn output_hw(&self, h: usize, w: usize, ceil_mode: bool) -> Option<[usize; 2]> {
        let [eh, ew] = self.extent();
        let [sh, sw] = self.stride;
        let [ph, pw] = self.padding;
        if sh == 0 || sw == 0 || h + 2 * ph < eh || w + 2 * pw < ew {
            return None;
        }
        let span_h = h + 2 * ph - eh;
        let span_w = w + 2 * pw - ew;
        let (mut oh, mut ow) = if ceil_mode {
            (span_h.div_ceil(sh) + 1, span_w.div_ceil(sw) + 1)
        } else {
            (span_h / sh + 1, span_w / sw + 1)
        };
        // The last window must start inside the (left-padded) input.
        if ceil_mode {
            if (oh - 1) * sh >= h + ph {
                oh -= 1;
            }
            if (ow - 1) * sw >= w + pw {
                ow -= 1;
            }
        }
        Some([oh, ow])
    }
}

/// 2D Convolution (NCHW, naive) with grouping, padding and dilation.
///
/// - `input`:  [N, Ci, H, W]
/// - `filter`: [Co, Ci / groups, Kh, Kw]
/// - `bias`:   [Co]
/// - `output`: [N, Co, Ho, Wo]
#[allow(clippy::too_many_arguments)]
pub fn conv2d(
    input: &[f32],
    input_shape: [usize; 4],
    filter: &[f32],
    filter_shape: [usize; 4],
    bias: Option<&[f32]>,
    window: &Window,
    groups: usize,
    output: &mut [f32],
    output_shape: [usize; 4],
) {
    let [n, ci, h, w] = input_shape;
    let [co, ci_g, kh, kw] = filter_shape;
    let [_, _, ho, wo] = output_shape;
    let [sh, sw] = window.stride;
    let [pad_h, pad_w] = window.padding;
    let [dh, dw] = window.dilation;
    let co_g = co / groups;

    for batch in 0..n {
        for oc in 0..co {
            let g = oc / co_g;
            for oy in 0..ho {
                for ox in 0..wo {
                    let mut sum = bias.map_or(0.0, |b| b[oc]);
                    for icg in 0..ci_g {
                        let ic = g * ci_g + icg;
                        for ky in 0..kh {
                            // Position in the padded input; padding reads as 0.
                            let iy_padded = oy * sh + ky * dh;
                            if iy_padded < pad_h || iy_padded - pad_h >= h {
                                continue;
                            }
                            let iy = iy_padded - pad_h;
                            for kx in 0..kw {
                                let ix_padded = ox * sw + kx * dw;
                                if ix_padded < pad_w || ix_padded - pad_w >= w {
                                    continue;
                                }
                                let ix = ix_padded - pad_w;
                                let in_idx = ((batch * ci + ic) * h + iy) * w + ix;
                                let f_idx = ((oc * ci_g + icg) * kh + ky) * kw + kx;
                                sum += input[in_idx] * filter[f_idx];
                            }
                        }
                    }
                    output[((batch * co + oc) * ho + oy) * wo + ox] = sum;
                }
            }
        }
    }
}

/// 2D Max Pooling (NCHW, naive). Padding never wins the max.
///
/// - `input`:  [N, C, H, W]
/// - `output`: [N, C, Ho, Wo]
pub fn max_pool2d(
    input: &[f32],
    input_shape: [usize; 4],
    window: &Window,
    output: &mut [f32],
    output_shape: [usize; 4],
) {
    pool2d(input, input_shape, window, output, output_shape, |values, _| {
        values.iter().copied().fold(f32::NEG_INFINITY, f32::max)
    });
}

/// 2D Average Pooling (NCHW, naive).
///
/// With `count_include_pad` the divisor is the full window area clipped to
/// the padded input, otherwise only the in-bounds elements are counted.
pub fn avg_pool2d(
    input: &[f32],
    input_shape: [usize; 4],
    window: &Window,
    count_include_pad: bool,
    output: &mut [f32],
    output_shape: [usize; 4],
) {
    pool2d(input, input_shape, window, output, output_shape, |values, padded| {
        let divisor = if count_include_pad {
            padded
        } else {
            values.len()
        };
        if divisor == 0 {
            0.0
        } else {
            values.iter().sum::<f32>() / divisor as f32
        }
    });
}

fn pool2d(
    input: &[f32],
    input_shape: [usize; 4],
    window: &Window,
    output: &mut [f32],
    output_shape: [usize; 4],
    reduce: impl Fn(&[f32], usize) -> f32,
) {
    let [n, c, h, w] = input_shape;
    let [_, _, ho, wo] = output_shape;
    let [kh, kw] = window.kernel;
    let [sh, sw] = window.stride;
    let [pad_h, pad_w] = window.padding;
    let [dh, dw] = window.dilation;
    let mut values = Vec::with_capacity(kh * kw);

    for plane in 0..n * c {
        for oy in 0..ho {
            for ox in 0..wo {
                values.clear();
                let mut padded = 0;
                for ky in 0..kh {
                    let iy_padded = oy * sh + ky * dh;
                    if iy_padded >= h + 2 * pad_h {
                        continue;
                    }
                    for kx in 0..kw {
                        let ix_padded = ox * sw + kx * dw;
                        if ix_padded >= w + 2 * pad_w {
                            continue;
                        }
                        padded += 1;
                        if iy_padded < pad_h
                            || ix_padded < pad_w
                            || iy_padded - pad_h >= h
                            || ix_padded - pad_w >= w
                        {
                            continue;
                        }
                        let iy = iy_padded - pad_h;
                        let ix = ix_padded - pad_w;
                        values.push(input[(plane * h + iy) * w + ix]);
                    }
                }
                output[(plane * ho + oy) * wo + ox] = reduce(&values, padded);
            }
        }
    }
}

/// Fully Connected (naive), applied row by row.
///
/// - `input`:   [rows, in_features]
/// - `weights`: [out_features, in_features]
/// - `bias`:    [out_features]
/// - `output`:  [rows, out_features]
pub fn fully_connected(
    input: &[f32],
    rows: usize,
    in_features: usize,
    weights: &[f32],
    bias: Option<&[f32]>,
    output: &mut [f32],
    out_features: usize,
) {
    for r in 0..rows {
        let x = &input[r * in_features..(r + 1) * in_features];
        for o in 0..out_features {
            let mut sum = bias.map_or(0.0, |b| b[o]);
            let row = &weights[o * in_features..(o + 1) * in_features];
            for i in 0..in_features {
                sum += x[i] * row[i];
            }
            output[r * out_features + o] = sum;
        }
    }
}

/// Inference-mode batch normalization over axis 1 of an `[N, C, ...]` buffer.
#[allow(clippy::too_many_arguments)]
pub fn batch_norm(
    input: &[f32],
    batch: usize,
    channels: usize,
    inner: usize,
    mean: &[f32],
    var: &[f32],
    gamma: &[f32],
    beta: &[f32],
    eps: f32,
    output: &mut [f32],
) {
    for b in 0..batch {
        for c in 0..channels {
            let scale = gamma[c] / (var[c] + eps).sqrt();
            let shift = beta[c] - mean[c] * scale;
            let base = (b * channels + c) * inner;
            for i in base..base + inner {
                output[i] = input[i] * scale + shift;
            }
        }
    }
}

/// Softmax along an axis of length `axis_len`, viewed as `[outer, axis_len, inner]`.
pub fn softmax(input: &[f32], outer: usize, axis_len: usize, inner: usize, output: &mut [f32]) {
    for o in 0..outer {
        for i in 0..inner {
            let at = |k: usize| (o * axis_len + k) * inner + i;
            let max = (0..axis_len)
                .map(|k| input[at(k)])
                .fold(f32::NEG_INFINITY, f32::max);
            let mut denom = 0.0;
            for k in 0..axis_len {
                let e = (input[at(k)] - max).exp();
                output[at(k)] = e;
                denom += e;
            }
            for k in 0..axis_len {
                output[at(k)] /= denom;
            }
        }
    }
}

/// Row-major strides of `shape`.
pub fn strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

/// Permute axes: `output` has shape `shape[perm[i]]` along axis `i`.
pub fn permute<T: Copy>(input: &[T], shape: &[usize], perm: &[usize], output: &mut [T]) {
    let in_strides = strides(shape);
    let out_shape: Vec<usize> = perm.iter().map(|&p| shape[p]).collect();
    let mut index = vec![0usize; out_shape.len()];
    for out in output.iter_mut() {
        let src: usize = index
            .iter()
            .zip(perm)
            .map(|(&i, &p)| i * in_strides[p])
            .sum();
        *out = input[src];
        // Advance the output multi-index (row-major).
        for axis in (0..index.len()).rev() {
            index[axis] += 1;
            if index[axis] < out_shape[axis] {
                break;
            }
            index[axis] = 0;
        }
    }
}

/// Constant padding: `pads[axis] = (before, after)`.
pub fn pad(input: &[f32], shape: &[usize], pads: &[[usize; 2]], value: f32, output: &mut [f32]) {
    let out_shape: Vec<usize> = shape
        .iter()
        .zip(pads)
        .map(|(&d, p)| d + p[0] + p[1])
        .collect();
    let out_strides = strides(&out_shape);
    output.fill(value);
    let mut index = vec![0usize; shape.len()];
    for &x in input {
        let dst: usize = index
            .iter()
            .zip(pads)
            .zip(&out_strides)
            .map(|((&i, p), &s)| (i + p[0]) * s)
            .sum();
        output[dst] = x;
        for axis in (0..index.len()).rev() {
            index[axis] += 1;
            if index[axis] < shape[axis] {
                break;
            }
            index[axis] = 0;
        }
    }
}

/// Mean over `axes`; the output keeps reduced axes as size 1.
pub fn reduce_mean(input: &[f32], shape: &[usize], axes: &[usize], output: &mut [f32]) {
    let out_shape: Vec<usize> = shape
        .iter()
        .enumerate()
        .map(|(i, &d)| if axes.contains(&i) { 1 } else { d })
        .collect();
    let out_strides = strides(&out_shape);
    let count: usize = axes.iter().map(|&a| shape[a]).product();
    output.fill(0.0);
    let mut index = vec![0usize; shape.len()];
    for &x in input {
        let dst: usize = index
            .iter()
            .enumerate()
            .map(|(i, &v)| if axes.contains(&i) { 0 } else { v * out_strides[i] })
            .sum();
        output[dst] += x;
        for axis in (0..index.len()).rev() {
            index[axis] += 1;
            if index[axis] < shape[axis] {
                break;
            }
            index[axis] = 0;
        }
    }
    if count > 0 {
        for v in output.iter_mut() {
            *v /= count as f32;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f32 = 1e-5;

    fn approx_eq(a: &[f32], b: &[f32]) -> bool {
        a.len() == b.len() && a.iter().zip(b).all(|(x, y)| (x - y).abs() <= EPS)
    }

    #[test]
    fn test_conv2d_identity_kernel() {
        let input: Vec<f32> = (0..9).map(|v| v as f32).collect();
        let filter = [1.0f32];
        let mut out = [0.0f32; 9];
        conv2d(
            &input,
            [1, 1, 3, 3],
            &filter,
            [1, 1, 1, 1],
            Some(&[0.5]),
            &Window::new([1, 1], [1, 1], [0, 0]),
            1,
            &mut out,
            [1, 1, 3, 3],
        );
        let expected: Vec<f32> = input.iter().map(|v| v + 0.5).collect();
        assert!(approx_eq(&out, &expected));
    }

    #[test]
    fn test_conv2d_padded_sum() {
        // 3x3 ones kernel over a 2x2 ones image with padding 1 counts neighbours.
        let input = [1.0f32; 4];
        let filter = [1.0f32; 9];
        let mut out = [0.0f32; 4];
        conv2d(
            &input,
            [1, 1, 2, 2],
            &filter,
            [1, 1, 3, 3],
            None,
            &Window::new([3, 3], [1, 1], [1, 1]),
            1,
            &mut out,
            [1, 1, 2, 2],
        );
        assert!(approx_eq(&out, &[4.0, 4.0, 4.0, 4.0]));
    }

    #[test]
    fn test_depthwise_conv_keeps_channels_apart() {
        let input = [1.0f32, 2.0, 3.0, 4.0, 10.0, 20.0, 30.0, 40.0];
        let filter = [1.0f32, -1.0];
        let mut out = [0.0f32; 8];
        conv2d(
            &input,
            [1, 2, 2, 2],
            &filter,
            [2, 1, 1, 1],
            None,
            &Window::new([1, 1], [1, 1], [0, 0]),
            2,
            &mut out,
            [1, 2, 2, 2],
        );
        assert!(approx_eq(
            &out,
            &[1.0, 2.0, 3.0, 4.0, -10.0, -20.0, -30.0, -40.0]
        ));
    }

    #[test]
    fn test_output_hw() {
        let w = Window::new([3, 3], [2, 2], [1, 1]);
        assert_eq!(w.output_hw(224, 224, false), Some([112, 112]));
        let w = Window::new([2, 2], [2, 2], [0, 0]);
        assert_eq!(w.output_hw(5, 5, false), Some([2, 2]));
        assert_eq!(w.output_hw(5, 5, true), Some([3, 3]));
        assert_eq!(w.output_hw(1, 1, false), None);
    }

    #[test]
    fn test_max_pool_2x2() {
        let input = [1.0f32, 5.0, 2.0, 0.0, 3.0, 4.0, 8.0, 7.0, 0.0, 0.0, 1.0, 1.0, 9.0, 0.0, 1.0, 2.0];
        let mut out = [0.0f32; 4];
        max_pool2d(
            &input,
            [1, 1, 4, 4],
            &Window::new([2, 2], [2, 2], [0, 0]),
            &mut out,
            [1, 1, 2, 2],
        );
        assert!(approx_eq(&out, &[5.0, 8.0, 9.0, 2.0]));
    }

    #[test]
    fn test_avg_pool_count_include_pad() {
        let input = [4.0f32; 4];
        let window = Window::new([2, 2], [2, 2], [1, 1]);
        let mut with_pad = [0.0f32; 4];
        avg_pool2d(&input, [1, 1, 2, 2], &window, true, &mut with_pad, [1, 1, 2, 2]);
        assert!(approx_eq(&with_pad, &[1.0, 1.0, 1.0, 1.0]));
        let mut without_pad = [0.0f32; 4];
        avg_pool2d(&input, [1, 1, 2, 2], &window, false, &mut without_pad, [1, 1, 2, 2]);
        assert!(approx_eq(&without_pad, &[4.0, 4.0, 4.0, 4.0]));
    }

    #[test]
    fn test_fully_connected_rows() {
        let input = [1.0f32, 2.0, 3.0, 4.0];
        let weights = [1.0f32, 0.0, 0.0, 1.0, 1.0, 1.0];
        let mut out = [0.0f32; 6];
        fully_connected(&input, 2, 2, &weights, Some(&[0.0, 0.0, 1.0]), &mut out, 3);
        assert!(approx_eq(&out, &[1.0, 2.0, 4.0, 3.0, 4.0, 8.0]));
    }

    #[test]
    fn test_permute_nchw_to_nhwc() {
        // [1, 2, 1, 3] -> [1, 1, 3, 2]
        let input = [0.0f32, 1.0, 2.0, 10.0, 11.0, 12.0];
        let mut out = [0.0f32; 6];
        permute(&input, &[1, 2, 1, 3], &[0, 2, 3, 1], &mut out);
        assert!(approx_eq(&out, &[0.0, 10.0, 1.0, 11.0, 2.0, 12.0]));
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let input = [1.0f32, 2.0, 3.0, 0.0, 0.0, 0.0];
        let mut out = [0.0f32; 6];
        softmax(&input, 2, 3, 1, &mut out);
        assert!((out[..3].iter().sum::<f32>() - 1.0).abs() < EPS);
        assert!(approx_eq(&out[3..], &[1.0 / 3.0; 3]));
    }

    #[test]
    fn test_reduce_mean_spatial() {
        let input = [1.0f32, 2.0, 3.0, 4.0, 10.0, 10.0, 10.0, 10.0];
        let mut out = [0.0f32; 2];
        reduce_mean(&input, &[1, 2, 2, 2], &[2, 3], &mut out);
        assert!(approx_eq(&out, &[2.5, 10.0]));
    }

    #[test]
    fn test_pad_border() {
        let mut out = [0.0f32; 9];
        pad(&[5.0], &[1, 1], &[[1, 1], [1, 1]], -1.0, &mut out[..]);
        assert_eq!(out[4], 5.0);
        assert_eq!(out.iter().filter(|&&v| v == -1.0).count(), 8);
    }
}
