//! Range observers and the fake-quantization state they feed.

use log::warn;
use qlite_kernels::kernels::quant::{self as qk, choose_qparams};
use qlite_kernels::QRange;
use serde::{Deserialize, Serialize};

use super::config::QuantSpec;
use crate::error::Result;
use crate::ir::QuantParams;
use crate::tensor::HostTensor;

/// How an observer folds a new batch into its running range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ObserverKind {
    /// Running minimum / maximum over everything seen.
    MinMax,
    /// Exponential moving average of per-batch extremes.
    MovingAverageMinMax { averaging_constant: f32 },
}

impl Default for ObserverKind {
    fn default() -> Self {
        ObserverKind::MovingAverageMinMax {
            averaging_constant: 0.01,
        }
    }
}

/// Observed range, one entry per channel (or a single entry per tensor).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Observer {
    pub min: Vec<f32>,
    pub max: Vec<f32>,
}

impl Observer {
    pub fn is_calibrated(&self) -> bool {
        !self.min.is_empty()
    }

    /// Fold one batch into the running range.
    pub fn update(&mut self, kind: ObserverKind, t: &HostTensor, axis: Option<usize>) -> Result<()> {
        let values = t.as_f32()?;
        if values.is_empty() {
            return Ok(());
        }
        let batch: Vec<(f32, f32)> = match axis {
            Some(axis) if axis < t.rank() => qk::channel_min_max(values, &t.shape, axis),
            _ => {
                let lo = values.iter().copied().fold(f32::INFINITY, f32::min);
                let hi = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                vec![(lo, hi)]
            }
        };
        if !self.is_calibrated() || self.min.len() != batch.len() {
            self.min = batch.iter().map(|b| b.0).collect();
            self.max = batch.iter().map(|b| b.1).collect();
            return Ok(());
        }
        for (i, (lo, hi)) in batch.into_iter().enumerate() {
            match kind {
                ObserverKind::MinMax => {
                    self.min[i] = self.min[i].min(lo);
                    self.max[i] = self.max[i].max(hi);
                }
                ObserverKind::MovingAverageMinMax { averaging_constant: c } => {
                    self.min[i] += c * (lo - self.min[i]);
                    self.max[i] += c * (hi - self.max[i]);
                }
            }
        }
        Ok(())
    }

    /// Scale / zero point for the observed range.
    ///
    /// An observer that never saw data yields `scale = 1, zero_point = 0`.
    pub fn qparams(&self, spec: &QuantSpec) -> QuantParams {
        let range = spec.qrange();
        if !self.is_calibrated() {
            warn!("uncalibrated observer, falling back to scale 1.0 / zero point 0");
            return QuantParams::per_tensor(1.0, if range == QRange::UINT8 { 128 } else { 0 });
        }
        let (scales, zero_points): (Vec<f32>, Vec<i64>) = self
            .min
            .iter()
            .zip(&self.max)
            .map(|(&lo, &hi)| choose_qparams(lo, hi, range, spec.symmetric))
            .unzip();
        if self.min.len() > 1 {
            QuantParams::per_channel(scales, zero_points, 0)
        } else {
            QuantParams::per_tensor(scales[0], zero_points[0])
        }
    }
}

/// Observer state plus the quantization it simulates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FakeQuant {
    pub spec: QuantSpec,
    pub observer: Observer,
    /// Fixed output parameters for ops with a prescribed range (sigmoid, tanh, softmax).
    #[serde(default)]
    pub fixed: Option<(f32, i64)>,
}

impl FakeQuant {
    pub fn new(spec: QuantSpec) -> Self {
        Self {
            spec,
            observer: Observer::default(),
            fixed: None,
        }
    }

    pub fn with_fixed(spec: QuantSpec, scale: f32, zero_point: i64) -> Self {
        Self {
            spec,
            observer: Observer::default(),
            fixed: Some((scale, zero_point)),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.fixed.is_some() || self.observer.is_calibrated()
    }

    pub fn qparams(&self) -> QuantParams {
        match self.fixed {
            Some((scale, zero_point)) => QuantParams::per_tensor(scale, zero_point),
            None => self.observer.qparams(&self.spec),
        }
    }

    /// Observe `t` (per channel on axis 0 when the spec asks for it).
    pub fn observe(&mut self, t: &HostTensor) -> Result<()> {
        let axis = self.spec.per_channel.then_some(0);
        self.observer.update(self.spec.observer, t, axis)
    }

    /// Simulate quantization of `t` with the current parameters.
    pub fn apply(&self, t: &HostTensor) -> Result<HostTensor> {
        let params = self.qparams();
        let q = params.quantize(t, self.spec.dtype, self.spec.rounding)?;
        params.dequantize(&q)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tensor(values: Vec<f32>) -> HostTensor {
        HostTensor::new(vec![values.len()], values).unwrap()
    }

    #[test]
    fn test_first_batch_sets_range() {
        let mut obs = Observer::default();
        obs.update(ObserverKind::default(), &tensor(vec![-1.0, 3.0]), None)
            .unwrap();
        assert_eq!((obs.min.clone(), obs.max.clone()), (vec![-1.0], vec![3.0]));
    }

    #[test]
    fn test_moving_average_update() {
        let kind = ObserverKind::MovingAverageMinMax {
            averaging_constant: 0.5,
        };
        let mut obs = Observer::default();
        obs.update(kind, &tensor(vec![0.0, 2.0]), None).unwrap();
        obs.update(kind, &tensor(vec![-2.0, 4.0]), None).unwrap();
        assert_eq!(obs.min, vec![-1.0]);
        assert_eq!(obs.max, vec![3.0]);
    }

    #[test]
    fn test_min_max_keeps_extremes() {
        let mut obs = Observer::default();
        obs.update(ObserverKind::MinMax, &tensor(vec![0.0, 2.0]), None)
            .unwrap();
        obs.update(ObserverKind::MinMax, &tensor(vec![1.0, 1.5]), None)
            .unwrap();
        assert_eq!(obs.max, vec![2.0]);
    }

    #[test]
    fn test_uncalibrated_qparams_default() {
        let q = Observer::default().qparams(&QuantSpec::activation());
        assert_eq!(q, QuantParams::per_tensor(1.0, 0));
    }

    #[test]
    fn test_per_channel_weight_params() {
        let w = HostTensor::new(vec![2, 2], vec![1.0, -0.5, 0.25, 0.1]).unwrap();
        let mut fq = FakeQuant::new(QuantSpec::weight(true));
        fq.observe(&w).unwrap();
        let q = fq.qparams();
        assert_eq!(q.axis, Some(0));
        assert_eq!(q.zero_point, vec![0, 0]);
        assert!((q.scale[0] - 1.0 / 127.0).abs() < 1e-7);
        assert!((q.scale[1] - 0.25 / 127.0).abs() < 1e-7);
    }
}
