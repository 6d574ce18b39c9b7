//! # Step Subsampling
//!
//! Picks the short, ordered subset of schedule indices a DDIM sampler visits.
use serde::{Deserialize, Serialize};
use tch::{Device, Kind, Tensor};

use super::types::Timestep;
use crate::error::{DiffusionError, Result};

/// How the subsampled indices are spread over `[0, T)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DenoisingMode {
    /// Evenly spaced with stride `T / S`.
    Linear,
    /// Squares of evenly spaced values in `[0, sqrt(0.8 * T)]`: dense near the
    /// low noise end, sparse near the high noise end.
    #[default]
    Quadratic,
}

/// The `(current, previous)` index pairs a sampler walks through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubsampledSchedule {
    time_steps: Vec<i64>,
    time_steps_prev: Vec<i64>,
}

impl SubsampledSchedule {
    pub fn build(total_steps: usize, number_of_steps: usize, mode: DenoisingMode) -> Result<Self> {
        if number_of_steps == 0 || number_of_steps >= total_steps {
            return Err(DiffusionError::config(format!(
                "number of denoising steps must lie in [1, {total_steps}), got {number_of_steps}"
            )));
        }
        let raw: Vec<i64> = match mode {
            DenoisingMode::Linear => {
                let stride = total_steps / number_of_steps;
                (0..number_of_steps).map(|i| (i * stride) as i64).collect()
            }
            DenoisingMode::Quadratic => {
                linspace(0., (total_steps as f64 * 0.8).sqrt(), number_of_steps)
                    .into_iter()
                    .map(|v| v.powi(2) as i64)
                    .collect()
            }
        };
        if let Some(k) = raw.windows(2).position(|w| w[0] >= w[1]) {
            return Err(DiffusionError::config(format!(
                "{number_of_steps} {mode:?} steps over {total_steps} schedule steps repeat index {} at position {}",
                raw[k],
                k + 1
            )));
        }
        let time_steps: Vec<i64> = raw.iter().map(|t| t + 1).collect();
        if let Some(&last) = time_steps.last() {
            if last >= total_steps as i64 {
                return Err(DiffusionError::config(format!(
                    "step {last} falls outside a schedule of {total_steps} steps"
                )));
            }
        }
        let mut time_steps_prev = Vec::with_capacity(number_of_steps);
        time_steps_prev.push(0);
        time_steps_prev.extend_from_slice(&raw[..number_of_steps - 1]);
        Ok(Self { time_steps, time_steps_prev })
    }

    pub fn len(&self) -> usize {
        self.time_steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time_steps.is_empty()
    }

    pub fn time_steps(&self) -> &[i64] {
        &self.time_steps
    }

    pub fn time_steps_prev(&self) -> &[i64] {
        &self.time_steps_prev
    }

    /// Step indices in the order the reverse process visits them, most noisy
    /// first.
    pub fn steps(&self) -> Vec<usize> {
        (0..self.len()).rev().collect()
    }

    /// Broadcasts the pair at `idx` over a batch of `number_of_images`.
    pub fn timestep(&self, number_of_images: i64, idx: usize, device: Device) -> Result<Timestep> {
        let (current, previous) = match (self.time_steps.get(idx), self.time_steps_prev.get(idx)) {
            (Some(&current), Some(&previous)) => (current, previous),
            _ => {
                return Err(DiffusionError::config(format!(
                    "step index {idx} out of range for {} steps",
                    self.len()
                )))
            }
        };
        let options = (Kind::Int64, device);
        Ok(Timestep {
            current: Tensor::full([number_of_images], current, options),
            previous: Tensor::full([number_of_images], previous, options),
        })
    }
}

// Endpoint inclusive, last value pinned to `stop`. Quadratic indices floor
// the squares, so the endpoint must come out exact: `Tensor::linspace`
// interpolates from both ends and does not guarantee it.
fn linspace(start: f64, stop: f64, num: usize) -> Vec<f64> {
    if num == 1 {
        return vec![start];
    }
    let step = (stop - start) / (num - 1) as f64;
    let mut values: Vec<f64> = (0..num).map(|i| start + i as f64 * step).collect();
    values[num - 1] = stop;
    values
}
