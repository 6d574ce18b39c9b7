//! # Noise Schedule
//!
//! The per-step betas of a diffusion process and their cumulative retained
//! signal fractions `alpha_bar[t] = prod_{s <= t} (1 - beta[s])`.
use std::path::Path;

use serde::{Deserialize, Serialize};
use tch::{Device, Kind, Tensor};
use tracing::debug;

use crate::error::{DiffusionError, Result};
use crate::utils::ensure_device;

/// The plain arrays a training checkpoint stores for its schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoiseScheduleConfig {
    pub steps: usize,
    pub betas: Vec<f64>,
    pub alpha_bars: Vec<f64>,
}

/// A validated noise schedule bound to a device.
///
/// Invariants, checked by every constructor:
/// - `betas` and `alpha_bars` both hold exactly `steps` values,
/// - every `alpha_bar` lies in `(0, 1]` and the sequence never increases,
/// - `alpha_bars[t] < 1` for `t >= 1`.
#[derive(Debug)]
pub struct NoiseSchedule {
    steps: usize,
    betas: Tensor,
    alpha_bars: Tensor,
    // host copy, used for scalar lookups without a device round trip
    alpha_bars_host: Vec<f64>,
    device: Device,
}

impl Clone for NoiseSchedule {
    fn clone(&self) -> Self {
        Self {
            steps: self.steps,
            betas: self.betas.shallow_clone(),
            alpha_bars: self.alpha_bars.shallow_clone(),
            alpha_bars_host: self.alpha_bars_host.clone(),
            device: self.device,
        }
    }
}

impl NoiseSchedule {
    /// Builds a schedule from its betas, accumulating `1 - beta` in double
    /// precision.
    pub fn from_betas(betas: Tensor) -> Result<Self> {
        let betas = betas.to_kind(Kind::Double);
        let steps = betas.size1()? as usize;
        let alphas: Tensor = 1.0 - &betas;
        let alpha_bars = alphas.cumprod(0, Kind::Double);
        Self::from_tensors(steps, &betas, &alpha_bars)
    }

    /// Rebuilds a schedule from already computed arrays, e.g. the ones stored
    /// alongside a trained model. The tensors stay on their device.
    pub fn from_tensors(steps: usize, betas: &Tensor, alpha_bars: &Tensor) -> Result<Self> {
        if steps == 0 {
            return Err(DiffusionError::config("a noise schedule needs at least one step"));
        }
        for (name, t) in [("betas", betas), ("alpha_bars", alpha_bars)] {
            if t.size() != [steps as i64] {
                return Err(DiffusionError::config(format!(
                    "{name} must have shape [{steps}], got {:?}",
                    t.size()
                )));
            }
        }
        ensure_device(alpha_bars.device(), betas.device())?;
        let device = alpha_bars.device();
        let alpha_bars_host =
            Vec::<f64>::try_from(alpha_bars.to_kind(Kind::Double).to_device(Device::Cpu))?;
        validate_alpha_bars(&alpha_bars_host)?;
        debug!(
            steps,
            first = alpha_bars_host[0],
            last = alpha_bars_host[steps - 1],
            ?device,
            "noise schedule"
        );
        Ok(Self {
            steps,
            betas: betas.to_kind(Kind::Float),
            alpha_bars: alpha_bars.to_kind(Kind::Float),
            alpha_bars_host,
            device,
        })
    }

    pub fn from_config(config: &NoiseScheduleConfig) -> Result<Self> {
        Self::from_tensors(
            config.steps,
            &Tensor::from_slice(&config.betas),
            &Tensor::from_slice(&config.alpha_bars),
        )
    }

    /// Reads the `betas` and `alpha_bars` tensors from a safetensors file.
    pub fn from_safetensors<P: AsRef<Path>>(path: P) -> Result<Self> {
        let tensors = Tensor::read_safetensors(path)?;
        let find = |name: &str| {
            tensors
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, t)| t.shallow_clone())
                .ok_or_else(|| DiffusionError::config(format!("tensor `{name}` not found")))
        };
        let betas = find("betas")?;
        let alpha_bars = find("alpha_bars")?;
        let steps = alpha_bars.size1()? as usize;
        Self::from_tensors(steps, &betas, &alpha_bars)
    }

    /// The arrays needed to rebuild this schedule with [`NoiseSchedule::from_config`].
    pub fn to_config(&self) -> Result<NoiseScheduleConfig> {
        let betas =
            Vec::<f64>::try_from(self.betas.to_kind(Kind::Double).to_device(Device::Cpu))?;
        Ok(NoiseScheduleConfig {
            steps: self.steps,
            betas,
            alpha_bars: self.alpha_bars_host.clone(),
        })
    }

    /// Returns an equivalent schedule living on `device`.
    pub fn to(&self, device: Device) -> Self {
        Self {
            steps: self.steps,
            betas: self.betas.to_device(device),
            alpha_bars: self.alpha_bars.to_device(device),
            alpha_bars_host: self.alpha_bars_host.clone(),
            device,
        }
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn betas(&self) -> &Tensor {
        &self.betas
    }

    pub fn alpha_bars(&self) -> &Tensor {
        &self.alpha_bars
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn alpha_bar(&self, t: usize) -> Option<f64> {
        self.alpha_bars_host.get(t).copied()
    }

    /// Gathers `alpha_bar[t]` for every index of the one dimensional
    /// `timesteps` tensor.
    pub fn gather(&self, timesteps: &Tensor) -> Result<Tensor> {
        ensure_device(self.device, timesteps.device())?;
        let timesteps = timesteps.to_kind(Kind::Int64);
        if timesteps.dim() != 1 {
            return Err(DiffusionError::config(format!(
                "timesteps must be one dimensional, got shape {:?}",
                timesteps.size()
            )));
        }
        if timesteps.numel() > 0 {
            let lo = timesteps.min().f_int64_value(&[])?;
            let hi = timesteps.max().f_int64_value(&[])?;
            if lo < 0 || hi >= self.steps as i64 {
                return Err(DiffusionError::config(format!(
                    "timesteps must lie in [0, {}), got values in [{lo}, {hi}]",
                    self.steps
                )));
            }
        }
        Ok(self.alpha_bars.gather(0, &timesteps, false))
    }
}

fn validate_alpha_bars(alpha_bars: &[f64]) -> Result<()> {
    for (t, &ab) in alpha_bars.iter().enumerate() {
        if !(ab > 0. && ab <= 1.) {
            return Err(DiffusionError::config(format!(
                "alpha_bars[{t}] = {ab} is outside (0, 1]"
            )));
        }
        // 1 - alpha_bar is a divisor at every index a reverse step starts from
        if t > 0 && ab >= 1. {
            return Err(DiffusionError::config(format!(
                "alpha_bars[{t}] must be strictly below 1"
            )));
        }
        if t > 0 && ab > alpha_bars[t - 1] {
            return Err(DiffusionError::config(format!(
                "alpha_bars must be non-increasing, alpha_bars[{t}] = {ab} > alpha_bars[{}] = {}",
                t - 1,
                alpha_bars[t - 1]
            )));
        }
    }
    Ok(())
}
