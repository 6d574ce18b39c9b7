use std::fs;

use tch::{kind, Device, Tensor};

use serde::{Serialize, Deserialize};

use crate::error::Result;

pub use self::ddim::{Checkpoint, DdimDiffuser, DdimDiffuserConfig};
pub use self::noise_schedule::{NoiseSchedule, NoiseScheduleConfig};
pub use self::subsample::{DenoisingMode, SubsampledSchedule};
pub use self::types::{Diffuser, NoisePredictor, Timestep, Trajectory};

pub mod ddim;
pub mod noise_schedule;
pub mod subsample;
pub mod types;

/// This represents how beta ranges from its minimum value to the maximum
/// during training.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum BetaSchedule {
    /// Linear interpolation.
    Linear,
    /// Linear interpolation of the square root of beta.
    ScaledLinear,
    /// Glide cosine schedule
    SquaredcosCapV2,
}

impl BetaSchedule {
    /// Discretizes this schedule into `steps` betas, between `beta_start` and
    /// `beta_end` for the linear variants and capped at `beta_end` for the
    /// cosine one.
    pub fn betas(&self, beta_start: f64, beta_end: f64, steps: usize) -> Tensor {
        match self {
            BetaSchedule::Linear => {
                Tensor::linspace(beta_start, beta_end, steps as i64, kind::DOUBLE_CPU)
            }
            BetaSchedule::ScaledLinear => Tensor::linspace(
                beta_start.sqrt(),
                beta_end.sqrt(),
                steps as i64,
                kind::DOUBLE_CPU,
            )
            .square(),
            BetaSchedule::SquaredcosCapV2 => betas_for_alpha_bar(steps, beta_end),
        }
    }
}

/// Create a beta schedule that discretizes the given alpha_t_bar function, which defines the cumulative product of
/// `(1-beta)` over time from `t = [0,1]`.
///
/// Contains a function `alpha_bar` that takes an argument `t` and transforms it to the cumulative product of `(1-beta)`
/// up to that part of the diffusion process.
pub(crate) fn betas_for_alpha_bar(num_diffusion_timesteps: usize, max_beta: f64) -> Tensor {
    let alpha_bar = |time_step: f64| {
        f64::cos((time_step + 0.008) / 1.008 * std::f64::consts::FRAC_PI_2).powi(2)
    };
    let mut betas = Vec::with_capacity(num_diffusion_timesteps);
    for i in 0..num_diffusion_timesteps {
        let t1 = i as f64 / num_diffusion_timesteps as f64;
        let t2 = (i + 1) as f64 / num_diffusion_timesteps as f64;
        betas.push((1.0 - alpha_bar(t2) / alpha_bar(t1)).min(max_beta));
    }
    Tensor::from_slice(&betas)
}

/// Parameters of a beta schedule generated from its end points.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BetaScheduleConfig {
    pub beta_start: f64,
    pub beta_end: f64,
    pub steps: usize,
}

impl Default for BetaScheduleConfig {
    fn default() -> Self {
        Self { beta_start: 0.0001, beta_end: 0.02, steps: 1000 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CosineScheduleConfig {
    pub steps: usize,
    pub max_beta: f64,
}

impl Default for CosineScheduleConfig {
    fn default() -> Self {
        Self { steps: 1000, max_beta: 0.999 }
    }
}

/// Where a noise schedule comes from: generated from a handful of scalars, or
/// restored verbatim from the arrays stored in a training checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "schedule_name", content = "schedule_args")]
pub enum NoiseScheduleKind {
    Linear(BetaScheduleConfig),
    ScaledLinear(BetaScheduleConfig),
    SquaredcosCapV2(CosineScheduleConfig),
    Tensors(NoiseScheduleConfig),
}

impl Default for NoiseScheduleKind {
    fn default() -> Self {
        NoiseScheduleKind::Linear(BetaScheduleConfig::default())
    }
}

impl NoiseScheduleKind {

    pub fn from_file<T: AsRef<std::path::Path>>(path: T) -> Result<Self> {
        let file = fs::read_to_string(path)?;
        let cfg: NoiseScheduleKind = toml::from_str(&file)?;
        Ok(cfg)
    }

    pub fn build(&self, device: Device) -> Result<NoiseSchedule> {
        let schedule = match &self {
            NoiseScheduleKind::Linear(c) => {
                NoiseSchedule::from_betas(BetaSchedule::Linear.betas(c.beta_start, c.beta_end, c.steps))?
            },
            NoiseScheduleKind::ScaledLinear(c) => {
                NoiseSchedule::from_betas(BetaSchedule::ScaledLinear.betas(c.beta_start, c.beta_end, c.steps))?
            },
            NoiseScheduleKind::SquaredcosCapV2(c) => {
                NoiseSchedule::from_betas(BetaSchedule::SquaredcosCapV2.betas(0., c.max_beta, c.steps))?
            },
            NoiseScheduleKind::Tensors(config) => NoiseSchedule::from_config(config)?,
        };
        Ok(schedule.to(device))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_linear_config() {
        let cfg = NoiseScheduleKind::from_file("src/schedulers/config.linear.default.toml").unwrap();
        match cfg {
            NoiseScheduleKind::Linear(c) => assert_eq!(c, BetaScheduleConfig::default()),
            other => panic!("unexpected schedule {:?}", other),
        }
    }

    #[test]
    fn test_load_tensors_config() {
        let cfg = NoiseScheduleKind::from_file("src/schedulers/config.tensors.toml").unwrap();
        let schedule = cfg.build(Device::Cpu).unwrap();
        assert_eq!(schedule.steps(), 5);
    }

    #[test]
    fn test_cosine_betas_are_capped_and_increasing() {
        let betas = Vec::<f64>::try_from(BetaSchedule::SquaredcosCapV2.betas(0., 0.999, 1000)).unwrap();
        assert_eq!(betas.len(), 1000);
        assert!(betas.iter().all(|b| *b > 0. && *b <= 0.999));
        assert!(betas[0] < betas[500]);
        assert!(betas[500] < betas[999]);
    }

    #[test]
    fn test_scaled_linear_end_points() {
        let betas = Vec::<f64>::try_from(BetaSchedule::ScaledLinear.betas(0.00085, 0.012, 1000)).unwrap();
        assert!((betas[0] - 0.00085).abs() < 1e-12);
        assert!((betas[999] - 0.012).abs() < 1e-12);
    }

    #[test]
    fn test_every_kind_builds() {
        let kinds = [
            NoiseScheduleKind::Linear(BetaScheduleConfig::default()),
            NoiseScheduleKind::ScaledLinear(BetaScheduleConfig { beta_start: 0.00085, beta_end: 0.012, steps: 1000 }),
            NoiseScheduleKind::SquaredcosCapV2(CosineScheduleConfig::default()),
        ];
        for kind in kinds.iter() {
            let schedule = kind.build(Device::Cpu).unwrap();
            assert_eq!(schedule.steps(), 1000);
        }
    }
}
