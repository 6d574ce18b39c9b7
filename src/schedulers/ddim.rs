//! # Denoising Diffusion Implicit Models
//!
//! The Denoising Diffusion Implicit Models (DDIM) sampler generalizes the
//! Markovian reverse process of DDPM to a non-Markovian one. This lets the
//! reverse process visit only a short subsequence of the training timesteps.
//! `eta` controls how much fresh noise every step injects: 0 gives a fully
//! deterministic trajectory, 1 gives ancestral-like sampling.
//!
//! Denoising Diffusion Implicit Models, J. Song et al, 2020.
//! https://arxiv.org/abs/2010.02502
use serde::{Deserialize, Serialize};
use tch::{Device, Kind, Tensor};
use tracing::trace;

use super::subsample::{DenoisingMode, SubsampledSchedule};
use super::types::{Diffuser, NoisePredictor, Timestep, Trajectory};
use super::{NoiseSchedule, NoiseScheduleConfig};
use crate::error::{DiffusionError, Result};
use crate::sampling::{self, LoggingObserver};
use crate::utils::{count_non_finite, ensure_device, ensure_shape, per_sample};

// Radicands this far below zero are float noise and get clamped to zero.
const RADICAND_TOLERANCE: f64 = 1e-6;

/// The configuration for the DDIM sampler.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DdimDiffuserConfig {
    /// Linear or quadratic spacing of the visited timesteps.
    pub mode: DenoisingMode,
    /// Number of reverse steps.
    pub number_of_steps: usize,
    /// The amount of noise to be added at each step.
    pub eta: f64,
}

impl Default for DdimDiffuserConfig {
    fn default() -> Self {
        Self { mode: DenoisingMode::Quadratic, number_of_steps: 20, eta: 0. }
    }
}

/// What a training run stores to rebuild its diffuser without retraining.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub beta_scheduler_config: NoiseScheduleConfig,
    #[serde(default)]
    pub sampler: DdimDiffuserConfig,
}

/// The DDIM diffuser.
#[derive(Debug, Clone)]
pub struct DdimDiffuser {
    schedule: NoiseSchedule,
    subsampled: SubsampledSchedule,
    pub config: DdimDiffuserConfig,
}

impl DdimDiffuser {
    /// Creates a new DDIM diffuser. The visited timesteps are computed once
    /// here, an invalid step count is rejected before any sampling happens.
    pub fn new(schedule: NoiseSchedule, config: DdimDiffuserConfig) -> Result<Self> {
        let subsampled =
            SubsampledSchedule::build(schedule.steps(), config.number_of_steps, config.mode)?;
        Ok(Self { schedule, subsampled, config })
    }

    pub fn from_checkpoint(checkpoint: &Checkpoint) -> Result<Self> {
        let schedule = NoiseSchedule::from_config(&checkpoint.beta_scheduler_config)?;
        Self::new(schedule, checkpoint.sampler)
    }

    /// Returns a copy of this diffuser with its schedule moved to `device`.
    pub fn to(&self, device: Device) -> Self {
        Self {
            schedule: self.schedule.to(device),
            subsampled: self.subsampled.clone(),
            config: self.config,
        }
    }

    pub fn subsampled(&self) -> &SubsampledSchedule {
        &self.subsampled
    }

    /// Corrupts `images` at the given timesteps with freshly drawn noise.
    pub fn diffuse_batch_at(
        &self,
        images: &Tensor,
        timesteps: &Tensor,
    ) -> Result<(Tensor, Tensor, Tensor)> {
        let noise = images.randn_like();
        self.diffuse_batch_with_noise(images, timesteps, noise)
    }

    /// Closed form forward diffusion:
    /// `sqrt(alpha_bar_t) * images + sqrt(1 - alpha_bar_t) * noise`.
    pub fn diffuse_batch_with_noise(
        &self,
        images: &Tensor,
        timesteps: &Tensor,
        noise: Tensor,
    ) -> Result<(Tensor, Tensor, Tensor)> {
        ensure_device(self.schedule.device(), images.device())?;
        ensure_shape(images, &noise)?;
        ensure_batch(images, timesteps)?;
        let alpha_bar_t = self.schedule.gather(timesteps)?;
        let alpha_bar_t = per_sample(&alpha_bar_t, images.dim()).to_kind(images.kind());

        let mu = alpha_bar_t.sqrt();
        let sigma = (1f64 - &alpha_bar_t).sqrt();
        let images = mu * images + sigma * &noise;
        Ok((images, noise, timesteps.shallow_clone()))
    }

    /// Performs one reverse step with an explicit `eta`.
    pub fn denoise_step_with_eta(
        &self,
        images: &Tensor,
        model: &dyn NoisePredictor,
        timestep: &Timestep,
        eta: f64,
    ) -> Result<Tensor> {
        tch::no_grad(|| -> Result<Tensor> {
            ensure_device(self.schedule.device(), images.device())?;
            ensure_batch(images, &timestep.current)?;
            ensure_batch(images, &timestep.previous)?;
            ensure_ordered(timestep)?;

            let epsilon_theta = model.predict(images, &timestep.current);
            ensure_device(images.device(), epsilon_theta.device())?;
            ensure_shape(images, &epsilon_theta)?;

            let alpha_bar_t = self.schedule.gather(&timestep.current)?.to_kind(Kind::Double);
            let alpha_bar_t_prev = self.schedule.gather(&timestep.previous)?.to_kind(Kind::Double);

            let variance = (1. - &alpha_bar_t_prev) / (1. - &alpha_bar_t)
                * (1. - &alpha_bar_t / &alpha_bar_t_prev);
            let sigma = checked_sqrt("variance", variance)? * eta;
            let direction =
                checked_sqrt("1 - alpha_bar_prev - sigma^2", 1. - &alpha_bar_t_prev - sigma.square())?;

            let sample_coef = (&alpha_bar_t_prev / &alpha_bar_t).sqrt();
            let epsilon_coef =
                direction - (&alpha_bar_t_prev * (1f64 - &alpha_bar_t) / &alpha_bar_t).sqrt();

            let (ndim, kind) = (images.dim(), images.kind());
            let sample_coef = per_sample(&sample_coef, ndim).to_kind(kind);
            let epsilon_coef = per_sample(&epsilon_coef, ndim).to_kind(kind);
            let mu = sample_coef * images + epsilon_coef * epsilon_theta;
            trace!(eta, "ddim step");
            if eta == 0. {
                Ok(mu)
            } else {
                let sigma = per_sample(&sigma, ndim).to_kind(kind);
                Ok(mu + sigma * images.randn_like())
            }
        })
    }

    /// Runs the whole reverse process from `images`, returning every
    /// intermediate sample clamped to `[-1, 1]`.
    pub fn denoise_batch(&self, images: &Tensor, model: &dyn NoisePredictor) -> Result<Trajectory> {
        sampling::generate(self, images, model, &mut LoggingObserver)
    }
}

impl Diffuser for DdimDiffuser {
    fn schedule(&self) -> &NoiseSchedule {
        &self.schedule
    }

    fn diffuse_batch(&self, images: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
        let batch = batch_size(images)?;
        let timesteps = Tensor::randint(
            self.schedule.steps() as i64,
            [batch],
            (Kind::Int64, self.schedule.device()),
        );
        self.diffuse_batch_at(images, &timesteps)
    }

    fn steps(&self) -> Vec<usize> {
        self.subsampled.steps()
    }

    fn timestep(&self, number_of_images: i64, idx: usize) -> Result<Timestep> {
        self.subsampled.timestep(number_of_images, idx, self.schedule.device())
    }

    fn denoise_step(
        &self,
        images: &Tensor,
        model: &dyn NoisePredictor,
        timestep: &Timestep,
    ) -> Result<Tensor> {
        self.denoise_step_with_eta(images, model, timestep, self.config.eta)
    }
}

pub(crate) fn batch_size(images: &Tensor) -> Result<i64> {
    images
        .size()
        .first()
        .copied()
        .ok_or_else(|| DiffusionError::config("samples need a leading batch dimension"))
}

fn ensure_batch(images: &Tensor, timesteps: &Tensor) -> Result<()> {
    let batch = batch_size(images)?;
    if timesteps.size() != [batch] {
        return Err(DiffusionError::ShapeMismatch { expected: vec![batch], actual: timesteps.size() });
    }
    Ok(())
}

// A reverse step must move to a strictly less noisy index.
fn ensure_ordered(timestep: &Timestep) -> Result<()> {
    if timestep.current.numel() == 0 {
        return Ok(());
    }
    let gap = (&timestep.current - &timestep.previous).min().f_int64_value(&[])?;
    if gap <= 0 {
        return Err(DiffusionError::config(format!(
            "previous timestep must be below the current one, smallest gap is {gap}"
        )));
    }
    Ok(())
}

fn checked_sqrt(term: &'static str, radicand: Tensor) -> Result<Tensor> {
    if radicand.numel() > 0 {
        if count_non_finite(&radicand)? > 0 {
            return Err(DiffusionError::NumericInstability { term, value: f64::NAN });
        }
        let value = radicand.min().f_double_value(&[])?;
        if value < -RADICAND_TOLERANCE {
            return Err(DiffusionError::NumericInstability { term, value });
        }
    }
    Ok(radicand.clamp_min(0.).sqrt())
}
