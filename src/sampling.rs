//! # Sampling loop
//!
//! Drives a [`Diffuser`] through its reverse steps, from pure noise to data.
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tch::Tensor;
use tracing::{debug, info, info_span};

use crate::error::{DiffusionError, Result};
use crate::schedulers::ddim::batch_size;
use crate::schedulers::{Diffuser, NoisePredictor, Trajectory};

/// Lower and upper bound of valid data, matching the `[-1, 1]` normalization
/// the forward process assumes.
pub const CLAMP_RANGE: (f64, f64) = (-1., 1.);

/// Notified once after every reverse step. Returning `Break` cancels the run.
pub trait StepObserver {
    fn on_step(&mut self, step: usize, total: usize, sample: &Tensor) -> ControlFlow<()>;

    /// Polled before every step, a `true` stops the run before the predictor
    /// is called again.
    fn stop_requested(&self) -> bool {
        false
    }
}

impl<F> StepObserver for F
where
    F: FnMut(usize, usize, &Tensor) -> ControlFlow<()>,
{
    fn on_step(&mut self, step: usize, total: usize, sample: &Tensor) -> ControlFlow<()> {
        self(step, total, sample)
    }
}

/// Emits one `tracing` event per step.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingObserver;

impl StepObserver for LoggingObserver {
    fn on_step(&mut self, step: usize, total: usize, _sample: &Tensor) -> ControlFlow<()> {
        debug!("Denoising {}/{}", step + 1, total);
        ControlFlow::Continue(())
    }
}

/// A flag shared with another thread, checked before and after every step.
#[derive(Debug, Default, Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl StepObserver for CancellationToken {
    fn on_step(&mut self, _step: usize, _total: usize, _sample: &Tensor) -> ControlFlow<()> {
        if self.is_cancelled() {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    }

    fn stop_requested(&self) -> bool {
        self.is_cancelled()
    }
}

/// Runs every reverse step of `diffuser` starting from `images`.
///
/// Each intermediate sample is clamped to [`CLAMP_RANGE`] and kept in the
/// returned trajectory. Non-finite predictions are not screened here and flow
/// through the remaining steps. On error the partial trajectory is dropped.
pub fn generate<D: Diffuser + ?Sized>(
    diffuser: &D,
    images: &Tensor,
    model: &dyn NoisePredictor,
    observer: &mut dyn StepObserver,
) -> Result<Trajectory> {
    let number_of_images = batch_size(images)?;
    let steps = diffuser.steps();
    let total = steps.len();
    let _span = info_span!("denoise", total, number_of_images).entered();
    info!("Denoising {} image(s) in {} steps", number_of_images, total);

    let mut images = images.shallow_clone();
    let mut denoised_images = Vec::with_capacity(total);
    for (completed, idx) in steps.into_iter().enumerate() {
        if observer.stop_requested() {
            return Err(DiffusionError::Cancelled { completed });
        }
        let timestep = diffuser.timestep(number_of_images, idx)?;
        images = diffuser
            .denoise_step(&images, model, &timestep)?
            .clamp(CLAMP_RANGE.0, CLAMP_RANGE.1);
        denoised_images.push(images.shallow_clone());
        if observer.on_step(completed, total, &images).is_break() {
            return Err(DiffusionError::Cancelled { completed: completed + 1 });
        }
    }
    info!("Denoising done");
    Ok(denoised_images)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedulers::{DdimDiffuser, DdimDiffuserConfig, NoiseScheduleKind};
    use tch::{Device, Kind};

    fn diffuser(number_of_steps: usize) -> DdimDiffuser {
        let schedule = NoiseScheduleKind::default().build(Device::Cpu).unwrap();
        DdimDiffuser::new(schedule, DdimDiffuserConfig { number_of_steps, ..Default::default() })
            .unwrap()
    }

    #[test]
    fn test_trajectory_length_and_clamping() {
        let diffuser = diffuser(10);
        let xs = Tensor::randn([2, 3, 4, 4], (Kind::Float, Device::Cpu)) * 3.;
        // a poor predictor that pushes samples outside the data range
        let model = |xs: &Tensor, _t: &Tensor| xs * -5.;
        let trajectory = generate(&diffuser, &xs, &model, &mut LoggingObserver).unwrap();
        assert_eq!(trajectory.len(), 10);
        for sample in trajectory.iter() {
            assert_eq!(sample.size(), vec![2, 3, 4, 4]);
            assert!(sample.max().double_value(&[]) <= 1.);
            assert!(sample.min().double_value(&[]) >= -1.);
        }
    }

    #[test]
    fn test_observer_sees_every_step_in_order() {
        let diffuser = diffuser(5);
        let xs = Tensor::zeros([1, 2], (Kind::Float, Device::Cpu));
        let model = |xs: &Tensor, _t: &Tensor| xs.zeros_like();
        let mut seen = vec![];
        let mut observer = |step: usize, total: usize, _: &Tensor| {
            seen.push((step, total));
            ControlFlow::Continue(())
        };
        generate(&diffuser, &xs, &model, &mut observer).unwrap();
        assert_eq!(seen, vec![(0, 5), (1, 5), (2, 5), (3, 5), (4, 5)]);
    }

    #[test]
    fn test_predictor_sees_descending_timesteps() {
        let diffuser = diffuser(4);
        let xs = Tensor::zeros([2, 2], (Kind::Float, Device::Cpu));
        let seen = std::cell::RefCell::new(vec![]);
        let model = |xs: &Tensor, t: &Tensor| {
            seen.borrow_mut().push(t.int64_value(&[0]));
            xs.zeros_like()
        };
        generate(&diffuser, &xs, &model, &mut LoggingObserver).unwrap();
        let seen = seen.into_inner();
        let mut expected: Vec<i64> = diffuser.subsampled().time_steps().to_vec();
        expected.reverse();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_cancelled_token_skips_every_step() {
        let diffuser = diffuser(8);
        let xs = Tensor::zeros([1, 2], (Kind::Float, Device::Cpu));
        let calls = std::cell::Cell::new(0);
        let model = |xs: &Tensor, _t: &Tensor| {
            calls.set(calls.get() + 1);
            xs.zeros_like()
        };
        let mut token = CancellationToken::new();
        token.clone().cancel();
        match generate(&diffuser, &xs, &model, &mut token) {
            Err(DiffusionError::Cancelled { completed }) => assert_eq!(completed, 0),
            other => panic!("expected cancellation, got {:?}", other.map(|t| t.len())),
        }
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn test_cancellation_during_a_step_stops_after_it() {
        let diffuser = diffuser(8);
        let xs = Tensor::zeros([1, 2], (Kind::Float, Device::Cpu));
        let token = CancellationToken::new();
        let handle = token.clone();
        let calls = std::cell::Cell::new(0);
        let model = |xs: &Tensor, _t: &Tensor| {
            calls.set(calls.get() + 1);
            if calls.get() == 2 {
                handle.cancel();
            }
            xs.zeros_like()
        };
        let mut token = token;
        match generate(&diffuser, &xs, &model, &mut token) {
            Err(DiffusionError::Cancelled { completed }) => assert_eq!(completed, 2),
            other => panic!("expected cancellation, got {:?}", other.map(|t| t.len())),
        }
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_rejects_scalar_input() {
        let diffuser = diffuser(3);
        let xs = Tensor::from(0.5f32);
        let model = |xs: &Tensor, _t: &Tensor| xs.zeros_like();
        assert!(matches!(
            generate(&diffuser, &xs, &model, &mut LoggingObserver),
            Err(DiffusionError::Config(_))
        ));
    }
}
