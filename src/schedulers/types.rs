use tch::{Device, Tensor};

use super::NoiseSchedule;
use crate::error::Result;

/// Intermediate samples of a reverse process, most noisy first.
pub type Trajectory = Vec<Tensor>;

/// Schedule indices of one reverse step, broadcast over the batch.
#[derive(Debug)]
pub struct Timestep {
    pub current: Tensor,
    pub previous: Tensor,
}

/// Anything that predicts the noise contained in a batch of samples.
pub trait NoisePredictor {
    fn predict(&self, xs: &Tensor, timesteps: &Tensor) -> Tensor;
}

impl<F> NoisePredictor for F
where
    F: Fn(&Tensor, &Tensor) -> Tensor,
{
    fn predict(&self, xs: &Tensor, timesteps: &Tensor) -> Tensor {
        self(xs, timesteps)
    }
}

/// A diffusion strategy: closed form forward corruption plus the reverse
/// step of one sampling algorithm.
pub trait Diffuser {
    fn schedule(&self) -> &NoiseSchedule;

    fn device(&self) -> Device {
        self.schedule().device()
    }

    /// Corrupts a batch at uniformly drawn timesteps, returning the noised
    /// batch, the noise added and the timesteps used.
    fn diffuse_batch(&self, images: &Tensor) -> Result<(Tensor, Tensor, Tensor)>;

    /// Step indices in visiting order.
    fn steps(&self) -> Vec<usize>;

    /// The index pair of step `idx`, broadcast over `number_of_images`.
    fn timestep(&self, number_of_images: i64, idx: usize) -> Result<Timestep>;

    /// Computes the sample one reverse step earlier in the chain.
    fn denoise_step(
        &self,
        images: &Tensor,
        model: &dyn NoisePredictor,
        timestep: &Timestep,
    ) -> Result<Tensor>;
}
