//! Gaussian diffusion with accelerated DDIM sampling on top of `tch`.
//!
//! The forward process corrupts a batch in one closed-form step, the reverse
//! process walks a short subsequence of the noise schedule with a
//! caller-supplied noise predictor.

pub mod config;
pub mod error;
pub mod sampling;
pub mod schedulers;
pub mod utils;

pub use error::{DiffusionError, Result};
