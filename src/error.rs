use tch::Device;
use thiserror::Error;

/// Errors raised by the diffusion core.
///
/// Every condition is detected at the point it arises and handed back to the
/// caller. Nothing is retried.
#[derive(Error, Debug)]
pub enum DiffusionError {
    /// Invalid step counts, malformed schedules or out of range timesteps.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch { expected: Vec<i64>, actual: Vec<i64> },

    /// A square root would be taken of a negative value.
    #[error("numeric instability: `{term}` evaluated to {value} under a square root")]
    NumericInstability { term: &'static str, value: f64 },

    #[error("device mismatch: expected {expected:?}, got {actual:?}")]
    DeviceMismatch { expected: Device, actual: Device },

    #[error("sampling cancelled after {completed} step(s)")]
    Cancelled { completed: usize },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("torch error: {0}")]
    Torch(#[from] tch::TchError),
}

pub type Result<T> = std::result::Result<T, DiffusionError>;

impl DiffusionError {
    pub(crate) fn config<S: Into<String>>(msg: S) -> Self {
        DiffusionError::Config(msg.into())
    }
}
