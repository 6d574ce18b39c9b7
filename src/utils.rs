use tch::{Device, Kind, Tensor};

use crate::error::{DiffusionError, Result};

/// Picks MPS or CUDA when present, the CPU otherwise.
pub fn get_device() -> Device {
    if tch::utils::has_mps() {
        Device::Mps
    } else {
        Device::cuda_if_available()
    }
}

// `tag` goes right before the extension, `.png` is appended when there is none.
fn tag_filename(filename: &str, tag: &str) -> String {
    match filename.rsplit_once('.') {
        None => format!("{filename}{tag}.png"),
        Some((stem, extension)) => format!("{stem}{tag}.{extension}"),
    }
}

/// Name of the file holding sample `sample_idx` (1-based) of a batch,
/// optionally at an intermediate reverse step.
pub fn output_filename(
    basename: &str,
    sample_idx: i64,
    num_samples: i64,
    timestep_idx: Option<usize>,
) -> String {
    let filename = if num_samples > 1 {
        tag_filename(basename, &format!(".{sample_idx}"))
    } else {
        basename.to_string()
    };
    match timestep_idx {
        None => filename,
        Some(timestep_idx) => tag_filename(&filename, &format!("-{timestep_idx}")),
    }
}

/// Number of non-finite (NaN or infinite) elements in `xs`.
pub fn count_non_finite(xs: &Tensor) -> Result<i64> {
    let finite = xs.f_isfinite()?;
    let num = finite.logical_not().to_kind(Kind::Int64).sum(Kind::Int64);
    Ok(num.f_int64_value(&[])?)
}

/// Reshapes a per-sample coefficient of shape `[B]` to `[B, 1, ..., 1]` so it
/// broadcasts over a sample with `ndim` dimensions.
pub(crate) fn per_sample(coefficient: &Tensor, ndim: usize) -> Tensor {
    let mut shape = vec![-1i64];
    shape.extend(std::iter::repeat(1).take(ndim.saturating_sub(1)));
    coefficient.reshape(shape.as_slice())
}

pub(crate) fn ensure_device(expected: Device, actual: Device) -> Result<()> {
    if expected != actual {
        return Err(DiffusionError::DeviceMismatch { expected, actual });
    }
    Ok(())
}

pub(crate) fn ensure_shape(expected: &Tensor, actual: &Tensor) -> Result<()> {
    let (expected, actual) = (expected.size(), actual.size());
    if expected != actual {
        return Err(DiffusionError::ShapeMismatch { expected, actual });
    }
    Ok(())
}
