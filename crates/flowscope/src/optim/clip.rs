//! Clip-by-global-norm for gradient tensors.

use thiserror::Error;

use crate::tensor::HostTensor;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ClipError {
    #[error(
        "the total norm of order {norm_type} for gradients is non-finite, so it cannot be clipped; \
         pass error_if_nonfinite = false to scale the gradients by the non-finite norm anyway"
    )]
    NonFinite { norm_type: f32 },
    #[error("norm type must be positive, got {0}")]
    InvalidNormType(f32),
}

/// Norm order and non-finite policy for [`clip_grad_norm`].
///
/// The default is the two-norm with the permissive non-finite path.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClipOptions {
    pub norm_type: f32,
    pub error_if_nonfinite: bool,
}

impl Default for ClipOptions {
    fn default() -> Self {
        ClipOptions {
            norm_type: 2.0,
            error_if_nonfinite: false,
        }
    }
}

impl ClipOptions {
    pub fn clip(&self, grads: &mut [HostTensor], max_norm: f32) -> Result<f32, ClipError> {
        clip_grad_norm(grads, max_norm, self.norm_type, self.error_if_nonfinite)
    }
}

/// Scales `grads` in place so their joint `norm_type`-norm is at most `max_norm` and returns
/// the norm measured before scaling. `f32::INFINITY` selects the max-abs norm.
///
/// A NaN or infinite total norm is an error when `error_if_nonfinite` is set. Otherwise a
/// warning is logged and the gradients are scaled by the resulting coefficient anyway.
pub fn clip_grad_norm(
    grads: &mut [HostTensor],
    max_norm: f32,
    norm_type: f32,
    error_if_nonfinite: bool,
) -> Result<f32, ClipError> {
    if norm_type.is_nan() || norm_type <= 0.0 {
        return Err(ClipError::InvalidNormType(norm_type));
    }
    if grads.is_empty() {
        return Ok(0.0);
    }

    let total_norm = if norm_type == f32::INFINITY {
        grads
            .iter()
            .map(|g| g.data().iter().fold(0.0f32, |acc, v| max_propagating_nan(acc, v.abs())))
            .fold(0.0f32, max_propagating_nan)
    } else {
        let norms: Vec<f32> = grads.iter().map(|g| p_norm(g.data(), norm_type)).collect();
        p_norm(&norms, norm_type)
    };

    let non_finite = !total_norm.is_finite();
    if non_finite {
        if error_if_nonfinite {
            return Err(ClipError::NonFinite { norm_type });
        }
        tracing::warn!(
            total_norm,
            norm_type,
            "non-finite gradient norm encountered in clip_grad_norm; continuing anyway"
        );
    }

    let clip_coef = max_norm / (total_norm + 1e-6);
    if clip_coef < 1.0 || non_finite {
        for grad in grads.iter_mut() {
            for value in grad.data_mut() {
                *value *= clip_coef;
            }
        }
    }
    Ok(total_norm)
}

fn p_norm(values: &[f32], p: f32) -> f32 {
    if p == 2.0 {
        return values.iter().map(|v| v * v).sum::<f32>().sqrt();
    }
    values
        .iter()
        .map(|v| v.abs().powf(p))
        .sum::<f32>()
        .powf(1.0 / p)
}

fn max_propagating_nan(a: f32, b: f32) -> f32 {
    if a.is_nan() || b.is_nan() {
        f32::NAN
    } else {
        a.max(b)
    }
}
