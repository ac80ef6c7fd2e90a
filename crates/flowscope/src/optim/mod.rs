//! Optimizer-side helpers that operate on host gradients.

pub mod clip;

pub use clip::{clip_grad_norm, ClipError, ClipOptions};
