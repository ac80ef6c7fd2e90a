//! Host-backed tensor used to move blob contents in and out of the engine.

use anyhow::{bail, Result};

use super::{dtype::DType, shape::Shape};

/// Dense host tensor. Payloads are kept as `f32` regardless of the logical dtype;
/// the engine is responsible for any narrowing on its side.
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    shape: Shape,
    dtype: DType,
    data: Vec<f32>,
}

impl HostTensor {
    /// Constructs a tensor from raw values, validating the length against the shape.
    pub fn from_vec(shape: Shape, dtype: DType, data: Vec<f32>) -> Result<Self> {
        if data.len() != shape.num_elements() {
            bail!(
                "tensor data length ({}) does not match shape {:?}",
                data.len(),
                shape.dims()
            );
        }
        Ok(HostTensor { shape, dtype, data })
    }

    /// Returns a zero-initialized tensor of the requested shape.
    pub fn zeros(shape: Shape, dtype: DType) -> Self {
        let len = shape.num_elements();
        HostTensor {
            shape,
            dtype,
            data: vec![0.0; len],
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }
}
