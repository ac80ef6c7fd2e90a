//! Host-side tensor types shared by the variable registry, checkpoint codec and engines.

pub mod dtype;
mod host_tensor;
pub mod shape;

pub use dtype::DType;
pub use host_tensor::HostTensor;
pub use shape::Shape;
