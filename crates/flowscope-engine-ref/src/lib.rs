//! Reference implementation of the flowscope engine binding.
//!
//! Symbols are kept as bookkeeping entries, blobs live in host memory and model-io reads and
//! writes the same snapshot directories as eager checkpoints.

pub mod engine;
pub mod initializer;

pub use engine::{EngineStats, FailPoint, RefBlob, RefEngine};
