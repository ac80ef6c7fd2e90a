//! Snapshot directory codec.
//!
//! A checkpoint is a directory holding one sub-directory per variable, each with a single
//! `out` file:
//!
//! ```text
//! <root>/<variable name>/out
//! ```
//!
//! Every file starts with [`MAGIC`] and [`VERSION`], followed by the blake3-derived variable
//! id, the dtype tag, the dimensions and the little-endian `f32` payload.

mod loader;
mod saver;

use std::path::{Path, PathBuf};

pub use loader::{read_snapshot_file, CheckpointLoader};
pub use saver::{write_snapshot_file, CheckpointSaver};

pub const MAGIC: &[u8; 8] = b"FSCOPESN";
pub const VERSION: u32 = 1;
/// File name of a variable's value inside its snapshot directory.
pub const SNAPSHOT_KEY: &str = "out";

pub fn snapshot_path(root: &Path, variable_name: &str) -> PathBuf {
    root.join(variable_name).join(SNAPSHOT_KEY)
}

/// Stable id stored alongside each snapshot so a file cannot be restored into the wrong
/// variable.
pub fn variable_id(variable_name: &str) -> u128 {
    let hash = blake3::hash(variable_name.as_bytes());
    let mut raw = [0u8; 16];
    raw.copy_from_slice(&hash.as_bytes()[..16]);
    u128::from_le_bytes(raw)
}
