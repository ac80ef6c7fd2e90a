use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};

use super::{snapshot_path, variable_id, MAGIC, VERSION};
use crate::engine::NativeEngine;
use crate::session::Session;
use crate::tensor::HostTensor;

/// Writes `tensor` as the snapshot of `variable_name`, creating parent directories.
pub fn write_snapshot_file(path: &Path, variable_name: &str, tensor: &HostTensor) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create snapshot directory {}", parent.display()))?;
    }
    let file = File::create(path)
        .with_context(|| format!("failed to create snapshot file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    writer.write_all(MAGIC)?;
    writer.write_all(&VERSION.to_le_bytes())?;
    writer.write_all(&variable_id(variable_name).to_le_bytes())?;
    writer.write_all(&tensor.dtype().tag().to_le_bytes())?;

    let dims = tensor.shape().dims();
    writer.write_all(&(dims.len() as u32).to_le_bytes())?;
    for &dim in dims {
        writer.write_all(&(dim as u64).to_le_bytes())?;
    }

    let data = tensor.data();
    writer.write_all(&((data.len() * std::mem::size_of::<f32>()) as u64).to_le_bytes())?;
    for &value in data {
        writer.write_all(&value.to_le_bytes())?;
    }
    writer.flush()?;
    Ok(())
}

pub struct CheckpointSaver;

impl CheckpointSaver {
    /// Fetches every eager variable of `session` and writes it under `root`.
    pub fn save<E: NativeEngine>(session: &Session<E>, root: impl AsRef<Path>) -> Result<()> {
        let root = root.as_ref();
        fs::create_dir_all(root)
            .with_context(|| format!("failed to create checkpoint directory {}", root.display()))?;
        let variables = session.variables();
        for blob in &variables {
            let tensor = session
                .fetch_variable(blob.name())
                .with_context(|| format!("failed to fetch variable '{}'", blob.name()))?;
            write_snapshot_file(&snapshot_path(root, blob.name()), blob.name(), &tensor)?;
        }
        tracing::info!(path = %root.display(), variables = variables.len(), "saved checkpoint");
        Ok(())
    }
}
