use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use anyhow::{bail, ensure, Context, Result};

use super::{snapshot_path, variable_id, MAGIC, VERSION};
use crate::engine::NativeEngine;
use crate::session::Session;
use crate::tensor::{DType, HostTensor, Shape};

/// Reads a snapshot file, checking that it was written for `variable_name`.
pub fn read_snapshot_file(path: &Path, variable_name: &str) -> Result<HostTensor> {
    let file = File::open(path)
        .with_context(|| format!("failed to open snapshot file {}", path.display()))?;
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);

    let mut magic = [0u8; 8];
    reader.read_exact(&mut magic)?;
    if &magic != MAGIC {
        bail!("invalid snapshot magic header in {}", path.display());
    }
    let version = read_u32(&mut reader)?;
    if version != VERSION {
        bail!("unsupported snapshot version {}", version);
    }

    let stored_id = read_u128(&mut reader)?;
    if stored_id != variable_id(variable_name) {
        bail!(
            "snapshot {} was written for a different variable than '{}'",
            path.display(),
            variable_name
        );
    }

    let tag = read_u32(&mut reader)?;
    let dtype = DType::from_tag(tag).with_context(|| format!("unknown dtype tag {tag}"))?;

    let rank = read_u32(&mut reader)? as usize;
    ensure!(
        (1..=MAX_RANK).contains(&rank),
        "snapshot rank {rank} is outside 1..={MAX_RANK}"
    );
    let mut dims = Vec::with_capacity(rank);
    for _ in 0..rank {
        let dim = read_u64(&mut reader)?;
        dims.push(usize::try_from(dim).with_context(|| format!("snapshot dimension {dim} is too large"))?);
    }
    let shape = Shape::try_new(dims.clone())
        .with_context(|| format!("invalid snapshot shape {dims:?}"))?;

    let byte_len = read_u64(&mut reader)?;
    let Some(expected) = shape.checked_byte_len(std::mem::size_of::<f32>()) else {
        bail!("snapshot shape {shape} is too large");
    };
    ensure!(
        byte_len == expected as u64,
        "snapshot payload is {byte_len} bytes but shape {shape} needs {expected}"
    );
    ensure!(
        byte_len <= file_len,
        "snapshot {} claims {byte_len} payload bytes but the file has {file_len}",
        path.display()
    );
    let mut bytes = vec![0u8; expected];
    reader.read_exact(&mut bytes)?;
    let data = bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();
    HostTensor::from_vec(shape, dtype, data)
}

/// Upper bound on the rank accepted from a snapshot header.
const MAX_RANK: usize = 32;

pub struct CheckpointLoader;

impl CheckpointLoader {
    /// Feeds every eager variable of `session` from its snapshot under `root`.
    pub fn load<E: NativeEngine>(session: &Session<E>, root: impl AsRef<Path>) -> Result<()> {
        let root = root.as_ref();
        ensure!(root.is_dir(), "checkpoint directory {} does not exist", root.display());
        let variables = session.variables();
        for blob in &variables {
            let path = snapshot_path(root, blob.name());
            if !path.is_file() {
                bail!(
                    "checkpoint {} has no snapshot for variable '{}'",
                    root.display(),
                    blob.name()
                );
            }
            let tensor = read_snapshot_file(&path, blob.name())?;
            ensure!(
                tensor.shape() == blob.shape(),
                "snapshot of '{}' has shape {} but the variable has shape {}",
                blob.name(),
                tensor.shape(),
                blob.shape()
            );
            session
                .feed_variable(blob.name(), tensor)
                .with_context(|| format!("failed to feed variable '{}'", blob.name()))?;
        }
        tracing::info!(path = %root.display(), variables = variables.len(), "loaded checkpoint");
        Ok(())
    }
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(reader: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_u128<R: Read>(reader: &mut R) -> Result<u128> {
    let mut buf = [0u8; 16];
    reader.read_exact(&mut buf)?;
    Ok(u128::from_le_bytes(buf))
}
