use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use tracing::debug;

use flowscope::checkpoint::{read_snapshot_file, snapshot_path, write_snapshot_file};
use flowscope::engine::{EngineError, EngineResult, InstructionsBuilder, ModelIo, NativeEngine};
use flowscope::job::JobOp;
use flowscope::placement::PlacementDescriptor;
use flowscope::scope::ScopeDescriptor;
use flowscope::variable::VariableConf;
use flowscope::{HostTensor, SymbolId};

use crate::initializer::initial_value;

/// Handle of a blob stored by [`RefEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RefBlob {
    id: u64,
}

impl RefBlob {
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Instruction the next call to which fails, for exercising error paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    NewParallelDesc,
    NewScope,
    NewVariableBlob,
    RunOp,
}

/// Counters of the work the engine has been asked to do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub parallel_descs_built: u64,
    pub scopes_built: u64,
    pub blobs_allocated: u64,
    pub blobs_initialized: u64,
    pub ops_executed: u64,
    pub logical_runs: u64,
    pub physical_runs: u64,
}

struct StoredBlob {
    name: String,
    value: HostTensor,
}

#[derive(Default)]
struct RefState {
    next_symbol: u64,
    next_blob: u64,
    parallel_descs: HashMap<SymbolId, PlacementDescriptor>,
    scopes: HashMap<SymbolId, ScopeDescriptor>,
    blobs: HashMap<u64, StoredBlob>,
    lazy_values: BTreeMap<String, HostTensor>,
    executed_ops: Vec<String>,
    fail_next: Option<FailPoint>,
    stats: EngineStats,
}

impl RefState {
    fn check_fail(&mut self, point: FailPoint) -> EngineResult<()> {
        if self.fail_next == Some(point) {
            self.fail_next = None;
            return Err(EngineError::execution(format!("injected failure at {point:?}")));
        }
        Ok(())
    }
}

/// In-process engine: symbols are bookkeeping entries and blobs live in host memory.
pub struct RefEngine {
    gpu_device_count: usize,
    state: Mutex<RefState>,
}

impl RefEngine {
    /// CPU-only engine.
    pub fn new() -> Self {
        Self::with_gpus(0)
    }

    /// Engine that reports `gpu_device_count` GPUs per node.
    pub fn with_gpus(gpu_device_count: usize) -> Self {
        RefEngine {
            gpu_device_count,
            state: Mutex::new(RefState {
                next_symbol: 1,
                ..RefState::default()
            }),
        }
    }

    fn lock(&self) -> EngineResult<MutexGuard<'_, RefState>> {
        self.state
            .lock()
            .map_err(|_| EngineError::execution("reference engine state poisoned"))
    }

    pub fn stats(&self) -> EngineStats {
        self.lock().map(|state| state.stats).unwrap_or_default()
    }

    pub fn fail_next(&self, point: FailPoint) {
        if let Ok(mut state) = self.lock() {
            state.fail_next = Some(point);
        }
    }

    /// Value of a lazily built variable, as produced by model init or load.
    pub fn lazy_value(&self, name: &str) -> Option<HostTensor> {
        self.lock().ok()?.lazy_values.get(name).cloned()
    }

    /// Names of ops run so far, in execution order.
    pub fn executed_ops(&self) -> Vec<String> {
        self.lock()
            .map(|state| state.executed_ops.clone())
            .unwrap_or_default()
    }

    pub fn parallel_desc(&self, id: SymbolId) -> Option<PlacementDescriptor> {
        self.lock().ok()?.parallel_descs.get(&id).cloned()
    }

    pub fn blob_count(&self) -> usize {
        self.lock().map(|state| state.blobs.len()).unwrap_or(0)
    }

    fn run(
        &self,
        physical: bool,
        f: &mut dyn FnMut(&mut dyn InstructionsBuilder<RefBlob>) -> EngineResult<()>,
    ) -> EngineResult<()> {
        let mut state = self.lock()?;
        if physical {
            state.stats.physical_runs += 1;
        } else {
            state.stats.logical_runs += 1;
        }
        let mut builder = RefBuilder { state: &mut *state };
        f(&mut builder)
    }
}

impl Default for RefEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeEngine for RefEngine {
    type BlobHandle = RefBlob;

    fn engine_name(&self) -> &str {
        "ref"
    }

    fn gpu_device_count(&self) -> usize {
        self.gpu_device_count
    }

    fn logical_run(
        &self,
        f: &mut dyn FnMut(&mut dyn InstructionsBuilder<RefBlob>) -> EngineResult<()>,
    ) -> EngineResult<()> {
        self.run(false, f)
    }

    fn physical_run(
        &self,
        f: &mut dyn FnMut(&mut dyn InstructionsBuilder<RefBlob>) -> EngineResult<()>,
    ) -> EngineResult<()> {
        self.run(true, f)
    }
}

struct RefBuilder<'a> {
    state: &'a mut RefState,
}

impl RefBuilder<'_> {
    fn blob_mut(&mut self, blob: &RefBlob) -> EngineResult<&mut StoredBlob> {
        self.state
            .blobs
            .get_mut(&blob.id)
            .ok_or_else(|| EngineError::UnknownBlob(format!("blob {}", blob.id)))
    }
}

fn io_error(err: anyhow::Error) -> EngineError {
    EngineError::execution(format!("{err:#}"))
}

impl InstructionsBuilder<RefBlob> for RefBuilder<'_> {
    fn new_symbol_id(&mut self) -> EngineResult<SymbolId> {
        let id = SymbolId(self.state.next_symbol);
        self.state.next_symbol += 1;
        Ok(id)
    }

    fn new_parallel_desc(&mut self, id: SymbolId, descriptor: &PlacementDescriptor) -> EngineResult<()> {
        self.state.check_fail(FailPoint::NewParallelDesc)?;
        if self.state.parallel_descs.contains_key(&id) {
            return Err(EngineError::execution(format!("symbol {id} is already a parallel desc")));
        }
        self.state.parallel_descs.insert(id, descriptor.clone());
        self.state.stats.parallel_descs_built += 1;
        Ok(())
    }

    fn new_scope(&mut self, id: SymbolId, descriptor: &ScopeDescriptor) -> EngineResult<()> {
        self.state.check_fail(FailPoint::NewScope)?;
        for desc in [descriptor.device_parallel_desc, descriptor.host_parallel_desc] {
            if !self.state.parallel_descs.contains_key(&desc) {
                return Err(EngineError::UnknownSymbol(desc));
            }
        }
        if let Some(parent) = descriptor.parent {
            if !self.state.scopes.contains_key(&parent) {
                return Err(EngineError::UnknownSymbol(parent));
            }
        }
        self.state.scopes.insert(id, descriptor.clone());
        self.state.stats.scopes_built += 1;
        Ok(())
    }

    fn new_variable_blob(&mut self, conf: &VariableConf, parallel_desc: SymbolId) -> EngineResult<RefBlob> {
        self.state.check_fail(FailPoint::NewVariableBlob)?;
        if !self.state.parallel_descs.contains_key(&parallel_desc) {
            return Err(EngineError::UnknownSymbol(parallel_desc));
        }
        let id = self.state.next_blob;
        self.state.next_blob += 1;
        self.state.blobs.insert(
            id,
            StoredBlob {
                name: conf.name.clone(),
                value: HostTensor::zeros(conf.shape.clone(), conf.dtype),
            },
        );
        self.state.stats.blobs_allocated += 1;
        Ok(RefBlob { id })
    }

    fn init_variable_blob(&mut self, blob: &RefBlob, conf: &VariableConf) -> EngineResult<()> {
        let value = initial_value(conf).map_err(io_error)?;
        let stored = self.blob_mut(blob)?;
        stored.value = value;
        self.state.stats.blobs_initialized += 1;
        Ok(())
    }

    fn delete_variable_blob(&mut self, blob: &RefBlob) -> EngineResult<()> {
        let stored = self
            .state
            .blobs
            .remove(&blob.id)
            .ok_or_else(|| EngineError::UnknownBlob(format!("blob {}", blob.id)))?;
        debug!(blob = blob.id, variable = %stored.name, "deleted blob");
        Ok(())
    }

    fn run_op(&mut self, op: &JobOp) -> EngineResult<()> {
        self.state.check_fail(FailPoint::RunOp)?;
        if !self.state.scopes.contains_key(&op.scope_symbol_id) {
            return Err(EngineError::UnknownSymbol(op.scope_symbol_id));
        }
        debug!(op = %op.name(), op_type = op.conf.op_type(), "run op");
        self.state.executed_ops.push(op.name().to_string());
        self.state.stats.ops_executed += 1;
        Ok(())
    }

    fn fetch_blob(&mut self, blob: &RefBlob) -> EngineResult<HostTensor> {
        Ok(self.blob_mut(blob)?.value.clone())
    }

    fn feed_blob(&mut self, blob: &RefBlob, value: HostTensor) -> EngineResult<()> {
        let stored = self.blob_mut(blob)?;
        if stored.value.shape() != value.shape() {
            return Err(EngineError::execution(format!(
                "cannot feed shape {} into blob '{}' of shape {}",
                value.shape(),
                stored.name,
                stored.value.shape()
            )));
        }
        stored.value = value;
        Ok(())
    }

    fn model_io(&mut self, io: &ModelIo, variables: &[VariableConf]) -> EngineResult<()> {
        debug!(?io, variables = variables.len(), "model io");
        match io {
            ModelIo::Init => {
                for conf in variables {
                    let value = initial_value(conf).map_err(io_error)?;
                    self.state.lazy_values.insert(conf.name.clone(), value);
                }
            }
            ModelIo::Save(root) => {
                for conf in variables {
                    let value = self.state.lazy_values.get(&conf.name).ok_or_else(|| {
                        EngineError::execution(format!(
                            "variable '{}' has not been initialized or loaded",
                            conf.name
                        ))
                    })?;
                    write_snapshot_file(&snapshot_path(root, &conf.name), &conf.name, value)
                        .map_err(io_error)?;
                }
            }
            ModelIo::Load(root) => {
                for conf in variables {
                    let value = read_snapshot_file(&snapshot_path(root, &conf.name), &conf.name)
                        .map_err(io_error)?;
                    if value.shape() != &conf.shape {
                        return Err(EngineError::execution(format!(
                            "snapshot of '{}' has shape {} but the variable has shape {}",
                            conf.name,
                            value.shape(),
                            conf.shape
                        )));
                    }
                    self.state.lazy_values.insert(conf.name.clone(), value);
                }
            }
        }
        Ok(())
    }
}
