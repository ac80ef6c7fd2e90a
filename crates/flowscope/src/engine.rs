//! Binding to the native engine that owns kernels, blobs and parallel descriptors.
//!
//! The session never talks to the engine directly: it submits closures through
//! [`NativeEngine::logical_run`] (symbol and graph construction) or
//! [`NativeEngine::physical_run`] (blob transfers), and the engine hands each closure an
//! [`InstructionsBuilder`] bound to its instruction stream.

use std::fmt;
use std::path::PathBuf;

use crate::job::JobOp;
use crate::placement::PlacementDescriptor;
use crate::scope::ScopeDescriptor;
use crate::symbol::SymbolId;
use crate::tensor::HostTensor;
use crate::variable::VariableConf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    Unimplemented { op: &'static str, reason: String },
    Execution { message: String },
    UnknownSymbol(SymbolId),
    UnknownBlob(String),
}

impl EngineError {
    pub fn unimplemented(op: &'static str, reason: impl Into<String>) -> Self {
        EngineError::Unimplemented {
            op,
            reason: reason.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        EngineError::Execution {
            message: message.into(),
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Unimplemented { op, reason } => {
                write!(f, "{op} is not implemented: {reason}")
            }
            EngineError::Execution { message } => {
                write!(f, "engine execution failure: {message}")
            }
            EngineError::UnknownSymbol(id) => write!(f, "engine has no symbol {id}"),
            EngineError::UnknownBlob(blob) => write!(f, "engine has no blob {blob}"),
        }
    }
}

impl std::error::Error for EngineError {}

pub type EngineResult<T> = Result<T, EngineError>;

/// Whole-model persistence request used by lazily built jobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelIo {
    Init,
    Save(PathBuf),
    Load(PathBuf),
}

/// Primitive instructions available inside a logical or physical run.
pub trait InstructionsBuilder<H> {
    fn new_symbol_id(&mut self) -> EngineResult<SymbolId>;

    fn new_parallel_desc(&mut self, id: SymbolId, descriptor: &PlacementDescriptor) -> EngineResult<()>;

    fn new_scope(&mut self, id: SymbolId, descriptor: &ScopeDescriptor) -> EngineResult<()>;

    /// Allocates storage for a variable on the devices of `parallel_desc`.
    fn new_variable_blob(&mut self, conf: &VariableConf, parallel_desc: SymbolId) -> EngineResult<H>;

    /// Runs the variable's initializer, or restores it from its snapshot source.
    fn init_variable_blob(&mut self, blob: &H, conf: &VariableConf) -> EngineResult<()>;

    /// Releases a blob allocated by [`InstructionsBuilder::new_variable_blob`].
    fn delete_variable_blob(&mut self, blob: &H) -> EngineResult<()>;

    fn run_op(&mut self, op: &JobOp) -> EngineResult<()>;

    fn fetch_blob(&mut self, blob: &H) -> EngineResult<HostTensor>;

    fn feed_blob(&mut self, blob: &H, value: HostTensor) -> EngineResult<()>;

    fn model_io(&mut self, io: &ModelIo, variables: &[VariableConf]) -> EngineResult<()>;
}

/// Native engine contract.
pub trait NativeEngine: Send + Sync {
    type BlobHandle: Clone + Send + Sync + fmt::Debug + 'static;

    /// Human-readable engine identifier.
    fn engine_name(&self) -> &str;

    /// Number of GPUs per node. Zero means GPU placements fall back to CPU.
    fn gpu_device_count(&self) -> usize;

    /// Executes `f` against the logical (symbol/graph construction) instruction stream.
    fn logical_run(
        &self,
        f: &mut dyn FnMut(&mut dyn InstructionsBuilder<Self::BlobHandle>) -> EngineResult<()>,
    ) -> EngineResult<()>;

    /// Executes `f` against the physical (blob transfer) instruction stream.
    fn physical_run(
        &self,
        f: &mut dyn FnMut(&mut dyn InstructionsBuilder<Self::BlobHandle>) -> EngineResult<()>,
    ) -> EngineResult<()>;
}

/// Runs `f` once inside a logical run and returns its result.
pub fn logical_run<E, R, F>(engine: &E, f: F) -> EngineResult<R>
where
    E: NativeEngine,
    F: FnOnce(&mut dyn InstructionsBuilder<E::BlobHandle>) -> EngineResult<R>,
{
    let mut pending = Some(f);
    let mut output = None;
    engine.logical_run(&mut |builder: &mut dyn InstructionsBuilder<E::BlobHandle>| {
        run_once(&mut pending, &mut output, builder)
    })?;
    output.ok_or_else(|| EngineError::execution("logical run finished without invoking the builder"))
}

/// Runs `f` once inside a physical run and returns its result.
pub fn physical_run<E, R, F>(engine: &E, f: F) -> EngineResult<R>
where
    E: NativeEngine,
    F: FnOnce(&mut dyn InstructionsBuilder<E::BlobHandle>) -> EngineResult<R>,
{
    let mut pending = Some(f);
    let mut output = None;
    engine.physical_run(&mut |builder: &mut dyn InstructionsBuilder<E::BlobHandle>| {
        run_once(&mut pending, &mut output, builder)
    })?;
    output.ok_or_else(|| EngineError::execution("physical run finished without invoking the builder"))
}

fn run_once<H, R, F>(
    pending: &mut Option<F>,
    output: &mut Option<R>,
    builder: &mut dyn InstructionsBuilder<H>,
) -> EngineResult<()>
where
    F: FnOnce(&mut dyn InstructionsBuilder<H>) -> EngineResult<R>,
{
    let f = pending
        .take()
        .ok_or_else(|| EngineError::execution("instruction builder invoked more than once"))?;
    *output = Some(f(builder)?);
    Ok(())
}
