use thiserror::Error;

use crate::engine::EngineError;
use crate::job::JobError;
use crate::mode::DispatchError;
use crate::placement::PlacementError;
use crate::scope::ScopeError;
use crate::session::SessionError;
use crate::variable::VariableError;

/// Error returned by session-level operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Placement(#[from] PlacementError),
    #[error(transparent)]
    Scope(#[from] ScopeError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Variable(#[from] VariableError),
    #[error(transparent)]
    Job(#[from] JobError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

pub type Result<T> = std::result::Result<T, Error>;
