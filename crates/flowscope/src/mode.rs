//! Mode flags, predicate combinators and exactly-one-candidate dispatch.
//!
//! Every mode-dependent entry point either resolves an [`ExecutionMode`] once and matches on
//! it, or selects among named candidates with [`unique`], which refuses to guess when the
//! current flags match none or several of them.

use std::fmt;
use std::ops::{BitAnd, BitOr, Not};

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("no implementation of '{op}' matches the current mode ({flags})")]
    NoMatch { op: &'static str, flags: ModeFlags },
    #[error("multiple implementations of '{op}' match the current mode ({flags}): {candidates:?}")]
    MultipleMatches {
        op: &'static str,
        candidates: Vec<&'static str>,
        flags: ModeFlags,
    },
    #[error("'{op}' is not supported in {mode} mode")]
    Unsupported { op: &'static str, mode: ExecutionMode },
}

/// Individual boolean the dispatcher can test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeFlag {
    EnvInitialized,
    SessionInitialized,
    EagerExecutionEnabled,
    InGlobalMode,
    InNormalMode,
}

/// Normal mode is top-level code; global mode is code running inside a job being built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RuntimeMode {
    #[default]
    Normal,
    Global,
}

/// Snapshot of the flags predicates are evaluated against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModeFlags {
    pub env_initialized: bool,
    pub session_initialized: bool,
    pub eager_execution_enabled: bool,
    pub runtime_mode: RuntimeMode,
}

impl ModeFlags {
    pub fn get(&self, flag: ModeFlag) -> bool {
        match flag {
            ModeFlag::EnvInitialized => self.env_initialized,
            ModeFlag::SessionInitialized => self.session_initialized,
            ModeFlag::EagerExecutionEnabled => self.eager_execution_enabled,
            ModeFlag::InGlobalMode => self.runtime_mode == RuntimeMode::Global,
            ModeFlag::InNormalMode => self.runtime_mode == RuntimeMode::Normal,
        }
    }
}

impl fmt::Display for ModeFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "env_initialized={} session_initialized={} eager={} mode={:?}",
            self.env_initialized,
            self.session_initialized,
            self.eager_execution_enabled,
            self.runtime_mode
        )
    }
}

/// Pure boolean combinator over [`ModeFlag`]s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    Always,
    Flag(ModeFlag),
    Not(Box<Predicate>),
    And(Box<Predicate>, Box<Predicate>),
    Or(Box<Predicate>, Box<Predicate>),
}

impl Predicate {
    pub fn eval(&self, flags: &ModeFlags) -> bool {
        match self {
            Predicate::Always => true,
            Predicate::Flag(flag) => flags.get(*flag),
            Predicate::Not(inner) => !inner.eval(flags),
            Predicate::And(lhs, rhs) => lhs.eval(flags) && rhs.eval(flags),
            Predicate::Or(lhs, rhs) => lhs.eval(flags) || rhs.eval(flags),
        }
    }
}

impl BitAnd for Predicate {
    type Output = Predicate;

    fn bitand(self, rhs: Predicate) -> Predicate {
        Predicate::And(Box::new(self), Box::new(rhs))
    }
}

impl BitOr for Predicate {
    type Output = Predicate;

    fn bitor(self, rhs: Predicate) -> Predicate {
        Predicate::Or(Box::new(self), Box::new(rhs))
    }
}

impl Not for Predicate {
    type Output = Predicate;

    fn not(self) -> Predicate {
        Predicate::Not(Box::new(self))
    }
}

/// Building blocks for dispatch predicates.
pub mod hob {
    use super::{ModeFlag, Predicate};

    pub const ENV_INITIALIZED: Predicate = Predicate::Flag(ModeFlag::EnvInitialized);
    pub const SESSION_INITIALIZED: Predicate = Predicate::Flag(ModeFlag::SessionInitialized);
    pub const EAGER_EXECUTION_ENABLED: Predicate = Predicate::Flag(ModeFlag::EagerExecutionEnabled);
    pub const IN_GLOBAL_MODE: Predicate = Predicate::Flag(ModeFlag::InGlobalMode);
    pub const IN_NORMAL_MODE: Predicate = Predicate::Flag(ModeFlag::InNormalMode);
}

/// Named implementation guarded by a predicate.
pub struct Candidate<F> {
    pub name: &'static str,
    pub predicate: Predicate,
    pub implementation: F,
}

impl<F> Candidate<F> {
    pub fn new(name: &'static str, predicate: Predicate, implementation: F) -> Self {
        Candidate {
            name,
            predicate,
            implementation,
        }
    }
}

/// Returns the single candidate whose predicate holds under `flags`.
pub fn unique<F>(
    op: &'static str,
    flags: &ModeFlags,
    candidates: Vec<Candidate<F>>,
) -> Result<F, DispatchError> {
    let mut matched: Vec<Candidate<F>> = candidates
        .into_iter()
        .filter(|candidate| candidate.predicate.eval(flags))
        .collect();
    match matched.len() {
        0 => Err(DispatchError::NoMatch { op, flags: *flags }),
        1 => {
            let selected = matched.remove(0);
            tracing::trace!(op, implementation = selected.name, "dispatch");
            Ok(selected.implementation)
        }
        _ => Err(DispatchError::MultipleMatches {
            op,
            candidates: matched.iter().map(|c| c.name).collect(),
            flags: *flags,
        }),
    }
}

/// Lazy/eager crossed with normal/global, resolved once per dispatch point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    LazyNormal,
    LazyGlobal,
    EagerNormal,
    EagerGlobal,
}

impl ExecutionMode {
    pub fn from_flags(flags: &ModeFlags) -> Self {
        match (flags.eager_execution_enabled, flags.runtime_mode) {
            (false, RuntimeMode::Normal) => ExecutionMode::LazyNormal,
            (false, RuntimeMode::Global) => ExecutionMode::LazyGlobal,
            (true, RuntimeMode::Normal) => ExecutionMode::EagerNormal,
            (true, RuntimeMode::Global) => ExecutionMode::EagerGlobal,
        }
    }

    pub fn is_eager(self) -> bool {
        matches!(self, ExecutionMode::EagerNormal | ExecutionMode::EagerGlobal)
    }

    pub fn is_global(self) -> bool {
        matches!(self, ExecutionMode::LazyGlobal | ExecutionMode::EagerGlobal)
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecutionMode::LazyNormal => "lazy normal",
            ExecutionMode::LazyGlobal => "lazy global",
            ExecutionMode::EagerNormal => "eager normal",
            ExecutionMode::EagerGlobal => "eager global",
        };
        f.write_str(name)
    }
}
