//! Immutable scopes and the per-session stack of current scope frames.
//!
//! A [`Scope`] captures the device placement, its host companion, the distribution view
//! and free-form attributes that every op built while it is current inherits. Scopes are
//! interned by their [`ScopeDescriptor`] and never edited: nesting derives a new descriptor
//! that points at the parent.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::placement::{DeviceTag, Hierarchy, PlacementDescriptor};
use crate::symbol::{Symbol, SymbolId, Symbolic};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScopeError {
    #[error("scope stack is empty; the session has not been initialized")]
    EmptyStack,
    #[error("scope stack is already initialized")]
    AlreadyInitialized,
    #[error("scope stack mismatch: expected {expected} but found {found}")]
    StackMismatch { expected: SymbolId, found: SymbolId },
    #[error("the root scope cannot be popped")]
    PopRoot,
    #[error("unknown scope attribute '{name}'")]
    UnknownAttr { name: String },
    #[error("scope attribute '{name}' expects a {expected} value, got {found}")]
    AttrTypeMismatch {
        name: String,
        expected: &'static str,
        found: &'static str,
    },
}

/// Value of a scope attribute.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Int64(i64),
    Double(f64),
    String(String),
}

impl AttrValue {
    pub fn kind_name(&self) -> &'static str {
        match self {
            AttrValue::Bool(_) => "bool",
            AttrValue::Int64(_) => "int64",
            AttrValue::Double(_) => "double",
            AttrValue::String(_) => "string",
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttrValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AttrValue::Int64(v) => Some(*v),
            _ => None,
        }
    }
}

// Doubles compare by bit pattern so descriptors stay usable as hash keys.
impl PartialEq for AttrValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (AttrValue::Bool(a), AttrValue::Bool(b)) => a == b,
            (AttrValue::Int64(a), AttrValue::Int64(b)) => a == b,
            (AttrValue::Double(a), AttrValue::Double(b)) => a.to_bits() == b.to_bits(),
            (AttrValue::String(a), AttrValue::String(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for AttrValue {}

impl Hash for AttrValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            AttrValue::Bool(v) => v.hash(state),
            AttrValue::Int64(v) => v.hash(state),
            AttrValue::Double(v) => v.to_bits().hash(state),
            AttrValue::String(v) => v.hash(state),
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Bool(v) => write!(f, "{v}"),
            AttrValue::Int64(v) => write!(f, "{v}"),
            AttrValue::Double(v) => write!(f, "{v}"),
            AttrValue::String(v) => write!(f, "{v:?}"),
        }
    }
}

impl From<bool> for AttrValue {
    fn from(value: bool) -> Self {
        AttrValue::Bool(value)
    }
}

impl From<i64> for AttrValue {
    fn from(value: i64) -> Self {
        AttrValue::Int64(value)
    }
}

impl From<f64> for AttrValue {
    fn from(value: f64) -> Self {
        AttrValue::Double(value)
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        AttrValue::String(value.to_string())
    }
}

/// Content key of a scope. Equal descriptors intern to the same [`Scope`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScopeDescriptor {
    pub parent: Option<SymbolId>,
    pub job_name: String,
    pub device_parallel_desc: SymbolId,
    pub host_parallel_desc: SymbolId,
    pub is_mirrored: bool,
    pub attrs: BTreeMap<String, AttrValue>,
}

/// Interned, immutable scope.
#[derive(Debug)]
pub struct Scope {
    symbol_id: SymbolId,
    descriptor: ScopeDescriptor,
    placement: Arc<Symbol<PlacementDescriptor>>,
    host_placement: Arc<Symbol<PlacementDescriptor>>,
    parent: Weak<Scope>,
}

impl Scope {
    pub(crate) fn new(
        symbol_id: SymbolId,
        descriptor: ScopeDescriptor,
        placement: Arc<Symbol<PlacementDescriptor>>,
        host_placement: Arc<Symbol<PlacementDescriptor>>,
        parent: Weak<Scope>,
    ) -> Self {
        debug_assert_eq!(descriptor.device_parallel_desc, placement.id());
        debug_assert_eq!(descriptor.host_parallel_desc, host_placement.id());
        Scope {
            symbol_id,
            descriptor,
            placement,
            host_placement,
            parent,
        }
    }

    pub fn symbol_id(&self) -> SymbolId {
        self.symbol_id
    }

    pub fn descriptor(&self) -> &ScopeDescriptor {
        &self.descriptor
    }

    pub fn job_name(&self) -> &str {
        &self.descriptor.job_name
    }

    pub fn is_mirrored(&self) -> bool {
        self.descriptor.is_mirrored
    }

    pub fn placement(&self) -> &Arc<Symbol<PlacementDescriptor>> {
        &self.placement
    }

    pub fn host_placement(&self) -> &Arc<Symbol<PlacementDescriptor>> {
        &self.host_placement
    }

    pub fn device_tag(&self) -> DeviceTag {
        self.placement.data().device_tag()
    }

    pub fn machine_device_ids(&self) -> Vec<String> {
        self.placement.data().machine_device_ids()
    }

    pub fn hierarchy(&self) -> Option<&Hierarchy> {
        self.placement.data().hierarchy()
    }

    pub fn attr(&self, name: &str) -> Option<&AttrValue> {
        self.descriptor.attrs.get(name)
    }

    pub fn attrs(&self) -> &BTreeMap<String, AttrValue> {
        &self.descriptor.attrs
    }

    /// Enclosing scope; `None` for a root scope.
    pub fn parent(&self) -> Option<Arc<Scope>> {
        self.parent.upgrade()
    }
}

impl Symbolic for Scope {
    fn symbol_id(&self) -> SymbolId {
        self.symbol_id
    }
}

/// Stack of current scopes for one session.
#[derive(Debug, Default)]
pub struct ScopeStack {
    frames: RefCell<Vec<Arc<Scope>>>,
}

impl ScopeStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the root frame.
    pub fn init(&self, root: Arc<Scope>) -> Result<(), ScopeError> {
        let mut frames = self.frames.borrow_mut();
        if !frames.is_empty() {
            return Err(ScopeError::AlreadyInitialized);
        }
        frames.push(root);
        Ok(())
    }

    pub fn current(&self) -> Result<Arc<Scope>, ScopeError> {
        self.frames
            .borrow()
            .last()
            .cloned()
            .ok_or(ScopeError::EmptyStack)
    }

    pub fn depth(&self) -> usize {
        self.frames.borrow().len()
    }

    pub fn push(&self, scope: Arc<Scope>) {
        tracing::debug!(scope = %scope.symbol_id(), depth = self.depth() + 1, "push scope");
        self.frames.borrow_mut().push(scope);
    }

    /// Pops `expected_top`, checking that `expected_prior` becomes current again.
    ///
    /// On mismatch the stack is left untouched.
    pub fn pop(&self, expected_top: &Arc<Scope>, expected_prior: &Arc<Scope>) -> Result<(), ScopeError> {
        let mut frames = self.frames.borrow_mut();
        let depth = frames.len();
        if depth == 0 {
            return Err(ScopeError::EmptyStack);
        }
        if depth == 1 {
            return Err(ScopeError::PopRoot);
        }
        let top = &frames[depth - 1];
        if !Arc::ptr_eq(top, expected_top) {
            return Err(ScopeError::StackMismatch {
                expected: expected_top.symbol_id(),
                found: top.symbol_id(),
            });
        }
        let prior = &frames[depth - 2];
        if !Arc::ptr_eq(prior, expected_prior) {
            return Err(ScopeError::StackMismatch {
                expected: expected_prior.symbol_id(),
                found: prior.symbol_id(),
            });
        }
        frames.pop();
        tracing::debug!(scope = %expected_top.symbol_id(), depth = depth - 1, "pop scope");
        Ok(())
    }

    pub(crate) fn clear(&self) {
        self.frames.borrow_mut().clear();
    }

    /// Pushes `scope` and returns a guard that pops it again.
    pub fn enter(&self, scope: Arc<Scope>) -> Result<ScopeGuard<'_>, ScopeError> {
        let prior = self.current()?;
        self.push(Arc::clone(&scope));
        Ok(ScopeGuard {
            stack: self,
            scope,
            prior,
            active: true,
        })
    }
}

/// RAII guard that keeps a scope current.
///
/// Dropping the guard pops the scope and panics if it is no longer on top. Use
/// [`ScopeGuard::exit`] to receive the mismatch as an error instead.
pub struct ScopeGuard<'a> {
    stack: &'a ScopeStack,
    scope: Arc<Scope>,
    prior: Arc<Scope>,
    active: bool,
}

impl ScopeGuard<'_> {
    pub fn scope(&self) -> &Arc<Scope> {
        &self.scope
    }

    pub fn exit(mut self) -> Result<(), ScopeError> {
        self.active = false;
        self.stack.pop(&self.scope, &self.prior)
    }
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        // The stack is emptied when the owning session closes.
        if !self.active || self.stack.depth() == 0 {
            return;
        }
        if let Err(err) = self.stack.pop(&self.scope, &self.prior) {
            if !std::thread::panicking() {
                panic!("scope guard dropped out of order: {err}");
            }
        }
    }
}
