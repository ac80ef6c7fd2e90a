//! Content-addressed interning of native descriptor objects.
//!
//! Every descriptor the session hands to the engine (placements, scopes) is interned here
//! first. Equal descriptors resolve to the same shared entry, so the engine-side
//! construction runs once per distinct descriptor for the lifetime of the table.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

/// Stable identifier handed out by the engine for each constructed object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymbolId(pub u64);

impl fmt::Display for SymbolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Anything stored in a [`SymbolTable`] must report the id it was constructed under.
pub trait Symbolic {
    fn symbol_id(&self) -> SymbolId;
}

/// Immutable descriptor paired with the id of its engine-side counterpart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol<D> {
    id: SymbolId,
    data: D,
}

impl<D> Symbol<D> {
    pub fn new(id: SymbolId, data: D) -> Self {
        Symbol { id, data }
    }

    pub fn id(&self) -> SymbolId {
        self.id
    }

    pub fn data(&self) -> &D {
        &self.data
    }
}

impl<D> Symbolic for Symbol<D> {
    fn symbol_id(&self) -> SymbolId {
        self.id
    }
}

/// Interning table keyed by descriptor content.
///
/// Entries are only committed after the caller-supplied builder succeeds; a failing builder
/// leaves the table exactly as it was.
pub struct SymbolTable<D, T = Symbol<D>> {
    by_descriptor: HashMap<D, Arc<T>>,
    by_id: HashMap<SymbolId, Arc<T>>,
}

impl<D, T> SymbolTable<D, T>
where
    D: Hash + Eq,
    T: Symbolic,
{
    pub fn new() -> Self {
        SymbolTable {
            by_descriptor: HashMap::new(),
            by_id: HashMap::new(),
        }
    }

    /// Returns the entry for `descriptor`, running `build` only when no equal descriptor has
    /// been interned yet.
    pub fn intern_with<E, F>(&mut self, descriptor: D, build: F) -> Result<Arc<T>, E>
    where
        F: FnOnce(&D) -> Result<T, E>,
    {
        if let Some(existing) = self.by_descriptor.get(&descriptor) {
            return Ok(Arc::clone(existing));
        }

        let value = Arc::new(build(&descriptor)?);
        let id = value.symbol_id();
        assert!(
            !self.by_id.contains_key(&id),
            "symbol id {id} was handed out twice by the engine"
        );
        self.by_id.insert(id, Arc::clone(&value));
        self.by_descriptor.insert(descriptor, Arc::clone(&value));
        Ok(value)
    }

    pub fn lookup(&self, descriptor: &D) -> Option<Arc<T>> {
        self.by_descriptor.get(descriptor).cloned()
    }

    pub fn get(&self, id: SymbolId) -> Option<Arc<T>> {
        self.by_id.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

impl<D, T> Default for SymbolTable<D, T>
where
    D: Hash + Eq,
    T: Symbolic,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    struct Desc {
        tag: &'static str,
        devices: Vec<u32>,
    }

    fn desc(tag: &'static str, devices: &[u32]) -> Desc {
        Desc {
            tag,
            devices: devices.to_vec(),
        }
    }

    #[test]
    fn equal_descriptors_share_one_entry() {
        let mut table: SymbolTable<Desc> = SymbolTable::new();
        let mut builds = 0u64;
        let mut build = |d: &Desc| -> Result<Symbol<Desc>, ()> {
            builds += 1;
            Ok(Symbol::new(SymbolId(builds), d.clone()))
        };

        let a = table.intern_with(desc("gpu", &[0, 1]), &mut build).unwrap();
        let b = table.intern_with(desc("gpu", &[0, 1]), &mut build).unwrap();
        let c = table.intern_with(desc("cpu", &[0, 1]), &mut build).unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
        assert_eq!(builds, 2);
        assert_eq!(table.len(), 2);
        assert!(Arc::ptr_eq(&table.get(a.id()).unwrap(), &a));
    }

    #[test]
    fn failing_builder_commits_nothing() {
        let mut table: SymbolTable<Desc> = SymbolTable::new();
        let err = table
            .intern_with(desc("gpu", &[3]), |_| -> Result<Symbol<Desc>, &str> {
                Err("native construction failed")
            })
            .unwrap_err();
        assert_eq!(err, "native construction failed");
        assert!(table.is_empty());
        assert!(table.lookup(&desc("gpu", &[3])).is_none());

        let retried = table
            .intern_with(desc("gpu", &[3]), |d| -> Result<_, &str> {
                Ok(Symbol::new(SymbolId(7), d.clone()))
            })
            .unwrap();
        assert_eq!(retried.id(), SymbolId(7));
        assert_eq!(table.len(), 1);
    }
}
