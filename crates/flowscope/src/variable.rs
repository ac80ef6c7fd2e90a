//! Variable descriptions, blob handles and the per-session variable stash.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tensor::{DType, Shape};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VariableError {
    #[error(
        "variable '{name}' already exists in job '{job_name}'; getting the same variable is not allowed when reuse is false"
    )]
    AlreadyExists { name: String, job_name: String },
    #[error("variable '{name}' is registered inconsistently between job '{job_name}' and the session")]
    InconsistentRegistration { name: String, job_name: String },
    #[error(
        "variable '{name}' already exists as {existing_dtype} {existing_shape:?} but job '{job_name}' requests {requested_dtype} {requested_shape:?}"
    )]
    Incompatible {
        name: String,
        job_name: String,
        existing_shape: Vec<usize>,
        existing_dtype: DType,
        requested_shape: Vec<usize>,
        requested_dtype: DType,
    },
    #[error("variable '{name}' has invalid shape {shape:?}; every dimension must be positive")]
    InvalidShape { name: String, shape: Vec<usize> },
    #[error("variable '{name}' has no engine blob; it belongs to a lazily built job")]
    NotMaterialized { name: String },
    #[error("variable name must not be empty")]
    EmptyName,
    #[error("unknown variable '{name}'")]
    UnknownVariable { name: String },
    #[error("invalid distribute '{0}', expected \"B\" or \"S(<axis>)\"")]
    InvalidDistribute(String),
}

/// How a freshly allocated variable is filled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Initializer {
    Constant { value: f32 },
    Zeros,
    Ones,
    RandomUniform { min: f32, max: f32 },
    RandomNormal { mean: f32, std: f32 },
    TruncatedNormal { mean: f32, std: f32 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Regularizer {
    pub l1: f32,
    pub l2: f32,
}

impl Regularizer {
    pub fn l1(scale: f32) -> Self {
        Regularizer { l1: scale, l2: 0.0 }
    }

    pub fn l2(scale: f32) -> Self {
        Regularizer { l1: 0.0, l2: scale }
    }
}

/// Per-axis distribution of a consistent blob across its placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Distribute {
    Split(usize),
    Broadcast,
}

impl Distribute {
    /// Parses a comma-separated list such as `"S(0),B"`.
    pub fn parse_list(raw: &str) -> Result<Vec<Distribute>, VariableError> {
        raw.split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(str::parse::<Distribute>)
            .collect()
    }
}

impl fmt::Display for Distribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Distribute::Split(axis) => write!(f, "S({axis})"),
            Distribute::Broadcast => f.write_str("B"),
        }
    }
}

impl FromStr for Distribute {
    type Err = VariableError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        if raw == "B" {
            return Ok(Distribute::Broadcast);
        }
        raw.strip_prefix("S(")
            .and_then(|rest| rest.strip_suffix(')'))
            .and_then(|axis| axis.trim().parse().ok())
            .map(Distribute::Split)
            .ok_or_else(|| VariableError::InvalidDistribute(raw.to_string()))
    }
}

/// Snapshot file a variable is restored from instead of running its initializer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotSource {
    pub path: PathBuf,
    pub key: String,
}

impl SnapshotSource {
    pub fn file_path(&self) -> PathBuf {
        self.path.join(&self.key)
    }
}

/// Fully resolved variable construction op.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableConf {
    pub name: String,
    pub shape: Shape,
    pub dtype: DType,
    pub initializer: Option<Initializer>,
    pub regularizer: Option<Regularizer>,
    pub trainable: bool,
    pub model_name: String,
    pub random_seed: Option<u64>,
    pub parallel_distribution: Vec<Distribute>,
    pub snapshot: Option<SnapshotSource>,
}

impl VariableConf {
    pub fn logical_blob_name(&self) -> String {
        logical_blob_name(&self.name)
    }
}

pub(crate) fn logical_blob_name(name: &str) -> String {
    format!("{name}/out")
}

/// Arguments of a `get_variable` call.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableSpec {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: DType,
    pub initializer: Option<Initializer>,
    pub regularizer: Option<Regularizer>,
    pub trainable: Option<bool>,
    pub model_name: Option<String>,
    pub random_seed: Option<u64>,
    pub parallel_distribution: Vec<Distribute>,
    pub reuse: bool,
}

impl VariableSpec {
    pub fn new(name: impl Into<String>, shape: impl Into<Vec<usize>>) -> Self {
        VariableSpec {
            name: name.into(),
            shape: shape.into(),
            dtype: DType::F32,
            initializer: None,
            regularizer: None,
            trainable: None,
            model_name: None,
            random_seed: None,
            parallel_distribution: Vec::new(),
            reuse: true,
        }
    }

    pub fn dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    pub fn initializer(mut self, initializer: Initializer) -> Self {
        self.initializer = Some(initializer);
        self
    }

    pub fn regularizer(mut self, regularizer: Regularizer) -> Self {
        self.regularizer = Some(regularizer);
        self
    }

    pub fn trainable(mut self, trainable: bool) -> Self {
        self.trainable = Some(trainable);
        self
    }

    pub fn model_name(mut self, model_name: impl Into<String>) -> Self {
        self.model_name = Some(model_name.into());
        self
    }

    pub fn random_seed(mut self, seed: u64) -> Self {
        self.random_seed = Some(seed);
        self
    }

    pub fn distribute(mut self, distribute: Vec<Distribute>) -> Self {
        self.parallel_distribution = distribute;
        self
    }

    pub fn reuse(mut self, reuse: bool) -> Self {
        self.reuse = reuse;
        self
    }

    /// Resolves the op description for `full_name` (the name-scope-prefixed name).
    pub(crate) fn into_conf(
        self,
        full_name: String,
        default_trainable: bool,
        snapshot: Option<SnapshotSource>,
    ) -> Result<VariableConf, VariableError> {
        let shape = Shape::try_new(self.shape.clone()).ok_or_else(|| VariableError::InvalidShape {
            name: full_name.clone(),
            shape: self.shape.clone(),
        })?;
        // A snapshot replaces the initializer entirely.
        let initializer = if snapshot.is_some() {
            None
        } else {
            self.initializer
        };
        Ok(VariableConf {
            name: full_name,
            shape,
            dtype: self.dtype,
            initializer,
            regularizer: self.regularizer,
            trainable: self.trainable.unwrap_or(default_trainable),
            model_name: self.model_name.unwrap_or_else(|| "weight".to_string()),
            random_seed: self.random_seed,
            parallel_distribution: self.parallel_distribution,
            snapshot,
        })
    }
}

/// Lazy blobs only name a graph node; eager blobs own an engine handle.
#[derive(Debug, Clone)]
pub enum BlobKind<H> {
    Lazy,
    Eager(H),
}

/// Variable output blob returned by `get_variable`.
#[derive(Debug)]
pub struct VariableBlob<H> {
    conf: VariableConf,
    logical_blob_name: String,
    job_name: String,
    kind: BlobKind<H>,
}

impl<H> VariableBlob<H> {
    pub(crate) fn new(conf: VariableConf, job_name: impl Into<String>, kind: BlobKind<H>) -> Self {
        let logical_blob_name = conf.logical_blob_name();
        VariableBlob {
            conf,
            logical_blob_name,
            job_name: job_name.into(),
            kind,
        }
    }

    pub fn name(&self) -> &str {
        &self.conf.name
    }

    pub fn logical_blob_name(&self) -> &str {
        &self.logical_blob_name
    }

    pub fn shape(&self) -> &Shape {
        &self.conf.shape
    }

    pub fn dtype(&self) -> DType {
        self.conf.dtype
    }

    /// Job that first created the blob.
    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    pub fn conf(&self) -> &VariableConf {
        &self.conf
    }

    pub fn kind(&self) -> &BlobKind<H> {
        &self.kind
    }

    pub fn is_lazy(&self) -> bool {
        matches!(self.kind, BlobKind::Lazy)
    }

    pub fn handle(&self) -> Option<&H> {
        match &self.kind {
            BlobKind::Eager(handle) => Some(handle),
            BlobKind::Lazy => None,
        }
    }

    /// Eager blobs are identical only as the same object; lazy blobs when they name the same
    /// logical blob with the same shape and dtype.
    pub fn identical_to(self: &Arc<Self>, other: &Arc<Self>) -> bool {
        if Arc::ptr_eq(self, other) {
            return true;
        }
        self.is_lazy()
            && other.is_lazy()
            && self.logical_blob_name == other.logical_blob_name
            && self.conf.shape == other.conf.shape
            && self.conf.dtype == other.conf.dtype
    }

    /// Fails unless a request for `shape` and `dtype` can be served by this blob.
    pub(crate) fn check_compatible(
        &self,
        job_name: &str,
        shape: &[usize],
        dtype: DType,
    ) -> Result<(), VariableError> {
        if self.conf.shape.dims() == shape && self.conf.dtype == dtype {
            return Ok(());
        }
        Err(VariableError::Incompatible {
            name: self.conf.name.clone(),
            job_name: job_name.to_string(),
            existing_shape: self.conf.shape.dims().to_vec(),
            existing_dtype: self.conf.dtype,
            requested_shape: shape.to_vec(),
            requested_dtype: dtype,
        })
    }
}

type BlobMap<H> = BTreeMap<String, Arc<VariableBlob<H>>>;

/// Session-wide and per-job variable registrations.
#[derive(Debug)]
pub struct VariableStash<H> {
    var_name2var_blob: BlobMap<H>,
    job_name2var_name2var_blob: BTreeMap<String, BlobMap<H>>,
}

impl<H> VariableStash<H> {
    pub fn new() -> Self {
        VariableStash {
            var_name2var_blob: BTreeMap::new(),
            job_name2var_name2var_blob: BTreeMap::new(),
        }
    }

    /// Returns `(session_blob, job_blob)` for `name`.
    pub fn try_get(
        &self,
        job_name: &str,
        name: &str,
    ) -> (Option<Arc<VariableBlob<H>>>, Option<Arc<VariableBlob<H>>>) {
        let var_blob = self.var_name2var_blob.get(name).cloned();
        let job_var_blob = self
            .job_name2var_name2var_blob
            .get(job_name)
            .and_then(|vars| vars.get(name))
            .cloned();
        (var_blob, job_var_blob)
    }

    /// Registers `blob` for `job_name`, and session-wide if no blob of that name exists yet.
    pub fn stash(&mut self, job_name: &str, blob: Arc<VariableBlob<H>>) -> Result<(), VariableError> {
        let name = blob.name().to_string();
        let job_vars = self
            .job_name2var_name2var_blob
            .entry(job_name.to_string())
            .or_default();
        if job_vars.contains_key(&name) {
            return Err(VariableError::AlreadyExists {
                name,
                job_name: job_name.to_string(),
            });
        }
        job_vars.insert(name.clone(), Arc::clone(&blob));
        self.var_name2var_blob.entry(name).or_insert(blob);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<VariableBlob<H>>> {
        self.var_name2var_blob.get(name).cloned()
    }

    /// Session-wide variables ordered by name.
    pub fn variables(&self) -> Vec<Arc<VariableBlob<H>>> {
        self.var_name2var_blob.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.var_name2var_blob.len()
    }

    pub fn is_empty(&self) -> bool {
        self.var_name2var_blob.is_empty()
    }

    pub fn clear(&mut self) {
        self.var_name2var_blob.clear();
        self.job_name2var_name2var_blob.clear();
    }
}

impl<H> Default for VariableStash<H> {
    fn default() -> Self {
        Self::new()
    }
}

/// Logical blob name to eager blob, consulted by gradient construction.
#[derive(Debug)]
pub struct BlobRegister<H> {
    blobs: BTreeMap<String, Arc<VariableBlob<H>>>,
}

impl<H> BlobRegister<H> {
    pub fn new() -> Self {
        BlobRegister {
            blobs: BTreeMap::new(),
        }
    }

    /// Registers `blob` unless its logical name is already present. Returns whether it was added.
    pub fn try_set(&mut self, blob: &Arc<VariableBlob<H>>) -> bool {
        if self.blobs.contains_key(blob.logical_blob_name()) {
            return false;
        }
        self.blobs
            .insert(blob.logical_blob_name().to_string(), Arc::clone(blob));
        true
    }

    pub fn get(&self, logical_blob_name: &str) -> Option<Arc<VariableBlob<H>>> {
        self.blobs.get(logical_blob_name).cloned()
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    pub fn clear(&mut self) {
        self.blobs.clear();
    }
}

impl<H> Default for BlobRegister<H> {
    fn default() -> Self {
        Self::new()
    }
}

/// Prefix applied to variable names created under `scopes`.
pub fn name_scope_prefix(scopes: &[String]) -> String {
    if scopes.is_empty() {
        String::new()
    } else {
        format!("{}-", scopes.join("-"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lazy(name: &str, job: &str) -> Arc<VariableBlob<u32>> {
        lazy_shaped(name, job, vec![4], DType::F32)
    }

    fn lazy_shaped(name: &str, job: &str, shape: Vec<usize>, dtype: DType) -> Arc<VariableBlob<u32>> {
        let conf = VariableSpec::new(name, shape)
            .dtype(dtype)
            .into_conf(name.to_string(), true, None)
            .unwrap();
        Arc::new(VariableBlob::new(conf, job, BlobKind::Lazy))
    }

    fn eager(name: &str, job: &str, handle: u32) -> Arc<VariableBlob<u32>> {
        let conf = VariableSpec::new(name, vec![4])
            .into_conf(name.to_string(), true, None)
            .unwrap();
        Arc::new(VariableBlob::new(conf, job, BlobKind::Eager(handle)))
    }

    #[test]
    fn distribute_strings() {
        assert_eq!(
            Distribute::parse_list("S(0), B").unwrap(),
            vec![Distribute::Split(0), Distribute::Broadcast]
        );
        assert_eq!(Distribute::Split(1).to_string(), "S(1)");
        assert!("P".parse::<Distribute>().is_err());
    }

    #[test]
    fn spec_defaults_and_snapshot_override() {
        let conf = VariableSpec::new("w", vec![2, 3])
            .initializer(Initializer::Ones)
            .into_conf("layer-w".to_string(), false, None)
            .unwrap();
        assert_eq!(conf.name, "layer-w");
        assert_eq!(conf.logical_blob_name(), "layer-w/out");
        assert_eq!(conf.dtype, DType::F32);
        assert!(!conf.trainable);
        assert_eq!(conf.model_name, "weight");
        assert_eq!(conf.initializer, Some(Initializer::Ones));

        let snapshot = SnapshotSource {
            path: PathBuf::from("/snap/layer-w"),
            key: "out".to_string(),
        };
        let restored = VariableSpec::new("w", vec![2, 3])
            .initializer(Initializer::Ones)
            .into_conf("layer-w".to_string(), true, Some(snapshot.clone()))
            .unwrap();
        assert_eq!(restored.initializer, None);
        assert_eq!(restored.snapshot, Some(snapshot));

        let err = VariableSpec::new("w", vec![2, 0])
            .into_conf("w".to_string(), true, None)
            .unwrap_err();
        assert!(matches!(err, VariableError::InvalidShape { .. }));
    }

    #[test]
    fn identity_rules_differ_between_lazy_and_eager() {
        assert!(lazy("w", "a").identical_to(&lazy("w", "b")));
        assert!(!lazy("w", "a").identical_to(&lazy("v", "a")));
        let e = eager("w", "a", 1);
        assert!(e.identical_to(&Arc::clone(&e)));
        assert!(!e.identical_to(&eager("w", "a", 1)));

        let w = lazy("w", "a");
        assert!(!w.identical_to(&lazy_shaped("w", "b", vec![8], DType::F32)));
        assert!(!w.identical_to(&lazy_shaped("w", "b", vec![4], DType::I32)));
    }

    #[test]
    fn compatibility_names_both_shapes() {
        let w = lazy("w", "a");
        assert!(w.check_compatible("b", &[4], DType::F32).is_ok());
        let err = w.check_compatible("b", &[2, 2], DType::I32).unwrap_err();
        assert_eq!(
            err,
            VariableError::Incompatible {
                name: "w".to_string(),
                job_name: "b".to_string(),
                existing_shape: vec![4],
                existing_dtype: DType::F32,
                requested_shape: vec![2, 2],
                requested_dtype: DType::I32,
            }
        );
        let message = err.to_string();
        assert!(message.contains("[4]") && message.contains("[2, 2]"), "{message}");
    }

    #[test]
    fn stash_keeps_the_first_session_wide_blob() {
        let mut stash = VariableStash::new();
        let first = lazy("w", "job_a");
        stash.stash("job_a", Arc::clone(&first)).unwrap();

        let (var_blob, job_blob) = stash.try_get("job_b", "w");
        assert!(Arc::ptr_eq(&var_blob.unwrap(), &first));
        assert!(job_blob.is_none());

        stash.stash("job_b", lazy("w", "job_b")).unwrap();
        assert!(Arc::ptr_eq(&stash.get("w").unwrap(), &first));
        assert_eq!(stash.len(), 1);

        let err = stash.stash("job_a", lazy("w", "job_a")).unwrap_err();
        assert_eq!(
            err,
            VariableError::AlreadyExists {
                name: "w".to_string(),
                job_name: "job_a".to_string(),
            }
        );
    }

    #[test]
    fn name_scope_prefixes() {
        assert_eq!(name_scope_prefix(&[]), "");
        assert_eq!(
            name_scope_prefix(&["encoder".to_string(), "layer0".to_string()]),
            "encoder-layer0-"
        );
    }
}
