//! Job (global function) configuration and the op graph recorded while a job is built.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::placement::DeviceTag;
use crate::scope::AttrValue;
use crate::symbol::SymbolId;
use crate::variable::VariableConf;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error("cannot build job '{requested}' while job '{current}' is being built")]
    AlreadyBuilding { current: String, requested: String },
    #[error("no job is being built")]
    NoCurrentJob,
    #[error("op '{op_name}' already exists in job '{job_name}'")]
    DuplicateOp { job_name: String, op_name: String },
    #[error("job name must not be empty")]
    EmptyJobName,
    #[error("unknown job '{0}'")]
    UnknownJob(String),
    #[error("job '{0}' has already been built in this session")]
    DuplicateJob(String),
}

/// Placement written in a job config, resolved when the job is entered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementSpec {
    pub device_tag: DeviceTag,
    pub machine_device_ids: Vec<String>,
    #[serde(default)]
    pub hierarchy: Option<Vec<usize>>,
}

impl PlacementSpec {
    pub fn new<I: crate::placement::IntoMachineDeviceIds>(device_tag: DeviceTag, ids: I) -> Self {
        PlacementSpec {
            device_tag,
            machine_device_ids: ids.into_machine_device_ids(),
            hierarchy: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    pub job_name: String,
    pub default_placement: Option<PlacementSpec>,
    pub is_mirrored: bool,
    pub train: bool,
    pub default_initialize_with_snapshot_path: Option<PathBuf>,
}

impl Default for JobConfig {
    fn default() -> Self {
        JobConfig {
            job_name: String::new(),
            default_placement: None,
            is_mirrored: false,
            train: false,
            default_initialize_with_snapshot_path: None,
        }
    }
}

impl JobConfig {
    pub fn new(job_name: impl Into<String>) -> Self {
        JobConfig {
            job_name: job_name.into(),
            ..Self::default()
        }
    }

    pub fn placement(mut self, placement: PlacementSpec) -> Self {
        self.default_placement = Some(placement);
        self
    }

    pub fn mirrored(mut self, is_mirrored: bool) -> Self {
        self.is_mirrored = is_mirrored;
        self
    }

    pub fn train(mut self, train: bool) -> Self {
        self.train = train;
        self
    }

    pub fn initialize_with_snapshot(mut self, path: impl Into<PathBuf>) -> Self {
        self.default_initialize_with_snapshot_path = Some(path.into());
        self
    }
}

/// Description of a built job, kept by the session after the job is finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionDesc {
    job_config: JobConfig,
}

impl FunctionDesc {
    pub fn new(job_config: JobConfig) -> Self {
        FunctionDesc { job_config }
    }

    pub fn job_name(&self) -> &str {
        &self.job_config.job_name
    }

    pub fn job_config(&self) -> &JobConfig {
        &self.job_config
    }

    pub fn is_trainable(&self) -> bool {
        self.job_config.train
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OpKind {
    Variable(VariableConf),
    User {
        op_type: String,
        attrs: BTreeMap<String, AttrValue>,
        inputs: Vec<String>,
        outputs: Vec<String>,
    },
}

/// Op description as supplied by op-building code.
#[derive(Debug, Clone, PartialEq)]
pub struct OpConf {
    pub name: String,
    pub kind: OpKind,
}

impl OpConf {
    pub fn variable(conf: VariableConf) -> Self {
        OpConf {
            name: conf.name.clone(),
            kind: OpKind::Variable(conf),
        }
    }

    pub fn user(name: impl Into<String>, op_type: impl Into<String>) -> Self {
        OpConf {
            name: name.into(),
            kind: OpKind::User {
                op_type: op_type.into(),
                attrs: BTreeMap::new(),
                inputs: Vec::new(),
                outputs: Vec::new(),
            },
        }
    }

    pub fn input(mut self, blob: impl Into<String>) -> Self {
        if let OpKind::User { inputs, .. } = &mut self.kind {
            inputs.push(blob.into());
        }
        self
    }

    pub fn output(mut self, blob: impl Into<String>) -> Self {
        if let OpKind::User { outputs, .. } = &mut self.kind {
            outputs.push(blob.into());
        }
        self
    }

    pub fn attr(mut self, name: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        if let OpKind::User { attrs, .. } = &mut self.kind {
            attrs.insert(name.into(), value.into());
        }
        self
    }

    pub fn op_type(&self) -> &str {
        match &self.kind {
            OpKind::Variable(_) => "variable",
            OpKind::User { op_type, .. } => op_type,
        }
    }
}

/// Whether op outputs are per-device (mirrored) or one logical tensor (consistent).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobView {
    Consistent,
    Mirrored,
}

/// Op recorded in a job, stamped with the scope it was built under.
#[derive(Debug, Clone, PartialEq)]
pub struct JobOp {
    pub conf: OpConf,
    pub scope_symbol_id: SymbolId,
    pub device_tag: DeviceTag,
    pub parallel_desc: SymbolId,
    pub view: BlobView,
}

impl JobOp {
    pub fn name(&self) -> &str {
        &self.conf.name
    }
}

/// Ops of one job in insertion order.
#[derive(Debug, Clone, Default)]
pub struct JobGraph {
    job_name: String,
    ops: Vec<JobOp>,
    index: HashMap<String, usize>,
}

impl JobGraph {
    pub fn new(job_name: impl Into<String>) -> Self {
        JobGraph {
            job_name: job_name.into(),
            ops: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    /// Fails if an op named `name` is already recorded.
    pub fn check_new_op(&self, name: &str) -> Result<(), JobError> {
        if self.index.contains_key(name) {
            return Err(JobError::DuplicateOp {
                job_name: self.job_name.clone(),
                op_name: name.to_string(),
            });
        }
        Ok(())
    }

    pub fn add_op(&mut self, op: JobOp) -> Result<(), JobError> {
        self.check_new_op(op.name())?;
        self.index.insert(op.name().to_string(), self.ops.len());
        self.ops.push(op);
        Ok(())
    }

    pub fn op(&self, name: &str) -> Option<&JobOp> {
        self.index.get(name).map(|&i| &self.ops[i])
    }

    pub fn ops(&self) -> &[JobOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn variable_confs(&self) -> impl Iterator<Item = &VariableConf> {
        self.ops.iter().filter_map(|op| match &op.conf.kind {
            OpKind::Variable(conf) => Some(conf),
            OpKind::User { .. } => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(name: &str) -> JobOp {
        JobOp {
            conf: OpConf::user(name, "relu").input("x/out").output("out"),
            scope_symbol_id: SymbolId(3),
            device_tag: DeviceTag::Cpu,
            parallel_desc: SymbolId(1),
            view: BlobView::Consistent,
        }
    }

    #[test]
    fn duplicate_op_names_are_rejected() {
        let mut graph = JobGraph::new("train");
        graph.add_op(op("relu0")).unwrap();
        let err = graph.add_op(op("relu0")).unwrap_err();
        assert_eq!(
            err,
            JobError::DuplicateOp {
                job_name: "train".to_string(),
                op_name: "relu0".to_string(),
            }
        );
        assert_eq!(graph.len(), 1);
        assert_eq!(graph.op("relu0").unwrap().conf.op_type(), "relu");
    }

    #[test]
    fn job_config_from_json() {
        let config: JobConfig = serde_json::from_str(
            r#"{
                "job_name": "train",
                "train": true,
                "default_placement": {"device_tag": "gpu", "machine_device_ids": ["0:0-3"]}
            }"#,
        )
        .unwrap();
        assert_eq!(config.job_name, "train");
        assert!(FunctionDesc::new(config.clone()).is_trainable());
        let placement = config.default_placement.unwrap();
        assert_eq!(placement.device_tag, DeviceTag::Gpu);
        assert_eq!(placement.hierarchy, None);
        assert!(!config.is_mirrored);
    }
}
