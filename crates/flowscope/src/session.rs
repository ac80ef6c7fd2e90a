//! Session: the explicit context object owning the symbol tables, the scope stack, the
//! variable stash and the jobs built against one engine.
//!
//! A session starts `Open`. [`Session::init`] interns the root scope and moves it to
//! `Running`; [`Session::close`] tears everything down. Jobs are built between
//! [`Session::enter_job`] and the drop of the returned [`JobGuard`], during which the session
//! is in global mode.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Weak};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::checkpoint::{self, CheckpointLoader, CheckpointSaver};
use crate::config::SessionConfig;
use crate::engine::{self, InstructionsBuilder, ModelIo, NativeEngine};
use crate::error::Result;
use crate::job::{BlobView, FunctionDesc, JobConfig, JobError, JobGraph, JobOp, OpConf};
use crate::mode::{self, hob, Candidate, DispatchError, ExecutionMode, ModeFlags, RuntimeMode};
use crate::placement::{
    DeviceTag, Hierarchy, IntoMachineDeviceIds, Placement, PlacementDescriptor, PlacementStrategy,
    Resource,
};
use crate::scope::{AttrValue, Scope, ScopeDescriptor, ScopeError, ScopeGuard, ScopeStack};
use crate::symbol::{Symbol, SymbolTable};
use crate::tensor::HostTensor;
use crate::variable::{
    name_scope_prefix, BlobKind, BlobRegister, SnapshotSource, VariableBlob, VariableConf,
    VariableError, VariableSpec, VariableStash,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("session is closed")]
    Closed,
    #[error("session is already running; eager execution must be chosen before init")]
    AlreadyRunning,
    #[error("invalid session config: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Open,
    Running,
    Closed,
}

type Blob<E> = Arc<VariableBlob<<E as NativeEngine>::BlobHandle>>;

/// Everything a new scope needs besides its parent.
#[derive(Debug, Clone)]
struct ScopeBuild {
    job_name: String,
    placement: PlacementDescriptor,
    is_mirrored: bool,
    attrs: BTreeMap<String, AttrValue>,
}

impl ScopeBuild {
    fn derive(scope: &Scope) -> Self {
        ScopeBuild {
            job_name: scope.job_name().to_string(),
            placement: scope.placement().data().clone(),
            is_mirrored: scope.is_mirrored(),
            attrs: scope.attrs().clone(),
        }
    }
}

pub struct Session<E: NativeEngine> {
    engine: Arc<E>,
    config: SessionConfig,
    resource: Resource,
    status: Cell<SessionStatus>,
    eager_execution: Cell<bool>,
    runtime_mode: Cell<RuntimeMode>,
    placements: RefCell<SymbolTable<PlacementDescriptor>>,
    scopes: RefCell<SymbolTable<ScopeDescriptor, Scope>>,
    scope_stack: ScopeStack,
    stash: RefCell<VariableStash<E::BlobHandle>>,
    backward_blobs: RefCell<BlobRegister<E::BlobHandle>>,
    jobs: RefCell<BTreeMap<String, JobGraph>>,
    function_descs: RefCell<BTreeMap<String, FunctionDesc>>,
    current_job: RefCell<Option<String>>,
    name_scopes: RefCell<BTreeMap<String, Vec<String>>>,
    mirrored_stack: RefCell<Vec<bool>>,
}

impl<E: NativeEngine> Session<E> {
    /// Creates an `Open` session. `FLOWSCOPE_EAGER` and `FLOWSCOPE_MACHINE_NUM` take precedence
    /// over `config` when set.
    pub fn new(engine: Arc<E>, config: SessionConfig) -> Result<Self> {
        let config = config.with_env_overrides();
        config
            .validate()
            .map_err(|err| SessionError::InvalidConfig(err.to_string()))?;
        let resource = config.resource(engine.gpu_device_count());
        info!(
            engine = engine.engine_name(),
            machine_num = resource.machine_num,
            gpu_device_num = resource.gpu_device_num,
            cpu_device_num = resource.cpu_device_num,
            "session created"
        );
        Ok(Session {
            eager_execution: Cell::new(config.eager_execution),
            engine,
            config,
            resource,
            status: Cell::new(SessionStatus::Open),
            runtime_mode: Cell::new(RuntimeMode::Normal),
            placements: RefCell::new(SymbolTable::new()),
            scopes: RefCell::new(SymbolTable::new()),
            scope_stack: ScopeStack::new(),
            stash: RefCell::new(VariableStash::new()),
            backward_blobs: RefCell::new(BlobRegister::new()),
            jobs: RefCell::new(BTreeMap::new()),
            function_descs: RefCell::new(BTreeMap::new()),
            current_job: RefCell::new(None),
            name_scopes: RefCell::new(BTreeMap::new()),
            mirrored_stack: RefCell::new(Vec::new()),
        })
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn resource(&self) -> Resource {
        self.resource
    }

    pub fn status(&self) -> SessionStatus {
        self.status.get()
    }

    /// Interns the root scope (`cpu`, `"0:0"`, empty job name) and starts the session.
    /// Calling it on a running session is a no-op.
    pub fn init(&self) -> Result<()> {
        match self.status.get() {
            SessionStatus::Running => return Ok(()),
            SessionStatus::Closed => return Err(SessionError::Closed.into()),
            SessionStatus::Open => {}
        }
        let placement = PlacementDescriptor::parse(DeviceTag::Cpu, &["0:0".to_string()], None)?;
        let root = self.build_scope(
            None,
            ScopeBuild {
                job_name: String::new(),
                placement,
                is_mirrored: false,
                attrs: self.config.scope_attr_defaults.clone(),
            },
        )?;
        self.scope_stack.init(root)?;
        self.status.set(SessionStatus::Running);
        info!(eager = self.eager_execution.get(), "session initialized");
        Ok(())
    }

    /// Drops every scope, job and variable. The session cannot be reopened.
    pub fn close(&self) {
        if self.status.get() == SessionStatus::Closed {
            return;
        }
        self.status.set(SessionStatus::Closed);
        self.runtime_mode.set(RuntimeMode::Normal);
        self.scope_stack.clear();
        self.stash.borrow_mut().clear();
        self.backward_blobs.borrow_mut().clear();
        self.jobs.borrow_mut().clear();
        self.function_descs.borrow_mut().clear();
        self.current_job.borrow_mut().take();
        self.name_scopes.borrow_mut().clear();
        self.mirrored_stack.borrow_mut().clear();
        *self.placements.borrow_mut() = SymbolTable::new();
        *self.scopes.borrow_mut() = SymbolTable::new();
        info!("session closed");
    }

    pub fn enable_eager_execution(&self, enabled: bool) -> Result<()> {
        match self.status.get() {
            SessionStatus::Open => {
                self.eager_execution.set(enabled);
                Ok(())
            }
            SessionStatus::Running => Err(SessionError::AlreadyRunning.into()),
            SessionStatus::Closed => Err(SessionError::Closed.into()),
        }
    }

    pub fn is_eager(&self) -> bool {
        self.eager_execution.get()
    }

    pub fn mode_flags(&self) -> ModeFlags {
        let status = self.status.get();
        ModeFlags {
            env_initialized: status != SessionStatus::Closed,
            session_initialized: status == SessionStatus::Running,
            eager_execution_enabled: self.eager_execution.get(),
            runtime_mode: self.runtime_mode.get(),
        }
    }

    pub fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::from_flags(&self.mode_flags())
    }

    pub fn current_scope(&self) -> Result<Arc<Scope>> {
        Ok(self.scope_stack.current()?)
    }

    pub fn scope_depth(&self) -> usize {
        self.scope_stack.depth()
    }

    pub fn placement_symbol_count(&self) -> usize {
        self.placements.borrow().len()
    }

    pub fn scope_symbol_count(&self) -> usize {
        self.scopes.borrow().len()
    }

    /// Resolves a placement for the current mode.
    ///
    /// `"gpu"` falls back to `"cpu"` when the engine reports no GPUs. Before [`Session::init`]
    /// the result is an empty placement that interns nothing.
    pub fn placement<I: IntoMachineDeviceIds>(
        &self,
        device_tag: &str,
        machine_device_ids: I,
        hierarchy: Option<&[usize]>,
    ) -> Result<Placement<'_>> {
        let descriptor = self.resolve_placement(
            device_tag.parse::<DeviceTag>()?,
            &machine_device_ids.into_machine_device_ids(),
            hierarchy,
        )?;
        let strategy = mode::unique(
            "placement",
            &self.mode_flags(),
            vec![
                Candidate::new(
                    "empty_placement",
                    hob::IN_NORMAL_MODE & hob::ENV_INITIALIZED & !hob::SESSION_INITIALIZED,
                    PlacementStrategy::Empty,
                ),
                Candidate::new(
                    "normal_placement",
                    hob::IN_NORMAL_MODE & hob::SESSION_INITIALIZED,
                    PlacementStrategy::Normal,
                ),
                Candidate::new("global_placement", hob::IN_GLOBAL_MODE, PlacementStrategy::Global),
            ],
        )?;
        match strategy {
            PlacementStrategy::Empty => Ok(Placement::empty(descriptor)),
            PlacementStrategy::Normal | PlacementStrategy::Global => {
                let current = self.scope_stack.current()?;
                let mut build = ScopeBuild::derive(&current);
                build.placement = descriptor.clone();
                let scope = self.build_scope(Some(&current), build)?;
                Ok(Placement::scoped(strategy, descriptor, scope, &self.scope_stack))
            }
        }
    }

    fn resolve_placement(
        &self,
        requested: DeviceTag,
        machine_device_ids: &[String],
        hierarchy: Option<&[usize]>,
    ) -> Result<PlacementDescriptor> {
        let downgraded = requested == DeviceTag::Gpu && self.resource.gpu_device_num == 0;
        let device_tag = if downgraded {
            debug!(?machine_device_ids, "no gpu available, placing on cpu instead");
            DeviceTag::Cpu
        } else {
            requested
        };
        let hierarchy = hierarchy.map(Hierarchy::new).transpose()?;
        let descriptor = PlacementDescriptor::parse(device_tag, machine_device_ids, hierarchy)?;
        if downgraded {
            self.resource.validate_nodes(&descriptor)?;
            if let Some(range) = self.resource.unavailable_range(&descriptor, DeviceTag::Cpu) {
                warn!(
                    range = %range,
                    cpu_device_num = self.resource.cpu_device_num,
                    "gpu placement downgraded to cpu spans more devices than each node has"
                );
            }
        } else {
            self.resource.validate(&descriptor)?;
        }
        Ok(descriptor)
    }

    /// Enters a scope whose attributes are overridden by `attrs`.
    ///
    /// Only attributes declared in [`SessionConfig::scope_attr_defaults`] may be set, with
    /// values of the declared kind.
    pub fn scope_config<I, K>(&self, attrs: I) -> Result<ScopeGuard<'_>>
    where
        I: IntoIterator<Item = (K, AttrValue)>,
        K: Into<String>,
    {
        let current = self.scope_stack.current()?;
        let mut build = ScopeBuild::derive(&current);
        for (name, value) in attrs {
            let name = name.into();
            let default = self
                .config
                .scope_attr_defaults
                .get(&name)
                .ok_or_else(|| ScopeError::UnknownAttr { name: name.clone() })?;
            if default.kind_name() != value.kind_name() {
                return Err(ScopeError::AttrTypeMismatch {
                    name,
                    expected: default.kind_name(),
                    found: value.kind_name(),
                }
                .into());
            }
            build.attrs.insert(name, value);
        }
        let scope = self.build_scope(Some(&current), build)?;
        Ok(self.scope_stack.enter(scope)?)
    }

    /// Makes ops built under the guard mirrored (`true`) or consistent (`false`).
    pub fn distribute_strategy(&self, is_mirrored: bool) -> Result<DistributeGuard<'_, E>> {
        let scope = if self.status.get() == SessionStatus::Running {
            let current = self.scope_stack.current()?;
            let mut build = ScopeBuild::derive(&current);
            build.is_mirrored = is_mirrored;
            let scope = self.build_scope(Some(&current), build)?;
            Some(self.scope_stack.enter(scope)?)
        } else {
            None
        };
        self.mirrored_stack.borrow_mut().push(is_mirrored);
        Ok(DistributeGuard {
            session: self,
            scope,
        })
    }

    pub fn is_mirrored_strategy_enabled(&self) -> bool {
        if let Some(&top) = self.mirrored_stack.borrow().last() {
            return top;
        }
        self.scope_stack
            .current()
            .map(|scope| scope.is_mirrored())
            .unwrap_or(false)
    }

    /// Starts building a job: initializes the session if needed, switches to global mode and
    /// pushes the job's initial scope until the guard is dropped.
    pub fn enter_job(&self, config: JobConfig) -> Result<JobGuard<'_, E>> {
        if config.job_name.is_empty() {
            return Err(JobError::EmptyJobName.into());
        }
        self.init()?;
        if let Some(current) = self.current_job.borrow().as_ref() {
            return Err(JobError::AlreadyBuilding {
                current: current.clone(),
                requested: config.job_name.clone(),
            }
            .into());
        }
        if self.jobs.borrow().contains_key(&config.job_name) {
            return Err(JobError::DuplicateJob(config.job_name.clone()).into());
        }

        let placement = match &config.default_placement {
            Some(spec) => self.resolve_placement(
                spec.device_tag,
                &spec.machine_device_ids,
                spec.hierarchy.as_deref(),
            )?,
            None => {
                let (device_tag, ids) = self.resource.default_machine_device_ids();
                self.resolve_placement(device_tag, &ids, None)?
            }
        };
        let scope = self.build_scope(
            None,
            ScopeBuild {
                job_name: config.job_name.clone(),
                placement,
                is_mirrored: config.is_mirrored,
                attrs: self.config.scope_attr_defaults.clone(),
            },
        )?;
        let scope_guard = self.scope_stack.enter(scope)?;

        let job_name = config.job_name.clone();
        self.jobs
            .borrow_mut()
            .insert(job_name.clone(), JobGraph::new(job_name.clone()));
        self.function_descs
            .borrow_mut()
            .insert(job_name.clone(), FunctionDesc::new(config));
        *self.current_job.borrow_mut() = Some(job_name.clone());
        self.runtime_mode.set(RuntimeMode::Global);
        info!(job = %job_name, eager = self.eager_execution.get(), "building job");
        Ok(JobGuard {
            session: self,
            scope: Some(scope_guard),
            job_name,
        })
    }

    /// Builds a job by running `f` between [`Session::enter_job`] and its exit.
    pub fn build_job<R, F>(&self, config: JobConfig, f: F) -> Result<R>
    where
        F: FnOnce(&Session<E>) -> Result<R>,
    {
        let guard = self.enter_job(config)?;
        let output = f(self);
        guard.exit()?;
        output
    }

    fn finish_job(&self, job_name: &str) {
        self.runtime_mode.set(RuntimeMode::Normal);
        self.current_job.borrow_mut().take();
        self.name_scopes.borrow_mut().remove(job_name);
        info!(job = %job_name, "job built");
    }

    pub fn current_job_name(&self) -> Result<String> {
        self.current_job
            .borrow()
            .clone()
            .ok_or_else(|| JobError::NoCurrentJob.into())
    }

    pub fn function_desc(&self, job_name: &str) -> Option<FunctionDesc> {
        self.function_descs.borrow().get(job_name).cloned()
    }

    pub fn current_function_desc(&self) -> Result<FunctionDesc> {
        let job_name = self.current_job_name()?;
        self.function_desc(&job_name)
            .ok_or_else(|| JobError::UnknownJob(job_name).into())
    }

    pub fn job_graph(&self, job_name: &str) -> Option<JobGraph> {
        self.jobs.borrow().get(job_name).cloned()
    }

    /// Prefixes names of variables created under the guard with `name-`.
    pub fn name_scope(&self, name: impl Into<String>) -> Result<NameScopeGuard<'_, E>> {
        let job_name = self.current_job_name()?;
        self.name_scopes
            .borrow_mut()
            .entry(job_name.clone())
            .or_default()
            .push(name.into());
        Ok(NameScopeGuard {
            session: self,
            job_name,
        })
    }

    fn name_scope_prefix(&self, job_name: &str) -> String {
        self.name_scopes
            .borrow()
            .get(job_name)
            .map(|scopes| name_scope_prefix(scopes))
            .unwrap_or_default()
    }

    /// Records a user op in the current job, mirrored or consistent by the active strategy.
    /// In eager mode the op runs first and is recorded only once it succeeded.
    pub fn add_op(&self, op: OpConf) -> Result<JobOp> {
        let view = if self.is_mirrored_strategy_enabled() {
            BlobView::Mirrored
        } else {
            BlobView::Consistent
        };
        let (job_name, op) = self.new_job_op(op, view)?;
        match self.execution_mode() {
            ExecutionMode::EagerGlobal => {
                self.with_job_graph(&job_name, |graph| graph.check_new_op(op.name()))?;
                engine::logical_run(&*self.engine, |builder| builder.run_op(&op))?;
            }
            ExecutionMode::LazyGlobal => {}
            mode @ (ExecutionMode::LazyNormal | ExecutionMode::EagerNormal) => {
                return Err(DispatchError::Unsupported { op: "add_op", mode }.into());
            }
        }
        self.record_job_op(&job_name, op.clone())?;
        Ok(op)
    }

    fn add_job_op(&self, conf: OpConf, view: BlobView) -> Result<JobOp> {
        let (job_name, op) = self.new_job_op(conf, view)?;
        self.record_job_op(&job_name, op.clone())?;
        Ok(op)
    }

    /// Binds `conf` to the current job and scope without recording it.
    fn new_job_op(&self, conf: OpConf, view: BlobView) -> Result<(String, JobOp)> {
        let job_name = self.current_job_name()?;
        let scope = self.scope_stack.current()?;
        let op = JobOp {
            conf,
            scope_symbol_id: scope.symbol_id(),
            device_tag: scope.device_tag(),
            parallel_desc: scope.placement().id(),
            view,
        };
        Ok((job_name, op))
    }

    fn record_job_op(&self, job_name: &str, op: JobOp) -> Result<()> {
        debug!(job = %job_name, op = %op.name(), op_type = op.conf.op_type(), "added op");
        self.with_job_graph(job_name, |graph| graph.add_op(op))
    }

    fn with_job_graph<R>(
        &self,
        job_name: &str,
        f: impl FnOnce(&mut JobGraph) -> std::result::Result<R, JobError>,
    ) -> Result<R> {
        let mut jobs = self.jobs.borrow_mut();
        let graph = jobs
            .get_mut(job_name)
            .ok_or_else(|| JobError::UnknownJob(job_name.to_string()))?;
        Ok(f(graph)?)
    }

    /// Returns the variable `spec.name` of the current job, creating it on first use.
    pub fn get_variable(&self, spec: VariableSpec) -> Result<Blob<E>> {
        match self.execution_mode() {
            ExecutionMode::LazyGlobal => self.get_lazy_variable(spec),
            ExecutionMode::EagerGlobal => self.get_eager_variable(spec),
            mode @ (ExecutionMode::LazyNormal | ExecutionMode::EagerNormal) => {
                Err(DispatchError::Unsupported {
                    op: "get_variable",
                    mode,
                }
                .into())
            }
        }
    }

    /// Resolves the prefixed name and the `(session, job)` registrations for `spec`.
    fn lookup_variable(
        &self,
        spec: &VariableSpec,
    ) -> Result<(String, String, Option<Blob<E>>, Option<Blob<E>>)> {
        if spec.name.is_empty() {
            return Err(VariableError::EmptyName.into());
        }
        let job_name = self.current_job_name()?;
        let name = format!("{}{}", self.name_scope_prefix(&job_name), spec.name);
        let (var_blob, job_var_blob) = self.stash.borrow().try_get(&job_name, &name);
        if !spec.reuse && job_var_blob.is_some() {
            return Err(VariableError::AlreadyExists { name, job_name }.into());
        }
        for existing in job_var_blob.iter().chain(var_blob.iter()) {
            existing.check_compatible(&job_name, &spec.shape, spec.dtype)?;
        }
        Ok((job_name, name, var_blob, job_var_blob))
    }

    fn get_lazy_variable(&self, spec: VariableSpec) -> Result<Blob<E>> {
        let (job_name, name, var_blob, job_var_blob) = self.lookup_variable(&spec)?;
        if let Some(job_var_blob) = job_var_blob {
            return self.check_registration(&job_name, var_blob, job_var_blob);
        }

        let conf = self.variable_conf(spec, name, &job_name)?;
        let blob = Arc::new(VariableBlob::new(conf.clone(), &job_name, BlobKind::Lazy));
        if let Some(var_blob) = &var_blob {
            if !var_blob.identical_to(&blob) {
                return Err(VariableError::InconsistentRegistration {
                    name: conf.name,
                    job_name,
                }
                .into());
            }
        }
        self.add_job_op(OpConf::variable(conf), BlobView::Consistent)?;
        self.stash.borrow_mut().stash(&job_name, Arc::clone(&blob))?;
        debug!(job = %job_name, variable = %blob.name(), "registered lazy variable");
        Ok(blob)
    }

    fn get_eager_variable(&self, spec: VariableSpec) -> Result<Blob<E>> {
        let (job_name, name, var_blob, job_var_blob) = self.lookup_variable(&spec)?;
        let blob = match job_var_blob {
            Some(job_var_blob) => self.check_registration(&job_name, var_blob, job_var_blob)?,
            None => {
                let conf = self.variable_conf(spec, name, &job_name)?;
                if let Some(var_blob) = &var_blob {
                    if var_blob.is_lazy() {
                        return Err(VariableError::InconsistentRegistration {
                            name: conf.name,
                            job_name,
                        }
                        .into());
                    }
                }
                // Allocate and initialize before recording anything; a blob whose
                // initialization fails is released again.
                let blob = match var_blob {
                    Some(var_blob) => var_blob,
                    None => {
                        let parallel_desc = self.scope_stack.current()?.placement().id();
                        let handle = engine::logical_run(&*self.engine, |builder| {
                            let handle = builder.new_variable_blob(&conf, parallel_desc)?;
                            if let Err(err) = builder.init_variable_blob(&handle, &conf) {
                                builder.delete_variable_blob(&handle)?;
                                return Err(err);
                            }
                            Ok(handle)
                        })?;
                        debug!(job = %job_name, variable = %conf.name, ?handle, "allocated eager variable");
                        Arc::new(VariableBlob::new(conf.clone(), &job_name, BlobKind::Eager(handle)))
                    }
                };
                self.add_job_op(OpConf::variable(conf), BlobView::Consistent)?;
                self.stash.borrow_mut().stash(&job_name, Arc::clone(&blob))?;
                blob
            }
        };
        self.backward_blobs.borrow_mut().try_set(&blob);
        Ok(blob)
    }

    fn check_registration(
        &self,
        job_name: &str,
        var_blob: Option<Blob<E>>,
        job_var_blob: Blob<E>,
    ) -> Result<Blob<E>> {
        match var_blob {
            Some(var_blob) if var_blob.identical_to(&job_var_blob) => Ok(job_var_blob),
            _ => Err(VariableError::InconsistentRegistration {
                name: job_var_blob.name().to_string(),
                job_name: job_name.to_string(),
            }
            .into()),
        }
    }

    fn variable_conf(&self, spec: VariableSpec, name: String, job_name: &str) -> Result<VariableConf> {
        let function_desc = self
            .function_desc(job_name)
            .ok_or_else(|| JobError::UnknownJob(job_name.to_string()))?;
        let snapshot = function_desc
            .job_config()
            .default_initialize_with_snapshot_path
            .as_deref()
            .and_then(|root| self.snapshot_source(root, &name));
        Ok(spec.into_conf(name, function_desc.is_trainable(), snapshot)?)
    }

    fn snapshot_source(&self, root: &Path, name: &str) -> Option<SnapshotSource> {
        let file_path = checkpoint::snapshot_path(root, name);
        if file_path.is_file() {
            Some(SnapshotSource {
                path: root.join(name),
                key: checkpoint::SNAPSHOT_KEY.to_string(),
            })
        } else {
            warn!(path = %file_path.display(), "snapshot not found, variable will be initialized");
            None
        }
    }

    /// Session-wide variables ordered by name.
    pub fn variables(&self) -> Vec<Blob<E>> {
        self.stash.borrow().variables()
    }

    pub fn variable(&self, name: &str) -> Option<Blob<E>> {
        self.stash.borrow().get(name)
    }

    pub fn backward_blob(&self, logical_blob_name: &str) -> Option<Blob<E>> {
        self.backward_blobs.borrow().get(logical_blob_name)
    }

    fn eager_handle(&self, name: &str) -> Result<(Blob<E>, E::BlobHandle)> {
        let blob = self
            .variable(name)
            .ok_or_else(|| VariableError::UnknownVariable {
                name: name.to_string(),
            })?;
        let handle = blob
            .handle()
            .cloned()
            .ok_or_else(|| VariableError::NotMaterialized {
                name: name.to_string(),
            })?;
        Ok((blob, handle))
    }

    /// Copies the current value of an eager variable to the host.
    pub fn fetch_variable(&self, name: &str) -> Result<HostTensor> {
        let (_, handle) = self.eager_handle(name)?;
        Ok(engine::physical_run(&*self.engine, |builder| {
            builder.fetch_blob(&handle)
        })?)
    }

    /// Overwrites an eager variable with `value`, which must match its shape.
    pub fn feed_variable(&self, name: &str, value: HostTensor) -> Result<()> {
        let (blob, handle) = self.eager_handle(name)?;
        if value.shape() != blob.shape() {
            return Err(VariableError::InvalidShape {
                name: name.to_string(),
                shape: value.shape().dims().to_vec(),
            }
            .into());
        }
        Ok(engine::physical_run(&*self.engine, |builder| {
            builder.feed_blob(&handle, value)
        })?)
    }

    /// Writes every registered variable under `path`. Top-level (normal mode) only.
    pub fn save_checkpoint(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        match self.checkpoint_mode("save_checkpoint")? {
            ExecutionMode::EagerNormal => CheckpointSaver::save(self, path),
            _ => self.lazy_model_io(ModelIo::Save(path.to_path_buf())),
        }
    }

    /// Restores every registered variable from `path`. Top-level (normal mode) only.
    pub fn load_checkpoint(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        match self.checkpoint_mode("load_checkpoint")? {
            ExecutionMode::EagerNormal => CheckpointLoader::load(self, path),
            _ => self.lazy_model_io(ModelIo::Load(path.to_path_buf())),
        }
    }

    /// Runs the initializers of lazily built variables. Eager variables are initialized when
    /// they are created.
    pub fn init_checkpoint(&self) -> anyhow::Result<()> {
        match self.checkpoint_mode("init_checkpoint")? {
            ExecutionMode::EagerNormal => Ok(()),
            _ => self.lazy_model_io(ModelIo::Init),
        }
    }

    /// Validates the session state and returns the normal-mode execution mode.
    fn checkpoint_mode(&self, op: &'static str) -> anyhow::Result<ExecutionMode> {
        if self.status.get() == SessionStatus::Closed {
            return Err(SessionError::Closed.into());
        }
        match self.execution_mode() {
            mode @ (ExecutionMode::LazyNormal | ExecutionMode::EagerNormal) => Ok(mode),
            mode @ (ExecutionMode::LazyGlobal | ExecutionMode::EagerGlobal) => {
                Err(DispatchError::Unsupported { op, mode }.into())
            }
        }
    }

    fn lazy_model_io(&self, io: ModelIo) -> anyhow::Result<()> {
        let confs: Vec<VariableConf> = self
            .variables()
            .iter()
            .filter(|blob| blob.is_lazy())
            .map(|blob| blob.conf().clone())
            .collect();
        info!(?io, variables = confs.len(), "model io");
        engine::physical_run(&*self.engine, |builder| builder.model_io(&io, &confs))?;
        Ok(())
    }

    /// Interns the placements of `build` and the scope they describe.
    fn build_scope(&self, parent: Option<&Arc<Scope>>, build: ScopeBuild) -> Result<Arc<Scope>> {
        let parent_id = parent.map(|scope| scope.symbol_id());
        let parent_ref = parent.map(Arc::downgrade).unwrap_or_else(Weak::new);
        let host = build.placement.host();
        let mut placements = self.placements.borrow_mut();
        let mut scopes = self.scopes.borrow_mut();
        let scope = engine::logical_run(&*self.engine, |builder| {
            let device = intern_placement(&mut placements, builder, build.placement)?;
            let host = intern_placement(&mut placements, builder, host)?;
            let descriptor = ScopeDescriptor {
                parent: parent_id,
                job_name: build.job_name,
                device_parallel_desc: device.id(),
                host_parallel_desc: host.id(),
                is_mirrored: build.is_mirrored,
                attrs: build.attrs,
            };
            scopes.intern_with(descriptor, |descriptor| {
                let id = builder.new_symbol_id()?;
                builder.new_scope(id, descriptor)?;
                debug!(scope = %id, placement = %device.data(), "new scope symbol");
                Ok(Scope::new(id, descriptor.clone(), device, host, parent_ref))
            })
        })?;
        Ok(scope)
    }
}

fn intern_placement<H>(
    table: &mut SymbolTable<PlacementDescriptor>,
    builder: &mut dyn InstructionsBuilder<H>,
    descriptor: PlacementDescriptor,
) -> engine::EngineResult<Arc<Symbol<PlacementDescriptor>>> {
    table.intern_with(descriptor, |descriptor| {
        let id = builder.new_symbol_id()?;
        builder.new_parallel_desc(id, descriptor)?;
        debug!(symbol = %id, placement = %descriptor, "new parallel desc symbol");
        Ok(Symbol::new(id, descriptor.clone()))
    })
}

/// Keeps a job in the building state; dropping it leaves global mode.
pub struct JobGuard<'s, E: NativeEngine> {
    session: &'s Session<E>,
    scope: Option<ScopeGuard<'s>>,
    job_name: String,
}

impl<E: NativeEngine> JobGuard<'_, E> {
    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    /// Finishes the job, reporting a mis-nested scope instead of panicking.
    pub fn exit(mut self) -> Result<()> {
        match self.scope.take() {
            Some(scope) => Ok(scope.exit()?),
            None => Ok(()),
        }
    }
}

impl<E: NativeEngine> Drop for JobGuard<'_, E> {
    fn drop(&mut self) {
        drop(self.scope.take());
        self.session.finish_job(&self.job_name);
    }
}

/// Restores the previous distribute strategy on drop.
pub struct DistributeGuard<'s, E: NativeEngine> {
    session: &'s Session<E>,
    scope: Option<ScopeGuard<'s>>,
}

impl<E: NativeEngine> Drop for DistributeGuard<'_, E> {
    fn drop(&mut self) {
        drop(self.scope.take());
        self.session.mirrored_stack.borrow_mut().pop();
    }
}

/// Pops a name scope on drop.
pub struct NameScopeGuard<'s, E: NativeEngine> {
    session: &'s Session<E>,
    job_name: String,
}

impl<E: NativeEngine> Drop for NameScopeGuard<'_, E> {
    fn drop(&mut self) {
        if let Some(scopes) = self.session.name_scopes.borrow_mut().get_mut(&self.job_name) {
            scopes.pop();
        }
    }
}
