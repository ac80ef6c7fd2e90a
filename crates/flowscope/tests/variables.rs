use std::sync::Arc;

use flowscope::job::JobError;
use flowscope::logging::init_tracing;
use flowscope::mode::DispatchError;
use flowscope::variable::{Distribute, VariableError};
use flowscope::{
    Error, ExecutionMode, HostTensor, Initializer, JobConfig, OpConf, Regularizer, Session,
    SessionConfig, Shape, VariableSpec,
};
use flowscope_engine_ref::{FailPoint, RefEngine};

fn session_with(config: SessionConfig) -> (Arc<RefEngine>, Session<RefEngine>) {
    init_tracing();
    let engine = Arc::new(RefEngine::new());
    let session = Session::new(Arc::clone(&engine), config).unwrap();
    (engine, session)
}

#[test]
fn get_variable_outside_a_job_is_unsupported() {
    let (_engine, session) = session_with(SessionConfig::default());
    session.init().unwrap();

    let err = session.get_variable(VariableSpec::new("w", vec![4])).unwrap_err();
    assert!(matches!(
        err,
        Error::Dispatch(DispatchError::Unsupported {
            op: "get_variable",
            mode: ExecutionMode::LazyNormal
        })
    ));
}

#[test]
fn lazy_variable_is_reused_within_a_job() {
    let (engine, session) = session_with(SessionConfig::default());
    let job = session.enter_job(JobConfig::new("train").train(true)).unwrap();
    assert_eq!(session.execution_mode(), ExecutionMode::LazyGlobal);

    let spec = VariableSpec::new("w", vec![4, 2])
        .initializer(Initializer::RandomNormal { mean: 0.0, std: 0.02 })
        .regularizer(Regularizer::l2(1e-4));
    let a = session.get_variable(spec.clone()).unwrap();
    let b = session.get_variable(spec.clone()).unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert!(a.is_lazy());
    assert_eq!(a.logical_blob_name(), "w/out");
    assert_eq!(a.shape(), &Shape::new(vec![4, 2]));
    assert!(a.conf().trainable);
    assert_eq!(a.conf().model_name, "weight");

    let err = session.get_variable(spec.reuse(false)).unwrap_err();
    assert!(matches!(err, Error::Variable(VariableError::AlreadyExists { .. })));
    drop(job);

    let graph = session.job_graph("train").unwrap();
    assert_eq!(graph.variable_confs().count(), 1);
    assert_eq!(engine.blob_count(), 0);
    assert!(session.backward_blob("w/out").is_none());
    assert_eq!(session.execution_mode(), ExecutionMode::LazyNormal);
}

#[test]
fn trainable_defaults_to_the_job_train_flag() {
    let (_engine, session) = session_with(SessionConfig::default());
    let job = session.enter_job(JobConfig::new("eval")).unwrap();
    let implicit = session.get_variable(VariableSpec::new("a", vec![1])).unwrap();
    let explicit = session
        .get_variable(VariableSpec::new("b", vec![1]).trainable(true))
        .unwrap();
    drop(job);
    assert!(!implicit.conf().trainable);
    assert!(explicit.conf().trainable);
}

#[test]
fn lazy_variable_is_shared_across_jobs() {
    let (_engine, session) = session_with(SessionConfig::default());
    let first = session
        .build_job(JobConfig::new("train"), |s| {
            s.get_variable(VariableSpec::new("w", vec![8]))
        })
        .unwrap();
    let second = session
        .build_job(JobConfig::new("eval"), |s| {
            s.get_variable(VariableSpec::new("w", vec![8]))
        })
        .unwrap();

    assert_eq!(first.job_name(), "train");
    assert_eq!(second.job_name(), "eval");
    assert!(first.identical_to(&second));
    assert_eq!(session.variables().len(), 1);
    assert!(Arc::ptr_eq(&session.variable("w").unwrap(), &first));
}

#[test]
fn invalid_variable_requests() {
    let (_engine, session) = session_with(SessionConfig::default());
    let _job = session.enter_job(JobConfig::new("train")).unwrap();

    let err = session.get_variable(VariableSpec::new("", vec![2])).unwrap_err();
    assert!(matches!(err, Error::Variable(VariableError::EmptyName)));

    let err = session.get_variable(VariableSpec::new("w", vec![2, 0])).unwrap_err();
    assert!(matches!(err, Error::Variable(VariableError::InvalidShape { .. })));
    assert!(session.variables().is_empty());
}

#[test]
fn name_scopes_prefix_variable_names() {
    let (_engine, session) = session_with(SessionConfig::default());
    let _job = session.enter_job(JobConfig::new("train")).unwrap();
    {
        let _encoder = session.name_scope("encoder").unwrap();
        let w = session.get_variable(VariableSpec::new("w", vec![2])).unwrap();
        assert_eq!(w.name(), "encoder-w");
        {
            let _layer = session.name_scope("layer0").unwrap();
            let w = session.get_variable(VariableSpec::new("w", vec![2])).unwrap();
            assert_eq!(w.name(), "encoder-layer0-w");
        }
    }
    let w = session.get_variable(VariableSpec::new("w", vec![2])).unwrap();
    assert_eq!(w.name(), "w");
    assert_eq!(session.variables().len(), 3);
}

#[test]
fn name_scope_needs_a_job() {
    let (_engine, session) = session_with(SessionConfig::default());
    session.init().unwrap();
    let err = session.name_scope("encoder").err().unwrap();
    assert!(matches!(err, Error::Job(JobError::NoCurrentJob)));
}

#[test]
fn eager_variable_is_materialized_once() {
    let (engine, session) = session_with(SessionConfig::eager());
    let spec = VariableSpec::new("w", vec![2, 3])
        .initializer(Initializer::Constant { value: 1.25 })
        .distribute(vec![Distribute::Split(0)]);

    let first = session
        .build_job(JobConfig::new("train"), |s| {
            assert_eq!(s.execution_mode(), ExecutionMode::EagerGlobal);
            s.get_variable(spec.clone())
        })
        .unwrap();
    assert!(!first.is_lazy());
    assert!(first.handle().is_some());
    assert_eq!(engine.stats().blobs_allocated, 1);
    assert_eq!(engine.stats().blobs_initialized, 1);

    let value = session.fetch_variable("w").unwrap();
    assert_eq!(value.shape(), &Shape::new(vec![2, 3]));
    assert!(value.data().iter().all(|&v| v == 1.25));

    // A second job gets the very same blob without a new allocation.
    let second = session
        .build_job(JobConfig::new("eval"), |s| s.get_variable(spec.clone()))
        .unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(engine.stats().blobs_allocated, 1);

    let registered = session.backward_blob("w/out").unwrap();
    assert!(Arc::ptr_eq(&registered, &first));
}

#[test]
fn eager_feed_checks_shape() {
    let (_engine, session) = session_with(SessionConfig::eager());
    session
        .build_job(JobConfig::new("train"), |s| {
            s.get_variable(VariableSpec::new("bias", vec![3]))
        })
        .unwrap();
    assert!(session.fetch_variable("bias").unwrap().data().iter().all(|&v| v == 0.0));

    let wrong = HostTensor::zeros(Shape::new(vec![4]), flowscope::DType::F32);
    let err = session.feed_variable("bias", wrong).unwrap_err();
    assert!(matches!(err, Error::Variable(VariableError::InvalidShape { .. })));

    let value = HostTensor::from_vec(Shape::new(vec![3]), flowscope::DType::F32, vec![1.0, 2.0, 3.0])
        .unwrap();
    session.feed_variable("bias", value).unwrap();
    assert_eq!(session.fetch_variable("bias").unwrap().data(), &[1.0, 2.0, 3.0]);

    let err = session.fetch_variable("missing").unwrap_err();
    assert!(matches!(err, Error::Variable(VariableError::UnknownVariable { .. })));
}

#[test]
fn lazy_variables_cannot_be_fetched() {
    let (_engine, session) = session_with(SessionConfig::default());
    session
        .build_job(JobConfig::new("train"), |s| {
            s.get_variable(VariableSpec::new("w", vec![3]))
        })
        .unwrap();
    let err = session.fetch_variable("w").unwrap_err();
    assert!(matches!(err, Error::Variable(VariableError::NotMaterialized { .. })));
}

#[test]
fn failed_allocation_registers_nothing() {
    let (engine, session) = session_with(SessionConfig::eager());
    let _job = session.enter_job(JobConfig::new("train")).unwrap();

    engine.fail_next(FailPoint::NewVariableBlob);
    let err = session.get_variable(VariableSpec::new("w", vec![2])).unwrap_err();
    assert!(matches!(err, Error::Engine(_)));
    assert!(session.variables().is_empty());
    assert!(session.job_graph("train").unwrap().is_empty());

    let w = session.get_variable(VariableSpec::new("w", vec![2])).unwrap();
    assert_eq!(w.name(), "w");
    assert_eq!(session.variables().len(), 1);
    assert_eq!(engine.blob_count(), 1);
}

#[test]
fn eager_mode_is_chosen_before_init() {
    let (_engine, session) = session_with(SessionConfig::default());
    session.enable_eager_execution(true).unwrap();
    session.init().unwrap();
    assert!(session.is_eager());
    assert_eq!(session.execution_mode(), ExecutionMode::EagerNormal);
    assert!(session.enable_eager_execution(false).is_err());
}

#[test]
fn jobs_do_not_nest_or_repeat() {
    let (_engine, session) = session_with(SessionConfig::default());
    let job = session.enter_job(JobConfig::new("train")).unwrap();
    let err = session.enter_job(JobConfig::new("eval")).err().unwrap();
    assert!(matches!(err, Error::Job(JobError::AlreadyBuilding { .. })));
    drop(job);

    let err = session.enter_job(JobConfig::new("train")).err().unwrap();
    assert!(matches!(err, Error::Job(JobError::DuplicateJob(_))));
    let err = session.enter_job(JobConfig::new("")).err().unwrap();
    assert!(matches!(err, Error::Job(JobError::EmptyJobName)));
}

#[test]
fn eager_ops_run_immediately() {
    let (engine, session) = session_with(SessionConfig::eager());
    session
        .build_job(JobConfig::new("train"), |s| {
            s.get_variable(VariableSpec::new("w", vec![2]))?;
            s.add_op(OpConf::user("relu0", "relu").input("w/out").output("out"))?;
            Ok(())
        })
        .unwrap();
    assert_eq!(engine.executed_ops(), vec!["relu0".to_string()]);

    let graph = session.job_graph("train").unwrap();
    assert_eq!(graph.len(), 2);
    assert_eq!(graph.op("relu0").unwrap().conf.op_type(), "relu");
}

#[test]
fn lazy_ops_are_only_recorded() {
    let (engine, session) = session_with(SessionConfig::default());
    session
        .build_job(JobConfig::new("train"), |s| {
            s.add_op(OpConf::user("matmul0", "matmul").attr("transpose_b", true))?;
            Ok(())
        })
        .unwrap();
    assert!(engine.executed_ops().is_empty());
    assert_eq!(session.job_graph("train").unwrap().len(), 1);
}

#[test]
fn lazy_reuse_across_jobs_must_match_shape_and_dtype() {
    let (_engine, session) = session_with(SessionConfig::default());
    session
        .build_job(JobConfig::new("a"), |s| s.get_variable(VariableSpec::new("w", vec![8])))
        .unwrap();

    let err = session
        .build_job(JobConfig::new("b"), |s| {
            s.get_variable(VariableSpec::new("w", vec![4]).dtype(flowscope::DType::I32))
        })
        .unwrap_err();
    match err {
        Error::Variable(VariableError::Incompatible {
            name,
            job_name,
            existing_shape,
            requested_shape,
            ..
        }) => {
            assert_eq!(name, "w");
            assert_eq!(job_name, "b");
            assert_eq!(existing_shape, vec![8]);
            assert_eq!(requested_shape, vec![4]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(session.job_graph("b").unwrap().is_empty());
    assert_eq!(session.variable("w").unwrap().shape(), &Shape::new(vec![8]));
}

#[test]
fn eager_reuse_across_jobs_must_match_shape() {
    let (engine, session) = session_with(SessionConfig::eager());
    session
        .build_job(JobConfig::new("a"), |s| s.get_variable(VariableSpec::new("w", vec![8])))
        .unwrap();

    let err = session
        .build_job(JobConfig::new("b"), |s| s.get_variable(VariableSpec::new("w", vec![4])))
        .unwrap_err();
    assert!(matches!(err, Error::Variable(VariableError::Incompatible { .. })));
    assert!(err.to_string().contains("[8]"), "{err}");
    assert!(session.job_graph("b").unwrap().is_empty());
    assert_eq!(engine.blob_count(), 1);
}

#[test]
fn failed_eager_op_is_not_recorded() {
    let (engine, session) = session_with(SessionConfig::eager());
    let _job = session.enter_job(JobConfig::new("train")).unwrap();

    engine.fail_next(FailPoint::RunOp);
    let err = session.add_op(OpConf::user("relu0", "relu")).unwrap_err();
    assert!(matches!(err, Error::Engine(_)));
    assert!(session.job_graph("train").unwrap().op("relu0").is_none());
    assert!(engine.executed_ops().is_empty());

    session.add_op(OpConf::user("relu0", "relu")).unwrap();
    assert!(session.job_graph("train").unwrap().op("relu0").is_some());

    // A duplicate name is rejected before it runs.
    let err = session.add_op(OpConf::user("relu0", "relu")).unwrap_err();
    assert!(matches!(err, Error::Job(JobError::DuplicateOp { .. })));
    assert_eq!(engine.executed_ops(), vec!["relu0".to_string()]);
}
