use std::sync::Arc;

use flowscope::logging::init_tracing;
use flowscope::scope::ScopeError;
use flowscope::{AttrValue, DeviceTag, Error, Session, SessionConfig};
use flowscope_engine_ref::RefEngine;

fn session_with(config: SessionConfig) -> Session<RefEngine> {
    init_tracing();
    Session::new(Arc::new(RefEngine::new()), config).unwrap()
}

fn multi_cpu() -> SessionConfig {
    SessionConfig {
        cpu_device_num: Some(4),
        ..SessionConfig::default()
    }
}

#[test]
fn current_scope_requires_init() {
    let session = session_with(SessionConfig::default());
    let err = session.current_scope().unwrap_err();
    assert!(matches!(err, Error::Scope(ScopeError::EmptyStack)));
    assert_eq!(session.scope_depth(), 0);
}

#[test]
fn root_scope_is_cpu_zero() {
    let session = session_with(SessionConfig::default());
    session.init().unwrap();
    let root = session.current_scope().unwrap();
    assert_eq!(root.device_tag(), DeviceTag::Cpu);
    assert_eq!(root.machine_device_ids(), vec!["0:0-0".to_string()]);
    assert_eq!(root.job_name(), "");
    assert!(!root.is_mirrored());
    assert!(root.parent().is_none());
    assert_eq!(session.scope_depth(), 1);
}

#[test]
fn nested_placements_unwind_in_order() {
    let session = session_with(multi_cpu());
    session.init().unwrap();
    let root = session.current_scope().unwrap();

    let outer = session.placement("cpu", "0:0-1", None).unwrap();
    {
        let _outer = outer.enter().unwrap();
        assert_eq!(session.scope_depth(), 2);
        let inner = session.placement("cpu", "0:2-3", None).unwrap();
        {
            let _inner = inner.enter().unwrap();
            let current = session.current_scope().unwrap();
            assert_eq!(current.machine_device_ids(), vec!["0:2-3".to_string()]);
            assert!(Arc::ptr_eq(&current.parent().unwrap(), outer.scope().unwrap()));
            assert_eq!(session.scope_depth(), 3);
        }
        assert!(Arc::ptr_eq(&session.current_scope().unwrap(), outer.scope().unwrap()));
    }
    assert!(Arc::ptr_eq(&session.current_scope().unwrap(), &root));
    assert_eq!(session.scope_depth(), 1);
}

#[test]
fn out_of_order_exit_reports_mismatch() {
    let session = session_with(multi_cpu());
    session.init().unwrap();

    let a = session.placement("cpu", "0:1", None).unwrap();
    let outer = a.enter().unwrap();
    let b = session.placement("cpu", "0:2", None).unwrap();
    let inner = b.enter().unwrap();

    let err = outer.exit().unwrap_err();
    assert!(matches!(err, ScopeError::StackMismatch { .. }));
    // A failed exit does not touch the stack.
    assert_eq!(session.scope_depth(), 3);

    inner.exit().unwrap();
    assert_eq!(session.scope_depth(), 2);
    assert!(Arc::ptr_eq(&session.current_scope().unwrap(), a.scope().unwrap()));
}

#[test]
#[should_panic(expected = "scope guard dropped out of order")]
fn dropping_outer_guard_first_panics() {
    let session = session_with(multi_cpu());
    session.init().unwrap();

    let a = session.placement("cpu", "0:1", None).unwrap();
    let outer = a.enter().unwrap();
    let b = session.placement("cpu", "0:2", None).unwrap();
    let _inner = b.enter().unwrap();
    drop(outer);
}

#[test]
fn scope_config_overrides_declared_attrs() {
    let session = session_with(
        SessionConfig::default()
            .scope_attr("checkpointing", false)
            .scope_attr("pipeline_stage_id_hint", 0i64),
    );
    session.init().unwrap();
    let root = session.current_scope().unwrap();
    assert_eq!(root.attr("checkpointing"), Some(&AttrValue::Bool(false)));

    {
        let guard = session
            .scope_config([("checkpointing", AttrValue::Bool(true))])
            .unwrap();
        let current = session.current_scope().unwrap();
        assert!(Arc::ptr_eq(guard.scope(), &current));
        assert_eq!(current.attr("checkpointing").and_then(AttrValue::as_bool), Some(true));
        assert_eq!(
            current.attr("pipeline_stage_id_hint").and_then(AttrValue::as_i64),
            Some(0)
        );
        assert_eq!(current.placement().id(), root.placement().id());
    }
    assert!(Arc::ptr_eq(&session.current_scope().unwrap(), &root));
}

#[test]
fn scope_config_rejects_unknown_and_mistyped_attrs() {
    let session = session_with(SessionConfig::default().scope_attr("checkpointing", false));
    session.init().unwrap();

    let err = session
        .scope_config([("no_such_attr", AttrValue::Bool(true))])
        .err()
        .unwrap();
    assert!(matches!(err, Error::Scope(ScopeError::UnknownAttr { .. })));

    let err = session
        .scope_config([("checkpointing", AttrValue::Int64(1))])
        .err()
        .unwrap();
    match err {
        Error::Scope(ScopeError::AttrTypeMismatch { name, expected, found }) => {
            assert_eq!(name, "checkpointing");
            assert_eq!(expected, "bool");
            assert_eq!(found, "int64");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(session.scope_depth(), 1);
}

#[test]
fn same_scope_config_twice_reuses_the_symbol() {
    let session = session_with(SessionConfig::default().scope_attr("stage", 0i64));
    session.init().unwrap();

    let first = session
        .scope_config([("stage", AttrValue::Int64(3))])
        .unwrap()
        .scope()
        .clone();
    let count = session.scope_symbol_count();
    let second = session
        .scope_config([("stage", AttrValue::Int64(3))])
        .unwrap()
        .scope()
        .clone();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(session.scope_symbol_count(), count);
}
