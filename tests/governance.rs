//! Governance: registration on activation and bind, snapshot enforcement,
//! automatic enforcement on scope close, manual mode and failures.

mod common;

use common::*;
use office_kernel::kernel::{
    EscalationKind, GovernanceFailure, GovernanceState, ManagedObjectScope, OfficeBuilder,
};
use pretty_assertions::assert_eq;
use serde_json::Value;

/// Declare a governed `Resource` whose recycle is traced.
fn governed_object(
    builder: &mut OfficeBuilder,
    name: &'static str,
    scope: ManagedObjectScope,
    trace: &Trace,
) {
    let t = trace.clone();
    builder
        .managed_object(name, scope, move |_deps| {
            Ok(Resource {
                name: name.to_string(),
            })
        })
        .extension::<Handle, _>(|resource| Ok(Handle(resource.name.clone())))
        .governance("tx")
        .recycle(move |resource| {
            t.push(format!("recycle:{}", resource.name));
            Ok(())
        });
}

#[test]
fn test_function_scope_governance_enforced_before_unload() {
    let trace = Trace::new();
    let (mut builder, _observer) = observed_builder("auto-function");
    governed_object(&mut builder, "conn", ManagedObjectScope::Function, &trace);
    builder.governance::<Handle, _>("tx", RecordingGovernance::new(&trace));

    let mut task = builder.function("task", |_ctx| Ok(Value::Null));
    task.object("conn");
    task.pre_duty("begin", |_extensions, ctx| {
        let governance = ctx.governance(0)?;
        governance.activate()?;
        assert_eq!(governance.state(), GovernanceState::Active);
        Ok(())
    })
    .governance("tx");

    let office = builder.open().unwrap();
    let completion = run(&office, "task", Value::Null);

    assert!(completion.is_success());
    assert_eq!(trace.steps(), vec!["enforce[conn]", "recycle:conn"]);
    office.close();
}

#[test]
fn test_objects_bound_after_activation_register_until_thread_close() {
    let trace = Trace::new();
    let (mut builder, _observer) = observed_builder("late-bind");
    governed_object(&mut builder, "first", ManagedObjectScope::Thread, &trace);
    governed_object(&mut builder, "second", ManagedObjectScope::Thread, &trace);
    builder.governance::<Handle, _>("tx", RecordingGovernance::new(&trace));

    let mut task = builder.function("task", |_ctx| Ok(Value::Null));
    task.object("first").next("follow");
    task.pre_duty("begin", |_extensions, ctx| ctx.governance(0)?.activate())
        .governance("tx");
    builder
        .function("follow", |_ctx| Ok(Value::Null))
        .object("second");

    let office = builder.open().unwrap();
    let completion = run(&office, "task", Value::Null);

    assert!(completion.is_success());
    assert_eq!(
        trace.steps(),
        vec!["enforce[first,second]", "recycle:second", "recycle:first"]
    );
    office.close();
}

#[test]
fn test_enforce_uses_snapshot_at_call_time() {
    let trace = Trace::new();
    let (mut builder, observer) = observed_builder("snapshot");
    governed_object(&mut builder, "first", ManagedObjectScope::Thread, &trace);
    governed_object(&mut builder, "second", ManagedObjectScope::Thread, &trace);
    builder.governance::<Handle, _>("tx", RecordingGovernance::new(&trace));

    let mut task = builder.function("task", |_ctx| Ok(Value::Null));
    task.object("first").next("follow");
    task.pre_duty("commit", |_extensions, ctx| {
        let governance = ctx.governance(0)?;
        governance.activate()?;
        governance.enforce()?;
        assert_eq!(governance.state(), GovernanceState::Inactive);
        Ok(())
    })
    .governance("tx");
    builder
        .function("follow", |_ctx| Ok(Value::Null))
        .object("second");

    let office = builder.open().unwrap();
    let completion = run(&office, "task", Value::Null);

    assert!(completion.is_success());
    assert_eq!(
        trace.steps(),
        vec!["enforce[first]", "recycle:second", "recycle:first"]
    );
    let enforcements = observer
        .trace()
        .into_iter()
        .filter(|e| e == "enforce:tx")
        .count();
    assert_eq!(enforcements, 1);
    office.close();
}

#[test]
fn test_manual_mode_never_enforces_or_disregards() {
    let trace = Trace::new();
    let (mut builder, _observer) = observed_builder("manual");
    builder.manual_governance(true);
    governed_object(&mut builder, "conn", ManagedObjectScope::Function, &trace);
    governed_object(&mut builder, "session", ManagedObjectScope::Thread, &trace);
    builder.governance::<Handle, _>("tx", RecordingGovernance::new(&trace));

    let mut task = builder.function("task", |_ctx| Ok(Value::Null));
    task.object("conn").object("session");
    task.pre_duty("begin", |_extensions, ctx| ctx.governance(0)?.activate())
        .governance("tx");

    let office = builder.open().unwrap();
    assert!(office.metadata().is_manual_governance());
    let completion = run(&office, "task", Value::Null);

    assert!(completion.is_success());
    assert!(completion.cleanup_escalations.is_empty());
    assert_eq!(trace.steps(), vec!["recycle:conn", "recycle:session"]);
    office.close();
}

#[test]
fn test_escalated_function_disregards_active_governance() {
    let trace = Trace::new();
    let (mut builder, _observer) = observed_builder("disregard");
    governed_object(&mut builder, "conn", ManagedObjectScope::Function, &trace);
    builder.governance::<Handle, _>("tx", RecordingGovernance::new(&trace));

    let mut task = builder.function("task", |_ctx| Err(TestFailure::boxed("body")));
    task.object("conn");
    task.pre_duty("begin", |_extensions, ctx| ctx.governance(0)?.activate())
        .governance("tx");

    let office = builder.open().unwrap();
    let completion = run(&office, "task", Value::Null);

    assert!(!completion.is_success());
    assert_eq!(trace.steps(), vec!["disregard[conn]", "recycle:conn"]);
    office.close();
}

#[test]
fn test_failed_enforcement_escalates() {
    let trace = Trace::new();
    let (mut builder, _observer) = observed_builder("enforce-failure");
    governed_object(&mut builder, "conn", ManagedObjectScope::Function, &trace);
    builder.governance::<Handle, _>("tx", RecordingGovernance::failing(&trace));

    let mut task = builder.function("task", |_ctx| Ok(Value::Null));
    task.object("conn");
    task.pre_duty("begin", |_extensions, ctx| ctx.governance(0)?.activate())
        .governance("tx");

    let office = builder.open().unwrap();
    let completion = run(&office, "task", Value::Null);

    let escalation = completion.escalation().unwrap();
    assert_eq!(escalation.kind(), EscalationKind::GovernanceFailure);
    let failure = escalation.downcast_ref::<GovernanceFailure>().unwrap();
    assert_eq!(failure.governance, "tx");
    assert_eq!(failure.action, "enforce");
    assert_eq!(trace.steps(), vec!["enforce[conn]", "recycle:conn"]);
    office.close();
}

#[test]
fn test_governance_over_object_type_without_extension() {
    let trace = Trace::new();
    let (mut builder, _observer) = observed_builder("raw-type");
    builder
        .managed_object("conn", ManagedObjectScope::Function, |_deps| Ok(Handle("raw".to_string())))
        .governance("tx");
    builder.governance::<Handle, _>("tx", RecordingGovernance::new(&trace));

    let mut task = builder.function("task", |_ctx| Ok(Value::Null));
    task.object("conn");
    task.post_duty("commit", |_extensions, ctx| {
        let governance = ctx.governance(0)?;
        governance.activate()?;
        governance.enforce()
    })
    .governance("tx");

    let office = builder.open().unwrap();
    let completion = run(&office, "task", Value::Null);

    assert!(completion.is_success());
    assert_eq!(trace.steps(), vec!["enforce[raw]"]);
    office.close();
}
