//! Asynchronous flows: exactly-once settlement, return value override,
//! failure, timeouts, completion from other threads and cancellation on
//! office close.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::*;
use office_kernel::kernel::{
    AsynchronousFlow, AsynchronousFlowTimeout, EscalationKind, ProcessCancelled,
};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};

type Parked = Arc<Mutex<Option<AsynchronousFlow>>>;

fn parked() -> Parked {
    Arc::new(Mutex::new(None))
}

fn take(parked: &Parked) -> AsynchronousFlow {
    parked.lock().unwrap().take().unwrap()
}

#[test]
fn test_settles_exactly_once_and_overrides_return_value() {
    let slot = parked();
    let (mut builder, _observer) = observed_builder("exactly-once");
    let s = slot.clone();
    builder.function("task", move |ctx| {
        *s.lock().unwrap() = Some(ctx.create_asynchronous_flow());
        Ok(json!("body"))
    });

    let office = builder.open().unwrap();
    let completions = start(&office, "task", Value::Null);
    assert!(completions.try_recv().is_err());

    let flow = take(&slot);
    let clone = flow.clone();
    assert!(!flow.is_settled());
    assert!(flow.complete(Some(json!("async"))));
    assert!(clone.is_settled());
    assert!(!clone.complete(Some(json!("again"))));
    assert!(!clone.fail(TestFailure::boxed("late")));

    let completion = completions.recv_timeout(WAIT).unwrap();
    assert_eq!(completion.value(), Some(&json!("async")));
    assert!(completions.try_recv().is_err());
    office.close();
}

#[test]
fn test_complete_without_value_keeps_body_result() {
    let slot = parked();
    let (mut builder, _observer) = observed_builder("keep-value");
    let s = slot.clone();
    builder.function("task", move |ctx| {
        *s.lock().unwrap() = Some(ctx.create_asynchronous_flow());
        Ok(json!("body"))
    });

    let office = builder.open().unwrap();
    let completions = start(&office, "task", Value::Null);
    take(&slot).complete(None);

    let completion = completions.recv_timeout(WAIT).unwrap();
    assert_eq!(completion.value(), Some(&json!("body")));
    office.close();
}

#[test]
fn test_duty_completion_value_is_ignored() {
    let (mut builder, _observer) = observed_builder("duty-value");
    let mut task = builder.function("task", |ctx| Ok(ctx.parameter().clone()));
    task.pre_duty("prepare", |_extensions, ctx| {
        let flow = ctx.create_asynchronous_flow();
        flow.complete(Some(json!("from duty")));
        Ok(())
    });

    let office = builder.open().unwrap();
    let completion = run(&office, "task", json!("parameter"));

    assert_eq!(completion.value(), Some(&json!("parameter")));
    office.close();
}

#[test]
fn test_fail_escalates_from_slot() {
    let slot = parked();
    let trace = Trace::new();
    let (mut builder, _observer) = observed_builder("fail");
    let s = slot.clone();
    let mut task = builder.function("task", move |ctx| {
        *s.lock().unwrap() = Some(ctx.create_asynchronous_flow());
        Ok(Value::Null)
    });
    let t = trace.clone();
    task.post_duty("after", move |_extensions, _ctx| {
        t.push("after");
        Ok(())
    });

    let office = builder.open().unwrap();
    let completions = start(&office, "task", Value::Null);
    assert!(take(&slot).fail(TestFailure("remote".to_string())));

    let completion = completions.recv_timeout(WAIT).unwrap();
    let escalation = completion.escalation().unwrap();
    assert_eq!(escalation.kind(), EscalationKind::FunctionFailure);
    assert!(escalation.is::<TestFailure>());
    assert!(trace.steps().is_empty());
    office.close();
}

#[test]
fn test_unsettled_flow_times_out() {
    let slot = parked();
    let (mut builder, _observer) = observed_builder("timeout");
    let s = slot.clone();
    builder
        .function("task", move |ctx| {
            *s.lock().unwrap() = Some(ctx.create_asynchronous_flow());
            Ok(Value::Null)
        })
        .asynchronous_flow_timeout(Duration::from_millis(50));

    let office = builder.open().unwrap();
    let completion = start(&office, "task", Value::Null)
        .recv_timeout(WAIT)
        .unwrap();

    let escalation = completion.escalation().unwrap();
    assert_eq!(escalation.kind(), EscalationKind::AsynchronousFlowTimeout);
    assert_eq!(
        escalation.downcast_ref::<AsynchronousFlowTimeout>(),
        Some(&AsynchronousFlowTimeout {
            timeout: Duration::from_millis(50)
        })
    );
    let flow = take(&slot);
    assert!(flow.is_settled());
    assert!(!flow.complete(None));
    office.close();
}

#[test]
fn test_office_default_timeout_applies_to_duties() {
    let (mut builder, _observer) = observed_builder("default-timeout");
    builder.asynchronous_flow_timeout(Duration::from_millis(50));
    let mut task = builder.function("task", |_ctx| Ok(Value::Null));
    task.pre_duty("wait", |_extensions, ctx| {
        // Dropped unsettled; only the timeout can release the slot.
        let _flow = ctx.create_asynchronous_flow();
        Ok(())
    });

    let office = builder.open().unwrap();
    let completion = run(&office, "task", Value::Null);

    let escalation = completion.escalation().unwrap();
    assert_eq!(escalation.kind(), EscalationKind::AsynchronousFlowTimeout);
    office.close();
}

#[test]
fn test_completed_from_executor_thread() {
    let (mut builder, _observer) = observed_builder("executor");
    builder.function("task", |ctx| {
        let flow = ctx.create_asynchronous_flow();
        let caller = std::thread::current().id();
        ctx.executor().execute(move || {
            let remote = std::thread::current().id() != caller;
            flow.complete(Some(json!({ "remote": remote })));
        });
        Ok(Value::Null)
    });

    let office = builder.open().unwrap();
    let completion = run(&office, "task", Value::Null);

    assert_eq!(completion.value(), Some(&json!({ "remote": true })));
    office.close();
}

#[test]
fn test_close_fires_callback_of_parked_process() {
    let trace = Trace::new();
    let (mut builder, _observer) = observed_builder("close-parked");
    let mut task = builder.function("task", |ctx| {
        // Only the office can release the slot once the handle is dropped.
        let _flow = ctx.create_asynchronous_flow();
        Ok(json!("body"))
    });
    let t = trace.clone();
    task.post_duty("after", move |_extensions, _ctx| {
        t.push("after");
        Ok(())
    });

    let office = builder.open().unwrap();
    let completions = start(&office, "task", Value::Null);
    assert!(completions.try_recv().is_err());

    office.close();
    let completion = completions.recv_timeout(WAIT).unwrap();

    let escalation = completion.escalation().unwrap();
    assert_eq!(escalation.kind(), EscalationKind::Cancelled);
    let cancelled = escalation.downcast_ref::<ProcessCancelled>().unwrap();
    assert!(cancelled.reason.contains("close-parked"), "{}", cancelled.reason);
    assert!(trace.steps().is_empty());
    assert!(completions.try_recv().is_err());
}
