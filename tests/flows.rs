//! Flow strategies, `next` chaining and team assignment.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::*;
use office_kernel::kernel::{EscalationKind, FlowStrategy, Job, Team};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};

fn current_thread_name() -> String {
    std::thread::current()
        .name()
        .unwrap_or("unnamed")
        .to_string()
}

#[test]
fn test_sequential_flows_run_one_at_a_time_before_slot_advances() {
    let trace = Trace::new();
    let (mut builder, _observer) = observed_builder("sequential");

    let t = trace.clone();
    let mut task = builder.function("task", move |ctx| {
        t.push("task");
        for (index, argument) in [(0, "first"), (1, "second")] {
            let t = t.clone();
            ctx.invoke_flow_with_callback(index, json!(argument), move |outcome| {
                t.push(format!("callback:{}", outcome?));
                Ok(())
            })?;
        }
        Ok(Value::Null)
    });
    task.flow("echo", FlowStrategy::Sequential)
        .flow("echo", FlowStrategy::Sequential);
    let t = trace.clone();
    task.post_duty("after", move |_extensions, _ctx| {
        t.push("after");
        Ok(())
    });
    let t = trace.clone();
    builder.function("echo", move |ctx| {
        t.push(format!("echo:{}", ctx.parameter()));
        Ok(ctx.parameter().clone())
    });

    let office = builder.open().unwrap();
    let completion = run(&office, "task", Value::Null);

    assert!(completion.is_success());
    assert_eq!(
        trace.steps(),
        vec![
            "task",
            "echo:\"first\"",
            "callback:\"first\"",
            "echo:\"second\"",
            "callback:\"second\"",
            "after"
        ]
    );
    office.close();
}

#[test]
fn test_process_waits_for_parallel_and_spawned_flows() {
    let trace = Trace::new();
    let (mut builder, _observer) = observed_builder("concurrent");
    builder.team("slow", 2);

    builder
        .function("task", |ctx| {
            ctx.invoke_flow(0, Value::Null)?;
            ctx.invoke_flow(1, Value::Null)?;
            Ok(json!("task"))
        })
        .flow("parallel", FlowStrategy::Parallel)
        .flow("spawned", FlowStrategy::Spawn);
    for name in ["parallel", "spawned"] {
        let t = trace.clone();
        builder
            .function(name, move |_ctx| {
                std::thread::sleep(Duration::from_millis(30));
                t.push(name);
                Ok(json!(name))
            })
            .team("slow");
    }

    let office = builder.open().unwrap();
    let completion = run(&office, "task", Value::Null);

    assert_eq!(completion.value(), Some(&json!("task")));
    assert!(trace.contains("parallel"));
    assert!(trace.contains("spawned"));
    office.close();
}

#[test]
fn test_next_passes_return_value_as_parameter() {
    let (mut builder, _observer) = observed_builder("next");
    builder
        .function("start", |ctx| Ok(json!(ctx.parameter_as::<i64>()? + 1)))
        .next("double");
    builder
        .function("double", |ctx| Ok(json!(ctx.parameter_as::<i64>()? * 2)))
        .next("describe");
    builder.function("describe", |ctx| {
        Ok(json!(format!("{} from {}", ctx.parameter(), ctx.function_name())))
    });

    let office = builder.open().unwrap();
    let completion = run(&office, "start", json!(4));

    assert_eq!(completion.value(), Some(&json!("10 from describe")));
    office.close();
}

#[test]
fn test_function_runs_on_its_team() {
    let trace = Trace::new();
    let (mut builder, _observer) = observed_builder("handoff");
    builder.team("io", 1);

    let t = trace.clone();
    builder
        .function("task", move |_ctx| {
            t.push(format!("task@{}", current_thread_name()));
            Ok(Value::Null)
        })
        .team("io")
        .next("follow");
    let t = trace.clone();
    builder.function("follow", move |_ctx| {
        t.push(format!("follow@{}", current_thread_name()));
        Ok(Value::Null)
    });

    let office = builder.open().unwrap();
    let completion = run(&office, "task", Value::Null);

    assert!(completion.is_success());
    assert_eq!(trace.steps(), vec!["task@io-worker", "follow@io-worker"]);
    office.close();
}

/// Team running jobs inline while counting assignments.
#[derive(Debug, Default)]
struct CountingTeam {
    assigned: AtomicUsize,
}

impl Team for CountingTeam {
    fn name(&self) -> &str {
        "counting"
    }

    fn assign_job(&self, job: Job) {
        self.assigned.fetch_add(1, Ordering::SeqCst);
        job();
    }
}

#[test]
fn test_custom_team_receives_each_handoff() {
    let team = Arc::new(CountingTeam::default());
    let (mut builder, _observer) = observed_builder("custom-team");
    builder.custom_team("counting", team.clone());

    let mut task = builder.function("task", |_ctx| Ok(Value::Null));
    task.team("counting");
    task.pre_duty("prepare", |_extensions, _ctx| Ok(()))
        .team("counting");

    let office = builder.open().unwrap();
    let completion = run(&office, "task", Value::Null);

    assert!(completion.is_success());
    assert_eq!(team.assigned.load(Ordering::SeqCst), 1);
    office.close();
}

#[test]
fn test_failed_slot_settles_callbacks_of_queued_flows() {
    let trace = Trace::new();
    let (mut builder, _observer) = observed_builder("abandoned");

    let t = trace.clone();
    builder
        .function("task", move |ctx| {
            for index in 0..2 {
                let t = t.clone();
                ctx.invoke_flow_with_callback(index, Value::Null, move |outcome| {
                    let escalation = outcome.unwrap_err();
                    t.push(format!("callback:{}:{}", index, escalation.kind()));
                    Ok(())
                })?;
            }
            Err(TestFailure::boxed("task"))
        })
        .flow("never", FlowStrategy::Sequential)
        .flow("never", FlowStrategy::Sequential);
    let t = trace.clone();
    builder.function("never", move |_ctx| {
        t.push("never");
        Ok(Value::Null)
    });

    let office = builder.open().unwrap();
    let completion = run(&office, "task", Value::Null);

    assert_eq!(
        completion.escalation().map(|e| e.kind()),
        Some(EscalationKind::FunctionFailure)
    );
    assert_eq!(
        trace.steps(),
        vec!["callback:0:function_failure", "callback:1:function_failure"]
    );
    office.close();
}

#[test]
fn test_failed_sequential_flow_abandons_the_rest() {
    let trace = Trace::new();
    let (mut builder, _observer) = observed_builder("sequential-failure");

    let t = trace.clone();
    builder
        .function("task", move |ctx| {
            ctx.invoke_flow(0, Value::Null)?;
            let t = t.clone();
            ctx.invoke_flow_with_callback(1, Value::Null, move |outcome| {
                let escalation = outcome.unwrap_err();
                t.push(format!("callback:{}", escalation.source()));
                Ok(())
            })?;
            Ok(Value::Null)
        })
        .flow("fail", FlowStrategy::Sequential)
        .flow("skipped", FlowStrategy::Sequential);
    let t = trace.clone();
    builder.function("fail", move |_ctx| {
        t.push("fail");
        Err(TestFailure::boxed("fail"))
    });
    let t = trace.clone();
    builder.function("skipped", move |_ctx| {
        t.push("skipped");
        Ok(Value::Null)
    });

    let office = builder.open().unwrap();
    let completion = run(&office, "task", Value::Null);

    assert!(!completion.is_success());
    assert_eq!(
        trace.steps(),
        vec!["fail", "callback:function 'fail'"]
    );
    office.close();
}

#[test]
fn test_unknown_flow_index_is_an_error() {
    let (mut builder, _observer) = observed_builder("unknown-flow");
    builder.function("task", |ctx| {
        let err = ctx.invoke_flow(3, Value::Null).unwrap_err();
        Ok(json!(err.to_string()))
    });

    let office = builder.open().unwrap();
    let completion = run(&office, "task", Value::Null);

    let message = completion.value().and_then(Value::as_str).unwrap().to_string();
    assert!(message.contains("flow 3"), "{}", message);
    office.close();
}

#[test]
fn test_long_next_chain_completes() {
    const LENGTH: usize = 10_000;
    let (mut builder, _observer) = observed_builder("long-chain");
    for index in 0..LENGTH {
        let mut step = builder.function(format!("step{}", index), |ctx| {
            Ok(json!(ctx.parameter_as::<i64>()? + 1))
        });
        if index + 1 < LENGTH {
            step.next(format!("step{}", index + 1));
        }
    }

    let office = builder.open().unwrap();
    let completion = run(&office, "step0", json!(0));

    assert_eq!(completion.value(), Some(&json!(LENGTH)));
    office.close();
}

#[test]
fn test_deeply_nested_sequential_flows_complete() {
    const DEPTH: i64 = 5_000;
    let calls = Arc::new(AtomicUsize::new(0));
    let (mut builder, _observer) = observed_builder("deep-nest");

    let c = calls.clone();
    builder
        .function("nest", move |ctx| {
            c.fetch_add(1, Ordering::SeqCst);
            let depth = ctx.parameter_as::<i64>()?;
            if depth < DEPTH {
                ctx.invoke_flow(0, json!(depth + 1))?;
            }
            Ok(json!(depth))
        })
        .flow("nest", FlowStrategy::Sequential);

    let office = builder.open().unwrap();
    let completion = run(&office, "nest", json!(1));

    assert_eq!(completion.value(), Some(&json!(1)));
    assert_eq!(calls.load(Ordering::SeqCst), DEPTH as usize);
    office.close();
}
