//! Property tests for administration ordering, failure cut-off and
//! dependency-ordered recycling.

mod common;

use common::*;
use office_kernel::kernel::{EscalationKind, ManagedObjectScope};
use proptest::prelude::*;
use serde_json::Value;

fn config() -> ProptestConfig {
    ProptestConfig {
        cases: 32,
        ..ProptestConfig::default()
    }
}

proptest! {
    #![proptest_config(config())]

    #[test]
    fn duties_surround_function_in_declaration_order(pre in 0usize..6, post in 0usize..6) {
        let trace = Trace::new();
        let (mut builder, _observer) = observed_builder("ordering");
        let t = trace.clone();
        let mut task = builder.function("task", move |_ctx| {
            t.push("task");
            Ok(Value::Null)
        });
        for i in 0..pre {
            let t = trace.clone();
            task.pre_duty(format!("pre{}", i), move |_extensions, _ctx| {
                t.push(format!("pre{}", i));
                Ok(())
            });
        }
        for i in 0..post {
            let t = trace.clone();
            task.post_duty(format!("post{}", i), move |_extensions, _ctx| {
                t.push(format!("post{}", i));
                Ok(())
            });
        }

        let office = builder.open().unwrap();
        let completion = run(&office, "task", Value::Null);
        office.close();

        let expected: Vec<String> = (0..pre)
            .map(|i| format!("pre{}", i))
            .chain(std::iter::once("task".to_string()))
            .chain((0..post).map(|i| format!("post{}", i)))
            .collect();
        prop_assert!(completion.is_success());
        prop_assert_eq!(trace.steps(), expected);
    }

    #[test]
    fn failing_pre_duty_stops_administration(count in 1usize..6, failing in 0usize..6) {
        let failing = failing % count;
        let trace = Trace::new();
        let (mut builder, _observer) = observed_builder("cut-off");
        let t = trace.clone();
        let r = trace.clone();
        builder
            .managed_object("conn", ManagedObjectScope::Function, move |_deps| {
                t.push("bind");
                Ok(Resource { name: "conn".to_string() })
            })
            .recycle(move |_resource| {
                r.push("recycle");
                Ok(())
            });
        let t = trace.clone();
        let mut task = builder.function("task", move |_ctx| {
            t.push("task");
            Ok(Value::Null)
        });
        task.object("conn");
        for i in 0..count {
            let t = trace.clone();
            task.pre_duty(format!("pre{}", i), move |_extensions, _ctx| {
                t.push(format!("pre{}", i));
                if i == failing {
                    return Err(TestFailure::boxed("duty"));
                }
                Ok(())
            });
        }
        let t = trace.clone();
        task.post_duty("post", move |_extensions, _ctx| {
            t.push("post");
            Ok(())
        });

        let office = builder.open().unwrap();
        let completion = run(&office, "task", Value::Null);
        office.close();

        let expected: Vec<String> = std::iter::once("bind".to_string())
            .chain((0..=failing).map(|i| format!("pre{}", i)))
            .chain(std::iter::once("recycle".to_string()))
            .collect();
        prop_assert_eq!(
            completion.escalation().map(|e| e.kind()),
            Some(EscalationKind::DutyFailure)
        );
        prop_assert_eq!(trace.steps(), expected);
    }

    #[test]
    fn dependency_chain_recycles_in_reverse_bind_order(length in 1usize..6) {
        let trace = Trace::new();
        let (mut builder, _observer) = observed_builder("chain");
        for i in 0..length {
            let t = trace.clone();
            let r = trace.clone();
            let mut object = builder.managed_object(
                format!("o{}", i),
                ManagedObjectScope::Function,
                move |_deps| {
                    t.push(format!("bind:o{}", i));
                    Ok(Resource { name: format!("o{}", i) })
                },
            );
            object.recycle(move |resource| {
                r.push(format!("recycle:{}", resource.name));
                Ok(())
            });
            if i > 0 {
                object.depends_on(format!("o{}", i - 1));
            }
        }
        builder
            .function("task", |_ctx| Ok(Value::Null))
            .object(format!("o{}", length - 1));

        let office = builder.open().unwrap();
        let completion = run(&office, "task", Value::Null);
        office.close();

        let expected: Vec<String> = (0..length)
            .map(|i| format!("bind:o{}", i))
            .chain((0..length).rev().map(|i| format!("recycle:o{}", i)))
            .collect();
        prop_assert!(completion.is_success());
        prop_assert_eq!(trace.steps(), expected);
    }
}
