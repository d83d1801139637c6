//! Process throughput benchmark.
//!
//! Measures end-to-end process latency for growing administration chains and
//! for functions handed to a worker team, using Criterion.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use office_kernel::kernel::{ManagedObjectScope, Office, OfficeBuilder};
use serde_json::{json, Value};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct Counter(u64);

fn administered_office(duties: usize) -> Office {
    let mut builder = OfficeBuilder::new("bench");
    builder.managed_object("counter", ManagedObjectScope::Function, |_deps| Ok(Counter(1)));
    let mut task = builder.function("task", |ctx| {
        let counter = ctx.object::<Counter>(0)?;
        Ok(json!(counter.0))
    });
    task.object("counter");
    for i in 0..duties {
        task.pre_duty(format!("pre{}", i), |_extensions, _ctx| Ok(()));
    }
    builder.open().unwrap()
}

fn bench_administration(c: &mut Criterion) {
    let mut group = c.benchmark_group("administration");
    for &duties in &[0usize, 1, 4, 16] {
        let office = administered_office(duties);
        let manager = office.function_manager("task").unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(duties), &manager, |b, m| {
            b.iter(|| {
                m.invoke_process_and_wait(black_box(Value::Null), WAIT)
                    .unwrap()
            });
        });
        office.close();
    }
    group.finish();
}

fn bench_team_handoff(c: &mut Criterion) {
    let mut builder = OfficeBuilder::new("bench-team");
    builder.team("workers", 4);
    builder
        .function("task", |ctx| Ok(ctx.parameter().clone()))
        .team("workers");
    let office = builder.open().unwrap();
    let manager = office.function_manager("task").unwrap();

    c.bench_function("team_handoff", |b| {
        b.iter(|| {
            manager
                .invoke_process_and_wait(black_box(json!(1)), WAIT)
                .unwrap()
        });
    });
    office.close();
}

criterion_group!(benches, bench_administration, bench_team_handoff);
criterion_main!(benches);
