//! Benchmarks for scope entry and group spawn overhead.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use taskscope::{CancelScope, Error, TaskGroup};

fn scope_benchmark(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime");

    c.bench_function("scope_run_no_deadline", |b| {
        b.iter(|| {
            rt.block_on(async {
                let scope = CancelScope::new(None);
                scope.run(async { Ok::<_, Error>(black_box(42)) }).await
            })
        })
    });
}

fn group_benchmark(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime");

    c.bench_function("group_spawn_join_10", |b| {
        b.iter(|| {
            rt.block_on(async {
                let group = TaskGroup::new();
                group
                    .run(|g| async move {
                        for n in 0..10 {
                            g.spawn(async move { Ok(black_box(n)) })?;
                        }
                        Ok(())
                    })
                    .await
            })
        })
    });
}

criterion_group!(benches, scope_benchmark, group_benchmark);
criterion_main!(benches);
