//! Borrow/return throughput of the pool, single threaded and under contention.

use std::hint::black_box;
use std::thread;
use std::time::Duration;

use criterion::{Criterion, criterion_group, criterion_main};
use esox_connectionpool::{ManageResource, Pool, PoolConfiguration};

criterion_group!(benches, entrypoint);
criterion_main!(benches);

struct Noop;

impl ManageResource for Noop {
    type Resource = u64;
    type Error = std::io::Error;

    fn create(&self) -> Result<u64, std::io::Error> {
        Ok(0)
    }

    fn is_alive(&self, _conn: &mut u64, _timeout: Duration) -> Result<(), std::io::Error> {
        Ok(())
    }
}

fn entrypoint(c: &mut Criterion) {
    let mut group = c.benchmark_group("borrow");

    let pool = Pool::new(
        Noop,
        PoolConfiguration::new()
            .with_max_size(8)
            .with_min_idle(8)
            .with_alive_bypass_window(Duration::from_secs(3600)),
    )
    .unwrap();

    // same thread keeps hitting its local cache
    group.bench_function("acquire_release", |b| {
        b.iter(|| {
            let conn = pool.acquire().unwrap();
            black_box(*conn);
        });
    });

    group.bench_function("acquire_release_4_threads", |b| {
        b.iter(|| {
            thread::scope(|scope| {
                for _ in 0..4 {
                    scope.spawn(|| {
                        for _ in 0..100 {
                            let mut conn = pool.acquire().unwrap();
                            *conn += 1;
                        }
                    });
                }
            });
        });
    });

    group.finish();
    pool.shutdown();
}
