//! Basic usage of the connection pool with a simulated database driver

use esox_connectionpool::{ManageResource, Pool, PoolConfiguration, PoolError};

use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
#[error("driver error: {0}")]
struct DriverError(String);

struct Connection {
    session: u32,
}

struct Driver {
    sessions: AtomicU32,
}

impl ManageResource for Driver {
    type Resource = Connection;
    type Error = DriverError;

    fn create(&self) -> Result<Connection, DriverError> {
        thread::sleep(Duration::from_millis(20));
        Ok(Connection {
            session: self.sessions.fetch_add(1, Ordering::SeqCst),
        })
    }

    fn is_alive(&self, conn: &mut Connection, _timeout: Duration) -> Result<(), DriverError> {
        if conn.session == u32::MAX {
            return Err(DriverError("session closed".into()));
        }
        Ok(())
    }

    fn close(&self, conn: Connection) {
        println!("   closing session {}", conn.session);
    }
}

fn main() -> Result<(), PoolError> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    println!("=== Esox Connection Pool - Basic Example ===\n");

    let config = PoolConfiguration::new()
        .with_name("demo")
        .with_max_size(4)
        .with_min_idle(2)
        .with_acquire_timeout(Duration::from_millis(500))
        .with_leak_threshold(Duration::from_secs(2));
    let pool = Pool::new(Driver { sessions: AtomicU32::new(0) }, config)?;

    println!("1. Borrow and return:");
    {
        let conn = pool.acquire()?;
        println!("   got session {} (resource {})", conn.session, conn.id());
    }
    println!("   idle after return: {}\n", pool.idle_count());

    println!("2. Concurrent workers:");
    let workers: Vec<_> = (0..8)
        .map(|worker| {
            let pool = pool.clone();
            thread::spawn(move || {
                for _ in 0..5 {
                    match pool.acquire() {
                        Ok(conn) => {
                            thread::sleep(Duration::from_millis(10));
                            let _ = (worker, conn.session);
                        }
                        Err(err) => println!("   worker {worker}: {err}"),
                    }
                }
            })
        })
        .collect();
    for worker in workers {
        let _ = worker.join();
    }
    println!("   state: {:?}\n", pool.state());

    println!("3. Exhaustion:");
    let held: Vec<_> = (0..4).filter_map(|_| pool.acquire().ok()).collect();
    match pool.acquire() {
        Ok(_) => println!("   unexpectedly got a fifth connection"),
        Err(err) => println!("   {err}"),
    }
    drop(held);
    println!();

    println!("4. Metrics and health:");
    let metrics = pool.get_metrics();
    println!("   acquired: {}, created: {}", metrics.total_acquired, metrics.total_created);
    let health = pool.get_health_status();
    println!("   healthy: {}, warnings: {:?}\n", health.is_healthy(), health.warnings);
    print!("{}", pool.export_metrics_prometheus(pool.name(), None));

    println!("\n5. Shutdown:");
    pool.shutdown();
    Ok(())
}
