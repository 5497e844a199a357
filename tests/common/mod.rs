#![allow(dead_code)]

use esox_connectionpool::ManageResource;

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, thiserror::Error)]
pub enum FakeError {
    #[error("connection refused")]
    Refused,
    #[error("connection reset")]
    Reset,
}

pub struct FakeConnection {
    pub serial: usize,
    pub queries: Vec<String>,
}

/// In-memory stand-in for a database driver.
#[derive(Default)]
pub struct FakeDb {
    pub created: AtomicUsize,
    pub closed: AtomicUsize,
    pub live: AtomicUsize,
    pub max_live: AtomicUsize,
    pub refuse: AtomicBool,
    pub reset: AtomicBool,
    pub check_delay_ms: AtomicU64,
    pub last_check_timeout: Mutex<Option<Duration>>,
}

impl FakeDb {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Make every liveness check take at least `delay`
    pub fn slow_checks(&self, delay: Duration) {
        self.check_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct FakeManager(pub Arc<FakeDb>);

impl ManageResource for FakeManager {
    type Resource = FakeConnection;
    type Error = FakeError;

    fn create(&self) -> Result<FakeConnection, FakeError> {
        if self.0.refuse.load(Ordering::SeqCst) {
            return Err(FakeError::Refused);
        }
        let serial = self.0.created.fetch_add(1, Ordering::SeqCst);
        let live = self.0.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.0.max_live.fetch_max(live, Ordering::SeqCst);
        Ok(FakeConnection {
            serial,
            queries: Vec::new(),
        })
    }

    fn is_alive(&self, _conn: &mut FakeConnection, timeout: Duration) -> Result<(), FakeError> {
        *self.0.last_check_timeout.lock() = Some(timeout);
        thread::sleep(Duration::from_millis(self.0.check_delay_ms.load(Ordering::SeqCst)));
        if self.0.reset.load(Ordering::SeqCst) {
            Err(FakeError::Reset)
        } else {
            Ok(())
        }
    }

    fn execute(&self, conn: &mut FakeConnection, query: &str, timeout: Duration) -> Result<(), FakeError> {
        self.is_alive(conn, timeout)?;
        conn.queries.push(query.to_string());
        Ok(())
    }

    fn close(&self, _conn: FakeConnection) {
        self.0.live.fetch_sub(1, Ordering::SeqCst);
        self.0.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Poll `condition` until it holds or two seconds pass.
pub fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
