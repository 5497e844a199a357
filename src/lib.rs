//! # Esox Connection Pool
//!
//! Thread-safe pool for expensive resources such as database connections,
//! with liveness checks, lifetime management, leak detection and metrics.
//!
//! ## Features
//!
//! - Lock-free hand-off of idle resources with a per-thread fast path
//! - Automatic return of resources via RAII (Drop trait)
//! - Validation of long-idle resources before they are handed out
//! - Max lifetime and idle timeout eviction by a background housekeeper
//! - Leak detection with the borrow site of resources held too long
//! - Suspend/resume and graceful shutdown
//! - Health monitoring, metrics and Prometheus export
//!
//! ## Quick Start
//!
//! ```rust
//! use esox_connectionpool::{ManageResource, Pool, PoolConfiguration};
//! use std::time::Duration;
//!
//! struct Numbers;
//!
//! impl ManageResource for Numbers {
//!     type Resource = u32;
//!     type Error = std::io::Error;
//!
//!     fn create(&self) -> Result<u32, std::io::Error> {
//!         Ok(42)
//!     }
//!
//!     fn is_alive(&self, _n: &mut u32, _timeout: Duration) -> Result<(), std::io::Error> {
//!         Ok(())
//!     }
//! }
//!
//! let pool = Pool::new(Numbers, PoolConfiguration::new().with_max_size(2)).unwrap();
//! {
//!     let n = pool.acquire().unwrap();
//!     println!("Got: {}", *n);
//!     // Resource automatically returned when `n` goes out of scope
//! }
//! pool.shutdown();
//! ```

mod bag;
mod config;
mod entry;
mod errors;
mod health;
mod housekeeper;
mod leak;
mod manager;
mod metrics;
mod pool;
mod resource;
mod suspend;

pub use config::PoolConfiguration;
pub use errors::{BoxError, PoolError, PoolResult};
pub use health::HealthStatus;
pub use manager::ManageResource;
pub use metrics::{MetricsExporter, MetricsRecorder, PoolMetrics, PoolState};
#[cfg(feature = "metrics")]
pub use metrics::PrometheusRecorder;
pub use pool::Pool;
pub use resource::PooledResource;
