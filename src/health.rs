//! Health monitoring for connection pools

use crate::metrics::PoolState;

/// Health status of a connection pool
///
/// # Examples
///
/// ```
/// use esox_connectionpool::{HealthStatus, PoolState};
///
/// let state = PoolState { total: 4, active: 1, idle: 3, ..PoolState::default() };
/// let health = HealthStatus::new(&state, 10, 2, None);
///
/// assert!(health.is_healthy());
/// assert_eq!(health.idle, 3);
/// ```
#[derive(Debug, Clone)]
pub struct HealthStatus {
    /// Whether the pool is healthy
    pub is_healthy: bool,

    /// Number of warnings detected
    pub warning_count: usize,

    /// Current pool utilization (0.0 to 1.0)
    pub utilization: f64,

    /// Idle resources
    pub idle: usize,

    /// Active resources
    pub active: usize,

    /// Callers waiting for a resource
    pub waiting: usize,

    /// Maximum pool size
    pub max_size: usize,

    /// Most recent creation or validation failure, if any
    pub last_failure: Option<String>,

    /// Warning messages
    pub warnings: Vec<String>,
}

impl HealthStatus {
    /// Create a new health status
    pub fn new(state: &PoolState, max_size: usize, min_idle: usize, last_failure: Option<String>) -> Self {
        let utilization = if max_size > 0 {
            state.active as f64 / max_size as f64
        } else {
            0.0
        };

        let mut warnings = Vec::new();
        let mut is_healthy = true;

        if utilization > 0.9 {
            warnings.push(format!("High utilization: {:.1}%", utilization * 100.0));
            is_healthy = false;
        }

        if state.waiting > 0 && state.idle == 0 {
            warnings.push(format!("{} caller(s) waiting for a resource", state.waiting));
            is_healthy = false;
        }

        if state.idle < min_idle && state.total < max_size {
            warnings.push(format!("Idle resources below minimum ({} < {})", state.idle, min_idle));
        }

        if let Some(failure) = &last_failure {
            warnings.push(format!("Last failure: {}", failure));
            if state.total == 0 {
                is_healthy = false;
            }
        }

        Self {
            is_healthy,
            warning_count: warnings.len(),
            utilization,
            idle: state.idle,
            active: state.active,
            waiting: state.waiting,
            max_size,
            last_failure,
            warnings,
        }
    }

    /// Check if the pool is healthy
    pub fn is_healthy(&self) -> bool {
        self.is_healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_saturated_pool_is_unhealthy() {
        let state = PoolState {
            total: 2,
            active: 2,
            waiting: 3,
            ..PoolState::default()
        };
        let health = HealthStatus::new(&state, 2, 1, None);

        assert!(!health.is_healthy());
        assert_eq!(health.warning_count, 2);
    }

    #[test]
    fn test_failing_factory_with_empty_pool() {
        let health = HealthStatus::new(&PoolState::default(), 4, 1, Some("connection refused".into()));

        assert!(!health.is_healthy());
        assert!(health.warnings.iter().any(|w| w.contains("connection refused")));
    }

    #[test]
    fn test_low_idle_is_only_a_warning() {
        let state = PoolState {
            total: 1,
            active: 1,
            ..PoolState::default()
        };
        let health = HealthStatus::new(&state, 10, 2, None);

        assert!(health.is_healthy());
        assert_eq!(health.warning_count, 1);
    }
}
