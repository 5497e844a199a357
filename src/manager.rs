//! The contract between the pool and the resources it manages

use std::time::Duration;

/// Creates, checks and closes the resources held by a [`Pool`](crate::Pool).
///
/// The pool never looks inside a resource. Everything it needs to know about
/// the underlying protocol is expressed through this trait.
///
/// # Examples
///
/// ```
/// use esox_connectionpool::ManageResource;
/// use std::time::Duration;
///
/// struct Counter;
///
/// impl ManageResource for Counter {
///     type Resource = u64;
///     type Error = std::io::Error;
///
///     fn create(&self) -> Result<u64, std::io::Error> {
///         Ok(0)
///     }
///
///     fn is_alive(&self, _conn: &mut u64, _timeout: Duration) -> Result<(), std::io::Error> {
///         Ok(())
///     }
/// }
/// ```
pub trait ManageResource: Send + Sync + 'static {
    /// The pooled resource, typically a database connection.
    type Resource: Send + 'static;

    /// Error produced by the factory or the validator.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Open a new resource.
    fn create(&self) -> Result<Self::Resource, Self::Error>;

    /// Per-resource setup run once after `create`, before the resource is pooled.
    fn initialize(&self, _resource: &mut Self::Resource) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Native aliveness check.
    ///
    /// Implementations should honour `timeout`; a check that returns after the
    /// timeout has elapsed is treated as failed anyway.
    fn is_alive(&self, resource: &mut Self::Resource, timeout: Duration) -> Result<(), Self::Error>;

    /// Run a statement on the resource.
    ///
    /// Used for the configured test and init queries. Resources without a
    /// statement interface can keep the default, which falls back to `is_alive`.
    fn execute(
        &self,
        resource: &mut Self::Resource,
        statement: &str,
        timeout: Duration,
    ) -> Result<(), Self::Error> {
        let _ = statement;
        self.is_alive(resource, timeout)
    }

    /// Physically release a resource the pool is done with.
    fn close(&self, resource: Self::Resource) {
        drop(resource);
    }
}
