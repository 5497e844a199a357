//! Borrowed resources that return to the pool when dropped

use crate::bag::BagItem;
use crate::leak::LeakTask;
use crate::manager::ManageResource;
use crate::pool::{Entry, PoolInner};

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Instant;

/// A resource borrowed from a [`Pool`](crate::Pool).
///
/// Dereferences to the underlying resource and hands it back to the pool
/// when dropped.
pub struct PooledResource<M: ManageResource> {
    resource: Option<M::Resource>,
    entry: Arc<Entry<M>>,
    pool: Arc<PoolInner<M>>,
    leak: Option<LeakTask>,
    borrowed_at: Instant,
    broken: bool,
}

impl<M: ManageResource> PooledResource<M> {
    pub(crate) fn new(
        pool: Arc<PoolInner<M>>,
        entry: Arc<Entry<M>>,
        resource: M::Resource,
        leak: Option<LeakTask>,
    ) -> Self {
        Self {
            resource: Some(resource),
            entry,
            pool,
            leak,
            borrowed_at: Instant::now(),
            broken: false,
        }
    }

    /// Pool-unique id of this resource
    pub fn id(&self) -> u64 {
        self.entry.id()
    }

    pub fn created_at(&self) -> Instant {
        self.entry.created_at()
    }

    /// When this resource was last handed out or returned
    pub fn last_access_at(&self) -> Instant {
        self.entry.last_access_at()
    }

    /// When this resource will be retired, if it has a max lifetime
    pub fn expires_at(&self) -> Option<Instant> {
        self.entry.expires_at()
    }

    /// Flag the resource as unusable so it is closed instead of returned.
    pub fn mark_broken(&mut self) {
        self.broken = true;
        self.entry.mark_evicted();
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Close the resource now instead of returning it to the pool
    pub fn close(mut self) {
        self.broken = true;
    }

    /// Take the resource out of the pool for good.
    ///
    /// The pool forgets about it and will create a replacement if needed;
    /// closing it becomes the caller's responsibility.
    pub fn detach(mut self) -> M::Resource {
        if let Some(leak) = self.leak.take() {
            leak.cancel();
        }
        self.pool.detach(&self.entry);
        self.resource.take().expect("Resource already taken")
    }
}

impl<M: ManageResource> Deref for PooledResource<M> {
    type Target = M::Resource;

    fn deref(&self) -> &Self::Target {
        self.resource.as_ref().expect("Resource already taken")
    }
}

impl<M: ManageResource> DerefMut for PooledResource<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.resource.as_mut().expect("Resource already taken")
    }
}

impl<M: ManageResource> fmt::Debug for PooledResource<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledResource")
            .field("id", &self.entry.id())
            .field("borrowed_at", &self.borrowed_at)
            .field("broken", &self.broken)
            .finish()
    }
}

impl<M: ManageResource> Drop for PooledResource<M> {
    fn drop(&mut self) {
        if let Some(leak) = self.leak.take() {
            leak.cancel();
        }
        if let Some(resource) = self.resource.take() {
            self.pool
                .release(&self.entry, resource, self.broken, self.borrowed_at.elapsed());
        }
    }
}
