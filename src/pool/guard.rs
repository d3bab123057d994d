//! The checkout guard handed out by `HandlePool::acquire`.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use tracing::warn;

use crate::core::db::Handle;
use crate::core::Result;
use crate::pool::{AccessMode, PoolInner};

/// Exclusive use of one pooled `Handle`.
///
/// The guard owns the handle while it is checked out, so no other caller
/// can reach it. Returning it with `release` reports bookkeeping errors;
/// dropping the guard returns it too, logging any error instead.
pub struct PooledHandle {
    pool: Arc<PoolInner>,
    /// None only after the handle has been given back
    handle: Option<Handle>,
    mode: AccessMode,
}

impl PooledHandle {
    pub(crate) fn new(pool: Arc<PoolInner>, handle: Handle, mode: AccessMode) -> Self {
        PooledHandle {
            pool,
            handle: Some(handle),
            mode,
        }
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    /// Returns the handle to its pool.
    pub fn release(mut self) -> Result<()> {
        match self.handle.take() {
            Some(handle) => self.pool.check_in(handle, self.mode),
            None => Ok(()),
        }
    }

    pub(crate) fn belongs_to(&self, pool: &Arc<PoolInner>) -> bool {
        Arc::ptr_eq(&self.pool, pool)
    }
}

impl Deref for PooledHandle {
    type Target = Handle;

    fn deref(&self) -> &Handle {
        self.handle.as_ref().expect("pooled handle used after release")
    }
}

impl DerefMut for PooledHandle {
    fn deref_mut(&mut self) -> &mut Handle {
        self.handle.as_mut().expect("pooled handle used after release")
    }
}

impl Drop for PooledHandle {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let id = handle.id();
            if let Err(err) = self.pool.check_in(handle, self.mode) {
                warn!(handle = %id, error = %err, "failed to return handle to pool on drop");
            }
        }
    }
}

impl fmt::Debug for PooledHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledHandle")
            .field("handle", &self.handle.as_ref().map(Handle::id))
            .field("mode", &self.mode)
            .finish()
    }
}
