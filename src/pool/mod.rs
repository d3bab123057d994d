//! Bounded, thread-safe pool of `Handle`s over one database file.
//!
//! The pool turns "one connection, many threads" into "a bounded set of
//! connections with checkout and return". It grows lazily up to
//! `max_size`; when every handle is out, `acquire` blocks and waiters are
//! served first-come, first-served. `shutdown` stops new checkouts, waits for
//! every outstanding handle to come back, then closes them all.
//!
//! # Example
//!
//! ```no_run
//! use handlepool::{AccessMode, HandlePool, params};
//!
//! let pool = HandlePool::open("app.db", 4)?;
//! let handle = pool.acquire(AccessMode::Exclusive)?;
//! handle.execute("CREATE TABLE IF NOT EXISTS kv (k TEXT PRIMARY KEY, v TEXT)", params![])?;
//! handle.release()?;
//!
//! pool.shutdown()?;
//! # Ok::<(), handlepool::DbError>(())
//! ```

mod guard;
mod state;

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::core::db::{Handle, HandleId, TransactionState};
use crate::core::{DbError, Result};

pub use guard::PooledHandle;
pub use state::{Lifecycle, PoolStatus};

use state::PoolState;

/// How a caller intends to use a checked-out handle.
///
/// Both modes give the caller sole use of the handle. `Shared` is a reader
/// lease: the handle is switched to `PRAGMA query_only` for the duration of
/// the checkout, so writes fail inside the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessMode {
    #[default]
    Exclusive,
    Shared,
}

/// A cloneable reference to one pool. Clones share the same handles.
#[derive(Clone)]
pub struct HandlePool {
    inner: Arc<PoolInner>,
}

pub(crate) struct PoolInner {
    config: PoolConfig,
    state: Mutex<PoolState>,
    /// Signalled whenever a checkout ends or a reservation settles while not Active
    drained: Condvar,
}

impl HandlePool {
    /// Creates a pool. No handle is opened until the first `acquire`.
    pub fn new(config: PoolConfig) -> Result<Self> {
        config.validate()?;
        info!(path = %config.path.display(), max_size = config.max_size, "created handle pool");
        Ok(HandlePool {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState::new(config.max_size)),
                config,
                drained: Condvar::new(),
            }),
        })
    }

    /// Creates a pool over `path` with default settings and `max_size` handles.
    pub fn open<P: Into<PathBuf>>(path: P, max_size: usize) -> Result<Self> {
        Self::new(PoolConfig::new(path).with_max_size(max_size))
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Checks out a handle, waiting at most the configured `acquire_timeout`
    /// (or indefinitely when none is configured).
    ///
    /// # Errors
    ///
    /// - `DbError::PoolClosed` once shutdown has begun, including for callers
    ///   already waiting when it starts
    /// - `DbError::Timeout` if no handle frees up in time
    /// - `DbError::Connection` if a new handle had to be opened and that failed
    pub fn acquire(&self, mode: AccessMode) -> Result<PooledHandle> {
        self.checkout(mode, self.inner.config.acquire_timeout())
    }

    /// Checks out a handle, waiting at most `timeout`. `Duration::MAX`
    /// waits indefinitely.
    pub fn acquire_timeout(&self, mode: AccessMode, timeout: Duration) -> Result<PooledHandle> {
        self.checkout(mode, Some(timeout))
    }

    /// Checks out a handle only if one is available right now.
    pub fn try_acquire(&self, mode: AccessMode) -> Result<PooledHandle> {
        self.checkout(mode, Some(Duration::ZERO))
    }

    /// Returns a checked-out handle.
    ///
    /// A guard from a different pool is a `DbError::Invariant`; that guard
    /// still goes back to its own pool when it is dropped.
    pub fn release(&self, handle: PooledHandle) -> Result<()> {
        if !handle.belongs_to(&self.inner) {
            return Err(DbError::Invariant(format!(
                "handle {} was not checked out from this pool",
                handle.id()
            )));
        }
        handle.release()
    }

    /// Runs `f` with a checked-out handle and returns it afterwards.
    pub fn with_handle<T, F>(&self, mode: AccessMode, f: F) -> Result<T>
    where
        F: FnOnce(&Handle) -> Result<T>,
    {
        let handle = self.acquire(mode)?;
        let result = f(&handle);
        let released = handle.release();
        let value = result?;
        released?;
        Ok(value)
    }

    pub fn status(&self) -> PoolStatus {
        self.inner.lock_state().status()
    }

    /// Stops handing out handles, waits for every checked-out handle to be
    /// returned, then closes them all.
    ///
    /// Idempotent: later or concurrent calls return once the pool is shut
    /// down. Calling this while holding a handle from the same pool deadlocks.
    pub fn shutdown(&self) -> Result<()> {
        self.drain(None)
    }

    /// Like `shutdown`, but gives up with `DbError::Timeout` if handles are
    /// still out after `timeout`. The pool stays draining in that case.
    pub fn shutdown_timeout(&self, timeout: Duration) -> Result<()> {
        self.drain(Some(timeout))
    }

    fn checkout(&self, mode: AccessMode, timeout: Option<Duration>) -> Result<PooledHandle> {
        let deadline = deadline_after(timeout);
        let mut ticket: Option<(u64, Arc<Condvar>)> = None;
        let mut state = self.inner.lock_state();

        loop {
            let queued = ticket.as_ref().map(|(t, _)| *t);
            if state.lifecycle != Lifecycle::Active {
                if let Some(t) = queued {
                    state.dequeue(t);
                }
                return Err(DbError::PoolClosed);
            }

            if state.is_next(queued) {
                if let Some(handle) = state.take_free() {
                    if let Some(t) = queued {
                        state.dequeue(t);
                    }
                    state.wake_next();
                    drop(state);
                    debug!(handle = %handle.id(), ?mode, "checked out handle");
                    return self.lease(handle, mode);
                }
                if let Some(id) = state.reserve_slot() {
                    if let Some(t) = queued {
                        state.dequeue(t);
                    }
                    state.wake_next();
                    drop(state);
                    return self.open_reserved(id, mode);
                }
            }

            let (_, signal) = ticket.get_or_insert_with(|| state.enqueue());
            let signal = Arc::clone(signal);
            state = match deadline {
                None => signal.wait(state).unwrap_or_else(PoisonError::into_inner),
                Some((limit, deadline)) => {
                    let now = Instant::now();
                    if now >= deadline {
                        if let Some((t, _)) = &ticket {
                            state.dequeue(*t);
                        }
                        // The slot at the head of the queue may have just become ours to pass on.
                        state.wake_next();
                        debug!(?limit, "timed out waiting for a handle");
                        return Err(DbError::Timeout(limit));
                    }
                    signal
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    /// Opens the handle for a reserved slot. The pool lock is not held while
    /// the engine opens the file.
    fn open_reserved(&self, id: HandleId, mode: AccessMode) -> Result<PooledHandle> {
        let opened = open_handle(&self.inner.config, id);
        let mut state = self.inner.lock_state();
        match opened {
            Ok(handle) if state.lifecycle == Lifecycle::Active => {
                state.finish_open(id, true);
                let open = state.open_count();
                drop(state);
                info!(handle = %id, open, max_size = self.inner.config.max_size, "pool grew");
                self.lease(handle, mode)
            }
            Ok(mut handle) => {
                // Shutdown began while the file was being opened.
                drop(state);
                if let Err(err) = handle.close() {
                    debug!(handle = %id, error = %err, "closing handle opened during shutdown failed");
                }
                let mut state = self.inner.lock_state();
                state.finish_open(id, false);
                self.inner.drained.notify_all();
                Err(DbError::PoolClosed)
            }
            Err(err) => {
                state.finish_open(id, false);
                state.wake_next();
                self.inner.drained.notify_all();
                debug!(handle = %id, error = %err, "failed to open pooled handle");
                Err(err)
            }
        }
    }

    fn lease(&self, handle: Handle, mode: AccessMode) -> Result<PooledHandle> {
        let guard = PooledHandle::new(Arc::clone(&self.inner), handle, mode);
        if mode == AccessMode::Shared {
            guard.pragma_update("query_only", true)?;
        }
        Ok(guard)
    }

    fn drain(&self, timeout: Option<Duration>) -> Result<()> {
        let deadline = deadline_after(timeout);
        let mut state = self.inner.lock_state();

        if state.lifecycle == Lifecycle::Active {
            state.lifecycle = Lifecycle::Draining;
            state.wake_all();
            info!(checked_out = state.status().checked_out, "pool draining");
        }

        loop {
            if state.lifecycle == Lifecycle::Shutdown {
                return Ok(());
            }
            if state.is_drained() {
                let handles = state.drain_free();
                let closed = handles.len();
                let mut first_error = None;
                for mut handle in handles {
                    if let Err(err) = handle.close() {
                        first_error.get_or_insert(err);
                    }
                }
                state.lifecycle = Lifecycle::Shutdown;
                self.inner.drained.notify_all();
                info!(closed, "pool shut down");
                return first_error.map_or(Ok(()), Err);
            }

            state = match deadline {
                None => self
                    .inner
                    .drained
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some((limit, deadline)) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(DbError::Timeout(limit));
                    }
                    self.inner
                        .drained
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }
}

impl fmt::Debug for HandlePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlePool")
            .field("path", &self.inner.config.path)
            .field("status", &self.status())
            .finish()
    }
}

impl PoolInner {
    /// Bookkeeping never spans a panic point, so a poisoned lock still
    /// guards consistent state.
    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes a handle back from a caller. Handles that cannot be reused are
    /// closed and their slot freed.
    pub(crate) fn check_in(&self, mut handle: Handle, mode: AccessMode) -> Result<()> {
        let id = handle.id();
        let reusable = reset_for_reuse(&handle, mode);
        if !reusable {
            if let Err(err) = handle.close() {
                debug!(handle = %id, error = %err, "closing discarded handle failed");
            }
        }

        let mut state = self.lock_state();
        state.check_in(id)?;
        if reusable {
            state.push_free(handle);
            debug!(handle = %id, "returned handle");
        } else {
            info!(handle = %id, "discarded handle");
        }
        state.wake_next();
        if state.lifecycle != Lifecycle::Active {
            self.drained.notify_all();
        }
        Ok(())
    }
}

/// Pairs a timeout with the instant it expires. A timeout too large to
/// represent as an instant means no deadline at all.
fn deadline_after(timeout: Option<Duration>) -> Option<(Duration, Instant)> {
    let limit = timeout?;
    Instant::now().checked_add(limit).map(|deadline| (limit, deadline))
}

/// Puts a returned handle back into autocommit, writable shape.
fn reset_for_reuse(handle: &Handle, mode: AccessMode) -> bool {
    if !handle.is_open() {
        return false;
    }
    if handle.transaction_state() != TransactionState::Autocommit || handle.in_engine_transaction() {
        warn!(handle = %handle.id(), "handle returned inside a transaction; rolling back");
        if let Err(err) = handle.rollback() {
            warn!(handle = %handle.id(), error = %err, "rollback on return failed");
            return false;
        }
    }
    if mode == AccessMode::Shared {
        if let Err(err) = handle.pragma_update("query_only", false) {
            warn!(handle = %handle.id(), error = %err, "clearing query_only on return failed");
            return false;
        }
    }
    true
}

fn open_handle(config: &PoolConfig, id: HandleId) -> Result<Handle> {
    let handle = Handle::open_with_id(id, &config.path, config.open_flags())?;
    initialise(&handle, config).map_err(|err| match err {
        DbError::Execution { code, message } | DbError::Syntax { code, message } => DbError::Connection {
            code,
            message: format!("initialising handle {}: {}", id, message),
        },
        other => other,
    })?;
    Ok(handle)
}

fn initialise(handle: &Handle, config: &PoolConfig) -> Result<()> {
    handle.set_busy_timeout(config.busy_timeout())?;
    if config.foreign_keys {
        handle.execute_batch("PRAGMA foreign_keys = ON;")?;
    }
    if let Some(mode) = &config.journal_mode {
        handle.execute_batch(&format!("PRAGMA journal_mode = {};", mode))?;
    }
    for sql in &config.init_sql {
        handle.execute_batch(sql)?;
    }
    Ok(())
}
