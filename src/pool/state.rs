//! Pool bookkeeping guarded by the pool mutex.
//!
//! Every open handle is in exactly one of three places: the free queue,
//! the checked-out set (the caller owns the `Handle` value), or being opened
//! outside the lock (counted in `opening`). Their sum never exceeds
//! `max_size`.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Condvar};

use serde::Serialize;

use crate::core::db::{Handle, HandleId};
use crate::core::{DbError, Result};

/// Pool-level lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    /// Handing out handles
    Active,
    /// Refusing new checkouts and waiting for outstanding ones to come back
    Draining,
    /// Every handle closed
    Shutdown,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Lifecycle::Active => "active",
            Lifecycle::Draining => "draining",
            Lifecycle::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

/// Point-in-time snapshot of pool occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub lifecycle: Lifecycle,
    pub max_size: usize,
    pub open: usize,
    pub free: usize,
    pub checked_out: usize,
    pub opening: usize,
    pub waiting: usize,
}

impl fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}/{} open ({} free, {} checked out, {} opening), {} waiting",
            self.lifecycle, self.open, self.max_size, self.free, self.checked_out, self.opening, self.waiting
        )
    }
}

/// A thread blocked in `acquire`, woken through its own condition variable.
struct Waiter {
    ticket: u64,
    signal: Arc<Condvar>,
}

pub(crate) struct PoolState {
    pub(crate) lifecycle: Lifecycle,
    max_size: usize,
    free: VecDeque<Handle>,
    checked_out: HashSet<HandleId>,
    opening: usize,
    waiters: VecDeque<Waiter>,
    next_ticket: u64,
    next_handle_id: u64,
}

impl PoolState {
    pub(crate) fn new(max_size: usize) -> Self {
        PoolState {
            lifecycle: Lifecycle::Active,
            max_size,
            free: VecDeque::new(),
            checked_out: HashSet::new(),
            opening: 0,
            waiters: VecDeque::new(),
            next_ticket: 0,
            next_handle_id: 1,
        }
    }

    pub(crate) fn open_count(&self) -> usize {
        self.free.len() + self.checked_out.len() + self.opening
    }

    /// Whether the caller holding `ticket` (or a newcomer, for `None`) may
    /// take a handle now. Newcomers only go first when nobody is queued.
    pub(crate) fn is_next(&self, ticket: Option<u64>) -> bool {
        match ticket {
            None => self.waiters.is_empty(),
            Some(ticket) => self.waiters.front().map(|w| w.ticket) == Some(ticket),
        }
    }

    pub(crate) fn enqueue(&mut self) -> (u64, Arc<Condvar>) {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        let signal = Arc::new(Condvar::new());
        self.waiters.push_back(Waiter {
            ticket,
            signal: Arc::clone(&signal),
        });
        (ticket, signal)
    }

    pub(crate) fn dequeue(&mut self, ticket: u64) {
        self.waiters.retain(|w| w.ticket != ticket);
    }

    /// Wakes the longest-waiting caller, if any.
    pub(crate) fn wake_next(&self) {
        if let Some(waiter) = self.waiters.front() {
            waiter.signal.notify_one();
        }
    }

    pub(crate) fn wake_all(&self) {
        for waiter in &self.waiters {
            waiter.signal.notify_one();
        }
    }

    /// Pops the least recently returned free handle and marks it checked out.
    pub(crate) fn take_free(&mut self) -> Option<Handle> {
        let handle = self.free.pop_front()?;
        self.checked_out.insert(handle.id());
        Some(handle)
    }

    /// Reserves capacity for a handle that will be opened outside the lock.
    pub(crate) fn reserve_slot(&mut self) -> Option<HandleId> {
        if self.open_count() >= self.max_size {
            return None;
        }
        let id = HandleId(self.next_handle_id);
        self.next_handle_id += 1;
        self.opening += 1;
        Some(id)
    }

    /// Settles a reservation: the handle is now checked out, or the slot is released.
    pub(crate) fn finish_open(&mut self, id: HandleId, opened: bool) {
        self.opening -= 1;
        if opened {
            self.checked_out.insert(id);
        }
    }

    /// Removes `id` from the checked-out set.
    ///
    /// # Errors
    ///
    /// `DbError::Invariant` if `id` is not currently checked out: it was
    /// already returned, or never came from this pool.
    pub(crate) fn check_in(&mut self, id: HandleId) -> Result<()> {
        if self.checked_out.remove(&id) {
            return Ok(());
        }
        let reason = if self.free.iter().any(|h| h.id() == id) {
            "it is already free"
        } else {
            "it is not checked out from this pool"
        };
        Err(DbError::Invariant(format!("cannot release handle {}: {}", id, reason)))
    }

    pub(crate) fn push_free(&mut self, handle: Handle) {
        self.free.push_back(handle);
    }

    pub(crate) fn drain_free(&mut self) -> Vec<Handle> {
        self.free.drain(..).collect()
    }

    pub(crate) fn is_drained(&self) -> bool {
        self.checked_out.is_empty() && self.opening == 0
    }

    pub(crate) fn status(&self) -> PoolStatus {
        PoolStatus {
            lifecycle: self.lifecycle,
            max_size: self.max_size,
            open: self.open_count(),
            free: self.free.len(),
            checked_out: self.checked_out.len(),
            opening: self.opening,
            waiting: self.waiters.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use proptest_derive::Arbitrary;

    fn open_reserved(state: &mut PoolState) -> Option<Handle> {
        let id = state.reserve_slot()?;
        let handle = Handle::open_with_id(id, std::path::Path::new(":memory:"), Default::default()).unwrap();
        state.finish_open(id, true);
        Some(handle)
    }

    #[test]
    fn test_release_twice_is_an_invariant_error() {
        let mut state = PoolState::new(2);
        let handle = open_reserved(&mut state).unwrap();
        let id = handle.id();

        state.check_in(id).unwrap();
        state.push_free(handle);

        match state.check_in(id) {
            Err(DbError::Invariant(msg)) => assert!(msg.contains("already free")),
            other => panic!("Expected Invariant error, got {:?}", other),
        }
    }

    #[test]
    fn test_release_of_unknown_handle() {
        let mut state = PoolState::new(2);
        let err = state.check_in(HandleId(42)).unwrap_err();
        assert!(err.is_fatal());
        insta::assert_snapshot!(err.to_string(), @"Invariant violated: cannot release handle #42: it is not checked out from this pool");
    }

    #[test]
    fn test_capacity_counts_reservations() {
        let mut state = PoolState::new(2);
        let first = state.reserve_slot().unwrap();
        let _second = state.reserve_slot().unwrap();
        assert_eq!(state.reserve_slot(), None);

        // A failed open gives the slot back
        state.finish_open(first, false);
        assert_eq!(state.open_count(), 1);
        assert!(state.reserve_slot().is_some());
    }

    #[test]
    fn test_waiters_are_served_in_order() {
        let mut state = PoolState::new(1);
        assert!(state.is_next(None));

        let (first, _) = state.enqueue();
        let (second, _) = state.enqueue();
        assert!(!state.is_next(None));
        assert!(state.is_next(Some(first)));
        assert!(!state.is_next(Some(second)));

        state.dequeue(first);
        assert!(state.is_next(Some(second)));
        state.dequeue(second);
        assert!(state.is_next(None));
    }

    #[test]
    fn test_status_display() {
        let mut state = PoolState::new(3);
        let _handle = open_reserved(&mut state).unwrap();
        state.enqueue();
        insta::assert_snapshot!(state.status().to_string(), @"active: 1/3 open (0 free, 1 checked out, 0 opening), 1 waiting");
    }

    #[derive(Debug, Clone, Arbitrary)]
    enum PoolOp {
        Checkout,
        ReturnOldest,
        ReturnNewest,
    }

    proptest! {
        /// Replays random checkout/return sequences against the bookkeeping
        /// and checks capacity and the free/checked-out partition after each step.
        #[test]
        fn prop_bookkeeping_never_exceeds_capacity_or_leaks(
            max_size in 1usize..5,
            ops in prop::collection::vec(any::<PoolOp>(), 0..40),
        ) {
            let mut state = PoolState::new(max_size);
            let mut held: VecDeque<Handle> = VecDeque::new();
            let mut opened = 0usize;

            for op in ops {
                match op {
                    PoolOp::Checkout => {
                        if let Some(handle) = state.take_free() {
                            held.push_back(handle);
                        } else if let Some(handle) = open_reserved(&mut state) {
                            opened += 1;
                            held.push_back(handle);
                        } else {
                            prop_assert_eq!(held.len(), max_size);
                        }
                    }
                    PoolOp::ReturnOldest | PoolOp::ReturnNewest => {
                        let handle = match op {
                            PoolOp::ReturnOldest => held.pop_front(),
                            _ => held.pop_back(),
                        };
                        if let Some(handle) = handle {
                            state.check_in(handle.id()).unwrap();
                            state.push_free(handle);
                        }
                    }
                }

                let status = state.status();
                prop_assert!(status.open <= max_size);
                prop_assert_eq!(status.open, opened);
                prop_assert_eq!(status.checked_out, held.len());
                prop_assert_eq!(status.free + status.checked_out, status.open);
            }

            for handle in held.drain(..) {
                state.check_in(handle.id()).unwrap();
                state.push_free(handle);
            }
            prop_assert_eq!(state.status().free, opened);
            prop_assert!(state.is_drained());
        }
    }
}
