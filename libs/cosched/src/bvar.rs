// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::deferred::Deferred;
use crate::job::Priority;
use crate::scheduler::Scheduler;
use core::cell::RefCell;
use core::fmt;

/// A barrier variable: a repeatable one-shot broadcast.
///
/// Each [`wait`] registers a fresh deferred; [`broadcast`] determines all
/// currently-registered deferreds, scheduling their callbacks as
/// `Normal`-band jobs in registration order, and clears the waiter set.
/// The scheduler's yield and quiescence primitives are bvars broadcast at
/// cycle boundaries.
///
/// [`wait`]: Bvar::wait
/// [`broadcast`]: Bvar::broadcast
pub struct Bvar {
    waiters: RefCell<Vec<Deferred<()>>>,
}

// === impl Bvar ===

impl Bvar {
    pub fn new() -> Self {
        Self {
            waiters: RefCell::new(Vec::new()),
        }
    }

    /// Register a fresh waiter; the returned deferred becomes determined on
    /// the next [`broadcast`](Bvar::broadcast).
    pub fn wait(&self) -> Deferred<()> {
        let deferred = Deferred::empty();
        self.waiters.borrow_mut().push(deferred.clone());
        deferred
    }

    /// Determine all current waiters, in the order they registered, then
    /// empty the waiter set. With no waiters this is a no-op, so repeated
    /// broadcasts are idempotent.
    pub fn broadcast(&self, sched: &Scheduler) {
        let waiters = core::mem::take(&mut *self.waiters.borrow_mut());
        if !waiters.is_empty() {
            tracing::trace!(waiters = waiters.len(), "bvar broadcast");
        }
        for waiter in waiters {
            waiter.fill_in_band(sched, Priority::Normal, ());
        }
    }

    #[inline]
    pub fn has_any_waiters(&self) -> bool {
        !self.waiters.borrow().is_empty()
    }
}

impl Default for Bvar {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Bvar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bvar")
            .field("waiters", &self.waiters.borrow().len())
            .finish()
    }
}
