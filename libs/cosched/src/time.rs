// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod clock;
mod instant;
#[cfg(test)]
pub(crate) mod test_util;
mod wheel;

use crate::job::Job;
use core::cell::RefCell;
use core::fmt;
use core::time::Duration;

pub use clock::{Clock, TimeBase};
pub use instant::Instant;
pub use wheel::Ticks;
use wheel::{Alarm, Core};

pub const NANOS_PER_SEC: u64 = 1_000_000_000;

/// The scheduler's handle on time: a [`Clock`] plus the timing wheel it
/// drives.
///
/// The wheel only ever turns forward, and only when the scheduler tells it
/// to: [`advance`] at cycle start, [`fire_past_alarms`] between cycles.
/// Every alarm that comes due hands its job back for enqueueing.
///
/// [`advance`]: TimeSource::advance
/// [`fire_past_alarms`]: TimeSource::fire_past_alarms
pub struct TimeSource {
    clock: Clock,
    core: RefCell<Core>,
}

// === impl TimeSource ===

impl TimeSource {
    pub fn new(clock: Clock) -> Self {
        Self {
            clock,
            core: RefCell::new(Core::new()),
        }
    }

    #[inline]
    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    #[inline]
    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    /// Register an alarm for `at`. If `at` is not in the future the job is
    /// handed straight back and is due immediately.
    pub(crate) fn schedule(&self, at: Instant, job: Job) -> Option<Job> {
        let deadline = self.clock.instant_to_ticks_ceil(at);
        match self.core.borrow_mut().insert(Alarm { deadline, job }) {
            Ok(()) => None,
            Err(alarm) => Some(alarm.job),
        }
    }

    /// Move the logical clock forward to `to`, returning the jobs of every
    /// alarm whose deadline was reached.
    pub(crate) fn advance(&self, to: Instant) -> Vec<Job> {
        let mut core = self.core.borrow_mut();

        let mut to_ticks = self.clock.duration_to_ticks(to.into_duration());
        if to_ticks < core.elapsed() {
            tracing::warn!("time went backwards!");
            to_ticks = core.elapsed();
        }

        let fired = core.advance_to(to_ticks);
        if !fired.is_empty() {
            tracing::trace!(fired = fired.len(), now = ?to_ticks, "alarms fired");
        }
        fired.into_iter().map(|alarm| alarm.job).collect()
    }

    /// Fire every alarm already due at the wall clock's current reading,
    /// without moving the logical clock.
    pub(crate) fn fire_past_alarms(&self) -> Vec<Job> {
        let now = self.clock.now_ticks();
        let fired = self.core.borrow_mut().fire_due(now);
        fired.into_iter().map(|alarm| alarm.job).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.core.borrow().is_empty()
    }

    pub fn num_pending_alarms(&self) -> usize {
        self.core.borrow().len()
    }

    /// The instant the nearest alarm fires at, if any alarm is registered.
    pub fn next_alarm_fires_at(&self) -> Option<Instant> {
        let deadline = self.core.borrow().next_deadline()?;
        Some(self.clock.ticks_to_instant(deadline.ticks))
    }

    /// The finest grain alarms can fire at: one clock tick.
    pub fn alarm_precision(&self) -> Duration {
        self.clock.tick_duration()
    }
}

impl fmt::Debug for TimeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeSource")
            .field("clock", &self.clock)
            .field("pending_alarms", &self.num_pending_alarms())
            .finish()
    }
}

#[inline]
fn max_duration(tick_duration: Duration) -> Duration {
    tick_duration.saturating_mul(u32::MAX)
}
