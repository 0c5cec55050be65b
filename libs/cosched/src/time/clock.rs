// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::time::{Instant, Ticks, max_duration};
use core::fmt;
use core::time::Duration;
use std::sync::Arc;

/// The raw time base backing a [`Clock`].
///
/// Implementations report elapsed time since their epoch. They are invoked
/// from the scheduler thread and (through `Clock: Send + Sync`) potentially
/// from others, so they must be thread-safe.
pub trait TimeBase: Send + Sync + 'static {
    fn elapsed(&self) -> Duration;
}

/// A named time source with a fixed tick duration.
///
/// The `tick_duration` is the `Duration` of time represented by a single
/// `u64` tick of this clock. This is in effect the precision of the clock:
/// alarms cannot fire at a finer grain.
pub struct Clock {
    name: &'static str,
    tick_duration: Duration,
    base: Arc<dyn TimeBase>,
}

static_assertions::assert_impl_all!(Clock: Send, Sync);

// === impl Clock ===

impl Clock {
    /// Creates a new `Clock` from the provided `tick_duration` and time
    /// base.
    ///
    /// # Panics
    ///
    /// Panics if `tick_duration` is zero.
    #[must_use]
    pub fn new(tick_duration: Duration, base: Arc<dyn TimeBase>) -> Clock {
        assert!(
            tick_duration > Duration::ZERO,
            "clock tick duration must be non-zero"
        );
        Self {
            name: "<unnamed mystery clock>",
            tick_duration,
            base,
        }
    }

    /// A clock backed by the OS monotonic clock, anchored at the moment of
    /// this call, with microsecond ticks.
    #[must_use]
    pub fn system() -> Clock {
        Clock::new(
            Duration::from_micros(1),
            Arc::new(SystemTimeBase {
                anchor: std::time::Instant::now(),
            }),
        )
        .named("system monotonic clock")
    }

    /// Add an arbitrary user-defined name to this `Clock`.
    ///
    /// This is generally used to describe the time source backing this
    /// `Clock`.
    #[must_use]
    pub fn named(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    /// Returns this `Clock`'s name, if it was given one using the
    /// [`Clock::named`] method.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns the [`Duration`] of one tick of this clock.
    #[must_use]
    pub const fn tick_duration(&self) -> Duration {
        self.tick_duration
    }

    /// Returns the maximum duration of this clock.
    #[must_use]
    pub fn max_duration(&self) -> Duration {
        max_duration(self.tick_duration())
    }

    #[inline]
    pub fn now(&self) -> Instant {
        Instant::from_duration(self.base.elapsed())
    }

    #[inline]
    pub(crate) fn now_ticks(&self) -> Ticks {
        self.duration_to_ticks(self.base.elapsed())
    }

    /// Convert a duration-since-epoch into whole elapsed ticks (rounding
    /// down), saturating at the clock's range.
    pub(crate) fn duration_to_ticks(&self, duration: Duration) -> Ticks {
        let ticks = duration.as_nanos() / self.tick_duration.as_nanos();
        Ticks(u64::try_from(ticks).unwrap_or(u64::MAX))
    }

    /// Like [`Self::duration_to_ticks`] but rounding up, so a deadline
    /// converted through it never falls before its requested instant.
    pub(crate) fn duration_to_ticks_ceil(&self, duration: Duration) -> Ticks {
        let ticks = duration.as_nanos().div_ceil(self.tick_duration.as_nanos());
        Ticks(u64::try_from(ticks).unwrap_or(u64::MAX))
    }

    pub(crate) fn ticks_to_duration(&self, ticks: Ticks) -> Duration {
        let nanos = self.tick_duration.as_nanos() * u128::from(ticks.0);
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    #[inline]
    pub(crate) fn instant_to_ticks_ceil(&self, instant: Instant) -> Ticks {
        self.duration_to_ticks_ceil(instant.into_duration())
    }

    #[inline]
    pub(crate) fn ticks_to_instant(&self, ticks: Ticks) -> Instant {
        Instant::from_duration(self.ticks_to_duration(ticks))
    }
}

impl Clone for Clock {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            tick_duration: self.tick_duration,
            base: Arc::clone(&self.base),
        }
    }
}

impl fmt::Debug for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Clock")
            .field("name", &self.name)
            .field("tick_duration", &self.tick_duration)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {:?} precision", self.name, self.tick_duration)
    }
}

struct SystemTimeBase {
    anchor: std::time::Instant,
}

impl TimeBase for SystemTimeBase {
    fn elapsed(&self) -> Duration {
        self.anchor.elapsed()
    }
}
