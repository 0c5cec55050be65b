// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::time::{Clock, TimeBase};
use core::time::Duration;
use std::sync::{Arc, Mutex};

/// A manually-advanced clock for tests.
#[derive(Clone)]
pub(crate) struct MockClock {
    tick_duration: Duration,
    inner: Arc<MockTimeBase>,
}

struct MockTimeBase {
    now: Mutex<Duration>,
}

impl MockClock {
    pub(crate) fn new(tick_duration: Duration) -> Self {
        Self {
            tick_duration,
            inner: Arc::new(MockTimeBase {
                now: Mutex::new(Duration::ZERO),
            }),
        }
    }

    pub(crate) fn new_1us() -> Self {
        Self::new(Duration::from_micros(1))
    }

    pub(crate) fn clock(&self) -> Clock {
        Clock::new(self.tick_duration, Arc::clone(&self.inner) as Arc<dyn TimeBase>)
            .named("mock test clock")
    }

    pub(crate) fn advance(&self, duration: Duration) {
        *self.inner.now.lock().unwrap() += duration;
    }
}

impl TimeBase for MockTimeBase {
    fn elapsed(&self) -> Duration {
        *self.now.lock().unwrap()
    }
}
