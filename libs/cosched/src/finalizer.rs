// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::context::ExecutionContext;
use crate::inbox::InboxHandle;
use core::fmt;
use core::ops::{Deref, DerefMut};

/// A guard that bridges value disposal to the scheduler.
///
/// `Finalized<T>` owns its value. When the guard is dropped (on *any*
/// thread) it does exactly one thing: it posts the registered callback,
/// the value, and the execution context captured at registration time to
/// the scheduler's external inbox. The callback then runs on the scheduler
/// thread, under that captured context, exactly once; the value stays
/// reachable through the inbox until it has run, and is released right
/// after.
pub struct Finalized<T: Send + 'static> {
    // `None` only between `Drop` taking the state and the guard going away.
    state: Option<State<T>>,
}

struct State<T> {
    value: Box<T>,
    ctx: ExecutionContext,
    inbox: InboxHandle,
    callback: Box<dyn FnOnce(&T) -> Result<(), anyhow::Error> + Send>,
}

static_assertions::assert_impl_all!(Finalized<()>: Send);

// === impl Finalized ===

impl<T: Send + 'static> Finalized<T> {
    pub(crate) fn new(
        value: T,
        ctx: ExecutionContext,
        inbox: InboxHandle,
        callback: impl FnOnce(&T) -> Result<(), anyhow::Error> + Send + 'static,
    ) -> Self {
        Self {
            state: Some(State {
                value: Box::new(value),
                ctx,
                inbox,
                callback: Box::new(callback),
            }),
        }
    }
}

impl<T: Send + 'static> Deref for Finalized<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.state.as_ref().expect("finalizer state taken before drop").value
    }
}

impl<T: Send + 'static> DerefMut for Finalized<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.state.as_mut().expect("finalizer state taken before drop").value
    }
}

impl<T: Send + 'static> Drop for Finalized<T> {
    fn drop(&mut self) {
        let Some(State {
            value,
            ctx,
            inbox,
            callback,
        }) = self.state.take()
        else {
            return;
        };

        tracing::trace!("finalizer fired, submitting to scheduler");
        inbox.enqueue(
            ctx,
            move |payload| {
                let value = payload
                    .downcast::<T>()
                    .expect("finalizer payload carries the registered value");
                callback(&value)
            },
            value,
        );
    }
}

impl<T: Send + fmt::Debug + 'static> fmt::Debug for Finalized<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Finalized").field(&**self).finish()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use crate::monitor::Monitor;
    use crate::scheduler::Scheduler;
    use core::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn callback_runs_exactly_once_with_the_value() {
        let sched = Scheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let guard = {
            let runs = Arc::clone(&runs);
            sched.add_finalizer(vec![1_u8, 2, 3], move |value| {
                assert_eq!(value, &[1, 2, 3]);
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        };
        assert_eq!(*guard, [1, 2, 3]);

        // disposal on a foreign thread, the way a finalization thread
        // would do it
        std::thread::spawn(move || drop(guard)).join().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        sched.run_cycle();
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        sched.run_cycle();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn callback_runs_under_the_registration_context() {
        let sched = Scheduler::new();

        let caught = Arc::new(AtomicUsize::new(0));
        let child = Monitor::new_child(sched.main_monitor(), "finalizers");
        let sink = Arc::clone(&caught);
        child.add_error_handler(move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
            true
        });

        let ctx = sched.main_execution_context().with_monitor(child);
        let guard = sched
            .within_context(ctx, || {
                Ok(sched.add_finalizer((), |_| Err(anyhow::anyhow!("from finalizer"))))
            })
            .unwrap();

        std::thread::spawn(move || drop(guard)).join().unwrap();
        sched.run_cycle();

        // the error landed on the monitor captured at registration time
        assert_eq!(caught.load(Ordering::SeqCst), 1);
        assert!(!sched.is_dead());
    }

    #[test]
    fn add_finalizer_exn_delegates() {
        let sched = Scheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let guard = {
            let runs = Arc::clone(&runs);
            sched.add_finalizer_exn(7_u64, move |value| {
                assert_eq!(*value, 7);
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        };
        drop(guard);
        sched.run_cycle();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
