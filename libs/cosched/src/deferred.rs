// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::context::ExecutionContext;
use crate::job::{Job, Priority};
use crate::scheduler::Scheduler;
use core::cell::RefCell;
use core::fmt;
use std::rc::Rc;

/// A one-shot cell that callbacks can be attached to.
///
/// A deferred starts out undetermined; filling it schedules every attached
/// callback as a job under the execution context that was current when the
/// callback was attached. Attaching to an already-determined deferred
/// schedules the callback immediately. Filling twice is a bug.
///
/// Deferreds live on the scheduler thread; cross-thread completion goes
/// through the external inbox instead.
pub struct Deferred<T> {
    inner: Rc<RefCell<State<T>>>,
}

enum State<T> {
    Empty { handlers: Vec<Handler<T>> },
    Full(Rc<T>),
}

struct Handler<T> {
    ctx: ExecutionContext,
    f: Box<dyn FnOnce(&T)>,
}

// === impl Deferred ===

impl<T: 'static> Deferred<T> {
    pub(crate) fn empty() -> Self {
        Self {
            inner: Rc::new(RefCell::new(State::Empty {
                handlers: Vec::new(),
            })),
        }
    }

    /// A deferred that is already determined to `value`.
    pub fn determined(value: T) -> Self {
        Self {
            inner: Rc::new(RefCell::new(State::Full(Rc::new(value)))),
        }
    }

    pub fn is_determined(&self) -> bool {
        matches!(&*self.inner.borrow(), State::Full(_))
    }

    pub fn peek(&self) -> Option<Rc<T>> {
        match &*self.inner.borrow() {
            State::Full(value) => Some(Rc::clone(value)),
            State::Empty { .. } => None,
        }
    }

    /// Attach `f`, to be scheduled (under the current execution context, in
    /// its band) once this deferred is determined.
    pub fn upon(&self, sched: &Scheduler, f: impl FnOnce(&T) + 'static) {
        let ctx = sched.current_execution_context();
        let full = match &mut *self.inner.borrow_mut() {
            State::Full(value) => Rc::clone(value),
            State::Empty { handlers } => {
                handlers.push(Handler {
                    ctx,
                    f: Box::new(f),
                });
                return;
            }
        };
        schedule_handler(
            sched,
            ctx.priority(),
            Handler {
                ctx,
                f: Box::new(f),
            },
            full,
        );
    }

    /// Determine the deferred, scheduling each attached callback in the
    /// band of its captured context.
    pub(crate) fn fill(&self, sched: &Scheduler, value: T) {
        self.fill_inner(sched, value, None);
    }

    /// Determine the deferred, scheduling every attached callback in
    /// `band` regardless of its captured context's priority.
    pub(crate) fn fill_in_band(&self, sched: &Scheduler, band: Priority, value: T) {
        self.fill_inner(sched, value, Some(band));
    }

    fn fill_inner(&self, sched: &Scheduler, value: T, band: Option<Priority>) {
        let value = Rc::new(value);
        let handlers = {
            let mut state = self.inner.borrow_mut();
            match &mut *state {
                State::Full(_) => panic!("deferred determined twice"),
                State::Empty { handlers } => {
                    let handlers = core::mem::take(handlers);
                    *state = State::Full(Rc::clone(&value));
                    handlers
                }
            }
        };
        for handler in handlers {
            let band = band.unwrap_or(handler.ctx.priority());
            schedule_handler(sched, band, handler, Rc::clone(&value));
        }
    }
}

fn schedule_handler<T: 'static>(
    sched: &Scheduler,
    band: Priority,
    handler: Handler<T>,
    value: Rc<T>,
) {
    let Handler { ctx, f } = handler;
    sched.enqueue_job_in_band(
        band,
        Job::new(ctx, move || {
            f(&value);
            Ok(())
        }),
    );
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let determined = matches!(&*self.inner.borrow(), State::Full(_));
        f.debug_struct("Deferred").field("determined", &determined).finish()
    }
}
