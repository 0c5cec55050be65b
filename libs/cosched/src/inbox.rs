// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::context::ExecutionContext;
use crate::loom::sync::Mutex;
use core::any::Any;
use core::fmt;
use std::collections::VecDeque;
use std::sync::Arc;

/// Hook invoked after every external submission, from the submitting
/// thread. Its job is to wake a blocked scheduler thread (e.g. through a
/// self-pipe), so it must be both thread-safe and cheap.
pub type ExternalJobHook = Arc<dyn Fn() + Send + Sync>;

/// A `(context, thunk, payload)` triple posted from outside the scheduler
/// thread. The payload is kept alive in the inbox until the thunk has run.
pub(crate) struct ExternalJob {
    pub(crate) ctx: ExecutionContext,
    pub(crate) run: ExternalThunk,
    pub(crate) payload: Box<dyn Any + Send>,
}

pub(crate) type ExternalThunk =
    Box<dyn FnOnce(Box<dyn Any + Send>) -> Result<(), anyhow::Error> + Send>;

/// The producer side of the external inbox.
///
/// This is the only scheduler structure shared between threads. Any number
/// of handles may push concurrently; the scheduler thread drains the whole
/// backlog at each cycle start.
#[derive(Clone)]
pub struct InboxHandle {
    shared: Arc<Shared>,
}

struct Shared {
    jobs: Mutex<VecDeque<ExternalJob>>,
    hook: Mutex<Option<ExternalJobHook>>,
}

static_assertions::assert_impl_all!(InboxHandle: Send, Sync);

// === impl InboxHandle ===

impl InboxHandle {
    pub(crate) fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                jobs: Mutex::new(VecDeque::new()),
                hook: Mutex::new(None),
            }),
        }
    }

    /// Post `(ctx, f, payload)` from any thread. `f` will run on the
    /// scheduler thread under `ctx`, applied to `payload`, no later than
    /// the next cycle start.
    pub fn enqueue(
        &self,
        ctx: ExecutionContext,
        f: impl FnOnce(Box<dyn Any + Send>) -> Result<(), anyhow::Error> + Send + 'static,
        payload: Box<dyn Any + Send>,
    ) {
        self.push(ExternalJob {
            ctx,
            run: Box::new(f),
            payload,
        });
    }

    /// Post a payload-less thunk from any thread.
    pub fn enqueue_thunk(
        &self,
        ctx: ExecutionContext,
        f: impl FnOnce() -> Result<(), anyhow::Error> + Send + 'static,
    ) {
        self.enqueue(ctx, move |_| f(), Box::new(()));
    }

    pub(crate) fn push(&self, job: ExternalJob) {
        self.shared.jobs.lock().unwrap().push_back(job);
        tracing::trace!("external job submitted");

        // Invoke the wake hook outside the jobs lock.
        let hook = self.shared.hook.lock().unwrap().clone();
        if let Some(hook) = hook {
            hook();
        }
    }

    /// Take the entire backlog. Scheduler thread only.
    pub(crate) fn drain(&self) -> VecDeque<ExternalJob> {
        core::mem::take(&mut *self.shared.jobs.lock().unwrap())
    }

    pub(crate) fn len(&self) -> usize {
        self.shared.jobs.lock().unwrap().len()
    }

    pub(crate) fn set_hook(&self, hook: Option<ExternalJobHook>) {
        *self.shared.hook.lock().unwrap() = hook;
    }
}

impl fmt::Debug for InboxHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboxHandle").field("len", &self.len()).finish()
    }
}
