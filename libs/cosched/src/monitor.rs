// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::error::JobError;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use std::borrow::Cow;
use std::sync::{Arc, Mutex};

/// A supervisor node in the monitor tree.
///
/// Every [`ExecutionContext`] names a monitor; when a job running under
/// that context fails, the error is offered to the monitor's handlers,
/// then to its parent's, and so on up the tree. An error that reaches a
/// non-detached root unhandled is recorded as the scheduler's uncaught
/// error and kills it. A *detached* monitor terminates the walk instead:
/// the error is logged and contained.
///
/// [`ExecutionContext`]: crate::ExecutionContext
pub struct Monitor {
    name: Cow<'static, str>,
    id: u64,
    parent: Option<Arc<Monitor>>,
    detached: bool,
    handlers: Mutex<Vec<ErrorHandler>>,
}

/// Returns `true` iff the handler disposed of the error.
type ErrorHandler = Box<dyn Fn(&JobError) -> bool + Send + Sync>;

// === impl Monitor ===

impl Monitor {
    /// The root monitor a scheduler is born with.
    pub(crate) fn main() -> Arc<Self> {
        Arc::new(Self {
            name: Cow::Borrowed("main"),
            id: next_id(),
            parent: None,
            detached: false,
            handlers: Mutex::new(Vec::new()),
        })
    }

    /// Create a monitor supervised by `parent`.
    pub fn new_child(parent: &Arc<Monitor>, name: impl Into<Cow<'static, str>>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            id: next_id(),
            parent: Some(Arc::clone(parent)),
            detached: false,
            handlers: Mutex::new(Vec::new()),
        })
    }

    /// Create a monitor with no parent that *contains* errors rather than
    /// letting them kill the scheduler.
    pub fn detached(name: impl Into<Cow<'static, str>>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            id: next_id(),
            parent: None,
            detached: true,
            handlers: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn parent(&self) -> Option<&Arc<Monitor>> {
        self.parent.as_ref()
    }

    pub fn is_detached(&self) -> bool {
        self.detached
    }

    /// Register an error handler on this node. The handler returns whether
    /// it disposed of the error; an unhandled error keeps bubbling.
    pub fn add_error_handler(&self, f: impl Fn(&JobError) -> bool + Send + Sync + 'static) {
        self.handlers.lock().unwrap().push(Box::new(f));
    }

    /// Offer `error` to this node's handlers, in registration order.
    pub(crate) fn try_handle(&self, error: &JobError) -> bool {
        let handlers = self.handlers.lock().unwrap();
        for handler in handlers.iter() {
            if handler(error) {
                tracing::trace!(monitor = %self.name, %error, "error handled");
                return true;
            }
        }
        false
    }
}

impl fmt::Debug for Monitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Monitor")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("detached", &self.detached)
            .field("parent", &self.parent.as_ref().map(|p| p.name()))
            .finish_non_exhaustive()
    }
}

fn next_id() -> u64 {
    static NEXT_ID: AtomicU64 = AtomicU64::new(0);
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}
