// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::job::Priority;
use crate::monitor::Monitor;
use core::any::Any;
use core::fmt;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// The ambient environment a job runs under.
///
/// A context is an immutable value; "mutation" derives a new context that
/// shares everything it doesn't change. Contexts travel inside jobs, and
/// jobs may cross threads through the external inbox, so contexts are
/// `Send + Sync` and cheap to clone.
#[derive(Clone)]
pub struct ExecutionContext {
    monitor: Arc<Monitor>,
    priority: Priority,
    locals: Option<Arc<LocalsNode>>,
    backtrace_history: bool,
}

/// A typed key into a context's locals.
///
/// Each key created gets a process-unique id; two keys never alias even if
/// their value types agree.
pub struct LocalKey<T> {
    id: u64,
    // `fn() -> T` keeps the key `Send + Sync` regardless of `T`.
    _marker: PhantomData<fn() -> T>,
}

/// Persistent association list. Derived contexts prepend; lookups take the
/// first hit, so rebinding a key shadows without copying the tail.
struct LocalsNode {
    key: u64,
    value: Arc<dyn Any + Send + Sync>,
    next: Option<Arc<LocalsNode>>,
}

static_assertions::assert_impl_all!(ExecutionContext: Send, Sync);
static_assertions::assert_impl_all!(LocalKey<*const ()>: Send, Sync);

// === impl ExecutionContext ===

impl ExecutionContext {
    /// The context every scheduler starts out in: the given monitor,
    /// `Normal` priority, no locals.
    pub(crate) fn main(monitor: Arc<Monitor>) -> Self {
        Self {
            monitor,
            priority: Priority::Normal,
            locals: None,
            backtrace_history: false,
        }
    }

    #[inline]
    pub fn monitor(&self) -> &Arc<Monitor> {
        &self.monitor
    }

    #[inline]
    pub fn priority(&self) -> Priority {
        self.priority
    }

    #[inline]
    pub fn backtrace_history(&self) -> bool {
        self.backtrace_history
    }

    #[must_use]
    pub fn with_monitor(&self, monitor: Arc<Monitor>) -> Self {
        let mut ctx = self.clone();
        ctx.monitor = monitor;
        ctx
    }

    #[must_use]
    pub fn with_priority(&self, priority: Priority) -> Self {
        let mut ctx = self.clone();
        ctx.priority = priority;
        ctx
    }

    #[must_use]
    pub fn with_backtrace_history(&self, backtrace_history: bool) -> Self {
        let mut ctx = self.clone();
        ctx.backtrace_history = backtrace_history;
        ctx
    }

    /// Derive a context with `key` bound to `value`. All other fields, and
    /// all other bindings, are shared with `self`.
    #[must_use]
    pub fn with_local<T>(&self, key: &LocalKey<T>, value: T) -> Self
    where
        T: Any + Send + Sync,
    {
        let mut ctx = self.clone();
        ctx.locals = Some(Arc::new(LocalsNode {
            key: key.id,
            value: Arc::new(value),
            next: self.locals.clone(),
        }));
        ctx
    }

    /// Look up the innermost binding of `key` in this context's locals.
    pub fn find_local<T>(&self, key: &LocalKey<T>) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        let mut node = self.locals.as_ref();
        while let Some(n) = node {
            if n.key == key.id {
                return Arc::clone(&n.value).downcast::<T>().ok();
            }
            node = n.next.as_ref();
        }
        None
    }

    /// Identity comparison: do both values denote the very same context?
    pub(crate) fn same(&self, other: &Self) -> bool {
        let locals_same = match (&self.locals, &other.locals) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        Arc::ptr_eq(&self.monitor, &other.monitor)
            && self.priority == other.priority
            && self.backtrace_history == other.backtrace_history
            && locals_same
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("monitor", &self.monitor.name())
            .field("priority", &self.priority)
            .field("backtrace_history", &self.backtrace_history)
            .finish_non_exhaustive()
    }
}

// === impl LocalKey ===

impl<T> LocalKey<T> {
    pub fn new() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(0);

        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            _marker: PhantomData,
        }
    }
}

impl<T> Default for LocalKey<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for LocalKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for LocalKey<T> {}

impl<T> fmt::Debug for LocalKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LocalKey").field(&self.id).finish()
    }
}
