// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::context::ExecutionContext;
use core::fmt;
use std::collections::VecDeque;

/// The band a job is scheduled in.
///
/// Bands are drained in declared order: every runnable `High` job goes
/// before a pending `Normal` one, every `Normal` before a `Low`, subject
/// only to the per-band per-cycle budget.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Priority {
    High,
    Normal,
    Low,
}

/// A runnable unit of work: an [`ExecutionContext`] paired with a thunk.
///
/// The thunk signals failure by *returning* an error; the scheduler
/// delivers it to the context's monitor and carries on with the cycle.
pub struct Job {
    ctx: ExecutionContext,
    thunk: Thunk,
}

pub(crate) type Thunk = Box<dyn FnOnce() -> Result<(), anyhow::Error>>;

/// A FIFO queue of runnable jobs for one priority band.
///
/// Tracks how many jobs this band may still run in the current cycle. The
/// counter is reset from the scheduler's per-cycle maximum at each cycle
/// start, and forcing it to zero mid-cycle is how a running job cuts the
/// band off after itself.
pub(crate) struct JobQueue {
    jobs: VecDeque<Job>,
    jobs_left_this_cycle: usize,
}

// === impl Priority ===

impl Priority {
    /// All bands, highest first. Drain loops iterate this.
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    #[inline]
    pub(crate) fn index(self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }
}

// === impl Job ===

impl Job {
    pub fn new(
        ctx: ExecutionContext,
        f: impl FnOnce() -> Result<(), anyhow::Error> + 'static,
    ) -> Self {
        Self {
            ctx,
            thunk: Box::new(f),
        }
    }

    #[inline]
    pub fn context(&self) -> &ExecutionContext {
        &self.ctx
    }

    pub(crate) fn into_parts(self) -> (ExecutionContext, Thunk) {
        (self.ctx, self.thunk)
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job").field("ctx", &self.ctx).finish_non_exhaustive()
    }
}

// === impl JobQueue ===

impl JobQueue {
    pub(crate) fn new() -> Self {
        Self {
            jobs: VecDeque::new(),
            jobs_left_this_cycle: 0,
        }
    }

    pub(crate) fn enqueue(&mut self, job: Job) {
        self.jobs.push_back(job);
    }

    pub(crate) fn dequeue(&mut self) -> Option<Job> {
        self.jobs.pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.jobs.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub(crate) fn jobs_left_this_cycle(&self) -> usize {
        self.jobs_left_this_cycle
    }

    pub(crate) fn set_jobs_left_this_cycle(&mut self, n: usize) {
        self.jobs_left_this_cycle = n;
    }

    /// Dequeue the next job iff this band still has budget, consuming one
    /// unit of it.
    pub(crate) fn dequeue_within_budget(&mut self) -> Option<Job> {
        if self.jobs_left_this_cycle == 0 {
            return None;
        }
        let job = self.jobs.pop_front()?;
        self.jobs_left_this_cycle -= 1;
        Some(job)
    }
}

impl fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobQueue")
            .field("len", &self.jobs.len())
            .field("jobs_left_this_cycle", &self.jobs_left_this_cycle)
            .finish()
    }
}
