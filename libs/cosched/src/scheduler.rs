// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::bvar::Bvar;
use crate::context::{ExecutionContext, LocalKey};
use crate::deferred::Deferred;
use crate::error::{InvalidPeriod, JobError, RunError};
use crate::finalizer::Finalized;
use crate::inbox::{ExternalJob, ExternalJobHook, InboxHandle};
use crate::job::{Job, JobQueue, Priority};
use crate::low_priority::{Pool, Step, Worker};
use crate::monitor::Monitor;
use crate::stream::CycleStream;
use crate::time::{Clock, Instant, TimeSource};
use core::any::Any;
use core::cell::{Cell, RefCell};
use core::fmt;
use core::num::NonZeroUsize;
use core::time::Duration;
use std::backtrace::Backtrace;
use std::rc::{Rc, Weak};
use std::sync::Arc;

/// Upper bound on jobs run per band per cycle, unless overridden.
const DEFAULT_MAX_NUM_JOBS_PER_PRIORITY_PER_CYCLE: NonZeroUsize =
    match NonZeroUsize::new(500) {
        Some(n) => n,
        None => unreachable!(),
    };

/// The cycle-driven job engine.
///
/// A scheduler advances thunk jobs to completion on a single thread, in
/// *cycles*: each cycle broadcasts the yield barrier, drains the external
/// inbox, advances the clock (firing due alarms), then runs jobs band by
/// band (`High`, then `Normal`, then `Low`) up to a per-band budget. Jobs run to
/// completion; a job that fails has its error delivered to its context's
/// monitor and the cycle carries on.
///
/// Schedulers are deliberately `!Send + !Sync`: everything except the
/// external inbox belongs to the thread that created them. Tests (and
/// embedders) create as many as they like with [`Scheduler::new`]; code
/// that wants the ambient one uses the thread-local [`Scheduler::current`].
pub struct Scheduler {
    /// Self-reference so jobs and hooks the scheduler creates for itself
    /// can call back into it without keeping it alive.
    weak_self: Weak<Scheduler>,

    queues: [RefCell<JobQueue>; 3],
    time_source: TimeSource,
    inbox: InboxHandle,
    low_priority_pool: Pool,

    current_execution_context: RefCell<ExecutionContext>,
    main_execution_context: ExecutionContext,

    cycle_count: Cell<u64>,
    cycle_start: Cell<Instant>,
    last_cycle_time: Cell<Duration>,
    last_cycle_num_jobs: Cell<u64>,
    num_jobs_run: Cell<u64>,
    max_num_jobs_per_priority_per_cycle: Cell<NonZeroUsize>,

    run_every_cycle_start: RefCell<Vec<Rc<dyn Fn(&Scheduler)>>>,
    on_start_of_cycle: RefCell<Option<Rc<dyn Fn(&Scheduler)>>>,
    on_end_of_cycle: RefCell<Option<Rc<dyn Fn(&Scheduler)>>>,
    event_added_hook: RefCell<Option<Rc<dyn Fn(&Scheduler, Instant)>>>,
    job_queued_hook: RefCell<Option<Rc<dyn Fn(&Scheduler, Priority)>>>,
    advance_synchronous_wall_clock: RefCell<Option<Rc<dyn Fn(Instant)>>>,

    yield_bvar: Bvar,
    yield_until_no_jobs_remain_bvar: Bvar,

    uncaught_exn: RefCell<Option<JobError>>,
    is_dead: Cell<bool>,
    check_invariants: Cell<bool>,
    record_backtraces: Cell<bool>,
    check_access: RefCell<Option<Box<dyn Fn()>>>,
}

/// What one [`Scheduler::run_cycle`] did.
#[derive(Debug)]
#[non_exhaustive]
pub struct CycleSummary {
    /// Jobs whose thunk returned or failed during this cycle.
    pub jobs_run: u64,
    /// Wall time the cycle took.
    pub cycle_time: Duration,
    /// `true` if jobs remain queued after this cycle (budget cutoffs or
    /// jobs enqueued by the cycle itself).
    pub has_remaining: bool,
}

/// Stateful yield throttle returned by [`Scheduler::yield_every`].
///
/// Every `period`th call produces a real yield; the others come back
/// already determined. The counter resets after each yield.
#[derive(Debug)]
pub struct YieldEvery {
    period: usize,
    count: usize,
}

/// Restores the previously-current execution context when dropped, so the
/// context stack unwinds correctly on every exit path.
pub(crate) struct RestoreContext<'a> {
    sched: &'a Scheduler,
    prev: Option<ExecutionContext>,
}

/// Marks the scheduler dead if the enclosing cycle unwinds (a hook or
/// thunk panicked).
struct DeadOnPanic<'a> {
    sched: &'a Scheduler,
}

thread_local! {
    static CURRENT: RefCell<Option<Rc<Scheduler>>> = const { RefCell::new(None) };
}

// === impl Scheduler ===

impl Scheduler {
    /// A fresh scheduler on the system monotonic clock.
    pub fn new() -> Rc<Self> {
        Self::with_clock(Clock::system())
    }

    /// A fresh scheduler on an arbitrary clock (tests pass a mock).
    pub fn with_clock(clock: Clock) -> Rc<Self> {
        let main_execution_context = ExecutionContext::main(Monitor::main());
        let time_source = TimeSource::new(clock);
        let now = time_source.now();

        Rc::new_cyclic(|weak_self| Self {
            weak_self: Weak::clone(weak_self),
            queues: [
                RefCell::new(JobQueue::new()),
                RefCell::new(JobQueue::new()),
                RefCell::new(JobQueue::new()),
            ],
            time_source,
            inbox: InboxHandle::new(),
            low_priority_pool: Pool::new(),
            current_execution_context: RefCell::new(main_execution_context.clone()),
            main_execution_context,
            cycle_count: Cell::new(0),
            cycle_start: Cell::new(now),
            last_cycle_time: Cell::new(Duration::ZERO),
            last_cycle_num_jobs: Cell::new(0),
            num_jobs_run: Cell::new(0),
            max_num_jobs_per_priority_per_cycle: Cell::new(
                DEFAULT_MAX_NUM_JOBS_PER_PRIORITY_PER_CYCLE,
            ),
            run_every_cycle_start: RefCell::new(Vec::new()),
            on_start_of_cycle: RefCell::new(None),
            on_end_of_cycle: RefCell::new(None),
            event_added_hook: RefCell::new(None),
            job_queued_hook: RefCell::new(None),
            advance_synchronous_wall_clock: RefCell::new(None),
            yield_bvar: Bvar::new(),
            yield_until_no_jobs_remain_bvar: Bvar::new(),
            uncaught_exn: RefCell::new(None),
            is_dead: Cell::new(false),
            check_invariants: Cell::new(false),
            record_backtraces: Cell::new(false),
            check_access: RefCell::new(None),
        })
    }

    /// The process-wide (per-thread) scheduler, created on first access.
    pub fn current() -> Rc<Scheduler> {
        CURRENT.with(|current| {
            Rc::clone(current.borrow_mut().get_or_insert_with(Scheduler::new))
        })
    }

    /// Replace the singleton with a freshly constructed scheduler.
    /// Pre-existing references keep pointing at the orphaned one.
    pub fn reset_in_forked_process() {
        CURRENT.with(|current| {
            *current.borrow_mut() = Some(Scheduler::new());
        });
    }

    // === contexts ===

    pub fn current_execution_context(&self) -> ExecutionContext {
        self.current_execution_context.borrow().clone()
    }

    pub fn main_execution_context(&self) -> ExecutionContext {
        self.main_execution_context.clone()
    }

    pub fn main_monitor(&self) -> &Arc<Monitor> {
        self.main_execution_context.monitor()
    }

    pub(crate) fn enter_context(&self, ctx: ExecutionContext) -> RestoreContext<'_> {
        let prev = self.current_execution_context.replace(ctx);
        RestoreContext {
            sched: self,
            prev: Some(prev),
        }
    }

    /// Run `f` with `key` bound to `value` in the current context's locals.
    /// The previous context is restored on every exit path, unwinding
    /// included.
    pub fn with_local<T, R>(&self, key: &LocalKey<T>, value: T, f: impl FnOnce() -> R) -> R
    where
        T: Any + Send + Sync,
    {
        let derived = self.current_execution_context().with_local(key, value);
        let _restore = self.enter_context(derived);
        f()
    }

    /// Look `key` up in the current context's locals.
    pub fn find_local<T>(&self, key: &LocalKey<T>) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        self.current_execution_context.borrow().find_local(key)
    }

    /// Run `f` now, under `ctx`. An `Err` is delivered to `ctx`'s monitor
    /// rather than returned.
    pub fn within_context<R>(
        &self,
        ctx: ExecutionContext,
        f: impl FnOnce() -> Result<R, anyhow::Error>,
    ) -> Option<R> {
        let result = {
            let _restore = self.enter_context(ctx.clone());
            f()
        };
        match result {
            Ok(value) => Some(value),
            Err(error) => {
                self.send_exn(ctx.monitor(), error);
                None
            }
        }
    }

    /// Wrap `f` so that invoking the wrapper, whenever and from wherever on
    /// this thread, enqueues `f` under the execution context current right
    /// now.
    pub fn preserve_execution_context<F>(&self, f: F) -> impl FnOnce() + use<F>
    where
        F: FnOnce() -> Result<(), anyhow::Error> + 'static,
    {
        let ctx = self.current_execution_context();
        let sched = Weak::clone(&self.weak_self);
        move || {
            if let Some(sched) = sched.upgrade() {
                sched.enqueue_job(Job::new(ctx, f));
            }
        }
    }

    // === enqueueing ===

    /// Schedule a thunk under the current execution context, in its band.
    pub fn schedule(&self, f: impl FnOnce() -> Result<(), anyhow::Error> + 'static) {
        self.check_access();
        self.enqueue_job(Job::new(self.current_execution_context(), f));
    }

    /// Schedule a thunk under an explicit context.
    pub fn schedule_with_context(
        &self,
        ctx: ExecutionContext,
        f: impl FnOnce() -> Result<(), anyhow::Error> + 'static,
    ) {
        self.check_access();
        self.enqueue_job(Job::new(ctx, f));
    }

    /// Schedule a thunk under the current context re-derived at `priority`.
    pub fn schedule_with_priority(
        &self,
        priority: Priority,
        f: impl FnOnce() -> Result<(), anyhow::Error> + 'static,
    ) {
        self.check_access();
        let ctx = self.current_execution_context().with_priority(priority);
        self.enqueue_job(Job::new(ctx, f));
    }

    pub(crate) fn enqueue_job(&self, job: Job) {
        self.enqueue_job_in_band(job.context().priority(), job);
    }

    /// All enqueue paths bottom out here; the `job_queued_hook` therefore
    /// fires for user enqueues, bvar broadcasts, alarms, inbox drains and
    /// finalizers alike.
    pub(crate) fn enqueue_job_in_band(&self, band: Priority, job: Job) {
        tracing::trace!(?band, "job queued");
        self.queues[band.index()].borrow_mut().enqueue(job);
        let hook = self.job_queued_hook.borrow().clone();
        if let Some(hook) = hook {
            hook(self, band);
        }
    }

    // === external inbox ===

    /// The thread-safe submission handle. Clone it onto any thread.
    pub fn external_handle(&self) -> InboxHandle {
        self.inbox.clone()
    }

    /// Post `(ctx, f, payload)` into the external inbox. Safe to call from
    /// any thread through [`Scheduler::external_handle`]; this convenience
    /// method is the scheduler-thread spelling.
    pub fn thread_safe_enqueue_external_job(
        &self,
        ctx: ExecutionContext,
        f: impl FnOnce(Box<dyn Any + Send>) -> Result<(), anyhow::Error> + Send + 'static,
        payload: Box<dyn Any + Send>,
    ) {
        self.inbox.enqueue(ctx, f, payload);
    }

    /// Install the hook invoked (from the submitting thread!) after every
    /// external submission. Must be cheap; its purpose is waking a blocked
    /// scheduler thread.
    pub fn set_thread_safe_external_job_hook(&self, hook: Option<ExternalJobHook>) {
        self.inbox.set_hook(hook);
    }

    fn drain_external_inbox(&self) {
        let jobs = self.inbox.drain();
        if jobs.is_empty() {
            return;
        }
        tracing::trace!(jobs = jobs.len(), "draining external inbox");
        for external in jobs {
            let ExternalJob { ctx, run, payload } = external;
            self.enqueue_job_in_band(Priority::Normal, Job::new(ctx, move || run(payload)));
        }
    }

    // === finalizers ===

    /// Wrap `value` so that dropping the wrapper, on any thread, gets
    /// `f(&value)` run on the scheduler thread under the context current
    /// right now, exactly once.
    pub fn add_finalizer<T: Send + 'static>(
        &self,
        value: T,
        f: impl FnOnce(&T) -> Result<(), anyhow::Error> + Send + 'static,
    ) -> Finalized<T> {
        self.check_access();
        Finalized::new(
            value,
            self.current_execution_context(),
            self.inbox.clone(),
            f,
        )
    }

    /// Like [`Scheduler::add_finalizer`], but validates that the value is
    /// heap-allocated before registering. The wrapper boxes every value, so
    /// the validation is vacuously true and this simply delegates.
    pub fn add_finalizer_exn<T: Send + 'static>(
        &self,
        value: T,
        f: impl FnOnce(&T) -> Result<(), anyhow::Error> + Send + 'static,
    ) -> Finalized<T> {
        self.add_finalizer(value, f)
    }

    // === time ===

    pub fn time_source(&self) -> &TimeSource {
        &self.time_source
    }

    /// Register an alarm enqueueing `f` (under the current context) once
    /// the clock reaches `at`. An already-due alarm is enqueued right away.
    pub fn run_at(&self, at: Instant, f: impl FnOnce() -> Result<(), anyhow::Error> + 'static) {
        self.check_access();
        let job = Job::new(self.current_execution_context(), f);
        if let Some(due) = self.time_source.schedule(at, job) {
            self.enqueue_job(due);
        }
        let hook = self.event_added_hook.borrow().clone();
        if let Some(hook) = hook {
            hook(self, at);
        }
    }

    pub fn run_after(
        &self,
        after: Duration,
        f: impl FnOnce() -> Result<(), anyhow::Error> + 'static,
    ) {
        self.run_at(self.time_source.now() + after, f);
    }

    /// Move the logical clock to `now`, enqueueing every alarm that came
    /// due, and keep the auxiliary wall clock (if any) in lockstep.
    pub fn advance_clock(&self, now: Instant) {
        for job in self.time_source.advance(now) {
            self.enqueue_job(job);
        }
        let hook = self.advance_synchronous_wall_clock.borrow().clone();
        if let Some(hook) = hook {
            hook(now);
        }
    }

    /// Enqueue alarms already due at the wall clock's current reading
    /// without moving the logical clock. Used between cycles to surface
    /// alarms that fell due mid-cycle.
    pub fn fire_past_alarms(&self) {
        for job in self.time_source.fire_past_alarms() {
            self.enqueue_job(job);
        }
    }

    pub fn has_upcoming_event(&self) -> bool {
        !self.time_source.is_empty()
    }

    pub fn next_upcoming_event(&self) -> Option<Instant> {
        self.time_source.next_alarm_fires_at()
    }

    pub fn event_precision(&self) -> Duration {
        self.time_source.alarm_precision()
    }

    // === yielding ===

    /// A deferred that becomes determined at the start of the next cycle.
    pub fn yield_now(&self) -> Deferred<()> {
        self.check_access();
        self.yield_bvar.wait()
    }

    /// A deferred that becomes determined at the end of the first cycle
    /// that leaves every band empty.
    pub fn yield_until_no_jobs_remain(&self) -> Deferred<()> {
        self.check_access();
        self.yield_until_no_jobs_remain_bvar.wait()
    }

    /// A throttle that yields on every `period`th call and resolves
    /// immediately otherwise. `period = 1` yields on every call.
    pub fn yield_every(&self, period: usize) -> Result<YieldEvery, InvalidPeriod> {
        if period == 0 {
            return Err(InvalidPeriod(()));
        }
        Ok(YieldEvery { period, count: 0 })
    }

    // === very-low-priority pool ===

    /// Add a cooperative worker to the very-low-priority pool. The pool
    /// driver runs workers in FIFO order, in bounded slices between
    /// yields, under a `Low`-priority derivation of the current context.
    pub fn enqueue_very_low_priority_worker(
        &self,
        step: impl FnMut() -> Result<Step, anyhow::Error> + 'static,
    ) {
        self.check_access();
        let ctx = self.current_execution_context().with_priority(Priority::Low);
        let was_empty = self.low_priority_pool.is_empty();
        self.low_priority_pool.push_back(Worker {
            ctx: ctx.clone(),
            step: Box::new(step),
        });
        if was_empty {
            let sched = Weak::clone(&self.weak_self);
            self.enqueue_job(Job::new(ctx, move || {
                if let Some(sched) = sched.upgrade() {
                    sched.run_very_low_priority_workers();
                }
                Ok(())
            }));
        }
    }

    /// One driver slice: run pool workers for up to
    /// [`Pool::STEPS_PER_SLICE`] steps, then hand control back and re-arm
    /// behind the next yield if workers remain.
    fn run_very_low_priority_workers(&self) {
        let mut budget = Pool::STEPS_PER_SLICE;

        loop {
            let Some(mut worker) = self.low_priority_pool.pop_front() else {
                return;
            };

            let mut done_with_worker = false;
            {
                let _restore = self.enter_context(worker.ctx.clone());
                while budget > 0 {
                    match (worker.step)() {
                        Ok(Step::Finished) => {
                            done_with_worker = true;
                            break;
                        }
                        Ok(Step::NotFinished) => budget -= 1,
                        Err(error) => {
                            self.send_exn(worker.ctx.monitor(), error);
                            done_with_worker = true;
                            break;
                        }
                    }
                }
            }

            if !done_with_worker {
                // slice budget exhausted with this worker mid-run; it goes
                // back to the head of the deque
                self.low_priority_pool.push_front(worker);
                break;
            }
        }

        if !self.low_priority_pool.is_empty() {
            tracing::trace!(
                remaining = self.low_priority_pool.len(),
                "low-priority slice exhausted, re-arming behind yield"
            );
            let sched = Weak::clone(&self.weak_self);
            self.yield_bvar.wait().upon(self, move |()| {
                if let Some(sched) = sched.upgrade() {
                    sched.run_very_low_priority_workers();
                }
            });
        }
    }

    // === monitors ===

    /// Deliver `error` to `monitor`: offer it to each node's handlers up
    /// the tree. Unhandled at a detached root it is contained (and
    /// logged); unhandled at the main root it is recorded as the uncaught
    /// error and the scheduler becomes dead.
    pub fn send_exn(&self, monitor: &Arc<Monitor>, error: anyhow::Error) {
        let backtrace = if self.record_backtraces.get() {
            Some(Backtrace::force_capture())
        } else {
            None
        };
        let error = JobError::new(error, backtrace);

        let mut current = Arc::clone(monitor);
        loop {
            if current.try_handle(&error) {
                return;
            }
            match current.parent().cloned() {
                Some(parent) => current = parent,
                None if current.is_detached() => {
                    tracing::warn!(
                        monitor = current.name(),
                        %error,
                        "error reached detached monitor"
                    );
                    return;
                }
                None => {
                    tracing::error!(%error, "uncaught job error, scheduler is now dead");
                    let mut uncaught = self.uncaught_exn.borrow_mut();
                    if uncaught.is_none() {
                        *uncaught = Some(error);
                    }
                    self.is_dead.set(true);
                    return;
                }
            }
        }
    }

    // === cycles ===

    /// Run one cycle: broadcast yield, drain the inbox, advance the clock,
    /// then drain the bands in priority order within their budgets.
    pub fn run_cycle(&self) -> CycleSummary {
        self.check_access();
        let _dead_guard = DeadOnPanic { sched: self };

        if self.check_invariants.get() {
            self.assert_invariants();
        }

        let hook = self.on_start_of_cycle.borrow().clone();
        if let Some(hook) = hook {
            hook(self);
        }

        let now = self.time_source.now();
        self.cycle_count.set(self.cycle_count.get() + 1);
        self.cycle_start.set(now);

        let _span = tracing::debug_span!("cycle", n = self.cycle_count.get()).entered();

        self.yield_bvar.broadcast(self);

        let jobs_run_before = self.num_jobs_run.get();

        let hooks = self.run_every_cycle_start.borrow().clone();
        for hook in &hooks {
            hook(self);
        }

        self.drain_external_inbox();
        self.advance_clock(now);

        let budget = self.max_num_jobs_per_priority_per_cycle.get().get();
        for queue in &self.queues {
            queue.borrow_mut().set_jobs_left_this_cycle(budget);
        }

        self.drain_bands();

        let cycle_time = self.time_source.now().duration_since(self.cycle_start.get());
        self.last_cycle_time.set(cycle_time);
        let jobs_run = self.num_jobs_run.get() - jobs_run_before;
        self.last_cycle_num_jobs.set(jobs_run);

        if self.yield_until_no_jobs_remain_bvar.has_any_waiters() && self.all_bands_empty() {
            self.yield_until_no_jobs_remain_bvar.broadcast(self);
        }

        if self.check_invariants.get() {
            self.assert_invariants();
        }

        let hook = self.on_end_of_cycle.borrow().clone();
        if let Some(hook) = hook {
            hook(self);
        }

        let summary = CycleSummary {
            jobs_run,
            cycle_time,
            has_remaining: self.num_pending_jobs() > 0,
        };
        tracing::debug!(
            cycle.jobs_run = summary.jobs_run,
            cycle.has_remaining = summary.has_remaining,
        );
        summary
    }

    /// Drive cycles (advancing the clock and firing mid-cycle alarms in
    /// between) until no job can run, then restore the main context.
    ///
    /// # Errors
    ///
    /// [`RunError::Dead`] if the scheduler was already dead;
    /// [`RunError::Uncaught`] re-raising an error that reached the root
    /// monitor during this run.
    pub fn run_cycles_until_no_jobs_remain(&self) -> Result<(), RunError> {
        self.check_access();
        if self.is_dead.get() {
            return Err(RunError::Dead);
        }

        loop {
            self.run_cycle();
            if self.is_dead.get() {
                // an uncaught error may not dequeue any further jobs
                break;
            }
            self.advance_clock(self.time_source.now());
            self.fire_past_alarms();
            if !self.can_run_a_job() {
                break;
            }
        }

        self.current_execution_context
            .replace(self.main_execution_context.clone());

        if let Some(uncaught) = self.uncaught_exn.borrow_mut().take() {
            return Err(RunError::Uncaught(uncaught));
        }
        Ok(())
    }

    /// Abort draining the `Normal` band after the currently running job;
    /// the cycle then proceeds straight to `Low` and ends.
    pub fn force_current_cycle_to_end(&self) {
        tracing::debug!("forcing current cycle to end");
        self.queues[Priority::Normal.index()]
            .borrow_mut()
            .set_jobs_left_this_cycle(0);
    }

    pub fn can_run_a_job(&self) -> bool {
        self.num_pending_jobs() > 0 || self.yield_bvar.has_any_waiters()
    }

    fn drain_bands(&self) {
        loop {
            let Some(job) = self.next_runnable_job() else {
                break;
            };
            self.run_job(job);
        }
    }

    /// The front job of the highest band that is non-empty and still has
    /// budget, consuming one unit of that budget.
    fn next_runnable_job(&self) -> Option<Job> {
        Priority::ALL.iter().find_map(|band| {
            self.queues[band.index()]
                .borrow_mut()
                .dequeue_within_budget()
        })
    }

    fn run_job(&self, job: Job) {
        let (ctx, thunk) = job.into_parts();
        let _span = tracing::trace_span!("job", priority = ?ctx.priority()).entered();

        let result = {
            let _restore = self.enter_context(ctx.clone());
            thunk()
        };

        self.num_jobs_run.set(self.num_jobs_run.get() + 1);
        if let Err(error) = result {
            self.send_exn(ctx.monitor(), error);
        }
    }

    fn all_bands_empty(&self) -> bool {
        self.queues.iter().all(|queue| queue.borrow().is_empty())
    }

    // === observables ===

    pub fn cycle_count(&self) -> u64 {
        self.cycle_count.get()
    }

    pub fn cycle_start(&self) -> Instant {
        self.cycle_start.get()
    }

    pub fn last_cycle_time(&self) -> Duration {
        self.last_cycle_time.get()
    }

    pub fn last_cycle_num_jobs(&self) -> u64 {
        self.last_cycle_num_jobs.get()
    }

    pub fn num_jobs_run(&self) -> u64 {
        self.num_jobs_run.get()
    }

    pub fn num_pending_jobs(&self) -> usize {
        self.queues.iter().map(|queue| queue.borrow().len()).sum()
    }

    pub fn is_dead(&self) -> bool {
        self.is_dead.get()
    }

    pub fn has_uncaught_exn(&self) -> bool {
        self.uncaught_exn.borrow().is_some()
    }

    // === per-cycle streams ===

    /// A stream of `f(cycle_time)` for every cycle completing after this
    /// call.
    pub fn map_cycle_times<T: 'static>(
        &self,
        f: impl Fn(Duration) -> T + 'static,
    ) -> CycleStream<T> {
        self.cycle_stream(move |sched| Some(f(sched.last_cycle_time())))
    }

    /// A stream of per-cycle job counts.
    pub fn cycle_num_jobs(&self) -> CycleStream<u64> {
        self.cycle_stream(|sched| Some(sched.last_cycle_num_jobs()))
    }

    /// A stream of the durations of cycles that took at least `at_least`.
    pub fn long_cycles(&self, at_least: Duration) -> CycleStream<Duration> {
        self.cycle_stream(move |sched| {
            let cycle_time = sched.last_cycle_time();
            (cycle_time >= at_least).then_some(cycle_time)
        })
    }

    fn cycle_stream<T: 'static>(
        &self,
        f: impl Fn(&Scheduler) -> Option<T> + 'static,
    ) -> CycleStream<T> {
        let (stream, buf) = CycleStream::new();
        // A cycle's value exists only once the cycle completed, so the
        // observer fires at the start of the *following* cycle and the
        // first firing after subscription has nothing to report yet.
        let primed = Cell::new(false);
        self.add_run_every_cycle_start(move |sched| {
            if !primed.replace(true) {
                return;
            }
            if let Some(value) = f(sched) {
                buf.borrow_mut().push_back(value);
            }
        });
        stream
    }

    // === settings & hooks ===

    pub fn max_num_jobs_per_priority_per_cycle(&self) -> NonZeroUsize {
        self.max_num_jobs_per_priority_per_cycle.get()
    }

    pub fn set_max_num_jobs_per_priority_per_cycle(&self, max: NonZeroUsize) {
        self.max_num_jobs_per_priority_per_cycle.set(max);
    }

    pub fn set_check_invariants(&self, check: bool) {
        self.check_invariants.set(check);
    }

    pub fn set_record_backtraces(&self, record: bool) {
        self.record_backtraces.set(record);
    }

    pub fn set_on_start_of_cycle(&self, f: impl Fn(&Scheduler) + 'static) {
        *self.on_start_of_cycle.borrow_mut() = Some(Rc::new(f));
    }

    pub fn set_on_end_of_cycle(&self, f: impl Fn(&Scheduler) + 'static) {
        *self.on_end_of_cycle.borrow_mut() = Some(Rc::new(f));
    }

    /// Fires on every alarm registration, with the alarm's instant.
    pub fn set_event_added_hook(&self, f: impl Fn(&Scheduler, Instant) + 'static) {
        *self.event_added_hook.borrow_mut() = Some(Rc::new(f));
    }

    /// Fires on every enqueue path (user enqueues, bvar broadcasts,
    /// alarms, inbox drains and finalizers) with the band enqueued into.
    pub fn set_job_queued_hook(&self, f: impl Fn(&Scheduler, Priority) + 'static) {
        *self.job_queued_hook.borrow_mut() = Some(Rc::new(f));
    }

    /// Keeps an auxiliary wall-clock source in lockstep: called with `now`
    /// whenever the primary time source advances.
    pub fn set_advance_synchronous_wall_clock(&self, f: impl Fn(Instant) + 'static) {
        *self.advance_synchronous_wall_clock.borrow_mut() = Some(Rc::new(f));
    }

    /// Register a hook run at every cycle start. Hooks are stored newest
    /// first and invoked in storage order.
    pub fn add_run_every_cycle_start(&self, f: impl Fn(&Scheduler) + 'static) {
        self.run_every_cycle_start.borrow_mut().insert(0, Rc::new(f));
    }

    /// After this, every entry point that consults the access check
    /// panics. There is no way back.
    pub fn make_async_unusable(&self) {
        *self.check_access.borrow_mut() = Some(Box::new(|| {
            panic!("access denied: this scheduler has been made unusable");
        }));
    }

    fn check_access(&self) {
        if let Some(check) = &*self.check_access.borrow() {
            check();
        }
    }

    // === invariants ===

    fn assert_invariants(&self) {
        let max = self.max_num_jobs_per_priority_per_cycle.get().get();
        for (band, queue) in Priority::ALL.iter().zip(&self.queues) {
            let left = queue.borrow().jobs_left_this_cycle();
            assert!(
                left <= max,
                "band {band:?} has {left} jobs left this cycle, more than the maximum {max}"
            );
        }
        assert!(
            self.current_execution_context
                .borrow()
                .same(&self.main_execution_context),
            "outside a job, the main execution context must be current"
        );
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("cycle_count", &self.cycle_count.get())
            .field("num_pending_jobs", &self.num_pending_jobs())
            .field("num_jobs_run", &self.num_jobs_run.get())
            .field("is_dead", &self.is_dead.get())
            .finish_non_exhaustive()
    }
}

// === impl YieldEvery ===

impl YieldEvery {
    /// The next yield point: already determined except on every `period`th
    /// call.
    pub fn yield_point(&mut self, sched: &Scheduler) -> Deferred<()> {
        self.count += 1;
        if self.count >= self.period {
            self.count = 0;
            sched.yield_now()
        } else {
            Deferred::determined(())
        }
    }
}

// === impl RestoreContext ===

impl Drop for RestoreContext<'_> {
    fn drop(&mut self) {
        let prev = self.prev.take().expect("context restored twice");
        self.sched.current_execution_context.replace(prev);
    }
}

// === impl DeadOnPanic ===

impl Drop for DeadOnPanic<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.sched.is_dead.set(true);
        }
    }
}
