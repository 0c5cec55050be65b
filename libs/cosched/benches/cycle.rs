// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use cosched::Scheduler;
use criterion::{Criterion, criterion_group, criterion_main};
use std::rc::Rc;

fn schedule_run_10k(c: &mut Criterion) {
    const JOBS: usize = 10_000;

    c.bench_function("schedule_run_10k", |b| {
        b.iter(|| {
            let sched = Scheduler::new();
            for _ in 0..JOBS {
                sched.schedule(|| Ok(()));
            }
            sched.run_cycles_until_no_jobs_remain().unwrap();
        });
    });
}

fn yield_chain_1k(c: &mut Criterion) {
    const YIELDS: usize = 1_000;

    fn arm(sched: &Rc<Scheduler>, left: usize) {
        if left == 0 {
            return;
        }
        let next = Rc::clone(sched);
        sched.yield_now().upon(sched, move |()| arm(&next, left - 1));
    }

    c.bench_function("yield_chain_1k", |b| {
        b.iter(|| {
            let sched = Scheduler::new();
            arm(&sched, YIELDS);
            sched.run_cycles_until_no_jobs_remain().unwrap();
        });
    });
}

fn alarm_wave_1k(c: &mut Criterion) {
    const ALARMS: usize = 1_000;

    c.bench_function("alarm_wave_1k", |b| {
        b.iter(|| {
            let sched = Scheduler::new();
            for i in 0..ALARMS {
                sched.run_after(core::time::Duration::from_nanos(i as u64), || Ok(()));
            }
            sched.run_cycles_until_no_jobs_remain().unwrap();
        });
    });
}

criterion_group!(cycle, schedule_run_10k, yield_chain_1k, alarm_wave_1k);
criterion_main!(cycle);
