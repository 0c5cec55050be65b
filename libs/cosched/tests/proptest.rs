// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::cell::RefCell;
use core::num::NonZeroUsize;
use cosched::{Priority, Scheduler};
use proptest::prelude::*;
use std::rc::Rc;

fn band() -> impl Strategy<Value = Priority> {
    prop_oneof![
        Just(Priority::High),
        Just(Priority::Normal),
        Just(Priority::Low),
    ]
}

proptest! {
    /// Whatever goes in comes out: the multiset of executed jobs equals the
    /// multiset of enqueued jobs, and within each band the order is
    /// preserved, for any interleaving of bands and any per-cycle budget.
    #[test]
    fn multiset_preserved_and_bands_stay_fifo(
        jobs in proptest::collection::vec((band(), 0_u16..1000), 0..200),
        budget in 1_usize..50,
    ) {
        let sched = Scheduler::new();
        sched.set_max_num_jobs_per_priority_per_cycle(NonZeroUsize::new(budget).unwrap());

        let ran = Rc::new(RefCell::new(Vec::new()));
        for &(band, id) in &jobs {
            let ran = Rc::clone(&ran);
            sched.schedule_with_priority(band, move || {
                ran.borrow_mut().push((band, id));
                Ok(())
            });
        }

        sched.run_cycles_until_no_jobs_remain().unwrap();
        let ran = ran.borrow();

        let mut executed = ran.clone();
        executed.sort_unstable();
        let mut enqueued = jobs.clone();
        enqueued.sort_unstable();
        prop_assert_eq!(executed, enqueued);

        for band in Priority::ALL {
            let expected: Vec<u16> = jobs
                .iter()
                .filter(|(b, _)| *b == band)
                .map(|(_, id)| *id)
                .collect();
            let actual: Vec<u16> = ran
                .iter()
                .filter(|(b, _)| *b == band)
                .map(|(_, id)| *id)
                .collect();
            prop_assert_eq!(actual, expected);
        }
    }

    /// No single cycle exceeds its per-band budget, and every job still
    /// eventually runs.
    #[test]
    fn per_cycle_budget_is_respected(
        num_jobs in 0_usize..120,
        budget in 1_usize..20,
    ) {
        let sched = Scheduler::new();
        sched.set_max_num_jobs_per_priority_per_cycle(NonZeroUsize::new(budget).unwrap());

        let ran = Rc::new(RefCell::new(0_usize));
        for _ in 0..num_jobs {
            let ran = Rc::clone(&ran);
            sched.schedule(move || {
                *ran.borrow_mut() += 1;
                Ok(())
            });
        }

        loop {
            let summary = sched.run_cycle();
            prop_assert!(summary.jobs_run <= budget as u64);
            if !summary.has_remaining {
                break;
            }
        }
        prop_assert_eq!(*ran.borrow(), num_jobs);
        prop_assert_eq!(sched.num_jobs_run(), num_jobs as u64);
    }

    /// Strict priority: in any single cycle, no lower-band job runs before
    /// a higher-band job that was already queued.
    #[test]
    fn higher_bands_run_first_within_a_cycle(
        jobs in proptest::collection::vec(band(), 1..60),
    ) {
        let sched = Scheduler::new();

        let ran = Rc::new(RefCell::new(Vec::new()));
        for &band in &jobs {
            let ran = Rc::clone(&ran);
            sched.schedule_with_priority(band, move || {
                ran.borrow_mut().push(band);
                Ok(())
            });
        }

        sched.run_cycle();
        let ran = ran.borrow();
        prop_assert_eq!(ran.len(), jobs.len());
        // the execution order must be sorted by band
        let mut sorted = ran.clone();
        sorted.sort();
        prop_assert_eq!(ran.clone(), sorted);
    }
}
