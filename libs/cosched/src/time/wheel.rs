// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::job::Job;
use core::fmt;

/// A number of clock ticks, the unit the wheel is indexed in.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Ticks(pub u64);

/// An alarm: a job to be enqueued once the clock reaches `deadline`.
#[derive(Debug)]
pub(crate) struct Alarm {
    pub(crate) deadline: Ticks,
    pub(crate) job: Job,
}

#[derive(Copy, Clone, Debug)]
pub(crate) struct Deadline {
    pub(crate) ticks: Ticks,
    slot: usize,
    wheel: usize,
}

/// The hierarchical timing wheel: 6 levels of 64 slots.
///
/// Each level has a precision multiplier of `64^x` where `x` is the wheel
/// level, so with e.g. a 1 µs tick the levels span ~64 µs, ~4 ms, ~262 ms,
/// ~17 s, ~18 min and ~19 h of range respectively. Alarms further out than
/// the whole range are parked in the top level and cascade down as the
/// wheel turns.
pub(crate) struct Core {
    /// The ticks that have elapsed since the wheel started.
    elapsed: Ticks,
    /// Live alarms across all levels.
    len: usize,
    wheels: [Wheel; Core::WHEELS],
}

struct Wheel {
    /// A bitmap of the slots that are occupied.
    ///
    /// The least-significant bit represents slot zero.
    ///
    /// See <https://lwn.net/Articles/646056/> for details on
    /// this strategy.
    occupied_slots: u64,
    slots: [Vec<Alarm>; Wheel::SLOTS],
    /// This wheel's level.
    level: usize,
    /// The number of ticks represented by a single slot in this wheel.
    ticks_per_slot: Ticks,
    /// The number of ticks represented by this entire wheel.
    ticks_per_wheel: Ticks,
    /// A bitmask for masking out all lower wheels' indices from a `now`
    /// timestamp.
    wheel_mask: u64,
}

// === impl Core ===

impl Core {
    const WHEELS: usize = Wheel::BITS;
    const MAX_SLEEP_TICKS: u64 = (1 << (Wheel::BITS * Self::WHEELS)) - 1;

    pub(crate) const fn new() -> Self {
        Self {
            elapsed: Ticks(0),
            len: 0,
            wheels: [
                Wheel::new(0),
                Wheel::new(1),
                Wheel::new(2),
                Wheel::new(3),
                Wheel::new(4),
                Wheel::new(5),
            ],
        }
    }

    pub(crate) fn elapsed(&self) -> Ticks {
        self.elapsed
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Register an alarm. Fails (returning it back) if its deadline is not
    /// in the future, in which case it is due immediately.
    pub(crate) fn insert(&mut self, alarm: Alarm) -> Result<(), Alarm> {
        if alarm.deadline <= self.elapsed {
            return Err(alarm);
        }
        tracing::trace!(deadline = ?alarm.deadline, "inserting alarm");
        self.insert_at(alarm);
        self.len += 1;
        Ok(())
    }

    /// Turn the wheel up to `now`, returning every alarm that came due.
    pub(crate) fn advance_to(&mut self, now: Ticks) -> Vec<Alarm> {
        self.poll(now)
    }

    /// Fire alarms due at `now` without moving the wheel's elapsed time.
    pub(crate) fn fire_due(&mut self, now: Ticks) -> Vec<Alarm> {
        let elapsed = self.elapsed;
        let fired = self.poll(now);
        self.elapsed = elapsed;
        fired
    }

    fn poll(&mut self, now: Ticks) -> Vec<Alarm> {
        // alarms that need to be rescheduled on lower-level wheels need to
        // be processed after we have finished turning the wheel, to avoid
        // looping infinitely.
        let mut pending_reschedule = Vec::new();
        let mut fired = Vec::new();

        let mut next_deadline = self.next_deadline();
        while let Some(deadline) = next_deadline {
            // if the deadline is in the future we don't need to continue
            if deadline.ticks > now {
                break;
            }

            // Note that we need to take _all_ of the alarms out of the slot
            // before processing any of them. An alarm parked on the highest
            // level more than the wheel's full range into the future wraps
            // around and is visited a multiple of that range before it is
            // actually due; it must then be reinserted into the same
            // position without being visited again this turn.
            let alarms = self.wheels[deadline.wheel].take_slot(deadline.slot);
            for alarm in alarms {
                if alarm.deadline > now {
                    // this alarm was on a high-level wheel and needs to be
                    // rescheduled on a lower-level wheel, rather than firing
                    // now.
                    debug_assert_ne!(
                        deadline.wheel, 0,
                        "if an alarm is being rescheduled, it must not have been on the lowest-level wheel"
                    );
                    pending_reschedule.push(alarm);
                } else {
                    fired.push(alarm);
                }
            }

            self.elapsed = deadline.ticks;
            next_deadline = self.next_deadline();
        }

        self.elapsed = now;

        for alarm in pending_reschedule {
            debug_assert!(alarm.deadline > self.elapsed);
            self.insert_at(alarm);
        }

        self.len -= fired.len();
        fired
    }

    pub(crate) fn next_deadline(&self) -> Option<Deadline> {
        self.wheels
            .iter()
            .find_map(|wheel| wheel.next_deadline(self.elapsed))
    }

    fn insert_at(&mut self, alarm: Alarm) {
        let wheel = wheel_index(self.elapsed, alarm.deadline);
        self.wheels[wheel].insert(alarm);
    }
}

impl fmt::Debug for Core {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Core")
            .field("elapsed", &self.elapsed)
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

// === impl Wheel ===

impl Wheel {
    /// The number of slots per timer wheel is fixed at 64 slots.
    ///
    /// This is because we can use a 64-bit bitmap for each wheel to store
    /// which slots are occupied.
    const SLOTS: usize = 64;

    const BITS: usize = Self::SLOTS.trailing_zeros() as usize;

    #[expect(
        clippy::cast_possible_truncation,
        reason = "the level is at most 5"
    )]
    const fn new(level: usize) -> Self {
        // how many ticks does a single slot represent in a wheel of this level?
        let ticks_per_slot = Ticks(Self::SLOTS.pow(level as u32) as u64);
        let ticks_per_wheel = Ticks(ticks_per_slot.0 * Self::SLOTS as u64);

        debug_assert!(ticks_per_slot.0.is_power_of_two());
        debug_assert!(ticks_per_wheel.0.is_power_of_two());

        // because `ticks_per_wheel` is a power of two, we can calculate a
        // bitmask for masking out the indices in all lower wheels from a `now`
        // timestamp.
        let wheel_mask = !(ticks_per_wheel.0 - 1);
        let slots = [const { Vec::new() }; Self::SLOTS];

        Self {
            level,
            ticks_per_slot,
            ticks_per_wheel,
            wheel_mask,
            occupied_slots: 0,
            slots,
        }
    }

    fn insert(&mut self, alarm: Alarm) {
        let slot = self.slot_index(alarm.deadline);
        self.slots[slot].push(alarm);
        // toggle the occupied bit for that slot.
        self.fill_slot(slot);
    }

    fn next_deadline(&self, now: Ticks) -> Option<Deadline> {
        let distance = self.next_slot_distance(now)?;

        let slot = distance % Self::SLOTS;
        // does the next slot wrap this wheel around from the now slot?
        let skipped = distance.saturating_sub(Self::SLOTS);

        debug_assert!(
            distance < Self::SLOTS * 2,
            "distance must be less than 2*{}, but found {distance}",
            Self::SLOTS
        );
        debug_assert!(
            skipped == 0 || self.level == Core::WHEELS - 1,
            "if the next expiring slot wraps around, we must be on the top level wheel\
            \n    dist: {distance}\
            \n    slot: {slot}\
            \n skipped: {skipped}\
            \n   level: {}",
            self.level,
        );

        // when did the current rotation of this wheel begin? since all wheels
        // represent a power-of-two number of ticks, we can determine the
        // beginning of this rotation by masking out the bits for all lower wheels.
        let rotation_start = now.0 & self.wheel_mask;
        // the next deadline is the start of the current rotation, plus the next
        // slot's value.
        let ticks = {
            let skipped_ticks = skipped as u64 * self.ticks_per_wheel.0;
            Ticks(rotation_start + (slot as u64 * self.ticks_per_slot.0) + skipped_ticks)
        };

        Some(Deadline {
            ticks,
            slot,
            wheel: self.level,
        })
    }

    fn take_slot(&mut self, slot: usize) -> Vec<Alarm> {
        debug_assert!(
            self.occupied_slots & (1 << slot) != 0,
            "taking an unoccupied slot!"
        );
        let alarms = core::mem::take(&mut self.slots[slot]);
        debug_assert!(
            !alarms.is_empty(),
            "if a slot is occupied, its list must not be empty"
        );
        self.clear_slot(slot);
        alarms
    }

    /// Returns the slot index of the next firing alarm.
    #[expect(
        clippy::cast_possible_truncation,
        reason = "slot index can be at most 64"
    )]
    fn next_slot_distance(&self, now: Ticks) -> Option<usize> {
        if self.occupied_slots == 0 {
            return None;
        }

        // which slot is indexed by the `now` timestamp?
        let now_slot = (now.0 / self.ticks_per_slot.0) as u32 % Self::SLOTS as u32;
        let next_dist = next_set_bit(self.occupied_slots, now_slot)? % Self::SLOTS;

        Some(next_dist)
    }

    fn clear_slot(&mut self, slot_index: usize) {
        debug_assert!(slot_index < Self::SLOTS);
        self.occupied_slots &= !(1 << slot_index);
    }

    fn fill_slot(&mut self, slot_index: usize) {
        debug_assert!(slot_index < Self::SLOTS);
        self.occupied_slots |= 1 << slot_index;
    }

    /// Given a deadline, returns the slot into which an alarm for that
    /// deadline would be inserted.
    #[expect(
        clippy::cast_possible_truncation,
        reason = "slot index can be at most 64"
    )]
    const fn slot_index(&self, ticks: Ticks) -> usize {
        let shift = self.level * Self::BITS;
        ((ticks.0 >> shift) % Self::SLOTS as u64) as usize
    }
}

fn wheel_index(now: Ticks, deadline: Ticks) -> usize {
    const WHEEL_MASK: u64 = (1 << Wheel::BITS) - 1;

    // mask out the bits representing the index in the wheel
    let mut wheel_indices = now.0 ^ deadline.0 | WHEEL_MASK;

    // put alarms over the max duration in the top level wheel
    if wheel_indices >= Core::MAX_SLEEP_TICKS {
        wheel_indices = Core::MAX_SLEEP_TICKS - 1;
    }

    let zeros = wheel_indices.leading_zeros();
    let rest = u64::BITS - 1 - zeros;

    rest as usize / Core::WHEELS
}

/// Finds the index of the next set bit in `bitmap` after the `offset`th bit.
/// If the `offset`th bit is set, returns `offset`.
///
/// Based on
/// <https://github.com/torvalds/linux/blob/d0e60d46bc03252b8d4ffaaaa0b371970ac16cda/include/linux/find.h#L21-L45>
fn next_set_bit(bitmap: u64, offset: u32) -> Option<usize> {
    debug_assert!(offset < 64, "offset: {offset}");
    if bitmap == 0 {
        return None;
    }
    let shifted = bitmap >> offset;
    let zeros = if shifted == 0 {
        bitmap.rotate_right(offset).trailing_zeros()
    } else {
        shifted.trailing_zeros()
    };
    Some(zeros as usize + offset as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExecutionContext;
    use crate::monitor::Monitor;

    fn alarm(deadline: u64) -> Alarm {
        Alarm {
            deadline: Ticks(deadline),
            job: Job::new(ExecutionContext::main(Monitor::main()), || Ok(())),
        }
    }

    fn deadlines(alarms: &[Alarm]) -> Vec<u64> {
        alarms.iter().map(|a| a.deadline.0).collect()
    }

    #[test]
    fn fires_in_deadline_order() {
        let mut core = Core::new();
        for deadline in [30, 5, 12] {
            core.insert(alarm(deadline)).unwrap();
        }
        assert_eq!(core.len(), 3);

        let fired = core.advance_to(Ticks(12));
        assert_eq!(deadlines(&fired), [5, 12]);
        assert_eq!(core.len(), 1);

        let fired = core.advance_to(Ticks(100));
        assert_eq!(deadlines(&fired), [30]);
        assert!(core.is_empty());
    }

    #[test]
    fn past_deadline_is_rejected() {
        let mut core = Core::new();
        core.advance_to(Ticks(10));
        assert!(core.insert(alarm(10)).is_err());
        assert!(core.insert(alarm(3)).is_err());
        assert!(core.insert(alarm(11)).is_ok());
    }

    #[test]
    fn cascades_from_higher_wheels() {
        let mut core = Core::new();
        // lands on wheel 1 (more than one rotation of wheel 0 out)
        core.insert(alarm(100)).unwrap();

        // turning to just before the deadline must not fire it
        let fired = core.advance_to(Ticks(99));
        assert!(fired.is_empty());
        assert_eq!(core.len(), 1);

        let fired = core.advance_to(Ticks(100));
        assert_eq!(deadlines(&fired), [100]);
    }

    #[test]
    fn far_future_alarm_survives_many_turns() {
        let mut core = Core::new();
        let deadline = Core::MAX_SLEEP_TICKS + 17;
        core.insert(alarm(deadline)).unwrap();

        assert!(core.advance_to(Ticks(Core::MAX_SLEEP_TICKS / 2)).is_empty());
        assert!(core.advance_to(Ticks(Core::MAX_SLEEP_TICKS)).is_empty());
        let fired = core.advance_to(Ticks(deadline));
        assert_eq!(deadlines(&fired), [deadline]);
    }

    #[test]
    fn fire_due_leaves_elapsed_untouched() {
        let mut core = Core::new();
        core.insert(alarm(5)).unwrap();
        core.insert(alarm(40)).unwrap();

        let fired = core.fire_due(Ticks(7));
        assert_eq!(deadlines(&fired), [5]);
        assert_eq!(core.elapsed(), Ticks(0));

        let fired = core.advance_to(Ticks(40));
        assert_eq!(deadlines(&fired), [40]);
        assert_eq!(core.elapsed(), Ticks(40));
    }

    #[test]
    fn next_deadline_reports_nearest() {
        let mut core = Core::new();
        assert!(core.next_deadline().is_none());

        core.insert(alarm(300)).unwrap();
        core.insert(alarm(20)).unwrap();

        let next = core.next_deadline().unwrap();
        assert_eq!(next.ticks, Ticks(20));
    }

    #[test]
    fn next_set_bit_wraps() {
        assert_eq!(next_set_bit(0b0000_1001, 0), Some(0));
        assert_eq!(next_set_bit(0b0000_1001, 1), Some(3));
        assert_eq!(next_set_bit(0b0000_1001, 4), Some(64));
        assert_eq!(next_set_bit(0, 12), None);
    }
}
