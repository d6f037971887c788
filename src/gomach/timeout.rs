//! Named one-shot timeouts multiplexed onto the timer's single timeout alarm
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use log::{trace, warn};
use strum::{Display, EnumIter};

use crate::timer::{Alarm, Timer};
use crate::Tick;

use super::config::TIMEOUT_COUNT;

/// Protocol timeout kinds, at most one of each may be armed at a time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter)]
pub enum TimeoutKind {
    /// Random start offset during initialisation
    InitBackoff,
    /// End of the contention period listen window
    CpEnd,
    /// Absolute limit on contention period extensions
    CpMax,
    /// Wait for an ongoing reception to finish
    WaitRxEnd,
    /// End of the vTDMA reception window
    Vtdma,
    /// Wait for a neighbor's CP (t2k)
    WaitCp,
    /// Wait for the receiver's beacon (t2k)
    WaitBeacon,
    /// Wait for the first granted vTDMA slot (t2k)
    WaitSlots,
    /// Guard for a missing transmission complete event
    NoTxIsr,
    /// Wait for a preamble-ack after a preamble (t2u)
    Preamble,
    /// Maximum interval between preambles (t2u)
    MaxPreambleInterval,
    /// Total preamble flood duration (t2u)
    PreambleDuration,
    /// Total broadcast duration
    BcastFinish,
    /// Gap between broadcast repeats
    BcastInterval,
}

#[derive(Debug, Clone, PartialEq)]
struct Entry {
    kind: TimeoutKind,
    deadline: Tick,
    expired: bool,
}

/// Check whether a (wrapping) deadline has been reached
fn reached(now: Tick, deadline: Tick) -> bool {
    (now.wrapping_sub(deadline) as i32) >= 0
}

/// Fixed pool of protocol timeouts
#[derive(Debug, Clone, PartialEq)]
pub struct Timeouts {
    pool: [Option<Entry>; TIMEOUT_COUNT],
    /// Pool index the timer's timeout alarm is currently armed for
    armed: Option<u8>,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self::new()
    }
}

impl Timeouts {
    pub fn new() -> Self {
        Self {
            pool: Default::default(),
            armed: None,
        }
    }

    fn find(&self, kind: TimeoutKind) -> Option<usize> {
        self.pool.iter().position(|e| matches!(e, Some(e) if e.kind == kind))
    }

    /// Arm a timeout `duration` ticks from now, fails if a timeout of the
    /// same kind is already armed (or pending consumption) or the pool is full
    pub fn set<T: Timer>(&mut self, timer: &mut T, kind: TimeoutKind, duration: u32) -> bool {
        if self.find(kind).is_some() {
            warn!("Timeout {} already armed", kind);
            return false;
        }

        let index = match self.pool.iter().position(|e| e.is_none()) {
            Some(i) => i,
            None => {
                warn!("Cannot set timeout {}, too many concurrent timeouts", kind);
                return false;
            }
        };

        let deadline = timer.ticks().wrapping_add(duration);
        trace!("Set timeout {} ({}) for {} us", kind, index, duration);

        self.pool[index] = Some(Entry { kind, deadline, expired: false });
        self.rearm(timer);

        true
    }

    /// Cancel a timeout, clearing a timeout that is not armed has no effect
    pub fn clear<T: Timer>(&mut self, timer: &mut T, kind: TimeoutKind) {
        if let Some(i) = self.find(kind) {
            self.pool[i] = None;
            self.rearm(timer);
        }
    }

    /// Cancel all timeouts
    pub fn reset<T: Timer>(&mut self, timer: &mut T) {
        self.pool = Default::default();
        self.rearm(timer);
    }

    /// Check for and consume an expired timeout,
    /// returns true exactly once per expiry
    pub fn is_expired(&mut self, kind: TimeoutKind) -> bool {
        match self.find(kind) {
            Some(i) if matches!(&self.pool[i], Some(e) if e.expired) => {
                self.pool[i] = None;
                true
            },
            _ => false,
        }
    }

    /// Check whether an un-expired timeout of this kind exists
    pub fn is_running(&self, kind: TimeoutKind) -> bool {
        self.pool.iter().any(|e| matches!(e, Some(e) if e.kind == kind && !e.expired))
    }

    /// Handle expiry of the timeout alarm for the provided pool index,
    /// returns true if any timeout expired
    pub fn fire<T: Timer>(&mut self, timer: &mut T, index: u8) -> bool {
        let now = timer.ticks();

        if self.armed == Some(index) {
            self.armed = None;
        }

        let mut fired = false;
        for e in self.pool.iter_mut().flatten() {
            if !e.expired && reached(now, e.deadline) {
                trace!("Timeout {} expired", e.kind);
                e.expired = true;
                fired = true;
            }
        }

        if !fired {
            trace!("Stale timeout alarm ({})", index);
        }

        self.rearm(timer);

        fired
    }

    // Point the timer's timeout alarm at the earliest pending deadline
    fn rearm<T: Timer>(&mut self, timer: &mut T) {
        let now = timer.ticks();

        let next = self.pool.iter().enumerate()
            .filter_map(|(i, e)| match e {
                Some(e) if !e.expired => Some((i, e.deadline)),
                _ => None,
            })
            .min_by_key(|(_, deadline)| {
                if reached(now, *deadline) { 0 } else { deadline.wrapping_sub(now) }
            });

        match next {
            Some((i, deadline)) => {
                if let Some(prev) = self.armed {
                    if prev as usize != i {
                        timer.clear_alarm(Alarm::Timeout(prev));
                    }
                }
                timer.set_alarm(Alarm::Timeout(i as u8), deadline);
                self.armed = Some(i as u8);
            },
            None => {
                if let Some(prev) = self.armed.take() {
                    timer.clear_alarm(Alarm::Timeout(prev));
                }
            },
        }
    }
}

#[cfg(test)]
mod test {
    use strum::IntoEnumIterator;

    use super::*;
    use crate::timer::mock::MockTimer;

    #[test]
    fn set_is_exclusive_per_kind() {
        let mut timer = MockTimer::new();
        let mut t = Timeouts::new();

        assert!(t.set(&mut timer, TimeoutKind::CpEnd, 1_000));
        assert!(!t.set(&mut timer, TimeoutKind::CpEnd, 50));

        // The second request does not move the deadline
        assert_eq!(timer.alarm(Alarm::Timeout(0)), Some((Alarm::Timeout(0), 1_000)));
        assert!(t.is_running(TimeoutKind::CpEnd));
    }

    #[test]
    fn expiry_reported_once() {
        let mut timer = MockTimer::new();
        let mut t = Timeouts::new();

        t.set(&mut timer, TimeoutKind::WaitCp, 500);
        assert!(!t.is_expired(TimeoutKind::WaitCp));

        let alarm = timer.fire_next().unwrap();
        assert_eq!(alarm, Alarm::Timeout(0));
        assert_eq!(timer.val(), 500);
        assert!(t.fire(&mut timer, 0));

        assert!(!t.is_running(TimeoutKind::WaitCp));
        assert!(t.is_expired(TimeoutKind::WaitCp));
        assert!(!t.is_expired(TimeoutKind::WaitCp));

        // Consumed entries can be re-armed
        assert!(t.set(&mut timer, TimeoutKind::WaitCp, 500));
    }

    #[test]
    fn alarm_tracks_earliest_deadline() {
        let mut timer = MockTimer::new();
        let mut t = Timeouts::new();

        t.set(&mut timer, TimeoutKind::CpMax, 50_000);
        t.set(&mut timer, TimeoutKind::CpEnd, 10_000);
        assert_eq!(timer.next(), Some((Alarm::Timeout(1), 10_000)));

        t.clear(&mut timer, TimeoutKind::CpEnd);
        assert_eq!(timer.next(), Some((Alarm::Timeout(0), 50_000)));

        // Clearing is idempotent
        t.clear(&mut timer, TimeoutKind::CpEnd);
        t.clear(&mut timer, TimeoutKind::CpMax);
        assert_eq!(timer.next(), None);
    }

    #[test]
    fn deadlines_across_counter_wrap() {
        let mut timer = MockTimer::new();
        timer.set(u32::MAX - 100);
        let mut t = Timeouts::new();

        t.set(&mut timer, TimeoutKind::NoTxIsr, 1_000);

        // Early (stale) alarm does not expire the entry
        timer.inc(500);
        assert!(!t.fire(&mut timer, 0));
        assert!(t.is_running(TimeoutKind::NoTxIsr));

        timer.fire_next();
        assert_eq!(timer.val(), 899);
        assert!(t.fire(&mut timer, 0));
        assert!(t.is_expired(TimeoutKind::NoTxIsr));
    }

    #[test]
    fn pool_exhaustion() {
        let mut timer = MockTimer::new();
        let mut t = Timeouts::new();

        let accepted = TimeoutKind::iter()
            .filter(|k| t.set(&mut timer, *k, 1_000))
            .count();
        assert_eq!(accepted, TIMEOUT_COUNT);

        t.reset(&mut timer);
        assert_eq!(timer.next(), None);
        assert!(TimeoutKind::iter().all(|k| !t.is_running(k)));
    }
}
