//! LPWAN Timer API
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use crate::Tick;

/// Alarm sources provided by the timer peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alarm {
    /// Wake-up alarm marking the start of the next cycle
    Cycle,
    /// Multiplexed protocol timeout, carrying the timeout pool index
    Timeout(u8),
}

impl Alarm {
    /// Check whether two alarms share the same underlying channel
    pub fn same_source(&self, other: &Alarm) -> bool {
        matches!(
            (self, other),
            (Alarm::Cycle, Alarm::Cycle) | (Alarm::Timeout(_), Alarm::Timeout(_))
        )
    }
}

/// Timer trait provides a wrapping microsecond counter and one-shot alarms
/// to assist with protocol implementations.
///
/// Each alarm source ([`Alarm::Cycle`] / [`Alarm::Timeout`]) has a single
/// underlying channel, arming an alarm replaces any pending alarm of the same
/// source. Expiry must be reported back to the MAC as
/// [`Event::Alarm`](crate::gomach::Event::Alarm) carrying the armed value.
pub trait Timer {
    /// Returns the current (wrapping) microsecond tick count
    fn ticks(&self) -> Tick;

    /// Arm an alarm for the provided absolute tick
    fn set_alarm(&mut self, alarm: Alarm, at: Tick);

    /// Disarm an alarm, clearing an alarm that is not armed has no effect
    fn clear_alarm(&mut self, alarm: Alarm);

    /// Power up the underlying counter
    fn power_on(&mut self) {}

    /// Power down the underlying counter
    fn power_off(&mut self) {}
}

#[cfg(any(test, feature="mocks"))]
pub mod mock {
    use std::sync::{Arc, Mutex};
    use std::vec::Vec;

    use super::Alarm;
    use crate::Tick;

    #[derive(Debug, Default)]
    struct Inner {
        now: Tick,
        alarms: Vec<(Alarm, Tick)>,
        powered: bool,
    }

    /// Mock timer implementation to assist with testing
    #[derive(Clone, Debug)]
    pub struct MockTimer (Arc<Mutex<Inner>>);

    impl MockTimer {
        pub fn new() -> Self {
            Self(Arc::new(Mutex::new(Inner::default())))
        }

        pub fn set(&mut self, val: Tick) {
            self.0.lock().unwrap().now = val;
        }

        pub fn inc(&mut self, us: u32) {
            let mut v = self.0.lock().unwrap();
            v.now = v.now.wrapping_add(us);
        }

        pub fn val(&self) -> Tick {
            self.0.lock().unwrap().now
        }

        pub fn powered(&self) -> bool {
            self.0.lock().unwrap().powered
        }

        /// Fetch the deadline of an armed alarm from the given source
        pub fn alarm(&self, alarm: Alarm) -> Option<(Alarm, Tick)> {
            let v = self.0.lock().unwrap();
            v.alarms.iter().find(|(a, _)| a.same_source(&alarm)).cloned()
        }

        /// Fetch the next alarm to fire (ordered by distance from now)
        pub fn next(&self) -> Option<(Alarm, Tick)> {
            let v = self.0.lock().unwrap();
            let now = v.now;
            v.alarms.iter().min_by_key(|(_, at)| at.wrapping_sub(now)).cloned()
        }

        /// Advance to and disarm the next alarm, returning it for delivery
        pub fn fire_next(&mut self) -> Option<Alarm> {
            let (alarm, at) = self.next()?;

            let mut v = self.0.lock().unwrap();
            v.alarms.retain(|(a, _)| !a.same_source(&alarm));
            v.now = at;

            Some(alarm)
        }
    }

    impl super::Timer for MockTimer {
        fn ticks(&self) -> Tick {
            self.0.lock().unwrap().now
        }

        fn set_alarm(&mut self, alarm: Alarm, at: Tick) {
            let mut v = self.0.lock().unwrap();
            v.alarms.retain(|(a, _)| !a.same_source(&alarm));
            v.alarms.push((alarm, at));
        }

        fn clear_alarm(&mut self, alarm: Alarm) {
            let mut v = self.0.lock().unwrap();
            v.alarms.retain(|(a, _)| *a != alarm);
        }

        fn power_on(&mut self) {
            self.0.lock().unwrap().powered = true;
        }

        fn power_off(&mut self) {
            self.0.lock().unwrap().powered = false;
        }
    }
}
