//! Cycle phase arithmetic
//!
//! Phases are positions (in microseconds) within the repeating superframe.
//! All neighbor phase comparisons are modular over the cycle length.

use crate::Tick;

/// Modulus of the underlying tick counter
pub const COUNTER_MODULUS: u64 = 1 << 32;

/// Tracks the start of the current cycle and converts counter values to phases
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseClock {
    cycle_start: Tick,
    cycle_len: u32,
}

impl PhaseClock {
    pub fn new(cycle_len: u32) -> Self {
        Self { cycle_start: 0, cycle_len }
    }

    pub fn cycle_len(&self) -> u32 {
        self.cycle_len
    }

    pub fn cycle_start(&self) -> Tick {
        self.cycle_start
    }

    /// Start a new cycle at the provided counter value
    pub fn restart(&mut self, start: Tick) {
        self.cycle_start = start;
    }

    /// Counter value at which the current cycle ends
    pub fn next_cycle(&self) -> Tick {
        self.cycle_start.wrapping_add(self.cycle_len)
    }

    /// Position within the current cycle for the provided counter value
    pub fn phase_at(&self, now: Tick) -> u32 {
        let (now, start) = (now as u64, self.cycle_start as u64);

        let elapsed = if now >= start {
            now - start
        } else {
            now + COUNTER_MODULUS - start
        };

        match self.cycle_len {
            0 => 0,
            l => (elapsed % l as u64) as u32,
        }
    }

    /// Ticks from `now` until the next occurrence of `target` phase,
    /// a target at or before the current phase is a full cycle away
    pub fn ticks_until(&self, now: Tick, target: u32) -> u32 {
        let phase = self.phase_at(now);
        let target = wrap(target, self.cycle_len);

        if target <= phase {
            target + self.cycle_len - phase
        } else {
            target - phase
        }
    }
}

/// Reduce a phase to `[0, cycle_len)`
pub fn wrap(phase: u32, cycle_len: u32) -> u32 {
    match cycle_len {
        0 => 0,
        l => phase % l,
    }
}

/// Shift a phase by a signed offset modulo the cycle length
pub fn shift(phase: u32, offset: i64, cycle_len: u32) -> u32 {
    if cycle_len == 0 {
        return 0;
    }
    let l = cycle_len as i64;
    (((phase as i64 + offset) % l + l) % l) as u32
}

/// Derive a neighbor's phase relative to the own cycle from the phase it
/// reported (`remote`) at our current phase (`local`)
pub fn relative_phase(local: u32, remote: u32, cycle_len: u32) -> u32 {
    shift(local, -(remote as i64), cycle_len)
}

/// Check whether a phase lies within `gap` of the start (or end) of the cycle
pub fn near_cycle_edge(phase: u32, gap: u32, cycle_len: u32) -> bool {
    phase < gap || phase > cycle_len.saturating_sub(gap)
}

#[cfg(test)]
mod test {
    use super::*;

    const SF: u32 = 300_000;

    #[test]
    fn phase_survives_counter_wrap() {
        for &offset in &[0u32, 5, 6, 42, 299_999, 300_001, 1_234_567] {
            let mut plain = PhaseClock::new(SF);
            plain.restart(1_000);

            // Cycle starting just before the counter wraps
            let start = u32::MAX - 5;
            let mut wrapped = PhaseClock::new(SF);
            wrapped.restart(start);

            let expected = plain.phase_at(1_000 + offset);
            assert_eq!(expected, offset % SF);
            assert_eq!(wrapped.phase_at(start.wrapping_add(offset)), expected);
        }
    }

    #[test]
    fn phase_repeats_each_cycle() {
        let mut c = PhaseClock::new(SF);
        c.restart(1_000);
        assert_eq!(c.phase_at(1_000), 0);
        assert_eq!(c.phase_at(1_000 + SF + 25), 25);
        assert_eq!(c.next_cycle(), 1_000 + SF);
    }

    #[test]
    fn ticks_until_wraps_forward() {
        let mut c = PhaseClock::new(SF);
        c.restart(0);

        assert_eq!(c.ticks_until(100, 150), 50);
        assert_eq!(c.ticks_until(150, 100), SF - 50);
        assert_eq!(c.ticks_until(150, 150), SF);
    }

    #[test]
    fn relative_phase_from_ack() {
        assert_eq!(relative_phase(150, 100, SF), 50);
        assert_eq!(relative_phase(100, 150, SF), SF - 50);
        assert_eq!(shift(10, -20, SF), SF - 10);
        assert_eq!(shift(SF - 10, 20, SF), 10);
    }

    #[test]
    fn cycle_edges() {
        assert!(near_cycle_edge(1_000, 25_000, SF));
        assert!(near_cycle_edge(SF - 1_000, 25_000, SF));
        assert!(!near_cycle_edge(150_000, 25_000, SF));
    }
}
