//! vTDMA slot scheduling
//!
//! Receivers collect the queue indicators reported in data frames and
//! allocate slots on their private sub-channel via a beacon, senders look
//! up their own allocation in received beacons.

use ieee802154::mac::ExtendedAddress;
use log::trace;

use super::config::SLOSCH_UNIT_COUNT;
use super::packet::Beacon;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Report {
    sender: ExtendedAddress,
    queue_indicator: u8,
}

/// Receive side queue depth reports, in order of registration
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SlotScheduler {
    reports: [Option<Report>; SLOSCH_UNIT_COUNT],
}

/// Slots granted to this node by a receiver's beacon
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SlotGrant {
    pub sub_channel: u8,
    pub slots: u8,
    /// Slots allocated to preceding senders
    pub position: u8,
}

impl SlotScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the number of frames a sender reports as still queued for us
    pub fn update(&mut self, sender: ExtendedAddress, queue_indicator: u8) {
        if let Some(r) = self.reports.iter_mut().flatten().find(|r| r.sender == sender) {
            r.queue_indicator = queue_indicator;
            return;
        }

        if queue_indicator == 0 {
            return;
        }

        // Units without outstanding frames are free for reuse
        let free = self.reports.iter_mut()
            .find(|r| r.map(|r| r.queue_indicator == 0).unwrap_or(true));

        match free {
            Some(r) => *r = Some(Report { sender, queue_indicator }),
            None => trace!("No slot scheduling unit for {:?}", sender),
        }
    }

    /// Check whether any sender has frames pending
    pub fn has_pending(&self) -> bool {
        self.reports.iter().flatten().any(|r| r.queue_indicator > 0)
    }

    /// Allocate slots to reporting senders in report order, bounded by the
    /// slots remaining in the cycle and the maximum number of senders.
    ///
    /// Every report is cleared once a beacon is built, including those of
    /// senders that were truncated or left out. A sender only receives slots
    /// in a later cycle after reporting its queue again in that cycle's CP.
    /// Returns `None` if no slots could be allocated.
    pub fn build_beacon(&mut self, max_slots: u32, max_senders: u8, sub_channel: u8) -> Option<Beacon> {
        let mut beacon = Beacon::new(sub_channel);
        let mut total = 0;

        for r in self.reports.iter().flatten().filter(|r| r.queue_indicator > 0) {
            if total >= max_slots || beacon.len() >= max_senders as usize {
                break;
            }

            // Truncate the last allocation to the remaining budget
            let n = (r.queue_indicator as u32).min(max_slots - total);
            if !beacon.push(r.sender, n as u8) {
                break;
            }
            total += n;
        }

        self.reports = Default::default();

        match beacon.is_empty() {
            true => None,
            false => Some(beacon),
        }
    }
}

/// Look up this node's allocation in a received beacon,
/// absence from the beacon means no slots
pub fn apply_beacon(beacon: &Beacon, own: ExtendedAddress) -> SlotGrant {
    let mut position = 0u8;

    for (sender, slots) in beacon.senders.iter().zip(beacon.slots.iter()) {
        if *sender == own {
            return SlotGrant { sub_channel: beacon.sub_channel, slots: *slots, position };
        }
        position = position.saturating_add(*slots);
    }

    SlotGrant { sub_channel: beacon.sub_channel, slots: 0, position: 0 }
}

#[cfg(test)]
mod test {
    use super::*;

    const A: ExtendedAddress = ExtendedAddress(0xa);
    const B: ExtendedAddress = ExtendedAddress(0xb);
    const C: ExtendedAddress = ExtendedAddress(0xc);

    #[test]
    fn allocation_bounded_by_remaining_slots() {
        let mut s = SlotScheduler::new();
        s.update(A, 5);
        s.update(B, 5);
        s.update(C, 5);

        let b = s.build_beacon(3, 11, 14).unwrap();

        assert_eq!(b.total_slots(), 3);
        assert_eq!(&b.senders[..], &[A]);
        assert_eq!(&b.slots[..], &[3]);

        // Reports are consumed
        assert!(!s.has_pending());
        assert_eq!(s.build_beacon(3, 11, 14), None);
    }

    #[test]
    fn allocation_in_report_order() {
        let mut s = SlotScheduler::new();
        s.update(A, 2);
        s.update(B, 0);
        s.update(C, 3);
        s.update(B, 4);

        let b = s.build_beacon(8, 11, 14).unwrap();
        assert_eq!(&b.senders[..], &[A, C, B]);
        assert_eq!(&b.slots[..], &[2, 3, 3]);
    }

    #[test]
    fn allocation_bounded_by_sender_count() {
        let mut s = SlotScheduler::new();
        s.update(A, 1);
        s.update(B, 1);
        s.update(C, 1);

        let b = s.build_beacon(10, 2, 14).unwrap();
        assert_eq!(&b.senders[..], &[A, B]);

        // Senders left out must report again
        assert!(!s.has_pending());
        s.update(C, 1);
        let b = s.build_beacon(10, 2, 14).unwrap();
        assert_eq!(&b.senders[..], &[C]);
    }

    #[test]
    fn nothing_to_allocate() {
        let mut s = SlotScheduler::new();
        assert_eq!(s.build_beacon(10, 11, 14), None);

        s.update(A, 4);
        assert!(s.has_pending());
        assert_eq!(s.build_beacon(0, 11, 14), None);
    }

    #[test]
    fn grant_position() {
        let mut b = Beacon::new(17);
        b.push(A, 2);
        b.push(B, 3);
        b.push(C, 1);

        assert_eq!(apply_beacon(&b, C), SlotGrant { sub_channel: 17, slots: 1, position: 5 });
        assert_eq!(apply_beacon(&b, A), SlotGrant { sub_channel: 17, slots: 2, position: 0 });
        assert_eq!(apply_beacon(&b, ExtendedAddress(0xd)).slots, 0);
    }
}
