//! Per-state processing of received frames

use core::fmt::Debug;

use ieee802154::mac::ExtendedAddress;
use log::{debug, trace};
use radio::RadioState;
use rand_core::RngCore;

use crate::base::BaseState;
use crate::error::CoreError;
use crate::timer::Timer;
use crate::{Radio, RxInfo};

use super::neighbor::MacType;
use super::packet::{FrameContent, Packet};
use super::phase;
use super::slots::apply_beacon;
use super::timeout::TimeoutKind;
use super::{Flags, Mac};

impl <'q, R, S, E, T, G> Mac<'q, R, S, E, T, G>
where
    R: Radio<S, E>,
    S: RadioState,
    E: Debug,
    T: Timer,
    G: RngCore,
{
    /// Frames received in the contention period
    pub(crate) fn process_cp(&mut self) -> Result<(), CoreError<E>> {
        while let Some((info, p)) = self.rx_queue.pop_front() {
            match &p.content {
                FrameContent::Preamble{ dst } if *dst == self.address => {
                    self.flags.insert(Flags::GOT_PREAMBLE);

                    // Only answer when the radio is free, a frame being received
                    // would be corrupted by the ack
                    if self.base.state() == BaseState::Idle && !self.base.is_receiving()? {
                        if let Some(src) = p.source() {
                            self.send_preamble_ack(src)?;
                        }
                    }
                },
                FrameContent::Preamble{ .. } => {
                    trace!("Preamble for another node");
                    self.flags.insert(Flags::UNINTD_PREAMBLE);
                },
                FrameContent::Data{ .. } => {
                    if p.is_for(self.address) {
                        self.receive_frame(info, p);
                    }
                },
                FrameContent::Broadcast{ .. } => {
                    self.flags.insert(Flags::QUIT_CYCLE);
                    self.receive_frame(info, p);
                },
                _ => trace!("Ignoring {:?} in CP", p.kind()),
            }
        }

        Ok(())
    }

    /// Frames received while waiting for a preamble-ack (t2u)
    pub(crate) fn process_preamble_ack_wait(&mut self) {
        let target = self.current_neighbor().map(|n| n.addr);

        while let Some((info, p)) = self.rx_queue.pop_front() {
            match &p.content {
                // Another ongoing preamble flood, give way
                FrameContent::Preamble{ .. } => {
                    self.flags.insert(Flags::QUIT_CYCLE);
                },
                FrameContent::PreambleAck{ dst, phase } if *dst == self.address && p.source() == target => {
                    self.flags.insert(Flags::GOT_PREAMBLE_ACK);
                    self.process_preamble_ack(*phase);
                    self.rx_queue.clear();
                    break;
                },
                FrameContent::Data{ .. } => {
                    if p.is_for(self.address) {
                        self.receive_frame(info, p);
                    }
                },
                FrameContent::Broadcast{ .. } => {
                    self.flags.insert(Flags::QUIT_CYCLE);
                    self.receive_frame(info, p);
                },
                _ => (),
            }
        }
    }

    /// Lock onto the phase reported in a preamble-ack
    pub(crate) fn process_preamble_ack(&mut self, remote_phase: u32) {
        let local = self.phase_now();
        let cycle_len = self.clock.cycle_len();
        let gap = self.config.cp_min_gap;

        let cp_phase = phase::relative_phase(local, remote_phase, cycle_len);

        // CPs too close to the own cycle edge are moved away from at the end of the cycle
        if phase::near_cycle_edge(cp_phase, gap, cycle_len) {
            let span = cycle_len.saturating_sub(2 * gap);
            self.backoff_phase = gap + self.random(span.saturating_add(1));
            self.flags.insert(Flags::PHASE_BACKOFF);
            debug!("Neighbor phase {} close to cycle edge, backoff {} us", cp_phase, self.backoff_phase);
        }

        // The flood may have crossed into a new cycle, in which case a CP later
        // in the cycle uses the other public channel
        let current = match self.flags.contains(Flags::ON_PUB_CHANNEL_1) {
            true => self.channels.pub_1,
            false => self.channels.pub_2,
        };
        let pub_chan = match self.flags.contains(Flags::ENTER_NEW_CYCLE) && cp_phase > local {
            true => self.channels.other(current),
            false => current,
        };

        if let Some(n) = self.current_neighbor_mut() {
            n.mac_type = MacType::PhaseKnown;
            n.no_ack = 0;
            n.cp_phase = cp_phase;
            n.pub_chan = pub_chan;
            debug!("Locked phase of {:?}: {} us, channel {}", n.addr, cp_phase, pub_chan);
        }
    }

    /// Frames received while waiting for the receiver's beacon (t2k)
    pub(crate) fn process_beacon_wait(&mut self) {
        let target = self.current_neighbor().map(|n| n.addr);

        while let Some((info, p)) = self.rx_queue.pop_front() {
            match &p.content {
                FrameContent::Beacon(b) if p.source() == target => {
                    self.clear_timeout(TimeoutKind::WaitBeacon);
                    self.tx.grant = apply_beacon(b, self.address);
                    debug!("Beacon grants {:?}", self.tx.grant);
                },
                FrameContent::Preamble{ .. } => {
                    self.flags.insert(Flags::QUIT_CYCLE);
                },
                FrameContent::Data{ .. } => {
                    if p.is_for(self.address) {
                        self.receive_frame(info, p);
                    }
                },
                FrameContent::Broadcast{ .. } => {
                    self.flags.insert(Flags::QUIT_CYCLE);
                    self.receive_frame(info, p);
                },
                _ => (),
            }
        }
    }

    /// Frames received in the own vTDMA period
    pub(crate) fn process_vtdma(&mut self) {
        while let Some((info, p)) = self.rx_queue.pop_front() {
            match &p.content {
                FrameContent::Data{ .. } if p.is_for(self.address) => self.receive_frame(info, p),
                _ => trace!("Ignoring {:?} in vTDMA", p.kind()),
            }
        }
    }

    /// Sub-channel announcements received during initialisation
    pub(crate) fn process_announcements(&mut self) {
        while let Some((_info, p)) = self.rx_queue.pop_front() {
            if let FrameContent::Announce{ sub_channel } = p.content {
                debug!("Sub-channel {} in use by {:?}", sub_channel, p.source());
                self.channels.mark_occupied(sub_channel);
            }
        }
    }

    fn send_preamble_ack(&mut self, dst: ExtendedAddress) -> Result<(), CoreError<E>> {
        let phase = self.phase_now();
        let seq = self.next_seq();
        let ack = Packet::preamble_ack(self.config.pan_id, self.own_addr(), seq, dst, phase);

        self.base.set_autoack(false)?;
        if let Err(e) = self.send(&ack, false) {
            debug!("Failed to send preamble-ack: {:?}", e);
        }
        self.base.set_autoack(true)
    }

    /// Record the sender's queue indicator and deliver unless duplicated,
    /// broadcast repeats share the sequence number of the original frame
    fn receive_frame(&mut self, info: RxInfo, p: Packet) {
        let src = match p.source() {
            Some(s) => s,
            None => return,
        };

        if let FrameContent::Data{ queue_indicator } = p.content {
            self.slosch.update(src, queue_indicator);
        }

        if self.dupchk.is_duplicate(src, p.header.seq) {
            debug!("Duplicate frame {} from {:?}", p.header.seq, src);
            self.stats.duplicates = self.stats.duplicates.saturating_add(1);
            return;
        }

        self.deliver(info, p);
    }
}

#[cfg(test)]
mod test {
    use ieee802154::mac::Address;

    use crate::Mac as _;
    use super::super::test::*;
    use super::super::*;

    #[test]
    fn preamble_answered_with_phase() {
        let mut q = EventQueue::new();
        let mut h = Harness::new(&mut q);
        h.cold_start();

        let pan = h.mac.config.pan_id;
        h.timer.inc(1_234);
        let phase = h.mac.phase_now();

        let p = Packet::preamble(pan, h.peer_addr(), 3, OWN);
        h.receive(&p);

        let sent = h.sent();
        assert_eq!(sent.len(), 1);
        let (ack, info) = &sent[0];
        assert!(!info.csma);
        assert_eq!(ack.content, packet::FrameContent::PreambleAck{ dst: PEER, phase });
        assert_eq!(ack.header.source, Address::Extended(pan, OWN));

        // Autoack restored and the CP extended
        assert!(h.radio.autoack());
        assert_eq!(h.mac.state(), MacState::Listen(ListenState::CpListen));
    }

    #[test]
    fn foreign_preamble_not_answered() {
        let mut q = EventQueue::new();
        let mut h = Harness::new(&mut q);
        h.cold_start();

        let p = Packet::preamble(h.mac.config.pan_id, h.peer_addr(), 3, ExtendedAddress(0x99));
        h.receive(&p);

        assert!(h.sent().is_empty());
        assert!(h.mac.flags.contains(Flags::UNINTD_PREAMBLE));
    }

    #[test]
    fn duplicates_suppressed() {
        let mut q = EventQueue::new();
        let mut h = Harness::new(&mut q);
        h.cold_start();

        let a = h.data_from(PEER, 5, &[1]);
        h.receive(&a);
        h.receive(&a);
        h.receive(&h.data_from(PEER, 6, &[2]));

        let mut buff = [0u8; 8];
        let mut rx = std::vec::Vec::new();
        while let Some((n, _)) = h.mac.receive(&mut buff).unwrap() {
            rx.push(buff[..n].to_vec());
        }

        assert_eq!(rx.len(), 2);
        assert_eq!(rx[0], &[1u8]);
        assert_eq!(rx[1], &[2u8]);
        assert_eq!(h.mac.stats().duplicates, 1);
    }

    #[test]
    fn frames_for_others_ignored() {
        let mut q = EventQueue::new();
        let mut h = Harness::new(&mut q);
        h.cold_start();

        let pan = h.mac.config.pan_id;
        let p = Packet::data(Address::Extended(pan, ExtendedAddress(0x99)), h.peer_addr(), 1, &[1]).unwrap();
        h.receive(&p);

        let mut buff = [0u8; 8];
        assert_eq!(h.mac.receive(&mut buff), Ok(None));
    }

    #[test]
    fn queue_indicator_triggers_beacon() {
        let mut q = EventQueue::new();
        let mut h = Harness::new(&mut q);
        h.cold_start();

        let mut p = h.data_from(PEER, 1, &[1]);
        p.set_queue_indicator(3);
        h.receive(&p);

        // CP end, beacon on the public channel allocating the reported slots
        h.fire_until(|m| m.state() == MacState::Listen(ListenState::WaitBeaconTx));
        let sent = h.sent();
        assert_eq!(sent.len(), 1);
        match &sent[0].0.content {
            packet::FrameContent::Beacon(b) => {
                assert_eq!(&b.senders[..], &[PEER]);
                assert_eq!(&b.slots[..], &[3]);
                assert_eq!(b.sub_channel, h.mac.channels.sub_channel);
            },
            c => panic!("Unexpected frame {:?}", c),
        }

        // Listen on the sub-channel for the allocated slots
        h.tx_done(TxFeedback::Success);
        assert_eq!(h.mac.state(), MacState::Listen(ListenState::Vtdma));
        assert_eq!(h.radio.channel(), h.mac.channels.sub_channel);
        assert_eq!(h.mac.rx_slots, 3);

        h.receive(&h.data_from(PEER, 2, &[2]));

        h.fire_until(|m| m.state() == MacState::Listen(ListenState::Sleep));
        assert_eq!(h.mac.stats().beacon_tx, 1);

        let mut buff = [0u8; 8];
        assert!(h.mac.receive(&mut buff).unwrap().is_some());
        assert!(h.mac.receive(&mut buff).unwrap().is_some());
    }
}
