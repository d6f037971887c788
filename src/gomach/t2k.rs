//! Transmission to a neighbor with a known phase (t2k)
//!
//! The first frame is sent with CSMA into the neighbor's CP, further
//! queued frames are sent in the vTDMA slots granted by the neighbor's
//! beacon on its sub-channel.

use core::fmt::Debug;

use log::{debug, trace, warn};
use radio::RadioState;
use rand_core::RngCore;

use crate::error::CoreError;
use crate::timer::Timer;
use crate::Radio;

use super::event::TxFeedback;
use super::neighbor::MacType;
use super::phase;
use super::slots::SlotGrant;
use super::timeout::TimeoutKind;
use super::{Flags, Mac, MacState, Step, TxState};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum T2kState {
    Init,
    WaitCp,
    TransInCp,
    WaitCpTxFeedback,
    WaitBeacon,
    WaitSlots,
    VtdmaTrans,
    WaitVtdmaFeedback,
    End,
}

/// Phase correction applied for a neighbor after repeated missing acks,
/// trying an earlier then a later CP before the phase is invalidated
fn phase_correction(no_ack: u8, threshold: u8, cp_duration: u32) -> i64 {
    match no_ack {
        0 => 0,
        n if n == threshold.saturating_sub(2) => -(cp_duration as i64),
        n if n == threshold.saturating_sub(1) => cp_duration as i64,
        _ => 0,
    }
}

impl <'q, R, S, E, T, G> Mac<'q, R, S, E, T, G>
where
    R: Radio<S, E>,
    S: RadioState,
    E: Debug,
    T: Timer,
    G: RngCore,
{
    fn set_t2k(&mut self, state: T2kState) {
        trace!("t2k state {:?}", state);
        self.state = MacState::Transmit(TxState::T2k(state));
    }

    pub(crate) fn t2k_update(&mut self, state: T2kState) -> Result<Step, CoreError<E>> {
        use T2kState::*;

        match state {
            Init => self.t2k_init(),
            WaitCp => {
                if !self.timeouts.is_expired(TimeoutKind::WaitCp) {
                    return Ok(Step::WaitForEvent);
                }

                let now = self.now();
                let channel = self.current_neighbor().map(|n| n.pub_chan).unwrap_or(self.channels.current);

                self.base.idle(now)?;
                self.base.set_channel(channel)?;
                self.base.set_autoack(false)?;
                self.base.set_ack_request(true)?;

                self.set_t2k(TransInCp);
                Ok(Step::Continue)
            },
            TransInCp => {
                match self.send_data(true) {
                    Ok(()) => {
                        self.set_timeout(TimeoutKind::NoTxIsr, self.config.no_tx_isr);
                        self.set_t2k(WaitCpTxFeedback);
                        Ok(Step::WaitForEvent)
                    },
                    Err(e) => {
                        warn!("t2k transmission failed: {:?}", e);
                        self.drop_packet();
                        self.set_t2k(End);
                        Ok(Step::Continue)
                    },
                }
            },
            WaitCpTxFeedback => self.t2k_cp_feedback(),
            WaitBeacon => self.t2k_wait_beacon(),
            WaitSlots => {
                if !self.timeouts.is_expired(TimeoutKind::WaitSlots) {
                    return Ok(Step::WaitForEvent);
                }

                let now = self.now();
                self.base.idle(now)?;

                match self.load_next_packet() {
                    true => self.set_t2k(VtdmaTrans),
                    false => self.set_t2k(End),
                }
                Ok(Step::Continue)
            },
            VtdmaTrans => {
                match self.send_data(false) {
                    Ok(()) => {
                        self.tx.grant.slots = self.tx.grant.slots.saturating_sub(1);
                        self.set_timeout(TimeoutKind::NoTxIsr, self.config.no_tx_isr);
                        self.set_t2k(WaitVtdmaFeedback);
                        Ok(Step::WaitForEvent)
                    },
                    Err(e) => {
                        warn!("vTDMA transmission failed: {:?}", e);
                        self.drop_packet();
                        self.set_t2k(End);
                        Ok(Step::Continue)
                    },
                }
            },
            WaitVtdmaFeedback => self.t2k_vtdma_feedback(),
            End => self.t2k_end(),
        }
    }

    fn t2k_init(&mut self) -> Result<Step, CoreError<E>> {
        let now = self.now();

        self.base.sleep(now)?;
        self.flags.remove(Flags::QUIT_CYCLE);
        self.rx_queue.clear();
        self.tx.busy_count = 0;

        let (cp_phase, no_ack) = match self.current_neighbor() {
            Some(n) => (n.cp_phase, n.no_ack),
            None => {
                warn!("t2k without a current neighbor");
                self.set_t2k(T2kState::End);
                return Ok(Step::Continue);
            }
        };

        let mut wait = self.clock.ticks_until(now, cp_phase);

        let correction = phase_correction(no_ack, self.config.rephaselock_threshold, self.config.cp_duration);
        if correction != 0 {
            debug!("Retrying with phase correction of {} us", correction);
            wait = phase::shift(wait, correction, self.clock.cycle_len());
        }

        trace!("Waiting {} us for neighbor CP at phase {}", wait, cp_phase);

        self.set_timeout(TimeoutKind::WaitCp, wait);
        self.set_t2k(T2kState::WaitCp);

        Ok(Step::WaitForEvent)
    }

    fn t2k_cp_feedback(&mut self) -> Result<Step, CoreError<E>> {
        if self.timeouts.is_expired(TimeoutKind::NoTxIsr) {
            warn!("Missing transmission complete in t2k");
            if let Some(n) = self.current_neighbor_mut() {
                n.no_ack = n.no_ack.saturating_add(1);
            }
            self.tx.persistent_fail = self.tx.persistent_fail.saturating_add(1);
            self.set_t2k(T2kState::End);
            return Ok(Step::Continue);
        }

        if !self.flags.contains(Flags::TX_FINISHED) {
            return Ok(Step::WaitForEvent);
        }

        self.clear_timeout(TimeoutKind::NoTxIsr);

        match self.tx.feedback {
            Some(TxFeedback::Success) => self.t2k_cp_success(),
            Some(TxFeedback::Busy) if self.tx.busy_count < self.config.tx_busy_threshold => {
                // Channel busy, likely another sender in the same CP, retry immediately
                self.tx.busy_count += 1;
                self.set_t2k(T2kState::TransInCp);
            },
            _ => self.t2k_cp_failed(),
        }

        Ok(Step::Continue)
    }

    /// Confirmed delivery into the neighbor's CP, continues with a vTDMA
    /// burst when further frames are queued
    pub(crate) fn t2k_cp_success(&mut self) {
        self.release_packet(true);
        self.tx.persistent_fail = 0;

        let threshold = self.config.rephaselock_threshold;
        let cp = self.config.cp_duration as i64;
        let margin = self.config.phase_correction_margin as i64;
        let cycle_len = self.clock.cycle_len();

        let mut queued = 0;
        if let Some(n) = self.current_neighbor_mut() {
            // Persist the correction that reached the neighbor
            let correction = match phase_correction(n.no_ack, threshold, cp as u32) {
                c if c > 0 => c + margin,
                c => c,
            };
            if correction != 0 {
                n.cp_phase = phase::shift(n.cp_phase, correction, cycle_len);
                debug!("Corrected phase of {:?} to {}", n.addr, n.cp_phase);
            }

            n.no_ack = 0;
            queued = n.queue.len();
        }

        if queued == 0 {
            self.set_t2k(T2kState::End);
            return;
        }

        // Further frames pending, wait for the receiver's slot allocation
        self.tx.grant = SlotGrant::default();
        self.rx_queue.clear();
        self.flags.remove(Flags::PKT_RECEIVED);
        self.set_timeout(TimeoutKind::WaitBeacon, self.config.wait_beacon);
        self.set_t2k(T2kState::WaitBeacon);
    }

    fn t2k_cp_failed(&mut self) {
        let threshold = self.config.rephaselock_threshold;
        self.stats.no_ack = self.stats.no_ack.saturating_add(1);

        let mut relock = false;
        if let Some(n) = self.current_neighbor_mut() {
            n.no_ack = n.no_ack.saturating_add(1);
            debug!("No ack from {:?} ({} consecutive)", n.addr, n.no_ack);

            if n.no_ack >= threshold {
                n.mac_type = MacType::PhaseUnknown;
                n.t2u_retry = 0;
                relock = true;
            }
        }

        if relock {
            debug!("Phase lock lost, re-discovering");
            self.stats.relock = self.stats.relock.saturating_add(1);
        }

        self.set_t2k(T2kState::End);
    }

    fn t2k_wait_beacon(&mut self) -> Result<Step, CoreError<E>> {
        if self.flags.contains(Flags::PKT_RECEIVED) {
            self.flags.remove(Flags::PKT_RECEIVED);
            self.process_beacon_wait();
        }

        if self.flags.contains(Flags::QUIT_CYCLE) {
            self.clear_timeout(TimeoutKind::WaitBeacon);
            self.set_t2k(T2kState::End);
            return Ok(Step::Continue);
        }

        let grant = self.tx.grant;
        if grant.slots > 0 {
            self.clear_timeout(TimeoutKind::WaitBeacon);
            self.base.set_channel(grant.sub_channel)?;

            if grant.position > 0 {
                // Sleep through the slots of preceding senders
                let now = self.now();
                self.base.sleep(now)?;
                self.set_timeout(TimeoutKind::WaitSlots, grant.position as u32 * self.config.vtdma_slot_duration);
                self.set_t2k(T2kState::WaitSlots);
                return Ok(Step::WaitForEvent);
            }

            match self.load_next_packet() {
                true => self.set_t2k(T2kState::VtdmaTrans),
                false => self.set_t2k(T2kState::End),
            }
            return Ok(Step::Continue);
        }

        // Expired, or a beacon without an allocation for us
        if self.timeouts.is_expired(TimeoutKind::WaitBeacon) || !self.timeouts.is_running(TimeoutKind::WaitBeacon) {
            trace!("No vTDMA slots granted");
            self.rx_queue.clear();
            self.set_t2k(T2kState::End);
            return Ok(Step::Continue);
        }

        Ok(Step::WaitForEvent)
    }

    fn t2k_vtdma_feedback(&mut self) -> Result<Step, CoreError<E>> {
        if self.timeouts.is_expired(TimeoutKind::NoTxIsr) {
            warn!("Missing transmission complete in vTDMA");
            if let Some(n) = self.current_neighbor_mut() {
                n.no_ack = n.no_ack.saturating_add(1);
            }
            self.tx.persistent_fail = self.tx.persistent_fail.saturating_add(1);
            self.set_t2k(T2kState::End);
            return Ok(Step::Continue);
        }

        if !self.flags.contains(Flags::TX_FINISHED) {
            return Ok(Step::WaitForEvent);
        }

        self.clear_timeout(TimeoutKind::NoTxIsr);

        if self.tx.feedback == Some(TxFeedback::Success) {
            self.release_packet(true);
            self.tx.persistent_fail = 0;
            if let Some(n) = self.current_neighbor_mut() {
                n.no_ack = 0;
            }

            match self.tx.grant.slots > 0 && self.load_next_packet() {
                true => self.set_t2k(T2kState::VtdmaTrans),
                false => self.set_t2k(T2kState::End),
            }
            return Ok(Step::Continue);
        }

        // A single failure is retried in place, a second ends the burst
        let retry = match self.current_neighbor_mut() {
            Some(n) if n.no_ack == 0 => {
                n.no_ack = 1;
                true
            },
            _ => false,
        };

        match retry && self.tx.grant.slots > 0 {
            true => self.set_t2k(T2kState::VtdmaTrans),
            false => self.set_t2k(T2kState::End),
        }

        Ok(Step::Continue)
    }

    fn t2k_end(&mut self) -> Result<Step, CoreError<E>> {
        let now = self.now();
        self.base.sleep(now)?;

        // Frames are retained for retry while acks are outstanding
        let retain = self.current_neighbor().map(|n| n.no_ack > 0).unwrap_or(false);
        if !retain {
            if self.tx.packet.is_some() {
                self.release_packet(false);
            }
            self.neighbors.set_current(None);
        }

        self.clear_timeouts(&[TimeoutKind::WaitCp, TimeoutKind::WaitBeacon, TimeoutKind::WaitSlots, TimeoutKind::NoTxIsr]);
        self.end_transmission();

        Ok(Step::Continue)
    }
}

#[cfg(test)]
mod test {
    use crate::mock::MockState;
    use crate::Mac as _;
    use super::super::test::*;
    use super::super::*;
    use super::*;

    /// Queue frames for a neighbor with a locked phase
    fn known_peer(h: &mut Harness, frames: u8, cp_phase: u32) {
        for i in 0..frames {
            h.mac.transmit(h.peer_addr(), &[i]).unwrap();
        }

        let id = h.mac.neighbors.find(PEER).unwrap();
        let n = h.mac.neighbors.get_mut(id).unwrap();
        n.mac_type = MacType::PhaseKnown;
        n.cp_phase = cp_phase;
    }

    #[test]
    fn correction_schedule() {
        assert_eq!(phase_correction(0, 4, 10), 0);
        assert_eq!(phase_correction(1, 4, 10), 0);
        assert_eq!(phase_correction(2, 4, 10), -10);
        assert_eq!(phase_correction(3, 4, 10), 10);
    }

    #[test]
    fn burst_delivery() {
        let mut q = EventQueue::new();
        let mut h = Harness::new(&mut q);
        h.cold_start();

        known_peer(&mut h, 5, 100_000);
        let start = h.mac.clock.cycle_start();

        // After the own CP, wait for the neighbor's CP
        h.fire_until(|m| m.state() == MacState::Transmit(TxState::T2k(T2kState::WaitCp)));
        assert_eq!(h.radio.state(), MockState::Sleep);

        h.fire();
        assert_eq!(h.timer.val(), start + 100_000);
        assert_eq!(h.mac.state(), MacState::Transmit(TxState::T2k(T2kState::WaitCpTxFeedback)));

        let sent = h.sent();
        assert_eq!(sent.len(), 1);
        let (p, info) = &sent[0];
        assert!(info.csma && info.ack_request);
        assert_eq!(p.content, packet::FrameContent::Data{ queue_indicator: 4 });
        assert!(p.header.frame_pending);
        assert_eq!(info.channel, h.mac.neighbor(PEER).unwrap().pub_chan);

        h.tx_done(TxFeedback::Success);
        assert_eq!(h.mac.state(), MacState::Transmit(TxState::T2k(T2kState::WaitBeacon)));

        // Neighbor allocates all remaining frames at the start of its vTDMA period
        let pan = h.mac.config.pan_id;
        let mut b = packet::Beacon::new(17);
        b.push(PEER, 0);
        b.push(OWN, 4);
        h.receive(&Packet::beacon(pan, h.peer_addr(), 1, b));

        // Zero slot entries do not delay the burst
        assert_eq!(h.mac.state(), MacState::Transmit(TxState::T2k(T2kState::WaitVtdmaFeedback)));

        for i in 1..5u8 {
            let sent = h.sent();
            assert_eq!(sent.len(), 1);
            let (p, info) = &sent[0];
            assert_eq!(info.channel, 17);
            assert!(!info.csma);
            assert_eq!(p.payload(), &[i]);
            assert_eq!(p.content, packet::FrameContent::Data{ queue_indicator: 4 - i });

            h.tx_done(TxFeedback::Success);
        }

        assert_eq!(h.mac.state(), MacState::Listen(ListenState::Sleep));
        assert_eq!(h.radio.state(), MockState::Sleep);
        assert_eq!(h.mac.neighbors.current(), None);
        assert!(h.mac.neighbor(PEER).unwrap().queue.is_empty());

        let mut delivered = 0;
        while let Some(o) = h.mac.tx_outcome() {
            assert!(matches!(o, TxOutcome::Delivered{ .. }));
            delivered += 1;
        }
        assert_eq!(delivered, 5);
    }

    #[test]
    fn waits_for_granted_slot() {
        let mut q = EventQueue::new();
        let mut h = Harness::new(&mut q);
        h.cold_start();

        known_peer(&mut h, 2, 100_000);
        h.fire_until(|m| m.state() == MacState::Transmit(TxState::T2k(T2kState::WaitCpTxFeedback)));
        h.sent();
        h.tx_done(TxFeedback::Success);

        let pan = h.mac.config.pan_id;
        let mut b = packet::Beacon::new(20);
        b.push(ExtendedAddress(0x99), 3);
        b.push(OWN, 1);
        h.receive(&Packet::beacon(pan, h.peer_addr(), 1, b));

        assert_eq!(h.mac.state(), MacState::Transmit(TxState::T2k(T2kState::WaitSlots)));
        assert_eq!(h.radio.state(), MockState::Sleep);

        let now = h.timer.val();
        h.fire();
        assert_eq!(h.timer.val(), now + 3 * h.mac.config.vtdma_slot_duration);

        let sent = h.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1.channel, 20);
    }

    #[test]
    fn beacon_timeout_ends_burst() {
        let mut q = EventQueue::new();
        let mut h = Harness::new(&mut q);
        h.cold_start();

        known_peer(&mut h, 2, 100_000);
        h.fire_until(|m| m.state() == MacState::Transmit(TxState::T2k(T2kState::WaitCpTxFeedback)));
        h.sent();

        h.tx_done(TxFeedback::Success);
        assert_eq!(h.mac.state(), MacState::Transmit(TxState::T2k(T2kState::WaitBeacon)));
        assert!(matches!(h.mac.tx_outcome(), Some(TxOutcome::Delivered{ .. })));
        let waiting = h.timer.val();

        // No beacon arrives within the wait period
        assert!(matches!(h.fire(), Alarm::Timeout(_)));
        assert_eq!(h.mac.state(), MacState::Listen(ListenState::Sleep));
        assert_eq!(h.timer.val() - waiting, h.mac.config.wait_beacon);
        assert!(h.sent().is_empty());

        // Remaining frame kept for the next cycle
        assert_eq!(h.mac.neighbor(PEER).unwrap().queue.len(), 1);
        assert_eq!(h.mac.neighbors.current(), None);
    }

    #[test]
    fn busy_channel_retried() {
        let mut q = EventQueue::new();
        let mut h = Harness::new(&mut q);
        h.cold_start();

        known_peer(&mut h, 1, 100_000);
        h.fire_until(|m| m.state() == MacState::Transmit(TxState::T2k(T2kState::WaitCpTxFeedback)));
        h.sent();

        h.tx_done(TxFeedback::Busy);
        assert_eq!(h.sent().len(), 1);
        assert_eq!(h.mac.state(), MacState::Transmit(TxState::T2k(T2kState::WaitCpTxFeedback)));

        h.tx_done(TxFeedback::Success);
        assert_eq!(h.mac.state(), MacState::Listen(ListenState::Sleep));
        assert!(matches!(h.mac.tx_outcome(), Some(TxOutcome::Delivered{ .. })));
    }

    #[test]
    fn repeated_missing_acks_relock() {
        let mut q = EventQueue::new();
        let mut h = Harness::new(&mut q);
        h.cold_start();

        known_peer(&mut h, 1, 100_000);

        let threshold = h.mac.config.rephaselock_threshold;
        let cp = h.mac.config.cp_duration;
        let expected = [100_000, 100_000, 100_000 - cp, 100_000 + cp];

        for i in 0..threshold {
            h.fire_until(|m| m.state() == MacState::Transmit(TxState::T2k(T2kState::WaitCpTxFeedback)));
            let phase = h.mac.phase_now();
            assert_eq!(phase, expected[i as usize]);

            h.sent();
            h.tx_done(TxFeedback::NoAck);
            assert_eq!(h.mac.state(), MacState::Listen(ListenState::Sleep));

            // Frame retained for retry
            assert!(h.mac.tx.packet.is_some());
        }

        let n = h.mac.neighbor(PEER).unwrap();
        assert_eq!(n.mac_type, MacType::PhaseUnknown);
        assert_eq!(h.mac.stats().relock, 1);

        // Next attempt re-discovers the phase
        h.fire_until(|m| matches!(m.state(), MacState::Transmit(TxState::T2u(_))));
    }

    #[test]
    fn late_correction_persisted() {
        let mut q = EventQueue::new();
        let mut h = Harness::new(&mut q);
        h.cold_start();

        known_peer(&mut h, 1, 100_000);
        let id = h.mac.neighbors.find(PEER).unwrap();
        h.mac.neighbors.get_mut(id).unwrap().no_ack = 3;
        h.mac.neighbors.set_current(Some(id));

        h.fire_until(|m| m.state() == MacState::Transmit(TxState::T2k(T2kState::WaitCpTxFeedback)));
        h.sent();
        h.tx_done(TxFeedback::Success);

        let cfg = h.mac.config.clone();
        let n = h.mac.neighbor(PEER).unwrap();
        assert_eq!(n.cp_phase, 100_000 + cfg.cp_duration + cfg.phase_correction_margin);
        assert_eq!(n.no_ack, 0);
    }
}
