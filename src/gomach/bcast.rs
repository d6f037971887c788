//! Broadcast transmission
//!
//! Broadcast frames are repeated alternately on both public channels for
//! slightly longer than a superframe so every neighbor's CP is covered.

use core::fmt::Debug;

use log::{debug, trace, warn};
use radio::RadioState;
use rand_core::RngCore;

use crate::error::CoreError;
use crate::timer::Timer;
use crate::Radio;

use super::neighbor::BROADCAST_ID;
use super::timeout::TimeoutKind;
use super::{Flags, Mac, MacState, Step, TxState};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BcastState {
    Init,
    Send,
    WaitTxFinish,
    WaitNextTx,
    End,
}

impl <'q, R, S, E, T, G> Mac<'q, R, S, E, T, G>
where
    R: Radio<S, E>,
    S: RadioState,
    E: Debug,
    T: Timer,
    G: RngCore,
{
    fn set_bcast(&mut self, state: BcastState) {
        trace!("Broadcast state {:?}", state);
        self.state = MacState::Transmit(TxState::Bcast(state));
    }

    pub(crate) fn bcast_update(&mut self, state: BcastState) -> Result<Step, CoreError<E>> {
        use BcastState::*;

        match state {
            Init => {
                let now = self.now();
                self.base.idle(now)?;
                self.base.set_autoack(false)?;
                self.base.set_ack_request(false)?;
                self.base.set_channel(self.channels.pub_1)?;
                self.flags.insert(Flags::ON_PUB_CHANNEL_1);

                // Repeats share a single broadcast sequence number
                self.tx.bcast_seq = self.tx.bcast_seq.wrapping_add(1);
                let seq = self.tx.bcast_seq;
                if let Some(p) = self.tx.packet.as_mut() {
                    p.set_broadcast(seq);
                }

                self.rx_queue.clear();
                self.set_timeout(TimeoutKind::BcastFinish, self.config.bcast_duration);

                self.set_bcast(Send);
                Ok(Step::Continue)
            },
            Send => {
                if self.bcast_abort_on_rx()? {
                    return Ok(Step::Continue);
                }

                let now = self.now();
                self.flags.remove(Flags::TX_FINISHED);
                self.tx.feedback = None;

                let res = match self.tx.packet.as_ref() {
                    Some(p) => self.base.transmit(now, p, false),
                    None => Err(CoreError::NoPacket),
                };

                match res {
                    Ok(()) => {
                        self.set_bcast(WaitTxFinish);
                        Ok(Step::WaitForEvent)
                    },
                    Err(e) => {
                        warn!("Broadcast transmission failed: {:?}", e);
                        self.release_packet(false);
                        self.set_bcast(End);
                        Ok(Step::Continue)
                    },
                }
            },
            WaitTxFinish => {
                if self.flags.contains(Flags::TX_FINISHED) {
                    self.flags.remove(Flags::TX_FINISHED);
                    self.set_timeout(TimeoutKind::BcastInterval, self.config.bcast_interval);
                    self.set_bcast(WaitNextTx);
                    return Ok(Step::WaitForEvent);
                }

                if self.timeouts.is_expired(TimeoutKind::BcastFinish) {
                    self.set_bcast(End);
                    return Ok(Step::Continue);
                }

                Ok(Step::WaitForEvent)
            },
            WaitNextTx => {
                if self.bcast_abort_on_rx()? {
                    return Ok(Step::Continue);
                }

                if self.timeouts.is_expired(TimeoutKind::BcastFinish) {
                    self.set_bcast(End);
                    return Ok(Step::Continue);
                }

                if self.timeouts.is_expired(TimeoutKind::BcastInterval) {
                    let channel = match self.flags.contains(Flags::ON_PUB_CHANNEL_1) {
                        true => self.channels.pub_2,
                        false => self.channels.pub_1,
                    };
                    self.flags.toggle(Flags::ON_PUB_CHANNEL_1);
                    self.base.set_channel(channel)?;

                    self.set_bcast(Send);
                    return Ok(Step::Continue);
                }

                Ok(Step::WaitForEvent)
            },
            End => {
                let now = self.now();
                self.base.sleep(now)?;
                self.clear_timeouts(&[TimeoutKind::BcastInterval, TimeoutKind::BcastFinish]);

                if self.tx.packet.is_some() {
                    debug!("Broadcast complete");
                    self.release_packet(true);
                }
                self.neighbors.set_current(None);

                self.end_transmission();
                Ok(Step::Continue)
            },
        }
    }

    /// Abandon the broadcast when a reception is in progress, the frame is
    /// returned to the head of the broadcast queue for the next cycle
    fn bcast_abort_on_rx(&mut self) -> Result<bool, CoreError<E>> {
        if !self.base.is_receiving()? {
            return Ok(false);
        }

        debug!("Reception in progress, deferring broadcast");

        if let Some(p) = self.tx.packet.take() {
            if let Err(p) = self.neighbors.requeue(BROADCAST_ID, p) {
                self.tx.packet = Some(p);
                self.release_packet(false);
            }
        }

        self.set_bcast(BcastState::End);
        Ok(true)
    }
}

#[cfg(test)]
mod test {
    use std::vec::Vec;

    use crate::mock::MockState;
    use crate::Mac as _;
    use super::super::test::*;
    use super::super::*;
    use super::*;

    fn queue_broadcast(h: &mut Harness, data: &[u8]) {
        let dest = packet::broadcast(h.mac.config.pan_id);
        h.mac.transmit(dest, data).unwrap();
    }

    #[test]
    fn repeats_on_both_channels() {
        let mut q = EventQueue::new();
        let mut h = Harness::new(&mut q);
        h.cold_start();

        queue_broadcast(&mut h, &[1, 2, 3]);
        let (pub_1, pub_2) = (h.mac.channels.pub_1, h.mac.channels.pub_2);

        h.fire_until(|m| m.state() == MacState::Transmit(TxState::Bcast(BcastState::WaitTxFinish)));
        let started = h.timer.val();

        let mut sent = Vec::new();
        for _ in 0..2_000 {
            match h.mac.state() {
                MacState::Listen(ListenState::Sleep) => break,
                MacState::Transmit(TxState::Bcast(BcastState::WaitTxFinish)) => {
                    sent.extend(h.sent());
                    h.tx_done(TxFeedback::Success);
                },
                _ => {
                    h.fire();
                },
            }
        }

        assert_eq!(h.mac.state(), MacState::Listen(ListenState::Sleep));
        assert!(h.timer.val() - started >= h.mac.config.superframe_duration);

        // Alternating channels, constant sequence
        assert!(sent.len() > 2);
        let seq = match sent[0].0.content {
            packet::FrameContent::Broadcast{ seq } => seq,
            ref c => panic!("Unexpected frame {:?}", c),
        };
        for (i, (p, info)) in sent.iter().enumerate() {
            assert_eq!(p.content, packet::FrameContent::Broadcast{ seq });
            assert_eq!(p.payload(), &[1, 2, 3]);
            assert!(!info.csma && !p.header.ack_request);
            assert_eq!(info.channel, if i % 2 == 0 { pub_1 } else { pub_2 });
        }

        assert!(matches!(h.mac.tx_outcome(), Some(TxOutcome::Delivered{ .. })));
        assert_eq!(h.radio.state(), MockState::Sleep);
    }

    #[test]
    fn deferred_by_reception() {
        let mut q = EventQueue::new();
        let mut h = Harness::new(&mut q);
        h.cold_start();

        queue_broadcast(&mut h, &[1]);
        queue_broadcast(&mut h, &[2]);

        h.fire_until(|m| m.state() == MacState::Transmit(TxState::Bcast(BcastState::WaitTxFinish)));
        h.tx_done(TxFeedback::Success);

        h.radio.set_busy(true);
        h.fire();

        assert_eq!(h.mac.state(), MacState::Listen(ListenState::Sleep));
        assert_eq!(h.mac.tx_outcome(), None);

        // Returned to the head of the broadcast queue
        let (id, p) = h.mac.neighbors.select_next().unwrap();
        assert_eq!(id, neighbor::BROADCAST_ID);
        assert_eq!(p.payload(), &[1]);
    }

    #[test]
    fn received_broadcast_ends_cp() {
        let mut q = EventQueue::new();
        let mut h = Harness::new(&mut q);
        h.cold_start();

        let pan = h.mac.config.pan_id;
        let mut p = Packet::data(packet::broadcast(pan), h.peer_addr(), 4, &[9]).unwrap();
        p.set_broadcast(4);
        h.receive(&p);

        assert_eq!(h.mac.state(), MacState::Listen(ListenState::Sleep));

        let mut buff = [0u8; 8];
        let (n, _) = h.mac.receive(&mut buff).unwrap().unwrap();
        assert_eq!(&buff[..n], &[9]);
    }
}
