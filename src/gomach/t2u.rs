//! Transmission to a neighbor with an unknown phase (t2u)
//!
//! Preambles addressed to the neighbor are flooded alternately on both public
//! channels for slightly longer than a superframe, so that one lands in the
//! neighbor's CP. The preamble-ack carries the neighbor's phase, after which
//! the data frame is sent immediately and the neighbor is served by t2k.

use core::fmt::Debug;

use log::{debug, trace, warn};
use radio::RadioState;
use rand_core::RngCore;

use crate::error::CoreError;
use crate::timer::Timer;
use crate::Radio;

use super::event::TxFeedback;
use super::packet::Packet;
use super::timeout::TimeoutKind;
use super::{Flags, Mac, MacState, Step, TxState};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum T2uState {
    Init,
    PreamblePrepare,
    SendPreamble,
    WaitPreambleTx,
    WaitPreambleAck,
    SendData,
    WaitDataTx,
    End,
}

const FLOOD_TIMEOUTS: [TimeoutKind; 4] = [
    TimeoutKind::Preamble,
    TimeoutKind::MaxPreambleInterval,
    TimeoutKind::PreambleDuration,
    TimeoutKind::WaitRxEnd,
];

impl <'q, R, S, E, T, G> Mac<'q, R, S, E, T, G>
where
    R: Radio<S, E>,
    S: RadioState,
    E: Debug,
    T: Timer,
    G: RngCore,
{
    fn set_t2u(&mut self, state: T2uState) {
        trace!("t2u state {:?}", state);
        self.state = MacState::Transmit(TxState::T2u(state));
    }

    pub(crate) fn t2u_update(&mut self, state: T2uState) -> Result<Step, CoreError<E>> {
        use T2uState::*;

        match state {
            Init => {
                let now = self.now();
                self.base.idle(now)?;
                self.base.set_channel(self.channels.pub_1)?;
                self.base.set_autoack(false)?;
                self.base.set_ack_request(false)?;

                self.flags.insert(Flags::ON_PUB_CHANNEL_1);
                self.flags.remove(Flags::GOT_PREAMBLE_ACK | Flags::QUIT_CYCLE
                    | Flags::MAX_PREAMBLE_INTERVAL | Flags::BUFFER_FULL);

                self.tx.preamble_sent = 0;
                self.tx.busy_count = 0;
                self.cp_extend_count = 0;
                self.rx_queue.clear();

                self.set_t2u(PreamblePrepare);
                Ok(Step::Continue)
            },
            PreamblePrepare => {
                // The first preamble is sent with CSMA and may take longer
                let interval = match self.tx.preamble_sent {
                    0 => self.config.first_preamble_interval(),
                    _ => {
                        self.toggle_flood_channel()?;
                        self.config.max_preamble_interval
                    },
                };

                self.set_timeout(TimeoutKind::MaxPreambleInterval, interval);
                self.set_t2u(SendPreamble);
                Ok(Step::Continue)
            },
            SendPreamble => self.t2u_send_preamble(),
            WaitPreambleTx => {
                if self.timeouts.is_expired(TimeoutKind::NoTxIsr) {
                    warn!("Missing transmission complete for preamble");
                    self.tx.persistent_fail = self.tx.persistent_fail.saturating_add(1);
                    self.set_t2u(End);
                    return Ok(Step::Continue);
                }

                if !self.flags.contains(Flags::TX_FINISHED) {
                    return Ok(Step::WaitForEvent);
                }

                self.clear_timeout(TimeoutKind::NoTxIsr);
                self.set_timeout(TimeoutKind::Preamble, self.config.preamble_interval);
                self.set_t2u(WaitPreambleAck);
                Ok(Step::Continue)
            },
            WaitPreambleAck => self.t2u_wait_preamble_ack(),
            SendData => {
                self.base.set_ack_request(true)?;

                match self.send_data(true) {
                    Ok(()) => {
                        self.set_timeout(TimeoutKind::NoTxIsr, self.config.no_tx_isr);
                        self.set_t2u(WaitDataTx);
                        Ok(Step::WaitForEvent)
                    },
                    Err(e) => {
                        warn!("t2u transmission failed: {:?}", e);
                        self.drop_packet();
                        self.set_t2u(End);
                        Ok(Step::Continue)
                    },
                }
            },
            WaitDataTx => self.t2u_wait_data_tx(),
            End => {
                let now = self.now();
                self.base.sleep(now)?;

                self.clear_timeouts(&FLOOD_TIMEOUTS);
                self.clear_timeout(TimeoutKind::NoTxIsr);

                // A retained frame is retried next cycle
                if self.tx.packet.is_none() {
                    self.neighbors.set_current(None);
                }

                self.end_transmission();
                Ok(Step::Continue)
            },
        }
    }

    fn toggle_flood_channel(&mut self) -> Result<(), CoreError<E>> {
        let channel = match self.flags.contains(Flags::ON_PUB_CHANNEL_1) {
            true => {
                self.flags.remove(Flags::ON_PUB_CHANNEL_1);
                self.channels.pub_2
            },
            false => {
                self.flags.insert(Flags::ON_PUB_CHANNEL_1);
                self.channels.pub_1
            },
        };

        self.base.set_channel(channel)
    }

    fn t2u_send_preamble(&mut self) -> Result<Step, CoreError<E>> {
        let dst = match self.current_neighbor() {
            Some(n) => n.addr,
            None => {
                self.set_t2u(T2uState::End);
                return Ok(Step::Continue);
            }
        };

        let seq = self.next_seq();
        let p = Packet::preamble(self.config.pan_id, self.own_addr(), seq, dst);
        let first = self.tx.preamble_sent == 0;

        if let Err(e) = self.send(&p, first) {
            warn!("Preamble transmission failed: {:?}", e);
            self.t2u_failed();
            return Ok(Step::Continue);
        }

        if first {
            self.set_timeout(TimeoutKind::PreambleDuration, self.config.preamble_duration);
        }
        self.tx.preamble_sent = self.tx.preamble_sent.saturating_add(1);

        self.set_timeout(TimeoutKind::NoTxIsr, self.config.no_tx_isr);
        self.set_t2u(T2uState::WaitPreambleTx);

        Ok(Step::WaitForEvent)
    }

    fn t2u_wait_preamble_ack(&mut self) -> Result<Step, CoreError<E>> {
        if self.flags.contains(Flags::PKT_RECEIVED) {
            self.flags.remove(Flags::PKT_RECEIVED);
            self.process_preamble_ack_wait();
        }

        if self.flags.contains(Flags::BUFFER_FULL) {
            self.flags.remove(Flags::BUFFER_FULL);
            warn!("Receive buffer exhausted during preamble flood");

            self.release_packet(false);
            if !self.load_next_packet() {
                self.neighbors.set_current(None);
            }

            self.set_t2u(T2uState::End);
            return Ok(Step::Continue);
        }

        // Another flood is ongoing, yield and retry next cycle
        if self.flags.contains(Flags::QUIT_CYCLE) {
            debug!("Yielding to another preamble flood");
            self.set_t2u(T2uState::End);
            return Ok(Step::Continue);
        }

        if self.flags.contains(Flags::GOT_PREAMBLE_ACK) {
            self.flags.remove(Flags::GOT_PREAMBLE_ACK);
            self.clear_timeouts(&FLOOD_TIMEOUTS);
            self.set_t2u(T2uState::SendData);
            return Ok(Step::Continue);
        }

        if self.timeouts.is_expired(TimeoutKind::PreambleDuration) {
            debug!("No preamble-ack after {} preambles", self.tx.preamble_sent);
            self.t2u_failed();
            return Ok(Step::Continue);
        }

        if self.timeouts.is_expired(TimeoutKind::Preamble)
                || self.timeouts.is_expired(TimeoutKind::MaxPreambleInterval) {
            self.flags.insert(Flags::MAX_PREAMBLE_INTERVAL);
        }

        if self.flags.contains(Flags::MAX_PREAMBLE_INTERVAL) {
            // Do not transmit over a frame being received, it may be the ack
            if self.wait_rx_end()? {
                return Ok(Step::WaitForEvent);
            }

            self.flags.remove(Flags::MAX_PREAMBLE_INTERVAL);
            self.clear_timeouts(&[TimeoutKind::Preamble, TimeoutKind::MaxPreambleInterval, TimeoutKind::WaitRxEnd]);
            self.set_t2u(T2uState::PreamblePrepare);
            return Ok(Step::Continue);
        }

        Ok(Step::WaitForEvent)
    }

    fn t2u_wait_data_tx(&mut self) -> Result<Step, CoreError<E>> {
        if self.timeouts.is_expired(TimeoutKind::NoTxIsr) {
            warn!("Missing transmission complete in t2u");
            self.tx.persistent_fail = self.tx.persistent_fail.saturating_add(1);
            self.t2u_expect_relock();
            self.set_t2u(T2uState::End);
            return Ok(Step::Continue);
        }

        if !self.flags.contains(Flags::TX_FINISHED) {
            return Ok(Step::WaitForEvent);
        }

        self.clear_timeout(TimeoutKind::NoTxIsr);

        match self.tx.feedback {
            Some(TxFeedback::Success) => {
                if let Some(n) = self.current_neighbor_mut() {
                    n.t2u_retry = 0;
                }
                // Continues as t2k, including any vTDMA burst
                self.t2k_cp_success();
            },
            Some(TxFeedback::Busy) if self.tx.busy_count < self.config.tx_busy_threshold => {
                self.tx.busy_count += 1;
                self.set_t2u(T2uState::SendData);
            },
            _ => {
                self.t2u_failed();
                if self.tx.packet.is_some() {
                    self.t2u_expect_relock();
                }
            },
        }

        Ok(Step::Continue)
    }

    /// The phase learned from the preamble-ack did not yield a delivery,
    /// a single further missing ack in t2k returns the neighbor to t2u
    fn t2u_expect_relock(&mut self) {
        let threshold = self.config.rephaselock_threshold;
        if let Some(n) = self.current_neighbor_mut() {
            n.no_ack = threshold;
        }
    }

    /// Failed attempt, the frame is dropped once the retry ceiling is reached
    fn t2u_failed(&mut self) {
        let threshold = self.config.t2u_retry_threshold;
        self.stats.t2u_fail = self.stats.t2u_fail.saturating_add(1);

        let exhausted = match self.current_neighbor_mut() {
            Some(n) => {
                n.t2u_retry = n.t2u_retry.saturating_add(1);
                n.t2u_retry >= threshold
            },
            None => true,
        };

        if exhausted {
            self.tx.persistent_fail = self.tx.persistent_fail.saturating_add(1);
            self.drop_packet();
        }

        self.set_t2u(T2uState::End);
    }
}
