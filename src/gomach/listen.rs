//! Listen state machine, covering the own CP, beacon, vTDMA reception and sleep
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use core::fmt::Debug;

use log::{debug, trace, warn};
use radio::RadioState;
use rand_core::RngCore;

use crate::error::CoreError;
use crate::timer::Timer;
use crate::Radio;

use super::neighbor::BROADCAST_ID;
use super::packet::Packet;
use super::timeout::TimeoutKind;
use super::{BcastState, Flags, Mac, MacState, Step, T2kState, T2uState, TxState};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ListenState {
    CpInit,
    CpListen,
    CpEnd,
    SendBeacon,
    WaitBeaconTx,
    VtdmaInit,
    Vtdma,
    VtdmaEnd,
    SleepInit,
    Sleep,
    SleepEnd,
}

impl <'q, R, S, E, T, G> Mac<'q, R, S, E, T, G>
where
    R: Radio<S, E>,
    S: RadioState,
    E: Debug,
    T: Timer,
    G: RngCore,
{
    pub(crate) fn listen_update(&mut self, state: ListenState) -> Result<Step, CoreError<E>> {
        use ListenState::*;

        match state {
            CpInit => self.cp_init(),
            CpListen => self.cp_listen(),
            CpEnd => {
                self.rx_queue.clear();
                match self.flags.contains(Flags::QUIT_CYCLE) {
                    true => self.set_listen(SleepInit),
                    false => self.set_listen(SendBeacon),
                }
                Ok(Step::Continue)
            },
            SendBeacon => self.send_beacon(),
            WaitBeaconTx => self.wait_beacon_tx(),
            VtdmaInit => self.vtdma_init(),
            Vtdma => self.vtdma(),
            VtdmaEnd => {
                self.rx_queue.clear();
                self.base.set_channel(self.channels.current)?;
                self.select_transmission()
            },
            SleepInit => {
                let now = self.now();
                self.base.sleep(now)?;
                self.set_listen(Sleep);
                Ok(Step::Continue)
            },
            Sleep => {
                if self.flags.contains(Flags::ENTER_NEW_CYCLE) {
                    self.set_listen(SleepEnd);
                    return Ok(Step::Continue);
                }
                Ok(Step::WaitForEvent)
            },
            SleepEnd => {
                if self.flags.contains(Flags::PHASE_BACKOFF) {
                    self.flags.remove(Flags::PHASE_BACKOFF);
                    self.apply_phase_backoff();
                    self.set_listen(Sleep);
                } else {
                    self.set_listen(CpInit);
                }
                Ok(Step::Continue)
            },
        }
    }

    fn cp_init(&mut self) -> Result<Step, CoreError<E>> {
        let now = self.now();

        self.dupchk.age(self.config.dupchk_lifetime);

        if self.tx.persistent_fail >= self.config.max_t2u_fail {
            warn!("{} persistent transmission failures, re-initialising radio", self.tx.persistent_fail);

            // Retried next cycle on failure
            match self.base.reinit(now) {
                Ok(()) => {
                    self.tx.persistent_fail = 0;
                    self.stats.radio_reinit = self.stats.radio_reinit.saturating_add(1);
                },
                Err(e) => warn!("Radio re-initialisation failed: {:?}", e),
            }
        }

        self.flags.remove(Flags::ENTER_NEW_CYCLE | Flags::PKT_RECEIVED | Flags::QUIT_CYCLE
            | Flags::UNINTD_PREAMBLE | Flags::GOT_PREAMBLE | Flags::BEACON_FAIL
            | Flags::CP_END | Flags::VTDMA_END | Flags::BUFFER_FULL);
        self.cp_extend_count = 0;
        self.rx_queue.clear();
        self.base.set_rx_started(false);

        self.clear_timeouts(&[TimeoutKind::CpEnd, TimeoutKind::CpMax, TimeoutKind::WaitRxEnd]);
        let cp_end = self.config.cp_duration + self.random(self.config.cp_random_end);
        self.set_timeout(TimeoutKind::CpEnd, cp_end);
        self.set_timeout(TimeoutKind::CpMax, self.config.cp_duration_max);

        self.base.idle(now)?;
        self.base.set_channel(self.channels.current)?;
        self.base.set_autoack(true)?;

        trace!("CP on channel {} for {} us", self.channels.current, cp_end);

        self.set_listen(ListenState::CpListen);
        Ok(Step::WaitForEvent)
    }

    fn extend_cp(&mut self) {
        self.flags.remove(Flags::CP_END);
        self.clear_timeout(TimeoutKind::CpEnd);
        self.set_timeout(TimeoutKind::CpEnd, self.config.cp_duration);
    }

    fn cp_listen(&mut self) -> Result<Step, CoreError<E>> {
        if self.flags.contains(Flags::PKT_RECEIVED) {
            self.flags.remove(Flags::PKT_RECEIVED);
            self.process_cp()?;

            if self.flags.contains(Flags::GOT_PREAMBLE) {
                self.flags.remove(Flags::GOT_PREAMBLE);
                self.extend_cp();
            } else if !self.flags.intersects(Flags::UNINTD_PREAMBLE | Flags::QUIT_CYCLE) {
                self.extend_cp();
            }
        }

        if self.timeouts.is_expired(TimeoutKind::CpMax) {
            debug!("CP reached maximum duration");
            self.clear_timeouts(&[TimeoutKind::CpEnd, TimeoutKind::WaitRxEnd]);
            self.set_listen(ListenState::CpEnd);
            return Ok(Step::Continue);
        }

        if self.timeouts.is_expired(TimeoutKind::CpEnd) {
            self.flags.insert(Flags::CP_END);
        }

        if self.flags.intersects(Flags::CP_END | Flags::QUIT_CYCLE) {
            if self.wait_rx_end()? {
                return Ok(Step::WaitForEvent);
            }

            self.clear_timeouts(&[TimeoutKind::CpEnd, TimeoutKind::CpMax, TimeoutKind::WaitRxEnd]);
            self.set_listen(ListenState::CpEnd);
            return Ok(Step::Continue);
        }

        Ok(Step::WaitForEvent)
    }

    /// Defer the end of a listen period while a reception is in progress,
    /// a bounded number of times
    pub(crate) fn wait_rx_end(&mut self) -> Result<bool, CoreError<E>> {
        if !self.base.is_receiving()? || self.cp_extend_count >= self.config.cp_extend_threshold {
            return Ok(false);
        }

        trace!("Reception ongoing, deferring period end");
        self.cp_extend_count += 1;
        self.clear_timeout(TimeoutKind::WaitRxEnd);
        self.set_timeout(TimeoutKind::WaitRxEnd, self.config.wait_rx_end);

        Ok(true)
    }

    fn send_beacon(&mut self) -> Result<Step, CoreError<E>> {
        self.rx_slots = 0;

        if !self.slosch.has_pending() {
            self.flags.insert(Flags::BEACON_FAIL);
            self.set_listen(ListenState::WaitBeaconTx);
            return Ok(Step::Continue);
        }

        self.base.set_autoack(false)?;

        // Slots are bounded by the remainder of the cycle
        let remaining = self.clock.cycle_len().saturating_sub(self.phase_now());
        let max_slots = self.config.slots_in(remaining);
        let beacon = self.slosch.build_beacon(max_slots, self.config.max_alloc_senders, self.channels.sub_channel);

        let beacon = match beacon {
            Some(b) => b,
            None => {
                self.flags.insert(Flags::BEACON_FAIL);
                self.set_listen(ListenState::WaitBeaconTx);
                return Ok(Step::Continue);
            }
        };

        let total = beacon.total_slots();
        let seq = self.next_seq();
        let p = Packet::beacon(self.config.pan_id, self.own_addr(), seq, beacon);

        // CSMA only where other senders are known to be active
        let csma = self.flags.contains(Flags::UNINTD_PREAMBLE);

        self.set_listen(ListenState::WaitBeaconTx);

        match self.send(&p, csma) {
            Ok(()) => {
                debug!("Beacon allocating {} slots", total);
                self.rx_slots = total.min(u8::MAX as u32) as u8;
                self.stats.beacon_tx = self.stats.beacon_tx.saturating_add(1);
                self.set_timeout(TimeoutKind::NoTxIsr, self.config.no_tx_isr);
                Ok(Step::WaitForEvent)
            },
            Err(e) => {
                warn!("Beacon transmission failed: {:?}", e);
                self.flags.insert(Flags::BEACON_FAIL);
                Ok(Step::Continue)
            },
        }
    }

    fn wait_beacon_tx(&mut self) -> Result<Step, CoreError<E>> {
        if self.timeouts.is_expired(TimeoutKind::NoTxIsr) {
            warn!("Missing transmission complete for beacon");
            self.tx.persistent_fail = self.tx.persistent_fail.saturating_add(1);
            self.set_listen(ListenState::SleepInit);
            return Ok(Step::Continue);
        }

        if !self.flags.intersects(Flags::TX_FINISHED | Flags::BEACON_FAIL) {
            return Ok(Step::WaitForEvent);
        }

        self.clear_timeout(TimeoutKind::NoTxIsr);

        match self.rx_slots > 0 && !self.flags.contains(Flags::BEACON_FAIL) {
            true => {
                self.set_listen(ListenState::VtdmaInit);
                Ok(Step::Continue)
            },
            false => self.select_transmission(),
        }
    }

    fn vtdma_init(&mut self) -> Result<Step, CoreError<E>> {
        self.base.set_channel(self.channels.sub_channel)?;
        self.base.set_autoack(true)?;
        self.base.set_rx_started(false);

        self.flags.remove(Flags::VTDMA_END);
        self.cp_extend_count = 0;

        let duration = self.rx_slots as u32 * self.config.vtdma_slot_duration;
        self.set_timeout(TimeoutKind::Vtdma, duration);

        self.set_listen(ListenState::Vtdma);
        Ok(Step::WaitForEvent)
    }

    fn vtdma(&mut self) -> Result<Step, CoreError<E>> {
        if self.flags.contains(Flags::PKT_RECEIVED) {
            self.flags.remove(Flags::PKT_RECEIVED);
            self.process_vtdma();
        }

        if self.timeouts.is_expired(TimeoutKind::Vtdma) {
            self.flags.insert(Flags::VTDMA_END);
        }

        if self.flags.contains(Flags::VTDMA_END) {
            if self.wait_rx_end()? {
                return Ok(Step::WaitForEvent);
            }

            self.clear_timeout(TimeoutKind::WaitRxEnd);
            self.set_listen(ListenState::VtdmaEnd);
            return Ok(Step::Continue);
        }

        Ok(Step::WaitForEvent)
    }

    /// Pick the transmission strategy for pending outbound traffic after the
    /// own listen periods, or sleep when there is none
    fn select_transmission(&mut self) -> Result<Step, CoreError<E>> {
        if !self.find_next_tx_target() {
            self.set_listen(ListenState::SleepInit);
            return Ok(Step::Continue);
        }

        let unintd = self.flags.contains(Flags::UNINTD_PREAMBLE);
        let known = self.current_neighbor().map(|n| n.is_known()).unwrap_or(false);

        let next = match self.neighbors.current() {
            Some(BROADCAST_ID) if !unintd => Some(TxState::Bcast(BcastState::Init)),
            Some(_) if known => Some(TxState::T2k(T2kState::Init)),
            Some(_) if !unintd => Some(TxState::T2u(T2uState::Init)),
            _ => None,
        };

        match next {
            Some(s) => {
                debug!("Transmission {:?} to neighbor {:?}", s, self.neighbors.current());
                self.state = MacState::Transmit(s);
            },
            // Another flood is ongoing, defer to the next cycle
            None => self.set_listen(ListenState::SleepInit),
        }

        Ok(Step::Continue)
    }
}
