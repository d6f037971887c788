//! Duty-cycled MAC protocol engine
//!
//! The engine is a run-to-completion state machine, all interrupt sources
//! (radio and timer) are delivered as [`Event`]s through an [`EventQueue`]
//! and processed by [`Mac::tick`](crate::Mac::tick), which steps the active
//! state machine until it is waiting on a further event.
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use core::fmt::Debug;

use bitflags::bitflags;
use heapless::Deque;
use ieee802154::mac::{Address, ExtendedAddress};
use log::{debug, info, trace, warn};
use radio::RadioState;
use rand_core::RngCore;

use crate::base::{Base, BaseState};
use crate::error::CoreError;
use crate::timer::{Alarm, Timer};
use crate::{Mac as MacIf, Radio, RawPacket, RxInfo, Tick};

pub mod config;
pub use config::Config;

pub mod channels;
pub mod dupchk;
pub mod event;
pub mod neighbor;
pub mod packet;
pub mod phase;
pub mod slots;
pub mod timeout;

mod bcast;
mod listen;
mod rx;
mod t2k;
mod t2u;

pub use bcast::BcastState;
pub use event::{Event, EventConsumer, EventProducer, EventQueue, TxFeedback};
pub use listen::ListenState;
pub use neighbor::{MacType, Neighbor};
pub use packet::Packet;
pub use t2k::T2kState;
pub use t2u::T2uState;

use channels::Channels;
use config::{DISPATCH_QUEUE_LEN, RX_QUEUE_LEN, TX_OUTCOME_LEN};
use dupchk::DupChecker;
use neighbor::Neighbors;
use phase::PhaseClock;
use slots::{SlotGrant, SlotScheduler};
use timeout::{TimeoutKind, Timeouts};

/// Top level protocol state
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MacState {
    Init(InitState),
    Listen(ListenState),
    Transmit(TxState),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InitState {
    Prepare,
    /// Random start offset, collecting neighbors' sub-channel announcements
    Backoff,
    Announce,
    WaitFeedback,
    End,
}

/// Active transmission strategy
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TxState {
    /// Transmit to a neighbor with a known phase
    T2k(T2kState),
    /// Transmit to a neighbor with an unknown phase
    T2u(T2uState),
    Bcast(BcastState),
}

/// Result of a single state machine step
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Step {
    /// A further transition is pending
    Continue,
    /// Waiting on an event
    WaitForEvent,
}

bitflags! {
    /// Short-lived protocol conditions
    pub struct Flags: u16 {
        const PKT_RECEIVED = 1 << 0;
        const TX_FINISHED = 1 << 1;
        const QUIT_CYCLE = 1 << 2;
        const CP_END = 1 << 3;
        const VTDMA_END = 1 << 4;
        /// Preamble for another node seen in the current CP
        const UNINTD_PREAMBLE = 1 << 5;
        const GOT_PREAMBLE = 1 << 6;
        const DUTY_CYCLE_START = 1 << 7;
        const PHASE_BACKOFF = 1 << 8;
        const BEACON_FAIL = 1 << 9;
        const BUFFER_FULL = 1 << 10;
        const ENTER_NEW_CYCLE = 1 << 11;
        const GOT_PREAMBLE_ACK = 1 << 12;
        const ON_PUB_CHANNEL_1 = 1 << 13;
        const MAX_PREAMBLE_INTERVAL = 1 << 14;
        /// Wake alarm armed for a shifted cycle start
        const BACKOFF_WAKEUP = 1 << 15;
    }
}

/// Outcome of an outbound frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TxOutcome {
    Delivered { dest: Address, seq: u8 },
    Dropped { dest: Address, seq: u8 },
}

/// MAC statistics, saturating counters since start
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MacStats {
    /// Frames delivered (acked unicast or completed broadcast)
    pub tx_success: u32,
    /// Frames dropped
    pub tx_fail: u32,
    /// Missing acks for frames sent in a neighbor's CP
    pub no_ack: u32,
    /// Neighbors returned to phase discovery
    pub relock: u32,
    /// Failed discovery or t2u data attempts
    pub t2u_fail: u32,
    /// Beacons sent
    pub beacon_tx: u32,
    /// Duplicate frames suppressed
    pub duplicates: u32,
    /// Received frames lost to full queues
    pub rx_dropped: u32,
    pub decode_fail: u32,
    pub radio_reinit: u32,
}

impl MacStats {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Transmission context for the neighbor being served
#[derive(Debug, Default)]
struct TxContext {
    /// Frame currently being sent
    packet: Option<Packet>,
    feedback: Option<TxFeedback>,
    busy_count: u8,
    preamble_sent: u8,
    /// Failures indicating a radio fault, triggers re-initialisation
    persistent_fail: u8,
    /// Slots granted by the receiver's beacon
    grant: SlotGrant,
    bcast_seq: u8,
}

/// GoMacH MAC instance for a single interface
///
/// Owns the radio (via [`Base`]), the timer and the random source, and
/// consumes radio and timer events from the inbox. All protocol work happens
/// in [`Mac::run`], which steps the state machines until they wait for an event.
pub struct Mac<'q, R, S, E, T, G> {
    /// Own link address
    pub address: ExtendedAddress,

    config: Config,
    base: Base<R, S, E>,
    timer: T,
    rng: G,
    inbox: EventConsumer<'q>,

    state: MacState,
    flags: Flags,
    clock: PhaseClock,
    /// Deadline of the armed wake alarm
    wakeup_at: Tick,
    backoff_phase: u32,
    channels: Channels,
    timeouts: Timeouts,

    neighbors: Neighbors,
    dupchk: DupChecker,
    slosch: SlotScheduler,
    /// vTDMA slots allocated by the own beacon
    rx_slots: u8,
    cp_extend_count: u8,
    tx: TxContext,
    seq: u8,

    rx_queue: Deque<(RxInfo, Packet), RX_QUEUE_LEN>,
    rx_buff: Deque<(RxInfo, Packet), DISPATCH_QUEUE_LEN>,
    tx_outcomes: Deque<TxOutcome, TX_OUTCOME_LEN>,

    stats: MacStats,
}

impl <'q, R, S, E, T, G> Mac<'q, R, S, E, T, G>
where
    R: Radio<S, E>,
    S: RadioState,
    E: Debug,
    T: Timer,
    G: RngCore,
{
    /// Create a MAC instance and start initialisation, radio and timer events
    /// are delivered through the producer side of `inbox`
    pub fn new(address: ExtendedAddress, config: Config, radio: R, mut timer: T, rng: G, inbox: EventConsumer<'q>) -> Result<Self, CoreError<E>> {
        timer.power_on();
        let now = timer.ticks();

        let channels = Channels::new(config.pub_channel_1, config.pub_channel_2);

        // Sequence numbers are seeded from the address to desynchronise neighbors
        let seed = address.0 as u8;

        let mut s = Self {
            address,
            base: Base::new(radio, now),
            timer,
            rng,
            inbox,

            state: MacState::Init(InitState::Prepare),
            flags: Flags::empty(),
            clock: PhaseClock::new(config.superframe_duration),
            wakeup_at: now,
            backoff_phase: 0,
            neighbors: Neighbors::new(channels.pub_1),
            channels,
            timeouts: Timeouts::new(),

            dupchk: DupChecker::new(),
            slosch: SlotScheduler::new(),
            rx_slots: 0,
            cp_extend_count: 0,
            tx: TxContext { bcast_seq: seed, ..Default::default() },
            seq: seed,

            rx_queue: Deque::new(),
            rx_buff: Deque::new(),
            tx_outcomes: Deque::new(),

            stats: MacStats::new(),
            config,
        };

        debug!("Setup MAC with address {:?} at {} us", s.address, now);

        s.run()?;

        Ok(s)
    }

    pub fn state(&self) -> MacState {
        self.state
    }

    pub fn stats(&self) -> &MacStats {
        &self.stats
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Fetch the outcome of a previously enqueued frame
    pub fn tx_outcome(&mut self) -> Option<TxOutcome> {
        self.tx_outcomes.pop_front()
    }

    /// Look up a neighbor record
    pub fn neighbor(&self, addr: ExtendedAddress) -> Option<&Neighbor> {
        self.neighbors.find(addr).and_then(|id| self.neighbors.get(id))
    }

    /// Radio on-time since start-up in per-mille
    pub fn duty_cycle(&mut self) -> u32 {
        let now = self.timer.ticks();
        self.base.duty_cycle(now)
    }

    /// Enqueue a payload for a unicast neighbor, or broadcast when `dest` is `None`
    pub fn enqueue_outbound(&mut self, dest: Option<ExtendedAddress>, data: &[u8]) -> Result<(), CoreError<E>> {
        let link_dest = match dest {
            Some(a) => Address::Extended(self.config.pan_id, a),
            None => packet::broadcast(self.config.pan_id),
        };

        let seq = self.next_seq();
        let p = Packet::data(link_dest, self.own_addr(), seq, data)
            .ok_or(CoreError::PayloadLength(data.len()))?;

        let id = self.neighbors.enqueue(dest, p, self.channels.pub_1)
            .map_err(|p| {
                warn!("Outbound queue full for {:?}", dest);
                CoreError::QueueFull(p)
            })?;

        trace!("Queued frame {} for neighbor {}", seq, id);

        Ok(())
    }

    /// Process a single event and drive the protocol until it is waiting again
    pub fn handle(&mut self, event: Event) -> Result<(), CoreError<E>> {
        let now = self.now();

        match event {
            Event::RxStarted => self.base.set_rx_started(true),
            Event::RxComplete(raw) => self.handle_rx(raw),
            Event::RxNoBuffer => {
                self.base.set_rx_started(false);
                self.flags.insert(Flags::BUFFER_FULL);
            },
            Event::TxComplete(feedback) => {
                trace!("Transmission complete: {}", feedback);
                self.tx.feedback = Some(feedback);
                self.flags.insert(Flags::TX_FINISHED);
                if self.base.state() == BaseState::Transmitting {
                    self.base.idle(now)?;
                }
            },
            Event::Alarm(Alarm::Cycle) => self.on_cycle_alarm(),
            Event::Alarm(Alarm::Timeout(index)) => {
                self.timeouts.fire(&mut self.timer, index);
            },
        }

        self.run()
    }

    /// Step the protocol until it is waiting on an event
    pub fn run(&mut self) -> Result<(), CoreError<E>> {
        while self.step()? == Step::Continue {}
        Ok(())
    }

    /// Execute a single state machine step
    pub fn step(&mut self) -> Result<Step, CoreError<E>> {
        match self.state {
            MacState::Init(s) => self.init_update(s),
            MacState::Listen(s) => self.listen_update(s),
            MacState::Transmit(TxState::T2k(s)) => self.t2k_update(s),
            MacState::Transmit(TxState::T2u(s)) => self.t2u_update(s),
            MacState::Transmit(TxState::Bcast(s)) => self.bcast_update(s),
        }
    }

    fn init_update(&mut self, state: InitState) -> Result<Step, CoreError<E>> {
        let now = self.now();

        match state {
            InitState::Prepare => {
                self.timer.clear_alarm(Alarm::Cycle);
                self.flags.remove(Flags::QUIT_CYCLE);
                self.channels.clear_occupied();
                self.rx_queue.clear();

                self.base.idle(now)?;
                self.base.set_channel(self.channels.current)?;
                self.base.set_autoack(true)?;

                // Random start offset so neighbors powered together do not share a phase
                let offset = self.random(self.config.superframe_duration);
                debug!("Init start offset {} us", offset);

                self.set_timeout(TimeoutKind::InitBackoff, offset);
                self.state = MacState::Init(InitState::Backoff);

                Ok(Step::WaitForEvent)
            },
            InitState::Backoff => {
                if self.flags.contains(Flags::PKT_RECEIVED) {
                    self.flags.remove(Flags::PKT_RECEIVED);
                    self.process_announcements();
                }

                if self.timeouts.is_expired(TimeoutKind::InitBackoff) {
                    self.state = MacState::Init(InitState::Announce);
                    return Ok(Step::Continue);
                }

                Ok(Step::WaitForEvent)
            },
            InitState::Announce => {
                let own_id = self.address.0 as u16;
                let sub_channel = self.channels.choose_sub_channel(own_id);
                info!("Selected sub-channel {}", sub_channel);

                let seq = self.next_seq();
                let p = Packet::announce(self.config.pan_id, self.own_addr(), seq, sub_channel);

                match self.send(&p, true) {
                    Ok(()) => {
                        self.set_timeout(TimeoutKind::NoTxIsr, self.config.no_tx_isr);
                        self.state = MacState::Init(InitState::WaitFeedback);
                        Ok(Step::WaitForEvent)
                    },
                    Err(e) => {
                        warn!("Sub-channel announcement failed: {:?}", e);
                        self.state = MacState::Init(InitState::End);
                        Ok(Step::Continue)
                    },
                }
            },
            InitState::WaitFeedback => {
                if self.flags.contains(Flags::TX_FINISHED) {
                    self.clear_timeout(TimeoutKind::NoTxIsr);
                } else if self.timeouts.is_expired(TimeoutKind::NoTxIsr) {
                    warn!("Missing transmission complete for sub-channel announcement");
                } else {
                    return Ok(Step::WaitForEvent);
                }

                self.rx_queue.clear();
                self.state = MacState::Init(InitState::End);
                Ok(Step::Continue)
            },
            InitState::End => {
                self.state = MacState::Listen(ListenState::CpInit);
                self.flags.remove(Flags::DUTY_CYCLE_START);
                self.on_cycle_alarm();
                Ok(Step::Continue)
            },
        }
    }

    /// Start of a cycle, either the first (duty cycle start) or on the wake alarm
    fn on_cycle_alarm(&mut self) {
        if !self.flags.contains(Flags::DUTY_CYCLE_START) {
            self.flags.insert(Flags::DUTY_CYCLE_START);
            let now = self.now();
            self.clock.restart(now);
        } else {
            self.clock.restart(self.wakeup_at);
            self.flags.insert(Flags::ENTER_NEW_CYCLE);
        }

        // Shifted starts (phase backoff) keep the channel schedule of the cycle
        if self.flags.contains(Flags::BACKOFF_WAKEUP) {
            self.flags.remove(Flags::BACKOFF_WAKEUP);
        } else {
            self.channels.toggle();
            self.neighbors.toggle_channels(&self.channels);
        }

        self.wakeup_at = self.clock.next_cycle();
        self.timer.set_alarm(Alarm::Cycle, self.wakeup_at);

        trace!("Cycle start at {} us, next at {} us", self.clock.cycle_start(), self.wakeup_at);
    }

    /// Move the own cycle start later by the pending phase backoff
    fn apply_phase_backoff(&mut self) {
        let backoff = self.backoff_phase;
        debug!("Applying phase backoff of {} us", backoff);

        self.neighbors.apply_backoff(backoff, self.clock.cycle_len(), &self.channels);

        self.wakeup_at = self.clock.cycle_start().wrapping_add(backoff);
        self.timer.set_alarm(Alarm::Cycle, self.wakeup_at);

        self.flags.insert(Flags::BACKOFF_WAKEUP);
        self.flags.remove(Flags::ENTER_NEW_CYCLE);
    }

    fn handle_rx(&mut self, raw: RawPacket) {
        if !self.base.rx_started() {
            debug!("Reception without start of frame, dropping");
            return;
        }
        self.base.set_rx_started(false);

        let p = match Packet::decode(raw.data()) {
            Ok(p) => p,
            Err(e) => {
                debug!("Failed to decode frame: {:?}", e);
                self.stats.decode_fail = self.stats.decode_fail.saturating_add(1);
                return;
            }
        };

        if p.source().is_none() {
            trace!("Dropping frame without extended source address");
            return;
        }

        let info = RxInfo { source: p.header.source, rssi: raw.rssi, lqi: raw.lqi };

        if self.rx_queue.push_back((info, p)).is_err() {
            debug!("Receive queue full, dropping frame");
            self.stats.rx_dropped = self.stats.rx_dropped.saturating_add(1);
            return;
        }

        self.flags.insert(Flags::PKT_RECEIVED);
    }

    fn now(&self) -> Tick {
        self.timer.ticks()
    }

    fn phase_now(&self) -> u32 {
        self.clock.phase_at(self.timer.ticks())
    }

    fn own_addr(&self) -> Address {
        Address::Extended(self.config.pan_id, self.address)
    }

    fn next_seq(&mut self) -> u8 {
        let s = self.seq;
        self.seq = self.seq.wrapping_add(1);
        s
    }

    /// Uniform random value in `[0, max)`
    fn random(&mut self, max: u32) -> u32 {
        match max {
            0 => 0,
            m => self.rng.next_u32() % m,
        }
    }

    fn set_timeout(&mut self, kind: TimeoutKind, duration: u32) -> bool {
        self.timeouts.set(&mut self.timer, kind, duration)
    }

    fn clear_timeout(&mut self, kind: TimeoutKind) {
        self.timeouts.clear(&mut self.timer, kind)
    }

    fn clear_timeouts(&mut self, kinds: &[TimeoutKind]) {
        for k in kinds {
            self.timeouts.clear(&mut self.timer, *k);
        }
    }

    fn set_listen(&mut self, state: ListenState) {
        trace!("Listen state {:?}", state);
        self.state = MacState::Listen(state);
    }

    /// Return to sleep for the remainder of the cycle after a transmission
    fn end_transmission(&mut self) {
        self.set_listen(ListenState::Sleep);
        self.flags.remove(Flags::ENTER_NEW_CYCLE);
    }

    /// Start transmission of a frame, completion is signalled by a `TxComplete` event
    fn send(&mut self, packet: &Packet, csma: bool) -> Result<(), CoreError<E>> {
        let now = self.now();
        self.flags.remove(Flags::TX_FINISHED);
        self.tx.feedback = None;
        self.base.transmit(now, packet, csma)
    }

    /// Send the current frame, reporting the number of frames still queued
    fn send_data(&mut self, csma: bool) -> Result<(), CoreError<E>> {
        let queued = self.current_neighbor().map(|n| n.queue.len()).unwrap_or(0);
        let now = self.now();

        let p = self.tx.packet.as_mut().ok_or(CoreError::NoPacket)?;
        p.set_queue_indicator(queued.min(u8::MAX as usize) as u8);

        self.flags.remove(Flags::TX_FINISHED);
        self.tx.feedback = None;
        self.base.transmit(now, p, csma)
    }

    fn current_neighbor(&self) -> Option<&Neighbor> {
        self.neighbors.current().and_then(|id| self.neighbors.get(id))
    }

    fn current_neighbor_mut(&mut self) -> Option<&mut Neighbor> {
        match self.neighbors.current() {
            Some(id) => self.neighbors.get_mut(id),
            None => None,
        }
    }

    /// Load the next queued frame for the current neighbor
    fn load_next_packet(&mut self) -> bool {
        self.tx.packet = self.current_neighbor_mut().and_then(|n| n.queue.pop_front());
        self.tx.packet.is_some()
    }

    /// Select the next frame to send, keeping a frame retained for retry
    fn find_next_tx_target(&mut self) -> bool {
        if self.neighbors.current().is_some() && self.tx.packet.is_some() {
            return true;
        }

        match self.neighbors.select_next() {
            Some((id, p)) => {
                self.tx.packet = Some(p);
                self.tx.busy_count = 0;
                self.neighbors.set_current(Some(id));
                if let Some(n) = self.neighbors.get_mut(id) {
                    n.t2u_retry = 0;
                }
                true
            },
            None => {
                self.neighbors.set_current(None);
                false
            },
        }
    }

    /// Release the current frame, reporting its outcome
    fn release_packet(&mut self, delivered: bool) {
        let p = match self.tx.packet.take() {
            Some(p) => p,
            None => return,
        };

        let (dest, seq) = (p.header.destination, p.header.seq);
        let outcome = if delivered {
            self.stats.tx_success = self.stats.tx_success.saturating_add(1);
            TxOutcome::Delivered { dest, seq }
        } else {
            warn!("Dropping frame {} to {:?}", seq, dest);
            self.stats.tx_fail = self.stats.tx_fail.saturating_add(1);
            TxOutcome::Dropped { dest, seq }
        };

        if self.tx_outcomes.is_full() {
            self.tx_outcomes.pop_front();
        }
        let _ = self.tx_outcomes.push_back(outcome);
    }

    /// Drop the current frame and stop serving the neighbor
    fn drop_packet(&mut self) {
        self.release_packet(false);
        if let Some(n) = self.current_neighbor_mut() {
            n.no_ack = 0;
        }
        self.neighbors.set_current(None);
    }

    /// Hand a received frame to the upper layer
    fn deliver(&mut self, info: RxInfo, packet: Packet) {
        if self.rx_buff.push_back((info, packet)).is_err() {
            warn!("Dispatch queue full, dropping received frame");
            self.stats.rx_dropped = self.stats.rx_dropped.saturating_add(1);
        }
    }
}

impl <'q, R, S, E, T, G> MacIf<Address> for Mac<'q, R, S, E, T, G>
where
    R: Radio<S, E>,
    S: RadioState,
    E: Debug,
    T: Timer,
    G: RngCore,
{
    type Error = CoreError<E>;

    /// Enqueue a packet for TX
    fn transmit(&mut self, dest: Address, data: &[u8]) -> Result<(), Self::Error> {
        let dest = match dest {
            d if packet::is_broadcast(&d) => None,
            Address::Extended(_, a) => Some(a),
            d => return Err(CoreError::InvalidAddress(d)),
        };

        self.enqueue_outbound(dest, data)?;

        self.run()
    }

    /// Check for received packets
    fn receive(&mut self, data: &mut [u8]) -> Result<Option<(usize, RxInfo)>, Self::Error> {
        let (info, p) = match self.rx_buff.pop_front() {
            Some(rx) => rx,
            None => return Ok(None),
        };

        let n = p.payload().len();
        if data.len() < n {
            let _ = self.rx_buff.push_front((info, p));
            return Err(CoreError::PayloadLength(n));
        }

        data[..n].copy_from_slice(p.payload());

        Ok(Some((n, info)))
    }

    /// Check whether the MAC is busy
    fn busy(&mut self) -> Result<bool, Self::Error> {
        Ok(!matches!(self.state, MacState::Listen(_)))
    }

    /// Process queued events
    fn tick(&mut self) -> Result<(), Self::Error> {
        while let Some(event) = self.inbox.dequeue() {
            self.handle(event)?;
        }
        Ok(())
    }
}
