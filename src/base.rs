//! Radio wrapper, tracks radio state and duty cycle for the MAC
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use core::{fmt::Debug, marker::PhantomData};

use log::{debug, trace};

use radio::RadioState;

use crate::{error::CoreError, gomach::packet::Packet, Radio, Tick, MAX_FRAME_LEN};

/// Link level radio options not covered by the `radio` traits
pub trait LinkOptions {
    type Error: Debug;

    /// Enable or disable automatic acknowledgement of received frames
    fn set_autoack(&mut self, enabled: bool) -> Result<(), Self::Error>;

    /// Enable or disable waiting for acknowledgements on transmission
    fn set_ack_request(&mut self, enabled: bool) -> Result<(), Self::Error>;

    /// Enable or disable CSMA prior to transmission
    fn set_csma(&mut self, enabled: bool) -> Result<(), Self::Error>;

    /// Fully re-initialise the radio
    fn reinit(&mut self) -> Result<(), Self::Error>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BaseState {
    Idle,
    Transmitting,
    Sleeping,
}

/// Radio on-time accounting
#[derive(Debug, Clone, PartialEq, Default)]
struct DutyCycle {
    last: Tick,
    awake: bool,
    awake_total: u64,
    elapsed_total: u64,
}

impl DutyCycle {
    fn update(&mut self, now: Tick, awake: bool) {
        let delta = now.wrapping_sub(self.last) as u64;

        self.elapsed_total += delta;
        if self.awake {
            self.awake_total += delta;
        }

        self.last = now;
        self.awake = awake;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Base<R, S, E> {
    radio: R,
    state: BaseState,
    channel: u8,
    rx_started: bool,
    duty: DutyCycle,
    _radio_state: PhantomData<S>,
    _radio_err: PhantomData<E>,
}

impl <R, S, E> Base<R, S, E>
where
    R: Radio<S, E>,
    S: RadioState,
    E: Debug,
{
    pub fn new(radio: R, now: Tick) -> Self {
        Self {
            radio,
            state: BaseState::Idle,
            channel: 0,
            rx_started: false,
            duty: DutyCycle { last: now, awake: true, ..Default::default() },
            _radio_state: PhantomData,
            _radio_err: PhantomData,
        }
    }

    pub fn state(&self) -> BaseState {
        self.state
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    /// Set the radio to idle (listening)
    pub fn idle(&mut self, now: Tick) -> Result<(), CoreError<E>> {
        self.radio.set_state(S::idle()).map_err(CoreError::Radio)?;
        self.duty.update(now, true);
        self.state = BaseState::Idle;
        Ok(())
    }

    /// Put the radio to sleep
    pub fn sleep(&mut self, now: Tick) -> Result<(), CoreError<E>> {
        self.radio.set_state(S::sleep()).map_err(CoreError::Radio)?;
        self.duty.update(now, false);
        self.state = BaseState::Sleeping;
        self.rx_started = false;
        Ok(())
    }

    pub fn set_channel(&mut self, channel: u8) -> Result<(), CoreError<E>> {
        trace!("Set channel {}", channel);
        self.radio.set_channel(&channel).map_err(CoreError::Radio)?;
        self.channel = channel;
        Ok(())
    }

    pub fn set_autoack(&mut self, enabled: bool) -> Result<(), CoreError<E>> {
        self.radio.set_autoack(enabled).map_err(CoreError::Radio)
    }

    pub fn set_ack_request(&mut self, enabled: bool) -> Result<(), CoreError<E>> {
        self.radio.set_ack_request(enabled).map_err(CoreError::Radio)
    }

    /// Encode and start transmission of a packet, completion is signalled
    /// by a transmit complete event
    pub fn transmit(&mut self, now: Tick, packet: &Packet, csma: bool) -> Result<(), CoreError<E>> {
        let mut buff = [0u8; MAX_FRAME_LEN];
        let n = packet.encode(&mut buff);

        trace!("Transmit {:?} ({} bytes, csma: {}) at {} us", packet.kind(), n, csma, now);

        self.radio.set_csma(csma).map_err(CoreError::Radio)?;
        self.radio.start_transmit(&buff[..n]).map_err(CoreError::Radio)?;

        if self.state == BaseState::Sleeping {
            self.duty.update(now, true);
        }
        self.state = BaseState::Transmitting;

        Ok(())
    }

    /// Mark the radio as having started receiving a frame
    pub fn set_rx_started(&mut self, started: bool) {
        self.rx_started = started;
    }

    pub fn rx_started(&self) -> bool {
        self.rx_started
    }

    /// Check whether a reception is in progress
    pub fn is_receiving(&mut self) -> Result<bool, CoreError<E>> {
        if self.rx_started {
            return Ok(true);
        }

        match self.state {
            BaseState::Idle => self.radio.is_busy().map_err(CoreError::Radio),
            _ => Ok(false),
        }
    }

    /// Re-initialise the radio, leaving it idle
    pub fn reinit(&mut self, now: Tick) -> Result<(), CoreError<E>> {
        debug!("Re-initialising radio");
        self.radio.reinit().map_err(CoreError::Radio)?;
        self.rx_started = false;
        self.duty.update(now, true);
        self.state = BaseState::Idle;
        Ok(())
    }

    /// Radio on-time since start-up, in per-mille
    pub fn duty_cycle(&mut self, now: Tick) -> u32 {
        let awake = self.duty.awake;
        self.duty.update(now, awake);

        match self.duty.elapsed_total {
            0 => 1000,
            e => (self.duty.awake_total * 1000 / e) as u32,
        }
    }
}
