//! Mock radio implementation to assist with testing
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use std::sync::{Arc, Mutex};
use std::vec::Vec;

use crate::base::LinkOptions;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MockState {
    Idle,
    Sleep,
}

impl radio::RadioState for MockState {
    fn idle() -> Self {
        MockState::Idle
    }

    fn sleep() -> Self {
        MockState::Sleep
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MockError {
    Transmit,
    Reinit,
}

/// Transmitted frame with the link settings in use at the time
#[derive(Debug, Clone, PartialEq)]
pub struct Sent {
    pub data: Vec<u8>,
    pub channel: u8,
    pub csma: bool,
    pub ack_request: bool,
}

#[derive(Debug)]
struct Inner {
    state: MockState,
    channel: u8,
    autoack: bool,
    ack_request: bool,
    csma: bool,
    busy: bool,
    fail_transmit: bool,
    fail_reinit: bool,
    reinits: u32,
    sent: Vec<Sent>,
}

/// Shared state mock radio, clones observe the same radio
#[derive(Debug, Clone)]
pub struct MockRadio(Arc<Mutex<Inner>>);

impl Default for MockRadio {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRadio {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(Inner {
            state: MockState::Idle,
            channel: 0,
            autoack: false,
            ack_request: false,
            csma: false,
            busy: false,
            fail_transmit: false,
            fail_reinit: false,
            reinits: 0,
            sent: Vec::new(),
        })))
    }

    pub fn state(&self) -> MockState {
        self.0.lock().unwrap().state
    }

    pub fn channel(&self) -> u8 {
        self.0.lock().unwrap().channel
    }

    pub fn autoack(&self) -> bool {
        self.0.lock().unwrap().autoack
    }

    pub fn reinits(&self) -> u32 {
        self.0.lock().unwrap().reinits
    }

    pub fn set_busy(&self, busy: bool) {
        self.0.lock().unwrap().busy = busy;
    }

    pub fn fail_transmit(&self, fail: bool) {
        self.0.lock().unwrap().fail_transmit = fail;
    }

    pub fn fail_reinit(&self, fail: bool) {
        self.0.lock().unwrap().fail_reinit = fail;
    }

    /// Take the frames transmitted since the last call
    pub fn take_sent(&self) -> Vec<Sent> {
        core::mem::take(&mut self.0.lock().unwrap().sent)
    }
}

impl radio::State for MockRadio {
    type State = MockState;
    type Error = MockError;

    fn set_state(&mut self, state: Self::State) -> Result<(), Self::Error> {
        self.0.lock().unwrap().state = state;
        Ok(())
    }

    fn get_state(&mut self) -> Result<Self::State, Self::Error> {
        Ok(self.0.lock().unwrap().state)
    }
}

impl radio::Busy for MockRadio {
    type Error = MockError;

    fn is_busy(&mut self) -> Result<bool, Self::Error> {
        Ok(self.0.lock().unwrap().busy)
    }
}

impl radio::Channel for MockRadio {
    type Channel = u8;
    type Error = MockError;

    fn set_channel(&mut self, channel: &Self::Channel) -> Result<(), Self::Error> {
        self.0.lock().unwrap().channel = *channel;
        Ok(())
    }
}

impl radio::Transmit for MockRadio {
    type Error = MockError;

    fn start_transmit(&mut self, data: &[u8]) -> Result<(), Self::Error> {
        let mut i = self.0.lock().unwrap();
        if i.fail_transmit {
            return Err(MockError::Transmit);
        }

        let sent = Sent {
            data: data.to_vec(),
            channel: i.channel,
            csma: i.csma,
            ack_request: i.ack_request,
        };
        i.sent.push(sent);

        Ok(())
    }

    fn check_transmit(&mut self) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

impl LinkOptions for MockRadio {
    type Error = MockError;

    fn set_autoack(&mut self, enabled: bool) -> Result<(), Self::Error> {
        self.0.lock().unwrap().autoack = enabled;
        Ok(())
    }

    fn set_ack_request(&mut self, enabled: bool) -> Result<(), Self::Error> {
        self.0.lock().unwrap().ack_request = enabled;
        Ok(())
    }

    fn set_csma(&mut self, enabled: bool) -> Result<(), Self::Error> {
        self.0.lock().unwrap().csma = enabled;
        Ok(())
    }

    fn reinit(&mut self) -> Result<(), Self::Error> {
        let mut i = self.0.lock().unwrap();
        i.reinits += 1;
        match i.fail_reinit {
            true => Err(MockError::Reinit),
            false => Ok(()),
        }
    }
}
