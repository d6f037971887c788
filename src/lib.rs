//! Duty-cycled, traffic adaptive MAC for low power wireless mesh networks
//!
//! Nodes sleep for most of each superframe, waking briefly for a contention
//! period (CP) at their own phase. Senders learn the phase of each neighbor
//! (via a preamble / preamble-ack exchange) so that later frames can be sent
//! directly into the neighbor's CP, and receivers with bursty traffic hand out
//! virtual TDMA slots on a private sub-channel via beacons.
//!
//! See [`gomach::Mac`] for the protocol engine.
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

#![no_std]

use core::fmt::Debug;

use radio::{Busy, Channel, RadioState, State, Transmit};

#[cfg(any(test, feature="std"))]
extern crate std;

pub mod timer;

pub mod base;

pub mod error;

pub mod gomach;

#[cfg(any(test, feature="mocks"))]
pub mod mock;

pub mod prelude;

use base::LinkOptions;
use ieee802154::mac::Address;

/// Timestamps are 32-bit wrapping microsecond counter values
pub type Tick = u32;

/// Maximum IEEE 802.15.4 PSDU length (excluding the FCS, which is left to the radio)
pub const MAX_FRAME_LEN: usize = 127;

/// Statically sized packet buffer, as produced by the radio driver on reception
#[derive(Clone, PartialEq, Debug)]
pub struct RawPacket {
    pub data: [u8; MAX_FRAME_LEN],
    pub len: usize,
    pub rssi: i16,
    pub lqi: u8,
}

impl Default for RawPacket {
    fn default() -> Self {
        Self {
            data: [0u8; MAX_FRAME_LEN],
            len: 0,
            rssi: 0,
            lqi: 0,
        }
    }
}

impl RawPacket {
    /// Copy a received frame into a new buffer, returns `None` for oversized frames
    pub fn new(data: &[u8], rssi: i16, lqi: u8) -> Option<Self> {
        if data.len() > MAX_FRAME_LEN {
            return None;
        }

        let mut p = Self { len: data.len(), rssi, lqi, ..Default::default() };
        p.data[..data.len()].copy_from_slice(data);

        Some(p)
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..self.len]
    }
}

/// Information attached to frames handed to the upper layer
#[derive(Debug, Clone, PartialEq)]
pub struct RxInfo {
    pub source: Address,
    pub rssi: i16,
    pub lqi: u8,
}

/// Radio interface combines `radio` traits with MAC level link options
pub trait Radio<S: RadioState, E: Debug>:
    State<State=S, Error=E> + Busy<Error=E> + Channel<Channel=u8, Error=E> + Transmit<Error=E> + LinkOptions<Error=E> {}

/// Default Radio impl for radio devices
impl <T, S: RadioState, E: Debug> Radio<S, E> for T where
    T: State<State=S, Error=E> + Busy<Error=E> + Channel<Channel=u8, Error=E> + Transmit<Error=E> + LinkOptions<Error=E>,
{}

/// Generic MAC interface exposed to upper layers
pub trait Mac<Address> {
    type Error;

    /// Enqueue a payload for transmission to the provided destination
    fn transmit(&mut self, dest: Address, data: &[u8]) -> Result<(), Self::Error>;

    /// Fetch a received payload (if available), returning the length and receive information
    fn receive(&mut self, data: &mut [u8]) -> Result<Option<(usize, RxInfo)>, Self::Error>;

    /// Check whether the MAC is busy with an exchange
    fn busy(&mut self) -> Result<bool, Self::Error>;

    /// Process pending events, driving the protocol until it is waiting again
    fn tick(&mut self) -> Result<(), Self::Error>;
}
