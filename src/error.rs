
use ieee802154::mac::{Address, DecodeError};

use crate::gomach::packet::Packet;

/// Basic MAC errors
#[derive(Debug, Clone, PartialEq)]
pub enum CoreError<E> {
    /// Outbound queue (or neighbor table) full, the packet is handed back
    QueueFull(Packet),

    /// Payload does not fit in a single frame
    PayloadLength(usize),

    /// Decoding error
    DecodeError(DecodeError),

    /// Destination is not an extended or broadcast address
    InvalidAddress(Address),

    /// No frame held for the current transmission
    NoPacket,

    /// Wrapper for unhandled / underlying radio errors
    Radio(E),
}

impl <E> From<DecodeError> for CoreError<E> {
    fn from(e: DecodeError) -> Self {
        CoreError::DecodeError(e)
    }
}
