//! Events delivered to the MAC from interrupt context
//!
//! Radio and timer interrupts only enqueue an [`Event`] using the
//! [`EventProducer`] half of an [`EventQueue`], all processing
//! happens in [`Mac::tick`](crate::Mac::tick).

use heapless::spsc::{Consumer, Producer, Queue};
use strum::Display;

use crate::timer::Alarm;
use crate::RawPacket;

/// Event inbox size (the queue holds one less than this)
pub const INBOX_LEN: usize = 16;

pub type EventQueue = Queue<Event, INBOX_LEN>;
pub type EventProducer<'a> = Producer<'a, Event, INBOX_LEN>;
pub type EventConsumer<'a> = Consumer<'a, Event, INBOX_LEN>;

/// Transmission result reported by the radio
#[derive(Debug, Clone, Copy, PartialEq, Display)]
pub enum TxFeedback {
    Success,
    NoAck,
    /// Channel busy (CSMA failure)
    Busy,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Start of frame detected
    RxStarted,
    /// Frame received
    RxComplete(RawPacket),
    /// Frame dropped by the driver for lack of a receive buffer
    RxNoBuffer,
    /// Transmission complete
    TxComplete(TxFeedback),
    /// Timer alarm expired
    Alarm(Alarm),
}
