//! GoMacH crate prelude
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

pub use crate::{Radio, RawPacket, RxInfo};

pub use crate::Mac as MacIf;

pub use crate::error::CoreError;
pub use crate::timer::{Alarm, Timer as MacTimer};

pub use crate::base::{Base as MacBase, BaseState as MacBaseState, LinkOptions};

pub use crate::gomach::{self, Config as GoMachConfig, Event, EventQueue, EventProducer, EventConsumer, Mac as GoMach, MacState, MacStats, TxFeedback, TxOutcome};

pub use ieee802154::mac::{Address as MacAddress, PanId, ShortAddress, ExtendedAddress};
