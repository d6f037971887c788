//! Protocol frames with owned storage
//!
//! Every frame is carried as an IEEE 802.15.4 data frame, with a protocol
//! header identifying the frame kind directly after the MAC header.
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use core::convert::TryFrom;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use heapless::Vec;
use ieee802154::mac::{self, Address, DecodeError, ExtendedAddress, FrameVersion, Header, PanId, Security, ShortAddress};

use crate::MAX_FRAME_LEN;

/// Maximum upper layer payload carried by a data or broadcast frame
pub const MAX_PAYLOAD_LEN: usize = 100;

/// Maximum number of senders listed in a beacon
pub const MAX_BEACON_ENTRIES: usize = 11;

/// Length of link addresses embedded in protocol headers
pub const L2_ADDR_LEN: u8 = 8;

/// Protocol header type tags (first byte after the MAC header)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Data = 0x01,
    Preamble = 0x02,
    PreambleAck = 0x03,
    Beacon = 0x04,
    Broadcast = 0x05,
    Announce = 0x06,
}

impl TryFrom<u8> for FrameType {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        let t = match v {
            0x01 => FrameType::Data,
            0x02 => FrameType::Preamble,
            0x03 => FrameType::PreambleAck,
            0x04 => FrameType::Beacon,
            0x05 => FrameType::Broadcast,
            0x06 => FrameType::Announce,
            _ => return Err(DecodeError::InvalidFrameType(v)),
        };
        Ok(t)
    }
}

/// Logical frame kinds, a data frame with the pending bit set
/// is reported as [`FrameKind::DataPending`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Preamble,
    PreambleAck,
    Data,
    DataPending,
    Beacon,
    Broadcast,
    SubchannelAnnounce,
}

/// Slot assignment carried in a beacon, as parallel (address, slot count) lists
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Beacon {
    pub sub_channel: u8,
    pub senders: Vec<ExtendedAddress, MAX_BEACON_ENTRIES>,
    pub slots: Vec<u8, MAX_BEACON_ENTRIES>,
}

impl Beacon {
    pub fn new(sub_channel: u8) -> Self {
        Self { sub_channel, ..Default::default() }
    }

    /// Append an allocation, returns false when the beacon is full
    pub fn push(&mut self, sender: ExtendedAddress, slots: u8) -> bool {
        if self.senders.push(sender).is_err() {
            return false;
        }
        if self.slots.push(slots).is_err() {
            self.senders.pop();
            return false;
        }
        true
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }

    pub fn total_slots(&self) -> u32 {
        self.slots.iter().map(|s| *s as u32).sum()
    }
}

/// Protocol header contents
#[derive(Debug, Clone, PartialEq)]
pub enum FrameContent {
    Data { queue_indicator: u8 },
    Preamble { dst: ExtendedAddress },
    PreambleAck { dst: ExtendedAddress, phase: u32 },
    Beacon(Beacon),
    Broadcast { seq: u8 },
    Announce { sub_channel: u8 },
}

/// Packet object with owned storage, an IEEE 802.15.4 data frame header
/// followed by the protocol header and payload
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub header: Header,
    pub content: FrameContent,
    payload: Vec<u8, MAX_PAYLOAD_LEN>,
}

/// Broadcast link address for the provided PAN
pub fn broadcast(pan_id: PanId) -> Address {
    Address::Short(pan_id, ShortAddress::broadcast())
}

/// Check whether an address is a broadcast address
pub fn is_broadcast(addr: &Address) -> bool {
    match addr {
        Address::Short(_, a) => *a == ShortAddress::broadcast(),
        Address::Extended(_, a) => *a == ExtendedAddress::broadcast(),
        Address::None => false,
    }
}

// The source PAN is elided whenever both addresses share one
fn pan_id_compress(h: &Header) -> bool {
    match (h.destination.pan_id(), h.source.pan_id()) {
        (Some(d), Some(s)) => d == s,
        _ => false,
    }
}

impl Packet {
    fn new(destination: Address, source: Address, seq: u8, content: FrameContent) -> Self {
        let mut header = Header {
            frame_type: mac::FrameType::Data,
            security: Security::None,
            frame_pending: false,
            ack_request: false,
            pan_id_compress: false,
            version: FrameVersion::Ieee802154_2006,
            destination,
            source,
            seq,
        };
        header.pan_id_compress = pan_id_compress(&header);

        Packet {
            header,
            content,
            payload: Vec::new(),
        }
    }

    /// Create a data packet, returns `None` if the payload does not fit in a frame
    pub fn data(dest: Address, source: Address, seq: u8, data: &[u8]) -> Option<Packet> {
        let payload = Vec::from_slice(data).ok()?;

        let mut p = Self::new(dest, source, seq, FrameContent::Data{ queue_indicator: 0 });
        p.header.ack_request = !is_broadcast(&dest);
        p.payload = payload;

        Some(p)
    }

    pub fn preamble(pan_id: PanId, source: Address, seq: u8, dst: ExtendedAddress) -> Packet {
        Self::new(broadcast(pan_id), source, seq, FrameContent::Preamble{ dst })
    }

    pub fn preamble_ack(pan_id: PanId, source: Address, seq: u8, dst: ExtendedAddress, phase: u32) -> Packet {
        Self::new(broadcast(pan_id), source, seq, FrameContent::PreambleAck{ dst, phase })
    }

    pub fn beacon(pan_id: PanId, source: Address, seq: u8, beacon: Beacon) -> Packet {
        Self::new(broadcast(pan_id), source, seq, FrameContent::Beacon(beacon))
    }

    pub fn announce(pan_id: PanId, source: Address, seq: u8, sub_channel: u8) -> Packet {
        Self::new(broadcast(pan_id), source, seq, FrameContent::Announce{ sub_channel })
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn kind(&self) -> FrameKind {
        match &self.content {
            FrameContent::Data{..} if self.header.frame_pending => FrameKind::DataPending,
            FrameContent::Data{..} => FrameKind::Data,
            FrameContent::Preamble{..} => FrameKind::Preamble,
            FrameContent::PreambleAck{..} => FrameKind::PreambleAck,
            FrameContent::Beacon(_) => FrameKind::Beacon,
            FrameContent::Broadcast{..} => FrameKind::Broadcast,
            FrameContent::Announce{..} => FrameKind::SubchannelAnnounce,
        }
    }

    /// Extended source address (all protocol frames are sent with one)
    pub fn source(&self) -> Option<ExtendedAddress> {
        match self.header.source {
            Address::Extended(_, a) => Some(a),
            _ => None,
        }
    }

    /// Check whether the link destination is the provided address
    pub fn is_for(&self, addr: ExtendedAddress) -> bool {
        matches!(self.header.destination, Address::Extended(_, a) if a == addr)
    }

    /// Update the queue indicator of a data frame, marking the frame
    /// as pending when further frames are queued
    pub fn set_queue_indicator(&mut self, queue_indicator: u8) {
        if let FrameContent::Data{ .. } = self.content {
            self.content = FrameContent::Data{ queue_indicator };
            self.header.frame_pending = queue_indicator > 0;
        }
    }

    /// Rewrite a queued frame as a broadcast with the provided sequence number
    pub fn set_broadcast(&mut self, seq: u8) {
        self.content = FrameContent::Broadcast{ seq };
        self.header.ack_request = false;
        self.header.frame_pending = false;
    }

    pub fn encode(&self, buf: &mut [u8; MAX_FRAME_LEN]) -> usize {
        let mut header = self.header;
        header.pan_id_compress = pan_id_compress(&header);

        // At most 23 bytes, always fits
        let len = header.encode(&mut buf[..]);

        let mut w = Writer{ buf, idx: len };

        match &self.content {
            FrameContent::Data{ queue_indicator } => {
                w.u8(FrameType::Data as u8);
                w.u8(*queue_indicator);
            },
            FrameContent::Preamble{ dst } => {
                w.u8(FrameType::Preamble as u8);
                w.l2_addr(*dst);
            },
            FrameContent::PreambleAck{ dst, phase } => {
                w.u8(FrameType::PreambleAck as u8);
                w.l2_addr(*dst);
                let mut b = [0u8; 4];
                LittleEndian::write_u32(&mut b, *phase);
                w.put(&b);
            },
            FrameContent::Beacon(beacon) => {
                w.u8(FrameType::Beacon as u8);
                w.u8(beacon.sub_channel);
                w.u8(beacon.len() as u8);
                for s in beacon.senders.iter() {
                    let mut b = [0u8; 8];
                    BigEndian::write_u64(&mut b, s.0);
                    w.put(&b);
                }
                w.put(&beacon.slots);
            },
            FrameContent::Broadcast{ seq } => {
                w.u8(FrameType::Broadcast as u8);
                w.u8(*seq);
            },
            FrameContent::Announce{ sub_channel } => {
                w.u8(FrameType::Announce as u8);
                w.u8(*sub_channel);
            },
        }

        w.put(&self.payload);

        w.idx
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let (header, len) = Header::decode(buf)?;

        // Protocol frames are only ever carried in data frames
        if header.frame_type != mac::FrameType::Data {
            return Err(DecodeError::InvalidFrameType(header.frame_type as u8));
        }

        let mut r = Reader{ buf: &buf[len..], idx: 0 };

        let frame_type = FrameType::try_from(r.u8()?)?;

        let content = match frame_type {
            FrameType::Data => FrameContent::Data{ queue_indicator: r.u8()? },
            FrameType::Preamble => FrameContent::Preamble{ dst: r.l2_addr()? },
            FrameType::PreambleAck => {
                let dst = r.l2_addr()?;
                let phase = LittleEndian::read_u32(r.take(4)?);
                FrameContent::PreambleAck{ dst, phase }
            },
            FrameType::Beacon => {
                let mut beacon = Beacon::new(r.u8()?);
                let n = r.u8()?;
                if n as usize > MAX_BEACON_ENTRIES {
                    return Err(DecodeError::InvalidValue);
                }

                let ids = r.take(n as usize * 8)?;
                let slots = r.take(n as usize)?;

                for (id, s) in ids.chunks(8).zip(slots.iter()) {
                    beacon.push(ExtendedAddress(BigEndian::read_u64(id)), *s);
                }

                FrameContent::Beacon(beacon)
            },
            FrameType::Broadcast => FrameContent::Broadcast{ seq: r.u8()? },
            FrameType::Announce => FrameContent::Announce{ sub_channel: r.u8()? },
        };

        // Only data and broadcast frames carry an upper layer payload
        let payload = match frame_type {
            FrameType::Data | FrameType::Broadcast => {
                Vec::from_slice(r.rest()).map_err(|_| DecodeError::InvalidValue)?
            },
            _ => Vec::new(),
        };

        Ok(Packet{ header, content, payload })
    }
}

struct Writer<'a> {
    buf: &'a mut [u8; MAX_FRAME_LEN],
    idx: usize,
}

impl <'a> Writer<'a> {
    // Frame contents are bounded on construction, overflow is truncated rather than panicking
    fn put(&mut self, data: &[u8]) {
        let end = (self.idx + data.len()).min(MAX_FRAME_LEN);
        let n = end - self.idx;
        self.buf[self.idx..end].copy_from_slice(&data[..n]);
        self.idx = end;
    }

    fn u8(&mut self, v: u8) {
        self.put(&[v]);
    }

    fn l2_addr(&mut self, a: ExtendedAddress) {
        let mut b = [0u8; 8];
        BigEndian::write_u64(&mut b, a.0);
        self.put(&b);
        self.u8(L2_ADDR_LEN);
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    idx: usize,
}

impl <'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let d = self.buf.get(self.idx..self.idx + n).ok_or(DecodeError::NotEnoughBytes)?;
        self.idx += n;
        Ok(d)
    }

    fn rest(&mut self) -> &'a [u8] {
        let d = &self.buf[self.idx.min(self.buf.len())..];
        self.idx = self.buf.len();
        d
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn l2_addr(&mut self) -> Result<ExtendedAddress, DecodeError> {
        let a = BigEndian::read_u64(self.take(8)?);
        match self.u8()? {
            L2_ADDR_LEN => Ok(ExtendedAddress(a)),
            _ => Err(DecodeError::InvalidValue),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const PAN: PanId = PanId(0x0100);

    fn src() -> Address {
        Address::Extended(PAN, ExtendedAddress(0x0011_2233_4455_6677))
    }

    #[test]
    fn preamble_ack_layout() {
        let p = Packet::preamble_ack(PAN, src(), 7, ExtendedAddress(0x0102_0304_0506_0708), 150_000);

        let mut buff = [0u8; MAX_FRAME_LEN];
        let n = p.encode(&mut buff);

        // fc (2) + seq (1) + dst pan (2) + short dst (2) + ext src (8)
        let h = 15;
        assert_eq!(n, h + 1 + 9 + 4);

        assert_eq!(buff[2], 7);
        assert_eq!(&buff[3..7], &[0x00, 0x01, 0xff, 0xff]);
        assert_eq!(buff[h], FrameType::PreambleAck as u8);
        assert_eq!(&buff[h+1..h+9], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(buff[h+9], L2_ADDR_LEN);
        assert_eq!(&buff[h+10..h+14], &150_000u32.to_le_bytes());

        let d = Packet::decode(&buff[..n]).unwrap();
        assert_eq!(d, p);
        assert_eq!(d.kind(), FrameKind::PreambleAck);
    }

    #[test]
    fn beacon_lists_ids_then_slots() {
        let mut b = Beacon::new(14);
        assert!(b.push(ExtendedAddress(0xaa), 3));
        assert!(b.push(ExtendedAddress(0xbb), 2));

        let p = Packet::beacon(PAN, src(), 1, b.clone());

        let mut buff = [0u8; MAX_FRAME_LEN];
        let n = p.encode(&mut buff);

        let body = &buff[15..n];
        assert_eq!(&body[..3], &[FrameType::Beacon as u8, 14, 2]);
        assert_eq!(body[3 + 7], 0xaa);
        assert_eq!(body[3 + 15], 0xbb);
        assert_eq!(&body[19..], &[3, 2]);

        let d = Packet::decode(&buff[..n]).unwrap();
        assert_eq!(d.content, FrameContent::Beacon(b));
    }

    #[test]
    fn data_pending_uses_frame_pending_bit() {
        let dest = Address::Extended(PAN, ExtendedAddress(0xbeef));
        let mut p = Packet::data(dest, src(), 3, &[1, 2, 3]).unwrap();
        assert!(p.header.ack_request);
        assert_eq!(p.kind(), FrameKind::Data);

        p.set_queue_indicator(2);

        let mut buff = [0u8; MAX_FRAME_LEN];
        let n = p.encode(&mut buff);
        assert!(buff[0] & (1 << 4) != 0);

        let d = Packet::decode(&buff[..n]).unwrap();
        assert_eq!(d.kind(), FrameKind::DataPending);
        assert_eq!(d.payload(), &[1, 2, 3]);
        assert_eq!(d.content, FrameContent::Data{ queue_indicator: 2 });
        assert!(d.is_for(ExtendedAddress(0xbeef)));
    }

    #[test]
    fn decode_rejects_malformed() {
        let p = Packet::announce(PAN, src(), 0, 13);
        let mut buff = [0u8; MAX_FRAME_LEN];
        let n = p.encode(&mut buff);

        assert_eq!(Packet::decode(&buff[..n - 1]), Err(DecodeError::NotEnoughBytes));

        buff[15] = 0x7f;
        assert_eq!(Packet::decode(&buff[..n]), Err(DecodeError::InvalidFrameType(0x7f)));

        // Acknowledgement frame type
        buff[0] = (buff[0] & !0b111) | 0b010;
        assert_eq!(Packet::decode(&buff[..n]), Err(DecodeError::InvalidFrameType(0b010)));

        // Security enabled
        buff[0] = (buff[0] & !0b111) | 0b001 | (1 << 3);
        assert_eq!(Packet::decode(&buff[..n]), Err(DecodeError::SecurityNotSupported));
    }

    #[test]
    fn header_interoperates_with_ieee802154() {
        let dest = Address::Extended(PAN, ExtendedAddress(0xbeef));
        let p = Packet::data(dest, src(), 9, &[4, 5]).unwrap();

        let mut buff = [0u8; MAX_FRAME_LEN];
        let n = p.encode(&mut buff);

        let (h, len) = Header::decode(&buff[..n]).unwrap();
        assert_eq!(h.seq, 9);
        assert_eq!(h.destination, dest);
        assert_eq!(h.source, src());
        assert!(h.ack_request && h.pan_id_compress);
        assert_eq!(h.version, FrameVersion::Ieee802154_2006);
        assert_eq!(buff[len], FrameType::Data as u8);

        // Frames built with the header codec directly are accepted
        let header = Header {
            frame_type: mac::FrameType::Data,
            security: Security::None,
            frame_pending: false,
            ack_request: false,
            pan_id_compress: false,
            version: FrameVersion::Ieee802154_2003,
            destination: broadcast(PanId(0x0200)),
            source: Address::Extended(PanId(0x0300), ExtendedAddress(0x42)),
            seq: 3,
        };
        let mut raw = [0u8; MAX_FRAME_LEN];
        let mut len = header.encode(&mut raw);
        raw[len..len + 2].copy_from_slice(&[FrameType::Announce as u8, 17]);
        len += 2;

        let d = Packet::decode(&raw[..len]).unwrap();
        assert_eq!(d.header, header);
        assert_eq!(d.content, FrameContent::Announce{ sub_channel: 17 });
        assert_eq!(d.source(), Some(ExtendedAddress(0x42)));
    }

    #[test]
    fn oversized_payload() {
        let dest = broadcast(PAN);
        assert!(Packet::data(dest, src(), 0, &[0u8; MAX_PAYLOAD_LEN + 1]).is_none());

        let p = Packet::data(dest, src(), 0, &[0u8; MAX_PAYLOAD_LEN]).unwrap();
        assert!(!p.header.ack_request);
    }
}
