//! Neighbor table and outbound queues
//!
//! Index 0 is reserved for the broadcast pseudo-neighbor, unicast
//! neighbors are created lazily on the first frame to a destination.

use heapless::Deque;
use ieee802154::mac::ExtendedAddress;
use log::debug;

use super::channels::Channels;
use super::config::{NEIGHBOR_COUNT, NEIGHBOR_QUEUE_LEN};
use super::packet::Packet;
use super::phase;

/// Neighbor table index of the broadcast pseudo-neighbor
pub const BROADCAST_ID: usize = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacType {
    /// Wake phase unknown, frames are sent using preamble discovery (t2u)
    PhaseUnknown,
    /// Wake phase locked, frames are sent directly into the neighbor's CP (t2k)
    PhaseKnown,
}

#[derive(Debug)]
pub struct Neighbor {
    pub addr: ExtendedAddress,
    pub mac_type: MacType,

    /// Wake phase relative to the own cycle, valid when `PhaseKnown`
    pub cp_phase: u32,

    /// Public channel the neighbor listens on in its next CP
    pub pub_chan: u8,

    pub queue: Deque<Packet, NEIGHBOR_QUEUE_LEN>,

    /// Consecutive delivery failures (missing acks)
    pub no_ack: u8,

    /// Preamble floods attempted for the current frame
    pub t2u_retry: u8,

    last_used: u32,
}

impl Neighbor {
    fn new(addr: ExtendedAddress, pub_chan: u8) -> Self {
        Self {
            addr,
            mac_type: MacType::PhaseUnknown,
            cp_phase: 0,
            pub_chan,
            queue: Deque::new(),
            no_ack: 0,
            t2u_retry: 0,
            last_used: 0,
        }
    }

    pub fn is_known(&self) -> bool {
        self.mac_type == MacType::PhaseKnown
    }
}

#[derive(Debug)]
pub struct Neighbors {
    slots: [Option<Neighbor>; NEIGHBOR_COUNT],
    /// Last unicast neighbor served, for round robin selection
    last_served: usize,
    /// Neighbor currently being served (its frame held by the transmit machines)
    current: Option<usize>,
    stamp: u32,
}

impl Neighbors {
    pub fn new(pub_chan: u8) -> Self {
        let mut slots: [Option<Neighbor>; NEIGHBOR_COUNT] = Default::default();
        slots[BROADCAST_ID] = Some(Neighbor::new(ExtendedAddress(0xffff_ffff_ffff_ffff), pub_chan));

        Self {
            slots,
            last_served: 0,
            current: None,
            stamp: 0,
        }
    }

    pub fn get(&self, id: usize) -> Option<&Neighbor> {
        self.slots.get(id).and_then(|n| n.as_ref())
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut Neighbor> {
        self.slots.get_mut(id).and_then(|n| n.as_mut())
    }

    /// Find a unicast neighbor by address
    pub fn find(&self, addr: ExtendedAddress) -> Option<usize> {
        self.slots.iter().enumerate().skip(1)
            .find(|(_, n)| matches!(n, Some(n) if n.addr == addr))
            .map(|(i, _)| i)
    }

    pub fn current(&self) -> Option<usize> {
        self.current
    }

    pub fn set_current(&mut self, id: Option<usize>) {
        self.current = id;
    }

    /// Append a frame to a neighbor's queue (`None` for broadcast), creating
    /// the neighbor if required. The frame is handed back if it cannot be queued.
    pub fn enqueue(&mut self, dest: Option<ExtendedAddress>, packet: Packet, pub_chan: u8) -> Result<usize, Packet> {
        let id = match dest {
            None => BROADCAST_ID,
            Some(addr) => match self.find(addr).or_else(|| self.allocate(addr, pub_chan)) {
                Some(id) => id,
                None => return Err(packet),
            },
        };

        self.stamp = self.stamp.wrapping_add(1);
        let stamp = self.stamp;

        match self.get_mut(id) {
            Some(n) => {
                n.last_used = stamp;
                n.queue.push_back(packet).map(|_| id)
            },
            None => Err(packet),
        }
    }

    /// Return a frame to the head of a neighbor's queue
    pub fn requeue(&mut self, id: usize, packet: Packet) -> Result<(), Packet> {
        match self.get_mut(id) {
            Some(n) => n.queue.push_front(packet),
            None => Err(packet),
        }
    }

    // Find a free record, reusing the least recently used idle neighbor if required
    fn allocate(&mut self, addr: ExtendedAddress, pub_chan: u8) -> Option<usize> {
        let current = self.current;

        let id = match self.slots.iter().skip(1).position(|n| n.is_none()) {
            Some(i) => i + 1,
            None => {
                let (i, _) = self.slots.iter().enumerate().skip(1)
                    .filter(|(i, _)| Some(*i) != current)
                    .filter_map(|(i, n)| n.as_ref().map(|n| (i, n)))
                    .filter(|(_, n)| n.queue.is_empty())
                    .min_by_key(|(_, n)| n.last_used)?;

                debug!("Reusing neighbor record {}", i);
                i
            }
        };

        self.slots[id] = Some(Neighbor::new(addr, pub_chan));
        Some(id)
    }

    /// Select the next neighbor to serve and pop its head frame,
    /// broadcast frames first then unicast neighbors in round robin order
    pub fn select_next(&mut self) -> Option<(usize, Packet)> {
        if let Some(p) = self.get_mut(BROADCAST_ID).and_then(|n| n.queue.pop_front()) {
            return Some((BROADCAST_ID, p));
        }

        let mut id = self.last_served;
        for _ in 1..NEIGHBOR_COUNT {
            id += 1;
            if id >= NEIGHBOR_COUNT {
                id = 1;
            }

            if let Some(p) = self.get_mut(id).and_then(|n| n.queue.pop_front()) {
                self.last_served = id;
                return Some((id, p));
            }
        }

        None
    }

    /// Check whether any frames are queued
    pub fn has_pending(&self) -> bool {
        self.slots.iter().flatten().any(|n| !n.queue.is_empty())
    }

    /// Track the per-cycle alternation of each known neighbor's public channel
    pub fn toggle_channels(&mut self, channels: &Channels) {
        for n in self.slots.iter_mut().skip(1).flatten().filter(|n| n.is_known()) {
            n.pub_chan = channels.other(n.pub_chan);
        }
    }

    /// Shift known neighbor phases after the own cycle start moved `backoff` later,
    /// a neighbor whose phase wraps into the previous cycle changes channel parity
    pub fn apply_backoff(&mut self, backoff: u32, cycle_len: u32, channels: &Channels) {
        for n in self.slots.iter_mut().skip(1).flatten().filter(|n| n.is_known()) {
            if n.cp_phase < backoff {
                n.pub_chan = channels.other(n.pub_chan);
            }
            n.cp_phase = phase::shift(n.cp_phase, -(backoff as i64), cycle_len);
        }
    }
}

#[cfg(test)]
mod test {
    use ieee802154::mac::{Address, PanId};

    use super::*;

    const PAN: PanId = PanId(1);

    fn frame(seq: u8) -> Packet {
        let src = Address::Extended(PAN, ExtendedAddress(0x1));
        Packet::data(Address::Extended(PAN, ExtendedAddress(0x2)), src, seq, &[seq]).unwrap()
    }

    #[test]
    fn broadcast_served_first() {
        let mut n = Neighbors::new(26);

        n.enqueue(Some(ExtendedAddress(0xa)), frame(1), 26).unwrap();
        n.enqueue(None, frame(2), 26).unwrap();

        assert_eq!(n.select_next().map(|(i, p)| (i, p.header.seq)), Some((BROADCAST_ID, 2)));
        assert_eq!(n.select_next().map(|(i, p)| (i, p.header.seq)), Some((1, 1)));
        assert_eq!(n.select_next(), None);
    }

    #[test]
    fn unicast_round_robin() {
        let mut n = Neighbors::new(26);

        for s in 0..2 {
            n.enqueue(Some(ExtendedAddress(0xa)), frame(10 + s), 26).unwrap();
            n.enqueue(Some(ExtendedAddress(0xb)), frame(20 + s), 26).unwrap();
        }

        let order: std::vec::Vec<u8> = core::iter::from_fn(|| n.select_next())
            .map(|(_, p)| p.header.seq)
            .collect();
        assert_eq!(order, &[10, 20, 11, 21]);
    }

    #[test]
    fn full_table_reuses_idle_records() {
        let mut n = Neighbors::new(26);

        for i in 1..NEIGHBOR_COUNT as u64 {
            n.enqueue(Some(ExtendedAddress(i)), frame(i as u8), 26).unwrap();
        }

        // All records hold frames
        assert!(n.enqueue(Some(ExtendedAddress(100)), frame(0), 26).is_err());

        // Drain the first neighbor, which can then be reused
        let (id, _) = n.select_next().unwrap();
        assert_eq!(id, 1);
        assert_eq!(n.enqueue(Some(ExtendedAddress(100)), frame(0), 26), Ok(1));
        assert_eq!(n.find(ExtendedAddress(1)), None);
    }

    #[test]
    fn queue_full_returns_frame() {
        let mut n = Neighbors::new(26);
        for s in 0..NEIGHBOR_QUEUE_LEN as u8 {
            n.enqueue(Some(ExtendedAddress(0xa)), frame(s), 26).unwrap();
        }
        assert_eq!(n.enqueue(Some(ExtendedAddress(0xa)), frame(99), 26), Err(frame(99)));
    }

    #[test]
    fn backoff_shifts_known_phases() {
        let channels = Channels::new(26, 11);
        let mut n = Neighbors::new(26);

        let a = n.enqueue(Some(ExtendedAddress(0xa)), frame(0), 26).unwrap();
        let b = n.enqueue(Some(ExtendedAddress(0xb)), frame(0), 26).unwrap();
        for (id, p) in &[(a, 100_000), (b, 10_000)] {
            let nb = n.get_mut(*id).unwrap();
            nb.mac_type = MacType::PhaseKnown;
            nb.cp_phase = *p;
        }

        n.apply_backoff(50_000, 300_000, &channels);

        assert_eq!(n.get(a).unwrap().cp_phase, 50_000);
        assert_eq!(n.get(a).unwrap().pub_chan, 26);
        assert_eq!(n.get(b).unwrap().cp_phase, 260_000);
        assert_eq!(n.get(b).unwrap().pub_chan, 11);

        n.toggle_channels(&channels);
        assert_eq!(n.get(a).unwrap().pub_chan, 11);
        assert_eq!(n.get(b).unwrap().pub_chan, 26);
    }
}
