//! Rendezvous and sub-channel bookkeeping (2.4 GHz O-QPSK channel numbers)

/// Default public (rendezvous) channels
pub const DEFAULT_PUB_CHANNEL_1: u8 = 26;
pub const DEFAULT_PUB_CHANNEL_2: u8 = 11;

/// First channel available for private sub-channels
pub const SUB_CHANNEL_BASE: u8 = 12;

/// Number of channels available for private sub-channels (12..=25)
pub const SUB_CHANNEL_COUNT: u8 = 14;

/// Channel state of a node
#[derive(Debug, Clone, PartialEq)]
pub struct Channels {
    pub pub_1: u8,
    pub pub_2: u8,

    /// Public channel listened on during the current cycle
    pub current: u8,

    /// Private sub-channel used for vTDMA reception
    pub sub_channel: u8,

    /// Sub-channels announced by neighbors, bit `n` marks channel `11 + n`
    occupied: u16,
}

impl Channels {
    pub fn new(pub_1: u8, pub_2: u8) -> Self {
        Self {
            pub_1,
            pub_2,
            current: pub_1,
            sub_channel: SUB_CHANNEL_BASE,
            occupied: 0,
        }
    }

    /// The other public channel
    pub fn other(&self, ch: u8) -> u8 {
        if ch == self.pub_1 {
            self.pub_2
        } else {
            self.pub_1
        }
    }

    /// Switch the listen channel for the next cycle
    pub fn toggle(&mut self) {
        self.current = self.other(self.current);
    }

    pub fn clear_occupied(&mut self) {
        self.occupied = 0;
    }

    /// Record a sub-channel announced by a neighbor
    pub fn mark_occupied(&mut self, ch: u8) {
        if (SUB_CHANNEL_BASE..SUB_CHANNEL_BASE + SUB_CHANNEL_COUNT).contains(&ch) {
            self.occupied |= 1 << (ch - 11);
        }
    }

    pub fn is_occupied(&self, ch: u8) -> bool {
        ch >= 11 && ch < 27 && self.occupied & (1 << (ch - 11)) != 0
    }

    /// Select a sub-channel from the node id, stepping past channels
    /// already announced by neighbors (if all are occupied the last
    /// candidate is used regardless)
    pub fn choose_sub_channel(&mut self, own_id: u16) -> u8 {
        let mut id = own_id;
        let mut ch = SUB_CHANNEL_BASE + (id % SUB_CHANNEL_COUNT as u16) as u8;

        for _ in 0..SUB_CHANNEL_COUNT {
            if !self.is_occupied(ch) {
                break;
            }
            id = id.wrapping_add(1);
            ch = SUB_CHANNEL_BASE + (id % SUB_CHANNEL_COUNT as u16) as u8;
        }

        self.sub_channel = ch;
        ch
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn toggle_between_public_channels() {
        let mut c = Channels::new(26, 11);
        assert_eq!(c.current, 26);
        c.toggle();
        assert_eq!(c.current, 11);
        c.toggle();
        assert_eq!(c.current, 26);
        assert_eq!(c.other(11), 26);
    }

    #[test]
    fn sub_channel_skips_occupied() {
        let mut c = Channels::new(26, 11);

        // 12 + (30 % 14) = 14
        assert_eq!(c.choose_sub_channel(30), 14);

        c.mark_occupied(14);
        c.mark_occupied(15);
        assert_eq!(c.choose_sub_channel(30), 16);

        // Wraps back to the start of the range
        c.clear_occupied();
        c.mark_occupied(25);
        assert_eq!(c.choose_sub_channel(13), 12);

        // Public channels are never marked
        c.mark_occupied(26);
        assert!(!c.is_occupied(26));
    }
}
