
use ieee802154::mac::PanId;

use super::channels::{DEFAULT_PUB_CHANNEL_1, DEFAULT_PUB_CHANNEL_2};

/// Number of neighbor records, including the broadcast pseudo-neighbor
pub const NEIGHBOR_COUNT: usize = 8;

/// Outbound frames queued per neighbor
pub const NEIGHBOR_QUEUE_LEN: usize = 8;

/// Duplicate detection cache entries
pub const DUPCHK_SIZE: usize = 8;

/// Queue depth report entries tracked for beacon slot allocation
pub const SLOSCH_UNIT_COUNT: usize = 11;

/// Concurrent protocol timeouts
pub const TIMEOUT_COUNT: usize = 6;

/// Received frames awaiting processing by the active state machine
pub const RX_QUEUE_LEN: usize = 8;

/// Frames awaiting collection by the upper layer
pub const DISPATCH_QUEUE_LEN: usize = 8;

/// Transmission outcomes awaiting collection by the upper layer
pub const TX_OUTCOME_LEN: usize = 8;

/// Protocol configuration, all durations are in microseconds
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub pan_id: PanId,

    /// Duration of a full duty cycle (superframe)
    pub superframe_duration: u32,

    /// Base duration of the contention period (CP)
    pub cp_duration: u32,

    /// Upper bound of the random extension applied to the CP end,
    /// desynchronises neighbors that happen to share a phase
    pub cp_random_end: u32,

    /// Absolute limit on the CP, including all extensions
    pub cp_duration_max: u32,

    /// Duration of a single vTDMA slot
    pub vtdma_slot_duration: u32,

    /// Maximum interval between preambles (before a channel toggle)
    pub max_preamble_interval: u32,

    /// Wait for a preamble-ack after each preamble
    pub preamble_interval: u32,

    /// Total preamble flood duration, longer than a superframe to
    /// guarantee overlap with the receiver's CP
    pub preamble_duration: u32,

    /// Gap between broadcast repeats
    pub bcast_interval: u32,

    /// Total broadcast duration
    pub bcast_duration: u32,

    /// Wait for the receiver's beacon after a successful CP transmission
    pub wait_beacon: u32,

    /// Guard for a missing transmission complete event
    pub no_tx_isr: u32,

    /// Wait for an ongoing reception to complete
    pub wait_rx_end: u32,

    /// Minimum gap between the own phase and a neighbor's phase
    /// before a phase backoff is scheduled
    pub cp_min_gap: u32,

    /// Additional delay applied when persisting a late phase correction
    pub phase_correction_margin: u32,

    /// Immediate retries on busy channel feedback
    pub tx_busy_threshold: u8,

    /// Maximum CP / vTDMA extensions waiting for a reception to complete
    pub cp_extend_threshold: u8,

    /// Lifetime (in cycles) of duplicate detection records
    pub dupchk_lifetime: u8,

    /// Maximum senders allocated slots in a single beacon
    pub max_alloc_senders: u8,

    /// Preamble floods attempted before dropping a frame
    pub t2u_retry_threshold: u8,

    /// Persistent failures before the radio is re-initialised
    pub max_t2u_fail: u8,

    /// Consecutive missing acks before a neighbor's phase is invalidated
    pub rephaselock_threshold: u8,

    pub pub_channel_1: u8,
    pub pub_channel_2: u8,
}

impl Default for Config {
    fn default() -> Self {
        let superframe_duration = 300_000;
        let cp_duration = 10_000;

        Self {
            pan_id: PanId(0x0100),

            superframe_duration,
            cp_duration,
            cp_random_end: 1_000,
            cp_duration_max: 5 * cp_duration,
            vtdma_slot_duration: 5_000,

            max_preamble_interval: 6_000,
            preamble_interval: 2_000,
            preamble_duration: 21 * superframe_duration / 20,

            bcast_interval: 1_000,
            bcast_duration: 21 * superframe_duration / 20,

            wait_beacon: 5 * cp_duration,
            no_tx_isr: 50_000,
            wait_rx_end: 6_000,
            cp_min_gap: 25_000,
            phase_correction_margin: 20_000,

            tx_busy_threshold: 5,
            cp_extend_threshold: 5,
            dupchk_lifetime: 30,
            max_alloc_senders: 11,
            t2u_retry_threshold: 2,
            max_t2u_fail: 10,
            rephaselock_threshold: 4,

            pub_channel_1: DEFAULT_PUB_CHANNEL_1,
            pub_channel_2: DEFAULT_PUB_CHANNEL_2,
        }
    }
}

impl Config {
    /// Number of whole vTDMA slots that fit in the provided duration
    pub fn slots_in(&self, duration: u32) -> u32 {
        match self.vtdma_slot_duration {
            0 => 0,
            d => duration / d,
        }
    }

    /// Wait before the first preamble of a flood, which is sent with CSMA
    pub fn first_preamble_interval(&self) -> u32 {
        5 * self.max_preamble_interval
    }
}
