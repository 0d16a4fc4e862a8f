use std::fmt;
use std::time::Duration;

pub const PTP_ETHERTYPE: u16 = 0x88F7;
pub const PDELAY_MULTICAST: [u8; 6] = [0x01, 0x80, 0xC2, 0x00, 0x00, 0x0E];
pub const OTHER_MULTICAST: [u8; 6] = [0x01, 0x1B, 0x19, 0x00, 0x00, 0x00];

pub const TRANSPORT_SPECIFIC_GPTP: u8 = 1;
pub const PTP_VERSION: u8 = 2;

// Protocol timing
pub const EVENT_TIMER_GRANULARITY_NS: u64 = 5_000_000;
pub const TX_TIMEOUT_BASE: Duration = Duration::from_micros(1000);
pub const TX_TIMEOUT_MULTIPLIER: u32 = 2;
pub const TX_TIMEOUT_RETRIES: u32 = 2;
pub const RX_TIMEOUT_RETRIES: u32 = 5;
pub const STATE_CHANGE_DELAY_NS: u64 = 16_000_000;
pub const TRANSMIT_START_DELAY_NS: u64 = 16_000_000;
pub const PDELAY_START_DELAY_NS: u64 = 32_000_000;
pub const PDELAY_DEFERRED_DELAY_NS: u64 = 1_000_000;

pub const ONE_WAY_DELAY_DEFAULT_NS: i64 = 3_600_000_000_000;
pub const MAX_STEPS_REMOVED: u16 = 255;
/// A clock with this priority1 never becomes master.
pub const SLAVE_ONLY_PRIORITY1: u8 = 255;
pub const LOG_INTERVAL_UNSPECIFIED: i8 = 0x7F;

/// Neighbor rate ratios outside `1 ± PEER_RATE_SANITY_WINDOW` are not trusted for the
/// turnaround correction.
pub const PEER_RATE_SANITY_WINDOW: f64 = 0.002;
pub const PEER_RATE_MAX_PPM: f64 = 250.0;

pub fn interval_ns(log_interval: i8) -> u64 {
    (2f64.powi(i32::from(log_interval)) * 1e9) as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ClockIdentity(pub [u8; 8]);

impl ClockIdentity {
    /// EUI-64 derived from a MAC address (FF-FE inserted in the middle).
    pub fn from_mac(mac: [u8; 6]) -> Self {
        ClockIdentity([mac[0], mac[1], mac[2], 0xFF, 0xFE, mac[3], mac[4], mac[5]])
    }
}

impl fmt::Display for ClockIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}{:02x}{:02x}.{:02x}{:02x}.{:02x}{:02x}{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PortIdentity {
    pub clock_identity: ClockIdentity,
    pub port_number: u16,
}

impl PortIdentity {
    pub fn new(clock_identity: ClockIdentity, port_number: u16) -> Self {
        PortIdentity {
            clock_identity,
            port_number,
        }
    }
}

impl fmt::Display for PortIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.clock_identity, self.port_number)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClockQuality {
    pub clock_class: u8,
    pub clock_accuracy: u8,
    pub offset_scaled_log_variance: u16,
}

impl Default for ClockQuality {
    fn default() -> Self {
        ClockQuality {
            clock_class: 248,
            clock_accuracy: 0xFE,
            offset_scaled_log_variance: 0x4100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortState {
    Initializing,
    Disabled,
    Faulty,
    Listening,
    PreMaster,
    Master,
    Passive,
    Uncalibrated,
    Slave,
}

impl PortState {
    /// Disabled and faulty ports take no part in BMCA.
    pub fn is_enabled(&self) -> bool {
        !matches!(self, PortState::Disabled | PortState::Faulty)
    }
}

impl fmt::Display for PortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PortState::Initializing => "INITIALIZING",
            PortState::Disabled => "DISABLED",
            PortState::Faulty => "FAULTY",
            PortState::Listening => "LISTENING",
            PortState::PreMaster => "PRE_MASTER",
            PortState::Master => "MASTER",
            PortState::Passive => "PASSIVE",
            PortState::Uncalibrated => "UNCALIBRATED",
            PortState::Slave => "SLAVE",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Event {
    PowerUp,
    Initialize,
    StateChange,
    AnnounceReceiptTimeoutExpires,
    SyncReceiptTimeoutExpires,
    PDelayIntervalTimeoutExpires,
    SyncIntervalTimeoutExpires,
    AnnounceIntervalTimeoutExpires,
    FaultDetected,
    PDelayDeferredProcessing,
    PDelayRespReceiptTimeoutExpires,
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MulticastKind {
    PDelay,
    Other,
}

impl MulticastKind {
    pub fn mac(&self) -> [u8; 6] {
        match self {
            MulticastKind::PDelay => PDELAY_MULTICAST,
            MulticastKind::Other => OTHER_MULTICAST,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Destination {
    Multicast(MulticastKind),
    Unicast(PortIdentity),
}
