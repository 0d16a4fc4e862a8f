//! PTP time values: 48-bit seconds plus nanoseconds.

use std::fmt;
use std::ops::Sub;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const NANOS_PER_SEC: u32 = 1_000_000_000;
pub const MAX_SECONDS_48BIT: u64 = (1u64 << 48) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PtpTimestamp {
    pub seconds: u64,
    pub nanoseconds: u32,
}

impl PtpTimestamp {
    pub const ZERO: Self = PtpTimestamp {
        seconds: 0,
        nanoseconds: 0,
    };

    pub fn new(seconds: u64, nanoseconds: u32) -> Self {
        PtpTimestamp {
            seconds: seconds & MAX_SECONDS_48BIT,
            nanoseconds: nanoseconds.min(NANOS_PER_SEC - 1),
        }
    }

    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }

    pub fn from_system_time(t: SystemTime) -> Self {
        let dur = t.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
        PtpTimestamp::new(dur.as_secs(), dur.subsec_nanos())
    }

    pub fn to_nanos(&self) -> i128 {
        i128::from(self.seconds) * i128::from(NANOS_PER_SEC) + i128::from(self.nanoseconds)
    }

    /// Negative values saturate at zero.
    pub fn from_nanos(nanos: i128) -> Self {
        if nanos <= 0 {
            return PtpTimestamp::ZERO;
        }
        let secs = nanos / i128::from(NANOS_PER_SEC);
        let rem = nanos % i128::from(NANOS_PER_SEC);
        PtpTimestamp::new(
            u64::try_from(secs).unwrap_or(MAX_SECONDS_48BIT),
            rem as u32,
        )
    }

    /// Signed difference `self - other` in nanoseconds.
    pub fn diff_nanos(&self, other: &PtpTimestamp) -> i128 {
        self.to_nanos() - other.to_nanos()
    }

    pub fn add_nanos(&self, nanos: i64) -> Self {
        Self::from_nanos(self.to_nanos() + i128::from(nanos))
    }
}

impl Sub for PtpTimestamp {
    type Output = i128;

    fn sub(self, rhs: PtpTimestamp) -> i128 {
        self.diff_nanos(&rhs)
    }
}

impl fmt::Display for PtpTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.seconds, self.nanoseconds)
    }
}

/// Timestamp slot attached to an event message.
///
/// A freshly built event message is `Pending` until the timestamper reports
/// its egress or ingress time. A failed retrieval marks it `Invalid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventTimestamp {
    #[default]
    Pending,
    Invalid,
    Valid(PtpTimestamp),
}

impl EventTimestamp {
    pub fn valid(&self) -> Option<PtpTimestamp> {
        match self {
            EventTimestamp::Valid(ts) => Some(*ts),
            _ => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, EventTimestamp::Pending)
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self, EventTimestamp::Invalid)
    }
}
