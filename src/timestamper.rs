//! Software timestamping from the system clock.
//!
//! The link records the system time right after a frame leaves or arrives;
//! the port collects it later by `(port identity, sequence id)`. Device time
//! and system time are the same clock.

use crate::error::TimestampError;
use crate::ptp::PortIdentity;
use crate::timestamp::PtpTimestamp;
use crate::traits::{DeviceTime, HwTimestamper};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Entries older than this many newer records are dropped.
const MAX_PENDING: usize = 64;

#[derive(Default)]
struct Records {
    entries: HashMap<(PortIdentity, u16), (PtpTimestamp, u32)>,
    counter: u32,
}

impl Records {
    fn record(&mut self, identity: PortIdentity, sequence_id: u16, ts: PtpTimestamp) {
        self.counter = self.counter.wrapping_add(1);
        let counter = self.counter;
        self.entries.insert((identity, sequence_id), (ts, counter));
        if self.entries.len() > MAX_PENDING {
            self.entries
                .retain(|_, (_, c)| counter.wrapping_sub(*c) < MAX_PENDING as u32);
        }
    }

    fn take(
        &mut self,
        identity: &PortIdentity,
        sequence_id: u16,
        last: bool,
    ) -> Result<(PtpTimestamp, u32), TimestampError> {
        match self.entries.remove(&(*identity, sequence_id)) {
            Some(found) => Ok(found),
            None if last => Err(TimestampError::NotFound(sequence_id)),
            None => Err(TimestampError::NotReady),
        }
    }
}

#[derive(Default)]
pub struct SoftwareTimestamper {
    tx: Mutex<Records>,
    rx: Mutex<Records>,
    last_error: Mutex<String>,
}

impl SoftwareTimestamper {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(m: &Mutex<Records>) -> MutexGuard<'_, Records> {
        m.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_tx(&self, identity: PortIdentity, sequence_id: u16, ts: PtpTimestamp) {
        Self::lock(&self.tx).record(identity, sequence_id, ts);
    }

    pub fn record_rx(&self, identity: PortIdentity, sequence_id: u16, ts: PtpTimestamp) {
        Self::lock(&self.rx).record(identity, sequence_id, ts);
    }

    fn note(
        &self,
        result: Result<(PtpTimestamp, u32), TimestampError>,
        direction: &str,
    ) -> Result<(PtpTimestamp, u32), TimestampError> {
        if let Err(e) = &result {
            *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) =
                format!("software {} timestamp: {}", direction, e);
        }
        result
    }
}

impl HwTimestamper for SoftwareTimestamper {
    fn tx_timestamp(
        &self,
        identity: &PortIdentity,
        sequence_id: u16,
        last: bool,
    ) -> Result<(PtpTimestamp, u32), TimestampError> {
        let result = Self::lock(&self.tx).take(identity, sequence_id, last);
        self.note(result, "TX")
    }

    fn rx_timestamp(
        &self,
        identity: &PortIdentity,
        sequence_id: u16,
        last: bool,
    ) -> Result<(PtpTimestamp, u32), TimestampError> {
        let result = Self::lock(&self.rx).take(identity, sequence_id, last);
        self.note(result, "RX")
    }

    fn device_time(&self) -> Result<DeviceTime, TimestampError> {
        let now = PtpTimestamp::now();
        Ok(DeviceTime {
            system: now,
            device: now,
        })
    }

    fn extended_error(&self) -> String {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
