use crate::error::TimestampError;
use crate::message::{AnnounceDataset, PtpMessage};
use crate::ptp::{ClockIdentity, Destination, Event, PortIdentity};
use crate::status::MasterOffset;
use crate::timestamp::PtpTimestamp;
use anyhow::Result;

/// Stable index of a port inside its clock's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortHandle(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetResult {
    Succeed,
    /// Not sent; the port may try again later.
    Fail,
    /// The link is unusable.
    Fatal,
}

#[cfg_attr(test, mockall::automock)]
pub trait PtpNetwork: Send + Sync {
    /// Send a message. `wants_timestamp` asks the link to capture an egress
    /// timestamp that the port later collects from its timestamper.
    fn send_message(
        &self,
        message: &PtpMessage,
        destination: Destination,
        wants_timestamp: bool,
    ) -> NetResult;

    /// Receive one message. Returns Ok(None) on timeout.
    /// An Err means the link failed and no further messages will arrive.
    fn recv_message(&self) -> Result<Option<PtpMessage>>;

    fn link_layer_address(&self) -> [u8; 6];
}

/// Pairs of timestamps read from the device clock and the system clock at
/// (nearly) the same instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceTime {
    pub system: PtpTimestamp,
    pub device: PtpTimestamp,
}

#[cfg_attr(test, mockall::automock)]
pub trait HwTimestamper: Send + Sync {
    /// Egress timestamp of the event message `(identity, sequence_id)`.
    /// `last` marks the final attempt of a retry sequence.
    fn tx_timestamp(
        &self,
        identity: &PortIdentity,
        sequence_id: u16,
        last: bool,
    ) -> Result<(PtpTimestamp, u32), TimestampError>;

    fn rx_timestamp(
        &self,
        identity: &PortIdentity,
        sequence_id: u16,
        last: bool,
    ) -> Result<(PtpTimestamp, u32), TimestampError>;

    fn device_time(&self) -> Result<DeviceTime, TimestampError>;

    /// Free-form description of the last failure, for logging.
    fn extended_error(&self) -> String;
}

/// The clock as seen from one of its ports.
#[cfg_attr(test, mockall::automock)]
pub trait PortContext {
    fn add_event_timer(&self, port: PortHandle, event: Event, delay_ns: u64);
    fn delete_event_timer(&self, port: PortHandle, event: Event);
    fn clock_identity(&self) -> ClockIdentity;
    /// This clock's own dataset, advertised when it is grandmaster.
    fn local_dataset(&self) -> AnnounceDataset;
    fn system_time(&self) -> PtpTimestamp;
    fn become_grandmaster(&self);
    fn set_master_offset(&self, report: MasterOffset);
    fn reset_frequency_adjustment(&self);
    fn start_receive_loop(&self, port: PortHandle);
}
