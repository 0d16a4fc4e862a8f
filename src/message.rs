//! 802.1AS message types and their Layer-2 wire codec.
//!
//! Only the six message types a gPTP port exchanges are modelled: Sync,
//! Follow_Up, Pdelay_Req, Pdelay_Resp, Pdelay_Resp_Follow_Up and Announce.
//! Anything else is rejected at decode time.

use crate::ptp::{
    ClockIdentity, ClockQuality, PortIdentity, PTP_VERSION, TRANSPORT_SPECIFIC_GPTP,
};
use crate::timestamp::{EventTimestamp, PtpTimestamp};
use anyhow::{anyhow, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

pub const HEADER_SIZE: usize = 34;
const TIMESTAMP_SIZE: usize = 10;

const TLV_ORGANIZATION_EXTENSION: u16 = 0x0003;
const TLV_PATH_TRACE: u16 = 0x0008;
const FOLLOW_UP_TLV_LENGTH: u16 = 28;
const IEEE_802_1_ORG_ID: [u8; 3] = [0x00, 0x80, 0xC2];
const FOLLOW_UP_INFO_SUBTYPE: [u8; 3] = [0x00, 0x00, 0x01];

const FLAG_TWO_STEP: u16 = 0x0200;
const FLAG_PTP_TIMESCALE: u16 = 0x0008;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum MessageType {
    Sync = 0x0,
    PDelayReq = 0x2,
    PDelayResp = 0x3,
    FollowUp = 0x8,
    PDelayRespFollowUp = 0xA,
    Announce = 0xB,
}

impl MessageType {
    pub fn from_nibble(v: u8) -> Result<Self> {
        match v & 0x0F {
            0x0 => Ok(MessageType::Sync),
            0x2 => Ok(MessageType::PDelayReq),
            0x3 => Ok(MessageType::PDelayResp),
            0x8 => Ok(MessageType::FollowUp),
            0xA => Ok(MessageType::PDelayRespFollowUp),
            0xB => Ok(MessageType::Announce),
            other => Err(anyhow!("Unsupported PTP message type 0x{:x}", other)),
        }
    }

    /// Event messages carry a hardware timestamp.
    pub fn is_event(&self) -> bool {
        matches!(
            self,
            MessageType::Sync | MessageType::PDelayReq | MessageType::PDelayResp
        )
    }

    fn control(&self) -> u8 {
        match self {
            MessageType::Sync => 0,
            MessageType::FollowUp => 2,
            _ => 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub sequence_id: u16,
    pub source: PortIdentity,
    /// Scaled nanoseconds (ns << 16).
    pub correction_field: i64,
    pub log_message_interval: i8,
    pub domain_number: u8,
    pub flags: u16,
}

impl Header {
    pub fn new(source: PortIdentity, sequence_id: u16, log_message_interval: i8) -> Self {
        Header {
            sequence_id,
            source,
            correction_field: 0,
            log_message_interval,
            domain_number: 0,
            flags: 0,
        }
    }
}

/// The part of an Announce that BMCA looks at.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnounceDataset {
    pub priority1: u8,
    pub clock_quality: ClockQuality,
    pub priority2: u8,
    pub grandmaster_identity: ClockIdentity,
    pub steps_removed: u16,
    pub time_source: u8,
    pub current_utc_offset: i16,
}

impl AnnounceDataset {
    fn comparison_key(&self) -> (u8, u8, u8, u16, u8, ClockIdentity) {
        (
            self.priority1,
            self.clock_quality.clock_class,
            self.clock_quality.clock_accuracy,
            self.clock_quality.offset_scaled_log_variance,
            self.priority2,
            self.grandmaster_identity,
        )
    }

    /// Lexicographic order over the grandmaster vector, lower wins.
    /// Equal vectors (same grandmaster) are never better than each other.
    pub fn is_better_than(&self, other: &AnnounceDataset) -> bool {
        self.comparison_key() < other.comparison_key()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Announce {
    pub header: Header,
    pub dataset: AnnounceDataset,
    pub path_trace: Vec<ClockIdentity>,
}

impl Announce {
    pub fn is_better_than(&self, other: &Announce) -> bool {
        self.dataset.is_better_than(&other.dataset)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sync {
    pub header: Header,
    pub origin_timestamp: PtpTimestamp,
    /// Local egress or ingress time.
    pub timestamp: EventTimestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FollowUpInfo {
    /// (rateRatio - 1) * 2^41
    pub cumulative_scaled_rate_offset: i32,
    pub gm_time_base_indicator: u16,
    pub last_gm_phase_change: [u8; 12],
    pub scaled_last_gm_freq_change: i32,
}

impl FollowUpInfo {
    pub fn rate_ratio(&self) -> f64 {
        1.0 + f64::from(self.cumulative_scaled_rate_offset) / 2f64.powi(41)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FollowUp {
    pub header: Header,
    pub precise_origin_timestamp: PtpTimestamp,
    pub info: FollowUpInfo,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PDelayReq {
    pub header: Header,
    pub timestamp: EventTimestamp,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PDelayResp {
    pub header: Header,
    pub request_receipt_timestamp: PtpTimestamp,
    pub requesting_port: PortIdentity,
    pub timestamp: EventTimestamp,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PDelayRespFollowUp {
    pub header: Header,
    pub response_origin_timestamp: PtpTimestamp,
    pub requesting_port: PortIdentity,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PtpMessage {
    Announce(Announce),
    Sync(Sync),
    FollowUp(FollowUp),
    PDelayReq(PDelayReq),
    PDelayResp(PDelayResp),
    PDelayRespFollowUp(PDelayRespFollowUp),
}

impl PtpMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            PtpMessage::Announce(_) => MessageType::Announce,
            PtpMessage::Sync(_) => MessageType::Sync,
            PtpMessage::FollowUp(_) => MessageType::FollowUp,
            PtpMessage::PDelayReq(_) => MessageType::PDelayReq,
            PtpMessage::PDelayResp(_) => MessageType::PDelayResp,
            PtpMessage::PDelayRespFollowUp(_) => MessageType::PDelayRespFollowUp,
        }
    }

    pub fn header(&self) -> &Header {
        match self {
            PtpMessage::Announce(m) => &m.header,
            PtpMessage::Sync(m) => &m.header,
            PtpMessage::FollowUp(m) => &m.header,
            PtpMessage::PDelayReq(m) => &m.header,
            PtpMessage::PDelayResp(m) => &m.header,
            PtpMessage::PDelayRespFollowUp(m) => &m.header,
        }
    }

    pub fn is_event(&self) -> bool {
        self.message_type().is_event()
    }

    /// Attach the local ingress timestamp to an event message. General
    /// messages are left untouched.
    pub fn set_timestamp(&mut self, ts: EventTimestamp) {
        match self {
            PtpMessage::Sync(m) => m.timestamp = ts,
            PtpMessage::PDelayReq(m) => m.timestamp = ts,
            PtpMessage::PDelayResp(m) => m.timestamp = ts,
            _ => {}
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut body = Vec::with_capacity(64);
        let mut flags = self.header().flags;
        match self {
            PtpMessage::Sync(m) => {
                flags |= FLAG_TWO_STEP;
                write_timestamp(&mut body, &m.origin_timestamp)?;
            }
            PtpMessage::FollowUp(m) => {
                write_timestamp(&mut body, &m.precise_origin_timestamp)?;
                body.write_u16::<BigEndian>(TLV_ORGANIZATION_EXTENSION)?;
                body.write_u16::<BigEndian>(FOLLOW_UP_TLV_LENGTH)?;
                body.write_all(&IEEE_802_1_ORG_ID)?;
                body.write_all(&FOLLOW_UP_INFO_SUBTYPE)?;
                body.write_i32::<BigEndian>(m.info.cumulative_scaled_rate_offset)?;
                body.write_u16::<BigEndian>(m.info.gm_time_base_indicator)?;
                body.write_all(&m.info.last_gm_phase_change)?;
                body.write_i32::<BigEndian>(m.info.scaled_last_gm_freq_change)?;
            }
            PtpMessage::PDelayReq(_) => {
                body.write_all(&[0u8; 2 * TIMESTAMP_SIZE])?;
            }
            PtpMessage::PDelayResp(m) => {
                flags |= FLAG_TWO_STEP;
                write_timestamp(&mut body, &m.request_receipt_timestamp)?;
                write_port_identity(&mut body, &m.requesting_port)?;
            }
            PtpMessage::PDelayRespFollowUp(m) => {
                write_timestamp(&mut body, &m.response_origin_timestamp)?;
                write_port_identity(&mut body, &m.requesting_port)?;
            }
            PtpMessage::Announce(m) => {
                flags |= FLAG_PTP_TIMESCALE;
                let ds = &m.dataset;
                body.write_all(&[0u8; TIMESTAMP_SIZE])?;
                body.write_i16::<BigEndian>(ds.current_utc_offset)?;
                body.write_u8(0)?;
                body.write_u8(ds.priority1)?;
                body.write_u8(ds.clock_quality.clock_class)?;
                body.write_u8(ds.clock_quality.clock_accuracy)?;
                body.write_u16::<BigEndian>(ds.clock_quality.offset_scaled_log_variance)?;
                body.write_u8(ds.priority2)?;
                body.write_all(&ds.grandmaster_identity.0)?;
                body.write_u16::<BigEndian>(ds.steps_removed)?;
                body.write_u8(ds.time_source)?;
                body.write_u16::<BigEndian>(TLV_PATH_TRACE)?;
                body.write_u16::<BigEndian>((m.path_trace.len() * 8) as u16)?;
                for id in &m.path_trace {
                    body.write_all(&id.0)?;
                }
            }
        }

        let header = self.header();
        let message_type = self.message_type();
        let mut out = Vec::with_capacity(HEADER_SIZE + body.len());
        out.write_u8((TRANSPORT_SPECIFIC_GPTP << 4) | message_type as u8)?;
        out.write_u8(PTP_VERSION)?;
        out.write_u16::<BigEndian>((HEADER_SIZE + body.len()) as u16)?;
        out.write_u8(header.domain_number)?;
        out.write_u8(0)?;
        out.write_u16::<BigEndian>(flags)?;
        out.write_i64::<BigEndian>(header.correction_field)?;
        out.write_u32::<BigEndian>(0)?;
        write_port_identity(&mut out, &header.source)?;
        out.write_u16::<BigEndian>(header.sequence_id)?;
        out.write_u8(message_type.control())?;
        out.write_i8(header.log_message_interval)?;
        out.extend_from_slice(&body);
        Ok(out)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(anyhow!("Packet too short for PTP header"));
        }
        let mut rdr = Cursor::new(data);

        let b0 = rdr.read_u8()?;
        if b0 >> 4 != TRANSPORT_SPECIFIC_GPTP {
            return Err(anyhow!("Not a gPTP message (transportSpecific {})", b0 >> 4));
        }
        let message_type = MessageType::from_nibble(b0)?;
        let version = rdr.read_u8()? & 0x0F;
        if version != PTP_VERSION {
            return Err(anyhow!("Unsupported PTP version {}", version));
        }
        let message_length = rdr.read_u16::<BigEndian>()? as usize;
        if message_length > data.len() {
            return Err(anyhow!(
                "Truncated message: length field {} but {} bytes received",
                message_length,
                data.len()
            ));
        }
        let domain_number = rdr.read_u8()?;
        let _reserved = rdr.read_u8()?;
        let flags = rdr.read_u16::<BigEndian>()?;
        let correction_field = rdr.read_i64::<BigEndian>()?;
        let _reserved = rdr.read_u32::<BigEndian>()?;
        let source = read_port_identity(&mut rdr)?;
        let sequence_id = rdr.read_u16::<BigEndian>()?;
        let _control = rdr.read_u8()?;
        let log_message_interval = rdr.read_i8()?;

        let header = Header {
            sequence_id,
            source,
            correction_field,
            log_message_interval,
            domain_number,
            flags,
        };

        let mut rdr = Cursor::new(&data[HEADER_SIZE..message_length.max(HEADER_SIZE)]);
        let msg = match message_type {
            MessageType::Sync => PtpMessage::Sync(Sync {
                header,
                origin_timestamp: read_timestamp(&mut rdr)?,
                timestamp: EventTimestamp::Pending,
            }),
            MessageType::FollowUp => {
                let precise_origin_timestamp = read_timestamp(&mut rdr)?;
                let info = read_follow_up_tlv(&mut rdr)?.unwrap_or_default();
                PtpMessage::FollowUp(FollowUp {
                    header,
                    precise_origin_timestamp,
                    info,
                })
            }
            MessageType::PDelayReq => PtpMessage::PDelayReq(PDelayReq {
                header,
                timestamp: EventTimestamp::Pending,
            }),
            MessageType::PDelayResp => PtpMessage::PDelayResp(PDelayResp {
                header,
                request_receipt_timestamp: read_timestamp(&mut rdr)?,
                requesting_port: read_port_identity(&mut rdr)?,
                timestamp: EventTimestamp::Pending,
            }),
            MessageType::PDelayRespFollowUp => {
                PtpMessage::PDelayRespFollowUp(PDelayRespFollowUp {
                    header,
                    response_origin_timestamp: read_timestamp(&mut rdr)?,
                    requesting_port: read_port_identity(&mut rdr)?,
                })
            }
            MessageType::Announce => {
                rdr.set_position(TIMESTAMP_SIZE as u64);
                let current_utc_offset = rdr.read_i16::<BigEndian>()?;
                let _reserved = rdr.read_u8()?;
                let priority1 = rdr.read_u8()?;
                let clock_class = rdr.read_u8()?;
                let clock_accuracy = rdr.read_u8()?;
                let offset_scaled_log_variance = rdr.read_u16::<BigEndian>()?;
                let priority2 = rdr.read_u8()?;
                let grandmaster_identity = read_clock_identity(&mut rdr)?;
                let steps_removed = rdr.read_u16::<BigEndian>()?;
                let time_source = rdr.read_u8()?;
                let path_trace = read_path_trace_tlv(&mut rdr)?;
                PtpMessage::Announce(Announce {
                    header,
                    dataset: AnnounceDataset {
                        priority1,
                        clock_quality: ClockQuality {
                            clock_class,
                            clock_accuracy,
                            offset_scaled_log_variance,
                        },
                        priority2,
                        grandmaster_identity,
                        steps_removed,
                        time_source,
                        current_utc_offset,
                    },
                    path_trace,
                })
            }
        };
        Ok(msg)
    }
}

fn write_timestamp<W: Write>(w: &mut W, ts: &PtpTimestamp) -> Result<()> {
    w.write_u16::<BigEndian>((ts.seconds >> 32) as u16)?;
    w.write_u32::<BigEndian>(ts.seconds as u32)?;
    w.write_u32::<BigEndian>(ts.nanoseconds)?;
    Ok(())
}

fn read_timestamp<R: Read>(r: &mut R) -> Result<PtpTimestamp> {
    let hi = u64::from(r.read_u16::<BigEndian>()?);
    let lo = u64::from(r.read_u32::<BigEndian>()?);
    let nanoseconds = r.read_u32::<BigEndian>()?;
    Ok(PtpTimestamp::new((hi << 32) | lo, nanoseconds))
}

fn write_port_identity<W: Write>(w: &mut W, id: &PortIdentity) -> Result<()> {
    w.write_all(&id.clock_identity.0)?;
    w.write_u16::<BigEndian>(id.port_number)?;
    Ok(())
}

fn read_clock_identity<R: Read>(r: &mut R) -> Result<ClockIdentity> {
    let mut id = [0u8; 8];
    r.read_exact(&mut id)?;
    Ok(ClockIdentity(id))
}

fn read_port_identity<R: Read>(r: &mut R) -> Result<PortIdentity> {
    let clock_identity = read_clock_identity(r)?;
    let port_number = r.read_u16::<BigEndian>()?;
    Ok(PortIdentity::new(clock_identity, port_number))
}

fn read_follow_up_tlv(rdr: &mut Cursor<&[u8]>) -> Result<Option<FollowUpInfo>> {
    let remaining = rdr.get_ref().len() as u64 - rdr.position();
    if remaining < 4 + u64::from(FOLLOW_UP_TLV_LENGTH) {
        return Ok(None);
    }
    let tlv_type = rdr.read_u16::<BigEndian>()?;
    let _length = rdr.read_u16::<BigEndian>()?;
    let mut org = [0u8; 6];
    rdr.read_exact(&mut org)?;
    if tlv_type != TLV_ORGANIZATION_EXTENSION
        || org[..3] != IEEE_802_1_ORG_ID
        || org[3..] != FOLLOW_UP_INFO_SUBTYPE
    {
        return Ok(None);
    }
    let cumulative_scaled_rate_offset = rdr.read_i32::<BigEndian>()?;
    let gm_time_base_indicator = rdr.read_u16::<BigEndian>()?;
    let mut last_gm_phase_change = [0u8; 12];
    rdr.read_exact(&mut last_gm_phase_change)?;
    let scaled_last_gm_freq_change = rdr.read_i32::<BigEndian>()?;
    Ok(Some(FollowUpInfo {
        cumulative_scaled_rate_offset,
        gm_time_base_indicator,
        last_gm_phase_change,
        scaled_last_gm_freq_change,
    }))
}

fn read_path_trace_tlv(rdr: &mut Cursor<&[u8]>) -> Result<Vec<ClockIdentity>> {
    let mut path = Vec::new();
    let remaining = rdr.get_ref().len() as u64 - rdr.position();
    if remaining < 4 {
        return Ok(path);
    }
    let tlv_type = rdr.read_u16::<BigEndian>()?;
    let length = rdr.read_u16::<BigEndian>()?;
    if tlv_type != TLV_PATH_TRACE {
        return Ok(path);
    }
    for _ in 0..(length / 8) {
        path.push(read_clock_identity(rdr)?);
    }
    Ok(path)
}
