use super::Port;
use crate::message::{Announce, FollowUp, FollowUpInfo, Header, PDelayReq, PtpMessage, Sync};
use crate::ptp::{
    interval_ns, Destination, Event, MulticastKind, PortState, TX_TIMEOUT_BASE,
    TX_TIMEOUT_MULTIPLIER, TX_TIMEOUT_RETRIES,
};
use crate::status::MasterOffset;
use crate::timestamp::EventTimestamp;
use crate::traits::{NetResult, PortContext};
use log::{debug, error, warn};
use std::iter;
use std::sync::PoisonError;
use std::thread;
use std::time::Duration;

fn next_sequence(counter: &mut u16) -> u16 {
    let seq = *counter;
    *counter = counter.wrapping_add(1);
    seq
}

/// Pauses between TX timestamp attempts: 1 ms, doubling, one per retry.
pub(super) fn tx_retry_backoff() -> impl Iterator<Item = Duration> {
    iter::successors(Some(TX_TIMEOUT_BASE), |d| Some(*d * TX_TIMEOUT_MULTIPLIER))
        .take(TX_TIMEOUT_RETRIES as usize)
}

impl Port {
    /// Send an event message and collect its egress timestamp, holding the
    /// TX lock for the whole exchange.
    pub(super) fn transmit_event(
        &self,
        message: &PtpMessage,
        destination: Destination,
    ) -> EventTimestamp {
        let _tx = self.link.tx_lock.lock().unwrap_or_else(PoisonError::into_inner);

        match self.link.network.send_message(message, destination, true) {
            NetResult::Succeed => {}
            NetResult::Fail => {
                warn!(
                    "Port {}: failed to send {:?}",
                    self.identity,
                    message.message_type()
                );
                return EventTimestamp::Invalid;
            }
            NetResult::Fatal => {
                error!(
                    "Port {}: link error sending {:?}",
                    self.identity,
                    message.message_type()
                );
                return EventTimestamp::Invalid;
            }
        }

        self.collect_tx_timestamp(message.header().sequence_id)
    }

    /// One attempt plus `TX_TIMEOUT_RETRIES` retries with doubling backoff.
    /// The final retry is flagged `last` so the timestamper can give up.
    fn collect_tx_timestamp(&self, sequence_id: u16) -> EventTimestamp {
        let timestamper = &self.link.timestamper;
        let mut pauses = tx_retry_backoff();
        loop {
            let pause = pauses.next();
            match (
                timestamper.tx_timestamp(&self.identity, sequence_id, pause.is_none()),
                pause,
            ) {
                (Ok((ts, _)), _) => return EventTimestamp::Valid(ts),
                (Err(e), Some(pause)) if e.is_transient() => thread::sleep(pause),
                (Err(e), _) => {
                    error!(
                        "Port {}: error (TX) timestamping seq {}: {}\t{}",
                        self.identity,
                        sequence_id,
                        e,
                        timestamper.extended_error()
                    );
                    return EventTimestamp::Invalid;
                }
            }
        }
    }

    pub(super) fn transmit_general(&self, message: &PtpMessage, destination: Destination) -> bool {
        match self.link.network.send_message(message, destination, false) {
            NetResult::Succeed => true,
            result => {
                warn!(
                    "Port {}: failed to send {:?} ({:?})",
                    self.identity,
                    message.message_type(),
                    result
                );
                false
            }
        }
    }

    pub(super) fn pdelay_interval_expired(&mut self, ctx: &dyn PortContext) {
        let seq = next_sequence(&mut self.pdelay_sequence_id);
        let request = PDelayReq {
            header: Header::new(self.identity, seq, self.log_pdelay_interval),
            timestamp: EventTimestamp::Pending,
        };
        self.last_pdelay_req = Some(request.clone());

        let timestamp = self.transmit_event(
            &PtpMessage::PDelayReq(request),
            Destination::Multicast(MulticastKind::PDelay),
        );
        if let Some(req) = self.last_pdelay_req.as_mut() {
            req.timestamp = timestamp;
        }
        match timestamp.valid() {
            Some(ts) => debug!("Port {}: PDelay request {} sent at {}", self.identity, seq, ts),
            None => debug!("Port {}: PDelay request {} has no timestamp", self.identity, seq),
        }

        let interval = interval_ns(self.log_pdelay_interval);
        ctx.add_event_timer(
            self.handle,
            Event::PDelayRespReceiptTimeoutExpires,
            u64::from(self.config.pdelay_resp_receipt_timeout_multiplier) * interval,
        );
        ctx.add_event_timer(self.handle, Event::PDelayIntervalTimeoutExpires, interval);
    }

    /// Transmit timers only run while MASTER. An expiry that raced a switch
    /// to SLAVE must not send or re-arm.
    fn transmitting(&self, event: Event) -> bool {
        if self.state == PortState::Master {
            return true;
        }
        debug!("Port {}: {:?} ignored in {}", self.identity, event, self.state);
        false
    }

    pub(super) fn sync_interval_expired(&mut self, ctx: &dyn PortContext) {
        if !self.transmitting(Event::SyncIntervalTimeoutExpires) {
            return;
        }
        if self.as_capable {
            let seq = next_sequence(&mut self.sync_sequence_id);
            let sync = Sync {
                header: Header::new(self.identity, seq, self.log_sync_interval),
                origin_timestamp: ctx.system_time(),
                timestamp: EventTimestamp::Pending,
            };
            let destination = Destination::Multicast(MulticastKind::Other);

            match self.transmit_event(&PtpMessage::Sync(sync), destination).valid() {
                Some(precise_origin_timestamp) => {
                    let follow_up = FollowUp {
                        header: Header::new(self.identity, seq, self.log_sync_interval),
                        precise_origin_timestamp,
                        info: FollowUpInfo::default(),
                    };
                    self.transmit_general(&PtpMessage::FollowUp(follow_up), destination);
                }
                None => warn!(
                    "Port {}: Sync {} not timestamped, Follow_Up skipped",
                    self.identity, seq
                ),
            }
        }

        let (system, device) = self.device_time(ctx);
        let local_system_offset_ns = (system - device) as i64;
        let local_system_ppt = self.local_system.sample(local_system_offset_ns, system);

        ctx.set_master_offset(MasterOffset {
            port: self.handle,
            port_state: self.state,
            master_offset_ns: 0,
            master_time: device,
            master_local_ppt: 0.0,
            local_system_offset_ns,
            system_time: system,
            local_system_ppt,
            sync_count: self.sync_count,
            pdelay_count: self.pdelay_count,
        });

        ctx.add_event_timer(
            self.handle,
            Event::SyncIntervalTimeoutExpires,
            interval_ns(self.log_sync_interval),
        );
    }

    pub(super) fn announce_interval_expired(&mut self, ctx: &dyn PortContext) {
        if !self.transmitting(Event::AnnounceIntervalTimeoutExpires) {
            return;
        }
        if self.as_capable {
            let seq = next_sequence(&mut self.announce_sequence_id);
            let announce = Announce {
                header: Header::new(self.identity, seq, self.log_announce_interval),
                dataset: ctx.local_dataset(),
                path_trace: vec![ctx.clock_identity()],
            };
            self.transmit_general(
                &PtpMessage::Announce(announce),
                Destination::Multicast(MulticastKind::Other),
            );
        }

        ctx.add_event_timer(
            self.handle,
            Event::AnnounceIntervalTimeoutExpires,
            interval_ns(self.log_announce_interval),
        );
    }
}
