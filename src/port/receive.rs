use super::Port;
use crate::message::{
    Announce, FollowUp, Header, PDelayReq, PDelayResp, PDelayRespFollowUp, PtpMessage, Sync,
};
use crate::ptp::{
    Destination, Event, MulticastKind, PortState, LOG_INTERVAL_UNSPECIFIED, MAX_STEPS_REMOVED,
    ONE_WAY_DELAY_DEFAULT_NS, PDELAY_DEFERRED_DELAY_NS, PEER_RATE_MAX_PPM,
    PEER_RATE_SANITY_WINDOW, STATE_CHANGE_DELAY_NS,
};
use crate::status::MasterOffset;
use crate::timestamp::{EventTimestamp, PtpTimestamp};
use crate::traits::PortContext;
use log::{debug, error, warn};
use std::sync::{PoisonError, TryLockError};

impl Port {
    /// Handle one decoded message received on this port's link.
    pub fn process_message(&mut self, message: PtpMessage, ctx: &dyn PortContext) {
        match message {
            PtpMessage::Announce(m) => self.process_announce(m, ctx),
            PtpMessage::Sync(m) => self.process_sync(m),
            PtpMessage::FollowUp(m) => self.process_follow_up(m, ctx),
            PtpMessage::PDelayReq(m) => self.process_pdelay_req(m),
            PtpMessage::PDelayResp(m) => self.process_pdelay_resp(m),
            PtpMessage::PDelayRespFollowUp(m) => self.process_pdelay_resp_follow_up(m, ctx),
        }
    }

    fn process_announce(&mut self, announce: Announce, ctx: &dyn PortContext) {
        if announce.header.source == self.identity || !self.state.is_enabled() {
            return;
        }

        ctx.delete_event_timer(self.handle, Event::AnnounceReceiptTimeoutExpires);

        let own = ctx.clock_identity();
        if announce.dataset.steps_removed >= MAX_STEPS_REMOVED {
            debug!(
                "Port {}: Announce from {} dropped, stepsRemoved {}",
                self.identity, announce.header.source, announce.dataset.steps_removed
            );
        } else if announce.header.source.clock_identity == own {
            debug!("Port {}: Announce from our own clock dropped", self.identity);
        } else if announce.path_trace.contains(&own) {
            debug!(
                "Port {}: Announce from {} already passed through this clock",
                self.identity, announce.header.source
            );
        } else {
            debug!(
                "Port {}: qualified Announce {} from {} (gm {})",
                self.identity,
                announce.header.sequence_id,
                announce.header.source,
                announce.dataset.grandmaster_identity
            );
            self.qualified_announces.push_back(announce);
            ctx.add_event_timer(self.handle, Event::StateChange, STATE_CHANGE_DELAY_NS);
        }

        ctx.add_event_timer(
            self.handle,
            Event::AnnounceReceiptTimeoutExpires,
            self.announce_receipt_timeout_ns(),
        );
    }

    fn process_sync(&mut self, sync: Sync) {
        if matches!(
            self.state,
            PortState::Disabled | PortState::Initializing | PortState::Listening | PortState::Faulty
        ) {
            return;
        }
        if sync.header.source == self.identity {
            return;
        }
        self.last_sync = Some(sync);
    }

    fn process_follow_up(&mut self, follow_up: FollowUp, ctx: &dyn PortContext) {
        if follow_up.header.source == self.identity {
            return;
        }

        ctx.delete_event_timer(self.handle, Event::SyncReceiptTimeoutExpires);
        if !self.state.is_enabled() {
            return;
        }

        self.apply_follow_up(follow_up, ctx);

        if self.state == PortState::Slave {
            ctx.add_event_timer(
                self.handle,
                Event::SyncReceiptTimeoutExpires,
                self.sync_receipt_timeout_ns(),
            );
        }
    }

    fn apply_follow_up(&mut self, follow_up: FollowUp, ctx: &dyn PortContext) {
        let sync = match self.last_sync.take() {
            Some(sync) => sync,
            None => {
                error!("Port {}: Follow_Up received without a Sync", self.identity);
                return;
            }
        };
        if sync.header.sequence_id != follow_up.header.sequence_id
            || sync.header.source != follow_up.header.source
        {
            error!(
                "Port {}: Follow_Up {} from {} does not match Sync {} from {}",
                self.identity,
                follow_up.header.sequence_id,
                follow_up.header.source,
                sync.header.sequence_id,
                sync.header.source
            );
            return;
        }
        let sync_arrival = match sync.timestamp.valid() {
            Some(ts) => ts,
            None => {
                error!("Port {}: Sync {} has no RX timestamp", self.identity, sync.header.sequence_id);
                return;
            }
        };
        if !self.link_delay_valid() {
            error!("Port {}: link delay unknown, Follow_Up ignored", self.identity);
            return;
        }

        let master_local_ratio = follow_up.info.rate_ratio() / self.peer_rate_offset;
        let correction = (self.one_way_delay_ns as f64 * master_local_ratio) as i64
            + (follow_up.header.correction_field >> 16);
        let master_time = follow_up.precise_origin_timestamp.add_nanos(correction);
        let master_offset_ns = (sync_arrival - master_time) as i64;
        let master_local_ppt = self.master_local.sample(master_offset_ns, sync_arrival);

        debug!(
            "Port {}: sync arrival {} master {} offset {}ns",
            self.identity, sync_arrival, master_time, master_offset_ns
        );

        if self.state == PortState::Slave {
            self.sync_count += 1;
            let (system, device) = self.device_time(ctx);
            let local_system_offset_ns = (system - device) as i64;
            let local_system_ppt = self.local_system.sample(local_system_offset_ns, system);

            ctx.set_master_offset(MasterOffset {
                port: self.handle,
                port_state: self.state,
                master_offset_ns,
                master_time,
                master_local_ppt,
                local_system_offset_ns,
                system_time: system,
                local_system_ppt,
                sync_count: self.sync_count,
                pdelay_count: self.pdelay_count,
            });
        }
    }

    fn process_pdelay_req(&mut self, request: PDelayReq) {
        if !self.state.is_enabled() || request.header.source == self.identity {
            return;
        }
        let seq = request.header.sequence_id;
        let request_receipt_timestamp = match request.timestamp.valid() {
            Some(ts) => ts,
            None => {
                error!("Port {}: PDelay request {} has no RX timestamp", self.identity, seq);
                return;
            }
        };

        let destination = Destination::Multicast(MulticastKind::PDelay);
        let response = PDelayResp {
            header: Header::new(self.identity, seq, LOG_INTERVAL_UNSPECIFIED),
            request_receipt_timestamp,
            requesting_port: request.header.source,
            timestamp: EventTimestamp::Pending,
        };
        let response_origin_timestamp =
            match self.transmit_event(&PtpMessage::PDelayResp(response), destination).valid() {
                Some(ts) => ts,
                None => return,
            };

        let follow_up = PDelayRespFollowUp {
            header: Header::new(self.identity, seq, LOG_INTERVAL_UNSPECIFIED),
            response_origin_timestamp,
            requesting_port: request.header.source,
        };
        self.transmit_general(&PtpMessage::PDelayRespFollowUp(follow_up), destination);
    }

    fn process_pdelay_resp(&mut self, response: PDelayResp) {
        if !self.state.is_enabled() || response.header.source == self.identity {
            return;
        }
        if response.requesting_port != self.identity {
            debug!(
                "Port {}: PDelay response for {} ignored",
                self.identity, response.requesting_port
            );
            return;
        }

        let link = self.link.clone();
        let _rx = match link.rx_lock.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(p)) => p.into_inner(),
            Err(TryLockError::WouldBlock) => {
                warn!("Port {}: PDelay RX busy, response dropped", self.identity);
                return;
            }
        };

        if let Some(prev) = &self.last_pdelay_resp {
            if prev.header.sequence_id == response.header.sequence_id {
                warn!(
                    "Port {}: multiple PDelay responses for request {}",
                    self.identity, response.header.sequence_id
                );
            }
        }
        self.last_pdelay_resp = Some(response);
    }

    fn process_pdelay_resp_follow_up(&mut self, follow_up: PDelayRespFollowUp, ctx: &dyn PortContext) {
        if !self.state.is_enabled() || follow_up.header.source == self.identity {
            return;
        }
        let link = self.link.clone();
        let _rx = link.rx_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.complete_pdelay(follow_up, ctx);
    }

    pub(super) fn deferred_processing(&mut self, ctx: &dyn PortContext) {
        let link = self.link.clone();
        let _rx = link.rx_lock.lock().unwrap_or_else(PoisonError::into_inner);
        match self.last_pdelay_resp_follow_up.take() {
            Some(follow_up) => self.complete_pdelay(follow_up, ctx),
            None => {
                error!(
                    "Port {}: PDelay deferred processing with no queued follow-up",
                    self.identity
                );
                std::process::abort();
            }
        }
    }

    /// Finish a PDelay exchange. Expects the RX lock to be held.
    fn complete_pdelay(&mut self, follow_up: PDelayRespFollowUp, ctx: &dyn PortContext) {
        let (request, response) = match (&self.last_pdelay_req, &self.last_pdelay_resp) {
            (Some(req), Some(resp)) => (req.clone(), resp.clone()),
            _ => {
                debug!(
                    "Port {}: PDelay follow-up {} without outstanding exchange",
                    self.identity, follow_up.header.sequence_id
                );
                return;
            }
        };

        let seq = request.header.sequence_id;
        if response.header.sequence_id != seq || follow_up.header.sequence_id != seq {
            error!(
                "Port {}: PDelay sequence mismatch req {} resp {} fup {}",
                self.identity, seq, response.header.sequence_id, follow_up.header.sequence_id
            );
            return;
        }
        if follow_up.requesting_port != self.identity {
            error!(
                "Port {}: PDelay follow-up addressed to {}",
                self.identity, follow_up.requesting_port
            );
            return;
        }
        if follow_up.header.source != response.header.source {
            error!("Port {}: source port identity from PDelay response/follow-up differ", self.identity);
            return;
        }

        ctx.delete_event_timer(self.handle, Event::PDelayRespReceiptTimeoutExpires);

        let request_tx = match request.timestamp {
            EventTimestamp::Valid(ts) => ts,
            EventTimestamp::Invalid => {
                debug!("Port {}: PDelay request {} was not timestamped", self.identity, seq);
                self.clear_pdelay_exchange();
                return;
            }
            EventTimestamp::Pending => {
                self.last_pdelay_resp_follow_up = Some(follow_up);
                ctx.add_event_timer(
                    self.handle,
                    Event::PDelayDeferredProcessing,
                    PDELAY_DEFERRED_DELAY_NS,
                );
                return;
            }
        };
        let response_rx = match response.timestamp.valid() {
            Some(ts) => ts,
            None => {
                error!("Port {}: PDelay response {} has no RX timestamp", self.identity, seq);
                self.clear_pdelay_exchange();
                return;
            }
        };

        self.pdelay_count += 1;
        let remote_req_rx = response.request_receipt_timestamp;
        let remote_resp_tx = follow_up.response_origin_timestamp;

        let link_delay = compute_link_delay(
            request_tx,
            remote_req_rx,
            remote_resp_tx,
            response_rx,
            self.peer_rate_offset,
        );

        if let Some((prev_mine, prev_theirs)) = self.peer_offset {
            let mine_elapsed = (request_tx - prev_mine) as f64;
            let previous_delay = if self.link_delay_valid() {
                self.one_way_delay_ns
            } else {
                0
            };
            let theirs_elapsed = (remote_req_rx - prev_theirs) as f64 - previous_delay as f64
                + link_delay.max(0) as f64;
            if theirs_elapsed > 0.0 {
                let rate = mine_elapsed / theirs_elapsed;
                if ((rate - 1.0) * 1e6).abs() < PEER_RATE_MAX_PPM {
                    self.peer_rate_offset = rate;
                }
            }
        }

        self.set_link_delay(link_delay);
        self.peer_offset = Some((request_tx, remote_req_rx));
        self.clear_pdelay_exchange();
    }

    fn set_link_delay(&mut self, delay_ns: i64) {
        self.one_way_delay_ns = delay_ns.max(0);
        if delay_ns <= self.config.neighbor_prop_delay_thresh_ns {
            debug!("Port {}: link delay {}ns", self.identity, delay_ns);
            self.set_as_capable(true);
        } else {
            error!(
                "Port {}: link delay {}ns beyond neighborPropDelayThresh; not AsCapable",
                self.identity, delay_ns
            );
            self.set_as_capable(false);
        }
    }

    fn clear_pdelay_exchange(&mut self) {
        self.last_pdelay_req = None;
        self.last_pdelay_resp = None;
    }

    pub(super) fn link_delay_valid(&self) -> bool {
        self.one_way_delay_ns < ONE_WAY_DELAY_DEFAULT_NS
    }
}

/// `((t4 - t1) - rate * (t3 - t2)) / 2`; the neighbor rate ratio is only
/// applied to the turnaround when it looks sane.
fn compute_link_delay(
    t1: PtpTimestamp,
    t2: PtpTimestamp,
    t3: PtpTimestamp,
    t4: PtpTimestamp,
    peer_rate: f64,
) -> i64 {
    let mut turnaround = (t3 - t2) as f64;
    if (peer_rate - 1.0).abs() < PEER_RATE_SANITY_WINDOW {
        turnaround *= peer_rate;
    }
    (((t4 - t1) as f64 - turnaround) / 2.0) as i64
}
