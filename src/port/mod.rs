//! Per-port gPTP state machine.
//!
//! A `Port` owns its state, timers (armed through its clock), qualified
//! Announce list and the message slots of the exchanges in flight. Every
//! entry point runs with the port's arena mutex held, so a port processes one
//! event or message at a time.

mod receive;
mod transmit;

use crate::config::PortConfig;
use crate::message::{Announce, PDelayReq, PDelayResp, PDelayRespFollowUp, Sync};
use crate::ptp::{
    interval_ns, Event, PortIdentity, PortState, ONE_WAY_DELAY_DEFAULT_NS, PDELAY_START_DELAY_NS,
    SLAVE_ONLY_PRIORITY1, TRANSMIT_START_DELAY_NS,
};
use crate::rate::RateEstimator;
use crate::timestamp::PtpTimestamp;
use crate::traits::{HwTimestamper, PortContext, PortHandle, PtpNetwork};
use log::{debug, error, info, warn};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Network side of a port: the link, its timestamper and the locks that
/// serialize receive-side PDelay processing and transmit-side timestamp
/// collection.
pub struct PortLink {
    pub network: Arc<dyn PtpNetwork>,
    pub timestamper: Arc<dyn HwTimestamper>,
    rx_lock: Mutex<()>,
    tx_lock: Mutex<()>,
}

impl PortLink {
    pub fn new(network: Arc<dyn PtpNetwork>, timestamper: Arc<dyn HwTimestamper>) -> Arc<Self> {
        Arc::new(PortLink {
            network,
            timestamper,
            rx_lock: Mutex::new(()),
            tx_lock: Mutex::new(()),
        })
    }
}

pub struct Port {
    handle: PortHandle,
    identity: PortIdentity,
    state: PortState,
    config: PortConfig,
    as_capable: bool,

    log_sync_interval: i8,
    log_announce_interval: i8,
    log_pdelay_interval: i8,

    sync_sequence_id: u16,
    announce_sequence_id: u16,
    pdelay_sequence_id: u16,

    qualified_announces: VecDeque<Announce>,
    last_sync: Option<Sync>,
    last_pdelay_req: Option<PDelayReq>,
    last_pdelay_resp: Option<PDelayResp>,
    last_pdelay_resp_follow_up: Option<PDelayRespFollowUp>,

    master_local: RateEstimator,
    local_system: RateEstimator,
    one_way_delay_ns: i64,
    peer_rate_offset: f64,
    /// (our request egress, their request ingress) of the last completed exchange
    peer_offset: Option<(PtpTimestamp, PtpTimestamp)>,

    sync_count: u32,
    pdelay_count: u32,
    receiver_started: bool,

    link: Arc<PortLink>,
}

impl Port {
    pub fn new(
        handle: PortHandle,
        identity: PortIdentity,
        config: &PortConfig,
        link: Arc<PortLink>,
    ) -> Self {
        Port {
            handle,
            identity,
            state: PortState::Initializing,
            config: config.clone(),
            as_capable: false,
            log_sync_interval: config.log_sync_interval,
            log_announce_interval: config.log_announce_interval,
            log_pdelay_interval: config.log_pdelay_interval,
            sync_sequence_id: 0,
            announce_sequence_id: 0,
            pdelay_sequence_id: 0,
            qualified_announces: VecDeque::new(),
            last_sync: None,
            last_pdelay_req: None,
            last_pdelay_resp: None,
            last_pdelay_resp_follow_up: None,
            master_local: RateEstimator::new(),
            local_system: RateEstimator::new(),
            one_way_delay_ns: ONE_WAY_DELAY_DEFAULT_NS,
            peer_rate_offset: 1.0,
            peer_offset: None,
            sync_count: 0,
            pdelay_count: 0,
            receiver_started: false,
            link,
        }
    }

    pub fn handle(&self) -> PortHandle {
        self.handle
    }

    pub fn identity(&self) -> PortIdentity {
        self.identity
    }

    pub fn state(&self) -> PortState {
        self.state
    }

    pub fn link(&self) -> &Arc<PortLink> {
        &self.link
    }

    pub fn force_slave(&self) -> bool {
        self.config.force_slave
    }

    pub fn as_capable(&self) -> bool {
        self.as_capable
    }

    pub fn one_way_delay_ns(&self) -> i64 {
        self.one_way_delay_ns
    }

    pub fn peer_rate_offset(&self) -> f64 {
        self.peer_rate_offset
    }

    pub fn sync_count(&self) -> u32 {
        self.sync_count
    }

    pub fn pdelay_count(&self) -> u32 {
        self.pdelay_count
    }

    pub fn qualified_announce_count(&self) -> usize {
        self.qualified_announces.len()
    }

    pub(crate) fn set_as_capable(&mut self, capable: bool) {
        if capable != self.as_capable {
            info!(
                "Port {}: AsCapable {}",
                self.identity,
                if capable { "enabled" } else { "disabled" }
            );
        }
        self.as_capable = capable;
    }

    pub(crate) fn set_state(&mut self, state: PortState) {
        if state != self.state {
            debug!("Port {}: {} -> {}", self.identity, self.state, state);
        }
        self.state = state;
    }

    fn sync_receipt_timeout_ns(&self) -> u64 {
        u64::from(self.config.sync_receipt_timeout_multiplier) * interval_ns(self.log_sync_interval)
    }

    fn announce_receipt_timeout_ns(&self) -> u64 {
        u64::from(self.config.announce_receipt_timeout_multiplier)
            * interval_ns(self.log_announce_interval)
    }

    /// Handle one protocol event. Never fails; problems are logged.
    pub fn process_event(&mut self, event: Event, ctx: &dyn PortContext) {
        match event {
            Event::PowerUp | Event::Initialize => self.power_up(ctx),
            Event::StateChange => {
                // BMCA spans every port and is run by the clock.
                warn!("Port {}: StateChange delivered to a single port", self.identity);
            }
            Event::AnnounceReceiptTimeoutExpires | Event::SyncReceiptTimeoutExpires => {
                self.receipt_timeout(event, ctx)
            }
            Event::PDelayIntervalTimeoutExpires => self.pdelay_interval_expired(ctx),
            Event::SyncIntervalTimeoutExpires => self.sync_interval_expired(ctx),
            Event::AnnounceIntervalTimeoutExpires => self.announce_interval_expired(ctx),
            Event::FaultDetected => {
                error!("Port {}: fault detected on link", self.identity);
            }
            Event::PDelayDeferredProcessing => self.deferred_processing(ctx),
            Event::PDelayRespReceiptTimeoutExpires => {
                warn!("Port {}: PDelay response receipt timeout", self.identity);
                self.set_as_capable(false);
                self.pdelay_count = 0;
            }
            Event::Null => {
                warn!("Port {}: unhandled event {:?}", self.identity, event);
            }
        }
    }

    /// Forced slave by configuration, or the whole clock is slave-only.
    fn slave_only(&self, ctx: &dyn PortContext) -> bool {
        self.config.force_slave || ctx.local_dataset().priority1 == SLAVE_ONLY_PRIORITY1
    }

    /// Arm a timer, dropping any deadline already queued for the same event.
    fn restart_timer(&self, ctx: &dyn PortContext, event: Event, delay_ns: u64) {
        ctx.delete_event_timer(self.handle, event);
        ctx.add_event_timer(self.handle, event, delay_ns);
    }

    fn power_up(&mut self, ctx: &dyn PortContext) {
        self.restart_timer(ctx, Event::PDelayIntervalTimeoutExpires, PDELAY_START_DELAY_NS);
        if self.slave_only(ctx) {
            self.set_state(PortState::Slave);
            info!("Port {}: starting in forced SLAVE mode", self.identity);
        } else {
            self.set_state(PortState::Listening);
            self.restart_timer(
                ctx,
                Event::SyncReceiptTimeoutExpires,
                self.sync_receipt_timeout_ns(),
            );
            self.restart_timer(
                ctx,
                Event::AnnounceReceiptTimeoutExpires,
                self.announce_receipt_timeout_ns(),
            );
            info!("Port {}: LISTENING", self.identity);
        }

        if !self.receiver_started {
            ctx.start_receive_loop(self.handle);
            self.receiver_started = true;
        }
    }

    fn receipt_timeout(&mut self, event: Event, ctx: &dyn PortContext) {
        if self.slave_only(ctx) {
            debug!("Port {}: {:?} ignored in forced SLAVE mode", self.identity, event);
            return;
        }
        if !matches!(
            self.state,
            PortState::Listening | PortState::Uncalibrated | PortState::Slave | PortState::PreMaster
        ) {
            return;
        }

        info!(
            "Port {}: {:?} in {}, becoming MASTER (grandmaster)",
            self.identity, event, self.state
        );
        ctx.become_grandmaster();
        self.set_state(PortState::Master);

        let (system, device) = self.device_time(ctx);
        let local_system_offset = (system - device) as i64;
        self.local_system.sample(local_system_offset, system);
        ctx.reset_frequency_adjustment();

        self.qualified_announces.clear();

        ctx.add_event_timer(
            self.handle,
            Event::SyncIntervalTimeoutExpires,
            TRANSMIT_START_DELAY_NS,
        );
        ctx.add_event_timer(
            self.handle,
            Event::AnnounceIntervalTimeoutExpires,
            TRANSMIT_START_DELAY_NS,
        );
    }

    /// Apply a BMCA recommendation. Repeating the current state is a no-op
    /// as far as timers go.
    pub fn recommend_state(&mut self, state: PortState, changed_master: bool, ctx: &dyn PortContext) {
        match state {
            PortState::Master => {
                if self.state != PortState::Master {
                    self.set_state(PortState::Master);
                    ctx.add_event_timer(
                        self.handle,
                        Event::AnnounceIntervalTimeoutExpires,
                        TRANSMIT_START_DELAY_NS,
                    );
                    ctx.add_event_timer(
                        self.handle,
                        Event::SyncIntervalTimeoutExpires,
                        TRANSMIT_START_DELAY_NS,
                    );
                    info!("Port {}: switching to MASTER", self.identity);
                }
            }
            PortState::Slave => {
                if self.state != PortState::Slave {
                    self.set_state(PortState::Slave);
                    ctx.delete_event_timer(self.handle, Event::AnnounceIntervalTimeoutExpires);
                    ctx.delete_event_timer(self.handle, Event::SyncIntervalTimeoutExpires);
                    ctx.add_event_timer(
                        self.handle,
                        Event::SyncReceiptTimeoutExpires,
                        self.sync_receipt_timeout_ns(),
                    );
                    ctx.add_event_timer(
                        self.handle,
                        Event::AnnounceReceiptTimeoutExpires,
                        self.announce_receipt_timeout_ns(),
                    );
                    info!("Port {}: switching to SLAVE", self.identity);
                } else if changed_master {
                    info!("Port {}: following a new master", self.identity);
                }
            }
            other => {
                error!(
                    "Port {}: invalid state change requested ({})",
                    self.identity, other
                );
            }
        }
    }

    /// Best qualified Announce, dropping every other entry.
    pub fn calculate_er_best(&mut self) -> Option<&Announce> {
        let best = self
            .qualified_announces
            .drain(..)
            .reduce(|best, candidate| {
                if candidate.is_better_than(&best) {
                    candidate
                } else {
                    best
                }
            })?;
        self.qualified_announces.push_back(best);
        self.qualified_announces.back()
    }

    /// (system, device) time, falling back to the clock's system time when
    /// the timestamper cannot provide it.
    fn device_time(&self, ctx: &dyn PortContext) -> (PtpTimestamp, PtpTimestamp) {
        match self.link.timestamper.device_time() {
            Ok(t) => (t.system, t.device),
            Err(e) => {
                debug!("Port {}: device time unavailable: {}", self.identity, e);
                let now = ctx.system_time();
                (now, now)
            }
        }
    }
}

#[cfg(test)]
mod tests;
