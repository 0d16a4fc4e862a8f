//! The clock: port arena, timers, grandmaster bookkeeping and local clock
//! discipline.
//!
//! Events and messages reach a port through [`PtpClock::process_event`] and
//! [`PtpClock::process_message`], which lock the port's arena slot for the
//! duration of the call. `StateChange` is the exception: BMCA is run by the
//! clock itself with every port locked.

use crate::clock::SystemClock;
use crate::config::{ClockConfig, GptpConfig, PortConfig};
use crate::message::{AnnounceDataset, PtpMessage};
use crate::port::{Port, PortLink};
use crate::ptp::{
    ClockIdentity, Event, PortIdentity, PortState, RX_TIMEOUT_RETRIES, TX_TIMEOUT_BASE,
};
use crate::servo::PiServo;
use crate::status::{MasterOffset, SyncStatus};
use crate::timerq::{EventTimers, TimerQueue};
use crate::timestamp::{EventTimestamp, PtpTimestamp};
use crate::traits::{PortContext, PortHandle};
use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone)]
pub(crate) struct PortSlot {
    pub(crate) port: Arc<Mutex<Port>>,
    pub(crate) link: Arc<PortLink>,
}

#[derive(Default)]
pub(crate) struct BmcaState {
    pub(crate) last_ebest_identity: Option<ClockIdentity>,
}

struct Discipline {
    servo: PiServo,
    system_clock: Option<Box<dyn SystemClock>>,
    status: SyncStatus,
}

pub struct PtpClock {
    weak_self: Weak<PtpClock>,
    config: RwLock<ClockConfig>,
    identity: RwLock<ClockIdentity>,
    pub(crate) ports: RwLock<Vec<Option<PortSlot>>>,
    pub(crate) bmca: Mutex<BmcaState>,
    grandmaster: Mutex<AnnounceDataset>,
    timers: Box<dyn EventTimers>,
    discipline: Mutex<Discipline>,
    running: AtomicBool,
    receivers: Mutex<Vec<JoinHandle<()>>>,
}

impl PtpClock {
    /// Clock driven by its own timer thread.
    pub fn new(config: &GptpConfig, system_clock: Option<Box<dyn SystemClock>>) -> Result<Arc<Self>> {
        let target: Arc<OnceLock<Weak<PtpClock>>> = Arc::new(OnceLock::new());
        let dispatch_target = target.clone();
        let timers = TimerQueue::start(Box::new(move |port, event| {
            if let Some(clock) = dispatch_target.get().and_then(Weak::upgrade) {
                clock.process_event(port, event);
            }
        }))?;

        let clock = Self::with_timers(config, system_clock, Box::new(timers));
        let _ = target.set(Arc::downgrade(&clock));
        Ok(clock)
    }

    pub fn with_timers(
        config: &GptpConfig,
        system_clock: Option<Box<dyn SystemClock>>,
        timers: Box<dyn EventTimers>,
    ) -> Arc<Self> {
        let identity = ClockIdentity::default();
        Arc::new_cyclic(|weak| PtpClock {
            weak_self: weak.clone(),
            config: RwLock::new(config.clock.clone()),
            identity: RwLock::new(identity),
            ports: RwLock::new(Vec::new()),
            bmca: Mutex::new(BmcaState::default()),
            grandmaster: Mutex::new(config.clock.dataset(identity)),
            timers,
            discipline: Mutex::new(Discipline {
                servo: PiServo::new(&config.servo),
                system_clock,
                status: SyncStatus::default(),
            }),
            running: AtomicBool::new(true),
            receivers: Mutex::new(Vec::new()),
        })
    }

    pub fn clock_identity(&self) -> ClockIdentity {
        *self.identity.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn clock_config(&self) -> ClockConfig {
        self.config.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Change the advertised priority1. Takes effect in the next Announce
    /// and BMCA run.
    pub fn set_priority1(&self, priority1: u8) {
        self.config
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .priority1 = priority1;
        info!("Clock priority1 set to {}", priority1);
    }

    pub fn set_clock_identity(&self, identity: ClockIdentity) {
        *self.identity.write().unwrap_or_else(PoisonError::into_inner) = identity;
        info!("Clock identity {}", identity);
    }

    /// Register a port. The first port's link address names the clock when
    /// no identity has been set.
    pub fn add_port(&self, config: &PortConfig, link: Arc<PortLink>) -> PortHandle {
        if self.clock_identity() == ClockIdentity::default() {
            self.set_clock_identity(ClockIdentity::from_mac(link.network.link_layer_address()));
        }

        let mut ports = self.ports.write().unwrap_or_else(PoisonError::into_inner);
        let handle = PortHandle(ports.len());
        let identity = PortIdentity::new(self.clock_identity(), (handle.0 + 1) as u16);
        let port = Port::new(handle, identity, config, link.clone());
        ports.push(Some(PortSlot {
            port: Arc::new(Mutex::new(port)),
            link,
        }));
        info!("Added port {} (handle {})", identity, handle.0);
        handle
    }

    /// Empty the port's slot. Its handle is not reused.
    pub fn remove_port(&self, handle: PortHandle) {
        let mut ports = self.ports.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = ports.get_mut(handle.0) {
            if slot.take().is_some() {
                info!("Removed port handle {}", handle.0);
            }
        }
    }

    pub fn port_handles(&self) -> Vec<PortHandle> {
        self.ports
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|_| PortHandle(i)))
            .collect()
    }

    fn slot(&self, handle: PortHandle) -> Option<PortSlot> {
        self.ports
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(handle.0)
            .and_then(|slot| slot.clone())
    }

    pub fn with_port<R>(&self, handle: PortHandle, f: impl FnOnce(&Port) -> R) -> Option<R> {
        self.slot(handle).map(|slot| f(&lock(&slot.port)))
    }

    pub fn process_event(&self, handle: PortHandle, event: Event) {
        if event == Event::StateChange {
            self.run_bmca();
            return;
        }
        match self.slot(handle) {
            Some(slot) => lock(&slot.port).process_event(event, self),
            None => warn!("{:?} for unknown port handle {}", event, handle.0),
        }
    }

    pub fn process_message(&self, handle: PortHandle, message: PtpMessage) {
        match self.slot(handle) {
            Some(slot) => lock(&slot.port).process_message(message, self),
            None => debug!("Message for unknown port handle {} dropped", handle.0),
        }
    }

    /// Whether this clock beats the given dataset.
    pub fn is_better_than(&self, other: &AnnounceDataset) -> bool {
        self.local_dataset().is_better_than(other)
    }

    pub fn last_ebest_identity(&self) -> Option<ClockIdentity> {
        lock(&self.bmca).last_ebest_identity
    }

    pub fn grandmaster(&self) -> AnnounceDataset {
        lock(&self.grandmaster).clone()
    }

    pub(crate) fn set_grandmaster(&self, dataset: AnnounceDataset) {
        let mut gm = lock(&self.grandmaster);
        if gm.grandmaster_identity != dataset.grandmaster_identity {
            info!("Grandmaster is now {}", dataset.grandmaster_identity);
        }
        *gm = dataset;
    }

    pub fn status(&self) -> SyncStatus {
        let mut status = lock(&self.discipline).status.clone();
        status.gm_identity = Some(self.grandmaster().grandmaster_identity.to_string());
        status
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop timers and receive loops and wait for the receive threads.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down clock {}", self.clock_identity());
        self.timers.shutdown();
        let handles: Vec<JoinHandle<()>> = lock(&self.receivers).drain(..).collect();
        for handle in handles {
            if handle.thread().id() == thread::current().id() {
                continue;
            }
            if handle.join().is_err() {
                warn!("Receive thread panicked");
            }
        }
    }

    fn spawn_receiver(&self, handle: PortHandle) -> Result<()> {
        let link = match self.slot(handle) {
            Some(slot) => slot.link,
            None => return Ok(()),
        };
        let clock = self.weak_self.clone();
        let thread = thread::Builder::new()
            .name(format!("gptp-rx-{}", handle.0))
            .spawn(move || receive_loop(clock, handle, link))
            .context("Failed to spawn receive thread")?;
        lock(&self.receivers).push(thread);
        Ok(())
    }
}

impl Drop for PtpClock {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

fn receive_loop(clock: Weak<PtpClock>, handle: PortHandle, link: Arc<PortLink>) {
    debug!("Receive loop for port handle {} started", handle.0);
    loop {
        let received = link.network.recv_message();

        let Some(clock) = clock.upgrade() else { break };
        if !clock.is_running() {
            break;
        }

        match received {
            Ok(None) => {}
            Ok(Some(mut message)) => {
                if message.is_event() {
                    message.set_timestamp(collect_rx_timestamp(&link, &message));
                }
                clock.process_message(handle, message);
            }
            Err(e) => {
                error!("Receive failed on port handle {}: {:#}", handle.0, e);
                clock.process_event(handle, Event::FaultDetected);
                break;
            }
        }
    }
    debug!("Receive loop for port handle {} stopped", handle.0);
}

fn collect_rx_timestamp(link: &PortLink, message: &PtpMessage) -> EventTimestamp {
    let header = message.header();
    for attempt in 0..RX_TIMEOUT_RETRIES {
        let last = attempt + 1 == RX_TIMEOUT_RETRIES;
        match link
            .timestamper
            .rx_timestamp(&header.source, header.sequence_id, last)
        {
            Ok((ts, _)) => return EventTimestamp::Valid(ts),
            Err(e) if !last && e.is_transient() => thread::sleep(TX_TIMEOUT_BASE),
            Err(e) => {
                error!(
                    "Error (RX) timestamping {:?} seq {}: {}\t{}",
                    message.message_type(),
                    header.sequence_id,
                    e,
                    link.timestamper.extended_error()
                );
                break;
            }
        }
    }
    EventTimestamp::Invalid
}

impl PortContext for PtpClock {
    fn add_event_timer(&self, port: PortHandle, event: Event, delay_ns: u64) {
        self.timers.add(port, event, Duration::from_nanos(delay_ns));
    }

    fn delete_event_timer(&self, port: PortHandle, event: Event) {
        self.timers.cancel(port, event);
    }

    fn clock_identity(&self) -> ClockIdentity {
        PtpClock::clock_identity(self)
    }

    fn local_dataset(&self) -> AnnounceDataset {
        self.clock_config().dataset(self.clock_identity())
    }

    fn system_time(&self) -> PtpTimestamp {
        PtpTimestamp::now()
    }

    fn become_grandmaster(&self) {
        self.set_grandmaster(self.local_dataset());
    }

    fn set_master_offset(&self, report: MasterOffset) {
        let config = self.clock_config();
        let mut d = lock(&self.discipline);
        d.status.apply(&report);

        if !config.syntonize || report.port_state != PortState::Slave {
            return;
        }

        let offset = report.master_offset_ns;
        let Discipline {
            servo,
            system_clock,
            status,
        } = &mut *d;
        let Some(system_clock) = system_clock.as_mut() else {
            return;
        };

        if config.stepping_enabled && offset.abs() > config.step_threshold_ns {
            // positive offset: local clock ahead of master
            let sign = if offset > 0 { -1 } else { 1 };
            warn!("Offset {}ns beyond step threshold, stepping clock", offset);
            match system_clock.step_clock(Duration::from_nanos(offset.unsigned_abs()), sign) {
                Ok(()) => servo.reset(),
                Err(e) => error!("Clock step failed: {}", e),
            }
            return;
        }

        let ppm = servo.sample(offset);
        match system_clock.adjust_frequency(1.0 + ppm / 1_000_000.0) {
            Ok(()) => status.freq_adj_ppm = ppm,
            Err(e) => warn!("Clock adjustment failed: {}", e),
        }
    }

    fn reset_frequency_adjustment(&self) {
        if !self.clock_config().syntonize {
            return;
        }
        let mut d = lock(&self.discipline);
        d.servo.reset();
        d.status.freq_adj_ppm = 0.0;
        if let Some(system_clock) = d.system_clock.as_mut() {
            if let Err(e) = system_clock.adjust_frequency(1.0) {
                warn!("Failed to reset frequency adjustment: {}", e);
            }
        }
    }

    fn start_receive_loop(&self, port: PortHandle) {
        if let Err(e) = self.spawn_receiver(port) {
            error!("{:#}", e);
        }
    }
}
