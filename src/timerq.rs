//! One-shot event timers keyed by `(port, event)`.
//!
//! A single worker thread sleeps until the earliest deadline and hands the
//! expired `(port, event)` to a dispatch callback. The queue lock is never
//! held while the callback runs, so handlers are free to arm or cancel timers.
//! The same key may be armed more than once; cancelling removes every pending
//! deadline for that key.

use crate::ptp::{Event, EVENT_TIMER_GRANULARITY_NS};
use crate::traits::PortHandle;
use anyhow::{Context, Result};
use log::{debug, warn};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub trait EventTimers: Send + Sync {
    /// Arm `(port, event)` to fire after `delay`.
    fn add(&self, port: PortHandle, event: Event, delay: Duration);
    fn cancel(&self, port: PortHandle, event: Event);
    fn shutdown(&self) {}
}

pub type Dispatch = Box<dyn Fn(PortHandle, Event) + Send + 'static>;

struct State {
    deadlines: Vec<(PortHandle, Event, Instant)>,
    stopped: bool,
}

struct Shared {
    state: Mutex<State>,
    cond: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct TimerQueue {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

fn round_to_granularity(delay: Duration) -> Duration {
    let granularity = EVENT_TIMER_GRANULARITY_NS as u128;
    let ns = delay.as_nanos();
    let rounded = ((ns + granularity - 1) / granularity).max(1) * granularity;
    Duration::from_nanos(rounded as u64)
}

impl TimerQueue {
    pub fn start(dispatch: Dispatch) -> Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                deadlines: Vec::new(),
                stopped: false,
            }),
            cond: Condvar::new(),
        });

        let worker_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("gptp-timerq".into())
            .spawn(move || run(worker_shared, dispatch))
            .context("Failed to spawn timer thread")?;

        Ok(TimerQueue {
            shared,
            worker: Mutex::new(Some(handle)),
        })
    }

    pub fn is_armed(&self, port: PortHandle, event: Event) -> bool {
        self.shared
            .lock()
            .deadlines
            .iter()
            .any(|(p, e, _)| *p == port && *e == event)
    }

    pub fn stop(&self) {
        self.shared.lock().stopped = true;
        self.shared.cond.notify_all();

        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            // The last clock reference can be dropped from inside a handler.
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!("Timer thread panicked");
            }
        }
    }
}

impl EventTimers for TimerQueue {
    fn add(&self, port: PortHandle, event: Event, delay: Duration) {
        let at = Instant::now() + round_to_granularity(delay);
        self.shared.lock().deadlines.push((port, event, at));
        self.shared.cond.notify_all();
    }

    fn cancel(&self, port: PortHandle, event: Event) {
        let mut state = self.shared.lock();
        let before = state.deadlines.len();
        state.deadlines.retain(|(p, e, _)| !(*p == port && *e == event));
        if state.deadlines.len() != before {
            debug!("Cancelled {:?} on port {}", event, port.0);
        }
    }

    fn shutdown(&self) {
        self.stop();
    }
}

impl Drop for TimerQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(shared: Arc<Shared>, dispatch: Dispatch) {
    loop {
        let (port, event) = {
            let mut state = shared.lock();
            loop {
                if state.stopped {
                    return;
                }
                let next = state
                    .deadlines
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, (_, _, at))| *at)
                    .map(|(idx, (_, _, at))| (idx, *at));
                match next {
                    None => {
                        state = shared
                            .cond
                            .wait(state)
                            .unwrap_or_else(PoisonError::into_inner);
                    }
                    Some((idx, at)) => {
                        let now = Instant::now();
                        if at <= now {
                            let (port, event, _) = state.deadlines.swap_remove(idx);
                            break (port, event);
                        }
                        state = shared
                            .cond
                            .wait_timeout(state, at - now)
                            .unwrap_or_else(PoisonError::into_inner)
                            .0;
                    }
                }
            }
        };
        dispatch(port, event);
    }
}
