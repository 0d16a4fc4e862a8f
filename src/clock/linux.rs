use super::SystemClock;
use anyhow::{anyhow, Result};
use libc::{adjtimex, clock_gettime, clock_settime, timespec, timex, ADJ_FREQUENCY, CLOCK_REALTIME};
use log::{debug, info, warn};
use std::mem;
use std::time::Duration;

/// adjtimex frequency is ppm scaled by 2^16.
const FREQ_SCALE: f64 = 65536.0;

pub struct LinuxClock {
    original_freq: i64,
}

impl LinuxClock {
    pub fn new() -> Result<Self> {
        let mut tx: timex = unsafe { mem::zeroed() };
        tx.modes = 0; // query

        let ret = unsafe { adjtimex(&mut tx) };
        if ret < 0 {
            return Err(anyhow!("adjtimex failed (are you root?)"));
        }
        info!(
            "System clock frequency at startup: {:+.3} ppm",
            tx.freq as f64 / FREQ_SCALE
        );

        Ok(LinuxClock {
            original_freq: tx.freq as i64,
        })
    }

    fn set_freq(freq: i64) -> Result<()> {
        let mut tx: timex = unsafe { mem::zeroed() };
        tx.modes = ADJ_FREQUENCY;
        tx.freq = freq as _;
        let ret = unsafe { adjtimex(&mut tx) };
        if ret < 0 {
            return Err(anyhow!("adjtimex failed to set frequency"));
        }
        Ok(())
    }
}

impl SystemClock for LinuxClock {
    fn adjust_frequency(&mut self, factor: f64) -> Result<()> {
        let ppm = (factor - 1.0) * 1_000_000.0;
        debug!("Adjusting system clock by {:+.3} ppm", ppm);
        Self::set_freq((ppm * FREQ_SCALE) as i64)
    }

    fn step_clock(&mut self, offset: Duration, sign: i8) -> Result<()> {
        let mut ts: timespec = unsafe { mem::zeroed() };
        if unsafe { clock_gettime(CLOCK_REALTIME, &mut ts) } < 0 {
            return Err(anyhow!("clock_gettime failed"));
        }

        let now_ns = ts.tv_sec as i128 * 1_000_000_000 + ts.tv_nsec as i128;
        let delta = offset.as_nanos() as i128;
        let target = if sign > 0 { now_ns + delta } else { now_ns - delta };

        ts.tv_sec = target.div_euclid(1_000_000_000) as _;
        ts.tv_nsec = target.rem_euclid(1_000_000_000) as _;

        if unsafe { clock_settime(CLOCK_REALTIME, &ts) } < 0 {
            return Err(anyhow!("clock_settime failed"));
        }
        info!(
            "Stepped system clock {}{:?}",
            if sign > 0 { "+" } else { "-" },
            offset
        );
        Ok(())
    }
}

impl Drop for LinuxClock {
    fn drop(&mut self) {
        if let Err(e) = Self::set_freq(self.original_freq) {
            warn!("Failed to restore system clock frequency: {}", e);
        }
    }
}
