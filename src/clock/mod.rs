use anyhow::Result;
use std::time::Duration;

#[cfg_attr(test, mockall::automock)]
pub trait SystemClock: Send {
    /// Adjusts the system clock frequency.
    /// `factor`: ratio of master rate to local rate; 1.0 means no adjustment.
    fn adjust_frequency(&mut self, factor: f64) -> Result<()>;

    /// Steps the clock by `offset`, forward when `sign` is positive.
    fn step_clock(&mut self, offset: Duration, sign: i8) -> Result<()>;
}

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use self::linux::LinuxClock as PlatformClock;
