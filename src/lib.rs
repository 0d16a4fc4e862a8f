pub mod bmca;
pub mod clock;
pub mod config;
pub mod error;
pub mod message;
pub mod port;
pub mod ptp;
pub mod ptp_clock;
pub mod rate;
pub mod servo;
pub mod status;
pub mod timerq;
pub mod timestamp;
pub mod timestamper;
pub mod traits;

#[cfg(target_os = "linux")]
pub mod net;

pub use ptp_clock::PtpClock;
