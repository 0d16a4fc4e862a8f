use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TimestampError {
    /// Not captured yet; the caller may retry.
    #[error("timestamp not yet available")]
    NotReady,
    #[error("no timestamp recorded for sequence {0}")]
    NotFound(u16),
    #[error("timestamper device error: {0}")]
    Device(String),
}

impl TimestampError {
    pub fn is_transient(&self) -> bool {
        matches!(self, TimestampError::NotReady)
    }
}
