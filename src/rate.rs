use crate::timestamp::PtpTimestamp;

/// Frequency offset estimate between two timebases, in parts per trillion.
///
/// Each sample pairs an offset between the timebases with the local time it
/// was observed at. The first sample only seeds the estimator.
#[derive(Debug, Clone, Default)]
pub struct RateEstimator {
    previous: Option<(PtpTimestamp, i64)>,
}

impl RateEstimator {
    pub fn new() -> Self {
        RateEstimator { previous: None }
    }

    pub fn sample(&mut self, offset_ns: i64, time: PtpTimestamp) -> f64 {
        let ppt = match self.previous {
            Some((prev_time, prev_offset)) => {
                let dt = time - prev_time;
                if dt == 0 {
                    0.0
                } else {
                    (offset_ns - prev_offset) as f64 * 1e12 / dt as f64
                }
            }
            None => 0.0,
        };
        self.previous = Some((time, offset_ns));
        ppt
    }

    pub fn reset(&mut self) {
        self.previous = None;
    }

    pub fn is_seeded(&self) -> bool {
        self.previous.is_some()
    }
}
