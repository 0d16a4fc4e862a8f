use crate::config::ServoConfig;
use log::debug;

pub struct PiServo {
    kp: f64,
    ki: f64,
    integral: f64,
    max_integral: f64,
    max_output: f64,
}

impl PiServo {
    pub fn new(config: &ServoConfig) -> Self {
        PiServo {
            kp: config.kp,
            ki: config.ki,
            integral: 0.0,
            max_integral: config.max_integral_ppm,
            max_output: config.max_freq_adj_ppm,
        }
    }

    pub fn reset(&mut self) {
        self.integral = 0.0;
    }

    /// Frequency adjustment (ppm) that drives `offset_ns` toward zero.
    /// `offset_ns`: local - master, positive when the local clock is ahead.
    pub fn sample(&mut self, offset_ns: i64) -> f64 {
        let error = -offset_ns as f64;

        self.integral = (self.integral + error * self.ki).clamp(-self.max_integral, self.max_integral);
        let proportional = error * self.kp;

        let adjustment_ppm = (proportional + self.integral).clamp(-self.max_output, self.max_output);

        debug!(
            "Servo: Err={}ns, P={:.3}, I={:.3}, Adj={:.3}ppm",
            offset_ns, proportional, self.integral, adjustment_ppm
        );

        adjustment_ppm
    }
}
