//! Capture and worker configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Consecutive failures tolerated before escalating to a reconfigure.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
/// Watchdog tick period.
pub const DEFAULT_WATCHDOG_PERIOD: Duration = Duration::from_secs(5);
/// Pause after a drain iteration that produced nothing.
pub const DEFAULT_IDLE_BACKOFF: Duration = Duration::from_millis(1);
/// Upper bound on how long an escalated worker waits between stop checks.
pub const DEFAULT_ESCALATION_POLL: Duration = Duration::from_millis(100);

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("frame size must be non-zero, got {width}x{height}")]
    ZeroDimension { width: u32, height: u32 },
    #[error("frame rate must be finite and positive, got {0}")]
    InvalidFrameRate(f32),
}

/// What to capture and at which size/rate. Fixed for the lifetime of one session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CaptureConfig {
    pub width: u32,
    pub height: u32,
    pub frame_rate: f32,
    pub capture_color: bool,
    pub capture_depth: bool,
}

impl CaptureConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.width == 0 || self.height == 0 {
            return Err(ConfigError::ZeroDimension {
                width: self.width,
                height: self.height,
            });
        }
        if !(self.frame_rate.is_finite() && self.frame_rate > 0.0) {
            return Err(ConfigError::InvalidFrameRate(self.frame_rate));
        }
        Ok(())
    }
}

/// Supervisor tuning. The defaults match production behaviour; tests shorten the periods.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorkerOptions {
    pub failure_threshold: u32,
    pub watchdog_period: Duration,
    pub idle_backoff: Duration,
    pub escalation_poll: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            watchdog_period: DEFAULT_WATCHDOG_PERIOD,
            idle_backoff: DEFAULT_IDLE_BACKOFF,
            escalation_poll: DEFAULT_ESCALATION_POLL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(width: u32, height: u32, frame_rate: f32) -> CaptureConfig {
        CaptureConfig {
            width,
            height,
            frame_rate,
            capture_color: true,
            capture_depth: true,
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(config(640, 480, 30.0).validate().is_ok());
    }

    #[test]
    fn test_zero_dimension_rejected() {
        assert_eq!(
            config(0, 480, 30.0).validate(),
            Err(ConfigError::ZeroDimension {
                width: 0,
                height: 480
            })
        );
    }

    #[test]
    fn test_bad_frame_rate_rejected() {
        assert!(config(640, 480, 0.0).validate().is_err());
        assert!(config(640, 480, -5.0).validate().is_err());
        assert!(config(640, 480, f32::NAN).validate().is_err());
        assert!(config(640, 480, f32::INFINITY).validate().is_err());
    }

    #[test]
    fn test_default_options() {
        let opts = WorkerOptions::default();
        assert_eq!(opts.failure_threshold, 3);
        assert_eq!(opts.watchdog_period, Duration::from_secs(5));
    }
}
