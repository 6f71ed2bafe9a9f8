use anyhow::{Context, Result};
use oakd_core::{CaptureConfig, WorkerOptions};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration, loaded from environment variables and an optional TOML file.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub capture: CaptureConfig,
    /// Device backend. Only `sim` is built in.
    pub device: String,
    /// Seconds between status log lines.
    pub status_interval_secs: u64,
    /// Watchdog tick period in seconds.
    pub watchdog_period_secs: u64,
    /// Link-loss faults injected into the simulated device at startup.
    pub sim_drain_failures: u32,
    /// TOML file the `[capture]` table was read from, if any.
    pub file: Option<PathBuf>,
}

/// Layout of the optional TOML file. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    capture: Option<CaptureFile>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct CaptureFile {
    width: Option<u32>,
    height: Option<u32>,
    frame_rate: Option<f32>,
    capture_color: Option<bool>,
    capture_depth: Option<bool>,
}

impl Config {
    /// Load `OAKD_*` environment variables, then overlay `OAKD_CONFIG` if set.
    pub fn load() -> Result<Self> {
        let mut config = Self::from_env();
        if let Some(path) = config.file.clone() {
            let src = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            config
                .apply_toml(&src)
                .with_context(|| format!("parsing {}", path.display()))?;
        }
        config
            .capture
            .validate()
            .context("invalid capture configuration")?;
        Ok(config)
    }

    pub fn from_env() -> Self {
        Self {
            capture: CaptureConfig {
                width: env_or("OAKD_WIDTH", 640),
                height: env_or("OAKD_HEIGHT", 480),
                frame_rate: env_or("OAKD_FRAME_RATE", 30.0),
                capture_color: env_bool("OAKD_CAPTURE_COLOR", true),
                capture_depth: env_bool("OAKD_CAPTURE_DEPTH", true),
            },
            device: std::env::var("OAKD_DEVICE").unwrap_or_else(|_| "sim".to_string()),
            status_interval_secs: env_or("OAKD_STATUS_INTERVAL_SECS", 10),
            watchdog_period_secs: env_or("OAKD_WATCHDOG_PERIOD_SECS", 5),
            sim_drain_failures: env_or("OAKD_SIM_DRAIN_FAILURES", 0),
            file: std::env::var("OAKD_CONFIG").ok().map(PathBuf::from),
        }
    }

    /// Overlay values from a TOML document onto this configuration.
    pub fn apply_toml(&mut self, src: &str) -> Result<(), toml::de::Error> {
        let file: FileConfig = toml::from_str(src)?;
        if let Some(c) = file.capture {
            let capture = &mut self.capture;
            capture.width = c.width.unwrap_or(capture.width);
            capture.height = c.height.unwrap_or(capture.height);
            capture.frame_rate = c.frame_rate.unwrap_or(capture.frame_rate);
            capture.capture_color = c.capture_color.unwrap_or(capture.capture_color);
            capture.capture_depth = c.capture_depth.unwrap_or(capture.capture_depth);
        }
        Ok(())
    }

    pub fn worker_options(&self) -> WorkerOptions {
        WorkerOptions {
            watchdog_period: Duration::from_secs(self.watchdog_period_secs.max(1)),
            ..WorkerOptions::default()
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .and_then(|v| parse_bool(&v))
        .unwrap_or(default)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Config {
        Config {
            capture: CaptureConfig {
                width: 640,
                height: 480,
                frame_rate: 30.0,
                capture_color: true,
                capture_depth: true,
            },
            device: "sim".into(),
            status_interval_secs: 10,
            watchdog_period_secs: 5,
            sim_drain_failures: 0,
            file: None,
        }
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("1"), Some(true));
        assert_eq!(parse_bool(" TRUE "), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn test_toml_overlay_partial() {
        let mut config = base();
        config
            .apply_toml("[capture]\nwidth = 1280\ncapture_depth = false\n")
            .unwrap();
        assert_eq!(config.capture.width, 1280);
        assert_eq!(config.capture.height, 480);
        assert!(!config.capture.capture_depth);
        assert!(config.capture.capture_color);
    }

    #[test]
    fn test_toml_empty_document() {
        let mut config = base();
        config.apply_toml("").unwrap();
        assert_eq!(config, base());
    }

    #[test]
    fn test_toml_unknown_key_rejected() {
        let mut config = base();
        assert!(config.apply_toml("[capture]\nfps = 30\n").is_err());
    }

    #[test]
    fn test_worker_options_period() {
        let mut config = base();
        config.watchdog_period_secs = 0;
        assert_eq!(config.worker_options().watchdog_period, Duration::from_secs(1));
    }
}
