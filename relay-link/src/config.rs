//! Startup configuration.
//!
//! Read once from environment variables; front ends may override individual
//! fields before building the link. Nothing re-reads the environment later.

use std::time::Duration;

use crate::{tracing::prelude::*, types::DevicePath};

/// Baud rate of CH340 relay modules.
pub const DEFAULT_BAUD: u32 = 9600;

/// Bound on one request/reply round trip.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// Status poll interval used by interactive front ends.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Relay link configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    /// Fixed device node; `None` means discover it.
    pub device: Option<DevicePath>,

    pub baud: u32,

    /// Exchange timeout.
    pub timeout: Duration,

    /// Caller-side status polling; `None` disables polling.
    pub poll_interval: Option<Duration>,

    /// Whether the worker retries `reconnect()` on each poll tick while the
    /// link is down.
    pub auto_reconnect: bool,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            device: None,
            baud: DEFAULT_BAUD,
            timeout: DEFAULT_TIMEOUT,
            poll_interval: Some(DEFAULT_POLL_INTERVAL),
            auto_reconnect: false,
        }
    }
}

impl LinkConfig {
    /// Parse configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `RELAY_DEVICE`: device node override (default: auto-discovery)
    /// - `RELAY_BAUD`: baud rate (default: 9600)
    /// - `RELAY_TIMEOUT_MS`: exchange timeout in ms (default: 1000)
    /// - `RELAY_POLL_MS`: status poll interval in ms, `0` disables (default: 1000)
    /// - `RELAY_AUTO_RECONNECT`: `1`/`true` to reconnect on each poll tick
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let device = std::env::var("RELAY_DEVICE")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .map(DevicePath::new);

        let baud = parse_env("RELAY_BAUD", |v: u32| v > 0).unwrap_or(defaults.baud);

        let timeout = parse_env("RELAY_TIMEOUT_MS", |v: u64| v > 0)
            .map(Duration::from_millis)
            .unwrap_or(defaults.timeout);

        let poll_interval = match parse_env("RELAY_POLL_MS", |_: u64| true) {
            Some(0) => None,
            Some(ms) => Some(Duration::from_millis(ms)),
            None => defaults.poll_interval,
        };

        let auto_reconnect = std::env::var("RELAY_AUTO_RECONNECT")
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(defaults.auto_reconnect);

        Self {
            device,
            baud,
            timeout,
            poll_interval,
            auto_reconnect,
        }
    }
}

// Parse a numeric variable, warning and returning None on garbage.
fn parse_env<T>(name: &str, valid: impl Fn(T) -> bool) -> Option<T>
where
    T: std::str::FromStr + Copy + std::fmt::Display,
{
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<T>() {
        Ok(v) if valid(v) => Some(v),
        Ok(v) => {
            warn!(variable = name, value = %v, "Out of range, using default");
            None
        }
        Err(_) => {
            warn!(variable = name, value = %raw, "Unparseable, using default");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "RELAY_DEVICE",
        "RELAY_BAUD",
        "RELAY_TIMEOUT_MS",
        "RELAY_POLL_MS",
        "RELAY_AUTO_RECONNECT",
    ];

    fn clear_env() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_defaults_when_unset() {
        clear_env();

        let config = LinkConfig::from_env();
        assert_eq!(config, LinkConfig::default());
        assert_eq!(config.baud, 9600);
        assert_eq!(config.timeout, Duration::from_secs(1));
    }

    #[test]
    #[serial]
    fn test_overrides() {
        clear_env();
        std::env::set_var("RELAY_DEVICE", "/dev/ttyUSB3");
        std::env::set_var("RELAY_BAUD", "19200");
        std::env::set_var("RELAY_TIMEOUT_MS", "250");
        std::env::set_var("RELAY_POLL_MS", "0");
        std::env::set_var("RELAY_AUTO_RECONNECT", "true");

        let config = LinkConfig::from_env();
        assert_eq!(config.device, Some(DevicePath::new("/dev/ttyUSB3")));
        assert_eq!(config.baud, 19200);
        assert_eq!(config.timeout, Duration::from_millis(250));
        assert_eq!(config.poll_interval, None);
        assert!(config.auto_reconnect);

        clear_env();
    }

    #[test]
    #[serial]
    fn test_invalid_values_fall_back() {
        clear_env();
        std::env::set_var("RELAY_DEVICE", "  ");
        std::env::set_var("RELAY_BAUD", "fast");
        std::env::set_var("RELAY_TIMEOUT_MS", "0");

        let config = LinkConfig::from_env();
        assert_eq!(config.device, None);
        assert_eq!(config.baud, DEFAULT_BAUD);
        assert_eq!(config.timeout, DEFAULT_TIMEOUT);

        clear_env();
    }
}
