//! Session configuration.
//!
//! Everything here has a default that matches a stock proxy stub on a
//! 115200-baud USB serial adapter. The CLI overrides fields from flags and
//! environment variables.
//!
//! ```rust
//! use std::time::Duration;
//! use proxyboot::SessionConfig;
//!
//! let config = SessionConfig::builder()
//!     .device("/dev/ttyACM0")
//!     .baud(1_500_000)
//!     .response_timeout(Duration::from_secs(5))
//!     .build()?;
//! assert_eq!(config.throughput(), 150_000);
//! # Ok::<(), proxyboot::Error>(())
//! ```

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::timer::{TIMER_BASE, TIMER_FREQ};

/// Environment variable naming the proxy serial device.
pub const DEVICE_ENV: &str = "PROXYBOOT_DEVICE";

/// Fallback serial device.
pub const DEFAULT_DEVICE: &str = "/dev/ttyUSB0";

/// Default link speed.
pub const DEFAULT_BAUD: u32 = 115_200;

/// Timer register block location and rate on the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerConfig {
    /// Physical base of the 64-bit timer register block.
    pub base: u64,
    /// Counter frequency in ticks per second.
    pub frequency: u64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            base: TIMER_BASE,
            frequency: TIMER_FREQ,
        }
    }
}

/// Configuration for one proxy session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Serial device the proxy stub listens on.
    pub device: PathBuf,
    /// Link speed in baud.
    pub baud: u32,
    /// Timeout for a single reply frame.
    pub response_timeout: Duration,
    /// Assumed sustained link throughput in bytes per second.
    /// `None` derives it from the baud rate (10 bits per byte on the wire).
    pub throughput: Option<u64>,
    /// Upper bound for a scaled transfer timeout.
    pub max_transfer_timeout: Duration,
    /// Target timer registers.
    pub timer: TimerConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let device = std::env::var_os(DEVICE_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DEVICE));
        Self {
            device,
            baud: DEFAULT_BAUD,
            response_timeout: Duration::from_secs(3),
            throughput: None,
            max_transfer_timeout: Duration::from_secs(600),
            timer: TimerConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Start a builder from the defaults.
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }

    /// Effective link throughput in bytes per second.
    pub fn throughput(&self) -> u64 {
        self.throughput
            .unwrap_or_else(|| u64::from(self.baud) / 10)
            .max(1)
    }

    /// Check the configuration for values the session cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.baud == 0 {
            return Err(Error::Config("baud rate must be > 0".into()));
        }
        if self.response_timeout.is_zero() {
            return Err(Error::Config("response timeout must be > 0".into()));
        }
        if self.max_transfer_timeout < self.response_timeout {
            return Err(Error::Config(format!(
                "transfer timeout ceiling {:?} is below the response timeout {:?}",
                self.max_transfer_timeout, self.response_timeout
            )));
        }
        if self.throughput == Some(0) {
            return Err(Error::Config("throughput must be > 0".into()));
        }
        if self.timer.frequency == 0 {
            return Err(Error::Config("timer frequency must be > 0".into()));
        }
        Ok(())
    }
}

/// Builder for [`SessionConfig`].
#[derive(Debug, Default)]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    /// Set the serial device path.
    pub fn device(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.device = path.into();
        self
    }

    /// Set the baud rate.
    pub fn baud(mut self, baud: u32) -> Self {
        self.config.baud = baud;
        self
    }

    /// Set the per-reply timeout.
    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.config.response_timeout = timeout;
        self
    }

    /// Override the assumed throughput in bytes per second.
    pub fn throughput(mut self, bytes_per_sec: u64) -> Self {
        self.config.throughput = Some(bytes_per_sec);
        self
    }

    /// Set the ceiling for scaled transfer timeouts.
    pub fn max_transfer_timeout(mut self, timeout: Duration) -> Self {
        self.config.max_transfer_timeout = timeout;
        self
    }

    /// Set the timer register block.
    pub fn timer(mut self, timer: TimerConfig) -> Self {
        self.config.timer = timer;
        self
    }

    /// Validate and return the configuration.
    pub fn build(self) -> Result<SessionConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
