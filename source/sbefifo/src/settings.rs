use core::time::Duration;

use serde::{Deserialize, Serialize};

/// Timing knobs for one SBEFIFO.
///
/// All values are in milliseconds so they read naturally in a config file.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SbefifoSettings {
    /// How long the poller waits before looking at the device again when it
    /// had no room for our words, or no words for us.
    #[serde(default = "SbefifoSettings::default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// How long a finished request may wait for its first (or next) response
    /// word before the transfer times out.
    #[serde(default = "SbefifoSettings::default_max_data_wait_ms")]
    pub max_data_wait_ms: u64,
    /// Upper bound on a FIFO reset.
    #[serde(default = "SbefifoSettings::default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
    /// Pause between checks of the reset bit.
    #[serde(default = "SbefifoSettings::default_reset_poll_ms")]
    pub reset_poll_ms: u64,
}

impl SbefifoSettings {
    pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
    pub const DEFAULT_MAX_DATA_WAIT_MS: u64 = 5000;
    pub const DEFAULT_RESET_TIMEOUT_MS: u64 = 250;
    pub const DEFAULT_RESET_POLL_MS: u64 = 5;

    const fn default_poll_interval_ms() -> u64 {
        Self::DEFAULT_POLL_INTERVAL_MS
    }

    const fn default_max_data_wait_ms() -> u64 {
        Self::DEFAULT_MAX_DATA_WAIT_MS
    }

    const fn default_reset_timeout_ms() -> u64 {
        Self::DEFAULT_RESET_TIMEOUT_MS
    }

    const fn default_reset_poll_ms() -> u64 {
        Self::DEFAULT_RESET_POLL_MS
    }

    #[must_use]
    pub fn with_poll_interval(self, interval: Duration) -> Self {
        Self {
            poll_interval_ms: interval.as_millis() as u64,
            ..self
        }
    }

    #[must_use]
    pub fn with_max_data_wait(self, wait: Duration) -> Self {
        Self {
            max_data_wait_ms: wait.as_millis() as u64,
            ..self
        }
    }

    #[must_use]
    pub fn with_reset_timeout(self, timeout: Duration) -> Self {
        Self {
            reset_timeout_ms: timeout.as_millis() as u64,
            ..self
        }
    }

    #[must_use]
    pub fn with_reset_poll(self, interval: Duration) -> Self {
        Self {
            reset_poll_ms: interval.as_millis() as u64,
            ..self
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_data_wait(&self) -> Duration {
        Duration::from_millis(self.max_data_wait_ms)
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    pub fn reset_poll(&self) -> Duration {
        Duration::from_millis(self.reset_poll_ms)
    }
}

impl Default for SbefifoSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: Self::DEFAULT_POLL_INTERVAL_MS,
            max_data_wait_ms: Self::DEFAULT_MAX_DATA_WAIT_MS,
            reset_timeout_ms: Self::DEFAULT_RESET_TIMEOUT_MS,
            reset_poll_ms: Self::DEFAULT_RESET_POLL_MS,
        }
    }
}
