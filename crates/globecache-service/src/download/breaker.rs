use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::caching::CacheError;
use crate::config::Config;

/// A process-wide switch that stops all network traffic to the tile servers.
///
/// The breaker counts consecutive transient download failures. Once `failure_threshold` of them
/// happened in a row, the server is flagged as disabled and no more requests are made until it is
/// enabled again with [`set_enabled`](Self::set_enabled). Any successful exchange with the server
/// resets the count. A threshold of `0` never trips the breaker automatically.
#[derive(Debug)]
pub struct ServerBreaker {
    enabled: AtomicBool,
    consecutive_failures: AtomicUsize,
    failure_threshold: usize,
}

impl Default for ServerBreaker {
    fn default() -> Self {
        Self::new(5)
    }
}

impl ServerBreaker {
    pub fn new(failure_threshold: usize) -> Self {
        Self {
            enabled: AtomicBool::new(true),
            consecutive_failures: AtomicUsize::new(0),
            failure_threshold,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.server_failure_threshold)
    }

    /// Whether requests to the server are currently allowed.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Manually enables or disables the server.
    ///
    /// Enabling the server also forgets all previously registered failures.
    pub fn set_enabled(&self, enabled: bool) {
        if enabled {
            self.consecutive_failures.store(0, Ordering::Release);
        }
        let was_enabled = self.enabled.swap(enabled, Ordering::AcqRel);
        if was_enabled != enabled {
            tracing::info!(enabled, "Server state changed");
            metric!(gauge("download.server_enabled") = enabled as u64);
        }
    }

    /// Registers a failed download.
    ///
    /// Only transient failures count towards the threshold. Returns `true` if this failure
    /// disabled the server.
    pub fn register_failure(&self, error: &CacheError) -> bool {
        if !error.is_transient() {
            self.register_success();
            return false;
        }

        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::trace!(failures, %error, "Registering download failure");

        if self.failure_threshold == 0 || failures < self.failure_threshold {
            return false;
        }
        if self.enabled.swap(false, Ordering::AcqRel) {
            tracing::warn!(
                failures,
                %error,
                "Disabling server due to too many download failures"
            );
            metric!(gauge("download.server_enabled") = 0);
            return true;
        }
        false
    }

    /// Registers a completed exchange with the server.
    pub fn register_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
    }

    /// The number of transient failures since the last success.
    pub fn consecutive_failures(&self) -> usize {
        self.consecutive_failures.load(Ordering::Acquire)
    }
}
