// SPDX-License-Identifier: (MIT OR Apache-2.0)

use std::time::Duration;

/// Pool tuning. Consumed once at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PoolConfig {
    /// A polling context with no activity for this long is evicted to turning.
    pub timeout: Duration,
    /// Advisory contexts-per-worker hint, reported back through stats.
    pub contexts_per_thread: usize,
    /// Scanner period.
    pub scan_interval: Duration,
}

impl PoolConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_contexts_per_thread(mut self, n: usize) -> Self {
        self.contexts_per_thread = n;
        self
    }

    pub fn with_scan_interval(mut self, interval: Duration) -> Self {
        self.scan_interval = interval;
        self
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            contexts_per_thread: 1,
            scan_interval: Duration::from_secs(1),
        }
    }
}
