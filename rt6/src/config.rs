// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Idle time after which an unused destination-cache entry is reclaimed
/// while the cache is under its watermark.
pub const DC_LONG_TIMEOUT_MS: u64 = 15_000;

/// Idle timeout used once the cache reaches its watermark.
pub const DC_SHORT_TIMEOUT_MS: u64 = 5_000;

/// Number of live destination-cache entries at which the collector switches
/// to the short timeout.
pub const DC_WATERMARK: usize = 512;

/// Routing table tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tunables {
    pub dc_short_timeout_ms: u64,
    pub dc_long_timeout_ms: u64,
    pub dc_watermark: usize,

    /// Period of the garbage collection timer. When unset the timer runs
    /// every four long timeouts.
    pub gc_interval_ms: Option<u64>,

    /// Maximum number of trie nodes, not counting the root. Inserts that
    /// need more nodes fail with an allocation error.
    pub max_nodes: Option<usize>,

    /// Maximum number of route and destination-cache entries.
    pub max_routes: Option<usize>,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            dc_short_timeout_ms: DC_SHORT_TIMEOUT_MS,
            dc_long_timeout_ms: DC_LONG_TIMEOUT_MS,
            dc_watermark: DC_WATERMARK,
            gc_interval_ms: None,
            max_nodes: None,
            max_routes: None,
        }
    }
}

impl Tunables {
    pub fn dc_short_timeout(&self) -> Duration {
        Duration::from_millis(self.dc_short_timeout_ms)
    }

    pub fn dc_long_timeout(&self) -> Duration {
        Duration::from_millis(self.dc_long_timeout_ms)
    }

    pub fn gc_interval(&self) -> Duration {
        match self.gc_interval_ms {
            Some(ms) => Duration::from_millis(ms),
            None => self.dc_long_timeout() * 4,
        }
    }

    /// Idle threshold for the current number of cache allocations.
    pub fn idle_timeout(&self, dc_alloc: usize) -> Duration {
        if dc_alloc >= self.dc_watermark {
            self.dc_short_timeout()
        } else {
            self.dc_long_timeout()
        }
    }
}
