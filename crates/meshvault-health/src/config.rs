//! Health monitor thresholds

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Background sampling period
    pub sample_interval_ms: u64,
    /// Rolling window for query time and error rate
    pub window_secs: u64,
    /// How long metrics, resolved alerts, slow queries and error counts are kept
    pub retention_secs: u64,
    /// A breached metric must stay under threshold this long before its alert resolves
    pub resolve_after_secs: u64,

    pub avg_query_warn_ms: f64,
    pub avg_query_critical_ms: f64,
    pub error_rate_warn: f64,
    pub error_rate_critical: f64,
    /// Hit rate below this raises a warning
    pub cache_hit_rate_warn: f64,
    /// Hit rate is only judged once a sample saw this many lookups
    pub min_cache_lookups: u64,

    /// A single query slower than this counts against its call site
    pub slow_query_ms: u64,
    /// Slow queries from one call site before a recommendation is made
    pub slow_repeat_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 5_000,
            window_secs: 60,
            retention_secs: 3_600,
            resolve_after_secs: 30,
            avg_query_warn_ms: 50.0,
            avg_query_critical_ms: 250.0,
            error_rate_warn: 0.05,
            error_rate_critical: 0.25,
            cache_hit_rate_warn: 0.5,
            min_cache_lookups: 20,
            slow_query_ms: 100,
            slow_repeat_threshold: 3,
        }
    }
}

impl HealthConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn resolve_after(&self) -> Duration {
        Duration::from_secs(self.resolve_after_secs)
    }

    pub fn slow_query(&self) -> Duration {
        Duration::from_millis(self.slow_query_ms)
    }
}
