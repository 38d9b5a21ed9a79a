//! Severities and the alert lifecycle
//!
//! ```text
//! Open
//!   ↓ metric under threshold for resolve_after
//! Resolved
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Overall health derived from the latest sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Warning => "warning",
            HealthStatus::Critical => "critical",
        }
    }
}

impl From<Option<Severity>> for HealthStatus {
    fn from(worst: Option<Severity>) -> Self {
        match worst {
            None => HealthStatus::Healthy,
            Some(Severity::Warning) => HealthStatus::Warning,
            Some(Severity::Critical) => HealthStatus::Critical,
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertState {
    /// Metric is (or was recently) over threshold
    Open,
    /// Metric stayed under threshold long enough
    Resolved,
}

impl AlertState {
    pub fn can_transition_to(&self, target: AlertState) -> bool {
        match (self, target) {
            (AlertState::Open, AlertState::Resolved) => true,
            (a, b) if *a == b => true,
            // A resolved alert is never reopened; a new alert is raised instead
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub id: u64,
    pub metric: String,
    pub severity: Severity,
    pub state: AlertState,
    pub threshold: f64,
    /// Most recent value that breached the threshold
    pub last_value: f64,
    pub opened_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub(crate) resolved_instant: Option<Instant>,
    /// When the metric last went back under threshold
    #[serde(skip)]
    pub(crate) clear_since: Option<Instant>,
}

impl Alert {
    pub(crate) fn open(id: u64, metric: &str, severity: Severity, threshold: f64, value: f64) -> Self {
        Self {
            id,
            metric: metric.to_string(),
            severity,
            state: AlertState::Open,
            threshold,
            last_value: value,
            opened_at: Utc::now(),
            resolved_at: None,
            resolved_instant: None,
            clear_since: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == AlertState::Open
    }

    /// Record another breach; escalates severity but never lowers it
    pub(crate) fn breach(&mut self, severity: Severity, threshold: f64, value: f64) {
        if severity > self.severity {
            self.severity = severity;
            self.threshold = threshold;
        }
        self.last_value = value;
        self.clear_since = None;
    }

    /// Record a sample under threshold. Returns true if the alert resolved.
    pub(crate) fn clear(&mut self, now: Instant, resolve_after: std::time::Duration) -> bool {
        let since = *self.clear_since.get_or_insert(now);
        if now.duration_since(since) >= resolve_after
            && self.state.can_transition_to(AlertState::Resolved)
        {
            self.state = AlertState::Resolved;
            self.resolved_at = Some(Utc::now());
            self.resolved_instant = Some(now);
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_transitions() {
        assert!(AlertState::Open.can_transition_to(AlertState::Resolved));
        assert!(!AlertState::Resolved.can_transition_to(AlertState::Open));
    }

    #[test]
    fn test_resolves_only_after_sustained_recovery() {
        let start = Instant::now();
        let mut alert = Alert::open(1, "avg_query_ms", Severity::Warning, 50.0, 80.0);
        let resolve_after = Duration::from_secs(10);

        assert!(!alert.clear(start + Duration::from_secs(1), resolve_after));
        // A new breach restarts the clock
        alert.breach(Severity::Warning, 50.0, 70.0);
        assert!(!alert.clear(start + Duration::from_secs(5), resolve_after));
        assert!(!alert.clear(start + Duration::from_secs(14), resolve_after));
        assert!(alert.clear(start + Duration::from_secs(15), resolve_after));
        assert_eq!(alert.state, AlertState::Resolved);
        assert!(alert.resolved_at.is_some());
    }

    #[test]
    fn test_breach_escalates_severity() {
        let mut alert = Alert::open(1, "error_rate", Severity::Warning, 0.05, 0.1);
        alert.breach(Severity::Critical, 0.25, 0.5);
        assert_eq!(alert.severity, Severity::Critical);
        alert.breach(Severity::Warning, 0.05, 0.1);
        assert_eq!(alert.severity, Severity::Critical);
        assert_eq!(alert.threshold, 0.25);
    }

    #[test]
    fn test_status_from_worst_severity() {
        assert_eq!(HealthStatus::from(None), HealthStatus::Healthy);
        assert_eq!(HealthStatus::from(Some(Severity::Critical)), HealthStatus::Critical);
        assert!(HealthStatus::Critical > HealthStatus::Warning);
    }
}
