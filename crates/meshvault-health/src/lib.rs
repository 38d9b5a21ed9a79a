//! meshvault Health Monitor
//!
//! Background sampling of query performance, cache effectiveness and error
//! recovery, with threshold alerts and a serialisable report.

mod alert;
mod config;
mod error;
mod monitor;

pub use alert::{Alert, AlertState, HealthStatus, Severity};
pub use config::HealthConfig;
pub use error::HealthError;
pub use monitor::{
    HealthMonitor, HealthReport, HealthSample, Metric, MonitorHandle, SlowCallSite,
    METRIC_AVG_QUERY_MS, METRIC_CACHE_HIT_RATE, METRIC_ERROR_RATE, METRIC_OPEN_CONNECTIONS,
    METRIC_OPEN_TRANSACTIONS, METRIC_RECOVERY_ATTEMPTS,
};

pub type Result<T> = std::result::Result<T, HealthError>;
