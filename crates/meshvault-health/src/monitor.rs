//! Health monitor
//!
//! Repositories report every query through [`HealthMonitor::record_query`].
//! A background thread started with [`HealthMonitor::start`] samples query
//! timings, cache effectiveness, connection and transaction counts and error
//! recovery activity, raises alerts on threshold breaches and resolves them
//! once the metric has stayed healthy for `resolve_after`.

use chrono::{DateTime, Utc};
use crossbeam::channel::{self, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use meshvault_cache::{CacheManager, CacheStats};
use meshvault_storage::{
    ErrorKind, RecoveryEvent, RecoveryStats, TransactionManager, TransactionStats,
};

use crate::alert::{Alert, HealthStatus, Severity};
use crate::config::HealthConfig;
use crate::error::HealthError;
use crate::Result;

pub const METRIC_AVG_QUERY_MS: &str = "avg_query_ms";
pub const METRIC_ERROR_RATE: &str = "error_rate";
pub const METRIC_CACHE_HIT_RATE: &str = "cache_hit_rate";
pub const METRIC_OPEN_CONNECTIONS: &str = "open_connections";
pub const METRIC_OPEN_TRANSACTIONS: &str = "open_transactions";
pub const METRIC_RECOVERY_ATTEMPTS: &str = "recovery_attempts";

/// Upper bound on query samples kept for the rolling window
const MAX_QUERY_SAMPLES: usize = 10_000;

/// A single recorded metric value
#[derive(Debug, Clone, Serialize)]
pub struct Metric {
    pub name: String,
    pub value: f64,
    pub at: DateTime<Utc>,
    pub severity: Option<Severity>,
    #[serde(skip)]
    recorded: Instant,
}

/// One sampling pass
#[derive(Debug, Clone, Serialize)]
pub struct HealthSample {
    pub at: DateTime<Utc>,
    pub status: HealthStatus,
    /// Queries inside the rolling window
    pub query_count: usize,
    pub avg_query_ms: f64,
    pub error_rate: f64,
    /// Hit rate over lookups since the previous sample
    pub cache_hit_rate: Option<f64>,
    pub cache_lookups: u64,
    pub open_connections: usize,
    pub open_transactions: usize,
    pub recovery_attempts: u64,
    /// Classified storage errors inside the retention window
    pub errors_by_kind: BTreeMap<ErrorKind, u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SlowCallSite {
    pub site: String,
    pub count: u32,
    pub max_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub generated_at: DateTime<Utc>,
    pub status: HealthStatus,
    pub latest: Option<HealthSample>,
    pub open_alerts: Vec<Alert>,
    pub resolved_alerts: Vec<Alert>,
    pub metrics_retained: usize,
    pub cache: CacheStats,
    pub transactions: TransactionStats,
    pub recovery: RecoveryStats,
    /// Classified storage errors inside the retention window
    pub errors_by_kind: BTreeMap<ErrorKind, u64>,
    pub recent_recoveries: Vec<RecoveryEvent>,
    pub slow_call_sites: Vec<SlowCallSite>,
    pub recommendations: Vec<String>,
}

impl HealthReport {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

struct QuerySample {
    elapsed: Duration,
    ok: bool,
    at: Instant,
}

struct SlowQuery {
    site: String,
    elapsed_ms: u64,
    at: Instant,
}

/// Errors of one kind classified between two sweeps
struct ErrorSample {
    kind: ErrorKind,
    count: u64,
    at: Instant,
}

#[derive(Default)]
struct MonitorState {
    queries: Mutex<VecDeque<QuerySample>>,
    slow_queries: Mutex<VecDeque<SlowQuery>>,
    errors: Mutex<VecDeque<ErrorSample>>,
    /// Classified error totals seen by the previous sweep
    last_errors: Mutex<BTreeMap<ErrorKind, u64>>,
    metrics: Mutex<VecDeque<Metric>>,
    alerts: Mutex<Vec<Alert>>,
    latest: RwLock<Option<HealthSample>>,
    /// Cache hits and misses seen by the previous sample
    last_cache: Mutex<(u64, u64)>,
    next_alert_id: AtomicU64,
    running: AtomicBool,
}

pub struct HealthMonitor {
    config: Arc<HealthConfig>,
    tm: TransactionManager,
    cache: CacheManager,
    state: Arc<MonitorState>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig, tm: TransactionManager, cache: CacheManager) -> Self {
        Self {
            config: Arc::new(config),
            tm,
            cache,
            state: Arc::new(MonitorState::default()),
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Record the outcome of one store query
    pub fn record_query(&self, site: &str, elapsed: Duration, ok: bool) {
        let now = Instant::now();
        {
            let mut queries = self.state.queries.lock();
            if queries.len() == MAX_QUERY_SAMPLES {
                queries.pop_front();
            }
            queries.push_back(QuerySample { elapsed, ok, at: now });
        }

        if elapsed >= self.config.slow_query() {
            let elapsed_ms = elapsed.as_millis() as u64;
            let mut slow = self.state.slow_queries.lock();
            if slow.len() == MAX_QUERY_SAMPLES {
                slow.pop_front();
            }
            slow.push_back(SlowQuery {
                site: site.to_string(),
                elapsed_ms,
                at: now,
            });
            tracing::debug!(site, elapsed_ms, "Slow query");
        }
    }

    /// Take a sample immediately
    pub fn sample_now(&self) -> HealthSample {
        self.sample_at(Instant::now())
    }

    pub(crate) fn sample_at(&self, now: Instant) -> HealthSample {
        let (query_count, avg_query_ms, error_rate) = self.query_window(now);
        let errors_by_kind = self.sweep(now);

        let cache = self.cache.stats();
        let (cache_lookups, cache_hit_rate) = {
            let mut last = self.state.last_cache.lock();
            let hits = cache.hits.saturating_sub(last.0);
            let misses = cache.misses.saturating_sub(last.1);
            *last = (cache.hits, cache.misses);
            let lookups = hits + misses;
            let rate = (lookups > 0).then(|| hits as f64 / lookups as f64);
            (lookups, rate)
        };

        let open_connections = self.tm.database().open_connections();
        let open_transactions = self.tm.stats().open;
        let recovery = self.tm.error_handler().stats();

        let config = &self.config;
        let mut evaluated: Vec<(&'static str, f64, Option<(Severity, f64)>)> = vec![
            (
                METRIC_AVG_QUERY_MS,
                avg_query_ms,
                over(avg_query_ms, config.avg_query_warn_ms, config.avg_query_critical_ms),
            ),
            (
                METRIC_ERROR_RATE,
                error_rate,
                over(error_rate, config.error_rate_warn, config.error_rate_critical),
            ),
            (METRIC_OPEN_CONNECTIONS, open_connections as f64, None),
            (METRIC_OPEN_TRANSACTIONS, open_transactions as f64, None),
            (METRIC_RECOVERY_ATTEMPTS, recovery.attempts as f64, None),
        ];
        if let Some(rate) = cache_hit_rate {
            let breach = if cache_lookups >= config.min_cache_lookups && rate < config.cache_hit_rate_warn {
                Some((Severity::Warning, config.cache_hit_rate_warn))
            } else {
                None
            };
            evaluated.push((METRIC_CACHE_HIT_RATE, rate, breach));
        }

        let worst = evaluated
            .iter()
            .filter_map(|(_, _, breach)| breach.map(|(severity, _)| severity))
            .max();
        let status = HealthStatus::from(worst);

        self.push_metrics(now, &evaluated);
        self.update_alerts(now, &evaluated);

        let sample = HealthSample {
            at: Utc::now(),
            status,
            query_count,
            avg_query_ms,
            error_rate,
            cache_hit_rate,
            cache_lookups,
            open_connections,
            open_transactions,
            recovery_attempts: recovery.attempts,
            errors_by_kind,
        };

        let previous = self
            .state
            .latest
            .write()
            .replace(sample.clone())
            .map(|s| s.status)
            .unwrap_or(HealthStatus::Healthy);
        if previous != status {
            tracing::info!(from = %previous, to = %status, "Health status changed");
        }
        tracing::debug!(
            status = %status,
            query_count,
            avg_query_ms,
            error_rate,
            "Health sample"
        );

        sample
    }

    /// Status of the latest sample, healthy before the first one
    pub fn current_status(&self) -> HealthStatus {
        self.state
            .latest
            .read()
            .as_ref()
            .map(|s| s.status)
            .unwrap_or(HealthStatus::Healthy)
    }

    pub fn latest_sample(&self) -> Option<HealthSample> {
        self.state.latest.read().clone()
    }

    /// Retained metrics named `name`, oldest first
    pub fn metrics(&self, name: &str) -> Vec<Metric> {
        self.state
            .metrics
            .lock()
            .iter()
            .filter(|m| m.name == name)
            .cloned()
            .collect()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.state.alerts.lock().clone()
    }

    pub fn generate_report(&self) -> HealthReport {
        let latest = self.latest_sample();
        let (open_alerts, resolved_alerts): (Vec<Alert>, Vec<Alert>) =
            self.alerts().into_iter().partition(Alert::is_open);

        let errors_by_kind = self.sweep(Instant::now());
        let slow_call_sites = self.slow_call_sites();

        let cache = self.cache.stats();
        let transactions = self.tm.stats();
        let recovery = self.tm.error_handler().stats();

        let recommendations = self.recommendations(
            latest.as_ref(),
            &slow_call_sites,
            &errors_by_kind,
            &transactions,
        );

        HealthReport {
            generated_at: Utc::now(),
            status: self.current_status(),
            latest,
            open_alerts,
            resolved_alerts,
            metrics_retained: self.state.metrics.lock().len(),
            cache,
            transactions,
            recovery,
            errors_by_kind,
            recent_recoveries: self.tm.error_handler().recent_events(20),
            slow_call_sites,
            recommendations,
        }
    }

    /// Start sampling on a background thread
    pub fn start(&self) -> Result<MonitorHandle> {
        if self
            .state
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(HealthError::AlreadyRunning);
        }

        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let monitor = self.clone();
        let interval = self.config.sample_interval();

        let spawned = std::thread::Builder::new()
            .name("meshvault-health".to_string())
            .spawn(move || {
                tracing::info!(interval_ms = interval.as_millis() as u64, "Health monitor started");
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            monitor.sample_now();
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                tracing::info!("Health monitor stopped");
            });

        match spawned {
            Ok(thread) => Ok(MonitorHandle {
                stop: Some(stop_tx),
                thread: Some(thread),
                state: Arc::clone(&self.state),
            }),
            Err(e) => {
                self.state.running.store(false, Ordering::SeqCst);
                Err(HealthError::Spawn(e))
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::SeqCst)
    }

    fn query_window(&self, now: Instant) -> (usize, f64, f64) {
        let window = self.config.window();
        let mut queries = self.state.queries.lock();
        while queries
            .front()
            .is_some_and(|q| now.saturating_duration_since(q.at) > window)
        {
            queries.pop_front();
        }

        let count = queries.len();
        if count == 0 {
            return (0, 0.0, 0.0);
        }

        let total_ms: f64 = queries.iter().map(|q| q.elapsed.as_secs_f64() * 1_000.0).sum();
        let errors = queries.iter().filter(|q| !q.ok).count();
        (count, total_ms / count as f64, errors as f64 / count as f64)
    }

    /// Fold newly classified errors into the error window, drop slow queries
    /// and error samples older than the retention period and return the
    /// retained error counts by kind
    fn sweep(&self, now: Instant) -> BTreeMap<ErrorKind, u64> {
        let retention = self.config.retention();
        let expired = |at: Instant| now.saturating_duration_since(at) > retention;

        {
            let mut slow = self.state.slow_queries.lock();
            while slow.front().is_some_and(|q| expired(q.at)) {
                slow.pop_front();
            }
        }

        let totals = self.tm.error_handler().stats().errors_by_kind;
        let mut errors = self.state.errors.lock();
        {
            let mut last = self.state.last_errors.lock();
            for (kind, total) in totals {
                let seen = last.insert(kind, total).unwrap_or(0);
                let count = total.saturating_sub(seen);
                if count > 0 {
                    errors.push_back(ErrorSample { kind, count, at: now });
                }
            }
        }
        while errors.front().is_some_and(|e| expired(e.at)) {
            errors.pop_front();
        }

        let mut by_kind = BTreeMap::new();
        for sample in errors.iter() {
            *by_kind.entry(sample.kind).or_insert(0) += sample.count;
        }
        by_kind
    }

    /// Retained slow queries grouped by call site, most frequent first
    fn slow_call_sites(&self) -> Vec<SlowCallSite> {
        let mut sites: HashMap<String, SlowCallSite> = HashMap::new();
        for query in self.state.slow_queries.lock().iter() {
            let entry = sites
                .entry(query.site.clone())
                .or_insert_with(|| SlowCallSite {
                    site: query.site.clone(),
                    count: 0,
                    max_ms: 0,
                });
            entry.count += 1;
            entry.max_ms = entry.max_ms.max(query.elapsed_ms);
        }

        let mut sites: Vec<SlowCallSite> = sites.into_values().collect();
        sites.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.site.cmp(&b.site)));
        sites
    }

    fn push_metrics(&self, now: Instant, evaluated: &[(&'static str, f64, Option<(Severity, f64)>)]) {
        let retention = self.config.retention();
        let at = Utc::now();
        let mut metrics = self.state.metrics.lock();

        metrics.extend(evaluated.iter().map(|(name, value, breach)| Metric {
            name: name.to_string(),
            value: *value,
            at,
            severity: breach.map(|(severity, _)| severity),
            recorded: now,
        }));

        while metrics
            .front()
            .is_some_and(|m| now.saturating_duration_since(m.recorded) > retention)
        {
            metrics.pop_front();
        }
    }

    fn update_alerts(&self, now: Instant, evaluated: &[(&'static str, f64, Option<(Severity, f64)>)]) {
        let resolve_after = self.config.resolve_after();
        let retention = self.config.retention();
        let mut alerts = self.state.alerts.lock();

        for (name, value, breach) in evaluated {
            let open = alerts
                .iter()
                .position(|a| a.metric == *name && a.is_open());
            match (breach, open) {
                (Some((severity, threshold)), Some(index)) => {
                    alerts[index].breach(*severity, *threshold, *value);
                }
                (Some((severity, threshold)), None) => {
                    let id = self.state.next_alert_id.fetch_add(1, Ordering::Relaxed) + 1;
                    tracing::warn!(
                        alert_id = id,
                        metric = %name,
                        severity = %severity,
                        value,
                        threshold,
                        "Health alert opened"
                    );
                    alerts.push(Alert::open(id, name, *severity, *threshold, *value));
                }
                (None, Some(index)) => {
                    let alert = &mut alerts[index];
                    if alert.clear(now, resolve_after) {
                        tracing::info!(alert_id = alert.id, metric = %name, "Health alert resolved");
                    }
                }
                (None, None) => {}
            }
        }

        alerts.retain(|a| {
            a.resolved_instant
                .map_or(true, |resolved| now.saturating_duration_since(resolved) <= retention)
        });
    }

    fn recommendations(
        &self,
        latest: Option<&HealthSample>,
        slow_call_sites: &[SlowCallSite],
        errors_by_kind: &BTreeMap<ErrorKind, u64>,
        transactions: &TransactionStats,
    ) -> Vec<String> {
        let config = &self.config;
        let mut out = Vec::new();

        for site in slow_call_sites
            .iter()
            .filter(|s| s.count >= config.slow_repeat_threshold)
        {
            out.push(format!(
                "`{}` was slow {} times (max {} ms); consider indexing the columns used by `{}`",
                site.site, site.count, site.max_ms, site.site
            ));
        }

        if let Some(sample) = latest {
            if let Some(rate) = sample.cache_hit_rate {
                if sample.cache_lookups >= config.min_cache_lookups && rate < config.cache_hit_rate_warn {
                    out.push(format!(
                        "Cache hit rate is {:.0}%; consider raising the memory cache ceiling",
                        rate * 100.0
                    ));
                }
            }
            if sample.query_count > 0 && sample.error_rate >= config.error_rate_warn {
                out.push(format!(
                    "{:.1}% of queries failed in the last {}s; inspect recent error classifications",
                    sample.error_rate * 100.0,
                    config.window_secs
                ));
            }
        }

        if let Some(locks) = errors_by_kind.get(&ErrorKind::Lock) {
            out.push(format!(
                "Lock contention seen {locks} times; keep write transactions short"
            ));
        }
        if errors_by_kind.contains_key(&ErrorKind::Integrity) {
            out.push("Integrity errors seen; run an integrity check on the database file".to_string());
        }
        if transactions.leaked > 0 {
            out.push(format!(
                "{} transactions were dropped without commit or rollback",
                transactions.leaked
            ));
        }

        out
    }
}

impl Clone for HealthMonitor {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            tm: self.tm.clone(),
            cache: self.cache.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

/// Handle to the background sampling thread; stops it on drop
pub struct MonitorHandle {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
    state: Arc<MonitorState>,
}

impl MonitorHandle {
    /// Signal the thread and wait for it to exit
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("Health monitor thread panicked");
            }
        }
        self.state.running.store(false, Ordering::SeqCst);
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn over(value: f64, warn: f64, critical: f64) -> Option<(Severity, f64)> {
    if value >= critical {
        Some((Severity::Critical, critical))
    } else if value >= warn {
        Some((Severity::Warning, warn))
    } else {
        None
    }
}
