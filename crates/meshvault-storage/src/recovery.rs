//! Error classification and recovery
//!
//! The [`ErrorHandler`] turns a [`StorageError`] into a [`Classification`] and
//! decides how to recover:
//!
//! - Connection errors: reconnect the handle and retry once
//! - Lock errors: retry with exponential backoff, bounded by [`RetryPolicy`]
//! - Constraint, syntax and integrity errors: surfaced immediately
//!
//! Every classification and recovery attempt is recorded so the health
//! monitor can report on them.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::database::Database;
use crate::error::{ErrorKind, StorageError};

const EVENT_LOG_CAPACITY: usize = 256;

/// Bounded retry settings shared by the error handler and transaction manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay_ms: u64,
    /// Upper bound for a single backoff delay
    pub max_delay_ms: u64,
    /// How long to wait for the connection handle before reporting a lock error
    pub lock_wait_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 10,
            max_delay_ms: 500,
            lock_wait_ms: 2_000,
        }
    }
}

impl RetryPolicy {
    /// Backoff before retrying after the given (1-based) failed attempt
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }
}

/// Result of classifying a storage failure
#[derive(Debug, Clone, Serialize)]
pub struct Classification {
    pub kind: ErrorKind,
    pub recoverable: bool,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum RecoveryAction {
    /// Slept before retrying
    Backoff { delay_ms: u64 },
    /// Reopened the connection
    Reconnect,
    /// Retry was not possible or retries are exhausted
    GaveUp,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryEvent {
    pub at: DateTime<Utc>,
    pub kind: ErrorKind,
    pub attempt: u32,
    pub action: RecoveryAction,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryStats {
    /// Recovery attempts that led to a retry
    pub attempts: u64,
    /// Operations that succeeded after at least one retry
    pub recovered: u64,
    /// Failures that could not be recovered
    pub gave_up: u64,
    /// Classified failures by kind
    pub errors_by_kind: BTreeMap<ErrorKind, u64>,
}

struct HandlerState {
    events: Mutex<VecDeque<RecoveryEvent>>,
    classified: [AtomicU64; 5],
    attempts: AtomicU64,
    recovered: AtomicU64,
    gave_up: AtomicU64,
}

pub struct ErrorHandler {
    db: Database,
    policy: RetryPolicy,
    state: Arc<HandlerState>,
}

impl ErrorHandler {
    pub fn new(db: Database, policy: RetryPolicy) -> Self {
        Self {
            db,
            policy,
            state: Arc::new(HandlerState {
                events: Mutex::new(VecDeque::with_capacity(EVENT_LOG_CAPACITY)),
                classified: Default::default(),
                attempts: AtomicU64::new(0),
                recovered: AtomicU64::new(0),
                gave_up: AtomicU64::new(0),
            }),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Classify a failure and count it
    pub fn classify(&self, error: &StorageError) -> Classification {
        let kind = error.kind();
        self.state.classified[kind_index(kind)].fetch_add(1, Ordering::Relaxed);

        Classification {
            kind,
            recoverable: error.is_recoverable(),
            message: error.to_string(),
        }
    }

    /// Apply the recovery strategy for `error` after the given failed attempt.
    ///
    /// Returns true if the caller should retry the operation.
    pub fn attempt_recovery(&self, error: &StorageError, attempt: u32) -> bool {
        let classification = self.classify(error);

        let action = if !classification.recoverable {
            RecoveryAction::GaveUp
        } else {
            match classification.kind {
                ErrorKind::Connection if attempt <= 1 => {
                    match self.db.reconnect(self.policy.lock_wait()) {
                        Ok(true) => RecoveryAction::Reconnect,
                        Ok(false) => RecoveryAction::GaveUp,
                        Err(e) => {
                            tracing::error!(error = %e, "Reconnect failed");
                            RecoveryAction::GaveUp
                        }
                    }
                }
                ErrorKind::Lock if attempt < self.policy.max_attempts => {
                    let delay = self.policy.backoff(attempt);
                    std::thread::sleep(delay);
                    RecoveryAction::Backoff {
                        delay_ms: delay.as_millis() as u64,
                    }
                }
                _ => RecoveryAction::GaveUp,
            }
        };

        let retry = action != RecoveryAction::GaveUp;
        if retry {
            self.state.attempts.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                kind = %classification.kind,
                attempt,
                action = ?action,
                "Recovering from storage error"
            );
        } else {
            self.state.gave_up.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                kind = %classification.kind,
                attempt,
                error = %classification.message,
                "Storage error not recovered"
            );
        }

        self.push_event(RecoveryEvent {
            at: Utc::now(),
            kind: classification.kind,
            attempt,
            action,
            message: classification.message,
        });

        retry
    }

    /// Note that an operation succeeded after one or more retries
    pub fn record_recovered(&self) {
        self.state.recovered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> RecoveryStats {
        let errors_by_kind = ErrorKind::ALL
            .iter()
            .map(|kind| {
                (
                    *kind,
                    self.state.classified[kind_index(*kind)].load(Ordering::Relaxed),
                )
            })
            .filter(|(_, count)| *count > 0)
            .collect();

        RecoveryStats {
            attempts: self.state.attempts.load(Ordering::Relaxed),
            recovered: self.state.recovered.load(Ordering::Relaxed),
            gave_up: self.state.gave_up.load(Ordering::Relaxed),
            errors_by_kind,
        }
    }

    /// Most recent recovery events, newest last
    pub fn recent_events(&self, limit: usize) -> Vec<RecoveryEvent> {
        let events = self.state.events.lock();
        let skip = events.len().saturating_sub(limit);
        events.iter().skip(skip).cloned().collect()
    }

    fn push_event(&self, event: RecoveryEvent) {
        let mut events = self.state.events.lock();
        if events.len() == EVENT_LOG_CAPACITY {
            events.pop_front();
        }
        events.push_back(event);
    }
}

impl Clone for ErrorHandler {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
            policy: self.policy.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

fn kind_index(kind: ErrorKind) -> usize {
    match kind {
        ErrorKind::Connection => 0,
        ErrorKind::Constraint => 1,
        ErrorKind::Lock => 2,
        ErrorKind::Syntax => 3,
        ErrorKind::Integrity => 4,
    }
}
