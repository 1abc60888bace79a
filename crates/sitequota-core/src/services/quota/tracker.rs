//! Session accrual
//!
//! Converts foreground presence into `daily_usage_ms`. At most one accrual
//! interval is open at a time, marked by `session_start_at`; opening is
//! idempotent and closing folds the interval into the daily counter.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use super::record::{QuotaRecord, StorageKeys};
use super::types::QuotaPolicy;
use crate::services::clock::Clock;
use crate::services::store::SafeStore;

/// What to do with the open interval after folding it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Close the interval (backgrounded, bonus ended, blocked)
    End,
    /// Keep accruing from `now` (periodic tick)
    Continue,
}

/// Result of a tracker operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccrualOutcome {
    /// A new interval was opened
    Started,
    /// An interval was already open, nothing changed
    AlreadyOpen,
    /// The open interval was folded into the daily counter
    Flushed { added_ms: i64 },
    /// Nothing to flush
    NoSession,
    /// The store could not be read or written
    Unavailable,
}

/// Open an interval at `now_ms` unless a live one exists.
///
/// An interval older than `stale_after_ms` is treated as orphaned and
/// restarted without being counted. Returns whether the record changed.
pub fn open_session(record: &mut QuotaRecord, now_ms: i64, stale_after_ms: i64) -> bool {
    match record.session_start_at {
        Some(start) if now_ms.saturating_sub(start) <= stale_after_ms => false,
        _ => {
            record.session_start_at = Some(now_ms);
            true
        }
    }
}

/// Fold the open interval into `daily_usage_ms`. Returns the added time.
pub fn fold_session(record: &mut QuotaRecord, now_ms: i64, mode: FlushMode) -> i64 {
    if record.session_start_at.is_none() {
        return 0;
    }
    let added = record.open_session_ms(now_ms);
    record.daily_usage_ms = record.daily_usage_ms.saturating_add(added);
    record.session_start_at = match mode {
        FlushMode::End => None,
        FlushMode::Continue => Some(now_ms),
    };
    added
}

/// Store-backed accrual operations for one site
#[derive(Clone)]
pub struct SessionTracker {
    store: SafeStore,
    clock: Arc<dyn Clock>,
    keys: StorageKeys,
    stale_session_ms: i64,
}

impl SessionTracker {
    pub fn new(store: SafeStore, clock: Arc<dyn Clock>, policy: &QuotaPolicy) -> Self {
        Self {
            store,
            clock,
            keys: StorageKeys::for_site(&policy.site),
            stale_session_ms: policy.stale_session_ms,
        }
    }

    async fn read(&self) -> Option<QuotaRecord> {
        let snapshot = self
            .store
            .get(&[self.keys.daily_usage.clone(), self.keys.session_start.clone()])
            .await;
        snapshot
            .is_ok()
            .then(|| QuotaRecord::from_snapshot(&snapshot, &self.keys))
    }

    /// Only the accrual fields are written so concurrent engine writes to
    /// the other fields are not clobbered.
    async fn write(&self, record: &QuotaRecord) -> bool {
        let values = HashMap::from([
            (
                self.keys.daily_usage.clone(),
                Value::from(record.daily_usage_ms),
            ),
            (
                self.keys.session_start.clone(),
                record
                    .session_start_at
                    .map(Value::from)
                    .unwrap_or(Value::Null),
            ),
        ]);
        self.store.set(values).await
    }

    /// Open an accrual interval if none is open.
    pub async fn start_accrual(&self) -> AccrualOutcome {
        let now = self.clock.now_ms();
        let Some(mut record) = self.read().await else {
            return AccrualOutcome::Unavailable;
        };

        if let Some(start) = record.session_start_at {
            let age = now.saturating_sub(start);
            if age > self.stale_session_ms {
                log::warn!(
                    "[quota:tracker] Discarding orphaned session opened {}ms ago",
                    age
                );
            }
        }

        if !open_session(&mut record, now, self.stale_session_ms) {
            log::debug!("[quota:tracker] Session already open");
            return AccrualOutcome::AlreadyOpen;
        }

        if self.write(&record).await {
            log::debug!("[quota:tracker] Session started at {}", now);
            AccrualOutcome::Started
        } else {
            AccrualOutcome::Unavailable
        }
    }

    /// Fold the open interval into today's usage.
    pub async fn flush_accrual(&self, mode: FlushMode) -> AccrualOutcome {
        let now = self.clock.now_ms();
        let Some(mut record) = self.read().await else {
            return AccrualOutcome::Unavailable;
        };

        if record.session_start_at.is_none() {
            return AccrualOutcome::NoSession;
        }

        let added_ms = fold_session(&mut record, now, mode);
        if !self.write(&record).await {
            return AccrualOutcome::Unavailable;
        }

        log::debug!(
            "[quota:tracker] Updated usage to {} seconds ({:?})",
            record.daily_usage_ms / 1000,
            mode
        );
        AccrualOutcome::Flushed { added_ms }
    }

    /// Usage today including the open interval; zero if unreadable.
    pub async fn time_spent_today(&self) -> i64 {
        let now = self.clock.now_ms();
        self.read()
            .await
            .map(|record| record.accrued_ms(now))
            .unwrap_or(0)
    }
}
