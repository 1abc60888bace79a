//! Usage event log
//!
//! Append-only, bounded analytics trail of quota transitions. Logging is
//! best-effort: a failed read or write is reported in the process log and
//! otherwise ignored, it never gates the state machine.

use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::services::clock::{from_millis, Clock};
use crate::services::store::SafeStore;

/// Kind of a logged quota event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageEventType {
    /// Totals of the day that just ended; `totalUsageMs` includes the
    /// interval still open at rollover
    DailySummary,
    /// Daily counters were zeroed
    DailyReset,
    /// Usage crossed the daily limit
    LimitReached,
    /// A blocking interval began
    CooldownStarted,
    /// A bonus window was granted
    BonusVisitStarted,
    /// A bonus window ended
    BonusVisitEnded,
    /// An orphaned accrual interval was discarded
    SessionRecovered,
}

impl UsageEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageEventType::DailySummary => "daily_summary",
            UsageEventType::DailyReset => "daily_reset",
            UsageEventType::LimitReached => "limit_reached",
            UsageEventType::CooldownStarted => "cooldown_started",
            UsageEventType::BonusVisitStarted => "bonus_visit_started",
            UsageEventType::BonusVisitEnded => "bonus_visit_ended",
            UsageEventType::SessionRecovered => "session_recovered",
        }
    }
}

impl std::fmt::Display for UsageEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the usage log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageEvent {
    /// Epoch milliseconds
    pub timestamp: i64,
    /// RFC 3339 rendering of `timestamp`
    pub date: String,
    pub event_type: UsageEventType,
    /// Event-specific fields, stored inline
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl UsageEvent {
    pub fn new(timestamp: i64, event_type: UsageEventType, payload: Map<String, Value>) -> Self {
        Self {
            timestamp,
            date: from_millis(timestamp)
                .with_timezone(&Utc)
                .to_rfc3339_opts(SecondsFormat::Millis, true),
            event_type,
            payload,
        }
    }
}

/// Event waiting to be appended: type plus payload
pub type PendingEvent = (UsageEventType, Map<String, Value>);

/// Append `entry`, evicting from the front beyond `capacity`.
pub fn push_bounded(trail: &mut Vec<UsageEvent>, entry: UsageEvent, capacity: usize) {
    trail.push(entry);
    if trail.len() > capacity {
        let excess = trail.len() - capacity;
        trail.drain(..excess);
    }
}

/// Writer and reader of the usage log key
#[derive(Clone)]
pub struct EventLogger {
    store: SafeStore,
    clock: Arc<dyn Clock>,
    key: String,
    capacity: usize,
}

impl EventLogger {
    pub fn new(store: SafeStore, clock: Arc<dyn Clock>, key: String, capacity: usize) -> Self {
        Self {
            store,
            clock,
            key,
            capacity: capacity.max(1),
        }
    }

    /// Append a single event. Returns whether it was persisted.
    pub async fn log_event(&self, event_type: UsageEventType, payload: Map<String, Value>) -> bool {
        self.log_events(vec![(event_type, payload)]).await
    }

    /// Append several events with a single read-modify-write.
    pub async fn log_events(&self, events: Vec<PendingEvent>) -> bool {
        if events.is_empty() {
            return true;
        }

        let snapshot = self.store.get(std::slice::from_ref(&self.key)).await;
        if !snapshot.is_ok() {
            // Writing now would replace the whole trail with just these events
            log::error!(
                "[quota:log] Dropping {} event(s), log could not be read",
                events.len()
            );
            return false;
        }

        let mut trail = decode_log(snapshot.value(&self.key));
        let timestamp = self.clock.now_ms();
        for (event_type, payload) in events {
            log::info!("[quota:log] Logged event - {}", event_type);
            push_bounded(
                &mut trail,
                UsageEvent::new(timestamp, event_type, payload),
                self.capacity,
            );
        }

        let encoded = match serde_json::to_value(&trail) {
            Ok(v) => v,
            Err(e) => {
                log::error!("[quota:log] Failed to encode usage log: {}", e);
                return false;
            }
        };

        let written = self
            .store
            .set(std::iter::once((self.key.clone(), encoded)).collect())
            .await;
        if !written {
            log::error!("[quota:log] Failed to persist usage log");
        }
        written
    }

    /// All retained entries, oldest first
    pub async fn entries(&self) -> Vec<UsageEvent> {
        let snapshot = self.store.get(std::slice::from_ref(&self.key)).await;
        decode_log(snapshot.value(&self.key))
    }

    /// The newest `limit` entries, oldest first
    pub async fn recent(&self, limit: usize) -> Vec<UsageEvent> {
        let mut entries = self.entries().await;
        if entries.len() > limit {
            entries.drain(..entries.len() - limit);
        }
        entries
    }
}

/// Decode a stored log, skipping entries that no longer parse.
fn decode_log(value: Option<&Value>) -> Vec<UsageEvent> {
    let Some(Value::Array(items)) = value else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match serde_json::from_value(item.clone()) {
            Ok(event) => Some(event),
            Err(e) => {
                log::warn!("[quota:log] Skipping unreadable log entry: {}", e);
                None
            }
        })
        .collect()
}

/// Build a payload map from `(key, value)` pairs
pub fn payload<const N: usize>(fields: [(&str, Value); N]) -> Map<String, Value> {
    fields
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}
