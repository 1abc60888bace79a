//! Persisted quota record
//!
//! One logical row per tracked site, spread over namespaced store keys.
//! Decoding is forgiving: anything missing or ill-typed falls back to its
//! default instead of failing the read.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::services::store::StoreSnapshot;

// ============================================================================
// Storage Keys
// ============================================================================

/// Store keys for one site namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageKeys {
    pub daily_usage: String,
    pub session_start: String,
    pub cooldown_until: String,
    pub visit_count: String,
    pub last_reset_date: String,
    pub limit_reached: String,
    pub bonus_visit_active: String,
    pub bonus_visit_start: String,
    pub usage_logs: String,
}

impl StorageKeys {
    pub fn for_site(site: &str) -> Self {
        let key = |name: &str| format!("{}_{}", site, name);
        Self {
            daily_usage: key("daily_usage"),
            session_start: key("session_start"),
            cooldown_until: key("cooldown_until"),
            visit_count: key("visit_count"),
            last_reset_date: key("last_reset_date"),
            limit_reached: key("limit_reached"),
            bonus_visit_active: key("bonus_visit_active"),
            bonus_visit_start: key("bonus_visit_start"),
            usage_logs: key("usage_logs"),
        }
    }

    /// Every key that makes up a [`QuotaRecord`]
    pub fn record_keys(&self) -> Vec<String> {
        vec![
            self.daily_usage.clone(),
            self.session_start.clone(),
            self.cooldown_until.clone(),
            self.visit_count.clone(),
            self.last_reset_date.clone(),
            self.limit_reached.clone(),
            self.bonus_visit_active.clone(),
            self.bonus_visit_start.clone(),
        ]
    }
}

// ============================================================================
// Record
// ============================================================================

/// The persisted quota state. Timestamps are epoch milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaRecord {
    /// Accumulated active time today
    pub daily_usage_ms: i64,
    /// Start of the currently open accrual interval
    pub session_start_at: Option<i64>,
    /// End of the current blocking interval
    pub cooldown_until: Option<i64>,
    /// Activations recorded after the quota was first exhausted today
    pub visit_count: u32,
    /// When the daily counters were last zeroed
    pub last_reset_date: Option<i64>,
    /// Set once usage crossed the daily limit today
    pub limit_reached: bool,
    /// Inside a granted bonus window
    pub bonus_visit_active: bool,
    /// Start of the current bonus window
    pub bonus_visit_start_at: Option<i64>,
}

impl QuotaRecord {
    /// Decode a record from a store snapshot, defaulting what is missing.
    pub fn from_snapshot(snapshot: &StoreSnapshot, keys: &StorageKeys) -> Self {
        Self::from_values(&snapshot.values, keys)
    }

    pub fn from_values(values: &HashMap<String, Value>, keys: &StorageKeys) -> Self {
        let get = |key: &String| values.get(key);
        Self {
            daily_usage_ms: get(&keys.daily_usage).map(read_duration).unwrap_or(0),
            session_start_at: get(&keys.session_start).and_then(read_timestamp),
            cooldown_until: get(&keys.cooldown_until).and_then(read_timestamp),
            visit_count: get(&keys.visit_count).map(read_count).unwrap_or(0),
            last_reset_date: get(&keys.last_reset_date).and_then(read_timestamp),
            limit_reached: get(&keys.limit_reached).map(read_flag).unwrap_or(false),
            bonus_visit_active: get(&keys.bonus_visit_active)
                .map(read_flag)
                .unwrap_or(false),
            bonus_visit_start_at: get(&keys.bonus_visit_start).and_then(read_timestamp),
        }
    }

    /// Encode every field; absent timestamps are written as `null`.
    pub fn to_values(&self, keys: &StorageKeys) -> HashMap<String, Value> {
        let ts = |v: Option<i64>| v.map(Value::from).unwrap_or(Value::Null);
        HashMap::from([
            (keys.daily_usage.clone(), Value::from(self.daily_usage_ms)),
            (keys.session_start.clone(), ts(self.session_start_at)),
            (keys.cooldown_until.clone(), ts(self.cooldown_until)),
            (keys.visit_count.clone(), Value::from(self.visit_count)),
            (keys.last_reset_date.clone(), ts(self.last_reset_date)),
            (keys.limit_reached.clone(), Value::Bool(self.limit_reached)),
            (
                keys.bonus_visit_active.clone(),
                Value::Bool(self.bonus_visit_active),
            ),
            (keys.bonus_visit_start.clone(), ts(self.bonus_visit_start_at)),
        ])
    }

    /// Duration of the open session at `now_ms`, zero if none is open
    pub fn open_session_ms(&self, now_ms: i64) -> i64 {
        self.session_start_at
            .map(|start| now_ms.saturating_sub(start).max(0))
            .unwrap_or(0)
    }

    /// Stored usage plus the open session
    pub fn accrued_ms(&self, now_ms: i64) -> i64 {
        self.daily_usage_ms
            .saturating_add(self.open_session_ms(now_ms))
    }

    /// Whether a cooldown is running at `now_ms`
    pub fn in_cooldown(&self, now_ms: i64) -> bool {
        self.cooldown_until.is_some_and(|until| now_ms < until)
    }
}

/// Largest stored number accepted: 9999-12-31T23:59:59.999Z in epoch
/// milliseconds. Anything beyond is corrupt and decodes as absent.
pub const MAX_STORED_MS: i64 = 253_402_300_799_999;

// Numbers may arrive as floats from hosts that only have doubles

fn read_number(value: &Value) -> Option<i64> {
    let number = match value.as_i64() {
        Some(n) => n,
        None => {
            let f = value.as_f64().filter(|f| f.is_finite())?;
            if f.abs() > MAX_STORED_MS as f64 {
                return None;
            }
            f as i64
        }
    };
    (number <= MAX_STORED_MS).then_some(number)
}

fn read_duration(value: &Value) -> i64 {
    read_number(value).unwrap_or(0).max(0)
}

fn read_count(value: &Value) -> u32 {
    read_number(value)
        .unwrap_or(0)
        .clamp(0, i64::from(u32::MAX)) as u32
}

fn read_timestamp(value: &Value) -> Option<i64> {
    read_number(value).filter(|ms| *ms > 0)
}

fn read_flag(value: &Value) -> bool {
    value.as_bool().unwrap_or(false)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn keys() -> StorageKeys {
        StorageKeys::for_site("twitter")
    }

    #[test]
    fn test_keys_are_namespaced() {
        let keys = StorageKeys::for_site("reddit");
        assert_eq!(keys.daily_usage, "reddit_daily_usage");
        assert_eq!(keys.usage_logs, "reddit_usage_logs");
        assert_eq!(keys.record_keys().len(), 8);
        assert!(!keys.record_keys().contains(&keys.usage_logs));
    }

    #[test]
    fn test_empty_values_decode_to_defaults() {
        let record = QuotaRecord::from_values(&HashMap::new(), &keys());
        assert_eq!(record, QuotaRecord::default());
    }

    #[test]
    fn test_encode_decode_preserves_fields() {
        let record = QuotaRecord {
            daily_usage_ms: 42_000,
            session_start_at: Some(1_700_000_000_000),
            cooldown_until: None,
            visit_count: 3,
            last_reset_date: Some(1_699_999_000_000),
            limit_reached: true,
            bonus_visit_active: true,
            bonus_visit_start_at: Some(1_700_000_001_000),
        };
        let values = record.to_values(&keys());
        assert_eq!(values.get(&keys().cooldown_until), Some(&Value::Null));
        assert_eq!(QuotaRecord::from_values(&values, &keys()), record);
    }

    #[test]
    fn test_ill_typed_values_fall_back() {
        let k = keys();
        let values = HashMap::from([
            (k.daily_usage.clone(), json!(-500)),
            (k.session_start.clone(), json!("yesterday")),
            (k.cooldown_until.clone(), json!(0)),
            (k.visit_count.clone(), json!(2.9)),
            (k.limit_reached.clone(), json!("true")),
            (k.bonus_visit_start.clone(), json!(1.7e12)),
        ]);
        let record = QuotaRecord::from_values(&values, &k);

        assert_eq!(record.daily_usage_ms, 0);
        assert_eq!(record.session_start_at, None);
        assert_eq!(record.cooldown_until, None);
        assert_eq!(record.visit_count, 2);
        assert!(!record.limit_reached);
        assert_eq!(record.bonus_visit_start_at, Some(1_700_000_000_000));
    }

    #[test]
    fn test_out_of_range_numbers_fall_back() {
        let k = keys();
        let values = HashMap::from([
            (k.daily_usage.clone(), json!(1e300)),
            (k.session_start.clone(), json!(i64::MAX)),
            (k.cooldown_until.clone(), json!(1e19)),
            (k.visit_count.clone(), json!(1e19)),
            (k.bonus_visit_start.clone(), json!(MAX_STORED_MS + 1)),
            (k.last_reset_date.clone(), json!(MAX_STORED_MS)),
        ]);
        let record = QuotaRecord::from_values(&values, &k);

        assert_eq!(record.daily_usage_ms, 0);
        assert_eq!(record.session_start_at, None);
        assert_eq!(record.cooldown_until, None);
        assert_eq!(record.visit_count, 0);
        assert_eq!(record.bonus_visit_start_at, None);
        assert_eq!(record.last_reset_date, Some(MAX_STORED_MS));
    }

    #[test]
    fn test_accrued_saturates() {
        let record = QuotaRecord {
            daily_usage_ms: i64::MAX - 10,
            session_start_at: Some(i64::MIN),
            ..Default::default()
        };
        assert_eq!(record.accrued_ms(1_000), i64::MAX);
    }

    #[test]
    fn test_accrued_includes_open_session() {
        let record = QuotaRecord {
            daily_usage_ms: 1_000,
            session_start_at: Some(10_000),
            ..Default::default()
        };
        assert_eq!(record.accrued_ms(12_500), 3_500);
        // A session start in the future never subtracts
        assert_eq!(record.accrued_ms(9_000), 1_000);
    }

    #[test]
    fn test_in_cooldown() {
        let record = QuotaRecord {
            cooldown_until: Some(5_000),
            ..Default::default()
        };
        assert!(record.in_cooldown(4_999));
        assert!(!record.in_cooldown(5_000));
        assert!(!QuotaRecord::default().in_cooldown(0));
    }
}
