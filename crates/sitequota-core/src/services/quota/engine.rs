//! Quota engine
//!
//! The access state machine. [`resolve_record`] is a pure transition over
//! `(record, now, policy)`; [`QuotaEngine`] wraps it with the store read,
//! the write-back and the event log.
//!
//! Transition order within one resolve:
//!
//! 1. discard an orphaned session
//! 2. daily rollover
//! 3. visit counting (activations only)
//! 4. bonus window expiry
//! 5. cooldown check, or the bonus decision once it has elapsed
//! 6. daily limit check

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::events::{payload, EventLogger, PendingEvent, UsageEventType};
use super::record::{QuotaRecord, StorageKeys};
use super::tracker::{fold_session, FlushMode, SessionTracker};
use super::types::{AccessState, Notice, QuotaPolicy, Resolution};
use crate::services::clock::{from_millis, same_local_day, Clock};
use crate::services::store::{KeyValueStore, SafeStore, StoreSnapshot};

// ============================================================================
// Pure Transition
// ============================================================================

/// Per-call switches for [`resolve_record`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolveOptions {
    /// Count this call as a visit (a fresh page activation)
    pub count_visit: bool,
}

/// Result of one transition
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    /// Record after the transition
    pub record: QuotaRecord,
    pub resolution: Resolution,
    /// Events to append, in order
    pub events: Vec<PendingEvent>,
    /// Whether `record` differs from the input and must be written back
    pub changed: bool,
}

/// Steps of the decision walk. `AwaitingBonusDecision` only exists between
/// noticing an elapsed cooldown and deciding what follows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    BonusExpiry,
    CooldownCheck,
    AwaitingBonusDecision,
    LimitCheck,
    Settled(AccessState),
}

/// Accumulates record changes and events during one transition.
struct Machine<'a> {
    record: QuotaRecord,
    events: Vec<PendingEvent>,
    now: i64,
    policy: &'a QuotaPolicy,
}

impl Machine<'_> {
    fn emit(&mut self, event_type: UsageEventType, fields: serde_json::Map<String, Value>) {
        self.events.push((event_type, fields));
    }

    fn recover_orphaned_session(&mut self) {
        let Some(start) = self.record.session_start_at else {
            return;
        };
        let age = self.now.saturating_sub(start);
        if age <= self.policy.stale_session_ms {
            return;
        }
        log::warn!(
            "[quota:engine] Discarding orphaned session opened {}ms ago",
            age
        );
        self.record.session_start_at = None;
        self.emit(
            UsageEventType::SessionRecovered,
            payload([
                ("sessionStart", json!(start)),
                ("discardedMs", json!(age)),
            ]),
        );
    }

    /// Returns whether a rollover happened.
    fn rollover(&mut self) -> bool {
        let Some(last_reset) = self.record.last_reset_date else {
            // First observation ever: nothing to summarize
            self.record.last_reset_date = Some(self.now);
            return false;
        };
        if same_local_day(last_reset, self.now) {
            return false;
        }

        // totalUsageMs counts the still-open interval up to now, not only the
        // stored daily usage
        let total_ms = self.record.accrued_ms(self.now);
        log::info!(
            "[quota:engine] New day, resetting counters ({} minutes used)",
            total_ms / 60_000
        );
        self.emit(
            UsageEventType::DailySummary,
            payload([
                (
                    "summaryDate",
                    json!(from_millis(last_reset).date_naive().to_string()),
                ),
                ("totalUsageMs", json!(total_ms)),
                (
                    "totalUsageMinutes",
                    json!((total_ms as f64 / 6_000.0).round() / 10.0),
                ),
                ("visitCount", json!(self.record.visit_count)),
                ("limitReached", json!(self.record.limit_reached)),
            ]),
        );
        self.reset_counters();
        self.emit(
            UsageEventType::DailyReset,
            payload([("resetTime", json!(self.now))]),
        );
        true
    }

    fn reset_counters(&mut self) {
        let session_open = self.record.session_start_at.is_some();
        self.record = QuotaRecord {
            last_reset_date: Some(self.now),
            // An open session keeps running into the new day
            session_start_at: session_open.then_some(self.now),
            ..QuotaRecord::default()
        };
    }

    fn start_cooldown(&mut self) -> AccessState {
        fold_session(&mut self.record, self.now, FlushMode::End);
        let until = self.now.saturating_add(self.policy.cooldown_period_ms);
        self.record.cooldown_until = Some(until);
        log::info!(
            "[quota:engine] Cooldown started for {} minutes",
            self.policy.cooldown_period_ms / 60_000
        );
        self.emit(
            UsageEventType::CooldownStarted,
            payload([
                ("cooldownUntil", json!(until)),
                ("cooldownDuration", json!(self.policy.cooldown_period_ms)),
            ]),
        );
        AccessState::Cooldown
    }

    fn start_bonus(&mut self) -> AccessState {
        self.record.cooldown_until = None;
        self.record.bonus_visit_active = true;
        self.record.bonus_visit_start_at = Some(self.now);
        log::info!("[quota:engine] Bonus visit granted");
        self.emit(
            UsageEventType::BonusVisitStarted,
            payload([
                ("bonusVisitStart", json!(self.now)),
                ("bonusVisitDuration", json!(self.policy.bonus_visit_limit_ms)),
            ]),
        );
        AccessState::Bonus
    }

    /// Close the bonus window and start the following cooldown.
    fn end_bonus(&mut self) -> AccessState {
        let start = self.record.bonus_visit_start_at.unwrap_or(self.now);
        let actual_ms = self.now.saturating_sub(start);
        fold_session(&mut self.record, self.now, FlushMode::End);
        self.record.bonus_visit_active = false;
        self.record.bonus_visit_start_at = None;
        log::info!(
            "[quota:engine] Bonus visit ended after {} seconds",
            actual_ms / 1000
        );
        self.emit(
            UsageEventType::BonusVisitEnded,
            payload([
                ("bonusVisitStart", json!(start)),
                ("bonusVisitDuration", json!(self.policy.bonus_visit_limit_ms)),
                ("actualDuration", json!(actual_ms)),
            ]),
        );
        self.start_cooldown()
    }

    fn step(&mut self, step: Step) -> Step {
        match step {
            Step::BonusExpiry => {
                if !self.record.bonus_visit_active {
                    return Step::CooldownCheck;
                }
                let start = match self.record.bonus_visit_start_at {
                    Some(start) => start,
                    None => {
                        log::warn!("[quota:engine] Bonus visit without a start time, starting now");
                        self.record.bonus_visit_start_at = Some(self.now);
                        self.now
                    }
                };
                if self.now.saturating_sub(start) >= self.policy.bonus_visit_limit_ms {
                    Step::Settled(self.end_bonus())
                } else {
                    Step::Settled(AccessState::Bonus)
                }
            }
            Step::CooldownCheck => match self.record.cooldown_until {
                Some(until) if self.now < until => {
                    // Nothing accrues while blocked
                    fold_session(&mut self.record, self.now, FlushMode::End);
                    Step::Settled(AccessState::Cooldown)
                }
                Some(_) => Step::AwaitingBonusDecision,
                None => Step::LimitCheck,
            },
            Step::AwaitingBonusDecision => {
                if self.record.limit_reached {
                    Step::Settled(self.start_bonus())
                } else {
                    self.record.cooldown_until = None;
                    Step::LimitCheck
                }
            }
            Step::LimitCheck => {
                let used = self.record.accrued_ms(self.now);
                if !self.record.limit_reached && used < self.policy.daily_limit_ms {
                    return Step::Settled(AccessState::Normal);
                }
                if !self.record.limit_reached {
                    self.record.limit_reached = true;
                    log::info!(
                        "[quota:engine] Daily limit reached after {} seconds",
                        used / 1000
                    );
                    self.emit(
                        UsageEventType::LimitReached,
                        payload([
                            ("timeSpent", json!(used)),
                            ("dailyLimit", json!(self.policy.daily_limit_ms)),
                        ]),
                    );
                }
                Step::Settled(self.start_cooldown())
            }
            Step::Settled(state) => Step::Settled(state),
        }
    }

    fn finish(self, input: &QuotaRecord, state: AccessState) -> Transition {
        let resolution = resolution_for(&self.record, state, self.now, self.policy);
        Transition {
            changed: self.record != *input,
            record: self.record,
            resolution,
            events: self.events,
        }
    }
}

fn resolution_for(
    record: &QuotaRecord,
    state: AccessState,
    now_ms: i64,
    policy: &QuotaPolicy,
) -> Resolution {
    Resolution {
        state,
        cooldown_until: match state {
            AccessState::Cooldown => record.cooldown_until,
            _ => None,
        },
        bonus_deadline: match state {
            AccessState::Bonus => record
                .bonus_visit_start_at
                .map(|start| start.saturating_add(policy.bonus_visit_limit_ms)),
            _ => None,
        },
        usage_ms: record.accrued_ms(now_ms),
        daily_limit_ms: policy.daily_limit_ms,
        notice: None,
    }
}

/// Resolve the access state of `record` at `now_ms`.
///
/// Pure: the same inputs always give the same transition, and resolving the
/// resulting record again at the same instant changes nothing.
pub fn resolve_record(
    record: &QuotaRecord,
    now_ms: i64,
    policy: &QuotaPolicy,
    options: ResolveOptions,
) -> Transition {
    let mut machine = Machine {
        record: record.clone(),
        events: Vec::new(),
        now: now_ms,
        policy,
    };

    machine.recover_orphaned_session();
    machine.rollover();

    if options.count_visit && machine.record.limit_reached {
        machine.record.visit_count = machine.record.visit_count.saturating_add(1);
        log::debug!(
            "[quota:engine] Visit {} after the limit",
            machine.record.visit_count
        );
    }

    let mut step = Step::BonusExpiry;
    let state = loop {
        step = machine.step(step);
        if let Step::Settled(state) = step {
            break state;
        }
    };

    machine.finish(record, state)
}

/// Daily rollover on its own, used by the periodic background check.
pub fn rollover_record(record: &QuotaRecord, now_ms: i64, policy: &QuotaPolicy) -> Transition {
    let mut machine = Machine {
        record: record.clone(),
        events: Vec::new(),
        now: now_ms,
        policy,
    };
    machine.rollover();
    // The state is irrelevant to the caller; report what the record implies
    let state = if machine.record.bonus_visit_active {
        AccessState::Bonus
    } else if machine.record.in_cooldown(now_ms) {
        AccessState::Cooldown
    } else {
        AccessState::Normal
    };
    machine.finish(record, state)
}

/// End an active bonus window immediately (the page went to the background).
///
/// Without an active bonus this is a plain resolve.
pub fn end_bonus_record(record: &QuotaRecord, now_ms: i64, policy: &QuotaPolicy) -> Transition {
    let mut machine = Machine {
        record: record.clone(),
        events: Vec::new(),
        now: now_ms,
        policy,
    };
    machine.rollover();
    if !machine.record.bonus_visit_active {
        return resolve_record(record, now_ms, policy, ResolveOptions::default());
    }
    let state = machine.end_bonus();
    machine.finish(record, state)
}

/// Unconditionally zero the daily counters.
pub fn reset_record(record: &QuotaRecord, now_ms: i64, policy: &QuotaPolicy) -> Transition {
    let mut machine = Machine {
        record: record.clone(),
        events: Vec::new(),
        now: now_ms,
        policy,
    };
    machine.reset_counters();
    machine.emit(
        UsageEventType::DailyReset,
        payload([("resetTime", json!(now_ms)), ("forced", json!(true))]),
    );
    let mut transition = machine.finish(record, AccessState::Normal);
    // Always persist, even if the counters were already zero
    transition.changed = true;
    transition
}

// ============================================================================
// Stats
// ============================================================================

/// Aggregated figures for display surfaces
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaStats {
    /// Stored usage today in milliseconds
    pub daily_usage: i64,
    pub visit_count: u32,
    pub cooldown_until: Option<i64>,
    pub limit_reached: bool,
    pub bonus_visit_active: bool,
    pub bonus_visit_start_at: Option<i64>,
}

impl From<&QuotaRecord> for QuotaStats {
    fn from(record: &QuotaRecord) -> Self {
        Self {
            daily_usage: record.daily_usage_ms,
            visit_count: record.visit_count,
            cooldown_until: record.cooldown_until,
            limit_reached: record.limit_reached,
            bonus_visit_active: record.bonus_visit_active,
            bonus_visit_start_at: record.bonus_visit_start_at,
        }
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Store-backed quota state machine for one site
#[derive(Clone)]
pub struct QuotaEngine {
    store: SafeStore,
    clock: Arc<dyn Clock>,
    policy: QuotaPolicy,
    keys: StorageKeys,
    logger: EventLogger,
}

impl QuotaEngine {
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>, policy: QuotaPolicy) -> Self {
        let policy = policy.validate();
        let store = SafeStore::new(store);
        let keys = StorageKeys::for_site(&policy.site);
        let logger = EventLogger::new(
            store.clone(),
            clock.clone(),
            keys.usage_logs.clone(),
            policy.log_capacity,
        );
        Self {
            store,
            clock,
            policy,
            keys,
            logger,
        }
    }

    pub fn policy(&self) -> &QuotaPolicy {
        &self.policy
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn logger(&self) -> &EventLogger {
        &self.logger
    }

    /// A session tracker over the same store and clock
    pub fn tracker(&self) -> SessionTracker {
        SessionTracker::new(self.store.clone(), self.clock.clone(), &self.policy)
    }

    async fn read(&self) -> (QuotaRecord, Option<Notice>) {
        let snapshot: StoreSnapshot = self.store.get(&self.keys.record_keys()).await;
        let notice = snapshot.failure.as_ref().map(|failure| {
            if failure.is_context_invalidated() {
                Notice::ContextInvalidated
            } else {
                Notice::StoreUnavailable
            }
        });
        (QuotaRecord::from_snapshot(&snapshot, &self.keys), notice)
    }

    /// Persist a transition and log its events. Nothing is written when the
    /// read behind it failed.
    async fn commit(&self, transition: Transition, read_notice: Option<Notice>) -> Resolution {
        let mut resolution = transition.resolution;

        if let Some(notice) = read_notice {
            log::warn!(
                "[quota:engine] Resolved over defaults ({:?}), not writing back",
                notice
            );
            resolution.notice = Some(notice);
            return resolution;
        }

        if transition.changed && !self.store.set(transition.record.to_values(&self.keys)).await {
            log::error!("[quota:engine] Failed to persist quota state");
            resolution.notice = Some(Notice::StoreUnavailable);
            // The events describe a state that was not stored
            return resolution;
        }

        self.logger.log_events(transition.events).await;
        resolution
    }

    /// Resolve the current access state.
    pub async fn resolve(&self) -> Resolution {
        self.run(ResolveOptions::default()).await
    }

    /// Resolve for a fresh page activation, counting the visit.
    pub async fn activate(&self) -> Resolution {
        self.run(ResolveOptions { count_visit: true }).await
    }

    async fn run(&self, options: ResolveOptions) -> Resolution {
        let now = self.clock.now_ms();
        let (record, notice) = self.read().await;
        let transition = resolve_record(&record, now, &self.policy, options);
        log::debug!(
            "[quota:engine] Resolved {} ({} events)",
            transition.resolution.state,
            transition.events.len()
        );
        self.commit(transition, notice).await
    }

    /// End an active bonus window now, starting the next cooldown.
    pub async fn end_bonus_visit(&self) -> Resolution {
        let now = self.clock.now_ms();
        let (record, notice) = self.read().await;
        let transition = end_bonus_record(&record, now, &self.policy);
        self.commit(transition, notice).await
    }

    /// Apply the daily rollover if the date changed. Returns whether the
    /// counters were reset.
    pub async fn check_daily_rollover(&self) -> bool {
        let now = self.clock.now_ms();
        let (record, notice) = self.read().await;
        let transition = rollover_record(&record, now, &self.policy);
        let rolled = transition
            .events
            .iter()
            .any(|(event_type, _)| *event_type == UsageEventType::DailyReset);
        let resolution = self.commit(transition, notice).await;
        rolled && resolution.notice.is_none()
    }

    /// Zero today's counters regardless of the date. Returns whether the
    /// reset was persisted.
    pub async fn force_reset(&self) -> bool {
        let now = self.clock.now_ms();
        let (record, notice) = self.read().await;
        let transition = reset_record(&record, now, &self.policy);
        let resolution = self.commit(transition, notice).await;
        if resolution.notice.is_none() {
            log::info!("[quota:engine] Daily counters reset");
            true
        } else {
            false
        }
    }

    /// The stored record, or `None` if it could not be read
    pub async fn load(&self) -> Option<QuotaRecord> {
        match self.read().await {
            (record, None) => Some(record),
            (_, Some(_)) => None,
        }
    }

    /// Aggregated stats; defaults if the store is unreadable
    pub async fn stats(&self) -> QuotaStats {
        let (record, _) = self.read().await;
        QuotaStats::from(&record)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::clock::ManualClock;
    use crate::services::quota::types::{BONUS_VISIT_LIMIT_MS, DAILY_LIMIT_MS};
    use crate::services::store::{MemoryStore, StoreError};
    use chrono::{Duration, Local, TimeZone};
    use std::collections::HashMap;

    fn noon_ms() -> i64 {
        Local
            .with_ymd_and_hms(2026, 3, 10, 12, 0, 0)
            .unwrap()
            .timestamp_millis()
    }

    fn policy() -> QuotaPolicy {
        QuotaPolicy::default()
    }

    fn event_types(transition: &Transition) -> Vec<UsageEventType> {
        transition.events.iter().map(|(t, _)| *t).collect()
    }

    fn today(now: i64) -> QuotaRecord {
        QuotaRecord {
            last_reset_date: Some(now),
            ..Default::default()
        }
    }

    // ------------------------------------------------------------------
    // Pure transitions
    // ------------------------------------------------------------------

    #[test]
    fn test_fresh_record_is_normal() {
        let now = noon_ms();
        let t = resolve_record(&QuotaRecord::default(), now, &policy(), ResolveOptions::default());
        assert_eq!(t.resolution.state, AccessState::Normal);
        assert_eq!(t.record.last_reset_date, Some(now));
        assert!(t.changed);
        assert!(t.events.is_empty());
    }

    #[test]
    fn test_resolve_is_idempotent() {
        let now = noon_ms();
        let record = QuotaRecord {
            daily_usage_ms: DAILY_LIMIT_MS,
            ..today(now)
        };
        let first = resolve_record(&record, now, &policy(), ResolveOptions::default());
        assert_eq!(first.resolution.state, AccessState::Cooldown);
        assert!(first.changed);

        let second = resolve_record(&first.record, now, &policy(), ResolveOptions::default());
        assert_eq!(second.resolution, first.resolution);
        assert!(!second.changed);
        assert!(second.events.is_empty());
    }

    #[test]
    fn test_daily_rollover() {
        let now = noon_ms();
        let yesterday = now - Duration::days(1).num_milliseconds();
        let record = QuotaRecord {
            daily_usage_ms: DAILY_LIMIT_MS,
            visit_count: 4,
            last_reset_date: Some(yesterday),
            limit_reached: true,
            bonus_visit_active: true,
            bonus_visit_start_at: Some(yesterday),
            cooldown_until: Some(yesterday + 1_000),
            session_start_at: None,
        };
        let t = resolve_record(&record, now, &policy(), ResolveOptions::default());

        assert_eq!(t.resolution.state, AccessState::Normal);
        assert_eq!(
            event_types(&t),
            vec![UsageEventType::DailySummary, UsageEventType::DailyReset]
        );
        assert_eq!(t.record, today(now));

        let summary = &t.events[0].1;
        assert_eq!(summary["totalUsageMs"], json!(DAILY_LIMIT_MS));
        assert_eq!(summary["totalUsageMinutes"], json!(15.0));
        assert_eq!(summary["visitCount"], json!(4));
        assert_eq!(summary["limitReached"], json!(true));
    }

    #[test]
    fn test_rollover_keeps_open_session_running() {
        let now = noon_ms();
        let yesterday = now - Duration::days(1).num_milliseconds();
        let record = QuotaRecord {
            daily_usage_ms: 60_000,
            session_start_at: Some(now - 1_000),
            last_reset_date: Some(yesterday),
            ..Default::default()
        };
        let t = resolve_record(&record, now, &policy(), ResolveOptions::default());
        assert_eq!(t.record.session_start_at, Some(now));
        assert_eq!(t.record.daily_usage_ms, 0);
        assert_eq!(t.events[0].1["totalUsageMs"], json!(61_000));
    }

    #[test]
    fn test_limit_then_cooldown() {
        let now = noon_ms();
        let record = QuotaRecord {
            daily_usage_ms: DAILY_LIMIT_MS - 1,
            session_start_at: Some(now),
            ..today(now)
        };
        let t = resolve_record(&record, now + 2, &policy(), ResolveOptions::default());

        assert_eq!(t.resolution.state, AccessState::Cooldown);
        assert_eq!(
            event_types(&t),
            vec![UsageEventType::LimitReached, UsageEventType::CooldownStarted]
        );
        let until = now + 2 + policy().cooldown_period_ms;
        assert_eq!(t.record.cooldown_until, Some(until));
        assert_eq!(t.resolution.cooldown_until, Some(until));
        assert_eq!(t.events[1].1["cooldownUntil"], json!(until));
        assert!(t.record.limit_reached);
        assert_eq!(t.record.session_start_at, None);
        assert_eq!(t.record.daily_usage_ms, DAILY_LIMIT_MS + 1);
    }

    #[test]
    fn test_cooldown_holds_until_deadline() {
        let now = noon_ms();
        let record = QuotaRecord {
            daily_usage_ms: DAILY_LIMIT_MS,
            limit_reached: true,
            cooldown_until: Some(now + 10_000),
            ..today(now)
        };
        let t = resolve_record(&record, now + 9_999, &policy(), ResolveOptions::default());
        assert_eq!(t.resolution.state, AccessState::Cooldown);
        assert!(!t.changed);
    }

    #[test]
    fn test_elapsed_cooldown_grants_bonus() {
        let now = noon_ms();
        let record = QuotaRecord {
            daily_usage_ms: DAILY_LIMIT_MS,
            limit_reached: true,
            cooldown_until: Some(now),
            ..today(now)
        };
        let t = resolve_record(&record, now + 1, &policy(), ResolveOptions::default());

        assert_eq!(t.resolution.state, AccessState::Bonus);
        assert_eq!(event_types(&t), vec![UsageEventType::BonusVisitStarted]);
        assert!(t.record.bonus_visit_active);
        assert_eq!(t.record.bonus_visit_start_at, Some(now + 1));
        assert_eq!(t.record.cooldown_until, None);
        assert_eq!(
            t.resolution.bonus_deadline,
            Some(now + 1 + BONUS_VISIT_LIMIT_MS)
        );
    }

    #[test]
    fn test_bonus_expiry_starts_new_cooldown() {
        let now = noon_ms();
        let record = QuotaRecord {
            daily_usage_ms: DAILY_LIMIT_MS,
            limit_reached: true,
            bonus_visit_active: true,
            bonus_visit_start_at: Some(now),
            session_start_at: Some(now + BONUS_VISIT_LIMIT_MS - 1_000),
            ..today(now)
        };
        let end = now + BONUS_VISIT_LIMIT_MS;
        let t = resolve_record(&record, end, &policy(), ResolveOptions::default());

        assert_eq!(t.resolution.state, AccessState::Cooldown);
        assert_eq!(
            event_types(&t),
            vec![
                UsageEventType::BonusVisitEnded,
                UsageEventType::CooldownStarted
            ]
        );
        assert_eq!(t.events[0].1["actualDuration"], json!(BONUS_VISIT_LIMIT_MS));
        assert!(!t.record.bonus_visit_active);
        assert_eq!(t.record.bonus_visit_start_at, None);
        assert_eq!(t.record.cooldown_until, Some(end + policy().cooldown_period_ms));
        assert_eq!(t.record.daily_usage_ms, DAILY_LIMIT_MS + 1_000);
    }

    #[test]
    fn test_bonus_ignores_stale_cooldown() {
        let now = noon_ms();
        let record = QuotaRecord {
            limit_reached: true,
            bonus_visit_active: true,
            bonus_visit_start_at: Some(now),
            cooldown_until: Some(now + 60_000),
            ..today(now)
        };
        let t = resolve_record(&record, now + 1_000, &policy(), ResolveOptions::default());
        assert_eq!(t.resolution.state, AccessState::Bonus);
    }

    #[test]
    fn test_bonus_without_start_defaults_to_now() {
        let now = noon_ms();
        let record = QuotaRecord {
            limit_reached: true,
            bonus_visit_active: true,
            ..today(now)
        };
        let t = resolve_record(&record, now, &policy(), ResolveOptions::default());
        assert_eq!(t.resolution.state, AccessState::Bonus);
        assert_eq!(t.record.bonus_visit_start_at, Some(now));
    }

    #[test]
    fn test_elapsed_cooldown_without_limit_returns_to_normal() {
        let now = noon_ms();
        let record = QuotaRecord {
            cooldown_until: Some(now - 1),
            ..today(now)
        };
        let t = resolve_record(&record, now, &policy(), ResolveOptions::default());
        assert_eq!(t.resolution.state, AccessState::Normal);
        assert_eq!(t.record.cooldown_until, None);
    }

    #[test]
    fn test_limit_flag_without_cooldown_blocks_again() {
        let now = noon_ms();
        let record = QuotaRecord {
            limit_reached: true,
            ..today(now)
        };
        let t = resolve_record(&record, now, &policy(), ResolveOptions::default());
        assert_eq!(t.resolution.state, AccessState::Cooldown);
        // Already reached today, only the cooldown is logged
        assert_eq!(event_types(&t), vec![UsageEventType::CooldownStarted]);
    }

    #[test]
    fn test_visit_counting() {
        let now = noon_ms();
        let activate = ResolveOptions { count_visit: true };

        let under = QuotaRecord {
            daily_usage_ms: 1_000,
            ..today(now)
        };
        let t = resolve_record(&under, now, &policy(), activate);
        assert_eq!(t.record.visit_count, 0);

        let blocked = QuotaRecord {
            limit_reached: true,
            cooldown_until: Some(now + 60_000),
            visit_count: 2,
            ..today(now)
        };
        let t = resolve_record(&blocked, now, &policy(), activate);
        assert_eq!(t.record.visit_count, 3);

        let t = resolve_record(&blocked, now, &policy(), ResolveOptions::default());
        assert_eq!(t.record.visit_count, 2);
    }

    #[test]
    fn test_orphaned_session_is_discarded() {
        let now = noon_ms();
        let record = QuotaRecord {
            daily_usage_ms: 1_000,
            session_start_at: Some(now - 60_000),
            ..today(now)
        };
        let t = resolve_record(&record, now, &policy(), ResolveOptions::default());
        assert_eq!(t.record.session_start_at, None);
        assert_eq!(t.record.daily_usage_ms, 1_000);
        assert_eq!(event_types(&t), vec![UsageEventType::SessionRecovered]);
        assert_eq!(t.events[0].1["discardedMs"], json!(60_000));
    }

    #[test]
    fn test_live_session_is_kept() {
        let now = noon_ms();
        let record = QuotaRecord {
            session_start_at: Some(now - 1_000),
            ..today(now)
        };
        let t = resolve_record(&record, now, &policy(), ResolveOptions::default());
        assert_eq!(t.record.session_start_at, Some(now - 1_000));
        assert_eq!(t.resolution.usage_ms, 1_000);
        assert!(!t.changed);
    }

    #[test]
    fn test_end_bonus_record() {
        let now = noon_ms();
        let record = QuotaRecord {
            limit_reached: true,
            bonus_visit_active: true,
            bonus_visit_start_at: Some(now),
            session_start_at: Some(now),
            ..today(now)
        };
        let t = end_bonus_record(&record, now + 30_000, &policy());
        assert_eq!(t.resolution.state, AccessState::Cooldown);
        assert_eq!(t.events[0].1["actualDuration"], json!(30_000));
        assert_eq!(t.record.daily_usage_ms, 30_000);

        // No bonus: same as a plain resolve
        let plain = end_bonus_record(&today(now), now, &policy());
        assert_eq!(plain.resolution.state, AccessState::Normal);
        assert!(plain.events.is_empty());
    }

    #[test]
    fn test_reset_record_always_writes() {
        let now = noon_ms();
        let t = reset_record(&today(now), now, &policy());
        assert!(t.changed);
        assert_eq!(event_types(&t), vec![UsageEventType::DailyReset]);
        assert_eq!(t.events[0].1["forced"], json!(true));
    }

    // ------------------------------------------------------------------
    // Store-backed engine
    // ------------------------------------------------------------------

    fn engine() -> (QuotaEngine, Arc<ManualClock>, Arc<MemoryStore>) {
        let backend = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::at_ms(noon_ms()));
        let engine = QuotaEngine::new(backend.clone(), clock.clone(), policy());
        (engine, clock, backend)
    }

    #[tokio::test]
    async fn test_engine_full_cycle() {
        let (engine, clock, _backend) = engine();
        let tracker = engine.tracker();

        assert_eq!(engine.activate().await.state, AccessState::Normal);
        tracker.start_accrual().await;

        // Use up the quota one tick at a time
        let mut state = AccessState::Normal;
        for _ in 0..(DAILY_LIMIT_MS / 1_000) {
            clock.advance_ms(1_000);
            tracker.flush_accrual(FlushMode::Continue).await;
            state = engine.resolve().await.state;
            if state != AccessState::Normal {
                break;
            }
        }
        assert_eq!(state, AccessState::Cooldown);

        clock.advance_ms(policy().cooldown_period_ms);
        assert_eq!(engine.activate().await.state, AccessState::Bonus);

        clock.advance_ms(BONUS_VISIT_LIMIT_MS);
        let resolution = engine.resolve().await;
        assert_eq!(resolution.state, AccessState::Cooldown);

        let types: Vec<_> = engine
            .logger()
            .entries()
            .await
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(
            types,
            vec![
                UsageEventType::LimitReached,
                UsageEventType::CooldownStarted,
                UsageEventType::BonusVisitStarted,
                UsageEventType::BonusVisitEnded,
                UsageEventType::CooldownStarted,
            ]
        );

        let stats = engine.stats().await;
        assert!(stats.limit_reached);
        assert_eq!(stats.visit_count, 1);
    }

    #[tokio::test]
    async fn test_engine_idempotent_resolve_logs_once() {
        let (engine, _clock, backend) = engine();
        let keys = StorageKeys::for_site("twitter");
        backend
            .set(
                QuotaRecord {
                    daily_usage_ms: DAILY_LIMIT_MS,
                    ..today(noon_ms())
                }
                .to_values(&keys),
            )
            .await
            .unwrap();

        let first = engine.resolve().await;
        let second = engine.resolve().await;
        assert_eq!(first, second);
        assert_eq!(engine.logger().entries().await.len(), 2);
    }

    #[tokio::test]
    async fn test_engine_store_failure_resolves_normal() {
        let (engine, _clock, backend) = engine();
        backend.fail_reads(Some(StoreError::Unavailable("gone".to_string())));

        let resolution = engine.resolve().await;
        assert_eq!(resolution.state, AccessState::Normal);
        assert_eq!(resolution.usage_ms, 0);
        assert_eq!(resolution.notice, Some(Notice::StoreUnavailable));

        backend.fail_reads(None);
        // Nothing was written back over the real data
        assert!(backend.is_empty().await);
    }

    #[tokio::test]
    async fn test_engine_context_invalidated_notice() {
        let (engine, _clock, backend) = engine();
        backend.fail_reads(Some(StoreError::classify(
            "Extension context invalidated.",
        )));
        let resolution = engine.activate().await;
        assert_eq!(resolution.notice, Some(Notice::ContextInvalidated));
        assert!(engine.load().await.is_none());
    }

    #[tokio::test]
    async fn test_engine_write_failure_skips_events() {
        let (engine, _clock, backend) = engine();
        backend
            .set(
                QuotaRecord {
                    limit_reached: true,
                    ..today(noon_ms())
                }
                .to_values(&StorageKeys::for_site("twitter")),
            )
            .await
            .unwrap();
        backend.fail_writes(Some(StoreError::Unavailable("full".to_string())));

        let resolution = engine.resolve().await;
        assert_eq!(resolution.state, AccessState::Cooldown);
        assert_eq!(resolution.notice, Some(Notice::StoreUnavailable));

        backend.fail_writes(None);
        assert!(engine.logger().entries().await.is_empty());
    }

    #[tokio::test]
    async fn test_engine_out_of_range_values_default() {
        let (engine, _clock, backend) = engine();
        let keys = StorageKeys::for_site("twitter");
        let now = noon_ms();
        backend
            .set(HashMap::from([
                (keys.last_reset_date.clone(), json!(now)),
                (keys.bonus_visit_active.clone(), json!(true)),
                (keys.bonus_visit_start.clone(), json!(1e19)),
                (keys.daily_usage.clone(), json!(1e300)),
                (keys.session_start.clone(), json!(now - 1_000)),
            ]))
            .await
            .unwrap();

        let resolution = engine.resolve().await;
        assert_eq!(resolution.state, AccessState::Bonus);
        assert_eq!(resolution.bonus_deadline, Some(now + BONUS_VISIT_LIMIT_MS));
        assert_eq!(resolution.usage_ms, 1_000);
        assert_eq!(resolution.notice, None);
    }

    #[test]
    fn test_extreme_record_saturates() {
        let now = noon_ms();
        let record = QuotaRecord {
            daily_usage_ms: i64::MAX,
            bonus_visit_active: true,
            bonus_visit_start_at: Some(i64::MAX),
            ..today(now)
        };
        let t = resolve_record(&record, now, &policy(), ResolveOptions::default());
        assert_eq!(t.resolution.state, AccessState::Bonus);
        assert_eq!(t.resolution.bonus_deadline, Some(i64::MAX));
        assert_eq!(t.resolution.usage_ms, i64::MAX);
    }

    #[tokio::test]
    async fn test_engine_rollover_check() {
        let (engine, clock, _backend) = engine();
        engine.resolve().await;
        assert!(!engine.check_daily_rollover().await);

        clock.advance(Duration::days(1));
        assert!(engine.check_daily_rollover().await);
        assert!(!engine.check_daily_rollover().await);
    }

    #[tokio::test]
    async fn test_engine_force_reset() {
        let (engine, _clock, backend) = engine();
        backend
            .set(
                QuotaRecord {
                    daily_usage_ms: 5_000,
                    limit_reached: true,
                    visit_count: 3,
                    ..today(noon_ms())
                }
                .to_values(&StorageKeys::for_site("twitter")),
            )
            .await
            .unwrap();

        assert!(engine.force_reset().await);
        let record = engine.load().await.unwrap();
        assert_eq!(record.daily_usage_ms, 0);
        assert!(!record.limit_reached);
        assert_eq!(record.visit_count, 0);
    }
}
