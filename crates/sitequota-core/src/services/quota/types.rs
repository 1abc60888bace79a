//! Quota policy and resolution types

use serde::{Deserialize, Serialize};

// ============================================================================
// Constants
// ============================================================================

/// Daily allowance of active time (15 minutes)
pub const DAILY_LIMIT_MS: i64 = 15 * 60 * 1000;

/// Shorter of the two cooldown variants in use (10 minutes)
pub const COOLDOWN_PERIOD_SHORT_MS: i64 = 10 * 60 * 1000;

/// Longer of the two cooldown variants in use (15 minutes)
pub const COOLDOWN_PERIOD_LONG_MS: i64 = 15 * 60 * 1000;

/// Length of a bonus window (2 minutes)
pub const BONUS_VISIT_LIMIT_MS: i64 = 2 * 60 * 1000;

/// Maximum number of retained usage log entries
pub const USAGE_LOG_CAPACITY: usize = 100;

/// Recurring check interval while the page is visible
pub const TICK_INTERVAL_MS: i64 = 1000;

/// An open session older than this cannot belong to a live, ticking context
pub const STALE_SESSION_MS: i64 = 5 * TICK_INTERVAL_MS;

/// How often a long-lived host re-checks for the daily rollover
pub const ROLLOVER_CHECK_INTERVAL_MS: i64 = 60 * 60 * 1000;

/// Smallest period any policy duration may be configured to
pub const MIN_PERIOD_MS: i64 = 1000;

/// Smallest tick interval
pub const MIN_TICK_INTERVAL_MS: i64 = 100;

/// Storage namespace of the tracked site
pub const DEFAULT_SITE: &str = "twitter";

/// Host names belonging to the tracked site
pub const DEFAULT_TRACKED_DOMAINS: [&str; 2] = ["twitter.com", "x.com"];

// ============================================================================
// Policy
// ============================================================================

/// Tunable quota policy
///
/// The cooldown length has two variants in circulation (10 and 15 minutes);
/// it is a plain parameter here and defaults to the shorter one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaPolicy {
    /// Daily allowance in milliseconds
    pub daily_limit_ms: i64,
    /// Blocking interval after exhaustion or a bonus window
    pub cooldown_period_ms: i64,
    /// Length of a bonus window
    pub bonus_visit_limit_ms: i64,
    /// Recurring tick interval while visible
    pub tick_interval_ms: i64,
    /// Age at which an open session is considered orphaned
    pub stale_session_ms: i64,
    /// Maximum usage log length
    pub log_capacity: usize,
    /// Background rollover check interval
    pub rollover_check_interval_ms: i64,
    /// Storage key namespace
    pub site: String,
    /// Host names that count as the tracked site
    pub tracked_domains: Vec<String>,
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self {
            daily_limit_ms: DAILY_LIMIT_MS,
            cooldown_period_ms: COOLDOWN_PERIOD_SHORT_MS,
            bonus_visit_limit_ms: BONUS_VISIT_LIMIT_MS,
            tick_interval_ms: TICK_INTERVAL_MS,
            stale_session_ms: STALE_SESSION_MS,
            log_capacity: USAGE_LOG_CAPACITY,
            rollover_check_interval_ms: ROLLOVER_CHECK_INTERVAL_MS,
            site: DEFAULT_SITE.to_string(),
            tracked_domains: DEFAULT_TRACKED_DOMAINS
                .iter()
                .map(|d| d.to_string())
                .collect(),
        }
    }
}

impl QuotaPolicy {
    /// Default policy with a cooldown of the given length
    pub fn with_cooldown_minutes(minutes: u32) -> Self {
        Self {
            cooldown_period_ms: i64::from(minutes) * 60 * 1000,
            ..Default::default()
        }
        .validate()
    }

    /// Validate and normalize the policy
    pub fn validate(&self) -> Self {
        let tick_interval_ms = self.tick_interval_ms.max(MIN_TICK_INTERVAL_MS);
        let site = self.site.trim();
        Self {
            daily_limit_ms: self.daily_limit_ms.max(MIN_PERIOD_MS),
            cooldown_period_ms: self.cooldown_period_ms.max(MIN_PERIOD_MS),
            bonus_visit_limit_ms: self.bonus_visit_limit_ms.max(MIN_PERIOD_MS),
            tick_interval_ms,
            // A live context must never look orphaned between two ticks
            stale_session_ms: self.stale_session_ms.max(2 * tick_interval_ms),
            log_capacity: self.log_capacity.max(1),
            rollover_check_interval_ms: self.rollover_check_interval_ms.max(MIN_PERIOD_MS),
            site: if site.is_empty() {
                DEFAULT_SITE.to_string()
            } else {
                site.to_string()
            },
            tracked_domains: self
                .tracked_domains
                .iter()
                .map(|d| d.trim().to_lowercase())
                .filter(|d| !d.is_empty())
                .collect(),
        }
    }

    /// Whether a host name belongs to the tracked site
    pub fn is_tracked_host(&self, host: &str) -> bool {
        let host = host.trim().trim_end_matches('.').to_lowercase();
        self.tracked_domains
            .iter()
            .any(|d| host == *d || host.ends_with(&format!(".{}", d)))
    }
}

// ============================================================================
// Access State
// ============================================================================

/// Access state the presentation layer acts on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessState {
    /// Full access, usage accrues
    Normal,
    /// Blocked until `cooldown_until`
    Cooldown,
    /// Short access window after a cooldown
    Bonus,
}

impl AccessState {
    /// Whether the page may be used in this state
    pub fn permits_access(&self) -> bool {
        matches!(self, AccessState::Normal | AccessState::Bonus)
    }
}

impl std::fmt::Display for AccessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccessState::Normal => write!(f, "normal"),
            AccessState::Cooldown => write!(f, "cooldown"),
            AccessState::Bonus => write!(f, "bonus"),
        }
    }
}

// ============================================================================
// Notices
// ============================================================================

/// Degraded-mode condition surfaced alongside a resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Notice {
    /// The store could not be read; a reload should fix it
    StoreUnavailable,
    /// The hosting context is gone; only a manual reload helps
    ContextInvalidated,
}

impl Notice {
    /// Message shown to the user
    pub fn message(&self) -> &'static str {
        match self {
            Notice::StoreUnavailable => {
                "Usage data could not be loaded. Your usage may not be tracked correctly. \
                 Please reload the page."
            }
            Notice::ContextInvalidated => {
                "The tracker has been disconnected from its storage. Please reload manually."
            }
        }
    }

    /// Whether the user may dismiss the notice
    pub fn dismissible(&self) -> bool {
        matches!(self, Notice::StoreUnavailable)
    }
}

// ============================================================================
// Resolution
// ============================================================================

/// Outcome of resolving the current access state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub state: AccessState,
    /// End of the blocking interval (epoch ms), set in `Cooldown`
    pub cooldown_until: Option<i64>,
    /// End of the bonus window (epoch ms), set in `Bonus`
    pub bonus_deadline: Option<i64>,
    /// Counted usage today including any open session
    pub usage_ms: i64,
    /// Daily limit the usage is measured against
    pub daily_limit_ms: i64,
    /// Degraded-mode condition, if any
    pub notice: Option<Notice>,
}

impl Resolution {
    /// Milliseconds left in the current cooldown or bonus window
    pub fn remaining_ms(&self, now_ms: i64) -> Option<i64> {
        match self.state {
            AccessState::Cooldown => self.cooldown_until.map(|c| c.saturating_sub(now_ms).max(0)),
            AccessState::Bonus => self.bonus_deadline.map(|d| d.saturating_sub(now_ms).max(0)),
            AccessState::Normal => None,
        }
    }

    /// Milliseconds of daily allowance left
    pub fn allowance_left_ms(&self) -> i64 {
        self.daily_limit_ms.saturating_sub(self.usage_ms).max(0)
    }
}

// ============================================================================
// Tests
// ============================================================================
