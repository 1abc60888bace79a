//! Presentation mapping
//!
//! Turns a [`Resolution`] into what a host should show. Hosts implement
//! [`Presenter`] and are re-rendered on every resolve, so the presenter is
//! the single source of truth for the blocking view.

use serde::{Deserialize, Serialize};

use super::types::{AccessState, Resolution};

/// How close the user is to running out
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Calm,
    Warning,
    Critical,
}

impl Urgency {
    /// Tier for the remaining daily allowance
    pub fn for_allowance(left_ms: i64) -> Self {
        match left_ms {
            ms if ms < 60_000 => Urgency::Critical,
            ms if ms < 5 * 60_000 => Urgency::Warning,
            _ => Urgency::Calm,
        }
    }

    /// Tier for the remaining bonus window
    pub fn for_bonus(left_ms: i64) -> Self {
        match left_ms {
            ms if ms < 30_000 => Urgency::Critical,
            ms if ms < 60_000 => Urgency::Warning,
            _ => Urgency::Calm,
        }
    }
}

/// What a host displays for one resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "view", rename_all = "snake_case")]
pub enum Presentation {
    /// Normal access with the daily allowance left
    Full {
        time_left_ms: i64,
        percent_used: u8,
        urgency: Urgency,
    },
    /// Inside a bonus window
    Bonus { time_left_ms: i64, urgency: Urgency },
    /// Blocking overlay with a countdown, plus a storage banner if one applies
    Blocked {
        remaining_ms: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        notice: Option<String>,
    },
    /// Degraded-mode banner
    Error {
        message: String,
        dismissible: bool,
    },
}

impl Presentation {
    /// A notice replaces the normal and bonus views but never lifts the
    /// blocking overlay.
    pub fn from_resolution(resolution: &Resolution, now_ms: i64) -> Self {
        if let Some(notice) = resolution.notice.filter(|_| resolution.state.permits_access()) {
            return Presentation::Error {
                message: notice.message().to_string(),
                dismissible: notice.dismissible(),
            };
        }

        match resolution.state {
            AccessState::Normal => {
                let left = resolution.allowance_left_ms();
                Presentation::Full {
                    time_left_ms: left,
                    percent_used: percent(resolution.usage_ms, resolution.daily_limit_ms),
                    urgency: Urgency::for_allowance(left),
                }
            }
            AccessState::Bonus => {
                let left = resolution.remaining_ms(now_ms).unwrap_or(0);
                Presentation::Bonus {
                    time_left_ms: left,
                    urgency: Urgency::for_bonus(left),
                }
            }
            AccessState::Cooldown => Presentation::Blocked {
                remaining_ms: resolution.remaining_ms(now_ms).unwrap_or(0),
                notice: resolution.notice.map(|n| n.message().to_string()),
            },
        }
    }

    /// Whether the blocking overlay must be shown
    pub fn is_blocking(&self) -> bool {
        matches!(self, Presentation::Blocked { .. })
    }

    /// One-line text for the view
    pub fn headline(&self) -> String {
        match self {
            Presentation::Full { time_left_ms, .. } => {
                format!("Time left: {}", format_countdown(*time_left_ms))
            }
            Presentation::Bonus { time_left_ms, .. } => {
                format!("Bonus time: {}", format_countdown(*time_left_ms))
            }
            Presentation::Blocked {
                remaining_ms,
                notice,
            } => {
                let headline =
                    format!("Take a break. Back in {}", format_countdown(*remaining_ms));
                match notice {
                    Some(message) => format!("{} ({})", headline, message),
                    None => headline,
                }
            }
            Presentation::Error { message, .. } => message.clone(),
        }
    }
}

fn percent(used_ms: i64, limit_ms: i64) -> u8 {
    if limit_ms <= 0 {
        return 100;
    }
    (used_ms.max(0).saturating_mul(100) / limit_ms).min(100) as u8
}

/// Format milliseconds as `M:SS`, rounding down to whole seconds.
pub fn format_countdown(ms: i64) -> String {
    let total_seconds = ms.max(0) / 1000;
    format!("{}:{:02}", total_seconds / 60, total_seconds % 60)
}

/// Host-side renderer
pub trait Presenter: Send + Sync {
    fn render(&self, view: &Presentation);
}

/// Presenter that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullPresenter;

impl Presenter for NullPresenter {
    fn render(&self, _view: &Presentation) {}
}
