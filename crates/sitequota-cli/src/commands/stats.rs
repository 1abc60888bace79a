//! Stats commands
//!
//! Popup-style readouts: aggregated stats and the usage event log.

use anyhow::{anyhow, Result};
use serde::Serialize;
use sitequota_core::services::clock::from_millis;
use sitequota_core::services::quota::{QuotaStats, UsageEvent};
use sitequota_core::services::{MessageRouter, Request};
use tabled::Tabled;

use super::Context;
use crate::output::{countdown_cell, print_json, print_output, print_single, OutputFormat};

/// Stats row for table display
#[derive(Debug, Serialize, Tabled)]
pub struct StatsRow {
    #[tabled(rename = "Used today")]
    pub used: String,
    #[tabled(rename = "Visits after limit")]
    pub visits: u32,
    #[tabled(rename = "Limit reached")]
    pub limit_reached: bool,
    #[tabled(rename = "Cooldown until")]
    pub cooldown_until: String,
    #[tabled(rename = "Bonus active")]
    pub bonus_active: bool,
}

impl From<&QuotaStats> for StatsRow {
    fn from(stats: &QuotaStats) -> Self {
        Self {
            used: countdown_cell(Some(stats.daily_usage)),
            visits: stats.visit_count,
            limit_reached: stats.limit_reached,
            cooldown_until: stats
                .cooldown_until
                .map(|ms| from_millis(ms).format("%H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string()),
            bonus_active: stats.bonus_visit_active,
        }
    }
}

pub async fn stats(ctx: &Context) -> Result<()> {
    let router = MessageRouter::new(ctx.engine.clone());
    let response = router.handle(Request::GetQuotaStats).await;

    if ctx.format == OutputFormat::Json {
        return print_json(&response);
    }

    if !response.success {
        return Err(anyhow!(response
            .error
            .unwrap_or_else(|| "Failed to load stats".to_string())));
    }
    let stats: QuotaStats = serde_json::from_value(response.data.unwrap_or_default())?;
    print_single(&StatsRow::from(&stats), ctx.format)
}

/// Usage log row for table display
#[derive(Debug, Serialize, Tabled)]
pub struct LogRow {
    #[tabled(rename = "Time")]
    pub time: String,
    #[tabled(rename = "Event")]
    pub event: String,
    #[tabled(rename = "Details")]
    pub details: String,
}

impl From<&UsageEvent> for LogRow {
    fn from(event: &UsageEvent) -> Self {
        Self {
            time: from_millis(event.timestamp)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string(),
            event: event.event_type.to_string(),
            details: serde_json::Value::Object(event.payload.clone()).to_string(),
        }
    }
}

pub async fn usage_log(ctx: &Context, limit: usize) -> Result<()> {
    let entries = ctx.engine.logger().recent(limit).await;
    match ctx.format {
        OutputFormat::Json => print_json(&entries),
        OutputFormat::Table => {
            let rows: Vec<LogRow> = entries.iter().map(LogRow::from).collect();
            print_output(&rows, ctx.format)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sitequota_core::services::quota::UsageEventType;

    #[test]
    fn test_stats_row() {
        let stats = QuotaStats {
            daily_usage: 90_000,
            visit_count: 2,
            limit_reached: true,
            ..Default::default()
        };
        let row = StatsRow::from(&stats);
        assert_eq!(row.used, "1:30");
        assert_eq!(row.visits, 2);
        assert_eq!(row.cooldown_until, "-");
    }

    #[test]
    fn test_log_row_details() {
        let mut payload = serde_json::Map::new();
        payload.insert("cooldownDuration".to_string(), serde_json::json!(600_000));
        let event = UsageEvent::new(1_700_000_000_000, UsageEventType::CooldownStarted, payload);
        let row = LogRow::from(&event);
        assert_eq!(row.event, "cooldown_started");
        assert_eq!(row.details, r#"{"cooldownDuration":600000}"#);
    }
}
