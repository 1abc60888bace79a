//! Page commands
//!
//! The CLI acting as a page on the tracked site: activation, backgrounding,
//! a visible session with live ticks, and a status readout.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use sitequota_core::services::clock::Clock;
use sitequota_core::services::quota::{
    spawn_rollover_watch, AccessState, Presentation, Presenter, Resolution, VisibilityDriver,
};
use tabled::Tabled;

use super::Context;
use crate::output::{
    countdown_cell, print_error, print_info, print_single, styled_headline, OutputFormat,
};

/// Status row for table display
#[derive(Debug, Serialize, Tabled)]
pub struct StatusRow {
    #[tabled(rename = "State")]
    pub state: String,
    #[tabled(rename = "Used")]
    pub used: String,
    #[tabled(rename = "Left today")]
    pub left: String,
    #[tabled(rename = "Countdown")]
    pub countdown: String,
    #[tabled(rename = "Notice")]
    pub notice: String,
    #[tabled(skip)]
    pub usage_ms: i64,
    #[tabled(skip)]
    pub cooldown_until: Option<i64>,
    #[tabled(skip)]
    pub bonus_deadline: Option<i64>,
}

impl StatusRow {
    fn new(resolution: &Resolution, now_ms: i64) -> Self {
        Self {
            state: resolution.state.to_string(),
            used: countdown_cell(Some(resolution.usage_ms)),
            left: countdown_cell(Some(resolution.allowance_left_ms())),
            countdown: countdown_cell(resolution.remaining_ms(now_ms)),
            notice: resolution
                .notice
                .map(|n| n.message().to_string())
                .unwrap_or_default(),
            usage_ms: resolution.usage_ms,
            cooldown_until: resolution.cooldown_until,
            bonus_deadline: resolution.bonus_deadline,
        }
    }
}

fn report(ctx: &Context, resolution: &Resolution) -> Result<()> {
    let now = ctx.engine.clock().now_ms();
    print_single(&StatusRow::new(resolution, now), ctx.format)?;
    if ctx.format == OutputFormat::Table {
        let view = Presentation::from_resolution(resolution, now);
        print_info(&styled_headline(&view).to_string(), ctx.quiet);
    }
    Ok(())
}

pub async fn status(ctx: &Context) -> Result<()> {
    let resolution = ctx.engine.resolve().await;
    report(ctx, &resolution)
}

pub async fn open(ctx: &Context) -> Result<()> {
    let resolution = ctx.engine.activate().await;
    report(ctx, &resolution)
}

pub async fn hide(ctx: &Context) -> Result<()> {
    let driver = VisibilityDriver::new(ctx.engine.clone(), Arc::new(TerminalPresenter::new(true)));
    let resolution = driver.on_hidden().await;
    report(ctx, &resolution)
}

pub async fn watch(ctx: &Context, seconds: Option<u64>) -> Result<()> {
    let presenter = Arc::new(TerminalPresenter::new(
        ctx.quiet || ctx.format == OutputFormat::Json,
    ));
    let driver = VisibilityDriver::new(ctx.engine.clone(), presenter);
    let rollover = spawn_rollover_watch(ctx.engine.clone());

    log::info!("[cli] Watching as context {}", driver.context_id());
    let first = driver.on_visible().await;
    if first.state == AccessState::Cooldown {
        print_info("Site is blocked, counting down.", ctx.quiet);
    }

    let limit = async {
        match seconds {
            Some(s) => tokio::time::sleep(Duration::from_secs(s)).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = limit => {}
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                print_error(&format!("Failed to listen for Ctrl-C: {}", e));
            }
        }
    }

    rollover.cancel().await;
    let resolution = driver.on_hidden().await;
    if !(ctx.quiet || ctx.format == OutputFormat::Json) {
        println!();
    }
    report(ctx, &resolution)
}

/// Renders views on a single, continuously rewritten terminal line
pub struct TerminalPresenter {
    silent: bool,
}

impl TerminalPresenter {
    pub fn new(silent: bool) -> Self {
        Self { silent }
    }
}

impl Presenter for TerminalPresenter {
    fn render(&self, view: &Presentation) {
        if self.silent {
            return;
        }
        let mut stdout = std::io::stdout();
        let _ = write!(stdout, "\r\x1b[2K{}", styled_headline(view));
        let _ = stdout.flush();
    }
}
