//! SiteQuota CLI - daily time allowance for a distracting site
//!
//! A terminal host for the quota engine: it plays the page (open, hide,
//! watch with a live countdown) and the popup (status, stats, usage log).

mod commands;
mod output;

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "sitequota")]
#[command(author, version, about = "Daily time allowance for a distracting site", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format: table (default) or json
    #[arg(long, global = true, default_value = "table")]
    format: output::OutputFormat,

    /// Suppress progress messages
    #[arg(long, short, global = true)]
    quiet: bool,

    /// Override database path (or set SITEQUOTA_DB_PATH env var)
    #[arg(long, env = "SITEQUOTA_DB_PATH", global = true)]
    db: Option<String>,

    /// Cooldown length in minutes (defaults to 10)
    #[arg(long, env = "SITEQUOTA_COOLDOWN_MINUTES", global = true)]
    cooldown_minutes: Option<u32>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Activate the page once: count the visit and apply due transitions
    Open,

    /// Send the page to the background: close accrual, end a bonus visit
    Hide,

    /// Show the current access state
    Status,

    /// Keep the page visible with a live countdown until Ctrl-C
    Watch {
        /// Stop after this many seconds
        #[arg(long)]
        seconds: Option<u64>,
    },

    /// Show aggregated quota stats
    Stats,

    /// Show the usage event log
    Log {
        /// Number of most recent entries to show
        #[arg(long, short, default_value = "20")]
        limit: usize,
    },

    /// Zero today's counters
    Reset,

    /// Ask the assistant
    Ask {
        /// Message text
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,
    },
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_millis()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    // Create context for commands
    let ctx = commands::Context::build(
        cli.db.as_deref(),
        cli.cooldown_minutes,
        cli.format,
        cli.quiet,
    )
    .await?;

    // Execute command
    match cli.command {
        Commands::Open => commands::page::open(&ctx).await,
        Commands::Hide => commands::page::hide(&ctx).await,
        Commands::Status => commands::page::status(&ctx).await,
        Commands::Watch { seconds } => commands::page::watch(&ctx, seconds).await,
        Commands::Stats => commands::stats::stats(&ctx).await,
        Commands::Log { limit } => commands::stats::usage_log(&ctx, limit).await,
        Commands::Reset => commands::reset::execute(&ctx).await,
        Commands::Ask { text } => commands::ask::execute(&ctx, text.join(" ")).await,
    }
}
