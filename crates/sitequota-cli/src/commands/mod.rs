//! CLI commands module
//!
//! Contains all CLI command implementations.

pub mod ask;
pub mod page;
pub mod reset;
pub mod stats;

use std::sync::Arc;

use anyhow::Result;
use sitequota_core::db::{expand_path, Database};
use sitequota_core::services::{QuotaEngine, QuotaPolicy, SqliteStore, SystemClock};

use crate::output::OutputFormat;

/// Shared context for all commands
pub struct Context {
    pub engine: QuotaEngine,
    pub format: OutputFormat,
    pub quiet: bool,
}

impl Context {
    pub async fn build(
        db_path: Option<&str>,
        cooldown_minutes: Option<u32>,
        format: OutputFormat,
        quiet: bool,
    ) -> Result<Self> {
        let db = match db_path {
            Some(path) => Database::open(expand_path(path)?).await?,
            None => Database::new().await?,
        };

        let policy = match cooldown_minutes {
            Some(minutes) => QuotaPolicy::with_cooldown_minutes(minutes),
            None => QuotaPolicy::default(),
        };
        log::debug!("[cli] Using policy {:?}", policy);

        let engine = QuotaEngine::new(
            Arc::new(SqliteStore::from_database(&db)),
            Arc::new(SystemClock),
            policy,
        );

        Ok(Self {
            engine,
            format,
            quiet,
        })
    }
}
