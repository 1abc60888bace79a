//! # sitequota-core
//!
//! Core logic for SiteQuota - a daily time allowance for one distracting
//! site, shared between hosting contexts and the CLI.
//!
//! This crate provides:
//! - Database operations (`db` module)
//! - Durable key-value stores, the clock and the quota state machine
//!   (`services` module)
//! - Unified error handling (`error` module)

pub mod db;
pub mod error;
pub mod services;

// Re-exports for convenience
pub use db::Database;
pub use error::{Error, Result};

// Re-export commonly used types from services
pub use services::{
    is_tracked_site, AccessState, Clock, EventLogger, KeyValueStore, ManualClock, MemoryStore,
    MessageRouter, Notice, Presentation, Presenter, QuotaEngine, QuotaPolicy, QuotaRecord,
    QuotaStats, Request, Resolution, Response, SafeStore, SessionTracker, SqliteStore,
    StoreError, SystemClock, UsageEvent, UsageEventType, VisibilityDriver,
};
