//! Site quota module
//!
//! Daily time allowance for one tracked site: usage accrues while a page is
//! in the foreground, exhausting the allowance starts a cooldown, and every
//! cooldown after exhaustion is followed by a short bonus window that ends in
//! another cooldown. Counters roll over on the first observation of a new
//! local calendar date.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │ VisibilityDriver (one per hosting context)              │
//! │   - on_visible() / on_hidden()                          │
//! │   - TickHandle: usage tick or countdown tick            │
//! └─────────────────────────────────────────────────────────┘
//!          │                 │                    │
//!          ▼                 ▼                    ▼
//! ┌────────────────┐ ┌────────────────┐ ┌────────────────────┐
//! │ QuotaEngine    │ │ SessionTracker │ │ trait Presenter    │
//! │  resolve()     │ │  start/flush   │ │  render(view)      │
//! │  activate()    │ └────────────────┘ └────────────────────┘
//! └────────────────┘         │
//!          │  EventLogger    │
//!          ▼                 ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │ SafeStore -> trait KeyValueStore                        │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use sitequota_core::services::clock::SystemClock;
//! use sitequota_core::services::quota::{QuotaEngine, QuotaPolicy, VisibilityDriver, NullPresenter};
//! use sitequota_core::services::store::MemoryStore;
//!
//! let engine = QuotaEngine::new(
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(SystemClock),
//!     QuotaPolicy::default(),
//! );
//! let driver = VisibilityDriver::new(engine, Arc::new(NullPresenter));
//!
//! let resolution = driver.on_visible().await;
//! // ...
//! driver.on_hidden().await;
//! ```

pub mod driver;
pub mod engine;
pub mod events;
pub mod presentation;
pub mod record;
pub mod tracker;
pub mod types;

// Re-export main types
pub use types::{
    AccessState, Notice, QuotaPolicy, Resolution, BONUS_VISIT_LIMIT_MS,
    COOLDOWN_PERIOD_LONG_MS, COOLDOWN_PERIOD_SHORT_MS, DAILY_LIMIT_MS, TICK_INTERVAL_MS,
    USAGE_LOG_CAPACITY,
};
pub use record::{QuotaRecord, StorageKeys};
pub use events::{EventLogger, UsageEvent, UsageEventType};
pub use tracker::{AccrualOutcome, FlushMode, SessionTracker};

// Re-export the state machine
pub use engine::{resolve_record, QuotaEngine, QuotaStats, ResolveOptions, Transition};

// Re-export hosting glue
pub use driver::{spawn_rollover_watch, TickHandle, VisibilityDriver};
pub use presentation::{format_countdown, NullPresenter, Presentation, Presenter, Urgency};
