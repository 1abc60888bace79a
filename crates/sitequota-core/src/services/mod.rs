//! Services module

pub mod clock;
pub mod messaging;
pub mod quota;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use messaging::{is_tracked_site, MessageRouter, Request, Response};
pub use quota::{
    AccessState, EventLogger, Notice, Presentation, Presenter, QuotaEngine, QuotaPolicy,
    QuotaRecord, QuotaStats, Resolution, SessionTracker, UsageEvent, UsageEventType,
    VisibilityDriver,
};
pub use store::{KeyValueStore, MemoryStore, SafeStore, SqliteStore, StoreError};
