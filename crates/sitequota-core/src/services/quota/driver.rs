//! Page-visibility driver
//!
//! Connects foreground/background signals of one hosting context to the
//! engine, the tracker and a [`Presenter`]. While the context is visible a
//! recurring tick runs, owned by an explicit [`TickHandle`]; arming a new tick
//! always cancels the previous one first.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::engine::QuotaEngine;
use super::presentation::{Presentation, Presenter};
use super::tracker::{FlushMode, SessionTracker};
use super::types::{AccessState, Notice, Resolution};

// ============================================================================
// Tick Handle
// ============================================================================

/// Whether a recurring task wants to keep running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickControl {
    Continue,
    Stop,
}

/// Body of a recurring task
#[async_trait]
pub trait Tick: Send + 'static {
    async fn tick(&mut self) -> TickControl;
}

/// Owner of a spawned recurring task
///
/// Dropping the handle signals the task to stop; [`TickHandle::cancel`]
/// additionally waits until it has.
pub struct TickHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl TickHandle {
    /// Run `body` every `interval` until cancelled or it returns `Stop`.
    pub fn spawn<T: Tick>(name: &'static str, interval: Duration, mut body: T) -> Self {
        let (tx, mut rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            log::debug!("[quota:driver] {} loop started", name);
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = &mut rx => {
                        log::debug!("[quota:driver] {} received shutdown signal", name);
                        break;
                    }
                }

                if body.tick().await == TickControl::Stop {
                    log::debug!("[quota:driver] {} stopped itself", name);
                    break;
                }
            }
        });

        Self {
            shutdown_tx: Some(tx),
            task: Some(task),
        }
    }

    /// Stop the task and wait for an in-flight tick to finish.
    pub async fn cancel(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::warn!("[quota:driver] Tick task ended abnormally: {}", e);
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |task| task.is_finished())
    }
}

impl Drop for TickHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

// ============================================================================
// Visible Tick
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TickMode {
    /// Accruing: flush, re-resolve, re-render
    Usage,
    /// Blocked: count down locally, re-activate at the deadline
    Countdown { until: i64 },
}

struct VisibleTick {
    engine: QuotaEngine,
    tracker: SessionTracker,
    presenter: Arc<dyn Presenter>,
    mode: TickMode,
}

impl VisibleTick {
    fn render(&self, resolution: &Resolution) {
        let now = self.engine.clock().now_ms();
        self.presenter
            .render(&Presentation::from_resolution(resolution, now));
    }

    /// Pick the next mode after a resolve, or stop.
    fn follow(&mut self, resolution: &Resolution) -> TickControl {
        if resolution.notice == Some(Notice::ContextInvalidated) {
            return TickControl::Stop;
        }
        self.mode = match resolution.state {
            AccessState::Cooldown => TickMode::Countdown {
                until: resolution
                    .cooldown_until
                    .unwrap_or_else(|| self.engine.clock().now_ms()),
            },
            AccessState::Normal | AccessState::Bonus => TickMode::Usage,
        };
        TickControl::Continue
    }
}

#[async_trait]
impl Tick for VisibleTick {
    async fn tick(&mut self) -> TickControl {
        match self.mode {
            TickMode::Usage => {
                self.tracker.flush_accrual(FlushMode::Continue).await;
                let resolution = self.engine.resolve().await;
                self.render(&resolution);
                if resolution.state == AccessState::Cooldown {
                    log::info!("[quota:driver] Blocked, switching to countdown");
                }
                self.follow(&resolution)
            }
            TickMode::Countdown { until } => {
                let now = self.engine.clock().now_ms();
                if now < until {
                    self.presenter.render(&Presentation::Blocked {
                        remaining_ms: until - now,
                        notice: None,
                    });
                    return TickControl::Continue;
                }

                // Same as a fresh page load once the cooldown is over
                let resolution = self.engine.activate().await;
                if resolution.state.permits_access() {
                    self.tracker.start_accrual().await;
                }
                self.render(&resolution);
                self.follow(&resolution)
            }
        }
    }
}

// ============================================================================
// Driver
// ============================================================================

/// Visibility driver for one hosting context
pub struct VisibilityDriver {
    engine: QuotaEngine,
    tracker: SessionTracker,
    presenter: Arc<dyn Presenter>,
    context_id: Uuid,
    tick: Mutex<Option<TickHandle>>,
}

impl VisibilityDriver {
    pub fn new(engine: QuotaEngine, presenter: Arc<dyn Presenter>) -> Self {
        let tracker = engine.tracker();
        Self {
            engine,
            tracker,
            presenter,
            context_id: Uuid::new_v4(),
            tick: Mutex::new(None),
        }
    }

    /// Identifier of this context in log lines
    pub fn context_id(&self) -> Uuid {
        self.context_id
    }

    pub fn engine(&self) -> &QuotaEngine {
        &self.engine
    }

    /// Whether a recurring tick is currently armed and alive
    pub async fn is_ticking(&self) -> bool {
        self.tick
            .lock()
            .await
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    async fn disarm(&self) {
        let previous = self.tick.lock().await.take();
        if let Some(handle) = previous {
            handle.cancel().await;
        }
    }

    async fn arm(&self, mode: TickMode) {
        self.disarm().await;
        let interval = Duration::from_millis(self.engine.policy().tick_interval_ms.max(1) as u64);
        let body = VisibleTick {
            engine: self.engine.clone(),
            tracker: self.tracker.clone(),
            presenter: self.presenter.clone(),
            mode,
        };
        *self.tick.lock().await = Some(TickHandle::spawn("visible tick", interval, body));
    }

    /// The context came to the foreground.
    pub async fn on_visible(&self) -> Resolution {
        self.disarm().await;

        let resolution = self.engine.activate().await;
        log::info!(
            "[quota:driver] Context {} visible in state {}",
            self.context_id,
            resolution.state
        );

        if resolution.state.permits_access() {
            self.tracker.start_accrual().await;
        }
        let now = self.engine.clock().now_ms();
        self.presenter
            .render(&Presentation::from_resolution(&resolution, now));

        if resolution.notice == Some(Notice::ContextInvalidated) {
            log::warn!("[quota:driver] Context invalidated, not arming tick");
            return resolution;
        }

        let mode = match resolution.state {
            AccessState::Cooldown => TickMode::Countdown {
                until: resolution.cooldown_until.unwrap_or(now),
            },
            AccessState::Normal | AccessState::Bonus => TickMode::Usage,
        };
        self.arm(mode).await;
        resolution
    }

    /// The context went to the background.
    ///
    /// Closes the accrual interval; an active bonus window is consumed.
    pub async fn on_hidden(&self) -> Resolution {
        self.disarm().await;
        self.tracker.flush_accrual(FlushMode::End).await;
        let resolution = self.engine.end_bonus_visit().await;
        log::info!(
            "[quota:driver] Context {} hidden in state {}",
            self.context_id,
            resolution.state
        );
        resolution
    }

    /// Cancel any armed tick without touching the store.
    pub async fn shutdown(&self) {
        self.disarm().await;
    }
}

// ============================================================================
// Rollover Watch
// ============================================================================

struct RolloverTick {
    engine: QuotaEngine,
}

#[async_trait]
impl Tick for RolloverTick {
    async fn tick(&mut self) -> TickControl {
        if self.engine.check_daily_rollover().await {
            log::info!("[quota:driver] Daily rollover applied by background check");
        }
        TickControl::Continue
    }
}

/// Periodically apply the daily rollover even when no context is visible.
pub fn spawn_rollover_watch(engine: QuotaEngine) -> TickHandle {
    let interval = Duration::from_millis(engine.policy().rollover_check_interval_ms.max(1) as u64);
    TickHandle::spawn("rollover watch", interval, RolloverTick { engine })
}

// ============================================================================
// Tests
// ============================================================================
