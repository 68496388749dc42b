//! Fixed-frequency poller that drives sync cycles.
//!
//! After `start`, the first tick fires once the start delay has elapsed and
//! then every `interval`. A tick that arrives while a cycle is still running
//! is skipped rather than queued, so at most one cycle is in flight. Manual
//! triggers via [`Poller::run_once`] share the same single-flight lock and
//! wait for it instead of skipping.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{watch, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::errors::{SchedulerError, SyncError};
use crate::models::CycleReport;

/// Used in place of start delays too large to add to the clock.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// One unit of scheduled work.
#[async_trait]
pub trait SyncCycle: Send + Sync + 'static {
    async fn run_cycle(&self) -> Result<CycleReport, SyncError>;
}

/// Lifecycle of a [`Poller`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollerState {
    Stopped,
    /// Ticking, no cycle in flight.
    Scheduled,
    /// A cycle is executing.
    Running,
}

impl std::fmt::Display for PollerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Scheduled => write!(f, "scheduled"),
            Self::Running => write!(f, "running"),
        }
    }
}

/// Tracks aggregate statistics across cycles.
#[derive(Default)]
pub struct SchedulerStats {
    pub total_ticks: AtomicU64,
    pub total_cycles: AtomicU64,
    pub skipped_ticks: AtomicU64,
    pub total_errors: AtomicU64,
    pub consecutive_errors: AtomicU64,
}

/// Point-in-time copy of [`SchedulerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub total_ticks: u64,
    pub total_cycles: u64,
    pub skipped_ticks: u64,
    pub total_errors: u64,
    pub consecutive_errors: u64,
}

impl SchedulerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_ticks: self.total_ticks.load(Ordering::SeqCst),
            total_cycles: self.total_cycles.load(Ordering::SeqCst),
            skipped_ticks: self.skipped_ticks.load(Ordering::SeqCst),
            total_errors: self.total_errors.load(Ordering::SeqCst),
            consecutive_errors: self.consecutive_errors.load(Ordering::SeqCst),
        }
    }
}

struct Shared {
    cycle: Arc<dyn SyncCycle>,
    flight: Arc<tokio::sync::Mutex<()>>,
    in_flight: AtomicBool,
    stats: SchedulerStats,
}

struct Schedule {
    stop_tx: watch::Sender<bool>,
    ticker: JoinHandle<()>,
}

/// Periodic, non-overlapping cycle runner.
pub struct Poller {
    shared: Arc<Shared>,
    schedule: Mutex<Option<Schedule>>,
}

impl Poller {
    pub fn new(cycle: Arc<dyn SyncCycle>) -> Self {
        Self {
            shared: Arc::new(Shared {
                cycle,
                flight: Arc::new(tokio::sync::Mutex::new(())),
                in_flight: AtomicBool::new(false),
                stats: SchedulerStats::default(),
            }),
            schedule: Mutex::new(None),
        }
    }

    pub fn state(&self) -> PollerState {
        if self.shared.in_flight.load(Ordering::SeqCst) {
            PollerState::Running
        } else if self.lock_schedule().is_some() {
            PollerState::Scheduled
        } else {
            PollerState::Stopped
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Begin ticking. Must be called from within a Tokio runtime.
    pub fn start(&self, interval: Duration, start_delay: Duration) -> Result<(), SchedulerError> {
        if interval.is_zero() {
            return Err(SchedulerError::ZeroInterval);
        }

        let mut schedule = self.lock_schedule();
        if schedule.is_some() {
            return Err(SchedulerError::InvalidTransition {
                from: self.current_state_label(),
                operation: "start".into(),
            });
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let shared = self.shared.clone();
        let ticker = tokio::spawn(async move {
            let now = Instant::now();
            let first = now.checked_add(start_delay).unwrap_or(now + FAR_FUTURE);
            let mut ticks = time::interval_at(first, interval);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = ticks.tick() => on_tick(&shared),
                }
            }
        });

        info!(
            interval_ms = interval.as_millis() as u64,
            start_delay_ms = start_delay.as_millis() as u64,
            "poller started"
        );
        *schedule = Some(Schedule { stop_tx, ticker });
        Ok(())
    }

    /// Stop ticking. A cycle already in flight runs to completion.
    pub async fn stop(&self) {
        let schedule = self.lock_schedule().take();
        let Some(schedule) = schedule else {
            return;
        };
        schedule.stop_tx.send_replace(true);
        if let Err(e) = schedule.ticker.await {
            warn!(error = %e, "poller task ended abnormally");
        }
        info!("poller stopped");
    }

    /// Wait up to `grace` for an in-flight cycle to finish. Returns `false`
    /// if one is still running when the grace period ends.
    pub async fn drain(&self, grace: Duration) -> bool {
        match time::timeout(grace, self.shared.flight.lock()).await {
            Ok(_guard) => true,
            Err(_) => {
                warn!(grace_ms = grace.as_millis() as u64, "sync cycle still running after grace period");
                false
            }
        }
    }

    /// Run one cycle now, waiting for any in-flight cycle to finish first.
    pub async fn run_once(&self) -> Result<CycleReport, SyncError> {
        let guard = self.shared.flight.clone().lock_owned().await;
        execute(&self.shared, guard, "manual").await
    }

    fn current_state_label(&self) -> String {
        if self.shared.in_flight.load(Ordering::SeqCst) {
            PollerState::Running.to_string()
        } else {
            PollerState::Scheduled.to_string()
        }
    }

    fn lock_schedule(&self) -> std::sync::MutexGuard<'_, Option<Schedule>> {
        self.schedule.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn on_tick(shared: &Arc<Shared>) {
    shared.stats.total_ticks.fetch_add(1, Ordering::SeqCst);
    match shared.flight.clone().try_lock_owned() {
        Ok(guard) => {
            let shared = shared.clone();
            tokio::spawn(async move {
                // Outcome is logged and counted inside `execute`.
                let _ = execute(&shared, guard, "scheduled").await;
            });
        }
        Err(_) => {
            let skipped = shared.stats.skipped_ticks.fetch_add(1, Ordering::SeqCst) + 1;
            warn!(skipped, "skipping sync cycle: previous cycle still running");
        }
    }
}

async fn execute(
    shared: &Shared,
    _guard: OwnedMutexGuard<()>,
    trigger: &str,
) -> Result<CycleReport, SyncError> {
    shared.in_flight.store(true, Ordering::SeqCst);
    let _in_flight = InFlightGuard(&shared.in_flight);
    let cycle_num = shared.stats.total_cycles.fetch_add(1, Ordering::SeqCst) + 1;
    info!(cycle = cycle_num, trigger, "starting sync cycle");

    let result = shared.cycle.run_cycle().await;
    match &result {
        Ok(report) => {
            shared.stats.consecutive_errors.store(0, Ordering::SeqCst);
            info!(
                cycle = cycle_num,
                stream = %report.stream,
                status = %report.status,
                fetched = report.fetched,
                written = report.written(),
                "sync cycle completed"
            );
        }
        Err(e) => {
            let errors = shared.stats.total_errors.fetch_add(1, Ordering::SeqCst) + 1;
            let consecutive = shared.stats.consecutive_errors.fetch_add(1, Ordering::SeqCst) + 1;
            error!(
                cycle = cycle_num,
                error = %e,
                total_errors = errors,
                consecutive_errors = consecutive,
                "sync cycle failed"
            );
        }
    }

    result
}

/// Clears the in-flight flag on drop, including when a cycle panics.
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
