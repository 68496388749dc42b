//! Asynchronous batch job runner.
//!
//! [`BatchJobRunner::submit`] returns a [`SyncJob`] in the `Running` state
//! immediately and writes the records to the target on a bounded worker
//! pool. Each record is written idempotently: the target is searched by
//! natural key first and the record is updated if it already exists, created
//! otherwise.
//!
//! Records that share a natural key value are written one after another, in
//! submission order, by a single worker. A runner-wide per-key lock also keeps
//! a job that outlived its wait from racing the next job on the same key.
//!
//! The runner keeps a job in its active registry only while it runs. Callers
//! keep a [`JobSnapshot`] once the job is terminal.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, OwnedMutexGuard, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connector::TargetConnector;
use crate::errors::{ConnectorError, JobError};
use crate::models::{Fields, JobItem, JobSnapshot, JobStatus, MappedRecord, RecordOutcome, WriteAction};

// ---------------------------------------------------------------------------
// Job handle
// ---------------------------------------------------------------------------

struct JobState {
    items: Vec<JobItem>,
    status: JobStatus,
    finished_at: Option<chrono::DateTime<Utc>>,
}

struct JobInner {
    id: String,
    submitted_at: chrono::DateTime<Utc>,
    state: Mutex<JobState>,
    status_tx: watch::Sender<JobStatus>,
}

/// Shared handle to one batch execution.
#[derive(Clone)]
pub struct SyncJob {
    inner: Arc<JobInner>,
}

impl SyncJob {
    fn new(records: &[MappedRecord]) -> Self {
        let items = records
            .iter()
            .map(|r| JobItem {
                source_id: r.source_id.clone(),
                outcome: RecordOutcome::Pending,
            })
            .collect();
        let (status_tx, _) = watch::channel(JobStatus::Running);
        Self {
            inner: Arc::new(JobInner {
                id: Uuid::new_v4().to_string(),
                submitted_at: Utc::now(),
                state: Mutex::new(JobState {
                    items,
                    status: JobStatus::Running,
                    finished_at: None,
                }),
                status_tx,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn status(&self) -> JobStatus {
        self.state().status
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn snapshot(&self) -> JobSnapshot {
        let state = self.state();
        JobSnapshot {
            job_id: self.inner.id.clone(),
            status: state.status,
            items: state.items.clone(),
            submitted_at: self.inner.submitted_at,
            finished_at: state.finished_at,
        }
    }

    /// Resolve once the job is terminal, however long that takes.
    pub async fn terminated(&self) -> JobStatus {
        let mut rx = self.subscribe();
        loop {
            let status = self.status();
            if status.is_terminal() || rx.changed().await.is_err() {
                return self.status();
            }
        }
    }

    fn subscribe(&self) -> watch::Receiver<JobStatus> {
        self.inner.status_tx.subscribe()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, JobState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn resolve(&self, index: usize, outcome: RecordOutcome) {
        if let Some(item) = self.state().items.get_mut(index) {
            item.outcome = outcome;
        }
    }

    /// Close the job: anything still pending failed, then derive the
    /// overall status and publish it.
    fn finish(&self) -> JobStatus {
        let status = {
            let mut state = self.state();
            for item in state.items.iter_mut().filter(|i| !i.outcome.is_resolved()) {
                item.outcome = RecordOutcome::Failed {
                    error: "worker terminated before writing the record".into(),
                    transient: true,
                };
            }
            let any_success = state.items.iter().any(|i| i.outcome.is_success());
            state.status = if state.items.is_empty() || any_success {
                JobStatus::Succeeded
            } else {
                JobStatus::Failed
            };
            state.finished_at = Some(Utc::now());
            state.status
        };
        self.inner.status_tx.send_replace(status);
        status
    }
}

impl std::fmt::Debug for SyncJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncJob")
            .field("id", &self.inner.id)
            .field("status", &self.status())
            .finish()
    }
}

/// Stand-in deadline for timeouts too large to add to the clock.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Executes batches of mapped records against a [`TargetConnector`].
pub struct BatchJobRunner {
    target: Arc<dyn TargetConnector>,
    natural_key: String,
    workers: Arc<Semaphore>,
    active: Arc<Mutex<HashMap<String, SyncJob>>>,
    key_locks: Arc<KeyLocks>,
}

impl BatchJobRunner {
    /// `workers` bounds how many records are written concurrently across all
    /// jobs of this runner.
    pub fn new(target: Arc<dyn TargetConnector>, natural_key: &str, workers: usize) -> Self {
        Self {
            target,
            natural_key: natural_key.to_string(),
            workers: Arc::new(Semaphore::new(workers.max(1))),
            active: Arc::new(Mutex::new(HashMap::new())),
            key_locks: Arc::new(KeyLocks::default()),
        }
    }

    /// Start a job and return without waiting for it.
    pub fn submit(&self, records: Vec<MappedRecord>) -> SyncJob {
        let job = SyncJob::new(&records);
        info!(job_id = job.id(), records = records.len(), "submitted batch job");

        if records.is_empty() {
            job.finish();
            return job;
        }

        lock(&self.active).insert(job.id().to_string(), job.clone());

        let target = self.target.clone();
        let natural_key = self.natural_key.clone();
        let workers = self.workers.clone();
        let active = self.active.clone();
        let key_locks = self.key_locks.clone();
        let driver_job = job.clone();

        tokio::spawn(async move {
            let job = driver_job;
            let mut set = JoinSet::new();

            for group in group_by_key(records, &natural_key) {
                let permit = match workers.clone().acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => {
                        warn!(job_id = job.id(), "worker pool closed, abandoning remaining records");
                        break;
                    }
                };
                let target = target.clone();
                let natural_key = natural_key.clone();
                let key_locks = key_locks.clone();
                let job = job.clone();
                set.spawn(async move {
                    let _permit = permit;
                    for (index, record) in group {
                        let _key = match record.fields.get(&natural_key) {
                            Some(value) => Some(key_locks.acquire(&value.to_string()).await),
                            None => None,
                        };
                        let outcome = write_record(target.as_ref(), &natural_key, &record.fields).await;
                        debug!(
                            job_id = job.id(),
                            source_id = %record.source_id,
                            outcome = outcome.label(),
                            "record processed"
                        );
                        job.resolve(index, outcome);
                    }
                });
            }

            while let Some(joined) = set.join_next().await {
                if let Err(e) = joined {
                    warn!(job_id = job.id(), error = %e, "batch worker task failed");
                }
            }

            lock(&active).remove(job.id());
            let status = job.finish();
            let snapshot = job.snapshot();
            info!(
                job_id = job.id(),
                status = %status,
                succeeded = snapshot.succeeded_count(),
                failed = snapshot.failed_count(),
                "batch job finished"
            );
        });

        job
    }

    /// Wait until `job` is terminal or `timeout` elapses.
    ///
    /// The wait is driven by status-change notifications; `poll_interval`
    /// only paces progress logging. On timeout the job keeps running.
    pub async fn await_termination(
        &self,
        job: &SyncJob,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<JobStatus, JobError> {
        let now = Instant::now();
        let deadline = now.checked_add(timeout).unwrap_or(now + FAR_FUTURE);
        let mut rx = job.subscribe();
        let mut progress = tokio::time::interval(poll_interval.max(Duration::from_millis(1)));
        progress.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let status = job.status();
            if status.is_terminal() {
                return Ok(status);
            }

            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Ok(job.status());
                    }
                }
                _ = progress.tick() => {
                    let snap = job.snapshot();
                    debug!(
                        job_id = job.id(),
                        resolved = snap.items.iter().filter(|i| i.outcome.is_resolved()).count(),
                        total = snap.items.len(),
                        "waiting for batch job"
                    );
                }
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(job_id = job.id(), timeout_ms = timeout.as_millis() as u64, "batch job wait timed out");
                    return Err(JobError::Timeout {
                        job_id: job.id().to_string(),
                        waited_ms: timeout.as_millis() as u64,
                    });
                }
            }
        }
    }

    /// True iff the job SUCCEEDED and every record outcome succeeded.
    pub fn is_successful(&self, job: &SyncJob) -> bool {
        job.snapshot().is_successful()
    }

    /// Status of a job still held by the runner.
    pub fn job_status(&self, job_id: &str) -> Option<JobStatus> {
        lock(&self.active).get(job_id).map(SyncJob::status)
    }

    pub fn active_jobs(&self) -> Vec<String> {
        lock(&self.active).keys().cloned().collect()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Split a batch into write groups, keeping each record's index. Records
/// with the same natural key value share a group, in submission order.
fn group_by_key(records: Vec<MappedRecord>, natural_key: &str) -> Vec<Vec<(usize, MappedRecord)>> {
    let mut groups: Vec<Vec<(usize, MappedRecord)>> = Vec::new();
    let mut by_key: HashMap<String, usize> = HashMap::new();
    for (index, record) in records.into_iter().enumerate() {
        let key = record.fields.get(natural_key).map(|v| v.to_string());
        match key {
            Some(key) => match by_key.get(&key) {
                Some(&g) => groups[g].push((index, record)),
                None => {
                    by_key.insert(key, groups.len());
                    groups.push(vec![(index, record)]);
                }
            },
            None => groups.push(vec![(index, record)]),
        }
    }
    groups
}

/// Per-key async locks. Entries are dropped once nobody holds them.
#[derive(Default)]
struct KeyLocks {
    locks: Mutex<HashMap<String, Weak<tokio::sync::Mutex<()>>>>,
}

impl KeyLocks {
    async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let entry = {
            let mut locks = lock(&self.locks);
            locks.retain(|_, w| w.strong_count() > 0);
            match locks.get(key).and_then(Weak::upgrade) {
                Some(existing) => existing,
                None => {
                    let fresh = Arc::new(tokio::sync::Mutex::new(()));
                    locks.insert(key.to_string(), Arc::downgrade(&fresh));
                    fresh
                }
            }
        };
        entry.lock_owned().await
    }
}

/// Upsert one record by natural key.
async fn write_record(target: &dyn TargetConnector, natural_key: &str, fields: &Fields) -> RecordOutcome {
    let existing = match fields.get(natural_key) {
        Some(key) => target.find_by_key(natural_key, &key.to_string()).await,
        None => Ok(None),
    };

    let result = match existing {
        Ok(Some(record)) => target
            .update(&record.id, fields)
            .await
            .map(|()| (record.id, WriteAction::Updated)),
        Ok(None) => target
            .create(fields)
            .await
            .map(|id| (id, WriteAction::Created)),
        Err(e) => Err(e),
    };

    match result {
        Ok((target_id, action)) => RecordOutcome::Succeeded { target_id, action },
        Err(e) => failed(e),
    }
}

fn failed(e: ConnectorError) -> RecordOutcome {
    RecordOutcome::Failed {
        transient: e.is_transient(),
        error: e.to_string(),
    }
}
