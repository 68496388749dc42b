//! Source-to-target synchronization engine.
//!
//! The [`SyncEngine`] runs one stream's sync cycle:
//!
//! 1. Read the stream watermark (or its default).
//! 2. Fetch every source record modified strictly after it, page by page.
//! 3. Map each record to the target schema. Unmappable records are reported
//!    and excluded from the batch.
//! 4. Submit the mapped records as one batch job and wait for it, bounded by
//!    the job timeout.
//! 5. Advance the watermark to the highest fetched `modified_at` only if the
//!    job was fully successful and no record failed mapping.
//!
//! A failed or timed-out cycle leaves the watermark in place, so the next
//! cycle re-fetches the same window. Target writes are upserts by natural key,
//! which makes that replay safe.
//!
//! A lock mechanism prevents concurrent cycles on the same engine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::batch::{BatchJobRunner, SyncJob};
use crate::config::AppConfig;
use crate::connector::{PageRequest, SourceConnector};
use crate::db::queries::SyncRunCompletion;
use crate::db::Database;
use crate::errors::{JobError, SyncError};
use crate::mapping::FieldMapping;
use crate::models::{CycleReport, CycleStatus, MappingFailure, Record};
use crate::scheduler::SyncCycle;
use crate::watermark::{Watermark, WatermarkStore};

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Per-stream knobs for the engine.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub stream: String,
    pub page_size: usize,
    pub job_timeout: Duration,
    pub await_poll_interval: Duration,
}

impl EngineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            stream: config.stream.id.clone(),
            page_size: config.batch.page_size,
            job_timeout: Duration::from_millis(config.batch.job_timeout_ms),
            await_poll_interval: Duration::from_millis(config.batch.await_poll_interval_ms),
        }
    }
}

/// Status summary for one stream.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub stream: String,
    pub watermark: DateTime<Utc>,
    pub watermark_persisted: bool,
    pub running: bool,
    pub active_jobs: Vec<String>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct SyncEngine {
    settings: EngineSettings,
    source: Arc<dyn SourceConnector>,
    mapping: FieldMapping,
    runner: Arc<BatchJobRunner>,
    watermarks: Arc<WatermarkStore>,
    db: Arc<Database>,
    running: Arc<AtomicBool>,
}

impl SyncEngine {
    pub fn new(
        settings: EngineSettings,
        source: Arc<dyn SourceConnector>,
        mapping: FieldMapping,
        runner: Arc<BatchJobRunner>,
        watermarks: Arc<WatermarkStore>,
        db: Arc<Database>,
    ) -> Self {
        info!(
            stream = %settings.stream,
            page_size = settings.page_size,
            job_timeout_ms = settings.job_timeout.as_millis() as u64,
            "sync engine created"
        );
        Self {
            settings,
            source,
            mapping,
            runner,
            watermarks,
            db,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn stream(&self) -> &str {
        &self.settings.stream
    }

    pub fn runner(&self) -> &Arc<BatchJobRunner> {
        &self.runner
    }

    pub fn watermarks(&self) -> &Arc<WatermarkStore> {
        &self.watermarks
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run a single sync cycle.
    ///
    /// Returns `Ok` with status `Failed` when records failed but the cycle
    /// itself completed; returns `Err` when the source could not be read, the
    /// job did not finish in time, or persistence failed. The watermark is
    /// left in place in both cases.
    pub async fn run_sync_cycle(&self) -> Result<CycleReport, SyncError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SyncError::AlreadyRunning {
                stream: self.settings.stream.clone(),
            });
        }

        let _guard = SyncLockGuard(self.running.clone());

        let started_at = Utc::now();
        let watermark = self.watermarks.get_or_init(&self.settings.stream)?;

        let run_id = match self
            .db
            .start_sync_run(&self.settings.stream, &watermark.to_rfc3339())
        {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(stream = %self.settings.stream, error = %e, "failed to record sync run start");
                None
            }
        };

        let result = self.do_sync_cycle(watermark, started_at).await;

        if let Some(run_id) = run_id {
            self.record_run(run_id, &result);
        }
        self.record_audit(&result);

        result
    }

    pub fn status(&self) -> Result<EngineStatus, SyncError> {
        let stream = &self.settings.stream;
        Ok(EngineStatus {
            stream: stream.clone(),
            watermark: self.watermarks.get(stream)?.timestamp(),
            watermark_persisted: self.watermarks.is_persisted(stream)?,
            running: self.is_running(),
            active_jobs: self.runner.active_jobs(),
        })
    }

    async fn do_sync_cycle(
        &self,
        watermark: Watermark,
        started_at: DateTime<Utc>,
    ) -> Result<CycleReport, SyncError> {
        let stream = &self.settings.stream;
        let changed = self.fetch_changed(watermark).await?;
        info!(stream = %stream, since = %watermark, fetched = changed.len(), "fetched changed records");

        let mut report = CycleReport {
            stream: stream.clone(),
            status: CycleStatus::NoChanges,
            watermark_before: watermark.timestamp(),
            watermark_after: None,
            fetched: changed.len(),
            mapping_failures: Vec::new(),
            job: None,
            started_at,
            completed_at: started_at,
        };

        let Some(high) = changed.iter().map(|r| r.modified_at).max() else {
            report.completed_at = Utc::now();
            return Ok(report);
        };

        let mut mapped = Vec::with_capacity(changed.len());
        for record in &changed {
            match self.mapping.map(record) {
                Ok(m) => mapped.push(m),
                Err(e) => {
                    warn!(stream = %stream, source_id = %record.id, error = %e, "record failed mapping");
                    report.mapping_failures.push(MappingFailure {
                        source_id: record.id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        let job_successful = if mapped.is_empty() {
            false
        } else {
            let job = self.runner.submit(mapped);
            if let Err(e) = self
                .runner
                .await_termination(&job, self.settings.job_timeout, self.settings.await_poll_interval)
                .await
            {
                self.watch_late_completion(job);
                return Err(e.into());
            }
            let ok = self.runner.is_successful(&job);
            report.job = Some(job.snapshot());
            ok
        };

        if job_successful && report.mapping_failures.is_empty() {
            let advanced = self.watermarks.advance(stream, Watermark::new(high))?;
            report.watermark_after = Some(advanced.timestamp());
            report.status = CycleStatus::Succeeded;
        } else {
            report.status = CycleStatus::Failed;
            warn!(
                stream = %stream,
                unmapped = report.mapping_failures.len(),
                failed_writes = report.job.as_ref().map(|j| j.failed_count()).unwrap_or(0),
                "cycle incomplete; watermark not advanced"
            );
        }

        report.completed_at = Utc::now();
        Ok(report)
    }

    /// Drain the source listing for everything after `since`.
    async fn fetch_changed(&self, since: Watermark) -> Result<Vec<Record>, SyncError> {
        let mut changed = Vec::new();
        let mut request = PageRequest::first(self.settings.page_size.max(1));
        loop {
            let page = self.source.list_changed_since(since, request).await?;
            let count = page.records.len();
            debug!(offset = request.offset, count, has_more = page.has_more, "fetched page");
            changed.extend(page.records);
            if !page.has_more || count == 0 {
                break;
            }
            request = request.next();
        }
        Ok(changed)
    }

    /// Keep an eye on a job whose wait timed out, so its eventual outcome
    /// still shows up in the logs.
    fn watch_late_completion(&self, job: SyncJob) {
        let stream = self.settings.stream.clone();
        tokio::spawn(async move {
            let status = job.terminated().await;
            let snap = job.snapshot();
            warn!(
                stream = %stream,
                job_id = job.id(),
                status = %status,
                succeeded = snap.succeeded_count(),
                failed = snap.failed_count(),
                "batch job finished after its wait timed out; next cycle will replay it"
            );
        });
    }

    fn record_run(&self, run_id: i64, result: &Result<CycleReport, SyncError>) {
        let outcome = match result {
            Ok(report) => {
                let watermark_to = report.watermark_after.map(|w| Watermark::new(w).to_rfc3339());
                let failed = report.mapping_failures.len()
                    + report.job.as_ref().map(|j| j.failed_count()).unwrap_or(0);
                let status = report.status.to_string();
                let done = SyncRunCompletion {
                    status: &status,
                    watermark_to: watermark_to.as_deref(),
                    fetched: report.fetched,
                    written: report.written(),
                    failed,
                    job_id: report.job.as_ref().map(|j| j.job_id.as_str()),
                    details: None,
                };
                self.db.complete_sync_run(run_id, &done).and_then(|()| {
                    let items = report.job.as_ref().map(|j| j.items.as_slice()).unwrap_or(&[]);
                    self.db
                        .insert_record_outcomes(run_id, items, &report.mapping_failures)
                })
            }
            Err(e) => {
                let (status, job_id) = match e {
                    SyncError::Job(JobError::Timeout { job_id, .. }) => ("timed_out", Some(job_id.as_str())),
                    _ => ("error", None),
                };
                let details = e.to_string();
                let done = SyncRunCompletion {
                    status,
                    job_id,
                    details: Some(&details),
                    ..Default::default()
                };
                self.db.complete_sync_run(run_id, &done)
            }
        };
        if let Err(e) = outcome {
            warn!(run_id, error = %e, "failed to record sync run");
        }
    }

    fn record_audit(&self, result: &Result<CycleReport, SyncError>) {
        let (details, success) = match result {
            Ok(r) => (
                format!(
                    "status: {}, fetched: {}, written: {}, unmapped: {}",
                    r.status,
                    r.fetched,
                    r.written(),
                    r.mapping_failures.len()
                ),
                r.status != CycleStatus::Failed,
            ),
            Err(e) => (format!("sync failed: {}", e), false),
        };
        if let Err(e) = self.db.insert_audit_log(
            "sync_cycle",
            Some(&self.settings.stream),
            Some(&details),
            success,
        ) {
            warn!(error = %e, "failed to write audit log");
        }
    }
}

#[async_trait]
impl SyncCycle for SyncEngine {
    async fn run_cycle(&self) -> Result<CycleReport, SyncError> {
        self.run_sync_cycle().await
    }
}

// ---------------------------------------------------------------------------
// Sync lock RAII guard
// ---------------------------------------------------------------------------

/// Drop guard that resets the `running` flag to `false`.
struct SyncLockGuard(Arc<AtomicBool>);

impl Drop for SyncLockGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::memory::InMemoryCrm;
    use crate::connector::TargetConnector;
    use crate::models::{FieldValue, Fields, JobStatus};
    use crate::watermark::WatermarkDefault;

    struct Fixture {
        source: Arc<InMemoryCrm>,
        target: Arc<InMemoryCrm>,
        db: Arc<Database>,
        engine: Arc<SyncEngine>,
    }

    fn fixture(job_timeout: Duration) -> Fixture {
        fixture_with_default(
            job_timeout,
            WatermarkDefault::NowMinus(chrono::Duration::seconds(100)),
        )
    }

    fn fixture_with_default(job_timeout: Duration, default: WatermarkDefault) -> Fixture {
        let source = Arc::new(InMemoryCrm::new("sfdc"));
        let target = Arc::new(InMemoryCrm::new("dynamics"));
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        let db = Arc::new(db);
        let watermarks = Arc::new(WatermarkStore::new(db.clone(), default));
        let runner = Arc::new(BatchJobRunner::new(target.clone(), "lastname", 4));
        let settings = EngineSettings {
            stream: "contacts".into(),
            page_size: 2,
            job_timeout,
            await_poll_interval: Duration::from_millis(10),
        };
        let engine = Arc::new(SyncEngine::new(
            settings,
            source.clone(),
            FieldMapping::contacts(),
            runner,
            watermarks,
            db.clone(),
        ));
        Fixture {
            source,
            target,
            db,
            engine,
        }
    }

    fn contact(last: &str) -> Fields {
        let mut f = Fields::new();
        f.insert("LastName".into(), FieldValue::from(last));
        f.insert("Email".into(), FieldValue::from(format!("{last}@example.com")));
        f.insert("Phone".into(), FieldValue::from("1234567"));
        f
    }

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_no_changes_leaves_watermark_alone() {
        let fx = fixture(TIMEOUT);
        let report = fx.engine.run_sync_cycle().await.unwrap();
        assert_eq!(report.status, CycleStatus::NoChanges);
        assert!(report.job.is_none());
        assert!(!fx.engine.watermarks().is_persisted("contacts").unwrap());
        assert_eq!(fx.target.write_count(), 0);
    }

    #[tokio::test]
    async fn test_changes_are_written_and_watermark_advances() {
        let fx = fixture(TIMEOUT);
        let mut last = None;
        for name in ["Alpha", "Bravo", "Charlie"] {
            last = Some(fx.source.insert(contact(name)));
        }
        let newest = last.unwrap().modified_at;

        let report = fx.engine.run_sync_cycle().await.unwrap();
        assert_eq!(report.status, CycleStatus::Succeeded);
        assert_eq!(report.fetched, 3);
        assert_eq!(report.written(), 3);
        assert_eq!(report.watermark_after, Some(newest));
        assert_eq!(fx.engine.watermarks().get("contacts").unwrap().timestamp(), newest);

        let written = fx.target.find_by_key("lastname", "Bravo").await.unwrap().unwrap();
        assert_eq!(written.text("emailaddress1"), Some("Bravo@example.com"));
        assert_eq!(written.text("telephone1"), Some("1234567"));

        let runs = fx.db.list_sync_runs("contacts", 10).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, "succeeded");
        assert_eq!(runs[0].written, 3);
        assert_eq!(fx.db.list_record_outcomes(runs[0].id).unwrap().len(), 3);
        assert_eq!(fx.db.count_errors().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_rerun_writes_nothing() {
        let fx = fixture(TIMEOUT);
        fx.source.insert(contact("Alpha"));
        fx.engine.run_sync_cycle().await.unwrap();
        let writes = fx.target.write_count();

        let report = fx.engine.run_sync_cycle().await.unwrap();
        assert_eq!(report.status, CycleStatus::NoChanges);
        assert_eq!(fx.target.write_count(), writes);
    }

    #[tokio::test]
    async fn test_mapping_failure_holds_watermark() {
        let fx = fixture(TIMEOUT);
        fx.source.insert(contact("Alpha"));
        let mut nameless = contact("x");
        nameless.remove("LastName");
        let bad = fx.source.insert(nameless);

        let report = fx.engine.run_sync_cycle().await.unwrap();
        assert_eq!(report.status, CycleStatus::Failed);
        assert_eq!(report.mapping_failures.len(), 1);
        assert_eq!(report.mapping_failures[0].source_id, bad.id);
        assert_eq!(report.written(), 1);
        assert!(report.watermark_after.is_none());
        assert!(!fx.engine.watermarks().is_persisted("contacts").unwrap());

        let runs = fx.db.list_sync_runs("contacts", 10).unwrap();
        let outcomes = fx.db.list_record_outcomes(runs[0].id).unwrap();
        assert!(outcomes.iter().any(|o| o.outcome == "unmapped"));
    }

    #[tokio::test]
    async fn test_write_failure_retries_next_cycle_without_duplicates() {
        let fx = fixture(TIMEOUT);
        fx.source.insert(contact("Alpha"));
        fx.source.insert(contact("Bravo"));
        fx.target.fail_writes_where("lastname", "Bravo", true);

        let report = fx.engine.run_sync_cycle().await.unwrap();
        assert_eq!(report.status, CycleStatus::Failed);
        assert_eq!(report.job.as_ref().unwrap().status, JobStatus::Succeeded);
        assert!(!fx.engine.watermarks().is_persisted("contacts").unwrap());

        fx.target.clear_faults();
        let report = fx.engine.run_sync_cycle().await.unwrap();
        assert_eq!(report.status, CycleStatus::Succeeded);
        assert_eq!(report.fetched, 2);
        assert_eq!(fx.target.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_first_cycle_keeps_its_window_past_the_grace_period() {
        let fx = fixture_with_default(
            TIMEOUT,
            WatermarkDefault::NowMinus(chrono::Duration::milliseconds(300)),
        );
        fx.source.insert(contact("Lost"));
        fx.target.fail_writes_where("lastname", "Lost", true);

        let first = fx.engine.run_sync_cycle().await.unwrap();
        assert_eq!(first.status, CycleStatus::Failed);
        assert_eq!(first.fetched, 1);

        // Past the grace period, a re-evaluated default would skip the record.
        tokio::time::sleep(Duration::from_millis(400)).await;
        fx.target.clear_faults();

        let second = fx.engine.run_sync_cycle().await.unwrap();
        assert_eq!(second.watermark_before, first.watermark_before);
        assert_eq!(second.status, CycleStatus::Succeeded);
        assert_eq!(second.fetched, 1);
        assert!(fx.target.find_by_key("lastname", "Lost").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_timeout_is_an_error_and_replays_safely() {
        let fx = fixture(Duration::from_millis(30));
        fx.source.insert(contact("Slow"));
        fx.target.set_write_delay(Duration::from_millis(200));

        let err = fx.engine.run_sync_cycle().await.unwrap_err();
        assert!(matches!(err, SyncError::Job(JobError::Timeout { .. })));
        assert!(!fx.engine.watermarks().is_persisted("contacts").unwrap());
        let runs = fx.db.list_sync_runs("contacts", 10).unwrap();
        assert_eq!(runs[0].status, "timed_out");
        assert!(runs[0].job_id.is_some());

        // Let the detached job finish, then replay.
        tokio::time::sleep(Duration::from_millis(300)).await;
        fx.target.set_write_delay(Duration::ZERO);
        assert_eq!(fx.target.len(), 1);

        let report = fx.engine.run_sync_cycle().await.unwrap();
        assert_eq!(report.status, CycleStatus::Succeeded);
        assert_eq!(fx.target.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_cycle_is_rejected() {
        let fx = fixture(TIMEOUT);
        fx.source.insert(contact("Alpha"));
        fx.target.set_write_delay(Duration::from_millis(100));

        let engine = fx.engine.clone();
        let first = tokio::spawn(async move { engine.run_sync_cycle().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(fx.engine.is_running());

        let err = fx.engine.run_sync_cycle().await.unwrap_err();
        assert!(matches!(err, SyncError::AlreadyRunning { .. }));

        first.await.unwrap().unwrap();
        assert!(!fx.engine.is_running());
    }

    #[tokio::test]
    async fn test_status_reports_watermark() {
        let fx = fixture(TIMEOUT);
        let status = fx.engine.status().unwrap();
        assert_eq!(status.stream, "contacts");
        assert!(!status.watermark_persisted);
        assert!(!status.running);
        assert!(status.active_jobs.is_empty());
    }
}
