//! Helpers for integration tests that create real records.
//!
//! A [`TestRun`] remembers every id a test created in either system and
//! deletes them again in [`TestRun::teardown`]. Records that are already gone
//! count as cleaned up, so teardown can run after a test that deleted some of
//! its own data.

use std::sync::Mutex;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::connector::{SourceConnector, TargetConnector};
use crate::errors::ConnectorError;
use crate::models::RecordId;

/// Result of a teardown.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub deleted: usize,
    pub already_gone: usize,
    pub errors: Vec<String>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    fn record(&mut self, system: &str, id: &RecordId, result: Result<(), ConnectorError>) {
        match result {
            Ok(()) => self.deleted += 1,
            Err(ConnectorError::NotFound(_)) => self.already_gone += 1,
            Err(e) => {
                warn!(system, id = %id, error = %e, "cleanup delete failed");
                self.errors.push(format!("{} {}: {}", system, id, e));
            }
        }
    }
}

/// Ids created by one test, per system.
#[derive(Default)]
pub struct TestRun {
    id: String,
    source_ids: Mutex<Vec<RecordId>>,
    target_ids: Mutex<Vec<RecordId>>,
}

impl TestRun {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            ..Default::default()
        }
    }

    /// Short random tag shared by names generated in this run.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn track_source(&self, id: RecordId) {
        lock(&self.source_ids).push(id);
    }

    pub fn track_target(&self, id: RecordId) {
        lock(&self.target_ids).push(id);
    }

    pub fn tracked(&self) -> (usize, usize) {
        (lock(&self.source_ids).len(), lock(&self.target_ids).len())
    }

    /// Delete everything tracked. Each id is attempted once even if others
    /// fail.
    pub async fn teardown(
        &self,
        source: &dyn SourceConnector,
        target: &dyn TargetConnector,
    ) -> CleanupReport {
        let mut report = CleanupReport::default();

        let source_ids = std::mem::take(&mut *lock(&self.source_ids));
        for id in &source_ids {
            report.record("source", id, source.delete(id).await);
        }
        let target_ids = std::mem::take(&mut *lock(&self.target_ids));
        for id in &target_ids {
            report.record("target", id, target.delete(id).await);
        }

        debug!(
            run = %self.id,
            deleted = report.deleted,
            already_gone = report.already_gone,
            errors = report.errors.len(),
            "test run torn down"
        );
        report
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// `"{prefix}-{millis}-{random}"`, unique across runs and processes.
pub fn unique_name(prefix: &str) -> String {
    let tag = Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", prefix, Utc::now().timestamp_millis(), &tag[..8])
}

pub fn unique_email(prefix: &str) -> String {
    format!("{}@example.com", unique_name(prefix).to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::memory::InMemoryCrm;
    use crate::models::{FieldValue, Fields};

    fn named(name: &str) -> Fields {
        let mut f = Fields::new();
        f.insert("LastName".into(), FieldValue::from(name));
        f
    }

    #[test]
    fn test_unique_names() {
        let a = unique_name("Test-1234");
        let b = unique_name("Test-1234");
        assert_ne!(a, b);
        assert!(a.starts_with("Test-1234-"));

        let email = unique_email("Test-1234");
        assert!(email.ends_with("@example.com"));
        assert_eq!(email, email.to_lowercase());
    }

    #[tokio::test]
    async fn test_teardown_tolerates_missing_records() {
        let source = InMemoryCrm::new("sfdc");
        let target = InMemoryCrm::new("dynamics");
        let run = TestRun::new();

        let s = source.insert(named("a"));
        let t = target.insert(named("a"));
        run.track_source(s.id.clone());
        run.track_target(t.id.clone());
        run.track_target(RecordId::new("never-existed"));
        assert_eq!(run.tracked(), (1, 2));

        let report = run.teardown(&source, &target).await;
        assert!(report.is_clean());
        assert_eq!(report.deleted, 2);
        assert_eq!(report.already_gone, 1);
        assert!(source.is_empty());
        assert!(target.is_empty());

        // Nothing left to do on a second pass.
        let again = run.teardown(&source, &target).await;
        assert_eq!(again.deleted + again.already_gone, 0);
    }
}
