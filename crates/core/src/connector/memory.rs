//! In-memory CRM used by tests, the harness, and local dry runs.
//!
//! Modification timestamps are millisecond-precise and strictly increasing
//! per instance, like a real CRM's `LastModifiedDate`. Writes can be made to
//! fail or slow down to exercise retry and timeout paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use super::{Page, PageRequest, SourceConnector, TargetConnector};
use crate::errors::ConnectorError;
use crate::models::{Fields, Record, RecordId};
use crate::watermark::Watermark;

/// Injected failure for writes whose `field` equals `value`.
#[derive(Debug, Clone)]
struct WriteFault {
    field: String,
    value: String,
    transient: bool,
}

/// Thread-safe in-memory record store implementing both connector traits.
pub struct InMemoryCrm {
    name: String,
    records: RwLock<HashMap<RecordId, Record>>,
    clock_ms: Mutex<i64>,
    faults: Mutex<Vec<WriteFault>>,
    write_delay: Mutex<Duration>,
    writes: AtomicUsize,
    deletes: AtomicUsize,
}

impl InMemoryCrm {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            records: RwLock::new(HashMap::new()),
            clock_ms: Mutex::new(0),
            faults: Mutex::new(Vec::new()),
            write_delay: Mutex::new(Duration::ZERO),
            writes: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
        }
    }

    /// Store a new record directly, bypassing fault injection and counters.
    pub fn insert(&self, fields: Fields) -> Record {
        let record = Record {
            id: RecordId::new(Uuid::new_v4().to_string()),
            modified_at: self.tick(),
            fields,
        };
        self.write_records().insert(record.id.clone(), record.clone());
        debug!(crm = %self.name, id = %record.id, "inserted record");
        record
    }

    /// Overwrite fields on an existing record and bump its timestamp.
    pub fn touch(&self, id: &RecordId, fields: Fields) -> Option<Record> {
        let modified_at = self.tick();
        let mut records = self.write_records();
        let record = records.get_mut(id)?;
        record.fields.extend(fields);
        record.modified_at = modified_at;
        Some(record.clone())
    }

    pub fn get(&self, id: &RecordId) -> Option<Record> {
        self.read_records().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.read_records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Creates and updates performed through [`TargetConnector`].
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    /// Make every create/update whose `field` equals `value` fail.
    pub fn fail_writes_where(&self, field: &str, value: &str, transient: bool) {
        lock(&self.faults).push(WriteFault {
            field: field.to_string(),
            value: value.to_string(),
            transient,
        });
    }

    pub fn clear_faults(&self) {
        lock(&self.faults).clear();
    }

    /// Sleep this long inside every create/update.
    pub fn set_write_delay(&self, delay: Duration) {
        *lock(&self.write_delay) = delay;
    }

    fn tick(&self) -> DateTime<Utc> {
        let mut last = lock(&self.clock_ms);
        let now = Utc::now().timestamp_millis().max(*last + 1);
        *last = now;
        DateTime::from_timestamp_millis(now).unwrap_or_else(Utc::now)
    }

    async fn before_write(&self, fields: &Fields) -> Result<(), ConnectorError> {
        let delay = *lock(&self.write_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let faults = lock(&self.faults).clone();
        for fault in faults {
            let hit = fields
                .get(&fault.field)
                .is_some_and(|v| v.to_string() == fault.value);
            if hit {
                let msg = format!("{}: write rejected for {}={}", self.name, fault.field, fault.value);
                return Err(if fault.transient {
                    ConnectorError::Transient(msg)
                } else {
                    ConnectorError::Permanent(msg)
                });
            }
        }
        Ok(())
    }

    fn read_records(&self) -> std::sync::RwLockReadGuard<'_, HashMap<RecordId, Record>> {
        self.records.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_records(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<RecordId, Record>> {
        self.records.write().unwrap_or_else(|e| e.into_inner())
    }

    fn remove(&self, id: &RecordId) -> Result<(), ConnectorError> {
        match self.write_records().remove(id) {
            Some(_) => {
                self.deletes.fetch_add(1, Ordering::SeqCst);
                debug!(crm = %self.name, id = %id, "deleted record");
                Ok(())
            }
            None => Err(ConnectorError::NotFound(id.to_string())),
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl SourceConnector for InMemoryCrm {
    async fn list_changed_since(
        &self,
        since: Watermark,
        page: PageRequest,
    ) -> Result<Page, ConnectorError> {
        let mut changed: Vec<Record> = self
            .read_records()
            .values()
            .filter(|r| r.modified_at > since.timestamp())
            .cloned()
            .collect();
        changed.sort_by(|a, b| a.modified_at.cmp(&b.modified_at).then_with(|| a.id.cmp(&b.id)));

        let total = changed.len();
        let records: Vec<Record> = changed.into_iter().skip(page.offset).take(page.size).collect();
        let has_more = page.offset + records.len() < total;
        Ok(Page { records, has_more })
    }

    async fn delete(&self, id: &RecordId) -> Result<(), ConnectorError> {
        self.remove(id)
    }
}

#[async_trait]
impl TargetConnector for InMemoryCrm {
    async fn create(&self, fields: &Fields) -> Result<RecordId, ConnectorError> {
        self.before_write(fields).await?;
        let record = self.insert(fields.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(record.id)
    }

    async fn update(&self, id: &RecordId, fields: &Fields) -> Result<(), ConnectorError> {
        self.before_write(fields).await?;
        self.touch(id, fields.clone())
            .ok_or_else(|| ConnectorError::NotFound(id.to_string()))?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, id: &RecordId) -> Result<(), ConnectorError> {
        self.remove(id)
    }

    async fn find_by_key(&self, field: &str, value: &str) -> Result<Option<Record>, ConnectorError> {
        let records = self.read_records();
        let mut matches: Vec<&Record> = records
            .values()
            .filter(|r| r.get(field).is_some_and(|v| v.to_string() == value))
            .collect();
        matches.sort_by_key(|r| r.modified_at);
        Ok(matches.first().map(|r| (*r).clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FieldValue;
    use chrono::Duration as ChronoDuration;

    fn contact(name: &str) -> Fields {
        let mut f = Fields::new();
        f.insert("lastname".into(), FieldValue::from(name));
        f
    }

    #[tokio::test]
    async fn test_timestamps_strictly_increase() {
        let crm = InMemoryCrm::new("sfdc");
        let a = crm.insert(contact("a"));
        let b = crm.insert(contact("b"));
        assert!(b.modified_at > a.modified_at);
        assert_eq!(a.modified_at.timestamp_subsec_nanos() % 1_000_000, 0);
    }

    #[tokio::test]
    async fn test_list_changed_since_pages() {
        let crm = InMemoryCrm::new("sfdc");
        let first = crm.insert(contact("a"));
        for name in ["b", "c", "d"] {
            crm.insert(contact(name));
        }

        let since = Watermark::new(first.modified_at - ChronoDuration::milliseconds(1));
        let page = crm.list_changed_since(since, PageRequest::first(3)).await.unwrap();
        assert_eq!(page.records.len(), 3);
        assert!(page.has_more);
        let rest = crm
            .list_changed_since(since, PageRequest::first(3).next())
            .await
            .unwrap();
        assert_eq!(rest.records.len(), 1);
        assert!(!rest.has_more);

        // Strictly-after semantics.
        let after_first = crm
            .list_changed_since(Watermark::new(first.modified_at), PageRequest::first(10))
            .await
            .unwrap();
        assert_eq!(after_first.records.len(), 3);
    }

    #[tokio::test]
    async fn test_find_update_delete() {
        let crm = InMemoryCrm::new("dynamics");
        let id = TargetConnector::create(&crm, &contact("Doe")).await.unwrap();
        let found = crm.find_by_key("lastname", "Doe").await.unwrap().unwrap();
        assert_eq!(found.id, id);

        let mut change = Fields::new();
        change.insert("fax".into(), "5556666".into());
        crm.update(&id, &change).await.unwrap();
        assert_eq!(crm.get(&id).unwrap().text("fax"), Some("5556666"));
        assert_eq!(crm.write_count(), 2);

        TargetConnector::delete(&crm, &id).await.unwrap();
        assert!(crm.find_by_key("lastname", "Doe").await.unwrap().is_none());
        assert!(matches!(
            TargetConnector::delete(&crm, &id).await,
            Err(ConnectorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let crm = InMemoryCrm::new("dynamics");
        crm.fail_writes_where("lastname", "Flaky", true);
        crm.fail_writes_where("lastname", "Broken", false);

        let err = crm.create(&contact("Flaky")).await.unwrap_err();
        assert!(err.is_transient());
        let err = crm.create(&contact("Broken")).await.unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(crm.write_count(), 0);

        crm.clear_faults();
        crm.create(&contact("Flaky")).await.unwrap();
        assert_eq!(crm.len(), 1);
    }
}
