//! Domain model types used throughout crmsync.
//!
//! These types bridge the connectors, the mapper, the batch runner and the
//! database layer.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Field values & records
// ---------------------------------------------------------------------------

/// A scalar attribute value carried by a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Number(f64),
    Date(DateTime<Utc>),
    Text(String),
}

impl FieldValue {
    /// Borrow the text payload, if this is a text value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Empty text counts as "no value" for required-field checks.
    pub fn is_blank(&self) -> bool {
        matches!(self, Self::Text(s) if s.trim().is_empty())
    }
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text(s) => write!(f, "{}", s),
            Self::Number(n) => write!(f, "{}", n),
            Self::Date(d) => write!(f, "{}", d.to_rfc3339_opts(SecondsFormat::Millis, true)),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<f64> for FieldValue {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(d: DateTime<Utc>) -> Self {
        Self::Date(d)
    }
}

/// Field name → value, ordered for stable logging and serialization.
pub type Fields = BTreeMap<String, FieldValue>;

/// Identifier assigned to a record by the system that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A record as stored in one of the two systems.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    /// Modification timestamp maintained by the owning system.
    pub modified_at: DateTime<Utc>,
    pub fields: Fields,
}

impl Record {
    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    /// Text value of `field`, if present and textual.
    pub fn text(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(FieldValue::as_text)
    }
}

/// Output of the field mapper: target-side fields plus the source record
/// they came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappedRecord {
    pub source_id: RecordId,
    pub fields: Fields,
}

// ---------------------------------------------------------------------------
// Batch job status
// ---------------------------------------------------------------------------

/// Overall state of a batch job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// What the target connector did with a record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WriteAction {
    Created,
    Updated,
}

/// Result of processing one record inside a batch job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecordOutcome {
    Pending,
    Succeeded {
        target_id: RecordId,
        action: WriteAction,
    },
    Failed {
        error: String,
        transient: bool,
    },
}

impl RecordOutcome {
    pub fn is_resolved(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }

    /// Short label persisted in the `record_outcomes` table.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Succeeded { .. } => "succeeded",
            Self::Failed { .. } => "failed",
        }
    }
}

/// One submitted record and its outcome.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobItem {
    pub source_id: RecordId,
    pub outcome: RecordOutcome,
}

/// Point-in-time copy of a batch job, retained by callers after the runner
/// has discarded the job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job_id: String,
    pub status: JobStatus,
    pub items: Vec<JobItem>,
    pub submitted_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobSnapshot {
    pub fn succeeded_count(&self) -> usize {
        self.items.iter().filter(|i| i.outcome.is_success()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.items
            .iter()
            .filter(|i| matches!(i.outcome, RecordOutcome::Failed { .. }))
            .count()
    }

    /// True iff the job SUCCEEDED and every record succeeded.
    pub fn is_successful(&self) -> bool {
        self.status == JobStatus::Succeeded && self.items.iter().all(|i| i.outcome.is_success())
    }
}

// ---------------------------------------------------------------------------
// Cycle report
// ---------------------------------------------------------------------------

/// Aggregate outcome of one sync cycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    /// The source reported no changes; nothing was written.
    NoChanges,
    /// Every fetched record was mapped and written; watermark advanced.
    Succeeded,
    /// At least one record failed; watermark left in place for retry.
    Failed,
}

impl std::fmt::Display for CycleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoChanges => write!(f, "no_changes"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A record excluded from a cycle because it could not be mapped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingFailure {
    pub source_id: RecordId,
    pub error: String,
}

/// Statistics and per-record detail from a single sync cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleReport {
    pub stream: String,
    pub status: CycleStatus,
    pub watermark_before: DateTime<Utc>,
    /// Set when the cycle advanced the watermark.
    pub watermark_after: Option<DateTime<Utc>>,
    pub fetched: usize,
    pub mapping_failures: Vec<MappingFailure>,
    pub job: Option<JobSnapshot>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl CycleReport {
    pub fn written(&self) -> usize {
        self.job.as_ref().map(JobSnapshot::succeeded_count).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(outcome: RecordOutcome) -> JobItem {
        JobItem {
            source_id: RecordId::new("s"),
            outcome,
        }
    }

    #[test]
    fn test_partial_failure_is_not_successful() {
        let snap = JobSnapshot {
            job_id: "j".into(),
            status: JobStatus::Succeeded,
            items: vec![
                item(RecordOutcome::Succeeded {
                    target_id: RecordId::new("t"),
                    action: WriteAction::Created,
                }),
                item(RecordOutcome::Failed {
                    error: "boom".into(),
                    transient: false,
                }),
            ],
            submitted_at: Utc::now(),
            finished_at: Some(Utc::now()),
        };
        assert_eq!(snap.status, JobStatus::Succeeded);
        assert!(!snap.is_successful());
        assert_eq!(snap.succeeded_count(), 1);
        assert_eq!(snap.failed_count(), 1);
    }

    #[test]
    fn test_field_value_untagged_json() {
        let fields: Fields = serde_json::from_str(
            r#"{"Phone":"1234567","Score":4.5,"CreatedDate":"2025-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(fields["Phone"], FieldValue::Text("1234567".into()));
        assert_eq!(fields["Score"], FieldValue::Number(4.5));
        assert!(matches!(fields["CreatedDate"], FieldValue::Date(_)));
    }

    #[test]
    fn test_blank_text() {
        assert!(FieldValue::from("  ").is_blank());
        assert!(!FieldValue::from("x").is_blank());
        assert!(!FieldValue::Number(0.0).is_blank());
    }
}
