//! Interfaces to the two record stores.
//!
//! The engine only talks to CRMs through [`SourceConnector`] and
//! [`TargetConnector`]. [`memory::InMemoryCrm`] implements both for tests and
//! local runs; [`rest::RestConnector`] speaks JSON over HTTP.

pub mod memory;
pub mod rest;

use async_trait::async_trait;

use crate::errors::ConnectorError;
use crate::models::{Fields, Record, RecordId};
use crate::watermark::Watermark;

/// Offset/size window into a change listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub offset: usize,
    pub size: usize,
}

impl PageRequest {
    pub fn first(size: usize) -> Self {
        Self { offset: 0, size }
    }

    pub fn next(self) -> Self {
        Self {
            offset: self.offset + self.size,
            size: self.size,
        }
    }
}

/// One page of changed records.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub records: Vec<Record>,
    pub has_more: bool,
}

/// The system records are read from.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    /// Records whose `modified_at` is strictly after `since`, ordered by
    /// `modified_at`.
    async fn list_changed_since(
        &self,
        since: Watermark,
        page: PageRequest,
    ) -> Result<Page, ConnectorError>;

    async fn delete(&self, id: &RecordId) -> Result<(), ConnectorError>;
}

/// The system records are written to.
#[async_trait]
pub trait TargetConnector: Send + Sync {
    async fn create(&self, fields: &Fields) -> Result<RecordId, ConnectorError>;

    async fn update(&self, id: &RecordId, fields: &Fields) -> Result<(), ConnectorError>;

    async fn delete(&self, id: &RecordId) -> Result<(), ConnectorError>;

    /// Look a record up by a natural key such as a unique name.
    async fn find_by_key(&self, field: &str, value: &str) -> Result<Option<Record>, ConnectorError>;
}
