//! JSON-over-HTTP connector.
//!
//! Talks to a CRM object collection at `{base_url}/{object}`:
//!
//! | operation            | request                                                        |
//! |----------------------|----------------------------------------------------------------|
//! | list changed         | `GET {object}?modified_since=..&offset=..&limit=..`            |
//! | find by natural key  | `GET {object}?{field}={value}&limit=1`                         |
//! | create               | `POST {object}` with the field map, answers `{"id": ".."}`     |
//! | update               | `PATCH {object}/{id}` with the field map                       |
//! | delete               | `DELETE {object}/{id}`                                         |
//!
//! Listings answer `{"records": [..], "has_more": bool}` where each record is
//! `{"id", "modified_at", "fields"}`.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, info, instrument};

use super::{Page, PageRequest, SourceConnector, TargetConnector};
use crate::errors::ConnectorError;
use crate::models::{Fields, Record, RecordId};
use crate::watermark::Watermark;

#[derive(Debug, Deserialize)]
struct ListResponse {
    records: Vec<Record>,
    #[serde(default)]
    has_more: bool,
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    id: RecordId,
}

/// Asynchronous REST client for one object collection.
#[derive(Clone)]
pub struct RestConnector {
    http: reqwest::Client,
    collection_url: String,
    token: Option<String>,
}

impl RestConnector {
    pub fn new(
        base_url: &str,
        object: &str,
        token: Option<String>,
    ) -> Result<Self, ConnectorError> {
        let collection_url = format!("{}/{}", base_url.trim_end_matches('/'), object);
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("crmsync/", env!("CARGO_PKG_VERSION"))),
        );
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;
        info!(url = %collection_url, "created RestConnector");
        Ok(Self {
            http,
            collection_url,
            token,
        })
    }

    pub fn collection_url(&self) -> &str {
        &self.collection_url
    }

    fn record_url(&self, id: &RecordId) -> String {
        format!("{}/{}", self.collection_url, id)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn send(
        &self,
        req: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<reqwest::Response, ConnectorError> {
        let resp = self.authorize(req).send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(classify_status(status, what, &body))
    }
}

/// Map a non-success HTTP status onto the connector error taxonomy.
fn classify_status(status: StatusCode, what: &str, body: &str) -> ConnectorError {
    let detail = if body.is_empty() {
        format!("{} failed: HTTP {}", what, status)
    } else {
        format!("{} failed: HTTP {}: {}", what, status, body)
    };
    match status {
        StatusCode::NOT_FOUND => ConnectorError::NotFound(detail),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            ConnectorError::Transient(detail)
        }
        s if s.is_server_error() => ConnectorError::Transient(detail),
        _ => ConnectorError::Permanent(detail),
    }
}

#[async_trait]
impl SourceConnector for RestConnector {
    #[instrument(skip(self), fields(url = %self.collection_url))]
    async fn list_changed_since(
        &self,
        since: Watermark,
        page: PageRequest,
    ) -> Result<Page, ConnectorError> {
        let req = self.http.get(&self.collection_url).query(&[
            ("modified_since", since.to_rfc3339()),
            ("offset", page.offset.to_string()),
            ("limit", page.size.to_string()),
        ]);
        let resp = self.send(req, "list changed records").await?;
        let body: ListResponse = resp
            .json()
            .await
            .map_err(|e| ConnectorError::Parse(e.to_string()))?;
        debug!(count = body.records.len(), has_more = body.has_more, "fetched page");
        Ok(Page {
            records: body.records,
            has_more: body.has_more,
        })
    }

    #[instrument(skip(self), fields(url = %self.collection_url))]
    async fn delete(&self, id: &RecordId) -> Result<(), ConnectorError> {
        self.send(self.http.delete(self.record_url(id)), "delete record")
            .await?;
        Ok(())
    }
}

#[async_trait]
impl TargetConnector for RestConnector {
    #[instrument(skip(self, fields), fields(url = %self.collection_url))]
    async fn create(&self, fields: &Fields) -> Result<RecordId, ConnectorError> {
        let resp = self
            .send(self.http.post(&self.collection_url).json(fields), "create record")
            .await?;
        let body: CreateResponse = resp
            .json()
            .await
            .map_err(|e| ConnectorError::Parse(e.to_string()))?;
        debug!(id = %body.id, "created record");
        Ok(body.id)
    }

    #[instrument(skip(self, fields), fields(url = %self.collection_url))]
    async fn update(&self, id: &RecordId, fields: &Fields) -> Result<(), ConnectorError> {
        self.send(self.http.patch(self.record_url(id)).json(fields), "update record")
            .await?;
        Ok(())
    }

    #[instrument(skip(self), fields(url = %self.collection_url))]
    async fn delete(&self, id: &RecordId) -> Result<(), ConnectorError> {
        self.send(self.http.delete(self.record_url(id)), "delete record")
            .await?;
        Ok(())
    }

    #[instrument(skip(self), fields(url = %self.collection_url))]
    async fn find_by_key(&self, field: &str, value: &str) -> Result<Option<Record>, ConnectorError> {
        let req = self
            .http
            .get(&self.collection_url)
            .query(&[(field, value), ("limit", "1")]);
        let resp = self.send(req, "find record").await?;
        let body: ListResponse = resp
            .json()
            .await
            .map_err(|e| ConnectorError::Parse(e.to_string()))?;
        Ok(body.records.into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status() {
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, "find", ""),
            ConnectorError::NotFound(_)
        ));
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "create", "").is_transient());
        assert!(classify_status(StatusCode::BAD_GATEWAY, "create", "").is_transient());
        let err = classify_status(StatusCode::BAD_REQUEST, "create", "INVALID_EMAIL_ADDRESS");
        assert!(!err.is_transient());
        assert!(err.to_string().contains("INVALID_EMAIL_ADDRESS"));
    }

    #[test]
    fn test_urls() {
        let conn = RestConnector::new("https://crm.example.com/api/", "contacts", None).unwrap();
        assert_eq!(conn.collection_url(), "https://crm.example.com/api/contacts");
        assert_eq!(
            conn.record_url(&RecordId::new("abc")),
            "https://crm.example.com/api/contacts/abc"
        );
    }

    #[test]
    fn test_list_response_shape() {
        let body: ListResponse = serde_json::from_str(
            r#"{"records":[{"id":"003A","modified_at":"2025-01-01T00:00:00.123Z",
                 "fields":{"LastName":"Doe","Phone":"1234567"}}],"has_more":true}"#,
        )
        .unwrap();
        assert!(body.has_more);
        assert_eq!(body.records[0].id.as_str(), "003A");
        assert_eq!(body.records[0].text("Phone"), Some("1234567"));
    }
}
