//! Row-range service interface and its HTTP client

use async_trait::async_trait;
use gridstream_common::{ColumnInfo, GridError, Result, Row};
use reqwest::header::{ETAG, IF_NONE_MATCH};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument};

use crate::config::CacheConfig;
use crate::criteria::{FilterClause, SortKey};

/// Path of the row-range endpoint relative to the server URL.
pub const ROWS_PATH: &str = "/api/v1/rows";

/// One page request: `limit` rows starting at `offset`, under the given criteria.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowRangeRequest {
    pub table: String,
    pub offset: u64,
    pub limit: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<FilterClause>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sort: Vec<SortKey>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowRangePage {
    #[serde(default)]
    pub columns: Vec<ColumnInfo>,
    pub rows: Vec<Row>,
    /// Total rows under the request's criteria, when the service knows it.
    #[serde(default, alias = "rowCount", skip_serializing_if = "Option::is_none")]
    pub row_count: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Page {
        page: RowRangePage,
        etag: Option<String>,
    },
    /// The revalidation token still matches; keep what is cached.
    NotModified,
}

/// Remote source of table pages.
#[async_trait]
pub trait RowRangeService: Send + Sync {
    /// Fetch one page. With `etag` set, the service may answer `NotModified`.
    async fn fetch_range(&self, request: &RowRangeRequest, etag: Option<&str>) -> Result<FetchOutcome>;
}

/// Standard API response wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Row-range service reached over HTTP.
pub struct HttpRowRangeService {
    client: Client,
    base_url: String,
}

impl HttpRowRangeService {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GridError::config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn from_config(config: &CacheConfig) -> Result<Self> {
        Self::new(config.server_url.clone(), config.api_timeout())
    }

    pub fn rows_url(&self) -> String {
        format!("{}{}", self.base_url, ROWS_PATH)
    }
}

#[async_trait]
impl RowRangeService for HttpRowRangeService {
    #[instrument(skip_all, fields(table = %request.table, offset = request.offset, limit = request.limit))]
    async fn fetch_range(&self, request: &RowRangeRequest, etag: Option<&str>) -> Result<FetchOutcome> {
        let url = self.rows_url();

        let mut builder = self.client.post(&url).json(request);
        if let Some(etag) = etag {
            builder = builder.header(IF_NONE_MATCH, etag);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| GridError::transport(format!("request to {url} failed: {e}")))?;

        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            debug!("Page not modified");
            return Ok(FetchOutcome::NotModified);
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GridError::transport(format!(
                "row-range request failed with status {status}: {body}"
            )));
        }

        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let body = response
            .bytes()
            .await
            .map_err(|e| GridError::transport(format!("failed to read response body: {e}")))?;

        let api_response: ApiResponse<RowRangePage> = serde_json::from_slice(&body)
            .map_err(|e| GridError::malformed(format!("invalid row-range response: {e}")))?;

        if !api_response.success {
            return Err(GridError::transport(api_response.error.unwrap_or_else(|| {
                format!("row-range request for table '{}' was rejected", request.table)
            })));
        }

        let page = api_response
            .data
            .ok_or_else(|| GridError::malformed("row-range response has no data"))?;

        debug!(rows = page.rows.len(), row_count = ?page.row_count, etag = ?etag, "Page received");

        Ok(FetchOutcome::Page { page, etag })
    }
}
