//! REST catalog work source.
//!
//! Rows are plain JSON objects. Column names and status strings go through
//! the configured [`ModelMapping`].
//!
//! Concurrency control uses the catalog's HTTP entity tags. Every write
//! re-reads the row, checks that it is still in the state the caller
//! expects, then `PUT`s with `If-Match` set to the `ETag` of that read.
//! Catalog ETags cover the whole table, so a `412 Precondition Failed`
//! caused by an unrelated row is retried from a fresh read; a change to the
//! row itself fails the state check and surfaces as a conflict.
//!
//! Empty claimable queries remember their `ETag` and are re-polled with
//! `If-None-Match`, so an idle catalog answers `304 Not Modified`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{ETAG, IF_MATCH, IF_NONE_MATCH};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::config::{CatalogConfig, ModelMapping};
use super::source::{WorkSource, WorkSourceError};
use super::types::{
    ClaimableQuery, Lease, LeaseMarker, LeaseToken, ProcessingStatus, Rid, StatusUpdate, WorkItem,
};

/// Fresh reads attempted when a write loses to an unrelated table change.
const MAX_WRITE_ATTEMPTS: usize = 3;

/// Work source backed by a REST catalog.
pub struct ErmrestWorkSource {
    client: Client,
    config: CatalogConfig,
    cookie: Option<String>,
    /// `ETag` of the last empty answer, per query path.
    idle_etags: Mutex<HashMap<String, String>>,
}

enum Fetched {
    Rows {
        rows: Vec<Value>,
        etag: Option<String>,
    },
    NotModified,
}

impl ErmrestWorkSource {
    pub fn new(config: CatalogConfig, cookie: Option<String>) -> Result<Self, WorkSourceError> {
        let client = Client::builder()
            .user_agent(format!("imaging-worker/{}", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| WorkSourceError::Unavailable(e.to_string()))?;

        Ok(Self {
            client,
            config,
            cookie,
            idle_etags: Mutex::new(HashMap::new()),
        })
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.base_uri.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn row_url(&self, path: &str, rid: &Rid) -> String {
        format!(
            "{}/{}",
            self.url(path).trim_end_matches('/'),
            urlencoding::encode(rid.as_str())
        )
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request.header("Accept", "application/json");
        match &self.cookie {
            Some(cookie) => request.header("Cookie", cookie),
            None => request,
        }
    }

    fn idle_etag(&self, path: &str) -> Option<String> {
        self.idle_etags
            .lock()
            .ok()
            .and_then(|etags| etags.get(path).cloned())
    }

    fn set_idle_etag(&self, path: &str, etag: Option<String>) {
        if let Ok(mut etags) = self.idle_etags.lock() {
            match etag {
                Some(etag) => etags.insert(path.to_string(), etag),
                None => etags.remove(path),
            };
        }
    }

    async fn fetch_rows(
        &self,
        path: &str,
        limit: Option<usize>,
        if_none_match: Option<&str>,
    ) -> Result<Fetched, WorkSourceError> {
        let mut url = self.url(path);
        if let Some(limit) = limit {
            let sep = if url.contains('?') { '&' } else { '?' };
            url = format!("{}{}limit={}", url, sep, limit);
        }

        debug!("Catalog GET {}", url);
        let mut request = self.authorized(self.client.get(&url));
        if let Some(etag) = if_none_match {
            request = request.header(IF_NONE_MATCH, etag);
        }
        let response = request.send().await.map_err(map_request_error)?;

        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            return Ok(Fetched::NotModified);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, body));
        }

        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let rows = response
            .json::<Vec<Value>>()
            .await
            .map_err(|e| WorkSourceError::Malformed(format!("expected a JSON row array: {}", e)))?;
        Ok(Fetched::Rows { rows, etag })
    }

    /// Run one claimable query, short-circuiting on an unchanged idle answer.
    async fn poll_query(&self, path: &str, limit: usize) -> Result<Vec<WorkItem>, WorkSourceError> {
        let cached = self.idle_etag(path);
        let (rows, etag) = match self.fetch_rows(path, Some(limit), cached.as_deref()).await? {
            Fetched::NotModified => {
                debug!("No catalog changes since the last empty poll of {}", path);
                return Ok(Vec::new());
            }
            Fetched::Rows { rows, etag } => (rows, etag),
        };

        if rows.is_empty() {
            self.set_idle_etag(path, etag);
            return Ok(Vec::new());
        }
        self.set_idle_etag(path, None);

        let version = etag.unwrap_or_default();
        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            match parse_row(&self.config.model, row, &version) {
                Ok(item) => items.push(item),
                Err(e) => warn!("Skipping catalog row: {}", e),
            }
        }
        Ok(items)
    }

    /// Read one row together with the `ETag` a write must match.
    async fn fetch_current(&self, rid: &Rid) -> Result<WorkItem, WorkSourceError> {
        let path = format!(
            "{}/{}={}",
            self.config.entity_path.trim_end_matches('/'),
            self.config.model.rid,
            urlencoding::encode(rid.as_str())
        );
        let (rows, etag) = match self.fetch_rows(&path, None, None).await? {
            Fetched::Rows { rows, etag } => (rows, etag),
            Fetched::NotModified => {
                return Err(WorkSourceError::Malformed(format!(
                    "unconditional read of {} answered 304",
                    rid
                )))
            }
        };

        let row = rows
            .first()
            .ok_or_else(|| WorkSourceError::NotFound(rid.to_string()))?;
        let etag = etag.ok_or_else(|| {
            WorkSourceError::Malformed(format!("catalog read of {} carried no ETag", rid))
        })?;
        parse_row(&self.config.model, row, &etag)
    }

    /// `PUT` one row under `If-Match`. `Ok(false)` means the precondition failed.
    async fn put_row(
        &self,
        path: &str,
        rid: &Rid,
        etag: &str,
        row: &Map<String, Value>,
    ) -> Result<bool, WorkSourceError> {
        let url = self.row_url(path, rid);
        debug!("Catalog PUT {} (If-Match {})", url, etag);

        let response = self
            .authorized(self.client.put(&url))
            .header(IF_MATCH, etag)
            .json(&[Value::Object(row.clone())])
            .send()
            .await
            .map_err(map_request_error)?;

        let status = response.status();
        match status {
            s if s.is_success() => Ok(true),
            StatusCode::PRECONDITION_FAILED => Ok(false),
            StatusCode::CONFLICT => Err(WorkSourceError::conflict(
                rid,
                format!("catalog answered {}", status.as_u16()),
            )),
            StatusCode::NOT_FOUND => Err(WorkSourceError::NotFound(rid.to_string())),
            _ => {
                let body = response.text().await.unwrap_or_default();
                Err(status_error(status, body))
            }
        }
    }

    /// Conditional write of the row built by `build` from a fresh read.
    ///
    /// `check` vets the freshly read row; its error aborts the write.
    async fn write_row<C, B>(
        &self,
        path: &str,
        rid: &Rid,
        check: C,
        build: B,
    ) -> Result<WorkItem, WorkSourceError>
    where
        C: Fn(&WorkItem) -> Result<(), WorkSourceError> + Send + Sync,
        B: Fn(&WorkItem) -> Result<Map<String, Value>, WorkSourceError> + Send + Sync,
    {
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let current = self.fetch_current(rid).await?;
            check(&current)?;
            let row = build(&current)?;

            if self.put_row(path, rid, &current.version, &row).await? {
                return self.fetch_current(rid).await;
            }
            debug!(
                "Catalog changed under write to {} (attempt {}/{})",
                rid, attempt, MAX_WRITE_ATTEMPTS
            );
        }
        Err(WorkSourceError::conflict(
            rid,
            format!("precondition failed {} times", MAX_WRITE_ATTEMPTS),
        ))
    }

    fn base_row(&self, rid: &Rid, status: ProcessingStatus) -> Map<String, Value> {
        let model = &self.config.model;
        let mut row = Map::new();
        row.insert(model.rid.clone(), Value::String(rid.to_string()));
        row.insert(
            model.status.clone(),
            Value::String(model.statuses.to_catalog(status).to_string()),
        );
        row
    }

    fn lease_columns(&self, row: &mut Map<String, Value>, marker: Option<&LeaseMarker>) {
        let model = &self.config.model;
        match marker {
            Some(marker) => {
                row.insert(model.lease_owner.clone(), Value::String(marker.owner.clone()));
                row.insert(
                    model.lease_token.clone(),
                    Value::String(marker.token.to_string()),
                );
                row.insert(
                    model.leased_at.clone(),
                    Value::String(marker.leased_at.to_rfc3339()),
                );
            }
            None => {
                row.insert(model.lease_owner.clone(), Value::Null);
                row.insert(model.lease_token.clone(), Value::Null);
                row.insert(model.leased_at.clone(), Value::Null);
            }
        }
    }

    /// Build the row body for a holder's status write.
    fn update_row(
        &self,
        lease: &Lease,
        update: StatusUpdate,
        now: DateTime<Utc>,
    ) -> Result<Map<String, Value>, WorkSourceError> {
        let model = &self.config.model;
        let mut row = self.base_row(&lease.rid, update.status);

        if update.keeps_lease() {
            let marker = LeaseMarker {
                owner: lease.owner.clone(),
                token: lease.token.clone(),
                leased_at: now,
            };
            self.lease_columns(&mut row, Some(&marker));
        } else {
            self.lease_columns(&mut row, None);
        }

        if let Some(count) = update.retry_count {
            row.insert(model.retry_count.clone(), Value::from(count));
            row.insert(
                model.retry_after.clone(),
                update
                    .retry_after
                    .map(|t| Value::String(t.to_rfc3339()))
                    .unwrap_or(Value::Null),
            );
        }

        if update.status == ProcessingStatus::Complete {
            row.insert(model.error_detail.clone(), Value::Null);
        } else if let Some(detail) = update.error_detail {
            row.insert(model.error_detail.clone(), Value::String(detail));
        }

        if let Some(result) = update.result {
            let value =
                serde_json::to_value(result).map_err(|e| WorkSourceError::Malformed(e.to_string()))?;
            row.insert(model.result.clone(), value);
        }

        Ok(row)
    }
}

/// Whether `current` is still the record a claim was decided on.
fn unchanged_since(observed: &WorkItem, current: &WorkItem) -> bool {
    observed.status == current.status
        && observed.lease == current.lease
        && observed.retry_count == current.retry_count
        && observed.retry_after == current.retry_after
}

#[async_trait]
impl WorkSource for ErmrestWorkSource {
    fn name(&self) -> &str {
        "ermrest"
    }

    async fn list_claimable(
        &self,
        query: &ClaimableQuery,
    ) -> Result<Vec<WorkItem>, WorkSourceError> {
        let mut items = self
            .poll_query(&self.config.claimable_query, query.limit)
            .await?;
        if let Some(leased) = &self.config.leased_query {
            items.extend(self.poll_query(leased, query.limit).await?);
        }
        items.truncate(query.limit);
        Ok(items)
    }

    async fn get(&self, rid: &Rid) -> Result<Option<WorkItem>, WorkSourceError> {
        match self.fetch_current(rid).await {
            Ok(item) => Ok(Some(item)),
            Err(WorkSourceError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn claim(
        &self,
        item: &WorkItem,
        lease: &LeaseMarker,
    ) -> Result<WorkItem, WorkSourceError> {
        let claimed = self
            .write_row(
                &self.config.claim_path,
                &item.rid,
                |current| {
                    if unchanged_since(item, current) {
                        Ok(())
                    } else {
                        Err(WorkSourceError::conflict(
                            &item.rid,
                            format!("row moved to {} since it was listed", current.status),
                        ))
                    }
                },
                |_| {
                    let mut row = self.base_row(&item.rid, ProcessingStatus::Claimed);
                    self.lease_columns(&mut row, Some(lease));
                    Ok(row)
                },
            )
            .await?;

        if claimed.lease_token() != Some(&lease.token) {
            return Err(WorkSourceError::conflict(
                &item.rid,
                "lease marker overwritten after claim",
            ));
        }
        Ok(claimed)
    }

    async fn update(
        &self,
        lease: &Lease,
        update: StatusUpdate,
    ) -> Result<WorkItem, WorkSourceError> {
        self.write_row(
            &self.config.update_path,
            &lease.rid,
            |current| {
                if current.lease_token() != Some(&lease.token) {
                    return Err(WorkSourceError::conflict(&lease.rid, "lease no longer held"));
                }
                if !current.status.can_transition_to(update.status) {
                    return Err(WorkSourceError::InvalidTransition {
                        rid: lease.rid.to_string(),
                        from: current.status.to_string(),
                        to: update.status.to_string(),
                    });
                }
                Ok(())
            },
            |_| self.update_row(lease, update.clone(), Utc::now()),
        )
        .await
    }

    async fn requeue(&self, rid: &Rid) -> Result<WorkItem, WorkSourceError> {
        self.write_row(
            &self.config.update_path,
            rid,
            |current| {
                if current.status == ProcessingStatus::Error {
                    Ok(())
                } else {
                    Err(WorkSourceError::InvalidTransition {
                        rid: rid.to_string(),
                        from: current.status.to_string(),
                        to: ProcessingStatus::Unclaimed.to_string(),
                    })
                }
            },
            |_| {
                let model = &self.config.model;
                let mut row = self.base_row(rid, ProcessingStatus::Unclaimed);
                self.lease_columns(&mut row, None);
                row.insert(model.retry_count.clone(), Value::from(0));
                row.insert(model.retry_after.clone(), Value::Null);
                row.insert(model.error_detail.clone(), Value::Null);
                Ok(row)
            },
        )
        .await
    }
}

fn map_request_error(e: reqwest::Error) -> WorkSourceError {
    if e.is_timeout() {
        WorkSourceError::Timeout(e.to_string())
    } else {
        WorkSourceError::Unavailable(e.to_string())
    }
}

fn status_error(status: StatusCode, body: String) -> WorkSourceError {
    if status.is_server_error() {
        WorkSourceError::Unavailable(format!("HTTP {}: {}", status.as_u16(), body))
    } else {
        WorkSourceError::Api {
            status: status.as_u16(),
            message: body,
        }
    }
}

fn field_str(row: &Value, column: &str) -> Option<String> {
    match row.get(column)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn field_u64(row: &Value, column: &str) -> Option<u64> {
    match row.get(column)? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn field_time(row: &Value, column: &str) -> Option<DateTime<Utc>> {
    field_str(row, column)
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Translate one catalog row into a [`WorkItem`] observed under `etag`.
pub(crate) fn parse_row(
    model: &ModelMapping,
    row: &Value,
    etag: &str,
) -> Result<WorkItem, WorkSourceError> {
    let rid = field_str(row, &model.rid)
        .ok_or_else(|| WorkSourceError::Malformed(format!("row without {}", model.rid)))?;

    let raw_status = field_str(row, &model.status).ok_or_else(|| {
        WorkSourceError::Malformed(format!("{} has no {}", rid, model.status))
    })?;
    let status = model.statuses.from_catalog(&raw_status).ok_or_else(|| {
        WorkSourceError::Malformed(format!("{} has unknown status '{}'", rid, raw_status))
    })?;

    let lease = match (
        field_str(row, &model.lease_owner),
        field_str(row, &model.lease_token),
        field_time(row, &model.leased_at),
    ) {
        (Some(owner), Some(token), Some(leased_at)) => Some(LeaseMarker {
            owner,
            token: LeaseToken::from(token.as_str()),
            leased_at,
        }),
        _ => None,
    };

    let result = row
        .get(&model.result)
        .filter(|v| !v.is_null())
        .and_then(|v| serde_json::from_value(v.clone()).ok());

    Ok(WorkItem {
        rid: Rid::new(rid),
        filename: field_str(row, &model.filename).unwrap_or_default(),
        url: field_str(row, &model.url).unwrap_or_default(),
        byte_size: field_u64(row, &model.bytes),
        md5: field_str(row, &model.md5),
        status,
        retry_count: field_u64(row, &model.retry_count).unwrap_or(0) as u32,
        retry_after: field_time(row, &model.retry_after),
        lease,
        error_detail: field_str(row, &model.error_detail),
        result,
        version: etag.to_string(),
    })
}
