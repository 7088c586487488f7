//! SQLite-backed work source for single-host deployments and tests.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::source::{WorkSource, WorkSourceError};
use super::types::{
    ClaimableQuery, Lease, LeaseMarker, LeaseToken, NewWorkItem, ProcessingStatus, Rid,
    StatusUpdate, WorkItem,
};

const COLUMNS: &str = "rid, filename, url, byte_size, md5, status, retry_count, retry_after, \
                       lease_owner, lease_token, leased_at, error_detail, result, version";

/// SQLite-backed work source.
///
/// Claims and updates are single `UPDATE ... WHERE rid = ? AND version = ?`
/// statements, so concurrent claimants on one connection or several
/// processes sharing the file get compare-and-set semantics.
pub struct SqliteWorkSource {
    conn: Mutex<Connection>,
}

impl SqliteWorkSource {
    /// Open (or create) a database file.
    pub fn new(path: &Path) -> Result<Self, WorkSourceError> {
        let conn = Connection::open(path).map_err(|e| WorkSourceError::Database(e.to_string()))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(|e| WorkSourceError::Database(e.to_string()))?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory work source (useful for testing).
    pub fn in_memory() -> Result<Self, WorkSourceError> {
        let conn =
            Connection::open_in_memory().map_err(|e| WorkSourceError::Database(e.to_string()))?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), WorkSourceError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS work_items (
                rid TEXT PRIMARY KEY,
                filename TEXT NOT NULL,
                url TEXT NOT NULL,
                byte_size INTEGER,
                md5 TEXT,
                status TEXT NOT NULL DEFAULT 'unclaimed',
                retry_count INTEGER NOT NULL DEFAULT 0,
                retry_after TEXT,
                lease_owner TEXT,
                lease_token TEXT,
                leased_at TEXT,
                error_detail TEXT,
                result TEXT,
                version INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_work_items_status ON work_items(status);
            CREATE INDEX IF NOT EXISTS idx_work_items_created ON work_items(created_at);
            "#,
        )
        .map_err(|e| WorkSourceError::Database(e.to_string()))?;

        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, WorkSourceError> {
        self.conn
            .lock()
            .map_err(|e| WorkSourceError::Database(format!("connection lock poisoned: {}", e)))
    }

    /// Register a new unclaimed item.
    pub fn insert(&self, item: NewWorkItem) -> Result<WorkItem, WorkSourceError> {
        let conn = self.lock()?;
        let now = timestamp(Utc::now());
        let byte_size = item.byte_size.map(|b| b as i64);

        conn.execute(
            "INSERT INTO work_items (rid, filename, url, byte_size, md5, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'unclaimed', ?6, ?6)",
            params![item.rid.as_str(), item.filename, item.url, byte_size, item.md5, now],
        )
        .map_err(|e| WorkSourceError::Database(e.to_string()))?;

        fetch_row(&conn, &item.rid)?.ok_or_else(|| WorkSourceError::NotFound(item.rid.to_string()))
    }

    /// All items ordered by creation time.
    pub fn list_all(&self) -> Result<Vec<WorkItem>, WorkSourceError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM work_items ORDER BY created_at, rid",
                COLUMNS
            ))
            .map_err(|e| WorkSourceError::Database(e.to_string()))?;

        let rows = stmt
            .query_map([], read_raw)
            .map_err(|e| WorkSourceError::Database(e.to_string()))?;

        let mut items = Vec::new();
        for row in rows {
            let raw = row.map_err(|e| WorkSourceError::Database(e.to_string()))?;
            items.push(raw.into_item()?);
        }
        Ok(items)
    }
}

#[async_trait]
impl WorkSource for SqliteWorkSource {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn list_claimable(
        &self,
        query: &ClaimableQuery,
    ) -> Result<Vec<WorkItem>, WorkSourceError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM work_items
                 WHERE (status = 'unclaimed' AND (retry_after IS NULL OR retry_after <= ?1))
                    OR (status IN ('claimed', 'processing', 'uploading')
                        AND (leased_at IS NULL OR leased_at < ?2))
                 ORDER BY created_at, rid
                 LIMIT ?3",
                COLUMNS
            ))
            .map_err(|e| WorkSourceError::Database(e.to_string()))?;

        let rows = stmt
            .query_map(
                params![
                    timestamp(query.now),
                    timestamp(query.stale_before()),
                    query.limit as i64
                ],
                read_raw,
            )
            .map_err(|e| WorkSourceError::Database(e.to_string()))?;

        let mut items = Vec::new();
        for row in rows {
            let raw = row.map_err(|e| WorkSourceError::Database(e.to_string()))?;
            items.push(raw.into_item()?);
        }
        Ok(items)
    }

    async fn get(&self, rid: &Rid) -> Result<Option<WorkItem>, WorkSourceError> {
        let conn = self.lock()?;
        fetch_row(&conn, rid)
    }

    async fn claim(
        &self,
        item: &WorkItem,
        lease: &LeaseMarker,
    ) -> Result<WorkItem, WorkSourceError> {
        let conn = self.lock()?;
        let expected = parse_version(&item.rid, &item.version)?;

        let changed = conn
            .execute(
                "UPDATE work_items
                 SET status = 'claimed', lease_owner = ?1, lease_token = ?2, leased_at = ?3,
                     version = version + 1, updated_at = ?4
                 WHERE rid = ?5 AND version = ?6 AND status NOT IN ('complete', 'error')",
                params![
                    lease.owner,
                    lease.token.as_str(),
                    timestamp(lease.leased_at),
                    timestamp(Utc::now()),
                    item.rid.as_str(),
                    expected
                ],
            )
            .map_err(|e| WorkSourceError::Database(e.to_string()))?;

        if changed == 0 {
            return match fetch_row(&conn, &item.rid)? {
                None => Err(WorkSourceError::NotFound(item.rid.to_string())),
                Some(current) => Err(WorkSourceError::conflict(
                    &item.rid,
                    format!(
                        "expected version {}, found {} ({})",
                        item.version, current.version, current.status
                    ),
                )),
            };
        }

        fetch_row(&conn, &item.rid)?.ok_or_else(|| WorkSourceError::NotFound(item.rid.to_string()))
    }

    async fn update(
        &self,
        lease: &Lease,
        update: StatusUpdate,
    ) -> Result<WorkItem, WorkSourceError> {
        let conn = self.lock()?;
        let current = fetch_row(&conn, &lease.rid)?
            .ok_or_else(|| WorkSourceError::NotFound(lease.rid.to_string()))?;

        if current.lease_token() != Some(&lease.token) || current.version != lease.version {
            return Err(WorkSourceError::conflict(
                &lease.rid,
                format!(
                    "lease no longer held (version {} -> {})",
                    lease.version, current.version
                ),
            ));
        }

        if !current.status.can_transition_to(update.status) {
            return Err(WorkSourceError::InvalidTransition {
                rid: lease.rid.to_string(),
                from: current.status.to_string(),
                to: update.status.to_string(),
            });
        }

        let now = Utc::now();
        let (owner, token, leased_at) = if update.keeps_lease() {
            (
                Some(lease.owner.clone()),
                Some(lease.token.as_str().to_string()),
                Some(timestamp(now)),
            )
        } else {
            (None, None, None)
        };

        let retry_count = update.retry_count.unwrap_or(current.retry_count);
        let error_detail = match update.status {
            ProcessingStatus::Complete => None,
            _ => update.error_detail.or(current.error_detail),
        };
        let result = match update.result.or(current.result) {
            Some(result) => Some(
                serde_json::to_string(&result)
                    .map_err(|e| WorkSourceError::Malformed(e.to_string()))?,
            ),
            None => None,
        };

        let changed = conn
            .execute(
                "UPDATE work_items
                 SET status = ?1, retry_count = ?2, retry_after = ?3, lease_owner = ?4,
                     lease_token = ?5, leased_at = ?6, error_detail = ?7, result = ?8,
                     version = version + 1, updated_at = ?9
                 WHERE rid = ?10 AND version = ?11",
                params![
                    update.status.as_str(),
                    retry_count as i64,
                    update.retry_after.map(timestamp),
                    owner,
                    token,
                    leased_at,
                    error_detail,
                    result,
                    timestamp(now),
                    lease.rid.as_str(),
                    parse_version(&lease.rid, &lease.version)?
                ],
            )
            .map_err(|e| WorkSourceError::Database(e.to_string()))?;

        if changed == 0 {
            return Err(WorkSourceError::conflict(&lease.rid, "version moved during update"));
        }

        fetch_row(&conn, &lease.rid)?.ok_or_else(|| WorkSourceError::NotFound(lease.rid.to_string()))
    }

    async fn requeue(&self, rid: &Rid) -> Result<WorkItem, WorkSourceError> {
        let conn = self.lock()?;
        let current =
            fetch_row(&conn, rid)?.ok_or_else(|| WorkSourceError::NotFound(rid.to_string()))?;

        if current.status != ProcessingStatus::Error {
            return Err(WorkSourceError::InvalidTransition {
                rid: rid.to_string(),
                from: current.status.to_string(),
                to: ProcessingStatus::Unclaimed.to_string(),
            });
        }

        let changed = conn
            .execute(
                "UPDATE work_items
                 SET status = 'unclaimed', retry_count = 0, retry_after = NULL,
                     lease_owner = NULL, lease_token = NULL, leased_at = NULL,
                     error_detail = NULL, version = version + 1, updated_at = ?1
                 WHERE rid = ?2 AND version = ?3",
                params![
                    timestamp(Utc::now()),
                    rid.as_str(),
                    parse_version(rid, &current.version)?
                ],
            )
            .map_err(|e| WorkSourceError::Database(e.to_string()))?;

        if changed == 0 {
            return Err(WorkSourceError::conflict(rid, "version moved during requeue"));
        }

        fetch_row(&conn, rid)?.ok_or_else(|| WorkSourceError::NotFound(rid.to_string()))
    }
}

/// Fixed-width UTC timestamps so lexical comparison in SQL matches time order.
fn timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, WorkSourceError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| WorkSourceError::Malformed(format!("bad timestamp '{}': {}", value, e)))
}

fn parse_version(rid: &Rid, version: &str) -> Result<i64, WorkSourceError> {
    version
        .parse()
        .map_err(|_| WorkSourceError::conflict(rid, format!("unusable version '{}'", version)))
}

fn fetch_row(conn: &Connection, rid: &Rid) -> Result<Option<WorkItem>, WorkSourceError> {
    let raw = conn
        .query_row(
            &format!("SELECT {} FROM work_items WHERE rid = ?1", COLUMNS),
            params![rid.as_str()],
            read_raw,
        )
        .optional()
        .map_err(|e| WorkSourceError::Database(e.to_string()))?;

    raw.map(RawRow::into_item).transpose()
}

struct RawRow {
    rid: String,
    filename: String,
    url: String,
    byte_size: Option<i64>,
    md5: Option<String>,
    status: String,
    retry_count: i64,
    retry_after: Option<String>,
    lease_owner: Option<String>,
    lease_token: Option<String>,
    leased_at: Option<String>,
    error_detail: Option<String>,
    result: Option<String>,
    version: i64,
}

fn read_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        rid: row.get(0)?,
        filename: row.get(1)?,
        url: row.get(2)?,
        byte_size: row.get(3)?,
        md5: row.get(4)?,
        status: row.get(5)?,
        retry_count: row.get(6)?,
        retry_after: row.get(7)?,
        lease_owner: row.get(8)?,
        lease_token: row.get(9)?,
        leased_at: row.get(10)?,
        error_detail: row.get(11)?,
        result: row.get(12)?,
        version: row.get(13)?,
    })
}

impl RawRow {
    fn into_item(self) -> Result<WorkItem, WorkSourceError> {
        let status = ProcessingStatus::parse(&self.status).ok_or_else(|| {
            WorkSourceError::Malformed(format!("unknown status '{}' on {}", self.status, self.rid))
        })?;

        let lease = match (self.lease_owner, self.lease_token, self.leased_at) {
            (Some(owner), Some(token), Some(leased_at)) => Some(LeaseMarker {
                owner,
                token: LeaseToken::from(token.as_str()),
                leased_at: parse_timestamp(&leased_at)?,
            }),
            _ => None,
        };

        let result = match self.result {
            Some(json) => Some(
                serde_json::from_str(&json)
                    .map_err(|e| WorkSourceError::Malformed(e.to_string()))?,
            ),
            None => None,
        };

        Ok(WorkItem {
            rid: Rid::new(self.rid),
            filename: self.filename,
            url: self.url,
            byte_size: self.byte_size.map(|b| b as u64),
            md5: self.md5,
            status,
            retry_count: self.retry_count as u32,
            retry_after: self.retry_after.as_deref().map(parse_timestamp).transpose()?,
            lease,
            error_detail: self.error_detail,
            result,
            version: self.version.to_string(),
        })
    }
}
