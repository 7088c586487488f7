//! Core work item data types.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::pipeline::ImageMetadata;
use crate::storage::StoredObject;

/// Stable record identifier assigned by the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Rid(String);

impl Rid {
    pub fn new(rid: impl Into<String>) -> Self {
        Self(rid.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Rid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Rid {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Rid {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Processing status of a work item.
///
/// ```text
/// Unclaimed -> Claimed -> Processing -> Uploading -> Complete
///                 |            |            |
///                 +------------+------------+--> Unclaimed (release) | Error
/// ```
///
/// `Error -> Unclaimed` is only reachable through a manual re-queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Unclaimed,
    Claimed,
    Processing,
    Uploading,
    Complete,
    Error,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Unclaimed => "unclaimed",
            ProcessingStatus::Claimed => "claimed",
            ProcessingStatus::Processing => "processing",
            ProcessingStatus::Uploading => "uploading",
            ProcessingStatus::Complete => "complete",
            ProcessingStatus::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "unclaimed" => Some(ProcessingStatus::Unclaimed),
            "claimed" => Some(ProcessingStatus::Claimed),
            "processing" => Some(ProcessingStatus::Processing),
            "uploading" => Some(ProcessingStatus::Uploading),
            "complete" => Some(ProcessingStatus::Complete),
            "error" => Some(ProcessingStatus::Error),
            _ => None,
        }
    }

    /// `Complete` and `Error` are retained for audit and never re-claimed automatically.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessingStatus::Complete | ProcessingStatus::Error)
    }

    /// Statuses during which a worker holds a lease on the item.
    pub fn is_leased(&self) -> bool {
        matches!(
            self,
            ProcessingStatus::Claimed | ProcessingStatus::Processing | ProcessingStatus::Uploading
        )
    }

    /// Whether a lease holder may move the item from `self` to `next`.
    ///
    /// Same-status writes are heartbeats. Claiming is not covered here; it is
    /// a separate conditional write checked by [`WorkItem::is_claimable`].
    pub fn can_transition_to(&self, next: ProcessingStatus) -> bool {
        use ProcessingStatus::*;
        match (self, next) {
            (Claimed, Claimed) | (Processing, Processing) | (Uploading, Uploading) => true,
            (Claimed, Processing) | (Processing, Uploading) | (Uploading, Complete) => true,
            (Claimed | Processing | Uploading, Unclaimed | Error) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque lease token, a UUID v4 generated per claim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseToken(String);

impl LeaseToken {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for LeaseToken {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lease marker as recorded on the catalog row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseMarker {
    pub owner: String,
    pub token: LeaseToken,
    pub leased_at: DateTime<Utc>,
}

impl LeaseMarker {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            token: LeaseToken::generate(),
            leased_at: Utc::now(),
        }
    }

    /// A lease whose expiry is not representable never goes stale.
    pub fn is_stale(&self, now: DateTime<Utc>, lease_timeout: Duration) -> bool {
        self.leased_at
            .checked_add_signed(lease_timeout)
            .is_some_and(|expires| expires < now)
    }
}

/// A lease held by this process.
///
/// `version` and `status` track the holder's last write; the version is the
/// precondition for the holder's next conditional update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Lease {
    pub rid: Rid,
    pub token: LeaseToken,
    pub owner: String,
    pub version: String,
    pub status: ProcessingStatus,
    pub acquired_at: DateTime<Utc>,
}

impl Lease {
    /// Build the holder's view of a freshly claimed record.
    pub fn from_claimed(item: &WorkItem, marker: &LeaseMarker) -> Self {
        Self {
            rid: item.rid.clone(),
            token: marker.token.clone(),
            owner: marker.owner.clone(),
            version: item.version.clone(),
            status: item.status,
            acquired_at: marker.leased_at,
        }
    }

    /// Record a successful write by the holder.
    pub fn advance(&mut self, written: &WorkItem) {
        self.version = written.version.clone();
        self.status = written.status;
    }
}

/// Result metadata written back with the `Complete` status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogResult {
    pub artifacts: Vec<StoredObject>,
    pub metadata: ImageMetadata,
    pub completed_at: DateTime<Utc>,
}

/// One image record eligible for processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub rid: Rid,
    pub filename: String,
    /// Storage URL of the source asset.
    pub url: String,
    pub byte_size: Option<u64>,
    /// Hex md5 of the source asset, when the catalog records one.
    pub md5: Option<String>,
    pub status: ProcessingStatus,
    pub retry_count: u32,
    pub retry_after: Option<DateTime<Utc>>,
    pub lease: Option<LeaseMarker>,
    pub error_detail: Option<String>,
    pub result: Option<CatalogResult>,
    /// Opaque version used as the compare-and-set precondition.
    pub version: String,
}

impl WorkItem {
    /// Whether a new claim may be attempted against this observed state.
    ///
    /// Unclaimed items are claimable once their backoff has passed. Leased
    /// items are claimable only when the lease is older than `lease_timeout`.
    pub fn is_claimable(&self, now: DateTime<Utc>, lease_timeout: Duration) -> bool {
        match self.status {
            ProcessingStatus::Unclaimed => self.retry_after.is_none_or(|after| after <= now),
            status if status.is_leased() => match &self.lease {
                Some(lease) => lease.is_stale(now, lease_timeout),
                // A leased status without a marker can only come from a crashed
                // writer; treat it as stale.
                None => true,
            },
            _ => false,
        }
    }

    pub fn lease_token(&self) -> Option<&LeaseToken> {
        self.lease.as_ref().map(|l| &l.token)
    }
}

/// Conditional status write performed by a lease holder.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub status: ProcessingStatus,
    /// New retry count; `None` leaves it unchanged.
    pub retry_count: Option<u32>,
    pub retry_after: Option<DateTime<Utc>>,
    pub error_detail: Option<String>,
    pub result: Option<CatalogResult>,
}

impl StatusUpdate {
    pub fn new(status: ProcessingStatus) -> Self {
        Self {
            status,
            retry_count: None,
            retry_after: None,
            error_detail: None,
            result: None,
        }
    }

    pub fn with_retry(mut self, retry_count: u32, retry_after: Option<DateTime<Utc>>) -> Self {
        self.retry_count = Some(retry_count);
        self.retry_after = retry_after;
        self
    }

    pub fn with_error(mut self, detail: impl Into<String>) -> Self {
        self.error_detail = Some(detail.into());
        self
    }

    pub fn with_result(mut self, result: CatalogResult) -> Self {
        self.result = Some(result);
        self
    }

    /// Whether the write keeps the holder's lease on the row.
    pub fn keeps_lease(&self) -> bool {
        self.status.is_leased()
    }
}

/// Query for claimable items.
#[derive(Debug, Clone)]
pub struct ClaimableQuery {
    pub now: DateTime<Utc>,
    pub lease_timeout: Duration,
    pub limit: usize,
}

impl ClaimableQuery {
    pub fn new(lease_timeout: Duration) -> Self {
        Self {
            now: Utc::now(),
            lease_timeout,
            limit: 100,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    pub fn stale_before(&self) -> DateTime<Utc> {
        self.now
            .checked_sub_signed(self.lease_timeout)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

/// Request to register a new work item (seeding local catalogs).
#[derive(Debug, Clone)]
pub struct NewWorkItem {
    pub rid: Rid,
    pub filename: String,
    pub url: String,
    pub byte_size: Option<u64>,
    pub md5: Option<String>,
}

impl NewWorkItem {
    pub fn new(rid: impl Into<Rid>, filename: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            rid: rid.into(),
            filename: filename.into(),
            url: url.into(),
            byte_size: None,
            md5: None,
        }
    }

    pub fn with_size(mut self, bytes: u64) -> Self {
        self.byte_size = Some(bytes);
        self
    }

    pub fn with_md5(mut self, md5: impl Into<String>) -> Self {
        self.md5 = Some(md5.into());
        self
    }
}
