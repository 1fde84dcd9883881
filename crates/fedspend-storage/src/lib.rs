//! Persisted record store + rate-limited HTTP fetch utilities.

mod http;
mod memory;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fedspend_core::{EntityKind, NaturalKey, NormalizedRecord, StoredRecord};
use thiserror::Error;

pub use http::{FetchError, HttpClientConfig, HttpFetcher, SimpleTokenBucket, TokenBucketConfig};
pub use memory::{MemoryRow, MemoryStore};
pub use postgres::{PgStoreConfig, PostgresStore};

pub const CRATE_NAME: &str = "fedspend-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("natural key {0} already exists")]
    Duplicate(String),
    #[error("no stored row with id {id} in {kind}")]
    NotFound { kind: EntityKind, id: i64 },
    #[error("commit failed for {kind}: {message}")]
    Commit { kind: EntityKind, message: String },
    #[error("{0}")]
    Message(String),
}

/// Shared handle to the persisted store. Each collector run opens its own transaction.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn begin(&self, kind: EntityKind) -> Result<Box<dyn StoreTransaction>, StoreError>;
}

/// Write scope for one collector invocation.
///
/// A failing `find_by_natural_key`, `insert` or `update` leaves the transaction usable
/// for subsequent records. Nothing is visible to other readers until `commit`.
#[async_trait]
pub trait StoreTransaction: Send {
    fn kind(&self) -> EntityKind;

    async fn find_by_natural_key(
        &mut self,
        key: &NaturalKey,
    ) -> Result<Option<StoredRecord>, StoreError>;

    /// Insert a new row stamped `created_at = updated_at = now`. Company filings insert
    /// their owned financial metrics in the same write.
    async fn insert(
        &mut self,
        record: &NormalizedRecord,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError>;

    /// Overwrite every typed field and `raw_data` of an existing row, stamping
    /// `updated_at = now`. `created_at` and owned metrics are left untouched.
    async fn update(
        &mut self,
        existing: &StoredRecord,
        record: &NormalizedRecord,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}
