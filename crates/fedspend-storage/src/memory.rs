use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fedspend_core::{
    CompanyFinancialMetric, EntityKind, NaturalKey, NormalizedRecord, StoredRecord,
};
use tokio::sync::Mutex;

use crate::{RecordStore, StoreError, StoreTransaction};

/// A committed row as seen by readers of a [`MemoryStore`].
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryRow {
    pub id: i64,
    pub record: NormalizedRecord,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MemoryRow {
    fn stored(&self) -> StoredRecord {
        StoredRecord {
            id: self.id,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, Default)]
struct Tables {
    rows: HashMap<NaturalKey, MemoryRow>,
    metrics: BTreeMap<i64, Vec<CompanyFinancialMetric>>,
    failing_commits: HashSet<EntityKind>,
    rejected_keys: HashSet<NaturalKey>,
}

/// Process-local store with the same transaction semantics as the postgres store.
///
/// Used by `sync --memory` and by tests, which can inject commit failures and
/// per-record write failures.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    next_id: Arc<AtomicI64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every later commit for `kind` fails and discards its writes.
    pub async fn fail_commits_for(&self, kind: EntityKind) {
        self.tables.lock().await.failing_commits.insert(kind);
    }

    /// Inserts and updates of `key` fail without affecting other writes.
    pub async fn reject_key(&self, key: NaturalKey) {
        self.tables.lock().await.rejected_keys.insert(key);
    }

    pub async fn row(&self, key: &NaturalKey) -> Option<MemoryRow> {
        self.tables.lock().await.rows.get(key).cloned()
    }

    pub async fn rows(&self, kind: EntityKind) -> Vec<MemoryRow> {
        let tables = self.tables.lock().await;
        let mut rows: Vec<MemoryRow> = tables
            .rows
            .values()
            .filter(|row| row.record.kind() == kind)
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.id);
        rows
    }

    pub async fn count(&self, kind: EntityKind) -> usize {
        self.tables
            .lock()
            .await
            .rows
            .keys()
            .filter(|key| key.kind() == kind)
            .count()
    }

    pub async fn metrics_for(&self, filing_id: i64) -> Vec<CompanyFinancialMetric> {
        self.tables
            .lock()
            .await
            .metrics
            .get(&filing_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn begin(&self, kind: EntityKind) -> Result<Box<dyn StoreTransaction>, StoreError> {
        Ok(Box::new(MemoryTransaction {
            kind,
            tables: Arc::clone(&self.tables),
            next_id: Arc::clone(&self.next_id),
            pending: HashMap::new(),
            pending_metrics: Vec::new(),
        }))
    }
}

#[derive(Debug, Clone)]
enum PendingWrite {
    Insert(MemoryRow),
    Update(MemoryRow),
}

impl PendingWrite {
    fn row(&self) -> &MemoryRow {
        match self {
            PendingWrite::Insert(row) | PendingWrite::Update(row) => row,
        }
    }
}

struct MemoryTransaction {
    kind: EntityKind,
    tables: Arc<Mutex<Tables>>,
    next_id: Arc<AtomicI64>,
    pending: HashMap<NaturalKey, PendingWrite>,
    pending_metrics: Vec<(i64, Vec<CompanyFinancialMetric>)>,
}

impl MemoryTransaction {
    async fn check_rejected(&self, key: &NaturalKey) -> Result<(), StoreError> {
        if self.tables.lock().await.rejected_keys.contains(key) {
            return Err(StoreError::Message(format!("write rejected for {key}")));
        }
        Ok(())
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    fn kind(&self) -> EntityKind {
        self.kind
    }

    async fn find_by_natural_key(
        &mut self,
        key: &NaturalKey,
    ) -> Result<Option<StoredRecord>, StoreError> {
        if let Some(write) = self.pending.get(key) {
            return Ok(Some(write.row().stored()));
        }
        Ok(self
            .tables
            .lock()
            .await
            .rows
            .get(key)
            .map(MemoryRow::stored))
    }

    async fn insert(
        &mut self,
        record: &NormalizedRecord,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let key = record.natural_key();
        self.check_rejected(&key).await?;
        if self.pending.contains_key(&key) || self.tables.lock().await.rows.contains_key(&key) {
            return Err(StoreError::Duplicate(key.to_string()));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        if let NormalizedRecord::CompanyFiling(filing) = record {
            self.pending_metrics.push((id, filing.metrics.clone()));
        }
        self.pending.insert(
            key,
            PendingWrite::Insert(MemoryRow {
                id,
                record: record.clone(),
                created_at: now,
                updated_at: now,
            }),
        );
        Ok(id)
    }

    async fn update(
        &mut self,
        existing: &StoredRecord,
        record: &NormalizedRecord,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let key = record.natural_key();
        self.check_rejected(&key).await?;

        let current = match self.pending.get(&key) {
            Some(write) => Some(write.clone()),
            None => self
                .tables
                .lock()
                .await
                .rows
                .get(&key)
                .cloned()
                .map(PendingWrite::Update),
        };
        let current = match current {
            Some(write) if write.row().id == existing.id => write,
            _ => {
                return Err(StoreError::NotFound {
                    kind: record.kind(),
                    id: existing.id,
                })
            }
        };

        let updated = |row: &MemoryRow| MemoryRow {
            id: row.id,
            record: record.clone(),
            created_at: row.created_at,
            updated_at: now,
        };
        let write = match &current {
            PendingWrite::Insert(row) => PendingWrite::Insert(updated(row)),
            PendingWrite::Update(row) => PendingWrite::Update(updated(row)),
        };
        self.pending.insert(key, write);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        let mut tables = this.tables.lock().await;

        if tables.failing_commits.contains(&this.kind) {
            return Err(StoreError::Commit {
                kind: this.kind,
                message: "injected commit failure".to_string(),
            });
        }
        for (key, write) in &this.pending {
            if matches!(write, PendingWrite::Insert(_)) && tables.rows.contains_key(key) {
                return Err(StoreError::Commit {
                    kind: this.kind,
                    message: format!("natural key {key} was inserted concurrently"),
                });
            }
        }

        for (key, write) in this.pending {
            let row = match write {
                PendingWrite::Insert(row) | PendingWrite::Update(row) => row,
            };
            tables.rows.insert(key, row);
        }
        for (filing_id, metrics) in this.pending_metrics {
            tables.metrics.insert(filing_id, metrics);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}
