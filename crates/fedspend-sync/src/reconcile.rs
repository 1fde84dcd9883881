use std::sync::Arc;

use fedspend_core::{Clock, NormalizedRecord};
use fedspend_storage::{StoreError, StoreTransaction};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    Inserted { id: i64 },
    Updated { id: i64 },
}

/// Insert-or-update by natural key inside a collector's transaction.
#[derive(Clone)]
pub struct Reconciler {
    clock: Arc<dyn Clock>,
}

impl Reconciler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    pub async fn reconcile(
        &self,
        tx: &mut dyn StoreTransaction,
        record: &NormalizedRecord,
    ) -> Result<Reconciliation, StoreError> {
        let key = record.natural_key();
        let now = self.clock.now();

        if let Some(existing) = tx.find_by_natural_key(&key).await? {
            tx.update(&existing, record, now).await?;
            return Ok(Reconciliation::Updated { id: existing.id });
        }

        match tx.insert(record, now).await {
            Ok(id) => Ok(Reconciliation::Inserted { id }),
            // Another writer inserted the key between lookup and insert.
            Err(StoreError::Duplicate(_)) => {
                debug!(natural_key = %key, "insert lost a race; updating instead");
                let existing = tx.find_by_natural_key(&key).await?.ok_or_else(|| {
                    StoreError::Message(format!("{key} reported duplicate but not found"))
                })?;
                tx.update(&existing, record, now).await?;
                Ok(Reconciliation::Updated { id: existing.id })
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use fedspend_core::{EntityKind, SteppingClock};
    use fedspend_storage::{MemoryStore, RecordStore};
    use serde_json::json;

    use crate::testing::{fake_point, FakeSource};
    use fedspend_adapters::SourceClient;

    fn reconciler() -> Reconciler {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single().unwrap();
        Reconciler::new(Arc::new(SteppingClock::new(start, Duration::minutes(1))))
    }

    async fn reconcile_once(
        store: &MemoryStore,
        reconciler: &Reconciler,
        record: &NormalizedRecord,
    ) -> Reconciliation {
        let mut tx = store.begin(record.kind()).await.unwrap();
        let result = reconciler.reconcile(tx.as_mut(), record).await.unwrap();
        tx.commit().await.unwrap();
        result
    }

    #[tokio::test]
    async fn identical_payload_twice_yields_one_row_with_advancing_updated_at() {
        let source = FakeSource::new(vec![]);
        let record = source.normalize(fake_point(7)).unwrap();
        let store = MemoryStore::new();
        let reconciler = reconciler();

        let first = reconcile_once(&store, &reconciler, &record).await;
        let before = store.row(&record.natural_key()).await.unwrap();
        let second = reconcile_once(&store, &reconciler, &record).await;
        let after = store.row(&record.natural_key()).await.unwrap();

        assert!(matches!(first, Reconciliation::Inserted { .. }));
        assert_eq!(second, Reconciliation::Updated { id: before.id });
        assert_eq!(store.count(EntityKind::EconomicIndicators).await, 1);
        assert_eq!(after.created_at, before.created_at);
        assert!(after.updated_at > before.updated_at);
    }

    #[tokio::test]
    async fn changed_payload_overwrites_fields_and_raw_data() {
        let source = FakeSource::new(vec![]);
        let original = source.normalize(json!({ "id": "GDP", "value": 1.0 })).unwrap();
        let changed = source
            .normalize(json!({ "id": "GDP", "value": 2.5, "revision": 2 }))
            .unwrap();
        let store = MemoryStore::new();
        let reconciler = reconciler();

        reconcile_once(&store, &reconciler, &original).await;
        let created = store.row(&original.natural_key()).await.unwrap().created_at;
        reconcile_once(&store, &reconciler, &changed).await;

        let row = store.row(&changed.natural_key()).await.unwrap();
        let NormalizedRecord::EconomicIndicator(point) = &row.record else {
            panic!("expected an indicator");
        };
        assert_eq!(point.value, Some(2.5));
        assert_eq!(row.record.raw_data(), &json!({ "id": "GDP", "value": 2.5, "revision": 2 }));
        assert_eq!(row.created_at, created);
    }

    #[tokio::test]
    async fn filing_update_leaves_existing_metrics_untouched() {
        let source = FakeSource::of_kind(EntityKind::CompanyFilings, vec![]);
        let original = source.normalize(json!({ "id": "320193", "value": 1.0 })).unwrap();
        let restated = source.normalize(json!({ "id": "320193", "value": 2.0 })).unwrap();
        let store = MemoryStore::new();
        let reconciler = reconciler();

        let Reconciliation::Inserted { id } = reconcile_once(&store, &reconciler, &original).await
        else {
            panic!("expected an insert");
        };
        let second = reconcile_once(&store, &reconciler, &restated).await;

        assert_eq!(second, Reconciliation::Updated { id });
        assert_eq!(store.count(EntityKind::CompanyFilings).await, 1);
        let values: Vec<f64> = store.metrics_for(id).await.iter().map(|m| m.value).collect();
        assert_eq!(values, vec![1.0]);
        let row = store.row(&restated.natural_key()).await.unwrap();
        assert_eq!(row.record.raw_data(), &json!({ "id": "320193", "value": 2.0 }));
    }

    #[tokio::test]
    async fn same_key_twice_in_one_transaction_updates_staged_row() {
        let source = FakeSource::new(vec![]);
        let record = source.normalize(fake_point(1)).unwrap();
        let store = MemoryStore::new();
        let reconciler = reconciler();

        let mut tx = store.begin(EntityKind::EconomicIndicators).await.unwrap();
        let first = reconciler.reconcile(tx.as_mut(), &record).await.unwrap();
        let second = reconciler.reconcile(tx.as_mut(), &record).await.unwrap();
        tx.commit().await.unwrap();

        let Reconciliation::Inserted { id } = first else {
            panic!("expected an insert");
        };
        assert_eq!(second, Reconciliation::Updated { id });
        assert_eq!(store.count(EntityKind::EconomicIndicators).await, 1);
    }
}
