use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fedspend_adapters::SourceClient;
use fedspend_core::{Clock, CollectionOutcome, EntityKind};
use fedspend_storage::RecordStore;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::paginate::{PageLimits, Paginator};
use crate::reconcile::{Reconciler, Reconciliation};

/// Collects one entity kind for one cycle. Never fails: every error is folded into the
/// returned outcome.
#[async_trait]
pub trait Collector: Send + Sync {
    fn kind(&self) -> EntityKind;
    fn source_id(&self) -> &'static str;
    async fn run(&self, run_id: Uuid) -> CollectionOutcome;
}

type QueryPlan<P> = Box<dyn Fn(DateTime<Utc>) -> Vec<P> + Send + Sync>;

/// Source client + paginator + reconciler behind one transaction per run.
pub struct SourceCollector<C: SourceClient> {
    client: C,
    plan: QueryPlan<C::Params>,
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    limits: PageLimits,
}

impl<C: SourceClient> SourceCollector<C> {
    /// `plan` computes the cycle's queries from the current time.
    pub fn new(
        client: C,
        store: Arc<dyn RecordStore>,
        clock: Arc<dyn Clock>,
        plan: impl Fn(DateTime<Utc>) -> Vec<C::Params> + Send + Sync + 'static,
    ) -> Self {
        Self {
            client,
            plan: Box::new(plan),
            store,
            clock,
            limits: PageLimits::default(),
        }
    }

    pub fn with_queries(
        client: C,
        store: Arc<dyn RecordStore>,
        clock: Arc<dyn Clock>,
        queries: Vec<C::Params>,
    ) -> Self
    where
        C::Params: Clone + 'static,
    {
        Self::new(client, store, clock, move |_| queries.clone())
    }

    pub fn with_limits(mut self, limits: PageLimits) -> Self {
        self.limits = limits;
        self
    }
}

#[async_trait]
impl<C> Collector for SourceCollector<C>
where
    C: SourceClient + 'static,
    C::Params: 'static,
{
    fn kind(&self) -> EntityKind {
        self.client.entity_kind()
    }

    fn source_id(&self) -> &'static str {
        self.client.source_id()
    }

    async fn run(&self, run_id: Uuid) -> CollectionOutcome {
        let kind = self.kind();
        let source_id = self.source_id();
        let queries = (self.plan)(self.clock.now());
        let mut outcome = CollectionOutcome::default();

        let mut tx = match self.store.begin(kind).await {
            Ok(tx) => tx,
            Err(err) => {
                error!(%run_id, entity = %kind, error = %err, "could not open transaction");
                return CollectionOutcome::failure(format!("begin transaction: {err}"));
            }
        };
        let reconciler = Reconciler::new(Arc::clone(&self.clock));

        for (index, params) in queries.iter().enumerate() {
            let mut pages = Paginator::new(&self.client, params, self.limits);
            while let Some(next) = pages.next_page().await {
                let batch = match next {
                    Ok(batch) => batch,
                    Err(err) => {
                        outcome.errors.push(format!("query {index}: {err}"));
                        continue;
                    }
                };
                outcome.pages += 1;
                outcome.fetched += batch.raw_count;
                outcome.rejected += batch.rejected.len();

                for record in &batch.records {
                    match reconciler.reconcile(tx.as_mut(), record).await {
                        Ok(Reconciliation::Inserted { .. }) => outcome.inserted += 1,
                        Ok(Reconciliation::Updated { .. }) => outcome.updated += 1,
                        Err(err) => {
                            warn!(
                                %run_id,
                                source_id,
                                natural_key = %record.natural_key(),
                                error = %err,
                                "reconcile failed"
                            );
                            outcome.failed += 1;
                            continue;
                        }
                    }
                    if let Some(contractor) = record.contractor_id() {
                        outcome.contractor_ids.insert(contractor.to_string());
                    }
                }
            }
        }

        match tx.commit().await {
            Ok(()) => info!(
                %run_id,
                entity = %kind,
                source_id,
                queries = queries.len(),
                pages = outcome.pages,
                inserted = outcome.inserted,
                updated = outcome.updated,
                rejected = outcome.rejected,
                failed = outcome.failed,
                "collector committed"
            ),
            Err(err) => {
                error!(%run_id, entity = %kind, error = %err, "commit failed; collector writes rolled back");
                outcome.rolled_back = true;
                outcome.errors.push(format!("commit: {err}"));
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fake_point, provider_error, FakeSource};
    use chrono::TimeZone;
    use fedspend_adapters::SourcePage;
    use fedspend_core::{NaturalKey, SteppingClock};
    use fedspend_storage::MemoryStore;
    use serde_json::json;

    fn clock() -> Arc<dyn Clock> {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single().unwrap();
        Arc::new(SteppingClock::new(start, chrono::Duration::seconds(1)))
    }

    fn page(ids: std::ops::Range<usize>, has_more: bool) -> Result<SourcePage, fedspend_adapters::SourceError> {
        Ok(SourcePage {
            records: ids.map(fake_point).collect(),
            has_more,
        })
    }

    fn point_key(i: usize) -> NaturalKey {
        NaturalKey::EconomicIndicator {
            series_id: format!("rec-{i}"),
            date: chrono::NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
        }
    }

    #[tokio::test]
    async fn malformed_record_does_not_block_the_rest_of_its_page() {
        let source = FakeSource::new(vec![Ok(SourcePage {
            records: vec![fake_point(1), json!({ "no_id": true }), fake_point(2), fake_point(3)],
            has_more: false,
        })]);
        let store = MemoryStore::new();
        let collector =
            SourceCollector::with_queries(source, Arc::new(store.clone()), clock(), vec![()]);

        let outcome = collector.run(Uuid::new_v4()).await;
        assert!(outcome.is_success());
        assert_eq!(outcome.fetched, 4);
        assert_eq!(outcome.rejected, 1);
        assert_eq!(outcome.count(), 3);
        assert_eq!(store.count(EntityKind::EconomicIndicators).await, 3);
    }

    #[tokio::test]
    async fn failing_write_is_isolated_to_its_record() {
        let source = FakeSource::new(vec![page(0..3, false)]);
        let store = MemoryStore::new();
        store.reject_key(point_key(1)).await;
        let collector =
            SourceCollector::with_queries(source, Arc::new(store.clone()), clock(), vec![()]);

        let outcome = collector.run(Uuid::new_v4()).await;
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.count(), 2);
        assert!(store.row(&point_key(0)).await.is_some());
        assert!(store.row(&point_key(2)).await.is_some());
    }

    #[tokio::test]
    async fn page_error_keeps_earlier_pages_and_reports_failure() {
        let source = FakeSource::new(vec![page(0..2, true), Err(provider_error())]);
        let store = MemoryStore::new();
        let collector =
            SourceCollector::with_queries(source, Arc::new(store.clone()), clock(), vec![()])
                .with_limits(PageLimits {
                    page_size: 2,
                    max_pages: 10,
                });

        let outcome = collector.run(Uuid::new_v4()).await;
        assert!(!outcome.is_success());
        assert_eq!(outcome.count(), 2);
        assert!(outcome.error().unwrap_or_default().contains("503"));
        assert_eq!(store.count(EntityKind::EconomicIndicators).await, 2);
    }

    #[tokio::test]
    async fn later_queries_run_after_an_earlier_query_fails() {
        let source = FakeSource::new(vec![Err(provider_error()), page(10..12, false)]);
        let store = MemoryStore::new();
        let collector =
            SourceCollector::with_queries(source, Arc::new(store.clone()), clock(), vec![(), ()]);

        let outcome = collector.run(Uuid::new_v4()).await;
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.count(), 2);
    }

    #[tokio::test]
    async fn commit_failure_rolls_back_every_write() {
        let source = FakeSource::new(vec![page(0..5, false)]);
        let store = MemoryStore::new();
        store.fail_commits_for(EntityKind::EconomicIndicators).await;
        let collector =
            SourceCollector::with_queries(source, Arc::new(store.clone()), clock(), vec![()]);

        let outcome = collector.run(Uuid::new_v4()).await;
        assert!(outcome.rolled_back);
        assert_eq!(outcome.inserted, 5);
        assert_eq!(outcome.count(), 0);
        assert_eq!(store.count(EntityKind::EconomicIndicators).await, 0);
    }

    #[tokio::test]
    async fn contractor_ids_are_gathered_from_reconciled_awards() {
        let source = FakeSource::of_kind(
            EntityKind::Awards,
            vec![Ok(SourcePage {
                records: vec![
                    crate::testing::fake_award("A-1", 10.0, Some("UEI1")),
                    crate::testing::fake_award("A-2", 20.0, Some("UEI1")),
                    crate::testing::fake_award("A-3", 30.0, None),
                ],
                has_more: false,
            })],
        );
        let collector =
            SourceCollector::with_queries(source, Arc::new(MemoryStore::new()), clock(), vec![()]);

        let outcome = collector.run(Uuid::new_v4()).await;
        assert_eq!(outcome.count(), 3);
        assert_eq!(outcome.contractor_ids.into_iter().collect::<Vec<_>>(), vec!["UEI1"]);
    }

    #[tokio::test]
    async fn query_plan_sees_the_clock() {
        let start = Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).single().unwrap();
        let seen = Arc::new(std::sync::Mutex::new(None));
        let seen_in_plan = Arc::clone(&seen);
        let collector = SourceCollector::new(
            FakeSource::new(vec![]),
            Arc::new(MemoryStore::new()),
            Arc::new(SteppingClock::new(start, chrono::Duration::zero())),
            move |now| {
                *seen_in_plan.lock().unwrap() = Some(now);
                vec![()]
            },
        );
        collector.run(Uuid::new_v4()).await;
        assert_eq!(*seen.lock().unwrap(), Some(start));
    }
}
