use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use fedspend_adapters::ContractorEnricher;
use fedspend_core::{Clock, CollectionOutcome, CycleReport, EntityKind};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::collector::Collector;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("no collectors registered")]
    NoCollectors,
    #[error("more than one collector registered for {0}")]
    DuplicateCollector(EntityKind),
    #[error("a collection cycle is already running")]
    CycleInProgress,
}

/// Runs every collector once per cycle, concurrently, and aggregates their outcomes.
pub struct Orchestrator {
    collectors: Vec<Arc<dyn Collector>>,
    enricher: Option<Arc<dyn ContractorEnricher>>,
    clock: Arc<dyn Clock>,
    cycle_guard: Mutex<()>,
}

impl Orchestrator {
    pub fn new(
        collectors: Vec<Arc<dyn Collector>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, OrchestratorError> {
        if collectors.is_empty() {
            return Err(OrchestratorError::NoCollectors);
        }
        let mut kinds = BTreeSet::new();
        for collector in &collectors {
            if !kinds.insert(collector.kind()) {
                return Err(OrchestratorError::DuplicateCollector(collector.kind()));
            }
        }
        Ok(Self {
            collectors,
            enricher: None,
            clock,
            cycle_guard: Mutex::new(()),
        })
    }

    pub fn with_enricher(mut self, enricher: Arc<dyn ContractorEnricher>) -> Self {
        self.enricher = Some(enricher);
        self
    }

    pub fn kinds(&self) -> Vec<EntityKind> {
        self.collectors.iter().map(|c| c.kind()).collect()
    }

    /// One full cycle. Collector failures, including panics, are reported in the
    /// outcome map; only a concurrent cycle is an error.
    pub async fn run_cycle(&self) -> Result<CycleReport, OrchestratorError> {
        let _running = self
            .cycle_guard
            .try_lock()
            .map_err(|_| OrchestratorError::CycleInProgress)?;

        let run_id = Uuid::new_v4();
        let started_at = self.clock.now();
        info!(%run_id, collectors = self.collectors.len(), "cycle started");

        let handles: Vec<_> = self
            .collectors
            .iter()
            .map(|collector| {
                let kind = collector.kind();
                let collector = Arc::clone(collector);
                let span = info_span!(
                    "collector",
                    %run_id,
                    entity = %kind,
                    source_id = collector.source_id()
                );
                let handle =
                    tokio::spawn(async move { collector.run(run_id).await }.instrument(span));
                (kind, handle)
            })
            .collect();

        let mut outcomes = BTreeMap::new();
        for (kind, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(err) => {
                    error!(%run_id, entity = %kind, error = %err, "collector task died");
                    CollectionOutcome::failure(format!("collector task died: {err}"))
                }
            };
            if outcome.is_success() {
                info!(%run_id, entity = %kind, count = outcome.count(), "collector finished");
            } else {
                warn!(
                    %run_id,
                    entity = %kind,
                    count = outcome.count(),
                    error = outcome.error().unwrap_or_default(),
                    "collector finished with errors"
                );
            }
            outcomes.insert(kind, outcome);
        }

        let (contractors_enriched, contractor_enrichment_failures) =
            self.enrich_contractors(run_id, outcomes.get(&EntityKind::Awards)).await;

        let report = CycleReport {
            run_id,
            started_at,
            finished_at: self.clock.now(),
            outcomes,
            contractors_enriched,
            contractor_enrichment_failures,
        };
        info!(
            %run_id,
            total = report.total_count(),
            failed = report.failed_kinds().len(),
            "cycle finished"
        );
        Ok(report)
    }

    /// Best-effort lookup of every contractor seen by the award collector. Lookup
    /// failures are logged and counted, never raised.
    async fn enrich_contractors(
        &self,
        run_id: Uuid,
        awards: Option<&CollectionOutcome>,
    ) -> (usize, usize) {
        let (Some(enricher), Some(awards)) = (&self.enricher, awards) else {
            return (0, 0);
        };

        let mut enriched = 0;
        let mut failures = 0;
        for uei in &awards.contractor_ids {
            match enricher.lookup(uei).await {
                Ok(Some(profile)) => {
                    info!(
                        %run_id,
                        uei = %uei,
                        legal_business_name = %profile.legal_business_name,
                        registration_status = %profile.registration_status,
                        "contractor enriched"
                    );
                    enriched += 1;
                }
                Ok(None) => {
                    warn!(%run_id, uei = %uei, "contractor not found in entity registry");
                    failures += 1;
                }
                Err(err) => {
                    warn!(%run_id, uei = %uei, error = %err, "contractor lookup failed");
                    failures += 1;
                }
            }
        }
        (enriched, failures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use fedspend_adapters::{SourceError, SourcePage};
    use fedspend_core::{ContractorProfile, SteppingClock};
    use fedspend_storage::MemoryStore;
    use serde_json::json;
    use std::time::Duration;

    use crate::collector::SourceCollector;
    use crate::testing::{fake_award, fake_point, provider_error, FakeSource};

    fn clock() -> Arc<dyn Clock> {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single().unwrap();
        Arc::new(SteppingClock::new(start, chrono::Duration::seconds(1)))
    }

    fn collector(
        kind: EntityKind,
        pages: Vec<Result<SourcePage, SourceError>>,
        store: &MemoryStore,
    ) -> Arc<dyn Collector> {
        Arc::new(SourceCollector::with_queries(
            FakeSource::of_kind(kind, pages),
            Arc::new(store.clone()),
            clock(),
            vec![()],
        ))
    }

    fn full_page(n: usize) -> Result<SourcePage, SourceError> {
        Ok(SourcePage {
            records: (0..n).map(fake_point).collect(),
            has_more: false,
        })
    }

    struct PanickingCollector;

    #[async_trait]
    impl Collector for PanickingCollector {
        fn kind(&self) -> EntityKind {
            EntityKind::Awards
        }

        fn source_id(&self) -> &'static str {
            "panics"
        }

        async fn run(&self, _run_id: Uuid) -> CollectionOutcome {
            panic!("collector bug");
        }
    }

    struct SlowCollector;

    #[async_trait]
    impl Collector for SlowCollector {
        fn kind(&self) -> EntityKind {
            EntityKind::Subawards
        }

        fn source_id(&self) -> &'static str {
            "slow"
        }

        async fn run(&self, _run_id: Uuid) -> CollectionOutcome {
            tokio::time::sleep(Duration::from_secs(60)).await;
            CollectionOutcome::default()
        }
    }

    struct StubEnricher;

    #[async_trait]
    impl ContractorEnricher for StubEnricher {
        async fn lookup(&self, uei: &str) -> Result<Option<ContractorProfile>, SourceError> {
            match uei {
                "KNOWN" => Ok(Some(ContractorProfile {
                    uei: uei.to_string(),
                    legal_business_name: "ACME FEDERAL LLC".into(),
                    cage_code: None,
                    registration_status: "Active".into(),
                    raw_data: json!({}),
                })),
                "MISSING" => Ok(None),
                _ => Err(provider_error()),
            }
        }
    }

    #[tokio::test]
    async fn failing_collector_does_not_affect_siblings() {
        let store = MemoryStore::new();
        store.fail_commits_for(EntityKind::ContractOpportunities).await;
        let orchestrator = Orchestrator::new(
            vec![
                collector(EntityKind::ContractOpportunities, vec![Err(provider_error())], &store),
                collector(EntityKind::Subawards, vec![full_page(3)], &store),
                collector(EntityKind::EconomicIndicators, vec![full_page(4)], &store),
                collector(EntityKind::CompanyFilings, vec![full_page(2)], &store),
            ],
            clock(),
        )
        .unwrap();

        let report = orchestrator.run_cycle().await.unwrap();
        assert_eq!(report.failed_kinds(), vec![EntityKind::ContractOpportunities]);
        assert_eq!(report.outcomes[&EntityKind::Subawards].count(), 3);
        assert_eq!(report.outcomes[&EntityKind::EconomicIndicators].count(), 4);
        assert_eq!(report.outcomes[&EntityKind::CompanyFilings].count(), 2);
        assert_eq!(report.total_count(), 9);
        assert_eq!(store.count(EntityKind::CompanyFilings).await, 2);
    }

    #[tokio::test]
    async fn panicking_collector_becomes_a_failed_outcome() {
        let store = MemoryStore::new();
        let orchestrator = Orchestrator::new(
            vec![
                Arc::new(PanickingCollector) as Arc<dyn Collector>,
                collector(EntityKind::EconomicIndicators, vec![full_page(1)], &store),
            ],
            clock(),
        )
        .unwrap();

        let report = orchestrator.run_cycle().await.unwrap();
        assert!(!report.outcomes[&EntityKind::Awards].is_success());
        assert_eq!(report.outcomes[&EntityKind::EconomicIndicators].count(), 1);
    }

    #[test]
    fn registration_is_validated() {
        assert!(matches!(
            Orchestrator::new(vec![], clock()),
            Err(OrchestratorError::NoCollectors)
        ));
        let store = MemoryStore::new();
        let duplicate = Orchestrator::new(
            vec![
                collector(EntityKind::Subawards, vec![], &store),
                collector(EntityKind::Subawards, vec![], &store),
            ],
            clock(),
        );
        assert!(matches!(
            duplicate,
            Err(OrchestratorError::DuplicateCollector(EntityKind::Subawards))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_cycle_is_refused() {
        let slow: Arc<dyn Collector> = Arc::new(SlowCollector);
        let orchestrator = Arc::new(Orchestrator::new(vec![slow], clock()).unwrap());
        let first = tokio::spawn({
            let orchestrator = Arc::clone(&orchestrator);
            async move { orchestrator.run_cycle().await }
        });
        tokio::task::yield_now().await;

        assert!(matches!(
            orchestrator.run_cycle().await,
            Err(OrchestratorError::CycleInProgress)
        ));
        assert!(first.await.unwrap().is_ok());
        assert!(orchestrator.run_cycle().await.is_ok());
    }

    #[tokio::test]
    async fn contractors_are_enriched_best_effort() {
        let store = MemoryStore::new();
        let awards = collector(
            EntityKind::Awards,
            vec![Ok(SourcePage {
                records: vec![
                    fake_award("A-1", 1.0, Some("KNOWN")),
                    fake_award("A-2", 2.0, Some("MISSING")),
                    fake_award("A-3", 3.0, Some("BROKEN")),
                ],
                has_more: false,
            })],
            &store,
        );
        let orchestrator = Orchestrator::new(vec![awards], clock())
            .unwrap()
            .with_enricher(Arc::new(StubEnricher));

        let report = orchestrator.run_cycle().await.unwrap();
        assert!(report.failed_kinds().is_empty());
        assert_eq!(report.contractors_enriched, 1);
        assert_eq!(report.contractor_enrichment_failures, 2);
    }
}
