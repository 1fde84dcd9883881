//! Collection pipeline: pagination, reconciliation, per-entity collectors, the cycle
//! orchestrator and the long-running scheduler.

mod collector;
mod config;
mod orchestrator;
mod paginate;
mod reconcile;
mod report;
mod scheduler;
#[cfg(test)]
mod testing;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use fedspend_adapters::{
    FredIndicatorsClient, FsrsSubawardsClient, SamEntityClient, SamOpportunitiesClient,
    SecCompanyFactsClient, SourceClient, UsaSpendingAwardsClient,
};
use fedspend_core::{Clock, CycleReport, SystemClock};
use fedspend_storage::{
    HttpClientConfig, HttpFetcher, MemoryStore, PgStoreConfig, PostgresStore, RecordStore,
    TokenBucketConfig,
};
use tracing::{info, warn};

pub use collector::{Collector, SourceCollector};
pub use config::{
    AwardSettings, EnrichmentSettings, FilingSettings, IndicatorSettings, OpportunitySettings, SeriesSettings,
    SourceConfig, SourceQuery, SourceRegistry, SubawardSettings, SyncConfig,
};
pub use orchestrator::{Orchestrator, OrchestratorError};
pub use paginate::{Harvest, PageBatch, PageLimits, Paginator, DEFAULT_MAX_PAGES, DEFAULT_PAGE_SIZE};
pub use reconcile::{Reconciler, Reconciliation};
pub use report::{cycle_brief_markdown, write_cycle_reports};
pub use scheduler::{CycleRunner, SchedulePolicy, Scheduler, SchedulerState};

pub const CRATE_NAME: &str = "fedspend-sync";

/// Shared fetcher settings: one token bucket per registry entry that sets `requests_per_minute`,
/// plus one for contractor lookups.
pub fn http_config(config: &SyncConfig, registry: &SourceRegistry) -> HttpClientConfig {
    let mut source_rate_limits: HashMap<String, TokenBucketConfig> = registry
        .sources
        .iter()
        .filter_map(|source| {
            source
                .requests_per_minute
                .map(|rpm| (source.source_id.clone(), TokenBucketConfig::per_minute(rpm)))
        })
        .collect();
    source_rate_limits.insert(
        SamEntityClient::SOURCE_ID.to_string(),
        TokenBucketConfig::per_minute(registry.enrichment.requests_per_minute),
    );

    HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        source_rate_limits,
        ..Default::default()
    }
}

pub fn schedule_policy(config: &SyncConfig) -> SchedulePolicy {
    SchedulePolicy {
        interval: config.sync_interval,
        retry_interval: config.retry_interval,
    }
}

/// One collector per enabled registry entry. Entries whose credentials are missing are
/// skipped with a warning.
pub fn build_orchestrator(
    config: &SyncConfig,
    registry: &SourceRegistry,
    http: Arc<HttpFetcher>,
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
) -> Result<Orchestrator> {
    let mut collectors: Vec<Arc<dyn Collector>> = Vec::new();

    for source in registry.enabled()? {
        let collector = match &source.query {
            SourceQuery::Awards(settings) => {
                let settings = settings.clone();
                wire(
                    source,
                    UsaSpendingAwardsClient::new(Arc::clone(&http)),
                    &store,
                    &clock,
                    move |now| settings.plan(now),
                )?
            }
            SourceQuery::ContractOpportunities(settings) => {
                let Some(key) = &config.sam_api_key else {
                    warn!(source_id = %source.source_id, "SAM_API_KEY not set; source disabled");
                    continue;
                };
                let settings = settings.clone();
                wire(
                    source,
                    SamOpportunitiesClient::new(Arc::clone(&http), key.clone()),
                    &store,
                    &clock,
                    move |now| settings.plan(now),
                )?
            }
            SourceQuery::Subawards(settings) => {
                let Some(key) = &config.fsrs_api_key else {
                    warn!(source_id = %source.source_id, "FSRS_API_KEY not set; source disabled");
                    continue;
                };
                let settings = settings.clone();
                wire(
                    source,
                    FsrsSubawardsClient::new(Arc::clone(&http), key.clone()),
                    &store,
                    &clock,
                    move |now| settings.plan(now),
                )?
            }
            SourceQuery::EconomicIndicators(settings) => {
                let Some(key) = &config.fred_api_key else {
                    warn!(source_id = %source.source_id, "FRED_API_KEY not set; source disabled");
                    continue;
                };
                let settings = settings.clone();
                wire(
                    source,
                    FredIndicatorsClient::new(Arc::clone(&http), key.clone()),
                    &store,
                    &clock,
                    move |now| settings.plan(now),
                )?
            }
            SourceQuery::CompanyFilings(settings) => {
                let Some(email) = &config.sec_contact_email else {
                    warn!(source_id = %source.source_id, "SEC_CONTACT_EMAIL not set; source disabled");
                    continue;
                };
                let settings = settings.clone();
                wire(
                    source,
                    SecCompanyFactsClient::new(Arc::clone(&http), email),
                    &store,
                    &clock,
                    move |now| settings.plan(now),
                )?
            }
        };
        info!(source_id = %source.source_id, entity = %source.kind(), "collector registered");
        collectors.push(collector);
    }

    let mut orchestrator =
        Orchestrator::new(collectors, clock).context("building orchestrator from registry")?;
    match &config.sam_api_key {
        Some(key) => {
            orchestrator =
                orchestrator.with_enricher(Arc::new(SamEntityClient::new(http, key.clone())));
        }
        None => warn!("SAM_API_KEY not set; contractor enrichment disabled"),
    }
    Ok(orchestrator)
}

fn wire<C>(
    source: &SourceConfig,
    client: C,
    store: &Arc<dyn RecordStore>,
    clock: &Arc<dyn Clock>,
    plan: impl Fn(DateTime<Utc>) -> Vec<C::Params> + Send + Sync + 'static,
) -> Result<Arc<dyn Collector>>
where
    C: SourceClient + 'static,
    C::Params: 'static,
{
    // Rate limits are keyed by registry id, so the two must agree.
    if client.source_id() != source.source_id {
        bail!(
            "registry entry {} is a {} source, which is served by {}",
            source.source_id,
            source.kind(),
            client.source_id()
        );
    }
    let collector = SourceCollector::new(client, Arc::clone(store), Arc::clone(clock), plan)
        .with_limits(source.limits());
    Ok(Arc::new(collector))
}

async fn connect_postgres(config: &SyncConfig) -> Result<PostgresStore> {
    let store = PostgresStore::connect(&PgStoreConfig {
        database_url: config.database_url.clone(),
        max_connections: config.db_max_connections,
    })
    .await?;
    store.migrate().await?;
    Ok(store)
}

async fn orchestrator_from_env(config: &SyncConfig, memory: bool) -> Result<Orchestrator> {
    let registry = SourceRegistry::load(&config.registry_path()).await?;
    let store: Arc<dyn RecordStore> = if memory {
        info!("using in-memory store; nothing will be persisted");
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(connect_postgres(config).await?)
    };
    let http = Arc::new(HttpFetcher::new(http_config(config, &registry))?);
    build_orchestrator(config, &registry, http, store, Arc::new(SystemClock))
}

/// Runs a single cycle. With `memory` set, records go to a throwaway in-memory store.
pub async fn run_sync_once_from_env(memory: bool) -> Result<CycleReport> {
    let config = SyncConfig::from_env();
    let orchestrator = orchestrator_from_env(&config, memory).await?;
    let report = orchestrator.run_cycle().await?;
    if let Some(dir) = &config.reports_dir {
        match write_cycle_reports(dir, &report).await {
            Ok(path) => info!(path = %path.display(), "cycle reports written"),
            Err(err) => warn!(error = %format!("{err:#}"), "writing cycle reports failed"),
        }
    }
    Ok(report)
}

/// Runs the scheduler loop against Postgres until `shutdown` resolves.
pub async fn run_scheduler_from_env(shutdown: impl Future<Output = ()>) -> Result<()> {
    let config = SyncConfig::from_env();
    let orchestrator = orchestrator_from_env(&config, false).await?;
    let scheduler = Scheduler::new(Arc::new(orchestrator), schedule_policy(&config))
        .with_reports_dir(config.reports_dir.clone());
    scheduler.run_until(shutdown).await;
    Ok(())
}

pub async fn migrate_from_env() -> Result<()> {
    let config = SyncConfig::from_env();
    connect_postgres(&config).await?;
    info!("migrations applied");
    Ok(())
}
