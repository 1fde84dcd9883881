//! Core domain model for the federal spending collector.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "fedspend-core";

/// Entity types the pipeline collects. Each maps to exactly one collector and one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Awards,
    ContractOpportunities,
    Subawards,
    EconomicIndicators,
    CompanyFilings,
}

impl EntityKind {
    pub const ALL: [EntityKind; 5] = [
        EntityKind::Awards,
        EntityKind::ContractOpportunities,
        EntityKind::Subawards,
        EntityKind::EconomicIndicators,
        EntityKind::CompanyFilings,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Awards => "awards",
            EntityKind::ContractOpportunities => "contract_opportunities",
            EntityKind::Subawards => "subawards",
            EntityKind::EconomicIndicators => "economic_indicators",
            EntityKind::CompanyFilings => "company_filings",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider-assigned identity of a record, unique within its entity kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NaturalKey {
    Award {
        award_id: String,
    },
    ContractOpportunity {
        opportunity_id: String,
    },
    Subaward {
        subaward_id: String,
    },
    EconomicIndicator {
        series_id: String,
        date: NaiveDate,
    },
    CompanyFiling {
        cik: String,
        filing_type: String,
        filing_date: NaiveDate,
    },
}

impl NaturalKey {
    pub fn kind(&self) -> EntityKind {
        match self {
            NaturalKey::Award { .. } => EntityKind::Awards,
            NaturalKey::ContractOpportunity { .. } => EntityKind::ContractOpportunities,
            NaturalKey::Subaward { .. } => EntityKind::Subawards,
            NaturalKey::EconomicIndicator { .. } => EntityKind::EconomicIndicators,
            NaturalKey::CompanyFiling { .. } => EntityKind::CompanyFilings,
        }
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NaturalKey::Award { award_id } => write!(f, "award:{award_id}"),
            NaturalKey::ContractOpportunity { opportunity_id } => {
                write!(f, "opportunity:{opportunity_id}")
            }
            NaturalKey::Subaward { subaward_id } => write!(f, "subaward:{subaward_id}"),
            NaturalKey::EconomicIndicator { series_id, date } => {
                write!(f, "indicator:{series_id}@{date}")
            }
            NaturalKey::CompanyFiling {
                cik,
                filing_type,
                filing_date,
            } => write!(f, "filing:{cik}/{filing_type}/{filing_date}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Award {
    pub award_id: String,
    pub description: String,
    pub award_amount: f64,
    pub recipient_name: String,
    pub recipient_uei: Option<String>,
    pub awarding_agency: String,
    pub funding_agency: String,
    pub award_type: String,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub recipient_state: Option<String>,
    pub raw_data: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractOpportunity {
    pub opportunity_id: String,
    pub title: String,
    pub description: String,
    pub agency: String,
    pub status: String,
    pub posted_date: Option<NaiveDate>,
    pub response_deadline: Option<DateTime<Utc>>,
    pub estimated_value: f64,
    pub place_of_performance: String,
    pub naics_code: String,
    pub set_aside: String,
    pub raw_data: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subaward {
    pub subaward_id: String,
    pub prime_award_id: String,
    pub recipient_name: String,
    pub recipient_address: String,
    pub amount: f64,
    pub description: String,
    pub place_of_performance: String,
    pub period_of_performance_start: Option<NaiveDate>,
    pub period_of_performance_end: Option<NaiveDate>,
    pub raw_data: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EconomicIndicatorPoint {
    pub series_id: String,
    pub date: NaiveDate,
    /// `None` when the provider reports a missing observation.
    pub value: Option<f64>,
    pub indicator_type: String,
    pub units: String,
    pub seasonally_adjusted: String,
    pub raw_data: JsonValue,
}

/// One filing (accession) for a company, carrying the financial facts reported in it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanyFiling {
    pub cik: String,
    pub company_name: String,
    pub filing_type: String,
    pub filing_date: NaiveDate,
    pub accession_number: String,
    pub period_end_date: Option<NaiveDate>,
    pub fiscal_year: Option<i32>,
    pub fiscal_period: String,
    /// Only written when the filing itself is first inserted.
    pub metrics: Vec<CompanyFinancialMetric>,
    pub raw_data: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanyFinancialMetric {
    pub metric_name: String,
    pub taxonomy: String,
    pub value: f64,
    pub unit: String,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub raw_data: JsonValue,
}

/// A provider record after mapping, tagged by entity kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entity", rename_all = "snake_case")]
pub enum NormalizedRecord {
    Award(Award),
    ContractOpportunity(ContractOpportunity),
    Subaward(Subaward),
    EconomicIndicator(EconomicIndicatorPoint),
    CompanyFiling(CompanyFiling),
}

impl NormalizedRecord {
    pub fn kind(&self) -> EntityKind {
        match self {
            NormalizedRecord::Award(_) => EntityKind::Awards,
            NormalizedRecord::ContractOpportunity(_) => EntityKind::ContractOpportunities,
            NormalizedRecord::Subaward(_) => EntityKind::Subawards,
            NormalizedRecord::EconomicIndicator(_) => EntityKind::EconomicIndicators,
            NormalizedRecord::CompanyFiling(_) => EntityKind::CompanyFilings,
        }
    }

    pub fn natural_key(&self) -> NaturalKey {
        match self {
            NormalizedRecord::Award(a) => NaturalKey::Award {
                award_id: a.award_id.clone(),
            },
            NormalizedRecord::ContractOpportunity(o) => NaturalKey::ContractOpportunity {
                opportunity_id: o.opportunity_id.clone(),
            },
            NormalizedRecord::Subaward(s) => NaturalKey::Subaward {
                subaward_id: s.subaward_id.clone(),
            },
            NormalizedRecord::EconomicIndicator(p) => NaturalKey::EconomicIndicator {
                series_id: p.series_id.clone(),
                date: p.date,
            },
            NormalizedRecord::CompanyFiling(f) => NaturalKey::CompanyFiling {
                cik: f.cik.clone(),
                filing_type: f.filing_type.clone(),
                filing_date: f.filing_date,
            },
        }
    }

    pub fn raw_data(&self) -> &JsonValue {
        match self {
            NormalizedRecord::Award(a) => &a.raw_data,
            NormalizedRecord::ContractOpportunity(o) => &o.raw_data,
            NormalizedRecord::Subaward(s) => &s.raw_data,
            NormalizedRecord::EconomicIndicator(p) => &p.raw_data,
            NormalizedRecord::CompanyFiling(f) => &f.raw_data,
        }
    }

    /// Contractor identifier eligible for enrichment, if the record names one.
    pub fn contractor_id(&self) -> Option<&str> {
        match self {
            NormalizedRecord::Award(a) => a
                .recipient_uei
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty()),
            _ => None,
        }
    }
}

/// Store-side bookkeeping for a persisted record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Resolved entity-registry profile for a contractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractorProfile {
    pub uei: String,
    pub legal_business_name: String,
    pub cage_code: Option<String>,
    pub registration_status: String,
    pub raw_data: JsonValue,
}

/// Summary of one collector run within a cycle.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CollectionOutcome {
    pub pages: usize,
    pub fetched: usize,
    pub inserted: usize,
    pub updated: usize,
    /// Raw records that could not be mapped.
    pub rejected: usize,
    /// Mapped records whose reconciliation failed.
    pub failed: usize,
    pub contractor_ids: BTreeSet<String>,
    pub errors: Vec<String>,
    /// Set when the collector's transaction was rolled back; counts then describe
    /// work that was discarded.
    pub rolled_back: bool,
}

impl CollectionOutcome {
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            errors: vec![error.into()],
            ..Default::default()
        }
    }

    /// Records durably reconciled by this run.
    pub fn count(&self) -> usize {
        if self.rolled_back {
            0
        } else {
            self.inserted + self.updated
        }
    }

    pub fn error(&self) -> Option<String> {
        if self.errors.is_empty() {
            None
        } else {
            Some(self.errors.join("; "))
        }
    }

    pub fn is_success(&self) -> bool {
        self.errors.is_empty() && !self.rolled_back
    }
}

/// Aggregate result of one orchestrator cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcomes: BTreeMap<EntityKind, CollectionOutcome>,
    pub contractors_enriched: usize,
    pub contractor_enrichment_failures: usize,
}

impl CycleReport {
    pub fn total_count(&self) -> usize {
        self.outcomes.values().map(CollectionOutcome::count).sum()
    }

    pub fn failed_kinds(&self) -> Vec<EntityKind> {
        self.outcomes
            .iter()
            .filter(|(_, o)| !o.is_success())
            .map(|(k, _)| *k)
            .collect()
    }
}

/// Time source for store-assigned timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that advances by a fixed step on every read.
#[derive(Debug)]
pub struct SteppingClock {
    next: Mutex<DateTime<Utc>>,
    step: Duration,
}

impl SteppingClock {
    pub fn new(start: DateTime<Utc>, step: Duration) -> Self {
        Self {
            next: Mutex::new(start),
            step,
        }
    }
}

impl Clock for SteppingClock {
    fn now(&self) -> DateTime<Utc> {
        let mut next = match self.next.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let now = *next;
        *next = now + self.step;
        now
    }
}
