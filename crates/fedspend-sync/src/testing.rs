//! In-crate fakes for pipeline tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::NaiveDate;
use fedspend_adapters::{MappingError, PageRequest, SourceClient, SourceError, SourcePage};
use fedspend_core::{
    Award, CompanyFiling, CompanyFinancialMetric, ContractOpportunity, EconomicIndicatorPoint,
    EntityKind, NormalizedRecord, Subaward,
};
use fedspend_storage::FetchError;
use serde_json::{json, Value as JsonValue};

pub fn fake_point(i: usize) -> JsonValue {
    json!({ "id": format!("rec-{i}"), "value": i })
}

pub fn fake_award(id: &str, amount: f64, uei: Option<&str>) -> JsonValue {
    json!({ "id": id, "value": amount, "uei": uei })
}

pub fn provider_error() -> SourceError {
    SourceError::Fetch(FetchError::Provider {
        status: 503,
        url: "https://provider.test/search".to_string(),
        body: "service unavailable".to_string(),
    })
}

/// Scripted source: serves queued pages in order, then empty terminal pages.
pub struct FakeSource {
    kind: EntityKind,
    pages: Mutex<VecDeque<Result<SourcePage, SourceError>>>,
    requested: Mutex<Vec<u32>>,
}

impl FakeSource {
    pub fn new(pages: Vec<Result<SourcePage, SourceError>>) -> Self {
        Self::of_kind(EntityKind::EconomicIndicators, pages)
    }

    pub fn of_kind(kind: EntityKind, pages: Vec<Result<SourcePage, SourceError>>) -> Self {
        Self {
            kind,
            pages: Mutex::new(pages.into()),
            requested: Mutex::new(Vec::new()),
        }
    }

    /// Full pages claiming more data, with keys unique across pages.
    pub fn with_sizes(sizes: &[usize]) -> Self {
        let mut offset = 0;
        let pages = sizes
            .iter()
            .map(|&size| {
                let records = (offset..offset + size).map(fake_point).collect();
                offset += size;
                Ok(SourcePage {
                    records,
                    has_more: true,
                })
            })
            .collect();
        Self::new(pages)
    }

    pub fn requested_pages(&self) -> Vec<u32> {
        self.requested.lock().unwrap().clone()
    }
}

#[async_trait]
impl SourceClient for FakeSource {
    type Params = ();

    fn source_id(&self) -> &'static str {
        "fake"
    }

    fn entity_kind(&self) -> EntityKind {
        self.kind
    }

    async fn fetch_page(&self, _params: &(), page: PageRequest) -> Result<SourcePage, SourceError> {
        self.requested.lock().unwrap().push(page.page);
        self.pages
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(SourcePage::default()))
    }

    fn normalize(&self, raw: JsonValue) -> Result<NormalizedRecord, MappingError> {
        let id = raw
            .get("id")
            .and_then(JsonValue::as_str)
            .map(ToString::to_string)
            .ok_or(MappingError::MissingKey {
                source_id: "fake",
                field: "id",
            })?;
        let value = raw.get("value").and_then(JsonValue::as_f64).unwrap_or(0.0);
        let date = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();

        Ok(match self.kind {
            EntityKind::Awards => NormalizedRecord::Award(Award {
                award_id: id,
                description: String::new(),
                award_amount: value,
                recipient_name: String::new(),
                recipient_uei: raw.get("uei").and_then(JsonValue::as_str).map(ToString::to_string),
                awarding_agency: String::new(),
                funding_agency: String::new(),
                award_type: String::new(),
                start_date: None,
                end_date: None,
                recipient_state: None,
                raw_data: raw,
            }),
            EntityKind::ContractOpportunities => {
                NormalizedRecord::ContractOpportunity(ContractOpportunity {
                    opportunity_id: id,
                    title: String::new(),
                    description: String::new(),
                    agency: String::new(),
                    status: String::new(),
                    posted_date: None,
                    response_deadline: None,
                    estimated_value: value,
                    place_of_performance: String::new(),
                    naics_code: String::new(),
                    set_aside: String::new(),
                    raw_data: raw,
                })
            }
            EntityKind::Subawards => NormalizedRecord::Subaward(Subaward {
                subaward_id: id,
                prime_award_id: String::new(),
                recipient_name: String::new(),
                recipient_address: String::new(),
                amount: value,
                description: String::new(),
                place_of_performance: String::new(),
                period_of_performance_start: None,
                period_of_performance_end: None,
                raw_data: raw,
            }),
            EntityKind::EconomicIndicators => {
                NormalizedRecord::EconomicIndicator(EconomicIndicatorPoint {
                    series_id: id,
                    date,
                    value: Some(value),
                    indicator_type: String::new(),
                    units: String::new(),
                    seasonally_adjusted: String::new(),
                    raw_data: raw,
                })
            }
            EntityKind::CompanyFilings => NormalizedRecord::CompanyFiling(CompanyFiling {
                cik: id,
                company_name: String::new(),
                filing_type: "10-K".to_string(),
                filing_date: date,
                accession_number: String::new(),
                period_end_date: None,
                fiscal_year: None,
                fiscal_period: String::new(),
                metrics: vec![CompanyFinancialMetric {
                    metric_name: "Revenues".to_string(),
                    taxonomy: "us-gaap".to_string(),
                    value,
                    unit: "USD".to_string(),
                    start_date: None,
                    end_date: None,
                    raw_data: JsonValue::Null,
                }],
                raw_data: raw,
            }),
        })
    }
}
