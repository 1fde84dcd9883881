use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use fedspend_core::{Award, EntityKind, NormalizedRecord};
use fedspend_storage::HttpFetcher;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tracing::debug;

use crate::{
    json_date, json_number, json_opt_text, json_path, json_text, records_at, MappingError,
    PageRequest, SourceClient, SourceError, SourcePage,
};

const SOURCE_ID: &str = "usaspending-awards";
const DEFAULT_BASE_URL: &str = "https://api.usaspending.gov/api/v2/search/spending_by_award/";

const AWARD_FIELDS: [&str; 12] = [
    "Award ID",
    "Recipient Name",
    "Recipient UEI",
    "Description",
    "Award Amount",
    "Start Date",
    "End Date",
    "Award Type",
    "Awarding Agency",
    "Funding Agency",
    "Place of Performance State Code",
    "generated_internal_id",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwardSearchParams {
    pub keywords: Vec<String>,
    pub award_type_codes: Vec<String>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub min_amount: f64,
    pub max_amount: f64,
}

impl AwardSearchParams {
    pub fn request_body(&self, page: PageRequest) -> JsonValue {
        let mut filters = json!({
            "award_type_codes": self.award_type_codes,
            "time_period": [{
                "start_date": self.start_date.format("%Y-%m-%d").to_string(),
                "end_date": self.end_date.format("%Y-%m-%d").to_string(),
            }],
            "award_amounts": [{
                "lower_bound": self.min_amount,
                "upper_bound": self.max_amount,
            }],
        });
        if !self.keywords.is_empty() {
            filters["keywords"] = json!(self.keywords);
        }
        json!({
            "filters": filters,
            "fields": AWARD_FIELDS,
            "page": page.page,
            "limit": page.limit,
            "sort": "Award Amount",
            "order": "desc",
            "subawards": false,
        })
    }
}

/// Award search against the public spending-by-award endpoint. No credentials needed.
#[derive(Debug, Clone)]
pub struct UsaSpendingAwardsClient {
    http: Arc<HttpFetcher>,
    base_url: String,
}

impl UsaSpendingAwardsClient {
    pub fn new(http: Arc<HttpFetcher>) -> Self {
        Self {
            http,
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn parse_page(body: &JsonValue, page: PageRequest) -> Result<SourcePage, SourceError> {
        let records = records_at(SOURCE_ID, body, &["results"])?;
        let has_more = json_path(body, &["page_metadata", "hasNext"])
            .and_then(JsonValue::as_bool)
            .unwrap_or(records.len() >= page.limit as usize);
        debug!(source_id = SOURCE_ID, page = page.page, records = records.len(), has_more, "page parsed");
        Ok(SourcePage { records, has_more })
    }
}

#[async_trait]
impl SourceClient for UsaSpendingAwardsClient {
    type Params = AwardSearchParams;

    fn source_id(&self) -> &'static str {
        SOURCE_ID
    }

    fn entity_kind(&self) -> EntityKind {
        EntityKind::Awards
    }

    async fn fetch_page(
        &self,
        params: &AwardSearchParams,
        page: PageRequest,
    ) -> Result<SourcePage, SourceError> {
        let request = self
            .http
            .client()
            .post(&self.base_url)
            .json(&params.request_body(page));
        let body = self.http.execute_json(SOURCE_ID, request).await?;
        Self::parse_page(&body, page)
    }

    fn normalize(&self, raw: JsonValue) -> Result<NormalizedRecord, MappingError> {
        let award_id = json_opt_text(&raw, &["Award ID", "award_id"]).ok_or(
            MappingError::MissingKey {
                source_id: SOURCE_ID,
                field: "Award ID",
            },
        )?;

        Ok(NormalizedRecord::Award(Award {
            award_id,
            description: json_text(&raw, &["Description", "description"]),
            award_amount: json_number(&raw, &["Award Amount", "award_amount"]),
            recipient_name: json_text(&raw, &["Recipient Name", "recipient_name"]),
            recipient_uei: json_opt_text(&raw, &["Recipient UEI", "recipient_uei"]),
            awarding_agency: json_text(&raw, &["Awarding Agency", "awarding_agency"]),
            funding_agency: json_text(&raw, &["Funding Agency", "funding_agency"]),
            award_type: json_text(&raw, &["Award Type", "Contract Award Type", "award_type"]),
            start_date: json_date(&raw, &["Start Date", "start_date"]),
            end_date: json_date(&raw, &["End Date", "end_date"]),
            recipient_state: json_opt_text(
                &raw,
                &["Place of Performance State Code", "recipient_state"],
            ),
            raw_data: raw,
        }))
    }
}
