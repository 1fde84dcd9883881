use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use fedspend_core::{ContractOpportunity, EntityKind, NormalizedRecord};
use fedspend_storage::HttpFetcher;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::{
    json_date, json_datetime, json_number, json_opt_number, json_opt_text, json_path, json_text,
    location_text, more_from_total, records_at, MappingError, PageRequest, SourceClient,
    SourceError, SourcePage,
};

const SOURCE_ID: &str = "sam-opportunities";
const DEFAULT_BASE_URL: &str = "https://api.sam.gov/opportunities/v2/search";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpportunitySearchParams {
    pub keyword: Option<String>,
    pub status: Option<String>,
    pub posted_from: Option<NaiveDate>,
    pub posted_to: Option<NaiveDate>,
}

impl OpportunitySearchParams {
    pub fn query_pairs(&self, page: PageRequest) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("page", page.page.to_string()),
            ("limit", page.limit.to_string()),
        ];
        if let Some(keyword) = self.keyword.as_deref().filter(|k| !k.is_empty()) {
            pairs.push(("q", keyword.to_string()));
        }
        if let Some(status) = self.status.as_deref().filter(|s| !s.is_empty()) {
            pairs.push(("status", status.to_string()));
        }
        if let Some(from) = self.posted_from {
            pairs.push(("postedFrom", from.format("%m/%d/%Y").to_string()));
        }
        if let Some(to) = self.posted_to {
            pairs.push(("postedTo", to.format("%m/%d/%Y").to_string()));
        }
        pairs
    }
}

/// Contract opportunity search. Bearer-authenticated.
#[derive(Debug, Clone)]
pub struct SamOpportunitiesClient {
    http: Arc<HttpFetcher>,
    base_url: String,
    api_key: String,
}

impl SamOpportunitiesClient {
    pub fn new(http: Arc<HttpFetcher>, api_key: impl Into<String>) -> Self {
        Self {
            http,
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn parse_page(body: &JsonValue, page: PageRequest) -> Result<SourcePage, SourceError> {
        let records = records_at(SOURCE_ID, body, &["opportunitiesData", "results", "data"])?;
        let total = json_opt_number(body, &["totalRecords", "total"]);
        let has_more = more_from_total(total, page, records.len());
        debug!(source_id = SOURCE_ID, total = ?total, records = records.len(), has_more, "page parsed");
        Ok(SourcePage { records, has_more })
    }
}

fn status_of(raw: &JsonValue) -> String {
    if let Some(status) = json_opt_text(raw, &["status"]) {
        return status;
    }
    match json_opt_text(raw, &["active"]).as_deref() {
        Some("Yes") | Some("true") => "active".to_string(),
        Some("No") | Some("false") => "inactive".to_string(),
        _ => String::new(),
    }
}

#[async_trait]
impl SourceClient for SamOpportunitiesClient {
    type Params = OpportunitySearchParams;

    fn source_id(&self) -> &'static str {
        SOURCE_ID
    }

    fn entity_kind(&self) -> EntityKind {
        EntityKind::ContractOpportunities
    }

    async fn fetch_page(
        &self,
        params: &OpportunitySearchParams,
        page: PageRequest,
    ) -> Result<SourcePage, SourceError> {
        let request = self
            .http
            .client()
            .get(&self.base_url)
            .bearer_auth(&self.api_key)
            .query(&params.query_pairs(page));
        let body = self.http.execute_json(SOURCE_ID, request).await?;
        Self::parse_page(&body, page)
    }

    fn normalize(&self, raw: JsonValue) -> Result<NormalizedRecord, MappingError> {
        let opportunity_id = json_opt_text(&raw, &["noticeId", "opportunity_id", "id"]).ok_or(
            MappingError::MissingKey {
                source_id: SOURCE_ID,
                field: "noticeId",
            },
        )?;

        let estimated_value = json_path(&raw, &["award", "amount"])
            .and_then(|v| match v {
                JsonValue::Number(n) => n.as_f64(),
                JsonValue::String(s) => s.replace(',', "").parse().ok(),
                _ => None,
            })
            .unwrap_or_else(|| json_number(&raw, &["estimated_value", "estimatedValue"]));

        Ok(NormalizedRecord::ContractOpportunity(ContractOpportunity {
            opportunity_id,
            title: json_text(&raw, &["title"]),
            description: json_text(&raw, &["description"]),
            agency: json_text(&raw, &["fullParentPathName", "department", "agency"]),
            status: status_of(&raw),
            posted_date: json_date(&raw, &["postedDate", "posted_date"]),
            response_deadline: json_datetime(&raw, &["responseDeadLine", "response_deadline"]),
            estimated_value,
            place_of_performance: location_text(
                raw.get("placeOfPerformance")
                    .or_else(|| raw.get("place_of_performance")),
            ),
            naics_code: json_text(&raw, &["naicsCode", "naics_code"]),
            set_aside: json_text(&raw, &["typeOfSetAsideDescription", "typeOfSetAside", "set_aside"]),
            raw_data: raw,
        }))
    }
}
