use std::sync::Arc;

use async_trait::async_trait;
use fedspend_core::{EntityKind, NormalizedRecord, Subaward};
use fedspend_storage::HttpFetcher;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::{
    json_date, json_number, json_opt_number, json_opt_text, json_text, location_text,
    more_from_total, records_at, MappingError, PageRequest, SourceClient, SourceError,
    SourcePage,
};

const SOURCE_ID: &str = "fsrs-subawards";
const DEFAULT_BASE_URL: &str = "https://api.fsrs.gov/v1/subawards";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubawardQuery {
    pub prime_award_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FsrsSubawardsClient {
    http: Arc<HttpFetcher>,
    base_url: String,
    api_key: String,
}

impl FsrsSubawardsClient {
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
        let records = records_at(SOURCE_ID, body, &["results", "data", "subawards"])?;
        let has_more = match body.get("has_more").and_then(JsonValue::as_bool) {
            Some(flag) => flag,
            None => more_from_total(
                json_opt_number(body, &["total", "total_records"]),
                page,
                records.len(),
            ),
        };
        debug!(source_id = SOURCE_ID, page = page.page, records = records.len(), has_more, "page parsed");
        Ok(SourcePage { records, has_more })
    }
}

#[async_trait]
impl SourceClient for FsrsSubawardsClient {
    type Params = SubawardQuery;

    fn source_id(&self) -> &'static str {
        SOURCE_ID
    }

    fn entity_kind(&self) -> EntityKind {
        EntityKind::Subawards
    }

    async fn fetch_page(
        &self,
        params: &SubawardQuery,
        page: PageRequest,
    ) -> Result<SourcePage, SourceError> {
        let mut query = vec![
            ("page", page.page.to_string()),
            ("limit", page.limit.to_string()),
        ];
        if let Some(prime) = params.prime_award_id.as_deref().filter(|p| !p.is_empty()) {
            query.push(("prime_award_id", prime.to_string()));
        }
        let request = self
            .http
            .client()
            .get(&self.base_url)
            .bearer_auth(&self.api_key)
            .query(&query);
        let body = self.http.execute_json(SOURCE_ID, request).await?;
        Self::parse_page(&body, page)
    }

    fn normalize(&self, raw: JsonValue) -> Result<NormalizedRecord, MappingError> {
        let subaward_id = json_opt_text(&raw, &["subaward_id", "subaward_number", "id"]).ok_or(
            MappingError::MissingKey {
                source_id: SOURCE_ID,
                field: "subaward_id",
            },
        )?;

        Ok(NormalizedRecord::Subaward(Subaward {
            subaward_id,
            prime_award_id: json_text(&raw, &["prime_award_id", "prime_award_piid"]),
            recipient_name: json_text(&raw, &["recipient_name", "subawardee_name"]),
            recipient_address: location_text(
                raw.get("recipient_address")
                    .or_else(|| raw.get("subawardee_address")),
            ),
            amount: json_number(&raw, &["amount", "subaward_amount"]),
            description: json_text(&raw, &["description", "subaward_description"]),
            place_of_performance: location_text(raw.get("place_of_performance")),
            period_of_performance_start: json_date(
                &raw,
                &["period_of_performance_start", "start_date"],
            ),
            period_of_performance_end: json_date(&raw, &["period_of_performance_end", "end_date"]),
            raw_data: raw,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn explicit_flag_wins_over_totals() {
        let body = json!({ "results": [], "has_more": true, "total": 0 });
        let page = FsrsSubawardsClient::parse_page(&body, PageRequest::first(10)).unwrap();
        assert!(page.has_more);

        let body = json!({ "data": [{}, {}], "total": 2 });
        let page = FsrsSubawardsClient::parse_page(&body, PageRequest::first(2)).unwrap();
        assert!(!page.has_more);
    }
}
