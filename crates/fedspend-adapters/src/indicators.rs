use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use fedspend_core::{EconomicIndicatorPoint, EntityKind, NormalizedRecord};
use fedspend_storage::HttpFetcher;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::{
    json_date, json_opt_text, json_text, records_at, MappingError, PageRequest, SourceClient,
    SourceError, SourcePage,
};

const SOURCE_ID: &str = "fred-indicators";
const DEFAULT_BASE_URL: &str = "https://api.stlouisfed.org/fred/series/observations";

/// One economic series over a date window. Units and classification come from the
/// registry since the observations endpoint does not echo them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndicatorQuery {
    pub series_id: String,
    #[serde(default)]
    pub indicator_type: String,
    #[serde(default)]
    pub units: String,
    #[serde(default)]
    pub seasonal_adjustment: String,
    #[serde(default)]
    pub start: Option<NaiveDate>,
    #[serde(default)]
    pub end: Option<NaiveDate>,
}

/// Series observations. Single response per query; the API key travels as a query param.
#[derive(Debug, Clone)]
pub struct FredIndicatorsClient {
    http: Arc<HttpFetcher>,
    base_url: String,
    api_key: String,
}

impl FredIndicatorsClient {
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

    /// Stamps each observation with its series context so it can be mapped on its own.
    pub fn parse_page(body: &JsonValue, query: &IndicatorQuery) -> Result<SourcePage, SourceError> {
        let units = if query.units.is_empty() {
            json_text(body, &["units"])
        } else {
            query.units.clone()
        };
        let records = records_at(SOURCE_ID, body, &["observations"])?
            .into_iter()
            .map(|mut observation| {
                if let JsonValue::Object(map) = &mut observation {
                    map.insert("series_id".into(), query.series_id.clone().into());
                    map.insert("units".into(), units.clone().into());
                    map.insert("indicator_type".into(), query.indicator_type.clone().into());
                    map.insert(
                        "seasonal_adjustment".into(),
                        query.seasonal_adjustment.clone().into(),
                    );
                }
                observation
            })
            .collect::<Vec<_>>();
        debug!(
            source_id = SOURCE_ID,
            series_id = %query.series_id,
            observations = records.len(),
            "page parsed"
        );
        Ok(SourcePage {
            records,
            has_more: false,
        })
    }
}

/// FRED reports missing observations as ".".
fn observation_value(raw: &JsonValue) -> Option<f64> {
    match raw.get("value")? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|v| v.is_finite())
}

#[async_trait]
impl SourceClient for FredIndicatorsClient {
    type Params = IndicatorQuery;

    fn source_id(&self) -> &'static str {
        SOURCE_ID
    }

    fn entity_kind(&self) -> EntityKind {
        EntityKind::EconomicIndicators
    }

    async fn fetch_page(
        &self,
        params: &IndicatorQuery,
        _page: PageRequest,
    ) -> Result<SourcePage, SourceError> {
        let mut query = vec![
            ("series_id", params.series_id.clone()),
            ("api_key", self.api_key.clone()),
            ("file_type", "json".to_string()),
        ];
        if let Some(start) = params.start {
            query.push(("observation_start", start.format("%Y-%m-%d").to_string()));
        }
        if let Some(end) = params.end {
            query.push(("observation_end", end.format("%Y-%m-%d").to_string()));
        }
        let request = self.http.client().get(&self.base_url).query(&query);
        let body = self.http.execute_json(SOURCE_ID, request).await?;
        Self::parse_page(&body, params)
    }

    fn normalize(&self, raw: JsonValue) -> Result<NormalizedRecord, MappingError> {
        let series_id = json_opt_text(&raw, &["series_id"]).ok_or(MappingError::MissingKey {
            source_id: SOURCE_ID,
            field: "series_id",
        })?;
        let date = json_date(&raw, &["date"]).ok_or(MappingError::MissingKey {
            source_id: SOURCE_ID,
            field: "date",
        })?;

        Ok(NormalizedRecord::EconomicIndicator(EconomicIndicatorPoint {
            series_id,
            date,
            value: observation_value(&raw),
            indicator_type: json_text(&raw, &["indicator_type"]),
            units: json_text(&raw, &["units"]),
            seasonally_adjusted: json_text(&raw, &["seasonal_adjustment"]),
            raw_data: raw,
        }))
    }
}
