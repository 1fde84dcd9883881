use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use fedspend_core::{CompanyFiling, CompanyFinancialMetric, EntityKind, NormalizedRecord};
use fedspend_storage::HttpFetcher;
use reqwest::header::USER_AGENT;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use tracing::debug;

use crate::{
    json_date, json_number, json_opt_number, json_opt_text, json_text, MappingError,
    PageRequest, SourceClient, SourceError, SourcePage,
};

const SOURCE_ID: &str = "sec-companyfacts";
const DEFAULT_BASE_URL: &str = "https://data.sec.gov/api/xbrl/companyfacts";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanyFactsQuery {
    pub cik: String,
    /// Filing forms to keep, e.g. `10-K`. Empty keeps every form.
    #[serde(default)]
    pub forms: Vec<String>,
    /// Metric names to keep. Empty keeps every metric.
    #[serde(default)]
    pub metrics: Vec<String>,
}

/// Company facts for one CIK. The provider rejects requests without an identifying
/// user agent carrying a contact address.
#[derive(Debug, Clone)]
pub struct SecCompanyFactsClient {
    http: Arc<HttpFetcher>,
    base_url: String,
    user_agent: String,
}

impl SecCompanyFactsClient {
    pub fn new(http: Arc<HttpFetcher>, contact_email: &str) -> Self {
        Self {
            http,
            base_url: DEFAULT_BASE_URL.to_string(),
            user_agent: format!(
                "fedspend-collector/{} ({contact_email})",
                env!("CARGO_PKG_VERSION")
            ),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn parse_page(body: &JsonValue, query: &CompanyFactsQuery) -> Result<SourcePage, SourceError> {
        if !body.get("facts").is_some_and(JsonValue::is_object) {
            return Err(SourceError::Shape {
                source_id: SOURCE_ID,
                message: "`facts` object missing".to_string(),
            });
        }
        let records = group_company_facts(body, &query.forms, &query.metrics);
        debug!(source_id = SOURCE_ID, cik = %query.cik, filings = records.len(), "company facts parsed");
        Ok(SourcePage {
            records,
            has_more: false,
        })
    }
}

/// Zero-padded ten digit CIK, the form the provider uses in paths.
fn padded_cik(cik: &str) -> String {
    let digits: String = cik
        .trim()
        .trim_start_matches("CIK")
        .chars()
        .filter(char::is_ascii_digit)
        .collect();
    format!("{:0>10}", digits)
}

/// Regroups a company facts document (`facts.<taxonomy>.<metric>.units.<unit>[]`) into
/// one raw filing per accession number, each carrying its matching facts.
pub fn group_company_facts(doc: &JsonValue, forms: &[String], metrics: &[String]) -> Vec<JsonValue> {
    let cik = doc
        .get("cik")
        .and_then(|v| match v {
            JsonValue::Number(n) => Some(n.to_string()),
            JsonValue::String(s) => Some(s.clone()),
            _ => None,
        })
        .map(|c| padded_cik(&c))
        .unwrap_or_default();
    let entity_name = json_text(doc, &["entityName"]);

    let mut filings: BTreeMap<String, Map<String, JsonValue>> = BTreeMap::new();
    let Some(taxonomies) = doc.get("facts").and_then(JsonValue::as_object) else {
        return Vec::new();
    };

    for (taxonomy, concepts) in taxonomies {
        let Some(concepts) = concepts.as_object() else {
            continue;
        };
        for (metric, concept) in concepts {
            if !metrics.is_empty() && !metrics.iter().any(|m| m == metric) {
                continue;
            }
            let Some(units) = concept.get("units").and_then(JsonValue::as_object) else {
                continue;
            };
            for (unit, facts) in units {
                for fact in facts.as_array().into_iter().flatten() {
                    let Some(accn) = json_opt_text(fact, &["accn"]) else {
                        continue;
                    };
                    let form = json_text(fact, &["form"]);
                    if !forms.is_empty() && !forms.iter().any(|f| *f == form) {
                        continue;
                    }

                    let filing = filings.entry(accn.clone()).or_insert_with(|| {
                        let mut filing = Map::new();
                        filing.insert("cik".into(), cik.clone().into());
                        filing.insert("entityName".into(), entity_name.clone().into());
                        filing.insert("accn".into(), accn.clone().into());
                        filing.insert("form".into(), form.clone().into());
                        filing.insert("filed".into(), fact.get("filed").cloned().unwrap_or(JsonValue::Null));
                        filing.insert("fy".into(), fact.get("fy").cloned().unwrap_or(JsonValue::Null));
                        filing.insert("fp".into(), fact.get("fp").cloned().unwrap_or(JsonValue::Null));
                        filing.insert("facts".into(), JsonValue::Array(Vec::new()));
                        filing
                    });

                    if let Some(end) = json_opt_text(fact, &["end"]) {
                        let later = filing
                            .get("period_end")
                            .and_then(JsonValue::as_str)
                            .map_or(true, |current| end.as_str() > current);
                        if later {
                            filing.insert("period_end".into(), end.into());
                        }
                    }

                    let mut entry = fact.clone();
                    if let JsonValue::Object(map) = &mut entry {
                        map.insert("taxonomy".into(), taxonomy.clone().into());
                        map.insert("metric".into(), metric.clone().into());
                        map.insert("unit".into(), unit.clone().into());
                    }
                    if let Some(JsonValue::Array(items)) = filing.get_mut("facts") {
                        items.push(entry);
                    }
                }
            }
        }
    }

    filings.into_values().map(JsonValue::Object).collect()
}

fn metric_from_fact(fact: &JsonValue) -> CompanyFinancialMetric {
    CompanyFinancialMetric {
        metric_name: json_text(fact, &["metric"]),
        taxonomy: json_text(fact, &["taxonomy"]),
        value: json_number(fact, &["val"]),
        unit: json_text(fact, &["unit"]),
        start_date: json_date(fact, &["start"]),
        end_date: json_date(fact, &["end"]),
        raw_data: fact.clone(),
    }
}

#[async_trait]
impl SourceClient for SecCompanyFactsClient {
    type Params = CompanyFactsQuery;

    fn source_id(&self) -> &'static str {
        SOURCE_ID
    }

    fn entity_kind(&self) -> EntityKind {
        EntityKind::CompanyFilings
    }

    async fn fetch_page(
        &self,
        params: &CompanyFactsQuery,
        _page: PageRequest,
    ) -> Result<SourcePage, SourceError> {
        let url = format!("{}/CIK{}.json", self.base_url, padded_cik(&params.cik));
        let request = self
            .http
            .client()
            .get(url)
            .header(USER_AGENT, &self.user_agent);
        let body = self.http.execute_json(SOURCE_ID, request).await?;
        Self::parse_page(&body, params)
    }

    fn normalize(&self, raw: JsonValue) -> Result<NormalizedRecord, MappingError> {
        let missing = |field| MappingError::MissingKey {
            source_id: SOURCE_ID,
            field,
        };
        let cik = json_opt_text(&raw, &["cik"]).ok_or(missing("cik"))?;
        let filing_type = json_opt_text(&raw, &["form"]).ok_or(missing("form"))?;
        let filing_date = json_date(&raw, &["filed"]).ok_or(missing("filed"))?;

        let metrics = raw
            .get("facts")
            .and_then(JsonValue::as_array)
            .map(|facts| facts.iter().map(metric_from_fact).collect())
            .unwrap_or_default();

        Ok(NormalizedRecord::CompanyFiling(CompanyFiling {
            cik,
            company_name: json_text(&raw, &["entityName"]),
            filing_type,
            filing_date,
            accession_number: json_text(&raw, &["accn"]),
            period_end_date: json_date(&raw, &["period_end"]),
            fiscal_year: json_opt_number(&raw, &["fy"]).map(|fy| fy as i32),
            fiscal_period: json_text(&raw, &["fp"]),
            metrics,
            raw_data: raw,
        }))
    }
}
