//! Source client contracts + provider implementations.

mod awards;
mod contractors;
mod filings;
mod indicators;
mod opportunities;
mod subawards;

use std::fs;
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use fedspend_core::{EntityKind, NormalizedRecord};
use fedspend_storage::FetchError;
use serde_json::Value as JsonValue;
use thiserror::Error;

pub use awards::{AwardSearchParams, UsaSpendingAwardsClient};
pub use contractors::{ContractorEnricher, SamEntityClient};
pub use filings::{group_company_facts, CompanyFactsQuery, SecCompanyFactsClient};
pub use indicators::{FredIndicatorsClient, IndicatorQuery};
pub use opportunities::{OpportunitySearchParams, SamOpportunitiesClient};
pub use subawards::{FsrsSubawardsClient, SubawardQuery};

pub const CRATE_NAME: &str = "fedspend-adapters";

/// One page request. Pages are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub limit: u32,
}

impl PageRequest {
    pub fn first(limit: u32) -> Self {
        Self {
            page: 1,
            limit: limit.max(1),
        }
    }

    pub fn next(self) -> Self {
        Self {
            page: self.page + 1,
            limit: self.limit,
        }
    }
}

/// Raw provider records from one page plus the provider's continuation signal.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SourcePage {
    pub records: Vec<JsonValue>,
    pub has_more: bool,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{source_id}: unexpected response shape: {message}")]
    Shape {
        source_id: &'static str,
        message: String,
    },
    #[error("configuration error: {0}")]
    Config(String),
}

/// A single raw record that could not be mapped. Never aborts the page it came from.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MappingError {
    #[error("{source_id}: record has no `{field}`")]
    MissingKey {
        source_id: &'static str,
        field: &'static str,
    },
    #[error("{source_id}: {message}")]
    Malformed {
        source_id: &'static str,
        message: String,
    },
}

/// One external provider: request shape, pagination convention and record mapping.
///
/// `normalize` only fails when the natural key cannot be derived; every other field
/// degrades to an empty string, zero or `None`.
#[async_trait]
pub trait SourceClient: Send + Sync {
    type Params: Send + Sync;

    fn source_id(&self) -> &'static str;
    fn entity_kind(&self) -> EntityKind;

    async fn fetch_page(
        &self,
        params: &Self::Params,
        page: PageRequest,
    ) -> Result<SourcePage, SourceError>;

    fn normalize(&self, raw: JsonValue) -> Result<NormalizedRecord, MappingError>;
}

pub fn read_json_fixture(path: impl AsRef<Path>) -> anyhow::Result<JsonValue> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

pub(crate) fn json_path<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    Some(cur)
}

fn scalar_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// First non-empty scalar among `keys`, rendered as text.
pub(crate) fn json_opt_text(value: &JsonValue, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| value.get(*key))
        .find_map(scalar_text)
}

pub(crate) fn json_text(value: &JsonValue, keys: &[&str]) -> String {
    json_opt_text(value, keys).unwrap_or_default()
}

/// Numbers arrive as JSON numbers or as strings, sometimes with thousands separators.
pub(crate) fn json_opt_number(value: &JsonValue, keys: &[&str]) -> Option<f64> {
    keys.iter()
        .filter_map(|key| value.get(*key))
        .find_map(|v| match v {
            JsonValue::Number(n) => n.as_f64(),
            JsonValue::String(s) => s.trim().replace(',', "").parse::<f64>().ok(),
            _ => None,
        })
        .filter(|n| n.is_finite())
}

pub(crate) fn json_number(value: &JsonValue, keys: &[&str]) -> f64 {
    json_opt_number(value, keys).unwrap_or(0.0)
}

/// Accepts `YYYY-MM-DD`, `MM/DD/YYYY` and timestamps whose first ten characters are a date.
pub(crate) fn parse_date(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return Some(date);
    }
    if let Ok(date) = NaiveDate::parse_from_str(text, "%m/%d/%Y") {
        return Some(date);
    }
    text.get(..10)
        .and_then(|prefix| NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok())
}

pub(crate) fn json_date(value: &JsonValue, keys: &[&str]) -> Option<NaiveDate> {
    json_opt_text(value, keys).and_then(|s| parse_date(&s))
}

/// RFC 3339 timestamps, falling back to midnight UTC for a bare date.
pub(crate) fn json_datetime(value: &JsonValue, keys: &[&str]) -> Option<DateTime<Utc>> {
    let text = json_opt_text(value, keys)?;
    if let Ok(ts) = DateTime::parse_from_rfc3339(&text) {
        return Some(ts.with_timezone(&Utc));
    }
    parse_date(&text)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Renders a location that is either free text or a nested `{city, state, zip, country}`
/// object, where each part may itself be `{code, name}`.
pub(crate) fn location_text(value: Option<&JsonValue>) -> String {
    let Some(value) = value else {
        return String::new();
    };
    if let Some(text) = scalar_text(value) {
        return text;
    }
    let part = |key: &str| -> Option<String> {
        let v = value.get(key)?;
        scalar_text(v)
            .or_else(|| json_opt_text(v, &["name"]))
            .or_else(|| json_opt_text(v, &["code"]))
    };
    ["streetAddress", "street", "city", "state", "zip", "country"]
        .iter()
        .filter_map(|key| part(key))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Extracts the record array from the first present key, failing on a missing or
/// non-array value.
pub(crate) fn records_at(
    source_id: &'static str,
    body: &JsonValue,
    keys: &[&str],
) -> Result<Vec<JsonValue>, SourceError> {
    for key in keys {
        match body.get(*key) {
            Some(JsonValue::Array(items)) => return Ok(items.clone()),
            Some(JsonValue::Null) | None => continue,
            Some(_) => {
                return Err(SourceError::Shape {
                    source_id,
                    message: format!("`{key}` is not an array"),
                })
            }
        }
    }
    Err(SourceError::Shape {
        source_id,
        message: format!("none of {keys:?} present"),
    })
}

/// Continuation signal when the provider only reports a total.
pub(crate) fn more_from_total(total: Option<f64>, page: PageRequest, returned: usize) -> bool {
    match total {
        Some(total) => f64::from(page.page) * f64::from(page.limit) < total,
        None => returned >= page.limit as usize,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numbers_accept_strings_with_separators() {
        let value = json!({ "a": "1,250,000.50", "b": 12, "c": "n/a" });
        assert_eq!(json_number(&value, &["a"]), 1_250_000.5);
        assert_eq!(json_number(&value, &["missing", "b"]), 12.0);
        assert_eq!(json_number(&value, &["c"]), 0.0);
    }

    #[test]
    fn text_skips_blank_and_null_alternatives() {
        let value = json!({ "a": "  ", "b": null, "c": "Acme" });
        assert_eq!(json_text(&value, &["a", "b", "c"]), "Acme");
        assert_eq!(json_text(&value, &["zzz"]), "");
    }

    #[test]
    fn dates_accept_common_provider_formats() {
        let expected = NaiveDate::from_ymd_opt(2025, 3, 14);
        assert_eq!(parse_date("2025-03-14"), expected);
        assert_eq!(parse_date("03/14/2025"), expected);
        assert_eq!(parse_date("2025-03-14T10:00:00-04:00"), expected);
        assert_eq!(parse_date("soon"), None);
    }

    #[test]
    fn datetimes_fall_back_to_midnight() {
        let value = json!({ "d": "2025-03-14", "t": "2025-03-14T10:00:00-04:00" });
        assert_eq!(
            json_datetime(&value, &["d"]).map(|d| d.to_rfc3339()),
            Some("2025-03-14T00:00:00+00:00".to_string())
        );
        assert_eq!(
            json_datetime(&value, &["t"]).map(|d| d.to_rfc3339()),
            Some("2025-03-14T14:00:00+00:00".to_string())
        );
    }

    #[test]
    fn nested_locations_are_flattened() {
        let value = json!({
            "city": { "code": "12345", "name": "Norfolk" },
            "state": { "code": "VA", "name": "Virginia" },
            "country": { "code": "USA" }
        });
        assert_eq!(location_text(Some(&value)), "Norfolk, Virginia, USA");
        assert_eq!(location_text(Some(&json!("Remote"))), "Remote");
        assert_eq!(location_text(None), "");
    }

    #[test]
    fn record_arrays_must_be_arrays() {
        let body = json!({ "data": [1, 2], "results": "oops" });
        assert_eq!(records_at("t", &body, &["data"]).unwrap().len(), 2);
        assert!(records_at("t", &body, &["results"]).is_err());
        assert!(records_at("t", &body, &["missing"]).is_err());
    }

    #[test]
    fn totals_drive_continuation_when_present() {
        let page = PageRequest { page: 2, limit: 100 };
        assert!(more_from_total(Some(201.0), page, 100));
        assert!(!more_from_total(Some(200.0), page, 100));
        assert!(more_from_total(None, page, 100));
        assert!(!more_from_total(None, page, 99));
    }
}
