use std::sync::Arc;

use async_trait::async_trait;
use fedspend_core::ContractorProfile;
use fedspend_storage::HttpFetcher;
use serde_json::Value as JsonValue;

use crate::{json_opt_text, json_path, json_text, records_at, SourceError};

const SOURCE_ID: &str = "sam-entities";
const DEFAULT_BASE_URL: &str = "https://api.sam.gov/entity-information/v3/entities";

/// Resolves a contractor identifier against an entity registry.
#[async_trait]
pub trait ContractorEnricher: Send + Sync {
    /// `Ok(None)` when the registry has no entity for `uei`.
    async fn lookup(&self, uei: &str) -> Result<Option<ContractorProfile>, SourceError>;
}

#[derive(Debug, Clone)]
pub struct SamEntityClient {
    http: Arc<HttpFetcher>,
    base_url: String,
    api_key: String,
}

impl SamEntityClient {
    /// Rate limits for entity lookups are keyed by this id.
    pub const SOURCE_ID: &'static str = SOURCE_ID;

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

    pub fn parse_entity(body: &JsonValue, uei: &str) -> Result<Option<ContractorProfile>, SourceError> {
        let entities = records_at(SOURCE_ID, body, &["entityData"])?;
        let Some(entity) = entities.into_iter().next() else {
            return Ok(None);
        };
        let registration = json_path(&entity, &["entityRegistration"])
            .cloned()
            .unwrap_or(JsonValue::Null);
        Ok(Some(ContractorProfile {
            uei: json_opt_text(&registration, &["ueiSAM"]).unwrap_or_else(|| uei.to_string()),
            legal_business_name: json_text(&registration, &["legalBusinessName"]),
            cage_code: json_opt_text(&registration, &["cageCode"]),
            registration_status: json_text(&registration, &["registrationStatus"]),
            raw_data: entity,
        }))
    }
}

#[async_trait]
impl ContractorEnricher for SamEntityClient {
    async fn lookup(&self, uei: &str) -> Result<Option<ContractorProfile>, SourceError> {
        let request = self
            .http
            .client()
            .get(&self.base_url)
            .query(&[("api_key", self.api_key.as_str()), ("ueiSAM", uei)]);
        let body = self.http.execute_json(SOURCE_ID, request).await?;
        Self::parse_entity(&body, uei)
    }
}
