use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};

const MAX_ERROR_BODY_CHARS: usize = 4096;

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    /// Applied to sources without an entry in `source_rate_limits`.
    pub token_bucket: Option<TokenBucketConfig>,
    pub source_rate_limits: HashMap<String, TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            global_concurrency: 16,
            per_source_concurrency: 2,
            token_bucket: None,
            source_rate_limits: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl TokenBucketConfig {
    /// Bucket allowing a burst of `requests` and refilling evenly over one minute.
    pub fn per_minute(requests: u32) -> Self {
        let requests = requests.max(1);
        Self {
            capacity: requests,
            refill_every: Duration::from_millis(60_000 / u64::from(requests)),
        }
    }
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(config: TokenBucketConfig) -> Self {
        Self {
            capacity: config.capacity.max(1),
            refill_every: config.refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: config.capacity.max(1),
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if self.refill_every.as_millis() > 0 && elapsed >= self.refill_every {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                state.last_refill += self.refill_every.saturating_mul(refills);
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every.saturating_sub(elapsed);
            drop(state);
            tokio::time::sleep(sleep_for.max(Duration::from_millis(1))).await;
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transport error for {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("provider returned http {status} for {url}: {body}")]
    Provider { status: u16, url: String, body: String },
    #[error("invalid json from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Shared HTTP client for every source client.
///
/// Requests are never retried here; a failed request is retried by the next cycle.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    default_bucket: Option<TokenBucketConfig>,
    source_rate_limits: HashMap<String, TokenBucketConfig>,
    buckets: Mutex<HashMap<String, Arc<SimpleTokenBucket>>>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            default_bucket: config.token_bucket,
            source_rate_limits: config.source_rate_limits,
            buckets: Mutex::new(HashMap::new()),
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    async fn token_bucket(&self, source_id: &str) -> Option<Arc<SimpleTokenBucket>> {
        let config = self
            .source_rate_limits
            .get(source_id)
            .copied()
            .or(self.default_bucket)?;
        let mut map = self.buckets.lock().await;
        Some(
            map.entry(source_id.to_string())
                .or_insert_with(|| Arc::new(SimpleTokenBucket::new(config)))
                .clone(),
        )
    }

    /// Send a prepared request and decode a successful body as JSON.
    pub async fn execute_json(
        &self,
        source_id: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<JsonValue, FetchError> {
        let request = request.build().map_err(|source| FetchError::Transport {
            url: "<unbuilt request>".to_string(),
            source,
        })?;
        let url = request.url().to_string();

        // Closed semaphores are never produced by this type, so acquisition only waits.
        let _global = self.global_limit.acquire().await.ok();
        let per_source = self.per_source_semaphore(source_id).await;
        let _source = per_source.acquire().await.ok();

        if let Some(bucket) = self.token_bucket(source_id).await {
            bucket.take().await;
        }

        let span = info_span!("http_fetch", source_id, method = %request.method(), url = %url);
        async {
            let resp = self
                .client
                .execute(request)
                .await
                .map_err(|source| FetchError::Transport {
                    url: url.clone(),
                    source,
                })?;
            let status = resp.status();
            let body = resp.text().await.map_err(|source| FetchError::Transport {
                url: url.clone(),
                source,
            })?;
            debug!(status = status.as_u16(), bytes = body.len(), "provider responded");

            if !status.is_success() {
                return Err(FetchError::Provider {
                    status: status.as_u16(),
                    url: url.clone(),
                    body: truncate_chars(&body, MAX_ERROR_BODY_CHARS),
                });
            }

            serde_json::from_str(&body).map_err(|source| FetchError::Decode {
                url: url.clone(),
                source,
            })
        }
        .instrument(span)
        .await
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
