//! Collector layer: paced, retrying portal clients and the priority
//! fallback router.
//!
//! A [`Collector`] wraps one external listing source. Every response is
//! classified into an explicit outcome (success, blocked, rate limited,
//! transient) so the ingestion worker can pattern-match instead of peeling
//! apart exception chains. The [`SourceRouter`] tries collectors in priority
//! order and absorbs duplicate queries with a short-TTL cache.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{StatusCode, Url};
use roost_core::{ListingDocument, ListingDraft, SearchQuery};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info_span, warn};

pub const CRATE_NAME: &str = "roost-collect";

/// Fallback when a 429 carries no usable Retry-After header.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum CollectorError {
    /// Anti-automation challenge detected. Non-retryable within the call.
    #[error("anti-automation challenge detected")]
    Blocked,
    /// Explicit throttling that survived the retry ceiling.
    #[error("rate limited after {retries} retries")]
    RateLimited { retries: usize },
    /// Timeout or connection failure that survived the retry ceiling.
    #[error("transient failure: {0}")]
    Transient(String),
    /// The source answered but the payload was not a listing response.
    #[error("unparseable response: {0}")]
    Parse(String),
}

impl CollectorError {
    /// Whether the worker should cool down before the next segment.
    pub fn is_throttle_signal(&self) -> bool {
        matches!(
            self,
            CollectorError::Blocked | CollectorError::RateLimited { .. }
        )
    }
}

#[async_trait]
pub trait Collector: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch(&self, query: &SearchQuery) -> Result<Vec<ListingDraft>, CollectorError>;
}

/// Exponential backoff with a cap, indexed by retry attempt.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Enforces a minimum interval between requests, independent of how many
/// tasks share the collector. The lock is held across the sleep so callers
/// queue up instead of racing the clock.
#[derive(Debug)]
pub struct RequestPacer {
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl RequestPacer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_request: Mutex::new(None),
        }
    }

    pub async fn wait(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// Markers that positively identify a challenge page. Mere references to
/// anti-bot tooling (script includes, vendor JS) are deliberately absent:
/// plenty of ordinary listing pages load them as boilerplate.
const CHALLENGE_MARKERS: &[&str] = &[
    "cf-challenge-form",
    "id=\"challenge-form\"",
    "geo.captcha-delivery.com",
    "_Incapsula_Resource",
    "Pardon Our Interruption",
    "Request unsuccessful. Incapsula incident",
];

pub fn body_is_challenge(body: &str) -> bool {
    CHALLENGE_MARKERS.iter().any(|marker| body.contains(marker))
}

/// Wire shape of the portal search endpoint.
#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<RawListing>,
}

#[derive(Debug, Deserialize)]
struct RawListing {
    id: String,
    #[serde(default)]
    price: Option<i64>,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    postal_code: Option<String>,
    #[serde(default)]
    bedrooms: Option<u32>,
    #[serde(default)]
    bathrooms: Option<u32>,
    #[serde(default)]
    area_sqft: Option<u32>,
    #[serde(default)]
    year_built: Option<u32>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    photos: Vec<String>,
    #[serde(flatten)]
    extra: serde_json::Map<String, JsonValue>,
}

fn drafts_from_payload(
    source_id: &str,
    query: &SearchQuery,
    body: &str,
) -> Result<Vec<ListingDraft>, CollectorError> {
    let payload: SearchResponse =
        serde_json::from_str(body).map_err(|e| CollectorError::Parse(e.to_string()))?;
    let fetched_at = Utc::now();

    Ok(payload
        .results
        .into_iter()
        .map(|raw| ListingDraft {
            id: raw.id,
            source: source_id.to_string(),
            region: raw.region.or_else(|| Some(query.region.clone())),
            category: query.category,
            price: raw.price,
            document: ListingDocument {
                address: raw.address,
                postal_code: raw.postal_code,
                bedrooms: raw.bedrooms,
                bathrooms: raw.bathrooms,
                area_sqft: raw.area_sqft,
                year_built: raw.year_built,
                description: raw.description,
                photos: raw.photos,
                extra: JsonValue::Object(raw.extra),
                ..ListingDocument::default()
            },
            fetched_at,
        })
        .collect())
}

#[derive(Debug, Clone)]
pub struct HttpCollectorConfig {
    pub source_id: String,
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub min_request_interval: Duration,
    pub backoff: BackoffPolicy,
}

/// reqwest-backed collector for one portal's JSON search API.
pub struct HttpCollector {
    source_id: String,
    base_url: String,
    client: reqwest::Client,
    pacer: RequestPacer,
    backoff: BackoffPolicy,
}

impl HttpCollector {
    pub fn new(config: HttpCollectorConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            source_id: config.source_id,
            base_url: config.base_url,
            client,
            pacer: RequestPacer::new(config.min_request_interval),
            backoff: config.backoff,
        })
    }

    fn search_url(&self, query: &SearchQuery) -> Result<Url, CollectorError> {
        Url::parse_with_params(
            &format!("{}/api/v1/listings", self.base_url.trim_end_matches('/')),
            &[
                ("region", query.region.as_str()),
                ("category", query.category.as_str()),
            ],
        )
        .map_err(|e| CollectorError::Parse(format!("bad search url: {e}")))
    }

    fn retry_after_hint(headers: &reqwest::header::HeaderMap) -> Duration {
        headers
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_RETRY_AFTER)
    }
}

#[async_trait]
impl Collector for HttpCollector {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch(&self, query: &SearchQuery) -> Result<Vec<ListingDraft>, CollectorError> {
        let url = self.search_url(query)?;
        let span = info_span!("collector_fetch", source_id = %self.source_id, query = %query);
        let _guard = span.enter();

        for attempt in 0..=self.backoff.max_retries {
            self.pacer.wait().await;

            let response = match self.client.get(url.clone()).send().await {
                Ok(response) => response,
                Err(err) if err.is_timeout() || err.is_connect() || err.is_request() => {
                    if attempt < self.backoff.max_retries {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        debug!(attempt, ?delay, error = %err, "transient fetch error, backing off");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(CollectorError::Transient(err.to_string()));
                }
                Err(err) => return Err(CollectorError::Transient(err.to_string())),
            };

            let status = response.status();
            let retry_after = Self::retry_after_hint(response.headers());
            let body = response
                .text()
                .await
                .map_err(|e| CollectorError::Transient(e.to_string()))?;

            // Classification order matters: a challenge page can arrive
            // under any status code, including 200 and 429.
            if body_is_challenge(&body) {
                warn!(source_id = %self.source_id, "challenge page served, marking source blocked");
                return Err(CollectorError::Blocked);
            }

            if status == StatusCode::TOO_MANY_REQUESTS {
                if attempt < self.backoff.max_retries {
                    let delay = retry_after.max(self.backoff.delay_for_attempt(attempt));
                    debug!(attempt, ?delay, "rate limited, backing off");
                    tokio::time::sleep(delay).await;
                    continue;
                }
                return Err(CollectorError::RateLimited {
                    retries: self.backoff.max_retries,
                });
            }

            if status.is_server_error() {
                if attempt < self.backoff.max_retries {
                    tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                    continue;
                }
                return Err(CollectorError::Transient(format!(
                    "http {status} from {url}"
                )));
            }

            if !status.is_success() {
                return Err(CollectorError::Parse(format!("http {status} from {url}")));
            }

            return drafts_from_payload(&self.source_id, query, &body);
        }

        Err(CollectorError::Transient("retry ceiling exhausted".into()))
    }
}

/// All sources exhausted for one query; carries each source's failure.
#[derive(Debug)]
pub struct AggregateError {
    pub failures: Vec<(String, CollectorError)>,
}

impl AggregateError {
    pub fn has_throttle_signal(&self) -> bool {
        self.failures.iter().any(|(_, e)| e.is_throttle_signal())
    }
}

impl std::fmt::Display for AggregateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "all sources failed:")?;
        for (source_id, err) in &self.failures {
            write!(f, " [{source_id}: {err}]")?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}

struct CachedBatch {
    stored_at: Instant,
    drafts: Vec<ListingDraft>,
}

/// Tries registered collectors in ascending priority order, falling through
/// on any per-source failure. A short-TTL cache keyed by the normalized
/// query absorbs duplicate queries within a burst; entries simply expire.
pub struct SourceRouter {
    sources: Vec<(u32, Arc<dyn Collector>)>,
    cache_ttl: Duration,
    cache: Mutex<HashMap<String, CachedBatch>>,
}

impl SourceRouter {
    pub fn new(cache_ttl: Duration) -> Self {
        Self {
            sources: Vec::new(),
            cache_ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&mut self, priority: u32, collector: Arc<dyn Collector>) {
        self.sources.push((priority, collector));
        self.sources.sort_by_key(|(priority, _)| *priority);
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    fn try_order(&self, preferred: Option<&str>) -> Vec<Arc<dyn Collector>> {
        let mut order: Vec<Arc<dyn Collector>> =
            self.sources.iter().map(|(_, c)| c.clone()).collect();
        if let Some(preferred) = preferred {
            if let Some(pos) = order.iter().position(|c| c.source_id() == preferred) {
                let chosen = order.remove(pos);
                order.insert(0, chosen);
            }
        }
        order
    }

    pub async fn fetch(
        &self,
        query: &SearchQuery,
        preferred: Option<&str>,
    ) -> Result<Vec<ListingDraft>, AggregateError> {
        let key = query.normalized_key();
        {
            let cache = self.cache.lock().await;
            if let Some(hit) = cache.get(&key) {
                if hit.stored_at.elapsed() < self.cache_ttl {
                    debug!(%query, "router cache hit");
                    return Ok(hit.drafts.clone());
                }
            }
        }

        let mut failures = Vec::new();
        for collector in self.try_order(preferred) {
            match collector.fetch(query).await {
                Ok(drafts) => {
                    if !drafts.is_empty() {
                        let mut cache = self.cache.lock().await;
                        cache.insert(
                            key,
                            CachedBatch {
                                stored_at: Instant::now(),
                                drafts: drafts.clone(),
                            },
                        );
                    }
                    return Ok(drafts);
                }
                Err(err) => {
                    warn!(source_id = collector.source_id(), %query, error = %err, "source failed, falling through");
                    failures.push((collector.source_id().to_string(), err));
                }
            }
        }

        Err(AggregateError { failures })
    }
}

/// `sources.yaml` registry: which portals exist, their priorities and pacing.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub priority: u32,
    pub base_url: String,
    #[serde(default = "default_min_request_interval_ms")]
    pub min_request_interval_ms: u64,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_min_request_interval_ms() -> u64 {
    2_000
}

impl SourceRegistry {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Build a router over every enabled source, in priority order.
    pub fn build_router(
        &self,
        cache_ttl: Duration,
        timeout: Duration,
        user_agent: &str,
    ) -> anyhow::Result<SourceRouter> {
        let mut router = SourceRouter::new(cache_ttl);
        for source in self.sources.iter().filter(|s| s.enabled) {
            let collector = HttpCollector::new(HttpCollectorConfig {
                source_id: source.source_id.clone(),
                base_url: source.base_url.clone(),
                timeout,
                user_agent: Some(user_agent.to_string()),
                min_request_interval: Duration::from_millis(source.min_request_interval_ms),
                backoff: BackoffPolicy::default(),
            })
            .with_context(|| format!("building collector for {}", source.source_id))?;
            router.register(source.priority, Arc::new(collector));
        }
        Ok(router)
    }
}
