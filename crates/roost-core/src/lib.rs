//! Core domain model for Roost: listings, price history and scrape jobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "roost-core";

/// Version stamped into every [`ListingDocument`] written by this build.
pub const DOCUMENT_SCHEMA_VERSION: u32 = 1;

/// Observable lifecycle of a cached listing.
///
/// Transitions only ever advance (`active → stale → delisted`); a fresh
/// sighting resets the row to `active` through the upsert path, never
/// through a dedicated transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListingStatus {
    Active,
    Stale,
    Delisted,
}

impl ListingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListingStatus::Active => "active",
            ListingStatus::Stale => "stale",
            ListingStatus::Delisted => "delisted",
        }
    }
}

impl std::str::FromStr for ListingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ListingStatus::Active),
            "stale" => Ok(ListingStatus::Stale),
            "delisted" => Ok(ListingStatus::Delisted),
            other => Err(format!("unknown listing status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Property categories the segment matrix iterates over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyCategory {
    Condo,
    House,
    Plex,
    Land,
    Commercial,
}

impl PropertyCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            PropertyCategory::Condo => "condo",
            PropertyCategory::House => "house",
            PropertyCategory::Plex => "plex",
            PropertyCategory::Land => "land",
            PropertyCategory::Commercial => "commercial",
        }
    }
}

impl std::str::FromStr for PropertyCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "condo" => Ok(PropertyCategory::Condo),
            "house" => Ok(PropertyCategory::House),
            "plex" => Ok(PropertyCategory::Plex),
            "land" => Ok(PropertyCategory::Land),
            "commercial" => Ok(PropertyCategory::Commercial),
            other => Err(format!("unknown property category: {other}")),
        }
    }
}

/// One (region, category) unit of work; also the router's cache key via
/// [`SearchQuery::normalized_key`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SearchQuery {
    pub region: String,
    pub category: PropertyCategory,
}

impl SearchQuery {
    pub fn new(region: impl Into<String>, category: PropertyCategory) -> Self {
        Self {
            region: region.into(),
            category,
        }
    }

    /// Stable key for burst deduplication: trimmed, lowercased region plus
    /// the category tag.
    pub fn normalized_key(&self) -> String {
        format!(
            "{}:{}",
            self.region.trim().to_ascii_lowercase(),
            self.category.as_str()
        )
    }
}

impl std::fmt::Display for SearchQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.region, self.category.as_str())
    }
}

/// Versioned contract for the non-indexed listing payload. Stored as JSON
/// text; the ingestion core never inspects it beyond (de)serialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingDocument {
    pub schema_version: u32,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub postal_code: Option<String>,
    #[serde(default)]
    pub bedrooms: Option<u32>,
    #[serde(default)]
    pub bathrooms: Option<u32>,
    #[serde(default)]
    pub area_sqft: Option<u32>,
    #[serde(default)]
    pub year_built: Option<u32>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub photos: Vec<String>,
    /// Anything the source returned that has no column of its own.
    #[serde(default)]
    pub extra: JsonValue,
}

impl Default for ListingDocument {
    fn default() -> Self {
        Self {
            schema_version: DOCUMENT_SCHEMA_VERSION,
            address: None,
            postal_code: None,
            bedrooms: None,
            bathrooms: None,
            area_sqft: None,
            year_built: None,
            description: None,
            photos: Vec::new(),
            extra: JsonValue::Null,
        }
    }
}

/// Freshly fetched listing, handed from a collector into the merge engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingDraft {
    /// Stable, source-derived identity (e.g. the portal's listing number).
    pub id: String,
    pub source: String,
    pub region: Option<String>,
    pub category: PropertyCategory,
    /// CAD dollars; absent when the source withholds or obscures the price.
    pub price: Option<i64>,
    pub document: ListingDocument,
    pub fetched_at: DateTime<Utc>,
}

/// Durable cached listing row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: String,
    pub source: String,
    pub region: Option<String>,
    pub category: PropertyCategory,
    pub price: Option<i64>,
    pub document: ListingDocument,
    pub fetched_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub status: ListingStatus,
}

/// Append-only price history entry. Written only when a cached non-null
/// price transitions to a different non-null price.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceChange {
    pub listing_id: String,
    pub old_price: i64,
    pub new_price: i64,
    pub recorded_at: DateTime<Utc>,
}

/// Structured progress event inside a scrape job's step log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepEvent {
    pub at: DateTime<Utc>,
    pub label: String,
    pub detail: String,
}

impl StepEvent {
    pub fn now(label: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            label: label.into(),
            detail: detail.into(),
        }
    }
}

/// One ingestion cycle's audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeJob {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub total_listings: i64,
    pub total_enriched: i64,
    pub errors: Vec<String>,
    pub step_log: Vec<StepEvent>,
    pub duration_seconds: Option<f64>,
}

impl ScrapeJob {
    /// A job is running the instant it is created.
    pub fn begin() -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            completed_at: None,
            status: JobStatus::Running,
            total_listings: 0,
            total_enriched: 0,
            errors: Vec::new(),
            step_log: Vec::new(),
            duration_seconds: None,
        }
    }
}
