//! Durable listing cache for Roost: the merge engine, lifecycle sweeps and
//! scrape-job history.
//!
//! Two backends implement [`ListingStore`]: [`PgStore`] over sqlx/Postgres
//! for production, and [`MemoryStore`] for tests. Both enforce the same
//! merge semantics; the memory backend is the executable reference for them.

use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use roost_core::{
    Listing, ListingDraft, ListingStatus, PriceChange, PropertyCategory, ScrapeJob,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{QueryBuilder, Row};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "roost-store";

/// How far back `include_stale` widens the read window.
pub const STALE_READ_WINDOW_DAYS: i64 = 7;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("document serialization: {0}")]
    Document(#[from] serde_json::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("scrape job {0} not found")]
    JobNotFound(Uuid),
}

/// Read-side filter for cached listings.
#[derive(Debug, Clone, Default)]
pub struct ListingFilter {
    pub region: Option<String>,
    pub categories: Vec<PropertyCategory>,
    pub min_price: Option<i64>,
    pub max_price: Option<i64>,
    /// Widens the freshness predicate to also admit rows seen within the
    /// last [`STALE_READ_WINDOW_DAYS`], regardless of status. That is a
    /// superset of stale/delisted: expired rows the sweeps have not
    /// demoted yet stay readable instead of blinking out between passes.
    pub include_stale: bool,
    pub limit: Option<i64>,
}

/// Per (region, category) aggregate over non-expired rows.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct SegmentStat {
    pub region: Option<String>,
    pub category: PropertyCategory,
    pub count: i64,
    pub oldest_fetch: DateTime<Utc>,
    pub newest_fetch: DateTime<Utc>,
}

#[async_trait]
pub trait ListingStore: Send + Sync {
    /// Insert-or-update a batch of freshly fetched listings.
    ///
    /// Per draft: a [`PriceChange`] is appended iff a prior price exists,
    /// the new price is non-null and the two differ; the row is then
    /// overwritten with `status = active`, `last_seen_at = fetched_at` and
    /// `expires_at = fetched_at + ttl`. `region` is only overwritten by a
    /// non-null value and `first_seen_at` is set once on insert.
    ///
    /// Returns the number of listings written; an empty batch is `Ok(0)`.
    async fn upsert_batch(
        &self,
        drafts: &[ListingDraft],
        ttl: Duration,
    ) -> Result<usize, StoreError>;

    /// Non-expired listings matching `filter`, ordered by price ascending
    /// (unpriced rows last).
    async fn query_listings(&self, filter: &ListingFilter) -> Result<Vec<Listing>, StoreError>;

    async fn get_listing(&self, id: &str) -> Result<Option<Listing>, StoreError>;

    /// Price history for one listing, newest first.
    async fn price_history(&self, listing_id: &str) -> Result<Vec<PriceChange>, StoreError>;

    /// Demote `active` rows not seen within `2 × ttl` to `stale`.
    async fn mark_stale(&self, ttl: Duration) -> Result<u64, StoreError>;

    /// Demote `stale` rows not seen within `threshold` to `delisted`.
    async fn mark_delisted(&self, threshold: Duration) -> Result<u64, StoreError>;

    /// Count of non-expired rows.
    async fn count_fresh(&self) -> Result<i64, StoreError>;

    async fn segment_stats(&self) -> Result<Vec<SegmentStat>, StoreError>;

    /// Newest successful fetch per category, over all rows.
    async fn newest_fetch_by_category(
        &self,
    ) -> Result<Vec<(PropertyCategory, DateTime<Utc>)>, StoreError>;

    async fn insert_job(&self, job: &ScrapeJob) -> Result<(), StoreError>;

    /// Overwrite a job's status, counts, errors, step log and timing.
    async fn update_job(&self, job: &ScrapeJob) -> Result<(), StoreError>;

    /// Most recent jobs, newest first.
    async fn recent_jobs(&self, limit: i64) -> Result<Vec<ScrapeJob>, StoreError>;

    /// Mark jobs still `running` after `max_age` as `failed`. Returns the
    /// number of jobs corrected.
    async fn reap_stuck_jobs(&self, max_age: Duration) -> Result<u64, StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryInner {
    listings: HashMap<String, Listing>,
    history: Vec<PriceChange>,
    jobs: Vec<ScrapeJob>,
}

/// Map-backed store with the full merge semantics. Not durable.
#[derive(Default)]
pub struct MemoryStore {
    inner: tokio::sync::Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ListingStore for MemoryStore {
    async fn upsert_batch(
        &self,
        drafts: &[ListingDraft],
        ttl: Duration,
    ) -> Result<usize, StoreError> {
        if drafts.is_empty() {
            return Ok(0);
        }

        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        for draft in drafts {
            let seen_at = draft.fetched_at;
            match inner.listings.get_mut(&draft.id) {
                Some(prior) => {
                    if let (Some(old), Some(new)) = (prior.price, draft.price) {
                        if old != new {
                            inner.history.push(PriceChange {
                                listing_id: draft.id.clone(),
                                old_price: old,
                                new_price: new,
                                recorded_at: seen_at,
                            });
                        }
                    }
                    prior.source = draft.source.clone();
                    prior.category = draft.category;
                    prior.price = draft.price;
                    prior.document = draft.document.clone();
                    prior.fetched_at = seen_at;
                    prior.expires_at = seen_at + ttl;
                    prior.last_seen_at = seen_at;
                    prior.status = ListingStatus::Active;
                    if draft.region.is_some() {
                        prior.region = draft.region.clone();
                    }
                }
                None => {
                    inner.listings.insert(
                        draft.id.clone(),
                        Listing {
                            id: draft.id.clone(),
                            source: draft.source.clone(),
                            region: draft.region.clone(),
                            category: draft.category,
                            price: draft.price,
                            document: draft.document.clone(),
                            fetched_at: seen_at,
                            expires_at: seen_at + ttl,
                            first_seen_at: seen_at,
                            last_seen_at: seen_at,
                            status: ListingStatus::Active,
                        },
                    );
                }
            }
        }
        Ok(drafts.len())
    }

    async fn query_listings(&self, filter: &ListingFilter) -> Result<Vec<Listing>, StoreError> {
        let now = Utc::now();
        let stale_floor = now - Duration::days(STALE_READ_WINDOW_DAYS);
        let inner = self.inner.lock().await;

        let mut rows: Vec<Listing> = inner
            .listings
            .values()
            .filter(|l| {
                l.expires_at > now || (filter.include_stale && l.last_seen_at > stale_floor)
            })
            .filter(|l| match &filter.region {
                Some(region) => l.region.as_deref() == Some(region.as_str()),
                None => true,
            })
            .filter(|l| filter.categories.is_empty() || filter.categories.contains(&l.category))
            .filter(|l| match (filter.min_price, l.price) {
                (Some(min), Some(price)) => price >= min,
                (Some(_), None) => false,
                (None, _) => true,
            })
            .filter(|l| match (filter.max_price, l.price) {
                (Some(max), Some(price)) => price <= max,
                (Some(_), None) => false,
                (None, _) => true,
            })
            .cloned()
            .collect();

        rows.sort_by(|a, b| match (a.price, b.price) {
            (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.id.cmp(&b.id)),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.id.cmp(&b.id),
        });

        if let Some(limit) = filter.limit {
            rows.truncate(limit.max(0) as usize);
        }
        Ok(rows)
    }

    async fn get_listing(&self, id: &str) -> Result<Option<Listing>, StoreError> {
        Ok(self.inner.lock().await.listings.get(id).cloned())
    }

    async fn price_history(&self, listing_id: &str) -> Result<Vec<PriceChange>, StoreError> {
        let inner = self.inner.lock().await;
        let mut entries: Vec<PriceChange> = inner
            .history
            .iter()
            .filter(|h| h.listing_id == listing_id)
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at));
        Ok(entries)
    }

    async fn mark_stale(&self, ttl: Duration) -> Result<u64, StoreError> {
        let cutoff = Utc::now() - (ttl * 2);
        let mut inner = self.inner.lock().await;
        let mut flipped = 0u64;
        for listing in inner.listings.values_mut() {
            if listing.status == ListingStatus::Active && listing.last_seen_at < cutoff {
                listing.status = ListingStatus::Stale;
                flipped += 1;
            }
        }
        Ok(flipped)
    }

    async fn mark_delisted(&self, threshold: Duration) -> Result<u64, StoreError> {
        let cutoff = Utc::now() - threshold;
        let mut inner = self.inner.lock().await;
        let mut flipped = 0u64;
        for listing in inner.listings.values_mut() {
            if listing.status == ListingStatus::Stale && listing.last_seen_at < cutoff {
                listing.status = ListingStatus::Delisted;
                flipped += 1;
            }
        }
        Ok(flipped)
    }

    async fn count_fresh(&self) -> Result<i64, StoreError> {
        let now = Utc::now();
        let inner = self.inner.lock().await;
        Ok(inner.listings.values().filter(|l| l.expires_at > now).count() as i64)
    }

    async fn segment_stats(&self) -> Result<Vec<SegmentStat>, StoreError> {
        let now = Utc::now();
        let inner = self.inner.lock().await;
        let mut grouped: HashMap<(Option<String>, PropertyCategory), Vec<DateTime<Utc>>> =
            HashMap::new();
        for l in inner.listings.values().filter(|l| l.expires_at > now) {
            grouped
                .entry((l.region.clone(), l.category))
                .or_default()
                .push(l.fetched_at);
        }
        let mut stats: Vec<SegmentStat> = grouped
            .into_iter()
            .map(|((region, category), fetches)| SegmentStat {
                region,
                category,
                count: fetches.len() as i64,
                oldest_fetch: *fetches.iter().min().expect("non-empty group"),
                newest_fetch: *fetches.iter().max().expect("non-empty group"),
            })
            .collect();
        stats.sort_by(|a, b| (&a.region, a.category).cmp(&(&b.region, b.category)));
        Ok(stats)
    }

    async fn newest_fetch_by_category(
        &self,
    ) -> Result<Vec<(PropertyCategory, DateTime<Utc>)>, StoreError> {
        let inner = self.inner.lock().await;
        let mut newest: HashMap<PropertyCategory, DateTime<Utc>> = HashMap::new();
        for l in inner.listings.values() {
            newest
                .entry(l.category)
                .and_modify(|t| {
                    if l.fetched_at > *t {
                        *t = l.fetched_at;
                    }
                })
                .or_insert(l.fetched_at);
        }
        let mut out: Vec<_> = newest.into_iter().collect();
        out.sort_by_key(|(category, _)| *category);
        Ok(out)
    }

    async fn insert_job(&self, job: &ScrapeJob) -> Result<(), StoreError> {
        self.inner.lock().await.jobs.push(job.clone());
        Ok(())
    }

    async fn update_job(&self, job: &ScrapeJob) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.jobs.iter_mut().find(|j| j.id == job.id) {
            Some(existing) => {
                *existing = job.clone();
                Ok(())
            }
            None => Err(StoreError::JobNotFound(job.id)),
        }
    }

    async fn recent_jobs(&self, limit: i64) -> Result<Vec<ScrapeJob>, StoreError> {
        let inner = self.inner.lock().await;
        let mut jobs = inner.jobs.clone();
        jobs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        jobs.truncate(limit.max(0) as usize);
        Ok(jobs)
    }

    async fn reap_stuck_jobs(&self, max_age: Duration) -> Result<u64, StoreError> {
        let cutoff = Utc::now() - max_age;
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        let mut reaped = 0u64;
        for job in inner.jobs.iter_mut() {
            if job.status == roost_core::JobStatus::Running && job.started_at < cutoff {
                job.status = roost_core::JobStatus::Failed;
                job.completed_at = Some(now);
                job.errors
                    .push("reaped: still running past the stuck-job threshold".to_string());
                reaped += 1;
            }
        }
        Ok(reaped)
    }
}

// ---------------------------------------------------------------------------
// Postgres backend
// ---------------------------------------------------------------------------

/// sqlx/Postgres backend. All mutations are single-row atomic statements;
/// nothing holds a transaction across a sleep or network call.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .acquire_timeout(std::time::Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("store migrations applied");
        Ok(())
    }
}

fn listing_from_row(row: &PgRow) -> Result<Listing, StoreError> {
    let category: String = row.try_get("category")?;
    let status: String = row.try_get("status")?;
    let document: serde_json::Value = row.try_get("document")?;
    Ok(Listing {
        id: row.try_get("id")?,
        source: row.try_get("source")?,
        region: row.try_get("region")?,
        category: PropertyCategory::from_str(&category).map_err(StoreError::Corrupt)?,
        price: row.try_get("price")?,
        document: serde_json::from_value(document)?,
        fetched_at: row.try_get("fetched_at")?,
        expires_at: row.try_get("expires_at")?,
        first_seen_at: row.try_get("first_seen_at")?,
        last_seen_at: row.try_get("last_seen_at")?,
        status: ListingStatus::from_str(&status).map_err(StoreError::Corrupt)?,
    })
}

fn job_from_row(row: &PgRow) -> Result<ScrapeJob, StoreError> {
    let status: String = row.try_get("status")?;
    let errors: serde_json::Value = row.try_get("errors")?;
    let step_log: serde_json::Value = row.try_get("step_log")?;
    Ok(ScrapeJob {
        id: row.try_get("id")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        status: roost_core::JobStatus::from_str(&status).map_err(StoreError::Corrupt)?,
        total_listings: row.try_get("total_listings")?,
        total_enriched: row.try_get("total_enriched")?,
        errors: serde_json::from_value(errors)?,
        step_log: serde_json::from_value(step_log)?,
        duration_seconds: row.try_get("duration_seconds")?,
    })
}

const LISTING_COLUMNS: &str = "id, source, region, category, price, document, \
     fetched_at, expires_at, first_seen_at, last_seen_at, status";

#[async_trait]
impl ListingStore for PgStore {
    async fn upsert_batch(
        &self,
        drafts: &[ListingDraft],
        ttl: Duration,
    ) -> Result<usize, StoreError> {
        if drafts.is_empty() {
            return Ok(0);
        }

        let mut written = 0usize;
        for draft in drafts {
            let seen_at = draft.fetched_at;
            let expires_at = seen_at + ttl;
            let document = serde_json::to_value(&draft.document)?;

            // Short per-listing transaction: price read, optional history
            // append, then the upsert itself.
            let mut tx = self.pool.begin().await?;

            let prior_price: Option<Option<i64>> =
                sqlx::query_scalar("SELECT price FROM listings WHERE id = $1")
                    .bind(&draft.id)
                    .fetch_optional(&mut *tx)
                    .await?;

            if let (Some(Some(old)), Some(new)) = (prior_price, draft.price) {
                if old != new {
                    sqlx::query(
                        r#"
                        INSERT INTO price_history (listing_id, old_price, new_price, recorded_at)
                        VALUES ($1, $2, $3, $4)
                        "#,
                    )
                    .bind(&draft.id)
                    .bind(old)
                    .bind(new)
                    .bind(seen_at)
                    .execute(&mut *tx)
                    .await?;
                    debug!(listing_id = %draft.id, old, new, "price change recorded");
                }
            }

            sqlx::query(
                r#"
                INSERT INTO listings
                    (id, source, region, category, price, document,
                     fetched_at, expires_at, first_seen_at, last_seen_at, status)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $7, $7, 'active')
                ON CONFLICT (id) DO UPDATE SET
                    source       = EXCLUDED.source,
                    region       = COALESCE(EXCLUDED.region, listings.region),
                    category     = EXCLUDED.category,
                    price        = EXCLUDED.price,
                    document     = EXCLUDED.document,
                    fetched_at   = EXCLUDED.fetched_at,
                    expires_at   = EXCLUDED.expires_at,
                    last_seen_at = EXCLUDED.last_seen_at,
                    status       = 'active'
                "#,
            )
            .bind(&draft.id)
            .bind(&draft.source)
            .bind(&draft.region)
            .bind(draft.category.as_str())
            .bind(draft.price)
            .bind(&document)
            .bind(seen_at)
            .bind(expires_at)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            written += 1;
        }
        Ok(written)
    }

    async fn query_listings(&self, filter: &ListingFilter) -> Result<Vec<Listing>, StoreError> {
        let now = Utc::now();
        let mut qb: QueryBuilder<sqlx::Postgres> =
            QueryBuilder::new(format!("SELECT {LISTING_COLUMNS} FROM listings WHERE ("));
        qb.push("expires_at > ").push_bind(now);
        if filter.include_stale {
            qb.push(" OR last_seen_at > ")
                .push_bind(now - Duration::days(STALE_READ_WINDOW_DAYS));
        }
        qb.push(")");

        if let Some(region) = &filter.region {
            qb.push(" AND region = ").push_bind(region.clone());
        }
        if !filter.categories.is_empty() {
            let categories: Vec<String> = filter
                .categories
                .iter()
                .map(|c| c.as_str().to_string())
                .collect();
            qb.push(" AND category = ANY(").push_bind(categories).push(")");
        }
        if let Some(min) = filter.min_price {
            qb.push(" AND price >= ").push_bind(min);
        }
        if let Some(max) = filter.max_price {
            qb.push(" AND price <= ").push_bind(max);
        }
        qb.push(" ORDER BY price ASC NULLS LAST, id ASC");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(limit.max(0));
        }

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(listing_from_row).collect()
    }

    async fn get_listing(&self, id: &str) -> Result<Option<Listing>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {LISTING_COLUMNS} FROM listings WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(listing_from_row).transpose()
    }

    async fn price_history(&self, listing_id: &str) -> Result<Vec<PriceChange>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT listing_id, old_price, new_price, recorded_at
              FROM price_history
             WHERE listing_id = $1
             ORDER BY recorded_at DESC
            "#,
        )
        .bind(listing_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(PriceChange {
                    listing_id: row.try_get("listing_id")?,
                    old_price: row.try_get("old_price")?,
                    new_price: row.try_get("new_price")?,
                    recorded_at: row.try_get("recorded_at")?,
                })
            })
            .collect()
    }

    async fn mark_stale(&self, ttl: Duration) -> Result<u64, StoreError> {
        let cutoff = Utc::now() - (ttl * 2);
        let result = sqlx::query(
            "UPDATE listings SET status = 'stale' WHERE status = 'active' AND last_seen_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn mark_delisted(&self, threshold: Duration) -> Result<u64, StoreError> {
        let cutoff = Utc::now() - threshold;
        let result = sqlx::query(
            "UPDATE listings SET status = 'delisted' WHERE status = 'stale' AND last_seen_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn count_fresh(&self) -> Result<i64, StoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM listings WHERE expires_at > NOW()")
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    async fn segment_stats(&self) -> Result<Vec<SegmentStat>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT region, category,
                   COUNT(*) AS count,
                   MIN(fetched_at) AS oldest_fetch,
                   MAX(fetched_at) AS newest_fetch
              FROM listings
             WHERE expires_at > NOW()
             GROUP BY region, category
             ORDER BY region, category
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let category: String = row.try_get("category")?;
                Ok(SegmentStat {
                    region: row.try_get("region")?,
                    category: PropertyCategory::from_str(&category)
                        .map_err(StoreError::Corrupt)?,
                    count: row.try_get("count")?,
                    oldest_fetch: row.try_get("oldest_fetch")?,
                    newest_fetch: row.try_get("newest_fetch")?,
                })
            })
            .collect()
    }

    async fn newest_fetch_by_category(
        &self,
    ) -> Result<Vec<(PropertyCategory, DateTime<Utc>)>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT category, MAX(fetched_at) AS newest_fetch
              FROM listings
             GROUP BY category
             ORDER BY category
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let category: String = row.try_get("category")?;
                Ok((
                    PropertyCategory::from_str(&category).map_err(StoreError::Corrupt)?,
                    row.try_get("newest_fetch")?,
                ))
            })
            .collect()
    }

    async fn insert_job(&self, job: &ScrapeJob) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO scrape_jobs
                (id, started_at, completed_at, status, total_listings,
                 total_enriched, errors, step_log, duration_seconds)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(job.id)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.status.as_str())
        .bind(job.total_listings)
        .bind(job.total_enriched)
        .bind(serde_json::to_value(&job.errors)?)
        .bind(serde_json::to_value(&job.step_log)?)
        .bind(job.duration_seconds)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_job(&self, job: &ScrapeJob) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE scrape_jobs
               SET completed_at = $2,
                   status = $3,
                   total_listings = $4,
                   total_enriched = $5,
                   errors = $6,
                   step_log = $7,
                   duration_seconds = $8
             WHERE id = $1
            "#,
        )
        .bind(job.id)
        .bind(job.completed_at)
        .bind(job.status.as_str())
        .bind(job.total_listings)
        .bind(job.total_enriched)
        .bind(serde_json::to_value(&job.errors)?)
        .bind(serde_json::to_value(&job.step_log)?)
        .bind(job.duration_seconds)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::JobNotFound(job.id));
        }
        Ok(())
    }

    async fn recent_jobs(&self, limit: i64) -> Result<Vec<ScrapeJob>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, started_at, completed_at, status, total_listings,
                   total_enriched, errors, step_log, duration_seconds
              FROM scrape_jobs
             ORDER BY started_at DESC
             LIMIT $1
            "#,
        )
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn reap_stuck_jobs(&self, max_age: Duration) -> Result<u64, StoreError> {
        let cutoff = Utc::now() - max_age;
        let result = sqlx::query(
            r#"
            UPDATE scrape_jobs
               SET status = 'failed',
                   completed_at = NOW(),
                   errors = errors || '["reaped: still running past the stuck-job threshold"]'::jsonb
             WHERE status = 'running'
               AND started_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roost_core::{JobStatus, ListingDocument};

    fn draft(id: &str, price: Option<i64>) -> ListingDraft {
        ListingDraft {
            id: id.to_string(),
            source: "habita".to_string(),
            region: Some("montreal".to_string()),
            category: PropertyCategory::Condo,
            price,
            document: ListingDocument {
                address: Some("123 Rue Principale".to_string()),
                ..ListingDocument::default()
            },
            fetched_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn empty_batch_is_a_no_op() {
        let store = MemoryStore::new();
        assert_eq!(store.upsert_batch(&[], Duration::hours(6)).await.unwrap(), 0);
        assert_eq!(store.count_fresh().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn reupserting_identical_batch_is_idempotent() {
        let store = MemoryStore::new();
        let batch = vec![draft("mls-1", Some(450_000))];
        store.upsert_batch(&batch, Duration::hours(6)).await.unwrap();
        let first_seen = store
            .get_listing("mls-1")
            .await
            .unwrap()
            .unwrap()
            .first_seen_at;

        store.upsert_batch(&batch, Duration::hours(6)).await.unwrap();

        let after = store.get_listing("mls-1").await.unwrap().unwrap();
        assert_eq!(after.first_seen_at, first_seen);
        assert!(store.price_history("mls-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn price_change_appends_exactly_one_history_entry() {
        let store = MemoryStore::new();
        store
            .upsert_batch(&[draft("mls-1", Some(450_000))], Duration::hours(6))
            .await
            .unwrap();
        store
            .upsert_batch(&[draft("mls-1", Some(439_000))], Duration::hours(6))
            .await
            .unwrap();

        let history = store.price_history("mls-1").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].old_price, 450_000);
        assert_eq!(history[0].new_price, 439_000);
    }

    #[tokio::test]
    async fn null_price_transitions_produce_no_history() {
        let store = MemoryStore::new();
        // First sighting never writes history, even with a price.
        store
            .upsert_batch(&[draft("mls-1", Some(450_000))], Duration::hours(6))
            .await
            .unwrap();
        // Non-null -> null is silently dropped (the price itself is erased).
        store
            .upsert_batch(&[draft("mls-1", None)], Duration::hours(6))
            .await
            .unwrap();
        assert!(store.price_history("mls-1").await.unwrap().is_empty());
        assert_eq!(store.get_listing("mls-1").await.unwrap().unwrap().price, None);

        // Null -> non-null has no prior price to record either.
        store
            .upsert_batch(&[draft("mls-1", Some(460_000))], Duration::hours(6))
            .await
            .unwrap();
        assert!(store.price_history("mls-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn region_is_never_erased_by_null() {
        let store = MemoryStore::new();
        store
            .upsert_batch(&[draft("mls-1", Some(300_000))], Duration::hours(6))
            .await
            .unwrap();

        let mut without_region = draft("mls-1", Some(300_000));
        without_region.region = None;
        store
            .upsert_batch(&[without_region], Duration::hours(6))
            .await
            .unwrap();

        let listing = store.get_listing("mls-1").await.unwrap().unwrap();
        assert_eq!(listing.region.as_deref(), Some("montreal"));
    }

    #[tokio::test]
    async fn staleness_boundary_is_two_ttl() {
        let store = MemoryStore::new();
        let ttl = Duration::hours(6);
        store
            .upsert_batch(&[draft("old", Some(1)), draft("recent", Some(2))], ttl)
            .await
            .unwrap();
        {
            let mut inner = store.inner.lock().await;
            inner.listings.get_mut("old").unwrap().last_seen_at =
                Utc::now() - (ttl * 2) - Duration::seconds(1);
            inner.listings.get_mut("recent").unwrap().last_seen_at =
                Utc::now() - (ttl * 2) + Duration::seconds(1);
        }

        assert_eq!(store.mark_stale(ttl).await.unwrap(), 1);
        assert_eq!(
            store.get_listing("old").await.unwrap().unwrap().status,
            ListingStatus::Stale
        );
        assert_eq!(
            store.get_listing("recent").await.unwrap().unwrap().status,
            ListingStatus::Active
        );
    }

    #[tokio::test]
    async fn stale_then_delisted_timeline() {
        // TTL = 6h; last seen 13h ago -> stale (13h > 12h); 49h after going
        // stale (62h since last sighting) -> delisted (62h > 48h).
        let store = MemoryStore::new();
        let ttl = Duration::hours(6);
        store.upsert_batch(&[draft("l1", Some(1))], ttl).await.unwrap();
        {
            let mut inner = store.inner.lock().await;
            inner.listings.get_mut("l1").unwrap().last_seen_at = Utc::now() - Duration::hours(13);
        }
        assert_eq!(store.mark_stale(ttl).await.unwrap(), 1);
        // Not yet past the delist threshold.
        assert_eq!(store.mark_delisted(Duration::hours(48)).await.unwrap(), 0);

        {
            let mut inner = store.inner.lock().await;
            inner.listings.get_mut("l1").unwrap().last_seen_at = Utc::now() - Duration::hours(62);
        }
        assert_eq!(store.mark_delisted(Duration::hours(48)).await.unwrap(), 1);
        assert_eq!(
            store.get_listing("l1").await.unwrap().unwrap().status,
            ListingStatus::Delisted
        );
    }

    #[tokio::test]
    async fn resighting_resurrects_a_stale_listing() {
        let store = MemoryStore::new();
        let ttl = Duration::hours(6);
        store.upsert_batch(&[draft("l1", Some(1))], ttl).await.unwrap();
        {
            let mut inner = store.inner.lock().await;
            let l = inner.listings.get_mut("l1").unwrap();
            l.status = ListingStatus::Stale;
            l.last_seen_at = Utc::now() - Duration::hours(20);
        }

        store.upsert_batch(&[draft("l1", Some(1))], ttl).await.unwrap();

        let listing = store.get_listing("l1").await.unwrap().unwrap();
        assert_eq!(listing.status, ListingStatus::Active);
        assert!(listing.last_seen_at > Utc::now() - Duration::minutes(1));
        assert_eq!(listing.last_seen_at, listing.fetched_at);
    }

    #[tokio::test]
    async fn query_orders_by_price_and_respects_include_stale() {
        let store = MemoryStore::new();
        let ttl = Duration::hours(6);
        store
            .upsert_batch(
                &[
                    draft("cheap", Some(200_000)),
                    draft("dear", Some(900_000)),
                    draft("mystery", None),
                ],
                ttl,
            )
            .await
            .unwrap();
        // One row expired but seen within the stale read window.
        {
            let mut inner = store.inner.lock().await;
            let l = inner.listings.get_mut("dear").unwrap();
            l.expires_at = Utc::now() - Duration::hours(1);
            l.last_seen_at = Utc::now() - Duration::days(2);
            l.status = ListingStatus::Stale;
        }

        let fresh_only = store
            .query_listings(&ListingFilter::default())
            .await
            .unwrap();
        assert_eq!(
            fresh_only.iter().map(|l| l.id.as_str()).collect::<Vec<_>>(),
            vec!["cheap", "mystery"]
        );

        let widened = store
            .query_listings(&ListingFilter {
                include_stale: true,
                ..ListingFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(
            widened.iter().map(|l| l.id.as_str()).collect::<Vec<_>>(),
            vec!["cheap", "dear", "mystery"]
        );

        let capped = store
            .query_listings(&ListingFilter {
                max_price: Some(500_000),
                ..ListingFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(capped.len(), 1);
        assert_eq!(capped[0].id, "cheap");
    }

    #[tokio::test]
    async fn include_stale_admits_expired_rows_the_sweeps_have_not_demoted() {
        let store = MemoryStore::new();
        store
            .upsert_batch(&[draft("l1", Some(1))], Duration::hours(6))
            .await
            .unwrap();
        // Expired, recently seen, but the stale sweep has not run yet.
        {
            let mut inner = store.inner.lock().await;
            let l = inner.listings.get_mut("l1").unwrap();
            l.expires_at = Utc::now() - Duration::hours(1);
            l.last_seen_at = Utc::now() - Duration::hours(7);
        }

        assert!(store
            .query_listings(&ListingFilter::default())
            .await
            .unwrap()
            .is_empty());

        let widened = store
            .query_listings(&ListingFilter {
                include_stale: true,
                ..ListingFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(widened.len(), 1);
        assert_eq!(widened[0].status, ListingStatus::Active);
    }

    #[tokio::test]
    async fn reaper_fails_only_long_running_jobs() {
        let store = MemoryStore::new();
        let mut stuck = ScrapeJob::begin();
        stuck.started_at = Utc::now() - Duration::hours(30);
        let fresh = ScrapeJob::begin();
        store.insert_job(&stuck).await.unwrap();
        store.insert_job(&fresh).await.unwrap();

        assert_eq!(store.reap_stuck_jobs(Duration::hours(24)).await.unwrap(), 1);

        let jobs = store.recent_jobs(10).await.unwrap();
        let reaped = jobs.iter().find(|j| j.id == stuck.id).unwrap();
        assert_eq!(reaped.status, JobStatus::Failed);
        assert!(reaped.completed_at.is_some());
        let untouched = jobs.iter().find(|j| j.id == fresh.id).unwrap();
        assert_eq!(untouched.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn update_job_rejects_unknown_ids() {
        let store = MemoryStore::new();
        let job = ScrapeJob::begin();
        assert!(matches!(
            store.update_job(&job).await,
            Err(StoreError::JobNotFound(_))
        ));
    }
}
