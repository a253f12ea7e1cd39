//! Axum JSON API for triggering and observing the ingestion pipeline.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use roost_ingest::{FreshnessThresholds, TriggerError, WorkerHandle};
use roost_store::{ListingStore, StoreError};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

pub const CRATE_NAME: &str = "roost-web";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ListingStore>,
    pub worker: WorkerHandle,
    /// Hours before a category domain's newest fetch counts as stale.
    pub freshness: FreshnessThresholds,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/trigger", post(trigger_handler))
        .route("/stats", get(stats_handler))
        .route("/history", get(history_handler))
        .route("/freshness", get(freshness_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(
    state: AppState,
    port: u16,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "api listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    is_running: bool,
    last_run_started: Option<DateTime<Utc>>,
    last_run_completed: Option<DateTime<Utc>>,
    last_run_duration_sec: Option<f64>,
    total_listings_stored: i64,
    errors: Vec<String>,
    next_run_at: Option<DateTime<Utc>>,
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    let total_listings_stored = match state.store.count_fresh().await {
        Ok(count) => count,
        Err(err) => return store_error(err),
    };
    let worker = state.worker.status().await;
    Json(StatusResponse {
        is_running: worker.is_running,
        last_run_started: worker.last_run_started,
        last_run_completed: worker.last_run_completed,
        last_run_duration_sec: worker.last_run_duration_sec,
        total_listings_stored,
        errors: worker.errors,
        next_run_at: worker.next_run_at,
    })
    .into_response()
}

async fn trigger_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.worker.trigger() {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "triggered": true })),
        )
            .into_response(),
        Err(TriggerError::AlreadyRunning) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({ "error": "a cycle is already running" })),
        )
            .into_response(),
        Err(TriggerError::WorkerGone) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": "worker is not accepting triggers" })),
        )
            .into_response(),
    }
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.segment_stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(err) => store_error(err),
    }
}

#[derive(Debug, Deserialize, Default)]
struct HistoryQuery {
    limit: Option<i64>,
}

async fn history_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(20).clamp(1, 100);
    match state.store.recent_jobs(limit).await {
        Ok(jobs) => Json(jobs).into_response(),
        Err(err) => store_error(err),
    }
}

#[derive(Debug, Serialize)]
struct FreshnessRow {
    domain: String,
    newest_fetch: DateTime<Utc>,
    age_hours: f64,
    threshold_hours: f64,
    is_stale: bool,
}

async fn freshness_handler(State(state): State<Arc<AppState>>) -> Response {
    let newest = match state.store.newest_fetch_by_category().await {
        Ok(rows) => rows,
        Err(err) => return store_error(err),
    };
    let now = Utc::now();
    let rows: Vec<FreshnessRow> = newest
        .into_iter()
        .map(|(category, newest_fetch)| {
            let age_hours = (now - newest_fetch).num_milliseconds() as f64 / 3_600_000.0;
            let threshold_hours = state.freshness.hours_for(category);
            FreshnessRow {
                domain: category.as_str().to_string(),
                newest_fetch,
                age_hours,
                threshold_hours,
                is_stale: age_hours > threshold_hours,
            }
        })
        .collect();
    Json(rows).into_response()
}

fn store_error(err: StoreError) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": err.to_string() })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use chrono::Duration;
    use http_body_util::BodyExt;
    use roost_collect::SourceRouter;
    use roost_core::{ListingDocument, ListingDraft, PropertyCategory, ScrapeJob};
    use roost_ingest::{IngestConfig, IngestWorker, NoopAlertMatcher};
    use roost_store::MemoryStore;
    use std::path::PathBuf;
    use tower::ServiceExt;

    fn test_config() -> IngestConfig {
        IngestConfig {
            database_url: "unused".to_string(),
            sources_path: PathBuf::from("sources.yaml"),
            regions: vec!["montreal".to_string()],
            categories: vec![PropertyCategory::Condo],
            cycle_interval_hours: 4,
            startup_delay_secs: 0,
            cache_ttl_hours: 6,
            delist_threshold_hours: 48,
            delist_sweep_interval_hours: 12,
            segment_cooldown_secs: 0,
            router_cache_ttl_secs: 0,
            http_timeout_secs: 20,
            user_agent: "roost-test".to_string(),
            web_port: 0,
            freshness_override_hours: Default::default(),
        }
    }

    /// The worker must stay alive so the trigger channel has a receiver.
    fn state_with_store(store: Arc<MemoryStore>) -> (AppState, IngestWorker) {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (worker, handle) = IngestWorker::new(
            test_config(),
            store.clone(),
            SourceRouter::new(std::time::Duration::from_secs(0)),
            Arc::new(NoopAlertMatcher),
            shutdown_rx,
        );
        (
            AppState {
                store,
                worker: handle,
                freshness: FreshnessThresholds::new(8.0),
            },
            worker,
        )
    }

    async fn seeded_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        let drafts = vec![
            ListingDraft {
                id: "mls-1".to_string(),
                source: "habita".to_string(),
                region: Some("montreal".to_string()),
                category: PropertyCategory::Condo,
                price: Some(425_000),
                document: ListingDocument::default(),
                fetched_at: Utc::now(),
            },
            ListingDraft {
                id: "mls-2".to_string(),
                source: "habita".to_string(),
                region: Some("laval".to_string()),
                category: PropertyCategory::House,
                price: Some(780_000),
                document: ListingDocument::default(),
                fetched_at: Utc::now(),
            },
        ];
        store.upsert_batch(&drafts, Duration::hours(6)).await.unwrap();
        store
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_is_ok() {
        let (state, _worker) = state_with_store(Arc::new(MemoryStore::new()));
        let response = app(state)
            .oneshot(
                axum::http::Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn status_reports_store_count_and_idle_worker() {
        let (state, _worker) = state_with_store(seeded_store().await);
        let response = app(state)
            .oneshot(
                axum::http::Request::builder()
                    .uri("/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["is_running"], false);
        assert_eq!(json["total_listings_stored"], 2);
    }

    #[tokio::test]
    async fn trigger_accepts_then_conflicts_while_pending() {
        let (state, _worker) = state_with_store(Arc::new(MemoryStore::new()));
        let router = app(state);

        let first = router
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/trigger")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::ACCEPTED);

        // The worker never drains the queued trigger in this test, so a
        // second request must be rejected rather than queued behind it.
        let second = router
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/trigger")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn stats_groups_by_region_and_category() {
        let (state, _worker) = state_with_store(seeded_store().await);
        let response = app(state)
            .oneshot(
                axum::http::Request::builder()
                    .uri("/stats")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        let rows = json.as_array().unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().any(|r| r["region"] == "montreal" && r["category"] == "condo"));
    }

    #[tokio::test]
    async fn history_returns_jobs_newest_first() {
        let store = Arc::new(MemoryStore::new());
        let mut older = ScrapeJob::begin();
        older.started_at = Utc::now() - Duration::hours(2);
        let newer = ScrapeJob::begin();
        store.insert_job(&older).await.unwrap();
        store.insert_job(&newer).await.unwrap();

        let (state, _worker) = state_with_store(store);
        let response = app(state)
            .oneshot(
                axum::http::Request::builder()
                    .uri("/history?limit=5")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        let rows = json.as_array().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["id"], newer.id.to_string());
    }

    #[tokio::test]
    async fn freshness_flags_domains_past_threshold() {
        let store = Arc::new(MemoryStore::new());
        let drafts = vec![
            ListingDraft {
                id: "fresh".to_string(),
                source: "habita".to_string(),
                region: Some("montreal".to_string()),
                category: PropertyCategory::Condo,
                price: Some(1),
                document: ListingDocument::default(),
                fetched_at: Utc::now(),
            },
            ListingDraft {
                id: "old".to_string(),
                source: "habita".to_string(),
                region: Some("montreal".to_string()),
                category: PropertyCategory::House,
                price: Some(1),
                document: ListingDocument::default(),
                fetched_at: Utc::now() - Duration::hours(20),
            },
        ];
        store.upsert_batch(&drafts, Duration::hours(6)).await.unwrap();

        let (state, _worker) = state_with_store(store);
        let response = app(state)
            .oneshot(
                axum::http::Request::builder()
                    .uri("/freshness")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        let rows = json.as_array().unwrap();
        let condo = rows.iter().find(|r| r["domain"] == "condo").unwrap();
        let house = rows.iter().find(|r| r["domain"] == "house").unwrap();
        assert_eq!(condo["is_stale"], false);
        assert_eq!(house["is_stale"], true);
    }

    #[tokio::test]
    async fn freshness_threshold_can_vary_per_domain() {
        let store = Arc::new(MemoryStore::new());
        let drafts = vec![ListingDraft {
            id: "old-house".to_string(),
            source: "habita".to_string(),
            region: Some("montreal".to_string()),
            category: PropertyCategory::House,
            price: Some(1),
            document: ListingDocument::default(),
            fetched_at: Utc::now() - Duration::hours(20),
        }];
        store.upsert_batch(&drafts, Duration::hours(6)).await.unwrap();

        let (mut state, _worker) = state_with_store(store);
        state.freshness =
            FreshnessThresholds::new(8.0).with_override(PropertyCategory::House, 30.0);

        let response = app(state)
            .oneshot(
                axum::http::Request::builder()
                    .uri("/freshness")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        let house = json
            .as_array()
            .unwrap()
            .iter()
            .find(|r| r["domain"] == "house")
            .unwrap();
        assert_eq!(house["threshold_hours"], 30.0);
        assert_eq!(house["is_stale"], false);
    }
}
