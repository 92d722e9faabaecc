//! Axum JSON API: the query and trigger surface consumed by the bot layer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use dealwire_core::{slugify, Deal};
use dealwire_ingest::Ingestor;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "dealwire-api";

const DEFAULT_QUERY_LIMIT: u32 = 5;
const MAX_QUERY_LIMIT: u32 = 50;

#[derive(Clone)]
pub struct AppState {
    ingestor: Arc<Ingestor>,
    ingestion_in_flight: Arc<AtomicBool>,
}

pub fn app(ingestor: Arc<Ingestor>) -> Router {
    let state = AppState {
        ingestor,
        ingestion_in_flight: Arc::new(AtomicBool::new(false)),
    };
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/deals", get(deals_handler))
        .route("/stores", get(stores_handler))
        .route("/categories", get(categories_handler))
        .route("/aliases/resolve", get(resolve_alias_handler))
        .route("/runs/ingest", post(run_ingest_handler))
        .route("/runs/cleanup", post(run_cleanup_handler))
        .with_state(state)
}

pub async fn serve_from_env(ingestor: Arc<Ingestor>) -> anyhow::Result<()> {
    let port: u16 = std::env::var("DEALWIRE_API_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8080);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "api listening");
    axum::serve(listener, app(ingestor)).await?;
    Ok(())
}

async fn healthz_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct DealsQuery {
    store: Option<String>,
    category: Option<String>,
    limit: Option<u32>,
}

#[derive(Debug, Serialize)]
struct DealsResponse {
    store: String,
    deals: Vec<Deal>,
    /// True when the result was empty and a background refresh is underway;
    /// the caller should retry shortly.
    ingestion_triggered: bool,
}

async fn deals_handler(
    State(state): State<AppState>,
    Query(query): Query<DealsQuery>,
) -> Response {
    let Some(store_text) = query
        .store
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
    else {
        return bad_request("missing store parameter");
    };
    let slug = state
        .ingestor
        .aliases()
        .resolve(store_text)
        .unwrap_or_else(|| slugify(store_text));
    if slug.is_empty() {
        return bad_request("store name resolves to nothing");
    }
    let limit = query
        .limit
        .unwrap_or(DEFAULT_QUERY_LIMIT)
        .clamp(1, MAX_QUERY_LIMIT);

    match state
        .ingestor
        .store()
        .query(&slug, query.category.as_deref(), limit)
        .await
    {
        Ok(deals) => {
            let ingestion_triggered = if deals.is_empty() {
                spawn_background_ingestion(&state);
                true
            } else {
                false
            };
            Json(DealsResponse {
                store: slug,
                deals,
                ingestion_triggered,
            })
            .into_response()
        }
        Err(err) => internal_error(err),
    }
}

/// At most one on-demand run at a time; an empty result while a run is
/// already in flight still tells the caller to retry shortly.
fn spawn_background_ingestion(state: &AppState) {
    if state
        .ingestion_in_flight
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return;
    }
    let ingestor = state.ingestor.clone();
    let in_flight = state.ingestion_in_flight.clone();
    tokio::spawn(async move {
        match ingestor.run_ingestion().await {
            Ok(summary) => info!(added = summary.inserted, "on-demand ingestion finished"),
            Err(err) => error!(error = %err, "on-demand ingestion failed"),
        }
        in_flight.store(false, Ordering::SeqCst);
    });
}

async fn stores_handler(State(state): State<AppState>) -> Response {
    match state.ingestor.store().distinct_store_slugs().await {
        Ok(stores) => Json(serde_json::json!({ "stores": stores })).into_response(),
        Err(err) => internal_error(err),
    }
}

async fn categories_handler(State(state): State<AppState>) -> Response {
    match state.ingestor.store().distinct_categories().await {
        Ok(categories) => Json(serde_json::json!({ "categories": categories })).into_response(),
        Err(err) => internal_error(err),
    }
}

#[derive(Debug, Deserialize)]
struct ResolveQuery {
    q: String,
}

async fn resolve_alias_handler(
    State(state): State<AppState>,
    Query(query): Query<ResolveQuery>,
) -> Json<serde_json::Value> {
    let slug = state.ingestor.aliases().resolve(&query.q);
    Json(serde_json::json!({ "query": query.q, "slug": slug }))
}

async fn run_ingest_handler(State(state): State<AppState>) -> Response {
    match state.ingestor.run_ingestion().await {
        Ok(summary) => Json(serde_json::json!({
            "run_id": summary.run_id,
            "added": summary.inserted,
            "sources_run": summary.sources_run,
        }))
        .into_response(),
        Err(err) => internal_error(err),
    }
}

#[derive(Debug, Deserialize)]
struct CleanupQuery {
    retention_days: Option<i64>,
}

async fn run_cleanup_handler(
    State(state): State<AppState>,
    Query(query): Query<CleanupQuery>,
) -> Response {
    let retention = query
        .retention_days
        .map(chrono::Duration::days)
        .unwrap_or_else(|| state.ingestor.retention());
    match state.ingestor.run_cleanup(retention).await {
        Ok(deleted) => Json(serde_json::json!({ "deleted": deleted })).into_response(),
        Err(err) => internal_error(err),
    }
}

fn bad_request(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": message })),
    )
        .into_response()
}

fn internal_error(err: impl std::fmt::Display) -> Response {
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
    use chrono::Utc;
    use dealwire_core::content_hash;
    use dealwire_ingest::IngestConfig;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn test_ingestor(dir: &std::path::Path) -> Arc<Ingestor> {
        let config = IngestConfig {
            db_path: dir.join("deals.db"),
            stores_json: Some(r#"{"stores": []}"#.to_string()),
            sources_path: dir.join("missing-sources.json"),
            user_agent: "dealwire-test/0.1".to_string(),
            http_timeout_secs: 2,
            http_max_retries: 0,
            source_concurrency: 2,
            scheduler_enabled: false,
            ingest_cron: "0 0,30 * * * *".to_string(),
            cleanup_cron: "0 0 3 * * *".to_string(),
            retention_days: 14,
        };
        Arc::new(Ingestor::new(config).await.unwrap())
    }

    fn mk_deal(store_slug: &str, title: &str, url: &str, score: f64) -> Deal {
        Deal {
            store_slug: store_slug.to_string(),
            category: Some("акции".to_string()),
            title: title.to_string(),
            description: String::new(),
            url: url.to_string(),
            coupon_code: None,
            price_old: None,
            price_new: None,
            cashback: None,
            start_at: None,
            end_at: None,
            source: "test".to_string(),
            score,
            created_at: Utc::now(),
            content_hash: content_hash(url, title, None),
        }
    }

    async fn get_json(app: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    async fn post_json(app: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn healthz_responds() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(test_ingestor(dir.path()).await);
        let (status, body) = get_json(&app, "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn deals_resolve_free_text_store_names() {
        let dir = tempfile::tempdir().unwrap();
        let ingestor = test_ingestor(dir.path()).await;
        let deal = mk_deal("wildberries", "Скидки недели", "https://wb.example/sale", 0.8);
        assert!(ingestor.store().insert(&deal).await.unwrap());

        let app = app(ingestor);
        // "ВБ", urlencoded.
        let (status, body) = get_json(&app, "/deals?store=%D0%92%D0%91").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["store"], "wildberries");
        assert_eq!(body["deals"].as_array().unwrap().len(), 1);
        assert_eq!(body["ingestion_triggered"], false);
        assert_eq!(body["deals"][0]["title"], "Скидки недели");
    }

    #[tokio::test]
    async fn deals_require_a_store_parameter() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(test_ingestor(dir.path()).await);
        let (status, body) = get_json(&app, "/deals").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("store"));
    }

    #[tokio::test]
    async fn empty_result_triggers_background_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(test_ingestor(dir.path()).await);
        let (status, body) = get_json(&app, "/deals?store=unknownshop").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["deals"].as_array().unwrap().len(), 0);
        assert_eq!(body["ingestion_triggered"], true);
    }

    #[tokio::test]
    async fn deals_respect_limit_and_ranking() {
        let dir = tempfile::tempdir().unwrap();
        let ingestor = test_ingestor(dir.path()).await;
        for (i, score) in [0.5, 0.9, 0.7].iter().enumerate() {
            let deal = mk_deal(
                "ozon",
                &format!("Deal {i}"),
                &format!("https://ozon.example/{i}"),
                *score,
            );
            assert!(ingestor.store().insert(&deal).await.unwrap());
        }

        let app = app(ingestor);
        let (status, body) = get_json(&app, "/deals?store=ozon&limit=2").await;
        assert_eq!(status, StatusCode::OK);
        let deals = body["deals"].as_array().unwrap();
        assert_eq!(deals.len(), 2);
        assert_eq!(deals[0]["title"], "Deal 1");
        assert_eq!(deals[1]["title"], "Deal 2");
    }

    #[tokio::test]
    async fn alias_resolver_is_exposed() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(test_ingestor(dir.path()).await);

        let (_, body) = get_json(&app, "/aliases/resolve?q=wildberries").await;
        assert_eq!(body["slug"], "wildberries");

        let (_, body) = get_json(&app, "/aliases/resolve?q=nonsense-shop").await;
        assert!(body["slug"].is_null());
    }

    #[tokio::test]
    async fn stores_listing_reflects_inserts() {
        let dir = tempfile::tempdir().unwrap();
        let ingestor = test_ingestor(dir.path()).await;
        let deal = mk_deal("ozon", "Deal", "https://ozon.example/d", 0.8);
        assert!(ingestor.store().insert(&deal).await.unwrap());

        let app = app(ingestor);
        let (status, body) = get_json(&app, "/stores").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["stores"].as_array().unwrap().len(), 1);

        let (_, body) = get_json(&app, "/categories").await;
        assert_eq!(body["categories"][0], "акции");
    }

    #[tokio::test]
    async fn trigger_endpoints_run_synchronously() {
        let dir = tempfile::tempdir().unwrap();
        let ingestor = test_ingestor(dir.path()).await;
        let mut expired = mk_deal("ozon", "Old", "https://ozon.example/old", 0.8);
        expired.end_at = Some(Utc::now() - chrono::Duration::days(2));
        assert!(ingestor.store().insert(&expired).await.unwrap());

        let app = app(ingestor);
        let (status, body) = post_json(&app, "/runs/ingest").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["added"], 0);

        let (status, body) = post_json(&app, "/runs/cleanup").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["deleted"], 1);
    }
}
