// src/api.rs
//! HTTP surface. One real endpoint (`POST /search`) plus health, debug, and
//! admin routes. The `X-Cache` header carries HIT/STALE/MISS diagnostics and
//! `X-Plan-Source` reveals whether plan limits came from the store or the
//! fallback.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tower_http::cors::CorsLayer;

use crate::model::SearchRequest;
use crate::orchestrator::{SearchError, SearchOrchestrator};
use crate::plan::CachedPlans;
use crate::quota::QuotaGuard;
use crate::sources::RegistryHandle;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<SearchOrchestrator>,
    pub quota: Arc<QuotaGuard>,
    pub plans: Arc<CachedPlans>,
    pub registry: RegistryHandle,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/search", post(search))
        .route("/debug/breakers", get(debug_breakers))
        .route("/debug/cache", get(debug_cache))
        .route("/admin/reload-sources", get(admin_reload_sources))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

/// Caller identity for quota accounting. Unauthenticated callers share one
/// bucket, which is exactly the point.
fn caller_key(headers: &HeaderMap) -> String {
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "anonymous".to_string())
}

async fn search(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<SearchRequest>,
) -> Response {
    let caller = caller_key(&headers);
    let (limits, plan_origin) = state.plans.limits_for(&caller).await;

    // Plan window check before quota: a request we reject for range must not
    // consume budget.
    let oldest_allowed = chrono::Utc::now().date_naive()
        - chrono::Days::new(limits.max_history_days as u64);
    if request.date_from < oldest_allowed {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({
                "error": "date_from exceeds plan history window",
                "max_history_days": limits.max_history_days,
            })),
        )
            .into_response();
    }

    if !state
        .quota
        .check_and_increment(&caller, limits.max_requests_per_window)
    {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "error": "request quota exceeded",
                "limit": limits.max_requests_per_window,
            })),
        )
            .into_response();
    }

    match state.orchestrator.search(request).await {
        Ok((result, cache_status)) => {
            let mut resp = Json(result).into_response();
            let headers = resp.headers_mut();
            headers.insert("x-cache", cache_status.as_str().parse().expect("ascii"));
            headers.insert(
                "x-plan-source",
                plan_origin.as_str().parse().expect("ascii"),
            );
            resp
        }
        Err(SearchError::InvalidRequest(msg)) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "error": msg })),
        )
            .into_response(),
        Err(SearchError::AllSourcesUnavailable { failures }) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "error": "all sources unavailable",
                "sources_failed": failures,
            })),
        )
            .into_response(),
    }
}

async fn debug_breakers(State(state): State<AppState>) -> Response {
    Json(state.orchestrator.breakers().snapshots()).into_response()
}

async fn debug_cache(State(state): State<AppState>) -> Response {
    Json(state.orchestrator.cache().stats()).into_response()
}

async fn admin_reload_sources(State(state): State<AppState>) -> Response {
    match state.registry.reload() {
        Ok(n) => Json(json!({ "sources": n })).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}
