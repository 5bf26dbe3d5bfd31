//! Router-level tests: cache diagnostics header, quota enforcement, plan
//! fallback tagging, and error mapping. Uses `tower::ServiceExt::oneshot`
//! against the real router with fake sources behind it.

mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::{body::Body, Router};
use http::{HeaderMap, Request, StatusCode};
use tower::ServiceExt; // for oneshot

use common::*;
use licita_radar::api::{self, AppState};
use licita_radar::model::SourceName;
use licita_radar::plan::{CachedPlans, PlanLimits, PlanProvider, StaticPlans};
use licita_radar::quota::{QuotaConfig, QuotaGuard};
use licita_radar::sources::RegistryHandle;

struct FailingPlans;

#[async_trait::async_trait]
impl PlanProvider for FailingPlans {
    async fn load(&self, _caller: &str) -> anyhow::Result<PlanLimits> {
        anyhow::bail!("plan service down")
    }
}

fn app_with(limits: PlanLimits, plans_down: bool) -> Router {
    let orchestrator = OrchestratorBuilder::new()
        .provider(
            SourceName::Pncp,
            StaticSource::new(
                SourceName::Pncp,
                vec![record(SourceName::Pncp, "p-1", "12345678000190", "45/2025", 2025)],
            ),
        )
        .provider(SourceName::Comprasnet, StaticSource::new(SourceName::Comprasnet, vec![]))
        .provider(
            SourceName::Transparencia,
            StaticSource::new(SourceName::Transparencia, vec![]),
        )
        .provider(SourceName::Dou, StaticSource::new(SourceName::Dou, vec![]))
        .provider(
            SourceName::QueridoDiario,
            StaticSource::new(SourceName::QueridoDiario, vec![]),
        )
        .build();

    let plans: Box<dyn PlanProvider> = if plans_down {
        Box::new(FailingPlans)
    } else {
        Box::new(StaticPlans(limits))
    };

    let state = AppState {
        orchestrator: Arc::new(orchestrator),
        quota: Arc::new(QuotaGuard::new(QuotaConfig::default())),
        plans: Arc::new(CachedPlans::new(plans, Duration::from_secs(600))),
        registry: RegistryHandle::new(registry_all_enabled()),
    };
    api::router(state)
}

fn search_body() -> Body {
    let req = search_request();
    Body::from(serde_json::to_vec(&req).unwrap())
}

async fn post_search(app: &Router, api_key: Option<&str>) -> (StatusCode, HeaderMap) {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/search")
        .header("content-type", "application/json");
    if let Some(key) = api_key {
        builder = builder.header("x-api-key", key);
    }
    let req = builder.body(search_body()).expect("request build");
    let resp = app.clone().oneshot(req).await.expect("router response");
    (resp.status(), resp.headers().clone())
}

fn cache_header(headers: &HeaderMap) -> String {
    headers
        .get("x-cache")
        .expect("x-cache header must be present")
        .to_str()
        .expect("x-cache must be ASCII")
        .to_string()
}

#[tokio::test]
async fn search_miss_then_hit_via_header() {
    let app = app_with(PlanLimits::default(), false);

    let (s1, h1) = post_search(&app, None).await;
    assert_eq!(s1, StatusCode::OK);
    assert_eq!(cache_header(&h1), "MISS");

    let (s2, h2) = post_search(&app, None).await;
    assert_eq!(s2, StatusCode::OK);
    assert_eq!(cache_header(&h2), "HIT");
}

#[tokio::test]
async fn quota_exhaustion_maps_to_429() {
    let app = app_with(
        PlanLimits {
            max_requests_per_window: 2,
            max_history_days: 90,
        },
        false,
    );

    assert_eq!(post_search(&app, Some("team-a")).await.0, StatusCode::OK);
    assert_eq!(post_search(&app, Some("team-a")).await.0, StatusCode::OK);
    assert_eq!(
        post_search(&app, Some("team-a")).await.0,
        StatusCode::TOO_MANY_REQUESTS
    );
    // A different caller still gets through.
    assert_eq!(post_search(&app, Some("team-b")).await.0, StatusCode::OK);
}

#[tokio::test]
async fn plan_history_window_maps_to_422() {
    let app = app_with(
        PlanLimits {
            max_requests_per_window: 100,
            max_history_days: 7,
        },
        false,
    );
    // search_request() reaches 30 days back; the plan allows 7.
    let (status, _) = post_search(&app, None).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn plan_fallback_is_tagged_in_header() {
    let app = app_with(PlanLimits::default(), true);
    let (status, headers) = post_search(&app, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        headers.get("x-plan-source").unwrap().to_str().unwrap(),
        "fallback"
    );
}

#[tokio::test]
async fn invalid_dates_map_to_422() {
    let app = app_with(PlanLimits::default(), false);
    let mut req = search_request();
    std::mem::swap(&mut req.date_from, &mut req.date_to);
    let body = Body::from(serde_json::to_vec(&req).unwrap());
    let http_req = Request::builder()
        .method("POST")
        .uri("/search")
        .header("content-type", "application/json")
        .body(body)
        .unwrap();
    let resp = app.oneshot(http_req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn health_and_debug_routes_respond() {
    let app = app_with(PlanLimits::default(), false);

    let health = app
        .clone()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(health.status(), StatusCode::OK);

    let breakers = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/debug/breakers")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(breakers.status(), StatusCode::OK);

    let cache = app
        .oneshot(
            Request::builder()
                .uri("/debug/cache")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(cache.status(), StatusCode::OK);
}
