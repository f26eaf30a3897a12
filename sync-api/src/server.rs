use anyhow::Result;
use axum::{extract::Extension, middleware, routing::get, Router};
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use sync_core::config::{CronConfig, ServerConfig};
use sync_sweep::Sweeper;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth;
use crate::handlers;

#[derive(Clone)]
pub struct ApiState {
    pub cron: Arc<CronConfig>,
    pub sweeper: Arc<Sweeper>,
}

impl ApiState {
    pub fn new(cron: CronConfig, sweeper: Arc<Sweeper>) -> Self {
        Self {
            cron: Arc::new(cron),
            sweeper,
        }
    }
}

fn cors_layer() -> CorsLayer {
    if let Ok(origins) = env::var("CORS_ORIGINS") {
        let mut cors = CorsLayer::new();
        for origin in origins.split(',').map(|s| s.trim()) {
            if let Ok(parsed) = origin.parse::<axum::http::HeaderValue>() {
                cors = cors.allow_origin(parsed);
            }
        }
        cors.allow_methods(Any).allow_headers(Any)
    } else {
        tracing::warn!("CORS_ORIGINS not set, using permissive CORS. Set CORS_ORIGINS for production!");
        CorsLayer::permissive()
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/cron/expire-requests", get(handlers::expire_requests))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(Extension(state))
                .layer(middleware::from_fn(auth::cron_auth_middleware))
                .layer(cors_layer()),
        )
}

pub async fn run(state: ApiState, config: &ServerConfig) -> Result<()> {
    let app = router(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.api_port).parse()?;
    tracing::info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{header::AUTHORIZATION, Request, StatusCode};
    use chrono::{Duration, TimeZone, Utc};
    use serde_json::Value;
    use sync_core::config::SweepConfig;
    use sync_core::{ListingRequest, ManualClock, RequestStatus};
    use sync_sweep::MemoryRequestStore;
    use tower::ServiceExt;
    use uuid::Uuid;

    fn stale_pending() -> ListingRequest {
        ListingRequest {
            id: Uuid::new_v4(),
            client_id: Uuid::new_v4(),
            provider_id: Uuid::new_v4(),
            listing_id: Uuid::new_v4(),
            status: RequestStatus::Pending,
            created_at: Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap(),
            preferred_date: None,
            preferred_time: None,
            provider_response: None,
            completion_description: None,
            completion_photos: None,
        }
    }

    fn app(store: Arc<MemoryRequestStore>, cron: CronConfig) -> Router {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap() + Duration::hours(25);
        let sweeper = Arc::new(Sweeper::new(
            store,
            Arc::new(ManualClock::new(now)),
            SweepConfig::default(),
        ));
        router(ApiState::new(cron, sweeper))
    }

    fn production(secret: Option<&str>) -> CronConfig {
        CronConfig {
            secret: secret.map(str::to_string),
            production: true,
            require_secret: false,
        }
    }

    async fn call(app: Router, token: Option<&str>) -> (StatusCode, Value) {
        let mut request = Request::builder().uri("/cron/expire-requests");
        if let Some(token) = token {
            request = request.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        let response = app.oneshot(request.body(Body::empty()).unwrap()).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let app = app(Arc::new(MemoryRequestStore::default()), production(None));
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_rejects_missing_secret_without_running_sweep() {
        let request = stale_pending();
        let store = Arc::new(MemoryRequestStore::new(vec![request.clone()]));

        let (status, body) = call(app(store.clone(), production(Some("s3cret"))), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["success"], false);
        assert_eq!(store.request(request.id).unwrap().status, RequestStatus::Pending);

        let (status, _) = call(app(store.clone(), production(None)), Some("guess")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_runs_sweep_with_valid_secret() {
        let request = stale_pending();
        let store = Arc::new(MemoryRequestStore::new(vec![request.clone()]));

        let (status, body) = call(app(store.clone(), production(Some("s3cret"))), Some("s3cret")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert!(body["timestamp"].is_string());
        assert_eq!(body["results"]["expiredPending"], 1);
        assert_eq!(body["results"]["expiredAccepted"], 0);
        assert_eq!(body["results"]["notificationsCreated"], 1);
        assert_eq!(body["results"]["errors"], serde_json::json!([]));
        assert_eq!(
            store.request(request.id).unwrap().status,
            RequestStatus::CancelledByProvider
        );
    }

    #[tokio::test]
    async fn test_zero_candidates_is_success() {
        let cron = CronConfig {
            secret: None,
            production: false,
            require_secret: false,
        };
        let (status, body) = call(app(Arc::new(MemoryRequestStore::default()), cron), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["results"]["expiredPending"], 0);
    }

    #[tokio::test]
    async fn test_store_outage_is_500() {
        let store = Arc::new(MemoryRequestStore::default());
        store.set_unavailable(true);

        let (status, body) = call(app(store, production(Some("s3cret"))), Some("s3cret")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().contains("connection refused"));
    }
}
