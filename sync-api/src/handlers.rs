use axum::{extract::Extension, http::StatusCode, response::Json};
use chrono::{SecondsFormat, Utc};
use serde_json::{json, Value};

use crate::server::ApiState;

pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "sync-api"
    }))
}

pub async fn expire_requests(Extension(state): Extension<ApiState>) -> (StatusCode, Json<Value>) {
    match state.sweeper.run().await {
        Ok(report) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                "results": report,
            })),
        ),
        Err(e) => {
            tracing::error!("Expiration sweep failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "success": false, "error": e.to_string() })),
            )
        }
    }
}
