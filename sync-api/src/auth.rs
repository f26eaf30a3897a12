use axum::{
    extract::Request,
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use sha2::{Digest, Sha256};
use sync_core::config::CronConfig;
use thiserror::Error;

use crate::server::ApiState;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CronAuthError {
    #[error("cron secret is not configured")]
    NotConfigured,
    #[error("missing bearer token")]
    MissingToken,
    #[error("invalid cron secret")]
    InvalidSecret,
}

/// Extract the bearer token from an Authorization header
fn extract_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

fn secrets_match(supplied: &str, expected: &str) -> bool {
    let a = Sha256::digest(supplied.as_bytes());
    let b = Sha256::digest(expected.as_bytes());
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

pub fn authorize_cron(headers: &HeaderMap, config: &CronConfig) -> Result<(), CronAuthError> {
    if !config.enforced() {
        return Ok(());
    }
    let expected = config.secret.as_deref().ok_or(CronAuthError::NotConfigured)?;
    let supplied = extract_token(headers).ok_or(CronAuthError::MissingToken)?;
    if secrets_match(supplied, expected) {
        Ok(())
    } else {
        Err(CronAuthError::InvalidSecret)
    }
}

/// Guards every `/cron` route with the cron bearer secret.
pub async fn cron_auth_middleware(req: Request, next: Next) -> Response {
    if !req.uri().path().starts_with("/cron") {
        return next.run(req).await;
    }

    let Some(cron) = req.extensions().get::<ApiState>().map(|s| s.cron.clone()) else {
        tracing::error!("API state missing from request extensions");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };

    match authorize_cron(req.headers(), &cron) {
        Ok(()) => next.run(req).await,
        Err(e) => {
            tracing::warn!("Rejected cron call to {}: {}", req.uri().path(), e);
            (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({ "success": false, "error": "Unauthorized" })),
            )
                .into_response()
        }
    }
}
