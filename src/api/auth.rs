//! Minimal JWT auth for the admin dashboard.
//!
//! - Dashboard submits a password to `/api/auth/login`
//! - Server returns a JWT valid for `JWT_TTL_DAYS`
//! - When `DEV_MODE=false`, admin endpoints require `Authorization: Bearer <jwt>`
//!
//! Booth endpoints (uploads, tasks, artifacts, handoff) stay public.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation};

use super::routes::AppState;
use super::types::{LoginRequest, LoginResponse};

const TOKEN_SUBJECT: &str = "photobooth_admin";

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct Claims {
    /// Subject (we only need a stable sentinel)
    sub: String,
    /// Issued-at unix seconds
    iat: i64,
    /// Expiration unix seconds
    exp: i64,
}

pub(super) fn constant_time_eq(a: &str, b: &str) -> bool {
    a.len() == b.len()
        && a
            .bytes()
            .zip(b.bytes())
            .fold(0u8, |diff, (x, y)| diff | (x ^ y))
            == 0
}

/// Token from an `Authorization: Bearer <jwt>` header, if present.
fn bearer_token(req: &Request<Body>) -> Option<&str> {
    let value = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?;
    value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

fn issue_jwt(secret: &str, ttl_days: i64) -> anyhow::Result<(String, i64)> {
    let now = Utc::now();
    let exp = Duration::try_days(ttl_days.max(1))
        .and_then(|ttl| now.checked_add_signed(ttl))
        .ok_or_else(|| anyhow::anyhow!("token lifetime of {} days is out of range", ttl_days))?;
    let claims = Claims {
        sub: TOKEN_SUBJECT.to_string(),
        iat: now.timestamp(),
        exp: exp.timestamp(),
    };
    let token = jsonwebtoken::encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;
    Ok((token, claims.exp))
}

fn verify_jwt(token: &str, secret: &str) -> anyhow::Result<Claims> {
    let validation = Validation::default();
    let token_data = jsonwebtoken::decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )?;
    if token_data.claims.sub != TOKEN_SUBJECT {
        anyhow::bail!("unexpected token subject");
    }
    Ok(token_data.claims)
}

pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, (StatusCode, String)> {
    let expected = state
        .config
        .auth
        .dashboard_password
        .as_deref()
        .unwrap_or("");

    if expected.is_empty() || !constant_time_eq(req.password.trim(), expected) {
        tracing::warn!("Rejected admin login");
        return Err((StatusCode::UNAUTHORIZED, "Invalid password".to_string()));
    }

    let secret = state.config.auth.jwt_secret.as_deref().ok_or_else(|| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "JWT_SECRET not configured".to_string(),
        )
    })?;

    let (token, exp) = issue_jwt(secret, state.config.auth.jwt_ttl_days)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(Json(LoginResponse { token, exp }))
}

pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if !state.config.auth.auth_required(state.config.dev_mode) {
        return next.run(req).await;
    }

    // Fail closed when auth is required but not configured.
    let secret = match state.config.auth.jwt_secret.as_deref() {
        Some(s) => s,
        None => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "JWT_SECRET not configured",
            )
                .into_response();
        }
    };

    let Some(token) = bearer_token(&req) else {
        return (StatusCode::UNAUTHORIZED, "Missing Authorization header").into_response();
    };

    match verify_jwt(token, secret) {
        Ok(_claims) => next.run(req).await,
        Err(_) => (StatusCode::UNAUTHORIZED, "Invalid or expired token").into_response(),
    }
}
