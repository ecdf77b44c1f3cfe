use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::{
    service::{ClaimResult, PeekResult, RevokeResult, StoreRequest, StoreResult},
    store::{Secret, SecretKind},
    AppState,
};

// ── Client identity ──────────────────────────────────────────────────────────

/// Best-available network address hint: first `x-forwarded-for` entry, else
/// `x-real-ip`, else the direct peer. Spoofable by design — this feeds the
/// rate limiter, not an authentication decision.
fn extract_ip(headers: &HeaderMap, addr: &SocketAddr) -> String {
    if let Some(xff) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = xff.split(',').next() {
            let trimmed = first.trim();
            if !trimmed.is_empty() {
                return trimmed.to_owned();
            }
        }
    }
    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let trimmed = real_ip.trim();
        if !trimmed.is_empty() {
            return trimmed.to_owned();
        }
    }
    addr.ip().to_string()
}

// ── Health ───────────────────────────────────────────────────────────────────

pub async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

// ── Store ────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct StoreBody {
    /// Raw text for `kind=text`, standard base64 for `kind=file`.
    pub payload: String,
    pub kind: SecretKind,
    /// One of the allowed TTL labels (1h, 6h, 12h, 1d, 7d).
    pub ttl: String,
    pub filename: Option<String>,
    pub mimetype: Option<String>,
    #[serde(default)]
    pub peek_allowed: bool,
    pub view_limit: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct StoreResponse {
    pub id: String,
    pub expires_at: i64,
}

pub async fn store_secret(
    State(state): State<AppState>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<StoreBody>,
) -> Response {
    let ip = extract_ip(&headers, &addr);

    let payload = match body.kind {
        SecretKind::Text => body.payload.into_bytes(),
        SecretKind::File => match BASE64.decode(&body.payload) {
            Ok(bytes) => bytes,
            Err(_) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({"error": "file payload must be valid base64"})),
                )
                    .into_response();
            }
        },
    };

    let req = StoreRequest {
        payload,
        kind: body.kind,
        filename: body.filename,
        mimetype: body.mimetype,
        ttl: body.ttl,
        peek_allowed: body.peek_allowed,
        view_limit: body.view_limit.unwrap_or(1),
    };

    match state.exchange.store(&ip, req) {
        Ok(StoreResult::Stored { id, expires_at }) => {
            info!(id = %id, expires_at, "secret stored");
            (StatusCode::CREATED, Json(StoreResponse { id, expires_at })).into_response()
        }
        Ok(StoreResult::PayloadTooLarge { size, max }) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": format!("payload of {size} bytes exceeds the {max}-byte limit")})),
        )
            .into_response(),
        Ok(StoreResult::InvalidTtl(label)) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": format!("unknown ttl '{label}' — use one of 1h, 6h, 12h, 1d, 7d")})),
        )
            .into_response(),
        Ok(StoreResult::Throttled) => throttled(),
        Ok(StoreResult::IdsExhausted) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "could not allocate an identifier"})),
        )
            .into_response(),
        Err(e) => unavailable(e),
    }
}

// ── Claim ────────────────────────────────────────────────────────────────────

fn secret_json(id: &str, secret: &Secret) -> serde_json::Value {
    let payload = match secret.kind {
        SecretKind::Text => String::from_utf8_lossy(&secret.payload).into_owned(),
        SecretKind::File => BASE64.encode(&secret.payload),
    };
    json!({
        "id": id,
        "payload": payload,
        "kind": secret.kind,
        "filename": secret.filename,
        "mimetype": secret.mimetype,
    })
}

pub async fn claim_secret(
    State(state): State<AppState>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<String>,
) -> Response {
    let ip = extract_ip(&headers, &addr);
    match state.exchange.claim(&ip, &id) {
        Ok(ClaimResult::Claimed(secret)) => {
            info!(id = %id, "secret claimed");
            Json(secret_json(&id, &secret)).into_response()
        }
        Ok(ClaimResult::NotFound) => not_found(),
        Ok(ClaimResult::Throttled) => throttled(),
        Err(e) => unavailable(e),
    }
}

// ── Peek ─────────────────────────────────────────────────────────────────────

pub async fn peek_secret(
    State(state): State<AppState>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<String>,
) -> Response {
    let ip = extract_ip(&headers, &addr);
    match state.exchange.peek(&ip, &id) {
        Ok(PeekResult::Peeked {
            secret,
            views_remaining,
        }) => {
            let mut body = secret_json(&id, &secret);
            body["views_remaining"] = json!(views_remaining);
            Json(body).into_response()
        }
        Ok(PeekResult::NotFound) => not_found(),
        Ok(PeekResult::Denied) => (
            StatusCode::GONE,
            Json(json!({"error": "maximum previews reached"})),
        )
            .into_response(),
        Ok(PeekResult::Throttled) => throttled(),
        Err(e) => unavailable(e),
    }
}

// ── Revoke ───────────────────────────────────────────────────────────────────

pub async fn revoke_secret(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.exchange.revoke(&id) {
        Ok(RevokeResult::Revoked) => Json(json!({"revoked": true})).into_response(),
        Ok(RevokeResult::NotFound) => not_found(),
        Err(e) => unavailable(e),
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": "not found, expired, or already claimed"})),
    )
        .into_response()
}

fn throttled() -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({"error": "rate limit exceeded — retry after the window elapses"})),
    )
        .into_response()
}

/// Backend transport failure. Deliberately not a 404 — "secret is gone" must
/// never be confused with "we couldn't check".
fn unavailable(e: anyhow::Error) -> Response {
    tracing::error!(error = %e, "storage backend error");
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({"error": "storage backend unavailable"})),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_ip_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.7, 10.0.0.1".parse().unwrap());
        headers.insert("x-real-ip", "198.51.100.2".parse().unwrap());
        let addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        assert_eq!(extract_ip(&headers, &addr), "203.0.113.7");
    }

    #[test]
    fn extract_ip_falls_back_to_real_ip_then_peer() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", "198.51.100.2".parse().unwrap());
        let addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        assert_eq!(extract_ip(&headers, &addr), "198.51.100.2");

        let empty = HeaderMap::new();
        assert_eq!(extract_ip(&empty, &addr), "127.0.0.1");
    }

    #[test]
    fn extract_ip_ignores_empty_header_values() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "  ".parse().unwrap());
        let addr: SocketAddr = "192.0.2.4:1234".parse().unwrap();
        assert_eq!(extract_ip(&headers, &addr), "192.0.2.4");
    }
}
