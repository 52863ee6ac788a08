//! HTTP handlers served behind the limiters.
//!
//! Authentication and profile storage live elsewhere; these handlers stand in
//! for them so each endpoint class has something to gate.

use axum::extract::Request;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::ratelimit::ClientIdentity;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// Health check endpoint. Never rate limited.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientResponse {
    pub address: String,
    pub user_agent: String,
}

/// Report the identity the limiters key this client by.
pub async fn current_client(request: Request) -> Json<ClientResponse> {
    let identity = ClientIdentity::from_headers(request.headers());
    Json(ClientResponse {
        address: identity.address,
        user_agent: identity.user_agent,
    })
}

/// Placeholder for the authentication provider's routes.
pub async fn auth(request: Request) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::OK,
        Json(serde_json::json!({ "path": request.uri().path() })),
    )
}

/// Anything else under `/api`.
pub async fn not_found() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": "Not found" })),
    )
}
