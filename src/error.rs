//! Gateway error types and HTTP response mapping.
//!
//! Defines `GatewayError` for every failure the changelog gateway can report
//! and implements Axum's `IntoResponse` so handlers can return it directly
//! with a JSON error body.
//!
//! Error mappings:
//! - `Configuration` → 400
//! - `Security` → 403
//! - `Upstream` → 502
//! - `Store` → 503

use std::net::IpAddr;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Security error: {0}")]
    Security(#[from] SecurityError),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl GatewayError {
    /// Stable discriminator reported to "test source" callers.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Configuration(_) => "configuration",
            GatewayError::Security(_) => "security",
            GatewayError::Upstream(_) => "upstream",
            GatewayError::Store(_) => "store",
        }
    }

    pub fn is_upstream(&self) -> bool {
        matches!(self, GatewayError::Upstream(_))
    }
}

impl From<git2::Error> for GatewayError {
    fn from(e: git2::Error) -> Self {
        GatewayError::Upstream(format!("git: {}", e.message()))
    }
}

/// Reasons a URL is refused before any request is issued.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SecurityError {
    #[error("invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("scheme not allowed: {0}")]
    SchemeNotAllowed(String),

    #[error("URL has no host")]
    EmptyHost,

    #[error("loopback host not allowed: {0}")]
    LoopbackHost(String),

    #[error("IP literal hosts are not allowed: {0}")]
    IpLiteralNotAllowed(String),

    #[error("host {0} is not in the allowlist")]
    HostNotAllowed(String),

    #[error("host {0} did not resolve")]
    Unresolvable(String),

    #[error("host {host} resolves to internal address {addr}")]
    InternalAddress { host: String, addr: IpAddr },

    #[error("redirect without a usable Location: {0}")]
    BadRedirect(String),

    #[error("too many redirects (limit {0})")]
    RedirectLimit(usize),
}

/// Cache or lock store failure. Never surfaced from `fetch_page`.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store payload error: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = match &self {
            GatewayError::Configuration(_) => StatusCode::BAD_REQUEST,
            GatewayError::Security(_) => StatusCode::FORBIDDEN,
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
        };

        let body = Json(json!({
            "error": self.to_string(),
            "kind": self.kind(),
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
