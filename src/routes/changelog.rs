//! Changelog endpoints.
//!
//! - GET /api/v1/changelog?page=&include_merges=&<filter>=
//!   One page of commits for the configured source. Query keys other than
//!   `page` and `include_merges` are passed through as filters. The
//!   `x-changelog-cache` response header reports hit/populated/stale/direct.
//!
//! - POST /api/v1/changelog/test-source { ...settings }
//!   Builds the provider for the posted settings and fetches one commit,
//!   bypassing the cache. Always 200; failures are described in the body.
//!   Keys in `SERVER_OWNED_KEYS` come from the served settings: a posted
//!   value that differs is rejected, a missing one is filled in.

use std::collections::HashMap;

use axum::{
    extract::{Query, State},
    http::{HeaderName, HeaderValue},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use super::SharedState;
use crate::error::{GatewayError, Result};
use crate::gateway::{FetchOutcome, SourceCheck};
use crate::settings::SettingsMap;

const CACHE_HEADER: &str = "x-changelog-cache";

/// Where a credential is sent, which credential, and which binary runs.
const SERVER_OWNED_KEYS: &[&str] = &["github_api_base_url", "github_token_env_key", "git_binary_path"];

pub fn routes(state: SharedState) -> Router {
    Router::new()
        .route("/api/v1/changelog", get(get_changelog))
        .route("/api/v1/changelog/test-source", post(test_source))
        .with_state(state)
}

async fn get_changelog(
    State(state): State<SharedState>,
    Query(mut params): Query<HashMap<String, String>>,
) -> Result<impl IntoResponse> {
    let page = match params.remove("page") {
        Some(raw) => raw
            .trim()
            .parse::<u32>()
            .map_err(|_| GatewayError::Configuration(format!("invalid page: {}", raw)))?,
        None => 1,
    };
    let include_merges = params
        .remove("include_merges")
        .map(|v| parse_flag(&v))
        .unwrap_or(false);

    let (page, outcome) = state
        .gateway
        .fetch_page_with_outcome(&state.settings, page, include_merges, &params)
        .await?;

    let header = (
        HeaderName::from_static(CACHE_HEADER),
        HeaderValue::from_static(outcome_label(outcome)),
    );
    Ok(([header], Json(page)))
}

async fn test_source(
    State(state): State<SharedState>,
    Json(settings): Json<SettingsMap>,
) -> Json<SourceCheck> {
    match pin_server_owned(settings, &state.settings) {
        Ok(settings) => Json(state.gateway.test_source(&settings).await),
        Err(e) => {
            tracing::warn!("Rejected test-source request: {}", e);
            Json(SourceCheck::failed(&e))
        }
    }
}

fn pin_server_owned(mut posted: SettingsMap, served: &SettingsMap) -> Result<SettingsMap> {
    for key in SERVER_OWNED_KEYS {
        let served_value = served.get(*key);
        match posted.get(*key).cloned() {
            Some(value) if served_value != Some(&value) => {
                return Err(GatewayError::Configuration(format!(
                    "{} cannot be changed from the served settings",
                    key
                )));
            }
            Some(_) => {}
            None => {
                if let Some(value) = served_value {
                    posted.insert(key.to_string(), value.clone());
                }
            }
        }
    }
    Ok(posted)
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn outcome_label(outcome: FetchOutcome) -> &'static str {
    match outcome {
        FetchOutcome::Hit => "hit",
        FetchOutcome::Populated => "populated",
        FetchOutcome::Stale => "stale",
        FetchOutcome::Direct => "direct",
    }
}
