//! API route handlers - maps HTTP endpoints to the changelog gateway.
//!
//! - `changelog`: paginated changelog and the "test source" check

pub mod changelog;

use std::sync::Arc;

use axum::Router;

use crate::gateway::ChangelogGateway;
use crate::settings::SettingsMap;

pub struct AppState {
    pub gateway: ChangelogGateway,
    /// Settings served by `GET /api/v1/changelog`.
    pub settings: SettingsMap,
}

pub type SharedState = Arc<AppState>;

pub fn create_router(state: SharedState) -> Router {
    Router::new().merge(changelog::routes(state))
}
