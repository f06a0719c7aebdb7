//! Changelog gateway - cached, single-flight commit history retrieval.
//!
//! Fetches pages of commits from GitHub or a local git working copy behind a
//! TTL cache with a per-key lock, serving stale pages when the lock is busy
//! or the upstream fails. Outbound HTTP goes through a policy-checked client
//! that refuses internal addresses and unexpected redirect targets.

pub mod cache;
pub mod error;
pub mod gateway;
pub mod http;
pub mod models;
pub mod provider;
pub mod routes;
pub mod security;
pub mod settings;

pub use error::{GatewayError, Result, SecurityError, StoreError};
pub use gateway::{ChangelogGateway, FetchOutcome, GatewayOptions, SourceCheck};
pub use models::{Commit, Page};
pub use provider::{build_provider, CommitQuery, CommitSource, Provider, ProviderContext};
pub use settings::{SettingsMap, SourceSettings};
