//! Commit sources behind the gateway.
//!
//! - `github`: hosted repository API through `SafeHttpClient`
//! - `git`: local working copy through the git binary
//!
//! Providers always perform a real fetch; caching and locking live in the
//! gateway. `build_provider` turns settings into the `Provider` sum type,
//! and `ProviderFactory` is the seam the gateway builds through.

pub mod git;
pub mod github;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};

use crate::error::{GatewayError, Result};
use crate::http::RequestOptions;
use crate::models::Page;
use crate::security::UrlPolicy;
use crate::settings::{SourceKind, SourceSettings};

pub use git::GitProvider;
pub use github::GitHubProvider;

/// Author name or email substring.
pub const FILTER_AUTHOR: &str = "author";
/// Lower bound on commit date (RFC 3339 or `YYYY-MM-DD`).
pub const FILTER_SINCE: &str = "since";
/// Upper bound on commit date (RFC 3339 or `YYYY-MM-DD`).
pub const FILTER_UNTIL: &str = "until";
/// Only commits touching this path.
pub const FILTER_PATH: &str = "path";
/// Case-insensitive substring of the commit message.
pub const FILTER_SEARCH: &str = "search";

pub const DEFAULT_GIT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitQuery {
    pub branch: String,
    pub per_page: u32,
    pub page: u32,
    pub include_merges: bool,
    pub filters: BTreeMap<String, String>,
}

impl CommitQuery {
    pub fn new<B, I>(branch: B, per_page: u32, page: u32, include_merges: bool, filters: I) -> Self
    where
        B: Into<String>,
        I: IntoIterator<Item = (String, String)>,
    {
        Self {
            branch: branch.into(),
            per_page,
            page: page.max(1),
            include_merges,
            filters: filters
                .into_iter()
                .filter(|(_, v)| !v.trim().is_empty())
                .collect(),
        }
    }

    /// Number of commits before this page.
    pub fn skip(&self) -> usize {
        (self.page as usize - 1) * self.per_page as usize
    }

    pub fn filter(&self, name: &str) -> Option<&str> {
        self.filters.get(name).map(|v| v.trim())
    }

    /// `since`/`until` normalized to RFC 3339 UTC.
    pub fn date_filter(&self, name: &str) -> Result<Option<String>> {
        self.filter(name).map(normalize_date).transpose()
    }
}

fn normalize_date(raw: &str) -> Result<String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc).to_rfc3339_opts(SecondsFormat::Secs, true));
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        if let Some(dt) = date.and_hms_opt(0, 0, 0) {
            return Ok(dt.and_utc().to_rfc3339_opts(SecondsFormat::Secs, true));
        }
    }
    Err(GatewayError::Configuration(format!(
        "invalid date filter: {}",
        raw
    )))
}

#[async_trait]
pub trait CommitSource: Send + Sync {
    fn kind(&self) -> SourceKind;

    async fn fetch_commits(&self, query: &CommitQuery) -> Result<Page>;
}

/// Supplies secrets by name, e.g. from the process environment.
pub trait CredentialResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Option<String>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct EnvCredentials;

impl CredentialResolver for EnvCredentials {
    fn resolve(&self, name: &str) -> Option<String> {
        std::env::var(name).ok().filter(|v| !v.trim().is_empty())
    }
}

#[derive(Debug, Default, Clone)]
pub struct StaticCredentials(pub HashMap<String, String>);

impl CredentialResolver for StaticCredentials {
    fn resolve(&self, name: &str) -> Option<String> {
        self.0.get(name).cloned()
    }
}

/// Everything a provider needs besides its settings.
#[derive(Clone)]
pub struct ProviderContext {
    pub credentials: Arc<dyn CredentialResolver>,
    /// Operator policy for remote providers. Settings may only pick an API
    /// host inside its suffix allowlist; an empty allowlist means the
    /// public GitHub API only.
    pub url_policy: UrlPolicy,
    pub http_options: RequestOptions,
    pub git_timeout: Duration,
}

impl Default for ProviderContext {
    fn default() -> Self {
        Self {
            credentials: Arc::new(EnvCredentials),
            url_policy: UrlPolicy::default(),
            http_options: RequestOptions::default(),
            git_timeout: DEFAULT_GIT_TIMEOUT,
        }
    }
}

pub enum Provider {
    GitHub(GitHubProvider),
    Git(GitProvider),
}

#[async_trait]
impl CommitSource for Provider {
    fn kind(&self) -> SourceKind {
        match self {
            Provider::GitHub(_) => SourceKind::GitHub,
            Provider::Git(_) => SourceKind::Git,
        }
    }

    async fn fetch_commits(&self, query: &CommitQuery) -> Result<Page> {
        match self {
            Provider::GitHub(p) => p.fetch_commits(query).await,
            Provider::Git(p) => p.fetch_commits(query).await,
        }
    }
}

/// Fails fast with `Configuration` when required source fields are missing.
pub fn build_provider(settings: &SourceSettings, ctx: &ProviderContext) -> Result<Provider> {
    match settings.kind {
        SourceKind::GitHub => Ok(Provider::GitHub(GitHubProvider::new(settings, ctx)?)),
        SourceKind::Git => Ok(Provider::Git(GitProvider::new(settings, ctx)?)),
    }
}

pub trait ProviderFactory: Send + Sync {
    fn build(&self, settings: &SourceSettings) -> Result<Arc<dyn CommitSource>>;
}

#[derive(Clone, Default)]
pub struct DefaultProviderFactory {
    ctx: ProviderContext,
}

impl DefaultProviderFactory {
    pub fn new(ctx: ProviderContext) -> Self {
        Self { ctx }
    }
}

impl ProviderFactory for DefaultProviderFactory {
    fn build(&self, settings: &SourceSettings) -> Result<Arc<dyn CommitSource>> {
        Ok(Arc::new(build_provider(settings, &self.ctx)?))
    }
}
