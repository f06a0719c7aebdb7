//! Cache-aside changelog gateway.
//!
//! `fetch_page` serves one page of commits:
//! 1. fresh cache read (hit → return)
//! 2. bounded lock acquire on the key
//!    - held: re-read the cache, otherwise fetch from the provider, store
//!      the page with the clamped TTL, release
//!    - busy: serve a stale entry if one exists, otherwise fetch directly
//!
//! Upstream failures fall back to stale data when there is any. Cache or
//! lock store failures only cost the cache: the page is fetched directly.
//! Callers never wait on another caller's fetch beyond `lock_wait`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::cache::{cache_key, lock_key, CacheStore, LockGuard, LockStore};
use crate::error::{GatewayError, Result};
use crate::models::{Commit, Page};
use crate::provider::{CommitQuery, CommitSource, DefaultProviderFactory, ProviderContext, ProviderFactory};
use crate::settings::{SettingsMap, SourceSettings};

#[derive(Debug, Clone)]
pub struct GatewayOptions {
    /// Lock self-expiry. Longer than any provider timeout so a live holder
    /// keeps the key, short enough that a crashed one does not wedge it.
    pub lock_ttl: Duration,
    /// Upper bound on waiting for the lock before treating it as busy.
    pub lock_wait: Duration,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(30),
            lock_wait: Duration::from_secs(2),
        }
    }
}

/// Where a page came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchOutcome {
    /// Fresh cache entry.
    Hit,
    /// Fetched under the lock and written to the cache.
    Populated,
    /// Expired entry served instead of waiting or failing.
    Stale,
    /// Fetched without the lock (busy or unavailable).
    Direct,
}

/// Result of a "test source" check.
#[derive(Debug, Clone, Serialize)]
pub struct SourceCheck {
    pub ok: bool,
    pub source_type: Option<&'static str>,
    pub error_kind: Option<&'static str>,
    pub message: String,
    pub latest_commit: Option<Commit>,
}

impl SourceCheck {
    pub fn failed(err: &GatewayError) -> Self {
        Self {
            ok: false,
            source_type: None,
            error_kind: Some(err.kind()),
            message: err.to_string(),
            latest_commit: None,
        }
    }
}

pub struct ChangelogGateway {
    cache: Arc<dyn CacheStore>,
    locks: Arc<dyn LockStore>,
    providers: Arc<dyn ProviderFactory>,
    options: GatewayOptions,
}

impl ChangelogGateway {
    pub fn new(cache: Arc<dyn CacheStore>, locks: Arc<dyn LockStore>, ctx: ProviderContext) -> Self {
        Self::with_factory(cache, locks, Arc::new(DefaultProviderFactory::new(ctx)))
    }

    pub fn with_factory(
        cache: Arc<dyn CacheStore>,
        locks: Arc<dyn LockStore>,
        providers: Arc<dyn ProviderFactory>,
    ) -> Self {
        Self {
            cache,
            locks,
            providers,
            options: GatewayOptions::default(),
        }
    }

    pub fn with_options(mut self, options: GatewayOptions) -> Self {
        self.options = options;
        self
    }

    /// Build the provider the settings select, without fetching.
    pub fn build_provider(&self, settings: &SettingsMap) -> Result<Arc<dyn CommitSource>> {
        let source = SourceSettings::from_map(settings)?;
        self.providers.build(&source)
    }

    pub async fn fetch_page(
        &self,
        settings: &SettingsMap,
        page: u32,
        include_merges: bool,
        filters: &HashMap<String, String>,
    ) -> Result<Page> {
        self.fetch_page_with_outcome(settings, page, include_merges, filters)
            .await
            .map(|(page, _)| page)
    }

    #[tracing::instrument(skip(self, settings, filters), fields(key = tracing::field::Empty))]
    pub async fn fetch_page_with_outcome(
        &self,
        settings: &SettingsMap,
        page: u32,
        include_merges: bool,
        filters: &HashMap<String, String>,
    ) -> Result<(Page, FetchOutcome)> {
        let source = SourceSettings::from_map(settings)?;
        let query = CommitQuery::new(
            source.branch.clone(),
            source.per_page,
            page,
            include_merges,
            filters.iter().map(|(k, v)| (k.clone(), v.clone())),
        );
        let key = cache_key(&source, &query);
        let ttl = Duration::from_secs(source.cache_ttl_secs);
        tracing::Span::current().record("key", key.as_str());

        if let Some(page) = self.read(&key, false).await {
            tracing::debug!("Cache hit");
            return Ok((page, FetchOutcome::Hit));
        }

        let guard = LockGuard::acquire(
            self.locks.clone(),
            &lock_key(&key),
            self.options.lock_ttl,
            self.options.lock_wait,
        )
        .await;

        match guard {
            Ok(Some(guard)) => {
                let result = self.populate(&source, &query, &key, ttl).await;
                guard.release().await;
                result
            }
            Ok(None) => {
                if let Some(page) = self.read(&key, true).await {
                    tracing::debug!("Lock busy; serving stale entry");
                    return Ok((page, FetchOutcome::Stale));
                }
                tracing::debug!("Lock busy and nothing cached; fetching directly");
                self.fetch_and_store(&source, &query, &key, ttl, FetchOutcome::Direct)
                    .await
            }
            Err(e) => {
                tracing::warn!("Lock store unavailable, fetching directly: {}", e);
                self.fetch_and_store(&source, &query, &key, ttl, FetchOutcome::Direct)
                    .await
            }
        }
    }

    /// Build the provider and fetch the newest commit, bypassing the cache.
    pub async fn test_source(&self, settings: &SettingsMap) -> SourceCheck {
        let result = async {
            let source = SourceSettings::from_map(settings)?;
            let provider = self.providers.build(&source)?;
            let query = CommitQuery::new(source.branch.clone(), 1, 1, true, Vec::new());
            let page = provider.fetch_commits(&query).await?;
            Ok::<_, GatewayError>((provider.kind(), page))
        }
        .await;

        match result {
            Ok((kind, page)) => SourceCheck {
                ok: true,
                source_type: Some(kind.as_str()),
                error_kind: None,
                message: format!("Connected to {} source", kind.as_str()),
                latest_commit: page.commits.into_iter().next(),
            },
            Err(e) => SourceCheck::failed(&e),
        }
    }

    /// Lock held: re-check the cache before going upstream.
    async fn populate(
        &self,
        source: &SourceSettings,
        query: &CommitQuery,
        key: &str,
        ttl: Duration,
    ) -> Result<(Page, FetchOutcome)> {
        if let Some(page) = self.read(key, false).await {
            tracing::debug!("Cache filled while waiting for lock");
            return Ok((page, FetchOutcome::Hit));
        }
        self.fetch_and_store(source, query, key, ttl, FetchOutcome::Populated)
            .await
    }

    async fn fetch_and_store(
        &self,
        source: &SourceSettings,
        query: &CommitQuery,
        key: &str,
        ttl: Duration,
        outcome: FetchOutcome,
    ) -> Result<(Page, FetchOutcome)> {
        let provider = self.providers.build(source)?;

        match provider.fetch_commits(query).await {
            Ok(page) => {
                self.write(key, &page, ttl).await;
                tracing::info!(
                    "Fetched {} commits from {} (page {}, has_more={})",
                    page.len(),
                    source.kind.as_str(),
                    page.page,
                    page.has_more
                );
                Ok((page, outcome))
            }
            Err(e) if e.is_upstream() => match self.read(key, true).await {
                Some(stale) => {
                    tracing::warn!("Upstream failed, serving stale entry: {}", e);
                    Ok((stale, FetchOutcome::Stale))
                }
                None => Err(e),
            },
            Err(e) => Err(e),
        }
    }

    /// Store and payload errors read as misses.
    async fn read(&self, key: &str, allow_stale: bool) -> Option<Page> {
        let raw = if allow_stale {
            self.cache.get_allowing_stale(key).await
        } else {
            self.cache.get(key).await
        };
        let raw = match raw {
            Ok(raw) => raw?,
            Err(e) => {
                tracing::warn!("Cache read failed for {}: {}", key, e);
                return None;
            }
        };
        match Page::from_payload(&raw) {
            Ok(page) => Some(page),
            Err(e) => {
                tracing::warn!("Ignoring undecodable cache entry {}: {}", key, e);
                None
            }
        }
    }

    async fn write(&self, key: &str, page: &Page, ttl: Duration) {
        let payload = match page.to_payload() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!("Failed to serialize page for {}: {}", key, e);
                return;
            }
        };
        if let Err(e) = self.cache.set(key, &payload, ttl).await {
            tracing::warn!("Cache write failed for {}: {}", key, e);
        }
    }
}
