//! GitHub REST commits provider.
//!
//! `GET {api}/repos/{owner}/{repo}/commits?sha=&per_page=&page=`, with the
//! `author`, `since`, `until` and `path` filters passed upstream. Merge
//! exclusion and `search` have no upstream parameter and are applied to the
//! returned page; `has_more` still describes the upstream page.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, LINK};
use serde::de::IgnoredAny;
use serde::Deserialize;
use url::Url;

use super::{
    CommitQuery, CommitSource, ProviderContext, FILTER_AUTHOR, FILTER_PATH, FILTER_SEARCH, FILTER_SINCE,
    FILTER_UNTIL,
};
use crate::error::{GatewayError, Result, SecurityError};
use crate::http::{RequestOptions, SafeHttpClient};
use crate::models::{short_sha, split_message, Commit, Page};
use crate::security::host_allowed;
use crate::settings::{SourceKind, SourceSettings, TokenMode};

const API_VERSION: &str = "2022-11-28";

/// Allowlist used when the operator configured none.
pub const DEFAULT_API_HOST: &str = "api.github.com";

pub struct GitHubProvider {
    owner: String,
    repo: String,
    api_base: Url,
    token: Option<String>,
    client: SafeHttpClient,
    options: RequestOptions,
}

impl GitHubProvider {
    pub fn new(settings: &SourceSettings, ctx: &ProviderContext) -> Result<Self> {
        let owner = required(settings.github.owner.as_deref(), "github_owner")?;
        let repo = required(settings.github.repo.as_deref(), "github_repo")?;

        let api_base = Url::parse(&settings.github.api_base_url).map_err(|e| {
            GatewayError::Configuration(format!(
                "invalid github_api_base_url {}: {}",
                settings.github.api_base_url, e
            ))
        })?;
        let api_host = match api_base.host_str() {
            Some(host) if !api_base.cannot_be_a_base() => host.to_string(),
            _ => {
                return Err(GatewayError::Configuration(format!(
                    "github_api_base_url has no host: {}",
                    api_base
                )));
            }
        };

        // The allowlist is operator configuration; settings only pick a
        // host inside it.
        let mut policy = ctx.url_policy.clone();
        if policy.allowed_host_suffixes.is_empty() {
            policy.allowed_host_suffixes = vec![DEFAULT_API_HOST.to_string()];
        }
        if !host_allowed(&api_host, &policy.allowed_host_suffixes) {
            return Err(SecurityError::HostNotAllowed(api_host).into());
        }

        let token = match &settings.github.token_mode {
            TokenMode::Env { env_key } => {
                let token = ctx.credentials.resolve(env_key);
                if token.is_none() {
                    tracing::debug!("No GitHub token under {}; using anonymous requests", env_key);
                }
                token
            }
            TokenMode::None => None,
        };

        Ok(Self {
            owner,
            repo,
            api_base,
            token,
            client: SafeHttpClient::new(policy),
            options: ctx.http_options.clone(),
        })
    }

    fn commits_url(&self, query: &CommitQuery) -> Result<Url> {
        let mut url = self.api_base.clone();
        url.path_segments_mut()
            .map_err(|_| GatewayError::Configuration("github_api_base_url cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(["repos", self.owner.as_str(), self.repo.as_str(), "commits"]);

        let since = query.date_filter(FILTER_SINCE)?;
        let until = query.date_filter(FILTER_UNTIL)?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs
                .append_pair("sha", &query.branch)
                .append_pair("per_page", &query.per_page.to_string())
                .append_pair("page", &query.page.to_string());
            if let Some(author) = query.filter(FILTER_AUTHOR) {
                pairs.append_pair("author", author);
            }
            if let Some(path) = query.filter(FILTER_PATH) {
                pairs.append_pair("path", path);
            }
            if let Some(since) = &since {
                pairs.append_pair("since", since);
            }
            if let Some(until) = &until {
                pairs.append_pair("until", until);
            }
        }
        Ok(url)
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
        headers.insert("x-github-api-version", HeaderValue::from_static(API_VERSION));
        if let Some(token) = &self.token {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|_| GatewayError::Configuration("GitHub token contains invalid characters".to_string()))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }
        Ok(headers)
    }
}

#[async_trait]
impl CommitSource for GitHubProvider {
    fn kind(&self) -> SourceKind {
        SourceKind::GitHub
    }

    #[tracing::instrument(skip(self, query), fields(owner = %self.owner, repo = %self.repo, page = query.page))]
    async fn fetch_commits(&self, query: &CommitQuery) -> Result<Page> {
        let url = self.commits_url(query)?;
        let response = self.client.get(url.as_str(), self.headers()?, &self.options).await?;

        if !response.status.is_success() {
            let rate_limited = response
                .headers
                .get("x-ratelimit-remaining")
                .and_then(|v| v.to_str().ok())
                == Some("0");
            let message = serde_json::from_str::<ApiError>(&response.body)
                .map(|e| e.message)
                .unwrap_or_default();
            return Err(GatewayError::Upstream(format!(
                "GitHub returned {} for {}/{}{}{}",
                response.status,
                self.owner,
                self.repo,
                if rate_limited { " (rate limited)" } else { "" },
                if message.is_empty() { String::new() } else { format!(": {}", message) },
            )));
        }

        let raw: Vec<ApiCommit> = serde_json::from_str(&response.body)
            .map_err(|e| GatewayError::Upstream(format!("malformed GitHub payload: {}", e)))?;

        let link = response.headers.get(LINK).and_then(|v| v.to_str().ok());
        let has_more = upstream_has_more(link, raw.len(), query.per_page);
        let upstream_count = raw.len();

        let search = query.filter(FILTER_SEARCH).map(|s| s.to_lowercase());
        let commits: Vec<Commit> = raw
            .into_iter()
            .filter(|c| query.include_merges || c.parents.len() < 2)
            .filter(|c| match &search {
                Some(needle) => c.commit.message.to_lowercase().contains(needle),
                None => true,
            })
            .map(ApiCommit::into_commit)
            .collect();

        tracing::debug!(
            "GitHub page {}: {} upstream, {} after filtering, has_more={}",
            query.page,
            upstream_count,
            commits.len(),
            has_more
        );

        Ok(Page::new(commits, query.page, query.per_page, has_more))
    }
}

fn required(value: Option<&str>, name: &str) -> Result<String> {
    let value = value.ok_or_else(|| GatewayError::Configuration(format!("{} is required", name)))?;
    let valid = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && value != "."
        && value != "..";
    if !valid {
        return Err(GatewayError::Configuration(format!("invalid {}: {}", name, value)));
    }
    Ok(value.to_string())
}

/// A `Link` header is authoritative; without one a full page implies more.
fn upstream_has_more(link: Option<&str>, returned: usize, per_page: u32) -> bool {
    match link {
        Some(link) => link.split(',').any(|part| {
            part.split(';')
                .skip(1)
                .any(|param| param.trim().replace(' ', "") == "rel=\"next\"")
        }),
        None => returned >= per_page as usize,
    }
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ApiCommit {
    sha: String,
    #[serde(default)]
    html_url: Option<String>,
    commit: ApiCommitData,
    /// Only counted, to tell merges apart.
    #[serde(default)]
    parents: Vec<IgnoredAny>,
}

#[derive(Debug, Deserialize)]
struct ApiCommitData {
    message: String,
    #[serde(default)]
    author: Option<ApiSignature>,
    #[serde(default)]
    committer: Option<ApiSignature>,
}

#[derive(Debug, Deserialize)]
struct ApiSignature {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    date: Option<String>,
}

impl ApiCommit {
    fn into_commit(self) -> Commit {
        let (title, body) = split_message(&self.commit.message);
        let author = self.commit.author.as_ref();
        let committed_at = self
            .commit
            .committer
            .as_ref()
            .and_then(|c| c.date.clone())
            .or_else(|| author.and_then(|a| a.date.clone()))
            .unwrap_or_default();

        Commit {
            short_sha: short_sha(&self.sha),
            title,
            body,
            author_name: author
                .and_then(|a| a.name.clone())
                .unwrap_or_else(|| "Unknown".to_string()),
            author_email: author.and_then(|a| a.email.clone()).filter(|e| !e.is_empty()),
            committed_at,
            url: self.html_url,
            sha: self.sha,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::StaticCredentials;
    use crate::security::UrlPolicy;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn provider(extra: serde_json::Value) -> Result<GitHubProvider> {
        provider_with_policy(extra, UrlPolicy::default())
    }

    fn provider_with_policy(extra: serde_json::Value, url_policy: UrlPolicy) -> Result<GitHubProvider> {
        let mut map = json!({"github_owner": "acme", "github_repo": "site"});
        for (k, v) in extra.as_object().unwrap() {
            map[k] = v.clone();
        }
        let settings = SourceSettings::from_map(map.as_object().unwrap()).unwrap();
        let ctx = ProviderContext {
            credentials: Arc::new(StaticCredentials(HashMap::from([
                ("CHANGELOG_TOKEN".to_string(), "s3cret".to_string()),
                ("DATABASE_PASSWORD".to_string(), "hunter2".to_string()),
            ]))),
            url_policy,
            ..ProviderContext::default()
        };
        GitHubProvider::new(&settings, &ctx)
    }

    #[test]
    fn builds_commits_url_with_upstream_filters() {
        let p = provider(json!({})).unwrap();
        let query = CommitQuery::new(
            "release/1.x",
            10,
            2,
            false,
            [
                ("author".to_string(), "ada".to_string()),
                ("since".to_string(), "2024-01-01".to_string()),
                ("search".to_string(), "fix".to_string()),
            ],
        );
        let url = p.commits_url(&query).unwrap();
        assert_eq!(url.path(), "/repos/acme/site/commits");
        let pairs: HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs["sha"], "release/1.x");
        assert_eq!(pairs["per_page"], "10");
        assert_eq!(pairs["page"], "2");
        assert_eq!(pairs["author"], "ada");
        assert_eq!(pairs["since"], "2024-01-01T00:00:00Z");
        assert!(!pairs.contains_key("search"));
    }

    #[test]
    fn enterprise_base_keeps_its_path_prefix() {
        let p = provider_with_policy(
            json!({"github_api_base_url": "https://ghe.example.com/api/v3/"}),
            UrlPolicy::allowlist(["ghe.example.com"]),
        )
        .unwrap();
        let url = p.commits_url(&CommitQuery::new("main", 5, 1, true, Vec::new())).unwrap();
        assert_eq!(url.path(), "/api/v3/repos/acme/site/commits");
        assert_eq!(p.client.policy().allowed_host_suffixes, vec!["ghe.example.com".to_string()]);
    }

    #[test]
    fn default_allowlist_is_the_public_api() {
        let p = provider(json!({})).unwrap();
        assert_eq!(p.client.policy().allowed_host_suffixes, vec![DEFAULT_API_HOST.to_string()]);
    }

    #[test]
    fn settings_cannot_widen_the_allowlist() {
        let hostile = json!({
            "github_api_base_url": "https://attacker.example",
            "github_token_env_key": "DATABASE_PASSWORD",
        });
        let err = provider(hostile.clone()).err().unwrap();
        assert!(matches!(
            err,
            GatewayError::Security(SecurityError::HostNotAllowed(ref host)) if host == "attacker.example"
        ));

        let err = provider_with_policy(hostile, UrlPolicy::allowlist(["ghe.example.com"]))
            .err()
            .unwrap();
        assert_eq!(err.kind(), "security");

        // A suffix match must sit on a label boundary.
        let err = provider_with_policy(
            json!({"github_api_base_url": "https://evilghe.example.com"}),
            UrlPolicy::allowlist(["ghe.example.com"]),
        )
        .err()
        .unwrap();
        assert_eq!(err.kind(), "security");
    }

    #[test]
    fn token_comes_from_named_credential() {
        let p = provider(json!({"github_token_env_key": "CHANGELOG_TOKEN"})).unwrap();
        let headers = p.headers().unwrap();
        assert_eq!(headers[AUTHORIZATION], "Bearer s3cret");
        assert!(headers[AUTHORIZATION].is_sensitive());

        let anonymous = provider(json!({"github_token_mode": "none"})).unwrap();
        assert!(anonymous.headers().unwrap().get(AUTHORIZATION).is_none());

        let missing = provider(json!({"github_token_env_key": "UNSET_TOKEN"})).unwrap();
        assert!(missing.headers().unwrap().get(AUTHORIZATION).is_none());
    }

    #[test]
    fn rejects_path_like_owner() {
        let err = provider(json!({"github_owner": "../admin"})).err().unwrap();
        assert_eq!(err.kind(), "configuration");
    }

    #[test]
    fn link_header_drives_has_more() {
        let next = r#"<https://api.github.com/x?page=3>; rel="next", <https://api.github.com/x?page=9>; rel="last""#;
        let last = r#"<https://api.github.com/x?page=1>; rel="first", <https://api.github.com/x?page=1>; rel="prev""#;
        assert!(upstream_has_more(Some(next), 3, 20));
        assert!(!upstream_has_more(Some(last), 20, 20));
        assert!(upstream_has_more(None, 20, 20));
        assert!(!upstream_has_more(None, 19, 20));
    }

    #[test]
    fn maps_api_commit() {
        let raw: ApiCommit = serde_json::from_value(json!({
            "sha": "0123456789abcdef0123456789abcdef01234567",
            "html_url": "https://github.com/acme/site/commit/0123456",
            "commit": {
                "message": "Add changelog page\n\nRenders the last 20 commits.",
                "author": {"name": "Ada", "email": "ada@example.com", "date": "2024-05-01T09:00:00Z"},
                "committer": {"name": "GitHub", "email": "noreply@github.com", "date": "2024-05-01T10:00:00Z"}
            },
            "parents": [{"sha": "ffff"}]
        }))
        .unwrap();
        let commit = raw.into_commit();
        assert_eq!(commit.short_sha, "0123456");
        assert_eq!(commit.title, "Add changelog page");
        assert_eq!(commit.body, "Renders the last 20 commits.");
        assert_eq!(commit.author_name, "Ada");
        assert_eq!(commit.author_email.as_deref(), Some("ada@example.com"));
        assert_eq!(commit.committed_at, "2024-05-01T10:00:00Z");
    }

    #[test]
    fn parents_are_only_counted() {
        let raw: ApiCommit = serde_json::from_value(json!({
            "sha": "0123456789abcdef0123456789abcdef01234567",
            "commit": {"message": "Merge branch 'side'"},
            "parents": [
                {"sha": "aaaa", "url": "https://api.github.com/x", "html_url": "https://github.com/x"},
                {"node": {"oid": "bbbb"}}
            ]
        }))
        .unwrap();
        assert_eq!(raw.parents.len(), 2);

        let root: ApiCommit = serde_json::from_value(json!({
            "sha": "0123456789abcdef0123456789abcdef01234567",
            "commit": {"message": "Initial commit"}
        }))
        .unwrap();
        assert!(root.parents.is_empty());
    }
}
