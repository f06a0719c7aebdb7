//! Typed view over the caller-supplied settings map.
//!
//! The gateway never persists settings; it parses the map on every call.
//! Numeric fields accept JSON numbers or numeric strings and fall back to
//! their defaults when absent or unparsable. Clamping happens here so every
//! consumer sees the same bounds.

use serde_json::{Map, Value};

use crate::error::{GatewayError, Result};

pub const DEFAULT_BRANCH: &str = "main";
pub const DEFAULT_PER_PAGE: u32 = 20;
pub const MIN_PER_PAGE: u32 = 1;
pub const MAX_PER_PAGE: u32 = 50;
pub const DEFAULT_CACHE_TTL_SECS: u64 = 300;
pub const MIN_CACHE_TTL_SECS: u64 = 30;
pub const MAX_CACHE_TTL_SECS: u64 = 3600;
pub const DEFAULT_TOKEN_ENV_KEY: &str = "GITHUB_TOKEN";
pub const DEFAULT_GIT_BINARY: &str = "git";
pub const DEFAULT_GITHUB_API_BASE: &str = "https://api.github.com";

pub type SettingsMap = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    GitHub,
    Git,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::GitHub => "github",
            SourceKind::Git => "git",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenMode {
    /// Read the bearer token through the credential resolver under `env_key`.
    Env { env_key: String },
    /// Anonymous requests.
    None,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitHubSettings {
    pub owner: Option<String>,
    pub repo: Option<String>,
    pub token_mode: TokenMode,
    pub api_base_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitSettings {
    pub repo_path: Option<String>,
    pub binary_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSettings {
    pub kind: SourceKind,
    pub branch: String,
    pub per_page: u32,
    pub cache_ttl_secs: u64,
    pub github: GitHubSettings,
    pub git: GitSettings,
}

impl SourceSettings {
    /// Parse the settings map. Only an unknown `source_type`, an unknown
    /// token mode or an unsafe branch name fail here; missing source fields
    /// are reported when the provider is built.
    pub fn from_map(map: &SettingsMap) -> Result<Self> {
        let kind = match string_field(map, "source_type").as_deref() {
            None | Some("github") => SourceKind::GitHub,
            Some("git") => SourceKind::Git,
            Some(other) => {
                return Err(GatewayError::Configuration(format!(
                    "unknown source_type: {}",
                    other
                )));
            }
        };

        let branch = string_field(map, "branch").unwrap_or_else(|| DEFAULT_BRANCH.to_string());
        validate_branch(&branch)?;

        let per_page = clamp_per_page(int_field(map, "per_page").unwrap_or(DEFAULT_PER_PAGE as i64));
        let cache_ttl_secs =
            clamp_ttl(int_field(map, "cache_ttl_seconds").unwrap_or(DEFAULT_CACHE_TTL_SECS as i64));

        let token_mode = match string_field(map, "github_token_mode").as_deref() {
            None | Some("env") => TokenMode::Env {
                env_key: string_field(map, "github_token_env_key")
                    .unwrap_or_else(|| DEFAULT_TOKEN_ENV_KEY.to_string()),
            },
            Some("none") => TokenMode::None,
            Some(other) => {
                return Err(GatewayError::Configuration(format!(
                    "unsupported github_token_mode: {}",
                    other
                )));
            }
        };

        Ok(Self {
            kind,
            branch,
            per_page,
            cache_ttl_secs,
            github: GitHubSettings {
                owner: string_field(map, "github_owner"),
                repo: string_field(map, "github_repo"),
                token_mode,
                api_base_url: string_field(map, "github_api_base_url")
                    .unwrap_or_else(|| DEFAULT_GITHUB_API_BASE.to_string()),
            },
            git: GitSettings {
                repo_path: string_field(map, "git_repo_path"),
                binary_path: string_field(map, "git_binary_path")
                    .unwrap_or_else(|| DEFAULT_GIT_BINARY.to_string()),
            },
        })
    }

    /// Identity of the upstream source, folded into cache keys so two
    /// repositories never share entries.
    pub fn source_identity(&self) -> String {
        match self.kind {
            SourceKind::GitHub => format!(
                "{}/{}@{}",
                self.github.owner.as_deref().unwrap_or(""),
                self.github.repo.as_deref().unwrap_or(""),
                self.github.api_base_url
            ),
            SourceKind::Git => self.git.repo_path.clone().unwrap_or_default(),
        }
    }
}

pub fn clamp_per_page(value: i64) -> u32 {
    value.clamp(MIN_PER_PAGE as i64, MAX_PER_PAGE as i64) as u32
}

pub fn clamp_ttl(value: i64) -> u64 {
    value.clamp(MIN_CACHE_TTL_SECS as i64, MAX_CACHE_TTL_SECS as i64) as u64
}

/// Branch names are passed to git and to the GitHub API; refuse anything
/// that could be read as an option or a revision range.
pub fn validate_branch(branch: &str) -> Result<()> {
    let bad = branch.is_empty()
        || branch.starts_with('-')
        || branch.contains("..")
        || branch
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || "~^:?*[\\".contains(c));
    if bad {
        return Err(GatewayError::Configuration(format!(
            "invalid branch name: {:?}",
            branch
        )));
    }
    Ok(())
}

fn string_field(map: &SettingsMap, key: &str) -> Option<String> {
    match map.get(key)? {
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() { None } else { Some(s.to_string()) }
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn int_field(map: &SettingsMap, key: &str) -> Option<i64> {
    match map.get(key)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> SettingsMap {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn defaults() {
        let s = SourceSettings::from_map(&SettingsMap::new()).unwrap();
        assert_eq!(s.kind, SourceKind::GitHub);
        assert_eq!(s.branch, "main");
        assert_eq!(s.per_page, 20);
        assert_eq!(s.cache_ttl_secs, 300);
        assert_eq!(
            s.github.token_mode,
            TokenMode::Env {
                env_key: "GITHUB_TOKEN".into()
            }
        );
        assert_eq!(s.git.binary_path, "git");
    }

    #[test]
    fn clamps_ttl_and_page_size() {
        let s = SourceSettings::from_map(&map(json!({"cache_ttl_seconds": 5, "per_page": 0}))).unwrap();
        assert_eq!(s.cache_ttl_secs, 30);
        assert_eq!(s.per_page, 1);

        let s = SourceSettings::from_map(&map(json!({"cache_ttl_seconds": 999999, "per_page": 500})))
            .unwrap();
        assert_eq!(s.cache_ttl_secs, 3600);
        assert_eq!(s.per_page, 50);
    }

    #[test]
    fn numeric_strings_are_accepted() {
        let s = SourceSettings::from_map(&map(json!({"per_page": "7", "cache_ttl_seconds": "bogus"})))
            .unwrap();
        assert_eq!(s.per_page, 7);
        assert_eq!(s.cache_ttl_secs, 300);
    }

    #[test]
    fn unknown_source_type_is_configuration_error() {
        let err = SourceSettings::from_map(&map(json!({"source_type": "svn"}))).unwrap_err();
        assert_eq!(err.kind(), "configuration");
    }

    #[test]
    fn rejects_option_like_branches() {
        for branch in ["--all", "main..dev", "a b", "", "HEAD~1", "a:b"] {
            assert!(validate_branch(branch).is_err(), "{:?}", branch);
        }
        assert!(validate_branch("release/1.2").is_ok());
    }

    #[test]
    fn source_identity_differs_per_repo() {
        let a = SourceSettings::from_map(&map(json!({"github_owner": "o", "github_repo": "a"}))).unwrap();
        let b = SourceSettings::from_map(&map(json!({"github_owner": "o", "github_repo": "b"}))).unwrap();
        assert_ne!(a.source_identity(), b.source_identity());
    }
}
