//! Local working-copy provider.
//!
//! The repository and branch are checked with libgit2 first so a bad path
//! or branch gives a precise error, then the configured git binary lists
//! the page with `git log`. One extra record is requested to compute
//! `has_more`. The child process is killed if it outlives the timeout.
//!
//! `git log` only prints fixed-shape header fields, one record per line.
//! Messages are read back from the object database by sha, so nothing a
//! commit author writes can forge a record boundary.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use git2::{Oid, Repository};
use tokio::process::Command;

use super::{
    CommitQuery, CommitSource, ProviderContext, FILTER_AUTHOR, FILTER_PATH, FILTER_SEARCH, FILTER_SINCE,
    FILTER_UNTIL,
};
use crate::error::{GatewayError, Result};
use crate::models::{split_message, Commit, Page};
use crate::settings::{SourceKind, SourceSettings};

const FIELD_SEP: char = '\x1f';
const LOG_FIELDS: usize = 5;
// sha, short sha, author name, author email, committer date
const LOG_FORMAT: &str = "--format=%H%x1f%h%x1f%an%x1f%ae%x1f%cI";

pub struct GitProvider {
    repo_path: PathBuf,
    binary: String,
    timeout: Duration,
}

impl GitProvider {
    pub fn new(settings: &SourceSettings, ctx: &ProviderContext) -> Result<Self> {
        let repo_path = settings
            .git
            .repo_path
            .as_deref()
            .ok_or_else(|| GatewayError::Configuration("git_repo_path is required".to_string()))?;

        Ok(Self {
            repo_path: PathBuf::from(repo_path),
            binary: settings.git.binary_path.clone(),
            timeout: ctx.git_timeout,
        })
    }

    fn log_args(&self, query: &CommitQuery) -> Result<Vec<String>> {
        let mut args = vec![
            "log".to_string(),
            "--no-color".to_string(),
            LOG_FORMAT.to_string(),
            format!("--skip={}", query.skip()),
            format!("--max-count={}", query.per_page as usize + 1),
        ];
        if !query.include_merges {
            args.push("--no-merges".to_string());
        }

        let author = query.filter(FILTER_AUTHOR);
        let search = query.filter(FILTER_SEARCH);
        if author.is_some() || search.is_some() {
            args.push("--regexp-ignore-case".to_string());
            args.push("--fixed-strings".to_string());
        }
        if let Some(author) = author {
            args.push(format!("--author={}", author));
        }
        if let Some(search) = search {
            args.push(format!("--grep={}", search));
        }
        if let Some(since) = query.date_filter(FILTER_SINCE)? {
            args.push(format!("--since={}", since));
        }
        if let Some(until) = query.date_filter(FILTER_UNTIL)? {
            args.push(format!("--until={}", until));
        }

        args.push(query.branch.clone());
        args.push("--".to_string());
        if let Some(path) = query.filter(FILTER_PATH) {
            args.push(path.to_string());
        }
        Ok(args)
    }

    /// The binary runs inside the repository with no system-wide config,
    /// no pager and no credential prompt.
    fn git_command(&self) -> Command {
        let mut command = Command::new(&self.binary);
        command
            .current_dir(&self.repo_path)
            .env("GIT_CONFIG_NOSYSTEM", "1")
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("GIT_PAGER", "cat")
            .stdin(Stdio::null())
            .kill_on_drop(true);
        command
    }

    async fn run_git(&self, args: &[String]) -> Result<String> {
        let mut command = self.git_command();
        command.args(args);

        let output = match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(GatewayError::Upstream(format!(
                    "git binary not found: {}",
                    self.binary
                )));
            }
            Ok(Err(e)) => {
                return Err(GatewayError::Upstream(format!(
                    "failed to run {}: {}",
                    self.binary, e
                )));
            }
            Err(_) => {
                return Err(GatewayError::Upstream(format!(
                    "git log timed out after {:?}",
                    self.timeout
                )));
            }
        };

        if !output.status.success() {
            return Err(GatewayError::Upstream(format!(
                "git log exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl CommitSource for GitProvider {
    fn kind(&self) -> SourceKind {
        SourceKind::Git
    }

    #[tracing::instrument(skip(self, query), fields(repo = %self.repo_path.display(), page = query.page))]
    async fn fetch_commits(&self, query: &CommitQuery) -> Result<Page> {
        let args = self.log_args(query)?;

        let path = self.repo_path.clone();
        let branch = query.branch.clone();
        tokio::task::spawn_blocking(move || verify_repository(&path, &branch))
            .await
            .map_err(|e| GatewayError::Upstream(format!("repository check failed: {}", e)))??;

        let start = std::time::Instant::now();
        let stdout = self.run_git(&args).await?;
        let mut commits = parse_log(&stdout);

        let has_more = commits.len() > query.per_page as usize;
        commits.truncate(query.per_page as usize);

        let path = self.repo_path.clone();
        let commits = tokio::task::spawn_blocking(move || attach_messages(&path, commits))
            .await
            .map_err(|e| GatewayError::Upstream(format!("reading commit messages failed: {}", e)))??;
        tracing::debug!("git log returned {} commits in {:?}", commits.len(), start.elapsed());

        Ok(Page::new(commits, query.page, query.per_page, has_more))
    }
}

fn verify_repository(path: &Path, branch: &str) -> Result<()> {
    let repo = Repository::open(path).map_err(|e| {
        GatewayError::Upstream(format!(
            "{} is not a git repository: {}",
            path.display(),
            e.message()
        ))
    })?;
    repo.revparse_single(branch)
        .and_then(|obj| obj.peel_to_commit())
        .map_err(|_| GatewayError::Upstream(format!("unknown branch: {}", branch)))?;
    Ok(())
}

/// Fill in title and body from the commit objects themselves.
fn attach_messages(path: &Path, mut commits: Vec<Commit>) -> Result<Vec<Commit>> {
    if commits.is_empty() {
        return Ok(commits);
    }
    let repo = Repository::open(path)
        .map_err(|e| GatewayError::Upstream(format!("failed to reopen {}: {}", path.display(), e.message())))?;
    for commit in &mut commits {
        let object = Oid::from_str(&commit.sha)
            .and_then(|oid| repo.find_commit(oid))
            .map_err(|e| GatewayError::Upstream(format!("commit {} not readable: {}", commit.sha, e.message())))?;
        let (title, body) = split_message(&String::from_utf8_lossy(object.message_bytes()));
        commit.title = title;
        commit.body = body;
    }
    Ok(commits)
}

/// SHA-1 or SHA-256 object name.
fn is_object_id(value: &str) -> bool {
    matches!(value.len(), 40 | 64) && value.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Parse `LOG_FORMAT` output. A line must carry exactly the expected
/// fields and a full object name, anything else is skipped.
fn parse_log(stdout: &str) -> Vec<Commit> {
    stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(FIELD_SEP).collect();
            if fields.len() != LOG_FIELDS || !is_object_id(fields[0]) {
                tracing::warn!("Skipping malformed git log record");
                return None;
            }
            let email = fields[3].trim();
            Some(Commit {
                sha: fields[0].to_string(),
                short_sha: fields[1].trim().to_string(),
                title: String::new(),
                body: String::new(),
                author_name: fields[2].trim().to_string(),
                author_email: if email.is_empty() { None } else { Some(email.to_string()) },
                committed_at: fields[4].trim().to_string(),
                url: None,
            })
        })
        .collect()
}
