//! Commit record as produced by a provider.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub sha: String,
    pub short_sha: String,
    pub title: String,
    pub body: String,
    pub author_name: String,
    pub author_email: Option<String>,
    /// ISO-8601 commit timestamp.
    pub committed_at: String,
    pub url: Option<String>,
}

/// Length of the display hash when the source does not provide one.
pub const SHORT_SHA_LEN: usize = 7;

/// Split a raw commit message into its title (first line) and body.
pub fn split_message(message: &str) -> (String, String) {
    let message = message.trim();
    match message.split_once('\n') {
        Some((title, body)) => (title.trim().to_string(), body.trim().to_string()),
        None => (message.to_string(), String::new()),
    }
}

pub fn short_sha(sha: &str) -> String {
    sha.chars().take(SHORT_SHA_LEN).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_title_and_body() {
        let (title, body) = split_message("Fix parser\n\nHandles empty input.\n");
        assert_eq!(title, "Fix parser");
        assert_eq!(body, "Handles empty input.");

        let (title, body) = split_message("  One line  ");
        assert_eq!(title, "One line");
        assert!(body.is_empty());
    }

    #[test]
    fn short_sha_truncates() {
        assert_eq!(short_sha("0123456789abcdef"), "0123456");
        assert_eq!(short_sha("abc"), "abc");
    }
}
