//! One page of commits, the unit the gateway caches and returns.

use serde::{Deserialize, Serialize};

use super::Commit;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub commits: Vec<Commit>,
    pub page: u32,
    pub per_page: u32,
    pub has_more: bool,
}

impl Page {
    pub fn new(commits: Vec<Commit>, page: u32, per_page: u32, has_more: bool) -> Self {
        Self {
            commits,
            page,
            per_page,
            has_more,
        }
    }

    pub fn len(&self) -> usize {
        self.commits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commits.is_empty()
    }

    /// Serialize into the cache payload. The whole page is one value, so a
    /// store write is either complete or absent.
    pub fn to_payload(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_payload(payload: &str) -> serde_json::Result<Self> {
        serde_json::from_str(payload)
    }
}
