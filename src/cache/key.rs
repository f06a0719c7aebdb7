//! Cache key derivation.
//!
//! Keys look like
//! `changelog:v1:<kind>:<source>:<branch>:p<page>:n<per_page>:m<0|1>[:f<filters>]`
//! where `<source>` and `<filters>` are truncated SHA-256 digests. Filters are
//! hashed in sorted order so insertion order never changes the key.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use crate::provider::CommitQuery;
use crate::settings::SourceSettings;

pub const KEY_PREFIX: &str = "changelog:v1";

const DIGEST_CHARS: usize = 16;

/// Order-independent digest of a filter map; `None` when there are no filters.
pub fn filters_fingerprint<'a, I>(filters: I) -> Option<String>
where
    I: IntoIterator<Item = (&'a String, &'a String)>,
{
    let sorted: BTreeMap<&str, &str> = filters
        .into_iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    if sorted.is_empty() {
        return None;
    }

    let mut hasher = Sha256::new();
    for (k, v) in sorted {
        // Length prefixes keep ("ab","c") distinct from ("a","bc").
        hasher.update((k.len() as u64).to_le_bytes());
        hasher.update(k.as_bytes());
        hasher.update((v.len() as u64).to_le_bytes());
        hasher.update(v.as_bytes());
    }
    Some(format!("{:x}", hasher.finalize()))
}

pub fn cache_key(settings: &SourceSettings, query: &CommitQuery) -> String {
    let mut key = format!(
        "{}:{}:{}:{}:p{}:n{}:m{}",
        KEY_PREFIX,
        settings.kind.as_str(),
        short_digest(&settings.source_identity()),
        query.branch,
        query.page,
        query.per_page,
        if query.include_merges { 1 } else { 0 },
    );
    if let Some(fingerprint) = filters_fingerprint(&query.filters) {
        key.push_str(":f");
        key.push_str(&fingerprint[..DIGEST_CHARS]);
    }
    key
}

pub fn lock_key(cache_key: &str) -> String {
    format!("{}:lock", cache_key)
}

fn short_digest(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..DIGEST_CHARS].to_string()
}
