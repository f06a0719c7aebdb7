//! Data transfer objects for changelog responses and cache payloads.
//!
//! These structs are serialized to JSON both for HTTP consumers and as the
//! value stored in the cache.
//! - `commit`: Commit plus message helpers
//! - `page`: Page of commits with pagination metadata

pub mod commit;
pub mod page;

pub use commit::*;
pub use page::*;
