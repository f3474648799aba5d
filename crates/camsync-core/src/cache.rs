//! Server capability cache
//!
//! Holds the last-fetched [`ServerInfo`] snapshot. Refresh is all-or-nothing:
//! a fetch that fails part-way leaves the previous snapshot untouched, because
//! the snapshot is only swapped in once fully assembled.

use chrono::{DateTime, Utc};

use crate::models::{ServerInfo, Version};

#[derive(Debug, Clone, PartialEq, Eq)]
struct CachedSnapshot {
    info: ServerInfo,
    fetched_at: DateTime<Utc>,
}

/// Single-writer cache of the server capability snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerInfoCache {
    snapshot: Option<CachedSnapshot>,
    last_observed_version: Option<Version>,
}

impl ServerInfoCache {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            snapshot: None,
            last_observed_version: None,
        }
    }

    /// Replace the snapshot atomically with freshly fetched info
    pub fn refresh(&mut self, info: ServerInfo) {
        self.last_observed_version = Some(info.server_version);
        self.snapshot = Some(CachedSnapshot {
            info,
            fetched_at: Utc::now(),
        });
    }

    /// The cached snapshot, if any
    #[must_use]
    pub fn get(&self) -> Option<&ServerInfo> {
        self.snapshot.as_ref().map(|cached| &cached.info)
    }

    /// When the snapshot was fetched
    #[must_use]
    pub fn fetched_at(&self) -> Option<DateTime<Utc>> {
        self.snapshot.as_ref().map(|cached| cached.fetched_at)
    }

    /// Note a server version seen in passing (any reply may carry one)
    pub fn observe_version(&mut self, version: Version) {
        self.last_observed_version = Some(version);
    }

    /// Does the cache predate the last observed server version change?
    ///
    /// An empty cache is always stale.
    #[must_use]
    pub fn is_stale(&self) -> bool {
        match (&self.snapshot, self.last_observed_version) {
            (None, _) => true,
            (Some(cached), Some(observed)) => cached.info.server_version != observed,
            (Some(_), None) => false,
        }
    }
}
