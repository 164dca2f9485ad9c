//! Organizational group and tag lookups for policy resolution.
//!
//! Accounts are loaded one after another rather than on the worker pool: the
//! directory is called at most twice per account and only when tag or group
//! rules exist.

use std::collections::HashMap;

use tokio_util::sync::CancellationToken;

use super::{with_retry, RetryPolicy};
use crate::accounts::AccountRef;
use crate::remote::DirectoryService;

/// Read-only snapshot of per-account grouping and tags.
///
/// Built once before resolution starts; never written afterwards.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataCache {
    groups: HashMap<String, String>,
    tags: HashMap<String, HashMap<String, String>>,
}

impl MetadataCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_group(&mut self, account_id: impl Into<String>, group_id: impl Into<String>) {
        self.groups.insert(account_id.into(), group_id.into());
    }

    pub fn insert_tags(&mut self, account_id: impl Into<String>, tags: HashMap<String, String>) {
        self.tags.insert(account_id.into(), tags);
    }

    /// Parent group of an account. An empty id is a valid group.
    pub fn group(&self, account_id: &str) -> Option<&str> {
        self.groups.get(account_id).map(String::as_str)
    }

    pub fn tags(&self, account_id: &str) -> Option<&HashMap<String, String>> {
        self.tags.get(account_id)
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty() && self.tags.is_empty()
    }
}

/// Load parent group and tags for every account.
///
/// Lookup failures are not fatal. A failed parent lookup skips the account
/// entirely; a failed tag lookup keeps the group but records no tags.
/// Cancellation stops the loop and returns what has been loaded so far.
pub async fn load_metadata(
    directory: &dyn DirectoryService,
    accounts: &[AccountRef],
    retry: &RetryPolicy,
    cancel: &CancellationToken,
) -> MetadataCache {
    let mut cache = MetadataCache::new();
    let mut skipped = 0usize;

    for account in accounts {
        if cancel.is_cancelled() {
            tracing::debug!("Metadata load interrupted by cancellation");
            break;
        }

        let parent = match with_retry(retry, cancel, "list_parent", &account.id, || {
            directory.list_parent(&account.id)
        })
        .await
        {
            Ok(parent) => parent,
            Err(e) => {
                tracing::debug!(account_id = %account.id, "Skipping metadata: {}", e);
                skipped += 1;
                continue;
            }
        };
        if let Some(group_id) = parent {
            cache.insert_group(account.id.clone(), group_id);
        }

        match with_retry(retry, cancel, "list_tags", &account.id, || {
            directory.list_tags(&account.id)
        })
        .await
        {
            Ok(tags) => cache.insert_tags(account.id.clone(), tags),
            Err(e) => tracing::debug!(account_id = %account.id, "Tags unavailable: {}", e),
        }
    }

    tracing::info!(
        accounts = accounts.len(),
        with_group = cache.groups.len(),
        with_tags = cache.tags.len(),
        skipped,
        "Account metadata loaded"
    );
    cache
}
