//! Account discovery and filtering.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::remote::{DirectoryService, RemoteError};

/// A billable account in the organization.
///
/// Identity is `id`; the other fields are informational.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountRef {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub alias: String,
}

impl AccountRef {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: id.into(),
            alias: name.clone(),
            name,
            email: String::new(),
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = email.into();
        self
    }
}

/// List every active account from the directory.
pub async fn discover_accounts(
    directory: &dyn DirectoryService,
) -> Result<Vec<AccountRef>, RemoteError> {
    let accounts = directory.list_accounts().await?;
    tracing::info!(count = accounts.len(), "Discovered accounts");
    Ok(accounts)
}

/// Keep only the accounts whose id is in `ids`, preserving input order.
///
/// An empty filter keeps everything.
pub fn filter_by_ids(accounts: Vec<AccountRef>, ids: &[String]) -> Vec<AccountRef> {
    if ids.is_empty() {
        return accounts;
    }
    let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
    accounts
        .into_iter()
        .filter(|a| wanted.contains(a.id.as_str()))
        .collect()
}

/// Keep only the accounts that sit directly inside one of `group_ids`.
///
/// Any directory failure is returned together with the group that caused it.
pub async fn filter_by_groups(
    directory: &dyn DirectoryService,
    accounts: Vec<AccountRef>,
    group_ids: &[String],
) -> Result<Vec<AccountRef>, (String, RemoteError)> {
    if group_ids.is_empty() {
        return Ok(accounts);
    }

    let mut members: HashSet<String> = HashSet::new();
    for group_id in group_ids {
        let ids = directory
            .list_accounts_in_group(group_id)
            .await
            .map_err(|e| (group_id.clone(), e))?;
        members.extend(ids);
    }

    Ok(accounts
        .into_iter()
        .filter(|a| members.contains(&a.id))
        .collect())
}
