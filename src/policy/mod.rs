//! Policy resolver - picks the recommendation policy for each account.
//!
//! # Resolution order
//! 1. Account rule (exact account id)
//! 2. Tag rule (exact key and value, case-sensitive)
//! 3. Group rule (exact organizational group id)
//! 4. Default policy
//!
//! Within one kind the first rule in configuration order wins. A matched rule
//! is merged onto the default field by field; unset fields are inherited.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fetch::MetadataCache;
use crate::remote::{DirectoryService, RemoteError};

/// Fully populated policy applied to one account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectivePolicy {
    pub name: String,
    /// Percent added on top of peak spend
    pub growth_buffer: f64,
    /// Floor for the recommended budget
    pub minimum_budget: f64,
    /// Granularity of the recommended budget (0 disables rounding)
    pub rounding_increment: f64,
}

impl EffectivePolicy {
    pub fn new(
        name: impl Into<String>,
        growth_buffer: f64,
        minimum_budget: f64,
        rounding_increment: f64,
    ) -> Self {
        Self {
            name: name.into(),
            growth_buffer,
            minimum_budget,
            rounding_increment,
        }
    }
}

/// Overridable fields of a rule. Empty name and non-positive numbers mean
/// "not set".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PolicyOverrides {
    pub name: String,
    pub growth_buffer: f64,
    pub minimum_budget: f64,
    pub rounding_increment: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountRule {
    pub account: String,
    #[serde(flatten)]
    pub overrides: PolicyOverrides,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagRule {
    pub tag_key: String,
    #[serde(default)]
    pub tag_value: String,
    #[serde(flatten)]
    pub overrides: PolicyOverrides,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupRule {
    #[serde(rename = "ou", default)]
    pub group_id: String,
    #[serde(flatten)]
    pub overrides: PolicyOverrides,
}

/// Rule lists as configured.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PolicyConfig {
    pub account_policies: Vec<AccountRule>,
    pub tag_policies: Vec<TagRule>,
    #[serde(rename = "ouPolicies")]
    pub group_policies: Vec<GroupRule>,
}

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("invalid policy document: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("policy rule '{rule}' is invalid: {reason}")]
    InvalidRule { rule: String, reason: String },

    #[error("policy rule '{rule}': OU {group_id} does not exist or is not accessible: {source}")]
    UnknownGroup {
        rule: String,
        group_id: String,
        #[source]
        source: RemoteError,
    },
}

/// Display label for a rule: its name, or its position in the document.
fn rule_label(overrides: &PolicyOverrides, list: &str, idx: usize) -> String {
    if overrides.name.is_empty() {
        format!("{}[{}]", list, idx)
    } else {
        overrides.name.clone()
    }
}

impl PolicyConfig {
    /// Parse a YAML policy document and check its rules.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, PolicyError> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject tag rules without a key; tag keys are never empty.
    pub fn validate(&self) -> Result<(), PolicyError> {
        for (idx, rule) in self.tag_policies.iter().enumerate() {
            if rule.tag_key.is_empty() {
                return Err(PolicyError::InvalidRule {
                    rule: rule_label(&rule.overrides, "tagPolicies", idx),
                    reason: "tag key is empty".to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.account_policies.is_empty()
            && self.tag_policies.is_empty()
            && self.group_policies.is_empty()
    }

    /// Tag and group rules need per-account metadata; account rules do not.
    pub fn needs_metadata(&self) -> bool {
        !self.tag_policies.is_empty() || !self.group_policies.is_empty()
    }
}

/// Check that every group referenced by a group rule exists.
///
/// Stops at the first failure, naming the rule and the group.
pub async fn validate_groups(
    directory: &dyn DirectoryService,
    config: &PolicyConfig,
) -> Result<(), PolicyError> {
    if config.group_policies.is_empty() {
        return Ok(());
    }
    tracing::info!(
        groups = config.group_policies.len(),
        "Validating configured OUs"
    );

    for (idx, rule) in config.group_policies.iter().enumerate() {
        if let Err(source) = directory.describe_group(&rule.group_id).await {
            return Err(PolicyError::UnknownGroup {
                rule: rule_label(&rule.overrides, "ouPolicies", idx),
                group_id: rule.group_id.clone(),
                source,
            });
        }
    }
    Ok(())
}

/// Merge `overrides` onto `base`, returning a new policy.
pub fn merge_policy(base: &EffectivePolicy, overrides: &PolicyOverrides) -> EffectivePolicy {
    let mut policy = base.clone();
    if !overrides.name.is_empty() {
        policy.name = overrides.name.clone();
    }
    if overrides.growth_buffer > 0.0 {
        policy.growth_buffer = overrides.growth_buffer;
    }
    if overrides.minimum_budget > 0.0 {
        policy.minimum_budget = overrides.minimum_budget;
    }
    if overrides.rounding_increment > 0.0 {
        policy.rounding_increment = overrides.rounding_increment;
    }
    policy
}

/// Resolves policies from an immutable rule set and metadata snapshot.
///
/// Rules are indexed by key at construction; each bucket keeps the position
/// of the first rule in configuration order, so lookups give the same answer
/// as a linear first-match scan.
#[derive(Debug, Clone)]
pub struct PolicyResolver {
    config: PolicyConfig,
    default: EffectivePolicy,
    metadata: MetadataCache,
    by_account: HashMap<String, usize>,
    by_tag: HashMap<String, HashMap<String, usize>>,
    by_group: HashMap<String, usize>,
}

impl PolicyResolver {
    pub fn new(config: PolicyConfig, default: EffectivePolicy, metadata: MetadataCache) -> Self {
        let mut by_account = HashMap::new();
        for (idx, rule) in config.account_policies.iter().enumerate() {
            by_account.entry(rule.account.clone()).or_insert(idx);
        }

        let mut by_tag: HashMap<String, HashMap<String, usize>> = HashMap::new();
        for (idx, rule) in config.tag_policies.iter().enumerate() {
            by_tag
                .entry(rule.tag_key.clone())
                .or_default()
                .entry(rule.tag_value.clone())
                .or_insert(idx);
        }

        let mut by_group = HashMap::new();
        for (idx, rule) in config.group_policies.iter().enumerate() {
            by_group.entry(rule.group_id.clone()).or_insert(idx);
        }

        Self {
            config,
            default,
            metadata,
            by_account,
            by_tag,
            by_group,
        }
    }

    /// Effective policy for `account_id`.
    pub fn resolve(&self, account_id: &str) -> EffectivePolicy {
        if let Some(&idx) = self.by_account.get(account_id) {
            return merge_policy(&self.default, &self.config.account_policies[idx].overrides);
        }

        if let Some(idx) = self.first_tag_rule(account_id) {
            return merge_policy(&self.default, &self.config.tag_policies[idx].overrides);
        }

        if let Some(idx) = self
            .metadata
            .group(account_id)
            .and_then(|group| self.by_group.get(group))
        {
            return merge_policy(&self.default, &self.config.group_policies[*idx].overrides);
        }

        self.default.clone()
    }

    /// Earliest configured tag rule matched by any of the account's tags.
    fn first_tag_rule(&self, account_id: &str) -> Option<usize> {
        let tags = self.metadata.tags(account_id)?;
        tags.iter()
            .filter_map(|(key, value)| self.by_tag.get(key)?.get(value).copied())
            .min()
    }
}
