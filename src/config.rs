//! Run configuration.
//!
//! Defaults match the command-line tool; every knob can be overridden from a
//! `BUD_*` environment variable.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fetch::RetryPolicy;
use crate::policy::{EffectivePolicy, PolicyConfig, PolicyError};

/// Name of the policy applied when no rule matches.
pub const DEFAULT_POLICY_NAME: &str = "Default";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("{field} {reason}")]
    OutOfRange {
        field: &'static str,
        reason: &'static str,
    },

    #[error("failed to read policy file {path}: {source}")]
    PolicyFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Policy(#[from] PolicyError),
}

/// Settings for one analysis run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisConfig {
    /// Months of history to analyze
    pub analysis_months: u32,
    /// Percent added on top of peak spend
    pub growth_buffer: f64,
    /// Floor for any recommended budget
    pub minimum_budget: f64,
    /// Granularity of recommended budgets
    pub rounding_increment: f64,
    pub aws_region: String,
    /// Accounts fetched in parallel
    pub concurrency: usize,
    pub max_retries: u32,
    /// Base backoff between retries, in milliseconds
    pub backoff_ms: u64,
    /// Role assumed in member accounts for budget reads
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assume_role_name: Option<String>,
    /// Restrict the run to these account ids
    #[serde(default)]
    pub accounts: Vec<String>,
    /// Restrict the run to accounts directly inside these groups
    #[serde(default)]
    pub organizational_units: Vec<String>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            analysis_months: 3,
            growth_buffer: 20.0,
            minimum_budget: 10.0,
            rounding_increment: 10.0,
            aws_region: "us-east-1".to_string(),
            concurrency: 5,
            max_retries: 3,
            backoff_ms: 1000,
            assume_role_name: None,
            accounts: Vec::new(),
            organizational_units: Vec::new(),
        }
    }
}

fn parse_value<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse::<T>().map_err(|e| ConfigError::InvalidValue {
        key,
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl AnalysisConfig {
    /// Defaults overlaid with `BUD_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup("BUD_ANALYSIS_MONTHS") {
            config.analysis_months = parse_value("BUD_ANALYSIS_MONTHS", &v)?;
        }
        if let Some(v) = lookup("BUD_GROWTH_BUFFER") {
            config.growth_buffer = parse_value("BUD_GROWTH_BUFFER", &v)?;
        }
        if let Some(v) = lookup("BUD_MINIMUM_BUDGET") {
            config.minimum_budget = parse_value("BUD_MINIMUM_BUDGET", &v)?;
        }
        if let Some(v) = lookup("BUD_ROUNDING_INCREMENT") {
            config.rounding_increment = parse_value("BUD_ROUNDING_INCREMENT", &v)?;
        }
        if let Some(v) = lookup("BUD_AWS_REGION") {
            let v = v.trim();
            if !v.is_empty() {
                config.aws_region = v.to_string();
            }
        }
        if let Some(v) = lookup("BUD_CONCURRENCY") {
            config.concurrency = parse_value("BUD_CONCURRENCY", &v)?;
        }
        if let Some(v) = lookup("BUD_MAX_RETRIES") {
            config.max_retries = parse_value("BUD_MAX_RETRIES", &v)?;
        }
        if let Some(v) = lookup("BUD_BACKOFF_MS") {
            config.backoff_ms = parse_value("BUD_BACKOFF_MS", &v)?;
        }
        if let Some(v) = lookup("BUD_ASSUME_ROLE_NAME") {
            let v = v.trim();
            config.assume_role_name = (!v.is_empty()).then(|| v.to_string());
        }
        if let Some(v) = lookup("BUD_ACCOUNTS") {
            config.accounts = parse_list(&v);
        }
        if let Some(v) = lookup("BUD_ORGANIZATIONAL_UNITS") {
            config.organizational_units = parse_list(&v);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.analysis_months == 0 {
            return Err(ConfigError::OutOfRange {
                field: "analysisMonths",
                reason: "must be at least 1",
            });
        }
        if self.concurrency == 0 {
            return Err(ConfigError::OutOfRange {
                field: "concurrency",
                reason: "must be at least 1",
            });
        }
        let amounts = [
            ("growthBuffer", self.growth_buffer),
            ("minimumBudget", self.minimum_budget),
            ("roundingIncrement", self.rounding_increment),
        ];
        for (field, value) in amounts {
            if !value.is_finite() {
                return Err(ConfigError::OutOfRange {
                    field,
                    reason: "must be a finite number",
                });
            }
            if value < 0.0 {
                return Err(ConfigError::OutOfRange {
                    field,
                    reason: "must not be negative",
                });
            }
        }
        Ok(())
    }

    /// Policy applied to accounts no rule matches.
    pub fn default_policy(&self) -> EffectivePolicy {
        EffectivePolicy::new(
            DEFAULT_POLICY_NAME,
            self.growth_buffer,
            self.minimum_budget,
            self.rounding_increment,
        )
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, Duration::from_millis(self.backoff_ms))
    }
}

/// Read and parse a YAML policy document.
pub async fn load_policy_file(path: &Path) -> Result<PolicyConfig, ConfigError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::PolicyFile {
            path: path.to_path_buf(),
            source,
        })?;
    let policies = PolicyConfig::from_yaml_str(&content)?;
    tracing::info!(
        path = %path.display(),
        account_policies = policies.account_policies.len(),
        tag_policies = policies.tag_policies.len(),
        ou_policies = policies.group_policies.len(),
        "Loaded policy configuration"
    );
    Ok(policies)
}
