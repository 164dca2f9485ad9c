//! Remote collaborators - the account directory, cost and budget services.
//!
//! Only the contracts live here; transports are provided elsewhere (an SDK
//! binding in production, [`fixture::FixtureServices`] for offline runs and
//! tests).
//!
//! # Error model
//! Every call returns a [`RemoteError`] tagged with a [`RemoteErrorKind`].
//! The fetch layer decides retry vs. terminal outcome from the kind alone.
//! [`RemoteError::from_message`] exists for opaque errors whose only signal is
//! their text.

pub mod fixture;

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::accounts::AccountRef;

/// What went wrong at the service boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteErrorKind {
    /// Rate limiting (ThrottlingException, RequestLimitExceeded)
    Throttled,
    /// Service temporarily unavailable
    Unavailable,
    /// Internal error on the service side
    Internal,
    /// Connection-level failure
    Network,
    /// Request timed out
    Timeout,
    /// Caller lacks permission
    AccessDenied,
    /// Resource does not exist
    NotFound,
    /// Anything else
    Other,
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Throttled => "throttled",
            Self::Unavailable => "service unavailable",
            Self::Internal => "internal error",
            Self::Network => "network error",
            Self::Timeout => "timeout",
            Self::AccessDenied => "access denied",
            Self::NotFound => "not found",
            Self::Other => "error",
        };
        f.write_str(s)
    }
}

/// Retry-relevant class of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry with backoff
    Transient,
    /// Terminal, reported as an access outcome
    AccessDenied,
    /// Terminal, a valid "nothing there" outcome
    NotFound,
    /// Terminal, surfaced as a per-account error
    Fatal,
}

impl RemoteErrorKind {
    /// Map a kind onto the retry taxonomy.
    pub fn class(self) -> ErrorClass {
        match self {
            Self::Throttled | Self::Unavailable | Self::Internal | Self::Network | Self::Timeout => {
                ErrorClass::Transient
            }
            Self::AccessDenied => ErrorClass::AccessDenied,
            Self::NotFound => ErrorClass::NotFound,
            Self::Other => ErrorClass::Fatal,
        }
    }
}

/// Error returned by a remote collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Build an error from text alone, inferring the kind from well-known
    /// service error signatures.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind: classify_message(&message),
            message,
        }
    }

    pub fn class(&self) -> ErrorClass {
        self.kind.class()
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

/// Infer a [`RemoteErrorKind`] from an error string.
///
/// Matching is case-sensitive on the service exception names, which is how
/// the services spell them; the network signatures are lowercase.
pub fn classify_message(message: &str) -> RemoteErrorKind {
    if message.contains("ThrottlingException") || message.contains("RequestLimitExceeded") {
        return RemoteErrorKind::Throttled;
    }
    if message.contains("ServiceUnavailable") {
        return RemoteErrorKind::Unavailable;
    }
    if message.contains("InternalError") {
        return RemoteErrorKind::Internal;
    }
    if message.contains("AccessDenied") {
        return RemoteErrorKind::AccessDenied;
    }
    if message.contains("NotFound") {
        return RemoteErrorKind::NotFound;
    }
    if message.contains("timeout") {
        return RemoteErrorKind::Timeout;
    }
    if message.contains("connection") {
        return RemoteErrorKind::Network;
    }
    RemoteErrorKind::Other
}

/// One monthly bucket as returned by the cost service.
///
/// Values are kept as the service sends them; parsing happens in
/// [`crate::fetch::cost`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostPeriod {
    /// Period start date, `YYYY-MM-DD`
    pub start: String,
    /// Unblended cost amount as a decimal string
    pub amount: String,
}

/// Budget definition as returned by the budget service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetDefinition {
    pub name: String,
    /// Limit amount as a decimal string, if the budget has one
    #[serde(default)]
    pub limit_amount: Option<String>,
    #[serde(default)]
    pub time_unit: String,
}

/// Alert type of a budget notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationType {
    Forecasted,
    Actual,
}

/// A notification attached to a budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub notification_type: NotificationType,
    #[serde(default)]
    pub threshold: f64,
}

/// Credentials scope for budget calls against one account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BudgetScope {
    pub account_id: String,
    /// Role to assume in the target account, when cross-account access is configured
    pub role_arn: Option<String>,
}

impl BudgetScope {
    pub fn new(account_id: impl Into<String>, role_name: Option<&str>) -> Self {
        let account_id = account_id.into();
        let role_arn = role_name
            .filter(|name| !name.is_empty())
            .map(|name| assume_role_arn(&account_id, name));
        Self {
            account_id,
            role_arn,
        }
    }
}

/// ARN of a role inside a member account.
pub fn assume_role_arn(account_id: &str, role_name: &str) -> String {
    format!("arn:aws:iam::{}:role/{}", account_id, role_name)
}

/// Organization directory: accounts, their parents and tags.
#[async_trait]
pub trait DirectoryService: Send + Sync {
    /// All active accounts in the organization.
    async fn list_accounts(&self) -> Result<Vec<AccountRef>, RemoteError>;

    /// Direct parent group of an account, if any.
    async fn list_parent(&self, account_id: &str) -> Result<Option<String>, RemoteError>;

    /// Tags attached to an account.
    async fn list_tags(&self, account_id: &str) -> Result<HashMap<String, String>, RemoteError>;

    /// Succeeds if the group exists and is visible to the caller.
    async fn describe_group(&self, group_id: &str) -> Result<(), RemoteError>;

    /// Ids of active accounts directly inside a group (non-recursive).
    async fn list_accounts_in_group(&self, group_id: &str) -> Result<Vec<String>, RemoteError>;
}

/// Monthly cost data, filtered to a single linked account.
#[async_trait]
pub trait CostService: Send + Sync {
    async fn monthly_cost(
        &self,
        account_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<CostPeriod>, RemoteError>;
}

/// Budget configuration of an account.
#[async_trait]
pub trait BudgetService: Send + Sync {
    async fn list_budgets(&self, scope: &BudgetScope) -> Result<Vec<BudgetDefinition>, RemoteError>;

    async fn list_notifications(
        &self,
        scope: &BudgetScope,
        budget_name: &str,
    ) -> Result<Vec<Notification>, RemoteError>;

    /// Subscriber addresses of one notification.
    async fn list_subscribers(
        &self,
        scope: &BudgetScope,
        budget_name: &str,
        notification: &Notification,
    ) -> Result<Vec<String>, RemoteError>;
}
