//! Budget configuration retrieval.
//!
//! Each account yields either its budgets (outcome `success`) or a single
//! marker record whose [`BudgetAccess`] explains why no budget is available.
//! A read interrupted by cancellation yields [`FetchError::Cancelled`]
//! instead, so a half-read account never looks like one without a budget.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::{run_pool, with_retry, FetchError, ProgressCallback, RetryPolicy};
use crate::accounts::AccountRef;
use crate::remote::{BudgetDefinition, BudgetScope, BudgetService, NotificationType};

/// Whether a budget could be read for an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetAccess {
    Success,
    NotFound,
    AccessDenied,
    Error,
}

impl fmt::Display for BudgetAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::NotFound => "not_found",
            Self::AccessDenied => "access_denied",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// A budget of one account, or a marker describing its absence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetRecord {
    pub account_id: String,
    pub account_name: String,
    pub name: String,
    pub limit_amount: f64,
    pub time_unit: String,
    pub has_forecasted: bool,
    pub has_actual: bool,
    pub subscribers: BTreeSet<String>,
    pub access: BudgetAccess,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_error: Option<String>,
}

impl BudgetRecord {
    fn empty(account: &AccountRef, access: BudgetAccess) -> Self {
        Self {
            account_id: account.id.clone(),
            account_name: account.name.clone(),
            name: String::new(),
            limit_amount: 0.0,
            time_unit: String::new(),
            has_forecasted: false,
            has_actual: false,
            subscribers: BTreeSet::new(),
            access,
            access_error: None,
        }
    }

    /// Marker record for an account without a readable budget.
    pub fn marker(account: &AccountRef, access: BudgetAccess, error: Option<String>) -> Self {
        Self {
            access_error: error,
            ..Self::empty(account, access)
        }
    }

    pub fn is_success(&self) -> bool {
        self.access == BudgetAccess::Success
    }
}

/// Parse a limit amount; anything unreadable is zero.
pub fn parse_limit(amount: Option<&str>) -> f64 {
    amount
        .and_then(|a| a.trim().parse::<f64>().ok())
        .filter(|a| a.is_finite())
        .unwrap_or(0.0)
}

/// Records of one account; `Err` only when the read was cancelled.
pub type BudgetOutcome = Result<Vec<BudgetRecord>, FetchError>;

/// Fetches budget records through a [`BudgetService`] with retry.
#[derive(Clone)]
pub struct BudgetFetcher {
    service: Arc<dyn BudgetService>,
    retry: RetryPolicy,
    assume_role: Option<String>,
}

impl BudgetFetcher {
    pub fn new(service: Arc<dyn BudgetService>, retry: RetryPolicy) -> Self {
        Self {
            service,
            retry,
            assume_role: None,
        }
    }

    /// Scope every call with a role assumed in the target account.
    pub fn with_assume_role(mut self, role_name: Option<String>) -> Self {
        self.assume_role = role_name.filter(|r| !r.is_empty());
        self
    }

    /// All budgets of one account, or one marker record.
    ///
    /// Fails only with [`FetchError::Cancelled`].
    pub async fn fetch_account(
        &self,
        account: &AccountRef,
        cancel: &CancellationToken,
    ) -> BudgetOutcome {
        let scope = BudgetScope::new(account.id.clone(), self.assume_role.as_deref());

        let definitions = match with_retry(&self.retry, cancel, "list_budgets", &account.id, || {
            self.service.list_budgets(&scope)
        })
        .await
        {
            Ok(definitions) => definitions,
            Err(FetchError::Cancelled) => return Err(FetchError::Cancelled),
            Err(FetchError::AccessDenied(e)) => {
                tracing::warn!(account_id = %account.id, "Budget access denied: {}", e);
                return Ok(vec![BudgetRecord::marker(
                    account,
                    BudgetAccess::AccessDenied,
                    Some(e.to_string()),
                )]);
            }
            Err(FetchError::NotFound(_)) => {
                return Ok(vec![BudgetRecord::marker(account, BudgetAccess::NotFound, None)]);
            }
            Err(e) => {
                tracing::warn!(account_id = %account.id, error = %e, "Budget fetch failed");
                return Ok(vec![BudgetRecord::marker(
                    account,
                    BudgetAccess::Error,
                    Some(e.to_string()),
                )]);
            }
        };

        if definitions.is_empty() {
            return Ok(vec![BudgetRecord::marker(account, BudgetAccess::NotFound, None)]);
        }

        let mut records = Vec::with_capacity(definitions.len());
        for definition in &definitions {
            records.push(self.describe(account, &scope, definition, cancel).await?);
        }
        Ok(records)
    }

    /// Build a record for one budget, filling alert flags and subscribers.
    ///
    /// Notification and subscriber lookups are best-effort: a failure leaves
    /// the corresponding fields empty. Cancellation is not a failure and is
    /// propagated.
    async fn describe(
        &self,
        account: &AccountRef,
        scope: &BudgetScope,
        definition: &BudgetDefinition,
        cancel: &CancellationToken,
    ) -> Result<BudgetRecord, FetchError> {
        let mut record = BudgetRecord {
            name: definition.name.clone(),
            limit_amount: parse_limit(definition.limit_amount.as_deref()),
            time_unit: definition.time_unit.clone(),
            ..BudgetRecord::empty(account, BudgetAccess::Success)
        };

        let notifications = match with_retry(
            &self.retry,
            cancel,
            "list_notifications",
            &account.id,
            || self.service.list_notifications(scope, &definition.name),
        )
        .await
        {
            Ok(notifications) => notifications,
            Err(FetchError::Cancelled) => return Err(FetchError::Cancelled),
            Err(e) => {
                tracing::debug!(
                    account_id = %account.id,
                    budget = %definition.name,
                    "Notifications unavailable: {}",
                    e
                );
                return Ok(record);
            }
        };

        for notification in &notifications {
            match notification.notification_type {
                NotificationType::Forecasted => record.has_forecasted = true,
                NotificationType::Actual => record.has_actual = true,
            }

            match with_retry(
                &self.retry,
                cancel,
                "list_subscribers",
                &account.id,
                || {
                    self.service
                        .list_subscribers(scope, &definition.name, notification)
                },
            )
            .await
            {
                Ok(addresses) => record.subscribers.extend(addresses),
                Err(FetchError::Cancelled) => return Err(FetchError::Cancelled),
                Err(e) => tracing::debug!(
                    account_id = %account.id,
                    budget = %definition.name,
                    "Subscribers unavailable: {}",
                    e
                ),
            }
        }

        Ok(record)
    }

    /// Fetch every account on a bounded pool, keyed by account id.
    ///
    /// Accounts whose read was interrupted or never started map to
    /// `Err(FetchError::Cancelled)`.
    pub async fn fetch_all(
        &self,
        accounts: &[AccountRef],
        concurrency: usize,
        cancel: &CancellationToken,
        progress: Option<ProgressCallback>,
    ) -> HashMap<String, BudgetOutcome> {
        tracing::info!(
            accounts = accounts.len(),
            concurrency,
            assume_role = ?self.assume_role,
            "Fetching budget configurations"
        );

        let fetcher = self.clone();
        let worker_cancel = cancel.clone();
        let slots = run_pool(
            accounts.to_vec(),
            concurrency,
            cancel.clone(),
            progress,
            move |account: &AccountRef| {
                let fetcher = fetcher.clone();
                let account = account.clone();
                let cancel = worker_cancel.clone();
                async move { fetcher.fetch_account(&account, &cancel).await }
            },
        )
        .await;

        let budgets: HashMap<String, BudgetOutcome> = slots
            .into_iter()
            .zip(accounts)
            .map(|(slot, account)| {
                let outcome = slot.unwrap_or(Err(FetchError::Cancelled));
                (account.id.clone(), outcome)
            })
            .collect();

        let cancelled = budgets.values().filter(|outcome| outcome.is_err()).count();
        let with_budget = budgets
            .values()
            .filter_map(|outcome| outcome.as_ref().ok())
            .filter(|records| records.first().map_or(false, BudgetRecord::is_success))
            .count();
        tracing::info!(
            with_budget,
            without_budget = budgets.len() - with_budget - cancelled,
            cancelled,
            "Budget configurations fetched"
        );
        budgets
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::remote::fixture::{
        FixtureAccount, FixtureBudget, FixtureNotification, FixtureServices, FixtureSnapshot, Op,
    };
    use crate::remote::{Notification, RemoteError, RemoteErrorKind};

    fn budget(name: &str, limit: Option<&str>, notifications: Vec<FixtureNotification>) -> FixtureBudget {
        FixtureBudget {
            definition: BudgetDefinition {
                name: name.to_string(),
                limit_amount: limit.map(str::to_string),
                time_unit: "MONTHLY".to_string(),
            },
            notifications,
        }
    }

    fn notification(kind: NotificationType, threshold: f64, subscribers: &[&str]) -> FixtureNotification {
        FixtureNotification {
            notification: Notification {
                notification_type: kind,
                threshold,
            },
            subscribers: subscribers.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn snapshot() -> FixtureSnapshot {
        let mut snapshot = FixtureSnapshot::default();
        for id in ["a1", "a2", "a3", "a4"] {
            snapshot.accounts.push(FixtureAccount::new(id, id));
        }
        snapshot.budgets.insert(
            "a1".to_string(),
            vec![
                budget(
                    "monthly",
                    Some("430.00"),
                    vec![
                        notification(NotificationType::Actual, 80.0, &["ops@example.com", "fin@example.com"]),
                        notification(NotificationType::Forecasted, 100.0, &["ops@example.com"]),
                    ],
                ),
                budget("quarterly", Some("not-a-number"), Vec::new()),
            ],
        );
        snapshot
    }

    fn services() -> Arc<FixtureServices> {
        Arc::new(FixtureServices::new(snapshot()))
    }

    fn account(id: &str) -> AccountRef {
        AccountRef::new(id, id)
    }

    #[test]
    fn test_parse_limit() {
        assert_eq!(parse_limit(Some("430.50")), 430.5);
        assert_eq!(parse_limit(Some(" 12 ")), 12.0);
        assert_eq!(parse_limit(Some("abc")), 0.0);
        assert_eq!(parse_limit(None), 0.0);
    }

    #[test]
    fn test_access_display() {
        assert_eq!(BudgetAccess::AccessDenied.to_string(), "access_denied");
        assert_eq!(BudgetAccess::NotFound.to_string(), "not_found");
        assert_eq!(
            serde_json::to_string(&BudgetAccess::Success).unwrap(),
            "\"success\""
        );
    }

    #[tokio::test]
    async fn test_fetch_account_reads_flags_and_subscribers() {
        let fetcher = BudgetFetcher::new(services(), RetryPolicy::default());
        let records = fetcher
            .fetch_account(&account("a1"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(records.len(), 2);
        let monthly = &records[0];
        assert!(monthly.is_success());
        assert_eq!(monthly.limit_amount, 430.0);
        assert!(monthly.has_actual);
        assert!(monthly.has_forecasted);
        assert_eq!(
            monthly.subscribers.iter().cloned().collect::<Vec<_>>(),
            vec!["fin@example.com".to_string(), "ops@example.com".to_string()]
        );

        let quarterly = &records[1];
        assert_eq!(quarterly.limit_amount, 0.0);
        assert!(!quarterly.has_actual && !quarterly.has_forecasted);
    }

    #[tokio::test]
    async fn test_no_budgets_is_not_found_marker() {
        let fetcher = BudgetFetcher::new(services(), RetryPolicy::default());
        let records = fetcher
            .fetch_account(&account("a2"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].access, BudgetAccess::NotFound);
        assert!(records[0].access_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_outcomes_become_markers() {
        let services = services();
        services
            .script_failures(
                Op::ListBudgets,
                "a2",
                vec![RemoteError::from_message("AccessDeniedException: nope")],
            )
            .await;
        services
            .script_failures(
                Op::ListBudgets,
                "a3",
                vec![RemoteError::new(RemoteErrorKind::NotFound, "NotFoundException")],
            )
            .await;
        services
            .script_failures(
                Op::ListBudgets,
                "a4",
                vec![RemoteError::new(RemoteErrorKind::Other, "ValidationException")],
            )
            .await;

        let fetcher = BudgetFetcher::new(services.clone(), RetryPolicy::default());
        let accounts: Vec<_> = ["a1", "a2", "a3", "a4"].iter().map(|id| account(id)).collect();
        let budgets = fetcher
            .fetch_all(&accounts, 2, &CancellationToken::new(), None)
            .await;

        assert_eq!(budgets.len(), 4);
        let first = |id: &str| budgets[id].as_ref().unwrap()[0].clone();
        assert_eq!(first("a1").access, BudgetAccess::Success);
        assert_eq!(first("a2").access, BudgetAccess::AccessDenied);
        assert!(first("a2")
            .access_error
            .as_deref()
            .unwrap()
            .contains("AccessDeniedException"));
        assert_eq!(first("a3").access, BudgetAccess::NotFound);
        assert_eq!(first("a4").access, BudgetAccess::Error);
        assert_eq!(services.calls(Op::ListBudgets, "a4").await, 1);
    }

    #[tokio::test]
    async fn test_notification_failure_keeps_budget() {
        let services = services();
        services
            .script_failures(
                Op::ListNotifications,
                "a1",
                vec![RemoteError::new(RemoteErrorKind::AccessDenied, "denied")],
            )
            .await;

        let fetcher = BudgetFetcher::new(services, RetryPolicy::default());
        let records = fetcher
            .fetch_account(&account("a1"), &CancellationToken::new())
            .await
            .unwrap();

        assert!(records[0].is_success());
        assert_eq!(records[0].limit_amount, 430.0);
        assert!(!records[0].has_actual);
        assert!(records[0].subscribers.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_fetch_all_reports_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let fetcher = BudgetFetcher::new(services(), RetryPolicy::default())
            .with_assume_role(Some("OrganizationAccountAccessRole".to_string()));
        let accounts = vec![account("a1"), account("a2")];

        let budgets = fetcher.fetch_all(&accounts, 4, &cancel, None).await;
        assert_eq!(budgets.len(), 2);
        assert!(budgets
            .values()
            .all(|outcome| outcome == &Err(FetchError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_reading_notifications() {
        let services = Arc::new(
            FixtureServices::new(snapshot()).with_latency(Duration::from_millis(10)),
        );
        let fetcher = BudgetFetcher::new(services.clone(), RetryPolicy::default());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(15)).await;
            trigger.cancel();
        });

        let outcome = fetcher.fetch_account(&account("a1"), &cancel).await;
        assert_eq!(outcome, Err(FetchError::Cancelled));
        assert_eq!(services.calls(Op::ListNotifications, "a1").await, 1);
    }
}
