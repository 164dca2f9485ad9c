//! In-memory collaborators backed by a JSON snapshot.
//!
//! Used by the `bud` binary for offline runs against exported organization
//! data, and by tests. Failures can be scripted per operation and key; each
//! scripted error is consumed by one call, after which the snapshot answers
//! normally.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::{
    BudgetDefinition, BudgetScope, BudgetService, CostPeriod, CostService, DirectoryService,
    Notification, RemoteError, RemoteErrorKind,
};
use crate::accounts::AccountRef;

const ACTIVE: &str = "ACTIVE";

fn active_status() -> String {
    ACTIVE.to_string()
}

/// Exported organization data.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FixtureSnapshot {
    pub accounts: Vec<FixtureAccount>,
    /// Organizational groups that exist
    pub groups: Vec<String>,
    /// Cost periods by account id
    pub costs: HashMap<String, Vec<CostPeriod>>,
    /// Budgets by account id
    pub budgets: HashMap<String, Vec<FixtureBudget>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixtureAccount {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default = "active_status")]
    pub status: String,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

impl FixtureAccount {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            email: String::new(),
            status: active_status(),
            parent: None,
            tags: HashMap::new(),
        }
    }

    fn is_active(&self) -> bool {
        self.status == ACTIVE
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixtureBudget {
    #[serde(flatten)]
    pub definition: BudgetDefinition,
    #[serde(default)]
    pub notifications: Vec<FixtureNotification>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixtureNotification {
    #[serde(flatten)]
    pub notification: Notification,
    #[serde(default)]
    pub subscribers: Vec<String>,
}

/// Operation selector for scripted failures and call counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    ListAccounts,
    ListParent,
    ListTags,
    DescribeGroup,
    ListAccountsInGroup,
    MonthlyCost,
    ListBudgets,
    ListNotifications,
    ListSubscribers,
}

type CallKey = (Op, String);

/// Snapshot-backed implementation of every remote service trait.
pub struct FixtureServices {
    snapshot: FixtureSnapshot,
    failures: Mutex<HashMap<CallKey, VecDeque<RemoteError>>>,
    calls: Mutex<HashMap<CallKey, u32>>,
    latency: Option<Duration>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

/// Decrements the in-flight gauge when a call finishes.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FixtureServices {
    pub fn new(snapshot: FixtureSnapshot) -> Self {
        Self {
            snapshot,
            failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            latency: None,
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        Ok(Self::new(serde_json::from_str(json)?))
    }

    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        Ok(Self::from_json(&content)?)
    }

    /// Delay every call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Queue errors returned by the next calls of `op` for `key`.
    ///
    /// Keys are the account id for account-scoped operations, the group id for
    /// group operations and the empty string for `ListAccounts`.
    pub async fn script_failures(&self, op: Op, key: &str, errors: Vec<RemoteError>) {
        self.failures
            .lock()
            .await
            .entry((op, key.to_string()))
            .or_default()
            .extend(errors);
    }

    /// Number of calls made for `op` and `key`.
    pub async fn calls(&self, op: Op, key: &str) -> u32 {
        self.calls
            .lock()
            .await
            .get(&(op, key.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Highest number of simultaneously running calls observed.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    async fn enter(&self, op: Op, key: &str) -> Result<InFlight<'_>, RemoteError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let guard = InFlight(&self.in_flight);

        let call_key = (op, key.to_string());
        *self.calls.lock().await.entry(call_key.clone()).or_insert(0) += 1;

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let scripted = self
            .failures
            .lock()
            .await
            .get_mut(&call_key)
            .and_then(VecDeque::pop_front);
        match scripted {
            Some(err) => Err(err),
            None => Ok(guard),
        }
    }

    fn account(&self, account_id: &str) -> Result<&FixtureAccount, RemoteError> {
        self.snapshot
            .accounts
            .iter()
            .find(|a| a.id == account_id)
            .ok_or_else(|| {
                RemoteError::new(
                    RemoteErrorKind::NotFound,
                    format!("AccountNotFoundException: {}", account_id),
                )
            })
    }

    fn budget(&self, scope: &BudgetScope, name: &str) -> Result<&FixtureBudget, RemoteError> {
        self.snapshot
            .budgets
            .get(&scope.account_id)
            .and_then(|budgets| budgets.iter().find(|b| b.definition.name == name))
            .ok_or_else(|| {
                RemoteError::new(
                    RemoteErrorKind::NotFound,
                    format!("NotFoundException: budget {}", name),
                )
            })
    }
}

#[async_trait]
impl DirectoryService for FixtureServices {
    async fn list_accounts(&self) -> Result<Vec<AccountRef>, RemoteError> {
        let _guard = self.enter(Op::ListAccounts, "").await?;
        Ok(self
            .snapshot
            .accounts
            .iter()
            .filter(|a| a.is_active())
            .map(|a| AccountRef::new(a.id.clone(), a.name.clone()).with_email(a.email.clone()))
            .collect())
    }

    async fn list_parent(&self, account_id: &str) -> Result<Option<String>, RemoteError> {
        let _guard = self.enter(Op::ListParent, account_id).await?;
        Ok(self.account(account_id)?.parent.clone())
    }

    async fn list_tags(&self, account_id: &str) -> Result<HashMap<String, String>, RemoteError> {
        let _guard = self.enter(Op::ListTags, account_id).await?;
        Ok(self.account(account_id)?.tags.clone())
    }

    async fn describe_group(&self, group_id: &str) -> Result<(), RemoteError> {
        let _guard = self.enter(Op::DescribeGroup, group_id).await?;
        if self.snapshot.groups.iter().any(|g| g == group_id) {
            Ok(())
        } else {
            Err(RemoteError::new(
                RemoteErrorKind::NotFound,
                format!("OrganizationalUnitNotFoundException: {}", group_id),
            ))
        }
    }

    async fn list_accounts_in_group(&self, group_id: &str) -> Result<Vec<String>, RemoteError> {
        let _guard = self.enter(Op::ListAccountsInGroup, group_id).await?;
        if !self.snapshot.groups.iter().any(|g| g == group_id) {
            return Err(RemoteError::new(
                RemoteErrorKind::NotFound,
                format!("ParentNotFoundException: {}", group_id),
            ));
        }
        Ok(self
            .snapshot
            .accounts
            .iter()
            .filter(|a| a.is_active() && a.parent.as_deref() == Some(group_id))
            .map(|a| a.id.clone())
            .collect())
    }
}

#[async_trait]
impl CostService for FixtureServices {
    async fn monthly_cost(
        &self,
        account_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<CostPeriod>, RemoteError> {
        let _guard = self.enter(Op::MonthlyCost, account_id).await?;
        let periods = self
            .snapshot
            .costs
            .get(account_id)
            .cloned()
            .unwrap_or_default();

        // Buckets are whole months, so the first bucket starts on day 1.
        let first = start.with_day(1).unwrap_or(start);

        // Periods whose date does not parse are passed through untouched.
        Ok(periods
            .into_iter()
            .filter(|p| match NaiveDate::parse_from_str(&p.start, "%Y-%m-%d") {
                Ok(date) => date >= first && date < end,
                Err(_) => true,
            })
            .collect())
    }
}

#[async_trait]
impl BudgetService for FixtureServices {
    async fn list_budgets(&self, scope: &BudgetScope) -> Result<Vec<BudgetDefinition>, RemoteError> {
        let _guard = self.enter(Op::ListBudgets, &scope.account_id).await?;
        Ok(self
            .snapshot
            .budgets
            .get(&scope.account_id)
            .map(|budgets| budgets.iter().map(|b| b.definition.clone()).collect())
            .unwrap_or_default())
    }

    async fn list_notifications(
        &self,
        scope: &BudgetScope,
        budget_name: &str,
    ) -> Result<Vec<Notification>, RemoteError> {
        let _guard = self.enter(Op::ListNotifications, &scope.account_id).await?;
        Ok(self
            .budget(scope, budget_name)?
            .notifications
            .iter()
            .map(|n| n.notification.clone())
            .collect())
    }

    async fn list_subscribers(
        &self,
        scope: &BudgetScope,
        budget_name: &str,
        notification: &Notification,
    ) -> Result<Vec<String>, RemoteError> {
        let _guard = self.enter(Op::ListSubscribers, &scope.account_id).await?;
        Ok(self
            .budget(scope, budget_name)?
            .notifications
            .iter()
            .filter(|n| n.notification == *notification)
            .flat_map(|n| n.subscribers.iter().cloned())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SNAPSHOT: &str = r#"{
        "accounts": [
            {"id": "111111111111", "name": "prod", "parent": "ou-prod", "tags": {"env": "prod"}},
            {"id": "222222222222", "name": "old", "status": "SUSPENDED"}
        ],
        "groups": ["ou-prod"],
        "costs": {
            "111111111111": [
                {"start": "2024-09-01", "amount": "450.00"},
                {"start": "2024-10-01", "amount": "520.00"}
            ]
        },
        "budgets": {
            "111111111111": [{
                "name": "monthly",
                "limitAmount": "500",
                "timeUnit": "MONTHLY",
                "notifications": [
                    {"notificationType": "ACTUAL", "threshold": 80.0, "subscribers": ["ops@example.com"]}
                ]
            }]
        }
    }"#;

    #[tokio::test]
    async fn test_snapshot_parsing_and_active_filter() {
        let fixture = FixtureServices::from_json(SNAPSHOT).unwrap();
        let accounts = fixture.list_accounts().await.unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].id, "111111111111");

        assert_eq!(
            fixture.list_parent("111111111111").await.unwrap().as_deref(),
            Some("ou-prod")
        );
        assert!(fixture.describe_group("ou-missing").await.is_err());
    }

    #[tokio::test]
    async fn test_scripted_failures_are_consumed_in_order() {
        let fixture = FixtureServices::from_json(SNAPSHOT).unwrap();
        fixture
            .script_failures(
                Op::ListTags,
                "111111111111",
                vec![RemoteError::from_message("ThrottlingException")],
            )
            .await;

        let err = fixture.list_tags("111111111111").await.unwrap_err();
        assert_eq!(err.kind, RemoteErrorKind::Throttled);
        let tags = fixture.list_tags("111111111111").await.unwrap();
        assert_eq!(tags.get("env").map(String::as_str), Some("prod"));
        assert_eq!(fixture.calls(Op::ListTags, "111111111111").await, 2);
    }

    #[tokio::test]
    async fn test_budget_subcalls() {
        let fixture = FixtureServices::from_json(SNAPSHOT).unwrap();
        let scope = BudgetScope::new("111111111111", None);
        let budgets = fixture.list_budgets(&scope).await.unwrap();
        assert_eq!(budgets[0].limit_amount.as_deref(), Some("500"));

        let notifications = fixture.list_notifications(&scope, "monthly").await.unwrap();
        assert_eq!(notifications.len(), 1);
        let subscribers = fixture
            .list_subscribers(&scope, "monthly", &notifications[0])
            .await
            .unwrap();
        assert_eq!(subscribers, vec!["ops@example.com".to_string()]);
    }
}
