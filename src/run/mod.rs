//! Run orchestration - from account discovery to a prioritized [`RunResult`].
//!
//! # Flow
//! 1. Pre-flight: validate configuration, discover and filter accounts,
//!    validate group rules, load metadata when rules need it
//! 2. Fetch cost series and budget records concurrently, each on its own
//!    bounded pool
//! 3. Per account: statistics, budget comparison, policy, recommendation
//! 4. Prioritize and summarize
//!
//! Pre-flight failures abort the run. After that every account ends up as
//! exactly one recommendation or one [`AccountError`].

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::accounts::{discover_accounts, filter_by_groups, filter_by_ids, AccountRef};
use crate::analysis::{analyze, compare_to_budget, StatisticsError};
use crate::config::{AnalysisConfig, ConfigError};
use crate::fetch::{
    load_metadata, AnalysisWindow, BudgetAccess, BudgetFetcher, BudgetOutcome, CostFetcher,
    CostSeries, FetchError, MetadataCache, ProgressCallback,
};
use crate::policy::{validate_groups, PolicyConfig, PolicyError, PolicyResolver};
use crate::recommend::{prioritize, recommend, summarize, Recommendation, RecommendError, RunSummary};
use crate::remote::{BudgetService, CostService, DirectoryService, RemoteError};

/// Version and provenance of the running binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildInfo {
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
}

impl BuildInfo {
    /// Crate version plus `BUD_BUILD_COMMIT` / `BUD_BUILD_DATE` captured at
    /// compile time.
    pub fn current() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            commit: option_env!("BUD_BUILD_COMMIT").map(str::to_string),
            date: option_env!("BUD_BUILD_DATE").map(str::to_string),
        }
    }
}

/// Remote collaborators used by a run.
#[derive(Clone)]
pub struct Services {
    pub directory: Arc<dyn DirectoryService>,
    pub cost: Arc<dyn CostService>,
    pub budgets: Arc<dyn BudgetService>,
}

impl Services {
    pub fn new(
        directory: Arc<dyn DirectoryService>,
        cost: Arc<dyn CostService>,
        budgets: Arc<dyn BudgetService>,
    ) -> Self {
        Self {
            directory,
            cost,
            budgets,
        }
    }

    /// One object implementing every service.
    pub fn shared<S>(services: Arc<S>) -> Self
    where
        S: DirectoryService + CostService + BudgetService + 'static,
    {
        Self {
            directory: services.clone(),
            cost: services.clone(),
            budgets: services,
        }
    }
}

/// Why an account produced no recommendation.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AccountFailure {
    #[error("{0}")]
    Fetch(FetchError),

    #[error("{0}")]
    Statistics(StatisticsError),

    #[error("{0}")]
    Recommendation(#[from] RecommendError),

    #[error("analysis cancelled before this account was processed")]
    Cancelled,
}

impl AccountFailure {
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Fetch(_) => "fetch",
            Self::Statistics(_) => "statistics",
            Self::Recommendation(_) => "recommendation",
            Self::Cancelled => "cancelled",
        }
    }
}

impl From<StatisticsError> for AccountFailure {
    fn from(err: StatisticsError) -> Self {
        match err {
            StatisticsError::Fetch(FetchError::Cancelled) => Self::Cancelled,
            StatisticsError::Fetch(fetch) => Self::Fetch(fetch),
            other => Self::Statistics(other),
        }
    }
}

/// Per-account error entry of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct AccountError {
    pub account_id: String,
    pub account_name: String,
    pub cause: AccountFailure,
}

impl Serialize for AccountError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("AccountError", 4)?;
        s.serialize_field("accountId", &self.account_id)?;
        s.serialize_field("accountName", &self.account_name)?;
        s.serialize_field("stage", self.cause.stage())?;
        s.serialize_field("error", &self.cause.to_string())?;
        s.end()
    }
}

/// Fatal conditions that stop a run before any account is fetched.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("policy configuration error: {0}")]
    Policy(#[from] PolicyError),

    #[error("failed to discover accounts: {0}")]
    Discovery(#[source] RemoteError),

    #[error("failed to filter by OU {group_id}: {source}")]
    GroupFilter {
        group_id: String,
        #[source]
        source: RemoteError,
    },

    #[error("no accounts to analyze")]
    NoAccounts,

    #[error("analysis cancelled")]
    Cancelled,
}

/// Output of one run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub run_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub build: BuildInfo,
    pub config: AnalysisConfig,
    pub window: AnalysisWindow,
    pub accounts_submitted: usize,
    pub accounts_analyzed: usize,
    pub accounts_with_budgets: usize,
    pub accounts_without_budgets: usize,
    /// Sorted by descending absolute adjustment
    pub recommendations: Vec<Recommendation>,
    pub errors: Vec<AccountError>,
    pub summary: RunSummary,
    /// Cancellation was requested while the run was in progress
    pub cancelled: bool,
}

impl RunResult {
    /// Every submitted account is accounted for exactly once.
    pub fn is_complete(&self) -> bool {
        self.recommendations.len() + self.errors.len() == self.accounts_submitted
    }
}

/// Fetch phase reported to a [`PhaseProgress`] callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchPhase {
    Costs,
    Budgets,
}

/// Called with `(phase, completed, total)` once per finished account.
pub type PhaseProgress = Arc<dyn Fn(FetchPhase, usize, usize) + Send + Sync>;

fn phase_callback(progress: &Option<PhaseProgress>, phase: FetchPhase) -> Option<ProgressCallback> {
    progress.clone().map(|callback| {
        let forward: ProgressCallback =
            Arc::new(move |done: usize, total: usize| callback(phase, done, total));
        forward
    })
}

/// Drives a complete analysis run.
pub struct BudgetAnalyzer {
    services: Services,
    config: AnalysisConfig,
    policies: PolicyConfig,
    build: BuildInfo,
    window_end: Option<NaiveDate>,
}

impl BudgetAnalyzer {
    pub fn new(
        services: Services,
        config: AnalysisConfig,
        policies: PolicyConfig,
        build: BuildInfo,
    ) -> Self {
        Self {
            services,
            config,
            policies,
            build,
            window_end: None,
        }
    }

    /// Pin the end of the analysis window instead of using today.
    pub fn with_window_end(mut self, end: NaiveDate) -> Self {
        self.window_end = Some(end);
        self
    }

    fn window(&self) -> AnalysisWindow {
        match self.window_end {
            Some(end) => AnalysisWindow::ending_at(end, self.config.analysis_months),
            None => AnalysisWindow::trailing(self.config.analysis_months),
        }
    }

    /// Run pre-flight checks, then analyze every selected account.
    ///
    /// Returns `Err` only for pre-flight failures (including cancellation
    /// before any fetch). Cancellation after that yields a partial result
    /// with `cancelled` set.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        progress: Option<PhaseProgress>,
    ) -> Result<RunResult, RunError> {
        self.config.validate()?;
        self.policies.validate()?;

        let directory = self.services.directory.as_ref();

        let accounts = until_cancelled(cancel, discover_accounts(directory))
            .await?
            .map_err(RunError::Discovery)?;

        let accounts = if self.config.organizational_units.is_empty() {
            accounts
        } else {
            let filtered = until_cancelled(
                cancel,
                filter_by_groups(directory, accounts, &self.config.organizational_units),
            )
            .await?
            .map_err(|(group_id, source)| RunError::GroupFilter { group_id, source })?;
            tracing::info!(count = filtered.len(), "After OU filter");
            filtered
        };

        let accounts = if self.config.accounts.is_empty() {
            accounts
        } else {
            let filtered = filter_by_ids(accounts, &self.config.accounts);
            tracing::info!(count = filtered.len(), "After account filter");
            filtered
        };

        if accounts.is_empty() {
            return Err(RunError::NoAccounts);
        }

        until_cancelled(cancel, validate_groups(directory, &self.policies)).await??;

        let metadata = if self.policies.needs_metadata() {
            load_metadata(directory, &accounts, &self.config.retry_policy(), cancel).await
        } else {
            MetadataCache::new()
        };
        if cancel.is_cancelled() {
            return Err(RunError::Cancelled);
        }

        let resolver = PolicyResolver::new(
            self.policies.clone(),
            self.config.default_policy(),
            metadata,
        );
        Ok(self
            .analyze_accounts(accounts, &resolver, cancel, progress)
            .await)
    }

    /// Fetch and analyze `accounts` with an already built resolver.
    pub async fn analyze_accounts(
        &self,
        accounts: Vec<AccountRef>,
        resolver: &PolicyResolver,
        cancel: &CancellationToken,
        progress: Option<PhaseProgress>,
    ) -> RunResult {
        let window = self.window();
        let retry = self.config.retry_policy();
        let concurrency = self.config.concurrency;
        tracing::info!(
            accounts = accounts.len(),
            concurrency,
            months = self.config.analysis_months,
            "Starting analysis"
        );

        let cost_fetcher = CostFetcher::new(self.services.cost.clone(), retry);
        let budget_fetcher = BudgetFetcher::new(self.services.budgets.clone(), retry)
            .with_assume_role(self.config.assume_role_name.clone());

        let (series, budgets) = tokio::join!(
            cost_fetcher.fetch_all(
                &accounts,
                window,
                concurrency,
                cancel,
                phase_callback(&progress, FetchPhase::Costs),
            ),
            budget_fetcher.fetch_all(
                &accounts,
                concurrency,
                cancel,
                phase_callback(&progress, FetchPhase::Budgets),
            ),
        );

        let mut result = RunResult {
            run_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            build: self.build.clone(),
            config: self.config.clone(),
            window,
            accounts_submitted: accounts.len(),
            accounts_analyzed: 0,
            accounts_with_budgets: 0,
            accounts_without_budgets: 0,
            recommendations: Vec::new(),
            errors: Vec::new(),
            summary: RunSummary::default(),
            cancelled: false,
        };

        let mut recommendations = Vec::with_capacity(series.len());
        for cost in &series {
            let budget = budgets.get(&cost.account_id);
            match analyze_account(cost, budget, resolver, &mut result) {
                Ok(rec) => recommendations.push(rec),
                Err(cause) => {
                    if cause != AccountFailure::Cancelled {
                        tracing::warn!(
                            account_id = %cost.account_id,
                            stage = cause.stage(),
                            "Account analysis failed: {}",
                            cause
                        );
                    }
                    result.errors.push(AccountError {
                        account_id: cost.account_id.clone(),
                        account_name: cost.account_name.clone(),
                        cause,
                    });
                }
            }
        }

        result.accounts_analyzed = recommendations.len();
        result.recommendations = prioritize(&recommendations);
        result.summary = summarize(&result.recommendations);
        result.cancelled = cancel.is_cancelled();

        tracing::info!(
            analyzed = result.accounts_analyzed,
            errors = result.errors.len(),
            with_budgets = result.accounts_with_budgets,
            without_budgets = result.accounts_without_budgets,
            cancelled = result.cancelled,
            "Analysis complete"
        );
        result
    }
}

/// Statistics, comparison, policy and recommendation for one account.
///
/// An account whose budget read was cancelled is never recommended. Budget
/// counters are updated once statistics succeed.
fn analyze_account(
    cost: &CostSeries,
    budget: Option<&BudgetOutcome>,
    resolver: &PolicyResolver,
    result: &mut RunResult,
) -> Result<Recommendation, AccountFailure> {
    let budget = match budget {
        Some(Err(_)) => return Err(AccountFailure::Cancelled),
        Some(Ok(records)) => records.first(),
        None => None,
    };
    let stats = analyze(cost)?;

    let access = budget.map_or(BudgetAccess::NotFound, |b| b.access);
    if access == BudgetAccess::Success {
        result.accounts_with_budgets += 1;
    } else {
        result.accounts_without_budgets += 1;
    }

    let comparison = compare_to_budget(&stats, budget);
    let policy = resolver.resolve(&cost.account_id);
    Ok(recommend(&comparison, &stats, &policy, access)?)
}

/// Await `fut` unless `cancel` fires first.
async fn until_cancelled<F: std::future::Future>(
    cancel: &CancellationToken,
    fut: F,
) -> Result<F::Output, RunError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(RunError::Cancelled),
        output = fut => Ok(output),
    }
}
