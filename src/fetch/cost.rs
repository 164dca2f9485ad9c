//! Monthly cost retrieval.

use std::sync::Arc;

use chrono::{Months, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::{run_pool, with_retry, FetchError, ProgressCallback, RetryPolicy};
use crate::accounts::AccountRef;
use crate::remote::{CostPeriod, CostService};

/// Spend for one calendar month.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthlySpend {
    /// `YYYY-MM`
    pub period: String,
    pub amount: f64,
}

impl MonthlySpend {
    pub fn new(period: impl Into<String>, amount: f64) -> Self {
        Self {
            period: period.into(),
            amount,
        }
    }
}

/// Chronological spend of one account, or the reason it could not be fetched.
#[derive(Debug, Clone, PartialEq)]
pub struct CostSeries {
    pub account_id: String,
    pub account_name: String,
    pub months: Vec<MonthlySpend>,
    pub error: Option<FetchError>,
}

impl CostSeries {
    pub fn new(account: &AccountRef, months: Vec<MonthlySpend>) -> Self {
        Self {
            account_id: account.id.clone(),
            account_name: account.name.clone(),
            months,
            error: None,
        }
    }

    pub fn failed(account: &AccountRef, error: FetchError) -> Self {
        Self {
            account_id: account.id.clone(),
            account_name: account.name.clone(),
            months: Vec::new(),
            error: Some(error),
        }
    }

    pub fn amounts(&self) -> Vec<f64> {
        self.months.iter().map(|m| m.amount).collect()
    }
}

/// Date range covered by a run: the trailing `months` months up to `end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl AnalysisWindow {
    pub fn ending_at(end: NaiveDate, months: u32) -> Self {
        let start = end
            .checked_sub_months(Months::new(months))
            .unwrap_or(NaiveDate::MIN);
        Self { start, end }
    }

    /// Window ending today (UTC).
    pub fn trailing(months: u32) -> Self {
        Self::ending_at(Utc::now().date_naive(), months)
    }
}

/// Turn raw service buckets into chronological monthly spend.
///
/// Buckets with an unparseable start date are dropped. Amounts that do not
/// parse, are not finite, or are negative count as zero.
pub fn parse_periods(periods: Vec<CostPeriod>) -> Vec<MonthlySpend> {
    let mut months: Vec<MonthlySpend> = periods
        .into_iter()
        .filter_map(|p| {
            let date = match NaiveDate::parse_from_str(&p.start, "%Y-%m-%d") {
                Ok(date) => date,
                Err(e) => {
                    tracing::debug!(start = %p.start, "Skipping cost period with bad date: {}", e);
                    return None;
                }
            };
            let amount = p
                .amount
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|a| a.is_finite())
                .unwrap_or(0.0)
                .max(0.0);
            Some(MonthlySpend::new(date.format("%Y-%m").to_string(), amount))
        })
        .collect();

    // Labels are zero-padded, so lexical order is chronological.
    months.sort_by(|a, b| a.period.cmp(&b.period));
    months
}

/// Fetches cost series through a [`CostService`] with retry.
#[derive(Clone)]
pub struct CostFetcher {
    service: Arc<dyn CostService>,
    retry: RetryPolicy,
}

impl CostFetcher {
    pub fn new(service: Arc<dyn CostService>, retry: RetryPolicy) -> Self {
        Self { service, retry }
    }

    /// Fetch one account. A not-found answer is a valid empty series.
    pub async fn fetch_account(
        &self,
        account: &AccountRef,
        window: AnalysisWindow,
        cancel: &CancellationToken,
    ) -> CostSeries {
        let result = with_retry(&self.retry, cancel, "monthly_cost", &account.id, || {
            self.service
                .monthly_cost(&account.id, window.start, window.end)
        })
        .await;

        match result {
            Ok(periods) => CostSeries::new(account, parse_periods(periods)),
            Err(FetchError::NotFound(_)) => {
                tracing::debug!(account_id = %account.id, "No cost data for account");
                CostSeries::new(account, Vec::new())
            }
            Err(e) => {
                if !e.is_cancelled() {
                    tracing::warn!(account_id = %account.id, error = %e, "Cost fetch failed");
                }
                CostSeries::failed(account, e)
            }
        }
    }

    /// Fetch every account on a bounded pool; one series per account, in
    /// input order.
    pub async fn fetch_all(
        &self,
        accounts: &[AccountRef],
        window: AnalysisWindow,
        concurrency: usize,
        cancel: &CancellationToken,
        progress: Option<ProgressCallback>,
    ) -> Vec<CostSeries> {
        tracing::info!(
            accounts = accounts.len(),
            concurrency,
            start = %window.start,
            end = %window.end,
            "Fetching cost data"
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
                async move { fetcher.fetch_account(&account, window, &cancel).await }
            },
        )
        .await;

        let series: Vec<CostSeries> = slots
            .into_iter()
            .zip(accounts)
            .map(|(slot, account)| {
                slot.unwrap_or_else(|| CostSeries::failed(account, FetchError::Cancelled))
            })
            .collect();

        let failed = series.iter().filter(|s| s.error.is_some()).count();
        tracing::info!(
            succeeded = series.len() - failed,
            failed,
            "Cost data fetched"
        );
        series
    }
}
