//! Statistics analyzer - summary statistics, trend and budget utilization.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fetch::{BudgetRecord, CostSeries, FetchError};

/// Slope below this fraction of the average counts as flat.
const TREND_THRESHOLD: f64 = 0.05;

/// Utilization above this percent is over budget.
const OVER_BUDGET_PERCENT: f64 = 100.0;

/// Utilization below this percent is under-utilized.
const UNDER_UTILIZED_PERCENT: f64 = 50.0;

/// Direction of spend over the analysis window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Increasing,
    Decreasing,
    Stable,
}

impl fmt::Display for Trend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Increasing => "increasing",
            Self::Decreasing => "decreasing",
            Self::Stable => "stable",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpendStatistics {
    pub account_id: String,
    pub account_name: String,
    pub average: f64,
    pub peak: f64,
    pub minimum: f64,
    /// Spend of the last analyzed month
    pub current: Option<f64>,
    pub months_analyzed: usize,
    pub trend: Trend,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum StatisticsError {
    #[error("cost data contains error: {0}")]
    Fetch(#[from] FetchError),

    #[error("invalid spend amount {amount} for {period}")]
    InvalidAmount { period: String, amount: f64 },
}

/// Compute statistics for one cost series.
///
/// A series carrying a fetch error is rejected with that error. An empty
/// series is valid and yields zeroed statistics with a stable trend.
pub fn analyze(series: &CostSeries) -> Result<SpendStatistics, StatisticsError> {
    if let Some(err) = &series.error {
        return Err(StatisticsError::Fetch(err.clone()));
    }
    if let Some(bad) = series
        .months
        .iter()
        .find(|m| !m.amount.is_finite() || m.amount < 0.0)
    {
        return Err(StatisticsError::InvalidAmount {
            period: bad.period.clone(),
            amount: bad.amount,
        });
    }

    let amounts = series.amounts();
    let mut stats = SpendStatistics {
        account_id: series.account_id.clone(),
        account_name: series.account_name.clone(),
        average: 0.0,
        peak: 0.0,
        minimum: 0.0,
        current: None,
        months_analyzed: amounts.len(),
        trend: Trend::Stable,
    };
    if amounts.is_empty() {
        return Ok(stats);
    }

    stats.average = amounts.iter().sum::<f64>() / amounts.len() as f64;
    stats.peak = amounts.iter().copied().fold(f64::MIN, f64::max);
    stats.minimum = amounts.iter().copied().fold(f64::MAX, f64::min);
    stats.current = amounts.last().copied();
    stats.trend = trend(&amounts);
    Ok(stats)
}

/// Classify the least-squares slope of spend against month index.
pub fn trend(amounts: &[f64]) -> Trend {
    if amounts.len() < 2 {
        return Trend::Stable;
    }

    let n = amounts.len() as f64;
    let (mut sum_x, mut sum_y, mut sum_xy, mut sum_x2) = (0.0, 0.0, 0.0, 0.0);
    for (i, &y) in amounts.iter().enumerate() {
        let x = i as f64;
        sum_x += x;
        sum_y += y;
        sum_xy += x * y;
        sum_x2 += x * x;
    }

    let denominator = n * sum_x2 - sum_x * sum_x;
    if denominator == 0.0 {
        return Trend::Stable;
    }
    let slope = (n * sum_xy - sum_x * sum_y) / denominator;
    let threshold = TREND_THRESHOLD * (sum_y / n);

    if slope.abs() < threshold {
        Trend::Stable
    } else if slope > 0.0 {
        Trend::Increasing
    } else {
        Trend::Decreasing
    }
}

/// How average spend relates to the current budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UtilizationStatus {
    OverBudget,
    UnderUtilized,
    Appropriate,
    NoBudget,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetComparison {
    pub account_id: String,
    pub account_name: String,
    pub current_budget: Option<f64>,
    pub average_spend: f64,
    pub peak_spend: f64,
    /// Average spend as a percent of the limit
    pub utilization_percent: Option<f64>,
    pub status: UtilizationStatus,
}

/// Compare statistics against the account's budget.
///
/// Marker records (no budget readable) and non-positive limits compare as
/// [`UtilizationStatus::NoBudget`].
pub fn compare_to_budget(
    stats: &SpendStatistics,
    budget: Option<&BudgetRecord>,
) -> BudgetComparison {
    let mut comparison = BudgetComparison {
        account_id: stats.account_id.clone(),
        account_name: stats.account_name.clone(),
        current_budget: None,
        average_spend: stats.average,
        peak_spend: stats.peak,
        utilization_percent: None,
        status: UtilizationStatus::NoBudget,
    };

    let Some(budget) = budget.filter(|b| b.is_success()) else {
        return comparison;
    };
    comparison.current_budget = Some(budget.limit_amount);
    if budget.limit_amount <= 0.0 {
        return comparison;
    }

    let utilization = stats.average / budget.limit_amount * 100.0;
    comparison.utilization_percent = Some(utilization);
    comparison.status = if utilization > OVER_BUDGET_PERCENT {
        UtilizationStatus::OverBudget
    } else if utilization < UNDER_UTILIZED_PERCENT {
        UtilizationStatus::UnderUtilized
    } else {
        UtilizationStatus::Appropriate
    };
    comparison
}
