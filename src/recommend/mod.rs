//! Recommendation engine.
//!
//! Sizes a budget from peak spend plus a growth buffer, applies the policy
//! floor and rounding, and grades how urgently the current budget needs to
//! change.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::analysis::{BudgetComparison, SpendStatistics, Trend, UtilizationStatus};
use crate::fetch::BudgetAccess;
use crate::policy::EffectivePolicy;

/// Growth buffer used when the policy leaves it at zero.
pub const DEFAULT_GROWTH_BUFFER: f64 = 20.0;

/// Adjustment reported for accounts without a usable budget.
pub const NEW_BUDGET_ADJUSTMENT: f64 = 100.0;

const HIGH_ADJUSTMENT: f64 = 50.0;
const MEDIUM_ADJUSTMENT: f64 = 20.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    pub account_id: String,
    pub account_name: String,
    pub current_budget: Option<f64>,
    pub recommended_budget: f64,
    pub average_spend: f64,
    pub peak_spend: f64,
    pub adjustment_percent: f64,
    pub priority: Priority,
    pub justification: String,
    pub budget_access: BudgetAccess,
    pub policy_name: String,
    pub status: UtilizationStatus,
    pub trend: Trend,
}

/// Invalid input to the engine. Always a caller bug.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RecommendError {
    #[error("statistics for account {statistics} do not match comparison for {comparison}")]
    AccountMismatch {
        statistics: String,
        comparison: String,
    },

    #[error("{field} is not a finite number")]
    NonFinite { field: &'static str },
}

fn ensure_finite(field: &'static str, value: f64) -> Result<(), RecommendError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(RecommendError::NonFinite { field })
    }
}

/// Round to the nearest multiple of `increment`, halves away from zero.
///
/// A non-positive increment returns `value` unchanged.
pub fn round_to_increment(value: f64, increment: f64) -> f64 {
    if increment <= 0.0 {
        return value;
    }
    (value / increment).round() * increment
}

/// Over-budget accounts are always high priority; otherwise the size of the
/// adjustment decides.
pub fn determine_priority(status: UtilizationStatus, adjustment_percent: f64) -> Priority {
    let magnitude = adjustment_percent.abs();
    if status == UtilizationStatus::OverBudget || magnitude > HIGH_ADJUSTMENT {
        Priority::High
    } else if magnitude > MEDIUM_ADJUSTMENT {
        Priority::Medium
    } else {
        Priority::Low
    }
}

/// Build the recommendation for one account.
pub fn recommend(
    comparison: &BudgetComparison,
    statistics: &SpendStatistics,
    policy: &EffectivePolicy,
    budget_access: BudgetAccess,
) -> Result<Recommendation, RecommendError> {
    if comparison.account_id != statistics.account_id {
        return Err(RecommendError::AccountMismatch {
            statistics: statistics.account_id.clone(),
            comparison: comparison.account_id.clone(),
        });
    }
    ensure_finite("peak spend", statistics.peak)?;
    ensure_finite("average spend", statistics.average)?;
    ensure_finite("growth buffer", policy.growth_buffer)?;
    ensure_finite("minimum budget", policy.minimum_budget)?;
    ensure_finite("rounding increment", policy.rounding_increment)?;
    if let Some(current) = comparison.current_budget {
        ensure_finite("current budget", current)?;
    }

    let growth_buffer = if policy.growth_buffer == 0.0 {
        DEFAULT_GROWTH_BUFFER
    } else {
        policy.growth_buffer
    };
    let multiplier = 1.0 + growth_buffer / 100.0;
    let raw = statistics.peak * multiplier;
    let floored = raw.max(policy.minimum_budget);
    let recommended = round_to_increment(floored, policy.rounding_increment);

    let adjustment_percent = match comparison.current_budget {
        Some(current) if current > 0.0 => (recommended - current) / current * 100.0,
        _ => NEW_BUDGET_ADJUSTMENT,
    };

    Ok(Recommendation {
        account_id: comparison.account_id.clone(),
        account_name: comparison.account_name.clone(),
        current_budget: comparison.current_budget,
        recommended_budget: recommended,
        average_spend: statistics.average,
        peak_spend: statistics.peak,
        adjustment_percent,
        priority: determine_priority(comparison.status, adjustment_percent),
        justification: justification(statistics, multiplier, raw, recommended),
        budget_access,
        policy_name: policy.name.clone(),
        status: comparison.status,
        trend: statistics.trend,
    })
}

fn justification(stats: &SpendStatistics, multiplier: f64, raw: f64, recommended: f64) -> String {
    if stats.months_analyzed == 0 {
        return format!(
            "No historical spend data available. Recommended minimum budget: ${:.0}",
            recommended
        );
    }

    let mut text = format!(
        "Based on {}-month analysis: avg=${:.0}, peak=${:.0}. Recommended budget: ${:.0} × {:.2} = ${:.0}",
        stats.months_analyzed, stats.average, stats.peak, stats.peak, multiplier, raw
    );
    if (raw - recommended).abs() > 0.01 {
        text.push_str(&format!(", rounded to ${:.0}", recommended));
    }
    match stats.trend {
        Trend::Increasing => text.push_str(". Trend: increasing (consider higher buffer)"),
        Trend::Decreasing => text.push_str(". Trend: decreasing (may reduce in future)"),
        Trend::Stable => {}
    }
    text
}

/// Order by descending absolute adjustment; ties keep input order.
///
/// Returns a sorted copy; `recommendations` is left untouched.
pub fn prioritize(recommendations: &[Recommendation]) -> Vec<Recommendation> {
    let mut sorted = recommendations.to_vec();
    sorted.sort_by(|a, b| {
        b.adjustment_percent
            .abs()
            .total_cmp(&a.adjustment_percent.abs())
    });
    sorted
}

/// Batch totals for reporting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub total: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    pub total_current: f64,
    pub total_recommended: f64,
    /// Relative change of the summed budgets, when any current budget exists
    pub change_percent: Option<f64>,
}

pub fn summarize(recommendations: &[Recommendation]) -> RunSummary {
    let mut summary = RunSummary {
        total: recommendations.len(),
        ..Default::default()
    };
    for rec in recommendations {
        match rec.priority {
            Priority::High => summary.high += 1,
            Priority::Medium => summary.medium += 1,
            Priority::Low => summary.low += 1,
        }
        summary.total_current += rec.current_budget.unwrap_or(0.0);
        summary.total_recommended += rec.recommended_budget;
    }
    if summary.total_current > 0.0 {
        summary.change_percent = Some(
            (summary.total_recommended - summary.total_current) / summary.total_current * 100.0,
        );
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(peak: f64, average: f64, months: usize, trend: Trend) -> SpendStatistics {
        SpendStatistics {
            account_id: "111".to_string(),
            account_name: "prod".to_string(),
            average,
            peak,
            minimum: average,
            current: (months > 0).then_some(average),
            months_analyzed: months,
            trend,
        }
    }

    fn comparison(current: Option<f64>, status: UtilizationStatus) -> BudgetComparison {
        BudgetComparison {
            account_id: "111".to_string(),
            account_name: "prod".to_string(),
            current_budget: current,
            average_spend: 0.0,
            peak_spend: 0.0,
            utilization_percent: None,
            status,
        }
    }

    fn policy(growth: f64, minimum: f64, increment: f64) -> EffectivePolicy {
        EffectivePolicy::new("Default", growth, minimum, increment)
    }

    #[test]
    fn test_basic_recommendation() {
        let rec = recommend(
            &comparison(Some(450.0), UtilizationStatus::Appropriate),
            &stats(500.0, 450.0, 3, Trend::Stable),
            &policy(20.0, 10.0, 10.0),
            BudgetAccess::Success,
        )
        .unwrap();

        assert_eq!(rec.recommended_budget, 600.0);
        assert!((rec.adjustment_percent - 33.333).abs() < 0.01);
        assert_eq!(rec.priority, Priority::Medium);
        assert_eq!(rec.policy_name, "Default");
        assert_eq!(
            rec.justification,
            "Based on 3-month analysis: avg=$450, peak=$500. Recommended budget: $500 × 1.20 = $600"
        );
    }

    #[test]
    fn test_minimum_floor() {
        let rec = recommend(
            &comparison(None, UtilizationStatus::NoBudget),
            &stats(10.0, 10.0, 2, Trend::Stable),
            &policy(20.0, 100.0, 0.0),
            BudgetAccess::NotFound,
        )
        .unwrap();
        assert_eq!(rec.recommended_budget, 100.0);
        assert!(rec.justification.ends_with(", rounded to $100"));
    }

    #[test]
    fn test_zero_growth_buffer_falls_back() {
        let rec = recommend(
            &comparison(None, UtilizationStatus::NoBudget),
            &stats(1000.0, 900.0, 3, Trend::Stable),
            &policy(0.0, 0.0, 0.0),
            BudgetAccess::NotFound,
        )
        .unwrap();
        assert!((rec.recommended_budget - 1200.0).abs() < 1e-9);
    }

    #[test]
    fn test_new_account_adjustment_is_fixed() {
        for current in [None, Some(0.0)] {
            let rec = recommend(
                &comparison(current, UtilizationStatus::NoBudget),
                &stats(12345.0, 999.0, 3, Trend::Increasing),
                &policy(20.0, 10.0, 10.0),
                BudgetAccess::NotFound,
            )
            .unwrap();
            assert_eq!(rec.adjustment_percent, NEW_BUDGET_ADJUSTMENT);
            assert_eq!(rec.priority, Priority::High);
        }
    }

    #[test]
    fn test_rounding() {
        assert_eq!(round_to_increment(123.0, 10.0), 120.0);
        assert_eq!(round_to_increment(127.0, 10.0), 130.0);
        assert_eq!(round_to_increment(125.0, 10.0), 130.0);
        assert_eq!(round_to_increment(-125.0, 10.0), -130.0);
        assert_eq!(round_to_increment(123.45, 0.0), 123.45);
    }

    #[test]
    fn test_priority_thresholds() {
        use UtilizationStatus::*;
        assert_eq!(determine_priority(OverBudget, 0.0), Priority::High);
        assert_eq!(determine_priority(OverBudget, -5.0), Priority::High);
        assert_eq!(determine_priority(Appropriate, 60.0), Priority::High);
        assert_eq!(determine_priority(Appropriate, -60.0), Priority::High);
        assert_eq!(determine_priority(Appropriate, 30.0), Priority::Medium);
        assert_eq!(determine_priority(UnderUtilized, 10.0), Priority::Low);
        assert_eq!(determine_priority(Appropriate, 50.0), Priority::Medium);
        assert_eq!(determine_priority(Appropriate, 20.0), Priority::Low);
    }

    #[test]
    fn test_justification_variants() {
        let empty = recommend(
            &comparison(None, UtilizationStatus::NoBudget),
            &stats(0.0, 0.0, 0, Trend::Stable),
            &policy(20.0, 10.0, 10.0),
            BudgetAccess::NotFound,
        )
        .unwrap();
        assert_eq!(
            empty.justification,
            "No historical spend data available. Recommended minimum budget: $10"
        );

        let rising = recommend(
            &comparison(Some(100.0), UtilizationStatus::OverBudget),
            &stats(123.0, 110.0, 4, Trend::Increasing),
            &policy(20.0, 10.0, 10.0),
            BudgetAccess::Success,
        )
        .unwrap();
        assert!(rising.justification.contains("rounded to $150"));
        assert!(rising
            .justification
            .ends_with("Trend: increasing (consider higher buffer)"));

        let falling = recommend(
            &comparison(Some(1000.0), UtilizationStatus::Appropriate),
            &stats(500.0, 450.0, 3, Trend::Decreasing),
            &policy(20.0, 10.0, 10.0),
            BudgetAccess::Success,
        )
        .unwrap();
        assert!(falling
            .justification
            .ends_with("Trend: decreasing (may reduce in future)"));
    }

    #[test]
    fn test_invalid_input_fails_fast() {
        let mut other = comparison(None, UtilizationStatus::NoBudget);
        other.account_id = "222".to_string();
        assert!(matches!(
            recommend(
                &other,
                &stats(1.0, 1.0, 1, Trend::Stable),
                &policy(20.0, 10.0, 10.0),
                BudgetAccess::NotFound,
            ),
            Err(RecommendError::AccountMismatch { .. })
        ));

        assert_eq!(
            recommend(
                &comparison(None, UtilizationStatus::NoBudget),
                &stats(f64::INFINITY, 1.0, 1, Trend::Stable),
                &policy(20.0, 10.0, 10.0),
                BudgetAccess::NotFound,
            ),
            Err(RecommendError::NonFinite { field: "peak spend" })
        );
    }

    fn with_adjustment(id: &str, adjustment: f64) -> Recommendation {
        let mut rec = recommend(
            &comparison(Some(100.0), UtilizationStatus::Appropriate),
            &stats(100.0, 100.0, 1, Trend::Stable),
            &policy(20.0, 10.0, 10.0),
            BudgetAccess::Success,
        )
        .unwrap();
        rec.account_id = id.to_string();
        rec.adjustment_percent = adjustment;
        rec
    }

    #[test]
    fn test_prioritize_is_stable_and_non_mutating() {
        let input = vec![
            with_adjustment("a", 10.0),
            with_adjustment("b", -80.0),
            with_adjustment("c", 25.0),
            with_adjustment("d", -25.0),
            with_adjustment("e", 80.0),
        ];
        let sorted = prioritize(&input);

        let order: Vec<_> = sorted.iter().map(|r| r.account_id.as_str()).collect();
        assert_eq!(order, vec!["b", "e", "c", "d", "a"]);
        let original: Vec<_> = input.iter().map(|r| r.account_id.as_str()).collect();
        assert_eq!(original, vec!["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn test_summarize() {
        let mut low = with_adjustment("a", 10.0);
        low.priority = Priority::Low;
        let mut high = with_adjustment("b", 80.0);
        high.priority = Priority::High;
        high.current_budget = None;
        high.recommended_budget = 500.0;

        let summary = summarize(&[low, high]);
        assert_eq!(summary.total, 2);
        assert_eq!((summary.high, summary.medium, summary.low), (1, 0, 1));
        assert_eq!(summary.total_current, 100.0);
        assert_eq!(summary.total_recommended, 620.0);
        assert!((summary.change_percent.unwrap() - 520.0).abs() < 1e-9);

        assert_eq!(summarize(&[]).change_percent, None);
    }
}
