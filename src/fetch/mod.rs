//! Fetch orchestrator - bounded, retrying, cancellable retrieval of
//! per-account data.
//!
//! # Key Concepts
//! - Retry: exponential backoff with jitter for transient service errors
//! - Pool: fixed number of workers draining a queue of account indices
//! - Cost / Budget: the two bulk fetch phases of a run
//! - Metadata: OU and tag lookups feeding the policy resolver
//!
//! # Guarantees
//! Every bulk fetch returns exactly one outcome per submitted account, in
//! submission order, even when workers are cancelled or fail.

pub mod budget;
pub mod cost;
pub mod metadata;
mod pool;
mod retry;

use std::sync::Arc;

use thiserror::Error;

use crate::remote::{ErrorClass, RemoteError};

pub use budget::{BudgetAccess, BudgetFetcher, BudgetOutcome, BudgetRecord};
pub use cost::{AnalysisWindow, CostFetcher, CostSeries, MonthlySpend};
pub use metadata::{load_metadata, MetadataCache};
pub use pool::run_pool;
pub use retry::{backoff_delay, backoff_delay_with, with_retry, RetryPolicy, MAX_BACKOFF};

/// Called once per finished account with `(completed, total)`.
pub type ProgressCallback = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// Terminal outcome of a failed fetch.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FetchError {
    #[error("access denied: {0}")]
    AccessDenied(RemoteError),

    #[error("not found: {0}")]
    NotFound(RemoteError),

    #[error("failed after {attempts} attempt(s): {source}")]
    Failed {
        attempts: u32,
        #[source]
        source: RemoteError,
    },

    #[error("cancelled before completion")]
    Cancelled,
}

impl FetchError {
    /// Classify a terminal remote error after `attempts` calls.
    pub fn from_remote(source: RemoteError, attempts: u32) -> Self {
        match source.class() {
            ErrorClass::AccessDenied => Self::AccessDenied(source),
            ErrorClass::NotFound => Self::NotFound(source),
            ErrorClass::Transient | ErrorClass::Fatal => Self::Failed { attempts, source },
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::RemoteErrorKind;

    #[test]
    fn test_from_remote_classification() {
        let denied = RemoteError::new(RemoteErrorKind::AccessDenied, "no");
        assert!(matches!(
            FetchError::from_remote(denied, 1),
            FetchError::AccessDenied(_)
        ));

        let missing = RemoteError::new(RemoteErrorKind::NotFound, "none");
        assert!(matches!(
            FetchError::from_remote(missing, 1),
            FetchError::NotFound(_)
        ));

        let throttled = RemoteError::new(RemoteErrorKind::Throttled, "slow down");
        match FetchError::from_remote(throttled, 4) {
            FetchError::Failed { attempts, source } => {
                assert_eq!(attempts, 4);
                assert_eq!(source.kind, RemoteErrorKind::Throttled);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_display_carries_cause() {
        let err = FetchError::Failed {
            attempts: 2,
            source: RemoteError::new(RemoteErrorKind::Other, "ValidationException"),
        };
        assert_eq!(
            err.to_string(),
            "failed after 2 attempt(s): error: ValidationException"
        );
    }
}
