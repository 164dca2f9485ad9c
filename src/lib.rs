//! # bud
//!
//! Budget recommendations for every account in a cloud organization.
//!
//! Historical spend and current budgets are fetched on bounded, retrying,
//! cancellable worker pools. Each account's spend is reduced to statistics,
//! matched against a hierarchical policy (account, tag, organizational unit,
//! default) and turned into a recommended budget with a priority and a
//! justification.
//!
//! ## Modules
//!
//! - [`remote`]: service contracts and the snapshot-backed fixture
//! - [`fetch`]: retry, worker pool, cost/budget/metadata retrieval
//! - [`accounts`]: discovery and filtering
//! - [`policy`]: rule documents and the resolver
//! - [`analysis`]: spend statistics and budget utilization
//! - [`recommend`]: recommendation engine and prioritization
//! - [`run`]: end-to-end orchestration
//! - [`config`]: run settings

pub mod accounts;
pub mod analysis;
pub mod config;
pub mod fetch;
pub mod policy;
pub mod recommend;
pub mod remote;
pub mod run;

pub use config::AnalysisConfig;
pub use run::{BudgetAnalyzer, BuildInfo, RunError, RunResult, Services};
