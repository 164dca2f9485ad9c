//! bud - budget recommendations from an exported organization snapshot.
//!
//! Environment:
//! - `BUD_FIXTURE`: path to the JSON snapshot (required)
//! - `BUD_POLICY_FILE`: optional YAML policy document
//! - `BUD_*`: analysis settings, see [`bud::config`]
//! - `RUST_LOG`: log filter (default `bud=info`)
//!
//! The run result is printed to stdout as JSON; logs go to stderr.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use bud::config::load_policy_file;
use bud::policy::PolicyConfig;
use bud::remote::fixture::FixtureServices;
use bud::{AnalysisConfig, BudgetAnalyzer, BuildInfo, Services};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("bud=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let build = BuildInfo::current();
    tracing::info!(version = %build.version, commit = ?build.commit, "Starting bud");

    let config = AnalysisConfig::from_env().context("Invalid configuration")?;

    let fixture_path: PathBuf = std::env::var_os("BUD_FIXTURE")
        .map(PathBuf::from)
        .context("BUD_FIXTURE must point to an organization snapshot")?;
    let services = FixtureServices::load(&fixture_path)
        .await
        .with_context(|| format!("Failed to load snapshot {}", fixture_path.display()))?;

    let policies = match std::env::var_os("BUD_POLICY_FILE") {
        Some(path) => load_policy_file(&PathBuf::from(path)).await?,
        None => PolicyConfig::default(),
    };

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Received interrupt signal, shutting down gracefully");
            signal_cancel.cancel();
        }
    });

    let analyzer = BudgetAnalyzer::new(
        Services::shared(Arc::new(services)),
        config,
        policies,
        build,
    );
    let result = analyzer.run(&cancel, None).await?;

    println!(
        "{}",
        serde_json::to_string_pretty(&result).context("Failed to encode run result")?
    );
    Ok(())
}
