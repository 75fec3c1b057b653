//! Sigscan Engine - status report for the scan orchestration store.
//!
//! Opens the configured store, reloads every job's resume snapshot and prints the
//! job statuses together with the most recent run history as JSON.

use anyhow::Result;
use sigscan_common::config::Config;
use sigscan_common::logging::init_logging_with_exclusions;
use sigscan_engine::ScanService;

const HISTORY_LIMIT: usize = 20;

#[tokio::main]
async fn main() -> Result<()> {
    let startup_start = std::time::Instant::now();

    let config = Config::load_and_validate()?;

    init_logging_with_exclusions(
        &config.observability.log_level,
        &config.observability.log_format,
        &config.observability.excluded_targets,
    );

    tracing::info!("Sigscan Engine v{}", env!("CARGO_PKG_VERSION"));

    let service = ScanService::open(&config)?;
    let registry = service.registry();

    let history = match registry.store() {
        Some(store) => store.recent_run_metrics(None, HISTORY_LIMIT)?,
        None => Vec::new(),
    };

    let report = serde_json::json!({
        "jobs": registry.statuses(),
        "recent_runs": history,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    let startup_duration = startup_start.elapsed();
    tracing::info!(
        duration_ms = startup_duration.as_millis() as u64,
        "Status report generated in {:?}",
        startup_duration
    );

    Ok(())
}
