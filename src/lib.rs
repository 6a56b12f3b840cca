pub mod commands;
pub mod config;
pub mod database;
pub mod error;
pub mod ml;
pub mod sources;
pub mod worker;

use anyhow::{Context, Result};
use config::Config;
use database::Database;
use sources::SourceRegistry;
use std::path::Path;
use std::sync::Arc;
use worker::AnalysisWorker;

/// Install the fmt subscriber (`RUST_LOG`, default `info`). `log` records
/// from library code are forwarded into it.
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if let Err(e) = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
    {
        eprintln!("Logging already initialized: {}", e);
    }
}

/// Load configuration, open the store, register sources and build the
/// analysis worker.
pub fn build_worker(project_dir: &Path) -> Result<Arc<AnalysisWorker>> {
    let config_path = Config::resolve_path(project_dir);
    let config = Config::load(&config_path)?;
    config.ensure_dirs()?;

    let db_path = config.database_path();
    let db = Database::new(&db_path)
        .with_context(|| format!("opening database {:?}", db_path))?;

    let sources = SourceRegistry::from_config(&config.sources);
    log::info!(
        "skipseg initialized: data dir {:?}, sources [{}]",
        config.data_dir,
        sources.ids().join(", ")
    );

    Ok(Arc::new(AnalysisWorker::new(config, Arc::new(db), sources)))
}

/// Load a value from the .env file by key name
pub fn load_env_value(project_dir: &Path, key: &str) -> Option<String> {
    let env_path = project_dir.join(".env");
    let prefix = format!("{}=", key);
    let content = std::fs::read_to_string(&env_path).ok()?;
    content.lines().find_map(|line| {
        let value = line
            .trim()
            .strip_prefix(&prefix)?
            .trim()
            .trim_matches('"')
            .trim_matches('\'');
        (!value.is_empty()).then(|| value.to_string())
    })
}
