use crate::error::AppError;
use crate::worker::AnalysisWorker;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Recent analysis and training failures, oldest evicted first
pub struct ErrorLog {
    errors: Mutex<VecDeque<ErrorEntry>>,
    max_entries: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorEntry {
    pub timestamp: String,
    pub command: String,
    pub error: String,
    pub context: Option<String>,
}

impl ErrorLog {
    pub fn new(max_entries: usize) -> Self {
        Self {
            errors: Mutex::new(VecDeque::new()),
            max_entries: max_entries.max(1),
        }
    }

    /// Log at error level and keep the entry.
    pub fn log_error(&self, command: &str, error: &str, context: Option<&str>) {
        log::error!("{}: {}{}", command, error, context.map(|c| format!(" ({})", c)).unwrap_or_default());
        self.record(command, error, context);
    }

    /// Keep the entry without logging it; the caller has already logged.
    pub fn record(&self, command: &str, error: &str, context: Option<&str>) {
        let entry = ErrorEntry {
            timestamp: chrono::Utc::now().to_rfc3339(),
            command: command.to_string(),
            error: error.to_string(),
            context: context.map(|s| s.to_string()),
        };

        let mut errors = self.errors.lock().unwrap_or_else(|e| e.into_inner());
        while errors.len() >= self.max_entries {
            errors.pop_front();
        }
        errors.push_back(entry);
    }

    pub fn get_errors(&self) -> Vec<ErrorEntry> {
        self.errors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.errors.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

#[derive(Debug, Serialize)]
pub struct DiagnosticsReport {
    pub app_version: String,
    pub data_dir: String,
    pub database_path: String,
    pub database_status: String,
    pub checkpoint_path: String,
    pub checkpoint_exists: bool,
    pub sources: Vec<String>,
    pub in_flight: usize,
    pub processed_episodes: u64,
    pub recent_errors: Vec<ErrorEntry>,
}

/// Get diagnostics report including recent errors
pub async fn get_diagnostics(worker: &Arc<AnalysisWorker>) -> Result<DiagnosticsReport, AppError> {
    let config = worker.config();
    let db_path = config.database_path();
    let database_status = match worker.db().count_by_method() {
        Ok(stats) => format!("OK ({} segments)", stats.total),
        Err(e) => format!("ERROR: {}", e),
    };

    Ok(DiagnosticsReport {
        app_version: env!("CARGO_PKG_VERSION").to_string(),
        data_dir: config.data_dir.to_string_lossy().to_string(),
        database_path: db_path.to_string_lossy().to_string(),
        database_status,
        checkpoint_path: worker.checkpoint_path().to_string_lossy().to_string(),
        checkpoint_exists: worker.checkpoint_path().exists(),
        sources: worker.source_ids(),
        in_flight: worker.in_flight_count(),
        processed_episodes: worker.processed_episodes(),
        recent_errors: worker.error_log().get_errors(),
    })
}

/// Clear error log
pub async fn clear_errors(worker: &Arc<AnalysisWorker>) -> Result<(), AppError> {
    worker.error_log().clear();
    Ok(())
}
