use crate::database::SegmentStoreStats;
use crate::error::AppError;
use crate::worker::{AnalysisWorker, MlStatus, RetrainStatus};
use std::sync::Arc;

/// Classifier and corpus status
pub async fn ml_status(worker: &Arc<AnalysisWorker>) -> Result<MlStatus, AppError> {
    let worker = Arc::clone(worker);
    tokio::task::spawn_blocking(move || worker.ml_status())
        .await
        .map_err(|e| AppError::Other(e.to_string()))?
        .map_err(AppError::from)
}

/// Stored segments per detection method
pub async fn get_segment_stats(worker: &Arc<AnalysisWorker>) -> Result<SegmentStoreStats, AppError> {
    worker.db().count_by_method().map_err(AppError::from)
}

pub async fn retrain_model(worker: &Arc<AnalysisWorker>) -> Result<RetrainStatus, AppError> {
    worker.retrain_model().await.map_err(AppError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::database::Database;
    use crate::sources::SourceRegistry;
    use tempfile::TempDir;

    #[tokio::test]
    async fn fresh_install_status() {
        let temp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp.path().to_path_buf();
        let db = Arc::new(Database::open_in_memory().unwrap());
        let worker = Arc::new(AnalysisWorker::new(config, db, SourceRegistry::new()));

        let status = ml_status(&worker).await.unwrap();
        assert!(!status.model_available);
        assert!(!status.model_file_exists);
        assert!(!status.training_in_progress);
        assert_eq!(status.corpus_size, 0);

        let stats = get_segment_stats(&worker).await.unwrap();
        assert_eq!(stats.total, 0);

        let retrain = retrain_model(&worker).await.unwrap();
        assert!(matches!(retrain, RetrainStatus::NotEnoughData { .. }));
    }
}
