use crate::database::{DetectionMethod, SegmentType, SkipSegment};
use crate::error::AppError;
use crate::worker::{
    AnalysisWorker, DetectionResult, EpisodeKey, SeriesBatch, SkipSegmentsResponse,
};
use std::sync::Arc;

/// Stored segments, or the analysis status of the episode
pub async fn get_skip_segments(
    worker: &Arc<AnalysisWorker>,
    series_id: String,
    source_id: String,
    episode_number: i64,
    episode_id: Option<String>,
) -> Result<SkipSegmentsResponse, AppError> {
    let key = EpisodeKey::new(series_id, source_id, episode_number);
    Ok(worker.get_skip_segments(&key, episode_id.as_deref()))
}

/// Analyze one episode now and wait for the result
pub async fn analyze_episode(
    worker: &Arc<AnalysisWorker>,
    series_id: String,
    source_id: String,
    episode_number: i64,
    episode_id: String,
) -> Result<DetectionResult, AppError> {
    let key = EpisodeKey::new(series_id, source_id, episode_number);
    worker
        .analyze_episode(&key, &episode_id)
        .await
        .map_err(AppError::from)
}

/// Store a manually corrected segment, replacing any detected one
pub async fn correct_skip_segment(
    worker: &Arc<AnalysisWorker>,
    series_id: String,
    source_id: String,
    episode_number: i64,
    segment_type: String,
    start_sec: f64,
    end_sec: f64,
) -> Result<SkipSegment, AppError> {
    let segment_type: SegmentType = segment_type.parse().map_err(AppError::Validation)?;
    if !start_sec.is_finite() || !end_sec.is_finite() || start_sec < 0.0 {
        return Err(AppError::Validation(format!(
            "invalid segment bounds {}-{}",
            start_sec, end_sec
        )));
    }
    if end_sec <= start_sec {
        return Err(AppError::Validation(format!(
            "end ({}) must be greater than start ({})",
            end_sec, start_sec
        )));
    }

    let segment = SkipSegment {
        series_id,
        source_id,
        episode_number,
        segment_type,
        start_sec,
        end_sec,
        confidence: 1.0,
        detection_method: DetectionMethod::Manual,
        created_at: None,
    };
    worker.db().save_skip_segment(&segment)?;
    log::info!(
        "Manual {} for {}/{}#{}: {:.1}-{:.1}s",
        segment.segment_type,
        segment.source_id,
        segment.series_id,
        segment.episode_number,
        start_sec,
        end_sec
    );

    worker
        .db()
        .get_skip_segment(
            &segment.series_id,
            &segment.source_id,
            episode_number,
            segment_type,
        )?
        .ok_or_else(|| AppError::NotFound("segment after save".to_string()))
}

/// Forget both segments of an episode so the next request re-analyzes it
pub async fn delete_skip_segments(
    worker: &Arc<AnalysisWorker>,
    series_id: String,
    source_id: String,
    episode_number: i64,
) -> Result<usize, AppError> {
    let removed = worker
        .db()
        .delete_skip_segments(&series_id, &source_id, episode_number)?;
    log::info!(
        "Removed {} segments for {}/{}#{}",
        removed,
        source_id,
        series_id,
        episode_number
    );
    Ok(removed)
}

pub async fn analyze_series(
    worker: &Arc<AnalysisWorker>,
    series_id: String,
    source_id: String,
) -> Result<SeriesBatch, AppError> {
    Ok(worker.analyze_series(&series_id, &source_id).await?)
}

pub async fn scan_series(
    worker: &Arc<AnalysisWorker>,
    series_id: String,
    source_id: String,
    count: Option<usize>,
) -> Result<SeriesBatch, AppError> {
    let count = count.unwrap_or(worker.config().analysis.random_batch_size);
    Ok(worker.scan_series(&series_id, &source_id, count).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::database::Database;
    use crate::sources::SourceRegistry;
    use crate::worker::AnalysisStatus;
    use tempfile::TempDir;

    fn worker(temp: &TempDir) -> Arc<AnalysisWorker> {
        let mut config = Config::default();
        config.data_dir = temp.path().to_path_buf();
        let db = Arc::new(Database::open_in_memory().unwrap());
        Arc::new(AnalysisWorker::new(config, db, SourceRegistry::new()))
    }

    #[tokio::test]
    async fn manual_correction_forces_ready() {
        let temp = TempDir::new().unwrap();
        let worker = worker(&temp);

        let saved = correct_skip_segment(&worker, "demo".into(), "local".into(), 4, "ending".into(), 1300.0, 1390.0)
            .await
            .unwrap();
        assert_eq!(saved.detection_method, DetectionMethod::Manual);
        assert_eq!(saved.confidence, 1.0);

        let response = get_skip_segments(&worker, "demo".into(), "local".into(), 4, None)
            .await
            .unwrap();
        assert_eq!(response.status, AnalysisStatus::Ready);
        assert_eq!(response.ending.unwrap().start_sec, 1300.0);
    }

    #[tokio::test]
    async fn correction_rejects_bad_input() {
        let temp = TempDir::new().unwrap();
        let worker = worker(&temp);

        let inverted = correct_skip_segment(&worker, "demo".into(), "local".into(), 1, "opening".into(), 90.0, 10.0).await;
        assert!(matches!(inverted, Err(AppError::Validation(_))));

        let bad_type = correct_skip_segment(&worker, "demo".into(), "local".into(), 1, "recap".into(), 0.0, 10.0).await;
        assert!(matches!(bad_type, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn reset_makes_episode_unavailable_again() {
        let temp = TempDir::new().unwrap();
        let worker = worker(&temp);
        correct_skip_segment(&worker, "demo".into(), "local".into(), 2, "opening".into(), 0.0, 85.0)
            .await
            .unwrap();

        let removed = delete_skip_segments(&worker, "demo".into(), "local".into(), 2).await.unwrap();
        assert_eq!(removed, 1);
        let response = get_skip_segments(&worker, "demo".into(), "local".into(), 2, Some("ep-2".into()))
            .await
            .unwrap();
        // No source named "local" is registered
        assert_eq!(response.status, AnalysisStatus::Unavailable);
    }

    #[tokio::test]
    async fn unknown_source_maps_to_not_found() {
        let temp = TempDir::new().unwrap();
        let worker = worker(&temp);
        let result = scan_series(&worker, "demo".into(), "nowhere".into(), None).await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }
}
