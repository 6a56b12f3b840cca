pub mod detect;
pub mod extract;

use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

use crate::commands::diagnostics::ErrorLog;
use crate::config::Config;
use crate::database::{Database, EpisodeSegments, SegmentType, SkipSegment};
use crate::error::AnalysisError;
use crate::ml::corpus::TrainingSample;
use crate::ml::{
    ClassCounts, MelExtractor, MusicDetector, SkipSegmentDetector, Trainer, TrainingCorpus,
    TrainingReport,
};
use crate::sources::{EpisodeRef, SourceRegistry, VideoLink};

use detect::{DetectionEngine, FoundSegment};
use extract::AudioExtractor;

/// Identity of one episode's segment pair, and of its in-flight analysis.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct EpisodeKey {
    pub series_id: String,
    pub source_id: String,
    pub episode_number: i64,
}

impl EpisodeKey {
    pub fn new(series_id: impl Into<String>, source_id: impl Into<String>, episode_number: i64) -> Self {
        Self {
            series_id: series_id.into(),
            source_id: source_id.into(),
            episode_number,
        }
    }
}

impl fmt::Display for EpisodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.source_id, self.series_id, self.episode_number)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    Ready,
    Analyzing,
    Unavailable,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkipSegmentsResponse {
    pub opening: Option<SkipSegment>,
    pub ending: Option<SkipSegment>,
    pub status: AnalysisStatus,
}

impl SkipSegmentsResponse {
    fn ready(pair: EpisodeSegments) -> Self {
        Self {
            opening: pair.opening,
            ending: pair.ending,
            status: AnalysisStatus::Ready,
        }
    }

    fn pending(status: AnalysisStatus) -> Self {
        Self {
            opening: None,
            ending: None,
            status,
        }
    }
}

/// What one successful analysis produced.
#[derive(Debug, Clone, Serialize)]
pub struct DetectionResult {
    pub opening: Option<SkipSegment>,
    pub ending: Option<SkipSegment>,
    pub samples_added: usize,
    pub retrain: Option<TrainingReport>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RetrainStatus {
    Training { corpus_size: usize },
    NotEnoughData { corpus_size: usize, required: usize },
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub selected: usize,
    pub analyzed: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Returned when a series batch has been queued in the background.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SeriesBatch {
    pub episodes: usize,
    pub queued: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct MlStatus {
    pub model_available: bool,
    pub model_file_exists: bool,
    pub training_in_progress: bool,
    pub processed_episodes: u64,
    pub corpus_size: usize,
    pub samples_by_class: ClassCounts,
}

/// True on every `every`-th successful analysis.
pub fn is_retrain_due(count: u64, every: u64) -> bool {
    every > 0 && count > 0 && count % every == 0
}

/// Up to `count` episodes without stored segments, uniformly at random and
/// without replacement.
pub fn select_unanalyzed<R: rand::Rng + ?Sized>(
    episodes: &[EpisodeRef],
    analyzed: &BTreeSet<i64>,
    count: usize,
    rng: &mut R,
) -> Vec<EpisodeRef> {
    use rand::seq::IndexedRandom;

    let candidates: Vec<&EpisodeRef> = episodes
        .iter()
        .filter(|e| !analyzed.contains(&e.number))
        .collect();
    candidates
        .choose_multiple(rng, count)
        .map(|e| (*e).clone())
        .collect()
}

type InFlightSet = Arc<Mutex<HashSet<EpisodeKey>>>;

fn lock_set(set: &Mutex<HashSet<EpisodeKey>>) -> MutexGuard<'_, HashSet<EpisodeKey>> {
    set.lock().unwrap_or_else(|e| e.into_inner())
}

/// Membership of a key in the in-flight set; released on drop.
struct InFlightGuard {
    set: InFlightSet,
    key: EpisodeKey,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        lock_set(&self.set).remove(&self.key);
    }
}

fn analysis_span(key: &EpisodeKey) -> tracing::Span {
    tracing::info_span!(
        "analysis",
        source = %key.source_id,
        series = %key.series_id,
        episode = key.episode_number
    )
}

/// Analysis orchestrator. Owns every pipeline stage and the shared state
/// (in-flight keys, processed counter, background tasks) so independent
/// instances never interfere.
pub struct AnalysisWorker {
    db: Arc<Database>,
    sources: SourceRegistry,
    extractor: AudioExtractor,
    engine: Arc<DetectionEngine>,
    trainer: Arc<Trainer>,
    corpus: Arc<TrainingCorpus>,
    config: Config,
    in_flight: InFlightSet,
    processed: AtomicU64,
    tracker: TaskTracker,
    cancel: CancellationToken,
    errors: Arc<ErrorLog>,
}

impl AnalysisWorker {
    pub fn new(config: Config, db: Arc<Database>, sources: SourceRegistry) -> Self {
        let sample_rate = config.extraction.sample_rate;
        let engine = DetectionEngine::new(
            MelExtractor::new(sample_rate),
            MusicDetector::new(config.heuristic.clone(), sample_rate),
            SkipSegmentDetector::new(config.checkpoint_path(), config.inference.clone()),
        );

        Self {
            db,
            sources,
            extractor: AudioExtractor::new(config.extraction.clone(), config.audio_dir()),
            engine: Arc::new(engine),
            trainer: Arc::new(Trainer::new(config.training.clone(), config.checkpoint_path())),
            corpus: Arc::new(TrainingCorpus::new(config.features_dir())),
            errors: Arc::new(ErrorLog::new(config.analysis.error_log_size)),
            config,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            processed: AtomicU64::new(0),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn error_log(&self) -> &Arc<ErrorLog> {
        &self.errors
    }

    pub fn source_ids(&self) -> Vec<String> {
        self.sources.ids()
    }

    pub fn checkpoint_path(&self) -> &Path {
        self.engine.classifier().checkpoint_path()
    }

    pub fn in_flight_count(&self) -> usize {
        lock_set(&self.in_flight).len()
    }

    pub fn is_in_flight(&self, key: &EpisodeKey) -> bool {
        lock_set(&self.in_flight).contains(key)
    }

    pub fn processed_episodes(&self) -> u64 {
        self.processed.load(Ordering::SeqCst)
    }

    /// Check-and-insert under one lock.
    fn claim(&self, key: &EpisodeKey) -> Option<InFlightGuard> {
        let mut set = lock_set(&self.in_flight);
        if !set.insert(key.clone()) {
            return None;
        }
        Some(InFlightGuard {
            set: Arc::clone(&self.in_flight),
            key: key.clone(),
        })
    }

    fn check_cancelled(&self) -> Result<(), AnalysisError> {
        if self.cancel.is_cancelled() {
            Err(AnalysisError::Cancelled)
        } else {
            Ok(())
        }
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Stored segments for an episode, or the state of its analysis. Starts a
    /// background analysis when nothing is stored, none is running, and the
    /// episode can be resolved. Must be called from within the runtime.
    pub fn get_skip_segments(
        self: &Arc<Self>,
        key: &EpisodeKey,
        episode_id: Option<&str>,
    ) -> SkipSegmentsResponse {
        match self
            .db
            .get_skip_segments(&key.series_id, &key.source_id, key.episode_number)
        {
            Ok(Some(pair)) => return SkipSegmentsResponse::ready(pair),
            Ok(None) => {}
            Err(e) => log::warn!("Segment lookup for {} failed: {:#}", key, e),
        }

        let can_analyze = episode_id.is_some()
            && self.sources.contains(&key.source_id)
            && !self.cancel.is_cancelled();

        match (episode_id, can_analyze) {
            (Some(episode_id), true) => {
                if let Some(guard) = self.claim(key) {
                    self.spawn_analysis(guard, episode_id.to_string());
                }
                SkipSegmentsResponse::pending(AnalysisStatus::Analyzing)
            }
            _ if self.is_in_flight(key) => SkipSegmentsResponse::pending(AnalysisStatus::Analyzing),
            _ => SkipSegmentsResponse::pending(AnalysisStatus::Unavailable),
        }
    }

    fn spawn_analysis(self: &Arc<Self>, guard: InFlightGuard, episode_id: String) {
        let worker = Arc::clone(self);
        let span = analysis_span(&guard.key);
        self.tracker.spawn(
            async move {
                let key = guard.key.clone();
                let _ = worker.run_claimed(&key, &episode_id).await;
                drop(guard);
            }
            .instrument(span),
        );
    }

    // =========================================================================
    // Single episode
    // =========================================================================

    /// Analyze one episode now, in the caller's task. Fails with
    /// `InProgress` when the key is already being analyzed.
    pub async fn analyze_episode(
        &self,
        key: &EpisodeKey,
        episode_id: &str,
    ) -> Result<DetectionResult, AnalysisError> {
        let Some(_guard) = self.claim(key) else {
            return Err(AnalysisError::InProgress(key.to_string()));
        };
        self.run_claimed(key, episode_id)
            .instrument(analysis_span(key))
            .await
    }

    async fn run_claimed(
        &self,
        key: &EpisodeKey,
        episode_id: &str,
    ) -> Result<DetectionResult, AnalysisError> {
        log::info!("Analyzing {} (episode id {})", key, episode_id);
        let result = self.analyze_claimed(key, episode_id).await;
        if let Err(e) = &result {
            self.record_failure(key, e);
        }
        result
    }

    fn record_failure(&self, key: &EpisodeKey, error: &AnalysisError) {
        let context = key.to_string();
        match error {
            AnalysisError::Cancelled => log::info!("Analysis of {} cancelled", key),
            e if e.is_transient() => {
                log::warn!("Analysis of {} ended: {}", key, e);
                self.errors.record("analyze_episode", &e.to_string(), Some(&context));
            }
            e => self.errors.log_error("analyze_episode", &e.to_string(), Some(&context)),
        }
    }

    async fn analyze_claimed(
        &self,
        key: &EpisodeKey,
        episode_id: &str,
    ) -> Result<DetectionResult, AnalysisError> {
        let source = self
            .sources
            .get(&key.source_id)
            .ok_or_else(|| AnalysisError::UnknownSource(key.source_id.clone()))?;
        self.check_cancelled()?;

        let link = source
            .resolve_video(episode_id)
            .await
            .map_err(|e| AnalysisError::Resolve {
                episode_id: episode_id.to_string(),
                message: format!("{:#}", e),
            })?;
        let video = match link {
            VideoLink::Direct(video) => video,
            VideoLink::EmbedOnly => return Err(AnalysisError::NoDirectUrl(episode_id.to_string())),
        };
        self.check_cancelled()?;

        let duration = self.extractor.get_video_duration(&video).await;
        match duration {
            Some(d) => log::info!("Episode duration: {:.1}s", d),
            None => log::info!("Episode duration unknown, tail clip disabled"),
        }
        self.check_cancelled()?;

        let audio = self.extractor.extract_episode_audio(&video, duration).await;
        if audio.head.is_none() && audio.tail.is_none() {
            return Err(AnalysisError::ExtractionFailed(episode_id.to_string()));
        }
        self.check_cancelled()?;

        let engine = Arc::clone(&self.engine);
        let detection = tokio::task::spawn_blocking(move || engine.detect_episode(&audio))
            .await
            .map_err(|e| anyhow::anyhow!("detection task failed: {}", e))??;
        if detection.is_empty() {
            return Err(AnalysisError::NothingDetected(episode_id.to_string()));
        }

        let opening = detection
            .opening
            .map(|found| segment_for(key, SegmentType::Opening, found));
        let ending = detection
            .ending
            .map(|found| segment_for(key, SegmentType::Ending, found));
        let found: Vec<SkipSegment> = opening.iter().chain(ending.iter()).cloned().collect();
        self.db.save_skip_segments(&found)?;
        for segment in &found {
            log::info!(
                "Saved {} {:.1}-{:.1}s ({}, confidence {:.3})",
                segment.segment_type,
                segment.start_sec,
                segment.end_sec,
                segment.detection_method,
                segment.confidence
            );
        }

        let samples_added = self.store_samples(key, detection.samples).await;

        let retrain = if self.record_success() {
            self.retrain_if_ready().await
        } else {
            None
        };

        Ok(DetectionResult {
            opening,
            ending,
            samples_added,
            retrain,
        })
    }

    async fn store_samples(&self, key: &EpisodeKey, samples: Vec<TrainingSample>) -> usize {
        if samples.is_empty() {
            return 0;
        }
        let corpus = Arc::clone(&self.corpus);
        let series_id = key.series_id.clone();
        let episode_number = key.episode_number;
        let stored = tokio::task::spawn_blocking(move || {
            corpus
                .append(&series_id, episode_number, &samples)
                .map(|path| path.map(|p| (p, samples.len())))
        })
        .await;

        match stored {
            Ok(Ok(Some((path, count)))) => {
                log::info!("Stored {} training samples in {:?}", count, path);
                count
            }
            Ok(Ok(None)) => 0,
            Ok(Err(e)) => {
                log::warn!("Failed to store training samples for {}: {:#}", key, e);
                0
            }
            Err(e) => {
                log::warn!("Training sample task for {} failed: {}", key, e);
                0
            }
        }
    }

    /// Count one successful analysis; true when a retrain is due.
    fn record_success(&self) -> bool {
        let count = self.processed.fetch_add(1, Ordering::SeqCst) + 1;
        is_retrain_due(count, self.config.training.retrain_every)
    }

    // =========================================================================
    // Training
    // =========================================================================

    /// Train on the blocking pool when the corpus is large enough, then
    /// reload the classifier.
    async fn retrain_if_ready(&self) -> Option<TrainingReport> {
        let trainer = Arc::clone(&self.trainer);
        let corpus = Arc::clone(&self.corpus);
        let result = tokio::task::spawn_blocking(move || {
            if !trainer.has_enough_data(&corpus)? {
                return Ok(None);
            }
            trainer.train(&corpus)
        })
        .await;

        match result {
            Ok(Ok(Some(report))) => {
                log::info!(
                    "Retrained on {} samples (loss {:.4}, accuracy {:.1}%)",
                    report.samples,
                    report.final_loss,
                    report.final_accuracy * 100.0
                );
                self.engine.classifier().reload();
                Some(report)
            }
            Ok(Ok(None)) => {
                log::info!("Retrain skipped: corpus too small or training already running");
                None
            }
            Ok(Err(e)) => {
                self.errors.log_error("retrain_model", &format!("{:#}", e), None);
                None
            }
            Err(e) => {
                self.errors.log_error("retrain_model", &e.to_string(), None);
                None
            }
        }
    }

    /// Start a background retrain if the corpus allows it.
    pub async fn retrain_model(self: &Arc<Self>) -> anyhow::Result<RetrainStatus> {
        if self.trainer.is_training() {
            return Ok(RetrainStatus::AlreadyRunning);
        }
        let corpus = Arc::clone(&self.corpus);
        let corpus_size = tokio::task::spawn_blocking(move || corpus.len())
            .await
            .map_err(|e| anyhow::anyhow!("corpus size task failed: {}", e))??;
        let required = self.config.training.min_samples;
        if corpus_size < required {
            return Ok(RetrainStatus::NotEnoughData {
                corpus_size,
                required,
            });
        }

        let worker = Arc::clone(self);
        self.tracker.spawn(
            async move {
                worker.retrain_if_ready().await;
            }
            .instrument(tracing::info_span!("retrain")),
        );
        Ok(RetrainStatus::Training { corpus_size })
    }

    pub fn ml_status(&self) -> anyhow::Result<MlStatus> {
        Ok(MlStatus {
            model_available: self.engine.classifier().is_available(),
            model_file_exists: self.checkpoint_path().exists(),
            training_in_progress: self.trainer.is_training(),
            processed_episodes: self.processed_episodes(),
            corpus_size: self.corpus.len()?,
            samples_by_class: self.corpus.class_counts()?,
        })
    }

    // =========================================================================
    // Batches
    // =========================================================================

    fn analyzed_numbers(&self, series_id: &str, source_id: &str) -> BTreeSet<i64> {
        self.db
            .analyzed_episode_numbers(series_id, source_id)
            .unwrap_or_else(|e| {
                log::warn!("Failed to read analyzed episodes of {}: {:#}", series_id, e);
                BTreeSet::new()
            })
    }

    fn pick_random(
        &self,
        series_id: &str,
        source_id: &str,
        episodes: &[EpisodeRef],
        count: usize,
    ) -> Vec<EpisodeRef> {
        let analyzed = self.analyzed_numbers(series_id, source_id);
        select_unanalyzed(episodes, &analyzed, count, &mut rand::rng())
    }

    /// Analyze up to `count` random unanalyzed episodes one after another.
    pub async fn analyze_random_episodes(
        &self,
        series_id: &str,
        source_id: &str,
        episodes: &[EpisodeRef],
        count: usize,
    ) -> BatchSummary {
        let selected = self.pick_random(series_id, source_id, episodes, count);
        log::info!(
            "Selected {} of {} episodes of {} for analysis",
            selected.len(),
            episodes.len(),
            series_id
        );
        self.run_batch(series_id, source_id, selected).await
    }

    async fn run_batch(&self, series_id: &str, source_id: &str, episodes: Vec<EpisodeRef>) -> BatchSummary {
        let mut summary = BatchSummary {
            selected: episodes.len(),
            ..Default::default()
        };
        let delay = Duration::from_secs_f64(self.config.analysis.inter_episode_delay_secs.max(0.0));

        for (i, episode) in episodes.iter().enumerate() {
            if i > 0 && !delay.is_zero() {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            if self.cancel.is_cancelled() {
                break;
            }

            if let Ok(Some(_)) = self.db.get_skip_segments(series_id, source_id, episode.number) {
                summary.skipped += 1;
                continue;
            }

            let key = EpisodeKey::new(series_id, source_id, episode.number);
            match self.analyze_episode(&key, &episode.id).await {
                Ok(_) => summary.analyzed += 1,
                Err(AnalysisError::InProgress(_)) => summary.skipped += 1,
                Err(AnalysisError::Cancelled) => break,
                Err(_) => summary.failed += 1,
            }
        }

        log::info!(
            "Batch for {} done: {} analyzed, {} failed, {} skipped",
            series_id,
            summary.analyzed,
            summary.failed,
            summary.skipped
        );
        summary
    }

    async fn list_episodes(&self, series_id: &str, source_id: &str) -> Result<Vec<EpisodeRef>, AnalysisError> {
        let source = self
            .sources
            .get(source_id)
            .ok_or_else(|| AnalysisError::UnknownSource(source_id.to_string()))?;
        source
            .list_episodes(series_id)
            .await
            .map_err(|e| AnalysisError::ListEpisodes {
                series_id: series_id.to_string(),
                message: format!("{:#}", e),
            })
    }

    fn spawn_batch(self: &Arc<Self>, series_id: &str, source_id: &str, episodes: Vec<EpisodeRef>) {
        let worker = Arc::clone(self);
        let series = series_id.to_string();
        let source = source_id.to_string();
        let span = tracing::info_span!("batch", source = %source, series = %series);
        self.tracker.spawn(
            async move {
                worker.run_batch(&series, &source, episodes).await;
            }
            .instrument(span),
        );
    }

    /// Queue every unanalyzed episode of a series, in episode order.
    pub async fn analyze_series(
        self: &Arc<Self>,
        series_id: &str,
        source_id: &str,
    ) -> Result<SeriesBatch, AnalysisError> {
        let episodes = self.list_episodes(series_id, source_id).await?;
        let analyzed = self.analyzed_numbers(series_id, source_id);
        let pending: Vec<EpisodeRef> = episodes
            .iter()
            .filter(|e| !analyzed.contains(&e.number))
            .cloned()
            .collect();

        let batch = SeriesBatch {
            episodes: episodes.len(),
            queued: pending.len(),
        };
        self.spawn_batch(series_id, source_id, pending);
        Ok(batch)
    }

    /// Queue a random sample of unanalyzed episodes of a series.
    pub async fn scan_series(
        self: &Arc<Self>,
        series_id: &str,
        source_id: &str,
        count: usize,
    ) -> Result<SeriesBatch, AnalysisError> {
        let episodes = self.list_episodes(series_id, source_id).await?;
        let selected = self.pick_random(series_id, source_id, &episodes, count);
        let batch = SeriesBatch {
            episodes: episodes.len(),
            queued: selected.len(),
        };
        self.spawn_batch(series_id, source_id, selected);
        Ok(batch)
    }

    /// Wait for every background task spawned so far.
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Cancel background work and wait for it to stop.
    pub async fn shutdown(&self) {
        log::info!("Shutting down analysis worker ({} in flight)", self.in_flight_count());
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        log::info!("Analysis worker stopped");
    }
}

fn segment_for(key: &EpisodeKey, segment_type: SegmentType, found: FoundSegment) -> SkipSegment {
    SkipSegment {
        series_id: key.series_id.clone(),
        source_id: key.source_id.clone(),
        episode_number: key.episode_number,
        segment_type,
        start_sec: found.times.start,
        end_sec: found.times.end,
        confidence: found.times.confidence,
        detection_method: found.method,
        created_at: None,
    }
}
