//! Classifier inference over head/tail spectrograms.

use anyhow::Result;
use candle_core::Device;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::features::{MelSpectrogram, WINDOW_SECS, WINDOW_STRIDE_SECS};
use super::model::ModelHandle;
use super::SegmentClass;
use crate::config::InferenceConfig;
use crate::database::SegmentTimes;

/// Opening/ending found in one episode, either side possibly missing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct DetectionOutcome {
    pub opening: Option<SegmentTimes>,
    pub ending: Option<SegmentTimes>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowPrediction {
    pub start_sec: f64,
    pub probs: [f32; 3],
}

impl WindowPrediction {
    pub fn predicted_class(&self) -> SegmentClass {
        let mut best = 0;
        for i in 1..self.probs.len() {
            if self.probs[i] > self.probs[best] {
                best = i;
            }
        }
        SegmentClass::from_index(best as u32).unwrap_or(SegmentClass::Content)
    }
}

/// A run of consecutive windows qualifying for one class.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowRun {
    pub first: usize,
    pub len: usize,
    pub mean_prob: f64,
}

/// Longest run of windows predicted as `target` with probability above
/// `threshold`. Ties keep the earliest run; runs shorter than `min_len` are
/// rejected.
pub fn find_longest_run(
    predictions: &[WindowPrediction],
    target: SegmentClass,
    threshold: f32,
    min_len: usize,
) -> Option<WindowRun> {
    let qualifies = |p: &WindowPrediction| {
        p.predicted_class() == target && p.probs[target.index()] > threshold
    };

    let mut best: Option<WindowRun> = None;
    let mut i = 0;
    while i < predictions.len() {
        if !qualifies(&predictions[i]) {
            i += 1;
            continue;
        }
        let first = i;
        let mut prob_sum = 0.0f64;
        while i < predictions.len() && qualifies(&predictions[i]) {
            prob_sum += predictions[i].probs[target.index()] as f64;
            i += 1;
        }
        let len = i - first;
        if best.map_or(true, |b| len > b.len) {
            best = Some(WindowRun {
                first,
                len,
                mean_prob: prob_sum / len as f64,
            });
        }
    }

    best.filter(|run| run.len >= min_len.max(1))
}

/// Time range covered by a run, through the end of its last window.
pub fn run_to_segment(
    predictions: &[WindowPrediction],
    run: &WindowRun,
    time_offset: f64,
) -> SegmentTimes {
    let start = predictions[run.first].start_sec;
    let end = start + (run.len - 1) as f64 * WINDOW_STRIDE_SECS + WINDOW_SECS;
    SegmentTimes {
        start: start + time_offset,
        end: end + time_offset,
        confidence: (run.mean_prob * 1000.0).round() / 1000.0,
    }
}

enum ModelSlot {
    Unloaded,
    Missing,
    Ready(Arc<ModelHandle>),
}

/// Lazily loaded classifier. `reload` drops the cached model so the next use
/// reads the checkpoint again; callers holding the old `Arc` keep using it.
pub struct SkipSegmentDetector {
    checkpoint: PathBuf,
    config: InferenceConfig,
    device: Device,
    slot: Mutex<ModelSlot>,
}

impl SkipSegmentDetector {
    pub fn new(checkpoint: PathBuf, config: InferenceConfig) -> Self {
        Self {
            checkpoint,
            config,
            device: Device::Cpu,
            slot: Mutex::new(ModelSlot::Unloaded),
        }
    }

    pub fn checkpoint_path(&self) -> &Path {
        &self.checkpoint
    }

    pub fn is_available(&self) -> bool {
        self.model().is_some()
    }

    pub fn reload(&self) {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        *slot = ModelSlot::Unloaded;
        log::info!("Classifier marked for reload from {:?}", self.checkpoint);
    }

    fn model(&self) -> Option<Arc<ModelHandle>> {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        if let ModelSlot::Unloaded = *slot {
            *slot = if !self.checkpoint.exists() {
                log::debug!("No classifier checkpoint at {:?}", self.checkpoint);
                ModelSlot::Missing
            } else {
                match ModelHandle::load(&self.checkpoint, &self.device) {
                    Ok(handle) => {
                        log::info!("Loaded classifier from {:?}", self.checkpoint);
                        ModelSlot::Ready(Arc::new(handle))
                    }
                    Err(e) => {
                        log::warn!("Failed to load classifier: {:#}", e);
                        ModelSlot::Missing
                    }
                }
            };
        }
        match &*slot {
            ModelSlot::Ready(handle) => Some(Arc::clone(handle)),
            _ => None,
        }
    }

    /// Classify every window of a spectrogram, batching forward passes.
    pub fn classify(&self, spectrogram: &MelSpectrogram) -> Result<Vec<WindowPrediction>> {
        let Some(model) = self.model() else {
            return Ok(Vec::new());
        };
        classify_with(&model, spectrogram, self.config.batch_size)
    }

    /// Run the classifier over the head (for the opening) and the tail (for
    /// the ending). Returns an empty outcome when no model is available.
    pub fn detect(
        &self,
        head: Option<&MelSpectrogram>,
        tail: Option<&MelSpectrogram>,
        tail_offset: f64,
    ) -> Result<DetectionOutcome> {
        let Some(model) = self.model() else {
            return Ok(DetectionOutcome::default());
        };

        let mut outcome = DetectionOutcome::default();
        if let Some(head) = head {
            let predictions = classify_with(&model, head, self.config.batch_size)?;
            outcome.opening = self.best_segment(&predictions, SegmentClass::Opening, 0.0);
        }
        if let Some(tail) = tail {
            let predictions = classify_with(&model, tail, self.config.batch_size)?;
            outcome.ending = self.best_segment(&predictions, SegmentClass::Ending, tail_offset);
        }

        log::info!(
            "Classifier: opening={:?} ending={:?}",
            outcome.opening.map(|s| (s.start, s.end)),
            outcome.ending.map(|s| (s.start, s.end))
        );
        Ok(outcome)
    }

    fn best_segment(
        &self,
        predictions: &[WindowPrediction],
        target: SegmentClass,
        time_offset: f64,
    ) -> Option<SegmentTimes> {
        find_longest_run(
            predictions,
            target,
            self.config.confidence_threshold,
            self.config.min_consecutive_windows,
        )
        .map(|run| run_to_segment(predictions, &run, time_offset))
    }
}

fn classify_with(
    model: &ModelHandle,
    spectrogram: &MelSpectrogram,
    batch_size: usize,
) -> Result<Vec<WindowPrediction>> {
    let windows: Vec<_> = spectrogram.windows().collect();
    let mut predictions = Vec::with_capacity(windows.len());
    for chunk in windows.chunks(batch_size.max(1)) {
        let views: Vec<_> = chunk.iter().map(|w| w.data).collect();
        let probs = model.predict(&views)?;
        predictions.extend(chunk.iter().zip(probs).map(|(w, probs)| WindowPrediction {
            start_sec: w.start_sec,
            probs,
        }));
    }
    Ok(predictions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::features::{HOP_LENGTH, N_MELS};
    use ndarray::Array2;

    fn prediction(k: usize, probs: [f32; 3]) -> WindowPrediction {
        WindowPrediction {
            start_sec: k as f64 * WINDOW_STRIDE_SECS,
            probs,
        }
    }

    const OP: [f32; 3] = [0.9, 0.05, 0.05];
    const WEAK_OP: [f32; 3] = [0.6, 0.2, 0.2];
    const ED: [f32; 3] = [0.05, 0.9, 0.05];
    const CONTENT: [f32; 3] = [0.1, 0.1, 0.8];

    fn sequence(pattern: &[[f32; 3]]) -> Vec<WindowPrediction> {
        pattern.iter().enumerate().map(|(k, p)| prediction(k, *p)).collect()
    }

    #[test]
    fn two_windows_are_not_enough() {
        let preds = sequence(&[CONTENT, OP, OP, CONTENT, CONTENT]);
        assert!(find_longest_run(&preds, SegmentClass::Opening, 0.7, 3).is_none());
    }

    #[test]
    fn three_windows_are_accepted() {
        let preds = sequence(&[CONTENT, OP, OP, OP, CONTENT]);
        let run = find_longest_run(&preds, SegmentClass::Opening, 0.7, 3).unwrap();
        assert_eq!((run.first, run.len), (1, 3));

        let segment = run_to_segment(&preds, &run, 0.0);
        assert_eq!(segment.start, 5.0);
        assert_eq!(segment.end, 5.0 + 2.0 * 5.0 + 10.0);
        assert!((segment.confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn low_probability_breaks_run() {
        let preds = sequence(&[OP, OP, WEAK_OP, OP, OP]);
        assert!(find_longest_run(&preds, SegmentClass::Opening, 0.7, 3).is_none());
    }

    #[test]
    fn longest_run_wins_and_ties_keep_first() {
        let preds = sequence(&[OP, OP, OP, CONTENT, OP, OP, OP, OP, CONTENT, OP, OP, OP, OP]);
        let run = find_longest_run(&preds, SegmentClass::Opening, 0.7, 3).unwrap();
        assert_eq!((run.first, run.len), (4, 4));
    }

    #[test]
    fn only_target_class_counts() {
        let preds = sequence(&[ED, ED, ED, ED]);
        assert!(find_longest_run(&preds, SegmentClass::Opening, 0.7, 3).is_none());
        let run = find_longest_run(&preds, SegmentClass::Ending, 0.7, 3).unwrap();
        let segment = run_to_segment(&preds, &run, 1100.0);
        assert_eq!(segment.start, 1100.0);
        assert_eq!(segment.end, 1100.0 + 3.0 * 5.0 + 10.0);
    }

    #[test]
    fn missing_checkpoint_means_unavailable() {
        let temp = tempfile::TempDir::new().unwrap();
        let detector = SkipSegmentDetector::new(
            temp.path().join("absent.safetensors"),
            InferenceConfig::default(),
        );
        assert!(!detector.is_available());

        let spec = MelSpectrogram::from_parts(Array2::zeros((N_MELS, 600)), 22_050, HOP_LENGTH, 13.0);
        let outcome = detector.detect(Some(&spec), Some(&spec), 100.0).unwrap();
        assert_eq!(outcome, DetectionOutcome::default());
    }

    #[test]
    fn reload_picks_up_new_checkpoint() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("cnn.safetensors");
        let detector = SkipSegmentDetector::new(path.clone(), InferenceConfig::default());
        assert!(!detector.is_available());

        ModelHandle::fresh(&Device::Cpu).unwrap().save(&path).unwrap();
        // Still cached as missing until reloaded
        assert!(!detector.is_available());
        detector.reload();
        assert!(detector.is_available());

        let spec = MelSpectrogram::from_parts(
            Array2::from_elem((16, 200), -40.0),
            22_050,
            HOP_LENGTH,
            4.6,
        );
        assert!(detector.classify(&spec).unwrap().is_empty());
    }
}
