//! Classifier training on the accumulated corpus.

use anyhow::{Context, Result};
use candle_core::{DType, Device, ModuleT, Tensor, D};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use super::corpus::{TrainingCorpus, TrainingSample};
use super::model::{normalize_db, windows_to_tensor, ModelHandle};
use super::{ClassCounts, SegmentClass};
use crate::config::TrainingConfig;

const PLATEAU_THRESHOLD: f64 = 1e-4;

#[derive(Debug, Clone, Serialize)]
pub struct TrainingReport {
    pub samples: usize,
    pub class_counts: ClassCounts,
    pub epochs: usize,
    pub final_loss: f32,
    pub final_accuracy: f32,
    pub learning_rate: f64,
    pub fine_tuned: bool,
}

/// Halves the learning rate when the monitored loss has not improved
/// (relative threshold 1e-4) for more than `patience` epochs.
#[derive(Debug, Clone)]
pub struct PlateauScheduler {
    factor: f64,
    patience: usize,
    best: f64,
    bad_epochs: usize,
}

impl PlateauScheduler {
    pub fn new(factor: f64, patience: usize) -> Self {
        Self {
            factor,
            patience,
            best: f64::INFINITY,
            bad_epochs: 0,
        }
    }

    /// Record an epoch's loss and return the learning rate to use next.
    pub fn step(&mut self, loss: f64, lr: f64) -> f64 {
        if loss < self.best * (1.0 - PLATEAU_THRESHOLD) {
            self.best = loss;
            self.bad_epochs = 0;
        } else {
            self.bad_epochs += 1;
        }

        if self.bad_epochs > self.patience {
            self.bad_epochs = 0;
            lr * self.factor
        } else {
            lr
        }
    }
}

/// Class-weighted mean cross entropy: `sum(w[y] * nll) / sum(w[y])`.
pub fn weighted_cross_entropy(
    logits: &Tensor,
    targets: &Tensor,
    class_weights: &Tensor,
) -> candle_core::Result<Tensor> {
    let log_probs = candle_nn::ops::log_softmax(logits, D::Minus1)?;
    let picked = log_probs.gather(&targets.unsqueeze(1)?, 1)?.squeeze(1)?;
    let weights = class_weights.index_select(targets, 0)?;
    let total = (picked * &weights)?.sum_all()?.neg()?;
    total.div(&weights.sum_all()?)
}

/// Downsample content to at most opening + ending, then cap the total.
pub fn rebalance<R: Rng + ?Sized>(
    samples: Vec<TrainingSample>,
    max_total: usize,
    rng: &mut R,
) -> Vec<TrainingSample> {
    let (mut content, mut balanced): (Vec<_>, Vec<_>) = samples
        .into_iter()
        .partition(|s| s.label == SegmentClass::Content);

    let target_content = balanced.len();
    if content.len() > target_content {
        content.shuffle(rng);
        content.truncate(target_content);
    }

    balanced.extend(content);
    balanced.shuffle(rng);
    balanced.truncate(max_total);
    balanced
}

/// Keep only samples shaped like the first one.
fn uniform_shape(samples: Vec<TrainingSample>) -> Vec<TrainingSample> {
    let Some(shape) = samples.first().map(|s| s.window.dim()) else {
        return samples;
    };
    let before = samples.len();
    let kept: Vec<_> = samples.into_iter().filter(|s| s.window.dim() == shape).collect();
    if kept.len() < before {
        log::warn!(
            "Skipped {} training samples not shaped {:?}",
            before - kept.len(),
            shape
        );
    }
    kept
}

/// Clears the in-progress flag when training ends, however it ends.
pub struct TrainingGuard<'a>(&'a AtomicBool);

impl Drop for TrainingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct Trainer {
    config: TrainingConfig,
    checkpoint: PathBuf,
    device: Device,
    in_progress: AtomicBool,
}

impl Trainer {
    pub fn new(config: TrainingConfig, checkpoint: PathBuf) -> Self {
        Self {
            config,
            checkpoint,
            device: Device::Cpu,
            in_progress: AtomicBool::new(false),
        }
    }

    pub fn is_training(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    /// Claim the single training slot, or `None` if a run is active.
    pub fn try_begin(&self) -> Option<TrainingGuard<'_>> {
        self.in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| TrainingGuard(&self.in_progress))
    }

    pub fn has_enough_data(&self, corpus: &TrainingCorpus) -> Result<bool> {
        Ok(corpus.len()? >= self.config.min_samples)
    }

    /// Train with the configured epochs, batch size and learning rate.
    pub fn train(&self, corpus: &TrainingCorpus) -> Result<Option<TrainingReport>> {
        self.train_model(
            corpus,
            self.config.epochs,
            self.config.batch_size,
            self.config.learning_rate,
        )
    }

    /// Train on the whole corpus and overwrite the checkpoint. Returns `None`
    /// without doing anything when another run is active or the corpus is
    /// below the minimum size.
    pub fn train_model(
        &self,
        corpus: &TrainingCorpus,
        epochs: usize,
        batch_size: usize,
        lr: f64,
    ) -> Result<Option<TrainingReport>> {
        let Some(_guard) = self.try_begin() else {
            log::info!("Training already in progress, skipping");
            return Ok(None);
        };
        let samples = corpus.load_all()?;
        self.fit(samples, epochs, batch_size, lr, &mut rand::rng())
    }

    fn fit<R: Rng + ?Sized>(
        &self,
        samples: Vec<TrainingSample>,
        epochs: usize,
        batch_size: usize,
        lr: f64,
        rng: &mut R,
    ) -> Result<Option<TrainingReport>> {
        if samples.len() < self.config.min_samples {
            log::info!(
                "Not enough training data ({}/{})",
                samples.len(),
                self.config.min_samples
            );
            return Ok(None);
        }

        let samples = rebalance(uniform_shape(samples), self.config.max_samples, rng);
        let class_counts = ClassCounts::from_labels(
            &samples.iter().map(|s| s.label.index() as u32).collect::<Vec<_>>(),
        );
        if samples.is_empty() {
            return Ok(None);
        }
        log::info!(
            "Training on {} samples (OP: {}, ED: {}, content: {})",
            samples.len(),
            class_counts.opening,
            class_counts.ending,
            class_counts.content
        );

        let (handle, fine_tuned) = self.initial_model()?;
        let params = ParamsAdamW {
            lr,
            weight_decay: 0.0,
            ..Default::default()
        };
        let mut optimizer = AdamW::new(handle.varmap.all_vars(), params)?;
        let mut scheduler = PlateauScheduler::new(self.config.plateau_factor, self.config.plateau_patience);
        let class_weights = Tensor::new(&self.config.class_weights, &self.device)?;

        let mut order: Vec<usize> = (0..samples.len()).collect();
        let mut final_loss = 0.0f32;
        let mut final_accuracy = 0.0f32;
        let mut current_lr = lr;

        for epoch in 0..epochs {
            order.shuffle(rng);
            let mut loss_sum = 0.0f32;
            let mut batches = 0usize;
            let mut correct = 0.0f32;

            for chunk in order.chunks(batch_size.max(1)) {
                let views: Vec<_> = chunk.iter().map(|&i| samples[i].window.view()).collect();
                let labels: Vec<u32> = chunk.iter().map(|&i| samples[i].label.index() as u32).collect();

                let xs = normalize_db(&windows_to_tensor(&views, &self.device)?)?;
                let ys = Tensor::new(labels.as_slice(), &self.device)?;

                let logits = handle.model.forward_t(&xs, true)?;
                let loss = weighted_cross_entropy(&logits, &ys, &class_weights)?;
                optimizer.backward_step(&loss)?;

                loss_sum += loss.to_scalar::<f32>()?;
                batches += 1;
                correct += logits
                    .argmax(D::Minus1)?
                    .eq(&ys)?
                    .to_dtype(DType::F32)?
                    .sum_all()?
                    .to_scalar::<f32>()?;
            }

            final_loss = if batches > 0 { loss_sum / batches as f32 } else { 0.0 };
            final_accuracy = correct / samples.len() as f32;

            let next_lr = scheduler.step(final_loss as f64, current_lr);
            if next_lr != current_lr {
                log::info!("Reducing learning rate to {:e}", next_lr);
                optimizer.set_learning_rate(next_lr);
                current_lr = next_lr;
            }

            if (epoch + 1) % 10 == 0 {
                log::info!(
                    "Epoch {}/{} - Loss: {:.4} - Acc: {:.2}%",
                    epoch + 1,
                    epochs,
                    final_loss,
                    final_accuracy * 100.0
                );
            }
        }

        handle.save(&self.checkpoint)?;
        log::info!("Model saved ({:?})", self.checkpoint);

        Ok(Some(TrainingReport {
            samples: samples.len(),
            class_counts,
            epochs,
            final_loss,
            final_accuracy,
            learning_rate: current_lr,
            fine_tuned,
        }))
    }

    /// Existing checkpoint weights when loadable, fresh weights otherwise.
    fn initial_model(&self) -> Result<(ModelHandle, bool)> {
        if self.checkpoint.exists() {
            match ModelHandle::load(&self.checkpoint, &self.device) {
                Ok(handle) => {
                    log::info!("Loaded existing model weights for fine-tuning");
                    return Ok((handle, true));
                }
                Err(e) => log::warn!("Could not load existing model, training from scratch: {:#}", e),
            }
        }
        let handle = ModelHandle::fresh(&self.device).context("initializing classifier")?;
        Ok((handle, false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn sample(label: SegmentClass, rows: usize, cols: usize) -> TrainingSample {
        let level = match label {
            SegmentClass::Opening => -10.0,
            SegmentClass::Ending => -40.0,
            SegmentClass::Content => -70.0,
        };
        TrainingSample {
            window: Array2::from_shape_fn((rows, cols), |(r, c)| level + ((r * 7 + c) % 5) as f32),
            label,
        }
    }

    fn samples(op: usize, ed: usize, content: usize) -> Vec<TrainingSample> {
        let mut out = Vec::new();
        out.extend((0..op).map(|_| sample(SegmentClass::Opening, 16, 32)));
        out.extend((0..ed).map(|_| sample(SegmentClass::Ending, 16, 32)));
        out.extend((0..content).map(|_| sample(SegmentClass::Content, 16, 32)));
        out
    }

    fn small_config() -> TrainingConfig {
        TrainingConfig {
            epochs: 1,
            batch_size: 16,
            ..TrainingConfig::default()
        }
    }

    fn counts(samples: &[TrainingSample]) -> ClassCounts {
        ClassCounts::from_labels(&samples.iter().map(|s| s.label.index() as u32).collect::<Vec<_>>())
    }

    #[test]
    fn rebalance_caps_content_at_opening_plus_ending() {
        let mut rng = StdRng::seed_from_u64(7);
        let balanced = rebalance(samples(10, 5, 100), 3000, &mut rng);
        assert_eq!(counts(&balanced), ClassCounts { opening: 10, ending: 5, content: 15 });
    }

    #[test]
    fn rebalance_keeps_scarce_content() {
        let mut rng = StdRng::seed_from_u64(7);
        let balanced = rebalance(samples(10, 10, 4), 3000, &mut rng);
        assert_eq!(counts(&balanced).content, 4);
        assert_eq!(balanced.len(), 24);
    }

    #[test]
    fn rebalance_caps_total() {
        let mut rng = StdRng::seed_from_u64(7);
        let balanced = rebalance(samples(40, 40, 200), 50, &mut rng);
        assert_eq!(balanced.len(), 50);
    }

    #[test]
    fn scheduler_halves_after_patience() {
        let mut scheduler = PlateauScheduler::new(0.5, 5);
        let mut lr = 1e-3;
        lr = scheduler.step(1.0, lr);
        for _ in 0..5 {
            lr = scheduler.step(1.0, lr);
            assert_eq!(lr, 1e-3);
        }
        lr = scheduler.step(1.0, lr);
        assert_eq!(lr, 5e-4);
        // Improvements reset the count
        lr = scheduler.step(0.5, lr);
        assert_eq!(lr, 5e-4);
    }

    #[test]
    fn weighted_loss_matches_hand_computation() {
        let device = Device::Cpu;
        let logits = Tensor::zeros((2, 3), DType::F32, &device).unwrap();
        let targets = Tensor::new(&[0u32, 2], &device).unwrap();
        let weights = Tensor::new(&[2f32, 2.0, 1.0], &device).unwrap();
        let loss = weighted_cross_entropy(&logits, &targets, &weights)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!((loss - 3f32.ln()).abs() < 1e-5);

        let confident = Tensor::new(&[[10f32, 0.0, 0.0], [0.0, 0.0, 10.0]], &device).unwrap();
        let low = weighted_cross_entropy(&confident, &targets, &weights)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(low < 0.01);
    }

    #[test]
    fn too_few_samples_skips_training() {
        let temp = tempfile::TempDir::new().unwrap();
        let checkpoint = temp.path().join("cnn.safetensors");
        let trainer = Trainer::new(small_config(), checkpoint.clone());
        let report = trainer
            .fit(samples(10, 10, 10), 1, 16, 1e-3, &mut StdRng::seed_from_u64(1))
            .unwrap();
        assert!(report.is_none());
        assert!(!checkpoint.exists());
    }

    #[test]
    fn concurrent_training_is_refused() {
        let temp = tempfile::TempDir::new().unwrap();
        let corpus = TrainingCorpus::new(temp.path().join("features"));
        let trainer = Trainer::new(small_config(), temp.path().join("cnn.safetensors"));

        let guard = trainer.try_begin().unwrap();
        assert!(trainer.is_training());
        assert!(trainer.try_begin().is_none());
        assert!(trainer.train(&corpus).unwrap().is_none());
        drop(guard);
        assert!(!trainer.is_training());
    }

    #[test]
    fn trains_and_fine_tunes_from_checkpoint() {
        let temp = tempfile::TempDir::new().unwrap();
        let corpus = TrainingCorpus::new(temp.path().join("features"));
        corpus.append("demo", 1, &samples(20, 20, 60)).unwrap();

        let checkpoint = temp.path().join("models").join("cnn.safetensors");
        let trainer = Trainer::new(small_config(), checkpoint.clone());

        let first = trainer.train(&corpus).unwrap().unwrap();
        assert!(checkpoint.exists());
        assert!(!first.fine_tuned);
        assert_eq!(first.samples, 80);
        assert_eq!(first.class_counts.opening, 20);
        assert_eq!(first.class_counts.content, 40);
        assert!(first.final_loss.is_finite());
        assert!(!trainer.is_training());

        let second = trainer.train(&corpus).unwrap().unwrap();
        assert!(second.fine_tuned);
    }

    #[test]
    fn unreadable_checkpoint_falls_back_to_fresh_model() {
        let temp = tempfile::TempDir::new().unwrap();
        let checkpoint = temp.path().join("cnn.safetensors");
        std::fs::write(&checkpoint, b"garbage").unwrap();

        let trainer = Trainer::new(small_config(), checkpoint.clone());
        let report = trainer
            .fit(samples(20, 20, 20), 1, 16, 1e-3, &mut StdRng::seed_from_u64(3))
            .unwrap()
            .unwrap();
        assert!(!report.fine_tuned);
        assert!(ModelHandle::load(&checkpoint, &Device::Cpu).is_ok());
    }
}
