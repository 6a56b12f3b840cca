//! Labeled spectrogram windows accumulated across analyzed episodes.
//!
//! Each analysis appends one safetensors archive (`specs`: f32
//! `[n, mels, frames]`, `labels`: u32 `[n]`) under the features directory.
//! Archives are never overwritten; the corpus is the union of all of them.

use anyhow::{anyhow, Context, Result};
use candle_core::{Device, Tensor};
use ndarray::Array2;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::features::MelSpectrogram;
use super::{ClassCounts, SegmentClass};

const ARCHIVE_EXT: &str = "safetensors";
/// Minimum overlap, in seconds, for a window to take the segment's label.
pub const MIN_LABEL_OVERLAP_SECS: f64 = 5.0;

#[derive(Debug, Clone)]
pub struct TrainingSample {
    pub window: Array2<f32>,
    pub label: SegmentClass,
}

/// Label for a window against a segment: the segment's class when they
/// overlap by at least 5 s, content when the window lies fully outside, and
/// nothing for the ambiguous partial overlaps in between.
pub fn label_window(
    window_start: f64,
    window_end: f64,
    segment_start: f64,
    segment_end: f64,
    label: SegmentClass,
) -> Option<SegmentClass> {
    let overlap = window_end.min(segment_end) - window_start.max(segment_start);
    if overlap >= MIN_LABEL_OVERLAP_SECS {
        Some(label)
    } else if window_end <= segment_start || window_start >= segment_end {
        Some(SegmentClass::Content)
    } else {
        None
    }
}

/// Label every window of a clip's spectrogram against one segment, given in
/// seconds relative to the start of the clip.
pub fn build_training_samples(
    spectrogram: &MelSpectrogram,
    segment_start: f64,
    segment_end: f64,
    label: SegmentClass,
) -> Vec<TrainingSample> {
    spectrogram
        .windows()
        .filter_map(|w| {
            label_window(w.start_sec, w.end_sec(), segment_start, segment_end, label).map(|label| {
                TrainingSample {
                    window: w.data.to_owned(),
                    label,
                }
            })
        })
        .collect()
}

/// Archive file stem for an episode: series id reduced to `[A-Za-z0-9_-]`.
pub fn archive_stem(series_id: &str, episode_number: i64) -> String {
    let series: String = series_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{}_ep{}", series, episode_number)
}

pub struct TrainingCorpus {
    dir: PathBuf,
    counts: Mutex<Option<ClassCounts>>,
}

impl TrainingCorpus {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            counts: Mutex::new(None),
        }
    }

    /// Write samples as a new archive. Returns the archive path, or `None`
    /// when there was nothing to write.
    pub fn append(
        &self,
        series_id: &str,
        episode_number: i64,
        samples: &[TrainingSample],
    ) -> Result<Option<PathBuf>> {
        let Some(first) = samples.first() else {
            return Ok(None);
        };
        let (mels, frames) = first.window.dim();

        let mut flat = Vec::with_capacity(samples.len() * mels * frames);
        let mut labels = Vec::with_capacity(samples.len());
        for sample in samples {
            if sample.window.dim() != (mels, frames) {
                log::warn!(
                    "Skipping sample with shape {:?} (expected {:?})",
                    sample.window.dim(),
                    (mels, frames)
                );
                continue;
            }
            flat.extend(sample.window.iter().copied());
            labels.push(sample.label.index() as u32);
        }

        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating corpus dir {:?}", self.dir))?;
        let path = self.next_archive_path(&archive_stem(series_id, episode_number));

        let n = labels.len();
        let mut tensors = HashMap::new();
        tensors.insert(
            "specs".to_string(),
            Tensor::from_vec(flat, (n, mels, frames), &Device::Cpu)?,
        );
        tensors.insert("labels".to_string(), Tensor::from_vec(labels, n, &Device::Cpu)?);
        candle_core::safetensors::save(&tensors, &path)
            .with_context(|| format!("writing training archive {:?}", path))?;

        self.invalidate_counts();
        log::info!("Saved {} training samples to {:?}", n, path);
        Ok(Some(path))
    }

    fn next_archive_path(&self, stem: &str) -> PathBuf {
        let first = self.dir.join(format!("{}.{}", stem, ARCHIVE_EXT));
        if !first.exists() {
            return first;
        }
        (2..)
            .map(|i| self.dir.join(format!("{}_{}.{}", stem, i, ARCHIVE_EXT)))
            .find(|p| !p.exists())
            .unwrap_or(first)
    }

    fn archives(&self) -> Result<Vec<PathBuf>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut paths: Vec<PathBuf> = std::fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some(ARCHIVE_EXT))
            .collect();
        paths.sort();
        Ok(paths)
    }

    fn read_archive(path: &Path) -> Result<(Tensor, Vec<u32>)> {
        let tensors = candle_core::safetensors::load(path, &Device::Cpu)?;
        let specs = tensors
            .get("specs")
            .cloned()
            .ok_or_else(|| anyhow!("archive has no 'specs' tensor"))?;
        let labels = tensors
            .get("labels")
            .ok_or_else(|| anyhow!("archive has no 'labels' tensor"))?
            .to_vec1::<u32>()?;
        anyhow::ensure!(
            specs.dims().first() == Some(&labels.len()),
            "specs/labels length mismatch"
        );
        Ok((specs, labels))
    }

    /// Every sample of every readable archive. Unreadable archives are
    /// logged and skipped.
    pub fn load_all(&self) -> Result<Vec<TrainingSample>> {
        let mut samples = Vec::new();
        for path in self.archives()? {
            let (specs, labels) = match Self::read_archive(&path) {
                Ok(archive) => archive,
                Err(e) => {
                    log::warn!("Skipping training archive {:?}: {:#}", path, e);
                    continue;
                }
            };
            let (n, mels, frames) = specs.dims3()?;
            let flat = specs.flatten_all()?.to_vec1::<f32>()?;
            for (i, chunk) in flat.chunks_exact(mels * frames).take(n).enumerate() {
                let Some(label) = SegmentClass::from_index(labels[i]) else {
                    continue;
                };
                samples.push(TrainingSample {
                    window: Array2::from_shape_vec((mels, frames), chunk.to_vec())?,
                    label,
                });
            }
        }
        Ok(samples)
    }

    /// Per-class sample counts, cached until the next append.
    pub fn class_counts(&self) -> Result<ClassCounts> {
        let mut cached = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(counts) = *cached {
            return Ok(counts);
        }
        let mut counts = ClassCounts::default();
        for path in self.archives()? {
            match Self::read_archive(&path) {
                Ok((_, labels)) => {
                    for label in labels {
                        counts.add(label, 1);
                    }
                }
                Err(e) => log::warn!("Skipping training archive {:?}: {:#}", path, e),
            }
        }
        *cached = Some(counts);
        Ok(counts)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.class_counts()?.total())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn invalidate_counts(&self) {
        *self.counts.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}
