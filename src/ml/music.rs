//! Zero-training music detector.
//!
//! Scores short windows of a clip for "music likelihood" from spectral and
//! rhythmic statistics, then merges runs of high-scoring windows into
//! candidate opening/ending segments.

use anyhow::Result;
use ndarray::Array2;

use super::features::{power_to_db, AudioClip, MelFilterBank, Stft, HOP_LENGTH, N_FFT, N_MELS};
use crate::config::HeuristicConfig;
use crate::database::SegmentTimes;

const WEIGHTS: [f64; 4] = [0.30, 0.25, 0.25, 0.20];

const FLATNESS_REF: f64 = 0.1;
const CV_REF: f64 = 1.5;
const SILENCE_RMS: f64 = 0.001;
const CONTRAST_REF: f64 = 30.0;
const CONTRAST_BANDS: usize = 6;
const CONTRAST_FMIN: f64 = 200.0;
const CONTRAST_QUANTILE: f64 = 0.02;
const MIN_RHYTHM_LAG: usize = 3;
const MIN_ENVELOPE_FRAMES: usize = 10;
const FLAT_RHYTHM_SCORE: f64 = 0.3;
const AMIN: f64 = 1e-10;
/// Confidence of a segment that no scored window fits inside entirely.
const UNSCORED_CONFIDENCE: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowScore {
    pub start: f64,
    pub end: f64,
    pub score: f64,
}

/// A run of kept windows whose gaps are within tolerance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MergedSegment {
    pub start: f64,
    pub end: f64,
}

impl MergedSegment {
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

/// One octave band of the spectral contrast computation, as a bin range.
struct ContrastBand {
    start: usize,
    end: usize,
    quantile_len: usize,
}

pub struct MusicDetector {
    config: HeuristicConfig,
    sample_rate: u32,
    stft: Stft,
    filters: MelFilterBank,
    contrast_bands: Vec<ContrastBand>,
}

impl MusicDetector {
    pub fn new(config: HeuristicConfig, sample_rate: u32) -> Self {
        Self {
            config,
            sample_rate,
            stft: Stft::new(N_FFT, HOP_LENGTH),
            filters: MelFilterBank::new(sample_rate, N_FFT, N_MELS),
            contrast_bands: contrast_bands(sample_rate, N_FFT),
        }
    }

    /// Candidate music segments of a clip, best first. `time_offset` is added
    /// to every returned time (the tail clip's position in the episode).
    pub fn detect_music_segments(
        &self,
        clip: &AudioClip,
        time_offset: f64,
    ) -> Result<Vec<SegmentTimes>> {
        let windows = self.window_scores(clip)?;
        if windows.is_empty() {
            return Ok(Vec::new());
        }

        let scores: Vec<f64> = windows.iter().map(|w| w.score).collect();
        let threshold =
            adaptive_threshold(&scores, self.config.percentile, self.config.min_threshold);
        let kept = select_windows(&windows, threshold);

        let mut candidates: Vec<SegmentTimes> = merge_windows(&kept, self.config.gap_tolerance_secs)
            .into_iter()
            .filter(|seg| {
                let d = seg.duration();
                d >= self.config.min_duration_secs && d <= self.config.max_duration_secs
            })
            .map(|seg| SegmentTimes {
                start: round_to(seg.start + time_offset, 1),
                end: round_to(seg.end + time_offset, 1),
                confidence: round_to(
                    (segment_confidence(&windows, &seg) / self.config.confidence_scale).min(1.0),
                    3,
                ),
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        log::debug!(
            "Heuristic: {} windows, threshold {:.3}, {} kept, {} candidates",
            windows.len(),
            threshold,
            kept.len(),
            candidates.len()
        );
        Ok(candidates)
    }

    /// Music score of every analysis window of the clip, in time order.
    pub fn window_scores(&self, clip: &AudioClip) -> Result<Vec<WindowScore>> {
        let window = self.config.window_secs;
        let hop = self.config.hop_secs;
        let duration = clip.duration();
        if duration < window || hop <= 0.0 {
            return Ok(Vec::new());
        }

        let count = ((duration - window) / hop + 1e-9).floor() as usize + 1;
        let mut scores = Vec::with_capacity(count);
        for i in 0..count {
            let start = i as f64 * hop;
            let score = self.score_window(clip.slice_secs(start, window))?;
            scores.push(WindowScore {
                start,
                end: start + window,
                score,
            });
        }
        Ok(scores)
    }

    /// Weighted 0-1 music likelihood of one window of samples.
    pub fn score_window(&self, samples: &[f32]) -> Result<f64> {
        let rms = frame_rms(samples, N_FFT, HOP_LENGTH);
        let mean_rms = mean(&rms);
        if rms.is_empty() || mean_rms <= SILENCE_RMS {
            return Ok(0.0);
        }

        let power = self.stft.power(samples)?;

        let flatness = mean(&power.iter().map(|f| spectral_flatness(f)).collect::<Vec<_>>());
        let tonal = 1.0 - (flatness / FLATNESS_REF).min(1.0);

        let cv = std_dev(&rms, mean_rms) / mean_rms;
        let stability = 1.0 - (cv / CV_REF).min(1.0);

        let contrast = self.mean_spectral_contrast(&power);
        let contrast_score = (contrast / CONTRAST_REF).clamp(0.0, 1.0);

        let rhythm = self.rhythm_score(&power);

        let score = WEIGHTS[0] * tonal
            + WEIGHTS[1] * stability
            + WEIGHTS[2] * contrast_score
            + WEIGHTS[3] * rhythm;
        Ok(score.clamp(0.0, 1.0))
    }

    fn mean_spectral_contrast(&self, power: &[Vec<f32>]) -> f64 {
        let mut total = 0.0;
        let mut n = 0usize;
        let mut band_buf: Vec<f64> = Vec::with_capacity(N_FFT / 2 + 1);

        for frame in power {
            for band in &self.contrast_bands {
                band_buf.clear();
                band_buf.extend(frame[band.start..band.end].iter().map(|p| (*p as f64).sqrt()));
                band_buf.sort_unstable_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

                let q = band.quantile_len.min(band_buf.len());
                let valley = mean(&band_buf[..q]);
                let peak = mean(&band_buf[band_buf.len() - q..]);
                total += 10.0 * peak.max(AMIN).log10() - 10.0 * valley.max(AMIN).log10();
                n += 1;
            }
        }

        if n == 0 {
            0.0
        } else {
            total / n as f64
        }
    }

    /// Strongest autocorrelation peak of the onset-strength envelope.
    fn rhythm_score(&self, power: &[Vec<f32>]) -> f64 {
        let mut mel = Array2::<f32>::zeros((self.filters.n_mels(), power.len()));
        let mut column = vec![0.0f32; self.filters.n_mels()];
        for (t, frame) in power.iter().enumerate() {
            self.filters.apply(frame, &mut column);
            for (m, v) in column.iter().enumerate() {
                mel[[m, t]] = *v;
            }
        }
        power_to_db(&mut mel);

        let frames = mel.ncols();
        let mut envelope = vec![0.0f64; frames];
        for t in 1..frames {
            let rise: f64 = mel
                .column(t)
                .iter()
                .zip(mel.column(t - 1).iter())
                .map(|(cur, prev)| ((cur - prev) as f64).max(0.0))
                .sum();
            envelope[t] = rise / mel.nrows() as f64;
        }

        onset_periodicity(&envelope)
    }
}

/// Max normalized autocorrelation of an envelope over every lag >= 3, or
/// the neutral score when the envelope is too short or flat.
pub fn onset_periodicity(envelope: &[f64]) -> f64 {
    if envelope.len() <= MIN_ENVELOPE_FRAMES {
        return FLAT_RHYTHM_SCORE;
    }

    let m = mean(envelope);
    let centered: Vec<f64> = envelope.iter().map(|v| v - m).collect();
    let energy: f64 = centered.iter().map(|v| v * v).sum();
    if energy < 1e-8 {
        return FLAT_RHYTHM_SCORE;
    }

    let best = (MIN_RHYTHM_LAG..envelope.len())
        .map(|lag| {
            centered
                .iter()
                .zip(&centered[lag..])
                .map(|(a, b)| a * b)
                .sum::<f64>()
                / energy
        })
        .fold(f64::MIN, f64::max);
    best.clamp(0.0, 1.0)
}

/// Percentile (0-100) with linear interpolation between order statistics.
pub fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let rank = (p.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64)
}

pub fn adaptive_threshold(scores: &[f64], pct: f64, floor: f64) -> f64 {
    percentile(scores, pct).max(floor)
}

pub fn select_windows(windows: &[WindowScore], threshold: f64) -> Vec<WindowScore> {
    windows
        .iter()
        .filter(|w| w.score >= threshold)
        .copied()
        .collect()
}

/// Merge time-ordered windows whose gap to the running segment is at most
/// `gap_tolerance` seconds.
pub fn merge_windows(kept: &[WindowScore], gap_tolerance: f64) -> Vec<MergedSegment> {
    let mut merged: Vec<MergedSegment> = Vec::new();
    for w in kept {
        match merged.last_mut() {
            Some(current) if w.start - current.end <= gap_tolerance => {
                current.end = current.end.max(w.end);
            }
            _ => merged.push(MergedSegment {
                start: w.start,
                end: w.end,
            }),
        }
    }
    merged
}

/// Mean score of every window lying entirely inside the segment, including
/// below-threshold windows the gap tolerance bridged over.
pub fn segment_confidence(windows: &[WindowScore], segment: &MergedSegment) -> f64 {
    let inside: Vec<f64> = windows
        .iter()
        .filter(|w| w.start >= segment.start && w.end <= segment.end)
        .map(|w| w.score)
        .collect();
    if inside.is_empty() {
        UNSCORED_CONFIDENCE
    } else {
        mean(&inside)
    }
}

fn contrast_bands(sample_rate: u32, n_fft: usize) -> Vec<ContrastBand> {
    let n_bins = n_fft / 2 + 1;
    let bin_hz = sample_rate as f64 / n_fft as f64;

    let mut edges = vec![0.0];
    edges.extend((0..=CONTRAST_BANDS).map(|k| CONTRAST_FMIN * 2f64.powi(k as i32)));

    (0..=CONTRAST_BANDS)
        .filter_map(|k| {
            let (lo, hi) = (edges[k], edges[k + 1]);
            let first = (0..n_bins).find(|&b| b as f64 * bin_hz >= lo)?;
            let last = (0..n_bins).rev().find(|&b| b as f64 * bin_hz <= hi)?;
            let start = if k > 0 { first.saturating_sub(1) } else { first };
            let end = if k == CONTRAST_BANDS { n_bins } else { last + 1 };
            let width = end.saturating_sub(start);
            // All but the top octave drop their shared upper edge bin.
            let end = if k < CONTRAST_BANDS { end - 1 } else { end };
            if end <= start {
                return None;
            }
            Some(ContrastBand {
                start,
                end,
                quantile_len: ((CONTRAST_QUANTILE * width as f64).round() as usize).max(1),
            })
        })
        .collect()
}

/// RMS of centered, zero-padded frames.
fn frame_rms(samples: &[f32], frame: usize, hop: usize) -> Vec<f64> {
    if samples.is_empty() {
        return Vec::new();
    }
    let pad = frame / 2;
    let num_frames = 1 + samples.len() / hop;
    (0..num_frames)
        .map(|i| {
            // Frame i covers [i*hop - pad, i*hop - pad + frame) of the signal.
            let begin = (i * hop).saturating_sub(pad);
            let end = (i * hop + frame - pad).min(samples.len());
            let energy: f64 = samples[begin.min(end)..end]
                .iter()
                .map(|s| (*s as f64) * (*s as f64))
                .sum();
            (energy / frame as f64).sqrt()
        })
        .collect()
}

fn spectral_flatness(power: &[f32]) -> f64 {
    if power.is_empty() {
        return 1.0;
    }
    let n = power.len() as f64;
    let log_sum: f64 = power.iter().map(|p| (*p as f64).max(AMIN).ln()).sum();
    let arith: f64 = power.iter().map(|p| (*p as f64).max(AMIN)).sum::<f64>() / n;
    (log_sum / n).exp() / arith
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn std_dev(values: &[f64], mean: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    var.sqrt()
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}
