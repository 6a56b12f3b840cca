//! Audio clips, log-mel spectrograms and classifier windows.

use anyhow::{anyhow, Context, Result};
use ndarray::{s, Array2, ArrayView2};
use realfft::{RealFftPlanner, RealToComplex};
use std::path::Path;
use std::sync::Arc;

pub const N_FFT: usize = 2048;
pub const HOP_LENGTH: usize = 512;
pub const N_MELS: usize = 128;
/// Length and stride of the classifier windows, in seconds.
pub const WINDOW_SECS: f64 = 10.0;
pub const WINDOW_STRIDE_SECS: f64 = 5.0;

const TOP_DB: f32 = 80.0;
const AMIN: f32 = 1e-10;

/// A decoded mono waveform.
#[derive(Debug, Clone)]
pub struct AudioClip {
    samples: Vec<f32>,
    sample_rate: u32,
}

impl AudioClip {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Read a WAV file, downmixing to mono.
    pub fn load_wav(path: &Path) -> Result<Self> {
        let mut reader =
            hound::WavReader::open(path).with_context(|| format!("opening {:?}", path))?;
        let spec = reader.spec();

        let interleaved: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .samples::<f32>()
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| anyhow!("Failed to read float samples: {e}"))?,
            hound::SampleFormat::Int => {
                let scale = (1_i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|s| s as f32 / scale))
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(|e| anyhow!("Failed to read int samples: {e}"))?
            }
        };

        let channels = spec.channels.max(1) as usize;
        let samples = if channels > 1 {
            interleaved
                .chunks(channels)
                .map(|chunk| chunk.iter().sum::<f32>() / channels as f32)
                .collect()
        } else {
            interleaved
        };

        Ok(Self::new(samples, spec.sample_rate))
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn duration(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Samples covering `[start, start + len)` seconds, clipped to the clip.
    pub fn slice_secs(&self, start: f64, len: f64) -> &[f32] {
        let sr = self.sample_rate as f64;
        let from = ((start * sr).round() as usize).min(self.samples.len());
        let to = (((start + len) * sr).round() as usize).clamp(from, self.samples.len());
        &self.samples[from..to]
    }
}

/// Short-time Fourier transform producing power spectra.
///
/// Frames are centered: the signal is zero-padded by `n_fft / 2` on both
/// sides, so a signal of `L` samples yields `1 + L / hop` frames.
pub struct Stft {
    fft: Arc<dyn RealToComplex<f32>>,
    window: Vec<f32>,
    n_fft: usize,
    hop: usize,
}

impl Stft {
    pub fn new(n_fft: usize, hop: usize) -> Self {
        let mut planner = RealFftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(n_fft);

        // Periodic Hann window
        let window = (0..n_fft)
            .map(|i| {
                let phase = 2.0 * std::f32::consts::PI * i as f32 / n_fft as f32;
                0.5 * (1.0 - phase.cos())
            })
            .collect();

        Self {
            fft,
            window,
            n_fft,
            hop,
        }
    }

    pub fn num_frames(&self, num_samples: usize) -> usize {
        if num_samples == 0 {
            0
        } else {
            1 + num_samples / self.hop
        }
    }

    /// Power spectrogram as `frames x bins`.
    pub fn power(&self, signal: &[f32]) -> Result<Vec<Vec<f32>>> {
        let num_frames = self.num_frames(signal.len());
        let pad = self.n_fft / 2;
        let mut padded = vec![0.0f32; signal.len() + 2 * pad];
        padded[pad..pad + signal.len()].copy_from_slice(signal);

        let mut scratch = self.fft.make_scratch_vec();
        let mut frame_buf = self.fft.make_input_vec();
        let mut spectrum = self.fft.make_output_vec();
        let mut frames = Vec::with_capacity(num_frames);

        for frame_idx in 0..num_frames {
            let start = frame_idx * self.hop;
            for (i, slot) in frame_buf.iter_mut().enumerate() {
                *slot = padded[start + i] * self.window[i];
            }

            self.fft
                .process_with_scratch(&mut frame_buf, &mut spectrum, &mut scratch)
                .map_err(|e| anyhow!("FFT failed: {:?}", e))?;

            frames.push(spectrum.iter().map(|c| c.norm_sqr()).collect());
        }

        Ok(frames)
    }
}

fn hz_to_mel(hz: f64) -> f64 {
    const F_SP: f64 = 200.0 / 3.0;
    const MIN_LOG_HZ: f64 = 1000.0;
    let min_log_mel = MIN_LOG_HZ / F_SP;
    let logstep = 6.4f64.ln() / 27.0;
    if hz >= MIN_LOG_HZ {
        min_log_mel + (hz / MIN_LOG_HZ).ln() / logstep
    } else {
        hz / F_SP
    }
}

fn mel_to_hz(mel: f64) -> f64 {
    const F_SP: f64 = 200.0 / 3.0;
    const MIN_LOG_HZ: f64 = 1000.0;
    let min_log_mel = MIN_LOG_HZ / F_SP;
    let logstep = 6.4f64.ln() / 27.0;
    if mel >= min_log_mel {
        MIN_LOG_HZ * (logstep * (mel - min_log_mel)).exp()
    } else {
        F_SP * mel
    }
}

struct MelBand {
    start: usize,
    weights: Vec<f32>,
}

/// Slaney-style triangular mel filterbank (area-normalized), 0 Hz to
/// Nyquist. Each band only stores its non-zero span.
pub struct MelFilterBank {
    bands: Vec<MelBand>,
}

impl MelFilterBank {
    pub fn new(sample_rate: u32, n_fft: usize, n_mels: usize) -> Self {
        let n_bins = n_fft / 2 + 1;
        let sr = sample_rate as f64;
        let fft_freqs: Vec<f64> = (0..n_bins).map(|k| k as f64 * sr / n_fft as f64).collect();

        let mel_max = hz_to_mel(sr / 2.0);
        let mel_points: Vec<f64> = (0..n_mels + 2)
            .map(|i| mel_to_hz(mel_max * i as f64 / (n_mels + 1) as f64))
            .collect();

        let bands = (0..n_mels)
            .map(|m| {
                let (lo, center, hi) = (mel_points[m], mel_points[m + 1], mel_points[m + 2]);
                let enorm = 2.0 / (hi - lo);
                let dense: Vec<f64> = fft_freqs
                    .iter()
                    .map(|&f| {
                        let lower = (f - lo) / (center - lo);
                        let upper = (hi - f) / (hi - center);
                        lower.min(upper).max(0.0) * enorm
                    })
                    .collect();

                match dense.iter().position(|&w| w > 0.0) {
                    Some(start) => {
                        let end = dense.iter().rposition(|&w| w > 0.0).unwrap_or(start);
                        MelBand {
                            start,
                            weights: dense[start..=end].iter().map(|&w| w as f32).collect(),
                        }
                    }
                    None => MelBand {
                        start: 0,
                        weights: Vec::new(),
                    },
                }
            })
            .collect();

        Self { bands }
    }

    pub fn n_mels(&self) -> usize {
        self.bands.len()
    }

    /// Bin range `[start, end)` covered by a band.
    pub fn band_span(&self, band: usize) -> (usize, usize) {
        let b = &self.bands[band];
        (b.start, b.start + b.weights.len())
    }

    pub fn apply(&self, power_frame: &[f32], out: &mut [f32]) {
        for (slot, band) in out.iter_mut().zip(&self.bands) {
            *slot = band
                .weights
                .iter()
                .zip(&power_frame[band.start..])
                .map(|(w, p)| w * p)
                .sum();
        }
    }
}

/// Convert a power spectrogram to dB in place, referenced to its maximum and
/// floored `TOP_DB` below it.
pub fn power_to_db(values: &mut Array2<f32>) {
    let reference = values.iter().cloned().fold(AMIN, f32::max);
    let ref_db = 10.0 * reference.log10();
    values.mapv_inplace(|v| (10.0 * v.max(AMIN).log10() - ref_db).max(-TOP_DB));
}

/// Turns audio clips into log-mel spectrograms at a fixed sample rate.
pub struct MelExtractor {
    sample_rate: u32,
    stft: Stft,
    filters: MelFilterBank,
}

impl MelExtractor {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            stft: Stft::new(N_FFT, HOP_LENGTH),
            filters: MelFilterBank::new(sample_rate, N_FFT, N_MELS),
        }
    }

    pub fn filters(&self) -> &MelFilterBank {
        &self.filters
    }

    /// Mel power spectrogram (`mels x frames`) of raw samples.
    pub fn mel_power(&self, samples: &[f32]) -> Result<Array2<f32>> {
        let frames = self.stft.power(samples)?;
        self.mel_power_from_frames(&frames)
    }

    pub fn mel_power_from_frames(&self, frames: &[Vec<f32>]) -> Result<Array2<f32>> {
        let n_mels = self.filters.n_mels();
        let mut mel = Array2::<f32>::zeros((n_mels, frames.len()));
        let mut column = vec![0.0f32; n_mels];
        for (t, frame) in frames.iter().enumerate() {
            self.filters.apply(frame, &mut column);
            for (m, v) in column.iter().enumerate() {
                mel[[m, t]] = *v;
            }
        }
        Ok(mel)
    }

    pub fn audio_to_mel_spectrogram(&self, clip: &AudioClip) -> Result<MelSpectrogram> {
        if clip.sample_rate() != self.sample_rate {
            return Err(anyhow!(
                "clip sample rate {} does not match extractor rate {}",
                clip.sample_rate(),
                self.sample_rate
            ));
        }
        let mut data = self.mel_power(clip.samples())?;
        power_to_db(&mut data);
        Ok(MelSpectrogram::from_parts(
            data,
            self.sample_rate,
            HOP_LENGTH,
            clip.duration(),
        ))
    }
}

/// A log-mel spectrogram (`mels x frames`, dB in `[-80, 0]`) with the timing
/// needed to slice it into windows.
#[derive(Debug, Clone)]
pub struct MelSpectrogram {
    data: Array2<f32>,
    sample_rate: u32,
    hop: usize,
    duration: f64,
}

impl MelSpectrogram {
    pub fn from_parts(data: Array2<f32>, sample_rate: u32, hop: usize, duration: f64) -> Self {
        Self {
            data,
            sample_rate,
            hop,
            duration,
        }
    }

    pub fn data(&self) -> &Array2<f32> {
        &self.data
    }

    pub fn n_mels(&self) -> usize {
        self.data.nrows()
    }

    pub fn n_frames(&self) -> usize {
        self.data.ncols()
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }

    pub fn frames_per_window(&self) -> usize {
        (WINDOW_SECS * self.sample_rate as f64 / self.hop as f64).floor() as usize
    }

    fn frame_at(&self, seconds: f64) -> usize {
        (seconds * self.sample_rate as f64 / self.hop as f64).floor() as usize
    }

    pub fn windows(&self) -> Windows<'_> {
        spectrogram_to_windows(self)
    }
}

/// Number of 10 s windows with 5 s stride that fit in `duration` seconds.
pub fn window_count(duration: f64) -> usize {
    if duration < WINDOW_SECS {
        return 0;
    }
    ((duration - WINDOW_SECS) / WINDOW_STRIDE_SECS).floor() as usize + 1
}

/// One classifier window: the k-th window starts at exactly `5k` seconds.
#[derive(Debug, Clone)]
pub struct SpectrogramWindow<'a> {
    pub index: usize,
    pub start_sec: f64,
    pub data: ArrayView2<'a, f32>,
}

impl SpectrogramWindow<'_> {
    pub fn end_sec(&self) -> f64 {
        self.start_sec + WINDOW_SECS
    }
}

/// Lazy sequence of windows over a spectrogram. Clone it (or call
/// `MelSpectrogram::windows` again) to restart.
#[derive(Debug, Clone)]
pub struct Windows<'a> {
    spectrogram: &'a MelSpectrogram,
    next: usize,
    count: usize,
    frames: usize,
}

pub fn spectrogram_to_windows(spectrogram: &MelSpectrogram) -> Windows<'_> {
    Windows {
        spectrogram,
        next: 0,
        count: window_count(spectrogram.duration()),
        frames: spectrogram.frames_per_window(),
    }
}

impl<'a> Iterator for Windows<'a> {
    type Item = SpectrogramWindow<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.count {
            return None;
        }
        let index = self.next;
        let start_sec = index as f64 * WINDOW_STRIDE_SECS;
        let start = self.spectrogram.frame_at(start_sec);
        let end = start + self.frames;
        if end > self.spectrogram.n_frames() {
            self.next = self.count;
            return None;
        }
        self.next += 1;
        Some(SpectrogramWindow {
            index,
            start_sec,
            data: self.spectrogram.data.slice(s![.., start..end]),
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.count - self.next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SR: u32 = 22_050;

    fn sine(freq: f32, seconds: f32) -> AudioClip {
        let n = (seconds * SR as f32) as usize;
        let samples = (0..n)
            .map(|i| 0.5 * (2.0 * std::f32::consts::PI * freq * i as f32 / SR as f32).sin())
            .collect();
        AudioClip::new(samples, SR)
    }

    fn blank_spectrogram(duration: f64) -> MelSpectrogram {
        let samples = (duration * SR as f64) as usize;
        let frames = samples / HOP_LENGTH + 1;
        MelSpectrogram::from_parts(Array2::zeros((N_MELS, frames)), SR, HOP_LENGTH, duration)
    }

    #[test]
    fn window_count_formula() {
        assert_eq!(window_count(0.0), 0);
        assert_eq!(window_count(9.9), 0);
        assert_eq!(window_count(10.0), 1);
        assert_eq!(window_count(14.9), 1);
        assert_eq!(window_count(15.0), 2);
        assert_eq!(window_count(300.0), 59);
    }

    #[test]
    fn windows_cover_clip_with_fixed_shape() {
        let spec = blank_spectrogram(300.0);
        let windows: Vec<_> = spec.windows().collect();
        assert_eq!(windows.len(), 59);
        assert_eq!(spec.frames_per_window(), 430);
        for (k, w) in windows.iter().enumerate() {
            assert_eq!(w.index, k);
            assert_eq!(w.start_sec, 5.0 * k as f64);
            assert_eq!(w.data.dim(), (N_MELS, 430));
        }
        assert_eq!(windows.last().unwrap().end_sec(), 300.0);
    }

    #[test]
    fn windows_are_restartable_and_drop_partial_tail() {
        let spec = blank_spectrogram(27.0);
        let first: Vec<f64> = spec.windows().map(|w| w.start_sec).collect();
        let second: Vec<f64> = spec.windows().map(|w| w.start_sec).collect();
        assert_eq!(first, vec![0.0, 5.0, 10.0, 15.0]);
        assert_eq!(first, second);

        let short = blank_spectrogram(8.0);
        assert_eq!(short.windows().count(), 0);
    }

    #[test]
    fn stft_frame_count_is_centered() {
        let stft = Stft::new(N_FFT, HOP_LENGTH);
        let frames = stft.power(&vec![0.1; 5000]).unwrap();
        assert_eq!(frames.len(), 1 + 5000 / HOP_LENGTH);
        assert_eq!(frames[0].len(), N_FFT / 2 + 1);
        assert!(stft.power(&[]).unwrap().is_empty());
    }

    #[test]
    fn mel_scale_round_trips() {
        for hz in [0.0, 440.0, 1000.0, 4000.0, 11025.0] {
            assert!((mel_to_hz(hz_to_mel(hz)) - hz).abs() < 1e-6);
        }
    }

    #[test]
    fn sine_energy_lands_in_matching_mel_band() {
        let extractor = MelExtractor::new(SR);
        let clip = sine(1000.0, 12.0);
        let spec = extractor.audio_to_mel_spectrogram(&clip).unwrap();

        assert_eq!(spec.n_mels(), N_MELS);
        assert_eq!(spec.n_frames(), 1 + clip.samples().len() / HOP_LENGTH);
        assert!(spec.data().iter().all(|v| *v <= 0.0 && *v >= -80.0));

        let mid = spec.n_frames() / 2;
        let column = spec.data().column(mid);
        let (loudest, _) = column
            .iter()
            .enumerate()
            .fold((0, f32::MIN), |best, (i, v)| if *v > best.1 { (i, *v) } else { best });

        let bin = (1000.0 * N_FFT as f32 / SR as f32).round() as usize;
        let (start, end) = extractor.filters().band_span(loudest);
        assert!(start <= bin + 1 && bin < end + 1, "band {} spans {}..{}", loudest, start, end);
    }

    #[test]
    fn mismatched_sample_rate_is_rejected() {
        let extractor = MelExtractor::new(SR);
        let clip = AudioClip::new(vec![0.0; 16_000], 16_000);
        assert!(extractor.audio_to_mel_spectrogram(&clip).is_err());
    }

    #[test]
    fn wav_round_trip_downmixes_stereo() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("stereo.wav");
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: SR,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for _ in 0..100 {
            writer.write_sample(16384i16).unwrap();
            writer.write_sample(0i16).unwrap();
        }
        writer.finalize().unwrap();

        let clip = AudioClip::load_wav(&path).unwrap();
        assert_eq!(clip.samples().len(), 100);
        assert!((clip.samples()[0] - 0.25).abs() < 1e-4);
        assert_eq!(clip.sample_rate(), SR);
    }
}
