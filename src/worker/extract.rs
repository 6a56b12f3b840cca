//! Head/tail audio extraction through ffmpeg, cached on disk.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

use crate::config::ExtractionConfig;
use crate::sources::DirectVideo;

#[derive(Debug, Error)]
enum ExtractError {
    #[error("failed to spawn {0}: {1}")]
    Spawn(String, std::io::Error),

    #[error("timed out after {0}s")]
    Timeout(u64),

    #[error("exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("produced an empty file")]
    Empty,
}

/// Clips extracted for one episode. `tail_offset` is the second of the
/// episode where the tail clip starts (0 when there is no tail).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EpisodeAudio {
    pub head: Option<PathBuf>,
    pub tail: Option<PathBuf>,
    pub tail_offset: f64,
}

/// Cache file name for a clip: `{sha256(url)[..16]}_{start}_{duration}.wav`.
pub fn cache_key(url: &str, start_sec: f64, duration_sec: f64) -> String {
    let digest = format!("{:x}", Sha256::digest(url.as_bytes()));
    format!(
        "{}_{}_{}.wav",
        &digest[..16],
        start_sec as i64,
        duration_sec as i64
    )
}

fn parse_duration(stdout: &[u8]) -> Option<f64> {
    String::from_utf8_lossy(stdout)
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|d| d.is_finite() && *d > 0.0)
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let count = text.chars().count();
    text.chars().skip(count.saturating_sub(300)).collect()
}

fn non_empty(path: &Path) -> bool {
    std::fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false)
}

pub struct AudioExtractor {
    config: ExtractionConfig,
    cache_dir: PathBuf,
}

impl AudioExtractor {
    pub fn new(config: ExtractionConfig, cache_dir: PathBuf) -> Self {
        Self { config, cache_dir }
    }

    pub fn cache_path(&self, url: &str, start_sec: f64, duration_sec: f64) -> PathBuf {
        self.cache_dir.join(cache_key(url, start_sec, duration_sec))
    }

    /// Protocol-level request options shared by ffmpeg and ffprobe. Referer
    /// and user agent apply to every HTTP request, including HLS segments.
    fn input_options(&self, video: &DirectVideo) -> Vec<String> {
        let mut args = vec!["-user_agent".to_string(), self.config.user_agent.clone()];
        if let Some(referer) = &video.referer {
            args.push("-referer".to_string());
            args.push(referer.clone());
        }
        if !video.headers.is_empty() {
            let headers: String = video
                .headers
                .iter()
                .map(|(k, v)| format!("{}: {}\r\n", k, v))
                .collect();
            args.push("-headers".to_string());
            args.push(headers);
        }
        args
    }

    /// Head clip plus, when the episode is long enough, a tail clip ending
    /// at `episode_duration`.
    pub async fn extract_episode_audio(
        &self,
        video: &DirectVideo,
        episode_duration: Option<f64>,
    ) -> EpisodeAudio {
        let head = self
            .extract_audio_segment(video, 0.0, self.config.head_secs)
            .await;

        let mut audio = EpisodeAudio {
            head,
            ..Default::default()
        };

        if let Some(duration) = episode_duration {
            if duration > self.config.head_secs + self.config.tail_secs {
                audio.tail_offset = duration - self.config.tail_secs;
                audio.tail = self
                    .extract_audio_segment(video, audio.tail_offset, self.config.tail_secs)
                    .await;
            }
        }

        audio
    }

    /// Extract one mono WAV clip, reusing a cached non-empty file. Any
    /// failure is logged, partial output removed, and `None` returned.
    pub async fn extract_audio_segment(
        &self,
        video: &DirectVideo,
        start_sec: f64,
        duration_sec: f64,
    ) -> Option<PathBuf> {
        let output = self.cache_path(&video.url, start_sec, duration_sec);
        if non_empty(&output) {
            log::debug!("Using cached audio {:?}", output);
            return Some(output);
        }

        if let Err(e) = tokio::fs::create_dir_all(&self.cache_dir).await {
            log::error!("Failed to create audio cache dir {:?}: {}", self.cache_dir, e);
            return None;
        }

        match self.run_ffmpeg(video, start_sec, duration_sec, &output).await {
            Ok(()) => {
                log::info!(
                    "Extracted audio: {:?}",
                    output.file_name().unwrap_or_default()
                );
                Some(output)
            }
            Err(e) => {
                log::warn!("ffmpeg extraction at {}s failed: {}", start_sec, e);
                let _ = tokio::fs::remove_file(&output).await;
                None
            }
        }
    }

    async fn run_ffmpeg(
        &self,
        video: &DirectVideo,
        start_sec: f64,
        duration_sec: f64,
        output: &Path,
    ) -> Result<(), ExtractError> {
        let ffmpeg = self.config.ffmpeg_path.to_string_lossy().to_string();
        let start = start_sec.to_string();
        let length = duration_sec.to_string();
        let rate = self.config.sample_rate.to_string();

        let mut cmd = Command::new(&self.config.ffmpeg_path);
        cmd.arg("-y")
            .args(self.input_options(video))
            .args(["-i", video.url.as_str()])
            // -ss after -i: slower but reliable for HLS
            .args(["-ss", start.as_str(), "-t", length.as_str()])
            .args(["-vn", "-ac", "1", "-ar", rate.as_str(), "-f", "wav"])
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let timeout = self.config.extract_timeout_secs;
        let result = tokio::time::timeout(Duration::from_secs(timeout), cmd.output())
            .await
            .map_err(|_| ExtractError::Timeout(timeout))?
            .map_err(|e| ExtractError::Spawn(ffmpeg, e))?;

        if !result.status.success() {
            return Err(ExtractError::Failed {
                status: result.status.to_string(),
                stderr: stderr_tail(&result.stderr),
            });
        }
        if !non_empty(output) {
            return Err(ExtractError::Empty);
        }
        Ok(())
    }

    /// Total duration in seconds via ffprobe, or `None` on any failure.
    pub async fn get_video_duration(&self, video: &DirectVideo) -> Option<f64> {
        let mut cmd = Command::new(&self.config.ffprobe_path);
        cmd.args(["-v", "error"])
            .args(self.input_options(video))
            .args([
                "-show_entries",
                "format=duration",
                "-of",
                "default=noprint_wrappers=1:nokey=1",
            ])
            .arg(&video.url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let timeout = Duration::from_secs(self.config.probe_timeout_secs);
        match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(Ok(output)) if output.status.success() => parse_duration(&output.stdout),
            Ok(Ok(output)) => {
                log::debug!("ffprobe exited with {}", output.status);
                None
            }
            Ok(Err(e)) => {
                log::warn!("Failed to spawn ffprobe: {}", e);
                None
            }
            Err(_) => {
                log::warn!("ffprobe timed out after {:?}", timeout);
                None
            }
        }
    }
}
