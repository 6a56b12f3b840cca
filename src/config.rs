//! Runtime configuration, loaded from YAML.
//!
//! Every field has a default so an empty (or missing) file yields a working
//! setup rooted at `dirs::data_dir()/skipseg`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const CONFIG_ENV_KEY: &str = "SKIPSEG_CONFIG";
const CHECKPOINT_FILE: &str = "skip_segment_cnn.safetensors";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_dir: PathBuf,
    pub extraction: ExtractionConfig,
    pub heuristic: HeuristicConfig,
    pub inference: InferenceConfig,
    pub training: TrainingConfig,
    pub analysis: AnalysisConfig,
    pub sources: Vec<SourceCatalog>,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("skipseg");
        Self {
            data_dir,
            extraction: ExtractionConfig::default(),
            heuristic: HeuristicConfig::default(),
            inference: InferenceConfig::default(),
            training: TrainingConfig::default(),
            analysis: AnalysisConfig::default(),
            sources: Vec::new(),
        }
    }
}

impl Config {
    /// Load from a YAML file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::info!("No config at {:?}, using defaults", path);
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {:?}", path))?;
        Self::from_yaml(&content).with_context(|| format!("parsing config {:?}", path))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Resolve the config path from `SKIPSEG_CONFIG` (process env first, then
    /// a `.env` file in `project_dir`), falling back to `<data_dir>/config.yaml`.
    pub fn resolve_path(project_dir: &Path) -> PathBuf {
        std::env::var(CONFIG_ENV_KEY)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .or_else(|| crate::load_env_value(project_dir, CONFIG_ENV_KEY))
            .map(PathBuf::from)
            .unwrap_or_else(|| Self::default().data_dir.join("config.yaml"))
    }

    pub fn audio_dir(&self) -> PathBuf {
        self.data_dir.join("audio")
    }

    pub fn features_dir(&self) -> PathBuf {
        self.data_dir.join("features")
    }

    pub fn models_dir(&self) -> PathBuf {
        self.data_dir.join("models")
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.models_dir().join(CHECKPOINT_FILE)
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("skipseg.db")
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [self.audio_dir(), self.features_dir(), self.models_dir()] {
            std::fs::create_dir_all(&dir).with_context(|| format!("creating {:?}", dir))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
    pub sample_rate: u32,
    pub head_secs: f64,
    pub tail_secs: f64,
    pub extract_timeout_secs: u64,
    pub probe_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffprobe_path: PathBuf::from("ffprobe"),
            sample_rate: 22_050,
            head_secs: 300.0,
            tail_secs: 300.0,
            extract_timeout_secs: 180,
            probe_timeout_secs: 30,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 Chrome/131.0.0.0 Safari/537.36".to_string(),
        }
    }
}

/// Parameters of the zero-training music detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeuristicConfig {
    pub window_secs: f64,
    pub hop_secs: f64,
    /// Percentile (0-100) of the clip's window scores used as threshold.
    pub percentile: f64,
    pub min_threshold: f64,
    pub gap_tolerance_secs: f64,
    pub min_duration_secs: f64,
    pub max_duration_secs: f64,
    /// Mean window score that maps to confidence 1.0.
    pub confidence_scale: f64,
}

impl Default for HeuristicConfig {
    fn default() -> Self {
        Self {
            window_secs: 5.0,
            hop_secs: 2.5,
            percentile: 60.0,
            min_threshold: 0.35,
            gap_tolerance_secs: 5.0,
            min_duration_secs: 30.0,
            max_duration_secs: 120.0,
            confidence_scale: 0.8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub confidence_threshold: f32,
    pub min_consecutive_windows: usize,
    pub batch_size: usize,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.7,
            min_consecutive_windows: 3,
            batch_size: 32,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub min_samples: usize,
    pub max_samples: usize,
    /// Retrain after every N successful analyses.
    pub retrain_every: u64,
    pub plateau_patience: usize,
    pub plateau_factor: f64,
    /// Loss weights for opening, ending, content.
    pub class_weights: [f32; 3],
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 10,
            batch_size: 32,
            learning_rate: 1e-3,
            min_samples: 50,
            max_samples: 3000,
            retrain_every: 20,
            plateau_patience: 5,
            plateau_factor: 0.5,
            class_weights: [2.0, 2.0, 1.0],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub random_batch_size: usize,
    pub inter_episode_delay_secs: f64,
    pub error_log_size: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            random_batch_size: 10,
            inter_episode_delay_secs: 5.0,
            error_log_size: 100,
        }
    }
}

/// A source catalogue declared in configuration: series and their episodes
/// with already-resolved video links.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceCatalog {
    pub id: String,
    #[serde(default)]
    pub series: Vec<SeriesCatalog>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeriesCatalog {
    pub id: String,
    #[serde(default)]
    pub episodes: Vec<EpisodeEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodeEntry {
    pub id: String,
    pub number: i64,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub referer: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub embed_only: bool,
}
