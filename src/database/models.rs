use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentType {
    Opening,
    Ending,
}

impl SegmentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Opening => "opening",
            Self::Ending => "ending",
        }
    }
}

impl std::fmt::Display for SegmentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SegmentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "opening" => Ok(Self::Opening),
            "ending" => Ok(Self::Ending),
            other => Err(format!("segment_type must be 'opening' or 'ending', got '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    Heuristic,
    Model,
    Manual,
}

impl Default for DetectionMethod {
    fn default() -> Self {
        Self::Heuristic
    }
}

impl std::fmt::Display for DetectionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Heuristic => write!(f, "heuristic"),
            Self::Model => write!(f, "model"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

impl From<String> for DetectionMethod {
    fn from(s: String) -> Self {
        match s.as_str() {
            "model" => Self::Model,
            "manual" => Self::Manual,
            _ => Self::Heuristic,
        }
    }
}

/// Start/end/confidence of a detected or corrected segment, in seconds
/// relative to the start of the episode.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SegmentTimes {
    pub start: f64,
    pub end: f64,
    pub confidence: f64,
}

/// One persisted skip segment, unique per
/// (series_id, source_id, episode_number, segment_type).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkipSegment {
    pub series_id: String,
    pub source_id: String,
    pub episode_number: i64,
    pub segment_type: SegmentType,
    pub start_sec: f64,
    pub end_sec: f64,
    pub confidence: f64,
    pub detection_method: DetectionMethod,
    #[serde(default)]
    pub created_at: Option<String>,
}

/// The opening/ending pair stored for one episode. At least one side is set
/// whenever the store returns a value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EpisodeSegments {
    pub opening: Option<SkipSegment>,
    pub ending: Option<SkipSegment>,
}

impl EpisodeSegments {
    pub fn is_empty(&self) -> bool {
        self.opening.is_none() && self.ending.is_none()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SegmentStoreStats {
    pub total: i64,
    pub heuristic: i64,
    pub model: i64,
    pub manual: i64,
}
