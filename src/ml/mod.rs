pub mod corpus;
pub mod features;
pub mod inference;
pub mod model;
pub mod music;
pub mod training;

#[cfg(test)]
pub(crate) mod testing;

use serde::{Deserialize, Serialize};

pub use corpus::TrainingCorpus;
pub use features::{AudioClip, MelExtractor, MelSpectrogram};
pub use inference::{DetectionOutcome, SkipSegmentDetector};
pub use music::MusicDetector;
pub use training::{Trainer, TrainingReport};

/// Output classes of the classifier. The discriminants are the label values
/// stored in the corpus and the logit indices of the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentClass {
    Opening = 0,
    Ending = 1,
    Content = 2,
}

impl SegmentClass {
    pub const COUNT: usize = 3;
    pub const ALL: [SegmentClass; 3] = [Self::Opening, Self::Ending, Self::Content];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: u32) -> Option<Self> {
        match index {
            0 => Some(Self::Opening),
            1 => Some(Self::Ending),
            2 => Some(Self::Content),
            _ => None,
        }
    }
}

/// Per-class sample counts, indexed by `SegmentClass::index`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassCounts {
    pub opening: usize,
    pub ending: usize,
    pub content: usize,
}

impl ClassCounts {
    pub fn from_labels<'a>(labels: impl IntoIterator<Item = &'a u32>) -> Self {
        let mut counts = Self::default();
        for label in labels {
            counts.add(*label, 1);
        }
        counts
    }

    pub fn add(&mut self, label: u32, n: usize) {
        match SegmentClass::from_index(label) {
            Some(SegmentClass::Opening) => self.opening += n,
            Some(SegmentClass::Ending) => self.ending += n,
            Some(SegmentClass::Content) => self.content += n,
            None => {}
        }
    }

    pub fn total(&self) -> usize {
        self.opening + self.ending + self.content
    }
}
