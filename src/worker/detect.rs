//! CPU-bound part of an analysis: spectrograms, classifier first, heuristic
//! fallback, and training samples from whatever was found.

use anyhow::Result;
use std::path::Path;

use super::extract::EpisodeAudio;
use crate::database::{DetectionMethod, SegmentTimes};
use crate::ml::corpus::{build_training_samples, TrainingSample};
use crate::ml::{AudioClip, MelExtractor, MelSpectrogram, MusicDetector, SegmentClass, SkipSegmentDetector};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FoundSegment {
    pub times: SegmentTimes,
    pub method: DetectionMethod,
}

#[derive(Debug, Default)]
pub struct EpisodeDetection {
    pub opening: Option<FoundSegment>,
    pub ending: Option<FoundSegment>,
    pub samples: Vec<TrainingSample>,
}

impl EpisodeDetection {
    pub fn is_empty(&self) -> bool {
        self.opening.is_none() && self.ending.is_none()
    }
}

struct LoadedClip {
    clip: AudioClip,
    spectrogram: MelSpectrogram,
}

pub struct DetectionEngine {
    mel: MelExtractor,
    music: MusicDetector,
    classifier: SkipSegmentDetector,
}

impl DetectionEngine {
    pub fn new(mel: MelExtractor, music: MusicDetector, classifier: SkipSegmentDetector) -> Self {
        Self {
            mel,
            music,
            classifier,
        }
    }

    pub fn classifier(&self) -> &SkipSegmentDetector {
        &self.classifier
    }

    fn load(&self, path: Option<&Path>) -> Option<LoadedClip> {
        let path = path?;
        let loaded = AudioClip::load_wav(path).and_then(|clip| {
            let spectrogram = self.mel.audio_to_mel_spectrogram(&clip)?;
            Ok(LoadedClip { clip, spectrogram })
        });
        match loaded {
            Ok(loaded) => Some(loaded),
            Err(e) => {
                log::warn!("Unusable audio clip {:?}: {:#}", path, e);
                None
            }
        }
    }

    pub fn detect_episode(&self, audio: &EpisodeAudio) -> Result<EpisodeDetection> {
        let head = self.load(audio.head.as_deref());
        let tail = self.load(audio.tail.as_deref());

        let mut detection = EpisodeDetection::default();

        if self.classifier.is_available() {
            let outcome = self.classifier.detect(
                head.as_ref().map(|h| &h.spectrogram),
                tail.as_ref().map(|t| &t.spectrogram),
                audio.tail_offset,
            )?;
            detection.opening = outcome.opening.map(|times| FoundSegment {
                times,
                method: DetectionMethod::Model,
            });
            detection.ending = outcome.ending.map(|times| FoundSegment {
                times,
                method: DetectionMethod::Model,
            });
        }

        if detection.opening.is_none() {
            if let Some(head) = &head {
                detection.opening = self.heuristic(&head.clip, 0.0)?;
            }
        }
        if detection.ending.is_none() {
            if let Some(tail) = &tail {
                detection.ending = self.heuristic(&tail.clip, audio.tail_offset)?;
            }
        }

        if let (Some(op), Some(head)) = (&detection.opening, &head) {
            detection.samples.extend(build_training_samples(
                &head.spectrogram,
                op.times.start,
                op.times.end,
                SegmentClass::Opening,
            ));
        }
        if let (Some(ed), Some(tail)) = (&detection.ending, &tail) {
            // Tail sample times are relative to the clip, not the episode
            detection.samples.extend(build_training_samples(
                &tail.spectrogram,
                ed.times.start - audio.tail_offset,
                ed.times.end - audio.tail_offset,
                SegmentClass::Ending,
            ));
        }

        Ok(detection)
    }

    fn heuristic(&self, clip: &AudioClip, time_offset: f64) -> Result<Option<FoundSegment>> {
        let best = self.music.detect_music_segments(clip, time_offset)?.into_iter().next();
        if let Some(times) = best {
            log::info!(
                "Heuristic found segment {:.1}-{:.1}s (confidence {:.3})",
                times.start,
                times.end,
                times.confidence
            );
        }
        Ok(best.map(|times| FoundSegment {
            times,
            method: DetectionMethod::Heuristic,
        }))
    }
}
