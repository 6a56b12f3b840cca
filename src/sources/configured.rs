use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;

use super::{DirectVideo, EpisodeRef, EpisodeSource, VideoLink};
use crate::config::{EpisodeEntry, SourceCatalog};

/// Source backed by a catalogue from the configuration file.
pub struct ConfiguredSource {
    id: String,
    series: HashMap<String, Vec<EpisodeRef>>,
    episodes: HashMap<String, EpisodeEntry>,
}

impl ConfiguredSource {
    pub fn from_catalog(catalog: &SourceCatalog) -> Self {
        let mut series = HashMap::new();
        let mut episodes = HashMap::new();
        for entry in &catalog.series {
            let mut refs: Vec<EpisodeRef> = entry
                .episodes
                .iter()
                .map(|ep| EpisodeRef {
                    id: ep.id.clone(),
                    number: ep.number,
                })
                .collect();
            refs.sort_by_key(|r| r.number);
            series.insert(entry.id.clone(), refs);

            for ep in &entry.episodes {
                episodes.insert(ep.id.clone(), ep.clone());
            }
        }
        Self {
            id: catalog.id.clone(),
            series,
            episodes,
        }
    }
}

#[async_trait]
impl EpisodeSource for ConfiguredSource {
    fn id(&self) -> &str {
        &self.id
    }

    async fn list_episodes(&self, series_id: &str) -> Result<Vec<EpisodeRef>> {
        self.series
            .get(series_id)
            .cloned()
            .ok_or_else(|| anyhow!("series '{}' not found in source '{}'", series_id, self.id))
    }

    async fn resolve_video(&self, episode_id: &str) -> Result<VideoLink> {
        let entry = self
            .episodes
            .get(episode_id)
            .ok_or_else(|| anyhow!("episode '{}' not found in source '{}'", episode_id, self.id))?;

        match (&entry.url, entry.embed_only) {
            (Some(url), false) => Ok(VideoLink::Direct(DirectVideo {
                url: url.clone(),
                referer: entry.referer.clone(),
                headers: entry.headers.clone(),
            })),
            _ => Ok(VideoLink::EmbedOnly),
        }
    }
}
