//! Episode source collaborators: list a series' episodes and resolve an
//! episode to a playable video link.

pub mod configured;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::config::SourceCatalog;

pub use configured::ConfiguredSource;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpisodeRef {
    pub id: String,
    pub number: i64,
}

/// A direct, decodable video URL plus the request metadata the host needs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectVideo {
    pub url: String,
    pub referer: Option<String>,
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoLink {
    Direct(DirectVideo),
    /// Only an embedded player is available; nothing to decode.
    EmbedOnly,
}

#[async_trait]
pub trait EpisodeSource: Send + Sync {
    fn id(&self) -> &str;

    /// Episodes of a series, ordered by episode number.
    async fn list_episodes(&self, series_id: &str) -> Result<Vec<EpisodeRef>>;

    async fn resolve_video(&self, episode_id: &str) -> Result<VideoLink>;
}

/// Explicit map of source id to source, populated at startup.
#[derive(Default, Clone)]
pub struct SourceRegistry {
    sources: HashMap<String, Arc<dyn EpisodeSource>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with one `ConfiguredSource` per configured catalogue.
    pub fn from_config(catalogs: &[SourceCatalog]) -> Self {
        let mut registry = Self::new();
        for catalog in catalogs {
            registry.register(Arc::new(ConfiguredSource::from_catalog(catalog)));
        }
        registry
    }

    /// Add a source, replacing any previous one with the same id.
    pub fn register(&mut self, source: Arc<dyn EpisodeSource>) {
        let id = source.id().to_string();
        if self.sources.insert(id.clone(), source).is_some() {
            log::warn!("Source '{}' registered twice, keeping the last one", id);
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn EpisodeSource>> {
        self.sources.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sources.contains_key(id)
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sources.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_from_config() {
        let catalogs = vec![
            SourceCatalog {
                id: "b".into(),
                series: vec![],
            },
            SourceCatalog {
                id: "a".into(),
                series: vec![],
            },
        ];
        let registry = SourceRegistry::from_config(&catalogs);
        assert_eq!(registry.ids(), vec!["a".to_string(), "b".to_string()]);
        assert!(registry.contains("a"));
        assert!(registry.get("missing").is_none());
    }
}
