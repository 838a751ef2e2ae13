use serde::{Deserialize, Serialize};

use crate::chunker::CHUNKER_VERSION;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionManifest {
    pub name: String,
    pub dimension: usize,
    pub metric: String,
    pub provider_id: String,
    pub chunker_version: u32,
}

impl CollectionManifest {
    pub fn new(name: impl Into<String>, dimension: usize, provider_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dimension,
            metric: "cosine".to_string(),
            provider_id: provider_id.into(),
            chunker_version: CHUNKER_VERSION,
        }
    }
}
