//! Shared emote cache
//!
//! Name → emote lookup consulted by the tokenizer. Emotes attached to incoming
//! messages are merged in before their text is tokenized so they resolve.

use crate::chat::model::Emote;
use crate::{Error, Result};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

/// Default bound on distinct emote names held in memory
pub const DEFAULT_EMOTE_CAPACITY: usize = 50_000;

/// Thread-safe emote lookup, shared by clone
#[derive(Debug, Clone)]
pub struct EmoteCache {
    inner: Arc<RwLock<HashMap<String, Emote>>>,
    capacity: usize,
}

impl Default for EmoteCache {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_EMOTE_CAPACITY)
    }
}

impl EmoteCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// Exact-name lookup
    pub fn get(&self, name: &str) -> Option<Emote> {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        map.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        map.contains_key(name)
    }

    /// Merge emotes by name; later entries replace earlier ones
    ///
    /// When a new name would exceed capacity the cache is cleared first, so memory
    /// stays bounded at the cost of re-learning emotes from later messages.
    pub fn insert_all<'a>(&self, emotes: impl IntoIterator<Item = &'a Emote>) {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        for emote in emotes {
            if emote.name.is_empty() {
                continue;
            }
            if !map.contains_key(&emote.name) && map.len() >= self.capacity {
                warn!(capacity = self.capacity, "Emote cache full, clearing");
                map.clear();
            }
            map.insert(emote.name.clone(), emote.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Preload from a JSON array of emotes, returning how many were loaded
    pub fn load_file(&self, path: &Path) -> Result<usize> {
        let content = std::fs::read_to_string(path)?;
        let emotes: Vec<Emote> = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("emote file {}: {}", path.display(), e)))?;
        self.insert_all(emotes.iter());
        info!("Loaded {} emotes from {}", emotes.len(), path.display());
        Ok(emotes.len())
    }
}
