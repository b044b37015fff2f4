//! Index of the data sources owned by one node

use super::source::DataSource;
use crate::domain::DomainKey;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

#[derive(Default)]
pub struct DataSourceRegistry {
    sources: RwLock<HashMap<String, Arc<DataSource>>>,
}

impl DataSourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `source`; if one with the same key exists it is kept and
    /// returned instead
    pub fn register(&self, source: Arc<DataSource>) -> Arc<DataSource> {
        self.sources
            .write()
            .entry(source.key())
            .or_insert(source)
            .clone()
    }

    pub fn get(&self, key: &str) -> Option<Arc<DataSource>> {
        self.sources.read().get(key).cloned()
    }

    pub fn all(&self) -> Vec<Arc<DataSource>> {
        self.sources.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sources.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Route a changed log key to its source. Keys of unknown sources are
    /// ignored.
    pub fn route_keyspace_event(&self, key: &str) -> bool {
        let source_key = match DomainKey::parse(key) {
            Ok(parsed) if parsed.device.is_some() => parsed.source_key().to_string(),
            _ => {
                trace!(key, "ignoring key event");
                return false;
            }
        };
        match self.get(&source_key) {
            Some(source) => source.route_keyspace_event(key),
            None => false,
        }
    }

    pub async fn resync_all(&self) {
        for source in self.all() {
            source.resync_all().await;
        }
    }
}
