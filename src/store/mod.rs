pub mod disk;
pub mod memory;

use crate::core::cache::{KeyValueCollection, Store};
use anyhow::{Context, Result};
use disk::DiskCollection;
use fjall::{Keyspace, PartitionCreateOptions};
use memory::MemoryCollection;
use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, RwLock},
};
use tracing::warn;

/// A thread-safe key-value store holding named collections, persisted in a
/// fjall keyspace when one is available.
pub struct KeyValueStore {
    collections: RwLock<HashMap<String, Arc<dyn KeyValueCollection>>>,
    keyspace: Option<Keyspace>,
}

impl KeyValueStore {
    /// Opens (or creates) a persistent store under `path`.
    pub fn open(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path)
            .with_context(|| format!("Failed to create data directory: {}", path.display()))?;
        let keyspace = fjall::Config::new(path.join("cache"))
            .open()
            .with_context(|| format!("Failed to open store at {}", path.display()))?;
        Ok(Self {
            collections: RwLock::new(HashMap::new()),
            keyspace: Some(keyspace),
        })
    }

    /// A store that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            keyspace: None,
        }
    }

    pub fn is_persistent(&self) -> bool {
        self.keyspace.is_some()
    }

    fn create(&self, name: &str) -> Arc<dyn KeyValueCollection> {
        if let Some(keyspace) = &self.keyspace {
            match keyspace.open_partition(name, PartitionCreateOptions::default()) {
                Ok(partition) => return Arc::new(DiskCollection::new(partition)),
                Err(e) => warn!(collection = name, error = %e, "Falling back to memory collection"),
            }
        }
        Arc::new(MemoryCollection::new())
    }

    /// Clears every collection opened so far. Used on logout.
    pub async fn clear_all(&self) {
        let collections: Vec<Arc<dyn KeyValueCollection>> = match self.collections.read() {
            Ok(collections) => collections.values().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().values().cloned().collect(),
        };
        for collection in collections {
            collection.clear().await;
        }
    }
}

impl Default for KeyValueStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl Store for KeyValueStore {
    fn collection(&self, name: &str) -> Arc<dyn KeyValueCollection> {
        if let Ok(collections) = self.collections.read() {
            if let Some(collection) = collections.get(name) {
                return Arc::clone(collection);
            }
        }

        let mut collections = match self.collections.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(
            collections
                .entry(name.to_string())
                .or_insert_with(|| self.create(name)),
        )
    }
}
