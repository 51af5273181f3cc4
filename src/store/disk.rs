use crate::core::cache::KeyValueCollection;
use anyhow::Result;
use async_trait::async_trait;
use fjall::PartitionHandle;
use tracing::debug;

/// Collection persisted in one fjall partition.
pub struct DiskCollection {
    partition: PartitionHandle,
}

impl DiskCollection {
    pub fn new(partition: PartitionHandle) -> Self {
        Self { partition }
    }

    fn read(&self, key: &str) -> Result<Option<String>> {
        match self.partition.get(key)? {
            Some(bytes) => Ok(Some(String::from_utf8(bytes.to_vec())?)),
            None => Ok(None),
        }
    }

    fn clear_all(&self) -> Result<()> {
        let keys = self
            .partition
            .keys()
            .collect::<std::result::Result<Vec<_>, _>>()?;
        for key in keys {
            self.partition.remove(key)?;
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueCollection for DiskCollection {
    async fn get(&self, key: &str) -> Option<String> {
        match self.read(key) {
            Ok(Some(value)) => {
                debug!("Cache HIT for key: {}", key);
                Some(value)
            }
            Ok(None) => {
                debug!("Cache MISS for key: {}", key);
                None
            }
            Err(e) => {
                debug!("DiskCollection get error for {}: {}", key, e);
                None
            }
        }
    }

    async fn put(&self, key: &str, value: String) {
        if let Err(e) = self.partition.insert(key, value) {
            debug!("DiskCollection put error for {}: {}", key, e);
        } else {
            debug!("Cache PUT for key: {}", key);
        }
    }

    async fn remove(&self, key: &str) {
        if let Err(e) = self.partition.remove(key) {
            debug!("DiskCollection remove error for {}: {}", key, e);
        }
    }

    async fn clear(&self) {
        if let Err(e) = self.clear_all() {
            debug!("DiskCollection clear error: {}", e)
        }
    }
}
