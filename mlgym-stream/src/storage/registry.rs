//! Registry of per-room stores.
//!
//! Built once at server start and owned by the hub; stores are created lazily
//! the first time a room is opened and live until the process exits.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};

use super::{validate_room_id, EventStore, FileStore, MemoryStore, StoreError, LOG_FILE_NAME};

/// Storage backend selection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StorageConfig {
    /// Volatile, per-process history
    #[default]
    Memory,
    /// One JSONL log per room under `root`
    Disk {
        root: PathBuf,
        /// fsync after every append
        sync_writes: bool,
    },
}

impl StorageConfig {
    pub fn disk(root: impl Into<PathBuf>) -> Self {
        StorageConfig::Disk {
            root: root.into(),
            sync_writes: false,
        }
    }
}

/// Maps room ids to their event stores.
pub struct StoreRegistry {
    config: StorageConfig,
    stores: RwLock<HashMap<String, Arc<dyn EventStore>>>,
}

impl StoreRegistry {
    pub fn new(config: StorageConfig) -> Result<Self, StoreError> {
        if let StorageConfig::Disk { root, .. } = &config {
            fs::create_dir_all(root)?;
        }
        Ok(Self {
            config,
            stores: RwLock::new(HashMap::new()),
        })
    }

    /// Volatile registry, mostly for tests.
    pub fn in_memory() -> Self {
        Self {
            config: StorageConfig::Memory,
            stores: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Get the store of `room_id`, creating it on first use.
    pub fn open(&self, room_id: &str) -> Result<Arc<dyn EventStore>, StoreError> {
        // Fast path: read lock
        if let Some(store) = self.get(room_id) {
            return Ok(store);
        }

        validate_room_id(room_id)?;

        // Slow path: write lock to create
        let mut stores = self.stores.write().unwrap_or_else(PoisonError::into_inner);
        // Double-check after acquiring write lock
        if let Some(store) = stores.get(room_id) {
            return Ok(store.clone());
        }

        let store: Arc<dyn EventStore> = match &self.config {
            StorageConfig::Memory => Arc::new(MemoryStore::new()),
            StorageConfig::Disk { root, sync_writes } => Arc::new(FileStore::open(root, room_id, *sync_writes)?),
        };
        stores.insert(room_id.to_string(), store.clone());
        Ok(store)
    }

    /// Get the store of `room_id` if it has been opened.
    pub fn get(&self, room_id: &str) -> Option<Arc<dyn EventStore>> {
        self.stores
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(room_id)
            .cloned()
    }

    /// Install a prebuilt store for `room_id`, replacing any existing one.
    pub fn insert(&self, room_id: &str, store: Arc<dyn EventStore>) -> Result<(), StoreError> {
        validate_room_id(room_id)?;
        self.stores
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(room_id.to_string(), store);
        Ok(())
    }

    /// Ids of all opened rooms.
    pub fn rooms(&self) -> Vec<String> {
        self.stores
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Open every room already present on disk.
    ///
    /// Returns `(room_id, stored events)` per recovered room, sorted by id.
    /// Directories without a log file or with unusable names are skipped.
    pub fn recover(&self) -> Result<Vec<(String, u64)>, StoreError> {
        let root = match &self.config {
            StorageConfig::Memory => return Ok(Vec::new()),
            StorageConfig::Disk { root, .. } => root.clone(),
        };

        let mut recovered = Vec::new();
        for entry in fs::read_dir(&root)? {
            let entry = entry?;
            if !entry.path().join(LOG_FILE_NAME).is_file() {
                continue;
            }
            let Some(room_id) = entry.file_name().to_str().map(str::to_string) else {
                log::warn!("Skipping room directory with non UTF-8 name: {:?}", entry.file_name());
                continue;
            };
            let store = self.open(&room_id)?;
            recovered.push((room_id, store.len()));
        }

        recovered.sort();
        Ok(recovered)
    }
}
