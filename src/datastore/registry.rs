use super::flusher::{DataStoreFlusher, FlushQueue};
use super::freelist::round_up_pow2;
use super::header::HEADER_SIZE;
use super::store::{DataStore, DataStoreSizes, FREELIST_SUFFIX};
use super::Guid;
use crate::config::DataStoreConfig;
use crate::error::Result;
use crate::flock::DirLock;
use crate::Error;

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Extension of every data file in a registry directory.
pub const DATA_SUFFIX: &str = ".data";

pub(crate) type StoreTable = Mutex<BTreeMap<Guid, Arc<DataStore>>>;

/// One entry reported by [`DataStores::list_data_stores`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataStoreInfo {
    pub guid: Guid,
    pub path: PathBuf,
    pub sizes: DataStoreSizes,
}

/// Table of open data stores below one directory.
///
/// Stores are created on first lookup and shared through `Arc`, so a caller
/// can keep working on a store after the table lock is released, or after
/// the store has been closed.
pub struct DataStores {
    config: DataStoreConfig,
    min_alloc_size: u64,
    stores: Arc<StoreTable>,
    flush_queue: Arc<FlushQueue>,
    flusher: DataStoreFlusher,
    _lock: DirLock,
}

impl DataStores {
    /// Opens the registry, locking its directory and starting the
    /// background flusher when a flush interval is configured.
    pub fn open(config: DataStoreConfig) -> Result<Self> {
        fs::create_dir_all(&config.dir).map_err(|e| Error::syscall("mkdir", &config.dir, e))?;
        let lock = DirLock::acquire(&config.dir)
            .map_err(|e| Error::syscall("lock", config.dir.join(crate::flock::LOCK_FILE), e))?;

        let min_alloc_size =
            round_up_pow2(config.min_alloc_size as u64).max(2 * HEADER_SIZE as u64);

        let stores = Arc::new(StoreTable::default());
        let flush_queue = Arc::new(FlushQueue::default());
        let flusher = DataStoreFlusher::new(flush_queue.clone(), stores.clone());
        if config.background_flush_enabled() {
            flusher.start(config.flush_interval)?;
        }

        tracing::info!(
            dir = %config.dir.display(),
            min_alloc_size,
            flush_interval_ms = config.flush_interval.as_millis() as u64,
            "Opened data store registry"
        );

        Ok(Self {
            config,
            min_alloc_size,
            stores,
            flush_queue,
            flusher,
            _lock: lock,
        })
    }

    pub fn config(&self) -> &DataStoreConfig {
        &self.config
    }

    /// Effective minimum block size, a power of two
    pub fn min_alloc_size(&self) -> u64 {
        self.min_alloc_size
    }

    pub fn flusher(&self) -> &DataStoreFlusher {
        &self.flusher
    }

    /// Path of the data file for `guid`
    pub fn data_path(&self, guid: Guid) -> PathBuf {
        self.config.dir.join(format!("{}{}", guid, DATA_SUFFIX))
    }

    /// Returns the store for `guid`, opening or creating it on first use.
    pub fn get_data_store(&self, guid: Guid) -> Result<Arc<DataStore>> {
        let mut table = self.stores.lock()?;
        if let Some(store) = table.get(&guid) {
            return Ok(store.clone());
        }

        let store = Arc::new(self.open_store(guid)?);
        table.insert(guid, store.clone());
        Ok(store)
    }

    /// Drops `guid` from the table. With `remove`, its data and free-list
    /// files are deleted, opening the store first if it is not loaded.
    /// Without it, pending changes are flushed.
    pub fn close_data_store(&self, guid: Guid, remove: bool) -> Result<()> {
        let closed = {
            let mut table = self.stores.lock()?;
            let store = match table.remove(&guid) {
                Some(store) => store,
                None if remove => Arc::new(self.open_store(guid)?),
                None => return Ok(()),
            };
            if remove {
                store.remove_files()?;
                return Ok(());
            }
            store
        };

        closed.flush()?;
        tracing::trace!(guid, "Closed data store");
        Ok(())
    }

    /// Flushes every open store in guid order. The table lock is released
    /// around each store's flush.
    pub fn flush_all_data_stores(&self) -> Result<()> {
        let mut last: Option<Guid> = None;
        loop {
            let next = {
                let table = self.stores.lock()?;
                let lower = match last {
                    Some(guid) => Bound::Excluded(guid),
                    None => Bound::Unbounded,
                };
                table
                    .range((lower, Bound::Unbounded))
                    .next()
                    .map(|(guid, store)| (*guid, store.clone()))
            };

            let Some((guid, store)) = next else {
                break;
            };
            store.flush()?;
            last = Some(guid);
        }
        Ok(())
    }

    /// Closes every store and deletes every data and free-list file in the
    /// registry directory.
    pub fn clear_all_data_stores(&self) -> Result<()> {
        let mut table = self.stores.lock()?;
        for store in table.values() {
            store.remove_files()?;
        }
        table.clear();

        let dir = &self.config.dir;
        let entries = fs::read_dir(dir).map_err(|e| Error::syscall("readdir", dir, e))?;
        let mut removed = 0usize;
        for entry in entries {
            let path = entry.map_err(|e| Error::syscall("readdir", dir, e))?.path();
            if !is_store_file(&path) {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::syscall("remove", &path, e)),
            }
        }

        tracing::info!(dir = %dir.display(), removed, "Cleared all data stores");
        Ok(())
    }

    /// Calls `callback` once per open store in guid order.
    pub fn list_data_stores<F>(&self, mut callback: F) -> Result<()>
    where
        F: FnMut(&DataStoreInfo),
    {
        let stores: Vec<Arc<DataStore>> = self.stores.lock()?.values().cloned().collect();
        for store in stores {
            let info = DataStoreInfo {
                guid: store.guid(),
                path: store.path().to_path_buf(),
                sizes: store.get_sizes()?,
            };
            callback(&info);
        }
        Ok(())
    }

    /// Number of stores currently open
    pub fn len(&self) -> Result<usize> {
        Ok(self.stores.lock()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Stops the background flusher, then flushes every open store.
    pub async fn shutdown(&self) -> Result<()> {
        self.flusher.stop().await?;
        self.flush_all_data_stores()?;
        tracing::info!(dir = %self.config.dir.display(), "Data store registry shut down");
        Ok(())
    }

    fn open_store(&self, guid: Guid) -> Result<DataStore> {
        DataStore::open(
            self.data_path(guid),
            guid,
            self.min_alloc_size,
            self.flush_queue.clone(),
        )
    }
}

fn is_store_file(path: &Path) -> bool {
    if !path.is_file() {
        return false;
    }
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.ends_with(DATA_SUFFIX) || name.ends_with(FREELIST_SUFFIX))
}
