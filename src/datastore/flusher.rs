use super::registry::StoreTable;
use super::Guid;
use crate::error::{Error, Result};
use crate::scheduler::{BackgroundTask, Context, Scheduler};

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Identifiers of stores with unflushed changes since the last flush cycle.
///
/// Stores push themselves here from the data path, so adding never fails:
/// a poisoned lock is recovered rather than reported.
#[derive(Debug, Default)]
pub struct FlushQueue {
    running: AtomicBool,
    pending: Mutex<BTreeSet<Guid>>,
}

impl FlushQueue {
    /// Records `guid` for the next cycle. Ignored while no flusher runs.
    pub fn add(&self, guid: Guid) {
        if self.is_running() {
            self.lock().insert(guid);
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Identifiers waiting for the next cycle
    pub fn pending(&self) -> Vec<Guid> {
        self.lock().iter().copied().collect()
    }

    /// Swaps out the pending set.
    fn take(&self) -> BTreeSet<Guid> {
        std::mem::take(&mut *self.lock())
    }

    fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, BTreeSet<Guid>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Periodically flushes every store that reported a change.
pub struct DataStoreFlusher {
    queue: Arc<FlushQueue>,
    stores: Arc<StoreTable>,
    scheduler: Mutex<Option<Scheduler>>,
}

impl DataStoreFlusher {
    pub(crate) fn new(queue: Arc<FlushQueue>, stores: Arc<StoreTable>) -> Self {
        Self {
            queue,
            stores,
            scheduler: Mutex::new(None),
        }
    }

    /// Starts the flush loop on the current tokio runtime. Starting a
    /// running flusher does nothing.
    pub fn start(&self, interval: Duration) -> Result<()> {
        if interval.is_zero() {
            return Err(Error::InvalidOperation(
                "flush interval must be non-zero".to_string(),
            ));
        }

        let mut slot = self.scheduler.lock()?;
        if slot.is_some() {
            return Ok(());
        }

        let scheduler = Scheduler::new();
        scheduler.register(Arc::new(FlushTask {
            queue: self.queue.clone(),
            stores: self.stores.clone(),
            interval,
        }))?;

        self.queue.set_running(true);
        *slot = Some(scheduler);

        tracing::info!(interval_ms = interval.as_millis() as u64, "Started data store flusher");
        Ok(())
    }

    /// Stops the flush loop, waiting for an in-flight cycle to finish.
    /// Stopping a stopped flusher does nothing.
    pub async fn stop(&self) -> Result<()> {
        let scheduler = self.scheduler.lock()?.take();
        let Some(scheduler) = scheduler else {
            return Ok(());
        };

        self.queue.set_running(false);
        scheduler.shutdown().await?;
        self.queue.clear();

        tracing::info!("Stopped data store flusher");
        Ok(())
    }

    pub fn add(&self, guid: Guid) {
        self.queue.add(guid);
    }

    pub fn is_running(&self) -> bool {
        self.queue.is_running()
    }

    pub fn pending(&self) -> Vec<Guid> {
        self.queue.pending()
    }

    /// Runs one cycle immediately on the calling thread.
    pub fn flush_pending(&self) -> usize {
        flush_cycle(&self.queue, &self.stores)
    }
}

impl Drop for DataStoreFlusher {
    fn drop(&mut self) {
        self.queue.set_running(false);
        // Dropping the scheduler signals its loop to exit
        if let Ok(mut slot) = self.scheduler.lock() {
            slot.take();
        }
    }
}

struct FlushTask {
    queue: Arc<FlushQueue>,
    stores: Arc<StoreTable>,
    interval: Duration,
}

#[async_trait::async_trait]
impl BackgroundTask for FlushTask {
    fn name(&self) -> &'static str {
        "datastore-flush"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn execute(&self, ctx: Context) -> Result<()> {
        let queue = self.queue.clone();
        let stores = self.stores.clone();

        let flushed = tokio::task::spawn_blocking(move || flush_cycle(&queue, &stores))
            .await
            .map_err(|e| Error::InvalidState(format!("flush cycle panicked: {}", e)))?;

        if flushed > 0 {
            tracing::trace!(run_id = ctx.run_id, flushed, "Flush cycle complete");
        }
        Ok(())
    }
}

/// Flushes every pending store still present in the table. Failed stores are
/// queued again. Returns the number of stores flushed.
fn flush_cycle(queue: &FlushQueue, stores: &StoreTable) -> usize {
    let mut flushed = 0;

    for guid in queue.take() {
        let store = match stores.lock() {
            Ok(table) => table.get(&guid).cloned(),
            Err(_) => {
                tracing::error!(guid, "Store table lock poisoned");
                queue.add(guid);
                continue;
            }
        };
        let Some(store) = store else {
            continue;
        };

        match store.flush() {
            Ok(()) => flushed += 1,
            Err(e) => {
                tracing::error!(
                    guid,
                    path = %store.path().display(),
                    error = %e,
                    "Background flush failed"
                );
                queue.add(guid);
            }
        }
    }

    flushed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::DataStore;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn fixture(dir: &TempDir) -> Result<(Arc<FlushQueue>, Arc<StoreTable>, Arc<DataStore>)> {
        let queue = Arc::new(FlushQueue::default());
        let store = Arc::new(DataStore::open(
            dir.path().join("7.data"),
            7,
            64,
            queue.clone(),
        )?);
        let mut table = BTreeMap::new();
        table.insert(7, store.clone());
        Ok((queue, Arc::new(Mutex::new(table)), store))
    }

    #[test]
    fn test_queue_ignores_adds_while_stopped() {
        let queue = FlushQueue::default();
        queue.add(1);
        assert!(queue.pending().is_empty());

        queue.set_running(true);
        queue.add(2);
        queue.add(2);
        assert_eq!(queue.pending(), vec![2]);
        assert_eq!(queue.take().len(), 1);
        assert!(queue.pending().is_empty());
    }

    #[test]
    fn test_flush_cycle_skips_unknown_stores() -> Result<()> {
        let dir = TempDir::new()?;
        let (queue, stores, store) = fixture(&dir)?;
        queue.set_running(true);

        let (offset, size) = store.allocate_space(10)?;
        store.write_data(offset, b"payload", size)?;
        queue.add(99);
        assert_eq!(queue.pending(), vec![7, 99]);

        assert_eq!(flush_cycle(&queue, &stores), 1);
        assert!(!store.is_dirty()?);
        assert!(queue.pending().is_empty());
        Ok(())
    }

    #[test]
    fn test_flush_pending_runs_cycle_inline() -> Result<()> {
        let dir = TempDir::new()?;
        let (queue, stores, store) = fixture(&dir)?;
        queue.set_running(true);
        let flusher = DataStoreFlusher::new(queue, stores);

        assert_eq!(flusher.flush_pending(), 0);

        let (offset, size) = store.allocate_space(100)?;
        store.write_data(offset, &[3u8; 100], size)?;
        assert_eq!(flusher.pending(), vec![7]);

        assert_eq!(flusher.flush_pending(), 1);
        assert!(!store.is_dirty()?);
        assert!(flusher.pending().is_empty());
        Ok(())
    }

    #[test]
    fn test_start_requires_runtime() -> Result<()> {
        let dir = TempDir::new()?;
        let (queue, stores, _) = fixture(&dir)?;
        let flusher = DataStoreFlusher::new(queue, stores);

        assert!(matches!(
            flusher.start(Duration::from_millis(10)),
            Err(Error::InvalidState(_))
        ));
        assert!(!flusher.is_running());
        Ok(())
    }

    #[tokio::test]
    async fn test_background_flush_persists_changes() -> Result<()> {
        let dir = TempDir::new()?;
        let (queue, stores, store) = fixture(&dir)?;
        let flusher = DataStoreFlusher::new(queue, stores);

        flusher.start(Duration::from_millis(10))?;
        assert!(flusher.is_running());

        let (offset, size) = store.allocate_space(100)?;
        store.write_data(offset, &[7u8; 100], size)?;
        assert!(store.is_dirty()?);

        let mut waited = 0;
        while store.is_dirty()? && waited < 200 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            waited += 1;
        }
        assert!(!store.is_dirty()?);

        flusher.stop().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() -> Result<()> {
        let dir = TempDir::new()?;
        let (queue, stores, _) = fixture(&dir)?;
        let flusher = DataStoreFlusher::new(queue, stores);

        flusher.stop().await?;
        flusher.start(Duration::from_millis(50))?;
        flusher.start(Duration::from_millis(50))?;
        assert!(flusher.is_running());

        flusher.stop().await?;
        flusher.stop().await?;
        assert!(!flusher.is_running());

        flusher.add(7);
        assert!(flusher.pending().is_empty());
        Ok(())
    }

    #[test]
    fn test_zero_interval_rejected() -> Result<()> {
        let dir = TempDir::new()?;
        let (queue, stores, _) = fixture(&dir)?;
        let flusher = DataStoreFlusher::new(queue, stores);
        assert!(matches!(
            flusher.start(Duration::ZERO),
            Err(Error::InvalidOperation(_))
        ));
        Ok(())
    }
}
