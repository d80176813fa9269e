use super::bucket::{decode_snapshot, encode_snapshot, Buckets, INVALIDATED_SNAPSHOT};
use super::flusher::FlushQueue;
use super::freelist::{round_up_pow2, Freelist};
use super::header::{ChunkHeader, HEADER_SIZE};
use super::Guid;
use crate::error::Result;
use crate::fileio;
use crate::Error;

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Suffix appended to a data file path to name its free-list file.
pub const FREELIST_SUFFIX: &str = ".fl";

/// Space accounting for one store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DataStoreSizes {
    /// Length of the data file
    pub file_bytes: u64,
    /// 512-byte blocks the data file occupies on disk
    pub file_blocks: u64,
    /// Nominal store size minus free bytes
    pub reserved_bytes: u64,
    /// Bytes held by free-list blocks
    pub free_bytes: u64,
}

struct StoreState {
    freelist: Freelist,
    /// Data writes not yet fsynced
    dirty: bool,
    /// In-memory free-list differs from the free-list file
    freelist_dirty: bool,
    /// The free-list file holds the empty snapshot
    invalidated: bool,
}

/// On-disk storage for one array.
///
/// Space is reserved with [`allocate_space`](Self::allocate_space), filled
/// with [`write_data`](Self::write_data) and read back with
/// [`read_data`](Self::read_data). Nothing is durable until
/// [`flush`](Self::flush) runs, either explicitly or from the background
/// flusher.
pub struct DataStore {
    guid: Guid,
    path: PathBuf,
    freelist_path: PathBuf,
    file: File,
    state: Mutex<StoreState>,
    flush_queue: Arc<FlushQueue>,
    removed: AtomicBool,
}

impl DataStore {
    /// Opens or creates the data file at `path` and recovers its free-list.
    pub fn open(
        path: impl Into<PathBuf>,
        guid: Guid,
        min_alloc_size: u64,
        flush_queue: Arc<FlushQueue>,
    ) -> Result<Self> {
        let path = path.into();
        let freelist_path = freelist_path_for(&path);

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| Error::syscall("open", &path, e))?;

        let min_size = round_up_pow2(min_alloc_size.max(2 * HEADER_SIZE as u64));
        let freelist = initialize_freelist(&file, &path, &freelist_path, min_size)?;

        tracing::trace!(
            path = %path.display(),
            guid,
            allocated_size = freelist.allocated_size(),
            free_bytes = freelist.free_bytes(),
            "Opened data store"
        );

        Ok(Self {
            guid,
            path,
            freelist_path,
            file,
            state: Mutex::new(StoreState {
                freelist,
                dirty: false,
                freelist_dirty: false,
                invalidated: false,
            }),
            flush_queue,
            removed: AtomicBool::new(false),
        })
    }

    pub fn guid(&self) -> Guid {
        self.guid
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn freelist_path(&self) -> &Path {
        &self.freelist_path
    }

    /// Bytes of every block taken by the chunk header
    pub fn overhead(&self) -> usize {
        HEADER_SIZE
    }

    /// Reserves a block able to hold `requested` payload bytes.
    ///
    /// Returns the block offset and its size; the size must be handed back
    /// to [`write_data`](Self::write_data) and [`free_chunk`](Self::free_chunk).
    pub fn allocate_space(&self, requested: usize) -> Result<(u64, u64)> {
        let mut state = self.state.lock()?;

        let size = state
            .freelist
            .required_size(requested as u64, HEADER_SIZE as u64)?;

        self.invalidate_freelist_file(&mut state)?;

        let offset = state.freelist.allocate(size)?;
        self.check_freelist(&state)?;

        tracing::trace!(
            path = %self.path.display(),
            requested,
            offset,
            size,
            "Allocated space"
        );
        Ok((offset, size))
    }

    /// Writes a used header and `data` into the block at `offset`, padding
    /// the rest of the block with zeros.
    pub fn write_data(&self, offset: u64, data: &[u8], allocated_size: u64) -> Result<()> {
        if !allocated_size.is_power_of_two() || offset % allocated_size != 0 {
            return Err(Error::InvalidOperation(format!(
                "block {}+{} is not an aligned power-of-two block",
                offset, allocated_size
            )));
        }
        if (data.len() as u64).saturating_add(HEADER_SIZE as u64) > allocated_size {
            return Err(Error::InvalidOperation(format!(
                "{} bytes do not fit in a {} byte block",
                data.len(),
                allocated_size
            )));
        }

        let mut state = self.state.lock()?;
        state.freelist.check_block(offset, allocated_size)?;
        if state.freelist.is_free(offset, allocated_size) {
            return Err(Error::InvalidOperation(format!(
                "block {}+{} is not allocated",
                offset, allocated_size
            )));
        }

        let mut block = Vec::with_capacity(allocated_size as usize);
        block.extend_from_slice(&ChunkHeader::used(allocated_size).encode());
        block.extend_from_slice(data);
        block.resize(allocated_size as usize, 0);

        fileio::write_all_at(&self.file, &block, offset)
            .map_err(|e| Error::syscall("write", &self.path, e))?;

        if !state.dirty {
            state.dirty = true;
            self.flush_queue.add(self.guid);
        }

        tracing::trace!(
            path = %self.path.display(),
            offset,
            len = data.len(),
            allocated_size,
            "Wrote chunk"
        );
        Ok(())
    }

    /// Reads `buf.len()` payload bytes of the chunk at `offset`.
    pub fn read_data(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut raw = vec![0u8; HEADER_SIZE + buf.len()];
        fileio::read_exact_at(&self.file, &mut raw, offset).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                self.corrupted(offset)
            } else {
                Error::syscall("read", &self.path, e)
            }
        })?;

        let header = ChunkHeader::decode(&raw[..HEADER_SIZE])?;
        if !header.covers(offset, buf.len()) {
            tracing::error!(
                path = %self.path.display(),
                offset,
                marker = format_args!("{:#018x}", header.marker),
                size = header.size,
                "Chunk header failed validation"
            );
            return Err(self.corrupted(offset));
        }

        buf.copy_from_slice(&raw[HEADER_SIZE..]);
        Ok(())
    }

    /// Returns the block at `offset` to the free-list.
    pub fn free_chunk(&self, offset: u64, allocated_size: u64) -> Result<()> {
        let mut state = self.state.lock()?;
        state.freelist.check_block(offset, allocated_size)?;

        self.invalidate_freelist_file(&mut state)?;

        state.freelist.free(offset, allocated_size)?;
        self.check_freelist(&state)?;

        tracing::trace!(
            path = %self.path.display(),
            offset,
            allocated_size,
            "Freed chunk"
        );
        Ok(())
    }

    /// Makes written data durable, then persists the free-list.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.state.lock()?;

        if state.dirty {
            tracing::trace!(path = %self.path.display(), "Flushing data");
            self.file
                .sync_all()
                .map_err(|e| Error::syscall("fsync", &self.path, e))?;
            state.dirty = false;
        }

        if state.freelist_dirty {
            if self.removed.load(Ordering::SeqCst) {
                state.freelist_dirty = false;
            } else {
                tracing::trace!(path = %self.path.display(), "Flushing free-list");
                self.persist_freelist(&mut state)?;
            }
        }

        Ok(())
    }

    /// Reports file and free-space sizes.
    pub fn get_sizes(&self) -> Result<DataStoreSizes> {
        let state = self.state.lock()?;
        let meta = self
            .file
            .metadata()
            .map_err(|e| Error::syscall("fstat", &self.path, e))?;

        let free_bytes = state.freelist.free_bytes();
        Ok(DataStoreSizes {
            file_bytes: meta.len(),
            file_blocks: fileio::disk_blocks(&meta),
            reserved_bytes: state.freelist.allocated_size() - free_bytes,
            free_bytes,
        })
    }

    /// Checks the whole free-list for structural damage.
    pub fn verify_freelist(&self) -> Result<()> {
        let state = self.state.lock()?;
        state.freelist.verify()
    }

    /// Copy of the in-memory free-list buckets
    pub fn freelist_snapshot(&self) -> Result<Buckets> {
        Ok(self.state.lock()?.freelist.buckets().clone())
    }

    /// Nominal size of the store, free blocks past the end of the file included
    pub fn allocated_size(&self) -> Result<u64> {
        Ok(self.state.lock()?.freelist.allocated_size())
    }

    pub fn largest_free_chunk(&self) -> Result<u64> {
        Ok(self.state.lock()?.freelist.largest_free_chunk())
    }

    /// Whether unflushed data or free-list changes exist
    pub fn is_dirty(&self) -> Result<bool> {
        let state = self.state.lock()?;
        Ok(state.dirty || state.freelist_dirty)
    }

    /// Logs every free-list bucket at debug level.
    pub fn dump_freelist(&self) -> Result<()> {
        let state = self.state.lock()?;
        tracing::debug!(path = %self.path.display(), "Free-list dump");
        for (size, offsets) in state.freelist.buckets() {
            tracing::debug!(bucket = size, count = offsets.len(), ?offsets, "  bucket");
        }
        Ok(())
    }

    /// Deletes the data and free-list files. Later flushes through handles
    /// that outlive the removal never recreate the free-list file.
    pub(crate) fn remove_files(&self) -> Result<()> {
        let _state = self.state.lock()?;
        self.removed.store(true, Ordering::SeqCst);

        remove_if_exists(&self.freelist_path)?;
        remove_if_exists(&self.path)?;

        tracing::info!(path = %self.path.display(), guid = self.guid, "Removed data store");
        Ok(())
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }

    /// Marks the free-list file empty before the first in-memory change
    /// since the last flush, so a crash can never leave a stale free-list
    /// on disk.
    fn invalidate_freelist_file(&self, state: &mut StoreState) -> Result<()> {
        if state.invalidated {
            return Ok(());
        }

        if !self.removed.load(Ordering::SeqCst) {
            tracing::trace!(path = %self.path.display(), "Invalidating free-list");
            self.write_freelist_file(&INVALIDATED_SNAPSHOT)?;
        }

        state.invalidated = true;
        state.freelist_dirty = true;
        self.flush_queue.add(self.guid);
        Ok(())
    }

    fn persist_freelist(&self, state: &mut StoreState) -> Result<()> {
        let snapshot = encode_snapshot(state.freelist.buckets())?;
        // A failed rewrite may leave a complete snapshot behind, so the next
        // mutation has to invalidate the file again
        state.invalidated = false;
        self.write_freelist_file(&snapshot)?;
        state.freelist_dirty = false;

        tracing::trace!(
            path = %self.freelist_path.display(),
            buckets = state.freelist.buckets().len(),
            bytes = snapshot.len(),
            "Persisted free-list"
        );
        Ok(())
    }

    fn write_freelist_file(&self, bytes: &[u8]) -> Result<()> {
        let path = &self.freelist_path;
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(path)
            .map_err(|e| Error::syscall("open", path, e))?;
        file.write_all(bytes)
            .map_err(|e| Error::syscall("write", path, e))?;
        file.sync_all()
            .map_err(|e| Error::syscall("fsync", path, e))?;
        Ok(())
    }

    /// Full free-list verification after every mutation in debug builds.
    /// The ancestor check inside `Freelist::free` runs in every build.
    fn check_freelist(&self, state: &StoreState) -> Result<()> {
        if cfg!(debug_assertions) {
            if let Err(e) = state.freelist.verify() {
                tracing::error!(path = %self.path.display(), error = %e, "Free-list damaged");
                return Err(e);
            }
        }
        Ok(())
    }

    fn corrupted(&self, offset: u64) -> Error {
        Error::ChunkCorrupted {
            path: self.path.clone(),
            offset,
        }
    }
}

impl std::fmt::Debug for DataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataStore")
            .field("guid", &self.guid)
            .field("path", &self.path)
            .field("removed", &self.is_removed())
            .finish()
    }
}

pub fn freelist_path_for(data_path: &Path) -> PathBuf {
    let mut name = data_path.as_os_str().to_owned();
    name.push(FREELIST_SUFFIX);
    PathBuf::from(name)
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::syscall("remove", path, e)),
    }
}

/// Derives the nominal size from the file length alone, then trusts the
/// free-list file only if every bucket in it decodes and verifies.
fn initialize_freelist(
    file: &File,
    path: &Path,
    freelist_path: &Path,
    min_size: u64,
) -> Result<Freelist> {
    let file_len = file
        .metadata()
        .map_err(|e| Error::syscall("fstat", path, e))?
        .len();
    let allocated_size = min_size.max(round_up_pow2(file_len));

    match read_freelist_file(freelist_path) {
        Ok(Some(buckets)) if !buckets.is_empty() => {
            let bucket_count = buckets.len();
            match Freelist::from_buckets(min_size, allocated_size, buckets) {
                Ok(freelist) => {
                    tracing::trace!(
                        path = %path.display(),
                        buckets = bucket_count,
                        "Loaded free-list"
                    );
                    return Ok(freelist);
                }
                Err(e) => tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Discarding inconsistent free-list"
                ),
            }
        }
        Ok(_) => {}
        Err(Error::CorruptFreelist(msg)) => tracing::warn!(
            path = %path.display(),
            error = %msg,
            "Discarding corrupt free-list"
        ),
        Err(e) => return Err(e),
    }

    let freelist = Freelist::reconstruct(min_size, allocated_size, file_len);
    if file_len > 0 {
        tracing::warn!(
            path = %path.display(),
            file_len,
            free_bytes = freelist.free_bytes(),
            "No usable free-list, treating all written space as allocated"
        );
    }
    Ok(freelist)
}

/// `None` when the free-list file does not exist.
fn read_freelist_file(path: &Path) -> Result<Option<Buckets>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::syscall("read", path, e)),
    };
    decode_snapshot(&bytes).map(Some)
}
