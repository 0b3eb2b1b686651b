use fs2::FileExt;
use lazy_static::lazy_static;
use log::debug;
use memmap2::{MmapMut, MmapOptions};
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::constants::{
    EnvFlags, TransactionFlags, DATA_FILE, DEFAULT_MAP_SIZE, DEFAULT_MAX_DBS,
    DEFAULT_MAX_KEY_SIZE, DEFAULT_MAX_READERS, LOCK_FILE, LOCK_SUFFIX, META_PAGES, PAGE_SIZE,
    VERSION_MAJOR, VERSION_MINOR, VERSION_PATCH,
};
use crate::error::{Error, Result};
use crate::meta::{MetaHeader, ReaderInfo, ReaderStatus, ReaderTable, META_SIZE};
use crate::snapshot::{Snapshot, ROOT_DB};
use crate::transaction::Transaction;
use crate::writetxn::WriteTxn;

lazy_static! {
    static ref CHANGEABLE: EnvFlags = EnvFlags::NOSYNC | EnvFlags::NOMETASYNC;
}

/// Environment information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvInfo {
    /// Size of the data memory map
    pub map_size: usize,
    /// ID of the last used page
    pub last_pgno: usize,
    /// ID of the last committed transaction
    pub last_txn_id: u64,
    /// Maximum number of reader slots
    pub max_readers: u32,
    /// Reader slots in use
    pub num_readers: u32,
}

/// Database statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stat {
    /// Size of a database page
    pub psize: u32,
    /// Number of data entries
    pub entries: usize,
}

/// Options applied when an environment is opened
#[derive(Debug, Clone)]
pub struct EnvironmentBuilder {
    flags: EnvFlags,
    map_size: usize,
    max_dbs: u32,
    max_readers: u32,
}

impl Default for EnvironmentBuilder {
    fn default() -> Self {
        Self {
            flags: EnvFlags::empty(),
            map_size: DEFAULT_MAP_SIZE,
            max_dbs: DEFAULT_MAX_DBS,
            max_readers: DEFAULT_MAX_READERS,
        }
    }
}

impl EnvironmentBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the initial size of the memory map. An existing file keeps its
    /// recorded size if that is larger.
    pub fn set_map_size(&mut self, size: usize) -> &mut Self {
        self.map_size = size;
        self
    }

    /// Set the maximum number of named databases
    pub fn set_max_dbs(&mut self, dbs: u32) -> &mut Self {
        self.max_dbs = dbs;
        self
    }

    /// Set the maximum number of reader slots
    pub fn set_max_readers(&mut self, readers: u32) -> &mut Self {
        self.max_readers = readers;
        self
    }

    pub fn set_flags(&mut self, flags: EnvFlags) -> &mut Self {
        self.flags = flags;
        self
    }

    /// Open the environment at `path`
    ///
    /// `path` is a directory holding the data file, or the data file itself
    /// when `EnvFlags::NOSUBDIR` is set.
    pub fn open<P: AsRef<Path>>(&self, path: P) -> Result<Environment> {
        if self.max_readers == 0 {
            return Err(Error::Incompatible);
        }
        let mut map_size = round_to_page(self.map_size);
        if map_size < (META_PAGES + 1) * PAGE_SIZE {
            return Err(Error::EnvInvalidMapSize);
        }

        let open_path = path.as_ref().to_path_buf();
        let (data_path, lock_path) = if self.flags.contains(EnvFlags::NOSUBDIR) {
            let mut lock_path = OsString::from(open_path.as_os_str());
            lock_path.push(LOCK_SUFFIX);
            (open_path.clone(), PathBuf::from(lock_path))
        } else {
            (open_path.join(DATA_FILE), open_path.join(LOCK_FILE))
        };

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;

        let data_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&data_path)?;
        let file_size = data_file.metadata()?.len() as usize;

        let (map, committed) = if file_size == 0 {
            data_file.set_len(map_size as u64)?;
            let mut map = map_file(&data_file, map_size)?;
            MetaHeader::new(map_size).write(&mut map[..])?;
            map.flush()?;
            (map, Snapshot::empty())
        } else {
            // Read the header through a map of the current file first; the
            // recorded size may be larger than what was asked for.
            let probe = map_file(&data_file, file_size)?;
            let mut meta = MetaHeader::read(&probe[..])?;
            drop(probe);

            map_size = map_size.max(meta.mapsize as usize).max(file_size);
            if map_size > file_size {
                data_file.set_len(map_size as u64)?;
            }
            let mut map = map_file(&data_file, map_size)?;
            if meta.mapsize as usize != map_size {
                meta.mapsize = map_size as u64;
                meta.write(&mut map[..])?;
            }
            let committed = Snapshot::decode(data_region(&map, &meta)?, meta.last_txn_id)?;
            (map, committed)
        };

        debug!(
            "opened {} map_size={} last_txn_id={}",
            data_path.display(),
            map_size,
            committed.txn_id
        );

        Ok(Environment {
            inner: Arc::new(EnvInner {
                path: open_path,
                flags: RwLock::new(self.flags),
                max_dbs: self.max_dbs,
                max_readers: self.max_readers,
                max_key_size: DEFAULT_MAX_KEY_SIZE,
                data_file,
                lock_file,
                state: Mutex::new(EnvState {
                    map,
                    map_size,
                    committed: Arc::new(committed),
                    readers: ReaderTable::new(self.max_readers),
                    active_txns: 0,
                    write_active: false,
                }),
                writer_done: Condvar::new(),
                dbis: Mutex::new(vec![ROOT_DB.to_string()]),
            }),
        })
    }
}

/// Handle to an open environment
///
/// Cloning is cheap and every clone refers to the same mapping. The
/// environment is closed when the last handle and the last transaction
/// referring to it are dropped.
#[derive(Clone)]
pub struct Environment {
    inner: Arc<EnvInner>,
}

struct EnvInner {
    /// Path given to open
    path: PathBuf,
    /// Environment flags
    flags: RwLock<EnvFlags>,
    /// Maximum number of named databases
    max_dbs: u32,
    /// Maximum number of readers
    max_readers: u32,
    /// Maximum key size
    max_key_size: usize,
    /// Data file
    data_file: File,
    /// Held exclusively by the write transaction of any handle on the file
    lock_file: File,
    /// Map, committed state and transaction bookkeeping
    state: Mutex<EnvState>,
    /// Signalled whenever a write transaction terminates
    writer_done: Condvar,
    /// Database names by DBI
    dbis: Mutex<Vec<String>>,
}

struct EnvState {
    map: MmapMut,
    map_size: usize,
    committed: Arc<Snapshot>,
    readers: ReaderTable,
    /// Transactions holding a live snapshot (reset readers excluded)
    active_txns: usize,
    write_active: bool,
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("path", &self.inner.path)
            .field("flags", &self.flags())
            .finish()
    }
}

impl Environment {
    pub fn builder() -> EnvironmentBuilder {
        EnvironmentBuilder::new()
    }

    /// Open an environment with default options
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        EnvironmentBuilder::new().open(path)
    }

    /// Get environment flags
    pub fn flags(&self) -> EnvFlags {
        *self.inner.flags.read()
    }

    /// Set or clear flags after open. Only `NOSYNC` and `NOMETASYNC` may
    /// change.
    pub fn set_flags(&self, flags: EnvFlags, onoff: bool) -> Result<()> {
        if !CHANGEABLE.contains(flags) {
            return Err(Error::Incompatible);
        }

        let mut current = self.inner.flags.write();
        if onoff {
            *current |= flags;
        } else {
            *current &= !flags;
        }
        Ok(())
    }

    /// Get the path that was used in open()
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn max_readers(&self) -> u32 {
        self.inner.max_readers
    }

    pub fn max_dbs(&self) -> u32 {
        self.inner.max_dbs
    }

    pub fn max_key_size(&self) -> usize {
        self.inner.max_key_size
    }

    /// Get version
    pub fn version() -> (u32, u32, u32) {
        (VERSION_MAJOR, VERSION_MINOR, VERSION_PATCH)
    }

    /// Get version in String format
    pub fn version_string() -> String {
        format!("{}.{}.{}", VERSION_MAJOR, VERSION_MINOR, VERSION_PATCH)
    }

    /// Get environment information
    pub fn info(&self) -> Result<EnvInfo> {
        let state = self.inner.state.lock();
        let meta = MetaHeader::read(&state.map[..])?;
        let used = META_PAGES * PAGE_SIZE + meta.data_len as usize;

        Ok(EnvInfo {
            map_size: state.map_size,
            last_pgno: used.div_ceil(PAGE_SIZE).saturating_sub(1),
            last_txn_id: state.committed.txn_id,
            max_readers: self.inner.max_readers,
            num_readers: state.readers.num_readers(),
        })
    }

    /// Statistics for the root database as of the last commit
    pub fn stat(&self) -> Result<Stat> {
        let state = self.inner.state.lock();
        let entries = state
            .committed
            .dbs
            .get(ROOT_DB)
            .map_or(0, |tree| tree.len());
        Ok(Stat {
            psize: PAGE_SIZE as u32,
            entries,
        })
    }

    /// Occupied reader slots
    pub fn reader_list(&self) -> Vec<ReaderInfo> {
        self.inner.state.lock().readers.list()
    }

    /// Flush the map to disk
    ///
    /// With `NOSYNC` set nothing is flushed unless `force` is true.
    pub fn sync(&self, force: bool) -> Result<()> {
        if !force && self.flags().contains(EnvFlags::NOSYNC) {
            return Ok(());
        }
        let state = self.inner.state.lock();
        state.map.flush()?;
        Ok(())
    }

    /// Set the size of the memory map
    ///
    /// Must not be called while a transaction is active in this
    /// environment; `EnvBusy` is returned in that case. A size of zero
    /// adopts the size last recorded by any handle on the same file.
    pub fn set_map_size(&self, size: usize) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.active_txns > 0 {
            return Err(Error::EnvBusy);
        }

        let mut meta = MetaHeader::read(&state.map[..])?;
        let used = round_to_page(META_PAGES * PAGE_SIZE + meta.data_len as usize);
        let target = if size == 0 {
            (meta.mapsize as usize).max(state.map_size)
        } else {
            round_to_page(size)
        }
        .max(used);

        let file_len = self.inner.data_file.metadata()?.len() as usize;
        if target > file_len {
            self.inner.data_file.set_len(target as u64)?;
        }

        let old = state.map_size;
        state.map = map_file(&self.inner.data_file, target)?;
        state.map_size = target;
        if size != 0 || meta.mapsize as usize != target {
            meta.mapsize = target as u64;
            meta.write(&mut state.map[..])?;
            if !self.flags().contains(EnvFlags::NOMETASYNC) {
                state.map.flush_range(0, META_SIZE)?;
            }
        }

        debug!("map size {} -> {}", old, target);
        Ok(())
    }

    /// Begin a new transaction
    pub fn begin_txn(&self, flags: TransactionFlags) -> Result<Transaction> {
        Transaction::new(self.clone(), flags)
    }

    /// Begin a new read-only transaction
    pub fn begin_ro_txn(&self) -> Result<Transaction> {
        self.begin_txn(TransactionFlags::RDONLY)
    }

    /// Begin a new read-write transaction on the calling thread
    pub fn begin_rw_txn(&self) -> Result<Transaction> {
        self.begin_txn(TransactionFlags::empty())
    }

    /// Begin a write transaction owned by a dedicated worker thread
    pub fn begin_update(&self) -> Result<WriteTxn> {
        WriteTxn::begin(self.clone(), TransactionFlags::empty())
    }

    /// Run `f` in a transaction with `flags`. Read-write transactions are
    /// committed when `f` succeeds; everything else is aborted.
    pub fn run_txn<F>(&self, flags: TransactionFlags, f: F) -> Result<()>
    where
        F: FnOnce(&mut Transaction) -> Result<()>,
    {
        let mut txn = self.begin_txn(flags)?;
        match f(&mut txn) {
            Ok(()) if txn.is_readonly() => {
                txn.abort();
                Ok(())
            }
            Ok(()) => txn.commit(),
            Err(e) => {
                txn.abort();
                Err(e)
            }
        }
    }

    /// Run `f` in a read-only transaction
    pub fn view<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Transaction) -> Result<()>,
    {
        self.run_txn(TransactionFlags::RDONLY, f)
    }

    /// Run `f` in a read-write transaction and commit it
    pub fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Transaction) -> Result<()>,
    {
        self.run_txn(TransactionFlags::empty(), f)
    }

    // Internal transaction bookkeeping, called from Transaction

    /// Begin a reader: claims a slot and returns the current snapshot
    pub(crate) fn begin_reader(&self) -> Result<(Arc<Snapshot>, usize)> {
        let mut state = self.inner.state.lock();
        self.check_map(&mut state)?;
        let snapshot = state.committed.clone();
        let slot = state.readers.acquire(snapshot.txn_id)?;
        state.active_txns += 1;
        Ok((snapshot, slot))
    }

    /// Point a reset reader at the current snapshot
    pub(crate) fn renew_reader(&self, slot: usize) -> Result<Arc<Snapshot>> {
        let mut state = self.inner.state.lock();
        self.check_map(&mut state)?;
        let snapshot = state.committed.clone();
        state.readers.set(slot, snapshot.txn_id, ReaderStatus::Active);
        state.active_txns += 1;
        Ok(snapshot)
    }

    pub(crate) fn reset_reader(&self, slot: usize, txn_id: u64) {
        let mut state = self.inner.state.lock();
        state.readers.set(slot, txn_id, ReaderStatus::Inactive);
        state.active_txns -= 1;
    }

    pub(crate) fn release_reader(&self, slot: usize, active: bool) {
        let mut state = self.inner.state.lock();
        state.readers.release(slot);
        if active {
            state.active_txns -= 1;
        }
    }

    /// Begin a writer, waiting for the current one unless `NOLOCK` is set
    ///
    /// Without `NOLOCK` writers are serialized across every handle on the
    /// file: the writer slot of this handle is claimed first, then the lock
    /// file is locked exclusively, and only then is the committed state
    /// reloaded.
    pub(crate) fn begin_writer(&self) -> Result<Arc<Snapshot>> {
        let no_lock = self.flags().contains(EnvFlags::NOLOCK);
        let mut state = self.inner.state.lock();
        if no_lock {
            if state.write_active {
                return Err(Error::TxnInvalid);
            }
        } else {
            while state.write_active {
                self.inner.writer_done.wait(&mut state);
            }
        }
        state.write_active = true;

        if !no_lock {
            // Readers of this handle keep going while another handle writes
            drop(state);
            let locked = self.inner.lock_file.lock_exclusive();
            state = self.inner.state.lock();
            if let Err(e) = locked {
                self.release_writer(&mut state, false);
                return Err(e.into());
            }
        }

        if let Err(e) = self.check_map(&mut state) {
            self.release_writer(&mut state, !no_lock);
            return Err(e);
        }
        state.active_txns += 1;
        Ok(state.committed.clone())
    }

    /// Publish `snapshot` as the committed state
    ///
    /// The writer is released whether or not the commit succeeds.
    pub(crate) fn commit_writer(&self, snapshot: Snapshot) -> Result<()> {
        let mut state = self.inner.state.lock();
        let result = self.publish(&mut state, snapshot);
        self.finish_writer(&mut state);
        result
    }

    pub(crate) fn abort_writer(&self) {
        let mut state = self.inner.state.lock();
        self.finish_writer(&mut state);
    }

    fn publish(&self, state: &mut MutexGuard<'_, EnvState>, snapshot: Snapshot) -> Result<()> {
        let mut meta = MetaHeader::read(&state.map[..])?;
        if meta.last_txn_id + 1 != snapshot.txn_id {
            // Another handle committed since this writer began (NOLOCK)
            debug!(
                "refusing commit {}: last committed is {}",
                snapshot.txn_id, meta.last_txn_id
            );
            return Err(Error::BadTxn);
        }

        let data = snapshot.encode();
        let start = META_PAGES * PAGE_SIZE;
        if start + data.len() > state.map_size {
            return Err(Error::MapFull);
        }

        state.map[start..start + data.len()].copy_from_slice(&data);
        meta.last_txn_id = snapshot.txn_id;
        meta.data_len = data.len() as u64;
        meta.write(&mut state.map[..])?;

        let flags = self.flags();
        if !flags.contains(EnvFlags::NOSYNC) {
            state.map.flush_range(start, data.len())?;
        }
        if !flags.contains(EnvFlags::NOMETASYNC) {
            state.map.flush_range(0, META_SIZE)?;
        }

        state.committed = Arc::new(snapshot);
        Ok(())
    }

    fn finish_writer(&self, state: &mut MutexGuard<'_, EnvState>) {
        let no_lock = self.flags().contains(EnvFlags::NOLOCK);
        state.active_txns -= 1;
        self.release_writer(state, !no_lock);
    }

    fn release_writer(&self, state: &mut MutexGuard<'_, EnvState>, file_locked: bool) {
        if file_locked {
            if let Err(e) = FileExt::unlock(&self.inner.lock_file) {
                debug!("unlocking writer lock failed: {}", e);
            }
        }
        state.write_active = false;
        self.inner.writer_done.notify_one();
    }

    /// Detect a map resized by another handle and pick up commits made
    /// through other handles on the same file.
    fn check_map(&self, state: &mut MutexGuard<'_, EnvState>) -> Result<()> {
        let meta = MetaHeader::read(&state.map[..])?;
        if meta.mapsize as usize > state.map_size {
            return Err(Error::MapResized);
        }

        if meta.last_txn_id > state.committed.txn_id {
            let snapshot = Snapshot::decode(data_region(&state.map, &meta)?, meta.last_txn_id)?;
            debug!(
                "reloaded snapshot {} -> {}",
                state.committed.txn_id, meta.last_txn_id
            );
            state.committed = Arc::new(snapshot);
        }
        Ok(())
    }

    /// DBI for a database name, allocating one on first use
    pub(crate) fn dbi_for(&self, name: &str) -> u32 {
        let mut dbis = self.inner.dbis.lock();
        if let Some(dbi) = dbis.iter().position(|n| n == name) {
            return dbi as u32;
        }
        dbis.push(name.to_string());
        (dbis.len() - 1) as u32
    }

    pub(crate) fn db_name(&self, dbi: u32) -> Result<String> {
        self.inner
            .dbis
            .lock()
            .get(dbi as usize)
            .cloned()
            .ok_or(Error::BadDbi)
    }
}

fn round_to_page(size: usize) -> usize {
    size.div_ceil(PAGE_SIZE) * PAGE_SIZE
}

fn map_file(file: &File, len: usize) -> Result<MmapMut> {
    // SAFETY: the file is only written through this crate's maps, and every
    // access is bounds checked against `len`.
    let map = unsafe { MmapOptions::new().len(len).map_mut(file)? };
    Ok(map)
}

fn data_region<'a>(map: &'a MmapMut, meta: &MetaHeader) -> Result<&'a [u8]> {
    let start = META_PAGES * PAGE_SIZE;
    let end = start
        .checked_add(meta.data_len as usize)
        .ok_or(Error::Corrupted)?;
    map.get(start..end).ok_or(Error::Corrupted)
}
