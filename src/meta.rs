use crate::constants::{MDB_MAGIC, MDB_VERSION, PAGE_SIZE};
use crate::error::{Error, Result};

/// Encoded length of the meta header
pub(crate) const META_SIZE: usize = 40;

/// Meta header stored at the front of the map
///
/// Every handle on the same file sees writes to this header through the
/// shared mapping, which is how a resize or a commit made by one handle
/// becomes visible to the others.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MetaHeader {
    /// Magic number identifying the data file
    pub(crate) magic: u32,
    /// Format version
    pub(crate) version: u32,
    /// Page size the file was created with
    pub(crate) page_size: u32,
    /// Reserved
    pub(crate) flags: u32,
    /// Size of the mmap region last set by any handle
    pub(crate) mapsize: u64,
    /// txnid of the last commit
    pub(crate) last_txn_id: u64,
    /// Bytes of encoded data following the meta page
    pub(crate) data_len: u64,
}

impl MetaHeader {
    pub(crate) fn new(mapsize: usize) -> Self {
        Self {
            mapsize: mapsize as u64,
            ..Self::default()
        }
    }

    /// Read and validate the header at the front of `buf`
    pub(crate) fn read(buf: &[u8]) -> Result<Self> {
        if buf.len() < META_SIZE {
            return Err(Error::Invalid);
        }

        let meta = Self {
            magic: read_u32(buf, 0),
            version: read_u32(buf, 4),
            page_size: read_u32(buf, 8),
            flags: read_u32(buf, 12),
            mapsize: read_u64(buf, 16),
            last_txn_id: read_u64(buf, 24),
            data_len: read_u64(buf, 32),
        };

        if meta.magic != MDB_MAGIC {
            return Err(Error::Invalid);
        }
        if meta.version != MDB_VERSION {
            return Err(Error::VersionMismatch);
        }
        if meta.page_size as usize != PAGE_SIZE {
            return Err(Error::Incompatible);
        }

        Ok(meta)
    }

    /// Write the header to the front of `buf`
    pub(crate) fn write(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < META_SIZE {
            return Err(Error::EnvInvalidMapSize);
        }

        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.page_size.to_le_bytes());
        buf[12..16].copy_from_slice(&self.flags.to_le_bytes());
        buf[16..24].copy_from_slice(&self.mapsize.to_le_bytes());
        buf[24..32].copy_from_slice(&self.last_txn_id.to_le_bytes());
        buf[32..40].copy_from_slice(&self.data_len.to_le_bytes());
        Ok(())
    }
}

impl Default for MetaHeader {
    fn default() -> Self {
        Self {
            magic: MDB_MAGIC,
            version: MDB_VERSION,
            page_size: PAGE_SIZE as u32,
            flags: 0,
            mapsize: 0,
            last_txn_id: 0,
            data_len: 0,
        }
    }
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(bytes)
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}

/// Reader slot state, as reported by `Environment::reader_list`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderStatus {
    /// Slot holds a live snapshot
    Active,
    /// Slot is held by a reset transaction
    Inactive,
}

/// Reader info
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderInfo {
    /// Process ID
    pub pid: u32,
    /// Transaction ID being read
    pub txn_id: u64,
    /// Reader lock status
    pub status: ReaderStatus,
}

/// Reader lock table
#[derive(Debug)]
pub(crate) struct ReaderTable {
    /// Array of reader slots; `None` is free
    slots: Vec<Option<ReaderInfo>>,
}

impl ReaderTable {
    pub(crate) fn new(max_readers: u32) -> Self {
        Self {
            slots: vec![None; max_readers as usize],
        }
    }

    /// Claim a free slot for a reader at `txn_id`
    pub(crate) fn acquire(&mut self, txn_id: u64) -> Result<usize> {
        let slot = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(Error::ReadersFull)?;
        self.slots[slot] = Some(ReaderInfo {
            pid: std::process::id(),
            txn_id,
            status: ReaderStatus::Active,
        });
        Ok(slot)
    }

    pub(crate) fn set(&mut self, slot: usize, txn_id: u64, status: ReaderStatus) {
        if let Some(Some(info)) = self.slots.get_mut(slot) {
            info.txn_id = txn_id;
            info.status = status;
        }
    }

    pub(crate) fn release(&mut self, slot: usize) {
        if let Some(entry) = self.slots.get_mut(slot) {
            *entry = None;
        }
    }

    pub(crate) fn num_readers(&self) -> u32 {
        self.slots.iter().filter(|s| s.is_some()).count() as u32
    }

    pub(crate) fn list(&self) -> Vec<ReaderInfo> {
        self.slots.iter().flatten().copied().collect()
    }
}
