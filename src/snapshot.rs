use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{Error, Result};

/// Sorted key/value pairs of one database
pub(crate) type Tree = BTreeMap<Vec<u8>, Vec<u8>>;

/// Name under which the unnamed root database is stored
pub(crate) const ROOT_DB: &str = "";

/// Committed database state at one transaction id
///
/// Snapshots are immutable once published. Readers hold an `Arc` to the
/// snapshot they began on; a writer clones the `Arc`s of the trees and
/// copies a tree only when it first modifies it.
#[derive(Debug, Clone)]
pub(crate) struct Snapshot {
    pub(crate) txn_id: u64,
    pub(crate) dbs: BTreeMap<String, Arc<Tree>>,
}

impl Snapshot {
    pub(crate) fn empty() -> Self {
        let mut dbs = BTreeMap::new();
        dbs.insert(ROOT_DB.to_string(), Arc::new(Tree::new()));
        Self { txn_id: 0, dbs }
    }

    /// Number of named databases (the root db is not counted)
    pub(crate) fn named_dbs(&self) -> usize {
        self.dbs.keys().filter(|name| !name.is_empty()).count()
    }

    /// Encode all databases for storage after the meta page
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.extend_from_slice(&(self.dbs.len() as u32).to_le_bytes());
        for (name, tree) in &self.dbs {
            buf.extend_from_slice(&(name.len() as u32).to_le_bytes());
            buf.extend_from_slice(name.as_bytes());
            buf.extend_from_slice(&(tree.len() as u64).to_le_bytes());
            for (key, val) in tree.iter() {
                buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
                buf.extend_from_slice(&(val.len() as u32).to_le_bytes());
                buf.extend_from_slice(key);
                buf.extend_from_slice(val);
            }
        }
        buf
    }

    pub(crate) fn encoded_len(&self) -> usize {
        let mut len = 4;
        for (name, tree) in &self.dbs {
            len += 4 + name.len() + 8;
            len += tree
                .iter()
                .map(|(k, v)| 8 + k.len() + v.len())
                .sum::<usize>();
        }
        len
    }

    /// Decode state written by `encode`
    pub(crate) fn decode(buf: &[u8], txn_id: u64) -> Result<Self> {
        if buf.is_empty() {
            let mut snap = Self::empty();
            snap.txn_id = txn_id;
            return Ok(snap);
        }

        let mut reader = Reader { buf, pos: 0 };
        let ndbs = reader.u32()?;
        let mut dbs = BTreeMap::new();
        for _ in 0..ndbs {
            let name_len = reader.u32()? as usize;
            let name = String::from_utf8(reader.bytes(name_len)?.to_vec())
                .map_err(|_| Error::Corrupted)?;
            let entries = reader.u64()?;
            let mut tree = Tree::new();
            for _ in 0..entries {
                let klen = reader.u32()? as usize;
                let vlen = reader.u32()? as usize;
                let key = reader.bytes(klen)?.to_vec();
                let val = reader.bytes(vlen)?.to_vec();
                tree.insert(key, val);
            }
            dbs.insert(name, Arc::new(tree));
        }
        dbs.entry(ROOT_DB.to_string())
            .or_insert_with(|| Arc::new(Tree::new()));

        Ok(Self { txn_id, dbs })
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or(Error::Corrupted)?;
        let out = self.buf.get(self.pos..end).ok_or(Error::Corrupted)?;
        self.pos = end;
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32> {
        let mut b = [0u8; 4];
        b.copy_from_slice(self.bytes(4)?);
        Ok(u32::from_le_bytes(b))
    }

    fn u64(&mut self) -> Result<u64> {
        let mut b = [0u8; 8];
        b.copy_from_slice(self.bytes(8)?);
        Ok(u64::from_le_bytes(b))
    }
}
