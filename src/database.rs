use crate::constants::{DbFlags, WriteFlags};
use crate::env::Stat;
use crate::error::Result;
use crate::transaction::Transaction;

/// Database handle
///
/// A DBI stays valid for the lifetime of the environment that issued it
/// and may be used from any transaction on that environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Database {
    /// Database identifier
    dbi: u32,
}

impl Database {
    pub(crate) fn new(dbi: u32) -> Self {
        Database { dbi }
    }

    /// Open a database in the environment
    pub fn open(txn: &mut Transaction, name: Option<&str>, flags: DbFlags) -> Result<Self> {
        txn.open_db(name, flags)
    }

    pub fn dbi(&self) -> u32 {
        self.dbi
    }

    /// Get database statistics
    pub fn stat(&self, txn: &Transaction) -> Result<Stat> {
        txn.stat(self)
    }

    /// Get a value by key
    pub fn get(&self, txn: &Transaction, key: &[u8]) -> Result<Vec<u8>> {
        txn.get(self, key)
    }

    /// Put a key/value pair
    pub fn put(
        &self,
        txn: &mut Transaction,
        key: &[u8],
        data: &[u8],
        flags: WriteFlags,
    ) -> Result<()> {
        txn.put(self, key, data, flags)
    }

    /// Delete a key/value pair
    pub fn del(&self, txn: &mut Transaction, key: &[u8]) -> Result<()> {
        txn.del(self, key)
    }

    /// Drop a database
    pub fn drop(&self, txn: &mut Transaction, del: bool) -> Result<()> {
        txn.drop_db(self, del)
    }
}
