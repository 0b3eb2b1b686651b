use log::trace;
use std::sync::Arc;

use crate::constants::{DbFlags, TransactionFlags, WriteFlags, MAX_VAL_SIZE};
use crate::database::Database;
use crate::env::{Environment, Stat};
use crate::error::{Error, Result};
use crate::snapshot::{Snapshot, Tree, ROOT_DB};

/// Lifecycle state of a transaction handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    /// Usable for reads (and writes, for read-write transactions)
    Active,
    /// Read-only handle that released its snapshot; only `renew` is allowed
    Reset,
    /// Committed or aborted; the handle can no longer be used
    Terminated,
}

/// Database transaction
///
/// Dropping a transaction that was neither committed nor aborted aborts it,
/// so reader slots and the write lock are released on every exit path.
#[derive(Debug)]
pub struct Transaction {
    /// Environment the transaction belongs to
    env: Environment,
    /// Transaction flags
    flags: TransactionFlags,
    /// Transaction ID
    txn_id: u64,
    /// Snapshot a reader observes; `None` while reset
    snapshot: Option<Arc<Snapshot>>,
    /// Uncommitted state of a writer
    working: Option<Snapshot>,
    /// Reader lock table slot
    reader_slot: Option<usize>,
}

impl Transaction {
    pub(crate) fn new(env: Environment, flags: TransactionFlags) -> Result<Self> {
        let flags = flags & TransactionFlags::RDONLY;

        if flags.contains(TransactionFlags::RDONLY) {
            let (snapshot, slot) = env.begin_reader()?;
            Ok(Transaction {
                env,
                flags,
                txn_id: snapshot.txn_id,
                snapshot: Some(snapshot),
                working: None,
                reader_slot: Some(slot),
            })
        } else {
            let committed = env.begin_writer()?;
            let mut working = (*committed).clone();
            working.txn_id = committed.txn_id + 1;
            Ok(Transaction {
                env,
                flags,
                txn_id: working.txn_id,
                snapshot: None,
                working: Some(working),
                reader_slot: None,
            })
        }
    }

    /// Get transaction ID
    ///
    /// For readers this is the id of the snapshot being read; for writers
    /// the id the transaction commits under.
    pub fn id(&self) -> u64 {
        self.txn_id
    }

    /// Get reference to environment
    pub fn env(&self) -> &Environment {
        &self.env
    }

    pub fn is_readonly(&self) -> bool {
        self.flags.contains(TransactionFlags::RDONLY)
    }

    pub fn is_finished(&self) -> bool {
        self.flags.contains(TransactionFlags::FINISHED)
    }

    pub fn is_reset(&self) -> bool {
        self.flags.contains(TransactionFlags::RESET)
    }

    pub fn state(&self) -> TxnState {
        if self.is_finished() {
            TxnState::Terminated
        } else if self.is_reset() {
            TxnState::Reset
        } else {
            TxnState::Active
        }
    }

    /// Open a database. `None` names the root database.
    pub fn open_db(&mut self, name: Option<&str>, flags: DbFlags) -> Result<Database> {
        self.check_state()?;
        let name = match name {
            None => return Ok(Database::new(self.env.dbi_for(ROOT_DB))),
            Some("") => return Err(Error::BadValSize),
            Some(name) => name,
        };

        if !self.view()?.dbs.contains_key(name) {
            if !flags.contains(DbFlags::CREATE) {
                return Err(Error::NotFound);
            }
            let max_dbs = self.env.max_dbs() as usize;
            let working = self.working.as_mut().ok_or(Error::TxnReadOnly)?;
            if working.named_dbs() >= max_dbs {
                return Err(Error::DbsFull);
            }
            working.dbs.insert(name.to_string(), Arc::new(Tree::new()));
        }

        Ok(Database::new(self.env.dbi_for(name)))
    }

    /// Get a value by key
    pub fn get(&self, db: &Database, key: &[u8]) -> Result<Vec<u8>> {
        self.check_state()?;
        let name = self.env.db_name(db.dbi())?;
        self.view()?
            .dbs
            .get(&name)
            .and_then(|tree| tree.get(key))
            .cloned()
            .ok_or(Error::NotFound)
    }

    /// Put a key/value pair
    pub fn put(
        &mut self,
        db: &Database,
        key: &[u8],
        data: &[u8],
        flags: WriteFlags,
    ) -> Result<()> {
        self.check_state()?;
        if key.is_empty() || key.len() > self.env.max_key_size() {
            return Err(Error::BadValSize);
        }
        // Lengths are stored as u32 on the map
        if data.len() > MAX_VAL_SIZE {
            return Err(Error::BadValSize);
        }

        let tree = self.tree_mut(db)?;
        if flags.contains(WriteFlags::NOOVERWRITE) && tree.contains_key(key) {
            return Err(Error::KeyExist);
        }
        tree.insert(key.to_vec(), data.to_vec());
        Ok(())
    }

    /// Delete a key/value pair
    pub fn del(&mut self, db: &Database, key: &[u8]) -> Result<()> {
        self.check_state()?;
        self.tree_mut(db)?
            .remove(key)
            .map(|_| ())
            .ok_or(Error::NotFound)
    }

    /// Empty a database, or remove it entirely when `del` is true. The root
    /// database can only be emptied.
    pub fn drop_db(&mut self, db: &Database, del: bool) -> Result<()> {
        self.check_state()?;
        let name = self.env.db_name(db.dbi())?;
        let working = self.working.as_mut().ok_or(Error::TxnReadOnly)?;
        if del && name != ROOT_DB {
            working.dbs.remove(&name).ok_or(Error::NotFound)?;
        } else {
            let tree = working.dbs.get_mut(&name).ok_or(Error::NotFound)?;
            *tree = Arc::new(Tree::new());
        }
        Ok(())
    }

    /// Get database statistics
    pub fn stat(&self, db: &Database) -> Result<Stat> {
        self.check_state()?;
        let name = self.env.db_name(db.dbi())?;
        let tree = self.view()?.dbs.get(&name).ok_or(Error::NotFound)?;
        Ok(Stat {
            psize: crate::constants::PAGE_SIZE as u32,
            entries: tree.len(),
        })
    }

    /// Commit the transaction
    ///
    /// Committing a read-only transaction releases it like `abort`.
    pub fn commit(mut self) -> Result<()> {
        if self.is_finished() {
            return Err(Error::TxnInvalid);
        }
        if self.is_readonly() {
            self.terminate();
            return Ok(());
        }

        let working = self.working.take().ok_or(Error::TxnInvalid)?;
        self.flags |= TransactionFlags::FINISHED;
        self.env.commit_writer(working)
    }

    /// Abort the transaction
    pub fn abort(mut self) {
        self.terminate();
    }

    /// Release the snapshot of a read-only transaction while keeping its
    /// reader slot. The handle can be reactivated with `renew`.
    pub fn reset(&mut self) -> Result<()> {
        if self.is_finished() {
            return Err(Error::TxnInvalid);
        }
        if !self.is_readonly() {
            return Err(Error::BadTxn);
        }
        if self.is_reset() {
            return Ok(());
        }

        self.snapshot = None;
        self.flags |= TransactionFlags::RESET;
        if let Some(slot) = self.reader_slot {
            self.env.reset_reader(slot, self.txn_id);
        }
        Ok(())
    }

    /// Reactivate a reset transaction against the current snapshot
    pub fn renew(&mut self) -> Result<()> {
        if self.is_finished() {
            return Err(Error::TxnInvalid);
        }
        if !self.is_reset() {
            return Err(Error::BadTxn);
        }
        let slot = self.reader_slot.ok_or(Error::BadTxn)?;

        let snapshot = self.env.renew_reader(slot)?;
        trace!("renewed reader {} -> {}", self.txn_id, snapshot.txn_id);
        self.txn_id = snapshot.txn_id;
        self.snapshot = Some(snapshot);
        self.flags.remove(TransactionFlags::RESET);
        Ok(())
    }

    fn check_state(&self) -> Result<()> {
        if self.is_finished() {
            return Err(Error::TxnInvalid);
        }
        if self.is_reset() {
            return Err(Error::BadTxn);
        }
        Ok(())
    }

    fn view(&self) -> Result<&Snapshot> {
        match (&self.snapshot, &self.working) {
            (Some(snapshot), _) => Ok(snapshot),
            (None, Some(working)) => Ok(working),
            (None, None) => Err(Error::BadTxn),
        }
    }

    fn tree_mut(&mut self, db: &Database) -> Result<&mut Tree> {
        let name = self.env.db_name(db.dbi())?;
        let working = self.working.as_mut().ok_or(Error::TxnReadOnly)?;
        let tree = working.dbs.get_mut(&name).ok_or(Error::NotFound)?;
        Ok(Arc::make_mut(tree))
    }

    /// Release everything held by the transaction
    fn terminate(&mut self) {
        if self.is_finished() {
            return;
        }
        self.flags |= TransactionFlags::FINISHED;

        if let Some(slot) = self.reader_slot.take() {
            let active = !self.is_reset();
            self.snapshot = None;
            self.env.release_reader(slot, active);
        } else if self.working.take().is_some() {
            self.env.abort_writer();
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.terminate();
    }
}
