use log::{debug, trace, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::constants::{TransactionFlags, UpdateHandling};
use crate::env::Environment;
use crate::error::{Error, Result};
use crate::transaction::Transaction;

/// Pool of read-only transactions reused through `reset` and `renew`.
///
/// Long-lived readers pin old snapshots. The pool tracks the id of the
/// last committed update (the watermark) and, depending on its
/// [`UpdateHandling`], discards or refreshes pooled readers older than it.
/// Updates should go through [`TxnPool::update`], or be reported with
/// [`TxnPool::commit_id`], for the watermark to be useful.
///
/// Dropping the pool aborts every idle transaction.
pub struct TxnPool {
    env: Environment,
    handling: AtomicU32,
    last_id: AtomicU64,
    idle_guard: AtomicBool,
    idle: Mutex<Vec<Transaction>>,
}

impl std::fmt::Debug for TxnPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxnPool")
            .field("update_handling", &self.update_handling())
            .field("last_id", &self.last_id())
            .field("idle", &self.idle_len())
            .finish()
    }
}

impl TxnPool {
    /// A pool that ignores updates
    pub fn new(env: Environment) -> Self {
        TxnPool {
            env,
            handling: AtomicU32::new(UpdateHandling::empty().bits()),
            last_id: AtomicU64::new(0),
            idle_guard: AtomicBool::new(false),
            idle: Mutex::new(Vec::new()),
        }
    }

    pub fn with_update_handling(self, handling: UpdateHandling) -> Self {
        self.set_update_handling(handling);
        self
    }

    pub fn update_handling(&self) -> UpdateHandling {
        UpdateHandling::from_bits_truncate(self.handling.load(Ordering::Acquire))
    }

    pub fn set_update_handling(&self, handling: UpdateHandling) {
        self.handling.store(handling.bits(), Ordering::Release);
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }

    /// The highest committed transaction id reported so far
    pub fn last_id(&self) -> u64 {
        self.last_id.load(Ordering::Acquire)
    }

    /// Number of reset transactions waiting to be reused
    pub fn idle_len(&self) -> usize {
        self.idle.lock().len()
    }

    /// Begin a transaction. Only exactly `RDONLY` is accepted, since only
    /// transactions with identical flags can be reused.
    pub fn begin_txn(&self, flags: TransactionFlags) -> Result<Transaction> {
        if flags != TransactionFlags::RDONLY {
            return Err(Error::Incompatible);
        }
        self.acquire()
    }

    /// Take a read-only transaction from the pool, or begin one
    pub fn acquire(&self) -> Result<Transaction> {
        let pooled = self.idle.lock().pop();
        let mut txn = match pooled {
            Some(txn) => txn,
            None => return self.env.begin_ro_txn(),
        };

        match txn.renew() {
            Ok(()) => {
                trace!("reusing pooled reader at txn {}", txn.id());
                Ok(txn)
            }
            Err(e) => {
                warn!("failed to renew pooled transaction: {}", e);
                txn.abort();
                self.env.begin_ro_txn()
            }
        }
    }

    /// Return a transaction obtained from `acquire`
    ///
    /// Read-write transactions are aborted. Readers older than the
    /// watermark are handled as `HANDLE_OUTSTANDING` directs; the rest are
    /// reset and kept for reuse.
    pub fn release(&self, mut txn: Transaction) {
        if !txn.is_readonly() {
            txn.abort();
            return;
        }

        if self.update_handling().contains(UpdateHandling::HANDLE_OUTSTANDING)
            && txn.id() < self.last_id()
        {
            txn = match self.handle_stale(txn) {
                Some(txn) => txn,
                None => return,
            };
        }

        if let Err(e) = txn.reset() {
            debug!("dropping unresettable reader: {}", e);
            return;
        }
        self.idle.lock().push(txn);
    }

    /// Report that the update `id` committed
    ///
    /// The watermark only moves forward. When it moves and `HANDLE_IDLE` is
    /// set, stale idle readers are swept before returning unless another
    /// caller is already sweeping.
    pub fn commit_id(&self, id: u64) {
        let mut last = self.last_id.load(Ordering::Acquire);
        let mut updated = false;
        while last < id {
            match self
                .last_id
                .compare_exchange_weak(last, id, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    updated = true;
                    break;
                }
                Err(current) => last = current,
            }
        }

        if updated && self.update_handling().contains(UpdateHandling::HANDLE_IDLE) {
            self.handle_idle();
        }
    }

    /// Abort every idle transaction
    pub fn drain(&self) {
        let idle = std::mem::take(&mut *self.idle.lock());
        if !idle.is_empty() {
            debug!("aborting {} pooled readers", idle.len());
        }
        for txn in idle {
            txn.abort();
        }
    }

    /// Alias for `drain`, releasing the pool's hold on the environment's
    /// reader slots
    pub fn close(&self) {
        self.drain();
    }

    /// Run `f` in a pooled read-only transaction
    pub fn view<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Transaction) -> Result<T>,
    {
        let mut txn = self.acquire()?;
        let result = f(&mut txn);
        self.release(txn);
        result
    }

    /// Run `f` in a read-write transaction and advance the watermark to it
    /// once it has committed
    pub fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Transaction) -> Result<()>,
    {
        let mut id = 0;
        self.env.update(|txn| {
            f(txn)?;
            id = txn.id();
            Ok(())
        })?;
        self.commit_id(id);
        Ok(())
    }

    /// Refresh a stale reader if `HANDLE_RENEW` is set, otherwise abort it.
    /// A refreshed reader is returned reset.
    fn handle_stale(&self, mut txn: Transaction) -> Option<Transaction> {
        if !self.update_handling().contains(UpdateHandling::HANDLE_RENEW) {
            txn.abort();
            return None;
        }

        let refreshed = txn.reset().and_then(|()| txn.renew()).and_then(|()| txn.reset());
        match refreshed {
            Ok(()) => Some(txn),
            Err(e) => {
                warn!("failed to renew pooled transaction: {}", e);
                txn.abort();
                None
            }
        }
    }

    fn handle_idle(&self) {
        if self
            .idle_guard
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let stale: Vec<Transaction> = {
            let mut idle = self.idle.lock();
            let last = self.last_id();
            let (stale, fresh): (Vec<Transaction>, Vec<Transaction>) = std::mem::take(&mut *idle)
                .into_iter()
                .partition(|txn| txn.id() < last);
            *idle = fresh;
            stale
        };

        let swept = stale.len();
        let kept: Vec<Transaction> = stale
            .into_iter()
            .filter_map(|txn| self.handle_stale(txn))
            .collect();
        if swept > 0 {
            trace!("idle sweep: {} stale, {} refreshed", swept, kept.len());
        }
        self.idle.lock().extend(kept);

        self.idle_guard.store(false, Ordering::Release);
    }
}

impl Drop for TxnPool {
    fn drop(&mut self) {
        self.drain();
    }
}
