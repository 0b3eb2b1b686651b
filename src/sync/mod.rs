//! Managed transactions that survive map resizing.
//!
//! [`SyncEnv`] wraps an [`Environment`] and runs caller supplied units of
//! work in transactions it owns. Each unit of work runs under a
//! readers-writer lock: ordinary transactions share it and a resize takes it
//! exclusively, so the map is never changed under a live transaction. When
//! a transaction fails, the error is given to a [`HandlerChain`] which may
//! fix the environment and ask for the whole unit of work to run again.
//!
//! Units of work may run more than once and must be idempotent. A unit of
//! work must not start another managed transaction on the same `SyncEnv`
//! while it holds one: a resize waiting for the exclusive lock would then
//! deadlock with it.

mod bag;
mod handler;

pub use bag::{Bag, BagKey};
pub use handler::{
    default_delay, exponential_backoff, DelayFn, Handler, HandlerChain, MapFullFn,
    MapFullHandler, MapResizedHandler,
};

use log::{debug, trace};
use parking_lot::RwLock;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::constants::{EnvFlags, TransactionFlags};
use crate::env::{EnvInfo, Environment};
use crate::error::{Error, Result};
use crate::transaction::Transaction;

/// Bag key under which a managed call exposes its [`SyncEnv`] to handlers
pub struct EnvKey;

impl BagKey for EnvKey {
    type Value = SyncEnv;
}

/// Something that runs units of work in managed transactions
pub trait TxnRunner {
    /// Run `f` in a transaction opened with `flags`, retrying it as the
    /// handlers direct. Read-write transactions commit when `f` succeeds.
    fn run_txn<F>(&self, flags: TransactionFlags, f: F) -> Result<()>
    where
        F: FnMut(&mut Transaction) -> Result<()>;

    /// Run `f` in a read-only transaction
    fn view<F>(&self, f: F) -> Result<()>
    where
        F: FnMut(&mut Transaction) -> Result<()>,
    {
        self.run_txn(TransactionFlags::RDONLY, f)
    }

    /// Run `f` in a read-write transaction and commit it
    fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnMut(&mut Transaction) -> Result<()>,
    {
        self.run_txn(TransactionFlags::empty(), f)
    }

    /// Run `f` in a read-write transaction on the calling thread
    ///
    /// Every attempt runs on the caller's thread, so `f` may use thread
    /// local state. The engine has no thread affinity for writers, so this
    /// currently behaves exactly like `update`.
    fn update_locked<F>(&self, f: F) -> Result<()>
    where
        F: FnMut(&mut Transaction) -> Result<()>,
    {
        self.run_txn(TransactionFlags::empty(), f)
    }

    /// A runner that also applies `h` after the handlers of `self`
    fn with_handler<H: Handler + 'static>(&self, h: H) -> HandlerRunner;
}

/// Environment wrapper coordinating managed transactions with resizes
///
/// Cloning is cheap; clones share the lock and the handler chain.
#[derive(Clone)]
pub struct SyncEnv {
    inner: Arc<SyncInner>,
}

struct SyncInner {
    env: Environment,
    handlers: HandlerChain,
    /// Set when the environment does no locking of its own
    no_lock: bool,
    txn_lock: RwLock<()>,
}

impl std::fmt::Debug for SyncEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEnv")
            .field("env", &self.inner.env)
            .field("handlers", &self.inner.handlers)
            .field("no_lock", &self.inner.no_lock)
            .finish()
    }
}

impl SyncEnv {
    /// Wrap `env`, applying `handlers` in order to failed transactions
    pub fn new<I>(env: Environment, handlers: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn Handler>>,
    {
        let no_lock = env.flags().contains(EnvFlags::NOLOCK);
        let handlers: HandlerChain = handlers.into_iter().collect();
        debug!(
            "sync env over {} no_lock={} handlers={}",
            env.path().display(),
            no_lock,
            handlers.len()
        );
        SyncEnv {
            inner: Arc::new(SyncInner {
                env,
                handlers,
                no_lock,
                txn_lock: RwLock::new(()),
            }),
        }
    }

    /// The wrapped environment
    pub fn env(&self) -> &Environment {
        &self.inner.env
    }

    /// Handlers applied to every managed call
    pub fn handlers(&self) -> &HandlerChain {
        &self.inner.handlers
    }

    /// True when writes are serialized here instead of by the environment
    pub fn is_no_lock(&self) -> bool {
        self.inner.no_lock
    }

    pub fn info(&self) -> Result<EnvInfo> {
        self.inner.env.info()
    }

    /// Set the map size once no managed transaction is running
    ///
    /// A size of zero adopts the size recorded by other handles on the same
    /// file. Must not be called from inside a managed transaction.
    pub fn set_map_size(&self, size: usize) -> Result<()> {
        self.resize(size, Duration::ZERO)
    }

    /// Like `set_map_size`, but waits `delay` after taking the exclusive
    /// lock and before applying the size.
    pub fn resize(&self, size: usize, delay: Duration) -> Result<()> {
        let _guard = self.inner.txn_lock.write();
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        self.inner.env.set_map_size(size)
    }

    /// Transactions on a `SyncEnv` are only available through `run_txn`
    /// and friends; a manually managed handle could not be coordinated with
    /// resizes.
    pub fn begin_txn(&self, _flags: TransactionFlags) -> Result<Transaction> {
        Err(Error::UnmanagedTxn)
    }

    fn run_handler<F>(&self, flags: TransactionFlags, mut f: F, handler: &dyn Handler) -> Result<()>
    where
        F: FnMut(&mut Transaction) -> Result<()>,
    {
        let mut bag = Bag::background().with::<EnvKey>(self.clone());
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            // The lock is released before the handler runs; handlers may
            // need it exclusively.
            let err = match self.run(flags, &mut f) {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            trace!("attempt {} failed: {}", attempt, err);

            let (next, result) = handler.handle_txn_err(bag, err);
            bag = next;
            match result {
                Err(e) if e.is_retry() => debug!("retrying transaction after attempt {}", attempt),
                other => return other,
            }
        }
    }

    fn run<F>(&self, flags: TransactionFlags, f: &mut F) -> Result<()>
    where
        F: FnMut(&mut Transaction) -> Result<()>,
    {
        if self.inner.no_lock && !flags.contains(TransactionFlags::RDONLY) {
            let _guard = self.inner.txn_lock.write();
            self.inner.env.run_txn(flags, |txn| f(txn))
        } else {
            let _guard = self.inner.txn_lock.read();
            self.inner.env.run_txn(flags, |txn| f(txn))
        }
    }
}

impl TxnRunner for SyncEnv {
    fn run_txn<F>(&self, flags: TransactionFlags, f: F) -> Result<()>
    where
        F: FnMut(&mut Transaction) -> Result<()>,
    {
        self.run_handler(flags, f, &self.inner.handlers)
    }

    fn with_handler<H: Handler + 'static>(&self, h: H) -> HandlerRunner {
        HandlerRunner {
            env: self.clone(),
            handlers: self.inner.handlers.append(h),
        }
    }
}

/// A [`SyncEnv`] paired with a handler chain of its own
///
/// Returned by [`TxnRunner::with_handler`]; the environment's own chain is
/// unaffected.
#[derive(Clone, Debug)]
pub struct HandlerRunner {
    env: SyncEnv,
    handlers: HandlerChain,
}

impl HandlerRunner {
    pub fn env(&self) -> &SyncEnv {
        &self.env
    }

    pub fn handlers(&self) -> &HandlerChain {
        &self.handlers
    }
}

impl TxnRunner for HandlerRunner {
    fn run_txn<F>(&self, flags: TransactionFlags, f: F) -> Result<()>
    where
        F: FnMut(&mut Transaction) -> Result<()>,
    {
        self.env.run_handler(flags, f, &self.handlers)
    }

    fn with_handler<H: Handler + 'static>(&self, h: H) -> HandlerRunner {
        HandlerRunner {
            env: self.env.clone(),
            handlers: self.handlers.append(h),
        }
    }
}
