use log::debug;
use once_cell::sync::Lazy;
use rand::Rng;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::bag::{Bag, BagKey};
use super::EnvKey;
use crate::constants::MAP_RESIZED_DEFAULT_RETRY;
use crate::error::{Error, Result};

/// Handler can intercept errors returned by a transaction and handle them in
/// an application-specific way, including by resizing the environment and
/// retrying the transaction by returning [`Error::TxnRetry`].
///
/// A handler returns `Ok(())` to resolve the error, `Err(Error::TxnRetry)` to
/// have the whole transaction run again, or any other error to pass it on.
pub trait Handler: Send + Sync {
    fn handle_txn_err(&self, bag: Bag, err: Error) -> (Bag, Result<()>);
}

impl<F> Handler for F
where
    F: Fn(Bag, Error) -> (Bag, Result<()>) + Send + Sync,
{
    fn handle_txn_err(&self, bag: Bag, err: Error) -> (Bag, Result<()>) {
        self(bag, err)
    }
}

/// Ordered handlers applied one after another.
///
/// Each handler sees the bag and error produced by the one before it. The
/// chain stops at the first handler that resolves the error or asks for a
/// retry; otherwise the error left by the last handler is the result.
///
/// Chains are immutable. `append` returns a new chain and leaves the
/// receiver untouched, so call sites can derive their own variants from a
/// shared base.
#[derive(Clone)]
pub struct HandlerChain {
    handlers: Arc<[Arc<dyn Handler>]>,
}

impl Default for HandlerChain {
    fn default() -> Self {
        Self {
            handlers: Arc::from(Vec::new()),
        }
    }
}

impl HandlerChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new chain evaluating `h` after the handlers already in `self`
    pub fn append<H: Handler + 'static>(&self, h: H) -> Self {
        self.extend([Arc::new(h) as Arc<dyn Handler>])
    }

    /// A new chain evaluating `hs` in order after the handlers in `self`
    pub fn extend<I>(&self, hs: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn Handler>>,
    {
        let handlers: Vec<Arc<dyn Handler>> =
            self.handlers.iter().cloned().chain(hs).collect();
        Self {
            handlers: handlers.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl FromIterator<Arc<dyn Handler>> for HandlerChain {
    fn from_iter<I: IntoIterator<Item = Arc<dyn Handler>>>(iter: I) -> Self {
        Self {
            handlers: iter.into_iter().collect::<Vec<_>>().into(),
        }
    }
}

impl fmt::Debug for HandlerChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerChain")
            .field("len", &self.handlers.len())
            .finish()
    }
}

impl Handler for HandlerChain {
    fn handle_txn_err(&self, mut bag: Bag, mut err: Error) -> (Bag, Result<()>) {
        for h in self.handlers.iter() {
            let (next, result) = h.handle_txn_err(bag, err);
            bag = next;
            match result {
                Ok(()) => return (bag, Ok(())),
                Err(e) if e.is_retry() => return (bag, Err(e)),
                Err(e) => err = e,
            }
        }
        (bag, Err(err))
    }
}

/// Computes a new map size from the current one. The new size is applied
/// only when the flag is true and the size grew.
pub type MapFullFn = Arc<dyn Fn(usize) -> (usize, bool) + Send + Sync>;

/// Retries updates which failed to commit because the map was full, after
/// growing the map.
///
/// Transactions run under this handler may execute more than once and must
/// be idempotent. Open read transactions must not wait on updates or the
/// environment will deadlock.
pub struct MapFullHandler {
    grow: MapFullFn,
}

impl MapFullHandler {
    pub fn new<F>(grow: F) -> Self
    where
        F: Fn(usize) -> (usize, bool) + Send + Sync + 'static,
    {
        Self {
            grow: Arc::new(grow),
        }
    }

    /// Grow by doubling, without an upper bound
    pub fn doubling() -> Self {
        Self::new(|size| (size.saturating_mul(2), true))
    }
}

impl Handler for MapFullHandler {
    fn handle_txn_err(&self, bag: Bag, err: Error) -> (Bag, Result<()>) {
        if !err.is_map_full() {
            return (bag, Err(err));
        }
        let env = match bag.get::<EnvKey>() {
            Some(env) => env.clone(),
            None => return (bag, Err(err)),
        };

        let current = match env.env().info() {
            Ok(info) => info.map_size,
            Err(_) => return (bag, Err(err)),
        };
        let (size, ok) = (self.grow)(current);
        if !ok || size <= current {
            return (bag, Err(err));
        }
        if let Err(e) = env.set_map_size(size) {
            debug!("map full: resize to {} failed: {}", size, e);
            return (bag, Err(err));
        }

        debug!("map full: grew map {} -> {}, retrying", current, size);
        (bag, Err(Error::TxnRetry))
    }
}

/// Takes the number of previous attempts and returns the delay before
/// making another.
pub type DelayFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// A delay drawn uniformly from `[0, min(max, base * factor^attempt))`
pub fn exponential_backoff(base: Duration, max: Duration, factor: f64) -> DelayFn {
    Arc::new(move |attempt| {
        let cap = (base.as_nanos() as f64 * factor.powi(attempt as i32)).min(max.as_nanos() as f64);
        if cap < 1.0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(rand::thread_rng().gen_range(0..cap as u64))
    })
}

static MAP_RESIZED_DEFAULT_DELAY: Lazy<DelayFn> =
    Lazy::new(|| exponential_backoff(Duration::from_millis(1), Duration::from_millis(5), 2.0));

/// The delay used by a `MapResizedHandler` constructed without one
pub fn default_delay() -> DelayFn {
    MAP_RESIZED_DEFAULT_DELAY.clone()
}

/// Consecutive `MapResized` failures of one managed call
struct ResizedRetryCount;

impl BagKey for ResizedRetryCount {
    type Value = u32;
}

/// Adopts map sizes set by other processes and retries transactions that
/// failed to start with `MapResized`.
///
/// If `max_retry` consecutive attempts of the same call fail this way the
/// handler gives up and returns `MapResized`. A `max_retry` of zero or less
/// retries indefinitely. The count lives in the bag, so concurrent calls do
/// not share it.
pub struct MapResizedHandler {
    max_retry: i32,
    delay: DelayFn,
}

impl MapResizedHandler {
    pub fn new(max_retry: i32, delay: Option<DelayFn>) -> Self {
        Self {
            max_retry,
            delay: delay.unwrap_or_else(default_delay),
        }
    }

    pub fn max_retry(&self) -> i32 {
        self.max_retry
    }
}

impl Default for MapResizedHandler {
    fn default() -> Self {
        Self::new(MAP_RESIZED_DEFAULT_RETRY, None)
    }
}

impl Handler for MapResizedHandler {
    fn handle_txn_err(&self, bag: Bag, err: Error) -> (Bag, Result<()>) {
        if !err.is_map_resized() {
            return (bag.without::<ResizedRetryCount>(), Err(err));
        }

        let count = bag.get::<ResizedRetryCount>().copied().unwrap_or(0);
        if self.max_retry > 0 && count >= self.max_retry as u32 {
            return (bag.without::<ResizedRetryCount>(), Err(err));
        }
        let bag = bag.with::<ResizedRetryCount>(count + 1);

        let env = match bag.get::<EnvKey>() {
            Some(env) => env.clone(),
            None => return (bag, Err(err)),
        };
        let delay = (self.delay)(count);
        if let Err(e) = env.resize(0, delay) {
            return (bag, Err(e));
        }

        debug!("map resized: adopted new size after {:?}, retry {}", delay, count + 1);
        (bag, Err(Error::TxnRetry))
    }
}
