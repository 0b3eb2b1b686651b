//! Transaction coordination for a memory-mapped key/value environment.
//!
//! [`Environment`] is a small LMDB-style engine: one writer at a time,
//! snapshot readers, and a fixed-size map that fails commits with
//! `MapFull` and signals `MapResized` when another handle grew the file.
//! [`sync::SyncEnv`] runs transactions so that resizes are safe and retries
//! failed ones through a chain of handlers. [`TxnPool`] recycles read-only
//! transactions without letting them pin stale snapshots.

mod constants;
mod database;
mod env;
mod error;
mod meta;
mod pool;
mod snapshot;
pub mod sync;
mod transaction;
mod writetxn;

pub use constants::*;
pub use database::Database;
pub use env::{EnvInfo, Environment, EnvironmentBuilder, Stat};
pub use error::{Error, Result};
pub use meta::{ReaderInfo, ReaderStatus};
pub use pool::TxnPool;
pub use transaction::{Transaction, TxnState};
pub use writetxn::WriteTxn;
