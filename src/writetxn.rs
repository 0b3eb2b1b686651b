use log::debug;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::thread;

use crate::constants::TransactionFlags;
use crate::env::Environment;
use crate::error::{Error, Result};
use crate::transaction::Transaction;

type TxnOp = Box<dyn FnOnce(&mut Transaction) -> Result<()> + Send>;

enum Request {
    Op(TxnOp, Sender<Result<()>>),
    Commit(Sender<Result<()>>),
    Abort(Sender<()>),
}

/// A write transaction owned by a dedicated worker thread.
///
/// Operations submitted through any clone of a `WriteTxn` run one at a time
/// on the worker, so the handle may be shared between threads without the
/// callers having to agree on which thread touches the transaction. The
/// transaction is aborted when the last handle is dropped without a commit.
#[derive(Clone)]
pub struct WriteTxn {
    id: u64,
    requests: Sender<Request>,
}

impl std::fmt::Debug for WriteTxn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteTxn").field("id", &self.id).finish()
    }
}

impl WriteTxn {
    pub(crate) fn begin(env: Environment, flags: TransactionFlags) -> Result<Self> {
        let (requests, inbox) = channel();
        let (ready_tx, ready_rx) = channel();

        thread::Builder::new()
            .name("lumosync-writer".into())
            .spawn(move || match Transaction::new(env, flags) {
                Ok(txn) => {
                    let _ = ready_tx.send(Ok(txn.id()));
                    serve(txn, inbox);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })?;

        let id = ready_rx.recv().map_err(|_| Error::WriteTxnClosed)??;
        debug!("write txn {} started on worker", id);
        Ok(WriteTxn { id, requests })
    }

    /// Get transaction ID
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Execute `f` against the transaction on the worker thread
    pub fn run<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Transaction) -> Result<()> + Send + 'static,
    {
        let (reply, result) = channel();
        self.requests
            .send(Request::Op(Box::new(f), reply))
            .map_err(|_| Error::WriteTxnClosed)?;
        result.recv().map_err(|_| Error::WriteTxnClosed)?
    }

    /// Commit the transaction and stop the worker
    pub fn commit(&self) -> Result<()> {
        let (reply, result) = channel();
        self.requests
            .send(Request::Commit(reply))
            .map_err(|_| Error::WriteTxnClosed)?;
        result.recv().map_err(|_| Error::WriteTxnClosed)?
    }

    /// Abort the transaction and stop the worker
    pub fn abort(&self) -> Result<()> {
        let (reply, done) = channel();
        self.requests
            .send(Request::Abort(reply))
            .map_err(|_| Error::WriteTxnClosed)?;
        done.recv().map_err(|_| Error::WriteTxnClosed)
    }
}

fn serve(mut txn: Transaction, inbox: Receiver<Request>) {
    while let Ok(request) = inbox.recv() {
        match request {
            Request::Op(op, reply) => {
                let _ = reply.send(op(&mut txn));
            }
            Request::Commit(reply) => {
                let _ = reply.send(txn.commit());
                return;
            }
            Request::Abort(reply) => {
                txn.abort();
                let _ = reply.send(());
                return;
            }
        }
    }
    // Every handle is gone; dropping txn aborts it.
}
