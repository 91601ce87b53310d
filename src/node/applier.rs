use std::sync::Arc;

use super::storage::Store;
use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot};
use tracing::error;

/// Work delivered to the storage engine in commit order.
pub(crate) enum ApplyMsg {
    /// A committed log command. `done` is present when a local client is
    /// waiting for the write to land.
    Write {
        key: String,
        value: String,
        done: Option<oneshot::Sender<Result<()>>>,
    },
    /// Point-in-time export. Riding the same queue guarantees the payload
    /// contains every write enqueued before it.
    Export { resp: oneshot::Sender<Result<Vec<u8>>> },
    /// Snapshot installation, replacing the whole map. Ordered after any
    /// writes already in flight.
    Import {
        data: Vec<u8>,
        resp: oneshot::Sender<Result<()>>,
    },
}

/// Drains committed commands from the consensus task into the storage engine,
/// strictly in the order they were committed.
pub(crate) struct Applier {
    store: Arc<Store>,
    rx: mpsc::Receiver<ApplyMsg>,
}

impl Applier {
    pub(crate) fn new(store: Arc<Store>, rx: mpsc::Receiver<ApplyMsg>) -> Self {
        Self { store, rx }
    }

    pub(crate) async fn run(mut self) {
        while let Some(msg) = self.rx.recv().await {
            match msg {
                ApplyMsg::Write { key, value, done } => {
                    let res = self
                        .store
                        .set(&key, &value)
                        .context("applying committed write");
                    if let Err(err) = &res {
                        error!(key = %key, error = format!("{err:#}"), "applying committed write");
                    }
                    if let Some(done) = done {
                        let _ = done.send(res);
                    }
                }
                ApplyMsg::Export { resp } => {
                    let _ = resp.send(self.store.export());
                }
                ApplyMsg::Import { data, resp } => {
                    let _ = resp.send(self.store.import(&data).context("importing snapshot"));
                }
            }
        }
    }
}
