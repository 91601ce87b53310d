use std::path::PathBuf;
use std::sync::Arc;

use crate::config::Config;
use anyhow::{Context, Result};
use api::grpc;
use applier::Applier;
use state_machine::{Message, SetStatus, StateMachine};
use storage::{MetaStore, Store};
use tokio::sync::{mpsc, oneshot};
use tracing::info;

pub mod api;
mod applier;
mod log;
mod state_machine;
pub mod storage;

/// Handle to a running node: the consensus task and the applier task, talked
/// to over a message channel.
pub struct GroveNode {
    actions: mpsc::Sender<Message>,
}

impl GroveNode {
    pub fn new(cfg: &Config) -> Result<Self> {
        let data_dir = PathBuf::from(&cfg.data_dir).join(&cfg.node_id);
        let store = Arc::new(
            Store::open(data_dir.join("wal.log")).context("opening storage engine")?,
        );
        let meta = MetaStore::new(data_dir.join("meta.json"));

        let (apply_tx, apply_rx) = mpsc::channel(64);
        tokio::spawn(Applier::new(store.clone(), apply_rx).run());

        let peers: Vec<_> = cfg
            .peers
            .iter()
            .filter(|p| p.id != cfg.node_id)
            .cloned()
            .collect();
        let (send, recv) = mpsc::channel(8);
        let mut sm = StateMachine::new(
            cfg.node_id.clone(),
            &peers,
            store,
            meta,
            data_dir.join("snapshot.json"),
            apply_tx,
            recv,
            send.clone(),
        )?;
        tokio::spawn(async move { sm.run().await });

        info!(
            node_id = %cfg.node_id,
            peers = peers.len(),
            data_dir = %data_dir.display(),
            "starting node"
        );

        Ok(GroveNode { actions: send })
    }

    async fn get(&self, key: String) -> Result<Option<String>> {
        let (tx, rx) = oneshot::channel();
        let msg = Message::Get { key, resp: tx };
        let _ = self.actions.send(msg).await;
        rx.await?
    }

    async fn set(&self, key: String, value: String) -> Result<SetStatus> {
        let (tx, rx) = oneshot::channel();
        let msg = Message::Set {
            key,
            value,
            resp: tx,
        };
        let _ = self.actions.send(msg).await;
        Ok(rx.await?)
    }

    async fn request_vote(
        &self,
        req: grpc::RequestVoteRequest,
    ) -> Result<grpc::RequestVoteResponse> {
        let (tx, rx) = oneshot::channel();
        let msg = Message::RequestVote { req, resp: tx };
        let _ = self.actions.send(msg).await;
        rx.await?
    }

    async fn append_entries(
        &self,
        req: grpc::AppendEntriesRequest,
    ) -> Result<grpc::AppendEntriesResponse> {
        let (tx, rx) = oneshot::channel();
        let msg = Message::AppendEntries { req, resp: tx };
        let _ = self.actions.send(msg).await;
        rx.await?
    }

    async fn install_snapshot(
        &self,
        req: grpc::InstallSnapshotRequest,
    ) -> Result<grpc::InstallSnapshotResponse> {
        let (tx, rx) = oneshot::channel();
        let msg = Message::InstallSnapshot { req, resp: tx };
        let _ = self.actions.send(msg).await;
        rx.await?
    }

    async fn take_snapshot(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let msg = Message::TakeSnapshot { resp: tx };
        let _ = self.actions.send(msg).await;
        rx.await?
    }
}
