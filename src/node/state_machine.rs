use std::collections::HashMap;
use std::fmt::Display;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::api::grpc::{self, grove_client::GroveClient};
use super::applier::ApplyMsg;
use super::log::{LogIndex, RaftLog, Term};
use super::storage::{self, MetaStore, Store};
use crate::config::PeerCfg;
use anyhow::{anyhow, Context, Result};
use rand::rng;
use rand::Rng;
use tokio::select;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task;
use tokio::time;
use tokio::time::Instant;
use tonic::transport::Channel;
use tracing::{debug, error, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(500); // time between idling follower heartbeats
const TICK_TIMEOUT: Duration = Duration::from_millis(100); // main leader loop timeout
const ELECTION_TIMEOUT_MS: Range<u64> = 1500..3000;
const RPC_TIMEOUT: Duration = Duration::from_millis(500);

type PeerIdx = usize;

struct PeerState {
    id: String,
    client: GroveClient<Channel>,
    next_idx: LogIndex,
    match_idx: LogIndex,
    update_timeout: Option<Instant>,
    next_heartbeat: Instant,
}

pub enum ServerState {
    Leader,
    Follower,
    Candidate,
}

/// Outcome of a client write, surfaced through the Set RPC.
pub enum SetStatus {
    Applied,
    NotLeader { leader_hint: Option<String> },
    Failed(String),
}

pub enum Message {
    // messages from grpc
    Get {
        key: String,
        resp: oneshot::Sender<Result<Option<String>>>,
    },
    Set {
        key: String,
        value: String,
        resp: oneshot::Sender<SetStatus>,
    },
    RequestVote {
        req: grpc::RequestVoteRequest,
        resp: oneshot::Sender<Result<grpc::RequestVoteResponse>>,
    },
    AppendEntries {
        req: grpc::AppendEntriesRequest,
        resp: oneshot::Sender<Result<grpc::AppendEntriesResponse>>,
    },
    InstallSnapshot {
        req: grpc::InstallSnapshotRequest,
        resp: oneshot::Sender<Result<grpc::InstallSnapshotResponse>>,
    },
    TakeSnapshot {
        resp: oneshot::Sender<Result<()>>,
    },

    // messages from internal async jobs
    ReceiveVote(grpc::RequestVoteResponse),
    AppendEntriesReply {
        peer: PeerIdx,
        term: Term,
        replicated_idx: Option<LogIndex>,
    },
    InstallSnapshotReply {
        peer: PeerIdx,
        term: Term,
        included_idx: LogIndex,
    },
}

pub struct StateMachine {
    id: String,
    rx_msgs: mpsc::Receiver<Message>,
    tx_msgs: mpsc::Sender<Message>,
    peers: Vec<PeerState>,
    quorum: u32,
    election_timeout: Instant,
    leader_hint: Option<String>,
    pending_writes: HashMap<LogIndex, oneshot::Sender<SetStatus>>,

    // persistent state
    current_term: Term,
    voted_for: Option<String>,
    meta: MetaStore,

    log: RaftLog,
    store: Arc<Store>,
    apply_tx: mpsc::Sender<ApplyMsg>,
    snapshot_path: PathBuf,

    // volatile state
    state: ServerState,
    commit_idx: LogIndex,
    last_applied: LogIndex,

    // volatile state on candidate
    votes_received: u32,
}

impl Display for StateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}(id={}, t={}, ll={}, ci={}, la={})",
            match self.state {
                ServerState::Leader => "L",
                ServerState::Follower => "F",
                ServerState::Candidate => "C",
            },
            self.id,
            self.current_term,
            self.log.last_idx(),
            self.commit_idx,
            self.last_applied
        )
    }
}

impl StateMachine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        peers: &[PeerCfg],
        store: Arc<Store>,
        meta: MetaStore,
        snapshot_path: PathBuf,
        apply_tx: mpsc::Sender<ApplyMsg>,
        rx_msgs: mpsc::Receiver<Message>,
        tx_msgs: mpsc::Sender<Message>,
    ) -> Result<Self> {
        let (current_term, voted_for) =
            meta.load().context("loading term/vote metadata")?;
        Ok(Self {
            id,
            rx_msgs,
            tx_msgs,
            quorum: ((peers.len() + 1) / 2 + 1) as u32,
            peers: Self::init_peers(peers)?,
            election_timeout: Self::next_election_timeout(Some(100..200)),
            leader_hint: None,
            pending_writes: HashMap::new(),
            current_term,
            voted_for,
            meta,
            log: RaftLog::new(),
            store,
            apply_tx,
            snapshot_path,
            state: ServerState::Follower,
            commit_idx: -1,
            last_applied: -1,
            votes_received: 0,
        })
    }

    pub async fn run(&mut self) {
        loop {
            match self.maybe_apply_log().await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(err) => {
                    error!(error = format!("{err:#}"), "delivering committed entries");
                }
            }
            let err = match self.state {
                ServerState::Leader => self.run_leader().await,
                ServerState::Follower => self.run_follower().await,
                ServerState::Candidate => self.run_candidate().await,
            };
            match err {
                Ok(_) => {}
                Err(err) => error!(error = format!("{err:#}"), "got error"),
            }
        }
    }

    async fn run_leader(&mut self) -> Result<()> {
        self.maybe_update_followers()
            .context("updating followers")?;
        self.maybe_update_commit_idx()
            .context("updating commitIndex")?;

        select! {
            _ = time::sleep(TICK_TIMEOUT) => {},
            Some(msg) = self.rx_msgs.recv() => {
                match msg {
                    Message::Get { key, resp } => {
                        let _ = resp.send(Ok(self.store.get(&key)));
                    }
                    Message::Set { key, value, resp } => {
                        self.set_data(key, value, resp);
                    }
                    Message::RequestVote { req, resp } => {
                        let _ = resp.send(self.request_vote(req).context("voting for candidate"));
                    },
                    Message::AppendEntries { req, resp } => {
                        if req.term >= self.current_term {
                            info!(new_leader_id = %req.leader_id, new_leader_term = req.term, "found leader with current or newer term, stepping down");
                        } else {
                            info!(offender_id = %req.leader_id, offender_term = req.term, "found unexpected stale leader");
                        }
                        let _ = resp.send(self.append_entries(req).context("appending entries"));
                    },
                    Message::InstallSnapshot { req, resp } => {
                        let _ = resp.send(self.install_snapshot(req).await.context("installing snapshot"));
                    },
                    Message::TakeSnapshot { resp } => {
                        let _ = resp.send(self.take_snapshot().await);
                    },
                    Message::ReceiveVote(_) => {
                        // don't care as we are leader already
                    },
                    Message::AppendEntriesReply { peer, term, replicated_idx } => {
                        self.handle_append_reply(peer, term, replicated_idx)?;
                    }
                    Message::InstallSnapshotReply { peer, term, included_idx } => {
                        self.handle_snapshot_reply(peer, term, included_idx)?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn run_follower(&mut self) -> Result<()> {
        select! {
            _ = time::sleep_until(self.election_timeout) => {
                self.convert_to_candidate().context("converting to candidate")?;
            },
            Some(msg) = self.rx_msgs.recv() => {
                match msg {
                    Message::Get { key, resp } => {
                        // NB: reads from followers are eventually consistent and may lag behind leader
                        // even in normal mode (right after leader got quorum and committed write)
                        let _ = resp.send(Ok(self.store.get(&key)));
                    }
                    Message::Set { resp, .. } => {
                        let _ = resp.send(SetStatus::NotLeader { leader_hint: self.leader_hint.clone() });
                    }
                    Message::RequestVote { req, resp } => {
                        let _ = resp.send(self.request_vote(req).context("requesting vote"));
                    },
                    Message::AppendEntries { req, resp } => {
                        let _ = resp.send(self.append_entries(req).context("processing AppendEntries"));
                    },
                    Message::InstallSnapshot { req, resp } => {
                        let _ = resp.send(self.install_snapshot(req).await.context("processing InstallSnapshot"));
                    },
                    Message::TakeSnapshot { resp } => {
                        let _ = resp.send(Err(anyhow!("not leader")));
                    },
                    Message::ReceiveVote(_)
                    | Message::AppendEntriesReply { .. }
                    | Message::InstallSnapshotReply { .. } => {
                        // don't care as follower
                    }
                }
            }
        }
        Ok(())
    }

    async fn run_candidate(&mut self) -> Result<()> {
        select! {
            _ = time::sleep_until(self.election_timeout) => {
                // split vote or unreachable peers, campaign again with a new term
                self.convert_to_candidate().context("converting to candidate")?;
            },
            Some(msg) = self.rx_msgs.recv() => {
                match msg {
                    Message::Get { key: _, resp } => {
                        let _ = resp.send(Err(anyhow!("election in progress")));
                    }
                    Message::Set { resp, .. } => {
                        let _ = resp.send(SetStatus::NotLeader { leader_hint: None });
                    }
                    Message::RequestVote { req, resp } => {
                        let _ = resp.send(self.request_vote(req).context("requesting vote"));
                    },
                    Message::AppendEntries { req, resp } => {
                        let _ = resp.send(self.append_entries(req).context("processing AppendEntries"));
                    },
                    Message::InstallSnapshot { req, resp } => {
                        let _ = resp.send(self.install_snapshot(req).await.context("processing InstallSnapshot"));
                    },
                    Message::TakeSnapshot { resp } => {
                        let _ = resp.send(Err(anyhow!("not leader")));
                    },
                    Message::ReceiveVote(vote) => {
                        self.receive_vote(vote)?;
                    },
                    Message::AppendEntriesReply { .. } | Message::InstallSnapshotReply { .. } => {
                        // don't care as candidate
                    }
                }
            }
        }
        Ok(())
    }

    fn append_entries(
        &mut self,
        req: grpc::AppendEntriesRequest,
    ) -> Result<grpc::AppendEntriesResponse> {
        if req.term < self.current_term {
            // stale leader, reject RPC
            return Ok(grpc::AppendEntriesResponse {
                term: self.current_term,
                success: false,
            });
        }
        if req.term > self.current_term {
            self.set_term(req.term).context("adopting newer term")?;
        }
        // a current-or-newer-term leader asserts authority over this term
        if !matches!(self.state, ServerState::Follower) {
            self.convert_to_follower();
        }
        self.leader_hint = Some(req.leader_id.clone());
        self.election_timeout = Self::next_election_timeout(None);

        debug!(
            leader_commit = req.leader_commit,
            entries_count = req.entries.len(),
            prev_log_idx = req.prev_log_index,
            "AppendEntries"
        );

        let prev = req.prev_log_index;
        // a prefix at or below the watermark is committed state, it cannot conflict
        let consistent = prev <= self.log.last_included_idx()
            || self.log.term_at(prev) == Some(req.prev_log_term);
        if !consistent {
            debug!(state = %self, prev_log_idx = prev, prev_log_term = req.prev_log_term, "no matching entry at prevLogIndex");
            return Ok(grpc::AppendEntriesResponse {
                term: self.current_term,
                success: false,
            });
        }

        let mut last_new = prev;
        for (i, entry) in req.entries.into_iter().enumerate() {
            let idx = prev + 1 + i as LogIndex;
            last_new = idx;
            if idx <= self.log.last_included_idx() {
                // already folded into a snapshot
                continue;
            }
            if idx > self.log.last_idx() {
                self.log.append(entry);
            } else if self.log.term_at(idx) != Some(entry.term) {
                // conflicting entry, remove it and all that follow
                self.log.truncate_from(idx);
                self.log.append(entry);
            }
        }

        if req.leader_commit > self.commit_idx {
            // only indices verified by the consistency check above are safe
            self.commit_idx = self.commit_idx.max(req.leader_commit.min(last_new));
        }

        Ok(grpc::AppendEntriesResponse {
            term: self.current_term,
            success: true,
        })
    }

    fn request_vote(
        &mut self,
        req: grpc::RequestVoteRequest,
    ) -> Result<grpc::RequestVoteResponse> {
        if req.term < self.current_term {
            // candidate is stale
            return Ok(grpc::RequestVoteResponse {
                term: self.current_term,
                vote_granted: false,
            });
        }
        if req.term > self.current_term {
            self.set_term(req.term).context("adopting newer term")?;
            debug!(term = req.term, "got RequestVote with greater term");
            self.convert_to_follower();
        }

        // grant iff we haven't voted this term (or voted for this exact
        // candidate) and the candidate's log is at least as up-to-date as ours
        let up_to_date = req.last_log_term > self.log.last_term()
            || (req.last_log_term == self.log.last_term()
                && req.last_log_index >= self.log.last_idx());
        let free_to_vote = self
            .voted_for
            .as_deref()
            .map_or(true, |v| v == req.candidate_id);

        if free_to_vote && up_to_date {
            self.record_vote(&req.candidate_id)
                .context("persisting vote")?;
            // a valid RequestVote counts as liveness, push back our own candidacy
            self.election_timeout = Self::next_election_timeout(None);
            return Ok(grpc::RequestVoteResponse {
                term: self.current_term,
                vote_granted: true,
            });
        }
        Ok(grpc::RequestVoteResponse {
            term: self.current_term,
            vote_granted: false,
        })
    }

    async fn install_snapshot(
        &mut self,
        req: grpc::InstallSnapshotRequest,
    ) -> Result<grpc::InstallSnapshotResponse> {
        if req.term < self.current_term {
            return Ok(grpc::InstallSnapshotResponse {
                term: self.current_term,
            });
        }
        if req.term > self.current_term {
            self.set_term(req.term).context("adopting newer term")?;
        }
        if !matches!(self.state, ServerState::Follower) {
            self.convert_to_follower();
        }
        self.election_timeout = Self::next_election_timeout(None);

        if req.last_included_index <= self.log.last_included_idx() {
            // the watermark never moves backwards
            debug!(
                offered = req.last_included_index,
                current = self.log.last_included_idx(),
                "ignoring stale snapshot"
            );
            return Ok(grpc::InstallSnapshotResponse {
                term: self.current_term,
            });
        }

        // route the import through the applier so it lands after any writes
        // still queued ahead of it
        let (tx, rx) = oneshot::channel();
        self.apply_tx
            .send(ApplyMsg::Import {
                data: req.data,
                resp: tx,
            })
            .await
            .map_err(|_| anyhow!("applier queue closed"))?;
        rx.await.context("waiting for snapshot import")??;

        self.log
            .install(req.last_included_index, req.last_included_term);
        self.commit_idx = self.commit_idx.max(req.last_included_index);
        self.last_applied = self.last_applied.max(req.last_included_index);
        info!(
            last_included_idx = req.last_included_index,
            last_included_term = req.last_included_term,
            "installed snapshot"
        );
        Ok(grpc::InstallSnapshotResponse {
            term: self.current_term,
        })
    }

    /// Fold everything applied so far into a snapshot file and compact the
    /// log. Leader-only.
    async fn take_snapshot(&mut self) -> Result<()> {
        if !matches!(self.state, ServerState::Leader) {
            return Err(anyhow!("not leader"));
        }
        if self.last_applied <= self.log.last_included_idx() {
            return Err(anyhow!("no new entries applied since last snapshot"));
        }
        let idx = self.last_applied;
        let term = self
            .log
            .term_at(idx)
            .ok_or_else(|| anyhow!("no term known for applied index {idx}"))?;

        // the export rides the applier queue, so it observes every write
        // enqueued before it
        let (tx, rx) = oneshot::channel();
        self.apply_tx
            .send(ApplyMsg::Export { resp: tx })
            .await
            .map_err(|_| anyhow!("applier queue closed"))?;
        let data = rx.await.context("waiting for state export")??;

        storage::save_snapshot(&self.snapshot_path, &data).context("writing snapshot file")?;
        self.log.compact_through(idx, term);
        info!(
            last_included_idx = idx,
            last_included_term = term,
            "log compacted into snapshot"
        );
        Ok(())
    }

    fn set_term(&mut self, term: Term) -> Result<()> {
        self.current_term = term;
        self.voted_for = None;
        self.meta.save(term, None).context("persisting term")
    }

    fn record_vote(&mut self, candidate: &str) -> Result<()> {
        self.voted_for = Some(candidate.to_string());
        self.meta.save(self.current_term, Some(candidate))
    }

    fn convert_to_candidate(&mut self) -> Result<()> {
        info!(term = self.current_term + 1, "converting to candidate");
        self.state = ServerState::Candidate;
        self.current_term += 1;
        self.voted_for = Some(self.id.clone());
        self.meta
            .save(self.current_term, Some(&self.id))
            .context("persisting candidacy")?;
        self.votes_received = 1;
        self.election_timeout = Self::next_election_timeout(None);
        self.leader_hint = None;

        // request votes from all peers in parallel
        for peer in &self.peers {
            task::spawn(Self::request_vote_from_peer(
                peer.client.clone(),
                peer.id.clone(),
                self.tx_msgs.clone(),
                self.current_term,
                self.id.clone(),
                self.log.last_idx(),
                self.log.last_term(),
            ));
        }
        Ok(())
    }

    fn convert_to_follower(&mut self) {
        info!("converting to follower");
        self.state = ServerState::Follower;
        self.fail_pending_writes();
    }

    fn convert_to_leader(&mut self) {
        info!(term = self.current_term, "converting to leader");
        self.state = ServerState::Leader;
        self.leader_hint = Some(self.id.clone());
        for peer in &mut self.peers {
            peer.next_idx = self.log.last_idx() + 1;
            peer.match_idx = -1;
            peer.update_timeout = None;
            peer.next_heartbeat = Instant::now();
        }
    }

    fn fail_pending_writes(&mut self) {
        let hint = self.leader_hint.clone();
        for (_, resp) in self.pending_writes.drain() {
            let _ = resp.send(SetStatus::NotLeader {
                leader_hint: hint.clone(),
            });
        }
    }

    fn receive_vote(&mut self, vote: grpc::RequestVoteResponse) -> Result<()> {
        if vote.term > self.current_term {
            // we are stale
            self.set_term(vote.term).context("adopting newer term")?;
            debug!(term = vote.term, "got RequestVote reply with greater term");
            self.convert_to_follower();
        } else if vote.term == self.current_term && vote.vote_granted {
            self.votes_received += 1;
            info!(
                votes_received = self.votes_received,
                quorum = self.quorum,
                "vote granted"
            );
            if self.votes_received >= self.quorum {
                self.convert_to_leader();
            }
        }
        Ok(())
    }

    async fn request_vote_from_peer(
        mut client: GroveClient<Channel>,
        peer_id: String,
        msgs: mpsc::Sender<Message>,
        term: Term,
        candidate_id: String,
        last_log_index: LogIndex,
        last_log_term: Term,
    ) {
        let req = grpc::RequestVoteRequest {
            term,
            candidate_id,
            last_log_index,
            last_log_term,
        };
        match time::timeout(RPC_TIMEOUT, client.request_vote(req)).await {
            Ok(Ok(repl)) => {
                let _ = msgs.send(Message::ReceiveVote(repl.into_inner())).await;
            }
            Ok(Err(err)) => {
                // this round simply loses the peer's vote
                error!(
                    peer_id = %peer_id,
                    error = format!("{err:#}"),
                    "requesting vote from peer",
                );
            }
            Err(_) => {
                warn!(peer_id = %peer_id, "vote request timed out");
            }
        }
    }

    fn handle_append_reply(
        &mut self,
        peer: PeerIdx,
        term: Term,
        replicated_idx: Option<LogIndex>,
    ) -> Result<()> {
        if term > self.current_term {
            info!(peer_term = term, "follower has newer term, stepping down");
            self.set_term(term).context("adopting newer term")?;
            self.convert_to_follower();
            return Ok(());
        }
        let Some(peer_state) = self.peers.get_mut(peer) else {
            return Err(anyhow!("got AppendEntries reply from unknown peer {peer}"));
        };
        if let Some(idx) = replicated_idx {
            debug!(
                follower = %peer_state.id,
                replicated_idx = idx,
                "follower replicated entries"
            );
            peer_state.next_idx = idx + 1;
            peer_state.match_idx = peer_state.match_idx.max(idx);
            peer_state.update_timeout = None;
        } else {
            // follower failed AppendEntries, will retry with earlier log entries
            debug!(follower = %peer_state.id, "follower is lagging");
            peer_state.next_idx = (peer_state.next_idx - 1).max(0);
            peer_state.update_timeout = None;
        }
        Ok(())
    }

    fn handle_snapshot_reply(
        &mut self,
        peer: PeerIdx,
        term: Term,
        included_idx: LogIndex,
    ) -> Result<()> {
        if term > self.current_term {
            info!(peer_term = term, "follower has newer term, stepping down");
            self.set_term(term).context("adopting newer term")?;
            self.convert_to_follower();
            return Ok(());
        }
        let Some(peer_state) = self.peers.get_mut(peer) else {
            return Err(anyhow!("got InstallSnapshot reply from unknown peer {peer}"));
        };
        debug!(
            follower = %peer_state.id,
            included_idx,
            "follower installed snapshot"
        );
        peer_state.next_idx = included_idx + 1;
        peer_state.match_idx = peer_state.match_idx.max(included_idx);
        peer_state.update_timeout = None;
        Ok(())
    }

    fn send_entries(&mut self, peer: PeerIdx, entries: Vec<grpc::LogEntry>) -> Result<()> {
        let mut client = self.peers[peer].client.clone();
        let msgs = self.tx_msgs.clone();
        let follower = self.peers[peer].id.clone();
        let prev_log_idx = self.peers[peer].next_idx - 1;

        let entries_count = entries.len() as LogIndex;
        let update_timeout = Instant::now() + RPC_TIMEOUT;
        self.peers[peer].update_timeout = Some(update_timeout);
        self.peers[peer].next_heartbeat = Instant::now() + HEARTBEAT_INTERVAL;
        let prev_log_term = self
            .log
            .term_at(prev_log_idx)
            .ok_or_else(|| anyhow!("no term known for log index {prev_log_idx}"))?;
        let req = grpc::AppendEntriesRequest {
            term: self.current_term,
            leader_id: self.id.clone(),
            prev_log_index: prev_log_idx,
            prev_log_term,
            entries,
            leader_commit: self.commit_idx,
        };
        task::spawn(async move {
            select! {
                _ = time::sleep_until(update_timeout) => {
                    warn!(follower = %follower, "AppendEntries timed out")
                },
                resp = client.append_entries(req) => {
                    match resp {
                        Ok(resp) => {
                            let resp = resp.into_inner();
                            let _ = msgs
                                .send(Message::AppendEntriesReply {
                                    peer,
                                    term: resp.term,
                                    replicated_idx: resp
                                        .success
                                        .then_some(prev_log_idx + entries_count),
                                })
                                .await;
                        }
                        Err(err) => {
                            // retries are driven by the next leader tick
                            error!(follower = %follower, error = format!("{err:#}"), "sending AppendEntries");
                        }
                    }
                }
            }
        });

        Ok(())
    }

    fn send_snapshot(&mut self, peer: PeerIdx) -> Result<()> {
        let data =
            storage::load_snapshot(&self.snapshot_path).context("reading snapshot file")?;
        let mut client = self.peers[peer].client.clone();
        let msgs = self.tx_msgs.clone();
        let follower = self.peers[peer].id.clone();
        let included_idx = self.log.last_included_idx();
        let included_term = self.log.last_included_term();

        let update_timeout = Instant::now() + RPC_TIMEOUT;
        self.peers[peer].update_timeout = Some(update_timeout);
        self.peers[peer].next_heartbeat = Instant::now() + HEARTBEAT_INTERVAL;
        info!(
            follower = %follower,
            included_idx,
            "follower lags behind the watermark, sending snapshot"
        );
        let req = grpc::InstallSnapshotRequest {
            term: self.current_term,
            last_included_index: included_idx,
            last_included_term: included_term,
            data,
        };
        task::spawn(async move {
            select! {
                _ = time::sleep_until(update_timeout) => {
                    warn!(follower = %follower, "InstallSnapshot timed out")
                },
                resp = client.install_snapshot(req) => {
                    match resp {
                        Ok(resp) => {
                            let _ = msgs
                                .send(Message::InstallSnapshotReply {
                                    peer,
                                    term: resp.into_inner().term,
                                    included_idx,
                                })
                                .await;
                        }
                        Err(err) => {
                            error!(follower = %follower, error = format!("{err:#}"), "sending InstallSnapshot");
                        }
                    }
                }
            }
        });

        Ok(())
    }

    fn set_data(&mut self, key: String, value: String, resp: oneshot::Sender<SetStatus>) {
        let idx = self.log.append(grpc::LogEntry {
            term: self.current_term,
            command: Some(grpc::Command { key, value }),
        });
        // the entry goes out to followers on the next leader tick; the reply
        // is held back until the entry commits and the applier acknowledges it
        self.pending_writes.insert(idx, resp);
        debug!(index = idx, "appended client write to log");
    }

    async fn maybe_apply_log(&mut self) -> Result<bool> {
        if self.commit_idx <= self.last_applied {
            return Ok(false);
        }
        self.last_applied += 1;
        debug_assert!(
            self.last_applied <= self.log.last_idx(),
            "(applying log entries) last_applied > log last idx"
        );

        debug!(index = self.last_applied, "delivering log entry to applier");
        let cmd = self
            .log
            .get(self.last_applied)
            .and_then(|e| e.command.clone())
            .ok_or_else(|| anyhow!("log entry {} missing or empty", self.last_applied))?;

        // bridge the applier's ack back to the waiting client, if any
        let done = self.pending_writes.remove(&self.last_applied).map(|resp| {
            let (tx, rx) = oneshot::channel();
            task::spawn(async move {
                let status = match rx.await {
                    Ok(Ok(())) => SetStatus::Applied,
                    Ok(Err(err)) => SetStatus::Failed(format!("{err:#}")),
                    Err(_) => SetStatus::Failed("applier stopped".to_string()),
                };
                let _ = resp.send(status);
            });
            tx
        });
        self.apply_tx
            .send(ApplyMsg::Write {
                key: cmd.key,
                value: cmd.value,
                done,
            })
            .await
            .map_err(|_| anyhow!("applier queue closed"))?;
        Ok(true)
    }

    fn maybe_update_followers(&mut self) -> Result<()> {
        let last_idx = self.log.last_idx();
        for peer in 0..self.peers.len() {
            let ok_to_update = self.peers[peer]
                .update_timeout
                .map_or(true, |x| Instant::now() >= x);
            if !ok_to_update {
                continue;
            }

            let next_idx = self.peers[peer].next_idx;
            if next_idx <= self.log.last_included_idx() {
                // the entries this follower needs were compacted away
                self.send_snapshot(peer)
                    .context("sending snapshot to follower")?;
            } else if next_idx <= last_idx {
                debug!(
                    follower = %self.peers[peer].id,
                    my_last_idx = last_idx,
                    follower_next_idx = next_idx,
                    "updating follower"
                );
                let entries = self.log.entries_from(next_idx);
                self.send_entries(peer, entries)
                    .context("sending entries to follower")?;
            } else if Instant::now() >= self.peers[peer].next_heartbeat {
                self.send_entries(peer, Vec::new())
                    .context("sending heartbeat")?;
            }
        }
        Ok(())
    }

    fn maybe_update_commit_idx(&mut self) -> Result<()> {
        debug_assert!(
            self.commit_idx <= self.log.last_idx(),
            "(updating commitIndex) commitIndex <= last log idx"
        );
        let mut i = self.log.last_idx();
        while i > self.commit_idx && i > self.log.last_included_idx() {
            // replicated on ourselves plus every peer matching at or above i
            let in_sync = 1 + self.peers.iter().filter(|p| p.match_idx >= i).count();
            if in_sync >= self.quorum as usize {
                if self.log.term_at(i) == Some(self.current_term) {
                    debug!(index = i, in_sync, "got quorum on log entry");
                    self.commit_idx = i;
                }
                // an older-term entry commits only implicitly, once a
                // current-term entry above it reaches quorum
                return Ok(());
            }
            i -= 1;
        }
        Ok(())
    }

    fn init_peers(peers: &[PeerCfg]) -> Result<Vec<PeerState>> {
        let mut out = Vec::with_capacity(peers.len());
        for peer in peers {
            let ch = Channel::from_shared(peer.addr.clone())?.connect_lazy();
            out.push(PeerState {
                id: peer.id.clone(),
                client: GroveClient::new(ch),
                next_idx: 0,
                match_idx: -1,
                update_timeout: None,
                next_heartbeat: Instant::now(),
            });
        }
        Ok(out)
    }

    fn next_election_timeout(r: Option<Range<u64>>) -> Instant {
        Instant::now()
            .checked_add(Duration::from_millis(
                rng().random_range(r.unwrap_or(ELECTION_TIMEOUT_MS)),
            ))
            .unwrap()
    }
}
