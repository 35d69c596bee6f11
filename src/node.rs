//! The consensus core: a strong-leader replicated log over two RPCs.
//!
//! All mutable consensus state lives behind one mutex per node. RPCs are
//! never issued while it is held: callers snapshot what the request needs,
//! release, perform the call, then reacquire and re-check the term before
//! touching anything. A single driver loop steps the role state machine;
//! inbound RPCs run on the transport's workers; outbound RPCs are
//! fire-and-forget tasks that silently drop transport failures (the next
//! tick retries).

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use rand::Rng;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::time::Instant;
use tonic::transport::{Channel, Endpoint, Server};
use tonic::{Request, Response, Status};

use crate::config::Member;
use crate::machine::{ApplyOutcome, StateMachine};
use crate::rpc::{
    AppendEntriesArgs, AppendEntriesReply, Entry, Raft, RaftClient, RaftServer, RequestVoteArgs,
    RequestVoteReply,
};
use crate::storage::{LogEntry, LogStore, MAX_COMMAND};
use crate::{RaftError, Result};

/// Leader heartbeat period. Election deadlines are drawn from
/// `[2 * HEARTBEAT_MS, 4 * HEARTBEAT_MS)` so a live leader can never cause
/// a spurious election.
pub const HEARTBEAT_MS: u64 = 150;

/// Driver loop cadence; must stay well under one heartbeat period.
const TICK_MS: u64 = 25;

/// Cap on entries carried by a single append RPC.
const BATCH_MAX: usize = 8000;

/// Transport-level timeout; a timed-out call is an ordinary failure.
const RPC_TIMEOUT_MS: u64 = 450;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

struct ServerState {
    role: Role,
    current_term: u64,
    voted_for: u64,
    log: Vec<LogEntry>,

    commit_index: u64,
    last_applied: u64,
    leader_id: u64,

    next_index: Vec<u64>,
    match_index: Vec<u64>,
    votes: Vec<bool>,

    election_deadline: Instant,
    heartbeat_deadline: Instant,

    store: LogStore,
}

impl ServerState {
    fn last_index(&self) -> u64 {
        (self.log.len() - 1) as u64
    }

    fn last_term(&self) -> u64 {
        self.log[self.log.len() - 1].term
    }

    // Durable-log I/O failures are fail-stop: the node cannot continue
    // safely once a write may or may not have reached the disk.
    fn persist(&mut self, write_log: bool, n_new: usize) {
        self.store
            .persist(self.current_term, self.voted_for, &self.log, write_log, n_new)
            .unwrap_or_else(|err| panic!("raft log write failed: {err}"));
    }

    fn reset_election_deadline(&mut self) {
        let jitter = rand::thread_rng().gen_range(2 * HEARTBEAT_MS..4 * HEARTBEAT_MS);
        self.election_deadline = Instant::now() + Duration::from_millis(jitter);
    }
}

pub struct RaftNode {
    id: u64,
    addr: String,
    cluster: Vec<Member>,
    me: usize,

    machine: Arc<dyn StateMachine>,
    state: Mutex<ServerState>,
    clients: Vec<Mutex<Option<RaftClient<Channel>>>>,

    killed: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl RaftNode {
    /// Build a node from the fixed cluster list; `me` is this node's index
    /// into it. Opens the durable log under `metadata_dir` (fail-stop on
    /// I/O errors); nothing runs until [`start`](Self::start).
    pub fn new(
        cluster: Vec<Member>,
        me: usize,
        machine: Arc<dyn StateMachine>,
        metadata_dir: impl AsRef<Path>,
    ) -> Arc<Self> {
        assert!(me < cluster.len(), "member index {me} out of range");
        for member in &cluster {
            assert!(member.id != 0, "member id must not be 0");
        }

        let id = cluster[me].id;
        let addr = cluster[me].addr.clone();
        let store = LogStore::open(metadata_dir.as_ref(), id)
            .unwrap_or_else(|err| panic!("open raft log for node {id}: {err}"));

        let now = Instant::now();
        let n = cluster.len();
        let state = ServerState {
            role: Role::Follower,
            current_term: 0,
            voted_for: 0,
            log: vec![LogEntry::sentinel()],
            commit_index: 0,
            last_applied: 0,
            leader_id: 0,
            next_index: vec![0; n],
            match_index: vec![0; n],
            votes: vec![false; n],
            election_deadline: now,
            heartbeat_deadline: now,
            store,
        };

        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            id,
            addr,
            cluster,
            me,
            machine,
            state: Mutex::new(state),
            clients: (0..n).map(|_| Mutex::new(None)).collect(),
            killed: AtomicBool::new(false),
            shutdown,
        })
    }

    /// Restore persistent state, register the RPC handlers on the
    /// transport, and spawn the driver loop.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut st = self.state.lock().await;
            let (term, voted_for, log) = st
                .store
                .restore()
                .unwrap_or_else(|err| panic!("restore raft log for node {}: {err}", self.id));
            st.current_term = term;
            st.voted_for = voted_for;
            st.log = log;
            st.reset_election_deadline();
            info!(
                "node {} restored: term={} voted_for={} last_log_index={}",
                self.id,
                term,
                voted_for,
                st.last_index()
            );
        }

        let addr = self
            .addr
            .parse()
            .map_err(|err| RaftError::Config(format!("listen address {:?}: {err}", self.addr)))?;

        let service = RaftService { node: self.clone() };
        let mut shutdown_rx = self.shutdown.subscribe();
        let node = self.clone();
        tokio::spawn(async move {
            let result = Server::builder()
                .add_service(RaftServer::new(service))
                .serve_with_shutdown(addr, async move {
                    let stopped = *shutdown_rx.borrow();
                    if !stopped {
                        let _ = shutdown_rx.changed().await;
                    }
                })
                .await;
            if let Err(err) = result {
                warn!("node {}: rpc server exited: {err}", node.id);
            }
        });

        let ticker = self.clone();
        tokio::spawn(async move { ticker.ticker().await });
        Ok(())
    }

    /// Stop driving the node and close the transport. Idempotent.
    pub fn stop(&self) {
        self.killed.store(true, Ordering::SeqCst);
        let _ = self.shutdown.send(true);
    }

    fn killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    pub async fn is_leader(&self) -> bool {
        self.state.lock().await.role == Role::Leader
    }

    /// Best-known leader ID, or 0 when no leader has been observed in the
    /// current term.
    pub async fn leader(&self) -> u64 {
        self.state.lock().await.leader_id
    }

    /// Current `(term, is_leader)` snapshot.
    pub async fn state(&self) -> (u64, bool) {
        let st = self.state.lock().await;
        (st.current_term, st.role == Role::Leader)
    }

    /// Replicate `commands` and wait for each to be committed and applied.
    ///
    /// Fails fast with [`RaftError::NotLeader`] on a non-leader and with
    /// [`RaftError::CommandTooLarge`] before anything is appended. The
    /// returned outcomes are per command, in order; a state-machine error
    /// for one command does not affect the others.
    pub async fn apply(self: &Arc<Self>, commands: Vec<Vec<u8>>) -> Result<Vec<ApplyOutcome>> {
        let mut receivers = Vec::with_capacity(commands.len());
        {
            let mut st = self.state.lock().await;
            if st.role != Role::Leader {
                return Err(RaftError::NotLeader);
            }
            if let Some(big) = commands.iter().find(|c| c.len() > MAX_COMMAND) {
                return Err(RaftError::CommandTooLarge(big.len()));
            }
            if commands.is_empty() {
                return Ok(Vec::new());
            }

            let n = commands.len();
            let term = st.current_term;
            debug!("node {}: accepting {n} commands in term {term}", self.id);
            for command in commands {
                let (tx, rx) = oneshot::channel();
                st.log.push(LogEntry {
                    term,
                    command,
                    result: Some(tx),
                });
                receivers.push(rx);
            }
            st.persist(true, n);
        }

        self.broadcast_append().await;

        let mut outcomes = Vec::with_capacity(receivers.len());
        for rx in receivers {
            outcomes.push(rx.await.map_err(|_| RaftError::Discarded)?);
        }
        Ok(outcomes)
    }

    async fn ticker(self: Arc<Self>) {
        while !self.killed() {
            let mut broadcast = false;
            let mut campaign = None;
            {
                let mut st = self.state.lock().await;
                let now = Instant::now();
                match st.role {
                    Role::Leader => {
                        if now >= st.heartbeat_deadline {
                            st.heartbeat_deadline = now + Duration::from_millis(HEARTBEAT_MS);
                            broadcast = true;
                        }
                        self.advance_commit(&mut st);
                    }
                    Role::Follower | Role::Candidate => {
                        if now >= st.election_deadline {
                            campaign = Some(self.begin_election(&mut st));
                        }
                    }
                }
                self.apply_committed(&mut st);
            }

            if broadcast {
                self.broadcast_append().await;
            }
            if let Some(args) = campaign {
                self.broadcast_votes(args).await;
            }

            tokio::time::sleep(Duration::from_millis(TICK_MS)).await;
        }
    }

    /// Uniform term rule applied to every inbound request and response:
    /// a higher term immediately demotes to follower, clears the vote,
    /// and persists before anything else happens.
    fn observe_term(&self, st: &mut ServerState, term: u64) -> bool {
        if term > st.current_term {
            info!(
                "node {}: term {} -> {}, becoming follower",
                self.id, st.current_term, term
            );
            st.current_term = term;
            st.voted_for = 0;
            st.role = Role::Follower;
            st.leader_id = 0;
            st.reset_election_deadline();
            st.persist(false, 0);
            return true;
        }
        false
    }

    fn begin_election(&self, st: &mut ServerState) -> RequestVoteArgs {
        st.role = Role::Candidate;
        st.current_term += 1;
        st.voted_for = self.id;
        st.leader_id = 0;
        st.votes = vec![false; self.cluster.len()];
        st.votes[self.me] = true;
        st.reset_election_deadline();
        st.persist(false, 0);
        info!(
            "node {}: election timeout, campaigning in term {}",
            self.id, st.current_term
        );

        // A single-node cluster is its own quorum.
        self.try_become_leader(st);

        RequestVoteArgs {
            term: st.current_term,
            candidate_id: self.id,
            last_log_index: st.last_index(),
            last_log_term: st.last_term(),
        }
    }

    async fn broadcast_votes(self: &Arc<Self>, args: RequestVoteArgs) {
        for peer in 0..self.cluster.len() {
            if peer == self.me {
                continue;
            }
            let node = self.clone();
            let args = args.clone();
            tokio::spawn(async move {
                let Some(reply) = node.call_request_vote(peer, args.clone()).await else {
                    return;
                };
                let mut st = node.state.lock().await;
                if node.observe_term(&mut st, reply.term) {
                    return;
                }
                if st.role != Role::Candidate || st.current_term != args.term {
                    return;
                }
                if reply.vote_granted {
                    debug!(
                        "node {}: vote granted by node {} in term {}",
                        node.id, node.cluster[peer].id, st.current_term
                    );
                    st.votes[peer] = true;
                    node.try_become_leader(&mut st);
                }
            });
        }
    }

    fn try_become_leader(&self, st: &mut ServerState) {
        let quorum = self.cluster.len() / 2 + 1;
        if st.role != Role::Candidate || st.votes.iter().filter(|v| **v).count() < quorum {
            return;
        }

        info!("node {}: won election for term {}", self.id, st.current_term);
        st.role = Role::Leader;
        st.leader_id = self.id;
        let next = st.last_index() + 1;
        for peer in 0..self.cluster.len() {
            st.next_index[peer] = next;
            st.match_index[peer] = 0;
        }

        // The no-op lets this leader commit entries left over from prior
        // terms by committing an entry of its own term on top of them.
        let term = st.current_term;
        st.log.push(LogEntry::new(term, Vec::new()));
        st.persist(true, 1);
        st.heartbeat_deadline = Instant::now();
    }

    async fn broadcast_append(self: &Arc<Self>) {
        for peer in 0..self.cluster.len() {
            if peer == self.me {
                continue;
            }
            let node = self.clone();
            tokio::spawn(async move { node.append_to_peer(peer).await });
        }
    }

    async fn append_to_peer(self: Arc<Self>, peer: usize) {
        let (args, prev_log_index) = {
            let st = self.state.lock().await;
            if st.role != Role::Leader {
                return;
            }
            let next = st.next_index[peer].max(1);
            let prev_log_index = next - 1;
            let from = next as usize;
            let upto = st.log.len().min(from + BATCH_MAX);
            let entries: Vec<Entry> = if from < upto {
                st.log[from..upto].iter().map(Entry::from).collect()
            } else {
                Vec::new()
            };
            let args = AppendEntriesArgs {
                term: st.current_term,
                leader_id: self.id,
                prev_log_index,
                prev_log_term: st.log[prev_log_index as usize].term,
                entries,
                leader_commit: st.commit_index,
            };
            (args, prev_log_index)
        };

        let req_term = args.term;
        let n_entries = args.entries.len() as u64;
        let Some(reply) = self.call_append_entries(peer, args).await else {
            return;
        };

        let mut st = self.state.lock().await;
        if self.observe_term(&mut st, reply.term) {
            return;
        }
        if st.current_term != req_term || st.role != Role::Leader {
            return;
        }

        if reply.success {
            st.next_index[peer] = (prev_log_index + n_entries + 1).max(1);
            st.match_index[peer] = st.next_index[peer] - 1;
            if n_entries > 0 {
                debug!(
                    "node {}: node {} accepted {} entries up to {}",
                    self.id, self.cluster[peer].id, n_entries, st.match_index[peer]
                );
            }
        } else {
            st.next_index[peer] = (st.next_index[peer].saturating_sub(1)).max(1);
            debug!(
                "node {}: node {} rejected, backing off to {}",
                self.id, self.cluster[peer].id, st.next_index[peer]
            );
        }
    }

    /// Leader-only: advance the commit index to the highest entry of the
    /// current term covered by a quorum of match indices. Entries from
    /// older terms are never counted directly; they commit transitively
    /// once an entry of this term does.
    fn advance_commit(&self, st: &mut ServerState) {
        let quorum = self.cluster.len() / 2 + 1;
        let mut i = st.last_index();
        while i > st.commit_index {
            let mut replicas = 1;
            for peer in 0..self.cluster.len() {
                if peer != self.me && st.match_index[peer] >= i {
                    replicas += 1;
                }
            }
            if replicas >= quorum && st.log[i as usize].term == st.current_term {
                debug!("node {}: commit index {} -> {}", self.id, st.commit_index, i);
                st.commit_index = i;
                break;
            }
            i -= 1;
        }
    }

    fn apply_committed(&self, st: &mut ServerState) {
        while st.last_applied < st.commit_index {
            st.last_applied += 1;
            let idx = st.last_applied as usize;
            let outcome = if st.log[idx].command.is_empty() {
                Ok(Vec::new())
            } else {
                self.machine.apply(&st.log[idx].command)
            };
            if let Some(tx) = st.log[idx].result.take() {
                // The waiter may have gone away; that is fine.
                let _ = tx.send(outcome);
            } else if let Err(err) = outcome {
                debug!("node {}: apply error at index {idx}: {err}", self.id);
            }
        }
    }

    async fn handle_request_vote(&self, args: RequestVoteArgs) -> RequestVoteReply {
        let mut st = self.state.lock().await;
        self.observe_term(&mut st, args.term);

        let mut granted = false;
        if args.term == st.current_term {
            let log_ok = args.last_log_term > st.last_term()
                || (args.last_log_term == st.last_term() && args.last_log_index >= st.last_index());
            if log_ok && (st.voted_for == 0 || st.voted_for == args.candidate_id) {
                st.voted_for = args.candidate_id;
                st.reset_election_deadline();
                st.persist(false, 0);
                granted = true;
                info!(
                    "node {}: voting for node {} in term {}",
                    self.id, args.candidate_id, st.current_term
                );
            }
        }

        RequestVoteReply {
            term: st.current_term,
            vote_granted: granted,
        }
    }

    async fn handle_append_entries(&self, args: AppendEntriesArgs) -> AppendEntriesReply {
        let mut st = self.state.lock().await;
        self.observe_term(&mut st, args.term);

        // A candidate that hears from a leader of its own term steps down
        // before processing the request.
        if args.term == st.current_term && st.role == Role::Candidate {
            st.role = Role::Follower;
        }

        if args.term < st.current_term || st.role != Role::Follower {
            return AppendEntriesReply {
                term: st.current_term,
                success: false,
            };
        }

        st.leader_id = args.leader_id;
        st.reset_election_deadline();

        let prev_ok = args.prev_log_index == 0
            || (args.prev_log_index < st.log.len() as u64
                && st.log[args.prev_log_index as usize].term == args.prev_log_term);
        if !prev_ok {
            return AppendEntriesReply {
                term: st.current_term,
                success: false,
            };
        }

        let mut n_new = 0;
        for (k, entry) in args.entries.into_iter().enumerate() {
            let i = args.prev_log_index as usize + 1 + k;
            if i < st.log.len() && st.log[i].term != entry.term {
                assert!(
                    i as u64 > st.commit_index,
                    "refusing to truncate committed entry {i}"
                );
                st.log.truncate(i);
            }
            if i == st.log.len() {
                st.log.push(LogEntry::from(entry));
                n_new += 1;
            } else {
                // Same index, same term: the log-matching property says the
                // entry is already identical.
                assert!(
                    st.log[i].term == entry.term,
                    "log-matching violation at index {i}"
                );
            }
        }

        if args.leader_commit > st.commit_index {
            st.commit_index = args.leader_commit.min(st.last_index());
        }

        st.persist(n_new > 0, n_new);
        if n_new > 0 {
            debug!(
                "node {}: accepted {n_new} entries from leader {}",
                self.id, args.leader_id
            );
        }
        AppendEntriesReply {
            term: st.current_term,
            success: true,
        }
    }

    // Peer clients are created lazily on first use and dropped on any
    // failure so the next call reconnects.
    async fn client(&self, peer: usize) -> Option<RaftClient<Channel>> {
        let mut slot = self.clients[peer].lock().await;
        if slot.is_none() {
            let endpoint = Endpoint::from_shared(format!("http://{}", self.cluster[peer].addr))
                .ok()?
                .connect_timeout(Duration::from_millis(RPC_TIMEOUT_MS))
                .timeout(Duration::from_millis(RPC_TIMEOUT_MS));
            match endpoint.connect().await {
                Ok(channel) => *slot = Some(RaftClient::new(channel)),
                Err(err) => {
                    debug!(
                        "node {}: connect to node {} failed: {err}",
                        self.id, self.cluster[peer].id
                    );
                    return None;
                }
            }
        }
        slot.clone()
    }

    async fn call_request_vote(&self, peer: usize, args: RequestVoteArgs) -> Option<RequestVoteReply> {
        let mut client = self.client(peer).await?;
        match client.request_vote(Request::new(args)).await {
            Ok(resp) => Some(resp.into_inner()),
            Err(status) => {
                debug!(
                    "node {}: request_vote to node {} failed: {status}",
                    self.id, self.cluster[peer].id
                );
                *self.clients[peer].lock().await = None;
                None
            }
        }
    }

    async fn call_append_entries(
        &self,
        peer: usize,
        args: AppendEntriesArgs,
    ) -> Option<AppendEntriesReply> {
        let mut client = self.client(peer).await?;
        match client.append_entries(Request::new(args)).await {
            Ok(resp) => Some(resp.into_inner()),
            Err(status) => {
                debug!(
                    "node {}: append_entries to node {} failed: {status}",
                    self.id, self.cluster[peer].id
                );
                *self.clients[peer].lock().await = None;
                None
            }
        }
    }
}

/// gRPC service implementation

struct RaftService {
    node: Arc<RaftNode>,
}

#[tonic::async_trait]
impl Raft for RaftService {
    async fn request_vote(
        &self,
        request: Request<RequestVoteArgs>,
    ) -> std::result::Result<Response<RequestVoteReply>, Status> {
        Ok(Response::new(
            self.node.handle_request_vote(request.into_inner()).await,
        ))
    }

    async fn append_entries(
        &self,
        request: Request<AppendEntriesArgs>,
    ) -> std::result::Result<Response<AppendEntriesReply>, Status> {
        Ok(Response::new(
            self.node.handle_append_entries(request.into_inner()).await,
        ))
    }
}
