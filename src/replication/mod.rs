//! RepliKV primary/backup replication actor.
//!
//! Writes are serialized through the primary: each is stamped with a fresh
//! LSN, recorded in the log, and pushed to every subscribed backup. Once a
//! quorum of replicas (counting the primary's own self-ack) has
//! acknowledged an LSN, it is applied to the store in strict LSN order;
//! acknowledgments that arrive ahead of a predecessor wait in the
//! pending-commit queue. Primary reads run through the same pipeline, which
//! gives them the same linearization point as writes; backup reads are
//! served locally and may be stale.

mod execution;
mod messages;
mod request;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::server::{
    Lsn, OpLog, PendingTable, ReplicaId, RequestEntry, Response, Store,
    Ticket, TransportHub,
};
use crate::utils::RepliKvError;
use crate::{logged_err, parsed_config, pf_error, pf_info, pf_warn};

use serde::{Deserialize, Serialize};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Duration;

/// Role a replica plays in the deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Primary,
    Backup,
}

impl Role {
    /// Role name used as the log line prefix.
    pub fn name(self) -> &'static str {
        match self {
            Role::Primary => "Primary",
            Role::Backup => "Backup",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// The primary's ID in ack bookkeeping; also the peer ID under which a
/// backup files its transport connection to the primary.
pub(crate) const PRIMARY: ReplicaId = 0;

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplicaConfig {
    /// Number of backup replicas expected to subscribe. Quorum is computed
    /// from this count.
    pub expected_backups: u8,

    /// How long a front-end handler waits on a completion signal before
    /// reporting a timeout to the client, in milliseconds.
    pub req_timeout_ms: u64,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        ReplicaConfig {
            expected_backups: 2,
            req_timeout_ms: 30_000,
        }
    }
}

/// Peer-peer message type.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum PeerMsg {
    /// Backup -> primary on startup.
    Subscribe,

    /// Primary -> backups: log this write at the given LSN.
    Write { lsn: Lsn, key: String, val: String },

    /// Primary -> backups: linearization point for a quorum read.
    Read { lsn: Lsn, key: String },

    /// Backup -> primary: the LSN has been logged.
    Ack { lsn: Lsn },

    /// Primary -> backups: the LSN has reached quorum, apply it.
    Commit { lsn: Lsn },
}

/// A client request on its way from the front-end into the actor mailbox.
#[derive(Debug)]
pub(crate) struct Submission {
    pub(crate) entry: RequestEntry,
    pub(crate) ticket: Ticket,
}

/// The replication actor. A single task owns the log, the pending-commit
/// queue, and the counters, and consumes one message at a time from its
/// transport and its submission mailbox, so none of them need locks against
/// each other.
pub struct ReplicaActor {
    /// My role.
    role: Role,

    /// Configuration parameters struct.
    config: ReplicaConfig,

    /// Ack count required before an LSN may apply, computed from the
    /// configured backup count.
    quorum: u8,

    /// TransportHub module.
    transport: TransportHub<PeerMsg>,

    /// Receiver side of the submission mailbox.
    rx_submit: mpsc::UnboundedReceiver<Submission>,

    /// Pending-request table shared with the front-end.
    pending: Arc<PendingTable>,

    /// Committed key-value state, shared with the front-end.
    store: Store,

    /// In-memory log of operations.
    oplog: OpLog,

    /// Subscribed backup peers, in subscription order.
    targets: Vec<ReplicaId>,

    /// Human-readable labels for subscribed peers.
    target_names: HashMap<ReplicaId, String>,

    /// Last assigned LSN (primary only). Kept atomic so the front-end can
    /// read it without going through the actor.
    lsn_ctr: Arc<AtomicI64>,

    /// Last LSN whose effect has been applied to the store. Monotonically
    /// non-decreasing.
    last_applied: Arc<AtomicI64>,

    /// Quorum-reached (primary) or commit-received (backup) operations
    /// waiting for their predecessor LSN to apply, drained in ascending
    /// order.
    pending_commits: BTreeMap<Lsn, RequestEntry>,

    /// Address of the primary's internal port (backup only).
    primary_addr: Option<SocketAddr>,
}

impl ReplicaActor {
    /// Creates a new replication actor and sets up its transport, store,
    /// and pending table. Returns the actor together with the handle the
    /// HTTP front-end uses to reach it.
    pub async fn new_and_setup(
        role: Role,
        p2p_addr: SocketAddr,
        primary_addr: Option<SocketAddr>,
        config_str: Option<&str>,
    ) -> Result<(Self, ReplicaHandle), RepliKvError> {
        let config = parsed_config!(config_str => ReplicaConfig;
                                    expected_backups, req_timeout_ms)?;
        if config.req_timeout_ms == 0 {
            return logged_err!(
                role;
                "invalid config.req_timeout_ms '{}'",
                config.req_timeout_ms
            );
        }
        if role == Role::Backup && primary_addr.is_none() {
            return logged_err!(role; "backup requires the primary's address");
        }

        let population = match config.expected_backups.checked_add(1) {
            Some(population) => population,
            None => {
                return logged_err!(
                    role;
                    "invalid config.expected_backups '{}'",
                    config.expected_backups
                )
            }
        };
        let quorum = (population + 1) / 2;
        pf_info!(role; "population {} quorum {}", population, quorum);

        let transport =
            TransportHub::new_and_setup(role.name(), p2p_addr).await?;

        let (tx_submit, rx_submit) = mpsc::unbounded_channel();
        let pending = Arc::new(PendingTable::new(population));
        let store = Store::new();
        let lsn_ctr = Arc::new(AtomicI64::new(0));
        let last_applied = Arc::new(AtomicI64::new(0));

        let handle = ReplicaHandle {
            role,
            tx_submit,
            pending: pending.clone(),
            store: store.clone(),
            req_timeout: Duration::from_millis(config.req_timeout_ms),
            lsn_ctr: lsn_ctr.clone(),
            last_applied: last_applied.clone(),
        };

        let actor = ReplicaActor {
            role,
            config,
            quorum,
            transport,
            rx_submit,
            pending,
            store,
            oplog: OpLog::new(),
            targets: vec![],
            target_names: HashMap::new(),
            lsn_ctr,
            last_applied,
            pending_commits: BTreeMap::new(),
            primary_addr,
        };

        Ok((actor, handle))
    }

    /// Main event loop logic of running this replica.
    pub async fn run(
        &mut self,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<(), RepliKvError> {
        // a backup announces itself to its configured primary before
        // anything else
        if self.role == Role::Backup {
            let primary_addr = match self.primary_addr {
                Some(addr) => addr,
                None => {
                    return logged_err!(self.role; "no primary address configured")
                }
            };
            self.transport
                .connect_to_peer(PRIMARY, primary_addr)
                .await?;
            self.transport.send_msg(PeerMsg::Subscribe, PRIMARY)?;
            pf_info!(self.role; "subscribed to primary at '{}'", primary_addr);
        }

        loop {
            tokio::select! {
                // client request submitted by the front-end
                sub = self.rx_submit.recv() => {
                    match sub {
                        Some(sub) => {
                            if let Err(e) = self.handle_submission(sub) {
                                pf_error!(self.role; "error handling submission: {}", e);
                            }
                        },
                        None => {
                            return logged_err!(self.role; "submission channel closed");
                        }
                    }
                },

                // message from peer
                msg = self.transport.recv_msg() => {
                    if let Err(e) = msg {
                        pf_error!(self.role; "error receiving peer msg: {}", e);
                        continue;
                    }
                    let (peer, msg) = msg.unwrap();
                    if let Err(e) = self.handle_peer_msg(peer, msg) {
                        pf_error!(self.role; "error handling peer msg: {}", e);
                    }
                },

                // receiving termination signal
                _ = rx_term.changed() => {
                    pf_warn!(self.role; "replica caught termination signal ({} keys, {} logged ops, {} pending reqs)",
                                        self.store.num_keys(),
                                        self.oplog.len(),
                                        self.pending.num_pending());
                    return Ok(());
                }
            }
        }
    }

    /// Role of this replica.
    pub fn role(&self) -> Role {
        self.role
    }
}

/// Ownership-neutral handle through which the HTTP front-end reaches the
/// replication actor: the submission mailbox plus the shared pending table
/// and store. The pending table is the rendezvous between the two sides;
/// neither owns the other.
#[derive(Clone)]
pub struct ReplicaHandle {
    role: Role,
    tx_submit: mpsc::UnboundedSender<Submission>,
    pending: Arc<PendingTable>,
    store: Store,
    req_timeout: Duration,
    lsn_ctr: Arc<AtomicI64>,
    last_applied: Arc<AtomicI64>,
}

impl ReplicaHandle {
    /// Role of the replica behind this handle.
    pub fn role(&self) -> Role {
        self.role
    }

    /// How long a front-end handler should wait on a completion signal.
    pub fn req_timeout(&self) -> Duration {
        self.req_timeout
    }

    /// Submits a client request to the actor. The request is staged in the
    /// pending table and handed to the actor's mailbox; returns the
    /// receiver half of the completion signal to park on.
    pub fn submit(
        &self,
        entry: RequestEntry,
    ) -> Result<oneshot::Receiver<Response>, RepliKvError> {
        let (ticket, rx_done) = self.pending.register(entry.clone());
        if let Err(e) = self.tx_submit.send(Submission { entry, ticket }) {
            self.pending.discard(ticket);
            return Err(RepliKvError::msg(e));
        }
        Ok(rx_done)
    }

    /// Reads straight from the local store, bypassing the replication
    /// engine. This is the backup local-read path and may return stale
    /// values.
    pub fn local_read(&self, key: &str) -> Response {
        self.store.read_response(key)
    }

    /// Last LSN the primary has assigned. For debugging visibility only.
    pub fn current_lsn(&self) -> Lsn {
        self.lsn_ctr.load(Ordering::Acquire)
    }

    /// Last LSN applied to this replica's store.
    pub fn last_applied(&self) -> Lsn {
        self.last_applied.load(Ordering::Acquire)
    }

    /// LSNs completed so far, in completion order. For debugging.
    pub fn committed_trace(&self) -> Vec<Lsn> {
        self.pending.committed_trace()
    }
}

#[cfg(test)]
mod replication_tests {
    use super::*;

    async fn test_primary(
        port: u16,
        config: &str,
    ) -> (ReplicaActor, ReplicaHandle) {
        ReplicaActor::new_and_setup(
            Role::Primary,
            format!("127.0.0.1:{}", port).parse().unwrap(),
            None,
            Some(config),
        )
        .await
        .unwrap()
    }

    async fn test_backup(port: u16) -> (ReplicaActor, ReplicaHandle) {
        // the primary address is never dialed since run() is not entered
        ReplicaActor::new_and_setup(
            Role::Backup,
            format!("127.0.0.1:{}", port).parse().unwrap(),
            Some("127.0.0.1:1".parse().unwrap()),
            None,
        )
        .await
        .unwrap()
    }

    /// Feeds every mailbox submission through the actor's handler.
    fn pump(actor: &mut ReplicaActor) {
        while let Ok(sub) = actor.rx_submit.try_recv() {
            actor.handle_submission(sub).unwrap();
        }
    }

    #[tokio::test]
    async fn write_reaches_quorum_and_applies() {
        let (mut actor, handle) =
            test_primary(32101, "expected_backups = 2").await;
        actor.handle_subscribe(1).unwrap();
        actor.handle_subscribe(2).unwrap();

        let rx = handle.submit(RequestEntry::write("a", "1")).unwrap();
        pump(&mut actor);
        assert_eq!(handle.current_lsn(), 1);
        assert_eq!(handle.last_applied(), 0);

        // one backup ack plus the self-ack reaches quorum 2
        actor.handle_ack(1, 1).unwrap();
        assert_eq!(handle.last_applied(), 1);
        assert_eq!(rx.await.unwrap(), Response::ok("a", "1"));
        assert_eq!(handle.committed_trace(), vec![1]);

        // the other backup's ack arrives late and is dropped
        actor.handle_ack(2, 1).unwrap();
        assert_eq!(handle.last_applied(), 1);
    }

    #[tokio::test]
    async fn out_of_order_acks_apply_in_lsn_order() {
        let (mut actor, handle) =
            test_primary(32102, "expected_backups = 2").await;
        actor.handle_subscribe(1).unwrap();

        let rx1 = handle.submit(RequestEntry::write("a", "1")).unwrap();
        let rx2 = handle.submit(RequestEntry::write("b", "2")).unwrap();
        pump(&mut actor);
        assert_eq!(handle.current_lsn(), 2);

        // ack for LSN 2 first: reaches quorum but must wait for LSN 1
        actor.handle_ack(1, 2).unwrap();
        assert_eq!(handle.last_applied(), 0);
        assert!(!handle.local_read("b").success);

        // ack for LSN 1: applies 1, then drains 2
        actor.handle_ack(1, 1).unwrap();
        assert_eq!(handle.last_applied(), 2);
        assert_eq!(rx1.await.unwrap(), Response::ok("a", "1"));
        assert_eq!(rx2.await.unwrap(), Response::ok("b", "2"));
        assert_eq!(handle.committed_trace(), vec![1, 2]);
    }

    #[tokio::test]
    async fn quorum_reads_linearize() {
        let (mut actor, handle) =
            test_primary(32103, "expected_backups = 2").await;
        actor.handle_subscribe(1).unwrap();

        let rx_w = handle.submit(RequestEntry::write("a", "1")).unwrap();
        pump(&mut actor);
        actor.handle_ack(1, 1).unwrap();
        assert_eq!(rx_w.await.unwrap(), Response::ok("a", "1"));

        let rx_hit = handle.submit(RequestEntry::read("a")).unwrap();
        let rx_miss =
            handle.submit(RequestEntry::read("missing")).unwrap();
        pump(&mut actor);
        actor.handle_ack(1, 2).unwrap();
        actor.handle_ack(1, 3).unwrap();
        assert_eq!(rx_hit.await.unwrap(), Response::ok("a", "1"));
        assert_eq!(
            rx_miss.await.unwrap(),
            Response::err("missing", "Key not found")
        );
        assert_eq!(handle.last_applied(), 3);
    }

    #[tokio::test]
    async fn duplicate_acks_do_not_fake_quorum() {
        let (mut actor, handle) =
            test_primary(32104, "expected_backups = 4").await;
        // quorum is 3 out of population 5
        assert_eq!(actor.quorum, 3);
        actor.handle_subscribe(1).unwrap();
        actor.handle_subscribe(2).unwrap();

        let _rx = handle.submit(RequestEntry::write("a", "1")).unwrap();
        pump(&mut actor);

        actor.handle_ack(1, 1).unwrap();
        actor.handle_ack(1, 1).unwrap();
        assert_eq!(handle.last_applied(), 0);

        actor.handle_ack(2, 1).unwrap();
        assert_eq!(handle.last_applied(), 1);
    }

    #[tokio::test]
    async fn backup_commit_gap_waits_for_predecessor() {
        let (mut actor, handle) = test_backup(32105).await;

        actor.handle_write(0, 1, "a".into(), "1".into()).unwrap();
        actor.handle_write(0, 2, "b".into(), "2".into()).unwrap();

        // commit for LSN 2 arrives first; nothing applies
        actor.handle_commit(0, 2).unwrap();
        assert_eq!(handle.last_applied(), 0);
        assert!(!handle.local_read("a").success);
        assert!(!handle.local_read("b").success);

        // commit for LSN 1 unblocks both, in order
        actor.handle_commit(0, 1).unwrap();
        assert_eq!(handle.last_applied(), 2);
        assert_eq!(handle.local_read("a"), Response::ok("a", "1"));
        assert_eq!(handle.local_read("b"), Response::ok("b", "2"));

        // duplicate commit is dropped
        actor.handle_commit(0, 1).unwrap();
        assert_eq!(handle.last_applied(), 2);
    }

    #[tokio::test]
    async fn backup_read_slots_account_for_lsn_order() {
        let (mut actor, handle) = test_backup(32106).await;

        actor.handle_write(0, 1, "a".into(), "1".into()).unwrap();
        actor.handle_commit(0, 1).unwrap();
        assert_eq!(handle.last_applied(), 1);

        // a read consumes LSN 2 without touching the store
        actor.handle_read(0, 2, "a".into()).unwrap();
        assert_eq!(handle.last_applied(), 2);
        assert_eq!(handle.local_read("a"), Response::ok("a", "1"));

        actor.handle_write(0, 3, "b".into(), "2".into()).unwrap();
        actor.handle_commit(0, 3).unwrap();
        assert_eq!(handle.last_applied(), 3);
        assert_eq!(handle.local_read("b"), Response::ok("b", "2"));
    }

    #[tokio::test]
    async fn commit_for_unlogged_lsn_does_not_wedge() {
        let (mut actor, handle) = test_backup(32107).await;
        actor.handle_commit(0, 1).unwrap();
        actor.handle_commit(0, 5).unwrap();
        assert_eq!(handle.last_applied(), 0);

        // the actor still works afterwards
        actor.handle_write(0, 1, "a".into(), "1".into()).unwrap();
        actor.handle_commit(0, 1).unwrap();
        assert_eq!(handle.last_applied(), 1);
    }

    #[tokio::test]
    async fn subscribers_get_labels_in_order() {
        let (mut actor, _handle) =
            test_primary(32108, "expected_backups = 2").await;
        actor.handle_subscribe(1).unwrap();
        actor.handle_subscribe(2).unwrap();
        actor.handle_subscribe(2).unwrap(); // duplicate ignored
        assert_eq!(actor.targets, vec![1, 2]);
        assert_eq!(actor.target_names[&1], "Backup1");
        assert_eq!(actor.target_names[&2], "Backup2");
    }

    #[tokio::test]
    async fn lsns_are_contiguous_from_one() {
        let (mut actor, handle) =
            test_primary(32109, "expected_backups = 1").await;
        for i in 0..5 {
            let _rx = handle
                .submit(RequestEntry::write(format!("k{}", i), "v"))
                .unwrap();
        }
        pump(&mut actor);
        assert_eq!(handle.current_lsn(), 5);
        for lsn in 1..=5 {
            assert!(actor.oplog.get(lsn).is_some());
        }
    }

    #[tokio::test]
    async fn submission_to_backup_rejected() {
        let (mut actor, handle) = test_backup(32110).await;
        let rx = handle.submit(RequestEntry::write("a", "1")).unwrap();
        pump(&mut actor);
        let resp = rx.await.unwrap();
        assert!(!resp.success);
        assert_eq!(resp.error, "Not the primary");
    }
}
