//! Replication actor -- peer-peer messaging.

use super::{PeerMsg, ReplicaActor, Role};

use crate::server::{Lsn, OpKind, ReplicaId, RequestEntry};
use crate::utils::RepliKvError;
use crate::{logged_err, pf_debug, pf_error, pf_info, pf_trace, pf_warn};

use std::sync::atomic::Ordering;

// ReplicaActor peer-peer messages handling
impl ReplicaActor {
    /// Dispatcher for messages arriving from peers.
    pub(super) fn handle_peer_msg(
        &mut self,
        peer: ReplicaId,
        msg: PeerMsg,
    ) -> Result<(), RepliKvError> {
        match msg {
            PeerMsg::Subscribe => self.handle_subscribe(peer),
            PeerMsg::Write { lsn, key, val } => {
                self.handle_write(peer, lsn, key, val)
            }
            PeerMsg::Read { lsn, key } => self.handle_read(peer, lsn, key),
            PeerMsg::Ack { lsn } => self.handle_ack(peer, lsn),
            PeerMsg::Commit { lsn } => self.handle_commit(peer, lsn),
        }
    }

    /// Handler of Subscribe message from a starting backup (primary side).
    /// Appends the subscriber to the fan-out target list and hands it a
    /// human-readable label. Writes submitted before every expected backup
    /// has subscribed simply fan out to a smaller set.
    pub(super) fn handle_subscribe(
        &mut self,
        peer: ReplicaId,
    ) -> Result<(), RepliKvError> {
        if self.role != Role::Primary {
            return logged_err!(self.role; "got Subscribe from {} but am not primary",
                                          peer);
        }
        if self.targets.contains(&peer) {
            pf_warn!(self.role; "duplicate Subscribe from peer {}", peer);
            return Ok(());
        }

        self.targets.push(peer);
        let name = format!("Backup{}", self.targets.len());
        pf_info!(self.role; "received Subscribe from peer {}, now {}",
                            peer, name);
        self.target_names.insert(peer, name);
        pf_debug!(self.role; "current targets: {:?}", self.targets);

        if self.targets.len() >= self.config.expected_backups as usize {
            pf_info!(self.role; "all {} backups have subscribed, ready to process requests",
                                self.config.expected_backups);
        }
        Ok(())
    }

    /// Handler of Write message from the primary (backup side). Records the
    /// entry in the log and acks; the store is not touched until the
    /// corresponding Commit arrives.
    pub(super) fn handle_write(
        &mut self,
        peer: ReplicaId,
        lsn: Lsn,
        key: String,
        val: String,
    ) -> Result<(), RepliKvError> {
        if self.role != Role::Backup {
            return logged_err!(self.role; "got Write({}) from {} but am not backup",
                                          lsn, peer);
        }
        pf_debug!(self.role; "received Write(LSN={}, key='{}') from {}",
                             lsn, key, peer);

        self.oplog.record(RequestEntry {
            kind: OpKind::Write,
            key,
            val,
            lsn,
        });
        self.transport.send_msg(PeerMsg::Ack { lsn }, peer)?;
        Ok(())
    }

    /// Handler of Read message from the primary (backup side). Reads
    /// consume LSN slots like writes and are recorded in the log, but never
    /// mutate the store; the backup accounts for the slot by advancing
    /// lastAppliedLSN, then acks. No Commit will follow.
    pub(super) fn handle_read(
        &mut self,
        peer: ReplicaId,
        lsn: Lsn,
        key: String,
    ) -> Result<(), RepliKvError> {
        if self.role != Role::Backup {
            return logged_err!(self.role; "got Read({}) from {} but am not backup",
                                          lsn, peer);
        }
        pf_debug!(self.role; "received Read(LSN={}, key='{}') from {}",
                             lsn, key, peer);

        self.oplog.record(RequestEntry {
            kind: OpKind::Read,
            key,
            val: String::new(),
            lsn,
        });

        let advanced = lsn > self.last_applied.load(Ordering::Acquire);
        if advanced {
            self.last_applied.store(lsn, Ordering::Release);
            pf_debug!(self.role; "advanced lastApplied to {} for read slot",
                                 lsn);
        }

        self.transport.send_msg(PeerMsg::Ack { lsn }, peer)?;

        // a queued commit may have become applicable behind the read slot
        if advanced {
            self.drain_pending_commits()?;
        }
        Ok(())
    }

    /// Handler of Ack message from a backup (primary side). Counts the ack
    /// (deduplicated by sender); once the entry reaches quorum it applies
    /// immediately if its predecessor has applied, else waits in the
    /// pending-commit queue.
    pub(super) fn handle_ack(
        &mut self,
        peer: ReplicaId,
        lsn: Lsn,
    ) -> Result<(), RepliKvError> {
        if self.role != Role::Primary {
            return logged_err!(self.role; "got Ack({}) from {} but am not primary",
                                          lsn, peer);
        }

        let acks = match self.pending.record_ack(lsn, peer) {
            Some(acks) => acks,
            None => {
                // entry already completed or never existed
                pf_debug!(self.role; "late Ack({}) from {}, dropped", lsn, peer);
                return Ok(());
            }
        };
        let sender = self
            .target_names
            .get(&peer)
            .cloned()
            .unwrap_or_else(|| format!("peer {}", peer));
        pf_trace!(self.role; "Ack({}) from {}: {} of {} needed",
                             lsn, sender, acks, self.quorum);

        if acks < self.quorum {
            return Ok(());
        }
        if !self.pending.mark_committed(lsn) {
            // quorum was already reached by an earlier ack
            return Ok(());
        }

        self.try_apply_committed(lsn)
    }

    /// Handler of Commit message from the primary (backup side). Applies in
    /// strict LSN order: a commit ahead of its predecessor waits in the
    /// pending-commit queue, a stale one is dropped.
    pub(super) fn handle_commit(
        &mut self,
        peer: ReplicaId,
        lsn: Lsn,
    ) -> Result<(), RepliKvError> {
        if self.role != Role::Backup {
            return logged_err!(self.role; "got Commit({}) from {} but am not backup",
                                          lsn, peer);
        }
        pf_debug!(self.role; "received Commit(LSN={}) from {}", lsn, peer);

        let next = self.last_applied.load(Ordering::Acquire) + 1;
        if lsn == next {
            match self.oplog.get(lsn).cloned() {
                Some(entry) => {
                    self.apply_to_backup(&entry)?;
                    self.drain_pending_commits()?;
                }
                None => {
                    // nothing sane to do without the entry; the LSN stays
                    // unapplied until a catch-up path exists
                    pf_warn!(self.role; "Commit({}) but LSN not in log, cannot apply",
                                        lsn);
                }
            }
        } else if lsn > next {
            pf_debug!(self.role; "queueing Commit({}) (waiting for LSN {})",
                                 lsn, next);
            match self.oplog.get(lsn) {
                Some(entry) => {
                    self.pending_commits.insert(lsn, entry.clone());
                }
                None => {
                    pf_warn!(self.role; "Commit({}) but LSN not in log, cannot queue",
                                        lsn);
                }
            }
        } else {
            pf_debug!(self.role; "LSN {} already applied (lastApplied={})",
                                 lsn, next - 1);
        }
        Ok(())
    }
}
