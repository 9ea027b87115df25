//! Replication actor -- apply step and gap-free drain.

use super::{PeerMsg, ReplicaActor, Role};

use crate::server::{Lsn, OpKind, RequestEntry, Response};
use crate::utils::RepliKvError;
use crate::{logged_err, pf_debug, pf_error, pf_warn};

use std::sync::atomic::Ordering;

// ReplicaActor apply-to-store execution
impl ReplicaActor {
    /// Routes a quorum-reached LSN on the primary: apply now if its
    /// predecessor has applied, queue it if it is ahead, drop it if stale.
    pub(super) fn try_apply_committed(
        &mut self,
        lsn: Lsn,
    ) -> Result<(), RepliKvError> {
        let next = self.last_applied.load(Ordering::Acquire) + 1;
        if lsn == next {
            match self.oplog.get(lsn).cloned() {
                Some(entry) => {
                    self.apply_to_primary(&entry)?;
                    self.drain_pending_commits()
                }
                None => {
                    logged_err!(self.role; "LSN {} missing from log at apply",
                                           lsn)
                }
            }
        } else if lsn > next {
            pf_debug!(self.role; "queueing LSN {} (waiting for LSN {} to apply first)",
                                 lsn, next);
            match self.oplog.get(lsn) {
                Some(entry) => {
                    self.pending_commits.insert(lsn, entry.clone());
                }
                None => {
                    pf_warn!(self.role; "LSN {} missing from log, cannot queue",
                                        lsn);
                }
            }
            Ok(())
        } else {
            pf_debug!(self.role; "LSN {} already applied (lastApplied={})",
                                 lsn, next - 1);
            Ok(())
        }
    }

    /// Applies one LSN on the primary. For writes, the Commit fan-out comes
    /// first: backups must learn of the commit no later than any
    /// client-observable effect on the primary. Then the store mutates (or
    /// the read materializes), lastAppliedLSN advances, and the pending
    /// request completes.
    pub(super) fn apply_to_primary(
        &mut self,
        entry: &RequestEntry,
    ) -> Result<(), RepliKvError> {
        let lsn = entry.lsn;
        if self.pending.get_request(lsn).is_none() {
            // client abandoned (or never registered); apply proceeds anyway
            pf_debug!(self.role; "no pending request registered at LSN {}",
                                 lsn);
        }
        let resp = match entry.kind {
            OpKind::Write => {
                let targets = self.targets.clone();
                self.transport.bcast_msg(PeerMsg::Commit { lsn }, &targets)?;
                self.store.apply_write(&entry.key, &entry.val);
                pf_debug!(self.role; "applied LSN {} (key='{}') to store",
                                     lsn, entry.key);
                Response::ok(&entry.key, &entry.val)
            }
            OpKind::Read => self.store.read_response(&entry.key),
        };

        self.last_applied.store(lsn, Ordering::Release);
        self.pending.complete(lsn, resp);
        Ok(())
    }

    /// Applies one LSN on a backup: store mutation for writes, slot
    /// accounting only for reads.
    pub(super) fn apply_to_backup(
        &mut self,
        entry: &RequestEntry,
    ) -> Result<(), RepliKvError> {
        if entry.kind == OpKind::Write {
            self.store.apply_write(&entry.key, &entry.val);
            pf_debug!(self.role; "applied LSN {} (key='{}') to store",
                                 entry.lsn, entry.key);
        }
        self.last_applied.store(entry.lsn, Ordering::Release);
        Ok(())
    }

    /// Drains the pending-commit queue: as long as the entry at
    /// lastAppliedLSN + 1 is queued, remove and apply it. Stops at the
    /// first gap.
    pub(super) fn drain_pending_commits(
        &mut self,
    ) -> Result<(), RepliKvError> {
        loop {
            let next = self.last_applied.load(Ordering::Acquire) + 1;
            let entry = match self.pending_commits.remove(&next) {
                Some(entry) => entry,
                None => break,
            };

            pf_debug!(self.role; "applying queued LSN {}", next);
            match self.role {
                Role::Primary => self.apply_to_primary(&entry)?,
                Role::Backup => self.apply_to_backup(&entry)?,
            }
        }
        Ok(())
    }
}
