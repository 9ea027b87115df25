//! Replication actor -- client request entrance.

use super::{PeerMsg, ReplicaActor, Role, Submission};

use crate::server::OpKind;
use crate::utils::RepliKvError;
use crate::{logged_err, pf_debug, pf_error, pf_warn};

use std::sync::atomic::Ordering;

// ReplicaActor client request entrance
impl ReplicaActor {
    /// Handler of a client request submitted by the front-end. Stamps the
    /// request with the next LSN, relocates its pending entry under that
    /// LSN, records it in the log, and fans it out to every subscribed
    /// backup. Fan-out order is irrelevant to correctness.
    pub(super) fn handle_submission(
        &mut self,
        sub: Submission,
    ) -> Result<(), RepliKvError> {
        let Submission { mut entry, ticket } = sub;

        if self.role != Role::Primary {
            // local reads never reach the mailbox, so this is a stray
            // submission; answer it rather than wedge the waiting handler
            pf_warn!(self.role; "submission on a backup, rejecting");
            self.pending.reject(
                ticket,
                crate::server::Response::err(&entry.key, "Not the primary"),
            );
            return Ok(());
        }

        let lsn = self.lsn_ctr.fetch_add(1, Ordering::AcqRel) + 1;
        entry.lsn = lsn;

        if !self.pending.relocate(ticket, lsn) {
            return logged_err!(self.role; "no staged request under ticket {}",
                                          ticket);
        }

        self.oplog.record(entry.clone());

        let msg = match entry.kind {
            OpKind::Write => PeerMsg::Write {
                lsn,
                key: entry.key.clone(),
                val: entry.val.clone(),
            },
            OpKind::Read => PeerMsg::Read {
                lsn,
                key: entry.key.clone(),
            },
        };
        pf_debug!(self.role; "assigned LSN {} to {:?} '{}', pushing to {} backups",
                             lsn, entry.kind, entry.key, self.targets.len());
        let targets = self.targets.clone();
        self.transport.bcast_msg(msg, &targets)?;

        // a deployment configured with zero backups reaches quorum on the
        // primary's self-ack alone
        if self.quorum <= 1 && self.pending.mark_committed(lsn) {
            self.try_apply_committed(lsn)?;
        }

        Ok(())
    }
}
