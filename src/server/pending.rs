//! RepliKV pending-request table.

use std::collections::HashMap;
use std::time::Instant;

use crate::server::{Lsn, ReplicaId, RequestEntry, Response};
use crate::utils::Bitmap;
use crate::{pf_trace, pf_warn};

use parking_lot::Mutex;

use tokio::sync::oneshot;

/// Admission ticket identifying a staged request before the replication
/// actor has assigned it an LSN.
pub(crate) type Ticket = u64;

/// A client operation awaiting replication: its request entry, which
/// replicas have acknowledged it, and the one-shot signal its front-end
/// handler is parked on.
struct PendingReq {
    /// The request entry as admitted.
    req: RequestEntry,

    /// Replica IDs that have acknowledged; bit 0 is the primary's self-ack.
    /// Keyed by sender, so a duplicate ack cannot inflate the count.
    acked: Bitmap,

    /// Set once quorum has been reached for this LSN.
    committed: bool,

    /// Admission time, reported when the request completes.
    admitted: Instant,

    /// Completion signal; consumed exactly once.
    tx_done: Option<oneshot::Sender<Response>>,
}

#[derive(Default)]
struct PendingTableInner {
    next_ticket: Ticket,
    staged: HashMap<Ticket, PendingReq>,
    by_lsn: HashMap<Lsn, PendingReq>,
    committed_trace: Vec<Lsn>,
}

/// Mutex-guarded map of in-flight client requests, shared between the HTTP
/// front-end (which registers and awaits) and the replication actor (which
/// relocates, records acks, and completes). This table is the only
/// rendezvous between the two; neither owns the other. All operations are
/// O(1) table lookups with no I/O inside the critical section.
pub(crate) struct PendingTable {
    /// Number of replicas including the primary; sizes the ack bitmaps.
    population: u8,

    inner: Mutex<PendingTableInner>,
}

impl PendingTable {
    /// Creates a new empty table for a cluster of given population.
    pub(crate) fn new(population: u8) -> Self {
        PendingTable {
            population,
            inner: Mutex::new(PendingTableInner::default()),
        }
    }

    /// Registers a request not yet assigned an LSN. Returns the admission
    /// ticket (which must ride along to the actor) and the receiver half of
    /// the completion signal. The ack set starts with the primary's
    /// self-ack already counted.
    pub(crate) fn register(
        &self,
        req: RequestEntry,
    ) -> (Ticket, oneshot::Receiver<Response>) {
        let (tx_done, rx_done) = oneshot::channel();
        let mut acked = Bitmap::new(self.population, false);
        acked.set(0, true).unwrap();

        let mut inner = self.inner.lock();
        let ticket = inner.next_ticket;
        inner.next_ticket += 1;
        inner.staged.insert(
            ticket,
            PendingReq {
                req,
                acked,
                committed: false,
                admitted: Instant::now(),
                tx_done: Some(tx_done),
            },
        );
        (ticket, rx_done)
    }

    /// Relocates a staged request to its assigned LSN, preserving the
    /// completion signal and the starting ack count. Returns false if the
    /// ticket is unknown.
    pub(crate) fn relocate(&self, ticket: Ticket, lsn: Lsn) -> bool {
        let mut inner = self.inner.lock();
        match inner.staged.remove(&ticket) {
            Some(mut pending) => {
                pending.req.lsn = lsn;
                inner.by_lsn.insert(lsn, pending);
                true
            }
            None => false,
        }
    }

    /// Drops a staged request that will never be assigned an LSN (e.g. the
    /// actor is gone). Its signal is dropped unfired, which wakes the
    /// waiting handler with a closed-channel error.
    pub(crate) fn discard(&self, ticket: Ticket) -> bool {
        self.inner.lock().staged.remove(&ticket).is_some()
    }

    /// Fails a staged request with a response, without it ever having been
    /// assigned an LSN.
    pub(crate) fn reject(&self, ticket: Ticket, resp: Response) -> bool {
        let mut inner = self.inner.lock();
        match inner.staged.remove(&ticket) {
            Some(mut pending) => {
                if let Some(tx_done) = pending.tx_done.take() {
                    let _ = tx_done.send(resp);
                }
                true
            }
            None => false,
        }
    }

    /// Records an acknowledgment from a replica for an LSN. Returns the new
    /// ack count, or `None` if no entry is pending at that LSN (late ack).
    /// An ack from an already-counted sender leaves the count unchanged.
    pub(crate) fn record_ack(
        &self,
        lsn: Lsn,
        peer: ReplicaId,
    ) -> Option<u8> {
        let mut inner = self.inner.lock();
        let pending = inner.by_lsn.get_mut(&lsn)?;
        if let Err(e) = pending.acked.set(peer, true) {
            pf_warn!("pending"; "ack from unexpected replica {}: {}", peer, e);
        }
        Some(pending.acked.count())
    }

    /// Marks the entry at an LSN as having reached quorum. Returns false if
    /// it was already marked (or absent), so a duplicate quorum trigger can
    /// be recognized.
    pub(crate) fn mark_committed(&self, lsn: Lsn) -> bool {
        let mut inner = self.inner.lock();
        match inner.by_lsn.get_mut(&lsn) {
            Some(pending) if !pending.committed => {
                pending.committed = true;
                true
            }
            _ => false,
        }
    }

    /// Looks up a clone of the request entry pending at an LSN.
    pub(crate) fn get_request(&self, lsn: Lsn) -> Option<RequestEntry> {
        self.inner.lock().by_lsn.get(&lsn).map(|p| p.req.clone())
    }

    /// Completes the request pending at an LSN: fires its one-shot signal
    /// with the response, removes the entry, and appends the LSN to the
    /// committed trace. A completion for an absent LSN is a no-op (the
    /// signal can only ever fire once); so is delivery to a handler that
    /// has already timed out and dropped its receiver.
    pub(crate) fn complete(&self, lsn: Lsn, resp: Response) -> bool {
        let mut inner = self.inner.lock();
        match inner.by_lsn.remove(&lsn) {
            Some(mut pending) => {
                inner.committed_trace.push(lsn);
                pf_trace!("pending"; "LSN {} completed after {:?}",
                                     lsn, pending.admitted.elapsed());
                if let Some(tx_done) = pending.tx_done.take() {
                    // receiver may be gone; an unheard completion is fine
                    let _ = tx_done.send(resp);
                }
                true
            }
            None => false,
        }
    }

    /// LSNs completed so far, in completion order.
    pub(crate) fn committed_trace(&self) -> Vec<Lsn> {
        self.inner.lock().committed_trace.clone()
    }

    /// Number of requests currently pending (staged or LSN-assigned).
    pub(crate) fn num_pending(&self) -> usize {
        let inner = self.inner.lock();
        inner.staged.len() + inner.by_lsn.len()
    }
}
