//! RepliKV in-memory operation log.

use std::collections::HashMap;

use crate::server::{Lsn, RequestEntry};
use crate::pf_warn;

/// Ordered record of operations keyed by LSN. On the primary an entry is
/// recorded at LSN assignment; on a backup when the corresponding Write or
/// Read replication message arrives. An LSN is never rewritten.
///
/// The log is volatile and private to the replication actor.
#[derive(Debug, Default)]
pub(crate) struct OpLog {
    entries: HashMap<Lsn, RequestEntry>,
}

impl OpLog {
    /// Creates a new empty log.
    pub(crate) fn new() -> Self {
        OpLog {
            entries: HashMap::new(),
        }
    }

    /// Records an entry at its LSN. A second record at an occupied LSN is
    /// ignored; the first entry stands.
    pub(crate) fn record(&mut self, entry: RequestEntry) {
        debug_assert!(entry.lsn > 0);
        if let Some(existing) = self.entries.get(&entry.lsn) {
            pf_warn!("log"; "LSN {} already recorded ({:?}); keeping it",
                            entry.lsn, existing.kind);
            return;
        }
        self.entries.insert(entry.lsn, entry);
    }

    /// Looks up the entry recorded at an LSN.
    pub(crate) fn get(&self, lsn: Lsn) -> Option<&RequestEntry> {
        self.entries.get(&lsn)
    }

    /// Number of recorded entries.
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
