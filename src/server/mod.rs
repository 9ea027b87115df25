//! RepliKV's server functionality modules.

mod oplog;
mod pending;
mod statemach;
mod transport;

pub use statemach::{
    Lsn, OpKind, RequestEntry, Response, Store, SENTINEL_LSN,
};
pub use transport::ReplicaId;

pub(crate) use oplog::OpLog;
pub(crate) use pending::{PendingTable, Ticket};
pub(crate) use transport::TransportHub;
