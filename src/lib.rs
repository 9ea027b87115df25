//! Public interface to the RepliKV core library, linked by the server
//! executable and the end-to-end tests.

mod http;
mod replication;
mod server;
mod utils;

pub use http::serve_http;
pub use replication::{
    PeerMsg, ReplicaActor, ReplicaConfig, ReplicaHandle, Role,
};
pub use server::{
    Lsn, OpKind, ReplicaId, RequestEntry, Response, Store, SENTINEL_LSN,
};
pub use utils::RepliKvError;
