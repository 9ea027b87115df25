//! RepliKV server state machine module implementation.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use serde::{Deserialize, Serialize};

/// Log sequence number type. Assigned LSNs are positive and form a
/// contiguous sequence starting at 1 with no gaps and no reuse.
pub type Lsn = i64;

/// LSN carried by a request before the primary has assigned the real one.
pub const SENTINEL_LSN: Lsn = -1;

/// Kind of operation requested by a client.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum OpKind {
    /// Put a new value into key.
    Write,

    /// Get the value of given key.
    Read,
}

/// A client operation as recorded in the log. Immutable once recorded at a
/// given LSN.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct RequestEntry {
    /// Kind of operation.
    pub kind: OpKind,

    /// Key being read or written.
    pub key: String,

    /// Value being written; empty for reads.
    pub val: String,

    /// Assigned LSN, or `SENTINEL_LSN` before assignment.
    pub lsn: Lsn,
}

impl RequestEntry {
    /// Creates an unassigned write entry.
    pub fn write(key: impl Into<String>, val: impl Into<String>) -> Self {
        RequestEntry {
            kind: OpKind::Write,
            key: key.into(),
            val: val.into(),
            lsn: SENTINEL_LSN,
        }
    }

    /// Creates an unassigned read entry.
    pub fn read(key: impl Into<String>) -> Self {
        RequestEntry {
            kind: OpKind::Read,
            key: key.into(),
            val: String::new(),
            lsn: SENTINEL_LSN,
        }
    }
}

/// Result of a completed operation, delivered back to the waiting client
/// through its pending-request completion signal.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct Response {
    pub success: bool,
    pub key: String,
    pub value: String,
    pub error: String,
}

impl Response {
    /// Successful operation echoing the committed (or read) value.
    pub fn ok(key: impl Into<String>, value: impl Into<String>) -> Self {
        Response {
            success: true,
            key: key.into(),
            value: value.into(),
            error: String::new(),
        }
    }

    /// Failed operation carrying an error string.
    pub fn err(key: impl Into<String>, error: impl Into<String>) -> Self {
        Response {
            success: false,
            key: key.into(),
            value: String::new(),
            error: error.into(),
        }
    }
}

/// State is simply a `HashMap` from `String` key -> `String` value.
type State = HashMap<String, String>;

/// The committed key-value state of a replica, behind a cloneable handle.
///
/// Mutated only by the replication actor's apply step, in strict LSN order.
/// The mutex exists for one concurrent reader: a backup's HTTP front-end
/// serves local reads straight from this store.
#[derive(Debug, Clone, Default)]
pub struct Store {
    state: Arc<Mutex<State>>,
}

impl Store {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Store {
            state: Arc::new(Mutex::new(State::new())),
        }
    }

    /// Applies a committed write to the store.
    pub fn apply_write(&self, key: &str, val: &str) {
        self.state.lock().insert(key.into(), val.into());
    }

    /// Looks up the latest committed value of a key.
    pub fn lookup(&self, key: &str) -> Option<String> {
        self.state.lock().get(key).cloned()
    }

    /// Materializes a read result for a key as a client `Response`.
    pub fn read_response(&self, key: &str) -> Response {
        match self.lookup(key) {
            Some(value) => Response::ok(key, value),
            None => Response::err(key, "Key not found"),
        }
    }

    /// Number of keys currently present.
    pub fn num_keys(&self) -> usize {
        self.state.lock().len()
    }
}

#[cfg(test)]
mod statemach_tests {
    use super::*;
    use rand::{seq::SliceRandom, Rng};

    #[test]
    fn read_empty() {
        let store = Store::new();
        assert_eq!(store.lookup("jane"), None);
        assert_eq!(
            store.read_response("jane"),
            Response::err("jane", "Key not found")
        );
    }

    #[test]
    fn write_one_read_one() {
        let store = Store::new();
        store.apply_write("jane", "180");
        assert_eq!(store.lookup("jane"), Some("180".into()));
        assert_eq!(store.read_response("jane"), Response::ok("jane", "180"));
    }

    #[test]
    fn write_twice() {
        let store = Store::new();
        store.apply_write("jane", "180");
        store.apply_write("jane", "185");
        assert_eq!(store.lookup("jane"), Some("185".into()));
        assert_eq!(store.num_keys(), 1);
    }

    fn gen_rand_str(len: usize) -> String {
        rand::thread_rng()
            .sample_iter(&rand::distributions::Alphanumeric)
            .take(len)
            .map(char::from)
            .collect()
    }

    #[test]
    fn write_rand_read_rand() {
        let store = Store::new();
        let mut ref_state = State::new();
        for _ in 0..100 {
            let key = gen_rand_str(1);
            let value = gen_rand_str(10);
            store.apply_write(&key, &value);
            ref_state.insert(key, value);
        }
        let keys: Vec<&String> = ref_state.keys().collect();
        for _ in 0..100 {
            let key: String = if rand::random() {
                (*keys.choose(&mut rand::thread_rng()).unwrap()).into()
            } else {
                "nonexist!".into()
            };
            assert_eq!(store.lookup(&key), ref_state.get(&key).cloned());
        }
    }

    #[test]
    fn shared_handle() {
        let store = Store::new();
        let other = store.clone();
        store.apply_write("k", "v");
        assert_eq!(other.lookup("k"), Some("v".into()));
    }
}
