//! A module for a distributed `Key`, `Value` store that holds the chunks,
//! columns, frames and statistics of a `liquid_frame` cluster in memory.
//!
//! Every `Key` has exactly one *home* node, computed from the key and the
//! current cluster [`Membership`](crate::network::Membership), and the home
//! node holds the authoritative copy of the key's `Value`. Any node can
//! `get`, `put` or `remove` any key:
//! - `get` on a key homed locally returns the authoritative value. For a key
//!   homed elsewhere, a local LRU cache is checked first and on a miss the
//!   value is fetched from the home node, deserialized and cached. Cached
//!   copies are never invalidated by the home node, they are consistent as of
//!   the time they were fetched.
//! - `put` on a key homed locally replaces the value synchronously; for a key
//!   homed elsewhere the value is sent to the home node, which acknowledges
//!   it. All writes to a key are thereby serialized at its home node.
//! - `remove` is routed to the home node in the same way.
//!
//! ## Message Processing
//!
//! Requests to other nodes are sent as `KVMessage`s and their replies are
//! matched to the waiting caller by a request id. A caller waiting on a node
//! that leaves the cluster fails with `LiquidError::NodeLost`.
use crate::chunk::Chunk;
use crate::column::{Column, RollupStats};
use crate::error::LiquidError;
use crate::frame::Frame;
use deepsize::DeepSizeOf;
use rand::{self, Rng};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

mod kv_store;
pub use kv_store::KVStore;

mod persist;
pub use persist::{FilePersist, MemPersist, Persist};

mod scope;
pub use scope::Scope;

/// The type of the `Value` a `Key` refers to
#[derive(
    PartialEq, Eq, Hash, Serialize, Deserialize, Debug, Clone, Copy, DeepSizeOf,
)]
pub enum KeyKind {
    Chunk,
    Column,
    Frame,
    Rollups,
    Blob,
}

/// A `Key` defines where in a `KVStore` a `Value` is stored, as well as
/// which node 'owns' the `Value`
#[derive(
    PartialEq, Eq, Hash, Serialize, Deserialize, Debug, Clone, DeepSizeOf,
)]
pub struct Key {
    /// Defines where in a `KVStore` a value is stored
    pub name: String,
    /// The type of the associated `Value`
    pub kind: KeyKind,
    /// When set, the key is owned by the member at this index (modulo the
    /// number of members) of the sorted membership, instead of by hash
    pub home_hint: Option<usize>,
}

impl Key {
    /// Creates a new `Key` whose home is picked by hashing `name`
    pub fn new(name: &str, kind: KeyKind) -> Self {
        Key {
            name: String::from(name),
            kind,
            home_hint: None,
        }
    }

    /// Creates a new `Key` owned by the member at index `hint` modulo the
    /// number of members
    pub fn with_home(name: &str, kind: KeyKind, hint: usize) -> Self {
        Key {
            name: String::from(name),
            kind,
            home_hint: Some(hint),
        }
    }

    /// Make a key with an automatically generated, unique name
    pub fn generate(prefix: &str, kind: KeyKind) -> Self {
        let mut rng = rand::thread_rng();
        Key::new(&format!("{}-{:016x}", prefix, rng.gen::<u64>()), kind)
    }

    /// The key of chunk `cidx` of the column with this key. Chunk `i` of
    /// every column lives on the same member, so columns with the same
    /// layout are co-located.
    pub fn chunk(&self, cidx: usize) -> Key {
        Key::with_home(&format!("{}#{}", self.name, cidx), KeyKind::Chunk, cidx)
    }

    /// The key the cached statistics of the column with this key live under
    pub fn rollups(&self) -> Key {
        Key::new(&self.name, KeyKind::Rollups)
    }

    /// The index into a sorted membership of `n` nodes of this key's home
    pub(crate) fn home_index(&self, n: usize) -> usize {
        match self.home_hint {
            Some(hint) => hint % n,
            None => (one_at_a_time(self.name.as_bytes()) & 0x7FFF_FFFF) as usize % n,
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{}", self.kind, self.name)
    }
}

/// Jenkins' one-at-a-time hash
fn one_at_a_time(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0;
    for b in bytes {
        hash = hash.wrapping_add(*b as u32);
        hash = hash.wrapping_add(hash << 10);
        hash ^= hash >> 6;
    }
    hash = hash.wrapping_add(hash << 3);
    hash ^= hash >> 11;
    hash.wrapping_add(hash << 15)
}

/// The data stored under a `Key`. Values are shared by reference inside a
/// node and serialized when they cross to another node.
#[derive(Debug, Clone, Serialize, Deserialize, DeepSizeOf)]
pub enum Value {
    Chunk(Arc<Chunk>),
    Column(Arc<Column>),
    Frame(Arc<Frame>),
    Rollups(Arc<RollupStats>),
    Blob(Arc<Vec<u8>>),
}

impl Value {
    pub fn into_chunk(self) -> Result<Arc<Chunk>, LiquidError> {
        match self {
            Value::Chunk(c) => Ok(c),
            _ => Err(LiquidError::TypeMismatch),
        }
    }

    pub fn into_column(self) -> Result<Arc<Column>, LiquidError> {
        match self {
            Value::Column(c) => Ok(c),
            _ => Err(LiquidError::TypeMismatch),
        }
    }

    pub fn into_frame(self) -> Result<Arc<Frame>, LiquidError> {
        match self {
            Value::Frame(f) => Ok(f),
            _ => Err(LiquidError::TypeMismatch),
        }
    }

    pub fn into_rollups(self) -> Result<Arc<RollupStats>, LiquidError> {
        match self {
            Value::Rollups(r) => Ok(r),
            _ => Err(LiquidError::TypeMismatch),
        }
    }

    pub fn into_blob(self) -> Result<Arc<Vec<u8>>, LiquidError> {
        match self {
            Value::Blob(b) => Ok(b),
            _ => Err(LiquidError::TypeMismatch),
        }
    }
}

/// Represents the kind of messages that can be sent between distributed
/// `KVStore`s. Requests carry a `req_id` that the reply echoes back.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum KVMessage {
    /// Asks the home node for the serialized `Value` of `key`
    Get { req_id: usize, key: Key },
    /// Asks the home node to store a serialized `Value`
    Put {
        req_id: usize,
        key: Key,
        value: Vec<u8>,
    },
    /// Asks the home node to remove `key`
    Remove { req_id: usize, key: Key },
    /// The reply to a `Get`, `None` if the key was not found
    Data {
        req_id: usize,
        value: Option<Vec<u8>>,
    },
    /// The reply to a `Put` or `Remove`
    Ack { req_id: usize },
    /// The reply to any request the home node could not carry out, other
    /// than a `Get` of a missing key
    Failed { req_id: usize, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Membership;

    #[test]
    fn test_home_is_deterministic() {
        let m1 = Membership::new(3, vec![7, 2, 5]);
        let m2 = Membership::new(9, vec![5, 7, 2]);
        for i in 0..100 {
            let key = Key::new(&format!("key-{}", i), KeyKind::Blob);
            let home = m1.home_of(&key).unwrap();
            assert_eq!(Some(home), m2.home_of(&key));
            assert!(m1.contains(home));
        }
        assert_eq!(Membership::default().home_of(&Key::new("a", KeyKind::Blob)), None);
    }

    #[test]
    fn test_chunk_keys_follow_their_index() {
        let m = Membership::new(1, vec![1, 2, 3]);
        let a = Key::generate("a", KeyKind::Column);
        let b = Key::generate("b", KeyKind::Column);
        for cidx in 0..10 {
            assert_eq!(m.home_of(&a.chunk(cidx)), Some(m.nodes[cidx % 3]));
            assert_eq!(m.home_of(&a.chunk(cidx)), m.home_of(&b.chunk(cidx)));
        }
        assert_ne!(a.chunk(0), b.chunk(0));
    }

    #[test]
    fn test_hash_spreads_keys() {
        let m = Membership::new(1, vec![1, 2, 3, 4]);
        let mut counts = [0; 4];
        for i in 0..1000 {
            let key = Key::new(&format!("k{}", i), KeyKind::Blob);
            counts[m.home_of(&key).unwrap() - 1] += 1;
        }
        assert!(counts.iter().all(|c| *c > 100), "{:?}", counts);
    }

    #[test]
    fn test_one_at_a_time() {
        assert_eq!(one_at_a_time(b"a"), 0xca2e_9442);
        assert_eq!(
            one_at_a_time(b"The quick brown fox jumps over the lazy dog"),
            0x519e_91f5
        );
    }
}
