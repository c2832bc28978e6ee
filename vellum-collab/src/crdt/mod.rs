//! Conflict-free replicated document state.
//!
//! The engine is a list CRDT over opaque elements. Every element is tagged
//! with a `(client, clock)` identifier where clocks are contiguous per
//! client, plus a Lamport timestamp used to order concurrent inserts.
//!
//! ```text
//! ┌────────────────────────────────────────────────┐
//! │                   DocState                     │
//! │                                                │
//! │  arena:  [ item │ item │ item │ … ]  (append)  │
//! │  order:  [ 2, 0, 1, … ]  (document positions)  │
//! │  vector: { client → next clock }               │
//! │  pending: fragments awaiting causal parents    │
//! └────────────────────────────────────────────────┘
//! ```
//!
//! Merge is commutative, associative and idempotent: replicas that apply
//! the same set of [`UpdateFragment`]s converge regardless of delivery
//! order. Fragments whose causal parents have not arrived yet are parked
//! in a bounded pending set and integrated once their dependencies land.

pub mod doc;
pub mod state_vector;
pub mod update;

pub use doc::DocState;
pub use state_vector::StateVector;
pub use update::{DeleteRange, ItemRecord, UpdateFragment};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of an editing client. Randomly assigned per replica.
pub type ClientId = u64;

/// Generate a fresh client id.
pub fn random_client_id() -> ClientId {
    Uuid::new_v4().as_u128() as u64
}

/// Globally unique, totally ordered element identifier.
///
/// Clocks are contiguous per client (0, 1, 2, …), so a state-vector entry
/// fully describes which of a client's elements a replica has seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemId {
    pub client: ClientId,
    pub clock: u64,
}

impl ItemId {
    pub fn new(client: ClientId, clock: u64) -> Self {
        Self { client, clock }
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.clock, self.client)
    }
}

/// CRDT engine errors.
#[derive(Debug, Clone)]
pub enum CrdtError {
    /// A fragment or state vector could not be deserialized.
    Decode(String),
    /// Serialization failed.
    Encode(String),
    /// Too many operations parked waiting for causal parents.
    PendingLimit { limit: usize },
    /// An element payload exceeds the configured maximum.
    PayloadTooLarge { size: usize, limit: usize },
}

impl std::fmt::Display for CrdtError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CrdtError::Decode(e) => write!(f, "decode error: {e}"),
            CrdtError::Encode(e) => write!(f, "encode error: {e}"),
            CrdtError::PendingLimit { limit } => {
                write!(f, "pending operation limit exceeded ({limit})")
            }
            CrdtError::PayloadTooLarge { size, limit } => {
                write!(f, "element payload of {size} bytes exceeds limit of {limit}")
            }
        }
    }
}

impl std::error::Error for CrdtError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_id_ordering() {
        let a = ItemId::new(1, 5);
        let b = ItemId::new(1, 6);
        let c = ItemId::new(2, 0);

        assert!(a < b);
        assert!(b < c);
        assert_eq!(a, ItemId::new(1, 5));
    }

    #[test]
    fn test_item_id_display() {
        let id = ItemId::new(7, 42);
        assert_eq!(id.to_string(), "42@7");
    }

    #[test]
    fn test_random_client_ids_distinct() {
        let a = random_client_id();
        let b = random_client_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_crdt_error_display() {
        let err = CrdtError::PendingLimit { limit: 100 };
        assert!(err.to_string().contains("100"));

        let err = CrdtError::PayloadTooLarge { size: 10, limit: 5 };
        assert!(err.to_string().contains("10"));
        assert!(err.to_string().contains("5"));
    }
}
