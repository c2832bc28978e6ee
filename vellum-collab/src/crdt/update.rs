//! Update fragments: serializable CRDT deltas.
//!
//! A fragment carries newly inserted elements (with their origin
//! references) plus a set of deleted element ids, compressed into
//! per-client clock ranges. Replaying fragments in any order through
//! [`super::DocState::apply_update`] reconstructs the same document.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{ClientId, CrdtError, ItemId};

/// One inserted element as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRecord {
    /// Unique identifier; clocks are contiguous per client.
    pub id: ItemId,
    /// Lamport timestamp, strictly greater than that of every element
    /// visible to the inserting client at creation time.
    pub lamport: u64,
    /// The element immediately to the left at insert time (None = head).
    pub origin: Option<ItemId>,
    /// Opaque element payload.
    pub payload: Vec<u8>,
}

/// A contiguous run of deleted clocks for one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteRange {
    pub client: ClientId,
    pub start: u64,
    pub len: u64,
}

impl DeleteRange {
    pub fn ids(&self) -> impl Iterator<Item = ItemId> + '_ {
        (self.start..self.start.saturating_add(self.len))
            .map(move |clock| ItemId::new(self.client, clock))
    }
}

/// An immutable, serializable delta: new elements plus deletions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateFragment {
    /// Inserted elements, sorted by `(lamport, client)` so causal parents
    /// precede their dependents.
    pub items: Vec<ItemRecord>,
    /// Deleted ids as per-client ranges, sorted by `(client, start)`.
    pub deletes: Vec<DeleteRange>,
}

impl UpdateFragment {
    /// Build a fragment from loose parts, normalizing the sort order and
    /// coalescing deletions into ranges.
    pub fn from_parts(mut items: Vec<ItemRecord>, delete_ids: Vec<ItemId>) -> Self {
        items.sort_by_key(|r| (r.lamport, r.id.client, r.id.clock));
        Self {
            items,
            deletes: ranges_from_ids(delete_ids),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.deletes.is_empty()
    }

    /// Number of inserted elements carried by this fragment.
    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    /// Serialize to the binary wire form.
    pub fn encode(&self) -> Result<Vec<u8>, CrdtError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| CrdtError::Encode(e.to_string()))
    }

    /// Deserialize from the binary wire form.
    pub fn decode(bytes: &[u8]) -> Result<Self, CrdtError> {
        let (frag, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| CrdtError::Decode(e.to_string()))?;
        Ok(frag)
    }
}

/// Coalesce a set of ids into sorted per-client ranges.
fn ranges_from_ids(mut ids: Vec<ItemId>) -> Vec<DeleteRange> {
    ids.sort();
    ids.dedup();

    let mut by_client: BTreeMap<ClientId, Vec<u64>> = BTreeMap::new();
    for id in ids {
        by_client.entry(id.client).or_default().push(id.clock);
    }

    let mut ranges = Vec::new();
    for (client, clocks) in by_client {
        let mut run_start = clocks[0];
        let mut run_len = 1u64;
        for &clock in &clocks[1..] {
            if clock == run_start + run_len {
                run_len += 1;
            } else {
                ranges.push(DeleteRange { client, start: run_start, len: run_len });
                run_start = clock;
                run_len = 1;
            }
        }
        ranges.push(DeleteRange { client, start: run_start, len: run_len });
    }
    ranges
}
