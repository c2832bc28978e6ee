//! State vectors: per-client version summaries.
//!
//! A state vector maps each known client to the next clock value expected
//! from it. Two replicas exchange vectors to compute the minimal set of
//! missing updates (sync step 1 / step 2).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{ClientId, CrdtError, ItemId};

/// Maps client → next expected clock (= number of that client's elements
/// this replica has observed).
///
/// Backed by a `BTreeMap` so the encoded form is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVector(BTreeMap<ClientId, u64>);

impl StateVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next clock expected from `client` (0 if never seen).
    pub fn get(&self, client: ClientId) -> u64 {
        self.0.get(&client).copied().unwrap_or(0)
    }

    /// Whether this vector already covers `id`.
    pub fn contains(&self, id: ItemId) -> bool {
        id.clock < self.get(id.client)
    }

    /// Record that `id` has been observed. Clocks are contiguous, so this
    /// only ever advances the entry by one.
    pub fn observe(&mut self, id: ItemId) {
        let entry = self.0.entry(id.client).or_insert(0);
        if id.clock >= *entry {
            *entry = id.clock + 1;
        }
    }

    /// Pointwise maximum with another vector.
    pub fn merge(&mut self, other: &StateVector) {
        for (&client, &clock) in &other.0 {
            let entry = self.0.entry(client).or_insert(0);
            if clock > *entry {
                *entry = clock;
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ClientId, u64)> + '_ {
        self.0.iter().map(|(&c, &n)| (c, n))
    }

    /// Serialize to the binary wire form.
    pub fn encode(&self) -> Result<Vec<u8>, CrdtError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| CrdtError::Encode(e.to_string()))
    }

    /// Deserialize from the binary wire form.
    pub fn decode(bytes: &[u8]) -> Result<Self, CrdtError> {
        let (sv, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| CrdtError::Decode(e.to_string()))?;
        Ok(sv)
    }
}
