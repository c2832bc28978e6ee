//! In-memory CRDT document state and the merge algorithm.
//!
//! Ordering model (RGA family): every element records the element that was
//! immediately to its left when it was created (`origin`). Concurrent
//! inserts after the same origin are ordered newest-first by
//! `(lamport, client)`. Lamport timestamps dominate causality — an element
//! always carries a larger timestamp than every element its author had
//! seen — so skipping a newer sibling also skips that sibling's entire
//! subtree, and replicas converge for any delivery order.
//!
//! Storage is an append-only arena plus a separate document-order index;
//! elements never move in memory and are addressed by stable
//! `(client, clock)` ids rather than pointers.

use std::collections::{HashMap, HashSet};

use super::state_vector::StateVector;
use super::update::{ItemRecord, UpdateFragment};
use super::{ClientId, CrdtError, ItemId};

/// Upper bound on a single element payload.
pub const MAX_ELEMENT_PAYLOAD: usize = 1024 * 1024;

/// Upper bound on operations parked waiting for causal parents.
pub const MAX_PENDING_OPS: usize = 4096;

/// One element in the arena.
#[derive(Debug, Clone)]
struct Item {
    id: ItemId,
    lamport: u64,
    origin: Option<ItemId>,
    payload: Vec<u8>,
    deleted: bool,
}

/// The mutable shared document structure for one document.
///
/// All mutation goes through a single owner (the document session's actor
/// task), so the structure itself carries no locks.
pub struct DocState {
    client: ClientId,
    /// Append-only arena; slots are stable.
    items: Vec<Item>,
    /// Arena slots in document order.
    order: Vec<usize>,
    /// id → arena slot.
    index: HashMap<ItemId, usize>,
    vector: StateVector,
    max_lamport: u64,
    /// Inserts waiting for a causal parent (origin or per-client clock gap).
    pending_items: Vec<ItemRecord>,
    /// Deletes whose target has not arrived yet.
    pending_deletes: HashSet<ItemId>,
}

impl DocState {
    pub fn new(client: ClientId) -> Self {
        Self {
            client,
            items: Vec::new(),
            order: Vec::new(),
            index: HashMap::new(),
            vector: StateVector::new(),
            max_lamport: 0,
            pending_items: Vec::new(),
            pending_deletes: HashSet::new(),
        }
    }

    pub fn client(&self) -> ClientId {
        self.client
    }

    /// Number of live (non-deleted) elements.
    pub fn len(&self) -> usize {
        self.order
            .iter()
            .filter(|&&slot| !self.items[slot].deleted)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live element payloads in document order.
    pub fn elements(&self) -> Vec<&[u8]> {
        self.order
            .iter()
            .map(|&slot| &self.items[slot])
            .filter(|item| !item.deleted)
            .map(|item| item.payload.as_slice())
            .collect()
    }

    /// Payload of the live element at `index`.
    pub fn get(&self, index: usize) -> Option<&[u8]> {
        self.live_slot_at(index)
            .map(|slot| self.items[slot].payload.as_slice())
    }

    /// Total elements including tombstones.
    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    /// Operations currently parked waiting for causal parents.
    pub fn pending_len(&self) -> usize {
        self.pending_items.len() + self.pending_deletes.len()
    }

    pub fn state_vector(&self) -> StateVector {
        self.vector.clone()
    }

    // ─── Local mutation ───────────────────────────────────────────────

    /// Insert a new element before the live element at `index` (clamped to
    /// the end). Returns the fragment to persist and broadcast.
    pub fn insert(
        &mut self,
        index: usize,
        payload: impl Into<Vec<u8>>,
    ) -> Result<UpdateFragment, CrdtError> {
        let payload = payload.into();
        if payload.len() > MAX_ELEMENT_PAYLOAD {
            return Err(CrdtError::PayloadTooLarge {
                size: payload.len(),
                limit: MAX_ELEMENT_PAYLOAD,
            });
        }

        let index = index.min(self.len());
        let origin = if index == 0 {
            None
        } else {
            self.live_slot_at(index - 1).map(|slot| self.items[slot].id)
        };

        let rec = ItemRecord {
            id: ItemId::new(self.client, self.vector.get(self.client)),
            lamport: self.max_lamport + 1,
            origin,
            payload,
        };
        self.integrate(&rec);
        Ok(UpdateFragment::from_parts(vec![rec], Vec::new()))
    }

    /// Push a new element at the end of the document.
    pub fn push(&mut self, payload: impl Into<Vec<u8>>) -> Result<UpdateFragment, CrdtError> {
        self.insert(usize::MAX, payload)
    }

    /// Delete the live element at `index`. Returns the fragment to persist
    /// and broadcast, or None if the index is out of bounds.
    pub fn delete(&mut self, index: usize) -> Option<UpdateFragment> {
        let slot = self.live_slot_at(index)?;
        let id = self.items[slot].id;
        self.tombstone(id);
        Some(UpdateFragment::from_parts(Vec::new(), vec![id]))
    }

    // ─── Merge ────────────────────────────────────────────────────────

    /// Merge a remote fragment into this state.
    ///
    /// Idempotent (already-known elements and deletions are skipped) and
    /// tolerant of out-of-causal-order delivery (operations missing their
    /// parents park in the pending set). Returns the sub-fragment that was
    /// actually new, or None if everything was already known.
    ///
    /// Validation happens before any mutation: an invalid fragment leaves
    /// the document untouched.
    pub fn apply_update(
        &mut self,
        frag: &UpdateFragment,
    ) -> Result<Option<UpdateFragment>, CrdtError> {
        for rec in &frag.items {
            if rec.payload.len() > MAX_ELEMENT_PAYLOAD {
                return Err(CrdtError::PayloadTooLarge {
                    size: rec.payload.len(),
                    limit: MAX_ELEMENT_PAYLOAD,
                });
            }
        }

        // Stage unknown inserts.
        for rec in &frag.items {
            if self.vector.contains(rec.id) {
                continue;
            }
            if self.pending_items.iter().any(|p| p.id == rec.id) {
                continue;
            }
            if self.pending_items.len() >= MAX_PENDING_OPS {
                return Err(CrdtError::PendingLimit { limit: MAX_PENDING_OPS });
            }
            self.pending_items.push(rec.clone());
        }

        // Integrate to fixpoint: each landed element may unblock others.
        let mut applied_items: Vec<ItemRecord> = Vec::new();
        loop {
            let mut progress = false;
            let mut i = 0;
            while i < self.pending_items.len() {
                if self.vector.contains(self.pending_items[i].id) {
                    self.pending_items.swap_remove(i);
                    continue;
                }
                if self.is_integrable(&self.pending_items[i]) {
                    let rec = self.pending_items.swap_remove(i);
                    self.integrate(&rec);
                    applied_items.push(rec);
                    progress = true;
                } else {
                    i += 1;
                }
            }
            if !progress {
                break;
            }
        }

        // Stage and resolve deletions. Deletions never unblock inserts, so
        // a single pass after integration suffices.
        let mut applied_deletes: Vec<ItemId> = Vec::new();
        for range in &frag.deletes {
            for id in range.ids() {
                if self.index.contains_key(&id) {
                    if self.tombstone(id) {
                        applied_deletes.push(id);
                    }
                } else {
                    if self.pending_deletes.len() >= MAX_PENDING_OPS {
                        return Err(CrdtError::PendingLimit { limit: MAX_PENDING_OPS });
                    }
                    self.pending_deletes.insert(id);
                }
            }
        }
        let resolvable: Vec<ItemId> = self
            .pending_deletes
            .iter()
            .filter(|id| self.index.contains_key(id))
            .copied()
            .collect();
        for id in resolvable {
            self.pending_deletes.remove(&id);
            if self.tombstone(id) {
                applied_deletes.push(id);
            }
        }

        if applied_items.is_empty() && applied_deletes.is_empty() {
            Ok(None)
        } else {
            Ok(Some(UpdateFragment::from_parts(applied_items, applied_deletes)))
        }
    }

    /// Compute exactly the elements the peer is missing, plus the full
    /// delete set. The result is deterministic for a given integrated
    /// state, independent of merge history.
    pub fn diff(&self, peer: &StateVector) -> UpdateFragment {
        let mut missing = Vec::new();
        let mut deleted = Vec::new();
        for &slot in &self.order {
            let item = &self.items[slot];
            if !peer.contains(item.id) {
                missing.push(ItemRecord {
                    id: item.id,
                    lamport: item.lamport,
                    origin: item.origin,
                    payload: item.payload.clone(),
                });
            }
            if item.deleted {
                deleted.push(item.id);
            }
        }
        UpdateFragment::from_parts(missing, deleted)
    }

    /// Encode the full state as one fragment, suitable as a snapshot.
    ///
    /// Includes parked pending operations so compaction never drops
    /// updates that were durably received but not yet integrable.
    pub fn snapshot_fragment(&self) -> UpdateFragment {
        let base = self.diff(&StateVector::new());
        let mut items = base.items;
        items.extend(self.pending_items.iter().cloned());
        let mut delete_ids: Vec<ItemId> = base
            .deletes
            .iter()
            .flat_map(|r| r.ids().collect::<Vec<_>>())
            .collect();
        delete_ids.extend(self.pending_deletes.iter().copied());
        UpdateFragment::from_parts(items, delete_ids)
    }

    // ─── Internals ────────────────────────────────────────────────────

    fn is_integrable(&self, rec: &ItemRecord) -> bool {
        rec.id.clock == self.vector.get(rec.id.client)
            && rec.origin.map_or(true, |o| self.index.contains_key(&o))
    }

    /// Place a new element into the document order.
    ///
    /// Precondition: `is_integrable(rec)` (the caller checks; local inserts
    /// satisfy it by construction).
    fn integrate(&mut self, rec: &ItemRecord) {
        let start = match rec.origin {
            Some(o) => self.order_position(o).map_or(0, |p| p + 1),
            None => 0,
        };

        // Newer concurrent siblings (and, by the Lamport dominance
        // invariant, their subtrees) sort closer to the origin.
        let mut pos = start;
        while pos < self.order.len() {
            let c = &self.items[self.order[pos]];
            if (c.lamport, c.id.client) > (rec.lamport, rec.id.client) {
                pos += 1;
            } else {
                break;
            }
        }

        let slot = self.items.len();
        self.order.insert(pos, slot);
        self.items.push(Item {
            id: rec.id,
            lamport: rec.lamport,
            origin: rec.origin,
            payload: rec.payload.clone(),
            deleted: false,
        });
        self.index.insert(rec.id, slot);
        self.vector.observe(rec.id);
        if rec.lamport > self.max_lamport {
            self.max_lamport = rec.lamport;
        }
    }

    fn tombstone(&mut self, id: ItemId) -> bool {
        match self.index.get(&id) {
            Some(&slot) if !self.items[slot].deleted => {
                self.items[slot].deleted = true;
                true
            }
            _ => false,
        }
    }

    fn order_position(&self, id: ItemId) -> Option<usize> {
        let slot = *self.index.get(&id)?;
        self.order.iter().position(|&s| s == slot)
    }

    fn live_slot_at(&self, index: usize) -> Option<usize> {
        self.order
            .iter()
            .filter(|&&slot| !self.items[slot].deleted)
            .nth(index)
            .copied()
    }
}
