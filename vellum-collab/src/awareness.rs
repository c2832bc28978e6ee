//! Transient presence ("awareness") state.
//!
//! Awareness carries cursor and presence blobs alongside the persistent
//! document state. It is never written to the update log: entries are
//! last-writer-wins per client (by a per-client clock) and expire if not
//! refreshed within the liveness window.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::crdt::{ClientId, CrdtError};

/// Default liveness window before a silent client's entry expires.
pub const DEFAULT_LIVENESS_WINDOW: Duration = Duration::from_secs(30);

/// One client's presence entry as it travels on the wire.
///
/// `blob: None` announces departure and clears the entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessEntry {
    pub client: ClientId,
    /// Per-client update counter; stale updates lose.
    pub clock: u64,
    pub blob: Option<Vec<u8>>,
}

/// A batch of presence entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessUpdate {
    pub entries: Vec<AwarenessEntry>,
}

impl AwarenessUpdate {
    pub fn single(client: ClientId, clock: u64, blob: Option<Vec<u8>>) -> Self {
        Self { entries: vec![AwarenessEntry { client, clock, blob }] }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn encode(&self) -> Result<Vec<u8>, CrdtError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| CrdtError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CrdtError> {
        let (update, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| CrdtError::Decode(e.to_string()))?;
        Ok(update)
    }
}

struct LiveEntry {
    clock: u64,
    blob: Vec<u8>,
    last_seen: Instant,
}

/// Per-document registry of live presence entries.
pub struct AwarenessRegistry {
    states: HashMap<ClientId, LiveEntry>,
    window: Duration,
}

impl AwarenessRegistry {
    pub fn new(window: Duration) -> Self {
        Self { states: HashMap::new(), window }
    }

    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_LIVENESS_WINDOW)
    }

    /// Merge an incoming update, last-writer-wins per client.
    ///
    /// Returns the entries that actually changed (for rebroadcast), which
    /// may be empty if everything was stale.
    pub fn apply(&mut self, update: &AwarenessUpdate) -> AwarenessUpdate {
        let mut changed = Vec::new();
        for entry in &update.entries {
            match &entry.blob {
                Some(blob) => {
                    let newer = self
                        .states
                        .get(&entry.client)
                        .map_or(true, |live| entry.clock >= live.clock);
                    if newer {
                        self.states.insert(
                            entry.client,
                            LiveEntry {
                                clock: entry.clock,
                                blob: blob.clone(),
                                last_seen: Instant::now(),
                            },
                        );
                        changed.push(entry.clone());
                    }
                }
                None => {
                    let removed = self
                        .states
                        .get(&entry.client)
                        .map_or(false, |live| entry.clock >= live.clock);
                    if removed {
                        self.states.remove(&entry.client);
                        changed.push(entry.clone());
                    }
                }
            }
        }
        AwarenessUpdate { entries: changed }
    }

    /// Drop entries not refreshed within the liveness window.
    ///
    /// Returns the departure entries to rebroadcast.
    pub fn prune(&mut self) -> AwarenessUpdate {
        let window = self.window;
        let mut departed = Vec::new();
        self.states.retain(|&client, live| {
            if live.last_seen.elapsed() > window {
                departed.push(AwarenessEntry {
                    client,
                    clock: live.clock + 1,
                    blob: None,
                });
                false
            } else {
                true
            }
        });
        AwarenessUpdate { entries: departed }
    }

    /// Full snapshot for a newly subscribed connection.
    pub fn snapshot(&self) -> AwarenessUpdate {
        let mut entries: Vec<AwarenessEntry> = self
            .states
            .iter()
            .map(|(&client, live)| AwarenessEntry {
                client,
                clock: live.clock,
                blob: Some(live.blob.clone()),
            })
            .collect();
        entries.sort_by_key(|e| e.client);
        AwarenessUpdate { entries }
    }

    pub fn client_count(&self) -> usize {
        self.states.len()
    }
}
