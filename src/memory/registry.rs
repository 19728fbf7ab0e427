//! Per-client segment registry: client -> (segment id -> arena key).

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use crate::process::{ClientId, SegmentId};

/// Arena key of a live segment.
pub type SegmentKey = usize;

#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: HashMap<ClientId, HashMap<SegmentId, SegmentKey>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, client: ClientId, id: SegmentId) -> bool {
        self.clients
            .get(&client)
            .is_some_and(|segments| segments.contains_key(&id))
    }

    #[cfg(test)]
    pub fn get(&self, client: ClientId, id: SegmentId) -> Option<SegmentKey> {
        self.clients.get(&client)?.get(&id).copied()
    }

    /// Register a segment. Returns false (and changes nothing) if the id is
    /// already in use for this client.
    pub fn insert(&mut self, client: ClientId, id: SegmentId, key: SegmentKey) -> bool {
        match self.clients.entry(client).or_default().entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(key);
                true
            }
        }
    }

    /// Unregister a segment. A client left with no segments keeps its
    /// (empty) entry until `remove_client`.
    pub fn remove(&mut self, client: ClientId, id: SegmentId) -> Option<SegmentKey> {
        self.clients.get_mut(&client)?.remove(&id)
    }

    /// Drop the client entirely and hand back the keys it owned.
    pub fn remove_client(&mut self, client: ClientId) -> Option<Vec<SegmentKey>> {
        self.clients
            .remove(&client)
            .map(|segments| segments.into_values().collect())
    }

    pub fn segment_count(&self, client: ClientId) -> usize {
        self.clients.get(&client).map_or(0, HashMap::len)
    }

    #[cfg(test)]
    pub fn has_client(&self, client: ClientId) -> bool {
        self.clients.contains_key(&client)
    }

    /// Iterate `(client, id, key)` over every registered segment.
    pub fn iter(&self) -> impl Iterator<Item = (ClientId, SegmentId, SegmentKey)> + '_ {
        self.clients.iter().flat_map(|(client, segments)| {
            segments.iter().map(move |(id, key)| (*client, *id, *key))
        })
    }
}
