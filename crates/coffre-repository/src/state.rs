//! State blobs and the location index.
//!
//! A state is an immutable, serialized index fragment: it names which
//! typed blobs live in which packfile at which offset, plus tombstones
//! for blobs a later operation removed. On open, all live states are
//! merged newest-last into the in-memory [`LocationIndex`]; later states
//! shadow earlier ones.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use coffre_storage::Mac;

use crate::error::{RepositoryError, RepositoryResult};

/// Typed blob namespaces inside packfiles.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum ResourceType {
    /// A snapshot record.
    Snapshot,
    /// An object graph node.
    Object,
    /// A content chunk.
    Chunk,
    /// A virtual filesystem entry.
    VfsEntry,
    /// An error journal entry.
    ErrorEntry,
    /// An extended attribute entry.
    XattrEntry,
}

/// Where a blob's encoded bytes live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    /// Containing packfile.
    pub packfile: Mac,
    /// Byte offset inside the packfile.
    pub offset: u64,
    /// Encoded length in bytes.
    pub length: u32,
}

/// One indexed blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateEntry {
    /// Namespace of the blob.
    pub resource: ResourceType,
    /// Content address.
    pub mac: Mac,
    /// Containing packfile.
    pub packfile: Mac,
    /// Byte offset inside the packfile.
    pub offset: u64,
    /// Encoded length in bytes.
    pub length: u32,
}

/// A serialized index fragment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    /// State format version.
    pub version: u32,
    /// Publication instant; merge order across states.
    pub timestamp: DateTime<Utc>,
    /// Blobs this state makes reachable.
    pub entries: Vec<StateEntry>,
    /// Blobs this state removes from earlier states.
    pub tombstones: Vec<(ResourceType, Mac)>,
}

impl State {
    /// State format version this build writes.
    pub const VERSION: u32 = 1;

    /// An empty state stamped `timestamp`.
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        State {
            version: Self::VERSION,
            timestamp,
            entries: Vec::new(),
            tombstones: Vec::new(),
        }
    }

    /// Serializes to the state wire form.
    pub fn to_bytes(&self) -> RepositoryResult<Vec<u8>> {
        rmp_serde::to_vec(self).map_err(|e| RepositoryError::Corrupt(e.to_string()))
    }

    /// Parses the state wire form.
    pub fn from_bytes(bytes: &[u8]) -> RepositoryResult<Self> {
        rmp_serde::from_slice(bytes).map_err(|e| RepositoryError::Corrupt(e.to_string()))
    }
}

/// In-memory mapping from every live typed blob to its packfile location,
/// built by merging all live states.
#[derive(Debug, Default, Clone)]
pub struct LocationIndex {
    map: BTreeMap<(ResourceType, Mac), Location>,
}

impl LocationIndex {
    /// An empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges states. The caller passes them in any order; they are
    /// replayed sorted by timestamp so later states shadow earlier ones.
    pub fn merge(states: impl IntoIterator<Item = State>) -> Self {
        let mut sorted: Vec<State> = states.into_iter().collect();
        sorted.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));

        let mut index = LocationIndex::new();
        for state in sorted {
            index.apply(&state);
        }
        index
    }

    /// Applies one state on top of the current contents.
    pub fn apply(&mut self, state: &State) {
        for entry in &state.entries {
            self.map.insert(
                (entry.resource, entry.mac),
                Location {
                    packfile: entry.packfile,
                    offset: entry.offset,
                    length: entry.length,
                },
            );
        }
        for (resource, mac) in &state.tombstones {
            self.map.remove(&(*resource, *mac));
        }
    }

    /// Looks up a blob's location.
    pub fn get(&self, resource: ResourceType, mac: Mac) -> Option<Location> {
        self.map.get(&(resource, mac)).copied()
    }

    /// Whether a blob is reachable.
    pub fn contains(&self, resource: ResourceType, mac: Mac) -> bool {
        self.map.contains_key(&(resource, mac))
    }

    /// Removes a blob.
    pub fn remove(&mut self, resource: ResourceType, mac: Mac) {
        self.map.remove(&(resource, mac));
    }

    /// All MACs of one namespace.
    pub fn macs_of(&self, resource: ResourceType) -> Vec<Mac> {
        self.map
            .keys()
            .filter(|(r, _)| *r == resource)
            .map(|(_, mac)| *mac)
            .collect()
    }

    /// Every `(resource, mac, location)` triple, for compaction.
    pub fn entries(&self) -> impl Iterator<Item = (ResourceType, Mac, Location)> + '_ {
        self.map.iter().map(|((r, m), loc)| (*r, *m, *loc))
    }

    /// Number of indexed blobs.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the index is empty.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
