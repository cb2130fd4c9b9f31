//! # mixgraph-types
//!
//! Shared identifiers and plain data used by `mixgraph-audio` and `mixgraph-core`.
//! Nothing here talks to a server or owns a tree; it only names things.

mod midi;
mod remote;

pub use midi::{midi_note_to_frequency, velocity_to_amplitude, MidiMessage};
pub use remote::{AddAction, BufferId, BusGroup, CalculationRate, CallbackId, RemoteNode, RemoteNodeKind};

use uuid::Uuid;

/// Index of a node inside an application's arena.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct NodeId(u32);

impl NodeId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }
    pub fn get(self) -> u32 {
        self.0
    }
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identity of one `Application` aggregate. Nodes record which application
/// they belong to so a diff can tell attach from detach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct ApplicationId(Uuid);

impl ApplicationId {
    pub fn fresh() -> Self {
        Self(Uuid::new_v4())
    }
    pub fn get(self) -> Uuid {
        self.0
    }
}

impl std::fmt::Display for ApplicationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Supported explicit channel counts.
pub const MIN_CHANNEL_COUNT: u32 = 1;
pub const MAX_CHANNEL_COUNT: u32 = 8;

/// Channel count used when neither a node, its ancestors, nor the application set one.
pub const DEFAULT_CHANNEL_COUNT: u32 = 2;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_roundtrips_through_json() {
        let id = NodeId::new(7);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "7");
        let back: NodeId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
        assert_eq!(back.index(), 7);
    }

    #[test]
    fn application_ids_are_distinct() {
        assert_ne!(ApplicationId::fresh(), ApplicationId::fresh());
    }
}
