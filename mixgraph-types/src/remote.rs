use serde::{Deserialize, Serialize};

/// Placement of a new or moved node relative to a target node.
/// Discriminants are the server's wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddAction {
    AddToHead = 0,
    AddToTail = 1,
    AddBefore = 2,
    AddAfter = 3,
    Replace = 4,
}

impl AddAction {
    pub fn code(self) -> i32 {
        self as i32
    }
}

impl std::fmt::Display for AddAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AddAction::AddToHead => "ADD_TO_HEAD",
            AddAction::AddToTail => "ADD_TO_TAIL",
            AddAction::AddBefore => "ADD_BEFORE",
            AddAction::AddAfter => "ADD_AFTER",
            AddAction::Replace => "REPLACE",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CalculationRate {
    Audio,
    Control,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RemoteNodeKind {
    Group,
    Synth,
}

/// Handle to a node the provider has created on the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteNode {
    pub id: i32,
    pub kind: RemoteNodeKind,
}

impl RemoteNode {
    pub fn group(id: i32) -> Self {
        Self { id, kind: RemoteNodeKind::Group }
    }
    pub fn synth(id: i32) -> Self {
        Self { id, kind: RemoteNodeKind::Synth }
    }
    pub fn is_group(&self) -> bool {
        self.kind == RemoteNodeKind::Group
    }
}

impl std::fmt::Display for RemoteNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// A contiguous block of buses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BusGroup {
    pub rate: CalculationRate,
    pub index: i32,
    pub channel_count: u32,
}

impl BusGroup {
    /// Symbol a synth control uses to map onto this bus ("c3", "a16").
    pub fn map_symbol(&self) -> String {
        match self.rate {
            CalculationRate::Audio => format!("a{}", self.index),
            CalculationRate::Control => format!("c{}", self.index),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BufferId(pub i32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallbackId(pub u32);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_action_codes_match_wire() {
        assert_eq!(AddAction::AddToHead.code(), 0);
        assert_eq!(AddAction::AddToTail.code(), 1);
        assert_eq!(AddAction::AddBefore.code(), 2);
        assert_eq!(AddAction::AddAfter.code(), 3);
    }

    #[test]
    fn control_bus_maps_with_c_prefix() {
        let bus = BusGroup { rate: CalculationRate::Control, index: 3, channel_count: 1 };
        assert_eq!(bus.map_symbol(), "c3");
    }
}
