//! Arena node and its per-kind payloads.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, Weak};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use mixgraph_audio::Provider;
use mixgraph_types::{AddAction, ApplicationId, BufferId, BusGroup, CallbackId, MidiMessage, NodeId, RemoteNode};

use crate::parameters::ParameterKind;

/// Tri-state field update: leave the field alone, clear it, or set it.
#[derive(Debug, Clone, PartialEq)]
pub enum Update<T> {
    Keep,
    Clear,
    Set(T),
}

impl<T> Update<T> {
    /// `Set` for `Some`, `Clear` for `None`.
    pub fn from_option(value: Option<T>) -> Self {
        match value {
            Some(v) => Update::Set(v),
            None => Update::Clear,
        }
    }

    pub(crate) fn apply(self, field: &mut Option<T>) {
        match self {
            Update::Keep => {}
            Update::Clear => *field = None,
            Update::Set(v) => *field = Some(v),
        }
    }
}

impl<T> Default for Update<T> {
    fn default() -> Self {
        Update::Keep
    }
}

/// Field changes passed to `Application::set`.
#[derive(Debug, Clone, Default)]
pub struct Changes {
    pub application: Update<ApplicationId>,
    pub provider: Update<Arc<Provider>>,
    pub channel_count: Update<u32>,
}

impl Changes {
    pub fn channel_count(value: Option<u32>) -> Self {
        Changes { channel_count: Update::from_option(value), ..Default::default() }
    }

    pub fn provider(value: Option<Arc<Provider>>) -> Self {
        Changes { provider: Update::from_option(value), ..Default::default() }
    }
}

/// Where a node's remote group goes: relative to `target`, by `action`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Anchor {
    pub target: RemoteNode,
    pub action: AddAction,
}

impl Anchor {
    pub fn head(target: RemoteNode) -> Self {
        Anchor { target, action: AddAction::AddToHead }
    }
    pub fn tail(target: RemoteNode) -> Self {
        Anchor { target, action: AddAction::AddToTail }
    }
    pub fn before(target: RemoteNode) -> Self {
        Anchor { target, action: AddAction::AddBefore }
    }
    pub fn after(target: RemoteNode) -> Self {
        Anchor { target, action: AddAction::AddAfter }
    }
}

/// Remote handles owned by a node, keyed by role ("node", "input", "body", ...).
#[derive(Debug, Default, Clone)]
pub struct Resources {
    pub nodes: BTreeMap<&'static str, RemoteNode>,
    pub audio_buses: BTreeMap<&'static str, BusGroup>,
    pub control_buses: BTreeMap<&'static str, BusGroup>,
    pub buffers: BTreeMap<&'static str, BufferId>,
    pub callbacks: BTreeMap<&'static str, CallbackId>,
}

impl Resources {
    pub fn node(&self) -> Option<RemoteNode> {
        self.nodes.get("node").copied()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
            && self.audio_buses.is_empty()
            && self.control_buses.is_empty()
            && self.buffers.is_empty()
            && self.callbacks.is_empty()
    }
}

/// Snapshot taken at the end of the last reconcile pass.
#[derive(Debug, Clone, Default)]
pub struct CachedState {
    pub application: Option<ApplicationId>,
    pub parent: Option<NodeId>,
    pub index: Option<usize>,
    pub channel_count: u32,
    pub provider: Option<Arc<Provider>>,
}

/// Patch edges currently resolved to a node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Targets {
    /// Sends writing into this node.
    pub sends: BTreeSet<NodeId>,
    /// Receives reading from this node.
    pub receives: BTreeSet<NodeId>,
}

impl Targets {
    pub fn iter(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.sends.iter().chain(self.receives.iter()).copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupRole {
    Tracks,
    SubTracks,
    Chains,
    Devices,
    Receives,
    PrefaderSends,
    PostfaderSends,
    Parameters,
}

impl GroupRole {
    pub fn label(self) -> &'static str {
        match self {
            GroupRole::Tracks => "Tracks",
            GroupRole::SubTracks => "SubTracks",
            GroupRole::Chains => "Chains",
            GroupRole::Devices => "Devices",
            GroupRole::Receives => "Receives",
            GroupRole::PrefaderSends => "PreFaderSends",
            GroupRole::PostfaderSends => "PostFaderSends",
            GroupRole::Parameters => "Parameters",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackRole {
    Track,
    Master,
    Cue,
    Chain,
}

/// Note filter between a rack and one of its chains.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_pitch: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub out_pitch: Option<u8>,
}

impl Transfer {
    pub fn is_empty(&self) -> bool {
        self.in_pitch.is_none() && self.out_pitch.is_none()
    }

    /// Filter and transpose a note; controller messages pass untouched.
    pub fn apply(&self, message: MidiMessage) -> Option<MidiMessage> {
        let Some(pitch) = message.pitch() else {
            return Some(message);
        };
        if self.in_pitch.is_some_and(|p| p != pitch) {
            return None;
        }
        Some(match self.out_pitch {
            Some(out) => message.with_pitch(out),
            None => message,
        })
    }
}

/// Latest `/levels` readings of a track, one entry per meter point.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackLevels {
    pub peak: BTreeMap<&'static str, Vec<f32>>,
    pub rms: BTreeMap<&'static str, Vec<f32>>,
}

#[derive(Debug, Clone)]
pub struct ContextData {
    pub tracks: NodeId,
    pub master: NodeId,
    pub cue: NodeId,
    /// Directly soloed user tracks anywhere below `tracks`.
    pub soloed: BTreeSet<NodeId>,
}

#[derive(Debug, Clone)]
pub struct TrackData {
    pub role: TrackRole,
    pub parameters: NodeId,
    pub receives: NodeId,
    pub subtracks: Option<NodeId>,
    pub devices: NodeId,
    pub prefader_sends: NodeId,
    pub postfader_sends: NodeId,
    pub is_muted: bool,
    pub is_soloed: bool,
    pub is_cued: bool,
    pub transfer: Transfer,
    pub notes: NoteState,
    pub levels: Arc<Mutex<TrackLevels>>,
}

impl TrackData {
    pub fn is_user(&self) -> bool {
        matches!(self.role, TrackRole::Track | TrackRole::Chain)
    }
}

#[derive(Debug, Clone)]
pub struct RackData {
    pub parameters: NodeId,
    pub device_in: NodeId,
    pub chains: NodeId,
    pub device_out: NodeId,
    /// Directly soloed chains.
    pub soloed: BTreeSet<NodeId>,
    pub notes: NoteState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceKind {
    AudioEffect { synthdef: String },
    Instrument { synthdef: String },
}

impl DeviceKind {
    pub fn synthdef(&self) -> &str {
        match self {
            DeviceKind::AudioEffect { synthdef } | DeviceKind::Instrument { synthdef } => synthdef,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeviceData {
    pub kind: DeviceKind,
    pub parameters: NodeId,
    pub device_in: NodeId,
    pub device_out: NodeId,
    /// Sounding instrument voices by pitch.
    pub voices: BTreeMap<u8, RemoteNode>,
    pub notes: NoteState,
}

/// Held pitches on a performer's input and output.
#[derive(Debug, Clone, Default)]
pub struct NoteState {
    pub input: BTreeSet<u8>,
    pub output: BTreeSet<u8>,
}

#[derive(Debug, Clone)]
pub struct ParameterData {
    pub kind: ParameterKind,
    /// Created with its owner rather than added later.
    pub is_builtin: bool,
}

/// Explicit or default endpoint of a send or receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Default,
    Node(NodeId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendPosition {
    Prefader,
    Postfader,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PatchKind {
    Send { target: Endpoint },
    Receive { source: Endpoint },
    /// Hardware output. `bus: None` means the channels right after the
    /// context's master outputs; `channel_count: None` follows the source.
    DirectOut { bus: Option<i32>, channel_count: Option<u32> },
    DeviceIn,
    DeviceOut,
}

impl PatchKind {
    pub fn label(&self) -> &'static str {
        match self {
            PatchKind::Send { .. } => "Send",
            PatchKind::Receive { .. } => "Receive",
            PatchKind::DirectOut { .. } => "DirectOut",
            PatchKind::DeviceIn => "DeviceIn",
            PatchKind::DeviceOut => "DeviceOut",
        }
    }
}

/// What a patch synth was last built from. A new synth is needed whenever
/// this changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchSignature {
    pub source: BusGroup,
    pub target: BusGroup,
    pub feedback: bool,
}

#[derive(Debug, Clone)]
pub struct PatchData {
    pub kind: PatchKind,
    /// Node whose `Targets` currently list this patch.
    pub peer: Option<NodeId>,
    pub signature: Option<PatchSignature>,
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    Root,
    Context(ContextData),
    Group(GroupRole),
    Track(TrackData),
    Rack(RackData),
    Device(DeviceData),
    Parameter(ParameterData),
    Patch(PatchData),
}

impl NodeKind {
    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::Root => "Application",
            NodeKind::Context(_) => "Context",
            NodeKind::Group(role) => role.label(),
            NodeKind::Track(track) => match track.role {
                TrackRole::Track => "Track",
                TrackRole::Master => "MasterTrack",
                TrackRole::Cue => "CueTrack",
                TrackRole::Chain => "Chain",
            },
            NodeKind::Rack(_) => "RackDevice",
            NodeKind::Device(device) => match device.kind {
                DeviceKind::AudioEffect { .. } => "AudioEffect",
                DeviceKind::Instrument { .. } => "Instrument",
            },
            NodeKind::Parameter(param) => param.kind.label(),
            NodeKind::Patch(patch) => patch.kind.label(),
        }
    }
}

/// One recorded perform event.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureEntry {
    pub moment: Option<f64>,
    pub label: CaptureLabel,
    pub message: MidiMessage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureLabel {
    Input,
    Output,
}

impl std::fmt::Display for CaptureLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CaptureLabel::Input => "I",
            CaptureLabel::Output => "O",
        })
    }
}

pub(crate) type CaptureLog = Arc<Mutex<Vec<CaptureEntry>>>;

#[derive(Debug)]
pub struct Node {
    pub uuid: Option<Uuid>,
    pub name: Option<String>,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub kind: NodeKind,
    /// Explicit channel count; `None` inherits.
    pub channel_count: Option<u32>,
    pub application: Option<ApplicationId>,
    pub provider: Option<Arc<Provider>>,
    pub resources: Resources,
    pub cached: CachedState,
    pub is_active: bool,
    pub targets: Targets,
    pub(crate) captures: Vec<Weak<Mutex<Vec<CaptureEntry>>>>,
}

impl Node {
    pub(crate) fn new(kind: NodeKind) -> Self {
        let uuid = match kind {
            NodeKind::Context(_)
            | NodeKind::Track(_)
            | NodeKind::Rack(_)
            | NodeKind::Device(_)
            | NodeKind::Parameter(_) => Some(Uuid::new_v4()),
            NodeKind::Patch(PatchData { kind: PatchKind::Send { .. } | PatchKind::Receive { .. }, .. }) => {
                Some(Uuid::new_v4())
            }
            _ => None,
        };
        Node {
            uuid,
            name: None,
            parent: None,
            children: Vec::new(),
            kind,
            channel_count: None,
            application: None,
            provider: None,
            resources: Resources::default(),
            cached: CachedState::default(),
            is_active: true,
            targets: Targets::default(),
            captures: Vec::new(),
        }
    }

    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => format!("{} {:?}", self.kind.label(), name),
            None => self.kind.label().to_string(),
        }
    }

    pub fn remote_node(&self) -> Option<RemoteNode> {
        self.resources.node()
    }

    pub fn is_allocated(&self) -> bool {
        self.resources.node().is_some()
    }

    pub fn as_track(&self) -> Option<&TrackData> {
        match &self.kind {
            NodeKind::Track(track) => Some(track),
            _ => None,
        }
    }

    pub(crate) fn as_track_mut(&mut self) -> Option<&mut TrackData> {
        match &mut self.kind {
            NodeKind::Track(track) => Some(track),
            _ => None,
        }
    }

    pub fn as_patch(&self) -> Option<&PatchData> {
        match &self.kind {
            NodeKind::Patch(patch) => Some(patch),
            _ => None,
        }
    }

    pub(crate) fn as_patch_mut(&mut self) -> Option<&mut PatchData> {
        match &mut self.kind {
            NodeKind::Patch(patch) => Some(patch),
            _ => None,
        }
    }

    pub fn as_parameter(&self) -> Option<&ParameterData> {
        match &self.kind {
            NodeKind::Parameter(param) => Some(param),
            _ => None,
        }
    }

    pub(crate) fn as_parameter_mut(&mut self) -> Option<&mut ParameterData> {
        match &mut self.kind {
            NodeKind::Parameter(param) => Some(param),
            _ => None,
        }
    }

    /// The parameter group child of tracks, racks and devices.
    pub fn parameter_group(&self) -> Option<NodeId> {
        match &self.kind {
            NodeKind::Track(t) => Some(t.parameters),
            NodeKind::Rack(r) => Some(r.parameters),
            NodeKind::Device(d) => Some(d.parameters),
            _ => None,
        }
    }

    /// Tracks and chains.
    pub fn is_track_like(&self) -> bool {
        matches!(self.kind, NodeKind::Track(_))
    }

    /// Racks and plain devices: anything living in a devices group.
    pub fn is_device_like(&self) -> bool {
        matches!(self.kind, NodeKind::Rack(_) | NodeKind::Device(_))
    }

    pub(crate) fn record(&mut self, entry: CaptureEntry) {
        self.captures.retain(|weak| match weak.upgrade() {
            Some(log) => {
                log.lock().unwrap_or_else(std::sync::PoisonError::into_inner).push(entry.clone());
                true
            }
            None => false,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_applies_tri_state() {
        let mut field = Some(3);
        Update::Keep.apply(&mut field);
        assert_eq!(field, Some(3));
        Update::Set(5).apply(&mut field);
        assert_eq!(field, Some(5));
        Update::<i32>::Clear.apply(&mut field);
        assert_eq!(field, None);
    }

    #[test]
    fn transfer_filters_and_transposes() {
        let transfer = Transfer { in_pitch: Some(60), out_pitch: Some(72) };
        assert_eq!(transfer.apply(MidiMessage::note_on(61, 100)), None);
        assert_eq!(transfer.apply(MidiMessage::note_on(60, 100)), Some(MidiMessage::note_on(72, 100)));
        let cc = MidiMessage::control_change(1, 64);
        assert_eq!(transfer.apply(cc), Some(cc));
        assert_eq!(Transfer::default().apply(MidiMessage::note_off(40)), Some(MidiMessage::note_off(40)));
    }

    #[test]
    fn addressable_kinds_get_uuids() {
        let send = Node::new(NodeKind::Patch(PatchData {
            kind: PatchKind::Send { target: Endpoint::Default },
            peer: None,
            signature: None,
        }));
        assert!(send.uuid.is_some());
        let device_in = Node::new(NodeKind::Patch(PatchData { kind: PatchKind::DeviceIn, peer: None, signature: None }));
        assert!(device_in.uuid.is_none());
        assert!(Node::new(NodeKind::Group(GroupRole::Devices)).uuid.is_none());
    }
}
