//! Flat record form of an application and its rebuild.
//!
//! Each record names its parent by uuid. Rebuilding walks the records as a
//! queue: a record whose parent (or explicit send/receive peer) is not known
//! yet goes to the back, and is dropped after `MAX_REQUEUES` retries.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use mixgraph_types::{NodeId, DEFAULT_CHANNEL_COUNT};

use crate::application::Application;
use crate::error::{MixError, MixResult};
use crate::node::{DeviceKind, Endpoint, GroupRole, NodeKind, PatchKind, SendPosition, TrackRole, Transfer};
use crate::parameters::{ParameterAction, ParameterKind, ParameterSpec};

const MAX_REQUEUES: usize = 2;

/// Recorded child order per container, filled as owners are restored.
type Order = HashMap<NodeId, Vec<Uuid>>;

fn is_false(value: &bool) -> bool {
    !*value
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Uuid>,
}

/// Child uuids of an owner's groups, in sibling order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Slots {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tracks: Vec<Uuid>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chains: Vec<Uuid>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<Uuid>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub receives: Vec<Uuid>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prefader_sends: Vec<Uuid>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub postfader_sends: Vec<Uuid>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<Uuid>,
}

impl Slots {
    pub fn slot(&self, role: GroupRole) -> &[Uuid] {
        match role {
            GroupRole::Tracks | GroupRole::SubTracks => &self.tracks,
            GroupRole::Chains => &self.chains,
            GroupRole::Devices => &self.devices,
            GroupRole::Receives => &self.receives,
            GroupRole::PrefaderSends => &self.prefader_sends,
            GroupRole::PostfaderSends => &self.postfader_sends,
            GroupRole::Parameters => &self.parameters,
        }
    }

    fn slot_mut(&mut self, role: GroupRole) -> &mut Vec<Uuid> {
        match role {
            GroupRole::Tracks | GroupRole::SubTracks => &mut self.tracks,
            GroupRole::Chains => &mut self.chains,
            GroupRole::Devices => &mut self.devices,
            GroupRole::Receives => &mut self.receives,
            GroupRole::PrefaderSends => &mut self.prefader_sends,
            GroupRole::PostfaderSends => &mut self.postfader_sends,
            GroupRole::Parameters => &mut self.parameters,
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Slots::default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationSpec {
    pub channel_count: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contexts: Vec<Uuid>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Slots::is_empty")]
    pub slots: Slots,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_count: Option<u32>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_muted: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_soloed: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_cued: bool,
    /// Builtin parameter values that differ from their defaults.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, f32>,
    #[serde(default, skip_serializing_if = "Transfer::is_empty")]
    pub transfer: Transfer,
    #[serde(default, skip_serializing_if = "Slots::is_empty")]
    pub slots: Slots,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_count: Option<u32>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, f32>,
    #[serde(default, skip_serializing_if = "Slots::is_empty")]
    pub slots: Slots,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendSpec {
    pub position: SendPosition,
    /// `None` follows the default target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Uuid>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReceiveSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterStorage {
    Bus,
    Buffer,
    Callback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterRecord {
    pub storage: ParameterStorage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<ParameterSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl ParameterRecord {
    fn from_kind(kind: &ParameterKind) -> Self {
        match kind {
            ParameterKind::Bus { spec, value } => ParameterRecord {
                storage: ParameterStorage::Bus,
                spec: Some(*spec),
                value: Some(*value),
                path: None,
            },
            ParameterKind::Buffer { path } => ParameterRecord {
                storage: ParameterStorage::Buffer,
                spec: None,
                value: None,
                path: path.clone(),
            },
            ParameterKind::Callback { spec, value, .. } => ParameterRecord {
                storage: ParameterStorage::Callback,
                spec: Some(*spec),
                value: Some(*value),
                path: None,
            },
        }
    }

    fn to_kind(&self) -> ParameterKind {
        let spec = self.spec.unwrap_or(ParameterSpec::Null);
        let value = spec.clamp(self.value.unwrap_or_else(|| spec.default_value()));
        match self.storage {
            ParameterStorage::Bus => ParameterKind::Bus { spec, value },
            ParameterStorage::Buffer => ParameterKind::Buffer { path: self.path.clone() },
            ParameterStorage::Callback => ParameterKind::Callback { spec, value, action: ParameterAction::Nothing },
        }
    }
}

/// One persisted node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Entity {
    Application {
        #[serde(default)]
        meta: Meta,
        spec: ApplicationSpec,
    },
    Context {
        meta: Meta,
        #[serde(default)]
        spec: ContextSpec,
    },
    Track {
        meta: Meta,
        #[serde(default)]
        spec: TrackSpec,
    },
    MasterTrack {
        meta: Meta,
        #[serde(default)]
        spec: TrackSpec,
    },
    CueTrack {
        meta: Meta,
        #[serde(default)]
        spec: TrackSpec,
    },
    Chain {
        meta: Meta,
        #[serde(default)]
        spec: TrackSpec,
    },
    Rack {
        meta: Meta,
        #[serde(default)]
        spec: DeviceSpec,
    },
    Device {
        meta: Meta,
        spec: DeviceSpec,
    },
    Send {
        meta: Meta,
        spec: SendSpec,
    },
    Receive {
        meta: Meta,
        #[serde(default)]
        spec: ReceiveSpec,
    },
    Parameter {
        meta: Meta,
        spec: ParameterRecord,
    },
}

impl Entity {
    pub fn meta(&self) -> &Meta {
        match self {
            Entity::Application { meta, .. }
            | Entity::Context { meta, .. }
            | Entity::Track { meta, .. }
            | Entity::MasterTrack { meta, .. }
            | Entity::CueTrack { meta, .. }
            | Entity::Chain { meta, .. }
            | Entity::Rack { meta, .. }
            | Entity::Device { meta, .. }
            | Entity::Send { meta, .. }
            | Entity::Receive { meta, .. }
            | Entity::Parameter { meta, .. } => meta,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub entities: Vec<Entity>,
}

impl Document {
    pub fn to_json(&self) -> MixResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> MixResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn save(&self, path: &Path) -> MixResult {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> MixResult<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }
}

impl Application {
    // ─── Export ─────────────────────────────────────────────────────

    /// Records for every addressable node, parents before children.
    pub fn serialize(&self) -> Document {
        let mut entities = vec![Entity::Application {
            meta: Meta::default(),
            spec: ApplicationSpec {
                channel_count: self.channel_count,
                contexts: self.contexts().into_iter().filter_map(|c| self.node(c).uuid).collect(),
            },
        }];
        entities.extend(self.subtree(self.root).into_iter().filter_map(|id| self.entity_of(id)));
        Document { entities }
    }

    fn meta_of(&self, id: NodeId) -> Meta {
        let node = self.node(id);
        Meta {
            name: node.name.clone(),
            uuid: node.uuid,
            parent: self.parentage(id).into_iter().skip(1).find_map(|n| self.node(n).uuid),
        }
    }

    /// Builtin parameter values moved off their defaults.
    fn builtin_values(&self, owner: NodeId) -> BTreeMap<String, f32> {
        let mut values = BTreeMap::new();
        for param in self.parameters(owner) {
            let node = self.node(param);
            let Some(data) = node.as_parameter().filter(|p| p.is_builtin) else {
                continue;
            };
            let (spec, value) = match &data.kind {
                ParameterKind::Bus { spec, value } | ParameterKind::Callback { spec, value, .. } => (spec, *value),
                ParameterKind::Buffer { .. } => continue,
            };
            if value != spec.default_value() {
                values.extend(node.name.clone().map(|name| (name, value)));
            }
        }
        values
    }

    fn is_recorded(&self, id: NodeId) -> bool {
        let node = self.node(id);
        node.uuid.is_some() && !node.as_parameter().is_some_and(|p| p.is_builtin)
    }

    /// Recorded children of each of `owner`'s groups.
    fn slots_of(&self, owner: NodeId) -> Slots {
        let mut slots = Slots::default();
        for &group in self.children(owner) {
            let NodeKind::Group(role) = self.node(group).kind else {
                continue;
            };
            slots.slot_mut(role).extend(
                self.children(group).iter().filter(|&&c| self.is_recorded(c)).filter_map(|&c| self.node(c).uuid),
            );
        }
        slots
    }

    fn entity_of(&self, id: NodeId) -> Option<Entity> {
        let node = self.node(id);
        let meta = self.meta_of(id);
        let entity = match &node.kind {
            NodeKind::Context(_) => Entity::Context {
                meta,
                spec: ContextSpec { channel_count: node.channel_count, slots: self.slots_of(id) },
            },
            NodeKind::Track(track) => {
                let spec = TrackSpec {
                    channel_count: node.channel_count,
                    is_muted: track.is_muted,
                    is_soloed: track.is_soloed,
                    is_cued: track.is_cued,
                    parameters: self.builtin_values(id),
                    transfer: track.transfer,
                    slots: self.slots_of(id),
                };
                match track.role {
                    TrackRole::Track => Entity::Track { meta, spec },
                    TrackRole::Master => Entity::MasterTrack { meta, spec },
                    TrackRole::Cue => Entity::CueTrack { meta, spec },
                    TrackRole::Chain => Entity::Chain { meta, spec },
                }
            }
            NodeKind::Rack(_) | NodeKind::Device(_) => {
                let spec = DeviceSpec {
                    device: match &node.kind {
                        NodeKind::Device(device) => Some(device.kind.clone()),
                        _ => None,
                    },
                    channel_count: node.channel_count,
                    parameters: self.builtin_values(id),
                    slots: self.slots_of(id),
                };
                match spec.device {
                    Some(_) => Entity::Device { meta, spec },
                    None => Entity::Rack { meta, spec },
                }
            }
            NodeKind::Patch(patch) => {
                let peer = |endpoint: &Endpoint| match endpoint {
                    Endpoint::Node(peer) => self.node(*peer).uuid,
                    Endpoint::Default => None,
                };
                match &patch.kind {
                    PatchKind::Send { target } => {
                        let position = match node.parent.map(|g| &self.node(g).kind) {
                            Some(NodeKind::Group(GroupRole::PrefaderSends)) => SendPosition::Prefader,
                            _ => SendPosition::Postfader,
                        };
                        Entity::Send { meta, spec: SendSpec { position, target: peer(target) } }
                    }
                    PatchKind::Receive { source } => Entity::Receive { meta, spec: ReceiveSpec { source: peer(source) } },
                    _ => return None,
                }
            }
            NodeKind::Parameter(param) if !param.is_builtin => {
                Entity::Parameter { meta, spec: ParameterRecord::from_kind(&param.kind) }
            }
            _ => return None,
        };
        Some(entity)
    }

    // ─── Import ─────────────────────────────────────────────────────

    /// Rebuild an offline application from `document`.
    pub fn deserialize(document: &Document) -> MixResult<Application> {
        let spec = document.entities.iter().find_map(|e| match e {
            Entity::Application { spec, .. } => Some(spec),
            _ => None,
        });
        let mut app = Application::new(spec.map_or(DEFAULT_CHANNEL_COUNT, |s| s.channel_count));
        let mut order = Order::default();
        order.insert(app.root, spec.map(|s| s.contexts.clone()).unwrap_or_default());
        let mut queue: VecDeque<(&Entity, usize)> = document
            .entities
            .iter()
            .filter(|e| !matches!(e, Entity::Application { .. }))
            .map(|e| (e, 0))
            .collect();
        while let Some((entity, retries)) = queue.pop_front() {
            if app.restore(entity, &mut order)? {
                continue;
            }
            if retries < MAX_REQUEUES {
                queue.push_back((entity, retries + 1));
            } else {
                log::warn!(target: "mixgraph::nodes", "dropping unresolved record {:?}", entity.meta());
            }
        }
        Ok(app)
    }

    fn resolve(&self, uuid: Option<Uuid>) -> Option<Option<NodeId>> {
        match uuid {
            Some(uuid) => self.lookup(&uuid).map(Some),
            None => Some(None),
        }
    }

    /// Insert `item` into `container` ahead of the first sibling recorded
    /// after it. Siblings without a recorded position are passed over.
    fn place(&mut self, order: &Order, container: NodeId, item: NodeId) -> MixResult {
        let ranks = order.get(&container).map(Vec::as_slice).unwrap_or_default();
        let rank_of = |id: NodeId| self.node(id).uuid.and_then(|u| ranks.iter().position(|r| *r == u));
        let index = match rank_of(item) {
            Some(rank) => self
                .children(container)
                .iter()
                .position(|&c| rank_of(c).is_some_and(|r| r > rank))
                .unwrap_or(self.children(container).len()),
            None => self.children(container).len(),
        };
        self.splice(container, index..index, &[item])
    }

    /// Note the recorded child order of each of `owner`'s groups.
    fn remember_slots(&self, order: &mut Order, owner: NodeId, slots: &Slots) {
        for &group in self.children(owner) {
            if let NodeKind::Group(role) = self.node(group).kind {
                order.insert(group, slots.slot(role).to_vec());
            }
        }
    }

    /// Attach one record. `Ok(false)` when a referenced node is not known yet.
    fn restore(&mut self, entity: &Entity, order: &mut Order) -> MixResult<bool> {
        let meta = entity.meta();
        let Some(parent) = self.resolve(meta.parent) else {
            return Ok(false);
        };
        let require_parent = || {
            parent.ok_or_else(|| MixError::Persistence(format!("record {:?} has no parent", meta.uuid)))
        };
        let name = meta.name.as_deref();
        match entity {
            Entity::Application { .. } => {}
            Entity::Context { spec, .. } => {
                let context = self.build_context(name);
                self.adopt(context, meta);
                self.node_mut(context).channel_count = spec.channel_count;
                self.remember_slots(order, context, &spec.slots);
                let root = self.root;
                self.place(order, root, context)?;
            }
            Entity::Track { spec, .. } => {
                let container = self.track_container(require_parent()?)?;
                let track = self.build_track(TrackRole::Track, name);
                self.restore_track(track, meta, spec);
                self.remember_slots(order, track, &spec.slots);
                self.place(order, container, track)?;
            }
            Entity::MasterTrack { spec, .. } | Entity::CueTrack { spec, .. } => {
                let context = require_parent()?;
                let track = match entity {
                    Entity::MasterTrack { .. } => self.master_track(context)?,
                    _ => self.cue_track(context)?,
                };
                if let Some(old) = self.node(track).uuid {
                    self.registry.remove(&old);
                }
                self.adopt(track, meta);
                if let Some(uuid) = meta.uuid {
                    self.registry.insert(uuid, track);
                }
                self.restore_values(track, &spec.parameters);
                self.remember_slots(order, track, &spec.slots);
                self.apply_channel_count(track, spec.channel_count)?;
            }
            Entity::Chain { spec, .. } => {
                let rack = require_parent()?;
                let container = match &self.node(rack).kind {
                    NodeKind::Rack(data) => data.chains,
                    _ => return Err(MixError::WrongKind { node: rack, expected: "rack" }),
                };
                let chain = self.build_track(TrackRole::Chain, name);
                self.restore_track(chain, meta, spec);
                self.remember_slots(order, chain, &spec.slots);
                self.place(order, container, chain)?;
            }
            Entity::Rack { spec, .. } | Entity::Device { spec, .. } => {
                let owner = require_parent()?;
                let container = self
                    .node(owner)
                    .as_track()
                    .map(|t| t.devices)
                    .ok_or(MixError::WrongKind { node: owner, expected: "track or chain" })?;
                let device = match (entity, &spec.device) {
                    (Entity::Rack { .. }, _) => self.build_rack(name),
                    (_, Some(kind)) => self.build_device(kind.clone(), name),
                    (_, None) => return Err(MixError::Persistence(format!("device {:?} has no type", meta.uuid))),
                };
                self.adopt(device, meta);
                self.node_mut(device).channel_count = spec.channel_count;
                self.restore_values(device, &spec.parameters);
                self.remember_slots(order, device, &spec.slots);
                self.place(order, container, device)?;
            }
            Entity::Send { spec, .. } => {
                let track = require_parent()?;
                let Some(target) = self.resolve(spec.target) else {
                    return Ok(false);
                };
                let data = self
                    .node(track)
                    .as_track()
                    .ok_or(MixError::WrongKind { node: track, expected: "track" })?;
                let container = match spec.position {
                    SendPosition::Prefader => data.prefader_sends,
                    SendPosition::Postfader => data.postfader_sends,
                };
                let target = target.map_or(Endpoint::Default, Endpoint::Node);
                let send = self.create_patch(PatchKind::Send { target });
                self.adopt(send, meta);
                self.place(order, container, send)?;
            }
            Entity::Receive { spec, .. } => {
                let track = require_parent()?;
                let Some(source) = self.resolve(spec.source) else {
                    return Ok(false);
                };
                let container = self
                    .node(track)
                    .as_track()
                    .map(|t| t.receives)
                    .ok_or(MixError::WrongKind { node: track, expected: "track" })?;
                let source = source.map_or(Endpoint::Default, Endpoint::Node);
                let receive = self.create_patch(PatchKind::Receive { source });
                self.adopt(receive, meta);
                self.place(order, container, receive)?;
            }
            Entity::Parameter { spec, .. } => {
                let owner = require_parent()?;
                let group = self
                    .node(owner)
                    .parameter_group()
                    .ok_or(MixError::WrongKind { node: owner, expected: "track, rack or device" })?;
                let param = self.create_parameter(name.unwrap_or_default(), spec.to_kind(), false);
                self.adopt(param, meta);
                self.place(order, group, param)?;
            }
        }
        Ok(true)
    }

    fn adopt(&mut self, id: NodeId, meta: &Meta) {
        if let Some(uuid) = meta.uuid {
            self.node_mut(id).uuid = Some(uuid);
        }
    }

    fn restore_track(&mut self, id: NodeId, meta: &Meta, spec: &TrackSpec) {
        self.adopt(id, meta);
        self.restore_values(id, &spec.parameters);
        let node = self.node_mut(id);
        node.channel_count = spec.channel_count;
        if let Some(track) = node.as_track_mut() {
            track.is_muted = spec.is_muted;
            track.is_soloed = spec.is_soloed;
            track.is_cued = spec.is_cued;
            if track.role == TrackRole::Chain {
                track.transfer = spec.transfer;
            }
        }
    }

    /// Write stored values into builtin parameters of a node that is not
    /// allocated yet.
    fn restore_values(&mut self, owner: NodeId, values: &BTreeMap<String, f32>) {
        for (name, stored) in values {
            let Some(param) = self.parameter(owner, name) else {
                log::warn!(target: "mixgraph::nodes", "{} has no parameter {:?}", self.node(owner).label(), name);
                continue;
            };
            let mut deactivate = false;
            if let Some(data) = self.node_mut(param).as_parameter_mut() {
                match &mut data.kind {
                    ParameterKind::Bus { spec, value } => *value = spec.clamp(*stored),
                    ParameterKind::Callback { spec, value, action } => {
                        *value = spec.clamp(*stored);
                        deactivate = *action == ParameterAction::DeviceActive && *value == 0.0;
                    }
                    ParameterKind::Buffer { .. } => {}
                }
            }
            if deactivate {
                self.node_mut(owner).is_active = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use async_std::task::block_on;

    use super::*;

    fn session() -> Application {
        let mut app = Application::new(2);
        let context = app.insert_context(Some("main")).unwrap();
        let a = app.insert_track(context, Some("a")).unwrap();
        let b = app.insert_track(context, Some("b")).unwrap();
        app.insert_track(a, Some("a.1")).unwrap();
        block_on(app.add_send(a, Endpoint::Node(b), SendPosition::Prefader)).unwrap();
        block_on(app.add_send(a, Endpoint::Default, SendPosition::Prefader)).unwrap();
        block_on(app.add_send(b, Endpoint::Node(a), SendPosition::Postfader)).unwrap();
        let rack = block_on(app.add_rack(b, Some("rack"))).unwrap();
        let one = block_on(app.add_chain(rack, Some("one"))).unwrap();
        app.set_transfer(one, Transfer { in_pitch: Some(60), out_pitch: None }).unwrap();
        block_on(app.add_chain(rack, None)).unwrap();
        let fx = DeviceKind::AudioEffect { synthdef: "fx/eq".into() };
        let device = block_on(app.add_device(one, fx, None)).unwrap();
        block_on(app.deactivate(device)).unwrap();
        let cutoff = ParameterKind::bus(ParameterSpec::float(1000.0, 20.0, 20000.0));
        let param = block_on(app.add_parameter(device, "cutoff", cutoff)).unwrap();
        block_on(app.set_parameter(param, 440.0, None)).unwrap();
        let gain = app.parameter(a, "gain").unwrap();
        block_on(app.set_parameter(gain, -6.0, None)).unwrap();
        block_on(app.mute(b)).unwrap();
        block_on(app.solo(a, false)).unwrap();
        block_on(app.set_channel_count(context, Some(4))).unwrap();
        app
    }

    #[test]
    fn round_trip_reserializes_identically() {
        let app = session();
        let document = app.serialize();
        let rebuilt = Application::deserialize(&document).unwrap();
        assert_eq!(rebuilt.serialize(), document);

        let json = document.to_json().unwrap();
        assert_eq!(Document::from_json(&json).unwrap(), document);
    }

    #[test]
    fn records_omit_empty_fields() {
        let json = session().serialize().to_json().unwrap();
        assert!(json.contains("\"kind\": \"master_track\""));
        assert!(json.contains("\"is_muted\": true"));
        assert!(!json.contains("\"is_cued\""));
        assert!(!json.contains("null"));
    }

    #[test]
    fn forward_references_are_requeued() {
        let app = session();
        let document = app.serialize();
        let context = app.contexts()[0];
        let b = app.tracks(context)[1];
        let later: Vec<Uuid> = app.subtree(b).into_iter().filter_map(|id| app.node(id).uuid).collect();
        // Sends lead, then track b's subtree ahead of its context and of track a.
        let mut shuffled = document.clone();
        shuffled.entities.sort_by_key(|e| match e {
            Entity::Send { .. } => 0,
            e if e.meta().uuid.is_some_and(|u| later.contains(&u)) => 1,
            _ => 2,
        });
        assert_ne!(shuffled, document);
        let rebuilt = Application::deserialize(&shuffled).unwrap();
        assert_eq!(rebuilt.serialize(), document);
    }

    #[test]
    fn sibling_order_is_recorded() {
        let app = session();
        let context = app.contexts()[0];
        let tracks = app.tracks(context);
        let (a, b) = (tracks[0], tracks[1]);
        let uuid = |id: NodeId| app.node(id).uuid.unwrap();
        let document = app.serialize();
        let spec = document
            .entities
            .iter()
            .find_map(|e| match e {
                Entity::Context { spec, .. } => Some(spec),
                _ => None,
            })
            .unwrap();
        assert_eq!(spec.slots.tracks, vec![uuid(a), uuid(b)]);
        let rebuilt = Application::deserialize(&document).unwrap();
        let rebuilt_context = rebuilt.contexts()[0];
        let sends = rebuilt.sends(rebuilt.tracks(rebuilt_context)[0], SendPosition::Prefader);
        assert_eq!(sends.len(), 2);
        assert!(matches!(
            rebuilt.node(sends[0]).as_patch().map(|p| &p.kind),
            Some(PatchKind::Send { target: Endpoint::Node(_) })
        ));
    }

    #[test]
    fn orphans_are_dropped_after_retries() {
        let orphan = Entity::Track {
            meta: Meta { name: None, uuid: Some(Uuid::new_v4()), parent: Some(Uuid::new_v4()) },
            spec: TrackSpec::default(),
        };
        let document = Document { entities: vec![orphan] };
        let app = Application::deserialize(&document).unwrap();
        assert!(app.contexts().is_empty());
    }

    #[test]
    fn documents_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session").join("mix.json");
        let document = session().serialize();
        document.save(&path).unwrap();
        assert_eq!(Document::load(&path).unwrap(), document);
    }
}
