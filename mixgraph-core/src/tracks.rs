//! Tracks: user tracks, chains, and a context's master and cue tracks.

use std::sync::{Arc, Mutex, PoisonError};

use mixgraph_audio::synthdefs::{levels_synthdef, patch_synthdef};
use mixgraph_audio::{BackendMessage, Control, PatchFlags, Provider, RawArg};
use mixgraph_types::{BusGroup, CalculationRate, NodeId};

use crate::application::Application;
use crate::error::{MixError, MixResult};
use crate::node::{
    Anchor, Endpoint, GroupRole, Node, NodeKind, NoteState, PatchKind, SendPosition, TrackData, TrackLevels, TrackRole,
    Transfer,
};
use crate::parameters::{ParameterKind, ParameterSpec};

/// Synths every track runs inside its group, in execution order.
const TRACK_SYNTHS: [&str; 5] = ["input", "input_levels", "prefader_levels", "output", "postfader_levels"];

/// Meter points and the synth reporting each.
const METERS: [(&str, &str); 3] = [
    ("input", "input_levels"),
    ("prefader", "prefader_levels"),
    ("postfader", "postfader_levels"),
];

fn store_levels(levels: &Mutex<TrackLevels>, key: &'static str, message: &BackendMessage) {
    let values: Vec<f32> = message.args.iter().skip(2).filter_map(RawArg::as_float).collect();
    let peak = values.iter().step_by(2).copied().collect();
    let rms = values.iter().skip(1).step_by(2).copied().collect();
    let mut levels = levels.lock().unwrap_or_else(PoisonError::into_inner);
    levels.peak.insert(key, peak);
    levels.rms.insert(key, rms);
}

impl Application {
    /// A detached track with its groups and builtin parameters.
    pub(crate) fn build_track(&mut self, role: TrackRole, name: Option<&str>) -> NodeId {
        let group = |app: &mut Self, role: GroupRole| app.insert_node(Node::new(NodeKind::Group(role)));
        let parameters = group(self, GroupRole::Parameters);
        let receives = group(self, GroupRole::Receives);
        let subtracks = (role == TrackRole::Track).then(|| group(self, GroupRole::SubTracks));
        let devices = group(self, GroupRole::Devices);
        let prefader_sends = group(self, GroupRole::PrefaderSends);
        let postfader_sends = group(self, GroupRole::PostfaderSends);

        let mut node = Node::new(NodeKind::Track(TrackData {
            role,
            parameters,
            receives,
            subtracks,
            devices,
            prefader_sends,
            postfader_sends,
            is_muted: false,
            is_soloed: false,
            is_cued: false,
            transfer: Transfer::default(),
            notes: NoteState::default(),
            levels: Arc::default(),
        }));
        node.name = name.map(str::to_string);
        let track = self.insert_node(node);
        for child in [Some(parameters), Some(receives), subtracks, Some(devices), Some(prefader_sends), Some(postfader_sends)]
            .into_iter()
            .flatten()
        {
            self.link(track, child);
        }

        let mut builtins = vec![("gain", ParameterSpec::float(0.0, -96.0, 6.0))];
        match role {
            TrackRole::Track | TrackRole::Chain => builtins.push(("panning", ParameterSpec::float(0.0, -1.0, 1.0))),
            TrackRole::Cue => builtins.push(("mix", ParameterSpec::float(0.0, 0.0, 1.0))),
            TrackRole::Master => {}
        }
        for (name, spec) in builtins {
            let param = self.create_parameter(name, ParameterKind::bus(spec), true);
            self.link(parameters, param);
        }
        track
    }

    /// A detached user track carrying its default postfader send.
    pub(crate) fn build_user_track(&mut self, name: Option<&str>) -> NodeId {
        let track = self.build_track(TrackRole::Track, name);
        let send = self.create_patch(PatchKind::Send { target: Endpoint::Default });
        if let Some(sends) = self.node(track).as_track().map(|t| t.postfader_sends) {
            self.link(sends, send);
        }
        track
    }

    /// The group user tracks go into under a context or a track.
    pub(crate) fn track_container(&self, parent: NodeId) -> MixResult<NodeId> {
        match &self.check(parent)?.kind {
            NodeKind::Context(context) => Ok(context.tracks),
            NodeKind::Track(TrackData { subtracks: Some(group), .. }) => Ok(*group),
            _ => Err(MixError::WrongKind { node: parent, expected: "context or track" }),
        }
    }

    /// User tracks directly below a context or track.
    pub fn tracks(&self, parent: NodeId) -> Vec<NodeId> {
        self.track_container(parent)
            .map(|group| self.children(group).to_vec())
            .unwrap_or_default()
    }

    pub(crate) fn insert_track(&mut self, parent: NodeId, name: Option<&str>) -> MixResult<NodeId> {
        let container = self.track_container(parent)?;
        let track = self.build_user_track(name);
        self.append(container, &[track])?;
        Ok(track)
    }

    /// Append a new user track to a context or (as a sub-track) to a track.
    pub async fn add_track(&mut self, parent: NodeId, name: Option<&str>) -> MixResult<NodeId> {
        self.track_container(parent)?;
        self.transact(&[parent], None, |app| app.insert_track(parent, name)).await
    }

    pub async fn remove_tracks(&mut self, parent: NodeId, tracks: &[NodeId]) -> MixResult {
        let container = self.track_container(parent)?;
        let mut locked = vec![parent];
        locked.extend_from_slice(tracks);
        self.transact(&locked, None, |app| app.remove_from(container, tracks)).await
    }

    /// Wrap `tracks` in a new track placed where the first of them was.
    pub async fn group_tracks(&mut self, tracks: &[NodeId], name: Option<&str>) -> MixResult<NodeId> {
        let Some(&first) = tracks.first() else {
            return Err(MixError::InvalidIndex { index: 0, len: 0 });
        };
        for &track in tracks {
            self.check(track)?;
            if self.track_role(track) != Some(TrackRole::Track) {
                return Err(MixError::WrongKind { node: track, expected: "track" });
            }
            if let Some(&ancestor) = tracks.iter().find(|other| self.is_ancestor(**other, track)) {
                return Err(MixError::Cycle { node: ancestor, container: track });
            }
        }
        self.transact(tracks, None, |app| {
            let group = app.build_user_track(name);
            if let (Some(parent), Some(index)) = (app.node(first).parent, app.index_of(first)) {
                app.splice(parent, index..index, &[group])?;
            }
            let subtracks = app.track_container(group)?;
            app.splice(subtracks, 0..0, tracks)?;
            Ok(group)
        })
        .await
    }

    /// Replace a track with its sub-tracks.
    pub(crate) fn ungroup_track(&mut self, id: NodeId) -> MixResult {
        let subtracks = self.track_container(id)?;
        let children = self.children(subtracks).to_vec();
        match (self.node(id).parent, self.index_of(id)) {
            (Some(parent), Some(index)) => self.splice(parent, index..index + 1, &children),
            _ => {
                let len = children.len();
                self.splice(subtracks, 0..len, &[])
            }
        }
    }

    /// Add a send from a track or chain. `Endpoint::Default` follows the
    /// track's default target.
    pub async fn add_send(&mut self, track: NodeId, target: Endpoint, position: SendPosition) -> MixResult<NodeId> {
        self.check(track)?;
        if let Endpoint::Node(target) = target {
            self.check(target)?;
        }
        let Some(data) = self.node(track).as_track() else {
            return Err(MixError::WrongKind { node: track, expected: "track" });
        };
        let container = match position {
            SendPosition::Prefader => data.prefader_sends,
            SendPosition::Postfader => data.postfader_sends,
        };
        self.transact(&[track], None, |app| {
            let send = app.create_patch(PatchKind::Send { target });
            app.append(container, &[send])?;
            Ok(send)
        })
        .await
    }

    pub async fn add_receive(&mut self, track: NodeId, source: Endpoint) -> MixResult<NodeId> {
        self.check(track)?;
        if let Endpoint::Node(source) = source {
            self.check(source)?;
        }
        let Some(container) = self.node(track).as_track().map(|t| t.receives) else {
            return Err(MixError::WrongKind { node: track, expected: "track" });
        };
        self.transact(&[track], None, |app| {
            let receive = app.create_patch(PatchKind::Receive { source });
            app.append(container, &[receive])?;
            Ok(receive)
        })
        .await
    }

    pub fn sends(&self, track: NodeId, position: SendPosition) -> Vec<NodeId> {
        let Some(data) = self.get(track).and_then(Node::as_track) else {
            return Vec::new();
        };
        let group = match position {
            SendPosition::Prefader => data.prefader_sends,
            SendPosition::Postfader => data.postfader_sends,
        };
        self.children(group).to_vec()
    }

    pub fn receives(&self, track: NodeId) -> Vec<NodeId> {
        self.get(track)
            .and_then(Node::as_track)
            .map(|t| self.children(t.receives).to_vec())
            .unwrap_or_default()
    }

    /// Remove sends from either fader position of `track`.
    pub async fn remove_sends(&mut self, track: NodeId, sends: &[NodeId]) -> MixResult {
        let Some(data) = self.check(track)?.as_track() else {
            return Err(MixError::WrongKind { node: track, expected: "track" });
        };
        let (pre, post) = (data.prefader_sends, data.postfader_sends);
        for &send in sends {
            let parent = self.check(send)?.parent;
            if parent != Some(pre) && parent != Some(post) {
                return Err(MixError::NotInParent { node: send, parent: track });
            }
        }
        self.transact(&[track], None, |app| app.remove_children(sends)).await
    }

    pub async fn remove_receives(&mut self, track: NodeId, receives: &[NodeId]) -> MixResult {
        let Some(container) = self.check(track)?.as_track().map(|t| t.receives) else {
            return Err(MixError::WrongKind { node: track, expected: "track" });
        };
        self.transact(&[track], None, |app| app.remove_from(container, receives)).await
    }

    /// Latest meter readings, keyed by meter point.
    pub fn levels(&self, track: NodeId) -> Option<TrackLevels> {
        let levels = &self.get(track)?.as_track()?.levels;
        Some(levels.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    fn allocate_track_buses(&mut self, id: NodeId, provider: &Arc<Provider>, channel_count: u32) -> MixResult {
        let input = provider.add_bus_group(CalculationRate::Audio, channel_count)?;
        let output = provider.add_bus_group(CalculationRate::Audio, channel_count)?;
        let buses = &mut self.node_mut(id).resources.audio_buses;
        buses.insert("input", input);
        buses.insert("output", output);
        Ok(())
    }

    fn allocate_track_synths(&mut self, id: NodeId, provider: &Arc<Provider>, channel_count: u32, anchors: [Anchor; 5]) {
        let node = self.node(id);
        let bus = |role: &str| node.resources.audio_buses.get(role).copied();
        let (Some(input), Some(output)) = (bus("input"), bus("output")) else {
            return;
        };
        let gain = self
            .parameter(id, "gain")
            .and_then(|p| self.node(p).resources.control_buses.get("bus").copied());
        let active = i32::from(node.is_active);
        let levels = levels_synthdef(channel_count);
        let mut synths = Vec::with_capacity(TRACK_SYNTHS.len());
        for (role, anchor) in TRACK_SYNTHS.into_iter().zip(anchors) {
            let (synthdef, controls) = match role {
                "input" => (
                    patch_synthdef(channel_count, channel_count, PatchFlags::default().feedback(true).gain()),
                    vec![("in_", Control::Bus(input)), ("out", Control::Bus(output))],
                ),
                "output" => {
                    let mut controls = vec![("active", Control::Int(active))];
                    controls.extend(gain.map(|bus| ("gain", Control::Bus(bus))));
                    controls.push(("in_", Control::Bus(output)));
                    controls.push(("out", Control::Bus(output)));
                    let flags = PatchFlags::default().gain().hard_gate().replace_out();
                    (patch_synthdef(channel_count, channel_count, flags), controls)
                }
                _ => (levels.clone(), vec![("out", Control::Bus(output))]),
            };
            synths.push((role, provider.add_synth(&synthdef, anchor.target, anchor.action, &controls, Some(role))));
        }
        self.node_mut(id).resources.nodes.extend(synths);
    }

    fn register_level_callbacks(&mut self, id: NodeId, provider: &Arc<Provider>) {
        let node = self.node(id);
        let Some(levels) = node.as_track().map(|t| t.levels.clone()) else {
            return;
        };
        let mut callbacks = Vec::new();
        for (key, role) in METERS {
            let Some(synth) = node.resources.nodes.get(role) else {
                continue;
            };
            let levels = levels.clone();
            let callback = provider.register_osc_callback("/levels", vec![RawArg::Int(synth.id)], move |message| {
                store_levels(&levels, key, message)
            });
            callbacks.push((key, callback));
        }
        self.node_mut(id).resources.callbacks.extend(callbacks);
    }

    pub(crate) fn allocate_track(&mut self, id: NodeId, provider: &Arc<Provider>, anchor: Anchor) -> MixResult {
        let channel_count = self.effective_channel_count(id);
        let label = self.node(id).kind.label();
        let group = provider.add_group(anchor.target, anchor.action, Some(label));
        self.node_mut(id).resources.nodes.insert("node", group);
        self.allocate_track_buses(id, provider, channel_count)?;
        self.allocate_track_synths(id, provider, channel_count, [Anchor::tail(group); 5]);
        self.register_level_callbacks(id, provider);
        Ok(())
    }

    /// New buses and synths next to the old ones, then release the old.
    pub(crate) fn reallocate_track(&mut self, id: NodeId, provider: &Arc<Provider>) -> MixResult {
        let channel_count = self.effective_channel_count(id);
        let resources = &mut self.node_mut(id).resources;
        let old_buses: Vec<BusGroup> = ["input", "output"]
            .iter()
            .filter_map(|role| resources.audio_buses.remove(role))
            .collect();
        let old_synths: Vec<_> = TRACK_SYNTHS.iter().filter_map(|role| resources.nodes.remove(role)).collect();
        let old_callbacks: Vec<_> = std::mem::take(&mut resources.callbacks).into_values().collect();

        self.allocate_track_buses(id, provider, channel_count)?;
        if old_synths.len() == TRACK_SYNTHS.len() {
            let anchors = [0, 1, 2, 3, 4].map(|i| Anchor::after(old_synths[i]));
            self.allocate_track_synths(id, provider, channel_count, anchors);
        } else if let Some(group) = self.node(id).remote_node() {
            self.allocate_track_synths(id, provider, channel_count, [Anchor::tail(group); 5]);
        }
        for synth in old_synths {
            provider.free_node(synth);
        }
        for bus in old_buses {
            provider.free_bus_group(bus);
        }
        for callback in old_callbacks {
            provider.unregister_osc_callback(callback);
        }
        self.register_level_callbacks(id, provider);
        Ok(())
    }
}
