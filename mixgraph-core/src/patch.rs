//! Patch edges: sends, receives, direct outs and device in/out.
//!
//! Every patch owns a remote group; the patch synth inside it is derived
//! from the patch's route (source bus, target bus, feedback) and replaced
//! whenever that route changes. Routes depend on tree position, so they are
//! recomputed in `resolve_patches` after each reconcile pass for every patch
//! near a touched node.

use std::collections::BTreeSet;
use std::sync::Arc;

use mixgraph_audio::synthdefs::patch_synthdef;
use mixgraph_audio::{Control, PatchFlags, Provider};
use mixgraph_types::{AddAction, BusGroup, CalculationRate, NodeId, RemoteNode};

use crate::application::Application;
use crate::error::MixResult;
use crate::node::{Endpoint, Node, NodeKind, PatchData, PatchKind, PatchSignature, TrackRole};

/// A resolved patch: what to read, what to write, and how.
#[derive(Debug, Clone)]
struct Route {
    signature: PatchSignature,
    flags: PatchFlags,
    controls: Vec<(&'static str, Control)>,
}

impl Application {
    pub(crate) fn create_patch(&mut self, kind: PatchKind) -> NodeId {
        self.insert_node(Node::new(NodeKind::Patch(PatchData { kind, peer: None, signature: None })))
    }

    /// The node a send writes into or a receive reads from, if resolvable.
    pub fn patch_peer(&self, id: NodeId) -> Option<NodeId> {
        let node = self.get(id)?;
        node.application?;
        let owner = self.track_object_of(id)?;
        let (endpoint, is_send) = match &node.as_patch()?.kind {
            PatchKind::Send { target } => (*target, true),
            PatchKind::Receive { source } => (*source, false),
            _ => return None,
        };
        match endpoint {
            Endpoint::Node(peer) => {
                let candidate = self.get(peer)?;
                let routable = matches!(candidate.kind, NodeKind::Track(_) | NodeKind::Rack(_));
                (routable && peer != owner && candidate.application == node.application).then_some(peer)
            }
            Endpoint::Default if is_send => self.default_send_target(owner),
            Endpoint::Default => match self.track_role(owner)? {
                TrackRole::Chain => self.rack_of(owner),
                _ => None,
            },
        }
    }

    /// A chain sends to its rack; a sub-track to its parent track; a
    /// top-level track to its context's master.
    pub fn default_send_target(&self, track: NodeId) -> Option<NodeId> {
        match self.track_role(track)? {
            TrackRole::Chain => self.rack_of(track),
            TrackRole::Track => self.track_object_of(track).or_else(|| {
                let context = self.context_of(track)?;
                match &self.node(context).kind {
                    NodeKind::Context(data) => Some(data.master),
                    _ => None,
                }
            }),
            TrackRole::Master | TrackRole::Cue => None,
        }
    }

    fn audio_bus(&self, id: NodeId, role: &str) -> Option<BusGroup> {
        self.node(id).resources.audio_buses.get(role).copied()
    }

    /// Bus a send into `peer` writes.
    fn send_bus(&self, peer: NodeId) -> Option<BusGroup> {
        match self.node(peer).kind {
            NodeKind::Track(_) => self.audio_bus(peer, "input"),
            NodeKind::Rack(_) => self.audio_bus(peer, "output"),
            _ => None,
        }
    }

    /// Bus a receive from `peer` reads.
    fn receive_bus(&self, peer: NodeId) -> Option<BusGroup> {
        match self.node(peer).kind {
            NodeKind::Track(_) => self.audio_bus(peer, "output"),
            NodeKind::Rack(_) => self.audio_bus(peer, "input"),
            _ => None,
        }
    }

    /// A send is feedback when its target has already run.
    fn send_is_feedback(&self, send: NodeId, peer: NodeId) -> bool {
        let mut finished = self.graph_order(peer);
        finished.push(usize::MAX);
        finished < self.graph_order(send)
    }

    /// A receive is feedback when its source is written after it runs.
    fn receive_is_feedback(&self, receive: NodeId, peer: NodeId) -> bool {
        let written = match &self.node(peer).kind {
            NodeKind::Rack(rack) => self.graph_order(rack.device_in),
            _ => {
                let mut order = self.graph_order(peer);
                order.push(usize::MAX);
                order
            }
        };
        written > self.graph_order(receive)
    }

    fn route(&self, id: NodeId, peer: Option<NodeId>) -> Option<Route> {
        let kind = &self.node(id).as_patch()?.kind;
        let device = || self.device_of(id);
        let device_bus = |device: NodeId| match self.node(device).kind {
            NodeKind::Rack(_) => self.audio_bus(device, "input"),
            _ => self.audio_bus(device, "output"),
        };
        let (source, target, feedback, flags, controls) = match kind {
            PatchKind::Send { .. } => {
                let (owner, peer) = (self.track_object_of(id)?, peer?);
                let feedback = self.send_is_feedback(id, peer);
                let flags = PatchFlags::default().feedback(feedback).gain();
                (self.audio_bus(owner, "output")?, self.send_bus(peer)?, feedback, flags, Vec::new())
            }
            PatchKind::Receive { .. } => {
                let (owner, peer) = (self.track_object_of(id)?, peer?);
                let feedback = self.receive_is_feedback(id, peer);
                let flags = PatchFlags::default().feedback(feedback).gain();
                (self.receive_bus(peer)?, self.audio_bus(owner, "input")?, feedback, flags, Vec::new())
            }
            PatchKind::DirectOut { bus, channel_count } => {
                let owner = self.track_object_of(id)?;
                let source = self.audio_bus(owner, "output")?;
                let index = match bus {
                    Some(index) => *index,
                    None => self.effective_channel_count(self.context_of(id)?) as i32,
                };
                let target = BusGroup {
                    rate: CalculationRate::Audio,
                    index,
                    channel_count: channel_count.unwrap_or(source.channel_count),
                };
                (source, target, false, PatchFlags::default(), Vec::new())
            }
            PatchKind::DeviceIn => {
                let device = device()?;
                let owner = self.track_object_of(device)?;
                let flags = PatchFlags::default().replace_out();
                (self.audio_bus(owner, "output")?, device_bus(device)?, false, flags, Vec::new())
            }
            PatchKind::DeviceOut => {
                let device = device()?;
                let owner = self.track_object_of(device)?;
                let active = i32::from(self.node(device).is_active);
                let flags = PatchFlags::default().hard_gate().mix_out();
                let source = self.audio_bus(device, "output")?;
                (source, self.audio_bus(owner, "output")?, false, flags, vec![("active", Control::Int(active))])
            }
        };
        Some(Route { signature: PatchSignature { source, target, feedback }, flags, controls })
    }

    /// Drop `id` from its peer's dependents.
    pub(crate) fn release_peer(&mut self, id: NodeId) {
        let Some(peer) = self.node_mut(id).as_patch_mut().and_then(|p| p.peer.take()) else {
            return;
        };
        let targets = &mut self.node_mut(peer).targets;
        targets.sends.remove(&id);
        targets.receives.remove(&id);
    }

    fn bind_peer(&mut self, id: NodeId, peer: Option<NodeId>) {
        let current = self.node(id).as_patch().and_then(|p| p.peer);
        if current == peer {
            return;
        }
        self.release_peer(id);
        let Some(peer) = peer else {
            return;
        };
        let is_send = matches!(self.node(id).as_patch().map(|p| &p.kind), Some(PatchKind::Send { .. }));
        let targets = &mut self.node_mut(peer).targets;
        if is_send {
            targets.sends.insert(id);
        } else {
            targets.receives.insert(id);
        }
        if let Some(patch) = self.node_mut(id).as_patch_mut() {
            patch.peer = Some(peer);
        }
    }

    /// Re-resolve every patch near `touched`, in graph order. New synths are
    /// all created before any superseded one is released.
    pub(crate) fn resolve_patches(&mut self, touched: &[NodeId]) -> MixResult {
        let mut dirty = BTreeSet::new();
        let mut visited = BTreeSet::new();
        for &id in touched {
            for node in self.subtree(id) {
                if !visited.insert(node) {
                    continue;
                }
                if self.node(node).as_patch().is_some() {
                    dirty.insert(node);
                }
                dirty.extend(self.node(node).targets.iter());
            }
            for ancestor in self.parentage(id).into_iter().skip(1) {
                dirty.extend(self.node(ancestor).targets.iter());
            }
        }
        let mut ordered: Vec<(Vec<usize>, NodeId)> = dirty.into_iter().map(|p| (self.graph_order(p), p)).collect();
        ordered.sort();

        let mut superseded: Vec<(Arc<Provider>, RemoteNode)> = Vec::new();
        for (_, patch) in ordered {
            self.resolve_patch(patch, &mut superseded);
        }
        for (provider, synth) in superseded {
            provider.free_node(synth);
        }
        Ok(())
    }

    fn resolve_patch(&mut self, id: NodeId, superseded: &mut Vec<(Arc<Provider>, RemoteNode)>) {
        let peer = self.patch_peer(id);
        self.bind_peer(id, peer);
        let node = self.node(id);
        let (Some(provider), Some(group)) = (node.provider.clone(), node.remote_node()) else {
            return;
        };
        let route = self.route(id, peer);
        let signature = route.as_ref().map(|r| r.signature);
        if node.as_patch().and_then(|p| p.signature) == signature {
            return;
        }
        let label = node.kind.label();
        let node = self.node_mut(id);
        if let Some(old) = node.resources.nodes.remove("synth") {
            superseded.push((provider.clone(), old));
        }
        if let Some(patch) = node.as_patch_mut() {
            patch.signature = signature;
        }
        let Some(route) = route else {
            return;
        };
        let PatchSignature { source, target, .. } = route.signature;
        let synthdef = patch_synthdef(source.channel_count, target.channel_count, route.flags);
        let mut controls = vec![("in_", Control::Bus(source)), ("out", Control::Bus(target))];
        controls.extend(route.controls);
        let synth = provider.add_synth(&synthdef, group, AddAction::AddToHead, &controls, Some(label));
        self.node_mut(id).resources.nodes.insert("synth", synth);
    }

    /// Resolved send targets writing into `id`.
    pub fn incoming_sends(&self, id: NodeId) -> Vec<NodeId> {
        self.get(id).map(|n| n.targets.sends.iter().copied().collect()).unwrap_or_default()
    }

    pub fn outgoing_receives(&self, id: NodeId) -> Vec<NodeId> {
        self.get(id).map(|n| n.targets.receives.iter().copied().collect()).unwrap_or_default()
    }

    /// Current synthdef name of an allocated patch.
    pub fn patch_synthdef_of(&self, id: NodeId) -> Option<String> {
        let route = self.route(id, self.get(id)?.as_patch()?.peer)?;
        let PatchSignature { source, target, .. } = route.signature;
        Some(patch_synthdef(source.channel_count, target.channel_count, route.flags))
    }
}

#[cfg(test)]
mod tests {
    use async_std::task::block_on;

    use crate::application::Application;
    use crate::node::Endpoint;

    #[test]
    fn default_send_targets_follow_the_tree() {
        let mut app = Application::new(2);
        let context = app.insert_context(None).unwrap();
        let parent = app.insert_track(context, None).unwrap();
        let child = app.insert_track(parent, None).unwrap();
        let master = app.children(context)[1];

        assert_eq!(app.default_send_target(parent), Some(master));
        assert_eq!(app.default_send_target(child), Some(parent));
        assert_eq!(app.default_send_target(master), None);

        let send = app.node(parent).as_track().map(|t| app.children(t.postfader_sends)[0]).unwrap();
        assert_eq!(app.patch_peer(send), Some(master));
        assert!(app.incoming_sends(master).contains(&send));
    }

    #[test]
    fn explicit_targets_register_and_release() {
        let mut app = Application::new(2);
        let context = app.insert_context(None).unwrap();
        let a = app.insert_track(context, None).unwrap();
        let b = app.insert_track(context, None).unwrap();
        let send = block_on(app.add_send(a, Endpoint::Node(b), crate::node::SendPosition::Postfader)).unwrap();
        assert_eq!(app.incoming_sends(b), vec![send]);

        block_on(app.remove_sends(a, &[send])).unwrap();
        assert!(app.incoming_sends(b).is_empty());
    }

    #[test]
    fn self_sends_do_not_resolve() {
        let mut app = Application::new(2);
        let context = app.insert_context(None).unwrap();
        let a = app.insert_track(context, None).unwrap();
        let send = block_on(app.add_send(a, Endpoint::Node(a), crate::node::SendPosition::Prefader)).unwrap();
        assert_eq!(app.patch_peer(send), None);
    }
}
