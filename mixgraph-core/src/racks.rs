//! Racks and their parallel chains.

use std::collections::BTreeSet;
use std::sync::Arc;

use mixgraph_audio::Provider;
use mixgraph_types::{CalculationRate, NodeId};

use crate::application::Application;
use crate::error::{MixError, MixResult};
use crate::node::{Anchor, Endpoint, GroupRole, Node, NodeKind, NoteState, PatchKind, RackData, TrackRole, Transfer};

impl Application {
    pub(crate) fn build_rack(&mut self, name: Option<&str>) -> NodeId {
        let parameters = self.build_device_parameters();
        let device_in = self.create_patch(PatchKind::DeviceIn);
        let chains = self.insert_node(Node::new(NodeKind::Group(GroupRole::Chains)));
        let device_out = self.create_patch(PatchKind::DeviceOut);
        let mut node = Node::new(NodeKind::Rack(RackData {
            parameters,
            device_in,
            chains,
            device_out,
            soloed: BTreeSet::new(),
            notes: NoteState::default(),
        }));
        node.name = name.map(str::to_string);
        let rack = self.insert_node(node);
        for child in [parameters, device_in, chains, device_out] {
            self.link(rack, child);
        }
        rack
    }

    /// A detached chain with its default send to and receive from the rack.
    pub(crate) fn build_chain(&mut self, name: Option<&str>) -> NodeId {
        let chain = self.build_track(TrackRole::Chain, name);
        let send = self.create_patch(PatchKind::Send { target: Endpoint::Default });
        let receive = self.create_patch(PatchKind::Receive { source: Endpoint::Default });
        if let Some(track) = self.node(chain).as_track() {
            let (sends, receives) = (track.postfader_sends, track.receives);
            self.link(sends, send);
            self.link(receives, receive);
        }
        chain
    }

    fn chains_group(&self, rack: NodeId) -> MixResult<NodeId> {
        match &self.check(rack)?.kind {
            NodeKind::Rack(data) => Ok(data.chains),
            _ => Err(MixError::WrongKind { node: rack, expected: "rack" }),
        }
    }

    pub fn chains(&self, rack: NodeId) -> Vec<NodeId> {
        self.chains_group(rack)
            .map(|group| self.children(group).to_vec())
            .unwrap_or_default()
    }

    pub async fn add_rack(&mut self, track: NodeId, name: Option<&str>) -> MixResult<NodeId> {
        let group = self
            .check(track)?
            .as_track()
            .map(|t| t.devices)
            .ok_or(MixError::WrongKind { node: track, expected: "track or chain" })?;
        self.transact(&[track], None, |app| {
            let rack = app.build_rack(name);
            app.append(group, &[rack])?;
            Ok(rack)
        })
        .await
    }

    pub(crate) fn insert_chain(&mut self, rack: NodeId, name: Option<&str>) -> MixResult<NodeId> {
        let group = self.chains_group(rack)?;
        let chain = self.build_chain(name);
        self.append(group, &[chain])?;
        Ok(chain)
    }

    pub async fn add_chain(&mut self, rack: NodeId, name: Option<&str>) -> MixResult<NodeId> {
        self.chains_group(rack)?;
        self.transact(&[rack], None, |app| app.insert_chain(rack, name)).await
    }

    pub async fn remove_chains(&mut self, rack: NodeId, chains: &[NodeId]) -> MixResult {
        let group = self.chains_group(rack)?;
        let mut locked = vec![rack];
        locked.extend_from_slice(chains);
        self.transact(&locked, None, |app| app.remove_from(group, chains)).await
    }

    /// Set the note filter between a chain and its rack.
    pub fn set_transfer(&mut self, chain: NodeId, transfer: Transfer) -> MixResult {
        match self.check(chain)?.as_track() {
            Some(track) if track.role == TrackRole::Chain => {}
            _ => return Err(MixError::WrongKind { node: chain, expected: "chain" }),
        }
        if let Some(track) = self.node_mut(chain).as_track_mut() {
            track.transfer = transfer;
        }
        Ok(())
    }

    /// Dissolve a rack: its single chain's devices take the rack's place.
    pub(crate) fn ungroup_rack(&mut self, rack: NodeId) -> MixResult {
        let chains = self.chains(rack);
        if chains.len() > 1 {
            return Err(MixError::WrongKind { node: rack, expected: "rack with at most one chain" });
        }
        let devices = chains.first().map(|c| self.devices(*c)).unwrap_or_default();
        match (self.node(rack).parent, self.index_of(rack)) {
            (Some(parent), Some(index)) => self.splice(parent, index..index + 1, &devices),
            _ => Ok(()),
        }
    }

    pub(crate) fn allocate_rack(&mut self, id: NodeId, provider: &Arc<Provider>, anchor: Anchor) -> MixResult {
        let channel_count = self.effective_channel_count(id);
        let group = provider.add_group(anchor.target, anchor.action, Some("RackDevice"));
        self.node_mut(id).resources.nodes.insert("node", group);
        self.allocate_rack_buses(id, provider, channel_count)
    }

    fn allocate_rack_buses(&mut self, id: NodeId, provider: &Arc<Provider>, channel_count: u32) -> MixResult {
        let input = provider.add_bus_group(CalculationRate::Audio, channel_count)?;
        let output = provider.add_bus_group(CalculationRate::Audio, channel_count)?;
        let buses = &mut self.node_mut(id).resources.audio_buses;
        buses.insert("input", input);
        buses.insert("output", output);
        Ok(())
    }

    /// Fresh buses first; the patches reading the old ones are rebuilt when
    /// the pass settles.
    pub(crate) fn reallocate_rack(&mut self, id: NodeId, provider: &Arc<Provider>) -> MixResult {
        let channel_count = self.effective_channel_count(id);
        let buses = &mut self.node_mut(id).resources.audio_buses;
        let old: Vec<_> = [buses.remove("input"), buses.remove("output")].into_iter().flatten().collect();
        self.allocate_rack_buses(id, provider, channel_count)?;
        for bus in old {
            provider.free_bus_group(bus);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use async_std::task::block_on;

    use super::*;

    fn rack_with_chains(count: usize) -> (Application, NodeId, NodeId, Vec<NodeId>) {
        let mut app = Application::new(2);
        let context = app.insert_context(None).unwrap();
        let track = app.insert_track(context, None).unwrap();
        let rack = block_on(app.add_rack(track, None)).unwrap();
        let chains = (0..count).map(|_| app.insert_chain(rack, None).unwrap()).collect();
        (app, track, rack, chains)
    }

    #[test]
    fn chains_default_to_the_rack() {
        let (app, _, rack, chains) = rack_with_chains(1);
        let send = app.sends(chains[0], crate::node::SendPosition::Postfader)[0];
        let receive = app.receives(chains[0])[0];
        assert_eq!(app.patch_peer(send), Some(rack));
        assert_eq!(app.patch_peer(receive), Some(rack));
        assert_eq!(app.mixer_of(chains[0]), Some(rack));
    }

    #[test]
    fn ungroup_refuses_multi_chain_racks() {
        let (mut app, _, rack, _) = rack_with_chains(2);
        assert!(matches!(block_on(app.ungroup(rack)), Err(MixError::WrongKind { .. })));
    }

    #[test]
    fn ungroup_promotes_the_chain_devices() {
        let (mut app, track, rack, chains) = rack_with_chains(1);
        let kind = crate::node::DeviceKind::AudioEffect { synthdef: "fx/eq".into() };
        let device = block_on(app.add_device(chains[0], kind, None)).unwrap();
        block_on(app.ungroup(rack)).unwrap();
        assert_eq!(app.devices(track), vec![device]);
        assert!(app.node(rack).parent.is_none());
    }

    #[test]
    fn transfer_only_applies_to_chains() {
        let (mut app, track, _, chains) = rack_with_chains(1);
        let transfer = Transfer { in_pitch: Some(60), out_pitch: None };
        app.set_transfer(chains[0], transfer).unwrap();
        assert_eq!(app.node(chains[0]).as_track().map(|t| t.transfer), Some(transfer));
        assert!(app.set_transfer(track, transfer).is_err());
    }
}
