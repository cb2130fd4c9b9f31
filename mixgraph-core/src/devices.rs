//! Devices in a track's device chain: audio effects and instruments.
//! Racks share the device-level operations here; their chains live in
//! `racks`.

use std::sync::Arc;

use mixgraph_audio::{Control, Provider};
use mixgraph_types::{AddAction, CalculationRate, NodeId};

use crate::application::Application;
use crate::error::{MixError, MixResult};
use crate::node::{Anchor, DeviceData, DeviceKind, GroupRole, Node, NodeKind, NoteState, PatchKind};
use crate::parameters::{as_controls, ParameterAction, ParameterKind, ParameterSpec};

impl Application {
    /// Parameter group with the `active` switch every device carries.
    pub(crate) fn build_device_parameters(&mut self) -> NodeId {
        let group = self.insert_node(Node::new(NodeKind::Group(GroupRole::Parameters)));
        let active = ParameterKind::callback(ParameterSpec::boolean(true), ParameterAction::DeviceActive);
        let param = self.create_parameter("active", active, true);
        self.link(group, param);
        group
    }

    pub(crate) fn build_device(&mut self, kind: DeviceKind, name: Option<&str>) -> NodeId {
        let parameters = self.build_device_parameters();
        let device_in = self.create_patch(PatchKind::DeviceIn);
        let device_out = self.create_patch(PatchKind::DeviceOut);
        let mut node = Node::new(NodeKind::Device(DeviceData {
            kind,
            parameters,
            device_in,
            device_out,
            voices: Default::default(),
            notes: NoteState::default(),
        }));
        node.name = name.map(str::to_string);
        let device = self.insert_node(node);
        for child in [parameters, device_in, device_out] {
            self.link(device, child);
        }
        device
    }

    fn devices_group(&self, track: NodeId) -> MixResult<NodeId> {
        self.check(track)?
            .as_track()
            .map(|t| t.devices)
            .ok_or(MixError::WrongKind { node: track, expected: "track or chain" })
    }

    pub fn devices(&self, track: NodeId) -> Vec<NodeId> {
        self.devices_group(track)
            .map(|group| self.children(group).to_vec())
            .unwrap_or_default()
    }

    /// Append a device to a track's device chain.
    pub async fn add_device(&mut self, track: NodeId, kind: DeviceKind, name: Option<&str>) -> MixResult<NodeId> {
        let group = self.devices_group(track)?;
        self.transact(&[track], None, |app| {
            let device = app.build_device(kind, name);
            app.append(group, &[device])?;
            Ok(device)
        })
        .await
    }

    pub async fn remove_devices(&mut self, track: NodeId, devices: &[NodeId]) -> MixResult {
        let group = self.devices_group(track)?;
        let mut locked = vec![track];
        locked.extend_from_slice(devices);
        self.transact(&locked, None, |app| app.remove_from(group, devices)).await
    }

    pub async fn activate(&mut self, device: NodeId) -> MixResult {
        self.set_active_parameter(device, true).await
    }

    pub async fn deactivate(&mut self, device: NodeId) -> MixResult {
        self.set_active_parameter(device, false).await
    }

    async fn set_active_parameter(&mut self, device: NodeId, active: bool) -> MixResult {
        if !self.check(device)?.is_device_like() {
            return Err(MixError::WrongKind { node: device, expected: "device" });
        }
        let param = self
            .parameter(device, "active")
            .ok_or(MixError::WrongKind { node: device, expected: "device with an active switch" })?;
        self.set_parameter(param, f32::from(u8::from(active)), None).await
    }

    /// Gate a device's output patch. Called through the `active` parameter.
    pub(crate) fn set_device_active(&mut self, device: NodeId, active: bool) {
        let node = self.node_mut(device);
        if !node.is_device_like() || node.is_active == active {
            return;
        }
        node.is_active = active;
        let device_out = match &node.kind {
            NodeKind::Device(d) => d.device_out,
            NodeKind::Rack(r) => r.device_out,
            _ => return,
        };
        let out = self.node(device_out);
        if let (Some(provider), Some(synth)) = (out.provider.clone(), out.resources.nodes.get("synth").copied()) {
            provider.set_node(synth, &[("active", Control::Int(i32::from(active)))]);
        }
    }

    pub(crate) fn allocate_device(&mut self, id: NodeId, provider: &Arc<Provider>, anchor: Anchor) -> MixResult {
        let channel_count = self.effective_channel_count(id);
        let label = self.node(id).kind.label();
        let group = provider.add_group(anchor.target, anchor.action, Some(label));
        let output = provider.add_bus_group(CalculationRate::Audio, channel_count)?;
        let body = provider.add_group(group, AddAction::AddToTail, Some("body"));
        let resources = &mut self.node_mut(id).resources;
        resources.nodes.insert("node", group);
        resources.nodes.insert("body", body);
        resources.audio_buses.insert("output", output);
        self.allocate_effect_synth(id, provider, Anchor::head(body));
        Ok(())
    }

    /// The processing synth of an audio effect, writing its output bus in place.
    fn allocate_effect_synth(&mut self, id: NodeId, provider: &Arc<Provider>, anchor: Anchor) {
        let node = self.node(id);
        let synthdef = match &node.kind {
            NodeKind::Device(DeviceData { kind: DeviceKind::AudioEffect { synthdef }, .. }) => synthdef.clone(),
            _ => return,
        };
        let Some(output) = node.resources.audio_buses.get("output").copied() else {
            return;
        };
        let mut controls = vec![("out".to_string(), Control::Bus(output))];
        controls.extend(self.parameter_controls(id));
        let synth = provider.add_synth(&synthdef, anchor.target, anchor.action, &as_controls(&controls), Some("effect"));
        self.node_mut(id).resources.nodes.insert("synth", synth);
    }

    pub(crate) fn reallocate_device(&mut self, id: NodeId, provider: &Arc<Provider>) -> MixResult {
        let channel_count = self.effective_channel_count(id);
        let output = provider.add_bus_group(CalculationRate::Audio, channel_count)?;
        let node = self.node_mut(id);
        let old_output = node.resources.audio_buses.insert("output", output);
        let old_synth = node.resources.nodes.remove("synth");
        let body = node.resources.nodes.get("body").copied();
        if let NodeKind::Device(device) = &mut node.kind {
            for (_, voice) in std::mem::take(&mut device.voices) {
                provider.free_node(voice);
            }
            device.notes = NoteState::default();
        }
        match (old_synth, body) {
            (Some(old), _) => self.allocate_effect_synth(id, provider, Anchor::after(old)),
            (None, Some(body)) => self.allocate_effect_synth(id, provider, Anchor::head(body)),
            (None, None) => {}
        }
        if let Some(old) = old_synth {
            provider.free_node(old);
        }
        if let Some(bus) = old_output {
            provider.free_bus_group(bus);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use async_std::task::block_on;

    use super::*;

    #[test]
    fn devices_toggle_through_their_active_parameter() {
        let mut app = Application::new(2);
        let context = app.insert_context(None).unwrap();
        let track = app.insert_track(context, None).unwrap();
        let kind = DeviceKind::AudioEffect { synthdef: "fx/limiter".into() };
        let device = block_on(app.add_device(track, kind, Some("limiter"))).unwrap();

        assert_eq!(app.devices(track), vec![device]);
        assert!(app.is_active(device));
        block_on(app.deactivate(device)).unwrap();
        assert!(!app.is_active(device));
        let param = app.parameter(device, "active").unwrap();
        assert_eq!(app.parameter_value(param), Some(0.0));
        block_on(app.activate(device)).unwrap();
        assert!(app.is_active(device));
    }

    #[test]
    fn devices_cannot_be_added_to_contexts() {
        let mut app = Application::new(2);
        let context = app.insert_context(None).unwrap();
        let kind = DeviceKind::Instrument { synthdef: "default".into() };
        assert!(matches!(block_on(app.add_device(context, kind, None)), Err(MixError::WrongKind { .. })));
    }
}
