//! Named, typed parameters living in an owner's parameter group.
//!
//! Bus parameters are backed by a control bus so owner synths can map them;
//! buffer parameters load a sound file into a server buffer; callback
//! parameters keep a local value and drive an owner action.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use mixgraph_audio::synthdefs::RAMP_SYNTHDEF;
use mixgraph_audio::{Control, Provider};
use mixgraph_types::{BusGroup, NodeId};

use crate::application::Application;
use crate::error::{MixError, MixResult};
use crate::node::{Anchor, Node, NodeKind, ParameterData};

/// Value domain of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParameterSpec {
    Boolean { default: bool },
    Float { default: f32, minimum: f32, maximum: f32 },
    Integer { default: i32, minimum: i32, maximum: i32 },
    Null,
}

impl ParameterSpec {
    pub fn boolean(default: bool) -> Self {
        ParameterSpec::Boolean { default }
    }

    pub fn float(default: f32, minimum: f32, maximum: f32) -> Self {
        let (minimum, maximum) = if minimum <= maximum { (minimum, maximum) } else { (maximum, minimum) };
        ParameterSpec::Float { default: default.clamp(minimum, maximum), minimum, maximum }
    }

    pub fn integer(default: i32, minimum: i32, maximum: i32) -> Self {
        let (minimum, maximum) = if minimum <= maximum { (minimum, maximum) } else { (maximum, minimum) };
        ParameterSpec::Integer { default: default.clamp(minimum, maximum), minimum, maximum }
    }

    pub fn default_value(&self) -> f32 {
        match *self {
            ParameterSpec::Boolean { default } => f32::from(u8::from(default)),
            ParameterSpec::Float { default, .. } => default,
            ParameterSpec::Integer { default, .. } => default as f32,
            ParameterSpec::Null => 0.0,
        }
    }

    pub fn clamp(&self, value: f32) -> f32 {
        match *self {
            ParameterSpec::Boolean { .. } => {
                if value != 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            ParameterSpec::Float { minimum, maximum, .. } => value.clamp(minimum, maximum),
            ParameterSpec::Integer { minimum, maximum, .. } => {
                value.round().clamp(minimum as f32, maximum as f32)
            }
            ParameterSpec::Null => 0.0,
        }
    }
}

/// What flipping a callback parameter does to its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParameterAction {
    #[default]
    Nothing,
    /// Gate the owning device's output patch.
    DeviceActive,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParameterKind {
    Bus { spec: ParameterSpec, value: f32 },
    Buffer { path: Option<String> },
    Callback { spec: ParameterSpec, value: f32, action: ParameterAction },
}

impl ParameterKind {
    pub fn bus(spec: ParameterSpec) -> Self {
        ParameterKind::Bus { spec, value: spec.default_value() }
    }

    pub fn callback(spec: ParameterSpec, action: ParameterAction) -> Self {
        ParameterKind::Callback { spec, value: spec.default_value(), action }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ParameterKind::Bus { .. } => "BusParameter",
            ParameterKind::Buffer { .. } => "BufferParameter",
            ParameterKind::Callback { .. } => "CallbackParameter",
        }
    }

    pub fn value(&self) -> Option<f32> {
        match self {
            ParameterKind::Bus { value, .. } | ParameterKind::Callback { value, .. } => Some(*value),
            ParameterKind::Buffer { .. } => None,
        }
    }

    pub fn is_bus(&self) -> bool {
        matches!(self, ParameterKind::Bus { .. })
    }
}

impl Application {
    /// A detached parameter node; the caller links it into a parameter group.
    pub(crate) fn create_parameter(&mut self, name: &str, kind: ParameterKind, is_builtin: bool) -> NodeId {
        let mut node = Node::new(NodeKind::Parameter(ParameterData { kind, is_builtin }));
        node.name = Some(name.to_string());
        self.insert_node(node)
    }

    /// Parameters of a track, rack or device, in order.
    pub fn parameters(&self, owner: NodeId) -> Vec<NodeId> {
        match self.get(owner).and_then(Node::parameter_group) {
            Some(group) => self.children(group).to_vec(),
            None => Vec::new(),
        }
    }

    pub fn parameter(&self, owner: NodeId, name: &str) -> Option<NodeId> {
        self.parameters(owner)
            .into_iter()
            .find(|p| self.node(*p).name.as_deref() == Some(name))
    }

    pub fn parameter_value(&self, id: NodeId) -> Option<f32> {
        self.get(id)?.as_parameter()?.kind.value()
    }

    /// Add a user parameter to `owner`. Names are unique per owner.
    pub async fn add_parameter(&mut self, owner: NodeId, name: &str, kind: ParameterKind) -> MixResult<NodeId> {
        let group = self
            .check(owner)?
            .parameter_group()
            .ok_or(MixError::WrongKind { node: owner, expected: "track, rack or device" })?;
        if self.parameter(owner, name).is_some() {
            return Err(MixError::DuplicateParameter { owner, name: name.to_string() });
        }
        let id = self.create_parameter(name, kind, false);
        let len = self.children(group).len();
        self.transact(&[owner], None, |app| {
            app.splice(group, len..len, &[id])?;
            app.map_into_owner(id);
            Ok(())
        })
        .await?;
        Ok(id)
    }

    /// Point the owner's running synth at a bus parameter added after the
    /// synth was created.
    fn map_into_owner(&self, id: NodeId) {
        let Some(owner) = self.parameter_owner(id) else {
            return;
        };
        let param = self.node(id);
        let (Some(name), Some(bus)) = (param.name.as_deref(), param.resources.control_buses.get("bus").copied()) else {
            return;
        };
        let owner = self.node(owner);
        if let (Some(provider), Some(synth)) = (owner.provider.as_ref(), owner.resources.nodes.get("synth").copied()) {
            provider.set_node(synth, &[(name, Control::Bus(bus))]);
        }
    }

    /// Remove user parameters; builtins are refused.
    pub async fn remove_parameters(&mut self, ids: &[NodeId]) -> MixResult {
        for &id in ids {
            let param = self
                .check(id)?
                .as_parameter()
                .ok_or(MixError::WrongKind { node: id, expected: "parameter" })?;
            if param.is_builtin {
                return Err(MixError::WrongKind { node: id, expected: "user parameter" });
            }
        }
        self.transact(ids, None, |app| app.remove_children(ids)).await
    }

    pub async fn set_parameter(&mut self, id: NodeId, value: f32, at: Option<f64>) -> MixResult {
        self.check(id)?;
        self.transact(&[id], at, |app| app.apply_parameter_value(id, value)).await
    }

    /// Clamp, store and push a parameter value. Unchanged values are dropped
    /// before any remote call.
    pub(crate) fn apply_parameter_value(&mut self, id: NodeId, value: f32) -> MixResult {
        let node = self.node_mut(id);
        let bus = node.resources.control_buses.get("bus").copied();
        let ramp = node.resources.nodes.remove("ramp");
        let provider = node.provider.clone();
        let param = node
            .as_parameter_mut()
            .ok_or(MixError::WrongKind { node: id, expected: "parameter" })?;
        let triggered = match &mut param.kind {
            ParameterKind::Bus { spec, value: current } => {
                let clamped = spec.clamp(value);
                if clamped == *current && ramp.is_none() {
                    return Ok(());
                }
                *current = clamped;
                if let (Some(provider), Some(bus)) = (provider, bus) {
                    if let Some(ramp) = ramp {
                        provider.free_node(ramp);
                    }
                    provider.set_bus(bus, clamped);
                }
                None
            }
            ParameterKind::Callback { spec, value: current, action } => {
                let clamped = spec.clamp(value);
                if clamped == *current {
                    return Ok(());
                }
                *current = clamped;
                Some((*action, clamped))
            }
            ParameterKind::Buffer { .. } => {
                return Err(MixError::WrongKind { node: id, expected: "bus or callback parameter" });
            }
        };
        match triggered {
            Some((action, value)) => self.run_parameter_action(id, action, value),
            None => Ok(()),
        }
    }

    fn run_parameter_action(&mut self, id: NodeId, action: ParameterAction, value: f32) -> MixResult {
        match action {
            ParameterAction::Nothing => Ok(()),
            ParameterAction::DeviceActive => match self.parameter_owner(id) {
                Some(owner) => {
                    self.set_device_active(owner, value != 0.0);
                    Ok(())
                }
                None => Ok(()),
            },
        }
    }

    /// Ramp a bus parameter from `start` to `stop` over `seconds` on the server.
    /// Unallocated parameters jump straight to `stop`.
    pub async fn ramp_parameter(&mut self, id: NodeId, start: f32, stop: f32, seconds: f32, at: Option<f64>) -> MixResult {
        self.check(id)?;
        self.transact(&[id], at, |app| {
            let node = app.node_mut(id);
            let group = node.remote_node();
            let bus = node.resources.control_buses.get("bus").copied();
            let old_ramp = node.resources.nodes.remove("ramp");
            let provider = node.provider.clone();
            let Some(ParameterKind::Bus { spec, value }) = node.as_parameter_mut().map(|p| &mut p.kind) else {
                return Err(MixError::WrongKind { node: id, expected: "bus parameter" });
            };
            let (start, stop) = (spec.clamp(start), spec.clamp(stop));
            *value = stop;
            let (Some(provider), Some(group), Some(bus)) = (provider, group, bus) else {
                return Ok(());
            };
            if let Some(old) = old_ramp {
                provider.free_node(old);
            }
            let ramp = provider.add_synth(
                RAMP_SYNTHDEF,
                group,
                mixgraph_types::AddAction::AddToHead,
                &[
                    ("out", Control::Int(bus.index)),
                    ("start_value", Control::Float(start)),
                    ("stop_value", Control::Float(stop)),
                    ("total_time", Control::Float(seconds.max(0.0))),
                ],
                Some("ramp"),
            );
            app.node_mut(id).resources.nodes.insert("ramp", ramp);
            Ok(())
        })
        .await
    }

    pub async fn set_buffer_path(&mut self, id: NodeId, path: Option<String>) -> MixResult {
        self.check(id)?;
        self.transact(&[id], None, |app| app.apply_buffer_path(id, path)).await
    }

    pub(crate) fn apply_buffer_path(&mut self, id: NodeId, path: Option<String>) -> MixResult {
        let node = self.node_mut(id);
        let provider = node.provider.clone();
        let Some(ParameterKind::Buffer { path: current }) = node.as_parameter_mut().map(|p| &mut p.kind) else {
            return Err(MixError::WrongKind { node: id, expected: "buffer parameter" });
        };
        if *current == path {
            return Ok(());
        }
        *current = path.clone();
        let Some(provider) = provider else {
            return Ok(());
        };
        if let Some(old) = self.node_mut(id).resources.buffers.remove("buffer") {
            provider.free_buffer(old);
        }
        if let Some(path) = path {
            let buffer = provider.add_buffer(&path)?;
            self.node_mut(id).resources.buffers.insert("buffer", buffer);
        }
        Ok(())
    }

    /// Create control buses for an owner's bus parameters so the owner's
    /// synths can map them when they are created.
    pub(crate) fn preallocate_parameters(&mut self, owner: NodeId, provider: &Arc<Provider>) -> MixResult {
        for param in self.parameters(owner) {
            self.ensure_parameter_bus(param, provider)?;
        }
        Ok(())
    }

    fn ensure_parameter_bus(&mut self, param: NodeId, provider: &Arc<Provider>) -> MixResult<Option<BusGroup>> {
        let node = self.node_mut(param);
        let Some(ParameterKind::Bus { value, .. }) = node.as_parameter().map(|p| &p.kind) else {
            return Ok(None);
        };
        if let Some(bus) = node.resources.control_buses.get("bus") {
            return Ok(Some(*bus));
        }
        let value = *value;
        let bus = provider.add_bus()?;
        provider.set_bus(bus, value);
        node.resources.control_buses.insert("bus", bus);
        Ok(Some(bus))
    }

    pub(crate) fn allocate_parameter(&mut self, id: NodeId, provider: &Arc<Provider>, anchor: Anchor) -> MixResult {
        let kind = match self.node(id).as_parameter() {
            Some(param) => param.kind.clone(),
            None => return Ok(()),
        };
        match kind {
            ParameterKind::Bus { .. } => {
                self.ensure_parameter_bus(id, provider)?;
                let group = provider.add_group(anchor.target, anchor.action, Some("parameter"));
                self.node_mut(id).resources.nodes.insert("node", group);
            }
            ParameterKind::Buffer { path: Some(path) } => {
                let buffer = provider.add_buffer(&path)?;
                self.node_mut(id).resources.buffers.insert("buffer", buffer);
            }
            ParameterKind::Buffer { path: None } | ParameterKind::Callback { .. } => {}
        }
        Ok(())
    }

    /// Synth controls mapping each allocated bus parameter of `owner` by name.
    pub(crate) fn parameter_controls(&self, owner: NodeId) -> Vec<(String, Control)> {
        self.parameters(owner)
            .into_iter()
            .filter_map(|p| {
                let node = self.node(p);
                let bus = node.resources.control_buses.get("bus")?;
                Some((node.name.clone()?, Control::Bus(*bus)))
            })
            .collect()
    }

    /// Whether a parameter group needs its own remote group.
    pub(crate) fn parameter_group_has_bus(&self, group: NodeId) -> bool {
        self.children(group)
            .iter()
            .any(|p| self.node(*p).as_parameter().is_some_and(|param| param.kind.is_bus()))
    }
}

/// Borrow a `(String, Control)` list as the slice shape the provider takes.
pub(crate) fn as_controls(controls: &[(String, Control)]) -> Vec<(&str, Control)> {
    controls.iter().map(|(name, value)| (name.as_str(), value.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_spec_orders_bounds_and_clamps() {
        let spec = ParameterSpec::float(10.0, 6.0, -96.0);
        assert_eq!(spec, ParameterSpec::Float { default: 6.0, minimum: -96.0, maximum: 6.0 });
        assert_eq!(spec.clamp(-200.0), -96.0);
        assert_eq!(spec.clamp(0.5), 0.5);
    }

    #[test]
    fn integer_and_boolean_clamping() {
        let spec = ParameterSpec::integer(0, 0, 10);
        assert_eq!(spec.clamp(3.6), 4.0);
        assert_eq!(spec.clamp(42.0), 10.0);
        let flag = ParameterSpec::boolean(true);
        assert_eq!(flag.default_value(), 1.0);
        assert_eq!(flag.clamp(0.2), 1.0);
        assert_eq!(flag.clamp(0.0), 0.0);
        assert_eq!(ParameterSpec::Null.clamp(5.0), 0.0);
    }

    #[test]
    fn spec_serializes_with_type_tag() {
        let json = serde_json::to_string(&ParameterSpec::boolean(false)).unwrap();
        assert_eq!(json, r#"{"type":"boolean","default":false}"#);
        let back: ParameterSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ParameterSpec::boolean(false));
    }

    #[test]
    fn kinds_report_labels_and_values() {
        let bus = ParameterKind::bus(ParameterSpec::float(0.0, -96.0, 6.0));
        assert_eq!(bus.label(), "BusParameter");
        assert_eq!(bus.value(), Some(0.0));
        assert!(bus.is_bus());
        let buffer = ParameterKind::Buffer { path: None };
        assert_eq!(buffer.label(), "BufferParameter");
        assert_eq!(buffer.value(), None);
    }
}
