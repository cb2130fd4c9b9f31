mod common;

use async_std::task::block_on;
use mixgraph_core::{DeviceKind, MixError, ParameterKind, ParameterSpec};

fn cutoff() -> ParameterKind {
    ParameterKind::bus(ParameterSpec::float(1000.0, 20.0, 20000.0))
}

#[test]
fn bus_parameters_map_into_a_running_effect() {
    let (mut app, context, transport) = common::booted();
    let track = block_on(app.add_track(context, None)).unwrap();
    let fx = DeviceKind::AudioEffect { synthdef: "fx/eq".into() };
    let device = block_on(app.add_device(track, fx, None)).unwrap();
    transport.clear();

    let param = block_on(app.add_parameter(device, "cutoff", cutoff())).unwrap();
    assert_eq!(transport.bundles().len(), 1);

    let owner = &app.get(device).unwrap().resources;
    let resources = &app.get(param).unwrap().resources;
    let bus = resources.control_buses["bus"];
    let expected = format!("/n_set {} cutoff c{}", owner.nodes["synth"].id, bus.index);
    assert!(transport.bundles()[0].rendered().contains(&expected));

    let tree = transport.tree();
    let group = tree.find(owner.nodes["node"].id).unwrap();
    assert_eq!(group.as_group().unwrap().child_ids()[0], resources.nodes["node"].id);
    assert!(transport.errors().is_empty());
}

#[test]
fn parameter_names_are_unique_per_owner() {
    let (mut app, context, transport) = common::booted();
    let track = block_on(app.add_track(context, None)).unwrap();
    block_on(app.add_parameter(track, "cutoff", cutoff())).unwrap();
    transport.clear();

    let err = block_on(app.add_parameter(track, "cutoff", cutoff()));
    assert!(matches!(err, Err(MixError::DuplicateParameter { owner, ref name }) if owner == track && name == "cutoff"));
    let err = block_on(app.add_parameter(track, "gain", cutoff()));
    assert!(matches!(err, Err(MixError::DuplicateParameter { .. })));
    assert!(transport.bundles().is_empty());
    assert_eq!(app.parameters(track).len(), 3);
}
