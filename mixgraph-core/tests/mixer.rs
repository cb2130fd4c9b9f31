mod common;

use async_std::task::block_on;
use mixgraph_core::{Endpoint, MixError, SendPosition};

#[test]
fn muting_is_one_bundle_and_idempotent() {
    let (mut app, context, transport) = common::booted();
    let a = block_on(app.add_track(context, Some("a"))).unwrap();
    let b = block_on(app.add_track(context, Some("b"))).unwrap();
    transport.clear();

    block_on(app.mute(a)).unwrap();
    assert_eq!(transport.bundles().len(), 1);
    assert_eq!(common::addresses(&transport), vec!["/n_set".to_string()]);
    assert!(!app.is_active(a));
    assert!(app.is_active(b));

    block_on(app.mute(a)).unwrap();
    assert_eq!(transport.bundles().len(), 1);

    block_on(app.unmute(a)).unwrap();
    assert_eq!(transport.bundles().len(), 2);
    assert!(app.is_active(a));
    assert!(transport.errors().is_empty());
}

#[test]
fn rack_solos_follow_the_chain_set() {
    let (mut app, context, transport) = common::booted();
    let track = block_on(app.add_track(context, None)).unwrap();
    let rack = block_on(app.add_rack(track, None)).unwrap();
    let chains: Vec<_> = (0..4).map(|_| block_on(app.add_chain(rack, None)).unwrap()).collect();
    let active = |app: &mixgraph_core::Application| chains.iter().map(|c| app.is_active(*c)).collect::<Vec<_>>();

    block_on(app.solo(chains[0], true)).unwrap();
    assert_eq!(active(&app), vec![true, false, false, false]);

    block_on(app.solo(chains[1], false)).unwrap();
    assert_eq!(active(&app), vec![true, true, false, false]);

    block_on(app.solo(chains[2], true)).unwrap();
    assert_eq!(active(&app), vec![false, false, true, false]);

    block_on(app.solo(chains[3], false)).unwrap();
    assert_eq!(active(&app), vec![false, false, true, true]);

    block_on(app.mute(chains[2])).unwrap();
    assert_eq!(active(&app), vec![false, false, false, true]);

    block_on(app.unsolo(chains[2], false)).unwrap();
    assert_eq!(active(&app), vec![true, true, false, true]);
    assert!(transport.errors().is_empty());
}

#[test]
fn repeated_solos_send_nothing() {
    let (mut app, context, transport) = common::booted();
    let a = block_on(app.add_track(context, None)).unwrap();
    let b = block_on(app.add_track(context, None)).unwrap();
    transport.clear();

    block_on(app.solo(a, false)).unwrap();
    assert_eq!(transport.bundles().len(), 1);
    assert!(!app.is_active(b));
    block_on(app.solo(a, false)).unwrap();
    block_on(app.solo(a, true)).unwrap();
    assert_eq!(transport.bundles().len(), 1);

    block_on(app.unsolo(a, false)).unwrap();
    assert_eq!(transport.bundles().len(), 2);
    assert!(app.is_active(b));
    block_on(app.unsolo(a, false)).unwrap();
    assert_eq!(transport.bundles().len(), 2);
}

#[test]
fn muting_one_of_two_soloed_peers_touches_only_its_output() {
    let (mut app, context, transport) = common::booted();
    let a = block_on(app.add_track(context, Some("a"))).unwrap();
    let b = block_on(app.add_track(context, Some("b"))).unwrap();
    block_on(app.add_send(a, Endpoint::Node(b), SendPosition::Postfader)).unwrap();
    block_on(app.add_send(b, Endpoint::Node(a), SendPosition::Postfader)).unwrap();
    block_on(app.solo(a, false)).unwrap();
    block_on(app.solo(b, false)).unwrap();
    let output = app.get(a).unwrap().resources.nodes["output"].id;
    transport.clear();

    block_on(app.mute(a)).unwrap();
    let bundles = transport.bundles();
    assert_eq!(bundles.len(), 1);
    assert_eq!(bundles[0].rendered(), vec![format!("/n_set {} active 0", output)]);
    assert!(!app.is_active(a));
    assert!(app.is_active(b));

    block_on(app.mute(a)).unwrap();
    assert_eq!(transport.bundles().len(), 1);
    block_on(app.unmute(a)).unwrap();
    assert_eq!(transport.bundles()[1].rendered(), vec![format!("/n_set {} active 1", output)]);
    block_on(app.unmute(a)).unwrap();
    assert_eq!(transport.bundles().len(), 2);
    assert!(transport.errors().is_empty());
}

#[test]
fn unchanged_parameter_values_send_nothing() {
    let (mut app, context, transport) = common::booted();
    let track = block_on(app.add_track(context, None)).unwrap();
    let gain = app.parameter(track, "gain").unwrap();
    let current = app.parameter_value(gain).unwrap();
    transport.clear();

    block_on(app.set_parameter(gain, current, None)).unwrap();
    assert!(transport.bundles().is_empty());

    block_on(app.set_parameter(gain, -3.0, None)).unwrap();
    assert_eq!(common::addresses(&transport), vec!["/c_set".to_string()]);
    block_on(app.set_parameter(gain, -3.0, None)).unwrap();
    assert_eq!(transport.bundles().len(), 1);
}

#[test]
fn masters_cannot_be_muted() {
    let (mut app, context, transport) = common::booted();
    let master = app.master_track(context).unwrap();
    assert!(matches!(block_on(app.mute(master)), Err(MixError::WrongKind { .. })));
    assert!(transport.bundles().is_empty());
}
