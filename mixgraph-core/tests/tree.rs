mod common;

use std::collections::BTreeSet;
use std::sync::Arc;

use async_std::task::block_on;
use mixgraph_audio::{Provider, ServerOptions, SharedTestTransport, TestTransport};
use mixgraph_core::{Application, DeviceKind, Document, Endpoint, MixError, SendPosition};
use mixgraph_types::{MidiMessage, NodeId};

/// Every audio bus below `top` carries its owner's effective channel count.
fn assert_bus_widths(app: &Application, top: NodeId) {
    let mut checked = 0;
    for id in app.subtree(top) {
        let expected = app.effective_channel_count(id);
        for (role, bus) in &app.get(id).unwrap().resources.audio_buses {
            assert_eq!(bus.channel_count, expected, "{} bus of {}", role, id);
            checked += 1;
        }
    }
    assert!(checked > 0);
}

#[test]
fn moving_a_track_flushes_one_bundle() {
    let (mut app, context, transport) = common::booted();
    let a = block_on(app.add_track(context, Some("a"))).unwrap();
    let b = block_on(app.add_track(context, Some("b"))).unwrap();
    transport.clear();

    block_on(app.move_to(b, context, 0)).unwrap();
    assert_eq!(app.tracks(context), vec![b, a]);
    assert_eq!(transport.bundles().len(), 1);
    assert!(transport.errors().is_empty());
}

#[test]
fn moving_a_chain_rebuilds_its_patches_in_one_bundle() {
    let (mut app, context, transport) = common::booted();
    let track = block_on(app.add_track(context, None)).unwrap();
    let rack = block_on(app.add_rack(track, None)).unwrap();
    let one = block_on(app.add_chain(rack, Some("one"))).unwrap();
    let two = block_on(app.add_chain(rack, Some("two"))).unwrap();
    let sends = [
        block_on(app.add_send(one, Endpoint::Node(two), SendPosition::Postfader)).unwrap(),
        block_on(app.add_send(two, Endpoint::Node(one), SendPosition::Postfader)).unwrap(),
    ];
    let old: BTreeSet<String> = sends
        .iter()
        .map(|s| format!("/n_set {} gate 0", app.get(*s).unwrap().resources.nodes["synth"].id))
        .collect();
    transport.clear();

    block_on(app.move_to(two, rack, 0)).unwrap();
    assert_eq!(app.chains(rack), vec![two, one]);
    let bundles = transport.bundles();
    assert_eq!(bundles.len(), 1);
    assert_eq!(bundles[0].addresses(), vec!["/g_head", "/s_new", "/s_new", "/n_set", "/n_set"]);
    let rendered = bundles[0].rendered();
    assert!(rendered[1].contains("mixer/patch[gain]/2x2"));
    assert!(rendered[2].contains("mixer/patch[fb,gain]/2x2"));
    assert_eq!(rendered[3..].iter().cloned().collect::<BTreeSet<_>>(), old);
    assert!(transport.errors().is_empty());
}

#[test]
fn cycles_are_rejected_before_anything_is_sent() {
    let (mut app, context, transport) = common::booted();
    let outer = block_on(app.add_track(context, None)).unwrap();
    let inner = block_on(app.add_track(outer, None)).unwrap();
    transport.clear();

    let err = block_on(app.move_to(outer, inner, 0));
    assert!(matches!(err, Err(MixError::Cycle { .. })));
    assert!(transport.bundles().is_empty());
    assert_eq!(app.tracks(outer), vec![inner]);
}

#[test]
fn channel_counts_inherit_down_the_tree() {
    let (mut app, context, transport) = common::booted();
    let track = block_on(app.add_track(context, None)).unwrap();
    let sub = block_on(app.add_track(track, None)).unwrap();
    assert_eq!(app.effective_channel_count(sub), 2);

    block_on(app.set_channel_count(context, Some(4))).unwrap();
    assert_eq!(app.effective_channel_count(sub), 4);

    block_on(app.set_channel_count(track, Some(1))).unwrap();
    assert_eq!(app.effective_channel_count(sub), 1);
    assert_eq!(app.effective_channel_count(context), 4);

    block_on(app.set_application_channel_count(8)).unwrap();
    assert_eq!(app.effective_channel_count(context), 4);
    assert_bus_widths(&app, context);
    assert!(matches!(
        block_on(app.set_channel_count(track, Some(9))),
        Err(MixError::InvalidChannelCount(9))
    ));
    assert!(transport.errors().is_empty());
}

#[test]
fn channel_count_changes_reallocate_buses() {
    let (mut app, context, transport) = common::booted();
    let track = block_on(app.add_track(context, None)).unwrap();
    let sub = block_on(app.add_track(track, None)).unwrap();
    let rack = block_on(app.add_rack(sub, None)).unwrap();
    let chain = block_on(app.add_chain(rack, None)).unwrap();
    let fx = DeviceKind::AudioEffect { synthdef: "fx/eq".into() };
    block_on(app.add_device(chain, fx, None)).unwrap();
    assert_bus_widths(&app, context);

    block_on(app.set_channel_count(context, Some(4))).unwrap();
    assert_eq!(app.effective_channel_count(chain), 4);
    assert_bus_widths(&app, context);

    block_on(app.set_channel_count(track, Some(3))).unwrap();
    assert_eq!(app.effective_channel_count(chain), 3);
    assert_bus_widths(&app, context);

    block_on(app.set_channel_count(track, None)).unwrap();
    assert_eq!(app.effective_channel_count(chain), 4);
    assert_bus_widths(&app, context);
    assert!(transport.errors().is_empty());
}

#[test]
fn instruments_sound_while_notes_are_held() {
    let (mut app, context, transport) = common::booted();
    let track = block_on(app.add_track(context, None)).unwrap();
    let synth = DeviceKind::Instrument { synthdef: "default".into() };
    let instrument = block_on(app.add_device(track, synth, None)).unwrap();
    transport.clear();

    block_on(app.perform(track, &[MidiMessage::note_on(60, 100)], None)).unwrap();
    assert_eq!(transport.count(|m| m.addr == "/s_new"), 1);
    assert_eq!(app.held_notes(instrument), vec![60]);

    block_on(app.perform(track, &[MidiMessage::note_off(60)], None)).unwrap();
    assert!(app.held_notes(instrument).is_empty());
    assert!(transport.errors().is_empty());
}

#[test]
fn saved_sessions_boot_again() {
    let (mut app, context, _) = common::booted();
    let a = block_on(app.add_track(context, Some("a"))).unwrap();
    let b = block_on(app.add_track(context, Some("b"))).unwrap();
    block_on(app.add_send(a, Endpoint::Node(b), SendPosition::Postfader)).unwrap();
    let rack = block_on(app.add_rack(b, None)).unwrap();
    block_on(app.add_chain(rack, None)).unwrap();
    block_on(app.mute(a)).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.json");
    app.serialize().save(&path).unwrap();

    let document = Document::load(&path).unwrap();
    let mut rebuilt = Application::deserialize(&document).unwrap();
    assert_eq!(rebuilt.serialize(), document);

    let transport = Arc::new(TestTransport::new());
    let provider = Provider::new(Arc::new(SharedTestTransport(transport.clone())), ServerOptions::default());
    block_on(rebuilt.boot_with(provider)).unwrap();
    assert!(transport.errors().is_empty());
    let context = rebuilt.contexts()[0];
    let tracks = rebuilt.tracks(context);
    assert!(!rebuilt.is_active(tracks[0]));
    assert!(rebuilt.is_active(tracks[1]));
}
