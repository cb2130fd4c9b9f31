//! Note flow through tracks, racks and devices.
//!
//! A performer has an input stage and an output stage. Input records and
//! tracks held notes, then hands the messages on: a track or chain to its
//! first device, a rack to each of its chains, an instrument to its voices.
//! Output drops repeated note-ons and stray note-offs, then passes on to the
//! next device in the chain or, after the last, to the owner's output.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use mixgraph_audio::Control;
use mixgraph_types::{midi_note_to_frequency, velocity_to_amplitude, AddAction, MidiMessage, NodeId};

use crate::application::Application;
use crate::error::{MixError, MixResult};
use crate::node::{CaptureEntry, CaptureLabel, CaptureLog, DeviceData, DeviceKind, GroupRole, NodeKind, NoteState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Input(NodeId),
    Output(NodeId),
}

type Hop = (Stage, Vec<MidiMessage>);

/// Transcript of the messages seen by one performer. Recording stops when
/// the handle is dropped.
pub struct Capture {
    log: CaptureLog,
}

impl Capture {
    pub fn entries(&self) -> Vec<CaptureEntry> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn len(&self) -> usize {
        self.log.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.log.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

fn track_notes(notes: &mut std::collections::BTreeSet<u8>, message: &MidiMessage) {
    match *message {
        MidiMessage::NoteOn { pitch, .. } => {
            notes.insert(pitch);
        }
        MidiMessage::NoteOff { pitch, .. } => {
            notes.remove(&pitch);
        }
        MidiMessage::ControlChange { .. } => {}
    }
}

impl Application {
    fn is_performer(&self, id: NodeId) -> bool {
        self.get(id).is_some_and(|n| n.is_track_like() || n.is_device_like())
    }

    fn notes_mut(&mut self, id: NodeId) -> Option<&mut NoteState> {
        match &mut self.node_mut(id).kind {
            NodeKind::Track(track) => Some(&mut track.notes),
            NodeKind::Rack(rack) => Some(&mut rack.notes),
            NodeKind::Device(device) => Some(&mut device.notes),
            _ => None,
        }
    }

    /// Pitches currently held at `id`'s input.
    pub fn held_notes(&self, id: NodeId) -> Vec<u8> {
        let notes = match self.get(id).map(|n| &n.kind) {
            Some(NodeKind::Track(track)) => &track.notes,
            Some(NodeKind::Rack(rack)) => &rack.notes,
            Some(NodeKind::Device(device)) => &device.notes,
            _ => return Vec::new(),
        };
        notes.input.iter().copied().collect()
    }

    /// Start recording what `id` receives and emits.
    pub fn capture(&mut self, id: NodeId) -> MixResult<Capture> {
        if !self.is_performer(id) {
            return Err(MixError::WrongKind { node: id, expected: "track, rack or device" });
        }
        let log: CaptureLog = Arc::new(Mutex::new(Vec::new()));
        self.node_mut(id).captures.push(Arc::downgrade(&log));
        Ok(Capture { log })
    }

    /// Feed `messages` into `id`'s input. Voices started or stopped along
    /// the way ride one bundle, stamped `at` seconds ahead.
    pub async fn perform(&mut self, id: NodeId, messages: &[MidiMessage], at: Option<f64>) -> MixResult {
        self.check(id)?;
        if !self.is_performer(id) {
            return Err(MixError::WrongKind { node: id, expected: "track, rack or device" });
        }
        log::debug!(target: "mixgraph::nodes", "perform {} message(s) on {}", messages.len(), self.node(id).label());
        let messages = messages.to_vec();
        self.transact(&[id], at, |app| {
            app.perform_loop(id, messages, at);
            Ok(())
        })
        .await
    }

    pub(crate) fn perform_loop(&mut self, id: NodeId, messages: Vec<MidiMessage>, moment: Option<f64>) {
        let mut queue: VecDeque<Hop> = VecDeque::from([(Stage::Input(id), messages)]);
        while let Some((stage, messages)) = queue.pop_front() {
            let hops = match stage {
                Stage::Input(id) => self.perform_input(id, messages, moment),
                Stage::Output(id) => self.perform_output(id, messages, moment),
            };
            queue.extend(hops.into_iter().filter(|(_, m)| !m.is_empty()));
        }
    }

    fn record(&mut self, id: NodeId, label: CaptureLabel, message: MidiMessage, moment: Option<f64>) {
        let node = self.node_mut(id);
        if !node.captures.is_empty() {
            node.record(CaptureEntry { moment, label, message });
        }
    }

    fn perform_input(&mut self, id: NodeId, messages: Vec<MidiMessage>, moment: Option<f64>) -> Vec<Hop> {
        for message in &messages {
            self.record(id, CaptureLabel::Input, *message, moment);
            if let Some(notes) = self.notes_mut(id) {
                track_notes(&mut notes.input, message);
            }
        }
        match &self.node(id).kind {
            NodeKind::Track(track) => {
                let transfer = track.transfer;
                let next = match self.children(track.devices).first() {
                    Some(device) => Stage::Input(*device),
                    None => Stage::Output(id),
                };
                let messages = messages.into_iter().filter_map(|m| transfer.apply(m)).collect();
                vec![(next, messages)]
            }
            NodeKind::Rack(rack) => {
                let chains = self.children(rack.chains).to_vec();
                if chains.is_empty() {
                    return vec![(Stage::Output(id), messages)];
                }
                messages
                    .into_iter()
                    .flat_map(|m| chains.iter().map(move |c| (Stage::Input(*c), vec![m])))
                    .collect()
            }
            NodeKind::Device(DeviceData { kind: DeviceKind::Instrument { .. }, .. }) => {
                for message in messages {
                    self.play_voice(id, message);
                }
                Vec::new()
            }
            _ => vec![(Stage::Output(id), messages)],
        }
    }

    /// Start or stop the voice for a note. A repeated note-on restarts it.
    fn play_voice(&mut self, id: NodeId, message: MidiMessage) {
        let node = self.node(id);
        let (Some(pitch), NodeKind::Device(device)) = (message.pitch(), &node.kind) else {
            return;
        };
        let synthdef = device.kind.synthdef().to_string();
        let provider = node.provider.clone();
        let body = node.resources.nodes.get("body").copied();
        let output = node.resources.audio_buses.get("output").copied();
        let old = match &mut self.node_mut(id).kind {
            NodeKind::Device(device) => device.voices.remove(&pitch),
            _ => None,
        };
        let Some(provider) = provider else {
            return;
        };
        if let Some(voice) = old {
            provider.free_node(voice);
        }
        let (MidiMessage::NoteOn { velocity, .. }, Some(body), Some(output)) = (message, body, output) else {
            return;
        };
        let controls = [
            ("frequency", Control::Float(midi_note_to_frequency(pitch))),
            ("amplitude", Control::Float(velocity_to_amplitude(velocity))),
            ("out", Control::Bus(output)),
        ];
        let voice = provider.add_synth(&synthdef, body, AddAction::AddToHead, &controls, Some("voice"));
        if let NodeKind::Device(device) = &mut self.node_mut(id).kind {
            device.voices.insert(pitch, voice);
        }
    }

    fn perform_output(&mut self, id: NodeId, messages: Vec<MidiMessage>, moment: Option<f64>) -> Vec<Hop> {
        let next = self.next_stage(id);
        let mut passed = Vec::new();
        for message in messages {
            self.record(id, CaptureLabel::Output, message, moment);
            let Some(notes) = self.notes_mut(id) else {
                continue;
            };
            let keep = match message {
                MidiMessage::NoteOn { pitch, .. } => notes.output.insert(pitch),
                MidiMessage::NoteOff { pitch, .. } => notes.output.remove(&pitch),
                MidiMessage::ControlChange { .. } => true,
            };
            if keep {
                passed.push(message);
            }
        }
        match next {
            Some(stage) => vec![(stage, passed)],
            None => Vec::new(),
        }
    }

    /// Where `id`'s output goes: the next device in its chain, else the
    /// output of the track, chain or rack that encloses it.
    fn next_stage(&self, id: NodeId) -> Option<Stage> {
        let parent = self.node(id).parent?;
        if matches!(self.node(parent).kind, NodeKind::Group(GroupRole::Devices)) {
            let siblings = self.children(parent);
            let index = self.index_of(id)?;
            if let Some(next) = siblings.get(index + 1) {
                return Some(Stage::Input(*next));
            }
        }
        let owner = self
            .parentage(id)
            .into_iter()
            .skip(1)
            .find(|n| matches!(self.node(*n).kind, NodeKind::Track(_) | NodeKind::Rack(_)))?;
        let is_chain_in_rack = matches!(self.node(owner).kind, NodeKind::Rack(_));
        let is_device = self.node(id).is_device_like();
        (is_device || is_chain_in_rack).then_some(Stage::Output(owner))
    }
}
