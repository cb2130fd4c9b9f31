use serde::{Deserialize, Serialize};

/// Inbound or outbound note/controller event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MidiMessage {
    NoteOn { pitch: u8, velocity: u8, channel: Option<u8> },
    NoteOff { pitch: u8, velocity: u8, channel: Option<u8> },
    ControlChange { controller: u8, value: u8, channel: Option<u8> },
}

impl MidiMessage {
    pub fn note_on(pitch: u8, velocity: u8) -> Self {
        MidiMessage::NoteOn { pitch, velocity, channel: None }
    }

    pub fn note_off(pitch: u8) -> Self {
        MidiMessage::NoteOff { pitch, velocity: 0, channel: None }
    }

    pub fn control_change(controller: u8, value: u8) -> Self {
        MidiMessage::ControlChange { controller, value, channel: None }
    }

    /// Pitch of a note message; `None` for controller messages.
    pub fn pitch(&self) -> Option<u8> {
        match self {
            MidiMessage::NoteOn { pitch, .. } | MidiMessage::NoteOff { pitch, .. } => Some(*pitch),
            MidiMessage::ControlChange { .. } => None,
        }
    }

    /// Copy of a note message with a new pitch. Controller messages come back unchanged.
    pub fn with_pitch(self, new_pitch: u8) -> Self {
        match self {
            MidiMessage::NoteOn { velocity, channel, .. } => {
                MidiMessage::NoteOn { pitch: new_pitch, velocity, channel }
            }
            MidiMessage::NoteOff { velocity, channel, .. } => {
                MidiMessage::NoteOff { pitch: new_pitch, velocity, channel }
            }
            other => other,
        }
    }

    pub fn is_note_on(&self) -> bool {
        matches!(self, MidiMessage::NoteOn { .. })
    }

    pub fn is_note_off(&self) -> bool {
        matches!(self, MidiMessage::NoteOff { .. })
    }
}

/// Equal-tempered frequency for a MIDI note number (A4 = 69 = 440 Hz).
pub fn midi_note_to_frequency(pitch: u8) -> f32 {
    440.0 * 2f32.powf((pitch as f32 - 69.0) / 12.0)
}

/// Linear amplitude for a MIDI velocity, mapped over a 36 dB range.
pub fn velocity_to_amplitude(velocity: u8) -> f32 {
    if velocity == 0 {
        return 0.0;
    }
    let db = -36.0 * (1.0 - velocity.min(127) as f32 / 127.0);
    10f32.powf(db / 20.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a4_is_440() {
        assert!((midi_note_to_frequency(69) - 440.0).abs() < 1e-3);
        assert!((midi_note_to_frequency(81) - 880.0).abs() < 1e-2);
    }

    #[test]
    fn full_velocity_is_unity() {
        assert!((velocity_to_amplitude(127) - 1.0).abs() < 1e-6);
        assert_eq!(velocity_to_amplitude(0), 0.0);
    }

    #[test]
    fn with_pitch_keeps_velocity() {
        let msg = MidiMessage::note_on(60, 100).with_pitch(64);
        assert_eq!(msg, MidiMessage::note_on(64, 100));
        let cc = MidiMessage::control_change(1, 2);
        assert_eq!(cc.with_pitch(10), cc);
    }

    #[test]
    fn serializes_with_kind_tag() {
        let json = serde_json::to_value(MidiMessage::note_off(60)).unwrap();
        assert_eq!(json["kind"], "note_off");
        assert_eq!(json["pitch"], 60);
    }
}
