//! Names of the mixer synthdefs the domain instantiates.
//!
//! The server is expected to hold these definitions already; the names
//! encode everything that changes the compiled graph (flags and channel
//! counts), so a changed name means a new synth.

/// Feature flags of a patch-cable synth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PatchFlags {
    /// Read the input with feedback semantics (bus written later in the graph).
    pub feedback: bool,
    /// Scale by a `gain` control in dB.
    pub gain: bool,
    /// Hard-gate output on an `active` control.
    pub hard_gate: bool,
    /// Mix into the output bus instead of replacing it.
    pub mix_out: bool,
    /// Replace the output bus contents.
    pub replace_out: bool,
}

impl PatchFlags {
    pub fn feedback(mut self, on: bool) -> Self {
        self.feedback = on;
        self
    }
    pub fn gain(mut self) -> Self {
        self.gain = true;
        self
    }
    pub fn hard_gate(mut self) -> Self {
        self.hard_gate = true;
        self
    }
    pub fn mix_out(mut self) -> Self {
        self.mix_out = true;
        self
    }
    pub fn replace_out(mut self) -> Self {
        self.replace_out = true;
        self
    }
}

/// `mixer/patch[fb,gain]/2x2`
pub fn patch_synthdef(source_channels: u32, target_channels: u32, flags: PatchFlags) -> String {
    let mut tags = Vec::new();
    if flags.feedback {
        tags.push("fb");
    }
    if flags.gain {
        tags.push("gain");
    }
    if flags.hard_gate {
        tags.push("hard");
    }
    if flags.mix_out {
        tags.push("mix");
    }
    if flags.replace_out {
        tags.push("replace");
    }
    let tags = if tags.is_empty() {
        String::new()
    } else {
        format!("[{}]", tags.join(","))
    };
    format!("mixer/patch{}/{}x{}", tags, source_channels, target_channels)
}

/// Peak/RMS meter reporting on `/levels`.
pub fn levels_synthdef(channels: u32) -> String {
    format!("mixer/levels/{}", channels)
}

/// Linear control-bus ramp.
pub const RAMP_SYNTHDEF: &str = "mixer/ramp";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_names_encode_flags_in_order() {
        assert_eq!(patch_synthdef(2, 2, PatchFlags::default().gain()), "mixer/patch[gain]/2x2");
        assert_eq!(
            patch_synthdef(2, 2, PatchFlags::default().feedback(true).gain()),
            "mixer/patch[fb,gain]/2x2"
        );
        assert_eq!(
            patch_synthdef(1, 2, PatchFlags::default().hard_gate().mix_out()),
            "mixer/patch[hard,mix]/1x2"
        );
        assert_eq!(patch_synthdef(4, 4, PatchFlags::default()), "mixer/patch/4x4");
    }

    #[test]
    fn levels_name_carries_channel_count() {
        assert_eq!(levels_synthdef(8), "mixer/levels/8");
    }
}
