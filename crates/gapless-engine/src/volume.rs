//! Output volume composition.
//!
//! The applied volume is a pure function of two independent inputs:
//! - a per-track replay gain (linear, optionally unset)
//! - a ducking factor in `[0, 1]` chosen by an external audio-focus policy
//!
//! `effective = (replay_gain or 1.0) * ducking`, applied to both stereo channels.

/// Composes replay gain and ducking into one linear gain.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VolumeComposer {
    replay_gain: Option<f32>,
    ducking: f32,
}

impl Default for VolumeComposer {
    fn default() -> Self {
        Self {
            replay_gain: None,
            ducking: 1.0,
        }
    }
}

impl VolumeComposer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-track replay gain. NaN, infinities and negative values mean "unset".
    pub fn set_replay_gain(&mut self, gain: f32) {
        self.replay_gain = if gain.is_finite() && gain >= 0.0 {
            Some(gain)
        } else {
            None
        };
    }

    /// Set the ducking factor, clamped to `[0, 1]`.
    ///
    /// Returns `false` (and keeps the previous factor) for non-finite input.
    pub fn set_ducking(&mut self, factor: f32) -> bool {
        if !factor.is_finite() {
            tracing::warn!(factor, "ignoring non-finite ducking factor");
            return false;
        }
        self.ducking = factor.clamp(0.0, 1.0);
        true
    }

    pub fn replay_gain(&self) -> Option<f32> {
        self.replay_gain
    }

    pub fn ducking(&self) -> f32 {
        self.ducking
    }

    /// Linear gain to apply to both channels.
    pub fn effective(&self) -> f32 {
        self.replay_gain.unwrap_or(1.0) * self.ducking
    }
}

/// Convert a ReplayGain adjustment in dB to a linear factor.
pub fn replay_gain_from_db(db: f32) -> f32 {
    10.0_f32.powf(db / 20.0)
}
