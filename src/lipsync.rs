//! Signal-to-animation mapping.
//!
//! [`LipSyncMapper::map`] is a pure function from the live [`Signal`] to a
//! [`MouthFrame`]. Silence always maps to the neutral frame, so resetting
//! the avatar is just mapping a silent signal once.

use crate::audio::analysis::Signal;
use crate::audio::fragment::PhonemeTiming;
use crate::config::AnimationConfig;
use crate::pipeline::utterance::SpeakerId;
use crate::viseme::{Viseme, viseme_at};
use tokio::sync::mpsc;

/// Mouth parameters for one animation tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MouthFrame {
    /// How far the mouth is open, `[0, 1]`.
    pub openness: f32,
    /// Mouth form, `[-1, 1]`: rounded below zero, spread above.
    pub form: f32,
}

impl MouthFrame {
    pub fn neutral(form_baseline: f32) -> Self {
        Self {
            openness: 0.0,
            form: form_baseline.clamp(-1.0, 1.0),
        }
    }
}

/// Deterministic mapping from signal (and optional phoneme timings) to a
/// mouth frame.
#[derive(Debug, Clone)]
pub struct LipSyncMapper {
    noise_floor: f32,
    sensitivity: f32,
    form_baseline: f32,
    use_phoneme_timings: bool,
}

impl LipSyncMapper {
    pub fn new(config: &AnimationConfig) -> Self {
        Self {
            noise_floor: config.noise_floor.max(0.0),
            sensitivity: config.sensitivity.max(f32::EPSILON),
            form_baseline: config.form_baseline.clamp(-1.0, 1.0),
            use_phoneme_timings: config.use_phoneme_timings,
        }
    }

    pub fn neutral(&self) -> MouthFrame {
        MouthFrame::neutral(self.form_baseline)
    }

    /// Map the signal, preferring phoneme timings for the fragment under
    /// the playhead when they are available and cover the playhead.
    pub fn map(&self, signal: &Signal, timings: Option<&[PhonemeTiming]>) -> MouthFrame {
        if signal.is_silent() {
            return self.neutral();
        }
        if self.use_phoneme_timings
            && let (Some(timings), Some(playhead)) = (timings, signal.playhead)
            && let Some(viseme) = viseme_at(timings, playhead.offset)
        {
            return self.viseme_frame(viseme);
        }
        self.amplitude_frame(signal)
    }

    /// Louder is more open; spectral brightness spreads the mouth.
    pub fn amplitude_frame(&self, signal: &Signal) -> MouthFrame {
        if signal.is_silent() {
            return self.neutral();
        }
        let level = (signal.rms - self.noise_floor).max(0.0);
        let openness = (level * self.sensitivity).clamp(0.0, 1.0);
        // Scaled by openness so a barely open mouth stays near baseline.
        let spread = (signal.brightness() * 2.0 - 1.0) * openness;
        MouthFrame {
            openness,
            form: (self.form_baseline + spread).clamp(-1.0, 1.0),
        }
    }

    pub fn viseme_frame(&self, viseme: Viseme) -> MouthFrame {
        let (openness, form) = viseme.mouth_shape();
        MouthFrame {
            openness,
            form: (self.form_baseline + form).clamp(-1.0, 1.0),
        }
    }
}

/// Exponential smoothing between ticks.
#[derive(Debug, Clone)]
pub struct MouthSmoother {
    factor: f32,
    last: Option<MouthFrame>,
}

impl MouthSmoother {
    /// `factor` is the weight kept from the previous frame.
    pub fn new(factor: f32) -> Self {
        Self {
            factor: factor.clamp(0.0, 0.95),
            last: None,
        }
    }

    pub fn apply(&mut self, target: MouthFrame) -> MouthFrame {
        let next = match self.last {
            None => target,
            Some(prev) => MouthFrame {
                openness: prev.openness * self.factor + target.openness * (1.0 - self.factor),
                form: prev.form * self.factor + target.form * (1.0 - self.factor),
            },
        };
        self.last = Some(next);
        next
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

/// Receives mouth updates at the coordinator's cadence.
///
/// Implemented by whatever drives the avatar's model parameters.
pub trait MouthSink: Send + Sync {
    fn mouth(&self, speaker: &SpeakerId, frame: MouthFrame);

    /// Opaque expression hint from the caller, forwarded once when the
    /// utterance starts playing.
    fn expression(&self, speaker: &SpeakerId, hint: &str) {
        let _ = (speaker, hint);
    }
}

impl<F> MouthSink for F
where
    F: Fn(&SpeakerId, MouthFrame) + Send + Sync,
{
    fn mouth(&self, speaker: &SpeakerId, frame: MouthFrame) {
        self(speaker, frame);
    }
}

/// One message from a [`ChannelMouthSink`].
#[derive(Debug, Clone, PartialEq)]
pub enum MouthUpdate {
    Frame { speaker: SpeakerId, frame: MouthFrame },
    Expression { speaker: SpeakerId, hint: String },
}

/// Forwards mouth updates over a channel to a render loop.
#[derive(Debug, Clone)]
pub struct ChannelMouthSink {
    tx: mpsc::UnboundedSender<MouthUpdate>,
}

impl ChannelMouthSink {
    pub fn new(tx: mpsc::UnboundedSender<MouthUpdate>) -> Self {
        Self { tx }
    }
}

impl MouthSink for ChannelMouthSink {
    fn mouth(&self, speaker: &SpeakerId, frame: MouthFrame) {
        let _ = self.tx.send(MouthUpdate::Frame {
            speaker: speaker.clone(),
            frame,
        });
    }

    fn expression(&self, speaker: &SpeakerId, hint: &str) {
        let _ = self.tx.send(MouthUpdate::Expression {
            speaker: speaker.clone(),
            hint: hint.to_owned(),
        });
    }
}
