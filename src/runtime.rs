//! Runtime events emitted by the coordinator for UI and observability.
//!
//! Kept lightweight so the coordinator can publish them from its animation
//! tick without blocking.

use crate::audio::FragmentId;
use crate::pipeline::utterance::{SpeakerId, UtteranceId, UtteranceState};
use std::time::Duration;

/// Events that describe what the coordinator is doing "right now".
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeEvent {
    /// An utterance moved to a new lifecycle state.
    UtteranceState {
        speaker: SpeakerId,
        utterance: UtteranceId,
        state: UtteranceState,
    },
    /// A fragment was placed on the speaker's output timeline.
    FragmentScheduled {
        speaker: SpeakerId,
        utterance: UtteranceId,
        fragment: FragmentId,
        /// Offset from engine start.
        start: Duration,
        duration: Duration,
    },
    /// A fragment could not be decoded and was skipped.
    FragmentDropped {
        speaker: SpeakerId,
        utterance: UtteranceId,
        reason: String,
    },
    /// Best-effort output level (RMS) at the animation cadence.
    AudioLevel { speaker: SpeakerId, rms: f32 },
}
