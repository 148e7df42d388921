//! Fae lip-sync: streaming speech playback that drives an avatar's mouth.
//!
//! A synthesis engine produces speech in fragments. This crate plays them
//! back gaplessly and turns the live output signal into mouth parameters.
//!
//! # Architecture
//!
//! - **Playback**: [`FragmentPlaybackEngine`] schedules each fragment at the
//!   end of the previous one on an absolute output timeline and exposes a
//!   live analysis tap (RMS, peak, coarse spectrum, playhead).
//! - **Coordination**: [`UtteranceCoordinator`] owns one engine per speaker,
//!   runs one utterance at a time per speaker (a new `speak()` cancels the
//!   old one), and fires lifecycle callbacks exactly once.
//! - **Animation**: [`LipSyncMapper`] maps the signal, or phoneme timings
//!   when the producer supplies them, to mouth openness and form at a fixed
//!   cadence.
//! - **Synthesis**: any [`SpeechSynthesizer`]; [`SentenceSynthesizer`]
//!   adapts a blocking sentence-level voice.

pub mod audio;
pub mod config;
pub mod error;
pub mod lipsync;
pub mod pipeline;
pub mod runtime;
pub mod tts;
pub mod viseme;

pub use audio::{
    AudioFragment, EngineState, FragmentId, FragmentPayload, FragmentPlaybackEngine,
    PhonemeTiming, Playhead, ScheduleClock, ScheduledWindow, Signal, SignalTap,
};
pub use config::{LipSyncConfig, OutputBackend};
pub use error::{Result, SpeechError};
pub use lipsync::{ChannelMouthSink, LipSyncMapper, MouthFrame, MouthSink, MouthUpdate};
pub use pipeline::coordinator::UtteranceCoordinator;
pub use pipeline::messages::PlaybackEvent;
pub use pipeline::utterance::{
    SpeakOptions, SpeakerId, UtteranceHandle, UtteranceId, UtteranceOutcome, UtteranceState,
};
pub use runtime::RuntimeEvent;
pub use tts::{
    FragmentSender, RenderedSpeech, SentenceSynthesizer, SentenceVoice, SpeechSynthesizer,
    SynthesisRequest,
};
