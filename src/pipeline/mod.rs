//! Utterance pipeline: synthesis in, audio and mouth movement out.

pub mod coordinator;
pub mod messages;
pub mod utterance;
