//! Error types for the playback engine and utterance coordinator.

/// Top-level error type for streaming playback and lip-sync.
#[derive(Debug, thiserror::Error)]
pub enum SpeechError {
    /// Output device or audio context could not be created.
    #[error("audio init error: {0}")]
    AudioInit(String),

    /// A single fragment could not be turned into playable samples.
    #[error("fragment decode error: {0}")]
    FragmentDecode(String),

    /// The synthesis collaborator reported failure.
    #[error("synthesis error: {0}")]
    Synthesis(String),

    /// An engine operation was attempted after `dispose()`.
    #[error("playback engine has been disposed")]
    EngineDisposed,

    /// Malformed or out-of-range caller input that cannot be clamped.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SpeechError {
    /// Whether the error only affects a single fragment.
    ///
    /// Decode failures are absorbed by the engine; everything else is
    /// terminal for the utterance that hit it.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::FragmentDecode(_))
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, SpeechError>;
