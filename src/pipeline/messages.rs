//! Message types passed between the synthesis producer, the playback
//! engine, and the utterance coordinator.

use crate::audio::FragmentId;
use crate::audio::fragment::AudioFragment;
use crate::pipeline::utterance::UtteranceId;

/// Events reported by a playback engine from its render path.
///
/// Every event carries the engine epoch it belongs to. `stop()` starts a new
/// epoch, so listeners can ignore stragglers from audio that was cut off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// The first sample of a fragment reached the output.
    FragmentStarted { epoch: u64, fragment: FragmentId },
    /// The last sample of a fragment reached the output.
    FragmentFinished { epoch: u64, fragment: FragmentId },
    /// The schedule queue emptied after playing everything it held.
    Drained { epoch: u64 },
    /// `stop()` cleared the queue; `dropped` fragments never finished.
    Stopped { epoch: u64, dropped: usize },
}

impl PlaybackEvent {
    pub fn epoch(&self) -> u64 {
        match self {
            Self::FragmentStarted { epoch, .. }
            | Self::FragmentFinished { epoch, .. }
            | Self::Drained { epoch }
            | Self::Stopped { epoch, .. } => *epoch,
        }
    }
}

/// One event from the synthesis collaborator, keyed by utterance so stray
/// events from a cancelled utterance can be recognised and discarded.
#[derive(Debug)]
pub struct SynthesisEvent {
    pub utterance: UtteranceId,
    pub kind: SynthesisEventKind,
}

#[derive(Debug)]
pub enum SynthesisEventKind {
    /// The next fragment, in production order.
    Fragment(AudioFragment),
    /// No more fragments will be produced.
    Done,
    /// The producer failed; no more fragments will be produced.
    Error(String),
}
