//! Fragment playback, scheduling, and the live analysis tap.

pub mod analysis;
pub mod fragment;
pub(crate) mod output;
pub mod playback;
pub mod schedule;

/// Engine-assigned identity of a scheduled fragment, unique per engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FragmentId(pub u64);

pub use analysis::{Playhead, Signal, SignalTap};
pub use fragment::{AudioFragment, FragmentPayload, PhonemeTiming};
pub use playback::{EngineState, FragmentPlaybackEngine};
pub use schedule::{ScheduleClock, ScheduledWindow};
