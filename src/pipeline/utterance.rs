//! Utterance identity, lifecycle, caller options, and the handle returned
//! by `speak()`.

use crate::audio::playback::FragmentPlaybackEngine;
use crate::error::SpeechError;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Identity of a speaker (character). One playback engine exists per speaker.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SpeakerId(Arc<str>);

impl SpeakerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SpeakerId {
    fn default() -> Self {
        Self::from("default")
    }
}

impl From<&str> for SpeakerId {
    fn from(value: &str) -> Self {
        Self(Arc::from(value))
    }
}

impl From<String> for SpeakerId {
    fn from(value: String) -> Self {
        Self(Arc::from(value))
    }
}

impl fmt::Display for SpeakerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Generated identity of one `speak()` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UtteranceId(uuid::Uuid);

impl UtteranceId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for UtteranceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UtteranceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle of an utterance.
///
/// ```text
/// Idle → Requested → Streaming → Draining → Completed
///        Requested | Streaming | Draining → Cancelled
///        Requested | Streaming | Draining → Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UtteranceState {
    Idle,
    /// Synthesis requested, nothing scheduled yet.
    Requested,
    /// At least one fragment scheduled; more may arrive.
    Streaming,
    /// Synthesis finished; scheduled audio still playing.
    Draining,
    Completed,
    Cancelled,
    Failed,
}

impl UtteranceState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    /// States in which the mouth is animated from the live signal.
    pub fn is_animating(self) -> bool {
        matches!(self, Self::Streaming | Self::Draining)
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        use UtteranceState::{Cancelled, Completed, Draining, Failed, Idle, Requested, Streaming};
        matches!(
            (self, next),
            (Idle, Requested)
                | (Requested, Streaming)
                | (Streaming, Draining)
                | (Draining, Completed)
                | (Requested | Streaming | Draining, Cancelled | Failed)
        )
    }
}

/// How an utterance ended.
#[derive(Debug, Clone)]
pub enum UtteranceOutcome {
    Completed,
    Cancelled,
    Failed(Arc<SpeechError>),
}

impl UtteranceOutcome {
    pub fn state(&self) -> UtteranceState {
        match self {
            Self::Completed => UtteranceState::Completed,
            Self::Cancelled => UtteranceState::Cancelled,
            Self::Failed(_) => UtteranceState::Failed,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn error(&self) -> Option<&SpeechError> {
        match self {
            Self::Failed(e) => Some(e),
            _ => None,
        }
    }
}

type StartCallback = Box<dyn FnOnce() + Send>;
type FinishCallback = Box<dyn FnOnce(&UtteranceOutcome) + Send>;
type ErrorCallback = Box<dyn FnOnce(Arc<SpeechError>) + Send>;

/// Lifecycle callbacks. Each is `FnOnce` and is taken when fired.
#[derive(Default)]
pub(crate) struct Callbacks {
    on_start: Option<StartCallback>,
    on_finish: Option<FinishCallback>,
    on_error: Option<ErrorCallback>,
}

impl Callbacks {
    pub fn fire_start(&mut self) {
        if let Some(cb) = self.on_start.take() {
            cb();
        }
    }

    /// Fire exactly one of `on_finish` / `on_error` and drop the other.
    pub fn fire_terminal(&mut self, outcome: &UtteranceOutcome) {
        self.on_start = None;
        match outcome {
            UtteranceOutcome::Failed(err) => {
                self.on_finish = None;
                if let Some(cb) = self.on_error.take() {
                    cb(Arc::clone(err));
                }
            }
            UtteranceOutcome::Completed | UtteranceOutcome::Cancelled => {
                self.on_error = None;
                if let Some(cb) = self.on_finish.take() {
                    cb(outcome);
                }
            }
        }
    }
}

/// Caller-supplied parameters for one `speak()` call.
#[derive(Default)]
pub struct SpeakOptions {
    /// Engine-defined voice identifier.
    pub voice: Option<String>,
    /// Speed multiplier; clamped to the configured range.
    pub speed: Option<f32>,
    /// Output volume `[0, 1]`; clamped.
    pub volume: Option<f32>,
    /// Opaque hint forwarded to the animation collaborator.
    pub expression: Option<String>,
    pub(crate) callbacks: Callbacks,
}

impl SpeakOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = Some(voice.into());
        self
    }

    pub fn speed(mut self, speed: f32) -> Self {
        self.speed = Some(speed);
        self
    }

    pub fn volume(mut self, volume: f32) -> Self {
        self.volume = Some(volume);
        self
    }

    pub fn expression(mut self, hint: impl Into<String>) -> Self {
        self.expression = Some(hint.into());
        self
    }

    /// Fires once, when the first fragment has been scheduled.
    pub fn on_start(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.callbacks.on_start = Some(Box::new(f));
        self
    }

    /// Fires once on completion or cancellation.
    pub fn on_finish(mut self, f: impl FnOnce(&UtteranceOutcome) + Send + 'static) -> Self {
        self.callbacks.on_finish = Some(Box::new(f));
        self
    }

    /// Fires once on failure.
    pub fn on_error(mut self, f: impl FnOnce(Arc<SpeechError>) + Send + 'static) -> Self {
        self.callbacks.on_error = Some(Box::new(f));
        self
    }
}

impl fmt::Debug for SpeakOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpeakOptions")
            .field("voice", &self.voice)
            .field("speed", &self.speed)
            .field("volume", &self.volume)
            .field("expression", &self.expression)
            .finish_non_exhaustive()
    }
}

/// Published state of an utterance.
#[derive(Debug, Clone)]
pub struct UtteranceStatus {
    pub state: UtteranceState,
    pub outcome: Option<UtteranceOutcome>,
}

/// Tracks which utterance currently owns a speaker's engine.
pub(crate) type CurrentUtterance = Arc<Mutex<Option<UtteranceId>>>;

/// Returned by `speak()`: cancel the utterance or await how it ended.
#[derive(Clone)]
pub struct UtteranceHandle {
    id: UtteranceId,
    speaker: SpeakerId,
    cancel: CancellationToken,
    engine: Arc<FragmentPlaybackEngine>,
    current: CurrentUtterance,
    status: watch::Receiver<UtteranceStatus>,
}

impl UtteranceHandle {
    pub(crate) fn new(
        id: UtteranceId,
        speaker: SpeakerId,
        cancel: CancellationToken,
        engine: Arc<FragmentPlaybackEngine>,
        current: CurrentUtterance,
        status: watch::Receiver<UtteranceStatus>,
    ) -> Self {
        Self {
            id,
            speaker,
            cancel,
            engine,
            current,
            status,
        }
    }

    pub fn id(&self) -> UtteranceId {
        self.id
    }

    pub fn speaker(&self) -> &SpeakerId {
        &self.speaker
    }

    pub fn state(&self) -> UtteranceState {
        self.status.borrow().state
    }

    /// The outcome, if the utterance has reached a terminal state.
    pub fn outcome(&self) -> Option<UtteranceOutcome> {
        self.status.borrow().outcome.clone()
    }

    /// Cancel the utterance.
    ///
    /// Audio is silenced before this returns, provided this utterance
    /// still owns the speaker's engine. Callbacks fire from the
    /// coordinator shortly after; await [`finished`](Self::finished) to
    /// observe them.
    pub fn cancel(&self) {
        {
            let current = match self.current.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if *current == Some(self.id)
                && let Err(e) = self.engine.stop()
            {
                debug!(utterance = %self.id, "engine stop on cancel failed: {e}");
            }
        }
        self.cancel.cancel();
    }

    /// Wait for the terminal outcome.
    pub async fn finished(&self) -> UtteranceOutcome {
        let mut rx = self.status.clone();
        let waited = rx
            .wait_for(|s| s.outcome.is_some())
            .await
            .map(|status| status.outcome.clone());
        match waited {
            Ok(outcome) => outcome.unwrap_or(UtteranceOutcome::Cancelled),
            Err(_) => rx.borrow().outcome.clone().unwrap_or_else(|| {
                UtteranceOutcome::Failed(Arc::new(SpeechError::Channel(
                    "utterance driver ended without an outcome".into(),
                )))
            }),
        }
    }
}

impl fmt::Debug for UtteranceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UtteranceHandle")
            .field("id", &self.id)
            .field("speaker", &self.speaker)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn happy_path_transitions_are_allowed() {
        use UtteranceState::*;
        let path = [Idle, Requested, Streaming, Draining, Completed];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{pair:?}");
        }
    }

    #[test]
    fn terminal_states_are_final() {
        use UtteranceState::*;
        for terminal in [Completed, Cancelled, Failed] {
            assert!(terminal.is_terminal());
            for next in [Idle, Requested, Streaming, Draining, Completed, Cancelled, Failed] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn skipping_states_is_rejected() {
        use UtteranceState::*;
        assert!(!Requested.can_transition_to(Completed));
        assert!(!Requested.can_transition_to(Draining));
        assert!(!Idle.can_transition_to(Streaming));
        assert!(!Streaming.can_transition_to(Completed));
        assert!(Requested.can_transition_to(Failed));
        assert!(Draining.can_transition_to(Cancelled));
    }

    #[test]
    fn animating_only_while_audio_flows() {
        use UtteranceState::*;
        assert!(Streaming.is_animating());
        assert!(Draining.is_animating());
        assert!(!Requested.is_animating());
        assert!(!Completed.is_animating());
    }

    #[test]
    fn callbacks_fire_at_most_once() {
        let finished = Arc::new(AtomicUsize::new(0));
        let errored = Arc::new(AtomicUsize::new(0));
        let started = Arc::new(AtomicUsize::new(0));

        let (f, e, s) = (finished.clone(), errored.clone(), started.clone());
        let mut options = SpeakOptions::new()
            .on_start(move || {
                s.fetch_add(1, Ordering::SeqCst);
            })
            .on_finish(move |_| {
                f.fetch_add(1, Ordering::SeqCst);
            })
            .on_error(move |_| {
                e.fetch_add(1, Ordering::SeqCst);
            });

        options.callbacks.fire_start();
        options.callbacks.fire_start();
        options.callbacks.fire_terminal(&UtteranceOutcome::Completed);
        options
            .callbacks
            .fire_terminal(&UtteranceOutcome::Failed(Arc::new(SpeechError::Synthesis(
                "late".into(),
            ))));

        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(errored.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failure_fires_only_on_error() {
        let finished = Arc::new(AtomicUsize::new(0));
        let f = finished.clone();
        let mut options = SpeakOptions::new().on_finish(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });
        let (tx, rx) = std::sync::mpsc::channel();
        options = options.on_error(move |err| {
            tx.send(err.to_string()).unwrap();
        });

        options
            .callbacks
            .fire_terminal(&UtteranceOutcome::Failed(Arc::new(SpeechError::Synthesis(
                "voice missing".into(),
            ))));
        assert_eq!(finished.load(Ordering::SeqCst), 0);
        assert_eq!(rx.recv().unwrap(), "synthesis error: voice missing");
    }

    #[test]
    fn utterance_ids_are_unique() {
        assert_ne!(UtteranceId::new(), UtteranceId::new());
    }

    #[test]
    fn speaker_id_round_trips_display() {
        let id = SpeakerId::from("mao".to_owned());
        assert_eq!(id.to_string(), "mao");
        assert_eq!(id.as_str(), "mao");
        assert_eq!(SpeakerId::default().as_str(), "default");
    }
}
