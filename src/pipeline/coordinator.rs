//! Utterance coordinator: one playback engine per speaker, single-flight
//! utterances, and the lip-sync animation loop.

use crate::audio::FragmentId;
use crate::audio::analysis::{Signal, SignalTap};
use crate::audio::fragment::{AudioFragment, PhonemeTiming};
use crate::audio::playback::FragmentPlaybackEngine;
use crate::config::LipSyncConfig;
use crate::error::{Result, SpeechError};
use crate::lipsync::{LipSyncMapper, MouthSink, MouthSmoother};
use crate::pipeline::messages::{PlaybackEvent, SynthesisEvent, SynthesisEventKind};
use crate::pipeline::utterance::{
    Callbacks, CurrentUtterance, SpeakOptions, SpeakerId, UtteranceHandle, UtteranceId,
    UtteranceOutcome, UtteranceState, UtteranceStatus,
};
use crate::runtime::RuntimeEvent;
use crate::tts::{FragmentSender, SpeechSynthesizer, SynthesisRequest};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Synthesis events buffered between the producer and the driver.
const SYNTHESIS_CHANNEL_CAPACITY: usize = 64;

/// The utterance currently owning a speaker's engine.
struct ActiveUtterance {
    id: UtteranceId,
    cancel: CancellationToken,
    driver: JoinHandle<()>,
}

/// Per-speaker engine and single-flight state.
struct SpeakerSlot {
    engine: Arc<FragmentPlaybackEngine>,
    events: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<PlaybackEvent>>>,
    current: CurrentUtterance,
    /// Held across the whole replace sequence of `speak()`.
    flight: tokio::sync::Mutex<Option<ActiveUtterance>>,
}

impl SpeakerSlot {
    fn new(config: &LipSyncConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let engine = FragmentPlaybackEngine::new(
            config.audio.clone(),
            config.playback.clone(),
            events_tx,
        );
        Self {
            engine: Arc::new(engine),
            events: Arc::new(tokio::sync::Mutex::new(events_rx)),
            current: Arc::new(Mutex::new(None)),
            flight: tokio::sync::Mutex::new(None),
        }
    }

    fn set_current(&self, id: Option<UtteranceId>) {
        let mut current = match self.current.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *current = id;
    }

    /// Silence the engine, then retire the active utterance and wait for
    /// its callbacks to fire.
    async fn retire(&self, flight: &mut Option<ActiveUtterance>) -> Result<()> {
        let stopped = self.engine.stop().map(|_| ());
        if let Some(active) = flight.take() {
            active.cancel.cancel();
            if let Err(e) = active.driver.await {
                warn!(utterance = %active.id, "utterance driver ended abnormally: {e}");
            }
        }
        stopped
    }
}

/// Drives utterances from text to audio and mouth movement.
///
/// Each speaker gets its own [`FragmentPlaybackEngine`], created lazily on
/// first use. At most one utterance is active per speaker: a new `speak()`
/// cancels the previous one (its `on_finish` fires with
/// [`UtteranceOutcome::Cancelled`]) before the new one starts.
pub struct UtteranceCoordinator {
    config: Arc<LipSyncConfig>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    sink: Arc<dyn MouthSink>,
    runtime_tx: Option<broadcast::Sender<RuntimeEvent>>,
    speakers: Mutex<HashMap<SpeakerId, Arc<SpeakerSlot>>>,
    closed: AtomicBool,
}

impl UtteranceCoordinator {
    /// Create a coordinator. No audio resources are allocated until the
    /// first `speak()`.
    pub fn new(
        config: LipSyncConfig,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        sink: Arc<dyn MouthSink>,
    ) -> Self {
        Self {
            config: Arc::new(config.validated()),
            synthesizer,
            sink,
            runtime_tx: None,
            speakers: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Publish state transitions, dropped fragments, and audio levels.
    pub fn with_runtime_events(mut self, tx: broadcast::Sender<RuntimeEvent>) -> Self {
        self.runtime_tx = Some(tx);
        self
    }

    pub fn config(&self) -> &LipSyncConfig {
        &self.config
    }

    fn speakers(&self) -> std::sync::MutexGuard<'_, HashMap<SpeakerId, Arc<SpeakerSlot>>> {
        match self.speakers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Checked under the map lock so a slot is never created after
    /// `shutdown()` has drained the map.
    fn slot(&self, speaker: &SpeakerId) -> Result<Arc<SpeakerSlot>> {
        let mut speakers = self.speakers();
        if self.closed.load(Ordering::Acquire) {
            return Err(SpeechError::EngineDisposed);
        }
        Ok(Arc::clone(
            speakers
                .entry(speaker.clone())
                .or_insert_with(|| Arc::new(SpeakerSlot::new(&self.config))),
        ))
    }

    fn existing_slot(&self, speaker: &SpeakerId) -> Option<Arc<SpeakerSlot>> {
        self.speakers().get(speaker).cloned()
    }

    /// Speak `text` as `speaker`.
    ///
    /// Returns once the first fragment has been scheduled, or once the
    /// utterance has reached a terminal state without ever starting. Await
    /// [`UtteranceHandle::finished`] for completion.
    ///
    /// # Errors
    ///
    /// - [`SpeechError::InvalidArgument`] for empty text.
    /// - [`SpeechError::EngineDisposed`] after [`shutdown`](Self::shutdown).
    ///
    /// In both cases `on_error` fires before the error is returned. Later
    /// failures (device init, synthesis) are reported through the handle
    /// and `on_error`, not here.
    pub async fn speak(
        &self,
        speaker: impl Into<SpeakerId>,
        text: impl Into<String>,
        mut options: SpeakOptions,
    ) -> Result<UtteranceHandle> {
        let speaker = speaker.into();
        let text = text.into();

        if self.closed.load(Ordering::Acquire) {
            return Err(reject(&mut options, SpeechError::EngineDisposed));
        }
        if text.trim().is_empty() {
            return Err(reject(
                &mut options,
                SpeechError::InvalidArgument("utterance text is empty".into()),
            ));
        }

        let slot = match self.slot(&speaker) {
            Ok(slot) => slot,
            Err(e) => return Err(reject(&mut options, e)),
        };
        let mut flight = slot.flight.lock().await;
        // `shutdown()` may have retired this slot while we waited.
        if self.closed.load(Ordering::Acquire) {
            return Err(reject(&mut options, SpeechError::EngineDisposed));
        }
        if let Err(e) = slot.retire(&mut flight).await {
            return Err(reject(&mut options, e));
        }

        let id = UtteranceId::new();
        slot.set_current(Some(id));
        // Fresh epoch: nothing from the retired utterance can be mistaken
        // for ours.
        if let Err(e) = slot.engine.stop() {
            return Err(reject(&mut options, e));
        }

        let cancel = CancellationToken::new();
        let (status_tx, status_rx) = watch::channel(UtteranceStatus {
            state: UtteranceState::Requested,
            outcome: None,
        });
        let (started_tx, started_rx) = oneshot::channel();

        let utterance = &self.config.utterance;
        let speed = match options.speed {
            Some(s) if s.is_finite() => s.clamp(utterance.min_speed, utterance.max_speed),
            _ => utterance.default_speed,
        };
        let volume = options
            .volume
            .unwrap_or(self.config.playback.default_volume);

        info!(%speaker, utterance = %id, speed, volume, "utterance requested");
        publish(
            &self.runtime_tx,
            RuntimeEvent::UtteranceState {
                speaker: speaker.clone(),
                utterance: id,
                state: UtteranceState::Requested,
            },
        );

        let driver = UtteranceDriver {
            id,
            speaker: speaker.clone(),
            request: SynthesisRequest {
                utterance: id,
                text,
                voice: options.voice.take(),
                speed,
            },
            volume,
            expression: options.expression.take(),
            callbacks: std::mem::take(&mut options.callbacks),
            engine: Arc::clone(&slot.engine),
            events: Arc::clone(&slot.events),
            synthesizer: Arc::clone(&self.synthesizer),
            sink: Arc::clone(&self.sink),
            runtime_tx: self.runtime_tx.clone(),
            config: Arc::clone(&self.config),
            cancel: cancel.clone(),
            status: status_tx,
            started: Some(started_tx),
            state: UtteranceState::Requested,
        };
        let handle = UtteranceHandle::new(
            id,
            speaker,
            cancel.clone(),
            Arc::clone(&slot.engine),
            Arc::clone(&slot.current),
            status_rx,
        );
        *flight = Some(ActiveUtterance {
            id,
            cancel,
            driver: tokio::spawn(driver.run()),
        });
        drop(flight);

        // Resolves on Streaming or on a terminal state; a dropped sender
        // means the driver is gone, which the handle reports.
        let _ = started_rx.await;
        Ok(handle)
    }

    /// Cancel whatever `speaker` is saying. Audio is silenced before this
    /// returns, and the cancelled utterance's `on_finish` has fired.
    ///
    /// # Errors
    ///
    /// Returns [`SpeechError::EngineDisposed`] after shutdown.
    pub async fn stop(&self, speaker: &SpeakerId) -> Result<()> {
        let Some(slot) = self.existing_slot(speaker) else {
            return Ok(());
        };
        let mut flight = slot.flight.lock().await;
        slot.retire(&mut flight).await?;
        slot.set_current(None);
        debug!(%speaker, "speaker stopped");
        Ok(())
    }

    /// Cancel every speaker and release every engine. Further `speak()`
    /// calls fail with [`SpeechError::EngineDisposed`].
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let slots: Vec<(SpeakerId, Arc<SpeakerSlot>)> = self.speakers().drain().collect();
        for (speaker, slot) in slots {
            let mut flight = slot.flight.lock().await;
            if let Err(e) = slot.retire(&mut flight).await {
                debug!(%speaker, "stop during shutdown failed: {e}");
            }
            slot.engine.dispose();
        }
        info!("utterance coordinator shut down");
    }

    /// Live signal for `speaker`; silence if the speaker has no running
    /// engine.
    pub fn signal(&self, speaker: &SpeakerId) -> Signal {
        self.signal_tap(speaker)
            .map(|tap| tap.read())
            .unwrap_or_default()
    }

    /// Pull-based signal accessor for an animation collaborator that runs
    /// its own loop.
    pub fn signal_tap(&self, speaker: &SpeakerId) -> Option<SignalTap> {
        self.existing_slot(speaker)?.engine.signal_tap().ok()
    }

    /// Advance a `manual`-backend speaker by `out.len()` frames.
    ///
    /// # Errors
    ///
    /// Fails for unknown speakers, clocked backends, and engines that are
    /// not running.
    pub fn render_offline(&self, speaker: &SpeakerId, out: &mut [f32]) -> Result<()> {
        let slot = self.existing_slot(speaker).ok_or_else(|| {
            SpeechError::InvalidArgument(format!("no engine for speaker {speaker}"))
        })?;
        slot.engine.render_offline(out)
    }

    /// Speakers that currently have an engine.
    pub fn speakers_active(&self) -> Vec<SpeakerId> {
        self.speakers().keys().cloned().collect()
    }
}

fn reject(options: &mut SpeakOptions, err: SpeechError) -> SpeechError {
    let shared = Arc::new(err);
    options
        .callbacks
        .fire_terminal(&UtteranceOutcome::Failed(Arc::clone(&shared)));
    Arc::try_unwrap(shared).unwrap_or_else(|e| clone_error(&e))
}

/// `SpeechError` is not `Clone` because of its `Io` variant.
fn clone_error(err: &SpeechError) -> SpeechError {
    match err {
        SpeechError::AudioInit(m) => SpeechError::AudioInit(m.clone()),
        SpeechError::FragmentDecode(m) => SpeechError::FragmentDecode(m.clone()),
        SpeechError::Synthesis(m) => SpeechError::Synthesis(m.clone()),
        SpeechError::EngineDisposed => SpeechError::EngineDisposed,
        SpeechError::InvalidArgument(m) => SpeechError::InvalidArgument(m.clone()),
        SpeechError::Config(m) => SpeechError::Config(m.clone()),
        SpeechError::Channel(m) => SpeechError::Channel(m.clone()),
        SpeechError::Io(e) => SpeechError::Io(std::io::Error::new(e.kind(), e.to_string())),
    }
}

fn publish(tx: &Option<broadcast::Sender<RuntimeEvent>>, event: RuntimeEvent) {
    if let Some(tx) = tx {
        let _ = tx.send(event);
    }
}

/// Owns one utterance from request to terminal state.
struct UtteranceDriver {
    id: UtteranceId,
    speaker: SpeakerId,
    request: SynthesisRequest,
    volume: f32,
    expression: Option<String>,
    callbacks: Callbacks,
    engine: Arc<FragmentPlaybackEngine>,
    events: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<PlaybackEvent>>>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    sink: Arc<dyn MouthSink>,
    runtime_tx: Option<broadcast::Sender<RuntimeEvent>>,
    config: Arc<LipSyncConfig>,
    cancel: CancellationToken,
    status: watch::Sender<UtteranceStatus>,
    started: Option<oneshot::Sender<()>>,
    state: UtteranceState,
}

/// Scheduling bookkeeping for one utterance.
#[derive(Default)]
struct Progress {
    scheduled: usize,
    dropped: usize,
    pending: HashSet<FragmentId>,
    timings: HashMap<FragmentId, Arc<[PhonemeTiming]>>,
    synthesis_done: bool,
}

impl UtteranceDriver {
    async fn run(mut self) {
        let outcome = self.drive().await;
        self.finish(outcome);
    }

    async fn drive(&mut self) -> UtteranceOutcome {
        if self.cancel.is_cancelled() {
            return UtteranceOutcome::Cancelled;
        }
        let setup = self.engine.initialize().and_then(|()| {
            self.engine.set_volume(self.volume)?;
            Ok((self.engine.epoch()?, self.engine.signal_tap()?))
        });
        let (epoch, tap) = match setup {
            Ok(v) => v,
            Err(e) => return UtteranceOutcome::Failed(Arc::new(e)),
        };

        let (tx, mut synth_rx) = mpsc::channel(SYNTHESIS_CHANNEL_CAPACITY);
        let sender = FragmentSender::new(self.id, tx);
        let synth_task = tokio::spawn(run_synthesis(
            Arc::clone(&self.synthesizer),
            self.request.clone(),
            sender,
        ));

        let outcome = self.pump(epoch, &tap, &mut synth_rx).await;

        // Anything still in flight from the producer is discarded.
        drop(synth_rx);
        synth_task.abort();
        outcome
    }

    async fn pump(
        &mut self,
        epoch: u64,
        tap: &SignalTap,
        synth_rx: &mut mpsc::Receiver<SynthesisEvent>,
    ) -> UtteranceOutcome {
        let events = Arc::clone(&self.events);
        let mut events = events.lock().await;

        let animation = &self.config.animation;
        let mapper = LipSyncMapper::new(animation);
        let mut smoother = MouthSmoother::new(animation.smoothing);
        let mut ticker = tokio::time::interval(Duration::from_secs_f64(
            1.0 / f64::from(animation.update_hz.max(1)),
        ));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut progress = Progress::default();
        // Stop pulling from the synthesizer while the schedule queue is
        // full; the bounded synthesis channel then holds the producer back.
        let max_queued = self.config.playback.max_queued_fragments;

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return UtteranceOutcome::Cancelled,
                ev = events.recv() => {
                    let Some(ev) = ev else {
                        return UtteranceOutcome::Failed(Arc::new(SpeechError::Channel(
                            "playback event channel closed".into(),
                        )));
                    };
                    if ev.epoch() != epoch {
                        continue;
                    }
                    if let PlaybackEvent::FragmentFinished { fragment, .. } = ev {
                        progress.pending.remove(&fragment);
                        progress.timings.remove(&fragment);
                        if progress.synthesis_done && progress.pending.is_empty() {
                            return UtteranceOutcome::Completed;
                        }
                    }
                }
                ev = synth_rx.recv(),
                    if !progress.synthesis_done && progress.pending.len() < max_queued =>
                {
                    let Some(ev) = ev else {
                        return UtteranceOutcome::Failed(Arc::new(SpeechError::Synthesis(
                            "synthesizer stopped without finishing".into(),
                        )));
                    };
                    if ev.utterance != self.id {
                        debug!(utterance = %self.id, stray = %ev.utterance, "discarding stray synthesis event");
                        continue;
                    }
                    let was_animating = self.state.is_animating();
                    let step = match ev.kind {
                        SynthesisEventKind::Fragment(fragment) => {
                            self.on_fragment(fragment, &mut progress)
                        }
                        SynthesisEventKind::Done => self.on_synthesis_done(&mut progress),
                        SynthesisEventKind::Error(msg) => {
                            warn!(utterance = %self.id, "synthesis failed: {msg}");
                            Some(UtteranceOutcome::Failed(Arc::new(SpeechError::Synthesis(msg))))
                        }
                    };
                    if let Some(outcome) = step {
                        return outcome;
                    }
                    if !was_animating && self.state.is_animating() {
                        ticker.reset_immediately();
                    }
                }
                _ = ticker.tick(), if self.state.is_animating() => {
                    let signal = tap.read();
                    let timings = signal
                        .playhead
                        .and_then(|p| progress.timings.get(&p.fragment))
                        .map(|t| &t[..]);
                    let frame = smoother.apply(mapper.map(&signal, timings));
                    self.sink.mouth(&self.speaker, frame);
                    publish(&self.runtime_tx, RuntimeEvent::AudioLevel {
                        speaker: self.speaker.clone(),
                        rms: signal.rms,
                    });
                }
            }
        }
    }

    fn on_fragment(
        &mut self,
        fragment: AudioFragment,
        progress: &mut Progress,
    ) -> Option<UtteranceOutcome> {
        let timings = fragment.shared_timings();
        match self.engine.enqueue(fragment) {
            Ok(window) => {
                progress.scheduled += 1;
                progress.pending.insert(window.fragment);
                publish(
                    &self.runtime_tx,
                    RuntimeEvent::FragmentScheduled {
                        speaker: self.speaker.clone(),
                        utterance: self.id,
                        fragment: window.fragment,
                        start: window.start(),
                        duration: window.duration(),
                    },
                );
                if !timings.is_empty() {
                    progress.timings.insert(window.fragment, timings);
                }
                if self.state == UtteranceState::Requested {
                    self.transition(UtteranceState::Streaming);
                    if let Some(hint) = &self.expression {
                        self.sink.expression(&self.speaker, hint);
                    }
                    self.callbacks.fire_start();
                    if let Some(started) = self.started.take() {
                        let _ = started.send(());
                    }
                }
                None
            }
            Err(e) if e.is_recoverable() => {
                progress.dropped += 1;
                publish(
                    &self.runtime_tx,
                    RuntimeEvent::FragmentDropped {
                        speaker: self.speaker.clone(),
                        utterance: self.id,
                        reason: e.to_string(),
                    },
                );
                None
            }
            Err(e) => Some(UtteranceOutcome::Failed(Arc::new(e))),
        }
    }

    fn on_synthesis_done(&mut self, progress: &mut Progress) -> Option<UtteranceOutcome> {
        progress.synthesis_done = true;

        if progress.scheduled == 0 {
            let err = if progress.dropped > 0 {
                SpeechError::FragmentDecode(format!(
                    "all {} fragments failed to decode",
                    progress.dropped
                ))
            } else {
                SpeechError::Synthesis("synthesizer produced no audio".into())
            };
            return Some(UtteranceOutcome::Failed(Arc::new(err)));
        }

        let total = progress.scheduled + progress.dropped;
        let ratio = progress.dropped as f32 / total as f32;
        if let Some(max) = self.config.utterance.max_decode_failure_ratio
            && ratio > max
        {
            return Some(UtteranceOutcome::Failed(Arc::new(SpeechError::FragmentDecode(
                format!(
                    "{} of {total} fragments failed to decode",
                    progress.dropped
                ),
            ))));
        }

        self.transition(UtteranceState::Draining);
        if progress.pending.is_empty() {
            return Some(UtteranceOutcome::Completed);
        }
        None
    }

    fn transition(&mut self, next: UtteranceState) {
        if !self.state.can_transition_to(next) {
            warn!(utterance = %self.id, from = ?self.state, to = ?next, "ignoring invalid transition");
            return;
        }
        info!(speaker = %self.speaker, utterance = %self.id, from = ?self.state, to = ?next, "utterance state");
        self.state = next;
        self.status.send_modify(|s| s.state = next);
        publish(
            &self.runtime_tx,
            RuntimeEvent::UtteranceState {
                speaker: self.speaker.clone(),
                utterance: self.id,
                state: next,
            },
        );
    }

    fn finish(mut self, outcome: UtteranceOutcome) {
        self.transition(outcome.state());
        // Neutral is sent unsmoothed so the mouth closes at once.
        let mapper = LipSyncMapper::new(&self.config.animation);
        self.sink.mouth(&self.speaker, mapper.neutral());

        if let UtteranceOutcome::Failed(e) = &outcome {
            warn!(speaker = %self.speaker, utterance = %self.id, "utterance failed: {e}");
        }
        self.callbacks.fire_terminal(&outcome);
        self.status.send_modify(|s| {
            s.state = outcome.state();
            s.outcome = Some(outcome);
        });
        if let Some(started) = self.started.take() {
            let _ = started.send(());
        }
    }
}

async fn run_synthesis(
    synthesizer: Arc<dyn SpeechSynthesizer>,
    request: SynthesisRequest,
    sender: FragmentSender,
) {
    let kind = match synthesizer.synthesize(request, sender.clone()).await {
        Ok(()) => SynthesisEventKind::Done,
        Err(SpeechError::Synthesis(msg)) => SynthesisEventKind::Error(msg),
        Err(e) => SynthesisEventKind::Error(e.to_string()),
    };
    // A closed channel means the utterance already ended.
    let _ = sender.emit(kind).await;
}
