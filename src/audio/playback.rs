//! Gapless playback of asynchronously arriving audio fragments.

use super::analysis::{Playhead, Signal, SignalTap, SpectrumAnalyser};
use super::fragment::AudioFragment;
use super::output::{self, OutputSink};
use super::schedule::{ScheduleClock, ScheduledWindow, SharedSchedule};
use crate::config::{AudioConfig, OutputBackend, PlaybackConfig};
use crate::error::{Result, SpeechError};
use crate::pipeline::messages::PlaybackEvent;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Coarse engine lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// `initialize()` has not succeeded yet.
    Uninitialized,
    /// Output graph is running with nothing scheduled.
    Idle,
    /// At least one fragment is scheduled or playing.
    Playing,
    /// `dispose()` has released the output graph.
    Disposed,
}

struct Graph {
    schedule: Arc<SharedSchedule>,
    analyser: Arc<SpectrumAnalyser>,
    sink: Box<dyn OutputSink>,
}

enum Slot {
    Uninitialized { volume: f32 },
    Ready(Graph),
    Disposed,
}

/// Turns an ordered stream of fragments into continuous output.
///
/// Each fragment is placed at the playback cursor (the end of the previous
/// one) as soon as it arrives, rather than after the previous one finishes,
/// so bursts and slow producers both play back without gaps.
///
/// All methods take `&self`; the engine is meant to be shared behind an
/// `Arc` by its single owner.
pub struct FragmentPlaybackEngine {
    audio: AudioConfig,
    playback: PlaybackConfig,
    events: mpsc::UnboundedSender<PlaybackEvent>,
    slot: Mutex<Slot>,
}

impl FragmentPlaybackEngine {
    /// Create an engine that reports render events on `events`.
    ///
    /// Nothing is allocated until [`initialize`](Self::initialize).
    pub fn new(
        audio: AudioConfig,
        playback: PlaybackConfig,
        events: mpsc::UnboundedSender<PlaybackEvent>,
    ) -> Self {
        let volume = playback.default_volume;
        Self {
            audio,
            playback,
            events,
            slot: Mutex::new(Slot::Uninitialized { volume }),
        }
    }

    fn slot(&self) -> Result<MutexGuard<'_, Slot>> {
        self.slot
            .lock()
            .map_err(|e| SpeechError::Channel(format!("engine state lock poisoned: {e}")))
    }

    fn with_graph<T>(&self, f: impl FnOnce(&Graph) -> Result<T>) -> Result<T> {
        match &*self.slot()? {
            Slot::Ready(graph) => f(graph),
            Slot::Uninitialized { .. } => Err(SpeechError::AudioInit(
                "playback engine is not initialized".into(),
            )),
            Slot::Disposed => Err(SpeechError::EngineDisposed),
        }
    }

    /// Allocate the output graph: sink, gain stage, analysis tap.
    ///
    /// Calling it again once it has succeeded is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`SpeechError::AudioInit`] if the output device cannot be
    /// opened, or [`SpeechError::EngineDisposed`] after `dispose()`.
    pub fn initialize(&self) -> Result<()> {
        let mut slot = self.slot()?;
        let volume = match &*slot {
            Slot::Ready(_) => return Ok(()),
            Slot::Disposed => return Err(SpeechError::EngineDisposed),
            Slot::Uninitialized { volume } => *volume,
        };

        let sample_rate = self.audio.output_sample_rate;
        let schedule = Arc::new(SharedSchedule::new(
            sample_rate,
            self.playback.analysis_window,
            self.playback.max_queued_fragments,
            volume,
            self.events.clone(),
        ));
        let analyser = Arc::new(SpectrumAnalyser::new(
            self.playback.analysis_window,
            sample_rate,
        ));
        let sink = output::open(&self.audio, Arc::clone(&schedule))?;

        info!(
            backend = ?self.audio.backend,
            sample_rate,
            volume,
            "playback engine initialized"
        );
        *slot = Slot::Ready(Graph {
            schedule,
            analyser,
            sink,
        });
        Ok(())
    }

    /// Clamp `level` to `[0, 1]` and apply it to the gain stage.
    ///
    /// Takes effect on audio already playing. Before `initialize()` the
    /// level is remembered and applied when the graph is built. Returns the
    /// gain actually applied.
    ///
    /// # Errors
    ///
    /// Returns [`SpeechError::EngineDisposed`] after `dispose()`.
    pub fn set_volume(&self, level: f32) -> Result<f32> {
        let mut slot = self.slot()?;
        match &mut *slot {
            Slot::Ready(graph) => Ok(graph.schedule.set_gain(level)),
            Slot::Uninitialized { volume } => {
                *volume = if level.is_nan() { 0.0 } else { level.clamp(0.0, 1.0) };
                Ok(*volume)
            }
            Slot::Disposed => Err(SpeechError::EngineDisposed),
        }
    }

    /// Current gain.
    ///
    /// # Errors
    ///
    /// Returns [`SpeechError::EngineDisposed`] after `dispose()`.
    pub fn volume(&self) -> Result<f32> {
        match &*self.slot()? {
            Slot::Ready(graph) => Ok(graph.schedule.gain()),
            Slot::Uninitialized { volume } => Ok(*volume),
            Slot::Disposed => Err(SpeechError::EngineDisposed),
        }
    }

    /// Decode `fragment` and schedule it right after everything already
    /// queued (or now, if the engine is idle).
    ///
    /// Never waits for playback; returns as soon as the fragment has a
    /// place on the timeline.
    ///
    /// # Errors
    ///
    /// - [`SpeechError::FragmentDecode`] if the fragment is unplayable. It is
    ///   dropped and the queue is unaffected.
    /// - [`SpeechError::InvalidArgument`] if the schedule queue is full.
    /// - [`SpeechError::AudioInit`] before `initialize()`.
    /// - [`SpeechError::EngineDisposed`] after `dispose()`.
    pub fn enqueue(&self, fragment: AudioFragment) -> Result<ScheduledWindow> {
        // Fail fast before paying for decode.
        self.with_graph(|_| Ok(()))?;

        let samples = fragment
            .decode(self.audio.output_sample_rate)
            .inspect_err(|e| warn!("dropping fragment: {e}"))?;

        self.with_graph(|graph| {
            let window = graph.schedule.schedule(samples)?;
            debug!(
                fragment = window.fragment.0,
                start_ms = window.start().as_millis() as u64,
                duration_ms = window.duration().as_millis() as u64,
                "fragment scheduled"
            );
            Ok(window)
        })
    }

    /// Handle to the live analysis tap.
    ///
    /// # Errors
    ///
    /// Fails before `initialize()` and after `dispose()`.
    pub fn signal_tap(&self) -> Result<SignalTap> {
        self.with_graph(|graph| {
            Ok(SignalTap::new(&graph.schedule, Arc::clone(&graph.analyser)))
        })
    }

    /// Read the live signal once. Silence when nothing is scheduled.
    ///
    /// # Errors
    ///
    /// Fails before `initialize()` and after `dispose()`.
    pub fn signal(&self) -> Result<Signal> {
        Ok(self.signal_tap()?.read())
    }

    /// Fragment under the playhead, if any.
    ///
    /// # Errors
    ///
    /// Fails before `initialize()` and after `dispose()`.
    pub fn playhead(&self) -> Result<Option<Playhead>> {
        self.with_graph(|graph| Ok(graph.schedule.playhead()))
    }

    /// Output clock and cursor.
    ///
    /// # Errors
    ///
    /// Fails before `initialize()` and after `dispose()`.
    pub fn clock(&self) -> Result<ScheduleClock> {
        self.with_graph(|graph| Ok(graph.schedule.clock()))
    }

    /// Current epoch; events from earlier epochs belong to stopped audio.
    ///
    /// # Errors
    ///
    /// Fails before `initialize()` and after `dispose()`.
    pub fn epoch(&self) -> Result<u64> {
        self.with_graph(|graph| Ok(graph.schedule.epoch()))
    }

    pub fn state(&self) -> EngineState {
        match self.slot() {
            Ok(slot) => match &*slot {
                Slot::Uninitialized { .. } => EngineState::Uninitialized,
                Slot::Ready(graph) if graph.schedule.is_playing() => EngineState::Playing,
                Slot::Ready(_) => EngineState::Idle,
                Slot::Disposed => EngineState::Disposed,
            },
            Err(_) => EngineState::Disposed,
        }
    }

    /// Silence output immediately, clear the queue, and reset the cursor to
    /// now. Returns the new epoch. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`SpeechError::EngineDisposed`] after `dispose()`.
    pub fn stop(&self) -> Result<u64> {
        match &*self.slot()? {
            Slot::Ready(graph) => {
                let epoch = graph.schedule.stop();
                debug!(epoch, "playback stopped");
                Ok(epoch)
            }
            Slot::Uninitialized { .. } => Ok(0),
            Slot::Disposed => Err(SpeechError::EngineDisposed),
        }
    }

    /// Stop playback and release the output graph. Idempotent; every other
    /// operation fails with [`SpeechError::EngineDisposed`] afterwards.
    pub fn dispose(&self) {
        let mut slot = match self.slot.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Slot::Ready(graph) = &mut *slot {
            graph.schedule.stop();
            graph.sink.close();
            info!(backend = ?graph.sink.backend(), "playback engine disposed");
        }
        *slot = Slot::Disposed;
    }

    /// Pull the next `out.len()` frames of mono audio through the graph.
    ///
    /// Only the `manual` backend has no clock of its own; this is how it
    /// advances.
    ///
    /// # Errors
    ///
    /// Returns [`SpeechError::InvalidArgument`] for clocked backends, and
    /// the usual lifecycle errors.
    pub fn render_offline(&self, out: &mut [f32]) -> Result<()> {
        self.with_graph(|graph| {
            if graph.sink.backend() != OutputBackend::Manual {
                return Err(SpeechError::InvalidArgument(format!(
                    "render_offline needs the manual backend, engine uses {:?}",
                    graph.sink.backend()
                )));
            }
            graph.schedule.render(out, 1);
            Ok(())
        })
    }

    /// Render `duration` of output and return it.
    ///
    /// # Errors
    ///
    /// Same as [`render_offline`](Self::render_offline).
    pub fn render_offline_for(&self, duration: Duration) -> Result<Vec<f32>> {
        let frames = self.with_graph(|graph| Ok(graph.schedule.frames_for(duration)))?;
        let mut out = vec![0.0; frames as usize];
        self.render_offline(&mut out)?;
        Ok(out)
    }

    pub fn sample_rate(&self) -> u32 {
        self.audio.output_sample_rate
    }
}

impl Drop for FragmentPlaybackEngine {
    fn drop(&mut self) {
        self.dispose();
    }
}
