//! Utterance lifecycle tests: single-flight replacement, callbacks, neutral
//! reset, and failure handling.
//!
//! Runs on the `virtual` backend, which plays in real time without sound
//! hardware, so timing assertions use generous bounds.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use async_trait::async_trait;
use fae_lipsync::{
    AudioFragment, FragmentSender, LipSyncConfig, MouthFrame, MouthSink, OutputBackend,
    RuntimeEvent, SpeakOptions, SpeakerId, SpeechError, SpeechSynthesizer, SynthesisRequest,
    UtteranceCoordinator, UtteranceOutcome, UtteranceState,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::time::timeout;

const RATE: u32 = 16_000;
const WAIT: Duration = Duration::from_secs(10);

// ────────────────────────────────────────────────────────────────────────────
// Fixtures
// ────────────────────────────────────────────────────────────────────────────

#[derive(Clone)]
enum Step {
    /// A tone fragment of this many milliseconds.
    Tone(u64),
    /// A fragment that cannot be decoded.
    Garbage,
    Sleep(u64),
    Fail(&'static str),
}

/// Plays a script per utterance text; unknown text gets one short tone.
#[derive(Default)]
struct ScriptedSynthesizer {
    scripts: HashMap<&'static str, Vec<Step>>,
}

impl ScriptedSynthesizer {
    fn with(mut self, text: &'static str, steps: Vec<Step>) -> Self {
        self.scripts.insert(text, steps);
        self
    }
}

#[async_trait]
impl SpeechSynthesizer for ScriptedSynthesizer {
    async fn synthesize(
        &self,
        request: SynthesisRequest,
        out: FragmentSender,
    ) -> fae_lipsync::Result<()> {
        let steps = self
            .scripts
            .get(request.text.as_str())
            .cloned()
            .unwrap_or_else(|| vec![Step::Tone(100)]);
        for step in steps {
            match step {
                Step::Tone(ms) => {
                    let frames = (u64::from(RATE) * ms / 1000) as usize;
                    out.send(AudioFragment::pcm(vec![0.4; frames], RATE)).await?;
                }
                Step::Garbage => out.send(AudioFragment::wav(vec![0xde, 0xad])).await?,
                Step::Sleep(ms) => tokio::time::sleep(Duration::from_millis(ms)).await,
                Step::Fail(msg) => return Err(SpeechError::Synthesis(msg.into())),
            }
        }
        Ok(())
    }
}

/// Everything observable from outside, in the order it happened.
#[derive(Debug, Clone, PartialEq)]
enum Entry {
    Mouth(MouthFrame),
    Expression(String),
    Start(&'static str),
    Finish(&'static str, UtteranceState),
    Error(&'static str, String),
}

#[derive(Clone, Default)]
struct Journal(Arc<Mutex<Vec<Entry>>>);

impl Journal {
    fn push(&self, entry: Entry) {
        self.0.lock().unwrap().push(entry);
    }

    fn entries(&self) -> Vec<Entry> {
        self.0.lock().unwrap().clone()
    }

    fn position(&self, entry: &Entry) -> Option<usize> {
        self.entries().iter().position(|e| e == entry)
    }

    fn options(&self, label: &'static str) -> SpeakOptions {
        let (start, finish, error) = (self.clone(), self.clone(), self.clone());
        SpeakOptions::new()
            .on_start(move || start.push(Entry::Start(label)))
            .on_finish(move |outcome| finish.push(Entry::Finish(label, outcome.state())))
            .on_error(move |err| error.push(Entry::Error(label, err.to_string())))
    }
}

impl MouthSink for Journal {
    fn mouth(&self, _speaker: &SpeakerId, frame: MouthFrame) {
        self.push(Entry::Mouth(frame));
    }

    fn expression(&self, _speaker: &SpeakerId, hint: &str) {
        self.push(Entry::Expression(hint.to_owned()));
    }
}

fn config() -> LipSyncConfig {
    let mut config = LipSyncConfig::default();
    config.audio.backend = OutputBackend::Virtual;
    config.audio.output_sample_rate = RATE;
    config.audio.block_frames = 160;
    config.playback.analysis_window = 256;
    config
}

fn coordinator(synth: ScriptedSynthesizer, journal: &Journal) -> Arc<UtteranceCoordinator> {
    coordinator_with(config(), synth, journal)
}

fn coordinator_with(
    config: LipSyncConfig,
    synth: ScriptedSynthesizer,
    journal: &Journal,
) -> Arc<UtteranceCoordinator> {
    Arc::new(UtteranceCoordinator::new(
        config,
        Arc::new(synth),
        Arc::new(journal.clone()),
    ))
}

fn speaker() -> SpeakerId {
    SpeakerId::from("hiyori")
}

// ────────────────────────────────────────────────────────────────────────────
// Single-flight
// ────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn second_speak_before_playback_cancels_the_first() {
    let synth = ScriptedSynthesizer::default()
        .with("hello", vec![Step::Sleep(300), Step::Tone(200)])
        .with("world", vec![Step::Tone(200)]);
    let journal = Journal::default();
    let coord = coordinator(synth, &journal);

    let first = {
        let coord = Arc::clone(&coord);
        let options = journal.options("hello");
        tokio::spawn(async move { coord.speak(speaker(), "hello", options).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let world = coord
        .speak(speaker(), "world", journal.options("world"))
        .await
        .unwrap();

    let hello = timeout(WAIT, first).await.unwrap().unwrap().unwrap();
    assert!(hello.finished().await.is_cancelled());
    assert!(timeout(WAIT, world.finished()).await.unwrap().is_completed());

    let entries = journal.entries();
    assert!(!entries.contains(&Entry::Start("hello")));
    assert!(entries.contains(&Entry::Start("world")));
    assert!(entries.contains(&Entry::Finish("world", UtteranceState::Completed)));
}

#[tokio::test]
async fn replacement_cancels_strictly_before_the_next_start() {
    let synth = ScriptedSynthesizer::default()
        .with(
            "long",
            vec![Step::Tone(1_000), Step::Sleep(2_000), Step::Tone(1_000)],
        )
        .with("short", vec![Step::Tone(200)]);
    let journal = Journal::default();
    let coord = coordinator(synth, &journal);

    let long = coord
        .speak(speaker(), "long", journal.options("long"))
        .await
        .unwrap();
    assert_eq!(long.state(), UtteranceState::Streaming);
    // Let a few animation frames through.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let short = coord
        .speak(speaker(), "short", journal.options("short"))
        .await
        .unwrap();
    assert!(long.outcome().unwrap().is_cancelled());
    timeout(WAIT, short.finished()).await.unwrap();

    let cancelled = journal
        .position(&Entry::Finish("long", UtteranceState::Cancelled))
        .unwrap();
    let started = journal.position(&Entry::Start("short")).unwrap();
    assert!(cancelled < started);

    let entries = journal.entries();
    // The cancelled utterance closes the mouth and then goes quiet.
    assert_eq!(entries[cancelled - 1], Entry::Mouth(MouthFrame::neutral(0.0)));
    assert!(
        entries[cancelled + 1..started]
            .iter()
            .all(|e| !matches!(e, Entry::Mouth(_)))
    );
}

#[tokio::test]
async fn stop_cancels_the_active_utterance_and_silences_output() {
    let synth = ScriptedSynthesizer::default().with("long", vec![Step::Tone(2_000)]);
    let journal = Journal::default();
    let coord = coordinator(synth, &journal);

    let handle = coord
        .speak(speaker(), "long", journal.options("long"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!coord.signal(&speaker()).is_silent());

    coord.stop(&speaker()).await.unwrap();
    assert!(coord.signal(&speaker()).is_silent());
    assert!(handle.outcome().unwrap().is_cancelled());
    assert!(
        journal
            .entries()
            .contains(&Entry::Finish("long", UtteranceState::Cancelled))
    );
}

#[tokio::test]
async fn handle_cancel_discards_late_fragments() {
    let synth = ScriptedSynthesizer::default().with(
        "drip",
        vec![Step::Tone(300), Step::Sleep(100), Step::Tone(300), Step::Tone(300)],
    );
    let journal = Journal::default();
    let (runtime_tx, mut runtime_rx) = broadcast::channel(4_096);
    let coord = Arc::new(
        UtteranceCoordinator::new(config(), Arc::new(synth), Arc::new(journal.clone()))
            .with_runtime_events(runtime_tx),
    );

    let handle = coord
        .speak(speaker(), "drip", journal.options("drip"))
        .await
        .unwrap();
    handle.cancel();
    assert!(coord.signal(&speaker()).is_silent());
    assert!(timeout(WAIT, handle.finished()).await.unwrap().is_cancelled());

    // Give the producer time to try sending the rest.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let mut scheduled = 0;
    while let Ok(event) = runtime_rx.try_recv() {
        if matches!(event, RuntimeEvent::FragmentScheduled { .. }) {
            scheduled += 1;
        }
    }
    assert_eq!(scheduled, 1);
    assert_eq!(handle.state(), UtteranceState::Cancelled);
}

// ────────────────────────────────────────────────────────────────────────────
// Callbacks and animation
// ────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn finish_fires_about_when_the_audio_ends() {
    let synth = ScriptedSynthesizer::default().with(
        "three",
        vec![Step::Tone(500), Step::Tone(300), Step::Tone(700)],
    );
    let journal = Journal::default();
    let coord = coordinator(synth, &journal);

    let started_at = Arc::new(Mutex::new(None));
    let finished_at = Arc::new(Mutex::new(None));
    let (s, f) = (Arc::clone(&started_at), Arc::clone(&finished_at));
    let options = SpeakOptions::new()
        .on_start(move || *s.lock().unwrap() = Some(Instant::now()))
        .on_finish(move |_| *f.lock().unwrap() = Some(Instant::now()));

    let handle = coord.speak(speaker(), "three", options).await.unwrap();
    assert!(timeout(WAIT, handle.finished()).await.unwrap().is_completed());

    let started = started_at.lock().unwrap().unwrap();
    let finished = finished_at.lock().unwrap().unwrap();
    let elapsed = finished - started;
    assert!(
        elapsed >= Duration::from_millis(1_400) && elapsed <= Duration::from_millis(2_200),
        "finished {elapsed:?} after start"
    );
}

#[tokio::test]
async fn callbacks_fire_at_most_once() {
    let synth = ScriptedSynthesizer::default().with("hi", vec![Step::Tone(300)]);
    let journal = Journal::default();
    let coord = coordinator(synth, &journal);

    let starts = Arc::new(AtomicUsize::new(0));
    let finishes = Arc::new(AtomicUsize::new(0));
    let errors = Arc::new(AtomicUsize::new(0));
    let (s, f, e) = (starts.clone(), finishes.clone(), errors.clone());
    let options = SpeakOptions::new()
        .on_start(move || {
            s.fetch_add(1, Ordering::SeqCst);
        })
        .on_finish(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        })
        .on_error(move |_| {
            e.fetch_add(1, Ordering::SeqCst);
        });

    let handle = coord.speak(speaker(), "hi", options).await.unwrap();
    handle.cancel();
    handle.cancel();
    coord.stop(&speaker()).await.unwrap();
    timeout(WAIT, handle.finished()).await.unwrap();
    coord.shutdown().await;

    assert_eq!(starts.load(Ordering::SeqCst), 1);
    assert_eq!(finishes.load(Ordering::SeqCst), 1);
    assert_eq!(errors.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn completion_resets_the_mouth_to_baseline() {
    let mut config = config();
    config.animation.form_baseline = 0.2;
    let synth = ScriptedSynthesizer::default().with("hi", vec![Step::Tone(400)]);
    let journal = Journal::default();
    let coord = coordinator_with(config, synth, &journal);

    let handle = coord
        .speak(speaker(), "hi", journal.options("hi").expression("smile"))
        .await
        .unwrap();
    timeout(WAIT, handle.finished()).await.unwrap();

    let entries = journal.entries();
    let mouths: Vec<MouthFrame> = entries
        .iter()
        .filter_map(|e| match e {
            Entry::Mouth(frame) => Some(*frame),
            _ => None,
        })
        .collect();
    assert!(mouths.len() >= 3, "only {} frames", mouths.len());
    assert!(mouths.iter().any(|m| m.openness > 0.2));
    assert!(
        mouths
            .iter()
            .all(|m| (0.0..=1.0).contains(&m.openness) && (-1.0..=1.0).contains(&m.form))
    );
    assert_eq!(*mouths.last().unwrap(), MouthFrame::neutral(0.2));

    let expressions = entries
        .iter()
        .filter(|e| matches!(e, Entry::Expression(_)))
        .count();
    assert_eq!(expressions, 1);
    let finish = journal
        .position(&Entry::Finish("hi", UtteranceState::Completed))
        .unwrap();
    assert!(
        entries[finish..]
            .iter()
            .all(|e| !matches!(e, Entry::Mouth(_)))
    );
}

// ────────────────────────────────────────────────────────────────────────────
// Failures
// ────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn burst_longer_than_the_schedule_queue_completes() {
    let synth = ScriptedSynthesizer::default().with("burst", vec![Step::Tone(10); 300]);
    let journal = Journal::default();
    let coord = coordinator(synth, &journal);
    assert!(coord.config().playback.max_queued_fragments < 300);

    let handle = coord
        .speak(speaker(), "burst", journal.options("burst"))
        .await
        .unwrap();
    let outcome = timeout(WAIT, handle.finished()).await.unwrap();
    assert!(outcome.is_completed(), "outcome {outcome:?}");
    assert!(
        !journal
            .entries()
            .iter()
            .any(|e| matches!(e, Entry::Error(..)))
    );
}

#[tokio::test]
async fn synthesis_error_fails_but_lets_queued_audio_finish() {
    let synth = ScriptedSynthesizer::default().with(
        "five",
        vec![
            Step::Tone(400),
            Step::Tone(400),
            Step::Fail("voice model crashed"),
            Step::Tone(400),
            Step::Tone(400),
        ],
    );
    let journal = Journal::default();
    let coord = coordinator(synth, &journal);

    let handle = coord
        .speak(speaker(), "five", journal.options("five"))
        .await
        .unwrap();
    let outcome = timeout(WAIT, handle.finished()).await.unwrap();
    let UtteranceOutcome::Failed(err) = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert!(matches!(*err, SpeechError::Synthesis(_)));

    // Already-scheduled fragments keep playing. Give the output clock a
    // few blocks so the analysis window holds real samples.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!coord.signal(&speaker()).is_silent());
    tokio::time::sleep(Duration::from_millis(1_000)).await;
    assert!(coord.signal(&speaker()).is_silent());

    let entries = journal.entries();
    assert!(entries.contains(&Entry::Error(
        "five",
        "synthesis error: voice model crashed".into()
    )));
    assert!(!entries.iter().any(|e| matches!(e, Entry::Finish("five", _))));

    // The speaker is still usable.
    let next = coord
        .speak(speaker(), "again", journal.options("again"))
        .await
        .unwrap();
    assert!(timeout(WAIT, next.finished()).await.unwrap().is_completed());
}

#[tokio::test]
async fn undecodable_fragment_is_skipped() {
    let synth = ScriptedSynthesizer::default().with(
        "mixed",
        vec![Step::Tone(150), Step::Garbage, Step::Tone(150)],
    );
    let journal = Journal::default();
    let (runtime_tx, mut runtime_rx) = broadcast::channel(4_096);
    let coord = Arc::new(
        UtteranceCoordinator::new(config(), Arc::new(synth), Arc::new(journal.clone()))
            .with_runtime_events(runtime_tx),
    );

    let handle = coord.speak(speaker(), "mixed", SpeakOptions::new()).await.unwrap();
    assert!(timeout(WAIT, handle.finished()).await.unwrap().is_completed());

    let mut dropped = 0;
    let mut states = Vec::new();
    while let Ok(event) = runtime_rx.try_recv() {
        match event {
            RuntimeEvent::FragmentDropped { .. } => dropped += 1,
            RuntimeEvent::UtteranceState { state, .. } => states.push(state),
            _ => {}
        }
    }
    assert_eq!(dropped, 1);
    assert_eq!(
        states,
        vec![
            UtteranceState::Requested,
            UtteranceState::Streaming,
            UtteranceState::Draining,
            UtteranceState::Completed,
        ]
    );
}

#[tokio::test]
async fn decode_failure_ratio_is_configurable() {
    let mut config = config();
    config.utterance.max_decode_failure_ratio = Some(0.25);
    let synth = ScriptedSynthesizer::default().with(
        "mixed",
        vec![Step::Tone(100), Step::Garbage, Step::Tone(100)],
    );
    let journal = Journal::default();
    let coord = coordinator_with(config, synth, &journal);

    let handle = coord.speak(speaker(), "mixed", SpeakOptions::new()).await.unwrap();
    let outcome = timeout(WAIT, handle.finished()).await.unwrap();
    assert!(matches!(outcome.error(), Some(SpeechError::FragmentDecode(_))));
}

#[tokio::test]
async fn only_garbage_fails_the_utterance() {
    let synth = ScriptedSynthesizer::default().with("bad", vec![Step::Garbage, Step::Garbage]);
    let journal = Journal::default();
    let coord = coordinator(synth, &journal);

    let handle = coord
        .speak(speaker(), "bad", journal.options("bad"))
        .await
        .unwrap();
    let outcome = timeout(WAIT, handle.finished()).await.unwrap();
    assert!(matches!(outcome.error(), Some(SpeechError::FragmentDecode(_))));
    assert!(!journal.entries().contains(&Entry::Start("bad")));
}

#[tokio::test]
async fn missing_output_device_fails_with_init_error() {
    let mut config = config();
    config.audio.backend = OutputBackend::Cpal;
    config.audio.output_device = Some("fae-lipsync-no-such-device".into());
    let journal = Journal::default();
    let coord = coordinator_with(config, ScriptedSynthesizer::default(), &journal);

    let handle = coord
        .speak(speaker(), "hello", journal.options("hello"))
        .await
        .unwrap();
    let outcome = timeout(WAIT, handle.finished()).await.unwrap();
    assert!(matches!(outcome.error(), Some(SpeechError::AudioInit(_))));
    assert!(
        journal
            .entries()
            .iter()
            .any(|e| matches!(e, Entry::Error("hello", _)))
    );
}

#[tokio::test]
async fn empty_text_is_invalid() {
    let journal = Journal::default();
    let coord = coordinator(ScriptedSynthesizer::default(), &journal);
    let result = coord.speak(speaker(), "", journal.options("empty")).await;
    assert!(matches!(result, Err(SpeechError::InvalidArgument(_))));
    assert_eq!(journal.entries().len(), 1);
}

#[tokio::test]
async fn speakers_are_independent() {
    let synth = ScriptedSynthesizer::default().with("long", vec![Step::Tone(600)]);
    let journal = Journal::default();
    let coord = coordinator(synth, &journal);

    let a = coord
        .speak(SpeakerId::from("a"), "long", SpeakOptions::new())
        .await
        .unwrap();
    let b = coord
        .speak(SpeakerId::from("b"), "long", SpeakOptions::new())
        .await
        .unwrap();
    assert!(timeout(WAIT, a.finished()).await.unwrap().is_completed());
    assert!(timeout(WAIT, b.finished()).await.unwrap().is_completed());

    let mut active = coord.speakers_active();
    active.sort_by(|x, y| x.as_str().cmp(y.as_str()));
    assert_eq!(active, vec![SpeakerId::from("a"), SpeakerId::from("b")]);
}
