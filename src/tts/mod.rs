//! Speech synthesis seam.
//!
//! The coordinator does not synthesize audio itself. It hands each
//! utterance to a [`SpeechSynthesizer`], which pushes fragments through a
//! [`FragmentSender`] as they become ready. [`SentenceSynthesizer`] adapts
//! a blocking, whole-sentence voice into that streaming shape.

use crate::audio::fragment::AudioFragment;
use crate::error::{Result, SpeechError};
use crate::pipeline::messages::{SynthesisEvent, SynthesisEventKind};
use crate::pipeline::utterance::UtteranceId;
use crate::viseme::estimate_timings;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// What to say, and how.
#[derive(Debug, Clone)]
pub struct SynthesisRequest {
    pub utterance: UtteranceId,
    pub text: String,
    pub voice: Option<String>,
    /// Speed multiplier, already clamped by the coordinator.
    pub speed: f32,
}

/// Delivers fragments for one utterance to its coordinator.
///
/// Every event is stamped with the utterance id; once the coordinator has
/// moved on, sends fail and the producer should stop.
#[derive(Debug, Clone)]
pub struct FragmentSender {
    utterance: UtteranceId,
    tx: mpsc::Sender<SynthesisEvent>,
}

impl FragmentSender {
    pub(crate) fn new(utterance: UtteranceId, tx: mpsc::Sender<SynthesisEvent>) -> Self {
        Self { utterance, tx }
    }

    pub fn utterance(&self) -> UtteranceId {
        self.utterance
    }

    /// True once the coordinator no longer listens for this utterance.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Push the next fragment, in playback order.
    ///
    /// # Errors
    ///
    /// Returns [`SpeechError::Channel`] if the utterance was cancelled or
    /// replaced.
    pub async fn send(&self, fragment: AudioFragment) -> Result<()> {
        self.emit(SynthesisEventKind::Fragment(fragment)).await
    }

    pub(crate) async fn emit(&self, kind: SynthesisEventKind) -> Result<()> {
        self.tx
            .send(SynthesisEvent {
                utterance: self.utterance,
                kind,
            })
            .await
            .map_err(|_| {
                SpeechError::Channel(format!(
                    "utterance {} no longer accepts fragments",
                    self.utterance
                ))
            })
    }
}

/// Produces audio fragments for an utterance.
///
/// Implementations send fragments in order and return `Ok(())` once all
/// have been sent. Returning an error reports a synthesis failure; the
/// fragments already sent keep playing.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, request: SynthesisRequest, fragments: FragmentSender) -> Result<()>;
}

/// Audio rendered for one chunk of text.
#[derive(Debug, Clone)]
pub struct RenderedSpeech {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    /// Space-separated ARPABET phonemes, when the voice knows them.
    pub phonemes: Option<String>,
}

/// A blocking text-to-speech voice that renders one chunk at a time.
pub trait SentenceVoice: Send + Sync + 'static {
    /// # Errors
    ///
    /// Returns an error if the chunk cannot be rendered.
    fn render(&self, text: &str, voice: Option<&str>, speed: f32) -> Result<RenderedSpeech>;
}

/// Streams a [`SentenceVoice`] sentence by sentence.
///
/// Each chunk is rendered on the blocking pool and sent as soon as it is
/// ready, so playback of the first sentence overlaps rendering of the rest.
pub struct SentenceSynthesizer<V> {
    voice: Arc<V>,
}

impl<V: SentenceVoice> SentenceSynthesizer<V> {
    pub fn new(voice: V) -> Self {
        Self {
            voice: Arc::new(voice),
        }
    }
}

#[async_trait]
impl<V: SentenceVoice> SpeechSynthesizer for SentenceSynthesizer<V> {
    async fn synthesize(&self, request: SynthesisRequest, fragments: FragmentSender) -> Result<()> {
        let chunks = split_speech_chunks(&request.text);
        info!(utterance = %request.utterance, chunks = chunks.len(), "synthesizing");

        for chunk in chunks {
            if fragments.is_closed() {
                debug!(utterance = %request.utterance, "utterance gone, stopping synthesis");
                return Ok(());
            }

            let voice = Arc::clone(&self.voice);
            let name = request.voice.clone();
            let speed = request.speed;
            let rendered = tokio::task::spawn_blocking(move || {
                voice.render(&chunk, name.as_deref(), speed)
            })
            .await
            .map_err(|e| SpeechError::Synthesis(format!("render task failed: {e}")))??;

            if rendered.samples.is_empty() || rendered.sample_rate == 0 {
                continue;
            }
            let duration =
                Duration::from_secs_f64(rendered.samples.len() as f64 / f64::from(rendered.sample_rate));
            let mut fragment =
                AudioFragment::pcm(rendered.samples, rendered.sample_rate).with_duration_hint(duration);
            if let Some(phonemes) = rendered.phonemes {
                fragment = fragment.with_timings(estimate_timings(&phonemes, speed));
            }

            if fragments.send(fragment).await.is_err() {
                return Ok(());
            }
        }
        Ok(())
    }
}

/// Minimum chunk length (bytes) before splitting on clause punctuation.
const CLAUSE_MIN_LEN: usize = 20;

/// Sentences longer than this are further split at clause punctuation.
const LONG_SENTENCE_LEN: usize = 160;

/// Split text into speakable chunks: one per sentence, with long
/// sentences broken at their last clause boundary.
pub fn split_speech_chunks(text: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut rest = text.trim();

    while !rest.is_empty() {
        let end = match find_sentence_boundary(rest) {
            Some(pos) if pos < LONG_SENTENCE_LEN => pos,
            Some(pos) => find_clause_boundary(&rest[..=pos]).unwrap_or(pos),
            None if rest.len() > LONG_SENTENCE_LEN => {
                find_clause_boundary(rest).unwrap_or(rest.len() - 1)
            }
            None => rest.len() - 1,
        };
        // `end` is the last byte of a char, so both slices are char-aligned.
        let (head, tail) = rest.split_at(end + 1);
        let head = head.trim();
        if !head.is_empty() {
            chunks.push(head.to_owned());
        }
        rest = tail.trim_start();
    }
    chunks
}

/// Byte index of the first sentence-ending punctuation that is followed by
/// whitespace or the end of the text.
fn find_sentence_boundary(text: &str) -> Option<usize> {
    for (i, c) in text.char_indices() {
        if matches!(c, '.' | '!' | '?' | '\n' | '。' | '！' | '？') {
            let rest = &text[i + c.len_utf8()..];
            let cjk = !c.is_ascii();
            if cjk || rest.is_empty() || rest.starts_with(char::is_whitespace) {
                return Some(i + c.len_utf8() - 1);
            }
        }
    }
    None
}

/// Last byte of the last clause punctuation in `text`, if `text` is long
/// enough to be worth splitting.
fn find_clause_boundary(text: &str) -> Option<usize> {
    if text.len() < CLAUSE_MIN_LEN {
        return None;
    }
    let mut last_clause = None;
    for (i, c) in text.char_indices() {
        if matches!(c, ',' | ';' | ':' | '\u{2014}' | '\u{2013}' | '、') {
            let rest = &text[i + c.len_utf8()..];
            // A clause mark at the very end is the sentence end, not a split.
            if !rest.is_empty() && (rest.starts_with(' ') || !c.is_ascii()) {
                last_clause = Some(i + c.len_utf8() - 1);
            }
        }
    }
    last_clause
}
