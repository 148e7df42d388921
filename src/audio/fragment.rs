//! Audio fragments produced by the synthesis collaborator.
//!
//! A fragment is immutable once built and is consumed exactly once by the
//! playback engine, which decodes it to mono f32 at the output rate.

use crate::error::{Result, SpeechError};
use std::sync::Arc;
use std::time::Duration;

/// Raw audio carried by a fragment before decoding.
#[derive(Debug, Clone)]
pub enum FragmentPayload {
    /// Mono f32 samples in `[-1, 1]`.
    Pcm { samples: Vec<f32>, sample_rate: u32 },
    /// Mono signed 16-bit samples.
    Pcm16 { samples: Vec<i16>, sample_rate: u32 },
    /// An encoded WAV file (any channel count; downmixed to mono).
    Wav(Vec<u8>),
}

/// A phoneme and the window it occupies, relative to the fragment start.
#[derive(Debug, Clone, PartialEq)]
pub struct PhonemeTiming {
    /// ARPABET phoneme, stress markers allowed (e.g. `AA1`).
    pub phoneme: String,
    pub start: Duration,
    pub duration: Duration,
}

impl PhonemeTiming {
    pub fn new(phoneme: impl Into<String>, start: Duration, duration: Duration) -> Self {
        Self {
            phoneme: phoneme.into(),
            start,
            duration,
        }
    }

    /// Whether `offset` falls inside this phoneme's window.
    pub fn covers(&self, offset: Duration) -> bool {
        offset >= self.start
            && self
                .start
                .checked_add(self.duration)
                .is_some_and(|end| offset < end)
    }
}

/// One chunk of synthesized speech.
#[derive(Debug, Clone)]
pub struct AudioFragment {
    payload: FragmentPayload,
    duration_hint: Option<Duration>,
    timings: Arc<[PhonemeTiming]>,
}

impl AudioFragment {
    /// Mono f32 samples at `sample_rate`.
    pub fn pcm(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self::from_payload(FragmentPayload::Pcm {
            samples,
            sample_rate,
        })
    }

    /// Mono 16-bit samples at `sample_rate`.
    pub fn pcm16(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self::from_payload(FragmentPayload::Pcm16 {
            samples,
            sample_rate,
        })
    }

    /// Encoded WAV bytes.
    pub fn wav(bytes: Vec<u8>) -> Self {
        Self::from_payload(FragmentPayload::Wav(bytes))
    }

    pub fn from_payload(payload: FragmentPayload) -> Self {
        Self {
            payload,
            duration_hint: None,
            timings: Arc::from(Vec::new()),
        }
    }

    /// Attach the producer's duration estimate. Informational only; the
    /// engine schedules by the decoded length.
    pub fn with_duration_hint(mut self, hint: Duration) -> Self {
        self.duration_hint = Some(hint);
        self
    }

    /// Attach phoneme timings relative to the start of this fragment.
    pub fn with_timings(mut self, timings: Vec<PhonemeTiming>) -> Self {
        self.timings = Arc::from(timings);
        self
    }

    pub fn payload(&self) -> &FragmentPayload {
        &self.payload
    }

    pub fn duration_hint(&self) -> Option<Duration> {
        self.duration_hint
    }

    pub fn timings(&self) -> &[PhonemeTiming] {
        &self.timings
    }

    pub(crate) fn shared_timings(&self) -> Arc<[PhonemeTiming]> {
        Arc::clone(&self.timings)
    }

    /// Decode to mono f32 at `output_rate`, consuming the fragment.
    ///
    /// # Errors
    ///
    /// Returns [`SpeechError::FragmentDecode`] if the payload is malformed,
    /// empty, or contains non-finite samples.
    pub(crate) fn decode(self, output_rate: u32) -> Result<Vec<f32>> {
        let (samples, source_rate) = match self.payload {
            FragmentPayload::Pcm {
                samples,
                sample_rate,
            } => (samples, sample_rate),
            FragmentPayload::Pcm16 {
                samples,
                sample_rate,
            } => (
                samples
                    .into_iter()
                    .map(|s| f32::from(s) / 32_768.0)
                    .collect(),
                sample_rate,
            ),
            FragmentPayload::Wav(bytes) => decode_wav(&bytes)?,
        };

        if source_rate == 0 {
            return Err(SpeechError::FragmentDecode(
                "fragment sample rate is zero".into(),
            ));
        }
        if samples.is_empty() {
            return Err(SpeechError::FragmentDecode(
                "fragment contains no samples".into(),
            ));
        }
        if let Some(pos) = samples.iter().position(|s| !s.is_finite()) {
            return Err(SpeechError::FragmentDecode(format!(
                "non-finite sample at index {pos}"
            )));
        }

        let samples = resample_linear(&samples, source_rate, output_rate);
        if samples.is_empty() {
            return Err(SpeechError::FragmentDecode(format!(
                "fragment too short to resample from {source_rate}Hz to {output_rate}Hz"
            )));
        }

        Ok(samples)
    }
}

fn decode_wav(bytes: &[u8]) -> Result<(Vec<f32>, u32)> {
    let reader = hound::WavReader::new(std::io::Cursor::new(bytes))
        .map_err(|e| SpeechError::FragmentDecode(format!("invalid WAV payload: {e}")))?;
    let spec = reader.spec();
    let channels = usize::from(spec.channels.max(1));

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| SpeechError::FragmentDecode(format!("corrupt WAV samples: {e}")))?,
        hound::SampleFormat::Int => {
            let scale = (1_i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| SpeechError::FragmentDecode(format!("corrupt WAV samples: {e}")))?
        }
    };

    let mono = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    };
    Ok((mono, spec.sample_rate))
}

/// Linear-interpolation resampler for mono audio.
pub(crate) fn resample_linear(samples: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
    if src_rate == dst_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = f64::from(src_rate) / f64::from(dst_rate);
    let out_len = (samples.len() as f64 / ratio) as usize;
    let mut output = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let src_pos = i as f64 * ratio;
        let idx = src_pos as usize;
        let frac = src_pos - idx as f64;

        let sample = if idx + 1 < samples.len() {
            f64::from(samples[idx]) * (1.0 - frac) + f64::from(samples[idx + 1]) * frac
        } else {
            f64::from(samples[idx.min(samples.len() - 1)])
        };

        output.push(sample as f32);
    }

    output
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn timing_window_is_half_open_and_saturates() {
        let t = PhonemeTiming::new("AA", Duration::from_millis(100), Duration::from_millis(50));
        assert!(!t.covers(Duration::from_millis(99)));
        assert!(t.covers(Duration::from_millis(100)));
        assert!(!t.covers(Duration::from_millis(150)));

        let huge = PhonemeTiming::new("AA", Duration::MAX, Duration::MAX);
        assert!(!huge.covers(Duration::MAX));
        assert!(!huge.covers(Duration::ZERO));
    }

    fn wav_bytes(channels: u16, sample_rate: u32, frames: &[i16]) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for s in frames {
                writer.write_sample(*s).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn pcm_at_output_rate_is_passed_through() {
        let decoded = AudioFragment::pcm(vec![0.1, -0.2, 0.3], 24_000)
            .decode(24_000)
            .unwrap();
        assert_eq!(decoded, vec![0.1, -0.2, 0.3]);
    }

    #[test]
    fn pcm16_is_normalised() {
        let decoded = AudioFragment::pcm16(vec![16_384, -32_768], 24_000)
            .decode(24_000)
            .unwrap();
        assert!((decoded[0] - 0.5).abs() < 1e-6);
        assert!((decoded[1] + 1.0).abs() < 1e-6);
    }

    #[test]
    fn stereo_wav_is_downmixed() {
        let bytes = wav_bytes(2, 24_000, &[16_384, 0, 16_384, 0]);
        let decoded = AudioFragment::wav(bytes).decode(24_000).unwrap();
        assert_eq!(decoded.len(), 2);
        assert!((decoded[0] - 0.25).abs() < 1e-4);
    }

    #[test]
    fn wav_is_resampled_to_output_rate() {
        let bytes = wav_bytes(1, 48_000, &[1_000; 4_800]);
        let decoded = AudioFragment::wav(bytes).decode(24_000).unwrap();
        assert_eq!(decoded.len(), 2_400);
    }

    #[test]
    fn garbage_wav_is_decode_error() {
        let err = AudioFragment::wav(b"definitely not RIFF".to_vec())
            .decode(24_000)
            .unwrap_err();
        assert!(matches!(err, SpeechError::FragmentDecode(_)));
    }

    #[test]
    fn empty_and_non_finite_fragments_are_rejected() {
        assert!(matches!(
            AudioFragment::pcm(Vec::new(), 24_000).decode(24_000),
            Err(SpeechError::FragmentDecode(_))
        ));
        assert!(matches!(
            AudioFragment::pcm(vec![0.0, f32::NAN], 24_000).decode(24_000),
            Err(SpeechError::FragmentDecode(_))
        ));
        assert!(matches!(
            AudioFragment::pcm(vec![0.0], 0).decode(24_000),
            Err(SpeechError::FragmentDecode(_))
        ));
    }

    #[test]
    fn timings_are_shared_not_copied() {
        let fragment = AudioFragment::pcm(vec![0.0; 240], 24_000).with_timings(vec![
            PhonemeTiming::new("AA1", Duration::ZERO, Duration::from_millis(10)),
        ]);
        let shared = fragment.shared_timings();
        assert_eq!(shared.len(), 1);
        assert!(shared[0].covers(Duration::from_millis(5)));
        assert!(!shared[0].covers(Duration::from_millis(10)));
        assert_eq!(fragment.decode(24_000).unwrap().len(), 240);
    }

    #[test]
    fn resample_same_rate_is_identity() {
        let samples = vec![0.1, 0.2, 0.3];
        assert_eq!(resample_linear(&samples, 16_000, 16_000), samples);
    }

    #[test]
    fn resample_upsamples_by_ratio() {
        let out = resample_linear(&[0.0, 1.0], 12_000, 24_000);
        assert_eq!(out.len(), 4);
        assert!((out[1] - 0.5).abs() < 1e-6);
    }
}
