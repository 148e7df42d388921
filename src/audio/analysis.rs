//! Live analysis tap over the engine's output.
//!
//! The schedule writes every rendered (pre-gain) sample into an
//! [`AnalysisRing`]. A [`SignalTap`] snapshots the ring on demand and runs
//! one windowed FFT to produce a [`Signal`]: RMS, peak, and coarse
//! per-band energy used to shape the mouth.

use super::schedule::SharedSchedule;
use rustfft::num_complex::Complex32;
use rustfft::{Fft, FftPlanner};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Number of frequency bands reported in [`Signal::bands`].
pub const BAND_COUNT: usize = 4;

/// Band edges in Hz: low voicing, first formant, second formant, sibilance.
pub const BAND_EDGES_HZ: [f32; BAND_COUNT + 1] = [80.0, 300.0, 1_000.0, 3_000.0, 8_000.0];

/// Which fragment is under the playhead and how far into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Playhead {
    pub fragment: super::FragmentId,
    pub offset: Duration,
}

/// Instantaneous measurement of the audio currently playing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Signal {
    /// Root-mean-square amplitude over the analysis window.
    pub rms: f32,
    /// Largest absolute sample in the window.
    pub peak: f32,
    /// Approximate RMS per band in [`BAND_EDGES_HZ`].
    pub bands: [f32; BAND_COUNT],
    pub playhead: Option<Playhead>,
}

impl Signal {
    pub const fn silence() -> Self {
        Self {
            rms: 0.0,
            peak: 0.0,
            bands: [0.0; BAND_COUNT],
            playhead: None,
        }
    }

    pub fn is_silent(&self) -> bool {
        self.peak == 0.0
    }

    /// Share of band energy above 1 kHz, in `[0, 1]`. Zero when silent.
    pub fn brightness(&self) -> f32 {
        let low = self.bands[0] + self.bands[1];
        let high = self.bands[2] + self.bands[3];
        let total = low + high;
        if total <= f32::EPSILON {
            0.0
        } else {
            (high / total).clamp(0.0, 1.0)
        }
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::silence()
    }
}

/// Fixed-size ring of the most recent output samples.
#[derive(Debug)]
pub(crate) struct AnalysisRing {
    buf: Vec<f32>,
    write: usize,
    filled: usize,
}

impl AnalysisRing {
    pub fn new(len: usize) -> Self {
        Self {
            buf: vec![0.0; len.max(1)],
            write: 0,
            filled: 0,
        }
    }

    pub fn push(&mut self, sample: f32) {
        self.buf[self.write] = sample;
        self.write = (self.write + 1) % self.buf.len();
        self.filled = (self.filled + 1).min(self.buf.len());
    }

    pub fn clear(&mut self) {
        self.buf.iter_mut().for_each(|s| *s = 0.0);
        self.write = 0;
        self.filled = 0;
    }

    /// Samples oldest to newest, zero-padded at the front until full.
    pub fn snapshot(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.buf.len());
        out.extend_from_slice(&self.buf[self.write..]);
        out.extend_from_slice(&self.buf[..self.write]);
        out
    }
}

/// Windowed FFT over the analysis window.
pub(crate) struct SpectrumAnalyser {
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    window_power: f32,
    sample_rate: u32,
}

impl SpectrumAnalyser {
    pub fn new(len: usize, sample_rate: u32) -> Self {
        let len = len.max(2);
        let fft = FftPlanner::<f32>::new().plan_fft_forward(len);
        let window: Vec<f32> = (0..len)
            .map(|i| {
                0.5 - 0.5 * (2.0 * std::f32::consts::PI * i as f32 / (len - 1) as f32).cos()
            })
            .collect();
        let window_power = window.iter().map(|w| w * w).sum::<f32>().max(f32::EPSILON);
        Self {
            fft,
            window,
            window_power,
            sample_rate,
        }
    }

    pub fn analyse(&self, samples: &[f32], playhead: Option<Playhead>) -> Signal {
        if samples.is_empty() {
            return Signal::silence();
        }

        let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
        let rms = (sum_sq / samples.len() as f32).sqrt();
        let peak = samples.iter().fold(0.0_f32, |m, s| m.max(s.abs()));
        if peak == 0.0 {
            return Signal {
                playhead,
                ..Signal::silence()
            };
        }

        let n = self.window.len();
        let mut spectrum: Vec<Complex32> = (0..n)
            .map(|i| {
                let s = samples.get(i).copied().unwrap_or(0.0);
                Complex32::new(s * self.window[i], 0.0)
            })
            .collect();
        self.fft.process(&mut spectrum);

        let bin_hz = self.sample_rate as f32 / n as f32;
        let mut bands = [0.0_f32; BAND_COUNT];
        for (k, bin) in spectrum.iter().enumerate().take(n / 2).skip(1) {
            let freq = k as f32 * bin_hz;
            if let Some(b) = band_index(freq) {
                bands[b] += bin.norm_sqr();
            }
        }
        // One-sided Parseval: band power relative to the windowed signal.
        for band in &mut bands {
            *band = (2.0 * *band / (n as f32 * self.window_power)).sqrt();
        }

        Signal {
            rms,
            peak,
            bands,
            playhead,
        }
    }
}

fn band_index(freq: f32) -> Option<usize> {
    BAND_EDGES_HZ
        .windows(2)
        .position(|edge| freq >= edge[0] && freq < edge[1])
}

/// Handle to the engine's live analysis.
///
/// Holds only a weak reference to the schedule: once the engine is
/// disposed the tap reports silence instead of keeping the graph alive.
#[derive(Clone)]
pub struct SignalTap {
    schedule: Weak<SharedSchedule>,
    analyser: Arc<SpectrumAnalyser>,
}

impl SignalTap {
    pub(crate) fn new(schedule: &Arc<SharedSchedule>, analyser: Arc<SpectrumAnalyser>) -> Self {
        Self {
            schedule: Arc::downgrade(schedule),
            analyser,
        }
    }

    /// Current instantaneous signal. Silence when nothing is scheduled.
    pub fn read(&self) -> Signal {
        let Some(schedule) = self.schedule.upgrade() else {
            return Signal::silence();
        };
        let Some((samples, playhead)) = schedule.analysis_snapshot() else {
            return Signal::silence();
        };
        self.analyser.analyse(&samples, playhead)
    }

    /// Whether the engine behind this tap is still alive.
    pub fn is_live(&self) -> bool {
        self.schedule.strong_count() > 0
    }
}

impl std::fmt::Debug for SignalTap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalTap")
            .field("live", &self.is_live())
            .finish()
    }
}
