//! Configuration types for the playback engine and utterance coordinator.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::warn;

/// Top-level configuration, passed explicitly to the coordinator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LipSyncConfig {
    /// Output device and clock settings.
    pub audio: AudioConfig,
    /// Schedule queue and analysis settings.
    pub playback: PlaybackConfig,
    /// Signal-to-mouth mapping and update cadence.
    pub animation: AnimationConfig,
    /// Per-utterance defaults and failure policy.
    pub utterance: UtteranceConfig,
}

/// Which output graph drives the engine's clock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputBackend {
    /// System speakers via cpal.
    #[default]
    Cpal,
    /// Real-time paced render thread with no sound hardware.
    Virtual,
    /// No clock at all; audio is pulled with `render_offline`.
    Manual,
}

/// Audio output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Output backend.
    pub backend: OutputBackend,
    /// Output sample rate in Hz. Fragments at other rates are resampled.
    pub output_sample_rate: u32,
    /// Output device name (None = system default).
    pub output_device: Option<String>,
    /// Frames rendered per block by the virtual backend.
    pub block_frames: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            backend: OutputBackend::default(),
            output_sample_rate: 24_000,
            output_device: None,
            block_frames: 480,
        }
    }
}

/// Schedule queue and analysis tap configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Gain applied when the engine is first initialized (0.0–1.0).
    pub default_volume: f32,
    /// Number of most recent output samples the analysis tap looks at.
    ///
    /// Must be a power of two; 1024 samples is ~43 ms at 24 kHz.
    pub analysis_window: usize,
    /// Upper bound on fragments waiting in the schedule queue.
    ///
    /// A coordinator that reaches it stops reading from the synthesizer
    /// until a fragment finishes playing.
    pub max_queued_fragments: usize,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            default_volume: 0.8,
            analysis_window: 1024,
            max_queued_fragments: 256,
        }
    }
}

/// Lip-sync animation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnimationConfig {
    /// Mouth update cadence in Hz (clamped to 30–60).
    pub update_hz: u32,
    /// RMS level treated as silence.
    pub noise_floor: f32,
    /// Multiplier from RMS above the noise floor to mouth openness.
    pub sensitivity: f32,
    /// Mouth form value reported at rest.
    pub form_baseline: f32,
    /// Exponential smoothing factor (0 = none, 1 = frozen).
    pub smoothing: f32,
    /// Prefer phoneme timings over amplitude when fragments carry them.
    pub use_phoneme_timings: bool,
}

impl Default for AnimationConfig {
    fn default() -> Self {
        Self {
            update_hz: 30,
            noise_floor: 0.01,
            sensitivity: 4.0,
            form_baseline: 0.0,
            smoothing: 0.35,
            use_phoneme_timings: true,
        }
    }
}

/// Utterance defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UtteranceConfig {
    /// Speech speed used when the caller does not pass one.
    pub default_speed: f32,
    /// Lower clamp for caller-supplied speed.
    pub min_speed: f32,
    /// Upper clamp for caller-supplied speed.
    pub max_speed: f32,
    /// Fail the utterance when more than this share of fragments fail to
    /// decode. `None` fails only when no fragment could be scheduled.
    pub max_decode_failure_ratio: Option<f32>,
}

impl Default for UtteranceConfig {
    fn default() -> Self {
        Self {
            default_speed: 1.0,
            min_speed: 0.5,
            max_speed: 2.0,
            max_decode_failure_ratio: None,
        }
    }
}

impl LipSyncConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&content).map_err(|e| crate::error::SpeechError::Config(e.to_string()))?;
        Ok(config.validated())
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::SpeechError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `~/.config/fae/lipsync.toml`.
    pub fn default_config_path() -> PathBuf {
        if let Some(config) = std::env::var_os("XDG_CONFIG_HOME") {
            PathBuf::from(config).join("fae").join("lipsync.toml")
        } else if let Some(home) = dirs::home_dir() {
            home.join(".config").join("fae").join("lipsync.toml")
        } else {
            PathBuf::from("/tmp/fae-config/lipsync.toml")
        }
    }

    /// Clamp nonsensical values into their usable ranges.
    pub fn validated(mut self) -> Self {
        if self.audio.output_sample_rate == 0 {
            warn!("audio.output_sample_rate=0, using 24000");
            self.audio.output_sample_rate = AudioConfig::default().output_sample_rate;
        }
        if self.audio.block_frames == 0 {
            self.audio.block_frames = AudioConfig::default().block_frames;
        }

        self.playback.default_volume = clamp_unit(self.playback.default_volume, 0.8);
        if !self.playback.analysis_window.is_power_of_two() || self.playback.analysis_window < 64 {
            let fixed = self.playback.analysis_window.max(64).next_power_of_two();
            warn!(
                "playback.analysis_window={} is not a power of two >= 64, using {fixed}",
                self.playback.analysis_window
            );
            self.playback.analysis_window = fixed;
        }
        self.playback.max_queued_fragments = self.playback.max_queued_fragments.max(1);

        self.animation.update_hz = self.animation.update_hz.clamp(30, 60);
        self.animation.noise_floor = self.animation.noise_floor.max(0.0);
        if !self.animation.sensitivity.is_finite() || self.animation.sensitivity <= 0.0 {
            self.animation.sensitivity = AnimationConfig::default().sensitivity;
        }
        self.animation.form_baseline = if self.animation.form_baseline.is_finite() {
            self.animation.form_baseline.clamp(-1.0, 1.0)
        } else {
            0.0
        };
        self.animation.smoothing = clamp_unit(self.animation.smoothing, 0.0).min(0.95);

        let u = &mut self.utterance;
        if !(u.min_speed.is_finite() && u.min_speed > 0.0) {
            u.min_speed = UtteranceConfig::default().min_speed;
        }
        if !(u.max_speed.is_finite() && u.max_speed >= u.min_speed) {
            u.max_speed = u.min_speed.max(UtteranceConfig::default().max_speed);
        }
        if !u.default_speed.is_finite() {
            u.default_speed = 1.0;
        }
        u.default_speed = u.default_speed.clamp(u.min_speed, u.max_speed);
        u.max_decode_failure_ratio = u
            .max_decode_failure_ratio
            .filter(|r| r.is_finite())
            .map(|r| r.clamp(0.0, 1.0));

        self
    }
}

fn clamp_unit(value: f32, fallback: f32) -> f32 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        fallback
    }
}
