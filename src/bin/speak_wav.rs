//! Diagnostic harness: stream a WAV file through the utterance coordinator
//! as if a synthesizer had produced it, and print a JSON report.
//!
//! ```text
//! fae-lipsync-harness <input.wav> [--backend cpal|virtual|manual]
//!     [--fragment-ms N] [--pace-ms N] [--config PATH] [--out PATH]
//! ```

use anyhow::{Context, bail};
use async_trait::async_trait;
use fae_lipsync::{
    AudioFragment, FragmentSender, LipSyncConfig, MouthFrame, OutputBackend, RuntimeEvent,
    SpeakOptions, SpeakerId, SpeechSynthesizer, SynthesisRequest, UtteranceCoordinator,
    UtteranceOutcome,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

struct Args {
    input: PathBuf,
    backend: Option<OutputBackend>,
    fragment_ms: u64,
    pace_ms: u64,
    config: Option<PathBuf>,
    out: Option<PathBuf>,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = std::env::args().skip(1);
    let mut input = None;
    let mut parsed = Args {
        input: PathBuf::new(),
        backend: None,
        fragment_ms: 250,
        pace_ms: 0,
        config: None,
        out: None,
    };
    while let Some(arg) = args.next() {
        let mut value = |name: &str| args.next().with_context(|| format!("{name} needs a value"));
        match arg.as_str() {
            "--backend" => {
                parsed.backend = Some(match value("--backend")?.as_str() {
                    "cpal" => OutputBackend::Cpal,
                    "virtual" => OutputBackend::Virtual,
                    "manual" => OutputBackend::Manual,
                    other => bail!("unknown backend: {other}"),
                });
            }
            "--fragment-ms" => parsed.fragment_ms = value("--fragment-ms")?.parse()?,
            "--pace-ms" => parsed.pace_ms = value("--pace-ms")?.parse()?,
            "--config" => parsed.config = Some(value("--config")?.into()),
            "--out" => parsed.out = Some(value("--out")?.into()),
            other if input.is_none() && !other.starts_with("--") => input = Some(other.into()),
            other => bail!("unexpected argument: {other}"),
        }
    }
    parsed.input = input.context("usage: fae-lipsync-harness <input.wav> [options]")?;
    if parsed.fragment_ms == 0 {
        bail!("--fragment-ms must be positive");
    }
    Ok(parsed)
}

/// Replays pre-cut fragments, optionally pausing between them to mimic a
/// slow producer.
struct ScriptedSynthesizer {
    fragments: Vec<AudioFragment>,
    pace: Duration,
}

#[async_trait]
impl SpeechSynthesizer for ScriptedSynthesizer {
    async fn synthesize(
        &self,
        _request: SynthesisRequest,
        out: FragmentSender,
    ) -> fae_lipsync::Result<()> {
        for fragment in &self.fragments {
            if !self.pace.is_zero() {
                tokio::time::sleep(self.pace).await;
            }
            out.send(fragment.clone()).await?;
        }
        Ok(())
    }
}

fn read_fragments(args: &Args) -> anyhow::Result<(Vec<AudioFragment>, u32, usize)> {
    let mut reader = hound::WavReader::open(&args.input)
        .with_context(|| format!("failed to open {}", args.input.display()))?;
    let spec = reader.spec();
    let channels = usize::from(spec.channels.max(1));
    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
        hound::SampleFormat::Int => {
            let scale = (1_i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()?
        }
    };
    let mono: Vec<f32> = interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect();

    let per_fragment = (u64::from(spec.sample_rate) * args.fragment_ms / 1000).max(1) as usize;
    let fragments = mono
        .chunks(per_fragment)
        .map(|chunk| AudioFragment::pcm(chunk.to_vec(), spec.sample_rate))
        .collect();
    Ok((fragments, spec.sample_rate, mono.len()))
}

#[derive(Debug, Serialize)]
struct WindowReport {
    fragment: u64,
    start_ms: f64,
    duration_ms: f64,
}

#[derive(Debug, Serialize)]
struct Report {
    input: String,
    backend: String,
    input_sample_rate: u32,
    input_duration_ms: f64,
    fragments_sent: usize,
    fragments_dropped: usize,
    windows: Vec<WindowReport>,
    mouth_frames: usize,
    max_openness: f32,
    started_after_ms: f64,
    finished_after_ms: f64,
    outcome: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("fae_lipsync=info")),
        )
        .init();

    if let Err(e) = run().await {
        eprintln!("fae-lipsync-harness failed: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let args = parse_args()?;
    let mut config = match &args.config {
        Some(path) => LipSyncConfig::from_file(path)?,
        None => LipSyncConfig::default(),
    };
    if let Some(backend) = args.backend {
        config.audio.backend = backend;
    }
    let backend = config.audio.backend;
    if args.out.is_some() && backend != OutputBackend::Manual {
        bail!("--out needs the manual backend");
    }

    let (fragments, input_rate, input_frames) = read_fragments(&args)?;
    let fragments_sent = fragments.len();

    let frames: Arc<Mutex<Vec<MouthFrame>>> = Arc::new(Mutex::new(Vec::new()));
    let captured = Arc::clone(&frames);
    let sink = move |_: &SpeakerId, frame: MouthFrame| {
        if let Ok(mut frames) = captured.lock() {
            frames.push(frame);
        }
    };

    let (runtime_tx, mut runtime_rx) = broadcast::channel(16_384);
    let synthesizer = ScriptedSynthesizer {
        fragments,
        pace: Duration::from_millis(args.pace_ms),
    };
    let coordinator = UtteranceCoordinator::new(config, Arc::new(synthesizer), Arc::new(sink))
        .with_runtime_events(runtime_tx);
    let output_rate = coordinator.config().audio.output_sample_rate;
    let block_frames = coordinator.config().audio.block_frames as usize;

    let speaker = SpeakerId::from("harness");
    let began = Instant::now();
    let handle = coordinator
        .speak(speaker.clone(), args.input.display().to_string(), SpeakOptions::new())
        .await?;
    let started_after = began.elapsed();

    let mut rendered = Vec::new();
    let outcome = if backend == OutputBackend::Manual {
        let mut block = vec![0.0; block_frames];
        loop {
            if let Some(outcome) = handle.outcome() {
                break outcome;
            }
            coordinator.render_offline(&speaker, &mut block)?;
            rendered.extend_from_slice(&block);
            tokio::task::yield_now().await;
        }
    } else {
        handle.finished().await
    };
    let finished_after = began.elapsed();
    coordinator.shutdown().await;

    let mut windows = Vec::new();
    let mut fragments_dropped = 0;
    loop {
        let event = match runtime_rx.try_recv() {
            Ok(event) => event,
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "runtime events lagged, report is partial");
                continue;
            }
            Err(_) => break,
        };
        match event {
            RuntimeEvent::FragmentScheduled {
                fragment,
                start,
                duration,
                ..
            } => windows.push(WindowReport {
                fragment: fragment.0,
                start_ms: start.as_secs_f64() * 1000.0,
                duration_ms: duration.as_secs_f64() * 1000.0,
            }),
            RuntimeEvent::FragmentDropped { .. } => fragments_dropped += 1,
            _ => {}
        }
    }

    if let Some(path) = &args.out {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: output_rate,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut writer = hound::WavWriter::create(path, spec)
            .with_context(|| format!("failed to create {}", path.display()))?;
        for sample in &rendered {
            writer.write_sample(*sample)?;
        }
        writer.finalize()?;
    }

    let frames = frames.lock().map(|f| f.clone()).unwrap_or_default();
    let report = Report {
        input: args.input.display().to_string(),
        backend: format!("{backend:?}").to_lowercase(),
        input_sample_rate: input_rate,
        input_duration_ms: input_frames as f64 * 1000.0 / f64::from(input_rate.max(1)),
        fragments_sent,
        fragments_dropped,
        windows,
        mouth_frames: frames.len(),
        max_openness: frames.iter().map(|f| f.openness).fold(0.0, f32::max),
        started_after_ms: started_after.as_secs_f64() * 1000.0,
        finished_after_ms: finished_after.as_secs_f64() * 1000.0,
        outcome: match &outcome {
            UtteranceOutcome::Completed => "completed".to_owned(),
            UtteranceOutcome::Cancelled => "cancelled".to_owned(),
            UtteranceOutcome::Failed(e) => format!("failed: {e}"),
        },
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
