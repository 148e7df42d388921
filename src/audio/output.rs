//! Output backends that drive the schedule's clock.
//!
//! - `cpal`: system speakers. cpal streams are not `Send`, so the stream is
//!   built and owned by a dedicated thread that lives until `close()`.
//! - `virtual`: a paced thread that renders in real time into the void.
//!   Useful on headless hosts and for timing-dependent tests.
//! - `manual`: nothing renders on its own; the caller pulls audio through
//!   [`FragmentPlaybackEngine::render_offline`](super::playback::FragmentPlaybackEngine::render_offline).

use super::schedule::SharedSchedule;
use crate::config::{AudioConfig, OutputBackend};
use crate::error::{Result, SpeechError};
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// A running output graph.
pub(crate) trait OutputSink: Send {
    fn backend(&self) -> OutputBackend;

    /// Silence the device and release it. Idempotent.
    fn close(&mut self);
}

/// Open the configured backend and start pulling from `schedule`.
///
/// # Errors
///
/// Returns [`SpeechError::AudioInit`] if the device or render thread cannot
/// be created.
pub(crate) fn open(
    config: &AudioConfig,
    schedule: Arc<SharedSchedule>,
) -> Result<Box<dyn OutputSink>> {
    match config.backend {
        OutputBackend::Cpal => Ok(Box::new(CpalOutput::open(config, schedule)?)),
        OutputBackend::Virtual => Ok(Box::new(VirtualOutput::open(config, schedule)?)),
        OutputBackend::Manual => Ok(Box::new(ManualOutput)),
    }
}

/// Thread-owned output resources, stopped by dropping the stop sender.
struct OutputThread {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl OutputThread {
    fn shutdown(&mut self) {
        drop(self.stop_tx.take());
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            error!("audio output thread panicked");
        }
    }
}

struct CpalOutput {
    thread: OutputThread,
}

impl CpalOutput {
    fn open(config: &AudioConfig, schedule: Arc<SharedSchedule>) -> Result<Self> {
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<()>>(1);
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let config = config.clone();

        let handle = std::thread::Builder::new()
            .name("fae-lipsync-cpal".into())
            .spawn(move || {
                let stream = match build_stream(&config, schedule) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                // Blocks until the engine closes the output.
                let _ = stop_rx.recv();
                drop(stream);
                debug!("cpal output stream released");
            })
            .map_err(|e| SpeechError::AudioInit(format!("cannot spawn output thread: {e}")))?;

        let mut thread = OutputThread {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        };
        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self { thread }),
            Ok(Err(e)) => {
                thread.shutdown();
                Err(e)
            }
            Err(_) => {
                thread.shutdown();
                Err(SpeechError::AudioInit(
                    "output thread exited before the stream started".into(),
                ))
            }
        }
    }
}

impl OutputSink for CpalOutput {
    fn backend(&self) -> OutputBackend {
        OutputBackend::Cpal
    }

    fn close(&mut self) {
        self.thread.shutdown();
    }
}

fn build_stream(config: &AudioConfig, schedule: Arc<SharedSchedule>) -> Result<cpal::Stream> {
    let host = cpal::default_host();

    let device = if let Some(ref name) = config.output_device {
        host.output_devices()
            .map_err(|e| SpeechError::AudioInit(format!("cannot enumerate devices: {e}")))?
            .find(|d| {
                d.description()
                    .ok()
                    .map(|desc| desc.name() == name)
                    .unwrap_or(false)
            })
            .ok_or_else(|| SpeechError::AudioInit(format!("output device '{name}' not found")))?
    } else {
        host.default_output_device()
            .ok_or_else(|| SpeechError::AudioInit("no default output device".into()))?
    };

    let device_name = device
        .description()
        .map(|d| d.name().to_owned())
        .unwrap_or_else(|_| "<unknown>".into());
    info!("using output device: {device_name}");

    let stream_config = StreamConfig {
        channels: 1,
        sample_rate: config.output_sample_rate,
        buffer_size: cpal::BufferSize::Default,
    };
    let channels = usize::from(stream_config.channels);

    let stream = device
        .build_output_stream(
            &stream_config,
            move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                schedule.render(data, channels);
            },
            move |err| {
                error!("audio output stream error: {err}");
            },
            None,
        )
        .map_err(|e| SpeechError::AudioInit(format!("failed to build output stream: {e}")))?;

    stream
        .play()
        .map_err(|e| SpeechError::AudioInit(format!("failed to start output stream: {e}")))?;

    Ok(stream)
}

struct VirtualOutput {
    thread: OutputThread,
}

impl VirtualOutput {
    fn open(config: &AudioConfig, schedule: Arc<SharedSchedule>) -> Result<Self> {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let rate = config.output_sample_rate.max(1);
        let block = config.block_frames.max(1) as usize;

        let handle = std::thread::Builder::new()
            .name("fae-lipsync-virtual".into())
            .spawn(move || run_virtual_clock(&schedule, &stop_rx, rate, block))
            .map_err(|e| SpeechError::AudioInit(format!("cannot spawn output thread: {e}")))?;

        info!("using virtual output device ({rate}Hz, {block}-frame blocks)");
        Ok(Self {
            thread: OutputThread {
                stop_tx: Some(stop_tx),
                handle: Some(handle),
            },
        })
    }
}

impl OutputSink for VirtualOutput {
    fn backend(&self) -> OutputBackend {
        OutputBackend::Virtual
    }

    fn close(&mut self) {
        self.thread.shutdown();
    }
}

/// Render whole blocks as wall-clock time makes them due.
fn run_virtual_clock(schedule: &SharedSchedule, stop_rx: &Receiver<()>, rate: u32, block: usize) {
    let block_time = Duration::from_secs_f64(block as f64 / f64::from(rate));
    let started = Instant::now();
    let mut rendered: u64 = 0;
    let mut buf = vec![0.0_f32; block];

    loop {
        match stop_rx.recv_timeout(block_time) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
        let due = (started.elapsed().as_secs_f64() * f64::from(rate)) as u64;
        while rendered + block as u64 <= due {
            schedule.render(&mut buf, 1);
            rendered += block as u64;
        }
    }
}

/// Clockless output: the caller renders explicitly.
struct ManualOutput;

impl OutputSink for ManualOutput {
    fn backend(&self) -> OutputBackend {
        OutputBackend::Manual
    }

    fn close(&mut self) {}
}
