//! Schedule queue, playback cursor, and the render path.
//!
//! Fragments are placed on an absolute output timeline measured in frames
//! rendered since the engine started. Each new fragment begins at the
//! playback cursor (the end of the previous one) or at "now", whichever is
//! later, so consecutive fragments play back to back with no gap while the
//! producer keeps up, and a late fragment never starts in the past.

use super::FragmentId;
use super::analysis::{AnalysisRing, Playhead};
use crate::error::{Result, SpeechError};
use crate::pipeline::messages::PlaybackEvent;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

/// Where a fragment landed on the output timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledWindow {
    pub fragment: FragmentId,
    pub epoch: u64,
    pub start_frame: u64,
    pub frames: u64,
    pub sample_rate: u32,
}

impl ScheduledWindow {
    pub fn start(&self) -> Duration {
        frames_to_duration(self.start_frame, self.sample_rate)
    }

    pub fn duration(&self) -> Duration {
        frames_to_duration(self.frames, self.sample_rate)
    }

    pub fn end(&self) -> Duration {
        frames_to_duration(self.start_frame + self.frames, self.sample_rate)
    }

    pub fn end_frame(&self) -> u64 {
        self.start_frame + self.frames
    }
}

/// Snapshot of the output clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleClock {
    /// Output time already rendered.
    pub now: Duration,
    /// Where the next fragment would start if the producer keeps up.
    pub cursor: Duration,
    pub queued: usize,
    pub epoch: u64,
}

pub(crate) fn frames_to_duration(frames: u64, sample_rate: u32) -> Duration {
    Duration::from_secs_f64(frames as f64 / f64::from(sample_rate.max(1)))
}

fn duration_to_frames(duration: Duration, sample_rate: u32) -> u64 {
    (duration.as_secs_f64() * f64::from(sample_rate)).round() as u64
}

struct ScheduledFragment {
    id: FragmentId,
    epoch: u64,
    start: u64,
    samples: Vec<f32>,
    started: bool,
}

impl ScheduledFragment {
    fn end(&self) -> u64 {
        self.start + self.samples.len() as u64
    }
}

struct Schedule {
    sample_rate: u32,
    /// Frames rendered so far: the output clock.
    position: u64,
    /// Frame at which the next fragment should begin.
    cursor: u64,
    epoch: u64,
    next_id: u64,
    max_queued: usize,
    queue: VecDeque<ScheduledFragment>,
    ring: AnalysisRing,
}

impl Schedule {
    fn retire_finished(&mut self, events: &mut Vec<PlaybackEvent>) {
        while let Some(head) = self.queue.front() {
            if head.end() > self.position {
                break;
            }
            let epoch = head.epoch;
            events.push(PlaybackEvent::FragmentFinished {
                epoch,
                fragment: head.id,
            });
            self.queue.pop_front();
            if self.queue.is_empty() {
                events.push(PlaybackEvent::Drained { epoch });
            }
        }
    }

    fn playhead(&self) -> Option<Playhead> {
        let head = self.queue.front()?;
        if self.position < head.start || self.position >= head.end() {
            return None;
        }
        Some(Playhead {
            fragment: head.id,
            offset: frames_to_duration(self.position - head.start, self.sample_rate),
        })
    }
}

/// Schedule state shared between the engine and its output thread.
pub(crate) struct SharedSchedule {
    inner: Mutex<Schedule>,
    /// Gain as f32 bits so the render path never waits on it.
    gain: AtomicU32,
    events: mpsc::UnboundedSender<PlaybackEvent>,
}

impl SharedSchedule {
    pub fn new(
        sample_rate: u32,
        analysis_window: usize,
        max_queued: usize,
        gain: f32,
        events: mpsc::UnboundedSender<PlaybackEvent>,
    ) -> Self {
        Self {
            inner: Mutex::new(Schedule {
                sample_rate,
                position: 0,
                cursor: 0,
                epoch: 0,
                next_id: 0,
                max_queued,
                queue: VecDeque::new(),
                ring: AnalysisRing::new(analysis_window),
            }),
            gain: AtomicU32::new(clamp_gain(gain).to_bits()),
            events,
        }
    }

    /// The render path must keep producing audio even if a panic elsewhere
    /// poisoned the lock.
    fn lock(&self) -> MutexGuard<'_, Schedule> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, events: Vec<PlaybackEvent>) {
        for event in events {
            // The listener may have gone away; playback continues regardless.
            let _ = self.events.send(event);
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.lock().sample_rate
    }

    pub fn gain(&self) -> f32 {
        f32::from_bits(self.gain.load(Ordering::Relaxed))
    }

    /// Store a clamped gain and return what was applied.
    pub fn set_gain(&self, level: f32) -> f32 {
        let gain = clamp_gain(level);
        self.gain.store(gain.to_bits(), Ordering::Relaxed);
        gain
    }

    /// Append decoded samples to the queue at `max(cursor, now)`.
    pub fn schedule(&self, samples: Vec<f32>) -> Result<ScheduledWindow> {
        let mut s = self.lock();
        if s.queue.len() >= s.max_queued {
            return Err(SpeechError::InvalidArgument(format!(
                "schedule queue is full ({} fragments)",
                s.max_queued
            )));
        }

        let start = s.cursor.max(s.position);
        let frames = samples.len() as u64;
        let id = FragmentId(s.next_id);
        s.next_id += 1;
        s.cursor = start + frames;
        let epoch = s.epoch;
        s.queue.push_back(ScheduledFragment {
            id,
            epoch,
            start,
            samples,
            started: false,
        });

        Ok(ScheduledWindow {
            fragment: id,
            epoch,
            start_frame: start,
            frames,
            sample_rate: s.sample_rate,
        })
    }

    /// Fill an interleaved output buffer and advance the clock.
    ///
    /// The same mono sample is written to every channel of a frame.
    pub fn render(&self, out: &mut [f32], channels: usize) {
        let channels = channels.max(1);
        let gain = self.gain();
        let mut events = Vec::new();
        {
            let mut s = self.lock();
            for frame in out.chunks_mut(channels) {
                s.retire_finished(&mut events);
                let t = s.position;
                let sample = match s.queue.front_mut() {
                    Some(head) if t >= head.start => {
                        if !head.started {
                            head.started = true;
                            events.push(PlaybackEvent::FragmentStarted {
                                epoch: head.epoch,
                                fragment: head.id,
                            });
                        }
                        head.samples[(t - head.start) as usize]
                    }
                    _ => 0.0,
                };
                s.ring.push(sample);
                frame.fill(sample * gain);
                s.position += 1;
            }
            s.retire_finished(&mut events);
        }
        self.emit(events);
    }

    /// Drop everything queued, move the cursor to now, and start a new epoch.
    ///
    /// Returns the new epoch.
    pub fn stop(&self) -> u64 {
        let (old_epoch, dropped, new_epoch) = {
            let mut s = self.lock();
            let dropped = s.queue.len();
            s.queue.clear();
            s.cursor = s.position;
            s.ring.clear();
            let old = s.epoch;
            s.epoch += 1;
            (old, dropped, s.epoch)
        };
        self.emit(vec![PlaybackEvent::Stopped {
            epoch: old_epoch,
            dropped,
        }]);
        new_epoch
    }

    pub fn epoch(&self) -> u64 {
        self.lock().epoch
    }

    pub fn is_playing(&self) -> bool {
        !self.lock().queue.is_empty()
    }

    pub fn clock(&self) -> ScheduleClock {
        let s = self.lock();
        ScheduleClock {
            now: frames_to_duration(s.position, s.sample_rate),
            cursor: frames_to_duration(s.cursor.max(s.position), s.sample_rate),
            queued: s.queue.len(),
            epoch: s.epoch,
        }
    }

    pub fn playhead(&self) -> Option<Playhead> {
        self.lock().playhead()
    }

    /// Ring contents and playhead, or `None` when nothing is scheduled.
    pub fn analysis_snapshot(&self) -> Option<(Vec<f32>, Option<Playhead>)> {
        let s = self.lock();
        if s.queue.is_empty() {
            return None;
        }
        Some((s.ring.snapshot(), s.playhead()))
    }

    /// Frames covering `duration` at this schedule's rate.
    pub fn frames_for(&self, duration: Duration) -> u64 {
        duration_to_frames(duration, self.sample_rate())
    }
}

fn clamp_gain(level: f32) -> f32 {
    if level.is_nan() {
        0.0
    } else {
        level.clamp(0.0, 1.0)
    }
}
