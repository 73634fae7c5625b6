//! Per-utterance stream state shared by the synthesis worker and the
//! playback driver.
//!
//! A fresh [`UtteranceStream`] is created for every `speak` request. The
//! worker holding the stream is the only producer and the driver is the only
//! consumer, so the queue needs no lock. A superseded worker keeps writing (at
//! most one more chunk) into its own, now orphaned, stream and can never reach
//! the queue of the utterance that replaced it.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use crossbeam_queue::SegQueue;

use crate::cancel::CancelScope;

/// Fixed-size contiguous block of PCM16 mono samples.
pub type Chunk = Box<[i16]>;

/// Sample rate assumed until the engine reports its own.
pub const DEFAULT_SAMPLE_RATE: u32 = 16_000;

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

/// Playback parameters fixed for the lifetime of one utterance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoiceSettings {
    pub pitch: f32,
    /// Multiplier applied to every sample (shouting, whispering).
    pub gain: f32,
    /// Distance rolloff factor for remote speakers.
    pub falloff: f32,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            pitch: 1.0,
            gain: 1.0,
            falloff: 1.0,
        }
    }
}

#[derive(Debug)]
pub struct UtteranceStream {
    id: u64,
    settings: VoiceSettings,
    started: Instant,
    queue: SegQueue<Chunk>,
    ended: AtomicBool,
    sample_rate: AtomicU32,
    cancel: CancelScope,
}

impl UtteranceStream {
    pub(crate) fn new(settings: VoiceSettings) -> Self {
        Self {
            id: NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed),
            settings,
            started: Instant::now(),
            queue: SegQueue::new(),
            ended: AtomicBool::new(false),
            sample_rate: AtomicU32::new(DEFAULT_SAMPLE_RATE),
            cancel: CancelScope::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn settings(&self) -> VoiceSettings {
        self.settings
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn cancel_scope(&self) -> &CancelScope {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn push(&self, chunk: Chunk) {
        self.queue.push(chunk);
    }

    pub(crate) fn pop(&self) -> Option<Chunk> {
        self.queue.pop()
    }

    /// Discard every pending chunk, returning how many were dropped.
    pub(crate) fn drain(&self) -> usize {
        let mut dropped = 0;
        while self.queue.pop().is_some() {
            dropped += 1;
        }
        dropped
    }

    pub fn pending_chunks(&self) -> usize {
        self.queue.len()
    }

    pub fn is_drained(&self) -> bool {
        self.queue.is_empty()
    }

    pub(crate) fn mark_ended(&self) {
        self.ended.store(true, Ordering::Release);
    }

    /// True once the producer has finished, failed or been cancelled.
    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    pub(crate) fn set_sample_rate(&self, rate: u32) {
        let rate = if rate == 0 { DEFAULT_SAMPLE_RATE } else { rate };
        self.sample_rate.store(rate, Ordering::Release);
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate.load(Ordering::Acquire)
    }
}
