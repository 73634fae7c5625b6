//! Bounded pool of reusable speaker slots.
//!
//! Slots live in an arena addressed by index. The pool lock is held only for
//! assignment decisions; engine construction happens on the worker and device
//! calls happen on the driver, neither under this lock.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::driver::DriverHandle;
use crate::stream::{UtteranceStream, VoiceSettings};
use crate::worker::SlotEngine;

/// Who a slot is speaking for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Speaker {
    /// The local player; played back without spatialisation.
    Local,
    /// A remote entity, positioned through a [`crate::SpeakerLocator`].
    Remote(String),
}

impl Speaker {
    /// Blank ids normalise to the local speaker.
    pub fn from_id(id: Option<&str>) -> Self {
        match id.map(str::trim) {
            Some(id) if !id.is_empty() => Speaker::Remote(id.to_string()),
            _ => Speaker::Local,
        }
    }

    pub fn remote_id(&self) -> Option<&str> {
        match self {
            Speaker::Local => None,
            Speaker::Remote(id) => Some(id),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Speaker::Local)
    }
}

impl fmt::Display for Speaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Speaker::Local => f.write_str("local"),
            Speaker::Remote(id) => f.write_str(id),
        }
    }
}

/// How `acquire` found its slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assignment {
    /// The speaker already owned the slot; its previous utterance was cancelled.
    Reused,
    /// An idle slot was claimed.
    Idle,
    /// The pool grew by one slot.
    Created,
    /// The longest-running utterance was cut off to make room.
    Evicted { previous: Speaker },
}

/// A slot handed out by [`SlotPool::acquire`], with its fresh utterance.
pub struct Lease {
    pub index: usize,
    pub assignment: Assignment,
    pub stream: Arc<UtteranceStream>,
    pub engine: Arc<SlotEngine>,
}

/// Read-only view of one slot, for status displays and tests.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotInfo {
    pub index: usize,
    pub speaker: Option<Speaker>,
    pub stream_id: Option<u64>,
    pub output_live: bool,
    pub started: Option<Instant>,
    /// Whether the slot's engine is built; `None` while a worker holds it.
    pub engine_loaded: Option<bool>,
}

struct SlotRecord {
    speaker: Option<Speaker>,
    stream: Option<Arc<UtteranceStream>>,
    /// The driver holds device resources for this slot.
    output_live: bool,
    started: Option<Instant>,
    engine: Arc<SlotEngine>,
}

impl SlotRecord {
    fn new() -> Self {
        Self {
            speaker: None,
            stream: None,
            output_live: false,
            started: None,
            engine: Arc::new(SlotEngine::default()),
        }
    }

    fn is_idle(&self) -> bool {
        self.speaker.is_none() && self.stream.is_none() && !self.output_live
    }

    /// Cancel the in-flight utterance and ask the driver to stop its output.
    /// The speaker binding is left alone.
    fn cancel_utterance(&mut self, index: usize, driver: &DriverHandle) {
        if let Some(stream) = self.stream.take() {
            stream.cancel();
            stream.drain();
            stream.mark_ended();
            driver.stop(index, stream.id());
        }
    }

    fn info(&self, index: usize) -> SlotInfo {
        SlotInfo {
            index,
            speaker: self.speaker.clone(),
            stream_id: self.stream.as_ref().map(|s| s.id()),
            output_live: self.output_live,
            started: self.started,
            engine_loaded: self.engine.is_loaded(),
        }
    }
}

struct PoolInner {
    slots: Vec<SlotRecord>,
    max_speakers: usize,
}

impl PoolInner {
    fn capacity(&self) -> usize {
        self.max_speakers.max(1)
    }

    /// Drop idle slots past the bound, from the end only so indices stay stable.
    fn shrink_to_bound(&mut self) {
        let capacity = self.capacity();
        while self.slots.len() > capacity && self.slots.last().is_some_and(SlotRecord::is_idle) {
            self.slots.pop();
        }
    }

    /// Oldest utterance among the slots inside the bound.
    fn oldest_start(&self) -> Option<usize> {
        let bound = self.capacity().min(self.slots.len());
        self.slots[..bound]
            .iter()
            .enumerate()
            // A slot that never started counts as older than any that did.
            .min_by_key(|(_, slot)| slot.started)
            .map(|(index, _)| index)
    }
}

pub struct SlotPool {
    inner: Mutex<PoolInner>,
    driver: DriverHandle,
}

impl SlotPool {
    pub fn new(max_speakers: usize, driver: DriverHandle) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                slots: Vec::new(),
                max_speakers,
            }),
            driver,
        }
    }

    /// Assign a slot to `speaker` and start a fresh utterance on it.
    ///
    /// Resolution order: the speaker's own slot, an idle slot, a new slot while
    /// below capacity, and finally the slot whose utterance started first.
    /// Never blocks on synthesis and never fails.
    pub fn acquire(&self, speaker: &Speaker, settings: VoiceSettings) -> Lease {
        let mut inner = self.inner.lock();
        let capacity = inner.capacity();

        let owned = inner
            .slots
            .iter()
            .position(|slot| slot.speaker.as_ref() == Some(speaker));
        // A speaker bound past a lowered bound moves inside it so the
        // trailing slot can drain.
        if let Some(index) = owned.filter(|&index| index >= capacity) {
            let slot = &mut inner.slots[index];
            slot.cancel_utterance(index, &self.driver);
            slot.speaker = None;
            slot.started = None;
        }

        let (index, assignment) = if let Some(index) = owned.filter(|&index| index < capacity) {
            (index, Assignment::Reused)
        } else if let Some(index) = inner.slots[..capacity.min(inner.slots.len())]
            .iter()
            .position(SlotRecord::is_idle)
        {
            (index, Assignment::Idle)
        } else if inner.slots.len() < inner.capacity() {
            inner.slots.push(SlotRecord::new());
            (inner.slots.len() - 1, Assignment::Created)
        } else {
            match inner.oldest_start() {
                Some(index) => {
                    let previous = inner.slots[index].speaker.clone().unwrap_or(Speaker::Local);
                    (index, Assignment::Evicted { previous })
                }
                // Only reachable with an empty pool, which the branch above grows.
                None => {
                    inner.slots.push(SlotRecord::new());
                    (inner.slots.len() - 1, Assignment::Created)
                }
            }
        };

        let slot = &mut inner.slots[index];
        slot.cancel_utterance(index, &self.driver);

        let stream = Arc::new(UtteranceStream::new(settings));
        slot.speaker = Some(speaker.clone());
        slot.started = Some(stream.started());
        slot.stream = Some(Arc::clone(&stream));

        let engine = Arc::clone(&slot.engine);

        log::debug!("Slot {index} -> {speaker} ({assignment:?})");
        inner.shrink_to_bound();

        Lease {
            index,
            assignment,
            stream,
            engine,
        }
    }

    /// Called by the driver when it creates device resources for a stream.
    /// Returns false if the stream is no longer the slot's current utterance.
    pub(crate) fn mark_output_live(&self, index: usize, stream_id: u64) -> bool {
        let mut inner = self.inner.lock();
        match inner.slots.get_mut(index) {
            Some(slot) if slot.stream.as_ref().map(|s| s.id()) == Some(stream_id) => {
                slot.output_live = true;
                true
            }
            _ => false,
        }
    }

    /// Called by the driver once a stream's device resources are gone. The
    /// slot returns to idle only if `stream_id` is still its utterance.
    pub(crate) fn release(&self, index: usize, stream_id: u64) {
        let mut inner = self.inner.lock();
        let Some(slot) = inner.slots.get_mut(index) else {
            return;
        };
        slot.output_live = false;
        if slot.stream.as_ref().map(|s| s.id()) == Some(stream_id) {
            slot.stream = None;
            slot.speaker = None;
            slot.started = None;
            log::debug!("Slot {index} idle");
        }
        inner.shrink_to_bound();
    }

    /// Cancel whatever `speaker` is saying, if anything.
    pub fn cancel_speaker(&self, speaker: &Speaker) -> bool {
        let mut inner = self.inner.lock();
        let Some(index) = inner
            .slots
            .iter()
            .position(|slot| slot.speaker.as_ref() == Some(speaker))
        else {
            return false;
        };
        let slot = &mut inner.slots[index];
        slot.cancel_utterance(index, &self.driver);
        slot.speaker = None;
        slot.started = None;
        true
    }

    pub fn set_max_speakers(&self, max_speakers: usize) {
        let mut inner = self.inner.lock();
        inner.max_speakers = max_speakers;
        inner.shrink_to_bound();
    }

    pub fn max_speakers(&self) -> usize {
        self.inner.lock().max_speakers
    }

    /// Number of slots currently in the pool.
    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slots bound to a speaker.
    pub fn active_count(&self) -> usize {
        self.inner
            .lock()
            .slots
            .iter()
            .filter(|slot| slot.speaker.is_some())
            .count()
    }

    pub fn snapshot(&self) -> Vec<SlotInfo> {
        let inner = self.inner.lock();
        inner
            .slots
            .iter()
            .enumerate()
            .map(|(index, slot)| slot.info(index))
            .collect()
    }

    /// Cancel every utterance, stop all output and drop every slot together
    /// with its engine instance.
    pub fn dispose(&self) {
        let slots = {
            let mut inner = self.inner.lock();
            std::mem::take(&mut inner.slots)
        };
        for slot in &slots {
            if let Some(stream) = &slot.stream {
                stream.cancel();
                stream.drain();
                stream.mark_ended();
            }
        }
        self.driver.stop_all();
        log::debug!("Disposed {} speaker slots", slots.len());
    }
}
