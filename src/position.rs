//! Speaker positions and hearing-range culling.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::device::Position;

/// Where a remote speaker is and whether it still exists.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeakerState {
    pub position: Position,
    /// False once the entity has disconnected or died.
    pub alive: bool,
}

impl SpeakerState {
    pub fn alive_at(position: Position) -> Self {
        Self {
            position,
            alive: true,
        }
    }
}

/// Lookup from speaker id to world state, polled by the playback driver.
pub trait SpeakerLocator {
    /// `None` when the id no longer resolves to an entity.
    fn locate(&self, speaker_id: &str) -> Option<SpeakerState>;
}

/// Thread-safe table of speaker states, updated by the host as entities move.
#[derive(Debug, Default)]
pub struct SpeakerRegistry {
    speakers: RwLock<HashMap<String, SpeakerState>>,
}

impl SpeakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, speaker_id: &str, state: SpeakerState) {
        self.speakers.write().insert(speaker_id.to_string(), state);
    }

    pub fn remove(&self, speaker_id: &str) -> Option<SpeakerState> {
        self.speakers.write().remove(speaker_id)
    }
}

impl SpeakerLocator for SpeakerRegistry {
    fn locate(&self, speaker_id: &str) -> Option<SpeakerState> {
        self.speakers.read().get(speaker_id).copied()
    }
}

impl<L: SpeakerLocator + ?Sized> SpeakerLocator for std::sync::Arc<L> {
    fn locate(&self, speaker_id: &str) -> Option<SpeakerState> {
        (**self).locate(speaker_id)
    }
}

pub fn distance_squared(a: Position, b: Position) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Whether a speaker at `speaker` is close enough to `listener` to be heard.
pub fn within_hearing_range(listener: Position, speaker: Position, range: u32) -> bool {
    let range = range as f32;
    distance_squared(listener, speaker) <= range * range
}
