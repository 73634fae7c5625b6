//! Audio output capability used by the playback driver.
//!
//! The model is a streaming-source API: a *voice* plays a FIFO of queued
//! *buffers*; buffers that finished playing are reported as processed and can
//! be unqueued, refilled and queued again. Every method must be called from the
//! single thread that owns the device, which the driver guarantees by owning
//! the device outright.

#[cfg(feature = "playback")]
pub mod output;
pub mod software;

#[cfg(feature = "playback")]
pub use output::{Listener, RodioDevice};
pub use software::{Capture, SoftwareDevice};

/// 3D world coordinates.
pub type Position = [f32; 3];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VoiceHandle(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle(pub u32);

#[derive(thiserror::Error, Debug)]
pub enum DeviceError {
    #[error("Unknown voice {0:?}")]
    UnknownVoice(VoiceHandle),
    #[error("Unknown buffer {0:?}")]
    UnknownBuffer(BufferHandle),
    #[error("Buffer {0:?} is queued on a voice")]
    BufferInUse(BufferHandle),
    #[error("Voice {0:?} has no processed buffers")]
    NothingProcessed(VoiceHandle),
    #[error("Audio backend error: {0}")]
    Backend(String),
}

/// Spatial and playback parameters applied when a voice is created.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoiceParams {
    /// Position is relative to the listener (2D playback for the local speaker).
    pub relative: bool,
    pub pitch: f32,
    /// Distance at which the voice plays at full gain.
    pub reference_distance: f32,
    /// Distance at which the linear clamped model reaches silence.
    pub max_distance: f32,
    pub rolloff: f32,
    pub min_gain: f32,
    pub max_gain: f32,
    pub position: Position,
}

impl Default for VoiceParams {
    fn default() -> Self {
        Self {
            relative: true,
            pitch: 1.0,
            reference_distance: 1.0,
            max_distance: f32::MAX,
            rolloff: 0.0,
            min_gain: 0.0,
            max_gain: 1.0,
            position: [0.0; 3],
        }
    }
}

impl VoiceParams {
    /// Gain at `distance` under the linear clamped distance model.
    pub fn gain_at(&self, distance: f32) -> f32 {
        let span = self.max_distance - self.reference_distance;
        let attenuation = if span > 0.0 {
            let d = distance.clamp(self.reference_distance, self.max_distance);
            1.0 - self.rolloff * (d - self.reference_distance) / span
        } else {
            1.0
        };
        attenuation.clamp(self.min_gain, self.max_gain)
    }
}

/// Equal-power left/right gains for a source at `offset` from the listener,
/// where `right` points out of the listener's right ear.
pub fn stereo_pan(offset: Position, right: Position) -> [f32; 2] {
    let length = offset.iter().map(|c| c * c).sum::<f32>().sqrt();
    let pan = if length > f32::EPSILON {
        let norm = right.iter().map(|c| c * c).sum::<f32>().sqrt().max(f32::EPSILON);
        let dot: f32 = offset.iter().zip(right.iter()).map(|(o, r)| o * r).sum();
        (dot / (length * norm)).clamp(-1.0, 1.0)
    } else {
        0.0
    };
    let angle = (pan + 1.0) * std::f32::consts::FRAC_PI_4;
    [angle.cos(), angle.sin()]
}

pub trait AudioDevice {
    /// Create a voice using a linear, clamped distance model.
    fn create_voice(&mut self, params: &VoiceParams) -> Result<VoiceHandle, DeviceError>;

    fn create_buffer(&mut self) -> Result<BufferHandle, DeviceError>;

    /// Replace the contents of an unqueued buffer with mono PCM16 samples.
    fn upload(
        &mut self,
        buffer: BufferHandle,
        samples: &[i16],
        sample_rate: u32,
    ) -> Result<(), DeviceError>;

    fn queue_buffer(&mut self, voice: VoiceHandle, buffer: BufferHandle)
        -> Result<(), DeviceError>;

    /// Unqueue the oldest processed buffer.
    fn unqueue_buffer(&mut self, voice: VoiceHandle) -> Result<BufferHandle, DeviceError>;

    fn processed_count(&mut self, voice: VoiceHandle) -> Result<usize, DeviceError>;

    fn queued_count(&mut self, voice: VoiceHandle) -> Result<usize, DeviceError>;

    fn is_playing(&mut self, voice: VoiceHandle) -> Result<bool, DeviceError>;

    fn play(&mut self, voice: VoiceHandle) -> Result<(), DeviceError>;

    fn stop(&mut self, voice: VoiceHandle) -> Result<(), DeviceError>;

    /// Detach every buffer from a stopped voice.
    fn clear_queue(&mut self, voice: VoiceHandle) -> Result<(), DeviceError>;

    fn set_position(&mut self, voice: VoiceHandle, position: Position) -> Result<(), DeviceError>;

    fn delete_buffer(&mut self, buffer: BufferHandle) -> Result<(), DeviceError>;

    fn delete_voice(&mut self, voice: VoiceHandle) -> Result<(), DeviceError>;
}
