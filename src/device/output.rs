//! Sound-card output via `rodio`.
//!
//! Each voice owns one [`Sink`]. Queued buffers are appended to the sink as
//! separate sources, so the sink's remaining source count tells how many
//! buffers are still pending and everything before them counts as processed.
//! Distance gain and stereo panning are baked into each buffer when it is
//! queued; a position change is heard from the next queued buffer on.

use std::collections::{HashMap, VecDeque};

use rodio::buffer::SamplesBuffer;
use rodio::source::ChannelVolume;
use rodio::{OutputStream, OutputStreamHandle, Sink};

use super::{stereo_pan, AudioDevice, BufferHandle, DeviceError, Position, VoiceHandle, VoiceParams};

struct OutBuffer {
    samples: Vec<i16>,
    sample_rate: u32,
    queued_on: Option<VoiceHandle>,
}

struct OutVoice {
    params: VoiceParams,
    position: Position,
    sink: Sink,
    /// Buffers handed to the sink that have not been unqueued yet.
    queue: VecDeque<BufferHandle>,
}

impl OutVoice {
    fn processed(&self) -> usize {
        self.queue.len() - self.sink.len().min(self.queue.len())
    }
}

/// Where the listener is and which way is right.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Listener {
    pub position: Position,
    pub right: Position,
}

impl Default for Listener {
    fn default() -> Self {
        Self {
            position: [0.0; 3],
            right: [1.0, 0.0, 0.0],
        }
    }
}

/// Plays voices on the default output device.
///
/// The output stream is not `Send`; create the device on the thread that
/// runs the playback driver.
pub struct RodioDevice {
    _stream: OutputStream,
    handle: OutputStreamHandle,
    listener: Listener,
    next_handle: u32,
    voices: HashMap<VoiceHandle, OutVoice>,
    buffers: HashMap<BufferHandle, OutBuffer>,
}

impl RodioDevice {
    /// Open the default output device.
    pub fn open_default() -> Result<Self, DeviceError> {
        let (stream, handle) =
            OutputStream::try_default().map_err(|e| DeviceError::Backend(e.to_string()))?;
        log::info!("Audio playback initialized on default output device");
        Ok(Self {
            _stream: stream,
            handle,
            listener: Listener::default(),
            next_handle: 0,
            voices: HashMap::new(),
            buffers: HashMap::new(),
        })
    }

    /// Move the listener. Applies to buffers queued afterwards.
    pub fn set_listener(&mut self, listener: Listener) {
        self.listener = listener;
    }

    pub fn listener(&self) -> Listener {
        self.listener
    }

    fn next(&mut self) -> u32 {
        self.next_handle += 1;
        self.next_handle
    }

    fn paused_sink(&self) -> Result<Sink, DeviceError> {
        let sink = Sink::try_new(&self.handle).map_err(|e| DeviceError::Backend(e.to_string()))?;
        sink.pause();
        Ok(sink)
    }

    fn voice_mut(&mut self, voice: VoiceHandle) -> Result<&mut OutVoice, DeviceError> {
        self.voices
            .get_mut(&voice)
            .ok_or(DeviceError::UnknownVoice(voice))
    }

    /// Left/right gains for a voice at its current position.
    fn channel_gains(&self, voice: &OutVoice) -> Vec<f32> {
        let offset: Position = if voice.params.relative {
            voice.position
        } else {
            let listener = self.listener.position;
            [
                voice.position[0] - listener[0],
                voice.position[1] - listener[1],
                voice.position[2] - listener[2],
            ]
        };
        let distance = offset.iter().map(|c| c * c).sum::<f32>().sqrt();
        let gain = voice.params.gain_at(distance);
        stereo_pan(offset, self.listener.right)
            .iter()
            .map(|side| side * gain)
            .collect()
    }
}

impl AudioDevice for RodioDevice {
    fn create_voice(&mut self, params: &VoiceParams) -> Result<VoiceHandle, DeviceError> {
        let sink = self.paused_sink()?;
        sink.set_speed(params.pitch.max(0.01));
        let handle = VoiceHandle(self.next());
        self.voices.insert(
            handle,
            OutVoice {
                params: *params,
                position: params.position,
                sink,
                queue: VecDeque::new(),
            },
        );
        Ok(handle)
    }

    fn create_buffer(&mut self) -> Result<BufferHandle, DeviceError> {
        let handle = BufferHandle(self.next());
        self.buffers.insert(
            handle,
            OutBuffer {
                samples: Vec::new(),
                sample_rate: crate::stream::DEFAULT_SAMPLE_RATE,
                queued_on: None,
            },
        );
        Ok(handle)
    }

    fn upload(
        &mut self,
        buffer: BufferHandle,
        samples: &[i16],
        sample_rate: u32,
    ) -> Result<(), DeviceError> {
        let slot = self
            .buffers
            .get_mut(&buffer)
            .ok_or(DeviceError::UnknownBuffer(buffer))?;
        if slot.queued_on.is_some() {
            return Err(DeviceError::BufferInUse(buffer));
        }
        slot.samples.clear();
        slot.samples.extend_from_slice(samples);
        slot.sample_rate = sample_rate;
        Ok(())
    }

    fn queue_buffer(
        &mut self,
        voice: VoiceHandle,
        buffer: BufferHandle,
    ) -> Result<(), DeviceError> {
        let state = self
            .voices
            .get(&voice)
            .ok_or(DeviceError::UnknownVoice(voice))?;
        let gains = self.channel_gains(state);
        let slot = self
            .buffers
            .get_mut(&buffer)
            .ok_or(DeviceError::UnknownBuffer(buffer))?;
        if slot.queued_on.is_some() {
            return Err(DeviceError::BufferInUse(buffer));
        }
        slot.queued_on = Some(voice);
        let source = SamplesBuffer::new(1, slot.sample_rate.max(1), slot.samples.clone());
        let state = self.voice_mut(voice)?;
        state.sink.append(ChannelVolume::new(source, gains));
        state.queue.push_back(buffer);
        Ok(())
    }

    fn unqueue_buffer(&mut self, voice: VoiceHandle) -> Result<BufferHandle, DeviceError> {
        let state = self.voice_mut(voice)?;
        if state.processed() == 0 {
            return Err(DeviceError::NothingProcessed(voice));
        }
        let buffer = state
            .queue
            .pop_front()
            .ok_or(DeviceError::NothingProcessed(voice))?;
        if let Some(slot) = self.buffers.get_mut(&buffer) {
            slot.queued_on = None;
        }
        Ok(buffer)
    }

    fn processed_count(&mut self, voice: VoiceHandle) -> Result<usize, DeviceError> {
        Ok(self.voice_mut(voice)?.processed())
    }

    fn queued_count(&mut self, voice: VoiceHandle) -> Result<usize, DeviceError> {
        Ok(self.voice_mut(voice)?.queue.len())
    }

    fn is_playing(&mut self, voice: VoiceHandle) -> Result<bool, DeviceError> {
        let state = self.voice_mut(voice)?;
        Ok(!state.sink.is_paused() && !state.sink.empty())
    }

    fn play(&mut self, voice: VoiceHandle) -> Result<(), DeviceError> {
        self.voice_mut(voice)?.sink.play();
        Ok(())
    }

    fn stop(&mut self, voice: VoiceHandle) -> Result<(), DeviceError> {
        // A stopped sink keeps nothing; swap in a fresh one so every queued
        // buffer reads as processed.
        let fresh = self.paused_sink()?;
        let state = self.voice_mut(voice)?;
        fresh.set_speed(state.params.pitch.max(0.01));
        let old = std::mem::replace(&mut state.sink, fresh);
        old.stop();
        Ok(())
    }

    fn clear_queue(&mut self, voice: VoiceHandle) -> Result<(), DeviceError> {
        let state = self.voice_mut(voice)?;
        if !state.sink.empty() {
            return Err(DeviceError::Backend(format!(
                "cannot detach buffers from playing voice {voice:?}"
            )));
        }
        let detached: Vec<BufferHandle> = state.queue.drain(..).collect();
        for buffer in detached {
            if let Some(slot) = self.buffers.get_mut(&buffer) {
                slot.queued_on = None;
            }
        }
        Ok(())
    }

    fn set_position(&mut self, voice: VoiceHandle, position: Position) -> Result<(), DeviceError> {
        self.voice_mut(voice)?.position = position;
        Ok(())
    }

    fn delete_buffer(&mut self, buffer: BufferHandle) -> Result<(), DeviceError> {
        match self.buffers.get(&buffer) {
            None => Err(DeviceError::UnknownBuffer(buffer)),
            Some(slot) if slot.queued_on.is_some() => Err(DeviceError::BufferInUse(buffer)),
            Some(_) => {
                self.buffers.remove(&buffer);
                Ok(())
            }
        }
    }

    fn delete_voice(&mut self, voice: VoiceHandle) -> Result<(), DeviceError> {
        let state = self
            .voices
            .remove(&voice)
            .ok_or(DeviceError::UnknownVoice(voice))?;
        state.sink.stop();
        for buffer in &state.queue {
            if let Some(slot) = self.buffers.get_mut(buffer) {
                slot.queued_on = None;
            }
        }
        Ok(())
    }
}
