use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::time::Duration;

use super::{AudioDevice, BufferHandle, DeviceError, Position, VoiceHandle, VoiceParams};

/// Everything one voice played before it was deleted.
#[derive(Debug, Clone)]
pub struct Capture {
    pub voice: VoiceHandle,
    pub params: VoiceParams,
    /// Last position the voice was moved to.
    pub position: Position,
    pub samples: Vec<i16>,
    pub sample_rate: u32,
}

impl Capture {
    /// Write the captured audio to a 16-bit mono WAV file.
    pub fn write_wav(&self, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec)?;
        for &sample in &self.samples {
            writer.write_sample(sample)?;
        }
        writer.finalize()?;
        Ok(())
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

struct SoftBuffer {
    samples: Vec<i16>,
    sample_rate: u32,
    queued_on: Option<VoiceHandle>,
}

struct SoftVoice {
    params: VoiceParams,
    position: Position,
    queue: VecDeque<BufferHandle>,
    /// Leading buffers of `queue` that finished playing.
    processed: usize,
    /// Samples already played from the first unprocessed buffer.
    cursor: usize,
    playing: bool,
    captured: Vec<i16>,
    sample_rate: u32,
}

/// In-process audio device that "plays" queued buffers against a virtual clock.
///
/// Nothing reaches a sound card; the device records every sample each voice
/// played so hosts can inspect or save it. Time only moves when
/// [`SoftwareDevice::advance`] is called.
#[derive(Default)]
pub struct SoftwareDevice {
    next_handle: u32,
    voices: HashMap<VoiceHandle, SoftVoice>,
    buffers: HashMap<BufferHandle, SoftBuffer>,
    captures: Vec<Capture>,
    fail_buffer_deletes: bool,
}

impl SoftwareDevice {
    pub fn new() -> Self {
        Self::default()
    }

    fn next(&mut self) -> u32 {
        self.next_handle += 1;
        self.next_handle
    }

    fn voice_mut(&mut self, voice: VoiceHandle) -> Result<&mut SoftVoice, DeviceError> {
        self.voices
            .get_mut(&voice)
            .ok_or(DeviceError::UnknownVoice(voice))
    }

    /// Play `elapsed` worth of audio on every playing voice.
    pub fn advance(&mut self, elapsed: Duration) {
        for voice in self.voices.values_mut() {
            if !voice.playing {
                continue;
            }
            let mut remaining = elapsed.as_secs_f64();
            loop {
                let Some(&head) = voice.queue.get(voice.processed) else {
                    break;
                };
                let Some(buffer) = self.buffers.get(&head) else {
                    break;
                };
                let rate = buffer.sample_rate.max(1) as f64;
                voice.sample_rate = buffer.sample_rate;
                let budget = (remaining * rate).round() as usize;
                let left = buffer.samples.len().saturating_sub(voice.cursor);
                let take = left.min(budget);
                voice
                    .captured
                    .extend_from_slice(&buffer.samples[voice.cursor..voice.cursor + take]);
                voice.cursor += take;
                remaining -= take as f64 / rate;
                if voice.cursor < buffer.samples.len() {
                    break;
                }
                voice.processed += 1;
                voice.cursor = 0;
            }
            if voice.processed >= voice.queue.len() {
                voice.playing = false;
            }
        }
    }

    /// Finish every buffer currently queued on every playing voice.
    pub fn play_out(&mut self) {
        let longest = self
            .voices
            .values()
            .filter(|v| v.playing)
            .map(|v| {
                v.queue
                    .iter()
                    .filter_map(|b| self.buffers.get(b))
                    .map(|b| b.samples.len() as f64 / b.sample_rate.max(1) as f64)
                    .sum::<f64>()
            })
            .fold(0.0_f64, f64::max);
        self.advance(Duration::from_secs_f64(longest + 1.0));
    }

    /// Make every `delete_buffer` call fail, as a backend might for stale handles.
    pub fn set_fail_buffer_deletes(&mut self, fail: bool) {
        self.fail_buffer_deletes = fail;
    }

    pub fn live_voices(&self) -> usize {
        self.voices.len()
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn voice_params(&self, voice: VoiceHandle) -> Option<VoiceParams> {
        self.voices.get(&voice).map(|v| v.params)
    }

    pub fn voice_position(&self, voice: VoiceHandle) -> Option<Position> {
        self.voices.get(&voice).map(|v| v.position)
    }

    /// Handles of voices that are still alive, in creation order.
    pub fn voice_handles(&self) -> Vec<VoiceHandle> {
        let mut handles: Vec<VoiceHandle> = self.voices.keys().copied().collect();
        handles.sort_unstable();
        handles
    }

    /// Samples played so far by a live voice.
    pub fn played(&self, voice: VoiceHandle) -> Option<&[i16]> {
        self.voices.get(&voice).map(|v| v.captured.as_slice())
    }

    /// Recordings of voices that have been deleted, oldest first.
    pub fn captures(&self) -> &[Capture] {
        &self.captures
    }
}

impl AudioDevice for SoftwareDevice {
    fn create_voice(&mut self, params: &VoiceParams) -> Result<VoiceHandle, DeviceError> {
        let handle = VoiceHandle(self.next());
        self.voices.insert(
            handle,
            SoftVoice {
                params: *params,
                position: params.position,
                queue: VecDeque::new(),
                processed: 0,
                cursor: 0,
                playing: false,
                captured: Vec::new(),
                sample_rate: crate::stream::DEFAULT_SAMPLE_RATE,
            },
        );
        Ok(handle)
    }

    fn create_buffer(&mut self) -> Result<BufferHandle, DeviceError> {
        let handle = BufferHandle(self.next());
        self.buffers.insert(
            handle,
            SoftBuffer {
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
        if !self.voices.contains_key(&voice) {
            return Err(DeviceError::UnknownVoice(voice));
        }
        let slot = self
            .buffers
            .get_mut(&buffer)
            .ok_or(DeviceError::UnknownBuffer(buffer))?;
        if slot.queued_on.is_some() {
            return Err(DeviceError::BufferInUse(buffer));
        }
        slot.queued_on = Some(voice);
        self.voice_mut(voice)?.queue.push_back(buffer);
        Ok(())
    }

    fn unqueue_buffer(&mut self, voice: VoiceHandle) -> Result<BufferHandle, DeviceError> {
        let state = self.voice_mut(voice)?;
        if state.processed == 0 {
            return Err(DeviceError::NothingProcessed(voice));
        }
        let buffer = state
            .queue
            .pop_front()
            .ok_or(DeviceError::NothingProcessed(voice))?;
        state.processed -= 1;
        if let Some(slot) = self.buffers.get_mut(&buffer) {
            slot.queued_on = None;
        }
        Ok(buffer)
    }

    fn processed_count(&mut self, voice: VoiceHandle) -> Result<usize, DeviceError> {
        Ok(self.voice_mut(voice)?.processed)
    }

    fn queued_count(&mut self, voice: VoiceHandle) -> Result<usize, DeviceError> {
        Ok(self.voice_mut(voice)?.queue.len())
    }

    fn is_playing(&mut self, voice: VoiceHandle) -> Result<bool, DeviceError> {
        Ok(self.voice_mut(voice)?.playing)
    }

    fn play(&mut self, voice: VoiceHandle) -> Result<(), DeviceError> {
        let state = self.voice_mut(voice)?;
        // Restarting a voice that ran dry rewinds over its spent buffers.
        if state.processed >= state.queue.len() {
            state.processed = 0;
            state.cursor = 0;
        }
        state.playing = !state.queue.is_empty();
        Ok(())
    }

    fn stop(&mut self, voice: VoiceHandle) -> Result<(), DeviceError> {
        let state = self.voice_mut(voice)?;
        state.playing = false;
        state.processed = state.queue.len();
        state.cursor = 0;
        Ok(())
    }

    fn clear_queue(&mut self, voice: VoiceHandle) -> Result<(), DeviceError> {
        let state = self.voice_mut(voice)?;
        if state.playing {
            return Err(DeviceError::Backend(format!(
                "cannot detach buffers from playing voice {voice:?}"
            )));
        }
        let detached: Vec<BufferHandle> = state.queue.drain(..).collect();
        state.processed = 0;
        state.cursor = 0;
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
        if self.fail_buffer_deletes {
            return Err(DeviceError::Backend(format!(
                "refusing to delete {buffer:?}"
            )));
        }
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
        for buffer in &state.queue {
            if let Some(slot) = self.buffers.get_mut(buffer) {
                slot.queued_on = None;
            }
        }
        self.captures.push(Capture {
            voice,
            params: state.params,
            position: state.position,
            samples: state.captured,
            sample_rate: state.sample_rate,
        });
        Ok(())
    }
}
