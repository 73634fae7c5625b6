//! Tick-driven playback of utterance streams.
//!
//! The driver owns the audio device. Other threads reach it only through a
//! [`DriverHandle`], whose commands are drained at the start of every tick on
//! the thread that calls [`PlaybackDriver::tick`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};

use crate::cancel::CancelScope;
use crate::config::SharedConfig;
use crate::device::{AudioDevice, BufferHandle, DeviceError, VoiceHandle, VoiceParams};
use crate::pool::{SlotPool, Speaker};
use crate::position::SpeakerLocator;
use crate::stream::UtteranceStream;

/// Device buffers cycled per voice.
pub const RING_SIZE: usize = 6;

/// Default interval between ticks when the driver runs its own loop.
pub const TICK_INTERVAL: Duration = Duration::from_millis(16);

#[derive(Debug)]
pub enum DriverCommand {
    /// Begin playing `stream` on `slot`, replacing whatever the slot played.
    Start {
        slot: usize,
        speaker: Speaker,
        stream: Arc<UtteranceStream>,
    },
    /// Stop `slot` if it is still playing the stream with this id.
    Stop { slot: usize, stream_id: u64 },
    StopAll,
}

/// Fire-and-forget sender for [`DriverCommand`]s.
#[derive(Debug, Clone)]
pub struct DriverHandle {
    sender: Sender<DriverCommand>,
}

impl DriverHandle {
    fn send(&self, command: DriverCommand) {
        if self.sender.send(command).is_err() {
            log::debug!("Playback driver is gone; dropping command");
        }
    }

    pub(crate) fn start(&self, slot: usize, speaker: Speaker, stream: Arc<UtteranceStream>) {
        self.send(DriverCommand::Start {
            slot,
            speaker,
            stream,
        });
    }

    pub(crate) fn stop(&self, slot: usize, stream_id: u64) {
        self.send(DriverCommand::Stop { slot, stream_id });
    }

    pub fn stop_all(&self) {
        self.send(DriverCommand::StopAll);
    }
}

/// Create the command channel connecting request threads to a driver.
pub fn channel() -> (DriverHandle, Receiver<DriverCommand>) {
    let (sender, receiver) = crossbeam_channel::unbounded();
    (DriverHandle { sender }, receiver)
}

struct ActiveStream {
    stream: Arc<UtteranceStream>,
    speaker: Speaker,
    voice: VoiceHandle,
    ring: Vec<BufferHandle>,
    /// Ring buffers not currently queued on the voice.
    free: Vec<BufferHandle>,
    last_position_update: Option<Instant>,
}

enum Progress {
    Playing,
    Finished,
    Cancelled,
    SpeakerLost,
}

pub struct PlaybackDriver<D: AudioDevice, L: SpeakerLocator> {
    device: D,
    locator: L,
    pool: Arc<SlotPool>,
    config: SharedConfig,
    commands: Receiver<DriverCommand>,
    active: BTreeMap<usize, ActiveStream>,
}

impl<D: AudioDevice, L: SpeakerLocator> PlaybackDriver<D, L> {
    pub fn new(
        device: D,
        locator: L,
        pool: Arc<SlotPool>,
        config: SharedConfig,
        commands: Receiver<DriverCommand>,
    ) -> Self {
        Self {
            device,
            locator,
            pool,
            config,
            commands,
            active: BTreeMap::new(),
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// Number of slots with live device resources.
    pub fn active_streams(&self) -> usize {
        self.active.len()
    }

    /// Voice currently playing for `slot`, if any.
    pub fn voice_for(&self, slot: usize) -> Option<VoiceHandle> {
        self.active.get(&slot).map(|active| active.voice)
    }

    pub fn tick(&mut self) {
        self.tick_at(Instant::now());
    }

    /// Apply pending commands, then pump every active stream once.
    pub fn tick_at(&mut self, now: Instant) {
        while let Ok(command) = self.commands.try_recv() {
            self.apply(command);
        }

        let refresh = Duration::from_millis(self.config.read().position_refresh_ms);
        let slots: Vec<usize> = self.active.keys().copied().collect();
        for slot in slots {
            let Some(active) = self.active.get_mut(&slot) else {
                continue;
            };
            let progress = match pump(&mut self.device, &self.locator, active, refresh, now) {
                Ok(progress) => progress,
                Err(e) => {
                    log::warn!("Playback failed on slot {slot}: {e}");
                    Progress::Cancelled
                }
            };
            match progress {
                Progress::Playing => {}
                Progress::Finished => self.finish(slot),
                Progress::Cancelled | Progress::SpeakerLost => {
                    if let Some(active) = self.active.get(&slot) {
                        active.stream.cancel();
                    }
                    self.finish(slot);
                }
            }
        }
    }

    /// Tick every `interval` until `shutdown` is cancelled, then stop everything.
    pub fn run(&mut self, interval: Duration, shutdown: &CancelScope) {
        while !shutdown.is_cancelled() {
            let started = Instant::now();
            self.tick_at(started);
            thread::sleep(interval.saturating_sub(started.elapsed()));
        }
        self.shutdown();
    }

    /// Tear down every stream and release its slot.
    pub fn shutdown(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            self.apply(command);
        }
        let slots: Vec<usize> = self.active.keys().copied().collect();
        for slot in slots {
            if let Some(active) = self.active.get(&slot) {
                active.stream.cancel();
            }
            self.finish(slot);
        }
    }

    fn apply(&mut self, command: DriverCommand) {
        match command {
            DriverCommand::Start {
                slot,
                speaker,
                stream,
            } => self.start(slot, speaker, stream),
            DriverCommand::Stop { slot, stream_id } => {
                if self.active.get(&slot).map(|a| a.stream.id()) == Some(stream_id) {
                    self.finish(slot);
                }
            }
            DriverCommand::StopAll => {
                let slots: Vec<usize> = self.active.keys().copied().collect();
                for slot in slots {
                    self.finish(slot);
                }
            }
        }
    }

    fn start(&mut self, slot: usize, speaker: Speaker, stream: Arc<UtteranceStream>) {
        if stream.is_cancelled() {
            return;
        }
        if self.active.contains_key(&slot) {
            self.finish(slot);
        }
        if !self.pool.mark_output_live(slot, stream.id()) {
            return;
        }

        let params = self.voice_params(&speaker, &stream);
        match open_voice(&mut self.device, &params) {
            Ok((voice, ring)) => {
                self.active.insert(
                    slot,
                    ActiveStream {
                        stream,
                        speaker,
                        voice,
                        free: ring.clone(),
                        ring,
                        last_position_update: None,
                    },
                );
            }
            Err(e) => {
                log::warn!("Could not open a voice for slot {slot}: {e}");
                stream.cancel();
                self.pool.release(slot, stream.id());
            }
        }
    }

    fn voice_params(&self, speaker: &Speaker, stream: &UtteranceStream) -> VoiceParams {
        let config = self.config.read();
        let settings = stream.settings();
        let base = VoiceParams {
            pitch: settings.pitch,
            reference_distance: config.zero_distance,
            max_distance: config.max_distance,
            min_gain: 0.0,
            max_gain: 1.0,
            ..VoiceParams::default()
        };
        match speaker.remote_id() {
            None => VoiceParams {
                relative: true,
                rolloff: 0.0,
                position: [0.0; 3],
                ..base
            },
            Some(id) => VoiceParams {
                relative: false,
                rolloff: settings.falloff,
                position: self
                    .locator
                    .locate(id)
                    .map(|state| state.position)
                    .unwrap_or([0.0; 3]),
                ..base
            },
        }
    }

    /// Free the slot's device resources and hand the slot back to the pool.
    fn finish(&mut self, slot: usize) {
        let Some(active) = self.active.remove(&slot) else {
            return;
        };
        close_voice(&mut self.device, slot, &active);
        active.stream.mark_ended();
        self.pool.release(slot, active.stream.id());
    }
}

fn open_voice<D: AudioDevice>(
    device: &mut D,
    params: &VoiceParams,
) -> Result<(VoiceHandle, Vec<BufferHandle>), DeviceError> {
    let voice = device.create_voice(params)?;
    let mut ring = Vec::with_capacity(RING_SIZE);
    for _ in 0..RING_SIZE {
        match device.create_buffer() {
            Ok(buffer) => ring.push(buffer),
            Err(e) => {
                for buffer in ring {
                    if let Err(cleanup) = device.delete_buffer(buffer) {
                        log::warn!("Deleting {buffer:?} after a failed open: {cleanup}");
                    }
                }
                if let Err(cleanup) = device.delete_voice(voice) {
                    log::warn!("Deleting {voice:?} after a failed open: {cleanup}");
                }
                return Err(e);
            }
        }
    }
    Ok((voice, ring))
}

/// Each step is attempted even if an earlier one failed.
fn close_voice<D: AudioDevice>(device: &mut D, slot: usize, active: &ActiveStream) {
    if let Err(e) = device.stop(active.voice) {
        log::warn!("Slot {slot}: stop failed: {e}");
    }
    if let Err(e) = device.clear_queue(active.voice) {
        log::warn!("Slot {slot}: clearing buffer queue failed: {e}");
    }
    for &buffer in &active.ring {
        if let Err(e) = device.delete_buffer(buffer) {
            log::warn!("Slot {slot}: deleting {buffer:?} failed: {e}");
        }
    }
    if let Err(e) = device.delete_voice(active.voice) {
        log::warn!("Slot {slot}: deleting voice failed: {e}");
    }
}

fn pump<D: AudioDevice, L: SpeakerLocator>(
    device: &mut D,
    locator: &L,
    active: &mut ActiveStream,
    refresh: Duration,
    now: Instant,
) -> Result<Progress, DeviceError> {
    let stream = &active.stream;
    if stream.is_cancelled() {
        return Ok(Progress::Cancelled);
    }
    let voice = active.voice;

    for _ in 0..device.processed_count(voice)? {
        let buffer = device.unqueue_buffer(voice)?;
        active.free.push(buffer);
    }

    // Refill every free ring buffer we have data for; on a cold start or after
    // starvation that primes the whole ring.
    while let Some(&buffer) = active.free.last() {
        let Some(chunk) = stream.pop() else {
            break;
        };
        device.upload(buffer, &chunk, stream.sample_rate())?;
        device.queue_buffer(voice, buffer)?;
        active.free.pop();
    }

    let queued = device.queued_count(voice)?;
    if queued > 0 && !device.is_playing(voice)? {
        device.play(voice)?;
    }

    if let Some(id) = active.speaker.remote_id() {
        let due = active
            .last_position_update
            .map_or(true, |last| now.saturating_duration_since(last) >= refresh);
        if due {
            active.last_position_update = Some(now);
            match locator.locate(id) {
                Some(state) if state.alive => device.set_position(voice, state.position)?,
                _ => {
                    log::debug!("Speaker {id} is gone; stopping its stream");
                    return Ok(Progress::SpeakerLost);
                }
            }
        }
    }

    if stream.is_ended() && stream.is_drained() && queued == 0 {
        return Ok(Progress::Finished);
    }
    Ok(Progress::Playing)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use super::{channel, DriverHandle, PlaybackDriver, RING_SIZE};
    use crate::config::ClientConfig;
    use crate::device::{AudioDevice, SoftwareDevice};
    use crate::pool::{SlotPool, Speaker};
    use crate::position::{SpeakerRegistry, SpeakerState};
    use crate::stream::VoiceSettings;

    struct Rig {
        handle: DriverHandle,
        pool: Arc<SlotPool>,
        registry: Arc<SpeakerRegistry>,
        driver: PlaybackDriver<SoftwareDevice, Arc<SpeakerRegistry>>,
    }

    fn rig() -> Rig {
        let (handle, commands) = channel();
        let pool = Arc::new(SlotPool::new(4, handle.clone()));
        let registry = Arc::new(SpeakerRegistry::new());
        let driver = PlaybackDriver::new(
            SoftwareDevice::new(),
            Arc::clone(&registry),
            Arc::clone(&pool),
            ClientConfig::default().shared(),
            commands,
        );
        Rig {
            handle,
            pool,
            registry,
            driver,
        }
    }

    fn chunk(value: i16, len: usize) -> Box<[i16]> {
        vec![value; len].into_boxed_slice()
    }

    #[test]
    fn plays_a_stream_to_completion_and_frees_the_slot() {
        let mut rig = rig();
        let lease = rig.pool.acquire(&Speaker::Local, VoiceSettings::default());
        for value in 1..=8 {
            lease.stream.push(chunk(value, 100));
        }
        lease.stream.mark_ended();
        rig.handle.start(lease.index, Speaker::Local, Arc::clone(&lease.stream));

        rig.driver.tick();
        assert_eq!(rig.driver.active_streams(), 1);
        let voice = rig.driver.voice_for(lease.index).unwrap();
        let device = rig.driver.device_mut();
        assert_eq!(device.queued_count(voice).unwrap(), RING_SIZE);
        assert!(device.is_playing(voice).unwrap());

        for _ in 0..10 {
            rig.driver.device_mut().play_out();
            rig.driver.tick();
        }

        assert_eq!(rig.driver.active_streams(), 0);
        let device = rig.driver.device();
        assert_eq!(device.live_voices(), 0);
        assert_eq!(device.live_buffers(), 0);
        let expected: Vec<i16> = (1..=8).flat_map(|v| vec![v; 100]).collect();
        assert_eq!(device.captures()[0].samples, expected);
        assert_eq!(rig.pool.active_count(), 0);
    }

    #[test]
    fn starved_voice_restarts_when_audio_arrives() {
        let mut rig = rig();
        let lease = rig.pool.acquire(&Speaker::Local, VoiceSettings::default());
        lease.stream.push(chunk(1, 50));
        rig.handle.start(lease.index, Speaker::Local, Arc::clone(&lease.stream));

        rig.driver.tick();
        let voice = rig.driver.voice_for(lease.index).unwrap();
        rig.driver.device_mut().play_out();
        assert!(!rig.driver.device_mut().is_playing(voice).unwrap());

        // Synthesis is behind: the spent buffer comes back and nothing is queued.
        rig.driver.tick();
        assert_eq!(rig.driver.active_streams(), 1);
        let device = rig.driver.device_mut();
        assert_eq!(device.queued_count(voice).unwrap(), 0);
        assert!(!device.is_playing(voice).unwrap());

        lease.stream.push(chunk(2, 50));
        lease.stream.push(chunk(3, 50));
        lease.stream.mark_ended();
        rig.driver.tick();
        let device = rig.driver.device_mut();
        assert_eq!(device.queued_count(voice).unwrap(), 2);
        assert!(device.is_playing(voice).unwrap());

        rig.driver.device_mut().play_out();
        rig.driver.tick();

        assert_eq!(rig.driver.active_streams(), 0);
        let expected: Vec<i16> = [1, 2, 3].iter().flat_map(|&v| vec![v; 50]).collect();
        assert_eq!(rig.driver.device().captures()[0].samples, expected);
    }

    #[test]
    fn local_voice_is_listener_relative() {
        let mut rig = rig();
        let settings = VoiceSettings {
            pitch: 1.2,
            ..VoiceSettings::default()
        };
        let lease = rig.pool.acquire(&Speaker::Local, settings);
        rig.handle.start(lease.index, Speaker::Local, lease.stream);
        rig.driver.tick();

        let voice = rig.driver.voice_for(lease.index).unwrap();
        let params = rig.driver.device().voice_params(voice).unwrap();
        assert!(params.relative);
        assert_eq!(params.rolloff, 0.0);
        assert_eq!(params.pitch, 1.2);
        assert_eq!(params.reference_distance, 2.0);
        assert_eq!(params.max_distance, 35.0);
    }

    #[test]
    fn remote_voice_follows_its_speaker() {
        let mut rig = rig();
        let speaker = Speaker::Remote("p1".to_string());
        rig.registry.update("p1", SpeakerState::alive_at([5.0, 0.0, 0.0]));
        let settings = VoiceSettings {
            falloff: 0.5,
            ..VoiceSettings::default()
        };
        let lease = rig.pool.acquire(&speaker, settings);
        rig.handle.start(lease.index, speaker, lease.stream);

        let t0 = Instant::now();
        rig.driver.tick_at(t0);
        let voice = rig.driver.voice_for(lease.index).unwrap();
        let params = rig.driver.device().voice_params(voice).unwrap();
        assert!(!params.relative);
        assert_eq!(params.rolloff, 0.5);
        assert_eq!(params.position, [5.0, 0.0, 0.0]);

        rig.registry.update("p1", SpeakerState::alive_at([6.0, 0.0, 0.0]));
        rig.driver.tick_at(t0 + Duration::from_millis(100));
        assert_eq!(rig.driver.device().voice_position(voice), Some([5.0, 0.0, 0.0]));

        rig.driver.tick_at(t0 + Duration::from_millis(600));
        assert_eq!(rig.driver.device().voice_position(voice), Some([6.0, 0.0, 0.0]));
    }

    #[test]
    fn lost_speaker_aborts_within_one_tick() {
        let mut rig = rig();
        let speaker = Speaker::Remote("p1".to_string());
        rig.registry.update("p1", SpeakerState::alive_at([1.0, 0.0, 0.0]));
        let lease = rig.pool.acquire(&speaker, VoiceSettings::default());
        lease.stream.push(chunk(3, 100));
        rig.handle.start(lease.index, speaker, Arc::clone(&lease.stream));

        let t0 = Instant::now();
        rig.driver.tick_at(t0);
        assert_eq!(rig.driver.active_streams(), 1);

        rig.registry.update(
            "p1",
            SpeakerState {
                position: [1.0, 0.0, 0.0],
                alive: false,
            },
        );
        rig.driver.tick_at(t0 + Duration::from_millis(500));

        assert_eq!(rig.driver.active_streams(), 0);
        assert!(lease.stream.is_cancelled());
        assert_eq!(rig.pool.active_count(), 0);
        assert_eq!(rig.driver.device().live_voices(), 0);
    }

    #[test]
    fn teardown_continues_past_failing_steps() {
        let mut rig = rig();
        let lease = rig.pool.acquire(&Speaker::Local, VoiceSettings::default());
        lease.stream.mark_ended();
        rig.handle.start(lease.index, Speaker::Local, Arc::clone(&lease.stream));
        rig.driver.device_mut().set_fail_buffer_deletes(true);

        rig.driver.tick();

        assert_eq!(rig.driver.active_streams(), 0);
        assert_eq!(rig.driver.device().live_voices(), 0, "voice deleted despite buffer failures");
        assert_eq!(rig.driver.device().live_buffers(), RING_SIZE);
        assert_eq!(rig.pool.active_count(), 0);
    }

    #[test]
    fn superseded_start_is_ignored() {
        let mut rig = rig();
        let old = rig.pool.acquire(&Speaker::Local, VoiceSettings::default());
        let new = rig.pool.acquire(&Speaker::Local, VoiceSettings::default());
        rig.handle.start(new.index, Speaker::Local, Arc::clone(&new.stream));
        rig.handle.start(old.index, Speaker::Local, Arc::clone(&old.stream));

        rig.driver.tick();

        assert_eq!(rig.driver.active_streams(), 1);
        assert_eq!(rig.pool.snapshot()[new.index].stream_id, Some(new.stream.id()));
        assert!(rig.pool.snapshot()[new.index].output_live);
    }

    #[test]
    fn stop_all_clears_every_stream() {
        let mut rig = rig();
        let a = rig.pool.acquire(&Speaker::Local, VoiceSettings::default());
        rig.registry.update("p2", SpeakerState::alive_at([0.0; 3]));
        let remote = Speaker::Remote("p2".to_string());
        let b = rig.pool.acquire(&remote, VoiceSettings::default());
        rig.handle.start(a.index, Speaker::Local, a.stream);
        rig.handle.start(b.index, remote, b.stream);
        rig.driver.tick();
        assert_eq!(rig.driver.active_streams(), 2);

        rig.pool.dispose();
        rig.driver.tick();
        assert_eq!(rig.driver.active_streams(), 0);
        assert_eq!(rig.driver.device().live_voices(), 0);
    }
}
