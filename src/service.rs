//! Request intake: turns chat lines into utterances on pooled speaker slots.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use derive_builder::Builder;
use rand::seq::SliceRandom;

use crate::chunker::STREAM_CHUNK_SAMPLES;
use crate::config::{ClientConfig, SharedConfig};
use crate::device::Position;
use crate::driver::DriverHandle;
use crate::pool::{SlotPool, Speaker};
use crate::position::within_hearing_range;
use crate::stream::VoiceSettings;
use crate::worker::{self, EngineGate, SynthesisJob, WorkerContext};
use crate::EngineFactory;

/// Messages longer than this (in characters) count as overlong.
pub const LONG_MESSAGE_CHARS: usize = 84;

/// Each pooled engine keeps roughly this much memory resident.
const ENGINE_FOOTPRINT_MB: usize = 25;

const SPEECH_SPEED: f32 = 1.0;

const GREETINGS: &[&str] = &[
    "Hello world!",
    "I have arrived!",
    "Greetings, all!",
    "Salutations, my friends.",
    "Hello. I'm new here!",
    "Good to be back.",
];

const OVERLONG_FALLBACKS: &[&str] = &[
    "I'm not saying all that out loud.",
    "Cool story.",
    "Most can say much with few words. I can't.",
    "What I have to say isn't of much substance.",
    "Something... Something... Long message.",
    "That message is too long to read out. Skipping it!",
];

/// Chat lines starting with these are commands, not speech.
const COMMAND_PREFIXES: &[char] = &['/', '.', '*', '!'];

/// One line of speech to synthesize.
#[derive(Debug, Clone, PartialEq, Builder)]
pub struct SpeakRequest {
    #[builder(setter(into))]
    pub text: String,
    #[builder(default)]
    pub voice_id: i32,
    #[builder(default = "1.0")]
    pub pitch: f32,
    /// Remote entity speaking; `None` (or blank) is the local player.
    #[builder(default, setter(into, strip_option))]
    pub speaker_id: Option<String>,
    /// Volume multiplier (shouting, whispering).
    #[builder(default = "1.0")]
    pub gain: f32,
    /// Distance rolloff multiplier for remote speakers.
    #[builder(default = "1.0")]
    pub falloff: f32,
}

/// Front door of the crate: owns the slot pool and dispatches synthesis workers.
pub struct SpeechService {
    config: SharedConfig,
    pool: Arc<SlotPool>,
    factory: Arc<dyn EngineFactory>,
    gate: Arc<EngineGate>,
    driver: DriverHandle,
    initialized: OnceLock<bool>,
    disposed: AtomicBool,
}

impl SpeechService {
    pub fn new(config: SharedConfig, factory: Arc<dyn EngineFactory>, driver: DriverHandle) -> Self {
        let max_speakers = config.read().max_speakers;
        warn_if_heavy(max_speakers);
        Self {
            pool: Arc::new(SlotPool::new(max_speakers, driver.clone())),
            config,
            factory,
            gate: Arc::new(EngineGate::new()),
            driver,
            initialized: OnceLock::new(),
            disposed: AtomicBool::new(false),
        }
    }

    /// The pool shared with the playback driver.
    pub fn pool(&self) -> Arc<SlotPool> {
        Arc::clone(&self.pool)
    }

    pub fn config(&self) -> ClientConfig {
        self.config.read().clone()
    }

    /// Queue `request` for synthesis and playback.
    ///
    /// Returns the id of the new utterance stream, or `None` if the request
    /// was dropped (blank text, failed initialisation, disposed service).
    /// Never blocks on synthesis and never fails loudly.
    pub fn speak(&self, request: SpeakRequest) -> Option<u64> {
        if self.disposed.load(Ordering::Acquire) || request.text.trim().is_empty() {
            return None;
        }
        let config = self.config();

        let text = if config.avoid_long_messages && request.text.chars().count() > LONG_MESSAGE_CHARS {
            pick(OVERLONG_FALLBACKS).to_string()
        } else {
            request.text
        };

        if !self.ensure_init() {
            log::warn!("Speech engine failed to initialize; dropping request");
            return None;
        }

        let speaker = Speaker::from_id(request.speaker_id.as_deref());
        let settings = VoiceSettings {
            pitch: request.pitch,
            gain: request.gain,
            falloff: request.falloff,
        };

        if config.debug_requests {
            log::info!(
                "Received {}ch message from {} at {} pitch with voice {}. Gain: {}, Falloff: {}.",
                text.chars().count(),
                speaker,
                request.pitch,
                request.voice_id,
                request.gain,
                request.falloff
            );
        }

        let lease = self.pool.acquire(&speaker, settings);
        let stream_id = lease.stream.id();
        let ctx = WorkerContext {
            factory: Arc::clone(&self.factory),
            gate: Arc::clone(&self.gate),
            driver: self.driver.clone(),
            num_threads: config.thread_mode.thread_count(),
            base_volume: config.base_volume,
            chunk_size: STREAM_CHUNK_SAMPLES,
        };
        let job = SynthesisJob {
            slot: lease.index,
            speaker: speaker.clone(),
            text,
            voice_id: request.voice_id,
            speed: SPEECH_SPEED,
            stream: lease.stream,
            engine: lease.engine,
        };

        if let Err(e) = worker::spawn(ctx, job) {
            log::warn!("Could not spawn synthesis worker for {speaker}: {e}");
            self.pool.cancel_speaker(&speaker);
            return None;
        }
        Some(stream_id)
    }

    /// Speak as the local player with the configured voice and pitch.
    ///
    /// Ignores chat commands and does nothing unless `hear_self` is enabled.
    pub fn speak_local(&self, text: &str, gain: f32) -> Option<u64> {
        if text.starts_with(COMMAND_PREFIXES) {
            return None;
        }
        let config = self.config();
        if !config.hear_self {
            return None;
        }
        self.speak(SpeakRequest {
            text: text.to_string(),
            voice_id: config.voice_id,
            pitch: config.player_pitch,
            speaker_id: None,
            // 2D playback is loud; keep it in a narrow band.
            gain: gain.clamp(0.5, 1.5),
            falloff: 1.0,
        })
    }

    /// Speak a random greeting as the local player. Used as a startup check.
    pub fn greet(&self) -> Option<u64> {
        let config = self.config();
        log::info!(
            "Threads available: {} (out of {})",
            config.thread_mode.thread_count(),
            num_cpus::get()
        );
        let greeting = pick(GREETINGS);
        log::info!("Initialization check: '{greeting}'");
        self.speak(SpeakRequest {
            text: greeting.to_string(),
            voice_id: config.voice_id,
            pitch: config.player_pitch,
            speaker_id: None,
            gain: 1.0,
            falloff: 1.0,
        })
    }

    /// Whether a remote speaker at `speaker` is within hearing range of `listener`.
    pub fn should_hear(&self, listener: Position, speaker: Position) -> bool {
        within_hearing_range(listener, speaker, self.config.read().hearing_range)
    }

    /// Status line: configured capacity and current pool size.
    pub fn speaker_count(&self) -> String {
        format!("{} ({} Active)", self.pool.max_speakers(), self.pool.len())
    }

    /// Replace the runtime configuration. New values apply to later requests.
    pub fn apply_config(&self, config: ClientConfig) {
        let config = config.sanitized();
        warn_if_heavy(config.max_speakers);
        self.pool.set_max_speakers(config.max_speakers);
        *self.config.write() = config;
    }

    /// Whether the one-time engine binding succeeded. Attempted at most once.
    pub fn ensure_init(&self) -> bool {
        *self.initialized.get_or_init(|| match self.factory.prepare() {
            Ok(()) => {
                log::info!("Speech engine initialized");
                true
            }
            Err(e) => {
                log::warn!("Speech engine initialization failed: {e}");
                false
            }
        })
    }

    /// Cancel everything and release every engine. Later requests are ignored.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.pool.dispose();
    }
}

impl Drop for SpeechService {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn pick(lines: &[&'static str]) -> &'static str {
    lines.choose(&mut rand::thread_rng()).copied().unwrap_or_default()
}

fn warn_if_heavy(max_speakers: usize) {
    if max_speakers > 8 {
        log::warn!(
            "max_speakers = {max_speakers} may keep about {} MB of engines resident",
            max_speakers * ENGINE_FOOTPRINT_MB
        );
    }
}
