use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use spatial_tts::{
    driver::{self, TICK_INTERVAL},
    engines::kitten::KittenFactory,
    AudioDevice, ClientConfig, PlaybackDriver, SpeakRequestBuilder,
    SpeakerRegistry, SpeakerState, SpeechService,
};

type Driver<D> = PlaybackDriver<D, Arc<SpeakerRegistry>>;

/// Tick until everything said has been played, or two minutes pass.
fn play_until_idle<D: AudioDevice>(
    driver: &mut Driver<D>,
    service: &SpeechService,
    mut advance: impl FnMut(&mut D),
) {
    let start = Instant::now();
    // Give the engines time to load before deciding the pipeline is idle.
    while start.elapsed() < Duration::from_secs(120) {
        driver.tick();
        advance(driver.device_mut());
        std::thread::sleep(TICK_INTERVAL);
        if start.elapsed() > Duration::from_secs(2)
            && driver.active_streams() == 0
            && service.pool().active_count() == 0
        {
            break;
        }
    }
    let loaded = service
        .pool()
        .snapshot()
        .iter()
        .filter(|slot| slot.engine_loaded == Some(true))
        .count();
    println!(
        "Pipeline idle after {:.2?} ({}, {loaded} engines loaded)",
        start.elapsed(),
        service.speaker_count()
    );
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    // Usage: speak [espeak-language]
    let language = std::env::args().nth(1).unwrap_or_else(|| "en-us".to_string());

    let config = ClientConfig::load(&PathBuf::from("spatial-tts.json"))?.shared();
    let factory = Arc::new(
        KittenFactory::new("models/kitten-nano-en-v0_2-fp16").with_language(language),
    );
    let registry = Arc::new(SpeakerRegistry::new());
    registry.update("villager", SpeakerState::alive_at([8.0, 0.0, 3.0]));

    let (handle, commands) = driver::channel();
    let service = SpeechService::new(config.clone(), factory, handle);

    service.greet();
    service.speak(
        SpeakRequestBuilder::default()
            .text("Welcome, traveller. The road north is closed until the storm passes.")
            .speaker_id("villager")
            .voice_id(3)
            .pitch(0.9)
            .build()?,
    );

    #[cfg(feature = "playback")]
    {
        let device = spatial_tts::RodioDevice::open_default()?;
        let mut driver = PlaybackDriver::new(device, registry, service.pool(), config, commands);
        play_until_idle(&mut driver, &service, |_| {});
        service.dispose();
        driver.shutdown();
    }

    #[cfg(not(feature = "playback"))]
    {
        let mut driver = PlaybackDriver::new(
            spatial_tts::SoftwareDevice::new(),
            registry,
            service.pool(),
            config,
            commands,
        );
        play_until_idle(&mut driver, &service, |device| device.advance(TICK_INTERVAL));

        for (i, capture) in driver.device().captures().iter().enumerate() {
            let path = PathBuf::from(format!("speaker-{i}.wav"));
            capture.write_wav(&path)?;
            println!(
                "Saved {:.2}s of audio at {:?} to {}",
                capture.duration_secs(),
                capture.position,
                path.display()
            );
        }
        service.dispose();
        driver.shutdown();
    }

    Ok(())
}
