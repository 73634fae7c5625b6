//! Background synthesis: one thread per utterance.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};

use crate::cancel::CancelScope;
use crate::chunker::StreamSink;
use crate::driver::DriverHandle;
use crate::pool::Speaker;
use crate::stream::UtteranceStream;
use crate::{BoxError, EngineFactory, SynthesisEngine};

/// How long a worker blocks on a contended lock before re-checking cancellation.
const LOCK_POLL: Duration = Duration::from_millis(20);

/// Engine instance owned by one slot, created lazily by the slot's first worker.
///
/// Holding the lock is what makes a worker the slot's single producer: a
/// superseded worker keeps it until its generation call notices cancellation.
#[derive(Default)]
pub struct SlotEngine {
    instance: Mutex<Option<Box<dyn SynthesisEngine>>>,
}

impl SlotEngine {
    /// Whether an engine has been constructed. Returns `None` while a worker
    /// is using the slot.
    pub fn is_loaded(&self) -> Option<bool> {
        self.instance.try_lock().map(|engine| engine.is_some())
    }
}

/// Process-wide single permit serializing engine construction across slots.
#[derive(Default)]
pub struct EngineGate {
    permit: Mutex<()>,
}

impl EngineGate {
    pub fn new() -> Self {
        Self::default()
    }

    fn enter(&self, cancel: &CancelScope) -> Option<MutexGuard<'_, ()>> {
        lock_unless_cancelled(&self.permit, cancel)
    }
}

fn lock_unless_cancelled<'a, T>(
    mutex: &'a Mutex<T>,
    cancel: &CancelScope,
) -> Option<MutexGuard<'a, T>> {
    loop {
        if cancel.is_cancelled() {
            return None;
        }
        if let Some(guard) = mutex.try_lock_for(LOCK_POLL) {
            return Some(guard);
        }
    }
}

/// Everything a worker needs that outlives a single request.
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub factory: Arc<dyn EngineFactory>,
    pub gate: Arc<EngineGate>,
    pub driver: DriverHandle,
    pub num_threads: usize,
    pub base_volume: f32,
    pub chunk_size: usize,
}

pub(crate) struct SynthesisJob {
    pub slot: usize,
    pub speaker: Speaker,
    pub text: String,
    pub voice_id: i32,
    pub speed: f32,
    pub stream: Arc<UtteranceStream>,
    pub engine: Arc<SlotEngine>,
}

pub(crate) fn spawn(ctx: WorkerContext, job: SynthesisJob) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("tts-slot-{}", job.slot))
        .spawn(move || run(&ctx, job))
}

pub(crate) fn run(ctx: &WorkerContext, job: SynthesisJob) {
    if job.stream.is_cancelled() {
        job.stream.mark_ended();
        return;
    }

    ctx.driver
        .start(job.slot, job.speaker.clone(), Arc::clone(&job.stream));

    let mut sink = StreamSink::new(&job.stream, ctx.chunk_size, ctx.base_volume);
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| synthesize(ctx, &job, &mut sink)));
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::warn!("Synthesis failed for slot {}: {e}", job.slot),
        Err(_) => log::warn!("Synthesis panicked for slot {}", job.slot),
    }
    sink.finish();
}

fn synthesize(
    ctx: &WorkerContext,
    job: &SynthesisJob,
    sink: &mut StreamSink<'_>,
) -> Result<(), BoxError> {
    let cancel = job.stream.cancel_scope();
    let Some(mut engine) = lock_unless_cancelled(&job.engine.instance, cancel) else {
        return Ok(());
    };

    if engine.is_none() {
        // The slot lock is held, so nobody else can be building this slot's engine.
        let Some(_permit) = ctx.gate.enter(cancel) else {
            return Ok(());
        };
        let started = Instant::now();
        let created = ctx.factory.create(ctx.num_threads)?;
        log::info!(
            "Initialized engine for slot {} in {}ms",
            job.slot,
            started.elapsed().as_millis()
        );
        *engine = Some(created);
    }

    if cancel.is_cancelled() {
        return Ok(());
    }
    let Some(instance) = engine.as_mut() else {
        return Ok(());
    };

    job.stream.set_sample_rate(instance.sample_rate());
    instance.generate_streaming(&job.text, job.speed, job.voice_id, &mut |samples, progress| {
        sink.on_progress(samples, progress)
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::{run, EngineGate, SlotEngine, SynthesisJob, WorkerContext};
    use crate::chunker::to_pcm16;
    use crate::driver::{self, DriverCommand};
    use crate::pool::Speaker;
    use crate::stream::{UtteranceStream, VoiceSettings};
    use crate::{BoxError, EngineFactory, SynthesisEngine};

    struct RampEngine {
        total: usize,
        step: usize,
    }

    impl SynthesisEngine for RampEngine {
        fn sample_rate(&self) -> u32 {
            22_050
        }

        fn generate_streaming(
            &mut self,
            _text: &str,
            _speed: f32,
            _voice_id: i32,
            on_progress: &mut dyn FnMut(&[f32], f32) -> bool,
        ) -> Result<(), BoxError> {
            let samples: Vec<f32> = (0..self.total).map(|i| (i % 100) as f32 / 200.0).collect();
            for piece in samples.chunks(self.step) {
                if !on_progress(piece, 0.0) {
                    break;
                }
            }
            Ok(())
        }
    }

    struct CountingFactory {
        created: AtomicUsize,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        fail: bool,
    }

    impl CountingFactory {
        fn new(fail: bool) -> Self {
            Self {
                created: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                fail,
            }
        }
    }

    impl EngineFactory for CountingFactory {
        fn create(&self, _num_threads: usize) -> Result<Box<dyn SynthesisEngine>, BoxError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(30));
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if self.fail {
                return Err("model assets missing".into());
            }
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(RampEngine {
                total: 5000,
                step: 700,
            }))
        }
    }

    fn context(
        factory: Arc<CountingFactory>,
    ) -> (WorkerContext, crossbeam_channel::Receiver<DriverCommand>) {
        let (handle, commands) = driver::channel();
        let ctx = WorkerContext {
            factory,
            gate: Arc::new(EngineGate::new()),
            driver: handle,
            num_threads: 1,
            base_volume: 1.0,
            chunk_size: 2048,
        };
        (ctx, commands)
    }

    fn job(slot: usize, engine: &Arc<SlotEngine>) -> SynthesisJob {
        SynthesisJob {
            slot,
            speaker: Speaker::Local,
            text: "hello".to_string(),
            voice_id: 0,
            speed: 1.0,
            stream: Arc::new(UtteranceStream::new(VoiceSettings::default())),
            engine: Arc::clone(engine),
        }
    }

    #[test]
    fn streams_every_sample_then_ends() {
        let factory = Arc::new(CountingFactory::new(false));
        let (ctx, commands) = context(Arc::clone(&factory));
        let engine = Arc::new(SlotEngine::default());
        let job = job(0, &engine);
        let stream = Arc::clone(&job.stream);

        run(&ctx, job);

        assert!(matches!(commands.try_recv(), Ok(DriverCommand::Start { slot: 0, .. })));
        assert!(stream.is_ended());
        assert_eq!(stream.sample_rate(), 22_050);

        let mut lengths = Vec::new();
        let mut samples = Vec::new();
        while let Some(chunk) = stream.pop() {
            lengths.push(chunk.len());
            samples.extend_from_slice(&chunk);
        }
        assert_eq!(lengths, vec![2048, 2048, 904]);
        let expected: Vec<i16> = (0..5000)
            .map(|i| to_pcm16((i % 100) as f32 / 200.0, 1.0, 1.0))
            .collect();
        assert_eq!(samples, expected);
        assert_eq!(engine.is_loaded(), Some(true));
    }

    #[test]
    fn engine_is_built_once_per_slot() {
        let factory = Arc::new(CountingFactory::new(false));
        let (ctx, _commands) = context(Arc::clone(&factory));
        let engine = Arc::new(SlotEngine::default());

        run(&ctx, job(0, &engine));
        run(&ctx, job(0, &engine));

        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn construction_is_serialized_across_slots() {
        let factory = Arc::new(CountingFactory::new(false));
        let (ctx, _commands) = context(Arc::clone(&factory));

        let handles: Vec<_> = (0..4)
            .map(|slot| {
                let ctx = ctx.clone();
                let engine = Arc::new(SlotEngine::default());
                thread::spawn(move || run(&ctx, job(slot, &engine)))
            })
            .collect();
        for handle in handles {
            handle.join().expect("worker panicked");
        }

        assert_eq!(factory.created.load(Ordering::SeqCst), 4);
        assert_eq!(factory.peak.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_construction_ends_stream_and_retries_next_time() {
        let factory = Arc::new(CountingFactory::new(true));
        let (ctx, _commands) = context(Arc::clone(&factory));
        let engine = Arc::new(SlotEngine::default());

        let first = job(0, &engine);
        let stream = Arc::clone(&first.stream);
        run(&ctx, first);
        assert!(stream.is_ended());
        assert!(stream.is_drained());
        assert_eq!(engine.is_loaded(), Some(false));

        run(&ctx, job(0, &engine));
        assert_eq!(factory.in_flight.load(Ordering::SeqCst), 0);
        assert_eq!(factory.peak.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancelled_before_start_does_nothing() {
        let factory = Arc::new(CountingFactory::new(false));
        let (ctx, commands) = context(Arc::clone(&factory));
        let engine = Arc::new(SlotEngine::default());
        let job = job(0, &engine);
        job.stream.cancel();
        let stream = Arc::clone(&job.stream);

        run(&ctx, job);

        assert!(commands.try_recv().is_err());
        assert!(stream.is_ended());
        assert_eq!(factory.created.load(Ordering::SeqCst), 0);
    }
}
