//! Conversion of raw engine output into fixed-size PCM16 chunks.

use std::panic::{self, AssertUnwindSafe};

use crate::stream::{Chunk, UtteranceStream};

/// Samples per queued chunk (~128 ms at 16 kHz).
///
/// Smaller chunks start playback sooner but allocate and churn the queue more.
pub const STREAM_CHUNK_SAMPLES: usize = 2048;

/// Scale a float sample in [-1, 1] to PCM16, clamping after gain is applied.
pub fn to_pcm16(sample: f32, gain: f32, base_volume: f32) -> i16 {
    let scaled = (sample * gain * base_volume).clamp(-1.0, 1.0);
    (scaled * i16::MAX as f32).round() as i16
}

/// Growable accumulator that cuts converted samples into chunks.
#[derive(Debug)]
pub struct SampleChunker {
    builder: Vec<i16>,
    chunk_size: usize,
    gain: f32,
    base_volume: f32,
}

impl SampleChunker {
    pub fn new(chunk_size: usize, gain: f32, base_volume: f32) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            builder: Vec::with_capacity(chunk_size * 2),
            chunk_size,
            gain,
            base_volume,
        }
    }

    /// Convert `raw` and hand every completed chunk to `emit`, in order.
    pub fn push(&mut self, raw: &[f32], mut emit: impl FnMut(Chunk)) {
        for &sample in raw {
            self.builder
                .push(to_pcm16(sample, self.gain, self.base_volume));
            if self.builder.len() >= self.chunk_size {
                let chunk: Chunk = self.builder[..self.chunk_size].into();
                self.builder.drain(..self.chunk_size);
                emit(chunk);
            }
        }
    }

    /// Samples accumulated but not yet emitted.
    pub fn pending(&self) -> usize {
        self.builder.len()
    }

    /// Take whatever is left as a final, possibly short, chunk.
    pub fn finish(&mut self) -> Option<Chunk> {
        if self.builder.is_empty() {
            return None;
        }
        let tail: Chunk = self.builder.as_slice().into();
        self.builder.clear();
        Some(tail)
    }

    pub fn clear(&mut self) {
        self.builder.clear();
    }
}

/// Progress callback target handed to a synthesis engine for one utterance.
pub(crate) struct StreamSink<'a> {
    chunker: SampleChunker,
    stream: &'a UtteranceStream,
}

impl<'a> StreamSink<'a> {
    pub(crate) fn new(stream: &'a UtteranceStream, chunk_size: usize, base_volume: f32) -> Self {
        Self {
            chunker: SampleChunker::new(chunk_size, stream.settings().gain, base_volume),
            stream,
        }
    }

    /// Returns whether the engine should keep generating. Never unwinds into
    /// the engine; a panic while chunking is treated as a stop request.
    pub(crate) fn on_progress(&mut self, samples: &[f32], _progress: f32) -> bool {
        let stream = self.stream;
        if stream.is_cancelled() {
            return false;
        }

        let chunker = &mut self.chunker;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            chunker.push(samples, |chunk| {
                if !stream.is_cancelled() {
                    stream.push(chunk);
                }
            });
        }));

        match outcome {
            Ok(()) => !stream.is_cancelled(),
            Err(_) => {
                log::warn!("Chunking panicked for stream {}; stopping", stream.id());
                false
            }
        }
    }

    /// Flush the partial tail (unless cancelled) and mark the stream ended.
    pub(crate) fn finish(mut self) {
        if self.stream.is_cancelled() {
            self.chunker.clear();
        } else if let Some(tail) = self.chunker.finish() {
            self.stream.push(tail);
        }
        self.stream.mark_ended();
    }
}

#[cfg(test)]
mod tests {
    use super::{to_pcm16, SampleChunker, StreamSink};
    use crate::stream::{UtteranceStream, VoiceSettings};

    #[test]
    fn pcm16_matches_scaled_round() {
        let cases = [(0.0_f32, 1.0_f32, 1.0_f32), (0.25, 1.0, 2.0), (-0.3, 1.5, 2.0), (0.1, 0.5, 1.0)];
        for (s, g, v) in cases {
            let expected = ((s * g * v).clamp(-1.0, 1.0) * 32767.0).round() as i16;
            assert_eq!(to_pcm16(s, g, v), expected, "s={s} g={g} v={v}");
        }
    }

    #[test]
    fn pcm16_clamps_overdriven_samples() {
        assert_eq!(to_pcm16(0.9, 2.0, 2.0), i16::MAX);
        assert_eq!(to_pcm16(-0.9, 2.0, 2.0), -i16::MAX);
    }

    #[test]
    fn emits_full_chunks_and_keeps_remainder() {
        let mut chunker = SampleChunker::new(4, 1.0, 1.0);
        let mut chunks = Vec::new();
        chunker.push(&[0.0; 10], |c| chunks.push(c));

        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.len() == 4));
        assert_eq!(chunker.pending(), 2);
        assert_eq!(chunker.finish().map(|c| c.len()), Some(2));
        assert_eq!(chunker.finish(), None);
    }

    #[test]
    fn chunks_reassemble_to_every_sample_in_order() {
        let raw: Vec<f32> = (0..5000).map(|i| ((i % 200) as f32 - 100.0) / 400.0).collect();
        let mut chunker = SampleChunker::new(2048, 1.0, 1.0);
        let mut out: Vec<i16> = Vec::new();

        // Feed in uneven slices like a real engine would.
        for piece in raw.chunks(777) {
            chunker.push(piece, |c| out.extend_from_slice(&c));
        }
        if let Some(tail) = chunker.finish() {
            out.extend_from_slice(&tail);
        }

        let expected: Vec<i16> = raw.iter().map(|&s| to_pcm16(s, 1.0, 1.0)).collect();
        assert_eq!(out, expected);
    }

    #[test]
    fn sink_stops_and_discards_after_cancel() {
        let stream = UtteranceStream::new(VoiceSettings::default());
        let mut sink = StreamSink::new(&stream, 4, 1.0);

        assert!(sink.on_progress(&[0.1; 6], 0.5));
        assert_eq!(stream.pending_chunks(), 1);

        stream.cancel();
        assert!(!sink.on_progress(&[0.1; 8], 1.0));
        assert_eq!(stream.pending_chunks(), 1);

        sink.finish();
        assert_eq!(stream.pending_chunks(), 1, "cancelled tail must not be flushed");
        assert!(stream.is_ended());
    }

    #[test]
    fn sink_flushes_tail_on_normal_finish() {
        let stream = UtteranceStream::new(VoiceSettings::default());
        let mut sink = StreamSink::new(&stream, 4, 1.0);
        assert!(sink.on_progress(&[0.2; 5], 1.0));
        sink.finish();

        assert_eq!(stream.pop().map(|c| c.len()), Some(4));
        assert_eq!(stream.pop().map(|c| c.len()), Some(1));
        assert!(stream.is_ended());
    }
}
