//! Audio Pipeline (AP) — §4.2.
//!
//! Produces either a lazy sequence of fixed-size PCM frames (Mode A,
//! streaming backend) or windowed, container-repaired compressed chunks
//! (Mode B, batch backend) from a tab's audio graph. The render-thread
//! processor itself is out of this crate's scope (§1 Non-goals: no
//! capture-hardware binding); [`TabAudioSource`] is the trait a host
//! implements over its real WebAudio/platform capture graph, grounded in
//! the decoupling style of `thaumic-core::context::IpDetector` — a small
//! trait standing in for a platform capability the core never touches
//! directly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{AudioError, AudioResult};
use crate::message::{AudioChunk, AudioFrame};

/// One block of raw samples pulled from the tab's audio graph at its
/// native rate, before resampling/downmix (§4.2 "Acquisition").
#[derive(Debug, Clone)]
pub struct NativeAudioBlock {
    /// Interleaved float samples, one or more channels.
    pub samples: Vec<f32>,
    pub channel_count: usize,
    pub native_sample_rate: u32,
}

/// A tab's audio-only media stream, pulled block by block.
///
/// A real implementation mirrors audio to a playback sink and suppresses
/// tab-local playback per §4.2 "Acquisition"; those concerns live on the
/// host side of this trait, not in the pipeline itself.
#[async_trait]
pub trait TabAudioSource: Send {
    /// Returns the next block of native-rate samples, or `None` once the
    /// stream has ended (tab closed, track stopped).
    async fn next_block(&mut self) -> Option<NativeAudioBlock>;
}

/// Counters surfaced for diagnostics and for the §8 frame-count invariant.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub frames_emitted: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub samples_resampled: AtomicU64,
}

/// Linear-interpolation resampler tracking a fractional read position
/// across `process` calls so no samples are dropped or duplicated
/// (§4.2 "Resampling").
struct Resampler {
    /// Position into the *previous + current* sample buffer, in input-rate units.
    read_pos: f64,
    carry: Vec<f32>,
}

impl Resampler {
    fn new() -> Self {
        Self {
            read_pos: 0.0,
            carry: Vec::new(),
        }
    }

    /// Downmixes to mono (channel 0 only, §4.2 "Channel mixing") and
    /// resamples to `target_rate`, returning as many output samples as the
    /// available input supports. Leftover input is carried to the next call.
    fn process(&mut self, block: &NativeAudioBlock, target_rate: u32) -> Vec<f32> {
        let ch = block.channel_count.max(1);
        let mono: Vec<f32> = block
            .samples
            .chunks(ch)
            .map(|frame| frame[0])
            .collect();

        let mut input = std::mem::take(&mut self.carry);
        input.extend(mono);

        if input.len() < 2 {
            self.carry = input;
            return Vec::new();
        }

        let ratio = block.native_sample_rate as f64 / target_rate as f64;
        let mut out = Vec::new();
        let mut pos = self.read_pos;

        while (pos as usize) + 1 < input.len() {
            let i0 = pos as usize;
            let frac = pos - i0 as f64;
            let s0 = input[i0] as f64;
            let s1 = input[i0 + 1] as f64;
            out.push((s0 + (s1 - s0) * frac) as f32);
            pos += ratio;
        }

        // Carry the unconsumed tail (and fractional position relative to it).
        let consumed_whole = pos as usize;
        let keep_from = consumed_whole.min(input.len());
        self.read_pos = pos - keep_from as f64;
        self.carry = input[keep_from..].to_vec();

        out
    }
}

/// Clamps to `[-1, 1]` then scales to signed 16-bit (§4.2 "Sample conversion").
fn quantize(sample: f32) -> i16 {
    let clamped = sample.clamp(-1.0, 1.0);
    (clamped as f64 * 32767.0).floor() as i16
}

/// Mode A: lazy, infinite sequence of fixed-size 20ms/16kHz/mono PCM
/// frames, delivered to a bounded, non-blocking channel (§4.2, §5).
pub struct PcmFramePipeline {
    resampler: Resampler,
    pending: Vec<i16>,
    next_index: u64,
    stats: Arc<PipelineStats>,
}

impl PcmFramePipeline {
    pub fn new() -> Self {
        Self {
            resampler: Resampler::new(),
            pending: Vec::new(),
            next_index: 0,
            stats: Arc::new(PipelineStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }

    /// Feeds one native-rate block through the resampler/quantizer and
    /// returns every complete 320-sample frame it produces, in strictly
    /// increasing index order (§5 Ordering).
    pub fn push_block(&mut self, block: &NativeAudioBlock) -> Vec<AudioFrame> {
        let resampled = self.resampler.process(block, 16_000);
        self.stats
            .samples_resampled
            .fetch_add(resampled.len() as u64, Ordering::Relaxed);
        self.pending.extend(resampled.iter().map(|s| quantize(*s)));

        let mut frames = Vec::new();
        while self.pending.len() >= AudioFrame::SAMPLES_PER_FRAME {
            let frame_samples: Vec<i16> =
                self.pending.drain(..AudioFrame::SAMPLES_PER_FRAME).collect();
            let frame = AudioFrame::from_samples(self.next_index, &frame_samples);
            self.next_index += 1;
            self.stats.frames_emitted.fetch_add(1, Ordering::Relaxed);
            frames.push(frame);
        }
        frames
    }

    /// Runs the pipeline against a [`TabAudioSource`], forwarding frames
    /// through `tx` with drop-whole-frame back-pressure (§4.2 "Back-
    /// pressure"): if `tx` is saturated the frame is dropped, never
    /// partially sent, and the drop counter increments.
    pub async fn run(
        mut self,
        mut source: impl TabAudioSource,
        tx: mpsc::Sender<AudioFrame>,
    ) -> AudioResult<()> {
        while let Some(block) = source.next_block().await {
            for frame in self.push_block(&block) {
                if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(frame) {
                    self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                    log::warn!("[AP] frame dropped under backpressure");
                } else if tx.is_closed() {
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}

impl Default for PcmFramePipeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Mode B: windowed, container-repaired compressed chunks (§4.2 Mode B).
///
/// `step_sec = window_sec - overlap_sec`; each raw chunk beyond the first
/// is a continuation fragment with no valid standalone container header,
/// so the first chunk's header is spliced onto every later chunk before
/// it is handed to the batch backend (§4.2, §9 "chunk-0 container header").
pub struct WindowedChunker {
    window_sec: f64,
    step_sec: f64,
    next_index: u64,
    header: Option<Vec<u8>>,
    mime: String,
}

impl WindowedChunker {
    pub fn new(window_ms: u32, overlap_ms: u32, mime: impl Into<String>) -> Self {
        let window_sec = window_ms as f64 / 1000.0;
        let overlap_sec = overlap_ms as f64 / 1000.0;
        Self {
            window_sec,
            step_sec: window_sec - overlap_sec,
            next_index: 0,
            header: None,
            mime: mime.into(),
        }
    }

    /// Wraps raw encoded bytes for one window into an [`AudioChunk`],
    /// repairing the container header on every chunk after the first.
    pub fn wrap(&mut self, raw_bytes: Vec<u8>) -> AudioResult<AudioChunk> {
        let index = self.next_index;
        let start = index as f64 * self.step_sec;
        let end = start + self.window_sec;

        let bytes = match &self.header {
            None => {
                self.header = Some(raw_bytes.clone());
                raw_bytes
            }
            Some(header) => {
                let mut repaired = header.clone();
                repaired.extend_from_slice(&raw_bytes);
                repaired
            }
        };

        self.next_index += 1;

        Ok(AudioChunk {
            index,
            start_offset_sec: start.max(0.0),
            end_offset_sec: end,
            container_mime: self.mime.clone(),
            bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(samples: Vec<f32>, rate: u32) -> NativeAudioBlock {
        NativeAudioBlock {
            samples,
            channel_count: 1,
            native_sample_rate: rate,
        }
    }

    #[test]
    fn quantize_clamps_and_floors() {
        assert_eq!(quantize(2.0), 32767);
        assert_eq!(quantize(-2.0), -32767);
        assert_eq!(quantize(0.0), 0);
    }

    #[test]
    fn downmix_takes_channel_zero_only() {
        let stereo = NativeAudioBlock {
            samples: vec![1.0, -1.0, 0.5, -0.5],
            channel_count: 2,
            native_sample_rate: 16_000,
        };
        let mut resampler = Resampler::new();
        let out = resampler.process(&stereo, 16_000);
        // channel 0 samples only: [1.0, 0.5]; at 1:1 rate one point is emitted.
        assert!(out.iter().all(|s| *s >= 0.0));
    }

    #[test]
    fn frame_counts_conserve_samples_across_many_blocks() {
        let mut pipeline = PcmFramePipeline::new();
        let mut total_samples = 0usize;
        // 48kHz native, 1 second total split into 10 blocks of 100ms.
        for _ in 0..10 {
            let n = 4800;
            let samples: Vec<f32> = (0..n).map(|i| (i % 100) as f32 / 100.0 - 0.5).collect();
            let b = block(samples, 48_000);
            for f in pipeline.push_block(&b) {
                total_samples += f.sample_count;
            }
        }
        // §8 invariant 3: sum of sampleCount across frames in T seconds == T*16000 +/- one frame.
        let expected = 16_000;
        let diff = (total_samples as i64 - expected as i64).abs();
        assert!(diff <= AudioFrame::SAMPLES_PER_FRAME as i64);
    }

    #[test]
    fn frames_emitted_in_strictly_increasing_order() {
        let mut pipeline = PcmFramePipeline::new();
        let samples: Vec<f32> = (0..32_000).map(|i| (i % 7) as f32 / 7.0).collect();
        let frames = pipeline.push_block(&block(samples, 16_000));
        for pair in frames.windows(2) {
            assert!(pair[1].index > pair[0].index);
        }
    }

    #[test]
    fn windowed_chunker_first_chunk_defines_header() {
        let mut chunker = WindowedChunker::new(3000, 1000, "audio/webm");
        let header = vec![1, 2, 3, 4];
        let chunk0 = chunker.wrap(header.clone()).unwrap();
        assert_eq!(chunk0.index, 0);
        assert_eq!(chunk0.start_offset_sec, 0.0);
        assert_eq!(chunk0.bytes, header);
    }

    #[test]
    fn windowed_chunker_repairs_continuation_chunks() {
        let mut chunker = WindowedChunker::new(3000, 1000, "audio/webm");
        let header = vec![1, 2, 3, 4];
        chunker.wrap(header.clone()).unwrap();
        let continuation = vec![9, 9, 9];
        let chunk1 = chunker.wrap(continuation.clone()).unwrap();
        assert_eq!(chunk1.index, 1);
        assert_eq!(&chunk1.bytes[..4], &header[..]);
        assert_eq!(&chunk1.bytes[4..], &continuation[..]);
        assert_eq!(chunk1.container_mime, "audio/webm");
    }

    #[test]
    fn windowed_chunker_step_and_overlap_match_config() {
        let mut chunker = WindowedChunker::new(3000, 1000, "audio/webm");
        chunker.wrap(vec![0u8]).unwrap();
        let c1 = chunker.wrap(vec![0u8]).unwrap();
        let c2 = chunker.wrap(vec![0u8]).unwrap();
        assert_eq!(c1.start_offset_sec, 2.0);
        assert_eq!(c2.start_offset_sec, 4.0);
        assert_eq!(c1.end_offset_sec - c1.start_offset_sec, 3.0);
    }
}
