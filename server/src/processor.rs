//! Gap-aware PCM reconstruction and the 20 ms processing tick.
//!
//! Frames arrive in whatever order the transport produced them and are
//! processed strictly in that order. A sequence discontinuity is
//! repaired by extending the previous frame's last sample across the
//! missing interval, unless the gap is silly (≥ 500 ms), in which case
//! the stream is assumed to have resynchronised and nothing is
//! emitted. Reconstructed PCM accumulates in a little-endian byte FIFO
//! drained into the MP3 encoder on every tick.

use anyhow::Result;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use chuff_common::{
    AudioFrame, MetricsContext, BLOCK_DURATION_MS, SAMPLES_PER_BLOCK, SAMPLING_FREQUENCY,
};
use std::fs::File;
use std::io::Write;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::{Receiver, Sender};
use tracing::{debug, info, warn};

use crate::segment::{MediaControl, SegmentWriter};
use crate::stats::PipelineStats;

/// Guard against silly sequence number gaps.
pub const MAX_GAP_FILL_MS: usize = 500;

/// Sample count at and above which a gap is silly.
const SILLY_GAP_SAMPLES: usize = SAMPLING_FREQUENCY as usize * MAX_GAP_FILL_MS / 1000;

/// What is remembered of the most recent successfully processed frame:
/// enough to detect a sequence gap and to repair one.
#[derive(Debug, Clone, Copy)]
struct RecentFrame {
    // ---
    sequence: u16,

    /// Final sample, absent if the frame carried no audio
    last_sample: Option<i16>,
}

/// Sequence-gap repair and PCM accumulation.
///
/// Pure with respect to time and I/O; the [`run_processor`] loop owns
/// the clock, the channels and the encoder.
pub struct AudioProcessor {
    // ---
    /// Little-endian PCM bytes awaiting encoding
    pcm: BytesMut,

    /// The previous processed frame, if any
    recent: Option<RecentFrame>,

    stats: PipelineStats,
    metrics: MetricsContext,
}

impl AudioProcessor {
    // ---
    pub fn new(metrics: MetricsContext) -> Self {
        // ---
        Self {
            pcm: BytesMut::new(),
            recent: None,
            stats: PipelineStats::default(),
            metrics,
        }
    }

    /// Processes one frame in arrival order.
    ///
    /// Repairs the missing interval when the sequence number did not
    /// advance by exactly one, appends the frame's samples, then
    /// repairs the remainder of the block if the frame was short. A
    /// duplicate or reordered frame shows up as a wrapped (huge) gap,
    /// which the silly-gap guard swallows, so its content is simply
    /// appended.
    pub fn process_frame(&mut self, frame: &AudioFrame) {
        // ---
        if let Some(recent) = self.recent {
            let delta = frame.sequence.wrapping_sub(recent.sequence);
            if delta != 1 {
                debug!(
                    "sequence jump {} -> {} ({} block(s) missing)",
                    recent.sequence,
                    frame.sequence,
                    delta.wrapping_sub(1)
                );
                let missing_blocks = (delta as usize).wrapping_sub(1);
                self.handle_gap(missing_blocks.saturating_mul(SAMPLES_PER_BLOCK));
            }
        }

        for sample in &frame.samples {
            self.pcm.extend_from_slice(&sample.to_le_bytes());
        }

        if frame.samples.len() < SAMPLES_PER_BLOCK {
            self.handle_gap(SAMPLES_PER_BLOCK - frame.samples.len());
        }

        self.stats.record_frame(frame.samples.len() * 2);
        self.recent = Some(RecentFrame {
            sequence: frame.sequence,
            last_sample: frame.samples.last().copied(),
        });
    }

    /// Fills a gap of `samples` samples by extending the previous
    /// frame's last sample (silence if there is none), unless the gap
    /// is silly.
    fn handle_gap(&mut self, samples: usize) {
        // ---
        if samples >= SILLY_GAP_SAMPLES {
            info!("ignoring a silly gap of {} sample(s)", samples);
            self.stats.record_silly_gap();
            self.metrics.silly_gaps_total.inc();
            return;
        }

        let fill = self
            .recent
            .and_then(|recent| recent.last_sample)
            .unwrap_or(0)
            .to_le_bytes();

        self.pcm.reserve(samples * fill.len());
        for _ in 0..samples {
            self.pcm.extend_from_slice(&fill);
        }

        self.stats.record_gap(samples);
        self.metrics.gap_samples_filled_total.inc_by(samples as u64);
    }

    /// Bytes currently waiting in the PCM buffer.
    pub fn buffered_bytes(&self) -> usize {
        // ---
        self.pcm.len()
    }

    /// Takes everything in the PCM buffer, leaving it empty.
    pub fn drain_pcm(&mut self) -> Bytes {
        // ---
        self.pcm.split().freeze()
    }

    /// Logs final statistics.
    pub fn log_stats(&self) {
        // ---
        self.stats.log();
    }
}

/// Runs the processing tick until the frame channel closes.
///
/// Every [`BLOCK_DURATION_MS`] the pending frames are drained through
/// [`AudioProcessor::process_frame`], the PCM buffer is encoded (and
/// mirrored to `raw_pcm`, if given), and the segment is rotated once it
/// holds fifteen seconds of audio. Encode and file errors abandon the
/// affected audio and keep the loop alive; only channel closure ends
/// it.
pub async fn run_processor(
    mut frames: Receiver<AudioFrame>,
    media: Sender<MediaControl>,
    mut writer: SegmentWriter,
    mut raw_pcm: Option<File>,
    metrics: MetricsContext,
) -> Result<()> {
    // ---
    let mut tick = tokio::time::interval(Duration::from_millis(BLOCK_DURATION_MS as u64));
    let mut processor = AudioProcessor::new(metrics.clone());

    info!("audio processing started");

    'ticks: loop {
        tick.tick().await;

        // Drain every pending frame in arrival order.
        loop {
            match frames.try_recv() {
                Ok(frame) => processor.process_frame(&frame),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => break 'ticks,
            }
        }

        metrics
            .pcm_buffer_bytes
            .set(processor.buffered_bytes() as i64);

        encode_pending(&mut processor, &mut writer, &mut raw_pcm, &metrics);

        if writer.should_rotate() {
            match writer.rotate(Utc::now()) {
                Ok(meta) => {
                    metrics.segments_published_total.inc();
                    if media.send(MediaControl::SegmentPublished(meta)).await.is_err() {
                        warn!("media control channel closed");
                        break;
                    }
                }
                Err(e) => warn!("abandoning MP3 segment: {:#}", e),
            }
        }
    }

    processor.log_stats();
    info!("frame channel closed, audio processing stopping");
    Ok(())
}

/// Feeds the drained PCM buffer to the encoder and the raw mirror.
fn encode_pending(
    processor: &mut AudioProcessor,
    writer: &mut SegmentWriter,
    raw_pcm: &mut Option<File>,
    metrics: &MetricsContext,
) {
    // ---
    let pcm = processor.drain_pcm();
    if pcm.is_empty() {
        return;
    }

    if let Some(file) = raw_pcm {
        if let Err(e) = file.write_all(&pcm) {
            warn!("raw PCM mirror failed, disabling it: {}", e);
            *raw_pcm = None;
        }
    }

    let samples: Vec<i16> = pcm
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect();

    let start = Instant::now();
    if let Err(e) = writer.write_samples(&samples) {
        warn!("dropping {} sample(s): {:#}", samples.len(), e);
    }
    metrics.encode_seconds.observe(start.elapsed().as_secs_f64());
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use chuff_common::SAMPLE_SIZE;

    fn make_processor() -> AudioProcessor {
        AudioProcessor::new(MetricsContext::new("test").expect("metrics init failed"))
    }

    fn make_frame(sequence: u16, samples: Vec<i16>) -> AudioFrame {
        AudioFrame {
            sequence,
            timestamp: sequence as u64 * 20_000,
            samples,
        }
    }

    fn ramp() -> Vec<i16> {
        (0..SAMPLES_PER_BLOCK as i16).collect()
    }

    #[test]
    fn test_single_frame_appends_little_endian() {
        // ---
        let mut processor = make_processor();
        processor.process_frame(&make_frame(1, ramp()));

        let pcm = processor.drain_pcm();
        assert_eq!(pcm.len(), SAMPLES_PER_BLOCK * SAMPLE_SIZE);
        assert_eq!(&pcm[0..4], &[0x00, 0x00, 0x01, 0x00]);
    }

    #[test]
    fn test_lossless_run_buffers_exactly_n_blocks() {
        // ---
        let mut processor = make_processor();
        for seq in 10..20 {
            processor.process_frame(&make_frame(seq, ramp()));
        }

        assert_eq!(
            processor.buffered_bytes(),
            10 * SAMPLES_PER_BLOCK * SAMPLE_SIZE
        );
    }

    #[test]
    fn test_one_lost_frame_fills_one_block() {
        // ---
        let mut processor = make_processor();
        processor.process_frame(&make_frame(1, vec![5; SAMPLES_PER_BLOCK]));
        processor.drain_pcm();

        processor.process_frame(&make_frame(3, vec![9; SAMPLES_PER_BLOCK]));

        let pcm = processor.drain_pcm();
        assert_eq!(pcm.len(), 2 * SAMPLES_PER_BLOCK * SAMPLE_SIZE);

        // One block of the previous frame's last sample, then the frame.
        let fill = &pcm[..SAMPLES_PER_BLOCK * SAMPLE_SIZE];
        assert!(fill.chunks_exact(2).all(|pair| pair == 5i16.to_le_bytes()));
        let content = &pcm[SAMPLES_PER_BLOCK * SAMPLE_SIZE..];
        assert!(content.chunks_exact(2).all(|pair| pair == 9i16.to_le_bytes()));
    }

    #[test]
    fn test_silly_gap_emits_nothing() {
        // ---
        let mut processor = make_processor();
        processor.process_frame(&make_frame(1, vec![5; SAMPLES_PER_BLOCK]));
        processor.drain_pcm();

        processor.process_frame(&make_frame(100, vec![9; SAMPLES_PER_BLOCK]));

        // Frame 100 is appended directly, with no fill before it.
        assert_eq!(
            processor.buffered_bytes(),
            SAMPLES_PER_BLOCK * SAMPLE_SIZE
        );
    }

    #[test]
    fn test_silly_gap_boundary() {
        // ---
        // 25 missing blocks = 8000 samples = exactly 500 ms: silly.
        let mut processor = make_processor();
        processor.process_frame(&make_frame(1, ramp()));
        processor.drain_pcm();
        processor.process_frame(&make_frame(27, ramp()));
        assert_eq!(
            processor.buffered_bytes(),
            SAMPLES_PER_BLOCK * SAMPLE_SIZE
        );

        // 24 missing blocks = 7680 samples: repaired.
        let mut processor = make_processor();
        processor.process_frame(&make_frame(1, ramp()));
        processor.drain_pcm();
        processor.process_frame(&make_frame(26, ramp()));
        assert_eq!(
            processor.buffered_bytes(),
            25 * SAMPLES_PER_BLOCK * SAMPLE_SIZE
        );
    }

    #[test]
    fn test_sequence_wrap_is_in_order() {
        // ---
        let mut processor = make_processor();
        processor.process_frame(&make_frame(65535, ramp()));
        processor.process_frame(&make_frame(0, ramp()));

        assert_eq!(
            processor.buffered_bytes(),
            2 * SAMPLES_PER_BLOCK * SAMPLE_SIZE
        );
    }

    #[test]
    fn test_empty_frame_is_a_full_block_gap() {
        // ---
        let mut processor = make_processor();
        processor.process_frame(&make_frame(1, vec![7; SAMPLES_PER_BLOCK]));
        processor.drain_pcm();

        processor.process_frame(&make_frame(2, vec![]));

        let pcm = processor.drain_pcm();
        assert_eq!(pcm.len(), SAMPLES_PER_BLOCK * SAMPLE_SIZE);
        assert!(pcm.chunks_exact(2).all(|pair| pair == 7i16.to_le_bytes()));
    }

    #[test]
    fn test_short_frame_fills_remainder() {
        // ---
        let mut processor = make_processor();
        processor.process_frame(&make_frame(1, vec![3; SAMPLES_PER_BLOCK]));
        processor.drain_pcm();

        processor.process_frame(&make_frame(2, vec![8; 100]));

        let pcm = processor.drain_pcm();
        assert_eq!(pcm.len(), SAMPLES_PER_BLOCK * SAMPLE_SIZE);

        // 100 samples of content, then the previous frame's last sample.
        assert!(pcm[..200].chunks_exact(2).all(|p| p == 8i16.to_le_bytes()));
        assert!(pcm[200..].chunks_exact(2).all(|p| p == 3i16.to_le_bytes()));
    }

    #[test]
    fn test_gap_with_no_history_fills_silence() {
        // ---
        let mut processor = make_processor();
        processor.process_frame(&make_frame(1, vec![6; 10]));

        let pcm = processor.drain_pcm();
        assert_eq!(pcm.len(), SAMPLES_PER_BLOCK * SAMPLE_SIZE);
        assert!(pcm[20..].chunks_exact(2).all(|p| p == [0, 0]));
    }

    #[test]
    fn test_duplicate_frame_appends_without_fill() {
        // ---
        let mut processor = make_processor();
        processor.process_frame(&make_frame(1, ramp()));
        processor.process_frame(&make_frame(1, ramp()));

        // The wrapped delta is huge, so the guard swallows the gap and
        // the duplicate's content is appended as-is.
        assert_eq!(
            processor.buffered_bytes(),
            2 * SAMPLES_PER_BLOCK * SAMPLE_SIZE
        );
    }
}
