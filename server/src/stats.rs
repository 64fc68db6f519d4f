//! Statistics tracking for the audio pipeline.
//!
//! Tracks frame arrival, gap repair and throughput so stream health is
//! visible in the logs without scraping the metrics endpoint.

use std::time::{Duration, Instant};
use tracing::info;

/// Pipeline statistics, logged periodically.
#[derive(Debug, Clone)]
pub struct PipelineStats {
    // ---
    /// Total frames processed
    pub frames_processed: u64,

    /// Total PCM bytes appended from frames (excluding gap fill)
    pub bytes_processed: u64,

    /// Total sequence gaps repaired
    pub gaps_repaired: u64,

    /// Total samples synthesized to repair gaps
    pub samples_filled: u64,

    /// Total gaps too large to repair
    pub silly_gaps: u64,

    /// Start time for rate calculations
    start_time: Instant,

    /// Last time stats were logged
    last_log_time: Instant,

    /// Interval between periodic logs
    log_interval: Duration,
}

impl PipelineStats {
    // ---
    /// Creates a new stats tracker.
    ///
    /// # Arguments
    ///
    /// * `log_interval` - How often to automatically log stats
    pub fn new(log_interval: Duration) -> Self {
        // ---
        let now = Instant::now();
        Self {
            frames_processed: 0,
            bytes_processed: 0,
            gaps_repaired: 0,
            samples_filled: 0,
            silly_gaps: 0,
            start_time: now,
            last_log_time: now,
            log_interval,
        }
    }

    /// Records one processed frame and its payload size in bytes.
    pub fn record_frame(&mut self, bytes: usize) {
        // ---
        self.frames_processed += 1;
        self.bytes_processed += bytes as u64;
        self.maybe_log();
    }

    /// Records a repaired gap of the given sample count.
    pub fn record_gap(&mut self, samples: usize) {
        // ---
        self.gaps_repaired += 1;
        self.samples_filled += samples as u64;
    }

    /// Records a gap too large to repair.
    pub fn record_silly_gap(&mut self) {
        // ---
        self.silly_gaps += 1;
    }

    /// Average audio throughput since start, in kbit/s.
    pub fn throughput_kbps(&self) -> f64 {
        // ---
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            0.0
        } else {
            self.bytes_processed as f64 * 8.0 / elapsed / 1000.0
        }
    }

    /// Logs statistics if the interval has elapsed.
    fn maybe_log(&mut self) {
        // ---
        if self.last_log_time.elapsed() >= self.log_interval {
            self.log();
            self.last_log_time = Instant::now();
        }
    }

    /// Force log current statistics.
    pub fn log(&self) {
        // ---
        info!(
            "Stream: {} frame(s), {:.3} kbit/s, {} gap(s) repaired ({} sample(s)), {} silly",
            self.frames_processed,
            self.throughput_kbps(),
            self.gaps_repaired,
            self.samples_filled,
            self.silly_gaps
        );
    }
}

impl Default for PipelineStats {
    fn default() -> Self {
        // ---
        Self::new(Duration::from_secs(10))
    }
}
