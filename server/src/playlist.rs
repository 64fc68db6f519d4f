//! HLS playlist state: the rolling segment list and its M3U8 rendering.
//!
//! Lifecycle and rendering are pure so they can be unit tested with a
//! synthetic clock; all file and network I/O stays in the publisher.

use chrono::{DateTime, Utc};
use chrono_tz::Europe::London;
use std::collections::VecDeque;
use std::fmt::Write;
use std::time::Duration;
use tracing::info;

use crate::segment::SegmentMeta;

/// Extension of the playlist file.
pub const PLAYLIST_EXTENSION: &str = "m3u8";

/// Age at which a segment leaves the advertised playlist.
pub const USABLE_AGE: Duration = Duration::from_secs(2 * 60);

/// Age at which a segment file may be deleted.
pub const REMOVABLE_AGE: Duration = Duration::from_secs(5 * 60);

/// Lag from the newest playlist entry at which playback should start.
pub const MAX_PLAY_LAG: Duration = Duration::from_secs(20);

/// Ageing outcome of one housekeeping pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct AgeOutcome {
    // ---
    /// Whether any segment changed status, requiring a playlist rewrite
    pub playlist_changed: bool,

    /// File names whose segments may now be deleted
    pub removable: Vec<String>,

    /// Segments retired from the playlist this pass
    pub retired: u64,
}

/// The rolling window of published segments, oldest first, plus the
/// playlist's media-sequence counter.
#[derive(Debug, Default)]
pub struct SegmentList {
    // ---
    segments: VecDeque<SegmentMeta>,

    /// Advances exactly once per segment retired; never decreases
    media_sequence: u64,

    /// When a usable segment was last observed on the list
    last_usable: Option<DateTime<Utc>>,
}

impl SegmentList {
    // ---
    pub fn new() -> Self {
        // ---
        Self::default()
    }

    /// Appends a freshly published segment.
    pub fn push(&mut self, meta: SegmentMeta) {
        // ---
        info!(
            "adding MP3 file \"{}\", duration {} ms, to the playlist",
            meta.file_name,
            meta.duration.as_millis()
        );
        self.last_usable = Some(meta.received_at);
        self.segments.push_back(meta);
    }

    pub fn media_sequence(&self) -> u64 {
        // ---
        self.media_sequence
    }

    /// Segments currently advertised, in insertion order.
    pub fn usable_segments(&self) -> impl Iterator<Item = &SegmentMeta> {
        // ---
        self.segments.iter().filter(|s| s.usable)
    }

    /// Whether no segment has been usable for [`USABLE_AGE`] — the
    /// condition under which the stream reverts to out-of-service.
    pub fn is_quiet(&self, now: DateTime<Utc>) -> bool {
        // ---
        if self.segments.iter().any(|s| s.usable) {
            return false;
        }
        match self.last_usable {
            Some(at) => age_of(at, now) > USABLE_AGE,
            None => true,
        }
    }

    /// Walks every record, demoting those past [`USABLE_AGE`] and
    /// flagging those past [`REMOVABLE_AGE`] for deletion.
    ///
    /// Deletion itself is the caller's job; records are only dropped
    /// once [`mark_removed`](Self::mark_removed) confirms the unlink.
    pub fn age(&mut self, now: DateTime<Utc>) -> AgeOutcome {
        // ---
        let mut outcome = AgeOutcome::default();

        if self.segments.iter().any(|s| s.usable) {
            self.last_usable = Some(now);
        }

        for segment in &mut self.segments {
            let age = age_of(segment.received_at, now);

            if segment.usable && age > USABLE_AGE {
                segment.usable = false;
                self.media_sequence += 1;
                outcome.playlist_changed = true;
                outcome.retired += 1;
                info!(
                    "MP3 file \"{}\", received {} s ago, no longer usable",
                    segment.file_name,
                    age.as_secs()
                );
            }

            if !segment.usable && age > REMOVABLE_AGE {
                segment.removable = true;
            }

            if segment.removable {
                outcome.removable.push(segment.file_name.clone());
            }
        }

        outcome
    }

    /// Drops a record whose file was successfully deleted.
    pub fn mark_removed(&mut self, file_name: &str) {
        // ---
        self.segments.retain(|s| s.file_name != file_name);
    }

    /// All file names still on record, for shutdown cleanup.
    pub fn file_names(&self) -> Vec<String> {
        // ---
        self.segments.iter().map(|s| s.file_name.clone()).collect()
    }

    /// Renders the playlist as M3U8 text.
    ///
    /// Always emits the fixed `#EXTM3U` / `#EXT-X-VERSION:3` header;
    /// the dynamic header fields and entry list appear only when at
    /// least one segment is usable.
    pub fn render(&self) -> String {
        // ---
        let mut text = String::new();
        text.push_str("#EXTM3U\r\n");
        text.push_str("#EXT-X-VERSION:3\r\n");

        let max_duration = self
            .usable_segments()
            .map(|s| s.duration)
            .max()
            .unwrap_or_default();
        let total_duration: Duration = self.usable_segments().map(|s| s.duration).sum();

        if self.usable_segments().next().is_some() {
            // Writing to a String cannot fail.
            let _ = writeln!(
                text,
                "#EXT-X-TARGETDURATION:{}\r",
                max_duration.as_secs_f64().ceil() as u64
            );
            let _ = writeln!(text, "#EXT-X-MEDIA-SEQUENCE:{}\r", self.media_sequence);

            if total_duration > MAX_PLAY_LAG {
                let _ = writeln!(
                    text,
                    "#EXT-X-START:TIME-OFFSET=-{:.3}\r",
                    MAX_PLAY_LAG.as_secs_f64()
                );
            }

            for segment in self.usable_segments() {
                let _ = writeln!(
                    text,
                    "#EXT-X-PROGRAM-DATE-TIME:{}\r",
                    segment
                        .received_at
                        .with_timezone(&London)
                        .format("%Y-%m-%dT%H:%M:%S%.3f%:z")
                );
                let _ = writeln!(
                    text,
                    "#EXTINF:{:.3}, {}\r",
                    segment.duration.as_secs_f64(),
                    segment.title
                );
                let _ = writeln!(text, "{}\r", segment.file_name);
            }
        }

        text
    }
}

/// Age of a timestamp relative to `now`, zero if it lies in the future.
fn age_of(at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    // ---
    now.signed_duration_since(at).to_std().unwrap_or_default()
}
