//! MP3 segment accumulation and file output.
//!
//! The processor feeds decoded PCM into a [`SegmentWriter`]; every
//! 15 seconds of audio it closes the current MP3 file, stamps it with
//! an ID3 PRIV timestamp tag and hands metadata to the publisher.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use chuff_common::SAMPLING_FREQUENCY;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::mp3::Mp3EncoderWrapper;

/// Amount of audio in each MP3 segment file.
pub const SEGMENT_DURATION: Duration = Duration::from_secs(15);

/// Extension of segment files; some browsers only accept packaged MP3
/// from an HLS playlist under this extension.
pub const SEGMENT_EXTENSION: &str = "ts";

/// Title advertised for every segment in the playlist.
pub const SEGMENT_TITLE: &str = "Chuff live audio";

/// Owner identifier of the PRIV frame carrying the segment's
/// transport-stream timestamp.
const PRIV_OWNER: &[u8] = b"com.apple.streaming.transportStreamTimestamp\0";

/// Description of a published MP3 segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentMeta {
    // ---
    /// File name within the playlist directory
    pub file_name: String,

    /// Title shown in the playlist entry
    pub title: String,

    /// When the segment was handed to the publisher
    pub received_at: DateTime<Utc>,

    /// Audio duration, corrected for encoder padding
    pub duration: Duration,

    /// Whether the segment may be advertised in the playlist
    pub usable: bool,

    /// Whether the segment file may be deleted
    pub removable: bool,
}

/// Messages to the publisher.
///
/// A tagged variant rather than bare metadata so stream-level events
/// can be added without reshaping the channel.
#[derive(Debug, Clone)]
pub enum MediaControl {
    // ---
    /// A finished MP3 segment is ready to advertise.
    SegmentPublished(SegmentMeta),
}

/// Directory segment files share with the playlist.
pub fn segment_dir(playlist_path: &Path) -> PathBuf {
    // ---
    playlist_path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf()
}

/// Builds the ID3v2.4 container that prefixes every segment file.
///
/// The container holds a single PRIV frame whose body is the segment's
/// start offset from the stream origin, expressed in 90 kHz clock ticks
/// as an 8-byte big-endian integer.
pub fn id3_priv_tag(offset_micros: u64) -> Vec<u8> {
    // ---
    let ticks = offset_micros * 90 / 1000;
    let body_len = PRIV_OWNER.len() + 8;
    let tag_len = 10 + body_len; // PRIV frame header + body

    let mut tag = Vec::with_capacity(10 + tag_len);
    tag.extend_from_slice(b"ID3");
    tag.extend_from_slice(&[0x04, 0x00, 0x00]); // v2.4.0, no flags
    tag.extend_from_slice(&syncsafe(tag_len as u32));
    tag.extend_from_slice(b"PRIV");
    tag.extend_from_slice(&syncsafe(body_len as u32));
    tag.extend_from_slice(&[0x00, 0x00]); // frame flags
    tag.extend_from_slice(PRIV_OWNER);
    tag.extend_from_slice(&ticks.to_be_bytes());

    tag
}

/// ID3v2 sizes keep the top bit of every byte clear.
fn syncsafe(value: u32) -> [u8; 4] {
    // ---
    [
        (value >> 21) as u8 & 0x7F,
        (value >> 14) as u8 & 0x7F,
        (value >> 7) as u8 & 0x7F,
        value as u8 & 0x7F,
    ]
}

/// Accumulates encoded audio and rotates it into segment files.
pub struct SegmentWriter {
    // ---
    /// Directory the playlist and its segments live in
    dir: PathBuf,

    encoder: Mp3EncoderWrapper,

    /// Encoded bytes of the segment under construction
    mp3_data: Vec<u8>,

    /// PCM microseconds fed into the current segment
    pcm_micros: u64,

    /// Start offset of the current segment from the stream origin
    offset_micros: u64,
}

impl SegmentWriter {
    // ---
    /// Creates a writer for segments in `dir`.
    ///
    /// # Errors
    ///
    /// Returns error if the MP3 encoder cannot be initialised; callers
    /// treat this as fatal at startup.
    pub fn new(dir: PathBuf) -> Result<Self> {
        // ---
        Ok(Self {
            dir,
            encoder: Mp3EncoderWrapper::new()?,
            mp3_data: Vec::new(),
            pcm_micros: 0,
            offset_micros: 0,
        })
    }

    /// Encodes PCM samples into the current segment.
    ///
    /// # Errors
    ///
    /// Returns error if encoding fails; the samples are dropped and the
    /// segment remains open.
    pub fn write_samples(&mut self, samples: &[i16]) -> Result<()> {
        // ---
        self.encoder.encode(samples, &mut self.mp3_data)?;
        self.pcm_micros += samples.len() as u64 * 1_000_000 / SAMPLING_FREQUENCY as u64;
        Ok(())
    }

    /// Whether the current segment has reached [`SEGMENT_DURATION`].
    pub fn should_rotate(&self) -> bool {
        // ---
        self.pcm_micros >= SEGMENT_DURATION.as_micros() as u64
    }

    /// Start offset the next published segment will carry, in
    /// microseconds from the stream origin.
    pub fn stream_offset_micros(&self) -> u64 {
        // ---
        self.offset_micros
    }

    /// Closes the current segment, writes its file and opens the next.
    ///
    /// The file is created under a temporary name and renamed into
    /// place. The reported duration is the PCM fed in minus the silence
    /// LAME padded the final frame with, and the stream offset advances
    /// by that corrected duration.
    ///
    /// # Errors
    ///
    /// Returns error if the encoder cannot be flushed or replaced, or
    /// the file cannot be written. The failed segment is abandoned
    /// either way; the writer is ready for the next one.
    pub fn rotate(&mut self, now: DateTime<Utc>) -> Result<SegmentMeta> {
        // ---
        // Stand up the next segment's encoder first so a failure leaves
        // the current one intact for a retry on a later tick.
        let next = Mp3EncoderWrapper::new().context("failed to reinitialise the MP3 encoder")?;
        let encoder = std::mem::replace(&mut self.encoder, next);
        let mut data = std::mem::take(&mut self.mp3_data);
        let pcm_micros = std::mem::replace(&mut self.pcm_micros, 0);

        let padding = encoder.finish(&mut data)?;
        let padding_micros = padding as u64 * 1_000_000 / SAMPLING_FREQUENCY as u64;
        let duration_micros = pcm_micros.saturating_sub(padding_micros);

        let file_name = self.write_segment_file(&data)?;

        debug!(
            "segment \"{}\": {} ms of audio at stream offset {} ms",
            file_name,
            duration_micros / 1000,
            self.offset_micros / 1000,
        );

        let meta = SegmentMeta {
            file_name,
            title: SEGMENT_TITLE.to_string(),
            received_at: now,
            duration: Duration::from_micros(duration_micros),
            usable: true,
            removable: false,
        };

        self.offset_micros += duration_micros;
        Ok(meta)
    }

    /// Writes ID3 tag + MP3 data to a freshly named file, returning the
    /// file name.
    fn write_segment_file(&self, data: &[u8]) -> Result<String> {
        // ---
        let stem: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(10)
            .map(char::from)
            .collect();
        let file_name = format!("mp3_{stem}.{SEGMENT_EXTENSION}");

        let final_path = self.dir.join(&file_name);
        let temp_path = final_path.with_extension("tmp");

        let mut contents = id3_priv_tag(self.offset_micros);
        contents.extend_from_slice(data);

        fs::write(&temp_path, &contents)
            .with_context(|| format!("failed to create segment file {}", temp_path.display()))?;
        fs::rename(&temp_path, &final_path)
            .with_context(|| format!("failed to move segment into {}", final_path.display()))?;

        info!(
            "wrote {} byte(s) of MP3 to \"{}\"",
            contents.len(),
            final_path.display()
        );
        Ok(file_name)
    }
}
