//! MP3 encoding via LAME.
//!
//! Wraps the `mp3lame-encoder` binding behind the narrow contract the
//! pipeline needs: configure once, write PCM, finish to learn how many
//! silence samples padded out the final frame.
//!
//! The encoder runs constant-bitrate with the Xing/Info tag suppressed.
//! A VBR info frame would push the first audio frame sync past the
//! first hundred bytes of a segment, which HLS players reject.

use anyhow::{anyhow, Result};
use chuff_common::SAMPLING_FREQUENCY;
use mp3lame_encoder::{Bitrate, Builder, Encoder, FlushNoGap, MonoPcm, Quality};

/// Constant bitrate of the output stream.
pub const MP3_BITRATE: Bitrate = Bitrate::Kbps64;

/// Samples per MP3 frame for MPEG-2 Layer III at 16 kHz.
pub const MP3_FRAME_SAMPLES: usize = 576;

/// LAME encoder configured for the Chuff stream: mono, 16 kHz, 16-bit
/// PCM input, 64 kbit/s CBR.
pub struct Mp3EncoderWrapper {
    // ---
    encoder: Encoder,

    /// Samples written since construction, for padding accounting
    samples_in: u64,
}

impl Mp3EncoderWrapper {
    // ---
    /// Creates and initialises a LAME encoder.
    ///
    /// # Errors
    ///
    /// Returns error if LAME rejects the parameters or cannot be
    /// allocated.
    pub fn new() -> Result<Self> {
        // ---
        let mut builder = Builder::new().ok_or_else(|| anyhow!("failed to allocate LAME"))?;

        builder
            .set_num_channels(1)
            .map_err(|e| anyhow!("LAME rejected channel count: {:?}", e))?;
        builder
            .set_sample_rate(SAMPLING_FREQUENCY)
            .map_err(|e| anyhow!("LAME rejected sample rate: {:?}", e))?;
        builder
            .set_brate(MP3_BITRATE)
            .map_err(|e| anyhow!("LAME rejected bitrate: {:?}", e))?;
        builder
            .set_quality(Quality::Good)
            .map_err(|e| anyhow!("LAME rejected quality: {:?}", e))?;
        builder
            .set_to_write_vbr_tag(false)
            .map_err(|e| anyhow!("LAME rejected VBR tag setting: {:?}", e))?;

        let encoder = builder
            .build()
            .map_err(|e| anyhow!("failed to initialise LAME: {:?}", e))?;

        Ok(Self {
            encoder,
            samples_in: 0,
        })
    }

    /// Encodes PCM samples, appending MP3 bytes to `out`.
    ///
    /// LAME buffers internally, so a call may append nothing.
    ///
    /// # Errors
    ///
    /// Returns error if LAME reports an encode failure.
    pub fn encode(&mut self, samples: &[i16], out: &mut Vec<u8>) -> Result<()> {
        // ---
        out.reserve(mp3lame_encoder::max_required_buffer_size(samples.len()));

        let written = self
            .encoder
            .encode(MonoPcm(samples), out.spare_capacity_mut())
            .map_err(|e| anyhow!("MP3 encode failed: {:?}", e))?;

        // The encoder initialised exactly `written` bytes of the spare
        // capacity just reserved.
        unsafe { out.set_len(out.len() + written) };

        self.samples_in += samples.len() as u64;
        Ok(())
    }

    /// Flushes buffered audio, appending the final MP3 bytes to `out`,
    /// and returns the number of silence samples LAME injected to
    /// complete the last frame.
    ///
    /// # Errors
    ///
    /// Returns error if LAME reports a flush failure.
    pub fn finish(mut self, out: &mut Vec<u8>) -> Result<usize> {
        // ---
        out.reserve(mp3lame_encoder::max_required_buffer_size(MP3_FRAME_SAMPLES));

        let written = self
            .encoder
            .flush::<FlushNoGap>(out.spare_capacity_mut())
            .map_err(|e| anyhow!("MP3 flush failed: {:?}", e))?;

        unsafe { out.set_len(out.len() + written) };

        let remainder = (self.samples_in % MP3_FRAME_SAMPLES as u64) as usize;
        let padding = if remainder == 0 {
            0
        } else {
            MP3_FRAME_SAMPLES - remainder
        };

        Ok(padding)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use chuff_common::SAMPLES_PER_BLOCK;

    #[test]
    fn test_encoder_creation() {
        // ---
        assert!(Mp3EncoderWrapper::new().is_ok());
    }

    #[test]
    fn test_encode_produces_output_eventually() {
        // ---
        let mut encoder = Mp3EncoderWrapper::new().expect("encoder creation failed");
        let mut out = Vec::new();

        // A second of silence is far more than LAME buffers.
        let silence = vec![0i16; SAMPLING_FREQUENCY as usize];
        encoder.encode(&silence, &mut out).expect("encoding failed");

        assert!(!out.is_empty());
        // CBR without an info tag: the stream starts at a frame sync.
        assert_eq!(out[0], 0xFF);
    }

    #[test]
    fn test_finish_reports_final_frame_padding() {
        // ---
        let mut encoder = Mp3EncoderWrapper::new().expect("encoder creation failed");
        let mut out = Vec::new();

        // One 320-sample block leaves 256 samples to the 576 boundary.
        let block = vec![0i16; SAMPLES_PER_BLOCK];
        encoder.encode(&block, &mut out).expect("encoding failed");
        let padding = encoder.finish(&mut out).expect("flush failed");

        assert_eq!(padding, MP3_FRAME_SAMPLES - SAMPLES_PER_BLOCK);
    }

    #[test]
    fn test_finish_on_frame_boundary_needs_no_padding() {
        // ---
        let mut encoder = Mp3EncoderWrapper::new().expect("encoder creation failed");
        let mut out = Vec::new();

        let frames = vec![0i16; MP3_FRAME_SAMPLES * 4];
        encoder.encode(&frames, &mut out).expect("encoding failed");
        let padding = encoder.finish(&mut out).expect("flush failed");

        assert_eq!(padding, 0);
    }
}
