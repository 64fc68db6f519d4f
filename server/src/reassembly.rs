//! URTP frame recovery from a byte stream.
//!
//! TCP delivers bytes without framing, so frames are recovered with a
//! sync-byte-anchored state machine: hunt for `0x5A`, validate each
//! header field as it arrives, then drain the declared payload in bulk.
//! Any header rejection discards what was collected (including the
//! offending byte) and restarts the sync hunt.

use chuff_common::{
    FrameError, UrtpFrame, MAX_PAYLOAD_SIZE, NUM_CODING_SCHEMES, SYNC_BYTE, URTP_HEADER_SIZE,
};
use tracing::debug;

/// Offsets of the multi-byte header fields.
const SEQUENCE_END: usize = 4;
const TIMESTAMP_END: usize = 12;
const LENGTH_END: usize = URTP_HEADER_SIZE;

/// Reassembly state; each variant waits for part of the header or the
/// payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    WaitSync,
    WaitCoding,
    WaitSequence,
    WaitTimestamp,
    WaitLength,
    WaitPayload,
}

/// Recovers URTP frames from an unframed byte stream.
///
/// Feed arbitrary chunks with [`feed`](Self::feed); completed frames are
/// appended to the caller's vector. The assembler never terminates: it
/// returns to the sync hunt after every frame, and after every
/// rejection.
///
/// # Example
///
/// ```
/// use chuff_common::{CodingScheme, UrtpFrame};
/// use chuff_server::reassembly::FrameAssembler;
///
/// let frame = UrtpFrame::new(CodingScheme::Pcm16, 1, 20_000, vec![0, 1]);
/// let mut assembler = FrameAssembler::new();
/// let mut frames = Vec::new();
/// assembler.feed(&frame.serialize(), &mut frames);
/// assert_eq!(frames, vec![frame]);
/// ```
pub struct FrameAssembler {
    // ---
    state: State,

    /// Bytes of the frame collected so far (header, then payload)
    frame: Vec<u8>,

    /// Declared payload length, known once the header is complete
    payload_len: usize,
}

impl Default for FrameAssembler {
    fn default() -> Self {
        // ---
        Self::new()
    }
}

impl FrameAssembler {
    // ---
    /// Creates an assembler in the sync-hunt state.
    pub fn new() -> Self {
        // ---
        Self {
            state: State::WaitSync,
            frame: Vec::with_capacity(URTP_HEADER_SIZE + MAX_PAYLOAD_SIZE),
            payload_len: 0,
        }
    }

    /// Consumes a chunk of stream bytes, appending any completed frames
    /// to `out`.
    ///
    /// Chunking is immaterial: a frame split at any byte boundary, or
    /// fed a byte at a time, reassembles identically.
    pub fn feed(&mut self, data: &[u8], out: &mut Vec<UrtpFrame>) {
        // ---
        let mut pos = 0;

        while pos < data.len() {
            if self.state == State::WaitPayload {
                // Bulk-drain the declared payload.
                let missing = URTP_HEADER_SIZE + self.payload_len - self.frame.len();
                let take = missing.min(data.len() - pos);
                self.frame.extend_from_slice(&data[pos..pos + take]);
                pos += take;

                if self.frame.len() == URTP_HEADER_SIZE + self.payload_len {
                    self.emit(out);
                }
            } else {
                self.step(data[pos], out);
                pos += 1;
            }
        }
    }

    /// Advances the header states by one byte.
    fn step(&mut self, byte: u8, out: &mut Vec<UrtpFrame>) {
        // ---
        match self.state {
            State::WaitSync => {
                if byte == SYNC_BYTE {
                    self.frame.push(byte);
                    self.state = State::WaitCoding;
                }
                // Anything else is inter-frame noise; keep hunting.
            }
            State::WaitCoding => {
                if byte < NUM_CODING_SCHEMES {
                    self.frame.push(byte);
                    self.state = State::WaitSequence;
                } else {
                    self.reject(FrameError::BadCoding(byte));
                }
            }
            State::WaitSequence => {
                self.frame.push(byte);
                if self.frame.len() == SEQUENCE_END {
                    self.state = State::WaitTimestamp;
                }
            }
            State::WaitTimestamp => {
                self.frame.push(byte);
                if self.frame.len() == TIMESTAMP_END {
                    self.state = State::WaitLength;
                }
            }
            State::WaitLength => {
                self.frame.push(byte);
                if self.frame.len() == LENGTH_END {
                    let declared = u16::from_be_bytes([
                        self.frame[LENGTH_END - 2],
                        self.frame[LENGTH_END - 1],
                    ]) as usize;

                    if declared > MAX_PAYLOAD_SIZE {
                        self.reject(FrameError::BadLength(declared));
                    } else if declared == 0 {
                        self.emit(out);
                    } else {
                        self.payload_len = declared;
                        self.state = State::WaitPayload;
                    }
                }
            }
            State::WaitPayload => unreachable!("payload bytes are drained in bulk"),
        }
    }

    /// Completes the current frame and restarts the sync hunt.
    fn emit(&mut self, out: &mut Vec<UrtpFrame>) {
        // ---
        match UrtpFrame::deserialize(&self.frame) {
            Ok(frame) => out.push(frame),
            // Field validation already happened per byte.
            Err(e) => debug!("dropping reassembled frame: {}", e),
        }
        self.reset();
    }

    /// Drops the partial frame; the rejecting byte is not re-examined.
    fn reject(&mut self, reason: FrameError) {
        // ---
        debug!(
            "stream resync after {} byte(s): {}",
            self.frame.len() + 1,
            reason
        );
        self.reset();
    }

    fn reset(&mut self) {
        // ---
        self.frame.clear();
        self.payload_len = 0;
        self.state = State::WaitSync;
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use chuff_common::CodingScheme;

    fn make_frame(sequence: u16, payload: Vec<u8>) -> UrtpFrame {
        UrtpFrame::new(
            CodingScheme::Pcm16,
            sequence,
            sequence as u64 * 20_000,
            payload,
        )
    }

    #[test]
    fn test_whole_frame_in_one_chunk() {
        // ---
        let frame = make_frame(1, vec![1, 2, 3, 4]);
        let mut assembler = FrameAssembler::new();
        let mut out = Vec::new();

        assembler.feed(&frame.serialize(), &mut out);

        assert_eq!(out, vec![frame]);
    }

    #[test]
    fn test_byte_at_a_time() {
        // ---
        let frame = make_frame(42, vec![9; 64]);
        let mut assembler = FrameAssembler::new();
        let mut out = Vec::new();

        for byte in frame.serialize() {
            assembler.feed(&[byte], &mut out);
        }

        assert_eq!(out, vec![frame]);
    }

    #[test]
    fn test_arbitrary_chunking_of_two_frames() {
        // ---
        let first = make_frame(1, vec![0xAA; 100]);
        let second = make_frame(2, vec![0xBB; 30]);

        let mut bytes = first.serialize();
        bytes.extend_from_slice(&second.serialize());

        // Split at every possible boundary.
        for split in 0..=bytes.len() {
            let mut assembler = FrameAssembler::new();
            let mut out = Vec::new();
            assembler.feed(&bytes[..split], &mut out);
            assembler.feed(&bytes[split..], &mut out);

            assert_eq!(out, vec![first.clone(), second.clone()], "split at {split}");
        }
    }

    #[test]
    fn test_leading_noise_is_skipped() {
        // ---
        let frame = make_frame(3, vec![7, 7]);
        let mut bytes = vec![0x00, 0xFF, 0x12];
        bytes.extend_from_slice(&frame.serialize());

        let mut assembler = FrameAssembler::new();
        let mut out = Vec::new();
        assembler.feed(&bytes, &mut out);

        assert_eq!(out, vec![frame]);
    }

    #[test]
    fn test_bad_coding_restarts_hunt_consuming_the_byte() {
        // ---
        // A stray sync byte followed by an invalid coding byte: the
        // coding byte is discarded with the partial header, so a real
        // frame straight after still reassembles.
        let frame = make_frame(4, vec![1]);
        let mut bytes = vec![SYNC_BYTE, 0x7F];
        bytes.extend_from_slice(&frame.serialize());

        let mut assembler = FrameAssembler::new();
        let mut out = Vec::new();
        assembler.feed(&bytes, &mut out);

        assert_eq!(out, vec![frame]);
    }

    #[test]
    fn test_oversize_length_restarts_hunt() {
        // ---
        let mut bogus = make_frame(5, vec![0; 4]).serialize();
        bogus[12..14].copy_from_slice(&1000u16.to_be_bytes());

        let good = make_frame(6, vec![0; 4]);
        let mut bytes = bogus;
        bytes.extend_from_slice(&good.serialize());

        let mut assembler = FrameAssembler::new();
        let mut out = Vec::new();
        assembler.feed(&bytes, &mut out);

        // The bogus header is dropped; its payload bytes are scanned as
        // noise until the good frame's sync byte is found.
        assert_eq!(out, vec![good]);
    }

    #[test]
    fn test_empty_payload_frame_emitted_immediately() {
        // ---
        let frame = make_frame(8, vec![]);
        let mut assembler = FrameAssembler::new();
        let mut out = Vec::new();

        assembler.feed(&frame.serialize(), &mut out);

        assert_eq!(out, vec![frame]);
    }
}
