//! URTP datagram structure and serialization.
//!
//! URTP is the minimal RTP-like framing used by Chuff clients: a sync
//! byte, an audio coding scheme, a sequence number, a microsecond
//! timestamp and a length-prefixed payload.

use crate::codec::{self, SAMPLES_PER_BLOCK, SAMPLE_SIZE};
use thiserror::Error;

/// Every URTP datagram starts with this byte.
pub const SYNC_BYTE: u8 = 0x5A;

/// Fixed URTP header length in bytes.
pub const URTP_HEADER_SIZE: usize = 14;

/// Number of defined audio coding schemes; anything at or above is rejected.
pub const NUM_CODING_SCHEMES: u8 = 2;

/// Largest payload a datagram may carry (one uncompressed block).
pub const MAX_PAYLOAD_SIZE: usize = SAMPLES_PER_BLOCK * SAMPLE_SIZE;

/// Largest complete URTP datagram.
pub const MAX_DATAGRAM_SIZE: usize = URTP_HEADER_SIZE + MAX_PAYLOAD_SIZE;

/// Overhead added to [`MAX_DATAGRAM_SIZE`] to size an IP receive buffer
/// for one packet.
pub const IP_HEADER_OVERHEAD: usize = 40;

/// Why a datagram was rejected at the framing layer.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    // ---
    #[error("bad sync byte {0:#04x}")]
    BadSync(u8),

    #[error("unknown audio coding scheme {0}")]
    BadCoding(u8),

    #[error("payload length {0} exceeds the {MAX_PAYLOAD_SIZE}-byte maximum")]
    BadLength(usize),

    #[error("datagram too short: {0} byte(s)")]
    Short(usize),
}

/// Audio coding scheme of a URTP payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodingScheme {
    /// Signed 16-bit linear PCM at 16 kHz, big-endian on the wire.
    Pcm16 = 0,

    /// UNICAM block-companded audio at 16 kHz.
    Unicam = 1,
}

impl TryFrom<u8> for CodingScheme {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, FrameError> {
        // ---
        match value {
            0 => Ok(CodingScheme::Pcm16),
            1 => Ok(CodingScheme::Unicam),
            other => Err(FrameError::BadCoding(other)),
        }
    }
}

/// A URTP datagram in wire form.
///
/// # Protocol Details
///
/// - Sync: always `0x5A`
/// - Coding: 0 (PCM16) or 1 (UNICAM)
/// - Sequence: increments by 1 per 20 ms block, wraps at 65535
/// - Timestamp: microseconds since the client started
/// - Payload length: big-endian byte count, at most one block
///
/// # Wire Format
///
/// ```text
/// | 0    | 1      | 2..4     | 4..12     | 12..14      | 14..      |
/// | sync | coding | sequence | timestamp | payload len | payload   |
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrtpFrame {
    // ---
    /// Audio coding scheme of the payload
    pub coding: CodingScheme,

    /// Block sequence number (wraps at 65535)
    pub sequence: u16,

    /// Client-side timestamp in microseconds
    pub timestamp: u64,

    /// Coded audio payload
    pub payload: Vec<u8>,
}

/// A URTP frame after payload decoding, as handed to the processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    // ---
    /// Block sequence number (wraps at 65535)
    pub sequence: u16,

    /// Client-side timestamp in microseconds
    pub timestamp: u64,

    /// Decoded 16-bit PCM samples (at most one block's worth)
    pub samples: Vec<i16>,
}

impl UrtpFrame {
    // ---
    /// Creates a new URTP frame with the given parameters.
    pub fn new(coding: CodingScheme, sequence: u16, timestamp: u64, payload: Vec<u8>) -> Self {
        // ---
        Self {
            coding,
            sequence,
            timestamp,
            payload,
        }
    }

    /// Validates the fixed header of a candidate datagram.
    ///
    /// # Errors
    ///
    /// Returns the reason the datagram must be discarded:
    /// - [`FrameError::Short`] if fewer than 14 bytes are present
    /// - [`FrameError::BadSync`] if byte 0 is not `0x5A`
    /// - [`FrameError::BadCoding`] if the coding scheme is unknown
    /// - [`FrameError::BadLength`] if the payload length exceeds one block
    pub fn verify_header(data: &[u8]) -> Result<(), FrameError> {
        // ---
        if data.len() < URTP_HEADER_SIZE {
            return Err(FrameError::Short(data.len()));
        }

        if data[0] != SYNC_BYTE {
            return Err(FrameError::BadSync(data[0]));
        }

        if data[1] >= NUM_CODING_SCHEMES {
            return Err(FrameError::BadCoding(data[1]));
        }

        let payload_len = u16::from_be_bytes([data[12], data[13]]) as usize;
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(FrameError::BadLength(payload_len));
        }

        Ok(())
    }

    /// Serializes the frame into wire format.
    pub fn serialize(&self) -> Vec<u8> {
        // ---
        let mut buf = Vec::with_capacity(URTP_HEADER_SIZE + self.payload.len());

        buf.push(SYNC_BYTE);
        buf.push(self.coding as u8);
        buf.extend_from_slice(&self.sequence.to_be_bytes());
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        buf.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.payload);

        buf
    }

    /// Deserializes a URTP frame from wire format.
    ///
    /// The payload is taken to be exactly the length the header declares;
    /// trailing bytes beyond it are ignored, and a datagram shorter than
    /// its declared payload is rejected as [`FrameError::Short`].
    ///
    /// # Errors
    ///
    /// Returns error if [`verify_header`](Self::verify_header) fails or the
    /// payload is truncated.
    pub fn deserialize(data: &[u8]) -> Result<Self, FrameError> {
        // ---
        Self::verify_header(data)?;

        let coding = CodingScheme::try_from(data[1])?;
        let sequence = u16::from_be_bytes([data[2], data[3]]);
        let timestamp = u64::from_be_bytes([
            data[4], data[5], data[6], data[7], data[8], data[9], data[10], data[11],
        ]);
        let payload_len = u16::from_be_bytes([data[12], data[13]]) as usize;

        if data.len() < URTP_HEADER_SIZE + payload_len {
            return Err(FrameError::Short(data.len()));
        }

        let payload = data[URTP_HEADER_SIZE..URTP_HEADER_SIZE + payload_len].to_vec();

        Ok(Self {
            coding,
            sequence,
            timestamp,
            payload,
        })
    }

    /// Decodes the payload into PCM samples, consuming the wire frame.
    pub fn decode(self) -> AudioFrame {
        // ---
        let samples = match self.coding {
            CodingScheme::Pcm16 => codec::decode_pcm(&self.payload),
            CodingScheme::Unicam => codec::decode_unicam(&self.payload),
        };

        AudioFrame {
            sequence: self.sequence,
            timestamp: self.timestamp,
            samples,
        }
    }
}
