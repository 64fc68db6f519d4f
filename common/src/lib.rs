//! Shared library for the Chuff audio server.
//!
//! This crate is the public gateway for the URTP wire format, the audio
//! payload codecs and process-wide observability. Downstream code
//! imports through the re-exports here rather than reaching into the
//! module structure.

mod cli;
mod codec;
mod observability;
mod urtp;

pub use cli::ColorWhen;
pub use codec::{
    decode_pcm, decode_unicam, encode_pcm, BLOCK_DURATION_MS, SAMPLES_PER_BLOCK,
    SAMPLE_SIZE, SAMPLING_FREQUENCY, UNICAM_BLOCK_BITS, UNICAM_BLOCK_SAMPLES,
};
pub use observability::{init_tracing, MetricsContext, MetricsServerConfig};
pub use urtp::{
    AudioFrame, CodingScheme, FrameError, UrtpFrame, IP_HEADER_OVERHEAD, MAX_DATAGRAM_SIZE,
    MAX_PAYLOAD_SIZE, NUM_CODING_SCHEMES, SYNC_BYTE, URTP_HEADER_SIZE,
};
