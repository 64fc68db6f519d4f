//! Chuff audio server library.
//!
//! Receives URTP audio from remote Chuff clients over UDP or TCP,
//! reconstructs a continuous 16 kHz mono PCM stream despite loss and
//! reordering, transcodes it into 15-second MP3 segments and publishes
//! them as an HLS playlist over HTTPS. The pieces are exposed as a
//! library so integration tests can drive the pipeline end to end.

pub mod ingest;
pub mod mp3;
pub mod playlist;
pub mod processor;
pub mod publisher;
pub mod reassembly;
pub mod segment;
pub mod stats;

pub use mp3::Mp3EncoderWrapper;
pub use playlist::{SegmentList, REMOVABLE_AGE, USABLE_AGE};
pub use processor::{run_processor, AudioProcessor};
pub use publisher::{Publisher, PublisherConfig};
pub use reassembly::FrameAssembler;
pub use segment::{MediaControl, SegmentMeta, SegmentWriter, SEGMENT_DURATION};
pub use stats::PipelineStats;
