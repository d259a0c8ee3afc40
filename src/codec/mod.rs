//! Wire framing for the multiplexed transport.
//!
//! - [`frame`]: fixed header, segment types, incremental decoder
//! - [`chunk`]: splitting large messages and reassembling them

pub mod chunk;
pub mod frame;

pub use chunk::{Chunker, Reassembler};
pub use frame::{ChunkFlag, Decoded, Frame, FrameDecoder, FrameFlags, FrameHeader, SegmentType};

/// Legacy default: messages of at least this many bytes are chunked
pub const MINIMUM_MESSAGE_SIZE_FOR_CHUNKING: usize = 1_024_000;
