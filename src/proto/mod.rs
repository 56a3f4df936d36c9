//! Native protocol framing: primitives, compression frames, blocks and packets.

mod binary;
mod block;
mod compress;
mod packet;

pub use binary::{byte_len, checked_count, Decoder, Encoder, MAX_WIRE_COUNT};
pub use block::Block;
pub use compress::{
    CompressionMethod, Compressor, CHECKSUM_SIZE, FRAME_HEADER_SIZE, MAX_FRAME_SIZE,
};
pub use packet::*;

#[cfg(test)]
pub(crate) use compress::testing;
