//! Block compression hook.
//!
//! The codecs themselves live outside this crate. The wire layer only knows the frame
//! layout and asks a [`Compressor`] to do the byte work:
//!
//! ```text
//! [checksum: 16][method: u8][compressed_size: u32][decompressed_size: u32][payload]
//! ```
//!
//! `compressed_size` counts the 9 header bytes plus the payload, and the checksum covers
//! the same range.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Size of the method byte plus the two length fields.
pub const FRAME_HEADER_SIZE: usize = 9;
pub const CHECKSUM_SIZE: usize = 16;
/// Uncompressed bytes per frame.
pub const MAX_FRAME_SIZE: usize = 1 << 20;

/// Compression method declared in the options and written into every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionMethod {
    #[default]
    None,
    Lz4,
    Zstd,
}

impl CompressionMethod {
    /// Method byte used in the frame header.
    pub fn code(self) -> u8 {
        match self {
            CompressionMethod::None => 0x02,
            CompressionMethod::Lz4 => 0x82,
            CompressionMethod::Zstd => 0x90,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x02 => Some(CompressionMethod::None),
            0x82 => Some(CompressionMethod::Lz4),
            0x90 => Some(CompressionMethod::Zstd),
            _ => None,
        }
    }

    pub fn is_enabled(self) -> bool {
        self != CompressionMethod::None
    }
}

impl FromStr for CompressionMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "" | "none" | "false" | "0" => Ok(CompressionMethod::None),
            "lz4" | "true" | "1" => Ok(CompressionMethod::Lz4),
            "zstd" => Ok(CompressionMethod::Zstd),
            other => Err(Error::Config(format!("unknown compression method: {}", other))),
        }
    }
}

impl fmt::Display for CompressionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CompressionMethod::None => "none",
            CompressionMethod::Lz4 => "lz4",
            CompressionMethod::Zstd => "zstd",
        };
        f.write_str(name)
    }
}

/// A block codec supplied by the application.
pub trait Compressor: Send + Sync + fmt::Debug {
    fn method(&self) -> CompressionMethod;

    fn compress(&self, input: &[u8]) -> Result<Vec<u8>>;

    /// `decompressed_size` comes from the frame header and is the exact expected output length.
    fn decompress(&self, input: &[u8], decompressed_size: usize) -> Result<Vec<u8>>;

    /// 128-bit checksum over the frame header and payload.
    fn checksum(&self, frame: &[u8]) -> [u8; CHECKSUM_SIZE];
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Identity codec with a trivial checksum, enough to exercise the framing.
    #[derive(Debug, Default)]
    pub struct PassThrough;

    impl Compressor for PassThrough {
        fn method(&self) -> CompressionMethod {
            CompressionMethod::Lz4
        }

        fn compress(&self, input: &[u8]) -> Result<Vec<u8>> {
            Ok(input.to_vec())
        }

        fn decompress(&self, input: &[u8], decompressed_size: usize) -> Result<Vec<u8>> {
            if input.len() != decompressed_size {
                return Err(Error::Compression("size mismatch".to_string()));
            }
            Ok(input.to_vec())
        }

        fn checksum(&self, frame: &[u8]) -> [u8; CHECKSUM_SIZE] {
            let mut sum = [0u8; CHECKSUM_SIZE];
            for (i, b) in frame.iter().enumerate() {
                sum[i % CHECKSUM_SIZE] ^= b.rotate_left((i / CHECKSUM_SIZE) as u32 % 8);
            }
            sum
        }
    }
}
