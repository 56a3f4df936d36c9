//! Primitive encoding for the native protocol.
//!
//! All fixed-width integers and floats are little-endian. Lengths and packet tags are
//! unsigned LEB128 varints. Strings are a varint length followed by raw bytes.
//!
//! The [`Decoder`] reads from a snapshot of bytes already received. Every read either
//! succeeds or fails with [`Error::UnexpectedEof`] without consuming anything, so a caller
//! that runs out of input simply receives more bytes and decodes the whole packet again.
//! [`Decoder::needed`] reports how long the input must be before that retry can get further.

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::compress::{
    CompressionMethod, Compressor, CHECKSUM_SIZE, FRAME_HEADER_SIZE, MAX_FRAME_SIZE,
};
use crate::error::{Error, Result};

/// Longest valid encoding of a u64 varint.
const MAX_VARINT_LEN: usize = 10;

// ============================================================================
// Encoder
// ============================================================================

/// Buffered writer for protocol primitives.
#[derive(Debug, Default)]
pub struct Encoder {
    buf: BytesMut,
    /// Start offset of the region that will be compressed.
    compress_from: Option<usize>,
}

impl Encoder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(8192),
            compress_from: None,
        }
    }

    pub fn uvarint(&mut self, mut value: u64) {
        loop {
            let mut byte = (value & 0x7F) as u8;
            value >>= 7;
            if value != 0 {
                byte |= 0x80;
            }
            self.buf.put_u8(byte);
            if value == 0 {
                break;
            }
        }
    }

    #[inline]
    pub fn u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    #[inline]
    pub fn i8(&mut self, v: i8) {
        self.buf.put_i8(v);
    }

    #[inline]
    pub fn bool(&mut self, v: bool) {
        self.buf.put_u8(v as u8);
    }

    #[inline]
    pub fn u16(&mut self, v: u16) {
        self.buf.put_u16_le(v);
    }

    #[inline]
    pub fn i16(&mut self, v: i16) {
        self.buf.put_i16_le(v);
    }

    #[inline]
    pub fn u32(&mut self, v: u32) {
        self.buf.put_u32_le(v);
    }

    #[inline]
    pub fn i32(&mut self, v: i32) {
        self.buf.put_i32_le(v);
    }

    #[inline]
    pub fn u64(&mut self, v: u64) {
        self.buf.put_u64_le(v);
    }

    #[inline]
    pub fn i64(&mut self, v: i64) {
        self.buf.put_i64_le(v);
    }

    #[inline]
    pub fn u128(&mut self, v: u128) {
        self.buf.put_u128_le(v);
    }

    #[inline]
    pub fn i128(&mut self, v: i128) {
        self.buf.put_i128_le(v);
    }

    #[inline]
    pub fn f32(&mut self, v: f32) {
        self.buf.put_f32_le(v);
    }

    #[inline]
    pub fn f64(&mut self, v: f64) {
        self.buf.put_f64_le(v);
    }

    /// Length-prefixed string.
    pub fn string(&mut self, s: &str) {
        self.bytes(s.as_bytes());
    }

    /// Length-prefixed byte string.
    pub fn bytes(&mut self, b: &[u8]) {
        self.uvarint(b.len() as u64);
        self.buf.put_slice(b);
    }

    /// Raw bytes without a length prefix.
    pub fn raw(&mut self, b: &[u8]) {
        self.buf.put_slice(b);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Everything written from now on until [`Encoder::end_compression`] is framed.
    pub fn start_compression(&mut self) {
        self.compress_from = Some(self.buf.len());
    }

    /// Replace the bytes written since [`Encoder::start_compression`] with compressed frames.
    pub fn end_compression(&mut self, compressor: &dyn Compressor) -> Result<()> {
        let Some(start) = self.compress_from.take() else {
            return Ok(());
        };
        let plain = self.buf.split_off(start);
        for chunk in plain.chunks(MAX_FRAME_SIZE) {
            let payload = compressor.compress(chunk)?;
            let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
            frame.push(compressor.method().code());
            frame.extend_from_slice(&((payload.len() + FRAME_HEADER_SIZE) as u32).to_le_bytes());
            frame.extend_from_slice(&(chunk.len() as u32).to_le_bytes());
            frame.extend_from_slice(&payload);
            self.buf.put_slice(&compressor.checksum(&frame));
            self.buf.put_slice(&frame);
        }
        Ok(())
    }

    /// Write all buffered bytes to `writer` and flush it.
    pub async fn flush<W: AsyncWrite + Unpin>(&mut self, writer: &mut W) -> Result<()> {
        if !self.buf.is_empty() {
            writer.write_all(&self.buf).await?;
            self.buf.clear();
        }
        writer.flush().await?;
        Ok(())
    }

    /// Take the buffered bytes, leaving the encoder empty.
    pub fn take(&mut self) -> BytesMut {
        self.compress_from = None;
        self.buf.split()
    }

    /// Drop any buffered bytes.
    pub fn reset(&mut self) {
        self.compress_from = None;
        self.buf.clear();
    }
}

// ============================================================================
// Decoder
// ============================================================================

/// Reader for protocol primitives over a received byte snapshot.
pub struct Decoder<'a> {
    input: &'a [u8],
    pos: usize,
    /// Set while reading a compressed region.
    compressor: Option<&'a dyn Compressor>,
    plain: Vec<u8>,
    plain_pos: usize,
    /// Furthest raw input length a failed read asked for.
    needed: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self {
            input,
            pos: 0,
            compressor: None,
            plain: Vec::new(),
            plain_pos: 0,
            needed: 0,
        }
    }

    /// Number of raw input bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Minimum raw input length for another decode attempt to get past the point where
    /// this one ran out. Always longer than the current input.
    pub fn needed(&self) -> usize {
        self.needed.max(self.input.len() + 1)
    }

    fn short_of(&mut self, end: usize) -> Error {
        self.needed = self.needed.max(end);
        Error::UnexpectedEof
    }

    /// Whether raw input and any decompressed bytes are exhausted.
    pub fn is_empty(&self) -> bool {
        self.pos >= self.input.len() && self.plain_pos >= self.plain.len()
    }

    /// Read the following bytes through `compressor` frames.
    pub fn start_decompression(&mut self, compressor: &'a dyn Compressor) {
        self.compressor = Some(compressor);
        self.plain.clear();
        self.plain_pos = 0;
    }

    /// Leave the compressed region. Leftover decompressed bytes mean the frame did not end
    /// on the block boundary.
    pub fn end_decompression(&mut self) -> Result<()> {
        self.compressor = None;
        let leftover = self.plain.len() - self.plain_pos;
        self.plain.clear();
        self.plain_pos = 0;
        if leftover != 0 {
            return Err(Error::protocol(format!(
                "{} unread bytes left in compressed frame",
                leftover
            )));
        }
        Ok(())
    }

    /// Take exactly `n` bytes.
    pub fn take(&mut self, n: usize) -> Result<&[u8]> {
        if let Some(compressor) = self.compressor {
            while self.plain.len() - self.plain_pos < n {
                self.read_frame(compressor)?;
            }
            let start = self.plain_pos;
            self.plain_pos += n;
            return Ok(&self.plain[start..start + n]);
        }

        let end = self.pos.saturating_add(n);
        if end > self.input.len() {
            return Err(self.short_of(end));
        }
        let start = self.pos;
        self.pos = end;
        Ok(&self.input[start..end])
    }

    fn read_frame(&mut self, compressor: &dyn Compressor) -> Result<()> {
        let input = self.input;
        let rest = &input[self.pos..];
        if rest.len() < CHECKSUM_SIZE + FRAME_HEADER_SIZE {
            return Err(self.short_of(self.pos + CHECKSUM_SIZE + FRAME_HEADER_SIZE));
        }
        let header = &rest[CHECKSUM_SIZE..CHECKSUM_SIZE + FRAME_HEADER_SIZE];
        let method = header[0];
        let compressed_size = u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as usize;
        let decompressed_size =
            u32::from_le_bytes([header[5], header[6], header[7], header[8]]) as usize;

        if compressed_size < FRAME_HEADER_SIZE {
            return Err(Error::Compression(format!(
                "invalid compressed frame size {}",
                compressed_size
            )));
        }
        if rest.len() < CHECKSUM_SIZE + compressed_size {
            return Err(self.short_of(self.pos + CHECKSUM_SIZE + compressed_size));
        }
        if CompressionMethod::from_code(method).is_none() {
            return Err(Error::Compression(format!("unknown method 0x{:02x}", method)));
        }

        let frame = &rest[CHECKSUM_SIZE..CHECKSUM_SIZE + compressed_size];
        if compressor.checksum(frame) != rest[..CHECKSUM_SIZE] {
            return Err(Error::Compression("checksum mismatch".to_string()));
        }

        let data = if method == CompressionMethod::None.code() {
            frame[FRAME_HEADER_SIZE..].to_vec()
        } else {
            compressor.decompress(&frame[FRAME_HEADER_SIZE..], decompressed_size)?
        };
        if data.len() != decompressed_size {
            return Err(Error::Compression(format!(
                "expected {} decompressed bytes, got {}",
                decompressed_size,
                data.len()
            )));
        }

        self.plain.drain(..self.plain_pos);
        self.plain_pos = 0;
        self.plain.extend_from_slice(&data);
        self.pos += CHECKSUM_SIZE + compressed_size;
        Ok(())
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn uvarint(&mut self) -> Result<u64> {
        // Peek first so that a truncated varint consumes nothing.
        let mut value = 0u64;
        let mut len = 0usize;
        loop {
            if len == MAX_VARINT_LEN {
                return Err(Error::protocol("varint overflows u64"));
            }
            let byte = self.peek_at(len)?;
            value |= ((byte & 0x7F) as u64) << (7 * len);
            len += 1;
            if byte & 0x80 == 0 {
                break;
            }
        }
        self.take(len)?;
        Ok(value)
    }

    fn peek_at(&mut self, offset: usize) -> Result<u8> {
        if let Some(compressor) = self.compressor {
            while self.plain.len() - self.plain_pos <= offset {
                self.read_frame(compressor)?;
            }
            return Ok(self.plain[self.plain_pos + offset]);
        }
        match self.input.get(self.pos + offset) {
            Some(byte) => Ok(*byte),
            None => Err(self.short_of(self.pos + offset + 1)),
        }
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn i8(&mut self) -> Result<i8> {
        Ok(self.take(1)?[0] as i8)
    }

    pub fn bool(&mut self) -> Result<bool> {
        Ok(self.u8()? != 0)
    }

    pub fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub fn i16(&mut self) -> Result<i16> {
        Ok(i16::from_le_bytes(self.array()?))
    }

    pub fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    pub fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    pub fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    pub fn u128(&mut self) -> Result<u128> {
        Ok(u128::from_le_bytes(self.array()?))
    }

    pub fn i128(&mut self) -> Result<i128> {
        Ok(i128::from_le_bytes(self.array()?))
    }

    pub fn f32(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.array()?))
    }

    pub fn f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.array()?))
    }

    /// Length-prefixed byte string.
    pub fn bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.length()?;
        Ok(self.take(len)?.to_vec())
    }

    /// Length-prefixed string. Invalid UTF-8 is replaced rather than rejected.
    pub fn string(&mut self) -> Result<String> {
        let len = self.length()?;
        let raw = self.take(len)?;
        Ok(std::str::from_utf8(raw)
            .map(|s| s.to_owned())
            .unwrap_or_else(|_| String::from_utf8_lossy(raw).into_owned()))
    }

    /// A varint length, bounded by what could possibly follow.
    pub fn length(&mut self) -> Result<usize> {
        let len = self.uvarint()?;
        usize::try_from(len)
            .ok()
            .filter(|len| *len <= isize::MAX as usize)
            .ok_or_else(|| Error::protocol(format!("length {} out of range", len)))
    }

    /// A varint element count, see [`checked_count`].
    pub fn count(&mut self) -> Result<usize> {
        let n = self.uvarint()?;
        checked_count(n)
    }

    /// Bytes certainly still readable: undecoded input plus buffered decompressed bytes.
    ///
    /// Inside a compressed region this undercounts, since later frames expand.
    pub fn remaining(&self) -> usize {
        self.input.len().saturating_sub(self.pos) + (self.plain.len() - self.plain_pos)
    }

    /// Capacity worth reserving for `n` items of at least `size` bytes each.
    pub fn capacity_hint(&self, n: usize, size: usize) -> usize {
        n.min(self.remaining() / size.max(1))
    }
}

/// Largest element count accepted from the wire. Larger counts are corrupt input.
pub const MAX_WIRE_COUNT: u64 = 1 << 40;

/// Validate an element count read from the wire.
pub fn checked_count(n: u64) -> Result<usize> {
    usize::try_from(n)
        .ok()
        .filter(|_| n <= MAX_WIRE_COUNT)
        .ok_or_else(|| Error::protocol(format!("count {} out of range", n)))
}

/// Byte length of `n` fixed-width items.
pub fn byte_len(n: usize, size: usize) -> Result<usize> {
    n.checked_mul(size)
        .ok_or_else(|| Error::protocol(format!("{} items of {} bytes overflow", n, size)))
}
