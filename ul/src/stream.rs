//! Cursor-based byte stream codec.
//!
//! This module provides [`ByteStream`],
//! a sequential encoder/decoder over a contiguous in-memory buffer.
//! All upper layer wire encoding and decoding is built on it:
//! fields serialize themselves onto a stream,
//! and PDU readers consume one from the framed bytes received on a socket.
//!
//! The byte order of multi-byte values is fixed once at construction
//! and reused for every subsequent operation on the stream.
//! The DICOM upper layer protocol uses big endian.
use byteordered::byteorder::{BigEndian, ByteOrder, LittleEndian};
use byteordered::Endianness;
use snafu::{ensure, Backtrace, OptionExt, Snafu};

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display(
        "reading {bytes} bytes at offset {offset} would overrun the stream bound {bound}"
    ))]
    ReadOutOfBounds {
        offset: usize,
        bytes: usize,
        bound: usize,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "source window [{start}, {start}+{len}) is out of range of a {available} byte buffer"
    ))]
    SourceOutOfBounds {
        start: usize,
        len: usize,
        available: usize,
        backtrace: Backtrace,
    },

    #[snafu(display("text `{value}` is not valid ASCII"))]
    NonAsciiText { value: String, backtrace: Backtrace },

    #[snafu(display("`{value}` is not a valid run of hexadecimal byte pairs"))]
    InvalidHexText { value: String, backtrace: Backtrace },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Apply a body parameterized over a `byteorder::ByteOrder` type,
/// resolved once from the stream's runtime endianness.
macro_rules! with_order {
    ($endianness:expr, |$order:ident| $body:expr) => {
        match $endianness {
            Endianness::Little => {
                type $order = LittleEndian;
                $body
            }
            Endianness::Big => {
                type $order = BigEndian;
                $body
            }
        }
    };
}

/// A growable byte buffer with independent read and write cursors.
///
/// The write cursor is always at the end of the written content:
/// writes append, [`skip`](Self::skip) appends zeroes,
/// and [`as_bytes`](Self::as_bytes) exposes exactly the written prefix.
/// The read cursor starts at the beginning and
/// advances through typed reads, [`advance`](Self::advance),
/// and [`substream`](Self::substream).
///
/// Reading past the end of the written content is a hard
/// [`ReadOutOfBounds`](Error::ReadOutOfBounds) error,
/// never a silent read of adjacent memory.
#[derive(Debug, Clone)]
pub struct ByteStream {
    buf: Vec<u8>,
    pos: usize,
    endianness: Endianness,
}

impl ByteStream {
    /// Create an empty stream with the given byte order.
    pub fn new(endianness: Endianness) -> Self {
        ByteStream {
            buf: Vec::new(),
            pos: 0,
            endianness,
        }
    }

    /// Create an empty big endian stream.
    pub fn big_endian() -> Self {
        Self::new(Endianness::Big)
    }

    /// Create an empty little endian stream.
    pub fn little_endian() -> Self {
        Self::new(Endianness::Little)
    }

    /// Wrap an existing buffer for reading, with the given byte order.
    pub fn from_bytes(bytes: Vec<u8>, endianness: Endianness) -> Self {
        ByteStream {
            buf: bytes,
            pos: 0,
            endianness,
        }
    }

    /// The byte order of this stream.
    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    /// The number of bytes written to the stream so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been written to the stream.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// The written content of the stream,
    /// without any over-allocated tail.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Unwrap the stream into its written content.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Ensure capacity for `needed` more bytes,
    /// growing geometrically past the exact requirement.
    fn grow(&mut self, needed: usize) {
        let free = self.buf.capacity() - self.buf.len();
        if free < needed {
            self.buf.reserve(needed + self.buf.len() / 2);
        }
    }

    // --- write side ---

    pub fn write_u8(&mut self, value: u8) {
        self.grow(1);
        self.buf.push(value);
    }

    pub fn write_i8(&mut self, value: i8) {
        self.write_u8(value as u8);
    }

    pub fn write_u16(&mut self, value: u16) {
        let mut raw = [0u8; 2];
        with_order!(self.endianness, |O| O::write_u16(&mut raw, value));
        self.write_bytes(&raw);
    }

    pub fn write_i16(&mut self, value: i16) {
        let mut raw = [0u8; 2];
        with_order!(self.endianness, |O| O::write_i16(&mut raw, value));
        self.write_bytes(&raw);
    }

    pub fn write_u32(&mut self, value: u32) {
        let mut raw = [0u8; 4];
        with_order!(self.endianness, |O| O::write_u32(&mut raw, value));
        self.write_bytes(&raw);
    }

    pub fn write_i32(&mut self, value: i32) {
        let mut raw = [0u8; 4];
        with_order!(self.endianness, |O| O::write_i32(&mut raw, value));
        self.write_bytes(&raw);
    }

    pub fn write_f32(&mut self, value: f32) {
        let mut raw = [0u8; 4];
        with_order!(self.endianness, |O| O::write_f32(&mut raw, value));
        self.write_bytes(&raw);
    }

    pub fn write_f64(&mut self, value: f64) {
        let mut raw = [0u8; 8];
        with_order!(self.endianness, |O| O::write_f64(&mut raw, value));
        self.write_bytes(&raw);
    }

    /// Append a piece of ASCII text verbatim.
    ///
    /// Byte order does not apply to text:
    /// the same bytes are produced in either endianness.
    pub fn write_ascii(&mut self, text: &str) -> Result<()> {
        ensure!(text.is_ascii(), NonAsciiTextSnafu { value: text });
        self.write_bytes(text.as_bytes());
        Ok(())
    }

    /// Append a run of bytes given as pairs of hexadecimal digits.
    pub fn write_hex(&mut self, text: &str) -> Result<()> {
        ensure!(
            text.len() % 2 == 0 && text.is_ascii(),
            InvalidHexTextSnafu { value: text }
        );
        self.grow(text.len() / 2);
        for i in (0..text.len()).step_by(2) {
            let byte = u8::from_str_radix(&text[i..i + 2], 16)
                .ok()
                .context(InvalidHexTextSnafu { value: text })?;
            self.buf.push(byte);
        }
        Ok(())
    }

    /// Append raw bytes verbatim, without re-encoding.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.grow(bytes.len());
        self.buf.extend_from_slice(bytes);
    }

    /// Copy a window of another buffer verbatim,
    /// failing if the window is out of the source's range.
    pub fn write_raw(&mut self, source: &[u8], start: usize, len: usize) -> Result<()> {
        let window = start
            .checked_add(len)
            .and_then(|end| source.get(start..end))
            .context(SourceOutOfBoundsSnafu {
                start,
                len,
                available: source.len(),
            })?;
        self.write_bytes(window);
        Ok(())
    }

    /// Advance the write cursor by `n` zero-filled bytes.
    pub fn skip(&mut self, n: usize) {
        self.grow(n);
        self.buf.resize(self.buf.len() + n, 0);
    }

    /// Append the written content of another stream,
    /// growing this one to exactly the sum of both sizes.
    pub fn concat(&mut self, other: &ByteStream) {
        self.write_bytes(other.as_bytes());
    }

    // --- read side ---

    /// Take the next `bytes` bytes, advancing the read cursor.
    fn take(&mut self, bytes: usize) -> Result<&[u8]> {
        ensure!(
            self.pos.checked_add(bytes).is_some_and(|end| end <= self.buf.len()),
            ReadOutOfBoundsSnafu {
                offset: self.pos,
                bytes,
                bound: self.buf.len(),
            }
        );
        let out = &self.buf[self.pos..self.pos + bytes];
        self.pos += bytes;
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        Ok(self.take(1)?[0] as i8)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let endianness = self.endianness;
        let raw = self.take(2)?;
        Ok(with_order!(endianness, |O| O::read_u16(raw)))
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        let endianness = self.endianness;
        let raw = self.take(2)?;
        Ok(with_order!(endianness, |O| O::read_i16(raw)))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let endianness = self.endianness;
        let raw = self.take(4)?;
        Ok(with_order!(endianness, |O| O::read_u32(raw)))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        let endianness = self.endianness;
        let raw = self.take(4)?;
        Ok(with_order!(endianness, |O| O::read_i32(raw)))
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        let endianness = self.endianness;
        let raw = self.take(4)?;
        Ok(with_order!(endianness, |O| O::read_f32(raw)))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        let endianness = self.endianness;
        let raw = self.take(8)?;
        Ok(with_order!(endianness, |O| O::read_f64(raw)))
    }

    /// Read `len` bytes of ASCII text.
    pub fn read_ascii(&mut self, len: usize) -> Result<String> {
        let bytes = self.take(len)?;
        ensure!(
            bytes.is_ascii(),
            NonAsciiTextSnafu {
                value: String::from_utf8_lossy(bytes).into_owned(),
            }
        );
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    /// Read `len` bytes as pairs of lowercase hexadecimal digits.
    pub fn read_hex(&mut self, len: usize) -> Result<String> {
        let bytes = self.take(len)?;
        let mut out = String::with_capacity(len * 2);
        for byte in bytes {
            out.push_str(&format!("{byte:02x}"));
        }
        Ok(out)
    }

    /// Read `len` bytes verbatim.
    pub fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        Ok(self.take(len)?.to_vec())
    }

    /// Inspect the next byte without consuming it.
    pub fn peek_u8(&self) -> Result<u8> {
        self.buf.get(self.pos).copied().context(ReadOutOfBoundsSnafu {
            offset: self.pos,
            bytes: 1usize,
            bound: self.buf.len(),
        })
    }

    /// Advance the read cursor by `n` bytes without reading them.
    pub fn advance(&mut self, n: usize) -> Result<()> {
        self.take(n)?;
        Ok(())
    }

    /// Split off the next `len` bytes
    /// into an independent stream with the same byte order,
    /// advancing this stream past them.
    ///
    /// The sub-stream cannot read beyond its declared bound:
    /// a nested decoder handed one is contained by construction.
    pub fn substream(&mut self, len: usize) -> Result<ByteStream> {
        let bytes = self.take(len)?.to_vec();
        Ok(ByteStream::from_bytes(bytes, self.endianness))
    }

    /// Whether the read cursor has reached the end of the written content.
    pub fn is_end(&self) -> bool {
        self.pos >= self.buf.len()
    }

    /// The number of bytes left to read.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos.min(self.buf.len())
    }
}
