//! Leaf serialization units for the upper layer wire format.
//!
//! A [`Field`] pairs a wire type with a value and knows its own
//! encoded width, so that composite structures can compute their
//! length fields by summing over a field list before any byte is
//! written.
use snafu::{ensure, Backtrace, ResultExt, Snafu};

use crate::stream::ByteStream;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// A value is too long for the fixed-width field holding it.
    /// Values are never silently truncated.
    #[snafu(display("length mismatch: value of {actual} bytes in a field of width {width}"))]
    LengthMismatch {
        width: usize,
        actual: usize,
        backtrace: Backtrace,
    },

    #[snafu(display("could not serialize field"))]
    WriteToStream {
        #[snafu(backtrace)]
        source: crate::stream::Error,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// One leaf value of the wire format,
/// tagged with how it is to be encoded.
///
/// Fields are transient:
/// they are produced while serializing a PDU
/// and consumed by writing them to a [`ByteStream`].
#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    F32(f32),
    F64(f64),
    /// ASCII text, as long as the text itself.
    Ascii(String),
    /// A run of bytes spelled as hexadecimal digit pairs.
    Hex(String),
    /// A raw byte run, copied verbatim.
    Bytes(Vec<u8>),
    /// A fixed-width field holding ASCII text
    /// padded with spaces (`0x20`) up to `width`.
    ///
    /// A value longer than `width` is a hard error.
    Filled { value: String, width: usize },
    /// A run of zero-filled reserved bytes.
    Reserved(usize),
}

impl Field {
    /// A single reserved byte, the most common reserved run.
    pub fn reserved() -> Field {
        Field::Reserved(1)
    }

    /// Whether this field is a fixed-width numeric value.
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            Field::U8(_)
                | Field::I8(_)
                | Field::U16(_)
                | Field::I16(_)
                | Field::U32(_)
                | Field::I32(_)
                | Field::F32(_)
                | Field::F64(_)
        )
    }

    /// The exact number of bytes this field occupies on the wire.
    pub fn wire_len(&self) -> usize {
        match self {
            Field::U8(_) | Field::I8(_) => 1,
            Field::U16(_) | Field::I16(_) => 2,
            Field::U32(_) | Field::I32(_) | Field::F32(_) => 4,
            Field::F64(_) => 8,
            Field::Ascii(text) => text.len(),
            Field::Hex(text) => text.len() / 2,
            Field::Bytes(bytes) => bytes.len(),
            Field::Filled { width, .. } => *width,
            Field::Reserved(len) => *len,
        }
    }

    /// Serialize this field onto the given stream.
    pub fn write_to(&self, stream: &mut ByteStream) -> Result<()> {
        match self {
            Field::U8(v) => stream.write_u8(*v),
            Field::I8(v) => stream.write_i8(*v),
            Field::U16(v) => stream.write_u16(*v),
            Field::I16(v) => stream.write_i16(*v),
            Field::U32(v) => stream.write_u32(*v),
            Field::I32(v) => stream.write_i32(*v),
            Field::F32(v) => stream.write_f32(*v),
            Field::F64(v) => stream.write_f64(*v),
            Field::Ascii(text) => stream.write_ascii(text).context(WriteToStreamSnafu)?,
            Field::Hex(text) => stream.write_hex(text).context(WriteToStreamSnafu)?,
            Field::Bytes(bytes) => stream.write_bytes(bytes),
            Field::Filled { value, width } => {
                ensure!(
                    value.len() <= *width,
                    LengthMismatchSnafu {
                        width: *width,
                        actual: value.len(),
                    }
                );
                stream.write_ascii(value).context(WriteToStreamSnafu)?;
                for _ in value.len()..*width {
                    stream.write_u8(b' ');
                }
            }
            Field::Reserved(len) => stream.skip(*len),
        }
        Ok(())
    }
}

/// The summed wire length of a list of fields.
pub fn wire_len(fields: &[Field]) -> usize {
    fields.iter().map(Field::wire_len).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_fields_have_fixed_widths() {
        assert_eq!(Field::U8(0).wire_len(), 1);
        assert_eq!(Field::U16(0).wire_len(), 2);
        assert_eq!(Field::U32(0).wire_len(), 4);
        assert_eq!(Field::I8(0).wire_len(), 1);
        assert_eq!(Field::I16(0).wire_len(), 2);
        assert_eq!(Field::I32(0).wire_len(), 4);
        assert_eq!(Field::F32(0.).wire_len(), 4);
        assert_eq!(Field::F64(0.).wire_len(), 8);
        assert!(Field::U32(9).is_numeric());
        assert!(!Field::Ascii("1.2.840".into()).is_numeric());
    }

    #[test]
    fn filled_field_pads_with_spaces() {
        let mut stream = ByteStream::big_endian();
        Field::Filled {
            value: "STORE-SCP".into(),
            width: 16,
        }
        .write_to(&mut stream)
        .unwrap();
        assert_eq!(stream.as_bytes(), b"STORE-SCP       ");
    }

    #[test]
    fn filled_field_of_exact_width_passes_through() {
        let mut stream = ByteStream::big_endian();
        Field::Filled {
            value: "ABCDEFGHIJKLMNOP".into(),
            width: 16,
        }
        .write_to(&mut stream)
        .unwrap();
        assert_eq!(stream.as_bytes(), b"ABCDEFGHIJKLMNOP");
    }

    #[test]
    fn overlong_filled_field_is_an_error() {
        let mut stream = ByteStream::big_endian();
        let err = Field::Filled {
            value: "AN-AE-TITLE-TOO-LONG".into(),
            width: 16,
        }
        .write_to(&mut stream)
        .unwrap_err();
        assert!(matches!(err, Error::LengthMismatch { width: 16, actual: 20, .. }));
        // nothing may have been written
        assert!(stream.is_empty());
    }

    #[test]
    fn reserved_field_writes_zeroes() {
        let mut stream = ByteStream::big_endian();
        Field::reserved().write_to(&mut stream).unwrap();
        Field::Reserved(3).write_to(&mut stream).unwrap();
        assert_eq!(stream.as_bytes(), &[0, 0, 0, 0]);
    }

    #[test]
    fn field_list_length_sums_members() {
        let fields = vec![
            Field::U8(0x01),
            Field::Reserved(1),
            Field::U16(10),
            Field::Ascii("1.2.840.10008".into()),
        ];
        assert_eq!(wire_len(&fields), 1 + 1 + 2 + 13);
    }
}
