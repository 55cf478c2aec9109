//! P-Data fragmentation and reassembly.
//!
//! A DICOM message of arbitrary size travels as a chain of
//! presentation data values (PDVs) inside P-DATA-TF PDUs.
//! The fragmentation boundary is decided purely by the
//! maximum PDU size negotiated for the association,
//! never by message semantics.
//! [`PDataWriter`] splits outgoing bytes accordingly,
//! and [`PDataReader`] concatenates incoming fragments in arrival order
//! until the one carrying the last-fragment flag.
use std::io::{Read, Write};

use bytes::{Buf, BytesMut};

use crate::pdu::{read_pdu, Pdu, PDU_HEADER_SIZE};

/// Offset of the message data in the PDU buffer:
/// the 6-byte PDU header plus the 6-byte PDV item header.
const DATA_OFFSET: u32 = PDU_HEADER_SIZE + 6;

/// Fill in the P-Data PDU header for sending.
fn setup_pdata_header(buffer: &mut [u8], is_last: bool) {
    let data_len = (buffer.len() as u32) - DATA_OFFSET;

    // full PDU length (everything past the PDU type and reserved byte)
    let pdu_len = data_len + 4 + 2;
    buffer[2..6].copy_from_slice(&pdu_len.to_be_bytes());

    // PDV item length (context ID + message control header + data)
    let pdv_len = data_len + 2;
    buffer[6..10].copy_from_slice(&pdv_len.to_be_bytes());

    // message control header: data set fragment, possibly the last
    buffer[11] = if is_last { 0x02 } else { 0x00 };
}

/// A P-Data value writer.
///
/// This exposes an API to iteratively construct and send data messages
/// to another node.
/// Using this as a [standard writer](std::io::Write)
/// will automatically split the incoming bytes
/// into separate PDUs if they do not fit in a single one.
#[must_use]
pub struct PDataWriter<W: Write> {
    buffer: Vec<u8>,
    stream: W,
    max_data_len: u32,
}

impl<W> PDataWriter<W>
where
    W: Write,
{
    /// Construct a new P-Data value writer.
    ///
    /// `max_pdu_length` is the maximum value of the PDU-length property
    /// admitted by the receiving node.
    pub(crate) fn new(stream: W, presentation_context_id: u8, max_pdu_length: u32) -> Self {
        let max_data_len = max_pdu_length - PDU_HEADER_SIZE;
        let mut buffer = Vec::with_capacity((max_data_len + DATA_OFFSET) as usize);
        // header placeholder, lengths and control header
        // are filled in just before dispatch
        buffer.extend([
            0x04, 0x00, // PDU type + reserved
            0xFF, 0xFF, 0xFF, 0xFF, // full PDU length
            0xFF, 0xFF, 0xFF, 0xFF, // PDV item length
            presentation_context_id,
            0xFF, // message control header
        ]);

        PDataWriter {
            stream,
            max_data_len,
            buffer,
        }
    }

    /// Declare to have finished sending P-Data fragments,
    /// thus emitting the last P-Data fragment PDU.
    ///
    /// This is also done automatically once the P-Data writer is dropped.
    pub fn finish(mut self) -> std::io::Result<()> {
        self.finish_impl()
    }

    fn finish_impl(&mut self) -> std::io::Result<()> {
        if !self.buffer.is_empty() {
            setup_pdata_header(&mut self.buffer, true);
            self.stream.write_all(&self.buffer)?;
            // subsequent calls must not emit another PDU
            self.buffer.clear();
        }
        Ok(())
    }

    /// Send the buffered fragment as one non-final PDU
    /// and reset the buffer to just the header.
    fn dispatch_pdu(&mut self) -> std::io::Result<()> {
        debug_assert!(self.buffer.len() >= DATA_OFFSET as usize);
        setup_pdata_header(&mut self.buffer, false);
        self.stream.write_all(&self.buffer)?;
        self.buffer.truncate(DATA_OFFSET as usize);
        Ok(())
    }
}

impl<W> Write for PDataWriter<W>
where
    W: Write,
{
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let total_len = self.max_data_len as usize + DATA_OFFSET as usize;
        if self.buffer.len() + buf.len() <= total_len {
            self.buffer.extend(buf);
            Ok(buf.len())
        } else {
            // fill the current fragment to the boundary, send it,
            // and leave the rest for subsequent writes
            let buf = &buf[..total_len - self.buffer.len()];
            self.buffer.extend(buf);
            self.dispatch_pdu()?;
            Ok(buf.len())
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// With the P-Data writer dropped,
/// emit the last P-Data fragment PDU
/// if there is any data left to send.
impl<W> Drop for PDataWriter<W>
where
    W: Write,
{
    fn drop(&mut self) {
        let _ = self.finish_impl();
    }
}

/// A P-Data value reader.
///
/// Reading from it yields the reassembled bytes of one DICOM message:
/// incoming PDVs are concatenated in arrival order
/// and the stream ends once the fragment
/// carrying the last-fragment flag has been consumed.
/// A chain that never carries the flag is not a complete message;
/// running out of socket before it arrives is an error.
#[must_use]
pub struct PDataReader<R: Read> {
    buffer: BytesMut,
    stream: R,
    presentation_context_id: Option<u8>,
    max_pdu_length: u32,
    last_pdu_seen: bool,
}

impl<R> PDataReader<R>
where
    R: Read,
{
    pub(crate) fn new(stream: R, max_pdu_length: u32) -> Self {
        PDataReader {
            buffer: BytesMut::with_capacity(max_pdu_length as usize),
            stream,
            presentation_context_id: None,
            max_pdu_length,
            last_pdu_seen: false,
        }
    }

    /// The presentation context ID of the message being reassembled,
    /// known once the first fragment has arrived.
    pub fn presentation_context_id(&self) -> Option<u8> {
        self.presentation_context_id
    }

    fn fetch_pdu(&mut self) -> std::io::Result<()> {
        let pdu = read_pdu(&mut self.stream, self.max_pdu_length, false)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        match pdu {
            Pdu::PData { data } => {
                for pdv in data {
                    self.presentation_context_id
                        .get_or_insert(pdv.presentation_context_id);
                    self.last_pdu_seen = pdv.is_last;
                    self.buffer.extend_from_slice(&pdv.data);
                }
                Ok(())
            }
            pdu => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unexpected PDU while reading message data: {}", pdu.short_description()),
            )),
        }
    }
}

impl<R> Read for PDataReader<R>
where
    R: Read,
{
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        while self.buffer.is_empty() {
            if self.last_pdu_seen {
                // the chain was terminated by the last-fragment flag
                return Ok(0);
            }
            self.fetch_pdu()?;
        }
        let amount = buf.len().min(self.buffer.remaining());
        self.buffer.copy_to_slice(&mut buf[..amount]);
        Ok(amount)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::{writer::pdu_to_bytes, PDataValue, PDataValueType, MINIMUM_PDU_SIZE};
    use std::io::Cursor;

    fn p_data_bytes(fragments: &[(bool, Vec<u8>)]) -> Vec<u8> {
        let mut out = Vec::new();
        for (is_last, data) in fragments {
            let pdu = Pdu::PData {
                data: vec![PDataValue {
                    presentation_context_id: 1,
                    value_type: PDataValueType::Data,
                    is_last: *is_last,
                    data: data.clone(),
                }],
            };
            out.extend(pdu_to_bytes(&pdu).unwrap());
        }
        out
    }

    #[test]
    fn reassembles_fragments_until_the_last_flag() {
        let wire = p_data_bytes(&[
            (false, vec![1, 2, 3]),
            (false, vec![4, 5]),
            (true, vec![6]),
            // a following message must not be consumed
            (true, vec![0xDD; 4]),
        ]);
        let mut reader = PDataReader::new(Cursor::new(wire), MINIMUM_PDU_SIZE);
        let mut message = Vec::new();
        reader.read_to_end(&mut message).unwrap();
        assert_eq!(message, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(reader.presentation_context_id(), Some(1));
    }

    #[test]
    fn incomplete_chain_is_not_a_message() {
        let wire = p_data_bytes(&[(false, vec![1, 2, 3])]);
        let mut reader = PDataReader::new(Cursor::new(wire), MINIMUM_PDU_SIZE);
        let mut message = Vec::new();
        // the source ends before any fragment carries the last flag
        assert!(reader.read_to_end(&mut message).is_err());
    }

    #[test]
    fn writer_splits_at_the_negotiated_boundary() {
        let mut wire = Vec::new();
        {
            let mut writer = PDataWriter::new(&mut wire, 1, MINIMUM_PDU_SIZE);
            writer
                .write_all(&vec![0x55u8; MINIMUM_PDU_SIZE as usize * 2])
                .unwrap();
            writer.finish().unwrap();
        }

        // parse everything back and reassemble
        let mut reader = PDataReader::new(Cursor::new(wire), MINIMUM_PDU_SIZE);
        let mut message = Vec::new();
        reader.read_to_end(&mut message).unwrap();
        assert_eq!(message.len(), MINIMUM_PDU_SIZE as usize * 2);
        assert!(message.iter().all(|b| *b == 0x55));
    }

    #[test]
    fn writer_emits_an_empty_last_fragment_for_no_data() {
        let mut wire = Vec::new();
        {
            let writer = PDataWriter::new(&mut wire, 1, MINIMUM_PDU_SIZE);
            writer.finish().unwrap();
        }
        // PDU header + PDV header with no data
        assert_eq!(wire.len(), DATA_OFFSET as usize);
        assert_eq!(wire[0], 0x04);
        assert_eq!(wire[11], 0x02);
    }
}
