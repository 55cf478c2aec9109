//! PDU reader module
//!
//! Decoding starts from the framed bytes received on a socket:
//! the 6-byte PDU header names a type code and a declared length,
//! the declared bytes are handed to the matching parser
//! through a bounded [`ByteStream`],
//! and variadic item lists are walked by peeking the next type code
//! without consuming it.
//! An unrecognized top-level type code aborts the read.
use byteordered::byteorder::{BigEndian, ByteOrder};
use byteordered::Endianness;
use snafu::{ensure, Backtrace, OptionExt, ResultExt, Snafu};
use std::io::{ErrorKind, Read};
use tracing::warn;

use crate::pdu::*;
use crate::stream::ByteStream;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("invalid max PDU length {max_pdu_length}"))]
    InvalidMaxPdu {
        max_pdu_length: u32,
        backtrace: Backtrace,
    },

    #[snafu(display("no PDU available"))]
    NoPduAvailable { backtrace: Backtrace },

    #[snafu(display("could not read PDU header"))]
    ReadHeader {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("could not read PDU body"))]
    ReadBody {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("could not read PDU field `{field}`"))]
    ReadPduField {
        field: &'static str,
        #[snafu(backtrace)]
        source: crate::stream::Error,
    },

    #[snafu(display("could not read {bytes} reserved bytes"))]
    ReadReserved {
        bytes: usize,
        #[snafu(backtrace)]
        source: crate::stream::Error,
    },

    #[snafu(display("could not read PDU item"))]
    ReadItem {
        #[snafu(backtrace)]
        source: crate::stream::Error,
    },

    #[snafu(display(
        "incoming PDU was too large: length {pdu_length}, maximum is {max_pdu_length}"
    ))]
    PduTooLarge {
        pdu_length: u32,
        max_pdu_length: u32,
        backtrace: Backtrace,
    },

    #[snafu(display("unrecognized PDU type code {pdu_type:#04X}"))]
    UnrecognizedPduType { pdu_type: u8, backtrace: Backtrace },

    #[snafu(display("invalid item length {length} (must be >= 2)"))]
    InvalidItemLength { length: u32, backtrace: Backtrace },

    #[snafu(display("PDU contained an invalid item {var_item:?}"))]
    InvalidPduVariable {
        var_item: PduVariableItem,
        backtrace: Backtrace,
    },

    #[snafu(display("multiple transfer syntaxes were accepted"))]
    MultipleTransferSyntaxesAccepted { backtrace: Backtrace },

    #[snafu(display("invalid reject source or reason"))]
    InvalidRejectSourceOrReason { backtrace: Backtrace },

    #[snafu(display("invalid abort source or reason"))]
    InvalidAbortSourceOrReason { backtrace: Backtrace },

    #[snafu(display("invalid presentation context result reason"))]
    InvalidPresentationContextResultReason { backtrace: Backtrace },

    #[snafu(display("invalid transfer syntax sub-item"))]
    InvalidTransferSyntaxSubItem { backtrace: Backtrace },

    #[snafu(display("unknown presentation context sub-item"))]
    UnknownPresentationContextSubItem { backtrace: Backtrace },

    #[snafu(display("missing application context name"))]
    MissingApplicationContextName { backtrace: Backtrace },

    #[snafu(display("missing abstract syntax"))]
    MissingAbstractSyntax { backtrace: Backtrace },

    #[snafu(display("missing transfer syntax"))]
    MissingTransferSyntax { backtrace: Backtrace },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Whether a read error was caused by an expired socket timeout.
pub(crate) fn is_timeout(err: &Error) -> bool {
    match err {
        Error::ReadHeader { source, .. } | Error::ReadBody { source, .. } => matches!(
            source.kind(),
            ErrorKind::TimedOut | ErrorKind::WouldBlock
        ),
        _ => false,
    }
}

/// Read a full PDU from the given source.
///
/// In strict mode, a PDU longer than `max_pdu_length` is an error;
/// otherwise it is tolerated with a warning
/// up to the absolute maximum admitted by the standard.
pub fn read_pdu<R>(reader: &mut R, max_pdu_length: u32, strict: bool) -> Result<Pdu>
where
    R: Read,
{
    ensure!(
        (MINIMUM_PDU_SIZE..=MAXIMUM_PDU_SIZE).contains(&max_pdu_length),
        InvalidMaxPduSnafu { max_pdu_length }
    );

    // If the first two bytes cannot be read, no PDU was available at all.
    // This read can block until the peer sends something or closes the
    // socket, so "nothing arrived" is distinguished from a PDU that was
    // truncated after we began reading it.
    let mut head = [0u8; 2];
    if let Err(e) = reader.read_exact(&mut head) {
        ensure!(e.kind() != ErrorKind::UnexpectedEof, NoPduAvailableSnafu);
        return Err(e).context(ReadHeaderSnafu);
    }
    let pdu_type = head[0];

    let mut length_bytes = [0u8; 4];
    reader.read_exact(&mut length_bytes).context(ReadHeaderSnafu)?;
    let pdu_length = BigEndian::read_u32(&length_bytes);

    if strict {
        ensure!(
            pdu_length <= max_pdu_length,
            PduTooLargeSnafu {
                pdu_length,
                max_pdu_length
            }
        );
    } else if pdu_length > max_pdu_length {
        ensure!(
            pdu_length <= MAXIMUM_PDU_SIZE,
            PduTooLargeSnafu {
                pdu_length,
                max_pdu_length: MAXIMUM_PDU_SIZE
            }
        );
        warn!(
            "incoming PDU of {} bytes exceeds the negotiated maximum of {}",
            pdu_length, max_pdu_length
        );
    }

    let mut body = vec![0u8; pdu_length as usize];
    reader.read_exact(&mut body).context(ReadBodySnafu)?;
    let mut stream = ByteStream::from_bytes(body, Endianness::Big);

    match pdu_type {
        codes::ASSOCIATION_RQ => read_association_rq(&mut stream),
        codes::ASSOCIATION_AC => read_association_ac(&mut stream),
        codes::ASSOCIATION_RJ => read_association_rj(&mut stream),
        codes::P_DATA_TF => read_p_data(&mut stream),
        // the reserved payload is sent as zeroes
        // but not tested on receipt
        codes::RELEASE_RQ => Ok(Pdu::ReleaseRQ),
        codes::RELEASE_RP => Ok(Pdu::ReleaseRP),
        codes::ABORT_RQ => read_abort(&mut stream),
        _ => UnrecognizedPduTypeSnafu { pdu_type }.fail(),
    }
}

fn read_association_rq(stream: &mut ByteStream) -> Result<Pdu> {
    let (protocol_version, called_ae_title, calling_ae_title) = read_association_prefix(stream)?;

    let mut application_context_name: Option<String> = None;
    let mut presentation_contexts = vec![];
    let mut user_variables = vec![];

    while !stream.is_end() {
        match read_variable_item(stream)? {
            PduVariableItem::ApplicationContext(val) => {
                application_context_name = Some(val);
            }
            PduVariableItem::PresentationContextProposed(val) => {
                presentation_contexts.push(val);
            }
            PduVariableItem::UserVariables(val) => {
                user_variables = val;
            }
            var_item => {
                return InvalidPduVariableSnafu { var_item }.fail();
            }
        }
    }

    Ok(Pdu::AssociationRQ(AssociationRQ {
        protocol_version,
        called_ae_title,
        calling_ae_title,
        application_context_name: application_context_name
            .context(MissingApplicationContextNameSnafu)?,
        presentation_contexts,
        user_variables,
    }))
}

fn read_association_ac(stream: &mut ByteStream) -> Result<Pdu> {
    let (protocol_version, called_ae_title, calling_ae_title) = read_association_prefix(stream)?;

    let mut application_context_name: Option<String> = None;
    let mut presentation_contexts = vec![];
    let mut user_variables = vec![];

    while !stream.is_end() {
        match read_variable_item(stream)? {
            PduVariableItem::ApplicationContext(val) => {
                application_context_name = Some(val);
            }
            PduVariableItem::PresentationContextResult(val) => {
                presentation_contexts.push(val);
            }
            PduVariableItem::UserVariables(val) => {
                user_variables = val;
            }
            var_item => {
                return InvalidPduVariableSnafu { var_item }.fail();
            }
        }
    }

    Ok(Pdu::AssociationAC(AssociationAC {
        protocol_version,
        called_ae_title,
        calling_ae_title,
        application_context_name: application_context_name
            .context(MissingApplicationContextNameSnafu)?,
        presentation_contexts,
        user_variables,
    }))
}

/// The fixed prefix shared by A-ASSOCIATE-RQ and A-ASSOCIATE-AC:
/// protocol version, two reserved bytes,
/// the two 16-byte space-padded AE titles
/// and the 32-byte reserved run.
fn read_association_prefix(stream: &mut ByteStream) -> Result<(u16, String, String)> {
    let protocol_version = stream.read_u16().context(ReadPduFieldSnafu {
        field: "Protocol-version",
    })?;
    stream.advance(2).context(ReadReservedSnafu { bytes: 2usize })?;
    let called_ae_title = read_ae_title(stream, "Called-AE-title")?;
    let calling_ae_title = read_ae_title(stream, "Calling-AE-title")?;
    stream.advance(32).context(ReadReservedSnafu { bytes: 32usize })?;
    Ok((protocol_version, called_ae_title, calling_ae_title))
}

fn read_ae_title(stream: &mut ByteStream, field: &'static str) -> Result<String> {
    // leading and trailing padding is non-significant;
    // some implementations pad with NUL instead of space
    Ok(stream
        .read_ascii(16)
        .context(ReadPduFieldSnafu { field })?
        .trim_matches(['\0', ' '])
        .to_string())
}

fn read_association_rj(stream: &mut ByteStream) -> Result<Pdu> {
    stream.advance(1).context(ReadReservedSnafu { bytes: 1usize })?;
    let result = RejectResult::from_code(
        stream
            .read_u8()
            .context(ReadPduFieldSnafu { field: "Result" })?,
    )
    .context(InvalidRejectSourceOrReasonSnafu)?;
    let source = RejectSource::from_code(
        stream
            .read_u8()
            .context(ReadPduFieldSnafu { field: "Source" })?,
    )
    .context(InvalidRejectSourceOrReasonSnafu)?;
    let reason = stream.read_u8().context(ReadPduFieldSnafu {
        field: "Reason/Diag.",
    })?;

    Ok(Pdu::AssociationRJ(AssociationRJ {
        result,
        source,
        reason,
    }))
}

fn read_p_data(stream: &mut ByteStream) -> Result<Pdu> {
    let mut values = vec![];

    while !stream.is_end() {
        // the PDV length counts the context ID,
        // the message control header and the fragment bytes
        let item_length = stream.read_u32().context(ReadPduFieldSnafu {
            field: "Item-length",
        })?;
        ensure!(
            item_length >= 2,
            InvalidItemLengthSnafu {
                length: item_length
            }
        );

        let presentation_context_id = stream.read_u8().context(ReadPduFieldSnafu {
            field: "Presentation-context-ID",
        })?;

        // message control header:
        // bit 0 command/data, bit 1 last fragment
        let header = stream.read_u8().context(ReadPduFieldSnafu {
            field: "Message Control Header",
        })?;
        let value_type = if header & 0x01 != 0 {
            PDataValueType::Command
        } else {
            PDataValueType::Data
        };
        let is_last = (header & 0x02) != 0;

        let data = stream
            .read_bytes((item_length - 2) as usize)
            .context(ReadPduFieldSnafu {
                field: "Presentation-data-value",
            })?;

        values.push(PDataValue {
            presentation_context_id,
            value_type,
            is_last,
            data,
        });
    }

    Ok(Pdu::PData { data: values })
}

fn read_abort(stream: &mut ByteStream) -> Result<Pdu> {
    stream.advance(2).context(ReadReservedSnafu { bytes: 2usize })?;
    let source_code = stream
        .read_u8()
        .context(ReadPduFieldSnafu { field: "Source" })?;
    let reason_code = stream.read_u8().context(ReadPduFieldSnafu {
        field: "Reason/Diag",
    })?;
    let source = AbortSource::from_codes(source_code, reason_code)
        .context(InvalidAbortSourceOrReasonSnafu)?;

    Ok(Pdu::AbortRQ { source })
}

/// Read one variable item of an association negotiation PDU.
fn read_variable_item(stream: &mut ByteStream) -> Result<PduVariableItem> {
    let item_type = stream
        .read_u8()
        .context(ReadPduFieldSnafu { field: "Item-type" })?;
    stream.advance(1).context(ReadReservedSnafu { bytes: 1usize })?;
    let item_length = stream.read_u16().context(ReadPduFieldSnafu {
        field: "Item-length",
    })?;

    // hand the nested decoder a bounded view of the declared bytes,
    // so it cannot read past its own item
    let mut item = stream
        .substream(item_length as usize)
        .context(ReadItemSnafu)?;

    match item_type {
        codes::APPLICATION_CONTEXT => {
            let remaining = item.remaining();
            let name = item.read_ascii(remaining).context(ReadPduFieldSnafu {
                field: "Application-context-name",
            })?;
            Ok(PduVariableItem::ApplicationContext(trim_uid(&name)))
        }
        codes::PRESENTATION_CONTEXT_RQ => {
            let id = item.read_u8().context(ReadPduFieldSnafu {
                field: "Presentation-context-ID",
            })?;
            item.advance(3).context(ReadReservedSnafu { bytes: 3usize })?;

            let mut abstract_syntax: Option<String> = None;
            let mut transfer_syntaxes = vec![];

            // the sub-item count is not declared up front:
            // peek the next type code to decide how to continue
            while !item.is_end() {
                match item.peek_u8().context(ReadPduFieldSnafu { field: "Item-type" })? {
                    codes::ABSTRACT_SYNTAX => {
                        abstract_syntax =
                            Some(read_uid_sub_item(&mut item, "Abstract-syntax-name")?);
                    }
                    codes::TRANSFER_SYNTAX => {
                        transfer_syntaxes
                            .push(read_uid_sub_item(&mut item, "Transfer-syntax-name")?);
                    }
                    _ => {
                        return UnknownPresentationContextSubItemSnafu.fail();
                    }
                }
            }

            Ok(PduVariableItem::PresentationContextProposed(
                PresentationContextProposed {
                    id,
                    abstract_syntax: abstract_syntax.context(MissingAbstractSyntaxSnafu)?,
                    transfer_syntaxes,
                },
            ))
        }
        codes::PRESENTATION_CONTEXT_AC => {
            let id = item.read_u8().context(ReadPduFieldSnafu {
                field: "Presentation-context-ID",
            })?;
            item.advance(1).context(ReadReservedSnafu { bytes: 1usize })?;
            let reason = PresentationContextResultReason::from_code(
                item.read_u8().context(ReadPduFieldSnafu {
                    field: "Result/Reason",
                })?,
            )
            .context(InvalidPresentationContextResultReasonSnafu)?;
            item.advance(1).context(ReadReservedSnafu { bytes: 1usize })?;

            let mut transfer_syntax: Option<String> = None;
            while !item.is_end() {
                match item.peek_u8().context(ReadPduFieldSnafu { field: "Item-type" })? {
                    codes::TRANSFER_SYNTAX => {
                        // at most one transfer syntax may be accepted
                        ensure!(
                            transfer_syntax.is_none(),
                            MultipleTransferSyntaxesAcceptedSnafu
                        );
                        transfer_syntax =
                            Some(read_uid_sub_item(&mut item, "Transfer-syntax-name")?);
                    }
                    _ => {
                        return InvalidTransferSyntaxSubItemSnafu.fail();
                    }
                }
            }

            Ok(PduVariableItem::PresentationContextResult(
                PresentationContextResult {
                    id,
                    reason,
                    transfer_syntax: transfer_syntax.context(MissingTransferSyntaxSnafu)?,
                },
            ))
        }
        codes::USER_INFORMATION => {
            let mut user_variables = vec![];

            while !item.is_end() {
                let sub_item_type = item
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Item-type" })?;
                item.advance(1).context(ReadReservedSnafu { bytes: 1usize })?;
                let sub_item_length = item.read_u16().context(ReadPduFieldSnafu {
                    field: "Item-length",
                })?;

                match sub_item_type {
                    codes::MAXIMUM_LENGTH => {
                        user_variables.push(UserVariableItem::MaxLength(
                            item.read_u32().context(ReadPduFieldSnafu {
                                field: "Maximum-length-received",
                            })?,
                        ));
                    }
                    codes::IMPLEMENTATION_CLASS_UID => {
                        let uid =
                            item.read_ascii(sub_item_length as usize)
                                .context(ReadPduFieldSnafu {
                                    field: "Implementation-class-uid",
                                })?;
                        user_variables
                            .push(UserVariableItem::ImplementationClassUID(trim_uid(&uid)));
                    }
                    codes::IMPLEMENTATION_VERSION_NAME => {
                        let name =
                            item.read_ascii(sub_item_length as usize)
                                .context(ReadPduFieldSnafu {
                                    field: "Implementation-version-name",
                                })?;
                        user_variables.push(UserVariableItem::ImplementationVersionName(
                            name.trim().to_string(),
                        ));
                    }
                    _ => {
                        warn!("unknown user information sub-item {:#04X}", sub_item_type);
                        user_variables.push(UserVariableItem::Unknown(
                            sub_item_type,
                            item.read_bytes(sub_item_length as usize)
                                .context(ReadPduFieldSnafu { field: "Unknown" })?,
                        ));
                    }
                }
            }

            Ok(PduVariableItem::UserVariables(user_variables))
        }
        _ => Ok(PduVariableItem::Unknown(item_type)),
    }
}

/// Read a UID-valued sub-item whose type code was already peeked.
fn read_uid_sub_item(stream: &mut ByteStream, field: &'static str) -> Result<String> {
    stream
        .advance(1)
        .context(ReadPduFieldSnafu { field: "Item-type" })?;
    stream.advance(1).context(ReadReservedSnafu { bytes: 1usize })?;
    let length = stream.read_u16().context(ReadPduFieldSnafu {
        field: "Item-length",
    })?;
    let value = stream
        .read_ascii(length as usize)
        .context(ReadPduFieldSnafu { field })?;
    Ok(trim_uid(&value))
}

/// Strip the trailing padding of a UID string.
fn trim_uid(uid: &str) -> String {
    uid.trim_end_matches(['\0', ' ']).to_string()
}
