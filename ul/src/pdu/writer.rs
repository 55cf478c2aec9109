//! PDU writer module
//!
//! Serialization goes through field lists:
//! every PDU produces the list of leaf fields making up its payload,
//! the summed field widths become the length field,
//! and the fixed wire layout
//! (type code, reserved byte, length, payload)
//! is prepended ahead of it.
//! Nested items follow the same convention with a 2-byte length field.
use snafu::{ensure, Backtrace, ResultExt, Snafu};
use std::io::Write;

use crate::field::{wire_len, Field};
use crate::pdu::*;
use crate::stream::ByteStream;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("could not serialize {name} structure"))]
    Serialize {
        /// the name of the PDU structure
        name: &'static str,
        #[snafu(backtrace)]
        source: crate::field::Error,
    },

    #[snafu(display("item payload of {length} bytes exceeds its 2-byte length field"))]
    ItemTooLong { length: usize, backtrace: Backtrace },

    #[snafu(display("PDU payload of {length} bytes exceeds its 4-byte length field"))]
    PduTooLong { length: usize, backtrace: Backtrace },

    #[snafu(display("could not write PDU bytes"))]
    WriteData {
        source: std::io::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Serialize a PDU onto the given writer.
pub fn write_pdu<W>(writer: &mut W, pdu: &Pdu) -> Result<()>
where
    W: Write,
{
    writer
        .write_all(&pdu_to_bytes(pdu)?)
        .context(WriteDataSnafu)
}

/// Serialize a PDU to a fresh buffer and return its written bytes.
pub fn pdu_to_bytes(pdu: &Pdu) -> Result<Vec<u8>> {
    let name = pdu_name(pdu);
    let (pdu_type, payload) = pdu_fields(pdu)?;
    let length = wire_len(&payload);
    ensure!(length <= u32::MAX as usize, PduTooLongSnafu { length });

    // fixed wire layout: type, reserved, length, payload
    let mut stream = ByteStream::big_endian();
    let mut fields = vec![
        Field::U8(pdu_type),
        Field::reserved(),
        Field::U32(length as u32),
    ];
    fields.extend(payload);
    for field in &fields {
        field.write_to(&mut stream).context(SerializeSnafu { name })?;
    }
    Ok(stream.into_bytes())
}

fn pdu_name(pdu: &Pdu) -> &'static str {
    match pdu {
        Pdu::AssociationRQ(_) => "A-ASSOCIATE-RQ",
        Pdu::AssociationAC(_) => "A-ASSOCIATE-AC",
        Pdu::AssociationRJ(_) => "A-ASSOCIATE-RJ",
        Pdu::PData { .. } => "P-DATA-TF",
        Pdu::ReleaseRQ => "A-RELEASE-RQ",
        Pdu::ReleaseRP => "A-RELEASE-RP",
        Pdu::AbortRQ { .. } => "A-ABORT",
    }
}

/// The wire type code and payload field list of a PDU.
fn pdu_fields(pdu: &Pdu) -> Result<(u8, Vec<Field>)> {
    match pdu {
        Pdu::AssociationRQ(rq) => {
            let mut fields = association_common_fields(
                rq.protocol_version,
                &rq.called_ae_title,
                &rq.calling_ae_title,
                &rq.application_context_name,
            )?;
            for presentation_context in &rq.presentation_contexts {
                fields.extend(presentation_context_proposed_fields(presentation_context)?);
            }
            fields.extend(user_information_fields(&rq.user_variables)?);
            Ok((codes::ASSOCIATION_RQ, fields))
        }
        Pdu::AssociationAC(ac) => {
            let mut fields = association_common_fields(
                ac.protocol_version,
                &ac.called_ae_title,
                &ac.calling_ae_title,
                &ac.application_context_name,
            )?;
            for presentation_context in &ac.presentation_contexts {
                fields.extend(presentation_context_result_fields(presentation_context)?);
            }
            fields.extend(user_information_fields(&ac.user_variables)?);
            Ok((codes::ASSOCIATION_AC, fields))
        }
        Pdu::AssociationRJ(rj) => Ok((
            codes::ASSOCIATION_RJ,
            vec![
                Field::reserved(),
                Field::U8(rj.result.code()),
                Field::U8(rj.source.code()),
                Field::U8(rj.reason),
            ],
        )),
        Pdu::PData { data } => Ok((codes::P_DATA_TF, p_data_fields(data)?)),
        Pdu::ReleaseRQ => Ok((codes::RELEASE_RQ, vec![Field::Reserved(4)])),
        Pdu::ReleaseRP => Ok((codes::RELEASE_RP, vec![Field::Reserved(4)])),
        Pdu::AbortRQ { source } => {
            let (source_code, reason_code) = source.codes();
            Ok((
                codes::ABORT_RQ,
                vec![
                    Field::Reserved(2),
                    Field::U8(source_code),
                    Field::U8(reason_code),
                ],
            ))
        }
    }
}

/// The fixed prefix shared by A-ASSOCIATE-RQ and A-ASSOCIATE-AC:
/// protocol version, two reserved bytes,
/// the two 16-byte space-padded AE titles,
/// and the 32-byte reserved run,
/// followed by the application context item.
fn association_common_fields(
    protocol_version: u16,
    called_ae_title: &str,
    calling_ae_title: &str,
    application_context_name: &str,
) -> Result<Vec<Field>> {
    let mut fields = vec![
        Field::U16(protocol_version),
        Field::Reserved(2),
        Field::Filled {
            value: called_ae_title.to_string(),
            width: 16,
        },
        Field::Filled {
            value: calling_ae_title.to_string(),
            width: 16,
        },
        Field::Reserved(32),
    ];
    fields.extend(item(
        codes::APPLICATION_CONTEXT,
        vec![Field::Ascii(application_context_name.to_string())],
    )?);
    Ok(fields)
}

fn presentation_context_proposed_fields(
    presentation_context: &PresentationContextProposed,
) -> Result<Vec<Field>> {
    let mut payload = vec![Field::U8(presentation_context.id), Field::Reserved(3)];
    payload.extend(item(
        codes::ABSTRACT_SYNTAX,
        vec![Field::Ascii(presentation_context.abstract_syntax.clone())],
    )?);
    for transfer_syntax in &presentation_context.transfer_syntaxes {
        payload.extend(item(
            codes::TRANSFER_SYNTAX,
            vec![Field::Ascii(transfer_syntax.clone())],
        )?);
    }
    item(codes::PRESENTATION_CONTEXT_RQ, payload)
}

fn presentation_context_result_fields(
    presentation_context: &PresentationContextResult,
) -> Result<Vec<Field>> {
    let mut payload = vec![
        Field::U8(presentation_context.id),
        Field::reserved(),
        Field::U8(presentation_context.reason.code()),
        Field::reserved(),
    ];
    payload.extend(item(
        codes::TRANSFER_SYNTAX,
        vec![Field::Ascii(presentation_context.transfer_syntax.clone())],
    )?);
    item(codes::PRESENTATION_CONTEXT_AC, payload)
}

fn user_information_fields(user_variables: &[UserVariableItem]) -> Result<Vec<Field>> {
    if user_variables.is_empty() {
        return Ok(vec![]);
    }

    let mut payload = Vec::new();
    for user_variable in user_variables {
        match user_variable {
            UserVariableItem::MaxLength(max_length) => {
                payload.extend(item(codes::MAXIMUM_LENGTH, vec![Field::U32(*max_length)])?);
            }
            UserVariableItem::ImplementationClassUID(uid) => {
                payload.extend(item(
                    codes::IMPLEMENTATION_CLASS_UID,
                    vec![Field::Ascii(uid.clone())],
                )?);
            }
            UserVariableItem::ImplementationVersionName(name) => {
                payload.extend(item(
                    codes::IMPLEMENTATION_VERSION_NAME,
                    vec![Field::Ascii(name.clone())],
                )?);
            }
            UserVariableItem::Unknown(item_type, data) => {
                payload.extend(item(*item_type, vec![Field::Bytes(data.clone())])?);
            }
        }
    }
    item(codes::USER_INFORMATION, payload)
}

fn p_data_fields(data: &[PDataValue]) -> Result<Vec<Field>> {
    let mut fields = Vec::new();
    for presentation_data_value in data {
        // message control header:
        // bit 0 distinguishes command from data set fragments,
        // bit 1 marks the last fragment of the message;
        // the two bits are independent
        let mut message_header = 0x00u8;
        if presentation_data_value.value_type == PDataValueType::Command {
            message_header |= 0x01;
        }
        if presentation_data_value.is_last {
            message_header |= 0x02;
        }

        // the PDV length covers the context ID,
        // the message control header and the fragment bytes
        let length = presentation_data_value.data.len() + 2;
        ensure!(length <= u32::MAX as usize, PduTooLongSnafu { length });
        fields.push(Field::U32(length as u32));
        fields.push(Field::U8(presentation_data_value.presentation_context_id));
        fields.push(Field::U8(message_header));
        fields.push(Field::Bytes(presentation_data_value.data.clone()));
    }
    Ok(fields)
}

/// Wrap an item payload in the nested item layout:
/// type code, reserved byte, 2-byte length, payload.
fn item(item_type: u8, payload: Vec<Field>) -> Result<Vec<Field>> {
    let length = wire_len(&payload);
    ensure!(length <= u16::MAX as usize, ItemTooLongSnafu { length });

    let mut fields = Vec::with_capacity(payload.len() + 3);
    fields.push(Field::U8(item_type));
    fields.push(Field::reserved());
    fields.push(Field::U16(length as u16));
    fields.extend(payload);
    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteordered::byteorder::{BigEndian, ByteOrder};

    #[test]
    fn release_rq_wire_layout() {
        let bytes = pdu_to_bytes(&Pdu::ReleaseRQ).unwrap();
        assert_eq!(bytes, &[0x05, 0x00, 0x00, 0x00, 0x00, 0x04, 0, 0, 0, 0]);
    }

    #[test]
    fn abort_wire_layout() {
        let bytes = pdu_to_bytes(&Pdu::AbortRQ {
            source: AbortSource::ServiceProvider(AbortServiceProviderReason::UnexpectedPdu),
        })
        .unwrap();
        assert_eq!(bytes, &[0x07, 0x00, 0x00, 0x00, 0x00, 0x04, 0, 0, 2, 2]);
    }

    #[test]
    fn p_data_wire_layout() {
        let bytes = pdu_to_bytes(&Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Command,
                is_last: true,
                data: vec![0xAA, 0xBB],
            }],
        })
        .unwrap();
        assert_eq!(
            bytes,
            &[
                0x04, 0x00, 0x00, 0x00, 0x00, 0x08, // PDU header
                0x00, 0x00, 0x00, 0x04, // PDV item length
                0x01, // presentation context ID
                0x03, // command + last fragment
                0xAA, 0xBB,
            ]
        );
    }

    #[test]
    fn length_field_covers_everything_after_it() {
        let pdu = Pdu::AssociationRQ(AssociationRQ {
            protocol_version: 1,
            calling_ae_title: "QUERY-SCU".to_string(),
            called_ae_title: "MAIN-PACS".to_string(),
            application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
            presentation_contexts: vec![PresentationContextProposed {
                id: 1,
                abstract_syntax: "1.2.840.10008.5.1.4.1.2.2.1".to_string(),
                transfer_syntaxes: vec![
                    "1.2.840.10008.1.2".to_string(),
                    "1.2.840.10008.1.2.1".to_string(),
                ],
            }],
            user_variables: vec![UserVariableItem::MaxLength(16384)],
        });
        let bytes = pdu_to_bytes(&pdu).unwrap();
        let declared = BigEndian::read_u32(&bytes[2..6]);
        assert_eq!(declared as usize, bytes.len() - 6);
    }

    #[test]
    fn overlong_ae_title_is_a_length_mismatch() {
        let pdu = Pdu::AssociationRQ(AssociationRQ {
            protocol_version: 1,
            calling_ae_title: "A-MUCH-TOO-LONG-AE-TITLE".to_string(),
            called_ae_title: "MAIN-PACS".to_string(),
            application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
            presentation_contexts: vec![],
            user_variables: vec![],
        });
        assert!(matches!(
            pdu_to_bytes(&pdu),
            Err(Error::Serialize { .. })
        ));
    }
}
