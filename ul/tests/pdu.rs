use matches::matches;
use pacslink_ul::pdu::reader::{read_pdu, Error};
use pacslink_ul::pdu::writer::write_pdu;
use pacslink_ul::pdu::{
    AbortServiceProviderReason, AbortSource, AssociationAC, AssociationRJ, AssociationRQ,
    PDataValue, PDataValueType, Pdu, PresentationContextProposed, PresentationContextResult,
    PresentationContextResultReason, RejectResult, RejectSource, UserVariableItem,
    DEFAULT_MAX_PDU,
};
use std::io::Cursor;

fn round_trip(pdu: &Pdu) -> Pdu {
    let mut bytes = Vec::new();
    write_pdu(&mut bytes, pdu).expect("should write PDU");
    read_pdu(&mut Cursor::new(&bytes), DEFAULT_MAX_PDU, true).expect("should read PDU back")
}

fn association_rq(
    presentation_contexts: Vec<PresentationContextProposed>,
) -> AssociationRQ {
    AssociationRQ {
        protocol_version: 1,
        calling_ae_title: "QUERY-SCU".to_string(),
        called_ae_title: "MAIN-PACS".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts,
        user_variables: vec![
            UserVariableItem::MaxLength(16384),
            UserVariableItem::ImplementationClassUID("1.2.826.0.1.3680043.9.9999".to_string()),
            UserVariableItem::ImplementationVersionName("PACSLINK-0.1.0".to_string()),
        ],
    }
}

#[test]
fn can_read_write_associate_rq_without_contexts() {
    let original = association_rq(vec![]);
    let result = round_trip(&original.clone().into());
    assert_eq!(result, Pdu::AssociationRQ(original));
}

#[test]
fn can_read_write_associate_rq_with_one_context() {
    let original = association_rq(vec![PresentationContextProposed {
        id: 1,
        abstract_syntax: "1.2.840.10008.5.1.4.1.2.2.1".to_string(),
        transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
    }]);
    let result = round_trip(&original.clone().into());
    assert_eq!(result, Pdu::AssociationRQ(original));
}

#[test]
fn can_read_write_associate_rq_with_many_contexts() {
    let original = association_rq(vec![
        PresentationContextProposed {
            id: 1,
            abstract_syntax: "1.2.840.10008.5.1.4.1.2.2.1".to_string(),
            transfer_syntaxes: vec![
                "1.2.840.10008.1.2".to_string(),
                "1.2.840.10008.1.2.1".to_string(),
            ],
        },
        PresentationContextProposed {
            id: 3,
            abstract_syntax: "1.2.840.10008.5.1.4.1.2.2.2".to_string(),
            transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
        },
        PresentationContextProposed {
            id: 5,
            abstract_syntax: "1.2.840.10008.1.1".to_string(),
            transfer_syntaxes: vec![
                "1.2.840.10008.1.2".to_string(),
                "1.2.840.10008.1.2.1".to_string(),
                "1.2.840.10008.1.2.4.50".to_string(),
            ],
        },
    ]);
    let result = round_trip(&original.clone().into());
    assert_eq!(result, Pdu::AssociationRQ(original));
}

#[test]
fn can_read_write_associate_ac() {
    let original = AssociationAC {
        protocol_version: 1,
        calling_ae_title: "QUERY-SCU".to_string(),
        called_ae_title: "MAIN-PACS".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![
            PresentationContextResult {
                id: 1,
                reason: PresentationContextResultReason::Acceptance,
                transfer_syntax: "1.2.840.10008.1.2".to_string(),
            },
            PresentationContextResult {
                id: 3,
                reason: PresentationContextResultReason::AbstractSyntaxNotSupported,
                transfer_syntax: "1.2.840.10008.1.2".to_string(),
            },
        ],
        user_variables: vec![UserVariableItem::MaxLength(32768)],
    };
    let result = round_trip(&original.clone().into());

    assert_eq!(result, Pdu::AssociationAC(original));
    if let Pdu::AssociationAC(ac) = result {
        // one rejection spoils full acceptance
        assert!(!ac.all_accepted());
        assert_eq!(ac.acceptor_max_pdu_length(), Some(32768));
    }
}

#[test]
fn can_read_write_associate_rj() {
    let original = AssociationRJ {
        result: RejectResult::Permanent,
        source: RejectSource::ServiceUser,
        reason: 7,
    };
    let result = round_trip(&original.clone().into());
    assert_eq!(result, Pdu::AssociationRJ(original));
}

#[test]
fn can_read_write_pdata() {
    // bit 0 (command/data) and bit 1 (last fragment) are independent
    for value_type in [PDataValueType::Command, PDataValueType::Data] {
        for is_last in [false, true] {
            let original = Pdu::PData {
                data: vec![PDataValue {
                    presentation_context_id: 3,
                    value_type,
                    is_last,
                    data: vec![0, 1, 2, 3],
                }],
            };
            assert_eq!(round_trip(&original), original);
        }
    }
}

#[test]
fn can_read_write_release_and_abort() {
    assert_eq!(round_trip(&Pdu::ReleaseRQ), Pdu::ReleaseRQ);
    assert_eq!(round_trip(&Pdu::ReleaseRP), Pdu::ReleaseRP);

    let abort = Pdu::AbortRQ {
        source: AbortSource::ServiceProvider(AbortServiceProviderReason::UnexpectedPdu),
    };
    assert_eq!(round_trip(&abort), abort);
}

#[test]
fn unrecognized_pdu_type_is_fatal() {
    // type code 0x7F, reserved byte, length 0
    let bytes = [0x7Fu8, 0x00, 0x00, 0x00, 0x00, 0x00];
    let err = read_pdu(&mut Cursor::new(&bytes), DEFAULT_MAX_PDU, true).unwrap_err();
    assert!(matches!(err, Error::UnrecognizedPduType { pdu_type: 0x7F, .. }));
}

#[test]
fn oversized_pdu_is_rejected_in_strict_mode() {
    let mut bytes = Vec::new();
    write_pdu(
        &mut bytes,
        &Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Data,
                is_last: true,
                data: vec![0u8; 8192],
            }],
        },
    )
    .unwrap();

    let err = read_pdu(&mut Cursor::new(&bytes), 4096, true).unwrap_err();
    assert!(matches!(err, Error::PduTooLarge { .. }));

    // permissive mode tolerates it up to the absolute maximum
    let pdu = read_pdu(&mut Cursor::new(&bytes), 4096, false).unwrap();
    assert!(matches!(pdu, Pdu::PData { .. }));
}
