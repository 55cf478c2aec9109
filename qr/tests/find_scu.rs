//! Query/Retrieve operations against a loopback SCP.
use std::net::{SocketAddr, TcpListener};
use std::thread::{spawn, JoinHandle};

use dicom_core::{dicom_value, DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::{tags, uids};
use dicom_object::{InMemDicomObject, StandardDataDictionary};
use dicom_transfer_syntax_registry::entries;

use pacslink_qr::{
    CancellationToken, ConnectionManager, Error, Peer, QueryParams, RetrieveOptions,
};
use pacslink_ul::association::server::ServerAssociationOptions;
use pacslink_ul::pdu::{PDataValue, PDataValueType, Pdu};

type TestResult = std::result::Result<(), Box<dyn std::error::Error + Send + Sync + 'static>>;

const PENDING: u16 = 0xFF00;
const SUCCESS: u16 = 0x0000;

fn find_rsp_command(status: u16, with_data: bool) -> InMemDicomObject<StandardDataDictionary> {
    let data_set_type: u16 = if with_data { 0x0001 } else { 0x0101 };
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            PrimitiveValue::from(uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND),
        ),
        // C-FIND-RSP
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [0x8020])),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            dicom_value!(U16, [1]),
        ),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [data_set_type]),
        ),
        DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [status])),
    ])
}

fn encode(obj: &InMemDicomObject) -> Vec<u8> {
    let mut data = Vec::new();
    obj.write_dataset_with_ts(&mut data, &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased())
        .expect("should encode dataset");
    data
}

fn study_row(study_instance_uid: &str, patient_id: &str) -> InMemDicomObject {
    InMemDicomObject::from_element_iter([
        DataElement::new(
            tags::QUERY_RETRIEVE_LEVEL,
            VR::CS,
            PrimitiveValue::from("STUDY"),
        ),
        DataElement::new(
            tags::STUDY_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from(study_instance_uid),
        ),
        DataElement::new(tags::PATIENT_ID, VR::LO, PrimitiveValue::from(patient_id)),
    ])
}

/// Serve one association which answers a C-FIND
/// with the given result rows and then a success status.
fn spawn_find_scp(rows: Vec<InMemDicomObject>) -> (JoinHandle<TestResult>, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let scp = ServerAssociationOptions::new()
        .ae_title("FIND-SCP")
        .with_abstract_syntax(uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND);

    let handle = spawn(move || -> TestResult {
        let (stream, _) = listener.accept()?;
        let mut association = scp.establish(stream)?;

        // the request: one P-Data with command and identifier fragments
        let pdu = association.receive()?;
        let data = match pdu {
            Pdu::PData { data } => data,
            other => panic!("unexpected PDU {:?}", other),
        };
        assert_eq!(data.len(), 2);
        assert_eq!(data[0].value_type, PDataValueType::Command);
        assert_eq!(data[1].value_type, PDataValueType::Data);

        // the identifier must carry the requested keys
        let identifier = InMemDicomObject::read_dataset_with_ts(
            &data[1].data[..],
            &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased(),
        )?;
        assert_eq!(
            identifier
                .get(tags::QUERY_RETRIEVE_LEVEL)
                .expect("query level must be present")
                .to_str()?,
            "STUDY"
        );

        let pc_id = data[0].presentation_context_id;
        for row in &rows {
            association.send(&Pdu::PData {
                data: vec![
                    PDataValue {
                        presentation_context_id: pc_id,
                        value_type: PDataValueType::Command,
                        is_last: true,
                        data: encode(&find_rsp_command(PENDING, true)),
                    },
                    PDataValue {
                        presentation_context_id: pc_id,
                        value_type: PDataValueType::Data,
                        is_last: true,
                        data: encode(row),
                    },
                ],
            })?;
        }
        association.send(&Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: pc_id,
                value_type: PDataValueType::Command,
                is_last: true,
                data: encode(&find_rsp_command(SUCCESS, false)),
            }],
        })?;

        // completion is the release exchange, not the last result
        let pdu = association.receive()?;
        assert_eq!(pdu, Pdu::ReleaseRQ);
        association.send(&Pdu::ReleaseRP)?;
        Ok(())
    });
    (handle, addr)
}

fn manager_for(addr: SocketAddr) -> ConnectionManager {
    let manager = ConnectionManager::new("QUERY-SCU");
    manager
        .add_peer(
            Peer::new("FIND-SCP", addr.ip().to_string(), addr.port()).default_peer(),
        )
        .unwrap();
    manager
}

#[test]
fn retrieve_studies_accumulates_rows_until_release() {
    let rows = vec![
        study_row("1.2.840.113619.2.1.1", "12345"),
        study_row("1.2.840.113619.2.1.2", "12345"),
    ];
    let (scp, addr) = spawn_find_scp(rows);

    let manager = manager_for(addr);
    let mut params = QueryParams::new();
    params.insert(tags::PATIENT_ID, "12345".to_string());

    let studies = manager
        .retrieve_studies(&params, &RetrieveOptions::default())
        .unwrap();

    assert_eq!(studies.len(), 2);
    assert_eq!(
        studies[0]
            .get(tags::STUDY_INSTANCE_UID)
            .unwrap()
            .to_str()
            .unwrap()
            .trim_end_matches('\0'),
        "1.2.840.113619.2.1.1"
    );

    // with the operation resolved, no association may be live
    assert!(manager.all_closed("FIND-SCP"));

    scp.join().expect("SCP panicked").expect("error at the SCP");
}

#[test]
fn rejected_negotiation_does_not_proceed_to_data_transfer() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    // an SCP which knows no abstract syntax rejects every context
    let scp = ServerAssociationOptions::new().ae_title("FIND-SCP");

    let scp_handle = spawn(move || -> TestResult {
        let (stream, _) = listener.accept()?;
        let mut association = scp.establish(stream)?;
        // the requester can only give up
        let pdu = association.receive()?;
        assert!(matches!(pdu, Pdu::AbortRQ { .. }));
        Ok(())
    });

    let manager = manager_for(addr);
    let err = manager
        .retrieve_studies(&QueryParams::new(), &RetrieveOptions::default())
        .unwrap_err();
    assert!(err.is_rejected());
    assert!(!err.is_timeout());

    scp_handle
        .join()
        .expect("SCP panicked")
        .expect("error at the SCP");
}

#[test]
fn cancellation_aborts_the_association() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let scp = ServerAssociationOptions::new()
        .ae_title("FIND-SCP")
        .with_abstract_syntax(uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND);

    let scp_handle = spawn(move || -> TestResult {
        let (stream, _) = listener.accept()?;
        let mut association = scp.establish(stream)?;
        // the query is sent, then the caller pulls the plug
        let pdu = association.receive()?;
        assert!(matches!(pdu, Pdu::PData { .. }));
        let pdu = association.receive()?;
        assert!(matches!(pdu, Pdu::AbortRQ { .. }));
        Ok(())
    });

    let manager = manager_for(addr);
    let token = CancellationToken::new();
    token.cancel();
    let options = RetrieveOptions {
        peer: None,
        cancellation: Some(token),
    };
    let err = manager
        .retrieve_studies(&QueryParams::new(), &options)
        .unwrap_err();
    assert!(err.is_cancelled());

    scp_handle
        .join()
        .expect("SCP panicked")
        .expect("error at the SCP");
}

fn echo_rsp_command() -> InMemDicomObject<StandardDataDictionary> {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            PrimitiveValue::from(uids::VERIFICATION),
        ),
        // C-ECHO-RSP
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [0x8030])),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            dicom_value!(U16, [1]),
        ),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [0x0101]),
        ),
        DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [0u16])),
    ])
}

#[test]
fn echo_against_a_loopback_scp() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let scp = ServerAssociationOptions::new()
        .ae_title("FIND-SCP")
        .with_abstract_syntax(uids::VERIFICATION);

    let scp_handle = spawn(move || -> TestResult {
        let (stream, _) = listener.accept()?;
        let mut association = scp.establish(stream)?;
        let pdu = association.receive()?;
        let pc_id = match pdu {
            Pdu::PData { data } => data[0].presentation_context_id,
            other => panic!("unexpected PDU {:?}", other),
        };
        association.send(&Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: pc_id,
                value_type: PDataValueType::Command,
                is_last: true,
                data: encode(&echo_rsp_command()),
            }],
        })?;
        let pdu = association.receive()?;
        assert_eq!(pdu, Pdu::ReleaseRQ);
        association.send(&Pdu::ReleaseRP)?;
        Ok(())
    });

    let manager = manager_for(addr);
    manager.echo(&RetrieveOptions::default()).unwrap();

    scp_handle
        .join()
        .expect("SCP panicked")
        .expect("error at the SCP");
}

#[test]
fn store_reports_unreadable_files_through_the_callback() {
    // no association is needed when no file can be opened
    let manager = ConnectionManager::new("STORE-SCU");
    let files = vec![
        std::path::PathBuf::from("/nonexistent/one.dcm"),
        std::path::PathBuf::from("/nonexistent/two.dcm"),
    ];
    let mut reported = Vec::new();
    manager
        .store_instances(&files, &RetrieveOptions::default(), |outcome, path| {
            assert!(outcome.is_err());
            reported.push(path.to_path_buf());
        })
        .unwrap();
    // one invocation per input file, in order
    assert_eq!(reported, files);
}

#[test]
fn failure_status_fails_the_operation() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let scp = ServerAssociationOptions::new()
        .ae_title("FIND-SCP")
        .with_abstract_syntax(uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND);

    let scp_handle = spawn(move || -> TestResult {
        let (stream, _) = listener.accept()?;
        let mut association = scp.establish(stream)?;
        let pdu = association.receive()?;
        let pc_id = match pdu {
            Pdu::PData { data } => data[0].presentation_context_id,
            other => panic!("unexpected PDU {:?}", other),
        };
        // refused: out of resources
        association.send(&Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: pc_id,
                value_type: PDataValueType::Command,
                is_last: true,
                data: encode(&find_rsp_command(0xA700, false)),
            }],
        })?;
        let pdu = association.receive()?;
        assert!(matches!(pdu, Pdu::AbortRQ { .. }));
        Ok(())
    });

    let manager = manager_for(addr);
    let err = manager
        .retrieve_studies(&QueryParams::new(), &RetrieveOptions::default())
        .unwrap_err();
    assert!(matches!(err, Error::OperationFailed { status: 0xA700, .. }));

    scp_handle
        .join()
        .expect("SCP panicked")
        .expect("error at the SCP");
}
