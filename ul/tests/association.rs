use pacslink_ul::association::client::{self, ClientAssociationOptions};
use pacslink_ul::association::server::ServerAssociationOptions;
use pacslink_ul::pdu::{
    PDataValue, PDataValueType, Pdu, PresentationContextResult, PresentationContextResultReason,
};
use std::net::{SocketAddr, TcpListener};
use std::thread::{spawn, JoinHandle};

type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync + 'static>>;

static SCU_AE_TITLE: &str = "ECHO-SCU";
static SCP_AE_TITLE: &str = "ECHO-SCP";

static IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";
static EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";
static VERIFICATION_SOP_CLASS: &str = "1.2.840.10008.1.1";
static DIGITAL_MG_STORAGE_SOP_CLASS: &str = "1.2.840.10008.5.1.4.1.1.1.2";

fn spawn_scp() -> Result<(JoinHandle<Result<()>>, SocketAddr)> {
    let listener = TcpListener::bind("localhost:0")?;
    let addr = listener.local_addr()?;
    let scp = ServerAssociationOptions::new()
        .ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(VERIFICATION_SOP_CLASS);

    let h = spawn(move || -> Result<()> {
        let (stream, _addr) = listener.accept()?;
        let mut association = scp.establish(stream)?;

        assert_eq!(association.calling_ae_title(), SCU_AE_TITLE);
        assert_eq!(
            association.presentation_contexts(),
            &[
                PresentationContextResult {
                    id: 1,
                    reason: PresentationContextResultReason::Acceptance,
                    transfer_syntax: IMPLICIT_VR_LE.to_string(),
                },
                PresentationContextResult {
                    id: 3,
                    reason: PresentationContextResultReason::AbstractSyntaxNotSupported,
                    transfer_syntax: IMPLICIT_VR_LE.to_string(),
                }
            ],
        );

        // handle one release request
        let pdu = association.receive()?;
        assert_eq!(pdu, Pdu::ReleaseRQ);
        association.send(&Pdu::ReleaseRP)?;

        Ok(())
    });
    Ok((h, addr))
}

/// Run an SCP and an SCU concurrently,
/// negotiate an association and release it.
#[test]
fn scu_scp_association_test() {
    let (scp_handle, scp_addr) = spawn_scp().unwrap();

    let association = ClientAssociationOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .called_ae_title(SCP_AE_TITLE)
        .with_presentation_context(VERIFICATION_SOP_CLASS, vec![IMPLICIT_VR_LE, EXPLICIT_VR_LE])
        .with_presentation_context(
            DIGITAL_MG_STORAGE_SOP_CLASS,
            vec![IMPLICIT_VR_LE, EXPLICIT_VR_LE],
        )
        .establish(scp_addr)
        .unwrap();

    // one context of the two was accepted
    assert_eq!(association.presentation_contexts().len(), 1);
    assert_eq!(association.negotiated_contexts().len(), 2);
    assert!(!association.all_accepted());

    association
        .release()
        .expect("did not have a peaceful release");

    scp_handle
        .join()
        .expect("SCP panicked")
        .expect("error at the SCP");
}

/// A peer which accepts no presentation context:
/// the requester must not proceed to data transfer.
#[test]
fn no_accepted_presentation_contexts_is_an_error() {
    let listener = TcpListener::bind("localhost:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let scp = ServerAssociationOptions::new().ae_title(SCP_AE_TITLE);

    let scp_handle = spawn(move || -> Result<()> {
        let (stream, _addr) = listener.accept()?;
        // no abstract syntax configured: every proposal is rejected
        match scp.establish(stream) {
            Ok(mut association) => {
                // the requester gives up with an abort
                let pdu = association.receive()?;
                assert!(matches!(pdu, Pdu::AbortRQ { .. }));
                Ok(())
            }
            Err(e) => Err(Box::new(e) as _),
        }
    });

    let err = ClientAssociationOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .establish(addr)
        .unwrap_err();
    assert!(matches!(
        err,
        client::Error::NoAcceptedPresentationContexts { .. }
    ));

    scp_handle
        .join()
        .expect("SCP panicked")
        .expect("error at the SCP");
}

/// Exchange a P-Data message in both directions.
#[test]
fn p_data_exchange() {
    let listener = TcpListener::bind("localhost:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let scp = ServerAssociationOptions::new()
        .ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(VERIFICATION_SOP_CLASS);

    let scp_handle = spawn(move || -> Result<()> {
        let (stream, _addr) = listener.accept()?;
        let mut association = scp.establish(stream)?;

        let pdu = association.receive()?;
        let data = match pdu {
            Pdu::PData { data } => data,
            other => panic!("unexpected PDU {:?}", other),
        };
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].presentation_context_id, 1);
        assert_eq!(data[0].value_type, PDataValueType::Command);
        assert!(data[0].is_last);

        // send a canned response back
        association.send(&Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Command,
                is_last: true,
                data: vec![0x09; 32],
            }],
        })?;

        let pdu = association.receive()?;
        assert_eq!(pdu, Pdu::ReleaseRQ);
        association.send(&Pdu::ReleaseRP)?;
        Ok(())
    });

    let mut association = ClientAssociationOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .called_ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .establish(addr)
        .unwrap();

    association
        .send(&Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Command,
                is_last: true,
                data: vec![0x01; 16],
            }],
        })
        .unwrap();

    let response = association.receive().unwrap();
    match response {
        Pdu::PData { data } => {
            assert_eq!(data[0].data, vec![0x09; 32]);
        }
        other => panic!("unexpected PDU {:?}", other),
    }

    association.release().unwrap();

    scp_handle
        .join()
        .expect("SCP panicked")
        .expect("error at the SCP");
}
