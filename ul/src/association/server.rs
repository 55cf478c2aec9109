//! Association acceptor module
//!
//! The module provides an abstraction for a DICOM association
//! in which this application entity listens to incoming association requests.
//! See [`ServerAssociationOptions`]
//! for details and examples on how to create an association.
use std::{borrow::Cow, io::Write, net::TcpStream, time::Duration};

use snafu::{Backtrace, ResultExt, Snafu};

use crate::{
    pdu::{
        reader::{self, read_pdu},
        writer::write_pdu,
        AbortServiceProviderReason, AbortSource, AssociationAC, AssociationRJ, Pdu,
        PresentationContextResult, PresentationContextResultReason, RejectResult, RejectSource,
        DEFAULT_MAX_PDU, MAXIMUM_PDU_SIZE, PROTOCOL_VERSION,
    },
    IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME,
};

use super::uid::trim_uid;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// failed to receive association request
    ReceiveRequest {
        #[snafu(backtrace)]
        source: crate::pdu::reader::Error,
    },

    /// failed to send association response
    SendResponse {
        #[snafu(backtrace)]
        source: crate::pdu::writer::Error,
    },

    /// could not configure socket timeouts
    SetTimeout {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("operation timed out while {when}"))]
    Timeout {
        when: &'static str,
        backtrace: Backtrace,
    },

    #[snafu(display("unexpected PDU `{}` during negotiation", pdu.short_description()))]
    #[non_exhaustive]
    UnexpectedRequest {
        /// the PDU obtained from the node
        pdu: Box<Pdu>,
    },

    #[snafu(display("association rejected: {}", reason))]
    RejectedRequest {
        reason: &'static str,
        backtrace: Backtrace,
    },

    /// failed to send PDU message
    #[non_exhaustive]
    Send {
        #[snafu(backtrace)]
        source: crate::pdu::writer::Error,
    },

    /// failed to send PDU message on wire
    #[non_exhaustive]
    WireSend {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// failed to receive PDU message
    #[non_exhaustive]
    Receive {
        #[snafu(backtrace)]
        source: crate::pdu::reader::Error,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A DICOM association builder for an acceptor DICOM node,
/// often taking the role of a service class provider (SCP).
///
/// This is the standard way of negotiating and establishing
/// an association with a requesting node.
/// The outcome is a [`ServerAssociation`].
/// Unlike the client options,
/// a value of this type can be reused for multiple connections.
///
/// A proposed presentation context is accepted when
/// its abstract syntax is among the accepted abstract syntaxes
/// (or promiscuous mode is on)
/// and at least one of its transfer syntaxes is supported,
/// the first supported one being selected.
///
/// # Example
///
/// ```no_run
/// # use std::net::TcpListener;
/// # use pacslink_ul::association::server::ServerAssociationOptions;
/// # fn run() -> Result<(), Box<dyn std::error::Error>> {
/// # let tcp_listener: TcpListener = unimplemented!();
/// let scp_options = ServerAssociationOptions::new()
///     .ae_title("THIS-SCP")
///     .with_abstract_syntax("1.2.840.10008.1.1");
///
/// let (stream, _address) = tcp_listener.accept()?;
/// scp_options.establish(stream)?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ServerAssociationOptions<'a> {
    /// the AE title of this DICOM node
    ae_title: Cow<'a, str>,
    /// the application context name to accept
    application_context_name: Cow<'a, str>,
    /// the list of accepted abstract syntaxes
    abstract_syntax_uids: Vec<Cow<'a, str>>,
    /// the list of supported transfer syntaxes
    transfer_syntax_uids: Vec<Cow<'a, str>>,
    /// the expected protocol version
    protocol_version: u16,
    /// the maximum PDU length
    max_pdu_length: u32,
    /// whether to receive PDUs in strict mode
    strict: bool,
    /// whether to accept unknown abstract syntaxes
    promiscuous: bool,
    /// timeout for each socket read
    read_timeout: Option<Duration>,
}

impl Default for ServerAssociationOptions<'_> {
    fn default() -> Self {
        ServerAssociationOptions {
            ae_title: "THIS-SCP".into(),
            application_context_name: "1.2.840.10008.3.1.1.1".into(),
            abstract_syntax_uids: Vec::new(),
            transfer_syntax_uids: Vec::new(),
            protocol_version: PROTOCOL_VERSION,
            max_pdu_length: DEFAULT_MAX_PDU,
            strict: true,
            promiscuous: false,
            read_timeout: None,
        }
    }
}

impl<'a> ServerAssociationOptions<'a> {
    /// Create a new set of options for accepting an association.
    pub fn new() -> Self {
        Self::default()
    }

    /// Define the application entity title referring to this DICOM node.
    ///
    /// The default is `THIS-SCP`.
    pub fn ae_title<T>(mut self, ae_title: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.ae_title = ae_title.into();
        self
    }

    /// Include this abstract syntax
    /// in the list of accepted abstract syntaxes.
    pub fn with_abstract_syntax<T>(mut self, abstract_syntax_uid: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.abstract_syntax_uids
            .push(trim_uid(abstract_syntax_uid.into()));
        self
    }

    /// Include this transfer syntax
    /// in the list of supported transfer syntaxes.
    ///
    /// When no transfer syntax is explicitly indicated,
    /// Implicit and Explicit VR Little Endian are supported.
    pub fn with_transfer_syntax<T>(mut self, transfer_syntax_uid: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.transfer_syntax_uids
            .push(trim_uid(transfer_syntax_uid.into()));
        self
    }

    /// Override the maximum PDU length
    /// that this application entity will admit.
    pub fn max_pdu_length(mut self, value: u32) -> Self {
        self.max_pdu_length = value;
        self
    }

    /// Override strict mode:
    /// whether receiving PDUs must not
    /// surpass the negotiated maximum PDU length.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Accept presentation contexts with unknown abstract syntaxes,
    /// instead of rejecting them.
    pub fn promiscuous(mut self, promiscuous: bool) -> Self {
        self.promiscuous = promiscuous;
        self
    }

    /// Set an idle timeout for each socket read.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    /// Negotiate an association with the given TCP stream.
    pub fn establish(&self, mut socket: TcpStream) -> Result<ServerAssociation> {
        socket
            .set_read_timeout(self.read_timeout)
            .context(SetTimeoutSnafu)?;

        let mut buffer: Vec<u8> = Vec::with_capacity(self.max_pdu_length as usize);

        let msg = read_pdu(&mut socket, MAXIMUM_PDU_SIZE, self.strict)
            .map_err(|e| receive_error(e, "receiving the association request"))?;

        let rq = match msg {
            Pdu::AssociationRQ(rq) => rq,
            pdu @ Pdu::AbortRQ { .. } => {
                return UnexpectedRequestSnafu { pdu }.fail();
            }
            pdu => {
                // not a negotiation: abort the connection
                let _ = write_pdu(
                    &mut buffer,
                    &Pdu::AbortRQ {
                        source: AbortSource::ServiceProvider(
                            AbortServiceProviderReason::UnexpectedPdu,
                        ),
                    },
                );
                let _ = socket.write_all(&buffer);
                return UnexpectedRequestSnafu { pdu }.fail();
            }
        };

        // only protocol version 1 exists;
        // the receiver tests that its bit is set
        if rq.protocol_version & self.protocol_version == 0 {
            reject(
                &mut socket,
                &mut buffer,
                RejectSource::ServiceProviderAcse,
                // protocol-version-not-supported
                2,
            )?;
            return RejectedRequestSnafu {
                reason: "protocol version not supported",
            }
            .fail();
        }

        if rq.application_context_name != self.application_context_name {
            reject(
                &mut socket,
                &mut buffer,
                RejectSource::ServiceUser,
                // application-context-name-not-supported
                2,
            )?;
            return RejectedRequestSnafu {
                reason: "application context name not supported",
            }
            .fail();
        }

        let presentation_contexts: Vec<_> = rq
            .presentation_contexts
            .iter()
            .map(|pc| self.negotiate_presentation_context(pc))
            .collect();

        let response = Pdu::AssociationAC(AssociationAC {
            protocol_version: self.protocol_version,
            called_ae_title: rq.called_ae_title.clone(),
            calling_ae_title: rq.calling_ae_title.clone(),
            application_context_name: rq.application_context_name.clone(),
            presentation_contexts: presentation_contexts.clone(),
            user_variables: vec![
                crate::pdu::UserVariableItem::MaxLength(self.max_pdu_length),
                crate::pdu::UserVariableItem::ImplementationClassUID(
                    IMPLEMENTATION_CLASS_UID.to_string(),
                ),
                crate::pdu::UserVariableItem::ImplementationVersionName(
                    IMPLEMENTATION_VERSION_NAME.to_string(),
                ),
            ],
        });

        buffer.clear();
        write_pdu(&mut buffer, &response).context(SendResponseSnafu)?;
        socket.write_all(&buffer).context(WireSendSnafu)?;
        buffer.clear();

        // requester's maximum, absent item falls back to the default
        let requestor_max_pdu_length = rq
            .user_variables
            .iter()
            .find_map(|item| match item {
                crate::pdu::UserVariableItem::MaxLength(len) => Some(*len),
                _ => None,
            })
            .unwrap_or(DEFAULT_MAX_PDU);

        Ok(ServerAssociation {
            presentation_contexts,
            requestor_max_pdu_length,
            acceptor_max_pdu_length: self.max_pdu_length,
            calling_ae_title: rq.calling_ae_title,
            called_ae_title: rq.called_ae_title,
            socket,
            buffer,
            strict: self.strict,
        })
    }

    /// The transfer syntaxes this acceptor supports:
    /// the explicitly indicated ones,
    /// or the uncompressed little endian pair by default.
    fn supported_transfer_syntaxes(&self) -> Vec<&str> {
        if self.transfer_syntax_uids.is_empty() {
            vec!["1.2.840.10008.1.2", "1.2.840.10008.1.2.1"]
        } else {
            self.transfer_syntax_uids
                .iter()
                .map(|uid| uid.as_ref())
                .collect()
        }
    }

    fn negotiate_presentation_context(
        &self,
        proposed: &crate::pdu::PresentationContextProposed,
    ) -> PresentationContextResult {
        let supported = self.supported_transfer_syntaxes();
        // the transfer syntax field is not significant on rejection,
        // but the item must still carry a syntactically valid one
        let fallback_transfer_syntax = || supported[0].to_string();

        let known_abstract_syntax = self
            .abstract_syntax_uids
            .iter()
            .any(|uid| uid == &proposed.abstract_syntax);
        if !known_abstract_syntax && !self.promiscuous {
            return PresentationContextResult {
                id: proposed.id,
                reason: PresentationContextResultReason::AbstractSyntaxNotSupported,
                transfer_syntax: fallback_transfer_syntax(),
            };
        }

        match proposed
            .transfer_syntaxes
            .iter()
            .find(|ts| supported.contains(&ts.as_str()))
        {
            Some(ts) => PresentationContextResult {
                id: proposed.id,
                reason: PresentationContextResultReason::Acceptance,
                transfer_syntax: ts.to_string(),
            },
            None => PresentationContextResult {
                id: proposed.id,
                reason: PresentationContextResultReason::TransferSyntaxesNotSupported,
                transfer_syntax: fallback_transfer_syntax(),
            },
        }
    }
}

fn reject(
    socket: &mut TcpStream,
    buffer: &mut Vec<u8>,
    source: RejectSource,
    reason: u8,
) -> Result<()> {
    buffer.clear();
    write_pdu(
        buffer,
        &Pdu::AssociationRJ(AssociationRJ {
            result: RejectResult::Permanent,
            source,
            reason,
        }),
    )
    .context(SendResponseSnafu)?;
    socket.write_all(buffer).context(WireSendSnafu)
}

fn receive_error(e: reader::Error, when: &'static str) -> Error {
    if reader::is_timeout(&e) {
        TimeoutSnafu { when }.build()
    } else {
        Error::ReceiveRequest { source: e }
    }
}

/// A DICOM upper level association from the perspective
/// of an accepting application entity.
#[derive(Debug)]
pub struct ServerAssociation {
    /// The negotiated presentation contexts, rejected ones included.
    presentation_contexts: Vec<PresentationContextResult>,
    /// The maximum PDU length that the requesting node accepts
    requestor_max_pdu_length: u32,
    /// The maximum PDU length that this node is expecting to receive
    acceptor_max_pdu_length: u32,
    /// The AE title of the requesting node
    calling_ae_title: String,
    /// The AE title the requester addressed
    called_ae_title: String,
    /// The TCP stream to the other DICOM node
    socket: TcpStream,
    /// Buffer to assemble PDUs before sending them on the wire
    buffer: Vec<u8>,
    /// whether to receive PDUs in strict mode
    strict: bool,
}

impl ServerAssociation {
    /// Retrieve the negotiated presentation contexts.
    pub fn presentation_contexts(&self) -> &[PresentationContextResult] {
        &self.presentation_contexts
    }

    /// The AE title of the requesting node.
    pub fn calling_ae_title(&self) -> &str {
        &self.calling_ae_title
    }

    /// The AE title the requester addressed.
    pub fn called_ae_title(&self) -> &str {
        &self.called_ae_title
    }

    /// Send a PDU message to the other intervenient.
    pub fn send(&mut self, msg: &Pdu) -> Result<()> {
        self.buffer.clear();
        write_pdu(&mut self.buffer, msg).context(SendSnafu)?;
        self.socket.write_all(&self.buffer).context(WireSendSnafu)
    }

    /// Read a PDU message from the other intervenient.
    pub fn receive(&mut self) -> Result<Pdu> {
        read_pdu(&mut self.socket, self.acceptor_max_pdu_length, self.strict)
            .map_err(|e| receive_error(e, "receiving a PDU"))
    }

    /// Send an abort message and shut down the TCP connection,
    /// terminating the association.
    pub fn abort(mut self) -> Result<()> {
        let out = self.send(&Pdu::AbortRQ {
            source: AbortSource::ServiceProvider(AbortServiceProviderReason::ReasonNotSpecified),
        });
        let _ = self.socket.shutdown(std::net::Shutdown::Both);
        out
    }

    /// The maximum PDU length this node admits.
    pub fn acceptor_max_pdu_length(&self) -> u32 {
        self.acceptor_max_pdu_length
    }

    /// Prepare a P-Data writer for sending one or more data items.
    pub fn send_pdata(
        &mut self,
        presentation_context_id: u8,
    ) -> super::pdata::PDataWriter<&mut TcpStream> {
        super::pdata::PDataWriter::new(
            &mut self.socket,
            presentation_context_id,
            self.requestor_max_pdu_length,
        )
    }

    /// Prepare a P-Data reader for receiving one or more data item PDUs.
    pub fn receive_pdata(&mut self) -> super::pdata::PDataReader<&mut TcpStream> {
        super::pdata::PDataReader::new(&mut self.socket, self.acceptor_max_pdu_length)
    }
}
