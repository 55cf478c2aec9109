//! Association requester module
//!
//! The module provides an abstraction for a DICOM association
//! in which this application entity is the one requesting the association.
//! See [`ClientAssociationOptions`]
//! for details and examples on how to create an association.
use std::{
    borrow::Cow,
    convert::TryInto,
    io::Write,
    net::{TcpStream, ToSocketAddrs},
    time::Duration,
};

use snafu::{ensure, Backtrace, ResultExt, Snafu};

use crate::{
    pdu::{
        reader::{self, read_pdu},
        writer::write_pdu,
        AbortSource, AssociationRJ, AssociationRQ, Pdu, PresentationContextProposed,
        PresentationContextResult, DEFAULT_MAX_PDU, MAXIMUM_PDU_SIZE, PROTOCOL_VERSION,
    },
    AeAddr, IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME,
};

use super::{
    pdata::{PDataReader, PDataWriter},
    uid::trim_uid,
};
use crate::pdu::UserVariableItem;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// at least one presentation context must be specified
    MissingPresentationContexts { backtrace: Backtrace },

    /// could not resolve the target address
    Resolve {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// the target address resolved to no usable socket address
    NoAddress { backtrace: Backtrace },

    /// could not connect to server
    Connect {
        source: std::io::Error,
        backtrace: Backtrace,
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

    /// failed to send association request
    SendRequest {
        #[snafu(backtrace)]
        source: crate::pdu::writer::Error,
    },

    /// failed to receive association response
    ReceiveResponse {
        #[snafu(backtrace)]
        source: crate::pdu::reader::Error,
    },

    #[snafu(display("unexpected response from server `{}`", pdu.short_description()))]
    #[non_exhaustive]
    UnexpectedResponse {
        /// the PDU obtained from the server
        pdu: Box<Pdu>,
    },

    #[snafu(display("protocol version mismatch: expected {expected}, got {got}"))]
    ProtocolVersionMismatch {
        expected: u16,
        got: u16,
        backtrace: Backtrace,
    },

    #[snafu(display("association rejected by the server: {association_rj}"))]
    Rejected {
        association_rj: AssociationRJ,
        backtrace: Backtrace,
    },

    #[snafu(display("association aborted by the peer: {reason}"))]
    PeerAborted {
        reason: AbortSource,
        backtrace: Backtrace,
    },

    /// no presentation contexts accepted by the server
    NoAcceptedPresentationContexts { backtrace: Backtrace },

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

    #[snafu(display("PDU of {length} bytes is too large to be sent to the remote node"))]
    #[non_exhaustive]
    SendTooLongPdu { length: usize, backtrace: Backtrace },

    /// failed to receive PDU message
    #[non_exhaustive]
    Receive {
        #[snafu(backtrace)]
        source: crate::pdu::reader::Error,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A DICOM association builder for a client node.
/// The final outcome is a [`ClientAssociation`].
///
/// This is the standard way of requesting and establishing
/// an association with another DICOM node,
/// that one usually taking the role of a service class provider (SCP).
///
/// At least one presentation context must be specified,
/// using the method [`with_presentation_context`](Self::with_presentation_context)
/// with both an abstract syntax and a list of transfer syntaxes,
/// or through the helper [`with_abstract_syntax`](Self::with_abstract_syntax),
/// which proposes the default transfer syntaxes
/// _Implicit VR Little Endian_ and _Explicit VR Little Endian_.
///
/// # Example
///
/// ```no_run
/// # use pacslink_ul::association::client::ClientAssociationOptions;
/// # fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let association = ClientAssociationOptions::new()
///     .with_abstract_syntax("1.2.840.10008.1.1")
///     .calling_ae_title("QUERY-SCU")
///     .called_ae_title("MAIN-PACS")
///     .establish("192.168.0.5:104")?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ClientAssociationOptions<'a> {
    /// the calling AE title
    calling_ae_title: Cow<'a, str>,
    /// the called AE title, if fixed ahead of the address
    called_ae_title: Option<Cow<'a, str>>,
    /// the requested application context name
    application_context_name: Cow<'a, str>,
    /// the list of proposed presentation contexts
    presentation_contexts: Vec<(Cow<'a, str>, Vec<Cow<'a, str>>)>,
    /// the expected protocol version
    protocol_version: u16,
    /// the maximum PDU length requested for receiving PDUs
    max_pdu_length: u32,
    /// whether to receive PDUs in strict mode
    strict: bool,
    /// timeout for the TCP connect
    connect_timeout: Option<Duration>,
    /// timeout for each socket read
    read_timeout: Option<Duration>,
}

impl Default for ClientAssociationOptions<'_> {
    fn default() -> Self {
        ClientAssociationOptions {
            calling_ae_title: "THIS-SCU".into(),
            called_ae_title: None,
            application_context_name: "1.2.840.10008.3.1.1.1".into(),
            presentation_contexts: Vec::new(),
            protocol_version: PROTOCOL_VERSION,
            max_pdu_length: DEFAULT_MAX_PDU,
            strict: true,
            connect_timeout: None,
            read_timeout: None,
        }
    }
}

impl<'a> ClientAssociationOptions<'a> {
    /// Create a new set of options for establishing an association.
    pub fn new() -> Self {
        Self::default()
    }

    /// Define the calling application entity title for the association,
    /// which refers to this DICOM node.
    ///
    /// The default is `THIS-SCU`.
    pub fn calling_ae_title<T>(mut self, calling_ae_title: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.calling_ae_title = calling_ae_title.into();
        self
    }

    /// Define the called application entity title for the association,
    /// which refers to the target DICOM node.
    ///
    /// The default is `ANY-SCP`.
    /// Passing an empty string resets the AE title to the default
    /// (or to the one in the address passed to
    /// [`establish_with`](Self::establish_with)).
    pub fn called_ae_title<T>(mut self, called_ae_title: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        let cae = called_ae_title.into();
        if cae.is_empty() {
            self.called_ae_title = None;
        } else {
            self.called_ae_title = Some(cae);
        }
        self
    }

    /// Include this presentation context
    /// in the list of proposed presentation contexts.
    pub fn with_presentation_context<T>(
        mut self,
        abstract_syntax_uid: T,
        transfer_syntax_uids: Vec<T>,
    ) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        let transfer_syntaxes: Vec<Cow<'a, str>> = transfer_syntax_uids
            .into_iter()
            .map(|uid| trim_uid(uid.into()))
            .collect();
        self.presentation_contexts
            .push((trim_uid(abstract_syntax_uid.into()), transfer_syntaxes));
        self
    }

    /// Helper to add this abstract syntax
    /// with the default transfer syntaxes
    /// to the list of proposed presentation contexts.
    pub fn with_abstract_syntax<T>(self, abstract_syntax_uid: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        let default_transfer_syntaxes: Vec<Cow<'a, str>> =
            vec!["1.2.840.10008.1.2.1".into(), "1.2.840.10008.1.2".into()];
        self.with_presentation_context(abstract_syntax_uid.into(), default_transfer_syntaxes)
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

    /// Set a timeout for establishing the TCP connection.
    ///
    /// Expiry surfaces as a [`Timeout`](Error::Timeout) error.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Set an idle timeout for each socket read.
    ///
    /// Expiry surfaces as a [`Timeout`](Error::Timeout) error.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    /// Initiate the TCP connection to the given address
    /// and request a new DICOM association,
    /// negotiating the presentation contexts in the process.
    pub fn establish<A: ToSocketAddrs>(self, address: A) -> Result<ClientAssociation> {
        self.establish_impl(AeAddr::new_socket_addr(address))
    }

    /// Initiate the TCP connection to the given address
    /// and request a new DICOM association,
    /// negotiating the presentation contexts in the process.
    ///
    /// The address may carry the called AE title
    /// with the syntax `«ae_title»@«host»:«port»`,
    /// although an explicit `called_ae_title` option takes precedence.
    pub fn establish_with(self, ae_address: &str) -> Result<ClientAssociation> {
        match ae_address.try_into() {
            Ok(ae_address) => self.establish_impl(ae_address),
            Err(_) => self.establish_impl(AeAddr::new_socket_addr(ae_address)),
        }
    }

    fn establish_impl<T>(self, ae_address: AeAddr<T>) -> Result<ClientAssociation>
    where
        T: ToSocketAddrs,
    {
        let ClientAssociationOptions {
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts,
            protocol_version,
            max_pdu_length,
            strict,
            connect_timeout,
            read_timeout,
        } = self;

        // presentation contexts represent the requester's intent,
        // they must not be omitted
        ensure!(
            !presentation_contexts.is_empty(),
            MissingPresentationContextsSnafu
        );

        let called_ae_title: &str = match (&called_ae_title, ae_address.ae_title()) {
            (Some(aec), Some(_)) => {
                tracing::warn!(
                    "option `called_ae_title` overrides the AE title in the address to `{}`",
                    aec
                );
                aec
            }
            (Some(aec), None) => aec,
            (None, Some(aec)) => aec,
            (None, None) => "ANY-SCP",
        };

        let presentation_contexts: Vec<_> = presentation_contexts
            .into_iter()
            .enumerate()
            .map(|(i, presentation_context)| PresentationContextProposed {
                // presentation context IDs are odd integers
                id: (i * 2 + 1) as u8,
                abstract_syntax: presentation_context.0.to_string(),
                transfer_syntaxes: presentation_context
                    .1
                    .iter()
                    .map(|uid| uid.to_string())
                    .collect(),
            })
            .collect();

        let msg = Pdu::AssociationRQ(AssociationRQ {
            protocol_version,
            calling_ae_title: calling_ae_title.to_string(),
            called_ae_title: called_ae_title.to_string(),
            application_context_name: application_context_name.to_string(),
            presentation_contexts,
            user_variables: vec![
                UserVariableItem::MaxLength(max_pdu_length),
                UserVariableItem::ImplementationClassUID(IMPLEMENTATION_CLASS_UID.to_string()),
                UserVariableItem::ImplementationVersionName(
                    IMPLEMENTATION_VERSION_NAME.to_string(),
                ),
            ],
        });

        let mut socket = connect(&ae_address, connect_timeout)?;
        socket.set_read_timeout(read_timeout).context(SetTimeoutSnafu)?;

        let mut buffer: Vec<u8> = Vec::with_capacity(max_pdu_length as usize);

        // send request
        write_pdu(&mut buffer, &msg).context(SendRequestSnafu)?;
        socket.write_all(&buffer).context(WireSendSnafu)?;
        buffer.clear();

        // receive response
        let msg = read_pdu(&mut socket, MAXIMUM_PDU_SIZE, strict)
            .map_err(receive_response_error)?;

        match msg {
            Pdu::AssociationAC(ac) => {
                ensure!(
                    ac.protocol_version == protocol_version,
                    ProtocolVersionMismatchSnafu {
                        expected: protocol_version,
                        got: ac.protocol_version,
                    }
                );

                // treat 0 as the maximum size admitted by the standard;
                // absence of the item falls back to the protocol default
                let acceptor_max_pdu_length = match ac.acceptor_max_pdu_length() {
                    Some(0) => MAXIMUM_PDU_SIZE,
                    Some(len) => len,
                    None => DEFAULT_MAX_PDU,
                };

                let negotiated = ac.presentation_contexts;
                let presentation_contexts: Vec<_> = negotiated
                    .iter()
                    .filter(|c| c.is_accepted())
                    .cloned()
                    .collect();
                if presentation_contexts.is_empty() {
                    // nothing can be transferred over this association
                    let _ = write_pdu(
                        &mut buffer,
                        &Pdu::AbortRQ {
                            source: AbortSource::ServiceUser,
                        },
                    );
                    let _ = socket.write_all(&buffer);
                    return NoAcceptedPresentationContextsSnafu.fail();
                }

                Ok(ClientAssociation {
                    presentation_contexts,
                    negotiated,
                    requestor_max_pdu_length: max_pdu_length,
                    acceptor_max_pdu_length,
                    socket,
                    buffer,
                    strict,
                })
            }
            Pdu::AssociationRJ(association_rj) => RejectedSnafu { association_rj }.fail(),
            Pdu::AbortRQ { source } => PeerAbortedSnafu { reason: source }.fail(),
            pdu => {
                // abort connection
                let _ = write_pdu(
                    &mut buffer,
                    &Pdu::AbortRQ {
                        source: AbortSource::ServiceUser,
                    },
                );
                let _ = socket.write_all(&buffer);
                UnexpectedResponseSnafu { pdu }.fail()
            }
        }
    }
}

fn connect<T>(ae_address: &AeAddr<T>, timeout: Option<Duration>) -> Result<TcpStream>
where
    T: ToSocketAddrs,
{
    match timeout {
        None => TcpStream::connect(ae_address).context(ConnectSnafu),
        Some(timeout) => {
            let addresses = ae_address.to_socket_addrs().context(ResolveSnafu)?;
            let mut last_err = None;
            for address in addresses {
                match TcpStream::connect_timeout(&address, timeout) {
                    Ok(socket) => return Ok(socket),
                    Err(e)
                        if matches!(
                            e.kind(),
                            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
                        ) =>
                    {
                        return TimeoutSnafu { when: "connecting" }.fail();
                    }
                    Err(e) => last_err = Some(e),
                }
            }
            match last_err {
                Some(e) => Err(e).context(ConnectSnafu),
                None => NoAddressSnafu.fail(),
            }
        }
    }
}

/// Map an expired socket timeout to the dedicated timeout error.
fn receive_response_error(e: reader::Error) -> Error {
    if reader::is_timeout(&e) {
        TimeoutSnafu {
            when: "receiving the association response",
        }
        .build()
    } else {
        Error::ReceiveResponse { source: e }
    }
}

/// A DICOM upper level association from the perspective
/// of a requesting application entity.
///
/// The most common operations of an established association are
/// [`send`](Self::send) and [`receive`](Self::receive).
/// Sending large P-Data fragments may be easier through the P-Data sender
/// abstraction (see [`send_pdata`](Self::send_pdata)).
///
/// When the value falls out of scope,
/// the program will automatically try to gracefully release the association
/// through a standard release message exchange,
/// then shut down the underlying TCP connection.
#[derive(Debug)]
pub struct ClientAssociation {
    /// The accorded presentation contexts, without the rejected ones.
    presentation_contexts: Vec<PresentationContextResult>,
    /// The full negotiation outcome, rejected contexts included.
    negotiated: Vec<PresentationContextResult>,
    /// The maximum PDU length that this node is expecting to receive
    requestor_max_pdu_length: u32,
    /// The maximum PDU length that the remote node accepts
    acceptor_max_pdu_length: u32,
    /// The TCP stream to the other DICOM node
    socket: TcpStream,
    /// Buffer to assemble PDUs before sending them on the wire
    buffer: Vec<u8>,
    /// whether to receive PDUs in strict mode
    strict: bool,
}

impl ClientAssociation {
    /// Retrieve the list of accepted presentation contexts.
    pub fn presentation_contexts(&self) -> &[PresentationContextResult] {
        &self.presentation_contexts
    }

    /// Retrieve the full negotiation outcome,
    /// including the presentation contexts the acceptor rejected.
    pub fn negotiated_contexts(&self) -> &[PresentationContextResult] {
        &self.negotiated
    }

    /// Whether every proposed presentation context was accepted.
    ///
    /// Partial acceptance is distinct from full acceptance;
    /// callers decide for themselves whether the association is usable.
    pub fn all_accepted(&self) -> bool {
        self.negotiated
            .iter()
            .all(PresentationContextResult::is_accepted)
    }

    /// Retrieve the maximum PDU length
    /// admitted by the association acceptor.
    pub fn acceptor_max_pdu_length(&self) -> u32 {
        self.acceptor_max_pdu_length
    }

    /// Retrieve the maximum PDU length
    /// that this application entity is expecting to receive.
    pub fn requestor_max_pdu_length(&self) -> u32 {
        self.requestor_max_pdu_length
    }

    /// Send a PDU message to the other intervenient.
    pub fn send(&mut self, msg: &Pdu) -> Result<()> {
        self.buffer.clear();
        write_pdu(&mut self.buffer, msg).context(SendSnafu)?;
        if self.buffer.len() > self.acceptor_max_pdu_length as usize {
            return SendTooLongPduSnafu {
                length: self.buffer.len(),
            }
            .fail();
        }
        self.socket.write_all(&self.buffer).context(WireSendSnafu)
    }

    /// Read a PDU message from the other intervenient.
    pub fn receive(&mut self) -> Result<Pdu> {
        read_pdu(&mut self.socket, self.requestor_max_pdu_length, self.strict).map_err(|e| {
            if reader::is_timeout(&e) {
                TimeoutSnafu {
                    when: "receiving a PDU",
                }
                .build()
            } else {
                Error::Receive { source: e }
            }
        })
    }

    /// Gracefully terminate the association by exchanging release messages
    /// and then shutting down the TCP connection.
    pub fn release(mut self) -> Result<()> {
        let out = self.release_impl();
        let _ = self.socket.shutdown(std::net::Shutdown::Both);
        out
    }

    /// Send an abort message and shut down the TCP connection,
    /// terminating the association.
    pub fn abort(mut self) -> Result<()> {
        let pdu = Pdu::AbortRQ {
            source: AbortSource::ServiceUser,
        };
        let out = self.send(&pdu);
        let _ = self.socket.shutdown(std::net::Shutdown::Both);
        out
    }

    /// Obtain access to the inner TCP stream
    /// connected to the association acceptor.
    ///
    /// Reading and writing should be done with care
    /// to avoid inconsistencies in the association state:
    /// do not call `send` and `receive` while not in a PDU boundary.
    pub fn inner_stream(&mut self) -> &mut TcpStream {
        &mut self.socket
    }

    /// Prepare a P-Data writer for sending
    /// one or more data items.
    ///
    /// Returns a writer which automatically
    /// splits the inner data into separate PDUs if necessary.
    pub fn send_pdata(&mut self, presentation_context_id: u8) -> PDataWriter<&mut TcpStream> {
        PDataWriter::new(
            &mut self.socket,
            presentation_context_id,
            self.acceptor_max_pdu_length,
        )
    }

    /// Prepare a P-Data reader for receiving
    /// one or more data item PDUs.
    ///
    /// Returns a reader which automatically
    /// receives more data PDUs once the bytes collected are consumed,
    /// until the last fragment of the message arrives.
    pub fn receive_pdata(&mut self) -> PDataReader<&mut TcpStream> {
        PDataReader::new(&mut self.socket, self.requestor_max_pdu_length)
    }

    /// Release implementation function,
    /// which tries to send a release request and receive a release response.
    /// Terminating the connection must close the socket
    /// even if the exchange fails.
    fn release_impl(&mut self) -> Result<()> {
        let pdu = Pdu::ReleaseRQ;
        self.send(&pdu)?;
        let pdu = self.receive()?;

        match pdu {
            Pdu::ReleaseRP => Ok(()),
            pdu => UnexpectedResponseSnafu { pdu }.fail(),
        }
    }
}

/// Automatically release the association and shut down the connection.
impl Drop for ClientAssociation {
    fn drop(&mut self) {
        let _ = self.release_impl();
        let _ = self.socket.shutdown(std::net::Shutdown::Both);
    }
}
