//! Error taxonomy of the query/retrieve services.
//!
//! Synchronous precondition violations
//! (bad peer records, missing presentation contexts)
//! fail before any I/O is attempted.
//! Everything that depends on a peer's behavior over the network
//! travels through the same `Result` channel as success.
use std::path::PathBuf;

use pacslink_ul::association::{client, server};
use pacslink_ul::pdu::Pdu;
use snafu::{Backtrace, Snafu};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("peer registration is missing the `{field}` field"))]
    MissingPeerField {
        field: &'static str,
        backtrace: Backtrace,
    },

    #[snafu(display("invalid peer `{ae_title}`: {reason}"))]
    InvalidPeer {
        ae_title: String,
        reason: &'static str,
        backtrace: Backtrace,
    },

    #[snafu(display("no such peer `{ae_title}`"))]
    NoSuchPeer {
        ae_title: String,
        backtrace: Backtrace,
    },

    /// no default peer is registered
    NoDefaultPeer { backtrace: Backtrace },

    /// no server peer is registered
    NoServerPeer { backtrace: Backtrace },

    /// presentation contexts must be specified
    ContextsMustBeSpecified { backtrace: Backtrace },

    #[snafu(display("could not establish association with `{ae_title}`"))]
    Associate {
        ae_title: String,
        #[snafu(backtrace)]
        source: client::Error,
    },

    #[snafu(display("no presentation context was negotiated for `{abstract_syntax}`"))]
    MissingNegotiatedContext {
        abstract_syntax: String,
        backtrace: Backtrace,
    },

    #[snafu(display("unsupported transfer syntax `{uid}`"))]
    UnsupportedTransferSyntax { uid: String, backtrace: Backtrace },

    /// could not encode DIMSE message
    CreateCommand {
        source: Box<dicom_object::WriteError>,
        backtrace: Backtrace,
    },

    /// could not decode DIMSE response
    ReadResponse {
        source: dicom_object::ReadError,
        backtrace: Backtrace,
    },

    /// could not receive DIMSE response data
    ReadResponseData {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// could not send DIMSE message data
    SendData {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// the response carries no valid status code
    MissingResponseStatus { backtrace: Backtrace },

    #[snafu(display("response is missing attribute {name}"))]
    MissingResponseAttribute {
        name: &'static str,
        backtrace: Backtrace,
    },

    #[snafu(display("operation failed with status code {status:#06X}"))]
    OperationFailed { status: u16, backtrace: Backtrace },

    #[snafu(display("unexpected response PDU `{}`", pdu.short_description()))]
    UnexpectedResponse {
        /// the PDU obtained from the peer
        pdu: Box<Pdu>,
    },

    /// the association failed during the operation
    Transport {
        #[snafu(backtrace)]
        source: client::Error,
    },

    /// the operation was cancelled by the caller
    Cancelled { backtrace: Backtrace },

    #[snafu(display("could not open DICOM file {}", path.display()))]
    OpenFile {
        path: PathBuf,
        source: dicom_object::ReadError,
        backtrace: Backtrace,
    },

    #[snafu(display("could not listen on {address}"))]
    Listen {
        address: String,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// failed to accept an inbound connection
    Accept {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// failed to negotiate an inbound association
    ServerAssociation {
        #[snafu(backtrace)]
        source: server::Error,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Whether the failure was an expired connect or idle timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Error::Associate {
                source: client::Error::Timeout { .. },
                ..
            } | Error::Transport {
                source: client::Error::Timeout { .. },
                ..
            }
        )
    }

    /// Whether the peer outright rejected the association
    /// or accepted none of the proposed presentation contexts.
    pub fn is_rejected(&self) -> bool {
        matches!(
            self,
            Error::Associate {
                source: client::Error::Rejected { .. }
                    | client::Error::NoAcceptedPresentationContexts { .. },
                ..
            }
        )
    }

    /// Whether the operation was cancelled by the caller.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled { .. })
    }
}
