//! Protocol Data Unit module
//!
//! This module comprises the data structures representing the
//! protocol data units (PDUs) of the DICOM upper layer protocol,
//! as well as their readers and writers.
//!
//! Every PDU is a round-trippable record:
//! [`write_pdu`] serializes it through its field list
//! and [`read_pdu`] decodes the same bytes back,
//! dispatching on the one-byte wire type code.
pub mod reader;
pub mod writer;

use std::fmt::Display;

pub use reader::read_pdu;
pub use writer::write_pdu;

/// The default maximum PDU size
pub const DEFAULT_MAX_PDU: u32 = 16_384;

/// The minimum PDU size,
/// as specified by the standard
pub const MINIMUM_PDU_SIZE: u32 = 4_096;

/// The maximum PDU size,
/// as specified by the standard
pub const MAXIMUM_PDU_SIZE: u32 = 131_072;

/// The length of the PDU header in bytes,
/// comprising the PDU type (1 byte),
/// reserved byte (1 byte),
/// and PDU length (4 bytes).
pub const PDU_HEADER_SIZE: u32 = 6;

/// The upper layer protocol version advertised by this stack.
pub const PROTOCOL_VERSION: u16 = 1;

/// Wire type codes for top-level PDUs and their nested items.
pub(crate) mod codes {
    pub const ASSOCIATION_RQ: u8 = 0x01;
    pub const ASSOCIATION_AC: u8 = 0x02;
    pub const ASSOCIATION_RJ: u8 = 0x03;
    pub const P_DATA_TF: u8 = 0x04;
    pub const RELEASE_RQ: u8 = 0x05;
    pub const RELEASE_RP: u8 = 0x06;
    pub const ABORT_RQ: u8 = 0x07;

    pub const APPLICATION_CONTEXT: u8 = 0x10;
    pub const PRESENTATION_CONTEXT_RQ: u8 = 0x20;
    pub const PRESENTATION_CONTEXT_AC: u8 = 0x21;
    pub const ABSTRACT_SYNTAX: u8 = 0x30;
    pub const TRANSFER_SYNTAX: u8 = 0x40;
    pub const USER_INFORMATION: u8 = 0x50;
    pub const MAXIMUM_LENGTH: u8 = 0x51;
    pub const IMPLEMENTATION_CLASS_UID: u8 = 0x52;
    pub const IMPLEMENTATION_VERSION_NAME: u8 = 0x55;
}

/// Message component for a proposed presentation context.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct PresentationContextProposed {
    /// the presentation context identifier
    pub id: u8,
    /// the expected abstract syntax UID
    /// (commonly referring to the expected SOP class)
    pub abstract_syntax: String,
    /// a list of transfer syntax UIDs to support in this interaction
    pub transfer_syntaxes: Vec<String>,
}

/// Message component for a negotiated presentation context.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct PresentationContextResult {
    pub id: u8,
    pub reason: PresentationContextResultReason,
    pub transfer_syntax: String,
}

impl PresentationContextResult {
    /// Whether the acceptor accepted this presentation context.
    pub fn is_accepted(&self) -> bool {
        self.reason == PresentationContextResultReason::Acceptance
    }
}

#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub enum PresentationContextResultReason {
    Acceptance = 0,
    UserRejection = 1,
    NoReason = 2,
    AbstractSyntaxNotSupported = 3,
    TransferSyntaxesNotSupported = 4,
}

impl PresentationContextResultReason {
    pub(crate) fn from_code(reason: u8) -> Option<Self> {
        match reason {
            0 => Some(PresentationContextResultReason::Acceptance),
            1 => Some(PresentationContextResultReason::UserRejection),
            2 => Some(PresentationContextResultReason::NoReason),
            3 => Some(PresentationContextResultReason::AbstractSyntaxNotSupported),
            4 => Some(PresentationContextResultReason::TransferSyntaxesNotSupported),
            _ => None,
        }
    }

    pub(crate) fn code(self) -> u8 {
        self as u8
    }
}

impl Display for PresentationContextResultReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            PresentationContextResultReason::Acceptance => "acceptance",
            PresentationContextResultReason::UserRejection => "user rejection",
            PresentationContextResultReason::NoReason => "no reason",
            PresentationContextResultReason::AbstractSyntaxNotSupported => {
                "abstract syntax not supported"
            }
            PresentationContextResultReason::TransferSyntaxesNotSupported => {
                "transfer syntaxes not supported"
            }
        };
        f.write_str(msg)
    }
}

/// The result category of an association rejection.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub enum RejectResult {
    Permanent = 1,
    Transient = 2,
}

impl RejectResult {
    pub(crate) fn from_code(value: u8) -> Option<Self> {
        match value {
            1 => Some(RejectResult::Permanent),
            2 => Some(RejectResult::Transient),
            _ => None,
        }
    }

    pub(crate) fn code(self) -> u8 {
        self as u8
    }
}

/// The source of an association rejection,
/// carrying the raw reason/diagnostic code of that source.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub enum RejectSource {
    /// DICOM UL service-user
    ServiceUser,
    /// DICOM UL service-provider (ACSE related function)
    ServiceProviderAcse,
    /// DICOM UL service-provider (presentation related function)
    ServiceProviderPresentation,
}

impl RejectSource {
    pub(crate) fn from_code(source: u8) -> Option<Self> {
        match source {
            1 => Some(RejectSource::ServiceUser),
            2 => Some(RejectSource::ServiceProviderAcse),
            3 => Some(RejectSource::ServiceProviderPresentation),
            _ => None,
        }
    }

    pub(crate) fn code(self) -> u8 {
        match self {
            RejectSource::ServiceUser => 1,
            RejectSource::ServiceProviderAcse => 2,
            RejectSource::ServiceProviderPresentation => 3,
        }
    }
}

impl Display for RejectSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            RejectSource::ServiceUser => "service user",
            RejectSource::ServiceProviderAcse => "service provider (ACSE)",
            RejectSource::ServiceProviderPresentation => "service provider (presentation)",
        };
        f.write_str(msg)
    }
}

/// An in-memory representation of an association rejection.
#[derive(Debug, Clone, Eq, Hash, PartialEq)]
pub struct AssociationRJ {
    pub result: RejectResult,
    pub source: RejectSource,
    /// the raw reason/diagnostic code,
    /// interpreted relative to `source`
    pub reason: u8,
}

impl Display for AssociationRJ {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (reason code {})", self.source, self.reason)
    }
}

impl From<AssociationRJ> for Pdu {
    fn from(value: AssociationRJ) -> Self {
        Pdu::AssociationRJ(value)
    }
}

/// One fragment of a DICOM message
/// carried inside a P-DATA-TF PDU.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct PDataValue {
    pub presentation_context_id: u8,
    pub value_type: PDataValueType,
    /// whether this is the last fragment of the message
    pub is_last: bool,
    pub data: Vec<u8>,
}

/// Whether a P-Data fragment carries command set or data set bytes.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub enum PDataValueType {
    Command,
    Data,
}

/// The source of an association abort.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub enum AbortSource {
    ServiceUser,
    ServiceProvider(AbortServiceProviderReason),
    Reserved,
}

impl AbortSource {
    pub(crate) fn from_codes(source: u8, reason: u8) -> Option<Self> {
        match (source, reason) {
            (0, _) => Some(AbortSource::ServiceUser),
            (1, _) => Some(AbortSource::Reserved),
            (2, 0) => Some(AbortSource::ServiceProvider(
                AbortServiceProviderReason::ReasonNotSpecified,
            )),
            (2, 1) => Some(AbortSource::ServiceProvider(
                AbortServiceProviderReason::UnrecognizedPdu,
            )),
            (2, 2) => Some(AbortSource::ServiceProvider(
                AbortServiceProviderReason::UnexpectedPdu,
            )),
            (2, 3) => Some(AbortSource::ServiceProvider(
                AbortServiceProviderReason::Reserved,
            )),
            (2, 4) => Some(AbortSource::ServiceProvider(
                AbortServiceProviderReason::UnrecognizedPduParameter,
            )),
            (2, 5) => Some(AbortSource::ServiceProvider(
                AbortServiceProviderReason::UnexpectedPduParameter,
            )),
            (2, 6) => Some(AbortSource::ServiceProvider(
                AbortServiceProviderReason::InvalidPduParameter,
            )),
            _ => None,
        }
    }

    pub(crate) fn codes(self) -> (u8, u8) {
        match self {
            AbortSource::ServiceUser => (0, 0),
            AbortSource::Reserved => (1, 0),
            AbortSource::ServiceProvider(reason) => (2, reason.code()),
        }
    }
}

impl Display for AbortSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbortSource::ServiceUser => f.write_str("service user"),
            AbortSource::Reserved => f.write_str("reserved source"),
            AbortSource::ServiceProvider(reason) => {
                write!(f, "service provider ({reason})")
            }
        }
    }
}

/// An enumeration of supported A-ABORT PDU provider reasons.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub enum AbortServiceProviderReason {
    ReasonNotSpecified,
    UnrecognizedPdu,
    UnexpectedPdu,
    Reserved,
    UnrecognizedPduParameter,
    UnexpectedPduParameter,
    InvalidPduParameter,
}

impl AbortServiceProviderReason {
    pub(crate) fn code(self) -> u8 {
        match self {
            AbortServiceProviderReason::ReasonNotSpecified => 0,
            AbortServiceProviderReason::UnrecognizedPdu => 1,
            AbortServiceProviderReason::UnexpectedPdu => 2,
            AbortServiceProviderReason::Reserved => 3,
            AbortServiceProviderReason::UnrecognizedPduParameter => 4,
            AbortServiceProviderReason::UnexpectedPduParameter => 5,
            AbortServiceProviderReason::InvalidPduParameter => 6,
        }
    }
}

impl Display for AbortServiceProviderReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            AbortServiceProviderReason::ReasonNotSpecified => "reason not specified",
            AbortServiceProviderReason::UnrecognizedPdu => "unrecognized PDU",
            AbortServiceProviderReason::UnexpectedPdu => "unexpected PDU",
            AbortServiceProviderReason::Reserved => "reserved code",
            AbortServiceProviderReason::UnrecognizedPduParameter => "unrecognized PDU parameter",
            AbortServiceProviderReason::UnexpectedPduParameter => "unexpected PDU parameter",
            AbortServiceProviderReason::InvalidPduParameter => "invalid PDU parameter",
        };
        f.write_str(msg)
    }
}

/// One variable item of an association negotiation PDU.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub enum PduVariableItem {
    Unknown(u8),
    ApplicationContext(String),
    PresentationContextProposed(PresentationContextProposed),
    PresentationContextResult(PresentationContextResult),
    UserVariables(Vec<UserVariableItem>),
}

/// One sub-item of the user information item.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub enum UserVariableItem {
    Unknown(u8, Vec<u8>),
    MaxLength(u32),
    ImplementationClassUID(String),
    ImplementationVersionName(String),
}

/// An in-memory representation of a full Protocol Data Unit (PDU).
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum Pdu {
    /// Association request (A-ASSOCIATE-RQ)
    AssociationRQ(AssociationRQ),
    /// Association acknowledgement (A-ASSOCIATE-AC)
    AssociationAC(AssociationAC),
    /// Association rejection (A-ASSOCIATE-RJ)
    AssociationRJ(AssociationRJ),
    /// P-Data
    PData { data: Vec<PDataValue> },
    /// Association release request (A-RELEASE-RQ)
    ReleaseRQ,
    /// Association release reply (A-RELEASE-RP)
    ReleaseRP,
    /// Association abort request (A-ABORT-RQ)
    AbortRQ { source: AbortSource },
}

impl Pdu {
    /// Provide a short description of the PDU.
    pub fn short_description(&self) -> impl std::fmt::Display + '_ {
        PduShortDescription(self)
    }
}

struct PduShortDescription<'a>(&'a Pdu);

impl std::fmt::Display for PduShortDescription<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Pdu::AssociationRQ { .. }
            | Pdu::AssociationAC { .. }
            | Pdu::AssociationRJ { .. }
            | Pdu::ReleaseRQ
            | Pdu::ReleaseRP
            | Pdu::AbortRQ { .. } => std::fmt::Debug::fmt(self.0, f),
            Pdu::PData { data } => {
                if data.len() == 1 {
                    write!(
                        f,
                        "PData [({:?}, {} bytes)]",
                        data[0].value_type,
                        data[0].data.len()
                    )
                } else {
                    write!(f, "PData [{} p-data values]", data.len())
                }
            }
        }
    }
}

/// An in-memory representation of an association request
#[derive(Debug, Clone, Eq, Hash, PartialEq)]
pub struct AssociationRQ {
    pub protocol_version: u16,
    pub calling_ae_title: String,
    pub called_ae_title: String,
    pub application_context_name: String,
    pub presentation_contexts: Vec<PresentationContextProposed>,
    pub user_variables: Vec<UserVariableItem>,
}

impl From<AssociationRQ> for Pdu {
    fn from(value: AssociationRQ) -> Self {
        Pdu::AssociationRQ(value)
    }
}

/// An in-memory representation of an association acknowledgement
#[derive(Debug, Clone, Eq, Hash, PartialEq)]
pub struct AssociationAC {
    pub protocol_version: u16,
    pub calling_ae_title: String,
    pub called_ae_title: String,
    pub application_context_name: String,
    pub presentation_contexts: Vec<PresentationContextResult>,
    pub user_variables: Vec<UserVariableItem>,
}

impl AssociationAC {
    /// Whether every negotiated presentation context was accepted.
    ///
    /// Vacuously true when no contexts were negotiated.
    /// A single rejection makes this false
    /// even if all other contexts succeeded:
    /// partial acceptance is a distinct case from full acceptance
    /// and callers must decide for themselves whether it is usable.
    pub fn all_accepted(&self) -> bool {
        self.presentation_contexts
            .iter()
            .all(PresentationContextResult::is_accepted)
    }

    /// Walk the user information items for the maximum-length item.
    ///
    /// Absence of the item yields `None`, not a default.
    pub fn acceptor_max_pdu_length(&self) -> Option<u32> {
        self.user_variables.iter().find_map(|item| match item {
            UserVariableItem::MaxLength(len) => Some(*len),
            _ => None,
        })
    }
}

impl From<AssociationAC> for Pdu {
    fn from(value: AssociationAC) -> Self {
        Pdu::AssociationAC(value)
    }
}
