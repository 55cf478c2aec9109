//! This crate contains the types and methods needed to talk to
//! DICOM nodes through the upper layer protocol.
//!
//! It serves as the transport foundation for the DIMSE services
//! in the sibling query/retrieve crate,
//! but can also be used on its own
//! to build custom service class users (SCUs)
//! and service class providers (SCPs).
//!
//! - The [`stream`] module
//!   provides the cursor-based byte stream codec
//!   on which all wire encoding and decoding is built.
//! - The [`field`] module
//!   defines the leaf serialization units
//!   which know their own encoded width.
//! - The [`pdu`] module
//!   provides data structures representing _protocol data units_,
//!   together with their readers and writers.
//! - The [`association`] module
//!   comprises abstractions for establishing and negotiating associations
//!   between application entities over TCP.
//! - The [`address`] module
//!   provides an abstraction for compound addresses
//!   referring to application entities in a network.

pub mod address;
pub mod association;
pub mod field;
pub mod pdu;
pub mod stream;

/// The implementation class UID generically referring to this stack.
///
/// Generated as per the standard, part 5, section B.2.
pub const IMPLEMENTATION_CLASS_UID: &str = "2.25.318401928447824374837839221189512088343";

/// The implementation version name generically referring to this stack.
pub const IMPLEMENTATION_VERSION_NAME: &str = "PACSLINK-0.1.0";

// re-exports

pub use address::AeAddr;
pub use association::client::{ClientAssociation, ClientAssociationOptions};
pub use association::server::{ServerAssociation, ServerAssociationOptions};
pub use pdu::read_pdu;
pub use pdu::write_pdu;
pub use pdu::Pdu;
