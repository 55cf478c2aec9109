//! DICOM association module
//!
//! This module contains utilities for establishing associations
//! between DICOM nodes via TCP/IP.
//!
//! As an association requester, often as a service class user (SCU),
//! a new association can be started
//! via the [`ClientAssociationOptions`] type.
//! The minimum required properties are the proposed presentation contexts
//! and the TCP socket address of the target node.
//!
//! As an association acceptor,
//! usually taking the role of a service class provider (SCP),
//! a newly accepted [TCP stream](std::net::TcpStream) is passed to
//! a previously prepared [`ServerAssociationOptions`].
pub mod client;
pub mod server;

pub(crate) mod pdata;
pub(crate) mod uid;

pub use client::{ClientAssociation, ClientAssociationOptions};
pub use pdata::{PDataReader, PDataWriter};
pub use server::{ServerAssociation, ServerAssociationOptions};
