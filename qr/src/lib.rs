//! DIMSE Query/Retrieve services for PACS archives.
//!
//! This crate builds the canonical DICOM Query/Retrieve verbs on top of
//! the upper layer protocol provided by `pacslink-ul`:
//! finding patients, studies, series and instances,
//! moving instances towards another application entity,
//! storing files, and verifying connectivity.
//!
//! A [`ConnectionManager`] owns the peer directory and every live
//! association. Host applications register their peers at startup
//! and then call the retrieval operations:
//!
//! ```no_run
//! use pacslink_qr::{ConnectionManager, Peer, QueryParams, RetrieveOptions};
//! use dicom_dictionary_std::tags;
//!
//! # fn main() -> pacslink_qr::Result<()> {
//! let manager = ConnectionManager::new("QUERY-SCU");
//! manager.add_peer(Peer::new("MAIN-PACS", "10.0.0.11", 104).default_peer())?;
//!
//! let mut params = QueryParams::new();
//! params.insert(tags::PATIENT_ID, "12345".to_string());
//! let studies = manager.retrieve_studies(&params, &RetrieveOptions::default())?;
//! for study in studies {
//!     println!("{:?}", study.get(tags::STUDY_INSTANCE_UID));
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Operations are synchronous:
//! each call returns once its association has been released or torn down.
//! Callers wanting concurrency run operations on their own threads;
//! the manager itself is safe to share.
pub mod cancel;
pub mod commands;
pub mod config;
pub mod connection;
pub mod error;
pub mod query;
mod scu;

pub use cancel::CancellationToken;
pub use config::Peer;
pub use connection::{AssociateOptions, ConnectionManager, ManagedAssociation};
pub use error::{Error, Result};
pub use query::QueryParams;
pub use scu::{MoveOptions, RetrieveOptions};
