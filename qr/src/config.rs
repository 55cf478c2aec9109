//! Peer configuration for DIMSE services.
//!
//! Host applications register a list of peer records at startup,
//! typically deserialized from their own configuration files.
//! Records are immutable once registered.
use serde::Deserialize;

use crate::error::{InvalidPeerSnafu, MissingPeerFieldSnafu, Result};
use snafu::ensure;

/// A remote or local DICOM application entity known to this node.
///
/// At most one peer may be flagged as default target for
/// outbound operations, and at most one as the server peer
/// on whose address inbound associations are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Peer {
    /// the application entity title identifying the peer
    #[serde(alias = "aeTitle")]
    pub ae_title: String,
    /// the network host name or address
    pub host: String,
    /// the TCP port
    pub port: u16,
    /// whether this peer is the default target for outbound operations
    #[serde(default)]
    pub default: bool,
    /// whether this node accepts inbound associations as this peer
    #[serde(default)]
    pub server: bool,
}

impl Peer {
    /// Create a plain peer record.
    pub fn new(ae_title: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Peer {
            ae_title: ae_title.into(),
            host: host.into(),
            port,
            default: false,
            server: false,
        }
    }

    /// Flag this peer as the default target for outbound operations.
    pub fn default_peer(mut self) -> Self {
        self.default = true;
        self
    }

    /// Flag this peer as the server peer of this node.
    pub fn server_peer(mut self) -> Self {
        self.server = true;
        self
    }

    /// The socket address of this peer in `host:port` form.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check the record for registration:
    /// AE title, host and port must all be usable.
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.ae_title.is_empty(), MissingPeerFieldSnafu { field: "aeTitle" });
        ensure!(!self.host.is_empty(), MissingPeerFieldSnafu { field: "host" });
        ensure!(self.port != 0, MissingPeerFieldSnafu { field: "port" });
        ensure!(
            self.ae_title.len() <= 16 && self.ae_title.is_ascii(),
            InvalidPeerSnafu {
                ae_title: self.ae_title.clone(),
                reason: "AE title must be at most 16 ASCII characters",
            }
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn valid_peer_passes() {
        let peer = Peer::new("MAIN-PACS", "10.0.0.11", 104).default_peer();
        assert!(peer.validate().is_ok());
        assert_eq!(peer.address(), "10.0.0.11:104");
    }

    #[test]
    fn missing_fields_fail_registration() {
        let peer = Peer::new("", "10.0.0.11", 104);
        assert!(matches!(
            peer.validate(),
            Err(Error::MissingPeerField { field: "aeTitle", .. })
        ));

        let peer = Peer::new("MAIN-PACS", "", 104);
        assert!(matches!(
            peer.validate(),
            Err(Error::MissingPeerField { field: "host", .. })
        ));

        let peer = Peer::new("MAIN-PACS", "10.0.0.11", 0);
        assert!(matches!(
            peer.validate(),
            Err(Error::MissingPeerField { field: "port", .. })
        ));
    }

    #[test]
    fn overlong_ae_title_fails_registration() {
        let peer = Peer::new("A-MUCH-TOO-LONG-AE-TITLE", "10.0.0.11", 104);
        assert!(matches!(peer.validate(), Err(Error::InvalidPeer { .. })));
    }

    #[test]
    fn deserializes_camel_case_records() {
        let peer: Peer = serde_json::from_str(
            r#"{"aeTitle": "MAIN-PACS", "host": "10.0.0.11", "port": 104, "default": true}"#,
        )
        .unwrap();
        assert_eq!(peer.ae_title, "MAIN-PACS");
        assert!(peer.default);
        assert!(!peer.server);
    }
}
