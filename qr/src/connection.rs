//! Connection and association management.
//!
//! A [`ConnectionManager`] owns the peer directory and a registry of
//! live associations keyed by AE title.
//! It hands out outbound associations through
//! [`associate`](ConnectionManager::associate)
//! and accepts inbound associations on the server peer's address
//! through [`serve`](ConnectionManager::serve).
//!
//! The directory and the registry are touched by
//! concurrent association lifecycles running on different threads,
//! so both sit behind mutexes.
use std::collections::{HashMap, HashSet};
use std::net::TcpListener;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pacslink_ul::association::client::{self, ClientAssociation, ClientAssociationOptions};
use pacslink_ul::association::server::{ServerAssociation, ServerAssociationOptions};
use pacslink_ul::pdu::{Pdu, PresentationContextResult};
use snafu::{ensure, ResultExt};
use tracing::{debug, warn};

use crate::cancel::CancellationToken;
use crate::config::Peer;
use crate::error::{
    AcceptSnafu, AssociateSnafu, ContextsMustBeSpecifiedSnafu, InvalidPeerSnafu, ListenSnafu,
    NoDefaultPeerSnafu, NoServerPeerSnafu, NoSuchPeerSnafu, Result, ServerAssociationSnafu,
};

/// Registry of live associations, keyed by peer AE title.
#[derive(Debug, Default)]
struct SessionRegistry {
    inner: Mutex<HashMap<String, HashSet<u64>>>,
}

impl SessionRegistry {
    fn add(&self, ae_title: &str, id: u64) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.entry(ae_title.to_string()).or_default().insert(id);
    }

    fn remove(&self, ae_title: &str, id: u64) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(ids) = inner.get_mut(ae_title) {
            ids.remove(&id);
            if ids.is_empty() {
                inner.remove(ae_title);
            }
        }
    }

    fn count(&self, ae_title: &str) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.get(ae_title).map(HashSet::len).unwrap_or(0)
    }
}

/// Deregisters one association from the registry when dropped.
#[derive(Debug)]
struct SessionGuard {
    registry: Arc<SessionRegistry>,
    ae_title: String,
    id: u64,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.remove(&self.ae_title, self.id);
        debug!("association with `{}` closed", self.ae_title);
    }
}

/// Options for establishing one outbound association.
#[derive(Debug, Clone, Default)]
pub struct AssociateOptions {
    /// AE title of the target peer;
    /// the default peer is used when unset
    pub peer: Option<String>,
    /// the presentation contexts to propose:
    /// abstract syntax plus its transfer syntaxes.
    /// At least one context must be specified.
    pub presentation_contexts: Vec<(String, Vec<String>)>,
}

/// Owner of all TCP-level state:
/// the peer directory, the live association registry,
/// and the options shared by every association this node requests.
#[derive(Debug)]
pub struct ConnectionManager {
    calling_ae_title: String,
    max_pdu_length: u32,
    connect_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
    peers: Mutex<HashMap<String, Peer>>,
    sessions: Arc<SessionRegistry>,
    next_session: AtomicU64,
}

impl ConnectionManager {
    /// Create a manager for a node with the given calling AE title.
    pub fn new(calling_ae_title: impl Into<String>) -> Self {
        ConnectionManager {
            calling_ae_title: calling_ae_title.into(),
            max_pdu_length: pacslink_ul::pdu::DEFAULT_MAX_PDU,
            connect_timeout: None,
            read_timeout: None,
            peers: Mutex::new(HashMap::new()),
            sessions: Arc::new(SessionRegistry::default()),
            next_session: AtomicU64::new(1),
        }
    }

    /// Override the maximum PDU length advertised to peers.
    pub fn max_pdu_length(mut self, value: u32) -> Self {
        self.max_pdu_length = value;
        self
    }

    /// Set a timeout for establishing TCP connections.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Set an idle timeout for socket reads on every association.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    /// The calling AE title of this node.
    pub fn calling_ae_title(&self) -> &str {
        &self.calling_ae_title
    }

    /// Register a peer into the directory.
    ///
    /// The record must carry an AE title, a host and a port,
    /// and there may be at most one default peer
    /// and one server peer in the directory.
    pub fn add_peer(&self, peer: Peer) -> Result<()> {
        peer.validate()?;
        let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        if peer.default {
            ensure!(
                !peers
                    .values()
                    .any(|p| p.default && p.ae_title != peer.ae_title),
                InvalidPeerSnafu {
                    ae_title: peer.ae_title.clone(),
                    reason: "another default peer is already registered",
                }
            );
        }
        if peer.server {
            ensure!(
                !peers
                    .values()
                    .any(|p| p.server && p.ae_title != peer.ae_title),
                InvalidPeerSnafu {
                    ae_title: peer.ae_title.clone(),
                    reason: "another server peer is already registered",
                }
            );
        }
        peers.insert(peer.ae_title.clone(), peer);
        Ok(())
    }

    /// Look up a peer in the directory by AE title.
    pub fn select_peer(&self, ae_title: &str) -> Result<Peer> {
        ensure!(!ae_title.is_empty(), NoSuchPeerSnafu { ae_title });
        let peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        peers
            .get(ae_title)
            .cloned()
            .ok_or_else(|| NoSuchPeerSnafu { ae_title }.build())
    }

    /// The peer flagged as default target for outbound operations.
    pub fn default_peer(&self) -> Result<Peer> {
        let peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        peers
            .values()
            .find(|p| p.default)
            .cloned()
            .ok_or_else(|| NoDefaultPeerSnafu.build())
    }

    /// The peer on whose address this node accepts inbound associations.
    pub fn server_peer(&self) -> Result<Peer> {
        let peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        peers
            .values()
            .find(|p| p.server)
            .cloned()
            .ok_or_else(|| NoServerPeerSnafu.build())
    }

    /// Resolve the target of an operation:
    /// an explicitly selected peer, or the default one.
    pub(crate) fn resolve_peer(&self, ae_title: Option<&str>) -> Result<Peer> {
        match ae_title {
            Some(ae_title) => self.select_peer(ae_title),
            None => self.default_peer(),
        }
    }

    /// Whether no association with the given AE title is live.
    ///
    /// Used for shutdown sequencing:
    /// a server may only stop once all of its sessions have terminated.
    pub fn all_closed(&self, ae_title: &str) -> bool {
        self.sessions.count(ae_title) == 0
    }

    /// The number of live associations with the given AE title.
    pub fn active_associations(&self, ae_title: &str) -> usize {
        self.sessions.count(ae_title)
    }

    /// Open an association with a peer,
    /// negotiating the given presentation contexts.
    ///
    /// The association is tracked in the registry
    /// until the returned handle is dropped.
    pub fn associate(&self, options: AssociateOptions) -> Result<ManagedAssociation> {
        ensure!(
            !options.presentation_contexts.is_empty(),
            ContextsMustBeSpecifiedSnafu
        );
        let peer = self.resolve_peer(options.peer.as_deref())?;

        // the i-th proposed context is assigned the odd identifier 2i+1;
        // remember the mapping so operations can find their context back
        let proposed: Vec<(u8, String)> = options
            .presentation_contexts
            .iter()
            .enumerate()
            .map(|(i, (abstract_syntax, _))| ((i * 2 + 1) as u8, abstract_syntax.clone()))
            .collect();

        let mut scu_options = ClientAssociationOptions::new()
            .calling_ae_title(self.calling_ae_title.clone())
            .called_ae_title(peer.ae_title.clone())
            .max_pdu_length(self.max_pdu_length);
        for (abstract_syntax, transfer_syntaxes) in options.presentation_contexts {
            scu_options = scu_options.with_presentation_context(abstract_syntax, transfer_syntaxes);
        }
        if let Some(timeout) = self.connect_timeout {
            scu_options = scu_options.connect_timeout(timeout);
        }
        if let Some(timeout) = self.read_timeout {
            scu_options = scu_options.read_timeout(timeout);
        }

        debug!("requesting association with `{}`", peer.ae_title);
        let inner = scu_options
            .establish(peer.address())
            .context(AssociateSnafu {
                ae_title: peer.ae_title.clone(),
            })?;

        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        self.sessions.add(&peer.ae_title, id);
        Ok(ManagedAssociation {
            inner,
            proposed,
            next_message_id: 1,
            _session: SessionGuard {
                registry: Arc::clone(&self.sessions),
                ae_title: peer.ae_title,
                id,
            },
        })
    }

    /// Accept inbound associations on the server peer's address,
    /// handing each established association to `handler`
    /// on its own thread.
    ///
    /// The listener keeps accepting sequential associations
    /// until the shutdown token is triggered.
    /// Callers sequencing a full shutdown should then wait for
    /// [`all_closed`](Self::all_closed) on the server peer's AE title.
    pub fn serve<F>(
        &self,
        scp_options: ServerAssociationOptions<'static>,
        shutdown: CancellationToken,
        handler: F,
    ) -> Result<()>
    where
        F: Fn(ServerAssociation) + Send + Sync + 'static,
    {
        let peer = self.server_peer()?;
        let listener = TcpListener::bind(peer.address()).context(ListenSnafu {
            address: peer.address(),
        })?;
        // poll for the shutdown flag between accepts
        listener.set_nonblocking(true).context(ListenSnafu {
            address: peer.address(),
        })?;
        debug!("accepting associations on {}", peer.address());

        let handler = Arc::new(handler);
        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }
            match listener.accept() {
                Ok((stream, remote)) => {
                    stream.set_nonblocking(false).context(AcceptSnafu)?;
                    debug!("inbound connection from {}", remote);

                    let id = self.next_session.fetch_add(1, Ordering::Relaxed);
                    self.sessions.add(&peer.ae_title, id);
                    let guard = SessionGuard {
                        registry: Arc::clone(&self.sessions),
                        ae_title: peer.ae_title.clone(),
                        id,
                    };

                    let scp_options = scp_options.clone();
                    let handler = Arc::clone(&handler);
                    std::thread::spawn(move || {
                        let _guard = guard;
                        match scp_options.establish(stream).context(ServerAssociationSnafu) {
                            Ok(association) => (*handler)(association),
                            Err(e) => warn!("inbound association failed: {}", e),
                        }
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(e) => return Err(e).context(AcceptSnafu),
            }
        }
    }
}

/// An outbound association tracked by a [`ConnectionManager`].
///
/// Dropping the handle removes the association from the registry
/// and gracefully releases the underlying association.
#[derive(Debug)]
pub struct ManagedAssociation {
    inner: ClientAssociation,
    /// presentation context ID to proposed abstract syntax
    proposed: Vec<(u8, String)>,
    next_message_id: u16,
    _session: SessionGuard,
}

impl ManagedAssociation {
    /// The next message ID in this association's message ID space.
    pub fn next_message_id(&mut self) -> u16 {
        let id = self.next_message_id;
        self.next_message_id += 1;
        id
    }

    /// The accepted presentation context negotiated
    /// for the given abstract syntax, if any.
    pub fn presentation_context_for(
        &self,
        abstract_syntax: &str,
    ) -> Option<&PresentationContextResult> {
        self.inner.presentation_contexts().iter().find(|pc| {
            self.proposed
                .iter()
                .any(|(id, uid)| *id == pc.id && uid == abstract_syntax)
        })
    }

    /// All accepted presentation contexts negotiated
    /// for the given abstract syntax.
    pub fn presentation_contexts_for(
        &self,
        abstract_syntax: &str,
    ) -> Vec<PresentationContextResult> {
        self.inner
            .presentation_contexts()
            .iter()
            .filter(|pc| {
                self.proposed
                    .iter()
                    .any(|(id, uid)| *id == pc.id && uid == abstract_syntax)
            })
            .cloned()
            .collect()
    }

    /// Retrieve the list of accepted presentation contexts.
    pub fn presentation_contexts(&self) -> &[PresentationContextResult] {
        self.inner.presentation_contexts()
    }

    /// Whether every proposed presentation context was accepted.
    pub fn all_accepted(&self) -> bool {
        self.inner.all_accepted()
    }

    /// Retrieve the maximum PDU length admitted by the peer.
    pub fn acceptor_max_pdu_length(&self) -> u32 {
        self.inner.acceptor_max_pdu_length()
    }

    /// Send a PDU message to the peer.
    pub fn send(&mut self, msg: &Pdu) -> client::Result<()> {
        self.inner.send(msg)
    }

    /// Read a PDU message from the peer.
    pub fn receive(&mut self) -> client::Result<Pdu> {
        self.inner.receive()
    }

    /// Prepare a P-Data writer for sending one or more data items.
    pub fn send_pdata(
        &mut self,
        presentation_context_id: u8,
    ) -> pacslink_ul::association::PDataWriter<&mut std::net::TcpStream> {
        self.inner.send_pdata(presentation_context_id)
    }

    /// Prepare a P-Data reader for receiving one or more data item PDUs.
    pub fn receive_pdata(
        &mut self,
    ) -> pacslink_ul::association::PDataReader<&mut std::net::TcpStream> {
        self.inner.receive_pdata()
    }

    /// Gracefully terminate the association.
    pub fn release(self) -> client::Result<()> {
        self.inner.release()
    }

    /// Abort the association and shut down its connection.
    pub fn abort(self) -> client::Result<()> {
        self.inner.abort()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn peer_directory_lookup() {
        let manager = ConnectionManager::new("QUERY-SCU");
        manager
            .add_peer(Peer::new("MAIN-PACS", "10.0.0.11", 104).default_peer())
            .unwrap();
        manager
            .add_peer(Peer::new("STORE-SCP", "127.0.0.1", 11112).server_peer())
            .unwrap();

        assert_eq!(manager.select_peer("MAIN-PACS").unwrap().port, 104);
        assert!(matches!(
            manager.select_peer("NOBODY"),
            Err(Error::NoSuchPeer { .. })
        ));
        assert!(matches!(
            manager.select_peer(""),
            Err(Error::NoSuchPeer { .. })
        ));
        assert_eq!(manager.default_peer().unwrap().ae_title, "MAIN-PACS");
        assert_eq!(manager.server_peer().unwrap().ae_title, "STORE-SCP");
    }

    #[test]
    fn only_one_default_and_one_server_peer() {
        let manager = ConnectionManager::new("QUERY-SCU");
        manager
            .add_peer(Peer::new("MAIN-PACS", "10.0.0.11", 104).default_peer())
            .unwrap();
        assert!(matches!(
            manager.add_peer(Peer::new("OTHER-PACS", "10.0.0.12", 104).default_peer()),
            Err(Error::InvalidPeer { .. })
        ));

        manager
            .add_peer(Peer::new("STORE-SCP", "127.0.0.1", 11112).server_peer())
            .unwrap();
        assert!(matches!(
            manager.add_peer(Peer::new("OTHER-SCP", "127.0.0.1", 11113).server_peer()),
            Err(Error::InvalidPeer { .. })
        ));

        // re-registering the same peer is allowed
        manager
            .add_peer(Peer::new("MAIN-PACS", "10.0.0.11", 105).default_peer())
            .unwrap();
        assert_eq!(manager.default_peer().unwrap().port, 105);
    }

    #[test]
    fn invalid_peer_fails_registration() {
        let manager = ConnectionManager::new("QUERY-SCU");
        assert!(matches!(
            manager.add_peer(Peer::new("", "10.0.0.11", 104)),
            Err(Error::MissingPeerField { .. })
        ));
    }

    #[test]
    fn associate_requires_contexts() {
        let manager = ConnectionManager::new("QUERY-SCU");
        manager
            .add_peer(Peer::new("MAIN-PACS", "10.0.0.11", 104).default_peer())
            .unwrap();
        assert!(matches!(
            manager.associate(AssociateOptions::default()),
            Err(Error::ContextsMustBeSpecified { .. })
        ));
    }

    #[test]
    fn associate_requires_a_resolvable_peer() {
        let manager = ConnectionManager::new("QUERY-SCU");
        let options = AssociateOptions {
            peer: None,
            presentation_contexts: vec![(
                "1.2.840.10008.1.1".to_string(),
                vec!["1.2.840.10008.1.2".to_string()],
            )],
        };
        assert!(matches!(
            manager.associate(options),
            Err(Error::NoDefaultPeer { .. })
        ));
    }
}
