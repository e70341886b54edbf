//! The server registry: the well-known inbound port, the set of registered
//! client sessions, and broadcast fan-out.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::BytesMut;
use portbus_frame::{encode_frame, Frame, MessageKind, DEFAULT_MAX_PAYLOAD};
use portbus_transport::{MessagePort, PortNamespace, PortOpener};
use tracing::{debug, info, warn};

use crate::dispatch::{DispatchLoop, FrameHandler};
use crate::error::{BusError, Result};
use crate::events::ServerEvents;
use crate::session::{ClientSession, SessionLink};

/// Server behavior configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Maximum payload size accepted and produced, in bytes.
    pub max_payload: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }
}

/// One publish/subscribe server instance.
///
/// Owns the well-known port named at [`Server::start`] and a registry mapping
/// client names to their outbound endpoints. Lives until [`Server::shutdown`]
/// or drop; the registry is the single source of truth for who receives a
/// broadcast.
pub struct Server {
    inner: Arc<ServerInner>,
    dispatch: Option<DispatchLoop>,
}

impl Server {
    /// Create the well-known port and start dispatching.
    ///
    /// Fails with `NameInUse` if another live process owns `name`.
    pub fn start(
        namespace: &PortNamespace,
        name: &str,
        events: impl ServerEvents,
    ) -> Result<Self> {
        Self::start_with_config(namespace, name, events, ServerConfig::default())
    }

    /// Start with explicit configuration.
    pub fn start_with_config(
        namespace: &PortNamespace,
        name: &str,
        events: impl ServerEvents,
        config: ServerConfig,
    ) -> Result<Self> {
        let port = MessagePort::create(namespace, name)?;
        let opener = port.opener()?;
        let inner = Arc::new(ServerInner {
            name: name.to_string(),
            opener,
            sessions: Mutex::new(HashMap::new()),
            stopping: AtomicBool::new(false),
            next_seq: AtomicU64::new(0),
            events: Box::new(events),
            max_payload: config.max_payload,
        });
        let handler = ServerHandler {
            inner: Arc::clone(&inner),
        };
        let dispatch = DispatchLoop::spawn(port, handler, config.max_payload)?;
        info!(name, "server started");
        Ok(Self {
            inner,
            dispatch: Some(dispatch),
        })
    }

    /// The server's well-known port name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Names of all currently registered clients.
    pub fn client_names(&self) -> Vec<String> {
        self.inner.lock_sessions().keys().cloned().collect()
    }

    /// Number of currently registered clients.
    pub fn client_count(&self) -> usize {
        self.inner.lock_sessions().len()
    }

    /// Names of registered clients whose last send failed.
    pub fn failed_clients(&self) -> Vec<String> {
        self.inner
            .lock_sessions()
            .values()
            .filter(|session| session.has_failed())
            .map(|session| session.name().to_string())
            .collect()
    }

    /// Send `payload` to every registered client as a `Message` frame.
    ///
    /// Returns the number of clients the frame was delivered to. A failing
    /// client is counted out and logged but never aborts delivery to the
    /// others. Rejected with `ShuttingDown` once shutdown has begun.
    pub fn push_to_all(&self, payload: &[u8]) -> Result<usize> {
        if self.inner.stopping.load(Ordering::Acquire) {
            return Err(BusError::ShuttingDown);
        }
        self.inner.push_to_all(payload)
    }

    /// Stop dispatching, unregister all clients, and release the port.
    ///
    /// Joins the dispatch thread before returning. Idempotent; also runs on
    /// drop.
    pub fn shutdown(&mut self) {
        if self.inner.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(dispatch) = self.dispatch.take() {
            dispatch.stop();
        }
        self.inner.lock_sessions().clear();
        info!(name = %self.inner.name, "server stopped");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("name", &self.inner.name)
            .field("clients", &self.client_count())
            .finish()
    }
}

struct ServerInner {
    name: String,
    opener: PortOpener,
    sessions: Mutex<HashMap<String, ClientSession>>,
    stopping: AtomicBool,
    next_seq: AtomicU64,
    events: Box<dyn ServerEvents>,
    max_payload: usize,
}

enum ConnectOutcome {
    Fresh(SessionLink),
    Refreshed(SessionLink),
    Failed,
}

impl ServerInner {
    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<String, ClientSession>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push_to_all(&self, payload: &[u8]) -> Result<usize> {
        let mut wire = BytesMut::new();
        encode_frame(
            MessageKind::Message,
            false,
            payload,
            &mut wire,
            self.max_payload,
        )?;
        let links: Vec<SessionLink> =
            self.lock_sessions().values().map(ClientSession::link).collect();
        let total = links.len();
        let mut delivered = 0;
        for link in links {
            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            match link.send(&wire) {
                Ok(()) => delivered += 1,
                Err(err) => warn!(client = %link.name, seq, %err, "fan-out send failed"),
            }
        }
        debug!(delivered, total, "pushed message to all clients");
        Ok(delivered)
    }

    fn handle_connection(&self, payload: &[u8]) {
        let Some(name) = client_name(payload) else {
            warn!("connection frame without a valid client name; dropping");
            return;
        };
        let outcome = {
            let mut sessions = self.lock_sessions();
            match sessions.entry(name.to_string()) {
                Entry::Occupied(mut entry) => match entry.get_mut().refresh(&self.opener) {
                    Ok(()) => ConnectOutcome::Refreshed(entry.get().link()),
                    Err(err) => {
                        warn!(client = name, %err, "re-announce refresh failed");
                        ConnectOutcome::Failed
                    }
                },
                Entry::Vacant(entry) => match ClientSession::register(&self.opener, name) {
                    Ok(session) => {
                        let link = session.link();
                        entry.insert(session);
                        ConnectOutcome::Fresh(link)
                    }
                    Err(err) => {
                        warn!(client = name, %err, "client registration failed");
                        ConnectOutcome::Failed
                    }
                },
            }
        };
        // On failure the client gets no response and stays in Connecting
        // from its own perspective.
        match outcome {
            ConnectOutcome::Fresh(link) => {
                self.send_connection_response(&link);
                self.events.on_client_connected(name);
            }
            ConnectOutcome::Refreshed(link) => {
                debug!(client = name, "idempotent re-announce");
                self.send_connection_response(&link);
            }
            ConnectOutcome::Failed => {}
        }
    }

    fn send_connection_response(&self, link: &SessionLink) {
        let mut wire = BytesMut::new();
        match encode_frame(
            MessageKind::ServerConnectionResponse,
            false,
            &[],
            &mut wire,
            self.max_payload,
        ) {
            Ok(()) => {
                if let Err(err) = link.send(&wire) {
                    warn!(client = %link.name, %err, "connection response send failed");
                }
            }
            Err(err) => warn!(%err, "encoding connection response failed"),
        }
    }

    fn handle_disconnection(&self, payload: &[u8]) {
        let Some(name) = client_name(payload) else {
            warn!("disconnection frame without a valid client name; dropping");
            return;
        };
        let removed = self.lock_sessions().remove(name).is_some();
        if removed {
            debug!(client = name, "unregistered client");
            self.events.on_client_disconnected(name);
        } else {
            debug!(client = name, "disconnect for unknown client; ignoring");
        }
    }

    fn handle_message(&self, frame: &Frame, sender: Option<&str>) {
        if frame.broadcast {
            self.relay(sender, &frame.payload);
        } else {
            let who = sender.unwrap_or("");
            let accept = self.events.on_message(who, &frame.payload);
            if !accept {
                debug!(sender = who, "host rejected message");
            }
        }
    }

    /// Relay a broadcast payload to every registered client except the
    /// sender. The relayed frame goes out with the broadcast bit cleared.
    fn relay(&self, from: Option<&str>, payload: &[u8]) {
        let mut wire = BytesMut::new();
        if let Err(err) = encode_frame(
            MessageKind::Message,
            false,
            payload,
            &mut wire,
            self.max_payload,
        ) {
            warn!(%err, "encoding broadcast relay failed");
            return;
        }
        let links: Vec<SessionLink> = self
            .lock_sessions()
            .values()
            .filter(|session| Some(session.name()) != from)
            .map(ClientSession::link)
            .collect();
        let mut relayed = 0;
        for link in links {
            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            match link.send(&wire) {
                Ok(()) => relayed += 1,
                Err(err) => warn!(client = %link.name, seq, %err, "broadcast relay send failed"),
            }
        }
        debug!(from = from.unwrap_or(""), relayed, "relayed broadcast");
    }
}

struct ServerHandler {
    inner: Arc<ServerInner>,
}

impl FrameHandler for ServerHandler {
    fn on_frame(&self, frame: Frame, sender: Option<&str>) {
        match frame.kind {
            MessageKind::ClientConnection => self.inner.handle_connection(&frame.payload),
            MessageKind::ClientDisconnection => self.inner.handle_disconnection(&frame.payload),
            MessageKind::Message => self.inner.handle_message(&frame, sender),
            MessageKind::ServerConnectionResponse => {
                warn!("unexpected connection response on server port; discarding");
            }
        }
    }
}

fn client_name(payload: &[u8]) -> Option<&str> {
    match std::str::from_utf8(payload) {
        Ok(name) if !name.is_empty() => Some(name),
        _ => None,
    }
}
