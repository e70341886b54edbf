//! The client side of a connection: private port, handshake, send path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::BytesMut;
use portbus_frame::{encode_frame, Frame, MessageKind, DEFAULT_MAX_PAYLOAD};
use portbus_transport::{MessagePort, PortNamespace, PortSender, TransportError};
use tracing::{debug, warn};

use crate::dispatch::{DispatchLoop, FrameHandler};
use crate::error::{BusError, Result};
use crate::events::ClientEvents;

/// Client connection lifecycle.
///
/// `Connecting` is entered once the `ClientConnection` frame is sent;
/// `Connected` only on receipt of `ServerConnectionResponse`. Any transport
/// failure or explicit disconnect returns to `Disconnected`, which is
/// terminal until a new connect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Client behavior configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How many random port names to try before `NameExhausted`.
    pub name_attempts: u32,
    /// Maximum payload size accepted and produced, in bytes.
    pub max_payload: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name_attempts: 8,
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }
}

/// One client connection to a publish/subscribe server.
///
/// All operations are safe to call from arbitrary threads, concurrently with
/// the dispatch thread delivering callbacks. There is no implicit reconnect
/// and no built-in connect timeout: a client stuck in `Connecting` stays
/// there until the caller decides to wait ([`Client::wait_connected`]) or
/// abandon ([`Client::disconnect`]).
pub struct Client {
    inner: Arc<ClientInner>,
    dispatch: Mutex<Option<DispatchLoop>>,
}

impl Client {
    /// Create a disconnected client. No I/O happens until `connect`.
    pub fn new(namespace: &PortNamespace, events: impl ClientEvents) -> Self {
        Self::with_config(namespace, events, ClientConfig::default())
    }

    /// Create a disconnected client with explicit configuration.
    pub fn with_config(
        namespace: &PortNamespace,
        events: impl ClientEvents,
        config: ClientConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                namespace: namespace.clone(),
                config,
                conn: Mutex::new(Conn {
                    state: ConnectionState::Disconnected,
                    own_name: None,
                    server: None,
                }),
                state_changed: Condvar::new(),
                next_seq: AtomicU64::new(0),
                events: Box::new(events),
            }),
            dispatch: Mutex::new(None),
        }
    }

    /// Claim a private port, announce to the server, enter `Connecting`.
    ///
    /// Returns once the `ClientConnection` frame is sent; the transition to
    /// `Connected` happens when the server's response arrives on the dispatch
    /// thread. Fails with `AlreadyConnecting` unless currently disconnected.
    pub fn connect(&self, server_name: &str) -> Result<()> {
        {
            let mut conn = self.inner.lock_conn();
            if conn.state != ConnectionState::Disconnected {
                return Err(BusError::AlreadyConnecting);
            }
            conn.state = ConnectionState::Connecting;
        }
        match self.try_connect(server_name) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.teardown(Teardown::Quiet);
                Err(err)
            }
        }
    }

    fn try_connect(&self, server_name: &str) -> Result<()> {
        let port = self.claim_port()?;
        let own_name = port.name().to_string();
        let server = Arc::new(port.opener()?.open(server_name)?);

        let mut wire = BytesMut::new();
        encode_frame(
            MessageKind::ClientConnection,
            false,
            own_name.as_bytes(),
            &mut wire,
            self.inner.config.max_payload,
        )?;

        let handler = ClientHandler {
            inner: Arc::clone(&self.inner),
        };
        let dispatch = DispatchLoop::spawn(port, handler, self.inner.config.max_payload)?;
        *self.lock_dispatch() = Some(dispatch);

        {
            let mut conn = self.inner.lock_conn();
            // A racing disconnect wins; the caller's attempt is abandoned.
            if conn.state != ConnectionState::Connecting {
                return Err(BusError::NotConnected);
            }
            conn.own_name = Some(own_name.clone());
            conn.server = Some(Arc::clone(&server));
        }

        server.send(&wire)?;
        debug!(server = server_name, port = %own_name, "connection requested");
        Ok(())
    }

    /// Create a private port under a random name, retrying on collisions.
    fn claim_port(&self) -> Result<MessagePort> {
        let attempts = self.inner.config.name_attempts;
        for _ in 0..attempts {
            let name = format!("client-{:016x}", rand::random::<u64>());
            match MessagePort::create(&self.inner.namespace, &name) {
                Ok(port) => return Ok(port),
                Err(TransportError::NameInUse { .. }) => {
                    debug!(name, "port name collision; retrying");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(BusError::NameExhausted { attempts })
    }

    /// Send an application payload to the server.
    ///
    /// Only valid while `Connected`. With `broadcast` set, the server relays
    /// the payload to every other connected client instead of handling it
    /// itself. A transport failure tears the connection down (firing
    /// `on_disconnected`) before the error is returned.
    pub fn send(&self, payload: &[u8], broadcast: bool) -> Result<()> {
        let server = {
            let conn = self.inner.lock_conn();
            if conn.state != ConnectionState::Connected {
                return Err(BusError::NotConnected);
            }
            conn.server.as_ref().map(Arc::clone).ok_or(BusError::NotConnected)?
        };
        let mut wire = BytesMut::new();
        encode_frame(
            MessageKind::Message,
            broadcast,
            payload,
            &mut wire,
            self.inner.config.max_payload,
        )?;
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        if let Err(err) = server.send(&wire) {
            warn!(%err, "send failed; disconnecting");
            // The server port is gone; there is nobody to announce to.
            self.teardown(Teardown::PeerLost);
            return Err(err.into());
        }
        debug!(seq, len = payload.len(), broadcast, "message sent");
        Ok(())
    }

    /// Leave the server and release the private port.
    ///
    /// Sends `ClientDisconnection` if a connection attempt was active, stops
    /// the dispatch loop, and returns to `Disconnected`. Idempotent: a second
    /// call is `Ok` and emits no duplicate frame.
    pub fn disconnect(&self) -> Result<()> {
        self.teardown(Teardown::Announce);
        Ok(())
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.lock_conn().state
    }

    /// The name of the client's private port, while one is claimed.
    pub fn port_name(&self) -> Option<String> {
        self.inner.lock_conn().own_name.clone()
    }

    /// Block until `Connected` or the caller-chosen timeout elapses.
    ///
    /// Returns whether the client is connected. This is the only waiting
    /// policy offered; the protocol itself never times a connection out.
    pub fn wait_connected(&self, timeout: Duration) -> bool {
        let conn = self.inner.lock_conn();
        let (conn, _timed_out) = self
            .inner
            .state_changed
            .wait_timeout_while(conn, timeout, |conn| {
                conn.state != ConnectionState::Connected
            })
            .unwrap_or_else(PoisonError::into_inner);
        conn.state == ConnectionState::Connected
    }

    fn lock_dispatch(&self) -> MutexGuard<'_, Option<DispatchLoop>> {
        self.dispatch.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Common teardown for disconnects, failed connect attempts and dead
    /// transports. The mode decides whether the server is told and whether
    /// `on_disconnected` fires.
    fn teardown(&self, mode: Teardown) {
        let (was, server, own_name) = {
            let mut conn = self.inner.lock_conn();
            let was = conn.state;
            conn.state = ConnectionState::Disconnected;
            self.inner.state_changed.notify_all();
            (was, conn.server.take(), conn.own_name.take())
        };
        if was == ConnectionState::Disconnected && server.is_none() {
            return;
        }

        if mode == Teardown::Announce && was != ConnectionState::Disconnected {
            if let (Some(server), Some(own_name)) = (&server, &own_name) {
                let mut wire = BytesMut::new();
                match encode_frame(
                    MessageKind::ClientDisconnection,
                    false,
                    own_name.as_bytes(),
                    &mut wire,
                    self.inner.config.max_payload,
                ) {
                    Ok(()) => {
                        if let Err(err) = server.send(&wire) {
                            debug!(%err, "disconnect announce failed");
                        }
                    }
                    Err(err) => warn!(%err, "encoding disconnect frame failed"),
                }
            }
        }

        // Joining the loop also drops the private port and its socket file.
        if let Some(dispatch) = self.lock_dispatch().take() {
            dispatch.stop();
        }

        if mode != Teardown::Quiet && was != ConnectionState::Disconnected {
            debug!("disconnected");
            self.inner.events.on_disconnected();
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.teardown(Teardown::Announce);
    }
}

/// How much the peer hears about a teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Teardown {
    /// Orderly leave: send `ClientDisconnection`, fire `on_disconnected`.
    Announce,
    /// Unwind a connect attempt that never completed; no frame, no callback.
    Quiet,
    /// The transport already failed, so skip the frame but still fire
    /// `on_disconnected`.
    PeerLost,
}

struct ClientInner {
    namespace: PortNamespace,
    config: ClientConfig,
    conn: Mutex<Conn>,
    state_changed: Condvar,
    next_seq: AtomicU64,
    events: Box<dyn ClientEvents>,
}

struct Conn {
    state: ConnectionState,
    own_name: Option<String>,
    server: Option<Arc<PortSender>>,
}

impl ClientInner {
    fn lock_conn(&self) -> MutexGuard<'_, Conn> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct ClientHandler {
    inner: Arc<ClientInner>,
}

impl FrameHandler for ClientHandler {
    fn on_frame(&self, frame: Frame, _sender: Option<&str>) {
        match frame.kind {
            MessageKind::ServerConnectionResponse => {
                let fire = {
                    let mut conn = self.inner.lock_conn();
                    if conn.state == ConnectionState::Connecting {
                        conn.state = ConnectionState::Connected;
                        true
                    } else {
                        debug!("duplicate connection response ignored");
                        false
                    }
                };
                if fire {
                    debug!("connected");
                    // Callback first, then release waiters: wait_connected
                    // implies on_connected has already fired.
                    self.inner.events.on_connected();
                    self.inner.state_changed.notify_all();
                }
            }
            MessageKind::Message => self.inner.events.on_message(&frame.payload),
            MessageKind::ClientConnection | MessageKind::ClientDisconnection => {
                warn!(kind = ?frame.kind, "unexpected frame on client port; discarding");
            }
        }
    }
}
