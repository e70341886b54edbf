//! End-to-end publish/subscribe scenarios: one server, several clients,
//! exercised over real sockets under a per-test namespace.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use portbus::frame::{encode_frame, MessageKind, DEFAULT_MAX_PAYLOAD};
use portbus::transport::MessagePort;
use portbus::{
    BusError, Client, ClientEvents, ConnectionState, NoEvents, PortNamespace, Server, ServerEvents,
};

const WAIT: Duration = Duration::from_secs(2);

fn test_namespace(tag: &str) -> PortNamespace {
    PortNamespace::new(std::env::temp_dir().join(format!(
        "portbus-e2e-{}-{}-{}",
        tag,
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    )))
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + WAIT;
    while std::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

#[derive(Default)]
struct ServerRecorder {
    messages: Mutex<Vec<(String, Vec<u8>)>>,
    connected: Mutex<Vec<String>>,
    disconnected: Mutex<Vec<String>>,
}

impl ServerRecorder {
    fn message_count(&self) -> usize {
        self.messages.lock().unwrap().len()
    }
}

impl ServerEvents for ServerRecorder {
    fn on_message(&self, sender: &str, payload: &[u8]) -> bool {
        self.messages
            .lock()
            .unwrap()
            .push((sender.to_string(), payload.to_vec()));
        true
    }

    fn on_client_connected(&self, name: &str) {
        self.connected.lock().unwrap().push(name.to_string());
    }

    fn on_client_disconnected(&self, name: &str) {
        self.disconnected.lock().unwrap().push(name.to_string());
    }
}

#[derive(Default)]
struct ClientRecorder {
    messages: Mutex<Vec<Vec<u8>>>,
    connected: AtomicU32,
    disconnected: AtomicU32,
}

impl ClientRecorder {
    fn message_count(&self) -> usize {
        self.messages.lock().unwrap().len()
    }
}

impl ClientEvents for ClientRecorder {
    fn on_message(&self, payload: &[u8]) {
        self.messages.lock().unwrap().push(payload.to_vec());
    }

    fn on_connected(&self) {
        self.connected.fetch_add(1, Ordering::SeqCst);
    }

    fn on_disconnected(&self) {
        self.disconnected.fetch_add(1, Ordering::SeqCst);
    }
}

fn connected_client(ns: &PortNamespace, server_name: &str) -> (Client, Arc<ClientRecorder>) {
    let recorder = Arc::new(ClientRecorder::default());
    let client = Client::new(ns, Arc::clone(&recorder));
    client.connect(server_name).expect("client should connect");
    assert!(client.wait_connected(WAIT), "handshake should complete");
    (client, recorder)
}

#[test]
fn handshake_transitions_to_connected() {
    let ns = test_namespace("handshake");
    let server = Server::start(&ns, "svc", NoEvents).unwrap();

    let recorder = Arc::new(ClientRecorder::default());
    let client = Client::new(&ns, Arc::clone(&recorder));

    let err = client.send(b"early", false).unwrap_err();
    assert!(matches!(err, BusError::NotConnected));

    client.connect("svc").unwrap();
    assert!(client.wait_connected(WAIT));
    assert_eq!(recorder.connected.load(Ordering::SeqCst), 1);

    let name = client.port_name().expect("connected client has a port");
    assert!(wait_until(|| server.client_names().contains(&name)));

    let _ = std::fs::remove_dir_all(ns.root());
}

#[test]
fn connect_while_active_is_rejected() {
    let ns = test_namespace("double");
    let _server = Server::start(&ns, "svc", NoEvents).unwrap();
    let (client, _) = connected_client(&ns, "svc");

    let err = client.connect("svc").unwrap_err();
    assert!(matches!(err, BusError::AlreadyConnecting));

    let _ = std::fs::remove_dir_all(ns.root());
}

#[test]
fn point_to_point_message_reaches_server_callback() {
    let ns = test_namespace("p2p");
    let recorder = Arc::new(ServerRecorder::default());
    let _server = Server::start(&ns, "svc", Arc::clone(&recorder)).unwrap();
    let (client, _) = connected_client(&ns, "svc");

    client.send(b"report", false).unwrap();

    assert!(wait_until(|| recorder.message_count() == 1));
    let messages = recorder.messages.lock().unwrap();
    assert_eq!(messages[0].0, client.port_name().unwrap());
    assert_eq!(messages[0].1, b"report");

    let _ = std::fs::remove_dir_all(ns.root());
}

#[test]
fn broadcast_relayed_to_all_but_sender() {
    let ns = test_namespace("broadcast");
    let server_recorder = Arc::new(ServerRecorder::default());
    let _server = Server::start(&ns, "svc", Arc::clone(&server_recorder)).unwrap();

    let (c1, r1) = connected_client(&ns, "svc");
    let (_c2, r2) = connected_client(&ns, "svc");
    let (_c3, r3) = connected_client(&ns, "svc");

    c1.send(&[1, 2, 3], true).unwrap();

    assert!(wait_until(|| r2.message_count() == 1 && r3.message_count() == 1));
    assert_eq!(r2.messages.lock().unwrap()[0], vec![1, 2, 3]);
    assert_eq!(r3.messages.lock().unwrap()[0], vec![1, 2, 3]);

    // The sender never hears its own broadcast and the server's message
    // callback is not invoked for relayed frames.
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(r1.message_count(), 0);
    assert_eq!(server_recorder.message_count(), 0);

    let _ = std::fs::remove_dir_all(ns.root());
}

#[test]
fn push_to_all_reaches_every_client() {
    let ns = test_namespace("fanout");
    let server = Server::start(&ns, "svc", NoEvents).unwrap();
    let (_c1, r1) = connected_client(&ns, "svc");
    let (_c2, r2) = connected_client(&ns, "svc");

    let delivered = server.push_to_all(b"everyone").unwrap();
    assert_eq!(delivered, 2);

    assert!(wait_until(|| r1.message_count() == 1 && r2.message_count() == 1));
    assert_eq!(r1.messages.lock().unwrap()[0], b"everyone");
    assert_eq!(r2.messages.lock().unwrap()[0], b"everyone");

    let _ = std::fs::remove_dir_all(ns.root());
}

#[test]
fn push_to_all_counts_out_broken_endpoint() {
    let ns = test_namespace("broken");
    let server = Server::start(&ns, "svc", NoEvents).unwrap();
    let (_c1, r1) = connected_client(&ns, "svc");

    // Register a client by hand, then tear its port down without a
    // disconnect frame so its endpoint is broken but still registered.
    let ghost = MessagePort::create(&ns, "ghost").unwrap();
    let to_server = MessagePort::open(&ns, "svc").unwrap();
    let mut wire = BytesMut::new();
    encode_frame(
        MessageKind::ClientConnection,
        false,
        b"ghost",
        &mut wire,
        DEFAULT_MAX_PAYLOAD,
    )
    .unwrap();
    to_server.send(&wire).unwrap();
    assert!(wait_until(|| server.client_count() == 2));
    drop(ghost);

    let delivered = server.push_to_all(b"partial").unwrap();
    assert_eq!(delivered, 1, "broken endpoint is counted out");
    assert_eq!(server.client_count(), 2, "failed session stays registered");
    assert_eq!(server.failed_clients(), vec!["ghost".to_string()]);

    assert!(wait_until(|| r1.message_count() == 1));

    let _ = std::fs::remove_dir_all(ns.root());
}

#[test]
fn registry_tracks_connects_and_disconnects() {
    let ns = test_namespace("registry");
    let recorder = Arc::new(ServerRecorder::default());
    let server = Server::start(&ns, "svc", Arc::clone(&recorder)).unwrap();

    let (c1, _) = connected_client(&ns, "svc");
    let (c2, _) = connected_client(&ns, "svc");
    let n1 = c1.port_name().unwrap();
    let n2 = c2.port_name().unwrap();

    let mut names = server.client_names();
    names.sort();
    let mut expected = vec![n1.clone(), n2.clone()];
    expected.sort();
    assert_eq!(names, expected);

    c1.disconnect().unwrap();
    assert!(wait_until(|| server.client_names() == vec![n2.clone()]));
    assert_eq!(recorder.disconnected.lock().unwrap().as_slice(), &[n1]);

    // Terminal until a new connect attempt; a fresh connect registers again
    // under a new private port name.
    c1.connect("svc").unwrap();
    assert!(c1.wait_connected(WAIT));
    assert!(wait_until(|| server.client_count() == 2));

    let _ = std::fs::remove_dir_all(ns.root());
}

#[test]
fn disconnect_is_idempotent_with_no_duplicate_frame() {
    let ns = test_namespace("idempotent");
    let recorder = Arc::new(ServerRecorder::default());
    let _server = Server::start(&ns, "svc", Arc::clone(&recorder)).unwrap();
    let (client, client_recorder) = connected_client(&ns, "svc");

    client.disconnect().unwrap();
    assert!(wait_until(|| recorder.disconnected.lock().unwrap().len() == 1));

    client.disconnect().unwrap();
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(recorder.disconnected.lock().unwrap().len(), 1);
    assert_eq!(client_recorder.disconnected.load(Ordering::SeqCst), 1);

    let err = client.send(b"late", false).unwrap_err();
    assert!(matches!(err, BusError::NotConnected));

    let _ = std::fs::remove_dir_all(ns.root());
}

#[test]
fn duplicate_connection_response_is_ignored() {
    let ns = test_namespace("dupresp");
    let _server = Server::start(&ns, "svc", NoEvents).unwrap();
    let (client, recorder) = connected_client(&ns, "svc");

    // Re-announce the client's name by hand; the server refreshes the
    // session and acknowledges again, which the client must ignore.
    let to_server = MessagePort::open(&ns, "svc").unwrap();
    let mut wire = BytesMut::new();
    encode_frame(
        MessageKind::ClientConnection,
        false,
        client.port_name().unwrap().as_bytes(),
        &mut wire,
        DEFAULT_MAX_PAYLOAD,
    )
    .unwrap();
    to_server.send(&wire).unwrap();

    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(recorder.connected.load(Ordering::SeqCst), 1);
    assert!(client.send(b"still fine", false).is_ok());

    let _ = std::fs::remove_dir_all(ns.root());
}

#[test]
fn example_scenario_end_to_end() {
    let ns = test_namespace("scenario");
    let server_recorder = Arc::new(ServerRecorder::default());
    let server = Server::start(&ns, "svc", Arc::clone(&server_recorder)).unwrap();

    let (c1, r1) = connected_client(&ns, "svc");
    let (_c2, r2) = connected_client(&ns, "svc");

    c1.send(&[1, 2, 3], true).unwrap();
    assert!(wait_until(|| r2.message_count() == 1));
    assert_eq!(r2.messages.lock().unwrap()[0], vec![1, 2, 3]);
    assert_eq!(r1.message_count(), 0);

    let delivered = server.push_to_all(&[9, 9]).unwrap();
    assert_eq!(delivered, 2);
    assert!(wait_until(|| r1.message_count() == 1 && r2.message_count() == 2));
    assert_eq!(r1.messages.lock().unwrap()[0], vec![9, 9]);
    assert_eq!(r2.messages.lock().unwrap()[1], vec![9, 9]);

    let _ = std::fs::remove_dir_all(ns.root());
}

#[test]
fn send_failure_returns_client_to_disconnected() {
    let ns = test_namespace("gone");
    let server = Server::start(&ns, "svc", NoEvents).unwrap();
    let (client, recorder) = connected_client(&ns, "svc");

    drop(server);

    let err = client.send(b"anyone there", false).unwrap_err();
    assert!(matches!(err, BusError::Transport(_)));
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(client.port_name(), None);
    assert_eq!(recorder.disconnected.load(Ordering::SeqCst), 1);

    // Terminal until a new connect attempt.
    let err = client.send(b"again", false).unwrap_err();
    assert!(matches!(err, BusError::NotConnected));
    assert_eq!(recorder.disconnected.load(Ordering::SeqCst), 1);

    let _ = std::fs::remove_dir_all(ns.root());
}
