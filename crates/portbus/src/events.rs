//! Host application callbacks.
//!
//! Callbacks run on the dispatch thread of the owning server or client; they
//! must not call back into operations that stop and join that thread.

/// Server-side host callbacks.
pub trait ServerEvents: Send + Sync + 'static {
    /// Invoked once per non-broadcast `Message` received from a client.
    ///
    /// The return value is advisory: a `false` is logged, suppression policy
    /// is host-defined.
    fn on_message(&self, sender: &str, payload: &[u8]) -> bool {
        let _ = (sender, payload);
        true
    }

    /// A client completed registration.
    fn on_client_connected(&self, name: &str) {
        let _ = name;
    }

    /// A client was unregistered.
    fn on_client_disconnected(&self, name: &str) {
        let _ = name;
    }
}

/// Client-side host callbacks.
pub trait ClientEvents: Send + Sync + 'static {
    /// Invoked once per `Message` received from the server.
    fn on_message(&self, payload: &[u8]) {
        let _ = payload;
    }

    /// The server acknowledged the connection.
    fn on_connected(&self) {}

    /// The connection was torn down.
    fn on_disconnected(&self) {}
}

/// No-op callbacks for hosts that do not observe events.
pub struct NoEvents;

impl ServerEvents for NoEvents {}
impl ClientEvents for NoEvents {}

impl<T: ServerEvents + ?Sized> ServerEvents for std::sync::Arc<T> {
    fn on_message(&self, sender: &str, payload: &[u8]) -> bool {
        (**self).on_message(sender, payload)
    }

    fn on_client_connected(&self, name: &str) {
        (**self).on_client_connected(name);
    }

    fn on_client_disconnected(&self, name: &str) {
        (**self).on_client_disconnected(name);
    }
}

impl<T: ClientEvents + ?Sized> ClientEvents for std::sync::Arc<T> {
    fn on_message(&self, payload: &[u8]) {
        (**self).on_message(payload);
    }

    fn on_connected(&self) {
        (**self).on_connected();
    }

    fn on_disconnected(&self) {
        (**self).on_disconnected();
    }
}
