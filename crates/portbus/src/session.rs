use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use portbus_transport::{PortOpener, PortSender};
use tracing::debug;

use crate::error::Result;

/// Server-side bookkeeping for one connected client.
///
/// Created when a `ClientConnection` announces a name not already registered,
/// destroyed on `ClientDisconnection` or server shutdown. A failed send marks
/// the session failed but does not remove it; removal only happens through an
/// explicit disconnect or shutdown.
pub(crate) struct ClientSession {
    name: String,
    sender: Arc<PortSender>,
    failed: Arc<AtomicBool>,
}

impl ClientSession {
    /// Open the outbound endpoint to the client's port.
    ///
    /// Fails if the client's port cannot be opened; the caller then registers
    /// nothing and sends no connection response.
    pub fn register(opener: &PortOpener, name: &str) -> Result<Self> {
        let sender = opener.open(name)?;
        debug!(client = name, "registered client session");
        Ok(Self {
            name: name.to_string(),
            sender: Arc::new(sender),
            failed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Replace the outbound endpoint after an idempotent re-announce.
    pub fn refresh(&mut self, opener: &PortOpener) -> Result<()> {
        self.sender = Arc::new(opener.open(&self.name)?);
        self.failed.store(false, Ordering::Release);
        debug!(client = %self.name, "refreshed client session");
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// A send handle detached from the registry lock.
    pub fn link(&self) -> SessionLink {
        SessionLink {
            name: self.name.clone(),
            sender: Arc::clone(&self.sender),
            failed: Arc::clone(&self.failed),
        }
    }
}

/// A send handle read out of the registry under the lock; the send itself
/// proceeds without holding it. A transport failure marks the session failed.
pub(crate) struct SessionLink {
    pub name: String,
    sender: Arc<PortSender>,
    failed: Arc<AtomicBool>,
}

impl SessionLink {
    pub fn send(&self, wire: &[u8]) -> Result<()> {
        match self.sender.send(wire) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.failed.store(true, Ordering::Release);
                Err(err.into())
            }
        }
    }
}
