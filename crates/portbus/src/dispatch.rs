//! The background execution context that pumps incoming frames.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use portbus_frame::{decode_frame, Frame, HEADER_SIZE};
use portbus_transport::{MessagePort, PortSender};
use tracing::{debug, warn};

use crate::error::Result;

/// The seam between a dispatch loop and the session or registry owning it.
pub trait FrameHandler: Send + 'static {
    /// Handle one decoded inbound frame.
    ///
    /// `sender` is the sending port's name when the message was sent from a
    /// named port in the same namespace.
    fn on_frame(&self, frame: Frame, sender: Option<&str>);
}

/// A dedicated thread pumping one port: receive, decode, dispatch.
///
/// A malformed inbound frame is logged and dropped; the loop only exits via
/// [`DispatchLoop::stop`] (or drop), which joins the thread before returning
/// so the owning session or registry can be destroyed safely afterwards.
pub struct DispatchLoop {
    stop: Arc<AtomicBool>,
    wake: PortSender,
    handle: Option<JoinHandle<()>>,
    port_name: String,
}

impl DispatchLoop {
    /// Take ownership of `port` and start pumping it on a new thread.
    pub fn spawn<H: FrameHandler>(port: MessagePort, handler: H, max_payload: usize) -> Result<Self> {
        // Send path back to our own port, used to unblock recv on stop.
        let wake = MessagePort::open(port.namespace(), port.name())?;
        let stop = Arc::new(AtomicBool::new(false));
        let port_name = port.name().to_string();
        let thread_stop = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name(format!("portbus-{port_name}"))
            .spawn(move || run(port, handler, thread_stop, max_payload))
            .map_err(portbus_transport::TransportError::Io)?;
        Ok(Self {
            stop,
            wake,
            handle: Some(handle),
            port_name,
        })
    }

    /// Signal the loop to exit and join its thread.
    ///
    /// Safe to call from any thread except the loop's own. The current frame,
    /// if one is mid-dispatch, completes before the loop exits.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.stop.store(true, Ordering::Release);
        // Zero-byte wake message; consumed by the loop, never dispatched.
        if let Err(err) = self.wake.send(&[]) {
            debug!(port = %self.port_name, %err, "wake send failed");
        }
        if handle.join().is_err() {
            warn!(port = %self.port_name, "dispatch thread panicked");
        }
    }
}

impl Drop for DispatchLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run<H: FrameHandler>(port: MessagePort, handler: H, stop: Arc<AtomicBool>, max_payload: usize) {
    let mut buf = vec![0u8; HEADER_SIZE + max_payload];
    debug!(port = %port.name(), "dispatch loop started");
    loop {
        let (len, sender) = match port.recv(&mut buf) {
            Ok(received) => received,
            Err(err) => {
                if stop.load(Ordering::Acquire) {
                    break;
                }
                warn!(port = %port.name(), %err, "receive failed");
                continue;
            }
        };
        if stop.load(Ordering::Acquire) {
            break;
        }
        if len == 0 {
            continue;
        }
        match decode_frame(&buf[..len], max_payload) {
            Ok(frame) => handler.on_frame(frame, sender.as_deref()),
            Err(err) => warn!(port = %port.name(), %err, "dropping malformed frame"),
        }
    }
    debug!(port = %port.name(), "dispatch loop stopped");
}
