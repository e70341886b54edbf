//! Named local message endpoints for same-machine messaging.
//!
//! A [`MessagePort`] is a named, message-oriented endpoint backed by a Unix
//! datagram socket. The creator exclusively owns the endpoint; any other
//! process that knows the name can open a non-owning send path to it with
//! [`MessagePort::open`]. Message boundaries are preserved per send.
//!
//! This is the lowest layer of portbus. It has no protocol knowledge —
//! framing and connection semantics live in the crates above it.

pub mod error;
pub mod namespace;
pub mod port;

pub use error::{Result, TransportError};
pub use namespace::PortNamespace;
pub use port::{MessagePort, PortOpener, PortSender};
