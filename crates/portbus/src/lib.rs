//! Local publish/subscribe messaging between one long-lived server process
//! and many short-lived client processes on the same machine.
//!
//! A server owns a well-known named port. A client claims a private port
//! under a random name, announces itself to the server, and is registered
//! once the server opens a path back and acknowledges. After that either
//! side exchanges opaque `Message` frames: the server can fan a payload out
//! to all clients with [`Server::push_to_all`], and a client can mark a send
//! as broadcast to have the server relay it to every other client.
//!
//! ```no_run
//! use portbus::{Client, NoEvents, PortNamespace, Server};
//!
//! let ns = PortNamespace::system();
//! let server = Server::start(&ns, "svc", NoEvents)?;
//!
//! let client = Client::new(&ns, NoEvents);
//! client.connect("svc")?;
//! client.wait_connected(std::time::Duration::from_secs(1));
//! client.send(b"hello", false)?;
//! server.push_to_all(b"to everyone")?;
//! # Ok::<(), portbus::BusError>(())
//! ```
//!
//! Messages are delivered on a dedicated dispatch thread per server and per
//! client; host callbacks run on that thread. Clients never see each other's
//! ports — all relay goes through the server's registry.

pub mod client;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod server;
mod session;

pub use portbus_frame as frame;
pub use portbus_transport as transport;

pub use client::{Client, ClientConfig, ConnectionState};
pub use dispatch::{DispatchLoop, FrameHandler};
pub use error::{BusError, Result};
pub use events::{ClientEvents, NoEvents, ServerEvents};
pub use server::{Server, ServerConfig};
pub use transport::PortNamespace;
