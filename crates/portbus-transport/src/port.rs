use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::os::unix::net::UnixDatagram;
use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::namespace::PortNamespace;

/// An owned, named message endpoint.
///
/// Created with [`MessagePort::create`]; the creator exclusively owns the
/// endpoint and the socket file is removed on drop. Peers that know the name
/// hold a [`PortSender`] — a non-owning send path — obtained either
/// anonymously via [`MessagePort::open`] or attributed via [`PortOpener`].
pub struct MessagePort {
    socket: UnixDatagram,
    namespace: PortNamespace,
    name: String,
    path: PathBuf,
    created_inode: Option<(u64, u64)>,
}

impl MessagePort {
    /// Default permission mode for created socket paths.
    pub const DEFAULT_SOCKET_MODE: u32 = 0o600;

    /// Create and exclusively own a named endpoint.
    ///
    /// Fails with `NameInUse` if another live process owns the name. A stale
    /// socket file left behind by a crashed owner is reclaimed: removed and
    /// the bind retried once. Existing non-socket files are never removed.
    pub fn create(namespace: &PortNamespace, name: &str) -> Result<Self> {
        let path = namespace.path_for(name)?;
        std::fs::create_dir_all(namespace.root())?;

        let socket = match UnixDatagram::bind(&path) {
            Ok(socket) => socket,
            Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
                Self::reclaim_stale(name, &path)?;
                match UnixDatagram::bind(&path) {
                    Ok(socket) => socket,
                    Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
                        return Err(TransportError::NameInUse {
                            name: name.to_string(),
                        });
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            Err(err) => return Err(err.into()),
        };

        std::fs::set_permissions(
            &path,
            std::fs::Permissions::from_mode(Self::DEFAULT_SOCKET_MODE),
        )?;
        let metadata = std::fs::symlink_metadata(&path)?;
        let created_inode = Some((metadata.dev(), metadata.ino()));

        info!(name, ?path, "created message port");

        Ok(Self {
            socket,
            namespace: namespace.clone(),
            name: name.to_string(),
            path,
            created_inode,
        })
    }

    /// Fail with `NameInUse` if a live owner answers on `path`, otherwise
    /// remove the stale socket file so the caller can rebind.
    fn reclaim_stale(name: &str, path: &PathBuf) -> Result<()> {
        let metadata = std::fs::symlink_metadata(path)?;
        if !metadata.file_type().is_socket() {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "existing path is not a unix socket",
            )));
        }
        let probe = UnixDatagram::unbound()?;
        match probe.connect(path) {
            Ok(()) => Err(TransportError::NameInUse {
                name: name.to_string(),
            }),
            Err(err) if err.kind() == std::io::ErrorKind::ConnectionRefused => {
                debug!(name, ?path, "removing stale socket");
                std::fs::remove_file(path)?;
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Open an anonymous send path to a named endpoint.
    ///
    /// The receiver will observe no sender name on messages sent this way.
    /// Fails with `NotFound` if no live owner exists for the name.
    pub fn open(namespace: &PortNamespace, name: &str) -> Result<PortSender> {
        let path = namespace.path_for(name)?;
        let socket = UnixDatagram::unbound()?;
        socket.connect(&path).map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused => {
                TransportError::NotFound {
                    name: name.to_string(),
                }
            }
            _ => err.into(),
        })?;
        debug!(name, "opened send path");
        Ok(PortSender {
            inner: SenderInner::Anonymous(socket),
            name: name.to_string(),
        })
    }

    /// An opener that attributes outgoing messages to this port's name.
    pub fn opener(&self) -> Result<PortOpener> {
        Ok(PortOpener {
            socket: self.socket.try_clone()?,
            namespace: self.namespace.clone(),
        })
    }

    /// Receive one message (blocking).
    ///
    /// Returns the message length and the sender's port name when the sender
    /// is a named port in the same namespace. A message longer than `buf` is
    /// silently truncated by the OS; sizing `buf` to the maximum frame size
    /// turns oversized messages into codec rejections upstream.
    pub fn recv(&self, buf: &mut [u8]) -> Result<(usize, Option<String>)> {
        let (len, addr) = self.socket.recv_from(buf)?;
        let sender = addr
            .as_pathname()
            .and_then(|path| self.namespace.name_for(path));
        Ok((len, sender))
    }

    /// Set the read timeout for subsequent [`MessagePort::recv`] calls.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.socket.set_read_timeout(timeout).map_err(Into::into)
    }

    /// This port's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The namespace this port lives in.
    pub fn namespace(&self) -> &PortNamespace {
        &self.namespace
    }
}

impl Drop for MessagePort {
    fn drop(&mut self) {
        if let Some((expected_dev, expected_ino)) = self.created_inode {
            if let Ok(metadata) = std::fs::symlink_metadata(&self.path) {
                if metadata.file_type().is_socket()
                    && metadata.dev() == expected_dev
                    && metadata.ino() == expected_ino
                {
                    debug!(name = %self.name, "cleaning up socket file");
                    let _ = std::fs::remove_file(&self.path);
                } else {
                    debug!(
                        name = %self.name,
                        "socket path identity changed; skipping cleanup"
                    );
                }
            }
        }
    }
}

impl std::fmt::Debug for MessagePort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagePort")
            .field("name", &self.name)
            .field("path", &self.path)
            .finish()
    }
}

/// Opens attributed send paths on behalf of an owned port.
///
/// Messages sent through senders opened here carry the owning port's name as
/// their source address, so the receiver can attribute them.
pub struct PortOpener {
    socket: UnixDatagram,
    namespace: PortNamespace,
}

impl PortOpener {
    /// Open an attributed send path to a named endpoint.
    ///
    /// Fails with `NotFound` if no endpoint with that name exists.
    pub fn open(&self, name: &str) -> Result<PortSender> {
        let path = self.namespace.path_for(name)?;
        let metadata = std::fs::symlink_metadata(&path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                TransportError::NotFound {
                    name: name.to_string(),
                }
            } else {
                TransportError::Io(err)
            }
        })?;
        if !metadata.file_type().is_socket() {
            return Err(TransportError::NotFound {
                name: name.to_string(),
            });
        }
        Ok(PortSender {
            inner: SenderInner::Attributed {
                socket: self.socket.try_clone()?,
                target: path,
            },
            name: name.to_string(),
        })
    }
}

impl std::fmt::Debug for PortOpener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortOpener")
            .field("root", &self.namespace.root())
            .finish()
    }
}

enum SenderInner {
    /// Unbound socket connected to the target; the receiver sees no sender.
    Anonymous(UnixDatagram),
    /// Shares the opener's bound socket; the receiver sees the owner's name.
    Attributed { socket: UnixDatagram, target: PathBuf },
}

/// A non-owning send path to a named endpoint.
pub struct PortSender {
    inner: SenderInner,
    name: String,
}

impl PortSender {
    /// Send one message.
    ///
    /// Fails with `Disconnected` once the peer endpoint has gone away.
    pub fn send(&self, bytes: &[u8]) -> Result<()> {
        let sent = match &self.inner {
            SenderInner::Anonymous(socket) => socket.send(bytes),
            SenderInner::Attributed { socket, target } => socket.send_to(bytes, target),
        };
        match sent {
            Ok(n) if n == bytes.len() => Ok(()),
            Ok(n) => Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                format!("short datagram write ({n} of {} bytes)", bytes.len()),
            ))),
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::ConnectionRefused
                        | std::io::ErrorKind::NotFound
                        | std::io::ErrorKind::NotConnected
                ) =>
            {
                Err(TransportError::Disconnected {
                    name: self.name.clone(),
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// The name of the endpoint this sender targets.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for PortSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.inner {
            SenderInner::Anonymous(_) => "anonymous",
            SenderInner::Attributed { .. } => "attributed",
        };
        f.debug_struct("PortSender")
            .field("target", &self.name)
            .field("kind", &kind)
            .finish()
    }
}
