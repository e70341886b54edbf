use std::path::{Path, PathBuf};

use crate::error::{Result, TransportError};

/// File extension appended to port names when mapping them to socket paths.
const PORT_EXTENSION: &str = "port";

/// Maximum socket path length.
/// Unix `sockaddr_un.sun_path` is typically 108 bytes on Linux, 104 on macOS.
#[cfg(target_os = "linux")]
const MAX_PATH_LEN: usize = 108;
#[cfg(not(target_os = "linux"))]
const MAX_PATH_LEN: usize = 104;

/// Maps port names to socket paths under a root directory.
///
/// Port identity is its name; the namespace decides where that name lives on
/// the filesystem. A server and its clients must share a namespace root to
/// find each other. [`PortNamespace::system`] is the conventional root for a
/// machine-wide deployment; tests use a private root for isolation.
#[derive(Debug, Clone)]
pub struct PortNamespace {
    root: PathBuf,
}

impl PortNamespace {
    /// Create a namespace rooted at an explicit directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The conventional machine-wide namespace under the system temp dir.
    pub fn system() -> Self {
        Self::new(std::env::temp_dir().join("portbus"))
    }

    /// The root directory of this namespace.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a port name to its socket path, validating the name.
    pub fn path_for(&self, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        let path = self.root.join(format!("{name}.{PORT_EXTENSION}"));
        let len = path.as_os_str().len();
        if len >= MAX_PATH_LEN {
            return Err(TransportError::PathTooLong {
                name: name.to_string(),
                len,
                max: MAX_PATH_LEN,
            });
        }
        Ok(path)
    }

    /// Recover a port name from a socket path inside this namespace.
    ///
    /// Returns `None` for paths outside the namespace root or without the
    /// port extension (for example an anonymous sender).
    pub fn name_for(&self, path: &Path) -> Option<String> {
        if path.parent() != Some(self.root.as_path()) {
            return None;
        }
        if path.extension().and_then(|e| e.to_str()) != Some(PORT_EXTENSION) {
            return None;
        }
        path.file_stem()
            .and_then(|s| s.to_str())
            .map(|s| s.to_string())
    }
}

fn validate_name(name: &str) -> Result<()> {
    let invalid = |reason| TransportError::InvalidName {
        name: name.to_string(),
        reason,
    };
    if name.is_empty() {
        return Err(invalid("name is empty"));
    }
    if name.starts_with('.') {
        return Err(invalid("name starts with '.'"));
    }
    if name
        .bytes()
        .any(|b| b == b'/' || b == b'\\' || b == 0 || b.is_ascii_control())
    {
        return Err(invalid("name contains a path separator or control byte"));
    }
    Ok(())
}
