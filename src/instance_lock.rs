//! Single instance lock using a Unix socket in the bridge data directory.
//!
//! Two bridges sharing one data directory would overwrite each other's state
//! snapshot. The socket is released by the OS when the process dies, so a
//! crashed bridge never leaves a stale lock behind.

use std::io;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Socket file name placed inside the data directory.
const LOCK_FILE_NAME: &str = "zigbee-state-bridge.sock";

/// Error types for instance lock operations.
#[derive(Debug, Error)]
pub enum InstanceLockError {
    /// Another instance owns this data directory.
    #[error("another instance is already using {0:?}")]
    AlreadyRunning(PathBuf),

    /// I/O error during lock acquisition.
    #[error("failed to acquire instance lock: {0}")]
    Io(#[from] io::Error),
}

/// Lock held for the lifetime of the bridge process.
///
/// Dropping it removes the socket file.
pub struct InstanceLock {
    _listener: UnixListener,
    path: PathBuf,
}

impl InstanceLock {
    /// Acquire the lock for `data_dir`, creating the directory if needed.
    pub fn acquire(data_dir: &Path) -> Result<Self, InstanceLockError> {
        std::fs::create_dir_all(data_dir)?;
        let path = Self::socket_path(data_dir);

        if path.exists() {
            // A socket nobody answers on was left by a killed process
            if UnixStream::connect(&path).is_ok() {
                return Err(InstanceLockError::AlreadyRunning(data_dir.to_path_buf()));
            }
            let _ = std::fs::remove_file(&path);
        }

        match UnixListener::bind(&path) {
            Ok(listener) => Ok(Self {
                _listener: listener,
                path,
            }),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                Err(InstanceLockError::AlreadyRunning(data_dir.to_path_buf()))
            }
            Err(e) => Err(InstanceLockError::Io(e)),
        }
    }

    /// Path of the lock socket for a data directory.
    pub fn socket_path(data_dir: &Path) -> PathBuf {
        data_dir.join(LOCK_FILE_NAME)
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
