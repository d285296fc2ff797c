use thiserror::Error;

use crate::lock::{Holder, LockRecord};

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("[{host}] Authentication rejected: {reason}")]
    Authentication { host: String, reason: String },
    #[error("[{host}] Host key verification failed")]
    HostKeyMismatch { host: String },
    #[error("[{host}] Failed to establish SSH connection: {reason}")]
    Protocol { host: String, reason: String },
    #[error("[{host}] Lost SSH channel: {reason}")]
    ChannelLost { host: String, reason: String },
    #[error("[{host}] Giving up after {attempts} attempts: {last}")]
    RetriesExhausted {
        host: String,
        attempts: usize,
        #[source]
        last: Box<FleetError>,
    },
    #[error("[{host}] Not connected")]
    Disconnected { host: String },
    #[error("[{host}] Abandoned '{command}' after it timed out")]
    CommandTimeout { host: String, command: String },
    #[error("[{host}] Locked by {}", Holder(.holder))]
    LockConflict { host: String, holder: LockRecord },
    #[error("[{host}] Lock is held by {}, not by this session", Holder(.holder))]
    LockNotOwned { host: String, holder: LockRecord },
    #[error("[{host}] Not locked")]
    NotLocked { host: String },
    #[error("[{host}] Malformed lock file: {content:?}")]
    MalformedLock { host: String, content: String },
    #[error("[{host}] Package manager is locked by another process")]
    PackageManagerLocked { host: String },
    #[error("[{host}] Package dependency conflict")]
    DependencyConflict { host: String },
    #[error("[{host}] No such remote path: {path}")]
    NotFound { host: String, path: String },
    #[error("[{host}] Remote {operation} failed: {reason}")]
    Remote {
        host: String,
        operation: &'static str,
        reason: String,
    },
    #[error("Interrupted by operator")]
    Interrupted,
    #[error("Failed to access local file: {0}")]
    LocalIo(#[from] std::io::Error),
    #[error("Failed to parse host file {path}: {reason}")]
    HostFile { path: String, reason: String },
    #[error("Failed to render command template '{template}': {reason}")]
    Template { template: String, reason: String },
}

impl FleetError {
    /// Whether a reconnect may recover from this error.
    pub fn is_channel_lost(&self) -> bool {
        matches!(self, FleetError::ChannelLost { .. })
    }
}
