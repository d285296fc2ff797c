//! Transport seams.
//!
//! A `Connector` opens a `Transport` to one host. The transport runs each command in its own
//! sub-session and carries the file primitives the session layer builds on. The production
//! implementation lives in `ssh`; tests provide in-memory ones.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::FleetError;
use crate::host::Host;

/// A chunk of output produced by a running command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Truncate,
    Append,
}

/// Credential supplied by the operator after key-based authentication was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    Identity(PathBuf),
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        host: &Host,
        credential: Option<&Credential>,
    ) -> Result<Box<dyn Transport>, FleetError>;
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Runs `command` in a fresh sub-session, forwarding output chunks to `output` as they
    /// arrive. Resolves to the exit code once the remote side closes the channel. Dropping the
    /// returned future closes the sub-session.
    async fn exec(
        &self,
        command: &str,
        output: flume::Sender<OutputEvent>,
    ) -> Result<i32, FleetError>;

    /// Opens and immediately closes a sub-session.
    async fn check(&self) -> Result<(), FleetError>;

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, FleetError>;

    async fn write_file(&self, path: &str, data: &[u8], mode: WriteMode)
        -> Result<(), FleetError>;

    async fn chmod(&self, path: &str, mode: u32) -> Result<(), FleetError>;

    async fn create_dir_all(&self, path: &str) -> Result<(), FleetError>;

    async fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>, FleetError>;

    async fn remove_file(&self, path: &str) -> Result<(), FleetError>;

    /// Removes an empty directory.
    async fn remove_dir(&self, path: &str) -> Result<(), FleetError>;

    async fn close(&mut self) -> Result<(), FleetError>;
}
