//! Fleet: parallel and serial command execution across reference hosts over SSH.

// Serde helper module.
mod serde;
// Command line arguments and configuration.
pub mod config;
// Error handling.
pub mod error;
// How to parse and represent hosts.
pub mod host;
// Transport seams.
pub mod transport;
// SSH transport.
pub mod ssh;
// Shared console and operator prompts.
pub mod console;
// Remote session to one host.
pub mod session;
// Remote lock file.
pub mod lock;
// Remote history log.
pub mod history;
// Installed package versions.
pub mod package;
// Classifying command failures.
pub mod failure;
// A host under test.
pub mod target;
// Per-host command templates.
pub mod command;
// Fan-out across a group of hosts.
pub mod dispatcher;

pub use command::CommandSpec;
pub use config::{Action, Config};
pub use console::{Console, Operator, TimeoutAction};
pub use dispatcher::{HostGroup, HostOutcome, Status, Work};
pub use error::FleetError;
pub use host::{get_hosts, ExecMode, Host, HostState, Inventory};
pub use lock::{Identity, Lock, LockRecord};
pub use session::{RemoteSession, RetryPolicy};
pub use target::{PostAction, Target, TargetOptions};
pub use transport::{Connector, Transport};
