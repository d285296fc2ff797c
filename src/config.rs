//! Configuration for Fleet.
//!
//! Holds the clap structs for command line arguments and flags. Per-host settings live in the
//! hosts file instead; see `host`.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::target::PostAction;

#[derive(Parser)]
#[command(version, author)]
pub struct Config {
    #[command(subcommand)]
    pub action: Action,

    /// Host file to use. Defaults to `hosts.yaml`
    #[arg(long, default_value = "hosts.yaml", global = true)]
    pub hosts_file: String,

    /// Never prompt: run serial hosts without asking and keep waiting on silent commands
    #[arg(long, short, global = true)]
    pub unattended: bool,

    /// Seconds a command may stay silent before asking whether to keep waiting.
    /// Overrides the per-host value from the hosts file
    #[arg(long, short, global = true)]
    pub timeout: Option<u64>,

    /// Attempts per operation when the connection drops, the first one included
    #[arg(long, default_value = "2", global = true)]
    pub max_attempts: usize,

    /// What to do with every host once done
    #[arg(long, value_enum, global = true)]
    pub post: Option<PostAction>,
}

#[derive(Subcommand)]
pub enum Action {
    /// Run a command template on every host
    Run {
        /// Handlebars template; `{{hostname}}`, `{{port}}`, `{{user}}` and `{{system}}` are
        /// filled in per host
        command: String,
    },
    /// Upload a local file to every host
    Put { local: PathBuf, remote: String },
    /// Download a remote file from every host into `<local>.<hostname>`
    Get { remote: String, local: PathBuf },
    /// Take the lock on every host
    Lock {
        #[arg(long, short)]
        comment: Option<String>,
    },
    /// Release this session's lock on every host
    Unlock {
        /// Remove the lock file regardless of who holds it
        #[arg(long, short)]
        force: bool,
    },
    /// Show installed versions of packages
    Versions {
        #[arg(required = true)]
        packages: Vec<String>,
    },
    /// Show the newest history entries of every host
    History {
        #[arg(long, short, default_value = "10")]
        count: usize,
    },
}

impl Config {
    pub fn timeout(&self) -> Option<std::time::Duration> {
        self.timeout.map(std::time::Duration::from_secs)
    }
}
