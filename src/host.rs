//! Reference hosts.
//!
//! One SSH connection is created for one `Host`. Each connection runs commands in parallel with
//! other connections in its own tokio task, unless the host is marked serial.

use std::fmt;
use std::fs::File;
use std::str::FromStr;
use std::time::Duration;

use colored::*;
use colourado::Color;
use serde::Deserialize;
use void::Void;

use crate::error::FleetError;
use crate::failure::FailureRule;
use crate::serde::shorthand_or_mapping;

/// Operating state of a host. Only `Enabled` hosts execute commands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum HostState {
    #[default]
    Enabled,
    Disabled,
    Dryrun,
}

impl fmt::Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HostState::Enabled => write!(f, "enabled"),
            HostState::Disabled => write!(f, "disabled"),
            HostState::Dryrun => write!(f, "dryrun"),
        }
    }
}

/// Scheduling mode of a host within a group run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ExecMode {
    #[default]
    Parallel,
    Serial,
}

fn default_port() -> u16 {
    22
}

fn default_timeout() -> u64 {
    300
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Host {
    /// SSH hostname to connect to.
    pub hostname: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Login user. Falls back to the SSH client configuration when unset.
    #[serde(default)]
    pub user: Option<String>,
    /// Free-form system label, e.g. `sles15sp5-x86_64`.
    #[serde(default)]
    pub system: String,
    #[serde(default)]
    pub state: HostState,
    #[serde(default)]
    pub mode: ExecMode,
    /// Seconds a command may stay silent before the operator is asked what to do.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

impl Host {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            port: default_port(),
            user: None,
            system: String::new(),
            state: HostState::default(),
            mode: ExecMode::default(),
            timeout: default_timeout(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// For pretty-printing the host name.
    /// Surrounds with brackets and colors it with the given color.
    pub fn prettify(&self, color: Color) -> ColoredString {
        let r = (color.red * 255.0) as u8;
        let g = (color.green * 255.0) as u8;
        let b = (color.blue * 255.0) as u8;
        format!("{}", self).truecolor(r, g, b)
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.system.is_empty() {
            write!(f, "[{}]", self.hostname)
        } else {
            write!(f, "[{} ({})]", self.hostname, self.system)
        }
    }
}

/// Parses `[user@]hostname[:port]`. A suffix that is not a port stays part of the hostname.
impl FromStr for Host {
    type Err = Void;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (user, address) = match s.split_once('@') {
            Some((user, address)) => (Some(user.to_owned()), address),
            None => (None, s),
        };
        let mut host = match address.rsplit_once(':') {
            Some((hostname, port)) => match port.parse() {
                Ok(port) => Host {
                    port,
                    ..Host::new(hostname)
                },
                Err(_) => Host::new(address),
            },
            None => Host::new(address),
        };
        host.user = user;
        Ok(host)
    }
}

#[derive(Debug, Deserialize)]
struct HostSpec(#[serde(deserialize_with = "shorthand_or_mapping")] Host);

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum InventoryFile {
    List(Vec<HostSpec>),
    Full {
        hosts: Vec<HostSpec>,
        #[serde(default)]
        failure_rules: Vec<FailureRule>,
    },
}

/// Parsed host file: hosts in listed order plus extra failure classification rules.
#[derive(Debug, Default)]
pub struct Inventory {
    pub hosts: Vec<Host>,
    pub failure_rules: Vec<FailureRule>,
}

impl Inventory {
    pub fn parse(path: &str, content: &str) -> Result<Self, FleetError> {
        let file: InventoryFile =
            serde_yaml::from_str(content).map_err(|e| FleetError::HostFile {
                path: path.to_owned(),
                reason: e.to_string(),
            })?;
        let (specs, failure_rules) = match file {
            InventoryFile::List(hosts) => (hosts, vec![]),
            InventoryFile::Full {
                hosts,
                failure_rules,
            } => (hosts, failure_rules),
        };
        let hosts: Vec<Host> = specs.into_iter().map(|HostSpec(host)| host).collect();
        if let Some(host) = hosts.iter().find(|host| host.hostname.is_empty()) {
            return Err(FleetError::HostFile {
                path: path.to_owned(),
                reason: format!("entry {:?} has an empty hostname", host),
            });
        }
        Ok(Self {
            hosts,
            failure_rules,
        })
    }
}

pub fn get_hosts(hosts_file: &str) -> Result<Inventory, FleetError> {
    let hosts_fd = File::open(hosts_file).map_err(|e| FleetError::HostFile {
        path: hosts_file.to_owned(),
        reason: e.to_string(),
    })?;
    let content = std::io::read_to_string(hosts_fd)?;
    let inventory = Inventory::parse(hosts_file, &content)?;
    log::info!(
        "Hosts detected: {}",
        itertools::join(inventory.hosts.iter(), ", ")
    );
    Ok(inventory)
}
