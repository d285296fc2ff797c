//! Remote history log.
//!
//! Every host keeps an append-only log of who did what, one event per line:
//! `<unix-timestamp>:<username>:<event>[:<arg>...]`.

use std::fmt;
use std::str::FromStr;

pub const HISTORY_PATH: &str = "/var/log/fleet.log";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub timestamp: u64,
    pub user: String,
    /// `connect`, `disconnect`, `install`, `update`, `downgrade`, ...
    pub event: String,
    pub args: Vec<String>,
}

impl HistoryEntry {
    pub fn new(user: &str, event: &str, args: &[&str]) -> Self {
        Self {
            timestamp: crate::lock::unix_now(),
            user: user.to_owned(),
            event: event.to_owned(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
        }
    }
}

impl fmt::Display for HistoryEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}:{}", self.timestamp, self.user, self.event)?;
        for arg in &self.args {
            write!(f, ":{}", arg)?;
        }
        Ok(())
    }
}

impl FromStr for HistoryEntry {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields = s.trim_end().split(':');
        let timestamp = fields.next().ok_or(())?.parse().map_err(|_| ())?;
        let user = fields.next().ok_or(())?.to_owned();
        let event = fields.next().filter(|e| !e.is_empty()).ok_or(())?.to_owned();
        Ok(Self {
            timestamp,
            user,
            event,
            args: fields.map(str::to_owned).collect(),
        })
    }
}

/// The newest `count` well-formed entries of a log, newest first.
pub fn tail(content: &str, count: usize) -> Vec<HistoryEntry> {
    content
        .lines()
        .rev()
        .filter_map(|line| line.parse().ok())
        .take(count)
        .collect()
}
