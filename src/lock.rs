//! Distributed host lock.
//!
//! The lock is a single line stored at `LOCK_PATH` on the host itself:
//!
//! ```text
//! <unix-timestamp>:<username>:<pid>[:<comment>]
//! ```
//!
//! No file means unlocked. A lock belongs to one controller process: both the user name and the
//! pid must match, so two sessions of the same person never share it. Locks never expire; a
//! crashed session's lock stays until someone force-releases it.

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use colored::Colorize;

use crate::error::FleetError;
use crate::session::RemoteSession;
use crate::transport::WriteMode;

pub const LOCK_PATH: &str = "/var/lock/fleet.lock";

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Who is asking: the local user and the controller's process id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user: String,
    pub pid: u32,
}

impl Identity {
    pub fn new(user: impl Into<String>, pid: u32) -> Self {
        Self {
            user: user.into(),
            pid,
        }
    }

    pub fn current() -> Self {
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("LOGNAME"))
            .unwrap_or_else(|_| "unknown".to_owned());
        Self::new(user, std::process::id())
    }
}

/// Parsed contents of the lock file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRecord {
    pub timestamp: u64,
    pub user: String,
    pub pid: u32,
    /// `None` for the three-field form, `Some("")` for an empty trailing field.
    pub comment: Option<String>,
}

impl LockRecord {
    /// A fresh record for `identity`. Line breaks in `comment` become spaces so the record
    /// stays on one line.
    pub fn new(identity: &Identity, comment: Option<String>) -> Self {
        Self {
            timestamp: unix_now(),
            user: identity.user.clone(),
            pid: identity.pid,
            comment: comment
                .map(|comment| comment.replace(|c: char| c == '\n' || c == '\r', " ")),
        }
    }

    pub fn is_owned_by(&self, identity: &Identity) -> bool {
        self.user == identity.user && self.pid == identity.pid
    }

    /// How long the lock has been held, as of `now` (unix seconds).
    pub fn age(&self, now: u64) -> Duration {
        Duration::from_secs(now.saturating_sub(self.timestamp))
    }
}

impl FromStr for LockRecord {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let line = s.lines().next().ok_or(())?;
        let mut fields = line.splitn(4, ':');
        let timestamp = fields.next().ok_or(())?.trim().parse().map_err(|_| ())?;
        let user = fields.next().filter(|user| !user.is_empty()).ok_or(())?;
        let pid = fields.next().ok_or(())?.trim().parse().map_err(|_| ())?;
        Ok(Self {
            timestamp,
            user: user.to_owned(),
            pid,
            comment: fields.next().map(str::to_owned),
        })
    }
}

/// The on-disk line, without the trailing newline.
impl fmt::Display for LockRecord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}:{}", self.timestamp, self.user, self.pid)?;
        if let Some(comment) = &self.comment {
            write!(f, ":{}", comment)?;
        }
        Ok(())
    }
}

/// Human-readable holder description for warnings.
pub struct Holder<'a>(pub &'a LockRecord);

impl fmt::Display for Holder<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let record = self.0;
        let age = record.age(unix_now()).as_secs();
        write!(
            f,
            "{} (pid {}) at {} ({}h{:02}m ago)",
            record.user,
            record.pid,
            record.timestamp,
            age / 3600,
            age % 3600 / 60
        )?;
        match record.comment.as_deref() {
            Some(comment) if !comment.is_empty() => write!(f, ": {}", comment),
            _ => Ok(()),
        }
    }
}

/// Local view of a host's lock.
#[derive(Debug, Default)]
pub struct Lock {
    record: Option<LockRecord>,
    /// Raw content of a lock file that does not parse. Counts as held by somebody else.
    malformed: Option<String>,
    /// Set once this session wrote the lock, cleared on release.
    acquired: bool,
}

impl Lock {
    pub fn record(&self) -> Option<&LockRecord> {
        self.record.as_ref()
    }

    pub fn malformed(&self) -> Option<&str> {
        self.malformed.as_deref()
    }

    pub fn is_locked(&self) -> bool {
        self.record.is_some() || self.malformed.is_some()
    }

    pub fn is_owned_by(&self, identity: &Identity) -> bool {
        self.record
            .as_ref()
            .map_or(false, |record| record.is_owned_by(identity))
    }

    /// Locked, and by somebody else.
    pub fn is_foreign(&self, identity: &Identity) -> bool {
        self.is_locked() && !self.is_owned_by(identity)
    }

    pub fn acquired(&self) -> bool {
        self.acquired
    }

    /// Re-reads the lock file from the host. Unparsable content is kept and reported as
    /// `MalformedLock`.
    pub async fn load(&mut self, session: &mut RemoteSession) -> Result<(), FleetError> {
        self.record = None;
        self.malformed = None;
        match session.read_to_string(LOCK_PATH).await? {
            None => Ok(()),
            Some(content) if content.trim().is_empty() => Ok(()),
            Some(content) => match content.parse() {
                Ok(record) => {
                    self.record = Some(record);
                    Ok(())
                }
                Err(()) => {
                    self.malformed = Some(content.clone());
                    Err(FleetError::MalformedLock {
                        host: session.host.hostname.clone(),
                        content,
                    })
                }
            },
        }
    }

    pub async fn acquire(
        &mut self,
        session: &mut RemoteSession,
        identity: &Identity,
        comment: Option<String>,
    ) -> Result<(), FleetError> {
        self.load(session).await?;
        if let Some(holder) = &self.record {
            if !holder.is_owned_by(identity) {
                return Err(FleetError::LockConflict {
                    host: session.host.hostname.clone(),
                    holder: holder.clone(),
                });
            }
        }
        let record = LockRecord::new(identity, comment);
        session
            .write(LOCK_PATH, format!("{}\n", record).as_bytes(), WriteMode::Truncate)
            .await?;
        // Two sessions may have written at the same time. Whoever reads back their own line won.
        self.load(session).await?;
        match &self.record {
            Some(holder) if holder.is_owned_by(identity) => {
                self.acquired = true;
                Ok(())
            }
            Some(holder) => Err(FleetError::LockConflict {
                host: session.host.hostname.clone(),
                holder: holder.clone(),
            }),
            None => Err(FleetError::NotLocked {
                host: session.host.hostname.clone(),
            }),
        }
    }

    pub async fn release(
        &mut self,
        session: &mut RemoteSession,
        identity: &Identity,
    ) -> Result<(), FleetError> {
        self.load(session).await?;
        match &self.record {
            None => {
                self.acquired = false;
                Err(FleetError::NotLocked {
                    host: session.host.hostname.clone(),
                })
            }
            Some(holder) if !holder.is_owned_by(identity) => Err(FleetError::LockNotOwned {
                host: session.host.hostname.clone(),
                holder: holder.clone(),
            }),
            Some(_) => {
                session.remove(LOCK_PATH).await?;
                self.record = None;
                self.acquired = false;
                Ok(())
            }
        }
    }

    /// Removes the lock whoever holds it, whether or not its content parses.
    pub async fn force_release(&mut self, session: &mut RemoteSession) -> Result<(), FleetError> {
        let content = session.read_to_string(LOCK_PATH).await?;
        if let Some(content) = content.filter(|content| !content.trim().is_empty()) {
            let holder = match content.parse::<LockRecord>() {
                Ok(record) => Holder(&record).to_string(),
                Err(()) => format!("unreadable lock {:?}", content.trim_end()),
            };
            log::warn!(
                "{} Forcibly removing lock held by {}",
                session.host.to_string().red().bold(),
                holder
            );
            match session.remove(LOCK_PATH).await {
                Ok(()) | Err(FleetError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        self.record = None;
        self.malformed = None;
        self.acquired = false;
        Ok(())
    }
}
