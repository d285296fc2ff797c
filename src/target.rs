//! A host under test.
//!
//! A `Target` applies the host's operating state to every command, keeps the log of what ran,
//! tracks package versions, and manages the host lock and history on behalf of this session.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use colored::ColoredString;
use colourado::Color;

use crate::console::Console;
use crate::error::FleetError;
use crate::failure::{FailureKind, FailureRules};
use crate::history::{self, HistoryEntry, HISTORY_PATH};
use crate::host::{ExecMode, Host, HostState};
use crate::lock::{Holder, Identity, Lock, LockRecord};
use crate::package::{self, Package, Phase, Version};
use crate::session::{RemoteSession, RetryPolicy};
use crate::transport::{Connector, WriteMode};

/// How long `close` may spend on history and lock bookkeeping before tearing down anyway.
pub const CLOSE_DEADLINE: Duration = Duration::from_secs(15);

/// Placeholder output recorded for commands on dryrun hosts.
pub const DRYRUN_OUTPUT: &str = "dryrun\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRecord {
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    pub exitcode: i32,
    pub elapsed: Duration,
    pub failure: Option<FailureKind>,
}

impl CommandRecord {
    fn empty() -> Self {
        Self {
            command: String::new(),
            stdout: String::new(),
            stderr: String::new(),
            exitcode: 0,
            elapsed: Duration::ZERO,
            failure: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum PostAction {
    Reboot,
    Poweroff,
}

impl PostAction {
    fn command(self) -> &'static str {
        // Detached so the sub-session can close before the host goes down.
        match self {
            PostAction::Reboot => "nohup sh -c 'sleep 2; reboot' >/dev/null 2>&1 &",
            PostAction::Poweroff => "nohup sh -c 'sleep 2; poweroff' >/dev/null 2>&1 &",
        }
    }
}

#[derive(Clone)]
pub struct TargetOptions {
    pub identity: Identity,
    pub rules: Arc<FailureRules>,
    pub retry: RetryPolicy,
}

impl Default for TargetOptions {
    fn default() -> Self {
        Self {
            identity: Identity::current(),
            rules: Arc::new(FailureRules::default()),
            retry: RetryPolicy::default(),
        }
    }
}

pub struct Target {
    pub state: HostState,
    pub mode: ExecMode,
    session: RemoteSession,
    lock: Lock,
    identity: Identity,
    rules: Arc<FailureRules>,
    packages: BTreeMap<String, Package>,
    log: Vec<CommandRecord>,
}

impl Target {
    /// Connects to `host`, reports a lock held by another session and records the connect in
    /// its history. An unreadable lock file is reported but keeps the host, so that a forced
    /// unlock can clear it.
    pub async fn connect(
        host: Host,
        connector: Arc<dyn Connector>,
        console: &Console,
        options: TargetOptions,
    ) -> Result<Self, FleetError> {
        let session = RemoteSession::connect(host, connector, console, options.retry).await?;
        let mut target = Self::new(session, options);
        match target.refresh_lock().await {
            Ok(()) => {
                if let Some(holder) = target.foreign_lock() {
                    log::warn!(
                        "{} Host is locked by {}",
                        target.colorhost(),
                        Holder(holder)
                    );
                }
            }
            Err(FleetError::MalformedLock { content, .. }) => {
                log::warn!(
                    "{} Host is locked by an unreadable lock {:?}. Use a forced unlock to clear it.",
                    target.colorhost(),
                    content.trim_end()
                );
            }
            Err(e) => {
                target.session.close().await;
                return Err(e);
            }
        }
        if let Err(e) = target.add_history("connect", &[]).await {
            log::warn!("{} Failed to record connect: {}", target.colorhost(), e);
        }
        Ok(target)
    }

    pub fn new(session: RemoteSession, options: TargetOptions) -> Self {
        Self {
            state: session.host.state,
            mode: session.host.mode,
            session,
            lock: Lock::default(),
            identity: options.identity,
            rules: options.rules,
            packages: BTreeMap::new(),
            log: vec![],
        }
    }

    pub fn host(&self) -> &Host {
        &self.session.host
    }

    pub fn hostname(&self) -> &str {
        &self.session.host.hostname
    }

    pub fn system(&self) -> &str {
        &self.session.host.system
    }

    pub fn colorhost(&self) -> &ColoredString {
        self.session.colorhost()
    }

    pub fn set_color(&mut self, color: Color) {
        self.session.set_color(color);
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.session.set_timeout(timeout);
    }

    pub fn session(&self) -> &RemoteSession {
        &self.session
    }

    /// Runs `command` according to the operating state and appends the result to the log.
    ///
    /// Disabled hosts record an empty entry. Dryrun hosts echo the command and record
    /// placeholder output with exit code 0. Neither touches the connection.
    pub async fn run(&mut self, command: &str, console: &Console) -> Result<i32, FleetError> {
        match self.state {
            HostState::Disabled => {
                self.log.push(CommandRecord::empty());
                Ok(0)
            }
            HostState::Dryrun => {
                console
                    .print_lines(self.session.colorhost(), &[format!("dryrun: {}", command)])
                    .await;
                self.log.push(CommandRecord {
                    command: command.to_owned(),
                    stdout: DRYRUN_OUTPUT.to_owned(),
                    ..CommandRecord::empty()
                });
                Ok(0)
            }
            HostState::Enabled => {
                let started = Instant::now();
                let result = self.session.run(command, console).await;
                let elapsed = started.elapsed();
                // An abandoned command still left partial output behind.
                if matches!(result, Ok(_) | Err(FleetError::CommandTimeout { .. })) {
                    let output = self.session.last();
                    let failure = self.rules.classify(&output.stdout, &output.stderr);
                    if let Some(kind) = failure {
                        log::warn!("{} {} detected.", self.session.colorhost(), kind);
                    }
                    self.log.push(CommandRecord {
                        command: command.to_owned(),
                        stdout: output.stdout.clone(),
                        stderr: output.stderr.clone(),
                        exitcode: output.exitcode,
                        elapsed,
                        failure,
                    });
                }
                result
            }
        }
    }

    pub fn log(&self) -> &[CommandRecord] {
        &self.log
    }

    pub fn last(&self) -> Option<&CommandRecord> {
        self.log.last()
    }

    pub fn last_stdout(&self) -> &str {
        self.last().map_or("", |record| &record.stdout)
    }

    pub fn last_stderr(&self) -> &str {
        self.last().map_or("", |record| &record.stderr)
    }

    pub fn last_exitcode(&self) -> Option<i32> {
        self.last().map(|record| record.exitcode)
    }

    /// Turns a classified failure of the last command into its error.
    pub fn check_last(&self) -> Result<(), FleetError> {
        match self.last().and_then(|record| record.failure) {
            Some(kind) => Err(kind.into_error(self.hostname())),
            None => Ok(()),
        }
    }

    pub async fn put(
        &mut self,
        local: &Path,
        remote: &str,
        console: &Console,
    ) -> Result<(), FleetError> {
        match self.state {
            HostState::Enabled => self.session.put(local, remote).await,
            HostState::Dryrun => {
                let line = format!("dryrun: put {} {}", local.display(), remote);
                console.print_lines(self.session.colorhost(), &[line]).await;
                Ok(())
            }
            HostState::Disabled => Ok(()),
        }
    }

    /// Downloads `remote` into `local`. `local` is suffixed with the hostname so the same
    /// call can be made across a group.
    pub async fn get(
        &mut self,
        remote: &str,
        local: &Path,
        console: &Console,
    ) -> Result<(), FleetError> {
        let mut name = local.as_os_str().to_owned();
        name.push(".");
        name.push(self.hostname());
        let local = Path::new(&name);
        match self.state {
            HostState::Enabled => self.session.get(remote, local).await,
            HostState::Dryrun => {
                let line = format!("dryrun: get {} {}", remote, local.display());
                console.print_lines(self.session.colorhost(), &[line]).await;
                Ok(())
            }
            HostState::Disabled => Ok(()),
        }
    }

    pub fn lock(&self) -> &Lock {
        &self.lock
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// The lock record, if somebody other than this session holds it.
    pub fn foreign_lock(&self) -> Option<&LockRecord> {
        self.lock
            .record()
            .filter(|record| !record.is_owned_by(&self.identity))
    }

    pub async fn refresh_lock(&mut self) -> Result<(), FleetError> {
        self.lock.load(&mut self.session).await
    }

    /// Takes the host lock. Returns `false`, after logging the holder, when another session
    /// holds it or the lock file is unreadable.
    pub async fn acquire_lock(&mut self, comment: Option<String>) -> Result<bool, FleetError> {
        match self
            .lock
            .acquire(&mut self.session, &self.identity, comment)
            .await
        {
            Ok(()) => Ok(true),
            Err(FleetError::LockConflict { holder, .. }) => {
                log::warn!(
                    "{} Host is locked by {}. Not locking.",
                    self.session.colorhost(),
                    Holder(&holder)
                );
                Ok(false)
            }
            Err(FleetError::MalformedLock { content, .. }) => {
                log::warn!(
                    "{} Host is locked by an unreadable lock {:?}. Not locking.",
                    self.session.colorhost(),
                    content.trim_end()
                );
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Releases the host lock. Without `force` the lock has to be ours: a foreign lock is
    /// `LockNotOwned`, a missing one `NotLocked`.
    pub async fn release_lock(&mut self, force: bool) -> Result<(), FleetError> {
        if force {
            self.lock.force_release(&mut self.session).await
        } else {
            self.lock.release(&mut self.session, &self.identity).await
        }
    }

    pub async fn add_history(&mut self, event: &str, args: &[&str]) -> Result<(), FleetError> {
        let entry = HistoryEntry::new(&self.identity.user, event, args);
        self.session
            .write(
                HISTORY_PATH,
                format!("{}\n", entry).as_bytes(),
                WriteMode::Append,
            )
            .await
    }

    /// The newest `count` history entries, newest first.
    pub async fn history(&mut self, count: usize) -> Result<Vec<HistoryEntry>, FleetError> {
        let content = self.session.read_to_string(HISTORY_PATH).await?;
        Ok(history::tail(content.as_deref().unwrap_or_default(), count))
    }

    pub fn packages(&self) -> &BTreeMap<String, Package> {
        &self.packages
    }

    pub fn require_version(&mut self, name: &str, version: &str) {
        self.packages
            .entry(name.to_owned())
            .or_insert_with(|| Package::new(name))
            .required = Some(Version::Installed(version.to_owned()));
    }

    /// Queries the installed versions of `names` in one command and stores them as
    /// `current`. Packages the query does not report are recorded as absent. Disabled and
    /// dryrun hosts log the query but keep what they knew before.
    pub async fn query_versions<S: AsRef<str>>(
        &mut self,
        names: &[S],
        console: &Console,
    ) -> Result<(), FleetError> {
        if names.is_empty() {
            return Ok(());
        }
        self.run(&package::query_command(names), console).await?;
        if self.state != HostState::Enabled {
            return Ok(());
        }
        let stdout = self.last_stdout().to_owned();
        for (name, version) in package::parse_query_output(names, &stdout) {
            self.packages
                .entry(name.clone())
                .or_insert_with(|| Package::new(name))
                .current = Some(version);
        }
        Ok(())
    }

    pub fn snapshot_versions(&mut self, phase: Phase) {
        for package in self.packages.values_mut() {
            package.snapshot(phase);
        }
    }

    /// Drops the connection without any bookkeeping. Used to cut off a command mid-flight.
    pub async fn abort(&mut self) {
        self.session.close().await;
    }

    /// Records the disconnect, releases the lock this session acquired, runs `post_action`
    /// and closes the connection. The bookkeeping gets `CLOSE_DEADLINE`; the connection is
    /// closed regardless of how it went.
    pub async fn close(&mut self, post_action: Option<PostAction>, console: &Console) {
        if self.session.is_connected() {
            let steps = self.close_steps(post_action, console);
            if tokio::time::timeout(CLOSE_DEADLINE, steps).await.is_err() {
                log::warn!(
                    "{} Gave up on disconnect bookkeeping after {}s.",
                    self.session.colorhost(),
                    CLOSE_DEADLINE.as_secs()
                );
            }
        }
        self.session.close().await;
    }

    async fn close_steps(&mut self, post_action: Option<PostAction>, console: &Console) {
        if !self.session.is_active().await {
            return;
        }
        if let Err(e) = self.add_history("disconnect", &[]).await {
            log::warn!("{} Failed to record disconnect: {}", self.colorhost(), e);
        }
        if self.lock.acquired() {
            if let Err(e) = self.release_lock(false).await {
                log::warn!("{} Failed to release lock: {}", self.colorhost(), e);
            }
        }
        if let Some(action) = post_action {
            self.session.set_echo(false);
            if let Err(e) = self.session.run(action.command(), console).await {
                log::warn!("{} Failed to {:?}: {}", self.colorhost(), action, e);
            }
        }
    }
}
