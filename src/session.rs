//! Remote session to one host.
//!
//! Owns the transport to the host and runs one command at a time on it (`run` takes `&mut self`),
//! each in a fresh sub-session that is closed again when the command finishes, fails, or is
//! abandoned. Losing the channel triggers a reconnect and a retry of the same operation, at most
//! `RetryPolicy::max_attempts` times in total.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use colored::{ColoredString, Colorize};
use colourado::Color;

use crate::console::{Console, LineSplitter, TimeoutAction};
use crate::error::FleetError;
use crate::host::Host;
use crate::transport::{Connector, Credential, DirEntry, OutputEvent, Transport, WriteMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per operation, the first one included.
    pub max_attempts: usize,
    /// Pause before reconnecting.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            backoff: Duration::from_secs(1),
        }
    }
}

/// Captured result of one command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// `-1` when the command was abandoned after a timeout.
    pub exitcode: i32,
}

pub struct RemoteSession {
    pub host: Host,
    colorhost: ColoredString,
    connector: Arc<dyn Connector>,
    credential: Option<Credential>,
    transport: Option<Box<dyn Transport>>,
    retry: RetryPolicy,
    timeout: Duration,
    /// Stream command output to the console as it arrives.
    echo: bool,
    last: CommandOutput,
}

impl RemoteSession {
    /// Connects with key-based authentication, then once more with a credential from the
    /// operator if the host rejected the keys. Any other failure is returned as is.
    pub async fn connect(
        host: Host,
        connector: Arc<dyn Connector>,
        console: &Console,
        retry: RetryPolicy,
    ) -> Result<Self, FleetError> {
        let colorhost = host.to_string().bold();
        let (transport, credential) = match connector.connect(&host, None).await {
            Ok(transport) => (transport, None),
            Err(error @ FleetError::Authentication { .. }) => {
                log::warn!("{} {}", colorhost, error);
                let Some(credential) = console.credential(&host.hostname).await else {
                    return Err(error);
                };
                let transport = connector.connect(&host, Some(&credential)).await?;
                (transport, Some(credential))
            }
            Err(error) => {
                log::error!("{} Failed to connect to host: {}", colorhost, error);
                return Err(error);
            }
        };
        log::info!("{} Connected to host.", colorhost);
        Ok(Self {
            timeout: host.timeout(),
            host,
            colorhost,
            connector,
            credential,
            transport: Some(transport),
            retry,
            echo: true,
            last: CommandOutput::default(),
        })
    }

    pub fn set_color(&mut self, color: Color) {
        self.colorhost = self.host.prettify(color);
    }

    pub fn colorhost(&self) -> &ColoredString {
        &self.colorhost
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_echo(&mut self, echo: bool) {
        self.echo = echo;
    }

    pub fn last(&self) -> &CommandOutput {
        &self.last
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    fn transport(&self) -> Result<&dyn Transport, FleetError> {
        self.transport
            .as_deref()
            .ok_or_else(|| FleetError::Disconnected {
                host: self.host.hostname.clone(),
            })
    }

    /// Decides whether `error` on attempt `*attempt` is worth another try, and if so
    /// reconnects. Returns the error to give up with otherwise.
    async fn recover(&mut self, attempt: &mut usize, error: FleetError) -> Result<(), FleetError> {
        if !error.is_channel_lost() {
            return Err(error);
        }
        if *attempt >= self.retry.max_attempts {
            return Err(FleetError::RetriesExhausted {
                host: self.host.hostname.clone(),
                attempts: *attempt,
                last: Box::new(error),
            });
        }
        log::warn!(
            "{} {}. Reconnecting (attempt {}/{}).",
            self.colorhost,
            error,
            *attempt + 1,
            self.retry.max_attempts
        );
        *attempt += 1;
        self.reconnect().await
    }

    async fn reconnect(&mut self) -> Result<(), FleetError> {
        if let Some(mut transport) = self.transport.take() {
            // The old connection is already broken; its close error says nothing new.
            let _ = transport.close().await;
        }
        tokio::time::sleep(self.retry.backoff).await;
        let transport = self
            .connector
            .connect(&self.host, self.credential.as_ref())
            .await?;
        self.transport = Some(transport);
        log::info!("{} Reconnected.", self.colorhost);
        Ok(())
    }

    /// Runs `command` to completion and returns its exit code. Output is kept in `last()`.
    ///
    /// Whenever the command stays silent for a whole timeout window the operator decides
    /// whether to keep waiting. Abandoning leaves exit code `-1` in `last()` and returns
    /// `CommandTimeout`.
    pub async fn run(&mut self, command: &str, console: &Console) -> Result<i32, FleetError> {
        let mut attempt = 1;
        let result = loop {
            let result = self.run_once(command, console).await;
            match result {
                Err(error) if error.is_channel_lost() => {
                    self.recover(&mut attempt, error).await?;
                }
                result => break result,
            }
        };
        let (output, timed_out) = result?;
        let exitcode = output.exitcode;
        self.last = output;
        if timed_out {
            return Err(FleetError::CommandTimeout {
                host: self.host.hostname.clone(),
                command: command.to_owned(),
            });
        }
        Ok(exitcode)
    }

    async fn run_once(
        &self,
        command: &str,
        console: &Console,
    ) -> Result<(CommandOutput, bool), FleetError> {
        let transport = self.transport()?;
        if self.echo {
            console
                .print_lines(&self.colorhost, &[format!("=== run '{}' ===", command)])
                .await;
        }
        let (output_tx, output_rx) = flume::unbounded();
        // The sub-session lives exactly as long as this future.
        let mut exec = transport.exec(command, output_tx);
        let mut status = None;
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut out_lines = LineSplitter::default();
        let mut err_lines = LineSplitter::default();
        loop {
            tokio::select! {
                event = output_rx.recv_async() => {
                    let lines = match event {
                        Ok(OutputEvent::Stdout(chunk)) => {
                            stdout.extend_from_slice(&chunk);
                            out_lines.push(&chunk)
                        }
                        Ok(OutputEvent::Stderr(chunk)) => {
                            stderr.extend_from_slice(&chunk);
                            err_lines.push(&chunk)
                        }
                        // The sender is gone: the command finished and everything is drained.
                        Err(_) => break,
                    };
                    if self.echo {
                        console.print_lines(&self.colorhost, &lines).await;
                    }
                }
                result = &mut exec, if status.is_none() => status = Some(result),
                _ = tokio::time::sleep(self.timeout) => {
                    match console.on_timeout(&self.host.hostname, command, self.timeout).await {
                        TimeoutAction::KeepWaiting => continue,
                        TimeoutAction::Abandon => {
                            log::warn!("{} Abandoning '{}'.", self.colorhost, command);
                            let output = CommandOutput {
                                stdout: String::from_utf8_lossy(&stdout).into_owned(),
                                stderr: String::from_utf8_lossy(&stderr).into_owned(),
                                exitcode: -1,
                            };
                            return Ok((output, true));
                        }
                    }
                }
            }
        }
        let exitcode = match status {
            Some(result) => result?,
            None => exec.await?,
        };
        if self.echo {
            let tail: Vec<String> = [out_lines.finish(), err_lines.finish()]
                .into_iter()
                .flatten()
                .chain([format!("=== done ({}) ===", exitcode)])
                .collect();
            console.print_lines(&self.colorhost, &tail).await;
        }
        let output = CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exitcode,
        };
        Ok((output, false))
    }

    /// Reads a remote file, `None` if it does not exist.
    pub async fn read_to_string(&mut self, path: &str) -> Result<Option<String>, FleetError> {
        let mut attempt = 1;
        loop {
            let result = self.transport()?.read_file(path).await;
            match result {
                Ok(data) => return Ok(Some(String::from_utf8_lossy(&data).into_owned())),
                Err(FleetError::NotFound { .. }) => return Ok(None),
                Err(error) => self.recover(&mut attempt, error).await?,
            }
        }
    }

    pub async fn write(
        &mut self,
        path: &str,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<(), FleetError> {
        let mut attempt = 1;
        loop {
            let result = self.transport()?.write_file(path, data, mode).await;
            match result {
                Ok(()) => return Ok(()),
                Err(error) => self.recover(&mut attempt, error).await?,
            }
        }
    }

    /// Uploads `local` to `remote`, creating missing parent directories, and marks the
    /// result executable.
    pub async fn put(&mut self, local: &Path, remote: &str) -> Result<(), FleetError> {
        let data = tokio::fs::read(local).await?;
        let parent = parent_dir(remote);
        let mut attempt = 1;
        loop {
            let transport = self.transport()?;
            let result = async {
                if let Some(parent) = parent {
                    transport.create_dir_all(parent).await?;
                }
                transport
                    .write_file(remote, &data, WriteMode::Truncate)
                    .await?;
                transport.chmod(remote, 0o755).await
            }
            .await;
            match result {
                Ok(()) => break,
                Err(error) => self.recover(&mut attempt, error).await?,
            }
        }
        log::debug!("{} put {} -> {}", self.colorhost, local.display(), remote);
        Ok(())
    }

    /// Downloads `remote` into `local`, creating missing local parent directories.
    pub async fn get(&mut self, remote: &str, local: &Path) -> Result<(), FleetError> {
        let mut attempt = 1;
        let data = loop {
            let result = self.transport()?.read_file(remote).await;
            match result {
                Ok(data) => break data,
                Err(error) => self.recover(&mut attempt, error).await?,
            }
        };
        if let Some(parent) = local.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(local, data).await?;
        log::debug!("{} get {} -> {}", self.colorhost, remote, local.display());
        Ok(())
    }

    pub async fn listdir(&mut self, path: &str) -> Result<Vec<DirEntry>, FleetError> {
        let mut attempt = 1;
        loop {
            let result = self.transport()?.list_dir(path).await;
            match result {
                Ok(entries) => return Ok(entries),
                Err(error) => self.recover(&mut attempt, error).await?,
            }
        }
    }

    pub async fn remove(&mut self, path: &str) -> Result<(), FleetError> {
        let mut attempt = 1;
        loop {
            let result = self.transport()?.remove_file(path).await;
            match result {
                Ok(()) => return Ok(()),
                Err(error) => self.recover(&mut attempt, error).await?,
            }
        }
    }

    async fn remove_empty_dir(&mut self, path: &str) -> Result<(), FleetError> {
        let mut attempt = 1;
        loop {
            let result = self.transport()?.remove_dir(path).await;
            match result {
                Ok(()) => return Ok(()),
                Err(error) => self.recover(&mut attempt, error).await?,
            }
        }
    }

    /// Removes `path` and everything below it.
    pub async fn rmdir(&mut self, path: &str) -> Result<(), FleetError> {
        let mut pending = vec![path.trim_end_matches('/').to_owned()];
        let mut dirs = vec![];
        while let Some(dir) = pending.pop() {
            for entry in self.listdir(&dir).await? {
                let child = format!("{}/{}", dir, entry.name);
                if entry.is_dir {
                    pending.push(child);
                } else {
                    self.remove(&child).await?;
                }
            }
            dirs.push(dir);
        }
        // Every directory was discovered after its parent.
        for dir in dirs.iter().rev() {
            self.remove_empty_dir(dir).await?;
        }
        Ok(())
    }

    /// Whether a sub-session can still be opened.
    pub async fn is_active(&self) -> bool {
        match &self.transport {
            Some(transport) => transport.check().await.is_ok(),
            None => false,
        }
    }

    /// Terminates the connection. Calling it again is a no-op.
    pub async fn close(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            log::info!("{} Terminating connection.", self.colorhost);
            if let Err(e) = transport.close().await {
                log::warn!("{} Error while terminating: {}", self.colorhost, e);
            }
        }
    }
}

fn parent_dir(path: &str) -> Option<&str> {
    let (parent, _) = path.trim_end_matches('/').rsplit_once('/')?;
    (!parent.is_empty()).then_some(parent)
}
