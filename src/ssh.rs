//! SSH transport on top of `openssh`.
//!
//! One multiplexed master connection per host. Every command and every file operation opens
//! its own channel on that connection, so stdout and stderr stay separate and a failed
//! sub-session never takes the master down with it.

use std::io::ErrorKind;
use std::process::Output;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join;
use openssh::{KnownHosts, Session as SSHSession, SessionBuilder, Stdio};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use crate::error::FleetError;
use crate::host::Host;
use crate::transport::{Connector, Credential, DirEntry, OutputEvent, Transport, WriteMode};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// Refuse unknown and changed host keys.
    Strict,
    /// Accept and remember unknown host keys, refuse changed ones.
    #[default]
    Add,
}

#[derive(Debug, Clone, Default)]
pub struct SshConnector {
    pub host_keys: HostKeyPolicy,
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(
        &self,
        host: &Host,
        credential: Option<&Credential>,
    ) -> Result<Box<dyn Transport>, FleetError> {
        let mut builder = SessionBuilder::default();
        builder
            .known_hosts_check(match self.host_keys {
                HostKeyPolicy::Strict => KnownHosts::Strict,
                HostKeyPolicy::Add => KnownHosts::Add,
            })
            .port(host.port)
            .connect_timeout(CONNECT_TIMEOUT);
        if let Some(user) = &host.user {
            builder.user(user.clone());
        }
        if let Some(Credential::Identity(path)) = credential {
            builder.keyfile(path);
        }
        let session = builder
            .connect_mux(&host.hostname)
            .await
            .map_err(|e| connect_error(&host.hostname, e))?;
        Ok(Box::new(SshTransport {
            hostname: host.hostname.clone(),
            session: Some(session),
        }))
    }
}

/// Flattens an error and its sources into one line. `openssh` carries the ssh client's
/// diagnostics in the source chain.
fn describe(error: &(dyn std::error::Error + 'static)) -> String {
    let mut reason = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        reason.push_str(": ");
        reason.push_str(&cause.to_string());
        source = cause.source();
    }
    reason
}

fn connect_error(hostname: &str, error: openssh::Error) -> FleetError {
    let host = hostname.to_owned();
    let reason = describe(&error);
    if reason.contains("Host key verification failed")
        || reason.contains("REMOTE HOST IDENTIFICATION HAS CHANGED")
    {
        FleetError::HostKeyMismatch { host }
    } else if reason.contains("Permission denied") || reason.contains("Too many authentication")
    {
        FleetError::Authentication { host, reason }
    } else {
        FleetError::Protocol { host, reason }
    }
}

pub struct SshTransport {
    hostname: String,
    session: Option<SSHSession>,
}

impl SshTransport {
    fn session(&self) -> Result<&SSHSession, FleetError> {
        self.session.as_ref().ok_or_else(|| FleetError::Disconnected {
            host: self.hostname.clone(),
        })
    }

    fn error(&self, operation: &'static str, error: openssh::Error) -> FleetError {
        let host = self.hostname.clone();
        let lost = match &error {
            openssh::Error::Disconnected
            | openssh::Error::Master(_)
            | openssh::Error::SshMux(_) => true,
            openssh::Error::ChildIo(io) => matches!(
                io.kind(),
                ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::UnexpectedEof
            ),
            _ => false,
        };
        let reason = describe(&error);
        if lost {
            FleetError::ChannelLost { host, reason }
        } else {
            FleetError::Remote {
                host,
                operation,
                reason,
            }
        }
    }

    /// Runs a helper script in its own sub-session and collects its output, feeding `input`
    /// to its stdin when given.
    async fn script(
        &self,
        operation: &'static str,
        path: &str,
        script: &str,
        input: Option<&[u8]>,
    ) -> Result<Output, FleetError> {
        let session = self.session()?;
        let mut cmd = session.command("sh");
        cmd.arg("-c")
            .arg(script)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd.spawn().await.map_err(|e| self.error(operation, e))?;
        if let (Some(data), Some(mut stdin)) = (input, child.stdin().take()) {
            stdin.write_all(data).await.map_err(|e| self.lost(e))?;
            stdin.shutdown().await.map_err(|e| self.lost(e))?;
        }
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| self.error(operation, e))?;
        if output.status.success() {
            return Ok(output);
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
        if stderr.contains("No such file or directory") {
            Err(FleetError::NotFound {
                host: self.hostname.clone(),
                path: path.to_owned(),
            })
        } else {
            Err(FleetError::Remote {
                host: self.hostname.clone(),
                operation,
                reason: stderr,
            })
        }
    }

    fn lost(&self, error: std::io::Error) -> FleetError {
        FleetError::ChannelLost {
            host: self.hostname.clone(),
            reason: error.to_string(),
        }
    }
}

/// Single-quotes `s` for the remote POSIX shell.
fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

async fn pump<R: AsyncRead + Unpin>(
    reader: Option<R>,
    output: flume::Sender<OutputEvent>,
    wrap: fn(Vec<u8>) -> OutputEvent,
) -> std::io::Result<()> {
    let Some(mut reader) = reader else {
        return Ok(());
    };
    let mut buf = vec![0u8; 8192];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        // The receiver going away means the caller abandoned the command.
        if output.send_async(wrap(buf[..n].to_vec())).await.is_err() {
            return Ok(());
        }
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn exec(
        &self,
        command: &str,
        output: flume::Sender<OutputEvent>,
    ) -> Result<i32, FleetError> {
        let session = self.session()?;
        let mut cmd = session.command("sh");
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd.spawn().await.map_err(|e| self.error("exec", e))?;
        let (out, err) = join(
            pump(child.stdout().take(), output.clone(), OutputEvent::Stdout),
            pump(child.stderr().take(), output, OutputEvent::Stderr),
        )
        .await;
        out.and(err).map_err(|e| self.lost(e))?;
        let status = child.wait().await.map_err(|e| self.error("exec", e))?;
        // Killed by a signal: report what ssh itself would.
        Ok(status.code().unwrap_or(255))
    }

    async fn check(&self) -> Result<(), FleetError> {
        let session = self.session()?;
        session
            .command("true")
            .status()
            .await
            .map(|_| ())
            .map_err(|e| self.error("check", e))
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, FleetError> {
        let script = format!("cat -- {}", quote(path));
        Ok(self.script("download", path, &script, None).await?.stdout)
    }

    async fn write_file(
        &self,
        path: &str,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<(), FleetError> {
        let redirect = match mode {
            WriteMode::Truncate => ">",
            WriteMode::Append => ">>",
        };
        let script = format!("cat {} {}", redirect, quote(path));
        self.script("upload", path, &script, Some(data)).await?;
        Ok(())
    }

    async fn chmod(&self, path: &str, mode: u32) -> Result<(), FleetError> {
        let script = format!("chmod {:o} -- {}", mode, quote(path));
        self.script("chmod", path, &script, None).await?;
        Ok(())
    }

    async fn create_dir_all(&self, path: &str) -> Result<(), FleetError> {
        let script = format!("mkdir -p -- {}", quote(path));
        self.script("mkdir", path, &script, None).await?;
        Ok(())
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>, FleetError> {
        // -p marks directories with a trailing slash.
        let script = format!("ls -1Ap -- {}", quote(path));
        let output = self.script("listdir", path, &script, None).await?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|line| !line.is_empty())
            .map(|line| match line.strip_suffix('/') {
                Some(name) => DirEntry {
                    name: name.to_owned(),
                    is_dir: true,
                },
                None => DirEntry {
                    name: line.to_owned(),
                    is_dir: false,
                },
            })
            .collect())
    }

    async fn remove_file(&self, path: &str) -> Result<(), FleetError> {
        let script = format!("rm -- {}", quote(path));
        self.script("remove", path, &script, None).await?;
        Ok(())
    }

    async fn remove_dir(&self, path: &str) -> Result<(), FleetError> {
        let script = format!("rmdir -- {}", quote(path));
        self.script("rmdir", path, &script, None).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), FleetError> {
        match self.session.take() {
            Some(session) => session.close().await.map_err(|e| self.error("close", e)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::quote;

    #[test]
    fn test_quote_plain() {
        assert_eq!(quote("/var/lock/fleet.lock"), "'/var/lock/fleet.lock'");
    }

    #[test]
    fn test_quote_embedded_quote() {
        assert_eq!(quote("it's"), r"'it'\''s'");
    }
}
