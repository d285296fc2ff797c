//! Shared console.
//!
//! Every worker of a group run holds a clone of the same `Console`. Anything written to the
//! terminal, and every question put to the operator, goes through its lock so that output from
//! concurrently running hosts never interleaves within a write.

use std::io::{BufRead, Write};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use colored::ColoredString;
use tokio::sync::Mutex;

use crate::transport::Credential;

/// What to do with a command that stayed silent for a whole timeout window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutAction {
    KeepWaiting,
    Abandon,
}

/// The human in front of the terminal.
#[async_trait]
pub trait Operator: Send + Sync {
    async fn confirm(&self, question: &str) -> bool;

    async fn on_timeout(&self, host: &str, command: &str, waited: Duration) -> TimeoutAction;

    /// Asked once key-based authentication to `host` was rejected.
    async fn credential(&self, host: &str) -> Option<Credential>;
}

/// Asks on the controlling terminal.
///
/// One thread owns stdin and forwards its lines. A prompt that was cancelled leaves no reader
/// behind; whatever was typed for it is dropped when the next question is asked.
pub struct TerminalOperator {
    lines: flume::Receiver<String>,
}

impl TerminalOperator {
    pub fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        std::thread::spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
        Self::from_lines(rx)
    }

    fn from_lines(lines: flume::Receiver<String>) -> Self {
        Self { lines }
    }

    async fn ask(&self, question: String) -> Option<String> {
        self.lines.try_iter().for_each(drop);
        eprint!("{} ", question);
        std::io::stderr().flush().ok()?;
        // Closed stdin ends the channel.
        let line = self.lines.recv_async().await.ok()?;
        Some(line.trim().to_owned())
    }
}

impl Default for TerminalOperator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Operator for TerminalOperator {
    async fn confirm(&self, question: &str) -> bool {
        match self.ask(format!("{} [Y/n]", question)).await {
            Some(answer) => answer.is_empty() || answer.eq_ignore_ascii_case("y"),
            None => false,
        }
    }

    async fn on_timeout(&self, host: &str, command: &str, waited: Duration) -> TimeoutAction {
        let question = format!(
            "[{}] '{}' produced no output for {}s. Keep waiting? [Y/n]",
            host,
            command,
            waited.as_secs()
        );
        match self.ask(question).await {
            Some(answer) if answer.eq_ignore_ascii_case("n") => TimeoutAction::Abandon,
            // Closed stdin cannot answer; let the command run.
            _ => TimeoutAction::KeepWaiting,
        }
    }

    async fn credential(&self, host: &str) -> Option<Credential> {
        let question = format!("[{}] Key authentication failed. Identity file to try:", host);
        self.ask(question)
            .await
            .filter(|path| !path.is_empty())
            .map(|path| Credential::Identity(path.into()))
    }
}

/// Never asks. Confirms every gate and answers timeouts with a fixed action.
pub struct Unattended {
    pub on_timeout: TimeoutAction,
}

impl Default for Unattended {
    fn default() -> Self {
        Self {
            on_timeout: TimeoutAction::KeepWaiting,
        }
    }
}

#[async_trait]
impl Operator for Unattended {
    async fn confirm(&self, _question: &str) -> bool {
        true
    }

    async fn on_timeout(&self, host: &str, command: &str, waited: Duration) -> TimeoutAction {
        log::warn!(
            "[{}] '{}' silent for {}s: {:?}",
            host,
            command,
            waited.as_secs(),
            self.on_timeout
        );
        self.on_timeout
    }

    async fn credential(&self, _host: &str) -> Option<Credential> {
        None
    }
}

#[derive(Clone)]
pub struct Console {
    out: Arc<Mutex<Box<dyn Write + Send>>>,
    operator: Arc<dyn Operator>,
}

impl Console {
    pub fn new(operator: Arc<dyn Operator>) -> Self {
        Self::with_output(operator, Box::new(std::io::stdout()))
    }

    /// Like `new`, but host output goes to `out` instead of stdout.
    pub fn with_output(operator: Arc<dyn Operator>, out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Arc::new(Mutex::new(out)),
            operator,
        }
    }

    pub fn unattended() -> Self {
        Self::new(Arc::new(Unattended::default()))
    }

    /// Writes `lines` under one acquisition of the console lock.
    pub async fn print_lines(&self, prefix: &ColoredString, lines: &[String]) {
        if lines.is_empty() {
            return;
        }
        let mut out = self.out.lock().await;
        for line in lines {
            // A closed stdout is not worth failing the command over.
            let _ = writeln!(out, "{} {}", prefix, line);
        }
        let _ = out.flush();
    }

    pub async fn confirm(&self, question: &str) -> bool {
        let _guard = self.out.lock().await;
        self.operator.confirm(question).await
    }

    pub async fn on_timeout(&self, host: &str, command: &str, waited: Duration) -> TimeoutAction {
        let _guard = self.out.lock().await;
        self.operator.on_timeout(host, command, waited).await
    }

    pub async fn credential(&self, host: &str) -> Option<Credential> {
        let _guard = self.out.lock().await;
        self.operator.credential(host).await
    }
}

/// Cuts a byte stream into lines at `\r` or `\n`, decoding lossily.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
    after_cr: bool,
}

impl LineSplitter {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = vec![];
        let mut start = 0;
        for end in memchr::memchr2_iter(b'\r', b'\n', &self.pending) {
            let delimiter = self.pending[end];
            // "\r\n" yields one line, not an extra empty one.
            if !(delimiter == b'\n' && end == start && self.after_cr) {
                lines.push(String::from_utf8_lossy(&self.pending[start..end]).into_owned());
            }
            self.after_cr = delimiter == b'\r';
            start = end + 1;
        }
        self.pending.drain(..start);
        lines
    }

    /// The trailing partial line, if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(line)
    }
}
