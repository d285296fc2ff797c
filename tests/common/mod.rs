//! Mock transport shared by the integration tests.
//!
//! `MockConnector` hands out transports backed by one in-memory `Remote` per hostname. A
//! remote records every command with start and finish instants, keeps a small filesystem, and
//! can be told to drop channels, hang, go quiet for a while, or reject key authentication.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use fleet_ssh::console::{Console, Operator, TimeoutAction};
use fleet_ssh::error::FleetError;
use fleet_ssh::host::Host;
use fleet_ssh::transport::{Connector, Credential, DirEntry, OutputEvent, Transport, WriteMode};

/// Record of an executed command.
#[derive(Debug, Clone)]
pub struct Executed {
    pub command: String,
    pub started: Instant,
    pub finished: Option<Instant>,
}

/// Canned reply for one exact command line.
#[derive(Debug, Clone, Default)]
pub struct Reply {
    pub stdout: String,
    pub stderr: String,
    pub exitcode: i32,
}

#[derive(Debug, Default)]
pub struct RemoteState {
    pub files: BTreeMap<String, Vec<u8>>,
    pub modes: HashMap<String, u32>,
    pub dirs: BTreeSet<String>,
    pub removed_dirs: Vec<String>,
    pub executed: Vec<Executed>,
    pub replies: HashMap<String, Reply>,
    /// How many of the next operations fail with a lost channel.
    pub channel_losses: usize,
    /// Silence before a command answers.
    pub delay: Duration,
    /// Commands never answer.
    pub hang: bool,
    pub reject_keys: bool,
    pub connects: usize,
    pub credentials: Vec<Option<Credential>>,
    pub closes: usize,
}

#[derive(Debug, Default)]
pub struct Remote {
    pub hostname: String,
    state: Mutex<RemoteState>,
}

impl Remote {
    pub fn state(&self) -> std::sync::MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap()
    }

    pub fn commands(&self) -> Vec<String> {
        self.state()
            .executed
            .iter()
            .map(|executed| executed.command.clone())
            .collect()
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.state()
            .files
            .get(path)
            .map(|data| String::from_utf8_lossy(data).into_owned())
    }

    pub fn set_file(&self, path: &str, content: &str) {
        self.state()
            .files
            .insert(path.to_owned(), content.as_bytes().to_vec());
    }

    pub fn reply(&self, command: &str, stdout: &str, stderr: &str, exitcode: i32) {
        self.state().replies.insert(
            command.to_owned(),
            Reply {
                stdout: stdout.to_owned(),
                stderr: stderr.to_owned(),
                exitcode,
            },
        );
    }

    /// Consumes one pending channel loss, if any.
    fn lose_channel(&self) -> Result<(), FleetError> {
        let mut state = self.state();
        if state.channel_losses > 0 {
            state.channel_losses -= 1;
            return Err(FleetError::ChannelLost {
                host: self.hostname.clone(),
                reason: "mock channel dropped".to_owned(),
            });
        }
        Ok(())
    }

    fn not_found(&self, path: &str) -> FleetError {
        FleetError::NotFound {
            host: self.hostname.clone(),
            path: path.to_owned(),
        }
    }
}

#[derive(Default)]
pub struct MockConnector {
    remotes: Mutex<HashMap<String, Arc<Remote>>>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The remote behind `hostname`, created on first use.
    pub fn remote(&self, hostname: &str) -> Arc<Remote> {
        let mut remotes = self.remotes.lock().unwrap();
        Arc::clone(remotes.entry(hostname.to_owned()).or_insert_with(|| {
            Arc::new(Remote {
                hostname: hostname.to_owned(),
                ..Remote::default()
            })
        }))
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        host: &Host,
        credential: Option<&Credential>,
    ) -> Result<Box<dyn Transport>, FleetError> {
        let remote = self.remote(&host.hostname);
        {
            let mut state = remote.state();
            state.connects += 1;
            state.credentials.push(credential.cloned());
            if state.reject_keys && credential.is_none() {
                return Err(FleetError::Authentication {
                    host: host.hostname.clone(),
                    reason: "Permission denied (publickey)".to_owned(),
                });
            }
        }
        Ok(Box::new(MockTransport { remote }))
    }
}

pub struct MockTransport {
    remote: Arc<Remote>,
}

fn parent(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some(("", _)) => "/",
        Some((parent, _)) => parent,
        None => ".",
    }
}

fn basename(path: &str) -> &str {
    path.rsplit_once('/').map_or(path, |(_, name)| name)
}

#[async_trait]
impl Transport for MockTransport {
    async fn exec(
        &self,
        command: &str,
        output: flume::Sender<OutputEvent>,
    ) -> Result<i32, FleetError> {
        self.remote.lose_channel()?;
        let (index, delay, hang, reply) = {
            let mut state = self.remote.state();
            state.executed.push(Executed {
                command: command.to_owned(),
                started: Instant::now(),
                finished: None,
            });
            let reply = match state.replies.get(command) {
                Some(reply) => reply.clone(),
                None => match command.strip_prefix("echo ") {
                    Some(text) => Reply {
                        stdout: format!("{}\n", text),
                        ..Reply::default()
                    },
                    None => Reply::default(),
                },
            };
            (state.executed.len() - 1, state.delay, state.hang, reply)
        };
        if hang {
            futures::future::pending::<()>().await;
        }
        tokio::time::sleep(delay).await;
        if !reply.stdout.is_empty() {
            let _ = output.send(OutputEvent::Stdout(reply.stdout.into_bytes()));
        }
        if !reply.stderr.is_empty() {
            let _ = output.send(OutputEvent::Stderr(reply.stderr.into_bytes()));
        }
        self.remote.state().executed[index].finished = Some(Instant::now());
        Ok(reply.exitcode)
    }

    async fn check(&self) -> Result<(), FleetError> {
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, FleetError> {
        self.remote.lose_channel()?;
        self.remote
            .state()
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| self.remote.not_found(path))
    }

    async fn write_file(
        &self,
        path: &str,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<(), FleetError> {
        self.remote.lose_channel()?;
        let mut state = self.remote.state();
        let file = state.files.entry(path.to_owned()).or_default();
        if mode == WriteMode::Truncate {
            file.clear();
        }
        file.extend_from_slice(data);
        Ok(())
    }

    async fn chmod(&self, path: &str, mode: u32) -> Result<(), FleetError> {
        let mut state = self.remote.state();
        if !state.files.contains_key(path) {
            return Err(self.remote.not_found(path));
        }
        state.modes.insert(path.to_owned(), mode);
        Ok(())
    }

    async fn create_dir_all(&self, path: &str) -> Result<(), FleetError> {
        let mut state = self.remote.state();
        let mut dir = path.trim_end_matches('/');
        while !dir.is_empty() && dir != "/" && dir != "." {
            state.dirs.insert(dir.to_owned());
            dir = parent(dir);
        }
        Ok(())
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>, FleetError> {
        let state = self.remote.state();
        if !state.dirs.contains(path) {
            return Err(self.remote.not_found(path));
        }
        let dirs = state.dirs.iter().map(|dir| (dir, true));
        let files = state.files.keys().map(|file| (file, false));
        Ok(dirs
            .chain(files)
            .filter(|(child, _)| parent(child) == path)
            .map(|(child, is_dir)| DirEntry {
                name: basename(child).to_owned(),
                is_dir,
            })
            .collect())
    }

    async fn remove_file(&self, path: &str) -> Result<(), FleetError> {
        self.remote
            .state()
            .files
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| self.remote.not_found(path))
    }

    async fn remove_dir(&self, path: &str) -> Result<(), FleetError> {
        let mut state = self.remote.state();
        let occupied = state.dirs.iter().any(|dir| parent(dir) == path)
            || state.files.keys().any(|file| parent(file) == path);
        if occupied {
            return Err(FleetError::Remote {
                host: self.remote.hostname.clone(),
                operation: "rmdir",
                reason: format!("{}: Directory not empty", path),
            });
        }
        if !state.dirs.remove(path) {
            return Err(self.remote.not_found(path));
        }
        state.removed_dirs.push(path.to_owned());
        Ok(())
    }

    async fn close(&mut self) -> Result<(), FleetError> {
        self.remote.state().closes += 1;
        Ok(())
    }
}

/// Operator with scripted answers that remembers every question.
pub struct ScriptedOperator {
    pub answers: Mutex<VecDeque<bool>>,
    pub on_timeout: TimeoutAction,
    pub credential: Option<Credential>,
    pub questions: Mutex<Vec<(String, Instant)>>,
    pub timeouts: Mutex<usize>,
}

impl ScriptedOperator {
    pub fn new() -> Self {
        Self {
            answers: Mutex::new(VecDeque::new()),
            on_timeout: TimeoutAction::KeepWaiting,
            credential: None,
            questions: Mutex::new(vec![]),
            timeouts: Mutex::new(0),
        }
    }

    pub fn answering(answers: &[bool]) -> Self {
        let operator = Self::new();
        operator.answers.lock().unwrap().extend(answers);
        operator
    }

    pub fn questions(&self) -> Vec<String> {
        self.questions
            .lock()
            .unwrap()
            .iter()
            .map(|(question, _)| question.clone())
            .collect()
    }
}

#[async_trait]
impl Operator for ScriptedOperator {
    async fn confirm(&self, question: &str) -> bool {
        self.questions
            .lock()
            .unwrap()
            .push((question.to_owned(), Instant::now()));
        // Out of scripted answers: say yes.
        self.answers.lock().unwrap().pop_front().unwrap_or(true)
    }

    async fn on_timeout(&self, _host: &str, _command: &str, _waited: Duration) -> TimeoutAction {
        *self.timeouts.lock().unwrap() += 1;
        self.on_timeout
    }

    async fn credential(&self, _host: &str) -> Option<Credential> {
        self.credential.clone()
    }
}

pub fn console(operator: &Arc<ScriptedOperator>) -> Console {
    Console::new(Arc::clone(operator) as Arc<dyn Operator>)
}

pub fn quick_host(hostname: &str) -> Host {
    let mut host = Host::new(hostname);
    host.timeout = 5;
    host
}

/// Collects everything a console prints.
#[derive(Clone, Default)]
pub struct Captured(Arc<Mutex<Vec<u8>>>);

impl Captured {
    pub fn console(&self) -> Console {
        Console::with_output(
            Arc::new(fleet_ssh::console::Unattended::default()),
            Box::new(self.clone()),
        )
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
