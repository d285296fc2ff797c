//! Fan-out across a group of hosts.
//!
//! A run splits the group by scheduling mode. Parallel hosts each get one work item on a shared
//! queue and one worker task popping it, all running at once. Serial hosts follow strictly
//! afterwards, one at a time, each only after the operator confirmed it. The group owns its
//! console and interrupt token; every run builds its own queue.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use colourado::{ColorPalette, PaletteType};
use futures::future::join_all;
use itertools::zip;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::command::{self, CommandSpec};
use crate::console::Console;
use crate::error::FleetError;
use crate::host::{ExecMode, Host, HostState};
use crate::target::{PostAction, Target, TargetOptions, CLOSE_DEADLINE};
use crate::transport::Connector;

pub type SharedTarget = Arc<Mutex<Target>>;

/// One unit of work for one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Work {
    Run(String),
    Put { local: PathBuf, remote: String },
    Get { remote: String, local: PathBuf },
    Lock { comment: Option<String> },
    Unlock { force: bool },
    QueryVersions(Vec<String>),
}

impl fmt::Display for Work {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Work::Run(command) => write!(f, "'{}'", command),
            Work::Put { local, remote } => write!(f, "put {} {}", local.display(), remote),
            Work::Get { remote, local } => write!(f, "get {} {}", remote, local.display()),
            Work::Lock { .. } => write!(f, "lock"),
            Work::Unlock { force: false } => write!(f, "unlock"),
            Work::Unlock { force: true } => write!(f, "force unlock"),
            Work::QueryVersions(names) => write!(f, "query {}", names.join(" ")),
        }
    }
}

#[derive(Debug)]
pub enum Status {
    /// A command ran and exited with this code.
    Exited(i32),
    Done,
    /// Declined at the serial gate, or the host lock belongs to someone else.
    Skipped,
    Failed(FleetError),
}

#[derive(Debug)]
pub struct HostOutcome {
    pub hostname: String,
    pub status: Status,
}

impl HostOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self.status, Status::Failed(_))
    }
}

/// For operations that need every host to agree: the first failure, if any.
pub fn require_all(outcomes: Vec<HostOutcome>) -> Result<(), FleetError> {
    match outcomes.into_iter().find_map(|outcome| match outcome.status {
        Status::Failed(error) => Some(error),
        _ => None,
    }) {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

pub struct HostGroup {
    targets: Vec<SharedTarget>,
    console: Console,
    interrupt: CancellationToken,
}

impl HostGroup {
    pub fn new(console: Console) -> Self {
        Self {
            targets: vec![],
            console,
            interrupt: CancellationToken::new(),
        }
    }

    /// Connects to all `hosts` concurrently. Hosts that fail to connect are left out and
    /// returned alongside the group.
    pub async fn connect(
        hosts: Vec<Host>,
        connector: Arc<dyn Connector>,
        console: Console,
        options: TargetOptions,
    ) -> (Self, Vec<(String, FleetError)>) {
        let mut group = Self::new(console.clone());
        if hosts.is_empty() {
            return (group, vec![]);
        }
        let colors = ColorPalette::new(hosts.len() as u32, PaletteType::Pastel, false).colors;
        let attempts = zip(colors, hosts).map(|(color, host)| {
            let connector = Arc::clone(&connector);
            let console = console.clone();
            let options = options.clone();
            async move {
                let hostname = host.hostname.clone();
                match Target::connect(host, connector, &console, options).await {
                    Ok(mut target) => {
                        target.set_color(color);
                        Ok(target)
                    }
                    Err(error) => Err((hostname, error)),
                }
            }
        });
        let results = join_all(attempts).await;
        let mut failed = vec![];
        for result in results {
            match result {
                Ok(target) => group.add(target),
                Err(failure) => failed.push(failure),
            }
        }
        (group, failed)
    }

    pub fn console(&self) -> &Console {
        &self.console
    }

    pub fn add(&mut self, target: Target) {
        self.targets.push(Arc::new(Mutex::new(target)));
    }

    pub fn targets(&self) -> &[SharedTarget] {
        &self.targets
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub async fn get(&self, hostname: &str) -> Option<SharedTarget> {
        for target in &self.targets {
            if target.lock().await.hostname() == hostname {
                return Some(Arc::clone(target));
            }
        }
        None
    }

    pub async fn hostnames(&self) -> Vec<String> {
        let mut hostnames = Vec::with_capacity(self.targets.len());
        for target in &self.targets {
            hostnames.push(target.lock().await.hostname().to_owned());
        }
        hostnames
    }

    pub async fn set_state(&self, hostname: &str, state: HostState) -> bool {
        match self.get(hostname).await {
            Some(target) => {
                target.lock().await.state = state;
                true
            }
            None => false,
        }
    }

    pub async fn set_mode(&self, hostname: &str, mode: ExecMode) -> bool {
        match self.get(hostname).await {
            Some(target) => {
                target.lock().await.mode = mode;
                true
            }
            None => false,
        }
    }

    /// Token that interrupts the current and all later runs once cancelled.
    pub fn interrupt_token(&self) -> CancellationToken {
        self.interrupt.clone()
    }

    /// Arms a fresh token after an interrupt was handled.
    pub fn reset_interrupt(&mut self) -> CancellationToken {
        self.interrupt = CancellationToken::new();
        self.interrupt.clone()
    }

    /// Runs `commands` on every host. Per-host maps skip hosts they have no command for.
    pub async fn run(
        &self,
        commands: impl Into<CommandSpec>,
    ) -> Result<Vec<HostOutcome>, FleetError> {
        self.run_on(&self.targets, commands).await
    }

    /// Runs `commands` on `targets` only, with the group's console and interrupt.
    pub async fn run_on(
        &self,
        targets: &[SharedTarget],
        commands: impl Into<CommandSpec>,
    ) -> Result<Vec<HostOutcome>, FleetError> {
        let commands = commands.into();
        let mut registry = command::new_registry();
        let mut items = Vec::with_capacity(targets.len());
        for target in targets {
            let host = target.lock().await.host().clone();
            if let Some(command) = commands.for_host(&mut registry, &host)? {
                items.push((Arc::clone(target), Work::Run(command)));
            }
        }
        self.dispatch(items).await
    }

    pub async fn put(
        &self,
        local: impl Into<PathBuf>,
        remote: &str,
    ) -> Result<Vec<HostOutcome>, FleetError> {
        self.broadcast(Work::Put {
            local: local.into(),
            remote: remote.to_owned(),
        })
        .await
    }

    /// Downloads `remote` from every host into `local.<hostname>`.
    pub async fn get_file(
        &self,
        remote: &str,
        local: impl Into<PathBuf>,
    ) -> Result<Vec<HostOutcome>, FleetError> {
        self.broadcast(Work::Get {
            remote: remote.to_owned(),
            local: local.into(),
        })
        .await
    }

    pub async fn lock(&self, comment: Option<String>) -> Result<Vec<HostOutcome>, FleetError> {
        self.broadcast(Work::Lock { comment }).await
    }

    pub async fn unlock(&self, force: bool) -> Result<Vec<HostOutcome>, FleetError> {
        self.broadcast(Work::Unlock { force }).await
    }

    pub async fn query_versions(
        &self,
        names: Vec<String>,
    ) -> Result<Vec<HostOutcome>, FleetError> {
        self.broadcast(Work::QueryVersions(names)).await
    }

    async fn broadcast(&self, work: Work) -> Result<Vec<HostOutcome>, FleetError> {
        let items = self
            .targets
            .iter()
            .map(|target| (Arc::clone(target), work.clone()))
            .collect();
        self.dispatch(items).await
    }

    /// Runs `items`: the parallel hosts all at once, then the serial hosts one by one in the
    /// given order. Fails with `Interrupted` once the interrupt token fires; whatever already
    /// ran stays recorded on the targets.
    pub async fn dispatch(
        &self,
        items: Vec<(SharedTarget, Work)>,
    ) -> Result<Vec<HostOutcome>, FleetError> {
        let mut parallel = vec![];
        let mut serial = vec![];
        for (target, work) in items {
            let mode = target.lock().await.mode;
            match mode {
                ExecMode::Parallel => parallel.push((target, work)),
                ExecMode::Serial => serial.push((target, work)),
            }
        }

        let mut outcomes = self.run_batch(parallel).await;
        if self.interrupt.is_cancelled() {
            return Err(FleetError::Interrupted);
        }

        for (target, work) in serial {
            let hostname = target.lock().await.hostname().to_owned();
            let question = format!("[{}] Serial host: go ahead with {}?", hostname, work);
            let confirmed = tokio::select! {
                confirmed = self.console.confirm(&question) => confirmed,
                _ = self.interrupt.cancelled() => return Err(FleetError::Interrupted),
            };
            if !confirmed {
                log::info!("[{}] Skipped by operator.", hostname);
                outcomes.push(HostOutcome {
                    hostname,
                    status: Status::Skipped,
                });
                continue;
            }
            outcomes.extend(self.run_batch(vec![(target, work)]).await);
            if self.interrupt.is_cancelled() {
                return Err(FleetError::Interrupted);
            }
        }
        Ok(outcomes)
    }

    /// Queues `items` and starts one worker per item. Returns once every worker is done.
    async fn run_batch(&self, items: Vec<(SharedTarget, Work)>) -> Vec<HostOutcome> {
        if items.is_empty() {
            return vec![];
        }
        let (queue_tx, queue_rx) = flume::unbounded();
        let num_workers = items.len();
        for item in items {
            // The receiver is alive, so this cannot fail.
            let _ = queue_tx.send(item);
        }
        drop(queue_tx);

        let workers: Vec<_> = (0..num_workers)
            .map(|_| {
                tokio::spawn(worker(
                    queue_rx.clone(),
                    self.console.clone(),
                    self.interrupt.clone(),
                ))
            })
            .collect();
        let results = join_all(workers).await;

        // Items no worker popped before the interrupt are dropped unrun.
        let unrun = queue_rx.try_iter().count();
        if unrun > 0 {
            log::warn!("Interrupted: {} queued host(s) not started.", unrun);
        }

        results
            .into_iter()
            .filter_map(|result| match result {
                Ok(outcome) => outcome,
                Err(e) => {
                    log::error!("Worker task failed: {}", e);
                    None
                }
            })
            .collect()
    }

    /// Closes every target concurrently and empties the group.
    pub async fn close_all(&mut self, post_action: Option<PostAction>) {
        let console = &self.console;
        // Leaves room for tearing down the transport after the bookkeeping deadline.
        let deadline = CLOSE_DEADLINE + Duration::from_secs(5);
        join_all(self.targets.drain(..).map(|target| async move {
            let close = async {
                target.lock().await.close(post_action, console).await;
            };
            if tokio::time::timeout(deadline, close).await.is_err() {
                log::warn!("Closing a target took longer than {}s.", deadline.as_secs());
            }
        }))
        .await;
    }

    /// Removes `hostname` from the group and closes it.
    pub async fn remove(&mut self, hostname: &str, post_action: Option<PostAction>) -> bool {
        let mut index = None;
        for (i, target) in self.targets.iter().enumerate() {
            if target.lock().await.hostname() == hostname {
                index = Some(i);
                break;
            }
        }
        let Some(index) = index else {
            return false;
        };
        let target = self.targets.remove(index);
        target.lock().await.close(post_action, &self.console).await;
        true
    }
}

/// Pops one item and performs it, unless the run was interrupted first. An interrupt while
/// the item is running cuts the host's connection instead of waiting for it.
async fn worker(
    queue: flume::Receiver<(SharedTarget, Work)>,
    console: Console,
    interrupt: CancellationToken,
) -> Option<HostOutcome> {
    if interrupt.is_cancelled() {
        return None;
    }
    let (shared, work) = queue.try_recv().ok()?;
    let mut target = shared.lock().await;
    let hostname = target.hostname().to_owned();
    let finished = {
        let job = perform(&mut target, &work, &console);
        tokio::select! {
            status = job => Some(status),
            _ = interrupt.cancelled() => None,
        }
    };
    let status = match finished {
        Some(status) => status,
        None => {
            log::warn!("{} Interrupted. Closing connection.", target.colorhost());
            target.abort().await;
            Status::Failed(FleetError::Interrupted)
        }
    };
    Some(HostOutcome { hostname, status })
}

async fn perform(target: &mut Target, work: &Work, console: &Console) -> Status {
    let result = match work {
        Work::Run(command) => target.run(command, console).await.map(Status::Exited),
        Work::Put { local, remote } => target
            .put(local, remote, console)
            .await
            .map(|()| Status::Done),
        Work::Get { remote, local } => target
            .get(remote, local, console)
            .await
            .map(|()| Status::Done),
        Work::Lock { comment } => target
            .acquire_lock(comment.clone())
            .await
            .map(|locked| if locked { Status::Done } else { Status::Skipped }),
        Work::Unlock { force } => target.release_lock(*force).await.map(|()| Status::Done),
        Work::QueryVersions(names) => target
            .query_versions(names.as_slice(), console)
            .await
            .map(|()| Status::Done),
    };
    result.unwrap_or_else(|error| {
        log::warn!("{} {}", target.colorhost(), error);
        Status::Failed(error)
    })
}
