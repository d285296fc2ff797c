use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use fleet_ssh::config::{Action, Config};
use fleet_ssh::console::{Console, TerminalOperator};
use fleet_ssh::dispatcher::{HostGroup, HostOutcome, Status};
use fleet_ssh::error::FleetError;
use fleet_ssh::failure::FailureRules;
use fleet_ssh::host::get_hosts;
use fleet_ssh::lock::Identity;
use fleet_ssh::session::RetryPolicy;
use fleet_ssh::ssh::SshConnector;
use fleet_ssh::target::TargetOptions;

async fn perform(action: &Action, group: &HostGroup) -> Result<Vec<HostOutcome>, FleetError> {
    match action {
        Action::Run { command } => group.run(command.as_str()).await,
        Action::Put { local, remote } => group.put(local.clone(), remote).await,
        Action::Get { remote, local } => group.get_file(remote, local.clone()).await,
        Action::Lock { comment } => group.lock(comment.clone()).await,
        Action::Unlock { force } => group.unlock(*force).await,
        Action::Versions { packages } => {
            let outcomes = group.query_versions(packages.clone()).await?;
            show_versions(group, packages).await;
            Ok(outcomes)
        }
        Action::History { count } => Ok(show_history(group, *count).await),
    }
}

async fn show_versions(group: &HostGroup, packages: &[String]) {
    for target in group.targets() {
        let target = target.lock().await;
        let lines: Vec<String> = packages
            .iter()
            .filter_map(|name| {
                let package = target.packages().get(name)?;
                let current = package.current.as_ref()?;
                Some(format!("{} {}", name, current))
            })
            .collect();
        group.console().print_lines(target.colorhost(), &lines).await;
    }
}

async fn show_history(group: &HostGroup, count: usize) -> Vec<HostOutcome> {
    let mut outcomes = vec![];
    for target in group.targets() {
        let mut target = target.lock().await;
        let hostname = target.hostname().to_owned();
        let status = match target.history(count).await {
            Ok(entries) => {
                let lines: Vec<String> = entries.iter().map(ToString::to_string).collect();
                group.console().print_lines(target.colorhost(), &lines).await;
                Status::Done
            }
            Err(e) => {
                log::warn!("{} {}", target.colorhost(), e);
                Status::Failed(e)
            }
        };
        outcomes.push(HostOutcome { hostname, status });
    }
    outcomes
}

/// Logs one line per host. Returns whether every host succeeded.
fn report(outcomes: &[HostOutcome]) -> bool {
    let mut succeeded = true;
    for outcome in outcomes {
        match &outcome.status {
            Status::Exited(0) | Status::Done => {
                log::info!("[{}] OK", outcome.hostname);
            }
            Status::Exited(code) => {
                log::warn!("[{}] Exited with {}", outcome.hostname, code);
                succeeded = false;
            }
            Status::Skipped => log::warn!("[{}] Skipped", outcome.hostname),
            Status::Failed(e) => {
                log::error!("[{}] Failed: {}", outcome.hostname, e);
                succeeded = false;
            }
        }
    }
    succeeded
}

async fn run(cli: Config) -> Result<bool, FleetError> {
    let inventory = get_hosts(&cli.hosts_file)?;
    let mut rules = FailureRules::default();
    rules.extend(inventory.failure_rules);

    let mut hosts = inventory.hosts;
    if let Some(timeout) = cli.timeout {
        for host in &mut hosts {
            host.timeout = timeout;
        }
    }

    let console = if cli.unattended {
        Console::unattended()
    } else {
        Console::new(Arc::new(TerminalOperator::new()))
    };
    let options = TargetOptions {
        identity: Identity::current(),
        rules: Arc::new(rules),
        retry: RetryPolicy {
            max_attempts: cli.max_attempts.max(1),
            ..RetryPolicy::default()
        },
    };
    let (mut group, unreachable) =
        HostGroup::connect(hosts, Arc::new(SshConnector::default()), console, options).await;
    for (hostname, e) in &unreachable {
        log::error!("[{}] Leaving host out: {}", hostname, e);
    }

    let interrupt = group.interrupt_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("[Fleet] Interrupted. Stopping hosts.");
            interrupt.cancel();
        }
    });

    let result = perform(&cli.action, &group).await;
    group.close_all(cli.post).await;
    let outcomes = result?;
    Ok(report(&outcomes) && unreachable.is_empty())
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Config::parse();

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            log::error!("[Fleet] {}", e);
            ExitCode::FAILURE
        }
    }
}
