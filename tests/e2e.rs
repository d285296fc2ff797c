//! End-to-end tests for Fleet group runs.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use fleet_ssh::command::CommandSpec;
use fleet_ssh::console::Console;
use fleet_ssh::dispatcher::{require_all, HostGroup, HostOutcome, Status};
use fleet_ssh::error::FleetError;
use fleet_ssh::failure::FailureRules;
use fleet_ssh::host::{ExecMode, Host, HostState};
use fleet_ssh::lock::{Identity, LOCK_PATH};
use fleet_ssh::session::RetryPolicy;
use fleet_ssh::target::TargetOptions;

use common::{console, quick_host, Executed, MockConnector, ScriptedOperator};

fn options() -> TargetOptions {
    TargetOptions {
        identity: Identity::new("alice", 100),
        rules: Arc::new(FailureRules::default()),
        retry: RetryPolicy {
            max_attempts: 2,
            backoff: Duration::ZERO,
        },
    }
}

fn serial_host(hostname: &str) -> Host {
    let mut host = quick_host(hostname);
    host.mode = ExecMode::Serial;
    host
}

async fn connect_group(
    connector: &Arc<MockConnector>,
    hosts: Vec<Host>,
    console: Console,
) -> HostGroup {
    let (group, failed) =
        HostGroup::connect(hosts, Arc::clone(connector) as _, console, options()).await;
    assert!(failed.is_empty());
    group
}

fn executed(connector: &MockConnector, hostname: &str) -> Vec<Executed> {
    connector.remote(hostname).state().executed.clone()
}

fn status_of<'a>(outcomes: &'a [HostOutcome], hostname: &str) -> &'a Status {
    &outcomes
        .iter()
        .find(|outcome| outcome.hostname == hostname)
        .unwrap()
        .status
}

#[tokio::test]
async fn test_parallel_hosts_run_concurrently() {
    let connector = MockConnector::new();
    let hostnames = ["alpha", "beta", "gamma", "delta"];
    for hostname in hostnames {
        connector.remote(hostname).state().delay = Duration::from_millis(200);
    }
    let hosts = hostnames.iter().map(|h| quick_host(h)).collect();
    let group = connect_group(&connector, hosts, Console::unattended()).await;

    let start = Instant::now();
    let outcomes = group.run("echo {{hostname}}").await.unwrap();
    let elapsed = start.elapsed();

    assert_eq!(outcomes.len(), 4);
    assert!(outcomes
        .iter()
        .all(|outcome| matches!(outcome.status, Status::Exited(0))));
    // Roughly the slowest host, not the sum.
    assert!(elapsed < Duration::from_millis(600), "took {:?}", elapsed);

    let runs: Vec<Executed> = hostnames
        .iter()
        .flat_map(|hostname| executed(&connector, hostname))
        .collect();
    let last_start = runs.iter().map(|run| run.started).max().unwrap();
    let first_finish = runs.iter().filter_map(|run| run.finished).min().unwrap();
    assert!(last_start < first_finish);

    for hostname in hostnames {
        let target = group.get(hostname).await.unwrap();
        assert_eq!(target.lock().await.last_stdout(), format!("{}\n", hostname));
    }
}

#[tokio::test]
async fn test_serial_hosts_follow_parallel_batch_in_order() {
    let connector = MockConnector::new();
    connector.remote("alpha").state().delay = Duration::from_millis(100);
    let operator = Arc::new(ScriptedOperator::new());
    let hosts = vec![serial_host("beta"), quick_host("alpha"), serial_host("gamma")];
    let group = connect_group(&connector, hosts, console(&operator)).await;

    let outcomes = group.run("uname -r").await.unwrap();
    assert_eq!(outcomes.len(), 3);

    let alpha = executed(&connector, "alpha").remove(0);
    let beta = executed(&connector, "beta").remove(0);
    let gamma = executed(&connector, "gamma").remove(0);
    assert!(alpha.finished.unwrap() <= beta.started);
    assert!(beta.finished.unwrap() <= gamma.started);

    let questions = operator.questions();
    assert_eq!(questions.len(), 2);
    assert!(questions[0].starts_with("[beta]"));
    assert!(questions[1].starts_with("[gamma]"));
}

#[tokio::test]
async fn test_declined_serial_host_is_skipped() {
    let connector = MockConnector::new();
    let operator = Arc::new(ScriptedOperator::answering(&[false, true]));
    let hosts = vec![quick_host("alpha"), serial_host("beta"), serial_host("gamma")];
    let group = connect_group(&connector, hosts, console(&operator)).await;

    let outcomes = group.run("zypper -n up").await.unwrap();
    assert!(matches!(status_of(&outcomes, "beta"), Status::Skipped));
    assert!(matches!(status_of(&outcomes, "gamma"), Status::Exited(0)));
    assert!(executed(&connector, "beta").is_empty());
    assert_eq!(connector.remote("gamma").commands(), vec!["zypper -n up"]);
}

#[tokio::test]
async fn test_parallel_disabled_serial_scenario() {
    let connector = MockConnector::new();
    connector.remote("a").state().delay = Duration::from_millis(100);
    let mut b = quick_host("b");
    b.state = HostState::Disabled;
    let operator = Arc::new(ScriptedOperator::new());
    let group = connect_group(
        &connector,
        vec![quick_host("a"), b, serial_host("c")],
        console(&operator),
    )
    .await;

    group.run("echo hi").await.unwrap();

    let a = group.get("a").await.unwrap();
    let a = a.lock().await;
    assert_eq!(a.last_stdout(), "hi\n");
    assert_eq!(a.last_exitcode(), Some(0));
    let b = group.get("b").await.unwrap();
    let b = b.lock().await;
    assert_eq!(b.log().len(), 1);
    assert_eq!(b.last().unwrap().command, "");
    let c = group.get("c").await.unwrap();
    assert_eq!(c.lock().await.last_stdout(), "hi\n");

    let a_run = executed(&connector, "a").remove(0);
    let c_run = executed(&connector, "c").remove(0);
    let (_, asked) = operator.questions.lock().unwrap()[0].clone();
    assert!(a_run.finished.unwrap() <= asked);
    assert!(asked <= c_run.started);
}

#[tokio::test]
async fn test_mixed_states_and_modes() {
    let connector = MockConnector::new();
    let mut b = serial_host("b");
    b.state = HostState::Dryrun;
    let mut c = quick_host("c");
    c.state = HostState::Disabled;
    let group = connect_group(
        &connector,
        vec![quick_host("a"), b, c],
        Console::unattended(),
    )
    .await;

    let outcomes = group.run("echo x").await.unwrap();
    assert_eq!(outcomes.len(), 3);
    assert_eq!(connector.remote("a").commands(), vec!["echo x"]);
    assert!(executed(&connector, "b").is_empty());
    assert!(executed(&connector, "c").is_empty());

    let a = group.get("a").await.unwrap();
    assert_eq!(a.lock().await.last_stdout(), "x\n");
    let b = group.get("b").await.unwrap();
    assert_eq!(b.lock().await.last_stdout(), "dryrun\n");
    let c = group.get("c").await.unwrap();
    assert_eq!(c.lock().await.last().unwrap().command, "");
}

#[tokio::test]
async fn test_interrupt_cuts_running_hosts() {
    let connector = MockConnector::new();
    for hostname in ["alpha", "beta", "gamma"] {
        connector.remote(hostname).state().hang = true;
    }
    let operator = Arc::new(ScriptedOperator::new());
    let hosts = vec![quick_host("alpha"), quick_host("beta"), serial_host("gamma")];
    let mut group = connect_group(&connector, hosts, console(&operator)).await;

    let interrupt = group.interrupt_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        interrupt.cancel();
    });
    let start = Instant::now();
    let err = group.run("sleep 1000").await.unwrap_err();
    assert!(matches!(err, FleetError::Interrupted));
    assert!(start.elapsed() < Duration::from_secs(2));

    for hostname in ["alpha", "beta"] {
        let remote = connector.remote(hostname);
        assert_eq!(remote.state().closes, 1);
        assert!(remote.state().executed[0].finished.is_none());
    }
    // Serial hosts are never reached.
    assert!(operator.questions().is_empty());
    assert!(executed(&connector, "gamma").is_empty());

    // Later runs fail right away until the token is reset.
    assert!(matches!(
        group.run("true").await,
        Err(FleetError::Interrupted)
    ));
    group.reset_interrupt();
    connector.remote("gamma").state().hang = false;
    let outcomes = group.run("true").await.unwrap();
    assert!(matches!(status_of(&outcomes, "gamma"), Status::Exited(0)));
    assert!(matches!(status_of(&outcomes, "alpha"), Status::Failed(_)));

    group.close_all(None).await;
}

#[tokio::test]
async fn test_per_host_commands() {
    let connector = MockConnector::new();
    let mut alpha = quick_host("alpha");
    alpha.system = "sles15sp5-x86_64".to_owned();
    let group = connect_group(
        &connector,
        vec![alpha, quick_host("beta"), quick_host("gamma")],
        Console::unattended(),
    )
    .await;

    let spec = CommandSpec::PerHost(HashMap::from([
        ("alpha".to_owned(), "echo {{system}}".to_owned()),
        ("beta".to_owned(), "echo beta only".to_owned()),
    ]));
    let outcomes = group.run(spec).await.unwrap();
    assert_eq!(outcomes.len(), 2);
    assert_eq!(
        connector.remote("alpha").commands(),
        vec!["echo sles15sp5-x86_64"]
    );
    assert_eq!(connector.remote("beta").commands(), vec!["echo beta only"]);
    assert!(executed(&connector, "gamma").is_empty());
}

#[tokio::test]
async fn test_group_lock_and_close() {
    let connector = MockConnector::new();
    connector
        .remote("beta")
        .set_file(LOCK_PATH, "1700000000:bob:7:firmware flash\n");
    let mut group = connect_group(
        &connector,
        vec![quick_host("alpha"), quick_host("beta")],
        Console::unattended(),
    )
    .await;

    let outcomes = group.lock(Some("regression run".to_owned())).await.unwrap();
    assert!(matches!(status_of(&outcomes, "alpha"), Status::Done));
    assert!(matches!(status_of(&outcomes, "beta"), Status::Skipped));
    assert!(connector
        .remote("alpha")
        .file(LOCK_PATH)
        .unwrap()
        .contains(":alice:100:regression run"));

    let outcomes = group.unlock(false).await.unwrap();
    assert!(matches!(
        status_of(&outcomes, "beta"),
        Status::Failed(FleetError::LockNotOwned { .. })
    ));
    assert!(matches!(
        require_all(outcomes),
        Err(FleetError::LockNotOwned { .. })
    ));
    assert_eq!(connector.remote("alpha").file(LOCK_PATH), None);

    group.lock(None).await.unwrap();
    group.close_all(None).await;
    assert!(group.is_empty());
    assert_eq!(connector.remote("alpha").file(LOCK_PATH), None);
    assert!(connector.remote("beta").file(LOCK_PATH).is_some());
}

#[tokio::test]
async fn test_group_management() {
    let connector = MockConnector::new();
    connector.remote("beta").state().reject_keys = true;
    let (mut group, failed) = HostGroup::connect(
        vec![quick_host("alpha"), quick_host("beta"), quick_host("gamma")],
        Arc::clone(&connector) as _,
        Console::unattended(),
        options(),
    )
    .await;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].0, "beta");
    assert!(matches!(failed[0].1, FleetError::Authentication { .. }));
    assert_eq!(group.hostnames().await, vec!["alpha", "gamma"]);

    assert!(group.set_state("gamma", HostState::Dryrun).await);
    assert!(group.set_mode("alpha", ExecMode::Serial).await);
    assert!(!group.set_state("beta", HostState::Enabled).await);
    group.run("echo hi").await.unwrap();
    assert!(executed(&connector, "gamma").is_empty());
    assert_eq!(connector.remote("alpha").commands(), vec!["echo hi"]);

    let gamma = group.get("gamma").await.unwrap();
    group.run_on(&[gamma], "echo only gamma").await.unwrap();
    assert_eq!(connector.remote("alpha").commands(), vec!["echo hi"]);

    assert!(group.remove("alpha", None).await);
    assert!(!group.remove("alpha", None).await);
    assert_eq!(connector.remote("alpha").state().closes, 1);
    assert_eq!(group.len(), 1);
    assert!(group.get("alpha").await.is_none());
}
