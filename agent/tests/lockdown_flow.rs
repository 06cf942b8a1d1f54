#![allow(missing_docs)]

//! End-to-end lockdown flows driven against the in-memory platform fake:
//! enter/exit round trips, rollback on enter failure, crash recovery, and
//! the wire protocol over the local endpoints.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use common::config::ProctorConfig;
use common::platform::fake::FakePlatform;
use common::platform::{AdapterDns, FirewallRule, Platform, ServiceStatus};
use common::protocol::{Command, LockdownState, Reply};

use agent::coordinator::Coordinator;
use agent::ipc;

fn ip(s: &str) -> Ipv4Addr {
    s.parse().unwrap_or(Ipv4Addr::UNSPECIFIED)
}

fn test_config() -> ProctorConfig {
    let mut cfg = ProctorConfig::default();
    cfg.dns.bind_addr = "127.0.0.1:0".to_string();
    cfg.dns.upstream = "127.0.0.1:1".to_string();
    cfg.allowlist.domains = vec!["codeforces.com".to_string()];
    cfg.watchdog.interval_ms = 20;
    cfg.vpn.interval_ms = 20;
    cfg
}

fn seeded_fake() -> Arc<FakePlatform> {
    let fake = Arc::new(FakePlatform::new());
    fake.set_adapter("Ethernet", AdapterDns::Dhcp);
    fake.set_adapter(
        "Wi-Fi",
        AdapterDns::Static(vec![ip("192.168.1.1")]),
    );
    fake.set_service("Dnscache", ServiceStatus::Running);
    fake.set_dns_answer("codeforces.com", vec![ip("1.1.1.1"), ip("2.2.2.2")]);
    fake
}

fn coordinator_with(fake: &Arc<FakePlatform>) -> Coordinator {
    Coordinator::new(test_config(), Arc::clone(fake) as Arc<dyn Platform>)
}

#[tokio::test]
async fn enter_exit_round_trip_restores_everything() {
    let fake = seeded_fake();
    let coordinator = coordinator_with(&fake);

    assert_eq!(coordinator.dispatch(Command::Enter).await, Reply::Ok);
    assert_eq!(coordinator.state(), LockdownState::Active);
    assert!(coordinator.firewall().is_lockdown_active());
    assert!(fake.outbound_blocked());
    assert_eq!(
        fake.adapter_dns_of("Ethernet"),
        Some(AdapterDns::Static(vec![Ipv4Addr::LOCALHOST]))
    );
    assert_eq!(
        fake.adapter_dns_of("Wi-Fi"),
        Some(AdapterDns::Static(vec![Ipv4Addr::LOCALHOST]))
    );
    assert!(fake.has_rule("Proctor_CF_1_1_1_1_HTTP"));
    assert!(fake.has_rule("Proctor_CF_2_2_2_2_HTTPS"));
    assert!(fake.flush_count() >= 1);

    assert_eq!(coordinator.dispatch(Command::Exit).await, Reply::Ok);
    assert_eq!(coordinator.state(), LockdownState::Inactive);
    assert!(!coordinator.firewall().is_lockdown_active());
    assert!(!fake.outbound_blocked());
    assert!(fake.rule_names_snapshot().is_empty());
    assert_eq!(fake.adapter_dns_of("Ethernet"), Some(AdapterDns::Dhcp));
    assert_eq!(
        fake.adapter_dns_of("Wi-Fi"),
        Some(AdapterDns::Static(vec![ip("192.168.1.1")]))
    );
}

#[tokio::test]
async fn repeated_enter_and_exit_are_no_ops() {
    let fake = seeded_fake();
    let coordinator = coordinator_with(&fake);

    assert_eq!(coordinator.dispatch(Command::Exit).await, Reply::Ok);
    assert_eq!(coordinator.state(), LockdownState::Inactive);

    assert_eq!(coordinator.dispatch(Command::Enter).await, Reply::Ok);
    assert_eq!(coordinator.dispatch(Command::Enter).await, Reply::Ok);
    assert_eq!(coordinator.state(), LockdownState::Active);

    assert_eq!(coordinator.dispatch(Command::Exit).await, Reply::Ok);
    assert_eq!(coordinator.dispatch(Command::Exit).await, Reply::Ok);
    assert_eq!(coordinator.state(), LockdownState::Inactive);
}

#[tokio::test]
async fn enter_failure_rolls_back_and_reports_error() {
    let fake = seeded_fake();
    fake.fail_once("firewall_set_outbound_block");
    let coordinator = coordinator_with(&fake);

    assert_eq!(coordinator.dispatch(Command::Enter).await, Reply::Error);
    assert_eq!(coordinator.state(), LockdownState::Inactive);
    assert!(fake.rule_names_snapshot().is_empty());
    assert_eq!(fake.adapter_dns_of("Ethernet"), Some(AdapterDns::Dhcp));
    assert_eq!(
        fake.adapter_dns_of("Wi-Fi"),
        Some(AdapterDns::Static(vec![ip("192.168.1.1")]))
    );
}

#[tokio::test]
async fn adapter_failure_during_enter_unwinds_dns_filter() {
    let fake = seeded_fake();
    fake.fail_once("set_adapter_dns");
    let coordinator = coordinator_with(&fake);

    assert_eq!(coordinator.dispatch(Command::Enter).await, Reply::Error);
    assert_eq!(coordinator.state(), LockdownState::Inactive);
    assert!(!fake.outbound_blocked());
}

#[tokio::test]
async fn refresh_reconciles_changed_answers() {
    let fake = seeded_fake();
    let coordinator = coordinator_with(&fake);

    assert_eq!(coordinator.dispatch(Command::Enter).await, Reply::Ok);
    fake.set_dns_answer("codeforces.com", vec![ip("2.2.2.2"), ip("3.3.3.3")]);

    assert_eq!(coordinator.dispatch(Command::Refresh).await, Reply::Ok);
    assert!(!fake.has_rule("Proctor_CF_1_1_1_1_HTTP"));
    assert!(!fake.has_rule("Proctor_CF_1_1_1_1_HTTPS"));
    assert!(fake.has_rule("Proctor_CF_2_2_2_2_HTTP"));
    assert!(fake.has_rule("Proctor_CF_3_3_3_3_HTTPS"));

    assert_eq!(coordinator.dispatch(Command::Exit).await, Reply::Ok);
}

#[tokio::test]
async fn refresh_and_status_outside_lockdown_are_accepted() {
    let fake = seeded_fake();
    let coordinator = coordinator_with(&fake);

    assert_eq!(coordinator.dispatch(Command::Refresh).await, Reply::Ok);
    assert_eq!(coordinator.dispatch(Command::Status).await, Reply::Ok);
    assert_eq!(coordinator.state(), LockdownState::Inactive);
    assert!(fake.rule_names_snapshot().is_empty());
}

#[tokio::test]
async fn watchdog_and_sentry_run_while_active() {
    let fake = seeded_fake();
    fake.push_process(500, 1, "cheat-tool.exe");
    fake.push_process(501, 1, "explorer.exe");
    fake.push_interface("Local Area Connection 3", "TAP-Windows Adapter V9", true);
    let coordinator = coordinator_with(&fake);

    assert_eq!(coordinator.dispatch(Command::Enter).await, Reply::Ok);
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(fake.killed_pids().contains(&500));
    assert!(!fake.killed_pids().contains(&501));
    assert_eq!(
        fake.disabled_interfaces(),
        vec!["Local Area Connection 3".to_string()]
    );

    assert_eq!(coordinator.dispatch(Command::Exit).await, Reply::Ok);
}

#[tokio::test]
async fn startup_cleanup_recovers_from_crash() {
    let fake = seeded_fake();
    // Simulate the residue of a crash mid-lockdown.
    fake.set_adapter("Ethernet", AdapterDns::Static(vec![Ipv4Addr::LOCALHOST]));
    fake.set_adapter("Wi-Fi", AdapterDns::Static(vec![Ipv4Addr::LOCALHOST]));
    let _ = fake.firewall_add_rule(&FirewallRule::block("Proctor_BlockHTTPS").tcp(443));
    let _ = fake.firewall_add_rule(&FirewallRule::allow("Proctor_CF_1_1_1_1_HTTP").tcp(80));
    let _ = fake.firewall_set_outbound_block(true);
    fake.set_service("Dnscache", ServiceStatus::Stopped);

    let coordinator = coordinator_with(&fake);
    assert!(coordinator.startup_cleanup());

    assert!(fake.rule_names_snapshot().is_empty());
    assert!(!fake.outbound_blocked());
    assert_eq!(fake.adapter_dns_of("Ethernet"), Some(AdapterDns::Dhcp));
    assert_eq!(fake.adapter_dns_of("Wi-Fi"), Some(AdapterDns::Dhcp));
    assert_eq!(fake.started_services(), vec!["Dnscache".to_string()]);

    // A clean host is left untouched.
    assert!(!coordinator.startup_cleanup());
}

#[cfg(unix)]
mod wire {
    use super::*;

    use common::ipc::{EndpointPaths, IpcClient};
    use tokio::sync::watch;

    async fn send(client: Arc<IpcClient>, command: &'static str) -> Reply {
        tokio::task::spawn_blocking(move || client.send(command, Duration::from_secs(30)))
            .await
            .expect("client task")
            .expect("reply")
    }

    #[tokio::test]
    async fn command_round_trip_over_local_endpoints() {
        let dir = tempfile::tempdir().expect("tempdir");
        let socket_dir = dir.path().to_string_lossy().to_string();

        let mut cfg = test_config();
        cfg.agent.socket_dir = Some(socket_dir.clone());
        let paths = EndpointPaths::new(&cfg.agent.tag, Some(&socket_dir));

        let fake = seeded_fake();
        let coordinator = Arc::new(Coordinator::new(
            cfg,
            Arc::clone(&fake) as Arc<dyn Platform>,
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = tokio::spawn(ipc::serve(
            paths.clone(),
            Duration::from_millis(50),
            Arc::clone(&coordinator),
            shutdown_rx,
        ));

        let client = Arc::new(IpcClient::new(paths));
        assert_eq!(send(Arc::clone(&client), "ENTER\n").await, Reply::Ok);
        assert_eq!(coordinator.state(), LockdownState::Active);
        assert!(fake.has_rule("Proctor_BlockHTTPS"));

        assert_eq!(send(Arc::clone(&client), "FOO\n").await, Reply::Error);
        assert_eq!(coordinator.state(), LockdownState::Active);

        assert_eq!(send(Arc::clone(&client), "status").await, Reply::Ok);
        assert_eq!(send(Arc::clone(&client), "exit").await, Reply::Ok);
        assert_eq!(coordinator.state(), LockdownState::Inactive);
        assert!(fake.rule_names_snapshot().is_empty());

        let _send_result = shutdown_tx.send(true);
        let _join_result = server.await;
    }

    #[tokio::test]
    async fn empty_command_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let socket_dir = dir.path().to_string_lossy().to_string();

        let mut cfg = test_config();
        cfg.agent.socket_dir = Some(socket_dir.clone());
        let paths = EndpointPaths::new(&cfg.agent.tag, Some(&socket_dir));

        let fake = seeded_fake();
        let coordinator = Arc::new(Coordinator::new(
            cfg,
            Arc::clone(&fake) as Arc<dyn Platform>,
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = tokio::spawn(ipc::serve(
            paths.clone(),
            Duration::from_millis(50),
            coordinator,
            shutdown_rx,
        ));

        let client = Arc::new(IpcClient::new(paths));
        assert_eq!(send(client, "\n").await, Reply::Error);

        let _send_result = shutdown_tx.send(true);
        let _join_result = server.await;
    }
}
