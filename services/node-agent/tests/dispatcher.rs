//! Integration tests for concurrent start dispatch.

use std::sync::Arc;
use std::time::Duration;

use nimbus_id::InstanceId;
use nimbus_node_agent::network::MockConnection;
use nimbus_node_agent::virtualizer::MockFault;
use nimbus_node_agent::{
    FailureReason, InstanceConfig, Launcher, LauncherConfig, MockVirtualizer, Resources,
    StartCommand, StartDispatcher, StartReport,
};
use tempfile::TempDir;
use uuid::Uuid;

fn command(id: &str) -> StartCommand {
    StartCommand::new(InstanceConfig {
        instance: InstanceId::parse(id).unwrap(),
        tenant: Uuid::from_u128(1),
        image: "alpine".to_string(),
        resources: Resources::default(),
        network: None,
        container: false,
        restart: false,
    })
}

fn launcher() -> Arc<Launcher> {
    Arc::new(Launcher::new(LauncherConfig {
        networking_enabled: false,
        node_ip: "127.0.0.1".parse().unwrap(),
        storage_cluster_id: None,
        vnic_timeout: Duration::from_secs(1),
    }))
}

#[tokio::test]
async fn test_reports_every_command_once() {
    let root = TempDir::new().unwrap();
    let (dispatcher, mut reports) = StartDispatcher::new(
        launcher(),
        Arc::new(MockVirtualizer::new()),
        Arc::new(MockConnection::new()),
        root.path(),
        3,
    );

    let ids: Vec<String> = (0..10).map(|i| format!("vm-{i:03}")).collect();
    for id in &ids {
        dispatcher.submit(command(id));
    }
    drop(dispatcher);

    let mut seen = Vec::new();
    while let Some(report) = reports.recv().await {
        assert!(matches!(report, StartReport::Started { .. }), "{report:?}");
        seen.push(report.instance_id().to_string());
    }
    seen.sort();
    assert_eq!(seen, ids);

    for id in &ids {
        assert!(root.path().join(id).is_dir());
    }
}

#[tokio::test]
async fn test_failures_are_reported_with_reason() {
    let root = TempDir::new().unwrap();
    let (dispatcher, mut reports) = StartDispatcher::new(
        launcher(),
        Arc::new(MockVirtualizer::failing(MockFault::StartVm)),
        Arc::new(MockConnection::new()),
        root.path(),
        2,
    );

    dispatcher.submit(command("vm-050")).await.unwrap();
    drop(dispatcher);

    match reports.recv().await {
        Some(StartReport::Failed(failure)) => {
            assert_eq!(failure.instance_id.as_str(), "vm-050");
            assert_eq!(failure.reason, FailureReason::LaunchFailure);
        }
        other => panic!("unexpected report: {other:?}"),
    }
    assert!(reports.recv().await.is_none());
}
