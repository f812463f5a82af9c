//! End-to-end delivery over the in-memory mesh with real agents on their own
//! tasks.

use std::sync::Arc;
use std::time::Duration;

use fieldsync_agent::{ConfigHandle, NodeAgent};
use fieldsync_coordinator::{Coordinator, Outcome, RetryPolicy, TrackerState};
use fieldsync_net::{MemMesh, MemTransport, SystemClock};
use fieldsync_storage::{
    AuditLog, ConfigStorage, FjallAuditLog, FjallConfigStorage, FjallStore, MemAuditLog,
    MemConfigStorage,
};
use fieldsync_types::{AuditOutcome, ConfigValue, NodeId, Origin};

const COORD: NodeId = 100;

fn fast_policy() -> RetryPolicy {
    RetryPolicy { base_timeout_ms: 40, max_backoff_ms: 160, max_attempts: 5, jitter_ms: 5 }
}

async fn spawn_agent(mesh: &MemMesh, node_id: NodeId, storage: MemConfigStorage) -> ConfigHandle {
    let link = Arc::new(mesh.endpoint(node_id).await);
    let agent = NodeAgent::boot(
        node_id,
        Arc::new(storage),
        Arc::new(MemAuditLog::new()),
        Arc::new(SystemClock),
    )
    .await
    .unwrap();
    let handle = agent.handle();
    tokio::spawn(agent.run(link));
    handle
}

async fn coordinator(
    mesh: &MemMesh,
    audit: MemAuditLog,
) -> Coordinator<MemTransport, MemAuditLog, SystemClock> {
    let link = Arc::new(mesh.endpoint(COORD).await);
    Coordinator::new(link, Arc::new(audit), Arc::new(SystemClock), fast_policy())
}

#[tokio::test]
async fn reference_patch_reaches_acked() {
    let mesh = MemMesh::new();
    let storage = MemConfigStorage::new();
    let mut handle = spawn_agent(&mesh, 1, storage.clone()).await;
    let audit = MemAuditLog::new();
    let mut coordinator = coordinator(&mesh, audit.clone()).await;

    let patch = coordinator
        .new_patch()
        .set("heartbeatInterval", ConfigValue::UInt(45_000))
        .set("maxRetries", ConfigValue::Int(5))
        .set("enableAutonomousMode", ConfigValue::Bool(true));
    coordinator.issue(patch, &[1]).await.unwrap();
    assert!(coordinator.run_until_settled(Duration::from_secs(5)).await.unwrap());

    assert!(coordinator.outcomes()[&1].is_acked());
    assert_eq!(coordinator.report()[0].attempts, 1);

    let live = handle.changed().await.unwrap();
    assert_eq!(live.heartbeat_interval_ms(), 45_000);
    assert_eq!(live.max_retries(), 5);
    assert!(live.autonomous_mode());
    assert_eq!(live.coordinator_timeout_ms(), 300_000);
    assert_eq!(storage.load().await.unwrap().as_ref(), Some(&*live));

    let events = audit.entries().await;
    assert!(events.iter().all(|e| e.origin == Origin::Coordinator));
    assert_eq!(
        events.iter().map(|e| e.outcome).collect::<Vec<_>>(),
        vec![AuditOutcome::Sent, AuditOutcome::Acked]
    );
}

#[tokio::test]
async fn lossy_uplink_still_converges() {
    let mesh = MemMesh::new();
    spawn_agent(&mesh, 1, MemConfigStorage::new()).await;
    let mut coordinator = coordinator(&mesh, MemAuditLog::new()).await;
    mesh.drop_next(1, COORD, 2).await;

    let patch = coordinator.new_patch().set("taskTimeout", ConfigValue::UInt(90_000));
    coordinator.issue(patch, &[1]).await.unwrap();
    assert!(coordinator.run_until_settled(Duration::from_secs(5)).await.unwrap());

    let entry = &coordinator.report()[0];
    assert_eq!(entry.state, TrackerState::Acked);
    assert_eq!(entry.attempts, 3);
}

#[tokio::test]
async fn partitioned_node_gives_up_while_others_ack() {
    let mesh = MemMesh::new();
    for node_id in [1, 2, 3] {
        spawn_agent(&mesh, node_id, MemConfigStorage::new()).await;
    }
    mesh.partition(2).await;
    let mut coordinator = coordinator(&mesh, MemAuditLog::new()).await;

    let patch = coordinator.new_patch().set("enableTaskExecution", ConfigValue::Bool(false));
    coordinator.issue(patch, &[1, 2, 3]).await.unwrap();
    assert!(coordinator.run_until_settled(Duration::from_secs(10)).await.unwrap());

    let outcomes = coordinator.outcomes();
    assert!(outcomes[&1].is_acked());
    assert!(outcomes[&3].is_acked());
    assert_eq!(outcomes[&2], Outcome::GivenUp { attempts: 5 });
}

#[tokio::test]
async fn rejected_patch_reports_every_violation() {
    let mesh = MemMesh::new();
    spawn_agent(&mesh, 1, MemConfigStorage::new()).await;
    let mut coordinator = coordinator(&mesh, MemAuditLog::new()).await;

    let patch = coordinator
        .new_patch()
        .set("heartbeatInterval", ConfigValue::UInt(5_000))
        .set("maxRetries", ConfigValue::Int(15));
    coordinator.issue(patch, &[1]).await.unwrap();
    assert!(coordinator.run_until_settled(Duration::from_secs(5)).await.unwrap());

    let outcome = &coordinator.outcomes()[&1];
    assert_eq!(
        outcome.to_string(),
        "failed: heartbeatInterval out of range (10s-10min); maxRetries out of range (0-10);"
    );
}

#[tokio::test]
async fn deadline_bounds_the_wait() {
    let mesh = MemMesh::new();
    mesh.endpoint(1).await;
    mesh.partition(1).await;
    let mut coordinator = Coordinator::new(
        Arc::new(mesh.endpoint(COORD).await),
        Arc::new(MemAuditLog::new()),
        Arc::new(SystemClock),
        RetryPolicy { base_timeout_ms: 10_000, max_backoff_ms: 10_000, max_attempts: 3, jitter_ms: 0 },
    );

    let patch = coordinator.new_patch().set("maxRetries", ConfigValue::Int(2));
    coordinator.issue(patch, &[1]).await.unwrap();
    let settled = coordinator.run_until_settled(Duration::from_millis(100)).await.unwrap();
    assert!(!settled);
    assert_eq!(coordinator.outcomes()[&1], Outcome::Pending { attempts: 1 });
}

#[tokio::test]
async fn fjall_backed_agent_keeps_config_across_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mesh = MemMesh::new();

    {
        let store = FjallStore::open(dir.path()).unwrap();
        let link = Arc::new(mesh.endpoint(7).await);
        let agent = NodeAgent::boot(
            7,
            Arc::new(FjallConfigStorage(store.clone())),
            Arc::new(FjallAuditLog::open(store).unwrap()),
            Arc::new(SystemClock),
        )
        .await
        .unwrap();
        let task = tokio::spawn(agent.run(link));

        let mut coordinator = coordinator(&mesh, MemAuditLog::new()).await;
        let patch = coordinator.new_patch().set("coordinatorTimeout", ConfigValue::UInt(600_000));
        coordinator.issue(patch, &[7]).await.unwrap();
        assert!(coordinator.run_until_settled(Duration::from_secs(5)).await.unwrap());
        task.abort();
        let _ = task.await;
    }

    let store = FjallStore::open(dir.path()).unwrap();
    let audit = FjallAuditLog::open(store.clone()).unwrap();
    let agent = NodeAgent::boot(
        7,
        Arc::new(FjallConfigStorage(store)),
        Arc::new(audit),
        Arc::new(SystemClock),
    )
    .await
    .unwrap();
    assert_eq!(agent.config().coordinator_timeout_ms(), 600_000);
    assert_eq!(agent.config().last_applied_patch_id(), Some(1));
}

#[tokio::test]
async fn agent_audit_records_the_apply() {
    let mesh = MemMesh::new();
    let node_audit = MemAuditLog::new();
    let link = Arc::new(mesh.endpoint(1).await);
    let agent = NodeAgent::boot(
        1,
        Arc::new(MemConfigStorage::new()),
        Arc::new(node_audit.clone()),
        Arc::new(SystemClock),
    )
    .await
    .unwrap();
    tokio::spawn(agent.run(link));

    let mut coordinator = coordinator(&mesh, MemAuditLog::new()).await;
    let patch = coordinator.new_patch().set("maxRetries", ConfigValue::Int(0));
    coordinator.issue(patch, &[1]).await.unwrap();
    assert!(coordinator.run_until_settled(Duration::from_secs(5)).await.unwrap());

    let events = node_audit.read(0, 0).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].1.outcome, AuditOutcome::Applied);
    assert_eq!(events[0].1.origin, Origin::Node(1));
}
