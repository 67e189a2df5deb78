//! Order terminal and kitchen display over a loopback local mesh.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use the_small_sync_lib::models::{KitchenItemStatus, OrderStatus};
use the_small_sync_lib::sync::{ChannelKind, ConnectionState};
use the_small_sync_lib::{db, DeviceRole, Environment, NodeConfig, SyncNode};

const ORDER: &str = r#"{"platform":"swiggy","order_id":"swiggy_4821","status":"pending",
    "customer":{"name":"Ravi"},"items":[{"name":"Veg Biryani","quantity":1,"price":220}],"total":220}"#;

fn config(role: DeviceRole, device_id: &str, mesh_server: Option<String>, dir: &Path) -> NodeConfig {
    NodeConfig {
        tenant_id: "tenant-1".into(),
        device_id: device_id.into(),
        role,
        data_dir: dir.to_path_buf(),
        coordinator_url: None,
        api_key: None,
        admin_url: None,
        mesh_port: 0,
        mesh_server,
        mdns_enabled: false,
        reconcile_interval: Duration::from_secs(300),
        reconcile_startup_delay: Duration::from_secs(30),
        batch_size: 50,
        auto_print_on_accept: false,
        environment: Environment {
            has_local_persistence: false,
            has_native_bridge: true,
        },
    }
}

fn node(config: NodeConfig) -> SyncNode {
    let db = Arc::new(db::open_in_memory().unwrap());
    SyncNode::new(config, db).unwrap()
}

async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

fn mesh_connected(node: &SyncNode) -> bool {
    node.transport().channel_status(ChannelKind::LocalMesh).state == ConnectionState::Connected
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn accepted_order_and_kitchen_bump_cross_the_mesh() {
    let dir = tempfile::tempdir().unwrap();

    let pos = node(config(DeviceRole::Pos, "pos-1", None, dir.path()));
    pos.start().await.unwrap();
    let port = pos.transport().mesh_local_addr().unwrap().port();

    let kds = node(config(
        DeviceRole::Kds,
        "kds-1",
        Some(format!("127.0.0.1:{port}")),
        dir.path(),
    ));
    kds.start().await.unwrap();

    eventually("mesh session", || mesh_connected(&pos) && mesh_connected(&kds)).await;

    // Order taken on the terminal reaches the display.
    pos.ingest_json(ORDER).unwrap();
    let orchestrator = pos.orchestrator().unwrap().clone();
    let kitchen_order_id = orchestrator
        .snapshot("swiggy_4821")
        .and_then(|s| s.kitchen_order)
        .map(|t| t.id)
        .unwrap();
    eventually("ticket on display", || kds.replica().ticket(&kitchen_order_id).is_some()).await;

    // Accepting with a prep time replicates the updated ticket.
    orchestrator.accept_order("swiggy_4821", 25).unwrap();
    eventually("prep time on display", || {
        kds.replica()
            .ticket(&kitchen_order_id)
            .is_some_and(|t| t.estimated_prep_time == 25)
    })
    .await;

    // The display bumps the ticket; the terminal moves the order.
    let sent = kds
        .set_kitchen_status(&kitchen_order_id, KitchenItemStatus::InProgress)
        .unwrap();
    assert_eq!(sent, 1);
    eventually("order preparing on terminal", || {
        orchestrator
            .snapshot("swiggy_4821")
            .is_some_and(|s| s.order.status == OrderStatus::Preparing)
    })
    .await;

    kds.shutdown().await;
    eventually("server sees client leave", || !mesh_connected(&pos)).await;
    pos.shutdown().await;
}

#[tokio::test]
async fn tenant_mismatch_keeps_client_disconnected() {
    let dir = tempfile::tempdir().unwrap();
    let pos = node(config(DeviceRole::Pos, "pos-1", None, dir.path()));
    pos.start().await.unwrap();
    let port = pos.transport().mesh_local_addr().unwrap().port();

    let mut foreign = config(
        DeviceRole::Kds,
        "kds-9",
        Some(format!("127.0.0.1:{port}")),
        dir.path(),
    );
    foreign.tenant_id = "tenant-2".into();
    let kds = node(foreign);
    kds.start().await.unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!mesh_connected(&kds));
    assert!(!mesh_connected(&pos));

    kds.shutdown().await;
    pos.shutdown().await;
}
