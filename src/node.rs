//! Wiring of one device: persistence, orchestrator or replica, transport,
//! router and the background workers, with explicit `start` / `shutdown`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api::HttpRemoteApi;
use crate::board::OrderBoard;
use crate::config::{DeviceRole, NodeConfig};
use crate::db::DbState;
use crate::error::NodeError;
use crate::ingest::InboundOrder;
use crate::models::KitchenItemStatus;
use crate::orchestrator::{Collaborators, OrchestratorConfig, OrderOrchestrator};
use crate::print::{self, PrintSpooler};
use crate::reconcile::ReconciliationJob;
use crate::replica::KitchenReplica;
use crate::repository::SqliteRepository;
use crate::roster::{FloorTable, Roster, StaffMember};
use crate::router::EventRouter;
use crate::sinks::SyncSink;
use crate::sync::{SyncEvent, SyncTransport, TransportConfig, TransportStatus};

const PRINT_INTERVAL: Duration = Duration::from_secs(2);
const URGENCY_INTERVAL: Duration = Duration::from_secs(60);
const TASK_STOP_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SyncNode {
    config: NodeConfig,
    db: Arc<DbState>,
    transport: SyncTransport,
    board: Arc<OrderBoard>,
    orchestrator: Option<Arc<OrderOrchestrator>>,
    replica: Arc<KitchenReplica>,
    roster: Arc<Roster>,
    reconcile: Option<Arc<ReconciliationJob>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncNode {
    /// Build every component for `config.role` on top of an open database.
    pub fn new(config: NodeConfig, db: Arc<DbState>) -> Result<Self, NodeError> {
        let transport = SyncTransport::new(config.device_id.clone());
        let sync: Arc<dyn SyncSink> = Arc::new(transport.clone());
        let board = Arc::new(OrderBoard::new());
        let replica = Arc::new(KitchenReplica::new());
        let roster = Arc::new(Roster::new());

        let orchestrator = config.role.is_order_terminal().then(|| {
            let repo = Arc::new(SqliteRepository::new(db.clone()));
            Arc::new(OrderOrchestrator::new(
                OrchestratorConfig {
                    tenant_id: config.tenant_id.clone(),
                    auto_print_on_accept: config.auto_print_on_accept,
                },
                Collaborators {
                    kitchen: board.clone(),
                    printer: Arc::new(PrintSpooler::new(db.clone())),
                    ledger: repo.clone(),
                    sync: sync.clone(),
                    persistence: repo,
                },
            ))
        });

        let router = EventRouter::new(
            config.role,
            config.device_id.clone(),
            orchestrator.clone(),
            replica.clone(),
            roster.clone(),
            sync,
        );
        transport.on_receive(move |channel, event| {
            router.route(channel, event);
        });

        let reconcile = match (config.role.is_order_terminal(), &config.admin_url, &config.api_key) {
            (true, Some(admin_url), Some(api_key)) => {
                let api = HttpRemoteApi::new(admin_url, api_key, &config.tenant_id, &config.device_id);
                match api {
                    Ok(api) => Some(Arc::new(ReconciliationJob::new(
                        db.clone(),
                        Arc::new(api),
                        config.batch_size,
                        config.reconcile_interval,
                        config.reconcile_startup_delay,
                    ))),
                    Err(e) => {
                        warn!(error = %e, "Reconciliation disabled");
                        None
                    }
                }
            }
            (true, _, _) => {
                info!("No admin API configured, reconciliation disabled");
                None
            }
            _ => None,
        };

        Ok(Self {
            config,
            db,
            transport,
            board,
            orchestrator,
            replica,
            roster,
            reconcile,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Rehydrate, open the channels and start the background workers.
    pub async fn start(&self) -> Result<(), NodeError> {
        info!(
            device_id = %self.config.device_id,
            role = %self.config.role,
            tenant_id = %self.config.tenant_id,
            "Starting sync node"
        );
        if let Some(orchestrator) = &self.orchestrator {
            orchestrator.start()?;
        }
        self.transport
            .start(TransportConfig::from_node(&self.config), self.config.environment)
            .await?;

        let mut spawned = Vec::new();
        if self.orchestrator.is_some() {
            spawned.push(print::start_print_worker(
                self.db.clone(),
                self.config.data_dir.join(print::SPOOL_DIR),
                PRINT_INTERVAL,
                self.cancel.child_token(),
            ));
        }
        spawned.push(start_urgency_ticker(
            self.orchestrator.clone(),
            self.replica.clone(),
            self.cancel.child_token(),
        ));
        if let Some(job) = &self.reconcile {
            spawned.push(job.clone().start(self.cancel.child_token()));
        }
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.extend(spawned);
        }
        Ok(())
    }

    /// Stop timers and workers, close both channels, stop the orchestrator.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.transport.shutdown().await;
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .map(|mut t| t.drain(..).collect())
            .unwrap_or_default();
        for task in tasks {
            if tokio::time::timeout(TASK_STOP_TIMEOUT, task).await.is_err() {
                warn!("Background task did not stop in time");
            }
        }
        if let Some(orchestrator) = &self.orchestrator {
            orchestrator.stop();
        }
        info!("Sync node stopped");
    }

    // -- intake --------------------------------------------------------------

    /// Feed one inbound order event (JSON) into the orchestrator.
    pub fn ingest_json(&self, raw: &str) -> Result<(), NodeError> {
        let orchestrator = self.require_orchestrator()?;
        let inbound = InboundOrder::from_json(raw)?;
        let source = inbound.source();
        orchestrator.process_new_order(inbound.into_order(Utc::now()), source)?;
        Ok(())
    }

    // -- kitchen display -------------------------------------------------------

    /// Bump a whole ticket on a display and replicate it.
    pub fn set_kitchen_status(&self, kitchen_order_id: &str, status: KitchenItemStatus) -> Result<usize, NodeError> {
        let event = self.replica.set_status(kitchen_order_id, status, Utc::now())?;
        Ok(self.transport.broadcast(event))
    }

    /// Bump a single item on a display and replicate the ticket.
    pub fn set_item_status(
        &self,
        kitchen_order_id: &str,
        item_index: usize,
        status: KitchenItemStatus,
    ) -> Result<usize, NodeError> {
        let event = self
            .replica
            .set_item_status(kitchen_order_id, item_index, status, Utc::now())?;
        Ok(self.transport.broadcast(event))
    }

    // -- roster ----------------------------------------------------------------

    pub fn upsert_staff(&self, member: StaffMember) -> usize {
        self.roster.upsert_staff(member.clone());
        self.transport.broadcast(SyncEvent::StaffUpserted { staff: member })
    }

    pub fn remove_staff(&self, staff_id: &str) -> usize {
        self.roster.remove_staff(staff_id);
        self.transport.broadcast(SyncEvent::StaffRemoved {
            staff_id: staff_id.to_string(),
        })
    }

    pub fn upsert_table(&self, table: FloorTable) -> usize {
        self.roster.upsert_table(table.clone());
        self.transport.broadcast(SyncEvent::FloorTableUpserted { table })
    }

    pub fn remove_table(&self, table_id: &str) -> usize {
        self.roster.remove_table(table_id);
        self.transport.broadcast(SyncEvent::FloorTableRemoved {
            table_id: table_id.to_string(),
        })
    }

    // -- accessors -------------------------------------------------------------

    pub fn role(&self) -> DeviceRole {
        self.config.role
    }

    pub fn status(&self) -> TransportStatus {
        self.transport.status()
    }

    pub fn transport(&self) -> &SyncTransport {
        &self.transport
    }

    pub fn orchestrator(&self) -> Option<&Arc<OrderOrchestrator>> {
        self.orchestrator.as_ref()
    }

    pub fn board(&self) -> &Arc<OrderBoard> {
        &self.board
    }

    pub fn replica(&self) -> &Arc<KitchenReplica> {
        &self.replica
    }

    pub fn roster(&self) -> &Arc<Roster> {
        &self.roster
    }

    pub fn reconciliation(&self) -> Option<&Arc<ReconciliationJob>> {
        self.reconcile.as_ref()
    }

    fn require_orchestrator(&self) -> Result<&Arc<OrderOrchestrator>, NodeError> {
        self.orchestrator
            .as_ref()
            .ok_or(NodeError::NotOrderTerminal(self.config.role))
    }
}

/// Urgency is derived from elapsed time, so every device recomputes it for
/// its own copy; it never travels as a versioned change.
fn start_urgency_ticker(
    orchestrator: Option<Arc<OrderOrchestrator>>,
    replica: Arc<KitchenReplica>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(URGENCY_INTERVAL);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {}
            }
            match &orchestrator {
                Some(orchestrator) => {
                    if let Err(e) = orchestrator.refresh_urgency(Utc::now()) {
                        warn!(error = %e, "Urgency refresh failed");
                    }
                }
                None => {
                    replica.refresh_urgency(Utc::now());
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Environment;
    use crate::db;

    fn config(role: DeviceRole, dir: &std::path::Path) -> NodeConfig {
        NodeConfig {
            tenant_id: "t1".into(),
            device_id: format!("{role}-1"),
            role,
            data_dir: dir.to_path_buf(),
            coordinator_url: None,
            api_key: None,
            admin_url: None,
            mesh_port: 0,
            mesh_server: None,
            mdns_enabled: false,
            reconcile_interval: Duration::from_secs(300),
            reconcile_startup_delay: Duration::from_secs(30),
            batch_size: 50,
            auto_print_on_accept: true,
            environment: Environment {
                has_local_persistence: false,
                has_native_bridge: false,
            },
        }
    }

    const SWIGGY: &str = r#"{"platform":"swiggy","order_id":"swiggy_4821","status":"pending",
        "customer":{"name":"Ravi"},"items":[{"name":"Veg Biryani","quantity":1,"price":220}],"total":220}"#;

    #[tokio::test]
    async fn pos_node_ingests_and_spools_on_accept() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(db::open_in_memory().unwrap());
        let node = SyncNode::new(config(DeviceRole::Pos, dir.path()), db.clone()).unwrap();
        node.start().await.unwrap();

        node.ingest_json(SWIGGY).unwrap();
        node.ingest_json(SWIGGY).unwrap();
        assert_eq!(node.board().tickets().len(), 1);

        let orchestrator = node.orchestrator().unwrap();
        let ticket = orchestrator.accept_order("swiggy_4821", 25).unwrap();
        assert_eq!(ticket.unwrap().estimated_prep_time, 25);
        assert_eq!(print::process_pending_jobs(&db, &dir.path().join(print::SPOOL_DIR)).unwrap(), 1);

        node.shutdown().await;
        assert!(!orchestrator.is_started());
    }

    #[tokio::test]
    async fn display_node_rejects_order_intake() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(db::open_in_memory().unwrap());
        let node = SyncNode::new(config(DeviceRole::Kds, dir.path()), db).unwrap();
        assert!(node.orchestrator().is_none());
        assert!(matches!(
            node.ingest_json(SWIGGY),
            Err(NodeError::NotOrderTerminal(DeviceRole::Kds))
        ));
    }

    #[test]
    fn roster_edits_apply_locally_without_channels() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(db::open_in_memory().unwrap());
        let node = SyncNode::new(config(DeviceRole::Manager, dir.path()), db).unwrap();
        let sent = node.upsert_staff(StaffMember {
            id: "s1".into(),
            name: "Asha".into(),
            role: "chef".into(),
            active: true,
        });
        assert_eq!(sent, 0);
        assert_eq!(node.roster().snapshot().staff.len(), 1);
        node.remove_staff("s1");
        assert!(node.roster().snapshot().staff.is_empty());
    }
}
