//! Inbound sync event routing.
//!
//! The order terminal feeds kitchen updates into the orchestrator; every
//! other role keeps a [`KitchenReplica`]. Roster events and the full-state
//! resync exchange are handled the same way on every role.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::DeviceRole;
use crate::error::OrchestratorError;
use crate::orchestrator::OrderOrchestrator;
use crate::replica::{ApplyOutcome, KitchenReplica};
use crate::roster::{Roster, RosterSnapshot};
use crate::sinks::SyncSink;
use crate::sync::{ChannelKind, SyncEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Applied,
    /// Duplicate delivery or older than local state.
    Stale,
    /// Refers to a record this device does not hold.
    Unknown,
    /// A resync request was answered with a snapshot.
    Answered,
    /// Not meant for this role, or rejected by the orchestrator.
    Ignored,
}

impl From<ApplyOutcome> for RouteOutcome {
    fn from(outcome: ApplyOutcome) -> Self {
        match outcome {
            ApplyOutcome::Applied => RouteOutcome::Applied,
            ApplyOutcome::Stale => RouteOutcome::Stale,
            ApplyOutcome::Unknown => RouteOutcome::Unknown,
        }
    }
}

pub struct EventRouter {
    role: DeviceRole,
    device_id: String,
    orchestrator: Option<Arc<OrderOrchestrator>>,
    replica: Arc<KitchenReplica>,
    roster: Arc<Roster>,
    sync: Arc<dyn SyncSink>,
}

impl EventRouter {
    /// `orchestrator` is only consulted on the order terminal.
    pub fn new(
        role: DeviceRole,
        device_id: impl Into<String>,
        orchestrator: Option<Arc<OrderOrchestrator>>,
        replica: Arc<KitchenReplica>,
        roster: Arc<Roster>,
        sync: Arc<dyn SyncSink>,
    ) -> Self {
        Self {
            role,
            device_id: device_id.into(),
            orchestrator,
            replica,
            roster,
            sync,
        }
    }

    pub fn route(&self, channel: ChannelKind, event: SyncEvent) -> RouteOutcome {
        let kind = event.kind();
        let outcome = match event {
            SyncEvent::StaffUpserted { staff } => {
                self.roster.upsert_staff(staff);
                RouteOutcome::Applied
            }
            SyncEvent::StaffRemoved { staff_id } => removal(self.roster.remove_staff(&staff_id)),
            SyncEvent::FloorTableUpserted { table } => {
                self.roster.upsert_table(table);
                RouteOutcome::Applied
            }
            SyncEvent::FloorTableRemoved { table_id } => removal(self.roster.remove_table(&table_id)),
            SyncEvent::SyncRequested { device_id } => self.answer_resync(&device_id),
            SyncEvent::SyncResponse { staff, tables, .. } => {
                self.roster.merge_snapshot(RosterSnapshot { staff, tables });
                RouteOutcome::Applied
            }
            order_event => match self.pos_orchestrator() {
                Some(orchestrator) => route_to_orchestrator(orchestrator, order_event),
                None => self.route_to_replica(order_event),
            },
        };
        debug!(%channel, kind, ?outcome, "Inbound event routed");
        outcome
    }

    fn pos_orchestrator(&self) -> Option<&OrderOrchestrator> {
        if self.role.is_order_terminal() {
            self.orchestrator.as_deref()
        } else {
            None
        }
    }

    fn answer_resync(&self, requester: &str) -> RouteOutcome {
        if requester == self.device_id {
            return RouteOutcome::Ignored;
        }
        let snapshot = self.roster.snapshot();
        self.sync.broadcast(SyncEvent::SyncResponse {
            device_id: self.device_id.clone(),
            staff: snapshot.staff,
            tables: snapshot.tables,
        });
        RouteOutcome::Answered
    }

    fn route_to_replica(&self, event: SyncEvent) -> RouteOutcome {
        match event {
            SyncEvent::OrderCreated { order, kitchen_order } => {
                let outcome = self.replica.apply_order(order);
                match kitchen_order {
                    Some(ticket) => self.replica.apply(ticket).into(),
                    None => outcome.into(),
                }
            }
            SyncEvent::OrderStatusChanged {
                order_id,
                status,
                updated_at,
                kitchen_order,
            } => {
                let outcome = self.replica.apply_order_status(&order_id, status, updated_at);
                match kitchen_order {
                    Some(ticket) => self.replica.apply(ticket).into(),
                    None => outcome.into(),
                }
            }
            SyncEvent::KitchenOrderUpdated { kitchen_order } => self.replica.apply(kitchen_order).into(),
            SyncEvent::KitchenStatusChanged {
                kitchen_order_id,
                status,
                version,
                updated_at,
                ..
            } => self
                .replica
                .apply_kitchen_status(&kitchen_order_id, status, version, updated_at)
                .into(),
            _ => RouteOutcome::Ignored,
        }
    }
}

fn removal(removed: bool) -> RouteOutcome {
    if removed {
        RouteOutcome::Applied
    } else {
        RouteOutcome::Unknown
    }
}

fn route_to_orchestrator(orchestrator: &OrderOrchestrator, event: SyncEvent) -> RouteOutcome {
    let result: Result<RouteOutcome, OrchestratorError> = match event {
        // Orders relayed from the cloud (web, QR) enter through the same
        // deduplicated intake as local ones.
        SyncEvent::OrderCreated { order, .. } => {
            let source = order.source;
            orchestrator
                .process_new_order(order, source)
                .map(|()| RouteOutcome::Applied)
        }
        SyncEvent::KitchenStatusChanged {
            kitchen_order_id,
            status,
            version,
            ..
        } => orchestrator
            .apply_remote_kitchen_status(&kitchen_order_id, status, version)
            .map(RouteOutcome::from),
        SyncEvent::KitchenOrderUpdated { kitchen_order } => orchestrator
            .apply_remote_kitchen_order(kitchen_order)
            .map(RouteOutcome::from),
        // The order terminal is the only writer of order status.
        _ => Ok(RouteOutcome::Ignored),
    };
    result.unwrap_or_else(|e| {
        warn!(error = %e, "Remote event rejected by orchestrator");
        RouteOutcome::Ignored
    })
}
