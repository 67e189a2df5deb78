//! Order lifecycle owner on the order-taking terminal.
//!
//! All mutation entry points serialize on one mutex. Durable writes happen
//! while it is held so storage sees transitions in the order they were
//! applied; UI, printer and sync collaborators are called after it is
//! released and never block on the network.
//!
//! Lifecycle:
//! `pending -> confirmed -> preparing -> pending_pickup -> picked_up ->
//! out_for_delivery -> delivered -> completed`, with `cancelled` reachable
//! from `pending` and `confirmed` only.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{OrchestratorError, PersistenceError};
use crate::kitchen;
use crate::mapping::{OrderMappingStore, ProcessedOrders};
use crate::models::{KitchenItemStatus, KitchenOrder, Order, OrderMapping, OrderSource, OrderStatus};
use crate::replica::{is_newer, ApplyOutcome};
use crate::sinks::{KitchenSink, LedgerSink, OrderEvent, OrderPersistence, PrinterSink, SyncSink};
use crate::sync::SyncEvent;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub tenant_id: String,
    pub auto_print_on_accept: bool,
}

/// Injected collaborators.
#[derive(Clone)]
pub struct Collaborators {
    pub kitchen: Arc<dyn KitchenSink>,
    pub printer: Arc<dyn PrinterSink>,
    pub ledger: Arc<dyn LedgerSink>,
    pub sync: Arc<dyn SyncSink>,
    pub persistence: Arc<dyn OrderPersistence>,
}

/// Read-only view of one order.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderSnapshot {
    pub order: Order,
    pub mapping: Option<OrderMapping>,
    pub kitchen_order: Option<KitchenOrder>,
}

#[derive(Default)]
struct State {
    started: bool,
    processed: ProcessedOrders,
    mappings: OrderMappingStore,
    orders: HashMap<String, Order>,
    tickets: HashMap<String, KitchenOrder>,
}

#[derive(Clone, Copy)]
enum TicketAction {
    Upsert,
    Remove,
    Archive,
}

enum RemoteKitchen {
    Status {
        status: KitchenItemStatus,
        version: Option<u64>,
    },
    Ticket(KitchenOrder),
}

pub struct OrderOrchestrator {
    config: OrchestratorConfig,
    sinks: Collaborators,
    state: Mutex<State>,
    events: broadcast::Sender<OrderEvent>,
}

impl OrderOrchestrator {
    pub fn new(config: OrchestratorConfig, sinks: Collaborators) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            sinks,
            state: Mutex::new(State::default()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrderEvent> {
        self.events.subscribe()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, OrchestratorError> {
        self.state
            .lock()
            .map_err(|_| OrchestratorError::Persistence(PersistenceError::LockPoisoned))
    }

    fn started(&self) -> Result<MutexGuard<'_, State>, OrchestratorError> {
        let state = self.lock()?;
        if !state.started {
            return Err(OrchestratorError::NotStarted);
        }
        Ok(state)
    }

    fn emit(&self, event: OrderEvent) {
        let _ = self.events.send(event);
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Rehydrate in-flight orders from durable storage and start accepting
    /// calls. Idempotent.
    pub fn start(&self) -> Result<(), OrchestratorError> {
        let restored = self.sinks.persistence.load_active()?;
        let mut state = self.lock()?;
        if state.started {
            return Ok(());
        }
        for order_id in &restored.recent_order_ids {
            state.processed.insert(order_id);
        }
        for mapping in restored.mappings {
            state.mappings.restore(mapping);
        }
        for order in &restored.orders {
            state.processed.insert(&order.order_id);
            state.orders.insert(order.order_id.clone(), order.clone());
        }
        for ticket in &restored.kitchen_orders {
            state.tickets.insert(ticket.id.clone(), ticket.clone());
        }
        state.started = true;
        drop(state);

        for order in &restored.orders {
            self.sinks.kitchen.add_order_to_list(order);
        }
        for ticket in &restored.kitchen_orders {
            self.sinks.kitchen.add_kitchen_order(ticket);
        }
        info!(
            orders = restored.orders.len(),
            kitchen_orders = restored.kitchen_orders.len(),
            "Order orchestrator started"
        );
        Ok(())
    }

    pub fn stop(&self) {
        if let Ok(mut state) = self.state.lock() {
            if state.started {
                state.started = false;
                info!("Order orchestrator stopped");
            }
        }
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().map(|s| s.started).unwrap_or(false)
    }

    // -----------------------------------------------------------------------
    // Intake
    // -----------------------------------------------------------------------

    /// First sight of an order. Repeats of an already processed `order_id`
    /// are silent no-ops. Orders that fail kitchen validation stay on the
    /// board but are not sent to the kitchen or replicated.
    pub fn process_new_order(&self, mut order: Order, source: OrderSource) -> Result<(), OrchestratorError> {
        order.source = source;
        let now = Utc::now();
        let mut state = self.started()?;
        if state.processed.contains(&order.order_id) || state.orders.contains_key(&order.order_id) {
            debug!(order_id = %order.order_id, "Duplicate order ignored");
            return Ok(());
        }

        self.sinks.persistence.save_order(&order)?;
        self.sinks
            .persistence
            .save_mapping(&OrderMapping::for_order(&order))?;
        let validation = kitchen::validate(&order);
        let ticket = if validation.is_ok() {
            self.send_to_kds_locked(&mut state, &order, None, now)?
        } else {
            None
        };
        // Committed only after every durable write, so a failed intake is
        // retried rather than deduplicated.
        state.processed.insert(&order.order_id);
        state.mappings.ensure(&order);
        state.orders.insert(order.order_id.clone(), order.clone());

        let ticket = match validation {
            Ok(()) => ticket,
            Err(reason) => {
                drop(state);
                warn!(order_id = %order.order_id, %reason, "Order failed kitchen validation, not forwarded");
                self.sinks.kitchen.add_order_to_list(&order);
                self.emit(OrderEvent::OrderReceived {
                    order_id: order.order_id.clone(),
                    order_number: order.order_number.clone(),
                });
                self.emit(OrderEvent::OrderValidationFailed {
                    order_id: order.order_id,
                    reason,
                });
                return Ok(());
            }
        };
        drop(state);

        info!(
            order_id = %order.order_id,
            order_number = %order.order_number,
            source = %source,
            "Order received"
        );
        self.sinks.kitchen.add_order_to_list(&order);
        self.emit(OrderEvent::OrderReceived {
            order_id: order.order_id.clone(),
            order_number: order.order_number.clone(),
        });
        if let Some(ticket) = &ticket {
            self.sinks.kitchen.add_kitchen_order(ticket);
            self.emit(OrderEvent::KitchenOrderSent {
                order_id: order.order_id.clone(),
                kitchen_order_id: ticket.id.clone(),
            });
        }
        self.sinks.sync.broadcast(SyncEvent::OrderCreated {
            order,
            kitchen_order: ticket,
        });
        Ok(())
    }

    /// Create the kitchen ticket for an order. At most one ticket per order:
    /// returns `None` without side effects when one already exists.
    pub fn send_to_kds(
        &self,
        order: &Order,
        prep_minutes: Option<u32>,
    ) -> Result<Option<KitchenOrder>, OrchestratorError> {
        let now = Utc::now();
        let mut state = self.started()?;
        if !state.orders.contains_key(&order.order_id) {
            self.sinks.persistence.save_order(order)?;
            state.processed.insert(&order.order_id);
            state.mappings.ensure(order);
            state.orders.insert(order.order_id.clone(), order.clone());
        }
        let ticket = self.send_to_kds_locked(&mut state, order, prep_minutes, now)?;
        drop(state);

        if let Some(ticket) = &ticket {
            self.sinks.kitchen.add_kitchen_order(ticket);
            self.emit(OrderEvent::KitchenOrderSent {
                order_id: order.order_id.clone(),
                kitchen_order_id: ticket.id.clone(),
            });
            self.sinks.sync.broadcast(SyncEvent::KitchenOrderUpdated {
                kitchen_order: ticket.clone(),
            });
        }
        Ok(ticket)
    }

    fn send_to_kds_locked(
        &self,
        state: &mut State,
        order: &Order,
        prep_minutes: Option<u32>,
        now: DateTime<Utc>,
    ) -> Result<Option<KitchenOrder>, OrchestratorError> {
        if state.mappings.has_kitchen_order(&order.order_id) {
            debug!(order_id = %order.order_id, "Kitchen order already exists");
            return Ok(None);
        }
        let ticket = match kitchen::project(order, format!("kds_{}", Uuid::new_v4()), prep_minutes, now) {
            Ok(ticket) => ticket,
            Err(reason) => {
                warn!(order_id = %order.order_id, %reason, "Cannot project order for the kitchen");
                return Ok(None);
            }
        };

        let mut mapping = state
            .mappings
            .get(&order.order_id)
            .cloned()
            .unwrap_or_else(|| OrderMapping::for_order(order));
        mapping.kitchen_order_id = Some(ticket.id.clone());
        mapping.kitchen_status = Some(KitchenItemStatus::Pending);
        self.sinks.persistence.save_kitchen_order(&ticket)?;
        self.sinks.persistence.save_mapping(&mapping)?;

        state.mappings.ensure(order);
        state.mappings.attach_kitchen_order(&order.order_id, &ticket.id);
        state.tickets.insert(ticket.id.clone(), ticket.clone());
        debug!(
            order_id = %order.order_id,
            kitchen_order_id = %ticket.id,
            station = %ticket.station,
            prep_minutes = ticket.estimated_prep_time,
            "Kitchen order created"
        );
        Ok(Some(ticket))
    }

    // -----------------------------------------------------------------------
    // Local lifecycle edges
    // -----------------------------------------------------------------------

    /// `pending -> confirmed`. Returns `None` when the order is unknown.
    pub fn accept_order(
        &self,
        order_id: &str,
        prep_minutes: u32,
    ) -> Result<Option<KitchenOrder>, OrchestratorError> {
        let now = Utc::now();
        let mut state = self.started()?;
        let Some(current) = state.orders.get(order_id).cloned() else {
            warn!(%order_id, "Accept for unknown order");
            return Ok(None);
        };
        let (order, from) = self.transition_locked(&mut state, current, OrderStatus::Confirmed, now, |o| {
            o.accepted_at = Some(now)
        })?;
        let ticket = match self.send_to_kds_locked(&mut state, &order, Some(prep_minutes), now)? {
            Some(ticket) => Some(ticket),
            None => self.update_ticket_locked(&mut state, order_id, now, |t| {
                if prep_minutes > 0 && t.estimated_prep_time != prep_minutes {
                    t.estimated_prep_time = prep_minutes;
                    true
                } else {
                    false
                }
            })?,
        };
        drop(state);

        info!(%order_id, prep_minutes, "Order accepted");
        self.publish(&order, from, ticket.as_ref(), TicketAction::Upsert);
        if let Some(ticket) = &ticket {
            self.emit(OrderEvent::OrderAccepted {
                order_id: order.order_id.clone(),
                kitchen_order_id: ticket.id.clone(),
                estimated_prep_time: ticket.estimated_prep_time,
            });
            if self.config.auto_print_on_accept {
                self.print(ticket);
            }
        }
        Ok(ticket)
    }

    /// `-> pending_pickup`. Forces every unfinished item to `ready` and
    /// records the sale first; a ledger failure leaves the order untouched.
    pub fn mark_ready(&self, order_id: &str) -> Result<(), OrchestratorError> {
        let now = Utc::now();
        let mut state = self.started()?;
        let current = self.order_locked(&state, order_id)?;
        let (order, from) = self.transition_locked(&mut state, current, OrderStatus::PendingPickup, now, |o| {
            o.ready_at = Some(now)
        })?;
        let ticket = self.update_ticket_locked(&mut state, order_id, now, |t| {
            t.advance_items(KitchenItemStatus::Ready)
        })?;
        drop(state);

        self.publish(&order, from, ticket.as_ref(), TicketAction::Upsert);
        Ok(())
    }

    pub fn mark_picked_up(&self, order_id: &str) -> Result<(), OrchestratorError> {
        self.advance(order_id, OrderStatus::PickedUp)
    }

    pub fn mark_out_for_delivery(&self, order_id: &str) -> Result<(), OrchestratorError> {
        self.advance(order_id, OrderStatus::OutForDelivery)
    }

    pub fn mark_delivered(&self, order_id: &str) -> Result<(), OrchestratorError> {
        self.advance(order_id, OrderStatus::Delivered)
    }

    /// `-> completed`; the ticket is archived, never deleted.
    pub fn mark_completed(&self, order_id: &str) -> Result<(), OrchestratorError> {
        let now = Utc::now();
        let mut state = self.started()?;
        let current = self.order_locked(&state, order_id)?;
        let (order, from) =
            self.transition_locked(&mut state, current, OrderStatus::Completed, now, |_| {})?;
        let ticket = self.update_ticket_locked(&mut state, order_id, now, |t| {
            t.advance_items(KitchenItemStatus::Completed);
            t.archived = true;
            true
        })?;
        drop(state);

        self.publish(&order, from, ticket.as_ref(), TicketAction::Archive);
        Ok(())
    }

    /// Only reachable from `pending` or `confirmed`. Live kitchen items are
    /// cancelled and the ticket leaves the board.
    pub fn cancel_order(&self, order_id: &str, reason: Option<String>) -> Result<(), OrchestratorError> {
        let now = Utc::now();
        let mut state = self.started()?;
        let current = self.order_locked(&state, order_id)?;
        let (order, from) = self.transition_locked(&mut state, current, OrderStatus::Cancelled, now, |o| {
            o.cancellation_reason = reason
        })?;
        let ticket = self.update_ticket_locked(&mut state, order_id, now, |t| {
            t.advance_items(KitchenItemStatus::Cancelled);
            t.archived = true;
            true
        })?;
        drop(state);

        self.publish(&order, from, ticket.as_ref(), TicketAction::Remove);
        Ok(())
    }

    fn advance(&self, order_id: &str, target: OrderStatus) -> Result<(), OrchestratorError> {
        let now = Utc::now();
        let mut state = self.started()?;
        let current = self.order_locked(&state, order_id)?;
        let (order, from) = self.transition_locked(&mut state, current, target, now, |_| {})?;
        let ticket = self.ticket_for_locked(&state, order_id);
        drop(state);

        self.publish(&order, from, ticket.as_ref(), TicketAction::Upsert);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Remote kitchen updates
    // -----------------------------------------------------------------------

    /// A kitchen display changed a ticket's status. Unknown kitchen ids are
    /// dropped. `in-progress`, `ready` and `completed` move the order;
    /// `pending` and `cancelled` only update the ticket.
    pub fn on_remote_status_change(
        &self,
        kitchen_order_id: &str,
        status: KitchenItemStatus,
    ) -> Result<(), OrchestratorError> {
        self.apply_remote_kitchen(kitchen_order_id, RemoteKitchen::Status { status, version: None })
            .map(|_| ())
    }

    /// Version-gated form of [`Self::on_remote_status_change`] used for
    /// replicated events.
    pub fn apply_remote_kitchen_status(
        &self,
        kitchen_order_id: &str,
        status: KitchenItemStatus,
        version: u64,
    ) -> Result<ApplyOutcome, OrchestratorError> {
        self.apply_remote_kitchen(
            kitchen_order_id,
            RemoteKitchen::Status {
                status,
                version: Some(version),
            },
        )
    }

    /// Whole-ticket update from a display (per-item bumps).
    pub fn apply_remote_kitchen_order(&self, ticket: KitchenOrder) -> Result<ApplyOutcome, OrchestratorError> {
        let kitchen_order_id = ticket.id.clone();
        self.apply_remote_kitchen(&kitchen_order_id, RemoteKitchen::Ticket(ticket))
    }

    fn apply_remote_kitchen(
        &self,
        kitchen_order_id: &str,
        update: RemoteKitchen,
    ) -> Result<ApplyOutcome, OrchestratorError> {
        let now = Utc::now();
        let mut state = self.started()?;
        let Some(order_id) = state
            .mappings
            .external_for_kitchen(kitchen_order_id)
            .map(str::to_string)
        else {
            warn!(%kitchen_order_id, "Status change for unknown kitchen order dropped");
            return Ok(ApplyOutcome::Unknown);
        };

        let held = state.tickets.get(kitchen_order_id).map(|t| t.version);
        let incoming = match &update {
            RemoteKitchen::Status { version, .. } => *version,
            RemoteKitchen::Ticket(ticket) => Some(ticket.version),
        };
        if let Some(version) = incoming {
            if !is_newer(held, version) {
                debug!(%kitchen_order_id, version, "Stale kitchen update dropped");
                return Ok(ApplyOutcome::Stale);
            }
        }

        let kitchen_status = match &update {
            RemoteKitchen::Ticket(remote) => remote.aggregate_status(),
            RemoteKitchen::Status { status, .. } => *status,
        };

        // The order moves before the ticket is touched so a ledger failure
        // on `ready` leaves both as they were.
        let change = match (state.orders.get(&order_id).cloned(), kitchen_status.order_status()) {
            (Some(current), Some(target)) if current.status.can_transition_to(target) => {
                Some(self.transition_locked(&mut state, current, target, now, |o| {
                    if target == OrderStatus::PendingPickup {
                        o.ready_at = Some(now);
                    }
                })?)
            }
            _ => None,
        };
        let completed = change
            .as_ref()
            .is_some_and(|(order, _)| order.status == OrderStatus::Completed);

        let mut ticket = match update {
            RemoteKitchen::Ticket(remote) => Some(remote),
            RemoteKitchen::Status { status, version } => {
                state.tickets.get(kitchen_order_id).cloned().map(|mut t| {
                    t.advance_items(status);
                    match version {
                        Some(v) => {
                            t.version = v;
                            t.updated_at = now;
                        }
                        None => t.touch(now),
                    }
                    t
                })
            }
        };
        if let Some(t) = ticket.as_mut() {
            if completed {
                // Re-versioned so displays already holding the bump take it.
                t.archived = true;
                t.touch(now);
            }
            t.refresh_urgency(now);
            self.sinks.persistence.save_kitchen_order(t)?;
            state.tickets.insert(t.id.clone(), t.clone());
        }
        if let Some(mapping) = state
            .mappings
            .record_kitchen_status(&order_id, kitchen_status)
            .cloned()
        {
            self.sinks.persistence.save_mapping(&mapping)?;
        }
        drop(state);

        match change {
            Some((order, from)) => {
                let action = if completed {
                    TicketAction::Archive
                } else {
                    TicketAction::Upsert
                };
                self.publish(&order, from, ticket.as_ref(), action);
            }
            None => {
                if let Some(ticket) = &ticket {
                    self.sinks.kitchen.add_kitchen_order(ticket);
                }
                debug!(%kitchen_order_id, status = %kitchen_status, "Kitchen status recorded");
            }
        }
        Ok(ApplyOutcome::Applied)
    }

    // -----------------------------------------------------------------------
    // Periodic
    // -----------------------------------------------------------------------

    /// Recompute urgency of live tickets; flipped ones are persisted,
    /// updated on the board and returned. Urgency is derived from elapsed
    /// time, so every device recomputes it locally: the version is left
    /// alone and nothing is replicated.
    pub fn refresh_urgency(&self, now: DateTime<Utc>) -> Result<Vec<KitchenOrder>, OrchestratorError> {
        let mut state = self.started()?;
        let mut flipped = Vec::new();
        for ticket in state.tickets.values_mut().filter(|t| !t.archived) {
            if ticket.refresh_urgency(now) {
                flipped.push(ticket.clone());
            }
        }
        for ticket in &flipped {
            self.sinks.persistence.save_kitchen_order(ticket)?;
        }
        drop(state);

        for ticket in &flipped {
            debug!(kitchen_order_id = %ticket.id, urgent = ticket.is_urgent, "Ticket urgency changed");
            self.sinks.kitchen.add_kitchen_order(ticket);
        }
        Ok(flipped)
    }

    pub fn snapshot(&self, order_id: &str) -> Option<OrderSnapshot> {
        let state = self.lock().ok()?;
        let order = state.orders.get(order_id)?.clone();
        let mapping = state.mappings.get(order_id).cloned();
        let kitchen_order = self.ticket_for_locked(&state, order_id);
        Some(OrderSnapshot {
            order,
            mapping,
            kitchen_order,
        })
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn order_locked(&self, state: &State, order_id: &str) -> Result<Order, OrchestratorError> {
        state
            .orders
            .get(order_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::OrderNotFound(order_id.to_string()))
    }

    fn ticket_for_locked(&self, state: &State, order_id: &str) -> Option<KitchenOrder> {
        state
            .mappings
            .get(order_id)
            .and_then(|m| m.kitchen_order_id.as_deref())
            .and_then(|id| state.tickets.get(id))
            .cloned()
    }

    /// Validate and persist one lifecycle edge. An edge that reaches
    /// `pending_pickup` or skips past it records the sale first; a ledger
    /// failure leaves the order untouched.
    fn transition_locked(
        &self,
        state: &mut State,
        mut order: Order,
        target: OrderStatus,
        now: DateTime<Utc>,
        stamp: impl FnOnce(&mut Order),
    ) -> Result<(Order, OrderStatus), OrchestratorError> {
        let from = order.status;
        if !from.can_transition_to(target) {
            return Err(OrchestratorError::InvalidTransition { from, to: target });
        }
        if settles_sale(from, target) {
            self.record_sale(&order)?;
        }
        order.status = target;
        order.updated_at = now;
        stamp(&mut order);

        self.sinks.persistence.save_order(&order)?;
        state.orders.insert(order.order_id.clone(), order.clone());
        if let Some(mapping) = state.mappings.record_status(&order).cloned() {
            self.sinks.persistence.save_mapping(&mapping)?;
        }
        Ok((order, from))
    }

    /// Mutate the order's ticket; `f` returns whether anything changed.
    fn update_ticket_locked(
        &self,
        state: &mut State,
        order_id: &str,
        now: DateTime<Utc>,
        f: impl FnOnce(&mut KitchenOrder) -> bool,
    ) -> Result<Option<KitchenOrder>, OrchestratorError> {
        let Some(kitchen_order_id) = state
            .mappings
            .get(order_id)
            .and_then(|m| m.kitchen_order_id.clone())
        else {
            return Ok(None);
        };
        let Some(ticket) = state.tickets.get_mut(&kitchen_order_id) else {
            return Ok(None);
        };
        if !f(&mut *ticket) {
            return Ok(Some(ticket.clone()));
        }
        ticket.touch(now);
        ticket.refresh_urgency(now);
        let updated = ticket.clone();

        self.sinks.persistence.save_kitchen_order(&updated)?;
        if let Some(mapping) = state
            .mappings
            .record_kitchen_status(order_id, updated.aggregate_status())
            .cloned()
        {
            self.sinks.persistence.save_mapping(&mapping)?;
        }
        Ok(Some(updated))
    }

    /// Exactly once per order, guarded by an existence check.
    fn record_sale(&self, order: &Order) -> Result<(), OrchestratorError> {
        let exists = self
            .sinks
            .ledger
            .has_sale(&order.order_id)
            .map_err(OrchestratorError::Ledger)?;
        if exists {
            debug!(order_id = %order.order_id, "Sale already recorded");
            return Ok(());
        }
        self.sinks
            .ledger
            .record_sale(&self.config.tenant_id, order)
            .map_err(OrchestratorError::Ledger)?;
        info!(order_id = %order.order_id, total = order.totals.grand_total, "Sale recorded");
        Ok(())
    }

    fn print(&self, ticket: &KitchenOrder) {
        if let Err(e) = self.sinks.printer.print(ticket) {
            warn!(kitchen_order_id = %ticket.id, error = %e, "Kitchen ticket print failed");
        }
    }

    fn publish(&self, order: &Order, from: OrderStatus, ticket: Option<&KitchenOrder>, action: TicketAction) {
        info!(order_id = %order.order_id, %from, to = %order.status, "Order status changed");
        self.sinks.kitchen.add_order_to_list(order);
        if let Some(ticket) = ticket {
            match action {
                TicketAction::Upsert => self.sinks.kitchen.add_kitchen_order(ticket),
                TicketAction::Remove => self.sinks.kitchen.remove_kitchen_order(&ticket.id),
                TicketAction::Archive => self.sinks.kitchen.archive_kitchen_order(&ticket.id),
            }
        }
        self.emit(OrderEvent::StatusChanged {
            order_id: order.order_id.clone(),
            from,
            to: order.status,
        });
        self.sinks.sync.broadcast(SyncEvent::OrderStatusChanged {
            order_id: order.order_id.clone(),
            status: order.status,
            updated_at: order.updated_at,
            kitchen_order: ticket.cloned(),
        });
    }
}

/// True when an edge reaches `pending_pickup` or skips past it.
fn settles_sale(from: OrderStatus, to: OrderStatus) -> bool {
    let ready = OrderStatus::PendingPickup.position();
    from.position() < ready && to.position() >= ready
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::OrderBoard;
    use crate::db;
    use crate::ingest::InboundOrder;
    use crate::replica::KitchenReplica;
    use crate::repository::{pending_count, SqliteRepository};
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct RecordingSync {
        events: Mutex<Vec<SyncEvent>>,
    }

    impl RecordingSync {
        fn kinds(&self) -> Vec<&'static str> {
            self.events.lock().unwrap().iter().map(SyncEvent::kind).collect()
        }
    }

    impl SyncSink for RecordingSync {
        fn broadcast(&self, event: SyncEvent) -> usize {
            self.events.lock().unwrap().push(event);
            1
        }
    }

    #[derive(Default)]
    struct RecordingPrinter {
        printed: Mutex<Vec<String>>,
    }

    impl PrinterSink for RecordingPrinter {
        fn print(&self, kitchen_order: &KitchenOrder) -> Result<(), String> {
            self.printed.lock().unwrap().push(kitchen_order.id.clone());
            Ok(())
        }
    }

    struct Harness {
        orchestrator: OrderOrchestrator,
        board: Arc<OrderBoard>,
        sync: Arc<RecordingSync>,
        printer: Arc<RecordingPrinter>,
        repo: Arc<SqliteRepository>,
    }

    /// Repository wrapper whose next ticket write or sale can be made to fail.
    struct Flaky {
        repo: Arc<SqliteRepository>,
        fail_ticket: AtomicBool,
        fail_sale: AtomicBool,
    }

    impl Flaky {
        fn new(repo: Arc<SqliteRepository>) -> Self {
            Self {
                repo,
                fail_ticket: AtomicBool::new(false),
                fail_sale: AtomicBool::new(false),
            }
        }
    }

    impl OrderPersistence for Flaky {
        fn save_order(&self, order: &Order) -> Result<(), PersistenceError> {
            self.repo.save_order(order)
        }

        fn save_mapping(&self, mapping: &OrderMapping) -> Result<(), PersistenceError> {
            self.repo.save_mapping(mapping)
        }

        fn save_kitchen_order(&self, kitchen_order: &KitchenOrder) -> Result<(), PersistenceError> {
            if self.fail_ticket.swap(false, Ordering::SeqCst) {
                return Err(PersistenceError::Other("disk full".into()));
            }
            self.repo.save_kitchen_order(kitchen_order)
        }

        fn load_active(&self) -> Result<crate::sinks::ActiveState, PersistenceError> {
            self.repo.load_active()
        }
    }

    impl LedgerSink for Flaky {
        fn has_sale(&self, order_id: &str) -> Result<bool, String> {
            self.repo.has_sale(order_id)
        }

        fn record_sale(&self, tenant_id: &str, order: &Order) -> Result<(), String> {
            if self.fail_sale.swap(false, Ordering::SeqCst) {
                return Err("ledger offline".into());
            }
            self.repo.record_sale(tenant_id, order)
        }
    }

    fn harness_with(repo: Arc<SqliteRepository>) -> Harness {
        harness_with_sinks(repo.clone(), repo.clone(), repo)
    }

    fn flaky_harness() -> (Harness, Arc<Flaky>) {
        let repo = Arc::new(SqliteRepository::new(Arc::new(db::test_state())));
        let flaky = Arc::new(Flaky::new(repo.clone()));
        (harness_with_sinks(repo, flaky.clone(), flaky.clone()), flaky)
    }

    fn harness_with_sinks(
        repo: Arc<SqliteRepository>,
        persistence: Arc<dyn OrderPersistence>,
        ledger: Arc<dyn LedgerSink>,
    ) -> Harness {
        let board = Arc::new(OrderBoard::new());
        let sync = Arc::new(RecordingSync::default());
        let printer = Arc::new(RecordingPrinter::default());
        let orchestrator = OrderOrchestrator::new(
            OrchestratorConfig {
                tenant_id: "tenant-1".into(),
                auto_print_on_accept: true,
            },
            Collaborators {
                kitchen: board.clone(),
                printer: printer.clone(),
                ledger,
                sync: sync.clone(),
                persistence,
            },
        );
        orchestrator.start().unwrap();
        Harness {
            orchestrator,
            board,
            sync,
            printer,
            repo,
        }
    }

    fn harness() -> Harness {
        harness_with(Arc::new(SqliteRepository::new(Arc::new(db::test_state()))))
    }

    fn biryani_order() -> Order {
        InboundOrder::from_json(
            r#"{"platform":"swiggy","order_id":"swiggy_4821","status":"pending",
                "customer":{"name":"Ravi"},
                "items":[{"name":"Veg Biryani","quantity":1,"price":220}],"total":220}"#,
        )
        .unwrap()
        .into_order(Utc::now())
    }

    fn sale_count(repo: &SqliteRepository) -> i64 {
        let conn = repo.db().lock().unwrap();
        conn.query_row("SELECT COUNT(*) FROM sales_transactions", [], |r| r.get(0))
            .unwrap()
    }

    #[test]
    fn duplicate_delivery_yields_one_ticket() {
        let h = harness();
        let order = biryani_order();
        h.orchestrator.process_new_order(order.clone(), OrderSource::Swiggy).unwrap();
        h.orchestrator.process_new_order(order, OrderSource::Swiggy).unwrap();

        assert_eq!(h.board.orders().len(), 1);
        let tickets = h.board.tickets();
        assert_eq!(tickets.len(), 1);
        assert_eq!(tickets[0].order_number, "4821");
        assert!(tickets[0].id.starts_with("kds_"));
        assert_eq!(h.sync.kinds(), vec!["order_created"]);

        let snap = h.orchestrator.snapshot("swiggy_4821").unwrap();
        assert_eq!(snap.mapping.unwrap().kitchen_order_id, Some(tickets[0].id.clone()));
    }

    #[test]
    fn send_to_kds_is_single_shot() {
        let h = harness();
        let order = biryani_order();
        h.orchestrator.process_new_order(order.clone(), OrderSource::Swiggy).unwrap();
        for _ in 0..3 {
            assert!(h.orchestrator.send_to_kds(&order, Some(30)).unwrap().is_none());
        }
        assert_eq!(h.board.tickets().len(), 1);
    }

    #[test]
    fn accept_confirms_and_applies_prep_override() {
        let h = harness();
        h.orchestrator
            .process_new_order(biryani_order(), OrderSource::Swiggy)
            .unwrap();
        let mut events = h.orchestrator.subscribe();

        let ticket = h.orchestrator.accept_order("swiggy_4821", 25).unwrap().unwrap();
        assert_eq!(ticket.estimated_prep_time, 25);
        assert_eq!(ticket.version, 2);

        let snap = h.orchestrator.snapshot("swiggy_4821").unwrap();
        assert_eq!(snap.order.status, OrderStatus::Confirmed);
        assert!(snap.order.accepted_at.is_some());
        assert_eq!(snap.kitchen_order.unwrap().estimated_prep_time, 25);

        assert_eq!(h.sync.kinds(), vec!["order_created", "order_status_changed"]);
        assert_eq!(*h.printer.printed.lock().unwrap(), vec![ticket.id.clone()]);

        assert!(matches!(
            events.try_recv().unwrap(),
            OrderEvent::StatusChanged { to: OrderStatus::Confirmed, .. }
        ));
        assert!(matches!(
            events.try_recv().unwrap(),
            OrderEvent::OrderAccepted { estimated_prep_time: 25, .. }
        ));

        assert!(h.orchestrator.accept_order("missing", 25).unwrap().is_none());
        assert!(matches!(
            h.orchestrator.accept_order("swiggy_4821", 25),
            Err(OrchestratorError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn invalid_order_stays_off_kitchen_and_sync() {
        let h = harness();
        let mut events = h.orchestrator.subscribe();
        let mut order = biryani_order();
        order.items.clear();
        h.orchestrator.process_new_order(order, OrderSource::Swiggy).unwrap();

        assert_eq!(h.board.orders().len(), 1);
        assert!(h.board.tickets().is_empty());
        assert!(h.sync.kinds().is_empty());
        assert!(matches!(events.try_recv().unwrap(), OrderEvent::OrderReceived { .. }));
        assert!(matches!(
            events.try_recv().unwrap(),
            OrderEvent::OrderValidationFailed { .. }
        ));
    }

    #[test]
    fn remote_status_drives_order_lifecycle() {
        let h = harness();
        h.orchestrator
            .process_new_order(biryani_order(), OrderSource::Swiggy)
            .unwrap();
        h.orchestrator.accept_order("swiggy_4821", 20).unwrap();
        let kid = h.board.tickets()[0].id.clone();

        h.orchestrator
            .on_remote_status_change(&kid, KitchenItemStatus::InProgress)
            .unwrap();
        assert_eq!(
            h.orchestrator.snapshot("swiggy_4821").unwrap().order.status,
            OrderStatus::Preparing
        );

        let version = h.board.ticket(&kid).unwrap().version;
        assert_eq!(
            h.orchestrator
                .apply_remote_kitchen_status(&kid, KitchenItemStatus::Ready, version + 1)
                .unwrap(),
            ApplyOutcome::Applied
        );
        assert_eq!(
            h.orchestrator
                .apply_remote_kitchen_status(&kid, KitchenItemStatus::Ready, version + 1)
                .unwrap(),
            ApplyOutcome::Stale
        );
        let snap = h.orchestrator.snapshot("swiggy_4821").unwrap();
        assert_eq!(snap.order.status, OrderStatus::PendingPickup);
        assert!(snap.order.ready_at.is_some());
        assert_eq!(sale_count(&h.repo), 1);

        assert_eq!(
            h.orchestrator
                .apply_remote_kitchen_status("kds_unknown", KitchenItemStatus::Ready, 9)
                .unwrap(),
            ApplyOutcome::Unknown
        );
    }

    #[test]
    fn remote_pending_does_not_move_order() {
        let h = harness();
        h.orchestrator
            .process_new_order(biryani_order(), OrderSource::Swiggy)
            .unwrap();
        let kid = h.board.tickets()[0].id.clone();
        h.orchestrator
            .on_remote_status_change(&kid, KitchenItemStatus::Pending)
            .unwrap();
        assert_eq!(
            h.orchestrator.snapshot("swiggy_4821").unwrap().order.status,
            OrderStatus::Pending
        );
    }

    #[test]
    fn ready_records_sale_once_and_completion_archives() {
        let h = harness();
        h.orchestrator
            .process_new_order(biryani_order(), OrderSource::Swiggy)
            .unwrap();
        h.orchestrator.accept_order("swiggy_4821", 20).unwrap();
        h.orchestrator.mark_ready("swiggy_4821").unwrap();
        assert_eq!(sale_count(&h.repo), 1);
        let ticket = h.board.tickets()[0].clone();
        assert_eq!(ticket.aggregate_status(), KitchenItemStatus::Ready);

        assert!(h.orchestrator.mark_ready("swiggy_4821").is_err());
        h.orchestrator.mark_picked_up("swiggy_4821").unwrap();
        h.orchestrator.mark_completed("swiggy_4821").unwrap();
        assert_eq!(sale_count(&h.repo), 1);
        assert!(h.board.tickets().is_empty());
        assert_eq!(h.board.archived().len(), 1);
        assert!(h.orchestrator.mark_delivered("swiggy_4821").is_err());

        let conn = h.repo.db().lock().unwrap();
        assert!(pending_count(&conn).unwrap() >= 2);
    }

    #[test]
    fn cancellation_only_before_preparation() {
        let h = harness();
        h.orchestrator
            .process_new_order(biryani_order(), OrderSource::Swiggy)
            .unwrap();
        h.orchestrator.accept_order("swiggy_4821", 20).unwrap();
        h.orchestrator
            .cancel_order("swiggy_4821", Some("out of stock".into()))
            .unwrap();
        let snap = h.orchestrator.snapshot("swiggy_4821").unwrap();
        assert_eq!(snap.order.status, OrderStatus::Cancelled);
        assert_eq!(snap.order.cancellation_reason.as_deref(), Some("out of stock"));
        assert_eq!(snap.kitchen_order.unwrap().aggregate_status(), KitchenItemStatus::Cancelled);
        assert!(h.board.tickets().is_empty());

        let mut late = biryani_order();
        late.order_id = "swiggy_9".into();
        h.orchestrator.process_new_order(late, OrderSource::Swiggy).unwrap();
        h.orchestrator.accept_order("swiggy_9", 20).unwrap();
        h.orchestrator.mark_ready("swiggy_9").unwrap();
        assert!(matches!(
            h.orchestrator.cancel_order("swiggy_9", None),
            Err(OrchestratorError::InvalidTransition {
                from: OrderStatus::PendingPickup,
                to: OrderStatus::Cancelled
            })
        ));
    }

    #[test]
    fn failed_intake_is_retried_not_deduplicated() {
        let (h, flaky) = flaky_harness();
        flaky.fail_ticket.store(true, Ordering::SeqCst);
        assert!(h
            .orchestrator
            .process_new_order(biryani_order(), OrderSource::Swiggy)
            .is_err());
        assert!(h.orchestrator.snapshot("swiggy_4821").is_none());
        assert!(h.sync.kinds().is_empty());

        h.orchestrator
            .process_new_order(biryani_order(), OrderSource::Swiggy)
            .unwrap();
        assert_eq!(h.board.orders().len(), 1);
        assert_eq!(h.board.tickets().len(), 1);
        assert_eq!(h.sync.kinds(), vec!["order_created"]);
    }

    #[test]
    fn skipping_past_ready_still_records_sale() {
        let h = harness();
        h.orchestrator
            .process_new_order(biryani_order(), OrderSource::Swiggy)
            .unwrap();
        h.orchestrator.mark_completed("swiggy_4821").unwrap();
        assert_eq!(sale_count(&h.repo), 1);
        assert!(h.repo.has_sale("swiggy_4821").unwrap());

        let mut other = biryani_order();
        other.order_id = "swiggy_77".into();
        h.orchestrator.process_new_order(other, OrderSource::Swiggy).unwrap();
        h.orchestrator.mark_picked_up("swiggy_77").unwrap();
        h.orchestrator.mark_delivered("swiggy_77").unwrap();
        assert_eq!(sale_count(&h.repo), 2);
    }

    #[test]
    fn ledger_failure_blocks_skip_past_ready() {
        let (h, flaky) = flaky_harness();
        h.orchestrator
            .process_new_order(biryani_order(), OrderSource::Swiggy)
            .unwrap();
        flaky.fail_sale.store(true, Ordering::SeqCst);
        assert!(matches!(
            h.orchestrator.mark_completed("swiggy_4821"),
            Err(OrchestratorError::Ledger(_))
        ));
        assert_eq!(
            h.orchestrator.snapshot("swiggy_4821").unwrap().order.status,
            OrderStatus::Pending
        );
        assert_eq!(sale_count(&h.repo), 0);
    }

    #[test]
    fn remote_ready_with_ledger_down_leaves_order_and_ticket() {
        let (h, flaky) = flaky_harness();
        h.orchestrator
            .process_new_order(biryani_order(), OrderSource::Swiggy)
            .unwrap();
        h.orchestrator.accept_order("swiggy_4821", 20).unwrap();
        let kid = h.board.tickets()[0].id.clone();
        h.orchestrator
            .on_remote_status_change(&kid, KitchenItemStatus::InProgress)
            .unwrap();
        let before = h.orchestrator.snapshot("swiggy_4821").unwrap();
        let version = before.kitchen_order.as_ref().unwrap().version;

        flaky.fail_sale.store(true, Ordering::SeqCst);
        assert!(h
            .orchestrator
            .apply_remote_kitchen_status(&kid, KitchenItemStatus::Ready, version + 1)
            .is_err());
        let after = h.orchestrator.snapshot("swiggy_4821").unwrap();
        assert_eq!(after.order.status, OrderStatus::Preparing);
        assert_eq!(after.kitchen_order, before.kitchen_order);
        assert_eq!(sale_count(&h.repo), 0);

        // The next bump from the display settles the sale.
        assert_eq!(
            h.orchestrator
                .apply_remote_kitchen_status(&kid, KitchenItemStatus::Ready, version + 1)
                .unwrap(),
            ApplyOutcome::Applied
        );
        assert_eq!(
            h.orchestrator.snapshot("swiggy_4821").unwrap().order.status,
            OrderStatus::PendingPickup
        );
        assert_eq!(sale_count(&h.repo), 1);
    }

    #[test]
    fn remote_completion_archive_reaches_displays() {
        let h = harness();
        h.orchestrator
            .process_new_order(biryani_order(), OrderSource::Swiggy)
            .unwrap();
        h.orchestrator.accept_order("swiggy_4821", 20).unwrap();
        let display = KitchenReplica::new();
        display.apply(h.board.tickets()[0].clone());
        let kid = h.board.tickets()[0].id.clone();

        for status in [KitchenItemStatus::Ready, KitchenItemStatus::Completed] {
            let SyncEvent::KitchenStatusChanged { version, .. } =
                display.set_status(&kid, status, Utc::now()).unwrap()
            else {
                panic!("expected status event");
            };
            assert_eq!(
                h.orchestrator
                    .apply_remote_kitchen_status(&kid, status, version)
                    .unwrap(),
                ApplyOutcome::Applied
            );
        }
        assert_eq!(
            h.orchestrator.snapshot("swiggy_4821").unwrap().order.status,
            OrderStatus::Completed
        );
        assert!(h.board.tickets().is_empty());

        let archived = match h.sync.events.lock().unwrap().last().cloned() {
            Some(SyncEvent::OrderStatusChanged {
                kitchen_order: Some(ticket),
                ..
            }) => ticket,
            other => panic!("unexpected event {other:?}"),
        };
        assert!(archived.archived);
        assert_eq!(display.apply(archived), ApplyOutcome::Applied);
        assert!(display.active_tickets().is_empty());
    }

    #[test]
    fn urgency_refresh_does_not_race_display_bumps() {
        let h = harness();
        h.orchestrator
            .process_new_order(biryani_order(), OrderSource::Swiggy)
            .unwrap();
        h.orchestrator.accept_order("swiggy_4821", 20).unwrap();
        let ticket = h.board.tickets()[0].clone();

        let flipped = h
            .orchestrator
            .refresh_urgency(Utc::now() + chrono::Duration::minutes(45))
            .unwrap();
        assert_eq!(flipped.len(), 1);
        assert!(flipped[0].is_urgent);
        assert_eq!(flipped[0].version, ticket.version);
        assert_eq!(h.sync.kinds(), vec!["order_created", "order_status_changed"]);

        // A display bump made at the same moment carries the next version.
        assert_eq!(
            h.orchestrator
                .apply_remote_kitchen_status(&ticket.id, KitchenItemStatus::InProgress, ticket.version + 1)
                .unwrap(),
            ApplyOutcome::Applied
        );
        assert_eq!(
            h.orchestrator.snapshot("swiggy_4821").unwrap().order.status,
            OrderStatus::Preparing
        );
    }

    #[test]
    fn calls_before_start_are_rejected() {
        let h = harness();
        h.orchestrator.stop();
        assert!(matches!(
            h.orchestrator.process_new_order(biryani_order(), OrderSource::Swiggy),
            Err(OrchestratorError::NotStarted)
        ));
    }

    #[test]
    fn restart_rehydrates_and_keeps_dedupe() {
        let repo = Arc::new(SqliteRepository::new(Arc::new(db::test_state())));
        let first = harness_with(repo.clone());
        first
            .orchestrator
            .process_new_order(biryani_order(), OrderSource::Swiggy)
            .unwrap();
        first.orchestrator.accept_order("swiggy_4821", 20).unwrap();
        let kid = first.board.tickets()[0].id.clone();

        let second = harness_with(repo);
        assert_eq!(second.board.tickets().len(), 1);
        second
            .orchestrator
            .process_new_order(biryani_order(), OrderSource::Swiggy)
            .unwrap();
        assert!(second.sync.kinds().is_empty());
        second
            .orchestrator
            .on_remote_status_change(&kid, KitchenItemStatus::InProgress)
            .unwrap();
        assert_eq!(
            second.orchestrator.snapshot("swiggy_4821").unwrap().order.status,
            OrderStatus::Preparing
        );
    }
}
