//! Read side of kitchen and bump displays.
//!
//! Every kitchen mutation arrives with a `version`; an update is applied
//! only when it is strictly newer than what is held, or when nothing is held
//! yet. Dual delivery (cloud + local mesh) therefore collapses to a single
//! application.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::OrchestratorError;
use crate::models::{KitchenItemStatus, KitchenOrder, Order, OrderStatus};
use crate::sync::SyncEvent;

/// True when an incoming `version` should replace the local one.
pub fn is_newer(local: Option<u64>, incoming: u64) -> bool {
    local.map_or(true, |held| incoming > held)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Duplicate or older than what is held.
    Stale,
    /// Refers to a record this device has never seen.
    Unknown,
}

#[derive(Default)]
struct Inner {
    orders: HashMap<String, Order>,
    tickets: HashMap<String, KitchenOrder>,
}

#[derive(Default)]
pub struct KitchenReplica {
    inner: RwLock<Inner>,
}

impl KitchenReplica {
    pub fn new() -> Self {
        Self::default()
    }

    /// Version-gated upsert of a whole ticket.
    pub fn apply(&self, mut ticket: KitchenOrder) -> ApplyOutcome {
        let Ok(mut inner) = self.inner.write() else {
            return ApplyOutcome::Stale;
        };
        let held = inner.tickets.get(&ticket.id).map(|t| t.version);
        if !is_newer(held, ticket.version) {
            debug!(kitchen_order_id = %ticket.id, version = ticket.version, "Stale ticket dropped");
            return ApplyOutcome::Stale;
        }
        ticket.refresh_urgency(Utc::now());
        inner.tickets.insert(ticket.id.clone(), ticket);
        ApplyOutcome::Applied
    }

    /// Orders carry no version; `updated_at` orders them instead.
    pub fn apply_order(&self, order: Order) -> ApplyOutcome {
        let Ok(mut inner) = self.inner.write() else {
            return ApplyOutcome::Stale;
        };
        if let Some(held) = inner.orders.get(&order.order_id) {
            if order.updated_at <= held.updated_at {
                return ApplyOutcome::Stale;
            }
        }
        inner.orders.insert(order.order_id.clone(), order);
        ApplyOutcome::Applied
    }

    pub fn apply_order_status(
        &self,
        order_id: &str,
        status: OrderStatus,
        updated_at: DateTime<Utc>,
    ) -> ApplyOutcome {
        let Ok(mut inner) = self.inner.write() else {
            return ApplyOutcome::Stale;
        };
        let Some(order) = inner.orders.get_mut(order_id) else {
            return ApplyOutcome::Unknown;
        };
        if updated_at <= order.updated_at || !order.status.can_transition_to(status) {
            return ApplyOutcome::Stale;
        }
        order.status = status;
        order.updated_at = updated_at;
        ApplyOutcome::Applied
    }

    /// Another display bumped a ticket.
    pub fn apply_kitchen_status(
        &self,
        kitchen_order_id: &str,
        status: KitchenItemStatus,
        version: u64,
        updated_at: DateTime<Utc>,
    ) -> ApplyOutcome {
        let Ok(mut inner) = self.inner.write() else {
            return ApplyOutcome::Stale;
        };
        let Some(ticket) = inner.tickets.get_mut(kitchen_order_id) else {
            return ApplyOutcome::Unknown;
        };
        if !is_newer(Some(ticket.version), version) {
            return ApplyOutcome::Stale;
        }
        ticket.advance_items(status);
        ticket.version = version;
        ticket.updated_at = updated_at;
        ticket.refresh_urgency(Utc::now());
        ApplyOutcome::Applied
    }

    /// Recompute urgency of live tickets in place. The version is left
    /// alone so a concurrent bump from another device still applies.
    pub fn refresh_urgency(&self, now: DateTime<Utc>) -> usize {
        let Ok(mut inner) = self.inner.write() else {
            return 0;
        };
        inner
            .tickets
            .values_mut()
            .filter(|t| !t.archived)
            .map(|t| t.refresh_urgency(now))
            .filter(|flipped| *flipped)
            .count()
    }

    /// Bump a whole ticket locally. Returns the event to broadcast.
    pub fn set_status(
        &self,
        kitchen_order_id: &str,
        status: KitchenItemStatus,
        now: DateTime<Utc>,
    ) -> Result<SyncEvent, OrchestratorError> {
        let mut inner = self
            .inner
            .write()
            .map_err(|_| OrchestratorError::OrderNotFound(kitchen_order_id.to_string()))?;
        let ticket = inner
            .tickets
            .get_mut(kitchen_order_id)
            .ok_or_else(|| OrchestratorError::OrderNotFound(kitchen_order_id.to_string()))?;
        let from = ticket.aggregate_status();
        if !from.can_transition_to(status) {
            return Err(OrchestratorError::InvalidKitchenTransition { from, to: status });
        }
        ticket.advance_items(status);
        ticket.touch(now);
        ticket.refresh_urgency(now);
        Ok(SyncEvent::KitchenStatusChanged {
            kitchen_order_id: ticket.id.clone(),
            order_id: ticket.order_id.clone(),
            status,
            version: ticket.version,
            updated_at: now,
        })
    }

    /// Bump one item. The full ticket is replicated so per-item state
    /// survives on other displays.
    pub fn set_item_status(
        &self,
        kitchen_order_id: &str,
        item_index: usize,
        status: KitchenItemStatus,
        now: DateTime<Utc>,
    ) -> Result<SyncEvent, OrchestratorError> {
        let mut inner = self
            .inner
            .write()
            .map_err(|_| OrchestratorError::OrderNotFound(kitchen_order_id.to_string()))?;
        let ticket = inner
            .tickets
            .get_mut(kitchen_order_id)
            .ok_or_else(|| OrchestratorError::OrderNotFound(kitchen_order_id.to_string()))?;
        let item = ticket
            .items
            .get_mut(item_index)
            .ok_or_else(|| OrchestratorError::OrderNotFound(format!("{kitchen_order_id}#{item_index}")))?;
        if !item.status.can_transition_to(status) {
            return Err(OrchestratorError::InvalidKitchenTransition {
                from: item.status,
                to: status,
            });
        }
        item.status = status;
        ticket.touch(now);
        ticket.refresh_urgency(now);
        Ok(SyncEvent::KitchenOrderUpdated {
            kitchen_order: ticket.clone(),
        })
    }

    pub fn ticket(&self, kitchen_order_id: &str) -> Option<KitchenOrder> {
        self.inner
            .read()
            .ok()
            .and_then(|inner| inner.tickets.get(kitchen_order_id).cloned())
    }

    pub fn order(&self, order_id: &str) -> Option<Order> {
        self.inner
            .read()
            .ok()
            .and_then(|inner| inner.orders.get(order_id).cloned())
    }

    /// Non-archived tickets, oldest first.
    pub fn active_tickets(&self) -> Vec<KitchenOrder> {
        let mut tickets: Vec<KitchenOrder> = self
            .inner
            .read()
            .map(|inner| inner.tickets.values().filter(|t| !t.archived).cloned().collect())
            .unwrap_or_default();
        tickets.sort_by_key(|t| t.created_at);
        tickets
    }
}
