//! Narrow collaborator interfaces the orchestrator is constructed with.
//!
//! The orchestrator never holds concrete UI, printer, ledger or transport
//! types; each collaborator is injected behind one of these traits. All of
//! them receive clones or borrowed snapshots, never references into
//! orchestrator-owned state.

use crate::error::{PersistenceError, ValidationError};
use crate::models::{KitchenOrder, Order, OrderMapping, OrderStatus};
use crate::sync::SyncEvent;

/// UI-facing order and ticket lists.
pub trait KitchenSink: Send + Sync {
    /// Insert or replace the order in the order list.
    fn add_order_to_list(&self, order: &Order);
    /// Insert or replace a kitchen ticket.
    fn add_kitchen_order(&self, kitchen_order: &KitchenOrder);
    fn remove_kitchen_order(&self, kitchen_order_id: &str);
    fn archive_kitchen_order(&self, kitchen_order_id: &str);
}

/// Kitchen ticket printer. Failures are logged by the caller, never retried.
pub trait PrinterSink: Send + Sync {
    fn print(&self, kitchen_order: &KitchenOrder) -> Result<(), String>;
}

/// External sales ledger.
pub trait LedgerSink: Send + Sync {
    fn has_sale(&self, order_id: &str) -> Result<bool, String>;
    fn record_sale(&self, tenant_id: &str, order: &Order) -> Result<(), String>;
}

/// Outbound replication. Must not block on the network.
pub trait SyncSink: Send + Sync {
    /// Returns the number of channels the event was handed to.
    fn broadcast(&self, event: SyncEvent) -> usize;
}

/// Everything the orchestrator rehydrates on start.
#[derive(Debug, Default, Clone)]
pub struct ActiveState {
    pub orders: Vec<Order>,
    pub mappings: Vec<OrderMapping>,
    pub kitchen_orders: Vec<KitchenOrder>,
    /// Most recently created order ids of any status, oldest first.
    pub recent_order_ids: Vec<String>,
}

/// Durable local storage for orchestrator-owned records.
pub trait OrderPersistence: Send + Sync {
    fn save_order(&self, order: &Order) -> Result<(), PersistenceError>;
    fn save_mapping(&self, mapping: &OrderMapping) -> Result<(), PersistenceError>;
    fn save_kitchen_order(&self, kitchen_order: &KitchenOrder) -> Result<(), PersistenceError>;
    /// Non-terminal orders, their mappings and non-archived kitchen orders.
    fn load_active(&self) -> Result<ActiveState, PersistenceError>;
}

/// Local notifications published by the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum OrderEvent {
    OrderReceived {
        order_id: String,
        order_number: String,
    },
    OrderValidationFailed {
        order_id: String,
        reason: ValidationError,
    },
    KitchenOrderSent {
        order_id: String,
        kitchen_order_id: String,
    },
    OrderAccepted {
        order_id: String,
        kitchen_order_id: String,
        estimated_prep_time: u32,
    },
    StatusChanged {
        order_id: String,
        from: OrderStatus,
        to: OrderStatus,
    },
}
