//! Wire format shared by the cloud and local-mesh channels.
//!
//! One JSON text frame per message, internally tagged by `type`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::DeviceRole;
use crate::models::{KitchenItemStatus, KitchenOrder, Order, OrderStatus};
use crate::roster::{FloorTable, StaffMember};

/// Replicated domain event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    OrderCreated {
        order: Order,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kitchen_order: Option<KitchenOrder>,
    },
    OrderStatusChanged {
        order_id: String,
        status: OrderStatus,
        updated_at: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kitchen_order: Option<KitchenOrder>,
    },
    KitchenOrderUpdated {
        kitchen_order: KitchenOrder,
    },
    /// Emitted by kitchen displays when staff bump a ticket.
    KitchenStatusChanged {
        kitchen_order_id: String,
        order_id: String,
        status: KitchenItemStatus,
        version: u64,
        updated_at: DateTime<Utc>,
    },
    StaffUpserted {
        staff: StaffMember,
    },
    StaffRemoved {
        staff_id: String,
    },
    FloorTableUpserted {
        table: FloorTable,
    },
    FloorTableRemoved {
        table_id: String,
    },
    SyncRequested {
        device_id: String,
    },
    SyncResponse {
        device_id: String,
        staff: Vec<StaffMember>,
        tables: Vec<FloorTable>,
    },
}

impl SyncEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            SyncEvent::OrderCreated { .. } => "order_created",
            SyncEvent::OrderStatusChanged { .. } => "order_status_changed",
            SyncEvent::KitchenOrderUpdated { .. } => "kitchen_order_updated",
            SyncEvent::KitchenStatusChanged { .. } => "kitchen_status_changed",
            SyncEvent::StaffUpserted { .. } => "staff_upserted",
            SyncEvent::StaffRemoved { .. } => "staff_removed",
            SyncEvent::FloorTableUpserted { .. } => "floor_table_upserted",
            SyncEvent::FloorTableRemoved { .. } => "floor_table_removed",
            SyncEvent::SyncRequested { .. } => "sync_requested",
            SyncEvent::SyncResponse { .. } => "sync_response",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub server_id: String,
    pub tenant_id: String,
    pub connected_clients: usize,
    pub server_time: DateTime<Utc>,
}

/// Channel envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncMessage {
    Register {
        device_type: DeviceRole,
        tenant_id: String,
        device_id: String,
    },
    Registered {
        client_id: String,
        server_info: ServerInfo,
    },
    Ping,
    Pong,
    Error {
        message: String,
        code: String,
    },
    Event {
        /// Device id of the emitter; receivers drop their own echoes.
        origin: String,
        event: SyncEvent,
    },
}

pub const TENANT_MISMATCH: &str = "TENANT_MISMATCH";
pub const REGISTRATION_REQUIRED: &str = "REGISTRATION_REQUIRED";

impl SyncMessage {
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
