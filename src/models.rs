//! Domain types shared by the orchestrator, projector, persistence and sync
//! layers.
//!
//! Wire and storage formats are camelCase JSON; order statuses are
//! snake_case and kitchen statuses kebab-case, matching what the kitchen and
//! bump displays already speak.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Order source
// ---------------------------------------------------------------------------

/// Channel an order came in through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSource {
    /// Delivery aggregator A.
    Swiggy,
    /// Delivery aggregator B.
    Zomato,
    /// Point-of-sale terminal entry.
    Pos,
    /// Online / QR ordering.
    Online,
}

impl OrderSource {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderSource::Swiggy => "swiggy",
            OrderSource::Zomato => "zomato",
            OrderSource::Pos => "pos",
            OrderSource::Online => "online",
        }
    }

    /// Resolve the loosely named `platform` field of inbound events.
    pub fn from_platform(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "swiggy" => Some(OrderSource::Swiggy),
            "zomato" => Some(OrderSource::Zomato),
            "pos" | "point-of-sale" | "point_of_sale" | "counter" => Some(OrderSource::Pos),
            "online" | "qr" | "web" => Some(OrderSource::Online),
            _ => None,
        }
    }

    pub fn is_aggregator(self) -> bool {
        matches!(self, OrderSource::Swiggy | OrderSource::Zomato)
    }
}

impl fmt::Display for OrderSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Order lifecycle
// ---------------------------------------------------------------------------

/// Order-level lifecycle.
///
/// ```text
/// pending -> confirmed -> preparing -> pending_pickup -> picked_up
///         -> out_for_delivery -> delivered -> completed
/// pending | confirmed -> cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Confirmed,
    Preparing,
    PendingPickup,
    PickedUp,
    OutForDelivery,
    Delivered,
    Completed,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Confirmed => "confirmed",
            OrderStatus::Preparing => "preparing",
            OrderStatus::PendingPickup => "pending_pickup",
            OrderStatus::PickedUp => "picked_up",
            OrderStatus::OutForDelivery => "out_for_delivery",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Completed => "completed",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    /// Position along the forward chain. Cancelled sits outside it.
    pub fn position(self) -> Option<u8> {
        match self {
            OrderStatus::Pending => Some(0),
            OrderStatus::Confirmed => Some(1),
            OrderStatus::Preparing => Some(2),
            OrderStatus::PendingPickup => Some(3),
            OrderStatus::PickedUp => Some(4),
            OrderStatus::OutForDelivery => Some(5),
            OrderStatus::Delivered => Some(6),
            OrderStatus::Completed => Some(7),
            OrderStatus::Cancelled => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Completed | OrderStatus::Cancelled)
    }

    /// Forward moves may skip intermediate states; cancellation is only
    /// reachable from `pending` or `confirmed`.
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self.position(), next.position()) {
            (Some(_), None) => matches!(self, OrderStatus::Pending | OrderStatus::Confirmed),
            (Some(current), Some(target)) => target > current,
            (None, _) => false,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase().replace('-', "_");
        let status = match normalized.as_str() {
            "pending" | "new" | "placed" => OrderStatus::Pending,
            "confirmed" | "accepted" | "approved" => OrderStatus::Confirmed,
            "preparing" | "in_progress" => OrderStatus::Preparing,
            "pending_pickup" | "ready" => OrderStatus::PendingPickup,
            "picked_up" => OrderStatus::PickedUp,
            "out_for_delivery" | "dispatched" => OrderStatus::OutForDelivery,
            "delivered" => OrderStatus::Delivered,
            "completed" | "done" => OrderStatus::Completed,
            "cancelled" | "canceled" | "rejected" | "declined" => OrderStatus::Cancelled,
            _ => return Err(format!("unknown order status: {raw}")),
        };
        Ok(status)
    }
}

// ---------------------------------------------------------------------------
// Order
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    pub name: String,
    pub quantity: u32,
    pub unit_price: f64,
    #[serde(default)]
    pub modifiers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub special_instructions: Option<String>,
}

impl OrderItem {
    pub fn line_total(&self) -> f64 {
        self.unit_price * f64::from(self.quantity)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Totals {
    pub subtotal: f64,
    pub tax: f64,
    pub fees: f64,
    pub discount: f64,
    pub grand_total: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Customer {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<Coordinates>,
}

/// Canonical order. `order_id` never changes once assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub order_id: String,
    pub order_number: String,
    pub source: OrderSource,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accepted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_at: Option<DateTime<Utc>>,
    pub items: Vec<OrderItem>,
    #[serde(default)]
    pub totals: Totals,
    #[serde(default)]
    pub customer: Customer,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancellation_reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Kitchen side
// ---------------------------------------------------------------------------

/// Per-item kitchen lifecycle.
///
/// `pending -> in-progress -> ready -> completed`, plus
/// `pending | in-progress -> cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KitchenItemStatus {
    Pending,
    InProgress,
    Ready,
    Completed,
    Cancelled,
}

impl KitchenItemStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            KitchenItemStatus::Pending => "pending",
            KitchenItemStatus::InProgress => "in-progress",
            KitchenItemStatus::Ready => "ready",
            KitchenItemStatus::Completed => "completed",
            KitchenItemStatus::Cancelled => "cancelled",
        }
    }

    fn position(self) -> Option<u8> {
        match self {
            KitchenItemStatus::Pending => Some(0),
            KitchenItemStatus::InProgress => Some(1),
            KitchenItemStatus::Ready => Some(2),
            KitchenItemStatus::Completed => Some(3),
            KitchenItemStatus::Cancelled => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, KitchenItemStatus::Completed | KitchenItemStatus::Cancelled)
    }

    pub fn can_transition_to(self, next: KitchenItemStatus) -> bool {
        match (self.position(), next.position()) {
            (Some(_), None) => matches!(
                self,
                KitchenItemStatus::Pending | KitchenItemStatus::InProgress
            ),
            (Some(current), Some(target)) => target > current,
            (None, _) => false,
        }
    }

    /// Order-level status a kitchen status implies, if any.
    pub fn order_status(self) -> Option<OrderStatus> {
        match self {
            KitchenItemStatus::InProgress => Some(OrderStatus::Preparing),
            KitchenItemStatus::Ready => Some(OrderStatus::PendingPickup),
            KitchenItemStatus::Completed => Some(OrderStatus::Completed),
            KitchenItemStatus::Pending | KitchenItemStatus::Cancelled => None,
        }
    }
}

impl fmt::Display for KitchenItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Station {
    Main,
    Grill,
    Tandoor,
    Fryer,
    Beverage,
    Dessert,
}

impl Station {
    pub fn as_str(self) -> &'static str {
        match self {
            Station::Main => "main",
            Station::Grill => "grill",
            Station::Tandoor => "tandoor",
            Station::Fryer => "fryer",
            Station::Beverage => "beverage",
            Station::Dessert => "dessert",
        }
    }
}

impl fmt::Display for Station {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KitchenItem {
    pub name: String,
    pub quantity: u32,
    #[serde(default)]
    pub modifiers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub special_instructions: Option<String>,
    pub station: Station,
    pub status: KitchenItemStatus,
}

/// Kitchen-display projection of an order. Every mutation bumps `version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KitchenOrder {
    pub id: String,
    pub order_id: String,
    pub order_number: String,
    pub source: OrderSource,
    #[serde(default)]
    pub customer_name: String,
    pub items: Vec<KitchenItem>,
    pub station: Station,
    pub estimated_prep_time: u32,
    pub is_urgent: bool,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub archived: bool,
}

impl KitchenOrder {
    /// Status of the ticket as a whole: the least advanced live item.
    /// A ticket whose items are all cancelled is cancelled.
    pub fn aggregate_status(&self) -> KitchenItemStatus {
        self.items
            .iter()
            .map(|item| item.status)
            .filter(|status| *status != KitchenItemStatus::Cancelled)
            .min_by_key(|status| status.position())
            .unwrap_or(KitchenItemStatus::Cancelled)
    }

    /// Move every item that can legally reach `status` there.
    /// Returns true when anything changed; the caller bumps the version.
    pub fn advance_items(&mut self, status: KitchenItemStatus) -> bool {
        let mut changed = false;
        for item in &mut self.items {
            if item.status.can_transition_to(status) {
                item.status = status;
                changed = true;
            }
        }
        changed
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.version += 1;
        self.updated_at = now;
    }

    /// Recompute `is_urgent` from elapsed time. Returns true if it flipped.
    pub fn refresh_urgency(&mut self, now: DateTime<Utc>) -> bool {
        let live = !self.aggregate_status().is_terminal()
            && self.aggregate_status() != KitchenItemStatus::Ready;
        let elapsed_min = (now - self.created_at).num_minutes();
        let urgent = live && elapsed_min >= i64::from(self.estimated_prep_time);
        let flipped = urgent != self.is_urgent;
        self.is_urgent = urgent;
        flipped
    }
}

// ---------------------------------------------------------------------------
// Mapping
// ---------------------------------------------------------------------------

/// Join record between an external order and its kitchen ticket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderMapping {
    pub external_order_id: String,
    pub order_number: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kitchen_order_id: Option<String>,
    pub source: OrderSource,
    pub current_status: OrderStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kitchen_status: Option<KitchenItemStatus>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accepted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_at: Option<DateTime<Utc>>,
}

impl OrderMapping {
    pub fn for_order(order: &Order) -> Self {
        Self {
            external_order_id: order.order_id.clone(),
            order_number: order.order_number.clone(),
            kitchen_order_id: None,
            source: order.source,
            current_status: order.status,
            kitchen_status: None,
            created_at: order.created_at,
            accepted_at: order.accepted_at,
            ready_at: order.ready_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [OrderStatus; 9] = [
        OrderStatus::Pending,
        OrderStatus::Confirmed,
        OrderStatus::Preparing,
        OrderStatus::PendingPickup,
        OrderStatus::PickedUp,
        OrderStatus::OutForDelivery,
        OrderStatus::Delivered,
        OrderStatus::Completed,
        OrderStatus::Cancelled,
    ];

    #[test]
    fn no_transition_moves_backwards() {
        for from in ALL {
            for to in ALL {
                if !from.can_transition_to(to) {
                    continue;
                }
                match (from.position(), to.position()) {
                    (Some(a), Some(b)) => assert!(b > a, "{from} -> {to} goes backwards"),
                    (Some(_), None) => assert!(
                        matches!(from, OrderStatus::Pending | OrderStatus::Confirmed),
                        "cancel from {from} must be rejected"
                    ),
                    (None, _) => panic!("cancelled must be terminal"),
                }
            }
        }
    }

    #[test]
    fn terminal_states_have_no_edges() {
        for to in ALL {
            assert!(!OrderStatus::Completed.can_transition_to(to));
            assert!(!OrderStatus::Cancelled.can_transition_to(to));
        }
    }

    #[test]
    fn cancellation_only_from_pending_or_confirmed() {
        assert!(OrderStatus::Pending.can_transition_to(OrderStatus::Cancelled));
        assert!(OrderStatus::Confirmed.can_transition_to(OrderStatus::Cancelled));
        assert!(!OrderStatus::Preparing.can_transition_to(OrderStatus::Cancelled));
        assert!(!OrderStatus::Delivered.can_transition_to(OrderStatus::Cancelled));
    }

    #[test]
    fn status_parsing_accepts_aliases() {
        assert_eq!("accepted".parse::<OrderStatus>(), Ok(OrderStatus::Confirmed));
        assert_eq!("ready".parse::<OrderStatus>(), Ok(OrderStatus::PendingPickup));
        assert_eq!(
            "out-for-delivery".parse::<OrderStatus>(),
            Ok(OrderStatus::OutForDelivery)
        );
        assert!("teleported".parse::<OrderStatus>().is_err());
    }

    #[test]
    fn kitchen_status_mapping_table() {
        assert_eq!(
            KitchenItemStatus::InProgress.order_status(),
            Some(OrderStatus::Preparing)
        );
        assert_eq!(
            KitchenItemStatus::Ready.order_status(),
            Some(OrderStatus::PendingPickup)
        );
        assert_eq!(
            KitchenItemStatus::Completed.order_status(),
            Some(OrderStatus::Completed)
        );
        assert_eq!(KitchenItemStatus::Pending.order_status(), None);
        assert_eq!(KitchenItemStatus::Cancelled.order_status(), None);
    }

    #[test]
    fn kitchen_item_cancel_only_before_ready() {
        assert!(KitchenItemStatus::Pending.can_transition_to(KitchenItemStatus::Cancelled));
        assert!(KitchenItemStatus::InProgress.can_transition_to(KitchenItemStatus::Cancelled));
        assert!(!KitchenItemStatus::Ready.can_transition_to(KitchenItemStatus::Cancelled));
        assert!(!KitchenItemStatus::Completed.can_transition_to(KitchenItemStatus::Ready));
    }

    #[test]
    fn kitchen_status_serializes_kebab_case() {
        let json = serde_json::to_string(&KitchenItemStatus::InProgress).unwrap();
        assert_eq!(json, "\"in-progress\"");
        let json = serde_json::to_string(&OrderStatus::PendingPickup).unwrap();
        assert_eq!(json, "\"pending_pickup\"");
    }
}
