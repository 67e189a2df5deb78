//! Inbound order events from extraction, POS entry and QR ordering.
//!
//! Producers are loose about shapes: the customer may be nested or flattened
//! into `customer_*` fields, `created_at` may be missing or unparseable, and
//! the order number is sometimes only embedded in the id (`swiggy_4821`).
//! Everything is normalized into a canonical [`Order`] here so the
//! orchestrator only ever sees one representation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::{Coordinates, Customer, Order, OrderItem, OrderSource, OrderStatus, Totals};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InboundCustomer {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub coordinates: Option<Coordinates>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundItem {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub quantity: u32,
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub modifiers: Option<Vec<String>>,
    #[serde(default)]
    pub special_instructions: Option<String>,
}

/// Raw inbound order event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundOrder {
    pub platform: String,
    pub order_id: String,
    #[serde(default)]
    pub order_number: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub customer: Option<InboundCustomer>,
    #[serde(default)]
    pub customer_name: Option<String>,
    #[serde(default)]
    pub customer_phone: Option<String>,
    #[serde(default)]
    pub customer_address: Option<String>,
    #[serde(default)]
    pub items: Vec<InboundItem>,
    #[serde(default)]
    pub total: f64,
    #[serde(default)]
    pub tax: Option<f64>,
    #[serde(default)]
    pub fees: Option<f64>,
    #[serde(default)]
    pub discount: Option<f64>,
}

impl InboundOrder {
    /// Parse one JSON document (one NDJSON line).
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Resolved source, falling back to `online` for unknown platforms.
    pub fn source(&self) -> OrderSource {
        OrderSource::from_platform(&self.platform).unwrap_or(OrderSource::Online)
    }

    /// Normalize into a canonical order. `now` is used when the event
    /// carries no usable creation time.
    pub fn into_order(self, now: DateTime<Utc>) -> Order {
        let source = self.source();
        let order_number = self
            .order_number
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| derive_order_number(&self.order_id, &self.platform));

        let status = self
            .status
            .as_deref()
            .and_then(|s| s.parse::<OrderStatus>().ok())
            .unwrap_or(OrderStatus::Pending);

        let created_at = self
            .created_at
            .as_deref()
            .and_then(parse_timestamp)
            .unwrap_or(now);

        let nested = self.customer.unwrap_or_default();
        let customer = Customer {
            name: nested
                .name
                .or(self.customer_name)
                .unwrap_or_else(|| "Guest".to_string()),
            phone: nested.phone.or(self.customer_phone),
            address: nested.address.or(self.customer_address),
            coordinates: nested.coordinates,
        };

        let items: Vec<OrderItem> = self
            .items
            .into_iter()
            .map(|item| OrderItem {
                name: item.name.trim().to_string(),
                quantity: item.quantity,
                unit_price: item.price,
                modifiers: item.modifiers.unwrap_or_default(),
                special_instructions: item
                    .special_instructions
                    .filter(|s| !s.trim().is_empty()),
            })
            .collect();

        let subtotal: f64 = items.iter().map(OrderItem::line_total).sum();
        let tax = self.tax.unwrap_or(0.0);
        let fees = self.fees.unwrap_or(0.0);
        let discount = self.discount.unwrap_or(0.0);
        let grand_total = if self.total > 0.0 {
            self.total
        } else {
            subtotal + tax + fees - discount
        };

        debug!(
            order_id = %self.order_id,
            source = %source,
            items = items.len(),
            "Normalized inbound order"
        );

        Order {
            order_id: self.order_id,
            order_number,
            source,
            status,
            created_at,
            accepted_at: None,
            ready_at: None,
            items,
            totals: Totals {
                subtotal,
                tax,
                fees,
                discount,
                grand_total,
            },
            customer,
            cancellation_reason: None,
            updated_at: now,
        }
    }
}

/// `swiggy_4821` -> `4821`. Ids without the platform prefix are used as-is.
fn derive_order_number(order_id: &str, platform: &str) -> String {
    let prefix = format!("{}_", platform.trim().to_ascii_lowercase());
    let lowered = order_id.to_ascii_lowercase();
    if lowered.starts_with(&prefix) && order_id.len() > prefix.len() {
        order_id[prefix.len()..].to_string()
    } else {
        order_id.to_string()
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
                .ok()
                .map(|naive| naive.and_utc())
        })
}
