//! In-memory order and ticket lists backing the order terminal's screens.

use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use tracing::debug;

use crate::models::{KitchenOrder, Order};
use crate::sinks::KitchenSink;

/// Archived tickets kept for the recall screen.
const ARCHIVE_CAPACITY: usize = 200;

#[derive(Default)]
struct BoardInner {
    orders: HashMap<String, Order>,
    tickets: HashMap<String, KitchenOrder>,
    archived: VecDeque<KitchenOrder>,
}

#[derive(Default)]
pub struct OrderBoard {
    inner: RwLock<BoardInner>,
}

impl OrderBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Orders newest first.
    pub fn orders(&self) -> Vec<Order> {
        let mut orders: Vec<Order> = self
            .inner
            .read()
            .map(|b| b.orders.values().cloned().collect())
            .unwrap_or_default();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        orders
    }

    pub fn order(&self, order_id: &str) -> Option<Order> {
        self.inner.read().ok()?.orders.get(order_id).cloned()
    }

    /// Live tickets oldest first, urgent ones on top.
    pub fn tickets(&self) -> Vec<KitchenOrder> {
        let mut tickets: Vec<KitchenOrder> = self
            .inner
            .read()
            .map(|b| b.tickets.values().cloned().collect())
            .unwrap_or_default();
        tickets.sort_by(|a, b| b.is_urgent.cmp(&a.is_urgent).then(a.created_at.cmp(&b.created_at)));
        tickets
    }

    pub fn ticket(&self, kitchen_order_id: &str) -> Option<KitchenOrder> {
        self.inner.read().ok()?.tickets.get(kitchen_order_id).cloned()
    }

    pub fn archived(&self) -> Vec<KitchenOrder> {
        self.inner
            .read()
            .map(|b| b.archived.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl KitchenSink for OrderBoard {
    fn add_order_to_list(&self, order: &Order) {
        if let Ok(mut board) = self.inner.write() {
            board.orders.insert(order.order_id.clone(), order.clone());
        }
    }

    fn add_kitchen_order(&self, kitchen_order: &KitchenOrder) {
        if let Ok(mut board) = self.inner.write() {
            board
                .tickets
                .insert(kitchen_order.id.clone(), kitchen_order.clone());
        }
    }

    fn remove_kitchen_order(&self, kitchen_order_id: &str) {
        if let Ok(mut board) = self.inner.write() {
            board.tickets.remove(kitchen_order_id);
        }
    }

    fn archive_kitchen_order(&self, kitchen_order_id: &str) {
        let Ok(mut board) = self.inner.write() else {
            return;
        };
        if let Some(mut ticket) = board.tickets.remove(kitchen_order_id) {
            ticket.archived = true;
            board.archived.push_front(ticket);
            board.archived.truncate(ARCHIVE_CAPACITY);
            debug!(%kitchen_order_id, "Ticket archived");
        }
    }
}
