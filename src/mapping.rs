//! Order <-> kitchen identity mapping and the bounded dedupe set.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::models::{KitchenItemStatus, Order, OrderMapping};

/// Default capacity of the processed-order set.
pub const PROCESSED_CAPACITY: usize = 1000;

/// Insertion-ordered set of processed order ids. When the cap is exceeded the
/// oldest half is evicted in one go.
#[derive(Debug)]
pub struct ProcessedOrders {
    order: VecDeque<String>,
    members: HashSet<String>,
    capacity: usize,
}

impl Default for ProcessedOrders {
    fn default() -> Self {
        Self::with_capacity(PROCESSED_CAPACITY)
    }
}

impl ProcessedOrders {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity + 1),
            members: HashSet::with_capacity(capacity + 1),
            capacity: capacity.max(2),
        }
    }

    pub fn contains(&self, order_id: &str) -> bool {
        self.members.contains(order_id)
    }

    /// Returns false if the id was already present.
    pub fn insert(&mut self, order_id: &str) -> bool {
        if !self.members.insert(order_id.to_string()) {
            return false;
        }
        self.order.push_back(order_id.to_string());
        if self.order.len() > self.capacity {
            let evict = self.order.len() / 2;
            for old in self.order.drain(..evict) {
                self.members.remove(&old);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Forward (`external -> mapping`) and reverse (`kitchen -> external`) index.
#[derive(Debug, Default)]
pub struct OrderMappingStore {
    by_external: HashMap<String, OrderMapping>,
    by_kitchen: HashMap<String, String>,
}

impl OrderMappingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the mapping for an order if it does not exist yet.
    pub fn ensure(&mut self, order: &Order) -> &OrderMapping {
        self.by_external
            .entry(order.order_id.clone())
            .or_insert_with(|| OrderMapping::for_order(order))
    }

    /// Restore a persisted mapping, reindexing its kitchen id.
    pub fn restore(&mut self, mapping: OrderMapping) {
        if let Some(kitchen_id) = &mapping.kitchen_order_id {
            self.by_kitchen
                .insert(kitchen_id.clone(), mapping.external_order_id.clone());
        }
        self.by_external
            .insert(mapping.external_order_id.clone(), mapping);
    }

    pub fn get(&self, external_order_id: &str) -> Option<&OrderMapping> {
        self.by_external.get(external_order_id)
    }

    pub fn has_kitchen_order(&self, external_order_id: &str) -> bool {
        self.by_external
            .get(external_order_id)
            .is_some_and(|m| m.kitchen_order_id.is_some())
    }

    pub fn external_for_kitchen(&self, kitchen_order_id: &str) -> Option<&str> {
        self.by_kitchen.get(kitchen_order_id).map(String::as_str)
    }

    /// Register the kitchen id in both directions. Refuses (returns false)
    /// when the order is unknown or already has a kitchen order.
    pub fn attach_kitchen_order(&mut self, external_order_id: &str, kitchen_order_id: &str) -> bool {
        let Some(mapping) = self.by_external.get_mut(external_order_id) else {
            return false;
        };
        if mapping.kitchen_order_id.is_some() {
            return false;
        }
        mapping.kitchen_order_id = Some(kitchen_order_id.to_string());
        mapping.kitchen_status = Some(KitchenItemStatus::Pending);
        self.by_kitchen
            .insert(kitchen_order_id.to_string(), external_order_id.to_string());
        true
    }

    /// Mirror the order's lifecycle fields into its mapping.
    pub fn record_status(&mut self, order: &Order) -> Option<&OrderMapping> {
        let mapping = self.by_external.get_mut(&order.order_id)?;
        mapping.current_status = order.status;
        mapping.accepted_at = order.accepted_at;
        mapping.ready_at = order.ready_at;
        Some(mapping)
    }

    pub fn record_kitchen_status(
        &mut self,
        external_order_id: &str,
        status: KitchenItemStatus,
    ) -> Option<&OrderMapping> {
        let mapping = self.by_external.get_mut(external_order_id)?;
        mapping.kitchen_status = Some(status);
        Some(mapping)
    }

    /// Mappings still in flight (not terminal).
    pub fn active(&self) -> impl Iterator<Item = &OrderMapping> {
        self.by_external
            .values()
            .filter(|m| !m.current_status.is_terminal())
    }

    pub fn len(&self) -> usize {
        self.by_external.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_external.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Customer, OrderSource, OrderStatus, Totals};
    use chrono::Utc;

    fn order(id: &str) -> Order {
        let now = Utc::now();
        Order {
            order_id: id.to_string(),
            order_number: id.to_string(),
            source: OrderSource::Pos,
            status: OrderStatus::Pending,
            created_at: now,
            accepted_at: None,
            ready_at: None,
            items: vec![],
            totals: Totals::default(),
            customer: Customer::default(),
            cancellation_reason: None,
            updated_at: now,
        }
    }

    #[test]
    fn processed_set_evicts_oldest_half() {
        let mut set = ProcessedOrders::with_capacity(10);
        for i in 0..10 {
            assert!(set.insert(&format!("o{i}")));
        }
        assert_eq!(set.len(), 10);
        assert!(set.insert("o10"));
        // 11 entries exceeded the cap; the oldest 5 are gone.
        assert_eq!(set.len(), 6);
        for i in 0..5 {
            assert!(!set.contains(&format!("o{i}")));
        }
        for i in 5..=10 {
            assert!(set.contains(&format!("o{i}")));
        }
    }

    #[test]
    fn processed_set_rejects_repeats() {
        let mut set = ProcessedOrders::default();
        assert!(set.insert("a"));
        assert!(!set.insert("a"));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn attach_kitchen_order_is_single_shot() {
        let mut store = OrderMappingStore::new();
        store.ensure(&order("swiggy_1"));
        assert!(store.attach_kitchen_order("swiggy_1", "kds_a"));
        assert!(!store.attach_kitchen_order("swiggy_1", "kds_b"));
        assert_eq!(store.external_for_kitchen("kds_a"), Some("swiggy_1"));
        assert_eq!(store.external_for_kitchen("kds_b"), None);
        assert_eq!(
            store.get("swiggy_1").and_then(|m| m.kitchen_order_id.as_deref()),
            Some("kds_a")
        );
    }

    #[test]
    fn attach_requires_known_order() {
        let mut store = OrderMappingStore::new();
        assert!(!store.attach_kitchen_order("missing", "kds_x"));
        assert!(store.is_empty());
    }

    #[test]
    fn restore_rebuilds_reverse_index() {
        let mut store = OrderMappingStore::new();
        let mut mapping = OrderMapping::for_order(&order("zomato_9"));
        mapping.kitchen_order_id = Some("kds_9".into());
        store.restore(mapping);
        assert_eq!(store.external_for_kitchen("kds_9"), Some("zomato_9"));
        assert!(store.has_kitchen_order("zomato_9"));
    }
}
