//! Kitchen projection: turns a canonical order into the ticket the kitchen
//! and bump displays work from.
//!
//! Pure functions only. Identity (`kds_<uuid>`) and timestamps are supplied
//! by the caller so projection is deterministic under test.

use chrono::{DateTime, Utc};

use crate::error::ValidationError;
use crate::models::{KitchenItem, KitchenItemStatus, KitchenOrder, Order, OrderItem, Station};

/// Lower bound for the prep-time estimate, minutes.
pub const MIN_PREP_MINUTES: u32 = 10;
/// Upper bound for the prep-time estimate, minutes.
pub const MAX_PREP_MINUTES: u32 = 60;

const BASE_PREP_MINUTES: u32 = 8;
const PER_UNIT_MINUTES: u32 = 2;

/// Reject orders the kitchen cannot act on.
pub fn validate(order: &Order) -> Result<(), ValidationError> {
    if order.order_number.trim().is_empty() {
        return Err(ValidationError::MissingOrderNumber);
    }
    if order.items.is_empty() {
        return Err(ValidationError::NoItems);
    }
    for (index, item) in order.items.iter().enumerate() {
        if item.name.trim().is_empty() {
            return Err(ValidationError::MissingItemName { index });
        }
        if item.quantity == 0 {
            return Err(ValidationError::InvalidQuantity { index });
        }
    }
    Ok(())
}

/// Project a validated order into a fresh kitchen ticket (version 1).
pub fn project(
    order: &Order,
    kitchen_order_id: String,
    prep_override: Option<u32>,
    now: DateTime<Utc>,
) -> Result<KitchenOrder, ValidationError> {
    validate(order)?;

    let items: Vec<KitchenItem> = order
        .items
        .iter()
        .map(|item| KitchenItem {
            name: item.name.clone(),
            quantity: item.quantity,
            modifiers: item.modifiers.clone(),
            special_instructions: item.special_instructions.clone(),
            station: station_for_item(&item.name),
            status: KitchenItemStatus::Pending,
        })
        .collect();

    let station = dominant_station(&items);
    let estimated_prep_time = prep_override
        .filter(|m| *m > 0)
        .unwrap_or_else(|| estimate_prep_time(&order.items));

    let mut kitchen_order = KitchenOrder {
        id: kitchen_order_id,
        order_id: order.order_id.clone(),
        order_number: order.order_number.clone(),
        source: order.source,
        customer_name: order.customer.name.clone(),
        items,
        station,
        estimated_prep_time,
        is_urgent: false,
        version: 1,
        created_at: order.created_at,
        updated_at: now,
        archived: false,
    };
    kitchen_order.refresh_urgency(now);
    Ok(kitchen_order)
}

/// `8 + 2 * units`, clamped to `[MIN_PREP_MINUTES, MAX_PREP_MINUTES]`.
pub fn estimate_prep_time(items: &[OrderItem]) -> u32 {
    let units = items.iter().fold(0u32, |acc, i| acc.saturating_add(i.quantity));
    BASE_PREP_MINUTES
        .saturating_add(units.saturating_mul(PER_UNIT_MINUTES))
        .clamp(MIN_PREP_MINUTES, MAX_PREP_MINUTES)
}

/// Keyword routing of a menu item to a prep station.
pub fn station_for_item(name: &str) -> Station {
    let name = name.to_lowercase();
    let has = |words: &[&str]| words.iter().any(|w| name.contains(w));

    if has(&["coffee", "tea", "chai", "lassi", "juice", "shake", "soda", "cola", "mojito", "water"]) {
        Station::Beverage
    } else if has(&["ice cream", "gulab", "kheer", "cake", "brownie", "halwa", "kulfi", "pastry"]) {
        Station::Dessert
    } else if has(&["tandoori", "naan", "roti", "kulcha", "tikka"]) {
        Station::Tandoor
    } else if has(&["grill", "kebab", "burger", "sandwich", "bbq"]) {
        Station::Grill
    } else if has(&["fries", "pakora", "samosa", "fried", "65", "bhaji"]) {
        Station::Fryer
    } else {
        Station::Main
    }
}

/// Station with the most items; ties go to the first one seen.
fn dominant_station(items: &[KitchenItem]) -> Station {
    let mut counts: Vec<(Station, u32)> = Vec::new();
    for item in items {
        match counts.iter_mut().find(|(s, _)| *s == item.station) {
            Some((_, n)) => *n = n.saturating_add(item.quantity),
            None => counts.push((item.station, item.quantity)),
        }
    }
    let mut best: Option<(Station, u32)> = None;
    for (station, n) in counts {
        if best.map_or(true, |(_, top)| n > top) {
            best = Some((station, n));
        }
    }
    best.map(|(s, _)| s).unwrap_or(Station::Main)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Customer, OrderSource, OrderStatus, Totals};
    use chrono::{Duration, TimeZone};

    fn item(name: &str, quantity: u32) -> OrderItem {
        OrderItem {
            name: name.into(),
            quantity,
            unit_price: 100.0,
            modifiers: vec![],
            special_instructions: None,
        }
    }

    fn order_with(items: Vec<OrderItem>) -> Order {
        let at = Utc.with_ymd_and_hms(2026, 5, 1, 19, 0, 0).unwrap();
        Order {
            order_id: "swiggy_4821".into(),
            order_number: "4821".into(),
            source: OrderSource::Swiggy,
            status: OrderStatus::Pending,
            created_at: at,
            accepted_at: None,
            ready_at: None,
            items,
            totals: Totals::default(),
            customer: Customer {
                name: "Ravi".into(),
                ..Customer::default()
            },
            cancellation_reason: None,
            updated_at: at,
        }
    }

    #[test]
    fn validation_catches_each_defect() {
        let mut o = order_with(vec![]);
        assert_eq!(validate(&o), Err(ValidationError::NoItems));

        o.items = vec![item("Dal", 1), item("  ", 1)];
        assert_eq!(validate(&o), Err(ValidationError::MissingItemName { index: 1 }));

        o.items = vec![item("Dal", 0)];
        assert_eq!(validate(&o), Err(ValidationError::InvalidQuantity { index: 0 }));

        o.items = vec![item("Dal", 1)];
        o.order_number = String::new();
        assert_eq!(validate(&o), Err(ValidationError::MissingOrderNumber));
    }

    #[test]
    fn projection_starts_at_version_one_with_pending_items() {
        let o = order_with(vec![item("Veg Biryani", 1)]);
        let now = o.created_at + Duration::minutes(1);
        let k = project(&o, "kds_1".into(), None, now).unwrap();
        assert_eq!(k.version, 1);
        assert_eq!(k.order_number, "4821");
        assert_eq!(k.customer_name, "Ravi");
        assert!(k.items.iter().all(|i| i.status == KitchenItemStatus::Pending));
        assert_eq!(k.estimated_prep_time, MIN_PREP_MINUTES);
        assert!(!k.is_urgent);
    }

    #[test]
    fn prep_override_wins_over_estimate() {
        let o = order_with(vec![item("Veg Biryani", 1)]);
        let k = project(&o, "kds_1".into(), Some(25), o.created_at).unwrap();
        assert_eq!(k.estimated_prep_time, 25);
        let k = project(&o, "kds_2".into(), Some(0), o.created_at).unwrap();
        assert_eq!(k.estimated_prep_time, MIN_PREP_MINUTES);
    }

    #[test]
    fn estimate_scales_with_units_and_clamps() {
        assert_eq!(estimate_prep_time(&[item("a", 4)]), 16);
        assert_eq!(estimate_prep_time(&[item("a", 100)]), MAX_PREP_MINUTES);
    }

    #[test]
    fn station_follows_item_majority() {
        let o = order_with(vec![
            item("Butter Naan", 3),
            item("Masala Chai", 1),
            item("Paneer Tikka", 1),
        ]);
        let k = project(&o, "kds_3".into(), None, o.created_at).unwrap();
        assert_eq!(k.station, Station::Tandoor);
        assert_eq!(k.items[1].station, Station::Beverage);
    }

    #[test]
    fn huge_quantities_saturate() {
        let o = order_with(vec![item("Veg Biryani", u32::MAX), item("Jeera Rice", u32::MAX)]);
        let k = project(&o, "kds_5".into(), None, o.created_at).unwrap();
        assert_eq!(k.station, Station::Main);
        assert_eq!(k.estimated_prep_time, MAX_PREP_MINUTES);
    }

    #[test]
    fn stale_ticket_is_urgent() {
        let o = order_with(vec![item("Veg Biryani", 1)]);
        let later = o.created_at + Duration::minutes(45);
        let k = project(&o, "kds_4".into(), Some(20), later).unwrap();
        assert!(k.is_urgent);
    }
}
