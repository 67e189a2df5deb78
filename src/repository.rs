//! SQLite-backed order persistence, sales ledger and sync queue.
//!
//! Every durable order write also coalesces a row into `sync_queue` so the
//! reconciliation job can push it later. The queue keeps one row per entity
//! (`{entity_type}:{entity_id}` idempotency key); a newer write replaces the
//! payload, bumps `revision` and re-pends the row.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use crate::db::DbState;
use crate::error::PersistenceError;
use crate::models::{KitchenOrder, Order, OrderMapping};
use crate::sinks::{ActiveState, LedgerSink, OrderPersistence};

/// Dedupe seed size loaded on start.
const RECENT_ORDER_IDS: usize = 1000;

fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, PersistenceError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| PersistenceError::Other(format!("bad timestamp {raw:?}: {e}")))
}

fn to_json<T: Serialize>(entity: &'static str, value: &T) -> Result<String, PersistenceError> {
    serde_json::to_string(value).map_err(|source| PersistenceError::Serialize { entity, source })
}

fn from_json<T: DeserializeOwned>(entity: &'static str, raw: &str) -> Result<T, PersistenceError> {
    serde_json::from_str(raw).map_err(|source| PersistenceError::Serialize { entity, source })
}

/// Parse a bare enum tag (`"in-progress"`) with its serde representation.
fn parse_tag<T: DeserializeOwned>(entity: &'static str, raw: &str) -> Result<T, PersistenceError> {
    serde_json::from_value(serde_json::Value::String(raw.to_string()))
        .map_err(|source| PersistenceError::Serialize { entity, source })
}

// ---------------------------------------------------------------------------
// Sync queue
// ---------------------------------------------------------------------------

/// A queued record awaiting push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRecord {
    pub id: i64,
    pub entity_type: String,
    pub entity_id: String,
    pub payload: String,
    pub idempotency_key: String,
    pub revision: i64,
    pub retry_count: i64,
}

/// Coalesce the latest payload for an entity into the queue.
pub fn enqueue(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
    payload: &str,
) -> Result<(), PersistenceError> {
    let key = format!("{entity_type}:{entity_id}");
    conn.execute(
        "INSERT INTO sync_queue (entity_type, entity_id, payload, idempotency_key)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(idempotency_key) DO UPDATE SET
            payload = excluded.payload,
            revision = sync_queue.revision + 1,
            status = 'pending',
            retry_count = 0,
            last_error = NULL,
            synced_at = NULL,
            updated_at = datetime('now')",
        params![entity_type, entity_id, payload, key],
    )?;
    Ok(())
}

/// Pending rows with `id > after_id`, oldest first.
pub fn fetch_pending_batch(
    conn: &Connection,
    after_id: i64,
    limit: usize,
) -> Result<Vec<PendingRecord>, PersistenceError> {
    let mut stmt = conn.prepare(
        "SELECT id, entity_type, entity_id, payload, idempotency_key, revision, retry_count
         FROM sync_queue
         WHERE status = 'pending' AND id > ?1
         ORDER BY id ASC
         LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![after_id, limit as i64], |row| {
        Ok(PendingRecord {
            id: row.get(0)?,
            entity_type: row.get(1)?,
            entity_id: row.get(2)?,
            payload: row.get(3)?,
            idempotency_key: row.get(4)?,
            revision: row.get(5)?,
            retry_count: row.get(6)?,
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Mark a pushed row synced. A row rewritten since it was fetched stays
/// pending (returns false) so the newer payload is pushed next run.
pub fn mark_synced(conn: &Connection, record: &PendingRecord) -> Result<bool, PersistenceError> {
    let changed = conn.execute(
        "UPDATE sync_queue
         SET status = 'synced', synced_at = datetime('now'), last_error = NULL,
             updated_at = datetime('now')
         WHERE id = ?1 AND revision = ?2",
        params![record.id, record.revision],
    )?;
    Ok(changed > 0)
}

/// Record a failed push; the row stays pending for the next run.
pub fn mark_failed(
    conn: &Connection,
    record: &PendingRecord,
    error: &str,
    count_retry: bool,
) -> Result<(), PersistenceError> {
    conn.execute(
        "UPDATE sync_queue
         SET retry_count = retry_count + ?1, last_error = ?2, updated_at = datetime('now')
         WHERE id = ?3 AND revision = ?4",
        params![i64::from(count_retry), error, record.id, record.revision],
    )?;
    Ok(())
}

pub fn pending_count(conn: &Connection) -> Result<i64, PersistenceError> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM sync_queue WHERE status = 'pending'",
        [],
        |row| row.get(0),
    )?)
}

// ---------------------------------------------------------------------------
// Repository
// ---------------------------------------------------------------------------

/// SQLite implementation of the orchestrator's persistence and ledger.
#[derive(Clone)]
pub struct SqliteRepository {
    db: Arc<DbState>,
}

struct RawMapping {
    external_order_id: String,
    order_number: String,
    kitchen_order_id: Option<String>,
    source: String,
    current_status: String,
    kitchen_status: Option<String>,
    created_at: String,
    accepted_at: Option<String>,
    ready_at: Option<String>,
}

impl RawMapping {
    fn into_mapping(self) -> Result<OrderMapping, PersistenceError> {
        Ok(OrderMapping {
            external_order_id: self.external_order_id,
            order_number: self.order_number,
            kitchen_order_id: self.kitchen_order_id,
            source: parse_tag("order_mapping.source", &self.source)?,
            current_status: parse_tag("order_mapping.current_status", &self.current_status)?,
            kitchen_status: self
                .kitchen_status
                .as_deref()
                .map(|s| parse_tag("order_mapping.kitchen_status", s))
                .transpose()?,
            created_at: parse_ts(&self.created_at)?,
            accepted_at: self.accepted_at.as_deref().map(parse_ts).transpose()?,
            ready_at: self.ready_at.as_deref().map(parse_ts).transpose()?,
        })
    }
}

impl SqliteRepository {
    pub fn new(db: Arc<DbState>) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &Arc<DbState> {
        &self.db
    }

    pub fn load_order(&self, order_id: &str) -> Result<Option<Order>, PersistenceError> {
        let conn = self.db.lock()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT data FROM orders WHERE id = ?1",
                params![order_id],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|r| from_json("order", &r)).transpose()
    }

    pub fn load_kitchen_order(&self, kitchen_order_id: &str) -> Result<Option<KitchenOrder>, PersistenceError> {
        let conn = self.db.lock()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT data FROM kitchen_orders WHERE id = ?1",
                params![kitchen_order_id],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|r| from_json("kitchen_order", &r)).transpose()
    }
}

impl OrderPersistence for SqliteRepository {
    fn save_order(&self, order: &Order) -> Result<(), PersistenceError> {
        let data = to_json("order", order)?;
        let conn = self.db.lock()?;
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO orders (id, order_number, source, status, data, grand_total,
                                 created_at, accepted_at, ready_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO UPDATE SET
                order_number = excluded.order_number,
                status = excluded.status,
                data = excluded.data,
                grand_total = excluded.grand_total,
                accepted_at = excluded.accepted_at,
                ready_at = excluded.ready_at,
                updated_at = excluded.updated_at",
            params![
                order.order_id,
                order.order_number,
                order.source.as_str(),
                order.status.as_str(),
                data,
                order.totals.grand_total,
                ts(order.created_at),
                order.accepted_at.map(ts),
                order.ready_at.map(ts),
                ts(order.updated_at),
            ],
        )?;
        enqueue(&tx, "order", &order.order_id, &data)?;
        tx.commit()?;
        debug!(order_id = %order.order_id, status = %order.status, "Order persisted");
        Ok(())
    }

    fn save_mapping(&self, mapping: &OrderMapping) -> Result<(), PersistenceError> {
        let conn = self.db.lock()?;
        conn.execute(
            "INSERT INTO order_mappings (external_order_id, order_number, kitchen_order_id, source,
                                         current_status, kitchen_status, created_at, accepted_at, ready_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(external_order_id) DO UPDATE SET
                order_number = excluded.order_number,
                kitchen_order_id = COALESCE(order_mappings.kitchen_order_id, excluded.kitchen_order_id),
                current_status = excluded.current_status,
                kitchen_status = excluded.kitchen_status,
                accepted_at = excluded.accepted_at,
                ready_at = excluded.ready_at",
            params![
                mapping.external_order_id,
                mapping.order_number,
                mapping.kitchen_order_id,
                mapping.source.as_str(),
                mapping.current_status.as_str(),
                mapping.kitchen_status.map(|s| s.as_str()),
                ts(mapping.created_at),
                mapping.accepted_at.map(ts),
                mapping.ready_at.map(ts),
            ],
        )?;
        Ok(())
    }

    fn save_kitchen_order(&self, kitchen_order: &KitchenOrder) -> Result<(), PersistenceError> {
        let data = to_json("kitchen_order", kitchen_order)?;
        let conn = self.db.lock()?;
        conn.execute(
            "INSERT INTO kitchen_orders (id, order_id, version, archived, data, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                version = excluded.version,
                archived = excluded.archived,
                data = excluded.data,
                updated_at = excluded.updated_at
             WHERE excluded.version >= kitchen_orders.version",
            params![
                kitchen_order.id,
                kitchen_order.order_id,
                kitchen_order.version as i64,
                kitchen_order.archived,
                data,
                ts(kitchen_order.updated_at),
            ],
        )?;
        Ok(())
    }

    fn load_active(&self) -> Result<ActiveState, PersistenceError> {
        let conn = self.db.lock()?;

        let orders: Vec<Order> = {
            let mut stmt = conn.prepare(
                "SELECT data FROM orders
                 WHERE status NOT IN ('completed', 'cancelled')
                 ORDER BY created_at ASC",
            )?;
            let raw = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            raw.iter()
                .map(|r| from_json("order", r))
                .collect::<Result<_, _>>()?
        };

        let mappings: Vec<OrderMapping> = {
            let mut stmt = conn.prepare(
                "SELECT external_order_id, order_number, kitchen_order_id, source, current_status,
                        kitchen_status, created_at, accepted_at, ready_at
                 FROM order_mappings
                 WHERE current_status NOT IN ('completed', 'cancelled')",
            )?;
            let raw = stmt
                .query_map([], |row| {
                    Ok(RawMapping {
                        external_order_id: row.get(0)?,
                        order_number: row.get(1)?,
                        kitchen_order_id: row.get(2)?,
                        source: row.get(3)?,
                        current_status: row.get(4)?,
                        kitchen_status: row.get(5)?,
                        created_at: row.get(6)?,
                        accepted_at: row.get(7)?,
                        ready_at: row.get(8)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            raw.into_iter()
                .map(RawMapping::into_mapping)
                .collect::<Result<_, _>>()?
        };

        let kitchen_orders: Vec<KitchenOrder> = {
            let mut stmt = conn.prepare("SELECT data FROM kitchen_orders WHERE archived = 0")?;
            let raw = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            raw.iter()
                .map(|r| from_json("kitchen_order", r))
                .collect::<Result<_, _>>()?
        };

        let recent_order_ids: Vec<String> = {
            let mut stmt = conn.prepare(
                "SELECT id FROM (SELECT id, created_at FROM orders ORDER BY created_at DESC LIMIT ?1)
                 ORDER BY created_at ASC",
            )?;
            let ids = stmt
                .query_map(params![RECENT_ORDER_IDS as i64], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?;
            ids
        };

        info!(
            orders = orders.len(),
            mappings = mappings.len(),
            kitchen_orders = kitchen_orders.len(),
            "Loaded active state"
        );

        Ok(ActiveState {
            orders,
            mappings,
            kitchen_orders,
            recent_order_ids,
        })
    }
}

impl LedgerSink for SqliteRepository {
    fn has_sale(&self, order_id: &str) -> Result<bool, String> {
        let conn = self.db.lock().map_err(|e| e.to_string())?;
        conn.query_row(
            "SELECT COUNT(*) FROM sales_transactions WHERE order_id = ?1",
            params![order_id],
            |row| row.get::<_, i64>(0),
        )
        .map(|n| n > 0)
        .map_err(|e| format!("has_sale: {e}"))
    }

    fn record_sale(&self, tenant_id: &str, order: &Order) -> Result<(), String> {
        let conn = self.db.lock().map_err(|e| e.to_string())?;
        let id = format!("sale_{}", uuid::Uuid::new_v4());
        let recorded_at = ts(Utc::now());
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| format!("record_sale: {e}"))?;
        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO sales_transactions
                    (id, order_id, tenant_id, order_number, source, subtotal, tax, fees, discount,
                     grand_total, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    id,
                    order.order_id,
                    tenant_id,
                    order.order_number,
                    order.source.as_str(),
                    order.totals.subtotal,
                    order.totals.tax,
                    order.totals.fees,
                    order.totals.discount,
                    order.totals.grand_total,
                    recorded_at,
                ],
            )
            .map_err(|e| format!("record_sale: {e}"))?;

        if inserted > 0 {
            let payload = serde_json::json!({
                "id": id,
                "orderId": order.order_id,
                "tenantId": tenant_id,
                "orderNumber": order.order_number,
                "source": order.source.as_str(),
                "totals": order.totals,
                "recordedAt": recorded_at,
            });
            enqueue(&tx, "sale", &order.order_id, &payload.to_string())
                .map_err(|e| format!("record_sale: {e}"))?;
        }
        tx.commit().map_err(|e| format!("record_sale: {e}"))?;

        if inserted > 0 {
            info!(order_id = %order.order_id, total = order.totals.grand_total, "Sale recorded");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::models::{
        Customer, KitchenItemStatus, OrderItem, OrderSource, OrderStatus, Station, Totals,
    };
    use chrono::{Duration, TimeZone};

    fn repo() -> SqliteRepository {
        SqliteRepository::new(Arc::new(db::test_state()))
    }

    fn order(id: &str, status: OrderStatus) -> Order {
        let at = Utc.with_ymd_and_hms(2026, 2, 1, 12, 0, 0).unwrap();
        Order {
            order_id: id.into(),
            order_number: id.trim_start_matches("swiggy_").into(),
            source: OrderSource::Swiggy,
            status,
            created_at: at,
            accepted_at: None,
            ready_at: None,
            items: vec![OrderItem {
                name: "Veg Biryani".into(),
                quantity: 1,
                unit_price: 220.0,
                modifiers: vec![],
                special_instructions: None,
            }],
            totals: Totals {
                subtotal: 220.0,
                grand_total: 220.0,
                ..Totals::default()
            },
            customer: Customer::default(),
            cancellation_reason: None,
            updated_at: at,
        }
    }

    fn kitchen(id: &str, order_id: &str, version: u64) -> KitchenOrder {
        let at = Utc.with_ymd_and_hms(2026, 2, 1, 12, 0, 0).unwrap();
        KitchenOrder {
            id: id.into(),
            order_id: order_id.into(),
            order_number: "1".into(),
            source: OrderSource::Swiggy,
            customer_name: String::new(),
            items: vec![crate::models::KitchenItem {
                name: "Veg Biryani".into(),
                quantity: 1,
                modifiers: vec![],
                special_instructions: None,
                station: Station::Main,
                status: KitchenItemStatus::Pending,
            }],
            station: Station::Main,
            estimated_prep_time: 15,
            is_urgent: false,
            version,
            created_at: at,
            updated_at: at + Duration::seconds(version as i64),
            archived: false,
        }
    }

    #[test]
    fn order_save_coalesces_queue_rows() {
        let repo = repo();
        let mut o = order("swiggy_1", OrderStatus::Pending);
        repo.save_order(&o).unwrap();
        o.status = OrderStatus::Confirmed;
        repo.save_order(&o).unwrap();

        let conn = repo.db().lock().unwrap();
        let batch = fetch_pending_batch(&conn, 0, 50).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].idempotency_key, "order:swiggy_1");
        assert_eq!(batch[0].revision, 2);
        assert!(batch[0].payload.contains("\"confirmed\""));
    }

    #[test]
    fn rewritten_row_survives_stale_ack() {
        let repo = repo();
        let mut o = order("swiggy_2", OrderStatus::Pending);
        repo.save_order(&o).unwrap();
        let fetched = {
            let conn = repo.db().lock().unwrap();
            fetch_pending_batch(&conn, 0, 10).unwrap().remove(0)
        };

        o.status = OrderStatus::Confirmed;
        repo.save_order(&o).unwrap();

        let conn = repo.db().lock().unwrap();
        assert!(!mark_synced(&conn, &fetched).unwrap());
        assert_eq!(pending_count(&conn).unwrap(), 1);

        let fresh = fetch_pending_batch(&conn, 0, 10).unwrap().remove(0);
        assert!(mark_synced(&conn, &fresh).unwrap());
        assert_eq!(pending_count(&conn).unwrap(), 0);
    }

    #[test]
    fn mark_failed_counts_retries_unless_deferred() {
        let repo = repo();
        repo.save_order(&order("swiggy_3", OrderStatus::Pending)).unwrap();
        let conn = repo.db().lock().unwrap();
        let rec = fetch_pending_batch(&conn, 0, 10).unwrap().remove(0);
        mark_failed(&conn, &rec, "boom", true).unwrap();
        mark_failed(&conn, &rec, "slow down", false).unwrap();
        let rec = fetch_pending_batch(&conn, 0, 10).unwrap().remove(0);
        assert_eq!(rec.retry_count, 1);
    }

    #[test]
    fn load_active_skips_terminal_and_archived() {
        let repo = repo();
        let live = order("swiggy_10", OrderStatus::Confirmed);
        let done = order("swiggy_11", OrderStatus::Completed);
        repo.save_order(&live).unwrap();
        repo.save_order(&done).unwrap();

        let mut m = OrderMapping::for_order(&live);
        m.kitchen_order_id = Some("kds_10".into());
        m.kitchen_status = Some(KitchenItemStatus::InProgress);
        repo.save_mapping(&m).unwrap();
        repo.save_mapping(&OrderMapping::for_order(&done)).unwrap();

        repo.save_kitchen_order(&kitchen("kds_10", "swiggy_10", 1)).unwrap();
        let mut archived = kitchen("kds_11", "swiggy_11", 3);
        archived.archived = true;
        repo.save_kitchen_order(&archived).unwrap();

        let state = repo.load_active().unwrap();
        assert_eq!(state.orders.len(), 1);
        assert_eq!(state.orders[0].order_id, "swiggy_10");
        assert_eq!(state.mappings, vec![m]);
        assert_eq!(state.kitchen_orders.len(), 1);
        assert_eq!(state.recent_order_ids.len(), 2);
    }

    #[test]
    fn kitchen_order_never_regresses_version() {
        let repo = repo();
        repo.save_kitchen_order(&kitchen("kds_1", "o1", 3)).unwrap();
        repo.save_kitchen_order(&kitchen("kds_1", "o1", 2)).unwrap();
        let stored = repo.load_kitchen_order("kds_1").unwrap().unwrap();
        assert_eq!(stored.version, 3);
    }

    #[test]
    fn sale_is_recorded_once() {
        let repo = repo();
        let o = order("swiggy_20", OrderStatus::PendingPickup);
        assert!(!repo.has_sale("swiggy_20").unwrap());
        repo.record_sale("tenant-1", &o).unwrap();
        repo.record_sale("tenant-1", &o).unwrap();
        assert!(repo.has_sale("swiggy_20").unwrap());

        let conn = repo.db().lock().unwrap();
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM sales_transactions", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 1);
        let queued: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sync_queue WHERE idempotency_key = 'sale:swiggy_20'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(queued, 1);
    }
}
