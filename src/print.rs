//! Kitchen ticket spooler.
//!
//! `print` only enqueues a rendered plain-text ticket into `print_jobs`, so
//! the orchestrator never waits on hardware. A background worker drains the
//! queue and writes each ticket to the spool directory, where the site's
//! printer bridge picks it up. While a job for a ticket is still pending a
//! second `print` returns the existing job.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db::DbState;
use crate::models::KitchenOrder;
use crate::sinks::PrinterSink;

/// Directory under the data dir the worker writes tickets to.
pub const SPOOL_DIR: &str = "spool";
/// Attempts before a job is parked as `failed`.
const MAX_ATTEMPTS: i64 = 3;
const TICKET_WIDTH: usize = 32;

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

/// Plain-text ticket for a 58mm roll.
pub fn render_ticket(ticket: &KitchenOrder) -> String {
    let rule = "-".repeat(TICKET_WIDTH);
    let mut out = String::new();
    out.push_str(&format!("ORDER #{}\n", ticket.order_number));
    out.push_str(&format!("{} | {}\n", ticket.source.as_str().to_uppercase(), ticket.station));
    if !ticket.customer_name.is_empty() {
        out.push_str(&format!("{}\n", ticket.customer_name));
    }
    out.push_str(&format!("Prep: {} min{}\n", ticket.estimated_prep_time, if ticket.is_urgent { "  ** URGENT **" } else { "" }));
    out.push_str(&rule);
    out.push('\n');
    for item in &ticket.items {
        out.push_str(&format!("{:>2} x {}\n", item.quantity, item.name));
        for modifier in &item.modifiers {
            out.push_str(&format!("     + {modifier}\n"));
        }
        if let Some(note) = &item.special_instructions {
            out.push_str(&format!("     ! {note}\n"));
        }
    }
    out.push_str(&rule);
    out.push('\n');
    out.push_str(&format!("{}\n", ticket.updated_at.format("%Y-%m-%d %H:%M")));
    out
}

// ---------------------------------------------------------------------------
// Enqueue
// ---------------------------------------------------------------------------

/// Enqueue a ticket. Returns the job id; an existing pending job for the
/// same kitchen order is returned instead of creating a duplicate.
pub fn enqueue_ticket(db: &DbState, ticket: &KitchenOrder) -> Result<String, String> {
    let conn = db.lock().map_err(|e| e.to_string())?;

    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM print_jobs WHERE kitchen_order_id = ?1 AND status = 'pending'",
            params![ticket.id],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| format!("lookup print job: {e}"))?;
    if let Some(job_id) = existing {
        info!(%job_id, kitchen_order_id = %ticket.id, "Print job already queued");
        return Ok(job_id);
    }

    let job_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO print_jobs (id, kitchen_order_id, order_number, body, status, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?5)",
        params![job_id, ticket.id, ticket.order_number, render_ticket(ticket), now],
    )
    .map_err(|e| format!("enqueue print job: {e}"))?;

    info!(%job_id, kitchen_order_id = %ticket.id, "Print job enqueued");
    Ok(job_id)
}

/// `PrinterSink` backed by the spool table.
pub struct PrintSpooler {
    db: Arc<DbState>,
}

impl PrintSpooler {
    pub fn new(db: Arc<DbState>) -> Self {
        Self { db }
    }
}

impl PrinterSink for PrintSpooler {
    fn print(&self, kitchen_order: &KitchenOrder) -> Result<(), String> {
        enqueue_ticket(&self.db, kitchen_order).map(|_| ())
    }
}

// ---------------------------------------------------------------------------
// Status updates
// ---------------------------------------------------------------------------

fn mark_printed(db: &DbState, job_id: &str) -> Result<(), String> {
    let conn = db.lock().map_err(|e| e.to_string())?;
    conn.execute(
        "UPDATE print_jobs SET status = 'printed', attempts = attempts + 1, last_error = NULL,
                updated_at = ?1
         WHERE id = ?2",
        params![Utc::now().to_rfc3339(), job_id],
    )
    .map_err(|e| format!("mark printed: {e}"))?;
    Ok(())
}

/// Count the attempt; park the job as `failed` once attempts run out.
fn mark_failed(db: &DbState, job_id: &str, error_msg: &str) -> Result<(), String> {
    let conn = db.lock().map_err(|e| e.to_string())?;
    conn.execute(
        "UPDATE print_jobs SET attempts = attempts + 1, last_error = ?1, updated_at = ?2,
                status = CASE WHEN attempts + 1 >= ?3 THEN 'failed' ELSE 'pending' END
         WHERE id = ?4",
        params![error_msg, Utc::now().to_rfc3339(), MAX_ATTEMPTS, job_id],
    )
    .map_err(|e| format!("mark failed: {e}"))?;
    warn!(%job_id, error = %error_msg, "Print job failed");
    Ok(())
}

// ---------------------------------------------------------------------------
// Background worker
// ---------------------------------------------------------------------------

fn write_ticket(spool_dir: &Path, job_id: &str, kitchen_order_id: &str, body: &str) -> Result<PathBuf, String> {
    fs::create_dir_all(spool_dir).map_err(|e| format!("create spool dir: {e}"))?;
    let path = spool_dir.join(format!("{kitchen_order_id}-{job_id}.txt"));
    fs::write(&path, body).map_err(|e| format!("write ticket: {e}"))?;
    Ok(path)
}

/// Drain one batch of pending jobs into the spool directory. Returns the
/// number of jobs attempted.
pub fn process_pending_jobs(db: &DbState, spool_dir: &Path) -> Result<usize, String> {
    let jobs: Vec<(String, String, String)> = {
        let conn = db.lock().map_err(|e| e.to_string())?;
        let mut stmt = conn
            .prepare(
                "SELECT id, kitchen_order_id, body FROM print_jobs
                 WHERE status = 'pending'
                 ORDER BY created_at ASC
                 LIMIT 10",
            )
            .map_err(|e| e.to_string())?;
        let jobs = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .map_err(|e| e.to_string())?
            .filter_map(|r| r.ok())
            .collect();
        jobs
    };

    let count = jobs.len();
    for (job_id, kitchen_order_id, body) in jobs {
        match write_ticket(spool_dir, &job_id, &kitchen_order_id, &body) {
            Ok(path) => {
                mark_printed(db, &job_id)?;
                info!(%job_id, path = %path.display(), "Ticket spooled");
            }
            Err(e) => mark_failed(db, &job_id, &e)?,
        }
    }
    Ok(count)
}

/// Run the spool worker until `cancel` fires.
pub fn start_print_worker(
    db: Arc<DbState>,
    spool_dir: PathBuf,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    info!(interval_secs = interval.as_secs(), "Print worker started");
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            if let Err(e) = process_pending_jobs(&db, &spool_dir) {
                error!("Print worker error: {e}");
            }
        }
        info!("Print worker stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::models::{KitchenItem, KitchenItemStatus, OrderSource, Station};

    fn ticket() -> KitchenOrder {
        let now = Utc::now();
        KitchenOrder {
            id: "kds_1".into(),
            order_id: "zomato_77".into(),
            order_number: "77".into(),
            source: OrderSource::Zomato,
            customer_name: "Meera".into(),
            items: vec![KitchenItem {
                name: "Paneer Tikka".into(),
                quantity: 2,
                modifiers: vec!["extra mint".into()],
                special_instructions: Some("no onion".into()),
                station: Station::Tandoor,
                status: KitchenItemStatus::Pending,
            }],
            station: Station::Tandoor,
            estimated_prep_time: 12,
            is_urgent: false,
            version: 1,
            created_at: now,
            updated_at: now,
            archived: false,
        }
    }

    fn job_status(db: &DbState, job_id: &str) -> (String, i64) {
        let conn = db.lock().unwrap();
        conn.query_row(
            "SELECT status, attempts FROM print_jobs WHERE id = ?1",
            params![job_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .unwrap()
    }

    #[test]
    fn renders_items_and_notes() {
        let body = render_ticket(&ticket());
        assert!(body.starts_with("ORDER #77\n"));
        assert!(body.contains("ZOMATO | tandoor"));
        assert!(body.contains(" 2 x Paneer Tikka"));
        assert!(body.contains("+ extra mint"));
        assert!(body.contains("! no onion"));
    }

    #[test]
    fn pending_job_is_reused() {
        let db = db::test_state();
        let first = enqueue_ticket(&db, &ticket()).unwrap();
        let second = enqueue_ticket(&db, &ticket()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn worker_spools_and_marks_printed() {
        let db = Arc::new(db::test_state());
        let dir = tempfile::tempdir().unwrap();
        let spooler = PrintSpooler::new(db.clone());
        spooler.print(&ticket()).unwrap();

        let job_id = enqueue_ticket(&db, &ticket()).unwrap();
        assert_eq!(process_pending_jobs(&db, dir.path()).unwrap(), 1);
        assert_eq!(job_status(&db, &job_id), ("printed".to_string(), 1));

        let written = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(written, 1);
        assert_eq!(process_pending_jobs(&db, dir.path()).unwrap(), 0);

        // A printed ticket can be queued again (reprint).
        let reprint = enqueue_ticket(&db, &ticket()).unwrap();
        assert_ne!(reprint, job_id);
    }

    #[test]
    fn failures_park_after_max_attempts() {
        let db = db::test_state();
        let dir = tempfile::tempdir().unwrap();
        // A file where the spool directory should be makes every write fail.
        let blocked = dir.path().join("spool");
        fs::write(&blocked, b"").unwrap();

        let job_id = enqueue_ticket(&db, &ticket()).unwrap();
        for _ in 0..MAX_ATTEMPTS {
            process_pending_jobs(&db, &blocked).unwrap();
        }
        assert_eq!(job_status(&db, &job_id), ("failed".to_string(), MAX_ATTEMPTS));
        assert_eq!(process_pending_jobs(&db, &blocked).unwrap(), 0);
    }
}
