//! Background push of the local sync queue to the remote API.
//!
//! Records are pushed in bounded batches. Acceptance is per record: only the
//! accepted subset of a batch is marked synced, and a failed batch is
//! recorded against its rows before the run moves on to the next batch.
//! Runs never overlap; a run requested while one is executing is skipped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{RecordOutcome, RemoteApi};
use crate::db::DbState;
use crate::repository::{self, PendingRecord};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub batches: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub errors: Vec<String>,
}

pub struct ReconciliationJob {
    db: Arc<DbState>,
    api: Arc<dyn RemoteApi>,
    batch_size: usize,
    interval: Duration,
    startup_delay: Duration,
    in_flight: AtomicBool,
    last_run: Mutex<Option<DateTime<Utc>>>,
}

/// Clears the in-flight flag when a run ends, however it ends.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl ReconciliationJob {
    pub fn new(
        db: Arc<DbState>,
        api: Arc<dyn RemoteApi>,
        batch_size: usize,
        interval: Duration,
        startup_delay: Duration,
    ) -> Self {
        Self {
            db,
            api,
            batch_size: batch_size.max(1),
            interval,
            startup_delay,
            in_flight: AtomicBool::new(false),
            last_run: Mutex::new(None),
        }
    }

    pub fn last_run(&self) -> Option<DateTime<Utc>> {
        self.last_run.lock().ok().and_then(|g| *g)
    }

    /// One pass over the queue. `None` when another run is in flight.
    pub async fn run_once(&self) -> Option<ReconcileReport> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Reconciliation already running, skipped");
            return None;
        }
        let _guard = RunGuard(&self.in_flight);

        let mut report = ReconcileReport::default();
        let mut after_id = 0;
        loop {
            let batch = match self.fetch(after_id) {
                Ok(batch) => batch,
                Err(e) => {
                    warn!("Reconciliation could not read the sync queue: {e}");
                    report.errors.push(e);
                    break;
                }
            };
            let Some(last) = batch.last() else {
                break;
            };
            after_id = last.id;
            report.batches += 1;

            match self.api.push_batch(&batch).await {
                Ok(outcomes) => self.apply_outcomes(&batch, outcomes, &mut report),
                Err(e) => {
                    warn!(records = batch.len(), error = %e, "Reconciliation batch failed");
                    let message = e.to_string();
                    self.record_failures(&batch, &message, !e.is_backpressure());
                    report.errors.push(message);
                }
            }
        }

        if let Ok(mut last_run) = self.last_run.lock() {
            *last_run = Some(Utc::now());
        }
        if report.accepted > 0 || !report.errors.is_empty() {
            info!(
                batches = report.batches,
                accepted = report.accepted,
                rejected = report.rejected,
                errors = report.errors.len(),
                "Reconciliation run complete"
            );
        }
        Some(report)
    }

    fn fetch(&self, after_id: i64) -> Result<Vec<PendingRecord>, String> {
        let conn = self.db.lock().map_err(|e| e.to_string())?;
        repository::fetch_pending_batch(&conn, after_id, self.batch_size).map_err(|e| e.to_string())
    }

    fn apply_outcomes(&self, batch: &[PendingRecord], outcomes: Vec<RecordOutcome>, report: &mut ReconcileReport) {
        let by_key: HashMap<String, RecordOutcome> = outcomes
            .into_iter()
            .map(|o| (o.idempotency_key.clone(), o))
            .collect();
        let conn = match self.db.lock() {
            Ok(conn) => conn,
            Err(e) => {
                report.errors.push(e.to_string());
                return;
            }
        };

        for record in batch {
            let result = match by_key.get(&record.idempotency_key) {
                Some(outcome) if outcome.accepted => {
                    report.accepted += 1;
                    repository::mark_synced(&conn, record).map(|_| ())
                }
                Some(outcome) => {
                    let reason = outcome.error.as_deref().unwrap_or("rejected by remote");
                    warn!(key = %record.idempotency_key, %reason, "Record rejected");
                    report.rejected += 1;
                    report.errors.push(format!("{}: {reason}", record.idempotency_key));
                    repository::mark_failed(&conn, record, reason, true)
                }
                None => {
                    report.rejected += 1;
                    repository::mark_failed(&conn, record, "not acknowledged by remote", true)
                }
            };
            if let Err(e) = result {
                report.errors.push(e.to_string());
            }
        }
    }

    fn record_failures(&self, batch: &[PendingRecord], message: &str, count_retry: bool) {
        let Ok(conn) = self.db.lock() else {
            return;
        };
        for record in batch {
            if let Err(e) = repository::mark_failed(&conn, record, message, count_retry) {
                warn!(key = %record.idempotency_key, "Failed to record push error: {e}");
            }
        }
    }

    /// One delayed run after startup, then every `interval` until `cancel`.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                interval_secs = self.interval.as_secs(),
                delay_secs = self.startup_delay.as_secs(),
                "Reconciliation started"
            );
            let mut wait = self.startup_delay;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
                self.run_once().await;
                wait = self.interval;
            }
            info!("Reconciliation stopped");
        })
    }
}
