use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::orchestrator::Workflow;
use crate::service::WorkflowError;
use crate::store::Store;

/// What one reconciliation pass found and fixed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Seated appointments moved from `confirmed` to `in_progress`.
    pub started: Vec<Ulid>,
    /// Bays released because their appointment was finished or gone.
    pub released: Vec<Ulid>,
    /// `in_progress` appointments with no bay, older than the threshold.
    pub stuck: Vec<Ulid>,
    pub failures: usize,
}

impl SweepReport {
    pub fn healed(&self) -> usize {
        self.started.len() + self.released.len()
    }
}

/// Heal bay/appointment mismatches left by a half-finished two-write
/// operation. Safe to run at any time and any number of times.
pub async fn sweep(workflow: &Workflow, now: Ms, stale_after_ms: i64) -> SweepReport {
    let mut report = SweepReport::default();
    let mut seated = HashSet::new();

    for bay in workflow.bays.all().await {
        let Some(appointment_id) = bay.current_booking else {
            continue;
        };
        seated.insert(appointment_id);

        let appt = workflow.appointments.find(appointment_id).await.ok();
        let status = appt.as_ref().map(|a| a.status);
        match status {
            Some(AppointmentStatus::InProgress) => {}
            Some(AppointmentStatus::Confirmed) => {
                let Some(appt) = appt else { continue };
                match workflow
                    .appointments
                    .transition(&appt, AppointmentStatus::InProgress, None)
                    .await
                {
                    Ok(_) => {
                        metrics::counter!(crate::observability::RECONCILE_HEALS_TOTAL, "action" => "start")
                            .increment(1);
                        info!("reconcile: appointment {appointment_id} seated at bay {} marked in_progress", bay.number);
                        report.started.push(appointment_id);
                    }
                    Err(WorkflowError::ConcurrentUpdate { actual }) => {
                        debug!("reconcile: appointment {appointment_id} moved to {actual} underneath us");
                    }
                    Err(e) => {
                        warn!("reconcile: could not start appointment {appointment_id}: {e}");
                        report.failures += 1;
                    }
                }
            }
            Some(AppointmentStatus::Pending) => {
                warn!(
                    "reconcile: bay {} holds pending appointment {appointment_id}; leaving it for staff",
                    bay.number
                );
            }
            status @ (Some(AppointmentStatus::Completed | AppointmentStatus::Cancelled) | None) => {
                match workflow.bays.vacate_if_held(bay.id, appointment_id, "reconcile").await {
                    Ok(Some(_)) => {
                        metrics::counter!(crate::observability::RECONCILE_HEALS_TOTAL, "action" => "release")
                            .increment(1);
                        let why = status.map_or("missing", |s| s.as_str());
                        info!("reconcile: released bay {} (appointment {appointment_id} {why})", bay.number);
                        report.released.push(bay.id);
                    }
                    Ok(None) => debug!("reconcile: bay {} changed underneath us", bay.number),
                    Err(e) => {
                        warn!("reconcile: could not release bay {}: {e}", bay.number);
                        report.failures += 1;
                    }
                }
            }
        }
    }

    // Reported only: unseated work may be legitimate.
    for appt in workflow.appointments.all().await {
        if appt.status == AppointmentStatus::InProgress
            && !seated.contains(&appt.id)
            && now - appt.updated_at > stale_after_ms
        {
            warn!(
                "appointment {} has been in_progress without a bay since {}",
                appt.id, appt.updated_at
            );
            report.stuck.push(appt.id);
        }
    }
    metrics::gauge!(crate::observability::STUCK_APPOINTMENTS).set(report.stuck.len() as f64);
    report
}

/// Background task that runs the reconciliation sweep on an interval.
pub async fn run_reconciler(
    workflow: Workflow,
    every: Duration,
    stale_after: Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(every);
    let stale_after_ms = stale_after.as_millis() as i64;
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.cancelled() => break,
        }
        let report = sweep(&workflow, now_ms(), stale_after_ms).await;
        if report.healed() > 0 || report.failures > 0 {
            info!(
                "reconcile: {} started, {} released, {} failed, {} stuck",
                report.started.len(),
                report.released.len(),
                report.failures,
                report.stuck.len()
            );
        }
    }
    debug!("reconciler stopped");
}

/// Background task that compacts the WAL once enough appends pile up.
pub async fn run_compactor(store: Arc<Store>, threshold: u64, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.cancelled() => break,
        }
        let appends = store.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        if let Err(e) = store.compact_wal().await {
            tracing::error!("WAL compaction failed after {appends} appends: {e}");
        }
    }
    debug!("compactor stopped");
}
