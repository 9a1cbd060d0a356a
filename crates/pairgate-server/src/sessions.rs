//! Tracking of running pairing sessions.

use std::{sync::Arc, time::Instant};

use tokio::sync::OwnedSemaphorePermit;
use tokio::task::JoinHandle;
use tracing::debug;

use pairgate_core::fault::FaultFilter;
use pairgate_core::{SessionId, SessionReport};

use crate::metrics::PairingMetrics;

/// Running sessions keyed by id, with their start time.
pub type SessionRegistry = Arc<dashmap::DashMap<SessionId, Instant>>;

/// Register a started session and watch its task until it finishes.
///
/// The watcher removes the session from `registry`, folds its report into
/// `metrics`, and passes a panicked or cancelled task to the fault filter.
/// `permit` is held until the session is released.
pub fn supervise(
    registry: &SessionRegistry,
    metrics: &Arc<PairingMetrics>,
    faults: &Arc<FaultFilter>,
    id: SessionId,
    task: JoinHandle<SessionReport>,
    permit: OwnedSemaphorePermit,
) {
    registry.insert(id.clone(), Instant::now());
    metrics.active_sessions.set(registry.len() as f64);

    let registry = Arc::clone(registry);
    let metrics = Arc::clone(metrics);
    let faults = Arc::clone(faults);
    tokio::spawn(async move {
        match task.await {
            Ok(report) => metrics.record_report(&report),
            Err(e) => {
                faults.report(Some(&id), "session task", &e);
                metrics.sessions_failed.inc();
            }
        }

        if let Some((_, started)) = registry.remove(&id) {
            debug!(session_id = %id, lifetime_secs = started.elapsed().as_secs_f64(), "session released");
        }
        metrics.active_sessions.set(registry.len() as f64);
        drop(permit);
    });
}
