//! Run-state reconciliation against the backend.

use chrono::Utc;
use sl_backend::SweepBackend;
use sl_types::RunState;
use tracing::{debug, info, warn};

use crate::runs::RunTable;

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    /// Runs found DEAD and dropped from the table.
    pub removed: Vec<String>,
    /// Runs whose status could not be determined this pass.
    pub unknown: Vec<String>,
}

/// Refresh every non-DEAD run from the backend, then drop the DEAD ones.
///
/// A failed lookup or an undocumented status leaves the run UNKNOWN; it
/// stays tracked and is queried again next pass.
pub async fn reconcile(
    backend: &dyn SweepBackend,
    entity: &str,
    project: &str,
    runs: &mut RunTable,
) -> Reconciliation {
    let mut report = Reconciliation::default();

    for run_id in runs.pending_ids() {
        let state = match backend.get_run_state(entity, project, &run_id).await {
            Ok(status) => match RunState::from_remote(&status) {
                Some(state) => state,
                None => {
                    warn!(run_id = %run_id, status = %status, "unrecognized run status");
                    RunState::Unknown
                }
            },
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "failed to fetch run state");
                RunState::Unknown
            }
        };

        if state == RunState::Unknown {
            report.unknown.push(run_id.clone());
        }
        debug!(run_id = %run_id, %state, "reconciled run");
        runs.set_state(&run_id, state);
    }

    for run in runs.remove_dead() {
        let elapsed = Utc::now().signed_duration_since(run.created_at);
        info!(
            run_id = %run.id,
            worker = run.worker_id,
            elapsed_secs = elapsed.num_seconds(),
            "run finished, worker freed"
        );
        report.removed.push(run.id);
    }
    report
}
