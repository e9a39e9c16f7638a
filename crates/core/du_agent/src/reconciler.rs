//! Startup reconciliation: after a reboot or agent restart, decide whether
//! the pending deployment recorded in the snapshot actually completed.

use crate::executor::Phase;
use crate::executor::StepExecutor;
use crate::state_repository::state::WorkflowSnapshot;
use du_api::update_id::UpdateId;
use du_api::DesiredAction;
use du_api::WorkflowHandle;
use du_api::WorkflowState;
use tracing::info;
use tracing::warn;

#[derive(Debug, PartialEq)]
pub enum ReconcileOutcome {
    /// Every step of every component reports the update as installed: the
    /// deployment completed across the restart.
    AlreadyInstalled { update_id: UpdateId },

    /// The deployment did not complete; rerun it from this phase.
    Resume { phase: Phase },

    /// The control plane cancelled while the device was away.
    Cancelled,
}

/// Decide what to do with a redelivered envelope whose workflow id matches
/// the persisted snapshot.
pub async fn reconcile(
    executor: &StepExecutor,
    workflow: &mut WorkflowHandle,
    snapshot: &WorkflowSnapshot,
) -> ReconcileOutcome {
    if workflow.action == DesiredAction::Cancel {
        return ReconcileOutcome::Cancelled;
    }

    match executor.check_installed(workflow).await {
        Ok(true) => {
            info!(
                "Workflow {} completed across the restart",
                snapshot.workflow_id
            );
            let update_id = snapshot
                .expected_update_id
                .clone()
                .unwrap_or_else(|| workflow.manifest.update_id.clone());
            ReconcileOutcome::AlreadyInstalled { update_id }
        }
        Ok(false) => {
            let phase = resume_phase(snapshot.current_step);
            info!(
                "Workflow {} did not complete across the restart, rerunning from {phase}",
                snapshot.workflow_id
            );
            ReconcileOutcome::Resume { phase }
        }
        Err(failure) => {
            warn!(
                "Could not probe the installed state of workflow {}: {:?}",
                snapshot.workflow_id, failure.details
            );
            ReconcileOutcome::Resume {
                phase: resume_phase(snapshot.current_step),
            }
        }
    }
}

/// The phase to rerun given the last state reached before the restart.
fn resume_phase(recorded: WorkflowState) -> Phase {
    match recorded {
        WorkflowState::DownloadSucceeded | WorkflowState::InstallStarted => Phase::Install,
        WorkflowState::InstallSucceeded | WorkflowState::ApplyStarted => Phase::Apply,
        _ => Phase::Download,
    }
}
