//! The outermost state machine of the agent.
//!
//! One driver loop consumes desired-property updates from the transport and
//! work completions from the phase tasks it spawns. At most one workflow is
//! active; at most one phase of it is in flight. Phase work owns the
//! workflow tree while it runs and posts it back with the completion
//! message, so no state is shared across the suspension points.

use crate::config::DeviceProperties;
use crate::downloader::ContentDownloader;
use crate::enumerator::ComponentEnumerator;
use crate::error::AgentError;
use crate::executor::Phase;
use crate::executor::StepExecutor;
use crate::reconciler;
use crate::reconciler::ReconcileOutcome;
use crate::registry::HandlerRegistry;
use crate::reporter::Reporter;
use crate::restart::RestartOps;
use crate::sandbox::Sandbox;
use crate::state_repository::state::StateRepository;
use crate::state_repository::state::WorkflowSnapshot;
use crate::transport::DesiredUpdate;
use crate::transport::PropertyTransport;
use camino::Utf8PathBuf;
use du_api::jws;
use du_api::jws::RootKeyStore;
use du_api::result::extended_code;
use du_api::update_id::UpdateId;
use du_api::workflow::AgentRestartState;
use du_api::workflow::SystemRebootState;
use du_api::CancelToken;
use du_api::DesiredAction;
use du_api::UpdateActionEnvelope;
use du_api::UpdateResult;
use du_api::WorkflowHandle;
use du_api::WorkflowState;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

/// Completion of a dispatched phase, posted back by the phase task.
#[derive(Debug)]
pub struct WorkCompletion {
    pub workflow_id: String,
    pub phase: Phase,
    /// The workflow tree the task owned; `None` if the task crashed.
    pub workflow: Option<WorkflowHandle>,
    pub result: UpdateResult,
}

struct ActiveDeployment {
    envelope: UpdateActionEnvelope,
    /// Taken by the phase task while an operation is in flight.
    workflow: Option<WorkflowHandle>,
    cancel: CancelToken,
    auto_advance: bool,
    op_in_progress: bool,
}

/// Whether an inbound action is new work, a redelivery, or out of place.
#[derive(Debug, Eq, PartialEq)]
enum Disposition {
    Valid,
    Duplicate,
    Unexpected,
}

pub struct UpdateOrchestrator<T> {
    data_dir: Utf8PathBuf,
    registry: Arc<HandlerRegistry>,
    enumerator: Option<Arc<dyn ComponentEnumerator>>,
    downloader: Arc<dyn ContentDownloader>,
    restart_ops: Arc<dyn RestartOps>,
    root_keys: RootKeyStore,
    state_repository: StateRepository,
    reporter: Reporter,
    transport: T,
    work_tx: mpsc::Sender<WorkCompletion>,
    work_rx: mpsc::Receiver<WorkCompletion>,
    active: Option<ActiveDeployment>,
    queued: VecDeque<(DesiredUpdate, UpdateActionEnvelope)>,
    startup_snapshot: Option<WorkflowSnapshot>,
    last_installed: Option<(String, UpdateId)>,
    failed_awaiting_cancel: bool,
}

impl<T: PropertyTransport> UpdateOrchestrator<T> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device: DeviceProperties,
        data_dir: Utf8PathBuf,
        registry: Arc<HandlerRegistry>,
        enumerator: Option<Arc<dyn ComponentEnumerator>>,
        downloader: Arc<dyn ContentDownloader>,
        restart_ops: Arc<dyn RestartOps>,
        root_keys: RootKeyStore,
        transport: T,
    ) -> Self {
        let (work_tx, work_rx) = mpsc::channel(4);
        let state_repository = StateRepository::new(data_dir.clone());
        UpdateOrchestrator {
            data_dir,
            registry,
            enumerator,
            downloader,
            restart_ops,
            root_keys,
            state_repository,
            reporter: Reporter::new(device),
            transport,
            work_tx,
            work_rx,
            active: None,
            queued: VecDeque::new(),
            startup_snapshot: None,
            last_installed: None,
            failed_awaiting_cancel: false,
        }
    }

    /// The driver loop: runs until the transport closes.
    pub async fn run(mut self) -> Result<(), AgentError> {
        let startup = self.reporter.startup_document();
        self.transport.send(startup).await?;

        self.startup_snapshot = match self.state_repository.load().await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!("Ignoring an unreadable workflow snapshot: {err}");
                None
            }
        };

        loop {
            tokio::select! {
                maybe_update = self.transport.recv() => match maybe_update {
                    Some(update) => self.handle_desired(update).await?,
                    None => break,
                },
                Some(done) = self.work_rx.recv() => self.handle_completion(done).await?,
            }
            self.drain_queue().await?;
        }
        Ok(())
    }

    async fn drain_queue(&mut self) -> Result<(), AgentError> {
        while self.active.is_none() && !self.failed_awaiting_cancel {
            match self.queued.pop_front() {
                // Already acknowledged when it arrived
                Some((update, envelope)) => self.handle_deployment(update, envelope).await?,
                None => break,
            }
        }
        Ok(())
    }

    async fn handle_desired(&mut self, update: DesiredUpdate) -> Result<(), AgentError> {
        let envelope = match UpdateActionEnvelope::from_json_value(&update.value) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!("Rejecting a deployment envelope: {err}");
                self.ack(&update).await?;
                let workflow_id = update.value["workflow"]["id"].as_str().map(str::to_string);
                let result = UpdateResult::failure(err.extended_code(), err.to_string());
                self.reject(workflow_id.as_deref(), None, result).await?;
                return Ok(());
            }
        };
        self.ack(&update).await?;

        if envelope.action() == DesiredAction::Cancel {
            return self.handle_cancel(&envelope).await;
        }
        self.handle_deployment(update, envelope).await
    }

    async fn handle_cancel(&mut self, envelope: &UpdateActionEnvelope) -> Result<(), AgentError> {
        // A cancel at startup clears the pending deployment
        if let Some(snapshot) = self.startup_snapshot.take() {
            info!("Cancelled at startup, dropping workflow {}", snapshot.workflow_id);
            self.state_repository.clear().await?;
            Sandbox::new(&self.data_dir, &snapshot.workflow_id).destroy().await?;
            self.send_idle(envelope.workflow_id()).await?;
            return Ok(());
        }

        if let Some(active) = self.active.as_mut() {
            if active.op_in_progress {
                info!("Cancelling the in-progress operation of workflow {}", active.envelope.workflow_id());
                active.cancel.request();
                if let Some(workflow) = active.workflow.as_mut() {
                    workflow.request_cancel();
                }
                return Ok(());
            }
            // Acknowledge-completion handshake: straight back to idle
            let workflow = active.workflow.take();
            self.active = None;
            self.failed_awaiting_cancel = false;
            if let Some(mut workflow) = workflow {
                Sandbox::new(&self.data_dir, &workflow.id).destroy().await?;
                workflow.state = WorkflowState::Idle;
                self.send_state(&workflow, None).await?;
            }
            self.state_repository.clear().await?;
            return Ok(());
        }

        if self.failed_awaiting_cancel {
            self.failed_awaiting_cancel = false;
            self.send_idle(envelope.workflow_id()).await?;
            return Ok(());
        }

        debug!("Dropping a cancel with nothing to cancel");
        Ok(())
    }

    async fn handle_deployment(
        &mut self,
        update: DesiredUpdate,
        envelope: UpdateActionEnvelope,
    ) -> Result<(), AgentError> {
        // Startup reconciliation comes first: is this the deployment that
        // was pending when the device went away?
        if let Some(snapshot) = self.startup_snapshot.take() {
            if snapshot.workflow_id == envelope.workflow_id() {
                return self.reconcile_startup(envelope, snapshot).await;
            }
            info!("The pending workflow {} was superseded", snapshot.workflow_id);
            self.state_repository.clear().await?;
            Sandbox::new(&self.data_dir, &snapshot.workflow_id).destroy().await?;
        }

        if self.active.is_some() {
            return self.handle_deployment_while_active(update, envelope).await;
        }

        // A redelivery of the last completed deployment is a no-op
        if let Some((workflow_id, _)) = &self.last_installed {
            if workflow_id == envelope.workflow_id()
                && envelope.action() == DesiredAction::ProcessDeployment
            {
                debug!("Dropping the already-installed workflow {workflow_id}");
                return Ok(());
            }
        }

        let action = envelope.action();
        match action {
            DesiredAction::ProcessDeployment => {
                self.start_deployment(envelope, Phase::Download, true).await
            }
            DesiredAction::Download => {
                match legacy_disposition(action, self.reporter.last_reported_state()) {
                    Disposition::Duplicate => Ok(()),
                    Disposition::Valid => {
                        self.start_deployment(envelope, Phase::Download, false).await
                    }
                    Disposition::Unexpected => self.reject_unexpected(&envelope).await,
                }
            }
            // Install and apply need the workflow of an earlier download
            DesiredAction::Install | DesiredAction::Apply => {
                match legacy_disposition(action, self.reporter.last_reported_state()) {
                    Disposition::Duplicate => Ok(()),
                    _ => self.reject_unexpected(&envelope).await,
                }
            }
            DesiredAction::Cancel => Ok(()),
        }
    }

    async fn handle_deployment_while_active(
        &mut self,
        update: DesiredUpdate,
        envelope: UpdateActionEnvelope,
    ) -> Result<(), AgentError> {
        let active = self.active.as_mut().expect("checked by the caller");

        if active.envelope.workflow_id() != envelope.workflow_id() {
            info!(
                "Workflow {} supersedes the in-progress {}",
                envelope.workflow_id(),
                active.envelope.workflow_id()
            );
            active.cancel.request();
            if let Some(workflow) = active.workflow.as_mut() {
                workflow.request_cancel();
            }
            if !active.op_in_progress {
                // Nothing in flight, no completion will fire: drop it now
                let abandoned = active.envelope.workflow_id().to_string();
                self.active = None;
                Sandbox::new(&self.data_dir, &abandoned).destroy().await?;
                self.state_repository.clear().await?;
            }
            self.queued.push_back((update, envelope));
            return Ok(());
        }

        match envelope.action() {
            DesiredAction::ProcessDeployment => {
                // Update-in-place: refresh the redelivered properties
                debug!("Redelivery of the active workflow {}", envelope.workflow_id());
                active.envelope = envelope;
                Ok(())
            }
            action => {
                if active.op_in_progress {
                    debug!("Dropping the {action} action, an operation is in flight");
                    return Ok(());
                }
                match legacy_disposition(action, self.reporter.last_reported_state()) {
                    Disposition::Duplicate => Ok(()),
                    Disposition::Valid => {
                        active.auto_advance = false;
                        let phase = match action {
                            DesiredAction::Download => Phase::Download,
                            DesiredAction::Install => Phase::Install,
                            _ => Phase::Apply,
                        };
                        self.dispatch_phase(phase).await
                    }
                    Disposition::Unexpected => self.reject_unexpected(&envelope).await,
                }
            }
        }
    }

    /// Verify, build and launch a fresh deployment.
    async fn start_deployment(
        &mut self,
        envelope: UpdateActionEnvelope,
        phase: Phase,
        auto_advance: bool,
    ) -> Result<(), AgentError> {
        if let Err(err) = jws::verify_manifest(
            &self.root_keys,
            &envelope.update_manifest,
            &envelope.update_manifest_signature,
        ) {
            warn!("Rejecting workflow {}: {err}", envelope.workflow_id());
            let result = UpdateResult::failure(err.extended_code(), err.to_string());
            return self
                .reject(Some(envelope.workflow_id()), Some(envelope.action().value()), result)
                .await;
        }

        let mut workflow = match WorkflowHandle::from_envelope(&envelope) {
            Ok(workflow) => workflow,
            Err(err) => {
                warn!("Rejecting workflow {}: {err}", envelope.workflow_id());
                let result = UpdateResult::failure(err.extended_code(), err.to_string());
                return self
                    .reject(Some(envelope.workflow_id()), Some(envelope.action().value()), result)
                    .await;
            }
        };

        info!("Processing deployment {} ({})", workflow.id, workflow.manifest.update_id);
        self.failed_awaiting_cancel = false;
        Sandbox::new(&self.data_dir, &workflow.id).create().await?;
        workflow.state = WorkflowState::DeploymentInProgress;
        self.send_state(&workflow, None).await?;

        self.active = Some(ActiveDeployment {
            envelope,
            workflow: Some(workflow),
            cancel: CancelToken::new(),
            auto_advance,
            op_in_progress: false,
        });
        self.dispatch_phase(phase).await
    }

    /// Hand the workflow tree to a phase task and return to the loop.
    async fn dispatch_phase(&mut self, phase: Phase) -> Result<(), AgentError> {
        let Some(active) = self.active.as_mut() else {
            return Ok(());
        };
        let Some(mut workflow) = active.workflow.take() else {
            return Ok(());
        };
        let cancel = active.cancel.clone();
        active.op_in_progress = true;

        workflow.state = phase.starting_state();
        workflow.operation_in_progress = true;
        let workflow_id = workflow.id.clone();
        self.send_state(&workflow, None).await?;

        let executor = self.executor(&workflow_id, cancel);
        let task = tokio::spawn(async move {
            let mut workflow = workflow;
            let result = executor.run_phase(&mut workflow, phase).await;
            WorkCompletion {
                workflow_id: workflow.id.clone(),
                phase,
                workflow: Some(workflow),
                result,
            }
        });

        let completion_tx = self.work_tx.clone();
        tokio::spawn(async move {
            let completion = match task.await {
                Ok(completion) => completion,
                Err(err) => {
                    // A handler fault must not take the driver loop down
                    error!("The {phase} phase task died: {err}");
                    WorkCompletion {
                        workflow_id,
                        phase,
                        workflow: None,
                        result: UpdateResult::failure(
                            extended_code::INTERNAL,
                            "the content handler crashed",
                        ),
                    }
                }
            };
            let _ = completion_tx.send(completion).await;
        });
        Ok(())
    }

    async fn handle_completion(&mut self, done: WorkCompletion) -> Result<(), AgentError> {
        let Some(active) = self.active.as_mut() else {
            info!("Discarding a late completion for workflow {}", done.workflow_id);
            return Ok(());
        };
        if active.envelope.workflow_id() != done.workflow_id {
            info!("Discarding a late completion for the superseded workflow {}", done.workflow_id);
            return Ok(());
        }

        active.op_in_progress = false;
        let cancel_requested = active.cancel.is_requested();
        let auto_advance = active.auto_advance;

        let mut workflow = match done.workflow {
            Some(workflow) => workflow,
            None => match WorkflowHandle::from_envelope(&active.envelope) {
                Ok(workflow) => workflow,
                Err(err) => {
                    error!("Cannot rebuild the crashed workflow {}: {err}", done.workflow_id);
                    self.active = None;
                    let result = UpdateResult::failure(extended_code::INTERNAL, err.to_string());
                    return self.reject(Some(&done.workflow_id), None, result).await;
                }
            },
        };
        workflow.operation_in_progress = false;
        let result = done.result;

        if cancel_requested && !result.is_success() {
            self.active = None;
            return self.finish_cancelled(workflow).await;
        }

        if result.is_failure() {
            workflow.state = WorkflowState::Failed;
            workflow.result = result;
            self.send_state(&workflow, None).await?;
            if let Some(active) = self.active.as_mut() {
                active.workflow = Some(workflow);
            }
            return Ok(());
        }

        workflow.result = result;

        // An immediate restart pre-empts the remaining phases; the state is
        // left at <phase>Started so the reconciler reruns this phase if the
        // update turns out not to be installed.
        if workflow.restarts.any_immediate() {
            let reboot = workflow.restarts.immediate_reboot;
            return self.initiate_restart(workflow, reboot).await;
        }

        match done.phase {
            Phase::Download | Phase::Install => {
                workflow.state = done.phase.succeeded_state();
                self.send_state(&workflow, None).await?;
                if let Some(active) = self.active.as_mut() {
                    active.workflow = Some(workflow);
                }
                if auto_advance {
                    if let Some(next) = done.phase.next() {
                        self.dispatch_phase(next).await?;
                    }
                }
                Ok(())
            }
            Phase::Apply => {
                if workflow.restarts.wants_reboot() {
                    self.initiate_restart(workflow, true).await
                } else if workflow.restarts.wants_agent_restart() {
                    self.initiate_restart(workflow, false).await
                } else {
                    self.active = None;
                    self.finish_success(workflow).await
                }
            }
        }
    }

    /// Persist the snapshot and trigger the reboot or agent restart.
    async fn initiate_restart(
        &mut self,
        workflow: WorkflowHandle,
        reboot: bool,
    ) -> Result<(), AgentError> {
        let mut snapshot = WorkflowSnapshot {
            workflow_id: workflow.id.clone(),
            current_step: workflow.state,
            last_result: workflow.result.clone(),
            system_reboot_state: if reboot {
                SystemRebootState::Required
            } else {
                SystemRebootState::None
            },
            agent_restart_state: if reboot {
                AgentRestartState::None
            } else {
                AgentRestartState::Required
            },
            expected_update_id: Some(workflow.manifest.update_id.clone()),
            work_folder: Sandbox::new(&self.data_dir, &workflow.id).path().to_owned(),
            pending_reported_json: None,
        };
        self.state_repository.store(&snapshot).await?;

        let what = if reboot { "reboot" } else { "agent restart" };
        info!("Deployment {} requires a {what}", workflow.id);
        let initiated = if reboot {
            self.restart_ops.reboot().await
        } else {
            self.restart_ops.restart_agent().await
        };

        match initiated {
            Ok(()) => {
                if reboot {
                    snapshot.system_reboot_state = SystemRebootState::InProgress;
                } else {
                    snapshot.agent_restart_state = AgentRestartState::InProgress;
                }
                self.state_repository.store(&snapshot).await?;
                // The back-end must not observe the transient state
                self.reporter.suppress();
                if let Some(active) = self.active.as_mut() {
                    active.workflow = Some(workflow);
                }
                Ok(())
            }
            Err(err) => {
                error!("Could not initiate the {what}: {err}");
                self.state_repository.clear().await?;
                let mut workflow = workflow;
                workflow.state = WorkflowState::Failed;
                workflow.result = UpdateResult::failure(
                    extended_code::PHASE_FAILED,
                    format!("the {what} could not be initiated: {err}"),
                );
                self.send_state(&workflow, None).await?;
                if let Some(active) = self.active.as_mut() {
                    active.workflow = Some(workflow);
                }
                Ok(())
            }
        }
    }

    async fn reconcile_startup(
        &mut self,
        envelope: UpdateActionEnvelope,
        snapshot: WorkflowSnapshot,
    ) -> Result<(), AgentError> {
        if let Err(err) = jws::verify_manifest(
            &self.root_keys,
            &envelope.update_manifest,
            &envelope.update_manifest_signature,
        ) {
            warn!("Rejecting the pending workflow {}: {err}", envelope.workflow_id());
            self.state_repository.clear().await?;
            let result = UpdateResult::failure(err.extended_code(), err.to_string());
            return self
                .reject(Some(envelope.workflow_id()), Some(envelope.action().value()), result)
                .await;
        }
        let mut workflow = match WorkflowHandle::from_envelope(&envelope) {
            Ok(workflow) => workflow,
            Err(err) => {
                self.state_repository.clear().await?;
                let result = UpdateResult::failure(err.extended_code(), err.to_string());
                return self
                    .reject(Some(envelope.workflow_id()), Some(envelope.action().value()), result)
                    .await;
            }
        };

        if let Some(pending) = snapshot.pending_reported_json.clone() {
            self.transport.send(pending).await?;
        }

        let cancel = CancelToken::new();
        let executor = self.executor(&workflow.id, cancel.clone());
        match reconciler::reconcile(&executor, &mut workflow, &snapshot).await {
            ReconcileOutcome::AlreadyInstalled { update_id } => {
                self.state_repository.clear().await?;
                Sandbox::new(&self.data_dir, &workflow.id).destroy().await?;
                workflow.state = WorkflowState::Idle;
                workflow.result = UpdateResult::success();
                self.send_state(&workflow, Some(&update_id)).await?;
                self.last_installed = Some((workflow.id.clone(), update_id));
                Ok(())
            }
            ReconcileOutcome::Cancelled => {
                self.state_repository.clear().await?;
                Sandbox::new(&self.data_dir, &workflow.id).destroy().await?;
                self.send_idle(&workflow.id).await?;
                Ok(())
            }
            ReconcileOutcome::Resume { phase } => {
                self.state_repository.clear().await?;
                self.active = Some(ActiveDeployment {
                    envelope,
                    workflow: Some(workflow),
                    cancel,
                    auto_advance: true,
                    op_in_progress: false,
                });
                self.dispatch_phase(phase).await
            }
        }
    }

    async fn finish_success(&mut self, mut workflow: WorkflowHandle) -> Result<(), AgentError> {
        let update_id = workflow.manifest.update_id.clone();
        info!("Deployment {} installed {update_id}", workflow.id);
        Sandbox::new(&self.data_dir, &workflow.id).destroy().await?;
        self.state_repository.clear().await?;
        workflow.state = WorkflowState::Idle;
        self.send_state(&workflow, Some(&update_id)).await?;
        self.last_installed = Some((workflow.id.clone(), update_id));
        Ok(())
    }

    async fn finish_cancelled(&mut self, mut workflow: WorkflowHandle) -> Result<(), AgentError> {
        info!("Deployment {} cancelled", workflow.id);
        Sandbox::new(&self.data_dir, &workflow.id).destroy().await?;
        self.state_repository.clear().await?;
        workflow.state = WorkflowState::Idle;
        workflow.result = UpdateResult::cancelled();
        self.send_state(&workflow, None).await?;
        Ok(())
    }

    fn executor(&self, workflow_id: &str, cancel: CancelToken) -> StepExecutor {
        StepExecutor {
            registry: self.registry.clone(),
            enumerator: self.enumerator.clone(),
            downloader: self.downloader.clone(),
            sandbox: Sandbox::new(&self.data_dir, workflow_id),
            cancel,
        }
    }

    async fn ack(&mut self, update: &DesiredUpdate) -> Result<(), AgentError> {
        let ack = self.reporter.ack_document(&update.value, update.version);
        self.transport.send(ack).await?;
        Ok(())
    }

    async fn send_state(
        &mut self,
        workflow: &WorkflowHandle,
        installed: Option<&UpdateId>,
    ) -> Result<(), AgentError> {
        if let Some(document) = self.reporter.state_document(workflow, installed) {
            self.transport.send(document).await?;
        }
        Ok(())
    }

    async fn send_idle(&mut self, workflow_id: &str) -> Result<(), AgentError> {
        if let Some(document) = self.reporter.idle_document(workflow_id) {
            self.transport.send(document).await?;
        }
        Ok(())
    }

    async fn reject(
        &mut self,
        workflow_id: Option<&str>,
        action: Option<u64>,
        result: UpdateResult,
    ) -> Result<(), AgentError> {
        self.failed_awaiting_cancel = self.active.is_none();
        if let Some(document) = self.reporter.rejection_document(workflow_id, action, &result) {
            self.transport.send(document).await?;
        }
        Ok(())
    }

    async fn reject_unexpected(&mut self, envelope: &UpdateActionEnvelope) -> Result<(), AgentError> {
        let result = UpdateResult::failure(
            extended_code::UNEXPECTED_STATE,
            format!(
                "the {} action is not valid in the current state",
                envelope.action()
            ),
        );
        self.reject(Some(envelope.workflow_id()), Some(envelope.action().value()), result)
            .await
    }
}

/// Redelivered explicit-phase actions are matched against the last reported
/// state: a redelivery of the running or just-finished phase is silently
/// dropped, an out-of-order one is an error.
fn legacy_disposition(action: DesiredAction, last: Option<WorkflowState>) -> Disposition {
    match action {
        DesiredAction::Download => match last {
            Some(WorkflowState::DownloadStarted) | Some(WorkflowState::DownloadSucceeded) => {
                Disposition::Duplicate
            }
            None | Some(WorkflowState::Idle) | Some(WorkflowState::DeploymentInProgress) => {
                Disposition::Valid
            }
            _ => Disposition::Unexpected,
        },
        DesiredAction::Install => match last {
            Some(WorkflowState::InstallStarted) | Some(WorkflowState::InstallSucceeded) => {
                Disposition::Duplicate
            }
            Some(WorkflowState::DownloadSucceeded) => Disposition::Valid,
            _ => Disposition::Unexpected,
        },
        DesiredAction::Apply => match last {
            Some(WorkflowState::ApplyStarted) => Disposition::Duplicate,
            Some(WorkflowState::InstallSucceeded) => Disposition::Valid,
            _ => Disposition::Unexpected,
        },
        DesiredAction::ProcessDeployment | DesiredAction::Cancel => Disposition::Valid,
    }
}
