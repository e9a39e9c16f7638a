//! Expands a composite deployment into child workflows and drives one phase
//! at a time through the content handlers.
//!
//! The rollout order is: components outermost (in the order the enumerator
//! surfaced them), steps innermost (in manifest order). A failing step aborts
//! the remaining steps for the current component only; the next component is
//! still attempted. Install and apply are fused at the leaf so that a failed
//! apply can restore the step while its sandbox is still populated.

use crate::downloader::ContentDownloader;
use crate::downloader::DownloadRequest;
use crate::downloader::DO_RETRY_TIMEOUT_DEFAULT;
use crate::enumerator::ComponentEnumerator;
use crate::registry::handler::StepContext;
use crate::registry::HandlerRegistry;
use crate::sandbox::Sandbox;
use du_api::manifest::Step;
use du_api::manifest::UpdateManifest;
use du_api::result::extended_code;
use du_api::CancelToken;
use du_api::ResultCode;
use du_api::UpdateResult;
use du_api::WorkflowHandle;
use du_api::WorkflowState;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::debug;
use tracing::info;
use tracing::warn;

/// One of the agent-driven phases of a deployment.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
    Download,
    Install,
    Apply,
}

impl Phase {
    pub fn starting_state(self) -> WorkflowState {
        match self {
            Phase::Download => WorkflowState::DownloadStarted,
            Phase::Install => WorkflowState::InstallStarted,
            Phase::Apply => WorkflowState::ApplyStarted,
        }
    }

    pub fn succeeded_state(self) -> WorkflowState {
        match self {
            Phase::Download => WorkflowState::DownloadSucceeded,
            Phase::Install => WorkflowState::InstallSucceeded,
            Phase::Apply => WorkflowState::Idle,
        }
    }

    pub fn next(self) -> Option<Phase> {
        match self {
            Phase::Download => Some(Phase::Install),
            Phase::Install => Some(Phase::Apply),
            Phase::Apply => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Download => "download",
            Phase::Install => "install",
            Phase::Apply => "apply",
        };
        f.write_str(name)
    }
}

pub struct StepExecutor {
    pub registry: Arc<HandlerRegistry>,
    pub enumerator: Option<Arc<dyn ComponentEnumerator>>,
    pub downloader: Arc<dyn ContentDownloader>,
    pub sandbox: Sandbox,
    pub cancel: CancelToken,
}

impl StepExecutor {
    /// Drive one phase over the whole workflow tree.
    ///
    /// The outcome carries the first step failure verbatim, or the most
    /// demanding restart request accumulated across the rollout.
    pub async fn run_phase(&self, workflow: &mut WorkflowHandle, phase: Phase) -> UpdateResult {
        info!("Running the {phase} phase of workflow {}", workflow.id);
        if let Err(err) = self.sandbox.create().await {
            return UpdateResult::failure(extended_code::INTERNAL, err.to_string());
        }
        if let Err(failure) = self.prepare_children(workflow).await {
            return failure;
        }

        // A manifest without steps is itself the leaf
        if workflow.manifest.steps.is_empty() {
            let outcome = self.run_step(workflow, phase).await;
            workflow.restarts.record(outcome.code);
            workflow.result = outcome.clone();
            if self.cancel.is_requested() && !outcome.is_success() {
                return UpdateResult::cancelled();
            }
            return outcome;
        }

        let mut first_failure: Option<UpdateResult> = None;
        'components: for component in component_rollout(workflow) {
            for index in 0..workflow.children.len() {
                if self.cancel.is_requested() {
                    self.signal_cancel(&workflow.children[index]).await;
                    workflow.children[index].result = UpdateResult::cancelled();
                    return UpdateResult::cancelled();
                }

                let is_reference = workflow.manifest.steps[index].is_reference();
                let child = &mut workflow.children[index];
                if child.result.code == ResultCode::SKIPPED_NO_MATCHING_COMPONENTS {
                    continue;
                }
                if let Some(component) = &component {
                    if is_reference && !child.selected_components.contains(component) {
                        continue;
                    }
                    if !is_reference {
                        child.selected_components = vec![component.clone()];
                    }
                }

                let outcome = self.run_step(child, phase).await;
                child.result = outcome.clone();
                child.restarts.record(outcome.code);
                workflow.restarts.record(outcome.code);

                if self.cancel.is_requested() && !outcome.is_success() {
                    child.result = UpdateResult::cancelled();
                    return UpdateResult::cancelled();
                }
                if outcome.code.requires_immediate_restart() {
                    // Abort the rollout, the restart takes over
                    return UpdateResult::with_code(outcome.code);
                }
                if outcome.is_failure() {
                    warn!(
                        "Step {index} of workflow {} failed: {:?}",
                        workflow.id, outcome.details
                    );
                    if first_failure.is_none() {
                        first_failure = Some(outcome);
                    }
                    continue 'components;
                }
            }
        }

        if let Some(failure) = first_failure {
            return failure;
        }
        if workflow.restarts.wants_reboot() {
            return UpdateResult::with_code(ResultCode::SUCCESS_REBOOT_REQUIRED);
        }
        if workflow.restarts.wants_agent_restart() {
            return UpdateResult::with_code(ResultCode::SUCCESS_AGENT_RESTART_REQUIRED);
        }
        UpdateResult::success()
    }

    /// Whether every step reports the deployment as installed, for the
    /// startup reconciliation.
    pub async fn check_installed(
        &self,
        workflow: &mut WorkflowHandle,
    ) -> Result<bool, UpdateResult> {
        self.prepare_children(workflow).await?;

        if workflow.manifest.steps.is_empty() {
            return Ok(self.step_installed(workflow).await?);
        }

        for component in component_rollout(workflow) {
            for index in 0..workflow.children.len() {
                let is_reference = workflow.manifest.steps[index].is_reference();
                let child = &mut workflow.children[index];
                if child.result.code == ResultCode::SKIPPED_NO_MATCHING_COMPONENTS {
                    continue;
                }
                if let Some(component) = &component {
                    if is_reference && !child.selected_components.contains(component) {
                        continue;
                    }
                    if !is_reference {
                        child.selected_components = vec![component.clone()];
                    }
                }
                if !self.step_installed(child).await? {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    async fn step_installed(&self, node: &WorkflowHandle) -> Result<bool, UpdateResult> {
        let handler = self
            .registry
            .handler(node.update_type())
            .await
            .map_err(|err| UpdateResult::failure(err.extended_code(), err.to_string()))?;
        let context = StepContext::for_workflow(node, &self.sandbox, self.cancel.clone());
        Ok(handler.is_installed(&context).await.code == ResultCode::INSTALLED)
    }

    /// Run one phase of a single step, with the install/apply fusion and the
    /// already-installed shortcut.
    async fn run_step(&self, node: &mut WorkflowHandle, phase: Phase) -> UpdateResult {
        let handler = match self.registry.handler(node.update_type()).await {
            Ok(handler) => handler,
            Err(err) => return UpdateResult::failure(err.extended_code(), err.to_string()),
        };
        let context = StepContext::for_workflow(node, &self.sandbox, self.cancel.clone());

        if handler.is_installed(&context).await.code == ResultCode::INSTALLED {
            debug!("Step {} is already installed, skipping", node.id);
            node.applied = true;
            return UpdateResult::skipped_already_installed();
        }

        match phase {
            Phase::Download => handler.download(&context).await,
            Phase::Install => {
                let backup = handler.backup(&context).await;
                if backup.is_failure() {
                    return backup;
                }
                let install = handler.install(&context).await;
                if !install.is_success() || install.code.requires_immediate_restart() {
                    return install;
                }
                // Fused apply, while the sandbox is still populated
                let apply = handler.apply(&context).await;
                if apply.is_failure() {
                    let restore = handler.restore(&context).await;
                    if restore.is_failure() {
                        warn!("Restoring step {} failed: {:?}", node.id, restore.details);
                    }
                    return apply;
                }
                node.applied = true;
                more_demanding(install, apply)
            }
            Phase::Apply => {
                if node.applied {
                    return UpdateResult::success();
                }
                let apply = handler.apply(&context).await;
                if apply.is_success() {
                    node.applied = true;
                }
                apply
            }
        }
    }

    async fn signal_cancel(&self, node: &WorkflowHandle) {
        if let Ok(handler) = self.registry.handler(node.update_type()).await {
            let context = StepContext::for_workflow(node, &self.sandbox, self.cancel.clone());
            let _ = handler.cancel(&context).await;
        }
    }

    /// Make the child list match the manifest's step list.
    ///
    /// Idempotent: children surviving a reboot or an earlier phase are
    /// reused. Reference steps get their components selected and their
    /// detached manifest fetched into the sandbox, once per workflow.
    pub async fn prepare_children(
        &self,
        workflow: &mut WorkflowHandle,
    ) -> Result<(), UpdateResult> {
        let steps = workflow.manifest.steps.clone();
        if workflow.children.len() == steps.len() {
            return Ok(());
        }
        workflow.children.clear();

        for (index, step) in steps.iter().enumerate() {
            let child = match step {
                Step::Inline {
                    handler,
                    handler_properties,
                    files,
                    installed_criteria,
                } => workflow
                    .inline_child(
                        index,
                        handler,
                        handler_properties.clone(),
                        files,
                        installed_criteria.clone(),
                    )
                    .map_err(|err| UpdateResult::failure(err.extended_code(), err.to_string()))?,

                Step::Reference {
                    detached_manifest_file_id,
                    compatibility,
                } => {
                    let selected = match &self.enumerator {
                        Some(enumerator) => {
                            let compat = compatibility.first().cloned().unwrap_or(Value::Null);
                            let components = enumerator
                                .select_components(&compat)
                                .await
                                .map_err(|err| {
                                    UpdateResult::failure(
                                        extended_code::COMPONENT_SELECTION_FAILED,
                                        err.to_string(),
                                    )
                                })?;
                            Some(components)
                        }
                        // Without an enumerator the step targets the host
                        None => None,
                    };

                    match selected {
                        Some(components) if components.is_empty() => {
                            debug!(
                                "Step {index} of workflow {} matches no component",
                                workflow.id
                            );
                            let mut child = workflow.reference_child(
                                index,
                                untargeted_manifest(&workflow.manifest),
                                Vec::new(),
                            );
                            child.result = UpdateResult::skipped_no_matching_components();
                            child
                        }
                        selected => {
                            let manifest = self
                                .fetch_detached_manifest(workflow, detached_manifest_file_id)
                                .await?;
                            workflow.reference_child(index, manifest, selected.unwrap_or_default())
                        }
                    }
                }
            };
            workflow.children.push(child);
        }
        Ok(())
    }

    /// Fetch and parse a detached child manifest, at most once per workflow
    /// lifetime: a file already sitting in the sandbox is reused.
    async fn fetch_detached_manifest(
        &self,
        workflow: &WorkflowHandle,
        file_id: &str,
    ) -> Result<UpdateManifest, UpdateResult> {
        let entity = workflow
            .manifest
            .file(file_id)
            .map_err(|err| UpdateResult::failure(err.extended_code(), err.to_string()))?;
        let dest = self.sandbox.file_path(&entity.file_name);

        if !dest.exists() {
            let url = workflow.file_urls.get(file_id).ok_or_else(|| {
                UpdateResult::failure(
                    extended_code::BAD_FORMAT,
                    format!("no download url for the file {file_id:?}"),
                )
            })?;
            let request = DownloadRequest {
                workflow_id: workflow.id.clone(),
                file_id: file_id.to_string(),
                url: url.clone(),
                expected_hashes: entity.hashes.clone(),
                timeout: DO_RETRY_TIMEOUT_DEFAULT,
            };
            self.downloader
                .download(&request, &dest, None)
                .await
                .map_err(|err| {
                    UpdateResult::failure(extended_code::PHASE_FAILED, err.to_string())
                })?;
        }

        let content = tokio::fs::read_to_string(&dest)
            .await
            .map_err(|err| UpdateResult::failure(extended_code::INTERNAL, err.to_string()))?;
        UpdateManifest::from_json_str(&content)
            .map_err(|err| UpdateResult::failure(err.extended_code(), err.to_string()))
    }
}

/// The components to roll the steps over, in order of first appearance:
/// the workflow's own selection first, then each reference step's selection
/// in step order. An empty rollout means one host-level pass.
fn component_rollout(workflow: &WorkflowHandle) -> Vec<Option<Value>> {
    let mut components: Vec<Value> = Vec::new();
    for component in &workflow.selected_components {
        if !components.contains(component) {
            components.push(component.clone());
        }
    }
    for child in &workflow.children {
        for component in &child.selected_components {
            if !components.contains(component) {
                components.push(component.clone());
            }
        }
    }
    if components.is_empty() {
        vec![None]
    } else {
        components.into_iter().map(Some).collect()
    }
}

/// Stand-in manifest for a reference step that matched no component and
/// whose detached manifest is therefore never fetched.
fn untargeted_manifest(parent: &UpdateManifest) -> UpdateManifest {
    UpdateManifest {
        update_type: String::new(),
        update_id: parent.update_id.clone(),
        installed_criteria: None,
        compatibility: Vec::new(),
        files: Default::default(),
        steps: Vec::new(),
        created_timestamp: None,
    }
}

/// Of two successful outcomes, the one with the more demanding restart
/// request; a reboot outranks an agent restart.
fn more_demanding(a: UpdateResult, b: UpdateResult) -> UpdateResult {
    fn rank(code: ResultCode) -> u8 {
        match code {
            ResultCode::SUCCESS_IMMEDIATE_REBOOT_REQUIRED => 4,
            ResultCode::SUCCESS_IMMEDIATE_AGENT_RESTART_REQUIRED => 3,
            ResultCode::SUCCESS_REBOOT_REQUIRED => 2,
            ResultCode::SUCCESS_AGENT_RESTART_REQUIRED => 1,
            _ => 0,
        }
    }
    if rank(b.code) > rank(a.code) {
        b
    } else {
        a
    }
}
