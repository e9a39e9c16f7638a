use crate::envelope::DesiredAction;
use crate::envelope::UpdateActionEnvelope;
use crate::error::ParseError;
use crate::manifest::FileEntity;
use crate::manifest::FileId;
use crate::manifest::UpdateManifest;
use crate::result::ResultCode;
use crate::result::UpdateResult;
use serde::de;
use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Cloud-visible workflow states, numeric on the wire.
///
/// There is no `ApplySucceeded`: a successful apply goes straight back to
/// `Idle` together with the installed update id.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WorkflowState {
    Idle,
    DownloadStarted,
    DownloadSucceeded,
    InstallStarted,
    InstallSucceeded,
    ApplyStarted,
    DeploymentInProgress,
    Failed,
}

impl WorkflowState {
    pub fn value(self) -> u64 {
        match self {
            WorkflowState::Idle => 0,
            WorkflowState::DownloadStarted => 1,
            WorkflowState::DownloadSucceeded => 2,
            WorkflowState::InstallStarted => 3,
            WorkflowState::InstallSucceeded => 4,
            WorkflowState::ApplyStarted => 5,
            WorkflowState::DeploymentInProgress => 6,
            WorkflowState::Failed => 255,
        }
    }

    pub fn from_value(value: u64) -> Option<Self> {
        match value {
            0 => Some(WorkflowState::Idle),
            1 => Some(WorkflowState::DownloadStarted),
            2 => Some(WorkflowState::DownloadSucceeded),
            3 => Some(WorkflowState::InstallStarted),
            4 => Some(WorkflowState::InstallSucceeded),
            5 => Some(WorkflowState::ApplyStarted),
            6 => Some(WorkflowState::DeploymentInProgress),
            255 => Some(WorkflowState::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkflowState::Idle => "idle",
            WorkflowState::DownloadStarted => "downloadStarted",
            WorkflowState::DownloadSucceeded => "downloadSucceeded",
            WorkflowState::InstallStarted => "installStarted",
            WorkflowState::InstallSucceeded => "installSucceeded",
            WorkflowState::ApplyStarted => "applyStarted",
            WorkflowState::DeploymentInProgress => "deploymentInProgress",
            WorkflowState::Failed => "failed",
        };
        f.write_str(name)
    }
}

impl Serialize for WorkflowState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.value())
    }
}

impl<'de> Deserialize<'de> for WorkflowState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = u64::deserialize(deserializer)?;
        WorkflowState::from_value(value)
            .ok_or_else(|| de::Error::custom(format!("unknown workflow state {value}")))
    }
}

/// Where the device stands with respect to a requested system reboot.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SystemRebootState {
    #[default]
    None,
    Required,
    InProgress,
}

/// Where the device stands with respect to a requested agent restart.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AgentRestartState {
    #[default]
    None,
    Required,
    InProgress,
}

/// Cooperative cancellation flag shared between the driver loop and the
/// handler currently doing the work. Requesting is sticky.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        CancelToken::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Reboot and agent-restart requests accumulated while driving a phase.
///
/// On equal precedence a reboot outranks an agent restart.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RestartRequests {
    pub immediate_reboot: bool,
    pub reboot: bool,
    pub immediate_agent_restart: bool,
    pub agent_restart: bool,
}

impl RestartRequests {
    pub fn record(&mut self, code: ResultCode) {
        match code {
            ResultCode::SUCCESS_IMMEDIATE_REBOOT_REQUIRED => self.immediate_reboot = true,
            ResultCode::SUCCESS_REBOOT_REQUIRED => self.reboot = true,
            ResultCode::SUCCESS_IMMEDIATE_AGENT_RESTART_REQUIRED => {
                self.immediate_agent_restart = true
            }
            ResultCode::SUCCESS_AGENT_RESTART_REQUIRED => self.agent_restart = true,
            _ => (),
        }
    }

    pub fn merge(&mut self, other: RestartRequests) {
        self.immediate_reboot |= other.immediate_reboot;
        self.reboot |= other.reboot;
        self.immediate_agent_restart |= other.immediate_agent_restart;
        self.agent_restart |= other.agent_restart;
    }

    pub fn any_immediate(&self) -> bool {
        self.immediate_reboot || self.immediate_agent_restart
    }

    pub fn wants_reboot(&self) -> bool {
        self.immediate_reboot || self.reboot
    }

    pub fn wants_agent_restart(&self) -> bool {
        self.immediate_agent_restart || self.agent_restart
    }
}

/// In-memory tree representation of a deployment.
///
/// The root is built from the envelope; each step of a composite deployment
/// becomes one child, keyed `"0"`, `"1"`, … in step order. A node owns its
/// children exclusively; the contextual lookups a parent back-pointer would
/// serve are carried directly on the node (`level`, `step_index`, the
/// selected components seeded at expansion time).
#[derive(Clone, Debug)]
pub struct WorkflowHandle {
    pub id: String,
    pub level: usize,
    pub step_index: usize,
    pub action: DesiredAction,
    pub manifest: UpdateManifest,
    pub handler_properties: Value,
    pub file_urls: HashMap<FileId, String>,
    pub state: WorkflowState,
    pub result: UpdateResult,
    pub selected_components: Vec<Value>,
    pub children: Vec<WorkflowHandle>,
    pub operation_in_progress: bool,
    pub cancel_requested: bool,
    /// The leaf has already been applied during the fused install phase.
    pub applied: bool,
    pub restarts: RestartRequests,
}

impl WorkflowHandle {
    /// Build the root workflow from a parsed envelope.
    pub fn from_envelope(envelope: &UpdateActionEnvelope) -> Result<Self, ParseError> {
        let manifest = envelope.manifest()?;
        Ok(WorkflowHandle {
            id: envelope.workflow_id().to_string(),
            level: 0,
            step_index: 0,
            action: envelope.action(),
            manifest,
            handler_properties: Value::Null,
            file_urls: envelope.file_urls.clone(),
            state: WorkflowState::Idle,
            result: UpdateResult::default(),
            selected_components: Vec::new(),
            children: Vec::new(),
            operation_in_progress: false,
            cancel_requested: false,
            applied: false,
            restarts: RestartRequests::default(),
        })
    }

    /// Child workflow for an inline step: the manifest slice names the step
    /// handler as its update type and carries only the files the step lists.
    pub fn inline_child(
        &self,
        step_index: usize,
        handler: &str,
        handler_properties: Value,
        files: &[FileId],
        installed_criteria: Option<String>,
    ) -> Result<WorkflowHandle, ParseError> {
        let mut child_files: HashMap<FileId, FileEntity> = HashMap::new();
        for file_id in files {
            child_files.insert(file_id.clone(), self.manifest.file(file_id)?.clone());
        }
        let manifest = UpdateManifest {
            update_type: handler.to_string(),
            update_id: self.manifest.update_id.clone(),
            installed_criteria,
            compatibility: Vec::new(),
            files: child_files,
            steps: Vec::new(),
            created_timestamp: None,
        };
        Ok(self.child(step_index, manifest, handler_properties, self.selected_components.clone()))
    }

    /// Child workflow for a reference step, carrying the parsed detached
    /// manifest and the components the enumerator selected for it.
    pub fn reference_child(
        &self,
        step_index: usize,
        manifest: UpdateManifest,
        selected_components: Vec<Value>,
    ) -> WorkflowHandle {
        self.child(step_index, manifest, Value::Null, selected_components)
    }

    fn child(
        &self,
        step_index: usize,
        manifest: UpdateManifest,
        handler_properties: Value,
        selected_components: Vec<Value>,
    ) -> WorkflowHandle {
        WorkflowHandle {
            id: step_index.to_string(),
            level: self.level + 1,
            step_index,
            action: self.action,
            manifest,
            handler_properties,
            file_urls: self.file_urls.clone(),
            state: self.state,
            result: UpdateResult::default(),
            selected_components,
            children: Vec::new(),
            operation_in_progress: false,
            cancel_requested: false,
            applied: false,
            restarts: RestartRequests::default(),
        }
    }

    pub fn update_type(&self) -> &str {
        &self.manifest.update_type
    }

    pub fn is_composite(&self) -> bool {
        self.manifest.is_composite()
    }

    /// Propagate a cancellation request down the subtree.
    pub fn request_cancel(&mut self) {
        self.cancel_requested = true;
        for child in &mut self.children {
            child.request_cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn root_workflow() -> WorkflowHandle {
        let envelope = UpdateActionEnvelope::from_json_value(&json!({
            "workflow": {"action": 3, "id": "w1"},
            "updateManifest": json!({
                "updateType": "du/steps:1",
                "updateId": {"provider": "contoso", "name": "toaster", "version": "1.0"},
                "files": {"f1": {"fileName": "payload.bin"}},
                "instructions": {"steps": [
                    {"handler": "test/noop:1", "files": ["f1"]},
                    {"handler": "test/noop:1"}
                ]}
            })
            .to_string(),
            "updateManifestSignature": "",
            "fileUrls": {"f1": "http://updates.local/f1"}
        }))
        .unwrap();
        WorkflowHandle::from_envelope(&envelope).unwrap()
    }

    #[test]
    fn children_are_keyed_by_step_order_one_level_down() {
        let mut root = root_workflow();
        let child0 = root
            .inline_child(0, "test/noop:1", Value::Null, &["f1".to_string()], None)
            .unwrap();
        let child1 = root
            .inline_child(1, "test/noop:1", Value::Null, &[], None)
            .unwrap();
        root.children.push(child0);
        root.children.push(child1);

        assert_eq!(root.level, 0);
        assert_eq!(root.children[0].id, "0");
        assert_eq!(root.children[1].id, "1");
        assert_eq!(root.children[1].level, 1);
        assert_eq!(root.children[1].step_index, 1);
    }

    #[test]
    fn inline_child_resolves_its_file_slice() {
        let root = root_workflow();
        let child = root
            .inline_child(0, "test/noop:1", json!({"arg": 1}), &["f1".to_string()], None)
            .unwrap();
        assert_eq!(child.update_type(), "test/noop:1");
        assert_eq!(child.manifest.files.len(), 1);
        assert_eq!(child.manifest.files["f1"].file_name, "payload.bin");
        assert_eq!(child.handler_properties, json!({"arg": 1}));
    }

    #[test]
    fn inline_child_with_unknown_file_is_rejected() {
        let root = root_workflow();
        let err = root
            .inline_child(0, "test/noop:1", Value::Null, &["nope".to_string()], None)
            .unwrap_err();
        assert!(matches!(err, ParseError::BadFormat { .. }));
    }

    #[test]
    fn cancel_requests_reach_the_whole_subtree() {
        let mut root = root_workflow();
        let child = root
            .inline_child(0, "test/noop:1", Value::Null, &[], None)
            .unwrap();
        root.children.push(child);

        root.request_cancel();
        assert!(root.cancel_requested);
        assert!(root.children[0].cancel_requested);
    }

    #[test]
    fn reboot_outranks_agent_restart() {
        let mut requests = RestartRequests::default();
        requests.record(ResultCode::SUCCESS_AGENT_RESTART_REQUIRED);
        requests.record(ResultCode::SUCCESS_REBOOT_REQUIRED);
        assert!(requests.wants_reboot());
        assert!(requests.wants_agent_restart());
        // The caller resolves the tie in favour of the reboot
        assert!(!requests.any_immediate());
    }

    #[test]
    fn workflow_state_values_round_trip() {
        for state in [
            WorkflowState::Idle,
            WorkflowState::DownloadStarted,
            WorkflowState::DownloadSucceeded,
            WorkflowState::InstallStarted,
            WorkflowState::InstallSucceeded,
            WorkflowState::ApplyStarted,
            WorkflowState::DeploymentInProgress,
            WorkflowState::Failed,
        ] {
            assert_eq!(WorkflowState::from_value(state.value()), Some(state));
        }
        assert_eq!(WorkflowState::from_value(7), None);
    }

    #[test]
    fn cancel_token_is_sticky_across_clones() {
        let token = CancelToken::new();
        let observer = token.clone();
        assert!(!observer.is_requested());
        token.request();
        assert!(observer.is_requested());
    }
}
