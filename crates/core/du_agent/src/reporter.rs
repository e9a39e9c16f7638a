//! Serializes workflow state into the nested reported-property document and
//! the acknowledgements sent back over the property channel.
//!
//! All documents are property payloads: state documents and the one-shot
//! startup message live under the `agent` key, acknowledgements of desired
//! properties under the `service` key.

use crate::config::DeviceProperties;
use du_api::envelope::ack_echo;
use du_api::DesiredAction;
use du_api::update_id::UpdateId;
use du_api::UpdateResult;
use du_api::WorkflowHandle;
use du_api::WorkflowState;
use serde_json::json;
use serde_json::Map;
use serde_json::Value;

pub struct Reporter {
    device: DeviceProperties,
    last_reported_state: Option<WorkflowState>,
    suppressed: bool,
}

impl Reporter {
    pub fn new(device: DeviceProperties) -> Self {
        Reporter {
            device,
            last_reported_state: None,
            suppressed: false,
        }
    }

    /// The last state the control plane saw, for duplicate suppression.
    pub fn last_reported_state(&self) -> Option<WorkflowState> {
        self.last_reported_state
    }

    /// Stop emitting state documents: a reboot or agent restart is underway
    /// and the back-end must not observe a transient state.
    pub fn suppress(&mut self) {
        self.suppressed = true;
    }

    /// The one-shot startup message carrying the device identity.
    pub fn startup_document(&self) -> Value {
        let mut device_properties = Map::new();
        device_properties.insert(
            "manufacturer".to_string(),
            self.device.manufacturer.clone().into(),
        );
        device_properties.insert("model".to_string(), self.device.model.clone().into());
        device_properties.insert(
            "contractModelId".to_string(),
            self.device.contract_model_id.into(),
        );
        device_properties.insert("aduVer".to_string(), self.device.agent_version.into());
        for (name, value) in &self.device.additional {
            device_properties.insert(name.clone(), value.clone().into());
        }
        json!({
            "agent": {
                "deviceProperties": device_properties,
                "compatPropertyNames": self.device.compat_property_names,
            }
        })
    }

    /// Acknowledge a desired-property delivery, echoing the envelope with
    /// the signature and the file urls stripped.
    pub fn ack_document(&self, envelope: &Value, version: i64) -> Value {
        json!({
            "service": {
                "status": 200,
                "version": version,
                "value": ack_echo(envelope),
            }
        })
    }

    /// The nested state document for a workflow, or `None` while reporting
    /// is suppressed. `installed_update_id` is only carried on the
    /// idle-after-success transition.
    pub fn state_document(
        &mut self,
        workflow: &WorkflowHandle,
        installed_update_id: Option<&UpdateId>,
    ) -> Option<Value> {
        if self.suppressed {
            return None;
        }
        self.last_reported_state = Some(workflow.state);

        let mut agent = Map::new();
        agent.insert("state".to_string(), json!(workflow.state.value()));
        let mut workflow_echo = Map::new();
        workflow_echo.insert("action".to_string(), json!(workflow.action.value()));
        workflow_echo.insert("id".to_string(), workflow.id.clone().into());
        agent.insert("workflow".to_string(), Value::Object(workflow_echo));
        if let Some(update_id) = installed_update_id {
            agent.insert(
                "installedUpdateId".to_string(),
                update_id.serialized().into(),
            );
        }
        agent.insert(
            "lastInstallResult".to_string(),
            install_result(workflow),
        );
        Some(json!({"agent": agent}))
    }

    /// An idle document with no workflow tree behind it, for cancellations
    /// acknowledged without an active deployment.
    pub fn idle_document(&mut self, workflow_id: &str) -> Option<Value> {
        if self.suppressed {
            return None;
        }
        self.last_reported_state = Some(WorkflowState::Idle);
        Some(json!({
            "agent": {
                "state": WorkflowState::Idle.value(),
                "workflow": {
                    "action": DesiredAction::Cancel.value(),
                    "id": workflow_id,
                },
            }
        }))
    }

    /// A failure document for input that never became a workflow, e.g. a
    /// tampered or malformed envelope.
    pub fn rejection_document(
        &mut self,
        workflow_id: Option<&str>,
        action: Option<u64>,
        result: &UpdateResult,
    ) -> Option<Value> {
        if self.suppressed {
            return None;
        }
        self.last_reported_state = Some(WorkflowState::Failed);
        Some(json!({
            "agent": {
                "state": WorkflowState::Failed.value(),
                "workflow": {
                    "action": action,
                    "id": workflow_id.unwrap_or_default(),
                },
                "lastInstallResult": {
                    "updateInstallResult": result_entry(result),
                },
            }
        }))
    }
}

fn install_result(workflow: &WorkflowHandle) -> Value {
    let mut install_result = Map::new();
    install_result.insert(
        "updateInstallResult".to_string(),
        result_entry(&workflow.result),
    );

    if workflow.is_composite() {
        // Stale per-leaf results are discarded by the back-end on null
        let bundled = if workflow.state == WorkflowState::DownloadStarted {
            Value::Null
        } else {
            let mut bundled = Map::new();
            for child in &workflow.children {
                // No ':' or '-' in property map keys, hence leaf_<index>
                bundled.insert(
                    format!("leaf_{}", child.step_index),
                    result_entry(&child.result),
                );
            }
            Value::Object(bundled)
        };
        install_result.insert("bundledUpdates".to_string(), bundled);
    }
    Value::Object(install_result)
}

fn result_entry(result: &UpdateResult) -> Value {
    json!({
        "resultCode": result.code,
        "extendedResultCode": result.extended_code,
        "resultDetails": result.details,
    })
}
