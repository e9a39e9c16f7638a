use async_trait::async_trait;
use camino::Utf8PathBuf;
use du_api::result::extended_code;
use du_api::CancelToken;
use du_api::ResultCode;
use du_api::UpdateResult;
use du_api::WorkflowHandle;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;
use tracing::warn;

/// A payload file as handed to a handler: the manifest entry joined with its
/// download url from the envelope.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepFile {
    pub file_id: String,
    pub file_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_uri: Option<String>,
    pub hashes: HashMap<String, String>,
}

/// Everything a handler needs to act on one step for one component.
#[derive(Clone, Debug)]
pub struct StepContext {
    pub workflow_id: String,
    pub step_id: String,
    pub update_type: String,
    pub work_folder: Utf8PathBuf,
    pub handler_properties: Value,
    pub installed_criteria: Option<String>,
    pub files: Vec<StepFile>,
    pub selected_components: Vec<Value>,
    /// Polled by cooperative handlers; sticky once requested.
    pub cancel: CancelToken,
}

impl StepContext {
    pub fn for_workflow(
        node: &WorkflowHandle,
        sandbox: &crate::sandbox::Sandbox,
        cancel: CancelToken,
    ) -> Self {
        let files = node
            .manifest
            .files
            .iter()
            .map(|(file_id, entity)| StepFile {
                file_id: file_id.clone(),
                file_name: entity.file_name.clone(),
                download_uri: node.file_urls.get(file_id).cloned(),
                hashes: entity.hashes.clone(),
            })
            .collect();
        StepContext {
            workflow_id: sandbox.workflow_id().to_string(),
            step_id: node.id.clone(),
            update_type: node.update_type().to_string(),
            work_folder: sandbox.path().to_owned(),
            handler_properties: node.handler_properties.clone(),
            installed_criteria: node.manifest.installed_criteria.clone(),
            files,
            selected_components: node.selected_components.clone(),
            cancel,
        }
    }

    /// The JSON document sent to an external handler module on stdin.
    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "workflowId": self.workflow_id,
            "stepId": self.step_id,
            "updateType": self.update_type,
            "workFolder": self.work_folder,
            "handlerProperties": self.handler_properties,
            "installedCriteria": self.installed_criteria,
            "files": self.files,
            "selectedComponents": self.selected_components,
            "cancelRequested": self.cancel.is_requested(),
        })
    }
}

/// The capability set every content handler provides.
///
/// Capabilities answer with an [`UpdateResult`] rather than an error: a
/// misbehaving handler is a deployment failure, never an agent failure.
/// `backup` and `restore` are optional and default to a no-op success.
#[async_trait]
pub trait ContentHandler: Send + Sync + std::fmt::Debug {
    async fn download(&self, context: &StepContext) -> UpdateResult;
    async fn install(&self, context: &StepContext) -> UpdateResult;
    async fn apply(&self, context: &StepContext) -> UpdateResult;
    async fn cancel(&self, context: &StepContext) -> UpdateResult;

    /// `Installed` or `NotInstalled`; never a failure aborting the workflow.
    async fn is_installed(&self, context: &StepContext) -> UpdateResult;

    async fn backup(&self, _context: &StepContext) -> UpdateResult {
        UpdateResult::success()
    }

    async fn restore(&self, _context: &StepContext) -> UpdateResult {
        UpdateResult::success()
    }
}

const DOWNLOAD: &str = "download";
const INSTALL: &str = "install";
const APPLY: &str = "apply";
const CANCEL: &str = "cancel";
const IS_INSTALLED: &str = "is-installed";
const BACKUP: &str = "backup";
const RESTORE: &str = "restore";

/// A registered handler module, driven as an external process: one
/// capability verb per invocation, the step context as JSON on stdin, an
/// `UpdateResult` as JSON on stdout.
#[derive(Debug)]
pub struct ExternalHandlerCommand {
    update_type: String,
    path: Utf8PathBuf,
}

impl ExternalHandlerCommand {
    pub fn new(update_type: impl Into<String>, path: impl Into<Utf8PathBuf>) -> Self {
        ExternalHandlerCommand {
            update_type: update_type.into(),
            path: path.into(),
        }
    }

    async fn invoke(&self, verb: &str, context: &StepContext) -> Result<UpdateResult, String> {
        debug!("{} {verb} (step {})", self.update_type, context.step_id);
        let mut child = Command::new(&self.path)
            .arg(verb)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| format!("could not launch the handler module: {err}"))?;

        if let Some(stdin) = child.stdin.as_mut() {
            stdin
                .write_all(context.to_json().to_string().as_bytes())
                .await
                .map_err(|err| format!("could not hand the step context over: {err}"))?;
        }
        drop(child.stdin.take());

        let output = child
            .wait_with_output()
            .await
            .map_err(|err| format!("the handler module was lost: {err}"))?;
        if !output.status.success() {
            return Err(format!(
                "the handler module exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        serde_json::from_slice(&output.stdout)
            .map_err(|err| format!("the handler module answered with no result: {err}"))
    }

    async fn capability(&self, verb: &str, context: &StepContext) -> UpdateResult {
        match self.invoke(verb, context).await {
            Ok(result) => result,
            Err(reason) => {
                warn!("{} {verb} failed: {reason}", self.update_type);
                UpdateResult::failure(extended_code::PHASE_FAILED, reason)
            }
        }
    }
}

#[async_trait]
impl ContentHandler for ExternalHandlerCommand {
    async fn download(&self, context: &StepContext) -> UpdateResult {
        self.capability(DOWNLOAD, context).await
    }

    async fn install(&self, context: &StepContext) -> UpdateResult {
        self.capability(INSTALL, context).await
    }

    async fn apply(&self, context: &StepContext) -> UpdateResult {
        self.capability(APPLY, context).await
    }

    async fn cancel(&self, context: &StepContext) -> UpdateResult {
        self.capability(CANCEL, context).await
    }

    async fn is_installed(&self, context: &StepContext) -> UpdateResult {
        match self.invoke(IS_INSTALLED, context).await {
            Ok(result) => result,
            Err(reason) => {
                // An undecided handler must not abort the workflow
                debug!("{} is-installed undecided: {reason}", self.update_type);
                UpdateResult {
                    code: ResultCode::NOT_INSTALLED,
                    extended_code: extended_code::NONE,
                    details: Some(reason),
                }
            }
        }
    }

    async fn backup(&self, context: &StepContext) -> UpdateResult {
        match self.invoke(BACKUP, context).await {
            Ok(result) => result,
            // Modules without the optional verb get the no-op default
            Err(_) => UpdateResult::success(),
        }
    }

    async fn restore(&self, context: &StepContext) -> UpdateResult {
        match self.invoke(RESTORE, context).await {
            Ok(result) => result,
            Err(_) => UpdateResult::success(),
        }
    }
}
