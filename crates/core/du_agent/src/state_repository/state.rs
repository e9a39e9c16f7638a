use crate::state_repository::error::StateError;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use du_api::update_id::UpdateId;
use du_api::workflow::AgentRestartState;
use du_api::workflow::SystemRebootState;
use du_api::UpdateResult;
use du_api::WorkflowState;
use du_utils::fs::atomically_write_file;
use du_utils::fs::create_dirs;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tokio::fs;

const SNAPSHOT_FILE_NAME: &str = "workflow-state.json";

/// The minimal snapshot written before a reboot or agent restart, and
/// consulted by the startup reconciler.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSnapshot {
    pub workflow_id: String,
    /// Last state the deployment reached before the restart, the resume point.
    pub current_step: WorkflowState,
    pub last_result: UpdateResult,
    pub system_reboot_state: SystemRebootState,
    pub agent_restart_state: AgentRestartState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_update_id: Option<UpdateId>,
    pub work_folder: Utf8PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_reported_json: Option<Value>,
}

/// Load/store/clear of the snapshot file under the agent data directory.
#[derive(Debug)]
pub struct StateRepository {
    path: Utf8PathBuf,
    data_dir: Utf8PathBuf,
}

impl StateRepository {
    pub fn new(data_dir: impl Into<Utf8PathBuf>) -> Self {
        let data_dir = data_dir.into();
        StateRepository {
            path: data_dir.join(SNAPSHOT_FILE_NAME),
            data_dir,
        }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// The pending snapshot, if any. A missing file means no pending
    /// deployment and is not an error.
    pub async fn load(&self) -> Result<Option<WorkflowSnapshot>, StateError> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StateError::LoadFailed {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        let snapshot =
            serde_json::from_slice(&bytes).map_err(|source| StateError::Corrupted {
                path: self.path.clone(),
                source,
            })?;
        Ok(Some(snapshot))
    }

    pub async fn store(&self, snapshot: &WorkflowSnapshot) -> Result<(), StateError> {
        create_dirs(&self.data_dir).await?;
        let content = serde_json::to_vec_pretty(snapshot)?;
        atomically_write_file(&self.path, &content).await?;
        Ok(())
    }

    pub async fn clear(&self) -> Result<(), StateError> {
        match fs::remove_file(&self.path).await {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> WorkflowSnapshot {
        WorkflowSnapshot {
            workflow_id: "w5".to_string(),
            current_step: WorkflowState::InstallSucceeded,
            last_result: UpdateResult::success(),
            system_reboot_state: SystemRebootState::InProgress,
            agent_restart_state: AgentRestartState::None,
            expected_update_id: Some(UpdateId::new("contoso", "toaster", "2.0")),
            work_folder: "/var/lib/adu/downloads/w5".into(),
            pending_reported_json: None,
        }
    }

    fn repository(dir: &tempfile::TempDir) -> StateRepository {
        let data_dir = Utf8PathBuf::from_path_buf(dir.path().join("adu")).unwrap();
        StateRepository::new(data_dir)
    }

    #[tokio::test]
    async fn a_missing_snapshot_is_no_pending_operation() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(repository(&dir).load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn a_snapshot_survives_store_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let repository = repository(&dir);

        repository.store(&snapshot()).await.unwrap();
        assert_eq!(repository.load().await.unwrap(), Some(snapshot()));
    }

    #[tokio::test]
    async fn clear_removes_the_snapshot_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let repository = repository(&dir);

        repository.store(&snapshot()).await.unwrap();
        repository.clear().await.unwrap();
        assert_eq!(repository.load().await.unwrap(), None);
        repository.clear().await.unwrap();
    }

    #[tokio::test]
    async fn a_corrupted_snapshot_is_reported_as_such() {
        let dir = tempfile::tempdir().unwrap();
        let repository = repository(&dir);
        tokio::fs::create_dir_all(repository.path().parent().unwrap())
            .await
            .unwrap();
        tokio::fs::write(repository.path(), b"not json").await.unwrap();

        assert!(matches!(
            repository.load().await,
            Err(StateError::Corrupted { .. })
        ));
    }
}
