use camino::Utf8Path;
use camino::Utf8PathBuf;
use tokio::fs;
use tracing::debug;

const DOWNLOADS_DIR: &str = "downloads";

/// Per-workflow work folder: `<data>/downloads/<workflow_id>/`.
///
/// Created before the download phase starts and destroyed when the workflow
/// returns to idle, whatever the outcome.
#[derive(Clone, Debug)]
pub struct Sandbox {
    workflow_id: String,
    path: Utf8PathBuf,
}

impl Sandbox {
    pub fn new(data_dir: &Utf8Path, workflow_id: &str) -> Self {
        Sandbox {
            workflow_id: workflow_id.to_string(),
            path: data_dir.join(DOWNLOADS_DIR).join(workflow_id),
        }
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn file_path(&self, file_name: &str) -> Utf8PathBuf {
        self.path.join(file_name)
    }

    pub async fn create(&self) -> Result<(), std::io::Error> {
        du_utils::fs::create_dirs(&self.path).await
    }

    pub async fn destroy(&self) -> Result<(), std::io::Error> {
        debug!("Removing the work folder {}", self.path);
        match fs::remove_dir_all(&self.path).await {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }
}
