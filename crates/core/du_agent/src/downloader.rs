use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use rsa::sha2::Digest;
use rsa::sha2::Sha256;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

/// Default bound on a single download, retries included.
pub const DO_RETRY_TIMEOUT_DEFAULT: Duration = Duration::from_secs(600);

/// Progress of a transfer, as surfaced to the progress callback.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransferState {
    NotStarted,
    InProgress,
    Completed,
    Cancelled,
    Error,
}

/// `(workflow_id, file_id, state, bytes_transferred, bytes_total)`
pub type ProgressSink = Arc<dyn Fn(&str, &str, TransferState, u64, u64) + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("Downloading {url} failed: {reason}")]
    Failed { url: String, reason: String },

    #[error("Downloading {url} timed out after {}s", timeout.as_secs())]
    TimedOut { url: String, timeout: Duration },

    #[error("The downloaded file {path} does not match its declared sha256 digest")]
    DigestMismatch { path: Utf8PathBuf },

    #[error(transparent)]
    FromIo(#[from] std::io::Error),
}

/// What to fetch and where to put it.
#[derive(Clone, Debug)]
pub struct DownloadRequest {
    pub workflow_id: String,
    pub file_id: String,
    pub url: String,
    /// Digests keyed by hash type, base64 encoded; checked after the fetch.
    pub expected_hashes: HashMap<String, String>,
    pub timeout: Duration,
}

/// The content-downloader capability the agent delegates byte fetching to.
#[async_trait]
pub trait ContentDownloader: Send + Sync + std::fmt::Debug {
    async fn download(
        &self,
        request: &DownloadRequest,
        dest: &Utf8Path,
        progress: Option<&ProgressSink>,
    ) -> Result<(), DownloadError>;
}

/// A registered content-downloader module, driven as an external process:
/// `<module> download --url <url> --output <dest> --timeout-secs <n>`.
#[derive(Debug)]
pub struct ExternalDownloaderCommand {
    path: Utf8PathBuf,
}

impl ExternalDownloaderCommand {
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        ExternalDownloaderCommand { path: path.into() }
    }
}

#[async_trait]
impl ContentDownloader for ExternalDownloaderCommand {
    async fn download(
        &self,
        request: &DownloadRequest,
        dest: &Utf8Path,
        progress: Option<&ProgressSink>,
    ) -> Result<(), DownloadError> {
        let report = |state: TransferState, transferred: u64, total: u64| {
            if let Some(sink) = progress {
                sink(&request.workflow_id, &request.file_id, state, transferred, total);
            }
        };
        report(TransferState::NotStarted, 0, 0);

        let mut command = Command::new(&self.path);
        command
            .arg("download")
            .arg("--url")
            .arg(&request.url)
            .arg("--output")
            .arg(dest)
            .arg("--timeout-secs")
            .arg(request.timeout.as_secs().to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        debug!("Downloading {} to {dest}", request.url);
        report(TransferState::InProgress, 0, 0);

        let outcome = timeout(request.timeout, command.output()).await;
        let output = match outcome {
            Err(_) => {
                report(TransferState::Error, 0, 0);
                return Err(DownloadError::TimedOut {
                    url: request.url.clone(),
                    timeout: request.timeout,
                });
            }
            Ok(output) => output?,
        };
        if !output.status.success() {
            report(TransferState::Error, 0, 0);
            return Err(DownloadError::Failed {
                url: request.url.clone(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let size = check_digest(dest, &request.expected_hashes).await?;
        report(TransferState::Completed, size, size);
        Ok(())
    }
}

/// Verify the downloaded bytes against the declared sha256 digest, if one
/// was declared. Returns the file size.
async fn check_digest(
    path: &Utf8Path,
    expected_hashes: &HashMap<String, String>,
) -> Result<u64, DownloadError> {
    let content = tokio::fs::read(path).await?;
    if let Some(expected) = expected_hashes.get("sha256") {
        let actual = BASE64.encode(Sha256::digest(&content));
        if &actual != expected {
            return Err(DownloadError::DigestMismatch {
                path: path.to_owned(),
            });
        }
    }
    Ok(content.len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn utf8_path(path: &std::path::Path) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(path.to_owned()).unwrap()
    }

    /// A downloader module faked by a shell script that writes a fixed file.
    fn fake_module(dir: &Utf8Path, content: &str, exit_code: i32) -> Utf8PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("downloader.sh");
        let script = format!(
            "#!/bin/sh\nwhile [ $# -gt 0 ]; do\n  case $1 in\n    --output) out=$2; shift 2;;\n    *) shift;;\n  esac\ndone\nprintf '%s' '{content}' > \"$out\"\nexit {exit_code}\n"
        );
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn request(url: &str) -> DownloadRequest {
        DownloadRequest {
            workflow_id: "w1".to_string(),
            file_id: "f1".to_string(),
            url: url.to_string(),
            expected_hashes: HashMap::new(),
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn a_successful_download_reports_progress_to_completion() {
        let dir = tempfile::tempdir().unwrap();
        let dir = utf8_path(dir.path());
        let module = fake_module(&dir, "payload", 0);
        let dest = dir.join("payload.bin");

        let states: Arc<Mutex<Vec<TransferState>>> = Arc::new(Mutex::new(Vec::new()));
        let seen = states.clone();
        let sink: ProgressSink = Arc::new(move |_, _, state, _, _| {
            seen.lock().unwrap().push(state);
        });

        ExternalDownloaderCommand::new(module)
            .download(&request("http://updates.local/f1"), &dest, Some(&sink))
            .await
            .unwrap();

        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "payload");
        assert_eq!(
            *states.lock().unwrap(),
            vec![
                TransferState::NotStarted,
                TransferState::InProgress,
                TransferState::Completed
            ]
        );
    }

    #[tokio::test]
    async fn a_failing_module_is_a_download_failure() {
        let dir = tempfile::tempdir().unwrap();
        let dir = utf8_path(dir.path());
        let module = fake_module(&dir, "partial", 1);
        let dest = dir.join("payload.bin");

        let err = ExternalDownloaderCommand::new(module)
            .download(&request("http://updates.local/f1"), &dest, None)
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Failed { .. }));
    }

    #[tokio::test]
    async fn a_wrong_digest_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let dir = utf8_path(dir.path());
        let module = fake_module(&dir, "payload", 0);
        let dest = dir.join("payload.bin");

        let mut request = request("http://updates.local/f1");
        request
            .expected_hashes
            .insert("sha256".to_string(), "bm90IHRoZSBkaWdlc3Q=".to_string());

        let err = ExternalDownloaderCommand::new(module)
            .download(&request, &dest, None)
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::DigestMismatch { .. }));
    }
}
