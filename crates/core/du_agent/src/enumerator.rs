use async_trait::async_trait;
use camino::Utf8PathBuf;
use serde_json::Value;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

#[derive(Debug, thiserror::Error)]
pub enum EnumeratorError {
    #[error("The component enumerator answered with {answer}, not a component array")]
    NotAnArray { answer: String },

    #[error("The component enumerator failed: {reason}")]
    Failed { reason: String },

    #[error(transparent)]
    FromIo(#[from] std::io::Error),
}

/// Optional capability enumerating the sub-components of the device that
/// match a compatibility property set.
///
/// An empty answer means a reference step has no target on this device.
/// When no enumerator is registered at all, deployments are host-level.
#[async_trait]
pub trait ComponentEnumerator: Send + Sync {
    async fn select_components(&self, compatibility: &Value)
        -> Result<Vec<Value>, EnumeratorError>;
}

/// A registered component-enumerator module, driven as an external process:
/// the compatibility set goes to stdin, `{"components": [...]}` is expected
/// on stdout.
#[derive(Debug)]
pub struct ExternalEnumeratorCommand {
    path: Utf8PathBuf,
}

impl ExternalEnumeratorCommand {
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        ExternalEnumeratorCommand { path: path.into() }
    }
}

#[async_trait]
impl ComponentEnumerator for ExternalEnumeratorCommand {
    async fn select_components(
        &self,
        compatibility: &Value,
    ) -> Result<Vec<Value>, EnumeratorError> {
        let mut child = Command::new(&self.path)
            .arg("select-components")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(stdin) = child.stdin.as_mut() {
            stdin.write_all(compatibility.to_string().as_bytes()).await?;
        }
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(EnumeratorError::Failed {
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let answer: Value =
            serde_json::from_slice(&output.stdout).map_err(|_| EnumeratorError::NotAnArray {
                answer: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            })?;
        parse_components(&answer)
    }
}

/// Extract the component array from an enumerator answer.
pub fn parse_components(answer: &Value) -> Result<Vec<Value>, EnumeratorError> {
    match answer.get("components").and_then(Value::as_array) {
        Some(components) => Ok(components.clone()),
        None => Err(EnumeratorError::NotAnArray {
            answer: answer.to_string(),
        }),
    }
}
