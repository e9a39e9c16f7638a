use crate::config::DuConfig;
use crate::registry::registration::ExtensionDirs;
use camino::Utf8Path;
use camino::Utf8PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum HealthCheckError {
    #[error(transparent)]
    FromConfig(#[from] crate::config::ConfigError),

    #[error("No content downloader is registered (expected {record})")]
    NoContentDownloader { record: Utf8PathBuf },
}

/// Verify that the agent could start: the configuration parses and the
/// required extension registrations are present.
pub async fn health_check(
    config_dir: &Utf8Path,
    data_dir: &Utf8Path,
) -> Result<(), HealthCheckError> {
    let config = DuConfig::load(config_dir).await?;
    config.device_properties()?;

    let record = ExtensionDirs::new(data_dir).content_downloader_record();
    if !record.is_file() {
        return Err(HealthCheckError::NoContentDownloader { record });
    }
    Ok(())
}
