//! One-shot extension registration, as driven by
//! `du-agent --register-extension <path> --extension-type <kind>`.
//!
//! A registration copies the module into `extensions/sources/` and records
//! its name, size and sha256 digest in a JSON file under the kind-specific
//! directory. The digest is re-checked every time the module is loaded.

use crate::registry::error::RegistryError;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use du_utils::fs::atomically_write_file;
use du_utils::fs::create_dirs;
use rsa::sha2::Digest;
use rsa::sha2::Sha256;
use serde::Deserialize;
use serde::Serialize;
use std::collections::HashMap;
use tracing::info;

const EXTENSIONS_DIR: &str = "extensions";
const SOURCES_DIR: &str = "sources";

/// The registrable extension kinds and their record locations.
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ExtensionKind {
    #[value(name = "contentDownloader")]
    ContentDownloader,
    #[value(name = "updateContentHandler")]
    UpdateContentHandler,
    #[value(name = "componentEnumerator")]
    ComponentEnumerator,
    #[value(name = "contentDownloadHandler")]
    ContentDownloadHandler,
}

/// `{fileName, sizeInBytes, hashes: {"sha256": …}, handlerId?}`
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationRecord {
    pub file_name: String,
    pub size_in_bytes: u64,
    pub hashes: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler_id: Option<String>,
}

/// Well-known locations of the extension records and module copies.
#[derive(Clone, Debug)]
pub struct ExtensionDirs {
    root: Utf8PathBuf,
}

impl ExtensionDirs {
    pub fn new(data_dir: &Utf8Path) -> Self {
        ExtensionDirs {
            root: data_dir.join(EXTENSIONS_DIR),
        }
    }

    pub fn sources_dir(&self) -> Utf8PathBuf {
        self.root.join(SOURCES_DIR)
    }

    pub fn content_downloader_record(&self) -> Utf8PathBuf {
        self.root.join("content_downloader").join("extension.json")
    }

    pub fn component_enumerator_record(&self) -> Utf8PathBuf {
        self.root.join("component_enumerator").join("extension.json")
    }

    pub fn content_handler_record(&self, update_type: &str) -> Utf8PathBuf {
        self.root
            .join("update_content_handlers")
            .join(sanitize_update_type(update_type))
            .join("content_handler.json")
    }

    pub fn download_handler_record(&self, handler_id: &str) -> Utf8PathBuf {
        self.root
            .join("download_handlers")
            .join(sanitize_update_type(handler_id))
            .join("download_handler.json")
    }

    fn record_path(
        &self,
        kind: ExtensionKind,
        extension_id: Option<&str>,
    ) -> Result<Utf8PathBuf, RegistryError> {
        match kind {
            ExtensionKind::ContentDownloader => Ok(self.content_downloader_record()),
            ExtensionKind::ComponentEnumerator => Ok(self.component_enumerator_record()),
            ExtensionKind::UpdateContentHandler => extension_id
                .map(|id| self.content_handler_record(id))
                .ok_or(RegistryError::MissingExtensionId),
            ExtensionKind::ContentDownloadHandler => extension_id
                .map(|id| self.download_handler_record(id))
                .ok_or(RegistryError::MissingExtensionId),
        }
    }
}

/// `vendor/name:major` mapped to a directory-safe `vendor_name_major`.
pub fn sanitize_update_type(update_type: &str) -> String {
    update_type
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect()
}

/// Record an extension registration: copy the module next to the other
/// sources and write its registration record. Re-registering the same module
/// produces the same record.
pub async fn register_extension(
    data_dir: &Utf8Path,
    module: &Utf8Path,
    kind: ExtensionKind,
    extension_id: Option<&str>,
) -> Result<Utf8PathBuf, RegistryError> {
    let dirs = ExtensionDirs::new(data_dir);
    let record_path = dirs.record_path(kind, extension_id)?;

    let content = tokio::fs::read(module).await?;
    let file_name = module
        .file_name()
        .ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a module file")
        })?
        .to_string();

    create_dirs(dirs.sources_dir()).await?;
    let installed = dirs.sources_dir().join(&file_name);
    atomically_write_file(&installed, &content).await?;
    copy_permissions(module, &installed).await?;

    let record = RegistrationRecord {
        file_name,
        size_in_bytes: content.len() as u64,
        hashes: HashMap::from([("sha256".to_string(), sha256_base64(&content))]),
        handler_id: extension_id.map(str::to_string),
    };
    let parent = record_path
        .parent()
        .expect("extension records live below the data directory");
    create_dirs(parent).await?;
    atomically_write_file(&record_path, &serde_json::to_vec_pretty(&record)?).await?;

    info!("Registered {module} as {record_path}");
    Ok(record_path)
}

/// Load a registration record and its hash-verified module path.
pub async fn load_registered_module(
    dirs: &ExtensionDirs,
    record_path: &Utf8Path,
) -> Result<(RegistrationRecord, Utf8PathBuf), RegistryError> {
    let content = tokio::fs::read(record_path).await?;
    let record: RegistrationRecord =
        serde_json::from_slice(&content).map_err(|source| RegistryError::CorruptedRecord {
            path: record_path.to_owned(),
            source,
        })?;

    let module = dirs.sources_dir().join(&record.file_name);
    let module_content = tokio::fs::read(&module).await?;
    let matches = record
        .hashes
        .get("sha256")
        .is_some_and(|declared| declared == &sha256_base64(&module_content));
    if !matches {
        return Err(RegistryError::ModuleDigestMismatch { path: module });
    }
    Ok((record, module))
}

fn sha256_base64(content: &[u8]) -> String {
    BASE64.encode(Sha256::digest(content))
}

async fn copy_permissions(from: &Utf8Path, to: &Utf8Path) -> Result<(), std::io::Error> {
    let permissions = tokio::fs::metadata(from).await?.permissions();
    tokio::fs::set_permissions(to, permissions).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use test_case::test_case;

    fn utf8_path(path: &std::path::Path) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(path.to_owned()).unwrap()
    }

    async fn write_module(dir: &Utf8Path, name: &str, content: &str) -> Utf8PathBuf {
        let path = dir.join(name);
        tokio::fs::write(&path, content).await.unwrap();
        path
    }

    #[test_case("du/swupdate:1", "du_swupdate_1")]
    #[test_case("contoso/motor-update:2", "contoso_motor-update_2")]
    #[test_case("a.b/c:1", "a.b_c_1")]
    fn update_types_map_to_directory_safe_names(update_type: &str, expected: &str) {
        assert_eq!(sanitize_update_type(update_type), expected);
    }

    #[tokio::test]
    async fn registration_writes_the_record_and_the_source_copy() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = utf8_path(dir.path());
        let module = write_module(&data_dir, "handler.sh", "#!/bin/sh\nexit 0\n").await;

        let record_path = register_extension(
            &data_dir,
            &module,
            ExtensionKind::UpdateContentHandler,
            Some("du/swupdate:1"),
        )
        .await
        .unwrap();

        assert!(record_path.ends_with("update_content_handlers/du_swupdate_1/content_handler.json"));
        let record: RegistrationRecord =
            serde_json::from_slice(&tokio::fs::read(&record_path).await.unwrap()).unwrap();
        assert_eq!(record.file_name, "handler.sh");
        assert_eq!(record.handler_id.as_deref(), Some("du/swupdate:1"));
        assert!(record.hashes.contains_key("sha256"));

        let dirs = ExtensionDirs::new(&data_dir);
        assert!(dirs.sources_dir().join("handler.sh").is_file());
    }

    #[tokio::test]
    async fn re_registration_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = utf8_path(dir.path());
        let module = write_module(&data_dir, "downloader.sh", "#!/bin/sh\nexit 0\n").await;

        let first =
            register_extension(&data_dir, &module, ExtensionKind::ContentDownloader, None)
                .await
                .unwrap();
        let first_record = tokio::fs::read(&first).await.unwrap();

        let second =
            register_extension(&data_dir, &module, ExtensionKind::ContentDownloader, None)
                .await
                .unwrap();
        let second_record = tokio::fs::read(&second).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first_record, second_record);
    }

    #[tokio::test]
    async fn handler_registration_requires_an_extension_id() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = utf8_path(dir.path());
        let module = write_module(&data_dir, "handler.sh", "#!/bin/sh\nexit 0\n").await;

        assert_matches!(
            register_extension(&data_dir, &module, ExtensionKind::UpdateContentHandler, None).await,
            Err(RegistryError::MissingExtensionId)
        );
    }

    #[tokio::test]
    async fn a_tampered_module_is_rejected_at_load() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = utf8_path(dir.path());
        let module = write_module(&data_dir, "handler.sh", "#!/bin/sh\nexit 0\n").await;

        let dirs = ExtensionDirs::new(&data_dir);
        let record_path = register_extension(
            &data_dir,
            &module,
            ExtensionKind::UpdateContentHandler,
            Some("du/swupdate:1"),
        )
        .await
        .unwrap();

        load_registered_module(&dirs, &record_path).await.unwrap();

        tokio::fs::write(dirs.sources_dir().join("handler.sh"), "tampered")
            .await
            .unwrap();
        assert_matches!(
            load_registered_module(&dirs, &record_path).await,
            Err(RegistryError::ModuleDigestMismatch { .. })
        );
    }
}
