//! Process-wide map from update-type identifier to a loaded content handler.
//!
//! Registrations are written once by the CLI (see [`registration`]) and read
//! back lazily here: on first lookup the recorded module digest is verified
//! against the module on disk and the handler is cached for the lifetime of
//! the process. Statically wired handlers (tests, builtin simulators) can be
//! injected up front and take precedence over on-disk registrations.

pub mod error;
pub mod handler;
pub mod registration;

use crate::downloader::ContentDownloader;
use crate::downloader::ExternalDownloaderCommand;
use crate::enumerator::ComponentEnumerator;
use crate::enumerator::ExternalEnumeratorCommand;
use crate::registry::error::RegistryError;
use crate::registry::handler::ContentHandler;
use crate::registry::handler::ExternalHandlerCommand;
use crate::registry::registration::load_registered_module;
use crate::registry::registration::ExtensionDirs;
use camino::Utf8Path;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use tracing::info;

pub struct HandlerRegistry {
    dirs: ExtensionDirs,
    loaded: Mutex<HashMap<String, Arc<dyn ContentHandler>>>,
}

impl HandlerRegistry {
    pub fn new(data_dir: &Utf8Path) -> Self {
        HandlerRegistry {
            dirs: ExtensionDirs::new(data_dir),
            loaded: Mutex::new(HashMap::new()),
        }
    }

    /// Wire a handler statically, bypassing the on-disk registration.
    pub fn insert(&self, update_type: &str, handler: Arc<dyn ContentHandler>) {
        self.loaded
            .lock()
            .expect("the handler cache is never poisoned")
            .insert(update_type.to_string(), handler);
    }

    /// The handler for an update type, loading and hash-checking the
    /// registered module on first use.
    pub async fn handler(
        &self,
        update_type: &str,
    ) -> Result<Arc<dyn ContentHandler>, RegistryError> {
        if let Some(handler) = self.cached(update_type) {
            return Ok(handler);
        }

        let record_path = self.dirs.content_handler_record(update_type);
        if !record_path.exists() {
            return Err(RegistryError::UnknownUpdateType {
                update_type: update_type.to_string(),
            });
        }
        let (_, module) = load_registered_module(&self.dirs, &record_path).await?;
        info!("Loaded the content handler for {update_type} from {module}");

        let handler: Arc<dyn ContentHandler> =
            Arc::new(ExternalHandlerCommand::new(update_type, module));
        self.loaded
            .lock()
            .expect("the handler cache is never poisoned")
            .insert(update_type.to_string(), handler.clone());
        Ok(handler)
    }

    /// The registered content downloader; exactly one must be registered.
    pub async fn content_downloader(&self) -> Result<Arc<dyn ContentDownloader>, RegistryError> {
        let record_path = self.dirs.content_downloader_record();
        if !record_path.exists() {
            return Err(RegistryError::NoContentDownloader);
        }
        let (_, module) = load_registered_module(&self.dirs, &record_path).await?;
        Ok(Arc::new(ExternalDownloaderCommand::new(module)))
    }

    /// The registered component enumerator, if any.
    pub async fn component_enumerator(
        &self,
    ) -> Result<Option<Arc<dyn ComponentEnumerator>>, RegistryError> {
        let record_path = self.dirs.component_enumerator_record();
        if !record_path.exists() {
            return Ok(None);
        }
        let (_, module) = load_registered_module(&self.dirs, &record_path).await?;
        Ok(Some(Arc::new(ExternalEnumeratorCommand::new(module))))
    }

    pub fn dirs(&self) -> &ExtensionDirs {
        &self.dirs
    }

    fn cached(&self, update_type: &str) -> Option<Arc<dyn ContentHandler>> {
        self.loaded
            .lock()
            .expect("the handler cache is never poisoned")
            .get(update_type)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::registration::register_extension;
    use crate::registry::registration::ExtensionKind;
    use assert_matches::assert_matches;
    use camino::Utf8PathBuf;

    fn utf8_path(path: &std::path::Path) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(path.to_owned()).unwrap()
    }

    fn executable_module(dir: &Utf8Path, name: &str) -> Utf8PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, "#!/bin/sh\ncat > /dev/null\necho '{\"code\": 200}'\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn an_unregistered_update_type_is_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let registry = HandlerRegistry::new(&utf8_path(dir.path()));

        assert_matches!(
            registry.handler("du/missing:1").await,
            Err(RegistryError::UnknownUpdateType { .. })
        );
    }

    #[tokio::test]
    async fn a_registered_handler_loads_and_is_cached() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = utf8_path(dir.path());
        let module = executable_module(&data_dir, "handler.sh");
        register_extension(
            &data_dir,
            &module,
            ExtensionKind::UpdateContentHandler,
            Some("du/swupdate:1"),
        )
        .await
        .unwrap();

        let registry = HandlerRegistry::new(&data_dir);
        registry.handler("du/swupdate:1").await.unwrap();

        // A second lookup works even once the registration is gone
        tokio::fs::remove_dir_all(registry.dirs().sources_dir())
            .await
            .unwrap();
        registry.handler("du/swupdate:1").await.unwrap();
    }

    #[tokio::test]
    async fn a_tampered_module_does_not_load() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = utf8_path(dir.path());
        let module = executable_module(&data_dir, "handler.sh");
        register_extension(
            &data_dir,
            &module,
            ExtensionKind::UpdateContentHandler,
            Some("du/swupdate:1"),
        )
        .await
        .unwrap();

        let registry = HandlerRegistry::new(&data_dir);
        tokio::fs::write(registry.dirs().sources_dir().join("handler.sh"), "tampered")
            .await
            .unwrap();

        assert_matches!(
            registry.handler("du/swupdate:1").await,
            Err(RegistryError::ModuleDigestMismatch { .. })
        );
    }

    #[tokio::test]
    async fn the_content_downloader_is_required() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = utf8_path(dir.path());
        let registry = HandlerRegistry::new(&data_dir);

        assert_matches!(
            registry.content_downloader().await,
            Err(RegistryError::NoContentDownloader)
        );

        let module = executable_module(&data_dir, "downloader.sh");
        register_extension(&data_dir, &module, ExtensionKind::ContentDownloader, None)
            .await
            .unwrap();
        registry.content_downloader().await.unwrap();
    }

    #[tokio::test]
    async fn the_component_enumerator_is_optional() {
        let dir = tempfile::tempdir().unwrap();
        let registry = HandlerRegistry::new(&utf8_path(dir.path()));
        assert!(registry.component_enumerator().await.unwrap().is_none());
    }
}
