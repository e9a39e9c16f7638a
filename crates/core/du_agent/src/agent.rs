use crate::config::AgentEntry;
use crate::config::DeviceProperties;
use crate::config::DuConfig;
use crate::downloader::ContentDownloader;
use crate::downloader::DownloadError;
use crate::downloader::DownloadRequest;
use crate::downloader::ProgressSink;
use crate::enumerator::ComponentEnumerator;
use crate::error::AgentError;
use crate::orchestrator::UpdateOrchestrator;
use crate::registry::HandlerRegistry;
use crate::restart::RestartOps;
use crate::restart::SystemRestart;
use crate::transport::PropertyTransport;
use async_trait::async_trait;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use du_api::jws::RootKeyStore;
use std::sync::Arc;
use tracing::info;
use tracing::warn;

/// Where the agent finds its configuration and keeps its state.
#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub config_dir: Utf8PathBuf,
    pub data_dir: Utf8PathBuf,
}

/// The assembled agent: device identity, extension registry and the
/// collaborators the orchestrator drives. Built from the configuration, with
/// every seam overridable for tests and constrained builds.
pub struct Agent {
    device: DeviceProperties,
    data_dir: Utf8PathBuf,
    registry: Arc<HandlerRegistry>,
    enumerator: Option<Arc<dyn ComponentEnumerator>>,
    downloader: Arc<dyn ContentDownloader>,
    restart_ops: Arc<dyn RestartOps>,
    root_keys: RootKeyStore,
}

impl Agent {
    pub async fn try_new(config: AgentConfig) -> Result<Self, AgentError> {
        let du_config = DuConfig::load(&config.config_dir).await?;
        let device = du_config.device_properties()?;
        log_agent_entry(du_config.agents.first());

        let registry = Arc::new(HandlerRegistry::new(&config.data_dir));
        let downloader: Arc<dyn ContentDownloader> = match registry.content_downloader().await {
            Ok(downloader) => downloader,
            Err(err) => {
                // Deployments without reference steps can still proceed
                warn!("No usable content downloader: {err}");
                Arc::new(UnavailableDownloader)
            }
        };
        let enumerator = registry.component_enumerator().await?;
        if enumerator.is_some() {
            info!("A component enumerator is registered, deployments are component-aware");
        }

        Ok(Agent {
            device,
            data_dir: config.data_dir,
            registry,
            enumerator,
            downloader,
            restart_ops: Arc::new(SystemRestart::default()),
            root_keys: RootKeyStore::trusted(),
        })
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn with_downloader(mut self, downloader: Arc<dyn ContentDownloader>) -> Self {
        self.downloader = downloader;
        self
    }

    pub fn with_enumerator(mut self, enumerator: Arc<dyn ComponentEnumerator>) -> Self {
        self.enumerator = Some(enumerator);
        self
    }

    pub fn with_restart_ops(mut self, restart_ops: Arc<dyn RestartOps>) -> Self {
        self.restart_ops = restart_ops;
        self
    }

    pub fn with_root_keys(mut self, root_keys: RootKeyStore) -> Self {
        self.root_keys = root_keys;
        self
    }

    /// Run the agent over the given property transport until it closes.
    pub async fn run<T: PropertyTransport>(self, transport: T) -> Result<(), AgentError> {
        let orchestrator = UpdateOrchestrator::new(
            self.device,
            self.data_dir,
            self.registry,
            self.enumerator,
            self.downloader,
            self.restart_ops,
            self.root_keys,
            transport,
        );
        orchestrator.run().await
    }
}

fn log_agent_entry(entry: Option<&AgentEntry>) {
    if let Some(entry) = entry {
        info!(
            "Running as agent {:?} with a {} connection",
            entry.name, entry.connection_source.connection_type
        );
    }
}

/// Stands in when no content downloader is registered: every download of a
/// detached manifest fails, host-level deployments are unaffected.
#[derive(Debug)]
struct UnavailableDownloader;

#[async_trait]
impl ContentDownloader for UnavailableDownloader {
    async fn download(
        &self,
        request: &DownloadRequest,
        _dest: &Utf8Path,
        _progress: Option<&ProgressSink>,
    ) -> Result<(), DownloadError> {
        Err(DownloadError::Failed {
            url: request.url.clone(),
            reason: "no content downloader is registered".to_string(),
        })
    }
}
