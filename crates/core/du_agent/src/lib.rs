//! Device-side update orchestration agent.
//!
//! The agent receives signed deployment envelopes over a bidirectional
//! property channel, drives the device through the phases required to
//! install them (process-deployment, download, install, apply) and reports
//! progress back so the control plane can track fleet state. Payload
//! handling is delegated to registered content-handler modules; this crate
//! is the orchestration core around them.

use camino::Utf8PathBuf;
use std::io::IsTerminal;

pub mod agent;
pub mod config;
pub mod downloader;
pub mod enumerator;
pub mod error;
pub mod executor;
pub mod health;
pub mod orchestrator;
pub mod reconciler;
pub mod registry;
pub mod reporter;
pub mod restart;
pub mod sandbox;
pub mod state_repository;
pub mod transport;

pub use agent::Agent;
pub use agent::AgentConfig;
pub use error::AgentError;

use registry::registration::ExtensionKind;

#[derive(Debug, clap::Parser)]
#[clap(
    name = clap::crate_name!(),
    version = clap::crate_version!(),
    about = clap::crate_description!()
)]
pub struct AgentOpt {
    /// Record an extension registration for the given module and exit
    #[clap(long, value_name = "PATH", requires = "extension_type")]
    pub register_extension: Option<Utf8PathBuf>,

    /// Kind of the extension being registered
    #[clap(long, value_enum, requires = "register_extension")]
    pub extension_type: Option<ExtensionKind>,

    /// Update-type identifier (vendor/name:major) of a content handler
    #[clap(long, value_name = "ID")]
    pub extension_id: Option<String>,

    /// Verify the configuration and required registrations, then exit
    #[clap(long)]
    pub health_check: bool,

    /// 0=debug, 1=info, 2=warn, 3=error
    #[clap(short = 'l', long, default_value_t = 1)]
    pub log_level: u8,

    /// File holding the transport connection string; opaque to the core
    #[clap(short = 'c', long, value_name = "FILE")]
    pub connection_file: Option<Utf8PathBuf>,

    /// Extra transport protocol arguments; opaque to the core
    #[clap(short = 'e', long = "protocol-args", value_name = "ARG")]
    pub protocol_args: Vec<String>,

    /// Configuration directory
    #[clap(long, default_value = config::DEFAULT_CONFIG_DIR)]
    pub config_dir: Utf8PathBuf,

    /// Data directory (sandboxes, extensions, persisted state)
    #[clap(long, default_value = config::DEFAULT_DATA_DIR)]
    pub data_dir: Utf8PathBuf,
}

pub async fn run(opt: AgentOpt) -> Result<(), anyhow::Error> {
    log_init(opt.log_level);

    if let Some(module) = &opt.register_extension {
        let kind = opt
            .extension_type
            .expect("clap enforces --extension-type alongside --register-extension");
        registry::registration::register_extension(
            &opt.data_dir,
            module,
            kind,
            opt.extension_id.as_deref(),
        )
        .await?;
        return Ok(());
    }

    if opt.health_check {
        health::health_check(&opt.config_dir, &opt.data_dir).await?;
        return Ok(());
    }

    let agent = Agent::try_new(AgentConfig {
        config_dir: opt.config_dir,
        data_dir: opt.data_dir,
    })
    .await?;
    agent.run(transport::StdioTransport::new()).await?;
    Ok(())
}

/// Install the tracing subscriber: stderr, UTC timestamps, `RUST_LOG`
/// overriding the CLI level.
fn log_init(log_level: u8) {
    let subscriber = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339());

    if std::env::var("RUST_LOG").is_ok() {
        subscriber
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .init();
        return;
    }

    let level = match log_level {
        0 => tracing::Level::DEBUG,
        1 => tracing::Level::INFO,
        2 => tracing::Level::WARN,
        _ => tracing::Level::ERROR,
    };
    subscriber.with_max_level(level).init();
}
