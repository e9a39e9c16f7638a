#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    FromConfig(#[from] crate::config::ConfigError),

    #[error(transparent)]
    FromState(#[from] crate::state_repository::error::StateError),

    #[error(transparent)]
    FromTransport(#[from] crate::transport::TransportError),

    #[error(transparent)]
    FromRegistry(#[from] crate::registry::error::RegistryError),

    #[error(transparent)]
    FromIo(#[from] std::io::Error),
}
