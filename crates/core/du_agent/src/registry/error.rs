use camino::Utf8PathBuf;
use du_api::result::extended_code;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("No content handler is registered for the update type {update_type:?}")]
    UnknownUpdateType { update_type: String },

    #[error("No content downloader is registered")]
    NoContentDownloader,

    #[error("The registered module {path} does not match its recorded sha256 digest")]
    ModuleDigestMismatch { path: Utf8PathBuf },

    #[error("The registration record {path} is corrupted: {source}")]
    CorruptedRecord {
        path: Utf8PathBuf,
        source: serde_json::Error,
    },

    #[error("Registering an update content handler requires an --extension-id")]
    MissingExtensionId,

    #[error(transparent)]
    FromAtomFile(#[from] du_utils::fs::AtomFileError),

    #[error(transparent)]
    FromIo(#[from] std::io::Error),

    #[error(transparent)]
    FromSerdeJson(#[from] serde_json::Error),
}

impl RegistryError {
    pub fn extended_code(&self) -> u32 {
        extended_code::HANDLER_LOAD_FAILED
    }
}
