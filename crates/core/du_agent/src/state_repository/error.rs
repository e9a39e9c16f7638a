use camino::Utf8PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("Could not read the snapshot {path}: {source}")]
    LoadFailed {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("The snapshot {path} is corrupted: {source}")]
    Corrupted {
        path: Utf8PathBuf,
        source: serde_json::Error,
    },

    #[error(transparent)]
    FromAtomFile(#[from] du_utils::fs::AtomFileError),

    #[error(transparent)]
    FromIo(#[from] std::io::Error),

    #[error(transparent)]
    FromSerdeJson(#[from] serde_json::Error),
}
