use camino::Utf8Path;
use camino::Utf8PathBuf;
use tokio::fs;
use tokio::io::AsyncWriteExt;

#[derive(Debug, thiserror::Error)]
pub enum AtomFileError {
    #[error("Writing the file {file:?} failed: {context}. source={source:?}")]
    WriteError {
        file: Utf8PathBuf,
        context: String,
        source: std::io::Error,
    },
}

trait ErrContext<T> {
    fn with_context(
        self,
        context: impl Fn() -> String,
        file: &Utf8Path,
    ) -> Result<T, AtomFileError>;
}

impl<T> ErrContext<T> for Result<T, std::io::Error> {
    fn with_context(
        self,
        context: impl Fn() -> String,
        file: &Utf8Path,
    ) -> Result<T, AtomFileError> {
        self.map_err(|source| AtomFileError::WriteError {
            file: file.to_owned(),
            context: context(),
            source,
        })
    }
}

/// Write a file atomically: the content goes to a temporary sibling first,
/// which is moved over the destination only once fully flushed to disk.
///
/// Readers therefore observe either the previous content or the new one,
/// never a truncated file, even across a power cut.
pub async fn atomically_write_file(
    dest: impl AsRef<Utf8Path>,
    content: &[u8],
) -> Result<(), AtomFileError> {
    let dest = dest.as_ref();
    let tempfile = tmp_sibling(dest);

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tempfile)
        .await
        .with_context(|| format!("could not create the temporary file {tempfile:?}"), dest)?;

    let write_fully = async {
        file.write_all(content).await?;
        file.flush().await?;
        file.sync_all().await?;
        fs::rename(&tempfile, dest).await
    };

    if let Err(source) = write_fully.await {
        let _ = fs::remove_file(&tempfile).await;
        return Err(AtomFileError::WriteError {
            file: dest.to_owned(),
            context: format!("could not persist the temporary file {tempfile:?}"),
            source,
        });
    }

    // The rename itself has to reach the disk too
    let dir = fs::File::open(parent_dir(dest))
        .await
        .with_context(|| "could not open the parent directory".to_string(), dest)?;
    dir.sync_all()
        .await
        .with_context(|| "could not sync the parent directory".to_string(), dest)?;

    Ok(())
}

/// Create a directory and all of its parents, tolerating concurrent creation.
pub async fn create_dirs(dir: impl AsRef<Utf8Path>) -> Result<(), std::io::Error> {
    match fs::create_dir_all(dir.as_ref()).await {
        Err(err) if err.kind() != std::io::ErrorKind::AlreadyExists => Err(err),
        _ => Ok(()),
    }
}

fn tmp_sibling(file: &Utf8Path) -> Utf8PathBuf {
    let name = file.file_name().unwrap_or("file");
    file.with_file_name(format!(".{name}.tmp"))
}

fn parent_dir(file: &Utf8Path) -> Utf8PathBuf {
    match file.parent() {
        None => Utf8Path::new("/").into(),
        Some(path) if path.as_str().is_empty() => Utf8Path::new(".").into(),
        Some(dir) => dir.into(),
    }
}
