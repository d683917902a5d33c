//! Idempotent persistence of downloaded registry documents.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

pub const CRATE_NAME: &str = "gsmirror-store";

/// Extensions persisted byte-for-byte.
const BINARY_EXTENSIONS: [&str; 3] = ["pdf", "docx", "xlsx"];
/// Extensions decoded as UTF-8 text before writing.
const TEXT_EXTENSIONS: [&str; 1] = ["csv"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Binary,
    Text,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unsupported file type for `{0}`")]
    UnsupportedFileType(String),
    #[error("file `{file}` is not valid UTF-8 text")]
    NonUtf8Text { file: String },
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Route a file name by extension. Unknown extensions are an
/// [`StoreError::UnsupportedFileType`]; callers skip those with a warning
/// rather than failing the record.
pub fn classify_file(file_name: &str) -> Result<FileKind, StoreError> {
    let extension = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    if BINARY_EXTENSIONS.contains(&extension.as_str()) {
        Ok(FileKind::Binary)
    } else if TEXT_EXTENSIONS.contains(&extension.as_str()) {
        Ok(FileKind::Text)
    } else {
        Err(StoreError::UnsupportedFileType(file_name.to_string()))
    }
}

/// Flat directory of downloaded documents, file names taken verbatim from the
/// upstream manifest. Writes are atomic (temp file + rename) so a re-run over
/// the same upstream bytes leaves previously written files byte-identical.
#[derive(Debug, Clone)]
pub struct DocumentStore {
    root: PathBuf,
}

impl DocumentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the output directory. Safe to call on every run.
    pub async fn ensure_root(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.root).await.map_err(|source| StoreError::Io {
            path: self.root.clone(),
            source,
        })
    }

    /// Persist one document, choosing binary or text mode by extension.
    /// Collisions on file name are last-write-wins.
    pub async fn write_document(
        &self,
        file_name: &str,
        bytes: &[u8],
    ) -> Result<PathBuf, StoreError> {
        let kind = classify_file(file_name)?;
        let target = self.root.join(file_name);

        let payload: Vec<u8> = match kind {
            FileKind::Binary => bytes.to_vec(),
            FileKind::Text => String::from_utf8(bytes.to_vec())
                .map_err(|_| StoreError::NonUtf8Text {
                    file: file_name.to_string(),
                })?
                .into_bytes(),
        };

        let temp_path = self.root.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|source| StoreError::Io {
                path: temp_path.clone(),
                source,
            })?;
        if let Err(source) = async {
            file.write_all(&payload).await?;
            file.flush().await
        }
        .await
        {
            drop(file);
            let _ = fs::remove_file(&temp_path).await;
            return Err(StoreError::Io {
                path: temp_path,
                source,
            });
        }
        drop(file);

        match fs::rename(&temp_path, &target).await {
            Ok(()) => {
                tracing::debug!(file = file_name, bytes = payload.len(), "stored document");
                Ok(target)
            }
            Err(source) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(StoreError::Io {
                    path: target,
                    source,
                })
            }
        }
    }
}
