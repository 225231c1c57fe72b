use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use snafu::{ResultExt, ensure};

use super::KeyValueStore;
use super::error::{
    CreateDirectorySnafu, InvalidKeySnafu, RenameTempFileSnafu, StorageError, StorageResult,
    WriteFileSnafu,
};

const VALUE_FILE_EXTENSION: &str = "json";

/// Directory-backed store holding one file per key.
///
/// Writes go through a sibling temp file and a rename so a crash mid-write
/// leaves either the old or the new value on disk, never a torn one.
#[derive(Debug, Clone)]
pub struct FileKvStore {
    root: PathBuf,
}

impl FileKvStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn value_path(&self, key: &str) -> StorageResult<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(format!("{key}.{VALUE_FILE_EXTENSION}")))
    }
}

impl KeyValueStore for FileKvStore {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        let path = self.value_path(key)?;
        match std::fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents)),
            Err(source) if source.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StorageError::ReadFile {
                stage: "file-kv-get",
                path,
                source,
            }),
        }
    }

    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        let path = self.value_path(key)?;
        std::fs::create_dir_all(&self.root).context(CreateDirectorySnafu {
            stage: "file-kv-create-root",
            path: self.root.clone(),
        })?;

        let temp_path = path.with_extension(format!("{VALUE_FILE_EXTENSION}.tmp"));
        std::fs::write(&temp_path, value).context(WriteFileSnafu {
            stage: "file-kv-write-temporary",
            path: temp_path.clone(),
        })?;
        std::fs::rename(&temp_path, &path).context(RenameTempFileSnafu {
            stage: "file-kv-rename-temporary",
            from: temp_path,
            to: path.clone(),
        })?;

        tracing::trace!(key, path = ?path, bytes = value.len(), "wrote storage value");
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        let path = self.value_path(key)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(source) if source.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StorageError::RemoveFile {
                stage: "file-kv-remove",
                path,
                source,
            }),
        }
    }
}

// Keys become file names, so anything that could escape the root is refused.
fn validate_key(key: &str) -> StorageResult<()> {
    ensure!(
        !key.is_empty(),
        InvalidKeySnafu {
            stage: "file-kv-validate-key",
            key,
            details: "key must not be empty",
        }
    );
    ensure!(
        !key.starts_with('.'),
        InvalidKeySnafu {
            stage: "file-kv-validate-key",
            key,
            details: "key must not start with '.'",
        }
    );
    ensure!(
        key.chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.')),
        InvalidKeySnafu {
            stage: "file-kv-validate-key",
            key,
            details: "key may only contain ASCII letters, digits, '-', '_' and '.'",
        }
    );
    Ok(())
}
