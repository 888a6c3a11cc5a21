//! Write-through cached JSON state file.
//!
//! Every mutation runs under one async mutex (a FIFO queue in tokio), is applied
//! to the in-memory copy, and is then persisted by writing a sibling temp file
//! and renaming it over the target. Readers never see a partially written file.

use serde::{Serialize, de::DeserializeOwned};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{AppError, AppResult};

#[derive(Debug)]
pub struct JsonDocument<T> {
    path: PathBuf,
    state: Mutex<T>,
}

impl<T> JsonDocument<T>
where
    T: Serialize + DeserializeOwned + Default + Send,
{
    /// Load `path`. A missing file is an empty document; an unreadable or
    /// malformed one is moved aside to `<name>.corrupt` and also starts empty.
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<T>(&bytes) {
                Ok(state) => state,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "malformed state file, starting empty");
                    quarantine(&path).await;
                    T::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => T::default(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable state file, starting empty");
                T::default()
            }
        };

        Self {
            path,
            state: Mutex::new(state),
        }
    }

    /// Read from the in-memory copy.
    pub async fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let guard = self.state.lock().await;
        f(&guard)
    }

    /// Mutate and persist.
    ///
    /// The in-memory copy keeps the mutation even when persisting fails, so the
    /// running process stays consistent with what it has already acted on.
    pub async fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> AppResult<R> {
        let mut guard = self.state.lock().await;
        let out = f(&mut guard);
        let bytes = serde_json::to_vec_pretty(&*guard)?;
        write_atomic(&self.path, &bytes)
            .await
            .map_err(|e| AppError::storage(format!("persisting {}: {}", self.path.display(), e)))?;
        Ok(out)
    }
}

/// Write `bytes` to a temp file beside `path`, fsync it, then rename over `path`.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> AppResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let tmp = sibling(path, ".tmp");
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&tmp, path).await?;
    debug!(path = %path.display(), bytes = bytes.len(), "state file written");
    Ok(())
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

async fn quarantine(path: &Path) {
    let aside = sibling(path, ".corrupt");
    if let Err(e) = tokio::fs::rename(path, &aside).await {
        warn!(path = %path.display(), error = %e, "could not move corrupt state file aside");
    }
}
