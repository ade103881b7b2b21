//! ==============================================================================
//! store.rs - json file storage
//! ==============================================================================
//!
//! purpose:
//!     every dataset lives in a flat json file under the data directory.
//!     this module is the only place that touches those files.
//!
//! rules:
//!     - a missing file reads as the empty dataset (T::default())
//!     - writes go to `<file>.tmp` first and are renamed into place
//!     - each file has its own async mutex; `update` holds it across the
//!       read-modify-write so two reports for the same bike cannot
//!       overwrite each other
//!
//! ==============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex as FileLock;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, StoreError>;

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io { path: path.to_path_buf(), source }
}

fn json_err(path: &Path) -> impl FnOnce(serde_json::Error) -> StoreError + '_ {
    move |source| StoreError::Json { path: path.to_path_buf(), source }
}

#[derive(Default)]
pub struct JsonStore {
    locks: Mutex<HashMap<PathBuf, Arc<FileLock<()>>>>,
}

impl JsonStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, path: &Path) -> Arc<FileLock<()>> {
        // poisoning only happens if a thread panicked while inserting; the map is still usable
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(path.to_path_buf()).or_default().clone()
    }

    pub async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    /// read a whole file, missing file = empty dataset
    pub async fn read<T>(&self, path: &Path) -> Result<T>
    where
        T: DeserializeOwned + Default,
    {
        let lock = self.lock_for(path);
        let _guard = lock.lock().await;
        read_unlocked(path).await
    }

    /// read a file that must exist, None when it does not
    pub async fn read_existing<T>(&self, path: &Path) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        let lock = self.lock_for(path);
        let _guard = lock.lock().await;
        match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(json_err(path)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err(path)(e)),
        }
    }

    pub async fn write<T>(&self, path: &Path, value: &T) -> Result<()>
    where
        T: Serialize,
    {
        let lock = self.lock_for(path);
        let _guard = lock.lock().await;
        write_unlocked(path, value).await
    }

    /// read-modify-write under the file lock
    ///
    /// the closure result is handed back to the caller; the file is written
    /// even when the closure left the data unchanged.
    pub async fn update<T, R, F>(&self, path: &Path, f: F) -> Result<R>
    where
        T: Serialize + DeserializeOwned + Default,
        F: FnOnce(&mut T) -> R,
    {
        let lock = self.lock_for(path);
        let _guard = lock.lock().await;
        let mut data: T = read_unlocked(path).await?;
        let out = f(&mut data);
        write_unlocked(path, &data).await?;
        Ok(out)
    }

    pub async fn ensure_dir(&self, path: &Path) -> Result<()> {
        tokio::fs::create_dir_all(path).await.map_err(io_err(path))
    }

    /// create the file with `default` content if it is not there yet
    pub async fn ensure_file<T>(&self, path: &Path, default: &T) -> Result<bool>
    where
        T: Serialize,
    {
        let lock = self.lock_for(path);
        let _guard = lock.lock().await;
        if tokio::fs::try_exists(path).await.map_err(io_err(path))? {
            return Ok(false);
        }
        write_unlocked(path, default).await?;
        info!("Created default file: {}", path.display());
        Ok(true)
    }

    /// file names in a directory, unsorted
    pub async fn list_dir(&self, path: &Path) -> Result<Vec<String>> {
        let mut entries = tokio::fs::read_dir(path).await.map_err(io_err(path))?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_err(path))? {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }
}

async fn read_unlocked<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    match tokio::fs::read(path).await {
        Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(T::default()),
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(json_err(path)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("{} not found, treating as empty", path.display());
            Ok(T::default())
        }
        Err(e) => Err(io_err(path)(e)),
    }
}

async fn write_unlocked<T>(path: &Path, value: &T) -> Result<()>
where
    T: Serialize,
{
    let bytes = serde_json::to_vec_pretty(value).map_err(json_err(path))?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, &bytes).await.map_err(io_err(&tmp))?;
    tokio::fs::rename(&tmp, path).await.map_err(io_err(path))?;
    Ok(())
}
