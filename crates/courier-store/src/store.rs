//! Atomic JSON document persistence.
//!
//! One `JsonStore` per logical document. Every write serializes the whole
//! document to a temporary sibling file and renames it over the target, so
//! a reader only ever observes the last committed snapshot. Writers are
//! serialized per store; readers never take the writer lock.

use courier_core::error::CourierError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Read and deserialize a JSON document. `Ok(None)` means the file does not
/// exist; an unparseable file is a storage error, never a silent default.
pub(crate) async fn read_json<T: DeserializeOwned>(
    path: &Path,
) -> Result<Option<T>, CourierError> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(CourierError::Storage(format!(
                "failed to read {}: {e}",
                path.display()
            )))
        }
    };

    let doc = serde_json::from_str(&content).map_err(|e| {
        CourierError::Storage(format!("corrupt document {}: {e}", path.display()))
    })?;
    Ok(Some(doc))
}

/// Serialize a document and atomically replace the target file: stage the
/// full content to a `.tmp` sibling, then rename over the target.
pub(crate) async fn write_json_atomic<T: Serialize>(
    path: &Path,
    doc: &T,
) -> Result<(), CourierError> {
    let content = serde_json::to_string_pretty(doc)?;
    let tmp = path.with_extension("tmp");

    tokio::fs::write(&tmp, content.as_bytes())
        .await
        .map_err(|e| {
            CourierError::Storage(format!("failed to stage {}: {e}", tmp.display()))
        })?;
    tokio::fs::rename(&tmp, path).await.map_err(|e| {
        CourierError::Storage(format!("failed to commit {}: {e}", path.display()))
    })?;
    Ok(())
}

/// Durable store for one JSON document.
#[derive(Clone)]
pub struct JsonStore {
    path: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl JsonStore {
    /// Bind a store to a document path, creating parent directories.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, CourierError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                CourierError::Storage(format!("failed to create data dir: {e}"))
            })?;
        }
        info!("Document store bound to {}", path.display());
        Ok(Self {
            path,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the last committed snapshot. `Ok(None)` when the document has
    /// never been written.
    pub async fn load<T: DeserializeOwned>(&self) -> Result<Option<T>, CourierError> {
        read_json(&self.path).await
    }

    /// Read the document, initializing it on first use: when the file is
    /// absent, the default is persisted before it is returned.
    pub async fn load_or_init<T>(&self) -> Result<T, CourierError>
    where
        T: Serialize + DeserializeOwned + Default,
    {
        if let Some(doc) = read_json(&self.path).await? {
            return Ok(doc);
        }

        let _guard = self.write_lock.lock().await;
        // Another writer may have initialized while we waited for the lock.
        if let Some(doc) = read_json(&self.path).await? {
            return Ok(doc);
        }
        let doc = T::default();
        write_json_atomic(&self.path, &doc).await?;
        debug!("initialized {} with defaults", self.path.display());
        Ok(doc)
    }

    /// Replace the document with `doc`.
    pub async fn save<T: Serialize>(&self, doc: &T) -> Result<(), CourierError> {
        let _guard = self.write_lock.lock().await;
        write_json_atomic(&self.path, doc).await
    }

    /// Read-modify-write under the writer lock. The document is initialized
    /// from its default when absent.
    pub async fn update<T, R, F>(&self, f: F) -> Result<R, CourierError>
    where
        T: Serialize + DeserializeOwned + Default,
        F: FnOnce(&mut T) -> R,
    {
        let _guard = self.write_lock.lock().await;
        let mut doc: T = read_json(&self.path).await?.unwrap_or_default();
        let result = f(&mut doc);
        write_json_atomic(&self.path, &doc).await?;
        Ok(result)
    }

    pub async fn exists(&self) -> bool {
        tokio::fs::try_exists(&self.path).await.unwrap_or(false)
    }

    /// Remove the document. Missing files are fine.
    pub async fn delete(&self) -> Result<(), CourierError> {
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CourierError::Storage(format!(
                "failed to delete {}: {e}",
                self.path.display()
            ))),
        }
    }
}
