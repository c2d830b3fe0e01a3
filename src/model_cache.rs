//! Bounded, least-recently-used cache of per-user models.
//!
//! Models are persisted by the trainer at `<models.dir>/<user>/model.json`
//! and loaded lazily the first time a user asks for something. A missing
//! file means "no model trained yet" and is reported as `Ok(None)`; any
//! other read or decode failure is an error.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

use crate::traits::{Model, ModelLoader};

/// File name of a persisted model inside the user's directory.
pub const MODEL_FILE: &str = "model.json";

/// Where models come from when they are not cached.
#[async_trait]
pub trait ModelStore: Send + Sync {
    /// Load the model for `user`, or `Ok(None)` if none has been trained.
    async fn load(&self, user: &str) -> Result<Option<Arc<dyn Model>>>;
}

/// Reads model blobs from a directory tree keyed by user name.
pub struct FileModelStore {
    root: PathBuf,
    loader: Arc<dyn ModelLoader>,
}

impl FileModelStore {
    pub fn new(root: impl Into<PathBuf>, loader: Arc<dyn ModelLoader>) -> Self {
        Self {
            root: root.into(),
            loader,
        }
    }
}

#[async_trait]
impl ModelStore for FileModelStore {
    async fn load(&self, user: &str) -> Result<Option<Arc<dyn Model>>> {
        let path = model_path(&self.root, user)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read model: {}", path.display()))
            }
        };

        let model = self
            .loader
            .decode(&bytes)
            .with_context(|| format!("Failed to decode model: {}", path.display()))?;
        Ok(Some(model))
    }
}

/// Path of `user`'s model under `root`.
///
/// User names come from the chat network; anything that could escape the
/// model directory is rejected.
pub fn model_path(root: &Path, user: &str) -> Result<PathBuf> {
    check_user_dir_name(user)?;
    Ok(root.join(user).join(MODEL_FILE))
}

/// Reject user names that cannot be used as a single directory component.
pub fn check_user_dir_name(user: &str) -> Result<()> {
    if user.is_empty() || user == "." || user == ".." || user.contains(['/', '\\', '\0']) {
        bail!("invalid user name for a directory: {:?}", user);
    }
    Ok(())
}

/// Fixed-capacity LRU of loaded models, shared by all command tasks.
pub struct ModelCache {
    store: Box<dyn ModelStore>,
    entries: Mutex<LruCache<String, Arc<dyn Model>>>,
}

impl ModelCache {
    pub fn new(store: Box<dyn ModelStore>, capacity: NonZeroUsize) -> Self {
        Self {
            store,
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Cached model for `user`, loading it from the store on a miss.
    ///
    /// The store is read outside the lock so a slow disk never stalls other
    /// users' lookups; two concurrent misses for the same user may both
    /// load, and the second insert simply replaces the first.
    pub async fn get(&self, user: &str) -> Result<Option<Arc<dyn Model>>> {
        {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(model) = entries.get(user) {
                return Ok(Some(model.clone()));
            }
        }

        let Some(model) = self.store.load(user).await? else {
            return Ok(None);
        };

        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((evicted, _)) = entries.push(user.to_string(), model.clone()) {
            if evicted != user {
                debug!(user = %evicted, "evicted model from cache");
            }
        }
        Ok(Some(model))
    }

    /// Drop `user`'s cached model so the next lookup reloads it.
    pub fn invalidate(&self, user: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.pop(user);
    }

    /// Whether `user` is cached, without touching recency.
    pub fn contains(&self, user: &str) -> bool {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.contains(user)
    }

    pub fn len(&self) -> usize {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
