//! Named, durable storage for indices and collections.
//!
//! A [`NamedStore`] keeps one JSON file per entity (`<dir>/<name>.json`).
//! Writes go to a hidden temp file in the same directory and are renamed into
//! place, so [`list_names`](NamedStore::list_names) and
//! [`load`](NamedStore::load) only ever see complete records.
//!
//! | Store | Entity | Directory |
//! |-------|--------|-----------|
//! | [`IndexStore`] | [`VectorIndex`] | `storage.indices_dir` |
//! | [`RouterStore`] | [`CompositeRouter`] | `storage.collections_dir` |

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::{DocGraphError, Result};
use crate::index::VectorIndex;
use crate::router::CompositeRouter;

const EXTENSION: &str = "json";

/// What `save` does when the name is already taken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverwritePolicy {
    /// Atomically replace the existing record.
    #[default]
    Replace,
    /// Fail with [`DocGraphError::NameCollision`].
    Reject,
}

pub type IndexStore = NamedStore<VectorIndex>;
pub type RouterStore = NamedStore<CompositeRouter>;

/// Directory of named JSON records.
#[derive(Debug, Clone)]
pub struct NamedStore<T> {
    dir: PathBuf,
    kind: &'static str,
    policy: OverwritePolicy,
    _entity: PhantomData<fn() -> T>,
}

impl<T> NamedStore<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    pub fn new(dir: impl Into<PathBuf>, kind: &'static str, policy: OverwritePolicy) -> Self {
        Self {
            dir: dir.into(),
            kind,
            policy,
            _entity: PhantomData,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn policy(&self) -> OverwritePolicy {
        self.policy
    }

    /// Create the backing directory if needed.
    pub async fn init(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        Ok(())
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", name, EXTENSION))
    }

    /// Persist `entity` under `name`.
    pub async fn save(&self, entity: &T, name: &str) -> Result<()> {
        validate_name(name)?;
        self.init().await?;

        let target = self.path_for(name);
        let bytes = serde_json::to_vec(entity)?;
        let tmp = self
            .dir
            .join(format!(".{}.{}.tmp", name, Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, &bytes).await?;

        // A hard link fails when the name is taken.
        let placed = match self.policy {
            OverwritePolicy::Replace => tokio::fs::rename(&tmp, &target).await,
            OverwritePolicy::Reject => {
                let linked = tokio::fs::hard_link(&tmp, &target).await;
                let _ = tokio::fs::remove_file(&tmp).await;
                linked
            }
        };
        if let Err(e) = placed {
            let _ = tokio::fs::remove_file(&tmp).await;
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                return Err(DocGraphError::NameCollision {
                    kind: self.kind,
                    name: name.to_string(),
                });
            }
            return Err(e.into());
        }

        tracing::debug!(kind = self.kind, %name, bytes = bytes.len(), "saved record");
        Ok(())
    }

    /// Load the record stored under `name`.
    pub async fn load(&self, name: &str) -> Result<T> {
        validate_name(name)?;
        let path = self.path_for(name);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DocGraphError::not_found(self.kind, name));
            }
            Err(e) => return Err(e.into()),
        };
        // Large indices take a while to parse.
        let entity = tokio::task::spawn_blocking(move || serde_json::from_slice::<T>(&bytes))
            .await
            .map_err(|e| DocGraphError::Provider(anyhow::anyhow!("load task failed: {}", e)))??;
        Ok(entity)
    }

    pub async fn exists(&self, name: &str) -> Result<bool> {
        validate_name(name)?;
        Ok(tokio::fs::try_exists(self.path_for(name)).await?)
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        match tokio::fs::remove_file(self.path_for(name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(DocGraphError::not_found(self.kind, name))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Names of all completed records, sorted.
    pub async fn list_names(&self) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if !stem.starts_with('.') && entry.file_type().await?.is_file() {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Names become file stems, so they must be plain and path-free.
pub fn validate_name(name: &str) -> Result<()> {
    let ok = !name.trim().is_empty()
        && name.len() <= 128
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, ' ' | '_' | '-' | '.'));
    if ok {
        Ok(())
    } else {
        Err(DocGraphError::InvalidName(name.to_string()))
    }
}
