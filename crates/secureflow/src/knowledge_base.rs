//! Lookup of per-action security metadata.

use std::collections::HashMap;

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::instrument;
use workflow_models::action_metadata::ActionMetadata;

/// The file name each knowledge base entry is stored under.
pub const ENTRY_FILE: &str = "action-security.yml";

#[derive(Debug, Error)]
pub enum KnowledgeBaseError {
    #[error("couldn't read {path}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid action metadata in {path}")]
    Syntax {
        path: Utf8PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// A read-only store of action metadata.
#[async_trait]
pub trait KnowledgeBase: Send + Sync {
    /// Looks up an action by its `uses:` clause. The `@<ref>` suffix,
    /// casing, and redundant separators don't matter.
    async fn lookup(&self, action: &str) -> anyhow::Result<Option<ActionMetadata>>;
}

/// Normalizes an action reference to its knowledge base key, i.e.
/// `Owner/Repo//sub/@v1` becomes `owner/repo/sub`.
pub fn action_key(action: &str) -> String {
    let path = action.split_once('@').map_or(action, |(path, _)| path);

    path.split('/')
        .filter(|segment| !segment.is_empty())
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join("/")
}

/// A knowledge base laid out on disk as
/// `<root>/<owner>/<repo>[/<path>]/action-security.yml`.
pub struct DirectoryKnowledgeBase {
    root: Utf8PathBuf,
}

impl DirectoryKnowledgeBase {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn entry_path(&self, key: &str) -> Option<Utf8PathBuf> {
        // Keys come from workflow text; never let one walk out of the root.
        if key.is_empty() || key.split('/').any(|s| s == "." || s == "..") {
            return None;
        }

        Some(self.root.join(key).join(ENTRY_FILE))
    }

    async fn load(path: &Utf8Path) -> Result<Option<ActionMetadata>, KnowledgeBaseError> {
        let contents = match tokio::fs::read_to_string(path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(KnowledgeBaseError::Io {
                    path: path.into(),
                    source,
                });
            }
        };

        ActionMetadata::from_yaml(&contents)
            .map(Some)
            .map_err(|source| KnowledgeBaseError::Syntax {
                path: path.into(),
                source,
            })
    }
}

#[async_trait]
impl KnowledgeBase for DirectoryKnowledgeBase {
    #[instrument(skip(self))]
    async fn lookup(&self, action: &str) -> anyhow::Result<Option<ActionMetadata>> {
        let Some(path) = self.entry_path(&action_key(action)) else {
            tracing::debug!("{action} has no usable knowledge base key");
            return Ok(None);
        };

        Ok(Self::load(&path).await?)
    }
}

/// A knowledge base held entirely in memory.
#[derive(Default)]
pub struct InMemoryKnowledgeBase {
    entries: HashMap<String, ActionMetadata>,
}

impl InMemoryKnowledgeBase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) the entry for `action`.
    pub fn insert(&mut self, action: &str, metadata: ActionMetadata) {
        self.entries.insert(action_key(action), metadata);
    }

    /// Adds an entry from its `action-security.yml` source.
    pub fn insert_yaml(&mut self, action: &str, source: &str) -> Result<(), serde_yaml::Error> {
        self.insert(action, ActionMetadata::from_yaml(source)?);
        Ok(())
    }
}

#[async_trait]
impl KnowledgeBase for InMemoryKnowledgeBase {
    async fn lookup(&self, action: &str) -> anyhow::Result<Option<ActionMetadata>> {
        Ok(self.entries.get(&action_key(action)).cloned())
    }
}
