//! Interfaces to the remote services hardening consults.
//!
//! The concrete implementations live in [`crate::github`] and
//! [`crate::oci_registry`]; tests substitute in-memory fakes.

use async_trait::async_trait;

/// The object a tag points at.
#[derive(Clone, Debug, PartialEq)]
pub enum TagObject {
    /// A lightweight tag, pointing directly at a commit.
    Commit(String),
    /// An annotated tag object, which must be resolved to find its commit.
    Annotated(String),
}

/// A tag, as listed by [`SourceControl::list_matching_tags`].
#[derive(Clone, Debug, PartialEq)]
pub struct TagRef {
    /// The tag's name, without `refs/tags/`.
    pub name: String,
    pub object: TagObject,
}

/// Ref resolution and release lookup against a source-control host.
#[async_trait]
pub trait SourceControl: Send + Sync {
    /// Resolves a branch, tag, or commit to a full commit id.
    async fn resolve_ref(&self, owner: &str, repo: &str, git_ref: &str)
    -> anyhow::Result<Option<String>>;

    /// Lists tags whose names start with `prefix`, in the host's order.
    async fn list_matching_tags(
        &self,
        owner: &str,
        repo: &str,
        prefix: &str,
    ) -> anyhow::Result<Vec<TagRef>>;

    /// Returns the tag of the repository's latest release, if it has one.
    async fn latest_release(&self, owner: &str, repo: &str) -> anyhow::Result<Option<String>>;
}

/// An image manifest, reduced to the parts hardening looks at.
#[derive(Clone, Debug, PartialEq)]
pub struct Manifest {
    pub artifact_type: Option<String>,
    /// The manifest's content digest, e.g. `sha256:...`.
    pub digest: String,
}

/// Manifest lookup against a container registry.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Fetches the manifest for `reference` (`[registry/]name:tag`).
    async fn get_manifest(&self, reference: &str) -> anyhow::Result<Option<Manifest>>;
}
