//! Detection of immutable action releases.
//!
//! An immutable release is published as an OCI artifact under
//! `ghcr.io/<owner>/<repo>:<version>`, so a manifest with the right
//! artifact type means the version can never be moved.

use std::{collections::HashMap, sync::LazyLock};

use futures::{StreamExt, stream};
use regex::Regex;

use crate::remote::Registry;

/// The artifact type of an immutable action package.
pub const IMMUTABLE_ACTION_ARTIFACT_TYPE: &str = "application/vnd.github.actions.package.v1+json";

/// How many registry lookups a batch check runs at once.
const BATCH_CONCURRENCY: usize = 8;

#[allow(clippy::unwrap_used)]
static SEMANTIC_VERSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^v[0-9]+\.[0-9]+\.[0-9]+$").unwrap());

/// Returns whether `version` is a full `vX.Y.Z` version.
pub fn is_semantic_version(version: &str) -> bool {
    SEMANTIC_VERSION.is_match(version)
}

/// The registry reference an action's release would be published under,
/// e.g. `actions/checkout@v4.1.0` becomes `ghcr.io/actions/checkout:4.1.0`.
pub fn package_reference(action: &str) -> Option<String> {
    let (path, version) = action.split_once('@')?;

    let mut segments = path.split('/');
    let (owner, repo) = (segments.next()?, segments.next()?);
    if owner.is_empty() || repo.is_empty() || version.is_empty() {
        return None;
    }

    let version = match is_semantic_version(version) {
        true => version.strip_prefix('v').unwrap_or(version),
        false => version,
    };

    Some(format!("ghcr.io/{owner}/{repo}:{version}").to_lowercase())
}

/// Checks whether `action` (`owner/repo[/path]@version`) is an immutable
/// release. Lookup failures are logged and treated as "no".
pub async fn is_immutable(action: &str, registry: &dyn Registry) -> bool {
    let Some(reference) = package_reference(action) else {
        return false;
    };

    match registry.get_manifest(&reference).await {
        Ok(Some(manifest)) => {
            manifest.artifact_type.as_deref() == Some(IMMUTABLE_ACTION_ARTIFACT_TYPE)
        }
        Ok(None) => false,
        Err(e) => {
            tracing::error!("couldn't check whether {action} is immutable: {e:#}");
            false
        }
    }
}

/// Runs [`is_immutable`] for each of `actions` concurrently.
pub async fn check_immutable_batch(
    actions: &[String],
    registry: &dyn Registry,
) -> HashMap<String, bool> {
    stream::iter(actions)
        .map(|action| async move { (action.clone(), is_immutable(action, registry).await) })
        .buffer_unordered(BATCH_CONCURRENCY)
        .collect()
        .await
}
