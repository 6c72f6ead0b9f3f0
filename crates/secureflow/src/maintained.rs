//! Substitution of unmaintained actions with maintained forks.

use anyhow::{Context as _, anyhow};
use camino::Utf8Path;
use indexmap::IndexMap;
use serde::Deserialize;
use workflow_models::workflow::Workflow;
use yamlanchor::Document;

use crate::{pipeline::StageError, remote::SourceControl};

/// Maps an action's `owner/repo[/path]` to its maintained replacement.
pub type MaintainedActions = IndexMap<String, String>;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MaintainedEntry {
    name: String,
    forked_from: ForkedFrom,
}

#[derive(Deserialize)]
struct ForkedFrom {
    name: String,
}

/// Reads a list of `{"name": ..., "forkedFrom": {"name": ...}}` entries
/// into a map from the original action to its fork.
pub fn load_maintained_actions(json: &str) -> Result<MaintainedActions, serde_json::Error> {
    let entries: Vec<MaintainedEntry> = serde_json::from_str(json)?;

    Ok(entries
        .into_iter()
        .map(|entry| (entry.forked_from.name, entry.name))
        .collect())
}

/// Like [`load_maintained_actions`], from a file.
pub fn load_maintained_actions_file(path: &Utf8Path) -> anyhow::Result<MaintainedActions> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("couldn't read {path}"))?;
    load_maintained_actions(&contents).with_context(|| format!("invalid maintained actions in {path}"))
}

/// Reduces a release tag to its major version, keeping any `v` prefix:
/// `v5.5.5` becomes `v5`.
pub fn major_version(tag: &str) -> &str {
    tag.split_once('.').map_or(tag, |(major, _)| major)
}

/// Rewrites every step that uses a key of `map` to use its replacement
/// at the replacement's latest major release.
///
/// Unlike pinning, a failed release lookup fails the whole stage.
pub async fn replace_maintained_actions(
    text: &str,
    releases: &dyn SourceControl,
    map: &MaintainedActions,
) -> Result<(String, bool), StageError> {
    if map.is_empty() {
        return Ok((text.to_string(), false));
    }

    let workflow = Workflow::from_yaml(text)?;

    // (job, step index, replacement)
    let mut targets = vec![];
    for (name, job) in &workflow.jobs {
        if job.calls_reusable_workflow() {
            continue;
        }

        for (index, step) in job.steps.iter().enumerate() {
            let Some(uses) = step.uses() else {
                continue;
            };
            let path = uses.split_once('@').map_or(uses, |(path, _)| path);
            if let Some(replacement) = map.get(path) {
                targets.push((name.as_str(), index, replacement.as_str()));
            }
        }
    }

    let mut versions: IndexMap<&str, String> = IndexMap::new();
    for (_, _, replacement) in &targets {
        if versions.contains_key(replacement) {
            continue;
        }
        let version = latest_major(releases, replacement).await?;
        versions.insert(replacement, version);
    }

    let mut output = text.to_string();
    for (job, index, replacement) in &targets {
        let doc = Document::new(output.as_str())?;
        let step = doc
            .root()?
            .get("jobs")
            .and_then(|jobs| jobs.get(job))
            .and_then(|job| job.get("steps"))
            .and_then(|steps| steps.items().get(*index).copied());
        let Some((step, uses)) = step.and_then(|step| step.get("uses").map(|uses| (step, uses))) else {
            return Err(StageError::MissingStructure(format!(
                "jobs.{job}.steps[{index}].uses"
            )));
        };

        let version = &versions[replacement];
        let updated = format!("{replacement}@{version}");
        tracing::debug!("replacing {} with {updated}", uses.text());

        // A block step's trailing version comment goes stale with the
        // old reference; a flow step has to keep the rest of its line.
        output = match step.is_flow() {
            true => yamlsplice::replace_at(&output, uses.anchor, uses.text(), &updated)?,
            false => yamlsplice::replace_from_column(&output, uses.anchor, &updated)?,
        };
    }

    Ok((output, !targets.is_empty()))
}

async fn latest_major(releases: &dyn SourceControl, action: &str) -> anyhow::Result<String> {
    let mut segments = action.split('/');
    let (Some(owner), Some(repo)) = (segments.next(), segments.next()) else {
        return Err(anyhow!("{action} isn't an owner/repo action"));
    };

    let tag = releases
        .latest_release(owner, repo)
        .await
        .with_context(|| format!("couldn't fetch the latest release of {owner}/{repo}"))?
        .ok_or_else(|| anyhow!("{owner}/{repo} has no releases"))?;

    Ok(major_version(&tag).to_string())
}
