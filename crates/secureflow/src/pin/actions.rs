//! Pinning `uses: owner/repo@ref` to a commit.

use indexmap::IndexSet;
use workflow_models::{
    common::{DOCKER_PREFIX, RepositoryUses, Uses},
    workflow::Workflow,
};

use super::{
    Exemptions, PinContext, PinOutcome, PinReport, UnchangedReason,
    immutable::{check_immutable_batch, is_immutable, is_semantic_version},
    substitute_reference,
};
use crate::{
    pipeline::StageError,
    remote::{Registry, SourceControl, TagObject},
};

/// Pins every action step reference in `text`.
///
/// References are pinned to `path@<commit> # <version>`, or with
/// `pin_to_immutable` to `path@<version>` when that version is an
/// immutable release. Local, image, absolute, and exempt references are
/// left alone, as is anything that can't be resolved.
pub async fn pin_actions(
    text: &str,
    source_control: &dyn SourceControl,
    registry: &dyn Registry,
    exemptions: &Exemptions,
    pin_to_immutable: bool,
) -> Result<(String, PinReport), StageError> {
    let workflow = Workflow::from_yaml(text)?;

    let references: IndexSet<&str> = workflow
        .jobs
        .values()
        .flat_map(|job| job.steps.iter().filter_map(|step| step.uses()))
        .filter(|uses| !uses.starts_with(DOCKER_PREFIX))
        .collect();

    let mut report = PinReport::default();
    let mut candidates = vec![];
    for uses in references {
        let unchanged = |reason| PinOutcome::Unchanged { reason };

        let outcome = match Uses::parse(uses) {
            Ok(Uses::Repository(repository)) if repository.is_absolute() => {
                unchanged(UnchangedReason::Absolute)
            }
            Ok(Uses::Repository(_)) if exemptions.is_exempt(uses) => {
                unchanged(UnchangedReason::Exempt)
            }
            Ok(Uses::Repository(repository)) => {
                candidates.push(repository);
                continue;
            }
            Ok(Uses::Local(_)) => unchanged(UnchangedReason::Local),
            Ok(Uses::Docker(_)) => continue,
            Err(e) => PinOutcome::Failed {
                reason: e.to_string(),
            },
        };
        report.outcomes.insert(uses.to_string(), outcome);
    }

    let immutable = match pin_to_immutable {
        true => {
            let raw: Vec<_> = candidates.iter().map(|r| r.raw().to_string()).collect();
            check_immutable_batch(&raw, registry).await
        }
        false => Default::default(),
    };

    let context = PinContext {
        source_control,
        registry,
        pin_to_immutable,
    };

    let mut output = text.to_string();
    for repository in &candidates {
        let mut outcome = match immutable.get(repository.raw()) {
            Some(true) => PinOutcome::Unchanged {
                reason: UnchangedReason::Immutable,
            },
            _ => pin_reference(repository, context).await,
        };

        if let PinOutcome::Pinned { to } = &outcome {
            match substitute_reference(&output, repository.raw(), to) {
                Some(substituted) => {
                    tracing::debug!("pinning {repository} to {to}");
                    output = substituted;
                }
                None => {
                    tracing::warn!("couldn't rewrite {repository} in place");
                    outcome = PinOutcome::Failed {
                        reason: format!("{repository} couldn't be rewritten in place"),
                    };
                }
            }
        }
        report.outcomes.insert(repository.raw().to_string(), outcome);
    }

    Ok((output, report))
}

/// Resolves a single reference to its pinned form.
pub async fn pin_reference(repository: &RepositoryUses, context: PinContext<'_>) -> PinOutcome {
    let (owner, repo, git_ref) = (repository.owner(), repository.repo(), repository.git_ref());
    let source_control = context.source_control;

    let commit = match source_control.resolve_ref(owner, repo, git_ref).await {
        Ok(Some(commit)) => commit,
        Ok(None) => {
            return PinOutcome::Failed {
                reason: format!("{git_ref} doesn't exist in {owner}/{repo}"),
            };
        }
        Err(e) => {
            tracing::warn!("couldn't resolve {repository}: {e:#}");
            return PinOutcome::Failed {
                reason: format!("{e:#}"),
            };
        }
    };

    let version = match version_for_commit(source_control, owner, repo, git_ref, &commit).await {
        Ok(version) => version,
        Err(e) => {
            tracing::warn!("couldn't find a version for {repository}: {e:#}");
            return PinOutcome::Failed {
                reason: format!("{e:#}"),
            };
        }
    };

    let path = repository.path();
    let mut pinned = format!("{path}@{commit} # {version}");

    if context.pin_to_immutable && is_semantic_version(&version) {
        let release = format!("{path}@{version}");
        if is_immutable(&release, context.registry).await {
            pinned = release;
        }
    }

    match pinned.eq_ignore_ascii_case(repository.raw()) {
        true => PinOutcome::Unchanged {
            reason: UnchangedReason::AlreadyPinned,
        },
        false => PinOutcome::Pinned { to: pinned },
    }
}

/// Finds the most specific `<git_ref>.*` tag pointing at `commit`, e.g.
/// `v1.4.6` for `v1`. Falls back to `git_ref` itself.
async fn version_for_commit(
    source_control: &dyn SourceControl,
    owner: &str,
    repo: &str,
    git_ref: &str,
    commit: &str,
) -> anyhow::Result<String> {
    let tags = source_control
        .list_matching_tags(owner, repo, &format!("{git_ref}."))
        .await?;

    for tag in tags.iter().rev() {
        let tagged = match &tag.object {
            TagObject::Commit(sha) => Some(sha.clone()),
            TagObject::Annotated(_) => source_control.resolve_ref(owner, repo, &tag.name).await?,
        };

        if tagged.as_deref() == Some(commit) {
            return Ok(tag.name.clone());
        }
    }

    Ok(git_ref.to_string())
}
