//! Injection of a runtime-monitoring step at the start of each job.

use workflow_models::{
    common::{RepositoryUses, Uses},
    workflow::Workflow,
};
use yamlanchor::Document;

use crate::{
    pin::{PinContext, PinOutcome, pin_reference, substitute_reference},
    pipeline::StageError,
};

/// The monitoring action injected when none is configured.
pub const DEFAULT_WRAPPER_ACTION: &str = "step-security/harden-runner@v2";

const WRAPPER_STEP_NAME: &str = "Harden the runner (Audit all outbound calls)";

/// Inserts a step running `reference` as the first step of every job
/// that doesn't already have one.
///
/// Reusable workflow calls are skipped, as are container jobs when
/// `skip_container_jobs` is set. When `pin` is given, the inserted
/// reference is then pinned like any other action.
pub async fn inject_wrapper_step(
    text: &str,
    reference: &str,
    pin: Option<PinContext<'_>>,
    skip_container_jobs: bool,
) -> Result<(String, bool), StageError> {
    let workflow = Workflow::from_yaml(text)?;
    let wrapper_path = reference.split_once('@').map_or(reference, |(path, _)| path);

    let mut output = text.to_string();
    let mut updated = false;

    for (name, job) in &workflow.jobs {
        if job.calls_reusable_workflow() {
            continue;
        }
        if skip_container_jobs && job.container_image().is_some() {
            tracing::debug!("skipping container job {name}");
            continue;
        }
        if job
            .steps
            .iter()
            .filter_map(|step| step.uses())
            .any(|uses| {
                let path = uses.split_once('@').map_or(uses, |(path, _)| path);
                path.eq_ignore_ascii_case(wrapper_path)
            })
        {
            continue;
        }

        let doc = Document::new(output.as_str())?;
        let Some(steps) = doc
            .root()?
            .get("jobs")
            .and_then(|jobs| jobs.get(name))
            .and_then(|job| job.get("steps"))
        else {
            tracing::debug!("job {name} has no steps to harden");
            continue;
        };

        if steps.is_flow() {
            return Err(StageError::FlowCollection(format!("jobs.{name}.steps")));
        }

        let lines = [
            format!("- name: {WRAPPER_STEP_NAME}"),
            format!("  uses: {reference}"),
            "  with:".into(),
            "    egress-policy: audit".into(),
            String::new(),
        ];
        output = yamlsplice::insert_before(&output, steps.anchor, &lines)?;
        updated = true;
    }

    if updated && let Some(context) = pin {
        output = pin_wrapper(output, reference, context).await;
    }

    Ok((output, updated))
}

async fn pin_wrapper(text: String, reference: &str, context: PinContext<'_>) -> String {
    let repository = match Uses::parse(reference) {
        Ok(Uses::Repository(repository)) if !repository.is_absolute() => repository,
        _ => return text,
    };

    match pin_reference(&repository, context).await {
        PinOutcome::Pinned { to } => match substitute_reference(&text, repository.raw(), &to) {
            Some(substituted) => substituted,
            None => text,
        },
        outcome => {
            tracing::debug!("wrapper step left as {reference}: {}", describe(&outcome));
            text
        }
    }
}

fn describe(outcome: &PinOutcome) -> String {
    match outcome {
        PinOutcome::Pinned { to } => format!("pinned to {to}"),
        PinOutcome::Unchanged { .. } => "unchanged".into(),
        PinOutcome::Failed { reason } => reason.clone(),
    }
}

/// Returns whether `reference` names a valid repository action.
pub fn is_valid_wrapper(reference: &str) -> bool {
    RepositoryUses::parse(reference).is_ok()
}
