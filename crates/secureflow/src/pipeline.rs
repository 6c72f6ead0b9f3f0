//! Running every hardening stage over one workflow.

use thiserror::Error;
use workflow_models::workflow::Workflow;

use crate::{
    harden::{DEFAULT_WRAPPER_ACTION, inject_wrapper_step},
    knowledge_base::KnowledgeBase,
    maintained::{MaintainedActions, replace_maintained_actions},
    missing::MissingActionSink,
    permissions::infer_and_insert_permissions,
    pin::{Exemptions, PinContext, pin_actions, pin_images},
    remote::{Registry, SourceControl},
    report::{JobErrors, Stage, WorkflowReport},
};

/// Why a single stage couldn't complete.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("workflow is not valid YAML")]
    Malformed(#[from] serde_yaml::Error),
    #[error("couldn't locate a position in the workflow")]
    Query(#[from] yamlanchor::QueryError),
    #[error("couldn't edit the workflow")]
    Splice(#[from] yamlsplice::Error),
    #[error("couldn't find {0} in the workflow")]
    MissingStructure(String),
    #[error("{0} is a flow collection and can't be edited")]
    FlowCollection(String),
    #[error(transparent)]
    Remote(#[from] anyhow::Error),
}

/// Why the pipeline as a whole couldn't run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("not a valid workflow")]
    MalformedDocument(#[source] serde_yaml::Error),
}

/// Which stages run, and how.
#[derive(Clone, Debug)]
pub struct PipelineOptions {
    pub add_permissions: bool,
    pub pin_actions: bool,
    pub add_harden_runner: bool,
    pub add_empty_top_level_permissions: bool,
    pub add_project_comment: bool,
    /// Don't forward missing actions to the sink.
    pub ignore_missing_kbs: bool,
    pub exemptions: Exemptions,
    pub pin_to_immutable: bool,
    /// The monitoring action to inject.
    pub harden_runner: String,
    pub skip_container_jobs: bool,
    /// An empty map disables maintained-action substitution.
    pub maintained_actions: MaintainedActions,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            add_permissions: true,
            pin_actions: true,
            add_harden_runner: true,
            add_empty_top_level_permissions: false,
            add_project_comment: false,
            ignore_missing_kbs: false,
            exemptions: Exemptions::default(),
            pin_to_immutable: false,
            harden_runner: DEFAULT_WRAPPER_ACTION.into(),
            skip_container_jobs: false,
            maintained_actions: MaintainedActions::default(),
        }
    }
}

/// The services a run consults.
///
/// Without a source-control host or registry, the stages needing them
/// are skipped.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub knowledge_base: &'a dyn KnowledgeBase,
    pub missing: &'a dyn MissingActionSink,
    pub source_control: Option<&'a dyn SourceControl>,
    pub registry: Option<&'a dyn Registry>,
}

impl<'a> Collaborators<'a> {
    fn pin_context(&self, pin_to_immutable: bool) -> Option<PinContext<'a>> {
        Some(PinContext {
            source_control: self.source_control?,
            registry: self.registry?,
            pin_to_immutable,
        })
    }
}

/// Runs every enabled stage over `text`, in order: permissions,
/// maintained-action substitution, pinning, then the monitoring step.
///
/// A stage that fails is recorded in the report, and the stages after it
/// carry on with the text as it was.
pub async fn secure_workflow(
    text: &str,
    options: &PipelineOptions,
    collaborators: Collaborators<'_>,
) -> Result<WorkflowReport, PipelineError> {
    Workflow::from_yaml(text).map_err(PipelineError::MalformedDocument)?;

    let mut report = WorkflowReport::new(text);
    let mut current = text.to_string();

    if options.add_permissions {
        match infer_and_insert_permissions(
            &current,
            collaborators.knowledge_base,
            options.add_empty_top_level_permissions,
            options.add_project_comment,
        )
        .await
        {
            Ok((output, permissions)) => {
                current = output;
                report.has_errors |= permissions.has_errors();
                report.added_permissions = !permissions.has_errors();
                report.already_has_permissions = permissions.already_has_permissions;
                report.job_errors = permissions
                    .job_errors
                    .iter()
                    .map(|(name, failures)| JobErrors {
                        job_name: name.clone(),
                        errors: failures.iter().map(ToString::to_string).collect(),
                    })
                    .collect();

                if !permissions.missing_actions.is_empty() && !options.ignore_missing_kbs {
                    collaborators
                        .missing
                        .record(&permissions.missing_actions)
                        .await;
                }
                report.missing_actions = permissions.missing_actions;
            }
            Err(e) => report.record_failure(Stage::Permissions, &display_chain(&e)),
        }
    }

    if !options.maintained_actions.is_empty() {
        match collaborators.source_control {
            Some(source_control) => {
                match replace_maintained_actions(
                    &current,
                    source_control,
                    &options.maintained_actions,
                )
                .await
                {
                    Ok((output, updated)) => {
                        current = output;
                        report.added_maintained_actions = updated;
                    }
                    Err(e) => report.record_failure(Stage::MaintainedActions, &display_chain(&e)),
                }
            }
            None => report.skipped_stages.push(Stage::MaintainedActions),
        }
    }

    let pin_context = collaborators.pin_context(options.pin_to_immutable);

    if options.pin_actions {
        match pin_context {
            Some(context) => {
                match pin_actions(
                    &current,
                    context.source_control,
                    context.registry,
                    &options.exemptions,
                    options.pin_to_immutable,
                )
                .await
                {
                    Ok((output, pins)) => {
                        current = output;
                        report.pinned_actions |= pins.updated();
                        report.pin_outcomes.extend(pins);
                    }
                    Err(e) => report.record_failure(Stage::PinActions, &display_chain(&e)),
                }

                match pin_images(&current, context.registry).await {
                    Ok((output, pins)) => {
                        current = output;
                        report.pinned_actions |= pins.updated();
                        report.pin_outcomes.extend(pins);
                    }
                    Err(e) => report.record_failure(Stage::PinImages, &display_chain(&e)),
                }
            }
            None => report
                .skipped_stages
                .extend([Stage::PinActions, Stage::PinImages]),
        }
    }

    if options.add_harden_runner {
        // The monitoring step is pinned even when pinning is otherwise off.
        let pin = match options.exemptions.is_exempt(&options.harden_runner) {
            true => {
                tracing::debug!("{} is exempt from pinning", options.harden_runner);
                None
            }
            false => pin_context,
        };

        match inject_wrapper_step(
            &current,
            &options.harden_runner,
            pin,
            options.skip_container_jobs,
        )
        .await
        {
            Ok((output, updated)) => {
                current = output;
                report.added_harden_runner = updated;
            }
            Err(e) => report.record_failure(Stage::HardenRunner, &display_chain(&e)),
        }
    }

    tracing::debug!(
        "done: permissions={} maintained={} pinned={} harden-runner={} errors={}",
        report.added_permissions,
        report.added_maintained_actions,
        report.pinned_actions,
        report.added_harden_runner,
        report.has_errors
    );

    report.final_output = current;
    Ok(report)
}

/// Formats `error` with its sources, as `anyhow` does with `{:#}`.
fn display_chain(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
