//! The per-workflow report, and its "plain" (cargo-style) rendering.

use std::{fmt::Display, ops::Range};

use annotate_snippets::{AnnotationKind, Group, Level, Renderer, Snippet};
use anstream::eprintln;
use owo_colors::OwoColorize;
use serde::Serialize;
use yamlanchor::Document;

use crate::pin::{PinOutcome, PinReport};

/// A hardening stage, as named in reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Permissions,
    MaintainedActions,
    PinActions,
    PinImages,
    HardenRunner,
}

impl Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Permissions => "permissions",
            Self::MaintainedActions => "maintained-actions",
            Self::PinActions => "pin-actions",
            Self::PinImages => "pin-images",
            Self::HardenRunner => "harden-runner",
        };
        f.write_str(name)
    }
}

/// Why one job's permissions weren't inferred.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct JobErrors {
    pub job_name: String,
    pub errors: Vec<String>,
}

/// A stage that failed outright.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StageFailure {
    pub stage: Stage,
    pub error: String,
}

/// Everything a hardening run did to one workflow.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct WorkflowReport {
    pub final_output: String,
    pub original_input: String,
    pub has_errors: bool,
    /// The input wasn't valid YAML; nothing else ran.
    pub incorrect_yaml: bool,
    pub already_has_permissions: bool,
    pub added_permissions: bool,
    pub pinned_actions: bool,
    pub added_harden_runner: bool,
    pub added_maintained_actions: bool,
    pub job_errors: Vec<JobErrors>,
    /// Actions with no knowledge base entry.
    pub missing_actions: Vec<String>,
    pub pin_outcomes: PinReport,
    pub stage_errors: Vec<StageFailure>,
    /// Stages that were requested but couldn't run, e.g. when offline.
    pub skipped_stages: Vec<Stage>,
}

impl WorkflowReport {
    pub fn new(text: &str) -> Self {
        Self {
            final_output: text.into(),
            original_input: text.into(),
            ..Default::default()
        }
    }

    /// The report for an input that couldn't be parsed.
    pub fn malformed(text: &str) -> Self {
        Self {
            has_errors: true,
            incorrect_yaml: true,
            ..Self::new(text)
        }
    }

    /// Returns whether the final text differs from the input.
    pub fn changed(&self) -> bool {
        self.final_output != self.original_input
    }

    pub(crate) fn record_failure(&mut self, stage: Stage, error: &dyn Display) {
        tracing::warn!("{stage} stage failed: {error}");
        self.has_errors = true;
        self.stage_errors.push(StageFailure {
            stage,
            error: error.to_string(),
        });
    }
}

/// The byte range of the 1-based `line` in `source`, without its newline.
fn line_span(source: &str, line: usize) -> Option<Range<usize>> {
    let mut start = 0;
    for (index, text) in source.split_inclusive('\n').enumerate() {
        if index + 1 == line {
            return Some(start..start + text.trim_end_matches(['\r', '\n']).len());
        }
        start += text.len();
    }
    None
}

/// Finds the line declaring `jobs.<name>` in `source`.
fn job_span(source: &str, name: &str) -> Option<Range<usize>> {
    let doc = Document::new(source).ok()?;
    let job = doc.root().ok()?.get("jobs")?.get(name)?;

    // The key is on the job's first line, or somewhere above it.
    let key = format!("{name}:");
    let lines: Vec<_> = source.lines().collect();
    let line = (1..=job.anchor.line)
        .rev()
        .find(|line| lines.get(line - 1).is_some_and(|text| text.trim_start().starts_with(&key)))?;
    line_span(source, line)
}

/// Renders `report` for humans on stderr.
pub fn render_plain(path: &str, report: &WorkflowReport) {
    if report.incorrect_yaml {
        eprintln!("{path}: {}", "not a valid workflow, skipped".red().bold());
        return;
    }

    let renderer = Renderer::styled();
    for job in &report.job_errors {
        let title = format!("job `{}` was left without permissions", job.job_name);
        let mut group = Group::with_title(Level::WARNING.primary_title(title.as_str()));

        if let Some(span) = job_span(&report.original_input, &job.job_name) {
            group = group.element(
                Snippet::source(report.original_input.as_str())
                    .fold(true)
                    .line_start(1)
                    .path(path)
                    .annotations([AnnotationKind::Primary
                        .span(span)
                        .label("permissions not inferred")]),
            );
        }

        for error in &job.errors {
            group = group.element(Level::NOTE.message(error.as_str()));
        }
        eprintln!("{}", renderer.render(&[group]));
    }

    for failure in &report.stage_errors {
        eprintln!(
            "{path}: {stage} {failed}: {error}",
            stage = failure.stage.bold(),
            failed = "failed".red(),
            error = failure.error
        );
    }

    for (reference, outcome) in &report.pin_outcomes.outcomes {
        if let PinOutcome::Failed { reason } = outcome {
            eprintln!(
                "{path}: couldn't pin {reference}: {reason}",
                reference = reference.yellow()
            );
        }
    }

    if !report.missing_actions.is_empty() {
        eprintln!(
            "{path}: not in the knowledge base: {}",
            report.missing_actions.join(", ").yellow()
        );
    }

    for stage in &report.skipped_stages {
        eprintln!("{path}: {stage} skipped (offline)");
    }

    let mut done = vec![];
    if report.added_permissions {
        done.push("added permissions");
    }
    if report.added_maintained_actions {
        done.push("replaced maintained actions");
    }
    if report.pinned_actions {
        done.push("pinned actions");
    }
    if report.added_harden_runner {
        done.push("added harden-runner");
    }

    match (done.is_empty(), report.has_errors) {
        (true, false) => eprintln!("{path}: {}", "already hardened".green()),
        (true, true) => eprintln!("{path}: {}", "nothing changed".yellow()),
        (false, _) => eprintln!("{path}: {}", done.join(", ").green()),
    }
}
