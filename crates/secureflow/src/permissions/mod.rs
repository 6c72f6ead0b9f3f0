//! Minimal `permissions:` inference.
//!
//! Each job's steps are classified against the knowledge base (for
//! `uses:` steps) or a fixed rule table (for `run:` steps). Jobs whose
//! steps are all understood get a `permissions:` block with exactly the
//! scopes they need; anything else is reported and left alone.

use indexmap::IndexMap;
use serde::Serialize;
use thiserror::Error;
use workflow_models::{
    common::{DOCKER_PREFIX, Env},
    workflow::{Job, StepBody, Workflow},
};
use yamlanchor::Document;

use crate::{is_platform_token, knowledge_base::KnowledgeBase, pipeline::StageError};

pub mod grants;
pub mod rules;

pub use grants::{ScopeGrant, finalize_grants, merge_grants};
use rules::{JobContext, classify_run};

/// Trailing comment for `add_project_comment`.
pub const PROJECT_COMMENT: &str = "# added using https://github.com/step-security/secure-repo";

/// Why a job's permissions weren't inferred.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum JobFailure {
    #[error("KnownIssue-1: Jobs with run steps that use token are not supported")]
    TokenInRunStep,
    #[error("KnownIssue-2: Jobs with run steps that use token in environment variable are not supported")]
    TokenInRunStepEnv,
    #[error("KnownIssue-3: Action {0} is a local action. Local actions are not supported")]
    LocalAction(String),
    #[error("KnownIssue-4: Action {0} is not in the knowledge base")]
    MissingKnowledgeBase(String),
    #[error("KnownIssue-5: Jobs that already have permissions are not modified")]
    AlreadyConfigured,
    #[error("KnownIssue-6: Jobs that call reusable workflows are not modified")]
    ReusableWorkflow,
    #[error("KnownIssue-7: Action {0} is a container image given the token. Image actions are not supported")]
    ImageAction(String),
    #[error("KnownIssue-8: Permissions couldn't be inserted: {0}")]
    Uneditable(String),
}

impl JobFailure {
    /// The stable code for this kind of failure.
    pub fn code(&self) -> &'static str {
        match self {
            Self::TokenInRunStep => "KnownIssue-1",
            Self::TokenInRunStepEnv => "KnownIssue-2",
            Self::LocalAction(_) => "KnownIssue-3",
            Self::MissingKnowledgeBase(_) => "KnownIssue-4",
            Self::AlreadyConfigured => "KnownIssue-5",
            Self::ReusableWorkflow => "KnownIssue-6",
            Self::ImageAction(_) => "KnownIssue-7",
            Self::Uneditable(_) => "KnownIssue-8",
        }
    }
}

#[derive(Debug, Default, Serialize)]
pub struct PermissionsReport {
    /// The workflow declares top-level permissions, so nothing was inferred.
    pub already_has_permissions: bool,
    /// The grants inserted into each job.
    pub job_grants: IndexMap<String, Vec<ScopeGrant>>,
    #[serde(skip)]
    pub job_errors: IndexMap<String, Vec<JobFailure>>,
    /// Actions with no knowledge base entry, as written.
    pub missing_actions: Vec<String>,
    pub workflow_permissions_added: bool,
    /// Why the workflow-level block couldn't be added, if that was tried.
    pub workflow_permissions_error: Option<String>,
}

impl PermissionsReport {
    pub fn has_errors(&self) -> bool {
        self.already_has_permissions
            || self.workflow_permissions_error.is_some()
            || (!self.workflow_permissions_added && !self.job_errors.is_empty())
    }

    fn only_already_configured(&self) -> bool {
        self.job_errors
            .values()
            .flatten()
            .all(|failure| *failure == JobFailure::AlreadyConfigured)
    }
}

/// Infers and inserts job-level permissions, then a read-only
/// workflow-level block when every job could be handled.
pub async fn infer_and_insert_permissions(
    text: &str,
    kb: &dyn KnowledgeBase,
    add_empty_top_level: bool,
    add_project_comment: bool,
) -> Result<(String, PermissionsReport), StageError> {
    let workflow = Workflow::from_yaml(text)?;
    let mut report = PermissionsReport::default();

    if workflow.permissions.is_declared() {
        tracing::debug!("workflow already declares top-level permissions");
        report.already_has_permissions = true;
        return Ok((text.to_string(), report));
    }

    let mut output = text.to_string();
    for (name, job) in &workflow.jobs {
        match infer_job(job, kb, &mut report.missing_actions).await {
            Ok(grants) => match insert_job_permissions(&output, name, &grants) {
                Ok(updated) => {
                    output = updated;
                    report.job_grants.insert(name.clone(), grants);
                }
                Err(e) => {
                    tracing::debug!("job {name} left unchanged: {e}");
                    report
                        .job_errors
                        .insert(name.clone(), vec![JobFailure::Uneditable(e.to_string())]);
                }
            },
            Err(failures) => {
                tracing::debug!("job {name} left unchanged: {} failure(s)", failures.len());
                report.job_errors.insert(name.clone(), failures);
            }
        }
    }

    if report.only_already_configured() {
        match insert_workflow_permissions(&output, add_empty_top_level, add_project_comment) {
            Ok(updated) => {
                output = updated;
                report.workflow_permissions_added = true;
            }
            Err(e) => {
                tracing::warn!("couldn't add workflow-level permissions: {e}");
                report.workflow_permissions_error = Some(e.to_string());
            }
        }
    }

    Ok((output, report))
}

/// Computes the grant set for one job, or every reason it can't have one.
pub async fn infer_job(
    job: &Job,
    kb: &dyn KnowledgeBase,
    missing: &mut Vec<String>,
) -> Result<Vec<ScopeGrant>, Vec<JobFailure>> {
    if job.permissions.is_declared() {
        return Err(vec![JobFailure::AlreadyConfigured]);
    }
    if job.calls_reusable_workflow() {
        return Err(vec![JobFailure::ReusableWorkflow]);
    }

    let mut context = JobContext::default();
    let mut grants = vec![];
    let mut failures = vec![];

    for step in &job.steps {
        let classified = match &step.body {
            StepBody::Action { uses, with, env } => {
                let classified = classify_action(uses, with, env, kb, missing).await;
                let path = uses.split_once('@').map_or(uses.as_str(), |(path, _)| path);
                context = context.after_action(path, with, env);
                classified
            }
            StepBody::Run { run, env } if !run.is_empty() => classify_run(run, env, &context),
            _ => continue,
        };

        match classified {
            Ok(step_grants) => grants.extend(step_grants),
            Err(failure) => failures.push(failure),
        }
    }

    if failures.is_empty() {
        Ok(finalize_grants(grants))
    } else {
        Err(failures)
    }
}

async fn classify_action(
    uses: &str,
    with: &Env,
    env: &Env,
    kb: &dyn KnowledgeBase,
    missing: &mut Vec<String>,
) -> Result<Vec<ScopeGrant>, JobFailure> {
    let carries_token = |map: &Env| map.values().any(|v| is_platform_token(&v.to_string()));

    if uses.starts_with(DOCKER_PREFIX) {
        if carries_token(with) || carries_token(env) {
            return Err(JobFailure::ImageAction(uses.into()));
        }
        return Ok(vec![]);
    }

    let Some((action, _)) = uses.split_once('@') else {
        return Err(JobFailure::LocalAction(uses.into()));
    };

    let metadata = match kb.lookup(uses).await {
        Ok(Some(metadata)) => metadata,
        Ok(None) => {
            if !missing.iter().any(|m| m == uses) {
                missing.push(uses.into());
            }
            return Err(JobFailure::MissingKnowledgeBase(uses.into()));
        }
        Err(e) => {
            tracing::warn!("knowledge base lookup for {uses} failed: {e:#}");
            return Err(JobFailure::MissingKnowledgeBase(uses.into()));
        }
    };

    let Some(token) = metadata.github_token else {
        return Ok(vec![]);
    };

    // An input that defaults to the token, overridden with something else.
    if let Some(input) = token.action_input.as_ref().filter(|i| i.is_default) {
        let value = with.get(&input.input).map(ToString::to_string);
        if value.is_some_and(|v| !v.is_empty() && !is_platform_token(&v)) {
            return Ok(vec![]);
        }
    }

    // An env var the token has to be passed through, but wasn't.
    if let Some(name) = token.environment_variable_name.as_deref().filter(|n| !n.is_empty()) {
        let value = env.get(name).map(ToString::to_string);
        if !value.is_some_and(|v| is_platform_token(&v)) {
            return Ok(vec![]);
        }
    }

    Ok(token
        .permissions
        .iter()
        .filter(|(_, requirement)| {
            requirement
                .condition
                .as_deref()
                .is_none_or(|condition| guard_expressions::evaluate(condition, with))
        })
        .map(|(scope, requirement)| {
            ScopeGrant::for_action(scope, requirement.level, action, requirement.reason.as_deref())
        })
        .collect())
}

/// Inserts a `permissions:` block as the first entry of job `name`.
pub fn insert_job_permissions(
    text: &str,
    name: &str,
    grants: &[ScopeGrant],
) -> Result<String, StageError> {
    let doc = Document::new(text)?;
    let job = doc
        .root()?
        .get("jobs")
        .and_then(|jobs| jobs.get(name))
        .ok_or_else(|| StageError::MissingStructure(format!("jobs.{name}")))?;

    if job.is_flow() {
        return Err(StageError::FlowCollection(format!("jobs.{name}")));
    }

    let mut lines = vec!["permissions:".to_string()];
    lines.extend(grants.iter().map(|grant| format!("  {grant}")));

    Ok(yamlsplice::insert_before(text, job.anchor, &lines)?)
}

/// Inserts the workflow-level `permissions:` block just before `jobs:`.
pub fn insert_workflow_permissions(
    text: &str,
    add_empty_top_level: bool,
    add_project_comment: bool,
) -> Result<String, StageError> {
    let doc = Document::new(text)?;
    let anchor = doc
        .root()?
        .key_anchor("jobs")
        .ok_or_else(|| StageError::MissingStructure("jobs".into()))?;

    let mut header = match add_empty_top_level {
        true => "permissions: {}".to_string(),
        false => "permissions:".to_string(),
    };
    if add_project_comment {
        header = format!("{header}  {PROJECT_COMMENT}");
    }

    let mut lines = vec![header];
    if !add_empty_top_level {
        lines.push("  contents: read".into());
    }
    lines.push(String::new());

    Ok(yamlsplice::insert_before(text, anchor, &lines)?)
}

#[cfg(test)]
mod tests {
    use insta::assert_snapshot;
    use pretty_assertions::assert_eq;

    use super::{JobFailure, infer_and_insert_permissions, insert_workflow_permissions};
    use crate::knowledge_base::InMemoryKnowledgeBase;

    fn kb() -> InMemoryKnowledgeBase {
        let mut kb = InMemoryKnowledgeBase::new();
        kb.insert_yaml(
            "actions/checkout",
            r#"
name: Checkout
github-token:
  action-input:
    input: token
    is-default: true
  permissions:
    contents: read
    contents-reason: to fetch code (actions/checkout)
"#,
        )
        .unwrap();
        kb.insert_yaml(
            "actions/labeler",
            r#"
name: Labeler
github-token:
  action-input:
    input: repo-token
    is-default: true
  permissions:
    pull-requests: write
    pull-requests-reason: to add labels to PRs
    contents: read
    contents-reason: to read the labeler configuration
    issues: write
    issues-if: "${{ contains(with, 'sync-labels') }}"
    issues-reason: to sync labels
"#,
        )
        .unwrap();
        kb.insert_yaml(
            "peter-evans/create-pull-request",
            r#"
name: Create PR
github-token:
  environment-variable-name: GITHUB_TOKEN
  permissions:
    pull-requests: write
"#,
        )
        .unwrap();
        kb.insert_yaml("actions/setup-go", "name: Setup Go\n").unwrap();
        kb
    }

    #[tokio::test]
    async fn test_action_grants_inserted_before_first_key() {
        let workflow = r#"on: push

jobs:
  build:
    runs-on: ubuntu-latest
    steps:
      - uses: actions/checkout@v2
      - uses: actions/setup-go@v5
"#;

        let (output, report) = infer_and_insert_permissions(workflow, &kb(), false, false)
            .await
            .unwrap();

        assert!(!report.has_errors());
        assert!(report.workflow_permissions_added);
        assert_snapshot!(output, @r"
        on: push

        permissions:
          contents: read

        jobs:
          build:
            permissions:
              contents: read # for actions/checkout to fetch code (actions/checkout)
            runs-on: ubuntu-latest
            steps:
              - uses: actions/checkout@v2
              - uses: actions/setup-go@v5
        ");
    }

    #[tokio::test]
    async fn test_default_input_override_and_guards() {
        let workflow = r#"on: pull_request
jobs:
  label:
    runs-on: ubuntu-latest
    steps:
      - uses: actions/labeler@v4
        with:
          sync-labels: true
  other-token:
    runs-on: ubuntu-latest
    steps:
      - uses: actions/checkout@v4
        with:
          token: ${{ secrets.PAT }}
"#;

        let (output, report) = infer_and_insert_permissions(workflow, &kb(), false, false)
            .await
            .unwrap();

        let rendered = |job: &str| -> Vec<String> {
            report.job_grants[job].iter().map(ToString::to_string).collect()
        };
        assert_eq!(
            rendered("label"),
            [
                "contents: read # for actions/labeler to read the labeler configuration",
                "issues: write # for actions/labeler to sync labels",
                "pull-requests: write # for actions/labeler to add labels to PRs",
            ]
        );
        assert_eq!(rendered("other-token"), ["contents: none"]);
        assert!(output.contains("  other-token:\n    permissions:\n      contents: none\n"));
    }

    #[tokio::test]
    async fn test_env_var_requirement() {
        let workflow = r#"jobs:
  with-token:
    runs-on: ubuntu-latest
    steps:
      - uses: peter-evans/create-pull-request@v5
        env:
          GITHUB_TOKEN: ${{ secrets.GITHUB_TOKEN }}
  without-token:
    runs-on: ubuntu-latest
    steps:
      - uses: peter-evans/create-pull-request@v5
"#;

        let (_, report) = infer_and_insert_permissions(workflow, &kb(), false, false)
            .await
            .unwrap();

        assert_eq!(
            report.job_grants["with-token"][0].to_string(),
            "pull-requests: write # for peter-evans/create-pull-request"
        );
        assert_eq!(report.job_grants["without-token"][0].to_string(), "contents: none");
    }

    #[tokio::test]
    async fn test_failures_leave_job_untouched() {
        let workflow = r#"jobs:
  local:
    runs-on: ubuntu-latest
    steps:
      - uses: ./.github/actions/build
      - uses: unknown/action@v1
      - uses: unknown/action@v1
      - uses: docker://alpine:3
        with:
          token: ${{ github.token }}
  reusable:
    uses: org/repo/.github/workflows/ci.yml@main
  configured:
    permissions: read-all
    runs-on: ubuntu-latest
"#;

        let (output, report) = infer_and_insert_permissions(workflow, &kb(), false, false)
            .await
            .unwrap();

        assert_eq!(output, workflow);
        assert!(report.has_errors());
        assert!(!report.workflow_permissions_added);
        assert_eq!(
            report.job_errors["local"],
            [
                JobFailure::LocalAction("./.github/actions/build".into()),
                JobFailure::MissingKnowledgeBase("unknown/action@v1".into()),
                JobFailure::MissingKnowledgeBase("unknown/action@v1".into()),
                JobFailure::ImageAction("docker://alpine:3".into()),
            ]
        );
        assert_eq!(report.job_errors["reusable"], [JobFailure::ReusableWorkflow]);
        assert_eq!(report.job_errors["configured"], [JobFailure::AlreadyConfigured]);
        assert_eq!(report.missing_actions, ["unknown/action@v1"]);
    }

    #[tokio::test]
    async fn test_already_configured_job_allows_workflow_block() {
        let workflow = r#"jobs:
  configured:
    permissions:
      contents: write
    runs-on: ubuntu-latest
  push:
    runs-on: ubuntu-latest
    steps:
      - run: git push
"#;

        let (output, report) = infer_and_insert_permissions(workflow, &kb(), false, false)
            .await
            .unwrap();

        assert!(!report.has_errors());
        assert_snapshot!(output, @r"
        permissions:
          contents: read

        jobs:
          configured:
            permissions:
              contents: write
            runs-on: ubuntu-latest
          push:
            permissions:
              contents: write
            runs-on: ubuntu-latest
            steps:
              - run: git push
        ");
    }

    #[tokio::test]
    async fn test_top_level_permissions_short_circuit() {
        let workflow = "permissions: {}\njobs:\n  a:\n    runs-on: x\n";

        let (output, report) = infer_and_insert_permissions(workflow, &kb(), false, false)
            .await
            .unwrap();

        assert_eq!(output, workflow);
        assert!(report.already_has_permissions);
        assert!(report.has_errors());
    }

    #[test]
    fn test_workflow_block_variants() {
        let workflow = "on: push\njobs:\n  a:\n    runs-on: x\n";

        assert_eq!(
            insert_workflow_permissions(workflow, true, false).unwrap(),
            "on: push\npermissions: {}\n\njobs:\n  a:\n    runs-on: x\n"
        );
        assert_eq!(
            insert_workflow_permissions(workflow, false, true).unwrap(),
            "on: push\npermissions:  # added using https://github.com/step-security/secure-repo\n  contents: read\n\njobs:\n  a:\n    runs-on: x\n"
        );
        assert!(insert_workflow_permissions("on: push\n", false, false).is_err());
    }

    #[tokio::test]
    async fn test_flow_job_only_fails_itself() {
        let workflow = r#"on: push
jobs:
  push:
    runs-on: ubuntu-latest
    steps:
      - run: git push
  flow: { runs-on: ubuntu-latest, steps: [{ run: make }] }
"#;

        let (output, report) = infer_and_insert_permissions(workflow, &kb(), false, false)
            .await
            .unwrap();

        assert!(report.has_errors());
        assert!(!report.workflow_permissions_added);
        assert_eq!(
            report.job_errors["flow"],
            [JobFailure::Uneditable(
                "jobs.flow is a flow collection and can't be edited".into()
            )]
        );
        assert_snapshot!(output, @r"
        on: push
        jobs:
          push:
            permissions:
              contents: write
            runs-on: ubuntu-latest
            steps:
              - run: git push
          flow: { runs-on: ubuntu-latest, steps: [{ run: make }] }
        ");
    }

    #[test]
    fn test_failure_codes() {
        assert_eq!(JobFailure::TokenInRunStep.code(), "KnownIssue-1");
        assert_eq!(
            JobFailure::LocalAction("./x".into()).to_string(),
            "KnownIssue-3: Action ./x is a local action. Local actions are not supported"
        );
    }
}
