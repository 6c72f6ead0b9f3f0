//! Workflow, job, and step models.
//!
//! These models are deliberately partial: they capture only the parts of
//! a workflow that hardening reads, and ignore every other key.

use indexmap::IndexMap;
use serde::Deserialize;

use crate::common::{Env, Permissions, env_or_expr, null_to_default};

/// A single workflow document.
#[derive(Deserialize, Debug)]
#[serde(rename_all = "kebab-case")]
pub struct Workflow {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "null_to_default")]
    pub permissions: Permissions,
    #[serde(default, deserialize_with = "null_to_default")]
    pub jobs: IndexMap<String, Job>,
}

impl Workflow {
    /// Parse a workflow from its YAML source.
    pub fn from_yaml(source: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(source)
    }
}

/// A single job.
///
/// Normal jobs and reusable workflow calls share this model; a job with
/// a `uses:` key is a reusable workflow call and has no steps.
#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "kebab-case")]
pub struct Job {
    #[serde(default, deserialize_with = "null_to_default")]
    pub permissions: Permissions,
    #[serde(default)]
    pub uses: Option<String>,
    #[serde(default)]
    pub container: Option<Container>,
    #[serde(default, deserialize_with = "null_to_default")]
    pub steps: Vec<Step>,
}

impl Job {
    /// Returns whether this job delegates to a reusable workflow.
    pub fn calls_reusable_workflow(&self) -> bool {
        self.uses.as_deref().is_some_and(|uses| !uses.is_empty())
    }

    /// Returns the job's container image, if it runs in one.
    pub fn container_image(&self) -> Option<&str> {
        match self.container.as_ref()? {
            Container::Name(image) => Some(image.as_str()),
            Container::Container { image } => image.as_deref(),
        }
        .filter(|image| !image.is_empty())
    }
}

/// A job's `container:`, either a bare image or a mapping.
#[derive(Deserialize, Debug, PartialEq)]
#[serde(untagged)]
pub enum Container {
    Name(String),
    Container {
        #[serde(default)]
        image: Option<String>,
    },
}

/// A single step.
#[derive(Deserialize, Debug)]
#[serde(from = "RawStep")]
pub struct Step {
    pub name: Option<String>,
    pub body: StepBody,
}

/// What a step does.
#[derive(Debug, PartialEq)]
pub enum StepBody {
    /// `uses:` an action or image.
    Action { uses: String, with: Env, env: Env },
    /// `run:` a shell script.
    Run { run: String, env: Env },
    /// Neither; the step does nothing we can reason about.
    Empty,
}

impl Step {
    /// The raw `uses:` clause, for action steps.
    pub fn uses(&self) -> Option<&str> {
        match &self.body {
            StepBody::Action { uses, .. } => Some(uses),
            _ => None,
        }
    }

    /// The step's environment, whichever kind of step it is.
    pub fn env(&self) -> Option<&Env> {
        match &self.body {
            StepBody::Action { env, .. } | StepBody::Run { env, .. } => Some(env),
            StepBody::Empty => None,
        }
    }
}

#[derive(Deserialize)]
struct RawStep {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    uses: Option<String>,
    #[serde(default)]
    run: Option<String>,
    #[serde(default, deserialize_with = "env_or_expr")]
    with: Env,
    #[serde(default, deserialize_with = "env_or_expr")]
    env: Env,
}

impl From<RawStep> for Step {
    fn from(raw: RawStep) -> Self {
        // A step spelling both is invalid; `uses:` wins since it's the
        // one that can carry credentials through inputs.
        let body = match (raw.uses, raw.run) {
            (Some(uses), _) if !uses.is_empty() => StepBody::Action {
                uses,
                with: raw.with,
                env: raw.env,
            },
            (_, Some(run)) => StepBody::Run { run, env: raw.env },
            _ => StepBody::Empty,
        };

        Step {
            name: raw.name,
            body,
        }
    }
}
