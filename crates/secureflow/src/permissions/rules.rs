//! The `run:` step rule table and the job-scoped context it reads.

use regex::Regex;
use std::sync::LazyLock;
use workflow_models::common::{Env, Permission};

use super::{JobFailure, grants::ScopeGrant};
use crate::{PLATFORM_TOKEN, is_platform_token};

/// Package registry state set up by earlier steps of the same job.
///
/// Each step classification takes the context produced by the steps
/// before it and returns the context for the steps after it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct JobContext {
    pub npm_registry: Option<String>,
    pub nuget_source: Option<String>,
    pub nuget_credential: Option<String>,
}

impl JobContext {
    /// Folds in whatever a `uses:` step configures for later steps.
    pub fn after_action(mut self, path: &str, with: &Env, env: &Env) -> Self {
        let value = |map: &Env, key: &str| {
            map.get(key)
                .map(ToString::to_string)
                .filter(|v| !v.is_empty())
        };

        match path.to_lowercase().as_str() {
            "actions/setup-node" => {
                if let Some(registry) = value(with, "registry-url") {
                    self.npm_registry = Some(registry);
                }
            }
            "actions/setup-dotnet" => {
                if let Some(source) = value(with, "source-url") {
                    self.nuget_source = Some(source);
                }
                if let Some(credential) = value(env, "NUGET_AUTH_TOKEN") {
                    self.nuget_credential = Some(credential);
                }
            }
            _ => {}
        }

        self
    }

    fn publishes_to_npm_registry(&self) -> bool {
        self.npm_registry
            .as_deref()
            .is_some_and(|r| r.contains("npm.pkg.github.com"))
    }

    fn pushes_to_nuget_registry(&self) -> bool {
        self.nuget_source
            .as_deref()
            .is_some_and(|s| s.contains("pkg.github.com"))
    }
}

#[allow(clippy::unwrap_used)]
static NUGET_KEYED_PUSH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)(?:-k|--api-key)[\s=]+["']?\$\{\{\s*(?:secrets\.github_token|github\.token)\s*\}\}"#,
    )
    .unwrap()
});

fn env_is_token(env: &Env, name: &str) -> bool {
    env.get(name)
        .is_some_and(|value| is_platform_token(&value.to_string()))
}

fn env_carries_token(env: &Env) -> bool {
    env.values().any(|value| is_platform_token(&value.to_string()))
}

fn contains_any(script: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| script.contains(needle))
}

/// Rewrites references to env vars that hold the platform token
/// (`$NAME`, `${NAME}`, `${{ env.NAME }}`) into the token itself, so that
/// the rules see where the token ends up.
pub fn substitute_token_references(script: &str, env: &Env) -> String {
    let mut script = script.to_string();

    for (name, value) in env {
        if !is_platform_token(&value.to_string()) {
            continue;
        }

        let name = regex::escape(name);
        let Ok(reference) = Regex::new(&format!(
            r"\$\{{{name}\}}|\$\{{\{{\s*env\.{name}\s*\}}\}}|\${name}\b"
        )) else {
            continue;
        };

        script = reference
            .replace_all(&script, regex::NoExpand(PLATFORM_TOKEN))
            .into_owned();
    }

    script
}

/// Classifies a `run:` step. The first matching rule wins.
pub fn classify_run(run: &str, env: &Env, context: &JobContext) -> Result<Vec<ScopeGrant>, JobFailure> {
    use Permission::{Read, Write};

    let script = substitute_token_references(run, env);
    let grant = ScopeGrant::new;

    if env_is_token(env, "REVIEWDOG_GITHUB_API_TOKEN") && script.contains("reviewdog") {
        return Ok(vec![grant("checks", Write), grant("pull-requests", Write)]);
    }

    if env_is_token(env, "NODE_AUTH_TOKEN") && context.publishes_to_npm_registry() {
        if contains_any(&script, &["npm install", "npm ci", "yarn install"]) {
            return Ok(vec![grant("packages", Read)]);
        }
        if contains_any(&script, &["npm publish", "yarn publish"]) {
            return Ok(vec![grant("packages", Write)]);
        }
    }

    if script.contains("dotnet nuget push") {
        if !contains_any(&script, &["-k", "--api-key"]) {
            let credential = context
                .nuget_credential
                .as_deref()
                .is_some_and(is_platform_token)
                || env_is_token(env, "NUGET_AUTH_TOKEN");

            if context.pushes_to_nuget_registry() && credential {
                return Ok(vec![grant("packages", Write)]);
            }
        } else if NUGET_KEYED_PUSH.is_match(&script) {
            return Ok(vec![grant("packages", Write)]);
        }
    }

    if script.contains("curl")
        && script.contains("PUT")
        && is_platform_token(&script)
        && script.contains("nuget.pkg.github.com")
    {
        return Ok(vec![grant("packages", Write)]);
    }

    if contains_any(&script, &["git push", "git apply"]) {
        return Ok(vec![grant("contents", Write)]);
    }

    if script.contains("mkdocs gh-deploy") {
        return Ok(vec![grant("contents", Write)]);
    }

    let token_in_env = env_carries_token(env);

    if token_in_env && contains_any(&script, &["gradle publish", "./gradlew publish", "mvn deploy"]) {
        return Ok(vec![grant("packages", Write)]);
    }

    if token_in_env {
        if contains_any(
            &script,
            &["gh pr create", "gh pr merge", "gh pr comment", "gh pr edit"],
        ) {
            return Ok(vec![grant("contents", Write), grant("pull-requests", Write)]);
        }
        if script.contains("gh issue") {
            return Ok(vec![grant("issues", Write)]);
        }
        if script.contains("gh release") {
            return Ok(vec![grant("contents", Write)]);
        }
    }

    if is_platform_token(&script) {
        return Err(JobFailure::TokenInRunStep);
    }

    if token_in_env {
        return Err(JobFailure::TokenInRunStepEnv);
    }

    Ok(vec![])
}
