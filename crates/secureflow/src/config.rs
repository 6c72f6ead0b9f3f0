use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;
use serde::Deserialize;
use thiserror::Error;

use crate::harden::is_valid_wrapper;

const CONFIG_CANDIDATES: &[&str] = &[
    ".github/secureflow.yml",
    ".github/secureflow.yaml",
    "secureflow.yml",
    "secureflow.yaml",
];

#[derive(Error, Debug)]
#[error("configuration error in {path}")]
pub struct ConfigError {
    /// The path to the configuration file that caused this error.
    path: String,
    /// The source of this error.
    #[source]
    pub source: ConfigErrorInner,
}

#[derive(Error, Debug)]
pub enum ConfigErrorInner {
    /// An I/O error occurred while loading the file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file is syntactically invalid.
    #[error("invalid configuration syntax")]
    Syntax(#[source] serde_yaml::Error),

    /// `harden-runner` doesn't name a repository action.
    #[error("invalid `harden-runner` reference: {0}")]
    InvalidWrapper(String),
}

/// Data model for secureflow's configuration file.
///
/// Every field is optional; anything unset falls back to the CLI's
/// defaults.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct Config {
    /// Glob patterns for actions that are never pinned.
    #[serde(default)]
    pub exempt_actions: Vec<String>,
    /// Prefer immutable release versions over commit SHAs.
    #[serde(default)]
    pub pin_to_immutable: bool,
    /// Original action (`owner/repo`) to maintained replacement.
    #[serde(default)]
    pub maintained_actions: IndexMap<String, String>,
    /// A JSON list of maintained actions, merged under `maintained-actions`.
    pub maintained_actions_file: Option<Utf8PathBuf>,
    /// The monitoring action to inject.
    pub harden_runner: Option<String>,
    #[serde(default)]
    pub skip_container_jobs: bool,
    #[serde(default)]
    pub add_empty_top_level_permissions: bool,
    #[serde(default)]
    pub add_project_comment: bool,
    /// Don't report actions missing from the knowledge base.
    #[serde(default)]
    pub ignore_missing_kbs: bool,
    /// Root of an on-disk knowledge base.
    pub knowledge_base: Option<Utf8PathBuf>,
}

impl Config {
    /// Loads a [`Config`] from the given contents.
    pub fn load(contents: &str) -> Result<Self, ConfigErrorInner> {
        let config: Self = serde_yaml::from_str(contents).map_err(ConfigErrorInner::Syntax)?;

        if let Some(wrapper) = &config.harden_runner
            && !is_valid_wrapper(wrapper)
        {
            return Err(ConfigErrorInner::InvalidWrapper(wrapper.clone()));
        }

        Ok(config)
    }

    /// Loads a [`Config`] from an explicit path.
    pub fn global(path: &Utf8Path) -> Result<Self, ConfigError> {
        tracing::debug!("loading config from `{path}`");

        fs::read_to_string(path)
            .map_err(ConfigErrorInner::from)
            .and_then(|contents| Self::load(&contents))
            .map_err(|source| ConfigError {
                path: path.to_string(),
                source,
            })
    }

    /// Discovers a [`Config`] starting at `path` and walking upwards,
    /// stopping at the first directory containing `.git`.
    pub fn discover(path: &Utf8Path) -> Result<Option<Self>, ConfigError> {
        Self::discover_in_dir(path).map_err(|source| ConfigError {
            path: path.to_string(),
            source,
        })
    }

    fn discover_in_dir(path: &Utf8Path) -> Result<Option<Self>, ConfigErrorInner> {
        tracing::debug!("attempting config discovery in `{path}`");

        let canonical = path.canonicalize_utf8()?;
        let mut candidate_path = canonical.as_path();

        loop {
            for candidate in CONFIG_CANDIDATES {
                let candidate_path = candidate_path.join(candidate);
                if candidate_path.is_file() {
                    tracing::debug!("found config candidate at `{candidate_path}`");
                    return Ok(Some(Self::load(&fs::read_to_string(&candidate_path)?)?));
                }
            }

            if candidate_path.join(".git").is_dir() {
                tracing::debug!("found `{candidate_path}/.git`, stopping search");
                return Ok(None);
            }

            let Some(parent) = candidate_path.parent() else {
                tracing::debug!("reached filesystem root without finding a config");
                return Ok(None);
            };

            candidate_path = parent;
        }
    }
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;
    use pretty_assertions::assert_eq;

    use super::{Config, ConfigErrorInner};

    #[test]
    fn test_load() {
        let config = Config::load(
            r#"
exempt-actions:
  - my-org/*
pin-to-immutable: true
maintained-actions:
  amannn/action-semantic-pull-request: step-security/action-semantic-pull-request
harden-runner: my-org/monitor@v1
knowledge-base: kb
"#,
        )
        .unwrap();

        assert_eq!(config.exempt_actions, ["my-org/*"]);
        assert!(config.pin_to_immutable);
        assert!(!config.skip_container_jobs);
        assert_eq!(config.harden_runner.as_deref(), Some("my-org/monitor@v1"));
        assert_eq!(config.knowledge_base, Some(Utf8PathBuf::from("kb")));
        assert_eq!(config.maintained_actions.len(), 1);

        assert_eq!(Config::load("{}").unwrap(), Config::default());
    }

    #[test]
    fn test_load_invalid() {
        assert!(matches!(
            Config::load("pin-to-mutable: true"),
            Err(ConfigErrorInner::Syntax(_))
        ));
        assert!(matches!(
            Config::load("harden-runner: ./local"),
            Err(ConfigErrorInner::InvalidWrapper(_))
        ));
    }

    #[test]
    fn test_discover() {
        let dir = std::env::temp_dir().join(format!("secureflow-config-{}", std::process::id()));
        let nested = dir.join("a/b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::create_dir_all(dir.join(".git")).unwrap();
        std::fs::write(dir.join("secureflow.yml"), "skip-container-jobs: true\n").unwrap();

        let nested = Utf8PathBuf::try_from(nested).unwrap();
        let config = Config::discover(&nested).unwrap().unwrap();
        assert!(config.skip_container_jobs);

        std::fs::remove_file(dir.join("secureflow.yml")).unwrap();
        assert_eq!(Config::discover(&nested).unwrap(), None);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
