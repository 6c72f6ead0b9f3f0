//! Security metadata for a single action, as kept in an action
//! knowledge base (`action-security.yml`).

use indexmap::IndexMap;
use serde::Deserialize;

use crate::common::Permission;

/// The knowledge base's view of one action.
#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct ActionMetadata {
    pub name: String,
    /// How the action consumes the platform token, if it does at all.
    #[serde(default)]
    pub github_token: Option<TokenUsage>,
    #[serde(default)]
    pub outbound_endpoints: Vec<OutboundEndpoint>,
}

impl ActionMetadata {
    /// Parse an `action-security.yml` document.
    pub fn from_yaml(source: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(source)
    }
}

#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct TokenUsage {
    /// The input that carries the token.
    #[serde(default)]
    pub action_input: Option<ActionInput>,
    /// The environment variable the action reads the token from.
    #[serde(default)]
    pub environment_variable_name: Option<String>,
    #[serde(default)]
    pub permissions: ScopeRequirements,
}

#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct ActionInput {
    pub input: String,
    /// Whether the input defaults to the platform token when omitted.
    #[serde(default)]
    pub is_default: bool,
}

#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
pub struct OutboundEndpoint {
    pub fqdn: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// A single scope the action needs.
#[derive(Clone, Debug, PartialEq)]
pub struct ScopeRequirement {
    pub level: Permission,
    pub reason: Option<String>,
    /// A guard expression; the scope is only needed when it holds.
    pub condition: Option<String>,
}

/// Scope requirements keyed by scope name, in document order.
///
/// On disk these are a flat mapping where `<scope>-reason` and `<scope>-if`
/// keys annotate the `<scope>` key they prefix.
#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(try_from = "IndexMap<String, String>")]
pub struct ScopeRequirements(IndexMap<String, ScopeRequirement>);

impl ScopeRequirements {
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ScopeRequirement)> {
        self.0.iter().map(|(scope, req)| (scope.as_str(), req))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl TryFrom<IndexMap<String, String>> for ScopeRequirements {
    type Error = String;

    fn try_from(flat: IndexMap<String, String>) -> Result<Self, Self::Error> {
        let mut reasons = IndexMap::new();
        let mut conditions = IndexMap::new();
        let mut scopes = IndexMap::new();

        for (key, value) in flat {
            if let Some(scope) = key.strip_suffix("-reason") {
                reasons.insert(scope.to_string(), value);
            } else if let Some(scope) = key.strip_suffix("-if") {
                conditions.insert(scope.to_string(), value);
            } else {
                let level = match value.as_str() {
                    "read" => Permission::Read,
                    "write" => Permission::Write,
                    "none" => Permission::None,
                    other => return Err(format!("invalid level `{other}` for scope `{key}`")),
                };
                scopes.insert(key, level);
            }
        }

        for orphan in reasons.keys().chain(conditions.keys()) {
            if !scopes.contains_key(orphan) {
                tracing::warn!("annotation for undeclared scope `{orphan}` is ignored");
            }
        }

        Ok(Self(
            scopes
                .into_iter()
                .map(|(scope, level)| {
                    let requirement = ScopeRequirement {
                        level,
                        reason: reasons.swap_remove(&scope),
                        condition: conditions.swap_remove(&scope),
                    };
                    (scope, requirement)
                })
                .collect(),
        ))
    }
}
