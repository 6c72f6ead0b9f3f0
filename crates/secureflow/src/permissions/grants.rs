//! Scope grants and how a job's grants combine.

use std::fmt::{self, Display};

use indexmap::IndexMap;
use serde::Serialize;
use workflow_models::common::Permission;

/// A single `scope: level` line in a job's `permissions:` block.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ScopeGrant {
    pub scope: String,
    pub level: Permission,
    /// Why the scope is needed, rendered as a trailing comment.
    pub attribution: Option<String>,
}

impl ScopeGrant {
    /// A grant with no attribution, as produced for `run:` steps.
    pub fn new(scope: &str, level: Permission) -> Self {
        Self {
            scope: scope.into(),
            level,
            attribution: None,
        }
    }

    /// A grant attributed to the action that needs it, e.g.
    /// `contents: read # for actions/checkout to fetch code`.
    pub fn for_action(scope: &str, level: Permission, action: &str, reason: Option<&str>) -> Self {
        let attribution = match reason.filter(|r| !r.is_empty()) {
            Some(reason) => format!("for {action} {reason}"),
            None => format!("for {action}"),
        };

        Self {
            scope: scope.into(),
            level,
            attribution: Some(attribution),
        }
    }

    /// The grant a job gets when nothing it does needs the token.
    pub fn sentinel() -> Self {
        Self::new("contents", Permission::None)
    }
}

impl Display for ScopeGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.scope, self.level)?;
        if let Some(attribution) = &self.attribution {
            write!(f, " # {attribution}")?;
        }
        Ok(())
    }
}

/// Merges a job's grants into at most one grant per scope, sorted by
/// scope name.
///
/// A write grant replaces any read grant for the same scope. Among grants
/// of equal level, the first one (and its attribution) is kept.
pub fn merge_grants(grants: impl IntoIterator<Item = ScopeGrant>) -> Vec<ScopeGrant> {
    let mut merged: IndexMap<String, ScopeGrant> = IndexMap::new();

    for grant in grants {
        match merged.get_mut(&grant.scope) {
            Some(existing) if grant.level == Permission::Write && existing.level != Permission::Write => {
                *existing = grant;
            }
            Some(_) => {}
            None => {
                merged.insert(grant.scope.clone(), grant);
            }
        }
    }

    let mut merged: Vec<_> = merged.into_values().collect();
    merged.sort_by(|a, b| a.scope.cmp(&b.scope));
    merged
}

/// Merges grants and applies the non-empty floor: a job that needs
/// nothing still gets an explicit `contents: none`.
pub fn finalize_grants(grants: impl IntoIterator<Item = ScopeGrant>) -> Vec<ScopeGrant> {
    let merged = merge_grants(grants);
    if merged.is_empty() {
        vec![ScopeGrant::sentinel()]
    } else {
        merged
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use workflow_models::common::Permission;

    use super::{ScopeGrant, finalize_grants, merge_grants};

    #[test]
    fn test_render() {
        assert_eq!(
            ScopeGrant::new("contents", Permission::Write).to_string(),
            "contents: write"
        );
        assert_eq!(
            ScopeGrant::for_action(
                "contents",
                Permission::Read,
                "actions/checkout",
                Some("to fetch code (actions/checkout)")
            )
            .to_string(),
            "contents: read # for actions/checkout to fetch code (actions/checkout)"
        );
        assert_eq!(
            ScopeGrant::for_action("checks", Permission::Write, "a/b", None).to_string(),
            "checks: write # for a/b"
        );
        assert_eq!(ScopeGrant::sentinel().to_string(), "contents: none");
    }

    #[test]
    fn test_merge_write_wins() {
        let merged = merge_grants([
            ScopeGrant::for_action("contents", Permission::Read, "actions/checkout", None),
            ScopeGrant::new("pull-requests", Permission::Write),
            ScopeGrant::new("contents", Permission::Write),
            ScopeGrant::for_action("contents", Permission::Read, "other/action", None),
            ScopeGrant::new("checks", Permission::Write),
        ]);

        let rendered: Vec<_> = merged.iter().map(ToString::to_string).collect();
        assert_eq!(
            rendered,
            ["checks: write", "contents: write", "pull-requests: write"]
        );
    }

    #[test]
    fn test_merge_keeps_first_of_equal_level() {
        let merged = merge_grants([
            ScopeGrant::for_action("contents", Permission::Read, "first/action", None),
            ScopeGrant::for_action("contents", Permission::Read, "second/action", None),
        ]);

        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].to_string(), "contents: read # for first/action");
    }

    #[test]
    fn test_non_empty_floor() {
        assert_eq!(finalize_grants([]), [ScopeGrant::sentinel()]);
        assert_eq!(
            finalize_grants([ScopeGrant::new("issues", Permission::Write)]),
            [ScopeGrant::new("issues", Permission::Write)]
        );
    }
}
