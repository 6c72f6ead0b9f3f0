//! Pinning of action and image references to immutable forms.

use indexmap::IndexMap;
use regex::Regex;
use serde::Serialize;

use crate::remote::{Registry, SourceControl};

pub mod actions;
pub mod images;
pub mod immutable;

pub use actions::{pin_actions, pin_reference};
pub use images::pin_images;
pub use immutable::{check_immutable_batch, is_immutable};

/// Why a reference was left as written.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnchangedReason {
    /// A local action, with no `@<ref>`.
    Local,
    /// Already a commit id or digest.
    Absolute,
    /// Matched an exemption pattern.
    Exempt,
    /// Already an immutable action release.
    Immutable,
    /// Resolving it produced the same text.
    AlreadyPinned,
}

/// What happened to one reference.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum PinOutcome {
    Pinned { to: String },
    Unchanged { reason: UnchangedReason },
    Failed { reason: String },
}

/// The outcome for each distinct reference a stage looked at.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct PinReport {
    pub outcomes: IndexMap<String, PinOutcome>,
}

impl PinReport {
    /// Returns whether any reference was rewritten.
    pub fn updated(&self) -> bool {
        self.outcomes
            .values()
            .any(|outcome| matches!(outcome, PinOutcome::Pinned { .. }))
    }

    pub fn extend(&mut self, other: PinReport) {
        self.outcomes.extend(other.outcomes);
    }
}

/// What pinning needs from its surroundings, bundled for stages that pin
/// as a side effect.
#[derive(Clone, Copy)]
pub struct PinContext<'a> {
    pub source_control: &'a dyn SourceControl,
    pub registry: &'a dyn Registry,
    pub pin_to_immutable: bool,
}

/// A set of `owner/repo[/path]` glob patterns that are never pinned.
///
/// `*` matches any run of characters within one path segment, `?` one
/// character, and `[...]` (or `[^...]`) a character class.
#[derive(Clone, Debug, Default)]
pub struct Exemptions {
    patterns: Vec<Regex>,
}

impl Exemptions {
    /// Compiles `patterns`, skipping (and logging) any that are malformed.
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Self {
        let patterns = patterns
            .iter()
            .filter_map(|pattern| {
                let pattern = pattern.as_ref();
                match glob_to_regex(pattern) {
                    Some(regex) => Some(regex),
                    None => {
                        tracing::warn!("ignoring malformed exemption pattern `{pattern}`");
                        None
                    }
                }
            })
            .collect();

        Self { patterns }
    }

    /// Returns whether `uses` is exempt, judging by the part left of `@`.
    pub fn is_exempt(&self, uses: &str) -> bool {
        let path = uses.split_once('@').map_or(uses, |(path, _)| path);
        self.patterns.iter().any(|pattern| pattern.is_match(path))
    }
}

fn glob_to_regex(glob: &str) -> Option<Regex> {
    let mut regex = String::from("^");
    let mut chars = glob.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '*' => regex.push_str("[^/]*"),
            '?' => regex.push_str("[^/]"),
            '[' => {
                regex.push('[');
                if chars.next_if(|c| *c == '^' || *c == '!').is_some() {
                    regex.push('^');
                }

                let mut closed = false;
                let mut empty = true;
                for c in chars.by_ref() {
                    match c {
                        ']' if !empty => {
                            closed = true;
                            break;
                        }
                        '-' => regex.push('-'),
                        '\\' | '[' | ']' | '^' | '&' | '~' => {
                            regex.push('\\');
                            regex.push(c);
                        }
                        c => regex.push(c),
                    }
                    empty = false;
                }

                if !closed {
                    return None;
                }
                regex.push(']');
            }
            '\\' => regex.push_str(&regex::escape(&chars.next()?.to_string())),
            c => regex.push_str(&regex::escape(&c.to_string())),
        }
    }

    regex.push('$');
    Regex::new(&regex).ok()
}

/// Replaces `reference` with `replacement` wherever it stands alone:
/// not preceded by part of a longer path, and followed by the end of
/// the line, whitespace, a quote, or a flow delimiter (`,`, `}`, `]`).
///
/// A `replacement` of the form `value # comment` keeps the reference's
/// closing quote (if any) before the comment, and drops any comment that
/// previously trailed the reference. The comment is only written where
/// the reference ends its line; inside a flow collection just the value
/// is substituted.
///
/// Returns `None` if `reference` doesn't occur anywhere.
pub(crate) fn substitute_reference(
    text: &str,
    reference: &str,
    replacement: &str,
) -> Option<String> {
    if reference.is_empty() {
        return None;
    }

    let (value, comment) = match replacement.split_once(" # ") {
        Some((value, comment)) => (value, Some(comment)),
        None => (replacement, None),
    };

    let mut found = false;
    let lines: Vec<String> = text
        .split('\n')
        .map(|line| {
            let starts: Vec<usize> = line
                .match_indices(reference)
                .map(|(start, _)| start)
                .filter(|&start| stands_alone(line, start, start + reference.len()))
                .collect();
            let Some(&last) = starts.last() else {
                return line.to_string();
            };
            found = true;

            let mut edited = String::with_capacity(line.len());
            let mut cursor = 0;
            for &start in &starts[..starts.len() - 1] {
                edited.push_str(&line[cursor..start]);
                edited.push_str(value);
                cursor = start + reference.len();
            }
            edited.push_str(&line[cursor..last]);

            let after = &line[last + reference.len()..];
            let quote = match after.chars().next() {
                Some(q @ ('"' | '\'')) => &after[..q.len_utf8()],
                _ => "",
            };
            let rest = &after[quote.len()..];
            let ends_line = rest.trim().is_empty() || rest.trim_start().starts_with('#');
            let eol = match line.ends_with('\r') {
                true => "\r",
                false => "",
            };

            match (comment, ends_line) {
                (Some(comment), true) => {
                    edited.push_str(&format!("{value}{quote} # {comment}{eol}"))
                }
                (None, true) => edited.push_str(&format!("{value}{quote}{eol}")),
                (_, false) => edited.push_str(&format!("{value}{after}")),
            }
            edited
        })
        .collect();

    found.then(|| lines.join("\n"))
}

/// Whether `line[start..end]` is a whole reference rather than part of a
/// longer one.
fn stands_alone(line: &str, start: usize, end: usize) -> bool {
    let before = line[..start].chars().next_back();
    let after = line[end..].chars().next();

    let continues_path = |c: char| c.is_alphanumeric() || matches!(c, '_' | '.' | '/' | '@' | ':' | '-');
    let delimits = |c: char| c.is_whitespace() || matches!(c, '"' | '\'' | ',' | '}' | ']');

    !before.is_some_and(continues_path) && after.is_none_or(delimits)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::{Exemptions, PinOutcome, PinReport, UnchangedReason, substitute_reference};

    #[test]
    fn test_exemptions() {
        let exemptions = Exemptions::new(&[
            "actions/*",
            "my-org/[a-c]?",
            "pinned/[^x]*",
            "broken/[abc",
        ]);

        assert!(exemptions.is_exempt("actions/checkout@v4"));
        assert!(exemptions.is_exempt("actions/cache"));
        // `*` never crosses a path separator.
        assert!(!exemptions.is_exempt("actions/cache/save@v4"));
        assert!(exemptions.is_exempt("my-org/b1@main"));
        assert!(!exemptions.is_exempt("my-org/d1@main"));
        assert!(!exemptions.is_exempt("my-org/b12@main"));
        assert!(exemptions.is_exempt("pinned/y@v1"));
        assert!(!exemptions.is_exempt("pinned/xy@v1"));
        assert!(!exemptions.is_exempt("broken/a@v1"));
        assert!(!exemptions.is_exempt("other/actions@v1"));
    }

    #[test]
    fn test_substitute_is_prefix_safe() {
        let text = "steps:\n  - uses: a/b@v1\n  - uses: a/b@v1.2.3\n  - uses: xa/b@v1\n  - uses: a/b@v1 # old\n";

        assert_eq!(
            substitute_reference(text, "a/b@v1", "a/b@abc # v1.4.0").as_deref(),
            Some("steps:\n  - uses: a/b@abc # v1.4.0\n  - uses: a/b@v1.2.3\n  - uses: xa/b@v1\n  - uses: a/b@abc # v1.4.0\n")
        );
    }

    #[test]
    fn test_substitute_quotes_and_flow() {
        assert_eq!(
            substitute_reference("  - uses: \"a/b@v1\" # v1\n", "a/b@v1", "a/b@abc # v1.4.0")
                .as_deref(),
            Some("  - uses: \"a/b@abc\" # v1.4.0\n")
        );
        assert_eq!(
            substitute_reference("  - { uses: a/b@v1 }\n", "a/b@v1", "a/b@abc # v1.4.0").as_deref(),
            Some("  - { uses: a/b@abc }\n")
        );
        assert_eq!(
            substitute_reference("  - uses: a/b@v1 # v1\r\n", "a/b@v1", "a/b@v1.2.3").as_deref(),
            Some("  - uses: a/b@v1.2.3\r\n")
        );
        // A path ending in the reference is a different reference.
        assert_eq!(
            substitute_reference("  - uses: org/a/b@v1\n", "a/b@v1", "a/b@abc # v1"),
            None
        );
    }

    #[test]
    fn test_substitute_flow_steps() {
        let text = "steps: [{ uses: a/b@v1, with: { k: v } }, { uses: 'a/b@v1' }]\n";

        assert_eq!(
            substitute_reference(text, "a/b@v1", "a/b@abc # v1.4.0").as_deref(),
            Some("steps: [{ uses: a/b@abc, with: { k: v } }, { uses: 'a/b@abc' }]\n")
        );
    }

    #[test]
    fn test_report_updated() {
        let mut report = PinReport::default();
        report.outcomes.insert(
            "a/b@v1".into(),
            PinOutcome::Unchanged {
                reason: UnchangedReason::Exempt,
            },
        );
        assert!(!report.updated());

        let mut other = PinReport::default();
        other
            .outcomes
            .insert("c/d@v1".into(), PinOutcome::Pinned { to: "c/d@abc".into() });
        report.extend(other);
        assert!(report.updated());
    }
}
