//! Comment and format-preserving line edits.
//!
//! Every edit here is a pure function from text to text: the lines
//! before and after the edit point are copied through byte for byte.
//! Positions come from [`yamlanchor`], and must have been computed
//! against the exact text being edited.

use thiserror::Error;
use yamlanchor::Anchor;

#[derive(Error, Debug, PartialEq)]
pub enum Error {
    #[error("anchor line {line} is beyond the end of the document ({lines} lines)")]
    LineOutOfRange { line: usize, lines: usize },
    #[error("anchor column {column} is beyond the end of line {line}")]
    ColumnOutOfRange { line: usize, column: usize },
    #[error("`{expected}` doesn't start at line {line}, column {column}")]
    Mismatch {
        line: usize,
        column: usize,
        expected: String,
    },
}

/// Insert `lines` immediately before the anchor's line.
///
/// Each inserted line is indented to the anchor's column. Empty lines
/// are inserted as-is, so that no trailing whitespace is introduced.
pub fn insert_before<S: AsRef<str>>(
    text: &str,
    anchor: Anchor,
    lines: &[S],
) -> Result<String, Error> {
    let original: Vec<&str> = text.split('\n').collect();
    let at = line_offset(&original, anchor)?;
    let indent = " ".repeat(anchor.column.saturating_sub(1));

    let inserted = lines.iter().map(|line| match line.as_ref() {
        "" => String::new(),
        line => format!("{indent}{line}"),
    });

    let output: Vec<String> = original[..at]
        .iter()
        .map(|line| line.to_string())
        .chain(inserted)
        .chain(original[at..].iter().map(|line| line.to_string()))
        .collect();

    Ok(output.join("\n"))
}

/// Replace the anchor's line from the anchor's column onwards with
/// `replacement`.
///
/// Everything on the line before the column, including indentation and
/// any `- ` or `key: ` prefix, is kept.
pub fn replace_from_column(text: &str, anchor: Anchor, replacement: &str) -> Result<String, Error> {
    let lines: Vec<&str> = text.split('\n').collect();
    let at = line_offset(&lines, anchor)?;

    let line = lines[at];
    let split = column_offset(line, anchor)?;

    let edited = format!("{}{replacement}", &line[..split]);

    Ok(replace_line(&lines, at, &edited))
}

/// Replace `original`, which must start at the anchor and end on the
/// same line, with `replacement`.
///
/// Unlike [`replace_from_column`], whatever follows `original` on the
/// line is kept, so this is safe inside flow collections.
pub fn replace_at(
    text: &str,
    anchor: Anchor,
    original: &str,
    replacement: &str,
) -> Result<String, Error> {
    let lines: Vec<&str> = text.split('\n').collect();
    let at = line_offset(&lines, anchor)?;

    let line = lines[at];
    let split = column_offset(line, anchor)?;
    if original.contains('\n') || !line[split..].starts_with(original) {
        return Err(Error::Mismatch {
            line: anchor.line,
            column: anchor.column,
            expected: original.into(),
        });
    }

    let edited = format!(
        "{}{replacement}{}",
        &line[..split],
        &line[split + original.len()..]
    );

    Ok(replace_line(&lines, at, &edited))
}

fn replace_line(lines: &[&str], at: usize, edited: &str) -> String {
    lines
        .iter()
        .enumerate()
        .map(|(idx, line)| if idx == at { edited } else { *line })
        .collect::<Vec<_>>()
        .join("\n")
}

/// The byte offset of the anchor's column within `line`.
fn column_offset(line: &str, anchor: Anchor) -> Result<usize, Error> {
    let keep = anchor.column.saturating_sub(1);
    match line.char_indices().nth(keep) {
        Some((offset, _)) => Ok(offset),
        None if line.chars().count() == keep => Ok(line.len()),
        None => Err(Error::ColumnOutOfRange {
            line: anchor.line,
            column: anchor.column,
        }),
    }
}

/// The 0-based index of the anchor's line.
fn line_offset(lines: &[&str], anchor: Anchor) -> Result<usize, Error> {
    match anchor.line {
        line if line >= 1 && line <= lines.len() => Ok(line - 1),
        line => Err(Error::LineOutOfRange {
            line,
            lines: lines.len(),
        }),
    }
}
