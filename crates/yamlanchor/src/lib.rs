//! Line and column anchors for YAML documents.
//!
//! `yamlanchor` answers one question: "where, exactly, does this key's
//! value start?" The answer is an [`Anchor`], a 1-based line and column
//! into the exact text the [`Document`] was built from. Anchors are
//! meant to be fed to a line-level editor; they become stale as soon as
//! the text they were computed from is edited.

#![deny(rustdoc::broken_intra_doc_links)]
#![deny(missing_docs)]
#![allow(clippy::redundant_field_names)]
#![forbid(unsafe_code)]

use thiserror::Error;
use tree_sitter::{Language, Node, Parser, Tree};

/// Extension trait for tree-sitter `Node` to provide fluent node kind checks.
/// The complete list of node types is available at
/// https://github.com/tree-sitter-grammars/tree-sitter-yaml/blob/master/src/node-types.json
/// but only the ones used in this crate are implemented below.
trait NodeExt {
    /// Returns true if this node decorates a value rather than being one
    /// (anchors, tags, and comments).
    fn is_decoration(&self) -> bool;

    /// Returns true if this node is either a block_node or flow_node.
    fn is_block_or_flow_node(&self) -> bool;

    /// Returns true if this node is either a block_mapping_pair or flow_pair.
    fn is_pair(&self) -> bool;

    /// Returns true if this node is a document node.
    fn is_document(&self) -> bool;

    /// Returns true if this node is a quoted scalar.
    fn is_quoted_scalar(&self) -> bool;
}

impl NodeExt for Node<'_> {
    fn is_decoration(&self) -> bool {
        matches!(self.kind(), "anchor" | "tag" | "comment")
    }

    fn is_block_or_flow_node(&self) -> bool {
        matches!(self.kind(), "block_node" | "flow_node")
    }

    fn is_pair(&self) -> bool {
        matches!(self.kind(), "block_mapping_pair" | "flow_pair")
    }

    fn is_document(&self) -> bool {
        self.kind() == "document"
    }

    fn is_quoted_scalar(&self) -> bool {
        matches!(self.kind(), "single_quote_scalar" | "double_quote_scalar")
    }
}

/// Possible errors when building or querying a [`Document`].
#[derive(Error, Debug)]
pub enum QueryError {
    /// The tree-sitter backend couldn't accept the YAML grammar.
    #[error("malformed or unsupported tree-sitter grammar")]
    InvalidLanguage(#[from] tree_sitter::LanguageError),
    /// The user's input YAML is malformed.
    #[error("input is not valid YAML")]
    InvalidInput,
    /// The YAML syntax tree is missing an expected named child node.
    #[error("syntax node `{0}` is missing named child `{1}`")]
    MissingChild(String, String),
}

/// The shape of a value in the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// A block or flow mapping.
    Mapping,
    /// A block or flow sequence.
    Sequence,
    /// Any plain, quoted, or block scalar.
    Scalar,
}

/// A 1-based position in the text a [`Document`] was built from.
///
/// `column` counts characters, not bytes, so that `column - 1` is the
/// number of spaces needed to indent something to the same depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Anchor {
    /// The line, starting at 1.
    pub line: usize,
    /// The column, starting at 1.
    pub column: usize,
}

/// A value located inside a [`Document`].
#[derive(Clone, Copy, Debug)]
pub struct Feature<'doc> {
    doc: &'doc Document,
    /// The value node itself, with any block/flow wrapper, anchor, or
    /// tag already peeled away.
    node: Node<'doc>,
    /// Where this value starts.
    ///
    /// For block collections this is the first entry: the first key of a
    /// mapping, or the `-` of the first item of a sequence. Everything
    /// else anchors at its own start.
    pub anchor: Anchor,
}

impl<'doc> Feature<'doc> {
    fn new(doc: &'doc Document, node: Node<'doc>) -> Self {
        let first_entry = match node.kind() {
            "block_mapping" => Some("block_mapping_pair"),
            "block_sequence" => Some("block_sequence_item"),
            _ => None,
        }
        .and_then(|entry_kind| {
            let mut cursor = node.walk();
            node.named_children(&mut cursor)
                .find(|child| child.kind() == entry_kind)
        });

        Self {
            doc,
            node,
            anchor: doc.anchor_of(first_entry.unwrap_or(node)),
        }
    }

    /// Returns this feature's [`NodeKind`], or `None` for aliases.
    pub fn kind(&self) -> Option<NodeKind> {
        match self.node.kind() {
            "block_mapping" | "flow_mapping" => Some(NodeKind::Mapping),
            "block_sequence" | "flow_sequence" => Some(NodeKind::Sequence),
            "plain_scalar" | "single_quote_scalar" | "double_quote_scalar" | "block_scalar" => {
                Some(NodeKind::Scalar)
            }
            _ => None,
        }
    }

    /// Returns true if this is a flow collection (`{...}` or `[...]`),
    /// which can't have block lines inserted before its anchor.
    pub fn is_flow(&self) -> bool {
        matches!(self.node.kind(), "flow_mapping" | "flow_sequence")
    }

    /// The exact source text of this feature.
    pub fn text(&self) -> &'doc str {
        &self.doc.source()[self.node.byte_range()]
    }

    /// Look up `key` among this mapping's own entries.
    ///
    /// Returns `None` if this isn't a mapping, if the key is absent, or if
    /// the key has no value (`key:`).
    pub fn get(&self, key: &str) -> Option<Feature<'doc>> {
        self.pair(key).and_then(|pair| self.doc.pair_value(pair))
    }

    /// The position of `key` itself among this mapping's own entries.
    pub fn key_anchor(&self, key: &str) -> Option<Anchor> {
        self.pair(key).map(|pair| self.doc.anchor_of(pair))
    }

    /// The values of this sequence's items, in order.
    ///
    /// Empty items (a bare `-`) are skipped. Anything other than a
    /// sequence has no items.
    pub fn items(&self) -> Vec<Feature<'doc>> {
        let mut cursor = self.node.walk();
        self.node
            .named_children(&mut cursor)
            .filter_map(|child| match child.kind() {
                "block_sequence_item" => {
                    let mut cursor = child.walk();
                    let value = child
                        .named_children(&mut cursor)
                        .find(|n| n.is_block_or_flow_node())?;
                    self.doc.unwrap_value(value)
                }
                "flow_node" => self.doc.unwrap_value(child),
                _ => None,
            })
            .collect()
    }

    /// Depth-first search, in document order, within this feature.
    ///
    /// See [`Document::find_node`] for the matching rules.
    pub fn find(&self, identifier: &str, kind: NodeKind, min_line: usize) -> Option<Feature<'doc>> {
        self.doc.search(self.node, identifier, kind, min_line)
    }

    fn pair(&self, key: &str) -> Option<Node<'doc>> {
        let mut cursor = self.node.walk();
        self.node
            .named_children(&mut cursor)
            .filter(|child| child.is_pair())
            .find(|pair| self.doc.key_text(*pair) == Some(key))
    }
}

/// A parsed, read-only YAML document.
#[derive(Debug)]
pub struct Document {
    source: String,
    tree: Tree,
}

impl Document {
    /// Construct a new `Document` from the given YAML.
    pub fn new(source: impl Into<String>) -> Result<Self, QueryError> {
        let source = source.into();

        let mut parser = Parser::new();
        let language: Language = tree_sitter_yaml::LANGUAGE.into();
        parser.set_language(&language)?;

        // Only fails on cancellation or timeout, neither of which we set.
        let tree = parser
            .parse(&source, None)
            .ok_or(QueryError::InvalidInput)?;

        if tree.root_node().has_error() {
            return Err(QueryError::InvalidInput);
        }

        Ok(Self { source, tree })
    }

    /// Return a view of the original YAML source that this document was
    /// loaded from.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Returns a [`Feature`] for the topmost value in this document.
    pub fn root(&self) -> Result<Feature<'_>, QueryError> {
        // All tree-sitter-yaml trees start with a `stream` node.
        let stream = self.tree.root_node();

        // The `document` child might not be the first node in the stream
        // if there are leading comments.
        let mut cursor = stream.walk();
        let document = stream
            .named_children(&mut cursor)
            .find(|c| c.is_document())
            .ok_or_else(|| QueryError::MissingChild(stream.kind().into(), "document".into()))?;

        // Skip any directives section.
        let top = document
            .named_children(&mut cursor)
            .find(|c| c.is_block_or_flow_node())
            .ok_or_else(|| QueryError::MissingChild(document.kind().into(), "block_node".into()))?;

        self.unwrap_value(top)
            .ok_or_else(|| QueryError::MissingChild(top.kind().into(), "value".into()))
    }

    /// Find the first mapping key equal to `identifier` whose value has
    /// the given `kind` and whose anchor lies on a line after `min_line`.
    ///
    /// The search is depth-first in document order, so repeated names
    /// are told apart by passing the line of a previous match as
    /// `min_line`.
    pub fn find_node(&self, identifier: &str, kind: NodeKind, min_line: usize) -> Option<Anchor> {
        self.find(identifier, kind, min_line)
            .map(|feature| feature.anchor)
    }

    /// Like [`Document::find_node`], but returns the whole [`Feature`].
    pub fn find(&self, identifier: &str, kind: NodeKind, min_line: usize) -> Option<Feature<'_>> {
        self.search(self.tree.root_node(), identifier, kind, min_line)
    }

    fn search<'a>(
        &'a self,
        node: Node<'a>,
        identifier: &str,
        kind: NodeKind,
        min_line: usize,
    ) -> Option<Feature<'a>> {
        let mut cursor = node.walk();
        for child in node.named_children(&mut cursor) {
            if child.is_pair() && self.key_text(child) == Some(identifier) {
                let hit = self
                    .pair_value(child)
                    .filter(|value| value.kind() == Some(kind) && value.anchor.line > min_line);
                if hit.is_some() {
                    return hit;
                }
            }

            if let Some(found) = self.search(child, identifier, kind, min_line) {
                return Some(found);
            }
        }

        None
    }

    /// Peel a `block_node`/`flow_node` down to the value it holds.
    fn unwrap_value<'a>(&'a self, node: Node<'a>) -> Option<Feature<'a>> {
        let mut cursor = node.walk();
        node.named_children(&mut cursor)
            .find(|child| !child.is_decoration())
            .map(|value| Feature::new(self, value))
    }

    fn pair_value<'a>(&'a self, pair: Node<'a>) -> Option<Feature<'a>> {
        pair.child_by_field_name("value")
            .and_then(|value| self.unwrap_value(value))
    }

    /// The unquoted text of a pair's key, if it's a scalar.
    fn key_text<'a>(&'a self, pair: Node<'a>) -> Option<&'a str> {
        let key = pair.child_by_field_name("key")?;
        let scalar = self.unwrap_value(key)?;

        match scalar.kind() {
            Some(NodeKind::Scalar) if scalar.node.is_quoted_scalar() => {
                let text = scalar.text();
                text.get(1..text.len().saturating_sub(1))
            }
            Some(NodeKind::Scalar) => Some(scalar.text()),
            _ => None,
        }
    }

    fn anchor_of(&self, node: Node<'_>) -> Anchor {
        let point = node.start_position();
        let line_start = node.start_byte() - point.column;
        let column = self.source[line_start..node.start_byte()].chars().count();

        Anchor {
            line: point.row + 1,
            column: column + 1,
        }
    }
}
