//! Guard expressions over a step's inputs.
//!
//! A knowledge base can make a scope requirement conditional, e.g.
//! "`contents: read`, but only if the step sets `sync-labels`". The
//! condition is written in a tiny subset of the platform's expression
//! language:
//!
//! * `string`, number, boolean, and `null` literals
//! * the `with` context, plus `with.name` and `with['name']`
//! * `==` and `!=`
//! * `contains`, `startsWith`, and `endsWith`
//! * `!`, `&&`, `||`, and parentheses
//!
//! Anything outside of this subset is a [`ParseError`], and
//! [`evaluate`] treats every error as `false`.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

use std::{collections::HashMap, fmt::Display};

use indexmap::IndexMap;
use itertools::Itertools;
use pest::{
    Parser,
    iterators::{Pair, Pairs},
};
use thiserror::Error;

use self::parser::{ExprParser, Rule};

// Isolates the ExprParser, Rule and other generated types
// so that we can do `missing_docs` at the top-level.
// See: https://github.com/pest-parser/pest/issues/326
mod parser {
    use pest_derive::Parser;

    /// A parser for guard expressions.
    #[derive(Parser)]
    #[grammar = "expr.pest"]
    pub struct ExprParser;
}

/// Errors produced while parsing a guard expression.
#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    /// The expression isn't syntactically valid.
    #[error("invalid expression: {0}")]
    Syntax(String),
    /// The expression reads a context other than `with`.
    #[error("unknown context `{0}`")]
    UnknownContext(String),
    /// The expression reaches into `with` in an unsupported way,
    /// e.g. `with.foo.bar` or `with[0]`.
    #[error("unsupported context access `{0}`")]
    UnsupportedAccess(String),
    /// The expression calls a function we don't know.
    #[error("unknown function `{0}`")]
    UnknownFunction(String),
    /// A known function was called with the wrong number of arguments.
    #[error("`{func}` takes {expected} arguments, but {actual} were given")]
    Arity {
        /// The function's name.
        func: &'static str,
        /// The number of arguments the function takes.
        expected: usize,
        /// The number of arguments it was given.
        actual: usize,
    },
}

/// Functions callable from a guard expression.
///
/// Function names are case-insensitive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Function {
    /// `contains(haystack, needle)`
    Contains,
    /// `startsWith(string, prefix)`
    StartsWith,
    /// `endsWith(string, suffix)`
    EndsWith,
}

impl Function {
    fn from_name(name: &str) -> Option<Self> {
        [Self::Contains, Self::StartsWith, Self::EndsWith]
            .into_iter()
            .find(|func| func.name().eq_ignore_ascii_case(name))
    }

    fn name(&self) -> &'static str {
        match self {
            Function::Contains => "contains",
            Function::StartsWith => "startsWith",
            Function::EndsWith => "endsWith",
        }
    }
}

/// Binary operations allowed in an expression.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BinOp {
    /// `expr && expr`
    And,
    /// `expr || expr`
    Or,
    /// `expr == expr`
    Eq,
    /// `expr != expr`
    Neq,
}

/// Represents a parsed guard expression.
#[derive(Debug, PartialEq)]
pub enum Expr {
    /// A number literal.
    Number(f64),
    /// A string literal.
    String(String),
    /// A boolean literal.
    Boolean(bool),
    /// The `null` literal.
    Null,
    /// The bare `with` context, i.e. all of the step's inputs.
    Inputs,
    /// A single input, e.g. `with.token` or `with['token']`.
    Input(String),
    /// A function call.
    Call {
        /// The function being called.
        func: Function,
        /// The function's arguments.
        args: Vec<Expr>,
    },
    /// A binary operation.
    BinOp {
        /// The LHS of the binop.
        lhs: Box<Expr>,
        /// The binary operator.
        op: BinOp,
        /// The RHS of the binop.
        rhs: Box<Expr>,
    },
    /// `!expr`
    Not(Box<Expr>),
}

/// A source of step inputs for the `with` context.
///
/// Input names are looked up case-insensitively.
pub trait Inputs {
    /// Returns the named input's value, rendered as a string.
    fn input(&self, name: &str) -> Option<String>;
}

impl<K: AsRef<str>, V: Display> Inputs for IndexMap<K, V> {
    fn input(&self, name: &str) -> Option<String> {
        self.iter()
            .find(|(k, _)| k.as_ref().eq_ignore_ascii_case(name))
            .map(|(_, v)| v.to_string())
    }
}

impl<K: AsRef<str>, V: Display> Inputs for HashMap<K, V> {
    fn input(&self, name: &str) -> Option<String> {
        self.iter()
            .find(|(k, _)| k.as_ref().eq_ignore_ascii_case(name))
            .map(|(_, v)| v.to_string())
    }
}

/// The result of evaluating an [`Expr`].
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    /// A string.
    String(String),
    /// A number.
    Number(f64),
    /// A boolean.
    Boolean(bool),
    /// `null`, including any input that wasn't set.
    Null,
    /// The `with` context as a whole.
    Inputs,
}

impl Evaluation {
    /// Returns this evaluation's truthiness.
    pub fn as_boolean(&self) -> bool {
        match self {
            Evaluation::String(s) => !s.is_empty(),
            Evaluation::Number(n) => *n != 0.0 && !n.is_nan(),
            Evaluation::Boolean(b) => *b,
            Evaluation::Null => false,
            Evaluation::Inputs => true,
        }
    }

    /// Coerces this evaluation to a number, the way loose equality does.
    fn as_number(&self) -> f64 {
        match self {
            Evaluation::String(s) if s.trim().is_empty() => 0.0,
            Evaluation::String(s) => s.trim().parse().unwrap_or(f64::NAN),
            Evaluation::Number(n) => *n,
            Evaluation::Boolean(b) => f64::from(u8::from(*b)),
            Evaluation::Null => 0.0,
            Evaluation::Inputs => f64::NAN,
        }
    }

    /// Loose equality: strings compare case-insensitively, and mismatched
    /// primitive types are compared as numbers.
    fn loose_eq(&self, other: &Evaluation) -> bool {
        match (self, other) {
            (Evaluation::String(a), Evaluation::String(b)) => a.to_lowercase() == b.to_lowercase(),
            (Evaluation::Boolean(a), Evaluation::Boolean(b)) => a == b,
            (Evaluation::Null, Evaluation::Null) => true,
            (Evaluation::Inputs, Evaluation::Inputs) => true,
            (Evaluation::Inputs, _) | (_, Evaluation::Inputs) => false,
            (a, b) => a.as_number() == b.as_number(),
        }
    }
}

impl Display for Evaluation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Evaluation::String(s) => write!(f, "{s}"),
            Evaluation::Number(n) if n.fract() == 0.0 && n.is_finite() => write!(f, "{n:.0}"),
            Evaluation::Number(n) => write!(f, "{n}"),
            Evaluation::Boolean(b) => write!(f, "{b}"),
            Evaluation::Null => Ok(()),
            Evaluation::Inputs => write!(f, "Object"),
        }
    }
}

/// Evaluates `expression` against a step's inputs.
///
/// The expression may be wrapped in `${{ }}`. Expressions that don't
/// parse evaluate to `false`.
pub fn evaluate(expression: &str, inputs: &dyn Inputs) -> bool {
    match Expr::parse(expression) {
        Ok(expr) => expr.evaluate(inputs).as_boolean(),
        Err(_) => false,
    }
}

impl Expr {
    /// Parses the given string into an expression.
    ///
    /// Surrounding `${{ }}` delimiters are optional.
    pub fn parse(expression: &str) -> Result<Expr, ParseError> {
        let expression = strip_delimiters(expression);

        // Top level `expression` is a single `or_expr` between SOI and EOI.
        let mut top = ExprParser::parse(Rule::expression, expression)
            .map_err(|e| ParseError::Syntax(e.to_string()))?;
        let or_expr = next(&mut next(&mut top)?.into_inner())?;

        parse_pair(or_expr)
    }

    /// Evaluates this expression against the given inputs.
    pub fn evaluate(&self, inputs: &dyn Inputs) -> Evaluation {
        match self {
            Expr::Number(n) => Evaluation::Number(*n),
            Expr::String(s) => Evaluation::String(s.clone()),
            Expr::Boolean(b) => Evaluation::Boolean(*b),
            Expr::Null => Evaluation::Null,
            Expr::Inputs => Evaluation::Inputs,
            Expr::Input(name) => inputs
                .input(name)
                .map_or(Evaluation::Null, Evaluation::String),
            Expr::Call { func, args } => {
                let args: Vec<_> = args.iter().map(|arg| arg.evaluate(inputs)).collect();
                match (func, args.as_slice()) {
                    (Function::Contains, [Evaluation::Inputs, needle]) => {
                        Evaluation::Boolean(inputs.input(&needle.to_string()).is_some())
                    }
                    (Function::Contains, [haystack, needle]) => Evaluation::Boolean(
                        haystack
                            .to_string()
                            .to_lowercase()
                            .contains(&needle.to_string().to_lowercase()),
                    ),
                    (Function::StartsWith, [string, prefix]) => Evaluation::Boolean(
                        !matches!(string, Evaluation::Inputs)
                            && string
                                .to_string()
                                .to_lowercase()
                                .starts_with(&prefix.to_string().to_lowercase()),
                    ),
                    (Function::EndsWith, [string, suffix]) => Evaluation::Boolean(
                        !matches!(string, Evaluation::Inputs)
                            && string
                                .to_string()
                                .to_lowercase()
                                .ends_with(&suffix.to_string().to_lowercase()),
                    ),
                    // Arity is checked at parse time.
                    _ => Evaluation::Null,
                }
            }
            Expr::BinOp { lhs, op, rhs } => {
                let lhs = lhs.evaluate(inputs);
                match op {
                    // `&&` and `||` short-circuit and yield one of their operands.
                    BinOp::And if !lhs.as_boolean() => lhs,
                    BinOp::And => rhs.evaluate(inputs),
                    BinOp::Or if lhs.as_boolean() => lhs,
                    BinOp::Or => rhs.evaluate(inputs),
                    BinOp::Eq => Evaluation::Boolean(lhs.loose_eq(&rhs.evaluate(inputs))),
                    BinOp::Neq => Evaluation::Boolean(!lhs.loose_eq(&rhs.evaluate(inputs))),
                }
            }
            Expr::Not(expr) => Evaluation::Boolean(!expr.evaluate(inputs).as_boolean()),
        }
    }
}

fn strip_delimiters(expression: &str) -> &str {
    let trimmed = expression.trim();
    trimmed
        .strip_prefix("${{")
        .and_then(|inner| inner.strip_suffix("}}"))
        .map_or(trimmed, str::trim)
}

fn next<'src>(pairs: &mut Pairs<'src, Rule>) -> Result<Pair<'src, Rule>, ParseError> {
    pairs
        .next()
        .ok_or_else(|| ParseError::Syntax("unexpected end of expression".into()))
}

fn binop(lhs: Expr, op: BinOp, rhs: Expr) -> Expr {
    Expr::BinOp {
        lhs: lhs.into(),
        op,
        rhs: rhs.into(),
    }
}

fn parse_pair(pair: Pair<'_, Rule>) -> Result<Expr, ParseError> {
    // The grammar isn't left-recursive, so `a || b || c` arrives as a
    // single many-headed `or_expr`. Fold those into left-associated
    // binops, and punch single-element rules through to their child.
    match pair.as_rule() {
        Rule::or_expr | Rule::and_expr => {
            let op = match pair.as_rule() {
                Rule::or_expr => BinOp::Or,
                _ => BinOp::And,
            };
            let mut pairs = pair.into_inner();
            let lhs = parse_pair(next(&mut pairs)?)?;
            pairs.try_fold(lhs, |expr, rhs| Ok(binop(expr, op, parse_pair(rhs)?)))
        }
        Rule::eq_expr => {
            // `eq_op` is captured, so the tail arrives as (eq_op, unary_expr) pairs.
            let mut pairs = pair.into_inner();
            let lhs = parse_pair(next(&mut pairs)?)?;

            let chunks = pairs.chunks(2);
            chunks.into_iter().try_fold(lhs, |expr, mut chunk| {
                let op = match next_in(&mut chunk)?.as_str() {
                    "==" => BinOp::Eq,
                    _ => BinOp::Neq,
                };
                Ok(binop(expr, op, parse_pair(next_in(&mut chunk)?)?))
            })
        }
        Rule::unary_expr => {
            let mut nots = 0;
            let mut operand = None;
            for inner in pair.into_inner() {
                match inner.as_rule() {
                    Rule::unary_op => nots += 1,
                    _ => operand = Some(parse_pair(inner)?),
                }
            }

            let operand = operand.ok_or_else(|| ParseError::Syntax("missing operand".into()))?;
            Ok((0..nots).fold(operand, |expr, _| Expr::Not(expr.into())))
        }
        Rule::primary_expr => parse_pair(next(&mut pair.into_inner())?),
        Rule::number => pair
            .as_str()
            .parse()
            .map(Expr::Number)
            .map_err(|_| ParseError::Syntax(format!("invalid number `{}`", pair.as_str()))),
        // string -> string_inner
        Rule::string => Ok(Expr::String(
            next(&mut pair.into_inner())?.as_str().replace("''", "'"),
        )),
        Rule::boolean => Ok(Expr::Boolean(pair.as_str() == "true")),
        Rule::null => Ok(Expr::Null),
        Rule::function_call => {
            let mut pairs = pair.into_inner();
            let name = next(&mut pairs)?.as_str();
            let func =
                Function::from_name(name).ok_or_else(|| ParseError::UnknownFunction(name.into()))?;

            let args = pairs.map(parse_pair).collect::<Result<Vec<_>, _>>()?;
            if args.len() != 2 {
                return Err(ParseError::Arity {
                    func: func.name(),
                    expected: 2,
                    actual: args.len(),
                });
            }

            Ok(Expr::Call { func, args })
        }
        Rule::context => parse_context(pair),
        r => Err(ParseError::Syntax(format!("unexpected {r:?}"))),
    }
}

fn next_in<'src>(
    chunk: &mut impl Iterator<Item = Pair<'src, Rule>>,
) -> Result<Pair<'src, Rule>, ParseError> {
    chunk
        .next()
        .ok_or_else(|| ParseError::Syntax("dangling operator".into()))
}

/// `with`, `with.name`, or `with['name']`; nothing else.
fn parse_context(pair: Pair<'_, Rule>) -> Result<Expr, ParseError> {
    let raw = pair.as_str();
    let mut pairs = pair.into_inner();

    let head = next(&mut pairs)?.as_str();
    if !head.eq_ignore_ascii_case("with") {
        return Err(ParseError::UnknownContext(head.into()));
    }

    let Some(component) = pairs.next() else {
        return Ok(Expr::Inputs);
    };
    if pairs.next().is_some() {
        return Err(ParseError::UnsupportedAccess(raw.into()));
    }

    match component.as_rule() {
        Rule::identifier => Ok(Expr::Input(component.as_str().into())),
        Rule::index => match parse_pair(next(&mut component.into_inner())?)? {
            Expr::String(name) => Ok(Expr::Input(name)),
            _ => Err(ParseError::UnsupportedAccess(raw.into())),
        },
        _ => Err(ParseError::UnsupportedAccess(raw.into())),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use pretty_assertions::assert_eq;

    use super::{BinOp, Expr, Function, ParseError, evaluate};

    fn inputs(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_shapes() {
        assert_eq!(
            Expr::parse("${{ contains(with, 'sync-labels') }}").unwrap(),
            Expr::Call {
                func: Function::Contains,
                args: vec![Expr::Inputs, Expr::String("sync-labels".into())],
            }
        );

        assert_eq!(
            Expr::parse("with.a == 'x' || !with['b']").unwrap(),
            Expr::BinOp {
                lhs: Expr::BinOp {
                    lhs: Expr::Input("a".into()).into(),
                    op: BinOp::Eq,
                    rhs: Expr::String("x".into()).into(),
                }
                .into(),
                op: BinOp::Or,
                rhs: Expr::Not(Expr::Input("b".into()).into()).into(),
            }
        );

        assert_eq!(
            Expr::parse("'it''s'").unwrap(),
            Expr::String("it's".into())
        );
        assert_eq!(Expr::parse("-1.5").unwrap(), Expr::Number(-1.5));
        assert_eq!(Expr::parse("(null)").unwrap(), Expr::Null);
        assert_eq!(
            Expr::parse("!!true").unwrap(),
            Expr::Not(Expr::Not(Expr::Boolean(true).into()).into())
        );
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            Expr::parse("github.token == 'x'"),
            Err(ParseError::UnknownContext("github".into()))
        );
        assert_eq!(
            Expr::parse("with.a.b"),
            Err(ParseError::UnsupportedAccess("with.a.b".into()))
        );
        assert_eq!(
            Expr::parse("with[0]"),
            Err(ParseError::UnsupportedAccess("with[0]".into()))
        );
        assert_eq!(
            Expr::parse("format('{0}', 1)"),
            Err(ParseError::UnknownFunction("format".into()))
        );
        assert_eq!(
            Expr::parse("contains(with)"),
            Err(ParseError::Arity {
                func: "contains",
                expected: 2,
                actual: 1
            })
        );
        assert!(matches!(
            Expr::parse("with.a =="),
            Err(ParseError::Syntax(_))
        ));
        assert!(matches!(Expr::parse(""), Err(ParseError::Syntax(_))));
    }

    #[test]
    fn test_contains_on_inputs_checks_keys() {
        let with = inputs(&[("sync-labels", ""), ("repo-token", "abc")]);

        assert!(evaluate("${{ contains(with, 'sync-labels') }}", &with));
        assert!(evaluate("contains(with, 'SYNC-LABELS')", &with));
        assert!(!evaluate("contains(with, 'configuration-path')", &with));
    }

    #[test]
    fn test_string_functions() {
        let with = inputs(&[("ref", "refs/heads/Main")]);

        assert!(evaluate("contains(with.ref, 'heads')", &with));
        assert!(evaluate("startsWith(with.ref, 'REFS/')", &with));
        assert!(evaluate("endswith(with.ref, 'main')", &with));
        assert!(!evaluate("endsWith(with.ref, 'dev')", &with));
        assert!(!evaluate("startsWith(with, 'x')", &with));
    }

    #[test]
    fn test_equality() {
        let with = inputs(&[("mode", "Release"), ("count", "3"), ("flag", "true")]);

        let cases = &[
            ("with.mode == 'release'", true),
            ("with.mode != 'release'", false),
            ("with['mode'] == 'debug'", false),
            ("with.count == 3", true),
            ("with.count == 3.0", true),
            ("with.missing == null", true),
            ("with.missing == ''", true),
            ("null == 0", true),
            ("true == 1", true),
            ("with.flag == 'TRUE'", true),
            ("'abc' == 0", false),
        ];

        for (expr, expected) in cases {
            assert_eq!(evaluate(expr, &with), *expected, "{expr}");
        }
    }

    #[test]
    fn test_logic_and_truthiness() {
        let with = inputs(&[("a", "x"), ("empty", "")]);

        let cases = &[
            ("with.a", true),
            ("with.empty", false),
            ("with.missing", false),
            ("!with.missing", true),
            ("with.a && with.empty", false),
            ("with.empty || with.a", true),
            ("(with.empty || with.missing) && with.a", false),
            ("with", true),
            ("0", false),
            ("'0'", true),
        ];

        for (expr, expected) in cases {
            assert_eq!(evaluate(expr, &with), *expected, "{expr}");
        }
    }

    #[test]
    fn test_fails_closed() {
        let with = inputs(&[("a", "x")]);

        assert!(!evaluate("with.a ==", &with));
        assert!(!evaluate("secrets.token", &with));
        assert!(!evaluate("${{ with.a", &with));
    }
}
