//! Selector handles and the parser seam
//!
//! Selector evaluation lives in the external label index. The graph only
//! needs a canonical form and a content-derived id, so that equivalent
//! selectors written differently share one IP set.

use std::fmt;
use std::sync::Arc;

use crate::hash::short_hash;
use crate::{Error, Result, SELECTOR_IP_SET_PREFIX};

/// A parsed, canonicalized selector expression
///
/// Immutable once parsed. Two selectors with the same canonical text are
/// interchangeable.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Selector {
    expression: Arc<str>,
    unique_id: Arc<str>,
}

impl Selector {
    /// Build a selector from already-canonical text
    pub fn from_canonical(expression: impl Into<String>) -> Self {
        let expression: String = expression.into();
        let unique_id = short_hash(SELECTOR_IP_SET_PREFIX, &expression);
        Self {
            expression: expression.into(),
            unique_id: unique_id.into(),
        }
    }

    /// The canonical expression text
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Content-derived id, used as the IP set name for rule selectors
    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    /// Content-derived id under a different prefix
    pub fn id_with_prefix(&self, prefix: &str) -> String {
        short_hash(prefix, &self.expression)
    }
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Selector({:?})", self.expression)
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

/// Parses raw selector text into a [`Selector`]
///
/// Selectors reaching the graph have been validated upstream, so a parse
/// failure here is an invariant violation.
pub trait SelectorParser: Send + Sync {
    /// Parse and canonicalize `expression`
    fn parse(&self, expression: &str) -> Result<Selector>;
}

/// Canonicalizes selector text without interpreting it
///
/// Whitespace outside string literals collapses to single spaces and
/// double-quoted literals become single-quoted where that is lossless.
/// Empty expressions and unbalanced quotes or parentheses are rejected.
#[derive(Debug, Default, Clone, Copy)]
pub struct NormalizingParser;

impl SelectorParser for NormalizingParser {
    fn parse(&self, expression: &str) -> Result<Selector> {
        let trimmed = expression.trim();
        if trimmed.is_empty() {
            return Err(Error::invalid_selector(expression, "empty expression"));
        }

        let mut out = String::with_capacity(trimmed.len());
        let mut depth: usize = 0;
        let mut chars = trimmed.chars().peekable();
        let mut pending_space = false;

        while let Some(c) = chars.next() {
            match c {
                '\'' | '"' => {
                    let mut literal = String::new();
                    let mut closed = false;
                    for inner in chars.by_ref() {
                        if inner == c {
                            closed = true;
                            break;
                        }
                        literal.push(inner);
                    }
                    if !closed {
                        return Err(Error::invalid_selector(expression, "unterminated string"));
                    }
                    if pending_space {
                        out.push(' ');
                        pending_space = false;
                    }
                    let quote = if literal.contains('\'') { '"' } else { '\'' };
                    out.push(quote);
                    out.push_str(&literal);
                    out.push(quote);
                }
                c if c.is_whitespace() => {
                    pending_space = !out.is_empty();
                }
                '(' => {
                    depth += 1;
                    if pending_space {
                        out.push(' ');
                        pending_space = false;
                    }
                    out.push(c);
                }
                ')' => {
                    depth = depth.checked_sub(1).ok_or_else(|| {
                        Error::invalid_selector(expression, "unbalanced parentheses")
                    })?;
                    pending_space = false;
                    out.push(c);
                }
                _ => {
                    if pending_space && !out.ends_with('(') {
                        out.push(' ');
                    }
                    pending_space = false;
                    out.push(c);
                }
            }
        }

        if depth != 0 {
            return Err(Error::invalid_selector(expression, "unbalanced parentheses"));
        }

        Ok(Selector::from_canonical(out))
    }
}
