//! BP-003: Reference parsing.
//!
//! Setting strings may embed references:
//! - `$(vars.NAME)` or `$(NAME)`: a deployment (global) variable
//! - `$(ID.OUTPUT)`: an output of another module
//!
//! `\$(` escapes a marker. A string without any unescaped marker is kept
//! verbatim; otherwise it becomes an [`Expression`] of literal and reference
//! parts.

use super::value::Value;
use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

static IDENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_-]*$").expect("identifier pattern is valid")
});

const MARKER: &str = "$(";
const ESCAPED_MARKER: &str = "\\$(";
const HCL_MARKER: &str = "((";

/// Namespace prefix for deployment variables.
pub const VARS_NAMESPACE: &str = "vars";

/// A typed pointer to a deployment variable or a module output.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Reference {
    Global(String),
    Module { module: String, output: String },
}

impl Reference {
    pub fn global(name: &str) -> Self {
        Self::Global(name.to_string())
    }

    pub fn module(module: &str, output: &str) -> Self {
        Self::Module {
            module: module.to_string(),
            output: output.to_string(),
        }
    }

    /// Parse the inner content of a `$( … )` marker.
    pub fn parse(inner: &str) -> Result<Self, String> {
        let parts: Vec<&str> = inner.trim().split('.').collect();
        if let Some(bad) = parts.iter().find(|p| !IDENT_RE.is_match(p)) {
            return Err(format!("'{}' is not a valid identifier", bad));
        }
        match parts.as_slice() {
            [name] => Ok(Self::global(name)),
            [VARS_NAMESPACE, name] => Ok(Self::global(name)),
            [module, output] => Ok(Self::module(module, output)),
            _ => Err(format!(
                "expected NAME, vars.NAME or MODULE.OUTPUT, got {} parts",
                parts.len()
            )),
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global(name) => write!(f, "{}.{}", VARS_NAMESPACE, name),
            Self::Module { module, output } => write!(f, "{}.{}", module, output),
        }
    }
}

/// One segment of an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Part {
    Literal(String),
    Ref(Reference),
}

/// A string with embedded references, held unresolved until the writer.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    parts: Vec<Part>,
}

impl Expression {
    pub fn from_reference(r: Reference) -> Self {
        Self {
            parts: vec![Part::Ref(r)],
        }
    }

    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    pub fn references(&self) -> impl Iterator<Item = &Reference> {
        self.parts.iter().filter_map(|p| match p {
            Part::Ref(r) => Some(r),
            Part::Literal(_) => None,
        })
    }

    /// The reference when the expression is exactly one reference.
    pub fn as_single_reference(&self) -> Option<&Reference> {
        match self.parts.as_slice() {
            [Part::Ref(r)] => Some(r),
            _ => None,
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for part in &self.parts {
            match part {
                Part::Literal(s) => write!(f, "{}", s.replace(MARKER, ESCAPED_MARKER))?,
                Part::Ref(r) => write!(f, "$({})", r)?,
            }
        }
        Ok(())
    }
}

/// A marker whose content is not a reference.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed reference in \"{input}\": {reason}")]
pub struct MalformedReference {
    pub input: String,
    pub reason: String,
}

/// Parse a raw setting string into a literal or an expression.
pub fn parse_string(s: &str) -> Result<Value, MalformedReference> {
    let malformed = |reason: String| MalformedReference {
        input: s.to_string(),
        reason,
    };

    let mut parts = Vec::new();
    let mut literal = String::new();
    let mut i = 0;

    while i < s.len() {
        let rest = &s[i..];
        if rest.starts_with(ESCAPED_MARKER) {
            literal.push_str(MARKER);
            i += ESCAPED_MARKER.len();
        } else if rest.starts_with(MARKER) {
            let body = &rest[MARKER.len()..];
            let close = body
                .find(')')
                .ok_or_else(|| malformed(format!("unclosed marker at position {}", i)))?;
            let reference = Reference::parse(&body[..close]).map_err(malformed)?;
            if !literal.is_empty() {
                parts.push(Part::Literal(std::mem::take(&mut literal)));
            }
            parts.push(Part::Ref(reference));
            i += MARKER.len() + close + 1;
        } else {
            let Some(ch) = rest.chars().next() else {
                break;
            };
            literal.push(ch);
            i += ch.len_utf8();
        }
    }

    if parts.is_empty() {
        return Ok(Value::String(s.to_string()));
    }
    if !literal.is_empty() {
        parts.push(Part::Literal(literal));
    }
    Ok(Value::Expr(Expression { parts }))
}

/// Find the first unescaped `$(` or `((` marker, returning its byte offset.
pub fn find_variable_marker(s: &str) -> Option<usize> {
    [MARKER, HCL_MARKER]
        .iter()
        .flat_map(|m| s.match_indices(m).map(|(idx, _)| idx))
        .filter(|&idx| !s[..idx].ends_with('\\'))
        .min()
}
