//! Statement building primitives.
//!
//! Invariants:
//! - Identifiers reaching SQL text are ASCII, bounded, and shape-checked;
//!   they come from the introspected catalog, never raw caller input.
//! - Value parameters are always bound, never interpolated. The only
//!   interpolated values are validated identifiers and i64 range bounds.

use crate::error::{EngineError, ErrorOrigin};
use rusqlite::types::Value;
use std::fmt::{self, Display, Write};

pub(crate) const MAX_IDENT_LEN: usize = 64;
pub(crate) const MAX_EXPR_LEN: usize = 256;

/// Placeholder substituted with an id-range row filter at execution time.
pub const ID_RANGE_PLACEHOLDER: &str = "{id_range}";

///
/// Ident
///
/// A validated SQL identifier (table or column name). Displays in its
/// double-quoted form so it can be spliced into statement text directly.
///

#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Ident(String);

impl Ident {
    pub fn new(raw: &str) -> Result<Self, EngineError> {
        if raw.is_empty() {
            return Err(EngineError::invariant(
                ErrorOrigin::Statement,
                "identifier is empty",
            ));
        }
        if raw.len() > MAX_IDENT_LEN {
            return Err(EngineError::invariant(
                ErrorOrigin::Statement,
                format!(
                    "identifier '{raw}' length {} exceeds max {MAX_IDENT_LEN}",
                    raw.len()
                ),
            ));
        }
        let mut chars = raw.chars();
        let head_ok = chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
        if !head_ok || !raw.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(EngineError::invariant(
                ErrorOrigin::Statement,
                format!("identifier '{raw}' is not a plain SQL name"),
            ));
        }
        Ok(Self(raw.to_owned()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\"", self.0)
    }
}

///
/// SqlExpr
///
/// A caller-supplied key expression (e.g. `lower(name)`) for the duplicate
/// collapser. Conservatively charset-checked; anything richer than plain
/// column math belongs in the migration script, not here.
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SqlExpr(String);

impl SqlExpr {
    pub fn new(raw: &str) -> Result<Self, EngineError> {
        if raw.is_empty() || raw.len() > MAX_EXPR_LEN {
            return Err(EngineError::invariant(
                ErrorOrigin::Statement,
                format!("key expression '{raw}' is empty or too long"),
            ));
        }
        let allowed = |c: char| {
            c.is_ascii_alphanumeric() || matches!(c, '_' | '(' | ')' | ',' | '.' | ' ' | '\'' | '"')
        };
        if !raw.chars().all(allowed) {
            return Err(EngineError::invariant(
                ErrorOrigin::Statement,
                format!("key expression '{raw}' contains unsupported characters"),
            ));
        }
        let mut depth = 0i32;
        for c in raw.chars() {
            match c {
                '(' => depth += 1,
                ')' => depth -= 1,
                _ => {}
            }
            if depth < 0 {
                break;
            }
        }
        if depth != 0 {
            return Err(EngineError::invariant(
                ErrorOrigin::Statement,
                format!("key expression '{raw}' has unbalanced parentheses"),
            ));
        }
        Ok(Self(raw.to_owned()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for SqlExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

///
/// Window
///
/// The row filter a `RangeTemplate` placeholder collapses to.
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Window {
    /// No id column on the table; the filter is vacuously true.
    Open,
    /// Whole table in one statement, still exercising the placeholder.
    NotNull,
    /// One contiguous id sub-range.
    Range(i64, i64),
}

///
/// RangeTemplate
///
/// A table-scoped statement with exactly one `{id_range}` placeholder and
/// bound value parameters. The batch executor instantiates one copy per
/// partition; parameters are rebound on each worker's connection.
///

#[derive(Clone, Debug)]
pub struct RangeTemplate {
    sql: String,
    range_expr: String,
    params: Vec<Value>,
}

impl RangeTemplate {
    /// `alias` must reference the table being partitioned; the placeholder
    /// collapses to a filter on `alias."id"`.
    pub fn new(sql: impl Into<String>, alias: &Ident) -> Result<Self, EngineError> {
        let sql = sql.into();
        if sql.matches(ID_RANGE_PLACEHOLDER).count() != 1 {
            return Err(EngineError::invariant(
                ErrorOrigin::Statement,
                format!("statement template must contain exactly one {ID_RANGE_PLACEHOLDER}"),
            ));
        }
        Ok(Self {
            sql,
            range_expr: format!("{alias}.\"id\""),
            params: Vec::new(),
        })
    }

    #[must_use]
    pub fn with_params(mut self, params: Vec<Value>) -> Self {
        self.params = params;
        self
    }

    #[must_use]
    pub fn params(&self) -> &[Value] {
        &self.params
    }

    pub(crate) fn instantiate(&self, window: Window) -> String {
        let filter = match window {
            Window::Open => "1 = 1".to_owned(),
            Window::NotNull => format!("{} IS NOT NULL", self.range_expr),
            Window::Range(lo, hi) => format!("{} BETWEEN {lo} AND {hi}", self.range_expr),
        };
        self.sql.replace(ID_RANGE_PLACEHOLDER, &filter)
    }
}

/// Render a bounded id list as SQL text. Safe to splice: values are i64.
pub(crate) fn id_list(ids: &[i64]) -> String {
    let mut out = String::with_capacity(ids.len() * 4);
    for (i, id) in ids.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        let _ = write!(out, "{id}");
    }
    out
}
