//! Restricted policy rule expressions.
//!
//! The grammar covers exactly one binary comparison:
//!
//! ```text
//! expr := ref op rhs
//! ref  := field | field ".lower()" | "user." attr
//! op   := "==" | "!="
//! rhs  := "user." attr | quoted-literal | bareword
//! ```
//!
//! Parsing produces a small tagged AST and evaluation is a total function:
//! anything the recogniser does not understand evaluates to `false`. Rules
//! therefore fail closed - a malformed RLS rule drops rows rather than
//! leaking them.

use serde_json::Value;
use tracing::warn;

use crate::tenant::models::SecurityContext;
use crate::types::{Row, scalar_to_string};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
}

/// Left-hand reference: a row field (optionally case-folded) or a user
/// context attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ref {
    RowField { name: String, lower: bool },
    UserAttr(String),
}

/// Right-hand side: a user context attribute or a literal.
#[derive(Debug, Clone, PartialEq)]
pub enum Rhs {
    UserAttr(String),
    Literal(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Compare {
    pub lhs: Ref,
    pub op: CmpOp,
    pub rhs: Rhs,
}

/// Parse a rule expression. Returns `None` on any unsupported form.
pub fn parse(expr: &str) -> Option<Compare> {
    let expr = expr.trim();

    let (lhs_str, op, rhs_str) = if let Some((l, r)) = expr.split_once(" == ") {
        (l, CmpOp::Eq, r)
    } else if let Some((l, r)) = expr.split_once(" != ") {
        (l, CmpOp::Ne, r)
    } else {
        return None;
    };

    let lhs_str = lhs_str.trim();
    let rhs_str = rhs_str.trim();
    if lhs_str.is_empty() || rhs_str.is_empty() {
        return None;
    }

    let lhs = if let Some(attr) = lhs_str.strip_prefix("user.") {
        Ref::UserAttr(attr.to_string())
    } else if let Some(field) = lhs_str.strip_suffix(".lower()") {
        Ref::RowField {
            name: field.to_string(),
            lower: true,
        }
    } else {
        Ref::RowField {
            name: lhs_str.to_string(),
            lower: false,
        }
    };

    let rhs = if let Some(attr) = rhs_str.strip_prefix("user.") {
        Rhs::UserAttr(attr.to_string())
    } else {
        Rhs::Literal(parse_literal(rhs_str))
    };

    Some(Compare { lhs, op, rhs })
}

/// Literals are compared as strings, except `true`/`false` (any case) which
/// coerce to booleans.
fn parse_literal(token: &str) -> Value {
    let stripped = token
        .trim_matches(|c| c == '\'' || c == '"')
        .to_string();
    match stripped.to_ascii_lowercase().as_str() {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::String(stripped),
    }
}

/// Evaluate a rule expression against a row and the security context.
///
/// `row` is absent for CLS guard conditions, which may only reference
/// `user.<attr>` on the left. Any parse failure denies.
pub fn eval(expr_src: &str, row: Option<&Row>, ctx: &SecurityContext) -> bool {
    let Some(compare) = parse(expr_src) else {
        warn!("Unsupported rule expression: {expr_src} - defaulting to DENY");
        return false;
    };

    let lhs = match &compare.lhs {
        Ref::RowField { name, lower } => {
            let value = row.and_then(|r| r.get(name)).cloned();
            if *lower {
                // Case-folding always yields a string; missing fields fold
                // to the empty string.
                Some(Value::String(
                    value
                        .as_ref()
                        .map(scalar_to_string)
                        .unwrap_or_default()
                        .to_lowercase(),
                ))
            } else {
                value
            }
        }
        Ref::UserAttr(attr) => ctx.attr(attr),
    };

    let rhs = match &compare.rhs {
        Rhs::UserAttr(attr) => ctx.attr(attr),
        Rhs::Literal(value) => Some(value.clone()),
    };

    let equal = match (&lhs, &rhs) {
        (None, None) => true,
        (Some(a), Some(b)) => loosely_equal(a, b),
        _ => false,
    };

    match compare.op {
        CmpOp::Eq => equal,
        CmpOp::Ne => !equal,
    }
}

/// Equality across JSON scalars with a string-form fallback, so that a row
/// carrying `"false"` still matches a boolean `false` literal.
fn loosely_equal(a: &Value, b: &Value) -> bool {
    a == b || scalar_to_string(a) == scalar_to_string(b)
}
