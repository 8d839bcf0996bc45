//! Shared value types.

use std::collections::BTreeMap;

/// A single fetched record: an opaque attribute map as returned by a SaaS
/// source, after connector-side normalization.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// A predicate set pushed to (or recorded for) a single fetch node.
///
/// `BTreeMap` keeps the keys sorted, so two semantically equal filter sets
/// always serialize to the same canonical form regardless of insertion order.
/// The cache fingerprint depends on this.
pub type Filters = BTreeMap<String, serde_json::Value>;

/// Render a JSON value the way the policy evaluator compares it: strings
/// unquoted, booleans as `true`/`false`, everything else via JSON encoding.
pub fn scalar_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}
