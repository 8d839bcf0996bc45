//! Row- and column-level security over fetched row-sets.
//!
//! Both operations are pure functions over `(connector_id, rows, context)`
//! applied after the fetch and before the join engine sees any data. Rules
//! come from the tenant configuration; a connector with no matching rules
//! passes data through unchanged.

use sha2::{Digest, Sha256};

use crate::security::expr;
use crate::tenant::models::{ClsAction, SecurityContext};
use crate::types::{Row, scalar_to_string};

/// Apply row-level security filters.
///
/// A row survives only if *every* rule scoped to this connector evaluates
/// true against it. The result is always a sub-multiset of the input.
pub fn apply_rls(connector_id: &str, rows: &[Row], ctx: &SecurityContext) -> Vec<Row> {
    let rules: Vec<_> = ctx
        .tenant_cfg
        .rls_rules
        .iter()
        .filter(|r| r.connector_id == connector_id)
        .collect();
    if rules.is_empty() {
        return rows.to_vec();
    }

    rows.iter()
        .filter(|row| {
            rules
                .iter()
                .all(|rule| expr::eval(&rule.rule_expr, Some(row), ctx))
        })
        .cloned()
        .collect()
}

/// Apply column-level security masking and blocking.
///
/// Rows are cloned - the input is never mutated. For each rule scoped to
/// this connector whose condition holds (a missing condition always holds),
/// the action is applied to the named column when the row carries it.
pub fn apply_cls(connector_id: &str, rows: &[Row], ctx: &SecurityContext) -> Vec<Row> {
    let rules: Vec<_> = ctx
        .tenant_cfg
        .cls_rules
        .iter()
        .filter(|r| r.connector_id == connector_id)
        .collect();
    if rules.is_empty() {
        return rows.to_vec();
    }

    rows.iter()
        .map(|row| {
            let mut row = row.clone();
            for rule in &rules {
                let applies = match &rule.condition {
                    Some(condition) => expr::eval(condition, None, ctx),
                    None => true,
                };
                if !applies {
                    continue;
                }
                if let Some(value) = row.get(&rule.column).cloned() {
                    let replacement = match rule.action {
                        ClsAction::HashHmac => serde_json::Value::String(mask_pii(&value)),
                        ClsAction::Block => serde_json::Value::String("[HIDDEN]".to_string()),
                        ClsAction::Redact => serde_json::Value::String("REDACTED".to_string()),
                    };
                    row.insert(rule.column.clone(), replacement);
                }
            }
            row
        })
        .collect()
}

/// Deterministic SHA-256 prefix masking: identical inputs always produce
/// identical masks, so masked columns remain joinable.
fn mask_pii(value: &serde_json::Value) -> String {
    let serde_json::Value::String(s) = value else {
        return scalar_to_string(value);
    };
    let digest = Sha256::digest(s.as_bytes());
    format!("{}****@ema.co", &hex::encode(digest)[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tenant::demo_tenant;
    use serde_json::json;
    use std::sync::Arc;

    fn ctx(team_id: &str, role: &str, pii_access: bool) -> SecurityContext {
        SecurityContext {
            user_id: "u1".into(),
            email: "dev@company.com".into(),
            role: role.into(),
            team_id: team_id.into(),
            pii_access,
            tenant_id: "test".into(),
            tenant_cfg: Arc::new(demo_tenant("test")),
        }
    }

    fn pr_row(team: &str, author: &str, email: &str) -> Row {
        let mut row = Row::new();
        row.insert("team_id".into(), json!(team));
        row.insert("author".into(), json!(author));
        row.insert("author_email".into(), json!(email));
        row
    }

    #[test]
    fn rls_keeps_only_matching_team() {
        let c = ctx("mobile", "developer", true);
        let rows = vec![
            pr_row("mobile", "a", "a@x.co"),
            pr_row("web", "b", "b@x.co"),
            pr_row("mobile", "c", "c@x.co"),
        ];
        let kept = apply_rls("github", &rows, &c);
        assert_eq!(kept.len(), 2);
        assert!(kept.iter().all(|r| r["team_id"] == json!("mobile")));
    }

    #[test]
    fn rls_result_is_subset_of_input() {
        let c = ctx("web", "developer", true);
        let rows = vec![
            pr_row("mobile", "a", "a@x.co"),
            pr_row("web", "b", "b@x.co"),
        ];
        let kept = apply_rls("github", &rows, &c);
        for row in &kept {
            assert!(rows.contains(row));
        }
    }

    #[test]
    fn rls_without_rules_passes_through() {
        let c = ctx("mobile", "developer", true);
        let rows = vec![pr_row("web", "a", "a@x.co")];
        // No linear rules in the demo tenant.
        let kept = apply_rls("linear", &rows, &c);
        assert_eq!(kept, rows);
    }

    #[test]
    fn rls_team_isolation_is_disjoint() {
        let rows = vec![
            pr_row("mobile", "a", "a@x.co"),
            pr_row("web", "b", "b@x.co"),
        ];
        let mobile = apply_rls("github", &rows, &ctx("mobile", "developer", true));
        let web = apply_rls("github", &rows, &ctx("web", "developer", true));
        for row in &mobile {
            assert!(!web.contains(row));
        }
    }

    #[test]
    fn cls_blocks_and_masks_for_qa() {
        let c = ctx("mobile", "qa", false);
        let rows = vec![pr_row("mobile", "alice", "alice@company.com")];
        let secured = apply_cls("github", &rows, &c);
        assert_eq!(secured[0]["author"], json!("[HIDDEN]"));
        let email = secured[0]["author_email"].as_str().unwrap();
        assert!(email.ends_with("****@ema.co"), "got {email}");
        assert_eq!(email.len(), 8 + "****@ema.co".len());
    }

    #[test]
    fn cls_leaves_privileged_users_alone() {
        let c = ctx("mobile", "developer", true);
        let rows = vec![pr_row("mobile", "alice", "alice@company.com")];
        let secured = apply_cls("github", &rows, &c);
        assert_eq!(secured[0]["author"], json!("alice"));
        assert_eq!(secured[0]["author_email"], json!("alice@company.com"));
    }

    #[test]
    fn cls_never_mutates_input() {
        let c = ctx("mobile", "qa", false);
        let rows = vec![pr_row("mobile", "alice", "alice@company.com")];
        let before = rows.clone();
        let _ = apply_cls("github", &rows, &c);
        assert_eq!(rows, before);
    }

    #[test]
    fn mask_is_deterministic() {
        let v = json!("alice@company.com");
        assert_eq!(mask_pii(&v), mask_pii(&v));
        assert_ne!(mask_pii(&v), mask_pii(&json!("bob@company.com")));
    }

    #[test]
    fn mask_passes_non_strings_through() {
        assert_eq!(mask_pii(&json!(42)), "42");
    }
}
