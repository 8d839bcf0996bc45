//! Translates a SQL string into an [`ExecutionDag`] by AST traversal.
//!
//! The parser runs the dialect of the join engine, so anything the planner
//! accepts the engine can execute after rewriting. Traversal handles table
//! aliases, mixed-case column names, multiple WHERE conjuncts, joins,
//! derived tables and set operations.
//!
//! Alias-awareness matters for pushdown: in
//! `... FROM github.pull_requests gh JOIN jira.issues ji ... WHERE gh.status = 'merged'`
//! the predicate must reach only the GitHub fetch; pushing it to Jira would
//! corrupt the right side of the join.

use sqlparser::ast::{
    BinaryOperator, Expr, Join, Query, Select, SetExpr, Statement, TableFactor, TableWithJoins,
    Value as SqlValue,
};
use sqlparser::dialect::DuckDbDialect;
use sqlparser::parser::Parser;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::errors::{Error, Result};
use crate::planner::{ExecutionDag, FetchNode};
use crate::tenant::models::TenantConfig;
use crate::types::Filters;

/// One equality conjunct from the top-level WHERE:
/// `(column, qualifier, literal)`, column and qualifier lower-cased.
type EqPredicate = (String, Option<String>, serde_json::Value);

pub struct QueryPlanner {
    cfg: Arc<TenantConfig>,
}

impl QueryPlanner {
    pub fn new(cfg: Arc<TenantConfig>) -> Self {
        Self { cfg }
    }

    /// Parse SQL and produce an execution DAG.
    pub fn plan(&self, sql: &str) -> Result<ExecutionDag> {
        let statements =
            Parser::parse_sql(&DuckDbDialect {}, sql).map_err(|e| Error::InvalidSql {
                message: e.to_string(),
            })?;

        // Collect table refs and their aliases in one pass, preserving
        // first-seen order.
        let mut table_refs: Vec<String> = Vec::new();
        let mut alias_map: HashMap<String, HashSet<String>> = HashMap::new();
        for statement in &statements {
            if let Statement::Query(query) = statement {
                self.collect_tables(query, &mut table_refs, &mut alias_map);
            }
        }
        if table_refs.is_empty() {
            return Err(Error::NoRecognizedTables {
                available: self.cfg.available_tables(),
            });
        }

        let predicates = statements
            .iter()
            .find_map(|s| match s {
                Statement::Query(query) => top_level_selection(query),
                _ => None,
            })
            .map(collect_eq_conjuncts)
            .unwrap_or_default();

        let mut dag = ExecutionDag::new(rewrite_sql(sql, &table_refs));

        for (i, table_name) in table_refs.iter().enumerate() {
            let binding =
                self.cfg
                    .table_registry
                    .get(table_name)
                    .ok_or_else(|| Error::UnknownTable {
                        table: table_name.clone(),
                        available: self.cfg.available_tables(),
                    })?;

            let pushable = self
                .cfg
                .connector_configs
                .get(&binding.connector)
                .map(|c| c.pushable_filters.clone())
                .unwrap_or_default();
            let aliases = alias_map.get(table_name).cloned().unwrap_or_default();

            let mut pushdown_filters = Filters::new();
            let mut duckdb_filters = Filters::new();
            for (column, qualifier, value) in &predicates {
                // A qualified predicate belongs only to the table that owns
                // that alias.
                if let Some(qualifier) = qualifier {
                    if !aliases.contains(qualifier) {
                        continue;
                    }
                }
                if pushable.iter().any(|f| f == column) {
                    pushdown_filters.insert(column.clone(), value.clone());
                } else {
                    duckdb_filters.insert(column.clone(), value.clone());
                }
            }

            dag.add_node(FetchNode {
                id: format!("node_{}_{i}", binding.connector),
                connector_id: binding.connector.clone(),
                fetch_key: binding.fetch_key.clone(),
                table_name: table_name.clone(),
                view_name: table_name.replace('.', "_"),
                pushdown_filters,
                duckdb_filters,
                depends_on: Vec::new(),
            });
        }

        Ok(dag)
    }

    fn collect_tables(
        &self,
        query: &Query,
        refs: &mut Vec<String>,
        alias_map: &mut HashMap<String, HashSet<String>>,
    ) {
        self.collect_from_set_expr(&query.body, refs, alias_map);
    }

    fn collect_from_set_expr(
        &self,
        body: &SetExpr,
        refs: &mut Vec<String>,
        alias_map: &mut HashMap<String, HashSet<String>>,
    ) {
        match body {
            SetExpr::Select(select) => self.collect_from_select(select, refs, alias_map),
            SetExpr::Query(query) => self.collect_tables(query, refs, alias_map),
            SetExpr::SetOperation { left, right, .. } => {
                self.collect_from_set_expr(left, refs, alias_map);
                self.collect_from_set_expr(right, refs, alias_map);
            }
            _ => {}
        }
    }

    fn collect_from_select(
        &self,
        select: &Select,
        refs: &mut Vec<String>,
        alias_map: &mut HashMap<String, HashSet<String>>,
    ) {
        for TableWithJoins { relation, joins } in &select.from {
            self.collect_from_factor(relation, refs, alias_map);
            for Join { relation, .. } in joins {
                self.collect_from_factor(relation, refs, alias_map);
            }
        }
    }

    fn collect_from_factor(
        &self,
        factor: &TableFactor,
        refs: &mut Vec<String>,
        alias_map: &mut HashMap<String, HashSet<String>>,
    ) {
        match factor {
            TableFactor::Table { name, alias, .. } => {
                let parts: Vec<String> = name.0.iter().map(|ident| ident.value.clone()).collect();
                if parts.is_empty() {
                    return;
                }
                let full_name = parts.join(".");
                if !self.cfg.table_registry.contains_key(&full_name) {
                    return;
                }

                if !refs.contains(&full_name) {
                    refs.push(full_name.clone());
                }
                let aliases = alias_map.entry(full_name.clone()).or_default();
                if let Some(alias) = alias {
                    aliases.insert(alias.name.value.to_lowercase());
                }
                // The unqualified table name and the view name are also
                // valid qualifiers for this table.
                if let Some(last) = parts.last() {
                    aliases.insert(last.to_lowercase());
                }
                aliases.insert(full_name.replace('.', "_").to_lowercase());
            }
            TableFactor::Derived { subquery, .. } => {
                self.collect_tables(subquery, refs, alias_map);
            }
            TableFactor::NestedJoin {
                table_with_joins, ..
            } => {
                self.collect_from_factor(&table_with_joins.relation, refs, alias_map);
                for Join { relation, .. } in &table_with_joins.joins {
                    self.collect_from_factor(relation, refs, alias_map);
                }
            }
            _ => {}
        }
    }
}

/// The WHERE clause of the outermost SELECT, if any.
fn top_level_selection(query: &Query) -> Option<&Expr> {
    match query.body.as_ref() {
        SetExpr::Select(select) => select.selection.as_ref(),
        SetExpr::Query(inner) => top_level_selection(inner),
        _ => None,
    }
}

/// Collect `col = literal` conjuncts, descending only through AND and
/// parentheses. Equalities under OR, ranges, IN and LIKE are not safe to
/// push down and are left entirely to the join engine's WHERE.
fn collect_eq_conjuncts(expr: &Expr) -> Vec<EqPredicate> {
    let mut out = Vec::new();
    walk_conjuncts(expr, &mut out);
    out
}

fn walk_conjuncts(expr: &Expr, out: &mut Vec<EqPredicate>) {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            walk_conjuncts(left, out);
            walk_conjuncts(right, out);
        }
        Expr::Nested(inner) => walk_conjuncts(inner, out),
        Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            right,
        } => {
            let Some(value) = literal_value(right) else {
                return;
            };
            let Some((column, qualifier)) = column_and_qualifier(left) else {
                return;
            };
            out.push((column, qualifier, value));
        }
        _ => {}
    }
}

/// `(column, qualifier)` from a column expression, lower-cased.
/// `gh.status` yields `("status", Some("gh"))`; bare `status` yields
/// `("status", None)`.
fn column_and_qualifier(expr: &Expr) -> Option<(String, Option<String>)> {
    match expr {
        Expr::Identifier(ident) => Some((ident.value.to_lowercase(), None)),
        Expr::CompoundIdentifier(parts) if parts.len() >= 2 => {
            let column = parts.last()?.value.to_lowercase();
            let qualifier = parts[parts.len() - 2].value.to_lowercase();
            Some((column, Some(qualifier)))
        }
        _ => None,
    }
}

fn literal_value(expr: &Expr) -> Option<serde_json::Value> {
    match expr {
        Expr::Value(SqlValue::SingleQuotedString(s))
        | Expr::Value(SqlValue::DoubleQuotedString(s)) => {
            Some(serde_json::Value::String(s.clone()))
        }
        Expr::Value(SqlValue::Number(n, _)) => {
            if let Ok(i) = n.parse::<i64>() {
                Some(serde_json::Value::Number(i.into()))
            } else if let Ok(f) = n.parse::<f64>() {
                serde_json::Number::from_f64(f).map(serde_json::Value::Number)
            } else {
                None
            }
        }
        Expr::Value(SqlValue::Boolean(b)) => Some(serde_json::Value::Bool(*b)),
        _ => None,
    }
}

/// Replace dotted table names with their view names. Longer names first so
/// a shorter name never clobbers part of a longer one; names were validated
/// against the registry before this step, so plain string replacement is
/// safe.
fn rewrite_sql(sql: &str, table_names: &[String]) -> String {
    let mut names: Vec<&String> = table_names.iter().collect();
    names.sort_by_key(|n| std::cmp::Reverse(n.len()));

    let mut result = sql.to_string();
    for name in names {
        result = result.replace(name.as_str(), &name.replace('.', "_"));
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tenant::demo_tenant;
    use serde_json::json;

    fn planner() -> QueryPlanner {
        QueryPlanner::new(Arc::new(demo_tenant("test")))
    }

    #[test]
    fn plans_single_table() {
        let dag = planner()
            .plan("SELECT * FROM github.pull_requests")
            .expect("plan");
        assert_eq!(dag.nodes.len(), 1);
        assert_eq!(dag.nodes[0].connector_id, "github");
        assert_eq!(dag.nodes[0].fetch_key, "all_prs");
        assert_eq!(dag.nodes[0].id, "node_github_0");
    }

    #[test]
    fn plans_two_table_join() {
        let dag = planner()
            .plan(
                "SELECT * FROM github.pull_requests gh \
                 JOIN jira.issues ji ON gh.branch = ji.branch_name",
            )
            .expect("plan");
        assert_eq!(dag.nodes.len(), 2);
        let connectors: HashSet<&str> =
            dag.nodes.iter().map(|n| n.connector_id.as_str()).collect();
        assert_eq!(connectors, HashSet::from(["github", "jira"]));
    }

    #[test]
    fn plans_three_tables() {
        let dag = planner()
            .plan(
                "SELECT * FROM github.pull_requests gh \
                 JOIN jira.issues ji ON gh.branch = ji.branch_name \
                 JOIN linear.issues li ON ji.issue_key = li.id",
            )
            .expect("plan");
        assert_eq!(dag.nodes.len(), 3);
    }

    #[test]
    fn unrecognized_tables_fail() {
        let err = planner()
            .plan("SELECT * FROM salesforce.contacts")
            .expect_err("unknown source");
        assert!(matches!(err, Error::NoRecognizedTables { .. }));
    }

    #[test]
    fn invalid_sql_fails() {
        let err = planner()
            .plan("SELECTTTT * FROMM github.pull_requests")
            .expect_err("parse failure");
        assert!(matches!(err, Error::InvalidSql { .. }));
    }

    #[test]
    fn rewrites_dotted_names() {
        let dag = planner()
            .plan("SELECT * FROM github.pull_requests")
            .expect("plan");
        assert!(dag.rewritten_sql.contains("github_pull_requests"));
        assert!(!dag.rewritten_sql.contains("github.pull_requests"));
    }

    #[test]
    fn rewrite_reparses_cleanly() {
        let dag = planner()
            .plan("SELECT pr_id FROM github.pull_requests WHERE status = 'merged'")
            .expect("plan");
        // The rewritten form is itself valid SQL and stable under rewrite.
        let reparsed = Parser::parse_sql(&DuckDbDialect {}, &dag.rewritten_sql);
        assert!(reparsed.is_ok());
        assert_eq!(
            rewrite_sql(&dag.rewritten_sql, &["github.pull_requests".to_string()]),
            dag.rewritten_sql
        );
    }

    #[test]
    fn pushes_down_single_predicate() {
        let dag = planner()
            .plan("SELECT * FROM github.pull_requests WHERE status = 'merged'")
            .expect("plan");
        assert_eq!(dag.nodes[0].pushdown_filters["status"], json!("merged"));
        assert!(dag.nodes[0].duckdb_filters.is_empty());
    }

    #[test]
    fn pushdown_respects_alias() {
        let dag = planner()
            .plan(
                "SELECT * FROM github.pull_requests gh \
                 JOIN jira.issues ji ON gh.branch = ji.branch_name \
                 WHERE gh.status = 'merged'",
            )
            .expect("plan");
        let gh = dag
            .nodes
            .iter()
            .find(|n| n.connector_id == "github")
            .unwrap();
        let ji = dag.nodes.iter().find(|n| n.connector_id == "jira").unwrap();
        assert_eq!(gh.pushdown_filters["status"], json!("merged"));
        assert!(ji.pushdown_filters.is_empty());
    }

    #[test]
    fn each_table_keeps_its_own_predicates() {
        let dag = planner()
            .plan(
                "SELECT * FROM github.pull_requests gh \
                 JOIN jira.issues ji ON gh.branch = ji.branch_name \
                 WHERE gh.status = 'merged' AND ji.status = 'In Progress'",
            )
            .expect("plan");
        let gh = dag
            .nodes
            .iter()
            .find(|n| n.connector_id == "github")
            .unwrap();
        let ji = dag.nodes.iter().find(|n| n.connector_id == "jira").unwrap();
        assert_eq!(gh.pushdown_filters["status"], json!("merged"));
        assert_eq!(ji.pushdown_filters["status"], json!("In Progress"));
    }

    #[test]
    fn pushdown_isolation_holds_for_qualified_predicates() {
        let dag = planner()
            .plan(
                "SELECT * FROM github.pull_requests gh \
                 JOIN jira.issues ji ON gh.branch = ji.branch_name \
                 WHERE gh.team_id = 'mobile' AND ji.priority = 'High'",
            )
            .expect("plan");
        for node in &dag.nodes {
            for column in node.pushdown_filters.keys() {
                match node.connector_id.as_str() {
                    "github" => assert_ne!(column, "priority"),
                    "jira" => assert_ne!(column, "team_id"),
                    other => panic!("unexpected connector {other}"),
                }
            }
        }
    }

    #[test]
    fn non_pushable_field_stays_with_the_engine() {
        let dag = planner()
            .plan("SELECT * FROM github.pull_requests WHERE review_status = 'approved'")
            .expect("plan");
        assert!(dag.nodes[0].pushdown_filters.is_empty());
        assert_eq!(
            dag.nodes[0].duckdb_filters["review_status"],
            json!("approved")
        );
    }

    #[test]
    fn or_disjuncts_are_not_pushed_down() {
        let dag = planner()
            .plan("SELECT * FROM github.pull_requests WHERE status = 'merged' OR status = 'open'")
            .expect("plan");
        assert!(dag.nodes[0].pushdown_filters.is_empty());
        assert!(dag.nodes[0].duckdb_filters.is_empty());
    }

    #[test]
    fn non_literal_rhs_is_ignored() {
        let dag = planner()
            .plan(
                "SELECT * FROM github.pull_requests gh \
                 JOIN jira.issues ji ON gh.branch = ji.branch_name \
                 WHERE gh.status = ji.status",
            )
            .expect("plan");
        for node in &dag.nodes {
            assert!(node.pushdown_filters.is_empty());
        }
    }

    #[test]
    fn no_where_clause_means_no_filters() {
        let dag = planner()
            .plan("SELECT * FROM github.pull_requests LIMIT 10")
            .expect("plan");
        assert!(dag.nodes[0].pushdown_filters.is_empty());
        assert!(dag.nodes[0].duckdb_filters.is_empty());
    }

    #[test]
    fn all_nodes_independent_in_one_wave() {
        let dag = planner()
            .plan(
                "SELECT * FROM github.pull_requests gh \
                 JOIN jira.issues ji ON gh.branch = ji.branch_name",
            )
            .expect("plan");
        let waves = dag.waves().expect("waves");
        assert_eq!(waves.len(), 1);
        assert_eq!(waves[0].len(), 2);
    }

    #[test]
    fn view_names_replace_dots() {
        let dag = planner()
            .plan(
                "SELECT * FROM github.pull_requests gh \
                 JOIN jira.issues ji ON gh.branch = ji.branch_name",
            )
            .expect("plan");
        let views: HashSet<&str> = dag.nodes.iter().map(|n| n.view_name.as_str()).collect();
        assert_eq!(
            views,
            HashSet::from(["github_pull_requests", "jira_issues"])
        );
    }

    #[test]
    fn boolean_literals_push_down() {
        let mut tenant = demo_tenant("test");
        tenant
            .connector_configs
            .get_mut("github")
            .unwrap()
            .pushable_filters
            .push("draft".to_string());
        let planner = QueryPlanner::new(Arc::new(tenant));
        let dag = planner
            .plan("SELECT * FROM github.pull_requests WHERE draft = true")
            .expect("plan");
        assert_eq!(dag.nodes[0].pushdown_filters["draft"], json!(true));
    }
}
