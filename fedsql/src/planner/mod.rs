//! Query planning: the execution DAG model and the SQL planner that
//! produces it.

pub mod query_planner;

pub use query_planner::QueryPlanner;

use std::collections::BTreeSet;

use crate::errors::{Error, Result};
use crate::types::Filters;

/// A single unit of work in the execution DAG: one connector fetch for one
/// SQL table reference.
#[derive(Debug, Clone)]
pub struct FetchNode {
    /// `node_<connector>_<ordinal>`
    pub id: String,
    pub connector_id: String,
    pub fetch_key: String,
    /// Dotted virtual name, e.g. `github.pull_requests`
    pub table_name: String,
    /// The name the join engine sees: dots rewritten to underscores
    pub view_name: String,
    /// Equality predicates the connector evaluates server-side
    pub pushdown_filters: Filters,
    /// Equality predicates left to the join engine, recorded for
    /// observability; the WHERE clause still applies them
    pub duckdb_filters: Filters,
    /// Node ids that must complete first. Empty while all sources are
    /// independent, which keeps everything in a single parallel wave.
    pub depends_on: Vec<String>,
}

/// Directed acyclic graph of fetch nodes plus the rewritten SQL the join
/// engine will execute once every node's rows are registered.
#[derive(Debug, Clone, Default)]
pub struct ExecutionDag {
    pub nodes: Vec<FetchNode>,
    pub rewritten_sql: String,
}

impl ExecutionDag {
    pub fn new(rewritten_sql: impl Into<String>) -> Self {
        Self {
            nodes: Vec::new(),
            rewritten_sql: rewritten_sql.into(),
        }
    }

    pub fn add_node(&mut self, node: FetchNode) {
        self.nodes.push(node);
    }

    /// Mark that `dependent_id` cannot start until `depends_on_id` completes.
    pub fn add_dependency(&mut self, dependent_id: &str, depends_on_id: &str) -> Result<()> {
        let node = self
            .nodes
            .iter_mut()
            .find(|n| n.id == dependent_id)
            .ok_or_else(|| Error::Internal {
                operation: format!("add dependency to unknown node '{dependent_id}'"),
            })?;
        if !node.depends_on.iter().any(|d| d == depends_on_id) {
            node.depends_on.push(depends_on_id.to_string());
        }
        Ok(())
    }

    /// Execution waves by Kahn's topological levels.
    ///
    /// Each wave contains every node whose dependencies are all satisfied by
    /// earlier waves; nodes within a wave may run in parallel. A round with
    /// no eligible node while nodes remain means the graph has a cycle.
    pub fn waves(&self) -> Result<Vec<Vec<FetchNode>>> {
        if self.nodes.is_empty() {
            return Ok(Vec::new());
        }

        let known: BTreeSet<&str> = self.nodes.iter().map(|n| n.id.as_str()).collect();
        let mut remaining: BTreeSet<&str> = known.clone();
        let mut levels = Vec::new();

        while !remaining.is_empty() {
            let wave: Vec<FetchNode> = self
                .nodes
                .iter()
                .filter(|n| remaining.contains(n.id.as_str()))
                .filter(|n| {
                    n.depends_on
                        .iter()
                        .all(|d| known.contains(d.as_str()) && !remaining.contains(d.as_str()))
                })
                .cloned()
                .collect();
            if wave.is_empty() {
                let mut stuck: Vec<&str> = remaining.iter().copied().collect();
                stuck.sort_unstable();
                return Err(Error::DagCycle {
                    nodes: stuck.join(", "),
                });
            }
            for node in &wave {
                remaining.remove(node.id.as_str());
            }
            levels.push(wave);
        }

        Ok(levels)
    }
}
