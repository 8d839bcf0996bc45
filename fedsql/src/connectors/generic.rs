//! Manifest-driven source for standard REST/GraphQL APIs.
//!
//! The manifest is embedded in the tenant config under
//! `extra_params.manifest` and defines endpoints, column mappings and mock
//! data. This is the zero-code connector path: new sources with
//! conventional APIs need only configuration.

use async_trait::async_trait;
use serde_json::Value;

use crate::connectors::transport::HttpTransport;
use crate::connectors::{DataSource, FetchError, QueryContext, object};
use crate::types::Row;

pub struct GenericSource {
    manifest: Value,
    #[allow(dead_code)]
    transport: HttpTransport,
}

impl GenericSource {
    pub fn new(manifest: Value, transport: HttpTransport) -> Self {
        Self {
            manifest,
            transport,
        }
    }

    /// Column projection from the manifest's table definitions. Each column
    /// maps a canonical name to a JSON path into the raw record.
    fn project_columns(&self, data: Vec<Row>) -> Vec<Row> {
        let mut columns: Vec<(String, String)> = Vec::new();
        if let Some(tables) = self.manifest.get("tables").and_then(Value::as_array) {
            for table in tables {
                if let Some(cols) = table.get("columns").and_then(Value::as_object) {
                    for (name, path) in cols {
                        if let Some(path) = path.as_str() {
                            columns.push((name.clone(), path.to_string()));
                        }
                    }
                }
            }
        }
        if columns.is_empty() {
            return data;
        }

        data.into_iter()
            .map(|row| {
                let mut projected = Row::new();
                for (name, path) in &columns {
                    let key = path.trim_start_matches("$.");
                    let value = row
                        .get(key)
                        .or_else(|| row.get(name))
                        .cloned()
                        .unwrap_or(Value::Null);
                    projected.insert(name.clone(), value);
                }
                projected
            })
            .collect()
    }
}

#[async_trait]
impl DataSource for GenericSource {
    async fn fetch(&self, ctx: &QueryContext) -> Result<Vec<Row>, FetchError> {
        // Mock data keyed by fetch_key (dev/demo mode)
        let data: Vec<Row> = self
            .manifest
            .get("mock_data")
            .and_then(|m| m.get(&ctx.fetch_key))
            .and_then(Value::as_array)
            .map(|items| items.iter().cloned().map(object).collect())
            .unwrap_or_default();

        let mut data = self.project_columns(data);

        // Simple equality pushdown over the projected rows
        for (field, value) in &ctx.filters {
            data.retain(|r| r.get(field) == Some(value));
        }

        Ok(data)
    }
}
