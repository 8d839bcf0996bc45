//! Bridge to the embedded join engine.
//!
//! Every request gets a fresh in-memory DuckDB connection: secured row-sets
//! are registered as tables, the rewritten SQL runs, and the connection is
//! dropped on every exit path. Nothing here is shared across requests.
//!
//! DuckDB calls are blocking, so the engine invokes [`run_join`] inside
//! `spawn_blocking`.

use duckdb::types::Value as DuckValue;
use duckdb::types::ValueRef;
use duckdb::{Connection, params_from_iter};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::errors::{Error, Result};
use crate::types::Row;

/// One view's worth of data to register before executing the query.
#[derive(Debug, Clone)]
pub struct ViewData {
    /// Rows after RLS and CLS
    pub rows: Vec<Row>,
    /// A pre-RLS exemplar row. When RLS filtered a non-empty source down to
    /// nothing, its columns still let joins resolve names instead of
    /// failing with "table not found".
    pub exemplar: Option<Row>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnType {
    Boolean,
    BigInt,
    Double,
    Varchar,
}

impl ColumnType {
    fn sql(self) -> &'static str {
        match self {
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::BigInt => "BIGINT",
            ColumnType::Double => "DOUBLE",
            ColumnType::Varchar => "VARCHAR",
        }
    }
}

/// Execute the rewritten SQL over the given views.
///
/// Returns the result rows plus the result column names in SELECT order.
pub fn run_join(
    sql: &str,
    views: &BTreeMap<String, ViewData>,
) -> Result<(Vec<Row>, Vec<String>)> {
    let conn = Connection::open_in_memory().map_err(|e| Error::Internal {
        operation: format!("open join engine connection: {e}"),
    })?;

    for (view_name, data) in views {
        register_view(&conn, view_name, data)?;
    }

    execute_query(&conn, sql)
}

fn register_view(conn: &Connection, view_name: &str, data: &ViewData) -> Result<()> {
    let schema = infer_schema(data);

    let column_defs: Vec<String> = schema
        .iter()
        .map(|(name, ty)| format!("{} {}", quote_ident(name), ty.sql()))
        .collect();
    let create = format!(
        "CREATE TABLE {} ({})",
        quote_ident(view_name),
        column_defs.join(", ")
    );
    conn.execute_batch(&create).map_err(|e| Error::Internal {
        operation: format!("register view '{view_name}': {e}"),
    })?;

    if data.rows.is_empty() {
        return Ok(());
    }

    let placeholders = vec!["?"; schema.len()].join(", ");
    let insert = format!(
        "INSERT INTO {} VALUES ({placeholders})",
        quote_ident(view_name)
    );
    let mut stmt = conn.prepare(&insert).map_err(|e| Error::Internal {
        operation: format!("prepare insert for '{view_name}': {e}"),
    })?;
    for row in &data.rows {
        let values: Vec<DuckValue> = schema
            .iter()
            .map(|(name, ty)| coerce(row.get(name), *ty))
            .collect();
        stmt.execute(params_from_iter(values))
            .map_err(|e| Error::Internal {
                operation: format!("load rows into '{view_name}': {e}"),
            })?;
    }

    Ok(())
}

/// Column names and types for a view. Rows from one source share a schema,
/// so the first occurrence of each column decides; a view with no rows at
/// all gets a single placeholder column so it still registers.
fn infer_schema(data: &ViewData) -> Vec<(String, ColumnType)> {
    let sample: Vec<&Row> = if data.rows.is_empty() {
        data.exemplar.iter().collect()
    } else {
        data.rows.iter().collect()
    };

    let mut schema: Vec<(String, ColumnType)> = Vec::new();
    for row in &sample {
        for (name, value) in row.iter() {
            match schema.iter_mut().find(|(n, _)| n == name) {
                Some((_, ty)) => {
                    // A null in the first row may have defaulted the type;
                    // refine it from the first non-null occurrence.
                    if *ty == ColumnType::Varchar {
                        if let Some(better) = type_of(value) {
                            *ty = better;
                        }
                    }
                }
                None => {
                    schema.push((name.clone(), type_of(value).unwrap_or(ColumnType::Varchar)));
                }
            }
        }
    }

    if schema.is_empty() {
        schema.push(("_empty".to_string(), ColumnType::Varchar));
    }
    schema
}

fn type_of(value: &Value) -> Option<ColumnType> {
    match value {
        Value::Bool(_) => Some(ColumnType::Boolean),
        Value::Number(n) if n.is_i64() || n.is_u64() => Some(ColumnType::BigInt),
        Value::Number(_) => Some(ColumnType::Double),
        Value::String(_) => Some(ColumnType::Varchar),
        Value::Null => None,
        // nested structures are stored as their JSON text
        _ => Some(ColumnType::Varchar),
    }
}

fn coerce(value: Option<&Value>, ty: ColumnType) -> DuckValue {
    let Some(value) = value else {
        return DuckValue::Null;
    };
    if value.is_null() {
        return DuckValue::Null;
    }
    match ty {
        ColumnType::Boolean => value
            .as_bool()
            .map(DuckValue::Boolean)
            .unwrap_or(DuckValue::Null),
        ColumnType::BigInt => value
            .as_i64()
            .or_else(|| value.as_u64().and_then(|u| i64::try_from(u).ok()))
            .map(DuckValue::BigInt)
            .unwrap_or(DuckValue::Null),
        ColumnType::Double => value
            .as_f64()
            .map(DuckValue::Double)
            .unwrap_or(DuckValue::Null),
        ColumnType::Varchar => DuckValue::Text(match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }),
    }
}

fn execute_query(conn: &Connection, sql: &str) -> Result<(Vec<Row>, Vec<String>)> {
    let mut stmt = conn.prepare(sql).map_err(|e| Error::JoinEngine {
        message: e.to_string(),
    })?;

    let mut out: Vec<Vec<Value>> = Vec::new();
    let mut columns: Vec<String> = Vec::new();
    {
        let mut rows = stmt.query([]).map_err(|e| Error::JoinEngine {
            message: e.to_string(),
        })?;
        loop {
            let row = rows.next().map_err(|e| Error::JoinEngine {
                message: e.to_string(),
            })?;
            let Some(row) = row else { break };
            if columns.is_empty() {
                columns = row
                    .as_ref()
                    .column_names()
                    .into_iter()
                    .map(|c| c.to_string())
                    .collect();
            }
            let mut values = Vec::with_capacity(columns.len());
            for i in 0..columns.len() {
                let value = row.get_ref(i).map_err(|e| Error::JoinEngine {
                    message: e.to_string(),
                })?;
                values.push(json_from_ref(value));
            }
            out.push(values);
        }
    }
    if columns.is_empty() {
        // zero result rows: the executed statement still knows its columns
        columns = stmt
            .column_names()
            .into_iter()
            .map(|c| c.to_string())
            .collect();
    }

    let rows = out
        .into_iter()
        .map(|values| {
            columns
                .iter()
                .cloned()
                .zip(values)
                .collect::<Row>()
        })
        .collect();
    Ok((rows, columns))
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn json_from_ref(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Boolean(b) => Value::Bool(b),
        ValueRef::TinyInt(i) => Value::Number(i64::from(i).into()),
        ValueRef::SmallInt(i) => Value::Number(i64::from(i).into()),
        ValueRef::Int(i) => Value::Number(i64::from(i).into()),
        ValueRef::BigInt(i) => Value::Number(i.into()),
        ValueRef::UTinyInt(i) => Value::Number(u64::from(i).into()),
        ValueRef::USmallInt(i) => Value::Number(u64::from(i).into()),
        ValueRef::UInt(i) => Value::Number(u64::from(i).into()),
        ValueRef::UBigInt(i) => Value::Number(i.into()),
        ValueRef::Float(f) => serde_json::Number::from_f64(f64::from(f))
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Double(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        other => Value::String(format!("{other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(pairs: &[(&str, Value)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn views(entries: Vec<(&str, ViewData)>) -> BTreeMap<String, ViewData> {
        entries
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    }

    #[test]
    fn executes_a_simple_select() {
        let data = ViewData {
            rows: vec![
                row(&[("id", json!("a")), ("n", json!(1))]),
                row(&[("id", json!("b")), ("n", json!(2))]),
            ],
            exemplar: None,
        };
        let (rows, columns) = run_join(
            "SELECT id, n FROM items WHERE n > 1",
            &views(vec![("items", data)]),
        )
        .expect("query runs");
        assert_eq!(columns, vec!["id", "n"]);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], json!("b"));
        assert_eq!(rows[0]["n"], json!(2));
    }

    #[test]
    fn joins_two_views() {
        let left = ViewData {
            rows: vec![row(&[("k", json!("x")), ("a", json!(1))])],
            exemplar: None,
        };
        let right = ViewData {
            rows: vec![row(&[("k", json!("x")), ("b", json!(2))])],
            exemplar: None,
        };
        let (rows, _) = run_join(
            "SELECT l.a, r.b FROM l JOIN r ON l.k = r.k",
            &views(vec![("l", left), ("r", right)]),
        )
        .expect("join runs");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["a"], json!(1));
        assert_eq!(rows[0]["b"], json!(2));
    }

    #[test]
    fn empty_view_with_exemplar_resolves_columns() {
        let filtered = ViewData {
            rows: vec![],
            exemplar: Some(row(&[("id", json!("a")), ("team", json!("web"))])),
        };
        let (rows, columns) = run_join(
            "SELECT id, team FROM filtered",
            &views(vec![("filtered", filtered)]),
        )
        .expect("empty view still queries");
        assert!(rows.is_empty());
        assert_eq!(columns, vec!["id", "team"]);
    }

    #[test]
    fn view_with_no_schema_at_all_registers() {
        let nothing = ViewData {
            rows: vec![],
            exemplar: None,
        };
        let (rows, _) = run_join(
            "SELECT * FROM nothing",
            &views(vec![("nothing", nothing)]),
        )
        .expect("placeholder column registered");
        assert!(rows.is_empty());
    }

    #[test]
    fn nulls_do_not_pin_column_types() {
        let data = ViewData {
            rows: vec![
                row(&[("merged_at", Value::Null), ("n", json!(1))]),
                row(&[("merged_at", json!("2024-01-01")), ("n", json!(2))]),
            ],
            exemplar: None,
        };
        let (rows, _) = run_join(
            "SELECT merged_at FROM t WHERE n = 2",
            &views(vec![("t", data)]),
        )
        .expect("mixed-null column loads");
        assert_eq!(rows[0]["merged_at"], json!("2024-01-01"));
    }

    #[test]
    fn bad_sql_is_a_join_engine_error() {
        let err = run_join("SELECT FROM nowhere AT ALL", &BTreeMap::new())
            .expect_err("sql rejected");
        assert!(matches!(err, Error::JoinEngine { .. }));
    }
}
