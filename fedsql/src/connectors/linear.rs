//! Linear source (GraphQL-only API).

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::connectors::transport::HttpTransport;
use crate::connectors::{DataSource, FetchError, QueryContext, object};
use crate::types::Row;

const ISSUES_QUERY: &str = r#"
query($filter: IssueFilter, $first: Int!, $cursor: String) {
  issues(filter: $filter, first: $first, after: $cursor) {
    nodes {
      id
      title
      state { name }
      assignee { name }
      team { name }
      priority
      createdAt
    }
    pageInfo { endCursor hasNextPage }
  }
}
"#;

fn mock_issues() -> Vec<Row> {
    vec![
        object(json!({
            "id": "LIN-1",
            "title": "Implement YAML Parser",
            "status": "Todo",
            "assignee": Value::Null,
            "team": "platform",
        })),
        object(json!({
            "id": "LIN-2",
            "title": "Fix OIDC Loop",
            "status": "In Progress",
            "assignee": "alice",
            "team": "infra",
        })),
        object(json!({
            "id": "LIN-3",
            "title": "Add GraphQL connector",
            "status": "Done",
            "assignee": "bob",
            "team": "core",
        })),
    ]
}

pub struct LinearSource {
    transport: HttpTransport,
}

impl LinearSource {
    pub fn new(transport: HttpTransport) -> Self {
        Self { transport }
    }

    fn normalize_record(raw: &Row) -> Row {
        object(json!({
            "id": raw.get("id").and_then(Value::as_str).unwrap_or(""),
            "title": raw.get("title").and_then(Value::as_str).unwrap_or(""),
            "status": raw.get("state")
                .and_then(|s| s.get("name"))
                .and_then(Value::as_str)
                .unwrap_or(""),
            "assignee": raw.get("assignee")
                .and_then(|a| a.get("name"))
                .cloned()
                .unwrap_or(Value::Null),
            "team": raw.get("team")
                .and_then(|t| t.get("name"))
                .and_then(Value::as_str)
                .unwrap_or(""),
            "priority": raw.get("priority").cloned().unwrap_or(json!(0)),
        }))
    }
}

#[async_trait]
impl DataSource for LinearSource {
    async fn fetch(&self, ctx: &QueryContext) -> Result<Vec<Row>, FetchError> {
        let cfg = self.transport.config();
        if cfg.base_url == "mock" {
            let mut data = mock_issues();
            if let Some(status) = ctx.filters.get("status") {
                data.retain(|r| r.get("status") == Some(status));
            }
            return Ok(data);
        }

        let mut filter = json!({});
        if let Some(status) = ctx.filters.get("status") {
            filter = json!({ "state": { "name": { "eq": status } } });
        }

        let variables = json!({ "filter": filter, "first": cfg.page_size });
        let nodes = self
            .transport
            .paginate_graphql(ISSUES_QUERY, variables, "issues")
            .await?;
        Ok(nodes.iter().map(Self::normalize_record).collect())
    }
}
