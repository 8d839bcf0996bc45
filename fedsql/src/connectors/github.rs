//! GitHub source: pull requests via the GraphQL v4 API.
//!
//! Demo mode (`base_url == "mock"`) serves a deterministic corpus of 120
//! pull requests spread across five teams, matching the shape production
//! records normalize to. Production mode requires `owner`/`repo` under
//! `extra_params` and a bearer credential.

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::connectors::transport::HttpTransport;
use crate::connectors::{DataSource, FetchError, QueryContext, object};
use crate::types::{Row, scalar_to_string};

const PULL_REQUESTS_QUERY: &str = r#"
query($owner: String!, $repo: String!, $states: [PullRequestState!], $first: Int!, $cursor: String) {
  repository(owner: $owner, name: $repo) {
    pullRequests(states: $states, first: $first, after: $cursor) {
      nodes {
        number
        title
        author { login }
        headRefName
        state
        createdAt
        mergedAt
        additions
        deletions
        reviewDecision
        assignees(first: 1) { nodes { login } }
        labels(first: 3) { nodes { name } }
      }
      pageInfo { endCursor hasNextPage }
    }
  }
}
"#;

const TEAMS: [&str; 5] = ["mobile", "web", "api", "infra", "data"];
const STATUSES: [&str; 3] = ["open", "merged", "closed"];
const REVIEW_STATES: [&str; 3] = ["approved", "changes_requested", "pending"];

/// Deterministic mock corpus; the same 120 records on every call.
fn mock_pull_requests() -> Vec<Row> {
    (1..=120usize)
        .map(|i| {
            let team = TEAMS[i % TEAMS.len()];
            let status = STATUSES[i % STATUSES.len()];
            let month = (i % 9) + 1;
            object(json!({
                "pr_id": format!("PR-{i:03}"),
                "author": format!("dev_{team}_{}", i % 5),
                "author_email": format!("dev_{team}_{}@company.com", i % 5),
                "branch": format!("feature/{team}/task-{i}"),
                "status": status,
                "review_status": REVIEW_STATES[(i * 7) % REVIEW_STATES.len()],
                "team_id": team,
                "created_at": format!("2024-0{month}-01T00:00:00Z"),
                "assignee": format!("lead_{team}"),
                "additions": (i * 37) % 491 + 10,
                "deletions": (i * 17) % 196 + 5,
                "merged_at": if status == "merged" {
                    json!(format!("2024-0{month}-15T00:00:00Z"))
                } else {
                    Value::Null
                },
            }))
        })
        .collect()
}

pub struct GithubSource {
    transport: HttpTransport,
}

impl GithubSource {
    pub fn new(transport: HttpTransport) -> Self {
        Self { transport }
    }

    fn mock_fetch(filters: &crate::types::Filters) -> Vec<Row> {
        let mut data = mock_pull_requests();
        if let Some(status) = filters.get("status") {
            data.retain(|r| r.get("status") == Some(status));
        }
        if let Some(team_id) = filters.get("team_id") {
            data.retain(|r| r.get("team_id") == Some(team_id));
        }
        data
    }

    /// Map a GraphQL pull-request node to the canonical PR schema.
    fn normalize_record(raw: &Row) -> Row {
        let number = raw.get("number").and_then(Value::as_u64).unwrap_or(0);
        object(json!({
            "pr_id": format!("PR-{number:03}"),
            "author": raw.get("author")
                .and_then(|a| a.get("login"))
                .and_then(Value::as_str)
                .unwrap_or("unknown"),
            // not exposed by the GitHub API
            "author_email": "",
            "branch": raw.get("headRefName").and_then(Value::as_str).unwrap_or(""),
            "status": raw.get("state").and_then(Value::as_str).unwrap_or("").to_lowercase(),
            "review_status": raw.get("reviewDecision")
                .and_then(Value::as_str)
                .unwrap_or("pending")
                .to_lowercase(),
            // filled by RLS context or a team label lookup
            "team_id": "",
            "created_at": raw.get("createdAt").and_then(Value::as_str).unwrap_or(""),
            "assignee": raw.get("assignees")
                .and_then(|a| a.get("nodes"))
                .and_then(Value::as_array)
                .and_then(|nodes| nodes.first())
                .and_then(|n| n.get("login"))
                .and_then(Value::as_str)
                .unwrap_or(""),
            "additions": raw.get("additions").and_then(Value::as_u64).unwrap_or(0),
            "deletions": raw.get("deletions").and_then(Value::as_u64).unwrap_or(0),
            "merged_at": raw.get("mergedAt").cloned().unwrap_or(Value::Null),
        }))
    }
}

#[async_trait]
impl DataSource for GithubSource {
    async fn fetch(&self, ctx: &QueryContext) -> Result<Vec<Row>, FetchError> {
        let cfg = self.transport.config();
        if cfg.base_url == "mock" {
            return Ok(Self::mock_fetch(&ctx.filters));
        }

        let owner = cfg
            .extra_params
            .get("owner")
            .and_then(Value::as_str)
            .unwrap_or("octocat");
        let repo = cfg
            .extra_params
            .get("repo")
            .and_then(Value::as_str)
            .unwrap_or("hello-world");

        let status = ctx
            .filters
            .get("status")
            .map(scalar_to_string)
            .unwrap_or_default()
            .to_uppercase();
        let states: Vec<String> = match status.as_str() {
            "OPEN" | "MERGED" | "CLOSED" => vec![status.clone()],
            _ => vec!["OPEN".into(), "MERGED".into(), "CLOSED".into()],
        };

        let variables = json!({
            "owner": owner,
            "repo": repo,
            "states": states,
            "first": cfg.page_size,
        });
        let nodes = self
            .transport
            .paginate_graphql(PULL_REQUESTS_QUERY, variables, "repository.pullRequests")
            .await?;
        Ok(nodes.iter().map(Self::normalize_record).collect())
    }
}
