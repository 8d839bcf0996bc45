//! Shared HTTP transports for SaaS connectors: authenticated GET, GraphQL
//! POST, and both pagination styles (REST `Link` headers and GraphQL
//! cursors). All connectors share one pooled client; the per-request
//! timeout lives on the client.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::header::{AUTHORIZATION, LINK};
use serde_json::{Value, json};

use crate::connectors::{FetchError, object};
use crate::tenant::models::{AuthType, ConnectorConfig};
use crate::types::Row;

pub struct HttpTransport {
    client: reqwest::Client,
    cfg: ConnectorConfig,
}

impl HttpTransport {
    pub fn new(cfg: ConnectorConfig, client: reqwest::Client) -> Self {
        Self { client, cfg }
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.cfg
    }

    /// Resolve the configured credential. `env://NAME` indirects through the
    /// process environment; anything else is a literal secret for dev.
    fn credential(&self) -> String {
        match self.cfg.credential_ref.strip_prefix("env://") {
            Some(var) => std::env::var(var).unwrap_or_default(),
            None => self.cfg.credential_ref.clone(),
        }
    }

    fn auth_header(&self) -> String {
        let token = self.credential();
        match self.cfg.auth_type {
            AuthType::Bearer => format!("Bearer {token}"),
            AuthType::Basic => format!("Basic {}", BASE64.encode(token.as_bytes())),
        }
    }

    fn base_url(&self) -> &str {
        self.cfg.base_url.trim_end_matches('/')
    }

    async fn get_url(
        &self,
        url: &str,
        params: Option<&[(String, String)]>,
    ) -> Result<reqwest::Response, FetchError> {
        let mut request = self
            .client
            .get(url)
            .header(AUTHORIZATION, self.auth_header());
        if let Some(params) = params {
            request = request.query(params);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(response)
    }

    /// Authenticated GET returning parsed JSON.
    pub async fn get_json(
        &self,
        path: &str,
        params: &[(String, String)],
    ) -> Result<Value, FetchError> {
        let url = format!("{}{path}", self.base_url());
        let response = self.get_url(&url, Some(params)).await?;
        Ok(response.json().await?)
    }

    /// Authenticated GraphQL POST. Body-level `errors` are elevated to fetch
    /// failures; returns the `data` object.
    pub async fn graphql(&self, query: &str, variables: Value) -> Result<Value, FetchError> {
        let url = format!("{}{}", self.base_url(), self.cfg.graphql_path);
        let payload = json!({ "query": query, "variables": variables });
        let response = self
            .client
            .post(&url)
            .header(AUTHORIZATION, self.auth_header())
            .json(&payload)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url,
            });
        }
        let body: Value = response.json().await?;

        if let Some(errors) = body.get("errors") {
            if !errors.as_array().map(Vec::is_empty).unwrap_or(true) {
                return Err(FetchError::Graphql(format!(
                    "GraphQL error from {}: {errors}",
                    self.cfg.connector_id
                )));
            }
        }
        Ok(body.get("data").cloned().unwrap_or_else(|| json!({})))
    }

    /// Cursor-based pagination for GraphQL APIs.
    ///
    /// Expects `pageInfo.endCursor` / `pageInfo.hasNextPage` at `data_path`
    /// (a dotted path into the response data) and accumulates `nodes` from
    /// every page.
    pub async fn paginate_graphql(
        &self,
        query: &str,
        mut variables: Value,
        data_path: &str,
    ) -> Result<Vec<Row>, FetchError> {
        let mut all_nodes = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            if let Some(cursor) = &cursor {
                variables["cursor"] = json!(cursor);
            }
            let data = self.graphql(query, variables.clone()).await?;

            let mut node = &data;
            for key in data_path.split('.') {
                node = node.get(key).ok_or_else(|| {
                    FetchError::Invalid(format!(
                        "GraphQL response from {} missing '{key}' at path '{data_path}'",
                        self.cfg.connector_id
                    ))
                })?;
            }

            if let Some(nodes) = node.get("nodes").and_then(Value::as_array) {
                all_nodes.extend(nodes.iter().cloned().map(object));
            }

            let page_info = node.get("pageInfo").cloned().unwrap_or_else(|| json!({}));
            if !page_info
                .get("hasNextPage")
                .and_then(Value::as_bool)
                .unwrap_or(false)
            {
                break;
            }
            cursor = page_info
                .get("endCursor")
                .and_then(Value::as_str)
                .map(str::to_string);
            if cursor.is_none() {
                break;
            }
        }

        Ok(all_nodes)
    }

    /// `Link`-header pagination for REST APIs. Follows `rel="next"` links
    /// until exhausted; query parameters apply to the first request only.
    pub async fn paginate_rest(
        &self,
        path: &str,
        params: &[(String, String)],
    ) -> Result<Vec<Row>, FetchError> {
        let mut all_items = Vec::new();
        let mut url = format!("{}{path}", self.base_url());
        let mut params = Some(params);

        loop {
            let response = self.get_url(&url, params).await?;
            params = None;

            let next = response
                .headers()
                .get(LINK)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_next_link);

            let body: Value = response.json().await?;
            all_items.extend(items_from_body(body));

            match next {
                Some(next_url) => url = next_url,
                None => break,
            }
        }

        Ok(all_items)
    }
}

/// Normalize a REST page body: either a bare array or an object wrapping
/// the records under `values` (Jira-style) or `issues`.
fn items_from_body(body: Value) -> Vec<Row> {
    match body {
        Value::Array(items) => items.into_iter().map(object).collect(),
        Value::Object(map) => {
            for key in ["values", "issues"] {
                if let Some(Value::Array(items)) = map.get(key) {
                    return items.iter().cloned().map(object).collect();
                }
            }
            Vec::new()
        }
        _ => Vec::new(),
    }
}

/// Extract the URL from a `Link: <url>; rel="next"` header.
fn parse_next_link(link_header: &str) -> Option<String> {
    for part in link_header.split(',') {
        let part = part.trim();
        if part.contains("rel=\"next\"") {
            let url_part = part.split(';').next()?.trim();
            return Some(url_part.trim_matches(|c| c == '<' || c == '>').to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_next_link_among_multiple_relations() {
        let header = "<https://api.example.com/items?page=3>; rel=\"next\", \
                      <https://api.example.com/items?page=1>; rel=\"prev\"";
        assert_eq!(
            parse_next_link(header).as_deref(),
            Some("https://api.example.com/items?page=3")
        );
    }

    #[test]
    fn no_next_relation_means_done() {
        assert_eq!(parse_next_link("<https://x>; rel=\"prev\""), None);
        assert_eq!(parse_next_link(""), None);
    }

    #[test]
    fn normalizes_wrapped_and_bare_bodies() {
        let wrapped = json!({"issues": [{"key": "A"}]});
        assert_eq!(items_from_body(wrapped).len(), 1);

        let bare = json!([{"id": 1}, {"id": 2}]);
        assert_eq!(items_from_body(bare).len(), 2);

        assert!(items_from_body(json!({"unrelated": true})).is_empty());
    }
}
