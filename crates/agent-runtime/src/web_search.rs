//! Web search tool backed by the DuckDuckGo Instant Answer API
//!
//! No API key is needed. Instant answers are encyclopedic rather than a
//! full web index, so results are the abstract plus related topics.

use std::fmt::Write;

use agent_core::{
    error::{AgentError, Result},
    message::ToolCallRequest,
    tool::{ParameterSchema, Tool, ToolContext, ToolResult, ToolSchema},
};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};

const ENDPOINT: &str = "https://api.duckduckgo.com/";
const DEFAULT_MAX_RESULTS: usize = 5;
const MAX_RESULTS_CAP: usize = 20;
const TITLE_CHARS: usize = 80;

/// A search result entry
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

/// `web_search` tool
pub struct WebSearchTool {
    client: reqwest::Client,
    endpoint: String,
}

impl Default for WebSearchTool {
    fn default() -> Self {
        Self::new()
    }
}

impl WebSearchTool {
    pub fn new() -> Self {
        Self::with_endpoint(ENDPOINT)
    }

    /// Point the tool at a different Instant Answer compatible endpoint
    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }

    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchResult>> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("q", query), ("format", "json"), ("no_html", "1"), ("skip_disambig", "1")])
            .send()
            .await
            .map_err(|e| AgentError::ToolExecution(format!("search request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AgentError::ToolExecution(format!(
                "search service returned HTTP {}",
                status.as_u16()
            )));
        }

        let data: Value = response
            .json()
            .await
            .map_err(|e| AgentError::ToolExecution(format!("failed to parse search response: {e}")))?;

        Ok(parse_instant_answer(&data, max_results))
    }
}

/// Extract results from an Instant Answer document.
///
/// The abstract comes first when present; related topics follow, with
/// grouped topics flattened in document order.
pub fn parse_instant_answer(data: &Value, max_results: usize) -> Vec<SearchResult> {
    let mut results = Vec::new();

    if let Some(snippet) = str_field(data, "AbstractText").filter(|t| !t.is_empty()) {
        results.push(SearchResult {
            title: str_field(data, "Heading")
                .filter(|h| !h.is_empty())
                .unwrap_or("Result")
                .to_string(),
            url: str_field(data, "AbstractURL").unwrap_or_default().to_string(),
            snippet: snippet.to_string(),
        });
    }

    if let Some(topics) = data.get("RelatedTopics").and_then(Value::as_array) {
        collect_topics(topics, max_results, &mut results);
    }

    results.truncate(max_results);
    results
}

fn collect_topics(topics: &[Value], max_results: usize, results: &mut Vec<SearchResult>) {
    for topic in topics {
        if results.len() >= max_results {
            return;
        }
        if let Some(nested) = topic.get("Topics").and_then(Value::as_array) {
            collect_topics(nested, max_results, results);
            continue;
        }
        if let Some(text) = str_field(topic, "Text").filter(|t| !t.is_empty()) {
            results.push(SearchResult {
                title: text.chars().take(TITLE_CHARS).collect(),
                url: str_field(topic, "FirstURL").unwrap_or_default().to_string(),
                snippet: text.to_string(),
            });
        }
    }
}

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

/// Render results as numbered plain text for the model
pub fn format_results(query: &str, results: &[SearchResult]) -> String {
    if results.is_empty() {
        return format!("No instant answers found for \"{query}\".");
    }
    let mut out = format!("Search results for \"{query}\":\n");
    for (i, result) in results.iter().enumerate() {
        let _ = writeln!(out, "\n{}. {}", i + 1, result.title);
        if !result.url.is_empty() {
            let _ = writeln!(out, "   {}", result.url);
        }
        if result.snippet != result.title {
            let _ = writeln!(out, "   {}", result.snippet);
        }
    }
    out
}

#[async_trait]
impl Tool for WebSearchTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "web_search".into(),
            description: "Search the web for facts, definitions and related topics".into(),
            parameters: vec![
                ParameterSchema::new("query", "string", "What to search for").required(),
                ParameterSchema::new("max_results", "integer", "Maximum number of results (1-20)")
                    .with_default(json!(DEFAULT_MAX_RESULTS)),
            ],
            category: Some("web".into()),
            has_side_effects: false,
        }
    }

    async fn execute(&self, call: &ToolCallRequest, _ctx: &ToolContext) -> Result<ToolResult> {
        let query = call
            .arguments
            .get("query")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .ok_or_else(|| AgentError::ToolValidation("query must be a non-empty string".into()))?;
        let max_results = call
            .arguments
            .get("max_results")
            .and_then(Value::as_u64)
            .map_or(DEFAULT_MAX_RESULTS, |n| usize::try_from(n).unwrap_or(MAX_RESULTS_CAP))
            .clamp(1, MAX_RESULTS_CAP);

        tracing::debug!(tool = "web_search", query, max_results, "searching");
        let results = self.search(query, max_results).await?;

        Ok(ToolResult::success("web_search", format_results(query, &results))
            .with_data(json!({ "results": results })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn sample() -> Value {
        json!({
            "Heading": "Rust (programming language)",
            "AbstractText": "Rust is a general-purpose programming language.",
            "AbstractURL": "https://en.wikipedia.org/wiki/Rust_(programming_language)",
            "RelatedTopics": [
                { "Text": "Cargo - the Rust package manager", "FirstURL": "https://duckduckgo.com/Cargo" },
                {
                    "Name": "Tools",
                    "Topics": [
                        { "Text": "rustup - toolchain installer", "FirstURL": "https://duckduckgo.com/rustup" },
                        { "Text": "clippy - lints", "FirstURL": "https://duckduckgo.com/clippy" }
                    ]
                },
                { "Text": "", "FirstURL": "https://duckduckgo.com/empty" }
            ]
        })
    }

    #[test]
    fn test_abstract_then_flattened_topics() {
        let results = parse_instant_answer(&sample(), 10);
        assert_eq!(results.len(), 4);
        assert_eq!(results[0].title, "Rust (programming language)");
        assert!(results[0].url.contains("wikipedia"));
        assert_eq!(results[1].url, "https://duckduckgo.com/Cargo");
        assert_eq!(results[2].snippet, "rustup - toolchain installer");
        assert_eq!(results[3].url, "https://duckduckgo.com/clippy");
    }

    #[test]
    fn test_max_results_respected() {
        let results = parse_instant_answer(&sample(), 2);
        assert_eq!(results.len(), 2);
        assert_eq!(results[1].title, "Cargo - the Rust package manager");
    }

    #[test]
    fn test_empty_document() {
        let results = parse_instant_answer(&json!({ "AbstractText": "", "RelatedTopics": [] }), 5);
        assert!(results.is_empty());
        assert!(format_results("nothing", &results).starts_with("No instant answers"));
    }

    #[test]
    fn test_format_numbers_results() {
        let results = parse_instant_answer(&sample(), 2);
        let text = format_results("rust", &results);
        assert!(text.starts_with("Search results for \"rust\":"));
        assert!(text.contains("1. Rust (programming language)"));
        assert!(text.contains("2. Cargo"));
    }

    #[tokio::test]
    async fn test_blank_query_rejected_before_network() {
        let tool = WebSearchTool::with_endpoint("http://127.0.0.1:9/");
        let call = ToolCallRequest::from_value("web_search", json!({ "query": "  " })).unwrap();
        let ctx = ToolContext::new("tester", 0, CancellationToken::new());
        let err = tool.execute(&call, &ctx).await.unwrap_err();
        assert_eq!(err.kind(), "tool_validation_error");
    }

    #[test]
    fn test_schema() {
        let schema = WebSearchTool::new().schema();
        assert_eq!(schema.name, "web_search");
        assert!(schema.parameters[0].required);
        assert!(!schema.parameters[1].required);
    }
}
