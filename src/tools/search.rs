//! Web search through Gemini's Google Search grounding

use super::{parse_args, Tool, ToolError, ToolOutcome};
use crate::llm::GeminiClient;
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Deserialize)]
struct SearchArgs {
    query: String,
}

pub struct WebSearchTool {
    client: GeminiClient,
}

impl WebSearchTool {
    pub fn new(client: GeminiClient) -> Self {
        Self { client }
    }
}

pub fn search_prompt(query: &str) -> String {
    format!(
        "Search for and summarize the most relevant and recent information about: {}",
        query.trim()
    )
}

#[async_trait::async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &'static str {
        "web_search"
    }

    fn description(&self) -> &'static str {
        "Search the web for recent news, current events and facts that may have changed recently."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "Search query"}
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, arguments: &Value) -> ToolOutcome {
        let args: SearchArgs = parse_args(arguments)?;
        if args.query.trim().is_empty() {
            return Err(ToolError::InvalidArguments("query must not be empty".to_string()));
        }

        let summary = self
            .client
            .generate_grounded(&search_prompt(&args.query))
            .await
            .map_err(|e| ToolError::Upstream(e.to_string()))?;

        Ok(Value::String(summary))
    }
}
