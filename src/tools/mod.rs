//! Tool trait, registry and dispatcher
//!
//! Tools take a JSON arguments object and return a JSON result or a typed
//! error. Errors are data: the dispatcher turns them into tool messages the
//! model can react to.

use crate::llm::{GeminiClient, ToolSpec};
use crate::models::{Message, ToolCallRequest};
use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

pub mod calculators;
pub mod market;
pub mod search;

pub use calculators::CompoundGrowthTool;
pub use market::{MarketOverviewTool, PortfolioRiskTool, ProductDataTool, YahooFinanceClient};
pub use search::WebSearchTool;

pub type ToolOutcome = std::result::Result<Value, ToolError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Upstream failure: {0}")]
    Upstream(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),
}

impl ToolError {
    pub fn kind(&self) -> &'static str {
        match self {
            ToolError::UnknownTool(_) => "unknown_tool",
            ToolError::InvalidArguments(_) => "invalid_arguments",
            ToolError::NotFound(_) => "not_found",
            ToolError::Upstream(_) => "upstream_error",
            ToolError::Timeout(_) => "timeout",
        }
    }

    /// Shape written into the transcript in place of a result.
    pub fn to_payload(&self) -> Value {
        json!({
            "error": {
                "type": self.kind(),
                "message": self.to_string(),
            }
        })
    }
}

/// Decode a tool's arguments object into its typed form.
pub fn parse_args<T: DeserializeOwned>(arguments: &Value) -> std::result::Result<T, ToolError> {
    let arguments = if arguments.is_null() {
        json!({})
    } else {
        arguments.clone()
    };
    serde_json::from_value(arguments).map_err(|e| ToolError::InvalidArguments(e.to_string()))
}

/// Trait for a single tool
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    /// JSON schema of the arguments object
    fn parameters(&self) -> Value;
    async fn execute(&self, arguments: &Value) -> ToolOutcome;
}

/// Outcome of one requested call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub call_id: String,
    pub name: String,
    pub outcome: ToolOutcome,
}

impl ToolResult {
    pub fn into_message(self) -> Message {
        let content = match self.outcome {
            Ok(Value::String(text)) => text,
            Ok(value) => value.to_string(),
            Err(error) => error.to_payload().to_string(),
        };
        Message::tool(self.call_id, self.name, content)
    }
}

/// Tool registry for looking up tools by name
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Declarations handed to the model, in a stable order.
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.list()
            .into_iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| ToolSpec {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters(),
            })
            .collect()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Executes queued calls concurrently, each under its own timeout.
#[derive(Clone)]
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    timeout: Duration,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Results come back in request order, whatever order the calls finish in.
    pub async fn dispatch(&self, calls: &[ToolCallRequest]) -> Vec<ToolResult> {
        join_all(calls.iter().map(|call| self.run(call))).await
    }

    async fn run(&self, call: &ToolCallRequest) -> ToolResult {
        let start = Instant::now();

        let outcome = match self.registry.get(&call.name) {
            Some(tool) => {
                match tokio::time::timeout(self.timeout, tool.execute(&call.arguments)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(ToolError::Timeout(self.timeout)),
                }
            }
            None => Err(ToolError::UnknownTool(call.name.clone())),
        };

        let elapsed_ms = start.elapsed().as_millis() as u64;
        match &outcome {
            Ok(_) => debug!(tool = %call.name, call_id = %call.id, elapsed_ms, "Tool call succeeded"),
            Err(e) => warn!(tool = %call.name, call_id = %call.id, elapsed_ms, error = %e, "Tool call failed"),
        }

        ToolResult {
            call_id: call.id.clone(),
            name: call.name.clone(),
            outcome,
        }
    }
}

/// Registry with the market-data, calculator and search tools.
pub fn create_default_registry(
    market: YahooFinanceClient,
    search: Option<GeminiClient>,
) -> ToolRegistry {
    let mut registry = ToolRegistry::new();

    registry.register(Arc::new(ProductDataTool::new(market.clone())));
    registry.register(Arc::new(MarketOverviewTool::new(market.clone())));
    registry.register(Arc::new(PortfolioRiskTool::new(market)));
    registry.register(Arc::new(CompoundGrowthTool));

    match search {
        Some(client) => registry.register(Arc::new(WebSearchTool::new(client))),
        None => warn!("web_search disabled: no Gemini client configured"),
    }

    registry
}
