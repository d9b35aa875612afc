//! Language-model capability
//!
//! The orchestrator only sees this interface: a transcript goes in, an
//! annotated chunk stream comes out.

use crate::models::{Message, ToolCallRequest};
use crate::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;

pub mod gemini;
pub mod scripted;

pub use gemini::GeminiClient;
pub use scripted::{ScriptStep, ScriptedModel};

/// One raw fragment of model output.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelChunk {
    /// Text; `thought` is the provider's native reasoning annotation.
    Text { text: String, thought: bool },
    ToolCall(ToolCallRequest),
}

impl ModelChunk {
    pub fn text(text: impl Into<String>) -> Self {
        ModelChunk::Text {
            text: text.into(),
            thought: false,
        }
    }

    pub fn thought(text: impl Into<String>) -> Self {
        ModelChunk::Text {
            text: text.into(),
            thought: true,
        }
    }
}

/// Tool declaration handed to the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments object
    pub parameters: Value,
}

#[derive(Debug, Clone, Default)]
pub struct ModelRequest {
    pub system: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSpec>,
    pub temperature: Option<f32>,
}

pub type ModelStream = BoxStream<'static, Result<ModelChunk>>;

#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Start a streamed generation.
    async fn stream(&self, request: ModelRequest) -> Result<ModelStream>;

    /// Drain a generation and return its non-thought text.
    async fn complete(&self, request: ModelRequest) -> Result<String> {
        let mut stream = self.stream(request).await?;
        let mut answer = String::new();
        while let Some(chunk) = stream.next().await {
            if let ModelChunk::Text { text, thought: false } = chunk? {
                answer.push_str(&text);
            }
        }
        Ok(answer)
    }
}
