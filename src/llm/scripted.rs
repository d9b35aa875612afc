//! Scripted model for development & testing
//!
//! Replays pre-recorded chunk streams in order, one script per call.
//! Keeps the pipeline runnable without any LLM dependency.

use super::{ChatModel, ModelChunk, ModelRequest, ModelStream};
use crate::error::OrchestrationError;
use crate::models::ToolCallRequest;
use crate::Result;
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum ScriptStep {
    Chunk(ModelChunk),
    /// Pause before the next step
    Delay(Duration),
    /// Break the stream with a model error
    Fail(String),
}

impl ScriptStep {
    pub fn text(text: impl Into<String>) -> Self {
        ScriptStep::Chunk(ModelChunk::text(text))
    }

    pub fn thought(text: impl Into<String>) -> Self {
        ScriptStep::Chunk(ModelChunk::thought(text))
    }

    pub fn call(name: &str, arguments: Value) -> Self {
        ScriptStep::Chunk(ModelChunk::ToolCall(ToolCallRequest::new(name, arguments)))
    }
}

#[derive(Debug)]
enum Script {
    Stream(Vec<ScriptStep>),
    Refuse(String),
}

#[derive(Debug, Default)]
pub struct ScriptedModel {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a streamed reply.
    pub fn then_stream(self, steps: Vec<ScriptStep>) -> Self {
        self.push(Script::Stream(steps));
        self
    }

    /// Queue a plain text reply.
    pub fn then_reply(self, text: &str) -> Self {
        self.then_stream(vec![ScriptStep::text(text)])
    }

    /// Queue a call that fails before streaming anything.
    pub fn then_refuse(self, reason: &str) -> Self {
        self.push(Script::Refuse(reason.to_string()));
        self
    }

    /// Number of generations requested so far.
    pub fn calls(&self) -> usize {
        self.lock_requests().len()
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.lock_requests().clone()
    }

    fn push(&self, script: Script) {
        self.scripts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(script);
    }

    fn lock_requests(&self) -> std::sync::MutexGuard<'_, Vec<ModelRequest>> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    async fn stream(&self, request: ModelRequest) -> Result<ModelStream> {
        self.lock_requests().push(request);

        let next = self
            .scripts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front();

        let steps = match next {
            Some(Script::Stream(steps)) => steps,
            Some(Script::Refuse(reason)) => return Err(OrchestrationError::ModelError(reason)),
            None => {
                return Err(OrchestrationError::ModelError(
                    "scripted model has no reply left".to_string(),
                ))
            }
        };

        let stream = futures::stream::iter(steps)
            .then(|step| async move {
                match step {
                    ScriptStep::Chunk(chunk) => Some(Ok(chunk)),
                    ScriptStep::Delay(duration) => {
                        tokio::time::sleep(duration).await;
                        None
                    }
                    ScriptStep::Fail(reason) => Some(Err(OrchestrationError::ModelError(reason))),
                }
            })
            .filter_map(|item| async move { item });

        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_replays_scripts_in_order() {
        let model = ScriptedModel::new()
            .then_reply("first")
            .then_stream(vec![ScriptStep::thought("hmm"), ScriptStep::text("second")]);

        assert_eq!(model.complete(ModelRequest::default()).await.unwrap(), "first");
        assert_eq!(model.complete(ModelRequest::default()).await.unwrap(), "second");
        assert!(model.complete(ModelRequest::default()).await.is_err());
        assert_eq!(model.calls(), 3);
    }

    #[tokio::test]
    async fn test_refusal_and_mid_stream_failure() {
        let model = ScriptedModel::new()
            .then_refuse("quota exceeded")
            .then_stream(vec![ScriptStep::text("partial"), ScriptStep::Fail("reset".into())]);

        let refused = model.complete(ModelRequest::default()).await;
        assert!(refused.unwrap_err().to_string().contains("quota exceeded"));

        let broken = model.complete(ModelRequest::default()).await;
        assert!(broken.unwrap_err().to_string().contains("reset"));
    }
}
