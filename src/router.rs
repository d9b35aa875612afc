//! Intent router
//!
//! One call to the light router model decides whether the latest message is
//! small talk or needs the advisory path. Any failure routes to advisory.

use crate::error::OrchestrationError;
use crate::llm::{ChatModel, ModelRequest};
use crate::models::{Intent, Message};
use crate::prompts;
use crate::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const SMALL_TALK_LABELS: &[&str] = &["small_talk", "smalltalk", "small talk"];
const ADVISORY_LABELS: &[&str] = &["advisory", "main_agent", "main agent"];

pub struct IntentRouter {
    model: Arc<dyn ChatModel>,
    timeout: Duration,
}

impl IntentRouter {
    pub fn new(model: Arc<dyn ChatModel>, timeout: Duration) -> Self {
        Self { model, timeout }
    }

    /// Never fails: any routing problem falls back to `Intent::Advisory`.
    pub async fn classify(&self, latest: &str, recent_history: &[Message]) -> Intent {
        match self.ask(latest, recent_history).await {
            Ok(intent) => {
                debug!(?intent, "Router classified message");
                intent
            }
            Err(e) => {
                warn!(error = %e, "Defaulting to advisory");
                Intent::Advisory
            }
        }
    }

    async fn ask(&self, latest: &str, recent_history: &[Message]) -> Result<Intent> {
        let request = ModelRequest {
            system: String::new(),
            messages: vec![Message::user(prompts::router_prompt(latest, recent_history), None)],
            tools: Vec::new(),
            temperature: Some(0.0),
        };

        let answer = tokio::time::timeout(self.timeout, self.model.complete(request))
            .await
            .map_err(|_| OrchestrationError::RoutingError(format!("no answer within {:?}", self.timeout)))?
            .map_err(|e| OrchestrationError::RoutingError(e.to_string()))?;

        parse_label(&answer)
            .ok_or_else(|| OrchestrationError::RoutingError(format!("unparseable answer {:?}", answer.trim())))
    }
}

/// Map the router's one-word answer to an intent.
pub fn parse_label(answer: &str) -> Option<Intent> {
    let answer = answer.trim().to_lowercase();
    let answer = answer.trim_matches(|c: char| !c.is_alphanumeric() && c != '_' && c != ' ');

    if SMALL_TALK_LABELS.iter().any(|label| answer.starts_with(label)) {
        Some(Intent::SmallTalk)
    } else if ADVISORY_LABELS.iter().any(|label| answer.starts_with(label)) {
        Some(Intent::Advisory)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ScriptStep, ScriptedModel};

    fn router(model: ScriptedModel) -> (IntentRouter, Arc<ScriptedModel>) {
        let model = Arc::new(model);
        (IntentRouter::new(model.clone(), Duration::from_secs(5)), model)
    }

    #[test]
    fn test_parse_labels() {
        assert_eq!(parse_label("small_talk"), Some(Intent::SmallTalk));
        assert_eq!(parse_label("  **Small_Talk**.\n"), Some(Intent::SmallTalk));
        assert_eq!(parse_label("advisory"), Some(Intent::Advisory));
        assert_eq!(parse_label("main_agent"), Some(Intent::Advisory));
        assert_eq!(parse_label("I am not sure"), None);
    }

    #[tokio::test]
    async fn test_greeting_routes_to_small_talk() {
        let (router, model) = router(ScriptedModel::new().then_reply("small_talk"));
        assert_eq!(router.classify("hello!", &[]).await, Intent::SmallTalk);

        let request = &model.requests()[0];
        assert!(request.tools.is_empty());
        assert!(request.messages[0].content.contains("Latest message: hello!"));
    }

    #[tokio::test]
    async fn test_failures_default_to_advisory() {
        let (router, _) = router(
            ScriptedModel::new()
                .then_refuse("quota exceeded")
                .then_reply("banana"),
        );
        assert_eq!(router.classify("hi", &[]).await, Intent::Advisory);
        assert_eq!(router.classify("hi", &[]).await, Intent::Advisory);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_defaults_to_advisory() {
        let model = ScriptedModel::new().then_stream(vec![
            ScriptStep::Delay(Duration::from_secs(30)),
            ScriptStep::text("small_talk"),
        ]);
        let router = IntentRouter::new(Arc::new(model), Duration::from_secs(1));
        assert_eq!(router.classify("hey", &[]).await, Intent::Advisory);
    }

    #[tokio::test]
    async fn test_history_is_included() {
        let (router, model) = router(ScriptedModel::new().then_reply("advisory"));
        let history = vec![
            Message::user("I'm 40", None),
            Message::assistant("Thanks! What are your goals?"),
        ];
        router.classify("retirement", &history).await;

        let prompt = &model.requests()[0].messages[0].content;
        assert!(prompt.contains("User: I'm 40"));
        assert!(prompt.contains("Assistant: Thanks! What are your goals?"));
    }
}
