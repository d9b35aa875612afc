//! Reasoning loop
//!
//! THINK -> ACT -> THINK -> ... -> DONE | ABORTED
//!
//! THINK streams one model generation through the classifier, forwarding
//! every delta as it is produced. ACT runs the requested tools and appends
//! their results in request order, then checkpoints. The number of THINK
//! invocations per turn is capped.

use super::EventSink;
use crate::checkpoint::Checkpointer;
use crate::config::AgentConfig;
use crate::error::OrchestrationError;
use crate::llm::{ChatModel, ModelRequest};
use crate::models::{ClassifiedDelta, ConversationState, Message, ToolCallRequest};
use crate::prompts;
use crate::stream::StreamClassifier;
use crate::tools::ToolDispatcher;
use crate::Result;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    IterationCap,
    Model(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoopState {
    Think,
    Act(Vec<ToolCallRequest>),
    Done,
    Aborted(AbortReason),
}

/// Text and calls accumulated from one generation.
#[derive(Debug, Default)]
pub struct Generation {
    pub content: String,
    pub tool_calls: Vec<ToolCallRequest>,
}

impl Generation {
    fn absorb(&mut self, delta: &ClassifiedDelta) {
        match delta {
            ClassifiedDelta::Content(text) => self.content.push_str(text),
            ClassifiedDelta::ToolCall(call) => self.tool_calls.push(call.clone()),
            ClassifiedDelta::Reasoning(_) => {}
        }
    }
}

/// A failed generation, and whether any of it already reached the caller.
#[derive(Debug)]
pub struct GenerationFailure {
    pub error: OrchestrationError,
    pub emitted: bool,
}

/// Stream one generation, forwarding classified deltas as they appear.
pub async fn generate(
    model: &dyn ChatModel,
    request: ModelRequest,
    timeout: Duration,
    events: &EventSink,
) -> std::result::Result<Generation, GenerationFailure> {
    let mut emitted = false;
    let fail = |error: OrchestrationError, emitted: bool| GenerationFailure { error, emitted };

    let mut stream = match tokio::time::timeout(timeout, model.stream(request)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(fail(e, false)),
        Err(_) => return Err(fail(timed_out(timeout), false)),
    };

    let mut classifier = StreamClassifier::new();
    let mut generation = Generation::default();

    loop {
        let chunk = match tokio::time::timeout(timeout, stream.next()).await {
            Ok(Some(Ok(chunk))) => chunk,
            Ok(Some(Err(e))) => return Err(fail(e, emitted)),
            Ok(None) => break,
            Err(_) => return Err(fail(timed_out(timeout), emitted)),
        };

        for delta in classifier.push(chunk) {
            generation.absorb(&delta);
            events.delta(delta).await;
            emitted = true;
        }
    }

    for delta in classifier.finish() {
        generation.absorb(&delta);
        events.delta(delta).await;
    }

    Ok(generation)
}

/// `generate` with linear-backoff retries while nothing has been emitted.
pub async fn generate_with_retries(
    model: &dyn ChatModel,
    request: ModelRequest,
    config: &AgentConfig,
    events: &EventSink,
) -> Result<Generation> {
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match generate(model, request.clone(), config.model_timeout, events).await {
            Ok(generation) => return Ok(generation),
            Err(failure) if failure.emitted || attempt > config.model_retries => {
                return Err(failure.error)
            }
            Err(failure) => {
                warn!(attempt, error = %failure.error, "Model call failed, retrying");
                tokio::time::sleep(config.retry_backoff * attempt).await;
            }
        }
    }
}

fn timed_out(timeout: Duration) -> OrchestrationError {
    OrchestrationError::ModelError(format!("no output within {:?}", timeout))
}

fn iteration_cap_note(cap: u32) -> String {
    format!(
        "\n\n[Stopped after {} reasoning steps without reaching a final answer. \
         Ask again or narrow the question to continue.]",
        cap
    )
}

pub struct ReasoningLoop {
    model: Arc<dyn ChatModel>,
    dispatcher: ToolDispatcher,
    config: AgentConfig,
}

impl ReasoningLoop {
    pub fn new(model: Arc<dyn ChatModel>, dispatcher: ToolDispatcher, config: AgentConfig) -> Self {
        Self {
            model,
            dispatcher,
            config,
        }
    }

    /// Drive the loop to a terminal state. Only storage failures are errors;
    /// model failures end in `Aborted(Model)`.
    pub async fn run(
        &self,
        state: &mut ConversationState,
        checkpointer: &mut Checkpointer,
        events: &EventSink,
    ) -> Result<LoopState> {
        let cap = self.config.max_iterations;
        let mut iterations = state.completed_cycles();

        let pending = state.pending_tool_calls();
        let mut current = if pending.is_empty() {
            LoopState::Think
        } else {
            info!(calls = pending.len(), "Resuming with unanswered tool calls");
            LoopState::Act(pending)
        };

        loop {
            current = match current {
                LoopState::Think if iterations >= cap => {
                    self.stop_at_cap(state, events, String::new()).await
                }
                LoopState::Think => {
                    iterations += 1;
                    debug!(iteration = iterations, cap, "THINK");
                    self.think(state, events, iterations == cap).await
                }
                LoopState::Act(calls) => {
                    debug!(iteration = iterations, calls = calls.len(), "ACT");
                    for result in self.dispatcher.dispatch(&calls).await {
                        state.push(result.into_message());
                    }
                    checkpointer.save(state).await?;
                    LoopState::Think
                }
                terminal @ (LoopState::Done | LoopState::Aborted(_)) => return Ok(terminal),
            };
        }
    }

    async fn think(&self, state: &mut ConversationState, events: &EventSink, last_allowed: bool) -> LoopState {
        let request = ModelRequest {
            system: prompts::reasoning_system_prompt(&state.user_profile),
            messages: state.messages.clone(),
            tools: self.dispatcher.registry().specs(),
            temperature: self.config.temperature,
        };

        let generation = match generate_with_retries(self.model.as_ref(), request, &self.config, events).await {
            Ok(generation) => generation,
            Err(e) => {
                warn!(error = %e, "Reasoning aborted by model failure");
                return LoopState::Aborted(AbortReason::Model(e.to_string()));
            }
        };

        if generation.tool_calls.is_empty() {
            state.push(Message::assistant(generation.content));
            return LoopState::Done;
        }

        if last_allowed {
            debug!(calls = generation.tool_calls.len(), "Dropping tool calls requested at the cap");
            return self.stop_at_cap(state, events, generation.content).await;
        }

        let calls = generation.tool_calls.clone();
        state.push(Message::assistant_with_calls(generation.content, generation.tool_calls));
        LoopState::Act(calls)
    }

    async fn stop_at_cap(&self, state: &mut ConversationState, events: &EventSink, partial: String) -> LoopState {
        let cap = self.config.max_iterations;
        warn!(cap, "Iteration cap reached, returning partial answer");
        let note = iteration_cap_note(cap);
        events.delta(ClassifiedDelta::Content(note.clone())).await;
        state.push(Message::assistant(format!("{}{}", partial, note)));
        LoopState::Aborted(AbortReason::IterationCap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::TurnEvent;
    use crate::checkpoint::{CheckpointStore, InMemoryCheckpointStore};
    use crate::llm::{ScriptStep, ScriptedModel};
    use crate::tools::testing::SlowEcho;
    use crate::tools::ToolRegistry;
    use serde_json::json;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    fn dispatcher() -> ToolDispatcher {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(SlowEcho {
            name: "get_market_overview",
            delay: Duration::ZERO,
            finished: Arc::new(Mutex::new(Vec::new())),
        }));
        ToolDispatcher::new(Arc::new(registry), Duration::from_secs(5))
    }

    fn config(max_iterations: u32) -> AgentConfig {
        AgentConfig {
            max_iterations,
            retry_backoff: Duration::ZERO,
            ..AgentConfig::default()
        }
    }

    async fn checkpointer(thread_id: &str) -> Checkpointer {
        let store: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());
        Checkpointer::open(store, thread_id, Duration::from_secs(1)).await.unwrap().0
    }

    fn sink() -> (EventSink, mpsc::Receiver<TurnEvent>) {
        let (tx, rx) = mpsc::channel(256);
        (EventSink::new(tx), rx)
    }

    fn drain(rx: &mut mpsc::Receiver<TurnEvent>) -> Vec<TurnEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn looping_model(rounds: usize) -> ScriptedModel {
        (0..rounds).fold(ScriptedModel::new(), |model, i| {
            model.then_stream(vec![
                ScriptStep::text(format!("step {} ", i)),
                ScriptStep::call("get_market_overview", json!({ "round": i })),
            ])
        })
    }

    #[tokio::test]
    async fn test_iteration_cap_is_never_exceeded() {
        for cap in 1..=4u32 {
            let model = Arc::new(looping_model(10));
            let reasoning = ReasoningLoop::new(model.clone(), dispatcher(), config(cap));
            let mut state = ConversationState::new("cap");
            state.push(Message::user("loop forever", None));
            let mut checkpointer = checkpointer("cap").await;
            let (events, mut rx) = sink();

            let outcome = reasoning.run(&mut state, &mut checkpointer, &events).await.unwrap();

            assert_eq!(outcome, LoopState::Aborted(AbortReason::IterationCap));
            assert_eq!(model.calls(), cap as usize, "cap {}", cap);
            assert_eq!(state.completed_cycles(), cap - 1);

            let last = state.messages.last().unwrap();
            assert!(!last.requests_tools());
            assert!(last.content.starts_with(&format!("step {} ", cap - 1)));
            assert!(last.content.contains("Stopped after"));

            let streamed: String = drain(&mut rx)
                .into_iter()
                .filter_map(|e| match e {
                    TurnEvent::Delta(ClassifiedDelta::Content(text)) => Some(text),
                    _ => None,
                })
                .collect();
            assert!(streamed.contains("Stopped after"));
        }
    }

    #[tokio::test]
    async fn test_think_act_think_done() {
        let model = Arc::new(
            ScriptedModel::new()
                .then_stream(vec![
                    ScriptStep::thought("check the market first"),
                    ScriptStep::call("get_market_overview", json!({})),
                ])
                .then_reply("Markets are calm."),
        );
        let reasoning = ReasoningLoop::new(model.clone(), dispatcher(), config(6));
        let mut state = ConversationState::new("t");
        state.push(Message::user("how are markets?", None));
        let mut checkpointer = checkpointer("t").await;
        let (events, _rx) = sink();

        let outcome = reasoning.run(&mut state, &mut checkpointer, &events).await.unwrap();

        assert_eq!(outcome, LoopState::Done);
        assert_eq!(checkpointer.version(), 1);
        let roles: Vec<_> = state.messages.iter().map(|m| m.role).collect();
        use crate::models::Role::*;
        assert_eq!(roles, vec![User, Assistant, Tool, Assistant]);
        assert_eq!(state.messages[3].content, "Markets are calm.");

        let second = &model.requests()[1];
        assert_eq!(second.messages.len(), 3);
        assert!(second.system.contains("Current user profile"));
        assert_eq!(second.tools.len(), 1);
    }

    #[tokio::test]
    async fn test_resume_runs_only_unanswered_calls() {
        let model = Arc::new(ScriptedModel::new().then_reply("Done."));
        let reasoning = ReasoningLoop::new(model.clone(), dispatcher(), config(6));

        let answered = ToolCallRequest::new("get_market_overview", json!({"n": 1}));
        let pending = ToolCallRequest::new("get_market_overview", json!({"n": 2}));
        let mut state = ConversationState::new("r");
        state.push(Message::user("two lookups", None));
        state.push(Message::assistant_with_calls("", vec![answered.clone(), pending.clone()]));
        state.push(Message::tool(answered.id.clone(), answered.name.clone(), "{}"));
        let mut checkpointer = checkpointer("r").await;
        let (events, _rx) = sink();

        reasoning.run(&mut state, &mut checkpointer, &events).await.unwrap();

        let tool_ids: Vec<_> = state
            .messages
            .iter()
            .filter_map(|m| m.tool_call_id.clone())
            .collect();
        assert_eq!(tool_ids, vec![answered.id, pending.id]);
        assert_eq!(model.calls(), 1);
    }

    #[tokio::test]
    async fn test_model_failure_retried_until_exhausted() {
        let model = Arc::new(
            ScriptedModel::new()
                .then_refuse("503")
                .then_refuse("503")
                .then_reply("Recovered."),
        );
        let reasoning = ReasoningLoop::new(model.clone(), dispatcher(), config(6));
        let mut state = ConversationState::new("m");
        state.push(Message::user("hi", None));
        let mut checkpointer = checkpointer("m").await;
        let (events, _rx) = sink();

        let outcome = reasoning.run(&mut state, &mut checkpointer, &events).await.unwrap();
        assert_eq!(outcome, LoopState::Done);
        assert_eq!(model.calls(), 3);

        let model = Arc::new(ScriptedModel::new().then_refuse("a").then_refuse("b").then_refuse("c"));
        let reasoning = ReasoningLoop::new(model.clone(), dispatcher(), config(6));
        let outcome = reasoning.run(&mut state, &mut checkpointer, &events).await.unwrap();
        assert!(matches!(outcome, LoopState::Aborted(AbortReason::Model(ref m)) if m.contains('c')));
        assert_eq!(model.calls(), 3);
    }

    #[tokio::test]
    async fn test_no_retry_after_partial_output() {
        let model = Arc::new(
            ScriptedModel::new()
                .then_stream(vec![ScriptStep::text("Half an ans"), ScriptStep::Fail("reset".into())])
                .then_reply("never used"),
        );
        let reasoning = ReasoningLoop::new(model.clone(), dispatcher(), config(6));
        let mut state = ConversationState::new("p");
        state.push(Message::user("hi", None));
        let mut checkpointer = checkpointer("p").await;
        let (events, mut rx) = sink();

        let outcome = reasoning.run(&mut state, &mut checkpointer, &events).await.unwrap();

        assert!(matches!(outcome, LoopState::Aborted(AbortReason::Model(_))));
        assert_eq!(model.calls(), 1);
        assert_eq!(state.messages.len(), 1);
        assert_eq!(
            drain(&mut rx),
            vec![TurnEvent::Delta(ClassifiedDelta::Content("Half an ans".into()))]
        );
    }
}
