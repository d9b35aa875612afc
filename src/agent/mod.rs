//! Orchestration graph
//!
//! LEASE → LOAD → APPEND (idempotent) → ROUTE → { SMALL TALK | GATE → { CLARIFY | REASON } } → PERSIST
//!
//! Each turn runs in its own task and reports through a channel of
//! `TurnEvent`s. The caller going away never stops a turn; the final state
//! is persisted regardless.

use crate::checkpoint::{CheckpointStore, Checkpointer};
use crate::config::AgentConfig;
use crate::error::OrchestrationError;
use crate::llm::{ChatModel, ModelRequest};
use crate::models::{ClassifiedDelta, ConversationState, Intent, Message, Role};
use crate::profile::{extract_profile_updates, GateDecision, ProfileGate};
use crate::prompts;
use crate::router::IntentRouter;
use crate::tools::ToolDispatcher;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, info_span, warn, Instrument};

pub mod lease;
pub mod reasoning;

pub use lease::{ThreadLease, ThreadLeases};
pub use reasoning::{AbortReason, LoopState, ReasoningLoop};

/// Buffered events per turn before the producer waits on the caller
const EVENT_BUFFER: usize = 64;

//
// ================= Turn I/O =================
//

#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub thread_id: String,
    pub message: String,
    /// Explicit dedup key; defaults to a fingerprint of thread and message.
    pub turn_key: Option<String>,
}

impl TurnRequest {
    pub fn new(thread_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            message: message.into(),
            turn_key: None,
        }
    }

    pub fn resolved_key(&self) -> String {
        self.turn_key
            .clone()
            .unwrap_or_else(|| turn_fingerprint(&self.thread_id, &self.message))
    }
}

/// Stable key for "this message on this thread".
pub fn turn_fingerprint(thread_id: &str, message: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(thread_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(message.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStatus {
    Answered,
    /// The profile gate asked for more context instead of advising
    NeedsProfile,
    IterationCap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Model,
    Storage,
    Internal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Model => "model_error",
            FailureKind::Storage => "storage_error",
            FailureKind::Internal => "internal_error",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TurnFailure {
    pub kind: FailureKind,
    pub message: String,
    /// In-memory transcript at the time of failure
    pub transcript: Vec<Message>,
}

impl TurnFailure {
    fn storage(error: OrchestrationError, transcript: Vec<Message>) -> Self {
        Self {
            kind: FailureKind::Storage,
            message: error.to_string(),
            transcript,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    Delta(ClassifiedDelta),
    Finished(TurnStatus),
    Failed(TurnFailure),
}

pub type TurnStream = mpsc::Receiver<TurnEvent>;

/// Producer side of a turn's event channel. Sends never fail the turn.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<TurnEvent>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<TurnEvent>) -> Self {
        Self { tx }
    }

    pub async fn emit(&self, event: TurnEvent) {
        if self.tx.send(event).await.is_err() {
            debug!("Caller disconnected, continuing turn without output");
        }
    }

    pub async fn delta(&self, delta: ClassifiedDelta) {
        self.emit(TurnEvent::Delta(delta)).await;
    }
}

/// How a turn ended, before it is reported.
enum Conclusion {
    Finished(TurnStatus),
    ModelFailed(String),
}

//
// ================= Orchestrator =================
//

/// Main orchestrator that coordinates one turn end to end
pub struct Orchestrator {
    store: Arc<dyn CheckpointStore>,
    leases: ThreadLeases,
    router: IntentRouter,
    light_model: Arc<dyn ChatModel>,
    reasoning: ReasoningLoop,
    config: AgentConfig,
}

impl Orchestrator {
    pub fn new(
        reasoning_model: Arc<dyn ChatModel>,
        light_model: Arc<dyn ChatModel>,
        dispatcher: ToolDispatcher,
        store: Arc<dyn CheckpointStore>,
        config: AgentConfig,
    ) -> Self {
        Self {
            store,
            leases: ThreadLeases::new(),
            router: IntentRouter::new(light_model.clone(), config.model_timeout),
            light_model,
            reasoning: ReasoningLoop::new(reasoning_model, dispatcher, config.clone()),
            config,
        }
    }

    /// Start a turn in its own task and return its event stream.
    pub fn handle_turn(self: &Arc<Self>, request: TurnRequest) -> TurnStream {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let orchestrator = Arc::clone(self);
        let span = info_span!("turn", thread_id = %request.thread_id);

        tokio::spawn(
            async move {
                orchestrator.run_turn(request, EventSink::new(tx)).await;
            }
            .instrument(span),
        );

        rx
    }

    /// Run a turn to completion on the current task.
    pub async fn run_turn(&self, request: TurnRequest, events: EventSink) {
        let _lease = self.leases.acquire(&request.thread_id).await;

        let terminal = match self.execute(&request, &events).await {
            Ok((Conclusion::Finished(status), _)) => {
                info!(?status, "Turn finished");
                TurnEvent::Finished(status)
            }
            Ok((Conclusion::ModelFailed(message), transcript)) => {
                warn!(error = %message, "Turn failed on the model");
                TurnEvent::Failed(TurnFailure {
                    kind: FailureKind::Model,
                    message,
                    transcript,
                })
            }
            Err(failure) => {
                error!(error = %failure.message, "Turn failed on storage");
                TurnEvent::Failed(failure)
            }
        };

        events.emit(terminal).await;
    }

    async fn execute(
        &self,
        request: &TurnRequest,
        events: &EventSink,
    ) -> std::result::Result<(Conclusion, Vec<Message>), TurnFailure> {
        let (mut checkpointer, loaded) =
            Checkpointer::open(self.store.clone(), &request.thread_id, self.config.storage_timeout)
                .await
                .map_err(|e| TurnFailure::storage(e, Vec::new()))?;
        let mut state = loaded.unwrap_or_else(|| ConversationState::new(request.thread_id.clone()));

        let turn_key = request.resolved_key();
        let resumed = state.is_retry_of(&turn_key);
        if resumed {
            info!(messages = state.messages.len(), "Resuming unfinished turn");
        } else {
            let update = extract_profile_updates(&request.message);
            if !update.is_empty() {
                debug!(?update, "Profile facts learned");
            }
            state.user_profile.merge(update);
            state.profile_complete = state.user_profile.is_complete();
            state.push(Message::user(request.message.clone(), Some(turn_key)));
        }

        let intent = if resumed && state.intent != Intent::Unknown {
            state.intent
        } else {
            let history = history_before_latest(&state, self.config.router_history);
            self.router.classify(&request.message, history).await
        };
        state.intent = intent;

        let conclusion = match state.intent {
            Intent::SmallTalk => self.small_talk(&mut state, events).await,
            Intent::Advisory | Intent::Unknown => match ProfileGate::evaluate(&state.user_profile) {
                GateDecision::Incomplete(missing) => {
                    info!(?missing, "Profile incomplete, asking before advising");
                    let question = ProfileGate::clarifying_question(&missing);
                    events.delta(ClassifiedDelta::Content(question.clone())).await;
                    state.push(Message::assistant(question));
                    Conclusion::Finished(TurnStatus::NeedsProfile)
                }
                GateDecision::Complete => {
                    let outcome = self
                        .reasoning
                        .run(&mut state, &mut checkpointer, events)
                        .await
                        .map_err(|e| TurnFailure::storage(e, state.messages.clone()))?;
                    match outcome {
                        LoopState::Aborted(AbortReason::IterationCap) => {
                            Conclusion::Finished(TurnStatus::IterationCap)
                        }
                        LoopState::Aborted(AbortReason::Model(message)) => Conclusion::ModelFailed(message),
                        _ => Conclusion::Finished(TurnStatus::Answered),
                    }
                }
            },
        };

        checkpointer
            .save(&state)
            .await
            .map_err(|e| TurnFailure::storage(e, state.messages.clone()))?;

        Ok((conclusion, state.messages))
    }

    async fn small_talk(&self, state: &mut ConversationState, events: &EventSink) -> Conclusion {
        let window = state.messages.len().saturating_sub(self.config.router_history + 1);
        let messages: Vec<Message> = state.messages[window..]
            .iter()
            .filter(|m| m.role == Role::User || (m.role == Role::Assistant && m.tool_calls.is_empty()))
            .cloned()
            .collect();

        let request = ModelRequest {
            system: prompts::small_talk_system_prompt(),
            messages,
            tools: Vec::new(),
            temperature: self.config.temperature,
        };

        match reasoning::generate_with_retries(self.light_model.as_ref(), request, &self.config, events).await {
            Ok(generation) => {
                state.push(Message::assistant(generation.content));
                Conclusion::Finished(TurnStatus::Answered)
            }
            Err(e) => Conclusion::ModelFailed(e.to_string()),
        }
    }
}

/// Router context: the messages preceding the latest user message.
fn history_before_latest(state: &ConversationState, count: usize) -> &[Message] {
    let end = state.last_user_index().unwrap_or(state.messages.len());
    &state.messages[end.saturating_sub(count)..end]
}
