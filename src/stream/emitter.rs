//! Stream emitter
//!
//! Maps turn events onto the OpenAI chat-completions wire format. Streaming
//! callers get one frame per event, flushed as produced; non-streaming
//! callers get the events folded into a single completion object.

use crate::agent::{FailureKind, TurnEvent, TurnFailure, TurnStatus};
use crate::models::{ClassifiedDelta, Message, ToolCallRequest};
use serde::{Deserialize, Serialize};

//
// ================= Wire Schemas =================
//

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DeltaContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: DeltaContent,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseMessage {
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseChoice {
    pub index: u32,
    pub message: ResponseMessage,
    pub finish_reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ResponseChoice>,
    pub usage: Usage,
}

/// Error payload sent in-band when a turn fails mid-stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorBody {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
    /// Transcript as held in memory when the turn failed
    pub transcript: Vec<Message>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorEvent {
    pub error: ErrorBody,
}

impl From<&TurnFailure> for ErrorEvent {
    fn from(failure: &TurnFailure) -> Self {
        Self {
            error: ErrorBody {
                message: failure.message.clone(),
                kind: failure.kind.as_str().to_string(),
                transcript: failure.transcript.clone(),
            },
        }
    }
}

pub fn completion_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("chatcmpl-{}", &hex[..12])
}

pub fn finish_reason(status: TurnStatus) -> &'static str {
    match status {
        TurnStatus::IterationCap => "length",
        TurnStatus::Answered | TurnStatus::NeedsProfile => "stop",
    }
}

/// One-line note shown to the caller when the model requests a tool.
pub fn tool_call_note(call: &ToolCallRequest) -> String {
    format!("\n[tool] {}({})\n", call.name, call.arguments)
}

//
// ================= Streaming =================
//

/// One SSE `data:` payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Chunk(ChatCompletionChunk),
    Error(ErrorEvent),
    Done,
}

impl Frame {
    pub fn data(&self) -> String {
        let encoded = match self {
            Frame::Chunk(chunk) => serde_json::to_string(chunk),
            Frame::Error(event) => serde_json::to_string(event),
            Frame::Done => return "[DONE]".to_string(),
        };
        encoded.unwrap_or_else(|e| {
            format!(
                r#"{{"error":{{"message":"failed to encode frame: {}","type":"internal_error"}}}}"#,
                e
            )
        })
    }
}

/// Stateful encoder for one streamed response.
#[derive(Debug)]
pub struct ChunkEncoder {
    id: String,
    created: i64,
    model: String,
    role_sent: bool,
}

impl ChunkEncoder {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            id: completion_id(),
            created: chrono::Utc::now().timestamp(),
            model: model.into(),
            role_sent: false,
        }
    }

    /// Frames for one event. Terminal events end with `Frame::Done`.
    pub fn encode(&mut self, event: &TurnEvent) -> Vec<Frame> {
        match event {
            TurnEvent::Delta(delta) => {
                let mut content = DeltaContent::default();
                match delta {
                    ClassifiedDelta::Reasoning(text) => content.reasoning_content = Some(text.clone()),
                    ClassifiedDelta::Content(text) => content.content = Some(text.clone()),
                    ClassifiedDelta::ToolCall(call) => {
                        content.reasoning_content = Some(tool_call_note(call))
                    }
                }
                vec![Frame::Chunk(self.chunk(content, None))]
            }
            TurnEvent::Finished(status) => vec![
                Frame::Chunk(self.chunk(DeltaContent::default(), Some(finish_reason(*status)))),
                Frame::Done,
            ],
            TurnEvent::Failed(failure) => vec![Frame::Error(ErrorEvent::from(failure)), Frame::Done],
        }
    }

    fn chunk(&mut self, mut delta: DeltaContent, finish: Option<&str>) -> ChatCompletionChunk {
        if !self.role_sent {
            delta.role = Some("assistant".to_string());
            self.role_sent = true;
        }

        ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason: finish.map(str::to_string),
            }],
        }
    }
}

//
// ================= Non-streaming =================
//

#[derive(Debug, Default)]
pub struct CompletionCollector {
    content: String,
    reasoning: String,
    status: Option<TurnStatus>,
    failure: Option<TurnFailure>,
}

impl CompletionCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: TurnEvent) {
        match event {
            TurnEvent::Delta(ClassifiedDelta::Content(text)) => self.content.push_str(&text),
            TurnEvent::Delta(ClassifiedDelta::Reasoning(text)) => self.reasoning.push_str(&text),
            TurnEvent::Delta(ClassifiedDelta::ToolCall(call)) => {
                self.reasoning.push_str(&tool_call_note(&call))
            }
            TurnEvent::Finished(status) => self.status = Some(status),
            TurnEvent::Failed(failure) => self.failure = Some(failure),
        }
    }

    /// Fold the collected events into one completion object.
    pub fn finish(self, model: &str) -> std::result::Result<ChatCompletionResponse, TurnFailure> {
        if let Some(failure) = self.failure {
            return Err(failure);
        }

        let Some(status) = self.status else {
            return Err(TurnFailure {
                kind: FailureKind::Internal,
                message: "turn ended without a terminal event".to_string(),
                transcript: Vec::new(),
            });
        };

        Ok(ChatCompletionResponse {
            id: completion_id(),
            object: "chat.completion".to_string(),
            created: chrono::Utc::now().timestamp(),
            model: model.to_string(),
            choices: vec![ResponseChoice {
                index: 0,
                message: ResponseMessage {
                    role: "assistant".to_string(),
                    content: self.content,
                    reasoning_content: (!self.reasoning.is_empty()).then_some(self.reasoning),
                },
                finish_reason: finish_reason(status).to_string(),
            }],
            usage: Usage::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn payload(frame: &Frame) -> Value {
        serde_json::from_str(&frame.data()).unwrap()
    }

    #[test]
    fn test_role_only_on_first_chunk() {
        let mut encoder = ChunkEncoder::new("wealth-steward");
        let first = encoder.encode(&TurnEvent::Delta(ClassifiedDelta::Reasoning("hmm".into())));
        let second = encoder.encode(&TurnEvent::Delta(ClassifiedDelta::Content("Hi".into())));

        let first = payload(&first[0]);
        let second = payload(&second[0]);
        assert_eq!(first["object"], "chat.completion.chunk");
        assert_eq!(first["choices"][0]["delta"]["role"], "assistant");
        assert_eq!(first["choices"][0]["delta"]["reasoning_content"], "hmm");
        assert!(second["choices"][0]["delta"].get("role").is_none());
        assert_eq!(second["choices"][0]["delta"]["content"], "Hi");
        assert_eq!(first["id"], second["id"]);
    }

    #[test]
    fn test_terminal_frames() {
        let mut encoder = ChunkEncoder::new("wealth-steward");
        let frames = encoder.encode(&TurnEvent::Finished(TurnStatus::IterationCap));
        assert_eq!(frames.len(), 2);
        assert_eq!(payload(&frames[0])["choices"][0]["finish_reason"], "length");
        assert_eq!(frames[1].data(), "[DONE]");

        let failure = TurnFailure {
            kind: FailureKind::Storage,
            message: "disk full".into(),
            transcript: vec![Message::user("hello", None)],
        };
        let frames = encoder.encode(&TurnEvent::Failed(failure));
        let error = payload(&frames[0]);
        assert_eq!(error["error"]["type"], "storage_error");
        assert_eq!(error["error"]["transcript"][0]["content"], "hello");
        assert_eq!(frames[1], Frame::Done);
    }

    #[test]
    fn test_tool_call_becomes_reasoning_note() {
        let mut encoder = ChunkEncoder::new("m");
        let call = ToolCallRequest::new("get_market_overview", json!({}));
        let frames = encoder.encode(&TurnEvent::Delta(ClassifiedDelta::ToolCall(call)));
        let note = payload(&frames[0])["choices"][0]["delta"]["reasoning_content"].clone();
        assert_eq!(note, "\n[tool] get_market_overview({})\n");
    }

    #[test]
    fn test_collector_folds_events() {
        let mut collector = CompletionCollector::new();
        collector.push(TurnEvent::Delta(ClassifiedDelta::Reasoning("think".into())));
        collector.push(TurnEvent::Delta(ClassifiedDelta::Content("Buy ".into())));
        collector.push(TurnEvent::Delta(ClassifiedDelta::Content("bonds.".into())));
        collector.push(TurnEvent::Finished(TurnStatus::Answered));

        let response = collector.finish("wealth-steward").unwrap();
        assert_eq!(response.object, "chat.completion");
        assert_eq!(response.choices[0].message.content, "Buy bonds.");
        assert_eq!(response.choices[0].message.reasoning_content.as_deref(), Some("think"));
        assert_eq!(response.choices[0].finish_reason, "stop");
    }

    #[test]
    fn test_collector_without_terminal_event_is_an_error() {
        let mut collector = CompletionCollector::new();
        collector.push(TurnEvent::Delta(ClassifiedDelta::Content("partial".into())));
        let failure = collector.finish("m").unwrap_err();
        assert_eq!(failure.kind, FailureKind::Internal);
    }
}
