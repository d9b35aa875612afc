//! Core data models for the advisory agent

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

//
// ================= Enums =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RiskTolerance {
    Conservative,
    Moderate,
    Aggressive,
}

/// Outcome of the intent router for the current turn.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    #[default]
    Unknown,
    SmallTalk,
    Advisory,
}

//
// ================= Tool calls =================
//

/// A structured request from the model to invoke a tool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

impl ToolCallRequest {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: format!("call_{}", uuid::Uuid::new_v4().simple()),
            name: name.into(),
            arguments,
        }
    }
}

//
// ================= Messages =================
//

/// One transcript entry. Append-only: never mutated once appended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Tool name, set on tool messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Calls requested by an assistant THINK step.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    /// Dedup key of the request that appended a user message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_key: Option<String>,
}

impl Message {
    pub fn user(content: impl Into<String>, turn_key: Option<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_call_id: None,
            name: None,
            tool_calls: Vec::new(),
            turn_key,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::assistant_with_calls(content, Vec::new())
    }

    pub fn assistant_with_calls(content: impl Into<String>, tool_calls: Vec<ToolCallRequest>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_call_id: None,
            name: None,
            tool_calls,
            turn_key: None,
        }
    }

    pub fn tool(call_id: impl Into<String>, name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_call_id: Some(call_id.into()),
            name: Some(name.into()),
            tool_calls: Vec::new(),
            turn_key: None,
        }
    }

    pub fn requests_tools(&self) -> bool {
        self.role == Role::Assistant && !self.tool_calls.is_empty()
    }
}

//
// ================= Profile =================
//

/// Financial profile learned through conversation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserProfile {
    pub age: Option<u32>,
    pub risk_tolerance: Option<RiskTolerance>,
    pub time_horizon_years: Option<u32>,
    #[serde(default)]
    pub financial_goals: Vec<String>,
}

impl UserProfile {
    /// True iff all four fields are populated.
    pub fn is_complete(&self) -> bool {
        self.age.is_some()
            && self.risk_tolerance.is_some()
            && self.time_horizon_years.is_some()
            && !self.financial_goals.is_empty()
    }
}

//
// ================= Conversation State =================
//

/// Everything persisted for one thread between turns.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationState {
    pub thread_id: String,
    pub messages: Vec<Message>,
    pub user_profile: UserProfile,
    pub profile_complete: bool,
    pub intent: Intent,
    pub updated_at: DateTime<Utc>,
}

impl ConversationState {
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            messages: Vec::new(),
            user_profile: UserProfile::default(),
            profile_complete: false,
            intent: Intent::Unknown,
            updated_at: Utc::now(),
        }
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
        self.updated_at = Utc::now();
    }

    pub fn last_user_index(&self) -> Option<usize> {
        self.messages.iter().rposition(|m| m.role == Role::User)
    }

    /// Messages belonging to the turn opened by the latest user message.
    pub fn current_turn(&self) -> &[Message] {
        match self.last_user_index() {
            Some(idx) => &self.messages[idx + 1..],
            None => &[],
        }
    }

    /// A turn is complete once it ends with a final assistant answer.
    pub fn turn_complete(&self) -> bool {
        self.messages
            .last()
            .map(|m| m.role == Role::Assistant && m.tool_calls.is_empty())
            .unwrap_or(true)
    }

    /// Whether a request with `turn_key` retries the latest, unfinished turn.
    pub fn is_retry_of(&self, turn_key: &str) -> bool {
        let Some(idx) = self.last_user_index() else {
            return false;
        };
        self.messages[idx].turn_key.as_deref() == Some(turn_key) && !self.turn_complete()
    }

    /// THINK steps of the current turn that already led to tool execution.
    pub fn completed_cycles(&self) -> u32 {
        self.current_turn().iter().filter(|m| m.requests_tools()).count() as u32
    }

    /// Tool calls requested by the last assistant message that have no result yet.
    pub fn pending_tool_calls(&self) -> Vec<ToolCallRequest> {
        let Some(idx) = self.messages.iter().rposition(|m| m.role != Role::Tool) else {
            return Vec::new();
        };
        let requester = &self.messages[idx];
        if !requester.requests_tools() {
            return Vec::new();
        }

        let answered: Vec<&str> = self.messages[idx + 1..]
            .iter()
            .filter_map(|m| m.tool_call_id.as_deref())
            .collect();

        requester
            .tool_calls
            .iter()
            .filter(|call| !answered.contains(&call.id.as_str()))
            .cloned()
            .collect()
    }
}

//
// ================= Classified Output =================
//

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaKind {
    Reasoning,
    Content,
    ToolCall,
}

/// One tagged segment of model output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassifiedDelta {
    Reasoning(String),
    Content(String),
    ToolCall(ToolCallRequest),
}

impl ClassifiedDelta {
    pub fn kind(&self) -> DeltaKind {
        match self {
            ClassifiedDelta::Reasoning(_) => DeltaKind::Reasoning,
            ClassifiedDelta::Content(_) => DeltaKind::Content,
            ClassifiedDelta::ToolCall(_) => DeltaKind::ToolCall,
        }
    }
}

impl fmt::Display for RiskTolerance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RiskTolerance::Conservative => "conservative",
            RiskTolerance::Moderate => "moderate",
            RiskTolerance::Aggressive => "aggressive",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_pending_tool_calls_after_partial_results() {
        let mut state = ConversationState::new("t-1");
        state.push(Message::user("price of AAPL and MSFT?", None));

        let a = ToolCallRequest::new("get_financial_product_data", json!({"symbol": "AAPL"}));
        let b = ToolCallRequest::new("get_financial_product_data", json!({"symbol": "MSFT"}));
        state.push(Message::assistant_with_calls("", vec![a.clone(), b.clone()]));
        state.push(Message::tool(a.id.clone(), a.name.clone(), "{}"));

        assert_eq!(state.pending_tool_calls(), vec![b]);
        assert!(!state.turn_complete());
        assert_eq!(state.completed_cycles(), 1);
    }

    #[test]
    fn test_retry_detection_only_for_unfinished_turns() {
        let mut state = ConversationState::new("t-2");
        state.push(Message::user("hello", Some("k1".into())));
        assert!(state.is_retry_of("k1"));
        assert!(!state.is_retry_of("k2"));

        state.push(Message::assistant("hi there"));
        assert!(!state.is_retry_of("k1"));
    }
}
