//! Gemini API client
//!
//! Streams generations from `streamGenerateContent` (SSE) and maps thought
//! parts and function calls onto [`ModelChunk`]s.
//! Uses a long-lived reqwest::Client for connection pooling.

use super::{ChatModel, ModelChunk, ModelRequest, ModelStream};
use crate::error::OrchestrationError;
use crate::models::{Message, Role, ToolCallRequest};
use crate::Result;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

const BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// Reusable Gemini client (connection-pooled)
#[derive(Clone)]
pub struct GeminiClient {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl GeminiClient {
    pub fn new(api_key: String, model: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .build()?;

        Ok(Self {
            client,
            api_key,
            model: model.into(),
            base_url: BASE_URL.to_string(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn ensure_key(&self) -> Result<()> {
        if self.api_key.trim().is_empty() {
            return Err(OrchestrationError::ModelError(
                "GEMINI_API_KEY not configured".to_string(),
            ));
        }
        Ok(())
    }

    /// One-shot generation grounded with Google Search.
    pub async fn generate_grounded(&self, prompt: &str) -> Result<String> {
        self.ensure_key()?;

        let url = format!("{}/{}:generateContent", self.base_url, self.model);
        let body = json!({
            "contents": [{ "role": "user", "parts": [{ "text": prompt }] }],
            "tools": [{ "googleSearch": {} }],
            "generationConfig": { "temperature": 0.0 },
        });

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| OrchestrationError::ModelError(format!("Gemini API error: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            error!("Gemini API error response ({}): {}", status, error_text);
            return Err(OrchestrationError::ModelError(format!(
                "Gemini API returned {}: {}",
                status, error_text
            )));
        }

        let parsed: GeminiResponse = response
            .json()
            .await
            .map_err(|e| OrchestrationError::ModelError(format!("Gemini parse error: {}", e)))?;

        let answer: String = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|content| {
                content
                    .parts
                    .into_iter()
                    .filter(|p| !p.thought)
                    .filter_map(|p| p.text)
                    .collect()
            })
            .unwrap_or_default();

        if answer.is_empty() {
            return Err(OrchestrationError::ModelError(
                "Empty response from Gemini".to_string(),
            ));
        }
        Ok(answer)
    }
}

#[async_trait]
impl ChatModel for GeminiClient {
    async fn stream(&self, request: ModelRequest) -> Result<ModelStream> {
        self.ensure_key()?;

        let url = format!(
            "{}/{}:streamGenerateContent?alt=sse",
            self.base_url, self.model
        );
        let body = build_request(&request);

        info!(model = %self.model, messages = request.messages.len(), "Calling Gemini API");

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                error!("Gemini API request failed: {}", e);
                OrchestrationError::ModelError(format!("Gemini API error: {}", e))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            error!("Gemini API error response ({}): {}", status, error_text);
            return Err(OrchestrationError::ModelError(format!(
                "Gemini API returned {}: {}",
                status, error_text
            )));
        }

        let (tx, rx) = mpsc::channel::<Result<ModelChunk>>(64);
        tokio::spawn(forward_sse(response.bytes_stream(), tx));

        Ok(ReceiverStream::new(rx).boxed())
    }
}

/// Pump an SSE body into `tx` until the body ends or the receiver is gone.
///
/// Bytes are buffered until a full line arrives, so characters split across
/// network chunks decode intact.
async fn forward_sse<S, B, E>(bytes: S, tx: mpsc::Sender<Result<ModelChunk>>)
where
    S: Stream<Item = std::result::Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    futures::pin_mut!(bytes);
    let mut buffer: Vec<u8> = Vec::new();

    loop {
        let next = tokio::select! {
            next = bytes.next() => next,
            _ = tx.closed() => {
                debug!("Gemini stream receiver dropped");
                return;
            }
        };
        let chunk = match next {
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => {
                warn!("Gemini stream interrupted: {}", e);
                let message = format!("Gemini stream interrupted: {}", e);
                let _ = tx.send(Err(OrchestrationError::ModelError(message))).await;
                return;
            }
            None => break,
        };
        buffer.extend_from_slice(chunk.as_ref());

        for line in take_lines(&mut buffer) {
            for item in parse_sse_line(&line) {
                if tx.send(item).await.is_err() {
                    debug!("Gemini stream receiver dropped");
                    return;
                }
            }
        }
    }

    let rest = String::from_utf8_lossy(&buffer);
    for item in parse_sse_line(rest.trim_end()) {
        if tx.send(item).await.is_err() {
            return;
        }
    }
}

/// Split complete lines off the front of `buffer`; a partial line stays.
fn take_lines(buffer: &mut Vec<u8>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(newline) = buffer.iter().position(|b| *b == b'\n') {
        let line: Vec<u8> = buffer.drain(..=newline).collect();
        lines.push(String::from_utf8_lossy(&line).trim_end().to_string());
    }
    lines
}

/// Decode one SSE line into model chunks.
fn parse_sse_line(line: &str) -> Vec<Result<ModelChunk>> {
    let Some(data) = line.strip_prefix("data:") else {
        return Vec::new();
    };
    let data = data.trim();
    if data.is_empty() || data == "[DONE]" {
        return Vec::new();
    }

    let response: GeminiResponse = match serde_json::from_str(data) {
        Ok(response) => response,
        Err(e) => {
            return vec![Err(OrchestrationError::ModelError(format!(
                "Gemini parse error: {}",
                e
            )))]
        }
    };

    if let Some(feedback) = response.prompt_feedback.as_ref().and_then(|f| f.block_reason.as_ref()) {
        return vec![Err(OrchestrationError::ModelError(format!(
            "Prompt blocked by Gemini: {}",
            feedback
        )))];
    }

    response
        .candidates
        .into_iter()
        .take(1)
        .filter_map(|candidate| candidate.content)
        .flat_map(|content| content.parts)
        .filter_map(|part| {
            if let Some(call) = part.function_call {
                let mut request = ToolCallRequest::new(call.name, call.args);
                if let Some(id) = call.id {
                    request.id = id;
                }
                return Some(Ok(ModelChunk::ToolCall(request)));
            }
            part.text
                .filter(|t| !t.is_empty())
                .map(|text| Ok(ModelChunk::Text {
                    text,
                    thought: part.thought,
                }))
        })
        .collect()
}

fn build_request(request: &ModelRequest) -> GeminiRequest {
    let mut contents: Vec<Content> = Vec::new();

    for message in &request.messages {
        match message.role {
            Role::User => contents.push(Content {
                role: "user",
                parts: vec![RequestPart::text(&message.content)],
            }),
            Role::Assistant => {
                let mut parts = Vec::new();
                if !message.content.is_empty() {
                    parts.push(RequestPart::text(&message.content));
                }
                for call in &message.tool_calls {
                    parts.push(RequestPart {
                        function_call: Some(FunctionCallOut {
                            name: call.name.clone(),
                            args: call.arguments.clone(),
                        }),
                        ..RequestPart::default()
                    });
                }
                if !parts.is_empty() {
                    contents.push(Content { role: "model", parts });
                }
            }
            Role::Tool => {
                let part = RequestPart {
                    function_response: Some(FunctionResponse {
                        name: message.name.clone().unwrap_or_default(),
                        response: tool_response_payload(message),
                    }),
                    ..RequestPart::default()
                };
                // Responses to one model turn travel together.
                let grouped = matches!(
                    contents.last(),
                    Some(last) if last.role == "user"
                        && last.parts.iter().all(|p| p.function_response.is_some())
                );
                if grouped {
                    if let Some(last) = contents.last_mut() {
                        last.parts.push(part);
                    }
                } else {
                    contents.push(Content {
                        role: "user",
                        parts: vec![part],
                    });
                }
            }
        }
    }

    let tools = if request.tools.is_empty() {
        Vec::new()
    } else {
        vec![ToolDeclarations {
            function_declarations: request
                .tools
                .iter()
                .map(|spec| FunctionDeclaration {
                    name: spec.name.clone(),
                    description: spec.description.clone(),
                    parameters: spec.parameters.clone(),
                })
                .collect(),
        }]
    };

    GeminiRequest {
        contents,
        system_instruction: (!request.system.is_empty()).then(|| SystemInstruction {
            parts: vec![RequestPart::text(&request.system)],
        }),
        tools,
        generation_config: GenerationConfig {
            temperature: request.temperature,
            thinking_config: ThinkingConfig {
                include_thoughts: true,
            },
        },
    }
}

fn tool_response_payload(message: &Message) -> Value {
    match serde_json::from_str::<Value>(&message.content) {
        Ok(value @ Value::Object(_)) => value,
        Ok(other) => json!({ "result": other }),
        Err(_) => json!({ "result": message.content }),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<SystemInstruction>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ToolDeclarations>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content {
    role: &'static str,
    parts: Vec<RequestPart>,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct RequestPart {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_call: Option<FunctionCallOut>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_response: Option<FunctionResponse>,
}

impl RequestPart {
    fn text(text: &str) -> Self {
        Self {
            text: Some(text.to_string()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Serialize)]
struct FunctionCallOut {
    name: String,
    args: Value,
}

#[derive(Debug, Serialize)]
struct FunctionResponse {
    name: String,
    response: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolDeclarations {
    function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Serialize)]
struct FunctionDeclaration {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Serialize)]
struct SystemInstruction {
    parts: Vec<RequestPart>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    thinking_config: ThinkingConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ThinkingConfig {
    include_thoughts: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<ResponseContent>,
}

#[derive(Debug, Deserialize)]
struct ResponseContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponsePart {
    text: Option<String>,
    #[serde(default)]
    thought: bool,
    function_call: Option<FunctionCallIn>,
}

#[derive(Debug, Deserialize)]
struct FunctionCallIn {
    id: Option<String>,
    name: String,
    #[serde(default)]
    args: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ToolSpec;

    #[test]
    fn test_request_serialization() {
        let call = ToolCallRequest::new("get_financial_product_data", json!({"symbol": "AAPL"}));
        let request = ModelRequest {
            system: "You are a careful advisor".to_string(),
            messages: vec![
                Message::user("What's AAPL trading at?", None),
                Message::assistant_with_calls("", vec![call.clone()]),
                Message::tool(call.id.clone(), call.name.clone(), r#"{"price": 190.1}"#),
            ],
            tools: vec![ToolSpec {
                name: "get_financial_product_data".to_string(),
                description: "Price lookup".to_string(),
                parameters: json!({"type": "object"}),
            }],
            temperature: Some(0.2),
        };

        let body = serde_json::to_value(build_request(&request)).unwrap();
        assert_eq!(body["contents"].as_array().unwrap().len(), 3);
        assert_eq!(body["contents"][1]["role"], "model");
        assert_eq!(body["contents"][1]["parts"][0]["functionCall"]["name"], "get_financial_product_data");
        assert_eq!(body["contents"][2]["parts"][0]["functionResponse"]["response"]["price"], 190.1);
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "You are a careful advisor");
        assert_eq!(body["generationConfig"]["thinkingConfig"]["includeThoughts"], true);
        assert_eq!(
            body["tools"][0]["functionDeclarations"][0]["name"],
            "get_financial_product_data"
        );
    }

    #[test]
    fn test_parse_sse_line_maps_thoughts_and_calls() {
        let line = r#"data: {"candidates":[{"content":{"parts":[{"text":"weighing options","thought":true},{"text":"Hello"},{"functionCall":{"name":"web_search","args":{"query":"cpi"}}}]}}]}"#;
        let chunks: Vec<ModelChunk> = parse_sse_line(line).into_iter().map(|c| c.unwrap()).collect();

        assert_eq!(chunks[0], ModelChunk::thought("weighing options"));
        assert_eq!(chunks[1], ModelChunk::text("Hello"));
        match &chunks[2] {
            ModelChunk::ToolCall(call) => {
                assert_eq!(call.name, "web_search");
                assert_eq!(call.arguments["query"], "cpi");
                assert!(call.id.starts_with("call_"));
            }
            other => panic!("unexpected chunk {:?}", other),
        }
    }

    #[test]
    fn test_parse_sse_line_ignores_non_data() {
        assert!(parse_sse_line(": keepalive").is_empty());
        assert!(parse_sse_line("").is_empty());
        assert!(parse_sse_line("data: {not json").first().unwrap().is_err());
    }

    #[test]
    fn test_take_lines_keeps_partial_tail() {
        let mut buffer = b"data: one\r\ndata: tw".to_vec();
        assert_eq!(take_lines(&mut buffer), vec!["data: one".to_string()]);
        assert_eq!(buffer, b"data: tw".to_vec());
    }

    #[tokio::test]
    async fn test_forward_sse_joins_character_split_across_chunks() {
        let line = "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Costs 5\u{20ac} today\"}]}}]}\n\n";
        let split = line.find('\u{20ac}').unwrap() + 1;
        let chunks: Vec<std::result::Result<Vec<u8>, std::io::Error>> = vec![
            Ok(line.as_bytes()[..split].to_vec()),
            Ok(line.as_bytes()[split..].to_vec()),
        ];

        let (tx, mut rx) = mpsc::channel(8);
        forward_sse(futures::stream::iter(chunks), tx).await;

        assert_eq!(rx.recv().await.unwrap().unwrap(), ModelChunk::text("Costs 5\u{20ac} today"));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_forward_sse_stops_when_receiver_dropped_on_stalled_body() {
        let stalled = futures::stream::pending::<std::result::Result<Vec<u8>, std::io::Error>>();
        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(forward_sse(stalled, tx));

        drop(rx);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("forwarder should exit once nobody is listening")
            .unwrap();
    }

    #[tokio::test]
    async fn test_stream_decodes_multibyte_text_split_by_the_server() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_request(&mut socket).await;

            let line = "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Costs 5\u{20ac} today\"}]}}]}\n\n";
            let split = line.find('\u{20ac}').unwrap() + 2;
            let (head, tail) = line.as_bytes().split_at(split);

            socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ntransfer-encoding: chunked\r\nconnection: close\r\n\r\n")
                .await
                .unwrap();
            for part in [head, tail] {
                socket.write_all(format!("{:x}\r\n", part.len()).as_bytes()).await.unwrap();
                socket.write_all(part).await.unwrap();
                socket.write_all(b"\r\n").await.unwrap();
                socket.flush().await.unwrap();
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            socket.write_all(b"0\r\n\r\n").await.unwrap();
            socket.flush().await.unwrap();
        });

        async fn read_request(socket: &mut tokio::net::TcpStream) {
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                assert!(n > 0, "client closed before sending a request");
                request.extend_from_slice(&buf[..n]);
                let Some(end) = request.windows(4).position(|w| w == b"\r\n\r\n") else {
                    continue;
                };
                let head = String::from_utf8_lossy(&request[..end]).to_lowercase();
                let length: usize = head
                    .lines()
                    .find_map(|l| l.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse().ok())
                    .unwrap_or(0);
                if request.len() >= end + 4 + length {
                    return;
                }
            }
        }

        let mut client = GeminiClient::new("key".to_string(), "gemini-2.5-flash").unwrap();
        client.base_url = format!("http://{}/v1beta/models", addr);

        let answer = client.complete(ModelRequest::default()).await.unwrap();
        assert_eq!(answer, "Costs 5\u{20ac} today");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_api_key() {
        let client = GeminiClient::new(String::new(), "gemini-2.5-flash").unwrap();
        let result = client.complete(ModelRequest::default()).await;

        assert!(result.is_err());
        let error_msg = result.unwrap_err().to_string();
        assert!(error_msg.to_lowercase().contains("api_key"));
    }
}
