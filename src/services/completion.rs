use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessage,
        ChatCompletionRequestUserMessage, ChatCompletionRequestUserMessageContent,
        CreateChatCompletionRequest, Role,
    },
    Client,
};
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream};
use futures::{FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::VecDeque;

use crate::config::Config;
use crate::error::AppError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".into(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".into(), content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: "assistant".into(), content: content.into() }
    }
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    /// Ask the provider for `response_format: {type: "json_object"}`.
    pub json_response: bool,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self { model: model.into(), messages, json_response: false }
    }

    pub fn json(mut self) -> Self {
        self.json_response = true;
        self
    }

    /// Body of the streaming chat-completions POST.
    pub fn body(&self) -> Value {
        let mut body = json!({
            "model": self.model,
            "stream": true,
            "messages": self.messages,
        });
        if self.json_response {
            body["response_format"] = json!({ "type": "json_object" });
        }
        body
    }
}

/// One step of a streamed completion. `content` is cumulative: everything
/// received so far, not just the latest delta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionTick {
    pub content: String,
}

/// Anything that can answer chat completions. The stream is lazy, finite and
/// cannot be restarted; an `Err` item is always the last one.
pub trait CompletionSource: Send + Sync {
    fn stream(&self, request: ChatRequest) -> BoxStream<'static, Result<CompletionTick, AppError>>;

    /// Single non-streamed system + user exchange returning the reply text.
    fn complete(
        &self,
        model: &str,
        system: &str,
        user: &str,
    ) -> BoxFuture<'static, Result<String, AppError>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    Delta(String),
    Error(String),
    Done,
}

/// Splits a chat-completions event stream into content deltas. Bytes are
/// buffered until a full line arrives so multi-byte characters split
/// across chunks survive.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(event) = parse_line(&String::from_utf8_lossy(&line)) {
                events.push(event);
            }
        }
        events
    }

    /// Flushes a final line that was not newline-terminated.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        let rest = std::mem::take(&mut self.buffer);
        parse_line(&String::from_utf8_lossy(&rest)).into_iter().collect()
    }
}

fn parse_line(line: &str) -> Option<SseEvent> {
    let line = line.trim();
    let data = line.strip_prefix("data:")?.trim_start();
    if data == "[DONE]" {
        return Some(SseEvent::Done);
    }

    let value: Value = match serde_json::from_str(data) {
        Ok(value) => value,
        Err(e) => {
            tracing::debug!("Skipping unparseable stream line: {}", e);
            return None;
        }
    };

    if let Some(error) = value.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Some(SseEvent::Error(message));
    }

    let delta = value
        .pointer("/choices/0/delta/content")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if delta.is_empty() {
        None
    } else {
        Some(SseEvent::Delta(delta.to_string()))
    }
}

/// Talks to an OpenAI-compatible endpoint: raw SSE over reqwest for
/// streaming, async-openai for one-shot calls.
pub struct LlmClient {
    http: reqwest::Client,
    openai: Client<OpenAIConfig>,
    endpoint: String,
    api_key: String,
}

impl LlmClient {
    pub fn new(config: &Config) -> Self {
        let base = config.llm_base_url.trim_end_matches('/').to_string();
        let openai_config = OpenAIConfig::new()
            .with_api_key(config.openai_key.clone())
            .with_api_base(base.clone());

        Self {
            http: reqwest::Client::new(),
            openai: Client::with_config(openai_config),
            endpoint: format!("{}/chat/completions", base),
            api_key: config.openai_key.clone(),
        }
    }
}

struct Connect {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    body: Value,
}

impl Connect {
    async fn open(self) -> Result<Reader, AppError> {
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&self.body)
            .send()
            .await
            .map_err(|e| AppError::LlmError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|v| v.pointer("/error/message").and_then(Value::as_str).map(str::to_string))
                .unwrap_or(text);
            return Err(AppError::LlmError(format!("HTTP {}: {}", status.as_u16(), message)));
        }

        Ok(Reader {
            body: response.bytes_stream().boxed(),
            decoder: SseDecoder::default(),
            pending: VecDeque::new(),
            content: String::new(),
            body_done: false,
        })
    }
}

struct Reader {
    body: BoxStream<'static, reqwest::Result<Bytes>>,
    decoder: SseDecoder,
    pending: VecDeque<SseEvent>,
    content: String,
    body_done: bool,
}

enum StreamState {
    Connecting(Connect),
    Reading(Reader),
    Finished,
}

type Step = Option<(Result<CompletionTick, AppError>, StreamState)>;

async fn next_tick(mut reader: Reader) -> Step {
    loop {
        if let Some(event) = reader.pending.pop_front() {
            match event {
                SseEvent::Delta(text) => {
                    reader.content.push_str(&text);
                    let tick = CompletionTick { content: reader.content.clone() };
                    return Some((Ok(tick), StreamState::Reading(reader)));
                }
                SseEvent::Error(message) => {
                    tracing::warn!("Completion stream reported an error: {}", message);
                    return Some((Err(AppError::LlmError(message)), StreamState::Finished));
                }
                SseEvent::Done => return None,
            }
        }

        if reader.body_done {
            return None;
        }

        match reader.body.next().await {
            Some(Ok(chunk)) => {
                let events = reader.decoder.feed(&chunk);
                reader.pending.extend(events);
            }
            Some(Err(e)) => {
                return Some((Err(AppError::LlmError(e.to_string())), StreamState::Finished));
            }
            None => {
                reader.body_done = true;
                let events = reader.decoder.finish();
                reader.pending.extend(events);
            }
        }
    }
}

impl CompletionSource for LlmClient {
    fn stream(&self, request: ChatRequest) -> BoxStream<'static, Result<CompletionTick, AppError>> {
        tracing::debug!(
            "Streaming completion with model {} ({} messages)",
            request.model,
            request.messages.len()
        );
        let connect = Connect {
            http: self.http.clone(),
            endpoint: self.endpoint.clone(),
            api_key: self.api_key.clone(),
            body: request.body(),
        };

        stream::unfold(StreamState::Connecting(connect), |state| async move {
            match state {
                StreamState::Finished => None,
                StreamState::Connecting(connect) => match connect.open().await {
                    Ok(reader) => next_tick(reader).await,
                    Err(e) => Some((Err(e), StreamState::Finished)),
                },
                StreamState::Reading(reader) => next_tick(reader).await,
            }
        })
        .boxed()
    }

    fn complete(
        &self,
        model: &str,
        system: &str,
        user: &str,
    ) -> BoxFuture<'static, Result<String, AppError>> {
        let client = self.openai.clone();
        let messages = vec![
            ChatCompletionRequestMessage::System(ChatCompletionRequestSystemMessage {
                content: system.to_string(),
                name: None,
                role: Role::System,
            }),
            ChatCompletionRequestMessage::User(ChatCompletionRequestUserMessage {
                content: ChatCompletionRequestUserMessageContent::Text(user.to_string()),
                name: None,
                role: Role::User,
            }),
        ];
        let request = CreateChatCompletionRequest {
            model: model.to_string(),
            messages,
            temperature: Some(0.1),
            ..Default::default()
        };

        async move {
            let response = client
                .chat()
                .create(request)
                .await
                .map_err(|e| AppError::LlmError(e.to_string()))?;

            response
                .choices
                .into_iter()
                .next()
                .and_then(|choice| choice.message.content)
                .ok_or_else(|| AppError::LlmError("No content in response".into()))
        }
        .boxed()
    }
}
