// Streaming chat completions against an OpenAI compatible API.

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::config::LlmSettings;
use crate::sse::{SseDecoder, SseEvent};

const STREAM_DONE: &str = "[DONE]";

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("API key not configured: set {env} in the environment or in .env")]
    MissingApiKey { env: String },

    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("API returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("stream interrupted: {0}")]
    Stream(String),

    #[error("cannot build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A model that streams its answer chunk by chunk
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Send `messages`, hand every content chunk to `on_chunk` as it arrives
    /// and return the complete text.
    async fn stream_chat(
        &self,
        messages: &[Message],
        on_chunk: &mut (dyn for<'c> FnMut(&'c str) + Send),
    ) -> Result<String, LlmError>;
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f32,
    stream: bool,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Deserialize, Default)]
struct Delta {
    content: Option<String>,
}

/// Client for any `/chat/completions` endpoint that streams SSE
pub struct OpenAiCompatible {
    api_key: Option<String>,
    base_url: String,
    model: String,
    temperature: f32,
    client: reqwest::Client,
    api_key_env: String,
}

impl OpenAiCompatible {
    /// Build from settings, reading the key from the configured variable
    pub fn from_settings(settings: &LlmSettings) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(LlmError::Client)?;
        Ok(Self {
            api_key: std::env::var(&settings.api_key_env)
                .ok()
                .filter(|k| !k.trim().is_empty()),
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            model: settings.model.clone(),
            temperature: settings.temperature,
            client,
            api_key_env: settings.api_key_env.clone(),
        })
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

/// Append the content carried by one SSE event. Returns `false` once the
/// stream signals completion.
fn consume_event(
    event: &SseEvent,
    text: &mut String,
    on_chunk: &mut (dyn for<'c> FnMut(&'c str) + Send),
) -> bool {
    let data = event.data.trim();
    if data == STREAM_DONE {
        return false;
    }
    if data.is_empty() {
        return true;
    }

    match serde_json::from_str::<StreamChunk>(data) {
        Ok(chunk) => {
            let content = chunk
                .choices
                .into_iter()
                .next()
                .and_then(|choice| choice.delta.content);
            if let Some(content) = content.filter(|c| !c.is_empty()) {
                on_chunk(&content);
                text.push_str(&content);
            }
        }
        Err(e) => debug!("skipping unparseable stream chunk ({}): {}", e, data),
    }
    true
}

#[async_trait]
impl ChatModel for OpenAiCompatible {
    async fn stream_chat(
        &self,
        messages: &[Message],
        on_chunk: &mut (dyn for<'c> FnMut(&'c str) + Send),
    ) -> Result<String, LlmError> {
        let api_key = self.api_key.as_deref().ok_or_else(|| LlmError::MissingApiKey {
            env: self.api_key_env.clone(),
        })?;

        let url = self.endpoint();
        let request = ChatCompletionRequest {
            model: &self.model,
            messages,
            temperature: self.temperature,
            stream: true,
        };

        debug!("Streaming {} message(s) to {} ({})", messages.len(), url, self.model);

        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&request)
            .send()
            .await
            .map_err(|source| LlmError::Http {
                url: url.clone(),
                source,
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status { status, body });
        }

        let mut stream = response.bytes_stream();
        let mut decoder = SseDecoder::new();
        let mut text = String::new();

        'outer: while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(|e| LlmError::Stream(e.to_string()))?;
            for event in decoder.feed(&bytes) {
                trace!("stream event: {}", event.data);
                if !consume_event(&event, &mut text, on_chunk) {
                    break 'outer;
                }
            }
        }

        if let Some(event) = decoder.finish() {
            consume_event(&event, &mut text, on_chunk);
        }

        if text.is_empty() {
            warn!("Model {} returned an empty response", self.model);
        }
        Ok(text)
    }
}

/// Replays canned answers, one per call, in order
#[cfg(test)]
pub(crate) struct ScriptedModel {
    answers: std::sync::Mutex<std::collections::VecDeque<Result<String, String>>>,
    pub(crate) seen: std::sync::Mutex<Vec<Vec<Message>>>,
}

#[cfg(test)]
impl ScriptedModel {
    pub(crate) fn new<I, S>(answers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            answers: std::sync::Mutex::new(answers.into_iter().map(|a| Ok(a.into())).collect()),
            seen: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn failing(message: &str) -> Self {
        Self {
            answers: std::sync::Mutex::new([Err(message.to_string())].into_iter().collect()),
            seen: std::sync::Mutex::new(Vec::new()),
        }
    }
}

#[cfg(test)]
#[async_trait]
impl ChatModel for ScriptedModel {
    async fn stream_chat(
        &self,
        messages: &[Message],
        on_chunk: &mut (dyn for<'c> FnMut(&'c str) + Send),
    ) -> Result<String, LlmError> {
        self.seen.lock().unwrap().push(messages.to_vec());
        let answer = self
            .answers
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(String::new()));
        let answer = answer.map_err(LlmError::Stream)?;
        // Split on whitespace boundaries to mimic streaming
        for piece in answer.split_inclusive(' ') {
            on_chunk(piece);
        }
        Ok(answer)
    }
}
