//! Text generation providers.

use std::pin::Pin;

use async_stream::try_stream;
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use tracing::debug;

use crate::error::{Result, RetrievalError};

/// Incremental generated text.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Box a stream of text deltas.
pub(crate) fn boxed_stream<S>(stream: S) -> TextStream
where
    S: Stream<Item = Result<String>> + Send + 'static,
{
    Box::pin(stream)
}

/// A single generation call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub system_prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Trait for generation providers.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Get the name of this provider.
    fn name(&self) -> &str;

    /// Generate the full answer.
    async fn generate(&self, request: &GenerationRequest) -> Result<String>;

    /// Generate the answer as a stream of text deltas.
    async fn generate_stream(&self, request: &GenerationRequest) -> Result<TextStream>;
}

/// Generation provider for OpenAI-compatible `/chat/completions` endpoints.
pub struct OpenAIChatProvider {
    api_key: Option<String>,
    base_url: String,
    client: reqwest::Client,
    model: String,
}

impl OpenAIChatProvider {
    /// Create a new provider using `OPENAI_API_KEY`.
    pub fn new() -> Self {
        Self {
            api_key: std::env::var("OPENAI_API_KEY").ok(),
            base_url: "https://api.openai.com/v1".to_string(),
            client: reqwest::Client::new(),
            model: "gpt-4o-mini".to_string(),
        }
    }

    /// Set the API key.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Drop the API key, for endpoints that take none.
    pub fn without_api_key(mut self) -> Self {
        self.api_key = None;
        self
    }

    /// Set the base URL.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Set the model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn send(&self, request: &GenerationRequest, stream: bool) -> Result<reqwest::Response> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": request.system_prompt },
                { "role": "user", "content": request.prompt },
            ],
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "stream": stream,
        });

        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        debug!("Requesting completion from {} (stream: {stream})", self.model);
        let response = builder.send().await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(RetrievalError::Generation(format!(
                "API returned {status}: {text}"
            )));
        }
        Ok(response)
    }
}

impl Default for OpenAIChatProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait]
impl GenerationProvider for OpenAIChatProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        let response: ChatResponse = self
            .send(request, false)
            .await?
            .json()
            .await
            .map_err(|e| RetrievalError::Generation(format!("invalid response: {e}")))?;

        response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| RetrievalError::Generation("response has no content".to_string()))
    }

    async fn generate_stream(&self, request: &GenerationRequest) -> Result<TextStream> {
        let response = self.send(request, true).await?;

        let stream = try_stream! {
            let mut events = response.bytes_stream().eventsource();
            while let Some(event) = events.next().await {
                let event = event
                    .map_err(|e| RetrievalError::Generation(format!("stream error: {e}")))?;
                if event.data.trim() == "[DONE]" {
                    break;
                }

                let chunk: ChatChunk = serde_json::from_str(&event.data)
                    .map_err(|e| RetrievalError::Generation(format!("invalid stream event: {e}")))?;
                let delta = chunk
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|choice| choice.delta.content)
                    .unwrap_or_default();
                if !delta.is_empty() {
                    yield delta;
                }
            }
        };

        Ok(boxed_stream(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> GenerationRequest {
        GenerationRequest {
            prompt: "Context:\nzebras\n\nQuestion: what?\n\nAnswer:".to_string(),
            system_prompt: "Be brief.".to_string(),
            max_tokens: 64,
            temperature: 0.2,
        }
    }

    fn provider(server: &MockServer) -> OpenAIChatProvider {
        OpenAIChatProvider::new()
            .with_api_key("test-key")
            .with_base_url(format!("{}/v1/", server.uri()))
            .with_model("test-model")
    }

    #[tokio::test]
    async fn test_generate_sends_both_messages() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer test-key"))
            .and(body_partial_json(serde_json::json!({
                "model": "test-model",
                "max_tokens": 64,
                "stream": false,
                "messages": [
                    { "role": "system", "content": "Be brief." },
                    { "role": "user", "content": request().prompt },
                ],
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{ "message": { "role": "assistant", "content": "Zebras are striped." } }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let answer = provider(&server).generate(&request()).await.unwrap();
        assert_eq!(answer, "Zebras are striped.");
    }

    #[tokio::test]
    async fn test_generate_stream_yields_deltas() {
        let server = MockServer::start().await;
        let body = [
            r#"{"choices":[{"delta":{"role":"assistant"}}]}"#,
            r#"{"choices":[{"delta":{"content":"Zebras "}}]}"#,
            r#"{"choices":[{"delta":{"content":"are striped."}}]}"#,
            "[DONE]",
        ]
        .iter()
        .map(|data| format!("data: {data}\n\n"))
        .collect::<String>();

        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(serde_json::json!({ "stream": true })))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .mount(&server)
            .await;

        let stream = provider(&server).generate_stream(&request()).await.unwrap();
        let deltas: Vec<String> = stream.try_collect().await.unwrap();
        assert_eq!(deltas, vec!["Zebras ".to_string(), "are striped.".to_string()]);
    }

    #[tokio::test]
    async fn test_error_status_is_a_generation_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let result = provider(&server).generate(&request()).await;
        match result {
            Err(RetrievalError::Generation(message)) => assert!(message.contains("overloaded")),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_content_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "choices": [] })),
            )
            .mount(&server)
            .await;

        let result = provider(&server).generate(&request()).await;
        assert!(matches!(result, Err(RetrievalError::Generation(_))));
    }
}
