//! OpenRouter adapter: chat completions and the model listing.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use serde::{Deserialize, Serialize};

use super::error::{ErrorContext, ProviderError};
use super::types::*;
use super::{CatalogSource, GenerationClient};

// =============================================================================
// OPENROUTER ADAPTER
// =============================================================================

/// Maximum allowed response content length (1MB).
const MAX_RESPONSE_LEN: usize = 1_024 * 1_024;

/// Maximum allowed input characters (~125k tokens).
const MAX_INPUT_CHARS: usize = 500_000;

/// Used when a 429 carries no usable Retry-After header.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(20);

const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// OpenRouter API adapter.
#[derive(Debug, Clone)]
pub struct OpenRouterAdapter {
    client: reqwest::Client,
    base_url: String,
}

impl OpenRouterAdapter {
    /// Create from API key.
    pub fn new(api_key: impl Into<String>) -> Result<Self, ProviderError> {
        Self::with_config(api_key, DEFAULT_BASE_URL, Duration::from_secs(120), None, None)
    }

    /// Create from environment variable.
    pub fn from_env() -> Result<Self, ProviderError> {
        let api_key = std::env::var("OPENROUTER_API_KEY")
            .map_err(|_| ProviderError::config("OPENROUTER_API_KEY not set"))?;

        let base_url =
            std::env::var("OPENROUTER_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.into());

        let timeout = std::env::var("OPENROUTER_TIMEOUT_SECONDS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(120));

        let referer = std::env::var("OPENROUTER_REFERER").ok();
        let app_title = std::env::var("OPENROUTER_APP_TITLE").ok();

        Self::with_config(api_key, base_url, timeout, referer, app_title)
    }

    /// Create with custom configuration.
    pub fn with_config(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        timeout: Duration,
        referer: Option<String>,
        app_title: Option<String>,
    ) -> Result<Self, ProviderError> {
        let api_key = api_key.into();
        let base_url = base_url.into().trim_end_matches('/').to_string();

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let auth_value = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|_| ProviderError::config("Invalid API key format"))?;
        headers.insert(AUTHORIZATION, auth_value);

        if let Some(ref r) = referer {
            if let Ok(v) = HeaderValue::from_str(r) {
                headers.insert("HTTP-Referer", v);
            }
        }

        if let Some(ref t) = app_title {
            if let Ok(v) = HeaderValue::from_str(t) {
                headers.insert("X-Title", v);
            }
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .gzip(true)
            .build()
            .map_err(|e| ProviderError::config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self { client, base_url })
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn models_url(&self) -> String {
        format!("{}/models", self.base_url)
    }

    /// Extract request ID from response headers.
    fn extract_request_id(headers: &HeaderMap) -> Option<String> {
        headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    }

    fn extract_retry_after(headers: &HeaderMap) -> Option<Duration> {
        headers
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    }

    /// Check if message indicates a refusal.
    fn is_refusal(msg: &str) -> bool {
        let l = msg.trim_start().to_lowercase();
        let first_line = l.lines().next().unwrap_or("");

        const PREFIXES: &[&str] = &[
            "i cannot",
            "i can't",
            "i won't",
            "i will not",
            "i am unable to",
            "i'm unable to",
            "unable to comply",
            "unable to assist",
        ];

        PREFIXES.iter().any(|p| first_line.starts_with(p)) || l.contains("request was refused")
    }

    /// Read the body with a hard size cap.
    async fn read_capped(mut response: reqwest::Response) -> Result<String, ProviderError> {
        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            let new_len = bytes.len() + chunk.len();
            if new_len > MAX_RESPONSE_LEN {
                return Err(ProviderError::provider(
                    "openrouter",
                    format!("Response too large: {new_len} bytes"),
                    false,
                ));
            }
            bytes.extend_from_slice(&chunk);
        }
        Ok(String::from_utf8_lossy(&bytes).to_string())
    }

    /// Map a non-2xx status into the gateway taxonomy.
    fn classify_status(status: u16, body: &str, headers: &HeaderMap) -> ProviderError {
        let mut ctx = ErrorContext::new().with_status(status);
        if let Some(id) = Self::extract_request_id(headers) {
            ctx = ctx.with_request_id(id);
        }

        let mut message = format!("HTTP {status}");
        if let Ok(parsed) = serde_json::from_str::<ChatApiResponse>(body) {
            if let Some(error) = parsed.error {
                match error.code {
                    Some(serde_json::Value::String(code)) => ctx = ctx.with_code(code),
                    Some(code) => ctx = ctx.with_code(code.to_string()),
                    None => {}
                }
                if let Some(m) = error.message.filter(|m| !m.is_empty()) {
                    message = m;
                }
            }
        }

        match status {
            429 => ProviderError::rate_limited(
                Self::extract_retry_after(headers).unwrap_or(DEFAULT_RETRY_AFTER),
                ctx,
            ),
            401 | 403 => ProviderError::auth(message, ctx),
            _ => ProviderError::provider_with_context("openrouter", message, status >= 500, ctx),
        }
    }

    /// Full chat completion with usage metadata.
    pub async fn chat(
        &self,
        backend_id: &str,
        payload: &PromptPayload,
        options: &SendOptions,
    ) -> Result<ChatResponse, ProviderError> {
        let total_chars = payload.char_len();
        if total_chars > MAX_INPUT_CHARS {
            return Err(ProviderError::invalid_request(format!(
                "Input too large: {total_chars} chars (max {MAX_INPUT_CHARS})"
            )));
        }

        let start = Instant::now();
        let messages: Vec<ApiMessage> = payload.messages.iter().map(ApiMessage::from).collect();

        let api_req = ChatApiRequest {
            model: backend_id,
            messages: &messages,
            temperature: options.temperature,
            max_tokens: options.max_output_tokens,
            response_format: payload.json_mode.then_some(ResponseFormat {
                format_type: "json_object",
            }),
        };

        let response = self
            .client
            .post(self.chat_url())
            .timeout(options.timeout)
            .json(&api_req)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(options.timeout)
                } else {
                    ProviderError::Http(e)
                }
            })?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = Self::read_capped(response).await?;

        if !status.is_success() {
            return Err(Self::classify_status(status.as_u16(), &body, &headers));
        }

        let parsed: ChatApiResponse = serde_json::from_str(&body).map_err(|e| {
            ProviderError::provider("openrouter", format!("Invalid JSON: {e}"), true)
        })?;

        // OpenRouter sometimes reports upstream failures inside a 200.
        if let Some(error) = parsed.error {
            let message = error.message.unwrap_or_default();
            if error.code.as_ref().and_then(|c| c.as_u64()) == Some(429) {
                return Err(ProviderError::rate_limited(
                    DEFAULT_RETRY_AFTER,
                    ErrorContext::new().with_status(429),
                ));
            }
            return Err(ProviderError::provider("openrouter", message, true));
        }

        let choice = parsed
            .choices
            .and_then(|c| c.into_iter().next())
            .ok_or_else(|| ProviderError::empty("No choices in response"))?;

        let content = choice
            .message
            .map(|m| {
                let content = m.content.unwrap_or_default();
                if !content.trim().is_empty() {
                    return content;
                }

                // Some providers emit structured output via tool calls even when
                // response_format=json_object is requested. Fall back to tool call args.
                m.tool_calls
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|tc| tc.function.and_then(|f| f.arguments))
                    .find(|s| !s.trim().is_empty())
                    .unwrap_or_default()
            })
            .unwrap_or_default();

        if content.trim().is_empty() {
            return Err(ProviderError::empty(format!(
                "backend {backend_id} returned no content"
            )));
        }

        if Self::is_refusal(&content) {
            return Err(ProviderError::empty(format!(
                "backend {backend_id} refused: {}",
                content.lines().next().unwrap_or_default()
            )));
        }

        let usage = parsed.usage.unwrap_or_default();

        Ok(ChatResponse {
            content,
            input_tokens: usage.prompt_tokens.unwrap_or(0),
            output_tokens: usage.completion_tokens.unwrap_or(0),
            latency: start.elapsed(),
            finish_reason: FinishReason::from(choice.finish_reason),
        })
    }
}

// =============================================================================
// API TYPES
// =============================================================================

#[derive(Serialize)]
struct ChatApiRequest<'a> {
    model: &'a str,
    messages: &'a [ApiMessage],
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct ApiMessage {
    role: &'static str,
    content: String,
}

impl From<&Message> for ApiMessage {
    fn from(m: &Message) -> Self {
        Self {
            role: match m.role {
                ChatRole::System => "system",
                ChatRole::User => "user",
                ChatRole::Assistant => "assistant",
            },
            content: m.content.clone(),
        }
    }
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Deserialize)]
struct ChatApiResponse {
    choices: Option<Vec<Choice>>,
    usage: Option<Usage>,
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Deserialize)]
struct ToolCall {
    function: Option<ToolFunction>,
}

#[derive(Deserialize)]
struct ToolFunction {
    arguments: Option<String>,
}

#[derive(Deserialize, Default)]
struct Usage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct ApiError {
    message: Option<String>,
    /// OpenRouter sends both numeric and string codes.
    code: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct ModelsApiResponse {
    data: Vec<ModelListing>,
}

// =============================================================================
// TRAIT IMPLS
// =============================================================================

#[async_trait]
impl GenerationClient for OpenRouterAdapter {
    async fn send(
        &self,
        backend_id: &str,
        payload: &PromptPayload,
        options: &SendOptions,
    ) -> Result<String, ProviderError> {
        self.chat(backend_id, payload, options)
            .await
            .map(|resp| resp.content)
    }
}

#[async_trait]
impl CatalogSource for OpenRouterAdapter {
    async fn list_backends(&self) -> Result<Vec<ModelListing>, ProviderError> {
        let response = self.client.get(self.models_url()).send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        // The listing runs to hundreds of entries; it is exempt from the chat body cap.
        let body = response.text().await?;

        if !status.is_success() {
            return Err(Self::classify_status(status.as_u16(), &body, &headers));
        }

        let parsed: ModelsApiResponse = serde_json::from_str(&body).map_err(|e| {
            ProviderError::provider("openrouter", format!("Invalid model listing: {e}"), false)
        })?;
        Ok(parsed.data)
    }
}
