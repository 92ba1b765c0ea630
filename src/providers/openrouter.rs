//! OpenRouter provider using the OpenAI-compatible `/chat/completions` API,
//! plus the setup-time key validation and model catalog calls.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{
    check_http_response, CompletionRequest, CompletionResponse, LlmProvider, ProviderError, Role,
    UsageStats,
};

const DEFAULT_MAX_TOKENS: u32 = 1024;

// ---------------------------------------------------------------------------
// Wire types (pub for integration testing)
// ---------------------------------------------------------------------------

/// Chat completions request body.
#[doc(hidden)]
#[derive(Debug, Serialize)]
pub struct ChatRequest {
    /// Model identifier.
    pub model: String,
    /// Conversation messages.
    pub messages: Vec<ChatMessage>,
    /// Maximum completion tokens.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// A message in chat format.
#[doc(hidden)]
#[derive(Debug, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Role (`system`, `user`, `assistant`).
    pub role: String,
    /// Text content.
    pub content: Option<String>,
}

/// Chat completions response body.
///
/// OpenRouter occasionally answers 200 with an `error` object instead of
/// choices, so both are optional.
#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct ChatResponse {
    /// Response choices.
    #[serde(default)]
    pub choices: Vec<ChatChoice>,
    /// Model that served the response.
    #[serde(default)]
    pub model: Option<String>,
    /// Token usage.
    pub usage: Option<ChatUsage>,
    /// Embedded API error.
    pub error: Option<ApiError>,
}

/// A response choice.
#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct ChatChoice {
    /// Assistant message for this choice.
    pub message: ChatMessage,
}

/// Usage statistics.
#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct ChatUsage {
    /// Prompt token count.
    pub prompt_tokens: Option<u32>,
    /// Completion token count.
    pub completion_tokens: Option<u32>,
}

/// Error object embedded in a response body.
#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct ApiError {
    /// Numeric error code, usually mirroring an HTTP status.
    pub code: Option<u16>,
    /// Human-readable message.
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Deserialize)]
struct ModelCatalog {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: Option<String>,
}

// ---------------------------------------------------------------------------
// Request / Response builders (pub for integration testing)
// ---------------------------------------------------------------------------

/// Build a chat completions request from a completion request.
#[doc(hidden)]
pub fn build_request(model: &str, request: &CompletionRequest) -> ChatRequest {
    let mut messages = Vec::with_capacity(request.messages.len().saturating_add(1));

    if let Some(system) = &request.system {
        messages.push(ChatMessage {
            role: "system".to_owned(),
            content: Some(system.clone()),
        });
    }

    for msg in &request.messages {
        messages.push(ChatMessage {
            role: role_name(msg.role).to_owned(),
            content: Some(msg.content.clone()),
        });
    }

    ChatRequest {
        model: model.to_owned(),
        messages,
        max_tokens: Some(request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)),
    }
}

/// Parse a chat completions response body.
///
/// # Errors
///
/// Returns `ProviderError::HttpStatus` for an embedded error object and
/// `ProviderError::Parse` when no usable choice is present.
#[doc(hidden)]
pub fn parse_response(body: &str) -> Result<CompletionResponse, ProviderError> {
    let resp: ChatResponse =
        serde_json::from_str(body).map_err(|e| ProviderError::Parse(e.to_string()))?;

    if let Some(err) = resp.error {
        return Err(ProviderError::HttpStatus {
            status: err.code.unwrap_or(500),
            body: super::sanitize_http_error_body(&err.message),
        });
    }

    let text = resp
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .ok_or_else(|| ProviderError::Parse("missing choices[0].message.content".to_owned()))?;

    let usage = UsageStats {
        input_tokens: resp
            .usage
            .as_ref()
            .and_then(|u| u.prompt_tokens)
            .unwrap_or(0),
        output_tokens: resp
            .usage
            .as_ref()
            .and_then(|u| u.completion_tokens)
            .unwrap_or(0),
    };

    Ok(CompletionResponse {
        text,
        usage,
        model: resp.model.unwrap_or_default(),
    })
}

/// Extract model ids from a `/models` response body.
///
/// # Errors
///
/// Returns `ProviderError::Parse` if the body is not a catalog document.
#[doc(hidden)]
pub fn parse_model_catalog(body: &str) -> Result<Vec<String>, ProviderError> {
    let catalog: ModelCatalog =
        serde_json::from_str(body).map_err(|e| ProviderError::Parse(e.to_string()))?;
    Ok(catalog
        .data
        .into_iter()
        .filter_map(|entry| entry.id)
        .filter(|id| !id.is_empty())
        .collect())
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}/{path}", base_url.trim_end_matches('/'))
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

/// OpenRouter chat completions provider.
#[derive(Clone)]
pub struct OpenRouterProvider {
    base_url: String,
    model: String,
    api_key: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for OpenRouterProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenRouterProvider")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

impl OpenRouterProvider {
    /// Create a provider for `model` against `base_url`.
    pub fn new(base_url: String, model: String, api_key: String) -> Self {
        Self {
            base_url,
            model,
            api_key,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl LlmProvider for OpenRouterProvider {
    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        let api_request = build_request(&self.model, &request);

        let response = self
            .client
            .post(endpoint(&self.base_url, "chat/completions"))
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {}", self.api_key))
            .json(&api_request)
            .send()
            .await?;

        let payload = check_http_response(response).await?;
        parse_response(&payload)
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

// ---------------------------------------------------------------------------
// Setup-time API
// ---------------------------------------------------------------------------

/// Key validation and model catalog calls used by the setup wizard.
#[derive(Debug, Clone)]
pub struct OpenRouterApi {
    base_url: String,
    client: reqwest::Client,
}

impl OpenRouterApi {
    /// Create an API handle with a per-request timeout.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::Request` if the HTTP client cannot be built.
    pub fn new(base_url: String, timeout: std::time::Duration) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { base_url, client })
    }

    /// Check a key against `/auth/key`. Any failure counts as invalid.
    pub async fn validate_key(&self, api_key: &str) -> bool {
        if api_key.trim().is_empty() {
            return false;
        }
        let result = self
            .client
            .get(endpoint(&self.base_url, "auth/key"))
            .header("authorization", format!("Bearer {api_key}"))
            .send()
            .await;
        match result {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                warn!(error = %e, "API key validation request failed");
                false
            }
        }
    }

    /// Fetch the remote model catalog.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] on transport failure, non-2xx status, or a
    /// malformed body.
    pub async fn fetch_models(&self, api_key: &str) -> Result<Vec<String>, ProviderError> {
        let response = self
            .client
            .get(endpoint(&self.base_url, "models"))
            .header("authorization", format!("Bearer {api_key}"))
            .send()
            .await?;
        let body = check_http_response(response).await?;
        parse_model_catalog(&body)
    }

    /// Fetch the catalog, falling back to `fallback` on failure or an empty list.
    pub async fn list_models(&self, api_key: &str, fallback: &[String]) -> Vec<String> {
        match self.fetch_models(api_key).await {
            Ok(models) if !models.is_empty() => {
                debug!(count = models.len(), "fetched model catalog");
                models
            }
            Ok(_) => {
                warn!("no models returned from API, using fallback list");
                fallback.to_vec()
            }
            Err(e) => {
                warn!(error = %e, "could not fetch models, using fallback list");
                fallback.to_vec()
            }
        }
    }
}
