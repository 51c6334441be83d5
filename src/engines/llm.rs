//! Vision LLM OCR engine, using any OpenAI-compatible chat API.

use std::sync::Arc;

use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{CreateChatCompletionResponse, FinishReason},
};
use keen_retry::ExponentialJitter;
use leaky_bucket::RateLimiter;
use schemars::JsonSchema;
use serde_json::json;
use tokio::time::Instant;

use crate::{
    async_utils::spawn_blocking_propagating_panics,
    errors::RecognitionError,
    page::Page,
    prelude::*,
    rate_limit::RateLimit,
    recognition::TextBlock,
    retry::{
        self, EngineRetryResult, IsKnownTransient, retry_result_ok, try_fatal,
        try_potentially_transient,
    },
};

use super::{CommonEngineSettings, EngineAdapter, EngineCapability, EngineKind, Fitness};

/// The instructions we send when the configuration doesn't supply any.
const DEFAULT_PROMPT: &str = "\
Transcribe all of the text on this page exactly as written, including \
handwriting. Preserve line breaks and reading order. Use tabs between table \
cells. Do not describe the page, summarize it, or add commentary. If there is \
no text, reply with nothing.";

/// Vision models read handwriting well, and are respectable at everything
/// else.
const DEFAULT_FITNESS: Fitness = Fitness {
    printed: 0.6,
    handwritten: 0.9,
    mixed: 0.8,
    structured: 0.5,
};

/// Settings for [`VisionLlmAdapter`].
#[derive(Clone, Debug, Deserialize, JsonSchema)]
pub struct VisionLlmSettings {
    #[serde(flatten)]
    pub common: CommonEngineSettings,

    /// The model to use, as named by the API server.
    pub model: String,

    /// Replacement transcription instructions.
    #[serde(default)]
    pub prompt: Option<String>,

    /// Maximum request rate, such as `"60/m"`.
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub rate_limit: Option<RateLimit>,

    /// Maximum number of tokens to generate per page.
    #[serde(default)]
    pub max_completion_tokens: Option<u32>,
}

/// Create an OpenAI-compatible client, configured from `OPENAI_API_KEY` and
/// `OPENAI_API_BASE`.
fn create_llm_client() -> Client<OpenAIConfig> {
    let mut client_config = OpenAIConfig::new();
    if let Ok(api_key) = std::env::var("OPENAI_API_KEY") {
        client_config = client_config.with_api_key(api_key);
    }
    if let Ok(api_base) = std::env::var("OPENAI_API_BASE") {
        client_config = client_config.with_api_base(api_base);
    }
    Client::with_config(client_config)
}

/// Transcribes pages by sending them to a vision-capable chat model.
pub struct VisionLlmAdapter {
    name: String,
    capability: EngineCapability,
    client: Client<OpenAIConfig>,
    model: String,
    prompt: String,
    max_completion_tokens: Option<u32>,
    rate_limiter: Option<RateLimiter>,
}

impl VisionLlmAdapter {
    /// Create a new adapter.
    pub fn new(settings: &VisionLlmSettings) -> Result<Self> {
        if settings.model.trim().is_empty() {
            return Err(RecognitionError::InvalidConfig(
                "vision_llm engines need a `model`".to_owned(),
            )
            .into());
        }
        Ok(Self {
            name: settings.common.name_or("vision_llm"),
            capability: EngineCapability::from_settings(
                &settings.common,
                5.0,
                DEFAULT_FITNESS,
                true,
            ),
            client: create_llm_client(),
            model: settings.model.clone(),
            prompt: settings
                .prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_PROMPT.to_owned()),
            max_completion_tokens: settings.max_completion_tokens,
            rate_limiter: settings.rate_limit.as_ref().map(RateLimit::to_rate_limiter),
        })
    }

    /// Build our chat request for a page.
    fn build_request(&self, page_data_url: &str) -> Value {
        let mut request = json!({
            "model": self.model,
            "store": false,
            "messages": [
                {
                    "role": "system",
                    "content": self.prompt,
                },
                {
                    "role": "user",
                    "content": [
                        { "type": "text", "text": "Transcribe this page." },
                        { "type": "image_url", "image_url": { "url": page_data_url } },
                    ],
                },
            ],
        });
        if let Some(max_completion_tokens) = self.max_completion_tokens {
            request["max_completion_tokens"] = json!(max_completion_tokens);
        }
        request
    }

    /// Make a single request.
    async fn attempt(&self, request: &Value) -> EngineRetryResult<String> {
        if let Some(rate_limiter) = &self.rate_limiter {
            rate_limiter.acquire_one().await;
        }
        let chat_result: Value =
            try_potentially_transient!(self.client.chat().create_byot(request).await);
        trace!(%chat_result, "Chat response");
        let transcript = try_fatal!(parse_response(&self.name, chat_result));
        retry_result_ok(transcript)
    }
}

#[async_trait]
impl EngineAdapter for VisionLlmAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> EngineKind {
        EngineKind::Handwritten
    }

    fn capability(&self) -> &EngineCapability {
        &self.capability
    }

    #[instrument(level = "debug", skip_all, fields(engine = %self.name, page = page.index))]
    async fn recognize(&self, page: Arc<Page>, _deadline: Instant) -> Result<Vec<TextBlock>> {
        let region = page.full_page_box();
        let page_data_url = spawn_blocking_propagating_panics(move || page.to_data_url()).await?;
        let request = self.build_request(&page_data_url);

        // We don't watch the deadline here. If it passes, the orchestrator
        // drops this future, which cancels any pending retry.
        let resolved = self
            .attempt(&request)
            .await
            .retry_with_async(|_| async { self.attempt(&request).await })
            .with_exponential_jitter(|| ExponentialJitter::FromBackoffRange {
                backoff_range_millis: 100..=10_000,
                re_attempts: 4,
                jitter_ratio: 0.2,
            })
            .await;
        let transcript = retry::resolved_to_result(&self.name, resolved)?;

        // Models don't report confidence, so the scorer falls back to its
        // baseline.
        Ok(vec![TextBlock {
            text: transcript,
            region,
            confidence: None,
        }])
    }
}

/// Extract the transcript from a chat completion response.
fn parse_response(engine: &str, chat_result: Value) -> Result<String> {
    let response = serde_json::from_value::<CreateChatCompletionResponse>(chat_result)
        .context("Error parsing OpenAI response")?;
    let choice = response
        .choices
        .first()
        .ok_or_else(|| anyhow!("No choices in OpenAI response"))?;
    if choice.finish_reason == Some(FinishReason::ContentFilter) {
        return Err(RecognitionError::UnsupportedPage {
            engine: engine.to_owned(),
            reason: "content filter triggered".to_owned(),
        }
        .into());
    }
    let content = choice.message.content.as_deref().unwrap_or_default();
    Ok(strip_code_fences(content).to_owned())
}

/// Models sometimes wrap their whole answer in a Markdown code block, even
/// when told not to.
fn strip_code_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let Some(inner) = rest.strip_suffix("```") else {
        return trimmed;
    };
    // Skip the info string (`text`, `markdown`, ...) on the opening line.
    match inner.split_once('\n') {
        Some((_, body)) => body.trim(),
        None => inner.trim(),
    }
}
