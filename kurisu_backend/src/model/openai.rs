use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{Generation, ModelPort, Turn, Usage};
use crate::config::LlmSettings;
use crate::error::ModelError;
use crate::http_client::build_http_client;

/// Rough token estimate for remote APIs that expose no tokenizer.
const CHARS_PER_TOKEN: usize = 4;

/// Client for any OpenAI-compatible chat completion endpoint.
pub struct OpenAiCompatibleModel {
    settings: LlmSettings,
    client: reqwest::Client,
    loaded: AtomicBool,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [Turn],
    temperature: f32,
    top_p: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    stop: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<i64>,
    // llama.cpp server extras
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    min_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    typical_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    repeat_penalty: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Serialize)]
struct TokenizeRequest<'a> {
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct TokenizeResponse {
    tokens: Vec<serde_json::Value>,
}

impl OpenAiCompatibleModel {
    pub fn new(settings: LlmSettings) -> Result<Self> {
        let timeout = Duration::from_secs(settings.request_timeout_secs.max(1));
        let client = build_http_client(timeout)?;
        Ok(Self {
            settings,
            client,
            loaded: AtomicBool::new(false),
        })
    }

    pub fn settings(&self) -> &LlmSettings {
        &self.settings
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.settings.api_url.trim_end_matches('/'), path)
    }

    /// llama.cpp serves `/tokenize` at the root, not under `/v1`.
    fn server_root(&self) -> &str {
        let url = self.settings.api_url.trim_end_matches('/');
        url.strip_suffix("/v1").unwrap_or(url)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        // Add API key header if provided (not needed for local models)
        if self.settings.api_key.is_empty() {
            req
        } else {
            req.header("Authorization", format!("Bearer {}", self.settings.api_key))
        }
    }

    fn build_request<'a>(&'a self, turns: &'a [Turn]) -> ChatCompletionRequest<'a> {
        let local = self.settings.local;
        ChatCompletionRequest {
            model: &self.settings.model_name,
            messages: turns,
            temperature: self.settings.temperature,
            top_p: self.settings.top_p,
            max_tokens: self.settings.max_tokens,
            stop: &self.settings.stop,
            seed: self.settings.seed,
            top_k: local.then_some(self.settings.top_k),
            min_p: local.then_some(self.settings.min_p),
            typical_p: local.then_some(self.settings.typical_p),
            repeat_penalty: local.then_some(self.settings.repeat_penalty),
        }
    }
}

#[async_trait]
impl ModelPort for OpenAiCompatibleModel {
    async fn load(&self) -> bool {
        if self.is_loaded() {
            return true;
        }

        let url = self.endpoint("models");
        match self.authorize(self.client.get(&url)).send().await {
            Ok(response) if response.status().is_success() => {
                tracing::info!(
                    "Model endpoint {} is up, using model '{}' ({})",
                    self.settings.api_url,
                    self.settings.model_name,
                    self.settings.chat_format
                );
                self.loaded.store(true, Ordering::SeqCst);
                true
            }
            Ok(response) => {
                tracing::error!(
                    "Model endpoint {} answered {} while loading",
                    url,
                    response.status()
                );
                false
            }
            Err(e) => {
                tracing::error!("Unable to reach model endpoint {}: {}", url, e);
                false
            }
        }
    }

    async fn generate(&self, turns: &[Turn]) -> Result<Generation, ModelError> {
        if !self.is_loaded() {
            return Err(ModelError::NotLoaded);
        }

        let url = self.endpoint("chat/completions");
        let request = self.build_request(turns);
        let started = Instant::now();

        let response = self
            .authorize(self.client.post(&url).json(&request))
            .send()
            .await?;

        // Check for HTTP errors and include response body for debugging
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            return Err(ModelError::Api { status, body });
        }

        let completion: ChatCompletionResponse = response.json().await?;
        let elapsed = started.elapsed();

        let choice = completion
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ModelError::InvalidResponse("No choices in completion".to_string()))?;
        let content = choice.message.content.unwrap_or_default().trim().to_string();

        Ok(Generation {
            content,
            finish_reason: choice.finish_reason,
            usage: completion.usage.unwrap_or_default(),
            elapsed,
        })
    }

    fn format_prompt(&self, turns: &[Turn]) -> String {
        self.settings.chat_format.render(turns)
    }

    async fn count_tokens(&self, text: &str) -> Result<usize, ModelError> {
        if !self.settings.local {
            return Ok(estimate_tokens(text));
        }

        let url = format!("{}/tokenize", self.server_root());
        let response = self
            .client
            .post(&url)
            .json(&TokenizeRequest { content: text })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Api { status, body });
        }

        let tokenized: TokenizeResponse = response.json().await?;
        Ok(tokenized.tokens.len())
    }

    async fn close(&self) {
        if self.loaded.swap(false, Ordering::SeqCst) {
            tracing::info!("Released model '{}'", self.settings.model_name);
        }
    }
}

fn estimate_tokens(text: &str) -> usize {
    let chars = text.chars().count();
    (chars + CHARS_PER_TOKEN - 1) / CHARS_PER_TOKEN
}
