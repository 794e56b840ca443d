use std::{sync::LazyLock, time::Duration};

use async_trait::async_trait;
use regex::Regex;
use reqwest::StatusCode;
use tracing::debug;

use crate::{
    error::{PipelineError, Result},
    provider::Provider,
};

/// Shape of the structured answer requested from the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaHint {
    ModuleBoundaries,
    QuizQuestions,
}

impl SchemaHint {
    pub fn system_prompt(self) -> &'static str {
        match self {
            SchemaHint::ModuleBoundaries => MODULE_BOUNDARIES_SYSTEM_PROMPT,
            SchemaHint::QuizQuestions => QUIZ_QUESTIONS_SYSTEM_PROMPT,
        }
    }
}

static MODULE_BOUNDARIES_SYSTEM_PROMPT: &str = r#"You are a course designer. You split lecture transcripts into learning modules.

You MUST output ONLY valid JSON matching this exact structure (no markdown, no explanation):
{
  "modules": [
    {"start_ms": 0, "title": "Module title", "key_concepts": ["concept"], "confidence": 0.9}
  ]
}

Rules:
- Every entry marks where a module STARTS; use timestamps that appear in the transcript
- confidence is between 0 and 1 and says how clearly the topic changes at start_ms
- key_concepts are short noun phrases taught in the module"#;

static QUIZ_QUESTIONS_SYSTEM_PROMPT: &str = r#"You are an assessment author. You write multiple-choice questions about lecture content.

You MUST output ONLY valid JSON matching this exact structure (no markdown, no explanation):
[
  {
    "question": "What is Python's main feature?",
    "options": {"A": "Static typing", "B": "Dynamic typing", "C": "Compiled", "D": "Low-level"},
    "correct_answer": "B",
    "explanation": "Python uses dynamic typing by default"
  }
]"#;

/// Text-generation provider. Malformed answers are the caller's problem, not an error here.
#[async_trait]
pub trait LanguageModel: Send + Sync + 'static {
    async fn generate(&self, prompt: &str, schema: SchemaHint) -> Result<String>;
}

static JSON_FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*\n(.*?)\n?```").expect("valid fence pattern")
});

/// JSON payload of a provider answer: the first fenced block if any, else the outermost
/// `[...]` or `{...}` span.
pub fn extract_json(content: &str) -> Option<&str> {
    if let Some(caps) = JSON_FENCE.captures(content) {
        return caps.get(1).map(|m| m.as_str().trim());
    }

    let start = content.find(['[', '{'])?;
    let closing = if content[start..].starts_with('[') {
        ']'
    } else {
        '}'
    };
    let end = content.rfind(closing)?;
    (end > start).then(|| &content[start..=end])
}

/// OpenAI-compatible `/chat/completions` client.
pub struct ChatCompletionsClient {
    http: reqwest::Client,
    provider: Provider,
    api_key: String,
    temperature: f32,
}

impl ChatCompletionsClient {
    pub fn new(provider: Provider) -> Result<Self> {
        let api_key = provider.validate_api_key()?;
        Ok(Self {
            http: reqwest::Client::new(),
            provider,
            api_key,
            temperature: 0.2,
        })
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

#[async_trait]
impl LanguageModel for ChatCompletionsClient {
    async fn generate(&self, prompt: &str, schema: SchemaHint) -> Result<String> {
        let config = self.provider.config();
        debug!(provider = self.provider.name(), ?schema, "Sending generation request");

        let response = self
            .http
            .post(config.api_url)
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&serde_json::json!({
                "model": config.model,
                "messages": [
                    {
                        "role": "system",
                        "content": schema.system_prompt(),
                    },
                    {
                        "role": "user",
                        "content": prompt,
                    },
                ],
                "temperature": self.temperature,
            }))
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(1));
            return Err(PipelineError::RateLimitExceeded {
                provider: self.provider.name().to_string(),
                retry_after,
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::ProviderError {
                reason: format!("{} returned {}: {}", self.provider.name(), status, body),
            });
        }

        let response = response.json::<serde_json::Value>().await?;
        let content = response["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| PipelineError::ProviderError {
                reason: format!("Invalid API response: {:?}", response),
            })?;

        Ok(content.to_string())
    }
}
