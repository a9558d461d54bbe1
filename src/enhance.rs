// Prompt enhancement - rewrites a short idea into Stable Diffusion prompts via a text model

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Prepended to the raw input when the text model could not be used
pub const FALLBACK_QUALITY_PREFIX: &str = "masterpiece, best quality, highly detailed, ";

/// Negative prompt used whenever the model does not supply one
pub const FALLBACK_NEGATIVE_PROMPT: &str = "lowres, bad anatomy, bad hands, text, error, \
missing fingers, extra digit, fewer digits, cropped, worst quality, low quality, \
normal quality, jpeg artifacts, signature, watermark, username, blurry, deformed";

/// Positive/negative prompt pair handed to the image model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptPair {
    pub positive_text: String,
    pub negative_text: String,
}

impl PromptPair {
    /// Raw input as-is with the stock negative prompt; used when no text backend is configured
    pub fn passthrough(raw: &str) -> Self {
        Self {
            positive_text: raw.to_string(),
            negative_text: FALLBACK_NEGATIVE_PROMPT.to_string(),
        }
    }

    /// Deterministic pair used when enhancement fails
    pub fn fallback(raw: &str) -> Self {
        Self {
            positive_text: format!("{}{}", FALLBACK_QUALITY_PREFIX, raw),
            negative_text: FALLBACK_NEGATIVE_PROMPT.to_string(),
        }
    }
}

/// Outcome of an enhancement attempt. Both arms carry a usable pair.
#[derive(Debug, Clone, PartialEq)]
pub enum Enhancement {
    Enhanced(PromptPair),
    Degraded(PromptPair, String),
}

impl Enhancement {
    pub fn pair(&self) -> &PromptPair {
        match self {
            Enhancement::Enhanced(pair) | Enhancement::Degraded(pair, _) => pair,
        }
    }

    pub fn into_pair(self) -> PromptPair {
        match self {
            Enhancement::Enhanced(pair) | Enhancement::Degraded(pair, _) => pair,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Enhancement::Degraded(..))
    }
}

/// Turns raw user text into a prompt pair. Implementations never fail.
#[async_trait]
pub trait PromptEnhancer: Send + Sync {
    async fn enhance(&self, raw: &str) -> Enhancement;
}

/// A text-generation service that answers one prompt with one completion
#[async_trait]
pub trait TextBackend: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;
}

#[async_trait]
impl TextBackend for gemini::GeminiClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        Ok(self.generate_text(prompt).await?)
    }
}

/// Enhancer that asks a text model for a JSON prompt pair
pub struct ModelEnhancer<B> {
    backend: B,
}

impl<B: TextBackend> ModelEnhancer<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    async fn request_pair(&self, raw: &str) -> Result<PromptPair> {
        let reply = self.backend.complete(&build_instruction(raw)).await?;
        tracing::debug!("Text model reply: {}", reply);
        parse_prompt_pair(&reply)
    }
}

#[async_trait]
impl<B: TextBackend> PromptEnhancer for ModelEnhancer<B> {
    async fn enhance(&self, raw: &str) -> Enhancement {
        match self.request_pair(raw).await {
            Ok(pair) => Enhancement::Enhanced(pair),
            Err(e) => {
                tracing::warn!("Prompt enhancement failed, using fallback: {}", e);
                Enhancement::Degraded(PromptPair::fallback(raw), e.to_string())
            }
        }
    }
}

/// Configure the Gemini-backed enhancer from the environment.
/// Returns `None` (and logs why) when enhancement is off or the client cannot be built.
pub fn enhancer_from_env(enabled: bool, text_model: &str) -> Option<Box<dyn PromptEnhancer>> {
    if !enabled {
        tracing::info!("Prompt enhancement disabled by flag");
        return None;
    }

    match gemini::GeminiClient::from_env() {
        Ok(client) => {
            let client = client.with_model(text_model);
            tracing::info!("Prompt enhancement enabled ({})", client.model());
            Some(Box::new(ModelEnhancer::new(client)))
        }
        Err(e) => {
            tracing::warn!("Prompt enhancement unavailable: {}", e);
            None
        }
    }
}

/// Instruction sent to the text model
pub fn build_instruction(raw: &str) -> String {
    format!(
        r#"You are an expert prompt engineer for Stable Diffusion image generation.

Rewrite the user's idea into a detailed, vivid image prompt. Describe the subject,
setting, lighting, composition, art style and quality keywords. Also write a
negative prompt listing things the image should avoid.

Respond with a JSON object in exactly this format:
{{
  "positive_prompt": "detailed description of the image",
  "negative_prompt": "comma separated things to avoid"
}}

Respond ONLY with the JSON object. No explanation, no markdown, no code fences.

User idea: {raw}"#
    )
}

/// Remove markdown code fences a model may wrap around its answer
pub fn strip_code_fences(text: &str) -> String {
    text.replace("```json", "")
        .replace("```JSON", "")
        .replace("```", "")
        .trim()
        .to_string()
}

#[derive(Deserialize)]
struct RawPromptPair {
    #[serde(default)]
    positive_prompt: Option<String>,
    #[serde(default)]
    negative_prompt: Option<String>,
}

/// Parse a model reply into a pair. A missing or blank positive prompt is an error.
pub fn parse_prompt_pair(reply: &str) -> Result<PromptPair> {
    let raw: RawPromptPair = serde_json::from_str(&strip_code_fences(reply))?;

    let positive_text = raw
        .positive_prompt
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .ok_or_else(|| Error::Enhancement("positive_prompt is missing or empty".into()))?;

    let negative_text = raw
        .negative_prompt
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| FALLBACK_NEGATIVE_PROMPT.to_string());

    Ok(PromptPair {
        positive_text,
        negative_text,
    })
}
