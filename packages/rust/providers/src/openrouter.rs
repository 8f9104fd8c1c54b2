//! OpenRouter-backed AI providers: image analysis and audio transcription.
//!
//! Both speak the OpenRouter chat-completion JSON protocol and differ only in
//! which attachments they claim and how they prompt. Requests describe the
//! attachment (filename, MIME type, caption); shipping the media bytes
//! themselves is out of scope here.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use chatcorpus_shared::{ChatCorpusError, Enrichment, MediaInfo, Message, Result};

use crate::EnrichmentProvider;

/// Production API base.
const OPENROUTER_BASE: &str = "https://openrouter.ai/api/v1";

/// Per-request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

// ---------------------------------------------------------------------------
// Shared client
// ---------------------------------------------------------------------------

/// Thin chat-completion client shared by the AI providers.
struct OpenRouterClient {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenRouterClient {
    fn new(api_key: &str, model: String) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("ChatCorpus/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ChatCorpusError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_key: api_key.to_string(),
            model,
            base_url: OPENROUTER_BASE.to_string(),
        })
    }

    /// Point the client at a different API base (for integration tests).
    #[cfg(test)]
    fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ChatCorpusError::Network(format!("openrouter: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ChatCorpusError::Enrichment(format!(
                "openrouter HTTP {status}: {}",
                &detail[..detail.len().min(200)]
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ChatCorpusError::Enrichment(format!("invalid openrouter response: {e}")))?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| ChatCorpusError::Enrichment("openrouter returned no choices".into()))
    }
}

/// Describe an attachment for prompting.
fn describe_media(media: &MediaInfo, caption: Option<&str>) -> String {
    let mut parts = vec![format!("attachment id {}", media.id)];
    if let Some(filename) = &media.filename {
        parts.push(format!("filename {filename}"));
    }
    if let Some(mime) = &media.mime_type {
        parts.push(format!("type {mime}"));
    }
    if let Some(caption) = caption.filter(|c| !c.is_empty()) {
        parts.push(format!("caption {caption:?}"));
    }
    parts.join(", ")
}

fn media_caption(message: &Message) -> Option<&str> {
    match &message.kind {
        chatcorpus_shared::MessageKind::Media { text, .. } => text.as_deref(),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Image analysis
// ---------------------------------------------------------------------------

/// Image description provider.
pub struct ImageAnalysisProvider {
    client: OpenRouterClient,
}

impl ImageAnalysisProvider {
    /// Build the provider for the given API key and model.
    pub fn new(api_key: &str, model: String) -> Result<Self> {
        Ok(Self {
            client: OpenRouterClient::new(api_key, model)?,
        })
    }

    #[cfg(test)]
    fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.client = self.client.with_base_url(base_url);
        self
    }
}

#[async_trait]
impl EnrichmentProvider for ImageAnalysisProvider {
    fn name(&self) -> &'static str {
        "image-analysis"
    }

    fn handles(&self, message: &Message) -> bool {
        message.media().is_some_and(MediaInfo::is_image)
    }

    async fn enrich(&self, message: &Message) -> Result<Enrichment> {
        let media = message
            .media()
            .ok_or_else(|| ChatCorpusError::Enrichment("message has no media".into()))?;

        debug!(guid = %message.guid, media = %media.id, "analyzing image");

        let prompt = format!(
            "Describe the image attached to a personal message in one or two sentences. \
             Known details: {}.",
            describe_media(media, media_caption(message))
        );
        let description = self.client.complete(&prompt).await?;

        Ok(Enrichment {
            kind: "image-analysis".into(),
            provider: self.name().into(),
            model: Some(self.client.model.clone()),
            version: 1,
            created_at: chrono::Utc::now(),
            data: serde_json::json!({ "description": description }),
        })
    }
}

// ---------------------------------------------------------------------------
// Audio transcription
// ---------------------------------------------------------------------------

/// Audio transcript provider.
pub struct AudioTranscriptProvider {
    client: OpenRouterClient,
}

impl AudioTranscriptProvider {
    /// Build the provider for the given API key and model.
    pub fn new(api_key: &str, model: String) -> Result<Self> {
        Ok(Self {
            client: OpenRouterClient::new(api_key, model)?,
        })
    }

    #[cfg(test)]
    fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.client = self.client.with_base_url(base_url);
        self
    }
}

#[async_trait]
impl EnrichmentProvider for AudioTranscriptProvider {
    fn name(&self) -> &'static str {
        "audio-transcript"
    }

    fn handles(&self, message: &Message) -> bool {
        message.media().is_some_and(MediaInfo::is_audio)
    }

    async fn enrich(&self, message: &Message) -> Result<Enrichment> {
        let media = message
            .media()
            .ok_or_else(|| ChatCorpusError::Enrichment("message has no media".into()))?;

        debug!(guid = %message.guid, media = %media.id, "transcribing audio");

        let prompt = format!(
            "Transcribe the voice message attachment. Known details: {}.",
            describe_media(media, media_caption(message))
        );
        let transcript = self.client.complete(&prompt).await?;

        Ok(Enrichment {
            kind: "audio-transcript".into(),
            provider: self.name().into(),
            model: Some(self.client.model.clone()),
            version: 1,
            created_at: chrono::Utc::now(),
            data: serde_json::json!({ "transcript": transcript }),
        })
    }
}
