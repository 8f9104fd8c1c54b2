//! Enrichment providers.
//!
//! Each provider is a black box behind [`EnrichmentProvider`]: it takes a
//! message, produces an [`Enrichment`] record or fails. The orchestrator is
//! polymorphic over this trait and never inspects provider internals.

pub mod link;
pub mod openrouter;

use async_trait::async_trait;

use chatcorpus_shared::{EnrichmentSettings, Message, Result};

pub use link::LinkPreviewProvider;
pub use openrouter::{AudioTranscriptProvider, ImageAnalysisProvider};

/// Capability interface for message enrichment.
#[async_trait]
pub trait EnrichmentProvider: Send + Sync {
    /// Stable provider name, used in enrichment records and failure logs.
    fn name(&self) -> &'static str;

    /// Whether this provider applies to the given message.
    fn handles(&self, message: &Message) -> bool;

    /// Produce an enrichment record for the message. Errors are recorded by
    /// the caller and never abort a batch.
    async fn enrich(&self, message: &Message) -> Result<chatcorpus_shared::Enrichment>;
}

/// Build the providers enabled by `settings`, in invocation priority order.
///
/// `api_key` is required only when an AI-backed provider (images/audio) is
/// enabled; link previews run without one.
pub fn build_providers(
    settings: &EnrichmentSettings,
    api_key: Option<&str>,
) -> Result<Vec<Box<dyn EnrichmentProvider>>> {
    let mut providers: Vec<Box<dyn EnrichmentProvider>> = Vec::new();

    if settings.images {
        let key = require_key(api_key, "image analysis")?;
        providers.push(Box::new(ImageAnalysisProvider::new(
            key,
            settings.model_id.clone(),
        )?));
    }

    if settings.audio {
        let key = require_key(api_key, "audio transcription")?;
        providers.push(Box::new(AudioTranscriptProvider::new(
            key,
            settings.model_id.clone(),
        )?));
    }

    if settings.links {
        providers.push(Box::new(LinkPreviewProvider::new()?));
    }

    Ok(providers)
}

fn require_key<'a>(api_key: Option<&'a str>, what: &str) -> Result<&'a str> {
    api_key.filter(|k| !k.is_empty()).ok_or_else(|| {
        chatcorpus_shared::ChatCorpusError::config(format!("{what} requires an API key"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatcorpus_shared::AppConfig;

    fn settings() -> EnrichmentSettings {
        EnrichmentSettings::from_config(&AppConfig::default())
    }

    #[test]
    fn builds_all_enabled_providers() {
        let providers = build_providers(&settings(), Some("sk-test")).expect("build");
        let names: Vec<_> = providers.iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["image-analysis", "audio-transcript", "link-preview"]);
    }

    #[test]
    fn link_only_needs_no_key() {
        let mut s = settings();
        s.images = false;
        s.audio = false;
        let providers = build_providers(&s, None).expect("build");
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0].name(), "link-preview");
    }

    #[test]
    fn ai_providers_without_key_fail() {
        let err = build_providers(&settings(), None).err().expect("missing key");
        assert!(err.to_string().contains("API key"));
    }
}
