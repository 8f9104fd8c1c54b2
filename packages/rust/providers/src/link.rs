//! Link preview provider.
//!
//! Fetches the first URL found in a text message and extracts the page title
//! and meta description. Needs no API key; private and loopback hosts are
//! refused so a hostile export cannot probe the local network.

use std::net::IpAddr;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use scraper::{Html, Selector};
use tracing::debug;
use url::Url;

use chatcorpus_shared::{ChatCorpusError, Enrichment, Message, MessageKind, Result};

use crate::EnrichmentProvider;

/// User-Agent string for preview requests.
const USER_AGENT: &str = concat!("ChatCorpus/", env!("CARGO_PKG_VERSION"));

static URL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"https?://[^\s<>"']+"#).expect("valid URL pattern"));

/// Link preview provider for text messages containing URLs.
pub struct LinkPreviewProvider {
    client: Client,
    /// Allow localhost/private IPs (for integration tests with mock servers).
    allow_localhost: bool,
}

impl LinkPreviewProvider {
    /// Build the provider with a preview-tuned HTTP client.
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ChatCorpusError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            allow_localhost: false,
        })
    }

    /// Allow fetching localhost/private IPs (for integration tests).
    #[cfg(test)]
    pub fn allow_localhost(mut self) -> Self {
        self.allow_localhost = true;
        self
    }
}

#[async_trait]
impl EnrichmentProvider for LinkPreviewProvider {
    fn name(&self) -> &'static str {
        "link-preview"
    }

    fn handles(&self, message: &Message) -> bool {
        matches!(&message.kind, MessageKind::Text { text } if first_url(text).is_some())
    }

    async fn enrich(&self, message: &Message) -> Result<Enrichment> {
        let text = message
            .text()
            .ok_or_else(|| ChatCorpusError::Enrichment("message has no text".into()))?;
        let url = first_url(text)
            .ok_or_else(|| ChatCorpusError::Enrichment("message has no URL".into()))?;

        if !self.allow_localhost && is_private_target(&url) {
            return Err(ChatCorpusError::Enrichment(format!(
                "refusing to fetch private address: {url}"
            )));
        }

        debug!(%url, guid = %message.guid, "fetching link preview");

        let response = self
            .client
            .get(url.as_str())
            .send()
            .await
            .map_err(|e| ChatCorpusError::Network(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ChatCorpusError::Network(format!("{url}: HTTP {status}")));
        }

        let body = response
            .text()
            .await
            .map_err(|e| ChatCorpusError::Network(format!("{url}: body read failed: {e}")))?;

        let (title, description) = extract_preview(&body);

        Ok(Enrichment {
            kind: "link-preview".into(),
            provider: self.name().into(),
            model: None,
            version: 1,
            created_at: chrono::Utc::now(),
            data: serde_json::json!({
                "url": url.to_string(),
                "title": title,
                "description": description,
            }),
        })
    }
}

/// First parseable URL in `text`, with trailing punctuation trimmed.
fn first_url(text: &str) -> Option<Url> {
    let raw = URL_PATTERN.find(text)?.as_str();
    let trimmed = raw.trim_end_matches(['.', ',', ';', ':', ')', ']', '!', '?']);
    Url::parse(trimmed).ok()
}

/// Extract `<title>` (preferring `og:title`) and a meta description.
fn extract_preview(html: &str) -> (Option<String>, Option<String>) {
    let doc = Html::parse_document(html);

    let og_title = Selector::parse(r#"meta[property="og:title"]"#).unwrap();
    let title_sel = Selector::parse("title").unwrap();
    let title = doc
        .select(&og_title)
        .next()
        .and_then(|el| el.value().attr("content"))
        .map(str::to_string)
        .or_else(|| {
            doc.select(&title_sel)
                .next()
                .map(|el| el.text().collect::<String>())
        })
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty());

    let og_desc = Selector::parse(r#"meta[property="og:description"]"#).unwrap();
    let meta_desc = Selector::parse(r#"meta[name="description"]"#).unwrap();
    let description = doc
        .select(&og_desc)
        .next()
        .or_else(|| doc.select(&meta_desc).next())
        .and_then(|el| el.value().attr("content"))
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty());

    (title, description)
}

/// Check if a URL targets a private or loopback address.
fn is_private_target(url: &Url) -> bool {
    match url.scheme() {
        "http" | "https" => {}
        _ => return true,
    }

    if let Some(host) = url.host_str() {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return is_private_ip(&ip);
        }
        if host == "localhost" || host.ends_with(".local") || host.ends_with(".internal") {
            return true;
        }
    }

    false
}

/// Check if an IP is in a private/reserved range.
fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
    }
}
