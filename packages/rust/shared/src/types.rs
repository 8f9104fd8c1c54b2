//! Core domain types for ChatCorpus message corpora.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current schema version for the corpus JSON format.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A single normalized message.
///
/// `guid` is globally unique within any one collection. Kind-specific payloads
/// (text body, media descriptor, tapback info) live in [`MessageKind`], which
/// serializes as the external `messageKind` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Globally unique message identifier.
    pub guid: String,
    /// Message timestamp (UTC).
    pub date: DateTime<Utc>,
    /// Sender identity (phone number, email, or contact name).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
    /// Whether the local account sent this message.
    #[serde(default)]
    pub is_from_me: bool,
    /// Read flag.
    #[serde(default)]
    pub is_read: bool,
    /// When the message was read.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_read: Option<DateTime<Utc>>,
    /// When the message was delivered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_delivered: Option<DateTime<Utc>>,
    /// When the message was last edited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_edited: Option<DateTime<Utc>>,
    /// Reply association, if this message replies to another.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replying_to: Option<ReplyInfo>,
    /// Message-level enrichment records (e.g. link previews).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enrichments: Vec<Enrichment>,
    /// Kind-specific payload, tagged as `messageKind` in JSON.
    #[serde(flatten)]
    pub kind: MessageKind,
}

/// Kind-specific message payload.
///
/// Serialized with an external `messageKind` tag so the corpus JSON reads
/// `{"messageKind": "text", "text": "..."}` etc.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "messageKind", rename_all = "camelCase")]
pub enum MessageKind {
    /// Plain text message.
    Text {
        /// Message body.
        text: String,
    },
    /// Message carrying an attachment, with an optional caption.
    Media {
        /// Optional caption text.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        /// Attachment descriptor.
        media: MediaInfo,
    },
    /// Reaction to another message (love, like, laugh, ...).
    Tapback {
        /// Reaction details.
        tapback: TapbackInfo,
    },
    /// System notification (group rename, member joined, ...).
    Notification {
        /// Notification text, when the export carries one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
}

impl Message {
    /// Stable lowercase name of the message kind.
    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            MessageKind::Text { .. } => "text",
            MessageKind::Media { .. } => "media",
            MessageKind::Tapback { .. } => "tapback",
            MessageKind::Notification { .. } => "notification",
        }
    }

    /// Text content, if this kind carries any.
    pub fn text(&self) -> Option<&str> {
        match &self.kind {
            MessageKind::Text { text } => Some(text),
            MessageKind::Media { text, .. } | MessageKind::Notification { text } => {
                text.as_deref()
            }
            MessageKind::Tapback { .. } => None,
        }
    }

    /// Media descriptor, if this is a media message.
    pub fn media(&self) -> Option<&MediaInfo> {
        match &self.kind {
            MessageKind::Media { media, .. } => Some(media),
            _ => None,
        }
    }

    /// Mutable media descriptor, if this is a media message.
    pub fn media_mut(&mut self) -> Option<&mut MediaInfo> {
        match &mut self.kind {
            MessageKind::Media { media, .. } => Some(media),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Payload structs
// ---------------------------------------------------------------------------

/// Attachment descriptor for media messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaInfo {
    /// Stable attachment identifier from the export.
    pub id: String,
    /// Original filename.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    /// MIME type (e.g. `image/heic`, `audio/amr`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Enrichment records attached to this media item.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enrichments: Vec<Enrichment>,
}

impl MediaInfo {
    /// Whether the attachment is an image, judged by MIME type.
    pub fn is_image(&self) -> bool {
        self.mime_type
            .as_deref()
            .is_some_and(|m| m.starts_with("image/"))
    }

    /// Whether the attachment is audio, judged by MIME type.
    pub fn is_audio(&self) -> bool {
        self.mime_type
            .as_deref()
            .is_some_and(|m| m.starts_with("audio/"))
    }
}

/// Reaction details for tapback messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TapbackInfo {
    /// Reaction name: `love`, `like`, `dislike`, `laugh`, `emphasize`, `question`.
    pub action: String,
    /// Guid of the message being reacted to.
    pub target_message_guid: String,
}

/// Reply association.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyInfo {
    /// Guid of the message being replied to.
    pub target_message_guid: String,
}

/// One enrichment record produced by a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Enrichment {
    /// Enrichment kind: `image-analysis`, `audio-transcript`, `link-preview`.
    pub kind: String,
    /// Provider name.
    pub provider: String,
    /// Model identifier, where one was used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Provider schema version.
    pub version: u32,
    /// When the enrichment was produced.
    pub created_at: DateTime<Utc>,
    /// Provider-specific payload.
    pub data: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Corpus
// ---------------------------------------------------------------------------

/// The on-disk corpus JSON: a schema-versioned container of messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Corpus {
    /// Schema version for forward compatibility.
    pub schema_version: u32,
    /// Tool version that wrote this corpus.
    pub tool_version: String,
    /// When the corpus was written.
    pub generated_at: DateTime<Utc>,
    /// The normalized messages, in timeline order.
    pub messages: Vec<Message>,
}

impl Corpus {
    /// Wrap messages into a corpus stamped with the current schema version.
    pub fn new(tool_version: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            tool_version: tool_version.into(),
            generated_at: Utc::now(),
            messages,
        }
    }

    /// Validate the corpus shape: supported schema version and unique guids.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.schema_version > CURRENT_SCHEMA_VERSION {
            return Err(crate::error::ChatCorpusError::validation(format!(
                "schema_version {} not supported (max {CURRENT_SCHEMA_VERSION})",
                self.schema_version
            )));
        }
        let mut seen = std::collections::HashSet::with_capacity(self.messages.len());
        for message in &self.messages {
            if !seen.insert(message.guid.as_str()) {
                return Err(crate::error::ChatCorpusError::validation(format!(
                    "duplicate guid in corpus: {}",
                    message.guid
                )));
            }
        }
        Ok(())
    }
}
