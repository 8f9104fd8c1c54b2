//! CSV export ingestion.
//!
//! Reads a message export CSV into normalized [`Message`] records. Rows that
//! fail to parse are logged and counted, never fatal; only an unreadable file
//! aborts ingestion.

use std::path::Path;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info, warn};

use chatcorpus_shared::{
    ChatCorpusError, MediaInfo, Message, MessageKind, ReplyInfo, Result, TapbackInfo,
};

// ---------------------------------------------------------------------------
// CSV row shape
// ---------------------------------------------------------------------------

/// One raw CSV row. Every field beyond `guid` and `date` is optional so that
/// exports from different tools map onto the same header set.
#[derive(Debug, Deserialize)]
struct CsvRow {
    guid: String,
    date: String,
    #[serde(default)]
    handle: Option<String>,
    #[serde(default)]
    is_from_me: Option<bool>,
    #[serde(default)]
    is_read: Option<bool>,
    #[serde(default)]
    date_read: Option<String>,
    #[serde(default)]
    date_delivered: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    media_id: Option<String>,
    #[serde(default)]
    media_filename: Option<String>,
    #[serde(default)]
    media_mime_type: Option<String>,
    #[serde(default)]
    tapback_action: Option<String>,
    #[serde(default)]
    tapback_target: Option<String>,
    #[serde(default)]
    reply_target: Option<String>,
}

/// Result of ingesting a CSV export.
#[derive(Debug)]
pub struct CsvIngest {
    /// Successfully parsed messages, in file order.
    pub messages: Vec<Message>,
    /// Total data rows read.
    pub rows_read: usize,
    /// Rows dropped due to parse errors.
    pub rows_skipped: usize,
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Read a message export CSV at `path`.
pub fn read_csv(path: &Path) -> Result<CsvIngest> {
    let file = std::fs::File::open(path).map_err(|e| ChatCorpusError::io(path, e))?;
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(file);

    let mut messages = Vec::new();
    let mut rows_read = 0usize;
    let mut rows_skipped = 0usize;

    for (line, record) in reader.deserialize::<CsvRow>().enumerate() {
        rows_read += 1;
        let row = match record {
            Ok(row) => row,
            Err(e) => {
                warn!(line = line + 2, error = %e, "skipping malformed CSV row");
                rows_skipped += 1;
                continue;
            }
        };

        match row_to_message(row) {
            Ok(message) => messages.push(message),
            Err(e) => {
                warn!(line = line + 2, error = %e, "skipping unparseable CSV row");
                rows_skipped += 1;
            }
        }
    }

    info!(
        path = %path.display(),
        rows_read,
        rows_skipped,
        messages = messages.len(),
        "CSV ingest complete"
    );

    Ok(CsvIngest {
        messages,
        rows_read,
        rows_skipped,
    })
}

/// Map one raw row onto a normalized message.
fn row_to_message(row: CsvRow) -> Result<Message> {
    if row.guid.is_empty() {
        return Err(ChatCorpusError::parse("row has no guid"));
    }

    let date = parse_timestamp(&row.date)?;
    let date_read = row
        .date_read
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(parse_timestamp)
        .transpose()?;
    let date_delivered = row
        .date_delivered
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(parse_timestamp)
        .transpose()?;

    let text = row.text.filter(|t| !t.is_empty());

    let kind = if let Some(action) = row.tapback_action.filter(|a| !a.is_empty()) {
        let target = row.tapback_target.ok_or_else(|| {
            ChatCorpusError::parse(format!("tapback row {} has no target guid", row.guid))
        })?;
        MessageKind::Tapback {
            tapback: TapbackInfo {
                action,
                target_message_guid: target,
            },
        }
    } else if let Some(media_id) = row.media_id.filter(|id| !id.is_empty()) {
        MessageKind::Media {
            text,
            media: MediaInfo {
                id: media_id,
                filename: row.media_filename.filter(|f| !f.is_empty()),
                mime_type: row.media_mime_type.filter(|m| !m.is_empty()),
                enrichments: vec![],
            },
        }
    } else if row.kind.as_deref() == Some("notification") {
        MessageKind::Notification { text }
    } else {
        MessageKind::Text {
            text: text.unwrap_or_default(),
        }
    };

    let message = Message {
        guid: row.guid,
        date,
        handle: row.handle.filter(|h| !h.is_empty()),
        is_from_me: row.is_from_me.unwrap_or(false),
        is_read: row.is_read.unwrap_or(false),
        date_read,
        date_delivered,
        date_edited: None,
        replying_to: row
            .reply_target
            .filter(|t| !t.is_empty())
            .map(|target_message_guid| ReplyInfo {
                target_message_guid,
            }),
        enrichments: vec![],
        kind,
    };
    debug!(guid = %message.guid, kind = message.kind_name(), "parsed row");
    Ok(message)
}

/// Parse an export timestamp: RFC 3339 first, then the common space-separated
/// forms (interpreted as UTC).
fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M:%S%.f", "%m/%d/%Y %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Ok(naive.and_utc());
        }
    }
    Err(ChatCorpusError::parse(format!(
        "unrecognized timestamp: {value}"
    )))
}
