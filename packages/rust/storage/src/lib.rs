//! Message-database ingestion (libSQL, read-only).
//!
//! [`MessageDb`] reads a `chat.db`-style dump — the `message`, `handle`,
//! `attachment` and `message_attachment_join` tables — and maps rows onto
//! normalized [`Message`] records. The dump is externally produced and never
//! written to; all access goes through a read-only connection.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use libsql::{Connection, Database, params};
use tracing::{info, warn};

use chatcorpus_shared::{
    ChatCorpusError, MediaInfo, Message, MessageKind, ReplyInfo, Result, TapbackInfo,
};

/// Offset in seconds between the Unix epoch and the Apple epoch (2001-01-01).
const APPLE_EPOCH_OFFSET_SECS: i64 = 978_307_200;

/// `associated_message_type` codes for tapbacks, in action order.
const TAPBACK_BASE_CODE: i64 = 2000;
const TAPBACK_ACTIONS: [&str; 6] = ["love", "like", "dislike", "laugh", "emphasize", "question"];

/// Result of ingesting a message-database dump.
#[derive(Debug)]
pub struct DbIngest {
    /// Successfully mapped messages, in date order.
    pub messages: Vec<Message>,
    /// Total message rows read.
    pub rows_read: usize,
    /// Rows dropped (no guid, unmappable fields).
    pub rows_skipped: usize,
}

/// Read-only handle on a message-database dump.
pub struct MessageDb {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
}

impl MessageDb {
    /// Open a message-database dump at `path`.
    ///
    /// The file must already exist: an absent input database is a fatal
    /// ingestion error, not something to create.
    pub async fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ChatCorpusError::io(
                path,
                std::io::Error::new(std::io::ErrorKind::NotFound, "message database not found"),
            ));
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| ChatCorpusError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| ChatCorpusError::Storage(e.to_string()))?;

        Ok(Self { db, conn })
    }

    /// Read every message in the dump, oldest first.
    pub async fn list_messages(&self) -> Result<DbIngest> {
        let attachments = self.load_attachments().await?;

        let mut rows = self
            .conn
            .query(
                "SELECT m.ROWID, m.guid, m.text, h.id, m.date, m.date_read, m.date_delivered,
                        m.is_from_me, m.is_read, m.associated_message_type,
                        m.associated_message_guid, m.item_type, m.thread_originator_guid
                 FROM message m
                 LEFT JOIN handle h ON h.ROWID = m.handle_id
                 ORDER BY m.date, m.ROWID",
                params![],
            )
            .await
            .map_err(|e| ChatCorpusError::Storage(e.to_string()))?;

        let mut messages = Vec::new();
        let mut rows_read = 0usize;
        let mut rows_skipped = 0usize;

        while let Ok(Some(row)) = rows.next().await {
            rows_read += 1;
            match row_to_message(&row, &attachments) {
                Ok(message) => messages.push(message),
                Err(e) => {
                    warn!(error = %e, "skipping unmappable message row");
                    rows_skipped += 1;
                }
            }
        }

        info!(
            rows_read,
            rows_skipped,
            messages = messages.len(),
            "database ingest complete"
        );

        Ok(DbIngest {
            messages,
            rows_read,
            rows_skipped,
        })
    }

    /// Load the attachment descriptor for each message. Messages with more
    /// than one attachment keep the first; the rest are logged.
    async fn load_attachments(&self) -> Result<HashMap<i64, MediaInfo>> {
        let mut rows = self
            .conn
            .query(
                "SELECT maj.message_id, a.guid, a.filename, a.mime_type
                 FROM message_attachment_join maj
                 JOIN attachment a ON a.ROWID = maj.attachment_id
                 ORDER BY maj.message_id, a.ROWID",
                params![],
            )
            .await
            .map_err(|e| ChatCorpusError::Storage(e.to_string()))?;

        let mut map: HashMap<i64, MediaInfo> = HashMap::new();
        while let Ok(Some(row)) = rows.next().await {
            let message_id: i64 = row
                .get(0)
                .map_err(|e| ChatCorpusError::Storage(e.to_string()))?;
            let guid: String = row
                .get(1)
                .map_err(|e| ChatCorpusError::Storage(e.to_string()))?;

            if map.contains_key(&message_id) {
                warn!(message_id, attachment = %guid, "extra attachment ignored");
                continue;
            }

            map.insert(
                message_id,
                MediaInfo {
                    id: guid,
                    filename: row.get::<String>(2).ok().filter(|f| !f.is_empty()),
                    mime_type: row.get::<String>(3).ok().filter(|m| !m.is_empty()),
                    enrichments: vec![],
                },
            );
        }
        Ok(map)
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn row_to_message(row: &libsql::Row, attachments: &HashMap<i64, MediaInfo>) -> Result<Message> {
    let rowid: i64 = row
        .get(0)
        .map_err(|e| ChatCorpusError::Storage(e.to_string()))?;
    let guid: String = row
        .get(1)
        .map_err(|e| ChatCorpusError::Storage(e.to_string()))?;
    if guid.is_empty() {
        return Err(ChatCorpusError::parse(format!("row {rowid} has no guid")));
    }

    let text = row.get::<String>(2).ok().filter(|t| !t.is_empty());
    let handle = row.get::<String>(3).ok().filter(|h| !h.is_empty());

    let date_raw: i64 = row
        .get(4)
        .map_err(|e| ChatCorpusError::Storage(e.to_string()))?;
    let date = apple_timestamp(date_raw).ok_or_else(|| {
        ChatCorpusError::parse(format!("row {rowid}: timestamp {date_raw} out of range"))
    })?;

    let date_read = row.get::<i64>(5).ok().filter(|&v| v != 0).and_then(apple_timestamp);
    let date_delivered = row
        .get::<i64>(6)
        .ok()
        .filter(|&v| v != 0)
        .and_then(apple_timestamp);

    let is_from_me = row.get::<i64>(7).map(|v| v != 0).unwrap_or(false);
    let is_read = row.get::<i64>(8).map(|v| v != 0).unwrap_or(false);

    let associated_type = row.get::<i64>(9).unwrap_or(0);
    let associated_guid = row.get::<String>(10).ok().filter(|g| !g.is_empty());
    let item_type = row.get::<i64>(11).unwrap_or(0);
    let reply_guid = row.get::<String>(12).ok().filter(|g| !g.is_empty());

    let kind = if let Some(action) = tapback_action(associated_type) {
        let target = associated_guid.ok_or_else(|| {
            ChatCorpusError::parse(format!("tapback row {rowid} has no target guid"))
        })?;
        MessageKind::Tapback {
            tapback: TapbackInfo {
                action: action.to_string(),
                target_message_guid: strip_part_prefix(&target).to_string(),
            },
        }
    } else if let Some(media) = attachments.get(&rowid) {
        MessageKind::Media {
            text,
            media: media.clone(),
        }
    } else if item_type != 0 {
        MessageKind::Notification { text }
    } else {
        MessageKind::Text {
            text: text.unwrap_or_default(),
        }
    };

    Ok(Message {
        guid,
        date,
        handle,
        is_from_me,
        is_read,
        date_read,
        date_delivered,
        date_edited: None,
        replying_to: reply_guid.map(|target_message_guid| ReplyInfo {
            target_message_guid,
        }),
        enrichments: vec![],
        kind,
    })
}

/// Convert an Apple-epoch timestamp to UTC.
///
/// Modern dumps store nanoseconds since 2001-01-01; older ones store seconds.
/// Values above ~10^12 are taken as nanoseconds.
fn apple_timestamp(raw: i64) -> Option<DateTime<Utc>> {
    let secs = if raw.abs() > 1_000_000_000_000 {
        raw / 1_000_000_000
    } else {
        raw
    };
    Utc.timestamp_opt(secs + APPLE_EPOCH_OFFSET_SECS, 0).single()
}

/// Tapback action name for an `associated_message_type` code.
fn tapback_action(code: i64) -> Option<&'static str> {
    let index = code.checked_sub(TAPBACK_BASE_CODE)?;
    TAPBACK_ACTIONS.get(usize::try_from(index).ok()?).copied()
}

/// Tapback targets are stored as `p:0/<guid>`; strip the part prefix.
fn strip_part_prefix(target: &str) -> &str {
    target.rsplit_once('/').map_or(target, |(_, guid)| guid)
}
