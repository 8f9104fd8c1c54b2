//! Markdown timeline rendering.
//!
//! Pure formatting over a corpus: messages are grouped by calendar day and
//! time-of-day bucket, tapbacks are folded onto the line they react to, and
//! enrichment records become inline annotations. No I/O happens here.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fmt::Write as _;

use chrono::{NaiveDate, Timelike};
use tracing::instrument;

use chatcorpus_shared::{Corpus, Enrichment, Message, MessageKind};

// ---------------------------------------------------------------------------
// Time-of-day buckets
// ---------------------------------------------------------------------------

/// Coarse time-of-day bucket for timeline sections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TimeOfDay {
    Morning,
    Afternoon,
    Evening,
    Night,
}

impl TimeOfDay {
    /// Bucket for an hour of day (0–23).
    pub fn from_hour(hour: u32) -> Self {
        match hour {
            5..=11 => Self::Morning,
            12..=16 => Self::Afternoon,
            17..=20 => Self::Evening,
            _ => Self::Night,
        }
    }

    /// Section heading label.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Morning => "Morning",
            Self::Afternoon => "Afternoon",
            Self::Evening => "Evening",
            Self::Night => "Night",
        }
    }
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

/// Render a corpus as a Markdown timeline document.
///
/// Messages are sorted by date, grouped into `## day` / `### bucket`
/// sections, and rendered one line each. Tapbacks do not get their own lines;
/// they are appended to the line of the message they react to.
#[instrument(skip_all, fields(messages = corpus.messages.len()))]
pub fn render_timeline(corpus: &Corpus, title: &str) -> String {
    let mut ordered: Vec<&Message> = corpus.messages.iter().collect();
    ordered.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.guid.cmp(&b.guid)));

    let reactions = collect_reactions(&ordered);

    // Day → bucket → lines, all in BTreeMaps for deterministic order.
    let mut days: BTreeMap<NaiveDate, BTreeMap<TimeOfDay, Vec<String>>> = BTreeMap::new();
    for message in &ordered {
        if matches!(message.kind, MessageKind::Tapback { .. }) {
            continue;
        }
        let day = message.date.date_naive();
        let bucket = TimeOfDay::from_hour(message.date.hour());
        days.entry(day)
            .or_default()
            .entry(bucket)
            .or_default()
            .push(render_line(message, &reactions));
    }

    let mut out = String::new();
    let _ = writeln!(out, "# {title}");
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "_{} messages · generated by ChatCorpus {}_",
        corpus.messages.len(),
        corpus.tool_version
    );

    for (day, buckets) in &days {
        let _ = writeln!(out);
        let _ = writeln!(out, "## {day}");
        for (bucket, lines) in buckets {
            let _ = writeln!(out);
            let _ = writeln!(out, "### {}", bucket.label());
            let _ = writeln!(out);
            for line in lines {
                let _ = writeln!(out, "{line}");
            }
        }
    }

    out
}

/// Map of target guid → reaction annotations.
fn collect_reactions(messages: &[&Message]) -> HashMap<String, Vec<String>> {
    let mut reactions: HashMap<String, Vec<String>> = HashMap::new();
    for message in messages {
        if let MessageKind::Tapback { tapback } = &message.kind {
            reactions
                .entry(tapback.target_message_guid.clone())
                .or_default()
                .push(format!(
                    "{} from {}",
                    tapback.action,
                    sender_name(message)
                ));
        }
    }
    reactions
}

/// One timeline line for a non-tapback message.
fn render_line(message: &Message, reactions: &HashMap<String, Vec<String>>) -> String {
    let time = message.date.format("%H:%M");
    let sender = sender_name(message);

    let mut line = match &message.kind {
        MessageKind::Text { text } => {
            format!("- **{sender}** ({time}): {}", text.replace('\n', " "))
        }
        MessageKind::Media { text, media } => {
            let label = media.filename.as_deref().unwrap_or(&media.id);
            let mut line = format!("- **{sender}** ({time}): 📎 {label}");
            if let Some(caption) = text.as_deref().filter(|c| !c.is_empty()) {
                let _ = write!(line, " — {}", caption.replace('\n', " "));
            }
            for enrichment in &media.enrichments {
                if let Some(summary) = enrichment_summary(enrichment) {
                    let _ = write!(line, " — _{}: {summary}_", enrichment.kind);
                }
            }
            line
        }
        MessageKind::Notification { text } => {
            format!(
                "- _{}_",
                text.as_deref().unwrap_or("system notification")
            )
        }
        // Tapbacks are folded onto their targets by the caller.
        MessageKind::Tapback { .. } => String::new(),
    };

    for enrichment in &message.enrichments {
        if let Some(summary) = enrichment_summary(enrichment) {
            let _ = write!(line, " — _{}: {summary}_", enrichment.kind);
        }
    }

    if message.replying_to.is_some() {
        line.push_str(" ↩");
    }

    if let Some(notes) = reactions.get(&message.guid) {
        let _ = write!(line, " [{}]", notes.join(", "));
    }

    line
}

/// Display name for a message sender.
fn sender_name(message: &Message) -> String {
    if message.is_from_me {
        "me".to_string()
    } else {
        message
            .handle
            .clone()
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// Short human-readable summary of an enrichment payload.
fn enrichment_summary(enrichment: &Enrichment) -> Option<String> {
    for key in ["description", "transcript", "title"] {
        if let Some(value) = enrichment.data.get(key).and_then(|v| v.as_str()) {
            if !value.is_empty() {
                return Some(value.replace('\n', " "));
            }
        }
    }
    None
}
