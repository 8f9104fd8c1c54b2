//! Content reconciliation: merge two independently-ingested message sets.
//!
//! The primary set (usually CSV-derived) carries the working copy of each
//! message; the authoritative set (usually database-derived) wins on identity
//! and timing fields. Matching runs in two passes — exact guid, then content
//! equivalence — and every input message is accounted for exactly once in the
//! output.

use std::collections::HashMap;

use tracing::{debug, info, instrument};

use chatcorpus_shared::{Message, MessageKind};

// ---------------------------------------------------------------------------
// Stats & outcome
// ---------------------------------------------------------------------------

/// Counters describing one reconciliation run.
///
/// Invariant: `output_count == exact_matches + content_matches + no_matches
/// + (db_count - exact_matches - content_matches)` — no message from either
/// input is dropped or duplicated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Messages in the primary input.
    pub csv_count: usize,
    /// Messages in the authoritative input.
    pub db_count: usize,
    /// Messages in the merged output.
    pub output_count: usize,
    /// Primary messages paired by identical guid.
    pub exact_matches: usize,
    /// Primary messages paired by content equivalence.
    pub content_matches: usize,
    /// Primary messages passed through unmatched.
    pub no_matches: usize,
}

/// Result of [`reconcile`].
#[derive(Debug)]
pub struct MergeOutcome {
    /// Merged messages, sorted by guid.
    pub messages: Vec<Message>,
    /// Run counters.
    pub stats: MergeStats,
}

/// A candidate content-equivalence pairing. Ephemeral — computed per merge
/// attempt for logging, never persisted.
#[derive(Debug)]
struct ContentMatch {
    /// Index into the sorted authoritative set.
    candidate: usize,
    /// Match confidence. The current criteria are binary, so this is 1.0
    /// whenever a candidate is produced.
    confidence: f64,
    /// Human-readable reasons the pair qualified.
    reasons: Vec<String>,
}

// ---------------------------------------------------------------------------
// Reconciliation
// ---------------------------------------------------------------------------

/// Merge `primary` and `authoritative` into one consistent collection.
///
/// Both inputs are sorted by guid first, which makes matching reproducible
/// regardless of input order. The output carries the sorted primary sequence
/// plus the still-unconsumed authoritative messages, re-sorted by guid so the
/// result is a fixed point: reconciling it against an empty set returns it
/// unchanged.
#[instrument(skip_all, fields(primary = primary.len(), authoritative = authoritative.len()))]
pub fn reconcile(primary: &[Message], authoritative: &[Message]) -> MergeOutcome {
    let mut primary: Vec<Message> = primary.to_vec();
    primary.sort_by(|a, b| a.guid.cmp(&b.guid));
    let mut authoritative: Vec<Message> = authoritative.to_vec();
    authoritative.sort_by(|a, b| a.guid.cmp(&b.guid));

    let auth_by_guid: HashMap<&str, usize> = authoritative
        .iter()
        .enumerate()
        .map(|(i, m)| (m.guid.as_str(), i))
        .collect();

    let mut consumed = vec![false; authoritative.len()];
    let mut stats = MergeStats {
        csv_count: primary.len(),
        db_count: authoritative.len(),
        ..Default::default()
    };
    let mut output: Vec<Message> = Vec::with_capacity(primary.len() + authoritative.len());

    for message in &primary {
        // Pass 1: exact guid match.
        if let Some(&index) = auth_by_guid.get(message.guid.as_str()) {
            if !consumed[index] {
                consumed[index] = true;
                stats.exact_matches += 1;
                output.push(apply_authority(message, &authoritative[index]));
                continue;
            }
        }

        // Pass 2: content equivalence against unconsumed candidates,
        // evaluated in sorted order for determinism.
        if let Some(found) = find_content_match(message, &authoritative, &consumed) {
            debug!(
                primary_guid = %message.guid,
                authoritative_guid = %authoritative[found.candidate].guid,
                confidence = found.confidence,
                reasons = %found.reasons.join("; "),
                "content match"
            );
            consumed[found.candidate] = true;
            stats.content_matches += 1;
            output.push(apply_authority(message, &authoritative[found.candidate]));
            continue;
        }

        stats.no_matches += 1;
        output.push(message.clone());
    }

    // Remaining authoritative messages pass through.
    for (index, message) in authoritative.iter().enumerate() {
        if !consumed[index] {
            output.push(message.clone());
        }
    }

    // Guid substitution on matches can break sortedness; the final sort makes
    // the output a fixed point under re-reconciliation.
    output.sort_by(|a, b| a.guid.cmp(&b.guid));
    stats.output_count = output.len();

    info!(
        csv_count = stats.csv_count,
        db_count = stats.db_count,
        output_count = stats.output_count,
        exact_matches = stats.exact_matches,
        content_matches = stats.content_matches,
        no_matches = stats.no_matches,
        "reconciliation complete"
    );

    MergeOutcome {
        messages: output,
        stats,
    }
}

/// First qualifying content-equivalence candidate for `message`, if any.
fn find_content_match(
    message: &Message,
    authoritative: &[Message],
    consumed: &[bool],
) -> Option<ContentMatch> {
    for (index, candidate) in authoritative.iter().enumerate() {
        if consumed[index] {
            continue;
        }
        if let Some(reasons) = content_equivalent(message, candidate) {
            return Some(ContentMatch {
                candidate: index,
                confidence: 1.0,
                reasons,
            });
        }
    }
    None
}

/// Binary content-equivalence criterion.
///
/// Requires the same kind and the same handle (both absent counts as same).
/// Text messages pair on equality of the normalized body; media messages pair
/// on the attachment id. Tapbacks and notifications never pair this way.
fn content_equivalent(a: &Message, b: &Message) -> Option<Vec<String>> {
    if a.handle != b.handle {
        return None;
    }

    match (&a.kind, &b.kind) {
        (MessageKind::Text { text: ta }, MessageKind::Text { text: tb }) => {
            let na = normalize_text(ta);
            if na.is_empty() || na != normalize_text(tb) {
                return None;
            }
            Some(vec![
                "normalized text equal".into(),
                "handle and kind agree".into(),
            ])
        }
        (MessageKind::Media { media: ma, .. }, MessageKind::Media { media: mb, .. }) => {
            if ma.id != mb.id {
                return None;
            }
            Some(vec![
                "media id equal".into(),
                "handle and kind agree".into(),
            ])
        }
        _ => None,
    }
}

/// Normalized comparison form: lower-cased, punctuation stripped,
/// whitespace collapsed.
pub(crate) fn normalize_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_space = false;
    for c in text.chars() {
        if c.is_whitespace() {
            pending_space = !out.is_empty();
        } else if c.is_alphanumeric() {
            if pending_space {
                out.push(' ');
                pending_space = false;
            }
            for lower in c.to_lowercase() {
                out.push(lower);
            }
        }
        // Punctuation and symbols are dropped entirely.
    }
    out
}

/// Merge a matched pair. The authoritative side wins for identity, timing and
/// read-state fields; everything else keeps the primary side's value unless
/// the primary side has none.
fn apply_authority(primary: &Message, authoritative: &Message) -> Message {
    let mut merged = primary.clone();

    merged.guid = authoritative.guid.clone();
    merged.date = authoritative.date;
    merged.date_read = authoritative.date_read;
    merged.date_delivered = authoritative.date_delivered;
    merged.date_edited = authoritative.date_edited;
    merged.handle = authoritative.handle.clone();
    merged.is_read = authoritative.is_read;
    merged.replying_to = authoritative
        .replying_to
        .clone()
        .or_else(|| primary.replying_to.clone());

    // Same-kind payloads: fill fields the primary side lacks.
    match (&mut merged.kind, &authoritative.kind) {
        (MessageKind::Text { text }, MessageKind::Text { text: auth_text }) => {
            if text.is_empty() {
                *text = auth_text.clone();
            }
        }
        (
            MessageKind::Media { text, media },
            MessageKind::Media {
                text: auth_text,
                media: auth_media,
            },
        ) => {
            if text.is_none() {
                *text = auth_text.clone();
            }
            if media.filename.is_none() {
                media.filename = auth_media.filename.clone();
            }
            if media.mime_type.is_none() {
                media.mime_type = auth_media.mime_type.clone();
            }
        }
        _ => {}
    }

    merged
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chatcorpus_shared::{MediaInfo, TapbackInfo};
    use chrono::{TimeZone, Utc};
    use std::collections::HashSet;

    fn text_message(guid: &str, handle: Option<&str>, text: &str) -> Message {
        Message {
            guid: guid.into(),
            date: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            handle: handle.map(Into::into),
            is_from_me: false,
            is_read: false,
            date_read: None,
            date_delivered: None,
            date_edited: None,
            replying_to: None,
            enrichments: vec![],
            kind: MessageKind::Text { text: text.into() },
        }
    }

    fn media_message(guid: &str, handle: Option<&str>, media_id: &str) -> Message {
        let mut msg = text_message(guid, handle, "");
        msg.kind = MessageKind::Media {
            text: None,
            media: MediaInfo {
                id: media_id.into(),
                filename: None,
                mime_type: None,
                enrichments: vec![],
            },
        };
        msg
    }

    fn assert_stats_invariant(stats: &MergeStats) {
        let matched = stats.exact_matches + stats.content_matches;
        assert_eq!(
            stats.output_count,
            stats.exact_matches + stats.content_matches + stats.no_matches
                + (stats.db_count - matched),
            "accounting identity violated: {stats:?}"
        );
    }

    #[test]
    fn exact_match_takes_authoritative_fields() {
        let mut primary = text_message("g1", Some("alice"), "hello");
        primary.is_read = false;
        let mut auth = text_message("g1", Some("alice"), "hello");
        auth.is_read = true;
        auth.date = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 30).unwrap();

        let outcome = reconcile(&[primary], &[auth.clone()]);
        assert_eq!(outcome.stats.exact_matches, 1);
        assert_eq!(outcome.stats.output_count, 1);
        assert_eq!(outcome.messages[0].date, auth.date);
        assert!(outcome.messages[0].is_read);
        assert_stats_invariant(&outcome.stats);
    }

    #[test]
    fn content_match_scenario_from_normalized_text() {
        // A = [{guid:"a1", text, handle alice, "Hi!"}], B = [{guid:"b1", ..., "hi"}]
        let primary = vec![text_message("a1", Some("alice"), "Hi!")];
        let authoritative = vec![text_message("b1", Some("alice"), "hi")];

        let outcome = reconcile(&primary, &authoritative);
        assert_eq!(outcome.stats.content_matches, 1);
        assert_eq!(outcome.stats.exact_matches, 0);
        assert_eq!(outcome.stats.output_count, 1);
        // Output guid is the authoritative one.
        assert_eq!(outcome.messages[0].guid, "b1");
        assert_stats_invariant(&outcome.stats);
    }

    #[test]
    fn different_handles_never_content_match() {
        let primary = vec![text_message("a1", Some("alice"), "same words")];
        let authoritative = vec![text_message("b1", Some("bob"), "same words")];

        let outcome = reconcile(&primary, &authoritative);
        assert_eq!(outcome.stats.content_matches, 0);
        assert_eq!(outcome.stats.no_matches, 1);
        assert_eq!(outcome.stats.output_count, 2);
        assert_stats_invariant(&outcome.stats);
    }

    #[test]
    fn different_kinds_never_content_match() {
        let primary = vec![text_message("a1", Some("alice"), "att-1")];
        let authoritative = vec![media_message("b1", Some("alice"), "att-1")];

        let outcome = reconcile(&primary, &authoritative);
        assert_eq!(outcome.stats.content_matches, 0);
        assert_eq!(outcome.stats.output_count, 2);
        assert_stats_invariant(&outcome.stats);
    }

    #[test]
    fn tapbacks_never_content_match() {
        let mut primary = text_message("a1", Some("alice"), "");
        primary.kind = MessageKind::Tapback {
            tapback: TapbackInfo {
                action: "love".into(),
                target_message_guid: "x".into(),
            },
        };
        let mut auth = primary.clone();
        auth.guid = "b1".into();

        let outcome = reconcile(&[primary], &[auth]);
        assert_eq!(outcome.stats.content_matches, 0);
        assert_eq!(outcome.stats.output_count, 2);
        assert_stats_invariant(&outcome.stats);
    }

    #[test]
    fn media_messages_match_on_attachment_id() {
        let primary = vec![media_message("a1", Some("alice"), "att-9")];
        let mut auth = media_message("b1", Some("alice"), "att-9");
        if let MessageKind::Media { media, .. } = &mut auth.kind {
            media.mime_type = Some("image/png".into());
        }

        let outcome = reconcile(&primary, &[auth]);
        assert_eq!(outcome.stats.content_matches, 1);
        assert_eq!(outcome.messages[0].guid, "b1");
        // Absent primary fields filled from the authoritative side.
        assert_eq!(
            outcome.messages[0].media().unwrap().mime_type.as_deref(),
            Some("image/png")
        );
        assert_stats_invariant(&outcome.stats);
    }

    #[test]
    fn exact_match_precedence_over_content() {
        // "a1" exists verbatim in both inputs; a content-equivalent decoy
        // with a different guid must stay unmatched.
        let primary = vec![text_message("a1", Some("alice"), "hello")];
        let authoritative = vec![
            text_message("a0-decoy", Some("alice"), "hello"),
            text_message("a1", Some("alice"), "hello")
        ];

        let outcome = reconcile(&primary, &authoritative);
        assert_eq!(outcome.stats.exact_matches, 1);
        assert_eq!(outcome.stats.content_matches, 0);
        assert_eq!(outcome.stats.output_count, 2);
        let guids: Vec<_> = outcome.messages.iter().map(|m| m.guid.as_str()).collect();
        assert!(guids.contains(&"a0-decoy"));
        assert_stats_invariant(&outcome.stats);
    }

    #[test]
    fn no_data_loss_on_disjoint_inputs() {
        let primary = vec![
            text_message("a1", Some("alice"), "one"),
            text_message("a2", Some("bob"), "two"),
        ];
        let authoritative = vec![
            text_message("b1", Some("carol"), "three"),
            text_message("b2", Some("dave"), "four"),
        ];

        let outcome = reconcile(&primary, &authoritative);
        assert_eq!(outcome.stats.output_count, 4);
        assert_eq!(outcome.stats.no_matches, 2);

        let guids: HashSet<_> = outcome.messages.iter().map(|m| m.guid.as_str()).collect();
        assert_eq!(guids.len(), 4);
        assert_stats_invariant(&outcome.stats);
    }

    #[test]
    fn every_guid_appears_exactly_once() {
        let primary = vec![
            text_message("g1", Some("alice"), "Hi!"),
            text_message("g2", Some("bob"), "yo"),
            media_message("g3", None, "att-1"),
        ];
        let authoritative = vec![
            text_message("h1", Some("alice"), "hi"), // content match with g1
            text_message("g2", Some("bob"), "yo"),   // exact match
            text_message("h3", Some("erin"), "new"), // unmatched
        ];

        let outcome = reconcile(&primary, &authoritative);
        let guids: Vec<_> = outcome.messages.iter().map(|m| m.guid.as_str()).collect();
        let unique: HashSet<_> = guids.iter().copied().collect();
        assert_eq!(guids.len(), unique.len(), "duplicated guid in {guids:?}");
        // Matched primary guids are substituted by the authoritative ones.
        assert!(unique.contains("h1") && !unique.contains("g1"));
        assert!(unique.contains("g2"));
        assert!(unique.contains("g3"));
        assert!(unique.contains("h3"));
        assert_stats_invariant(&outcome.stats);
    }

    #[test]
    fn merge_is_idempotent_against_empty() {
        let primary = vec![
            text_message("g2", Some("bob"), "two"),
            text_message("g1", Some("alice"), "one"),
        ];
        let authoritative = vec![text_message("h1", Some("alice"), "one")];

        let first = reconcile(&primary, &authoritative);
        let second = reconcile(&first.messages, &[]);

        assert_eq!(second.messages, first.messages);
        assert_eq!(second.stats.no_matches, first.messages.len());
        assert_eq!(second.stats.output_count, first.stats.output_count);
        assert_stats_invariant(&second.stats);
    }

    #[test]
    fn deterministic_across_input_order() {
        let primary = vec![
            text_message("a3", Some("alice"), "three"),
            text_message("a1", Some("alice"), "one"),
            text_message("a2", Some("alice"), "two"),
        ];
        let authoritative = vec![
            text_message("b2", Some("alice"), "two"),
            text_message("b1", Some("alice"), "one"),
        ];

        let forward = reconcile(&primary, &authoritative);

        let mut shuffled_primary = primary.clone();
        shuffled_primary.reverse();
        let mut shuffled_auth = authoritative.clone();
        shuffled_auth.reverse();
        let reversed = reconcile(&shuffled_primary, &shuffled_auth);

        assert_eq!(forward.messages, reversed.messages);
        assert_eq!(forward.stats, reversed.stats);
    }

    #[test]
    fn normalize_text_rules() {
        assert_eq!(normalize_text("Hi!"), "hi");
        assert_eq!(normalize_text("  On   my WAY!!! "), "on my way");
        assert_eq!(normalize_text("don't"), "dont");
        assert_eq!(normalize_text("..."), "");
        assert_eq!(normalize_text("Ça va?"), "ça va");
    }

    #[test]
    fn empty_text_never_matches() {
        let primary = vec![text_message("a1", Some("alice"), "!!!")];
        let authoritative = vec![text_message("b1", Some("alice"), "...")];

        let outcome = reconcile(&primary, &authoritative);
        assert_eq!(outcome.stats.content_matches, 0);
        assert_eq!(outcome.stats.output_count, 2);
    }
}
