//! End-to-end `convert` pipeline: exports → ingest → reconcile → corpus.
//!
//! The CSV export is the primary side; the message database is authoritative.
//! Either source alone works too — reconciling against an empty set is the
//! identity, so single-source conversions share the same code path.

use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{info, instrument};

use chatcorpus_shared::{ChatCorpusError, Corpus, Message, Result};
use chatcorpus_storage::MessageDb;

use crate::reconcile::{MergeStats, reconcile};

// ---------------------------------------------------------------------------
// Config & result
// ---------------------------------------------------------------------------

/// Configuration for the `convert` pipeline.
#[derive(Debug, Clone)]
pub struct ConvertConfig {
    /// CSV export path (primary source).
    pub csv_path: Option<PathBuf>,
    /// Message database path (authoritative source).
    pub db_path: Option<PathBuf>,
    /// Tool version string stamped on the corpus.
    pub tool_version: String,
}

/// Result of the `convert` pipeline.
#[derive(Debug)]
pub struct ConvertResult {
    /// The reconciled corpus.
    pub corpus: Corpus,
    /// Merge counters.
    pub stats: MergeStats,
    /// Input rows dropped during ingestion (both sources combined).
    pub rows_skipped: usize,
    /// Total elapsed time.
    pub elapsed: std::time::Duration,
}

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called when a source collection has been loaded.
    fn source_loaded(&self, source: &str, count: usize);
    /// Called when the pipeline completes.
    fn done(&self, result: &ConvertResult);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn source_loaded(&self, _source: &str, _count: usize) {}
    fn done(&self, _result: &ConvertResult) {}
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Run the full `convert` pipeline.
///
/// 1. Ingest the CSV export (if given)
/// 2. Ingest the message database (if given)
/// 3. Reconcile the two collections
/// 4. Wrap into a schema-versioned corpus
#[instrument(skip_all)]
pub async fn convert(
    config: &ConvertConfig,
    progress: &dyn ProgressReporter,
) -> Result<ConvertResult> {
    let start = Instant::now();

    if config.csv_path.is_none() && config.db_path.is_none() {
        return Err(ChatCorpusError::validation(
            "at least one input source (--csv or --db) is required",
        ));
    }

    let mut rows_skipped = 0usize;

    // --- Primary: CSV export ---
    let primary: Vec<Message> = match &config.csv_path {
        Some(path) => {
            progress.phase("Reading CSV export");
            let ingest = chatcorpus_ingest::read_csv(path)?;
            rows_skipped += ingest.rows_skipped;
            progress.source_loaded("csv", ingest.messages.len());
            ingest.messages
        }
        None => Vec::new(),
    };

    // --- Authoritative: message database ---
    let authoritative: Vec<Message> = match &config.db_path {
        Some(path) => {
            progress.phase("Reading message database");
            let db = MessageDb::open(path).await?;
            let ingest = db.list_messages().await?;
            rows_skipped += ingest.rows_skipped;
            progress.source_loaded("db", ingest.messages.len());
            ingest.messages
        }
        None => Vec::new(),
    };

    // --- Reconcile ---
    progress.phase("Reconciling collections");
    let outcome = reconcile(&primary, &authoritative);

    // --- Corpus ---
    let corpus = Corpus::new(config.tool_version.clone(), outcome.messages);
    corpus.validate()?;

    let result = ConvertResult {
        corpus,
        stats: outcome.stats,
        rows_skipped,
        elapsed: start.elapsed(),
    };

    progress.done(&result);

    info!(
        output_count = result.stats.output_count,
        exact_matches = result.stats.exact_matches,
        content_matches = result.stats.content_matches,
        rows_skipped = result.rows_skipped,
        elapsed_ms = result.elapsed.as_millis(),
        "convert pipeline complete"
    );

    Ok(result)
}

// ---------------------------------------------------------------------------
// Corpus I/O
// ---------------------------------------------------------------------------

/// Load a corpus JSON file. An absent or unreadable input is fatal.
pub fn load_corpus(path: &Path) -> Result<Corpus> {
    let content = std::fs::read_to_string(path).map_err(|e| ChatCorpusError::io(path, e))?;
    let corpus: Corpus = serde_json::from_str(&content)
        .map_err(|e| ChatCorpusError::validation(format!("invalid corpus JSON: {e}")))?;
    corpus.validate()?;
    Ok(corpus)
}

/// Write a corpus JSON file via a temp file and rename.
pub fn save_corpus(corpus: &Corpus, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| ChatCorpusError::io(parent, e))?;
        }
    }

    let content = serde_json::to_string_pretty(corpus)
        .map_err(|e| ChatCorpusError::validation(format!("serialize corpus: {e}")))?;

    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, content).map_err(|e| ChatCorpusError::io(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| ChatCorpusError::io(path, e))?;

    info!(path = %path.display(), messages = corpus.messages.len(), "corpus written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("chatcorpus-pipeline-{}-{name}", std::process::id()))
    }

    #[tokio::test]
    async fn convert_requires_a_source() {
        let config = ConvertConfig {
            csv_path: None,
            db_path: None,
            tool_version: "0.1.0".into(),
        };
        let err = convert(&config, &SilentProgress).await.expect_err("no sources");
        assert!(err.to_string().contains("at least one input source"));
    }

    #[tokio::test]
    async fn convert_from_csv_only() {
        let csv = temp_path("only.csv");
        std::fs::write(
            &csv,
            "guid,date,handle,text\n\
             g2,2024-03-01T12:05:00Z,alice,second\n\
             g1,2024-03-01T12:00:00Z,alice,first\n",
        )
        .expect("write csv");

        let config = ConvertConfig {
            csv_path: Some(csv.clone()),
            db_path: None,
            tool_version: "0.1.0".into(),
        };
        let result = convert(&config, &SilentProgress).await.expect("convert");

        assert_eq!(result.stats.csv_count, 2);
        assert_eq!(result.stats.db_count, 0);
        assert_eq!(result.stats.output_count, 2);
        assert_eq!(result.stats.no_matches, 2);
        // Reconciliation sorts by guid.
        assert_eq!(result.corpus.messages[0].guid, "g1");

        let _ = std::fs::remove_file(&csv);
    }

    #[tokio::test]
    async fn missing_csv_is_fatal() {
        let config = ConvertConfig {
            csv_path: Some(PathBuf::from("/nonexistent/export.csv")),
            db_path: None,
            tool_version: "0.1.0".into(),
        };
        let err = convert(&config, &SilentProgress).await.expect_err("io");
        assert!(matches!(err, ChatCorpusError::Io { .. }));
    }

    #[test]
    fn corpus_save_load_roundtrip() {
        let path = temp_path("roundtrip.json");
        let corpus = Corpus::new("0.1.0", vec![]);
        save_corpus(&corpus, &path).expect("save");

        let loaded = load_corpus(&path).expect("load");
        assert_eq!(loaded.schema_version, corpus.schema_version);
        assert!(loaded.messages.is_empty());

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn load_missing_corpus_is_fatal() {
        let err = load_corpus(Path::new("/nonexistent/corpus.json")).expect_err("io");
        assert!(matches!(err, ChatCorpusError::Io { .. }));
    }
}
