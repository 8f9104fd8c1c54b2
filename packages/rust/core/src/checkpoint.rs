//! Checkpointing for long enrichment runs.
//!
//! A checkpoint records how far a run got, keyed by a fingerprint of the
//! enrichment configuration. Re-running with identical settings resumes the
//! same file; changing any fingerprinted setting produces a different path
//! and therefore a fresh run.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use chatcorpus_shared::{ChatCorpusError, EnrichmentSettings, Result};

/// Hex digits of the fingerprint embedded in checkpoint filenames.
const FILENAME_HASH_LEN: usize = 16;

/// One failed enrichment attempt, recorded per item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedItem {
    /// Index of the message in the run's input order.
    pub index: usize,
    /// Message guid.
    pub guid: String,
    /// Message kind name.
    pub kind: String,
    /// Provider error text.
    pub error: String,
}

/// Durable snapshot of enrichment progress.
///
/// Owned exclusively by one run: created empty at run start, overwritten in
/// place every interval, superseded entirely by the next run with the same
/// configuration fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointState {
    /// Input index of the last processed message.
    pub last_processed_index: usize,
    /// Messages processed so far (including pass-throughs).
    pub total_processed: usize,
    /// Messages whose enrichment failed.
    pub total_failed: usize,
    /// Per-item failure records.
    pub failed_items: Vec<FailedItem>,
    /// Fingerprint of the enrichment configuration that produced this state.
    pub config_hash: String,
}

impl CheckpointState {
    /// Empty state stamped with the given configuration fingerprint.
    pub fn new(config_hash: impl Into<String>) -> Self {
        Self {
            last_processed_index: 0,
            total_processed: 0,
            total_failed: 0,
            failed_items: Vec::new(),
            config_hash: config_hash.into(),
        }
    }

    /// Index to resume from: one past the last checkpointed index, or 0 when
    /// the checkpoint has not processed anything yet.
    pub fn resume_index(&self) -> usize {
        if self.total_processed == 0 {
            0
        } else {
            self.last_processed_index + 1
        }
    }
}

/// Fingerprint of the enrichment configuration: provider toggles plus
/// rate-limit and retry settings. Canonical JSON keeps the hash stable across
/// processes.
pub fn config_hash(settings: &EnrichmentSettings) -> String {
    let canonical =
        serde_json::to_string(settings).expect("enrichment settings always serialize");
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Checkpoint file path for a configuration fingerprint. The filename embeds
/// the hash so differing configurations never collide.
pub fn checkpoint_path(dir: &Path, config_hash: &str) -> PathBuf {
    let short = &config_hash[..config_hash.len().min(FILENAME_HASH_LEN)];
    dir.join(format!("checkpoint-{short}.json"))
}

/// Persist `state` to `path`, replacing any prior content. The write goes to
/// a sibling temp file first and is renamed into place so a crash can never
/// leave a truncated checkpoint.
pub fn save_checkpoint(state: &CheckpointState, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ChatCorpusError::io(parent, e))?;
    }

    let content = serde_json::to_string_pretty(state)
        .map_err(|e| ChatCorpusError::validation(format!("serialize checkpoint: {e}")))?;

    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, content).map_err(|e| ChatCorpusError::io(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| ChatCorpusError::io(path, e))?;

    debug!(
        path = %path.display(),
        last_processed_index = state.last_processed_index,
        total_processed = state.total_processed,
        "checkpoint saved"
    );
    Ok(())
}

/// Load a checkpoint from `path`. Absent or unreadable files yield `None`;
/// "file not found" is never an error here.
pub fn load_checkpoint(path: &Path) -> Option<CheckpointState> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read checkpoint");
            return None;
        }
    };

    match serde_json::from_str::<CheckpointState>(&content) {
        Ok(state) => Some(state),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "corrupt checkpoint ignored");
            None
        }
    }
}
