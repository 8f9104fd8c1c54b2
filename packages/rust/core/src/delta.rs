//! Incremental delta detection.
//!
//! An enrichment run can record the guids it has seen; the next run processes
//! only messages new since then. [`detect_new`] is a pure set difference; the
//! surrounding [`IncrementalState`] handles the state file on disk.

use std::collections::BTreeSet;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use chatcorpus_shared::{ChatCorpusError, Result};

/// Guids seen by prior runs, plus when the last run finished.
///
/// One state file per logical pipeline, shared across runs: loaded at run
/// start, replaced at run end with the union of old and newly processed
/// guids, cleared only on explicit reset.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncrementalState {
    /// Guids processed by any prior run.
    pub processed_guids: BTreeSet<String>,
    /// When the recording run finished.
    pub last_run_at: DateTime<Utc>,
}

impl IncrementalState {
    /// Fresh state covering `guids`, stamped now.
    pub fn new(guids: BTreeSet<String>) -> Self {
        Self {
            processed_guids: guids,
            last_run_at: Utc::now(),
        }
    }

    /// Union this state with the guids processed by the current run.
    pub fn absorb(previous: Option<Self>, processed: impl IntoIterator<Item = String>) -> Self {
        let mut guids = previous.map(|s| s.processed_guids).unwrap_or_default();
        guids.extend(processed);
        Self::new(guids)
    }

    /// Load state from `path`. Absent or unreadable files yield `None` — a
    /// corrupt state file means "treat everything as new", never an abort.
    pub fn load(path: &Path) -> Option<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read incremental state");
                return None;
            }
        };

        match serde_json::from_str::<Self>(&content) {
            Ok(state) => {
                debug!(
                    path = %path.display(),
                    guids = state.processed_guids.len(),
                    "loaded incremental state"
                );
                Some(state)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "corrupt incremental state ignored");
                None
            }
        }
    }

    /// Persist state to `path` via a temp-file-and-rename so a crash can
    /// never leave a truncated state file behind.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ChatCorpusError::validation(format!("serialize state: {e}")))?;

        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content).map_err(|e| ChatCorpusError::io(&tmp, e))?;
        std::fs::rename(&tmp, path).map_err(|e| ChatCorpusError::io(path, e))?;

        info!(
            path = %path.display(),
            guids = self.processed_guids.len(),
            "incremental state saved"
        );
        Ok(())
    }

    /// Remove the state file at `path` if present.
    pub fn reset(path: &Path) -> Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => {
                info!(path = %path.display(), "incremental state cleared");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ChatCorpusError::io(path, e)),
        }
    }
}

/// Guids present in `current` but absent from the previous run's record, in
/// sorted order. Pure set difference — no mutation, no I/O.
pub fn detect_new(current: &BTreeSet<String>, previous: &IncrementalState) -> Vec<String> {
    current
        .difference(&previous.processed_guids)
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guid_set(guids: &[&str]) -> BTreeSet<String> {
        guids.iter().map(|g| g.to_string()).collect()
    }

    #[test]
    fn detect_new_is_set_difference() {
        let previous = IncrementalState::new(guid_set(&["a", "b", "c"]));
        let current = guid_set(&["b", "c", "d", "e"]);

        assert_eq!(detect_new(&current, &previous), vec!["d", "e"]);
    }

    #[test]
    fn detect_new_empty_when_subset() {
        let previous = IncrementalState::new(guid_set(&["a", "b", "c"]));
        let current = guid_set(&["a", "b"]);

        assert!(detect_new(&current, &previous).is_empty());
    }

    #[test]
    fn detect_new_everything_against_empty_state() {
        let previous = IncrementalState::new(BTreeSet::new());
        let current = guid_set(&["x", "y"]);

        assert_eq!(detect_new(&current, &previous), vec!["x", "y"]);
    }

    #[test]
    fn absorb_unions_previous_and_processed() {
        let previous = IncrementalState::new(guid_set(&["a", "b"]));
        let updated =
            IncrementalState::absorb(Some(previous), ["b".to_string(), "c".to_string()]);

        assert_eq!(updated.processed_guids, guid_set(&["a", "b", "c"]));
    }

    #[test]
    fn save_load_roundtrip() {
        let path = std::env::temp_dir().join(format!(
            "chatcorpus-state-test-{}.json",
            std::process::id()
        ));
        let state = IncrementalState::new(guid_set(&["g1", "g2"]));
        state.save(&path).expect("save");

        let loaded = IncrementalState::load(&path).expect("state present");
        assert_eq!(loaded.processed_guids, state.processed_guids);

        IncrementalState::reset(&path).expect("reset");
        assert!(IncrementalState::load(&path).is_none());
        // Resetting an already-absent file is fine.
        IncrementalState::reset(&path).expect("reset twice");
    }

    #[test]
    fn corrupt_state_yields_none() {
        let path = std::env::temp_dir().join(format!(
            "chatcorpus-state-corrupt-{}.json",
            std::process::id()
        ));
        std::fs::write(&path, "{not json").expect("write");
        assert!(IncrementalState::load(&path).is_none());
        let _ = std::fs::remove_file(&path);
    }
}
