//! Enrichment orchestrator.
//!
//! Drives a long-running, externally-rate-limited enrichment pass over a
//! message collection: consults the incremental delta, gates every provider
//! call through the rate pacer and circuit breaker, attaches provider output,
//! records per-item failures, and commits progress through the checkpoint
//! manager so an interrupted run resumes where it stopped.
//!
//! Messages are processed strictly sequentially, one provider call in flight
//! at a time — the pacer is a single-caller object with no synchronization.

use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;

use tracing::{debug, error, info, instrument, warn};

use chatcorpus_shared::{
    ChatCorpusError, Enrichment, EnrichmentSettings, Message, Result,
};
use chatcorpus_providers::EnrichmentProvider;

use crate::checkpoint::{
    CheckpointState, FailedItem, checkpoint_path, config_hash, load_checkpoint, save_checkpoint,
};
use crate::delta::{IncrementalState, detect_new};
use crate::pacing::{PacerConfig, RatePacer};

// ---------------------------------------------------------------------------
// Options & report
// ---------------------------------------------------------------------------

/// Per-run orchestrator options.
#[derive(Debug, Clone)]
pub struct EnrichOptions {
    /// Resume from the checkpoint matching the current configuration.
    pub resume: bool,
    /// Only enrich messages new since the last recorded run.
    pub incremental: bool,
    /// Messages between checkpoint writes.
    pub checkpoint_interval: usize,
    /// Directory holding checkpoint files.
    pub checkpoint_dir: PathBuf,
    /// Incremental-state file path.
    pub state_path: PathBuf,
}

/// Outcome of an enrichment run.
///
/// Always produced when the run itself completes — per-message provider
/// failures are inside `failed_items`, never an `Err`.
#[derive(Debug)]
pub struct EnrichmentReport {
    /// Every input message, in input order, enriched where possible.
    pub enriched: Vec<Message>,
    /// Messages processed across the run lineage (resume included).
    pub total_processed: usize,
    /// Messages whose enrichment failed.
    pub total_failed: usize,
    /// Per-item failure records.
    pub failed_items: Vec<FailedItem>,
    /// Set when the final checkpoint write failed; the run output is still
    /// complete and valid.
    pub checkpoint_write_error: Option<String>,
}

// ---------------------------------------------------------------------------
// Progress trait
// ---------------------------------------------------------------------------

/// Progress callback for enrichment runs.
pub trait EnrichmentProgress: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Per-message progress within the run.
    fn task_progress(&self, current: usize, total: usize, detail: &str);
    /// Called after every successful checkpoint write with the output so
    /// far; callers persist partial output here so `--resume` can reload it.
    fn checkpoint_saved(&self, _state: &CheckpointState, _output: &[Message]) {}
}

/// No-op enrichment progress.
pub struct SilentEnrichmentProgress;

impl EnrichmentProgress for SilentEnrichmentProgress {
    fn phase(&self, _name: &str) {}
    fn task_progress(&self, _current: usize, _total: usize, _detail: &str) {}
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Run an enrichment pass over `messages`.
///
/// Fatal only on a checkpoint configuration mismatch when resuming; every
/// provider error is caught at the per-message boundary and recorded. The
/// input order is preserved exactly — checkpoint indices refer to it.
#[instrument(skip_all, fields(messages = messages.len(), resume = options.resume, incremental = options.incremental))]
pub async fn run_enrichment(
    messages: &[Message],
    settings: &EnrichmentSettings,
    options: &EnrichOptions,
    providers: &[Box<dyn EnrichmentProvider>],
    progress: &dyn EnrichmentProgress,
) -> Result<EnrichmentReport> {
    let hash = config_hash(settings);
    let ckpt_path = checkpoint_path(&options.checkpoint_dir, &hash);
    let interval = options.checkpoint_interval.max(1);

    // --- Resume ---
    let mut state = CheckpointState::new(&hash);
    let mut start_index = 0usize;

    if options.resume {
        if let Some(loaded) = load_checkpoint(&ckpt_path) {
            if loaded.config_hash != hash {
                // Abort before touching any message or the checkpoint file.
                return Err(ChatCorpusError::checkpoint_mismatch(format!(
                    "checkpoint at {} was written under configuration {}, current is {}",
                    ckpt_path.display(),
                    &loaded.config_hash[..loaded.config_hash.len().min(16)],
                    &hash[..16],
                )));
            }
            start_index = loaded.resume_index();
            info!(
                start_index,
                total_processed = loaded.total_processed,
                "resuming from checkpoint"
            );
            state = loaded;
        }
    }

    // --- Incremental delta ---
    let previous_state = options.incremental.then(|| IncrementalState::load(&options.state_path)).flatten();
    let new_guids: Option<HashSet<String>> = match &previous_state {
        Some(previous) => {
            let current: BTreeSet<String> =
                messages.iter().map(|m| m.guid.clone()).collect();
            let fresh = detect_new(&current, previous);
            info!(
                new = fresh.len(),
                seen = previous.processed_guids.len(),
                "incremental delta computed"
            );
            Some(fresh.into_iter().collect())
        }
        // No previous state: the entire collection is new.
        None => None,
    };

    // --- Main loop ---
    progress.phase("Enriching messages");
    let mut pacer = RatePacer::new(PacerConfig::from(settings));
    let mut output: Vec<Message> = messages[..start_index.min(messages.len())].to_vec();
    let total = messages.len();

    for index in start_index..messages.len() {
        let mut message = messages[index].clone();
        progress.task_progress(index + 1, total, &message.guid);

        let incremental_skip = new_guids
            .as_ref()
            .is_some_and(|fresh| !fresh.contains(&message.guid));
        let provider = (!incremental_skip)
            .then(|| providers.iter().find(|p| p.handles(&message)))
            .flatten();

        if let Some(provider) = provider {
            if pacer.is_circuit_open() {
                // Not a failure: the message passes through unenriched and
                // no rate-limit budget is consumed.
                debug!(guid = %message.guid, "circuit open, skipping enrichment");
            } else {
                enrich_one(&mut message, index, provider.as_ref(), settings, &mut pacer, &mut state)
                    .await;
            }
        } else if incremental_skip {
            debug!(guid = %message.guid, "already processed in a prior run");
        }

        output.push(message);
        state.total_processed += 1;
        state.last_processed_index = index;

        if state.total_processed % interval == 0 {
            // Interval writes are best-effort; the next interval retries.
            match save_checkpoint(&state, &ckpt_path) {
                Ok(()) => progress.checkpoint_saved(&state, &output),
                Err(e) => warn!(error = %e, "interval checkpoint write failed"),
            }
        }
    }

    // --- Final checkpoint, covering the entire run ---
    let checkpoint_write_error = match save_checkpoint(&state, &ckpt_path) {
        Ok(()) => {
            progress.checkpoint_saved(&state, &output);
            None
        }
        Err(e) => {
            error!(error = %e, "final checkpoint write failed");
            Some(e.to_string())
        }
    };

    // --- Incremental state: union of previous and everything processed ---
    if options.incremental {
        let updated = IncrementalState::absorb(
            previous_state,
            messages.iter().map(|m| m.guid.clone()),
        );
        if let Err(e) = updated.save(&options.state_path) {
            warn!(error = %e, "incremental state write failed");
        }
    }

    info!(
        total_processed = state.total_processed,
        total_failed = state.total_failed,
        "enrichment run complete"
    );

    Ok(EnrichmentReport {
        enriched: output,
        total_processed: state.total_processed,
        total_failed: state.total_failed,
        failed_items: state.failed_items,
        checkpoint_write_error,
    })
}

/// Enrich a single message through the pacer, with bounded retries.
///
/// On success the provider output is attached to the message; on exhausted
/// retries the failure is recorded in `state` and the message is left as-is.
async fn enrich_one(
    message: &mut Message,
    index: usize,
    provider: &dyn EnrichmentProvider,
    settings: &EnrichmentSettings,
    pacer: &mut RatePacer,
    state: &mut CheckpointState,
) {
    let mut attempts = 0u32;

    loop {
        let wait = pacer.should_rate_limit();
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
        pacer.record_call();

        match provider.enrich(message).await {
            Ok(enrichment) => {
                pacer.record_success();
                attach_enrichment(message, enrichment);
                return;
            }
            Err(e) => {
                pacer.record_failure();
                attempts += 1;

                if attempts <= settings.max_retries && !pacer.is_circuit_open() {
                    debug!(
                        guid = %message.guid,
                        attempt = attempts,
                        error = %e,
                        "provider call failed, retrying"
                    );
                    continue;
                }

                warn!(
                    guid = %message.guid,
                    provider = provider.name(),
                    error = %e,
                    "enrichment failed"
                );
                state.total_failed += 1;
                state.failed_items.push(FailedItem {
                    index,
                    guid: message.guid.clone(),
                    kind: message.kind_name().to_string(),
                    error: e.to_string(),
                });
                return;
            }
        }
    }
}

/// Attach a provider result: media enrichments nest under the attachment,
/// everything else lands on the message.
fn attach_enrichment(message: &mut Message, enrichment: Enrichment) {
    if enrichment.kind == "link-preview" {
        message.enrichments.push(enrichment);
    } else if let Some(media) = message.media_mut() {
        media.enrichments.push(enrichment);
    } else {
        message.enrichments.push(enrichment);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chatcorpus_shared::{AppConfig, MessageKind};
    use chrono::{TimeZone, Utc};
    use std::sync::{Arc, Mutex};

    /// Deterministic provider stub: enriches every text message, fails on
    /// configured guids, records every call in a shared log.
    struct StubProvider {
        fail_guids: Vec<String>,
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl StubProvider {
        fn new(fail_guids: &[&str]) -> Self {
            Self {
                fail_guids: fail_guids.iter().map(|g| g.to_string()).collect(),
                calls: Arc::new(Mutex::new(Vec::new())),
            }
        }

        /// Handle on the call log that survives boxing the provider.
        fn call_log(&self) -> Arc<Mutex<Vec<String>>> {
            Arc::clone(&self.calls)
        }
    }

    #[async_trait]
    impl EnrichmentProvider for StubProvider {
        fn name(&self) -> &'static str {
            "stub"
        }

        fn handles(&self, message: &Message) -> bool {
            matches!(message.kind, MessageKind::Text { .. })
        }

        async fn enrich(&self, message: &Message) -> Result<Enrichment> {
            self.calls.lock().unwrap().push(message.guid.clone());
            if self.fail_guids.contains(&message.guid) {
                return Err(ChatCorpusError::Enrichment("stub failure".into()));
            }
            Ok(Enrichment {
                kind: "stub".into(),
                provider: "stub".into(),
                model: None,
                version: 1,
                // Fixed timestamp keeps outputs comparable across runs.
                created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
                data: serde_json::json!({ "echo": message.guid }),
            })
        }
    }

    fn text_message(guid: &str) -> Message {
        Message {
            guid: guid.into(),
            date: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            handle: Some("alice".into()),
            is_from_me: false,
            is_read: false,
            date_read: None,
            date_delivered: None,
            date_edited: None,
            replying_to: None,
            enrichments: vec![],
            kind: MessageKind::Text {
                text: format!("message {guid}"),
            },
        }
    }

    fn fast_settings() -> EnrichmentSettings {
        let mut settings = EnrichmentSettings::from_config(&AppConfig::default());
        settings.rate_limit_ms = 0;
        settings.max_retries = 0;
        settings
    }

    fn test_options(tag: &str) -> EnrichOptions {
        let dir = std::env::temp_dir().join(format!(
            "chatcorpus-enrich-{tag}-{}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).expect("mkdir");
        EnrichOptions {
            resume: false,
            incremental: false,
            checkpoint_interval: 2,
            checkpoint_dir: dir.clone(),
            state_path: dir.join("state.json"),
        }
    }

    fn providers(stub: StubProvider) -> Vec<Box<dyn EnrichmentProvider>> {
        vec![Box::new(stub)]
    }

    #[tokio::test]
    async fn enriches_every_eligible_message() {
        let messages: Vec<_> = ["g1", "g2", "g3"].iter().map(|g| text_message(g)).collect();
        let options = test_options("happy");

        let report = run_enrichment(
            &messages,
            &fast_settings(),
            &options,
            &providers(StubProvider::new(&[])),
            &SilentEnrichmentProgress,
        )
        .await
        .expect("run");

        assert_eq!(report.total_processed, 3);
        assert_eq!(report.total_failed, 0);
        assert!(report.checkpoint_write_error.is_none());
        for message in &report.enriched {
            assert_eq!(message.enrichments.len(), 1);
            assert_eq!(message.enrichments[0].data["echo"], message.guid.as_str());
        }

        // Final checkpoint covers the whole run.
        let hash = config_hash(&fast_settings());
        let saved = load_checkpoint(&checkpoint_path(&options.checkpoint_dir, &hash))
            .expect("final checkpoint");
        assert_eq!(saved.last_processed_index, 2);
        assert_eq!(saved.total_processed, 3);

        let _ = std::fs::remove_dir_all(&options.checkpoint_dir);
    }

    #[tokio::test]
    async fn provider_failures_are_recorded_never_fatal() {
        let messages: Vec<_> = ["g1", "g2", "g3"].iter().map(|g| text_message(g)).collect();
        let options = test_options("failures");

        let report = run_enrichment(
            &messages,
            &fast_settings(),
            &options,
            &providers(StubProvider::new(&["g2"])),
            &SilentEnrichmentProgress,
        )
        .await
        .expect("run completes despite failures");

        assert_eq!(report.total_processed, 3);
        assert_eq!(report.total_failed, 1);
        assert_eq!(report.failed_items.len(), 1);
        assert_eq!(report.failed_items[0].guid, "g2");
        assert_eq!(report.failed_items[0].kind, "text");
        assert!(report.failed_items[0].error.contains("stub failure"));

        // The failed message is retained, unenriched.
        assert_eq!(report.enriched.len(), 3);
        assert!(report.enriched[1].enrichments.is_empty());

        let _ = std::fs::remove_dir_all(&options.checkpoint_dir);
    }

    #[tokio::test]
    async fn bounded_retries_then_record_failure() {
        let messages = vec![text_message("g1")];
        let options = test_options("retries");
        let mut settings = fast_settings();
        settings.max_retries = 2;

        let stub = StubProvider::new(&["g1"]);
        let calls = stub.call_log();
        let providers = providers(stub);
        let report = run_enrichment(
            &messages,
            &settings,
            &options,
            &providers,
            &SilentEnrichmentProgress,
        )
        .await
        .expect("run");

        // One initial attempt plus two retries, then a single failure record.
        assert_eq!(calls.lock().unwrap().len(), 3);
        assert_eq!(report.total_failed, 1);
        assert_eq!(report.failed_items.len(), 1);

        let _ = std::fs::remove_dir_all(&options.checkpoint_dir);
    }

    #[tokio::test]
    async fn open_circuit_skips_without_failing() {
        let messages: Vec<_> = ["g1", "g2", "g3", "g4", "g5"]
            .iter()
            .map(|g| text_message(g))
            .collect();
        let options = test_options("circuit");
        let mut settings = fast_settings();
        settings.failure_threshold = 2;

        let stub = StubProvider::new(&["g1", "g2", "g3", "g4", "g5"]);
        let providers = providers(stub);
        let report = run_enrichment(
            &messages,
            &settings,
            &options,
            &providers,
            &SilentEnrichmentProgress,
        )
        .await
        .expect("run");

        // Two failures trip the breaker; the remaining three pass through
        // uncounted and unenriched.
        assert_eq!(report.total_processed, 5);
        assert_eq!(report.total_failed, 2);
        assert_eq!(report.enriched.len(), 5);

        let _ = std::fs::remove_dir_all(&options.checkpoint_dir);
    }

    #[tokio::test]
    async fn incremental_passes_through_previously_seen() {
        let messages: Vec<_> = ["g1", "g2", "g3"].iter().map(|g| text_message(g)).collect();
        let mut options = test_options("incremental");
        options.incremental = true;

        // Prior run saw g1 and g2.
        IncrementalState::new(["g1".to_string(), "g2".to_string()].into_iter().collect())
            .save(&options.state_path)
            .expect("seed state");

        let stub = StubProvider::new(&[]);
        let calls = stub.call_log();
        let providers_vec = providers(stub);
        let report = run_enrichment(
            &messages,
            &fast_settings(),
            &options,
            &providers_vec,
            &SilentEnrichmentProgress,
        )
        .await
        .expect("run");

        // Everything is carried through, but only g3 reached the provider.
        assert_eq!(*calls.lock().unwrap(), vec!["g3".to_string()]);
        assert_eq!(report.total_processed, 3);
        assert!(report.enriched[0].enrichments.is_empty());
        assert!(report.enriched[1].enrichments.is_empty());
        assert_eq!(report.enriched[2].enrichments.len(), 1);

        // State now covers the whole collection.
        let state = IncrementalState::load(&options.state_path).expect("state");
        assert!(state.processed_guids.contains("g1"));
        assert!(state.processed_guids.contains("g3"));

        let _ = std::fs::remove_dir_all(&options.checkpoint_dir);
    }

    #[tokio::test]
    async fn incremental_without_prior_state_enriches_everything() {
        let messages: Vec<_> = ["g1", "g2"].iter().map(|g| text_message(g)).collect();
        let mut options = test_options("incremental-fresh");
        options.incremental = true;

        let report = run_enrichment(
            &messages,
            &fast_settings(),
            &options,
            &providers(StubProvider::new(&[])),
            &SilentEnrichmentProgress,
        )
        .await
        .expect("run");

        assert!(report.enriched.iter().all(|m| m.enrichments.len() == 1));

        let _ = std::fs::remove_dir_all(&options.checkpoint_dir);
    }

    #[tokio::test]
    async fn split_run_with_resume_equals_uninterrupted_run() {
        let messages: Vec<_> = (0..10).map(|i| text_message(&format!("g{i}"))).collect();
        let settings = fast_settings();

        // Uninterrupted reference run.
        let full_options = test_options("resume-full");
        let full = run_enrichment(
            &messages,
            &settings,
            &full_options,
            &providers(StubProvider::new(&["g3", "g7"])),
            &SilentEnrichmentProgress,
        )
        .await
        .expect("full run");

        // Split run: first half, then resume over the spliced output.
        let split_options = test_options("resume-split");
        let first = run_enrichment(
            &messages[..5],
            &settings,
            &split_options,
            &providers(StubProvider::new(&["g3", "g7"])),
            &SilentEnrichmentProgress,
        )
        .await
        .expect("first half");
        assert_eq!(first.total_processed, 5);

        let mut spliced = first.enriched.clone();
        spliced.extend_from_slice(&messages[5..]);

        let mut resume_options = split_options.clone();
        resume_options.resume = true;
        let stub = StubProvider::new(&["g3", "g7"]);
        let second_providers = providers(stub);
        let second = run_enrichment(
            &spliced,
            &settings,
            &resume_options,
            &second_providers,
            &SilentEnrichmentProgress,
        )
        .await
        .expect("resumed half");

        assert_eq!(second.enriched, full.enriched);
        assert_eq!(second.total_processed, full.total_processed);
        assert_eq!(second.total_failed, full.total_failed);
        assert_eq!(second.failed_items, full.failed_items);

        let _ = std::fs::remove_dir_all(&full_options.checkpoint_dir);
        let _ = std::fs::remove_dir_all(&split_options.checkpoint_dir);
    }

    #[tokio::test]
    async fn config_mismatch_aborts_before_processing() {
        let messages = vec![text_message("g1")];
        let mut options = test_options("mismatch");
        options.resume = true;
        let settings = fast_settings();

        // Plant a checkpoint at the expected path carrying a foreign hash.
        let hash = config_hash(&settings);
        let path = checkpoint_path(&options.checkpoint_dir, &hash);
        let mut foreign = CheckpointState::new("0000deadbeef0000deadbeef");
        foreign.total_processed = 12;
        save_checkpoint(&foreign, &path).expect("plant checkpoint");
        let before = std::fs::read_to_string(&path).expect("read planted");

        let stub = StubProvider::new(&[]);
        let calls = stub.call_log();
        let providers_vec = providers(stub);
        let err = run_enrichment(
            &messages,
            &settings,
            &options,
            &providers_vec,
            &SilentEnrichmentProgress,
        )
        .await
        .expect_err("mismatch is fatal");
        assert!(matches!(err, ChatCorpusError::CheckpointMismatch { .. }));

        // No provider call was made and the checkpoint file is untouched.
        assert!(calls.lock().unwrap().is_empty());
        let after = std::fs::read_to_string(&path).expect("read after");
        assert_eq!(before, after);

        let _ = std::fs::remove_dir_all(&options.checkpoint_dir);
    }

    #[tokio::test]
    async fn rate_limit_paces_consecutive_calls() {
        let messages: Vec<_> = ["g1", "g2", "g3"].iter().map(|g| text_message(g)).collect();
        let options = test_options("pacing");
        let mut settings = fast_settings();
        settings.rate_limit_ms = 40;

        let started = std::time::Instant::now();
        run_enrichment(
            &messages,
            &settings,
            &options,
            &providers(StubProvider::new(&[])),
            &SilentEnrichmentProgress,
        )
        .await
        .expect("run");

        // Three calls with a 40 ms floor between them: at least ~80 ms.
        assert!(started.elapsed() >= std::time::Duration::from_millis(80));

        let _ = std::fs::remove_dir_all(&options.checkpoint_dir);
    }

    #[tokio::test]
    async fn checkpoint_interval_writes_are_observed() {
        struct CountingProgress(Mutex<usize>);
        impl EnrichmentProgress for CountingProgress {
            fn phase(&self, _name: &str) {}
            fn task_progress(&self, _current: usize, _total: usize, _detail: &str) {}
            fn checkpoint_saved(&self, _state: &CheckpointState, _output: &[Message]) {
                *self.0.lock().unwrap() += 1;
            }
        }

        let messages: Vec<_> = (0..5).map(|i| text_message(&format!("g{i}"))).collect();
        let options = test_options("interval");
        let progress = CountingProgress(Mutex::new(0));

        run_enrichment(
            &messages,
            &fast_settings(),
            &options,
            &providers(StubProvider::new(&[])),
            &progress,
        )
        .await
        .expect("run");

        // Interval 2 over 5 messages: writes after 2 and 4, plus the final.
        assert_eq!(*progress.0.lock().unwrap(), 3);

        let _ = std::fs::remove_dir_all(&options.checkpoint_dir);
    }
}
