//! CLI command definitions, routing, and tracing setup.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use chatcorpus_core::checkpoint::CheckpointState;
use chatcorpus_core::delta::IncrementalState;
use chatcorpus_core::enrich::{EnrichOptions, EnrichmentProgress, run_enrichment};
use chatcorpus_core::pipeline::{
    ConvertConfig, ConvertResult, ProgressReporter, convert, load_corpus, save_corpus,
};
use chatcorpus_shared::{
    AppConfig, Corpus, EnrichmentSettings, Message, init_config, load_config, validate_api_key,
};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// ChatCorpus — turn message exports into an enriched corpus.
#[derive(Parser)]
#[command(
    name = "chatcorpus",
    version,
    about = "Convert personal message exports into a normalized, enriched JSON corpus.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Merge a CSV export and/or a message database into one corpus.
    Convert {
        /// CSV export path (primary source).
        #[arg(long)]
        csv: Option<PathBuf>,

        /// Message database path (authoritative source).
        #[arg(long)]
        db: Option<PathBuf>,

        /// Output corpus path.
        #[arg(short, long, default_value = "corpus.json")]
        out: PathBuf,
    },

    /// Run enrichment providers over a corpus.
    Enrich {
        /// Input corpus path.
        #[arg(short, long)]
        input: PathBuf,

        /// Output corpus path.
        #[arg(short, long, default_value = "enriched.json")]
        out: PathBuf,

        /// Resume from the checkpoint matching the current configuration.
        #[arg(long)]
        resume: bool,

        /// Only enrich messages new since the last recorded run.
        #[arg(long)]
        incremental: bool,

        /// Incremental-state file path.
        #[arg(long)]
        state_file: Option<PathBuf>,

        /// Clear incremental state before running.
        #[arg(long)]
        reset_state: bool,

        /// Minimum ms between provider calls.
        #[arg(long)]
        rate_limit_ms: Option<u64>,

        /// Retries per message before recording a failure.
        #[arg(long)]
        max_retries: Option<u32>,

        /// Messages between checkpoint writes.
        #[arg(long)]
        checkpoint_interval: Option<usize>,

        /// Directory holding checkpoint files.
        #[arg(long)]
        checkpoint_dir: Option<PathBuf>,

        /// Disable image analysis.
        #[arg(long)]
        no_images: bool,

        /// Disable audio transcription.
        #[arg(long)]
        no_audio: bool,

        /// Disable link previews.
        #[arg(long)]
        no_links: bool,
    },

    /// Render a corpus as a Markdown timeline.
    Render {
        /// Input corpus path.
        #[arg(short, long)]
        input: PathBuf,

        /// Output Markdown path.
        #[arg(short, long, default_value = "timeline.md")]
        out: PathBuf,

        /// Document title.
        #[arg(long, default_value = "Message Timeline")]
        title: String,
    },

    /// Incremental-state management.
    State {
        /// State subcommand.
        #[command(subcommand)]
        action: StateAction,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Incremental-state subcommands.
#[derive(Subcommand)]
pub(crate) enum StateAction {
    /// Clear the incremental state file.
    Reset {
        /// State file path.
        #[arg(long)]
        state_file: Option<PathBuf>,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
    /// Print the config file path.
    Path,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "chatcorpus=info",
        1 => "chatcorpus=debug",
        _ => "chatcorpus=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Convert { csv, db, out } => cmd_convert(csv, db, out).await,
        Command::Enrich {
            input,
            out,
            resume,
            incremental,
            state_file,
            reset_state,
            rate_limit_ms,
            max_retries,
            checkpoint_interval,
            checkpoint_dir,
            no_images,
            no_audio,
            no_links,
        } => {
            let flags = EnrichFlags {
                input,
                out,
                resume,
                incremental,
                state_file,
                reset_state,
                rate_limit_ms,
                max_retries,
                checkpoint_interval,
                checkpoint_dir,
                no_images,
                no_audio,
                no_links,
            };
            cmd_enrich(flags).await
        }
        Command::Render { input, out, title } => cmd_render(&input, &out, &title).await,
        Command::State { action } => match action {
            StateAction::Reset { state_file } => cmd_state_reset(state_file).await,
        },
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
            ConfigAction::Path => cmd_config_path().await,
        },
    }
}

// ---------------------------------------------------------------------------
// convert
// ---------------------------------------------------------------------------

async fn cmd_convert(csv: Option<PathBuf>, db: Option<PathBuf>, out: PathBuf) -> Result<()> {
    let config = ConvertConfig {
        csv_path: csv,
        db_path: db,
        tool_version: env!("CARGO_PKG_VERSION").to_string(),
    };

    let reporter = CliProgress::new();
    let result = convert(&config, &reporter).await?;
    save_corpus(&result.corpus, &out)?;

    println!();
    println!("  Corpus written to {}", out.display());
    println!("  CSV messages:    {}", result.stats.csv_count);
    println!("  DB messages:     {}", result.stats.db_count);
    println!("  Output messages: {}", result.stats.output_count);
    println!("  Exact matches:   {}", result.stats.exact_matches);
    println!("  Content matches: {}", result.stats.content_matches);
    println!("  Unmatched:       {}", result.stats.no_matches);
    if result.rows_skipped > 0 {
        println!("  Rows skipped:    {}", result.rows_skipped);
    }
    println!("  Time:            {:.1}s", result.elapsed.as_secs_f64());
    println!();

    Ok(())
}

// ---------------------------------------------------------------------------
// enrich
// ---------------------------------------------------------------------------

/// Flattened `enrich` flags.
struct EnrichFlags {
    input: PathBuf,
    out: PathBuf,
    resume: bool,
    incremental: bool,
    state_file: Option<PathBuf>,
    reset_state: bool,
    rate_limit_ms: Option<u64>,
    max_retries: Option<u32>,
    checkpoint_interval: Option<usize>,
    checkpoint_dir: Option<PathBuf>,
    no_images: bool,
    no_audio: bool,
    no_links: bool,
}

async fn cmd_enrich(flags: EnrichFlags) -> Result<()> {
    let config = load_config()?;

    // Merge config-file defaults with CLI overrides.
    let mut settings = EnrichmentSettings::from_config(&config);
    settings.images &= !flags.no_images;
    settings.audio &= !flags.no_audio;
    settings.links &= !flags.no_links;
    if let Some(rate_limit_ms) = flags.rate_limit_ms {
        settings.rate_limit_ms = rate_limit_ms;
    }
    if let Some(max_retries) = flags.max_retries {
        settings.max_retries = max_retries;
    }

    let options = EnrichOptions {
        resume: flags.resume,
        incremental: flags.incremental,
        checkpoint_interval: flags
            .checkpoint_interval
            .unwrap_or(config.defaults.checkpoint_interval),
        checkpoint_dir: flags
            .checkpoint_dir
            .unwrap_or_else(|| PathBuf::from(&config.defaults.checkpoint_dir)),
        state_path: flags
            .state_file
            .unwrap_or_else(|| PathBuf::from(&config.defaults.state_file)),
    };

    if flags.reset_state {
        IncrementalState::reset(&options.state_path)?;
    }

    // The AI providers need a key; link previews alone do not.
    let api_key = if settings.images || settings.audio {
        validate_api_key(&config)?;
        std::env::var(&config.openrouter.api_key_env).ok()
    } else {
        None
    };

    let providers = chatcorpus_providers::build_providers(&settings, api_key.as_deref())?;
    if providers.is_empty() {
        return Err(eyre!("all providers are disabled — nothing to enrich"));
    }

    // On resume, splice previously-written partial output over the input so
    // already-enriched messages keep their enrichments.
    let input = load_corpus(&flags.input)?;
    let messages = if flags.resume {
        splice_partial_output(input.messages, &flags.out)
    } else {
        input.messages
    };

    info!(
        messages = messages.len(),
        resume = flags.resume,
        incremental = flags.incremental,
        "starting enrichment run"
    );

    let reporter = EnrichCliProgress::new(flags.out.clone());
    let report = run_enrichment(&messages, &settings, &options, &providers, &reporter).await?;
    reporter.finish();

    let corpus = Corpus::new(env!("CARGO_PKG_VERSION"), report.enriched);
    save_corpus(&corpus, &flags.out)?;

    // The run summary is always printed, even when many items failed.
    println!();
    println!("  Enriched corpus written to {}", flags.out.display());
    println!("  Processed: {}", report.total_processed);
    println!("  Failed:    {}", report.total_failed);
    for item in &report.failed_items {
        println!("    [{}] {} ({}): {}", item.index, item.guid, item.kind, item.error);
    }
    if let Some(error) = &report.checkpoint_write_error {
        warn!(%error, "final checkpoint write failed");
        println!("  Warning: final checkpoint write failed: {error}");
    }
    println!();

    Ok(())
}

/// Overlay a previously-written partial output file onto the input messages.
fn splice_partial_output(input: Vec<Message>, out_path: &std::path::Path) -> Vec<Message> {
    if !out_path.exists() {
        return input;
    }
    match load_corpus(out_path) {
        Ok(partial) => {
            let keep = partial.messages.len().min(input.len());
            info!(kept = keep, "reusing partial output from a prior run");
            let mut spliced = partial.messages;
            spliced.truncate(keep);
            spliced.extend(input.into_iter().skip(keep));
            spliced
        }
        Err(e) => {
            warn!(error = %e, "cannot reuse partial output, starting from input");
            input
        }
    }
}

// ---------------------------------------------------------------------------
// render
// ---------------------------------------------------------------------------

async fn cmd_render(input: &std::path::Path, out: &std::path::Path, title: &str) -> Result<()> {
    let corpus = load_corpus(input)?;
    let markdown = chatcorpus_render::render_timeline(&corpus, title);
    std::fs::write(out, markdown)
        .map_err(|e| eyre!("cannot write {}: {e}", out.display()))?;

    println!("  Timeline written to {}", out.display());
    Ok(())
}

// ---------------------------------------------------------------------------
// state / config
// ---------------------------------------------------------------------------

async fn cmd_state_reset(state_file: Option<PathBuf>) -> Result<()> {
    let config = load_config()?;
    let path = state_file.unwrap_or_else(|| PathBuf::from(&config.defaults.state_file));
    IncrementalState::reset(&path)?;
    println!("  Incremental state cleared: {}", path.display());
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("  Config written to {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let rendered = toml::to_string_pretty(&config)?;
    println!("{rendered}");
    Ok(())
}

async fn cmd_config_path() -> Result<()> {
    println!("{}", chatcorpus_shared::config_file_path()?.display());
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporters
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap()
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn source_loaded(&self, source: &str, count: usize) {
        self.spinner
            .set_message(format!("Loaded {count} messages from {source}"));
    }

    fn done(&self, _result: &ConvertResult) {
        self.spinner.finish_and_clear();
    }
}

/// Enrichment progress reporter: spinner plus partial-output persistence at
/// every checkpoint, so an interrupted run can resume from its own output.
struct EnrichCliProgress {
    spinner: ProgressBar,
    out_path: PathBuf,
}

impl EnrichCliProgress {
    fn new(out_path: PathBuf) -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap()
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner, out_path }
    }

    fn finish(&self) {
        self.spinner.finish_and_clear();
    }
}

impl EnrichmentProgress for EnrichCliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn task_progress(&self, current: usize, total: usize, detail: &str) {
        self.spinner
            .set_message(format!("Enriching [{current}/{total}] {detail}"));
    }

    fn checkpoint_saved(&self, _state: &CheckpointState, output: &[Message]) {
        let partial = Corpus::new(env!("CARGO_PKG_VERSION"), output.to_vec());
        if let Err(e) = save_corpus(&partial, &self.out_path) {
            warn!(error = %e, "partial output write failed");
        }
    }
}
