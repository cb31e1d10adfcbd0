//! CLI command definitions, routing, and tracing setup.

use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use bulkresearch_client::ResearchClient;
use bulkresearch_core::{
    BatchProgress, BatchScheduler, BudgetGuard, LedgerBudget, NewRun, Orchestrator, RequestPipeline,
    ResultAggregator, RunState, WindowReport, WindowStatus, load_run, tally,
};
use bulkresearch_shared::{
    AnalysisType, AppConfig, BatchConfig, DepthLevel, Entity, ModelSelection, ResearchCategory,
    ResearchOptions, ResultMap, ResultRecord, RunSettings, init_config, load_config,
    parse_entity_list,
};
use bulkresearch_storage::Storage;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// bulkresearch: research a list of companies through the aggregation endpoint.
#[derive(Parser)]
#[command(
    name = "bulkresearch",
    version,
    about = "Run research requests over an entity list in confirmed windows.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
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
    /// Start a new run over an entity file (one `identifier (Name)` per line).
    Run {
        /// Entity list file.
        file: PathBuf,

        /// Run name (defaults to the file stem).
        #[arg(short, long)]
        name: Option<String>,

        #[command(flatten)]
        research: ResearchArgs,

        #[command(flatten)]
        output: OutputArgs,
    },

    /// Continue a paused run.
    Resume {
        /// Run ID.
        run_id: String,

        #[command(flatten)]
        output: OutputArgs,
    },

    /// List stored runs.
    Runs,

    /// Write the per-model reports of a run.
    Report {
        /// Run ID.
        run_id: String,

        /// Directory to write reports to; prints to stdout when omitted.
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Show this month's usage of the budgeted model tier.
    Budget,

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Research settings for a new run. Unset values fall back to `[defaults]`.
#[derive(clap::Args)]
pub(crate) struct ResearchArgs {
    /// Research category (e.g. market_analysis, sales_opportunities).
    #[arg(short, long)]
    category: Option<ResearchCategory>,

    /// Depth: basic, standard, or comprehensive.
    #[arg(short, long)]
    depth: Option<DepthLevel>,

    /// Analysis type: individual or comparative.
    #[arg(long, default_value = "individual")]
    analysis: AnalysisType,

    /// Free-text request, used by general research.
    #[arg(short, long)]
    intent: Option<String>,

    /// Models to query (comma-separated).
    #[arg(short, long, value_delimiter = ',')]
    models: Vec<String>,

    /// Entities per confirmed window.
    #[arg(short, long)]
    window_size: Option<usize>,

    #[arg(long)]
    timeframe: Option<String>,

    #[arg(long)]
    geographic_scope: Option<String>,

    #[arg(long)]
    company_size: Option<String>,

    #[arg(long)]
    revenue_category: Option<String>,

    /// Output format hint forwarded to the endpoint.
    #[arg(long)]
    output_format: Option<String>,

    /// Disable web search.
    #[arg(long)]
    no_web_search: bool,
}

/// How a run reports and pauses.
#[derive(clap::Args)]
pub(crate) struct OutputArgs {
    /// Continue past window boundaries without asking.
    #[arg(short, long)]
    yes: bool,

    /// Keep per-model reports in this directory up to date as results arrive.
    #[arg(long)]
    live: Option<PathBuf>,
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "bulkresearch=info",
        1 => "bulkresearch=debug",
        _ => "bulkresearch=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
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
        Command::Run {
            file,
            name,
            research,
            output,
        } => cmd_run(&file, name, research, output).await,
        Command::Resume { run_id, output } => cmd_resume(&run_id, output).await,
        Command::Runs => cmd_runs().await,
        Command::Report { run_id, out } => cmd_report(&run_id, out.as_deref()).await,
        Command::Budget => cmd_budget().await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

// ---------------------------------------------------------------------------
// Run / resume
// ---------------------------------------------------------------------------

async fn cmd_run(file: &Path, name: Option<String>, args: ResearchArgs, output: OutputArgs) -> Result<()> {
    let config = load_config()?;

    let text = std::fs::read_to_string(file)
        .wrap_err_with(|| format!("cannot read entity list {}", file.display()))?;
    let entities = parse_entity_list(&text)?;
    if entities.is_empty() {
        return Err(eyre!("{} contains no entities", file.display()));
    }

    let source_name = file.file_name().map(|n| n.to_string_lossy().to_string());
    let run_name = name.unwrap_or_else(|| {
        file.file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "run".to_string())
    });
    let settings = build_settings(&config, args, source_name);

    let storage = open_storage(&config).await?;
    let orch = orchestrator(&config, &storage)?;

    let state = orch
        .create_run(NewRun {
            name: run_name,
            entities,
            settings,
        })
        .await?;

    println!();
    println!("  Run created: {}", state.run_id);
    println!("  Entities:    {}", state.total());
    println!("  Category:    {}", state.settings.category);
    println!("  Depth:       {}", state.settings.depth);
    println!(
        "  Models:      {}",
        state.settings.models.selected().collect::<Vec<_>>().join(", ")
    );
    println!();

    drive(&orch, state, &output).await
}

async fn cmd_resume(run_id: &str, output: OutputArgs) -> Result<()> {
    let config = load_config()?;
    let storage = open_storage(&config).await?;
    let orch = orchestrator(&config, &storage)?;

    let state = orch.load_run(run_id).await?;
    if state.is_complete() {
        println!("Run {run_id} is already complete. Use `bulkresearch report {run_id}`.");
        return Ok(());
    }

    info!(run_id, processed = state.cumulative_processed, total = state.total(), "resuming run");
    println!(
        "  Resuming {} at entity {} of {}",
        state.name,
        state.cumulative_processed + 1,
        state.total()
    );

    drive(&orch, state, &output).await
}

/// Merge CLI flags over `[defaults]`.
fn build_settings(config: &AppConfig, args: ResearchArgs, source_name: Option<String>) -> RunSettings {
    let models = if args.models.is_empty() {
        config.defaults.models.clone()
    } else {
        args.models
    };

    RunSettings {
        category: args.category.unwrap_or(config.defaults.category),
        depth: args.depth.unwrap_or(config.defaults.depth),
        analysis_type: args.analysis,
        user_intent: args.intent,
        models: ModelSelection::from_names(models.iter().map(|m| m.trim()).filter(|m| !m.is_empty())),
        options: ResearchOptions {
            timeframe: args.timeframe,
            geographic_scope: args.geographic_scope,
            company_size: args.company_size,
            revenue_category: args.revenue_category,
            web_search_enabled: !args.no_web_search,
            output_format: args.output_format,
        },
        source_name,
        window_size: args.window_size.unwrap_or(config.defaults.window_size),
    }
}

async fn open_storage(config: &AppConfig) -> Result<Storage> {
    let db_path = config.storage.resolved_db_path()?;
    Ok(Storage::open(&db_path).await?)
}

fn orchestrator<'a>(config: &AppConfig, storage: &'a Storage) -> Result<Orchestrator<'a, LedgerBudget<'a>>> {
    let batch = BatchConfig::from_app(config)?;
    let client = ResearchClient::new(&batch)?;
    if !client.has_credentials() {
        return Err(eyre!(
            "no API key found; set {} before starting a run",
            config.endpoint.api_key_env
        ));
    }

    let scheduler = BatchScheduler::new(RequestPipeline::new(client), batch.request_delay);
    let guard = LedgerBudget::new(
        storage,
        config.budget.constrained_tier,
        config.budget.monthly_limit,
    );
    Ok(Orchestrator::new(storage, scheduler, guard))
}

/// Advance a run window by window, asking at each checkpoint.
async fn drive(
    orch: &Orchestrator<'_, LedgerBudget<'_>>,
    mut state: RunState,
    output: &OutputArgs,
) -> Result<()> {
    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let live = match &output.live {
        Some(dir) => Some(LiveReport::new(dir, &state)?),
        None => None,
    };

    loop {
        let progress = CliProgress::new(live.as_ref());
        let result = orch.run_next_window(&mut state, &progress, &cancel).await;
        progress.finish();
        let report = result?;

        print_window_summary(&report);

        if report.status == WindowStatus::Cancelled {
            println!("  Stopped. Resume with: bulkresearch resume {}", state.run_id);
            break;
        }
        if state.is_complete() {
            let overall = tally(state.results.values());
            println!(
                "  Run complete: {} succeeded, {} failed.",
                overall.succeeded, overall.failed
            );
            println!("  Reports: bulkresearch report {} --out <dir>", state.run_id);
            break;
        }
        if report.boundary.at_boundary && !output.yes {
            let next = state.next_window().map(|w| w.count).unwrap_or(0);
            if !confirm_continue(&report, next, &cancel).await? {
                println!("  Paused. Resume with: bulkresearch resume {}", state.run_id);
                break;
            }
        }
    }

    Ok(())
}

fn print_window_summary(report: &WindowReport) {
    println!();
    println!(
        "  Window done: {} processed ({} ok, {} failed), {}/{} overall",
        report.processed,
        report.tally.succeeded,
        report.tally.failed,
        report.cumulative_processed,
        report.total
    );
    if report.downgraded {
        println!("  Budget exhausted: this window used {}", report.tier);
    }
    if let Some(budget) = &report.budget {
        println!(
            "  Budget: {} of {} used ({:.1}%)",
            budget.used, budget.total, budget.percentage
        );
    }
}

/// Ask whether to run the next window. Ctrl-C counts as "no".
async fn confirm_continue(report: &WindowReport, next: usize, cancel: &CancellationToken) -> Result<bool> {
    print!(
        "\n  {} remaining. Continue with the next {next}? [y/N] ",
        report.boundary.remaining
    );
    std::io::stdout().flush()?;

    // A blocking stdin read cannot be interrupted, so it runs on a detached
    // thread the runtime never waits for on shutdown.
    let (tx, rx) = oneshot::channel();
    std::thread::spawn(move || {
        let mut line = String::new();
        let _ = tx.send(std::io::stdin().read_line(&mut line).map(|_| line));
    });

    await_answer(rx, cancel).await
}

async fn await_answer(
    answer: oneshot::Receiver<std::io::Result<String>>,
    cancel: &CancellationToken,
) -> Result<bool> {
    tokio::select! {
        line = answer => match line {
            Ok(line) => Ok(is_yes(&line?)),
            // Reader thread went away without an answer.
            Err(_) => Ok(false),
        },
        _ = cancel.cancelled() => {
            println!();
            Ok(false)
        }
    }
}

fn is_yes(line: &str) -> bool {
    matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// Progress bar for one window, with one line per finished entity.
struct CliProgress<'a> {
    bar: ProgressBar,
    live: Option<&'a LiveReport>,
}

impl<'a> CliProgress<'a> {
    fn new(live: Option<&'a LiveReport>) -> Self {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} [{prefix}] {bar:30.cyan/blue} {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        bar.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { bar, live }
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl BatchProgress for CliProgress<'_> {
    fn window_started(&self, start: usize, count: usize, total: usize) {
        self.bar.set_length(count as u64);
        self.bar.set_position(0);
        self.bar
            .set_prefix(format!("{}-{} of {total}", start + 1, start + count));
    }

    fn item_started(&self, _index: usize, entity: &Entity) {
        self.bar.set_message(entity.display_name().to_string());
    }

    fn item_completed(&self, index: usize, entity: &Entity, record: &ResultRecord) {
        self.bar.inc(1);
        match &record.error {
            None => self.bar.println(format!("  ✓ #{} {}", index + 1, entity.display_name())),
            Some(e) => self.bar.println(format!("  ✗ #{} {}: {e}", index + 1, entity.display_name())),
        }
        if let Some(live) = self.live {
            live.push(record);
        }
    }
}

/// Per-model report files rewritten after every record.
struct LiveReport {
    dir: PathBuf,
    stem: String,
    aggregator: ResultAggregator,
    order: Vec<String>,
    records: Mutex<ResultMap>,
}

impl LiveReport {
    fn new(dir: &Path, state: &RunState) -> Result<Self> {
        let live = Self {
            dir: dir.to_path_buf(),
            stem: file_stem(&state.name),
            aggregator: ResultAggregator::new(&state.settings.models),
            order: state.order(),
            records: Mutex::new(state.results.clone()),
        };
        if let Ok(records) = live.records.lock() {
            write_reports(&live.dir, &live.stem, &live.aggregator.format(&records, &live.order))?;
        }
        Ok(live)
    }

    fn push(&self, record: &ResultRecord) {
        let Ok(mut records) = self.records.lock() else {
            return;
        };
        records.insert(record.entity_id.clone(), record.clone());
        let docs = self.aggregator.format(&records, &self.order);
        if let Err(e) = write_reports(&self.dir, &self.stem, &docs) {
            warn!(error = %e, "failed to update live report");
        }
    }
}

// ---------------------------------------------------------------------------
// Listing and reports
// ---------------------------------------------------------------------------

async fn cmd_runs() -> Result<()> {
    let config = load_config()?;
    let db_path = config.storage.resolved_db_path()?;
    if !db_path.exists() {
        println!("No runs yet.");
        return Ok(());
    }
    let storage = Storage::open_readonly(&db_path).await?;
    let runs = storage.list_runs().await?;

    if runs.is_empty() {
        println!("No runs yet.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<20}  {:<9}  {:>9}  {}",
        "ID", "NAME", "STATUS", "PROGRESS", "CREATED"
    );
    for run in runs {
        println!(
            "{:<36}  {:<20}  {:<9}  {:>9}  {}",
            run.id,
            truncate(&run.name, 20),
            run.status.as_str(),
            format!("{}/{}", run.next_window_start, run.total_entities),
            run.created_at.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

async fn cmd_report(run_id: &str, out: Option<&Path>) -> Result<()> {
    let config = load_config()?;
    let storage = Storage::open_readonly(&config.storage.resolved_db_path()?).await?;
    let state = load_run(&storage, run_id).await?;

    let docs = ResultAggregator::new(&state.settings.models).format(&state.results, &state.order());

    match out {
        Some(dir) => {
            let paths = write_reports(dir, &file_stem(&state.name), &docs)?;
            for path in paths {
                println!("  wrote {}", path.display());
            }
        }
        None => {
            for doc in docs.values() {
                println!("{doc}");
            }
        }
    }
    Ok(())
}

async fn cmd_budget() -> Result<()> {
    let config = load_config()?;
    let storage = open_storage(&config).await?;
    let guard = LedgerBudget::new(
        &storage,
        config.budget.constrained_tier,
        config.budget.monthly_limit,
    );

    let snapshot = guard.snapshot().await?;
    println!(
        "  {}: {} of {} requests used this month ({:.1}%)",
        config.budget.constrained_tier, snapshot.used, snapshot.total, snapshot.percentage
    );
    Ok(())
}

/// Write one `<stem>-<model>.md` per model into `dir`.
fn write_reports(dir: &Path, stem: &str, docs: &BTreeMap<String, String>) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir).wrap_err_with(|| format!("cannot create {}", dir.display()))?;

    docs.iter()
        .map(|(model, doc)| {
            let path = dir.join(format!("{stem}-{}.md", file_stem(model)));
            std::fs::write(&path, doc)
                .wrap_err_with(|| format!("cannot write {}", path.display()))?;
            Ok(path)
        })
        .collect()
}

/// Lowercase, filesystem-safe version of a run or model name.
fn file_stem(name: &str) -> String {
    let stem: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let stem = stem.trim_matches('-').to_string();
    if stem.is_empty() { "run".to_string() } else { stem }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let kept: String = s.chars().take(max.saturating_sub(1)).collect();
    format!("{kept}…")
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_run_flags() {
        let cli = Cli::try_parse_from([
            "bulkresearch",
            "run",
            "leads.txt",
            "--category",
            "sales-opportunities",
            "--depth",
            "comprehensive",
            "--models",
            "openai,claude",
            "--window-size",
            "5",
            "--no-web-search",
            "--yes",
        ])
        .unwrap();

        let Command::Run {
            file,
            research,
            output,
            ..
        } = cli.command
        else {
            panic!("expected run command");
        };
        assert_eq!(file, PathBuf::from("leads.txt"));
        assert!(output.yes);

        let settings = build_settings(&AppConfig::default(), research, Some("leads.txt".into()));
        assert_eq!(settings.category, ResearchCategory::SalesOpportunities);
        assert_eq!(settings.depth, DepthLevel::Comprehensive);
        assert_eq!(settings.window_size, 5);
        assert!(!settings.options.web_search_enabled);
        assert_eq!(
            settings.models.selected().collect::<Vec<_>>(),
            vec!["claude", "openai"]
        );
    }

    #[test]
    fn settings_fall_back_to_config_defaults() {
        let cli = Cli::try_parse_from(["bulkresearch", "run", "leads.txt"]).unwrap();
        let Command::Run { research, .. } = cli.command else {
            panic!("expected run command");
        };

        let settings = build_settings(&AppConfig::default(), research, None);
        assert_eq!(settings.category, ResearchCategory::GeneralResearch);
        assert_eq!(settings.depth, DepthLevel::Standard);
        assert_eq!(settings.window_size, 20);
        assert!(settings.models.is_selected("perplexity"));
        assert!(settings.options.web_search_enabled);
    }

    #[test]
    fn unknown_category_is_rejected() {
        assert!(Cli::try_parse_from(["bulkresearch", "run", "x.txt", "--category", "astrology"]).is_err());
    }

    #[test]
    fn file_stems_are_safe() {
        assert_eq!(file_stem("Q3 Leads (EMEA)"), "q3-leads--emea");
        assert_eq!(file_stem("///"), "run");
        assert_eq!(file_stem("openai"), "openai");
    }

    #[test]
    fn writes_one_report_per_model() {
        let dir = std::env::temp_dir().join(format!("br_cli_{}", std::process::id()));
        let docs: BTreeMap<String, String> = [
            ("openai".to_string(), "# openai".to_string()),
            ("claude".to_string(), "# claude".to_string()),
        ]
        .into_iter()
        .collect();

        let paths = write_reports(&dir, "leads", &docs).unwrap();
        assert_eq!(paths.len(), 2);
        assert_eq!(
            std::fs::read_to_string(dir.join("leads-openai.md")).unwrap(),
            "# openai"
        );

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn only_yes_answers_continue() {
        assert!(is_yes("y\n"));
        assert!(is_yes("  YES \r\n"));
        assert!(!is_yes("\n"));
        assert!(!is_yes("n\n"));
        assert!(!is_yes("yep"));
    }

    #[tokio::test]
    async fn ctrl_c_at_prompt_returns_without_an_answer() {
        // Sender stays alive and silent, like a reader stuck on stdin.
        let (_tx, rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let answer = tokio::time::timeout(std::time::Duration::from_secs(1), await_answer(rx, &cancel))
            .await
            .expect("prompt should not wait for input once cancelled")
            .unwrap();
        assert!(!answer);
    }

    #[test]
    fn runtime_shuts_down_while_prompt_reader_is_blocked() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let (done_tx, done_rx) = std::sync::mpsc::channel();

        let handle = std::thread::spawn(move || {
            runtime.block_on(async {
                let (tx, rx) = oneshot::channel::<std::io::Result<String>>();
                std::thread::spawn(move || {
                    std::thread::sleep(std::time::Duration::from_secs(30));
                    let _ = tx.send(Ok(String::new()));
                });
                let cancel = CancellationToken::new();
                cancel.cancel();
                assert!(!await_answer(rx, &cancel).await.unwrap());
            });
            drop(runtime);
            let _ = done_tx.send(());
        });

        done_rx
            .recv_timeout(std::time::Duration::from_secs(3))
            .expect("runtime drop should not wait for the reader thread");
        handle.join().unwrap();
    }

    #[tokio::test]
    async fn typed_answer_is_used() {
        let cancel = CancellationToken::new();

        let (tx, rx) = oneshot::channel();
        tx.send(Ok("y\n".to_string())).unwrap();
        assert!(await_answer(rx, &cancel).await.unwrap());

        let (tx, rx) = oneshot::channel::<std::io::Result<String>>();
        drop(tx);
        assert!(!await_answer(rx, &cancel).await.unwrap());
    }
}
