//! CLI command definitions, routing, and tracing setup.

use std::collections::HashSet;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use playbook_core::bridge::{Bridge, BridgeGenerator, BridgeTracker};
use playbook_core::enrichment::prune_records;
use playbook_core::status::{status_report, upcoming_tasks};
use playbook_core::{
    Answer, Assistant, AssistantOptions, CancelFlag, ConversationStore, DocumentCache,
    EnrichmentPipeline, EnrichmentPolicy, EnrichmentProgress, EnrichmentReport, Grounding,
    TaskTracker,
};
use playbook_methodology::render_phase;
use playbook_shared::{
    AppConfig, DiagnosticKind, Document, ExternalTask, expand_home, init_config, load_config,
    validate_api_key,
};
use playbook_storage::Storage;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Playbook: methodology-grounded guidance for project tasks.
#[derive(Parser)]
#[command(
    name = "playbook",
    version,
    about = "Match project tasks and questions to the phases of an implementation methodology.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Methodology document (defaults to `defaults.methodology_path`).
    #[arg(long, env = "PLAYBOOK_METHODOLOGY", global = true)]
    pub methodology: Option<PathBuf>,

    /// Enrichment state database (defaults to `defaults.database_path`).
    #[arg(long, env = "PLAYBOOK_DB", global = true)]
    pub db: Option<PathBuf>,

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
    /// Parse the methodology and report its phases and diagnostics.
    Parse,

    /// Show one phase of the methodology.
    Phase {
        /// Phase number.
        index: u32,
    },

    /// Ask a single question about the methodology.
    Ask {
        /// The question (quoting is optional).
        #[arg(required = true, num_args = 1..)]
        question: Vec<String>,
    },

    /// Interactive question session with follow-up context.
    Chat,

    /// Add phase guidance to open tracker tasks.
    Enrich {
        /// Process at most this many open tasks (0 or omitted: all).
        #[arg(short, long)]
        limit: Option<usize>,

        /// Tracker project (defaults to `tracker.project_id`).
        #[arg(short, long)]
        project: Option<String>,

        /// Forget enrichment state for tasks deleted from the tracker.
        #[arg(long)]
        prune: bool,
    },

    /// Project progress broken down by phase.
    Status {
        /// Tracker project (defaults to `tracker.project_id`).
        #[arg(short, long)]
        project: Option<String>,
    },

    /// Open tasks due soon.
    Tasks {
        /// Tracker project (defaults to `tracker.project_id`).
        #[arg(short, long)]
        project: Option<String>,

        /// Look-ahead window in days.
        #[arg(short, long, default_value_t = 7)]
        days: u32,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
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
        0 => "playbook=info",
        1 => "playbook=debug",
        _ => "playbook=trace",
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
    let Cli {
        methodology,
        db,
        command,
        ..
    } = cli;
    let context = || Context::load(methodology.clone(), db.clone());

    match command {
        Command::Parse => cmd_parse(&context()?),
        Command::Phase { index } => cmd_phase(&context()?, index),
        Command::Ask { question } => cmd_ask(&context()?, &question.join(" ")).await,
        Command::Chat => cmd_chat(&context()?).await,
        Command::Enrich {
            limit,
            project,
            prune,
        } => cmd_enrich(&context()?, limit, project.as_deref(), prune).await,
        Command::Status { project } => cmd_status(&context()?, project.as_deref()).await,
        Command::Tasks { project, days } => {
            cmd_tasks(&context()?, project.as_deref(), days).await
        }
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(),
        },
    }
}

/// Resolved configuration and paths shared by the commands.
struct Context {
    config: AppConfig,
    methodology_path: PathBuf,
    db_path: PathBuf,
}

impl Context {
    fn load(methodology: Option<PathBuf>, db: Option<PathBuf>) -> Result<Self> {
        let config = load_config()?;
        let methodology_path = match methodology {
            Some(path) => path,
            None => expand_home(&config.defaults.methodology_path)?,
        };
        let db_path = match db {
            Some(path) => path,
            None => expand_home(&config.defaults.database_path)?,
        };
        Ok(Self {
            config,
            methodology_path,
            db_path,
        })
    }

    fn read_methodology(&self) -> Result<String> {
        std::fs::read_to_string(&self.methodology_path).wrap_err_with(|| {
            format!(
                "cannot read methodology document '{}'",
                self.methodology_path.display()
            )
        })
    }

    /// Parse the methodology without touching the database.
    fn document(&self) -> Result<Arc<Document>> {
        Ok(DocumentCache::new().document(&self.read_methodology()?))
    }

    /// Parse the methodology through the persisted document cache.
    async fn document_with_store(&self, storage: &Storage) -> Result<Arc<Document>> {
        let raw = self.read_methodology()?;
        Ok(DocumentCache::new().document_with_store(&raw, storage).await)
    }

    async fn storage(&self) -> Result<Storage> {
        Ok(Storage::open(&self.db_path).await?)
    }

    async fn reporting_storage(&self) -> Result<Option<Storage>> {
        Ok(Storage::open_for_reporting(&self.db_path).await?)
    }

    fn project(&self, arg: Option<&str>) -> Result<String> {
        arg.or(self.config.tracker.project_id.as_deref())
            .map(str::to_string)
            .ok_or_else(|| {
                eyre!("no project given: pass --project or set tracker.project_id in the config")
            })
    }

    async fn bridge(&self) -> Result<Arc<Bridge>> {
        Ok(Arc::new(Bridge::spawn(&self.config.bridge).await?))
    }

    fn assistant(&self, bridge: &Arc<Bridge>) -> Assistant {
        Assistant::new(
            Arc::new(BridgeGenerator(Arc::clone(bridge))),
            ConversationStore::from_config(&self.config.conversation),
            AssistantOptions::from_config(&self.config),
        )
    }

    /// Fetch the project's tasks through a short-lived bridge.
    async fn fetch_tasks(&self, project: &str) -> Result<Vec<ExternalTask>> {
        let bridge = self.bridge().await?;
        let tasks = BridgeTracker(Arc::clone(&bridge)).list_tasks(project).await;
        shutdown_bridge(&bridge).await;
        let tasks = tasks?;
        info!(project, tasks = tasks.len(), "fetched tasks");
        Ok(tasks)
    }
}

async fn shutdown_bridge(bridge: &Bridge) {
    if let Err(e) = bridge.shutdown().await {
        warn!(error = %e, "bridge did not shut down cleanly");
    }
}

// ---------------------------------------------------------------------------
// Methodology commands
// ---------------------------------------------------------------------------

fn describe_diagnostic(kind: &DiagnosticKind) -> String {
    match kind {
        DiagnosticKind::MalformedPhaseHeading => "malformed phase heading".into(),
        DiagnosticKind::DuplicatePhaseIndex { index } => format!("duplicate phase {index}"),
        DiagnosticKind::NonIncreasingPhaseIndex { index, previous } => {
            format!("phase {index} follows phase {previous}")
        }
        DiagnosticKind::EmptySubsection { phase, section } => {
            format!("empty {} in phase {phase}", section.heading())
        }
    }
}

fn cmd_parse(ctx: &Context) -> Result<()> {
    let document = ctx.document()?;

    println!();
    println!("  Methodology: {}", ctx.methodology_path.display());
    println!("  Hash:        {}", document.content_hash);
    println!("  Phases:      {}", document.phases.len());
    for phase in &document.phases {
        let sections: Vec<String> = phase
            .sections()
            .map(|(kind, items)| format!("{} {}", items.len(), kind.as_str()))
            .collect();
        let duration = phase
            .time_range
            .as_deref()
            .map(|t| format!(" ({t})"))
            .unwrap_or_default();
        println!("    {}{duration}  [{}]", phase.heading(), sections.join(", "));
    }
    if !document.sections.is_empty() {
        let names: Vec<&str> = document.sections.iter().map(|s| s.name.as_str()).collect();
        println!("  Sections:    {}", names.join(", "));
    }

    if document.diagnostics.is_empty() {
        println!("  Diagnostics: none");
    } else {
        println!("  Diagnostics: {}", document.diagnostics.len());
        for diagnostic in &document.diagnostics {
            println!(
                "    line {}: {} ({})",
                diagnostic.line,
                describe_diagnostic(&diagnostic.kind),
                diagnostic.text
            );
        }
    }
    if !document.has_phases() {
        warn!("no phases found; answers will rely on the overview only");
    }
    println!();

    Ok(())
}

fn cmd_phase(ctx: &Context, index: u32) -> Result<()> {
    let document = ctx.document()?;
    let phase = document.phase(index).ok_or_else(|| {
        let known: Vec<String> = document.phases.iter().map(|p| p.index.to_string()).collect();
        eyre!("phase {index} not found (document has phases: {})", known.join(", "))
    })?;
    println!("{}", render_phase(phase));
    Ok(())
}

// ---------------------------------------------------------------------------
// Question answering
// ---------------------------------------------------------------------------

fn print_answer(answer: &Answer) {
    println!("{}", answer.text.trim());
    let source = match &answer.grounding {
        Grounding::Matched { phases } => {
            let list: Vec<String> = phases.iter().map(u32::to_string).collect();
            format!("phase {}", list.join(", "))
        }
        Grounding::Hinted { phase } => format!("phase {phase} (from the conversation)"),
        Grounding::Overview => "the methodology overview".into(),
    };
    println!("\n  (based on {source})\n");
}

async fn cmd_ask(ctx: &Context, question: &str) -> Result<()> {
    validate_api_key(&ctx.config)?;
    let document = ctx.document()?;
    let bridge = ctx.bridge().await?;

    let answer = ctx.assistant(&bridge).ask("cli", question, &document).await;
    shutdown_bridge(&bridge).await;

    print_answer(&answer?);
    Ok(())
}

async fn cmd_chat(ctx: &Context) -> Result<()> {
    validate_api_key(&ctx.config)?;
    let document = ctx.document()?;
    let bridge = ctx.bridge().await?;
    let assistant = ctx.assistant(&bridge);
    let session_id = format!("chat-{}", std::process::id());

    println!("Ask about the methodology. Type 'reset' to start over, 'exit' to quit.");
    let outcome = chat_loop(&assistant, &document, &session_id).await;
    shutdown_bridge(&bridge).await;
    outcome
}

async fn chat_loop(assistant: &Assistant, document: &Document, session_id: &str) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            return Ok(());
        };
        let question = line.trim();
        match question.to_ascii_lowercase().as_str() {
            "" => continue,
            "exit" | "quit" | "bye" => return Ok(()),
            "reset" => {
                assistant.reset(session_id);
                println!("Conversation reset.");
                continue;
            }
            _ => {}
        }

        match assistant.ask(session_id, question, document).await {
            Ok(answer) => print_answer(&answer),
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => eprintln!("error: {e}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Enrichment
// ---------------------------------------------------------------------------

async fn cmd_enrich(
    ctx: &Context,
    limit: Option<usize>,
    project: Option<&str>,
    prune: bool,
) -> Result<()> {
    validate_api_key(&ctx.config)?;
    let project = ctx.project(project)?;
    let storage = ctx.storage().await?;
    let document = ctx.document_with_store(&storage).await?;
    if !document.has_phases() {
        return Err(eyre!(
            "no phases found in '{}'; nothing to match tasks against",
            ctx.methodology_path.display()
        ));
    }

    info!(project = %project, ?limit, prune, "enriching tasks");

    let bridge = ctx.bridge().await?;
    let outcome = enrich_via_bridge(ctx, &bridge, &storage, &document, &project, limit, prune).await;
    shutdown_bridge(&bridge).await;
    let report = outcome?;

    println!();
    if report.cancelled {
        println!("  Enrichment cancelled.");
    } else {
        println!("  Enrichment finished.");
    }
    println!("  Applied:    {}", report.applied.len());
    println!("  Up to date: {}", report.skipped_up_to_date.len());
    println!("  No match:   {}", report.skipped_no_match.len());
    println!("  Busy:       {}", report.busy.len());
    println!("  Failed:     {}", report.failures.len());
    for failure in &report.failures {
        println!("    {} ({:?}): {}", failure.task_id, failure.kind, failure.message);
    }
    println!("  Tokens:     {} in / {} out", report.tokens_in, report.tokens_out);
    println!();

    Ok(())
}

async fn enrich_via_bridge(
    ctx: &Context,
    bridge: &Arc<Bridge>,
    storage: &Storage,
    document: &Document,
    project: &str,
    limit: Option<usize>,
    prune: bool,
) -> Result<EnrichmentReport> {
    let generator = BridgeGenerator(Arc::clone(bridge));
    let tracker = BridgeTracker(Arc::clone(bridge));

    let tasks = tracker.list_tasks(project).await?;
    info!(project, tasks = tasks.len(), "fetched tasks");

    if prune {
        let existing: HashSet<String> = tasks.iter().map(|t| t.id.clone()).collect();
        let removed = prune_records(storage, &existing).await?;
        println!("  Pruned {} record(s) of deleted tasks", removed.len());
    }

    let cancel = CancelFlag::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("cancellation requested, stopping after the current task");
                cancel.cancel();
            }
        })
    };

    let run_id = storage.insert_run().await?;
    let pipeline = EnrichmentPipeline::new(
        &generator,
        &tracker,
        storage,
        EnrichmentPolicy::from_config(&ctx.config),
    );
    let progress = CliProgress::new();
    let result = pipeline.run(&tasks, document, limit, &cancel, &progress).await;
    progress.bar.finish_and_clear();
    watcher.abort();

    let report = result?;
    storage
        .finish_run(&run_id, &serde_json::to_string(&report)?)
        .await?;
    Ok(report)
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// Enrichment progress shown as an indicatif bar.
struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} [{pos}/{len}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        bar.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { bar }
    }
}

impl EnrichmentProgress for CliProgress {
    fn task_progress(&self, current: usize, total: usize, detail: &str) {
        self.bar.set_length(total as u64);
        self.bar.set_position(current as u64);
        self.bar.set_message(detail.to_string());
    }

    fn finished(&self, _report: &EnrichmentReport) {
        self.bar.finish_and_clear();
    }
}

// ---------------------------------------------------------------------------
// Reporting
// ---------------------------------------------------------------------------

async fn cmd_status(ctx: &Context, project: Option<&str>) -> Result<()> {
    let project = ctx.project(project)?;
    let storage = ctx.reporting_storage().await?;
    let document = match &storage {
        Some(storage) => ctx.document_with_store(storage).await?,
        None => ctx.document()?,
    };
    let tasks = ctx.fetch_tasks(&project).await?;
    let records = match &storage {
        Some(storage) => storage.list_records().await?,
        None => Vec::new(),
    };

    let report = status_report(&tasks, &document, &records, Utc::now().date_naive());
    let totals = &report.totals;

    println!();
    println!("  Project:     {project}");
    println!(
        "  Tasks:       {} ({} done, {} open, {:.0}% complete)",
        totals.total, totals.completed, totals.incomplete, totals.percent_complete
    );
    println!("  Unassigned:  {}", totals.unassigned);
    println!("  Overdue:     {}", totals.overdue);
    println!();
    for phase in &report.phases {
        println!(
            "    Phase {:<3} {:<40} {}/{}",
            phase.index, phase.title, phase.completed, phase.total
        );
    }
    if report.unattributed > 0 {
        println!("    {} task(s) not tied to a phase", report.unattributed);
    }

    let last_run = match &storage {
        Some(storage) => storage.last_run().await?,
        None => None,
    };
    match last_run {
        Some(run) => {
            let state = match run.finished_at {
                Some(finished) => format!("finished {}", finished.format("%Y-%m-%d %H:%M")),
                None => "did not finish".into(),
            };
            println!();
            println!(
                "  Last enrichment: {} ({state})",
                run.started_at.format("%Y-%m-%d %H:%M")
            );
        }
        None => {
            println!();
            println!("  Last enrichment: never");
        }
    }
    println!();

    Ok(())
}

async fn cmd_tasks(ctx: &Context, project: Option<&str>, days: u32) -> Result<()> {
    let project = ctx.project(project)?;
    let tasks = ctx.fetch_tasks(&project).await?;
    let today = Utc::now().date_naive();
    let upcoming = upcoming_tasks(&tasks, today, days);

    println!();
    if upcoming.is_empty() {
        println!("  Nothing due in the next {days} day(s).");
    }
    for task in upcoming {
        let due = task
            .due_on
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_default();
        let overdue = if task.due_on.is_some_and(|d| d < today) {
            " (overdue)"
        } else {
            ""
        };
        let assignee = task.assignee.as_deref().unwrap_or("unassigned");
        println!("  {due}  {}  [{assignee}]{overdue}", task.title);
    }
    println!();

    Ok(())
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
