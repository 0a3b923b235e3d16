use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use miette::{IntoDiagnostic, Result};

use strata_analytics::{CommitState, Hotspot};
use strata_core::{
    AnalysisEvent, CommitSummary, CouplingEdge, EventPayload, FileOwnership, OutputFormat,
    RiskScore, StrataConfig, SECONDS_PER_DAY,
};
use strata_engine::{
    AggregateStore, CancellationToken, Delivery, DeliveryStatus, EventPublisher, QueryService,
    RepoSummary, RetryPolicy, ScanReport, Scanner, SqliteStore, TimelinePage, TimelineQuery,
};
use strata_history::GitRepository;

#[derive(Parser)]
#[command(
    name = "strata",
    version,
    about = "Commit-history intelligence for git repositories",
    long_about = "Strata mines git history into per-commit risk scores, decayed file ownership\n\
                  and temporal coupling between files. Scans are incremental and resumable:\n\
                  every batch is checkpointed, so an interrupted scan picks up where it stopped.\n\n\
                  Examples:\n  \
                    strata scan                       Analyze new commits of the current repo\n  \
                    strata risk 3f2a9c1               Show the risk score of a commit\n  \
                    strata owners src/lib.rs          Owners and bus factor of a file\n  \
                    strata coupling src/lib.rs        Files that change together with it\n  \
                    strata hotspots --limit 10        Files ranked by change activity\n  \
                    strata watch                      Stream analysis events while rescanning"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file (default: .strata.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Repository path (default: current directory)
    #[arg(long, global = true, default_value = ".")]
    path: PathBuf,

    /// Output format
    #[arg(
        long,
        global = true,
        default_value = "text",
        long_help = "Output format for command results.\n\n\
                       Formats:\n  \
                         text      Human-readable tables and summaries (default)\n  \
                         json      Machine-readable JSON with camelCase keys\n  \
                         markdown  GitHub-flavored Markdown"
    )]
    format: OutputFormat,

    /// Enable verbose output
    #[arg(long, short, global = true)]
    verbose: bool,

    /// When to use colors
    #[arg(long, global = true, default_value = "auto")]
    color: ColorChoice,
}

#[derive(Subcommand)]
enum Command {
    /// Analyze commits not yet covered by the last checkpoint
    #[command(long_about = "Analyze commits not yet covered by the last checkpoint.\n\n\
        Walks the history in topological order, diffs commits in parallel and folds\n\
        them into risk, ownership and coupling aggregates. Each batch is stored\n\
        atomically together with its checkpoint.\n\n\
        Examples:\n  strata scan\n  strata scan --batch-size 100 --since-days 365")]
    Scan {
        /// Commits per checkpointed batch (overrides scan.batch_size)
        #[arg(long)]
        batch_size: Option<usize>,

        /// Only analyze commits from the last N days (overrides scan.window_days)
        #[arg(long, conflicts_with = "max_commits")]
        since_days: Option<u64>,

        /// Only analyze the newest N commits (overrides scan.max_commits)
        #[arg(long)]
        max_commits: Option<usize>,

        /// Diff worker threads, 0 for all cores (overrides scan.workers)
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Show the risk score of a commit
    #[command(long_about = "Show the risk score of a commit.\n\n\
        Accepts a full sha or an unambiguous prefix. The score is recomputed whenever\n\
        a later bug fix is attributed to the commit.\n\n\
        Examples:\n  strata risk 3f2a9c1\n  strata risk HEAD_SHA --fail-above 60")]
    Risk {
        /// Commit sha or unambiguous prefix
        sha: String,

        /// Exit with non-zero code if the score exceeds this threshold
        #[arg(
            long,
            long_help = "Exit with non-zero code if the risk score exceeds this threshold.\n\n\
                Scores range from 0 to 100. Useful in CI pipelines to gate risky commits."
        )]
        fail_above: Option<f64>,
    },
    /// Show the owners and bus factor of a file
    Owners {
        /// File path relative to the repository root
        file: String,
    },
    /// Show files that change together with a file
    Coupling {
        /// File path relative to the repository root
        file: String,

        /// Maximum neighbors to show (default: 20)
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// List analyzed commits in order
    Timeline {
        /// Rows per page (default: 50)
        #[arg(long, default_value = "50")]
        limit: usize,

        /// Continue after this cursor (printed by the previous page)
        #[arg(long)]
        cursor: Option<u64>,

        /// Only commits from the last N days
        #[arg(long)]
        since_days: Option<u64>,
    },
    /// Rank files by change activity
    Hotspots {
        /// Maximum results to show (default: 20)
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Repository-level metrics
    Summary,
    /// List commits whose diff exceeded its time budget
    Partial,
    /// Rescan periodically and stream analysis events
    #[command(long_about = "Rescan periodically and stream analysis events.\n\n\
        Prints every event in sequence order. A gap in the sequence triggers a resync\n\
        from the last checkpoint.\n\n\
        Examples:\n  strata watch\n  strata watch --interval 10 --format json")]
    Watch {
        /// Seconds between scans (default: 30)
        #[arg(long, default_value = "30")]
        interval: u64,

        /// Stop after this many scans
        #[arg(long)]
        polls: Option<usize>,
    },
    /// Create a default .strata.toml configuration file
    #[command(long_about = "Create a default .strata.toml configuration file.\n\n\
        Generates a commented-out template with all available options.\n\
        Fails if .strata.toml already exists.")]
    Init,
    /// Generate shell completion scripts
    #[command(hide = true)]
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Clone, PartialEq, Eq, ValueEnum)]
enum ColorChoice {
    /// Auto-detect based on terminal
    Auto,
    /// Always use colors
    Always,
    /// Never use colors
    Never,
}

fn print_welcome(use_color: bool) {
    let version = env!("CARGO_PKG_VERSION");

    if use_color {
        println!("\x1b[1mstrata\x1b[0m v{version}: risk, ownership and coupling from git history\n");

        println!("Quick start:");
        println!("  \x1b[36mstrata init\x1b[0m              Create a .strata.toml config file");
        println!("  \x1b[36mstrata scan\x1b[0m              Analyze the current repository");
        println!("  \x1b[36mstrata hotspots\x1b[0m          Find the most active files\n");

        println!("All commands:");
        println!("  \x1b[32mscan\x1b[0m      Incremental, checkpointed history analysis");
        println!("  \x1b[32mrisk\x1b[0m      Risk score of a commit");
        println!("  \x1b[32mowners\x1b[0m    Decayed ownership and bus factor of a file");
        println!("  \x1b[32mcoupling\x1b[0m  Files that change together");
        println!("  \x1b[32mtimeline\x1b[0m  Analyzed commits in order");
        println!("  \x1b[32mhotspots\x1b[0m  Files ranked by change activity");
        println!("  \x1b[32msummary\x1b[0m   Repository-level metrics");
        println!("  \x1b[32mwatch\x1b[0m     Stream analysis events");
        println!("  \x1b[32minit\x1b[0m      Create default configuration\n");
    } else {
        println!("strata v{version}: risk, ownership and coupling from git history\n");

        println!("Quick start:");
        println!("  strata init              Create a .strata.toml config file");
        println!("  strata scan              Analyze the current repository");
        println!("  strata hotspots          Find the most active files\n");

        println!("All commands:");
        println!("  scan      Incremental, checkpointed history analysis");
        println!("  risk      Risk score of a commit");
        println!("  owners    Decayed ownership and bus factor of a file");
        println!("  coupling  Files that change together");
        println!("  timeline  Analyzed commits in order");
        println!("  hotspots  Files ranked by change activity");
        println!("  summary   Repository-level metrics");
        println!("  watch     Stream analysis events");
        println!("  init      Create default configuration\n");
    }

    println!("Run 'strata <command> --help' for details.");
}

const DEFAULT_CONFIG: &str = r#"# Strata Configuration

[scan]
# batch_size = 500
# workers = 0                       # 0 uses every available core
# merge_policy = "first-parent"     # "first-parent" or "skip-merges"
# branch = "HEAD"
# window_days = 365
# max_commits = 10000
# diff_budget_ms = 2000
# blame_budget_ms = 5000
# rename_threshold = 0.5
# max_files_per_commit = 50

[risk]
# lines_cap = 400
# files_cap = 20
# test_patterns = ["(^|/)tests?/", "_test\\.", "\\.test\\.", "\\.spec\\.", "(^|/)test_"]

[risk.weights]
# magnitude = 0.25
# file_defects = 0.20
# test_gap = 0.15
# first_touch = 0.15
# own_defects = 0.25

# Ordered bug-fix rules; the first match wins and replaces the built-in set.
# [[risk.fix_rules]]
# name = "merge"
# pattern = "^Merge "
# action = "ignore"

[ownership]
# half_life_days = 180
# coverage = 0.5

[coupling]
# half_life_days = 180
# top_k = 20
# min_weight = 0.1
# min_co_changes = 1

[store]
# path = ".strata/strata.db"
# max_retries = 4
# backoff_ms = 50
# busy_timeout_ms = 5000
"#;

/// An opened repository with its store.
struct Workspace {
    repo: GitRepository,
    repo_id: String,
    store: AggregateStore,
}

impl Workspace {
    fn open(path: &Path, config: &StrataConfig) -> Result<Self> {
        if git2::Repository::discover(path).is_err() {
            miette::bail!(miette::miette!(
                help = "Run strata from inside a git repository, or specify --path to one",
                "Not a git repository: {}",
                path.display()
            ));
        }
        let repo = GitRepository::open(path)?;
        let repo_id = strata_engine::repo_id(repo.root())?;
        let db = repo.root().join(&config.store.path);
        tracing::debug!(repo = %repo_id, db = %db.display(), "opening store");
        let backend = SqliteStore::open(&db, Duration::from_millis(config.store.busy_timeout_ms))?;
        let store = AggregateStore::new(Arc::new(backend), RetryPolicy::from(&config.store));
        Ok(Self {
            repo,
            repo_id,
            store,
        })
    }

    fn query(&self, config: &StrataConfig) -> Result<QueryService> {
        if self.store.snapshot(&self.repo_id)?.is_none() {
            miette::bail!(miette::miette!(
                help = "Run `strata scan` first",
                "No analysis found for {}",
                self.repo.root().display()
            ));
        }
        Ok(QueryService::new(self.store.clone(), self.repo_id.clone(), config))
    }
}

fn load_config(cli: &Cli) -> Result<StrataConfig> {
    let config = match &cli.config {
        Some(path) => StrataConfig::from_file(path)?,
        None => {
            let local = cli.path.join(".strata.toml");
            if local.exists() {
                StrataConfig::from_file(&local)?
            } else {
                StrataConfig::default()
            }
        }
    };
    Ok(config)
}

fn init_logging(verbose: bool) {
    let default = if verbose {
        "warn,strata_history=debug,strata_analytics=debug,strata_engine=debug"
    } else {
        "warn"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn progress_bar() -> Option<indicatif::ProgressBar> {
    if !std::io::stderr().is_terminal() {
        return None;
    }
    let pb = indicatif::ProgressBar::new(0);
    let style = indicatif::ProgressStyle::with_template(
        "{spinner:.cyan} [{bar:40.cyan/blue}] {pos}/{len} commits ({elapsed})",
    )
    .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar());
    pb.set_style(style);
    Some(pb)
}

fn days_ago(days: u64) -> i64 {
    Utc::now().timestamp() - days as i64 * SECONDS_PER_DAY
}

fn format_time(ts: i64) -> String {
    DateTime::<Utc>::from_timestamp(ts, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

fn short(sha: &str) -> &str {
    &sha[..sha.len().min(10)]
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).into_diagnostic()?);
    Ok(())
}

fn run_scan(
    workspace: &Workspace,
    config: &StrataConfig,
    publisher: Arc<EventPublisher>,
    show_progress: bool,
) -> Result<ScanReport> {
    let scanner = Scanner::new(config.clone(), workspace.store.clone(), publisher)?;
    let cancel = CancellationToken::new();
    let bar = if show_progress { progress_bar() } else { None };

    let result = scanner.scan(&workspace.repo_id, &workspace.repo, &cancel, |progress| {
        if let Some(pb) = &bar {
            pb.set_length(progress.total as u64);
            pb.set_position(progress.done as u64);
        }
    });
    if let Some(pb) = &bar {
        pb.finish_and_clear();
    }

    match result {
        Ok(report) => Ok(report),
        Err(err) => {
            for warning in &err.report.warnings {
                eprintln!("warning: {warning}");
            }
            if err.report.batches > 0 {
                eprintln!(
                    "{} commits in {} batches were checkpointed before the failure",
                    err.report.commits_analyzed, err.report.batches
                );
            }
            Err(err.error.into())
        }
    }
}

fn render_scan(report: &ScanReport, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => print_json(report)?,
        OutputFormat::Markdown => {
            println!("# Scan Report\n");
            println!("- **Commits analyzed:** {}", report.commits_analyzed);
            println!("- **Batches:** {}", report.batches);
            println!("- **Partial commits:** {}", report.partial_commits.len());
            if let Some(snapshot) = &report.snapshot {
                println!("- **Total commits:** {}", snapshot.commits_analyzed);
                println!("- **Checkpoint:** {}", snapshot.sequence);
            }
            if !report.warnings.is_empty() {
                println!("\n## Warnings\n");
                for w in &report.warnings {
                    println!("- {w}");
                }
            }
        }
        OutputFormat::Text => {
            let total = report.snapshot.as_ref().map_or(0, |s| s.commits_analyzed);
            println!(
                "Analyzed {} new commits in {} batches ({} total).",
                report.commits_analyzed, report.batches, total
            );
            if !report.partial_commits.is_empty() {
                println!(
                    "{} commits have partial diffs; see `strata partial`.",
                    report.partial_commits.len()
                );
            }
            for w in &report.warnings {
                println!("  warning: {w}");
            }
        }
    }
    Ok(())
}

fn render_risk(commit: &CommitState, risk: &RiskScore, format: OutputFormat) -> Result<()> {
    let f = &risk.factors;
    match format {
        OutputFormat::Json => print_json(risk)?,
        OutputFormat::Markdown => {
            println!("# Risk: `{}`\n", short(&risk.sha));
            println!("**Score:** {:.1} ({})\n", risk.score, risk.level());
            println!("| Factor | Value |");
            println!("|--------|-------|");
            println!("| Magnitude | {:.2} |", f.magnitude);
            println!("| File defects | {:.2} |", f.file_defects);
            println!("| Test gap | {:.2} |", f.test_gap);
            println!("| First touch | {:.2} |", f.first_touch);
            println!("| Own defects | {:.2} |", f.own_defects);
        }
        OutputFormat::Text => {
            println!(
                "{}  {}  {}",
                short(&risk.sha),
                commit.author,
                format_time(commit.timestamp)
            );
            println!("{:-<72}", "");
            println!("  Score:         {:.1} ({})", risk.score, risk.level());
            println!("  Magnitude:     {:.2}", f.magnitude);
            println!("  File defects:  {:.2}", f.file_defects);
            println!("  Test gap:      {:.2}", f.test_gap);
            println!("  First touch:   {:.2}", f.first_touch);
            println!("  Own defects:   {:.2}", f.own_defects);
            if commit.bug_fix {
                println!("  Bug fix:       yes");
            }
            if commit.partial {
                println!("  Partial diff:  awaiting reprocessing");
            }
        }
    }
    Ok(())
}

fn render_owners(ownership: &FileOwnership, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => print_json(ownership)?,
        OutputFormat::Markdown => {
            println!("# Ownership: `{}`\n", ownership.path);
            println!("**Bus factor:** {}\n", ownership.bus_factor);
            println!("| Contributor | Share |");
            println!("|-------------|-------|");
            for owner in &ownership.owners {
                println!("| {} | {:.1}% |", owner.contributor, owner.share * 100.0);
            }
        }
        OutputFormat::Text => {
            println!("{} (bus factor {})", ownership.path, ownership.bus_factor);
            println!("{:-<72}", "");
            for owner in &ownership.owners {
                println!("  {:<48} {:>6.1}%", owner.contributor, owner.share * 100.0);
            }
        }
    }
    Ok(())
}

fn render_coupling(file: &str, edges: &[CouplingEdge], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => print_json(edges)?,
        OutputFormat::Markdown => {
            println!("# Temporal Coupling: `{file}`\n");
            if edges.is_empty() {
                println!("No significant coupling detected.");
                return Ok(());
            }
            println!("| File | Weight | Co-changes | Last changed |");
            println!("|------|--------|------------|--------------|");
            for edge in edges {
                println!(
                    "| `{}` | {:.2} | {} | {} |",
                    edge.other(file).unwrap_or_default(),
                    edge.weight,
                    edge.co_changes,
                    format_time(edge.last_updated),
                );
            }
        }
        OutputFormat::Text => {
            println!("Temporal coupling of {file}:");
            println!("{:-<72}", "");
            if edges.is_empty() {
                println!("  No significant coupling detected.");
            }
            for edge in edges {
                println!(
                    "  {:<48} weight={:.2}  co-changes={}",
                    edge.other(file).unwrap_or_default(),
                    edge.weight,
                    edge.co_changes,
                );
            }
        }
    }
    Ok(())
}

fn render_commits(title: &str, rows: &[CommitSummary], format: OutputFormat) {
    match format {
        OutputFormat::Markdown => {
            println!("# {title}\n");
            println!("| Commit | Author | Date | Risk | Fix |");
            println!("|--------|--------|------|------|-----|");
            for row in rows {
                println!(
                    "| `{}` | {} | {} | {:.1} | {} |",
                    short(&row.sha),
                    row.author,
                    format_time(row.timestamp),
                    row.risk_score,
                    if row.bug_fix { "yes" } else { "" },
                );
            }
        }
        _ => {
            println!("{title}:");
            println!("{:-<72}", "");
            for row in rows {
                let flag = match (row.bug_fix, row.partial) {
                    (_, true) => " partial",
                    (true, false) => " fix",
                    (false, false) => "",
                };
                println!(
                    "  {}  {}  risk={:>5.1}  {}{flag}",
                    short(&row.sha),
                    format_time(row.timestamp),
                    row.risk_score,
                    row.author,
                );
            }
        }
    }
}

fn render_timeline(page: &TimelinePage, format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        return print_json(page);
    }
    render_commits("Timeline", &page.items, format);
    if let Some(cursor) = page.next_cursor {
        println!("\nMore rows: --cursor {cursor}");
    }
    Ok(())
}

fn render_hotspots(hotspots: &[Hotspot], limit: usize, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => print_json(hotspots)?,
        OutputFormat::Markdown => {
            println!("## Hotspots\n");
            if hotspots.is_empty() {
                println!("No hotspots detected.");
                return Ok(());
            }
            println!("| Rank | File | Score | Revisions | Churn | Fixes |");
            println!("|------|------|-------|-----------|-------|-------|");
            for (i, h) in hotspots.iter().enumerate() {
                println!(
                    "| {} | `{}` | {:.2} | {} | {} | {} |",
                    i + 1,
                    h.path,
                    h.score,
                    h.revisions,
                    h.churn,
                    h.fixes,
                );
            }
        }
        OutputFormat::Text => {
            println!("Hotspots (top {limit}):");
            println!("{:-<72}", "");
            for (i, h) in hotspots.iter().enumerate() {
                println!(
                    "{:>2}. {:<40} score={:.2}  rev={}  churn={}  fixes={}",
                    i + 1,
                    h.path,
                    h.score,
                    h.revisions,
                    h.churn,
                    h.fixes,
                );
            }
        }
    }
    Ok(())
}

fn render_summary(summary: &RepoSummary, format: OutputFormat) -> Result<()> {
    let window = match (summary.window_start, summary.window_end) {
        (Some(start), Some(end)) => format!("{} .. {}", format_time(start), format_time(end)),
        _ => "empty".to_string(),
    };
    match format {
        OutputFormat::Json => print_json(summary)?,
        OutputFormat::Markdown => {
            println!("# Repository Summary\n");
            println!("- **Commits analyzed:** {}", summary.commits_analyzed);
            println!("- **Window:** {window}");
            println!("- **Files tracked:** {}", summary.files_tracked);
            println!("- **Bug-fix commits:** {}", summary.bug_fixes);
            println!("- **Partial commits:** {}", summary.partial_commits);
            println!("- **Mean risk:** {:.1}", summary.mean_risk);
            println!("- **Files with bus factor 1:** {}", summary.bus_factor_one);
        }
        OutputFormat::Text => {
            println!("Repository {}", summary.repo_id);
            println!("{:-<72}", "");
            println!("  Commits analyzed:   {}", summary.commits_analyzed);
            println!("  Window:             {window}");
            println!("  Files tracked:      {}", summary.files_tracked);
            println!("  Bug-fix commits:    {}", summary.bug_fixes);
            println!("  Partial commits:    {}", summary.partial_commits);
            println!("  Mean risk:          {:.1}", summary.mean_risk);
            println!("  Bus factor 1 files: {}", summary.bus_factor_one);
        }
    }
    Ok(())
}

fn render_event(delivery: &Delivery, format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string(&delivery.event).into_diagnostic()?);
        return Ok(());
    }
    let AnalysisEvent {
        sequence_number,
        event_type,
        payload,
        ..
    } = &delivery.event;
    let detail = match payload {
        EventPayload::CommitsAnalyzed {
            shas,
            changed_files,
            rescored,
        } => format!(
            "{} commits, {} files changed, {} rescored",
            shas.len(),
            changed_files.len(),
            rescored.len()
        ),
        EventPayload::SnapshotAdvanced { snapshot } => format!(
            "checkpoint {} ({} commits)",
            snapshot.sequence, snapshot.commits_analyzed
        ),
        EventPayload::ScanFailed { message } => message.clone(),
    };
    match format {
        OutputFormat::Markdown => println!("- `#{sequence_number}` **{event_type}**: {detail}"),
        _ => println!("#{sequence_number:<6} {:<18} {detail}", event_type.to_string()),
    }
    Ok(())
}

fn run_watch(
    workspace: &Workspace,
    config: &StrataConfig,
    interval: u64,
    polls: Option<usize>,
    format: OutputFormat,
) -> Result<()> {
    let publisher = Arc::new(EventPublisher::default());
    let mut subscription = publisher.subscribe();
    let query = QueryService::new(workspace.store.clone(), workspace.repo_id.clone(), config);
    let mut round = 0usize;

    loop {
        round += 1;
        if let Err(e) = run_scan(workspace, config, Arc::clone(&publisher), false) {
            eprintln!("scan failed: {e}");
        }
        while let Some(delivery) = subscription.try_recv() {
            match delivery.status {
                DeliveryStatus::InOrder => render_event(&delivery, format)?,
                DeliveryStatus::Duplicate => {
                    tracing::debug!(seq = delivery.event.sequence_number, "duplicate event");
                }
                DeliveryStatus::Gap { expected } => {
                    tracing::warn!(
                        expected,
                        got = delivery.event.sequence_number,
                        "event gap, resyncing from checkpoint"
                    );
                    let resync = query.resync()?;
                    let sequence = resync.snapshot.as_ref().map_or(0, |s| s.event_sequence);
                    eprintln!(
                        "resynced at event {sequence}: {} commits, {} owned files, {} coupled pairs",
                        resync.timeline.len(),
                        resync.ownership.len(),
                        resync.coupling.len()
                    );
                    subscription.resynced(&workspace.repo_id, sequence);
                    if delivery.event.sequence_number > sequence {
                        render_event(&delivery, format)?;
                    }
                }
            }
        }
        if polls.is_some_and(|max| round >= max) {
            return Ok(());
        }
        std::thread::sleep(Duration::from_secs(interval));
    }
}

fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .build(),
        )
    }))
    .into_diagnostic()?;
    human_panic::setup_panic!();

    let cli = Cli::parse();
    init_logging(cli.verbose);

    let use_color = match cli.color {
        ColorChoice::Always => true,
        ColorChoice::Never => false,
        ColorChoice::Auto => std::io::stdout().is_terminal() && std::env::var("NO_COLOR").is_err(),
    };

    let Some(command) = &cli.command else {
        print_welcome(use_color);
        return Ok(());
    };

    match command {
        Command::Init => {
            let path = cli.path.join(".strata.toml");
            if path.exists() {
                miette::bail!(".strata.toml already exists");
            }
            std::fs::write(&path, DEFAULT_CONFIG).into_diagnostic()?;
            println!("Created .strata.toml with default configuration");
            return Ok(());
        }
        Command::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(*shell, &mut cmd, "strata", &mut std::io::stdout());
            return Ok(());
        }
        _ => {}
    }

    let mut config = load_config(&cli)?;
    if cli.verbose {
        eprintln!("format: {}", cli.format);
        eprintln!(
            "merge policy: {}, batch size: {}",
            config.scan.merge_policy, config.scan.batch_size
        );
    }
    let workspace = Workspace::open(&cli.path, &config)?;

    match command {
        Command::Scan {
            batch_size,
            since_days,
            max_commits,
            workers,
        } => {
            if let Some(n) = batch_size {
                config.scan.batch_size = *n;
            }
            if let Some(days) = since_days {
                config.scan.window_days = Some(*days);
                config.scan.max_commits = None;
            }
            if let Some(n) = max_commits {
                config.scan.max_commits = Some(*n);
                config.scan.window_days = None;
            }
            if let Some(n) = workers {
                config.scan.workers = *n;
            }
            config.validate()?;

            eprintln!("Scanning {}...", workspace.repo.root().display());
            let publisher = Arc::new(EventPublisher::default());
            let report = run_scan(&workspace, &config, publisher, true)?;
            render_scan(&report, cli.format)?;
        }
        Command::Risk { sha, fail_above } => {
            let query = workspace.query(&config)?;
            let commit = query.commit(sha)?;
            let risk = query.risk(&commit.sha)?;
            render_risk(&commit, &risk, cli.format)?;

            if let Some(threshold) = fail_above {
                if risk.score > *threshold {
                    eprintln!(
                        "risk {:.1} exceeds threshold {threshold:.1}",
                        risk.score
                    );
                    std::process::exit(1);
                }
            }
        }
        Command::Owners { file } => {
            let query = workspace.query(&config)?;
            render_owners(&query.ownership(file)?, cli.format)?;
        }
        Command::Coupling { file, limit } => {
            let query = workspace.query(&config)?;
            let edges: Vec<CouplingEdge> = query.coupling(file)?.into_iter().take(*limit).collect();
            render_coupling(file, &edges, cli.format)?;
        }
        Command::Timeline {
            limit,
            cursor,
            since_days,
        } => {
            let query = workspace.query(&config)?;
            let page = query.timeline(TimelineQuery {
                cursor: *cursor,
                limit: *limit,
                since: since_days.map(days_ago),
                until: None,
            })?;
            render_timeline(&page, cli.format)?;
        }
        Command::Hotspots { limit } => {
            let query = workspace.query(&config)?;
            render_hotspots(&query.hotspots(*limit)?, *limit, cli.format)?;
        }
        Command::Summary => {
            let query = workspace.query(&config)?;
            render_summary(&query.summary()?, cli.format)?;
        }
        Command::Partial => {
            let query = workspace.query(&config)?;
            let partial = query.partial_commits()?;
            match cli.format {
                OutputFormat::Json => print_json(&partial)?,
                _ if partial.is_empty() => println!("No partial commits."),
                format => render_commits("Partial commits", &partial, format),
            }
        }
        Command::Watch { interval, polls } => {
            config.validate()?;
            run_watch(&workspace, &config, *interval, *polls, cli.format)?;
        }
        Command::Init | Command::Completions { .. } => {}
    }

    Ok(())
}
