use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use color_eyre::eyre::{eyre, Context, Result};
use comfy_table::presets::UTF8_BORDERS_ONLY;
use comfy_table::Table;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;
use wash_analysis::budget::CancellationToken;
use wash_analysis::config::{Algorithm, DetectionConfig};
use wash_analysis::flow_graph::FlowGraph;
use wash_analysis::pipeline::{run_detection, DetectionReport};
use wash_data::blacklist_file::{read_known, write_sorted};
use wash_data::loader::load_csv;
use wash_data::store::LedgerStore;

#[derive(Parser, Debug)]
#[command(name = "wash-detect")]
#[command(about = "Wash-trade detection over transfer records")]
#[command(version)]
struct Cli {
    #[arg(long, short = 'v', action = ArgAction::Count, global = true)]
    verbose: u8,

    #[arg(long, short = 'q', global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run detection and write the blacklisted address list.
    Detect(DetectArgs),
    /// Print flow graph statistics for a record file.
    Stats(StatsArgs),
    /// Print blacklist entries stored in a ledger.
    Ledger(LedgerArgs),
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

/// Arguments for the `detect` subcommand.
///
/// A `--config` JSON file is applied first; explicit flags override it.
#[derive(Args, Debug)]
struct DetectArgs {
    /// Transfer records CSV.
    #[arg(long)]
    input: PathBuf,

    /// Address list to merge with and overwrite, one address per line.
    #[arg(long)]
    output: Option<PathBuf>,

    /// JSON run configuration.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    threshold: Option<f64>,

    #[arg(long)]
    min_degree: Option<usize>,

    #[arg(long)]
    max_depth: Option<usize>,

    /// Restrict cycle start nodes to the N highest-degree addresses.
    #[arg(long)]
    max_candidates: Option<usize>,

    #[arg(long)]
    max_visits: Option<usize>,

    /// cycle, neighbor or both.
    #[arg(long)]
    algorithm: Option<Algorithm>,

    /// Wall-clock limit in seconds; partial results are reported.
    #[arg(long)]
    timeout: Option<u64>,

    #[arg(long)]
    max_steps: Option<u64>,

    /// Enumerate cycles on the rayon pool.
    #[arg(long)]
    parallel: bool,

    /// Build the graph in N rayon shards.
    #[arg(long, default_value_t = 1)]
    sharded: usize,

    /// SQLite ledger recording the run, its findings and the blacklist.
    #[arg(long)]
    ledger: Option<String>,

    #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
    format: OutputFormat,
}

#[derive(Args, Debug)]
struct StatsArgs {
    #[arg(long)]
    input: PathBuf,

    /// Degree used to count key nodes.
    #[arg(long, default_value_t = wash_analysis::config::DEFAULT_MIN_DEGREE)]
    min_degree: usize,
}

#[derive(Args, Debug)]
struct LedgerArgs {
    #[arg(long)]
    ledger: String,

    /// Run id; defaults to the latest run.
    #[arg(long)]
    run: Option<i64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet)?;

    match cli.command {
        Commands::Detect(args) => handle_detect(args).await,
        Commands::Stats(args) => handle_stats(args),
        Commands::Ledger(args) => handle_ledger(args),
    }
}

fn init_tracing(verbose: u8, quiet: bool) -> Result<()> {
    let level = if quiet {
        Level::WARN
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level.as_str()))
        .wrap_err("failed to initialize tracing filter")?;

    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

fn resolve_config(args: &DetectArgs) -> Result<DetectionConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .wrap_err_with(|| format!("failed to read config {}", path.display()))?;
            DetectionConfig::from_json(&json)
                .wrap_err_with(|| format!("invalid config {}", path.display()))?
        }
        None => DetectionConfig::default(),
    };

    if let Some(threshold) = args.threshold {
        config.suspicion_threshold = threshold;
    }
    if let Some(min_degree) = args.min_degree {
        config.min_degree_for_key_node = min_degree;
    }
    if let Some(max_depth) = args.max_depth {
        config.max_cycle_depth = max_depth;
    }
    if args.max_candidates.is_some() {
        config.max_candidate_nodes = args.max_candidates;
    }
    if let Some(max_visits) = args.max_visits {
        config.max_neighborhood_visits = max_visits;
    }
    if let Some(algorithm) = args.algorithm {
        config.algorithm = algorithm;
    }
    if args.timeout.is_some() {
        config.timeout_secs = args.timeout;
    }
    if args.max_steps.is_some() {
        config.max_search_steps = args.max_steps;
    }
    if args.parallel {
        config.parallel = true;
    }

    config.validate().wrap_err("invalid detection options")?;
    Ok(config)
}

async fn handle_detect(args: DetectArgs) -> Result<()> {
    if args.sharded == 0 {
        return Err(eyre!("--sharded must be at least 1"));
    }
    let config = resolve_config(&args)?;

    let records = load_csv(&args.input)
        .wrap_err_with(|| format!("failed to load records from {}", args.input.display()))?;

    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping detection");
            signal_token.cancel();
        }
    });

    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.green} {msg}")
            .wrap_err("failed to create progress style")?,
    );
    pb.set_message(format!("searching {} transfers", records.len()));
    pb.enable_steady_tick(std::time::Duration::from_millis(100));

    let run_config = config.clone();
    let shards = args.sharded;
    let report = tokio::task::spawn_blocking(move || run_detection(records, &run_config, &token, shards))
        .await
        .wrap_err("detection task failed")?
        .wrap_err("detection failed")?;

    pb.finish_and_clear();

    let mut written = None;
    if let Some(path) = &args.output {
        let known = read_known(path)
            .wrap_err_with(|| format!("failed to read address list {}", path.display()))?;
        let merged = report.blacklist.merge_known(&known);
        write_sorted(path, &merged)
            .wrap_err_with(|| format!("failed to write address list {}", path.display()))?;
        written = Some(merged.len());
    }

    let mut run_id = None;
    if let Some(ledger) = &args.ledger {
        run_id = Some(record_run(ledger, &report, &config)?);
    }

    match args.format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(&report)
                .wrap_err("failed to serialize report to JSON")?;
            println!("{json}");
        }
        OutputFormat::Table => print_report(&report, written, run_id),
    }

    info!(
        cycle_findings = report.cycle_findings.len(),
        pair_findings = report.pair_findings.len(),
        blacklisted = report.blacklist.len(),
        truncated = report.diagnostics.truncated,
        "detect command completed"
    );
    Ok(())
}

fn record_run(ledger: &str, report: &DetectionReport, config: &DetectionConfig) -> Result<i64> {
    let store = LedgerStore::new(ledger).wrap_err("failed to open SQLite ledger")?;
    let run_id = store
        .insert_run(&report.run_row(config))
        .wrap_err("failed to insert detection run")?;
    store
        .insert_findings(run_id, &report.finding_rows())
        .wrap_err("failed to insert findings")?;
    store
        .insert_blacklist(run_id, &report.blacklist.to_rows())
        .wrap_err("failed to insert blacklist entries")?;
    Ok(run_id)
}

fn print_report(report: &DetectionReport, written: Option<usize>, run_id: Option<i64>) {
    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Kind", "Addresses", "Txs", "Volume", "Rate"]);
    for finding in report.findings() {
        let nodes: Vec<String> = finding.nodes.iter().map(|n| truncate_hash(n)).collect();
        table.add_row(vec![
            finding.kind.as_str(),
            &nodes.join(" → "),
            &format!("{}", finding.transactions.len()),
            &format!("{:.4}", finding.volume()),
            &format!("{:.4}", finding.rate),
        ]);
    }
    println!("\n{table}\n");

    let diag = &report.diagnostics;
    let mut summary = Table::new();
    summary.load_preset(UTF8_BORDERS_ONLY);
    summary.set_header(vec!["Metric", "Value"]);
    summary.add_row(vec!["Records", &format!("{}", diag.records)]);
    summary.add_row(vec!["Addresses", &format!("{}", diag.nodes)]);
    summary.add_row(vec!["Edges", &format!("{}", diag.edges)]);
    summary.add_row(vec!["Cycles enumerated", &format!("{}", diag.cycles_enumerated)]);
    summary.add_row(vec!["Unique cycles", &format!("{}", diag.unique_cycles)]);
    summary.add_row(vec!["Expansions", &format!("{}", diag.expansions)]);
    summary.add_row(vec!["Pairs checked", &format!("{}", diag.pairs_checked)]);
    summary.add_row(vec!["Blacklisted", &format!("{}", report.blacklist.len())]);
    if let Some(total) = written {
        summary.add_row(vec!["Address list size", &format!("{total}")]);
    }
    if let Some(id) = run_id {
        summary.add_row(vec!["Ledger run id", &format!("{id}")]);
    }
    if diag.budget_events.depth_cap > 0 {
        summary.add_row(vec!["Depth-capped branches", &format!("{}", diag.budget_events.depth_cap)]);
    }
    if diag.budget_events.visit_budget > 0 {
        summary.add_row(vec!["Visit-capped expansions", &format!("{}", diag.budget_events.visit_budget)]);
    }
    if let Some(reason) = diag.budget_events.stopped {
        summary.add_row(vec!["Stopped early", &format!("{reason:?}")]);
    }
    println!("{summary}\n");
}

fn handle_stats(args: StatsArgs) -> Result<()> {
    let records = load_csv(&args.input)
        .wrap_err_with(|| format!("failed to load records from {}", args.input.display()))?;
    let graph = FlowGraph::build(records).wrap_err("failed to build flow graph")?;
    let stats = graph.stats();
    let key_nodes = graph.key_nodes(args.min_degree).len();

    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Metric", "Value"]);
    table.add_row(vec!["Records", &format!("{}", stats.records)]);
    table.add_row(vec!["Addresses", &format!("{}", stats.nodes)]);
    table.add_row(vec!["Edges", &format!("{}", stats.edges)]);
    table.add_row(vec!["Total volume", &format!("{:.4}", stats.total_volume)]);
    table.add_row(vec!["Max degree", &format!("{}", stats.max_degree)]);
    table.add_row(vec![
        &format!("Key nodes (degree ≥ {})", args.min_degree),
        &format!("{key_nodes}"),
    ]);
    println!("\n{table}\n");

    info!(nodes = stats.nodes, edges = stats.edges, "stats command completed");
    Ok(())
}

fn handle_ledger(args: LedgerArgs) -> Result<()> {
    ensure_exists(Path::new(&args.ledger))?;
    let store = LedgerStore::new(&args.ledger).wrap_err("failed to open SQLite ledger")?;
    let run_id = match args.run {
        Some(id) => id,
        None => store
            .latest_run_id()
            .wrap_err("failed to query latest run")?
            .ok_or_else(|| eyre!("ledger {} has no runs", args.ledger))?,
    };

    let entries = store
        .blacklist_for_run(run_id)
        .wrap_err_with(|| format!("failed to query blacklist for run {run_id}"))?;
    let findings = store
        .findings_for_run(run_id)
        .wrap_err_with(|| format!("failed to query findings for run {run_id}"))?;

    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Address", "Occurrences", "Volume", "Evidence"]);
    for entry in &entries {
        let evidence: Vec<String> = entry.evidence.iter().map(|tx| truncate_hash(&tx.tx_id)).collect();
        table.add_row(vec![
            &entry.address,
            &format!("{}", entry.occurrence_count),
            &format!("{:.4}", entry.accumulated_volume),
            &evidence.join(", "),
        ]);
    }
    println!("\nRun {run_id}: {} findings\n{table}\n", findings.len());

    info!(run_id, entries = entries.len(), "ledger command completed");
    Ok(())
}

/// Truncate a hex hash/address for compact table display.
fn truncate_hash(hash: &str) -> String {
    if hash.chars().count() > 14 {
        let chars: Vec<char> = hash.chars().collect();
        let head: String = chars[..8].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{head}…{tail}")
    } else {
        hash.to_string()
    }
}

fn ensure_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        return Err(eyre!("ledger {} does not exist", path.display()));
    }
    Ok(())
}
