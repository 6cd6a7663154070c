use anyhow::{Context, Result};
use ariadne::config;
use ariadne::convert::ConvertOptions;
use ariadne::customize::Customizations;
use ariadne::external::Pandoc;
use ariadne::source::JsonSnapshot;
use ariadne::stats::IntegrityReport;
use clap::{Args, Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, Instant};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "ariadne")]
#[command(about = "Migrate Redmine wikis into MediaWiki XML import dumps")]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a source snapshot and build the page, revision and file buckets
    Analyze(AnalyzeArgs),
    /// Convert every revision body to wikitext
    Convert(ConvertArgs),
    /// Copy attachment payloads and decode diagrams into the upload directory
    Extract(ExtractArgs),
    /// Write the MediaWiki XML import dump
    Compose(ComposeArgs),
    /// Report counts and integrity checks for a workspace
    Stats(StatsArgs),
}

#[derive(Args)]
struct AnalyzeArgs {
    /// Source snapshot (.json or .json.bz2)
    #[arg(short, long)]
    source: String,

    /// Workspace directory holding the buckets
    #[arg(short, long)]
    workspace: PathBuf,

    /// Customizations file (JSON)
    #[arg(short, long)]
    customizations: Option<PathBuf>,

    /// Remove existing buckets and outputs before starting
    #[arg(long)]
    clean: bool,
}

#[derive(Args)]
struct ConvertArgs {
    #[arg(short, long)]
    workspace: PathBuf,

    /// Markup converter executable
    #[arg(long, default_value = config::DEFAULT_CONVERTER)]
    converter: String,

    /// Extra argument passed to the converter before the dialect flags (repeatable)
    #[arg(long = "converter-arg")]
    converter_args: Vec<String>,

    /// Seconds before a converter call is killed
    #[arg(long, default_value_t = config::CONVERTER_TIMEOUT_SECS)]
    timeout: u64,

    /// Pages converted concurrently
    #[arg(long, default_value_t = config::DEFAULT_MAX_PARALLEL)]
    max_parallel: usize,

    /// Resume from last checkpoint if available
    #[arg(long)]
    resume: bool,

    /// Checkpoint interval in pages converted
    #[arg(long, default_value_t = config::CHECKPOINT_INTERVAL)]
    checkpoint_interval: u32,
}

#[derive(Args)]
struct ExtractArgs {
    #[arg(short, long)]
    workspace: PathBuf,

    /// Redmine attachment files directory
    #[arg(short, long)]
    files_dir: PathBuf,
}

#[derive(Args)]
struct ComposeArgs {
    #[arg(short, long)]
    workspace: PathBuf,

    /// Output XML file
    #[arg(short, long)]
    output: PathBuf,
}

#[derive(Args)]
struct StatsArgs {
    #[arg(short, long)]
    workspace: PathBuf,
}

fn run_analyze(args: AnalyzeArgs) -> Result<ExitCode> {
    if args.clean && args.workspace.exists() {
        info!("Cleaning workspace: {}", args.workspace.display());
        fs::remove_dir_all(&args.workspace)
            .with_context(|| format!("Failed to clean workspace: {}", args.workspace.display()))?;
    }
    fs::create_dir_all(&args.workspace)
        .with_context(|| format!("Failed to create workspace: {}", args.workspace.display()))?;

    let custom = match &args.customizations {
        Some(path) => Customizations::load(path)?,
        None => Customizations::default(),
    };

    let start = Instant::now();
    let source = JsonSnapshot::open(&args.source)?;
    let analysis = ariadne::analyze::run(&source, &custom, &args.workspace)?;

    println!();
    println!("=== Summary ===");
    println!("Analysis time:      {:.2}s", start.elapsed().as_secs_f64());
    println!();
    println!("Pages:              {}", analysis.pages.len());
    println!("Revisions:          {}", analysis.revision_count());
    println!("Attachments:        {}", analysis.attachments.len());
    println!("Diagrams:           {}", analysis.diagrams.len());
    println!("Missing authors:    {}", analysis.missing_authors);
    println!("Unresolved redirs:  {}", analysis.unresolved_redirects.len());

    Ok(ExitCode::SUCCESS)
}

fn run_convert(args: ConvertArgs) -> Result<ExitCode> {
    let converter = Pandoc::new(args.converter, Duration::from_secs(args.timeout))
        .with_args(args.converter_args);
    let options = ConvertOptions {
        max_parallel: args.max_parallel,
        resume: args.resume,
        checkpoint_interval: args.checkpoint_interval,
        show_progress: true,
    };

    let rt = tokio::runtime::Builder::new_multi_thread()
        .thread_name("ariadne-convert-worker")
        .enable_io()
        .enable_time()
        .build()?;

    let start = Instant::now();
    let summary = rt.block_on(ariadne::convert::run(&args.workspace, converter, &options))?;
    let stats = &summary.stats;

    println!();
    println!("=== Summary ===");
    println!("Conversion time:    {:.2}s", start.elapsed().as_secs_f64());
    println!();
    println!("Pages converted:    {}", summary.pages);
    println!("Resumed pages:      {}", summary.resumed_pages);
    println!("Revisions:          {}", stats.revisions_converted);
    println!("Links resolved:     {}", stats.links_resolved);
    println!("Links unresolved:   {}", stats.links_unresolved);
    println!("Converter calls:    {}", stats.converter_calls);
    println!("Converter failures: {}", stats.converter_failures);
    println!("Converter timeouts: {}", stats.converter_timeouts);
    println!("Code blocks:        {}", stats.code_blocks);
    println!("Macros expanded:    {}", stats.macros_expanded);
    println!("Missing titles:     {}", summary.missing_titles);
    println!("Missing attachments:{}", summary.missing_attachments);
    println!("Unresolved report:  {}", summary.csv_path.display());

    Ok(ExitCode::SUCCESS)
}

fn run_extract(args: ExtractArgs) -> Result<ExitCode> {
    let summary = ariadne::extract::run(&args.workspace, &args.files_dir)?;

    println!();
    println!("=== Summary ===");
    println!("Attachments copied: {}", summary.attachments_copied);
    println!("Attachments missing:{}", summary.attachments_missing);
    println!("Diagrams written:   {}", summary.diagrams_written);
    println!("Diagrams invalid:   {}", summary.diagrams_invalid);
    println!("Bytes written:      {}", summary.bytes_written);

    Ok(ExitCode::SUCCESS)
}

fn run_compose(args: ComposeArgs) -> Result<ExitCode> {
    let summary = ariadne::compose::run(&args.workspace, &args.output)?;

    println!();
    println!("=== Summary ===");
    println!("Pages written:      {}", summary.pages);
    println!("Revisions written:  {}", summary.revisions);
    println!("Raw fallbacks:      {}", summary.raw_fallbacks);
    println!("Output:             {}", args.output.display());

    Ok(ExitCode::SUCCESS)
}

fn print_report(report: &IntegrityReport) {
    println!();
    println!("=== Summary ===");
    println!("Native pages:       {}", report.native_pages);
    println!("Redirect pages:     {}", report.redirect_pages);
    println!("Attachment pages:   {}", report.attachment_pages);
    println!("Diagram pages:      {}", report.diagram_pages);
    println!("Revisions:          {}", report.revisions);
    println!("Missing authors:    {}", report.revisions_missing_author);
    println!("Converted:          {}/{}", report.converted_revisions, report.revisions);
    println!("Pages w/o revisions:{}", report.pages_without_revisions.len());
    println!("Unresolved links:   {}", report.unresolved_links);
    println!("Missing titles:     {}", report.missing_titles);
    println!("Missing attachments:{}", report.missing_attachments);
    println!("Unresolved redirs:  {}", report.unresolved_redirects);
    if report.has_integrity_failures() {
        println!();
        println!("=== Integrity failures ===");
        println!("Duplicate titles:   {:?}", report.duplicate_titles);
        println!("Broken chains:      {:?}", report.broken_chains);
        println!("Orphan revisions:   {:?}", report.orphan_revision_pages);
        println!("Misplaced ids:      {:?}", report.misplaced_ids);
    }
}

fn run_stats(workspace: &Path) -> Result<ExitCode> {
    let report = IntegrityReport::from_workspace(workspace)?;
    print_report(&report);
    if report.has_integrity_failures() {
        error!("Workspace failed integrity checks");
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    let result = match cli.command {
        Commands::Analyze(args) => run_analyze(args),
        Commands::Convert(args) => run_convert(args),
        Commands::Extract(args) => run_extract(args),
        Commands::Compose(args) => run_compose(args),
        Commands::Stats(args) => run_stats(&args.workspace),
    };

    match result {
        Ok(code) => {
            info!("Completed successfully");
            code
        }
        Err(e) => {
            error!("Error: {:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
