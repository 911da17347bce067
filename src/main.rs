use amenity_sync::config::SyncConfig;
use amenity_sync::export::export_to_path;
use amenity_sync::import::{run_import, ImportMode, ImportOptions};
use amenity_sync::parser::{parse_cutoff, ExtractFile};
use amenity_sync::store::FileStore;
use amenity_sync::sync::{reapply_topics, SyncEngine, SyncOptions};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, Instant};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "amenity-sync")]
#[command(about = "Reconcile a store of amenities with an OSM node extract")]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bulk import amenity and shop nodes without reconciliation
    Import(ImportArgs),
    /// Apply creates, updates and deletes from an extract to the store
    Reconcile(ReconcileArgs),
    /// Recompute topics of every stored record from its tags
    Retopic(RetopicArgs),
    /// Write the store as CSV
    Export(ExportArgs),
}

#[derive(Args)]
struct ImportArgs {
    /// insert: batched creates into an empty store; update: create missing records only
    #[arg(value_enum)]
    mode: ImportMode,

    /// Path to the OSM extract (.osm or .osm.bz2)
    #[arg(short, long)]
    input: PathBuf,

    /// Path to the store file (created if missing)
    #[arg(long)]
    store: PathBuf,

    /// Skip this many blocks of 1000 nodes before importing
    #[arg(long, default_value_t = 0)]
    skip: u64,

    /// JSON configuration with topics and category keys
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Args)]
struct ReconcileArgs {
    /// Path to the OSM extract (.osm or .osm.bz2)
    #[arg(short, long)]
    input: PathBuf,

    /// Path to the store file (created if missing)
    #[arg(long)]
    store: PathBuf,

    /// Nodes modified on or after this date (YYYY-MM-DD, UTC) count as changed
    #[arg(long, value_parser = parse_cutoff)]
    since: DateTime<Utc>,

    /// Delete stored records missing from the extract
    #[arg(long)]
    delete: bool,

    /// JSON configuration with topics, category keys and protected ids
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Args)]
struct RetopicArgs {
    /// Path to the store file
    #[arg(long)]
    store: PathBuf,

    /// JSON configuration providing the topic rules
    #[arg(long)]
    config: PathBuf,
}

#[derive(Args)]
struct ExportArgs {
    /// Path to the store file
    #[arg(long)]
    store: PathBuf,

    /// Output CSV path
    #[arg(short, long)]
    output: PathBuf,
}

fn spinner() -> ProgressBar {
    let progress = ProgressBar::new_spinner();
    progress.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.cyan} [{elapsed_precise}] {pos} nodes {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    progress.enable_steady_tick(Duration::from_millis(100));
    progress
}

fn open_store(path: &Path) -> Result<FileStore> {
    FileStore::open(path).with_context(|| format!("Failed to open store: {}", path.display()))
}

fn run_import_cmd(args: ImportArgs) -> Result<()> {
    let config = SyncConfig::load_or_default(args.config.as_deref())?;
    let mut store = open_store(&args.store)?;
    let source = ExtractFile::new(&args.input);

    let start = Instant::now();
    let options = ImportOptions {
        mode: args.mode,
        skip_batches: args.skip,
    };
    let summary = run_import(&source, &mut store, &config.mapper(), &options, &spinner())?;
    let duration = start.elapsed();

    println!();
    println!("=== Summary ===");
    println!("Import time:        {:.2}s", duration.as_secs_f64());
    println!("Extract:            {}", source.path().display());
    println!("Store:              {}", store.path().display());
    println!("Created:            {}", summary.created);
    println!("Already stored:     {}", summary.existing);
    println!("Checkpoints:        {}", summary.checkpoints);
    println!("Records in store:   {}", store.len());

    Ok(())
}

fn run_reconcile(args: ReconcileArgs) -> Result<()> {
    let config = SyncConfig::load_or_default(args.config.as_deref())?;
    let registry = config.registry();
    let mut store = open_store(&args.store)?;
    let source = ExtractFile::new(&args.input);

    let options = SyncOptions::new(args.since).delete_obsolete(args.delete || config.delete_obsolete);
    info!(
        input = %args.input.display(),
        store = %args.store.display(),
        consultants = registry.len(),
        delete = options.delete_obsolete,
        "Starting run"
    );

    let start = Instant::now();
    let report = SyncEngine::new(&source, &mut store, &registry, config.mapper(), options)
        .with_progress(spinner())
        .reconcile()?;
    let duration = start.elapsed();

    println!();
    println!("=== Summary ===");
    println!("Run time:           {:.2}s", duration.as_secs_f64());
    println!("Generation:         {}", report.generation);
    println!("Extract:            {}", source.path().display());
    println!("Store:              {}", store.path().display());
    println!();
    println!("Stored before run:  {}", report.existing);
    println!("Nodes in extract:   {}", report.current);
    println!("Changed nodes:      {}", report.changed);
    println!("Already applied:    {}", report.applied);
    println!();
    println!("Created:            {}", report.created);
    println!("Updated:            {}", report.updated);
    println!("Obsolete:           {}", report.obsolete);
    println!("Deleted:            {}", report.deleted);
    println!("Kept (in use):      {}", report.kept);
    println!("Vetoed updates:     {}", report.vetoed);
    if report.missing > 0 {
        println!("Missing targets:    {}", report.missing);
    }

    Ok(())
}

fn run_retopic(args: RetopicArgs) -> Result<()> {
    let config = SyncConfig::load(&args.config)?;
    let Some(rules) = config.topics else {
        bail!("Config file has no topics: {}", args.config.display());
    };
    let mut store = open_store(&args.store)?;

    let updated = reapply_topics(&mut store, &rules)?;

    println!();
    println!("=== Summary ===");
    println!("Topics changed:     {}", updated);
    println!("Store:              {}", store.path().display());
    println!("Records in store:   {}", store.len());

    Ok(())
}

fn run_export(args: ExportArgs) -> Result<()> {
    let store = open_store(&args.store)?;
    let rows = export_to_path(&store, &args.output)?;

    println!();
    println!("=== Summary ===");
    println!("Rows written:       {}", rows);
    println!("Output:             {}", args.output.display());

    Ok(())
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
        Commands::Import(args) => run_import_cmd(args),
        Commands::Reconcile(args) => run_reconcile(args),
        Commands::Retopic(args) => run_retopic(args),
        Commands::Export(args) => run_export(args),
    };

    match result {
        Ok(()) => {
            info!("Completed successfully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Error: {:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
