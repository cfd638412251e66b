use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use planometric_updates::{preflight, Config, MapTemplate, Pipeline, RunDate, RunSummary, SqliteBackend};

/// Planometric update workflow: changed structures → parcel feature set,
/// spreadsheet, per-parcel and overview map PDFs.
#[derive(Parser)]
#[command(name = "planometric-updates", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging (debug level).
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full update for one date.
    Run {
        /// Configuration file (JSON).
        #[arg(short, long)]
        config: PathBuf,

        /// Run date as YYYY-MM-DD (defaults to today).
        #[arg(short, long)]
        date: Option<String>,
    },

    /// Validate configuration, templates and source tables without writing anything.
    Check {
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Write the default configuration.
    InitConfig {
        /// Output file (defaults to stdout).
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose { "debug" } else { "info" })
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}

fn load_config(path: &Path) -> Result<Config> {
    Config::from_file(path).with_context(|| format!("Failed to load config: {}", path.display()))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Run { config, date } => run(&config, date.as_deref()),
        Commands::Check { config } => check(&config),
        Commands::InitConfig { output } => init_config(output),
    }
}

fn run(config_path: &Path, date: Option<&str>) -> Result<()> {
    println!("🗺️  Planometric Updates");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let config = load_config(config_path)?;
    let date = match date {
        Some(d) => RunDate::parse(d)?,
        None => RunDate::today(),
    };
    println!("\n📅 Run date: {}", date);

    let mut pipeline = Pipeline::open(config).context("Failed to open backend or map templates")?;
    let summary = pipeline
        .run(date)
        .with_context(|| format!("Planometric update for {} failed", date))?;

    print_summary(&summary);
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("✓ Filtered changes:   {}", summary.counts.filtered_changes);
    println!("✓ Distinct parcels:   {}", summary.counts.distinct_parcels);
    println!("✓ Parcel features:    {} ({})", summary.counts.selected_features, summary.feature_set);
    println!("✓ Spreadsheet:        {}", summary.spreadsheet.display());
    println!("✓ Parcel maps:        {}", summary.parcel_maps.len());
    println!("✓ Overview map:       {}", summary.overview_map.display());

    if !summary.unmatched.is_empty() {
        println!("\n⚠️  {} changed parcel(s) not found in the parcel layer:", summary.unmatched.len());
        for pin in &summary.unmatched {
            println!("   - {}", pin);
        }
    }

    println!("\n🎉 Run {} complete → {}", summary.run_id, summary.manifest.display());
}

fn check(config_path: &Path) -> Result<()> {
    println!("🔍 Checking {}", config_path.display());

    let config = load_config(config_path)?;
    println!("✓ Configuration valid ({} excluded types)", config.filter.excluded_types.len());

    for template in [&config.maps.base_template, &config.maps.overview_template] {
        let t = MapTemplate::from_file(template)
            .with_context(|| format!("Failed to load map template: {}", template.display()))?;
        println!("✓ Template '{}' → layer '{}'", t.name, t.layer().name);
    }

    // Source attached read-only to a scratch database; the output side is never opened
    let backend = SqliteBackend::inspect(&config.backend)
        .with_context(|| format!("Failed to open source: {}", config.backend.source_db.display()))?;
    let clause = preflight(&backend, &config)?;
    println!("✓ Source tables have every configured field");
    println!("\nChange filter:\n  {}", clause.sql);
    println!("  with {} bound value(s)", clause.params.len());

    Ok(())
}

fn init_config(output: Option<PathBuf>) -> Result<()> {
    let json = Config::default().to_json()?;
    match output {
        Some(path) => {
            fs::write(&path, json).with_context(|| format!("Failed to write {}", path.display()))?;
            println!("✓ Default configuration written to {}", path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}
