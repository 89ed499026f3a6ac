//! Q-SYS change group simulator
//!
//! Runs change group scenarios against a simulated core whose controls
//! drift, disappear and go offline.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;

use qsys_change_groups::ChangeGroupConfig;
use qsys_logging::{CoreContextGuard, QsysSubscriberBuilder};
use qsys_simulation::{ScenarioReport, SimConfig, scenarios};

#[derive(Parser)]
#[command(
    name = "qsys-sim",
    about = "Change group scenarios against a simulated Q-SYS core",
    version
)]
struct Cli {
    /// Human-readable multi-line log output
    #[arg(long, global = true)]
    pretty: bool,

    /// Log level or filter directive
    #[arg(long, global = true, default_value = "info")]
    level: String,

    /// Change group configuration file (TOML)
    #[arg(long, global = true, conflicts_with = "preset")]
    config: Option<PathBuf>,

    /// Built-in configuration: standard, responsive or low_memory
    #[arg(long, global = true)]
    preset: Option<String>,

    /// Keep every control still unless a scenario sets it
    #[arg(long, global = true)]
    frozen: bool,

    /// Print scenario reports as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manual polls over a drifting venue, then auto-poll
    Basic,

    /// Auto-poll disabling itself during an outage and recovering after
    Outage,

    /// Three cache priorities competing for a small budget
    Pressure,

    /// Filters, pagination and aggregations over a scripted history
    Query,

    /// Every scenario in turn
    All,
}

fn load_config(cli: &Cli) -> anyhow::Result<ChangeGroupConfig> {
    let config = match (&cli.config, &cli.preset) {
        (Some(path), _) => ChangeGroupConfig::from_file(path)?,
        (None, Some(preset)) => ChangeGroupConfig::preset(preset)?,
        (None, None) => ChangeGroupConfig::default(),
    };
    Ok(config)
}

async fn run(
    command: Commands,
    config: ChangeGroupConfig,
    sim: SimConfig,
) -> anyhow::Result<Vec<ScenarioReport>> {
    let report = match command {
        Commands::Basic => scenarios::run_basic_scenario(config, sim).await?,
        Commands::Outage => scenarios::run_outage_scenario(config, sim).await?,
        Commands::Pressure => scenarios::run_pressure_scenario(config, sim).await?,
        Commands::Query => scenarios::run_query_scenario(config, sim).await?,
        Commands::All => return scenarios::run_all(config, sim).await,
    };
    Ok(vec![report])
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let _log_guard = QsysSubscriberBuilder::new()
        .with_level(cli.level.clone())
        .with_pretty(cli.pretty)
        .init();
    let _core = CoreContextGuard::new("qsys-sim");

    let config = load_config(&cli)?;
    let sim = if cli.frozen {
        SimConfig::frozen()
    } else {
        SimConfig::default()
    };
    info!(
        failure_threshold = config.failure_threshold,
        max_cached = config.cache.max_total_entries,
        "Starting simulator"
    );

    // One thread, so the core context above covers every poll
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let reports = runtime.block_on(run(cli.command, config, sim))?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        println!("\n=== Summary ===");
        for report in &reports {
            println!("{}", report);
        }
    }

    Ok(())
}
