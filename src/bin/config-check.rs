//! # ModHub Configuration Check
//!
//! Command-line tool that loads and validates ModHub configuration for an
//! environment and prints the effective settings. Catches configuration
//! problems before an orchestration context is started.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use modhub_core::config::{ConfigManager, ModHubConfig, PersistenceBackend};
use std::path::{Path, PathBuf};
use std::process;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "modhub-config-check")]
#[command(about = "Validate ModHub configuration files")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Environment to validate (development, test, production, ...)
    #[arg(short, long, default_value = "development")]
    environment: String,

    /// Configuration directory (default: ./config)
    #[arg(short, long)]
    config_dir: Option<PathBuf>,

    /// Verbose output level (use multiple times for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Output format for `show`
    #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
    format: OutputFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate every section
    Validate,

    /// Print the effective configuration (secrets masked)
    Show,

    /// List environments with an override file
    Environments,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let _subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .try_init();

    let result = match &cli.command {
        Some(Commands::Validate) | None => validate(&cli),
        Some(Commands::Show) => show(&cli),
        Some(Commands::Environments) => list_environments(&cli),
    };

    match result {
        Ok(()) => {
            info!("Configuration check completed successfully");
            process::exit(0);
        }
        Err(e) => {
            error!("Configuration check failed: {e:#}");
            eprintln!("❌ {e:#}");
            process::exit(1);
        }
    }
}

fn load(cli: &Cli) -> Result<std::sync::Arc<ConfigManager>> {
    ConfigManager::load_from_directory_with_env(cli.config_dir.clone(), &cli.environment)
        .with_context(|| format!("loading configuration for '{}'", cli.environment))
}

fn validate(cli: &Cli) -> Result<()> {
    println!("🔧 Validating ModHub Configuration");
    println!("Environment: {}", cli.environment);
    if let Some(dir) = &cli.config_dir {
        println!("Config Directory: {}", dir.display());
    }
    println!();

    let manager = load(cli)?;
    println!("✅ Configuration loaded and validated");

    let config = manager.config();
    check_message_bus(config);
    check_workflow(config);
    check_persistence(config)?;

    println!("\n🎉 All configuration checks passed!");
    Ok(())
}

fn check_message_bus(config: &ModHubConfig) {
    let bus = &config.message_bus;
    println!("📨 Message bus");
    println!("   ✅ Workers: {}", bus.worker_count);
    println!("   ✅ Max delivery attempts: {}", bus.max_delivery_attempts);
    println!(
        "   ✅ Backoff: {}ms x{} (max {}ms)",
        bus.backoff.initial_delay_ms, bus.backoff.multiplier, bus.backoff.max_delay_ms
    );
    println!("   ✅ Message TTL: {}s", bus.message_ttl_seconds);
}

fn check_workflow(config: &ModHubConfig) {
    let workflow = &config.workflow;
    println!("🔀 Workflow engine");
    println!("   ✅ Step timeout: {}ms", workflow.step_timeout_ms);
    if workflow.sla_sweep_enabled {
        println!(
            "   ✅ SLA sweep every {}s",
            workflow.sla_sweep_interval_seconds
        );
    } else {
        println!("   ℹ️  SLA sweep disabled");
    }
}

fn check_persistence(config: &ModHubConfig) -> Result<()> {
    let persistence = &config.persistence;
    println!("💾 Persistence");
    match persistence.backend {
        PersistenceBackend::Memory => {
            println!("   ℹ️  In-memory store (state is lost on exit)")
        }
        PersistenceBackend::Postgres => {
            if persistence.resolved_database_url().is_none() {
                bail!("postgres backend selected but no database_url or DATABASE_URL is set");
            }
            println!(
                "   ✅ PostgreSQL (max connections: {})",
                persistence.max_connections
            );
        }
    }
    Ok(())
}

fn show(cli: &Cli) -> Result<()> {
    let manager = load(cli)?;
    let effective = manager.debug_config();
    match cli.format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&effective)?);
        }
        OutputFormat::Table => {
            println!("Environment: {}", manager.environment());
            print_table("", &effective);
        }
    }
    Ok(())
}

fn print_table(prefix: &str, value: &serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                print_table(&path, child);
            }
        }
        other => println!("  {prefix:<45} {other}"),
    }
}

fn list_environments(cli: &Cli) -> Result<()> {
    let dir = cli
        .config_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from("config"));
    println!("📋 Environments in {}:", dir.display());
    for environment in environments_in(&dir)? {
        println!("  • {environment}");
    }
    Ok(())
}

fn environments_in(dir: &Path) -> Result<Vec<String>> {
    let mut environments = Vec::new();
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("reading configuration directory {}", dir.display()))?;
    for entry in entries {
        let name = entry?.file_name();
        let name = name.to_string_lossy();
        if let Some(environment) = name
            .strip_prefix("modhub.")
            .and_then(|rest| rest.strip_suffix(".yaml"))
        {
            environments.push(environment.to_string());
        }
    }
    environments.sort();
    Ok(environments)
}
