use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use stagekit::{BuildReport, ModuleId, Phase, PhaseResources, Registry, RegistryError};
use stagekit_bootstrap::{AppConfig, AppConfigProvider, CliArgs};

use std::path::{Path, PathBuf};
use std::sync::Arc;

mod modules;

use modules::{Pipeline, Routes, ServiceCatalog};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// StageKit host - builds the linked modules in dependency order
#[derive(Parser)]
#[command(name = "stagekit-host")]
#[command(about = "StageKit host - builds the linked modules in dependency order")]
#[command(version = "0.1.0")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print effective configuration (YAML) and exit
    #[arg(long)]
    print_config: bool,

    /// Log verbosity level (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Build all modules and print what they contributed
    Run,
    /// Validate configuration and exit
    Check,
    /// Build, then print the dependency report of one or all modules
    Graph {
        /// Module name; all modules when omitted
        module: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let args = CliArgs {
        config: cli.config.as_ref().map(|p| p.to_string_lossy().to_string()),
        print_config: cli.print_config,
        verbose: cli.verbose,
    };

    // Layered config:
    // 1) defaults -> 2) YAML (if provided) -> 3) env (APP__*) -> 4) CLI overrides
    let mut config = AppConfig::load_or_default(cli.config.as_deref())?;
    config.apply_cli_overrides(&args);

    let logging_config = config.logging.as_ref().cloned().unwrap_or_default();
    stagekit_bootstrap::logging::init_logging(&logging_config, Path::new(&config.host.home_dir));

    tracing::info!(host = %config.host.name, "StageKit host starting");

    if cli.print_config {
        println!("{}", config.to_yaml()?);
        return Ok(());
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config),
        Commands::Check => check_config(config),
        Commands::Graph { module } => print_graph(config, module.as_deref()),
    }
}

fn host_resources() -> PhaseResources {
    PhaseResources::new()
        .with(Phase::ConfigureServices, ServiceCatalog::default())
        .with(Phase::ConfigureApplicationBuilder, Pipeline::default())
        .with(Phase::ConfigureEndpoints, Routes::default())
}

fn build(config: &AppConfig, resources: &mut PhaseResources) -> Result<(Registry, Result<BuildReport, RegistryError>)> {
    let provider = Arc::new(AppConfigProvider::new(config.clone()));
    let mut registry = Registry::discover()?.with_config(provider);
    let result = registry.build(resources);
    Ok((registry, result))
}

fn run(config: AppConfig) -> Result<()> {
    tracing::info!("Building modules…");
    let mut resources = host_resources();
    let (registry, result) = build(&config, &mut resources)?;
    let report = result?;

    if config.host.print_summary {
        tracing::info!("{}", registry.summary());
        tracing::info!("{}", report.profile.summary());
    }

    for (id, reason) in &report.disabled {
        tracing::warn!(module = %id, %reason, "Module disabled");
    }

    let services = resources
        .take::<ServiceCatalog>(Phase::ConfigureServices)
        .unwrap_or_default();
    let pipeline = resources
        .take::<Pipeline>(Phase::ConfigureApplicationBuilder)
        .unwrap_or_default();
    let routes = resources
        .take::<Routes>(Phase::ConfigureEndpoints)
        .unwrap_or_default();

    println!("Built modules: {}", join_ids(&report.built));
    println!("Services: {}", services.0.join(", "));
    println!("Pipeline: {}", pipeline.0.join(" -> "));
    println!("Routes:");
    for route in &routes.0 {
        println!("  {route}");
    }
    Ok(())
}

fn check_config(config: AppConfig) -> Result<()> {
    tracing::info!("Checking configuration…");
    // Reject module sections the engine cannot read before anything is built.
    for (name, section) in &config.modules {
        stagekit::ModuleSettings::from_value(section)
            .with_context(|| format!("invalid settings for module '{name}'"))?;
    }
    println!("Configuration is valid");
    println!("{}", config.to_yaml()?);
    Ok(())
}

fn print_graph(config: AppConfig, module: Option<&str>) -> Result<()> {
    let mut resources = host_resources();
    let (registry, result) = build(&config, &mut resources)?;
    if let Err(err) = result {
        // the graph is still complete after a failed build
        tracing::warn!("Build failed:\n{err}");
    }

    let ids: Vec<ModuleId> = match module {
        Some(name) => {
            let id = registry
                .graph()
                .nodes()
                .iter()
                .copied()
                .find(|id| id.name() == name)
                .ok_or_else(|| anyhow::anyhow!("unknown module '{name}'"))?;
            vec![id]
        }
        None => registry.graph().nodes().to_vec(),
    };

    for id in ids {
        println!("{}", registry.dependency_info(id));
    }
    Ok(())
}

fn join_ids(ids: &[ModuleId]) -> String {
    ids.iter().map(|id| id.name()).collect::<Vec<_>>().join(", ")
}
