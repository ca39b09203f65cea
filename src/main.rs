use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::level_filters::LevelFilter;

use skillhost::capability::build_registry;
use skillhost::chat::{WebOptions, run_agent, run_ask};
use skillhost::cli::{
    Cli, Commands, PlanCommands, ProfileCommands, SkillCommands, TelemetryCommands, command_label,
};
use skillhost::config::{RuntimeConfig, load_profiles, resolve_runtime_config};
use skillhost::doctor::run_doctor;
use skillhost::error::{categorize_error, format_cli_error};
use skillhost::plan::TaskPlanStore;
use skillhost::profiles::{run_profiles_list, run_profiles_show};
use skillhost::provider::EnvModelResolver;
use skillhost::telemetry::{TelemetrySink, run_telemetry_report};
use skillhost::tools::description_headline;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let show_sensitive = cli.show_sensitive_config;
    if let Err(err) = run_cli(cli).await {
        eprintln!("{}", format_cli_error(&err, show_sensitive));
        tracing::error!(category = %categorize_error(&err).code(), "command failed");
        std::process::exit(1);
    }

    Ok(())
}

async fn run_cli(cli: Cli) -> Result<()> {
    init_tracing(&cli.log_filter)?;
    let profiles = load_profiles(&cli.config_path)?;
    let cfg = resolve_runtime_config(&cli, &profiles)?;
    let label = cli
        .command
        .as_ref()
        .map(command_label)
        .unwrap_or_else(|| "run".to_string());
    let telemetry = TelemetrySink::new(&cfg, label);

    match cli.command {
        None => run_agent(cfg, Arc::new(EnvModelResolver), None, true, &telemetry).await,
        Some(Commands::Run {
            web,
            web_host,
            web_port,
            no_console,
        }) => {
            let web = web.then_some(WebOptions {
                host: web_host,
                port: web_port,
            });
            run_agent(cfg, Arc::new(EnvModelResolver), web, !no_console, &telemetry).await
        }
        Some(Commands::Ask { prompt }) => {
            let prompt = prompt.join(" ");
            run_ask(cfg, Arc::new(EnvModelResolver), &prompt, &telemetry).await
        }
        Some(Commands::Skills { command }) => match command {
            SkillCommands::List => run_skills_list(&cfg),
        },
        Some(Commands::Plan { command }) => match command {
            PlanCommands::Show => run_plan_show(&cfg),
            PlanCommands::Clear { force } => run_plan_clear(&cfg, force),
        },
        Some(Commands::Doctor) => run_doctor(&cfg),
        Some(Commands::Profiles { command }) => match command {
            ProfileCommands::List => run_profiles_list(&profiles, &cfg),
            ProfileCommands::Show => run_profiles_show(&cfg),
        },
        Some(Commands::Telemetry { command }) => match command {
            TelemetryCommands::Report { path, limit } => run_telemetry_report(&cfg, path, limit),
        },
    }
}

fn run_skills_list(cfg: &RuntimeConfig) -> Result<()> {
    let report = build_registry(cfg).build();

    if report.tools.is_empty() {
        println!("No skills loaded.");
    } else {
        println!("Loaded tools ({}):", report.tools.len());
        for entry in report.tools.iter() {
            println!(
                "- {} [{}] {}",
                entry.tool.name(),
                entry.origin.module,
                description_headline(entry.tool.description())
            );
        }
    }

    if !report.capabilities.is_empty() {
        println!("\nCapabilities:");
        for capability in &report.capabilities {
            println!(
                "- {}.{} -> {} ({} tools)",
                capability.namespace,
                capability.package,
                capability.entry,
                capability.tools.len()
            );
        }
    }

    if !report.overridden.is_empty() {
        println!("\nOverridden by later registrations: {}", report.overridden.join(", "));
    }

    if !report.issues.is_empty() {
        println!("\nLoad issues:");
        for issue in &report.issues {
            println!("- {} [{}]: {}", issue.module, issue.namespace, issue.error);
        }
    }
    Ok(())
}

fn run_plan_show(cfg: &RuntimeConfig) -> Result<()> {
    match TaskPlanStore::new(cfg.plan_path.clone()).load()? {
        Some(plan) => println!("{}", plan.format_display()),
        None => println!("No task plan at '{}'.", cfg.plan_path.display()),
    }
    Ok(())
}

fn run_plan_clear(cfg: &RuntimeConfig, force: bool) -> Result<()> {
    if !force {
        return Err(anyhow::anyhow!(
            "invalid value: refusing to clear the task plan without --force"
        ));
    }
    if TaskPlanStore::new(cfg.plan_path.clone()).clear()? {
        println!("Cleared task plan '{}'.", cfg.plan_path.display());
    } else {
        println!("No task plan to clear.");
    }
    Ok(())
}

fn init_tracing(log_filter: &str) -> Result<()> {
    let level = log_filter
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::WARN);
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_env_filter(log_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing subscriber: {e}"))
}
