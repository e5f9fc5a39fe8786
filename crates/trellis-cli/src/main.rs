//! CLI binary for inspecting Trellis experiments and their caches.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use trellis_pipeline::{
    ArtifactStatus, AutoApproveInterviewer, CachePolicy, ConsoleInterviewer, Controller,
    ControllerConfig, Interviewer, Severity,
};
use trellis_types::Category;

#[derive(Parser)]
#[command(name = "trellis", version, about = "Template-driven analysis-pipeline controller")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Lint an experiment configuration
    Validate {
        /// Path to the configuration JSON file
        config: PathBuf,
    },

    /// Show an overview of an experiment
    Info {
        /// Path to the configuration JSON file
        config: PathBuf,
    },

    /// Print the chain of a definition, root first
    Chain {
        config: PathBuf,
        /// Definition category (raw, epoch, group, parc, ...)
        category: String,
        name: String,
    },

    /// List definition fingerprints
    Fingerprints {
        config: PathBuf,
        /// Only show this category
        #[arg(short, long)]
        category: Option<String>,
    },

    /// Print the state after applying assignments
    State {
        config: PathBuf,
        /// Assignment `name=value`, applied with cascades (repeatable)
        #[arg(short = 's', long = "set", value_parser = parse_assignment)]
        assignments: Vec<(String, String)>,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Locate an artifact and report whether it must be computed
    Resolve {
        config: PathBuf,
        category: String,
        /// Definition name (default: the current value of the category's parameter)
        name: Option<String>,
        /// Assignment `name=value`, applied with cascades (repeatable)
        #[arg(short = 's', long = "set", value_parser = parse_assignment)]
        assignments: Vec<(String, String)>,
    },

    /// Check the cache against the current definitions
    Refresh {
        config: PathBuf,
        /// Override the configured policy (auto, ask, off)
        #[arg(long)]
        policy: Option<String>,
        /// Accept the default answer (delete) instead of prompting
        #[arg(short, long)]
        yes: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .init();

    match cli.command {
        Commands::Validate { config } => cmd_validate(&config)?,
        Commands::Info { config } => cmd_info(&config)?,
        Commands::Chain { config, category, name } => cmd_chain(&config, &category, &name)?,
        Commands::Fingerprints { config, category } => {
            cmd_fingerprints(&config, category.as_deref())?
        }
        Commands::State { config, assignments, json } => cmd_state(&config, &assignments, json)?,
        Commands::Resolve {
            config,
            category,
            name,
            assignments,
        } => cmd_resolve(&config, &category, name.as_deref(), &assignments)?,
        Commands::Refresh { config, policy, yes } => cmd_refresh(&config, policy.as_deref(), yes)?,
    }

    Ok(())
}

fn parse_assignment(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(format!("expected name=value, got '{s}'")),
    }
}

fn load_config(path: &Path) -> anyhow::Result<ControllerConfig> {
    tracing::debug!(config = %path.display(), "Loading configuration");
    let mut config = ControllerConfig::load(path)?;
    config.apply_env()?;
    Ok(config)
}

/// A controller that leaves the cache alone.
fn inspect(path: &Path) -> anyhow::Result<Controller> {
    let controller = Controller::builder(load_config(path)?)
        .skip_refresh(true)
        .build()?;
    Ok(controller)
}

fn cmd_validate(path: &Path) -> anyhow::Result<()> {
    let config = load_config(path)?;
    let diagnostics = trellis_pipeline::diagnose(&config)?;

    if diagnostics.is_empty() {
        println!("Configuration is valid");
        return Ok(());
    }

    let mut has_error = false;
    for diag in &diagnostics {
        let severity = match diag.severity {
            Severity::Error => {
                has_error = true;
                "ERROR"
            }
            Severity::Warning => "WARN",
            Severity::Info => "INFO",
        };
        match &diag.definition {
            Some(key) => println!("[{}] {} ({}): {}", severity, diag.rule, key, diag.message),
            None => println!("[{}] {}: {}", severity, diag.rule, diag.message),
        }
        if let Some(fix) = &diag.fix {
            println!("        fix: {fix}");
        }
    }

    if has_error {
        std::process::exit(1);
    }
    Ok(())
}

fn cmd_info(path: &Path) -> anyhow::Result<()> {
    let c = inspect(path)?;

    println!("Root: {}", c.config().root.display());
    println!("Cache: {} ({} records, policy {})", c.cache_dir().display(), c.cache_index().len(), c.settings().policy);
    println!("Sessions: {}", c.sessions().join(", "));
    println!("Subjects: {} ({})", c.subjects().len(), c.subjects().join(", "));

    println!("\nDefinitions:");
    for category in Category::ALL {
        let names = c.catalog().names(category);
        if names.is_empty() {
            continue;
        }
        println!("  {:<9} {}", category.as_str(), names.join(", "));
    }

    println!("\nTemplates:");
    for (name, template) in c.templates().iter() {
        println!("  {name:<16} {template}");
    }

    let plan = c.plan_invalidation();
    if !plan.is_empty() {
        println!("\nOutdated cache records: {}", plan.stale.len());
        for entry in &plan.stale {
            println!("  {} ({})", entry.path.display(), entry.reason);
        }
    }
    Ok(())
}

fn cmd_chain(path: &Path, category: &str, name: &str) -> anyhow::Result<()> {
    let c = inspect(path)?;
    let category: Category = category.parse()?;
    let chain = c.catalog().chain(category, name)?;
    println!("{}", chain.join(" -> "));
    Ok(())
}

fn cmd_fingerprints(path: &Path, category: Option<&str>) -> anyhow::Result<()> {
    let c = inspect(path)?;
    let filter: Option<Category> = category.map(str::parse).transpose()?;
    for key in c.catalog().keys() {
        if filter.is_some_and(|f| f != key.category) {
            continue;
        }
        let fp = c.catalog().fingerprint(key)?;
        println!("{}  {}", fp.short(), key);
    }
    Ok(())
}

fn cmd_state(path: &Path, assignments: &[(String, String)], json: bool) -> anyhow::Result<()> {
    let mut c = inspect(path)?;
    c.set_many(assignments.iter().cloned())?;
    let state = c.state();

    if json {
        println!("{}", serde_json::to_string_pretty(&state)?);
        return Ok(());
    }
    for (name, value) in &state {
        println!("{:<10} {}", name, value.as_deref().unwrap_or("-"));
    }
    Ok(())
}

fn cmd_resolve(
    path: &Path,
    category: &str,
    name: Option<&str>,
    assignments: &[(String, String)],
) -> anyhow::Result<()> {
    let mut c = Controller::builder(load_config(path)?)
        .interviewer(Box::new(ConsoleInterviewer))
        .build()?;
    c.set_many(assignments.iter().cloned())?;
    let category: Category = category.parse()?;
    let resolution = match name {
        Some(name) => c.resolve(category, name)?,
        None => c.resolve_current(category)?,
    };

    let status = match &resolution.status {
        ArtifactStatus::Fresh => "fresh".to_string(),
        ArtifactStatus::Missing => "missing".to_string(),
        ArtifactStatus::Stale(reason) => format!("stale: {reason}"),
        ArtifactStatus::Untracked => "untracked".to_string(),
        ArtifactStatus::Source => "source".to_string(),
        ArtifactStatus::Transient => "computed on load".to_string(),
    };
    println!("{} {}", resolution.kind, resolution.definition);
    println!("Path: {}", resolution.path.display());
    println!("Status: {status}");
    if let Some(input) = &resolution.stale_input {
        println!("Stale input: {}", input.display());
    }
    if !resolution.inputs.is_empty() {
        println!("Inputs:");
        for input in &resolution.inputs {
            println!("  {}", input.display());
        }
    }
    if resolution.is_stale() {
        std::process::exit(2);
    }
    Ok(())
}

fn cmd_refresh(path: &Path, policy: Option<&str>, yes: bool) -> anyhow::Result<()> {
    let mut config = load_config(path)?;
    if let Some(policy) = policy {
        config.cache.policy = policy.parse::<CachePolicy>()?;
    }
    let interviewer: Box<dyn Interviewer> = if yes {
        Box::new(AutoApproveInterviewer)
    } else {
        Box::new(ConsoleInterviewer)
    };
    let mut c = Controller::builder(config)
        .interviewer(interviewer)
        .skip_refresh(true)
        .build()?;
    let outcome = c.refresh()?;

    println!("Deleted: {}", outcome.deleted.len());
    for path in &outcome.deleted {
        println!("  {}", path.display());
    }
    println!("Accepted: {}", outcome.restamped.len());
    println!("Flagged stale: {}", outcome.flagged.len());
    println!("Pruned missing: {}", outcome.pruned.len());
    Ok(())
}
