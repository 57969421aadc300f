//! commit-ai - CLI entry point.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dialoguer::Confirm;
use git2::Repository;
use semver::Version;
use tracing_subscriber::EnvFilter;

use commit_ai::builtin::with_builtins;
use commit_ai::commit::{WorkflowOptions, run_commit_workflow};
use commit_ai::plugin::{
    GenerateOptions, InstallSource, PhaseReport, PluginCategory, PluginFilter,
    PluginManager, PluginState, ScaffoldRequest, SystemEnvironment, scaffold_plugin,
};
use commit_ai::{Config, PluginError, WorkflowError};

/// Generate commit messages with AI, extended through plugins.
#[derive(Parser, Debug)]
#[command(name = "commit-ai")]
#[command(about = "Generate commit messages with AI, extended through plugins")]
#[command(version)]
struct Cli {
    /// Show debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a message for the staged changes and commit (default)
    Generate(GenerateArgs),

    /// Manage plugins
    #[command(subcommand)]
    Plugins(PluginsCommand),
}

#[derive(clap::Args, Debug, Default)]
struct GenerateArgs {
    /// AI provider plugin to use (default from config)
    #[arg(long)]
    provider: Option<String>,

    /// Template plugin to render the message with
    #[arg(long)]
    template: Option<String>,

    /// Model passed to the provider
    #[arg(long)]
    model: Option<String>,

    /// Print the message without committing
    #[arg(long)]
    dry_run: bool,

    /// Commit without asking for confirmation
    #[arg(short, long)]
    yes: bool,
}

#[derive(Subcommand, Debug)]
enum PluginsCommand {
    /// List installed plugins
    List {
        #[arg(long)]
        category: Option<PluginCategory>,
        #[arg(long)]
        state: Option<PluginState>,
        /// Only enabled plugins
        #[arg(long)]
        enabled: bool,
    },
    /// Show a plugin's manifest, state and dependencies
    Info { id: String },
    /// Install from a plugin directory or `builtin:<name>`
    Install {
        source: String,
        /// Validate and enable right after installing
        #[arg(long)]
        enable: bool,
    },
    /// Remove a plugin that is not enabled
    Uninstall {
        id: String,
        #[arg(short, long)]
        yes: bool,
    },
    /// Enable a plugin, validating it first if needed
    Enable { id: String },
    /// Disable an enabled plugin
    Disable {
        id: String,
        #[arg(short, long)]
        yes: bool,
    },
    /// Check a plugin's dependencies and mark it validated
    Validate { id: String },
    /// Create a new plugin skeleton
    Create {
        name: String,
        #[arg(long, default_value = "workflow-hook")]
        category: PluginCategory,
        #[arg(long)]
        author: Option<String>,
        #[arg(long, default_value = "")]
        description: String,
        /// Parent directory (defaults to the plugins directory)
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Load a plugin and exercise it with sample input
    Test { id: String },
}

/// Failure that maps to a specific exit status.
#[derive(Debug)]
struct Exit(u8);

impl std::fmt::Display for Exit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "exit status {}", self.0)
    }
}

impl std::error::Error for Exit {}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if let Some(Exit(code)) = e.downcast_ref::<Exit>() {
                return ExitCode::from(*code);
            }
            eprintln!("Error: {:#}", e);
            if let Some(hint) = e.downcast_ref::<PluginError>().and_then(PluginError::remediation) {
                eprintln!("Hint: {}", hint);
            }
            ExitCode::from(1)
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "commit_ai=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;
    let env = SystemEnvironment::new().provide(
        "commit-ai",
        Version::parse(env!("CARGO_PKG_VERSION")).context("Invalid crate version")?,
    );
    let manager = PluginManager::open(config.manager_options(), with_builtins(), Arc::new(env))
        .context("Failed to open plugin state")?;

    let result = match cli.command {
        None => generate(&manager, &config, GenerateArgs::default()).await,
        Some(Command::Generate(args)) => generate(&manager, &config, args).await,
        Some(Command::Plugins(command)) => plugins(&manager, &config, command).await,
    };
    manager.shutdown();
    result
}

async fn generate(manager: &PluginManager, config: &Config, args: GenerateArgs) -> Result<()> {
    let repo = Repository::open_from_env()
        .context("Not a git repository. Run commit-ai from within a git repository.")?;

    let mut generate = GenerateOptions::new();
    if let Some(model) = args.model.or_else(|| config.model.clone()) {
        generate.insert("model".to_string(), model);
    }
    let options = WorkflowOptions {
        provider: args.provider.unwrap_or_else(|| config.provider.clone()),
        template: args.template.or_else(|| config.template.clone()),
        dry_run: args.dry_run,
        generate,
    };

    println!("Generating commit message with {}...", options.provider);
    let skip_confirm = args.yes;
    let result = run_commit_workflow(manager, &repo, &options, |message| {
        println!("\n{}\n", message);
        skip_confirm || confirm("Commit with this message?")
    })
    .await;

    match result {
        Ok(outcome) => {
            for report in &outcome.reports {
                print_failures(report);
            }
            match outcome.commit_id {
                Some(id) => println!("✓ Committed {}", &id[..id.len().min(8)]),
                None => println!("--- Dry Run Output ---\n\n{}", outcome.message),
            }
            Ok(())
        }
        Err(WorkflowError::Cancelled) => {
            println!("Commit cancelled.");
            Ok(())
        }
        Err(e @ WorkflowError::PhaseFailed { .. }) => {
            eprintln!("Error: {}", e);
            Err(Exit(2).into())
        }
        Err(e) => Err(e.into()),
    }
}

fn print_failures(report: &PhaseReport) {
    for outcome in report.failures() {
        eprintln!(
            "Warning: {} hook '{}' failed: {}",
            report.phase, outcome.plugin_id, outcome.detail
        );
    }
}

async fn plugins(manager: &PluginManager, config: &Config, command: PluginsCommand) -> Result<()> {
    match command {
        PluginsCommand::List {
            category,
            state,
            enabled,
        } => {
            let filter = PluginFilter {
                category,
                state,
                enabled_only: enabled,
            };
            let plugins = manager.list(&filter);
            if plugins.is_empty() {
                println!("No plugins installed.");
            }
            for p in plugins {
                println!(
                    "{:<24} {:<14} {:<10} {:<10} {}",
                    p.id, p.category, p.version, p.state, p.description
                );
            }
            for invalid in manager.invalid_entries() {
                eprintln!(
                    "Warning: invalid plugin '{}' at {}: {}",
                    invalid.id,
                    invalid.path.display(),
                    invalid.error
                );
            }
        }
        PluginsCommand::Info { id } => {
            let detail = manager.show(&id)?;
            let m = &detail.manifest;
            println!("{} {} ({})", m.id, m.version, m.category);
            if !m.description.is_empty() {
                println!("  {}", m.description);
            }
            if let Some(author) = &m.author {
                println!("  author:     {}", author);
            }
            println!("  state:      {}", m.state);
            println!("  loaded:     {}", detail.loaded);
            if let Some(available) = detail.available {
                println!("  available:  {}", available);
            }
            if !detail.models.is_empty() {
                println!("  models:     {}", detail.models.join(", "));
            }
            println!("  entrypoint: {}", m.entrypoint);
            println!("  directory:  {}", m.dir.display());
            if let Some(err) = detail.record.as_ref().and_then(|r| r.last_error.as_ref()) {
                println!("  last error: {}", err);
            }
            for dep in &detail.dependencies.records {
                let mark = if dep.satisfied { "✓" } else if dep.optional { "?" } else { "✗" };
                let found = dep
                    .installed_version
                    .as_ref()
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!("  {} {} {} (found {})", mark, dep.name, dep.required, found);
            }
            for hook in &detail.hooks {
                println!(
                    "  hook: {} priority={} critical={}",
                    hook.phase, hook.priority, hook.critical
                );
            }
        }
        PluginsCommand::Install { source, enable } => {
            let manifest = manager.install(&InstallSource::parse(&source))?;
            println!("✓ Installed {} {}", manifest.id, manifest.version);
            if enable {
                enable_plugin(manager, &manifest.id)?;
            }
        }
        PluginsCommand::Uninstall { id, yes } => {
            if yes || confirm(&format!("Uninstall plugin '{}'?", id)) {
                manager.uninstall(&id)?;
                println!("✓ Uninstalled {}", id);
            }
        }
        PluginsCommand::Enable { id } => enable_plugin(manager, &id)?,
        PluginsCommand::Disable { id, yes } => {
            if yes || confirm(&format!("Disable plugin '{}'?", id)) {
                manager.disable(&id)?;
                println!("✓ Disabled {}", id);
            }
        }
        PluginsCommand::Validate { id } => {
            let report = manager.validate(&id)?;
            for warning in report.warnings() {
                eprintln!(
                    "Warning: optional dependency {} ({}) is not available",
                    warning.name, warning.required
                );
            }
            println!("✓ {} is valid", id);
        }
        PluginsCommand::Create {
            name,
            category,
            author,
            description,
            dir,
        } => {
            let parent = dir.unwrap_or_else(|| config.plugins_dir.clone());
            let request = ScaffoldRequest {
                name,
                category,
                author,
                description,
            };
            let path = scaffold_plugin(&parent, &request)?;
            println!("✓ Created {} plugin at {}", request.category, path.display());
            println!("  Install it with: commit-ai plugins install {}", path.display());
        }
        PluginsCommand::Test { id } => {
            let report = manager.test(&id).await?;
            for dep in report.dependencies.unmet_required() {
                println!("✗ dependency {} {}", dep.name, dep.required);
            }
            for check in &report.checks {
                let mark = if check.passed { "✓" } else { "✗" };
                println!("{} {}: {}", mark, check.name, check.detail);
            }
            if !report.is_success() {
                return Err(Exit(1).into());
            }
        }
    }
    Ok(())
}

/// Validate first when the plugin has only been discovered.
fn enable_plugin(manager: &PluginManager, id: &str) -> Result<(), PluginError> {
    let detail = manager.show(id)?;
    if detail.manifest.state == PluginState::Discovered {
        manager.validate(id)?;
    }
    let report = manager.enable(id)?;
    for warning in report.warnings() {
        eprintln!(
            "Warning: optional dependency {} ({}) is not available",
            warning.name, warning.required
        );
    }
    println!("✓ Enabled {}", id);
    Ok(())
}

fn confirm(prompt: &str) -> bool {
    Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()
        .unwrap_or(false)
}
