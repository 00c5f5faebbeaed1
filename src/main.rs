//! Stackplan CLI entrypoint.
//!
//! This is the main entrypoint for the stackplan command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use stackplan::cli::{Cli, Commands, LogFormat, OutputFormatter, StateCommands};
use stackplan::config::{
    ConfigParser, ConfigValidator, ProviderKind, StackConfig, StateBackend, find_config_file,
};
use stackplan::error::{ConfigError, Result, StackplanError};
use stackplan::planner::{CancelToken, PlanResolver};
use stackplan::provider::{HttpProvider, LocalProvider, Provider};
use stackplan::reconciler::Reconciler;
use stackplan::state::{LocalStateStore, S3StateStore, STATE_DIR, StateStore};

use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.log_format);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system.
///
/// `RUST_LOG` takes precedence over the verbosity flag.
fn init_logging(verbose: bool, format: LogFormat) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<()> {
    let formatter = OutputFormatter::new(cli.output);
    let config_path = cli.config.as_ref();

    match cli.command {
        Commands::Init { path, force } => cmd_init(&path, force),
        Commands::Validate { warnings } => cmd_validate(config_path, warnings, &formatter),
        Commands::Graph { unit } => cmd_graph(config_path, unit.as_deref(), &formatter),
        Commands::Plan { unit, detailed } => {
            cmd_plan(config_path, unit.as_deref(), detailed, &formatter).await
        }
        Commands::Apply { unit, yes } => cmd_apply(config_path, unit.as_deref(), yes, &formatter).await,
        Commands::Destroy { unit, yes } => {
            cmd_destroy(config_path, unit.as_deref(), yes, &formatter).await
        }
        Commands::Drift => cmd_drift(config_path, &formatter).await,
        Commands::State { command } => cmd_state(config_path, command, &formatter).await,
    }
}

/// Initialize a new project.
fn cmd_init(path: &Path, force: bool) -> Result<()> {
    info!("Initializing new stackplan project in: {}", path.display());

    let config_path = path.join("stackplan.yaml");
    let env_path = path.join(".env.example");
    let gitignore_path = path.join(".gitignore");

    if !force && config_path.exists() {
        eprintln!("Configuration file already exists: {}", config_path.display());
        eprintln!("Use --force to overwrite.");
        return Ok(());
    }

    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    std::fs::write(&config_path, include_str!("../templates/stackplan.yaml"))?;
    eprintln!("Created: {}", config_path.display());

    std::fs::write(&env_path, include_str!("../templates/.env.example"))?;
    eprintln!("Created: {}", env_path.display());

    let state_entry = format!("{STATE_DIR}/");
    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        let missing: Vec<&str> = [".env", state_entry.as_str()]
            .into_iter()
            .filter(|entry| !existing.lines().any(|line| line.trim() == *entry))
            .collect();

        if !missing.is_empty() {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(&gitignore_path)?;
            writeln!(file, "\n# stackplan")?;
            for entry in missing {
                writeln!(file, "{entry}")?;
            }
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, format!(".env\n{state_entry}\n"))?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    eprintln!("\nProject initialized successfully!");
    eprintln!("Next steps:");
    eprintln!("  1. Copy .env.example to .env if you use the HTTP provider or S3 state");
    eprintln!("  2. Edit stackplan.yaml with your units and resources");
    eprintln!("  3. Run 'stackplan validate' to check your configuration");
    eprintln!("  4. Run 'stackplan plan' to see what will be provisioned");
    eprintln!("  5. Run 'stackplan apply' to provision it");

    Ok(())
}

/// Validate configuration.
fn cmd_validate(
    config_path: Option<&PathBuf>,
    show_warnings: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let config_file = resolve_config_path(config_path)?;
    info!("Validating configuration: {}", config_file.display());

    let parser = ConfigParser::new().with_base_path(config_dir(&config_file));
    parser.load_dotenv()?;
    let config = parser.load_with_env(&config_file)?;

    let result = ConfigValidator::new().validate(&config)?;
    let units = config.build_units()?;
    stackplan::graph::UnitGraph::new(&units)?.ordered()?;

    println!("{}", formatter.format_validation(&config, &result, show_warnings));
    Ok(())
}

/// Show unit and resource ordering.
fn cmd_graph(config_path: Option<&PathBuf>, only: Option<&str>, formatter: &OutputFormatter) -> Result<()> {
    let (config, _) = load_config(config_path)?;
    let units = config.build_units()?;
    let ordered = stackplan::graph::UnitGraph::new(&units)?.ordered()?;

    let resolver = PlanResolver::new();
    let graphs = ordered
        .into_iter()
        .filter(|unit| only.is_none_or(|name| unit.name == name))
        .map(|unit| Ok((unit, resolver.resolve(&unit.graph)?)))
        .collect::<Result<Vec<_>>>()?;

    if let Some(name) = only
        && graphs.is_empty()
    {
        return Err(StackplanError::Config(ConfigError::UnknownUnit {
            name: name.to_string(),
        }));
    }

    println!("{}", formatter.format_graph(&graphs));
    Ok(())
}

/// Show deployment plan.
async fn cmd_plan(
    config_path: Option<&PathBuf>,
    only: Option<&str>,
    detailed: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (config, config_file) = load_config(config_path)?;
    let reconciler = create_reconciler(&config, &config_file).await?;

    let plans = reconciler.plan(only).await?;
    println!("{}", formatter.format_plans(&plans, detailed));
    Ok(())
}

/// Apply deployment plan.
async fn cmd_apply(
    config_path: Option<&PathBuf>,
    only: Option<&str>,
    auto_approve: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (config, config_file) = load_config(config_path)?;
    let reconciler = create_reconciler(&config, &config_file).await?;

    let plans = reconciler.plan(only).await?;
    if plans.iter().all(|p| p.plan.is_empty() && p.inputs_resolved) {
        eprintln!("No changes to apply.");
        return Ok(());
    }

    eprintln!("{}", formatter.format_plans(&plans, false));

    if !auto_approve && !confirm("Do you want to apply this plan? [y/N]: ", "y")? {
        eprintln!("Apply cancelled.");
        return Ok(());
    }

    let cancel = cancel_on_ctrl_c();
    let result = reconciler.apply(only, &cancel).await?;

    println!("{}", formatter.format_reconciliation(&result));
    Ok(())
}

/// Destroy provisioned resources.
async fn cmd_destroy(
    config_path: Option<&PathBuf>,
    only: Option<&str>,
    auto_approve: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (config, config_file) = load_config(config_path)?;
    let reconciler = create_reconciler(&config, &config_file).await?;

    let mut total = 0;
    for unit in reconciler.units().iter().rev() {
        if only.is_some_and(|name| name != unit.name) {
            continue;
        }
        let snapshot = reconciler.store().load(&unit.name).await?;
        for (id, resource) in &snapshot.resources {
            eprintln!(
                "  - {}.{id} [{}] {}",
                unit.name,
                resource.kind,
                resource.physical_id().unwrap_or("-")
            );
            total += 1;
        }
    }

    if total == 0 {
        eprintln!("No resources to destroy.");
        return Ok(());
    }

    if !auto_approve
        && !confirm(
            &format!("\nThis destroys {total} resources and is IRREVERSIBLE. Type 'destroy' to confirm: "),
            "destroy",
        )?
    {
        eprintln!("Destruction cancelled.");
        return Ok(());
    }

    let cancel = cancel_on_ctrl_c();
    let result = reconciler.destroy(only, &cancel).await?;

    println!("{}", formatter.format_reconciliation(&result));
    Ok(())
}

/// Check for drift.
async fn cmd_drift(config_path: Option<&PathBuf>, formatter: &OutputFormatter) -> Result<()> {
    let (config, config_file) = load_config(config_path)?;
    let reconciler = create_reconciler(&config, &config_file).await?;

    let report = reconciler.check_drift().await?;
    println!("{}", formatter.format_drift(&report));
    Ok(())
}

/// State inspection commands.
async fn cmd_state(
    config_path: Option<&PathBuf>,
    command: StateCommands,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (config, config_file) = load_config(config_path)?;
    let store = create_state_store(&config, &config_file).await?;

    match command {
        StateCommands::Show { unit } => {
            let snapshot = store.load(&unit).await?;
            if snapshot.version == 0 {
                eprintln!("No state found for unit '{unit}'.");
            } else {
                println!("{}", formatter.format_state(&snapshot));
            }
        }
        StateCommands::List => {
            let units = store.list_units().await?;
            println!("{}", formatter.format_units(store.backend_type(), &units));
        }
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Resolves the configuration file path.
fn resolve_config_path(config_path: Option<&PathBuf>) -> Result<PathBuf> {
    match config_path {
        Some(path) => Ok(path.clone()),
        None => find_config_file(std::env::current_dir()?),
    }
}

/// Directory containing the configuration file.
fn config_dir(config_file: &Path) -> &Path {
    config_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

/// Loads and validates the configuration.
fn load_config(config_path: Option<&PathBuf>) -> Result<(StackConfig, PathBuf)> {
    let config_file = resolve_config_path(config_path)?;
    debug!("Loading configuration from: {}", config_file.display());

    let parser = ConfigParser::new().with_base_path(config_dir(&config_file));
    parser.load_dotenv()?;

    let config = parser.load_with_env(&config_file)?;
    let result = ConfigValidator::new().validate(&config)?;
    for warning in &result.warnings {
        warn!("{warning}");
    }

    Ok((config, config_file))
}

/// Creates the state store the configuration selects.
async fn create_state_store(config: &StackConfig, config_file: &Path) -> Result<Arc<dyn StateStore>> {
    let store: Arc<dyn StateStore> = match config.state.backend {
        StateBackend::Local => {
            let base = config_dir(config_file);
            let path = config
                .state
                .path
                .as_ref()
                .map_or_else(|| base.join(STATE_DIR), |p| base.join(p));
            Arc::new(LocalStateStore::with_base_dir(path))
        }
        StateBackend::S3 => {
            let bucket = config
                .state
                .bucket
                .as_deref()
                .ok_or_else(|| StackplanError::internal("S3 bucket not configured"))?;
            let prefix = config.state.prefix.as_deref();
            let region = config.state.region.as_deref();
            Arc::new(S3StateStore::new(bucket, prefix, region).await?)
        }
    };

    debug!("Using {} state backend", store.backend_type());
    Ok(store)
}

/// Creates the provider the configuration selects.
async fn create_provider(config: &StackConfig, config_file: &Path) -> Result<Arc<dyn Provider>> {
    let provider: Arc<dyn Provider> = match config.provider.kind {
        ProviderKind::Local => match &config.provider.path {
            Some(path) => Arc::new(LocalProvider::open(config_dir(config_file).join(path)).await?),
            None => {
                warn!("Local provider has no path; resources only live for this run");
                Arc::new(LocalProvider::in_memory())
            }
        },
        ProviderKind::Http => {
            let endpoint = config
                .provider
                .endpoint
                .as_deref()
                .ok_or_else(|| StackplanError::internal("HTTP provider endpoint not configured"))?;
            let token = ConfigParser::get_provider_token().ok();
            if token.is_none() {
                warn!("No provider token set; requests are sent unauthenticated");
            }
            Arc::new(HttpProvider::with_timeout(
                endpoint,
                token,
                config.provider.timeout_secs,
            )?)
        }
    };

    debug!("Using {} provider", provider.name());
    Ok(provider)
}

/// Builds a reconciler over the configured provider and state store.
async fn create_reconciler<'a>(config: &'a StackConfig, config_file: &Path) -> Result<Reconciler<'a>> {
    let provider = create_provider(config, config_file).await?;
    let store = create_state_store(config, config_file).await?;
    Reconciler::new(config, provider, store)
}

/// Returns a token cancelled by the first Ctrl-C.
fn cancel_on_ctrl_c() -> CancelToken {
    let cancel = CancelToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight operations");
            token.cancel();
        }
    });
    cancel
}

/// Asks for confirmation on stderr.
fn confirm(prompt: &str, expected: &str) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case(expected))
}
