//! Top-level CLI definition and dispatch.

use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::{Shell as CompletionShell, generate};
use colored::{Colorize, control};
use serde_json::{Value, json};
use thiserror::Error;

use container_warden::core::config::Config;
use container_warden::core::errors::CwError;
use container_warden::daemon::loop_main::PolicyDaemon;
use container_warden::daemon::policy::{ContainerPolicyEngine, EvictionPlan};
use container_warden::daemon::self_monitor::{DaemonPhase, read_state};
use container_warden::monitor::containers::ContainerInspector;
use container_warden::platform::command::{CommandRunner, SystemCommandRunner};
use container_warden::platform::cron::CronManager;
use container_warden::platform::kmod::ModuleManager;
use container_warden::store::snapshot::SnapshotStore;

/// Container warden: keeps local container fleets within per-category quotas.
#[derive(Debug, Parser)]
#[command(
    name = "cwarden",
    author,
    version,
    about = "Container Warden - quota policy daemon for local container fleets",
    long_about = None,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Override config file path.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Force JSON output mode.
    #[arg(long, global = true)]
    json: bool,
    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Run the policy daemon in the foreground.
    Daemon,
    /// Show the state reported by the running daemon.
    Status,
    /// Dry-run the eviction policy against the live runtime.
    Policy,
    /// Manage the snapshot database.
    Store(StoreArgs),
    /// Load or unload the telemetry kernel modules.
    Modules(ModulesArgs),
    /// Install or remove the container spawner schedule.
    Cron(CronArgs),
    /// Inspect configuration.
    Config(ConfigArgs),
    /// Show version and optional build metadata.
    Version(VersionArgs),
    /// Generate shell completions.
    Completions(CompletionsArgs),
}

#[derive(Debug, Clone, Args)]
struct StoreArgs {
    #[command(subcommand)]
    command: StoreCommand,
}

#[derive(Debug, Clone, Subcommand)]
enum StoreCommand {
    /// Create the database and its tables.
    Init,
    /// Delete every batch and snapshot row.
    Reset,
    /// List recent batches with row counts.
    Batches {
        /// Maximum batches to show.
        #[arg(long, default_value_t = 10, value_name = "N")]
        limit: u32,
    },
}

#[derive(Debug, Clone, Args)]
struct ModulesArgs {
    #[command(subcommand)]
    command: ModulesCommand,
}

#[derive(Debug, Clone, Subcommand)]
enum ModulesCommand {
    /// Load configured modules in order.
    Load {
        /// Only this module.
        name: Option<String>,
    },
    /// Unload configured modules in reverse order.
    Unload {
        /// Only this module.
        name: Option<String>,
    },
}

#[derive(Debug, Clone, Args)]
struct CronArgs {
    #[command(subcommand)]
    command: CronCommand,
}

#[derive(Debug, Clone, Subcommand)]
enum CronCommand {
    /// Add the spawner entry unless it is already present.
    Install,
    /// Drop every entry mentioning the spawner script.
    Remove,
}

#[derive(Debug, Clone, Args)]
struct ConfigArgs {
    #[command(subcommand)]
    command: Option<ConfigCommand>,
}

#[derive(Debug, Clone, Subcommand)]
enum ConfigCommand {
    /// Print the config file path.
    Path,
    /// Print the effective configuration.
    Show,
    /// Validate the configuration.
    Validate,
}

#[derive(Debug, Clone, Args, Default)]
struct VersionArgs {
    /// Include build metadata.
    #[arg(long)]
    verbose: bool,
}

#[derive(Debug, Clone, Args)]
struct CompletionsArgs {
    /// Shell to generate completion script for.
    #[arg(value_enum)]
    shell: CompletionShell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Human,
    Json,
}

/// CLI error type with explicit exit-code mapping.
#[derive(Debug, Error)]
pub enum CliError {
    /// Invalid user input or configuration.
    #[error("{0}")]
    User(String),
    /// Environment/runtime failure.
    #[error("{0}")]
    Runtime(String),
    /// Internal bug or invariant violation.
    #[error("{0}")]
    Internal(String),
    /// Operation partially succeeded.
    #[error("{0}")]
    Partial(String),
    /// JSON serialization failed.
    #[error("failed to serialize output: {0}")]
    Json(#[from] serde_json::Error),
    /// Output write failed.
    #[error("failed to write output: {0}")]
    Io(#[from] io::Error),
}

impl CliError {
    /// Process exit code contract for the CLI.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::User(_) => 1,
            Self::Runtime(_) | Self::Io(_) => 2,
            Self::Internal(_) | Self::Json(_) => 3,
            Self::Partial(_) => 4,
        }
    }
}

impl From<CwError> for CliError {
    fn from(err: CwError) -> Self {
        match err {
            CwError::InvalidConfig { .. }
            | CwError::MissingConfig { .. }
            | CwError::ConfigParse { .. } => Self::User(err.to_string()),
            CwError::MissingSchema { .. } | CwError::Store { context: "open", .. } => {
                Self::Runtime(format!("{err} (run `cwarden store init` first)"))
            }
            CwError::Serialization { .. } => Self::Internal(err.to_string()),
            other => Self::Runtime(other.to_string()),
        }
    }
}

/// Dispatch CLI commands.
pub fn run(cli: &Cli) -> Result<(), CliError> {
    if cli.no_color {
        control::set_override(false);
    }

    match &cli.command {
        Command::Daemon => run_daemon(cli),
        Command::Status => run_status(cli),
        Command::Policy => run_policy(cli),
        Command::Store(args) => run_store(cli, args),
        Command::Modules(args) => run_modules(cli, args),
        Command::Cron(args) => run_cron(cli, args),
        Command::Config(args) => run_config(cli, args),
        Command::Version(args) => emit_version(cli, args),
        Command::Completions(args) => {
            let mut command = Cli::command();
            let binary_name = command.get_name().to_string();
            generate(args.shell, &mut command, binary_name, &mut io::stdout());
            Ok(())
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config, CliError> {
    Ok(Config::load(cli.config.as_deref())?)
}

fn system_runner() -> Arc<dyn CommandRunner> {
    Arc::new(SystemCommandRunner)
}

// ──────────────────── daemon / status ────────────────────

fn run_daemon(cli: &Cli) -> Result<(), CliError> {
    let config = load_config(cli)?;
    eprintln!(
        "[CW-DAEMON] starting cwarden {} (config {})",
        env!("CARGO_PKG_VERSION"),
        config.paths.config_file.display()
    );
    let mut daemon = PolicyDaemon::init(config)?;
    daemon.run()?;
    Ok(())
}

fn run_status(cli: &Cli) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let state_path = &config.paths.state_file;
    let state = if state_path.exists() {
        Some(read_state(state_path)?)
    } else {
        None
    };

    match output_mode(cli) {
        OutputMode::Human => {
            println!("Container Warden v{}", env!("CARGO_PKG_VERSION"));
            println!("  Config: {}", config.paths.config_file.display());
            let Some(state) = state else {
                println!("  Daemon: {}", "no state file (never started?)".yellow());
                return Ok(());
            };
            let phase = match state.phase {
                DaemonPhase::Running => state.phase.to_string().green(),
                DaemonPhase::Starting | DaemonPhase::Stopping => state.phase.to_string().yellow(),
                DaemonPhase::Stopped => state.phase.to_string().red(),
            };
            println!("  Daemon: {phase} (pid {}, v{})", state.pid, state.version);
            println!("  Started: {}", state.started_at);
            println!("  Updated: {}", state.last_updated);
            match state.last_batch_id {
                Some(id) => println!("  Last batch: {id}"),
                None => println!("  Last batch: -"),
            }
            let c = &state.counters;
            println!(
                "  Cycles: {} ok, {} failed",
                c.cycles_ok,
                if c.cycles_failed > 0 {
                    c.cycles_failed.to_string().red()
                } else {
                    c.cycles_failed.to_string().normal()
                }
            );
            println!(
                "  Evictions: {} ({} failed), exited removed: {}",
                c.evictions, c.eviction_failures, c.stopped_cleanups
            );
            if c.would_evict > 0 {
                println!("  Dry-run decisions: {}", c.would_evict.to_string().yellow());
            }
            if c.dropped_log_events > 0 {
                println!("  Dropped log events: {}", c.dropped_log_events);
            }
            println!("  RSS: {}", format_bytes(state.memory_rss_bytes));
            if let Some(err) = &state.last_error {
                println!("  Last error: {}", err.red());
            }
        }
        OutputMode::Json => {
            let payload = json!({
                "command": "status",
                "state_file": state_path.to_string_lossy(),
                "running": state.as_ref().is_some_and(|s| s.phase == DaemonPhase::Running),
                "state": state.map(serde_json::to_value).transpose()?,
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

// ──────────────────── policy dry run ────────────────────

fn run_policy(cli: &Cli) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let engine = ContainerPolicyEngine::from_config(&config.policy);
    let inspector = ContainerInspector::new(
        system_runner(),
        config.runtime.binary.clone(),
        engine.rules().clone(),
    );
    let fleet = inspector.inspect()?;
    let plan = engine.plan(&fleet);

    match output_mode(cli) {
        OutputMode::Human => print_plan_human(&plan, &config),
        OutputMode::Json => {
            let payload = json!({
                "command": "policy",
                "keep_low_usage": config.policy.keep_low_usage,
                "keep_high_pressure": config.policy.keep_high_pressure,
                "plan": serde_json::to_value(&plan)?,
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

fn print_plan_human(plan: &EvictionPlan, config: &Config) {
    println!(
        "Policy dry run (keep_low_usage={}, keep_high_pressure={})",
        config.policy.keep_low_usage, config.policy.keep_high_pressure
    );
    println!(
        "  {:<14}  {:<28}  {:<10}  {:>10}  {:<6}",
        "Container", "Image", "Category", "Score", "Action"
    );
    println!("  {}", "-".repeat(76));

    let rows = plan
        .keep
        .iter()
        .map(|s| (s, "keep".green()))
        .chain(plan.evict.iter().map(|s| (s, "evict".red().bold())));
    for (scored, action) in rows {
        println!(
            "  {:<14}  {:<28}  {:<10}  {:>10.1}  {action}",
            short_id(&scored.container.id),
            truncate(&scored.container.image, 28),
            scored.category.as_str(),
            scored.score,
        );
    }
    for container in &plan.exempt {
        println!(
            "  {:<14}  {:<28}  {:<10}  {:>10}  {}",
            short_id(&container.id),
            truncate(&container.image, 28),
            "exempt",
            "-",
            "skip".dimmed(),
        );
    }

    if plan.is_noop() {
        println!("\nAll tiers within quota; nothing to evict.");
    } else {
        println!("\n{} container(s) would be evicted.", plan.evict.len());
    }
    if !plan.unmanaged.is_empty() {
        println!("{} unmanaged container(s) ignored.", plan.unmanaged.len());
    }
}

// ──────────────────── store ────────────────────

fn run_store(cli: &Cli, args: &StoreArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let db = &config.paths.sqlite_db;
    let mode = output_mode(cli);

    match &args.command {
        StoreCommand::Init => {
            SnapshotStore::initialize(db)?;
            emit_done(mode, "store init", &format!("initialized {}", db.display()))
        }
        StoreCommand::Reset => {
            SnapshotStore::open(db)?.reset()?;
            emit_done(mode, "store reset", &format!("cleared {}", db.display()))
        }
        StoreCommand::Batches { limit } => {
            let batches = SnapshotStore::open(db)?.recent_batches(*limit)?;
            match mode {
                OutputMode::Human => {
                    if batches.is_empty() {
                        println!("No batches recorded.");
                    } else {
                        println!(
                            "  {:>8}  {:<22}  {:>9}  {:>10}",
                            "Batch", "Timestamp (UTC)", "Processes", "Containers"
                        );
                        for b in &batches {
                            println!(
                                "  {:>8}  {:<22}  {:>9}  {:>10}",
                                b.id, b.ts_utc, b.processes, b.containers
                            );
                        }
                    }
                }
                OutputMode::Json => {
                    let payload = json!({
                        "command": "store batches",
                        "batches": serde_json::to_value(&batches)?,
                    });
                    write_json_line(&payload)?;
                }
            }
            Ok(())
        }
    }
}

// ──────────────────── modules / cron ────────────────────

fn run_modules(cli: &Cli, args: &ModulesArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let manager = ModuleManager::new(system_runner(), &config.kernel);

    let (filter, loading) = match &args.command {
        ModulesCommand::Load { name } => (name.as_deref(), true),
        ModulesCommand::Unload { name } => (name.as_deref(), false),
    };
    let mut selected: Vec<_> = config
        .kernel
        .modules
        .iter()
        .filter(|m| filter.is_none_or(|name| m.name == name))
        .collect();
    if selected.is_empty() {
        return Err(CliError::User(match filter {
            Some(name) => format!("module {name:?} is not configured"),
            None => "no kernel modules configured".to_string(),
        }));
    }
    if !loading {
        selected.reverse();
    }

    let mut results = Vec::new();
    let mut failures = 0_usize;
    for module in selected {
        let outcome = if loading {
            manager.load(&module.image_path, &module.name)
        } else {
            manager.unload(&module.name)
        };
        match outcome {
            Ok(change) => results.push(json!({
                "name": module.name,
                "changed": change.applied(),
            })),
            Err(err) => {
                failures += 1;
                results.push(json!({
                    "name": module.name,
                    "error": err.to_string(),
                    "code": err.code(),
                }));
            }
        }
    }

    let command = if loading { "modules load" } else { "modules unload" };
    match output_mode(cli) {
        OutputMode::Human => {
            for r in &results {
                let name = r["name"].as_str().unwrap_or_default();
                if let Some(err) = r["error"].as_str() {
                    println!("  {} {name}: {err}", "FAIL".red().bold());
                } else if r["changed"].as_bool().unwrap_or(false) {
                    let verb = if loading { "loaded" } else { "unloaded" };
                    println!("  {} {name} {verb}", "OK".green());
                } else {
                    let state = if loading { "already loaded" } else { "not loaded" };
                    println!("  {} {name} {state}", "--".dimmed());
                }
            }
        }
        OutputMode::Json => {
            write_json_line(&json!({ "command": command, "modules": results }))?;
        }
    }

    match failures {
        0 => Ok(()),
        n if n == results.len() => Err(CliError::Runtime(format!("{command}: every module failed"))),
        n => Err(CliError::Partial(format!("{command}: {n} module(s) failed"))),
    }
}

fn run_cron(cli: &Cli, args: &CronArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let cron = CronManager::new(system_runner(), &config.cron);
    let script = cron.script_path().display().to_string();

    let (command, change) = match args.command {
        CronCommand::Install => ("cron install", cron.install()?),
        CronCommand::Remove => ("cron remove", cron.remove()?),
    };
    let message = match (args.command.clone(), change.applied()) {
        (CronCommand::Install, true) => format!("installed: {}", cron.schedule_line()),
        (CronCommand::Install, false) => format!("already installed: {script}"),
        (CronCommand::Remove, true) => format!("removed entries for {script}"),
        (CronCommand::Remove, false) => format!("no entry for {script}"),
    };

    match output_mode(cli) {
        OutputMode::Human => println!("{message}"),
        OutputMode::Json => write_json_line(&json!({
            "command": command,
            "script": script,
            "changed": change.applied(),
        }))?,
    }
    Ok(())
}

// ──────────────────── config ────────────────────

fn run_config(cli: &Cli, args: &ConfigArgs) -> Result<(), CliError> {
    match &args.command {
        None | Some(ConfigCommand::Path) => {
            let path = cli.config.clone().unwrap_or_else(Config::default_path);
            let exists = path.exists();

            match output_mode(cli) {
                OutputMode::Human => {
                    println!("{}", path.display());
                    if !exists {
                        println!("  (file does not exist; defaults will be used)");
                    }
                }
                OutputMode::Json => {
                    let payload = json!({
                        "command": "config path",
                        "path": path.to_string_lossy(),
                        "exists": exists,
                    });
                    write_json_line(&payload)?;
                }
            }
            Ok(())
        }
        Some(ConfigCommand::Show) => {
            let config = load_config(cli)?;

            match output_mode(cli) {
                OutputMode::Human => {
                    let toml_str = toml::to_string_pretty(&config)
                        .map_err(|e| CliError::Internal(format!("serialize config: {e}")))?;
                    println!("{toml_str}");
                }
                OutputMode::Json => {
                    let payload = json!({
                        "command": "config show",
                        "config": serde_json::to_value(&config)?,
                    });
                    write_json_line(&payload)?;
                }
            }
            Ok(())
        }
        Some(ConfigCommand::Validate) => match Config::load(cli.config.as_deref()) {
            Ok(config) => {
                let hash = config.stable_hash()?;

                match output_mode(cli) {
                    OutputMode::Human => {
                        println!("Configuration is valid.");
                        println!("  Source: {}", config.paths.config_file.display());
                        println!("  Hash: {hash}");
                    }
                    OutputMode::Json => {
                        let payload = json!({
                            "command": "config validate",
                            "valid": true,
                            "path": config.paths.config_file.to_string_lossy(),
                            "hash": hash,
                        });
                        write_json_line(&payload)?;
                    }
                }
                Ok(())
            }
            Err(e) => {
                match output_mode(cli) {
                    OutputMode::Human => {
                        eprintln!("Configuration is INVALID: {e}");
                    }
                    OutputMode::Json => {
                        let payload = json!({
                            "command": "config validate",
                            "valid": false,
                            "code": e.code(),
                            "error": e.to_string(),
                        });
                        write_json_line(&payload)?;
                    }
                }
                Err(CliError::User(format!("invalid config: {e}")))
            }
        },
    }
}

// ──────────────────── output helpers ────────────────────

fn emit_done(mode: OutputMode, command: &str, message: &str) -> Result<(), CliError> {
    match mode {
        OutputMode::Human => println!("{message}"),
        OutputMode::Json => write_json_line(&json!({
            "command": command,
            "ok": true,
            "message": message,
        }))?,
    }
    Ok(())
}

fn emit_version(cli: &Cli, args: &VersionArgs) -> Result<(), CliError> {
    let version = env!("CARGO_PKG_VERSION");
    let package = env!("CARGO_PKG_NAME");
    let target = option_env!("TARGET").unwrap_or("unknown");
    let profile = option_env!("PROFILE").unwrap_or("unknown");
    let git_sha = option_env!("GIT_SHA").unwrap_or("unknown");

    match output_mode(cli) {
        OutputMode::Human => {
            println!("cwarden {version}");
            if args.verbose {
                println!("package: {package}");
                println!("target: {target}");
                println!("profile: {profile}");
                println!("git_sha: {git_sha}");
            }
        }
        OutputMode::Json => {
            let payload = json!({
                "binary": "cwarden",
                "version": version,
                "package": package,
                "build": {
                    "target": target,
                    "profile": profile,
                    "git_sha": git_sha,
                }
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    #[allow(clippy::cast_precision_loss)]
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{head}...")
    }
}

fn write_json_line(payload: &Value) -> Result<(), CliError> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, payload)?;
    writeln!(stdout)?;
    Ok(())
}

fn output_mode(cli: &Cli) -> OutputMode {
    let env_mode = std::env::var("CW_OUTPUT_FORMAT").ok();
    resolve_output_mode(cli.json, env_mode.as_deref(), io::stdout().is_terminal())
}

fn resolve_output_mode(json_flag: bool, env_mode: Option<&str>, stdout_is_tty: bool) -> OutputMode {
    if json_flag {
        return OutputMode::Json;
    }

    let fallback = if stdout_is_tty {
        OutputMode::Human
    } else {
        OutputMode::Json
    };

    match env_mode
        .map(str::trim)
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("json") => OutputMode::Json,
        Some("human") => OutputMode::Human,
        _ => fallback,
    }
}
