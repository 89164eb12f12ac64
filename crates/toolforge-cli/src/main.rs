//! Toolforge CLI
//!
//! The `toolforge` command synthesizes, validates, runs, and catalogs small
//! tools on demand.
//!
//! ## Commands
//!
//! - `run`: Handle one task end to end
//! - `validate`: Run the validation gates over a source file
//! - `tools`: List, search, show, and deprecate registered tools
//! - `config`: Print or check the effective configuration

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

use toolforge_core::metrics::METRICS;
use toolforge_core::obs::RequestSpan;
use toolforge_core::validation::GateOutcome;
use toolforge_core::{
    AgentConfig, CandidateArtifact, GeminiSynthesizer, IoSpec, IoType, Orchestrator,
    ProcessSandbox, Provenance, SearchQuery, SharedContext, Strategy, Synthesizer, TaskOutcome,
    TaskRequest, TaskStatus, TemplateSynthesizer, ToolRegistry, ValidationPipeline,
};
use toolforge_store::ToolId;

#[derive(Parser)]
#[command(name = "toolforge")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "On-demand tool synthesis for autonomous agents", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Configuration file (TOML). TOOLFORGE_* variables override it.
    #[arg(short, long, global = true, env = "TOOLFORGE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Handle one task: reuse or synthesize a tool, run it, and report
    Run {
        /// Natural-language task description
        description: String,

        /// Argument passed to the tool (JSON)
        #[arg(short, long)]
        args: Option<String>,

        /// Expected input type (int, float, str, list, dict, ...)
        #[arg(long = "input-type", alias = "input")]
        input: Option<String>,

        /// Expected output type
        #[arg(long = "output-type", alias = "output")]
        output: Option<String>,

        /// Which synthesizer to use
        #[arg(long, value_enum, default_value = "auto")]
        synthesizer: SynthesizerKind,

        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Run the validation gates over a Python source file
    Validate {
        file: PathBuf,

        #[arg(long = "input-type", alias = "input")]
        input: Option<String>,

        #[arg(long = "output-type", alias = "output")]
        output: Option<String>,
    },

    /// Registered tools
    Tools {
        #[command(subcommand)]
        action: ToolsAction,
    },

    /// Effective configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ToolsAction {
    /// List registered tools
    List {
        /// Include deprecated tools
        #[arg(long)]
        all: bool,
    },

    /// Search tools by description
    Search {
        query: String,

        #[arg(short, long, default_value = "10")]
        limit: usize,

        /// Include deprecated tools
        #[arg(long)]
        all: bool,
    },

    /// Show one tool
    Show {
        /// Tool id, `name@version`
        id: String,

        /// Print the artifact source
        #[arg(long)]
        source: bool,
    },

    /// Deprecate a tool version
    Deprecate {
        id: String,

        #[arg(short, long)]
        reason: Option<String>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Check a configuration file without running anything
    Check { file: PathBuf },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SynthesizerKind {
    /// Gemini when GEMINI_API_KEY is set, templates otherwise
    Auto,
    Template,
    Gemini,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    toolforge_core::telemetry::init_tracing(cli.json, level);

    let result = match cli.command {
        Commands::Config {
            action: ConfigAction::Check { file },
        } => cmd_config_check(&file),
        command => {
            let config = load_config(cli.config.as_deref())?;
            dispatch(command, config).await
        }
    };
    METRICS.flush();
    result
}

async fn dispatch(command: Commands, config: AgentConfig) -> Result<()> {
    match command {
        Commands::Run {
            description,
            args,
            input,
            output,
            synthesizer,
            format,
        } => {
            let task = build_task(description, args.as_deref(), io_spec(input, output))?;
            cmd_run(config, task, synthesizer, format).await
        }
        Commands::Validate {
            file,
            input,
            output,
        } => {
            if !cmd_validate(&config, &file, &io_spec(input, output))? {
                bail!("{} failed validation", file.display());
            }
            Ok(())
        }
        Commands::Tools { action } => {
            let registry = open_registry(&config)?;
            match action {
                ToolsAction::List { all } => cmd_tools_list(&registry, all),
                ToolsAction::Search { query, limit, all } => {
                    cmd_tools_search(&registry, &query, limit, all)
                }
                ToolsAction::Show { id, source } => cmd_tools_show(&registry, &id, source),
                ToolsAction::Deprecate { id, reason } => {
                    cmd_tools_deprecate(&registry, &id, reason)
                }
            }
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => cmd_config_show(&config),
            ConfigAction::Check { file } => cmd_config_check(&file),
        },
    }
}

/// File (or defaults), then environment overrides, then validation.
fn load_config(path: Option<&Path>) -> Result<AgentConfig> {
    let mut config = match path {
        Some(path) => AgentConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => AgentConfig::default(),
    };
    config
        .apply_env(|key| std::env::var(key).ok())
        .context("Invalid TOOLFORGE_* environment override")?;
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn io_spec(input: Option<String>, output: Option<String>) -> IoSpec {
    IoSpec::new(
        input.as_deref().map(IoType::parse),
        output.as_deref().map(IoType::parse),
    )
}

fn build_task(description: String, args: Option<&str>, io: IoSpec) -> Result<TaskRequest> {
    let mut task = TaskRequest::new(description).with_io(io);
    if let Some(raw) = args {
        let value: Value =
            serde_json::from_str(raw).with_context(|| format!("--args is not JSON: {raw}"))?;
        task = task.with_args(value);
    }
    Ok(task)
}

fn open_registry(config: &AgentConfig) -> Result<Arc<ToolRegistry>> {
    let registry = ToolRegistry::from_config(config.registry.clone())
        .context("Failed to open tool registry")?;
    if config.registry.path.is_none() {
        warn!("no registry path configured; tools will not persist");
    }
    Ok(Arc::new(registry))
}

fn build_synthesizer(kind: SynthesizerKind) -> Result<Arc<dyn Synthesizer>> {
    let gemini = || -> Result<Arc<dyn Synthesizer>> {
        Ok(Arc::new(
            GeminiSynthesizer::from_env().context("Failed to configure Gemini synthesizer")?,
        ))
    };
    match kind {
        SynthesizerKind::Template => Ok(Arc::new(TemplateSynthesizer::new())),
        SynthesizerKind::Gemini => gemini(),
        SynthesizerKind::Auto => match GeminiSynthesizer::from_env() {
            Ok(synth) => Ok(Arc::new(synth)),
            Err(_) => {
                info!("GEMINI_API_KEY not set; using template synthesizer");
                Ok(Arc::new(TemplateSynthesizer::new()))
            }
        },
    }
}

async fn cmd_run(
    config: AgentConfig,
    task: TaskRequest,
    kind: SynthesizerKind,
    format: OutputFormat,
) -> Result<()> {
    let registry = open_registry(&config)?;
    let shared = SharedContext::new(&config, registry);
    let synthesizer = build_synthesizer(kind)?;
    let mut sandbox = ProcessSandbox::new(config.sandbox.interpreter.clone());
    if let Some(dir) = &config.sandbox.work_dir {
        sandbox = sandbox.with_work_dir(dir);
    }
    let orchestrator = Orchestrator::new(config, shared, synthesizer, Arc::new(sandbox));

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling request");
            on_signal.cancel();
        }
    });

    let outcome = orchestrator.handle_request_with_cancel(task, cancel).await;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&outcome)?),
        OutputFormat::Text => print!("{}", render_outcome(&outcome)),
    }

    if outcome.status == TaskStatus::Failed {
        bail!("request {} failed", outcome.request_id);
    }
    Ok(())
}

fn render_outcome(outcome: &TaskOutcome) -> String {
    let mut out = String::new();
    out.push_str(&format!("status:   {}\n", outcome.status.as_str()));
    if let Some(result) = &outcome.result {
        out.push_str(&format!("result:   {result}\n"));
    }
    if let Some(id) = &outcome.tool_id {
        let how = if outcome.reused { " (reused)" } else { "" };
        out.push_str(&format!("tool:     {id}{how}\n"));
    }
    out.push_str(&format!("attempts: {}\n", outcome.attempts));
    if !outcome.diagnostics.is_empty() {
        out.push_str("faults:\n");
        for d in &outcome.diagnostics {
            out.push_str(&format!(
                "  [attempt {}] {} {}: {}\n",
                d.attempt,
                d.phase,
                d.fault.kind(),
                d.fault
            ));
        }
    }
    if !outcome.feedback.is_empty() {
        out.push_str("feedback:\n");
        for line in &outcome.feedback {
            out.push_str(&format!("  - {line}\n"));
        }
    }
    out
}

/// Print each gate verdict. Returns whether the source is clean.
fn cmd_validate(config: &AgentConfig, file: &Path, io: &IoSpec) -> Result<bool> {
    let source = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let candidate = CandidateArtifact::new(
        source,
        Provenance {
            strategy: Strategy::Direct,
            attempt: 0,
            repair: 0,
        },
    );
    let _span = RequestSpan::enter(candidate.digest().short());
    let report = ValidationPipeline::new(config.validation_policy()).validate(&candidate, io);

    for verdict in &report.verdicts {
        match &verdict.outcome {
            GateOutcome::Pass => println!("{:<10} pass", verdict.gate.as_str()),
            GateOutcome::Fault { fault } => {
                println!("{:<10} {}: {}", verdict.gate.as_str(), fault.kind(), fault)
            }
        }
    }
    let clean = report.is_clean();
    if clean {
        if let Some(contract) = candidate.contract() {
            println!("entry point: {}", contract.entry_point);
        }
    }
    Ok(clean)
}

fn cmd_tools_list(registry: &ToolRegistry, all: bool) -> Result<()> {
    let tools = registry.list(all);
    if tools.is_empty() {
        println!("No tools registered.");
        return Ok(());
    }
    for meta in tools {
        let flag = if meta.deprecated { " [deprecated]" } else { "" };
        println!(
            "{:<32} uses={:<5} success={:.2}{}  {}",
            meta.id.to_string(),
            meta.usage_count,
            meta.success_rate,
            flag,
            meta.description
        );
    }
    Ok(())
}

fn cmd_tools_search(registry: &ToolRegistry, query: &str, limit: usize, all: bool) -> Result<()> {
    let results = registry.search(
        &SearchQuery::new(query)
            .limit(limit)
            .include_deprecated(all),
    );
    if results.is_empty() {
        println!("No matching tools.");
        return Ok(());
    }
    for hit in results.hits() {
        println!(
            "{:.3}  {:<32} {}",
            hit.score,
            hit.metadata.id.to_string(),
            hit.metadata.description
        );
    }
    Ok(())
}

fn parse_id(id: &str) -> Result<ToolId> {
    id.parse()
        .with_context(|| format!("Invalid tool id '{id}' (expected name@version)"))
}

fn cmd_tools_show(registry: &ToolRegistry, id: &str, source: bool) -> Result<()> {
    let id = parse_id(id)?;
    let record = registry.get(&id)?;
    println!("{}", serde_json::to_string_pretty(&record.metadata)?);
    if source {
        println!();
        print!("{}", record.source);
    }
    Ok(())
}

fn cmd_tools_deprecate(registry: &ToolRegistry, id: &str, reason: Option<String>) -> Result<()> {
    let id = parse_id(id)?;
    registry
        .deprecate(&id, reason)
        .with_context(|| format!("Failed to deprecate {id}"))?;
    println!("Deprecated {id}");
    Ok(())
}

fn cmd_config_show(config: &AgentConfig) -> Result<()> {
    print!("{}", config.to_toml_string()?);
    Ok(())
}

fn cmd_config_check(file: &Path) -> Result<()> {
    let config = AgentConfig::from_file(file)
        .with_context(|| format!("Failed to load config {}", file.display()))?;
    config.validate()?;
    println!("{}: ok", file.display());
    Ok(())
}
