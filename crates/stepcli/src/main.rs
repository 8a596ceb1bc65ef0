// crates/stepcli/src/main.rs

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use stepcore::{validate_step, EventBus, MemoryStateStore, Step, StepConfig, StepError};
use stepexec::{ExecutionGateway, GatewayConfig, TransportChoice};
use stepruntime::{CronSchedule, MutationOptions, RuntimeConfig, StepRegistry, StepRuntime};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "stepflow")]
#[command(about = "Step runtime host", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a step manifest and run it until idle or ctrl-c
    Run {
        /// Path to the step manifest (JSON array of step descriptors)
        #[arg(short, long)]
        steps: PathBuf,

        /// Optional JSON config file with `runtime` and `gateway` sections
        #[arg(short, long, env = "STEPFLOW_CONFIG")]
        config: Option<PathBuf>,

        /// Directory holding the language runners
        #[arg(long, env = "STEPFLOW_RUNNER_DIR")]
        runner_dir: Option<PathBuf>,

        /// Deadline for every step invocation, in milliseconds
        #[arg(long, env = "STEPFLOW_DEADLINE_MS")]
        deadline_ms: Option<u64>,

        /// Talk to workers over stdin/stdout instead of the fd 3 channel
        #[arg(long)]
        stdio: bool,

        /// Topic to emit once the steps are bound
        #[arg(short, long)]
        emit: Option<String>,

        /// Event data as JSON string
        #[arg(short, long)]
        data: Option<String>,

        /// Exit once every triggered step has finished
        #[arg(long)]
        once: bool,

        /// Show verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Validate a step manifest
    Validate {
        /// Path to the step manifest
        steps: PathBuf,
    },

    /// List the flows defined by a step manifest
    Flows {
        /// Path to the step manifest
        steps: PathBuf,
    },
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct HostConfig {
    runtime: RuntimeConfig,
    gateway: GatewayConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            steps,
            config,
            runner_dir,
            deadline_ms,
            stdio,
            emit,
            data,
            once,
            verbose,
        } => {
            init_tracing(verbose);

            let mut host = load_config(config.as_deref())?;
            if let Some(dir) = runner_dir {
                host.gateway.runner_dir = dir;
            }
            if deadline_ms.is_some() {
                host.runtime.default_deadline_ms = deadline_ms;
            }
            if stdio {
                host.gateway.transport = TransportChoice::Stdio;
            }

            let data = match data {
                Some(raw) => serde_json::from_str(&raw).context("--data must be valid JSON")?,
                None => Value::Object(Default::default()),
            };

            run_steps(&steps, host, emit, data, once).await?;
        }

        Commands::Validate { steps } => {
            init_tracing(false);
            validate_manifest(&steps)?;
        }

        Commands::Flows { steps } => {
            init_tracing(false);
            list_flows(&steps)?;
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .init();
}

fn load_config(path: Option<&Path>) -> Result<HostConfig> {
    let Some(path) = path else {
        return Ok(HostConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
}

/// Decode every descriptor of a manifest, keeping the decode failures apart.
fn load_manifest(path: &Path) -> Result<(Vec<Step>, Vec<(usize, StepError)>)> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading manifest {}", path.display()))?;
    let descriptors: Vec<Value> =
        serde_json::from_str(&raw).with_context(|| format!("{} must hold a JSON array", path.display()))?;

    let mut steps = Vec::new();
    let mut failures = Vec::new();
    for (index, descriptor) in descriptors.into_iter().enumerate() {
        match Step::from_value(descriptor) {
            Ok(step) => steps.push(step),
            Err(e) => failures.push((index, e)),
        }
    }
    Ok((steps, failures))
}

async fn run_steps(path: &Path, host: HostConfig, emit: Option<String>, data: Value, once: bool) -> Result<()> {
    println!("🚀 Loading steps from: {}", path.display());

    let (steps, failures) = load_manifest(path)?;
    for (index, e) in &failures {
        println!("  ❌ Descriptor #{} skipped: {}", index, e);
    }

    let bus = Arc::new(EventBus::new());
    let state = Arc::new(MemoryStateStore::new());
    let gateway = Arc::new(ExecutionGateway::new(bus.clone(), state, host.gateway));
    let runtime = StepRuntime::new(bus, gateway.clone(), host.runtime);

    let rejected = runtime.load_steps(steps);
    for e in &rejected {
        println!("  ❌ {}", e);
    }

    runtime.with_registry(|registry| {
        println!(
            "📋 Steps: {} ({} event, {} cron, {} api, {} dev)",
            registry.len(),
            registry.event_steps().len(),
            registry.cron_steps().len(),
            registry.api_steps().len(),
            registry.dev_steps().len()
        );
        println!("   Flows: {}", registry.flows().count());
    });
    println!();

    if let Some(topic) = emit {
        let trace_id = runtime.emit(topic.clone(), data, None);
        println!("▶️  Emitted {} (trace {})", topic, trace_id);
    }

    if once {
        runtime.wait_idle().await;
    } else {
        println!("⏳ Running, press ctrl-c to stop");
        tokio::signal::ctrl_c().await?;
        println!();
        println!("🛑 Stopping ({} workers still running)", gateway.arena().active_count());
    }

    runtime.shutdown().await;
    println!("✨ Done");

    Ok(())
}

fn validate_manifest(path: &Path) -> Result<()> {
    println!("🔍 Validating steps: {}", path.display());

    let (steps, failures) = load_manifest(path)?;
    let mut invalid = failures.len();
    for (index, e) in &failures {
        println!("  ❌ Descriptor #{}: {}", index, e);
    }

    for step in &steps {
        let mut problems = Vec::new();
        if let Err(e) = validate_step(step) {
            problems.extend(e.errors.iter().map(|f| f.to_string()));
        }
        if let StepConfig::Cron(config) = &step.config {
            if let Err(e) = CronSchedule::parse(&config.cron) {
                problems.push(e.to_string());
            }
        }

        if problems.is_empty() {
            println!("  ✅ {} ({})", step.name(), step.file_path);
        } else {
            invalid += 1;
            println!("  ❌ {} ({})", step.name(), step.file_path);
            for problem in problems {
                println!("     {}", problem);
            }
        }
    }

    if invalid > 0 {
        anyhow::bail!("{} of {} descriptors are invalid", invalid, steps.len() + failures.len());
    }
    println!("✅ All {} steps are valid", steps.len());
    Ok(())
}

fn list_flows(path: &Path) -> Result<()> {
    let (steps, _) = load_manifest(path)?;

    let mut registry = StepRegistry::new();
    for step in steps {
        // Invalid steps are reported by `validate`.
        let _ = registry.create_step(step, MutationOptions { quiet: true });
    }

    println!("📦 Flows:");
    println!();
    for flow in registry.flows() {
        println!("  • {}", flow.name);
        for step in registry.flow_steps(&flow.name) {
            println!("    {} [{:?}] {}", step.name(), step.config.kind(), step.file_path);
        }
    }
    Ok(())
}
